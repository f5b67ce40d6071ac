//! SettleBasis command line
//!
//! Usage: cargo run --bin settlebasis -- <command>
//!
//! Thin wrappers around the library entry points; every command prints its
//! result as JSON on stdout and logs to stderr.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use settlebasis::cme::CmeScraper;
use settlebasis::config::AppConfig;
use settlebasis::persistence::Repository;
use settlebasis::pipeline::{refresh_spot, Pipeline};
use settlebasis::reconcile::{ReconcileFilters, Reconciler};
use settlebasis::spot::EiaClient;
use settlebasis::types::Commodity;

#[derive(Parser)]
#[command(name = "settlebasis", version, about = "CME settlement scraper and basis reconciler")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scrape and store every commodity, skipping dates already stored
    Daily {
        /// Trade date (YYYY-MM-DD); defaults to the page's current date
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Store even when the date is already present
        #[arg(long)]
        overwrite: bool,
    },
    /// Scrape one commodity and print the records without storing them
    Scrape {
        commodity: String,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// List the trade dates the exchange offers
    Dates { commodity: String },
    /// Fetch and store EIA spot prices
    Spot {
        /// Limit to one commodity
        commodity: Option<String>,
    },
    /// Compute basis errors for stored settlements
    Reconcile {
        #[arg(long)]
        commodity: Option<String>,
        #[arg(long)]
        start: Option<NaiveDate>,
        #[arg(long)]
        end: Option<NaiveDate>,
    },
    /// Error statistics over stored basis errors
    Stats {
        #[arg(long)]
        commodity: Option<String>,
        #[arg(long)]
        contract_month: Option<String>,
    },
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn parse_commodity(raw: &str) -> Result<Commodity> {
    match Commodity::from_str(raw) {
        Some(c) => Ok(c),
        None => bail!("Unknown commodity {raw:?} (expected WTI or HH)"),
    }
}

fn commodity_list(raw: Option<&str>) -> Result<Vec<Commodity>> {
    match raw {
        Some(r) => Ok(vec![parse_commodity(r)?]),
        None => Ok(Commodity::ALL.to_vec()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let mut config = AppConfig::load()?;
    if let Some(dir) = cli.data_dir {
        config.persistence.data_dir = dir;
    }
    info!(config = %config.digest(), "Configuration loaded");

    match cli.command {
        Command::Daily { date, overwrite } => {
            let repo = Repository::open(&config.persistence.data_dir)?;
            let scraper = CmeScraper::new(config.scraper);
            let report = Pipeline::new(&scraper, &repo)
                .overwrite(overwrite)
                .daily(&Commodity::ALL, date)
                .await;
            print_json(&report)?;
            if !report.success() {
                bail!("Daily run finished with errors");
            }
        }
        Command::Scrape { commodity, date } => {
            let commodity = parse_commodity(&commodity)?;
            let scraper = CmeScraper::new(config.scraper);
            let records = scraper.scrape_commodity_on(commodity, date).await?;
            print_json(&records)?;
        }
        Command::Dates { commodity } => {
            let commodity = parse_commodity(&commodity)?;
            let scraper = CmeScraper::new(config.scraper);
            print_json(&scraper.discover_dates(commodity).await)?;
        }
        Command::Spot { commodity } => {
            let commodities = commodity_list(commodity.as_deref())?;
            let repo = Repository::open(&config.persistence.data_dir)?;
            let client = EiaClient::new(config.spot)?;
            let reports = refresh_spot(&client, &repo, &commodities).await;
            print_json(&reports)?;
        }
        Command::Reconcile {
            commodity,
            start,
            end,
        } => {
            let repo = Repository::open(&config.persistence.data_dir)?;
            let filters = ReconcileFilters {
                commodity: commodity.as_deref().map(parse_commodity).transpose()?,
                start,
                end,
            };
            let summary = Reconciler::new(&repo).reconcile(filters)?;
            print_json(&summary)?;
        }
        Command::Stats {
            commodity,
            contract_month,
        } => {
            let repo = Repository::open(&config.persistence.data_dir)?;
            let commodity = commodity.as_deref().map(parse_commodity).transpose()?;
            let stats = Reconciler::new(&repo).statistics(commodity, contract_month.as_deref())?;
            print_json(&stats)?;
        }
    }

    Ok(())
}
