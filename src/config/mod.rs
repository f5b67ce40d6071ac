//! Configuration management for SettleBasis
//!
//! Loads from optional config files + environment variables via .env

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::types::Commodity;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub scraper: ScraperConfig,
    pub spot: SpotConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScraperConfig {
    /// Run the browser without a window
    pub headless: bool,
    /// Minimum delay between two page sessions against the exchange
    pub rate_limit_secs: f64,
    /// WebDriver endpoint (chromedriver)
    pub webdriver_url: String,
    /// Explicit Chrome/Chromium binary
    pub chrome_bin: Option<String>,
    /// Explicit chromedriver binary; spawned on the `webdriver_url` port when set
    pub chromedriver_path: Option<String>,
    pub user_agent: String,
    /// WTI settlements page
    pub wti_url: String,
    /// Henry Hub settlements page
    pub hh_url: String,
    /// Wait after the initial page load, in milliseconds
    pub page_load_wait_ms: u64,
    /// Wait after a tab or date click, in milliseconds
    pub step_wait_ms: u64,
    /// Wait for the table to expand after "load all", in milliseconds
    pub expand_wait_ms: u64,
}

impl ScraperConfig {
    pub fn url_for(&self, commodity: Commodity) -> &str {
        match commodity {
            Commodity::WTI => &self.wti_url,
            Commodity::HH => &self.hh_url,
        }
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_secs_f64(self.rate_limit_secs.max(0.0))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpotConfig {
    /// EIA WTI spot history page
    pub wti_url: String,
    /// EIA Henry Hub spot history page
    pub hh_url: String,
    /// Source tag stored with every spot record
    pub source: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub rate_limit_secs: f64,
}

impl SpotConfig {
    pub fn url_for(&self, commodity: Commodity) -> &str {
        match commodity {
            Commodity::WTI => &self.wti_url,
            Commodity::HH => &self.hh_url,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory holding the CSV tables
    pub data_dir: String,
}

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::builder()?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (SETTLEBASIS_*)
            .add_source(Environment::with_prefix("SETTLEBASIS").separator("__"))
            // Variables understood by the deployment images
            .set_override_option("scraper.chrome_bin", std::env::var("CHROME_BIN").ok())?
            .set_override_option(
                "scraper.chromedriver_path",
                std::env::var("CHROMEDRIVER_PATH").ok(),
            )?
            .set_override_option(
                "scraper.rate_limit_secs",
                std::env::var("SCRAPE_RATE_LIMIT_SECONDS").ok(),
            )?
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Defaults only, no files or environment. Used by tests and as the base layer.
    pub fn defaults() -> Result<Self> {
        Self::builder()?
            .build()
            .context("Failed to build default configuration")?
            .try_deserialize()
            .context("Failed to deserialize default configuration")
    }

    fn builder() -> Result<config::builder::ConfigBuilder<config::builder::DefaultState>> {
        let builder = Config::builder()
            // Scraper defaults
            .set_default("scraper.headless", true)?
            .set_default("scraper.rate_limit_secs", 2.0)?
            .set_default("scraper.webdriver_url", "http://localhost:9515")?
            .set_default("scraper.user_agent", DEFAULT_USER_AGENT)?
            .set_default(
                "scraper.wti_url",
                "https://www.cmegroup.com/markets/energy/crude-oil/light-sweet-crude.settlements.html",
            )?
            .set_default(
                "scraper.hh_url",
                "https://www.cmegroup.com/markets/energy/natural-gas/natural-gas.settlements.html",
            )?
            .set_default("scraper.page_load_wait_ms", 5000)?
            .set_default("scraper.step_wait_ms", 1000)?
            .set_default("scraper.expand_wait_ms", 5000)?
            // Spot defaults
            .set_default(
                "spot.wti_url",
                "https://www.eia.gov/dnav/pet/hist/LeafHandler.ashx?n=PET&s=RWTC&f=M",
            )?
            .set_default("spot.hh_url", "https://www.eia.gov/dnav/ng/hist/rngwhhdm.htm")?
            .set_default("spot.source", "EIA")?
            .set_default("spot.user_agent", DEFAULT_USER_AGENT)?
            .set_default("spot.timeout_secs", 30)?
            .set_default("spot.rate_limit_secs", 2.0)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?;
        Ok(builder)
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "headless={} rate_limit={:.1}s webdriver={} chrome_bin={} data_dir={}",
            self.scraper.headless,
            self.scraper.rate_limit_secs,
            self.scraper.webdriver_url,
            self.scraper.chrome_bin.as_deref().unwrap_or("auto"),
            self.persistence.data_dir
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_section() {
        let config = AppConfig::defaults().unwrap();
        assert!(config.scraper.headless);
        assert_eq!(config.scraper.rate_limit(), Duration::from_secs(2));
        assert!(config.scraper.chrome_bin.is_none());
        assert!(config.scraper.url_for(Commodity::HH).contains("natural-gas"));
        assert_eq!(config.spot.source, "EIA");
        assert_eq!(config.persistence.data_dir, "./data");
    }

    #[test]
    fn digest_has_no_urls_of_pages() {
        let config = AppConfig::defaults().unwrap();
        let digest = config.digest();
        assert!(digest.contains("headless=true"));
        assert!(digest.contains("chrome_bin=auto"));
        assert!(!digest.contains("cmegroup"));
    }
}
