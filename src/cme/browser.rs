//! Browser session used to render the settlements page.
//!
//! Everything that reads the page works on an HTML snapshot (`source`); the
//! session is only asked to navigate and to act on elements addressed by a
//! [`Target`] found in that snapshot.

use async_trait::async_trait;
use fantoccini::elements::Element;
use fantoccini::{Client, ClientBuilder, Locator};
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::ScraperConfig;
use crate::error::BrowserError;

const CONNECT_ATTEMPTS: usize = 10;
const CONNECT_RETRY: Duration = Duration::from_millis(500);

/// The `index`-th element (document order) matching `css`.
///
/// Snapshots and the live DOM enumerate matches in the same order, so a target
/// computed from a snapshot addresses the same live element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub css: String,
    pub index: usize,
}

impl Target {
    pub fn new(css: &str, index: usize) -> Self {
        Self {
            css: css.to_string(),
            index,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.css, self.index)
    }
}

/// Browser automation session, exclusively owned by one scrape session
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Browser: Send {
    /// Navigate to a URL
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError>;

    /// Serialized current DOM
    async fn source(&mut self) -> Result<String, BrowserError>;

    /// Click an element, falling back to a script click when the native one fails
    async fn click(&mut self, target: &Target) -> Result<(), BrowserError>;

    /// Choose an `<option>` of a `<select>` by its visible label
    async fn select_option(&mut self, target: &Target, label: &str) -> Result<(), BrowserError>;

    /// End the session and release its resources
    async fn close(&mut self) -> Result<(), BrowserError>;
}

/// Chrome driven over the WebDriver protocol
pub struct WebDriverBrowser {
    client: Option<Client>,
    /// chromedriver we spawned ourselves (killed on close or drop)
    driver_process: Option<Child>,
}

impl WebDriverBrowser {
    /// Start a session, spawning chromedriver first when a path is configured.
    pub async fn launch(config: &ScraperConfig) -> Result<Self, BrowserError> {
        let mut driver_process = None;
        if let Some(path) = &config.chromedriver_path {
            let port = webdriver_port(&config.webdriver_url)?;
            info!(path = %path, port, "Spawning chromedriver");
            let child = Command::new(path)
                .arg(format!("--port={port}"))
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    BrowserError::Session(format!("failed to spawn chromedriver at {path}: {e}"))
                })?;
            driver_process = Some(child);
        }

        let capabilities = chrome_capabilities(config);
        let mut last_error = String::new();
        for attempt in 1..=CONNECT_ATTEMPTS {
            let mut builder = ClientBuilder::native();
            builder.capabilities(capabilities.clone());
            match builder.connect(&config.webdriver_url).await {
                Ok(client) => {
                    info!(
                        webdriver = %config.webdriver_url,
                        headless = config.headless,
                        "Browser session started"
                    );
                    return Ok(Self {
                        client: Some(client),
                        driver_process,
                    });
                }
                Err(e) => {
                    debug!(attempt, error = %e, "WebDriver not ready");
                    last_error = e.to_string();
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
            }
        }

        Err(BrowserError::Session(format!(
            "could not connect to {}: {last_error}",
            config.webdriver_url
        )))
    }

    fn client(&self) -> Result<&Client, BrowserError> {
        self.client
            .as_ref()
            .ok_or_else(|| BrowserError::Session("session already closed".to_string()))
    }

    async fn element(&self, target: &Target) -> Result<Element, BrowserError> {
        let mut found = self
            .client()?
            .find_all(Locator::Css(&target.css))
            .await
            .map_err(command_error)?;
        if target.index < found.len() {
            Ok(found.swap_remove(target.index))
        } else {
            Err(BrowserError::NoSuchElement {
                css: target.css.clone(),
                index: target.index,
            })
        }
    }
}

#[async_trait]
impl Browser for WebDriverBrowser {
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError> {
        debug!(url, "Loading page");
        self.client()?.goto(url).await.map_err(command_error)
    }

    async fn source(&mut self) -> Result<String, BrowserError> {
        self.client()?.source().await.map_err(command_error)
    }

    async fn click(&mut self, target: &Target) -> Result<(), BrowserError> {
        let element = self.element(target).await?;
        let client = self.client()?;
        let handle = serde_json::to_value(&element)
            .map_err(|e| BrowserError::Command(format!("cannot pass element to script: {e}")))?;

        if let Err(e) = client
            .execute(
                "arguments[0].scrollIntoView({block: 'center'});",
                vec![handle.clone()],
            )
            .await
        {
            debug!(element = %target, error = %e, "Scroll into view failed");
        }

        match element.click().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(element = %target, error = %e, "Native click failed, trying script click");
                client
                    .execute("arguments[0].click();", vec![handle])
                    .await
                    .map(|_| ())
                    .map_err(command_error)
            }
        }
    }

    async fn select_option(&mut self, target: &Target, label: &str) -> Result<(), BrowserError> {
        let element = self.element(target).await?;
        element.select_by_label(label).await.map_err(command_error)
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        let mut result = Ok(());
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close().await {
                result = Err(command_error(e));
            }
        }
        if let Some(mut child) = self.driver_process.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to stop chromedriver");
            }
        }
        debug!("Browser session closed");
        result
    }
}

fn command_error(e: fantoccini::error::CmdError) -> BrowserError {
    BrowserError::Command(e.to_string())
}

fn webdriver_port(url: &str) -> Result<u16, BrowserError> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.port_or_known_default())
        .ok_or_else(|| BrowserError::Session(format!("webdriver_url {url} has no usable port")))
}

/// `goog:chromeOptions` for a scraping session.
pub fn chrome_capabilities(config: &ScraperConfig) -> Map<String, Value> {
    let mut args = vec![
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        format!("--user-agent={}", config.user_agent),
    ];
    if config.headless {
        args.push("--headless=new".to_string());
    }

    let mut chrome = json!({
        "args": args,
        "excludeSwitches": ["enable-automation"],
    });
    if let Some(bin) = &config.chrome_bin {
        chrome["binary"] = json!(bin);
    }

    let mut capabilities = Map::new();
    capabilities.insert("goog:chromeOptions".to_string(), chrome);
    capabilities
}
