// src/config/mod.rs
pub mod ai;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use ai::AiConfig;

pub const ENV_CONFIG_PATH: &str = "NEWS_PIPELINE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedConfig {
    /// Label stamped on every entry of this feed, e.g. "Business".
    pub category: String,
    pub url: String,
}

fn bbc(category: &str, path: &str) -> FeedConfig {
    FeedConfig {
        category: category.to_string(),
        url: format!("http://feeds.bbci.co.uk/news/{path}/rss.xml"),
    }
}

fn default_feeds() -> Vec<FeedConfig> {
    vec![
        bbc("Business", "business"),
        bbc("Health", "health"),
        bbc("Politics", "politics"),
        bbc("Science", "science_and_environment"),
        bbc("Technology", "technology"),
    ]
}
fn default_state_file() -> PathBuf {
    PathBuf::from("rss_state.json")
}
fn default_store_root() -> PathBuf {
    PathBuf::from("/tmp/bbc_news")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "FetchConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "FetchConfig::default_user_agent")]
    pub user_agent: String,
}

impl FetchConfig {
    fn default_timeout_secs() -> u64 {
        20
    }
    fn default_user_agent() -> String {
        concat!("news-insights/", env!("CARGO_PKG_VERSION")).to_string()
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Self::default_timeout_secs(),
            user_agent: Self::default_user_agent(),
        }
    }
}

/// Worker pool and retry knobs for the AI calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default = "ExtractionConfig::default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "ExtractionConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "ExtractionConfig::default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "ExtractionConfig::default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "ExtractionConfig::default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl ExtractionConfig {
    fn default_max_in_flight() -> usize {
        4
    }
    fn default_max_attempts() -> u32 {
        4
    }
    fn default_base_delay_ms() -> u64 {
        500
    }
    fn default_max_delay_ms() -> u64 {
        8_000
    }
    fn default_call_timeout_secs() -> u64 {
        30
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: Self::default_max_in_flight(),
            max_attempts: Self::default_max_attempts(),
            base_delay_ms: Self::default_base_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
            call_timeout_secs: Self::default_call_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,
    /// Prometheus textfile written at the end of each run, if set.
    #[serde(default)]
    pub metrics_textfile: Option<PathBuf>,
    #[serde(default = "default_feeds")]
    pub feeds: Vec<FeedConfig>,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            store_root: default_store_root(),
            metrics_textfile: None,
            feeds: default_feeds(),
            fetch: FetchConfig::default(),
            ai: AiConfig::default(),
            extraction: ExtractionConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: PipelineConfig = toml::from_str(s).context("parsing pipeline config")?;
        cfg.sanitize()?;
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Load config using an explicit path, then env var + fallbacks:
    /// 1) `explicit`
    /// 2) $NEWS_PIPELINE_CONFIG
    /// 3) config/pipeline.toml
    /// 4) built-in defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_from(p);
        }
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default_p.exists() {
            return Self::load_from(&default_p);
        }
        let mut cfg = Self::default();
        cfg.sanitize()?;
        Ok(cfg)
    }

    fn sanitize(&mut self) -> Result<()> {
        self.feeds.retain(|f| !f.url.trim().is_empty());
        if self.feeds.is_empty() {
            return Err(anyhow!("no feeds configured"));
        }
        for f in &mut self.feeds {
            f.category = f.category.trim().to_string();
            f.url = f.url.trim().to_string();
        }

        let ex = &mut self.extraction;
        ex.max_in_flight = ex.max_in_flight.max(1);
        ex.max_attempts = ex.max_attempts.max(1);
        ex.call_timeout_secs = ex.call_timeout_secs.max(1);
        if ex.base_delay_ms > ex.max_delay_ms {
            // swap to keep a valid interval
            std::mem::swap(&mut ex.base_delay_ms, &mut ex.max_delay_ms);
        }
        if self.fetch.timeout_secs == 0 {
            self.fetch.timeout_secs = FetchConfig::default_timeout_secs();
        }

        self.ai.resolve()
    }
}
