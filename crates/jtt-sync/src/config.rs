use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use jtt_portal::{OpenAiConfig, StrategyKind, TargetSpec};
use jtt_storage::{AirtableConfig, HttpClientConfig, DEFAULT_USER_AGENT};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub config_path: PathBuf,
    pub output_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub airtable_api_key: Option<String>,
    pub airtable_base_key: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub entity_delay: Duration,
    pub sink_delay: Duration,
    pub page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset and blank keys take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| {
            var(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        Self {
            config_path: var("JTT_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("targets.yaml")),
            output_dir: var("JTT_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./runs")),
            reports_dir: var("JTT_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            openai_api_key: var("JTT_OPENAI_API_KEY"),
            openai_base_url: var("JTT_OPENAI_BASE_URL")
                .unwrap_or_else(|| OpenAiConfig::DEFAULT_BASE_URL.to_string()),
            openai_model: var("JTT_OPENAI_MODEL")
                .unwrap_or_else(|| OpenAiConfig::DEFAULT_MODEL.to_string()),
            airtable_api_key: var("JTT_AIRTABLE_API_KEY"),
            airtable_base_key: var("JTT_AIRTABLE_BASE_KEY"),
            http_timeout_secs: number("JTT_HTTP_TIMEOUT_SECS", 20),
            user_agent: var("JTT_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            entity_delay: Duration::from_millis(number("JTT_ENTITY_DELAY_MS", 1000)),
            sink_delay: Duration::from_millis(number("JTT_SINK_DELAY_MS", 200)),
            page_size: number("JTT_PAGE_SIZE", TargetSpec::DEFAULT_PAGE_SIZE as u64) as usize,
        }
    }

    /// Checks what the selected targets need; loading never fails on missing credentials.
    pub fn validate(&self, targets: &[TargetConfig]) -> Result<()> {
        if self.page_size == 0 {
            bail!("JTT_PAGE_SIZE must be at least 1");
        }
        if self.http_timeout_secs == 0 {
            bail!("JTT_HTTP_TIMEOUT_SECS must be at least 1");
        }
        let challenge_targets: Vec<&str> = targets
            .iter()
            .filter(|t| t.strategy == StrategyKind::Challenge)
            .map(|t| t.name.as_str())
            .collect();
        if self.openai_api_key.is_none() && !challenge_targets.is_empty() {
            bail!(
                "JTT_OPENAI_API_KEY is required for challenge-protected targets: {}",
                challenge_targets.join(", ")
            );
        }
        Ok(())
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn openai_config(&self) -> OpenAiConfig {
        OpenAiConfig {
            api_key: self.openai_api_key.clone().unwrap_or_default(),
            base_url: self.openai_base_url.clone(),
            model: self.openai_model.clone(),
        }
    }

    /// `None` when either Airtable credential is missing.
    pub fn airtable_config(&self) -> Option<AirtableConfig> {
        match (&self.airtable_api_key, &self.airtable_base_key) {
            (Some(api_key), Some(base_key)) => Some(AirtableConfig::new(api_key, base_key)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Portal slug used in every API path.
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default = "default_usable")]
    pub usable: bool,
}

fn default_usable() -> bool {
    true
}

impl TargetConfig {
    pub fn spec(&self, page_size: usize) -> TargetSpec {
        let spec = TargetSpec::new(self.name.clone(), self.strategy).with_page_size(page_size);
        match &self.base_url {
            Some(base_url) if !base_url.trim().is_empty() => spec.with_base_url(base_url.trim()),
            _ => spec,
        }
    }

    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            &self.name
        } else {
            &self.title
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRegistry {
    pub targets: Vec<TargetConfig>,
}

impl TargetRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        let mut seen = std::collections::BTreeSet::new();
        for target in &registry.targets {
            if target.name.trim().is_empty() {
                bail!("target with empty name");
            }
            if !seen.insert(target.name.as_str()) {
                bail!("target {} listed twice", target.name);
            }
        }
        Ok(registry)
    }

    /// Usable targets in registry order, optionally narrowed to `only`.
    pub fn select(&self, only: &[String]) -> Vec<TargetConfig> {
        for name in only {
            if !self.targets.iter().any(|t| &t.name == name) {
                warn!(jail = %name, "requested target is not in the registry");
            }
        }
        self.targets
            .iter()
            .filter(|t| only.is_empty() || only.contains(&t.name))
            .filter(|t| {
                if !t.usable {
                    info!(jail = %t.name, "target marked unusable; skipping");
                }
                t.usable
            })
            .cloned()
            .collect()
    }
}
