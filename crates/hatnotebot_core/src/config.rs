use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILENAME: &str = "hatnotebot.toml";

/// On-disk configuration. Every key is optional; environment variables and
/// CLI flags take precedence over anything set here. Credentials are never
/// read from this file.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct BotConfigFile {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub bot: BotSection,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct BotSection {
    pub max_articles: Option<usize>,
    pub dry_run: Option<bool>,
    pub article_category: Option<String>,
    pub template_category: Option<String>,
    pub edit_summary: Option<String>,
}

/// Load and parse a config file. Returns the default config if it doesn't exist.
pub fn load_config(config_path: &Path) -> Result<BotConfigFile> {
    if !config_path.exists() {
        return Ok(BotConfigFile::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: BotConfigFile = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}
