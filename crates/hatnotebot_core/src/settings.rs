use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::{BotConfigFile, DEFAULT_CONFIG_FILENAME, load_config};
use crate::mediawiki::MediaWikiClientConfig;

pub const DEFAULT_API_URL: &str = "https://test.wikipedia.org/w/api.php";
pub const DEFAULT_USER_AGENT: &str = concat!("hatnotebot/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_MAX_ARTICLES: usize = 15;
pub const DEFAULT_ARTICLE_CATEGORY: &str =
    "Category:Articles with hatnote templates targeting a nonexistent page";
pub const DEFAULT_TEMPLATE_CATEGORY: &str = "Category:Hatnote templates";
pub const DEFAULT_EDIT_SUMMARY: &str =
    "Bot - Removing redlinked hatnote template ([[en:WP:HNR|read more!]])";

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RATE_LIMIT_READ_MS: u64 = 300;
const DEFAULT_RATE_LIMIT_WRITE_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Default => "default",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Values supplied on the command line. They win over everything else.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub config_path: Option<PathBuf>,
    pub dry_run: Option<bool>,
    pub max_articles: Option<usize>,
    pub show_diff: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingSources {
    pub config: ValueSource,
    pub api_url: ValueSource,
    pub max_articles: ValueSource,
    pub dry_run: ValueSource,
}

#[derive(Debug, Clone)]
pub struct BotSettings {
    pub client: MediaWikiClientConfig,
    pub credentials: Option<Credentials>,
    pub max_articles: usize,
    pub dry_run: bool,
    pub show_diff: bool,
    pub article_category: String,
    pub template_category: String,
    pub edit_summary: String,
    pub config_path: Option<PathBuf>,
    pub sources: SettingSources,
}

impl BotSettings {
    pub fn from_process(overrides: &SettingsOverrides) -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Self::resolve(|key| env::var(key).ok(), &cwd, overrides)
    }

    /// Resolve settings with precedence flag > env > config file > default.
    /// `lookup` reads one environment variable; blank values count as unset.
    pub fn resolve<F>(lookup: F, cwd: &Path, overrides: &SettingsOverrides) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_value = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let (config_path, config_source) = resolve_config_path(&env_value, cwd, overrides)?;
        let file = match &config_path {
            Some(path) => load_config(path)?,
            None => BotConfigFile::default(),
        };

        let (api_url, api_url_source) = layered(
            None,
            env_value("WIKI_API_URL"),
            file.wiki.api_url.clone(),
            DEFAULT_API_URL.to_string(),
        );
        let (user_agent, _) = layered(
            None,
            env_value("WIKI_USER_AGENT"),
            file.wiki.user_agent.clone(),
            DEFAULT_USER_AGENT.to_string(),
        );
        let env_max_articles = env_value("MAX_ARTICLES")
            .map(|raw| parse_count("MAX_ARTICLES", &raw))
            .transpose()?;
        let (max_articles, max_articles_source) = layered(
            overrides.max_articles,
            env_max_articles,
            file.bot.max_articles,
            DEFAULT_MAX_ARTICLES,
        );
        let (dry_run, dry_run_source) = layered(
            overrides.dry_run,
            env_value("DRY_RUN").map(|raw| parse_bool_flag(&raw)),
            file.bot.dry_run,
            true,
        );
        let (article_category, _) = layered(
            None,
            env_value("ARTICLE_CATEGORY"),
            file.bot.article_category.clone(),
            DEFAULT_ARTICLE_CATEGORY.to_string(),
        );
        let (template_category, _) = layered(
            None,
            env_value("HATNOTE_TEMPLATE_CATEGORY"),
            file.bot.template_category.clone(),
            DEFAULT_TEMPLATE_CATEGORY.to_string(),
        );
        let (edit_summary, _) = layered(
            None,
            env_value("EDIT_SUMMARY"),
            file.bot.edit_summary.clone(),
            DEFAULT_EDIT_SUMMARY.to_string(),
        );

        let credentials = match (
            env_value("BOT_USER"),
            lookup("BOT_PASSWORD").filter(|value| !value.trim().is_empty()),
        ) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            _ => None,
        };

        Ok(Self {
            client: MediaWikiClientConfig {
                api_url,
                user_agent,
                timeout_ms: env_u64(&env_value, "WIKI_HTTP_TIMEOUT_MS", DEFAULT_TIMEOUT_MS),
                rate_limit_read_ms: env_u64(
                    &env_value,
                    "WIKI_RATE_LIMIT_READ",
                    DEFAULT_RATE_LIMIT_READ_MS,
                ),
                rate_limit_write_ms: env_u64(
                    &env_value,
                    "WIKI_RATE_LIMIT_WRITE",
                    DEFAULT_RATE_LIMIT_WRITE_MS,
                ),
            },
            credentials,
            max_articles,
            dry_run,
            show_diff: overrides.show_diff,
            article_category,
            template_category,
            edit_summary,
            config_path,
            sources: SettingSources {
                config: config_source,
                api_url: api_url_source,
                max_articles: max_articles_source,
                dry_run: dry_run_source,
            },
        })
    }

    pub fn require_credentials(&self) -> Result<&Credentials> {
        match &self.credentials {
            Some(credentials) => Ok(credentials),
            None => bail!("BOT_USER and BOT_PASSWORD must be set as environment variables"),
        }
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "api_url={} ({})\nuser_agent={}\nconfig_path={} ({})\nmax_articles={} ({})\ndry_run={} ({})\narticle_category={}\ntemplate_category={}\ntimeout_ms={}\nrate_limit_read_ms={}\nrate_limit_write_ms={}\ncredentials={}",
            self.client.api_url,
            self.sources.api_url.as_str(),
            self.client.user_agent,
            self.config_path
                .as_deref()
                .map(normalize_path)
                .unwrap_or_else(|| "<none>".to_string()),
            self.sources.config.as_str(),
            self.max_articles,
            self.sources.max_articles.as_str(),
            self.dry_run,
            self.sources.dry_run.as_str(),
            self.article_category,
            self.template_category,
            self.client.timeout_ms,
            self.client.rate_limit_read_ms,
            self.client.rate_limit_write_ms,
            match &self.credentials {
                Some(credentials) => format!("set (user {})", credentials.username),
                None => "missing".to_string(),
            }
        )
    }
}

/// `true`, `1` and `yes` (any case) are true; everything else is false.
pub fn parse_bool_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}

fn resolve_config_path<F>(
    env_value: &F,
    cwd: &Path,
    overrides: &SettingsOverrides,
) -> Result<(Option<PathBuf>, ValueSource)>
where
    F: Fn(&str) -> Option<String>,
{
    let explicit = match &overrides.config_path {
        Some(path) => Some((path.clone(), ValueSource::Flag)),
        None => env_value("HATNOTEBOT_CONFIG").map(|path| (PathBuf::from(path), ValueSource::Env)),
    };

    if let Some((path, source)) = explicit {
        let absolute = if path.is_absolute() {
            path
        } else {
            cwd.join(path)
        };
        if !absolute.exists() {
            bail!("config file not found: {}", normalize_path(&absolute));
        }
        return Ok((Some(absolute), source));
    }

    let default_path = cwd.join(DEFAULT_CONFIG_FILENAME);
    if default_path.exists() {
        return Ok((Some(default_path), ValueSource::Default));
    }
    Ok((None, ValueSource::Default))
}

fn layered<T>(flag: Option<T>, env: Option<T>, config: Option<T>, default: T) -> (T, ValueSource) {
    if let Some(value) = flag {
        return (value, ValueSource::Flag);
    }
    if let Some(value) = env {
        return (value, ValueSource::Env);
    }
    if let Some(value) = config {
        return (value, ValueSource::Config);
    }
    (default, ValueSource::Default)
}

fn parse_count(key: &str, raw: &str) -> Result<usize> {
    raw.parse::<usize>()
        .with_context(|| format!("{key} must be a non-negative integer, got {raw:?}"))
}

fn env_u64<F>(env_value: &F, key: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    env_value(key)
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
