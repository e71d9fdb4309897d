use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Seconds a writer waits for the database lock.
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Key for verification token signatures.
    pub secret: String,
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,
    #[serde(default = "default_verification_ttl_hours")]
    pub verification_ttl_hours: i64,
    #[serde(default = "default_reset_ttl_minutes")]
    pub reset_ttl_minutes: i64,
}

fn default_session_ttl_hours() -> i64 {
    24 * 7
}
fn default_verification_ttl_hours() -> i64 {
    24
}
fn default_reset_ttl_minutes() -> i64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct MailConfig {
    #[serde(default = "default_from")]
    pub from: String,
    /// Base URL for links in emails (verification, reset, dashboard).
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,
    /// Locale tried after the recipient's own language.
    #[serde(default = "default_language")]
    pub default_language: String,
    /// `outbox` writes JSON files to `outbox_dir`, `log` only logs.
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_outbox_dir")]
    pub outbox_dir: PathBuf,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            from: default_from(),
            frontend_url: default_frontend_url(),
            default_language: default_language(),
            transport: default_transport(),
            outbox_dir: default_outbox_dir(),
        }
    }
}

fn default_from() -> String {
    "Handout Desk <noreply@handout-desk.local>".to_string()
}
fn default_frontend_url() -> String {
    "http://localhost:3000".to_string()
}
fn default_language() -> String {
    "zh_TW".to_string()
}
fn default_transport() -> String {
    "log".to_string()
}
fn default_outbox_dir() -> PathBuf {
    PathBuf::from("./data/outbox")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    /// Optional CSS file embedded in HTML renders.
    #[serde(default)]
    pub stylesheet: Option<PathBuf>,
    #[serde(default = "default_media_url")]
    pub media_url: String,
    #[serde(default = "default_media_root")]
    pub media_root: PathBuf,
    /// Largest accepted attachment body, in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            stylesheet: None,
            media_url: default_media_url(),
            media_root: default_media_root(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_media_url() -> String {
    "/media/".to_string()
}
fn default_media_root() -> PathBuf {
    PathBuf::from("./data/media")
}
fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024
}

const LANGUAGES: [&str; 4] = ["en", "zh_TW", "zh_CN", "th"];

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.db.max_connections < 1 {
        anyhow::bail!("db.max_connections must be >= 1");
    }
    if config.auth.secret.trim().is_empty() {
        anyhow::bail!("auth.secret must not be empty");
    }
    if config.auth.session_ttl_hours < 1 {
        anyhow::bail!("auth.session_ttl_hours must be >= 1");
    }
    if config.auth.verification_ttl_hours < 1 {
        anyhow::bail!("auth.verification_ttl_hours must be >= 1");
    }
    if config.auth.reset_ttl_minutes < 1 {
        anyhow::bail!("auth.reset_ttl_minutes must be >= 1");
    }

    match config.mail.transport.as_str() {
        "outbox" | "log" => {}
        other => anyhow::bail!("Unknown mail transport: '{}'. Must be outbox or log.", other),
    }

    if !LANGUAGES.contains(&config.mail.default_language.as_str()) {
        anyhow::bail!(
            "mail.default_language must be one of {}",
            LANGUAGES.join(", ")
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let text = format!(
            "[db]\npath = \"./data/hdk.sqlite\"\n\n[server]\nbind = \"127.0.0.1:7340\"\n\n{}",
            extra
        );
        let config: Config = toml::from_str(&text)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_defaults_fill_optional_sections() {
        let config = parse("[auth]\nsecret = \"s3cret\"\n").unwrap();
        assert_eq!(config.auth.verification_ttl_hours, 24);
        assert_eq!(config.auth.reset_ttl_minutes, 30);
        assert_eq!(config.mail.default_language, "zh_TW");
        assert_eq!(config.mail.transport, "log");
        assert_eq!(config.export.media_url, "/media/");
        assert!(config.export.stylesheet.is_none());
        assert_eq!(config.db.max_connections, 5);
        assert_eq!(config.db.busy_timeout_secs, 5);
    }

    #[test]
    fn test_rejects_empty_secret() {
        let err = parse("[auth]\nsecret = \"  \"\n").unwrap_err();
        assert!(err.to_string().contains("auth.secret"));
    }

    #[test]
    fn test_rejects_unknown_transport() {
        let err = parse("[auth]\nsecret = \"x\"\n\n[mail]\ntransport = \"smtp\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown mail transport"));
    }

    #[test]
    fn test_rejects_unknown_default_language() {
        let err =
            parse("[auth]\nsecret = \"x\"\n\n[mail]\ndefault_language = \"fr\"\n").unwrap_err();
        assert!(err.to_string().contains("default_language"));
    }
}
