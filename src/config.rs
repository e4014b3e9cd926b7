use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub user_info: UserInfo,
    #[serde(default)]
    pub commands: CommandTriggers,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Credentials and the single address commands are accepted from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    /// SMS gateway address of the user's phone; all other senders are ignored.
    pub phone_address: String,
    pub email: EmailConfig,
    pub broker: BrokerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Bot mailbox; also the recipient of holdings reports.
    pub username: String,
    pub password: String,
    #[serde(default = "default_imap_host")]
    pub imap_host: String,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default = "default_inbox")]
    pub inbox: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mfa_code: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_crypto_base")]
    pub crypto_base: String,
}

/// Trigger phrases per command category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandTriggers {
    #[serde(default = "default_current_holdings")]
    pub current_holdings: Vec<String>,
    #[serde(default = "default_cancel_orders")]
    pub cancel_orders: Vec<String>,
    #[serde(default = "default_limit_order")]
    pub limit_order: Vec<String>,
    #[serde(default = "default_open_orders")]
    pub open_orders: Vec<String>,
    #[serde(default)]
    pub instruments: InstrumentTriggers,
    /// Flag messages from the authorized sender that match nothing as read.
    #[serde(default = "default_mark_unmatched_read")]
    pub mark_unmatched_read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstrumentTriggers {
    #[serde(default = "default_equities")]
    pub equities: Vec<String>,
    #[serde(default = "default_options")]
    pub options: Vec<String>,
    #[serde(default = "default_crypto")]
    pub crypto: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_refresh_buffer_ms")]
    pub refresh_buffer_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub jitter_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_file")]
    pub file: String,
}

impl Default for CommandTriggers {
    fn default() -> Self {
        Self {
            current_holdings: default_current_holdings(),
            cancel_orders: default_cancel_orders(),
            limit_order: default_limit_order(),
            open_orders: default_open_orders(),
            instruments: InstrumentTriggers::default(),
            mark_unmatched_read: default_mark_unmatched_read(),
        }
    }
}

impl Default for InstrumentTriggers {
    fn default() -> Self {
        Self {
            equities: default_equities(),
            options: default_options(),
            crypto: default_crypto(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            refresh_interval_secs: default_refresh_interval_secs(),
            refresh_buffer_ms: default_refresh_buffer_ms(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter_factor: 0.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

impl PollConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Forced session refresh period, grace buffer included.
    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs) + Duration::from_millis(self.refresh_buffer_ms)
    }
}

fn phrases(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn default_imap_host() -> String {
    "imap.gmail.com".to_string()
}
fn default_imap_port() -> u16 {
    993
}
fn default_smtp_host() -> String {
    "smtp.gmail.com".to_string()
}
fn default_smtp_port() -> u16 {
    587
}
fn default_inbox() -> String {
    "INBOX".to_string()
}
fn default_api_base() -> String {
    "https://api.robinhood.com".to_string()
}
fn default_crypto_base() -> String {
    "https://nummus.robinhood.com".to_string()
}

fn default_current_holdings() -> Vec<String> {
    phrases(&["CURRENT", "CURRENT HOLDINGS"])
}
fn default_cancel_orders() -> Vec<String> {
    phrases(&["CANCEL", "CANCEL ALL"])
}
fn default_limit_order() -> Vec<String> {
    phrases(&["LIMIT BUY", "LIMIT SELL"])
}
fn default_open_orders() -> Vec<String> {
    phrases(&["O", "OPEN", "OPEN ORDERS"])
}
fn default_equities() -> Vec<String> {
    phrases(&["E", "EQUITY", "S", "STOCK"])
}
fn default_options() -> Vec<String> {
    phrases(&["O", "OPTION", "OPTIONS"])
}
fn default_crypto() -> Vec<String> {
    phrases(&["C", "CRYPTO"])
}
fn default_mark_unmatched_read() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    100
}
fn default_refresh_interval_secs() -> u64 {
    900 // server-side idle timeout is ~15 minutes
}
fn default_refresh_buffer_ms() -> u64 {
    500
}
fn default_max_attempts() -> u32 {
    1
}
fn default_initial_delay_ms() -> u64 {
    250
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_file() -> String {
    "log_INFO.txt".to_string()
}

impl BotConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_json(&config_str)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// One-line description for the startup log.
    pub fn summary(&self) -> String {
        format!(
            "mailbox {}, commands accepted from {}, polling every {} ms",
            self.user_info.email.username, self.user_info.phone_address, self.poll.poll_interval_ms
        )
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: BotConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.user_info.phone_address.trim().is_empty() {
            bail!("user_info.phone_address must be set");
        }
        if self.user_info.email.username.trim().is_empty() {
            bail!("user_info.email.username must be set");
        }
        if self.poll.poll_interval_ms == 0 {
            bail!("poll.poll_interval_ms must be greater than zero");
        }
        let categories = [
            ("current_holdings", &self.commands.current_holdings),
            ("cancel_orders", &self.commands.cancel_orders),
            ("limit_order", &self.commands.limit_order),
            ("open_orders", &self.commands.open_orders),
            ("instruments.equities", &self.commands.instruments.equities),
            ("instruments.options", &self.commands.instruments.options),
            ("instruments.crypto", &self.commands.instruments.crypto),
        ];
        for (name, triggers) in categories {
            if triggers.iter().all(|t| t.trim().is_empty()) {
                bail!("commands.{} needs at least one trigger phrase", name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "user_info": {
            "phone_address": "5551234567@vtext.com",
            "email": { "username": "bot@gmail.com", "password": "secret" },
            "broker": { "username": "trader", "password": "hunter2" }
        }
    }"#;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let config = BotConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.user_info.email.imap_host, "imap.gmail.com");
        assert_eq!(config.user_info.email.smtp_port, 587);
        assert_eq!(config.user_info.broker.api_base, "https://api.robinhood.com");
        assert_eq!(config.commands, CommandTriggers::default());
        assert!(config.commands.mark_unmatched_read);
        assert_eq!(config.poll.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.poll.refresh_period(), Duration::from_millis(900_500));
        assert_eq!(config.poll.reconnect.max_attempts, 1);
        assert_eq!(config.logging.file, "log_INFO.txt");
    }

    #[test]
    fn test_empty_sender_is_rejected() {
        let json = MINIMAL.replace("5551234567@vtext.com", " ");
        let err = BotConfig::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("phone_address"));
    }

    #[test]
    fn test_empty_trigger_list_is_rejected() {
        let mut config = BotConfig::from_json(MINIMAL).unwrap();
        config.commands.cancel_orders.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cancel_orders"));
    }

    #[test]
    fn test_load_from_file_and_summary() {
        let path = std::env::temp_dir().join(format!("robin-texts-config-{}.json", std::process::id()));
        fs::write(&path, MINIMAL).unwrap();
        let config = BotConfig::load_from_file(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(
            config.summary(),
            "mailbox bot@gmail.com, commands accepted from 5551234567@vtext.com, polling every 100 ms"
        );
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = BotConfig::load_from_file("/nonexistent/robin.json").unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/robin.json"));
    }
}
