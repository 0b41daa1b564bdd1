use std::{fmt, path::Path, time::Duration};

use jid::BareJid;
use serde::Deserialize;

use crate::sasl::MechanismRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub account: AccountConfig,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    #[serde(default)]
    pub requests: RequestConfig,
    #[serde(default)]
    pub mechanisms: MechanismConfig,
}

#[derive(Clone, Deserialize)]
pub struct AccountConfig {
    /// Bare JID; the domain and SASL username derive from it.
    pub jid: String,
    pub password: String,
    pub resource: Option<String>,
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("jid", &self.jid)
            .field("password", &"<redacted>")
            .field("resource", &self.resource)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NegotiationConfig {
    #[serde(default = "default_phase_timeout_seconds")]
    pub phase_timeout_seconds: u64,
    #[serde(default = "default_max_challenge_rounds")]
    pub max_challenge_rounds: u32,
    #[serde(default = "default_true")]
    pub require_tls: bool,
    #[serde(default)]
    pub allow_plain_without_tls: bool,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            phase_timeout_seconds: default_phase_timeout_seconds(),
            max_challenge_rounds: default_max_challenge_rounds(),
            require_tls: true,
            allow_plain_without_tls: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestConfig {
    #[serde(default = "default_request_timeout_seconds")]
    pub default_timeout_seconds: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MechanismConfig {
    /// Mechanisms to use, most preferred first. Unset keeps the built-in order.
    pub preference: Option<Vec<String>>,
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    jid: Option<String>,
    password: Option<String>,
}

/// Upper bound for every configured timeout: one week.
pub const MAX_TIMEOUT_SECONDS: u64 = 7 * 24 * 60 * 60;

fn default_true() -> bool {
    true
}

fn default_phase_timeout_seconds() -> u64 {
    30
}

fn default_max_challenge_rounds() -> u32 {
    8
}

fn default_request_timeout_seconds() -> u64 {
    60
}

impl EngineConfig {
    /// Default settings for one account.
    pub fn new(jid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            account: AccountConfig {
                jid: jid.into(),
                password: password.into(),
                resource: None,
            },
            negotiation: NegotiationConfig::default(),
            requests: RequestConfig::default(),
            mechanisms: MechanismConfig::default(),
        }
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation.phase_timeout_seconds)
    }

    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_secs(self.requests.default_timeout_seconds)
    }

    pub fn bare_jid(&self) -> Result<BareJid, ConfigError> {
        self.account
            .jid
            .parse::<BareJid>()
            .map_err(|error| ConfigError::InvalidValue {
                field: "account.jid".to_string(),
                message: error.to_string(),
            })
    }

    /// Builds the mechanism registry these settings describe.
    pub fn mechanism_registry(&self) -> Result<MechanismRegistry, ConfigError> {
        let mut registry = MechanismRegistry::with_defaults()
            .allow_insecure(self.negotiation.allow_plain_without_tls);
        if let Some(preference) = &self.mechanisms.preference {
            registry
                .apply_preference(preference)
                .map_err(|error| ConfigError::InvalidValue {
                    field: "mechanisms.preference".to_string(),
                    message: error.to_string(),
                })?;
        }
        Ok(registry)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();

        if self.account.jid.is_empty() {
            missing.push("account.jid".to_string());
        }
        if self.account.password.is_empty() {
            missing.push("account.password".to_string());
        }

        if !missing.is_empty() {
            return Err(ConfigError::MissingRequiredFields { fields: missing });
        }

        let bare = self.bare_jid()?;
        if split_bare_jid(&bare).0.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "account.jid".to_string(),
                message: "must include a username".to_string(),
            });
        }

        if matches!(self.account.resource.as_deref(), Some("")) {
            return Err(invalid("account.resource", "must not be empty"));
        }
        check_timeout(
            "negotiation.phase_timeout_seconds",
            self.negotiation.phase_timeout_seconds,
        )?;
        if self.negotiation.max_challenge_rounds == 0 {
            return Err(invalid("negotiation.max_challenge_rounds", "must be positive"));
        }
        check_timeout(
            "requests.default_timeout_seconds",
            self.requests.default_timeout_seconds,
        )?;
        if matches!(&self.mechanisms.preference, Some(list) if list.is_empty()) {
            return Err(invalid("mechanisms.preference", "must name at least one mechanism"));
        }

        self.mechanism_registry().map(|_| ())
    }
}

fn check_timeout(field: &str, seconds: u64) -> Result<(), ConfigError> {
    match seconds {
        0 => Err(invalid(field, "must be positive")),
        s if s > MAX_TIMEOUT_SECONDS => Err(invalid(
            field,
            &format!("must be at most {MAX_TIMEOUT_SECONDS} seconds"),
        )),
        _ => Ok(()),
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Splits a bare JID into its optional username and domain.
pub(crate) fn split_bare_jid(jid: &BareJid) -> (Option<String>, String) {
    (
        jid.node().map(|node| node.to_string()),
        jid.domain().to_string(),
    )
}

/// Load configuration from a file, merging environment variable overrides.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_config_from_str_with_overrides(&contents, config_overrides_from_env())
}

/// Parse configuration from a TOML string, merging environment variable overrides.
pub fn load_config_from_str(toml_str: &str) -> Result<EngineConfig, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<EngineConfig, ConfigError> {
    let mut config: EngineConfig = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    config.validate()?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        jid: std::env::var("XMPP_ENGINE_JID").ok(),
        password: std::env::var("XMPP_ENGINE_PASSWORD").ok(),
    }
}

fn apply_overrides(config: &mut EngineConfig, overrides: ConfigOverrides) {
    if let Some(jid) = overrides.jid {
        config.account.jid = jid;
    }
    if let Some(password) = overrides.password {
        config.account.password = password;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_without_env(toml_str: &str) -> Result<EngineConfig, ConfigError> {
        load_config_from_str_with_overrides(toml_str, ConfigOverrides::default())
    }

    fn minimal_toml() -> &'static str {
        r#"
[account]
jid = "user@example.com"
password = "secret"
"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = parse_without_env(minimal_toml()).unwrap();
        assert_eq!(config.account.jid, "user@example.com");
        assert!(config.account.resource.is_none());
        assert_eq!(config.phase_timeout(), Duration::from_secs(30));
        assert_eq!(config.negotiation.max_challenge_rounds, 8);
        assert!(config.negotiation.require_tls);
        assert!(!config.negotiation.allow_plain_without_tls);
        assert_eq!(config.default_request_timeout(), Duration::from_secs(60));
        assert!(config.mechanisms.preference.is_none());
    }

    #[test]
    fn parses_full_config() {
        let toml = r#"
[account]
jid = "user@example.com"
password = "secret"
resource = "desk"

[negotiation]
phase_timeout_seconds = 5
max_challenge_rounds = 2
require_tls = false
allow_plain_without_tls = true

[requests]
default_timeout_seconds = 15

[mechanisms]
preference = ["PLAIN"]
"#;
        let config = parse_without_env(toml).unwrap();
        assert_eq!(config.account.resource.as_deref(), Some("desk"));
        assert_eq!(config.phase_timeout(), Duration::from_secs(5));
        assert_eq!(config.negotiation.max_challenge_rounds, 2);
        assert!(!config.negotiation.require_tls);
        assert_eq!(config.default_request_timeout(), Duration::from_secs(15));
        assert_eq!(config.mechanism_registry().unwrap().names(), vec!["PLAIN"]);
    }

    #[test]
    fn missing_credentials_are_reported_together() {
        let toml = r#"
[account]
jid = ""
password = ""
"#;
        match parse_without_env(toml) {
            Err(ConfigError::MissingRequiredFields { fields }) => {
                assert_eq!(fields, vec!["account.jid", "account.password"]);
            }
            other => panic!("expected MissingRequiredFields, got {other:?}"),
        }
    }

    #[test]
    fn jid_without_username_is_rejected() {
        let toml = r#"
[account]
jid = "example.com"
password = "secret"
"#;
        assert!(matches!(
            parse_without_env(toml),
            Err(ConfigError::InvalidValue { field, .. }) if field == "account.jid"
        ));
    }

    #[test]
    fn unknown_mechanism_is_rejected() {
        let toml = r#"
[account]
jid = "user@example.com"
password = "secret"

[mechanisms]
preference = ["DIGEST-MD5"]
"#;
        match parse_without_env(toml) {
            Err(ConfigError::InvalidValue { field, message }) => {
                assert_eq!(field, "mechanisms.preference");
                assert!(message.contains("DIGEST-MD5"));
            }
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let toml = r#"
[account]
jid = "user@example.com"
password = "secret"

[negotiation]
phase_timeout_seconds = 0
"#;
        assert!(matches!(
            parse_without_env(toml),
            Err(ConfigError::InvalidValue { field, .. }) if field == "negotiation.phase_timeout_seconds"
        ));
    }

    #[test]
    fn oversized_timeouts_are_rejected() {
        let toml = r#"
[account]
jid = "user@example.com"
password = "secret"

[requests]
default_timeout_seconds = 9223372036854775807
"#;
        assert!(matches!(
            parse_without_env(toml),
            Err(ConfigError::InvalidValue { field, .. }) if field == "requests.default_timeout_seconds"
        ));

        let mut config = EngineConfig::new("user@example.com", "secret");
        config.negotiation.phase_timeout_seconds = MAX_TIMEOUT_SECONDS + 1;
        assert!(config.validate().is_err());
        config.negotiation.phase_timeout_seconds = MAX_TIMEOUT_SECONDS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_toml_reports_position() {
        let toml = "[account]\njid = \"user@example.com\"\npassword = \n";
        match parse_without_env(toml) {
            Err(ConfigError::InvalidToml { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected InvalidToml, got {other:?}"),
        }
    }

    #[test]
    fn overrides_replace_file_values() {
        let overrides = ConfigOverrides {
            jid: Some("other@example.org".to_string()),
            password: Some("hunter2".to_string()),
        };
        let config = load_config_from_str_with_overrides(minimal_toml(), overrides).unwrap();
        assert_eq!(config.account.jid, "other@example.org");
        assert_eq!(config.account.password, "hunter2");
    }

    #[test]
    fn debug_output_redacts_password() {
        let config = EngineConfig::new("user@example.com", "secret");
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn splits_bare_jid() {
        let jid: BareJid = "user@example.com".parse().unwrap();
        assert_eq!(
            split_bare_jid(&jid),
            (Some("user".to_string()), "example.com".to_string())
        );

        let domain_only: BareJid = "example.com".parse().unwrap();
        assert_eq!(split_bare_jid(&domain_only), (None, "example.com".to_string()));
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            load_config_from("/nonexistent/xmpp-engine.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
