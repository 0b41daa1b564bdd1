use std::{fmt, sync::Arc};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};

use crate::error::SaslError;

type HmacMd5 = Hmac<md5::Md5>;

pub const CRAM_MD5: &str = "CRAM-MD5";
pub const PLAIN: &str = "PLAIN";

/// Account secrets handed to a mechanism for one call.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A challenge-response authentication algorithm.
///
/// Implementations hold no per-session state. Everything a call needs is
/// passed in, so one instance is shared by every session of a registry.
/// Payloads in and out are base64 text as carried on the wire.
pub trait Mechanism: Send + Sync {
    fn name(&self) -> &'static str;

    /// Mechanisms that expose the secret must not run over an unsecured stream.
    fn requires_secure_channel(&self) -> bool {
        false
    }

    /// Data carried in `<auth/>`, if the mechanism sends any up front.
    fn initial_response(&self, _credentials: &Credentials) -> Option<String> {
        None
    }

    fn challenge(&self, challenge: &str, credentials: &Credentials) -> Result<String, SaslError>;

    /// Validates the `<success/>` payload. Mechanisms without server
    /// verification accept anything.
    fn check_success(&self, _payload: &str, _credentials: &Credentials) -> bool {
        true
    }
}

/// RFC 2195 keyed-MD5 challenge-response.
#[derive(Debug, Default, Clone, Copy)]
pub struct CramMd5;

impl Mechanism for CramMd5 {
    fn name(&self) -> &'static str {
        CRAM_MD5
    }

    fn challenge(&self, challenge: &str, credentials: &Credentials) -> Result<String, SaslError> {
        let compact: String = challenge
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        let challenge = BASE64
            .decode(compact)
            .map_err(|error| SaslError::MalformedChallenge(error.to_string()))?;
        // RFC 2195 always sends a msg-id style challenge; nothing to key.
        if challenge.is_empty() {
            return Err(SaslError::MalformedChallenge("empty challenge".to_string()));
        }

        let mut mac = HmacMd5::new_from_slice(credentials.password.as_bytes())
            .map_err(|error| SaslError::MalformedChallenge(error.to_string()))?;
        mac.update(&challenge);
        let digest = hex::encode(mac.finalize().into_bytes());

        Ok(BASE64.encode(format!("{} {}", credentials.username, digest)))
    }
}

/// RFC 4616 clear-text authentication. The whole exchange is the initial
/// response, so any challenge is a protocol violation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Plain;

impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        PLAIN
    }

    fn requires_secure_channel(&self) -> bool {
        true
    }

    fn initial_response(&self, credentials: &Credentials) -> Option<String> {
        let message = format!("\0{}\0{}", credentials.username, credentials.password);
        Some(BASE64.encode(message))
    }

    fn challenge(&self, _challenge: &str, _credentials: &Credentials) -> Result<String, SaslError> {
        Err(SaslError::MalformedChallenge(
            "PLAIN does not accept challenges".to_string(),
        ))
    }
}

struct Registered {
    priority: u32,
    mechanism: Arc<dyn Mechanism>,
}

/// Mechanisms known to the client, ranked by priority (higher wins).
pub struct MechanismRegistry {
    entries: Vec<Registered>,
    allow_insecure: bool,
}

impl MechanismRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            allow_insecure: false,
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(200, Arc::new(CramMd5));
        registry.register(100, Arc::new(Plain));
        registry
    }

    /// Lets mechanisms that require a secured stream run without one.
    pub fn allow_insecure(mut self, allow: bool) -> Self {
        self.allow_insecure = allow;
        self
    }

    /// Adds a mechanism, replacing any registered under the same name.
    pub fn register(&mut self, priority: u32, mechanism: Arc<dyn Mechanism>) {
        self.entries
            .retain(|entry| entry.mechanism.name() != mechanism.name());
        self.entries.push(Registered {
            priority,
            mechanism,
        });
        self.entries.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Keeps only the named mechanisms, ranked in the order given.
    pub fn apply_preference(&mut self, preference: &[String]) -> Result<(), SaslError> {
        if let Some(unknown) = preference.iter().find(|name| self.get(name).is_none()) {
            return Err(SaslError::UnknownMechanism(unknown.clone()));
        }

        let count = preference.len() as u32;
        self.entries.retain(|entry| {
            preference
                .iter()
                .any(|name| name.as_str() == entry.mechanism.name())
        });
        for entry in &mut self.entries {
            let rank = preference
                .iter()
                .position(|name| name.as_str() == entry.mechanism.name())
                .unwrap_or_default() as u32;
            entry.priority = count - rank;
        }
        self.entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Mechanism>> {
        self.entries
            .iter()
            .find(|entry| entry.mechanism.name() == name)
            .map(|entry| Arc::clone(&entry.mechanism))
    }

    /// Names in priority order.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries
            .iter()
            .map(|entry| entry.mechanism.name())
            .collect()
    }

    /// Picks the highest-priority mechanism the server also offers.
    pub fn select(
        &self,
        offered: &[String],
        secured: bool,
    ) -> Result<Arc<dyn Mechanism>, SaslError> {
        self.entries
            .iter()
            .filter(|entry| {
                secured || self.allow_insecure || !entry.mechanism.requires_secure_channel()
            })
            .find(|entry| offered.iter().any(|name| name == entry.mechanism.name()))
            .map(|entry| Arc::clone(&entry.mechanism))
            .ok_or_else(|| SaslError::NoCommonMechanism {
                offered: offered.to_vec(),
            })
    }
}

impl Default for MechanismRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for MechanismRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MechanismRegistry")
            .field("mechanisms", &self.names())
            .field("allow_insecure", &self.allow_insecure)
            .finish()
    }
}
