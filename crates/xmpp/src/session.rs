use std::sync::Arc;

use jid::FullJid;

use crate::{connection::ConnectionState, error::ConnectionError, sasl::Credentials};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityLevel {
    #[default]
    None,
    Tls,
}

/// Per-attempt connection data. A fresh session is created on every
/// `connect()`; only credentials and configuration carry over.
#[derive(Debug, Clone)]
pub struct Session {
    pub domain: String,
    pub credentials: Credentials,
    /// Resource requested at bind time; the server picks one if unset.
    pub resource: Option<String>,
    pub bound_jid: Option<FullJid>,
    pub security: SecurityLevel,
    pub state: ConnectionState,
    /// Name of the SASL mechanism that authenticated this session.
    pub mechanism: Option<&'static str>,
    pub authenticated: bool,
    pub stream_id: Option<String>,
    /// Cause of the transition to `Failed`, if any.
    pub failure: Option<Arc<ConnectionError>>,
}

impl Session {
    pub fn new(domain: String, credentials: Credentials, resource: Option<String>) -> Self {
        Self {
            domain,
            credentials,
            resource,
            bound_jid: None,
            security: SecurityLevel::None,
            state: ConnectionState::Offline,
            mechanism: None,
            authenticated: false,
            stream_id: None,
            failure: None,
        }
    }

    pub fn is_secured(&self) -> bool {
        self.security == SecurityLevel::Tls
    }
}

/// A read-only view of the session handed to callers.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub domain: String,
    pub username: String,
    pub bound_jid: Option<FullJid>,
    pub security: SecurityLevel,
    pub state: ConnectionState,
    pub mechanism: Option<&'static str>,
    pub stream_id: Option<String>,
    pub failure: Option<Arc<ConnectionError>>,
}

impl From<&Session> for SessionSnapshot {
    fn from(session: &Session) -> Self {
        Self {
            domain: session.domain.clone(),
            username: session.credentials.username.clone(),
            bound_jid: session.bound_jid.clone(),
            security: session.security,
            state: session.state,
            mechanism: session.mechanism,
            stream_id: session.stream_id.clone(),
            failure: session.failure.clone(),
        }
    }
}
