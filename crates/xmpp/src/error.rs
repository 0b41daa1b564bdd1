use std::{sync::Arc, time::Duration};

use thiserror::Error;

use crate::{conditions::ProtocolError, connection::ConnectionState};

/// Errors that end the connection. Every pending request is failed with
/// [`RequestError::ConnectionLost`] wrapping one of these.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("negotiation timed out while {state} after {elapsed:?}")]
    NegotiationTimeout {
        state: ConnectionState,
        elapsed: Duration,
    },

    #[error("no common SASL mechanism; server offers: [{}]", offered.join(", "))]
    NoCommonMechanism { offered: Vec<String> },

    #[error("malformed SASL challenge: {0}")]
    MalformedChallenge(String),

    #[error("SASL exchange exceeded {0} challenge rounds")]
    TooManyChallenges(u32),

    #[error("server success verification failed for {mechanism}")]
    ServerVerificationFailed { mechanism: &'static str },

    #[error("server does not offer STARTTLS but TLS is required")]
    TlsRequired,

    #[error("server rejected STARTTLS")]
    TlsRejected,

    #[error("unsupported stream version: {0}")]
    UnsupportedVersion(String),

    #[error("unexpected <{name} xmlns='{namespace}'/> while {state}")]
    UnexpectedElement {
        state: ConnectionState,
        name: String,
        namespace: String,
    },

    #[error("invalid resource binding response: {0}")]
    InvalidBinding(String),

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    pub fn protocol(&self) -> Option<&ProtocolError> {
        match self {
            ConnectionError::Protocol(error) => Some(error),
            _ => None,
        }
    }

    pub(crate) fn unexpected(state: ConnectionState, element: &minidom::Element) -> Self {
        ConnectionError::UnexpectedElement {
            state,
            name: element.name().to_string(),
            namespace: element.ns(),
        }
    }
}

/// Errors local to a single request. They never change connection state.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    #[error("session is not online")]
    NotOnline,

    #[error(transparent)]
    Protocol(ProtocolError),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("connection lost: {0}")]
    ConnectionLost(Arc<ConnectionError>),

    #[error("transport rejected stanza: {0}")]
    Transport(String),

    #[error("invalid stanza: {0}")]
    InvalidStanza(String),
}

impl RequestError {
    pub fn protocol(&self) -> Option<&ProtocolError> {
        match self {
            RequestError::Protocol(error) => Some(error),
            _ => None,
        }
    }
}

/// Failure to interpret an element as a stanza.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StanzaError {
    #[error("<{0}/> is not a stanza")]
    UnknownKind(String),

    #[error("iq stanza without an id")]
    MissingId,

    #[error("invalid iq type: {0:?}")]
    InvalidIqType(Option<String>),

    #[error("invalid '{attribute}' address '{value}': {reason}")]
    InvalidAddress {
        attribute: &'static str,
        value: String,
        reason: String,
    },
}

/// Failures inside a SASL mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaslError {
    #[error("malformed challenge: {0}")]
    MalformedChallenge(String),

    #[error("no common mechanism; server offers: [{}]", offered.join(", "))]
    NoCommonMechanism { offered: Vec<String> },

    #[error("unknown mechanism: {0}")]
    UnknownMechanism(String),
}

impl From<SaslError> for ConnectionError {
    fn from(error: SaslError) -> Self {
        match error {
            SaslError::MalformedChallenge(reason) => ConnectionError::MalformedChallenge(reason),
            SaslError::NoCommonMechanism { offered } => {
                ConnectionError::NoCommonMechanism { offered }
            }
            SaslError::UnknownMechanism(name) => ConnectionError::NoCommonMechanism {
                offered: vec![name],
            },
        }
    }
}
