//! Client-side XMPP engine: stream negotiation through STARTTLS, SASL and
//! resource binding, then correlation of IQ requests with their responses.
//!
//! The engine is transport-agnostic. Feed it parsed elements with
//! [`XmppClient::handle_element`] and write out the [`WireFrame`]s it sends
//! to its [`WireSink`].

pub mod conditions;
pub mod config;
pub mod connection;
pub mod error;
pub mod id;
pub mod router;
pub mod sasl;
pub mod session;
pub mod stanza;
pub mod transport;

pub use conditions::{
    classify, ErrorKind, ErrorScope, ProtocolError, SaslFailureCondition, StanzaErrorCondition,
    StanzaErrorType, StreamErrorCondition,
};
pub use config::{load_config_from, load_config_from_str, ConfigError, EngineConfig};
pub use connection::{ConnectionState, StanzaSubscriber, XmppClient};
pub use error::{ConnectionError, RequestError, SaslError, StanzaError};
pub use id::{IdGenerator, Identifier};
pub use sasl::{CramMd5, Credentials, Mechanism, MechanismRegistry, Plain};
pub use session::{SecurityLevel, SessionSnapshot};
pub use stanza::{IqType, ResultWindow, Stanza, StanzaKind};
pub use transport::{wire_channel, ChannelSink, StreamHeader, WireFrame, WireSink};
