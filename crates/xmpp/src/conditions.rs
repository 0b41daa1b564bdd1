//! Protocol error conditions and their classification.
//!
//! RFC 6120 defines three families of defined conditions, each identified by
//! a (namespace, local-name) pair:
//!
//! - stream errors (`urn:ietf:params:xml:ns:xmpp-streams`, Section 4.9.3)
//! - SASL failures (`urn:ietf:params:xml:ns:xmpp-sasl`, Section 6.5)
//! - stanza errors (`urn:ietf:params:xml:ns:xmpp-stanzas`, Section 8.3.3)
//!
//! Stream errors and SASL failures end the connection. Stanza errors only
//! concern the request they answer.

use std::fmt;

use minidom::Element;
use thiserror::Error;

use crate::stanza::ns;

macro_rules! defined_conditions {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $tag:literal, $message:literal; )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            /// Get the element name for this condition.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $tag,)+
                }
            }

            /// Message used when the peer supplied no `<text/>`.
            pub fn default_message(&self) -> &'static str {
                match self {
                    $($name::$variant => $message,)+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($tag => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

defined_conditions! {
    /// XMPP stream error conditions (RFC 6120 Section 4.9.3).
    StreamErrorCondition {
        BadFormat => "bad-format", "Bad Format.";
        BadNamespacePrefix => "bad-namespace-prefix", "Bad Namespace Prefix.";
        Conflict => "conflict", "Conflict.";
        ConnectionTimeout => "connection-timeout", "Connection Timeout.";
        HostGone => "host-gone", "Host Gone.";
        HostUnknown => "host-unknown", "Host Unknown.";
        ImproperAddressing => "improper-addressing", "Improper Addressing.";
        InternalServerError => "internal-server-error", "Internal Server Error.";
        InvalidFrom => "invalid-from", "Invalid From.";
        InvalidNamespace => "invalid-namespace", "Invalid Namespace.";
        InvalidXml => "invalid-xml", "Invalid XML.";
        NotAuthorized => "not-authorized", "Not Authorized.";
        NotWellFormed => "not-well-formed", "Not Well Formed.";
        PolicyViolation => "policy-violation", "Policy Violation.";
        RemoteConnectionFailed => "remote-connection-failed", "Remote Connection Failed.";
        Reset => "reset", "Reset.";
        ResourceConstraint => "resource-constraint", "Resource Constraint.";
        RestrictedXml => "restricted-xml", "Restricted XML.";
        SeeOtherHost => "see-other-host", "See Other Host.";
        SystemShutdown => "system-shutdown", "System Shutdown.";
        UndefinedCondition => "undefined-condition", "Undefined Condition.";
        UnsupportedEncoding => "unsupported-encoding", "Unsupported Encoding.";
        UnsupportedFeature => "unsupported-feature", "Unsupported Feature.";
        UnsupportedStanzaType => "unsupported-stanza-type", "Unsupported Stanza Type.";
        UnsupportedVersion => "unsupported-version", "Unsupported Version.";
    }
}

defined_conditions! {
    /// SASL failure conditions (RFC 6120 Section 6.5).
    SaslFailureCondition {
        Aborted => "aborted", "Aborted.";
        AccountDisabled => "account-disabled", "Account Disabled.";
        CredentialsExpired => "credentials-expired", "Credentials Expired.";
        EncryptionRequired => "encryption-required", "Encryption Required.";
        IncorrectEncoding => "incorrect-encoding", "Incorrect Encoding.";
        InvalidAuthzid => "invalid-authzid", "Invalid Authzid.";
        InvalidMechanism => "invalid-mechanism", "Invalid Mechanism.";
        MalformedRequest => "malformed-request", "Malformed Request.";
        MechanismTooWeak => "mechanism-too-weak", "Mechanism Too Weak.";
        NotAuthorized => "not-authorized", "Not Authorized.";
        TemporaryAuthFailure => "temporary-auth-failure", "Temporary Authentication Failure.";
    }
}

defined_conditions! {
    /// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
    StanzaErrorCondition {
        BadRequest => "bad-request", "Bad Request.";
        Conflict => "conflict", "Conflict.";
        FeatureNotImplemented => "feature-not-implemented", "Feature Not Implemented.";
        Forbidden => "forbidden", "Forbidden.";
        Gone => "gone", "Gone.";
        InternalServerError => "internal-server-error", "Internal Server Error.";
        ItemNotFound => "item-not-found", "Item Not Found.";
        JidMalformed => "jid-malformed", "JID Malformed.";
        NotAcceptable => "not-acceptable", "Not Acceptable.";
        NotAllowed => "not-allowed", "Not Allowed.";
        NotAuthorized => "not-authorized", "Not Authorized.";
        PolicyViolation => "policy-violation", "Policy Violation.";
        RecipientUnavailable => "recipient-unavailable", "Recipient Unavailable.";
        Redirect => "redirect", "Redirect.";
        RegistrationRequired => "registration-required", "Registration Required.";
        RemoteServerNotFound => "remote-server-not-found", "Remote Server Not Found.";
        RemoteServerTimeout => "remote-server-timeout", "Remote Server Timeout.";
        ResourceConstraint => "resource-constraint", "Resource Constraint.";
        ServiceUnavailable => "service-unavailable", "Service Unavailable.";
        SubscriptionRequired => "subscription-required", "Subscription Required.";
        UndefinedCondition => "undefined-condition", "Undefined Condition.";
        UnexpectedRequest => "unexpected-request", "Unexpected Request.";
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Proceed (the condition was only a warning)
    Continue,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Continue => "continue",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }

    pub fn from_attr(value: &str) -> Option<Self> {
        match value {
            "auth" => Some(Self::Auth),
            "cancel" => Some(Self::Cancel),
            "continue" => Some(Self::Continue),
            "modify" => Some(Self::Modify),
            "wait" => Some(Self::Wait),
            _ => None,
        }
    }
}

impl fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an error ends the connection or a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    Stream,
    Stanza,
}

/// The classified kind of a protocol error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Stream(StreamErrorCondition),
    Authentication(SaslFailureCondition),
    Stanza(StanzaErrorCondition),
    /// A condition outside the defined tables.
    Unrecognized { namespace: String, name: String },
}

impl ErrorKind {
    pub fn scope(&self) -> ErrorScope {
        match self {
            ErrorKind::Stream(_) | ErrorKind::Authentication(_) => ErrorScope::Stream,
            ErrorKind::Stanza(_) => ErrorScope::Stanza,
            ErrorKind::Unrecognized { namespace, .. } => {
                if namespace == ns::STREAMS || namespace == ns::SASL {
                    ErrorScope::Stream
                } else {
                    ErrorScope::Stanza
                }
            }
        }
    }

    /// The (namespace, local-name) pair this kind is keyed by.
    pub fn condition_tag(&self) -> (&str, &str) {
        match self {
            ErrorKind::Stream(condition) => (ns::STREAMS, condition.as_str()),
            ErrorKind::Authentication(condition) => (ns::SASL, condition.as_str()),
            ErrorKind::Stanza(condition) => (ns::STANZAS, condition.as_str()),
            ErrorKind::Unrecognized { namespace, name } => (namespace.as_str(), name.as_str()),
        }
    }

    fn default_message(&self) -> String {
        match self {
            ErrorKind::Stream(condition) => condition.default_message().to_string(),
            ErrorKind::Authentication(condition) => condition.default_message().to_string(),
            ErrorKind::Stanza(condition) => condition.default_message().to_string(),
            ErrorKind::Unrecognized { name, .. } if name.is_empty() => {
                "Unspecified error.".to_string()
            }
            ErrorKind::Unrecognized { name, .. } => format!("Unrecognized error condition: {name}"),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Stream(condition) => write!(f, "stream error <{condition}/>"),
            ErrorKind::Authentication(condition) => write!(f, "authentication failure <{condition}/>"),
            ErrorKind::Stanza(condition) => write!(f, "stanza error <{condition}/>"),
            ErrorKind::Unrecognized { name, .. } => write!(f, "unrecognized error <{name}/>"),
        }
    }
}

/// A classified protocol error together with the element that carried it.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct ProtocolError {
    kind: ErrorKind,
    error_type: Option<StanzaErrorType>,
    message: String,
    element: Element,
}

impl ProtocolError {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn scope(&self) -> ErrorScope {
        self.kind.scope()
    }

    pub fn is_fatal(&self) -> bool {
        self.scope() == ErrorScope::Stream
    }

    pub fn stanza_condition(&self) -> Option<StanzaErrorCondition> {
        match self.kind {
            ErrorKind::Stanza(condition) => Some(condition),
            _ => None,
        }
    }

    /// The `type` attribute of a stanza `<error/>`, when present.
    pub fn error_type(&self) -> Option<StanzaErrorType> {
        self.error_type
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The offending element, kept for diagnostics.
    pub fn element(&self) -> &Element {
        &self.element
    }
}

/// Map a (namespace, local-name) condition tag to a typed error.
///
/// Unknown tags yield [`ErrorKind::Unrecognized`]; this never fails.
pub fn classify(namespace: &str, local_name: &str, source: &Element) -> ProtocolError {
    build(namespace, local_name, None, None, source)
}

/// Classify a `<stream:error/>` element.
pub fn classify_stream_error(stream_error: &Element) -> ProtocolError {
    classify_container(stream_error, ns::STREAMS, stream_error)
}

/// Classify a SASL `<failure/>` element.
pub fn classify_sasl_failure(failure: &Element) -> ProtocolError {
    classify_container(failure, ns::SASL, failure)
}

/// Classify the `<error/>` child of an error stanza. The whole stanza is
/// retained as the offending element.
pub fn classify_stanza_error(stanza: &Element) -> ProtocolError {
    match stanza.children().find(|child| child.name() == "error") {
        Some(error) => classify_container(error, ns::STANZAS, stanza),
        None => build(ns::STANZAS, "", None, None, stanza),
    }
}

fn classify_container(container: &Element, namespace: &str, source: &Element) -> ProtocolError {
    let condition = container
        .children()
        .find(|child| child.has_ns(namespace) && child.name() != "text");
    let text = container
        .children()
        .find(|child| child.name() == "text")
        .map(|text| text.text())
        .filter(|text| !text.trim().is_empty());
    let error_type = container.attr("type").and_then(StanzaErrorType::from_attr);

    match condition {
        Some(condition) => build(namespace, condition.name(), text, error_type, source),
        None => build(namespace, "", text, error_type, source),
    }
}

fn build(
    namespace: &str,
    local_name: &str,
    text: Option<String>,
    error_type: Option<StanzaErrorType>,
    source: &Element,
) -> ProtocolError {
    let known = match namespace {
        ns::STREAMS => StreamErrorCondition::from_name(local_name).map(ErrorKind::Stream),
        ns::SASL => SaslFailureCondition::from_name(local_name).map(ErrorKind::Authentication),
        ns::STANZAS => StanzaErrorCondition::from_name(local_name).map(ErrorKind::Stanza),
        _ => None,
    };
    let kind = known.unwrap_or_else(|| ErrorKind::Unrecognized {
        namespace: namespace.to_string(),
        name: local_name.to_string(),
    });
    let message = text.unwrap_or_else(|| kind.default_message());

    ProtocolError {
        kind,
        error_type,
        message,
        element: source.clone(),
    }
}

/// Build the `<error/>` child for an IQ error response.
pub fn stanza_error_element(
    condition: StanzaErrorCondition,
    error_type: StanzaErrorType,
    text: Option<&str>,
) -> Element {
    let mut error = Element::builder("error", ns::JABBER_CLIENT)
        .attr("type", error_type.as_str())
        .append(Element::bare(condition.as_str(), ns::STANZAS));

    if let Some(text) = text {
        error = error.append(
            Element::builder("text", ns::STANZAS)
                .attr("xml:lang", "en")
                .append(text.to_string())
                .build(),
        );
    }

    error.build()
}
