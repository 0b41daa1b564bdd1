//! The client connection: stream negotiation up to `Online`, then request
//! correlation and unsolicited stanza dispatch.
//!
//! The client does no I/O of its own. A transport feeds it parsed elements
//! and lifecycle events, and drains the [`WireFrame`]s it emits through a
//! [`WireSink`]. Negotiation deadlines and request deadlines run on Tokio
//! timers, so the client must be driven from within a Tokio runtime.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak},
    time::Duration,
};

use jid::{FullJid, Jid};
use minidom::Element;
use tokio::{sync::oneshot, task::AbortHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    conditions::{
        classify_sasl_failure, classify_stanza_error, classify_stream_error, stanza_error_element,
        StanzaErrorCondition, StanzaErrorType,
    },
    config::{split_bare_jid, ConfigError, EngineConfig},
    error::{ConnectionError, RequestError},
    id::IdGenerator,
    router::{Inbound, Router},
    sasl::{Credentials, Mechanism, MechanismRegistry},
    session::{SecurityLevel, Session, SessionSnapshot},
    stanza::{ns, IqType, Stanza, StanzaKind},
    transport::{StreamHeader, WireFrame, WireSink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Offline,
    Connecting,
    NegotiatingStream,
    NegotiatingSecurity,
    Authenticating,
    BindingResource,
    Online,
    Closing,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Offline => "offline",
            ConnectionState::Connecting => "connecting",
            ConnectionState::NegotiatingStream => "negotiating stream",
            ConnectionState::NegotiatingSecurity => "negotiating security",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::BindingResource => "binding resource",
            ConnectionState::Online => "online",
            ConnectionState::Closing => "closing",
            ConnectionState::Failed => "failed",
        }
    }

    /// States bounded by the negotiation deadline.
    pub fn is_negotiating(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::NegotiatingStream
                | ConnectionState::NegotiatingSecurity
                | ConnectionState::Authenticating
                | ConnectionState::BindingResource
        )
    }

    fn is_live(&self) -> bool {
        self.is_negotiating() || *self == ConnectionState::Online
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives inbound stanzas that do not answer a pending request.
///
/// Callbacks run on the task that delivered the element, outside any
/// client lock, so they may call back into the client.
pub trait StanzaSubscriber: Send + Sync + 'static {
    fn on_message(&self, _client: &XmppClient, _message: Stanza) {}

    fn on_presence(&self, _client: &XmppClient, _presence: Stanza) {}

    /// A get or set addressed to this client. Every request must be
    /// answered; the default declines with `service-unavailable`.
    fn on_request(&self, client: &XmppClient, request: Stanza) {
        decline(client, &request);
    }
}

fn decline(client: &XmppClient, request: &Stanza) {
    if let Err(error) = client.respond_error(
        request,
        StanzaErrorCondition::ServiceUnavailable,
        StanzaErrorType::Cancel,
        None,
    ) {
        debug!(%error, "could not decline inbound request");
    }
}

/// Where the current negotiation state is within its exchange.
enum Phase {
    Idle,
    AwaitingFeatures,
    AwaitingProceed,
    AwaitingUpgrade,
    Sasl {
        mechanism: Arc<dyn Mechanism>,
        rounds: u32,
    },
    Binding {
        request_id: String,
    },
}

struct Shared {
    session: Session,
    phase: Phase,
    /// Bumped on every transition; a watchdog only fires for its own.
    generation: u64,
    phase_started: Instant,
    watchdog: Option<AbortHandle>,
}

struct Inner {
    config: EngineConfig,
    domain: String,
    credentials: Credentials,
    sink: Arc<dyn WireSink>,
    ids: Arc<IdGenerator>,
    mechanisms: MechanismRegistry,
    shared: Mutex<Shared>,
    router: Arc<Router>,
    subscriber: RwLock<Option<Arc<dyn StanzaSubscriber>>>,
}

/// Handle to one client connection. Cheap to clone; all clones drive the
/// same connection.
#[derive(Clone)]
pub struct XmppClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for XmppClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XmppClient")
            .field("domain", &self.inner.domain)
            .field("state", &self.state())
            .finish()
    }
}

impl XmppClient {
    pub fn new(config: EngineConfig, sink: Arc<dyn WireSink>) -> Result<Self, ConfigError> {
        Self::with_id_generator(config, sink, Arc::new(IdGenerator::new()))
    }

    /// Builds a client that draws request ids from a shared generator.
    pub fn with_id_generator(
        config: EngineConfig,
        sink: Arc<dyn WireSink>,
        ids: Arc<IdGenerator>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let account = config.bare_jid()?;
        let (username, domain) = split_bare_jid(&account);
        let credentials = Credentials::new(username.unwrap_or_default(), &config.account.password);
        let mechanisms = config.mechanism_registry()?;
        let session = Session::new(
            domain.clone(),
            credentials.clone(),
            config.account.resource.clone(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                domain,
                credentials,
                sink,
                ids,
                mechanisms,
                shared: Mutex::new(Shared {
                    session,
                    phase: Phase::Idle,
                    generation: 0,
                    phase_started: Instant::now(),
                    watchdog: None,
                }),
                router: Router::new(account),
                subscriber: RwLock::new(None),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().session.state
    }

    pub fn session(&self) -> SessionSnapshot {
        SessionSnapshot::from(&self.lock().session)
    }

    pub fn bound_jid(&self) -> Option<FullJid> {
        self.lock().session.bound_jid.clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.router.len()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn StanzaSubscriber>) {
        *self
            .inner
            .subscriber
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscriber);
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Starts a fresh connection attempt. The transport should open its
    /// socket and then call [`XmppClient::on_transport_connected`].
    pub fn connect(&self) -> Result<(), ConnectionError> {
        let mut shared = self.lock();
        let state = shared.session.state;
        if !matches!(state, ConnectionState::Offline | ConnectionState::Failed) {
            return Err(ConnectionError::InvalidState {
                operation: "connect",
                state,
            });
        }

        shared.session = Session::new(
            self.inner.domain.clone(),
            self.inner.credentials.clone(),
            self.inner.config.account.resource.clone(),
        );
        self.enter(&mut shared, ConnectionState::Connecting, Phase::Idle);
        Ok(())
    }

    pub fn on_transport_connected(&self) -> Result<(), ConnectionError> {
        let shared = self.lock();
        let state = shared.session.state;
        if state != ConnectionState::Connecting {
            return Err(ConnectionError::InvalidState {
                operation: "open the stream",
                state,
            });
        }

        let opened = self.send_header(&shared);
        self.advance(shared, opened.map(|()| {
            (ConnectionState::NegotiatingStream, Phase::AwaitingFeatures)
        }));
        Ok(())
    }

    /// Reports that the TLS handshake requested by
    /// [`WireFrame::StartTlsUpgrade`] completed.
    pub fn on_security_established(&self) -> Result<(), ConnectionError> {
        let mut shared = self.lock();
        let state = shared.session.state;
        if state != ConnectionState::NegotiatingSecurity
            || !matches!(shared.phase, Phase::AwaitingUpgrade)
        {
            return Err(ConnectionError::InvalidState {
                operation: "complete the TLS upgrade",
                state,
            });
        }

        shared.session.security = SecurityLevel::Tls;
        debug!("stream secured");
        let restarted = self.send_header(&shared);
        self.advance(shared, restarted.map(|()| {
            (ConnectionState::NegotiatingStream, Phase::AwaitingFeatures)
        }));
        Ok(())
    }

    /// Handles the server's stream header.
    pub fn handle_stream_header(&self, header: &StreamHeader) {
        let mut shared = self.lock();
        if shared.session.state != ConnectionState::NegotiatingStream {
            warn!(state = %shared.session.state, "ignoring stream header");
            return;
        }

        match header.validate() {
            Ok(()) => {
                shared.session.stream_id = header.id.clone();
                debug!(stream_id = ?header.id, "stream opened");
            }
            Err(error) => self.fail_locked(shared, error),
        }
    }

    pub fn on_transport_closed(&self) {
        let mut shared = self.lock();
        match shared.session.state {
            ConnectionState::Closing => {
                self.enter(&mut shared, ConnectionState::Offline, Phase::Idle);
                info!("connection closed");
            }
            ConnectionState::Offline | ConnectionState::Failed => {}
            _ => {
                drop(shared);
                self.fail(ConnectionError::TransportFailure(
                    "transport closed unexpectedly".to_string(),
                ));
            }
        }
    }

    pub fn on_transport_error(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut shared = self.lock();
        match shared.session.state {
            ConnectionState::Closing => {
                debug!(%reason, "transport error while closing");
                self.enter(&mut shared, ConnectionState::Offline, Phase::Idle);
            }
            _ => {
                drop(shared);
                self.fail(ConnectionError::TransportFailure(reason));
            }
        }
    }

    /// Closes the stream. Pending requests fail with `ConnectionLost`. The
    /// client reaches `Offline` once the transport reports the close.
    pub fn close(&self) {
        let mut shared = self.lock();
        match shared.session.state {
            ConnectionState::Offline | ConnectionState::Closing => return,
            ConnectionState::Failed => {
                self.enter(&mut shared, ConnectionState::Offline, Phase::Idle);
                return;
            }
            _ => {}
        }

        info!(domain = %shared.session.domain, "closing connection");
        self.enter(&mut shared, ConnectionState::Closing, Phase::Idle);
        if let Err(error) = self.inner.sink.send(WireFrame::StreamClose) {
            debug!(%error, "transport gone before stream close");
            self.enter(&mut shared, ConnectionState::Offline, Phase::Idle);
        }
        drop(shared);

        self.inner
            .router
            .fail_all(&Arc::new(ConnectionError::Closed));
    }

    // ── Inbound ───────────────────────────────────────────────────

    /// Handles one parsed top-level element from the transport.
    pub fn handle_element(&self, element: Element) {
        let mut shared = self.lock();
        match self.step(&mut shared, element) {
            Ok(Some(stanza)) => {
                drop(shared);
                self.route(stanza);
            }
            Ok(None) => {}
            Err(error) => self.fail_locked(shared, error),
        }
    }

    /// Advances negotiation by one element. Returns the element back when
    /// it should be routed as a stanza.
    fn step(&self, shared: &mut Shared, element: Element) -> Result<Option<Element>, ConnectionError> {
        let state = shared.session.state;
        if state.is_live() && element.is("error", ns::STREAM) {
            return Err(classify_stream_error(&element).into());
        }

        match state {
            ConnectionState::Offline | ConnectionState::Closing | ConnectionState::Failed => {
                debug!(state = %state, element = element.name(), "ignoring element");
                Ok(None)
            }
            ConnectionState::Online => Ok(Some(element)),
            ConnectionState::Connecting => Err(ConnectionError::unexpected(state, &element)),
            ConnectionState::NegotiatingStream => {
                if element.is("features", ns::STREAM) {
                    self.on_features(shared, &element)?;
                    Ok(None)
                } else {
                    Err(ConnectionError::unexpected(state, &element))
                }
            }
            ConnectionState::NegotiatingSecurity => {
                self.on_tls(shared, &element)?;
                Ok(None)
            }
            ConnectionState::Authenticating => {
                self.on_sasl(shared, &element)?;
                Ok(None)
            }
            ConnectionState::BindingResource => {
                self.on_bind(shared, &element)?;
                Ok(None)
            }
        }
    }

    fn on_features(&self, shared: &mut Shared, features: &Element) -> Result<(), ConnectionError> {
        if !shared.session.is_secured() {
            if features.get_child("starttls", ns::TLS).is_some() {
                self.emit(WireFrame::Element(Element::bare("starttls", ns::TLS)))?;
                self.enter(shared, ConnectionState::NegotiatingSecurity, Phase::AwaitingProceed);
                return Ok(());
            }
            if self.inner.config.negotiation.require_tls {
                return Err(ConnectionError::TlsRequired);
            }
        }

        if !shared.session.authenticated {
            let offered: Vec<String> = features
                .get_child("mechanisms", ns::SASL)
                .map(|mechanisms| {
                    mechanisms
                        .children()
                        .filter(|child| child.is("mechanism", ns::SASL))
                        .map(|child| child.text().trim().to_string())
                        .collect()
                })
                .unwrap_or_default();

            let mechanism = self
                .inner
                .mechanisms
                .select(&offered, shared.session.is_secured())?;
            debug!(mechanism = mechanism.name(), ?offered, "selected SASL mechanism");

            let mut auth = Element::builder("auth", ns::SASL).attr("mechanism", mechanism.name());
            if let Some(initial) = mechanism.initial_response(&shared.session.credentials) {
                auth = auth.append(wire_payload(initial));
            }
            self.emit(WireFrame::Element(auth.build()))?;
            self.enter(
                shared,
                ConnectionState::Authenticating,
                Phase::Sasl {
                    mechanism,
                    rounds: 0,
                },
            );
            return Ok(());
        }

        if features.get_child("bind", ns::BIND).is_none() {
            return Err(ConnectionError::InvalidBinding(
                "server did not offer resource binding".to_string(),
            ));
        }

        let mut bind = Element::builder("bind", ns::BIND);
        if let Some(resource) = &shared.session.resource {
            bind = bind.append(
                Element::builder("resource", ns::BIND)
                    .append(resource.clone())
                    .build(),
            );
        }
        let request_id = self.inner.ids.next().to_string();
        let request = Stanza::iq(IqType::Set, None, Some(bind.build())).with_id(request_id.clone());
        self.emit(WireFrame::Element(request.to_element()))?;
        self.enter(
            shared,
            ConnectionState::BindingResource,
            Phase::Binding { request_id },
        );
        Ok(())
    }

    fn on_tls(&self, shared: &mut Shared, element: &Element) -> Result<(), ConnectionError> {
        let state = shared.session.state;
        if !matches!(shared.phase, Phase::AwaitingProceed) {
            return Err(ConnectionError::unexpected(state, element));
        }

        if element.is("proceed", ns::TLS) {
            self.emit(WireFrame::StartTlsUpgrade)?;
            shared.phase = Phase::AwaitingUpgrade;
            debug!("server accepted STARTTLS");
            Ok(())
        } else if element.is("failure", ns::TLS) {
            Err(ConnectionError::TlsRejected)
        } else {
            Err(ConnectionError::unexpected(state, element))
        }
    }

    fn on_sasl(&self, shared: &mut Shared, element: &Element) -> Result<(), ConnectionError> {
        let state = shared.session.state;
        let Phase::Sasl { mechanism, rounds } = &mut shared.phase else {
            return Err(ConnectionError::unexpected(state, element));
        };
        let mechanism = Arc::clone(mechanism);

        if element.is("challenge", ns::SASL) {
            *rounds += 1;
            let max_rounds = self.inner.config.negotiation.max_challenge_rounds;
            if *rounds > max_rounds {
                return Err(ConnectionError::TooManyChallenges(max_rounds));
            }
            debug!(mechanism = mechanism.name(), round = *rounds, "answering SASL challenge");

            let response = mechanism.challenge(
                &payload_text(element),
                &shared.session.credentials,
            )?;
            self.emit(WireFrame::Element(
                Element::builder("response", ns::SASL)
                    .append(wire_payload(response))
                    .build(),
            ))
        } else if element.is("success", ns::SASL) {
            if !mechanism.check_success(&payload_text(element), &shared.session.credentials) {
                return Err(ConnectionError::ServerVerificationFailed {
                    mechanism: mechanism.name(),
                });
            }

            shared.session.authenticated = true;
            shared.session.mechanism = Some(mechanism.name());
            info!(mechanism = mechanism.name(), "authenticated");
            self.send_header(shared)?;
            self.enter(shared, ConnectionState::NegotiatingStream, Phase::AwaitingFeatures);
            Ok(())
        } else if element.is("failure", ns::SASL) {
            Err(classify_sasl_failure(element).into())
        } else {
            Err(ConnectionError::unexpected(state, element))
        }
    }

    fn on_bind(&self, shared: &mut Shared, element: &Element) -> Result<(), ConnectionError> {
        let state = shared.session.state;
        let Phase::Binding { request_id } = &shared.phase else {
            return Err(ConnectionError::unexpected(state, element));
        };
        if !element.is("iq", ns::JABBER_CLIENT) || element.attr("id") != Some(request_id.as_str()) {
            return Err(ConnectionError::unexpected(state, element));
        }

        match element.attr("type") {
            Some("result") => {
                let jid = element
                    .get_child("bind", ns::BIND)
                    .and_then(|bind| bind.get_child("jid", ns::BIND))
                    .map(|jid| jid.text())
                    .ok_or_else(|| {
                        ConnectionError::InvalidBinding("result carries no jid".to_string())
                    })?;
                let jid = jid.trim().parse::<FullJid>().map_err(|error| {
                    ConnectionError::InvalidBinding(format!("'{}': {error}", jid.trim()))
                })?;

                info!(jid = %jid, "session online");
                shared.session.bound_jid = Some(jid);
                self.enter(shared, ConnectionState::Online, Phase::Idle);
                Ok(())
            }
            Some("error") => Err(classify_stanza_error(element).into()),
            other => Err(ConnectionError::InvalidBinding(format!(
                "unexpected iq type {other:?}"
            ))),
        }
    }

    fn route(&self, element: Element) {
        if !element.has_ns(ns::JABBER_CLIENT) || StanzaKind::from_name(element.name()).is_none() {
            warn!(element = element.name(), namespace = %element.ns(), "ignoring non-stanza element");
            return;
        }

        let stanza = match Stanza::try_from(element) {
            Ok(stanza) => stanza,
            Err(error) => {
                warn!(%error, "dropping malformed stanza");
                return;
            }
        };

        if let Inbound::Unsolicited(stanza) = self.inner.router.handle_inbound(stanza) {
            self.dispatch(stanza);
        }
    }

    fn dispatch(&self, stanza: Stanza) {
        let subscriber = self
            .inner
            .subscriber
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match (stanza.kind(), subscriber) {
            (StanzaKind::Message, Some(subscriber)) => subscriber.on_message(self, stanza),
            (StanzaKind::Presence, Some(subscriber)) => subscriber.on_presence(self, stanza),
            (StanzaKind::Iq, Some(subscriber)) => subscriber.on_request(self, stanza),
            (StanzaKind::Iq, None) => decline(self, &stanza),
            (kind, None) => debug!(%kind, "no subscriber for unsolicited stanza"),
        }
    }

    // ── State transitions ─────────────────────────────────────────

    fn enter(&self, shared: &mut Shared, state: ConnectionState, phase: Phase) {
        let previous = shared.session.state;
        shared.session.state = state;
        shared.phase = phase;
        shared.generation += 1;
        shared.phase_started = Instant::now();
        if let Some(watchdog) = shared.watchdog.take() {
            watchdog.abort();
        }
        if state.is_negotiating() {
            shared.watchdog = Some(self.arm_watchdog(shared.generation));
        }
        if previous != state {
            debug!(from = %previous, to = %state, "connection state changed");
        }
    }

    /// Applies the outcome of a negotiation step taken under the lock.
    fn advance(
        &self,
        mut shared: MutexGuard<'_, Shared>,
        outcome: Result<(ConnectionState, Phase), ConnectionError>,
    ) {
        match outcome {
            Ok((state, phase)) => self.enter(&mut shared, state, phase),
            Err(error) => self.fail_locked(shared, error),
        }
    }

    fn fail_locked(&self, mut shared: MutexGuard<'_, Shared>, error: ConnectionError) {
        if let Some(cause) = self.mark_failed(&mut shared, error) {
            drop(shared);
            self.inner.router.fail_all(&cause);
        }
    }

    fn fail(&self, error: ConnectionError) {
        let cause = {
            let mut shared = self.lock();
            self.mark_failed(&mut shared, error)
        };
        if let Some(cause) = cause {
            self.inner.router.fail_all(&cause);
        }
    }

    /// Moves to `Failed` under the lock. Pending requests are failed by the
    /// caller with the returned cause once the lock is released.
    fn mark_failed(&self, shared: &mut Shared, error: ConnectionError) -> Option<Arc<ConnectionError>> {
        let state = shared.session.state;
        if matches!(state, ConnectionState::Failed | ConnectionState::Offline) {
            debug!(state = %state, %error, "ignoring error on inactive connection");
            return None;
        }

        let cause = Arc::new(error);
        warn!(state = %state, error = %cause, "connection failed");
        shared.session.failure = Some(Arc::clone(&cause));
        if !matches!(*cause, ConnectionError::TransportFailure(_)) {
            if let Err(error) = self.inner.sink.send(WireFrame::StreamClose) {
                debug!(%error, "could not close stream after failure");
            }
        }
        self.enter(shared, ConnectionState::Failed, Phase::Idle);
        Some(cause)
    }

    fn arm_watchdog(&self, generation: u64) -> AbortHandle {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let budget = self.inner.config.phase_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            if let Some(inner) = inner.upgrade() {
                XmppClient { inner }.expire_phase(generation);
            }
        })
        .abort_handle()
    }

    fn expire_phase(&self, generation: u64) {
        let cause = {
            let mut shared = self.lock();
            let state = shared.session.state;
            if shared.generation != generation || !state.is_negotiating() {
                return;
            }
            let elapsed = shared.phase_started.elapsed();
            self.mark_failed(
                &mut shared,
                ConnectionError::NegotiationTimeout { state, elapsed },
            )
        };
        if let Some(cause) = cause {
            self.inner.router.fail_all(&cause);
        }
    }

    fn send_header(&self, shared: &Shared) -> Result<(), ConnectionError> {
        self.emit(WireFrame::StreamHeader(StreamHeader::client(
            &shared.session.domain,
        )))
    }

    fn emit(&self, frame: WireFrame) -> Result<(), ConnectionError> {
        self.inner.sink.send(frame)
    }

    // ── Requests ──────────────────────────────────────────────────

    /// Sends an IQ get or set and arranges for `on_complete` to run exactly
    /// once with the response, a typed error, or a timeout. Returns the
    /// correlation id assigned to the request.
    ///
    /// `timeout` defaults to the configured request timeout.
    pub fn send_request<C, F>(
        &self,
        stanza: Stanza,
        timeout: Option<Duration>,
        context: C,
        on_complete: F,
    ) -> Result<String, RequestError>
    where
        C: Send + 'static,
        F: FnOnce(Result<Stanza, RequestError>, C) + Send + 'static,
    {
        if !stanza.iq_type().is_some_and(|iq_type| iq_type.is_request()) {
            return Err(RequestError::InvalidStanza(
                "requests must be iq get or set".to_string(),
            ));
        }
        let timeout = timeout.unwrap_or_else(|| self.inner.config.default_request_timeout());

        let shared = self.lock();
        if shared.session.state != ConnectionState::Online {
            return Err(RequestError::NotOnline);
        }

        let id = self.inner.ids.next().to_string();
        let to = stanza.to().cloned();
        let element = stanza.with_id(id.clone()).to_element();
        self.inner.router.insert(
            id.clone(),
            to,
            timeout,
            Box::new(move |outcome| on_complete(outcome, context)),
        );

        if let Err(error) = self.inner.sink.send(WireFrame::Element(element)) {
            self.inner.router.discard(&id);
            let reason = error.to_string();
            drop(shared);
            self.fail(error);
            return Err(RequestError::Transport(reason));
        }

        debug!(id = %id, ?timeout, "request sent");
        Ok(id)
    }

    /// Sends an IQ get or set and waits for its outcome.
    pub async fn request(
        &self,
        stanza: Stanza,
        timeout: Option<Duration>,
    ) -> Result<Stanza, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.send_request(stanza, timeout, tx, |outcome, tx| {
            let _ = tx.send(outcome);
        })?;
        rx.await.unwrap_or(Err(RequestError::Cancelled))
    }

    pub async fn get(&self, to: Option<Jid>, payload: Element) -> Result<Stanza, RequestError> {
        self.request(Stanza::iq(IqType::Get, to, Some(payload)), None)
            .await
    }

    pub async fn set(&self, to: Option<Jid>, payload: Element) -> Result<Stanza, RequestError> {
        self.request(Stanza::iq(IqType::Set, to, Some(payload)), None)
            .await
    }

    /// Cancels a pending request, completing it with `Cancelled`. Returns
    /// `false` if it had already completed.
    pub fn cancel(&self, id: &str) -> bool {
        let cancelled = self.inner.router.complete(id, Err(RequestError::Cancelled));
        if cancelled {
            debug!(id, "request cancelled");
        }
        cancelled
    }

    /// Sends a message or presence stanza, assigning an id if it has none.
    pub fn send_stanza(&self, stanza: Stanza) -> Result<String, RequestError> {
        if stanza.kind() == StanzaKind::Iq {
            return Err(RequestError::InvalidStanza(
                "use send_request or respond_* for iq stanzas".to_string(),
            ));
        }
        let (id, stanza) = match stanza.id() {
            Some(id) => (id.to_string(), stanza),
            None => {
                let id = self.inner.ids.next().to_string();
                (id.clone(), stanza.with_id(id))
            }
        };
        self.send_online(stanza.to_element())?;
        Ok(id)
    }

    /// Answers an inbound get or set with a result.
    pub fn respond_result(&self, request: &Stanza, payload: Option<Element>) -> Result<(), RequestError> {
        let id = request_id(request)?;
        let response = Stanza::iq(IqType::Result, request.from().cloned(), payload).with_id(id);
        self.send_online(response.to_element())
    }

    /// Answers an inbound get or set with a stanza error.
    pub fn respond_error(
        &self,
        request: &Stanza,
        condition: StanzaErrorCondition,
        error_type: StanzaErrorType,
        text: Option<&str>,
    ) -> Result<(), RequestError> {
        let id = request_id(request)?;
        let response = Stanza::iq(IqType::Error, request.from().cloned(), None)
            .with_id(id)
            .with_error(stanza_error_element(condition, error_type, text));
        self.send_online(response.to_element())
    }

    fn send_online(&self, element: Element) -> Result<(), RequestError> {
        let shared = self.lock();
        if shared.session.state != ConnectionState::Online {
            return Err(RequestError::NotOnline);
        }
        if let Err(error) = self.inner.sink.send(WireFrame::Element(element)) {
            let reason = error.to_string();
            drop(shared);
            self.fail(error);
            return Err(RequestError::Transport(reason));
        }
        Ok(())
    }
}

fn request_id(request: &Stanza) -> Result<&str, RequestError> {
    match (request.iq_type(), request.id()) {
        (Some(iq_type), Some(id)) if iq_type.is_request() => Ok(id),
        _ => Err(RequestError::InvalidStanza(
            "only iq get or set requests can be answered".to_string(),
        )),
    }
}

/// SASL payload text with the empty marker `=` mapped to an empty string.
fn payload_text(element: &Element) -> String {
    let text = element.text();
    match text.trim() {
        "=" => String::new(),
        other => other.to_string(),
    }
}

/// Empty SASL payloads are written as `=`.
fn wire_payload(payload: String) -> String {
    if payload.is_empty() {
        "=".to_string()
    } else {
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiating_states_are_bounded() {
        for state in [
            ConnectionState::Connecting,
            ConnectionState::NegotiatingStream,
            ConnectionState::NegotiatingSecurity,
            ConnectionState::Authenticating,
            ConnectionState::BindingResource,
        ] {
            assert!(state.is_negotiating(), "{state} should be bounded");
        }
        for state in [
            ConnectionState::Offline,
            ConnectionState::Online,
            ConnectionState::Closing,
            ConnectionState::Failed,
        ] {
            assert!(!state.is_negotiating(), "{state} should not be bounded");
        }
    }

    #[test]
    fn sasl_payload_markers() {
        let empty = Element::builder("challenge", ns::SASL).append("=").build();
        assert_eq!(payload_text(&empty), "");
        let bare = Element::bare("success", ns::SASL);
        assert_eq!(payload_text(&bare), "");
        assert_eq!(wire_payload(String::new()), "=");
        assert_eq!(wire_payload("abc".to_string()), "abc");
    }

    #[test]
    fn only_requests_can_be_answered() {
        let result = Stanza::iq(IqType::Result, None, None).with_id("r");
        assert!(matches!(
            request_id(&result),
            Err(RequestError::InvalidStanza(_))
        ));
        let get = Stanza::iq(IqType::Get, None, None).with_id("g");
        assert_eq!(request_id(&get).ok(), Some("g"));
    }
}
