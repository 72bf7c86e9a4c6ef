//! Session socket
//!
//! The [`SessionSocket`] owns every session created on one SIP stack. It
//! routes what the transaction layer delivers (requests, responses, CANCELs)
//! to the right session, hands new INVITEs to the [`ConnectHandler`] and
//! dispatches timer expiries. Events can be pushed in directly through the
//! `handle_*` methods or pumped by [`SessionSocket::run`].

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::errors::{SessionError, SessionResult};
use crate::handler::{ConnectHandler, TerminationCause};
use crate::message::{Method, SipRequest, SipResponse, reason_phrase};
use crate::registry::Registry;
use crate::session::Session;
use crate::timer::{TimerEvent, TimerService, TimerTarget};
use crate::transport::{InboundEvent, InboundSource, SipTransport, TransactionKey, TransactionOutcome};

/// State shared between the socket handle and its sessions
pub(crate) struct SocketInner {
    pub transport: Arc<dyn SipTransport>,
    pub registry: Registry,
    pub config: SessionConfig,
    pub timers: TimerService,
    timer_rx: Mutex<Option<mpsc::UnboundedReceiver<TimerEvent>>>,
    connect_handler: RwLock<Option<Arc<dyn ConnectHandler>>>,
}

impl SocketInner {
    /// Add the headers every response we generate carries
    pub fn decorate(&self, mut response: SipResponse) -> SipResponse {
        if let Some(server) = &self.config.user_agent {
            if response.header("Server").is_none() {
                response = response.with_header("Server", server.clone());
            }
        }
        response
    }

    pub fn response(&self, request: &SipRequest, status: u16, reason: &str) -> SipResponse {
        self.decorate(SipResponse::for_request(request, status, reason))
    }

    /// Send `response` to `request` on a new server transaction
    pub fn reply(&self, request: &SipRequest, response: SipResponse) -> SessionResult<()> {
        let key = self.transport.start_server_transaction(request)?;
        self.transport.send_reply(&key, response)
    }

    /// Reply with a bare status; failures are only logged
    pub fn reply_status(&self, request: &SipRequest, status: u16, reason: &str) {
        let response = self.response(request, status, reason);
        if let Err(e) = self.reply(request, response) {
            warn!(call_id = %request.call_id, status, error = %e, "failed to send reply");
        }
    }
}

/// Handle to a session socket; clones share the same sessions
#[derive(Clone)]
pub struct SessionSocket {
    pub(crate) inner: Arc<SocketInner>,
}

impl std::fmt::Debug for SessionSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSocket")
            .field("sessions", &self.inner.registry.session_count())
            .finish()
    }
}

impl SessionSocket {
    /// Create a socket sending through `transport`
    pub fn new(transport: Arc<dyn SipTransport>, config: SessionConfig) -> SessionResult<Self> {
        config.validate()?;
        let (timers, timer_rx) = TimerService::new();
        info!(
            t1_ms = config.t1_ms,
            rel100 = ?config.rel100,
            "session socket created"
        );
        Ok(Self {
            inner: Arc::new(SocketInner {
                transport,
                registry: Registry::new(),
                config,
                timers,
                timer_rx: Mutex::new(Some(timer_rx)),
                connect_handler: RwLock::new(None),
            }),
        })
    }

    /// Install the handler offered new incoming INVITEs
    ///
    /// Without one, new INVITEs are answered 480.
    pub fn set_connect_handler(&self, handler: Arc<dyn ConnectHandler>) {
        *self.inner.connect_handler.write() = Some(handler);
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Session an in-dialog request belongs to
    pub fn find(&self, request: &SipRequest) -> Option<Session> {
        self.inner.registry.find(request)
    }

    pub fn session_count(&self) -> usize {
        self.inner.registry.session_count()
    }

    /// Offer an incoming request to the sessions
    ///
    /// Returns false when the request is not session business (no dialog
    /// match and not a new INVITE) so the caller can route it elsewhere.
    pub fn handle_request(&self, request: SipRequest) -> bool {
        let inner = &self.inner;
        trace!(call_id = %request.call_id, method = %request.method, "request received");

        if request.to.tag.is_none() {
            if request.method != Method::Invite {
                return false;
            }
            if inner.registry.find_initial(&request).is_some() {
                debug!(call_id = %request.call_id, "INVITE retransmission ignored");
                return true;
            }
            let handler = inner.connect_handler.read().clone();
            match handler {
                Some(handler) => handler.on_connect(self, &request),
                None => {
                    info!(call_id = %request.call_id, "no connect handler, rejecting INVITE");
                    inner.reply_status(&request, 480, reason_phrase(480));
                }
            }
            return true;
        }

        match inner.registry.find(&request) {
            Some(session) => {
                session.handle_request(inner, &request);
                true
            }
            None if request.method == Method::Ack => false,
            None => {
                debug!(call_id = %request.call_id, method = %request.method, "no dialog for request");
                inner.reply_status(&request, 481, reason_phrase(481));
                true
            }
        }
    }

    /// Progress or completion of a client transaction a session started
    pub fn handle_response(&self, transaction: &TransactionKey, outcome: TransactionOutcome) -> bool {
        match self.inner.registry.session_for(transaction) {
            Some(session) => {
                session.handle_outcome(transaction, outcome);
                true
            }
            None => match outcome {
                TransactionOutcome::Response(response) => self.handle_stray_response(&response),
                _ => false,
            },
        }
    }

    /// Response outside any transaction; retransmitted 2xx get their ACK
    pub fn handle_stray_response(&self, response: &SipResponse) -> bool {
        if !response.is_success() || response.cseq.method != Method::Invite {
            return false;
        }
        match self.ack_again(response) {
            Ok(()) => true,
            Err(e) => {
                debug!(call_id = %response.call_id, error = %e, "stray 2xx not acknowledged");
                false
            }
        }
    }

    /// CANCEL for a pending INVITE server transaction
    ///
    /// The transaction layer answers the CANCEL itself; the session answers
    /// the INVITE with 487.
    pub fn handle_cancel(&self, transaction: &TransactionKey, request: &SipRequest) -> bool {
        match self.inner.registry.session_for(transaction) {
            Some(session) => {
                session.handle_cancel(request);
                true
            }
            None => false,
        }
    }

    pub fn handle_event(&self, event: InboundEvent) -> bool {
        match event {
            InboundEvent::Request(request) => self.handle_request(request),
            InboundEvent::Response { transaction, outcome } => self.handle_response(&transaction, outcome),
            InboundEvent::StrayResponse(response) => self.handle_stray_response(&response),
            InboundEvent::Cancel { transaction, request } => self.handle_cancel(&transaction, &request),
        }
    }

    fn handle_timer(&self, event: TimerEvent) {
        trace!(id = ?event.id, target = ?event.target, "timer fired");
        match event.target {
            TimerTarget::Reply(session) => {
                if let Some(session) = session.upgrade() {
                    session.on_reply_timer(event.id);
                }
            }
            TimerTarget::Request(session) => {
                if let Some(session) = session.upgrade() {
                    session.on_request_timer(event.id);
                }
            }
            TimerTarget::Glare(session) => {
                if let Some(session) = session.upgrade() {
                    session.on_glare_timer(event.id);
                }
            }
            TimerTarget::Ack(key) => self.inner.registry.expire_ack(&key, event.id),
        }
    }

    /// Dispatch timers that have already fired
    ///
    /// For applications driving the socket through the `handle_*` methods
    /// instead of [`SessionSocket::run`]. Returns the number dispatched.
    pub fn process_timers(&self) -> usize {
        let events: Vec<TimerEvent> = {
            let mut guard = self.inner.timer_rx.lock();
            let Some(rx) = guard.as_mut() else { return 0 };
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        let count = events.len();
        for event in events {
            self.handle_timer(event);
        }
        count
    }

    /// Process inbound events and timers until `source` closes
    pub async fn run<S: InboundSource>(&self, mut source: S) -> SessionResult<()> {
        let mut timer_rx = self
            .inner
            .timer_rx
            .lock()
            .take()
            .ok_or_else(|| SessionError::config("session socket is already running"))?;

        info!("session socket running");
        loop {
            tokio::select! {
                event = source.next_event() => match event {
                    Some(event) => {
                        self.handle_event(event);
                    }
                    None => break,
                },
                Some(event) = timer_rx.recv() => self.handle_timer(event),
            }
        }

        *self.inner.timer_rx.lock() = Some(timer_rx);
        info!("inbound source closed, session socket stopped");
        Ok(())
    }

    /// Close every session without calling their handlers
    pub fn close_all(&self) {
        let sessions = self.inner.registry.all();
        info!(count = sessions.len(), "closing all sessions");
        for session in sessions {
            session.close();
            session.shutdown(TerminationCause::Local);
        }
        self.inner.registry.clear();
    }
}
