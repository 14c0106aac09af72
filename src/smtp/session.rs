//! Session state machine: the SMTP dialog itself — banner, EHLO/HELO,
//! capability discovery, STARTTLS, AUTH, the per-task
//! MAIL/RCPT/DATA/BODY/EOM loop, RSET, QUIT. Classifies replies into
//! per-envelope outcomes via [`Accounting`].
//!
//! Structured as a plain `loop { match self.state { ... } }` rather than a
//! chain of recursive calls: each arm sends the command that state owns,
//! awaits its reply, and assigns `self.state` for the next spin. This
//! keeps the dialog reentrant without relying on tail-call elimination or
//! deep call stacks for a long-running conversation.

use crate::collab::{CertAuthority, Relay, Route};
use crate::config::{RelayPolicy, SecurityPolicy, SessionConfig};
use crate::error::{MtaError, Result};
use crate::smtp::accounting::Accounting;
use crate::smtp::body::BodyStreamer;
use crate::smtp::codec::{self, ReplyLine};
use crate::smtp::loopcheck::LoopCheck;
use crate::smtp::stream::ByteStream;
use crate::smtp::supervisor::Collaborators;
use crate::smtp::task::{Task, Verdict};
use crate::smtp::tls::{ConnectMode, TlsController};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// One state of the SMTP dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Banner,
    Ehlo,
    Helo,
    StartTls,
    Auth,
    Ready,
    Mail,
    Rcpt,
    Data,
    Body,
    Eom,
    Rset,
    Quit,
}

/// Capability bits learned from the EHLO response.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub start_tls: bool,
    pub auth: bool,
    pub pipelining: bool,
}

/// The independent policy/credential/runtime bits a session tracks across
/// its lifetime. Policy bits are fixed for the session's lifetime, derived
/// once from the relay's [`RelayPolicy`]; runtime bits (`tls_tried`,
/// `tls_active`, `peer_verified`) mutate as the dialog progresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionFlags {
    pub force_any_ssl: bool,
    pub force_smtps: bool,
    pub force_tls: bool,
    pub force_plain: bool,
    pub want_secure: bool,
    pub use_auth: bool,
    pub use_client_cert: bool,
    pub tls_tried: bool,
    pub tls_active: bool,
    pub peer_verified: bool,
}

impl SessionFlags {
    fn from_policy(policy: &RelayPolicy) -> Self {
        Self {
            force_any_ssl: matches!(policy.security, SecurityPolicy::ForceAnySsl),
            force_smtps: matches!(policy.security, SecurityPolicy::ForceSmtps),
            force_tls: matches!(policy.security, SecurityPolicy::ForceTls),
            force_plain: matches!(policy.security, SecurityPolicy::ForcePlain),
            want_secure: policy.security.want_secure(),
            use_auth: policy.secret.is_some(),
            use_client_cert: policy.client_cert_name.is_some(),
            tls_tried: false,
            tls_active: false,
            peer_verified: false,
        }
    }
}

/// Result of a session that ran to completion (reached `Quit` on its own
/// terms, whether or not it ever delivered anything).
#[derive(Debug, Clone, Copy)]
pub struct SessionOutcome {
    pub reached_ready: bool,
    pub delivered_count: u32,
}

/// A session-ending failure, carrying enough for the supervisor to decide
/// whether the reconnection ladder applies. Kept distinct from a
/// connect-time failure so the two can be handled by separate error
/// sinks — one retryable, one terminal.
#[derive(Debug, Clone)]
pub struct SessionFailure {
    pub message: String,
    pub retryable: bool,
    pub reached_ready: bool,
}

impl std::fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

type StepResult<T> = std::result::Result<T, SessionFailure>;

/// One TCP connection attempt and its protocol dialog.
pub struct Session {
    pub id: u64,
    relay: Arc<Relay>,
    route: Arc<Route>,
    state: SessionState,
    flags: SessionFlags,
    capabilities: Capabilities,
    mode: ConnectMode,
    hostname: String,
    max_line_length: usize,
    hop_limit: u32,
    max_messages_per_session: u32,
    stream: ByteStream,
    task: Option<Task>,
    content: Option<crate::collab::ContentHandle>,
    rcpt_cursor: usize,
    delivered_count: u32,
    reached_ready: bool,
}

impl Session {
    pub fn new(
        id: u64,
        relay: Arc<Relay>,
        route: Arc<Route>,
        stream: ByteStream,
        mode: ConnectMode,
        config: &SessionConfig,
    ) -> Self {
        let flags = SessionFlags::from_policy(&relay.policy);
        Self {
            id,
            relay,
            route,
            state: SessionState::Init,
            flags,
            capabilities: Capabilities::default(),
            mode,
            hostname: config.hostname.clone(),
            max_line_length: config.max_line_length,
            hop_limit: config.hop_limit,
            max_messages_per_session: config.max_messages_per_session,
            stream,
            task: None,
            content: None,
            rcpt_cursor: 0,
            delivered_count: 0,
            reached_ready: false,
        }
    }

    /// Drive the dialog to completion: either a clean `Quit` or a
    /// [`SessionFailure`] the supervisor uses to decide on reconnection.
    pub async fn run(&mut self, collabs: &Collaborators) -> StepResult<SessionOutcome> {
        loop {
            match self.state {
                SessionState::Init => {
                    if self.mode.uses_implicit_tls() {
                        if let Err(e) = self.perform_tls_handshake(&collabs.ca).await {
                            return Err(self.fail(collabs, e.to_string(), true).await);
                        }
                    }
                    self.state = SessionState::Banner;
                }

                SessionState::Banner => {
                    let reply = self.next_single_reply(collabs).await?;
                    if reply.class().is_ok2() {
                        let hostname = self.hostname.clone();
                        self.capabilities = Capabilities::default();
                        self.send(collabs, "EHLO", Some(&hostname)).await?;
                        self.state = SessionState::Ehlo;
                    } else {
                        return Err(self
                            .fail(collabs, format!("banner rejected: {} {}", reply.code, reply.text), false)
                            .await);
                    }
                }

                SessionState::Ehlo => {
                    let reply = self.next_single_reply(collabs).await?;
                    if reply.class().is_ok2() {
                        self.state = if self.flags.force_plain {
                            SessionState::Ready
                        } else {
                            SessionState::StartTls
                        };
                    } else if self.flags.want_secure || self.flags.use_auth {
                        return Err(self
                            .fail(collabs, format!("EHLO rejected: {} {}", reply.code, reply.text), false)
                            .await);
                    } else {
                        let hostname = self.hostname.clone();
                        self.send(collabs, "HELO", Some(&hostname)).await?;
                        self.state = SessionState::Helo;
                    }
                }

                SessionState::Helo => {
                    let reply = self.next_single_reply(collabs).await?;
                    if reply.class().is_ok2() {
                        self.state = SessionState::Ready;
                    } else {
                        return Err(self
                            .fail(collabs, format!("HELO rejected: {} {}", reply.code, reply.text), false)
                            .await);
                    }
                }

                SessionState::StartTls => {
                    if self.flags.tls_active {
                        self.state = SessionState::Auth;
                    } else if !self.capabilities.start_tls {
                        if self.flags.want_secure {
                            return Err(self
                                .fail(
                                    collabs,
                                    "TLS required but not supported by remote host".to_string(),
                                    true,
                                )
                                .await);
                        }
                        self.state = SessionState::Auth;
                    } else {
                        self.send(collabs, "STARTTLS", None).await?;
                        let reply = self.next_single_reply(collabs).await?;
                        if reply.class().is_ok2() {
                            if let Err(e) = self.perform_tls_handshake(&collabs.ca).await {
                                return Err(self.fail(collabs, e.to_string(), true).await);
                            }
                            self.state = SessionState::Ehlo;
                            let hostname = self.hostname.clone();
                            self.capabilities = Capabilities::default();
                            self.send(collabs, "EHLO", Some(&hostname)).await?;
                        } else if !self.flags.want_secure {
                            self.flags.tls_tried = true;
                            self.state = SessionState::Auth;
                        } else {
                            return Err(self
                                .fail(
                                    collabs,
                                    format!("STARTTLS rejected: {} {}", reply.code, reply.text),
                                    false,
                                )
                                .await);
                        }
                    }
                }

                SessionState::Auth => {
                    if self.flags.use_auth {
                        if self.flags.tls_active {
                            let secret = self.relay.policy.secret.clone().unwrap_or_default();
                            let arg = format!("PLAIN {}", secret);
                            self.send(collabs, "AUTH", Some(&arg)).await?;
                            let reply = self.next_single_reply(collabs).await?;
                            if reply.class().is_ok2() {
                                self.state = SessionState::Ready;
                            } else {
                                return Err(self
                                    .fail(
                                        collabs,
                                        format!("AUTH rejected: {} {}", reply.code, reply.text),
                                        false,
                                    )
                                    .await);
                            }
                        } else {
                            return Err(self
                                .fail(collabs, "refusing to AUTH over an insecure channel".to_string(), false)
                                .await);
                        }
                    } else {
                        self.state = SessionState::Ready;
                    }
                }

                SessionState::Ready => {
                    if !self.reached_ready {
                        self.reached_ready = true;
                        collabs.route_manager.route_ok(&self.relay, &self.route);
                    }

                    if self.delivered_count >= self.max_messages_per_session {
                        self.state = SessionState::Quit;
                        continue;
                    }

                    let task = match collabs.route_manager.next_task(&self.relay, &self.route) {
                        Some(t) => t,
                        None => {
                            self.state = SessionState::Quit;
                            continue;
                        }
                    };

                    collabs.metrics.task_started();
                    collabs.metrics.envelope_added(task.envelopes.len() as i64);
                    self.task = Some(task);

                    let message_id = self.task.as_ref().unwrap().message_id;
                    let mut content = match collabs.queue.open_content(message_id).await {
                        Ok(c) => c,
                        Err(e) => {
                            self.flush(collabs, Verdict::TempFail, &e.to_string()).await?;
                            self.state = SessionState::Ready;
                            continue;
                        }
                    };

                    let count = match LoopCheck::count_received_headers(&mut content, self.hop_limit).await {
                        Ok(c) => c,
                        Err(e) => {
                            self.content = Some(content);
                            self.flush(collabs, Verdict::TempFail, &e.to_string()).await?;
                            self.state = SessionState::Ready;
                            continue;
                        }
                    };

                    if LoopCheck::exceeds(count, self.hop_limit) {
                        self.content = Some(content);
                        self.flush(collabs, Verdict::Loop, "Loop detected").await?;
                        self.state = SessionState::Ready;
                        continue;
                    }

                    self.content = Some(content);
                    self.rcpt_cursor = 0;
                    self.state = SessionState::Mail;
                }

                SessionState::Mail => {
                    let arg = format!("FROM:<{}>", self.task.as_ref().expect("task attached entering Mail").sender);
                    self.send(collabs, "MAIL", Some(&arg)).await?;
                    let reply = self.next_single_reply(collabs).await?;
                    if reply.class().is_ok2() {
                        self.state = SessionState::Rcpt;
                    } else {
                        let verdict = Verdict::from_reply_class(reply.class().first_digit());
                        let message = format!("{} {}", reply.code, reply.text);
                        self.flush(collabs, verdict, &message).await?;
                        self.state = SessionState::Rset;
                    }
                }

                SessionState::Rcpt => {
                    let idx = self.rcpt_cursor;
                    let arg = format!(
                        "TO:<{}>",
                        self.task.as_ref().expect("task attached entering Rcpt").envelopes[idx].recipient
                    );
                    self.send(collabs, "RCPT", Some(&arg)).await?;
                    let reply = self.next_single_reply(collabs).await?;
                    self.rcpt_cursor += 1;

                    if reply.class().is_ok2() {
                        let len = self.task.as_ref().unwrap().envelopes.len();
                        self.state = if self.rcpt_cursor >= len { SessionState::Data } else { SessionState::Rcpt };
                    } else {
                        let verdict = Verdict::from_reply_class(reply.class().first_digit());
                        let message = format!("{} {}", reply.code, reply.text);
                        {
                            let task = self.task.as_mut().unwrap();
                            Accounting::envelope_fail(&mut task.envelopes[idx], verdict, &message);
                        }
                        let all_resolved = self.task.as_ref().unwrap().envelopes.iter().all(|e| e.verdict.is_some());
                        if all_resolved {
                            self.flush(collabs, Verdict::Ok, "No envelope").await?;
                            self.state = SessionState::Rset;
                        } else {
                            let len = self.task.as_ref().unwrap().envelopes.len();
                            self.state = if self.rcpt_cursor >= len { SessionState::Data } else { SessionState::Rcpt };
                        }
                    }
                }

                SessionState::Data => {
                    self.send(collabs, "DATA", None).await?;
                    let reply = self.next_single_reply(collabs).await?;
                    if reply.class().is_ok23() {
                        self.state = SessionState::Body;
                    } else {
                        let verdict = Verdict::from_reply_class(reply.class().first_digit());
                        let message = format!("{} {}", reply.code, reply.text);
                        self.flush(collabs, verdict, &message).await?;
                        self.state = SessionState::Rset;
                    }
                }

                SessionState::Body => {
                    let mut content = self.content.take().expect("content attached entering Body");
                    match BodyStreamer::stream(&mut content, &mut self.stream).await {
                        Ok(()) => {
                            self.state = SessionState::Eom;
                        }
                        Err(e) => {
                            self.flush(collabs, Verdict::TempFail, &e.to_string()).await?;
                            return Err(self.fail(collabs, e.to_string(), false).await);
                        }
                    }
                }

                SessionState::Eom => {
                    self.send(collabs, ".", None).await?;
                    let reply = self.next_single_reply(collabs).await?;
                    if reply.class().is_ok2() {
                        self.delivered_count += 1;
                        let message = format!("{} {}", reply.code, reply.text);
                        self.flush(collabs, Verdict::Ok, &message).await?;
                    } else {
                        let verdict = Verdict::from_reply_class(reply.class().first_digit());
                        let message = format!("{} {}", reply.code, reply.text);
                        self.flush(collabs, verdict, &message).await?;
                    }
                    self.state = SessionState::Ready;
                }

                SessionState::Rset => {
                    self.send(collabs, "RSET", None).await?;
                    let _ = self.next_single_reply(collabs).await?;
                    self.state = SessionState::Ready;
                }

                SessionState::Quit => {
                    self.send(collabs, "QUIT", None).await?;
                    let _ = self.stream.read_line(self.max_line_length).await;
                    return Ok(SessionOutcome {
                        reached_ready: self.reached_ready,
                        delivered_count: self.delivered_count,
                    });
                }
            }
        }
    }

    /// Acquire credentials (if configured), perform the TLS handshake,
    /// and hand any peer certificate to the CA helper for out-of-process
    /// verification. Shared by the implicit-SMTPS path (`Init`) and the
    /// mid-dialog STARTTLS path.
    async fn perform_tls_handshake(&mut self, ca: &Arc<dyn CertAuthority>) -> Result<()> {
        let tls = TlsController::new(ca.clone());
        let cert_name = self.relay.policy.client_cert_name.clone();
        let config = tls.build_context(cert_name.as_deref()).await?;
        let tcp = self.stream.take_plain_tcp_stream()?;
        let (tls_stream, chain) = tls.handshake(tcp, &self.relay.name, config).await?;
        self.stream.upgrade(tls_stream);
        self.flags.tls_active = true;
        self.flags.tls_tried = true;

        if let Some((leaf, rest)) = chain.split_first() {
            self.stream.pause_input();
            let outcome = ca.verify_peer(leaf.clone(), rest.to_vec()).await?;
            self.flags.peer_verified = outcome.verified;
            info!(
                session_id = self.id,
                verified = outcome.verified,
                "peer certificate verification result (logged, not enforced)"
            );
            self.stream.resume_input();
        }
        Ok(())
    }

    /// Flush the attached task (if any) with `verdict`/`message` and
    /// release its content handle. A no-op if no task is attached.
    async fn flush(&mut self, collabs: &Collaborators, verdict: Verdict, message: &str) -> StepResult<()> {
        if let Some(task) = self.task.take() {
            if let Err(e) = Accounting::flush_task(&*collabs.queue, &collabs.metrics, &task, verdict, message).await
            {
                return Err(self.fail(collabs, e.to_string(), false).await);
            }
        }
        self.content = None;
        Ok(())
    }

    /// The single error funnel: flush any outstanding task as `TempFail`,
    /// report a route error, and hand back a [`SessionFailure`] the
    /// supervisor uses to decide on reconnection.
    async fn fail(&mut self, collabs: &Collaborators, message: String, retryable: bool) -> SessionFailure {
        if let Some(task) = self.task.take() {
            let _ =
                Accounting::flush_task(&*collabs.queue, &collabs.metrics, &task, Verdict::TempFail, &message).await;
        }
        self.content = None;
        collabs.route_manager.route_error(&self.relay, &self.route, &message);
        error!(session_id = self.id, retryable, "{}", message);
        SessionFailure {
            message,
            retryable,
            reached_ready: self.reached_ready,
        }
    }

    async fn next_line(&mut self, collabs: &Collaborators) -> StepResult<String> {
        match self.stream.read_line(self.max_line_length).await {
            Ok(Some(line)) => Ok(line),
            Ok(None) => Err(self.fail(collabs, "connection closed unexpectedly".to_string(), true).await),
            Err(e) => {
                let retryable = matches!(e, MtaError::Io(_) | MtaError::Timeout);
                Err(self.fail(collabs, e.to_string(), retryable).await)
            }
        }
    }

    /// Read one full (possibly multi-line) SMTP reply, ingesting EHLO
    /// capability tokens as they go by, then enforce the anti-smuggling
    /// invariant: no unread bytes may remain once the reply is complete.
    /// A remote that tries to speak out of turn is treated as protocol
    /// corruption, not pipelining.
    async fn next_reply(&mut self, collabs: &Collaborators) -> StepResult<Vec<ReplyLine>> {
        let mut lines = Vec::new();
        loop {
            let raw = self.next_line(collabs).await?;
            let parsed = match codec::parse_reply_line(&raw) {
                Ok(p) => p,
                Err(e) => return Err(self.fail(collabs, e.to_string(), false).await),
            };
            trace!(session_id = self.id, "<<< {} {}", parsed.code, parsed.text);
            if matches!(self.state, SessionState::Ehlo) {
                self.ingest_capability(&parsed.text);
            }
            let cont = parsed.is_continuation();
            lines.push(parsed);
            if !cont {
                break;
            }
        }
        if self.stream.has_buffered_input() {
            return Err(self
                .fail(collabs, "remote host sent unsolicited extra data".to_string(), false)
                .await);
        }
        Ok(lines)
    }

    async fn next_single_reply(&mut self, collabs: &Collaborators) -> StepResult<ReplyLine> {
        let mut lines = self.next_reply(collabs).await?;
        Ok(lines.pop().expect("next_reply always yields at least one line"))
    }

    async fn send(&mut self, collabs: &Collaborators, verb: &str, arg: Option<&str>) -> StepResult<()> {
        let cmd = match codec::CommandBuilder::build(verb, arg) {
            Ok(c) => c,
            Err(e) => return Err(self.fail(collabs, e.to_string(), false).await),
        };
        debug!(session_id = self.id, ">>> {}", String::from_utf8_lossy(&cmd).trim_end());
        match self.stream.write_line(&cmd).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let retryable = matches!(e, MtaError::Io(_) | MtaError::Timeout);
                Err(self.fail(collabs, e.to_string(), retryable).await)
            }
        }
    }

    /// Ingest one EHLO continuation line's capability token: exact match
    /// `STARTTLS`/`PIPELINING`, prefix match `AUTH`. Case-sensitive.
    fn ingest_capability(&mut self, text: &str) {
        if text == "STARTTLS" {
            self.capabilities.start_tls = true;
        } else if text.starts_with("AUTH") {
            self.capabilities.auth = true;
        } else if text == "PIPELINING" {
            self.capabilities.pipelining = true;
        }
    }
}
