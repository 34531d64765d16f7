//! Per-connection SMTP protocol state machine.
//!
//! A [`Session`] is a deterministic transition function over received
//! command lines: feeding it a line yields a [`Transition`] holding the
//! reply to send and the I/O action the connection driver must perform.
//! The machine itself never touches a socket, which keeps every protocol
//! rule unit-testable without one.

use crate::listener::Gateway;
use crate::types::{Command, Reply, ReplyCode};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use pushgate_core::dispatch::DeliveryOutcome;
use pushgate_core::route::Recipient;
use std::sync::Arc;

/// Transport policy of the listener that accepted the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Plaintext only; STARTTLS is refused.
    Plain,
    /// Plaintext that may be upgraded with STARTTLS.
    StartTls,
    /// TLS from the first byte.
    ImplicitTls,
}

/// Protocol phase of a session.
///
/// Phases advance monotonically within one mail transaction; completing or
/// aborting a transaction returns to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Connected (or freshly TLS-upgraded); waiting for EHLO/HELO.
    Greeting,
    /// Greeted; no transaction in progress.
    Ready,
    /// MAIL FROM accepted; waiting for recipients.
    MailFrom,
    /// At least one RCPT TO accepted; DATA is allowed.
    RcptTo,
    /// Collecting message data.
    Data,
    /// Connection is finished.
    Closed,
}

/// I/O action requested from the connection driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing beyond sending the reply.
    None,
    /// Send the reply, then perform the server-side TLS handshake.
    StartTls,
    /// Send the reply, then collect data lines until the lone-dot
    /// terminator.
    CollectData,
    /// Send the reply, then close the connection.
    Close,
}

/// Result of feeding one line to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Reply to write to the client.
    pub reply: Reply,
    /// Follow-up action for the driver.
    pub action: Action,
}

impl Transition {
    fn reply(reply: Reply) -> Self {
        Self {
            reply,
            action: Action::None,
        }
    }

    fn with_action(reply: Reply, action: Action) -> Self {
        Self { reply, action }
    }
}

/// In-flight AUTH exchange awaiting a continuation line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingAuth {
    /// AUTH PLAIN issued without an initial response.
    Plain,
    /// AUTH LOGIN issued; waiting for the username.
    LoginUser,
    /// AUTH LOGIN username received; waiting for the password.
    LoginPass {
        username: String,
    },
}

/// One SMTP session: protocol state plus the pending envelope.
#[derive(Debug)]
pub struct Session {
    gateway: Arc<Gateway>,
    transport: TransportMode,
    tls_available: bool,
    tls_active: bool,
    authenticated: bool,
    auth_failures: u8,
    violations: u8,
    state: State,
    sender: Option<String>,
    recipients: Vec<Recipient>,
    pending_auth: Option<PendingAuth>,
}

impl Session {
    /// Consecutive failed AUTH attempts before the connection is dropped.
    const MAX_AUTH_FAILURES: u8 = 3;
    /// Consecutive protocol violations before the connection is dropped.
    const MAX_VIOLATIONS: u8 = 10;
    /// Upper bound on accepted recipients per envelope.
    const MAX_RECIPIENTS: usize = 100;

    /// Creates a session for a connection accepted on a listener with the
    /// given transport mode. `tls_available` says whether the listener
    /// carries a certificate bundle for STARTTLS.
    #[must_use]
    pub fn new(transport: TransportMode, tls_available: bool, gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            transport,
            tls_available,
            tls_active: transport == TransportMode::ImplicitTls,
            authenticated: false,
            auth_failures: 0,
            violations: 0,
            state: State::Greeting,
            sender: None,
            recipients: Vec::new(),
            pending_auth: None,
        }
    }

    /// The 220 greeting emitted immediately after accept.
    #[must_use]
    pub fn greeting(&self) -> Reply {
        Reply::single(
            ReplyCode::SERVICE_READY,
            format!("{} pushgate ESMTP ready", self.gateway.hostname),
        )
    }

    /// Current protocol phase.
    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    /// Whether the client has authenticated.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Whether the channel is TLS-protected.
    #[must_use]
    pub const fn tls_active(&self) -> bool {
        self.tls_active
    }

    /// Feeds one received line to the machine.
    ///
    /// Lines are interpreted as commands unless an AUTH exchange is waiting
    /// for a continuation response.
    pub fn handle_line(&mut self, line: &str) -> Transition {
        if let Some(pending) = self.pending_auth.take() {
            return self.continue_auth(pending, line.trim());
        }
        self.handle(Command::parse(line))
    }

    /// Applies one parsed command to the machine.
    pub fn handle(&mut self, cmd: Command) -> Transition {
        match cmd {
            Command::Noop => self.accept(Reply::single(ReplyCode::OK, "OK")),
            Command::Quit => {
                self.state = State::Closed;
                Transition::with_action(
                    Reply::single(ReplyCode::CLOSING, "Bye"),
                    Action::Close,
                )
            }
            Command::Helo { hostname } => self.greet(&hostname, false),
            Command::Ehlo { hostname } => self.greet(&hostname, true),
            Command::StartTls => self.starttls(),
            Command::Auth {
                mechanism,
                initial_response,
            } => self.auth(&mechanism, initial_response),
            Command::MailFrom { path } => self.mail_from(path),
            Command::RcptTo { path } => self.rcpt_to(&path),
            Command::Data => self.data(),
            Command::Rset => {
                self.reset_transaction();
                self.accept(Reply::single(ReplyCode::OK, "OK"))
            }
            Command::Unknown(verb) => self.violation(Reply::single(
                ReplyCode::SYNTAX_ERROR,
                format!("Unrecognized command: {verb}"),
            )),
        }
    }

    /// Called by the driver after a successful TLS handshake.
    ///
    /// Everything negotiated over the plaintext channel is discarded:
    /// commands injected before the upgrade must not survive it.
    pub fn tls_established(&mut self) {
        self.tls_active = true;
        self.authenticated = false;
        self.auth_failures = 0;
        self.pending_auth = None;
        self.sender = None;
        self.recipients.clear();
        self.state = State::Greeting;
    }

    /// Takes the completed envelope at the end of DATA collection and
    /// returns the session to `Ready` for a subsequent message.
    pub fn take_envelope(&mut self) -> Option<(String, Vec<Recipient>)> {
        let sender = self.sender.take()?;
        let recipients = std::mem::take(&mut self.recipients);
        self.state = State::Ready;
        Some((sender, recipients))
    }

    /// Abandons the in-progress transaction (parse failure, RSET).
    pub fn reset_transaction(&mut self) {
        self.sender = None;
        self.recipients.clear();
        if self.state != State::Greeting {
            self.state = State::Ready;
        }
    }

    fn greet(&mut self, client_hostname: &str, extended: bool) -> Transition {
        self.reset_transaction();
        self.state = State::Ready;

        if !extended {
            return self.accept(Reply::single(
                ReplyCode::OK,
                self.gateway.hostname.clone(),
            ));
        }

        let mut lines = vec![format!(
            "{} greets {client_hostname}",
            self.gateway.hostname
        )];
        if self.starttls_pending() {
            // AUTH is withheld until the channel is upgraded.
            lines.push("STARTTLS".to_string());
        } else {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }
        lines.push("8BITMIME".to_string());

        self.accept(Reply::new(ReplyCode::OK, lines))
    }

    /// True when this listener wants an upgrade before offering AUTH.
    fn starttls_pending(&self) -> bool {
        self.transport == TransportMode::StartTls && !self.tls_active && self.tls_available
    }

    fn starttls(&mut self) -> Transition {
        if self.transport != TransportMode::StartTls {
            return self.violation(Reply::single(
                ReplyCode::NOT_IMPLEMENTED,
                "STARTTLS not supported on this listener",
            ));
        }
        if self.tls_active {
            return self.violation(Reply::single(
                ReplyCode::BAD_SEQUENCE,
                "TLS already active",
            ));
        }
        if !self.tls_available {
            return self.violation(Reply::single(
                ReplyCode::TLS_UNAVAILABLE,
                "TLS not available",
            ));
        }
        if self.authenticated || self.sender.is_some() {
            return self.violation(Reply::single(
                ReplyCode::BAD_SEQUENCE,
                "STARTTLS not allowed at this point",
            ));
        }

        self.violations = 0;
        Transition::with_action(
            Reply::single(ReplyCode::SERVICE_READY, "Ready to start TLS"),
            Action::StartTls,
        )
    }

    fn auth(&mut self, mechanism: &str, initial_response: Option<String>) -> Transition {
        if self.authenticated {
            return self.violation(Reply::single(
                ReplyCode::BAD_SEQUENCE,
                "Already authenticated",
            ));
        }
        if self.starttls_pending() {
            return self.violation(Reply::single(
                ReplyCode::ENCRYPTION_REQUIRED,
                "Run STARTTLS first",
            ));
        }
        if self.sender.is_some() {
            return self.violation(Reply::single(
                ReplyCode::BAD_SEQUENCE,
                "AUTH not allowed during a mail transaction",
            ));
        }

        match mechanism {
            "PLAIN" => match initial_response {
                Some(blob) => self.check_plain(&blob),
                None => {
                    self.pending_auth = Some(PendingAuth::Plain);
                    Transition::reply(Reply::new(ReplyCode::AUTH_CONTINUE, vec![]))
                }
            },
            "LOGIN" => {
                self.pending_auth = Some(PendingAuth::LoginUser);
                // "Username:" in base64
                Transition::reply(Reply::single(ReplyCode::AUTH_CONTINUE, "VXNlcm5hbWU6"))
            }
            _ => self.violation(Reply::single(
                ReplyCode::PARAMETER_NOT_IMPLEMENTED,
                format!("Unsupported AUTH mechanism: {mechanism}"),
            )),
        }
    }

    fn continue_auth(&mut self, pending: PendingAuth, line: &str) -> Transition {
        if line == "*" {
            return Transition::reply(Reply::single(
                ReplyCode::PARAMETER_ERROR,
                "Authentication cancelled",
            ));
        }

        match pending {
            PendingAuth::Plain => self.check_plain(line),
            PendingAuth::LoginUser => match decode_base64_text(line) {
                Some(username) => {
                    self.pending_auth = Some(PendingAuth::LoginPass { username });
                    // "Password:" in base64
                    Transition::reply(Reply::single(ReplyCode::AUTH_CONTINUE, "UGFzc3dvcmQ6"))
                }
                None => self.auth_error(Reply::single(
                    ReplyCode::PARAMETER_ERROR,
                    "Invalid base64 response",
                )),
            },
            PendingAuth::LoginPass { username } => match decode_base64_text(line) {
                Some(password) => self.finish_auth(&username, &password),
                None => self.auth_error(Reply::single(
                    ReplyCode::PARAMETER_ERROR,
                    "Invalid base64 response",
                )),
            },
        }
    }

    /// Decodes an AUTH PLAIN blob (`authzid NUL authcid NUL passwd`).
    fn check_plain(&mut self, blob: &str) -> Transition {
        let Ok(decoded) = BASE64.decode(blob.trim()) else {
            return self.auth_error(Reply::single(
                ReplyCode::PARAMETER_ERROR,
                "Invalid base64 response",
            ));
        };

        let fields: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
        if fields.len() != 3 {
            return self.auth_error(Reply::single(
                ReplyCode::PARAMETER_ERROR,
                "Malformed AUTH PLAIN response",
            ));
        }

        let username = String::from_utf8_lossy(fields[1]).into_owned();
        let password = String::from_utf8_lossy(fields[2]).into_owned();
        self.finish_auth(&username, &password)
    }

    fn finish_auth(&mut self, username: &str, password: &str) -> Transition {
        // With no credential store configured, authentication is a formality.
        let credentials = &self.gateway.credentials;
        if credentials.is_empty() || credentials.validate(username, password) {
            self.authenticated = true;
            self.auth_failures = 0;
            return self.accept(Reply::single(
                ReplyCode::AUTH_OK,
                "Authentication successful",
            ));
        }

        self.auth_error(Reply::single(
            ReplyCode::AUTH_FAILED,
            "Authentication credentials invalid",
        ))
    }

    fn auth_error(&mut self, reply: Reply) -> Transition {
        self.auth_failures += 1;
        if self.auth_failures >= Self::MAX_AUTH_FAILURES {
            self.state = State::Closed;
            return Transition::with_action(
                Reply::single(
                    ReplyCode::SERVICE_UNAVAILABLE,
                    "Too many failed authentication attempts",
                ),
                Action::Close,
            );
        }
        Transition::reply(reply)
    }

    fn mail_from(&mut self, path: String) -> Transition {
        if self.state == State::Greeting {
            return self.violation(Reply::single(
                ReplyCode::BAD_SEQUENCE,
                "Send EHLO/HELO first",
            ));
        }
        if !self.gateway.credentials.is_empty() && !self.authenticated {
            return self.violation(Reply::single(
                ReplyCode::AUTH_REQUIRED,
                "Authentication required",
            ));
        }

        // MAIL FROM begins a fresh envelope, discarding any previous one.
        self.sender = Some(path);
        self.recipients.clear();
        self.state = State::MailFrom;
        self.accept(Reply::single(ReplyCode::OK, "OK"))
    }

    fn rcpt_to(&mut self, path: &str) -> Transition {
        if !matches!(self.state, State::MailFrom | State::RcptTo) {
            return self.violation(Reply::single(
                ReplyCode::BAD_SEQUENCE,
                "Need MAIL before RCPT",
            ));
        }
        if self.recipients.len() >= Self::MAX_RECIPIENTS {
            return Transition::reply(Reply::single(
                ReplyCode::EXCEEDED_STORAGE,
                "Too many recipients",
            ));
        }

        match self.gateway.router.route(path) {
            Ok(recipient) => {
                self.recipients.push(recipient);
                self.state = State::RcptTo;
                self.accept(Reply::single(ReplyCode::OK, "OK"))
            }
            // A bad recipient does not abort the envelope.
            Err(e) => Transition::reply(Reply::single(
                ReplyCode::MAILBOX_UNAVAILABLE,
                e.to_string(),
            )),
        }
    }

    fn data(&mut self) -> Transition {
        if self.state != State::RcptTo {
            return self.violation(Reply::single(
                ReplyCode::BAD_SEQUENCE,
                "Need RCPT before DATA",
            ));
        }

        self.state = State::Data;
        self.violations = 0;
        Transition::with_action(
            Reply::single(ReplyCode::START_DATA, "End data with <CR><LF>.<CR><LF>"),
            Action::CollectData,
        )
    }

    fn accept(&mut self, reply: Reply) -> Transition {
        self.violations = 0;
        Transition::reply(reply)
    }

    fn violation(&mut self, reply: Reply) -> Transition {
        self.violations += 1;
        if self.violations >= Self::MAX_VIOLATIONS {
            self.state = State::Closed;
            return Transition::with_action(
                Reply::single(ReplyCode::SERVICE_UNAVAILABLE, "Too many protocol errors"),
                Action::Close,
            );
        }
        Transition::reply(reply)
    }
}

/// Builds the DATA-phase reply from per-recipient delivery outcomes.
///
/// All recipients accepted yields a plain 250; partial failure yields a
/// multi-line 250 enumerating the failed recipients; no acceptance at all
/// yields 554 (any permanent failure present) or 451 (all transient).
#[must_use]
pub fn data_reply(recipients: &[Recipient], outcomes: &[DeliveryOutcome]) -> Reply {
    let delivered = outcomes.iter().filter(|o| o.is_delivered()).count();
    let total = outcomes.len();

    if delivered == total {
        return Reply::single(ReplyCode::OK, "OK");
    }

    let mut lines = Vec::new();
    if delivered > 0 {
        lines.push(format!("Delivered to {delivered} of {total} recipients"));
    }
    for (recipient, outcome) in recipients.iter().zip(outcomes) {
        match outcome {
            DeliveryOutcome::Delivered => {}
            DeliveryOutcome::Rejected(reason) => {
                lines.push(format!("{}: rejected: {reason}", recipient.raw));
            }
            DeliveryOutcome::Deferred(reason) => {
                lines.push(format!("{}: deferred: {reason}", recipient.raw));
            }
        }
    }

    if delivered > 0 {
        Reply::new(ReplyCode::OK, lines)
    } else if outcomes
        .iter()
        .any(|o| matches!(o, DeliveryOutcome::Rejected(_)))
    {
        Reply::new(ReplyCode::TRANSACTION_FAILED, lines)
    } else {
        Reply::new(ReplyCode::LOCAL_ERROR, lines)
    }
}

fn decode_base64_text(line: &str) -> Option<String> {
    let decoded = BASE64.decode(line.trim()).ok()?;
    Some(String::from_utf8_lossy(&decoded).into_owned())
}
