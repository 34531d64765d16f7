//! Connection driver: executes the session state machine over a socket.
//!
//! The driver owns all I/O. It feeds received lines to the [`Session`],
//! writes the replies back, and performs the actions the machine requests
//! (TLS handshake, DATA collection, close). Every wait is bounded by a
//! phase-specific timeout.

mod stream;

pub use stream::SmtpStream;

use crate::listener::Gateway;
use crate::session::{self, Action, Session, TransportMode};
use crate::types::{Reply, ReplyCode};
use crate::{Error, Result};
use pushgate_mime::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Idle timeout while waiting for the next command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);
/// Idle timeout between DATA lines.
const DATA_TIMEOUT: Duration = Duration::from_secs(120);
/// TLS handshake timeout (implicit TLS and STARTTLS).
const TLS_TIMEOUT: Duration = Duration::from_secs(30);

/// Serves one accepted connection to completion.
///
/// # Errors
///
/// Returns an error when the connection dies outside the protocol: peer
/// disconnect, I/O failure, TLS handshake failure, or a phase timeout.
/// Protocol-level refusals are handled with replies and are not errors.
pub async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    mode: TransportMode,
    tls: Option<TlsAcceptor>,
    gateway: Arc<Gateway>,
) -> Result<()> {
    debug!(%peer, ?mode, "connection accepted");

    let mut smtp = match mode {
        TransportMode::ImplicitTls => {
            let acceptor = tls.as_ref().ok_or_else(|| {
                Error::Config("implicit TLS connection without certificate".to_string())
            })?;
            timeout(TLS_TIMEOUT, SmtpStream::tls(stream, acceptor))
                .await
                .map_err(|_| Error::Timeout("TLS handshake"))??
        }
        TransportMode::Plain | TransportMode::StartTls => SmtpStream::plain(stream),
    };

    let mut session = Session::new(mode, tls.is_some(), Arc::clone(&gateway));
    smtp.write_reply(&session.greeting()).await?;

    loop {
        let line = timeout(COMMAND_TIMEOUT, smtp.read_line())
            .await
            .map_err(|_| Error::Timeout("command"))??;
        let transition = session.handle_line(&line);
        smtp.write_reply(&transition.reply).await?;

        match transition.action {
            Action::None => {}
            Action::Close => {
                debug!(%peer, "connection closed");
                return Ok(());
            }
            Action::StartTls => {
                let acceptor = tls.as_ref().ok_or_else(|| {
                    Error::Config("STARTTLS accepted without certificate".to_string())
                })?;
                smtp = timeout(TLS_TIMEOUT, smtp.upgrade(acceptor))
                    .await
                    .map_err(|_| Error::Timeout("TLS handshake"))??;
                session.tls_established();
                debug!(%peer, "channel upgraded to TLS");
            }
            Action::CollectData => match collect_data(&mut smtp, gateway.max_data_size).await? {
                Some(raw) => {
                    let reply = process_message(&mut session, &gateway, &raw, peer).await;
                    smtp.write_reply(&reply).await?;
                }
                None => {
                    session.reset_transaction();
                    smtp.write_reply(&Reply::single(
                        ReplyCode::EXCEEDED_STORAGE,
                        "Message exceeds maximum size",
                    ))
                    .await?;
                }
            },
        }
    }
}

/// Collects DATA lines until the lone-dot terminator.
///
/// Leading-dot transparency is undone. Returns `None` when the message
/// exceeds `max_size`; input is still drained to the terminator so the
/// session can continue.
async fn collect_data(stream: &mut SmtpStream, max_size: usize) -> Result<Option<Vec<u8>>> {
    let mut raw = Vec::new();
    let mut oversized = false;

    loop {
        let line = timeout(DATA_TIMEOUT, stream.read_line_bytes())
            .await
            .map_err(|_| Error::Timeout("message data"))??;

        let content = strip_line_ending(&line);
        if content == b"." {
            break;
        }

        let unstuffed = if content.first() == Some(&b'.') {
            &line[1..]
        } else {
            &line[..]
        };

        if raw.len() + unstuffed.len() > max_size {
            oversized = true;
            raw.clear();
        }
        if !oversized {
            raw.extend_from_slice(unstuffed);
        }
    }

    Ok(if oversized { None } else { Some(raw) })
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Parses the collected message and dispatches notifications.
///
/// The envelope is consumed either way: a completed DATA phase ends the
/// transaction whether or not the message was deliverable.
async fn process_message(
    session: &mut Session,
    gateway: &Gateway,
    raw: &[u8],
    peer: SocketAddr,
) -> Reply {
    let Some((sender, recipients)) = session.take_envelope() else {
        return Reply::single(ReplyCode::LOCAL_ERROR, "No mail transaction in progress");
    };

    match Message::parse(raw) {
        Err(e) => {
            warn!(%peer, error = %e, "rejecting unparseable message");
            Reply::single(
                ReplyCode::TRANSACTION_FAILED,
                format!("Message could not be parsed: {e}"),
            )
        }
        Ok(message) => {
            info!(
                %peer,
                sender = %sender,
                recipients = recipients.len(),
                "message accepted, dispatching"
            );
            let outcomes = gateway
                .dispatcher
                .dispatch(&sender, &message, &recipients)
                .await;
            session::data_reply(&recipients, &outcomes)
        }
    }
}
