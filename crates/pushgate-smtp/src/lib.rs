//! # pushgate-smtp
//!
//! SMTP server protocol for the pushgate push-notification gateway.
//!
//! ## Features
//!
//! - **Three transport modes**: plaintext, STARTTLS-upgradeable, and
//!   implicit TLS, each bound to its own listener
//! - **Explicit state machine**: one [`session::Session`] per connection,
//!   with a deterministic transition function unit-testable without sockets
//! - **AUTH PLAIN / LOGIN** with bounded retry, delegating to the shared
//!   credential store
//! - **Per-phase timeouts**: command wait, DATA-line wait, and TLS handshake
//!   are each individually bounded
//!
//! ## Quick Start
//!
//! ```ignore
//! use pushgate_smtp::{Gateway, ListenerConfig, Server, TransportMode};
//!
//! let gateway = Gateway::new("mx.example.com", credentials, router, dispatcher);
//! let server = Server::bind(
//!     gateway,
//!     vec![ListenerConfig::new("0.0.0.0:2525", TransportMode::Plain)],
//! )
//! .await?;
//! server.run().await?;
//! ```
//!
//! ## Modules
//!
//! - [`session`]: the per-connection protocol state machine
//! - [`connection`]: socket driver executing the machine's I/O actions
//! - [`listener`]: listener manager binding one socket per transport mode
//! - [`types`]: wire-level command and reply types

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod connection;
mod error;
pub mod listener;
pub mod session;
pub mod types;

pub use error::{Error, Result};
pub use listener::{Gateway, ListenerConfig, Server};
pub use session::{Session, TransportMode};
pub use types::{Command, Reply, ReplyCode};
