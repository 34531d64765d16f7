//! # pushgate-core
//!
//! Routing, authentication and notification dispatch for the pushgate SMTP
//! gateway.
//!
//! This crate provides the pieces a connection session consults while
//! processing a mail transaction:
//!
//! - **Credential store**: read-only username/secret lookup, loaded once at
//!   startup, with constant-time secret comparison
//! - **Address router**: parses `local["!"sound]"@"domain` recipient
//!   addresses and resolves the domain to a delivery policy
//! - **Notification dispatcher**: converts an accepted message into one
//!   outbound push-notification call per recipient, collecting an ordered
//!   list of per-recipient delivery outcomes
//!
//! All three are read-only after construction and safe to share between
//! connection tasks behind an `Arc` without locking.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod dispatch;
pub mod route;

pub use auth::CredentialStore;
pub use dispatch::{DeliveryOutcome, DispatchError, Dispatcher};
pub use route::{Addressing, Recipient, RouteError, RoutePolicy, Router};
