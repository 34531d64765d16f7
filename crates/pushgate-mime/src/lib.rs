//! # pushgate-mime
//!
//! MIME transcript parsing for the pushgate SMTP gateway.
//!
//! A gateway only ever *reads* mail, so this crate is a decoder: it takes the
//! raw transcript collected during the SMTP DATA phase and produces a
//! structured [`Message`] the notification dispatcher can work with.
//!
//! ## Features
//!
//! - **Header block parsing**: continuation-line unfolding, insertion order
//!   preserved, case-insensitive lookup, duplicate headers retained
//! - **Multipart bodies**: recursive splitting on the declared boundary
//! - **Transfer decoding**: Base64 and Quoted-Printable part bodies are
//!   decoded before storage
//! - **Attachments**: `Content-Disposition: attachment` parts keep their
//!   declared filename
//!
//! ## Quick Start
//!
//! ```ignore
//! use pushgate_mime::Message;
//!
//! let raw = b"Subject: Test\r\n\
//!             Content-Type: text/plain\r\n\
//!             \r\n\
//!             hello";
//!
//! let message = Message::parse(raw)?;
//! assert_eq!(message.subject(), Some("Test"));
//! assert_eq!(message.text_part().map(|p| p.body.as_slice()), Some(&b"hello"[..]));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod content_type;
mod error;
mod header;
mod message;

pub mod encoding;

pub use content_type::ContentType;
pub use error::{Error, Result};
pub use header::Headers;
pub use message::{Disposition, Message, Part, TransferEncoding};
