//! Wire-level SMTP types.

mod command;
mod reply;

pub use command::Command;
pub use reply::{Reply, ReplyCode};
