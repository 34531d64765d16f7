//! Recipient address parsing and delivery-policy routing.
//!
//! Recipient addresses follow the grammar `local ["!" sound] "@" domain`.
//! The local part names the delivery target, the optional `!sound` tag
//! selects a notification sound, and the domain selects the routing policy.

use std::collections::HashMap;

/// Result type alias for routing operations.
pub type Result<T> = std::result::Result<T, RouteError>;

/// Address routing error types.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    /// The address does not match `local["!"sound]"@"domain`.
    #[error("Invalid recipient address: {0}")]
    InvalidAddress(String),

    /// The `!sound` tag is not in the provider's sound vocabulary.
    #[error("Unknown notification sound: {0}")]
    UnknownSound(String),

    /// No routing policy is configured for the domain.
    #[error("No routing policy for domain: {0}")]
    UnknownDomain(String),
}

/// The provider's notification sound vocabulary.
pub const SOUNDS: &[&str] = &[
    "pushover",
    "bike",
    "bugle",
    "cashregister",
    "classical",
    "cosmic",
    "falling",
    "gamelan",
    "incoming",
    "intermission",
    "magic",
    "mechanical",
    "pianobar",
    "siren",
    "spacealarm",
    "tugboat",
    "alien",
    "climb",
    "persistent",
    "echo",
    "updown",
    "vibrate",
    "none",
];

/// How the local part of an address maps onto provider request fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// The local part is the provider user (or group) key; the gateway's
    /// configured application token authenticates the call.
    UserKey,
    /// The local part supplies the application token; the gateway's
    /// configured default user key names the target.
    AppKey,
}

/// Delivery policy resolved from a recipient's domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePolicy {
    /// Base URL of the provider API.
    pub api_base: String,
    /// Local-part addressing mode.
    pub addressing: Addressing,
}

impl RoutePolicy {
    /// Creates a policy against the given API base.
    #[must_use]
    pub fn new(api_base: impl Into<String>, addressing: Addressing) -> Self {
        Self {
            api_base: api_base.into(),
            addressing,
        }
    }
}

/// Default provider API base.
pub const DEFAULT_API_BASE: &str = "https://api.pushover.net";

/// A parsed, routed recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// The address exactly as the SMTP client supplied it.
    pub raw: String,
    /// Local part with the sound tag stripped.
    pub local: String,
    /// Sound selected by the `!sound` tag, if present.
    pub sound: Option<String>,
    /// Domain part of the address.
    pub domain: String,
    /// Policy resolved from the domain.
    pub policy: RoutePolicy,
}

impl Recipient {
    /// Reserializes the parsed triple back into address form.
    #[must_use]
    pub fn address(&self) -> String {
        match &self.sound {
            Some(sound) => format!("{}!{}@{}", self.local, sound, self.domain),
            None => format!("{}@{}", self.local, self.domain),
        }
    }
}

/// Static domain-to-policy table, immutable after startup.
#[derive(Debug, Clone)]
pub struct Router {
    policies: HashMap<String, RoutePolicy>,
}

impl Router {
    /// Creates a router with the default domain table:
    /// `api.pushover.net` uses user-key addressing, `pushover.net` uses
    /// app-key addressing.
    #[must_use]
    pub fn new() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            "api.pushover.net".to_string(),
            RoutePolicy::new(DEFAULT_API_BASE, Addressing::UserKey),
        );
        policies.insert(
            "pushover.net".to_string(),
            RoutePolicy::new(DEFAULT_API_BASE, Addressing::AppKey),
        );
        Self { policies }
    }

    /// Adds or replaces the policy for a domain.
    #[must_use]
    pub fn with_policy(mut self, domain: impl Into<String>, policy: RoutePolicy) -> Self {
        self.policies.insert(domain.into(), policy);
        self
    }

    /// Parses a recipient address and resolves its delivery policy.
    ///
    /// Parsing is pure and total: any address either yields a [`Recipient`]
    /// or a [`RouteError`] describing why it was refused.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed grammar, an unknown `!sound` tag, or a
    /// domain with no configured policy.
    pub fn route(&self, address: &str) -> Result<Recipient> {
        let address = address.trim();

        let (local_tagged, domain) = address
            .split_once('@')
            .ok_or_else(|| RouteError::InvalidAddress(address.to_string()))?;

        if local_tagged.is_empty() || domain.is_empty() || domain.contains('@') {
            return Err(RouteError::InvalidAddress(address.to_string()));
        }

        let (local, sound) = match local_tagged.split_once('!') {
            Some((local, sound)) => (local, Some(sound)),
            None => (local_tagged, None),
        };

        if local.is_empty() {
            return Err(RouteError::InvalidAddress(address.to_string()));
        }

        if let Some(sound) = sound {
            if !SOUNDS.contains(&sound) {
                return Err(RouteError::UnknownSound(sound.to_string()));
            }
        }

        let policy = self
            .policies
            .get(domain)
            .ok_or_else(|| RouteError::UnknownDomain(domain.to_string()))?;

        Ok(Recipient {
            raw: address.to_string(),
            local: local.to_string(),
            sound: sound.map(ToString::to_string),
            domain: domain.to_string(),
            policy: policy.clone(),
        })
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
