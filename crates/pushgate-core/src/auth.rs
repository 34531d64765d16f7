//! Credential storage and validation.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use subtle::ConstantTimeEq;

/// Read-only store of username/secret pairs.
///
/// Loaded once at startup and never mutated during request handling, so a
/// single instance can be shared across all connection tasks.
#[derive(Debug, Default)]
pub struct CredentialStore {
    entries: HashMap<String, String>,
}

impl CredentialStore {
    /// Creates an empty store. An empty store means authentication is not
    /// enforced for the gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads credentials from a reader.
    ///
    /// One `username:secret` pair per line; lines without exactly one colon
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub fn from_reader(reader: impl Read) -> io::Result<Self> {
        let mut entries = HashMap::new();
        for line in BufReader::new(reader).lines() {
            let line = line?;
            let mut split = line.splitn(2, ':');
            if let (Some(user), Some(secret)) = (split.next(), split.next()) {
                if !user.is_empty() {
                    entries.insert(user.to_string(), secret.to_string());
                }
            }
        }
        Ok(Self { entries })
    }

    /// Loads credentials from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or read.
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::from_reader(std::fs::File::open(path)?)
    }

    /// Checks supplied credentials against the store.
    ///
    /// The secret comparison is constant-time to resist timing leaks; an
    /// unknown username still fails without revealing which field was wrong.
    #[must_use]
    pub fn validate(&self, username: &str, secret: &str) -> bool {
        self.entries.get(username).is_some_and(|stored| {
            bool::from(stored.as_bytes().ct_eq(secret.as_bytes()))
        })
    }

    /// Returns true if the store holds no credentials.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of stored credentials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
