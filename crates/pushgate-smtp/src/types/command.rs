//! SMTP command parsing (server side).

/// SMTP command received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// HELO - Simple greeting
    Helo {
        /// Client hostname
        hostname: String,
    },
    /// EHLO - Extended greeting
    Ehlo {
        /// Client hostname
        hostname: String,
    },
    /// STARTTLS - Upgrade to TLS
    StartTls,
    /// AUTH - Begin authentication
    Auth {
        /// Authentication mechanism name, uppercased
        mechanism: String,
        /// Initial response (optional, for SASL-IR)
        initial_response: Option<String>,
    },
    /// MAIL FROM - Start mail transaction
    MailFrom {
        /// Sender reverse-path as supplied
        path: String,
    },
    /// RCPT TO - Add recipient
    RcptTo {
        /// Recipient forward-path as supplied
        path: String,
    },
    /// DATA - Begin message data
    Data,
    /// RSET - Reset transaction
    Rset,
    /// NOOP - No operation
    Noop,
    /// QUIT - Close connection
    Quit,
    /// Anything unrecognized
    Unknown(String),
}

impl Command {
    /// Parses a command line received from a client.
    ///
    /// The verb is matched case-insensitively. `MAIL FROM` / `RCPT TO`
    /// accept both `CMD ARG:<path>` and `CMD ARG: <path>` spellings, and
    /// ESMTP parameters after the path are ignored.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => Self::Helo {
                hostname: rest.to_string(),
            },
            "EHLO" => Self::Ehlo {
                hostname: rest.to_string(),
            },
            "STARTTLS" => Self::StartTls,
            "AUTH" => {
                let mut words = rest.split_whitespace();
                let mechanism = words.next().unwrap_or("").to_ascii_uppercase();
                let initial_response = words.next().map(ToString::to_string);
                Self::Auth {
                    mechanism,
                    initial_response,
                }
            }
            "MAIL" if has_keyword(rest, "FROM") => Self::MailFrom {
                path: extract_path(rest),
            },
            "RCPT" if has_keyword(rest, "TO") => Self::RcptTo {
                path: extract_path(rest),
            },
            "DATA" => Self::Data,
            "RSET" => Self::Rset,
            "NOOP" => Self::Noop,
            "QUIT" => Self::Quit,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Checks that the argument starts with `KEYWORD:` (case-insensitive).
fn has_keyword(rest: &str, keyword: &str) -> bool {
    rest.len() > keyword.len()
        && rest[..keyword.len()].eq_ignore_ascii_case(keyword)
        && rest[keyword.len()..].trim_start().starts_with(':')
}

/// Extracts the address from `FROM:<path>` / `TO:<path>` argument forms.
///
/// Angle brackets are optional in practice; ESMTP parameters after the
/// path (e.g. `SIZE=1234`) are dropped.
fn extract_path(rest: &str) -> String {
    let after_colon = rest.split_once(':').map_or("", |(_, r)| r).trim();

    if let Some(start) = after_colon.find('<') {
        if let Some(end) = after_colon[start..].find('>') {
            return after_colon[start + 1..start + end].to_string();
        }
    }

    after_colon
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_string()
}
