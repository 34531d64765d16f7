//! Notification dispatch to the push provider.
//!
//! One provider call is made per recipient, independently: a transient
//! failure for one recipient never blocks or rolls back the others. Each
//! call carries its own timeout, decoupled from the inbound connection's
//! timeouts, since dispatch happens after DATA input is fully consumed.

use crate::route::{Addressing, Recipient};
use pushgate_mime::Message;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Result type alias for dispatcher construction and startup checks.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Dispatcher error types.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider refused the request.
    #[error("Provider refused: {0}")]
    Provider(String),
}

/// Per-recipient delivery outcome, order-preserving with the recipient list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The provider accepted the notification.
    Delivered,
    /// Permanent failure; retrying the same request will not help.
    Rejected(String),
    /// Transient provider or network failure; retryable by caller policy.
    Deferred(String),
}

impl DeliveryOutcome {
    /// Returns true if the provider accepted the notification.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Response body of the provider API.
#[derive(Debug, Default, Deserialize)]
struct ProviderResponse {
    #[serde(default)]
    status: i64,
    #[serde(default)]
    errors: Vec<String>,
}

/// The notification content derived from one accepted message, shared by
/// every per-recipient delivery.
#[derive(Debug, Clone)]
struct Notification {
    title: String,
    body: String,
    attachment: Option<Attachment>,
}

#[derive(Debug, Clone)]
struct Attachment {
    filename: String,
    content_type: String,
    bytes: Vec<u8>,
}

impl Notification {
    /// Builds notification content from a parsed message.
    ///
    /// The title is the Subject header (falling back to "(no subject)")
    /// suffixed with the envelope sender and recipient list; the body is the
    /// first plain-text part.
    fn build(sender: &str, message: &Message, recipients: &[Recipient]) -> Self {
        let subject = message.subject().unwrap_or("(no subject)");
        let to_list = recipients
            .iter()
            .map(|r| r.raw.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let title = format!("{subject} ({sender} to {to_list})");

        let body = message
            .text_part()
            .map(|part| part.body_text().trim_end().to_string())
            .unwrap_or_default();

        let attachment = message.attachment().map(|part| Attachment {
            filename: part
                .filename
                .clone()
                .unwrap_or_else(|| "attachment".to_string()),
            content_type: part.content_type.to_string(),
            bytes: part.body.clone(),
        });

        Self {
            title,
            body,
            attachment,
        }
    }
}

/// Converts accepted messages into outbound push-notification calls.
///
/// Cheap to clone; the underlying HTTP client is reference-counted.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    http: reqwest::Client,
    token: String,
    default_user: Option<String>,
}

impl Dispatcher {
    /// Per-call timeout for provider requests.
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Creates a dispatcher with the gateway's application token and the
    /// default user key used by app-key addressed domains.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(token: impl Into<String>, default_user: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            token: token.into(),
            default_user,
        })
    }

    /// Delivers one notification per recipient and collects the outcomes.
    ///
    /// Outcomes are returned in recipient order. Deliveries run as
    /// independent tasks; cancellation or panic of one never cancels its
    /// siblings.
    pub async fn dispatch(
        &self,
        sender: &str,
        message: &Message,
        recipients: &[Recipient],
    ) -> Vec<DeliveryOutcome> {
        let notification = Notification::build(sender, message, recipients);

        let handles: Vec<_> = recipients
            .iter()
            .map(|rcpt| {
                let dispatcher = self.clone();
                let notification = notification.clone();
                let rcpt = rcpt.clone();
                tokio::spawn(async move { dispatcher.deliver(&notification, &rcpt).await })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            outcomes.push(handle.await.unwrap_or_else(|e| {
                DeliveryOutcome::Deferred(format!("delivery task failed: {e}"))
            }));
        }
        outcomes
    }

    /// Delivers to a single recipient.
    async fn deliver(&self, notification: &Notification, rcpt: &Recipient) -> DeliveryOutcome {
        let (token, user) = match rcpt.policy.addressing {
            Addressing::UserKey => (self.token.clone(), rcpt.local.clone()),
            Addressing::AppKey => match &self.default_user {
                Some(user) => (rcpt.local.clone(), user.clone()),
                None => {
                    return DeliveryOutcome::Rejected(
                        "app-key addressing requires a configured default user key".to_string(),
                    );
                }
            },
        };

        let mut form = reqwest::multipart::Form::new()
            .text("token", token)
            .text("user", user)
            .text("title", notification.title.clone())
            .text("message", notification.body.clone());

        if let Some(sound) = &rcpt.sound {
            form = form.text("sound", sound.clone());
        }

        if let Some(att) = &notification.attachment {
            let part = reqwest::multipart::Part::bytes(att.bytes.clone())
                .file_name(att.filename.clone());
            let part = part.mime_str(&att.content_type).unwrap_or_else(|_| {
                reqwest::multipart::Part::bytes(att.bytes.clone())
                    .file_name(att.filename.clone())
            });
            form = form.part("attachment", part);
        }

        let url = format!("{}/1/messages.json", rcpt.policy.api_base);
        debug!(recipient = %rcpt.raw, %url, "delivering notification");

        match self.http.post(&url).multipart(form).send().await {
            Err(e) => {
                warn!(recipient = %rcpt.raw, error = %e, "delivery deferred");
                DeliveryOutcome::Deferred(e.to_string())
            }
            Ok(response) => {
                let http_status = response.status().as_u16();
                let body: ProviderResponse = response.json().await.unwrap_or_default();
                classify(http_status, &body)
            }
        }
    }

    /// Verifies a user key against the provider at startup.
    ///
    /// Mirrors the gateway's startup check: a misconfigured default
    /// recipient should fail the process before any mail is accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the provider reports the
    /// key invalid.
    pub async fn verify_user(&self, user: &str, api_base: &str) -> Result<()> {
        let url = format!("{api_base}/1/users/validate.json");
        let response = self
            .http
            .post(&url)
            .form(&[("token", self.token.as_str()), ("user", user)])
            .send()
            .await?;

        let http_status = response.status();
        let body: ProviderResponse = response.json().await.unwrap_or_default();
        if http_status.is_success() && body.status == 1 {
            Ok(())
        } else {
            Err(DispatchError::Provider(if body.errors.is_empty() {
                format!("user validation failed with HTTP {http_status}")
            } else {
                body.errors.join("; ")
            }))
        }
    }
}

/// Maps an HTTP status and provider body onto a delivery outcome.
///
/// Provider `status == 1` on a 2xx means accepted; other 4xx responses are
/// permanent; 5xx and everything else is transient.
fn classify(http_status: u16, body: &ProviderResponse) -> DeliveryOutcome {
    if (200..300).contains(&http_status) && body.status == 1 {
        return DeliveryOutcome::Delivered;
    }

    let reason = if body.errors.is_empty() {
        format!("provider returned HTTP {http_status}")
    } else {
        body.errors.join("; ")
    };

    if (400..500).contains(&http_status) {
        DeliveryOutcome::Rejected(reason)
    } else {
        DeliveryOutcome::Deferred(reason)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::route::Router;

    fn parse(raw: &[u8]) -> Message {
        Message::parse(raw).unwrap()
    }

    #[test]
    fn test_notification_title_format() {
        let message = parse(b"Subject: Test\r\n\r\nhello\r\n");
        let router = Router::new();
        let rcpt = router.route("alice!bike@api.pushover.net").unwrap();

        let n = Notification::build("ryan@youngryan.com", &message, &[rcpt]);
        assert_eq!(
            n.title,
            "Test (ryan@youngryan.com to alice!bike@api.pushover.net)"
        );
        assert_eq!(n.body, "hello");
    }

    #[test]
    fn test_notification_no_subject_fallback() {
        let message = parse(b"From: <a@b.c>\r\n\r\nbody\r\n");
        let router = Router::new();
        let rcpt = router.route("alice@api.pushover.net").unwrap();

        let n = Notification::build("a@b.c", &message, &[rcpt]);
        assert!(n.title.starts_with("(no subject) ("));
    }

    #[test]
    fn test_notification_multiple_recipients_listed() {
        let message = parse(b"Subject: s\r\n\r\nbody\r\n");
        let router = Router::new();
        let rcpts = vec![
            router.route("a@api.pushover.net").unwrap(),
            router.route("b@api.pushover.net").unwrap(),
        ];

        let n = Notification::build("s@x.y", &message, &rcpts);
        assert_eq!(n.title, "s (s@x.y to a@api.pushover.net, b@api.pushover.net)");
    }

    #[test]
    fn test_classify_delivered() {
        let body = ProviderResponse {
            status: 1,
            errors: vec![],
        };
        assert_eq!(classify(200, &body), DeliveryOutcome::Delivered);
    }

    #[test]
    fn test_classify_rejected_on_4xx() {
        let body = ProviderResponse {
            status: 0,
            errors: vec!["user identifier is invalid".to_string()],
        };
        assert_eq!(
            classify(400, &body),
            DeliveryOutcome::Rejected("user identifier is invalid".to_string())
        );
    }

    #[test]
    fn test_classify_deferred_on_5xx() {
        let body = ProviderResponse::default();
        assert!(matches!(
            classify(503, &body),
            DeliveryOutcome::Deferred(_)
        ));
    }

    #[test]
    fn test_classify_status_zero_on_2xx_is_deferred() {
        // Provider answered 200 but did not accept; treat as transient.
        let body = ProviderResponse::default();
        assert!(matches!(classify(200, &body), DeliveryOutcome::Deferred(_)));
    }

    /// Accepts one HTTP request, returns its raw bytes, and answers with a
    /// provider-style acceptance body.
    async fn capture_one_request(listener: tokio::net::TcpListener) -> Vec<u8> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed before completing the request");
            request.extend_from_slice(&chunk[..n]);

            if let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&request[..end]);
                let length: usize = head
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        if name.eq_ignore_ascii_case("content-length") {
                            value.trim().parse().ok()
                        } else {
                            None
                        }
                    })
                    .unwrap();
                if request.len() >= end + 4 + length {
                    break;
                }
            }
        }

        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\n\
                  content-type: application/json\r\n\
                  content-length: 12\r\n\
                  connection: close\r\n\
                  \r\n\
                  {\"status\":1}",
            )
            .await
            .unwrap();
        request
    }

    #[tokio::test]
    async fn test_deliver_sends_sound_and_addressing_fields() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let capture = tokio::spawn(capture_one_request(listener));

        let router = Router::new().with_policy(
            "push.test",
            crate::route::RoutePolicy::new(format!("http://{addr}"), Addressing::UserKey),
        );
        let rcpt = router.route("alice!bike@push.test").unwrap();
        let message = parse(b"Subject: Test\r\n\r\nhello\r\n");

        let dispatcher = Dispatcher::new("apptoken", None).unwrap();
        let outcomes = dispatcher
            .dispatch("ryan@youngryan.com", &message, &[rcpt])
            .await;
        assert_eq!(outcomes, vec![DeliveryOutcome::Delivered]);

        let request = String::from_utf8_lossy(&capture.await.unwrap()).into_owned();
        assert!(request.starts_with("POST /1/messages.json"));
        assert!(request.contains("name=\"sound\""));
        assert!(request.contains("bike"));
        assert!(request.contains("name=\"token\""));
        assert!(request.contains("apptoken"));
        assert!(request.contains("name=\"user\""));
        assert!(request.contains("alice"));
        assert!(request.contains("Test (ryan@youngryan.com to alice!bike@push.test)"));
        assert!(request.contains("hello"));
    }

    #[tokio::test]
    async fn test_dispatch_unreachable_provider_defers() {
        let router = Router::new().with_policy(
            "push.test",
            crate::route::RoutePolicy::new(
                // Reserved port with nothing listening.
                "http://127.0.0.1:9",
                Addressing::UserKey,
            ),
        );
        let rcpt = router.route("alice@push.test").unwrap();
        let message = parse(b"Subject: s\r\n\r\nbody\r\n");

        let dispatcher = Dispatcher::new("token", None).unwrap();
        let outcomes = dispatcher.dispatch("a@b.c", &message, &[rcpt]).await;
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], DeliveryOutcome::Deferred(_)));
    }

    #[tokio::test]
    async fn test_dispatch_app_key_without_default_user_rejects() {
        let router = Router::new();
        let rcpt = router.route("sometoken@pushover.net").unwrap();
        let message = parse(b"Subject: s\r\n\r\nbody\r\n");

        let dispatcher = Dispatcher::new("token", None).unwrap();
        let outcomes = dispatcher.dispatch("a@b.c", &message, &[rcpt]).await;
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], DeliveryOutcome::Rejected(_)));
    }
}
