//! End-to-end tests speaking SMTP over real sockets.
//!
//! The dispatcher is pointed at an unreachable local port, so accepted
//! messages end the DATA phase with a 451 (all deliveries deferred) without
//! touching the network.

#![allow(clippy::unwrap_used)]

use pushgate_core::route::{Addressing, RoutePolicy};
use pushgate_core::{CredentialStore, Dispatcher, Router};
use pushgate_smtp::{Gateway, ListenerConfig, Server, TransportMode};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn encode(s: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(s.as_bytes())
}

/// Router whose only domain points at a closed local port.
fn test_router() -> Router {
    Router::new().with_policy(
        "push.test",
        RoutePolicy::new("http://127.0.0.1:9", Addressing::UserKey),
    )
}

fn test_gateway(credentials: &str) -> Gateway {
    Gateway::new(
        "mx.test",
        CredentialStore::from_reader(credentials.as_bytes()).unwrap(),
        test_router(),
        Dispatcher::new("apptoken", None).unwrap(),
    )
}

async fn start_gateway(gateway: Gateway, configs: Vec<ListenerConfig>) -> Vec<SocketAddr> {
    let server = Server::bind(gateway, configs).await.unwrap();
    let addrs = server.local_addrs().unwrap();
    tokio::spawn(server.run());
    addrs
}

async fn start_server(configs: Vec<ListenerConfig>, credentials: &str) -> Vec<SocketAddr> {
    start_gateway(test_gateway(credentials), configs).await
}

/// Minimal SMTP test client over any byte stream.
struct Client<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    async fn send(&mut self, line: &str) {
        self.stream
            .get_mut()
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    /// Reads one (possibly multi-line) reply.
    async fn read_reply(&mut self) -> (u16, Vec<String>) {
        let mut texts = Vec::new();
        loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await.unwrap();
            assert!(n > 0, "connection closed mid-reply");
            let line = line.trim_end_matches(['\r', '\n']);

            let code: u16 = line[..3].parse().unwrap();
            let (sep, text) = if line.len() > 3 {
                (line.as_bytes()[3], &line[4..])
            } else {
                (b' ', "")
            };
            texts.push(text.to_string());
            if sep == b' ' {
                return (code, texts);
            }
        }
    }

    async fn cmd(&mut self, line: &str) -> (u16, Vec<String>) {
        self.send(line).await;
        self.read_reply().await
    }
}

async fn connect(addr: SocketAddr) -> Client<TcpStream> {
    let mut client = Client::new(TcpStream::connect(addr).await.unwrap());
    let (code, _) = client.read_reply().await;
    assert_eq!(code, 220);
    client
}

#[tokio::test]
async fn test_plaintext_transaction_end_to_end() {
    let addrs = start_server(
        vec![ListenerConfig::new("127.0.0.1:0", TransportMode::Plain)],
        "",
    )
    .await;
    let mut client = connect(addrs[0]).await;

    let (code, lines) = client.cmd("EHLO client.test").await;
    assert_eq!(code, 250);
    assert!(lines.iter().any(|l| l.starts_with("AUTH")));

    assert_eq!(client.cmd("MAIL FROM:<sender@example.org>").await.0, 250);
    assert_eq!(client.cmd("RCPT TO:<alice!bike@push.test>").await.0, 250);
    assert_eq!(client.cmd("DATA").await.0, 354);

    client.send("Subject: hello").await;
    client.send("").await;
    client.send("body line").await;
    let (code, _) = client.cmd(".").await;
    // The provider port is closed, so every delivery defers.
    assert_eq!(code, 451);

    // The session is reusable for a second transaction.
    assert_eq!(client.cmd("MAIL FROM:<sender@example.org>").await.0, 250);
    assert_eq!(client.cmd("QUIT").await.0, 221);
}

#[tokio::test]
async fn test_protocol_errors_and_bad_recipients() {
    let addrs = start_server(
        vec![ListenerConfig::new("127.0.0.1:0", TransportMode::Plain)],
        "",
    )
    .await;
    let mut client = connect(addrs[0]).await;

    assert_eq!(client.cmd("RCPT TO:<a@push.test>").await.0, 503);
    assert_eq!(client.cmd("FROB").await.0, 500);

    assert_eq!(client.cmd("EHLO c").await.0, 250);
    assert_eq!(client.cmd("MAIL FROM:<a@b.c>").await.0, 250);

    // Unknown domain and unknown sound are refused per recipient.
    assert_eq!(client.cmd("RCPT TO:<a@elsewhere.example>").await.0, 550);
    assert_eq!(client.cmd("RCPT TO:<a!klaxon@push.test>").await.0, 550);

    // With no accepted recipient, DATA is out of sequence.
    assert_eq!(client.cmd("DATA").await.0, 503);
}

#[tokio::test]
async fn test_dot_stuffed_data_accepted() {
    let addrs = start_server(
        vec![ListenerConfig::new("127.0.0.1:0", TransportMode::Plain)],
        "",
    )
    .await;
    let mut client = connect(addrs[0]).await;

    client.cmd("EHLO c").await;
    client.cmd("MAIL FROM:<a@b.c>").await;
    client.cmd("RCPT TO:<alice@push.test>").await;
    client.cmd("DATA").await;

    client.send("Subject: dots").await;
    client.send("").await;
    // A body line that is a single dot must be stuffed, not terminate.
    client.send("..").await;
    client.send("still in data").await;
    let (code, _) = client.cmd(".").await;
    assert_eq!(code, 451);
}

#[tokio::test]
async fn test_oversized_message_rejected_connection_usable() {
    let gateway = test_gateway("").with_max_data_size(256);
    let addrs = start_gateway(
        gateway,
        vec![ListenerConfig::new("127.0.0.1:0", TransportMode::Plain)],
    )
    .await;
    let mut client = connect(addrs[0]).await;

    client.cmd("EHLO c").await;
    client.cmd("MAIL FROM:<a@b.c>").await;
    client.cmd("RCPT TO:<alice@push.test>").await;
    assert_eq!(client.cmd("DATA").await.0, 354);

    client.send("Subject: big").await;
    client.send("").await;
    for _ in 0..20 {
        client
            .send("0123456789012345678901234567890123456789")
            .await;
    }
    let (code, _) = client.cmd(".").await;
    assert_eq!(code, 552);

    // The transaction was dropped but the connection stays usable.
    assert_eq!(client.cmd("MAIL FROM:<a@b.c>").await.0, 250);
}

#[tokio::test]
async fn test_auth_required_and_granted() {
    let addrs = start_server(
        vec![ListenerConfig::new("127.0.0.1:0", TransportMode::Plain)],
        "ryan:hunter2\n",
    )
    .await;
    let mut client = connect(addrs[0]).await;

    client.cmd("EHLO c").await;
    assert_eq!(client.cmd("MAIL FROM:<a@b.c>").await.0, 530);

    let blob = encode("\0ryan\0hunter2");
    assert_eq!(client.cmd(&format!("AUTH PLAIN {blob}")).await.0, 235);
    assert_eq!(client.cmd("MAIL FROM:<a@b.c>").await.0, 250);
}

#[tokio::test]
async fn test_auth_login_over_socket() {
    let addrs = start_server(
        vec![ListenerConfig::new("127.0.0.1:0", TransportMode::Plain)],
        "ryan:hunter2\n",
    )
    .await;
    let mut client = connect(addrs[0]).await;

    client.cmd("EHLO c").await;
    let (code, lines) = client.cmd("AUTH LOGIN").await;
    assert_eq!((code, lines[0].as_str()), (334, "VXNlcm5hbWU6"));
    let (code, _) = client.cmd(&encode("ryan")).await;
    assert_eq!(code, 334);
    let (code, _) = client.cmd(&encode("hunter2")).await;
    assert_eq!(code, 235);
}

mod tls {
    use super::*;
    use rustls::pki_types::{PrivatePkcs8KeyDer, ServerName};

    fn self_signed() -> (TlsAcceptor, TlsConnector) {
        let key = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der = key.cert.der().clone();
        let key_der = PrivatePkcs8KeyDer::from(key.key_pair.serialize_der());

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key_der.into())
            .unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert_der).unwrap();
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        (
            TlsAcceptor::from(Arc::new(server_config)),
            TlsConnector::from(Arc::new(client_config)),
        )
    }

    #[tokio::test]
    async fn test_starttls_upgrade_and_transaction() {
        let (acceptor, connector) = self_signed();
        let addrs = start_server(
            vec![
                ListenerConfig::new("127.0.0.1:0", TransportMode::StartTls).with_tls(acceptor),
            ],
            "",
        )
        .await;
        let mut client = connect(addrs[0]).await;

        let (code, lines) = client.cmd("EHLO c").await;
        assert_eq!(code, 250);
        assert!(lines.iter().any(|l| l == "STARTTLS"));
        assert!(!lines.iter().any(|l| l.starts_with("AUTH")));

        assert_eq!(client.cmd("STARTTLS").await.0, 220);

        let tcp = client.stream.into_inner();
        let domain = ServerName::try_from("localhost").unwrap();
        let tls = connector.connect(domain, tcp).await.unwrap();
        let mut client = Client::new(tls);

        // The upgraded channel starts over from the greeting phase.
        let (code, lines) = client.cmd("EHLO c").await;
        assert_eq!(code, 250);
        assert!(lines.iter().any(|l| l.starts_with("AUTH")));

        assert_eq!(client.cmd("MAIL FROM:<a@b.c>").await.0, 250);
        assert_eq!(client.cmd("RCPT TO:<alice@push.test>").await.0, 250);
        assert_eq!(client.cmd("DATA").await.0, 354);
        client.send("Subject: s").await;
        client.send("").await;
        client.send("over tls").await;
        assert_eq!(client.cmd(".").await.0, 451);
    }

    #[tokio::test]
    async fn test_implicit_tls_listener() {
        let (acceptor, connector) = self_signed();
        let addrs = start_server(
            vec![
                ListenerConfig::new("127.0.0.1:0", TransportMode::ImplicitTls).with_tls(acceptor),
            ],
            "",
        )
        .await;

        let tcp = TcpStream::connect(addrs[0]).await.unwrap();
        let domain = ServerName::try_from("localhost").unwrap();
        let tls = connector.connect(domain, tcp).await.unwrap();
        let mut client = Client::new(tls);

        let (code, _) = client.read_reply().await;
        assert_eq!(code, 220);
        assert_eq!(client.cmd("EHLO c").await.0, 250);
        assert_eq!(client.cmd("QUIT").await.0, 221);
    }

    #[tokio::test]
    async fn test_starttls_refused_on_plain_listener() {
        let addrs = start_server(
            vec![ListenerConfig::new("127.0.0.1:0", TransportMode::Plain)],
            "",
        )
        .await;
        let mut client = connect(addrs[0]).await;
        client.cmd("EHLO c").await;
        assert_eq!(client.cmd("STARTTLS").await.0, 502);
    }

    #[tokio::test]
    async fn test_implicit_tls_requires_certificate() {
        let gateway = Gateway::new(
            "mx.test",
            CredentialStore::new(),
            test_router(),
            Dispatcher::new("apptoken", None).unwrap(),
        );
        let result = Server::bind(
            gateway,
            vec![ListenerConfig::new("127.0.0.1:0", TransportMode::ImplicitTls)],
        )
        .await;
        assert!(result.is_err());
    }
}

#[tokio::test]
async fn test_multiple_listeners_share_one_gateway() {
    let addrs = start_server(
        vec![
            ListenerConfig::new("127.0.0.1:0", TransportMode::Plain),
            ListenerConfig::new("127.0.0.1:0", TransportMode::Plain),
        ],
        "",
    )
    .await;
    assert_eq!(addrs.len(), 2);

    let mut a = connect(addrs[0]).await;
    let mut b = connect(addrs[1]).await;
    assert_eq!(a.cmd("EHLO one").await.0, 250);
    assert_eq!(b.cmd("EHLO two").await.0, 250);
}
