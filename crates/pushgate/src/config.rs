//! Command-line configuration and TLS material loading.

use anyhow::{Context, bail};
use clap::Parser;
use pushgate_smtp::{ListenerConfig, TransportMode};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// SMTP gateway that forwards incoming mail as push notifications.
///
/// Recipient addresses select the delivery target: the local part carries
/// the provider user key (optionally tagged with `!sound`), and the domain
/// picks the routing policy.
#[derive(Debug, Parser)]
#[command(name = "pushgate", version, about)]
pub struct Args {
    /// Plaintext listener address (STARTTLS refused); repeatable.
    #[arg(long, value_name = "ADDR")]
    pub plain: Vec<String>,

    /// STARTTLS-upgradeable listener address; repeatable, needs --cert/--key.
    #[arg(long, value_name = "ADDR")]
    pub starttls: Vec<String>,

    /// Implicit-TLS listener address; repeatable, needs --cert/--key.
    #[arg(long, value_name = "ADDR")]
    pub tls: Vec<String>,

    /// Hostname announced in the greeting and EHLO reply.
    #[arg(long, default_value = "pushgate.local")]
    pub hostname: String,

    /// Credentials file (`username:secret` per line); enables AUTH
    /// enforcement.
    #[arg(long = "auth", value_name = "FILE")]
    pub auth_file: Option<PathBuf>,

    /// PEM certificate chain for TLS listeners.
    #[arg(long, value_name = "FILE", requires = "key")]
    pub cert: Option<PathBuf>,

    /// PEM private key for TLS listeners.
    #[arg(long, value_name = "FILE", requires = "cert")]
    pub key: Option<PathBuf>,

    /// Provider application token.
    #[arg(long, env = "PUSHOVER_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Default user key for app-key addressed recipients.
    #[arg(long, env = "PUSHOVER_USER", hide_env_values = true)]
    pub user: Option<String>,

    /// Skip the startup validation of the default user key.
    #[arg(long)]
    pub skip_verify: bool,
}

impl Args {
    /// Builds the shared TLS acceptor from --cert/--key, if supplied.
    pub fn tls_acceptor(&self) -> anyhow::Result<Option<TlsAcceptor>> {
        let (Some(cert_path), Some(key_path)) = (&self.cert, &self.key) else {
            return Ok(None);
        };

        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("invalid certificate or key")?;
        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }

    /// Assembles the listener set, one entry per address flag.
    pub fn listeners(&self, tls: Option<&TlsAcceptor>) -> anyhow::Result<Vec<ListenerConfig>> {
        let mut configs = Vec::new();

        for addr in &self.plain {
            configs.push(ListenerConfig::new(addr, TransportMode::Plain));
        }
        for addr in &self.starttls {
            let acceptor = tls
                .cloned()
                .context("--starttls listeners require --cert and --key")?;
            configs.push(ListenerConfig::new(addr, TransportMode::StartTls).with_tls(acceptor));
        }
        for addr in &self.tls {
            let acceptor = tls
                .cloned()
                .context("--tls listeners require --cert and --key")?;
            configs.push(ListenerConfig::new(addr, TransportMode::ImplicitTls).with_tls(acceptor));
        }

        if configs.is_empty() {
            bail!("no listeners configured; pass at least one of --plain, --starttls, --tls");
        }
        Ok(configs)
    }
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("reading certificate {}", path.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::io::Result<_>>()
        .context("parsing certificate PEM")?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("reading private key {}", path.display()))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .context("parsing key PEM")?
        .with_context(|| format!("no private key found in {}", path.display()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_minimal_args() {
        let args = parse(&[
            "pushgate",
            "--plain",
            "127.0.0.1:2525",
            "--token",
            "abc",
        ]);
        assert_eq!(args.plain, vec!["127.0.0.1:2525"]);
        assert_eq!(args.token, "abc");
        assert_eq!(args.hostname, "pushgate.local");

        let listeners = args.listeners(None).unwrap();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].mode, TransportMode::Plain);
    }

    #[test]
    fn test_repeatable_listener_flags() {
        let args = parse(&[
            "pushgate",
            "--plain",
            "127.0.0.1:2525",
            "--plain",
            "127.0.0.1:2526",
            "--token",
            "abc",
        ]);
        assert_eq!(args.listeners(None).unwrap().len(), 2);
    }

    #[test]
    fn test_no_listeners_is_an_error() {
        let args = parse(&["pushgate", "--token", "abc"]);
        assert!(args.listeners(None).is_err());
    }

    #[test]
    fn test_tls_listener_without_cert_is_an_error() {
        let args = parse(&[
            "pushgate",
            "--tls",
            "127.0.0.1:2465",
            "--token",
            "abc",
        ]);
        assert!(args.listeners(None).is_err());
    }

    #[test]
    fn test_cert_requires_key() {
        assert!(
            Args::try_parse_from([
                "pushgate",
                "--plain",
                "127.0.0.1:2525",
                "--cert",
                "cert.pem",
                "--token",
                "abc",
            ])
            .is_err()
        );
    }

    #[test]
    fn test_acceptor_from_generated_pem() {
        let generated =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = std::env::temp_dir().join(format!("pushgate-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, generated.cert.pem()).unwrap();
        std::fs::write(&key_path, generated.key_pair.serialize_pem()).unwrap();

        let args = parse(&[
            "pushgate",
            "--tls",
            "127.0.0.1:0",
            "--cert",
            cert_path.to_str().unwrap(),
            "--key",
            key_path.to_str().unwrap(),
            "--token",
            "abc",
        ]);
        let acceptor = args.tls_acceptor().unwrap();
        assert!(acceptor.is_some());
        assert_eq!(args.listeners(acceptor.as_ref()).unwrap().len(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
