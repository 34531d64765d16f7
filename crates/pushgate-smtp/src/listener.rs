//! Listener manager: one bound socket per transport mode.
//!
//! Every listener shares a single [`Gateway`] behind an `Arc`; each accepted
//! connection gets its own task so a misbehaving client never stalls its
//! siblings.

use crate::connection;
use crate::session::TransportMode;
use crate::{Error, Result};
use pushgate_core::{CredentialStore, Dispatcher, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Shared, read-only gateway state consulted by every connection.
#[derive(Debug)]
pub struct Gateway {
    /// Hostname announced in the greeting and EHLO reply.
    pub hostname: String,
    /// Credential store; empty means AUTH is not enforced.
    pub credentials: CredentialStore,
    /// Recipient address router.
    pub router: Router,
    /// Notification dispatcher.
    pub dispatcher: Dispatcher,
    /// Maximum accepted DATA size in bytes; larger messages get a 552.
    pub max_data_size: usize,
}

impl Gateway {
    /// Default cap on accepted message size.
    pub const DEFAULT_MAX_DATA_SIZE: usize = 10 * 1024 * 1024;

    /// Assembles the shared gateway state.
    #[must_use]
    pub fn new(
        hostname: impl Into<String>,
        credentials: CredentialStore,
        router: Router,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            credentials,
            router,
            dispatcher,
            max_data_size: Self::DEFAULT_MAX_DATA_SIZE,
        }
    }

    /// Overrides the maximum accepted message size.
    #[must_use]
    pub const fn with_max_data_size(mut self, bytes: usize) -> Self {
        self.max_data_size = bytes;
        self
    }
}

/// Configuration for one listening socket.
#[derive(Clone)]
pub struct ListenerConfig {
    /// Bind address, e.g. `0.0.0.0:2525`.
    pub addr: String,
    /// Transport policy for connections accepted here.
    pub mode: TransportMode,
    /// TLS acceptor; required for implicit TLS, enables STARTTLS upgrades.
    pub tls: Option<TlsAcceptor>,
}

impl ListenerConfig {
    /// Creates a listener configuration without TLS material.
    #[must_use]
    pub fn new(addr: impl Into<String>, mode: TransportMode) -> Self {
        Self {
            addr: addr.into(),
            mode,
            tls: None,
        }
    }

    /// Attaches a TLS acceptor to this listener.
    #[must_use]
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }
}

struct BoundListener {
    listener: TcpListener,
    mode: TransportMode,
    tls: Option<TlsAcceptor>,
}

/// The SMTP server: a set of bound listeners over one shared [`Gateway`].
pub struct Server {
    gateway: Arc<Gateway>,
    listeners: Vec<BoundListener>,
}

impl Server {
    /// Binds every configured listener, failing fast if any address is
    /// unavailable or a TLS-requiring mode lacks an acceptor.
    ///
    /// # Errors
    ///
    /// Returns an error if no listeners are configured, an implicit-TLS
    /// listener has no TLS acceptor, or a bind fails.
    pub async fn bind(gateway: Gateway, configs: Vec<ListenerConfig>) -> Result<Self> {
        if configs.is_empty() {
            return Err(Error::Config("at least one listener is required".to_string()));
        }

        let mut listeners = Vec::with_capacity(configs.len());
        for config in configs {
            if config.mode == TransportMode::ImplicitTls && config.tls.is_none() {
                return Err(Error::Config(format!(
                    "implicit TLS listener {} has no certificate",
                    config.addr
                )));
            }

            let listener = TcpListener::bind(&config.addr).await?;
            info!(addr = %listener.local_addr()?, mode = ?config.mode, "listener bound");
            listeners.push(BoundListener {
                listener,
                mode: config.mode,
                tls: config.tls,
            });
        }

        Ok(Self {
            gateway: Arc::new(gateway),
            listeners,
        })
    }

    /// Bound addresses, in configuration order. Useful when binding port 0.
    ///
    /// # Errors
    ///
    /// Returns an error if a local address cannot be read from a socket.
    pub fn local_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.listeners
            .iter()
            .map(|b| b.listener.local_addr().map_err(Error::from))
            .collect()
    }

    /// Runs all accept loops until the process is stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if an accept loop task fails to join.
    pub async fn run(self) -> Result<()> {
        let mut handles = Vec::with_capacity(self.listeners.len());
        for bound in self.listeners {
            let gateway = Arc::clone(&self.gateway);
            handles.push(tokio::spawn(accept_loop(bound, gateway)));
        }

        for handle in handles {
            handle
                .await
                .map_err(|e| Error::Config(format!("accept loop failed: {e}")))?;
        }
        Ok(())
    }
}

async fn accept_loop(bound: BoundListener, gateway: Arc<Gateway>) {
    loop {
        match bound.listener.accept().await {
            Ok((stream, peer)) => {
                let gateway = Arc::clone(&gateway);
                let tls = bound.tls.clone();
                let mode = bound.mode;
                tokio::spawn(async move {
                    if let Err(e) = connection::serve(stream, peer, mode, tls, gateway).await {
                        debug!(%peer, error = %e, "connection ended");
                    }
                });
            }
            Err(e) => {
                // Transient accept errors (e.g. EMFILE) should not kill the
                // listener; back off briefly and keep accepting.
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
