//! `pushgate` - SMTP intake gateway that forwards mail as push
//! notifications.
//!
//! Accepts mail over plaintext, STARTTLS and implicit-TLS listeners,
//! optionally enforces AUTH against a credentials file, and delivers one
//! push notification per recipient.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod config;

use anyhow::Context;
use clap::Parser;
use config::Args;
use pushgate_core::route::DEFAULT_API_BASE;
use pushgate_core::{CredentialStore, Dispatcher, Router};
use pushgate_smtp::{Gateway, Server};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "pushgate=info,pushgate_smtp=info,pushgate_core=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    run(Args::parse()).await
}

async fn run(args: Args) -> anyhow::Result<()> {
    let credentials = match &args.auth_file {
        Some(path) => CredentialStore::from_file(path)
            .with_context(|| format!("loading credentials from {}", path.display()))?,
        None => CredentialStore::new(),
    };
    if credentials.is_empty() {
        info!("no credentials configured; AUTH is not enforced");
    } else {
        info!(users = credentials.len(), "credential store loaded");
    }

    let dispatcher = Dispatcher::new(&args.token, args.user.clone())
        .context("constructing notification dispatcher")?;

    // Fail before accepting any mail if the default recipient key is bad.
    if let Some(user) = &args.user {
        if args.skip_verify {
            info!("skipping default user key validation");
        } else {
            dispatcher
                .verify_user(user, DEFAULT_API_BASE)
                .await
                .context("default user key failed provider validation")?;
            info!("default user key verified with provider");
        }
    }

    let tls = args.tls_acceptor()?;
    let listeners = args.listeners(tls.as_ref())?;
    let gateway = Gateway::new(args.hostname.clone(), credentials, Router::new(), dispatcher);

    let server = Server::bind(gateway, listeners)
        .await
        .context("binding listeners")?;
    server.run().await.context("running server")
}
