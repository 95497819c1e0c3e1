//! xmpp-webhook: relays webhook alerts to XMPP recipients.
//!
//! Holds one authenticated XMPP session for the life of the process.
//! Alerts posted to the HTTP endpoints are fanned out to the configured
//! recipients; chat messages sent to the relay are echoed back.

mod config;
mod gateway;
mod relay;
mod session;

use clap::Parser;
use config::RelayConfig;
use gateway::Gateway;
use relay::{ErrorSink, Fanout, InboundDispatcher, LogSink};
use session::XmppSession;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// xmpp-webhook: webhook to XMPP relay
#[derive(Parser, Debug)]
#[command(name = "xmpp-webhook", version, about = "Relay webhook alerts to XMPP")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.xmpp-webhook/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting xmpp-webhook");

    let config_path = PathBuf::from(&cli.config);
    let config = match RelayConfig::load(Some(&config_path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let (session, mut inbound) =
        match XmppSession::open(&config.identity, &config.password, &config.session_options()).await {
            Ok(opened) => opened,
            Err(e) => {
                error!(error = %e, identity = %config.identity, "failed to open XMPP session");
                std::process::exit(1);
            }
        };
    let session = Arc::new(session);
    let identity = session.jid().clone();
    let errors: Arc<dyn ErrorSink> = Arc::new(LogSink);

    // Outbound: gateway -> queue -> fan-out -> session
    let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
    let cancel = CancellationToken::new();
    let fanout = Fanout::new(
        identity.clone(),
        config.recipients.clone(),
        session.clone(),
        errors.clone(),
    );
    let fanout_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { fanout.run(queue_rx, cancel).await }
    });

    // Inbound: session -> dispatcher -> session
    let inbound_done = CancellationToken::new();
    let dispatcher = InboundDispatcher::new(identity, session.clone(), errors);
    let inbound_task = tokio::spawn({
        let done = inbound_done.clone();
        let cancel = cancel.clone();
        async move {
            let result = dispatcher.run(&mut inbound, &cancel).await;
            done.cancel();
            result
        }
    });

    let app = match Gateway::new(queue_tx).with_builtin_parsers().into_router() {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "failed to build webhook routes");
            session.close().await;
            std::process::exit(1);
        }
    };
    let listener = match TcpListener::bind(config.listen.as_str()).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %config.listen, "failed to bind webhook listener");
            session.close().await;
            std::process::exit(1);
        }
    };
    info!(addr = %config.listen, "listening for webhooks");

    let shutdown = {
        let done = inbound_done.clone();
        async move {
            tokio::select! {
                _ = shutdown_signal() => info!("received shutdown signal"),
                _ = done.cancelled() => warn!("inbound stream ended, shutting down"),
            }
        }
    };
    let mut failed = false;
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %e, "HTTP server error");
        failed = true;
    }
    let stream_died = inbound_done.is_cancelled();

    // Both writers must be done before the stream footer goes out.
    cancel.cancel();
    if let Err(e) = fanout_task.await {
        warn!(error = %e, "fan-out task panicked");
    }
    let inbound_result = inbound_task.await;
    if stream_died {
        failed = true;
        match inbound_result {
            Ok(Ok(())) => error!("server closed the XMPP stream"),
            Ok(Err(e)) => error!(error = %e, "XMPP stream failed"),
            Err(e) => error!(error = %e, "inbound dispatcher panicked"),
        }
    } else if let Err(e) = inbound_result {
        warn!(error = %e, "inbound dispatcher panicked");
    }
    session.close().await;

    info!("xmpp-webhook stopped");
    if failed {
        std::process::exit(1);
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    ctrl_c.await.ok();
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
