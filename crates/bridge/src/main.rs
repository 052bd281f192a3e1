mod config;
mod error;
mod registry;
mod rtp_relay;
mod session;
mod sip;
mod web;
mod webrtc_peer;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::sip::{Registrar, SipTransport};
use crate::web::AppState;

const BINDING_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

fn parse_args() -> PathBuf {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/bridge.toml");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    config_path
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = parse_args();
    let config = config::load_config(&config_path)?;

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let local_ip = local_ip_address::local_ip().context("failed to discover a non-loopback local IPv4 address")?;
    let contact_host = config.sip.contact_host.clone().unwrap_or_else(|| local_ip.to_string());

    let registrar = Registrar::new();
    let sip_bind: SocketAddr = format!("{}:{}", config.sip.bind, config.sip.port)
        .parse()
        .context("invalid sip.bind/sip.port")?;
    let sip_transport = SipTransport::bind(
        sip_bind,
        Arc::clone(&registrar),
        Duration::from_secs(config.sip.binding_ttl_secs),
        contact_host,
        config.sip.contact_port,
        config.sip.user_agent.clone(),
    )
    .await
    .context("failed to bind SIP UDP listener")?;

    let registry = registry::SessionRegistry::new();

    let http_bind: SocketAddr = format!("{}:{}", config.http.bind, config.http.port)
        .parse()
        .context("invalid http.bind/http.port")?;

    let state = Arc::new(AppState {
        config,
        registry: Arc::clone(&registry),
        registrar: Arc::clone(&registrar),
        sip_transport,
        local_ip,
        started_at: Instant::now(),
    });

    let app = web::build_router(Arc::clone(&state));

    let sweep_registrar = Arc::clone(&registrar);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(BINDING_SWEEP_INTERVAL).await;
            for user in sweep_registrar.sweep_expired() {
                tracing::info!(%user, "swept expired SIP registration");
            }
        }
    });

    let listener = TcpListener::bind(http_bind)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {http_bind}"))?;

    tracing::info!(%http_bind, %sip_bind, %local_ip, "doorbell bridge ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    tracing::info!("shutting down, tearing down active bridge sessions");
    session::teardown_all(&registry).await;
    tracing::info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
