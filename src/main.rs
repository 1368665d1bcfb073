//! edge-relay standalone binary
//!
//! Wires the core up with the built-in static translation service so it
//! can serve a document root without an external translation server.
//! Real deployments inject their own translation and upstream
//! implementations through the library interface.

use anyhow::Context;
use edge_relay::body::Body;
use edge_relay::connection::{run_listener, ConnectionManager};
use edge_relay::control::run_control_socket;
use edge_relay::error::RelayError;
use edge_relay::instance::{Instance, InstanceDeps};
use edge_relay::resource::{HttpResponse, ResourceAddress, UpstreamTransport};
use edge_relay::translation::StaticTranslationService;
use edge_relay::RelayConfig;
use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};
use std::sync::Arc;
use tracing::info;

/// Placeholder transport: the standalone binary serves local files only
struct NoUpstream;

#[async_trait]
impl UpstreamTransport for NoUpstream {
    async fn send_request(
        &self,
        _method: Method,
        address: &ResourceAddress,
        _status: Option<StatusCode>,
        _headers: HeaderMap,
        _body: Body,
    ) -> edge_relay::Result<HttpResponse> {
        Err(RelayError::SocketProtocol(format!(
            "no upstream transport for {}",
            address.cache_key()
        )))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => RelayConfig::from_file(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => RelayConfig::default(),
    };
    let docroot = args.next().unwrap_or_else(|| "/var/www".to_string());

    info!(docroot, "starting edge-relay");

    let instance = Instance::new(
        config.clone(),
        InstanceDeps {
            translation: Arc::new(StaticTranslationService { docroot }),
            transport: Arc::new(NoUpstream),
            nfs_client: None,
            processor: None,
        },
    );
    instance.spawn_timers();

    let manager = Arc::new(ConnectionManager::new(config.max_connections));

    for address in &config.listen {
        let listener = tokio::net::TcpListener::bind(address)
            .await
            .with_context(|| format!("binding {}", address))?;
        tokio::spawn(run_listener(
            instance.clone(),
            manager.clone(),
            listener,
            None,
        ));
    }

    if let Some(address) = &config.control_listen {
        let socket = tokio::net::UdpSocket::bind(address)
            .await
            .with_context(|| format!("binding control socket {}", address))?;
        tokio::spawn(run_control_socket(instance.clone(), socket));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    if let Some(path) = &config.session.save_path {
        let _ = instance.sessions.save(std::path::Path::new(path));
    }
    Ok(())
}
