//! Control channel integration tests

use async_trait::async_trait;
use edge_relay::body::Body;
use edge_relay::control::{build_packet, handle_command, parse_packet, ControlCommand};
use edge_relay::instance::{Instance, InstanceDeps};
use edge_relay::resource::{HttpResponse, ResourceAddress, UpstreamTransport};
use edge_relay::translation::StaticTranslationService;
use edge_relay::{RelayConfig, RelayError};
use http::{HeaderMap, Method, StatusCode};
use std::sync::Arc;

struct NoUpstream;

#[async_trait]
impl UpstreamTransport for NoUpstream {
    async fn send_request(
        &self,
        _method: Method,
        _address: &ResourceAddress,
        _status: Option<StatusCode>,
        _headers: HeaderMap,
        _body: Body,
    ) -> edge_relay::Result<HttpResponse> {
        Err(RelayError::SocketProtocol("no upstream".into()))
    }
}

fn instance() -> Arc<Instance> {
    Instance::new(
        RelayConfig::default(),
        InstanceDeps {
            translation: Arc::new(StaticTranslationService {
                docroot: "/nonexistent".to_string(),
            }),
            transport: Arc::new(NoUpstream),
            nfs_client: None,
            processor: None,
        },
    )
}

#[tokio::test]
async fn test_stats_roundtrip() {
    let instance = instance();

    let packet = build_packet(ControlCommand::Stats, b"");
    let (command, payload) = parse_packet(&packet).unwrap();
    assert_eq!(command, ControlCommand::Stats);

    let reply = handle_command(&instance, command, payload).expect("stats reply");
    let stats: serde_json::Value = serde_json::from_slice(&reply).unwrap();
    assert!(stats.get("http_cache").is_some());
    assert!(stats.get("rubber").is_some());
    assert_eq!(stats["sessions"], 0);
}

#[tokio::test]
async fn test_nop_has_no_reply() {
    let instance = instance();
    assert!(handle_command(&instance, ControlCommand::Nop, b"").is_none());
}

#[tokio::test]
async fn test_dump_pools_shows_root() {
    let instance = instance();
    let reply = handle_command(&instance, ControlCommand::DumpPools, b"").unwrap();
    let dump = String::from_utf8(reply).unwrap();
    assert!(dump.contains("root"));
}

#[tokio::test]
async fn test_flush_commands_are_accepted() {
    let instance = instance();
    assert!(handle_command(&instance, ControlCommand::FlushHttpCache, b"").is_none());
    assert!(handle_command(&instance, ControlCommand::FlushHttpCache, b"tagA").is_none());
    assert!(handle_command(&instance, ControlCommand::FlushFilterCache, b"").is_none());
    assert!(handle_command(&instance, ControlCommand::TcacheInvalidate, b"tag=T").is_none());
    assert!(handle_command(&instance, ControlCommand::TcacheInvalidate, b"/app/").is_none());
}

#[tokio::test]
async fn test_discard_session_by_attach() {
    let instance = instance();

    let lease = instance.sessions.create_session();
    let id = lease.id();
    instance
        .sessions
        .attach(Some(lease), bytes::Bytes::from_static(b"login-xyz"));
    assert_eq!(instance.sessions.count(), 1);

    handle_command(&instance, ControlCommand::DiscardSession, b"login-xyz");
    assert_eq!(instance.sessions.count(), 0);
    assert!(instance.sessions.find(id).is_none());
}

#[tokio::test]
async fn test_metrics_exposition() {
    let instance = instance();
    let text = instance.metrics_text();
    assert!(text.contains("relay_cache_entries"));
    assert!(text.contains("relay_sessions"));
}
