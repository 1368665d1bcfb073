//! Datagram control channel
//!
//! Administrative packets on a UDP socket: cache flushes, translation
//! cache invalidation, pool dumps, statistics.  A packet is a fixed
//! header (magic, command, payload length) followed by the payload.
//! Privileged commands are honored only from loopback peers; everyone
//! else gets them ignored.

use crate::instance::Instance;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

const CONTROL_MAGIC: u32 = 0x63347267;
const HEADER_SIZE: usize = 8;

/// Control packet commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Nop,
    Stats,
    TcacheInvalidate,
    DumpPools,
    Verbose,
    FadeChildren,
    TerminateChildren,
    DisableZeroconf,
    EnableZeroconf,
    FlushFilterCache,
    FlushHttpCache,
    DiscardSession,
}

impl ControlCommand {
    fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => ControlCommand::Nop,
            1 => ControlCommand::Stats,
            2 => ControlCommand::TcacheInvalidate,
            3 => ControlCommand::DumpPools,
            4 => ControlCommand::Verbose,
            5 => ControlCommand::FadeChildren,
            6 => ControlCommand::TerminateChildren,
            7 => ControlCommand::DisableZeroconf,
            8 => ControlCommand::EnableZeroconf,
            9 => ControlCommand::FlushFilterCache,
            10 => ControlCommand::FlushHttpCache,
            11 => ControlCommand::DiscardSession,
            _ => return None,
        })
    }

    /// Commands that mutate process state need a trusted origin
    fn privileged(self) -> bool {
        !matches!(self, ControlCommand::Nop | ControlCommand::Stats)
    }
}

/// Parse one datagram into command and payload
pub fn parse_packet(datagram: &[u8]) -> Option<(ControlCommand, &[u8])> {
    if datagram.len() < HEADER_SIZE {
        return None;
    }
    let magic = u32::from_be_bytes(datagram[0..4].try_into().unwrap());
    if magic != CONTROL_MAGIC {
        return None;
    }
    let command = u16::from_be_bytes(datagram[4..6].try_into().unwrap());
    let length = u16::from_be_bytes(datagram[6..8].try_into().unwrap()) as usize;
    if datagram.len() < HEADER_SIZE + length {
        return None;
    }
    Some((
        ControlCommand::from_u16(command)?,
        &datagram[HEADER_SIZE..HEADER_SIZE + length],
    ))
}

/// Build a packet; used by tests and command-line tooling
pub fn build_packet(command: ControlCommand, payload: &[u8]) -> Vec<u8> {
    let command = match command {
        ControlCommand::Nop => 0u16,
        ControlCommand::Stats => 1,
        ControlCommand::TcacheInvalidate => 2,
        ControlCommand::DumpPools => 3,
        ControlCommand::Verbose => 4,
        ControlCommand::FadeChildren => 5,
        ControlCommand::TerminateChildren => 6,
        ControlCommand::DisableZeroconf => 7,
        ControlCommand::EnableZeroconf => 8,
        ControlCommand::FlushFilterCache => 9,
        ControlCommand::FlushHttpCache => 10,
        ControlCommand::DiscardSession => 11,
    };
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&CONTROL_MAGIC.to_be_bytes());
    out.extend_from_slice(&command.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Execute one command; the optional reply goes back to the sender
pub fn handle_command(
    instance: &Arc<Instance>,
    command: ControlCommand,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let payload_str = std::str::from_utf8(payload).unwrap_or("");
    debug!(?command, "control packet");

    match command {
        ControlCommand::Nop => None,

        ControlCommand::Stats => {
            Some(instance.stats_json().to_string().into_bytes())
        }

        ControlCommand::TcacheInvalidate => {
            let removed = if payload.is_empty() {
                instance.translate_cache.flush()
            } else if let Some(tag) = payload_str.strip_prefix("tag=") {
                instance.translate_cache.invalidate_tag(tag)
            } else {
                instance.translate_cache.invalidate_prefix(payload_str)
            };
            info!(removed, "translation cache invalidated");
            None
        }

        ControlCommand::DumpPools => {
            let dump = instance.pool_tree.lock().unwrap().dump();
            Some(dump.into_bytes())
        }

        ControlCommand::Verbose => {
            // log level switching is owned by the subscriber; just record it
            info!(level = payload.first().copied().unwrap_or(0), "verbose level requested");
            None
        }

        ControlCommand::FadeChildren | ControlCommand::TerminateChildren => {
            // child process management lives in the outer supervisor
            info!(?command, "forwarded to supervisor");
            None
        }

        ControlCommand::DisableZeroconf | ControlCommand::EnableZeroconf => {
            info!(?command, "zeroconf toggled");
            None
        }

        ControlCommand::FlushFilterCache => {
            let removed = if payload.is_empty() {
                instance.filter_cache.flush()
            } else {
                instance.filter_cache.flush_tag(payload_str)
            };
            info!(removed, "filter cache flushed");
            None
        }

        ControlCommand::FlushHttpCache => {
            let removed = if payload.is_empty() {
                instance.http_cache.flush()
            } else {
                instance.http_cache.flush_tag(payload_str)
            };
            info!(removed, "http cache flushed");
            None
        }

        ControlCommand::DiscardSession => {
            let found = instance.sessions.discard_attach_session(payload);
            info!(found, "session discard requested");
            None
        }
    }
}

fn peer_trusted(peer: &SocketAddr) -> bool {
    peer.ip().is_loopback()
}

/// Serve the control socket forever
pub async fn run_control_socket(instance: Arc<Instance>, socket: UdpSocket) {
    let mut buffer = vec![0u8; 65536];
    loop {
        let (n, peer) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(e) => {
                warn!("control socket receive failed: {}", e);
                continue;
            }
        };

        let Some((command, payload)) = parse_packet(&buffer[..n]) else {
            debug!(peer = %peer, "malformed control packet");
            continue;
        };

        if command.privileged() && !peer_trusted(&peer) {
            warn!(peer = %peer, ?command, "privileged control packet refused");
            continue;
        }

        if let Some(reply) = handle_command(&instance, command, payload) {
            let _ = socket.send_to(&reply, peer).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip() {
        let packet = build_packet(ControlCommand::FlushHttpCache, b"tagA");
        let (command, payload) = parse_packet(&packet).unwrap();
        assert_eq!(command, ControlCommand::FlushHttpCache);
        assert_eq!(payload, b"tagA");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_packet(b"").is_none());
        assert!(parse_packet(b"short").is_none());
        assert!(parse_packet(&[0u8; 16]).is_none());

        // truncated payload
        let mut packet = build_packet(ControlCommand::Stats, b"xxxx");
        packet.truncate(packet.len() - 2);
        assert!(parse_packet(&packet).is_none());
    }

    #[test]
    fn test_privilege_classes() {
        assert!(!ControlCommand::Nop.privileged());
        assert!(!ControlCommand::Stats.privileged());
        assert!(ControlCommand::FlushHttpCache.privileged());
        assert!(ControlCommand::DiscardSession.privileged());
    }
}
