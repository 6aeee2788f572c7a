//! # lidar_hub
//!
//! UDP ingest for the spinning sensor — receives raw datagrams, decodes and
//! assembles them, and feeds completed sweeps into the publisher.
//!
//! ## Architecture
//! Two Tokio tasks per sensor:
//!   1. A reader bound to `0.0.0.0:{LIDAR_UDP_PORT}` that pushes each
//!      datagram (with its receive wall clock) onto a bounded queue
//!   2. A decode worker owning the codec and assembler, single-threaded so
//!      neither needs shared mutable state
//!
//! ## Invariants
//! - UDP errors never crash the task; malformed packets are logged, counted
//!   and discarded, and the assembler keeps its state
//! - A completed sweep is forwarded (when a LidarView target is attached)
//!   before being bundled and published

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{info, trace, warn};

use crate::assembler::FrameAssembler;
use crate::bundle::build_bundle;
use crate::calibration::Calibration;
use crate::diagnostics::Diagnostics;
use crate::forwarder::LidarViewForwarder;
use crate::packet::{wall_clock_ns, Parser, TimestampMode, PACKET_LEN_SEQ};
use crate::publisher::Publisher;

pub const UDP_PORT_ENV: &str = "LIDAR_UDP_PORT";
pub const SENSOR_ID_ENV: &str = "LIDAR_SENSOR_ID";

/// Depth of the datagram queue between the reader and the decode worker.
const DATAGRAM_QUEUE_DEPTH: usize = 256;

pub struct LidarHubConfig {
    /// UDP port to listen on (default 2368)
    pub udp_port: u16,
    pub sensor_id: String,
    pub coordinate_frame: String,
    pub time_source: TimestampMode,
}

impl Default for LidarHubConfig {
    fn default() -> Self {
        Self {
            udp_port: std::env::var(UDP_PORT_ENV)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2368),
            sensor_id: std::env::var(SENSOR_ID_ENV)
                .unwrap_or_else(|_| "pandar40p-0".to_string()),
            coordinate_frame: "sensor".to_string(),
            time_source: TimestampMode::from_env(),
        }
    }
}

/// Bind the ingest socket and run the reader loop; the decode worker is
/// spawned alongside. Returns only when the socket is gone.
pub async fn start_lidar_hub(
    config: LidarHubConfig,
    calibration: Arc<Calibration>,
    publisher: Arc<Publisher>,
    forwarder: Option<LidarViewForwarder>,
    diag: Diagnostics,
) {
    let addr = format!("0.0.0.0:{}", config.udp_port);
    let socket = match UdpSocket::bind(&addr).await {
        Ok(socket) => {
            info!(sensor = %config.sensor_id, "LiDAR hub listening on UDP {addr}");
            socket
        }
        Err(e) => {
            warn!("LiDAR hub: could not bind UDP {addr}: {e}");
            return;
        }
    };

    let (tx, rx) = mpsc::channel::<(Vec<u8>, i64)>(DATAGRAM_QUEUE_DEPTH);
    tokio::spawn(decode_worker(
        rx,
        config,
        calibration,
        publisher,
        forwarder,
        diag.clone(),
    ));

    let mut buf = vec![0u8; PACKET_LEN_SEQ + 64];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                Diagnostics::count(&diag.stats().packets_received);
                trace!(%src, len, "datagram received");
                match tx.try_send((buf[..len].to_vec(), wall_clock_ns())) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        Diagnostics::count(&diag.stats().packets_queue_dropped);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            Err(e) => {
                // Never crash the reader on a transient socket error.
                warn!("LiDAR hub: UDP recv error: {e}");
            }
        }
    }
}

async fn decode_worker(
    mut rx: mpsc::Receiver<(Vec<u8>, i64)>,
    config: LidarHubConfig,
    calibration: Arc<Calibration>,
    publisher: Arc<Publisher>,
    forwarder: Option<LidarViewForwarder>,
    diag: Diagnostics,
) {
    let mut parser = Parser::new(calibration, config.time_source);
    let mut assembler = FrameAssembler::new(config.sensor_id.clone());

    while let Some((datagram, wall_ns)) = rx.recv().await {
        match parser.parse(&datagram, wall_ns) {
            Ok(parsed) => {
                Diagnostics::add(&diag.stats().points_decoded, parsed.points.len() as u64);
                assembler.set_motor_speed(parsed.motor_speed_rpm);
                if let Some(frame) = assembler.push(parsed.points, wall_ns) {
                    Diagnostics::count(&diag.stats().frames_assembled);
                    if let Some(forwarder) = &forwarder {
                        forwarder.forward_frame(&frame, parser.last_motor_rpm());
                    }
                    publisher.publish(build_bundle(&frame, &config.coordinate_frame));
                }
            }
            Err(e) => {
                Diagnostics::count(&diag.stats().packets_rejected);
                warn!("LiDAR hub: discarding packet: {e}");
            }
        }
    }
}
