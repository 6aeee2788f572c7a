//! LidarView UDP forwarder.
//!
//! Re-packetises each foreground sweep's polar attributes into the inbound
//! wire format and sends it on, so third-party viewers can render the stream
//! without speaking our bundle format. Pure passthrough: raw block azimuths
//! and raw distances are written back untransformed. Send errors are logged
//! and dropped, never propagated.

use std::io;
use std::net::UdpSocket;

use tracing::{debug, warn};

use frame_types::LidarFrame;

use crate::packet::{
    encode_packet, PacketTail, RawBlock, RawChannel, BLOCKS_PER_PACKET, DISTANCE_UNIT_M,
};

/// Environment variable naming the forward target, e.g. `127.0.0.1:2369`.
pub const FORWARD_ADDR_ENV: &str = "FORWARD_ADDR";

pub struct LidarViewForwarder {
    socket: UdpSocket,
    target: String,
}

impl LidarViewForwarder {
    pub fn new(target: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self {
            socket,
            target: target.to_string(),
        })
    }

    /// Attach from the environment; `None` when no target is configured.
    pub fn from_env() -> Option<Self> {
        let target = std::env::var(FORWARD_ADDR_ENV).ok()?;
        if target.trim().is_empty() {
            return None;
        }
        match Self::new(target.trim()) {
            Ok(forwarder) => Some(forwarder),
            Err(e) => {
                warn!("forwarder: could not open socket for {target}: {e}");
                None
            }
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Re-packetise one sweep and send it. Returns the number of datagrams
    /// written (also exposed for tests via [`repacketise`]).
    pub fn forward_frame(&self, frame: &LidarFrame, motor_speed_rpm: u16) -> usize {
        let packets = repacketise(frame, motor_speed_rpm);
        let mut sent = 0;
        for packet in &packets {
            match self.socket.send_to(packet, &self.target) {
                Ok(_) => sent += 1,
                Err(e) => {
                    warn!("forwarder: send to {} failed: {e}", self.target);
                }
            }
        }
        debug!(
            frame_id = frame.frame_id,
            datagrams = sent,
            "forwarded sweep"
        );
        sent
    }
}

/// Group a sweep's points back into wire blocks and packets.
///
/// Points arrive ordered as decoded, so a block boundary is simply a change
/// of `(raw_block_azimuth, block_id)`. Trailing short packets are padded
/// with empty blocks (all-zero distances decode to no points).
pub fn repacketise(frame: &LidarFrame, motor_speed_rpm: u16) -> Vec<Vec<u8>> {
    let mut blocks: Vec<RawBlock> = Vec::new();
    let mut current_key: Option<(u16, u8)> = None;

    for point in &frame.points {
        let key = (point.polar.raw_block_azimuth, point.polar.block_id);
        if current_key != Some(key) {
            blocks.push(RawBlock {
                azimuth: point.polar.raw_block_azimuth,
                ..RawBlock::default()
            });
            current_key = Some(key);
        }
        if let Some(block) = blocks.last_mut() {
            let channel = usize::from(point.polar.channel.saturating_sub(1));
            if channel < block.channels.len() {
                block.channels[channel] = RawChannel {
                    distance: (point.polar.distance_m / DISTANCE_UNIT_M).round() as u16,
                    intensity: point.polar.intensity,
                };
            }
        }
    }

    let tail = PacketTail::from_timestamp_ns(frame.end_ts_ns, motor_speed_rpm);
    blocks
        .chunks(BLOCKS_PER_PACKET)
        .map(|chunk| {
            let mut padded = [RawBlock::default(); BLOCKS_PER_PACKET];
            for (slot, block) in padded.iter_mut().zip(chunk.iter()) {
                *slot = *block;
            }
            // Padding blocks keep the last real azimuth so viewers see a
            // continuous sweep.
            if let Some(last) = chunk.last() {
                for slot in padded.iter_mut().skip(chunk.len()) {
                    slot.azimuth = last.azimuth;
                }
            }
            encode_packet(&padded, &tail, None)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_types::{CloudPoint, PolarPoint};

    use crate::packet::PACKET_LEN;

    fn point(raw_azimuth: u16, block_id: u8, channel: u8, distance_m: f64) -> CloudPoint {
        let polar = PolarPoint {
            channel,
            azimuth_deg: f64::from(raw_azimuth) * 0.01,
            elevation_deg: 0.0,
            distance_m,
            intensity: channel,
            timestamp_ns: 5_000,
            block_id,
            udp_seq: 0,
            raw_block_azimuth: raw_azimuth,
        };
        CloudPoint {
            position: polar.to_cartesian(),
            polar,
        }
    }

    fn sweep(blocks: usize) -> LidarFrame {
        let mut points = Vec::new();
        for block in 0..blocks {
            let azimuth = (block * 360) as u16;
            for channel in 1..=3u8 {
                points.push(point(azimuth, (block % 10) as u8, channel, 8.0));
            }
        }
        LidarFrame {
            sensor_id: "pandar40p-0".to_string(),
            frame_id: 1,
            start_ts_ns: 0,
            end_ts_ns: 1_700_000_000_000_000_000,
            points,
        }
    }

    #[test]
    fn repacketised_output_matches_the_wire_format() {
        let packets = repacketise(&sweep(25), 600);
        assert_eq!(packets.len(), 3); // 25 blocks → 2 full packets + padding
        for packet in &packets {
            assert_eq!(packet.len(), PACKET_LEN);
        }
    }

    #[test]
    fn raw_values_pass_through_untouched() {
        let frame = sweep(10);
        let packets = repacketise(&frame, 600);
        assert_eq!(packets.len(), 1);

        let block = RawBlock::decode(&packets[0][..124], 0).unwrap();
        assert_eq!(block.azimuth, 0);
        // 8.0 m / 0.004 = 2000 raw units
        assert_eq!(block.channels[0].distance, 2_000);
        assert_eq!(block.channels[0].intensity, 1);
        assert_eq!(block.channels[2].distance, 2_000);
        assert_eq!(block.channels[3].distance, 0);
    }

    #[test]
    fn padding_blocks_carry_no_returns() {
        let packets = repacketise(&sweep(12), 600);
        assert_eq!(packets.len(), 2);
        let padding = RawBlock::decode(&packets[1][3 * 124..4 * 124], 3).unwrap();
        assert!(padding.channels.iter().all(|c| c.distance == 0));
        // Padding keeps the last real azimuth.
        assert_eq!(padding.azimuth, 11 * 360);
    }
}
