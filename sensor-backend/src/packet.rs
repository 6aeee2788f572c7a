//! Datagram codec for the 40-channel spinning sensor.
//!
//! ## Wire layout (all multi-byte fields little-endian)
//!
//! A datagram is exactly 1262 bytes, or 1266 when the sensor appends a
//! 4-byte UDP sequence number:
//!
//! ```text
//! [0..1240)    ten data blocks, 124 bytes each:
//!                0xFF 0xEE preamble (decodes as u16 0xEEFF)
//!                u16 azimuth in 0.01° ticks
//!                40 × { u16 distance in 4 mm units, u8 intensity }
//! [1240..1262) 22-byte tail:
//!                reserved[5], high_temp_flag, reserved[2],
//!                u16 motor speed (RPM), u32 timestamp (µs),
//!                return mode, factory info,
//!                { year−2000, month, day, hour, minute, second }
//! [1262..1266) u32 sequence number (1266-byte variant only)
//! ```
//!
//! Zero-distance returns are dropped before a point is constructed. An
//! invalid preamble or a truncated block/tail aborts the whole packet; the
//! pipeline logs it and moves on.

use std::env;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Datelike, NaiveDate, Timelike};
use thiserror::Error;

use frame_types::PolarPoint;

use crate::calibration::{Calibration, CHANNEL_COUNT};

// ── Wire constants ────────────────────────────────────────────────────────────

pub const PACKET_LEN: usize = 1262;
pub const PACKET_LEN_SEQ: usize = 1266;
pub const BLOCKS_PER_PACKET: usize = 10;
pub const CHANNELS_PER_BLOCK: usize = CHANNEL_COUNT;
pub const CHANNEL_RECORD_LEN: usize = 3;
pub const BLOCK_LEN: usize = 4 + CHANNELS_PER_BLOCK * CHANNEL_RECORD_LEN;
pub const BLOCKS_LEN: usize = BLOCKS_PER_PACKET * BLOCK_LEN;
pub const TAIL_LEN: usize = 22;

/// The `FF EE` byte pair read as a little-endian u16.
pub const BLOCK_PREAMBLE: u16 = 0xEEFF;
/// Metres per raw distance unit.
pub const DISTANCE_UNIT_M: f64 = 0.004;
/// Degrees per raw azimuth tick.
pub const AZIMUTH_UNIT_DEG: f64 = 0.01;

/// Consecutive identical `timestamp_us` values before PTP/GPS falls back to
/// the wall clock.
pub const STATIC_TS_THRESHOLD: u32 = 10;

/// Environment variable selecting the timestamp mode.
pub const TIME_SOURCE_ENV: &str = "LIDAR_TIME_SOURCE";

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("invalid packet size {0} (expected {PACKET_LEN} or {PACKET_LEN_SEQ})")]
    InvalidSize(usize),
    #[error("bad preamble 0x{found:04x} in block {block}")]
    BadPreamble { block: usize, found: u16 },
    #[error("truncated channel record {channel} in block {block}")]
    ShortChannel { block: usize, channel: usize },
    #[error("packet tail truncated")]
    ShortTail,
}

// ── Timestamp mode ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampMode {
    /// Wall clock at reception
    #[default]
    System,
    /// Boot epoch + device microsecond counter, wall-clock fallback when the
    /// counter goes static
    Ptp,
    /// Identical handling to [`TimestampMode::Ptp`]
    Gps,
    /// Boot epoch + device microsecond counter, no fallback
    Internal,
    /// The tail's own date-time + microseconds
    Lidar,
}

impl TimestampMode {
    pub fn from_env() -> Self {
        Self::parse(&env::var(TIME_SOURCE_ENV).unwrap_or_default())
    }

    /// Unknown or empty values select [`TimestampMode::System`].
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "ptp" => Self::Ptp,
            "gps" => Self::Gps,
            "internal" => Self::Internal,
            "lidar" => Self::Lidar,
            _ => Self::System,
        }
    }
}

// ── Tail ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailDateTime {
    /// Years since 2000
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// The 22-byte packet trailer. Reserved regions are kept verbatim; captures
/// disagree on their contents, so nothing here interprets them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketTail {
    pub reserved_head: [u8; 5],
    pub high_temp_flag: u8,
    pub reserved_mid: [u8; 2],
    pub motor_speed_rpm: u16,
    pub timestamp_us: u32,
    pub return_mode: u8,
    pub factory_info: u8,
    pub date_time: TailDateTime,
}

impl PacketTail {
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < TAIL_LEN {
            return Err(PacketError::ShortTail);
        }
        let mut reserved_head = [0u8; 5];
        reserved_head.copy_from_slice(&data[0..5]);
        Ok(Self {
            reserved_head,
            high_temp_flag: data[5],
            reserved_mid: [data[6], data[7]],
            motor_speed_rpm: u16::from_le_bytes([data[8], data[9]]),
            timestamp_us: u32::from_le_bytes([data[10], data[11], data[12], data[13]]),
            return_mode: data[14],
            factory_info: data[15],
            date_time: TailDateTime {
                year: data[16],
                month: data[17],
                day: data[18],
                hour: data[19],
                minute: data[20],
                second: data[21],
            },
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.reserved_head);
        out.push(self.high_temp_flag);
        out.extend_from_slice(&self.reserved_mid);
        out.extend_from_slice(&self.motor_speed_rpm.to_le_bytes());
        out.extend_from_slice(&self.timestamp_us.to_le_bytes());
        out.push(self.return_mode);
        out.push(self.factory_info);
        out.push(self.date_time.year);
        out.push(self.date_time.month);
        out.push(self.date_time.day);
        out.push(self.date_time.hour);
        out.push(self.date_time.minute);
        out.push(self.date_time.second);
    }

    /// Build a tail for re-packetisation from an absolute timestamp.
    pub fn from_timestamp_ns(timestamp_ns: i64, motor_speed_rpm: u16) -> Self {
        let datetime = DateTime::from_timestamp_nanos(timestamp_ns);
        let year = (datetime.year() - 2000).clamp(0, 255) as u8;
        Self {
            reserved_head: [0; 5],
            high_temp_flag: 0,
            reserved_mid: [0; 2],
            motor_speed_rpm,
            timestamp_us: datetime.timestamp_subsec_micros(),
            return_mode: 0,
            factory_info: 0,
            date_time: TailDateTime {
                year,
                month: datetime.month() as u8,
                day: datetime.day() as u8,
                hour: datetime.hour() as u8,
                minute: datetime.minute() as u8,
                second: datetime.second() as u8,
            },
        }
    }

    pub fn is_high_temp(&self) -> bool {
        self.high_temp_flag != 0
    }

    /// The tail's date-time plus its microsecond counter, as nanoseconds
    /// since the Unix epoch. `None` when the date fields are nonsense.
    pub fn combined_timestamp_ns(&self) -> Option<i64> {
        let date = NaiveDate::from_ymd_opt(
            2000 + i32::from(self.date_time.year),
            u32::from(self.date_time.month),
            u32::from(self.date_time.day),
        )?;
        let datetime = date.and_hms_opt(
            u32::from(self.date_time.hour),
            u32::from(self.date_time.minute),
            u32::from(self.date_time.second),
        )?;
        let base = datetime.and_utc().timestamp_nanos_opt()?;
        Some(base + i64::from(self.timestamp_us) * 1_000)
    }
}

// ── Raw blocks ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawChannel {
    /// Distance in 4 mm units; 0 means no return
    pub distance: u16,
    pub intensity: u8,
}

/// One 124-byte data block: a single firing of all 40 channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBlock {
    /// Azimuth in 0.01° ticks
    pub azimuth: u16,
    pub channels: [RawChannel; CHANNELS_PER_BLOCK],
}

impl Default for RawBlock {
    fn default() -> Self {
        Self {
            azimuth: 0,
            channels: [RawChannel::default(); CHANNELS_PER_BLOCK],
        }
    }
}

impl RawBlock {
    pub fn decode(data: &[u8], block: usize) -> Result<Self, PacketError> {
        if data.len() < 4 {
            return Err(PacketError::ShortChannel { block, channel: 0 });
        }
        let preamble = u16::from_le_bytes([data[0], data[1]]);
        if preamble != BLOCK_PREAMBLE {
            return Err(PacketError::BadPreamble {
                block,
                found: preamble,
            });
        }
        let azimuth = u16::from_le_bytes([data[2], data[3]]);
        let mut channels = [RawChannel::default(); CHANNELS_PER_BLOCK];
        for (channel, slot) in channels.iter_mut().enumerate() {
            let offset = 4 + channel * CHANNEL_RECORD_LEN;
            let record = data
                .get(offset..offset + CHANNEL_RECORD_LEN)
                .ok_or(PacketError::ShortChannel { block, channel })?;
            *slot = RawChannel {
                distance: u16::from_le_bytes([record[0], record[1]]),
                intensity: record[2],
            };
        }
        Ok(Self { azimuth, channels })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&BLOCK_PREAMBLE.to_le_bytes());
        out.extend_from_slice(&self.azimuth.to_le_bytes());
        for channel in &self.channels {
            out.extend_from_slice(&channel.distance.to_le_bytes());
            out.push(channel.intensity);
        }
    }
}

/// Assemble a full datagram from raw blocks and a tail. The inverse of
/// [`Parser::parse`] at the wire level; used by the LidarView forwarder and
/// by tests.
pub fn encode_packet(blocks: &[RawBlock], tail: &PacketTail, udp_seq: Option<u32>) -> Vec<u8> {
    debug_assert_eq!(blocks.len(), BLOCKS_PER_PACKET);
    let mut out = Vec::with_capacity(if udp_seq.is_some() {
        PACKET_LEN_SEQ
    } else {
        PACKET_LEN
    });
    for block in blocks {
        block.encode(&mut out);
    }
    tail.encode(&mut out);
    if let Some(seq) = udp_seq {
        out.extend_from_slice(&seq.to_le_bytes());
    }
    out
}

// ── Parser ────────────────────────────────────────────────────────────────────

/// One decoded datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPacket {
    pub points: Vec<PolarPoint>,
    pub motor_speed_rpm: u16,
    pub tail: PacketTail,
    /// 0 when the packet carried no sequence suffix
    pub udp_seq: u32,
}

/// Stateful packet decoder: calibration-aware point construction plus the
/// timestamp-mode state machine.
pub struct Parser {
    calibration: Arc<Calibration>,
    mode: TimestampMode,
    boot_epoch_ns: i64,
    packet_count: u64,
    last_timestamp_us: Option<u32>,
    static_streak: u32,
    static_fallback: bool,
    pending_override_ns: Option<i64>,
    last_motor_rpm: u16,
}

impl Parser {
    pub fn new(calibration: Arc<Calibration>, mode: TimestampMode) -> Self {
        Self {
            calibration,
            mode,
            boot_epoch_ns: wall_clock_ns(),
            packet_count: 0,
            last_timestamp_us: None,
            static_streak: 0,
            static_fallback: false,
            pending_override_ns: None,
            last_motor_rpm: 0,
        }
    }

    pub fn mode(&self) -> TimestampMode {
        self.mode
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    /// Motor speed from the most recent tail, for the assembler's timing.
    pub fn last_motor_rpm(&self) -> u16 {
        self.last_motor_rpm
    }

    /// Force the next packet's timestamp. One-shot: cleared after a single
    /// `parse`. Used when replaying captures with recorded receive times.
    pub fn set_timestamp_override(&mut self, timestamp_ns: i64) {
        self.pending_override_ns = Some(timestamp_ns);
    }

    pub fn parse(&mut self, data: &[u8], recv_wall_ns: i64) -> Result<ParsedPacket, PacketError> {
        let (body, udp_seq) = match data.len() {
            PACKET_LEN => (data, 0),
            PACKET_LEN_SEQ => {
                let seq = u32::from_le_bytes([
                    data[PACKET_LEN],
                    data[PACKET_LEN + 1],
                    data[PACKET_LEN + 2],
                    data[PACKET_LEN + 3],
                ]);
                (&data[..PACKET_LEN], seq)
            }
            n => return Err(PacketError::InvalidSize(n)),
        };

        let tail = PacketTail::decode(&body[BLOCKS_LEN..])?;
        let packet_ts_ns = self.arbitrate_timestamp(&tail, recv_wall_ns);
        self.packet_count += 1;
        self.last_motor_rpm = tail.motor_speed_rpm;

        let deg_per_us = f64::from(tail.motor_speed_rpm) * 360.0 / 60.0 / 1e6;

        let mut points = Vec::with_capacity(BLOCKS_PER_PACKET * CHANNELS_PER_BLOCK);
        for block_id in 0..BLOCKS_PER_PACKET {
            let offset = block_id * BLOCK_LEN;
            let raw = RawBlock::decode(&body[offset..offset + BLOCK_LEN], block_id)?;
            for (channel, record) in raw.channels.iter().enumerate() {
                if record.distance == 0 {
                    continue;
                }
                let firetime_us = self.calibration.firetime_us(channel);
                let azimuth_deg = normalize_azimuth(
                    f64::from(raw.azimuth) * AZIMUTH_UNIT_DEG
                        + self.calibration.azimuth_deg(channel)
                        + firetime_us * deg_per_us,
                );
                points.push(PolarPoint {
                    channel: (channel + 1) as u8,
                    azimuth_deg,
                    elevation_deg: self.calibration.elevation_deg(channel),
                    distance_m: f64::from(record.distance) * DISTANCE_UNIT_M,
                    intensity: record.intensity,
                    timestamp_ns: packet_ts_ns + (firetime_us * 1_000.0) as i64,
                    block_id: block_id as u8,
                    udp_seq,
                    raw_block_azimuth: raw.azimuth,
                });
            }
        }

        Ok(ParsedPacket {
            points,
            motor_speed_rpm: tail.motor_speed_rpm,
            tail,
            udp_seq,
        })
    }

    fn arbitrate_timestamp(&mut self, tail: &PacketTail, recv_wall_ns: i64) -> i64 {
        match self.last_timestamp_us {
            Some(last) if last == tail.timestamp_us => {
                self.static_streak += 1;
                if self.static_streak >= STATIC_TS_THRESHOLD && !self.static_fallback {
                    self.static_fallback = true;
                    tracing::warn!(
                        timestamp_us = tail.timestamp_us,
                        "device timestamp static, falling back to wall clock"
                    );
                }
            }
            _ => {
                self.static_streak = 0;
                self.static_fallback = false;
            }
        }
        self.last_timestamp_us = Some(tail.timestamp_us);

        if let Some(override_ns) = self.pending_override_ns.take() {
            return override_ns;
        }

        let device_ns = self.boot_epoch_ns + i64::from(tail.timestamp_us) * 1_000;
        match self.mode {
            TimestampMode::System => recv_wall_ns,
            TimestampMode::Lidar => tail.combined_timestamp_ns().unwrap_or(recv_wall_ns),
            TimestampMode::Internal => device_ns,
            TimestampMode::Ptp | TimestampMode::Gps => {
                if self.static_fallback {
                    recv_wall_ns
                } else {
                    device_ns
                }
            }
        }
    }
}

/// Fold an azimuth into [0, 360). A single correction suffices: raw azimuth
/// is bounded and calibration deltas stay under ±2°.
pub fn normalize_azimuth(degrees: f64) -> f64 {
    if degrees >= 360.0 {
        degrees - 360.0
    } else if degrees < 0.0 {
        degrees + 360.0
    } else {
        degrees
    }
}

pub(crate) fn wall_clock_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{AngleCorrection, FiretimeCorrection};

    /// Calibration with every correction zeroed, so wire values pass through.
    fn zero_calibration() -> Arc<Calibration> {
        calibration_with(|_| (0.0, 0.0), |_| 0.0)
    }

    fn calibration_with(
        angle: impl Fn(usize) -> (f64, f64),
        firetime: impl Fn(usize) -> f64,
    ) -> Arc<Calibration> {
        let angles = (0..CHANNEL_COUNT)
            .map(|i| {
                let (elevation_deg, azimuth_deg) = angle(i);
                AngleCorrection {
                    channel: (i + 1) as u8,
                    elevation_deg,
                    azimuth_deg,
                }
            })
            .collect();
        let firetimes = (0..CHANNEL_COUNT)
            .map(|i| FiretimeCorrection {
                channel: (i + 1) as u8,
                firetime_us: firetime(i),
            })
            .collect();
        Arc::new(Calibration::from_parts(angles, firetimes).unwrap())
    }

    fn test_tail(timestamp_us: u32, motor_speed_rpm: u16) -> PacketTail {
        PacketTail {
            reserved_head: [0; 5],
            high_temp_flag: 0,
            reserved_mid: [0; 2],
            motor_speed_rpm,
            timestamp_us,
            return_mode: 0x39,
            factory_info: 0x42,
            date_time: TailDateTime {
                year: 23,
                month: 6,
                day: 15,
                hour: 10,
                minute: 30,
                second: 0,
            },
        }
    }

    /// A packet whose ten blocks start at `start_azimuth` ticks and step by
    /// `step` ticks, with one return on every channel.
    fn test_packet(start_azimuth: u16, step: u16, tail: &PacketTail, seq: Option<u32>) -> Vec<u8> {
        let mut blocks = [RawBlock::default(); BLOCKS_PER_PACKET];
        for (i, block) in blocks.iter_mut().enumerate() {
            block.azimuth = (start_azimuth as u32 + i as u32 * step as u32).rem_euclid(36_000) as u16;
            for (ch, slot) in block.channels.iter_mut().enumerate() {
                slot.distance = 1_000 + ch as u16;
                slot.intensity = (ch * 5 % 256) as u8;
            }
        }
        encode_packet(&blocks, tail, seq)
    }

    #[test]
    fn size_gate_accepts_exactly_the_two_wire_lengths() {
        let mut parser = Parser::new(zero_calibration(), TimestampMode::System);
        for len in [0usize, 10, 1261, 1263, 1265, 1366] {
            let data = vec![0u8; len];
            assert_eq!(
                parser.parse(&data, 0),
                Err(PacketError::InvalidSize(len)),
                "length {len} must be rejected"
            );
        }
        let tail = test_tail(1_000, 600);
        assert!(parser.parse(&test_packet(0, 360, &tail, None), 0).is_ok());
        assert!(parser
            .parse(&test_packet(0, 360, &tail, Some(7)), 0)
            .is_ok());
    }

    #[test]
    fn sequence_suffix_is_extracted_and_trimmed() {
        let mut parser = Parser::new(zero_calibration(), TimestampMode::System);
        let tail = test_tail(0, 600);
        let parsed = parser
            .parse(&test_packet(0, 360, &tail, Some(0xDEAD_BEEF)), 0)
            .unwrap();
        assert_eq!(parsed.udp_seq, 0xDEAD_BEEF);
        assert!(parsed.points.iter().all(|p| p.udp_seq == 0xDEAD_BEEF));
        assert_eq!(parsed.tail, tail);
    }

    #[test]
    fn bad_preamble_aborts_the_packet() {
        let mut parser = Parser::new(zero_calibration(), TimestampMode::System);
        let mut data = test_packet(0, 360, &test_tail(0, 600), None);
        // Corrupt block 3's preamble.
        data[3 * BLOCK_LEN] = 0x00;
        assert_eq!(
            parser.parse(&data, 0),
            Err(PacketError::BadPreamble {
                block: 3,
                found: 0xEE00
            })
        );
    }

    #[test]
    fn all_zero_distances_yield_no_points_but_no_error() {
        let mut parser = Parser::new(zero_calibration(), TimestampMode::System);
        let blocks = [RawBlock::default(); BLOCKS_PER_PACKET];
        let mut data = Vec::new();
        for block in &blocks {
            block.encode(&mut data);
        }
        test_tail(0, 600).encode(&mut data);
        let parsed = parser.parse(&data, 0).unwrap();
        assert!(parsed.points.is_empty());
    }

    #[test]
    fn decoded_azimuths_are_normalised_and_distances_positive() {
        // Azimuth corrections push some block azimuths past 360 and below 0.
        let calibration = calibration_with(
            |i| (0.0, if i % 2 == 0 { 1.8 } else { -1.8 }),
            |_| 0.0,
        );
        let mut parser = Parser::new(calibration, TimestampMode::System);
        for start in [0u16, 17_990, 35_950] {
            let parsed = parser
                .parse(&test_packet(start, 360, &test_tail(0, 600), None), 0)
                .unwrap();
            assert!(!parsed.points.is_empty());
            for point in &parsed.points {
                assert!((0.0..360.0).contains(&point.azimuth_deg), "{point:?}");
                assert!(point.distance_m > 0.0);
            }
        }
    }

    #[test]
    fn firetime_offset_scales_with_motor_speed() {
        // 600 RPM → 0.0036°/µs, so a +5 µs firetime shifts azimuth +0.018°.
        let calibration = calibration_with(|_| (0.0, 0.0), |i| if i == 0 { 5.0 } else { 0.0 });
        let mut parser = Parser::new(calibration, TimestampMode::System);
        let parsed = parser
            .parse(&test_packet(9_000, 0, &test_tail(0, 600), None), 0)
            .unwrap();
        let base = 9_000.0 * AZIMUTH_UNIT_DEG;
        let channel_1 = parsed.points.iter().find(|p| p.channel == 1).unwrap();
        let channel_2 = parsed.points.iter().find(|p| p.channel == 2).unwrap();
        assert!((channel_1.azimuth_deg - (base + 0.018)).abs() < 1e-9);
        assert!((channel_2.azimuth_deg - base).abs() < 1e-9);
    }

    #[test]
    fn firetime_offsets_point_timestamps() {
        let calibration = calibration_with(|_| (0.0, 0.0), |i| i as f64 * 1.5);
        let mut parser = Parser::new(calibration, TimestampMode::System);
        let parsed = parser
            .parse(&test_packet(0, 360, &test_tail(0, 600), None), 1_000_000)
            .unwrap();
        let channel_3 = parsed.points.iter().find(|p| p.channel == 3).unwrap();
        assert_eq!(channel_3.timestamp_ns, 1_000_000 + 3_000);
    }

    #[test]
    fn static_ptp_timestamp_falls_back_to_wall_clock() {
        let mut parser = Parser::new(zero_calibration(), TimestampMode::Ptp);
        let device_ns = parser.boot_epoch_ns + 555_000;
        let tail = test_tail(555, 600);

        // Ten packets with the same device timestamp parse normally.
        for i in 0..10 {
            let wall = 1_000_000_000 + i;
            let parsed = parser.parse(&test_packet(0, 360, &tail, None), wall).unwrap();
            assert_eq!(parsed.points[0].timestamp_ns, device_ns, "packet {i}");
        }

        // The eleventh trips the fallback.
        let parsed = parser
            .parse(&test_packet(0, 360, &tail, None), 2_000_000_000)
            .unwrap();
        assert_eq!(parsed.points[0].timestamp_ns, 2_000_000_000);

        // A fresh device value recovers device timestamps.
        let moved = test_tail(556, 600);
        let parsed = parser
            .parse(&test_packet(0, 360, &moved, None), 3_000_000_000)
            .unwrap();
        assert_eq!(parsed.points[0].timestamp_ns, parser.boot_epoch_ns + 556_000);
    }

    #[test]
    fn timestamp_override_applies_to_exactly_one_packet() {
        let mut parser = Parser::new(zero_calibration(), TimestampMode::System);
        parser.set_timestamp_override(42);
        let tail = test_tail(0, 600);
        let first = parser.parse(&test_packet(0, 360, &tail, None), 7_000).unwrap();
        assert_eq!(first.points[0].timestamp_ns, 42);
        let second = parser.parse(&test_packet(0, 360, &tail, None), 7_000).unwrap();
        assert_eq!(second.points[0].timestamp_ns, 7_000);
    }

    #[test]
    fn lidar_mode_uses_the_tail_clock() {
        let mut parser = Parser::new(zero_calibration(), TimestampMode::Lidar);
        let tail = test_tail(500, 600);
        let parsed = parser.parse(&test_packet(0, 360, &tail, None), 1).unwrap();
        let expected = tail.combined_timestamp_ns().unwrap();
        assert_eq!(parsed.points[0].timestamp_ns, expected);
        // 2023-06-15 10:30:00 UTC + 500 µs
        assert_eq!(expected, 1_686_825_000 * 1_000_000_000 + 500_000);
    }

    #[test]
    fn tail_round_trips_through_the_encoder() {
        let tail = PacketTail {
            reserved_head: [1, 2, 3, 4, 5],
            high_temp_flag: 0x33,
            reserved_mid: [6, 7],
            motor_speed_rpm: 30_585, // physically impossible, stored anyway
            timestamp_us: 999_999,
            return_mode: 0x37,
            factory_info: 0x40,
            date_time: TailDateTime {
                year: 24,
                month: 12,
                day: 31,
                hour: 23,
                minute: 59,
                second: 58,
            },
        };
        let mut bytes = Vec::new();
        tail.encode(&mut bytes);
        assert_eq!(bytes.len(), TAIL_LEN);
        assert_eq!(PacketTail::decode(&bytes).unwrap(), tail);
        assert!(tail.is_high_temp());
    }

    #[test]
    fn short_tail_is_rejected() {
        assert_eq!(PacketTail::decode(&[0u8; 21]), Err(PacketError::ShortTail));
    }

    #[test]
    fn short_block_is_rejected() {
        let mut data = Vec::new();
        RawBlock::default().encode(&mut data);
        assert_eq!(
            RawBlock::decode(&data[..100], 0),
            Err(PacketError::ShortChannel {
                block: 0,
                channel: 32
            })
        );
    }

    #[test]
    fn normalize_azimuth_is_idempotent() {
        for value in [-359.99, -0.0001, 0.0, 12.34, 359.999, 360.0, 718.5] {
            let once = normalize_azimuth(value);
            assert_eq!(normalize_azimuth(once), once);
            if (-360.0..720.0).contains(&value) {
                assert!((0.0..360.0).contains(&once), "{value} → {once}");
            }
        }
    }

    #[test]
    fn env_selects_the_timestamp_mode() {
        assert_eq!(TimestampMode::parse("ptp"), TimestampMode::Ptp);
        assert_eq!(TimestampMode::parse("GPS"), TimestampMode::Gps);
        assert_eq!(TimestampMode::parse("internal"), TimestampMode::Internal);
        assert_eq!(TimestampMode::parse("lidar"), TimestampMode::Lidar);
        assert_eq!(TimestampMode::parse("system"), TimestampMode::System);
        assert_eq!(TimestampMode::parse(""), TimestampMode::System);
        assert_eq!(TimestampMode::parse("nonsense"), TimestampMode::System);
    }
}
