//! Point-level types flowing from the packet codec to the frame assembler.

use serde::{Deserialize, Serialize};

/// One calibrated laser return in polar form, as decoded from a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolarPoint {
    /// Laser channel, 1-based (1..=40)
    pub channel: u8,
    /// Corrected azimuth in degrees, normalised into [0, 360)
    pub azimuth_deg: f64,
    /// Corrected elevation in degrees
    pub elevation_deg: f64,
    /// Range in metres, strictly positive (zero returns are dropped before
    /// a point is ever constructed)
    pub distance_m: f64,
    pub intensity: u8,
    /// Nanoseconds since the Unix epoch, firetime offset applied
    pub timestamp_ns: i64,
    /// Data block this return came from (0..=9)
    pub block_id: u8,
    /// UDP sequence suffix of the carrying packet; 0 when absent
    pub udp_seq: u32,
    /// Uncorrected block azimuth in 0.01° ticks, kept for re-packetisation
    pub raw_block_azimuth: u16,
}

impl PolarPoint {
    /// Project into the sensor Cartesian frame (X right, Y forward, Z up).
    pub fn to_cartesian(&self) -> CartesianPoint {
        let azimuth = self.azimuth_deg.to_radians();
        let elevation = self.elevation_deg.to_radians();
        let horizontal = self.distance_m * elevation.cos();
        CartesianPoint {
            x: (horizontal * azimuth.sin()) as f32,
            y: (horizontal * azimuth.cos()) as f32,
            z: (self.distance_m * elevation.sin()) as f32,
        }
    }
}

/// Position in metres in the sensor Cartesian frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CartesianPoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// A projected point that keeps its polar attributes alongside.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CloudPoint {
    pub position: CartesianPoint,
    pub polar: PolarPoint,
}

/// One full sweep of the sensor.
///
/// Created by the assembler on the first point of a sweep, grown by
/// appending, then frozen and handed downstream when the sweep completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LidarFrame {
    pub sensor_id: String,
    /// Monotonically increasing, assigned on emission
    pub frame_id: u64,
    /// Timestamp of the first accepted point
    pub start_ts_ns: i64,
    /// Timestamp of the last accepted point
    pub end_ts_ns: i64,
    pub points: Vec<CloudPoint>,
}

impl LidarFrame {
    pub fn point_count(&self) -> usize {
        self.points.len()
    }
}
