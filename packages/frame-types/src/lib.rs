//! # frame-types
//!
//! Canonical frame data model for the Roadwatch roadside sensing pipeline.
//!
//! These types are used by:
//! - `sensor-backend`: assembling sweeps, broadcasting `FrameBundle`s,
//!   recording and replaying them
//! - external perception stages: clusters and tracks are produced elsewhere
//!   and relayed through the bundle untouched
//! - visualisation clients: the bundle is the unit of streaming
//!
//! ## Coordinate Conventions
//!
//! - **Sensor frame**: right-hand Cartesian, X = right, Y = forward, Z = up
//! - **Azimuth**: degrees, 0° at sensor front, increasing clockwise
//!   (raw wire storage: 0.01° ticks)
//! - **Elevation**: degrees, 0° horizontal, positive up
//!
//! ## Invariants
//!
//! - All five parallel arrays of a [`PointCloudFrame`] have identical length
//! - Cloud buffers stay pool-owned while `ref_count > 0` and are returned to
//!   the pool exactly once, when the count drops to zero or below
//! - Frames leave the assembler with strictly increasing `frame_id`

pub mod pool;

mod bundle;
mod points;

pub use bundle::{
    BackgroundSnapshot, CloudBuffers, Cluster, ClusterSet, DecimationMode, FrameBundle, FrameMeta,
    FrameType, PlaybackInfo, PointCloudFrame, Track, TrackSet,
};
pub use points::{CartesianPoint, CloudPoint, LidarFrame, PolarPoint};
