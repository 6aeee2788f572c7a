//! The canonical `FrameBundle` aggregate and its pooled point-cloud payload.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use serde::de::Error as DeError;
use serde::ser::{Error as SerError, SerializeStruct};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::pool;

// ── Frame metadata ────────────────────────────────────────────────────────────

/// Identity and provenance of one bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMeta {
    pub frame_id: u64,
    /// Nanoseconds since the Unix epoch
    pub timestamp_ns: i64,
    pub sensor_id: String,
    /// Descriptor of the coordinate frame the cloud is expressed in,
    /// e.g. "sensor" or a site-calibrated frame name
    pub coordinate_frame: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    #[default]
    Full,
    Foreground,
    Background,
    Delta,
}

/// How the cloud was thinned before publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DecimationMode {
    #[default]
    Full,
    /// Every `n`-th point kept
    Stride(u32),
}

// ── Point cloud payload ───────────────────────────────────────────────────────

/// The five parallel arrays backing one cloud. All the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudBuffers {
    pub x: Vec<f32>,
    pub y: Vec<f32>,
    pub z: Vec<f32>,
    pub intensity: Vec<u8>,
    pub classification: Vec<u8>,
}

impl CloudBuffers {
    /// Acquire zeroed arrays of length `len` from the process pools.
    pub fn acquire(len: usize) -> Self {
        Self {
            x: pool::acquire_f32(len),
            y: pool::acquire_f32(len),
            z: pool::acquire_f32(len),
            intensity: pool::acquire_u8(len),
            classification: pool::acquire_u8(len),
        }
    }

    fn release_to_pool(self) {
        pool::release_f32(self.x);
        pool::release_f32(self.y);
        pool::release_f32(self.z);
        pool::release_u8(self.intensity);
        pool::release_u8(self.classification);
    }
}

/// Pool-backed point cloud with explicit reader accounting.
///
/// Construction leaves `ref_count` at 0. Every additional consumer calls
/// [`retain`](Self::retain) before receiving the frame; every consumer calls
/// [`release`](Self::release) when done. The release that takes the count to
/// zero or below returns the arrays to the pool and nulls the handles, so a
/// single consumer that never retained still releases correctly (0 → −1).
#[derive(Debug)]
pub struct PointCloudFrame {
    len: usize,
    decimation: DecimationMode,
    ref_count: AtomicI32,
    buffers: Mutex<Option<CloudBuffers>>,
}

impl PointCloudFrame {
    pub fn new(buffers: CloudBuffers, decimation: DecimationMode) -> Self {
        let len = buffers.x.len();
        debug_assert_eq!(buffers.y.len(), len);
        debug_assert_eq!(buffers.z.len(), len);
        debug_assert_eq!(buffers.intensity.len(), len);
        debug_assert_eq!(buffers.classification.len(), len);
        Self {
            len,
            decimation,
            ref_count: AtomicI32::new(0),
            buffers: Mutex::new(Some(buffers)),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn decimation(&self) -> DecimationMode {
        self.decimation
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Register one more live reader.
    pub fn retain(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reader. At zero or below the arrays go back to the pool and
    /// the handles are nulled; further releases are no-ops on the buffers.
    pub fn release(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        if prev - 1 <= 0 {
            let taken = self
                .buffers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(buffers) = taken {
                buffers.release_to_pool();
            }
        }
    }

    /// Whether the arrays have already been returned to the pool.
    pub fn is_released(&self) -> bool {
        self.buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    /// Run `f` against the live arrays; `None` once released.
    pub fn with_buffers<R>(&self, f: impl FnOnce(&CloudBuffers) -> R) -> Option<R> {
        let guard = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(f)
    }
}

impl PartialEq for PointCloudFrame {
    fn eq(&self, other: &Self) -> bool {
        if self.len != other.len || self.decimation != other.decimation {
            return false;
        }
        let lhs = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let rhs = other.buffers.lock().unwrap_or_else(|e| e.into_inner());
        *lhs == *rhs
    }
}

impl Serialize for PointCloudFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let guard = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let buffers = guard
            .as_ref()
            .ok_or_else(|| S::Error::custom("point cloud buffers already released"))?;
        let mut st = serializer.serialize_struct("PointCloudFrame", 7)?;
        st.serialize_field("len", &self.len)?;
        st.serialize_field("decimation", &self.decimation)?;
        st.serialize_field("x", &buffers.x)?;
        st.serialize_field("y", &buffers.y)?;
        st.serialize_field("z", &buffers.z)?;
        st.serialize_field("intensity", &buffers.intensity)?;
        st.serialize_field("classification", &buffers.classification)?;
        st.end()
    }
}

#[derive(Deserialize)]
#[serde(rename = "PointCloudFrame")]
struct CloudFrameWire {
    len: usize,
    decimation: DecimationMode,
    x: Vec<f32>,
    y: Vec<f32>,
    z: Vec<f32>,
    intensity: Vec<u8>,
    classification: Vec<u8>,
}

impl<'de> Deserialize<'de> for PointCloudFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = CloudFrameWire::deserialize(deserializer)?;
        let len = wire.len;
        if wire.x.len() != len
            || wire.y.len() != len
            || wire.z.len() != len
            || wire.intensity.len() != len
            || wire.classification.len() != len
        {
            return Err(D::Error::custom("point cloud parallel arrays disagree on length"));
        }
        let buffers = CloudBuffers {
            x: wire.x,
            y: wire.y,
            z: wire.z,
            intensity: wire.intensity,
            classification: wire.classification,
        };
        Ok(Self {
            len,
            decimation: wire.decimation,
            ref_count: AtomicI32::new(0),
            buffers: Mutex::new(Some(buffers)),
        })
    }
}

// ── Opaque perception carriers ────────────────────────────────────────────────
//
// Produced by the external perception stage; relayed through the bundle with
// no behavioural contract here. The fields fix the persistence format only.

use crate::points::CartesianPoint;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: u32,
    pub centroid: CartesianPoint,
    /// Axis-aligned half-extents, metres
    pub extent: CartesianPoint,
    pub point_count: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterSet {
    pub clusters: Vec<Cluster>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub track_id: u64,
    pub position: CartesianPoint,
    pub velocity_mps: CartesianPoint,
    pub age_frames: u32,
    pub classification: u8,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackSet {
    pub tracks: Vec<Track>,
}

// ── Playback annotation ───────────────────────────────────────────────────────

/// Set by the replayer on every frame it emits; absent on live frames.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaybackInfo {
    pub is_live: bool,
    pub log_start_ns: i64,
    pub log_end_ns: i64,
    pub rate: f32,
    pub paused: bool,
    pub frame_index: u64,
    pub total_frames: u64,
}

// ── FrameBundle ───────────────────────────────────────────────────────────────

/// The canonical aggregate handed to every consumer: one sweep's cloud plus
/// whatever the perception stage attached.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameBundle {
    pub meta: FrameMeta,
    pub frame_type: FrameType,
    /// Sequence number of the background snapshot current at publish time
    pub background_seq: u64,
    pub cloud: Option<PointCloudFrame>,
    pub clusters: Option<ClusterSet>,
    pub tracks: Option<TrackSet>,
    pub playback: Option<PlaybackInfo>,
}

impl FrameBundle {
    pub fn point_count(&self) -> usize {
        self.cloud.as_ref().map_or(0, PointCloudFrame::len)
    }

    /// See [`PointCloudFrame::retain`]. No-op for cloudless bundles.
    pub fn retain(&self) {
        if let Some(cloud) = &self.cloud {
            cloud.retain();
        }
    }

    /// See [`PointCloudFrame::release`]. No-op for cloudless bundles.
    pub fn release(&self) {
        if let Some(cloud) = &self.cloud {
            cloud.release();
        }
    }

    /// Metadata-only copy: same identity, clusters and tracks, no cloud.
    /// Used for subscribers that declined points or are in skip mode.
    pub fn without_cloud(&self) -> FrameBundle {
        FrameBundle {
            meta: self.meta.clone(),
            frame_type: self.frame_type,
            background_seq: self.background_seq,
            cloud: None,
            clusters: self.clusters.clone(),
            tracks: self.tracks.clone(),
            playback: self.playback,
        }
    }
}

/// A settled background cloud with its monotonic sequence number.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct BackgroundSnapshot {
    pub seq: u64,
    pub cloud: PointCloudFrame,
}
