//! Sweep segmentation — turns the unbounded packet stream into frames.
//!
//! Two detectors run in parallel and the first to trigger closes the frame:
//! an azimuth wrap (corrected azimuth drops by more than 180° between
//! adjacent points) and a wall-clock fallback at 1.5× the expected rotation
//! period, which catches sweeps whose wrap packet was lost. When both would
//! fire on the same push the wrap wins.

use std::collections::VecDeque;

use tracing::debug;

use frame_types::{CloudPoint, LidarFrame, PolarPoint};

/// Frame deadline when the motor speed is zero or clearly bogus.
pub const FALLBACK_FRAME_SECS: f64 = 0.2;
/// Motor speeds above this are treated as field noise for timing math.
pub const BOGUS_RPM_LIMIT: u16 = 6000;

const WRAP_THRESHOLD_DEG: f64 = 180.0;
const PERIOD_SLACK: f64 = 1.5;

pub struct FrameAssembler {
    sensor_id: String,
    next_frame_id: u64,
    motor_rpm: u16,
    points: Vec<CloudPoint>,
    start_ts_ns: i64,
    end_ts_ns: i64,
    /// Wall clock of the packet that contributed the frame's first point
    first_wall_ns: Option<i64>,
    last_azimuth: Option<f64>,
    completed: VecDeque<LidarFrame>,
}

impl FrameAssembler {
    pub fn new(sensor_id: impl Into<String>) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            next_frame_id: 1,
            motor_rpm: 0,
            points: Vec::new(),
            start_ts_ns: 0,
            end_ts_ns: 0,
            first_wall_ns: None,
            last_azimuth: None,
            completed: VecDeque::new(),
        }
    }

    /// Latest motor speed from the codec; stored raw, clamped only for
    /// timing math.
    pub fn set_motor_speed(&mut self, rpm: u16) {
        self.motor_rpm = rpm;
    }

    pub fn motor_speed(&self) -> u16 {
        self.motor_rpm
    }

    /// Points buffered for the frame currently being assembled.
    pub fn pending_points(&self) -> usize {
        self.points.len()
    }

    /// Wall-clock span after which the current frame is force-closed.
    pub fn frame_deadline_secs(&self) -> f64 {
        if self.motor_rpm == 0 || self.motor_rpm > BOGUS_RPM_LIMIT {
            FALLBACK_FRAME_SECS
        } else {
            PERIOD_SLACK * 60.0 / f64::from(self.motor_rpm)
        }
    }

    /// Feed one packet's worth of points. Returns a frame when a sweep
    /// completed.
    pub fn push(&mut self, batch: Vec<PolarPoint>, packet_wall_ns: i64) -> Option<LidarFrame> {
        // The wrap wins a tie with the time fallback, so only consult the
        // deadline when this batch cannot close the frame by wrap.
        if !self.batch_wraps(&batch) {
            if let Some(first_wall) = self.first_wall_ns {
                let span_secs = (packet_wall_ns - first_wall) as f64 / 1e9;
                if !self.points.is_empty() && span_secs > self.frame_deadline_secs() {
                    debug!(
                        frame_id = self.next_frame_id,
                        span_secs, "closing sweep on time fallback"
                    );
                    self.close_frame();
                }
            }
        }

        for polar in batch {
            if let Some(prev) = self.last_azimuth {
                if !self.points.is_empty() && prev - polar.azimuth_deg > WRAP_THRESHOLD_DEG {
                    self.close_frame();
                }
            }
            self.append(polar, packet_wall_ns);
        }

        self.completed.pop_front()
    }

    fn batch_wraps(&self, batch: &[PolarPoint]) -> bool {
        let mut prev = self.last_azimuth;
        for point in batch {
            if let Some(prev) = prev {
                if prev - point.azimuth_deg > WRAP_THRESHOLD_DEG {
                    return true;
                }
            }
            prev = Some(point.azimuth_deg);
        }
        false
    }

    fn append(&mut self, polar: PolarPoint, packet_wall_ns: i64) {
        if self.points.is_empty() {
            self.start_ts_ns = polar.timestamp_ns;
            self.first_wall_ns = Some(packet_wall_ns);
        }
        self.end_ts_ns = polar.timestamp_ns;
        self.last_azimuth = Some(polar.azimuth_deg);
        self.points.push(CloudPoint {
            position: polar.to_cartesian(),
            polar,
        });
    }

    fn close_frame(&mut self) {
        if self.points.is_empty() {
            return;
        }
        let frame = LidarFrame {
            sensor_id: self.sensor_id.clone(),
            frame_id: self.next_frame_id,
            start_ts_ns: self.start_ts_ns,
            end_ts_ns: self.end_ts_ns,
            points: std::mem::take(&mut self.points),
        };
        debug!(
            frame_id = frame.frame_id,
            points = frame.points.len(),
            "sweep complete"
        );
        self.next_frame_id += 1;
        self.first_wall_ns = None;
        self.completed.push_back(frame);
    }
}
