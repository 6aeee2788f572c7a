//! Builds the canonical `FrameBundle` out of an assembled sweep and relays
//! perception output into it.

use frame_types::{
    CloudBuffers, ClusterSet, DecimationMode, FrameBundle, FrameMeta, LidarFrame,
    PointCloudFrame, TrackSet,
};

/// Convert a closed sweep into a pooled bundle.
///
/// Classification is left zeroed: the core never classifies, that column is
/// filled by the external perception stage when it round-trips a cloud.
pub fn build_bundle(frame: &LidarFrame, coordinate_frame: &str) -> FrameBundle {
    let len = frame.points.len();
    let mut buffers = CloudBuffers::acquire(len);
    for (i, point) in frame.points.iter().enumerate() {
        buffers.x[i] = point.position.x;
        buffers.y[i] = point.position.y;
        buffers.z[i] = point.position.z;
        buffers.intensity[i] = point.polar.intensity;
    }

    FrameBundle {
        meta: FrameMeta {
            frame_id: frame.frame_id,
            timestamp_ns: frame.start_ts_ns,
            sensor_id: frame.sensor_id.clone(),
            coordinate_frame: coordinate_frame.to_string(),
        },
        frame_type: frame_types::FrameType::Full,
        background_seq: 0,
        cloud: Some(PointCloudFrame::new(buffers, DecimationMode::Full)),
        clusters: None,
        tracks: None,
        playback: None,
    }
}

/// Attach opaque perception output to a bundle. The core does not look
/// inside either set.
pub fn attach_perception(
    bundle: &mut FrameBundle,
    clusters: Option<ClusterSet>,
    tracks: Option<TrackSet>,
) {
    if clusters.is_some() {
        bundle.clusters = clusters;
    }
    if tracks.is_some() {
        bundle.tracks = tracks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_types::{CartesianPoint, CloudPoint, Cluster, PolarPoint};

    fn frame() -> LidarFrame {
        let polar = PolarPoint {
            channel: 4,
            azimuth_deg: 45.0,
            elevation_deg: -2.0,
            distance_m: 20.0,
            intensity: 99,
            timestamp_ns: 1_000,
            block_id: 2,
            udp_seq: 0,
            raw_block_azimuth: 4_500,
        };
        LidarFrame {
            sensor_id: "pandar40p-0".to_string(),
            frame_id: 17,
            start_ts_ns: 1_000,
            end_ts_ns: 2_000,
            points: vec![
                CloudPoint {
                    position: polar.to_cartesian(),
                    polar,
                },
                CloudPoint {
                    position: CartesianPoint { x: 1.0, y: 2.0, z: 3.0 },
                    polar,
                },
            ],
        }
    }

    #[test]
    fn bundle_mirrors_the_frame() {
        let frame = frame();
        let bundle = build_bundle(&frame, "sensor");
        assert_eq!(bundle.meta.frame_id, 17);
        assert_eq!(bundle.meta.timestamp_ns, 1_000);
        assert_eq!(bundle.point_count(), 2);

        let cloud = bundle.cloud.as_ref().unwrap();
        cloud
            .with_buffers(|b| {
                assert_eq!(b.y[1], 2.0);
                assert_eq!(b.intensity[0], 99);
                assert!(b.classification.iter().all(|c| *c == 0));
            })
            .unwrap();
        bundle.release();
    }

    #[test]
    fn perception_attach_replaces_only_whats_given() {
        let frame = frame();
        let mut bundle = build_bundle(&frame, "sensor");
        attach_perception(
            &mut bundle,
            Some(ClusterSet {
                clusters: vec![Cluster {
                    cluster_id: 1,
                    centroid: CartesianPoint::default(),
                    extent: CartesianPoint::default(),
                    point_count: 2,
                }],
            }),
            None,
        );
        assert!(bundle.clusters.is_some());
        assert!(bundle.tracks.is_none());
        bundle.release();
    }
}
