//! Recorded-log replay: random-access reader plus the paced streaming loop.
//!
//! A replayer validates `header.json`, loads the whole `index.bin`, and
//! reads frames chunk by chunk (one chunk cached at a time). The streaming
//! loop consults the shared [`ReplayControl`] once per iteration and feeds
//! the same publisher fan-out live frames use; the codec and assembler are
//! bypassed entirely.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, info, warn};

use frame_types::{FrameBundle, PlaybackInfo};

use crate::publisher::Publisher;
use crate::recorder::{
    chunk_file_name, IndexEntry, RecordingHeader, FORMAT_VERSION, FRAMES_DIR, HEADER_FILE,
    INDEX_FILE,
};

/// A chunk file larger than this is treated as corrupt.
pub const MAX_CHUNK_READ_BYTES: u64 = 200 * 1024 * 1024;
/// Poll interval of the streaming loop while paused.
pub const PAUSE_POLL: Duration = Duration::from_millis(50);

/// Environment variable: when set, the process starts in replay mode.
pub const REPLAY_DIR_ENV: &str = "REPLAY_DIR";

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("replay i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad recording header: {0}")]
    BadHeader(String),
    #[error("index corrupt: {0}")]
    IndexCorrupt(String),
    #[error("chunk {chunk_id} corrupt: {reason}")]
    ChunkCorrupt { chunk_id: u32, reason: String },
    #[error("chunk {chunk_id} is {size} bytes, over the {MAX_CHUNK_READ_BYTES} byte cap")]
    ChunkTooLarge { chunk_id: u32, size: u64 },
    #[error("out of range: {0}")]
    OutOfRange(String),
    #[error("end of recording")]
    Eof,
}

// ── Replay control state ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub enum SeekTarget {
    Frame(u64),
    Timestamp(i64),
}

#[derive(Debug)]
struct ControlState {
    paused: bool,
    rate: f32,
    seek_to: Option<SeekTarget>,
    step_pending: bool,
}

/// Mutex-guarded replay state shared between the control surface and the
/// streaming loop, which consults it exactly once per iteration.
#[derive(Debug)]
pub struct ReplayControl {
    state: Mutex<ControlState>,
}

/// One iteration's view of the control state. Seek and step are consumed by
/// the read.
#[derive(Debug)]
pub struct IterationState {
    pub paused: bool,
    pub rate: f32,
    pub seek: Option<SeekTarget>,
    pub step: bool,
}

impl ReplayControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ControlState {
                paused: false,
                rate: 1.0,
                seek_to: None,
                step_pending: false,
            }),
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.lock().paused = paused;
    }

    pub fn paused(&self) -> bool {
        self.lock().paused
    }

    pub fn rate(&self) -> f32 {
        self.lock().rate
    }

    pub fn set_rate(&self, rate: f32) -> Result<(), ReplayError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ReplayError::OutOfRange(format!("rate {rate}")));
        }
        self.lock().rate = rate;
        Ok(())
    }

    pub fn seek(&self, target: SeekTarget) {
        self.lock().seek_to = Some(target);
    }

    /// Request a single frame while paused.
    pub fn step(&self) {
        self.lock().step_pending = true;
    }

    pub fn begin_iteration(&self) -> IterationState {
        let mut state = self.lock();
        IterationState {
            paused: state.paused,
            rate: state.rate,
            seek: state.seek_to.take(),
            step: std::mem::take(&mut state.step_pending),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ReplayControl {
    fn default() -> Self {
        Self::new()
    }
}

// ── Replayer ──────────────────────────────────────────────────────────────────

pub struct Replayer {
    dir: PathBuf,
    header: RecordingHeader,
    index: Vec<IndexEntry>,
    cursor: usize,
    cached_chunk: Option<(u32, Vec<u8>)>,
    control: Arc<ReplayControl>,
}

impl Replayer {
    /// Validate the header, load the full index, position at frame 0.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ReplayError> {
        let dir = dir.as_ref().to_path_buf();
        let header_text = fs::read_to_string(dir.join(HEADER_FILE))?;
        let header: RecordingHeader =
            serde_json::from_str(&header_text).map_err(|e| ReplayError::BadHeader(e.to_string()))?;
        if header.format_version != FORMAT_VERSION {
            return Err(ReplayError::BadHeader(format!(
                "unsupported format version {}",
                header.format_version
            )));
        }

        let index_bytes = fs::read(dir.join(INDEX_FILE))?;
        if index_bytes.len() % IndexEntry::LEN != 0 {
            return Err(ReplayError::IndexCorrupt(format!(
                "{} bytes is not a whole number of {}-byte entries",
                index_bytes.len(),
                IndexEntry::LEN
            )));
        }
        let index: Vec<IndexEntry> = index_bytes
            .chunks(IndexEntry::LEN)
            .map(IndexEntry::decode)
            .collect::<Option<_>>()
            .ok_or_else(|| ReplayError::IndexCorrupt("truncated entry".to_string()))?;

        info!(
            path = %dir.display(),
            frames = index.len(),
            "opened recording for replay"
        );
        Ok(Self {
            dir,
            header,
            index,
            cursor: 0,
            cached_chunk: None,
            control: Arc::new(ReplayControl::new()),
        })
    }

    pub fn header(&self) -> &RecordingHeader {
        &self.header
    }

    pub fn control(&self) -> Arc<ReplayControl> {
        Arc::clone(&self.control)
    }

    pub fn total_frames(&self) -> u64 {
        self.index.len() as u64
    }

    pub fn position(&self) -> u64 {
        self.cursor as u64
    }

    /// Read the frame under the cursor and advance. [`ReplayError::Eof`] at
    /// the end of the log.
    pub fn read_frame(&mut self) -> Result<FrameBundle, ReplayError> {
        let entry = *self.index.get(self.cursor).ok_or(ReplayError::Eof)?;
        let chunk_id = entry.chunk_id;
        let chunk = self.chunk_bytes(chunk_id)?;

        let offset = entry.offset as usize;
        let len_bytes = chunk
            .get(offset..offset + 4)
            .ok_or_else(|| corrupt(chunk_id, "length prefix past chunk end"))?;
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
            as usize;
        let blob = chunk
            .get(offset + 4..offset + 4 + len)
            .ok_or_else(|| corrupt(chunk_id, "frame body past chunk end"))?;
        let mut bundle: FrameBundle = bincode::deserialize(blob).map_err(|e| ReplayError::ChunkCorrupt {
            chunk_id,
            reason: e.to_string(),
        })?;

        let (paused, rate) = {
            let state = self.control.lock();
            (state.paused, state.rate)
        };
        bundle.playback = Some(PlaybackInfo {
            is_live: false,
            log_start_ns: self.header.start_ts_ns,
            log_end_ns: self.header.end_ts_ns,
            rate,
            paused,
            frame_index: self.cursor as u64,
            total_frames: self.index.len() as u64,
        });

        self.cursor += 1;
        Ok(bundle)
    }

    /// Set the cursor. [`ReplayError::Eof`] when the index is out of range.
    pub fn seek(&mut self, frame_index: u64) -> Result<(), ReplayError> {
        if frame_index >= self.index.len() as u64 {
            return Err(ReplayError::Eof);
        }
        self.cursor = frame_index as usize;
        Ok(())
    }

    /// Position at the first frame with `timestamp_ns >= ts_ns`, clamping
    /// below the log start to 0 and past the end to the last frame.
    pub fn seek_to_timestamp(&mut self, ts_ns: i64) -> u64 {
        if self.index.is_empty() {
            self.cursor = 0;
            return 0;
        }
        let position = self.index.partition_point(|e| e.timestamp_ns < ts_ns);
        self.cursor = position.min(self.index.len() - 1);
        self.cursor as u64
    }

    pub fn apply_seek(&mut self, target: SeekTarget) -> Result<u64, ReplayError> {
        match target {
            SeekTarget::Frame(index) => {
                self.seek(index)?;
                Ok(index)
            }
            SeekTarget::Timestamp(ts_ns) => Ok(self.seek_to_timestamp(ts_ns)),
        }
    }

    /// Release the cached chunk.
    pub fn close(&mut self) {
        self.cached_chunk = None;
    }

    fn chunk_bytes(&mut self, chunk_id: u32) -> Result<&[u8], ReplayError> {
        let cached = matches!(&self.cached_chunk, Some((id, _)) if *id == chunk_id);
        if !cached {
            let path = self.dir.join(FRAMES_DIR).join(chunk_file_name(chunk_id));
            let size = fs::metadata(&path)?.len();
            if size > MAX_CHUNK_READ_BYTES {
                return Err(ReplayError::ChunkTooLarge { chunk_id, size });
            }
            let bytes = fs::read(&path)?;
            self.cached_chunk = Some((chunk_id, bytes));
        }
        match &self.cached_chunk {
            Some((_, bytes)) => Ok(bytes),
            None => Err(corrupt(chunk_id, "chunk cache empty")),
        }
    }
}

fn corrupt(chunk_id: u32, reason: &str) -> ReplayError {
    ReplayError::ChunkCorrupt {
        chunk_id,
        reason: reason.to_string(),
    }
}

// ── Streaming loop ────────────────────────────────────────────────────────────

/// Pace recorded frames out through the publisher until EOF or error.
///
/// Per iteration: apply any pending seek (resetting the pacing reference;
/// while paused a seek previews exactly one frame), poll at 50 ms while
/// paused unless a step is pending, otherwise sleep the rate-scaled media
/// delta minus wall time already spent, never negative, then emit.
pub async fn run_replay(mut replayer: Replayer, publisher: Arc<Publisher>) {
    let control = replayer.control();
    info!(
        frames = replayer.total_frames(),
        rate = control.rate(),
        "replay streaming started"
    );

    // Wall-clock instant and media timestamp of the last emitted frame.
    let mut pacing: Option<(Instant, i64)> = None;

    loop {
        let iteration = control.begin_iteration();

        if let Some(target) = iteration.seek {
            match replayer.apply_seek(target) {
                Ok(index) => {
                    pacing = None;
                    info!(index, "replay seek");
                }
                Err(e) => warn!("replay: seek rejected: {e}"),
            }
            if iteration.paused {
                match replayer.read_frame() {
                    Ok(frame) => publisher.publish(frame),
                    Err(ReplayError::Eof) => break,
                    Err(e) => {
                        error!("replay: {e}");
                        break;
                    }
                }
                continue;
            }
        }

        if iteration.paused {
            if iteration.step {
                match replayer.read_frame() {
                    Ok(frame) => publisher.publish(frame),
                    Err(ReplayError::Eof) => break,
                    Err(e) => {
                        error!("replay: {e}");
                        break;
                    }
                }
            } else {
                tokio::time::sleep(PAUSE_POLL).await;
            }
            continue;
        }

        let frame = match replayer.read_frame() {
            Ok(frame) => frame,
            Err(ReplayError::Eof) => {
                info!("replay complete");
                break;
            }
            Err(e) => {
                error!("replay terminated: {e}");
                break;
            }
        };

        let frame_ts = frame.meta.timestamp_ns;
        if let Some((wall_ref, ts_ref)) = pacing {
            let media_ns = ((frame_ts - ts_ref).max(0) as f64 / f64::from(iteration.rate)) as u128;
            let elapsed_ns = wall_ref.elapsed().as_nanos();
            if media_ns > elapsed_ns {
                tokio::time::sleep(Duration::from_nanos((media_ns - elapsed_ns) as u64)).await;
            }
        }
        pacing = Some((Instant::now(), frame_ts));
        publisher.publish(frame);
    }

    replayer.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use crate::publisher::StreamRequest;
    use crate::recorder::tests::test_bundle;
    use crate::recorder::Recorder;
    use std::io::{Seek, SeekFrom, Write};

    /// Ten frames at 1.0 s .. 1.9 s.
    fn record_ten(dir: &Path) {
        let mut recorder = Recorder::with_chunk_size(dir, "pandar40p-0", 4).unwrap();
        for i in 0..10u64 {
            let bundle = test_bundle(i + 1, 1_000_000_000 + i as i64 * 100_000_000, 6);
            recorder.record(&bundle).unwrap();
            bundle.release();
        }
        recorder.close().unwrap();
    }

    #[test]
    fn replay_reproduces_recorded_frames_bit_for_bit() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::create(dir.path(), "pandar40p-0").unwrap();
        let originals: Vec<_> = (0..5u64)
            .map(|i| test_bundle(i + 1, 2_000 + i as i64, 12))
            .collect();
        for bundle in &originals {
            recorder.record(bundle).unwrap();
        }
        recorder.close().unwrap();

        let mut replayer = Replayer::open(dir.path()).unwrap();
        assert_eq!(replayer.total_frames(), 5);
        for original in &originals {
            let mut replayed = replayer.read_frame().unwrap();
            // PlaybackInfo is replay-added metadata, everything else must
            // match exactly.
            assert!(replayed.playback.is_some());
            replayed.playback = None;
            assert_eq!(&replayed, original);
            replayed.release();
            original.release();
        }
        assert!(matches!(replayer.read_frame(), Err(ReplayError::Eof)));
    }

    #[test]
    fn playback_info_reflects_the_log_and_cursor() {
        let dir = tempfile::tempdir().unwrap();
        record_ten(dir.path());
        let mut replayer = Replayer::open(dir.path()).unwrap();
        replayer.control().set_rate(2.0).unwrap();
        replayer.control().set_paused(true);

        replayer.seek(3).unwrap();
        let frame = replayer.read_frame().unwrap();
        let playback = frame.playback.unwrap();
        assert!(!playback.is_live);
        assert_eq!(playback.log_start_ns, 1_000_000_000);
        assert_eq!(playback.log_end_ns, 1_900_000_000);
        assert_eq!(playback.rate, 2.0);
        assert!(playback.paused);
        assert_eq!(playback.frame_index, 3);
        assert_eq!(playback.total_frames, 10);
        frame.release();
    }

    #[test]
    fn seek_to_timestamp_picks_the_first_frame_at_or_after() {
        let dir = tempfile::tempdir().unwrap();
        record_ten(dir.path());
        let mut replayer = Replayer::open(dir.path()).unwrap();

        // 1.55 s lands on frame index 6 (1.6 s).
        assert_eq!(replayer.seek_to_timestamp(1_550_000_000), 6);
        let frame = replayer.read_frame().unwrap();
        assert_eq!(frame.meta.timestamp_ns, 1_600_000_000);
        frame.release();

        // Exact hit stays put; clamping below and above.
        assert_eq!(replayer.seek_to_timestamp(1_300_000_000), 3);
        assert_eq!(replayer.seek_to_timestamp(0), 0);
        assert_eq!(replayer.seek_to_timestamp(i64::MAX), 9);
    }

    #[test]
    fn seek_out_of_range_is_eof() {
        let dir = tempfile::tempdir().unwrap();
        record_ten(dir.path());
        let mut replayer = Replayer::open(dir.path()).unwrap();
        assert!(matches!(replayer.seek(10), Err(ReplayError::Eof)));
        assert!(replayer.seek(9).is_ok());
    }

    #[test]
    fn truncated_index_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        record_ten(dir.path());
        let index_path = dir.path().join(INDEX_FILE);
        let bytes = fs::read(&index_path).unwrap();
        fs::write(&index_path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(
            Replayer::open(dir.path()),
            Err(ReplayError::IndexCorrupt(_))
        ));
    }

    #[test]
    fn corrupt_length_prefix_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        record_ten(dir.path());

        // Stamp an absurd length over the first frame's prefix.
        let chunk_path = dir.path().join(FRAMES_DIR).join("chunk_0000.pb");
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&chunk_path)
            .unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&u32::MAX.to_le_bytes()).unwrap();
        drop(file);

        let mut replayer = Replayer::open(dir.path()).unwrap();
        assert!(matches!(
            replayer.read_frame(),
            Err(ReplayError::ChunkCorrupt { chunk_id: 0, .. })
        ));
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        record_ten(dir.path());

        // Grow the chunk past the read cap without writing data (sparse).
        let chunk_path = dir.path().join(FRAMES_DIR).join("chunk_0000.pb");
        let file = fs::OpenOptions::new().write(true).open(&chunk_path).unwrap();
        file.set_len(MAX_CHUNK_READ_BYTES + 1).unwrap();
        drop(file);

        let mut replayer = Replayer::open(dir.path()).unwrap();
        assert!(matches!(
            replayer.read_frame(),
            Err(ReplayError::ChunkTooLarge { chunk_id: 0, .. })
        ));
    }

    #[test]
    fn bad_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        record_ten(dir.path());
        fs::write(dir.path().join(HEADER_FILE), b"{not json").unwrap();
        assert!(matches!(
            Replayer::open(dir.path()),
            Err(ReplayError::BadHeader(_))
        ));
    }

    #[test]
    fn rate_validation_rejects_non_positive_values() {
        let control = ReplayControl::new();
        assert!(control.set_rate(0.0).is_err());
        assert!(control.set_rate(-1.5).is_err());
        assert!(control.set_rate(f32::NAN).is_err());
        assert!(control.set_rate(0.25).is_ok());
        assert_eq!(control.rate(), 0.25);
    }

    #[test]
    fn iteration_consumes_seek_and_step_once() {
        let control = ReplayControl::new();
        control.seek(SeekTarget::Frame(4));
        control.step();
        let first = control.begin_iteration();
        assert!(first.seek.is_some());
        assert!(first.step);
        let second = control.begin_iteration();
        assert!(second.seek.is_none());
        assert!(!second.step);
    }

    #[tokio::test]
    async fn streaming_loop_feeds_the_publisher() {
        let dir = tempfile::tempdir().unwrap();
        // Tight timestamps so pacing sleeps stay tiny.
        let mut recorder = Recorder::create(dir.path(), "pandar40p-0").unwrap();
        for i in 0..5u64 {
            let bundle = test_bundle(i + 1, i as i64 * 1_000_000, 6);
            recorder.record(&bundle).unwrap();
            bundle.release();
        }
        recorder.close().unwrap();

        let publisher = Arc::new(crate::publisher::Publisher::new(Diagnostics::new()));
        publisher.start().unwrap();
        publisher.set_replay_active(true);
        let mut handle = publisher.subscribe(StreamRequest::default()).await;

        let replayer = Replayer::open(dir.path()).unwrap();
        let replay_task = tokio::spawn(run_replay(replayer, Arc::clone(&publisher)));

        for expected in 1..=5u64 {
            let frame = handle.rx.recv().await.unwrap();
            assert_eq!(frame.meta.frame_id, expected);
            let playback = frame.playback.unwrap();
            assert!(!playback.is_live);
            assert_eq!(playback.total_frames, 5);
            frame.release();
        }

        replay_task.await.unwrap();
        publisher.stop().await;
    }
}
