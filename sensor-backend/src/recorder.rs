//! Chunked on-disk frame log.
//!
//! A recording directory holds `header.json`, a dense `index.bin` (one
//! 24-byte little-endian entry per frame), and `frames/chunk_NNNN.pb` blobs
//! where each frame is a u32 length prefix followed by its serialised bytes.
//! Chunks rotate on a frame-count or byte cap; index and header are
//! written atomically on close.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use frame_types::FrameBundle;

pub const DEFAULT_CHUNK_FRAMES: u32 = 500;
pub const MAX_CHUNK_WRITE_BYTES: u64 = 64 * 1024 * 1024;
pub const FORMAT_VERSION: u32 = 1;

pub const HEADER_FILE: &str = "header.json";
pub const INDEX_FILE: &str = "index.bin";
pub const FRAMES_DIR: &str = "frames";

/// Environment variable: when set, a recorder is attached to the publisher.
pub const RECORD_DIR_ENV: &str = "RECORD_DIR";

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recorder i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame encode: {0}")]
    Encode(#[from] bincode::Error),
    #[error("recorder already closed")]
    Closed,
}

/// `header.json` contents. Written once, on close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingHeader {
    pub recording_id: Uuid,
    pub sensor_id: String,
    pub format_version: u32,
    pub start_ts_ns: i64,
    pub end_ts_ns: i64,
    pub chunk_size: u32,
    pub total_frames: u64,
}

/// One `index.bin` record: 24 bytes, all little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub frame_id: u64,
    pub timestamp_ns: i64,
    pub chunk_id: u32,
    /// Byte offset of the frame's length prefix within its chunk
    pub offset: u32,
}

impl IndexEntry {
    pub const LEN: usize = 24;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.frame_id.to_le_bytes());
        out.extend_from_slice(&self.timestamp_ns.to_le_bytes());
        out.extend_from_slice(&self.chunk_id.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
    }

    /// `None` on a truncated entry.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LEN {
            return None;
        }
        Some(Self {
            frame_id: u64::from_le_bytes(data[0..8].try_into().ok()?),
            timestamp_ns: i64::from_le_bytes(data[8..16].try_into().ok()?),
            chunk_id: u32::from_le_bytes(data[16..20].try_into().ok()?),
            offset: u32::from_le_bytes(data[20..24].try_into().ok()?),
        })
    }
}

pub fn chunk_file_name(chunk_id: u32) -> String {
    format!("chunk_{chunk_id:04}.pb")
}

pub struct Recorder {
    dir: PathBuf,
    header: RecordingHeader,
    index: Vec<IndexEntry>,
    chunk: Option<BufWriter<File>>,
    chunk_id: u32,
    chunk_offset: u64,
    frames_in_chunk: u32,
    closed: bool,
}

impl Recorder {
    pub fn create(dir: impl AsRef<Path>, sensor_id: &str) -> Result<Self, RecorderError> {
        Self::with_chunk_size(dir, sensor_id, DEFAULT_CHUNK_FRAMES)
    }

    pub fn with_chunk_size(
        dir: impl AsRef<Path>,
        sensor_id: &str,
        chunk_size: u32,
    ) -> Result<Self, RecorderError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(FRAMES_DIR))?;
        let header = RecordingHeader {
            recording_id: Uuid::new_v4(),
            sensor_id: sensor_id.to_string(),
            format_version: FORMAT_VERSION,
            start_ts_ns: 0,
            end_ts_ns: 0,
            chunk_size: chunk_size.max(1),
            total_frames: 0,
        };
        info!(
            path = %dir.display(),
            id = %header.recording_id,
            "starting frame recording"
        );
        Ok(Self {
            dir,
            header,
            index: Vec::new(),
            chunk: None,
            chunk_id: 0,
            chunk_offset: 0,
            frames_in_chunk: 0,
            closed: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn header(&self) -> &RecordingHeader {
        &self.header
    }

    pub fn frames_recorded(&self) -> u64 {
        self.index.len() as u64
    }

    /// Append one frame. Must not be called after [`close`](Self::close).
    pub fn record(&mut self, frame: &FrameBundle) -> Result<(), RecorderError> {
        if self.closed {
            return Err(RecorderError::Closed);
        }
        let blob = bincode::serialize(frame)?;

        let needs_rotation = self.chunk.is_none()
            || self.frames_in_chunk >= self.header.chunk_size
            || self.chunk_offset > MAX_CHUNK_WRITE_BYTES;
        if needs_rotation {
            self.rotate()?;
        }

        let offset = self.chunk_offset as u32;
        let writer = self.chunk.as_mut().ok_or(RecorderError::Closed)?;
        writer.write_all(&(blob.len() as u32).to_le_bytes())?;
        writer.write_all(&blob)?;

        self.index.push(IndexEntry {
            frame_id: frame.meta.frame_id,
            timestamp_ns: frame.meta.timestamp_ns,
            chunk_id: self.chunk_id,
            offset,
        });
        self.chunk_offset += 4 + blob.len() as u64;
        self.frames_in_chunk += 1;
        if self.header.start_ts_ns == 0 {
            self.header.start_ts_ns = frame.meta.timestamp_ns;
        }
        self.header.end_ts_ns = frame.meta.timestamp_ns;
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), RecorderError> {
        let next_id = match self.chunk.take() {
            Some(mut writer) => {
                writer.flush()?;
                self.chunk_id + 1
            }
            None => 0,
        };
        let path = self
            .dir
            .join(FRAMES_DIR)
            .join(chunk_file_name(next_id));
        self.chunk = Some(BufWriter::new(File::create(path)?));
        self.chunk_id = next_id;
        self.chunk_offset = 0;
        self.frames_in_chunk = 0;
        Ok(())
    }

    /// Flush the open chunk and write index and header atomically.
    /// Idempotent.
    pub fn close(&mut self) -> Result<(), RecorderError> {
        if self.closed {
            return Ok(());
        }
        if let Some(mut writer) = self.chunk.take() {
            writer.flush()?;
        }

        let mut index_bytes = Vec::with_capacity(self.index.len() * IndexEntry::LEN);
        for entry in &self.index {
            entry.encode(&mut index_bytes);
        }
        write_atomic(&self.dir.join(INDEX_FILE), &index_bytes)?;

        self.header.total_frames = self.index.len() as u64;
        let header_json = serde_json::to_string_pretty(&self.header)
            .map_err(|e| RecorderError::Io(e.into()))?;
        write_atomic(&self.dir.join(HEADER_FILE), header_json.as_bytes())?;

        self.closed = true;
        info!(
            path = %self.dir.display(),
            frames = self.header.total_frames,
            chunks = self.chunk_id + 1,
            "recording closed"
        );
        Ok(())
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                tracing::warn!("recorder: close on drop failed: {e}");
            }
        }
    }
}

impl crate::publisher::FrameSink for Recorder {
    fn record(&mut self, frame: &FrameBundle) -> Result<(), RecorderError> {
        Recorder::record(self, frame)
    }

    fn close(&mut self) -> Result<(), RecorderError> {
        Recorder::close(self)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}
