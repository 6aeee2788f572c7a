//! Per-channel calibration tables for the 40-channel sensor.
//!
//! Two text tables are loaded at startup: angle corrections
//! (`Channel,Elevation,Azimuth`) and firetime offsets
//! (`Channel,Fire_time_us`). Channel numbers are 1-based and must cover
//! 1..=40 exactly; any hole or out-of-range value is fatal. The store is
//! immutable after load and shared behind an `Arc`.

use std::fs;
use std::io::Read;
use std::path::Path;

use thiserror::Error;

/// Number of laser channels in the sensor.
pub const CHANNEL_COUNT: usize = 40;

const EMBEDDED_ANGLES: &str = include_str!("../data/pandar40p_angle.csv");
const EMBEDDED_FIRETIMES: &str = include_str!("../data/pandar40p_firetime.csv");

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("calibration i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("unrecognised calibration header: {0:?}")]
    BadHeader(String),
    #[error("calibration line {line}: bad {field} value")]
    ParseError { line: usize, field: &'static str },
    #[error("calibration channel {0} missing or out of order")]
    MissingChannel(u8),
    #[error("calibration channel {0} value out of range")]
    OutOfRange(u8),
    #[error("calibration table has only {0} rows, need {CHANNEL_COUNT}")]
    InsufficientRows(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngleCorrection {
    pub channel: u8,
    pub elevation_deg: f64,
    pub azimuth_deg: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FiretimeCorrection {
    pub channel: u8,
    pub firetime_us: f64,
}

/// Immutable calibration store, one entry per channel index 0..=39.
#[derive(Debug, Clone)]
pub struct Calibration {
    angles: Vec<AngleCorrection>,
    firetimes: Vec<FiretimeCorrection>,
}

impl Calibration {
    /// The tables shipped with the crate.
    pub fn embedded() -> Result<Self, CalibrationError> {
        Self::from_strs(EMBEDDED_ANGLES, EMBEDDED_FIRETIMES)
    }

    pub fn from_strs(angles: &str, firetimes: &str) -> Result<Self, CalibrationError> {
        Self::from_parts(parse_angles(angles)?, parse_firetimes(firetimes)?)
    }

    pub fn from_readers(
        mut angles: impl Read,
        mut firetimes: impl Read,
    ) -> Result<Self, CalibrationError> {
        let mut angle_text = String::new();
        angles.read_to_string(&mut angle_text)?;
        let mut firetime_text = String::new();
        firetimes.read_to_string(&mut firetime_text)?;
        Self::from_strs(&angle_text, &firetime_text)
    }

    pub fn from_files(
        angles: impl AsRef<Path>,
        firetimes: impl AsRef<Path>,
    ) -> Result<Self, CalibrationError> {
        let angle_text = fs::read_to_string(angles)?;
        let firetime_text = fs::read_to_string(firetimes)?;
        Self::from_strs(&angle_text, &firetime_text)
    }

    /// Build from already-parsed rows, running full validation.
    pub fn from_parts(
        angles: Vec<AngleCorrection>,
        firetimes: Vec<FiretimeCorrection>,
    ) -> Result<Self, CalibrationError> {
        validate(&angles, &firetimes)?;
        Ok(Self { angles, firetimes })
    }

    /// Elevation correction for a 0-based channel index.
    pub fn elevation_deg(&self, index: usize) -> f64 {
        self.angles[index].elevation_deg
    }

    /// Azimuth correction for a 0-based channel index.
    pub fn azimuth_deg(&self, index: usize) -> f64 {
        self.angles[index].azimuth_deg
    }

    /// Firetime offset in microseconds for a 0-based channel index.
    pub fn firetime_us(&self, index: usize) -> f64 {
        self.firetimes[index].firetime_us
    }

    pub fn angles(&self) -> &[AngleCorrection] {
        &self.angles
    }

    pub fn firetimes(&self) -> &[FiretimeCorrection] {
        &self.firetimes
    }
}

fn validate(
    angles: &[AngleCorrection],
    firetimes: &[FiretimeCorrection],
) -> Result<(), CalibrationError> {
    if angles.len() < CHANNEL_COUNT {
        return Err(CalibrationError::InsufficientRows(angles.len()));
    }
    if firetimes.len() < CHANNEL_COUNT {
        return Err(CalibrationError::InsufficientRows(firetimes.len()));
    }
    for (index, row) in angles.iter().enumerate() {
        let expected = (index + 1) as u8;
        if index >= CHANNEL_COUNT || row.channel != expected {
            return Err(CalibrationError::MissingChannel(expected));
        }
        if !(-90.0..=90.0).contains(&row.elevation_deg)
            || !(-360.0..=360.0).contains(&row.azimuth_deg)
        {
            return Err(CalibrationError::OutOfRange(row.channel));
        }
    }
    for (index, row) in firetimes.iter().enumerate() {
        let expected = (index + 1) as u8;
        if index >= CHANNEL_COUNT || row.channel != expected {
            return Err(CalibrationError::MissingChannel(expected));
        }
        if row.firetime_us.abs() >= 100.0 {
            return Err(CalibrationError::OutOfRange(row.channel));
        }
    }
    Ok(())
}

/// Lowercase and treat underscores as spaces, so `Fire_time_us`,
/// `fire time (us)` and `FIRE TIME` all compare equal.
fn normalise_header(field: &str) -> String {
    field.trim().to_ascii_lowercase().replace('_', " ")
}

fn parse_channel(field: &str, line: usize) -> Result<u8, CalibrationError> {
    field
        .trim()
        .parse()
        .map_err(|_| CalibrationError::ParseError {
            line,
            field: "channel",
        })
}

fn parse_value(field: &str, line: usize, name: &'static str) -> Result<f64, CalibrationError> {
    field
        .trim()
        .parse()
        .map_err(|_| CalibrationError::ParseError { line, field: name })
}

fn parse_angles(text: &str) -> Result<Vec<AngleCorrection>, CalibrationError> {
    let mut lines = text.lines().enumerate();
    let (_, header) = lines
        .next()
        .ok_or_else(|| CalibrationError::BadHeader(String::new()))?;
    let columns: Vec<String> = header.split(',').map(normalise_header).collect();
    if columns.len() < 3
        || !columns[0].contains("channel")
        || !columns[1].contains("elevation")
        || !columns[2].contains("azimuth")
    {
        return Err(CalibrationError::BadHeader(header.to_string()));
    }

    let mut rows = Vec::with_capacity(CHANNEL_COUNT);
    for (index, raw) in lines {
        let line = index + 1;
        if raw.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = raw.split(',').collect();
        if fields.len() < 3 {
            return Err(CalibrationError::ParseError {
                line,
                field: "row",
            });
        }
        rows.push(AngleCorrection {
            channel: parse_channel(fields[0], line)?,
            elevation_deg: parse_value(fields[1], line, "elevation")?,
            azimuth_deg: parse_value(fields[2], line, "azimuth")?,
        });
    }
    Ok(rows)
}

fn parse_firetimes(text: &str) -> Result<Vec<FiretimeCorrection>, CalibrationError> {
    let mut lines = text.lines().enumerate();
    let (_, header) = lines
        .next()
        .ok_or_else(|| CalibrationError::BadHeader(String::new()))?;
    let columns: Vec<String> = header.split(',').map(normalise_header).collect();
    if columns.len() < 2 || !columns[0].contains("channel") || !columns[1].contains("fire time") {
        return Err(CalibrationError::BadHeader(header.to_string()));
    }

    let mut rows = Vec::with_capacity(CHANNEL_COUNT);
    for (index, raw) in lines {
        let line = index + 1;
        if raw.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = raw.split(',').collect();
        if fields.len() < 2 {
            return Err(CalibrationError::ParseError {
                line,
                field: "row",
            });
        }
        rows.push(FiretimeCorrection {
            channel: parse_channel(fields[0], line)?,
            firetime_us: parse_value(fields[1], line, "fire time")?,
        });
    }
    Ok(rows)
}
