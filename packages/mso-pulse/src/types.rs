use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DaqError, Result};

/// Query sent to the scope for every frame.
pub const WAVEFORM_QUERY: &[u8] = b":WAV:DATA?";

/// Length of the block header preceding the samples in a reply.
pub const FRAME_HEADER_LEN: usize = 11;

/// Samples per waveform frame, one byte each.
pub const SAMPLES_PER_FRAME: usize = 1000;

/// Shortest reply that still carries a full waveform.
pub const MIN_FRAME_LEN: usize = FRAME_HEADER_LEN + SAMPLES_PER_FRAME;

/// Size of the buffer each reply is read into.
pub const READ_BUFFER_LEN: usize = 2048;

/// Scale applied to every accepted (sample - threshold) difference.
pub const ADC_SUM_SCALE: f64 = 1e-3;

pub const DEFAULT_DEVICE: &str = "/dev/usbtmc0";

/// Name the ADC sum distribution is exported under.
pub const ADC_SUM_NAME: &str = "adc_sum";

pub const ADC_SUM_TITLE: &str = "ADC sum x1000";

/// Binning of the ADC sum distribution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramBins {
    pub nbins: usize,
    pub min: f64,
    pub max: f64,
}

impl Default for HistogramBins {
    fn default() -> Self {
        Self {
            nbins: 1000,
            min: 0.0,
            max: 1000.0,
        }
    }
}

impl HistogramBins {
    pub fn new(nbins: usize, min: f64, max: f64) -> Result<Self> {
        let bins = Self { nbins, min, max };
        bins.validate()?;
        Ok(bins)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nbins == 0 {
            return Err(DaqError::InvalidConfig(
                "histogram needs at least one bin".to_string(),
            ));
        }
        if !self.min.is_finite() || !self.max.is_finite() || self.max <= self.min {
            return Err(DaqError::InvalidConfig(format!(
                "histogram range [{}, {}) is empty or not finite",
                self.min, self.max
            )));
        }
        Ok(())
    }

    pub fn width(&self) -> f64 {
        (self.max - self.min) / self.nbins as f64
    }
}

/// How the worker reads the live selection cuts while reducing a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterMode {
    /// Every sample re-reads tmin, tmax and threshold. An update may land
    /// in the middle of a frame.
    #[default]
    Live,

    /// The cuts are read once at the start of each frame.
    Snapshot,
}

/// Complete acquisition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub device: String,
    pub tmin: i32,
    pub tmax: i32,
    pub threshold: i32,
    /// Stop after this many events, 0 runs until stopped
    pub max_nev: u64,
    pub adc_sum_bins: HistogramBins,
    pub parameter_mode: ParameterMode,
    /// Deadline for one frame read in milliseconds, `None` blocks forever
    pub read_timeout_ms: Option<u64>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            tmin: 1,
            tmax: 1000,
            threshold: 0,
            max_nev: 0,
            adc_sum_bins: HistogramBins::default(),
            parameter_mode: ParameterMode::Live,
            read_timeout_ms: Some(2000),
        }
    }
}

impl AcquisitionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.device.trim().is_empty() {
            return Err(DaqError::InvalidConfig("device path is empty".to_string()));
        }
        if self.read_timeout_ms == Some(0) {
            return Err(DaqError::InvalidConfig(
                "read timeout must be positive, omit it to block".to_string(),
            ));
        }
        self.adc_sum_bins.validate()
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DaqError::InvalidConfig(format!("Invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }
}

/// Lifecycle of the most recent run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RunState {
    /// No run has been started yet
    #[default]
    Idle,

    /// Worker spawned, device open or being opened
    Running { run_id: String, device: String },

    /// The device could not be opened, the run never produced events
    OpenFailed { run_id: String, message: String },

    /// The read loop exited after a stop request or the event limit
    Stopped { run_id: String, events: u64 },
}

impl RunState {
    pub fn run_id(&self) -> Option<&str> {
        match self {
            RunState::Idle => None,
            RunState::Running { run_id, .. }
            | RunState::OpenFailed { run_id, .. }
            | RunState::Stopped { run_id, .. } => Some(run_id),
        }
    }
}

/// Counters of the current or last run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub run_id: Option<String>,
    pub active: bool,
    pub events_processed: u64,
    pub frames_skipped: u64,
    pub capture_rate: f64,
    pub adc_sum_entries: u64,
    pub adc_sum_underflow: f64,
    pub adc_sum_overflow: f64,
    pub uptime_seconds: Option<f64>,
}
