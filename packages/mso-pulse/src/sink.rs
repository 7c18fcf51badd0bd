// Receivers for the reduced results
//
// The worker only talks to the `DistributionSink` and `TraceSink` traits.
// `Histogram` is the fixed-binning distribution of per-event ADC sums with
// underflow/overflow bins, `PulseTrace` holds the shape of the last frame.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{DaqError, Result};
use crate::types::{HistogramBins, SAMPLES_PER_FRAME};

/// Accumulates one scalar per event
pub trait DistributionSink: Send {
    fn fill(&mut self, x: f64);
    fn reset(&mut self);
    fn entries(&self) -> u64;
    fn underflow(&self) -> f64;
    fn overflow(&self) -> f64;
}

/// Holds the per-sample trace of the most recent frame
pub trait TraceSink: Send {
    /// Returns `false` if `index` is beyond the trace capacity.
    fn set_point(&mut self, index: usize, x: f64, y: f64) -> bool;
    fn reset(&mut self);
}

/// One-dimensional histogram with fixed bins
///
/// `contents[0]` is the underflow bin and `contents[nbins + 1]` the overflow
/// bin; the regular bins sit in between.
#[derive(Debug, Clone)]
pub struct Histogram {
    name: String,
    title: String,
    bins: HistogramBins,
    contents: Vec<f64>,
    entries: u64,
    sum: f64,
    sum_sq: f64,
}

impl Histogram {
    pub fn new(name: impl Into<String>, title: impl Into<String>, bins: HistogramBins) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            contents: vec![0.0; bins.nbins + 2],
            bins,
            entries: 0,
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bins(&self) -> HistogramBins {
        self.bins
    }

    /// Change the binning. All contents are cleared.
    pub fn set_bins(&mut self, bins: HistogramBins) -> Result<()> {
        bins.validate()?;
        self.bins = bins;
        self.contents = vec![0.0; bins.nbins + 2];
        self.clear_stats();
        Ok(())
    }

    /// Index into `contents` for `x`. NaN goes to the overflow bin.
    pub fn find_bin(&self, x: f64) -> usize {
        let HistogramBins { nbins, min, max } = self.bins;
        if x < min {
            0
        } else if x >= max || x.is_nan() {
            nbins + 1
        } else {
            let bin = ((x - min) / self.bins.width()) as usize;
            // rounding right below max
            1 + bin.min(nbins - 1)
        }
    }

    pub fn bin_content(&self, bin: usize) -> f64 {
        self.contents.get(bin).copied().unwrap_or(0.0)
    }

    /// Mean of all filled values, including under- and overflow.
    pub fn mean(&self) -> f64 {
        if self.entries == 0 {
            return 0.0;
        }
        self.sum / self.entries as f64
    }

    pub fn std_dev(&self) -> f64 {
        if self.entries == 0 {
            return 0.0;
        }
        let mean = self.mean();
        (self.sum_sq / self.entries as f64 - mean * mean).max(0.0).sqrt()
    }

    pub fn to_export(&self) -> HistogramExport {
        let width = self.bins.width();
        let bins = (1..=self.bins.nbins)
            .map(|i| BinContent {
                low: self.bins.min + (i - 1) as f64 * width,
                high: self.bins.min + i as f64 * width,
                content: self.contents[i],
            })
            .collect();

        HistogramExport {
            name: self.name.clone(),
            title: self.title.clone(),
            nbins: self.bins.nbins,
            min: self.bins.min,
            max: self.bins.max,
            entries: self.entries,
            underflow: self.underflow(),
            overflow: self.overflow(),
            mean: self.mean(),
            std_dev: self.std_dev(),
            bins,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Serialize under the histogram's own name to a JSON file.
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json_file(path.as_ref(), &self.to_export())
    }

    fn clear_stats(&mut self) {
        self.entries = 0;
        self.sum = 0.0;
        self.sum_sq = 0.0;
    }
}

impl DistributionSink for Histogram {
    fn fill(&mut self, x: f64) {
        let bin = self.find_bin(x);
        self.contents[bin] += 1.0;
        self.entries += 1;
        if x.is_finite() {
            self.sum += x;
            self.sum_sq += x * x;
        }
    }

    fn reset(&mut self) {
        self.contents.iter_mut().for_each(|c| *c = 0.0);
        self.clear_stats();
    }

    fn entries(&self) -> u64 {
        self.entries
    }

    fn underflow(&self) -> f64 {
        self.contents[0]
    }

    fn overflow(&self) -> f64 {
        self.contents[self.bins.nbins + 1]
    }
}

/// Pulse shape of the last frame, one point per sample
#[derive(Debug, Clone)]
pub struct PulseTrace {
    points: Vec<(f64, f64)>,
}

impl Default for PulseTrace {
    fn default() -> Self {
        Self::with_capacity(SAMPLES_PER_FRAME)
    }
}

impl PulseTrace {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: vec![(0.0, 0.0); capacity],
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    /// Largest sample value of the trace, `None` for an empty trace.
    pub fn peak(&self) -> Option<(f64, f64)> {
        self.points
            .iter()
            .copied()
            .fold(None, |best: Option<(f64, f64)>, p| match best {
                Some(b) if b.1 >= p.1 => Some(b),
                _ => Some(p),
            })
    }

    pub fn to_export(&self, name: &str) -> TraceExport {
        TraceExport {
            name: name.to_string(),
            x: self.points.iter().map(|p| p.0).collect(),
            y: self.points.iter().map(|p| p.1).collect(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn write_json<P: AsRef<Path>>(&self, name: &str, path: P) -> Result<()> {
        write_json_file(path.as_ref(), &self.to_export(name))
    }
}

impl TraceSink for PulseTrace {
    fn set_point(&mut self, index: usize, x: f64, y: f64) -> bool {
        match self.points.get_mut(index) {
            Some(point) => {
                *point = (x, y);
                true
            }
            None => false,
        }
    }

    fn reset(&mut self) {
        self.points.iter_mut().for_each(|p| *p = (0.0, 0.0));
    }
}

/// One regular histogram bin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinContent {
    pub low: f64,
    pub high: f64,
    pub content: f64,
}

/// Serialized form of a [`Histogram`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramExport {
    pub name: String,
    pub title: String,
    pub nbins: usize,
    pub min: f64,
    pub max: f64,
    pub entries: u64,
    pub underflow: f64,
    pub overflow: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub bins: Vec<BinContent>,
    pub created_at: String,
}

/// Serialized form of a [`PulseTrace`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceExport {
    pub name: String,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub created_at: String,
}

fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| DaqError::Export(format!("JSON serialization failed: {}", e)))?;
    std::fs::write(path, json).map_err(|e| {
        DaqError::Export(format!("Failed to write '{}': {}", path.display(), e))
    })?;
    log::info!("Wrote {}", path.display());
    Ok(())
}
