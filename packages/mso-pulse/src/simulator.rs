// Synthetic scope for running without hardware
//
// Answers every ":WAV:DATA?" query with a full waveform reply: an 11-byte
// block header followed by 1000 samples holding a Gaussian pulse on a flat
// baseline. Pulse amplitudes cycle deterministically so the resulting ADC sum
// distribution is reproducible.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DaqError, Result};
use crate::transport::{Opener, Transport};
use crate::types::{FRAME_HEADER_LEN, MIN_FRAME_LEN, SAMPLES_PER_FRAME, WAVEFORM_QUERY};

const BLOCK_HEADER: &[u8; FRAME_HEADER_LEN] = b"#9000001000";

/// Shape of the synthetic pulses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    pub baseline: u8,
    /// Sample index of the pulse maximum
    pub pulse_center: usize,
    /// Gaussian width in samples
    pub pulse_sigma: f64,
    /// Amplitudes above baseline, used in turn
    pub amplitudes: Vec<u8>,
    /// Time the scope takes to answer one query
    pub frame_period_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            baseline: 10,
            pulse_center: 300,
            pulse_sigma: 20.0,
            amplitudes: vec![40, 80, 120, 160, 200],
            frame_period_ms: 0,
        }
    }
}

/// Transport backed by [`SimulatorConfig`] instead of a device
pub struct SimulatedScope {
    config: SimulatorConfig,
    pending_query: bool,
    frames_sent: Arc<AtomicU64>,
}

impl SimulatedScope {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            pending_query: false,
            frames_sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Opener handing out a fresh scope per run. Every scope reports to the
    /// returned counter, which tallies the replies sent.
    pub fn opener(config: SimulatorConfig) -> (Opener, Arc<AtomicU64>) {
        let frames_sent = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&frames_sent);
        let opener: Opener = Arc::new(move |path: &Path| {
            log::info!("Opened simulated scope for {}", path.display());
            let mut scope = SimulatedScope::new(config.clone());
            scope.frames_sent = Arc::clone(&counter);
            Ok(Box::new(scope) as Box<dyn Transport>)
        });
        (opener, frames_sent)
    }

    /// Amplitude of the `n`-th pulse.
    pub fn amplitude(&self, n: u64) -> u8 {
        if self.config.amplitudes.is_empty() {
            return 0;
        }
        self.config.amplitudes[(n % self.config.amplitudes.len() as u64) as usize]
    }

    /// Sample values of the `n`-th frame.
    pub fn waveform(&self, n: u64) -> Vec<u8> {
        let amplitude = f64::from(self.amplitude(n));
        let baseline = f64::from(self.config.baseline);
        let center = self.config.pulse_center as f64;
        let sigma = self.config.pulse_sigma.max(f64::MIN_POSITIVE);

        (0..SAMPLES_PER_FRAME)
            .map(|t| {
                let z = (t as f64 - center) / sigma;
                let value = baseline + amplitude * (-0.5 * z * z).exp();
                value.round().clamp(0.0, 255.0) as u8
            })
            .collect()
    }
}

impl Transport for SimulatedScope {
    fn write_command(&mut self, command: &[u8]) -> Result<()> {
        if command == WAVEFORM_QUERY {
            self.pending_query = true;
            Ok(())
        } else {
            Err(DaqError::Device(format!(
                "Unsupported command: {}",
                String::from_utf8_lossy(command)
            )))
        }
    }

    fn read_frame(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if !self.pending_query {
            return match timeout {
                Some(t) => Err(DaqError::Timeout(t.as_millis() as u64)),
                None => Err(DaqError::Device("read without a pending query".to_string())),
            };
        }
        self.pending_query = false;

        if self.config.frame_period_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.config.frame_period_ms));
        }

        let n = self.frames_sent.fetch_add(1, Ordering::SeqCst);
        let mut reply = Vec::with_capacity(MIN_FRAME_LEN + 1);
        reply.extend_from_slice(BLOCK_HEADER);
        reply.extend(self.waveform(n));
        reply.push(b'\n');

        let len = reply.len().min(buf.len());
        buf[..len].copy_from_slice(&reply[..len]);
        Ok(len)
    }
}
