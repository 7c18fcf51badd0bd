// Acquisition engine - runs the scope read loop on a background thread
//
// The engine owns:
// - Live selection cuts (tmin, tmax, threshold), tunable during a run
// - The cancellation token shared with the worker
// - The ADC sum distribution and the pulse shape of the last frame
// - Run state, event counters and the capture rate
//
// `start` claims the single run slot, resets the sinks and spawns a detached
// worker; `stop` only clears the token. The worker notices the request before
// its next frame read and clears the `active` flag on exit.

use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{DaqError, Result};
use crate::params::{CancellationToken, LiveParameters, SelectionCuts};
use crate::rate::RateEstimator;
use crate::reducer::reduce_frame;
use crate::sink::{DistributionSink, Histogram, PulseTrace, TraceSink};
use crate::transport::{char_device_opener, Opener, Transport};
use crate::types::{
    AcquisitionConfig, HistogramBins, ParameterMode, RunState, RunStats, ADC_SUM_NAME,
    ADC_SUM_TITLE, READ_BUFFER_LEN, WAVEFORM_QUERY,
};

/// Name the pulse shape is exported under.
pub const PULSE_SHAPE_NAME: &str = "pulse_shape";

/// Settings frozen for the duration of a run
#[derive(Debug, Clone, Copy)]
struct RunSettings {
    max_nev: u64,
    parameter_mode: ParameterMode,
    read_timeout: Option<Duration>,
}

/// State shared between the controller and the worker
struct Shared {
    params: LiveParameters,
    token: CancellationToken,
    active: AtomicBool,
    capture_rate: AtomicU64,
    events_processed: AtomicU64,
    frames_skipped: AtomicU64,
    settings: Mutex<RunSettings>,
    adc_sum: RwLock<Histogram>,
    pulse_shape: RwLock<PulseTrace>,
    state: RwLock<RunState>,
    started_at: RwLock<Option<Instant>>,
    device: RwLock<Option<PathBuf>>,
}

impl Shared {
    fn set_capture_rate(&self, rate: f64) {
        self.capture_rate.store(rate.to_bits(), Ordering::SeqCst);
    }
}

/// Online pulse analysis of one scope
pub struct AcquisitionEngine {
    shared: Arc<Shared>,
    opener: Opener,
    worker: Mutex<Option<JoinHandle<()>>>,
    // serializes start and stop so a stop cannot land before the token is armed
    control: Mutex<()>,
}

impl AcquisitionEngine {
    /// Create an engine reading from character devices
    pub fn new(config: AcquisitionConfig) -> Result<Self> {
        Self::with_opener(config, char_device_opener())
    }

    /// Create an engine that opens its transport through `opener`
    pub fn with_opener(config: AcquisitionConfig, opener: Opener) -> Result<Self> {
        config.validate()?;

        let settings = RunSettings {
            max_nev: config.max_nev,
            parameter_mode: config.parameter_mode,
            read_timeout: config.read_timeout(),
        };

        let shared = Shared {
            params: LiveParameters::new(config.tmin, config.tmax, config.threshold),
            token: CancellationToken::new(),
            active: AtomicBool::new(false),
            capture_rate: AtomicU64::new(0f64.to_bits()),
            events_processed: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            settings: Mutex::new(settings),
            adc_sum: RwLock::new(Histogram::new(
                ADC_SUM_NAME,
                ADC_SUM_TITLE,
                config.adc_sum_bins,
            )),
            pulse_shape: RwLock::new(PulseTrace::default()),
            state: RwLock::new(RunState::Idle),
            started_at: RwLock::new(None),
            device: RwLock::new(None),
        };

        Ok(Self {
            shared: Arc::new(shared),
            opener,
            worker: Mutex::new(None),
            control: Mutex::new(()),
        })
    }

    /// Start acquisition from `device` on a background thread.
    ///
    /// Returns the id of the new run right after the worker is spawned.
    /// Fails with [`DaqError::AlreadyRunning`] while a previous run is still
    /// active. A device that cannot be opened does not fail here; the run
    /// ends immediately and [`Self::run_state`] reports
    /// [`RunState::OpenFailed`].
    pub fn start<P: AsRef<Path>>(&self, device: P) -> Result<String> {
        let _control = self.control.lock();

        if self
            .shared
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DaqError::AlreadyRunning);
        }

        let device = device.as_ref().to_path_buf();
        let run_id = uuid::Uuid::new_v4().to_string();
        let settings = *self.shared.settings.lock();

        log::info!("Starting run {} on {}", run_id, device.display());

        self.shared.adc_sum.write().reset();
        self.shared.pulse_shape.write().reset();
        self.shared.events_processed.store(0, Ordering::SeqCst);
        self.shared.frames_skipped.store(0, Ordering::SeqCst);
        self.shared.set_capture_rate(0.0);
        *self.shared.started_at.write() = None;
        *self.shared.device.write() = Some(device.clone());
        *self.shared.state.write() = RunState::Running {
            run_id: run_id.clone(),
            device: device.display().to_string(),
        };

        self.shared.token.arm();

        let shared = Arc::clone(&self.shared);
        let opener = Arc::clone(&self.opener);
        let worker_run_id = run_id.clone();

        let spawned = std::thread::Builder::new()
            .name("mso-pulse-daq".to_string())
            .spawn(move || read_loop(shared, opener, device, worker_run_id, settings));

        match spawned {
            Ok(handle) => {
                // a previous handle belongs to a finished run and is detached
                *self.worker.lock() = Some(handle);
                Ok(run_id)
            }
            Err(e) => {
                self.shared.token.request_stop();
                *self.shared.state.write() = RunState::Idle;
                self.shared.active.store(false, Ordering::SeqCst);
                Err(DaqError::Io(e))
            }
        }
    }

    /// Request the worker to stop before its next frame.
    ///
    /// Returns immediately; safe to call at any time and any number of times.
    pub fn stop(&self) {
        let _control = self.control.lock();
        if self.is_active() {
            log::info!("Stop requested");
        }
        self.shared.token.request_stop();
    }

    /// Block until the worker of the latest run has exited.
    pub fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Acquisition worker panicked");
                self.shared.active.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Poll until the run is no longer active, up to `timeout`.
    ///
    /// Returns `true` if the engine went idle in time.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_active() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    // ── Live parameters ─────────────────────────────────────────────────────

    pub fn set_tmin(&self, t: i32) {
        self.shared.params.set_tmin(t);
    }

    pub fn set_tmax(&self, t: i32) {
        self.shared.params.set_tmax(t);
    }

    pub fn set_threshold(&self, t: i32) {
        self.shared.params.set_threshold(t);
    }

    pub fn tmin(&self) -> i32 {
        self.shared.params.tmin()
    }

    pub fn tmax(&self) -> i32 {
        self.shared.params.tmax()
    }

    pub fn threshold(&self) -> i32 {
        self.shared.params.threshold()
    }

    // ── Between-run settings ────────────────────────────────────────────────

    /// Stop automatically after `n` events, 0 for no limit.
    pub fn set_max_nev(&self, n: u64) -> Result<()> {
        self.ensure_idle("max_nev")?;
        self.shared.settings.lock().max_nev = n;
        Ok(())
    }

    pub fn max_nev(&self) -> u64 {
        self.shared.settings.lock().max_nev
    }

    /// Rebin the ADC sum distribution. Clears its contents.
    pub fn set_adc_sum_bins(&self, nbins: usize, min: f64, max: f64) -> Result<()> {
        self.ensure_idle("adc_sum_bins")?;
        let bins = HistogramBins::new(nbins, min, max)?;
        self.shared.adc_sum.write().set_bins(bins)
    }

    pub fn set_parameter_mode(&self, mode: ParameterMode) -> Result<()> {
        self.ensure_idle("parameter_mode")?;
        self.shared.settings.lock().parameter_mode = mode;
        Ok(())
    }

    pub fn parameter_mode(&self) -> ParameterMode {
        self.shared.settings.lock().parameter_mode
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.ensure_idle("read_timeout")?;
        if timeout == Some(Duration::ZERO) {
            return Err(DaqError::InvalidConfig(
                "read timeout must be positive".to_string(),
            ));
        }
        self.shared.settings.lock().read_timeout = timeout;
        Ok(())
    }

    fn ensure_idle(&self, setting: &'static str) -> Result<()> {
        if self.is_active() {
            return Err(DaqError::RunActive(setting));
        }
        Ok(())
    }

    // ── Observability ───────────────────────────────────────────────────────

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Events per second of the current or last run
    pub fn capture_rate(&self) -> f64 {
        f64::from_bits(self.shared.capture_rate.load(Ordering::SeqCst))
    }

    pub fn events_processed(&self) -> u64 {
        self.shared.events_processed.load(Ordering::SeqCst)
    }

    /// Frames dropped on timeouts, short reads or I/O errors
    pub fn frames_skipped(&self) -> u64 {
        self.shared.frames_skipped.load(Ordering::SeqCst)
    }

    pub fn adc_sum_entries(&self) -> u64 {
        self.shared.adc_sum.read().entries()
    }

    pub fn adc_sum_underflow(&self) -> f64 {
        self.shared.adc_sum.read().underflow()
    }

    pub fn adc_sum_overflow(&self) -> f64 {
        self.shared.adc_sum.read().overflow()
    }

    /// Copy of the ADC sum distribution
    pub fn adc_sum(&self) -> Histogram {
        self.shared.adc_sum.read().clone()
    }

    /// Copy of the last pulse shape
    pub fn pulse_shape(&self) -> PulseTrace {
        self.shared.pulse_shape.read().clone()
    }

    pub fn run_state(&self) -> RunState {
        self.shared.state.read().clone()
    }

    /// Device of the current or last run
    pub fn device(&self) -> Option<PathBuf> {
        self.shared.device.read().clone()
    }

    pub fn stats(&self) -> RunStats {
        let (entries, underflow, overflow) = {
            let adc_sum = self.shared.adc_sum.read();
            (adc_sum.entries(), adc_sum.underflow(), adc_sum.overflow())
        };

        RunStats {
            run_id: self.run_state().run_id().map(str::to_string),
            active: self.is_active(),
            events_processed: self.events_processed(),
            frames_skipped: self.frames_skipped(),
            capture_rate: self.capture_rate(),
            adc_sum_entries: entries,
            adc_sum_underflow: underflow,
            adc_sum_overflow: overflow,
            uptime_seconds: self
                .shared
                .started_at
                .read()
                .as_ref()
                .map(|t| t.elapsed().as_secs_f64()),
        }
    }

    // ── Export ──────────────────────────────────────────────────────────────

    /// Save the ADC sum distribution as JSON under the name `adc_sum`.
    pub fn write_adc_sum<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.adc_sum().write_json(path)
    }

    pub fn write_pulse_shape<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.pulse_shape().write_json(PULSE_SHAPE_NAME, path)
    }
}

impl Drop for AcquisitionEngine {
    fn drop(&mut self) {
        // the detached worker sees the request and exits on its own
        self.shared.token.request_stop();
    }
}

/// Worker body: open, read frames until stopped, close.
fn read_loop(
    shared: Arc<Shared>,
    opener: Opener,
    device: PathBuf,
    run_id: String,
    settings: RunSettings,
) {
    shared.active.store(true, Ordering::SeqCst);

    let mut transport = match opener(&device) {
        Ok(transport) => transport,
        Err(e) => {
            log::warn!("Run {} aborted, cannot open {}: {}", run_id, device.display(), e);
            *shared.state.write() = RunState::OpenFailed {
                run_id,
                message: e.to_string(),
            };
            shared.active.store(false, Ordering::SeqCst);
            return;
        }
    };

    let mut rate = RateEstimator::new();
    *shared.started_at.write() = Some(Instant::now());

    let mut buffer = vec![0u8; READ_BUFFER_LEN];

    loop {
        if !shared.token.test_and_continue() {
            break;
        }

        let adc_sum = match acquire_event(
            &shared,
            transport.as_mut(),
            &mut buffer,
            settings,
        ) {
            Ok(adc_sum) => adc_sum,
            Err(e) if e.is_frame_level() => {
                let skipped = shared.frames_skipped.fetch_add(1, Ordering::SeqCst) + 1;
                log::debug!("Frame skipped ({} so far): {}", skipped, e);
                continue;
            }
            Err(e) => {
                log::error!("Run {} stopped on device error: {}", run_id, e);
                shared.token.request_stop();
                continue;
            }
        };

        shared.adc_sum.write().fill(adc_sum);

        let capture_rate = rate.record();
        let events = rate.events();
        shared.events_processed.store(events, Ordering::SeqCst);
        shared.set_capture_rate(capture_rate);

        log::trace!("Event {}: adc_sum={:.3}", events, adc_sum);

        if settings.max_nev > 0 && events >= settings.max_nev {
            log::info!("Reached {} events", events);
            shared.token.request_stop();
        }
    }

    drop(transport);

    let events = rate.events();
    log::info!(
        "Run {} finished: {} events, {} frames skipped, {:.1} events/s",
        run_id,
        events,
        shared.frames_skipped.load(Ordering::SeqCst),
        f64::from_bits(shared.capture_rate.load(Ordering::SeqCst))
    );

    *shared.state.write() = RunState::Stopped { run_id, events };
    shared.active.store(false, Ordering::SeqCst);
}

/// Query one frame and reduce it. The pulse shape is updated even when the
/// cuts reject every sample.
fn acquire_event(
    shared: &Shared,
    transport: &mut dyn Transport,
    buffer: &mut [u8],
    settings: RunSettings,
) -> Result<f64> {
    transport.write_command(WAVEFORM_QUERY)?;
    let received = transport.read_frame(buffer, settings.read_timeout)?;
    let frame = &buffer[..received.min(buffer.len())];

    let mut pulse_shape = shared.pulse_shape.write();
    match settings.parameter_mode {
        ParameterMode::Live => reduce_frame(frame, &shared.params, &mut *pulse_shape),
        ParameterMode::Snapshot => {
            let snapshot = shared.params.snapshot();
            reduce_frame(frame, &snapshot, &mut *pulse_shape)
        }
    }
}
