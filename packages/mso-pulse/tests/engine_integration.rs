use mso_pulse::{
    AcquisitionConfig, AcquisitionEngine, DaqError, DistributionSink, HistogramBins, Opener,
    ParameterMode, RunState, Transport, FRAME_HEADER_LEN, MIN_FRAME_LEN, SAMPLES_PER_FRAME, WAVEFORM_QUERY,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// =============================================================================
// SCRIPTED TRANSPORT
// =============================================================================

#[derive(Clone)]
enum Reply {
    Frame(Vec<u8>),
    Short(usize),
    Timeout,
    Broken,
}

/// Replays `script` in order and repeats its last entry forever.
struct ScriptedTransport {
    script: Vec<Reply>,
    next: usize,
    delay: Duration,
    reads: Arc<AtomicUsize>,
}

impl Transport for ScriptedTransport {
    fn write_command(&mut self, command: &[u8]) -> mso_pulse::Result<()> {
        assert_eq!(command, WAVEFORM_QUERY);
        Ok(())
    }

    fn read_frame(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> mso_pulse::Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let reply = self.script[self.next.min(self.script.len() - 1)].clone();
        self.next += 1;

        match reply {
            Reply::Frame(frame) => {
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            }
            Reply::Short(len) => Ok(len),
            Reply::Timeout => Err(DaqError::Timeout(
                timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
            )),
            Reply::Broken => Err(DaqError::Device("device unplugged".to_string())),
        }
    }
}

fn scripted_opener(script: Vec<Reply>, delay: Duration) -> (Opener, Arc<AtomicUsize>) {
    let reads = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reads);
    let opener: Opener = Arc::new(move |_path: &Path| {
        Ok(Box::new(ScriptedTransport {
            script: script.clone(),
            next: 0,
            delay,
            reads: Arc::clone(&counter),
        }) as Box<dyn Transport>)
    });
    (opener, reads)
}

fn frame_from(samples: impl Fn(usize) -> u8) -> Vec<u8> {
    let mut frame = vec![0u8; MIN_FRAME_LEN];
    frame[..FRAME_HEADER_LEN].copy_from_slice(b"#9000001000");
    for i in 0..SAMPLES_PER_FRAME {
        frame[FRAME_HEADER_LEN + i] = samples(i);
    }
    frame
}

fn engine_with(
    config: AcquisitionConfig,
    script: Vec<Reply>,
    delay: Duration,
) -> (AcquisitionEngine, Arc<AtomicUsize>) {
    let (opener, reads) = scripted_opener(script, delay);
    (AcquisitionEngine::with_opener(config, opener).unwrap(), reads)
}

fn wait_for(what: &str, timeout: Duration, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

// =============================================================================
// EVENT LIMIT
// =============================================================================

#[test]
fn test_event_limit_is_exact() {
    for n in [1u64, 7, 40] {
        let (engine, reads) = engine_with(
            AcquisitionConfig {
                max_nev: n,
                ..Default::default()
            },
            vec![Reply::Frame(frame_from(|_| 5))],
            Duration::ZERO,
        );

        engine.start("/dev/usbtmc0").unwrap();
        assert!(engine.wait_idle(Duration::from_secs(5)));

        assert_eq!(engine.adc_sum_entries(), n);
        assert_eq!(engine.events_processed(), n);
        assert_eq!(reads.load(Ordering::SeqCst), n as usize);
        assert!(matches!(engine.run_state(), RunState::Stopped { events, .. } if events == n));
    }
}

#[test]
fn test_skipped_frames_do_not_count() {
    let good = frame_from(|_| 1);
    let (engine, reads) = engine_with(
        AcquisitionConfig {
            max_nev: 2,
            ..Default::default()
        },
        vec![
            Reply::Timeout,
            Reply::Frame(good.clone()),
            Reply::Short(MIN_FRAME_LEN - 1),
            Reply::Frame(good),
        ],
        Duration::ZERO,
    );

    engine.start("/dev/usbtmc0").unwrap();
    engine.join();

    assert_eq!(engine.adc_sum_entries(), 2);
    assert_eq!(engine.frames_skipped(), 2);
    assert_eq!(reads.load(Ordering::SeqCst), 4);
    assert_eq!(engine.stats().frames_skipped, 2);
}

#[test]
fn test_device_error_ends_run() {
    let (engine, reads) = engine_with(
        AcquisitionConfig::default(),
        vec![Reply::Frame(frame_from(|_| 1)), Reply::Broken],
        Duration::ZERO,
    );

    engine.start("/dev/usbtmc0").unwrap();
    engine.join();

    assert!(!engine.is_active());
    assert_eq!(engine.adc_sum_entries(), 1);
    assert_eq!(reads.load(Ordering::SeqCst), 2);
}

// =============================================================================
// STOP
// =============================================================================

#[test]
fn test_stop_is_observed_within_one_frame() {
    let (engine, reads) = engine_with(
        AcquisitionConfig::default(),
        vec![Reply::Frame(frame_from(|_| 3))],
        Duration::from_millis(5),
    );

    engine.start("/dev/usbtmc0").unwrap();
    wait_for("three events", Duration::from_secs(5), || {
        engine.events_processed() >= 3
    });

    let reads_at_stop = reads.load(Ordering::SeqCst);
    engine.stop();
    assert!(engine.wait_idle(Duration::from_secs(1)));

    // at most the read already in flight completes
    assert!(reads.load(Ordering::SeqCst) <= reads_at_stop + 1);
    assert_eq!(engine.adc_sum_entries(), engine.events_processed());
    assert!(matches!(engine.run_state(), RunState::Stopped { .. }));
}

#[test]
fn test_stop_is_idempotent() {
    let (engine, _) = engine_with(
        AcquisitionConfig::default(),
        vec![Reply::Frame(frame_from(|_| 3))],
        Duration::from_millis(1),
    );

    // nothing running
    engine.stop();
    engine.stop();
    assert!(!engine.is_active());
    assert_eq!(engine.run_state(), RunState::Idle);

    engine.start("/dev/usbtmc0").unwrap();
    engine.stop();
    engine.stop();
    engine.join();
    engine.stop();
    assert!(!engine.is_active());
}

#[test]
fn test_stop_racing_start_is_not_lost() {
    for _ in 0..50 {
        let (engine, _) = engine_with(
            AcquisitionConfig::default(),
            vec![Reply::Frame(frame_from(|_| 3))],
            Duration::from_millis(1),
        );

        std::thread::scope(|s| {
            s.spawn(|| {
                // the run slot is claimed, start may still be arming the token
                wait_for("run claimed", Duration::from_secs(5), || engine.is_active());
                engine.stop();
            });
            engine.start("/dev/usbtmc0").unwrap();
        });

        assert!(engine.wait_idle(Duration::from_secs(5)));
        assert!(matches!(engine.run_state(), RunState::Stopped { .. }));
    }
}

#[test]
fn test_concurrent_start_rejected() {
    let (engine, _) = engine_with(
        AcquisitionConfig::default(),
        vec![Reply::Frame(frame_from(|_| 3))],
        Duration::from_millis(2),
    );

    let first = engine.start("/dev/usbtmc0").unwrap();
    assert!(matches!(
        engine.start("/dev/usbtmc1"),
        Err(DaqError::AlreadyRunning)
    ));
    assert_eq!(engine.run_state().run_id(), Some(first.as_str()));

    engine.stop();
    engine.join();

    let second = engine.start("/dev/usbtmc1").unwrap();
    assert_ne!(first, second);
    engine.stop();
    engine.join();
}

#[test]
fn test_drop_stops_worker() {
    let (engine, reads) = engine_with(
        AcquisitionConfig::default(),
        vec![Reply::Frame(frame_from(|_| 3))],
        Duration::from_millis(2),
    );
    engine.start("/dev/usbtmc0").unwrap();
    drop(engine);

    std::thread::sleep(Duration::from_millis(50));
    let settled = reads.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(reads.load(Ordering::SeqCst), settled);
}

// =============================================================================
// RESTART
// =============================================================================

#[test]
fn test_restart_resets_distribution() {
    let (engine, _) = engine_with(
        AcquisitionConfig {
            max_nev: 5,
            ..Default::default()
        },
        vec![Reply::Frame(frame_from(|_| 3))],
        Duration::from_millis(200),
    );

    engine.start("/dev/usbtmc0").unwrap();
    engine.join();
    assert_eq!(engine.adc_sum_entries(), 5);

    engine.start("/dev/usbtmc0").unwrap();
    assert_eq!(engine.adc_sum_entries(), 0);
    assert_eq!(engine.events_processed(), 0);
    assert!(engine.is_active());

    engine.stop();
    engine.join();
}

#[test]
fn test_parameters_persist_across_runs() {
    let (engine, _) = engine_with(
        AcquisitionConfig {
            max_nev: 1,
            ..Default::default()
        },
        vec![Reply::Frame(frame_from(|_| 3))],
        Duration::ZERO,
    );

    engine.set_tmin(10);
    engine.set_tmax(20);
    engine.set_threshold(2);
    engine.start("/dev/usbtmc0").unwrap();
    engine.join();
    engine.start("/dev/usbtmc0").unwrap();
    engine.join();

    assert_eq!((engine.tmin(), engine.tmax(), engine.threshold()), (10, 20, 2));
    assert!(engine.capture_rate() > 0.0);
    // 11 samples of (3 - 2)
    assert!((engine.adc_sum().mean() - 0.011).abs() < 1e-9);
}

// =============================================================================
// REDUCTION THROUGH THE ENGINE
// =============================================================================

#[test]
fn test_windowed_sum_filled() {
    let frame = frame_from(|i| if (200..300).contains(&i) { 60 } else { 5 });

    for mode in [ParameterMode::Live, ParameterMode::Snapshot] {
        let (engine, _) = engine_with(
            AcquisitionConfig {
                max_nev: 10,
                tmin: 250,
                tmax: 349,
                threshold: 20,
                parameter_mode: mode,
                adc_sum_bins: HistogramBins {
                    nbins: 100,
                    min: 0.0,
                    max: 10.0,
                },
                ..Default::default()
            },
            vec![Reply::Frame(frame.clone())],
            Duration::ZERO,
        );

        engine.start("/dev/usbtmc0").unwrap();
        engine.join();

        // samples 250..=299 pass: 50 × (60 - 20) × 1e-3 = 2.0
        let hist = engine.adc_sum();
        assert_eq!(hist.entries(), 10);
        assert!((hist.mean() - 2.0).abs() < 1e-9, "{mode:?}");
        assert!(hist.to_export().bins.iter().any(|b| b.content == 10.0));

        let shape = engine.pulse_shape();
        assert_eq!(shape.points()[250], (250.0, 60.0));
        assert_eq!(shape.points()[999], (999.0, 5.0));
    }
}

#[test]
fn test_inverted_window_fills_zero() {
    let (engine, _) = engine_with(
        AcquisitionConfig {
            max_nev: 4,
            tmin: 800,
            tmax: 100,
            ..Default::default()
        },
        vec![Reply::Frame(frame_from(|i| (i % 200) as u8))],
        Duration::ZERO,
    );

    engine.start("/dev/usbtmc0").unwrap();
    engine.join();

    let hist = engine.adc_sum();
    assert_eq!(hist.entries(), 4);
    assert_eq!(hist.mean(), 0.0);
    assert_eq!(hist.bin_content(1), 4.0);
}

#[test]
fn test_under_and_overflow_reported() {
    let (engine, _) = engine_with(
        AcquisitionConfig {
            max_nev: 3,
            tmin: 0,
            tmax: 999,
            adc_sum_bins: HistogramBins {
                nbins: 10,
                min: 1.0,
                max: 2.0,
            },
            ..Default::default()
        },
        // sum = 1000 × 10 × 1e-3 = 10, beyond the range
        vec![Reply::Frame(frame_from(|_| 10))],
        Duration::ZERO,
    );
    engine.start("/dev/usbtmc0").unwrap();
    engine.join();
    assert_eq!(engine.adc_sum_overflow(), 3.0);
    assert_eq!(engine.adc_sum_underflow(), 0.0);

    engine.set_threshold(255);
    engine.start("/dev/usbtmc0").unwrap();
    engine.join();
    assert_eq!(engine.adc_sum_underflow(), 3.0);
    assert_eq!(engine.adc_sum_overflow(), 0.0);
}

#[test]
fn test_live_threshold_change_applies() {
    let (engine, _) = engine_with(
        AcquisitionConfig {
            tmin: 0,
            tmax: 999,
            ..Default::default()
        },
        vec![Reply::Frame(frame_from(|_| 100))],
        Duration::from_millis(2),
    );

    engine.start("/dev/usbtmc0").unwrap();
    wait_for("first events", Duration::from_secs(5), || {
        engine.events_processed() >= 2
    });

    // every sample is now below threshold
    engine.set_threshold(101);
    let seen = engine.events_processed();
    wait_for("events after the update", Duration::from_secs(5), || {
        engine.events_processed() >= seen + 3
    });
    engine.stop();
    engine.join();

    let hist = engine.adc_sum();
    assert!(hist.bin_content(hist.find_bin(0.0)) >= 1.0);
}

// =============================================================================
// RATE
// =============================================================================

#[test]
fn test_rate_bounded_by_frame_delay() {
    let delay = Duration::from_millis(10);
    let (engine, _) = engine_with(
        AcquisitionConfig {
            max_nev: 20,
            ..Default::default()
        },
        vec![Reply::Frame(frame_from(|_| 1))],
        delay,
    );

    engine.start("/dev/usbtmc0").unwrap();
    engine.join();

    let rate = engine.capture_rate();
    assert!(rate > 0.0);
    assert!(rate <= 1.0 / delay.as_secs_f64() + 1e-6, "rate {rate}");

    let stats = engine.stats();
    assert_eq!(stats.events_processed, 20);
    assert!(stats.uptime_seconds.unwrap() >= 0.2);
    assert!(!stats.active);
}

#[test]
fn test_open_failure_reported() {
    let opener: Opener = Arc::new(|path: &Path| {
        Err(DaqError::Device(format!("no such device {}", path.display())))
    });
    let engine = AcquisitionEngine::with_opener(AcquisitionConfig::default(), opener).unwrap();

    engine.start("/dev/usbtmc7").unwrap();
    assert!(engine.wait_idle(Duration::from_secs(1)));

    assert!(matches!(engine.run_state(), RunState::OpenFailed { .. }));
    assert_eq!(engine.capture_rate(), 0.0);
    assert!(engine.stats().uptime_seconds.is_none());

    // a failed open leaves the engine ready for another attempt
    engine.start("/dev/usbtmc7").unwrap();
    engine.join();
    assert!(!engine.is_active());
}
