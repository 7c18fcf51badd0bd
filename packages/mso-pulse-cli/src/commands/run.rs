use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::{Duration, Instant};

use mso_pulse::{
    AcquisitionConfig, AcquisitionEngine, ParameterMode, RunState, RunStats, SimulatedScope,
    SimulatorConfig,
};
use serde::Serialize;

use crate::cli::RunArgs;
use crate::exit_codes;
use crate::monitor;
use crate::output;

#[derive(Serialize)]
struct RunSummary {
    state: RunState,
    device: String,
    simulated: bool,
    tmin: i32,
    tmax: i32,
    threshold: i32,
    parameter_mode: ParameterMode,
    #[serde(flatten)]
    stats: RunStats,
    adc_sum_mean: f64,
    adc_sum_std_dev: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    adc_sum_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pulse_shape_file: Option<String>,
}

/// Merge the config file (if any) with command-line overrides.
pub fn build_config(args: &RunArgs) -> Result<AcquisitionConfig, String> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .map_err(|e| format!("Cannot read config {}: {}", path, e))?;
            AcquisitionConfig::from_json(&json).map_err(|e| format!("{}: {}", path, e))?
        }
        None => AcquisitionConfig::default(),
    };

    if let Some(device) = &args.device {
        config.device = device.clone();
    }
    if let Some(t) = args.tmin {
        config.tmin = t;
    }
    if let Some(t) = args.tmax {
        config.tmax = t;
    }
    if let Some(t) = args.threshold {
        config.threshold = t;
    }
    if let Some(n) = args.max_events {
        config.max_nev = n;
    }
    if let Some(n) = args.nbins {
        config.adc_sum_bins.nbins = n;
    }
    if let Some(min) = args.adc_min {
        config.adc_sum_bins.min = min;
    }
    if let Some(max) = args.adc_max {
        config.adc_sum_bins.max = max;
    }
    if args.snapshot_params {
        config.parameter_mode = ParameterMode::Snapshot;
    }
    if let Some(ms) = args.read_timeout_ms {
        config.read_timeout_ms = Some(ms);
    }
    if args.no_read_timeout {
        config.read_timeout_ms = None;
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn validate_run_args(args: &RunArgs) -> Result<(), String> {
    if let Some(d) = args.duration {
        if !d.is_finite() || d <= 0.0 {
            return Err(format!("--duration must be a positive number of seconds, got {}", d));
        }
    }
    if args.update_period_ms == 0 {
        return Err("--update-period-ms must be greater than zero".to_string());
    }
    Ok(())
}

pub fn execute(args: RunArgs) -> i32 {
    if let Err(msg) = validate_run_args(&args) {
        eprintln!("Error: {}", msg);
        return exit_codes::INPUT_ERROR;
    }

    let config = match build_config(&args) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };

    let engine = if args.simulate {
        let (opener, _) = SimulatedScope::opener(SimulatorConfig {
            frame_period_ms: args.sim_period_ms,
            ..Default::default()
        });
        AcquisitionEngine::with_opener(config.clone(), opener)
    } else {
        AcquisitionEngine::new(config.clone())
    };
    let engine = match engine {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    if !args.quiet {
        eprintln!(
            "Acquiring from {}{}...",
            config.device,
            if args.simulate { " (simulated)" } else { "" }
        );
        eprintln!(
            "  Window: tmin={}, tmax={}, threshold={}",
            config.tmin, config.tmax, config.threshold
        );
        eprintln!(
            "  ADC sum: {} bins over [{}, {})",
            config.adc_sum_bins.nbins, config.adc_sum_bins.min, config.adc_sum_bins.max
        );
        if config.max_nev > 0 {
            eprintln!("  Event limit: {}", config.max_nev);
        }
    }

    if let Err(e) = engine.start(&config.device) {
        eprintln!("Error: {}", e);
        return exit_codes::EXECUTION_ERROR;
    }

    let commands = if args.interactive {
        if !args.quiet {
            eprintln!("Commands: tmin N, tmax N, thr N, s (status), q (quit)");
        }
        Some(monitor::spawn_stdin_reader())
    } else {
        None
    };

    watch(&engine, &args, commands.as_ref());
    engine.join();

    let stats = engine.stats();
    if !args.quiet {
        eprintln!("{}", output::status_line(&stats));
    }

    let state = engine.run_state();
    if let RunState::OpenFailed { message, .. } = &state {
        eprintln!("Error: {}", message);
        return exit_codes::DEVICE_ERROR;
    }

    if let Some(path) = &args.output {
        if let Err(e) = engine.write_adc_sum(path) {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    }
    if let Some(path) = &args.save_shape {
        if let Err(e) = engine.write_pulse_shape(path) {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    }

    let adc_sum = engine.adc_sum();
    let summary = RunSummary {
        state,
        device: config.device.clone(),
        simulated: args.simulate,
        tmin: engine.tmin(),
        tmax: engine.tmax(),
        threshold: engine.threshold(),
        parameter_mode: engine.parameter_mode(),
        stats,
        adc_sum_mean: adc_sum.mean(),
        adc_sum_std_dev: adc_sum.std_dev(),
        adc_sum_file: args.output.clone(),
        pulse_shape_file: args.save_shape.clone(),
    };

    if let Err(e) = output::print_json(&summary, args.compact) {
        eprintln!("Error: {}", e);
        return exit_codes::EXECUTION_ERROR;
    }

    exit_codes::SUCCESS
}

/// Online monitor: report every update period until the run ends.
fn watch(engine: &AcquisitionEngine, args: &RunArgs, commands: Option<&Receiver<String>>) {
    let period = Duration::from_millis(args.update_period_ms);
    let deadline = args
        .duration
        .map(|secs| Instant::now() + Duration::from_secs_f64(secs));
    let mut commands = commands;
    let mut stopping = false;

    loop {
        let wait = match deadline {
            Some(d) if !stopping => period.min(d.saturating_duration_since(Instant::now())),
            _ => period,
        };
        if engine.wait_idle(wait) {
            break;
        }

        if let Some(rx) = commands {
            loop {
                match rx.try_recv() {
                    Ok(line) if line.is_empty() => continue,
                    Ok(line) => match monitor::parse_command(&line) {
                        Ok(cmd) => {
                            if !monitor::apply(engine, cmd) {
                                return;
                            }
                        }
                        Err(msg) => eprintln!("Warning: {}", msg),
                    },
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        log::debug!("stdin closed, live tuning disabled");
                        commands = None;
                        break;
                    }
                }
            }
        }

        if !stopping && deadline.is_some_and(|d| Instant::now() >= d) {
            log::info!("Run duration reached");
            engine.stop();
            stopping = true;
        }

        if !args.quiet {
            eprintln!("{}", output::status_line(&engine.stats()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_flags() {
        let config = build_config(&RunArgs::default()).unwrap();
        assert_eq!(config.device, "/dev/usbtmc0");
        assert_eq!(config.tmin, 1);
        assert_eq!(config.tmax, 1000);
        assert_eq!(config.threshold, 0);
        assert_eq!(config.parameter_mode, ParameterMode::Live);
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"device": "/dev/usbtmc1", "tmin": 100, "tmax": 500, "threshold": 4}}"#
        )
        .unwrap();

        let args = RunArgs {
            config: Some(file.path().display().to_string()),
            tmax: Some(600),
            snapshot_params: true,
            no_read_timeout: true,
            ..Default::default()
        };
        let config = build_config(&args).unwrap();

        assert_eq!(config.device, "/dev/usbtmc1");
        assert_eq!(config.tmin, 100);
        assert_eq!(config.tmax, 600);
        assert_eq!(config.threshold, 4);
        assert_eq!(config.parameter_mode, ParameterMode::Snapshot);
        assert_eq!(config.read_timeout(), None);
    }

    #[test]
    fn test_bad_inputs_rejected() {
        let args = RunArgs {
            nbins: Some(0),
            ..Default::default()
        };
        assert!(build_config(&args).is_err());

        let args = RunArgs {
            config: Some("/nonexistent/mso.json".to_string()),
            ..Default::default()
        };
        assert!(build_config(&args).is_err());

        let args = RunArgs {
            duration: Some(-1.0),
            update_period_ms: 400,
            ..Default::default()
        };
        assert!(validate_run_args(&args).is_err());
        assert!(validate_run_args(&RunArgs::default()).is_err());
    }
}
