use crate::cli::InfoArgs;
use crate::exit_codes;
use crate::output;
use mso_pulse::{
    AcquisitionConfig, ADC_SUM_SCALE, FRAME_HEADER_LEN, MIN_FRAME_LEN, READ_BUFFER_LEN,
    SAMPLES_PER_FRAME, WAVEFORM_QUERY,
};
use serde::Serialize;

#[derive(Serialize)]
struct FrameLayout {
    query: String,
    header_bytes: usize,
    samples: usize,
    min_frame_bytes: usize,
    read_buffer_bytes: usize,
    adc_sum_scale: f64,
}

#[derive(Serialize)]
struct InfoOutput {
    cli_version: String,
    platform: String,
    arch: String,
    device_from_env: Option<String>,
    defaults: AcquisitionConfig,
    frame: FrameLayout,
}

pub fn execute(args: InfoArgs) -> i32 {
    let info = InfoOutput {
        cli_version: env!("CARGO_PKG_VERSION").to_string(),
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        device_from_env: std::env::var("MSO_DEVICE").ok(),
        defaults: AcquisitionConfig::default(),
        frame: FrameLayout {
            query: String::from_utf8_lossy(WAVEFORM_QUERY).into_owned(),
            header_bytes: FRAME_HEADER_LEN,
            samples: SAMPLES_PER_FRAME,
            min_frame_bytes: MIN_FRAME_LEN,
            read_buffer_bytes: READ_BUFFER_LEN,
            adc_sum_scale: ADC_SUM_SCALE,
        },
    };

    if args.json {
        if let Err(e) = output::print_json(&info, false) {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
        return exit_codes::SUCCESS;
    }

    let defaults = &info.defaults;
    println!("mso-pulse CLI v{}", info.cli_version);
    println!("Platform: {} ({})", info.platform, info.arch);
    println!();
    match &info.device_from_env {
        Some(device) => println!("Device: {} (from $MSO_DEVICE)", device),
        None => println!("Device: {} (default)", defaults.device),
    }
    println!(
        "Window: tmin={}, tmax={}, threshold={}",
        defaults.tmin, defaults.tmax, defaults.threshold
    );
    println!(
        "ADC sum: {} bins over [{}, {})",
        defaults.adc_sum_bins.nbins, defaults.adc_sum_bins.min, defaults.adc_sum_bins.max
    );
    match defaults.read_timeout_ms {
        Some(ms) => println!("Read timeout: {} ms", ms),
        None => println!("Read timeout: none"),
    }
    println!(
        "Frame: query {}, {} header bytes + {} samples, buffer {} bytes",
        info.frame.query, info.frame.header_bytes, info.frame.samples, info.frame.read_buffer_bytes
    );

    exit_codes::SUCCESS
}
