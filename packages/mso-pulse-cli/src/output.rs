use mso_pulse::RunStats;
use std::io::Write;

/// Serialize `value` and print it on stdout.
pub fn print_json<T: serde::Serialize>(value: &T, compact: bool) -> Result<(), String> {
    let json = if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    }
    .map_err(|e| format!("JSON serialization failed: {}", e))?;

    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    handle
        .write_all(json.as_bytes())
        .and_then(|_| handle.write_all(b"\n"))
        .map_err(|e| format!("Failed to write to stdout: {}", e))
}

/// One line of the online monitor.
pub fn status_line(stats: &RunStats) -> String {
    format!(
        "Samples/sec: {:.1}  Online: {}  Entries: {}  Underflow: {}  Overflow: {}  Skipped: {}",
        stats.capture_rate,
        stats.active,
        stats.adc_sum_entries,
        stats.adc_sum_underflow,
        stats.adc_sum_overflow,
        stats.frames_skipped,
    )
}
