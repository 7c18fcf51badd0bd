use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "mso-pulse",
    version,
    about = "Online pulse analysis for MSO5000 oscilloscopes",
    long_about = "Acquire waveforms from an MSO5000 scope over USBTMC, integrate each pulse\n\
                  inside a time window above a threshold and histogram the ADC sums.\n\
                  Set $MSO_DEVICE or use --device to select the scope."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv; -vvvv logs every event)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Acquire and analyse pulses until stopped
    Run(RunArgs),
    /// Show defaults and frame layout
    Info(InfoArgs),
}

#[derive(Args, Default)]
pub struct RunArgs {
    /// Scope device node
    #[arg(long, env = "MSO_DEVICE")]
    pub device: Option<String>,

    /// JSON acquisition config; flags given on the command line win
    #[arg(long)]
    pub config: Option<String>,

    /// First time bin of the integration window
    #[arg(long, allow_negative_numbers = true)]
    pub tmin: Option<i32>,

    /// Last time bin of the integration window
    #[arg(long, allow_negative_numbers = true)]
    pub tmax: Option<i32>,

    /// Threshold in ADC units
    #[arg(long, allow_negative_numbers = true)]
    pub threshold: Option<i32>,

    /// Stop after this many events
    #[arg(long)]
    pub max_events: Option<u64>,

    /// Stop after this many seconds
    #[arg(long)]
    pub duration: Option<f64>,

    /// Number of ADC sum bins
    #[arg(long)]
    pub nbins: Option<usize>,

    /// Lower edge of the ADC sum range
    #[arg(long, allow_negative_numbers = true)]
    pub adc_min: Option<f64>,

    /// Upper edge of the ADC sum range
    #[arg(long, allow_negative_numbers = true)]
    pub adc_max: Option<f64>,

    /// Read the cuts once per frame instead of once per sample
    #[arg(long, default_value_t = false)]
    pub snapshot_params: bool,

    /// Deadline for one frame read in milliseconds
    #[arg(long, env = "MSO_READ_TIMEOUT_MS")]
    pub read_timeout_ms: Option<u64>,

    /// Block on frame reads without a deadline, overrides --read-timeout-ms
    #[arg(long, default_value_t = false)]
    pub no_read_timeout: bool,

    /// Online monitor update period in milliseconds
    #[arg(long, default_value_t = 400)]
    pub update_period_ms: u64,

    /// Accept `tmin N`, `tmax N`, `thr N` and `q` on stdin while running
    #[arg(long, default_value_t = false)]
    pub interactive: bool,

    /// Use the built-in pulse simulator instead of a device
    #[arg(long, default_value_t = false)]
    pub simulate: bool,

    /// Simulated time per frame in milliseconds
    #[arg(long, default_value_t = 10, requires = "simulate")]
    pub sim_period_ms: u64,

    /// Save the ADC sum distribution to this JSON file
    #[arg(short, long)]
    pub output: Option<String>,

    /// Save the last pulse shape to this JSON file
    #[arg(long)]
    pub save_shape: Option<String>,

    /// Compact JSON summary (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,

    /// Suppress the online monitor on stderr
    #[arg(long, default_value_t = false)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct InfoArgs {
    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}
