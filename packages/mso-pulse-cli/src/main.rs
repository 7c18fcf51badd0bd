use clap::Parser;

mod cli;
mod commands;
mod exit_codes;
mod monitor;
mod output;

use cli::{Cli, Command};

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    // per-event trace output from the worker only with -vvvv
    let engine_level = if verbose >= 4 {
        log::LevelFilter::Trace
    } else {
        level.min(log::LevelFilter::Debug)
    };

    env_logger::Builder::new()
        .filter_level(level)
        .filter_module("mso_pulse", engine_level)
        .format_timestamp(None)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    log::debug!("mso-pulse CLI v{}", env!("CARGO_PKG_VERSION"));

    let code = match cli.command {
        Command::Run(args) => commands::run::execute(args),
        Command::Info(args) => commands::info::execute(args),
    };

    std::process::exit(code);
}
