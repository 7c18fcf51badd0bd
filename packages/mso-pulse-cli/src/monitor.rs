// Live tuning from stdin while a run is active
//
// Lines are read on a dedicated thread and relayed over a channel so the
// monitor loop can poll them between status updates without blocking.

use std::io::{self, BufRead};
use std::sync::mpsc::{self, Receiver};

use mso_pulse::AcquisitionEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCommand {
    Tmin(i32),
    Tmax(i32),
    Threshold(i32),
    Status,
    Stop,
}

pub fn parse_command(line: &str) -> Result<MonitorCommand, String> {
    let mut words = line.split_whitespace();
    let keyword = words.next().ok_or_else(|| "empty command".to_string())?;

    let mut value = || -> Result<i32, String> {
        let raw = words
            .next()
            .ok_or_else(|| format!("'{}' needs a value", keyword))?;
        raw.parse::<i32>()
            .map_err(|e| format!("invalid value '{}' for {}: {}", raw, keyword, e))
    };

    let command = match keyword {
        "tmin" => MonitorCommand::Tmin(value()?),
        "tmax" => MonitorCommand::Tmax(value()?),
        "thr" | "threshold" => MonitorCommand::Threshold(value()?),
        "s" | "status" => MonitorCommand::Status,
        "q" | "quit" | "stop" => MonitorCommand::Stop,
        other => return Err(format!("unknown command '{}'", other)),
    };

    if words.next().is_some() {
        return Err(format!("trailing input after '{}'", line.trim()));
    }
    Ok(command)
}

/// Spawn the stdin reader. The channel closes at end of input.
pub fn spawn_stdin_reader() -> Receiver<String> {
    let (line_tx, line_rx) = mpsc::channel::<String>();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    line_rx
}

/// Apply a command to the engine. Returns `false` once the run should end.
pub fn apply(engine: &AcquisitionEngine, command: MonitorCommand) -> bool {
    match command {
        MonitorCommand::Tmin(t) => {
            log::info!("tmin -> {}", t);
            engine.set_tmin(t);
        }
        MonitorCommand::Tmax(t) => {
            log::info!("tmax -> {}", t);
            engine.set_tmax(t);
        }
        MonitorCommand::Threshold(t) => {
            log::info!("threshold -> {}", t);
            engine.set_threshold(t);
        }
        MonitorCommand::Status => {
            eprintln!(
                "tmin: {}  tmax: {}  threshold: {}  mode: {:?}",
                engine.tmin(),
                engine.tmax(),
                engine.threshold(),
                engine.parameter_mode()
            );
        }
        MonitorCommand::Stop => {
            log::info!("Quit requested");
            engine.stop();
            return false;
        }
    }
    true
}
