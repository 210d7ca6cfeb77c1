//! Stderr logger behind the `log` facade, with an optional append-mode
//! log file for debugging a running daemon.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use owo_colors::OwoColorize;

struct DriverLogger {
    file: Mutex<Option<File>>,
}

static LOGGER: DriverLogger = DriverLogger {
    file: Mutex::new(None),
};

impl Log for DriverLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = record.level();
        let tag = format!("{level:5}");
        let coloured = match level {
            Level::Error => tag.bright_red().to_string(),
            Level::Warn => tag.bright_yellow().to_string(),
            Level::Info => tag.bright_blue().to_string(),
            Level::Debug => tag.bright_cyan().to_string(),
            Level::Trace => tag.bright_magenta().to_string(),
        };
        eprintln!("{coloured} {}", record.args());

        if let Ok(mut guard) = self.file.lock() {
            if let Some(file) = guard.as_mut() {
                let _ = writeln!(file, "{tag} {}", record.args());
            }
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
        if let Ok(mut guard) = self.file.lock() {
            if let Some(file) = guard.as_mut() {
                let _ = file.flush();
            }
        }
    }
}

/// Install the logger. Debug mode raises the max level from info; a log
/// path mirrors every line into that file (append). An unopenable log file
/// disables file output but never the daemon.
pub fn init(debug: bool, log_path: Option<&Path>) -> Result<(), SetLoggerError> {
    if let Some(path) = log_path {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                if let Ok(mut guard) = LOGGER.file.lock() {
                    *guard = Some(file);
                }
            }
            Err(e) => {
                eprintln!("fat32d: could not open {}: {e}", path.display());
                eprintln!("log output to file is disabled");
            }
        }
    }
    log::set_max_level(if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    log::set_logger(&LOGGER)
}
