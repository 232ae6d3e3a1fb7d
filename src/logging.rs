// src/logging.rs
//
// `tlog!` writes a local-time stamped line to stderr and, once
// `init_file_logging` has run, to a per-run file as well.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// File sink shared by every thread; `None` while file logging is off.
static LOG_FILE: Mutex<Option<File>> = Mutex::new(None);

fn timestamp() -> impl fmt::Display {
    chrono::Local::now().format("%H:%M:%S%.3f")
}

/// Name of the log file for a run started at `started`.
fn log_file_name(started: chrono::DateTime<chrono::Local>) -> String {
    started.format("%Y%m%d-%H%M%S-slcan.log").to_string()
}

/// Backend of `tlog!`. A poisoned sink is skipped, never fatal.
#[doc(hidden)]
pub fn write_line(args: fmt::Arguments<'_>) {
    let line = format!("{} {}", timestamp(), args);
    eprintln!("{}", line);
    if let Ok(mut sink) = LOG_FILE.lock() {
        if let Some(file) = sink.as_mut() {
            let _ = writeln!(file, "{}", line);
        }
    }
}

/// Start mirroring the log into `log_dir`. Returns the path of the new file.
pub fn init_file_logging(log_dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(log_file_name(chrono::Local::now()));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    if let Ok(mut sink) = LOG_FILE.lock() {
        *sink = Some(file);
    }
    write_line(format_args!("[logging] Writing log to {}", path.display()));
    Ok(path)
}

pub fn stop_file_logging() {
    let closed = LOG_FILE.lock().map(|mut sink| sink.take().is_some()).unwrap_or(false);
    if closed {
        write_line(format_args!("[logging] File logging stopped"));
    }
}

/// `eprintln!` with a `HH:MM:SS.mmm` prefix, mirrored to the log file.
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {
        $crate::logging::write_line(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_log_file_name() {
        let started = chrono::Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(log_file_name(started), "20240309-070501-slcan.log");
    }

    #[test]
    fn test_file_logging_writes_messages() {
        let dir = std::env::temp_dir().join(format!("slcan-log-test-{}", std::process::id()));
        let path = init_file_logging(&dir).unwrap();
        tlog!("[test] hello from the log file");
        stop_file_logging();
        tlog!("[test] only on stderr");

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("hello from the log file"));
        assert!(!content.contains("only on stderr"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
