//! Flat-file operation logs.
//!
//! Each [`Logger`] owns one append-only file under the log directory, named
//! after its prefix and creation time. Every entry is mirrored to the tracing
//! console output.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tracing::{error, info};

pub struct Logger {
    path: PathBuf,
    file: File,
}

impl Logger {
    pub fn new(dir: impl AsRef<Path>, prefix: &str) -> io::Result<Self> {
        Self::with_clock(dir.as_ref(), prefix, Utc::now())
    }

    fn with_clock(dir: &Path, prefix: &str, now: DateTime<Utc>) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let stamp = iso_timestamp(now).replace([':', '.'], "-");

        // Same prefix in the same millisecond: add a numeric suffix instead of
        // sharing a file.
        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{}-{}.log", prefix, stamp)
            } else {
                format!("{}-{}-{}.log", prefix, stamp, attempt)
            };
            let path = dir.join(name);
            match OpenOptions::new().append(true).create_new(true).open(&path) {
                Ok(file) => return Ok(Self { path, file }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&mut self, message: &str, data: Option<&Value>) -> io::Result<()> {
        let line = format!("[{}] {}", iso_timestamp(Utc::now()), message);
        info!("{}", line);
        match data {
            Some(data) => self.write_block(&line, &pretty(data)),
            None => writeln!(self.file, "{}", line),
        }
    }

    /// Records an error with its full cause chain.
    pub fn error(&mut self, message: &str, err: Option<&dyn std::error::Error>) -> io::Result<()> {
        let line = format!("[{}] ERROR: {}", iso_timestamp(Utc::now()), message);
        error!("{}", line);
        match err {
            Some(err) => self.write_block(&line, &cause_chain(err)),
            None => writeln!(self.file, "{}", line),
        }
    }

    /// Records an error described by a JSON payload rather than an error value.
    pub fn error_data(&mut self, message: &str, data: &Value) -> io::Result<()> {
        let line = format!("[{}] ERROR: {}", iso_timestamp(Utc::now()), message);
        error!("{}", line);
        self.write_block(&line, &pretty(data))
    }

    pub fn close(mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }

    fn write_block(&mut self, line: &str, body: &str) -> io::Result<()> {
        write!(self.file, "{}\n{}\n\n", line, body)
    }
}

fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn cause_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(&format!("\n  caused by: {}", cause));
        source = cause.source();
    }
    out
}

fn pretty(data: &Value) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string())
}
