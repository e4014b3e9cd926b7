use anyhow::{Context, Result};
use chrono::Local;
use env_logger::{Builder, Env, Target};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use crate::config::LoggingConfig;

/// Writes every log line to two sinks.
pub struct Tee<A: Write, B: Write> {
    first: A,
    second: B,
}

impl<A: Write, B: Write> Tee<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }

    pub fn into_inner(self) -> (A, B) {
        (self.first, self.second)
    }
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.first.write_all(buf)?;
        self.second.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.first.flush()?;
        self.second.flush()
    }
}

fn short_file(path: Option<&str>) -> &str {
    path.and_then(|p| Path::new(p).file_name())
        .and_then(|name| name.to_str())
        .unwrap_or("?")
}

/// Initialise the global logger: stderr plus an append-only text file.
/// `RUST_LOG` overrides the configured level.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.file)
        .with_context(|| format!("failed to open log file {}", config.file))?;

    Builder::from_env(Env::default().default_filter_or(config.level.as_str()))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - Line {} - [{}] - {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.line().unwrap_or(0),
                short_file(record.file()),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(Tee::new(io::stderr(), file))))
        .try_init()
        .context("logger already initialised")?;

    Ok(())
}

/// Flush buffered records before the process exits.
pub fn shutdown() {
    log::logger().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tee_writes_both_sinks() {
        let mut tee = Tee::new(Vec::new(), Vec::new());
        tee.write_all(b"2024-01-02 09:30:00 - INFO - hello\n").unwrap();
        tee.flush().unwrap();
        let (a, b) = tee.into_inner();
        assert_eq!(a, b);
        assert!(String::from_utf8(a).unwrap().contains("hello"));
    }

    #[test]
    fn test_short_file_strips_directories() {
        assert_eq!(short_file(Some("src/routes.rs")), "routes.rs");
        assert_eq!(short_file(None), "?");
    }
}
