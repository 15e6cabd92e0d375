//! Scalar logging collaborator
//!
//! The trainer emits `(name, value, step)` triples and free-text info lines.
//! The JSONL writer stands in for a TensorBoard event file; non-master ranks
//! get a [`NullLogger`] so shared log files are only ever written by rank 0.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::error::Result;

/// Sink for per-step scalars and run-level info lines
pub trait ScalarLogger: Send {
    /// Record one scalar at the given global step
    fn add_scalar(&mut self, name: &str, value: f64, step: usize);

    /// Record a free-text line
    fn log_info(&mut self, line: &str);

    /// Flush buffered records to durable storage
    fn flush(&mut self) -> Result<()>;
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    name: &'a str,
    value: f64,
    step: usize,
}

/// Append-only JSONL scalar log, one record per line
pub struct JsonlLogger {
    writer: BufWriter<File>,
}

impl JsonlLogger {
    /// Open (or create) the scalar log at `path`
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl ScalarLogger for JsonlLogger {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) {
        let record = ScalarRecord { name, value, step };
        // a malformed record is not worth aborting a training step over
        if let Ok(line) = serde_json::to_string(&record) {
            let _ = writeln!(self.writer, "{line}");
        }
    }

    fn log_info(&mut self, line: &str) {
        info!("{line}");
        let _ = writeln!(self.writer, "{}", serde_json::json!({ "info": line }));
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Logger for non-master ranks: drops everything
pub struct NullLogger;

impl ScalarLogger for NullLogger {
    fn add_scalar(&mut self, _name: &str, _value: f64, _step: usize) {}

    fn log_info(&mut self, _line: &str) {}

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// In-memory logger used by tests to assert on emitted scalars
#[derive(Default)]
pub struct MemoryLogger {
    /// Recorded `(name, value, step)` triples, in emission order
    pub scalars: Vec<(String, f64, usize)>,
    /// Recorded info lines
    pub lines: Vec<String>,
}

impl ScalarLogger for MemoryLogger {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) {
        self.scalars.push((name.to_string(), value, step));
    }

    fn log_info(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Build the logger for a rank: JSONL on the master, null elsewhere
pub fn for_rank(is_master: bool, run_dir: &Path) -> Result<Box<dyn ScalarLogger>> {
    if is_master {
        Ok(Box::new(JsonlLogger::create(run_dir.join("scalars.jsonl"))?))
    } else {
        Ok(Box::new(NullLogger))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_jsonl_logger_writes_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scalars.jsonl");
        let mut logger = JsonlLogger::create(&path).unwrap();
        logger.add_scalar("Loss/train", 0.5, 1);
        logger.add_scalar("Loss/train", 0.4, 2);
        logger.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["name"], "Loss/train");
        assert_eq!(first["step"], 1);
    }

    #[test]
    fn test_for_rank_gates_on_master() {
        let dir = TempDir::new().unwrap();
        let mut logger = for_rank(false, dir.path()).unwrap();
        logger.add_scalar("Loss/train", 1.0, 0);
        logger.flush().unwrap();
        assert!(!dir.path().join("scalars.jsonl").exists());

        let mut master = for_rank(true, dir.path()).unwrap();
        master.add_scalar("Loss/train", 1.0, 0);
        master.flush().unwrap();
        assert!(dir.path().join("scalars.jsonl").exists());
    }
}
