use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use bench360_core::{FailedRun, RunReport, SampleRecord};
use thiserror::Error;
use tracing::{info, warn};

pub const FAILED_LOG: &str = "failed_configs.jsonl";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Paths written for one executed configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRun {
    pub report: PathBuf,
    pub samples: PathBuf,
}

/// Result files under one output directory.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn failed_log_path(&self) -> PathBuf {
        self.dir.join(FAILED_LOG)
    }

    /// Write `<stem>.report.json` and `<stem>.samples.jsonl`. Reruns of an identical
    /// configuration overwrite their previous files.
    pub fn write_run(
        &self,
        report: &RunReport,
        details: &[SampleRecord],
    ) -> Result<StoredRun, StoreError> {
        self.ensure_dir()?;
        let stem = report.config.file_stem();
        let report_path = self.dir.join(format!("{}.report.json", stem));
        let samples_path = self.dir.join(format!("{}.samples.jsonl", stem));

        let json = serde_json::to_vec_pretty(report)?;
        write_atomic(&report_path, &json)?;

        let mut body = Vec::new();
        for record in details {
            serde_json::to_writer(&mut body, record)?;
            body.push(b'\n');
        }
        write_atomic(&samples_path, &body)?;

        info!(
            report = %report_path.display(),
            samples = details.len(),
            partial = report.is_partial(),
            "Stored run results"
        );
        Ok(StoredRun {
            report: report_path,
            samples: samples_path,
        })
    }

    /// Append one line to the failed-configurations log.
    pub fn append_failed(&self, failed: &FailedRun) -> Result<(), StoreError> {
        self.ensure_dir()?;
        let path = self.failed_log_path();
        let mut line = serde_json::to_vec(failed)?;
        line.push(b'\n');

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(&line)
            .and_then(|_| writer.flush())
            .map_err(|e| io_err(&path, e))?;

        warn!(stage = failed.stage.as_str(), error = %failed.error, "Recorded failed run");
        Ok(())
    }

    pub fn read_failed(&self) -> Result<Vec<FailedRun>, StoreError> {
        let path = self.failed_log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&path).map_err(|e| io_err(&path, e))?;
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| io_err(&path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line)?);
        }
        Ok(out)
    }

    pub fn read_report(&self, path: &Path) -> Result<RunReport, StoreError> {
        let raw = fs::read(path).map_err(|e| io_err(path, e))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| io_err(path, e))
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}
