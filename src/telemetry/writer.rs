//! # Prediction Log Writer
//!
//! Append-only JSON-lines writer with size/age rotation, gzip compression of
//! rotated files and bounded retention.

use super::recorder::PredictionEvent;
use crate::config::TelemetryConfig;
use crate::types::now_ms;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

const ACTIVE_FILE: &str = "predictions.log";
const ROTATED_PREFIX: &str = "predictions.log.";

/// File rotation policy
#[derive(Debug, Clone, PartialEq)]
pub enum RotationPolicy {
    /// Rotate when file exceeds size (bytes)
    BySize(u64),

    /// Rotate when the file is older than the given age
    ByAge(Duration),

    /// Rotate on whichever limit is reached first
    BySizeOrAge { max_bytes: u64, max_age: Duration },

    /// No rotation
    Never,
}

/// Writer configuration
#[derive(Debug, Clone)]
pub struct PredictLogConfig {
    /// Directory holding the active and rotated files
    pub base_dir: PathBuf,

    pub rotation: RotationPolicy,

    /// Enable compression for rotated logs
    pub compress_rotated: bool,

    /// Maximum number of rotated files to keep
    pub max_rotated_files: usize,

    /// Buffer size for writes (bytes)
    pub buffer_size: usize,

    /// Flush after every line
    pub immediate_flush: bool,
}

impl Default for PredictLogConfig {
    fn default() -> Self {
        PredictLogConfig {
            base_dir: PathBuf::from("./var/predictlog"),
            rotation: RotationPolicy::BySize(100 * 1024 * 1024), // 100 MB
            compress_rotated: true,
            max_rotated_files: 10,
            buffer_size: 8192,
            immediate_flush: false,
        }
    }
}

impl PredictLogConfig {
    pub fn from_telemetry_config(config: &TelemetryConfig) -> Self {
        PredictLogConfig {
            base_dir: config.log_dir.clone(),
            rotation: match (config.rotate_bytes, config.rotate_age_secs) {
                (0, 0) => RotationPolicy::Never,
                (bytes, 0) => RotationPolicy::BySize(bytes),
                (0, secs) => RotationPolicy::ByAge(Duration::from_secs(secs)),
                (bytes, secs) => RotationPolicy::BySizeOrAge {
                    max_bytes: bytes,
                    max_age: Duration::from_secs(secs),
                },
            },
            compress_rotated: config.compress_rotated,
            max_rotated_files: config.max_rotated_files,
            ..Default::default()
        }
    }
}

struct LogFile {
    writer: BufWriter<File>,
    created_at: SystemTime,
    bytes_written: u64,
    events_written: u64,
}

/// Thread-safe prediction log writer
pub struct PredictLogWriter {
    config: PredictLogConfig,
    current: Mutex<Option<LogFile>>,
    rotations: AtomicU64,
}

impl PredictLogWriter {
    pub fn new(config: PredictLogConfig) -> io::Result<Self> {
        fs::create_dir_all(&config.base_dir)?;
        let writer = PredictLogWriter {
            config,
            current: Mutex::new(None),
            rotations: AtomicU64::new(0),
        };
        {
            let mut guard = writer.current.lock();
            *guard = Some(writer.open_active()?);
        }
        Ok(writer)
    }

    pub fn active_path(&self) -> PathBuf {
        self.config.base_dir.join(ACTIVE_FILE)
    }

    /// Append one event as a JSON line, rotating afterwards if the policy says so.
    pub fn write_event(&self, event: &PredictionEvent) -> io::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut guard = self.current.lock();
        if guard.is_none() {
            *guard = Some(self.open_active()?);
        }

        let needs_rotation = match guard.as_mut() {
            Some(file) => {
                file.writer.write_all(&line)?;
                if self.config.immediate_flush {
                    file.writer.flush()?;
                }
                file.bytes_written += line.len() as u64;
                file.events_written += 1;
                self.should_rotate(file)
            }
            None => false,
        };

        if needs_rotation {
            self.rotate_locked(&mut guard)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> io::Result<()> {
        if let Some(file) = self.current.lock().as_mut() {
            file.writer.flush()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> Option<PredictLogStats> {
        let guard = self.current.lock();
        guard.as_ref().map(|file| PredictLogStats {
            path: self.active_path(),
            bytes_written: file.bytes_written,
            events_written: file.events_written,
            created_at: file.created_at,
            rotations: self.rotations.load(Ordering::Relaxed),
        })
    }

    /// Checked after each write, so an idle file rotates on its next event.
    fn should_rotate(&self, file: &LogFile) -> bool {
        let too_old = |max_age: &Duration| {
            SystemTime::now()
                .duration_since(file.created_at)
                .map(|age| age >= *max_age)
                .unwrap_or(false)
        };
        match &self.config.rotation {
            RotationPolicy::BySize(max_bytes) => file.bytes_written >= *max_bytes,
            RotationPolicy::ByAge(max_age) => too_old(max_age),
            RotationPolicy::BySizeOrAge { max_bytes, max_age } => {
                file.bytes_written >= *max_bytes || too_old(max_age)
            }
            RotationPolicy::Never => false,
        }
    }

    /// Close the active file, move it aside, compress and prune, then reopen.
    fn rotate_locked(&self, guard: &mut Option<LogFile>) -> io::Result<()> {
        if let Some(mut old) = guard.take() {
            old.writer.flush()?;
            drop(old);

            let seq = self.rotations.fetch_add(1, Ordering::Relaxed);
            let rotated = self
                .config
                .base_dir
                .join(format!("{}{}-{:06}", ROTATED_PREFIX, now_ms(), seq));
            fs::rename(self.active_path(), &rotated)?;

            if self.config.compress_rotated {
                compress_file(&rotated)?;
            }
            self.cleanup_old_files()?;
        }

        *guard = Some(self.open_active()?);
        Ok(())
    }

    fn open_active(&self) -> io::Result<LogFile> {
        let path = self.active_path();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let existing = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(LogFile {
            writer: BufWriter::with_capacity(self.config.buffer_size, file),
            created_at: SystemTime::now(),
            bytes_written: existing,
            events_written: 0,
        })
    }

    /// Rotated files carry a millisecond timestamp, so name order is age order.
    fn cleanup_old_files(&self) -> io::Result<()> {
        let mut rotated = self.rotated_files()?;
        rotated.sort();
        rotated.reverse();

        if rotated.len() > self.config.max_rotated_files {
            for path in &rotated[self.config.max_rotated_files..] {
                fs::remove_file(path).ok();
            }
        }
        Ok(())
    }

    /// Rotated files currently on disk.
    pub fn rotated_files(&self) -> io::Result<Vec<PathBuf>> {
        Ok(fs::read_dir(&self.config.base_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|name| name.starts_with(ROTATED_PREFIX))
                    .unwrap_or(false)
            })
            .collect())
    }
}

impl Drop for PredictLogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Gzip `path` to `path.gz` and remove the original.
fn compress_file(path: &Path) -> io::Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let input = fs::read(path)?;
    let output_path = PathBuf::from(format!("{}.gz", path.display()));
    let mut encoder = GzEncoder::new(File::create(&output_path)?, Compression::default());
    encoder.write_all(&input)?;
    encoder.finish()?;

    fs::remove_file(path).ok();
    Ok(())
}

/// Statistics for the active log file
#[derive(Debug, Clone)]
pub struct PredictLogStats {
    pub path: PathBuf,
    pub bytes_written: u64,
    pub events_written: u64,
    pub created_at: SystemTime,
    pub rotations: u64,
}
