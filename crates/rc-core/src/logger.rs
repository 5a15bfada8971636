//! Decimated, time-aligned flight log. Interface plus the one concrete
//! non-blocking writer: a single outstanding write at a time, dropping the
//! record (and counting it as missed) if the previous write hasn't landed
//! yet, so a slow disk never blocks the 1ms control tick.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use rc_proto::MAX_ROTORS;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::timestamp::Timestamp;

/// One fully-assembled line, in the column order the core's log schema
/// requires. Building this is the caller's job (the `main` task and the
/// `log` activity); the logger only ever sees finished text.
#[derive(Debug, Clone, Default)]
pub struct LogRecord {
    pub ts: Option<Timestamp>,
    pub rate_imu: f64,
    pub rate_mag: f64,
    pub rate_motor: f64,
    pub battery: Option<f64>,
    pub temp: Option<f64>,
    pub gyro_raw: Option<[f64; 3]>,
    pub gyro_filt: Option<[f64; 3]>,
    pub accel_raw: Option<[f64; 3]>,
    pub accel_filt: Option<[f64; 3]>,
    pub mag_raw: Option<[f64; 3]>,
    pub mag_filt: Option<[f64; 3]>,
    pub wd: [Option<f64>; MAX_ROTORS],
    pub vel: [Option<f64>; MAX_ROTORS],
    pub clkrate: [Option<u8>; MAX_ROTORS],
}

fn push_opt(out: &mut String, v: Option<f64>) {
    match v {
        Some(v) => out.push_str(&format!("{v:.6}")),
        None => out.push('-'),
    }
    out.push(' ');
}

fn push_triplet(out: &mut String, v: Option<[f64; 3]>) {
    match v {
        Some([a, b, c]) => {
            out.push_str(&format!("{a:.6} {b:.6} {c:.6} "));
        }
        None => out.push_str("- - - "),
    }
}

/// Formats a [`LogRecord`] as one space-separated line, `-` for any channel
/// that did not update this cycle. Column order: `ts  rate.imu rate.mag
/// rate.motor  battery  temp gx gy gz gx_f gy_f gz_f ax ay az ax_f ay_f az_f
/// mx my mz mx_f my_f mz_f  wd[0..7]  vel[0..7]  clkrate[0..7]`.
pub fn format_log_line(r: &LogRecord) -> String {
    let mut out = String::new();
    match r.ts {
        Some(ts) => out.push_str(&format!("{}.{:09} ", ts.sec, ts.nsec)),
        None => out.push_str("- "),
    }
    out.push_str(&format!("{:.3} {:.3} {:.3} ", r.rate_imu, r.rate_mag, r.rate_motor));
    push_opt(&mut out, r.battery);
    push_opt(&mut out, r.temp);
    push_triplet(&mut out, r.gyro_raw);
    push_triplet(&mut out, r.gyro_filt);
    push_triplet(&mut out, r.accel_raw);
    push_triplet(&mut out, r.accel_filt);
    push_triplet(&mut out, r.mag_raw);
    push_triplet(&mut out, r.mag_filt);
    for v in r.wd {
        push_opt(&mut out, v);
    }
    for v in r.vel {
        push_opt(&mut out, v);
    }
    for v in r.clkrate {
        match v {
            Some(c) => out.push_str(&format!("{c} ")),
            None => out.push_str("- "),
        }
    }
    out.truncate(out.trim_end().len());
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LogStats {
    pub written: u64,
    pub missed: u64,
}

/// Accepts one prepared line per cycle, decimated upstream by the caller.
/// Shared-reference `submit` so the writer can be held behind an `Arc` and
/// driven from the single-threaded `main` task without a lock on the
/// Supervisor's own state.
pub trait LogWriter: Send + Sync {
    /// Submits a line. Returns `true` if it was handed off to the writer,
    /// `false` if a previous write was still in flight and this one was
    /// dropped.
    fn submit(&self, line: String) -> bool;

    fn stats(&self) -> LogStats;
}

/// Writes lines to a file via `tokio::fs`, one write in flight at a time.
/// `submit` flips an atomic busy flag and spawns the write as a detached
/// task; a `submit` that finds the flag already set drops its line and
/// counts it as missed, so a slow disk never backs up onto the caller.
pub struct FileLogWriter {
    file: Arc<Mutex<File>>,
    busy: Arc<AtomicBool>,
    written: Arc<AtomicU64>,
    missed: Arc<AtomicU64>,
    path: Arc<PathBuf>,
}

impl FileLogWriter {
    /// Creates (truncating) `path`, writes `header` lines (each already
    /// `#`-prefixed by the caller) up front, and readies the writer.
    pub async fn create(path: impl AsRef<Path>, header: &[String]) -> std::io::Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let mut file = File::create(&path).await?;
        for line in header {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        Ok(FileLogWriter {
            file: Arc::new(Mutex::new(file)),
            busy: Arc::new(AtomicBool::new(false)),
            written: Arc::new(AtomicU64::new(0)),
            missed: Arc::new(AtomicU64::new(0)),
            path: Arc::new(path),
        })
    }
}

impl LogWriter for FileLogWriter {
    fn submit(&self, line: String) -> bool {
        if self.busy.swap(true, Ordering::AcqRel) {
            self.missed.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let file = self.file.clone();
        let busy = self.busy.clone();
        let written = self.written.clone();
        let path = self.path.clone();
        tokio::spawn(async move {
            let mut guard = file.lock().await;
            let result = async {
                guard.write_all(line.as_bytes()).await?;
                guard.write_all(b"\n").await
            }
            .await;
            match result {
                Ok(()) => {
                    written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "log write failed"),
            }
            busy.store(false, Ordering::Release);
        });
        true
    }

    fn stats(&self) -> LogStats {
        LogStats {
            written: self.written.load(Ordering::Relaxed),
            missed: self.missed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_channels_render_as_placeholder() {
        let record = LogRecord { rate_imu: 1000.0, ..LogRecord::default() };
        let line = format_log_line(&record);
        assert!(line.starts_with("- 1000.000 0.000 0.000"));
        assert!(line.contains("- - -"));
    }

    #[test]
    fn present_triplets_are_formatted() {
        let record = LogRecord { accel_filt: Some([1.0, 2.0, 3.0]), ..LogRecord::default() };
        let line = format_log_line(&record);
        assert!(line.contains("1.000000 2.000000 3.000000"));
    }

    #[tokio::test]
    async fn first_submit_is_accepted_and_eventually_written() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rc-core-logger-test-{}.log", std::process::id()));
        let writer = FileLogWriter::create(&path, &["# header".to_string()]).await.unwrap();

        assert!(writer.submit("line 0".to_string()));
        // Give the detached write task a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(writer.stats().written, 1);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn overlapping_submit_is_dropped_as_missed() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rc-core-logger-test-overlap-{}.log", std::process::id()));
        let writer = FileLogWriter::create(&path, &[]).await.unwrap();

        // Hold the busy flag manually to simulate a write still in flight.
        writer.busy.store(true, Ordering::Release);
        assert!(!writer.submit("dropped".to_string()));
        assert_eq!(writer.stats().missed, 1);

        let _ = std::fs::remove_file(&path);
    }
}
