use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Shared counter of completed parts, updated from every worker.
#[derive(Debug)]
pub struct Progress {
    total_bytes: u64,
    total_parts: u32,
    bytes_done: AtomicU64,
    parts_done: AtomicU32,
    started: Instant,
}

impl Progress {
    pub fn new(total_bytes: u64, total_parts: u32) -> Self {
        Self {
            total_bytes,
            total_parts,
            bytes_done: AtomicU64::new(0),
            parts_done: AtomicU32::new(0),
            started: Instant::now(),
        }
    }

    /// Count a finished part and log where the transfer stands.
    pub fn part_done(&self, part_number: u32, bytes: u64) -> Snapshot {
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed);
        self.parts_done.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.snapshot();
        log::info!("Part {}: uploaded, {}", part_number, snapshot);
        snapshot
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            bytes_done: self.bytes_done.load(Ordering::Relaxed),
            total_bytes: self.total_bytes,
            parts_done: self.parts_done.load(Ordering::Relaxed),
            total_parts: self.total_parts,
            elapsed: self.started.elapsed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub parts_done: u32,
    pub total_parts: u32,
    pub elapsed: Duration,
}

impl Snapshot {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        100.0 * self.bytes_done as f64 / self.total_bytes as f64
    }

    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_done as f64 / secs
        } else {
            0.0
        }
    }

    pub fn mb_per_sec(&self) -> f64 {
        self.bytes_per_sec() / BYTES_PER_MB
    }

    /// Time left at the current average rate, `None` before any byte is sent.
    pub fn eta(&self) -> Option<Duration> {
        let rate = self.bytes_per_sec();
        if rate <= 0.0 {
            return None;
        }
        let remaining = self.total_bytes.saturating_sub(self.bytes_done);
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "progress: {}/{} parts, {:.1}%, {:.2} MB/s, est time remaining: ",
            self.parts_done,
            self.total_parts,
            self.percent(),
            self.mb_per_sec()
        )?;
        match self.eta() {
            Some(eta) => write!(f, "{}", format_duration(eta)),
            None => write!(f, "?"),
        }
    }
}

/// Render a duration as `01h 02m 03s`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!(
        "{:02}h {:02}m {:02}s",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}
