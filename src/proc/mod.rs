//! Process observation pipeline: snapshotting, lifecycle tracking, and
//! group aggregation.
//!
//! - `read`: one-shot snapshots of all live processes from /proc
//! - `tracker`: keyed registry computing per-cycle counter deltas
//! - `grouper`: per-group roll-up with monotone counter history

pub mod grouper;
pub mod read;
pub mod tracker;

use std::io;
use std::path::PathBuf;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Identity of one process life. Start ticks come straight from the kernel
/// (field 22 of `/proc/<pid>/stat`), so a recycled pid yields a new key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessKey {
    pub pid: u32,
    pub start_ticks: u64,
}

/// Identity of one thread life, same scheme as [`ProcessKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadKey {
    pub tid: u32,
    pub start_ticks: u64,
}

/// Attributes that stay fixed for the life of a process. `effective_uid`
/// is absent when the status file could not be read; misreporting an
/// unknown owner as root would be worse than reporting nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Static {
    pub comm: String,
    pub cmdline: Vec<String>,
    pub cgroups: Vec<String>,
    pub parent_pid: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub effective_uid: Option<u32>,
}

/// The eight monotone per-process counters sampled on every scrape.
/// CPU time is kept split by mode since the exporter reports both.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Counts {
    pub cpu_user_seconds: f64,
    pub cpu_system_seconds: f64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub major_page_faults: u64,
    pub minor_page_faults: u64,
    pub ctx_switch_voluntary: u64,
    pub ctx_switch_nonvoluntary: u64,
}

impl Counts {
    /// Componentwise accumulation.
    pub fn add(&mut self, other: &Counts) {
        self.cpu_user_seconds += other.cpu_user_seconds;
        self.cpu_system_seconds += other.cpu_system_seconds;
        self.read_bytes += other.read_bytes;
        self.write_bytes += other.write_bytes;
        self.major_page_faults += other.major_page_faults;
        self.minor_page_faults += other.minor_page_faults;
        self.ctx_switch_voluntary += other.ctx_switch_voluntary;
        self.ctx_switch_nonvoluntary += other.ctx_switch_nonvoluntary;
    }

    /// Componentwise `self - prev`, clamping every component at zero so a
    /// counter reset never produces a negative delta.
    pub fn delta_since(&self, prev: &Counts) -> Counts {
        Counts {
            cpu_user_seconds: (self.cpu_user_seconds - prev.cpu_user_seconds).max(0.0),
            cpu_system_seconds: (self.cpu_system_seconds - prev.cpu_system_seconds).max(0.0),
            read_bytes: self.read_bytes.saturating_sub(prev.read_bytes),
            write_bytes: self.write_bytes.saturating_sub(prev.write_bytes),
            major_page_faults: self.major_page_faults.saturating_sub(prev.major_page_faults),
            minor_page_faults: self.minor_page_faults.saturating_sub(prev.minor_page_faults),
            ctx_switch_voluntary: self
                .ctx_switch_voluntary
                .saturating_sub(prev.ctx_switch_voluntary),
            ctx_switch_nonvoluntary: self
                .ctx_switch_nonvoluntary
                .saturating_sub(prev.ctx_switch_nonvoluntary),
        }
    }
}

/// Memory gauges in bytes. The proportional fields are only populated when
/// smaps gathering is enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Memory {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    pub swap_bytes: u64,
    pub proportional_resident_bytes: u64,
    pub proportional_swap_bytes: u64,
}

impl Memory {
    pub fn add(&mut self, other: &Memory) {
        self.resident_bytes += other.resident_bytes;
        self.virtual_bytes += other.virtual_bytes;
        self.swap_bytes += other.swap_bytes;
        self.proportional_resident_bytes += other.proportional_resident_bytes;
        self.proportional_swap_bytes += other.proportional_swap_bytes;
    }
}

/// File descriptor usage. `open` is -1 when the fd directory was unreadable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filedesc {
    pub open: i64,
    pub limit: u64,
}

impl Default for Filedesc {
    fn default() -> Self {
        Filedesc { open: -1, limit: 0 }
    }
}

/// Scheduler state buckets. A single process contributes exactly one count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct States {
    pub running: u64,
    pub sleeping: u64,
    pub waiting: u64,
    pub zombie: u64,
    pub other: u64,
}

impl States {
    /// Buckets the single-character state from `/proc/<pid>/stat`.
    pub fn from_char(state: char) -> States {
        let mut s = States::default();
        match state {
            'R' => s.running = 1,
            'S' => s.sleeping = 1,
            'D' | 'K' => s.waiting = 1,
            'Z' => s.zombie = 1,
            _ => s.other = 1,
        }
        s
    }

    pub fn add(&mut self, other: &States) {
        self.running += other.running;
        self.sleeping += other.sleeping;
        self.waiting += other.waiting;
        self.zombie += other.zombie;
        self.other += other.other;
    }
}

/// Everything sampled for a process on one scrape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metrics {
    pub counts: Counts,
    pub memory: Memory,
    pub filedesc: Filedesc,
    pub num_threads: u64,
    pub states: States,
    pub wchan: Option<String>,
}

/// One thread's sample, as produced by the Reader.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadSnapshot {
    pub key: ThreadKey,
    pub name: String,
    pub counts: Counts,
}

/// Read failures surfaced by the Reader.
///
/// `Gone` means the process exited mid-read and is silently skipped by the
/// tracker; `Proc` is any other per-process failure and counts against the
/// procread error counter; `Unreadable` is fatal at startup and marks a
/// failed scrape cycle afterwards.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("process vanished mid-read")]
    Gone,
    #[error("reading {path}: {source}")]
    Proc {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("procfs root {path} unusable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ReadError {
    /// Classifies an I/O failure on a per-process file. A vanished pid
    /// directory shows up as NotFound or ESRCH depending on the file.
    pub(crate) fn from_io(path: PathBuf, source: io::Error) -> ReadError {
        if source.kind() == io::ErrorKind::NotFound || source.raw_os_error() == Some(libc::ESRCH) {
            ReadError::Gone
        } else {
            ReadError::Proc { path, source }
        }
    }
}

/// Soft-error totals for one update cycle. `read` counts processes whose
/// metrics could not be read at all; `partial` counts processes for which
/// at least one optional field was unreadable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectErrors {
    pub read: u64,
    pub partial: u64,
}

/// The per-process report the tracker hands to the grouper: the clamped
/// counter deltas for this cycle plus the current gauges.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub group_name: String,
    pub latest: Counts,
    pub memory: Memory,
    pub filedesc: Filedesc,
    pub start_time: Option<DateTime<Utc>>,
    pub num_threads: u64,
    pub states: States,
    pub wchans: AHashMap<String, u64>,
    pub threads: Vec<ThreadUpdate>,
}

/// Per-thread counter deltas for this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadUpdate {
    pub name: String,
    pub latest: Counts,
}

/// The seam between the Reader and the tracker. Live handles read from
/// /proc on demand; tests drive the tracker with in-memory records.
pub trait ProcRecord {
    /// Fails `Gone` when the process exited before its identity was read.
    fn key(&mut self) -> Result<ProcessKey, ReadError>;

    /// Returns the static attributes plus the number of optional fields
    /// that could not be read (cgroups, effective uid).
    fn static_attrs(&mut self) -> Result<(Static, u32), ReadError>;

    /// Returns the sampled metrics plus the number of optional fields that
    /// could not be read (I/O counters, fd count, wchan, smaps).
    fn metrics(&mut self) -> Result<(Metrics, u32), ReadError>;

    /// Empty when thread tracking is disabled or the task directory was
    /// unreadable.
    fn threads(&mut self) -> Vec<ThreadSnapshot>;
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// How a fake record should fail, if at all.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Failure {
        None,
        MetricsGone,
        MetricsRead,
    }

    /// In-memory [`ProcRecord`] for tracker and grouper tests.
    #[derive(Debug, Clone)]
    pub struct FakeProc {
        pub key: ProcessKey,
        pub static_attrs: Static,
        pub static_soft_errors: u32,
        pub metrics: Metrics,
        pub soft_errors: u32,
        pub threads: Vec<ThreadSnapshot>,
        pub failure: Failure,
    }

    impl FakeProc {
        pub fn new(pid: u32, start_ticks: u64, comm: &str) -> FakeProc {
            FakeProc {
                key: ProcessKey { pid, start_ticks },
                static_attrs: Static {
                    comm: comm.to_string(),
                    start_time: chrono::DateTime::from_timestamp(start_ticks as i64, 0),
                    ..Static::default()
                },
                static_soft_errors: 0,
                metrics: Metrics::default(),
                soft_errors: 0,
                threads: Vec::new(),
                failure: Failure::None,
            }
        }

        pub fn with_parent(mut self, ppid: u32) -> FakeProc {
            self.static_attrs.parent_pid = ppid;
            self
        }

        pub fn with_counts(mut self, counts: Counts) -> FakeProc {
            self.metrics.counts = counts;
            self
        }

        pub fn with_metrics(mut self, metrics: Metrics) -> FakeProc {
            self.metrics = metrics;
            self
        }

        pub fn with_threads(mut self, threads: Vec<ThreadSnapshot>) -> FakeProc {
            self.metrics.num_threads = threads.len() as u64;
            self.threads = threads;
            self
        }

        pub fn with_soft_errors(mut self, soft: u32) -> FakeProc {
            self.soft_errors = soft;
            self
        }

        pub fn with_static_soft_errors(mut self, soft: u32) -> FakeProc {
            self.static_soft_errors = soft;
            self
        }

        pub fn failing(mut self, failure: Failure) -> FakeProc {
            self.failure = failure;
            self
        }
    }

    impl ProcRecord for FakeProc {
        fn key(&mut self) -> Result<ProcessKey, ReadError> {
            Ok(self.key)
        }

        fn static_attrs(&mut self) -> Result<(Static, u32), ReadError> {
            Ok((self.static_attrs.clone(), self.static_soft_errors))
        }

        fn metrics(&mut self) -> Result<(Metrics, u32), ReadError> {
            match self.failure {
                Failure::None => Ok((self.metrics.clone(), self.soft_errors)),
                Failure::MetricsGone => Err(ReadError::Gone),
                Failure::MetricsRead => Err(ReadError::Proc {
                    path: format!("/proc/{}/stat", self.key.pid).into(),
                    source: io::Error::from(io::ErrorKind::PermissionDenied),
                }),
            }
        }

        fn threads(&mut self) -> Vec<ThreadSnapshot> {
            self.threads.clone()
        }
    }

    /// Shorthand for a counts value used all over the tracker tests.
    pub fn counts(
        user: f64,
        system: f64,
        read: u64,
        write: u64,
        majflt: u64,
        minflt: u64,
        vol: u64,
        nonvol: u64,
    ) -> Counts {
        Counts {
            cpu_user_seconds: user,
            cpu_system_seconds: system,
            read_bytes: read,
            write_bytes: write,
            major_page_faults: majflt,
            minor_page_faults: minflt,
            ctx_switch_voluntary: vol,
            ctx_switch_nonvoluntary: nonvol,
        }
    }

    pub fn thread(tid: u32, name: &str, c: Counts) -> ThreadSnapshot {
        ThreadSnapshot {
            key: ThreadKey {
                tid,
                start_ticks: 0,
            },
            name: name.to_string(),
            counts: c,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_is_clamped_at_zero() {
        let prev = Counts {
            cpu_user_seconds: 2.0,
            read_bytes: 100,
            ..Counts::default()
        };
        let cur = Counts {
            cpu_user_seconds: 1.5,
            read_bytes: 40,
            write_bytes: 7,
            ..Counts::default()
        };
        let d = cur.delta_since(&prev);
        assert_eq!(d.cpu_user_seconds, 0.0);
        assert_eq!(d.read_bytes, 0);
        assert_eq!(d.write_bytes, 7);
    }

    #[test]
    fn state_buckets() {
        assert_eq!(States::from_char('R').running, 1);
        assert_eq!(States::from_char('S').sleeping, 1);
        assert_eq!(States::from_char('D').waiting, 1);
        assert_eq!(States::from_char('K').waiting, 1);
        assert_eq!(States::from_char('Z').zombie, 1);
        assert_eq!(States::from_char('I').other, 1);
        assert_eq!(States::from_char('T').other, 1);
    }
}
