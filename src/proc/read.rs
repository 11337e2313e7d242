//! Snapshotting of live processes from the /proc pseudo-filesystem.
//!
//! [`Reader::snapshot`] lists the pid directories eagerly and then yields
//! lazy [`LiveProc`] handles; each handle parses the per-pid files on
//! demand. Individual field failures are tolerated: the handle substitutes
//! a sentinel value and counts a soft error instead of failing the whole
//! process.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use tracing::debug;

use super::{
    Counts, Filedesc, Memory, Metrics, ProcRecord, ProcessKey, ReadError, States, Static,
    ThreadKey, ThreadSnapshot,
};

/// Kernel clock ticks per second, used to convert jiffies to seconds.
fn clock_ticks_per_second() -> f64 {
    // SAFETY: sysconf is safe to call with _SC_CLK_TCK; -1/0 mean the value
    // is unavailable and are handled by the > 0 check.
    unsafe {
        let tck = libc::sysconf(libc::_SC_CLK_TCK);
        if tck > 0 {
            return tck as f64;
        }
    }
    // USER_HZ default
    100.0
}

pub static CLK_TCK: Lazy<f64> = Lazy::new(clock_ticks_per_second);

fn page_size_bytes() -> u64 {
    // SAFETY: sysconf is safe to call with _SC_PAGESIZE.
    unsafe {
        let sz = libc::sysconf(libc::_SC_PAGESIZE);
        if sz > 0 {
            return sz as u64;
        }
    }
    4096
}

pub static PAGE_SIZE: Lazy<u64> = Lazy::new(page_size_bytes);

/// Reads process snapshots from a procfs mount.
#[derive(Debug)]
pub struct Reader {
    root: PathBuf,
    boot_time_secs: i64,
    gather_smaps: bool,
    track_threads: bool,
}

impl Reader {
    /// Validates the procfs root and reads the boot time needed to convert
    /// start ticks to wall clock. Failure here is fatal to startup.
    pub fn open(
        root: impl Into<PathBuf>,
        gather_smaps: bool,
        track_threads: bool,
    ) -> Result<Reader, ReadError> {
        let root = root.into();
        let stat = root.join("stat");
        let content = fs::read_to_string(&stat).map_err(|source| ReadError::Unreadable {
            path: root.clone(),
            source,
        })?;
        let boot_time_secs = parse_boot_time(&content).ok_or_else(|| ReadError::Unreadable {
            path: root.clone(),
            source: io::Error::other("no btime line in stat"),
        })?;
        Ok(Reader {
            root,
            boot_time_secs,
            gather_smaps,
            track_threads,
        })
    }

    /// Produces one handle per live pid at call time. The directory scan is
    /// eager so a pid recycled during iteration cannot appear twice.
    pub fn snapshot(&self) -> Result<Snapshot<'_>, ReadError> {
        let entries = fs::read_dir(&self.root).map_err(|source| ReadError::Unreadable {
            path: self.root.clone(),
            source,
        })?;
        let mut pids = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            if let Ok(pid) = name.parse::<u32>() {
                pids.push(pid);
            }
        }
        Ok(Snapshot {
            reader: self,
            pids: pids.into_iter(),
        })
    }

    /// Converts a start time in ticks-since-boot to wall clock (UTC).
    fn start_clock(&self, start_ticks: u64) -> Option<DateTime<Utc>> {
        let boot = DateTime::from_timestamp(self.boot_time_secs, 0)?;
        let offset_ms = (start_ticks as f64 / *CLK_TCK * 1000.0) as i64;
        Some(boot + Duration::milliseconds(offset_ms))
    }
}

/// Single-pass iterator over the processes alive when the snapshot was
/// taken.
pub struct Snapshot<'a> {
    reader: &'a Reader,
    pids: std::vec::IntoIter<u32>,
}

impl<'a> Iterator for Snapshot<'a> {
    type Item = LiveProc<'a>;

    fn next(&mut self) -> Option<LiveProc<'a>> {
        let pid = self.pids.next()?;
        Some(LiveProc {
            reader: self.reader,
            pid,
            path: self.reader.root.join(pid.to_string()),
            stat: None,
        })
    }
}

/// Lazy handle on one live process. The stat file is read at most once and
/// shared between the identity, static and metric accessors.
pub struct LiveProc<'a> {
    reader: &'a Reader,
    pid: u32,
    path: PathBuf,
    stat: Option<PidStat>,
}

impl LiveProc<'_> {
    fn stat(&mut self) -> Result<&PidStat, ReadError> {
        if self.stat.is_none() {
            let path = self.path.join("stat");
            let content =
                fs::read_to_string(&path).map_err(|e| ReadError::from_io(path.clone(), e))?;
            let stat = parse_pid_stat(&content).ok_or_else(|| ReadError::Proc {
                path,
                source: io::Error::other("malformed stat line"),
            })?;
            self.stat = Some(stat);
        }
        self.stat.as_ref().ok_or(ReadError::Gone)
    }

    fn read_cmdline(&self) -> Result<Vec<String>, ReadError> {
        let path = self.path.join("cmdline");
        let raw = fs::read(&path).map_err(|e| ReadError::from_io(path, e))?;
        Ok(split_cmdline(&raw))
    }

    fn read_cgroups(&self) -> Option<Vec<String>> {
        let content = fs::read_to_string(self.path.join("cgroup")).ok()?;
        Some(parse_cgroups(&content))
    }

    fn read_status(&self) -> Result<StatusFields, ReadError> {
        let path = self.path.join("status");
        let content = fs::read_to_string(&path).map_err(|e| ReadError::from_io(path, e))?;
        Ok(parse_status(&content))
    }

    fn count_fds(&self) -> Option<i64> {
        let dir = fs::read_dir(self.path.join("fd")).ok()?;
        Some(dir.count() as i64)
    }

    fn read_fd_limit(&self) -> Option<u64> {
        let content = fs::read_to_string(self.path.join("limits")).ok()?;
        parse_fd_limit(&content)
    }

    fn read_io(&self) -> Option<(u64, u64)> {
        let content = fs::read_to_string(self.path.join("io")).ok()?;
        parse_io(&content)
    }

    fn read_wchan(&self) -> Option<String> {
        let content = fs::read_to_string(self.path.join("wchan")).ok()?;
        let symbol = content.trim();
        if symbol.is_empty() || symbol == "0" {
            // Not blocked in the kernel; nothing to report.
            Some(String::new())
        } else {
            Some(symbol.to_string())
        }
    }

    fn read_smaps_rollup(&self) -> Option<(u64, u64)> {
        let content = fs::read_to_string(self.path.join("smaps_rollup")).ok()?;
        Some(parse_smaps_rollup(&content))
    }

    fn read_thread(&self, tid: u32) -> Option<ThreadSnapshot> {
        let task = self.path.join("task").join(tid.to_string());
        let stat_content = fs::read_to_string(task.join("stat")).ok()?;
        let stat = parse_pid_stat(&stat_content)?;

        let mut counts = stat.counts();
        if let Ok(content) = fs::read_to_string(task.join("status")) {
            let status = parse_status(&content);
            counts.ctx_switch_voluntary = status.ctx_switch_voluntary;
            counts.ctx_switch_nonvoluntary = status.ctx_switch_nonvoluntary;
        }
        if let Some((read_bytes, write_bytes)) =
            fs::read_to_string(task.join("io")).ok().and_then(|c| parse_io(&c))
        {
            counts.read_bytes = read_bytes;
            counts.write_bytes = write_bytes;
        }

        Some(ThreadSnapshot {
            key: ThreadKey {
                tid,
                start_ticks: stat.starttime,
            },
            name: stat.comm,
            counts,
        })
    }
}

impl ProcRecord for LiveProc<'_> {
    fn key(&mut self) -> Result<ProcessKey, ReadError> {
        let pid = self.pid;
        let stat = self.stat()?;
        Ok(ProcessKey {
            pid,
            start_ticks: stat.starttime,
        })
    }

    fn static_attrs(&mut self) -> Result<(Static, u32), ReadError> {
        let mut soft_errors = 0u32;
        let cmdline = self.read_cmdline()?;
        let cgroups = match self.read_cgroups() {
            Some(cgroups) => cgroups,
            None => {
                soft_errors += 1;
                Vec::new()
            }
        };
        let effective_uid = match self.read_status() {
            Ok(status) => status.effective_uid,
            Err(ReadError::Gone) => return Err(ReadError::Gone),
            Err(_) => {
                soft_errors += 1;
                None
            }
        };
        let reader = self.reader;
        let stat = self.stat()?;
        Ok((
            Static {
                comm: stat.comm.clone(),
                cmdline,
                cgroups,
                parent_pid: stat.ppid,
                start_time: reader.start_clock(stat.starttime),
                effective_uid,
            },
            soft_errors,
        ))
    }

    fn metrics(&mut self) -> Result<(Metrics, u32), ReadError> {
        let gather_smaps = self.reader.gather_smaps;
        let status = self.read_status()?;
        let (mut counts, rss_bytes, vsize, num_threads, state) = {
            let stat = self.stat()?;
            (
                stat.counts(),
                stat.rss_bytes,
                stat.vsize,
                stat.num_threads,
                stat.state,
            )
        };

        let mut soft_errors = 0u32;
        counts.ctx_switch_voluntary = status.ctx_switch_voluntary;
        counts.ctx_switch_nonvoluntary = status.ctx_switch_nonvoluntary;

        let mut memory = Memory {
            resident_bytes: rss_bytes,
            virtual_bytes: vsize,
            swap_bytes: status.vm_swap_bytes,
            ..Memory::default()
        };

        match self.read_io() {
            Some((read_bytes, write_bytes)) => {
                counts.read_bytes = read_bytes;
                counts.write_bytes = write_bytes;
            }
            // Typically EACCES for processes owned by another user.
            None => soft_errors += 1,
        }

        let open = match self.count_fds() {
            Some(open) => open,
            None => {
                soft_errors += 1;
                -1
            }
        };
        let limit = match self.read_fd_limit() {
            Some(limit) => limit,
            None => {
                soft_errors += 1;
                0
            }
        };

        if gather_smaps {
            match self.read_smaps_rollup() {
                Some((pss, swap_pss)) => {
                    memory.proportional_resident_bytes = pss;
                    memory.proportional_swap_bytes = swap_pss;
                }
                None => soft_errors += 1,
            }
        }

        let wchan = match self.read_wchan() {
            Some(symbol) if symbol.is_empty() => None,
            Some(symbol) => Some(symbol),
            None => {
                soft_errors += 1;
                None
            }
        };

        let metrics = Metrics {
            counts,
            memory,
            filedesc: Filedesc { open, limit },
            num_threads,
            states: States::from_char(state),
            wchan,
        };
        Ok((metrics, soft_errors))
    }

    fn threads(&mut self) -> Vec<ThreadSnapshot> {
        if !self.reader.track_threads {
            return Vec::new();
        }
        let task_dir = match fs::read_dir(self.path.join("task")) {
            Ok(dir) => dir,
            Err(e) => {
                debug!(pid = self.pid, "task directory unreadable: {e}");
                return Vec::new();
            }
        };
        let mut threads = Vec::new();
        for entry in task_dir.flatten() {
            let name = entry.file_name();
            let Some(tid) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            if let Some(thread) = self.read_thread(tid) {
                threads.push(thread);
            }
        }
        threads
    }
}

/// The fields of `/proc/<pid>/stat` the exporter consumes.
#[derive(Debug, Clone)]
struct PidStat {
    comm: String,
    state: char,
    ppid: u32,
    minflt: u64,
    majflt: u64,
    utime: u64,
    stime: u64,
    num_threads: u64,
    starttime: u64,
    vsize: u64,
    rss_bytes: u64,
}

impl PidStat {
    fn counts(&self) -> Counts {
        Counts {
            cpu_user_seconds: self.utime as f64 / *CLK_TCK,
            cpu_system_seconds: self.stime as f64 / *CLK_TCK,
            major_page_faults: self.majflt,
            minor_page_faults: self.minflt,
            ..Counts::default()
        }
    }
}

/// The comm field may contain spaces and parentheses, so the line is split
/// around the last closing paren rather than purely on whitespace.
fn parse_pid_stat(content: &str) -> Option<PidStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let comm = content.get(open + 1..close)?.to_string();
    let rest: Vec<&str> = content.get(close + 1..)?.split_whitespace().collect();
    if rest.len() < 22 {
        return None;
    }
    Some(PidStat {
        comm,
        state: rest[0].chars().next()?,
        ppid: rest[1].parse().ok()?,
        minflt: rest[7].parse().unwrap_or(0),
        majflt: rest[9].parse().unwrap_or(0),
        utime: rest[11].parse().unwrap_or(0),
        stime: rest[12].parse().unwrap_or(0),
        num_threads: rest[17].parse().unwrap_or(0),
        starttime: rest[19].parse().ok()?,
        vsize: rest[20].parse().unwrap_or(0),
        rss_bytes: rest[21].parse::<i64>().unwrap_or(0).max(0) as u64 * *PAGE_SIZE,
    })
}

#[derive(Debug, Default)]
struct StatusFields {
    vm_swap_bytes: u64,
    effective_uid: Option<u32>,
    ctx_switch_voluntary: u64,
    ctx_switch_nonvoluntary: u64,
}

fn parse_status(content: &str) -> StatusFields {
    let mut fields = StatusFields::default();
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("VmSwap:") {
            fields.vm_swap_bytes = parse_kb_field(rest);
        } else if let Some(rest) = line.strip_prefix("Uid:") {
            // real, effective, saved, filesystem
            fields.effective_uid = rest.split_whitespace().nth(1).and_then(|v| v.parse().ok());
        } else if let Some(rest) = line.strip_prefix("voluntary_ctxt_switches:") {
            fields.ctx_switch_voluntary = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("nonvoluntary_ctxt_switches:") {
            fields.ctx_switch_nonvoluntary = rest.trim().parse().unwrap_or(0);
        }
    }
    fields
}

fn parse_kb_field(rest: &str) -> u64 {
    rest.split_whitespace()
        .next()
        .and_then(|v| v.parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

fn parse_io(content: &str) -> Option<(u64, u64)> {
    let mut read_bytes = None;
    let mut write_bytes = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("read_bytes:") {
            read_bytes = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("write_bytes:") {
            write_bytes = rest.trim().parse().ok();
        }
    }
    Some((read_bytes?, write_bytes?))
}

fn parse_fd_limit(content: &str) -> Option<u64> {
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("Max open files") {
            let soft = rest.split_whitespace().next()?;
            if soft == "unlimited" {
                return Some(u64::MAX);
            }
            return soft.parse().ok();
        }
    }
    None
}

fn parse_smaps_rollup(content: &str) -> (u64, u64) {
    let mut pss = 0;
    let mut swap_pss = 0;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("Pss:") {
            pss = parse_kb_field(rest);
        } else if let Some(rest) = line.strip_prefix("SwapPss:") {
            swap_pss = parse_kb_field(rest);
        }
    }
    (pss, swap_pss)
}

fn parse_boot_time(content: &str) -> Option<i64> {
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            return rest.trim().parse().ok();
        }
    }
    None
}

fn split_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|&b| b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}

fn parse_cgroups(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| line.splitn(3, ':').nth(2))
        .map(|path| path.to_string())
        .collect()
}
