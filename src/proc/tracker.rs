//! The keyed registry of tracked processes.
//!
//! Rather than allocating a new map each cycle to detect processes that
//! have disappeared, observed entries get their last-update tick bumped and
//! a final sweep retires everything that was not seen. A process is
//! identified by `(pid, start ticks)`, so a recycled pid never merges two
//! lives; a stale entry holding the pid is deleted as soon as the new life
//! is observed.

use std::time::Duration;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{
    CollectErrors, Counts, Metrics, ProcRecord, ProcessKey, ReadError, Static, ThreadKey,
    ThreadSnapshot, ThreadUpdate, Update,
};
use crate::selector::{ProcAttributes, Selector};

/// State kept per tracked process between scrapes.
#[derive(Debug)]
struct TrackedProc {
    static_attrs: Static,
    group_name: String,
    /// Metrics most recently obtained for this process.
    last_metrics: Metrics,
    /// Clamped counter delta computed in the current cycle.
    last_delta: Counts,
    last_tick: u64,
    threads: AHashMap<ThreadKey, TrackedThread>,
}

#[derive(Debug)]
struct TrackedThread {
    name: String,
    last_counts: Counts,
}

/// Decision for a not-yet-classified process during the parent walk.
#[derive(Debug, Clone)]
enum Verdict {
    Undecided,
    Track(String),
    Ignore,
}

/// A new process whose classification is deferred to the parent-chain pass.
struct Undecided {
    key: ProcessKey,
    static_attrs: Static,
    metrics: Metrics,
    threads: Vec<ThreadSnapshot>,
}

pub struct Tracker {
    selector: Selector,
    tracked: AHashMap<ProcessKey, TrackedProc>,
    /// Tombstones: processes already decided against. The value is the last
    /// tick the key was observed, used by the same retirement sweep.
    ignored: AHashMap<ProcessKey, u64>,
    /// Which start ticks currently own each pid, for stale-entry eviction
    /// and the parent walk.
    pid_index: AHashMap<u32, u64>,
    track_children: bool,
    track_threads: bool,
    recheck: bool,
    recheck_time_limit: Duration,
    tick: u64,
}

impl Tracker {
    pub fn new(
        selector: Selector,
        track_children: bool,
        track_threads: bool,
        recheck: bool,
        recheck_time_limit: Duration,
    ) -> Tracker {
        Tracker {
            selector,
            tracked: AHashMap::new(),
            ignored: AHashMap::new(),
            pid_index: AHashMap::new(),
            track_children,
            track_threads,
            recheck,
            recheck_time_limit,
            tick: 0,
        }
    }

    /// Runs one observation cycle over a snapshot and returns the soft-error
    /// totals plus one [`Update`] per tracked process that was readable.
    pub fn update<P: ProcRecord>(
        &mut self,
        procs: impl IntoIterator<Item = P>,
    ) -> (CollectErrors, Vec<Update>) {
        self.tick += 1;
        let now = self.tick;
        let wall_now = Utc::now();
        let mut errs = CollectErrors::default();
        let mut updates = Vec::new();
        let mut undecided = Vec::new();

        for mut record in procs {
            let key = match record.key() {
                Ok(key) => key,
                Err(ReadError::Gone) => continue,
                Err(e) => {
                    debug!("unreadable process identity: {e}");
                    errs.read += 1;
                    continue;
                }
            };

            match self.pid_index.get(&key.pid) {
                Some(&start) if start != key.start_ticks => {
                    // The pid was recycled; the stale life will not be seen
                    // again this cycle.
                    let stale = ProcessKey {
                        pid: key.pid,
                        start_ticks: start,
                    };
                    self.tracked.remove(&stale);
                    self.ignored.remove(&stale);
                    self.pid_index.insert(key.pid, key.start_ticks);
                }
                None => {
                    self.pid_index.insert(key.pid, key.start_ticks);
                }
                _ => {}
            }

            if self.ignored.contains_key(&key) {
                self.revisit_ignored(key, &mut record, now, wall_now, &mut errs, &mut updates);
            } else if self.tracked.contains_key(&key) {
                self.observe_tracked(key, &mut record, now, wall_now, &mut errs, &mut updates);
            } else {
                self.observe_new(key, &mut record, now, &mut errs, &mut updates, &mut undecided);
            }
        }

        if !undecided.is_empty() {
            self.adopt_children(undecided, now, &mut updates);
        }

        self.expire(now);
        (errs, updates)
    }

    fn observe_new<P: ProcRecord>(
        &mut self,
        key: ProcessKey,
        record: &mut P,
        now: u64,
        errs: &mut CollectErrors,
        updates: &mut Vec<Update>,
        undecided: &mut Vec<Undecided>,
    ) {
        let (static_attrs, static_soft) = match record.static_attrs() {
            Ok(s) => s,
            Err(ReadError::Gone) => return,
            Err(e) => {
                debug!(pid = key.pid, "unreadable static attributes: {e}");
                errs.read += 1;
                return;
            }
        };
        let (metrics, soft) = match record.metrics() {
            Ok(m) => m,
            Err(ReadError::Gone) => return,
            Err(e) => {
                debug!(pid = key.pid, "unreadable metrics: {e}");
                errs.read += 1;
                return;
            }
        };
        if soft + static_soft > 0 {
            errs.partial += 1;
        }
        let threads = if self.track_threads {
            record.threads()
        } else {
            Vec::new()
        };

        let mut attrs = attributes(&key, &static_attrs);
        match self.selector.match_and_name(&mut attrs) {
            Some(group_name) => {
                let update = self.track(key, group_name, static_attrs, metrics, threads, now);
                updates.push(update);
            }
            None if self.track_children => undecided.push(Undecided {
                key,
                static_attrs,
                metrics,
                threads,
            }),
            None => {
                self.ignored.insert(key, now);
            }
        }
    }

    fn observe_tracked<P: ProcRecord>(
        &mut self,
        key: ProcessKey,
        record: &mut P,
        now: u64,
        wall_now: DateTime<Utc>,
        errs: &mut CollectErrors,
        updates: &mut Vec<Update>,
    ) {
        let mut static_soft = 0u32;
        if self.recheck {
            // Static attributes are re-read because the command line of a
            // live process can change after exec.
            match record.static_attrs() {
                Ok((static_attrs, soft)) => {
                    static_soft = soft;
                    if self.within_recheck_window(wall_now, static_attrs.start_time) {
                        let mut attrs = attributes(&key, &static_attrs);
                        match self.selector.match_and_name(&mut attrs) {
                            None => {
                                debug!(pid = key.pid, "recheck untracked process");
                                self.tracked.remove(&key);
                                self.ignored.insert(key, now);
                                return;
                            }
                            Some(group_name) => {
                                let Some(entry) = self.tracked.get_mut(&key) else {
                                    return;
                                };
                                if entry.group_name != group_name {
                                    debug!(
                                        pid = key.pid,
                                        from = %entry.group_name,
                                        to = %group_name,
                                        "recheck renamed process group"
                                    );
                                    entry.group_name = group_name;
                                }
                                entry.static_attrs = static_attrs;
                            }
                        }
                    }
                }
                Err(ReadError::Gone) => return,
                Err(e) => {
                    debug!(pid = key.pid, "recheck failed to read static: {e}");
                }
            }
        }

        match record.metrics() {
            // The entry is left unrefreshed so the sweep retires it.
            Err(ReadError::Gone) => {}
            Err(e) => {
                debug!(pid = key.pid, "unreadable metrics: {e}");
                errs.read += 1;
                // Keep the entry alive and retry next scrape.
                if let Some(entry) = self.tracked.get_mut(&key) {
                    entry.last_tick = now;
                }
            }
            Ok((metrics, soft)) => {
                if soft + static_soft > 0 {
                    errs.partial += 1;
                }
                let thread_snaps = if self.track_threads {
                    record.threads()
                } else {
                    Vec::new()
                };
                let Some(entry) = self.tracked.get_mut(&key) else {
                    return;
                };
                entry.last_delta = metrics.counts.delta_since(&entry.last_metrics.counts);
                entry.last_metrics = metrics;
                entry.last_tick = now;
                let thread_updates = advance_threads(&mut entry.threads, thread_snaps);
                updates.push(build_update(entry, thread_updates));
            }
        }
    }

    fn revisit_ignored<P: ProcRecord>(
        &mut self,
        key: ProcessKey,
        record: &mut P,
        now: u64,
        wall_now: DateTime<Utc>,
        errs: &mut CollectErrors,
        updates: &mut Vec<Update>,
    ) {
        if !self.recheck {
            self.ignored.insert(key, now);
            return;
        }
        let (static_attrs, static_soft) = match record.static_attrs() {
            Ok(s) => s,
            Err(ReadError::Gone) => return,
            Err(e) => {
                debug!(pid = key.pid, "recheck failed to read static: {e}");
                errs.read += 1;
                self.ignored.insert(key, now);
                return;
            }
        };
        if !self.within_recheck_window(wall_now, static_attrs.start_time) {
            self.ignored.insert(key, now);
            return;
        }
        let mut attrs = attributes(&key, &static_attrs);
        let Some(group_name) = self.selector.match_and_name(&mut attrs) else {
            self.ignored.insert(key, now);
            return;
        };
        match record.metrics() {
            Ok((metrics, soft)) => {
                if soft + static_soft > 0 {
                    errs.partial += 1;
                }
                let threads = if self.track_threads {
                    record.threads()
                } else {
                    Vec::new()
                };
                self.ignored.remove(&key);
                let update = self.track(key, group_name, static_attrs, metrics, threads, now);
                updates.push(update);
            }
            Err(ReadError::Gone) => {}
            Err(e) => {
                debug!(pid = key.pid, "unreadable metrics: {e}");
                errs.read += 1;
                self.ignored.insert(key, now);
            }
        }
    }

    fn within_recheck_window(
        &self,
        wall_now: DateTime<Utc>,
        start_time: Option<DateTime<Utc>>,
    ) -> bool {
        if self.recheck_time_limit.is_zero() {
            return true;
        }
        let Ok(limit) = chrono::Duration::from_std(self.recheck_time_limit) else {
            return true;
        };
        match start_time {
            Some(start) => wall_now.signed_duration_since(start) <= limit,
            None => true,
        }
    }

    /// Creates a tracked entry. The first observation contributes zero to
    /// every counter delta; the current metrics become the baseline.
    fn track(
        &mut self,
        key: ProcessKey,
        group_name: String,
        static_attrs: Static,
        metrics: Metrics,
        thread_snaps: Vec<ThreadSnapshot>,
        now: u64,
    ) -> Update {
        let (threads, thread_updates) = prime_threads(thread_snaps);
        let entry = TrackedProc {
            static_attrs,
            group_name,
            last_metrics: metrics,
            last_delta: Counts::default(),
            last_tick: now,
            threads,
        };
        let update = build_update(&entry, thread_updates);
        self.tracked.insert(key, entry);
        update
    }

    /// Second pass: walk every undecided process up the parent chain. The
    /// walk is iterative with a hop bound so a malformed parent pid can
    /// never hang the cycle.
    fn adopt_children(&mut self, undecided: Vec<Undecided>, now: u64, updates: &mut Vec<Update>) {
        let index_by_key: AHashMap<ProcessKey, usize> = undecided
            .iter()
            .enumerate()
            .map(|(i, u)| (u.key, i))
            .collect();
        let mut verdicts = vec![Verdict::Undecided; undecided.len()];
        let hop_bound = self.pid_index.len().max(undecided.len()) + 1;

        for start in 0..undecided.len() {
            if !matches!(verdicts[start], Verdict::Undecided) {
                continue;
            }
            let mut path = vec![start];
            let mut parent_pid = undecided[start].static_attrs.parent_pid;
            let mut verdict = Verdict::Ignore;
            let mut hops = 0usize;
            loop {
                hops += 1;
                if hops > hop_bound || parent_pid == 0 {
                    break;
                }
                let Some(&parent_start) = self.pid_index.get(&parent_pid) else {
                    // Parent died before we ever saw it.
                    break;
                };
                let parent_key = ProcessKey {
                    pid: parent_pid,
                    start_ticks: parent_start,
                };
                if let Some(parent) = self.tracked.get(&parent_key) {
                    verdict = Verdict::Track(parent.group_name.clone());
                    break;
                }
                if self.ignored.contains_key(&parent_key) {
                    break;
                }
                match index_by_key.get(&parent_key) {
                    Some(&j) => match &verdicts[j] {
                        Verdict::Track(name) => {
                            verdict = Verdict::Track(name.clone());
                            break;
                        }
                        Verdict::Ignore => break,
                        Verdict::Undecided => {
                            path.push(j);
                            parent_pid = undecided[j].static_attrs.parent_pid;
                        }
                    },
                    None => break,
                }
            }
            // A tracked ancestor implies the entire lineage is tracked.
            for &j in &path {
                verdicts[j] = verdict.clone();
            }
        }

        for (i, u) in undecided.into_iter().enumerate() {
            match std::mem::replace(&mut verdicts[i], Verdict::Ignore) {
                Verdict::Track(group_name) => {
                    let update =
                        self.track(u.key, group_name, u.static_attrs, u.metrics, u.threads, now);
                    updates.push(update);
                }
                Verdict::Ignore | Verdict::Undecided => {
                    self.ignored.insert(u.key, now);
                }
            }
        }
    }

    /// Retires every entry and tombstone that was not observed this cycle.
    fn expire(&mut self, now: u64) {
        let mut removed: Vec<ProcessKey> = Vec::new();
        self.tracked.retain(|key, entry| {
            if entry.last_tick == now {
                true
            } else {
                removed.push(*key);
                false
            }
        });
        self.ignored.retain(|key, tick| {
            if *tick == now {
                true
            } else {
                removed.push(*key);
                false
            }
        });
        for key in removed {
            if self.pid_index.get(&key.pid) == Some(&key.start_ticks) {
                self.pid_index.remove(&key.pid);
            }
        }
    }
}

fn attributes(key: &ProcessKey, static_attrs: &Static) -> ProcAttributes {
    ProcAttributes {
        pid: key.pid,
        comm: static_attrs.comm.clone(),
        cmdline: static_attrs.cmdline.clone(),
        username: None,
        effective_uid: static_attrs.effective_uid,
        start_time: static_attrs.start_time,
    }
}

fn build_update(entry: &TrackedProc, threads: Vec<ThreadUpdate>) -> Update {
    let mut wchans = AHashMap::new();
    if let Some(symbol) = &entry.last_metrics.wchan {
        wchans.insert(symbol.clone(), 1);
    }
    Update {
        group_name: entry.group_name.clone(),
        latest: entry.last_delta,
        memory: entry.last_metrics.memory,
        filedesc: entry.last_metrics.filedesc,
        start_time: entry.static_attrs.start_time,
        num_threads: entry.last_metrics.num_threads,
        states: entry.last_metrics.states,
        wchans,
        threads,
    }
}

fn prime_threads(
    snaps: Vec<ThreadSnapshot>,
) -> (AHashMap<ThreadKey, TrackedThread>, Vec<ThreadUpdate>) {
    let mut threads = AHashMap::with_capacity(snaps.len());
    let mut updates = Vec::with_capacity(snaps.len());
    for snap in snaps {
        updates.push(ThreadUpdate {
            name: snap.name.clone(),
            latest: Counts::default(),
        });
        threads.insert(
            snap.key,
            TrackedThread {
                name: snap.name,
                last_counts: snap.counts,
            },
        );
    }
    (threads, updates)
}

/// Recomputes thread sub-entries from this cycle's snapshots. Threads not
/// re-observed are dropped; new thread keys start from a zero delta.
fn advance_threads(
    threads: &mut AHashMap<ThreadKey, TrackedThread>,
    snaps: Vec<ThreadSnapshot>,
) -> Vec<ThreadUpdate> {
    let mut next = AHashMap::with_capacity(snaps.len());
    let mut updates = Vec::with_capacity(snaps.len());
    for snap in snaps {
        let delta = match threads.get(&snap.key) {
            Some(prev) => snap.counts.delta_since(&prev.last_counts),
            None => Counts::default(),
        };
        updates.push(ThreadUpdate {
            name: snap.name.clone(),
            latest: delta,
        });
        next.insert(
            snap.key,
            TrackedThread {
                name: snap.name,
                last_counts: snap.counts,
            },
        );
    }
    *threads = next;
    updates
}
