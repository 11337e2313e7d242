//! Aggregation of per-process updates into named groups.
//!
//! All tracked processes sharing a group name are summed, and the counter
//! totals are merged with an accumulated history per group so the values
//! reported never decrease. Even once the last process of a group exits the
//! group keeps reporting its accumulated counters, with every non-counter
//! metric at zero, unless empty-group removal is enabled.

use std::time::Duration;

use ahash::AHashMap;
use chrono::{DateTime, Utc};

use super::tracker::Tracker;
use super::{CollectErrors, Counts, Memory, ProcRecord, States, ThreadUpdate, Update};
use crate::selector::Selector;

/// Aggregated metrics of one group for one scrape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Group {
    pub counts: Counts,
    pub states: States,
    pub procs: u64,
    pub memory: Memory,
    pub oldest_start_time: Option<DateTime<Utc>>,
    pub open_fds: u64,
    pub worst_fd_ratio: f64,
    pub num_threads: u64,
    pub wchans: AHashMap<String, u64>,
    pub threads: Vec<ThreadTotals>,
}

/// Counter totals of the threads in a group sharing a thread name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadTotals {
    pub name: String,
    pub num_threads: u64,
    pub counts: Counts,
}

pub type GroupsByName = AHashMap<String, Group>;

pub struct Grouper {
    tracker: Tracker,
    /// Accumulated counter history per group, the floor under every value
    /// the grouper reports.
    group_accum: AHashMap<String, Counts>,
    thread_accum: AHashMap<String, AHashMap<String, ThreadTotals>>,
    remove_empty_groups: bool,
}

impl Grouper {
    pub fn new(
        selector: Selector,
        track_children: bool,
        track_threads: bool,
        recheck: bool,
        recheck_time_limit: Duration,
        remove_empty_groups: bool,
    ) -> Grouper {
        Grouper {
            tracker: Tracker::new(
                selector,
                track_children,
                track_threads,
                recheck,
                recheck_time_limit,
            ),
            group_accum: AHashMap::new(),
            thread_accum: AHashMap::new(),
            remove_empty_groups,
        }
    }

    /// Runs one tracker cycle over the snapshot and folds the resulting
    /// updates into per-group totals.
    pub fn update<P: ProcRecord>(
        &mut self,
        procs: impl IntoIterator<Item = P>,
    ) -> (CollectErrors, GroupsByName) {
        let (errs, updates) = self.tracker.update(procs);
        (errs, self.groups(updates))
    }

    fn groups(&mut self, updates: Vec<Update>) -> GroupsByName {
        let mut groups = GroupsByName::new();
        let mut threads_by_group: AHashMap<String, Vec<ThreadUpdate>> = AHashMap::new();

        for update in updates {
            let group = groups.entry(update.group_name.clone()).or_default();
            group_add(group, &update);
            if !update.threads.is_empty() {
                threads_by_group
                    .entry(update.group_name)
                    .or_default()
                    .extend(update.threads);
            }
        }

        // Raise each group's totals onto its history floor and store the
        // new floor.
        for (name, group) in groups.iter_mut() {
            if let Some(floor) = self.group_accum.get(name) {
                group.counts.add(floor);
            }
            self.group_accum.insert(name.clone(), group.counts);
            group.threads =
                self.thread_totals(name, threads_by_group.remove(name).unwrap_or_default());
        }

        if self.remove_empty_groups {
            // Forget groups with no live processes; a reappearing group
            // starts over from zero.
            self.group_accum.retain(|name, _| groups.contains_key(name));
            self.thread_accum.retain(|name, _| groups.contains_key(name));
        } else {
            for (name, floor) in &self.group_accum {
                if !groups.contains_key(name) {
                    groups.insert(
                        name.clone(),
                        Group {
                            counts: *floor,
                            ..Group::default()
                        },
                    );
                }
            }
        }

        groups
    }

    /// Aggregates thread updates by thread name and merges them with the
    /// group's per-name history. A cycle with no observed threads drops the
    /// group's thread history entirely.
    fn thread_totals(&mut self, group: &str, tracked: Vec<ThreadUpdate>) -> Vec<ThreadTotals> {
        if tracked.is_empty() {
            self.thread_accum.remove(group);
            return Vec::new();
        }

        let mut by_name: AHashMap<String, ThreadTotals> = AHashMap::new();
        for thread in tracked {
            let totals = by_name.entry(thread.name.clone()).or_default();
            totals.name = thread.name;
            totals.num_threads += 1;
            totals.counts.add(&thread.latest);
        }

        if let Some(history) = self.thread_accum.get(group) {
            for totals in by_name.values_mut() {
                if let Some(old) = history.get(&totals.name) {
                    totals.counts.add(&old.counts);
                }
            }
        }
        self.thread_accum.insert(group.to_string(), by_name.clone());

        let mut totals: Vec<ThreadTotals> = by_name.into_values().collect();
        totals.sort_by(|a, b| a.name.cmp(&b.name));
        totals
    }
}

fn group_add(group: &mut Group, update: &Update) {
    group.procs += 1;
    group.memory.add(&update.memory);
    if update.filedesc.open >= 0 {
        group.open_fds += update.filedesc.open as u64;
    }
    if update.filedesc.limit > 0 && update.filedesc.open >= 0 {
        let ratio = update.filedesc.open as f64 / update.filedesc.limit as f64;
        if ratio > group.worst_fd_ratio {
            group.worst_fd_ratio = ratio;
        }
    }
    group.num_threads += update.num_threads;
    group.counts.add(&update.latest);
    group.states.add(&update.states);
    match (group.oldest_start_time, update.start_time) {
        (None, Some(start)) => group.oldest_start_time = Some(start),
        (Some(oldest), Some(start)) if start < oldest => group.oldest_start_time = Some(start),
        _ => {}
    }
    for (symbol, count) in &update.wchans {
        *group.wchans.entry(symbol.clone()).or_default() += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_rules;
    use crate::proc::testutil::{counts, thread, FakeProc};
    use crate::proc::{Filedesc, Metrics};
    use crate::selector::RuleSet;

    fn grouper(comms: &[&str], threads: bool, remove_empty: bool) -> Grouper {
        let mut yaml = String::from("process_names:\n  - comm:\n");
        for comm in comms {
            yaml.push_str(&format!("    - {comm}\n"));
        }
        let selector = Selector::new(RuleSet::Config(parse_rules(&yaml).expect("rules")));
        Grouper::new(selector, false, threads, false, Duration::ZERO, remove_empty)
    }

    fn proc_with(
        pid: u32,
        comm: &str,
        c: Counts,
        resident: u64,
        fd: Filedesc,
        num_threads: u64,
    ) -> FakeProc {
        FakeProc::new(pid, 0, comm).with_metrics(Metrics {
            counts: c,
            memory: crate::proc::Memory {
                resident_bytes: resident,
                ..Default::default()
            },
            filedesc: fd,
            num_threads,
            ..Default::default()
        })
    }

    #[test]
    fn single_proc_group_accumulates_deltas() {
        let mut gr = grouper(&["g1"], false, false);

        let (_, groups) = gr.update(vec![proc_with(
            1,
            "g1",
            counts(1.0, 2.0, 3, 4, 5, 6, 7, 8),
            700,
            Filedesc { open: 4, limit: 400 },
            2,
        )]);
        let g = &groups["g1"];
        assert_eq!(g.procs, 1);
        assert_eq!(g.counts, Counts::default());
        assert_eq!(g.memory.resident_bytes, 700);
        assert_eq!(g.open_fds, 4);
        assert!((g.worst_fd_ratio - 0.01).abs() < 1e-9);
        assert_eq!(g.num_threads, 2);

        let (_, groups) = gr.update(vec![proc_with(
            1,
            "g1",
            counts(2.0, 3.0, 4, 5, 6, 7, 8, 9),
            650,
            Filedesc { open: 4, limit: 400 },
            2,
        )]);
        assert_eq!(groups["g1"].counts, counts(1.0, 1.0, 1, 1, 1, 1, 1, 1));
        assert_eq!(groups["g1"].memory.resident_bytes, 650);
    }

    #[test]
    fn joining_procs_contribute_from_their_second_cycle() {
        let mut gr = grouper(&["g1"], false, false);

        let (_, groups) = gr.update(vec![proc_with(
            1,
            "g1",
            counts(1.0, 2.0, 3, 4, 5, 6, 7, 8),
            300,
            Filedesc { open: 4, limit: 400 },
            2,
        )]);
        assert_eq!(groups["g1"].procs, 1);
        assert_eq!(groups["g1"].counts, Counts::default());

        // p2 appears: gauges sum immediately, counters only from the next
        // cycle on.
        let (_, groups) = gr.update(vec![
            proc_with(
                1,
                "g1",
                counts(3.0, 4.0, 5, 6, 7, 8, 9, 10),
                300,
                Filedesc { open: 4, limit: 400 },
                2,
            ),
            proc_with(
                2,
                "g1",
                counts(1.0, 1.0, 1, 1, 1, 1, 1, 1),
                100,
                Filedesc {
                    open: 40,
                    limit: 400,
                },
                3,
            ),
        ]);
        let g = &groups["g1"];
        assert_eq!(g.procs, 2);
        assert_eq!(g.counts, counts(2.0, 2.0, 2, 2, 2, 2, 2, 2));
        assert_eq!(g.memory.resident_bytes, 400);
        assert_eq!(g.open_fds, 44);
        assert!((g.worst_fd_ratio - 0.1).abs() < 1e-9);
        assert_eq!(g.num_threads, 5);

        let (_, groups) = gr.update(vec![
            proc_with(
                1,
                "g1",
                counts(4.0, 5.0, 6, 7, 8, 9, 10, 11),
                300,
                Filedesc { open: 4, limit: 400 },
                2,
            ),
            proc_with(
                2,
                "g1",
                counts(2.0, 2.0, 2, 2, 2, 2, 2, 2),
                100,
                Filedesc {
                    open: 40,
                    limit: 400,
                },
                3,
            ),
        ]);
        assert_eq!(groups["g1"].counts, counts(4.0, 4.0, 4, 4, 4, 4, 4, 4));
    }

    #[test]
    fn group_counters_never_decrease_after_exits() {
        let mut gr = grouper(&["g1"], false, false);

        gr.update(vec![
            proc_with(1, "g1", counts(3.0, 4.0, 5, 6, 7, 8, 9, 10), 300,
                Filedesc { open: 4, limit: 400 }, 2),
            proc_with(2, "g1", counts(1.0, 1.0, 1, 1, 1, 1, 1, 1), 100,
                Filedesc { open: 40, limit: 400 }, 3),
        ]);

        // p2 exits; p1 advances by one everywhere.
        let (_, groups) = gr.update(vec![proc_with(
            1,
            "g1",
            counts(4.0, 5.0, 6, 7, 8, 9, 10, 11),
            100,
            Filedesc { open: 4, limit: 400 },
            2,
        )]);
        assert_eq!(groups["g1"].procs, 1);
        assert_eq!(groups["g1"].counts, counts(1.0, 1.0, 1, 1, 1, 1, 1, 1));

        // Everything exits: the counter floor survives with zero gauges.
        let (_, groups) = gr.update(Vec::<FakeProc>::new());
        let g = &groups["g1"];
        assert_eq!(g.procs, 0);
        assert_eq!(g.counts, counts(1.0, 1.0, 1, 1, 1, 1, 1, 1));
        assert_eq!(g.memory, Memory::default());
        assert_eq!(g.oldest_start_time, None);
        assert_eq!(g.open_fds, 0);
        assert_eq!(g.worst_fd_ratio, 0.0);
    }

    #[test]
    fn empty_group_removal_resets_the_floor() {
        let mut gr = grouper(&["g1"], false, true);

        gr.update(vec![proc_with(
            1, "g1", counts(1.0, 0.0, 0, 0, 0, 0, 0, 0), 0,
            Filedesc::default(), 1,
        )]);
        gr.update(vec![proc_with(
            1, "g1", counts(5.0, 0.0, 0, 0, 0, 0, 0, 0), 0,
            Filedesc::default(), 1,
        )]);

        // The group disappears from the emission set entirely.
        let (_, groups) = gr.update(Vec::<FakeProc>::new());
        assert!(groups.is_empty());

        // And a reappearance starts its counters from zero.
        let (_, groups) = gr.update(vec![proc_with(
            1, "g1", counts(9.0, 0.0, 0, 0, 0, 0, 0, 0), 0,
            Filedesc::default(), 1,
        )]);
        assert_eq!(groups["g1"].counts, Counts::default());
    }

    #[test]
    fn fd_ratio_ignores_unknown_and_zero_limits() {
        let mut gr = grouper(&["g1"], false, false);
        let (_, groups) = gr.update(vec![
            proc_with(1, "g1", Counts::default(), 0, Filedesc { open: -1, limit: 400 }, 1),
            proc_with(2, "g1", Counts::default(), 0, Filedesc { open: 7, limit: 0 }, 1),
        ]);
        let g = &groups["g1"];
        // Unknown fd counts contribute nothing to the sum or the ratio.
        assert_eq!(g.open_fds, 7);
        assert_eq!(g.worst_fd_ratio, 0.0);
    }

    #[test]
    fn oldest_start_time_is_the_minimum_of_live_members() {
        let mut gr = grouper(&["g1"], false, false);
        let (_, groups) = gr.update(vec![
            FakeProc::new(1, 500, "g1"),
            FakeProc::new(2, 100, "g1"),
            FakeProc::new(3, 900, "g1"),
        ]);
        assert_eq!(
            groups["g1"].oldest_start_time,
            DateTime::from_timestamp(100, 0)
        );
    }

    #[test]
    fn thread_names_aggregate_with_history() {
        let p = 1u32;
        let mut gr = grouper(&["g1"], true, false);

        let (_, groups) = gr.update(vec![FakeProc::new(p, 0, "g1").with_threads(vec![
            thread(p, "t1", counts(1.0, 2.0, 3, 4, 5, 6, 0, 0)),
            thread(p + 1, "t2", counts(1.0, 1.0, 1, 1, 1, 1, 0, 0)),
        ])]);
        assert_eq!(
            groups["g1"].threads,
            vec![
                ThreadTotals {
                    name: "t1".into(),
                    num_threads: 1,
                    counts: Counts::default()
                },
                ThreadTotals {
                    name: "t2".into(),
                    num_threads: 1,
                    counts: Counts::default()
                },
            ]
        );

        let (_, groups) = gr.update(vec![FakeProc::new(p, 0, "g1").with_threads(vec![
            thread(p, "t1", counts(2.0, 3.0, 4, 5, 6, 7, 0, 0)),
            thread(p + 1, "t2", counts(2.0, 2.0, 2, 2, 2, 2, 0, 0)),
            thread(p + 2, "t2", counts(1.0, 1.0, 1, 1, 1, 1, 0, 0)),
        ])]);
        assert_eq!(
            groups["g1"].threads,
            vec![
                ThreadTotals {
                    name: "t1".into(),
                    num_threads: 1,
                    counts: counts(1.0, 1.0, 1, 1, 1, 1, 0, 0)
                },
                ThreadTotals {
                    name: "t2".into(),
                    num_threads: 2,
                    counts: counts(1.0, 1.0, 1, 1, 1, 1, 0, 0)
                },
            ]
        );

        // t1 exits; t2's history floor keeps accumulating.
        let (_, groups) = gr.update(vec![FakeProc::new(p, 0, "g1").with_threads(vec![
            thread(p + 1, "t2", counts(4.0, 4.0, 4, 4, 4, 4, 0, 0)),
            thread(p + 2, "t2", counts(2.0, 3.0, 4, 5, 6, 7, 0, 0)),
        ])]);
        assert_eq!(
            groups["g1"].threads,
            vec![ThreadTotals {
                name: "t2".into(),
                num_threads: 2,
                counts: counts(4.0, 5.0, 6, 7, 8, 9, 0, 0)
            }]
        );
    }
}
