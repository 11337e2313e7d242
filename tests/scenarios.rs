//! End-to-end scenarios driving the full tracking pipeline with in-memory
//! process records, plus one scrape through the collector against a
//! synthetic procfs tree.

use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::DateTime;

use named_process_exporter::collector::ProcessCollector;
use named_process_exporter::config::parse_rules;
use named_process_exporter::proc::grouper::Grouper;
use named_process_exporter::proc::read::Reader;
use named_process_exporter::proc::{
    Counts, Filedesc, Memory, Metrics, ProcRecord, ProcessKey, ReadError, Static, ThreadSnapshot,
};
use named_process_exporter::selector::{RuleSet, Selector};

/// Minimal in-memory process record.
#[derive(Debug, Clone)]
struct FakeProc {
    key: ProcessKey,
    static_attrs: Static,
    metrics: Metrics,
    soft_errors: u32,
}

impl FakeProc {
    fn new(pid: u32, start_ticks: u64, comm: &str, argv0: &str) -> FakeProc {
        FakeProc {
            key: ProcessKey { pid, start_ticks },
            static_attrs: Static {
                comm: comm.to_string(),
                cmdline: vec![argv0.to_string()],
                start_time: DateTime::from_timestamp(start_ticks as i64, 0),
                ..Static::default()
            },
            metrics: Metrics::default(),
            soft_errors: 0,
        }
    }

    fn parent(mut self, ppid: u32) -> FakeProc {
        self.static_attrs.parent_pid = ppid;
        self
    }

    fn cpu_user(mut self, seconds: f64) -> FakeProc {
        self.metrics.counts.cpu_user_seconds = seconds;
        self
    }

    fn io(mut self, read: u64, write: u64) -> FakeProc {
        self.metrics.counts.read_bytes = read;
        self.metrics.counts.write_bytes = write;
        self
    }

    fn soft_errors(mut self, soft: u32) -> FakeProc {
        self.soft_errors = soft;
        self
    }
}

impl ProcRecord for FakeProc {
    fn key(&mut self) -> Result<ProcessKey, ReadError> {
        Ok(self.key)
    }

    fn static_attrs(&mut self) -> Result<(Static, u32), ReadError> {
        Ok((self.static_attrs.clone(), 0))
    }

    fn metrics(&mut self) -> Result<(Metrics, u32), ReadError> {
        Ok((self.metrics.clone(), self.soft_errors))
    }

    fn threads(&mut self) -> Vec<ThreadSnapshot> {
        Vec::new()
    }
}

fn grouper_for(yaml: &str, children: bool, remove_empty: bool) -> Grouper {
    let selector = Selector::new(RuleSet::Config(parse_rules(yaml).expect("rules")));
    Grouper::new(selector, children, false, false, Duration::ZERO, remove_empty)
}

#[test]
fn steady_state_single_process() {
    let mut gr = grouper_for("process_names:\n  - comm:\n    - bash\n", false, false);

    let (_, groups) = gr.update(vec![
        FakeProc::new(100, 7, "bash", "/bin/bash").cpu_user(0.5),
    ]);
    let g = &groups["bash"];
    assert_eq!(g.procs, 1);
    assert_eq!(g.counts.cpu_user_seconds, 0.0);

    let (_, groups) = gr.update(vec![
        FakeProc::new(100, 7, "bash", "/bin/bash").cpu_user(0.7),
    ]);
    let g = &groups["bash"];
    assert_eq!(g.procs, 1);
    assert!((g.counts.cpu_user_seconds - 0.2).abs() < 1e-9);
    assert_eq!(g.oldest_start_time, DateTime::from_timestamp(7, 0));
}

#[test]
fn pid_reuse_contributes_nothing_across_lives() {
    let mut gr = grouper_for("process_names:\n  - comm:\n    - cat\n", false, false);

    let (_, groups) = gr.update(vec![FakeProc::new(200, 1000, "cat", "cat").cpu_user(2.0)]);
    assert_eq!(groups["cat"].counts.cpu_user_seconds, 0.0);

    // Same pid, new start time: both observations are first observations
    // of their respective keys.
    let (_, groups) = gr.update(vec![FakeProc::new(200, 1500, "cat", "cat").cpu_user(0.1)]);
    assert_eq!(groups["cat"].procs, 1);
    assert_eq!(groups["cat"].counts.cpu_user_seconds, 0.0);
}

#[test]
fn group_floor_survives_total_exit() {
    let mut gr = grouper_for("process_names:\n  - comm:\n    - worker\n", false, false);

    gr.update(vec![
        FakeProc::new(10, 1, "worker", "worker").cpu_user(10.0),
        FakeProc::new(11, 1, "worker", "worker").cpu_user(20.0),
    ]);
    let (_, groups) = gr.update(vec![
        FakeProc::new(10, 1, "worker", "worker").cpu_user(11.0),
        FakeProc::new(11, 1, "worker", "worker").cpu_user(22.0),
    ]);
    assert!((groups["worker"].counts.cpu_user_seconds - 3.0).abs() < 1e-9);

    let (_, groups) = gr.update(Vec::<FakeProc>::new());
    let g = &groups["worker"];
    assert!((g.counts.cpu_user_seconds - 3.0).abs() < 1e-9);
    assert_eq!(g.procs, 0);
    assert_eq!(g.memory, Memory::default());
    assert_eq!(g.oldest_start_time, None);
}

#[test]
fn children_follow_the_tracked_parent() {
    let yaml = "process_names:\n  - comm:\n    - parent-bin\n";
    let tree = || {
        vec![
            FakeProc::new(1, 0, "init", "/sbin/init"),
            FakeProc::new(10, 0, "parent-bin", "/usr/bin/parent-bin").parent(1),
            FakeProc::new(11, 0, "helper", "/usr/bin/helper").parent(10),
        ]
    };

    let mut with_children = grouper_for(yaml, true, false);
    let (_, groups) = with_children.update(tree());
    assert_eq!(groups["parent-bin"].procs, 2);

    let mut without_children = grouper_for(yaml, false, false);
    let (_, groups) = without_children.update(tree());
    assert_eq!(groups["parent-bin"].procs, 1);
}

#[test]
fn partial_read_failures_hold_io_counters_steady() {
    let mut gr = grouper_for("process_names:\n  - comm:\n    - db\n", false, false);

    gr.update(vec![FakeProc::new(5, 1, "db", "db").io(100, 50)]);
    let (_, groups) = gr.update(vec![FakeProc::new(5, 1, "db", "db").io(150, 80)]);
    assert_eq!(groups["db"].counts.read_bytes, 50);
    assert_eq!(groups["db"].counts.write_bytes, 30);

    // The I/O counters become unreadable: the snapshot reports zeros plus
    // a soft error, and the clamped delta keeps the totals where they are.
    let (errs, groups) = gr.update(vec![
        FakeProc::new(5, 1, "db", "db").io(0, 0).soft_errors(1),
    ]);
    assert_eq!(errs.partial, 1);
    assert_eq!(groups["db"].counts.read_bytes, 50);
    assert_eq!(groups["db"].counts.write_bytes, 30);
    assert_eq!(groups["db"].procs, 1);
}

#[test]
fn removed_empty_groups_restart_from_zero() {
    let mut gr = grouper_for("process_names:\n  - comm:\n    - job\n", false, true);

    gr.update(vec![FakeProc::new(7, 1, "job", "job").cpu_user(1.0)]);
    gr.update(vec![FakeProc::new(7, 1, "job", "job").cpu_user(4.0)]);

    let (_, groups) = gr.update(Vec::<FakeProc>::new());
    assert!(groups.is_empty());

    let (_, groups) = gr.update(vec![FakeProc::new(7, 2, "job", "job").cpu_user(9.0)]);
    assert_eq!(groups["job"].counts.cpu_user_seconds, 0.0);
}

fn write_fixture_proc(root: &Path, pid: u32, comm: &str, start_ticks: u64) {
    let dir = root.join(pid.to_string());
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("stat"),
        format!(
            "{pid} ({comm}) S 1 {pid} {pid} 0 -1 4194304 100 0 3 0 \
             250 50 0 0 20 0 2 0 {start_ticks} 1048576 100 0 0 0 0 0 0 0 0 0 0 0 17 1 0 0 0 0 0"
        ),
    )
    .unwrap();
    fs::write(
        dir.join("status"),
        "Uid:\t1000\t1000\t1000\t1000\nVmSwap:\t      4 kB\n\
         voluntary_ctxt_switches:\t9\nnonvoluntary_ctxt_switches:\t1\n",
    )
    .unwrap();
    fs::write(dir.join("cmdline"), format!("/usr/bin/{comm}\0").into_bytes()).unwrap();
    fs::write(dir.join("io"), "read_bytes: 100\nwrite_bytes: 50\n").unwrap();
    fs::write(dir.join("wchan"), "ep_poll").unwrap();
}

#[test]
fn collector_scrapes_a_synthetic_procfs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path();
    fs::write(root.join("stat"), "cpu  1 2 3 4\nbtime 1500000000\n").unwrap();
    write_fixture_proc(root, 100, "bash", 5000);
    write_fixture_proc(root, 101, "zsh", 6000);

    let selector = Selector::new(RuleSet::Config(
        parse_rules("process_names:\n  - comm:\n    - bash\n").expect("rules"),
    ));
    let grouper = Grouper::new(selector, false, false, false, Duration::ZERO, false);
    let reader = Reader::open(root, false, false).expect("reader");
    let mut collector = ProcessCollector::new(reader, grouper, false, false).expect("collector");

    let body = collector.scrape().expect("scrape");
    assert!(body.contains("namedprocess_namegroup_num_procs{groupname=\"bash\"} 1"));
    assert!(body.contains("namedprocess_namegroup_cpu_seconds_total{groupname=\"bash\",mode=\"user\"} 0"));
    assert!(body.contains("namedprocess_namegroup_threads_wchan{groupname=\"bash\",wchan=\"ep_poll\"} 1"));
    assert!(body.contains("namedprocess_scrape_errors 0"));
    // Only selected groups appear.
    assert!(!body.contains("groupname=\"zsh\""));

    // A second scrape still reports the same single group.
    let body = collector.scrape().expect("scrape");
    assert!(body.contains("namedprocess_namegroup_num_procs{groupname=\"bash\"} 1"));
}

#[test]
fn filedesc_unknown_values_stay_out_of_sums() {
    let mut gr = grouper_for("process_names:\n  - comm:\n    - svc\n", false, false);
    let mut proc = FakeProc::new(3, 1, "svc", "svc");
    proc.metrics.filedesc = Filedesc { open: -1, limit: 0 };
    let (_, groups) = gr.update(vec![proc]);
    assert_eq!(groups["svc"].open_fds, 0);
    assert_eq!(groups["svc"].worst_fd_ratio, 0.0);
    assert_eq!(groups["svc"].counts, Counts::default());
}
