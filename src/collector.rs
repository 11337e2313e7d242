//! Prometheus metric surface for the tracking pipeline.
//!
//! The descriptor catalogue is a fixed set of metric vectors built and
//! registered once at startup. On every scrape the group-level vectors are
//! reset and refilled from the grouper's report; counters carry absolute
//! accumulated values, so they are re-emitted with a reset + `inc_by` of
//! the current floor. The three scrape error counters are cumulative over
//! the exporter's lifetime and are never reset.
//!
//! All of this is owned by a single writer thread. Scrape requests arrive
//! over a channel and are drained in order; the update, the fill and the
//! text encoding all happen under the writer's exclusive turn, so the
//! response each client receives is a consistent snapshot.

use prometheus::{
    CounterVec, Encoder, GaugeVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::proc::grouper::{Grouper, GroupsByName};
use crate::proc::read::Reader;

/// Buffer capacity for metrics encoding.
const BUFFER_CAP: usize = 256 * 1024;

/// Depth of the scrape request mailbox.
const SCRAPE_QUEUE_DEPTH: usize = 16;

/// The fixed catalogue of exported metrics.
pub struct MetricCatalog {
    num_procs: IntGaugeVec,
    cpu_seconds_total: CounterVec,
    read_bytes_total: IntCounterVec,
    write_bytes_total: IntCounterVec,
    major_page_faults_total: IntCounterVec,
    minor_page_faults_total: IntCounterVec,
    context_switches_total: IntCounterVec,
    memory_bytes: IntGaugeVec,
    open_filedesc: IntGaugeVec,
    worst_fd_ratio: GaugeVec,
    oldest_start_time_seconds: IntGaugeVec,
    num_threads: IntGaugeVec,
    states: IntGaugeVec,
    threads_wchan: IntGaugeVec,
    thread_count: IntGaugeVec,
    thread_cpu_seconds_total: CounterVec,
    thread_io_bytes_total: IntCounterVec,
    thread_major_page_faults_total: IntCounterVec,
    thread_minor_page_faults_total: IntCounterVec,
    thread_context_switches_total: IntCounterVec,
    scrape_errors: IntCounter,
    scrape_procread_errors: IntCounter,
    scrape_partial_errors: IntCounter,
}

impl MetricCatalog {
    /// Creates and registers every metric with the registry.
    pub fn new(registry: &Registry) -> Result<MetricCatalog, prometheus::Error> {
        let num_procs = IntGaugeVec::new(
            Opts::new(
                "namedprocess_namegroup_num_procs",
                "number of processes in this group",
            ),
            &["groupname"],
        )?;
        let cpu_seconds_total = CounterVec::new(
            Opts::new(
                "namedprocess_namegroup_cpu_seconds_total",
                "Cpu user usage in seconds",
            ),
            &["groupname", "mode"],
        )?;
        let read_bytes_total = IntCounterVec::new(
            Opts::new(
                "namedprocess_namegroup_read_bytes_total",
                "number of bytes read by this group",
            ),
            &["groupname"],
        )?;
        let write_bytes_total = IntCounterVec::new(
            Opts::new(
                "namedprocess_namegroup_write_bytes_total",
                "number of bytes written by this group",
            ),
            &["groupname"],
        )?;
        let major_page_faults_total = IntCounterVec::new(
            Opts::new(
                "namedprocess_namegroup_major_page_faults_total",
                "Major page faults",
            ),
            &["groupname"],
        )?;
        let minor_page_faults_total = IntCounterVec::new(
            Opts::new(
                "namedprocess_namegroup_minor_page_faults_total",
                "Minor page faults",
            ),
            &["groupname"],
        )?;
        let context_switches_total = IntCounterVec::new(
            Opts::new(
                "namedprocess_namegroup_context_switches_total",
                "Context switches",
            ),
            &["groupname", "ctxswitchtype"],
        )?;
        let memory_bytes = IntGaugeVec::new(
            Opts::new(
                "namedprocess_namegroup_memory_bytes",
                "number of bytes of memory in use",
            ),
            &["groupname", "memtype"],
        )?;
        let open_filedesc = IntGaugeVec::new(
            Opts::new(
                "namedprocess_namegroup_open_filedesc",
                "number of open file descriptors for this group",
            ),
            &["groupname"],
        )?;
        let worst_fd_ratio = GaugeVec::new(
            Opts::new(
                "namedprocess_namegroup_worst_fd_ratio",
                "the worst (closest to 1) ratio between open fds and max fds among all procs in this group",
            ),
            &["groupname"],
        )?;
        let oldest_start_time_seconds = IntGaugeVec::new(
            Opts::new(
                "namedprocess_namegroup_oldest_start_time_seconds",
                "start time in seconds since 1970/01/01 of oldest process in group",
            ),
            &["groupname"],
        )?;
        let num_threads = IntGaugeVec::new(
            Opts::new("namedprocess_namegroup_num_threads", "Number of threads"),
            &["groupname"],
        )?;
        let states = IntGaugeVec::new(
            Opts::new(
                "namedprocess_namegroup_states",
                "Number of processes in states Running, Sleeping, Waiting, Zombie, or Other",
            ),
            &["groupname", "state"],
        )?;
        let threads_wchan = IntGaugeVec::new(
            Opts::new(
                "namedprocess_namegroup_threads_wchan",
                "Number of threads in this group waiting on each wchan",
            ),
            &["groupname", "wchan"],
        )?;
        let thread_count = IntGaugeVec::new(
            Opts::new(
                "namedprocess_namegroup_thread_count",
                "Number of threads in this group with same threadname",
            ),
            &["groupname", "threadname"],
        )?;
        let thread_cpu_seconds_total = CounterVec::new(
            Opts::new(
                "namedprocess_namegroup_thread_cpu_seconds_total",
                "Cpu user/system usage in seconds",
            ),
            &["groupname", "threadname", "mode"],
        )?;
        let thread_io_bytes_total = IntCounterVec::new(
            Opts::new(
                "namedprocess_namegroup_thread_io_bytes_total",
                "number of bytes read/written by these threads",
            ),
            &["groupname", "threadname", "iomode"],
        )?;
        let thread_major_page_faults_total = IntCounterVec::new(
            Opts::new(
                "namedprocess_namegroup_thread_major_page_faults_total",
                "Major page faults for these threads",
            ),
            &["groupname", "threadname"],
        )?;
        let thread_minor_page_faults_total = IntCounterVec::new(
            Opts::new(
                "namedprocess_namegroup_thread_minor_page_faults_total",
                "Minor page faults for these threads",
            ),
            &["groupname", "threadname"],
        )?;
        let thread_context_switches_total = IntCounterVec::new(
            Opts::new(
                "namedprocess_namegroup_thread_context_switches_total",
                "Context switches for these threads",
            ),
            &["groupname", "threadname", "ctxswitchtype"],
        )?;
        let scrape_errors = IntCounter::new(
            "namedprocess_scrape_errors",
            "general scrape errors: no proc metrics collected during a cycle",
        )?;
        let scrape_procread_errors = IntCounter::new(
            "namedprocess_scrape_procread_errors",
            "incremented each time a proc's metrics collection fails",
        )?;
        let scrape_partial_errors = IntCounter::new(
            "namedprocess_scrape_partial_errors",
            "incremented each time a tracked proc's metrics collection fails partially, e.g. unreadable I/O stats",
        )?;

        registry.register(Box::new(num_procs.clone()))?;
        registry.register(Box::new(cpu_seconds_total.clone()))?;
        registry.register(Box::new(read_bytes_total.clone()))?;
        registry.register(Box::new(write_bytes_total.clone()))?;
        registry.register(Box::new(major_page_faults_total.clone()))?;
        registry.register(Box::new(minor_page_faults_total.clone()))?;
        registry.register(Box::new(context_switches_total.clone()))?;
        registry.register(Box::new(memory_bytes.clone()))?;
        registry.register(Box::new(open_filedesc.clone()))?;
        registry.register(Box::new(worst_fd_ratio.clone()))?;
        registry.register(Box::new(oldest_start_time_seconds.clone()))?;
        registry.register(Box::new(num_threads.clone()))?;
        registry.register(Box::new(states.clone()))?;
        registry.register(Box::new(threads_wchan.clone()))?;
        registry.register(Box::new(thread_count.clone()))?;
        registry.register(Box::new(thread_cpu_seconds_total.clone()))?;
        registry.register(Box::new(thread_io_bytes_total.clone()))?;
        registry.register(Box::new(thread_major_page_faults_total.clone()))?;
        registry.register(Box::new(thread_minor_page_faults_total.clone()))?;
        registry.register(Box::new(thread_context_switches_total.clone()))?;
        registry.register(Box::new(scrape_errors.clone()))?;
        registry.register(Box::new(scrape_procread_errors.clone()))?;
        registry.register(Box::new(scrape_partial_errors.clone()))?;

        Ok(MetricCatalog {
            num_procs,
            cpu_seconds_total,
            read_bytes_total,
            write_bytes_total,
            major_page_faults_total,
            minor_page_faults_total,
            context_switches_total,
            memory_bytes,
            open_filedesc,
            worst_fd_ratio,
            oldest_start_time_seconds,
            num_threads,
            states,
            threads_wchan,
            thread_count,
            thread_cpu_seconds_total,
            thread_io_bytes_total,
            thread_major_page_faults_total,
            thread_minor_page_faults_total,
            thread_context_switches_total,
            scrape_errors,
            scrape_procread_errors,
            scrape_partial_errors,
        })
    }

    /// Clears every group-level vector ahead of a fill. The scrape error
    /// counters are cumulative and stay untouched.
    fn reset_groups(&self) {
        self.num_procs.reset();
        self.cpu_seconds_total.reset();
        self.read_bytes_total.reset();
        self.write_bytes_total.reset();
        self.major_page_faults_total.reset();
        self.minor_page_faults_total.reset();
        self.context_switches_total.reset();
        self.memory_bytes.reset();
        self.open_filedesc.reset();
        self.worst_fd_ratio.reset();
        self.oldest_start_time_seconds.reset();
        self.num_threads.reset();
        self.states.reset();
        self.threads_wchan.reset();
        self.thread_count.reset();
        self.thread_cpu_seconds_total.reset();
        self.thread_io_bytes_total.reset();
        self.thread_major_page_faults_total.reset();
        self.thread_minor_page_faults_total.reset();
        self.thread_context_switches_total.reset();
    }

    fn fill(&self, groups: &GroupsByName, emit_smaps: bool, emit_threads: bool) {
        for (name, group) in groups {
            let name = name.as_str();
            self.num_procs
                .with_label_values(&[name])
                .set(group.procs as i64);
            self.memory_bytes
                .with_label_values(&[name, "resident"])
                .set(group.memory.resident_bytes as i64);
            self.memory_bytes
                .with_label_values(&[name, "virtual"])
                .set(group.memory.virtual_bytes as i64);
            self.memory_bytes
                .with_label_values(&[name, "swapped"])
                .set(group.memory.swap_bytes as i64);
            if emit_smaps {
                self.memory_bytes
                    .with_label_values(&[name, "proportionalResident"])
                    .set(group.memory.proportional_resident_bytes as i64);
                self.memory_bytes
                    .with_label_values(&[name, "proportionalSwapped"])
                    .set(group.memory.proportional_swap_bytes as i64);
            }
            self.oldest_start_time_seconds
                .with_label_values(&[name])
                .set(group.oldest_start_time.map(|t| t.timestamp()).unwrap_or(0));
            self.open_filedesc
                .with_label_values(&[name])
                .set(group.open_fds as i64);
            self.worst_fd_ratio
                .with_label_values(&[name])
                .set(group.worst_fd_ratio);
            self.cpu_seconds_total
                .with_label_values(&[name, "user"])
                .inc_by(group.counts.cpu_user_seconds);
            self.cpu_seconds_total
                .with_label_values(&[name, "system"])
                .inc_by(group.counts.cpu_system_seconds);
            self.read_bytes_total
                .with_label_values(&[name])
                .inc_by(group.counts.read_bytes);
            self.write_bytes_total
                .with_label_values(&[name])
                .inc_by(group.counts.write_bytes);
            self.major_page_faults_total
                .with_label_values(&[name])
                .inc_by(group.counts.major_page_faults);
            self.minor_page_faults_total
                .with_label_values(&[name])
                .inc_by(group.counts.minor_page_faults);
            self.context_switches_total
                .with_label_values(&[name, "voluntary"])
                .inc_by(group.counts.ctx_switch_voluntary);
            self.context_switches_total
                .with_label_values(&[name, "nonvoluntary"])
                .inc_by(group.counts.ctx_switch_nonvoluntary);
            self.num_threads
                .with_label_values(&[name])
                .set(group.num_threads as i64);
            self.states
                .with_label_values(&[name, "Running"])
                .set(group.states.running as i64);
            self.states
                .with_label_values(&[name, "Sleeping"])
                .set(group.states.sleeping as i64);
            self.states
                .with_label_values(&[name, "Waiting"])
                .set(group.states.waiting as i64);
            self.states
                .with_label_values(&[name, "Zombie"])
                .set(group.states.zombie as i64);
            self.states
                .with_label_values(&[name, "Other"])
                .set(group.states.other as i64);
            for (wchan, count) in &group.wchans {
                self.threads_wchan
                    .with_label_values(&[name, wchan])
                    .set(*count as i64);
            }

            if emit_threads {
                for thread in &group.threads {
                    let tname = thread.name.as_str();
                    self.thread_count
                        .with_label_values(&[name, tname])
                        .set(thread.num_threads as i64);
                    self.thread_cpu_seconds_total
                        .with_label_values(&[name, tname, "user"])
                        .inc_by(thread.counts.cpu_user_seconds);
                    self.thread_cpu_seconds_total
                        .with_label_values(&[name, tname, "system"])
                        .inc_by(thread.counts.cpu_system_seconds);
                    self.thread_io_bytes_total
                        .with_label_values(&[name, tname, "read"])
                        .inc_by(thread.counts.read_bytes);
                    self.thread_io_bytes_total
                        .with_label_values(&[name, tname, "write"])
                        .inc_by(thread.counts.write_bytes);
                    self.thread_major_page_faults_total
                        .with_label_values(&[name, tname])
                        .inc_by(thread.counts.major_page_faults);
                    self.thread_minor_page_faults_total
                        .with_label_values(&[name, tname])
                        .inc_by(thread.counts.minor_page_faults);
                    self.thread_context_switches_total
                        .with_label_values(&[name, tname, "voluntary"])
                        .inc_by(thread.counts.ctx_switch_voluntary);
                    self.thread_context_switches_total
                        .with_label_values(&[name, tname, "nonvoluntary"])
                        .inc_by(thread.counts.ctx_switch_nonvoluntary);
                }
            }
        }
    }
}

/// The single writer owning the Reader, the Grouper and the registry.
pub struct ProcessCollector {
    reader: Reader,
    grouper: Grouper,
    registry: Registry,
    catalog: MetricCatalog,
    emit_threads: bool,
    emit_smaps: bool,
}

impl ProcessCollector {
    /// Builds the collector and primes the pump with one update so the
    /// first served scrape already reports counter floors.
    pub fn new(
        reader: Reader,
        grouper: Grouper,
        emit_threads: bool,
        emit_smaps: bool,
    ) -> Result<ProcessCollector, prometheus::Error> {
        let registry = Registry::new();
        let catalog = MetricCatalog::new(&registry)?;
        let mut collector = ProcessCollector {
            reader,
            grouper,
            registry,
            catalog,
            emit_threads,
            emit_smaps,
        };
        collector.run_update();
        Ok(collector)
    }

    /// One scrape cycle: update the pipeline and refill the catalogue. The
    /// error counters are advanced first so even a totally failing scrape
    /// reports its diagnostics.
    fn run_update(&mut self) {
        match self.reader.snapshot() {
            Err(e) => {
                self.catalog.scrape_errors.inc();
                error!("error reading process snapshot: {e}");
                self.catalog.reset_groups();
            }
            Ok(snapshot) => {
                let (errs, groups) = self.grouper.update(snapshot);
                self.catalog.scrape_procread_errors.inc_by(errs.read);
                self.catalog.scrape_partial_errors.inc_by(errs.partial);
                self.catalog.reset_groups();
                self.catalog
                    .fill(&groups, self.emit_smaps, self.emit_threads);
                debug!(
                    groups = groups.len(),
                    read_errors = errs.read,
                    partial_errors = errs.partial,
                    "scrape cycle complete"
                );
            }
        }
    }

    /// Runs one cycle and renders the exposition text.
    pub fn scrape(&mut self) -> Result<String, prometheus::Error> {
        self.run_update();
        let families = self.registry.gather();
        let mut buffer = Vec::with_capacity(BUFFER_CAP);
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("metrics are not valid UTF-8: {e}")))
    }
}

/// A scrape request travelling from an HTTP handler to the writer.
pub struct ScrapeRequest {
    pub reply: oneshot::Sender<Result<String, prometheus::Error>>,
}

/// Starts the writer thread. Requests are served strictly in arrival
/// order; dropping every sender shuts the writer down.
pub fn spawn_writer(
    mut collector: ProcessCollector,
) -> std::io::Result<mpsc::Sender<ScrapeRequest>> {
    let (tx, mut rx) = mpsc::channel::<ScrapeRequest>(SCRAPE_QUEUE_DEPTH);
    std::thread::Builder::new()
        .name("scrape-writer".into())
        .spawn(move || {
            while let Some(request) = rx.blocking_recv() {
                let body = collector.scrape();
                // The client may have disconnected; the update still
                // completed and is cheap to discard.
                let _ = request.reply.send(body);
            }
            debug!("scrape channel closed, writer exiting");
        })?;
    Ok(tx)
}
