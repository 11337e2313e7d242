//! Command-line interface of the exporter.
//!
//! The flag names keep the conventional exporter spelling
//! (`--web.listen-address`, `--config.path`, ...) so existing deployments
//! and dashboards carry over unchanged.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

fn parse_duration_flag(value: &str) -> Result<Duration, String> {
    if value == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(value).map_err(|e| e.to_string())
}

#[derive(Parser, Debug)]
#[command(
    name = "named-process-exporter",
    about = "Prometheus exporter reporting aggregate resource usage of named process groups",
    version
)]
pub struct Args {
    /// Address on which to expose metrics and web interface
    #[arg(long = "web.listen-address", default_value = ":9256")]
    pub listen_address: String,

    /// Path under which to expose metrics
    #[arg(long = "web.telemetry-path", default_value = "/metrics")]
    pub telemetry_path: String,

    /// Path to YAML web config file (TLS)
    #[arg(long = "web.config.file")]
    pub web_config_file: Option<PathBuf>,

    /// Path to read proc data from
    #[arg(long, default_value = "/proc")]
    pub procfs: PathBuf,

    /// Path to YAML config file with process_names selection rules
    #[arg(long = "config.path")]
    pub config_path: Option<PathBuf>,

    /// Comma-separated list of process names to monitor
    #[arg(long, default_value = "")]
    pub procnames: String,

    /// Comma-separated list, alternating process name and capturing regex
    /// to apply to cmdline
    #[arg(long, default_value = "")]
    pub namemapping: String,

    /// If a proc is tracked, track with it any children that aren't part
    /// of their own group
    #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub children: bool,

    /// Report on per-threadname metrics as well
    #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub threads: bool,

    /// Gather metrics from the smaps_rollup file, which contains
    /// proportional resident memory size
    #[arg(long = "gather-smaps", default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub gather_smaps: bool,

    /// Recheck process names on each scrape
    #[arg(long)]
    pub recheck: bool,

    /// Recheck processes only this much time after their start, but no
    /// longer (implies --recheck)
    #[arg(long = "recheck-with-time-limit", value_parser = parse_duration_flag, default_value = "0s")]
    pub recheck_with_time_limit: Duration,

    /// Forget process groups with no processes
    #[arg(long = "remove-empty-groups")]
    pub remove_empty_groups: bool,

    /// Log debugging information to stdout
    #[arg(long)]
    pub debug: bool,

    /// Print the manual and exit
    #[arg(long)]
    pub man: bool,

    /// Don't bind, just wait this much time, print the metrics once to
    /// stdout, and exit
    #[arg(long = "once-to-stdout-delay", value_parser = parse_duration_flag, default_value = "0s")]
    pub once_to_stdout_delay: Duration,
}

pub const MANUAL: &str = r#"Usage:
  named-process-exporter [options] --config.path filename.yml

or

  named-process-exporter [options] --procnames name1,...,nameN [--namemapping k1,v1,...,kN,vN]

The recommended option is to use a config file, but for convenience and
backwards compatibility the --procnames/--namemapping options exist as an
alternative.

The --children option (default: true) makes it so that any process that
otherwise isn't part of its own group becomes part of the first group found
(if any) when walking the process tree upwards. In other words, resource
usage of subprocesses is added to their parent's usage unless the subprocess
identifies as a different group name.

Command-line process selection (procnames/namemapping):

  Every process not in the procnames list is ignored. Otherwise, all
  processes found are reported on as a group based on the process name they
  share. Here 'process name' refers to the value found in the second field
  of /proc/<pid>/stat, which is truncated at 15 chars.

  The --namemapping option allows assigning a group name based on a
  combination of the process name and command line. For example, using

    --namemapping "python2,([^/]+)\.py,java,-jar\s+([^/]+)\.jar"

  will make it so that each different python2 and java -jar invocation will
  be tracked with distinct metrics. Processes whose remapped name is absent
  from the procnames list will be ignored.

Config file process selection (filename.yml):

  Every rule in process_names declares at least one of comm, exe or cmdline
  selectors; within a rule all declared selectors must match, and the first
  matching rule decides the group name through its name template.
"#;
