//! Entry point: flag parsing, selector construction and server startup.

use std::error::Error;

use clap::Parser;
use tokio::sync::oneshot;
use tracing::{info, Level};

use named_process_exporter::cli::{Args, MANUAL};
use named_process_exporter::collector::{self, ProcessCollector, ScrapeRequest};
use named_process_exporter::config::{self, WebConfig};
use named_process_exporter::proc::grouper::Grouper;
use named_process_exporter::proc::read::Reader;
use named_process_exporter::selector::{
    NameMapper, Resolver, RuleSet, Selector, UsernameResolver,
};
use named_process_exporter::web;

fn setup_logging(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("failed to set tracing subscriber");
}

/// Builds the selector from either the rule file or the back-compat flags.
/// The two forms are mutually exclusive.
fn build_selector(args: &Args) -> Result<Selector, Box<dyn Error>> {
    let rules = match &args.config_path {
        Some(path) => {
            if !args.procnames.is_empty() || !args.namemapping.is_empty() {
                return Err("--config.path cannot be used with --namemapping or --procnames".into());
            }
            let matcher = config::read_rules_file(path, args.debug)?;
            info!(
                "reading metrics from {} based on {}",
                args.procfs.display(),
                path.display()
            );
            RuleSet::Config(matcher)
        }
        None => {
            let mut mapper = NameMapper::parse(&args.namemapping)?;
            let names: Vec<&str> = args
                .procnames
                .split(',')
                .filter(|name| !name.is_empty())
                .collect();
            for name in &names {
                mapper.ensure_name(name);
            }
            info!(
                "reading metrics from {} for procnames: {:?}",
                args.procfs.display(),
                names
            );
            RuleSet::NameList(mapper)
        }
    };

    let mut selector = Selector::new(rules);
    selector.register_resolver(Resolver::Username(UsernameResolver::default()));
    Ok(selector)
}

async fn scrape_once(
    scrape_tx: &tokio::sync::mpsc::Sender<ScrapeRequest>,
) -> Result<String, Box<dyn Error>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    scrape_tx
        .send(ScrapeRequest { reply: reply_tx })
        .await
        .map_err(|_| "scrape writer is gone")?;
    Ok(reply_rx.await.map_err(|_| "scrape writer is gone")??)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    if args.man {
        print!("{MANUAL}");
        return Ok(());
    }

    setup_logging(args.debug);

    let recheck = args.recheck || !args.recheck_with_time_limit.is_zero();
    let selector = build_selector(&args)?;

    let web_config = match &args.web_config_file {
        Some(path) => config::read_web_config_file(path)?,
        None => WebConfig::default(),
    };

    let reader = Reader::open(&args.procfs, args.gather_smaps, args.threads)?;
    let grouper = Grouper::new(
        selector,
        args.children,
        args.threads,
        recheck,
        args.recheck_with_time_limit,
        args.remove_empty_groups,
    );
    let collector = ProcessCollector::new(reader, grouper, args.threads, args.gather_smaps)?;
    let scrape_tx = collector::spawn_writer(collector)?;

    if !args.once_to_stdout_delay.is_zero() {
        // The first scrape primes the pump; only the second one, taken
        // after the delay, is worth printing.
        scrape_once(&scrape_tx).await?;
        tokio::time::sleep(args.once_to_stdout_delay).await;
        print!("{}", scrape_once(&scrape_tx).await?);
        return Ok(());
    }

    web::serve(
        &args.listen_address,
        &args.telemetry_path,
        web_config,
        scrape_tx,
    )
    .await
}
