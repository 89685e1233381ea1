//! `gib`: loads a rule file, plans the dirty closure for the requested goals,
//! and runs it to completion (or, under `--watch`, repeatedly).

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use gib::env::Scope;
use gib::graph::Graph;
use gib::queue::Queue;
use gib::rules::{GoalBuilder, Loader};
use gib::stampdb;

/// The output directory, the set of goal node names, and the knobs the
/// original spec treats as CLI concerns (§10.3): `-j`/`--jobs`, `--watch`,
/// `--dump`, and the rule file path.
#[derive(Parser)]
#[command(name = "gib")]
#[command(about = "An incremental, parallel build orchestrator")]
#[command(version)]
struct Cli {
    /// Goal node names to build. Defaults to `all` if none are given.
    #[arg()]
    goals: Vec<String>,

    /// Rule file to load.
    #[arg(short = 'f', long = "rules", default_value = "build.gib")]
    rules: PathBuf,

    /// Maximum number of jobs to run concurrently. Overrides `set jobs`
    /// in the rule file; defaults to 4 if neither is given.
    #[arg(short = 'j', long = "jobs")]
    jobs: Option<usize>,

    /// Keep running: after quiescence, wait for SIGUSR1 or the restat
    /// interval, restat the source tree, and replan.
    #[arg(long = "watch")]
    watch: bool,

    /// Write a plain-text dump of the graph to `<outdir>/gib.debug`.
    #[arg(long = "dump")]
    dump: bool,

    /// Restat interval in seconds for `--watch`.
    #[arg(long = "watch-interval", default_value_t = 2)]
    watch_interval: u64,
}

/// Advisory exclusive lock on the output directory, held for the process
/// lifetime (§5, §6.6): a second concurrent orchestrator on the same outdir
/// blocks until this one exits.
struct OutdirLock(std::fs::File);

impl OutdirLock {
    fn acquire(outdir: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(outdir).with_context(|| format!("opening '{}'", outdir.display()))?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).with_context(|| format!("locking '{}'", outdir.display()));
        }
        Ok(OutdirLock(file))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = run(cli).await?;
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let srcdir = std::env::current_dir().context("getting current directory")?;

    let rules_text = std::fs::read_to_string(&cli.rules)
        .with_context(|| format!("reading rule file '{}'", cli.rules.display()))?;
    let rules_name = cli.rules.display().to_string();

    // The provisional outdir covers rule generation that happens mid-load
    // (`src`/`sub` on a generated file, §4.6.3) before `set outdir` in the
    // rule file itself, if any, can be read back.
    let provisional_outdir = srcdir.join("build.default");
    let mut graph = Graph::new();

    let final_code = {
        let mut load_queue = Queue::new(&mut graph, provisional_outdir.clone(), srcdir.display().to_string(), 1)
            .context("preparing provisional build directory")?;

        let mut loader = Loader::new(&mut graph, srcdir.clone(), &mut load_queue);
        loader
            .load_str(&rules_text, &rules_name)
            .await
            .with_context(|| format!("loading '{rules_name}'"))?;

        let outdir_var = loader.env().get(Scope::Global, "outdir").map(|v| v.values().to_vec());
        let jobs_var = loader.env().get(Scope::Global, "jobs").map(|v| v.values().to_vec());
        let stamp_rules = loader.stamp_rules();
        drop(loader);

        let outdir = match outdir_var.and_then(|v| v.first().cloned()) {
            Some(dir) => PathBuf::from(dir),
            None => provisional_outdir,
        };
        let running_max = cli
            .jobs
            .or_else(|| jobs_var.and_then(|v| v.first().and_then(|s| s.parse().ok())))
            .unwrap_or(4);

        let goal_names: Vec<String> = if cli.goals.is_empty() { vec!["all".to_string()] } else { cli.goals };

        let mut goals = Vec::with_capacity(goal_names.len());
        for name in &goal_names {
            match graph.get(name) {
                Some(id) => goals.push(id),
                None => bail!("goal '{name}' is not defined"),
            }
        }

        std::fs::create_dir_all(&outdir).with_context(|| format!("creating '{}'", outdir.display()))?;
        let _lock = OutdirLock::acquire(&outdir).context("locking output directory")?;

        let stamps_path = outdir.join(stampdb::STAMPS_FILE);
        let dynamic_path = outdir.join(stampdb::DYNAMIC_FILE);
        stampdb::load_stamps(&mut graph, &stamps_path).context("loading stamp database")?;
        stampdb::load_dynamic(&mut graph, &dynamic_path).context("loading dynamic-deps database")?;

        let mut queue = Queue::new(&mut graph, outdir.clone(), srcdir.display().to_string(), running_max)
            .context("preparing build directory")?;
        queue.set_stamp_rules(stamp_rules);

        for goal in &goals {
            queue.create_jobs(&mut graph, *goal);
        }

        let summary = if cli.watch {
            queue.run_watch(&mut graph, &goals, Duration::from_secs(cli.watch_interval)).await
        } else {
            queue.run_to_quiescence(&mut graph).await
        };

        stampdb::write_stamps(&graph, &stamps_path).context("writing stamp database")?;
        stampdb::write_dynamic(&graph, &dynamic_path).context("writing dynamic-deps database")?;

        if cli.dump {
            let dump_path = outdir.join("gib.debug");
            std::fs::write(&dump_path, graph.dump()).with_context(|| format!("writing '{}'", dump_path.display()))?;
        }

        tracing::info!(
            ok = summary.ok_count,
            skipped = summary.skipped_count,
            failed = summary.failed_count,
            "build finished"
        );

        summary.exit_code()
    };

    Ok(final_code)
}
