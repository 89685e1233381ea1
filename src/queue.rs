//! The scheduler: computes the dirty closure from a set of goal nodes,
//! maintains a ready FIFO plus the waiting/blocking bookkeeping, and runs up
//! to `running_max` children concurrently until the plan is quiescent.
//!
//! Concurrency here is expressed as a single `tokio::select!` loop on a
//! current-thread-shaped task (one `JoinSet` of job futures, a 1-second
//! progress tick, and the signal streams) rather than OS threads -- this
//! mirrors the original's single-process `select(2)` multiplexer, just with
//! `tokio` futures standing in for raw fds (§5).
//!
//! The queue never owns the graph: every method takes `&mut Graph`
//! explicitly, the same way `rules.rs`'s `Loader` does, because a generated
//! rule file's `src`/`sub` drives the queue back through [`GoalBuilder`]
//! while the loader is still holding its own mutable borrow of the graph
//! (§4.6.3) -- two structs can't each hold a long-lived `&mut Graph`.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;

use crate::graph::{self, Graph, NodeId, NodeType};
use crate::job::{self, ControlReport, JobError};
use crate::rules::{GoalBuilder, RuleError};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("goal '{0}' is not defined")]
    UndefinedGoal(String),
    #[error("creating directory '{path}': {source}")]
    Mkdir { path: String, source: std::io::Error },
    #[error("installing signal handler: {0}")]
    Signal(std::io::Error),
    #[error(transparent)]
    Job(#[from] JobError),
}

/// Counts accumulated over a run, used both for the exit code and for the
/// `watch` loop's per-cycle report.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub ok_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
}

impl RunSummary {
    /// §6.7: zero iff nothing failed.
    pub fn exit_code(&self) -> i32 {
        if self.failed_count == 0 {
            0
        } else {
            1
        }
    }
}

struct JobOutcome {
    node: NodeId,
    success: bool,
    report: ControlReport,
}

/// Owns the job FIFO, the running-job table, and the signal streams that
/// drive cancellation and watch-mode restat. Does not own the graph --
/// every method that needs it takes `graph: &mut Graph`.
pub struct Queue {
    outdir: PathBuf,
    log_dir: PathBuf,
    failed_dir: PathBuf,
    srcdir: String,
    running_max: usize,

    /// Max `changed` stamp among the rule files loaded this run (§4.4); a
    /// cmd-hash mismatch in `create_jobs` raises `stamp_want` to this so the
    /// node's dependents see its `changed` stamp advance too, even when no
    /// dependency of its own moved (`queue.h:355-361`).
    stamp_rules: i64,

    ready: VecDeque<NodeId>,
    pids: HashMap<NodeId, u32>,
    tasks: JoinSet<JobOutcome>,

    todo_count: usize,
    queued_count: usize,
    running_count: usize,
    ok_count: usize,
    skipped_count: usize,
    failed_count: usize,
    signalled: bool,

    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sighup: tokio::signal::unix::Signal,
    sigusr1: tokio::signal::unix::Signal,
}

impl Queue {
    /// Creates the queue, ensuring `<outdir>/_log` and `<outdir>/_failed`
    /// exist, and seeding the synthetic `"current time"` sys node (§4.4) so
    /// any rule that depends on it is dirty on every run.
    pub fn new(graph: &mut Graph, outdir: PathBuf, srcdir: String, running_max: usize) -> Result<Self, QueueError> {
        let log_dir = outdir.join("_log");
        let failed_dir = outdir.join("_failed");
        for dir in [&outdir, &log_dir, &failed_dir] {
            std::fs::create_dir_all(dir).map_err(|source| QueueError::Mkdir {
                path: dir.display().to_string(),
                source,
            })?;
        }

        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let current_time = graph.add("current time", NodeType::Sys);
        graph.node_mut(current_time).set_stamps(now);
        graph.node_mut(current_time).frozen = true;

        Ok(Queue {
            outdir,
            log_dir,
            failed_dir,
            srcdir,
            running_max: running_max.max(1),
            stamp_rules: 0,
            ready: VecDeque::new(),
            pids: HashMap::new(),
            tasks: JoinSet::new(),
            todo_count: 0,
            queued_count: 0,
            running_count: 0,
            ok_count: 0,
            skipped_count: 0,
            failed_count: 0,
            signalled: false,
            sigint: signal(SignalKind::interrupt()).map_err(QueueError::Signal)?,
            sigterm: signal(SignalKind::terminate()).map_err(QueueError::Signal)?,
            sighup: signal(SignalKind::hangup()).map_err(QueueError::Signal)?,
            sigusr1: signal(SignalKind::user_defined1()).map_err(QueueError::Signal)?,
        })
    }

    pub fn resolve_goal(&self, graph: &Graph, name: &str) -> Result<NodeId, QueueError> {
        graph.get(name).ok_or_else(|| QueueError::UndefinedGoal(name.to_string()))
    }

    /// §4.8 "Build plan": depth-first walk of `goal`'s deps, raising `want`,
    /// registering blocking edges for anything still out of date, and
    /// enqueueing `goal` immediately if it turns out ready.
    pub fn create_jobs(&mut self, graph: &mut Graph, goal: NodeId) {
        if graph.node(goal).visited {
            return;
        }
        graph.node_mut(goal).visited = true;

        let is_out = graph.node(goal).node_type == NodeType::Out;

        let deps: Vec<NodeId> = graph
            .node(goal)
            .deps
            .iter()
            .chain(graph.node(goal).deps_dyn.iter())
            .map(|k| k.id)
            .collect();

        for dep in &deps {
            self.create_jobs(graph, *dep);
            if is_out {
                let dep_want = graph.node(*dep).stamp_want;
                if dep_want > graph.node(goal).stamp_want {
                    graph.node_mut(goal).stamp_want = dep_want;
                }
            }
        }

        if !is_out {
            return;
        }

        if graph.node(goal).hash_cmd() != graph.node(goal).cmd_hash {
            graph.node_mut(goal).dirty = true;
            if self.stamp_rules > graph.node(goal).stamp_want {
                graph.node_mut(goal).stamp_want = self.stamp_rules;
            }
        }

        let stamp_want = graph.node(goal).stamp_want;
        let stamp_updated = graph.node(goal).stamp_updated;
        if stamp_want > stamp_updated || graph.node(goal).dirty {
            for dep in &deps {
                let dep_is_out = graph.node(*dep).node_type == NodeType::Out;
                if dep_is_out && !graph.node(*dep).failed {
                    let d = graph.node(*dep);
                    if d.stamp_want > d.stamp_updated || d.dirty {
                        graph.add_blocking(*dep, goal);
                        graph.node_mut(goal).waiting += 1;
                    }
                }
                if graph.node(*dep).stamp_changed > stamp_updated {
                    graph.node_mut(goal).dirty = true;
                }
            }
        }

        let waiting = graph.node(goal).waiting;
        let dirty = graph.node(goal).dirty;
        if waiting > 0 || dirty {
            self.todo_count += 1;
        }
        if waiting == 0 && dirty {
            self.queue_add(goal);
        }
    }

    fn queue_add(&mut self, node: NodeId) {
        self.ready.push_back(node);
        self.queued_count += 1;
    }

    /// Marks `node` (and everything transitively blocked on it) failed
    /// without ever running a job for it -- used when a dependency fails
    /// before this node got a chance to become ready.
    fn queue_skip(&mut self, graph: &mut Graph, node: NodeId) {
        if graph.node(node).failed {
            return;
        }
        graph.node_mut(node).failed = true;
        self.failed_count += 1;
        self.todo_count = self.todo_count.saturating_sub(1);
        eprintln!("\x1b[31mno\x1b[0m {}", graph.node(node).name);

        let blocking: Vec<NodeId> = graph.node(node).blocking.iter().map(|k| k.id).collect();
        for b in blocking {
            self.queue_skip(graph, b);
        }
    }

    /// A node that turned out not to need a job of its own (a `meta` node,
    /// or an `out` node that was already up to date) still has to propagate
    /// completion to whatever was waiting on it.
    fn queue_cleanup_node(&mut self, graph: &mut Graph, node: NodeId) {
        let n = graph.node(node);
        let relevant = matches!(n.node_type, NodeType::Out | NodeType::Meta);
        if !relevant || n.dirty || n.waiting != 0 {
            return;
        }

        let blocking: Vec<NodeId> = graph.node(node).blocking.iter().map(|k| k.id).collect();
        for b in blocking {
            graph.node_mut(b).waiting -= 1;
            if graph.node(b).waiting == 0 {
                if graph.node(b).dirty {
                    self.queue_add(b);
                } else {
                    self.queue_cleanup_node(graph, b);
                    self.todo_count = self.todo_count.saturating_sub(1);
                }
            }
        }
        graph.node_mut(node).blocking.clear();
    }

    async fn start_next(&mut self, graph: &mut Graph) -> Result<(), QueueError> {
        let Some(node) = self.ready.pop_front() else {
            return Ok(());
        };
        self.queued_count -= 1;
        graph.clear_deps_dyn(node);

        let cmd = graph.node(node).cmd.clone();
        let name = graph.node(node).name.clone();
        let (mut child, stream, _log_path) = job::spawn(&cmd, &self.outdir, &self.log_dir, &name)?;
        self.pids.insert(node, child.id().unwrap_or(0));
        self.running_count += 1;

        let srcdir = self.srcdir.clone();
        self.tasks.spawn(async move {
            let drain = job::drain_control_socket(stream, &srcdir);
            let wait = job::wait(&mut child);
            let (report, wait_result) = tokio::join!(drain, wait);
            let success = matches!(wait_result, Ok((true, _)));
            JobOutcome { node, success, report }
        });
        Ok(())
    }

    /// Reaps a finished job: applies the stamp-triple transition (§4.4),
    /// folds in any dynamically reported deps, prints the status line, and
    /// cascades completion into whatever was blocked on this node.
    fn cleanup_job(&mut self, graph: &mut Graph, outcome: JobOutcome) {
        let node = outcome.node;
        self.pids.remove(&node);
        self.running_count -= 1;

        for dep_path in &outcome.report.deps {
            graph.add_dep(node, dep_path, true);
        }

        if outcome.success {
            let want = graph.node(node).stamp_want;
            let hash = graph.node(node).hash_cmd();
            let n = graph.node_mut(node);
            n.stamp_updated = want;
            n.cmd_hash = hash;
            n.dirty = false;
            if !outcome.report.unchanged {
                n.stamp_changed = want;
            }
        } else {
            graph.node_mut(node).failed = true;
        }

        self.show_result(graph, node, &outcome);

        let blocking: Vec<NodeId> = graph.node(node).blocking.iter().map(|k| k.id).collect();
        let node_changed = graph.node(node).stamp_changed;
        let node_failed = graph.node(node).failed;

        for b in blocking {
            if node_changed > graph.node(b).stamp_updated {
                graph.node_mut(b).dirty = true;
            }
            if node_failed && !graph.node(b).failed {
                self.queue_skip(graph, b);
            }
            graph.node_mut(b).waiting -= 1;
            if graph.node(b).waiting == 0 {
                let b_node = graph.node(b);
                if b_node.dirty && b_node.stamp_updated < b_node.stamp_want && !b_node.failed {
                    self.queue_add(b);
                } else {
                    self.queue_cleanup_node(graph, b);
                }
            }
        }
        graph.node_mut(node).blocking.clear();
    }

    /// Prints the per-job result line, and on failure (or a warned-but-changed
    /// success) hard-links the log into `_failed/` and echoes it to stderr,
    /// mirroring `queue_show_result`. Suppressed when a signal is already
    /// tearing the run down, since every in-flight job will show up as a
    /// spurious failure in that case.
    fn show_result(&mut self, graph: &Graph, node: NodeId, outcome: &JobOutcome) {
        let n = graph.node(node);
        let name = n.name.clone();
        let changed = n.stamp_changed == n.stamp_want;
        let failed = n.failed;

        let (status, color) = if failed {
            ("no", 31)
        } else if !changed {
            ("--", 33)
        } else if outcome.report.warned {
            ("ok", 33)
        } else {
            ("ok", 32)
        };

        let should_show_log = (!self.signalled && failed) || (changed && outcome.report.warned);
        if should_show_log {
            let log_name = job::log_file_name(&name);
            let log_path = self.log_dir.join(&log_name);
            if failed {
                let _ = std::fs::hard_link(&log_path, self.failed_dir.join(&log_name));
            }
            if let Ok(contents) = std::fs::read_to_string(&log_path) {
                for line in contents.lines() {
                    eprintln!(" │ {line}");
                }
            }
        }

        self.todo_count = self.todo_count.saturating_sub(1);
        eprintln!("\x1b[{color}m{status}\x1b[0m {name}");

        match status {
            "no" => self.failed_count += 1,
            "--" => self.skipped_count += 1,
            _ => self.ok_count += 1,
        }
    }

    fn begin_teardown(&mut self, signal_name: &str) {
        if self.signalled {
            return;
        }
        self.signalled = true;
        eprintln!("[caught {signal_name}, cleaning up]");
        for pid in self.pids.values() {
            job::terminate(*pid);
        }
    }

    /// Runs the execution loop to quiescence: no more ready nodes, nothing
    /// running. Returns the accumulated counts since the queue was created
    /// (or since the last call, in watch mode).
    pub async fn run_to_quiescence(&mut self, graph: &mut Graph) -> RunSummary {
        loop {
            if !self.signalled {
                while self.running_count < self.running_max && !self.ready.is_empty() {
                    if let Err(e) = self.start_next(graph).await {
                        tracing::error!(error = %e, "failed to start job");
                        break;
                    }
                }
            }

            if self.running_count == 0 && (self.signalled || self.ready.is_empty()) {
                break;
            }

            tokio::select! {
                Some(joined) = self.tasks.join_next(), if self.running_count > 0 => {
                    if let Ok(outcome) = joined {
                        self.cleanup_job(graph, outcome);
                    } else {
                        self.running_count = self.running_count.saturating_sub(1);
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = self.sigint.recv() => self.begin_teardown("SIGINT"),
                _ = self.sigterm.recv() => self.begin_teardown("SIGTERM"),
                _ = self.sighup.recv() => self.begin_teardown("SIGHUP"),
            }
        }

        RunSummary {
            ok_count: self.ok_count,
            skipped_count: self.skipped_count,
            failed_count: self.failed_count,
        }
    }

    /// Re-derives filesystem-backed stamps without rerunning jobs (§4.8
    /// "Restat"): every `src`/`sys` node is re-stat'd, every `out` node's
    /// on-disk mtime is compared against its recorded `changed` stamp (to
    /// catch an output edited out of band), and a node whose `changed`
    /// advanced has its `failed` flag cleared before replanning begins --
    /// matching the documented Open Question decision, never after.
    pub fn restat(&mut self, graph: &mut Graph) {
        let ids: Vec<NodeId> = graph.iter_by_name().collect();
        for id in &ids {
            graph.node_mut(*id).visited = false;
        }

        for id in &ids {
            let (node_type, name) = {
                let n = graph.node(*id);
                (n.node_type, n.name.clone())
            };
            if !matches!(node_type, NodeType::Src | NodeType::Sys) || name == "current time" {
                continue;
            }
            if let Some(mtime) = graph::stat_mtime(&name) {
                let n = graph.node_mut(*id);
                if mtime > n.stamp_changed {
                    n.stamp_changed = mtime;
                    n.stamp_updated = mtime;
                    n.stamp_want = mtime;
                }
            }
        }

        for id in &ids {
            let (node_type, name) = {
                let n = graph.node(*id);
                (n.node_type, n.name.clone())
            };
            if node_type != NodeType::Out {
                continue;
            }
            if let Some(mtime) = graph::stat_mtime(&name) {
                let n = graph.node_mut(*id);
                if mtime > n.stamp_changed {
                    n.stamp_changed = mtime;
                    if n.failed {
                        n.failed = false;
                    }
                }
            }
        }
    }

    /// Drives the build repeatedly: run to quiescence, then wait for either
    /// `SIGUSR1` or `interval` to elapse, restat, and replan from `goals`.
    /// Exits (returning the last summary) as soon as a termination signal is
    /// observed, either mid-run or while waiting between cycles.
    pub async fn run_watch(&mut self, graph: &mut Graph, goals: &[NodeId], interval: Duration) -> RunSummary {
        loop {
            let summary = self.run_to_quiescence(graph).await;
            if self.signalled {
                return summary;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.sigusr1.recv() => {}
                _ = self.sigint.recv() => { self.begin_teardown("SIGINT"); return summary; }
                _ = self.sigterm.recv() => { self.begin_teardown("SIGTERM"); return summary; }
                _ = self.sighup.recv() => { self.begin_teardown("SIGHUP"); return summary; }
            }

            if self.signalled {
                return summary;
            }

            self.restat(graph);
            for goal in goals {
                self.create_jobs(graph, *goal);
            }
        }
    }

    pub fn todo_count(&self) -> usize {
        self.todo_count
    }
}

/// Lets a generated rule file's `src`/`sub` (§4.6.3) drive this same queue to
/// build its own prerequisite before the loader reads it.
#[async_trait(?Send)]
impl GoalBuilder for Queue {
    async fn build_goal(&mut self, graph: &mut Graph, goal: &str) -> Result<bool, RuleError> {
        let Some(id) = graph.get(goal) else {
            return Ok(true);
        };
        self.create_jobs(graph, id);
        self.run_to_quiescence(graph).await;
        Ok(!graph.node(id).failed)
    }

    fn set_stamp_rules(&mut self, stamp_rules: i64) {
        self.stamp_rules = stamp_rules;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeType;
    use tempfile::tempdir;

    fn setup_echo(graph: &mut Graph, out_name: &str, dep_name: &str) -> NodeId {
        let dep = graph.add(dep_name, NodeType::Src);
        graph.node_mut(dep).frozen = true;
        graph.node_mut(dep).set_stamps(1);

        let out = graph.add(out_name, NodeType::Out);
        graph.node_mut(out).frozen = true;
        graph.node_mut(out).cmd = vec!["/bin/echo".to_string(), "hello".to_string()];
        graph.add_dep(out, dep_name, false);
        out
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn plain_build_runs_one_job_and_advances_stamps_s1() {
        let dir = tempdir().unwrap();
        let mut graph = Graph::new();
        let out = setup_echo(&mut graph, "x", "y");

        let mut queue = Queue::new(&mut graph, dir.path().to_path_buf(), dir.path().display().to_string(), 2).unwrap();
        queue.create_jobs(&mut graph, out);
        let summary = queue.run_to_quiescence(&mut graph).await;

        assert_eq!(summary.failed_count, 0);
        assert_eq!(summary.ok_count, 1);

        let n = graph.node(out);
        assert_eq!(n.stamp_updated, n.stamp_want);
        assert_eq!(n.stamp_changed, n.stamp_want);
        assert!(!n.dirty);
        assert_ne!(n.cmd_hash, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_run_with_no_changes_schedules_no_jobs() {
        let dir = tempdir().unwrap();
        let mut graph = Graph::new();
        let out = setup_echo(&mut graph, "x", "y");

        {
            let mut queue =
                Queue::new(&mut graph, dir.path().to_path_buf(), dir.path().display().to_string(), 2).unwrap();
            queue.create_jobs(&mut graph, out);
            queue.run_to_quiescence(&mut graph).await;
        }

        for id in graph.iter_by_name().collect::<Vec<_>>() {
            graph.node_mut(id).visited = false;
        }
        let mut queue2 =
            Queue::new(&mut graph, dir.path().to_path_buf(), dir.path().display().to_string(), 2).unwrap();
        queue2.create_jobs(&mut graph, out);
        let summary = queue2.run_to_quiescence(&mut graph).await;
        assert_eq!(summary.ok_count, 0);
        assert_eq!(summary.skipped_count, 0);
        assert_eq!(summary.failed_count, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failure_isolation_s4() {
        let dir = tempdir().unwrap();
        let mut graph = Graph::new();

        let a = graph.add("a", NodeType::Out);
        graph.node_mut(a).frozen = true;
        graph.node_mut(a).cmd = vec!["/bin/false".to_string()];

        let b = setup_echo(&mut graph, "b", "b_src");

        let all = graph.add("all", NodeType::Meta);
        graph.node_mut(all).frozen = true;
        graph.add_declared_dep(all, "a", false).unwrap();
        graph.add_declared_dep(all, "b", false).unwrap();

        let mut queue = Queue::new(&mut graph, dir.path().to_path_buf(), dir.path().display().to_string(), 2).unwrap();
        queue.create_jobs(&mut graph, all);
        let summary = queue.run_to_quiescence(&mut graph).await;

        assert_eq!(summary.failed_count, 1);
        assert!(graph.node(a).failed);
        assert!(graph.node(all).failed);
        assert!(graph.node(b).stamp_updated > 0);
        assert!(dir.path().join("_failed").join("a.txt").exists());
    }

    #[test]
    fn run_summary_exit_code_is_nonzero_iff_failures() {
        let ok = RunSummary { ok_count: 3, skipped_count: 0, failed_count: 0 };
        let bad = RunSummary { ok_count: 1, skipped_count: 0, failed_count: 1 };
        assert_eq!(ok.exit_code(), 0);
        assert_eq!(bad.exit_code(), 1);
    }

    /// S3: a cmd-hash mismatch marks the node dirty, bumps `stamp_want` to
    /// the rule-file stamp, forces a rebuild even though no dependency's
    /// `want` moved, records the new hash on success, and -- because its
    /// `changed` stamp now advances past what a dependent last saw -- also
    /// rebuilds that dependent.
    #[tokio::test(flavor = "multi_thread")]
    async fn cmd_change_forces_rebuild_s3() {
        let dir = tempdir().unwrap();
        let mut graph = Graph::new();
        let x = setup_echo(&mut graph, "x", "x_src");

        let y = graph.add("y", NodeType::Out);
        graph.node_mut(y).frozen = true;
        graph.node_mut(y).cmd = vec!["/bin/echo".to_string(), "downstream".to_string()];
        graph.add_declared_dep(y, "x", false).unwrap();

        {
            let mut queue =
                Queue::new(&mut graph, dir.path().to_path_buf(), dir.path().display().to_string(), 2).unwrap();
            queue.create_jobs(&mut graph, y);
            let summary = queue.run_to_quiescence(&mut graph).await;
            assert_eq!(summary.ok_count, 2);
        }
        let old_hash = graph.node(x).cmd_hash;
        let y_updated_before = graph.node(y).stamp_updated;

        for id in graph.iter_by_name().collect::<Vec<_>>() {
            graph.node_mut(id).visited = false;
        }
        graph.node_mut(x).cmd = vec!["/bin/echo".to_string(), "goodbye".to_string()];

        let mut queue2 =
            Queue::new(&mut graph, dir.path().to_path_buf(), dir.path().display().to_string(), 2).unwrap();
        // Simulates a rule file whose own mtime is newer than anything
        // already recorded -- exactly what the loader would have computed
        // had this gone through `Loader::load_str`.
        queue2.set_stamp_rules(i64::MAX / 2);
        queue2.create_jobs(&mut graph, y);
        assert!(graph.node(x).dirty, "cmd-hash mismatch must mark the node dirty during planning");
        let summary = queue2.run_to_quiescence(&mut graph).await;

        assert_eq!(summary.ok_count, 2, "x's dependent y must also rebuild once x's command changes");
        let n = graph.node(x);
        assert_ne!(n.cmd_hash, old_hash);
        assert_eq!(n.cmd_hash, n.hash_cmd());
        assert!(graph.node(y).stamp_updated > y_updated_before, "y must rebuild once x.changed advances past it");
    }

    /// Restat (§4.8): touching a source file's mtime past the out-node's
    /// `updated` stamp marks it dirty so the next plan rebuilds it, without
    /// running any job during the restat pass itself.
    #[test]
    fn restat_marks_node_dirty_when_source_mtime_advances() {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("y.c");
        std::fs::write(&src_path, "old").unwrap();
        filetime::set_file_mtime(&src_path, filetime::FileTime::from_unix_time(1_000, 0)).unwrap();

        let mut graph = Graph::new();
        let out = setup_echo(&mut graph, "x", src_path.to_str().unwrap());
        graph.node_mut(out).stamp_updated = 1_000;
        graph.node_mut(out).stamp_changed = 1_000;
        graph.node_mut(out).stamp_want = 1_000;
        graph.node_mut(out).dirty = false;

        let mut queue =
            Queue::new(&mut graph, dir.path().join("out").to_path_buf(), dir.path().display().to_string(), 2)
                .unwrap();

        filetime::set_file_mtime(&src_path, filetime::FileTime::from_unix_time(2_000, 0)).unwrap();
        queue.restat(&mut graph);

        let dep_id = graph.get(src_path.to_str().unwrap()).unwrap();
        assert_eq!(graph.node(dep_id).stamp_changed, 2_000);

        for id in graph.iter_by_name().collect::<Vec<_>>() {
            graph.node_mut(id).visited = false;
        }
        queue.create_jobs(&mut graph, out);
        assert!(graph.node(out).dirty);
    }

    /// Restat only clears a previously failed node once its `changed` stamp
    /// has actually advanced, never unconditionally (documented Open
    /// Question decision).
    #[test]
    fn restat_leaves_failed_flag_alone_when_output_mtime_is_unchanged() {
        let dir = tempdir().unwrap();
        let out_path = dir.path().join("built.o");
        std::fs::write(&out_path, "stale").unwrap();
        filetime::set_file_mtime(&out_path, filetime::FileTime::from_unix_time(1_000, 0)).unwrap();

        let mut graph = Graph::new();
        let out = graph.add(out_path.to_str().unwrap(), NodeType::Out);
        graph.node_mut(out).frozen = true;
        graph.node_mut(out).failed = true;
        graph.node_mut(out).stamp_changed = 1_000;

        let mut queue =
            Queue::new(&mut graph, dir.path().join("out").to_path_buf(), dir.path().display().to_string(), 2)
                .unwrap();
        queue.restat(&mut graph);

        assert!(graph.node(out).failed);
    }
}
