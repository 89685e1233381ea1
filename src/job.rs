//! A single running child: fork/exec plumbing, the fd-3 control protocol, and
//! the log file it writes to.
//!
//! The child's argv comes straight from a node's `cmd`; its stdout/stderr are
//! redirected to a per-job log file, stdin to `/dev/null`, and fd 3 carries a
//! `socketpair(2)` half back to the parent so the child (or, transitively, a
//! compiler wrapped by `wrapcc`) can report extra dependencies as it runs
//! instead of requiring them to be declared up front.

use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::path::Path;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("creating socketpair: {0}")]
    SocketPair(std::io::Error),
    #[error("opening log file '{path}': {source}")]
    LogOpen { path: String, source: std::io::Error },
    #[error("opening /dev/null: {0}")]
    DevNull(std::io::Error),
    #[error("spawning '{cmd}': {source}")]
    Spawn { cmd: String, source: std::io::Error },
    #[error("waiting on child: {0}")]
    Wait(std::io::Error),
}

/// A verb read off the child's control socket (§4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Dep(String),
    Unchanged,
    Warning,
}

/// Parses one control-socket line. Unrecognized lines are ignored rather than
/// rejected, per §4.7's "future-compatible" clause.
fn parse_control_line(line: &str, srcdir: &str) -> Option<ControlMessage> {
    if let Some(path) = line.strip_prefix("dep ") {
        Some(ControlMessage::Dep(normalize_dep(path, srcdir)))
    } else if line == "unchanged" {
        Some(ControlMessage::Unchanged)
    } else if line == "warning" {
        Some(ControlMessage::Warning)
    } else {
        None
    }
}

/// Mirrors `job_normalize_dep`: a child reports absolute paths (since rule
/// commands see `srcdir` expanded to the real source directory, not a
/// literal token), so a dep under `srcdir` is rewritten relative to it and
/// `..` components collapsed; anything else (already output-relative, or a
/// genuinely external absolute path) passes through untouched.
pub fn normalize_dep(path: &str, srcdir: &str) -> String {
    let Some(rel) = strip_srcdir_prefix(path, srcdir) else {
        return path.to_string();
    };
    let normalized = normalize_components(rel);
    if normalized.is_empty() {
        path.to_string()
    } else {
        normalized
    }
}

fn strip_srcdir_prefix<'a>(path: &'a str, srcdir: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(srcdir)?;
    rest.strip_prefix('/')
}

fn normalize_components(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out.join("/")
}

/// Sanitizes a node name into a log file name, mirroring `job_exec`'s
/// "replace `/` and ` ` with `_`, append `.txt`" rule. Exposed so the queue
/// can locate a finished job's log without re-deriving the convention.
pub fn log_file_name(node_name: &str) -> String {
    let mut out = String::with_capacity(node_name.len() + 4);
    for c in node_name.chars() {
        match c {
            '/' | ' ' => out.push('_'),
            other => out.push(other),
        }
    }
    out.push_str(".txt");
    out
}

/// Opens a fresh, exclusively-owned log file: unlink whatever is there, then
/// create it with `O_EXCL` (§4.5's "owned by exactly one job at a time"
/// invariant) so two jobs can never be writing into the same path at once
/// even if a stale file from a killed run was left behind.
fn open_log_file(log_dir: &Path, node_name: &str) -> Result<(std::fs::File, std::path::PathBuf), JobError> {
    let path = log_dir.join(log_file_name(node_name));
    let _ = std::fs::remove_file(&path);
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|source| JobError::LogOpen { path: path.display().to_string(), source })?;
    Ok((file, path))
}

/// Spawns `cmd` with cwd `outdir`, wiring fd 3 to a fresh socketpair and
/// stdout/stderr to a freshly created log file in `log_dir` (named after
/// `node_name`). Returns the running child, the parent's control-socket half,
/// and the log path.
pub fn spawn(
    cmd: &[String],
    outdir: &Path,
    log_dir: &Path,
    node_name: &str,
) -> Result<(Child, UnixStream, std::path::PathBuf), JobError> {
    let (parent_fd, child_fd) = socketpair()?;

    let (log_file, log_path) = open_log_file(log_dir, node_name)?;
    let null_file = std::fs::OpenOptions::new()
        .read(true)
        .open("/dev/null")
        .map_err(JobError::DevNull)?;

    let outdir = outdir.to_path_buf();
    let log_fd = log_file.as_raw_fd();
    let null_fd = null_file.as_raw_fd();
    let child_raw_fd = child_fd.as_raw_fd();

    let mut command = Command::new(&cmd[0]);
    command.args(&cmd[1..]);
    command.current_dir(&outdir);

    // SAFETY: this closure runs in the child between `fork` and `exec`, so
    // only async-signal-safe operations (`dup2`, `close`, `fchdir`) may
    // appear here -- the log file, `/dev/null`, and the socketpair were all
    // opened in the parent above, specifically so none of that has to happen
    // post-fork.
    unsafe {
        command.pre_exec(move || {
            if libc::dup2(null_fd, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::dup2(log_fd, 1) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::dup2(log_fd, 2) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::dup2(child_raw_fd, 3) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    command.stdin(std::process::Stdio::null());
    command.stdout(std::process::Stdio::null());
    command.stderr(std::process::Stdio::null());

    let child = command.spawn().map_err(|source| JobError::Spawn { cmd: cmd[0].clone(), source })?;

    // The parent's copy of the child's fd-3 end must be closed here so EOF on
    // `parent_fd` is observed once the child (and nothing else) exits --
    // otherwise the parent's own lingering descriptor keeps the pipe alive.
    drop(child_fd);
    drop(log_file);
    drop(null_file);

    parent_fd.set_nonblocking();
    let stream = parent_fd.into_unix_stream()?;

    Ok((child, stream, log_path))
}

struct ParentSocket(OwnedFd);

impl ParentSocket {
    fn set_nonblocking(&self) {
        unsafe {
            let flags = libc::fcntl(self.0.as_raw_fd(), libc::F_GETFL, 0);
            libc::fcntl(self.0.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }

    fn into_unix_stream(self) -> Result<UnixStream, JobError> {
        let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(self.0.into_raw_fd()) };
        UnixStream::from_std(std_stream).map_err(JobError::SocketPair)
    }
}

fn socketpair() -> Result<(ParentSocket, OwnedFd), JobError> {
    let mut fds = [0i32; 2];
    let rc = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0, fds.as_mut_ptr())
    };
    if rc != 0 {
        return Err(JobError::SocketPair(std::io::Error::last_os_error()));
    }
    // fd 3 in the child must survive `exec`, so clear CLOEXEC on that half
    // only; the parent's half keeps it (irrelevant here since we dup2 the
    // child's copy away from 3 in `pre_exec`, not this one).
    unsafe {
        let flags = libc::fcntl(fds[1], libc::F_GETFD, 0);
        libc::fcntl(fds[1], libc::F_SETFD, flags & !libc::FD_CLOEXEC);
    }
    let parent = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let child = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((ParentSocket(parent), child))
}

/// What a job reported over its control socket by the time it hit EOF.
#[derive(Debug, Default)]
pub struct ControlReport {
    pub deps: Vec<String>,
    pub warned: bool,
    pub unchanged: bool,
}

/// Reads control-socket lines until EOF, collecting `dep`/`unchanged`/
/// `warning` verbs. Mirrors `job_update`'s "fd < 0 means done" contract,
/// except here EOF on the `UnixStream` plays that role directly. `srcdir` is
/// the real absolute source directory, used to relativize `dep` paths.
pub async fn drain_control_socket(stream: UnixStream, srcdir: &str) -> ControlReport {
    let mut reader = BufReader::new(stream);
    let mut report = ControlReport::default();
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\n', '\r']);
                match parse_control_line(trimmed, srcdir) {
                    Some(ControlMessage::Dep(path)) => report.deps.push(path),
                    Some(ControlMessage::Warning) => report.warned = true,
                    Some(ControlMessage::Unchanged) => report.unchanged = true,
                    None => {}
                }
            }
            Err(_) => break,
        }
    }
    report
}

/// Waits for `child` to exit, reporting success/signal status. The exit
/// status alone decides `success`/`signalled`; `deps`/`warned` are filled in
/// by the caller from `drain_control_socket`'s result once both futures have
/// completed (see `queue.rs`, which races them together).
pub async fn wait(child: &mut Child) -> Result<(bool, bool), JobError> {
    let status = child.wait().await.map_err(JobError::Wait)?;
    let signalled = std::os::unix::process::ExitStatusExt::signal(&status).is_some();
    Ok((status.success(), signalled))
}

/// Sends `SIGTERM` to a running child's process group, used by the queue's
/// teardown path (§4.9) and by a watch-mode restat that invalidates an
/// in-flight job.
pub fn terminate(pid: u32) {
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_name_replaces_slashes_and_spaces() {
        assert_eq!(log_file_name("a/b c.o"), "a_b_c.o.txt");
    }

    #[test]
    fn normalize_dep_strips_srcdir_prefix() {
        assert_eq!(normalize_dep("/src/a/b.c", "/src"), "a/b.c");
    }

    #[test]
    fn normalize_dep_collapses_dotdot_only_under_srcdir() {
        assert_eq!(normalize_dep("/src/a/../b.c", "/src"), "b.c");
    }

    #[test]
    fn normalize_dep_passes_through_non_srcdir_paths() {
        assert_eq!(normalize_dep("out/a.o", "/src"), "out/a.o");
        assert_eq!(normalize_dep("/usr/include/stdio.h", "/src"), "/usr/include/stdio.h");
    }

    #[test]
    fn parse_control_line_recognizes_all_three_verbs() {
        assert_eq!(parse_control_line("dep foo.h", "/src"), Some(ControlMessage::Dep("foo.h".to_string())));
        assert_eq!(parse_control_line("unchanged", "/src"), Some(ControlMessage::Unchanged));
        assert_eq!(parse_control_line("warning", "/src"), Some(ControlMessage::Warning));
        assert_eq!(parse_control_line("garbage", "/src"), None);
    }

    #[tokio::test]
    async fn spawn_runs_echo_and_captures_log_and_deps() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi >&2; echo 'dep foo.h' >&3".to_string()];
        let (mut child, stream, log_path) = spawn(&cmd, dir.path(), dir.path(), "out.o").unwrap();
        let drain = tokio::spawn(drain_control_socket(stream, ""));
        let (success, signalled) = wait(&mut child).await.unwrap();
        let report = drain.await.unwrap();
        assert!(success);
        assert!(!signalled);
        assert_eq!(report.deps, vec!["foo.h".to_string()]);
        let log_contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(log_contents.contains("hi"));
    }
}
