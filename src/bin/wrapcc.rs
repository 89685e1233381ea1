//! `gib-wrapcc`: a transparent compiler wrapper invoked as the first word of
//! a rule's `cmd` in place of the real compiler. It re-execs the real
//! compiler (its own argv, minus argv[0]) with `-MD -MT out -MF <depfile>`
//! appended, then turns the resulting Makefile dependency rule into `dep`
//! lines on fd 3 so the job that ran it doesn't have to declare its headers
//! by hand (§4.7).
//!
//! fd 3 and the job's log file (on fds 1/2) are already wired up by
//! `job::spawn` before this process is exec'd -- this binary only has to
//! write to the fds it inherited, never open them itself.

use std::io::Write as _;
use std::os::fd::FromRawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Stdio};

use gib::wrapcc::parse_out_deps;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() <= 1 {
        eprintln!("gib-wrapcc: need at least 1 argument");
        std::process::exit(1);
    }

    let depfile = format!("wrapcc.{}.d", std::process::id());
    let stderr_pos_before = unsafe { libc::lseek(2, 0, libc::SEEK_CUR) };

    let mut cmd_args: Vec<&str> = args[1..].iter().map(String::as_str).collect();
    cmd_args.extend_from_slice(&["-MD", "-MT", "out", "-MF", &depfile]);

    let status = match Command::new(&cmd_args[0])
        .args(&cmd_args[1..])
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
    {
        Ok(status) => status,
        Err(e) => {
            eprintln!("gib-wrapcc: exec {}: {e}", cmd_args[0]);
            std::process::exit(127);
        }
    };

    if let Some(sig) = status.signal() {
        eprintln!("{} terminated by signal {sig}", cmd_args[0]);
        std::process::exit(128 + sig);
    }

    let code = status.code().unwrap_or(1);
    if code != 0 {
        let _ = std::fs::remove_file(&depfile);
        std::process::exit(code);
    }

    // fd 3 is the control socket handed down by the parent job; safe to wrap
    // here since wrapcc never touches it before this point.
    let mut control = unsafe { std::fs::File::from_raw_fd(3) };

    let stderr_pos_after = unsafe { libc::lseek(2, 0, libc::SEEK_CUR) };
    if stderr_pos_before >= 0 && stderr_pos_before != stderr_pos_after {
        let _ = control.write_all(b"warning\n");
    }

    match std::fs::read_to_string(&depfile) {
        Ok(contents) => {
            let _ = std::fs::remove_file(&depfile);
            match parse_out_deps(&contents) {
                Some(deps) => {
                    for dep in deps {
                        let _ = writeln!(control, "dep {dep}");
                    }
                }
                None => eprintln!("gib-wrapcc: did not find the dependency line"),
            }
        }
        Err(e) => eprintln!("gib-wrapcc: reading {depfile}: {e}"),
    }

    std::process::exit(0);
}
