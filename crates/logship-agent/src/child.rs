//! Wrapped child command
//!
//! In sidecar use the agent wraps the application entry point: the child
//! inherits stdio, the monitors run alongside it, and when the child exits
//! the agent exits with the child's code.

use std::io;
use std::process::Command;
use std::thread::JoinHandle;

use crate::worker::StopToken;

/// Spawns the child command line and a thread that waits for it. When the
/// child exits, the stop token fires so the supervisor unblocks; the join
/// handle yields the exit code to propagate.
pub fn spawn_child(command_line: &[String], stop: StopToken) -> io::Result<JoinHandle<i32>> {
    let (program, args) = command_line
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

    let mut child = Command::new(program).args(args).spawn()?;
    tracing::info!(program = %program, pid = child.id(), "child process started");

    std::thread::Builder::new()
        .name("child-wait".to_string())
        .spawn(move || {
            let code = match child.wait() {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    tracing::error!(error = %e, "waiting for child failed");
                    1
                }
            };
            tracing::info!(code, "child process exited");
            stop.request_stop();
            code
        })
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    // A signal-terminated child maps to the conventional 128+signal shell code.
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
