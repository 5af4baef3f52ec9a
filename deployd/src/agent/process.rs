//! Subprocess supervision with streamed output

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::DeployError;
use crate::protocol::FrameSink;

/// How long output from leftover background children is still forwarded
/// after the direct child exited
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Run `cmd` to completion, forwarding every output line to `sink`
///
/// The child leads its own process group. On cancellation the whole group is
/// killed, not just the direct child, and `Cancelled` is returned once it has
/// been reaped. Lines are forwarded in the order each pipe produces them;
/// stdout and stderr are interleaved as they arrive.
pub async fn run_streaming(
    mut cmd: Command,
    sink: &FrameSink,
    cancel: &CancellationToken,
) -> Result<ExitStatus, DeployError> {
    if cancel.is_cancelled() {
        return Err(DeployError::Cancelled("cancelled before start".into()));
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let pgid = child.id();

    let mut readers = JoinSet::new();
    if let Some(stdout) = child.stdout.take() {
        readers.spawn(forward_lines(stdout, sink.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.spawn(forward_lines(stderr, sink.clone()));
    }

    let outcome = tokio::select! {
        status = child.wait() => Ok(status?),
        _ = cancel.cancelled() => {
            debug!("Cancelling process group {:?}", pgid);
            kill_group(pgid);
            let _ = child.wait().await;
            Err(DeployError::Cancelled("process group killed".into()))
        }
    };

    // Once the leader is reaped its pid may be reused, so the group is only
    // signalled while a leftover member still holds a pipe open. A held pipe
    // means the group is non-empty and the pgid cannot have been recycled.
    let drained = tokio::time::timeout(DRAIN_GRACE, drain(&mut readers)).await;
    if drained.is_err() {
        debug!("Killing leftover members of process group {:?}", pgid);
        kill_group(pgid);
        drain(&mut readers).await;
    }

    outcome
}

async fn drain(readers: &mut JoinSet<()>) {
    while let Some(joined) = readers.join_next().await {
        if let Err(e) = joined {
            warn!("Output reader failed: {}", e);
        }
    }
}

async fn forward_lines<R>(pipe: R, sink: FrameSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => sink.chunk(String::from_utf8_lossy(&line).into_owned()).await,
            Err(e) => {
                warn!("Failed to read subprocess output: {}", e);
                break;
            }
        }
    }
}

fn kill_group(pgid: Option<u32>) {
    let Some(pgid) = pgid else { return };
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg has no memory-safety preconditions. The group id is the
    // pid of a child we spawned with `process_group(0)`.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

/// Short human description of a non-zero exit
pub fn describe_exit(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with status {}", code),
        (None, Some(signal)) => format!("killed by signal {}", signal),
        _ => "exited abnormally".to_string(),
    }
}
