//! OS-process worker runtime.
//!
//! Each worker is a child process. It reports back by writing JSON lines to
//! stdout, one message per line:
//!
//! ```text
//! {"type":"online"}
//! {"type":"metrics","data":{"cpu":12.5,"memory":180,"requests":40,"errors":1}}
//! {"type":"error","data":{"message":"db timeout"}}
//! {"type":"health","data":{"status":"degraded"}}
//! ```
//!
//! Lines that do not parse are logged at debug and otherwise ignored.
//! Disconnect is SIGTERM, terminate is SIGKILL.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use fleet_core::{BoxFuture, HealthStatus, SlotId};

use crate::error::{SupervisorError, SupervisorResult};
use crate::runtime::{
    EventSender, SpawnSpec, WorkerCommand, WorkerEvent, WorkerEventKind, WorkerHandle,
    WorkerRuntime,
};
use crate::worker::MetricsUpdate;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
enum WireMessage {
    Online,
    Metrics(MetricsUpdate),
    Error { message: String },
    Health { status: HealthStatus },
}

fn parse_line(line: &str) -> Option<WorkerEventKind> {
    let msg: WireMessage = serde_json::from_str(line.trim()).ok()?;
    Some(match msg {
        WireMessage::Online => WorkerEventKind::Online,
        WireMessage::Metrics(update) => WorkerEventKind::Metrics(update),
        WireMessage::Error { message } => WorkerEventKind::Error { message },
        WireMessage::Health { status } => WorkerEventKind::Health { status },
    })
}

pub struct ProcessRuntime {
    command: String,
    args: Vec<String>,
}

impl ProcessRuntime {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

impl WorkerRuntime for ProcessRuntime {
    fn spawn(&self, spec: SpawnSpec, events: EventSender) -> BoxFuture<'_, SupervisorResult<WorkerHandle>> {
        Box::pin(async move {
            let slot = spec.slot;
            let mut child = Command::new(&self.command)
                .args(&self.args)
                .envs(&spec.env)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(false)
                .spawn()
                .map_err(|e| SupervisorError::Spawn {
                    slot,
                    reason: e.to_string(),
                })?;

            let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
                slot,
                reason: "process exited before it could be tracked".into(),
            })?;
            let handle = WorkerHandle(u64::from(pid));
            let stdout = child.stdout.take();
            debug!(slot, pid, command = %self.command, "spawned worker process");

            tokio::spawn(pump(slot, handle, child, stdout, events));
            Ok(handle)
        })
    }

    fn signal(&self, handle: WorkerHandle, command: WorkerCommand) -> BoxFuture<'_, SupervisorResult<()>> {
        Box::pin(async move {
            match command {
                WorkerCommand::Disconnect => send_signal(handle, libc::SIGTERM),
            }
        })
    }

    fn terminate(&self, handle: WorkerHandle) -> BoxFuture<'_, SupervisorResult<()>> {
        Box::pin(async move { send_signal(handle, libc::SIGKILL) })
    }
}

/// Forward stdout messages until the pipe closes, then report the exit.
async fn pump(
    slot: SlotId,
    handle: WorkerHandle,
    mut child: Child,
    stdout: Option<ChildStdout>,
    events: EventSender,
) {
    let send = |kind| {
        let _ = events.send(WorkerEvent { slot, handle, kind });
    };

    if let Some(stdout) = stdout {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_line(&line) {
                    Some(kind) => send(kind),
                    None => debug!(slot, %line, "worker output"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(slot, error = %e, "reading worker stdout failed");
                    break;
                }
            }
        }
    }

    let (code, signal) = match child.wait().await {
        Ok(status) => (status.code(), status.signal()),
        Err(e) => {
            warn!(slot, error = %e, "waiting on worker failed");
            (None, None)
        }
    };
    send(WorkerEventKind::Exited { code, signal });
}

fn send_signal(handle: WorkerHandle, signal: libc::c_int) -> SupervisorResult<()> {
    let pid = libc::pid_t::try_from(handle.0)
        .map_err(|_| SupervisorError::Runtime(format!("handle {handle} is not a pid")))?;
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().into())
    }
}
