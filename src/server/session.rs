// Copyright 2024 Delta Vision Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::HashMap,
    os::unix::process::CommandExt,
    process,
    sync::{Arc, Mutex},
    thread, time,
};

use anyhow::{anyhow, Context};
use nix::{
    errno::Errno,
    sys::signal,
    unistd::{AccessFlags, Pid},
};
use tracing::{info, instrument, span, warn, Level};

use crate::{consts, server::exit_notify::ExitNotifier, tty};

/// The result of applying a resize request.
#[derive(Debug, PartialEq)]
pub enum ResizeOutcome {
    Applied,
    /// The requested dimensions match the current ones, so no ioctl
    /// was issued and the viewer saw no redundant SIGWINCH.
    Ignored,
}

/// PtySession owns the pty master and the viewer child process for
/// one remote session.
pub struct PtySession {
    fork: shpool_pty::fork::Fork,
    pub child_pid: libc::pid_t,
    pub exit_notifier: Arc<ExitNotifier>,
    size: Mutex<tty::Size>,
    grace_period: time::Duration,
}

impl PtySession {
    /// Allocate a pty pair and start the viewer command with the pty
    /// slave as its controlling terminal. The child inherits the
    /// server's environment minus the network mode variables, plus
    /// the marker variable and the configured overrides.
    #[instrument(skip_all, fields(cid = conn_id))]
    pub fn spawn(
        conn_id: u64,
        command: &[String],
        extra_env: Option<&HashMap<String, String>>,
        initial_size: tty::Size,
        grace_period: time::Duration,
    ) -> anyhow::Result<PtySession> {
        resolve_command(&command[0])?;

        // Build up the command we will exec before forking. The pty
        // crate dup2s std{in,out,err} onto the slave for us, so we
        // just inherit them.
        let mut cmd = process::Command::new(&command[0]);
        cmd.args(&command[1..])
            .stdin(process::Stdio::inherit())
            .stdout(process::Stdio::inherit())
            .stderr(process::Stdio::inherit());
        for var in consts::MODE_VARS {
            cmd.env_remove(var);
        }
        cmd.env(consts::SERVER_CHILD_VAR, "true");
        if let Some(env) = extra_env {
            cmd.envs(env);
        }

        let fork = shpool_pty::fork::Fork::from_ptmx().context("forking pty")?;
        if fork.is_child().is_ok() {
            for fd in consts::STDERR_FD + 1..(nix::unistd::SysconfVar::OPEN_MAX as i32) {
                let _ = nix::unistd::close(fd);
            }
            let err = cmd.exec();
            eprintln!("viewer exec err: {:?}", err);
            std::process::exit(1);
        }

        let master = fork.is_parent().context("no pty master after fork")?;
        let child_pid = fork.child_pid().ok_or(anyhow!("no child pid"))?;
        info!("spawned viewer pid={}", child_pid);

        initial_size
            .set_fd(master.raw_fd().ok_or(anyhow!("no master fd"))?)
            .context("applying initial window size")?;

        // Reap the viewer when it exits and publish the status by
        // filling the exit notifier.
        let exit_notifier = Arc::new(ExitNotifier::new());
        let waitable_child = fork.clone();
        let reaper_notifier = Arc::clone(&exit_notifier);
        thread::spawn(move || {
            let _s = span!(Level::INFO, "viewer_reaper", cid = conn_id).entered();

            match waitable_child.wait_for_exit() {
                Ok((_, Some(exit_status))) => {
                    info!("viewer exited with status {}", exit_status);
                    reaper_notifier.notify_exit(exit_status);
                }
                Ok((_, None)) => {
                    info!("viewer exited without status, using 1");
                    reaper_notifier.notify_exit(1);
                }
                Err(e) => {
                    info!("error waiting on viewer, using exit status 1: {:?}", e);
                    reaper_notifier.notify_exit(1);
                }
            }
        });

        Ok(PtySession {
            fork,
            child_pid,
            exit_notifier,
            size: Mutex::new(initial_size),
            grace_period,
        })
    }

    /// A copyable handle for the pty master side, used by the relay
    /// pumps for raw reads and writes.
    pub fn master(&self) -> anyhow::Result<shpool_pty::fork::Master> {
        self.fork.is_parent().context("internal error: executing in child fork")
    }

    /// Apply a new window size to the pty. A request with unchanged
    /// dimensions is reported as Ignored without touching the pty.
    pub fn resize(&self, size: tty::Size) -> anyhow::Result<ResizeOutcome> {
        let mut current = self.size.lock().unwrap();
        if *current == size {
            return Ok(ResizeOutcome::Ignored);
        }

        let master = self.master()?;
        size.set_fd(master.raw_fd().ok_or(anyhow!("no master fd"))?)?;
        *current = size;
        Ok(ResizeOutcome::Applied)
    }

    /// Ask the viewer to exit with a SIGTERM to its process group,
    /// escalating to SIGKILL after the grace period. Termination is
    /// itself cleanup, so failures are logged rather than propagated.
    #[instrument(skip_all, fields(pid = self.child_pid))]
    pub fn terminate(&self) {
        if self.exit_notifier.wait(Some(time::Duration::ZERO)).is_some() {
            return;
        }

        info!("sending SIGTERM to viewer process group");
        if let Err(errno) = signal::killpg(Pid::from_raw(self.child_pid), signal::Signal::SIGTERM)
        {
            if errno != Errno::ESRCH {
                warn!("sending SIGTERM to viewer: {}", errno);
            }
        }

        if self.exit_notifier.wait(Some(self.grace_period)).is_none() {
            info!("viewer still running after grace period, no longer being polite");
            if let Err(errno) =
                signal::killpg(Pid::from_raw(self.child_pid), signal::Signal::SIGKILL)
            {
                if errno != Errno::ESRCH {
                    warn!("sending SIGKILL to viewer: {}", errno);
                }
            }
            // cleanup is only done once the child is actually gone
            if self.exit_notifier.wait(Some(self.grace_period)).is_none() {
                warn!("viewer survived a SIGKILL, abandoning it");
            }
        }
    }
}

/// Make sure the command names something we can actually exec, so a
/// bad configuration surfaces as a spawn error on the connection
/// rather than a cryptic exec failure inside the forked child.
fn resolve_command(program: &str) -> anyhow::Result<()> {
    if program.contains('/') {
        return nix::unistd::access(program, AccessFlags::X_OK)
            .with_context(|| format!("viewer command '{}' is not executable", program));
    }

    let path = std::env::var("PATH").unwrap_or_default();
    for dir in path.split(':').filter(|d| !d.is_empty()) {
        let candidate = std::path::Path::new(dir).join(program);
        if nix::unistd::access(&candidate, AccessFlags::X_OK).is_ok() {
            return Ok(());
        }
    }

    Err(anyhow!("viewer command '{}' not found in PATH", program))
}
