//! Child process lifecycle: spawn with a clean environment, three pipes,
//! deadline-bounded wait, SIGTERM then SIGKILL.

use crate::{body::BodyStream, env::CgiEnvironment, error::CgiError};
use futures::stream::StreamExt;
use log::{debug, error, warn};
use std::{
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};
use tokio::{
    io::AsyncWriteExt,
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    time::{self, Instant},
};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

/// What to execute for one request.
#[derive(Debug, Clone)]
pub struct ScriptCommand {
    pub script_path: PathBuf,
    /// Runs `interpreter <script>` instead of the script itself.
    pub interpreter: Option<PathBuf>,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Spawned,
    Running,
    Completed(ExitStatus),
    /// Stopped by us because its deadline passed.
    TimedOut,
    /// Stopped by us for any other reason, such as the client leaving.
    Terminated,
    KillFailed,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessState::Spawned | ProcessState::Running)
    }
}

/// One running script. Never shared between requests.
#[derive(Debug)]
pub struct ScriptProcess {
    child: Child,
    pid: u32,
    started: Instant,
    state: ProcessState,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

fn check_runnable(cmd: &ScriptCommand) -> Result<(), CgiError> {
    let spawn_err = |path: &Path, msg: &str| CgiError::Spawn {
        path: path.to_owned(),
        source: io::Error::new(io::ErrorKind::NotFound, msg.to_owned()),
    };

    let meta = std::fs::metadata(&cmd.script_path)
        .map_err(|_| spawn_err(&cmd.script_path, "script not found"))?;
    if !meta.is_file() {
        return Err(spawn_err(&cmd.script_path, "script is not a regular file"));
    }
    if cmd.interpreter.is_none() && meta.permissions().mode() & 0o111 == 0 {
        return Err(CgiError::Spawn {
            path: cmd.script_path.clone(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "script is not executable"),
        });
    }
    Ok(())
}

pub struct ProcessRunner;

impl ProcessRunner {
    /// Spawns the script with `env` as its whole environment.
    pub fn start(env: &CgiEnvironment, cmd: &ScriptCommand) -> Result<ScriptProcess, CgiError> {
        check_runnable(cmd)?;

        let (program, mut command) = match &cmd.interpreter {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(&cmd.script_path);
                (interpreter.clone(), command)
            }
            None => (cmd.script_path.clone(), Command::new(&cmd.script_path)),
        };

        let mut child = command
            .current_dir(&cmd.working_dir)
            .env_clear()
            .envs(env.iter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CgiError::Spawn {
                path: program,
                source,
            })?;

        let pid = child.id().unwrap_or_default();
        debug!("spawned {} as pid {}", cmd.script_path.display(), pid);

        Ok(ScriptProcess {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            pid,
            started: Instant::now(),
            state: ProcessState::Spawned,
        })
    }
}

impl ScriptProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Hands out the three pipe ends; the process counts as running from here.
    pub fn take_pipes(&mut self) -> Result<(ChildStdin, ChildStdout, ChildStderr), CgiError> {
        let missing = || io::Error::new(io::ErrorKind::BrokenPipe, "child pipes already taken");
        let pipes = (
            self.stdin.take().ok_or_else(missing)?,
            self.stdout.take().ok_or_else(missing)?,
            self.stderr.take().ok_or_else(missing)?,
        );
        self.state = ProcessState::Running;
        Ok(pipes)
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, CgiError> {
        if let ProcessState::Completed(status) = self.state {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.state = ProcessState::Completed(status);
        debug!("pid {} exited with {} after {:?}", self.pid, status, self.elapsed());
        Ok(status)
    }

    /// Waits until `deadline`; past it the process is terminated and the
    /// wait reports a timeout.
    pub async fn wait_until(
        &mut self,
        deadline: Instant,
        grace: Duration,
    ) -> Result<ExitStatus, CgiError> {
        match time::timeout_at(deadline, self.wait()).await {
            Ok(result) => result,
            Err(_) => {
                let budget = deadline.saturating_duration_since(self.started);
                warn!("pid {} still running after {:?}, terminating", self.pid, budget);
                self.terminate(grace).await?;
                if self.state == ProcessState::Terminated {
                    self.state = ProcessState::TimedOut;
                }
                Err(CgiError::Timeout(budget))
            }
        }
    }

    /// SIGTERM, then SIGKILL once `grace` runs out. A process that outlives
    /// SIGKILL as well is reported as `KillFailed`.
    pub async fn terminate(&mut self, grace: Duration) -> Result<(), CgiError> {
        if self.state.is_terminal() {
            return Ok(());
        }

        if let Ok(Some(status)) = self.child.try_wait() {
            self.state = ProcessState::Completed(status);
            return Ok(());
        }

        if let Some(pid) = self.child.id() {
            // SAFETY: plain kill(2) on a child we have not reaped yet.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        if let Ok(Ok(status)) = time::timeout(grace, self.child.wait()).await {
            debug!("pid {} stopped by SIGTERM with {}", self.pid, status);
            self.state = ProcessState::Terminated;
            return Ok(());
        }

        let killed = async {
            self.child.start_kill()?;
            self.child.wait().await
        };
        match time::timeout(grace, killed).await {
            Ok(Ok(_)) => {
                self.state = ProcessState::Terminated;
                Ok(())
            }
            _ => {
                self.state = ProcessState::KillFailed;
                error!("pid {} did not die after SIGKILL; process leaked", self.pid);
                Err(CgiError::KillFailed { pid: self.pid })
            }
        }
    }

    /// Reaps the process on any exit path, terminating it if it is still
    /// running.
    pub async fn finish(&mut self, grace: Duration) {
        if self.state.is_terminal() {
            return;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => self.state = ProcessState::Completed(status),
            _ => {
                let _ = self.terminate(grace).await;
            }
        }
    }
}

/// Writes the body to the script and closes its stdin. A script that stops
/// reading early is not an error.
pub async fn feed(mut stdin: ChildStdin, mut body: BodyStream) -> Result<u64, CgiError> {
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        match stdin.write_all(&chunk).await {
            Ok(()) => written += chunk.len() as u64,
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                debug!("script closed stdin after {} bytes", written);
                return Ok(written);
            }
            Err(err) => return Err(err.into()),
        }
    }
    match stdin.shutdown().await {
        Err(err) if err.kind() != io::ErrorKind::BrokenPipe => return Err(err.into()),
        _ => {}
    }
    Ok(written)
}

/// Longest stderr line that gets logged. Longer lines are dropped.
pub const MAX_STDERR_LINE: usize = 8 * 1024;

/// Logs the script's stderr line by line; it never reaches the client.
/// Returns the number of lines logged.
pub async fn drain_stderr(stderr: ChildStderr, script: String, pid: u32) -> usize {
    let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_STDERR_LINE));
    let mut logged = 0;
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                logged += 1;
                warn!(target: "cgi_gateway::stderr", "[{} {}] {}", script, pid, line.trim_end());
            }
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(
                    target: "cgi_gateway::stderr",
                    "[{} {}] dropped a line longer than {} bytes",
                    script,
                    pid,
                    MAX_STDERR_LINE
                );
            }
            Err(LinesCodecError::Io(err)) if err.kind() == io::ErrorKind::InvalidData => {
                debug!("stderr of pid {} has a line that is not UTF-8", pid);
            }
            Err(LinesCodecError::Io(err)) => {
                debug!("stderr of pid {} unreadable: {}", pid, err);
                break;
            }
        }
    }
    logged
}
