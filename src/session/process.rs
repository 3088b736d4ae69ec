//! Spawning of session processes and the per-session supervisor tasks that ingest
//! their output and report their exit.

use crate::config::Config;
use crate::error::AppError;
use crate::session::types::{SessionId, SessionOptions};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio as StdProcessStdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdin, Command as TokioCommand};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

const READ_CHUNK_BYTES: usize = 8 * 1024;
const KILL_GRACE: Duration = Duration::from_millis(500);
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// How a session process ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    Exited { code: Option<i32>, success: bool },
    Killed,
    WaitFailed(String),
}

/// Receives output chunks and the exit of a supervised process.
#[async_trait]
pub trait ProcessObserver: Send + Sync + 'static {
    async fn on_output(&self, session_id: SessionId, chunk: String);
    async fn on_exit(&self, session_id: SessionId, outcome: ExitOutcome);
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl LaunchSpec {
    pub fn resolve(config: &Config, options: &SessionOptions, working_dir: &Path) -> Self {
        let (program, args) = match &options.program {
            Some(program) => (program.clone(), options.args.clone()),
            None => (
                config.default_shell.clone().unwrap_or_else(default_shell),
                config.shell_args.clone(),
            ),
        };
        Self {
            program,
            args,
            working_dir: working_dir.to_path_buf(),
        }
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

fn default_shell() -> String {
    if cfg!(windows) {
        return "cmd.exe".to_string();
    }
    which::which("sh")
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Live handles kept by the pool for a running session.
#[derive(Debug)]
pub struct SessionIo {
    pub pid: u32,
    pub stdin: Option<ChildStdin>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl SessionIo {
    /// Asks the supervisor to kill the process. Idempotent.
    pub fn kill(&mut self) {
        self.stdin = None;
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for SessionIo {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Spawns the process and confirms it survived startup. Output is not consumed
/// until [`supervise`] is called with the returned child.
pub async fn spawn(launch: &LaunchSpec) -> Result<(Child, u32), AppError> {
    let mut command = TokioCommand::new(&launch.program);
    command
        .args(&launch.args)
        .current_dir(&launch.working_dir)
        .stdin(StdProcessStdio::piped())
        .stdout(StdProcessStdio::piped())
        .stderr(StdProcessStdio::piped())
        .kill_on_drop(true);
    // Own group, so termination reaches everything the session started.
    #[cfg(unix)]
    command.process_group(0);

    debug!(command = %launch.display(), cwd = %launch.working_dir.display(), "Spawning session process");
    let mut child = command.spawn().map_err(|e| {
        error!(error = %e, command = %launch.display(), "Failed to spawn session process");
        AppError::ProcessFault(format!("Failed to spawn '{}': {}", launch.display(), e))
    })?;

    let pid = child
        .id()
        .ok_or_else(|| AppError::ProcessFault(format!("'{}' exited before reporting a pid", launch.display())))?;

    // Let the process get going before judging the handshake.
    tokio::task::yield_now().await;
    if let Ok(Some(status)) = child.try_wait() {
        if !status.success() {
            return Err(AppError::ProcessFault(format!(
                "'{}' exited during startup with {}",
                launch.display(),
                status
            )));
        }
    }

    Ok((child, pid))
}

/// Starts reader and exit-watch tasks for `child`, returning the handles the pool keeps.
pub fn supervise(
    session_id: SessionId,
    mut child: Child,
    pid: u32,
    observer: Arc<dyn ProcessObserver>,
) -> SessionIo {
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(stdout) = stdout {
            readers.push(spawn_reader(stdout, session_id, observer.clone()));
        }
        if let Some(stderr) = stderr {
            readers.push(spawn_reader(stderr, session_id, observer.clone()));
        }

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => ExitOutcome::Exited { code: status.code(), success: status.success() },
                Err(e) => ExitOutcome::WaitFailed(e.to_string()),
            },
            _ = &mut kill_rx => {
                kill_group(pid);
                if let Err(e) = child.start_kill() {
                    warn!(sid = %session_id, pid, error = %e, "Failed to send kill signal");
                }
                let _ = timeout(KILL_GRACE, child.wait()).await;
                ExitOutcome::Killed
            }
        };

        // Flush whatever the readers still hold, without waiting on grandchildren
        // that inherited the pipes.
        if timeout(DRAIN_GRACE, join_readers(&mut readers)).await.is_err() {
            for reader in &readers {
                reader.abort();
            }
        }

        info!(sid = %session_id, pid, ?outcome, "Session process finished");
        observer.on_exit(session_id, outcome).await;
    });

    SessionIo {
        pid,
        stdin,
        kill_tx: Some(kill_tx),
    }
}

/// SIGKILLs the process group led by `pid`. True if the group is gone.
#[cfg(unix)]
pub fn kill_group(pid: u32) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: a negative pid addresses the group created for the session leader.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc == 0 {
        return true;
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return true;
    }
    debug!(pid, error = %err, "Failed to signal process group");
    false
}

#[cfg(not(unix))]
pub fn kill_group(_pid: u32) -> bool {
    false
}

async fn join_readers(handles: &mut [JoinHandle<()>]) {
    for handle in handles.iter_mut() {
        let _ = handle.await;
    }
}

fn spawn_reader<R>(mut reader: R, session_id: SessionId, observer: Arc<dyn ProcessObserver>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    let text = take_utf8(&mut pending);
                    if !text.is_empty() {
                        observer.on_output(session_id, text).await;
                    }
                }
                Err(e) => {
                    warn!(sid = %session_id, error = %e, "Session output read failed");
                    break;
                }
            }
        }
        if !pending.is_empty() {
            observer
                .on_output(session_id, String::from_utf8_lossy(&pending).into_owned())
                .await;
        }
    })
}

/// Decodes the longest complete UTF-8 prefix, keeping a split multi-byte sequence
/// for the next read.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(s) => {
            let out = s.to_string();
            pending.clear();
            out
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let out = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            out
        }
        Err(_) => {
            let out = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as TokioMutex;

    #[test]
    fn utf8_split_sequences_are_carried_over() {
        let bytes = "héllo".as_bytes();
        let mut pending = bytes[..2].to_vec(); // 'h' + first byte of 'é'
        assert_eq!(take_utf8(&mut pending), "h");
        assert_eq!(pending.len(), 1);
        pending.extend_from_slice(&bytes[2..]);
        assert_eq!(take_utf8(&mut pending), "éllo");
        assert!(pending.is_empty());
    }

    #[test]
    fn launch_override_beats_shell() {
        let config = Config {
            default_shell: Some("bash".into()),
            ..Config::default()
        };
        let options = SessionOptions::new("/tmp").command("python3", &["-i"]);
        let launch = LaunchSpec::resolve(&config, &options, Path::new("/tmp"));
        assert_eq!(launch.program, "python3");
        assert_eq!(launch.display(), "python3 -i");

        let launch = LaunchSpec::resolve(&config, &SessionOptions::new("/tmp"), Path::new("/tmp"));
        assert_eq!(launch.program, "bash");
    }

    #[derive(Default)]
    struct Recorder {
        output: TokioMutex<String>,
        exit: TokioMutex<Option<ExitOutcome>>,
    }

    #[async_trait]
    impl ProcessObserver for Recorder {
        async fn on_output(&self, _session_id: SessionId, chunk: String) {
            self.output.lock().await.push_str(&chunk);
        }
        async fn on_exit(&self, _session_id: SessionId, outcome: ExitOutcome) {
            *self.exit.lock().await = Some(outcome);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn supervisor_reports_output_and_exit() {
        let dir = tempfile::tempdir().unwrap();
        let launch = LaunchSpec {
            program: "sh".into(),
            args: vec!["-c".into(), "echo out; echo err 1>&2; exit 3".into()],
            working_dir: dir.path().to_path_buf(),
        };
        let recorder = Arc::new(Recorder::default());
        let (child, pid) = spawn(&launch).await.unwrap();
        let _io = supervise(SessionId::new(), child, pid, recorder.clone());

        for _ in 0..100 {
            if recorder.exit.lock().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            *recorder.exit.lock().await,
            Some(ExitOutcome::Exited { code: Some(3), success: false })
        );
        let output = recorder.output.lock().await.clone();
        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_reaches_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let launch = LaunchSpec {
            program: "sh".into(),
            args: vec!["-c".into(), "sleep 30 & echo bg=$!; wait".into()],
            working_dir: dir.path().to_path_buf(),
        };
        let recorder = Arc::new(Recorder::default());
        let (child, pid) = spawn(&launch).await.unwrap();
        let mut io = supervise(SessionId::new(), child, pid, recorder.clone());

        let mut background = None;
        for _ in 0..100 {
            let output = recorder.output.lock().await.clone();
            if let Some(rest) = output.split("bg=").nth(1) {
                background = rest.trim().parse::<u32>().ok();
                if background.is_some() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let background = background.expect("background pid was printed");

        io.kill();
        let mut system = sysinfo::System::new();
        let mut alive = true;
        for _ in 0..100 {
            let pid = sysinfo::Pid::from_u32(background);
            alive = system.refresh_process(pid)
                && system
                    .process(pid)
                    .map_or(false, |p| p.status() != sysinfo::ProcessStatus::Zombie);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "background child {} outlived its session", background);
    }

    #[tokio::test]
    async fn missing_program_is_a_process_fault() {
        let dir = tempfile::tempdir().unwrap();
        let launch = LaunchSpec {
            program: "definitely-not-a-real-binary-cctm".into(),
            args: vec![],
            working_dir: dir.path().to_path_buf(),
        };
        assert!(matches!(spawn(&launch).await, Err(AppError::ProcessFault(_))));
    }
}
