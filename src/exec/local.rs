//! Local process execution
//!
//! Each rule application gets a working directory `r{id}` under the job
//! directory. `prepare` wraps the rendered run statements into one shell
//! script with fail-fast sequencing and SIGTERM/SIGINT propagation to the
//! running child; `start` spawns `bash` on it with stdout/stderr captured
//! to files next to the script.
//!
//! The resume token is the child's pid. After a coordinator crash,
//! `resume` re-attaches by polling the pid for termination (a /proc probe
//! with exponential backoff capped at 5 s). The exit status of a process
//! we did not spawn is unrecoverable, so a resumed execution presumes
//! success.

use crate::model::{
    CancelToken, CompletionState, ExecError, Execution, ExecutionBuilder, Executor, Listener,
    RunStatement,
};
use crate::store::{ApplicationId, FileEntry};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};

const STAGE_DIR: &str = "jobfiles";
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Runs rule applications as local child processes.
pub struct LocalExecutor {
    job_dir: PathBuf,
}

impl LocalExecutor {
    pub fn new(job_dir: impl Into<PathBuf>) -> Self {
        LocalExecutor {
            job_dir: job_dir.into(),
        }
    }
}

impl Executor for LocalExecutor {
    fn builder(&self, application_id: ApplicationId) -> Box<dyn ExecutionBuilder> {
        Box::new(LocalBuilder {
            work_dir: self.job_dir.join(format!("r{application_id}")),
            command: None,
            file_count: 0,
        })
    }

    fn resume(&self, token: &str) -> Result<Box<dyn Execution>, ExecError> {
        let pid: u32 = token
            .parse()
            .map_err(|_| ExecError::BadResumeToken(token.to_string()))?;
        Ok(Box::new(DetachedProcess { pid }))
    }
}

struct LocalBuilder {
    work_dir: PathBuf,
    command: Option<String>,
    file_count: usize,
}

impl ExecutionBuilder for LocalBuilder {
    fn localize(&mut self, file: &FileEntry) -> Result<String, ExecError> {
        // already on this host; hand back the stored path
        if file.local_path.is_empty() {
            return Err(ExecError::Localize(format!("file {}", file.id)));
        }
        Ok(file.local_path.clone())
    }

    fn add_file(&mut self, body: &[u8]) -> Result<String, ExecError> {
        std::fs::create_dir_all(self.work_dir.join(STAGE_DIR))?;
        self.file_count += 1;
        let relative = format!("{STAGE_DIR}/file{}", self.file_count);
        std::fs::write(self.work_dir.join(&relative), body)?;
        Ok(relative)
    }

    fn prepare(&mut self, statements: &[RunStatement]) -> Result<(), ExecError> {
        let mut script = String::new();
        script.push_str("EXIT_STATUS=0\n");
        script.push_str("rm -f results.json\n");

        for statement in statements {
            let invocation = match &statement.script {
                Some(body) => {
                    let staged = self.add_file(body.as_bytes())?;
                    format!("{} {staged}", statement.executable)
                }
                None => statement.executable.clone(),
            };
            script.push_str("if [ $EXIT_STATUS = 0 ]; then\n");
            // forward a kill to the running child if the shell receives
            // SIGTERM or SIGINT
            script.push_str("  trap 'kill -TERM $PID' TERM INT\n");
            let _ = writeln!(script, "  {invocation} &");
            script.push_str("  PID=$!\n");
            script.push_str("  wait $PID\n");
            script.push_str("  trap - TERM INT\n");
            script.push_str("  wait $PID\n");
            script.push_str("  EXIT_STATUS=$?\n");
            script.push_str("fi\n");
        }
        script.push_str("exit $EXIT_STATUS\n");

        let staged = self.add_file(script.as_bytes())?;
        self.command = Some(staged);
        Ok(())
    }

    fn start(&mut self, cancel: &CancelToken) -> Result<Box<dyn Execution>, ExecError> {
        let script = self
            .command
            .clone()
            .ok_or_else(|| ExecError::Other("start called before prepare".to_string()))?;
        std::fs::create_dir_all(&self.work_dir)?;
        let stdout = std::fs::File::create(self.work_dir.join("stdout.txt"))?;
        let stderr = std::fs::File::create(self.work_dir.join("stderr.txt"))?;

        let child = Command::new("bash")
            .arg(&script)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()?;
        debug!(pid = child.id(), work_dir = %self.work_dir.display(), "started");

        Ok(Box::new(LocalChild {
            work_dir: self.work_dir.clone(),
            child,
            cancel: cancel.clone(),
        }))
    }
}

struct LocalChild {
    work_dir: PathBuf,
    child: Child,
    cancel: CancelToken,
}

impl Execution for LocalChild {
    fn resume_token(&self) -> String {
        self.child.id().to_string()
    }

    fn wait(mut self: Box<Self>, listener: Box<dyn Listener>) {
        listener.status("executing");

        let mut signaled = false;
        let status = loop {
            if self.cancel.is_cancelled() && !signaled {
                warn!(pid = self.child.id(), "cancellation requested, killing child");
                if let Err(err) = self.child.kill() {
                    warn!(%err, "could not kill child");
                }
                signaled = true;
            }
            match self.child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => std::thread::sleep(Duration::from_millis(25)),
                Err(err) => {
                    listener.completed(CompletionState::failure(format!(
                        "could not wait for child: {err}"
                    )));
                    return;
                }
            }
        };

        debug!(pid = self.child.id(), code = ?status.code(), "terminated");
        if status.success() {
            listener.completed(CompletionState::success());
        } else {
            let mut state = CompletionState::failure(format!(
                "exit status was non-zero: {}",
                status.code().map_or_else(|| "killed".to_string(), |c| c.to_string())
            ));
            state.failure_logs = vec![
                (
                    "stdout".to_string(),
                    self.work_dir.join("stdout.txt").display().to_string(),
                ),
                (
                    "stderr".to_string(),
                    self.work_dir.join("stderr.txt").display().to_string(),
                ),
            ];
            listener.completed(state);
        }
    }
}

/// An execution started by an earlier process, identified only by pid.
struct DetachedProcess {
    pid: u32,
}

impl DetachedProcess {
    fn alive(&self) -> bool {
        // the pid-0-signal probe, via procfs since we never held the child
        Path::new(&format!("/proc/{}", self.pid)).exists()
    }
}

impl Execution for DetachedProcess {
    fn resume_token(&self) -> String {
        self.pid.to_string()
    }

    fn wait(self: Box<Self>, listener: Box<dyn Listener>) {
        listener.status("reattached");
        let mut interval = Duration::from_millis(10);
        while self.alive() {
            std::thread::sleep(interval);
            // back off by a third each round, bounded
            interval = (interval * 4 / 3).min(MAX_POLL_INTERVAL);
        }
        // exit status of a foreign process is unrecoverable; presume success
        listener.completed(CompletionState::success());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Sender};
    use tempfile::TempDir;

    struct ChannelListener {
        tx: Sender<CompletionState>,
    }

    impl Listener for ChannelListener {
        fn status(&self, _update: &str) {}
        fn completed(&self, state: CompletionState) {
            let _ = self.tx.send(state);
        }
    }

    fn run_statements(
        executor: &LocalExecutor,
        id: ApplicationId,
        statements: &[RunStatement],
    ) -> CompletionState {
        let mut builder = executor.builder(id);
        builder.prepare(statements).expect("prepare");
        let execution = builder.start(&CancelToken::new()).expect("start");
        let (tx, rx) = unbounded();
        let handle = std::thread::spawn(move || execution.wait(Box::new(ChannelListener { tx })));
        let state = rx
            .recv_timeout(Duration::from_secs(30))
            .expect("completion");
        handle.join().expect("worker");
        state
    }

    #[test]
    fn test_successful_run_captures_stdout() {
        let temp = TempDir::new().expect("tempdir");
        let executor = LocalExecutor::new(temp.path());
        let state = run_statements(&executor, 1, &[RunStatement::new("echo hello")]);
        assert!(state.success);

        let stdout =
            std::fs::read_to_string(temp.path().join("r1/stdout.txt")).expect("stdout.txt");
        assert_eq!(stdout.trim(), "hello");
    }

    #[test]
    fn test_failing_statement_reports_logs() {
        let temp = TempDir::new().expect("tempdir");
        let executor = LocalExecutor::new(temp.path());
        let state = run_statements(&executor, 2, &[RunStatement::new("false")]);
        assert!(!state.success);
        assert!(state
            .failure_message
            .as_deref()
            .is_some_and(|m| m.contains("non-zero")));
        assert_eq!(state.failure_logs.len(), 2);
    }

    #[test]
    fn test_fail_fast_skips_later_statements() {
        let temp = TempDir::new().expect("tempdir");
        let executor = LocalExecutor::new(temp.path());
        let state = run_statements(
            &executor,
            3,
            &[
                RunStatement::new("false"),
                RunStatement::new("touch should_not_exist"),
            ],
        );
        assert!(!state.success);
        assert!(!temp.path().join("r3/should_not_exist").exists());
    }

    #[test]
    fn test_script_body_is_staged() {
        let temp = TempDir::new().expect("tempdir");
        let executor = LocalExecutor::new(temp.path());
        let state = run_statements(
            &executor,
            4,
            &[RunStatement::with_script("bash", "echo from-script > marker")],
        );
        assert!(state.success);
        let marker = std::fs::read_to_string(temp.path().join("r4/marker")).expect("marker");
        assert_eq!(marker.trim(), "from-script");
    }

    #[test]
    fn test_resume_polls_until_exit() {
        let temp = TempDir::new().expect("tempdir");
        let executor = LocalExecutor::new(temp.path());

        let mut child = Command::new("sleep")
            .arg("0.2")
            .spawn()
            .expect("spawn sleep");
        let token = child.id().to_string();

        let execution = executor.resume(&token).expect("resume");
        assert_eq!(execution.resume_token(), token);

        // reap in the background so the pid actually disappears; a zombie
        // still has a /proc entry
        let reaper = std::thread::spawn(move || {
            let _ = child.wait();
        });

        let (tx, rx) = unbounded();
        std::thread::spawn(move || execution.wait(Box::new(ChannelListener { tx })));
        let state = rx
            .recv_timeout(Duration::from_secs(30))
            .expect("completion");
        assert!(state.success);
        reaper.join().expect("reaper");
    }

    #[test]
    fn test_resume_rejects_bad_token() {
        let temp = TempDir::new().expect("tempdir");
        let executor = LocalExecutor::new(temp.path());
        assert!(matches!(
            executor.resume("not-a-pid"),
            Err(ExecError::BadResumeToken(_))
        ));
    }

    #[test]
    fn test_cancellation_kills_child() {
        let temp = TempDir::new().expect("tempdir");
        let executor = LocalExecutor::new(temp.path());

        let mut builder = executor.builder(5);
        builder
            .prepare(&[RunStatement::new("sleep 30")])
            .expect("prepare");
        let cancel = CancelToken::new();
        let execution = builder.start(&cancel).expect("start");

        let (tx, rx) = unbounded();
        std::thread::spawn(move || execution.wait(Box::new(ChannelListener { tx })));
        cancel.cancel();
        let state = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("completion");
        assert!(!state.success);
    }
}
