use super::{read_pipe, QueueSnapshot, SchedulerClient, SchedulerError, SubmissionHandle};
use crate::config::{CommandConfig, DispatchConfig};
use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::Duration,
};
use tracing::{debug, instrument, trace, warn};
use tracing_unwrap::ResultExt;
use wait_timeout::ChildExt;

/// Scheduler driven through its command line tools, e.g. `qsub` and `showq -u`.
#[derive(Debug, Clone)]
pub struct CommandScheduler {
    submit: CommandConfig,
    probe: CommandConfig,
    work_dir: PathBuf,
    probe_timeout: Duration,
}

impl CommandScheduler {
    pub fn load(config: &DispatchConfig) -> Self {
        Self {
            submit: config.scheduler.submit.clone(),
            probe: config.scheduler.probe.clone(),
            work_dir: config.work_dir.clone(),
            probe_timeout: Duration::from_millis(config.scheduler.probe_timeout),
        }
    }

    fn command_name(command: &CommandConfig) -> String {
        command.exec.to_string_lossy().into_owned()
    }
}

impl SchedulerClient for CommandScheduler {
    fn submit(&mut self, descriptor: &Path) -> Result<SubmissionHandle, SchedulerError> {
        let name = Self::command_name(&self.submit);

        debug!("Submitting {descriptor:?} with {name}");

        match Command::new(&self.submit.exec)
            .args(self.submit.params.iter())
            .arg(descriptor)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => Ok(SubmissionHandle::spawned(name, child)),
            Err(source) => Err(SchedulerError::Spawn {
                command: name,
                source,
            }),
        }
    }

    #[instrument(skip(self), level = "debug")]
    fn query_occupancy(&mut self, user: &str) -> Result<QueueSnapshot, SchedulerError> {
        let name = Self::command_name(&self.probe);

        let mut child = Command::new(&self.probe.exec)
            .args(self.probe.params.iter())
            .arg(user)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SchedulerError::Spawn {
                command: name.clone(),
                source,
            })?;

        // drain both pipes while waiting, a chatty probe would block on a full pipe otherwise
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = thread::spawn(move || read_pipe(stdout));
        let stderr_reader = thread::spawn(move || read_pipe(stderr));

        let status = match child.wait_timeout(self.probe_timeout)? {
            Some(status) => status,
            None => {
                if let Err(error) = child.kill().and_then(|_| child.wait()) {
                    warn!(error = ?error, "Failed to kill timed out probe");
                }

                return Err(SchedulerError::Timeout {
                    command: name,
                    timeout: self.probe_timeout,
                });
            }
        };

        let stdout = stdout_reader.join().unwrap_or_log()?;
        let stderr = stderr_reader.join().unwrap_or_log()?;

        trace!("Probe output: {stdout}");

        if !status.success() {
            return Err(SchedulerError::ExternalCommandFailed {
                command: name,
                code: status.code(),
                stderr: stderr.trim_end().to_owned(),
            });
        }

        QueueSnapshot::parse(&stdout)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{
        config::{SchedulerConfig, SubmitFailurePolicy, TemplateConfig},
        planner::TaskRange,
        scheduler::SubmitStatus,
    };
    use tempfile::TempDir;

    fn shell(script: &str) -> CommandConfig {
        CommandConfig {
            exec: PathBuf::from("sh"),
            params: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
        }
    }

    fn scheduler(dir: &Path, submit: &str, probe: &str, probe_timeout: u64) -> CommandScheduler {
        CommandScheduler::load(&DispatchConfig {
            work_dir: dir.to_path_buf(),
            template: TemplateConfig {
                path: dir.join("job.pbs"),
                start_token: "tmpTSTART".into(),
                end_token: "tmpTEND".into(),
                output: None,
            },
            tasks: TaskRange { start: 1, end: 10 },
            window: 10,
            poll_interval: 0,
            settle_delay: 0,
            require_tasks: false,
            scheduler: SchedulerConfig {
                submit: shell(submit),
                probe: shell(probe),
                user: "phukgm".into(),
                probe_timeout,
                submit_timeout: 5_000,
                on_submit_failure: SubmitFailurePolicy::Abort,
            },
        })
    }

    #[test]
    fn probe_passes_user_and_parses_output() {
        let dir = TempDir::new().unwrap();
        let mut client = scheduler(
            dir.path(),
            "true",
            r#"test "$1" = phukgm || exit 9; printf 'active jobs\nIdle Jobs: 2  Blocked Jobs: 1\n'"#,
            5_000,
        );

        assert_eq!(
            client.query_occupancy("phukgm").unwrap(),
            QueueSnapshot {
                idle: 2,
                blocked: 1
            }
        );
    }

    #[test]
    fn failing_probe_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut client = scheduler(
            dir.path(),
            "true",
            "printf 'Idle Jobs: 0  Blocked Jobs: 0\\n'; echo 'server down' >&2; exit 4",
            5_000,
        );

        match client.query_occupancy("phukgm") {
            Err(SchedulerError::ExternalCommandFailed { code, stderr, .. }) => {
                assert_eq!(code, Some(4));
                assert_eq!(stderr, "server down");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn unexpected_probe_output_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut client = scheduler(dir.path(), "true", "echo 'no summary here'", 5_000);

        assert!(matches!(
            client.query_occupancy("phukgm"),
            Err(SchedulerError::OccupancyParse { .. })
        ));
    }

    #[test]
    fn hanging_probe_times_out() {
        let dir = TempDir::new().unwrap();
        let mut client = scheduler(dir.path(), "true", "exec sleep 5", 100);

        assert!(matches!(
            client.query_occupancy("phukgm"),
            Err(SchedulerError::Timeout { .. })
        ));
    }

    #[test]
    fn submission_runs_in_work_dir_and_reports_exit_status() {
        let dir = TempDir::new().unwrap();
        let mut client = scheduler(
            dir.path(),
            r#"test -f "$1" || exit 7; touch submitted; echo 1234.server"#,
            "true",
            5_000,
        );
        let descriptor = dir.path().join("job.pbs");
        std::fs::write(&descriptor, "#PBS -t 1-10\n").unwrap();

        let mut handle = client.submit(&descriptor).unwrap();
        assert_eq!(handle.command(), "sh");
        assert_eq!(
            handle.check(Duration::from_secs(5)).unwrap(),
            SubmitStatus::Accepted
        );
        assert!(dir.path().join("submitted").exists());

        let mut missing = client.submit(&dir.path().join("missing.pbs")).unwrap();
        assert!(matches!(
            missing.check(Duration::from_secs(5)).unwrap(),
            SubmitStatus::Failed { code: Some(7), .. }
        ));
    }

    #[test]
    fn slow_submission_is_pending() {
        let dir = TempDir::new().unwrap();
        let mut client = scheduler(dir.path(), "sleep 1", "true", 5_000);

        let mut handle = client.submit(&dir.path().join("job.pbs")).unwrap();

        assert_eq!(
            handle.check(Duration::from_millis(10)).unwrap(),
            SubmitStatus::Pending
        );
        assert_eq!(
            handle.check(Duration::from_secs(5)).unwrap(),
            SubmitStatus::Accepted
        );
    }

    #[test]
    fn dropped_pending_submission_keeps_running() {
        let dir = TempDir::new().unwrap();
        let mut client = scheduler(
            dir.path(),
            "sleep 0.5; echo 1234.server; echo 'queued' >&2; touch accepted",
            "true",
            5_000,
        );

        let mut handle = client.submit(&dir.path().join("job.pbs")).unwrap();
        assert_eq!(
            handle.check(Duration::from_millis(50)).unwrap(),
            SubmitStatus::Pending
        );
        drop(handle);

        let accepted = dir.path().join("accepted");
        for _ in 0..50 {
            if accepted.exists() {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }
        assert!(accepted.exists());
    }

    #[test]
    fn large_stderr_does_not_block_the_submission() {
        let dir = TempDir::new().unwrap();
        let mut client = scheduler(
            dir.path(),
            "i=0; while [ $i -lt 2000 ]; do echo 'qsub: rejected by the queue policy, retry later' >&2; i=$((i+1)); done; exit 3",
            "true",
            5_000,
        );

        let mut handle = client.submit(&dir.path().join("job.pbs")).unwrap();

        match handle.check(Duration::from_secs(10)).unwrap() {
            SubmitStatus::Failed { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr.lines().count(), 2000);
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[test]
    fn missing_executable_fails_to_spawn() {
        let dir = TempDir::new().unwrap();
        let mut client = scheduler(dir.path(), "true", "true", 5_000);
        client.submit.exec = dir.path().join("no-such-qsub");

        assert!(matches!(
            client.submit(&dir.path().join("job.pbs")),
            Err(SchedulerError::Spawn { .. })
        ));
    }
}
