pub mod command;

use std::{
    io::{self, Read},
    mem,
    path::Path,
    process::{Child, ExitStatus},
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, warn};
use tracing_unwrap::ResultExt;
use wait_timeout::ChildExt;

pub use command::CommandScheduler;

pub const IDLE_MARKER: &str = "Idle Jobs:";
pub const BLOCKED_MARKER: &str = "Blocked Jobs:";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Failed to spawn {command}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{command} exited with {code:?}: {stderr}")]
    ExternalCommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{command} did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("Occupancy output does not end with 'Idle Jobs: N' and 'Blocked Jobs: N', got {line:?}")]
    OccupancyParse { line: String },
    #[error("Failed to communicate with a child process")]
    Io(#[from] io::Error),
}

/// idle and blocked jobs of a single user at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub idle: u64,
    pub blocked: u64,
}

impl QueueSnapshot {
    /// no jobs of the user are waiting, the next window may be submitted
    pub fn is_clear(&self) -> bool {
        self.idle == 0 && self.blocked == 0
    }

    /// Extract the counts from the summary line of a `showq -u` style output.
    ///
    /// The summary has to be on the second to last line when splitting on `\n`,
    /// i.e. the last line of an output that ends with a newline. Anything else
    /// is treated as format drift and rejected instead of guessing.
    pub fn parse(output: &str) -> Result<Self, SchedulerError> {
        let lines = output.split('\n').collect::<Vec<_>>();
        let line = match lines.len() {
            0 | 1 => "",
            len => lines[len - 2].trim_end_matches('\r'),
        };

        match (count_after(line, IDLE_MARKER), count_after(line, BLOCKED_MARKER)) {
            (Some(idle), Some(blocked)) => Ok(Self { idle, blocked }),
            _ => Err(SchedulerError::OccupancyParse {
                line: line.to_owned(),
            }),
        }
    }
}

fn count_after(line: &str, marker: &str) -> Option<u64> {
    let (_, rest) = line.split_once(marker)?;
    let rest = rest.trim_start();
    let digits = rest
        .find(|c: char| !c.is_ascii_digit())
        .map_or(rest, |end| &rest[..end]);

    digits.parse().ok()
}

/// outcome of a submission command once it was given time to finish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitStatus {
    Accepted,
    /// still running after the timeout, the scheduler might have accepted it
    Pending,
    Failed { code: Option<i32>, stderr: String },
}

/// child together with the threads draining its output
#[derive(Debug)]
struct RunningSubmission {
    child: Child,
    stdout: JoinHandle<io::Result<String>>,
    stderr: JoinHandle<io::Result<String>>,
}

impl RunningSubmission {
    fn finish(self, status: ExitStatus) -> Result<SubmitStatus, SchedulerError> {
        let stdout = self.stdout.join().unwrap_or_log()?;
        let stderr = self.stderr.join().unwrap_or_log()?;

        debug!(stdout = stdout.trim_end(), "Submission finished with {status}");

        if status.success() {
            Ok(SubmitStatus::Accepted)
        } else {
            Ok(SubmitStatus::Failed {
                code: status.code(),
                stderr: stderr.trim_end().to_owned(),
            })
        }
    }
}

#[derive(Debug)]
enum HandleState {
    Running(RunningSubmission),
    Finished(SubmitStatus),
}

/// A launched submission. `submit` does not wait for it, the exit status is
/// only inspected through `check`.
///
/// Output of the child is drained in the background. A handle dropped while
/// its child still runs leaves the child alive and reaps it on a separate thread.
#[derive(Debug)]
pub struct SubmissionHandle {
    command: String,
    state: HandleState,
}

impl SubmissionHandle {
    pub fn spawned(command: impl Into<String>, mut child: Child) -> Self {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        Self {
            command: command.into(),
            state: HandleState::Running(RunningSubmission {
                child,
                stdout: thread::spawn(move || read_pipe(stdout)),
                stderr: thread::spawn(move || read_pipe(stderr)),
            }),
        }
    }

    /// handle for clients that know the result right away
    #[cfg(test)]
    pub fn finished(command: impl Into<String>, status: SubmitStatus) -> Self {
        Self {
            command: command.into(),
            state: HandleState::Finished(status),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// wait up to `timeout` for the submission to exit
    pub fn check(&mut self, timeout: Duration) -> Result<SubmitStatus, SchedulerError> {
        let running = match &mut self.state {
            HandleState::Finished(status) => return Ok(status.clone()),
            HandleState::Running(running) => running,
        };

        let exit = match running.child.wait_timeout(timeout)? {
            Some(exit) => exit,
            None => return Ok(SubmitStatus::Pending),
        };

        let previous = mem::replace(&mut self.state, HandleState::Finished(SubmitStatus::Pending));
        let status = match previous {
            HandleState::Running(running) => running.finish(exit)?,
            HandleState::Finished(status) => status,
        };
        self.state = HandleState::Finished(status.clone());

        Ok(status)
    }
}

impl Drop for SubmissionHandle {
    fn drop(&mut self) {
        let HandleState::Running(mut running) =
            mem::replace(&mut self.state, HandleState::Finished(SubmitStatus::Pending))
        else {
            return;
        };
        let command = mem::take(&mut self.command);

        let reaper = thread::Builder::new()
            .name("submission-reaper".into())
            .spawn(move || match running.child.wait() {
                Ok(exit) => match running.finish(exit) {
                    Ok(SubmitStatus::Failed { code, stderr }) => {
                        warn!(code = ?code, stderr = stderr.as_str(), "Late {command} failed")
                    }
                    Ok(_) => debug!("Late {command} finished"),
                    Err(error) => warn!(error = ?error, "Failed to collect late {command}"),
                },
                Err(error) => warn!(error = ?error, "Failed to wait for late {command}"),
            });

        if let Err(error) = reaper {
            warn!(error = ?error, "Failed to start reaping a running submission");
        }
    }
}

pub(crate) fn read_pipe(pipe: Option<impl Read>) -> io::Result<String> {
    let mut buffer = Vec::new();

    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buffer)?;
    }

    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// The external scheduler as seen by the pacing loop.
pub trait SchedulerClient {
    /// launch the submission of a rendered job descriptor without waiting for it
    fn submit(&mut self, descriptor: &Path) -> Result<SubmissionHandle, SchedulerError>;

    /// current occupancy of `user`'s jobs
    fn query_occupancy(&mut self, user: &str) -> Result<QueueSnapshot, SchedulerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_summary_line() {
        let output = "ACTIVE JOBS\n\nTotal Jobs: 0   Active Jobs: 0   Idle Jobs: 0   Blocked Jobs: 0\n";

        let snapshot = QueueSnapshot::parse(output).unwrap();
        assert_eq!(snapshot, QueueSnapshot { idle: 0, blocked: 0 });
        assert!(snapshot.is_clear());

        let compact = QueueSnapshot::parse("header\nIdle Jobs: 0  Blocked Jobs: 0\n").unwrap();
        assert!(compact.is_clear());
    }

    #[test]
    fn busy_summary_line() {
        let output = "header\nTotal Jobs: 5   Active Jobs: 2   Idle Jobs: 3   Blocked Jobs: 0\n";

        let snapshot = QueueSnapshot::parse(output).unwrap();
        assert_eq!(snapshot, QueueSnapshot { idle: 3, blocked: 0 });
        assert!(!snapshot.is_clear());

        let blocked = QueueSnapshot::parse("Idle Jobs: 0  Blocked Jobs: 12\n").unwrap();
        assert!(!blocked.is_clear());

        // a leading zero must not be mistaken for an empty queue
        let padded = QueueSnapshot::parse("Idle Jobs: 05  Blocked Jobs: 0\n").unwrap();
        assert_eq!(padded.idle, 5);
    }

    #[test]
    fn summary_must_be_second_to_last() {
        // without a trailing newline the summary is the last element and not inspected
        assert!(matches!(
            QueueSnapshot::parse("header\nIdle Jobs: 0  Blocked Jobs: 0"),
            Err(SchedulerError::OccupancyParse { line }) if line == "header"
        ));
        assert!(QueueSnapshot::parse("Idle Jobs: 0  Blocked Jobs: 0\nfooter\n").is_err());
    }

    #[test]
    fn missing_markers_are_rejected() {
        assert!(matches!(
            QueueSnapshot::parse("showq: command failed\n"),
            Err(SchedulerError::OccupancyParse { .. })
        ));
        assert!(QueueSnapshot::parse("Idle Jobs: 0\n").is_err());
        assert!(QueueSnapshot::parse("Idle Jobs: n/a  Blocked Jobs: 0\n").is_err());
        assert!(QueueSnapshot::parse("").is_err());
    }

    #[test]
    fn finished_handles_report_their_status() {
        let mut handle = SubmissionHandle::finished(
            "qsub",
            SubmitStatus::Failed {
                code: Some(1),
                stderr: "qsub: would exceed queue limit".into(),
            },
        );

        assert_eq!(handle.command(), "qsub");
        assert!(matches!(
            handle.check(Duration::ZERO).unwrap(),
            SubmitStatus::Failed { code: Some(1), .. }
        ));
    }
}
