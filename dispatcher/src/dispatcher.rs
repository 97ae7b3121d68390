use crate::{
    config::{ConfigErrors, DispatchConfig, SubmitFailurePolicy},
    eta::{format_duration, EtaEstimator},
    planner::{BatchPlanner, BatchWindow, TaskRange},
    render::{Placeholders, RenderError, Renderer},
    scheduler::{SchedulerClient, SchedulerError, SubmissionHandle, SubmitStatus},
    sync::CancellationToken,
};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to render the job descriptor for {window}")]
    Render {
        window: BatchWindow,
        #[source]
        source: RenderError,
    },
    #[error("Scheduler failed for {window}")]
    Scheduler {
        window: BatchWindow,
        // whether the window reached the scheduler before the failure
        submitted: bool,
        #[source]
        source: SchedulerError,
    },
}

impl DispatchError {
    /// first task index that has not been submitted
    pub fn resume_from(&self) -> u64 {
        match self {
            Self::Render { window, .. }
            | Self::Scheduler {
                window,
                submitted: false,
                ..
            } => window.lo_start,
            Self::Scheduler { window, .. } => window.lo_end + 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Planning,
    Submitting(BatchWindow),
    Polling {
        window: BatchWindow,
        submitted_at: Instant,
    },
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed {
        windows: u64,
        elapsed: Duration,
    },
    /// stopped between two windows, `resume_from` is None if nothing is left to submit
    Cancelled {
        windows: u64,
        resume_from: Option<u64>,
        elapsed: Duration,
    },
}

/// everything that belongs to a single run, discarded once the run ends
#[derive(Debug)]
pub struct DispatchSession {
    pub task_range: TaskRange,
    pub window_size: u64,
    pub poll_interval: Duration,
    pub batches_submitted: u64,
    pub eta: EtaEstimator,
    pub started: Instant,
}

/// Submits one window at a time and only moves on to the next window once the
/// user's queue holds neither idle nor blocked jobs.
#[derive(Debug)]
pub struct PacingController<S: SchedulerClient> {
    client: S,
    planner: BatchPlanner,
    renderer: Renderer,
    session: DispatchSession,
    state: DispatchState,
    cancel: CancellationToken,
    // submissions still running after submit_timeout
    outstanding: Vec<(BatchWindow, SubmissionHandle)>,
    user: String,
    start_token: String,
    end_token: String,
    settle_delay: Duration,
    submit_timeout: Duration,
    on_submit_failure: SubmitFailurePolicy,
}

impl<S: SchedulerClient> PacingController<S> {
    pub fn new(
        config: &DispatchConfig,
        client: S,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigErrors> {
        let planner = BatchPlanner::new(config.tasks, config.window)?;

        Ok(Self {
            client,
            renderer: Renderer::new(&config.template.path, config.descriptor_path()),
            session: DispatchSession {
                task_range: planner.range(),
                window_size: planner.window_size(),
                poll_interval: config.poll_interval(),
                batches_submitted: 0,
                eta: EtaEstimator::new(),
                started: Instant::now(),
            },
            planner,
            state: DispatchState::Planning,
            cancel,
            outstanding: Vec::new(),
            user: config.scheduler.user.clone(),
            start_token: config.template.start_token.clone(),
            end_token: config.template.end_token.clone(),
            settle_delay: config.settle_delay(),
            submit_timeout: Duration::from_millis(config.scheduler.submit_timeout),
            on_submit_failure: config.scheduler.on_submit_failure,
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> DispatchState {
        self.state
    }

    #[cfg(test)]
    pub fn session(&self) -> &DispatchSession {
        &self.session
    }

    /// drive the state machine until every window is submitted, an error occurs or the run is cancelled
    #[instrument(skip(self), level = "info", fields(tasks = %self.session.task_range, window = self.session.window_size))]
    pub fn run(&mut self) -> Result<DispatchOutcome, DispatchError> {
        self.session.started = Instant::now();
        info!(
            "Dispatching {} windows, polling every {}",
            self.planner.window_count(),
            format_duration(self.session.poll_interval)
        );

        loop {
            if self.state != DispatchState::Done && self.cancel.is_cancelled() {
                return Ok(self.cancelled(self.next_unsubmitted()));
            }

            self.state = match self.state {
                DispatchState::Planning => match self.planner.next() {
                    Some(window) => DispatchState::Submitting(window),
                    None => DispatchState::Done,
                },
                DispatchState::Submitting(window) => {
                    let submitted_at = Instant::now();
                    let mut handle = self.submit(window)?;

                    // give the scheduler time to register the job before looking at the queue
                    if !self.cancel.sleep(self.settle_delay) {
                        // a submission that already failed has to be repeated on resume
                        let resume_from = if matches!(
                            handle.check(Duration::ZERO),
                            Ok(SubmitStatus::Failed { .. })
                        ) {
                            Some(window.lo_start)
                        } else {
                            self.session.batches_submitted += 1;
                            (self.planner.remaining() > 0).then(|| window.lo_end + 1)
                        };

                        return Ok(self.cancelled(resume_from));
                    }

                    if self.confirm(window, &mut handle)? == SubmitStatus::Pending {
                        self.outstanding.push((window, handle));
                    }
                    self.session.batches_submitted += 1;

                    if self.planner.remaining() == 0 {
                        self.finish_batch(submitted_at);
                        DispatchState::Done
                    } else {
                        DispatchState::Polling {
                            window,
                            submitted_at,
                        }
                    }
                }
                DispatchState::Polling {
                    window,
                    submitted_at,
                } => {
                    let snapshot = self.client.query_occupancy(&self.user).map_err(|source| {
                        DispatchError::Scheduler {
                            window,
                            submitted: true,
                            source,
                        }
                    })?;

                    if snapshot.is_clear() {
                        self.finish_batch(submitted_at);
                        DispatchState::Planning
                    } else {
                        info!(
                            idle = snapshot.idle,
                            blocked = snapshot.blocked,
                            "There are still idle and blocked jobs after {}",
                            format_duration(whole_seconds(submitted_at.elapsed()))
                        );

                        if !self.cancel.sleep(self.session.poll_interval) {
                            return Ok(self.cancelled(Some(window.lo_end + 1)));
                        }

                        DispatchState::Polling {
                            window,
                            submitted_at,
                        }
                    }
                }
                DispatchState::Done => {
                    self.collect_outstanding();

                    return Ok(DispatchOutcome::Completed {
                        windows: self.session.batches_submitted,
                        elapsed: self.session.started.elapsed(),
                    });
                }
            };
        }
    }

    fn placeholders(&self, window: BatchWindow) -> Placeholders {
        Placeholders::from([
            (self.start_token.clone(), window.lo_start.to_string()),
            (self.end_token.clone(), window.lo_end.to_string()),
        ])
    }

    fn submit(&mut self, window: BatchWindow) -> Result<SubmissionHandle, DispatchError> {
        self.renderer
            .render(&self.placeholders(window))
            .map_err(|source| DispatchError::Render { window, source })?;

        info!(
            tasks = window.task_count(),
            "Submitting {window} ({}/{})",
            window.index + 1,
            self.planner.window_count()
        );

        self.client
            .submit(self.renderer.output())
            .map_err(|source| DispatchError::Scheduler {
                window,
                submitted: false,
                source,
            })
    }

    /// look at the exit status of the submission, a failure is handled according to the policy
    fn confirm(
        &self,
        window: BatchWindow,
        handle: &mut SubmissionHandle,
    ) -> Result<SubmitStatus, DispatchError> {
        let status = handle
            .check(self.submit_timeout)
            .map_err(|source| DispatchError::Scheduler {
                window,
                submitted: false,
                source,
            })?;

        match &status {
            SubmitStatus::Accepted => debug!("Submission of {window} accepted"),
            SubmitStatus::Pending => warn!(
                "{} is still running after {:?}, assuming {window} was accepted",
                handle.command(),
                self.submit_timeout
            ),
            SubmitStatus::Failed { code, stderr } => match self.on_submit_failure {
                SubmitFailurePolicy::Abort => {
                    return Err(DispatchError::Scheduler {
                        window,
                        submitted: false,
                        source: SchedulerError::ExternalCommandFailed {
                            command: handle.command().to_owned(),
                            code: *code,
                            stderr: stderr.clone(),
                        },
                    })
                }
                SubmitFailurePolicy::Warn => warn!(
                    code = ?code,
                    stderr = stderr.as_str(),
                    "Submission of {window} failed, continuing with the next window"
                ),
            },
        }

        Ok(status)
    }

    /// give late submissions one more timeout before the run ends
    fn collect_outstanding(&mut self) {
        for (window, mut handle) in self.outstanding.drain(..) {
            match handle.check(self.submit_timeout) {
                Ok(SubmitStatus::Accepted) => debug!("Late submission of {window} accepted"),
                Ok(SubmitStatus::Pending) => {
                    warn!("{} for {window} is still running", handle.command())
                }
                Ok(SubmitStatus::Failed { code, stderr }) => warn!(
                    code = ?code,
                    stderr = stderr,
                    "Late submission of {window} failed, resubmit it with --start {} --end {}",
                    window.lo_start,
                    window.lo_end
                ),
                Err(error) => warn!(error = ?error, "Failed to check the submission of {window}"),
            }
        }
    }

    fn finish_batch(&mut self, submitted_at: Instant) {
        self.session.eta.record_batch(submitted_at.elapsed());

        let remaining = self.planner.remaining();
        let estimate = self
            .session
            .eta
            .estimate_remaining(remaining)
            .map(|estimate| format_duration(whole_seconds(estimate)))
            .unwrap_or_else(|| String::from("unknown"));

        info!(
            "{}/{} windows submitted, {remaining} remaining, estimated time remaining: {estimate}",
            self.session.batches_submitted,
            self.planner.window_count()
        );
    }

    /// first task index that was not handed to the scheduler yet
    fn next_unsubmitted(&self) -> Option<u64> {
        match self.state {
            DispatchState::Planning => {
                let handed_out = self.planner.window_count() - self.planner.remaining();

                (self.planner.remaining() > 0)
                    .then(|| self.session.task_range.start + handed_out * self.session.window_size)
            }
            DispatchState::Submitting(window) => Some(window.lo_start),
            DispatchState::Polling { window, .. } => Some(window.lo_end + 1),
            DispatchState::Done => None,
        }
    }

    fn cancelled(&self, resume_from: Option<u64>) -> DispatchOutcome {
        DispatchOutcome::Cancelled {
            windows: self.session.batches_submitted,
            resume_from,
            elapsed: self.session.started.elapsed(),
        }
    }
}

pub fn whole_seconds(duration: Duration) -> Duration {
    Duration::from_secs(duration.as_secs())
}
