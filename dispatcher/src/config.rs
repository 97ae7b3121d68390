use crate::planner::TaskRange;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

/// resolve a command either as a path or by searching `PATH`
pub fn resolve_executable(exec: &Path) -> Option<PathBuf> {
    if exec.components().count() > 1 {
        return Some(exec.to_path_buf())
            .filter(|path| matches!(check_executable(path), Ok(true)));
    }

    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(exec))
            .find(|candidate| matches!(check_executable(candidate), Ok(true)))
    })
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {path:?}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("Config file is invalid")]
    InvalidConfig(#[from] serde_yaml::Error),
    #[error("Task range start ({start}) must not be past its end ({end})")]
    InvertedTaskRange { start: u64, end: u64 },
    #[error("Window size must be at least 1")]
    ZeroWindow,
    #[error("scheduler.user must not be empty")]
    MissingUser,
    #[error("Template tokens must be non-empty and neither may contain the other ({start:?}, {end:?})")]
    CollidingTokens { start: String, end: String },
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    // jobs directory, submissions are started from here
    pub work_dir: PathBuf,
    pub template: TemplateConfig,
    pub tasks: TaskRange,
    // number of task indices per array job
    #[serde(default = "default_window")]
    pub window: u64,
    // seconds between two occupancy probes while the queue is busy, 0 polls without pause
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    // seconds to wait after a submission before the first probe
    #[serde(default = "default_settle_delay")]
    pub settle_delay: u64,
    // fail the preflight checks if `work_dir/new` holds no task directories
    #[serde(default = "default_require_tasks")]
    pub require_tasks: bool,
    pub scheduler: SchedulerConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct TemplateConfig {
    pub path: PathBuf,
    #[serde(default = "default_start_token")]
    pub start_token: String,
    #[serde(default = "default_end_token")]
    pub end_token: String,
    // rendered descriptor, relative paths are resolved against work_dir
    pub output: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_submit_command")]
    pub submit: CommandConfig,
    #[serde(default = "default_probe_command")]
    pub probe: CommandConfig,
    // owner of the jobs whose occupancy gates the next submission
    pub user: String,
    // milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,
    // milliseconds
    #[serde(default = "default_submit_timeout")]
    pub submit_timeout: u64,
    #[serde(default)]
    pub on_submit_failure: SubmitFailurePolicy,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubmitFailurePolicy {
    /// stop dispatching, the window has to be resubmitted by hand
    #[default]
    Abort,
    /// log the failure and go on with the next window
    Warn,
}

/// values given on the command line which take precedence over the config file
#[derive(Clone, Copy, Debug, Default)]
pub struct Overrides {
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub window: Option<u64>,
}

impl DispatchConfig {
    /// read, parse and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigErrors::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigErrors> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigErrors> {
        TaskRange::new(self.tasks.start, self.tasks.end)?;

        if self.window == 0 {
            return Err(ConfigErrors::ZeroWindow);
        }

        if self.scheduler.user.trim().is_empty() {
            return Err(ConfigErrors::MissingUser);
        }

        let (start, end) = (&self.template.start_token, &self.template.end_token);
        if start.is_empty() || end.is_empty() || start.contains(end.as_str()) || end.contains(start.as_str())
        {
            return Err(ConfigErrors::CollidingTokens {
                start: start.clone(),
                end: end.clone(),
            });
        }

        Ok(())
    }

    /// apply command line overrides and validate the result again
    pub fn apply(&mut self, overrides: Overrides) -> Result<(), ConfigErrors> {
        if let Some(start) = overrides.start {
            self.tasks.start = start;
        }
        if let Some(end) = overrides.end {
            self.tasks.end = end;
        }
        if let Some(window) = overrides.window {
            self.window = window;
        }

        self.validate()
    }

    /// location the rendered job descriptor is written to before every submission
    pub fn descriptor_path(&self) -> PathBuf {
        match (&self.template.output, self.template.path.file_name()) {
            (Some(output), _) => self.work_dir.join(output),
            (None, Some(file_name)) => self.work_dir.join(file_name),
            (None, None) => self.work_dir.join("job"),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay)
    }

    /// check everything that has to exist before the first submission
    /// returns true if at least one check failed
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        match self.template.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            Some(dir) if !dir.is_dir() => {
                error!(
                    "Templates directory does not exist, the template is expected at {}",
                    self.template.path.to_string_lossy()
                );
                contains_error = true;
            }
            _ => {
                if !self.template.path.is_file() {
                    error!(
                        "template.path ({}) is not a file",
                        self.template.path.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        if !self.work_dir.is_dir() {
            error!(
                "work_dir ({}) is not a directory",
                self.work_dir.to_string_lossy()
            );
            contains_error = true;
        } else {
            let new_jobs = self.work_dir.join("new");

            match count_task_dirs(&new_jobs) {
                Ok(0) | Err(_) if self.require_tasks => {
                    error!(
                        "No jobs in {}, please make sure that your jobs are in that folder",
                        new_jobs.to_string_lossy()
                    );
                    contains_error = true;
                }
                Ok(0) | Err(_) => {
                    warn!("No jobs in {}, dispatching anyway", new_jobs.to_string_lossy());
                }
                Ok(count) => debug!("Found {count} task directories in {new_jobs:?}"),
            }
        }

        for (name, command) in [
            ("submit", &self.scheduler.submit),
            ("probe", &self.scheduler.probe),
        ] {
            match resolve_executable(&command.exec) {
                Some(path) => debug!("scheduler.{name} resolved to {path:?}"),
                None => {
                    error!(
                        "Failed to find scheduler.{name}.exec ({}). Either not a file or not on PATH",
                        command.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        contains_error
    }
}

fn count_task_dirs(path: &Path) -> Result<usize, Error> {
    let mut count = 0;

    for entry in fs::read_dir(path)? {
        if entry?.file_type()?.is_dir() {
            count += 1;
        }
    }

    Ok(count)
}

fn default_window() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    300
}

fn default_settle_delay() -> u64 {
    3
}

fn default_require_tasks() -> bool {
    true
}

fn default_start_token() -> String {
    String::from("tmpTSTART")
}

fn default_end_token() -> String {
    String::from("tmpTEND")
}

fn default_submit_command() -> CommandConfig {
    CommandConfig {
        exec: PathBuf::from("qsub"),
        params: Vec::new(),
    }
}

fn default_probe_command() -> CommandConfig {
    CommandConfig {
        exec: PathBuf::from("showq"),
        params: vec![String::from("-u")],
    }
}

fn default_probe_timeout() -> u64 {
    30_000
}

fn default_submit_timeout() -> u64 {
    10_000
}
