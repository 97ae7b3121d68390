use crate::config::ConfigErrors;
use serde::{Deserialize, Serialize};
use std::{fmt, iter::FusedIterator};

/// inclusive range of task indices that is dispatched over a whole session
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TaskRange {
    pub start: u64,
    pub end: u64,
}

impl TaskRange {
    pub fn new(start: u64, end: u64) -> Result<Self, ConfigErrors> {
        if start > end {
            Err(ConfigErrors::InvertedTaskRange { start, end })
        } else {
            Ok(Self { start, end })
        }
    }
}

impl fmt::Display for TaskRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// a contiguous slice of the task range, submitted as a single array job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    pub index: u64,
    pub lo_start: u64,
    pub lo_end: u64,
}

impl BatchWindow {
    pub fn task_count(&self) -> u64 {
        self.lo_end - self.lo_start + 1
    }
}

impl fmt::Display for BatchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {}-{}", self.lo_start, self.lo_end)
    }
}

/// Splits a task range into windows of `step` indices.
///
/// The windows are handed out one at a time and the planner can't be rewound,
/// every call to `next` advances the dispatch. Only the final window may be
/// shorter than `step`, and it always ends exactly on `TaskRange::end`.
#[derive(Debug, Clone)]
pub struct BatchPlanner {
    range: TaskRange,
    step: u64,
    windows: u64,
    next: u64,
}

impl BatchPlanner {
    pub fn new(range: TaskRange, step: u64) -> Result<Self, ConfigErrors> {
        let range = TaskRange::new(range.start, range.end)?;

        if step == 0 {
            return Err(ConfigErrors::ZeroWindow);
        }

        // ceil((end - start + 1) / step) without overflowing on the full u64 range
        let windows = (range.end - range.start) / step + 1;

        Ok(Self {
            range,
            step,
            windows,
            next: 0,
        })
    }

    pub fn range(&self) -> TaskRange {
        self.range
    }

    /// configured task count per window, only the last one may be shorter
    pub fn window_size(&self) -> u64 {
        self.step
    }

    /// total number of windows, including the ones already handed out
    pub fn window_count(&self) -> u64 {
        self.windows
    }

    /// windows not yet handed out
    pub fn remaining(&self) -> u64 {
        self.windows - self.next
    }
}

impl Iterator for BatchPlanner {
    type Item = BatchWindow;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == self.windows {
            return None;
        }

        let index = self.next;
        let lo_start = self.range.start + index * self.step;
        let lo_end = if index + 1 == self.windows {
            self.range.end
        } else {
            lo_start + self.step - 1
        };

        self.next += 1;

        Some(BatchWindow {
            index,
            lo_start,
            lo_end,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match usize::try_from(self.remaining()) {
            Ok(remaining) => (remaining, Some(remaining)),
            Err(_) => (usize::MAX, None),
        }
    }
}

impl FusedIterator for BatchPlanner {}
