//! Scrubbing over the recorded steps of a task
//!
//! Everything here is derived from the task's history and cursor; moving the
//! cursor always goes through [`AssemblyTask::set_current_step`] so observers
//! get their step notification.

use crate::lib::task::{AssemblyTask, StepRef, TaskError};
use nalgebra::Vector3;

/// Snapshot of the scrubber position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackState {
    pub current_step: i64,
    pub recorded_steps: usize,
    pub total_steps: u32,
}

impl PlaybackState {
    pub fn from_task(task: &AssemblyTask) -> Self {
        Self {
            current_step: task.current_step(),
            recorded_steps: task.history_len(),
            total_steps: task.total_steps(),
        }
    }

    /// Fraction of the expected steps received so far
    pub fn progress(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        (self.recorded_steps as f64 / f64::from(self.total_steps)).min(1.0)
    }

    /// Last valid cursor position
    pub fn last_step(&self) -> i64 {
        self.recorded_steps as i64 - 1
    }

    pub fn is_at_start(&self) -> bool {
        self.current_step <= -2
    }

    pub fn is_at_end(&self) -> bool {
        self.current_step >= self.last_step()
    }

    /// Label for the scrubber, e.g. "Input", "Initial" or "Step 3/20"
    pub fn label(&self) -> String {
        match StepRef::from_cursor(self.current_step) {
            Some(StepRef::RawInput) | None => "Input".to_string(),
            Some(StepRef::Initial) => "Initial".to_string(),
            Some(StepRef::Optimized(s)) => format!("Step {}/{}", s + 1, self.total_steps),
        }
    }
}

impl AssemblyTask {
    fn move_to(&mut self, step: i64) -> bool {
        if step == self.current_step() {
            return false;
        }
        self.set_current_step(step).is_ok()
    }

    /// Advance one step. Returns false at the end of the history.
    pub fn next_step(&mut self) -> bool {
        let state = PlaybackState::from_task(self);
        if state.is_at_end() {
            return false;
        }
        self.move_to(state.current_step + 1)
    }

    /// Go back one step. Returns false at the raw input.
    pub fn previous_step(&mut self) -> bool {
        let state = PlaybackState::from_task(self);
        if state.is_at_start() {
            return false;
        }
        self.move_to(state.current_step - 1)
    }

    /// Jump to the raw input
    pub fn first_step(&mut self) -> bool {
        self.move_to(-2)
    }

    /// Jump to the latest recorded step (or the initial pose if none)
    pub fn last_step(&mut self) -> bool {
        let last = PlaybackState::from_task(self).last_step();
        self.move_to(last)
    }

    /// Jump to a position on the scrubber, `0.0` = raw input, `1.0` = latest
    pub fn jump_to_percentage(&mut self, percentage: f64) -> bool {
        let last = PlaybackState::from_task(self).last_step();
        let span = (last + 2) as f64;
        let offset = (percentage.clamp(0.0, 1.0) * span).round() as i64;
        self.move_to(-2 + offset)
    }
}

/// Positions a fragment passed through on steps `0..=upto`
///
/// Uses the translation of the normalized pose; `upto` is clamped to the
/// recorded history.
pub fn trail_points(
    task: &AssemblyTask,
    fragment: usize,
    upto: usize,
) -> Result<Vec<Vector3<f64>>, TaskError> {
    let history = task.get_transformations(fragment)?;
    Ok(history
        .iter()
        .take(upto.saturating_add(1))
        .map(|pose| *pose.translation())
        .collect())
}
