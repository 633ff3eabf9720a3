// Drive action state machine
//
// Idle -> Running on any motion command. A new command while Running replaces
// the action silently. Completion passes through Completing so the owner can
// halt the motors before the callback fires, then finish() returns to Idle.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::motor::{BodyVelocity, Displacement, MotorSlot};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriveAction {
    /// Runs until stopped or superseded
    Continuous(BodyVelocity),
    Timed {
        velocity: BodyVelocity,
        duration: Duration,
    },
    /// `velocity` is fixed at start, only the remaining distance is re-evaluated
    Distance {
        target: Displacement,
        velocity: BodyVelocity,
        time_limit: Duration,
    },
}

impl DriveAction {
    pub fn kind(&self) -> &'static str {
        match self {
            DriveAction::Continuous(_) => "speed drive",
            DriveAction::Timed { .. } => "time drive",
            DriveAction::Distance { .. } => "distance drive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Elapsed,
    TargetReached,
    /// Distance drive ran past its time bound, partial motion is kept
    SafetyTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
    Completing,
}

/// How close a distance drive must get before it counts as done
/// Raw tick counts captured when an action starts. A wheel without a good
/// read yet is `None` until its first reading arrives.
pub type TickSnapshot = [Option<i64>; MotorSlot::COUNT];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub linear_m: f32,
    pub angle_rad: f32,
}

#[derive(Debug, Clone, Copy)]
struct Active {
    action: DriveAction,
    elapsed: Duration,
    start_ticks: TickSnapshot,
}

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    active: Option<Active>,
    completing: Option<CompletionReason>,
}

impl Scheduler {
    pub fn state(&self) -> SchedulerState {
        match (&self.active, &self.completing) {
            (_, Some(_)) => SchedulerState::Completing,
            (Some(_), None) => SchedulerState::Running,
            (None, None) => SchedulerState::Idle,
        }
    }

    pub fn action(&self) -> Option<&DriveAction> {
        self.active.as_ref().map(|active| &active.action)
    }

    /// Begin a new action. Returns the action it replaced, whose completion is never reported.
    pub fn start(
        &mut self,
        action: DriveAction,
        start_ticks: TickSnapshot,
    ) -> Option<DriveAction> {
        let previous = self.active.replace(Active {
            action,
            elapsed: Duration::ZERO,
            start_ticks,
        });
        self.completing = None;

        if let Some(prev) = &previous {
            debug!("{} superseded by {}", prev.action.kind(), action.kind());
        }
        info!("Starting {}: {:?}", action.kind(), action);
        previous.map(|prev| prev.action)
    }

    /// Drop the current action without completing it. Idempotent.
    pub fn stop(&mut self) -> Option<DriveAction> {
        self.completing = None;
        let stopped = self.active.take().map(|active| active.action);
        if let Some(action) = &stopped {
            info!("Stopped {}", action.kind());
        }
        stopped
    }

    /// Advance the action by `dt`. `progress` maps the raw tick counts captured at
    /// start to the displacement achieved so far and may fill in wheels that had no
    /// reading yet. It is only called for distance drives.
    pub fn evaluate(
        &mut self,
        dt: Duration,
        progress: impl FnOnce(&mut TickSnapshot) -> Displacement,
        tolerance: Tolerance,
    ) -> Option<CompletionReason> {
        let active = self.active.as_mut()?;
        active.elapsed += dt;

        let reason = match active.action {
            DriveAction::Continuous(_) => None,
            DriveAction::Timed { duration, .. } => {
                (active.elapsed >= duration).then_some(CompletionReason::Elapsed)
            }
            DriveAction::Distance {
                target, time_limit, ..
            } => {
                let achieved = progress(&mut active.start_ticks);
                if target_reached(&target, &achieved, tolerance) {
                    Some(CompletionReason::TargetReached)
                } else if active.elapsed >= time_limit {
                    Some(CompletionReason::SafetyTimeout)
                } else {
                    None
                }
            }
        }?;

        info!(
            "{} complete after {:.2}s: {:?}",
            active.action.kind(),
            active.elapsed.as_secs_f32(),
            reason
        );
        self.active = None;
        self.completing = Some(reason);
        Some(reason)
    }

    /// Completing -> Idle, once the motors are halted
    pub fn finish(&mut self) -> Option<CompletionReason> {
        self.completing.take()
    }
}

/// Progress is measured along the commanded direction, so sideways slip never
/// counts toward the target.
fn target_reached(target: &Displacement, achieved: &Displacement, tolerance: Tolerance) -> bool {
    let length = target.linear();
    let linear_done = length <= tolerance.linear_m || {
        let along = (achieved.x * target.x + achieved.y * target.y) / length;
        along >= length - tolerance.linear_m
    };

    let turn = target.theta.abs();
    let angle_done = turn <= tolerance.angle_rad
        || achieved.theta * target.theta.signum() >= turn - tolerance.angle_rad;

    linear_done && angle_done
}
