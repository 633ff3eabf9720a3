// Drivetrain kinematics for the supported wheel topologies
// Converts body-frame velocities (x, y, omega) to per-motor RPM targets, and
// accumulated encoder ticks back to body-frame displacement.
//
// Every topology is reduced to a Jacobian: one row per wheel mapping the body
// velocity [x, y, omega] to that wheel's rim speed. Forward kinematics is the
// row product, progress is the least-squares solve of the same rows, so the two
// are exact inverses for any motion the wheels can actually produce.

use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

use super::MotorSlot;
use crate::error::ConfigurationError;

/// Omni wheel rolling directions (degrees) with -90° offset
/// Left wheel at 240°, Right wheel at 120°, Back wheel at 0°
const OMNI_WHEEL_ANGLES_DEG: [f32; 3] = [240.0 - 90.0, 120.0 - 90.0, 0.0 - 90.0];

const RAD_S_TO_RPM: f32 = 60.0 / (2.0 * PI);

/// Body-frame velocity: x forward (m/s), y left (m/s), omega counter-clockwise (rad/s)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BodyVelocity {
    pub x: f32,
    pub y: f32,
    pub omega: f32,
}

impl BodyVelocity {
    pub fn new(x: f32, y: f32, omega: f32) -> Self {
        Self { x, y, omega }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// From host units: cm/s, cm/s, deg/s
    pub fn from_command(x_cms: i32, y_cms: i32, w_degs: i32) -> Self {
        Self::new(
            x_cms as f32 / 100.0,
            y_cms as f32 / 100.0,
            (w_degs as f32).to_radians(),
        )
    }

    pub fn scale(self, k: f32) -> Self {
        Self::new(self.x * k, self.y * k, self.omega * k)
    }
}

/// Body-frame displacement: x, y in meters, theta in radians
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Displacement {
    pub x: f32,
    pub y: f32,
    pub theta: f32,
}

impl Displacement {
    pub fn new(x: f32, y: f32, theta: f32) -> Self {
        Self { x, y, theta }
    }

    /// From host units: meters, meters, degrees
    pub fn from_command(x_m: i32, y_m: i32, omega_deg: i32) -> Self {
        Self::new(x_m as f32, y_m as f32, (omega_deg as f32).to_radians())
    }

    /// Straight-line length of the translational part
    pub fn linear(&self) -> f32 {
        self.x.hypot(self.y)
    }
}

/// Per-slot RPM targets, `None` for slots the drive base does not use
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WheelTargets {
    rpm: [Option<f32>; MotorSlot::COUNT],
}

impl WheelTargets {
    pub fn get(&self, slot: MotorSlot) -> Option<f32> {
        self.rpm[slot.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (MotorSlot, f32)> + '_ {
        MotorSlot::ALL
            .into_iter()
            .filter_map(|slot| self.get(slot).map(|rpm| (slot, rpm)))
    }

    /// Largest absolute target
    pub fn peak(&self) -> f32 {
        self.iter().map(|(_, rpm)| rpm.abs()).fold(0.0f32, f32::max)
    }

    /// Scale every wheel by the same factor so none exceeds `limit`.
    /// Clamping wheels individually would change the direction of travel.
    pub fn saturate(mut self, limit: f32) -> Self {
        let peak = self.peak();
        if peak > limit {
            let scale = limit / peak;
            for rpm in self.rpm.iter_mut().flatten() {
                *rpm *= scale;
            }
        }
        self
    }
}

/// The active wheel topology with its geometry (mm) and motor assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topology", rename_all = "snake_case")]
pub enum Drivetrain {
    /// Three omni wheels 120° apart, `robot_radius_mm` from the center
    Omni {
        wheel_radius_mm: u32,
        robot_radius_mm: u32,
        left: MotorSlot,
        right: MotorSlot,
        back: MotorSlot,
    },
    /// Four mecanum wheels. `robot_x_mm` and `robot_y_mm` are the distances from
    /// the center to the wheel contact points along and across the direction of travel.
    Mecanum {
        wheel_radius_mm: u32,
        robot_x_mm: u32,
        robot_y_mm: u32,
        front_left: MotorSlot,
        front_right: MotorSlot,
        back_left: MotorSlot,
        back_right: MotorSlot,
    },
    /// Two driven wheels `wheel_distance_mm` apart
    Differential2 {
        wheel_radius_mm: u32,
        wheel_distance_mm: u32,
        left: MotorSlot,
        right: MotorSlot,
    },
    /// Skid steer, both wheels on a side driven together
    Differential4 {
        wheel_radius_mm: u32,
        wheel_distance_mm: u32,
        front_left: MotorSlot,
        front_right: MotorSlot,
        back_left: MotorSlot,
        back_right: MotorSlot,
    },
}

fn mm(value: u32) -> f32 {
    value as f32 / 1000.0
}

impl Drivetrain {
    pub fn name(&self) -> &'static str {
        match self {
            Drivetrain::Omni { .. } => "omni",
            Drivetrain::Mecanum { .. } => "mecanum",
            Drivetrain::Differential2 { .. } => "differential-2",
            Drivetrain::Differential4 { .. } => "differential-4",
        }
    }

    /// Geometry must be positive and every wheel needs its own motor
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (name, value) in self.geometry() {
            if value == 0 {
                return Err(ConfigurationError::NonPositiveGeometry(name));
            }
        }

        let slots = self.slots();
        for (i, slot) in slots.iter().enumerate() {
            if slots[..i].contains(slot) {
                return Err(ConfigurationError::DuplicateSlot(*slot));
            }
        }
        Ok(())
    }

    fn geometry(&self) -> Vec<(&'static str, u32)> {
        match *self {
            Drivetrain::Omni {
                wheel_radius_mm,
                robot_radius_mm,
                ..
            } => vec![
                ("wheel radius", wheel_radius_mm),
                ("robot radius", robot_radius_mm),
            ],
            Drivetrain::Mecanum {
                wheel_radius_mm,
                robot_x_mm,
                robot_y_mm,
                ..
            } => vec![
                ("wheel radius", wheel_radius_mm),
                ("robot x", robot_x_mm),
                ("robot y", robot_y_mm),
            ],
            Drivetrain::Differential2 {
                wheel_radius_mm,
                wheel_distance_mm,
                ..
            }
            | Drivetrain::Differential4 {
                wheel_radius_mm,
                wheel_distance_mm,
                ..
            } => vec![
                ("wheel radius", wheel_radius_mm),
                ("wheel distance", wheel_distance_mm),
            ],
        }
    }

    /// Motor slots in wheel order
    pub fn slots(&self) -> Vec<MotorSlot> {
        self.jacobian().into_iter().map(|(slot, _)| slot).collect()
    }

    pub fn uses(&self, slot: MotorSlot) -> bool {
        self.slots().contains(&slot)
    }

    /// Whether lateral (y) motion is possible at all
    pub fn is_holonomic(&self) -> bool {
        matches!(self, Drivetrain::Omni { .. } | Drivetrain::Mecanum { .. })
    }

    fn wheel_radius_m(&self) -> f32 {
        match *self {
            Drivetrain::Omni {
                wheel_radius_mm, ..
            }
            | Drivetrain::Mecanum {
                wheel_radius_mm, ..
            }
            | Drivetrain::Differential2 {
                wheel_radius_mm, ..
            }
            | Drivetrain::Differential4 {
                wheel_radius_mm, ..
            } => mm(wheel_radius_mm),
        }
    }

    /// One row per wheel: rim speed (m/s) = row · [x, y, omega]
    fn jacobian(&self) -> Vec<(MotorSlot, [f32; 3])> {
        match *self {
            Drivetrain::Omni {
                robot_radius_mm,
                left,
                right,
                back,
                ..
            } => {
                let base_radius = mm(robot_radius_mm);
                [left, right, back]
                    .into_iter()
                    .zip(OMNI_WHEEL_ANGLES_DEG)
                    .map(|(slot, angle_deg)| {
                        let angle = angle_deg.to_radians();
                        (slot, [angle.cos(), angle.sin(), base_radius])
                    })
                    .collect()
            }
            Drivetrain::Mecanum {
                robot_x_mm,
                robot_y_mm,
                front_left,
                front_right,
                back_left,
                back_right,
                ..
            } => {
                let k = mm(robot_x_mm) + mm(robot_y_mm);
                vec![
                    (front_left, [1.0, -1.0, -k]),
                    (front_right, [1.0, 1.0, k]),
                    (back_left, [1.0, 1.0, -k]),
                    (back_right, [1.0, -1.0, k]),
                ]
            }
            Drivetrain::Differential2 {
                wheel_distance_mm,
                left,
                right,
                ..
            } => {
                let half_track = mm(wheel_distance_mm) / 2.0;
                vec![
                    (left, [1.0, 0.0, -half_track]),
                    (right, [1.0, 0.0, half_track]),
                ]
            }
            Drivetrain::Differential4 {
                wheel_distance_mm,
                front_left,
                front_right,
                back_left,
                back_right,
                ..
            } => {
                let half_track = mm(wheel_distance_mm) / 2.0;
                vec![
                    (front_left, [1.0, 0.0, -half_track]),
                    (back_left, [1.0, 0.0, -half_track]),
                    (front_right, [1.0, 0.0, half_track]),
                    (back_right, [1.0, 0.0, half_track]),
                ]
            }
        }
    }

    /// Body velocity to unclamped per-motor RPM targets.
    /// Differential topologies have no lateral column, `v.y` has no effect there.
    pub fn forward(&self, v: BodyVelocity) -> WheelTargets {
        let wheel_radius = self.wheel_radius_m();
        let mut targets = WheelTargets::default();

        for (slot, row) in self.jacobian() {
            // Linear rim speed (m/s) -> wheel angular speed (rad/s) -> RPM
            let rim_speed = row[0] * v.x + row[1] * v.y + row[2] * v.omega;
            targets.rpm[slot.index()] = Some(rim_speed / wheel_radius * RAD_S_TO_RPM);
        }
        targets
    }

    /// Body displacement achieved by the given per-slot tick deltas
    pub fn inverse_progress(
        &self,
        tick_deltas: &[i64; MotorSlot::COUNT],
        ticks_per_revolution: u32,
    ) -> Displacement {
        let circumference = 2.0 * std::f64::consts::PI * self.wheel_radius_m() as f64;
        let rows = self.jacobian();

        // Unknown columns: differential bases cannot move sideways, so y is not solved for
        let unknowns: &[usize] = if self.is_holonomic() {
            &[0, 1, 2]
        } else {
            &[0, 2]
        };

        // Normal equations (JᵀJ) u = Jᵀ s over the unknown columns
        let mut a = [[0.0f64; 3]; 3];
        let mut b = [0.0f64; 3];
        for (slot, row) in &rows {
            let rim_distance =
                tick_deltas[slot.index()] as f64 / ticks_per_revolution as f64 * circumference;
            for (i, &ci) in unknowns.iter().enumerate() {
                b[i] += row[ci] as f64 * rim_distance;
                for (j, &cj) in unknowns.iter().enumerate() {
                    a[i][j] += row[ci] as f64 * row[cj] as f64;
                }
            }
        }

        let solution = solve(a, b, unknowns.len());
        let mut body = [0.0f64; 3];
        for (i, &ci) in unknowns.iter().enumerate() {
            body[ci] = solution[i];
        }
        Displacement::new(body[0] as f32, body[1] as f32, body[2] as f32)
    }
}

/// Gaussian elimination with partial pivoting on the leading n×n block.
/// A singular system (only reachable with degenerate geometry) solves to zero.
fn solve(mut a: [[f64; 3]; 3], mut b: [f64; 3], n: usize) -> [f64; 3] {
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < 1e-12 {
            return [0.0; 3];
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0f64; 3];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    x
}
