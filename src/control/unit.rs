// The control unit: public operations, the periodic control tick, and the
// limit switch interrupt entry point.
//
// All shared state sits behind one mutex. The tick holds it for a whole pass
// (PID -> duty writes -> encoder reads -> scheduler). The interrupt path only
// try-locks; edges that arrive while the tick runs wait in a bounded queue that
// the tick drains. If that queue is full, the latest level per line is kept
// instead so a final settle edge is never lost. Host callbacks always run after
// the lock is released, so they may call straight back into the unit.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::encoder::Tracker;
use super::limit_switch::{LimitEdge, LimitSwitchConfig, LimitSwitchEvent, LimitSwitchMonitor, SwitchState};
use super::pid::{PidController, PidGains};
use super::scheduler::{
    CompletionReason, DriveAction, Scheduler, SchedulerState, TickSnapshot, Tolerance,
};
use crate::config::{COMMAND_LIMIT, UnitConfig};
use crate::error::{AmcuError, OutOfRange, Result};
use crate::motor::{BodyVelocity, Displacement, Drivetrain, HardwareError, MotorActuator, MotorSlot};

pub type LimitSwitchHandler = Arc<dyn Fn(LimitSwitchEvent) + Send + Sync>;
pub type DriveActionHandler = Arc<dyn Fn(CompletionReason) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq)]
enum MotorCommand {
    /// Not driven by the unit
    Released,
    /// Open-loop duty, applied as is every tick
    Duty(i8),
    /// Closed-loop RPM target
    Rpm(f32),
}

struct UnitState {
    config: UnitConfig,
    actuator: Box<dyn MotorActuator + Send>,
    drivetrain: Option<Drivetrain>,
    gains: PidGains,
    pids: [PidController; MotorSlot::COUNT],
    commands: [MotorCommand; MotorSlot::COUNT],
    duties: [i8; MotorSlot::COUNT],
    tracker: Tracker,
    switches: LimitSwitchMonitor,
    scheduler: Scheduler,
    edges: mpsc::Receiver<LimitEdge>,
    on_limit: Option<LimitSwitchHandler>,
    on_drive: Option<DriveActionHandler>,
    faulted: bool,
}

// Overflow slot contents: no pending level, or the line's latest level
const NO_LEVEL: u8 = 0;
const LEVEL_LOW: u8 = 1;
const LEVEL_HIGH: u8 = 2;

pub struct ControlUnit {
    state: Mutex<UnitState>,
    edge_tx: mpsc::Sender<LimitEdge>,
    /// Latest level per line for edges that did not fit in the queue
    overflow: [AtomicU8; MotorSlot::COUNT],
}

impl ControlUnit {
    pub fn new(actuator: impl MotorActuator + Send + 'static, config: UnitConfig) -> Self {
        let (edge_tx, edges) = mpsc::channel(config.edge_queue_depth.max(1));
        let state = UnitState {
            gains: config.gains,
            tracker: Tracker::new(config.ticks_per_revolution, config.fault_threshold),
            switches: LimitSwitchMonitor::new(config.debounce()),
            config,
            actuator: Box::new(actuator),
            drivetrain: None,
            pids: Default::default(),
            commands: [MotorCommand::Released; MotorSlot::COUNT],
            duties: [0; MotorSlot::COUNT],
            scheduler: Scheduler::default(),
            edges,
            on_limit: None,
            on_drive: None,
            faulted: false,
        };
        Self {
            state: Mutex::new(state),
            edge_tx,
            overflow: Default::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, UnitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_lock(&self) -> Option<MutexGuard<'_, UnitState>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    // ---- Drive base setup ----

    pub fn init_omni_drive_base(
        &self,
        wheel_radius_mm: u32,
        robot_radius_mm: u32,
        left: MotorSlot,
        right: MotorSlot,
        back: MotorSlot,
    ) -> Result<()> {
        self.init_drive_base(Drivetrain::Omni {
            wheel_radius_mm,
            robot_radius_mm,
            left,
            right,
            back,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn init_mecanum_drive_base(
        &self,
        wheel_radius_mm: u32,
        robot_x_mm: u32,
        robot_y_mm: u32,
        front_left: MotorSlot,
        front_right: MotorSlot,
        back_left: MotorSlot,
        back_right: MotorSlot,
    ) -> Result<()> {
        self.init_drive_base(Drivetrain::Mecanum {
            wheel_radius_mm,
            robot_x_mm,
            robot_y_mm,
            front_left,
            front_right,
            back_left,
            back_right,
        })
    }

    pub fn init_differential_drive_base_2wheel(
        &self,
        wheel_radius_mm: u32,
        wheel_distance_mm: u32,
        left: MotorSlot,
        right: MotorSlot,
    ) -> Result<()> {
        self.init_drive_base(Drivetrain::Differential2 {
            wheel_radius_mm,
            wheel_distance_mm,
            left,
            right,
        })
    }

    pub fn init_differential_drive_base_4wheel(
        &self,
        wheel_radius_mm: u32,
        wheel_distance_mm: u32,
        front_left: MotorSlot,
        front_right: MotorSlot,
        back_left: MotorSlot,
        back_right: MotorSlot,
    ) -> Result<()> {
        self.init_drive_base(Drivetrain::Differential4 {
            wheel_radius_mm,
            wheel_distance_mm,
            front_left,
            front_right,
            back_left,
            back_right,
        })
    }

    /// Replace the active topology. Any running action is cancelled without a
    /// callback and a latched fault is cleared.
    pub fn init_drive_base(&self, drivetrain: Drivetrain) -> Result<()> {
        drivetrain.validate()?;

        let mut state = self.lock();
        if let Some(action) = state.scheduler.stop() {
            debug!("{} cancelled by drive base change", action.kind());
        }
        state.halt_all();
        state.tracker.clear_failures();
        state.faulted = false;

        // Baseline every wheel so the first distance drive measures from here
        for slot in drivetrain.slots() {
            let reading = state.actuator.read_ticks(slot);
            if let Err(e) = state.tracker.update(slot, reading, Duration::ZERO) {
                warn!("Initial encoder read on motor {} failed: {}", slot, e);
            }
        }

        state.drivetrain = Some(drivetrain);
        info!("Drive base configured: {} {:?}", drivetrain.name(), drivetrain);
        Ok(())
    }

    pub fn set_pid(&self, kp: f32, ki: f32, kd: f32) -> Result<()> {
        let mut state = self.lock();
        state.ready()?;
        state.gains = PidGains::new(kp, ki, kd);
        info!("PID gains set to kp={} ki={} kd={}", kp, ki, kd);
        Ok(())
    }

    pub fn set_limit_switches(
        &self,
        motor: MotorSlot,
        active_high: bool,
        enabled: bool,
        normally_closed: bool,
        debounce: bool,
    ) -> Result<()> {
        let mut state = self.lock();
        state.ready()?;
        state.switches.configure(
            motor,
            LimitSwitchConfig {
                active_high,
                enabled,
                normally_closed,
                debounce,
            },
        )?;
        Ok(())
    }

    // ---- Manual motor control ----

    /// Closed-loop target for one motor. Out-of-range values are clamped,
    /// the applied value is returned.
    pub fn set_rpm(&self, motor: MotorSlot, rpm: i32) -> Result<i8> {
        let mut state = self.lock();
        state.ready_to_move()?;
        let applied = clamp_logged("rpm", rpm);
        state.set_target(motor, applied as f32);
        debug!("Motor {} target {} RPM", motor, applied);
        Ok(applied)
    }

    /// Open-loop duty for one motor, applied on the next tick
    pub fn set_speed(&self, motor: MotorSlot, percent: i32) -> Result<i8> {
        let mut state = self.lock();
        state.ready_to_move()?;
        let applied = clamp_logged("duty", percent);
        state.commands[motor.index()] = MotorCommand::Duty(applied);
        state.pids[motor.index()].reset();
        debug!("Motor {} duty {}%", motor, applied);
        Ok(applied)
    }

    pub fn reset_encoder(&self, motor: MotorSlot) -> Result<()> {
        let mut state = self.lock();
        state.ready()?;
        state.tracker.reset(motor);
        debug!("Encoder {} reset", motor);
        Ok(())
    }

    pub fn get_encoder(&self, motor: MotorSlot) -> Result<i64> {
        let state = self.lock();
        state.ready()?;
        Ok(state.tracker.ticks(motor))
    }

    pub fn get_rpm(&self, motor: MotorSlot) -> Result<i32> {
        let state = self.lock();
        state.ready()?;
        Ok(state.tracker.rpm(motor).round() as i32)
    }

    // ---- Drive actions ----

    /// Halt every motor and drop the running action without a callback
    pub fn stop(&self) -> Result<()> {
        let mut state = self.lock();
        state.ready()?;
        state.scheduler.stop();
        state.halt_all();
        Ok(())
    }

    pub fn speed_drive(&self, x_speed_cms: i32, y_speed_cms: i32, w_speed_degs: i32) -> Result<()> {
        let mut state = self.lock();
        let drivetrain = state.ready_to_move()?;
        let velocity = lateral_checked(
            &drivetrain,
            BodyVelocity::from_command(x_speed_cms, y_speed_cms, w_speed_degs),
        );
        state.engage(&drivetrain, velocity);
        state.start(DriveAction::Continuous(velocity));
        Ok(())
    }

    pub fn time_drive(
        &self,
        x_speed_cms: i32,
        y_speed_cms: i32,
        w_speed_degs: i32,
        time_s: u32,
    ) -> Result<()> {
        let mut state = self.lock();
        let drivetrain = state.ready_to_move()?;
        let velocity = lateral_checked(
            &drivetrain,
            BodyVelocity::from_command(x_speed_cms, y_speed_cms, w_speed_degs),
        );
        state.engage(&drivetrain, velocity);
        state.start(DriveAction::Timed {
            velocity,
            duration: Duration::from_secs(time_s as u64),
        });
        Ok(())
    }

    /// Move by a body-frame displacement at the configured cruise speeds. The
    /// drive completes on reaching the target or after a safety time bound.
    pub fn drive_distance(&self, x_meter: i32, y_meter: i32, omega_degree: i32) -> Result<()> {
        let mut state = self.lock();
        let drivetrain = state.ready_to_move()?;

        let mut target = Displacement::from_command(x_meter, y_meter, omega_degree);
        if !drivetrain.is_holonomic() && target.y != 0.0 {
            warn!(
                "{} drive base cannot move sideways, ignoring y = {} m",
                drivetrain.name(),
                y_meter
            );
            target.y = 0.0;
        }

        // All components finish together: the slowest one sets the duration
        let config = &state.config;
        let planned = travel_time(target.linear(), config.distance_speed_cms / 100.0).max(
            travel_time(target.theta.abs(), config.distance_turn_degs.to_radians()),
        );
        let velocity = if planned > 0.0 && planned.is_finite() {
            BodyVelocity::new(target.x, target.y, target.theta).scale(1.0 / planned)
        } else {
            BodyVelocity::zero()
        };

        let scale = state.engage(&drivetrain, velocity);
        let config = &state.config;
        let bound = planned / scale * config.safety_time_factor + config.safety_time_margin_s;
        let time_limit = Duration::try_from_secs_f32(bound).unwrap_or(Duration::MAX);

        state.start(DriveAction::Distance {
            target,
            velocity: velocity.scale(scale),
            time_limit,
        });
        Ok(())
    }

    // ---- Callbacks ----

    /// Replace the limit switch handler. Allowed before a drive base exists.
    pub fn register_limit_switch_callback(&self, handler: impl Fn(LimitSwitchEvent) + Send + Sync + 'static) {
        self.lock().on_limit = Some(Arc::new(handler));
    }

    /// Replace the drive completion handler. Allowed before a drive base exists.
    pub fn register_drive_action_callback(&self, handler: impl Fn(CompletionReason) + Send + Sync + 'static) {
        self.lock().on_drive = Some(Arc::new(handler));
    }

    // ---- Interrupt entry ----

    pub fn on_limit_edge(&self, motor: MotorSlot, level_high: bool) {
        self.limit_edge_at(motor, level_high, Instant::now());
    }

    /// Deliver a raw limit line edge. Never blocks: when the tick holds the
    /// lock the edge stays queued and the tick handles it.
    pub fn limit_edge_at(&self, motor: MotorSlot, level_high: bool, at: Instant) {
        let edge = LimitEdge {
            motor,
            level_high,
            at,
        };
        if self.edge_tx.try_send(edge).is_err() {
            debug!("Limit edge queue full, keeping latest level on motor {}", motor);
            let level = if level_high { LEVEL_HIGH } else { LEVEL_LOW };
            self.overflow[motor.index()].store(level, Ordering::Release);
        }

        let Some(mut state) = self.try_lock() else {
            trace!("Unit busy, edge on motor {} deferred to the tick", motor);
            return;
        };
        let events = state.drain_edges(at, &self.overflow);
        let handler = state.on_limit.clone();
        drop(state);

        dispatch_limit(handler, events);
    }

    // ---- Control tick ----

    pub fn tick(&self, dt: Duration) -> Result<()> {
        self.tick_at(dt, Instant::now())
    }

    /// One control period of length `dt` ending at `now`
    pub fn tick_at(&self, dt: Duration, now: Instant) -> Result<()> {
        let mut state = self.lock();
        let limit_events = state.drain_edges(now, &self.overflow);

        let drivetrain = state.drivetrain;
        let outcome = match drivetrain {
            Some(drivetrain) if !state.faulted => state.control(&drivetrain, dt),
            _ => Ok(None),
        };
        if outcome.is_err() {
            state.fault();
        }

        let limit_handler = state.on_limit.clone();
        let drive_handler = state.on_drive.clone();
        drop(state);

        dispatch_limit(limit_handler, limit_events);
        if let (Some(reason), Some(handler)) = (outcome.as_ref().ok().copied().flatten(), drive_handler) {
            handler(reason);
        }
        outcome.map(|_| ())
    }

    // ---- Queries ----

    pub fn drive_state(&self) -> SchedulerState {
        self.lock().scheduler.state()
    }

    pub fn drive_action(&self) -> Option<DriveAction> {
        self.lock().scheduler.action().copied()
    }

    /// Last duty written to the motor
    pub fn duty(&self, motor: MotorSlot) -> i8 {
        self.lock().duties[motor.index()]
    }

    pub fn target_rpm(&self, motor: MotorSlot) -> Option<f32> {
        match self.lock().commands[motor.index()] {
            MotorCommand::Rpm(rpm) => Some(rpm),
            _ => None,
        }
    }

    pub fn drivetrain(&self) -> Option<Drivetrain> {
        self.lock().drivetrain
    }

    pub fn gains(&self) -> PidGains {
        self.lock().gains
    }

    pub fn limit_switch_state(&self, motor: MotorSlot) -> SwitchState {
        self.lock().switches.state(motor)
    }

    pub fn is_faulted(&self) -> bool {
        self.lock().faulted
    }
}

impl UnitState {
    fn ready(&self) -> Result<Drivetrain> {
        self.drivetrain.ok_or(AmcuError::NotInitialized)
    }

    fn ready_to_move(&self) -> Result<Drivetrain> {
        let drivetrain = self.ready()?;
        if self.faulted {
            return Err(AmcuError::Faulted);
        }
        Ok(drivetrain)
    }

    fn set_target(&mut self, motor: MotorSlot, rpm: f32) {
        let i = motor.index();
        if !matches!(self.commands[i], MotorCommand::Rpm(_)) {
            self.pids[i].reset();
        }
        self.commands[i] = MotorCommand::Rpm(rpm);
    }

    /// Turn a body velocity into wheel targets, scaling all wheels down together
    /// if any would exceed the command limit. Returns the scale applied.
    fn engage(&mut self, drivetrain: &Drivetrain, velocity: BodyVelocity) -> f32 {
        let limit = COMMAND_LIMIT as f32;
        let targets = drivetrain.forward(velocity);
        let peak = targets.peak();
        let scale = if peak > limit {
            warn!("Wheel target {:.1} RPM over the limit, scaling all wheels by {:.3}", peak, limit / peak);
            limit / peak
        } else {
            1.0
        };

        for (slot, rpm) in targets.saturate(limit).iter() {
            self.set_target(slot, rpm);
        }
        scale
    }

    fn start(&mut self, action: DriveAction) {
        let start_ticks = self.tracker.raw_snapshot();
        self.scheduler.start(action, start_ticks);
    }

    /// Zero every duty, release all targets and clear PID state
    fn halt_all(&mut self) {
        for slot in MotorSlot::ALL {
            let i = slot.index();
            self.commands[i] = MotorCommand::Released;
            self.pids[i].reset();
            match self.actuator.set_duty(slot, 0) {
                Ok(()) | Err(HardwareError::Unmapped(_)) => self.duties[i] = 0,
                Err(e) => warn!("Failed to zero motor {}: {}", slot, e),
            }
        }
    }

    fn fault(&mut self) {
        if let Some(action) = self.scheduler.stop() {
            warn!("{} aborted by hardware fault", action.kind());
        }
        self.halt_all();
        self.faulted = true;
        error!("Unit faulted, all motors stopped");
    }

    /// Queued edges first, then any overflowed levels (which arrived later), then
    /// debounce windows that ran out by `now`
    fn drain_edges(
        &mut self,
        now: Instant,
        overflow: &[AtomicU8; MotorSlot::COUNT],
    ) -> Vec<LimitSwitchEvent> {
        let mut events = Vec::new();
        while let Ok(edge) = self.edges.try_recv() {
            events.extend(self.switches.on_edge(edge));
        }
        for (motor, latest) in MotorSlot::ALL.into_iter().zip(overflow) {
            let level_high = match latest.swap(NO_LEVEL, Ordering::AcqRel) {
                NO_LEVEL => continue,
                level => level == LEVEL_HIGH,
            };
            events.extend(self.switches.on_edge(LimitEdge {
                motor,
                level_high,
                at: now,
            }));
        }
        events.extend(self.switches.poll(now));
        events
    }

    /// Regulate, write duties, read encoders, then evaluate the action
    fn control(&mut self, drivetrain: &Drivetrain, dt: Duration) -> Result<Option<CompletionReason>> {
        let dt_s = dt.as_secs_f32();

        for slot in MotorSlot::ALL {
            let i = slot.index();
            let duty = match self.commands[i] {
                MotorCommand::Released => continue,
                MotorCommand::Duty(duty) => duty,
                MotorCommand::Rpm(target) => {
                    let measured = self.tracker.rpm(slot);
                    self.pids[i].update(&self.gains, target, measured, dt_s).round() as i8
                }
            };
            match self.actuator.set_duty(slot, duty) {
                Ok(()) => self.duties[i] = duty,
                Err(e) => {
                    warn!("Duty write to motor {} failed: {}", slot, e);
                    self.tracker.record_failure(slot)?;
                }
            }
        }

        for slot in MotorSlot::ALL {
            let i = slot.index();
            if self.commands[i] == MotorCommand::Released && !drivetrain.uses(slot) {
                continue;
            }
            let reading = self.actuator.read_ticks(slot);
            self.tracker.update(slot, reading, dt)?;
        }

        let tpr = self.tracker.ticks_per_revolution();
        let raw = self.tracker.raw_snapshot();
        let tolerance = Tolerance {
            linear_m: self.config.distance_tolerance_mm / 1000.0,
            angle_rad: self.config.angle_tolerance_deg.to_radians(),
        };
        let progress = |start: &mut TickSnapshot| {
            let mut deltas = [0i64; MotorSlot::COUNT];
            for (delta, (now, then)) in deltas.iter_mut().zip(raw.iter().zip(start.iter_mut())) {
                *delta = match (*now, *then) {
                    (Some(now), Some(then)) => now - then,
                    // Wheel had no good read when the drive started, measure from here
                    (Some(now), None) => {
                        *then = Some(now);
                        0
                    }
                    (None, _) => 0,
                };
            }
            drivetrain.inverse_progress(&deltas, tpr)
        };

        let Some(_) = self.scheduler.evaluate(dt, progress, tolerance) else {
            return Ok(None);
        };
        self.halt_all();
        Ok(self.scheduler.finish())
    }
}

fn clamp_logged(quantity: &'static str, value: i32) -> i8 {
    let (applied, clamped) = OutOfRange::clamp(quantity, value);
    if let Some(clamped) = clamped {
        warn!("{}", clamped);
    }
    applied
}

fn lateral_checked(drivetrain: &Drivetrain, velocity: BodyVelocity) -> BodyVelocity {
    if !drivetrain.is_holonomic() && velocity.y != 0.0 {
        warn!(
            "{} drive base cannot move sideways, ignoring y = {} m/s",
            drivetrain.name(),
            velocity.y
        );
        return BodyVelocity { y: 0.0, ..velocity };
    }
    velocity
}

fn travel_time(distance: f32, speed: f32) -> f32 {
    if distance <= 0.0 {
        0.0
    } else if speed <= 0.0 {
        f32::INFINITY
    } else {
        distance / speed
    }
}

fn dispatch_limit(handler: Option<LimitSwitchHandler>, events: Vec<LimitSwitchEvent>) {
    match handler {
        Some(handler) => {
            for event in events {
                handler(event);
            }
        }
        None if !events.is_empty() => debug!("{} limit switch events with no handler", events.len()),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::motor::SimulatedActuator;

    const DT: Duration = Duration::from_millis(20);

    fn slot(i: i64) -> MotorSlot {
        MotorSlot::new(i).unwrap()
    }

    fn bench() -> (ControlUnit, SimulatedActuator) {
        let sim = SimulatedActuator::new(360);
        let unit = ControlUnit::new(sim.clone(), UnitConfig::default());
        (unit, sim)
    }

    fn differential_bench() -> (ControlUnit, SimulatedActuator) {
        let (unit, sim) = bench();
        unit.init_differential_drive_base_2wheel(50, 300, slot(0), slot(1))
            .unwrap();
        (unit, sim)
    }

    /// Count drive completions, remembering the last reason
    fn completion_counter(unit: &ControlUnit) -> (Arc<AtomicUsize>, Arc<Mutex<Option<CompletionReason>>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(None));
        let (c, l) = (count.clone(), last.clone());
        unit.register_drive_action_callback(move |reason| {
            c.fetch_add(1, Ordering::SeqCst);
            *l.lock().unwrap() = Some(reason);
        });
        (count, last)
    }

    fn run(unit: &ControlUnit, sim: &SimulatedActuator, ticks: usize) {
        for _ in 0..ticks {
            sim.advance(DT);
            unit.tick(DT).unwrap();
        }
    }

    /// Tick until the running action ends, returning the number of ticks taken
    fn run_to_idle(unit: &ControlUnit, sim: &SimulatedActuator, max_ticks: usize) -> Option<usize> {
        for n in 1..=max_ticks {
            sim.advance(DT);
            unit.tick(DT).unwrap();
            if unit.drive_state() == SchedulerState::Idle {
                return Some(n);
            }
        }
        None
    }

    #[test]
    fn test_operations_need_a_drive_base() {
        let (unit, _sim) = bench();
        assert!(matches!(unit.set_rpm(slot(0), 10), Err(AmcuError::NotInitialized)));
        assert!(matches!(unit.get_encoder(slot(0)), Err(AmcuError::NotInitialized)));
        assert!(matches!(unit.set_pid(1.0, 0.0, 0.0), Err(AmcuError::NotInitialized)));
        assert!(matches!(unit.speed_drive(10, 0, 0), Err(AmcuError::NotInitialized)));
        assert!(matches!(unit.stop(), Err(AmcuError::NotInitialized)));
        // Registration and ticking are fine
        unit.register_drive_action_callback(|_| {});
        unit.tick(DT).unwrap();
    }

    #[test]
    fn test_invalid_init_changes_nothing() {
        let (unit, _sim) = differential_bench();
        let before = unit.drivetrain();

        let err = unit
            .init_omni_drive_base(50, 120, slot(0), slot(0), slot(2))
            .unwrap_err();
        assert!(matches!(
            err,
            AmcuError::Configuration(crate::error::ConfigurationError::DuplicateSlot(_))
        ));
        let err = unit
            .init_differential_drive_base_2wheel(0, 300, slot(0), slot(1))
            .unwrap_err();
        assert!(matches!(err, AmcuError::Configuration(_)));
        assert_eq!(unit.drivetrain(), before);
    }

    #[test]
    fn test_set_rpm_clamps_and_reports() {
        let (unit, _sim) = differential_bench();
        assert_eq!(unit.set_rpm(slot(0), 250).unwrap(), 100);
        assert_eq!(unit.target_rpm(slot(0)), Some(100.0));
        assert_eq!(unit.set_speed(slot(1), -140).unwrap(), -100);
        assert_eq!(unit.target_rpm(slot(1)), None);
        // Untouched motors stay released
        assert_eq!(unit.target_rpm(slot(2)), None);
    }

    #[test]
    fn test_set_speed_drives_open_loop() {
        let (unit, sim) = differential_bench();
        unit.set_speed(slot(1), 50).unwrap();
        run(&unit, &sim, 100);
        assert_eq!(sim.duty(slot(1)), 50);
        assert_eq!(unit.duty(slot(1)), 50);
        assert_eq!(sim.duty(slot(0)), 0);
        // 1.5 RPM per duty point, 9 ticks per period at 360 ticks per revolution
        assert_eq!(unit.get_rpm(slot(1)).unwrap(), 75);
    }

    #[test]
    fn test_set_rpm_regulates_to_target() {
        let (unit, sim) = differential_bench();
        unit.set_rpm(slot(0), 50).unwrap();
        run(&unit, &sim, 250);

        // Single-period RPM is quantized to whole ticks, judge the average over a second
        let before = unit.get_encoder(slot(0)).unwrap();
        run(&unit, &sim, 50);
        let moved = unit.get_encoder(slot(0)).unwrap() - before;
        assert!((moved - 300).abs() <= 12, "moved {moved} ticks in 1 s");
    }

    #[test]
    fn test_reset_encoder_reads_zero() {
        let (unit, sim) = differential_bench();
        unit.set_speed(slot(0), 50).unwrap();
        run(&unit, &sim, 50);
        assert!(unit.get_encoder(slot(0)).unwrap() > 100);

        unit.reset_encoder(slot(0)).unwrap();
        assert_eq!(unit.get_encoder(slot(0)).unwrap(), 0);
        run(&unit, &sim, 5);
        assert!(unit.get_encoder(slot(0)).unwrap() > 0);
    }

    #[test]
    fn test_stop_from_any_state() {
        let (unit, sim) = differential_bench();
        let (count, _) = completion_counter(&unit);

        unit.stop().unwrap();
        assert_eq!(unit.drive_state(), SchedulerState::Idle);

        unit.time_drive(20, 0, 30, 5).unwrap();
        run(&unit, &sim, 10);
        assert!(sim.duty(slot(0)) != 0);

        unit.stop().unwrap();
        assert_eq!(unit.drive_state(), SchedulerState::Idle);
        for s in MotorSlot::ALL {
            assert_eq!(sim.duty(s), 0);
            assert_eq!(unit.duty(s), 0);
        }
        run(&unit, &sim, 400);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(sim.duty(slot(0)), 0);
    }

    #[test]
    fn test_time_drive_completes_once() {
        let (unit, sim) = differential_bench();
        let (count, last) = completion_counter(&unit);

        unit.time_drive(10, 0, 0, 1).unwrap();
        assert_eq!(run_to_idle(&unit, &sim, 200), Some(50));
        assert_eq!(*last.lock().unwrap(), Some(CompletionReason::Elapsed));
        assert_eq!(sim.duty(slot(0)), 0);

        run(&unit, &sim, 100);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_differential_drive_one_meter() {
        let (unit, sim) = differential_bench();
        let (count, last) = completion_counter(&unit);

        unit.drive_distance(1, 0, 0).unwrap();
        assert_eq!(unit.drive_state(), SchedulerState::Running);

        let ticks = run_to_idle(&unit, &sim, 2000).expect("drive never completed");
        println!("1 m in {} ticks", ticks);
        assert_eq!(*last.lock().unwrap(), Some(CompletionReason::TargetReached));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Both wheels turned about 1 m / (2π · 50 mm) revolutions
        let expected = 1.0 / (2.0 * std::f64::consts::PI * 0.05) * 360.0;
        for s in [slot(0), slot(1)] {
            let ticks = unit.get_encoder(s).unwrap() as f64;
            assert!(ticks >= expected * 0.98, "motor {s} at {ticks}");
        }

        run(&unit, &sim, 100);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_supersession_is_silent() {
        let (unit, sim) = differential_bench();
        let (count, last) = completion_counter(&unit);

        unit.time_drive(20, 0, 0, 2).unwrap();
        run(&unit, &sim, 20);
        unit.speed_drive(10, 0, 0).unwrap();
        run(&unit, &sim, 200);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(unit.drive_state(), SchedulerState::Running);

        unit.drive_distance(1, 0, 0).unwrap();
        run_to_idle(&unit, &sim, 2000).expect("drive never completed");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(*last.lock().unwrap(), Some(CompletionReason::TargetReached));
    }

    #[test]
    fn test_distance_drive_turns_in_place() {
        let (unit, sim) = bench();
        unit.init_omni_drive_base(50, 125, slot(0), slot(1), slot(2))
            .unwrap();
        let (_, last) = completion_counter(&unit);

        unit.drive_distance(0, 0, 90).unwrap();
        let ticks = run_to_idle(&unit, &sim, 2000).expect("turn never completed");
        println!("90° in {} ticks", ticks);
        assert_eq!(*last.lock().unwrap(), Some(CompletionReason::TargetReached));
    }

    #[test]
    fn test_distance_drive_safety_bound() {
        let (unit, _sim) = differential_bench();
        let (_, last) = completion_counter(&unit);

        unit.drive_distance(1, 0, 0).unwrap();
        let Some(DriveAction::Distance { time_limit, .. }) = unit.drive_action() else {
            panic!("expected a distance drive");
        };
        // 5 s planned at 20 cm/s, times 3 plus 2 s margin
        assert!((time_limit.as_secs_f32() - 17.0).abs() < 1e-3);

        // Simulated time never advances, so the wheels stay put
        for _ in 0..2000 {
            unit.tick(DT).unwrap();
            if unit.drive_state() == SchedulerState::Idle {
                break;
            }
        }
        assert_eq!(*last.lock().unwrap(), Some(CompletionReason::SafetyTimeout));
    }

    #[test]
    fn test_differential_ignores_lateral_input() {
        let (unit, _sim) = differential_bench();
        unit.speed_drive(10, 50, 0).unwrap();
        let Some(DriveAction::Continuous(velocity)) = unit.drive_action() else {
            panic!("expected a speed drive");
        };
        assert_eq!(velocity.y, 0.0);
        assert_eq!(unit.target_rpm(slot(0)), unit.target_rpm(slot(1)));
    }

    #[test]
    fn test_wheel_targets_scaled_together() {
        let (unit, _sim) = differential_bench();
        // 1 m/s on a 50 mm wheel is ~191 RPM, plus rotation
        unit.speed_drive(100, 0, 20).unwrap();
        let left = unit.target_rpm(slot(0)).unwrap();
        let right = unit.target_rpm(slot(1)).unwrap();
        assert!((right - 100.0).abs() < 1e-3);
        assert!(left > 0.0 && left < right);
    }

    #[test]
    fn test_reinit_cancels_action_silently() {
        let (unit, sim) = differential_bench();
        let (count, _) = completion_counter(&unit);

        unit.time_drive(20, 0, 0, 1).unwrap();
        run(&unit, &sim, 10);
        unit.init_mecanum_drive_base(40, 150, 120, slot(0), slot(1), slot(2), slot(3))
            .unwrap();
        assert_eq!(unit.drive_state(), SchedulerState::Idle);
        assert_eq!(unit.drivetrain().map(|d| d.name()), Some("mecanum"));
        run(&unit, &sim, 100);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_limit_switch_needs_interrupt_line() {
        let (unit, _sim) = differential_bench();
        let err = unit
            .set_limit_switches(slot(1), true, true, false, false)
            .unwrap_err();
        assert!(matches!(
            err,
            AmcuError::Configuration(crate::error::ConfigurationError::NoLimitSwitchLine(_))
        ));
        unit.set_limit_switches(slot(3), true, true, false, false)
            .unwrap();
        assert_eq!(unit.limit_switch_state(slot(3)), SwitchState::Armed);
    }

    #[test]
    fn test_clean_edge_fires_from_interrupt() {
        let (unit, _sim) = differential_bench();
        unit.set_limit_switches(slot(0), true, true, false, false)
            .unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        unit.register_limit_switch_callback(move |event| sink.lock().unwrap().push(event));

        unit.on_limit_edge(slot(0), true);
        assert_eq!(
            *events.lock().unwrap(),
            vec![LimitSwitchEvent {
                motor: slot(0),
                level_high: true
            }]
        );
        unit.on_limit_edge(slot(0), false);
        unit.tick(DT).unwrap();
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_bounces_fire_at_most_once() {
        let (unit, _sim) = differential_bench();
        unit.set_limit_switches(slot(2), true, true, false, true)
            .unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        unit.register_limit_switch_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let t0 = Instant::now();
        for i in 0..5u32 {
            unit.limit_edge_at(slot(2), i % 2 == 0, t0 + Duration::from_millis(3) * i);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        for n in 1..=10u32 {
            unit.tick_at(DT, t0 + DT * n).unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_edge_during_tick_is_deferred() {
        let (unit, _sim) = differential_bench();
        unit.set_limit_switches(slot(0), true, true, false, false)
            .unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        unit.register_limit_switch_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        {
            // Stand in for the control tick holding the lock
            let _held = unit.lock();
            unit.on_limit_edge(slot(0), true);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        unit.tick(DT).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_can_reenter_unit() {
        let (unit, sim) = differential_bench();
        let unit = Arc::new(unit);
        let inner = Arc::downgrade(&unit);
        unit.set_limit_switches(slot(0), true, true, false, false)
            .unwrap();
        unit.register_limit_switch_callback(move |_| {
            if let Some(unit) = inner.upgrade() {
                unit.stop().unwrap();
            }
        });

        unit.speed_drive(20, 0, 0).unwrap();
        run(&unit, &sim, 10);
        unit.on_limit_edge(slot(0), true);
        assert_eq!(unit.drive_state(), SchedulerState::Idle);
        assert_eq!(sim.duty(slot(0)), 0);
    }

    #[test]
    fn test_persistent_read_failures_fault_the_unit() {
        let (unit, sim) = differential_bench();
        let (count, _) = completion_counter(&unit);
        unit.speed_drive(20, 0, 0).unwrap();
        run(&unit, &sim, 5);

        sim.set_failing(slot(1), true);
        let mut fault = None;
        for _ in 0..20 {
            sim.advance(DT);
            if let Err(e) = unit.tick(DT) {
                fault = Some(e);
                break;
            }
        }
        assert!(matches!(
            fault,
            Some(AmcuError::HardwareFault { slot: s, .. }) if s == slot(1)
        ));
        assert!(unit.is_faulted());
        assert_eq!(unit.drive_state(), SchedulerState::Idle);
        assert_eq!(sim.duty(slot(0)), 0);
        assert!(matches!(unit.speed_drive(10, 0, 0), Err(AmcuError::Faulted)));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Queries still work, and re-initializing recovers
        assert!(unit.get_encoder(slot(0)).is_ok());
        sim.set_failing(slot(1), false);
        unit.init_differential_drive_base_2wheel(50, 300, slot(0), slot(1))
            .unwrap();
        assert!(!unit.is_faulted());
        unit.speed_drive(10, 0, 0).unwrap();
    }

    #[test]
    fn test_single_failed_read_is_tolerated() {
        let (unit, sim) = differential_bench();
        unit.set_speed(slot(0), 30).unwrap();
        run(&unit, &sim, 20);
        let before = unit.get_encoder(slot(0)).unwrap();

        sim.set_failing(slot(0), true);
        sim.advance(DT);
        unit.tick(DT).unwrap();
        assert_eq!(unit.get_encoder(slot(0)).unwrap(), before);

        sim.set_failing(slot(0), false);
        run(&unit, &sim, 5);
        assert!(unit.get_encoder(slot(0)).unwrap() > before);
        assert!(!unit.is_faulted());
    }

    #[test]
    fn test_speed_holds_across_a_failed_read() {
        let (unit, sim) = differential_bench();
        unit.set_speed(slot(0), 50).unwrap();
        run(&unit, &sim, 100);
        assert_eq!(unit.get_rpm(slot(0)).unwrap(), 75);

        sim.set_failing(slot(0), true);
        sim.advance(DT);
        unit.tick(DT).unwrap();
        assert_eq!(unit.get_rpm(slot(0)).unwrap(), 75);

        // The first good read covers both periods
        sim.set_failing(slot(0), false);
        run(&unit, &sim, 1);
        assert_eq!(unit.get_rpm(slot(0)).unwrap(), 75);
    }

    #[test]
    fn test_distance_measured_from_first_good_read() {
        let (unit, sim) = bench();
        let (count, last) = completion_counter(&unit);
        for wheel in [slot(0), slot(1)] {
            sim.set_ticks(wheel, 5000);
            sim.set_failing(wheel, true);
        }
        unit.init_differential_drive_base_2wheel(50, 300, slot(0), slot(1))
            .unwrap();
        for wheel in [slot(0), slot(1)] {
            sim.set_failing(wheel, false);
        }

        unit.drive_distance(1, 0, 0).unwrap();
        run(&unit, &sim, 1);
        assert_eq!(unit.drive_state(), SchedulerState::Running);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let ticks = run_to_idle(&unit, &sim, 1000).unwrap();
        assert!(ticks > 200, "finished after {ticks} ticks");
        assert_eq!(*last.lock().unwrap(), Some(CompletionReason::TargetReached));
        // 1 m is about 1146 ticks on a 50 mm wheel
        assert!(unit.get_encoder(slot(0)).unwrap() > 1100);
    }

    #[test]
    fn test_overflowed_edge_keeps_latest_level() {
        let sim = SimulatedActuator::new(360);
        let config = UnitConfig {
            edge_queue_depth: 1,
            ..UnitConfig::default()
        };
        let unit = ControlUnit::new(sim, config);
        unit.init_differential_drive_base_2wheel(50, 300, slot(0), slot(1))
            .unwrap();
        unit.set_limit_switches(slot(0), true, true, false, false)
            .unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = events.clone();
        unit.register_limit_switch_callback(move |event| seen.lock().unwrap().push(event));

        {
            let _held = unit.lock();
            // Release fills the queue, the press that follows does not fit
            unit.on_limit_edge(slot(0), false);
            unit.on_limit_edge(slot(0), true);
        }
        unit.tick(DT).unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec![LimitSwitchEvent {
                motor: slot(0),
                level_high: true
            }]
        );

        // Nothing left over for the next tick
        unit.tick(DT).unwrap();
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_set_pid_applies_to_next_tick() {
        let (unit, sim) = differential_bench();
        unit.set_pid(1.0, 0.0, 0.0).unwrap();
        assert_eq!(unit.gains(), PidGains::new(1.0, 0.0, 0.0));
        unit.set_rpm(slot(0), 50).unwrap();
        unit.tick(DT).unwrap();
        assert_eq!(sim.duty(slot(0)), 50);
    }
}
