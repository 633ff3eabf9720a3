// Fixed-rate loop around the control unit
// Each period: feed limit edges and host commands to the unit, advance the
// simulator when there is no hardware, tick the unit, then publish events,
// motor telemetry and health.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::{
    TOPIC_CMD, TOPIC_EVENT, TOPIC_HEALTH, TOPIC_LIMIT_EDGE, TOPIC_MOTORS, TOPIC_REPLY, UnitConfig,
};
use crate::control::ControlUnit;
use crate::error::{AmcuError, Result};
use crate::messages::{
    CommandReply, HostCommand, LimitEdgeMessage, MotorTelemetry, MotorsState, RuntimeHealth,
    UnitEvent,
};
use crate::motor::feetech::STEPS_PER_REVOLUTION;
use crate::motor::{FeetechActuator, MotorSlot, SimulatedActuator};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub struct RunOptions {
    /// Servo bus port, `None` runs against simulated motors
    pub port: Option<String>,
    pub config: UnitConfig,
    pub loop_hz: u64,
    /// Servo ID for each motor slot in order
    pub motor_ids: Vec<u8>,
}

pub struct Runtime {
    unit: ControlUnit,
    sim: Option<SimulatedActuator>,
    events: mpsc::UnboundedReceiver<UnitEvent>,
    health: RuntimeHealth,
}

impl Runtime {
    /// Wrap a unit, routing both callback kinds into the event queue
    pub fn new(unit: ControlUnit, sim: Option<SimulatedActuator>) -> Self {
        let (tx, events) = mpsc::unbounded_channel();

        let limit_tx = tx.clone();
        unit.register_limit_switch_callback(move |event| {
            let _ = limit_tx.send(UnitEvent::LimitSwitch {
                motor: event.motor,
                level_high: event.level_high,
            });
        });
        unit.register_drive_action_callback(move |reason| {
            let _ = tx.send(UnitEvent::DriveComplete { reason });
        });

        Self {
            unit,
            sim,
            events,
            health: RuntimeHealth::Uninitialized,
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    /// Run one host command and describe the outcome
    pub fn on_command(&self, cmd: HostCommand) -> CommandReply {
        let op = cmd.op();
        debug!("Received command: {:?}", cmd);
        match self.apply(cmd) {
            Ok(value) => CommandReply::ok(op, value),
            Err(e) => {
                warn!("Command {} failed: {}", op, e);
                CommandReply::failed(op, e)
            }
        }
    }

    fn apply(&self, cmd: HostCommand) -> Result<Option<i64>> {
        let unit = &self.unit;
        match cmd {
            HostCommand::InitOmniDriveBase {
                wheel_radius_mm,
                robot_radius_mm,
                motor_left,
                motor_right,
                motor_back,
            } => unit.init_omni_drive_base(
                wheel_radius_mm,
                robot_radius_mm,
                motor_left,
                motor_right,
                motor_back,
            )?,
            HostCommand::InitMecanumDriveBase {
                wheel_radius_mm,
                robot_x_mm,
                robot_y_mm,
                motor_front_left,
                motor_front_right,
                motor_back_left,
                motor_back_right,
            } => unit.init_mecanum_drive_base(
                wheel_radius_mm,
                robot_x_mm,
                robot_y_mm,
                motor_front_left,
                motor_front_right,
                motor_back_left,
                motor_back_right,
            )?,
            HostCommand::InitDifferentialDriveBase2Wheel {
                wheel_radius_mm,
                wheel_distance_mm,
                motor_left,
                motor_right,
            } => unit.init_differential_drive_base_2wheel(
                wheel_radius_mm,
                wheel_distance_mm,
                motor_left,
                motor_right,
            )?,
            HostCommand::InitDifferentialDriveBase4Wheel {
                wheel_radius_mm,
                wheel_distance_mm,
                motor_front_left,
                motor_front_right,
                motor_back_left,
                motor_back_right,
            } => unit.init_differential_drive_base_4wheel(
                wheel_radius_mm,
                wheel_distance_mm,
                motor_front_left,
                motor_front_right,
                motor_back_left,
                motor_back_right,
            )?,
            HostCommand::SetPid { kp, ki, kd } => unit.set_pid(kp, ki, kd)?,
            HostCommand::SetLimitSwitches {
                motor,
                active_high,
                enabled,
                normally_closed,
                debounce,
            } => unit.set_limit_switches(motor, active_high, enabled, normally_closed, debounce)?,
            HostCommand::SetRpm { motor, rpm } => return Ok(Some(unit.set_rpm(motor, rpm)?.into())),
            HostCommand::SetSpeed { motor, percent } => {
                return Ok(Some(unit.set_speed(motor, percent)?.into()));
            }
            HostCommand::ResetEncoder { motor } => unit.reset_encoder(motor)?,
            HostCommand::GetEncoder { motor } => return Ok(Some(unit.get_encoder(motor)?)),
            HostCommand::GetRpm { motor } => return Ok(Some(unit.get_rpm(motor)?.into())),
            HostCommand::Stop => unit.stop()?,
            HostCommand::SpeedDrive {
                x_speed_cms,
                y_speed_cms,
                w_speed_degs,
            } => unit.speed_drive(x_speed_cms, y_speed_cms, w_speed_degs)?,
            HostCommand::TimeDrive {
                x_speed_cms,
                y_speed_cms,
                w_speed_degs,
                time_s,
            } => unit.time_drive(x_speed_cms, y_speed_cms, w_speed_degs, time_s)?,
            HostCommand::DriveDistance {
                x_meter,
                y_meter,
                omega_degree,
            } => unit.drive_distance(x_meter, y_meter, omega_degree)?,
        }
        Ok(None)
    }

    pub fn on_limit_edge(&self, edge: LimitEdgeMessage) {
        self.unit.on_limit_edge(edge.motor, edge.level_high);
    }

    /// Advance the simulator (if any) and run one control tick
    pub fn step(&mut self, dt: Duration) {
        if let Some(sim) = &self.sim {
            sim.advance(dt);
        }
        if let Err(e) = self.unit.tick(dt) {
            error!("Control tick failed: {}", e);
        }
        self.update_health();
    }

    fn update_health(&mut self) {
        let health = if self.unit.is_faulted() {
            RuntimeHealth::Faulted
        } else if self.unit.drivetrain().is_none() {
            RuntimeHealth::Uninitialized
        } else {
            RuntimeHealth::Ok
        };

        if health != self.health {
            match health {
                RuntimeHealth::Faulted => warn!("Health: {:?}", health),
                _ => info!("Health: {:?}", health),
            }
            self.health = health;
        }
    }

    /// Callback notifications collected since the last call
    pub fn drain_events(&mut self) -> Vec<UnitEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Readings for every wheel of the drive base and any other motor being driven
    pub fn telemetry(&self) -> Result<MotorsState> {
        let drivetrain = self.unit.drivetrain().ok_or(AmcuError::NotInitialized)?;
        let mut motors = Vec::new();
        for motor in MotorSlot::ALL {
            let target_rpm = self.unit.target_rpm(motor);
            let duty = self.unit.duty(motor);
            if !drivetrain.uses(motor) && target_rpm.is_none() && duty == 0 {
                continue;
            }
            motors.push(MotorTelemetry {
                motor,
                ticks: self.unit.get_encoder(motor)?,
                rpm: self.unit.get_rpm(motor)?,
                duty,
                target_rpm,
            });
        }
        Ok(MotorsState {
            drive: self.unit.drive_state(),
            motors,
        })
    }
}

/// Build the unit on the servo bus, or on simulated motors when no port is given
fn build_runtime(options: &RunOptions) -> std::result::Result<Runtime, BoxError> {
    let mut config = options.config.clone();

    let Some(port) = &options.port else {
        info!("No motor port given, running against simulated motors");
        let sim = SimulatedActuator::new(config.ticks_per_revolution);
        return Ok(Runtime::new(ControlUnit::new(sim.clone(), config), Some(sim)));
    };

    if options.motor_ids.len() > MotorSlot::COUNT {
        return Err(format!(
            "{} servo IDs given, the unit has {} motor slots",
            options.motor_ids.len(),
            MotorSlot::COUNT
        )
        .into());
    }
    let mut ids = [None; MotorSlot::COUNT];
    for (slot, &id) in ids.iter_mut().zip(&options.motor_ids) {
        *slot = Some(id);
    }

    let mut actuator = FeetechActuator::open(port, ids)?;
    actuator.initialize()?;

    // Tick counts come from the servo position register
    if config.ticks_per_revolution != STEPS_PER_REVOLUTION {
        warn!(
            "Servo encoders have {} steps per revolution, overriding configured {}",
            STEPS_PER_REVOLUTION, config.ticks_per_revolution
        );
        config.ticks_per_revolution = STEPS_PER_REVOLUTION;
    }
    Ok(Runtime::new(ControlUnit::new(actuator, config), None))
}

pub async fn run(options: RunOptions) -> std::result::Result<(), BoxError> {
    let mut runtime = build_runtime(&options)?;

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let sub_cmd = session.declare_subscriber(TOPIC_CMD).await?;
    let sub_limit = session.declare_subscriber(TOPIC_LIMIT_EDGE).await?;
    let pub_reply = session.declare_publisher(TOPIC_REPLY).await?;
    let pub_event = session.declare_publisher(TOPIC_EVENT).await?;
    let pub_motors = session.declare_publisher(TOPIC_MOTORS).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let mut tick = interval(Duration::from_millis(1000 / options.loop_hz));
    let mut last_tick = Instant::now();

    info!("Runtime started: {}Hz loop", options.loop_hz);
    info!("Subscribed to: {}, {}", TOPIC_CMD, TOPIC_LIMIT_EDGE);
    info!(
        "Publishing to: {}, {}, {}, {}",
        TOPIC_REPLY, TOPIC_EVENT, TOPIC_MOTORS, TOPIC_HEALTH
    );

    loop {
        tick.tick().await;

        // 1. Limit edges first so a switch hit stops motion before the next command
        while let Ok(Some(sample)) = sub_limit.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<LimitEdgeMessage>(&payload) {
                Ok(edge) => runtime.on_limit_edge(edge),
                Err(e) => warn!("Failed to parse limit edge: {}", e),
            }
        }

        // 2. Host commands, each answered on the reply topic
        while let Ok(Some(sample)) = sub_cmd.try_recv() {
            let payload = sample.payload().to_bytes();
            let reply = match serde_json::from_slice::<HostCommand>(&payload) {
                Ok(cmd) => runtime.on_command(cmd),
                Err(e) => {
                    warn!("Failed to parse command: {}", e);
                    CommandReply::failed("parse", e)
                }
            };
            pub_reply.put(serde_json::to_string(&reply)?).await?;
        }

        // 3. Control tick over the time that actually passed
        let now = Instant::now();
        runtime.step(now - last_tick);
        last_tick = now;

        // 4. Publish callbacks raised during this period
        for event in runtime.drain_events() {
            pub_event.put(serde_json::to_string(&event)?).await?;
        }

        // 5. Publish telemetry and health
        if let Ok(state) = runtime.telemetry() {
            pub_motors.put(serde_json::to_string(&state)?).await?;
        }
        pub_health.put(serde_json::to_string(&runtime.health())?).await?;
    }
}
