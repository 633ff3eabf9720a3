// Limit switch state machines with optional debounce
//
// Disabled -> (configure enabled) -> Armed
// Armed -> active edge, no debounce -> Triggered (fire) -> Armed
// Armed -> active edge, debounce -> Debouncing
// Debouncing -> any edge inside the window -> bounce, Armed (or a fresh window if active again)
// Debouncing -> window elapsed, line still active -> Triggered (fire) -> Armed

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::ConfigurationError;
use crate::motor::MotorSlot;

/// Motor slot 1 has no interrupt line on this unit
pub const SLOT_WITHOUT_LIMIT_LINE: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LimitSwitchConfig {
    /// Electrical level that means "pressed" for a normally-open switch
    pub active_high: bool,
    pub enabled: bool,
    /// Normally-closed switches open when pressed, inverting the active level
    pub normally_closed: bool,
    pub debounce: bool,
}

impl LimitSwitchConfig {
    fn is_active(&self, level_high: bool) -> bool {
        (level_high == self.active_high) != self.normally_closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    Disabled,
    Armed,
    Debouncing { since: Instant },
    Triggered,
}

/// A confirmed switch activation, handed to the host callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSwitchEvent {
    pub motor: MotorSlot,
    pub level_high: bool,
}

/// A raw level change from the interrupt line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitEdge {
    pub motor: MotorSlot,
    pub level_high: bool,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Switch {
    config: LimitSwitchConfig,
    state: SwitchState,
    level_high: bool,
}

impl Switch {
    fn fire(&mut self, motor: MotorSlot) -> LimitSwitchEvent {
        self.state = SwitchState::Triggered;
        debug!("Limit switch on motor {} triggered", motor);
        let event = LimitSwitchEvent {
            motor,
            level_high: self.level_high,
        };
        self.state = SwitchState::Armed;
        event
    }
}

#[derive(Debug, Clone)]
pub struct LimitSwitchMonitor {
    switches: [Option<Switch>; MotorSlot::COUNT],
    debounce: Duration,
}

impl LimitSwitchMonitor {
    pub fn new(debounce: Duration) -> Self {
        Self {
            switches: [None; MotorSlot::COUNT],
            debounce,
        }
    }

    pub fn configure(
        &mut self,
        motor: MotorSlot,
        config: LimitSwitchConfig,
    ) -> Result<(), ConfigurationError> {
        if motor.index() == SLOT_WITHOUT_LIMIT_LINE {
            return Err(ConfigurationError::NoLimitSwitchLine(motor));
        }

        let state = if config.enabled {
            SwitchState::Armed
        } else {
            SwitchState::Disabled
        };
        // Keep the last known line level across reconfiguration
        let level_high = self.switches[motor.index()].is_some_and(|s| s.level_high);
        self.switches[motor.index()] = Some(Switch {
            config,
            state,
            level_high,
        });
        debug!("Limit switch on motor {} configured: {:?}", motor, config);
        Ok(())
    }

    pub fn state(&self, motor: MotorSlot) -> SwitchState {
        self.switches[motor.index()].map_or(SwitchState::Disabled, |s| s.state)
    }

    /// Process one edge, returning a trigger when the edge confirms one
    pub fn on_edge(&mut self, edge: LimitEdge) -> Option<LimitSwitchEvent> {
        let debounce = self.debounce;
        let Some(switch) = self.switches[edge.motor.index()].as_mut() else {
            trace!("Edge on unconfigured limit line {}", edge.motor);
            return None;
        };

        // A window that ran out before this edge arrived was stable the whole time
        let mut expired = None;
        if let SwitchState::Debouncing { since } = switch.state {
            if edge.at.saturating_duration_since(since) >= debounce {
                expired = Some(switch.fire(edge.motor));
            }
        }

        switch.level_high = edge.level_high;
        let active = switch.config.is_active(edge.level_high);

        match switch.state {
            SwitchState::Disabled | SwitchState::Triggered => None,
            SwitchState::Armed if !active => expired,
            SwitchState::Armed if !switch.config.debounce => Some(switch.fire(edge.motor)),
            SwitchState::Armed => {
                switch.state = SwitchState::Debouncing { since: edge.at };
                expired
            }
            SwitchState::Debouncing { .. } => {
                trace!("Bounce on limit switch {}", edge.motor);
                switch.state = if active {
                    SwitchState::Debouncing { since: edge.at }
                } else {
                    SwitchState::Armed
                };
                None
            }
        }
    }

    /// Resolve debounce windows that have run out by `now`
    pub fn poll(&mut self, now: Instant) -> Vec<LimitSwitchEvent> {
        let debounce = self.debounce;
        let mut events = Vec::new();

        for (motor, entry) in MotorSlot::ALL.into_iter().zip(self.switches.iter_mut()) {
            let Some(switch) = entry.as_mut() else {
                continue;
            };
            if let SwitchState::Debouncing { since } = switch.state {
                if now.saturating_duration_since(since) < debounce {
                    continue;
                }
                if switch.config.is_active(switch.level_high) {
                    events.push(switch.fire(motor));
                } else {
                    switch.state = SwitchState::Armed;
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(20);

    fn slot(i: i64) -> MotorSlot {
        MotorSlot::new(i).unwrap()
    }

    fn config(debounce: bool) -> LimitSwitchConfig {
        LimitSwitchConfig {
            active_high: true,
            enabled: true,
            normally_closed: false,
            debounce,
        }
    }

    fn edge(motor: MotorSlot, level_high: bool, at: Instant) -> LimitEdge {
        LimitEdge {
            motor,
            level_high,
            at,
        }
    }

    #[test]
    fn test_slot_one_has_no_line() {
        let mut monitor = LimitSwitchMonitor::new(WINDOW);
        assert_eq!(
            monitor.configure(slot(1), config(false)),
            Err(ConfigurationError::NoLimitSwitchLine(slot(1)))
        );
        assert!(monitor.configure(slot(0), config(false)).is_ok());
    }

    #[test]
    fn test_enabled_flag_selects_state() {
        let mut monitor = LimitSwitchMonitor::new(WINDOW);
        monitor.configure(slot(2), config(false)).unwrap();
        assert_eq!(monitor.state(slot(2)), SwitchState::Armed);

        let disabled = LimitSwitchConfig {
            enabled: false,
            ..config(false)
        };
        monitor.configure(slot(2), disabled).unwrap();
        assert_eq!(monitor.state(slot(2)), SwitchState::Disabled);
        assert_eq!(monitor.on_edge(edge(slot(2), true, Instant::now())), None);
    }

    #[test]
    fn test_clean_edge_without_debounce_fires_once() {
        let mut monitor = LimitSwitchMonitor::new(WINDOW);
        monitor.configure(slot(0), config(false)).unwrap();
        let t0 = Instant::now();

        let event = monitor.on_edge(edge(slot(0), true, t0));
        assert_eq!(
            event,
            Some(LimitSwitchEvent {
                motor: slot(0),
                level_high: true
            })
        );
        assert_eq!(monitor.state(slot(0)), SwitchState::Armed);
        // Releasing the switch is not a trigger
        assert_eq!(monitor.on_edge(edge(slot(0), false, t0 + WINDOW)), None);
        assert!(monitor.poll(t0 + WINDOW * 10).is_empty());
    }

    #[test]
    fn test_bounces_coalesce_into_one_trigger() {
        let mut monitor = LimitSwitchMonitor::new(WINDOW);
        monitor.configure(slot(3), config(true)).unwrap();
        let t0 = Instant::now();

        let mut fired = 0;
        for i in 0..5u32 {
            let at = t0 + Duration::from_millis(2) * i;
            fired += monitor.on_edge(edge(slot(3), i % 2 == 0, at)).iter().count();
            fired += monitor.poll(at).len();
        }
        assert!(matches!(
            monitor.state(slot(3)),
            SwitchState::Debouncing { .. }
        ));
        fired += monitor.poll(t0 + Duration::from_millis(100)).len();
        assert_eq!(fired, 1);
        assert_eq!(monitor.state(slot(3)), SwitchState::Armed);
    }

    #[test]
    fn test_bounce_that_settles_inactive_is_ignored() {
        let mut monitor = LimitSwitchMonitor::new(WINDOW);
        monitor.configure(slot(0), config(true)).unwrap();
        let t0 = Instant::now();

        assert_eq!(monitor.on_edge(edge(slot(0), true, t0)), None);
        assert_eq!(
            monitor.on_edge(edge(slot(0), false, t0 + Duration::from_millis(5))),
            None
        );
        assert!(monitor.poll(t0 + WINDOW * 5).is_empty());
    }

    #[test]
    fn test_expired_window_fires_on_next_edge() {
        // The periodic poll never ran, the release edge itself resolves the window
        let mut monitor = LimitSwitchMonitor::new(WINDOW);
        monitor.configure(slot(2), config(true)).unwrap();
        let t0 = Instant::now();

        monitor.on_edge(edge(slot(2), true, t0));
        let event = monitor.on_edge(edge(slot(2), false, t0 + WINDOW * 2));
        assert_eq!(
            event,
            Some(LimitSwitchEvent {
                motor: slot(2),
                level_high: true
            })
        );
        assert!(monitor.poll(t0 + WINDOW * 10).is_empty());
    }

    #[test]
    fn test_normally_closed_inverts_level() {
        let mut monitor = LimitSwitchMonitor::new(WINDOW);
        let nc = LimitSwitchConfig {
            normally_closed: true,
            ..config(false)
        };
        monitor.configure(slot(0), nc).unwrap();
        let t0 = Instant::now();

        assert_eq!(monitor.on_edge(edge(slot(0), true, t0)), None);
        let event = monitor.on_edge(edge(slot(0), false, t0 + WINDOW));
        assert_eq!(event.map(|e| e.level_high), Some(false));
    }

    #[test]
    fn test_genuine_triggers_each_fire() {
        let mut monitor = LimitSwitchMonitor::new(WINDOW);
        monitor.configure(slot(0), config(true)).unwrap();
        let t0 = Instant::now();

        let mut fired = 0;
        for press in 0..3u32 {
            let start = t0 + Duration::from_millis(200) * press;
            monitor.on_edge(edge(slot(0), true, start));
            fired += monitor.poll(start + WINDOW).len();
            fired += monitor
                .on_edge(edge(slot(0), false, start + Duration::from_millis(100)))
                .iter()
                .count();
        }
        assert_eq!(fired, 3);
    }
}
