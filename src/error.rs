// Error taxonomy for the control unit

use crate::motor::MotorSlot;

/// Rejected configuration. Nothing is changed when one of these is returned.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("motor slot {0} out of range 0..=3")]
    InvalidSlot(i64),

    #[error("motor {0} is assigned to more than one wheel")]
    DuplicateSlot(MotorSlot),

    #[error("{0} must be greater than zero")]
    NonPositiveGeometry(&'static str),

    #[error("motor {0} has no limit switch interrupt line")]
    NoLimitSwitchLine(MotorSlot),
}

#[derive(Debug, thiserror::Error)]
pub enum AmcuError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("no drive base configured, call one of the init operations first")]
    NotInitialized,

    #[error("unit is faulted, re-initialize the drive base to recover")]
    Faulted,

    #[error("motor {slot} failed {failures} consecutive hardware accesses, all motors halted")]
    HardwareFault { slot: MotorSlot, failures: u32 },

    #[error("failed to read unit config {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse unit config {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, AmcuError>;

/// An RPM or duty argument outside [-100, 100]. The value is clamped and the
/// command still goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{quantity} {requested} outside [-100, 100], clamped to {applied}")]
pub struct OutOfRange {
    pub quantity: &'static str,
    pub requested: i32,
    pub applied: i8,
}

impl OutOfRange {
    /// Clamp `value` into the command range, reporting whether clamping happened
    pub fn clamp(quantity: &'static str, value: i32) -> (i8, Option<OutOfRange>) {
        let limit = crate::config::COMMAND_LIMIT as i32;
        let applied = value.clamp(-limit, limit) as i8;
        if applied as i32 == value {
            (applied, None)
        } else {
            (
                applied,
                Some(OutOfRange {
                    quantity,
                    requested: value,
                    applied,
                }),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_in_range_passes_through() {
        assert_eq!(OutOfRange::clamp("rpm", 42), (42, None));
        assert_eq!(OutOfRange::clamp("rpm", -100), (-100, None));
    }

    #[test]
    fn test_clamp_reports_applied_value() {
        let (applied, report) = OutOfRange::clamp("duty", 250);
        assert_eq!(applied, 100);
        let report = report.expect("clamp should be reported");
        assert_eq!(report.requested, 250);
        assert_eq!(
            report.to_string(),
            "duty 250 outside [-100, 100], clamped to 100"
        );

        let (applied, _) = OutOfRange::clamp("duty", -1000);
        assert_eq!(applied, -100);
    }
}
