use crate::error::{ErrorCode, Result};

/// Compaction trigger policy, checked by the coordinator after every
/// successful mutation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AutoCompact {
    Off,
    On { min_writes: u64, min_dirt_factor: f64 },
}

impl Default for AutoCompact {
    fn default() -> Self {
        AutoCompact::On { min_writes: 100, min_dirt_factor: 0.25 }
    }
}

impl AutoCompact {
    pub fn validate(self) -> Result<Self> {
        if let AutoCompact::On { min_dirt_factor, .. } = self {
            if !(0.0..=1.0).contains(&min_dirt_factor) {
                return Err(ErrorCode::InvalidConfig(format!(
                    "min_dirt_factor must be within [0, 1], got {}",
                    min_dirt_factor
                )));
            }
        }
        Ok(self)
    }

    /// Whether `dirt`/`dirt_factor` on the active tree clear this policy's bar.
    pub fn should_compact(&self, dirt: u64, dirt_factor: f64) -> bool {
        match self {
            AutoCompact::Off => false,
            AutoCompact::On { min_writes, min_dirt_factor } => {
                dirt >= *min_writes && dirt_factor >= *min_dirt_factor
            }
        }
    }
}
