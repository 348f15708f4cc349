//! Reference model of the vehicle controller firmware
//!
//! Used by the in-memory simulated transport and the `firmware-sim` binary to
//! answer commands exactly as the real controller does.

use crate::dashboard::GEAR_RATIO_DEFAULT;
use crate::protocol::{Command, Snapshot};

#[derive(Debug, Clone)]
pub struct FirmwareModel {
    snapshot: Snapshot,
}

impl Default for FirmwareModel {
    fn default() -> Self {
        Self::new()
    }
}

impl FirmwareModel {
    /// Controller at rest with the default gear ratio
    pub fn new() -> Self {
        Self::with_snapshot(Snapshot {
            speed_tenths: 0,
            gear_ratio: GEAR_RATIO_DEFAULT,
        })
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
    }

    /// Apply a command; returns the snapshot to send back, if any
    pub fn handle(&mut self, command: Command) -> Option<Snapshot> {
        match command {
            Command::ReadSnapshot => Some(self.snapshot),
            Command::SetSpeed(tenths) => {
                self.snapshot.speed_tenths = tenths;
                None
            }
            Command::SetGearRatio(ratio) => {
                self.snapshot.gear_ratio = ratio;
                None
            }
        }
    }
}
