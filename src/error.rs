use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Error type shared by the whole engine.
///
/// Construction-time problems (`Config`, `EmptyBeacons`, ...) are fatal;
/// per-row data problems are aggregated by the loaders and surface here only
/// when nothing usable remains. `Cancelled` is a cooperative outcome, not a
/// failure.
#[derive(Debug, Error)]
pub enum LocError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no BLE beacons registered")]
    EmptyBeacons,

    #[error("no movable unique sample location")]
    NoMovableSample,

    #[error("no valid sample remained after filtering ({dropped} dropped)")]
    NoValidSample { dropped: usize },

    #[error("malformed input data: {0}")]
    Data(String),

    #[error("unknown trained-model version {0}")]
    UnknownModelVersion(u32),

    #[error("gram matrix is singular even after ridge inflation")]
    SingularGram,

    #[error("floor {floor} outside building range [{min}, {max}]")]
    FloorOutOfRange { floor: i32, min: i32, max: i32 },

    #[error("out-of-order timestamp: {now} arrived after {prev}")]
    OutOfOrderTimestamp { prev: u64, now: u64 },

    #[error("operation cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag.
///
/// Long-running calls (`train`, resampling) poll the token between work
/// items and bail out with [`LocError::Cancelled`], leaving their inputs
/// untouched. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<(), LocError> {
        if self.is_cancelled() {
            Err(LocError::Cancelled)
        } else {
            Ok(())
        }
    }
}
