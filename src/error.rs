//! # Error handling utilities.
//! Plumbing (config, hardware requests, bridge transport) uses the generic
//! anyhow error type. Awaitable BLE operations never fail with it: they resolve
//! to a `BleError` value instead.

use std::sync::Arc;

use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

/// Causal error reported by the radio stack on a delegate callback.
///
/// Cloneable so the same failure can be delivered to every listener of the
/// event channel.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HardwareError(Arc<anyhow::Error>);

impl From<anyhow::Error> for HardwareError {
    fn from(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}

/// Outcome taxonomy for the awaitable coordinator operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BleError {
    #[error("hardware error: {0}")]
    CausedBy(#[from] HardwareError),

    #[error("operation failed without a reported cause")]
    Unknown,

    #[error("event stream finished before a matching event arrived")]
    Finished,

    #[error("peripheral {0} has not been discovered")]
    UnknownPeripheral(Uuid),
}

impl BleError {
    /// Wraps an optional causal error, falling back to `Unknown`.
    pub fn from_cause(cause: Option<HardwareError>) -> Self {
        match cause {
            Some(err) => BleError::CausedBy(err),
            None => BleError::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_from_cause() {
        let err = BleError::from_cause(Some(anyhow!("link lost").into()));
        assert!(matches!(err, BleError::CausedBy(_)));
        assert_eq!(err.to_string(), "hardware error: link lost");

        assert!(matches!(BleError::from_cause(None), BleError::Unknown));
    }
}
