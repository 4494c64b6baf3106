//! Readiness gating for the serving adapter
//!
//! Tracks the `unloaded -> loading -> ready | failed` lifecycle and hands
//! out the loaded state only once loading has completed.

use crate::error::{LoadError, ServingError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

/// Lifecycle of an adapter instance. `Ready` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

impl LoadState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LoadState::Unloaded,
            1 => LoadState::Loading,
            2 => LoadState::Ready,
            _ => LoadState::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LoadState::Unloaded => 0,
            LoadState::Loading => 1,
            LoadState::Ready => 2,
            LoadState::Failed => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::Unloaded => "unloaded",
            LoadState::Loading => "loading",
            LoadState::Ready => "ready",
            LoadState::Failed => "failed",
        }
    }

    /// Numeric code exported as a gauge
    pub fn code(&self) -> i64 {
        self.as_u8() as i64
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub state: LoadState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub last_check_timestamp: i64,
}

/// Gate that opens exactly once and never closes again.
///
/// The loaded value lives in a `OnceLock`, so "is ready" and "give me the
/// loaded state" are the same atomic read.
#[derive(Debug)]
pub struct ReadinessGate<T> {
    state: AtomicU8,
    loaded: OnceLock<T>,
}

impl<T> Default for ReadinessGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReadinessGate<T> {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LoadState::Unloaded.as_u8()),
            loaded: OnceLock::new(),
        }
    }

    pub fn state(&self) -> LoadState {
        LoadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.loaded.get().is_some()
    }

    /// Move from `Unloaded` to `Loading`; any other state is rejected
    pub fn begin_loading(&self) -> Result<(), LoadError> {
        self.state
            .compare_exchange(
                LoadState::Unloaded.as_u8(),
                LoadState::Loading.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|current| LoadError::InvalidState(LoadState::from_u8(current)))
    }

    /// Publish the loaded value and open the gate
    pub fn open(&self, value: T) -> Result<(), LoadError> {
        if self.state() != LoadState::Loading || self.loaded.set(value).is_err() {
            return Err(LoadError::InvalidState(self.state()));
        }
        self.state.store(LoadState::Ready.as_u8(), Ordering::Release);
        Ok(())
    }

    /// Record a failed load. The gate stays closed for good.
    pub fn fail(&self) {
        let _ = self.state.compare_exchange(
            LoadState::Loading.as_u8(),
            LoadState::Failed.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Access the loaded value, or `NotReady`
    pub fn get(&self) -> Result<&T, ServingError> {
        self.loaded.get().ok_or(ServingError::NotReady)
    }

    pub fn readiness(&self) -> ReadinessResponse {
        let state = self.state();
        let reason = match state {
            LoadState::Ready => None,
            LoadState::Unloaded => Some("Model not loaded yet".to_string()),
            LoadState::Loading => Some("Model is loading".to_string()),
            LoadState::Failed => Some("Model failed to load".to_string()),
        };
        ReadinessResponse {
            ready: self.is_ready(),
            state,
            reason,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}
