//! Named circuit breakers for operator inspection and reset.
//!
//! A registry is an ordinary value built at startup and handed to whoever needs it;
//! there is no process-global lookup.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerState, CircuitState};
use thiserror::Error;
use tracing::warn;

/// Handle to reset/query a circuit breaker instance.
#[derive(Clone, Debug)]
pub struct CircuitBreakerHandle {
    state: Arc<CircuitBreakerState>,
}

impl CircuitBreakerHandle {
    pub fn reset(&self) {
        self.state.reset();
    }

    pub fn state(&self) -> CircuitState {
        self.state.current_state()
    }

    pub fn failure_count(&self) -> usize {
        self.state.failure_count()
    }

    /// Whether both handles control the same breaker.
    pub fn same_breaker(&self, other: &CircuitBreakerHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl From<&CircuitBreaker> for CircuitBreakerHandle {
    fn from(breaker: &CircuitBreaker) -> Self {
        Self { state: breaker.shared_state() }
    }
}

/// Errors from breaker registries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CircuitBreakerRegistryError {
    #[error("circuit breaker '{id}' not found")]
    NotFound { id: String },
}

/// Trait for breaker registries.
pub trait CircuitBreakerRegistry: Send + Sync + std::fmt::Debug {
    /// Register a handle by id; an existing handle with the same id is replaced.
    fn register(&self, id: String, handle: CircuitBreakerHandle);
    fn get(&self, id: &str) -> Option<CircuitBreakerHandle>;
    /// Reset a breaker by id, erroring if missing.
    fn reset(&self, id: &str) -> Result<(), CircuitBreakerRegistryError>;
    /// Breaker states sorted by id.
    fn snapshot(&self) -> Vec<(String, CircuitState)>;
}

/// In-memory implementation backed by an RwLock.
#[derive(Default, Clone, Debug)]
pub struct InMemoryCircuitBreakerRegistry {
    inner: Arc<RwLock<BTreeMap<String, CircuitBreakerHandle>>>,
}

impl InMemoryCircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CircuitBreakerRegistry for InMemoryCircuitBreakerRegistry {
    fn register(&self, id: String, handle: CircuitBreakerHandle) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&id) {
            warn!(target: "tollgate::circuit_breaker_registry", id = %id, "circuit breaker id replaced; last registration wins");
        }
        map.insert(id, handle);
    }

    fn get(&self, id: &str) -> Option<CircuitBreakerHandle> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    fn reset(&self, id: &str) -> Result<(), CircuitBreakerRegistryError> {
        let handle = self
            .get(id)
            .ok_or_else(|| CircuitBreakerRegistryError::NotFound { id: id.to_string() })?;
        handle.reset();
        tracing::info!(target: "tollgate::circuit_breaker_registry", id, "circuit breaker reset by operator");
        Ok(())
    }

    fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.iter().map(|(k, v)| (k.clone(), v.state())).collect()
    }
}
