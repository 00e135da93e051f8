//! Optimization concurrency controller
//!
//! Two explicit state machines behind one lock:
//! - per route: `Idle → Optimizing → Idle`
//! - global: `Idle → BatchRunning → Idle`
//!
//! Routes are tracked by their (technician, date) key. The synthetic route
//! id changes on every rebuild and is only carried for messages.
//!
//! Transitions back to `Idle` happen when the RAII guard handed out by the
//! forward transition is dropped, so an early return or a panic in the
//! optimizer cannot leave a route stuck.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use crate::types::RouteKey;

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Idle,
    Optimizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    BatchRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("route {0} is already being optimized")]
    RouteBusy(u32),
    #[error("optimize all is running")]
    BatchRunning,
}

struct ControllerState {
    /// In-flight routes and the id they were claimed under
    optimizing: HashMap<RouteKey, u32>,
    batch: BatchState,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            optimizing: HashMap::new(),
            batch: BatchState::Idle,
        }
    }
}

/// Shared gate in front of every optimize call
#[derive(Clone, Default)]
pub struct OptimizationController {
    state: Arc<Mutex<ControllerState>>,
}

/// Holds a route in `Optimizing` until dropped
pub struct RouteGuard {
    key: RouteKey,
    controller: OptimizationController,
}

impl RouteGuard {
    #[cfg(test)]
    pub fn key(&self) -> RouteKey {
        self.key
    }
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.controller.state.lock().optimizing.remove(&self.key);
    }
}

/// Holds the batch in `BatchRunning` until dropped
pub struct BatchGuard {
    controller: OptimizationController,
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        self.controller.state.lock().batch = BatchState::Idle;
    }
}

impl OptimizationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-route optimize. Rejected while the same route is in flight or
    /// while a batch runs.
    pub fn try_begin_route(&self, route_id: u32, key: RouteKey) -> Result<RouteGuard, GateError> {
        let mut state = self.state.lock();
        if state.batch == BatchState::BatchRunning {
            warn!("Rejecting optimize of route {}: optimize all is running", route_id);
            return Err(GateError::BatchRunning);
        }
        Self::claim(&mut state, route_id, key)?;
        Ok(RouteGuard {
            key,
            controller: self.clone(),
        })
    }

    /// Start the batch. Rejected while another batch runs or any single
    /// route is still in flight.
    pub fn try_begin_batch(&self) -> Result<BatchGuard, GateError> {
        let mut state = self.state.lock();
        if state.batch == BatchState::BatchRunning {
            warn!("Rejecting optimize all: already running");
            return Err(GateError::BatchRunning);
        }
        if let Some(&busy) = state.optimizing.values().min() {
            warn!("Rejecting optimize all: route {} is being optimized", busy);
            return Err(GateError::RouteBusy(busy));
        }
        state.batch = BatchState::BatchRunning;
        Ok(BatchGuard {
            controller: self.clone(),
        })
    }

    /// Claim one route on behalf of a running batch
    pub fn begin_route_in_batch(
        &self,
        _batch: &BatchGuard,
        route_id: u32,
        key: RouteKey,
    ) -> Result<RouteGuard, GateError> {
        let mut state = self.state.lock();
        Self::claim(&mut state, route_id, key)?;
        Ok(RouteGuard {
            key,
            controller: self.clone(),
        })
    }

    fn claim(state: &mut ControllerState, route_id: u32, key: RouteKey) -> Result<(), GateError> {
        if let Some(&claimed_as) = state.optimizing.get(&key) {
            warn!(
                "Rejecting optimize of route {} ({}): already in flight as route {}",
                route_id, key, claimed_as
            );
            return Err(GateError::RouteBusy(route_id));
        }
        state.optimizing.insert(key, route_id);
        Ok(())
    }

    #[cfg(test)]
    pub fn route_state(&self, key: RouteKey) -> RouteState {
        if self.state.lock().optimizing.contains_key(&key) {
            RouteState::Optimizing
        } else {
            RouteState::Idle
        }
    }

    #[cfg(test)]
    pub fn batch_state(&self) -> BatchState {
        self.state.lock().batch
    }

    /// Whether a single-route optimize of `key` would be rejected now
    pub fn is_busy(&self, key: RouteKey) -> bool {
        let state = self.state.lock();
        state.batch == BatchState::BatchRunning || state.optimizing.contains_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn key(n: u128) -> RouteKey {
        RouteKey::new(Some(Uuid::from_u128(n)), NaiveDate::from_ymd_opt(2024, 3, 1))
    }

    #[test]
    fn test_second_optimize_of_same_route_rejected() {
        let controller = OptimizationController::new();
        let _guard = controller.try_begin_route(1, key(1)).unwrap();

        assert_eq!(controller.route_state(key(1)), RouteState::Optimizing);
        assert_eq!(controller.try_begin_route(1, key(1)).err(), Some(GateError::RouteBusy(1)));
    }

    #[test]
    fn test_rebuilt_route_with_new_id_is_still_busy() {
        let controller = OptimizationController::new();
        let guard = controller.try_begin_route(1, key(1)).unwrap();

        // A reload renumbered the same technician/date group
        assert_eq!(controller.try_begin_route(4, key(1)).err(), Some(GateError::RouteBusy(4)));
        assert!(controller.is_busy(key(1)));

        drop(guard);
        assert!(controller.try_begin_route(4, key(1)).is_ok());
    }

    #[test]
    fn test_other_routes_are_independent() {
        let controller = OptimizationController::new();
        let _a = controller.try_begin_route(1, key(1)).unwrap();
        let b = controller.try_begin_route(1, key(2));
        assert!(b.is_ok());
        assert!(!controller.is_busy(key(3)));
    }

    #[test]
    fn test_guard_drop_returns_route_to_idle() {
        let controller = OptimizationController::new();
        {
            let guard = controller.try_begin_route(4, key(4)).unwrap();
            assert_eq!(guard.key(), key(4));
            assert!(controller.is_busy(key(4)));
        }
        assert_eq!(controller.route_state(key(4)), RouteState::Idle);
        assert!(controller.try_begin_route(4, key(4)).is_ok());
    }

    #[test]
    fn test_batch_blocks_every_single_route() {
        let controller = OptimizationController::new();
        let batch = controller.try_begin_batch().unwrap();

        assert_eq!(controller.batch_state(), BatchState::BatchRunning);
        assert_eq!(controller.try_begin_route(9, key(9)).err(), Some(GateError::BatchRunning));
        assert!(controller.is_busy(key(9)));

        // The batch itself can still claim routes
        let inner = controller.begin_route_in_batch(&batch, 9, key(9)).unwrap();
        assert_eq!(inner.key(), key(9));
        drop(inner);

        drop(batch);
        assert_eq!(controller.batch_state(), BatchState::Idle);
        assert!(controller.try_begin_route(9, key(9)).is_ok());
    }

    #[test]
    fn test_only_one_batch_at_a_time() {
        let controller = OptimizationController::new();
        let _batch = controller.try_begin_batch().unwrap();
        assert_eq!(controller.try_begin_batch().err(), Some(GateError::BatchRunning));
    }

    #[test]
    fn test_batch_waits_for_in_flight_route() {
        let controller = OptimizationController::new();
        let guard = controller.try_begin_route(5, key(5)).unwrap();
        assert_eq!(controller.try_begin_batch().err(), Some(GateError::RouteBusy(5)));
        drop(guard);
        assert!(controller.try_begin_batch().is_ok());
    }

    #[tokio::test]
    async fn test_tasks_racing_an_in_flight_route_are_all_rejected() {
        let controller = OptimizationController::new();
        let guard = controller.try_begin_route(7, key(7)).unwrap();

        let mut handles = Vec::new();
        for id in 0..16 {
            let c = controller.clone();
            handles.push(tokio::spawn(async move { c.try_begin_route(id, key(7)).is_ok() }));
        }
        for handle in handles {
            assert!(!handle.await.unwrap());
        }

        drop(guard);
        assert_eq!(controller.route_state(key(7)), RouteState::Idle);
    }
}
