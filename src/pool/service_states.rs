//! Generation tracking for the pool and for load-balanced services.

use dashmap::DashMap;

use crate::connection::ServiceId;
use crate::sync::GenerationCounter;

#[derive(Debug, Clone, Copy, Default)]
struct ServiceState {
    connection_count: usize,
    generation: u64,
}

/// Per-service connection count and generation.
#[derive(Debug, Default)]
pub struct ServiceStates {
    states: DashMap<ServiceId, ServiceState>,
}

impl ServiceStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_get_generation(&self, service_id: &ServiceId) -> Option<u64> {
        self.states.get(service_id).map(|state| state.generation)
    }

    /// Generation of the service, registering it at `initial` if unknown.
    pub fn get_or_register(&self, service_id: &ServiceId, initial: u64) -> u64 {
        self.states
            .entry(service_id.clone())
            .or_insert(ServiceState {
                connection_count: 0,
                generation: initial,
            })
            .generation
    }

    pub fn connection_count(&self, service_id: &ServiceId) -> usize {
        self.states
            .get(service_id)
            .map(|state| state.connection_count)
            .unwrap_or(0)
    }

    pub fn increment_connection_count(&self, service_id: &ServiceId) {
        self.states
            .entry(service_id.clone())
            .or_default()
            .connection_count += 1;
    }

    pub fn decrement_connection_count(&self, service_id: &ServiceId) {
        if let Some(mut state) = self.states.get_mut(service_id) {
            state.connection_count = state.connection_count.saturating_sub(1);
        }
    }

    /// Bump one service's generation. Returns the new generation, or `None`
    /// if the service has never been seen.
    pub fn increment_generation(&self, service_id: &ServiceId) -> Option<u64> {
        self.states.get_mut(service_id).map(|mut state| {
            state.generation += 1;
            state.generation
        })
    }

    pub fn increment_all_generations(&self) {
        for mut state in self.states.iter_mut() {
            state.generation += 1;
        }
    }

    /// Drop the entry when no connection references it any more.
    pub fn remove_if_unused(&self, service_id: &ServiceId) -> bool {
        self.states
            .remove_if(service_id, |_, state| state.connection_count == 0)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Pool-wide and per-service generations, shared with every pooled connection.
#[derive(Debug, Default)]
pub struct PoolGenerations {
    pool: GenerationCounter,
    services: ServiceStates,
}

impl PoolGenerations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool_generation(&self) -> u64 {
        self.pool.current()
    }

    /// Generation a connection to `service_id` is compared against.
    pub fn generation_for(&self, service_id: Option<&ServiceId>) -> u64 {
        service_id
            .and_then(|id| self.services.try_get_generation(id))
            .unwrap_or_else(|| self.pool.current())
    }

    pub fn services(&self) -> &ServiceStates {
        &self.services
    }

    /// Invalidate every connection: the pool generation and all services.
    pub fn increment_all(&self) -> u64 {
        self.services.increment_all_generations();
        self.pool.increment()
    }
}
