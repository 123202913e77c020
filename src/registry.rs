//! Per-method registry of the long-lived states.
//!
//! Circuit breakers and bulkheads live as long as the guarded method they protect. The registry
//! creates them through the factory on first use and hands the same shared state to every later
//! caller using that method id, which also allows reset and inspection by id.

use crate::async_bulkhead::AsyncBulkheadState;
use crate::bulkhead::{BulkheadPolicy, SyncBulkheadState};
use crate::circuit_breaker::{CircuitBreakerPolicy, CircuitBreakerState, CircuitSnapshot};
use crate::factory::FaultToleranceStateFactory;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

/// Errors from registry lookups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("circuit breaker '{id}' not found")]
    NotFound { id: String },
}

/// Get-or-create store of circuit breaker and bulkhead states keyed by method id.
#[derive(Debug)]
pub struct StateRegistry {
    factory: FaultToleranceStateFactory,
    breakers: RwLock<HashMap<String, CircuitBreakerState>>,
    sync_bulkheads: RwLock<HashMap<String, SyncBulkheadState>>,
    async_bulkheads: RwLock<HashMap<String, AsyncBulkheadState>>,
}

impl StateRegistry {
    pub fn new(factory: FaultToleranceStateFactory) -> Self {
        Self {
            factory,
            breakers: RwLock::default(),
            sync_bulkheads: RwLock::default(),
            async_bulkheads: RwLock::default(),
        }
    }

    pub fn factory(&self) -> &FaultToleranceStateFactory {
        &self.factory
    }

    /// The breaker for `method`, created from `policy` on first use.
    ///
    /// Later calls return the existing breaker and ignore `policy`.
    pub fn circuit_breaker(
        &self,
        method: &str,
        policy: Option<&CircuitBreakerPolicy>,
    ) -> CircuitBreakerState {
        get_or_create(&self.breakers, method, "circuit breaker", || {
            self.factory.create_circuit_breaker_state(policy)
        })
    }

    /// The synchronous bulkhead for `method`, created from `policy` on first use.
    pub fn sync_bulkhead(&self, method: &str, policy: Option<&BulkheadPolicy>) -> SyncBulkheadState {
        get_or_create(&self.sync_bulkheads, method, "sync bulkhead", || {
            self.factory.create_sync_bulkhead_state(policy)
        })
    }

    /// The asynchronous bulkhead for `method`, created from `policy` on first use.
    pub fn async_bulkhead(
        &self,
        method: &str,
        policy: Option<&BulkheadPolicy>,
    ) -> AsyncBulkheadState {
        get_or_create(&self.async_bulkheads, method, "async bulkhead", || {
            self.factory.create_async_bulkhead_state(policy)
        })
    }

    /// Force the breaker for `method` closed.
    pub fn reset_circuit(&self, method: &str) -> Result<(), RegistryError> {
        let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        match breakers.get(method) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(RegistryError::NotFound { id: method.to_string() }),
        }
    }

    /// Breaker snapshots sorted by method id.
    pub fn snapshot(&self) -> Vec<(String, CircuitSnapshot)> {
        let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<(String, CircuitSnapshot)> =
            breakers.iter().map(|(id, breaker)| (id.clone(), breaker.snapshot())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

fn get_or_create<S, F>(map: &RwLock<HashMap<String, S>>, method: &str, kind: &str, create: F) -> S
where
    S: Clone,
    F: FnOnce() -> S,
{
    if let Some(existing) = map.read().unwrap_or_else(PoisonError::into_inner).get(method) {
        return existing.clone();
    }
    let mut map = map.write().unwrap_or_else(PoisonError::into_inner);
    map.entry(method.to_string())
        .or_insert_with(|| {
            debug!(target: "lifeline::registry", method, kind, "state created");
            create()
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::clock::ManualClock;
    use crate::result::MethodResult;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn registry(clock: &ManualClock) -> StateRegistry {
        let factory = FaultToleranceStateFactory::try_current().unwrap().with_clock(clock.clone());
        StateRegistry::new(factory)
    }

    fn trip(breaker: &CircuitBreakerState) {
        for _ in 0..2 {
            let permit = breaker.request_permission().unwrap();
            breaker.record_result(permit, &MethodResult::<()>::failure(io::Error::other("down")));
        }
    }

    #[tokio::test]
    async fn same_method_shares_state() {
        let clock = ManualClock::new();
        let registry = registry(&clock);
        let policy = CircuitBreakerPolicy::builder().request_volume_threshold(2).build().unwrap();

        let first = registry.circuit_breaker("inventory", Some(&policy));
        trip(&first);
        let second = registry.circuit_breaker("inventory", None);
        assert_eq!(second.state(), CircuitState::Open);
        assert_eq!(registry.circuit_breaker("billing", Some(&policy)).state(), CircuitState::Closed);

        let bulkhead = registry.sync_bulkhead("inventory", Some(&BulkheadPolicy::new(1, 0)));
        assert_eq!(registry.sync_bulkhead("inventory", None).max_concurrent(), bulkhead.max_concurrent());
        assert_eq!(registry.async_bulkhead("inventory", None).max_concurrent(), None);
    }

    #[tokio::test]
    async fn reset_and_snapshot_by_id() {
        let clock = ManualClock::new();
        let registry = registry(&clock);
        let policy = CircuitBreakerPolicy::builder()
            .request_volume_threshold(2)
            .delay(Duration::from_secs(1))
            .build()
            .unwrap();
        trip(&registry.circuit_breaker("zeta", Some(&policy)));
        registry.circuit_breaker("alpha", Some(&policy));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(), ["alpha", "zeta"]);
        assert_eq!(snapshot[1].1.state, CircuitState::Open);

        registry.reset_circuit("zeta").unwrap();
        assert_eq!(registry.circuit_breaker("zeta", None).state(), CircuitState::Closed);
        assert_eq!(
            registry.reset_circuit("missing"),
            Err(RegistryError::NotFound { id: "missing".into() })
        );
    }

    #[tokio::test]
    async fn creation_is_logged_once() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = SharedWriter(buffer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(writer))
            .with_max_level(tracing::Level::DEBUG)
            .with_target(true)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let registry = registry(&ManualClock::new());
        registry.circuit_breaker("svc", None);
        registry.circuit_breaker("svc", None);

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert_eq!(logs.matches("state created").count(), 1, "{logs}");
        assert!(logs.contains("lifeline::registry"));
    }
}
