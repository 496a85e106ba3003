//! Wiring: which workflows and activities a worker hosts, and how a
//! runtime over the configured namespace is opened.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use escalation_runtime::clock::Clock;
use escalation_runtime::{FileStore, NamespaceManager, Registry, Runtime};

use crate::activities::{
    ConcludeOrder, FinalizeStale, PaymentProcessor, QueryOrder, QueryTiming, RecurringPaymentV1,
    RecurringPaymentV2, RecurringPaymentV3,
};
use crate::config::AppConfig;
use crate::failure::{RandomFailures, SharedFailureInjector};
use crate::ledger::{JsonlLedger, SharedLedger};
use crate::models::CURRENT_PAYMENT_VERSION;
use crate::workflows::{ManualHandleWorkflow, PrimaryWorkflow, RecurringPaymentWorkflow, StaleWorkflow};

/// Collaborators injected into the activities.
#[derive(Clone)]
pub struct Dependencies {
    pub failures: SharedFailureInjector,
    pub ledger: SharedLedger,
    pub query_timing: QueryTiming,
    pub payment_delay: Duration,
    /// Payment version new consents are pinned to.
    pub payment_version: u32,
}

impl Dependencies {
    pub fn new(failures: SharedFailureInjector, ledger: SharedLedger) -> Self {
        Self {
            failures,
            ledger,
            query_timing: QueryTiming::default(),
            payment_delay: Duration::from_secs(30),
            payment_version: CURRENT_PAYMENT_VERSION,
        }
    }

    /// Random failures and a JSONL ledger in the namespace directory.
    pub fn from_config(config: &AppConfig) -> Self {
        let failures: SharedFailureInjector = Arc::new(RandomFailures::new(config.fail_probability));
        let ledger: SharedLedger = Arc::new(JsonlLedger::in_dir(&config.namespace_dir()));
        Self {
            query_timing: QueryTiming {
                lookup: Duration::from_millis(config.simulation.lookup_ms),
                processing: Duration::from_millis(config.simulation.processing_ms),
            },
            payment_delay: Duration::from_millis(config.simulation.payment_delay_ms),
            ..Self::new(failures, ledger)
        }
    }
}

/// Every workflow and activity of the escalation chain and recurring
/// payments.
pub fn registry(deps: &Dependencies) -> Registry {
    let payments = PaymentProcessor::new(deps.ledger.clone()).with_delay(deps.payment_delay);
    let mut registry = Registry::new();
    registry
        .register_workflow(PrimaryWorkflow)
        .register_workflow(StaleWorkflow)
        .register_workflow(ManualHandleWorkflow)
        .register_workflow(RecurringPaymentWorkflow::with_default_version(deps.payment_version))
        .register_activity(QueryOrder::new(deps.failures.clone()).with_timing(deps.query_timing))
        .register_activity(FinalizeStale::new(deps.ledger.clone()))
        .register_activity(ConcludeOrder::new(deps.ledger.clone()))
        .register_activity(RecurringPaymentV1(payments.clone()))
        .register_activity(RecurringPaymentV2(payments.clone()))
        .register_activity(RecurringPaymentV3(payments));
    registry
}

/// Runtime over the file store of the configured namespace, on the host
/// clock so worker and client processes agree on signal and timer instants.
///
/// Fails if the namespace was never registered.
pub fn open_runtime(config: &AppConfig, registry: Registry) -> Result<Runtime> {
    let store = FileStore::open(&config.state_dir, &config.namespace).with_context(|| {
        format!(
            "Unable to open namespace {} under {}",
            config.namespace,
            config.state_dir.display()
        )
    })?;
    Ok(Runtime::builder(store.shared())
        .namespace(config.namespace.clone())
        .registry(registry)
        .clock(Clock::host())
        .signal_poll_interval(config.worker.signal_poll_interval())
        .build())
}

pub fn namespaces(config: &AppConfig) -> NamespaceManager {
    NamespaceManager::new(&config.state_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::NeverFail;
    use crate::ledger::MemoryLedger;

    #[test]
    fn test_registry_hosts_every_kind() {
        let deps = Dependencies::new(Arc::new(NeverFail), MemoryLedger::new().shared());
        let registry = registry(&deps);
        for kind in ["QueryOrder", "Stale", "ManualHandleOrder", "RegisterRecurringPayment"] {
            assert!(registry.has_workflow(kind), "{kind}");
        }
        for name in [
            "QueryOrder",
            "FinalizeStaleWorkflow",
            "ConcludeQueryOrder",
            "RecurringPaymentV1",
            "RecurringPaymentV2",
            "RecurringPaymentV3",
        ] {
            assert!(registry.has_activity(name), "{name}");
        }
    }

    #[test]
    fn test_unregistered_namespace_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            state_dir: dir.path().to_path_buf(),
            namespace: "payments".to_string(),
            ..AppConfig::default()
        };
        let deps = Dependencies::new(Arc::new(NeverFail), MemoryLedger::new().shared());
        assert!(open_runtime(&config, registry(&deps)).is_err());

        namespaces(&config).register("payments", "", 0).unwrap();
        let runtime = open_runtime(&config, registry(&deps)).unwrap();
        assert_eq!(runtime.namespace(), "payments");
    }
}
