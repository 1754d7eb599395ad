//! Vital server facade: a resource store and a locker behind one `execute_bundle` entry point

use crate::config::VitalServerConfig;
use crate::locker::ServerLocker;
use crate::persistence::MemoryResourceStore;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use vital_shared::config_utils::ConfigDefaults;
use vital_shared::{
    Bundle, BundleExecutor, BundleFailure, BundleResponse, ExecutorConfig, RequestContext,
    ResourceValidator, VitalResult,
};

/// Builder for configuring and creating a Vital server
pub struct VitalServerBuilder {
    config: VitalServerConfig,
    locker: Option<ServerLocker>,
    store: Option<MemoryResourceStore>,
    validator: Option<Arc<dyn ResourceValidator>>,
}

impl VitalServerBuilder {
    pub fn new() -> Self {
        Self {
            config: VitalServerConfig::default(),
            locker: None,
            store: None,
            validator: None,
        }
    }

    pub fn with_config(mut self, config: VitalServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn with_executor_config(mut self, executor: ExecutorConfig) -> Self {
        self.config.executor = executor;
        self
    }

    /// Use this locker instead of building one from the configuration
    pub fn with_locker<L: Into<ServerLocker>>(mut self, locker: L) -> Self {
        self.locker = Some(locker.into());
        self
    }

    /// Share an existing store, e.g. between several servers in one test
    pub fn with_store(mut self, store: MemoryResourceStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn ResourceValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn build(self) -> VitalResult<VitalServer> {
        self.config.validate()?;

        let locker = match self.locker {
            Some(locker) => locker,
            None => ServerLocker::from_settings(
                &self.config.locker,
                &self.config.redlock_namespace(),
            )?,
        };
        let mut store = self
            .store
            .unwrap_or_else(|| self.config.persistence.create_store());
        if let Some(validator) = self.validator {
            store = store.with_validator(validator);
        }

        info!(
            namespace = %self.config.namespace,
            locker = locker.kind(),
            lock_batches = self.config.executor.lock_batches,
            "Vital server initialized"
        );

        let executor = BundleExecutor::with_config(
            Arc::new(store),
            Arc::new(locker),
            self.config.executor.clone(),
        );
        Ok(VitalServer {
            config: self.config,
            executor,
        })
    }
}

impl Default for VitalServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes bundles against its store under its locker
#[derive(Clone)]
pub struct VitalServer {
    config: VitalServerConfig,
    executor: BundleExecutor<MemoryResourceStore, ServerLocker>,
}

impl VitalServer {
    /// Get a builder for configuring a new server
    pub fn builder() -> VitalServerBuilder {
        VitalServerBuilder::new()
    }

    pub fn config(&self) -> &VitalServerConfig {
        &self.config
    }

    pub fn store(&self) -> &MemoryResourceStore {
        self.executor.store()
    }

    pub fn locker(&self) -> &ServerLocker {
        self.executor.locker()
    }

    pub async fn execute_bundle(
        &self,
        ctx: &RequestContext,
        bundle: &Bundle,
    ) -> Result<BundleResponse, BundleFailure> {
        self.executor.execute_bundle(ctx, bundle).await
    }

    /// Parse, execute and render a bundle. Returns the HTTP status and the response body,
    /// which is an OperationOutcome when the bundle as a whole failed.
    pub async fn execute_json(&self, ctx: &RequestContext, body: Value) -> (u16, Value) {
        let bundle = match Bundle::from_json(body) {
            Ok(bundle) => bundle,
            Err(error) => {
                warn!(request_id = ctx.request_id(), error = %error, "Rejected malformed bundle");
                let failure = BundleFailure {
                    error,
                    request_id: ctx.request_id().to_string(),
                    trace_id: ctx.trace_id().to_string(),
                };
                return (failure.status_code(), outcome_json(&failure));
            }
        };

        match self.execute_bundle(ctx, &bundle).await {
            Ok(response) => (response.status(), response.to_json()),
            Err(failure) => (failure.status_code(), outcome_json(&failure)),
        }
    }
}

fn outcome_json(failure: &BundleFailure) -> Value {
    let outcome = failure.outcome();
    serde_json::json!({
        "resourceType": "OperationOutcome",
        "issue": [{
            "severity": outcome.severity,
            "code": outcome.code,
            "diagnostics": outcome.diagnostics,
        }],
        "status": outcome.status,
        "traceId": outcome.trace_id,
    })
}
