use crate::bundle::{
    searchset, Bundle, BundleEntry, BundleMode, BundleResponse, EntryOperation, EntryOutcome,
    EntryTarget,
};
use crate::config_utils::ConfigDefaults;
use crate::context::{AccessMode, RequestContext};
use crate::exception::{BundleFailure, VitalError, VitalResult};
use crate::reference::{is_symbolic, ReferenceResolver};
use crate::store::{
    reference_string, resource_id, ConditionalCreate, ConditionalUpdate, ResourceStore,
    SearchCriteria,
};
use crate::transactions::locks::Locker;
use crate::transactions::plan::{lock_keys, validate_bundle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Stages a bundle passes through; the last three are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    ComputeLockKeys,
    AcquireLocks,
    ExecuteEntries,
    Committed,
    Aborted,
    RejectedConflict,
}

impl fmt::Display for BundleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BundleState::ComputeLockKeys => "compute-lock-keys",
            BundleState::AcquireLocks => "acquire-locks",
            BundleState::ExecuteEntries => "execute-entries",
            BundleState::Committed => "committed",
            BundleState::Aborted => "aborted",
            BundleState::RejectedConflict => "rejected-conflict",
        };
        f.write_str(name)
    }
}

/// Executor behavior switches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Lock the write keys of batch bundles as well as transactions
    pub lock_batches: bool,
    /// Upper bound on entries per bundle
    pub max_entries: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            lock_batches: true,
            max_entries: 1000,
        }
    }
}

impl ConfigDefaults for ExecutorConfig {
    fn validate(&self) -> VitalResult<()> {
        if self.max_entries == 0 {
            return Err(VitalError::configuration(
                "Max bundle entries must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Applies bundles to a resource store under the locker's mutual exclusion
pub struct BundleExecutor<S, L> {
    store: Arc<S>,
    locker: Arc<L>,
    config: ExecutorConfig,
}

impl<S, L> Clone for BundleExecutor<S, L> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            locker: Arc::clone(&self.locker),
            config: self.config.clone(),
        }
    }
}

impl<S, L> BundleExecutor<S, L>
where
    S: ResourceStore,
    L: Locker,
{
    pub fn new(store: Arc<S>, locker: Arc<L>) -> Self {
        Self::with_config(store, locker, ExecutorConfig::default())
    }

    pub fn with_config(store: Arc<S>, locker: Arc<L>, config: ExecutorConfig) -> Self {
        Self {
            store,
            locker,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn locker(&self) -> &Arc<L> {
        &self.locker
    }

    /// Execute every entry of `bundle` in order.
    ///
    /// Batch bundles report per-entry failures in their outcomes. Transaction bundles either
    /// commit every entry or roll back and fail with the first error.
    pub async fn execute_bundle(
        &self,
        ctx: &RequestContext,
        bundle: &Bundle,
    ) -> Result<BundleResponse, BundleFailure> {
        let span = ctx.span("execute_bundle");
        self.run(ctx, bundle)
            .instrument(span)
            .await
            .map_err(|error| BundleFailure {
                error,
                request_id: ctx.request_id().to_string(),
                trace_id: ctx.trace_id().to_string(),
            })
    }

    async fn run(&self, ctx: &RequestContext, bundle: &Bundle) -> VitalResult<BundleResponse> {
        if bundle.entries.len() > self.config.max_entries {
            return Err(VitalError::validation(format!(
                "bundle has {} entries, limit is {}",
                bundle.entries.len(),
                self.config.max_entries
            )));
        }
        validate_bundle(bundle)?;

        debug!(state = %BundleState::ComputeLockKeys, "Planning bundle");
        let keys = match bundle.mode {
            BundleMode::Batch if !self.config.lock_batches => Vec::new(),
            _ => lock_keys(bundle),
        };

        info!(
            mode = %bundle.mode,
            entries = bundle.entries.len(),
            lock_keys = keys.len(),
            "Executing bundle"
        );
        debug!(state = %BundleState::AcquireLocks, keys = ?keys);

        let entered = AtomicBool::new(false);
        let result = self
            .locker
            .lock(&keys, |lock_token| {
                entered.store(true, Ordering::SeqCst);
                self.execute_locked(ctx, bundle, lock_token)
            })
            .await;

        match &result {
            Ok(_) => {
                info!(state = %BundleState::Committed, mode = %bundle.mode, "Bundle committed");
                metrics::counter!("vital_bundles_total", "mode" => bundle.mode.as_str(), "outcome" => "committed")
                    .increment(1);
            }
            Err(e) if !entered.load(Ordering::SeqCst) => {
                warn!(state = %BundleState::RejectedConflict, error = %e, "Bundle rejected before execution");
                metrics::counter!("vital_bundles_total", "mode" => bundle.mode.as_str(), "outcome" => "rejected")
                    .increment(1);
            }
            Err(e) => {
                warn!(state = %BundleState::Aborted, error = %e, "Bundle aborted");
                metrics::counter!("vital_bundles_total", "mode" => bundle.mode.as_str(), "outcome" => "aborted")
                    .increment(1);
            }
        }
        result
    }

    async fn execute_locked(
        &self,
        ctx: &RequestContext,
        bundle: &Bundle,
        lock_token: CancellationToken,
    ) -> VitalResult<BundleResponse> {
        debug!(state = %BundleState::ExecuteEntries);
        let mut tx = self.store.begin(ctx).await?;
        let mut resolver = ReferenceResolver::new();
        let mut outcomes = Vec::with_capacity(bundle.entries.len());

        for (index, entry) in bundle.entries.iter().enumerate() {
            match self
                .execute_entry(ctx, &mut tx, &mut resolver, entry, &lock_token)
                .await
            {
                Ok(outcome) => {
                    debug!(index, operation = ?entry.operation, status = outcome.status, "Entry applied");
                    outcomes.push(outcome);
                }
                Err(e) if bundle.mode == BundleMode::Batch && !e.is_bundle_fatal() => {
                    debug!(index, operation = ?entry.operation, error = %e, "Entry failed");
                    outcomes.push(EntryOutcome::failure(&e));
                }
                Err(e) => {
                    warn!(index, target = %entry.target, error = %e, "Entry failed, rolling back");
                    self.rollback(tx).await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = ensure_active(ctx, &lock_token) {
            self.rollback(tx).await;
            return Err(e);
        }

        // Not raced against the lock token: a commit that outlives the lease is applied
        // and the locker still reports LeaseExpired.
        self.store.commit(tx).await.map_err(|e| {
            error!(error = %e, "Commit failed");
            if e.is_bundle_fatal() {
                e
            } else {
                VitalError::server(format!("commit failed: {e}"))
            }
        })?;

        Ok(BundleResponse {
            mode: bundle.mode,
            entries: outcomes,
        })
    }

    async fn rollback(&self, tx: S::Transaction) {
        if let Err(e) = self.store.rollback(tx).await {
            error!(error = %e, "Rollback failed");
        }
    }

    async fn execute_entry(
        &self,
        ctx: &RequestContext,
        tx: &mut S::Transaction,
        resolver: &mut ReferenceResolver,
        entry: &BundleEntry,
        lock_token: &CancellationToken,
    ) -> VitalResult<EntryOutcome> {
        ensure_active(ctx, lock_token)?;

        let target = EntryTarget::parse(&resolver.resolve_target(&entry.target)?)?;
        // Empty criteria would match every resource of the type
        if entry.operation.is_conditional() {
            if let EntryTarget::Conditional { criteria, .. } = &target {
                if criteria.is_empty() {
                    return Err(VitalError::validation(format!(
                        "{:?} of '{}' needs search criteria",
                        entry.operation, entry.target
                    )));
                }
            }
        }
        let access = if entry.operation.is_mutation() {
            AccessMode::Write
        } else {
            AccessMode::Read
        };
        ctx.authorize(target.resource_type(), access)?;

        let payload = match &entry.payload {
            Some(payload) => {
                let mut payload = payload.clone();
                resolver.resolve_payload(&mut payload)?;
                Some(payload)
            }
            None if entry.operation.requires_payload() => {
                return Err(VitalError::validation(format!(
                    "{:?} of '{}' requires a resource",
                    entry.operation, entry.target
                )))
            }
            None => None,
        };

        let outcome = guarded(
            ctx,
            lock_token,
            self.dispatch(tx, entry.operation, target, payload),
        )
        .await?;

        if let (Some(symbolic_id), Some(resource)) = (&entry.symbolic_id, &outcome.resource) {
            if is_symbolic(symbolic_id) {
                if let Some(reference) = reference_string(resource) {
                    resolver.bind(symbolic_id.clone(), reference)?;
                }
            }
        }
        Ok(outcome)
    }

    async fn dispatch(
        &self,
        tx: &mut S::Transaction,
        operation: EntryOperation,
        target: EntryTarget,
        payload: Option<Value>,
    ) -> VitalResult<EntryOutcome> {
        let store = &self.store;
        let payload = payload.unwrap_or(Value::Null);

        let outcome = match (operation, target) {
            (EntryOperation::Create, EntryTarget::Type(resource_type)) => {
                let created = store.create(tx, &resource_type, payload).await?;
                EntryOutcome::success(201, Some(created))
            }
            (EntryOperation::Read, EntryTarget::Instance { resource_type, id }) => {
                let resource = store.read(tx, &resource_type, &id).await?;
                EntryOutcome::success(200, Some(resource))
            }
            (EntryOperation::Search, EntryTarget::Type(resource_type)) => {
                let found = store
                    .search(tx, &resource_type, &SearchCriteria::default())
                    .await?;
                EntryOutcome::success(200, Some(searchset(found)))
            }
            (
                EntryOperation::Search,
                EntryTarget::Conditional {
                    resource_type,
                    criteria,
                },
            ) => {
                let found = store.search(tx, &resource_type, &criteria).await?;
                EntryOutcome::success(200, Some(searchset(found)))
            }
            (EntryOperation::Update, EntryTarget::Instance { resource_type, id }) => {
                if let Some(payload_id) = resource_id(&payload) {
                    if payload_id != id {
                        return Err(VitalError::validation(format!(
                            "resource id '{payload_id}' does not match url id '{id}'"
                        )));
                    }
                }
                let updated = store.update(tx, &resource_type, &id, payload).await?;
                EntryOutcome::success(200, Some(updated))
            }
            (EntryOperation::Delete, EntryTarget::Instance { resource_type, id }) => {
                let removed = store.delete(tx, &resource_type, &id).await?;
                if !removed {
                    debug!(resource_type = %resource_type, id = %id, "Delete of missing resource");
                }
                EntryOutcome::success(200, None)
            }
            (
                EntryOperation::ConditionalCreate,
                EntryTarget::Conditional {
                    resource_type,
                    criteria,
                },
            ) => match store
                .conditional_create(tx, &resource_type, &criteria, payload)
                .await?
            {
                ConditionalCreate::Created(resource) => EntryOutcome::success(201, Some(resource)),
                ConditionalCreate::Existing(resource) => {
                    EntryOutcome::success(200, Some(resource))
                }
            },
            (
                EntryOperation::ConditionalUpdate,
                EntryTarget::Conditional {
                    resource_type,
                    criteria,
                },
            ) => match store
                .conditional_update(tx, &resource_type, &criteria, payload)
                .await?
            {
                ConditionalUpdate::Created(resource) => EntryOutcome::success(201, Some(resource)),
                ConditionalUpdate::Updated(resource) => EntryOutcome::success(200, Some(resource)),
            },
            (
                EntryOperation::ConditionalDelete,
                EntryTarget::Conditional {
                    resource_type,
                    criteria,
                },
            ) => {
                store
                    .conditional_delete(tx, &resource_type, &criteria)
                    .await?;
                EntryOutcome::success(200, None)
            }
            (operation, target) => {
                return Err(VitalError::validation(format!(
                    "{operation:?} is not valid for target {target:?}"
                )))
            }
        };
        Ok(outcome)
    }
}

/// Fail fast when the caller went away or the lock can no longer be trusted.
fn ensure_active(ctx: &RequestContext, lock_token: &CancellationToken) -> VitalResult<()> {
    if ctx.is_cancelled() {
        return Err(VitalError::cancelled("bundle execution"));
    }
    if lock_token.is_cancelled() {
        return Err(VitalError::lease_expired(
            "lock lease expired before the bundle finished",
        ));
    }
    Ok(())
}

/// Race a store call against caller cancellation and lock expiry.
async fn guarded<T, F>(ctx: &RequestContext, lock_token: &CancellationToken, call: F) -> VitalResult<T>
where
    F: Future<Output = VitalResult<T>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancellation_token().cancelled() => Err(VitalError::cancelled("bundle execution")),
        _ = lock_token.cancelled() => Err(VitalError::lease_expired(
            "lock lease expired during a store call",
        )),
        result = call => result,
    }
}
