//! Collector
//!
//! Fans out one task per policy (or per role for the role audit) over a
//! semaphore-gated pool, enriches each entity with last-used timestamps and
//! attachments, and fans the results back in as they complete.
//!
//! Entity-level failures never abort a run: a failed lookup becomes an empty
//! field and a failed page keeps whatever was read before it. Only a policy or
//! role enumeration that produced no page at all is fatal.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::LastUsedCache;
use crate::client::{self, InventoryClient, RetryPolicy};
use crate::error::InventoryError;
use crate::types::{EnrichedRow, Listing, PolicyScope, PolicySummary, RoleRecord, RoleSummary};

/// Default size of the worker pool
pub const DEFAULT_MAX_WORKERS: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct CollectorSettings {
    /// Upper bound on entities processed at once
    pub max_workers: usize,
    pub retry: RetryPolicy,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            retry: RetryPolicy::default(),
        }
    }
}

/// Counters for one collection pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionStats {
    /// Policies or roles enumerated
    pub entities: usize,
    pub rows: usize,
    /// Lookups that failed after retries and were left empty
    pub lookup_failures: usize,
    /// Listings cut short by a failing page
    pub incomplete_listings: usize,
    /// Worker tasks that panicked; their entity is missing from the output
    pub failed_tasks: usize,
    /// Role last-used fetches actually issued
    pub role_fetches: usize,
    pub duration_ms: u64,
}

/// Flat policy/role row-set
#[derive(Debug, Default)]
pub struct Collection {
    pub rows: Vec<EnrichedRow>,
    pub stats: CollectionStats,
}

/// Role records for the live role audit
#[derive(Debug, Default)]
pub struct RoleCollection {
    pub roles: Vec<RoleRecord>,
    pub stats: CollectionStats,
}

/// What one worker task hands back
#[derive(Debug, Default)]
struct Outcome<T> {
    items: Vec<T>,
    lookup_failures: usize,
    incomplete_listings: usize,
}

/// Owned handles each spawned task works with
#[derive(Clone)]
struct Worker {
    client: Arc<dyn InventoryClient>,
    cache: Arc<LastUsedCache>,
    retry: RetryPolicy,
}

impl Worker {
    /// Role last-used through the cache; a failed fetch is cached as unknown
    async fn role_last_used(&self, role_name: &str, failures: &AtomicUsize) -> Option<DateTime<Utc>> {
        self.cache
            .get_or_fetch(role_name, || async {
                let lookup = self
                    .retry
                    .run(role_name, || self.client.role_last_used(role_name))
                    .await;
                match lookup {
                    Ok(last_used) => last_used,
                    Err(e) => {
                        warn!(role = %role_name, error = %e, "Role last-used lookup failed");
                        failures.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                }
            })
            .await
    }

    async fn enrich_policy(self, policy: PolicySummary) -> Outcome<EnrichedRow> {
        let failures = AtomicUsize::new(0);

        let policy_last_used = self
            .retry
            .run(&policy.arn, || self.client.policy_last_used(&policy.arn))
            .await;
        let attached = client::list_attached_roles(&*self.client, &policy.arn, &self.retry).await;

        let policy_last_used = policy_last_used.unwrap_or_else(|e| {
            warn!(policy = %policy.arn, error = %e, "Policy last-used lookup failed");
            failures.fetch_add(1, Ordering::Relaxed);
            None
        });
        let incomplete_listings = usize::from(!attached.is_complete());

        // Sequential: each worker has at most one IAM call in flight
        let mut rows = Vec::with_capacity(attached.items.len().max(1));
        for role in attached.items {
            let role_last_used = self.role_last_used(&role.name, &failures).await;
            rows.push(EnrichedRow {
                policy_name: policy.name.clone(),
                policy_arn: policy.arn.clone(),
                policy_last_used,
                attached_role_name: role.name,
                role_last_used,
            });
        }
        if rows.is_empty() {
            rows.push(EnrichedRow::unattached(&policy, policy_last_used));
        }

        debug!(policy = %policy.name, rows = rows.len(), "Policy enriched");
        Outcome {
            items: rows,
            lookup_failures: failures.into_inner(),
            incomplete_listings,
        }
    }

    async fn enrich_role(self, role: RoleSummary) -> Outcome<RoleRecord> {
        let failures = AtomicUsize::new(0);

        let last_used = self.role_last_used(&role.name, &failures).await;
        let attached = client::list_role_policies(&*self.client, &role.name, &self.retry).await;
        let incomplete_listings = usize::from(!attached.is_complete());

        let record = RoleRecord {
            name: role.name,
            created_at: role.created_at,
            last_used,
            attached_policies: attached.items.into_iter().map(|p| p.name).collect(),
        };

        Outcome {
            items: vec![record],
            lookup_failures: failures.into_inner(),
            incomplete_listings,
        }
    }
}

/// Bounded-concurrency inventory collector
pub struct Collector {
    client: Arc<dyn InventoryClient>,
    cache: Arc<LastUsedCache>,
    settings: CollectorSettings,
}

impl Collector {
    pub fn new(client: Arc<dyn InventoryClient>, cache: Arc<LastUsedCache>, settings: CollectorSettings) -> Self {
        Self {
            client,
            cache,
            settings,
        }
    }

    fn worker(&self) -> Worker {
        Worker {
            client: self.client.clone(),
            cache: self.cache.clone(),
            retry: self.settings.retry,
        }
    }

    /// Enumerate policies in `scope`, then enrich them
    pub async fn collect_policies(&self, scope: PolicyScope) -> Result<Collection, InventoryError> {
        info!(scope = %scope, "📋 Listing IAM policies");
        let listing = client::list_policies(&*self.client, scope, &self.settings.retry).await;
        let (policies, incomplete) = usable(listing)?;

        let mut collection = self.collect(policies).await;
        collection.stats.incomplete_listings += incomplete;
        Ok(collection)
    }

    /// Enrich an already enumerated set of policies
    ///
    /// Row order is not guaranteed.
    pub async fn collect(&self, policies: Vec<PolicySummary>) -> Collection {
        let started = Instant::now();
        let fetches_before = self.cache.fetch_count();
        let entities = policies.len();
        info!(policies = entities, workers = self.settings.max_workers, "🔍 Collecting policy attachments");

        let (rows, mut stats) = self
            .fan_out(policies, |worker, policy| worker.enrich_policy(policy))
            .await;

        stats.entities = entities;
        stats.rows = rows.len();
        stats.role_fetches = self.cache.fetch_count() - fetches_before;
        stats.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            rows = stats.rows,
            lookup_failures = stats.lookup_failures,
            role_fetches = stats.role_fetches,
            duration_ms = stats.duration_ms,
            "✅ Policy collection complete"
        );

        Collection { rows, stats }
    }

    /// Enumerate every role with its last-used time and attached policies
    pub async fn collect_roles(&self) -> Result<RoleCollection, InventoryError> {
        let started = Instant::now();
        let fetches_before = self.cache.fetch_count();

        info!("📋 Listing IAM roles");
        let listing = client::list_roles(&*self.client, &self.settings.retry).await;
        let (roles, incomplete) = usable(listing)?;
        let entities = roles.len();
        info!(roles = entities, workers = self.settings.max_workers, "🔍 Collecting role usage");

        let (roles, mut stats) = self.fan_out(roles, |worker, role| worker.enrich_role(role)).await;

        stats.entities = entities;
        stats.rows = roles.len();
        stats.incomplete_listings += incomplete;
        stats.role_fetches = self.cache.fetch_count() - fetches_before;
        stats.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            roles = stats.rows,
            lookup_failures = stats.lookup_failures,
            duration_ms = stats.duration_ms,
            "✅ Role collection complete"
        );

        Ok(RoleCollection { roles, stats })
    }

    /// Spawn one task per item, at most `max_workers` running at once, and
    /// gather results in completion order
    async fn fan_out<T, R, F, Fut>(&self, items: Vec<T>, work: F) -> (Vec<R>, CollectionStats)
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(Worker, T) -> Fut,
        Fut: Future<Output = Outcome<R>> + Send + 'static,
    {
        let permits = Arc::new(Semaphore::new(self.settings.max_workers.max(1)));
        let mut tasks = JoinSet::new();

        for item in items {
            let permits = permits.clone();
            let job = work(self.worker(), item);
            tasks.spawn(async move {
                // Only errors if the semaphore is closed, which never happens here
                let _permit = permits.acquire_owned().await.ok();
                job.await
            });
        }

        let mut results = Vec::new();
        let mut stats = CollectionStats::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    results.extend(outcome.items);
                    stats.lookup_failures += outcome.lookup_failures;
                    stats.incomplete_listings += outcome.incomplete_listings;
                }
                Err(e) => {
                    error!(error = %e, "Collector task failed");
                    stats.failed_tasks += 1;
                }
            }
        }

        (results, stats)
    }
}

/// Items of an enumeration, or a fatal error if not one page was read
fn usable<T>(listing: Listing<T>) -> Result<(Vec<T>, usize), InventoryError> {
    match listing.error {
        Some(e) if listing.pages == 0 => Err(InventoryError::InventoryUnavailable { source: Box::new(e) }),
        Some(_) => Ok((listing.items, 1)),
        None => Ok((listing.items, 0)),
    }
}
