//! Remote Inventory Client
//!
//! Trait-based abstraction over the identity service. Implementations expose
//! single pages; the helpers here drive the marker loop to exhaustion so
//! callers never stop early or miss a page.

pub mod iam;
pub mod retry;
pub mod sigv4;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use tracing::{debug, warn};

use crate::error::InventoryError;
use crate::types::{AttachedPolicy, Listing, Page, PolicyScope, PolicySummary, RoleRef, RoleSummary};

pub use iam::IamQueryClient;
pub use retry::RetryPolicy;
pub use sigv4::{Credentials, SigV4Signer};

/// Read access to the identity service
#[async_trait]
pub trait InventoryClient: Send + Sync {
    /// One page of managed policies
    async fn list_policies_page(
        &self,
        scope: PolicyScope,
        marker: Option<String>,
    ) -> Result<Page<PolicySummary>, InventoryError>;

    /// When a policy was last used, `None` if untracked
    async fn policy_last_used(&self, policy_arn: &str) -> Result<Option<DateTime<Utc>>, InventoryError>;

    /// One page of roles attached to a policy
    async fn list_attached_roles_page(
        &self,
        policy_arn: &str,
        marker: Option<String>,
    ) -> Result<Page<RoleRef>, InventoryError>;

    /// When a role was last used, `None` if never
    async fn role_last_used(&self, role_name: &str) -> Result<Option<DateTime<Utc>>, InventoryError>;

    /// One page of roles in the account
    async fn list_roles_page(&self, marker: Option<String>) -> Result<Page<RoleSummary>, InventoryError>;

    /// One page of managed policies attached to a role
    async fn list_role_policies_page(
        &self,
        role_name: &str,
        marker: Option<String>,
    ) -> Result<Page<AttachedPolicy>, InventoryError>;
}

/// Follow markers until the last page or the first failure
pub async fn exhaust<T, F, Fut>(listing: &str, mut fetch: F) -> Listing<T>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, InventoryError>>,
{
    let mut items = Vec::new();
    let mut pages = 0;
    let mut marker = None;

    loop {
        match fetch(marker.take()).await {
            Ok(page) => {
                pages += 1;
                items.extend(page.items);
                match page.next_marker {
                    Some(next) => marker = Some(next),
                    None => break,
                }
            }
            Err(e) => {
                warn!(listing = %listing, pages, error = %e, "Listing incomplete");
                return Listing {
                    items,
                    pages,
                    error: Some(InventoryError::Pagination {
                        listing: listing.to_string(),
                        pages_fetched: pages,
                        source: Box::new(e),
                    }),
                };
            }
        }
    }

    debug!(listing = %listing, pages, items = items.len(), "Listing complete");
    Listing {
        items,
        pages,
        error: None,
    }
}

pub async fn list_policies(
    client: &dyn InventoryClient,
    scope: PolicyScope,
    retry: &RetryPolicy,
) -> Listing<PolicySummary> {
    exhaust("policies", move |marker| async move {
        retry
            .run("policies page", || client.list_policies_page(scope, marker.clone()))
            .await
    })
    .await
}

pub async fn list_attached_roles(
    client: &dyn InventoryClient,
    policy_arn: &str,
    retry: &RetryPolicy,
) -> Listing<RoleRef> {
    let listing = format!("roles attached to {}", policy_arn);
    exhaust(&listing, move |marker| async move {
        retry
            .run(policy_arn, || client.list_attached_roles_page(policy_arn, marker.clone()))
            .await
    })
    .await
}

pub async fn list_roles(client: &dyn InventoryClient, retry: &RetryPolicy) -> Listing<RoleSummary> {
    exhaust("roles", move |marker| async move {
        retry
            .run("roles page", || client.list_roles_page(marker.clone()))
            .await
    })
    .await
}

pub async fn list_role_policies(
    client: &dyn InventoryClient,
    role_name: &str,
    retry: &RetryPolicy,
) -> Listing<AttachedPolicy> {
    let listing = format!("policies attached to role {}", role_name);
    exhaust(&listing, move |marker| async move {
        retry
            .run(role_name, || client.list_role_policies_page(role_name, marker.clone()))
            .await
    })
    .await
}
