//! Collector behaviour against an in-memory inventory

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use iam_audit::types::{
    Action, AttachedPolicy, Category, Page, PolicyScope, PolicySummary, RoleRef, RoleSummary,
};
use iam_audit::{
    Classifier, ClassifierConfig, Collector, CollectorSettings, InventoryClient, InventoryError, LastUsedCache,
    RetryPolicy,
};

#[derive(Default)]
struct FakeInventory {
    policies: Vec<PolicySummary>,
    policy_page_size: usize,
    failing_policy_pages: HashSet<usize>,
    /// policy ARN -> last-used time
    policy_last_used: HashMap<String, DateTime<Utc>>,
    failing_policies: HashSet<String>,
    /// policy ARN -> attached role names
    attachments: HashMap<String, Vec<String>>,
    attachment_page_size: usize,
    /// policy ARN -> attachment page that fails
    failing_attachment_pages: HashMap<String, usize>,
    role_last_used: HashMap<String, DateTime<Utc>>,
    failing_roles: HashSet<String>,
    roles: Vec<RoleSummary>,
    /// role name -> attached policy names
    role_policies: HashMap<String, Vec<String>>,
    delay: Duration,

    role_calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeInventory {
    fn attach(&mut self, policy: &str, roles: &[&str]) {
        let policy = summary(policy);
        self.attachments
            .insert(policy.arn.clone(), roles.iter().map(|r| r.to_string()).collect());
        self.policies.push(policy);
    }

    fn role_calls(&self, role: &str) -> usize {
        self.role_calls.lock().unwrap().get(role).copied().unwrap_or(0)
    }

    fn peak_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Simulated per-entity IAM call, counted while it is outstanding
    async fn remote_call(&self, latency: Duration) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(latency).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl InventoryClient for FakeInventory {
    async fn list_policies_page(
        &self,
        _scope: PolicyScope,
        marker: Option<String>,
    ) -> Result<Page<PolicySummary>, InventoryError> {
        let page: usize = marker.map(|m| m.parse().unwrap()).unwrap_or(0);
        if self.failing_policy_pages.contains(&page) {
            return Err(InventoryError::lookup("policies", "AccessDenied"));
        }

        let size = self.policy_page_size.max(1);
        let items = self.policies.iter().skip(page * size).take(size).cloned().collect();
        let next_marker = ((page + 1) * size < self.policies.len()).then(|| (page + 1).to_string());
        Ok(Page { items, next_marker })
    }

    async fn policy_last_used(&self, policy_arn: &str) -> Result<Option<DateTime<Utc>>, InventoryError> {
        self.remote_call(self.delay).await;
        if self.failing_policies.contains(policy_arn) {
            return Err(InventoryError::lookup(policy_arn, "AccessDenied"));
        }
        Ok(self.policy_last_used.get(policy_arn).copied())
    }

    async fn list_attached_roles_page(
        &self,
        policy_arn: &str,
        marker: Option<String>,
    ) -> Result<Page<RoleRef>, InventoryError> {
        self.remote_call(self.delay).await;
        let page: usize = marker.map(|m| m.parse().unwrap()).unwrap_or(0);
        if self.failing_attachment_pages.get(policy_arn) == Some(&page) {
            return Err(InventoryError::lookup(policy_arn, "AccessDenied"));
        }

        let names = self.attachments.get(policy_arn).cloned().unwrap_or_default();
        if self.attachment_page_size == 0 {
            return Ok(Page::last(names.into_iter().map(|name| RoleRef { name }).collect()));
        }
        let size = self.attachment_page_size;
        let items = names
            .iter()
            .skip(page * size)
            .take(size)
            .map(|name| RoleRef { name: name.clone() })
            .collect();
        let next_marker = ((page + 1) * size < names.len()).then(|| (page + 1).to_string());
        Ok(Page { items, next_marker })
    }

    async fn role_last_used(&self, role_name: &str) -> Result<Option<DateTime<Utc>>, InventoryError> {
        *self
            .role_calls
            .lock()
            .unwrap()
            .entry(role_name.to_string())
            .or_insert(0) += 1;
        self.remote_call(self.delay.max(Duration::from_millis(5))).await;

        if self.failing_roles.contains(role_name) {
            return Err(InventoryError::transient(role_name, "ServiceUnavailable"));
        }
        Ok(self.role_last_used.get(role_name).copied())
    }

    async fn list_roles_page(&self, _marker: Option<String>) -> Result<Page<RoleSummary>, InventoryError> {
        Ok(Page::last(self.roles.clone()))
    }

    async fn list_role_policies_page(
        &self,
        role_name: &str,
        _marker: Option<String>,
    ) -> Result<Page<AttachedPolicy>, InventoryError> {
        self.remote_call(self.delay).await;
        let policies = self
            .role_policies
            .get(role_name)
            .map(|names| {
                names
                    .iter()
                    .map(|name| AttachedPolicy {
                        name: name.clone(),
                        arn: format!("arn:aws:iam::123456789012:policy/{}", name),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Page::last(policies))
    }
}

fn summary(name: &str) -> PolicySummary {
    PolicySummary {
        name: name.to_string(),
        arn: format!("arn:aws:iam::123456789012:policy/{}", name),
    }
}

fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn collector(fake: Arc<FakeInventory>, workers: usize, retry: RetryPolicy) -> Collector {
    let settings = CollectorSettings {
        max_workers: workers,
        retry,
    };
    Collector::new(fake, Arc::new(LastUsedCache::new()), settings)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_role_is_fetched_once_across_policies() {
    let mut fake = FakeInventory::default();
    for i in 0..20 {
        let own = format!("Role{}", i);
        fake.attach(&format!("Policy{}", i), &["SharedRole", own.as_str()]);
    }
    fake.role_last_used.insert("SharedRole".to_string(), ts(2024, 5, 1));
    let fake = Arc::new(fake);

    let collection = collector(fake.clone(), 8, RetryPolicy::none())
        .collect_policies(PolicyScope::Local)
        .await
        .unwrap();

    assert_eq!(collection.rows.len(), 40);
    assert_eq!(fake.role_calls("SharedRole"), 1);
    assert_eq!(collection.stats.role_fetches, 21);

    let shared: Vec<_> = collection
        .rows
        .iter()
        .filter(|row| row.attached_role_name == "SharedRole")
        .collect();
    assert_eq!(shared.len(), 20);
    assert!(shared.iter().all(|row| row.role_last_used == Some(ts(2024, 5, 1))));
}

#[tokio::test]
async fn policy_without_roles_yields_one_empty_row() {
    let mut fake = FakeInventory::default();
    fake.attach("OrphanPolicy", &[]);
    fake.attach("UsedPolicy", &["AppRole"]);

    let collection = collector(Arc::new(fake), 2, RetryPolicy::none())
        .collect_policies(PolicyScope::Local)
        .await
        .unwrap();

    let orphan: Vec<_> = collection
        .rows
        .iter()
        .filter(|row| row.policy_name == "OrphanPolicy")
        .collect();
    assert_eq!(orphan.len(), 1);
    assert_eq!(orphan[0].policy_arn, "arn:aws:iam::123456789012:policy/OrphanPolicy");
    assert!(!orphan[0].has_role());
    assert_eq!(orphan[0].role_last_used, None);
}

#[tokio::test]
async fn failed_role_lookup_degrades_to_empty_field() {
    let mut fake = FakeInventory::default();
    for i in 0..50 {
        let role = format!("Role{}", i);
        fake.attach(&format!("Policy{}", i), &[role.as_str()]);
        fake.role_last_used.insert(role, ts(2024, 6, 1));
    }
    fake.failing_roles.insert("Role17".to_string());
    let fake = Arc::new(fake);

    let collection = collector(fake.clone(), 10, RetryPolicy::new(2, Duration::ZERO))
        .collect_policies(PolicyScope::Local)
        .await
        .unwrap();

    assert_eq!(collection.rows.len(), 50);
    let failed = collection
        .rows
        .iter()
        .find(|row| row.attached_role_name == "Role17")
        .unwrap();
    assert_eq!(failed.role_last_used, None);
    assert_eq!(
        collection.rows.iter().filter(|row| row.role_last_used.is_some()).count(),
        49
    );
    assert_eq!(collection.stats.lookup_failures, 1);
    assert_eq!(fake.role_calls("Role17"), 3);
}

#[tokio::test]
async fn failing_policy_page_keeps_earlier_pages() {
    let mut fake = FakeInventory::default();
    for i in 0..5 {
        fake.attach(&format!("Policy{}", i), &[]);
    }
    fake.policy_page_size = 2;
    fake.failing_policy_pages.insert(2);

    let collection = collector(Arc::new(fake), 4, RetryPolicy::none())
        .collect_policies(PolicyScope::Local)
        .await
        .unwrap();

    assert_eq!(collection.rows.len(), 4);
    assert_eq!(collection.stats.entities, 4);
    assert_eq!(collection.stats.incomplete_listings, 1);
}

#[tokio::test]
async fn unreadable_policy_listing_is_fatal() {
    let mut fake = FakeInventory::default();
    fake.attach("Policy0", &[]);
    fake.failing_policy_pages.insert(0);

    let result = collector(Arc::new(fake), 4, RetryPolicy::none())
        .collect_policies(PolicyScope::Local)
        .await;

    assert!(matches!(result, Err(InventoryError::InventoryUnavailable { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_stays_within_worker_limit() {
    let mut fake = FakeInventory::default();
    for i in 0..30 {
        let roles: Vec<String> = (0..5).map(|r| format!("Role{}-{}", i, r)).collect();
        let roles: Vec<&str> = roles.iter().map(String::as_str).collect();
        fake.attach(&format!("Policy{}", i), &roles);
    }
    fake.delay = Duration::from_millis(10);
    let fake = Arc::new(fake);

    let collection = collector(fake.clone(), 4, RetryPolicy::none())
        .collect(fake.policies.clone())
        .await;

    assert_eq!(collection.rows.len(), 150);
    let peak = fake.peak_in_flight();
    assert!(peak >= 1);
    assert!(peak <= 4, "peak concurrency {} exceeded 4 workers", peak);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_worker_resolves_roles_one_at_a_time() {
    let mut fake = FakeInventory::default();
    let roles: Vec<String> = (0..40).map(|r| format!("Role{}", r)).collect();
    let roles: Vec<&str> = roles.iter().map(String::as_str).collect();
    fake.attach("BusyPolicy", &roles);
    fake.delay = Duration::from_millis(2);
    let fake = Arc::new(fake);

    let collection = collector(fake.clone(), 1, RetryPolicy::none())
        .collect_policies(PolicyScope::Local)
        .await
        .unwrap();

    assert_eq!(collection.rows.len(), 40);
    assert_eq!(collection.stats.role_fetches, 40);
    assert_eq!(fake.peak_in_flight(), 1);
}

#[tokio::test]
async fn failed_policy_lookup_degrades_to_empty_field() {
    let mut fake = FakeInventory::default();
    fake.attach("Locked", &["AppRole"]);
    fake.attach("Open", &["AppRole", "BatchRole"]);
    let locked = summary("Locked").arn;
    let open = summary("Open").arn;
    fake.failing_policies.insert(locked.clone());
    fake.policy_last_used.insert(locked, ts(2024, 1, 1));
    fake.policy_last_used.insert(open, ts(2024, 6, 2));

    let collection = collector(Arc::new(fake), 2, RetryPolicy::none())
        .collect_policies(PolicyScope::Local)
        .await
        .unwrap();

    assert_eq!(collection.rows.len(), 3);
    for row in &collection.rows {
        match row.policy_name.as_str() {
            "Locked" => {
                assert_eq!(row.policy_last_used, None);
                assert_eq!(row.attached_role_name, "AppRole");
            }
            _ => assert_eq!(row.policy_last_used, Some(ts(2024, 6, 2))),
        }
    }
    assert_eq!(collection.stats.lookup_failures, 1);
    assert_eq!(collection.stats.incomplete_listings, 0);
}

#[tokio::test]
async fn attached_roles_are_read_across_pages() {
    let mut fake = FakeInventory::default();
    fake.attach("Wide", &["R0", "R1", "R2", "R3", "R4"]);
    fake.attachment_page_size = 2;

    let collection = collector(Arc::new(fake), 2, RetryPolicy::none())
        .collect_policies(PolicyScope::Local)
        .await
        .unwrap();

    let mut roles: Vec<_> = collection
        .rows
        .iter()
        .map(|row| row.attached_role_name.as_str())
        .collect();
    roles.sort();
    assert_eq!(roles, vec!["R0", "R1", "R2", "R3", "R4"]);
    assert_eq!(collection.stats.incomplete_listings, 0);
}

#[tokio::test]
async fn failing_attachment_page_keeps_earlier_roles() {
    let mut fake = FakeInventory::default();
    fake.attach("Wide", &["R0", "R1", "R2", "R3", "R4"]);
    fake.attach("Narrow", &["Solo"]);
    fake.attachment_page_size = 2;
    fake.failing_attachment_pages.insert(summary("Wide").arn, 1);

    let collection = collector(Arc::new(fake), 2, RetryPolicy::none())
        .collect_policies(PolicyScope::Local)
        .await
        .unwrap();

    let mut wide: Vec<_> = collection
        .rows
        .iter()
        .filter(|row| row.policy_name == "Wide")
        .map(|row| row.attached_role_name.as_str())
        .collect();
    wide.sort();
    assert_eq!(wide, vec!["R0", "R1"]);
    assert!(collection.rows.iter().any(|row| row.attached_role_name == "Solo"));
    assert_eq!(collection.stats.rows, 3);
    assert_eq!(collection.stats.incomplete_listings, 1);
}

#[tokio::test]
async fn role_audit_collects_and_classifies() {
    let prefix = "2FA-otp-trigger-workflow-";
    let mut fake = FakeInventory::default();
    fake.roles = vec![
        RoleSummary {
            name: format!("{}lambda", prefix),
            created_at: Some(ts(2023, 1, 1)),
        },
        RoleSummary {
            name: "DevRole".to_string(),
            created_at: Some(ts(2022, 1, 1)),
        },
        RoleSummary {
            name: "Forgotten".to_string(),
            created_at: None,
        },
    ];
    fake.role_last_used.insert(format!("{}lambda", prefix), ts(2024, 6, 20));
    fake.role_last_used.insert("DevRole".to_string(), ts(2023, 12, 13));
    fake.role_policies
        .insert(format!("{}lambda", prefix), vec!["LambdaExec".to_string()]);
    let fake = Arc::new(fake);

    let roles = collector(fake, 2, RetryPolicy::none())
        .collect_roles()
        .await
        .unwrap();
    assert_eq!(roles.stats.entities, 3);
    assert_eq!(roles.roles.len(), 3);

    let classifier = Classifier::new(ClassifierConfig::default(), NaiveDate::from_ymd_opt(2024, 6, 30).unwrap());
    let verdict_of = |name: &str| {
        let record = roles.roles.iter().find(|r| r.name == name).unwrap();
        let classified = classifier.classify(record);
        (classified.action, classified.category)
    };

    assert_eq!(verdict_of(&format!("{}lambda", prefix)), (Action::Keep, Category::None));
    assert_eq!(verdict_of("DevRole"), (Action::Remove, Category::StaleRoles));
    assert_eq!(verdict_of("Forgotten"), (Action::Remove, Category::AbandonedRoles));
}

#[tokio::test]
async fn cache_is_shared_between_passes() {
    let mut fake = FakeInventory::default();
    fake.attach("Policy0", &["AppRole"]);
    fake.roles = vec![RoleSummary {
        name: "AppRole".to_string(),
        created_at: None,
    }];
    let fake = Arc::new(fake);

    let cache = Arc::new(LastUsedCache::new());
    let collector = Collector::new(fake.clone(), cache.clone(), CollectorSettings::default());

    collector.collect_policies(PolicyScope::Local).await.unwrap();
    let roles = collector.collect_roles().await.unwrap();

    assert_eq!(fake.role_calls("AppRole"), 1);
    assert_eq!(roles.stats.role_fetches, 0);
    assert_eq!(cache.fetch_count(), 1);
}
