//! IAM Audit Agent Library
//!
//! Collects IAM policy and role inventory through a bounded, cached worker
//! pool, classifies roles for cleanup and exports the results as CSV to a
//! local file or S3.

pub mod cache;
pub mod classifier;
pub mod client;
pub mod collector;
pub mod error;
pub mod exporter;
pub mod inventory;
pub mod types;

pub use cache::LastUsedCache;
pub use classifier::{AbsentLastUsed, Classifier, ClassifierConfig};
pub use client::{Credentials, IamQueryClient, InventoryClient, RetryPolicy, SigV4Signer};
pub use collector::{Collection, CollectionStats, Collector, CollectorSettings, RoleCollection};
pub use error::InventoryError;
pub use exporter::{Destination, Exporter};
