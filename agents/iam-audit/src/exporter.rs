//! CSV export to a local file or an S3 object
//!
//! Rows are rendered, sorted and serialized in memory, then written with a
//! single bulk write, so the same row-set always yields the same bytes.

use chrono::Utc;
use csv::Writer;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::client::sigv4::{encode_path, SignableRequest, SigV4Signer};
use crate::error::InventoryError;
use crate::types::{format_timestamp, ClassifiedRecord, EnrichedRow};

/// Default object key for the policy inventory
pub const DEFAULT_POLICY_REPORT: &str = "custom_iam_policies_with_roles.csv";

/// Default object key for role classification
pub const DEFAULT_ROLE_REPORT: &str = "classified_roles.csv";

/// A row type with a fixed column layout
pub trait Tabular {
    const HEADER: &'static [&'static str];

    /// Field values in `HEADER` order
    fn record(&self) -> Vec<String>;
}

impl Tabular for EnrichedRow {
    const HEADER: &'static [&'static str] = &[
        "PolicyName",
        "PolicyArn",
        "PolicyLastUsed",
        "AttachedRoleName",
        "RoleLastUsed",
    ];

    fn record(&self) -> Vec<String> {
        vec![
            self.policy_name.clone(),
            self.policy_arn.clone(),
            format_timestamp(self.policy_last_used.as_ref()),
            self.attached_role_name.clone(),
            format_timestamp(self.role_last_used.as_ref()),
        ]
    }
}

impl Tabular for ClassifiedRecord {
    const HEADER: &'static [&'static str] = &[
        "RoleName",
        "CreationDate",
        "LastUsed",
        "DaysSinceLastUsed",
        "DaysSinceCreation",
        "AttachedPolicies",
        "Action",
        "Category",
    ];

    fn record(&self) -> Vec<String> {
        vec![
            self.role_name.clone(),
            format_timestamp(self.created_at.as_ref()),
            format_timestamp(self.last_used.as_ref()),
            self.days_since_last_used.map(|d| d.to_string()).unwrap_or_default(),
            self.days_since_creation.map(|d| d.to_string()).unwrap_or_default(),
            self.attached_policies.join("; "),
            self.action.to_string(),
            self.category.to_string(),
        ]
    }
}

/// Serialize rows with a header, sorted by their rendered fields
pub fn to_csv<T: Tabular>(rows: &[T]) -> Result<Vec<u8>, csv::Error> {
    let mut records: Vec<Vec<String>> = rows.iter().map(Tabular::record).collect();
    records.sort();

    let mut wtr = Writer::from_writer(vec![]);
    wtr.write_record(T::HEADER)?;
    for record in &records {
        wtr.write_record(record)?;
    }
    wtr.into_inner().map_err(|e| e.into_error().into())
}

/// Where the export goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Local(PathBuf),
    S3 { bucket: String, key: String },
}

impl FromStr for Destination {
    type Err = InventoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(InventoryError::Config("empty export destination".to_string()));
        }

        match s.strip_prefix("s3://") {
            Some(rest) => match rest.split_once('/') {
                Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok(Destination::S3 {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }),
                _ => Err(InventoryError::Config(format!(
                    "S3 destination must look like s3://bucket/key, got {}",
                    s
                ))),
            },
            None => Ok(Destination::Local(PathBuf::from(s))),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Local(path) => write!(f, "{}", path.display()),
            Destination::S3 { bucket, key } => write!(f, "s3://{}/{}", bucket, key),
        }
    }
}

/// Writes serialized reports
pub struct Exporter {
    http: reqwest::Client,
    /// Needed only for S3 destinations
    signer: Option<SigV4Signer>,
}

impl Exporter {
    pub fn new(signer: Option<SigV4Signer>) -> Result<Self, InventoryError> {
        let http = reqwest::Client::builder()
            .user_agent("lornu-iam-audit/0.1.0")
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| InventoryError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http, signer })
    }

    /// Exporter for local files only
    pub fn local() -> Result<Self, InventoryError> {
        Self::new(None)
    }

    /// Serialize `rows` and write them to `destination`, returning bytes written
    pub async fn export<T: Tabular>(&self, rows: &[T], destination: &Destination) -> Result<usize, InventoryError> {
        let body = to_csv(rows).map_err(|e| InventoryError::export(destination, e))?;
        let bytes = body.len();
        self.write(destination, body).await?;

        info!(destination = %destination, rows = rows.len(), bytes, "💾 Report written");
        Ok(bytes)
    }

    async fn write(&self, destination: &Destination, body: Vec<u8>) -> Result<(), InventoryError> {
        match destination {
            Destination::Local(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| InventoryError::export(destination, e))?;
                }
                tokio::fs::write(path, body)
                    .await
                    .map_err(|e| InventoryError::export(destination, e))
            }
            Destination::S3 { bucket, key } => self.put_object(destination, bucket, key, body).await,
        }
    }

    async fn put_object(
        &self,
        destination: &Destination,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
    ) -> Result<(), InventoryError> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            InventoryError::Config(format!("AWS credentials are required to write {}", destination))
        })?;

        let host = format!("{}.s3.{}.amazonaws.com", bucket, signer.region());
        let path = format!("/{}", encode_path(key));
        let request = SignableRequest {
            method: "PUT",
            host: &host,
            path: &path,
            query: "",
            headers: vec![("content-type", "text/csv".to_string())],
            payload: &body,
            sign_content_hash: true,
        };
        let signed = signer.sign(&request, Utc::now())?;

        let mut req = self
            .http
            .put(format!("https://{}{}", host, path))
            .header("content-type", "text/csv");
        for (name, value) in signed {
            req = req.header(name, value);
        }

        let response = req
            .body(body)
            .send()
            .await
            .map_err(|e| InventoryError::export(destination, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(InventoryError::export(destination, format!("HTTP {}: {}", status, text)));
        }

        Ok(())
    }
}
