//! AWS IAM Query API Client
//!
//! Type-safe wrapper over the IAM Query API (form-encoded POST, XML
//! responses). Handles request signing, paging markers and error responses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::sigv4::{encode_params, Credentials, SigV4Signer, SignableRequest};
use super::InventoryClient;
use crate::error::InventoryError;
use crate::types::{
    parse_timestamp, AttachedPolicy, Page, PolicyScope, PolicySummary, RoleRef, RoleSummary,
};

const DEFAULT_IAM_ENDPOINT: &str = "https://iam.amazonaws.com";
const IAM_API_VERSION: &str = "2010-05-08";
/// IAM is a global service signed in us-east-1
const IAM_SIGNING_REGION: &str = "us-east-1";
const DEFAULT_PAGE_SIZE: u32 = 50;
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

/// Error codes worth retrying
const TRANSIENT_CODES: &[&str] = &["Throttling", "RequestLimitExceeded", "ServiceUnavailable"];

/// IAM Query API client
pub struct IamQueryClient {
    client: Client,
    endpoint: String,
    host: String,
    signer: SigV4Signer,
    page_size: u32,
}

// ============================================================
// API Response Types
// ============================================================

/// `<member>` list; an absent wrapper element reads as empty
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Members<T> {
    #[serde(rename = "member", default)]
    items: Vec<T>,
}

impl<T> Default for Members<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
struct ListPoliciesResponse {
    #[serde(rename = "ListPoliciesResult")]
    result: ListPoliciesResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListPoliciesResult {
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    marker: Option<String>,
    #[serde(default)]
    policies: Members<PolicyMember>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PolicyMember {
    policy_name: String,
    arn: String,
}

#[derive(Debug, Deserialize)]
struct GetPolicyResponse {
    #[serde(rename = "GetPolicyResult")]
    result: GetPolicyResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetPolicyResult {
    policy: PolicyDetail,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PolicyDetail {
    #[serde(default)]
    policy_last_used: Option<LastUsed>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LastUsed {
    #[serde(default)]
    last_used_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListEntitiesForPolicyResponse {
    #[serde(rename = "ListEntitiesForPolicyResult")]
    result: ListEntitiesForPolicyResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntitiesForPolicyResult {
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    marker: Option<String>,
    #[serde(default)]
    policy_roles: Members<RoleMember>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleMember {
    role_name: String,
    #[serde(default)]
    create_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetRoleResponse {
    #[serde(rename = "GetRoleResult")]
    result: GetRoleResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetRoleResult {
    role: RoleDetail,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleDetail {
    #[serde(default)]
    role_last_used: Option<LastUsed>,
}

#[derive(Debug, Deserialize)]
struct ListRolesResponse {
    #[serde(rename = "ListRolesResult")]
    result: ListRolesResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListRolesResult {
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    marker: Option<String>,
    #[serde(default)]
    roles: Members<RoleMember>,
}

#[derive(Debug, Deserialize)]
struct ListAttachedRolePoliciesResponse {
    #[serde(rename = "ListAttachedRolePoliciesResult")]
    result: ListAttachedRolePoliciesResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListAttachedRolePoliciesResult {
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    marker: Option<String>,
    #[serde(default)]
    attached_policies: Members<AttachedPolicyMember>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttachedPolicyMember {
    policy_name: String,
    policy_arn: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "Error")]
    error: ApiError,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiError {
    code: String,
    #[serde(default)]
    message: Option<String>,
}

// ============================================================
// Response Parsing
// ============================================================

fn next_marker(is_truncated: bool, marker: Option<String>) -> Option<String> {
    if is_truncated {
        marker.filter(|m| !m.is_empty())
    } else {
        None
    }
}

fn decode<T: serde::de::DeserializeOwned>(xml: &str, entity: &str) -> Result<T, InventoryError> {
    quick_xml::de::from_str(xml)
        .map_err(|e| InventoryError::lookup(entity, format!("Failed to parse IAM response: {}", e)))
}

pub(crate) fn parse_list_policies(xml: &str) -> Result<Page<PolicySummary>, InventoryError> {
    let response: ListPoliciesResponse = decode(xml, "policies")?;
    let result = response.result;

    Ok(Page {
        items: result
            .policies
            .items
            .into_iter()
            .map(|p| PolicySummary {
                name: p.policy_name,
                arn: p.arn,
            })
            .collect(),
        next_marker: next_marker(result.is_truncated, result.marker),
    })
}

pub(crate) fn parse_policy_last_used(xml: &str, policy_arn: &str) -> Result<Option<DateTime<Utc>>, InventoryError> {
    let response: GetPolicyResponse = decode(xml, policy_arn)?;
    Ok(response
        .result
        .policy
        .policy_last_used
        .and_then(|u| u.last_used_date)
        .and_then(|d| parse_timestamp(&d)))
}

pub(crate) fn parse_attached_roles(xml: &str, policy_arn: &str) -> Result<Page<RoleRef>, InventoryError> {
    let response: ListEntitiesForPolicyResponse = decode(xml, policy_arn)?;
    let result = response.result;

    Ok(Page {
        items: result
            .policy_roles
            .items
            .into_iter()
            .map(|r| RoleRef { name: r.role_name })
            .collect(),
        next_marker: next_marker(result.is_truncated, result.marker),
    })
}

pub(crate) fn parse_role_last_used(xml: &str, role_name: &str) -> Result<Option<DateTime<Utc>>, InventoryError> {
    let response: GetRoleResponse = decode(xml, role_name)?;
    Ok(response
        .result
        .role
        .role_last_used
        .and_then(|u| u.last_used_date)
        .and_then(|d| parse_timestamp(&d)))
}

pub(crate) fn parse_list_roles(xml: &str) -> Result<Page<RoleSummary>, InventoryError> {
    let response: ListRolesResponse = decode(xml, "roles")?;
    let result = response.result;

    Ok(Page {
        items: result
            .roles
            .items
            .into_iter()
            .map(|r| RoleSummary {
                created_at: r.create_date.as_deref().and_then(parse_timestamp),
                name: r.role_name,
            })
            .collect(),
        next_marker: next_marker(result.is_truncated, result.marker),
    })
}

pub(crate) fn parse_role_policies(xml: &str, role_name: &str) -> Result<Page<AttachedPolicy>, InventoryError> {
    let response: ListAttachedRolePoliciesResponse = decode(xml, role_name)?;
    let result = response.result;

    Ok(Page {
        items: result
            .attached_policies
            .items
            .into_iter()
            .map(|p| AttachedPolicy {
                name: p.policy_name,
                arn: p.policy_arn,
            })
            .collect(),
        next_marker: next_marker(result.is_truncated, result.marker),
    })
}

/// Turn an `<ErrorResponse>` body into a lookup error
pub(crate) fn parse_error(xml: &str, entity: &str, server_error: bool) -> InventoryError {
    match quick_xml::de::from_str::<ErrorResponse>(xml) {
        Ok(response) => {
            let code = response.error.code;
            let message = match response.error.message {
                Some(m) => format!("{}: {}", code, m),
                None => code.clone(),
            };
            if server_error || TRANSIENT_CODES.contains(&code.as_str()) {
                InventoryError::transient(entity, message)
            } else {
                InventoryError::lookup(entity, message)
            }
        }
        Err(_) if server_error => InventoryError::transient(entity, "IAM service error"),
        Err(_) => InventoryError::lookup(entity, "Unrecognized IAM error response"),
    }
}

// ============================================================
// Client Implementation
// ============================================================

impl IamQueryClient {
    /// Create a client against the public IAM endpoint
    pub fn new(credentials: Credentials) -> Result<Self, InventoryError> {
        Self::with_endpoint(credentials, DEFAULT_IAM_ENDPOINT)
    }

    /// Create a client against a custom endpoint (e.g. a local emulator)
    pub fn with_endpoint(credentials: Credentials, endpoint: &str) -> Result<Self, InventoryError> {
        let url = Url::parse(endpoint)
            .map_err(|e| InventoryError::Config(format!("Invalid IAM endpoint {}: {}", endpoint, e)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(InventoryError::Config(format!(
                    "IAM endpoint has no host: {}",
                    endpoint
                )))
            }
        };

        let client = Client::builder()
            .user_agent("lornu-iam-audit/0.1.0")
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| InventoryError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string() + "/",
            host,
            signer: SigV4Signer::new(credentials, IAM_SIGNING_REGION, "iam"),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Set the `MaxItems` page size (1..=1000)
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, 1000);
        self
    }

    /// Issue one signed Query API call and return the raw XML body
    async fn call(&self, action: &str, params: &[(&str, &str)], entity: &str) -> Result<String, InventoryError> {
        let mut all_params = vec![("Action", action), ("Version", IAM_API_VERSION)];
        all_params.extend_from_slice(params);
        let body = encode_params(&all_params);

        let signable = SignableRequest {
            method: "POST",
            host: &self.host,
            path: "/",
            query: "",
            headers: vec![("content-type", FORM_CONTENT_TYPE.to_string())],
            payload: body.as_bytes(),
            sign_content_hash: false,
        };
        let signed = self.signer.sign(&signable, Utc::now())?;

        debug!(action = %action, entity = %entity, "Calling IAM");

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("content-type", FORM_CONTENT_TYPE);
        for (name, value) in signed {
            request = request.header(name, value);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| InventoryError::transient(entity, format!("Request to IAM failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| InventoryError::transient(entity, format!("Failed to read IAM response: {}", e)))?;

        if !status.is_success() {
            return Err(parse_error(&text, entity, status.is_server_error()));
        }

        Ok(text)
    }

    fn page_size_param(&self) -> String {
        self.page_size.to_string()
    }
}

#[async_trait]
impl InventoryClient for IamQueryClient {
    async fn list_policies_page(
        &self,
        scope: PolicyScope,
        marker: Option<String>,
    ) -> Result<Page<PolicySummary>, InventoryError> {
        let max_items = self.page_size_param();
        let mut params = vec![("Scope", scope.as_query_value()), ("MaxItems", max_items.as_str())];
        if let Some(m) = marker.as_deref() {
            params.push(("Marker", m));
        }

        let xml = self.call("ListPolicies", &params, "policies").await?;
        parse_list_policies(&xml)
    }

    async fn policy_last_used(&self, policy_arn: &str) -> Result<Option<DateTime<Utc>>, InventoryError> {
        let xml = self
            .call("GetPolicy", &[("PolicyArn", policy_arn)], policy_arn)
            .await?;
        parse_policy_last_used(&xml, policy_arn)
    }

    async fn list_attached_roles_page(
        &self,
        policy_arn: &str,
        marker: Option<String>,
    ) -> Result<Page<RoleRef>, InventoryError> {
        let max_items = self.page_size_param();
        let mut params = vec![
            ("PolicyArn", policy_arn),
            ("EntityFilter", "Role"),
            ("MaxItems", max_items.as_str()),
        ];
        if let Some(m) = marker.as_deref() {
            params.push(("Marker", m));
        }

        let xml = self.call("ListEntitiesForPolicy", &params, policy_arn).await?;
        parse_attached_roles(&xml, policy_arn)
    }

    async fn role_last_used(&self, role_name: &str) -> Result<Option<DateTime<Utc>>, InventoryError> {
        let xml = self.call("GetRole", &[("RoleName", role_name)], role_name).await?;
        parse_role_last_used(&xml, role_name)
    }

    async fn list_roles_page(&self, marker: Option<String>) -> Result<Page<RoleSummary>, InventoryError> {
        let max_items = self.page_size_param();
        let mut params = vec![("MaxItems", max_items.as_str())];
        if let Some(m) = marker.as_deref() {
            params.push(("Marker", m));
        }

        let xml = self.call("ListRoles", &params, "roles").await?;
        parse_list_roles(&xml)
    }

    async fn list_role_policies_page(
        &self,
        role_name: &str,
        marker: Option<String>,
    ) -> Result<Page<AttachedPolicy>, InventoryError> {
        let max_items = self.page_size_param();
        let mut params = vec![("RoleName", role_name), ("MaxItems", max_items.as_str())];
        if let Some(m) = marker.as_deref() {
            params.push(("Marker", m));
        }

        let xml = self.call("ListAttachedRolePolicies", &params, role_name).await?;
        parse_role_policies(&xml, role_name)
    }
}
