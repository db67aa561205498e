//! Error types for inventory collection, classification and export

use thiserror::Error;

/// Errors raised while talking to IAM or writing results
#[derive(Debug, Error)]
pub enum InventoryError {
    /// A single entity lookup failed
    ///
    /// Recoverable: the collector turns this into an empty field.
    #[error("Remote lookup failed for {entity}: {message}")]
    RemoteLookup {
        entity: String,
        message: String,
        /// Throttling, 5xx and transport errors are worth retrying
        transient: bool,
    },

    /// A page fetch failed part way through a listing
    #[error("Pagination of {listing} stopped after {pages_fetched} page(s): {source}")]
    Pagination {
        listing: String,
        pages_fetched: usize,
        #[source]
        source: Box<InventoryError>,
    },

    /// Not a single page of the policy listing could be read
    #[error("Policy inventory unavailable: {source}")]
    InventoryUnavailable {
        #[source]
        source: Box<InventoryError>,
    },

    /// Writing the export failed
    #[error("Export to {destination} failed: {message}")]
    Export { destination: String, message: String },

    /// Missing or invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Role inventory file could not be read
    #[error("Invalid input {path}: {message}")]
    Input { path: String, message: String },
}

impl InventoryError {
    pub fn lookup(entity: impl Into<String>, message: impl Into<String>) -> Self {
        InventoryError::RemoteLookup {
            entity: entity.into(),
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(entity: impl Into<String>, message: impl Into<String>) -> Self {
        InventoryError::RemoteLookup {
            entity: entity.into(),
            message: message.into(),
            transient: true,
        }
    }

    pub fn export(destination: impl ToString, message: impl ToString) -> Self {
        InventoryError::Export {
            destination: destination.to_string(),
            message: message.to_string(),
        }
    }

    /// Whether a retry has a chance of succeeding
    pub fn is_transient(&self) -> bool {
        match self {
            InventoryError::RemoteLookup { transient, .. } => *transient,
            InventoryError::Pagination { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}
