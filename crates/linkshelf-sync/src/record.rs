//! Bookmark rows as the store commits them, plus the caller-side draft.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned row identity. Unique and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authenticated user that owns a set of rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

impl OwnerId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// Committed bookmark row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub title: String,
    pub url: String,
    #[serde(rename = "user_id")]
    pub owner: OwnerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Draft validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DraftError {
    #[error("title must not be empty")]
    EmptyTitle,
    #[error("url must not be empty")]
    EmptyUrl,
    #[error("url must be an absolute http:// or https:// address: {0}")]
    InvalidUrl(String),
}

/// Caller-supplied bookmark before the store assigns identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Draft {
    title: String,
    url: String,
}

impl Draft {
    /// Trims and validates both fields.
    pub fn new(title: &str, url: &str) -> Result<Self, DraftError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(DraftError::EmptyTitle);
        }
        let url = url.trim();
        if url.is_empty() {
            return Err(DraftError::EmptyUrl);
        }
        let parsed = url::Url::parse(url).map_err(|error| DraftError::InvalidUrl(error.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(DraftError::InvalidUrl(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }

        Ok(Self {
            title: title.to_string(),
            url: url.to_string(),
        })
    }

    #[must_use]
    pub fn title(&self) -> &str {
        self.title.as_str()
    }

    #[must_use]
    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}
