use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use kgw_protocol::OutputKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

/// A user's binding of a notebook to a running kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub notebook_id: Uuid,
    pub kernel_id: String,
    pub status: SessionStatus,
    pub last_active_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "closed" => Ok(SessionStatus::Closed),
            other => Err(format!("invalid session status '{other}'")),
        }
    }
}

/// One persisted output of a cell execution. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CellOutput {
    pub id: Uuid,
    pub cell_id: Uuid,
    /// Zero-based position among the cell's outputs.
    pub output_index: u32,
    #[serde(rename = "type")]
    pub kind: OutputKind,
    #[schema(value_type = Object)]
    pub data: Value,
    /// Reference to an externally stored blob. Not set by the proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<i64>,
}
