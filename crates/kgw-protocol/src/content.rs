use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Stream,
    DisplayData,
    ExecuteResult,
    Error,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::Stream => "stream",
            OutputKind::DisplayData => "display_data",
            OutputKind::ExecuteResult => "execute_result",
            OutputKind::Error => "error",
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(OutputKind::Stream),
            "display_data" => Ok(OutputKind::DisplayData),
            "execute_result" => Ok(OutputKind::ExecuteResult),
            "error" => Ok(OutputKind::Error),
            other => Err(format!("unknown output kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamContent {
    pub name: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayDataContent {
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transient: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResultContent {
    #[serde(default)]
    pub execution_count: Option<i64>,
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContent {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// Output-producing message content, decoded after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputPayload {
    Stream(StreamContent),
    DisplayData(DisplayDataContent),
    ExecuteResult(ExecuteResultContent),
    Error(ErrorContent),
}

impl OutputPayload {
    pub fn kind(&self) -> OutputKind {
        match self {
            OutputPayload::Stream(_) => OutputKind::Stream,
            OutputPayload::DisplayData(_) => OutputKind::DisplayData,
            OutputPayload::ExecuteResult(_) => OutputKind::ExecuteResult,
            OutputPayload::Error(_) => OutputKind::Error,
        }
    }

    /// The stored representation: whole content for streams and errors, the
    /// mime bundle for display data and execute results.
    pub fn data(&self) -> Value {
        match self {
            OutputPayload::Stream(s) => json!({ "name": s.name, "text": s.text }),
            OutputPayload::DisplayData(d) => Value::Object(d.data.clone()),
            OutputPayload::ExecuteResult(r) => Value::Object(r.data.clone()),
            OutputPayload::Error(e) => json!({
                "ename": e.ename,
                "evalue": e.evalue,
                "traceback": e.traceback,
            }),
        }
    }

    pub fn execution_count(&self) -> Option<i64> {
        match self {
            OutputPayload::ExecuteResult(r) => r.execution_count,
            _ => None,
        }
    }
}
