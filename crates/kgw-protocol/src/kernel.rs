use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Kernel as reported by the gateway's `/api/kernels` endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Kernel {
    pub id: String,
    /// Runtime name the kernel was started with.
    pub name: String,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub connections: u32,
    #[serde(default)]
    pub execution_state: ExecutionState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Starting,
    Idle,
    Busy,
    Restarting,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Kernel {
    /// How long the kernel has been idle as of `now`. Clock skew that puts
    /// `last_activity` in the future reads as zero.
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.last_activity).max(chrono::Duration::zero())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ApiInfo {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartKernelRequest {
    pub name: String,
}

/// Structured error body returned by the gateway on non-2xx responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kernel_parses_gateway_shape() {
        let kernel: Kernel = serde_json::from_value(json!({
            "id": "4a5c",
            "name": "python3",
            "last_activity": "2024-03-01T10:00:00.123456Z",
            "connections": 1,
            "execution_state": "idle"
        }))
        .unwrap();
        assert_eq!(kernel.execution_state, ExecutionState::Idle);
        assert_eq!(kernel.connections, 1);

        let kernel: Kernel = serde_json::from_value(json!({
            "id": "4a5c",
            "name": "python3",
            "last_activity": "2024-03-01T10:00:00Z",
            "execution_state": "autorestarting"
        }))
        .unwrap();
        assert_eq!(kernel.execution_state, ExecutionState::Unknown);
        assert_eq!(kernel.connections, 0);
    }

    #[test]
    fn idle_for_clamps_future_activity() {
        let now = Utc::now();
        let kernel = Kernel {
            id: "k".into(),
            name: "python3".into(),
            last_activity: now + chrono::Duration::minutes(5),
            connections: 0,
            execution_state: ExecutionState::Idle,
        };
        assert_eq!(kernel.idle_for(now), chrono::Duration::zero());
    }
}
