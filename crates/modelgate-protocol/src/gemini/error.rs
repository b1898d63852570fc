use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorStatus {
    pub code: u16,
    pub message: String,
    /// Canonical gRPC status string, e.g. `INVALID_ARGUMENT`.
    pub status: String,
}

impl ErrorEnvelope {
    pub fn new(code: u16, status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorStatus {
                code,
                message: message.into(),
                status: status.into(),
            },
        }
    }
}
