use serde::{Serialize, Deserialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
pub enum Status {
    Success,
    Failure,
    Cancelled,
}

/// Outcome of a worker-side operation (init, function load, invocation).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusResult {
    pub status: Status,
    pub result: String,
    pub exception: Option<RpcException>,
}

impl StatusResult {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            result: String::new(),
            exception: None,
        }
    }

    pub fn failure(exception: RpcException) -> Self {
        Self {
            status: Status::Failure,
            result: exception.message.clone(),
            exception: Some(exception),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: Status::Cancelled,
            result: "cancelled".to_owned(),
            exception: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Human readable reason of a failure, falls back to the raw result text.
    pub fn failure_message(&self) -> String {
        self.exception.as_ref()
            .map(|v| v.message.clone())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| self.result.clone())
    }
}

/// Exception raised on the worker side.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcException {
    pub source: String,
    pub message: String,
    pub stack_trace: String,
    /// Set by workers that can tell user code failures from their own failures.
    pub is_user_exception: bool,
}

impl RpcException {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            source: String::new(),
            message: message.into(),
            stack_trace: String::new(),
            is_user_exception: false,
        }
    }

    pub fn user(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
            stack_trace: String::new(),
            is_user_exception: true,
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = stack_trace.into();
        self
    }
}
