use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Projects,
    Logs,
    User,
    Graph,
    Chat,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Projects,
        ResourceKind::Logs,
        ResourceKind::User,
        ResourceKind::Graph,
        ResourceKind::Chat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Projects => "projects",
            ResourceKind::Logs => "logs",
            ResourceKind::User => "user",
            ResourceKind::Graph => "graph",
            ResourceKind::Chat => "chat",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    #[default]
    Idle,
    Loading,
    Succeeded,
    Failed,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Idle => "idle",
            ResourceStatus::Loading => "loading",
            ResourceStatus::Succeeded => "succeeded",
            ResourceStatus::Failed => "failed",
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, ResourceStatus::Succeeded | ResourceStatus::Failed)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotConnected,
    Transport,
    Timeout,
    RequestFailed,
    Validation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ResourceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Lifecycle envelope for one resource kind.
///
/// `error` is present exactly when `status` is `Failed`. `data` is the last
/// successful value and survives a failed re-fetch, so consumers can keep
/// showing it beside the error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceState<T> {
    pub status: ResourceStatus,
    pub data: Option<T>,
    pub error: Option<ResourceError>,
}

impl<T> Default for ResourceState<T> {
    fn default() -> Self {
        Self {
            status: ResourceStatus::Idle,
            data: None,
            error: None,
        }
    }
}

impl<T> ResourceState<T> {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_loading(&self) -> bool {
        self.status == ResourceStatus::Loading
    }

    pub fn mark_loading(&mut self) {
        self.status = ResourceStatus::Loading;
        self.error = None;
    }

    pub fn mark_succeeded(&mut self, data: T) {
        self.status = ResourceStatus::Succeeded;
        self.data = Some(data);
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: ResourceError) {
        self.status = ResourceStatus::Failed;
        self.error = Some(error);
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|err| err.message.as_str())
    }
}
