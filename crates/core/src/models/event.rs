use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::task::{Task, TaskType};

/// 集群回调中用于关联任务的标签名
pub mod labels {
    pub const TASK_ID: &str = "task_id";
    pub const TRACE_ID: &str = "trace_id";
    pub const TASK_TYPE: &str = "task_type";
    pub const GROUP_ID: &str = "group_id";
    pub const PROJECT_ID: &str = "project_id";
}

/// 事件名称
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    TaskSubmitted,
    TaskScheduled,
    TaskPromoted,
    TaskStarted,
    TaskCompleted,
    TaskRescheduled,
    TaskRetrying,
    TaskDeferred,
    TaskFailed,
    TaskCancelled,
    TaskDeadLettered,
    NamespaceLocked,
    NamespaceReleased,
    TokenAcquired,
    TokenReleased,
    JobAdded,
    JobSucceeded,
    JobFailed,
    CrdConditionChanged,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::TaskSubmitted => "task_submitted",
            EventName::TaskScheduled => "task_scheduled",
            EventName::TaskPromoted => "task_promoted",
            EventName::TaskStarted => "task_started",
            EventName::TaskCompleted => "task_completed",
            EventName::TaskRescheduled => "task_rescheduled",
            EventName::TaskRetrying => "task_retrying",
            EventName::TaskDeferred => "task_deferred",
            EventName::TaskFailed => "task_failed",
            EventName::TaskCancelled => "task_cancelled",
            EventName::TaskDeadLettered => "task_dead_lettered",
            EventName::NamespaceLocked => "namespace_locked",
            EventName::NamespaceReleased => "namespace_released",
            EventName::TokenAcquired => "token_acquired",
            EventName::TokenReleased => "token_released",
            EventName::JobAdded => "job_added",
            EventName::JobSucceeded => "job_succeeded",
            EventName::JobFailed => "job_failed",
            EventName::CrdConditionChanged => "crd_condition_changed",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 写入可观测性事件流的结构化事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEvent {
    pub task_id: Option<String>,
    pub trace_id: String,
    pub task_type: Option<TaskType>,
    pub event_name: EventName,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TraceEvent {
    pub fn new(event_name: EventName, trace_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_id: None,
            trace_id: trace_id.into(),
            task_type: None,
            event_name,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn for_task(task: &Task, event_name: EventName, payload: serde_json::Value) -> Self {
        Self {
            task_id: Some(task.id.clone()),
            trace_id: task.trace_id.clone(),
            task_type: Some(task.task_type),
            event_name,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// 展开为事件流条目的字段
    pub fn to_stream_fields(&self) -> Vec<(String, String)> {
        vec![
            (
                "task_id".to_string(),
                self.task_id.clone().unwrap_or_default(),
            ),
            ("trace_id".to_string(), self.trace_id.clone()),
            (
                "task_type".to_string(),
                self.task_type
                    .map(|t| t.as_str().to_string())
                    .unwrap_or_default(),
            ),
            ("event_name".to_string(), self.event_name.as_str().to_string()),
            ("payload".to_string(), self.payload.to_string()),
            (
                "timestamp".to_string(),
                self.timestamp.timestamp_millis().to_string(),
            ),
        ]
    }
}

/// 集群回调类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallbackKind {
    JobAdded,
    JobSucceeded,
    JobFailed,
    CrdConditionChanged,
}

impl CallbackKind {
    pub fn event_name(&self) -> EventName {
        match self {
            CallbackKind::JobAdded => EventName::JobAdded,
            CallbackKind::JobSucceeded => EventName::JobSucceeded,
            CallbackKind::JobFailed => EventName::JobFailed,
            CallbackKind::CrdConditionChanged => EventName::CrdConditionChanged,
        }
    }
}

/// 由集群协调器回调转换而来的类型化事件, 投递给正在运行的任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallbackEvent {
    pub kind: CallbackKind,
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl CallbackEvent {
    pub fn new(kind: CallbackKind, labels: HashMap<String, String>) -> Self {
        Self {
            kind,
            labels,
            reason: None,
            namespace: None,
            name: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_resource(mut self, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self.name = Some(name.into());
        self
    }

    pub fn task_id(&self) -> Option<&str> {
        self.label(labels::TASK_ID)
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.label(labels::TRACE_ID)
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn to_trace_event(&self) -> TraceEvent {
        TraceEvent {
            task_id: self.task_id().map(str::to_string),
            trace_id: self.trace_id().unwrap_or_default().to_string(),
            task_type: self
                .label(labels::TASK_TYPE)
                .and_then(|t| t.parse().ok()),
            event_name: self.kind.event_name(),
            payload: serde_json::json!({
                "labels": self.labels,
                "reason": self.reason,
                "namespace": self.namespace,
                "name": self.name,
            }),
            timestamp: self.received_at,
        }
    }
}
