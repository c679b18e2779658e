use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const LOCK_FIELD_END_TIME: &str = "end_time";
pub const LOCK_FIELD_TRACE_ID: &str = "trace_id";

/// 命名空间租约记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceLock {
    pub namespace: String,
    /// Unix 时间戳(秒)
    pub end_time: i64,
    pub holder_trace_id: String,
}

impl NamespaceLock {
    pub fn free(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            end_time: 0,
            holder_trace_id: String::new(),
        }
    }

    /// 持有者非空且尚未过期时才算被占用, 过期的持有者隐式失去租约
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        !self.holder_trace_id.is_empty() && now.timestamp() < self.end_time
    }

    pub fn end_time_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.end_time, 0)
            .single()
            .unwrap_or_default()
    }

    pub fn to_fields(&self) -> HashMap<String, String> {
        HashMap::from([
            (LOCK_FIELD_END_TIME.to_string(), self.end_time.to_string()),
            (
                LOCK_FIELD_TRACE_ID.to_string(),
                self.holder_trace_id.clone(),
            ),
        ])
    }

    /// 字段缺失或无法解析时按空闲处理
    pub fn from_fields(namespace: &str, fields: &HashMap<String, String>) -> Self {
        Self {
            namespace: namespace.to_string(),
            end_time: fields
                .get(LOCK_FIELD_END_TIME)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            holder_trace_id: fields.get(LOCK_FIELD_TRACE_ID).cloned().unwrap_or_default(),
        }
    }
}

/// 命名空间锁的只读快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceLockStatus {
    pub namespace: String,
    pub end_time: DateTime<Utc>,
    pub holder_trace_id: String,
    pub held: bool,
}

/// 令牌桶中的一个持有者
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenHold {
    pub holder: String,
    /// Unix 时间戳(秒)
    pub expires_at: i64,
}

impl TokenHold {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() < self.expires_at
    }

    /// 令牌桶记录的字段即 holder -> 过期时间
    pub fn from_fields(fields: &HashMap<String, String>) -> Vec<TokenHold> {
        let mut holds: Vec<TokenHold> = fields
            .iter()
            .filter_map(|(holder, expires_at)| {
                expires_at.parse().ok().map(|expires_at| TokenHold {
                    holder: holder.clone(),
                    expires_at,
                })
            })
            .collect();
        holds.sort_by(|a, b| a.holder.cmp(&b.holder));
        holds
    }
}

/// 令牌持有者标识: 任务 id + trace id
pub fn token_holder_id(task_id: &str, trace_id: &str) -> String {
    format!("{task_id}:{trace_id}")
}
