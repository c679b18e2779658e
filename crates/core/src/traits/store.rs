use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::SchedulerResult;

/// 带版本号的记录, 用于乐观事务(watch-then-commit)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionedRecord {
    pub version: u64,
    pub fields: HashMap<String, String>,
}

/// 可以在一个原子步骤中批量执行的写操作
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreOp {
    /// 追加到列表尾部
    ListPush { key: String, value: String },
    /// 从列表中移除一个等值元素
    ListRemove { key: String, value: String },
    SortedSetAdd {
        key: String,
        member: String,
        score: f64,
    },
    SortedSetRemove { key: String, member: String },
    HashSet {
        key: String,
        field: String,
        value: String,
    },
    HashDelete { key: String, field: String },
    /// 字段当前值等于 `expected` 时改为 `value`, `None` 表示字段不存在或删除字段
    ///
    /// 只有实际发生替换时才算影响了一个元素。
    HashCompareAndSwap {
        key: String,
        field: String,
        expected: Option<String>,
        value: Option<String>,
    },
}

impl StoreOp {
    pub fn list_push(key: impl Into<String>, value: impl Into<String>) -> Self {
        StoreOp::ListPush {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn list_remove(key: impl Into<String>, value: impl Into<String>) -> Self {
        StoreOp::ListRemove {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn sorted_set_add(key: impl Into<String>, member: impl Into<String>, score: f64) -> Self {
        StoreOp::SortedSetAdd {
            key: key.into(),
            member: member.into(),
            score,
        }
    }

    pub fn sorted_set_remove(key: impl Into<String>, member: impl Into<String>) -> Self {
        StoreOp::SortedSetRemove {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn hash_set(
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        StoreOp::HashSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn hash_delete(key: impl Into<String>, field: impl Into<String>) -> Self {
        StoreOp::HashDelete {
            key: key.into(),
            field: field.into(),
        }
    }

    pub fn hash_compare_and_swap(
        key: impl Into<String>,
        field: impl Into<String>,
        expected: Option<&str>,
        value: Option<&str>,
    ) -> Self {
        StoreOp::HashCompareAndSwap {
            key: key.into(),
            field: field.into(),
            expected: expected.map(str::to_string),
            value: value.map(str::to_string),
        }
    }
}

/// 协调存储抽象接口
///
/// 多个调度进程之间唯一共享的可变状态。所有跨进程的正确性都依赖这里提供的原子原语,
/// 实现方不得用进程内互斥锁模拟。
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// 追加到列表尾部, 返回列表新长度
    async fn list_push(&self, key: &str, value: &str) -> SchedulerResult<u64>;

    /// 阻塞弹出列表头部, 超时返回 None
    async fn list_pop_blocking(&self, key: &str, timeout: Duration)
        -> SchedulerResult<Option<String>>;

    async fn list_range(&self, key: &str) -> SchedulerResult<Vec<String>>;

    async fn list_len(&self, key: &str) -> SchedulerResult<u64>;

    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> SchedulerResult<()>;

    /// 按分数升序返回所有 score <= max 的成员
    async fn sorted_set_range_by_score(&self, key: &str, max: f64) -> SchedulerResult<Vec<String>>;

    /// 按分数升序返回全部成员及分数
    async fn sorted_set_range_with_scores(&self, key: &str) -> SchedulerResult<Vec<(String, f64)>>;

    async fn sorted_set_len(&self, key: &str) -> SchedulerResult<u64>;

    async fn hash_get(&self, key: &str, field: &str) -> SchedulerResult<Option<String>>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> SchedulerResult<()>;

    /// 返回字段是否存在
    async fn hash_delete(&self, key: &str, field: &str) -> SchedulerResult<bool>;

    async fn hash_get_all(&self, key: &str) -> SchedulerResult<HashMap<String, String>>;

    async fn hash_len(&self, key: &str) -> SchedulerResult<u64>;

    /// 返回成员是否为新增
    async fn set_add(&self, key: &str, member: &str) -> SchedulerResult<bool>;

    async fn set_members(&self, key: &str) -> SchedulerResult<Vec<String>>;

    async fn record_get(&self, key: &str) -> SchedulerResult<Option<VersionedRecord>>;

    /// 版本号未变化时整体替换记录并递增版本号
    ///
    /// `expected_version` 为 `None` 表示记录必须不存在。返回 false 表示在竞争中落败。
    async fn record_compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        fields: &HashMap<String, String>,
    ) -> SchedulerResult<bool>;

    /// 原子地执行一批写操作
    async fn execute_atomic(&self, ops: &[StoreOp]) -> SchedulerResult<()>;

    /// 先执行 guard, 只有 guard 实际影响了至少一个元素时才继续执行 ops, 整体原子
    async fn execute_if(&self, guard: &StoreOp, ops: &[StoreOp]) -> SchedulerResult<bool>;

    /// 追加到事件流, 按近似最大长度裁剪, 返回条目 id
    async fn stream_append(
        &self,
        key: &str,
        fields: &[(String, String)],
        max_len: u64,
    ) -> SchedulerResult<String>;

    async fn stream_len(&self, key: &str) -> SchedulerResult<u64>;

    async fn ping(&self) -> SchedulerResult<()>;
}
