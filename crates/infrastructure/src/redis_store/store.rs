use async_trait::async_trait;
use chaos_core::config::RedisConfig;
use chaos_core::traits::{CoordinationStore, StoreOp, VersionedRecord};
use chaos_core::SchedulerResult;
use redis::{Pipeline, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use super::connection_manager::{store_error, RedisConnectionManager};
use super::scripts::{self, VERSION_FIELD};

/// 基于 Redis 的协调存储
///
/// 乐观事务通过带 `__version` 字段的哈希和 Lua 脚本实现, 条件批量写入通过
/// cjson 编码的操作列表在服务端一次执行。
pub struct RedisCoordinationStore {
    connection: RedisConnectionManager,
    compare_and_set: Script,
    execute_if: Script,
}

impl RedisCoordinationStore {
    pub async fn connect(config: RedisConfig) -> SchedulerResult<Self> {
        let endpoint = format!("{}:{}/{}", config.host, config.port, config.database);
        let connection = RedisConnectionManager::connect(config).await?;
        info!("Coordination store connected to Redis at {}", endpoint);
        Ok(Self {
            connection,
            compare_and_set: scripts::compare_and_set(),
            execute_if: scripts::execute_if(),
        })
    }
}

fn queue_op(pipe: &mut Pipeline, op: &StoreOp) {
    match op {
        StoreOp::ListPush { key, value } => pipe.cmd("RPUSH").arg(key).arg(value),
        StoreOp::ListRemove { key, value } => pipe.cmd("LREM").arg(key).arg(1).arg(value),
        StoreOp::SortedSetAdd { key, member, score } => {
            pipe.cmd("ZADD").arg(key).arg(*score).arg(member)
        }
        StoreOp::SortedSetRemove { key, member } => pipe.cmd("ZREM").arg(key).arg(member),
        StoreOp::HashSet { key, field, value } => {
            pipe.cmd("HSET").arg(key).arg(field).arg(value)
        }
        StoreOp::HashDelete { key, field } => pipe.cmd("HDEL").arg(key).arg(field),
        StoreOp::HashCompareAndSwap {
            key,
            field,
            expected,
            value,
        } => pipe
            .cmd("EVAL")
            .arg(scripts::HASH_COMPARE_AND_SWAP)
            .arg(1)
            .arg(key)
            .arg(field)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.as_deref().unwrap_or(""))
            .arg(if value.is_some() { "1" } else { "0" })
            .arg(value.as_deref().unwrap_or("")),
    }
    .ignore();
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn list_push(&self, key: &str, value: &str) -> SchedulerResult<u64> {
        let mut conn = self.connection.connection();
        redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("RPUSH", e))
    }

    async fn list_pop_blocking(
        &self,
        key: &str,
        timeout: Duration,
    ) -> SchedulerResult<Option<String>> {
        self.connection.blocking_pop(key, timeout).await
    }

    async fn list_range(&self, key: &str) -> SchedulerResult<Vec<String>> {
        let mut conn = self.connection.connection();
        redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("LRANGE", e))
    }

    async fn list_len(&self, key: &str) -> SchedulerResult<u64> {
        let mut conn = self.connection.connection();
        redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("LLEN", e))
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> SchedulerResult<()> {
        let mut conn = self.connection.connection();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| store_error("ZADD", e))
    }

    async fn sorted_set_range_by_score(&self, key: &str, max: f64) -> SchedulerResult<Vec<String>> {
        let mut conn = self.connection.connection();
        redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("ZRANGEBYSCORE", e))
    }

    async fn sorted_set_range_with_scores(&self, key: &str) -> SchedulerResult<Vec<(String, f64)>> {
        let mut conn = self.connection.connection();
        redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("ZRANGE", e))
    }

    async fn sorted_set_len(&self, key: &str) -> SchedulerResult<u64> {
        let mut conn = self.connection.connection();
        redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("ZCARD", e))
    }

    async fn hash_get(&self, key: &str, field: &str) -> SchedulerResult<Option<String>> {
        let mut conn = self.connection.connection();
        redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("HGET", e))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> SchedulerResult<()> {
        let mut conn = self.connection.connection();
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| store_error("HSET", e))
    }

    async fn hash_delete(&self, key: &str, field: &str) -> SchedulerResult<bool> {
        let mut conn = self.connection.connection();
        let removed: i64 = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("HDEL", e))?;
        Ok(removed > 0)
    }

    async fn hash_get_all(&self, key: &str) -> SchedulerResult<HashMap<String, String>> {
        let mut conn = self.connection.connection();
        redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("HGETALL", e))
    }

    async fn hash_len(&self, key: &str) -> SchedulerResult<u64> {
        let mut conn = self.connection.connection();
        redis::cmd("HLEN")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("HLEN", e))
    }

    async fn set_add(&self, key: &str, member: &str) -> SchedulerResult<bool> {
        let mut conn = self.connection.connection();
        let added: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("SADD", e))?;
        Ok(added > 0)
    }

    async fn set_members(&self, key: &str) -> SchedulerResult<Vec<String>> {
        let mut conn = self.connection.connection();
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("SMEMBERS", e))
    }

    async fn record_get(&self, key: &str) -> SchedulerResult<Option<VersionedRecord>> {
        let mut fields = self.hash_get_all(key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let version = fields
            .remove(VERSION_FIELD)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(Some(VersionedRecord { version, fields }))
    }

    async fn record_compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        fields: &HashMap<String, String>,
    ) -> SchedulerResult<bool> {
        let mut conn = self.connection.connection();
        let mut invocation = self.compare_and_set.key(key);
        invocation.arg(expected_version.map(|v| v.to_string()).unwrap_or_default());
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }
        let applied: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("CAS", e))?;
        Ok(applied == 1)
    }

    async fn execute_atomic(&self, ops: &[StoreOp]) -> SchedulerResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.connection();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            queue_op(&mut pipe, op);
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| store_error("MULTI", e))
    }

    async fn execute_if(&self, guard: &StoreOp, ops: &[StoreOp]) -> SchedulerResult<bool> {
        let guard = serde_json::to_string(guard)?;
        let ops = serde_json::to_string(ops)?;
        let mut conn = self.connection.connection();
        let applied: i64 = self
            .execute_if
            .arg(guard)
            .arg(ops)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("EVAL", e))?;
        Ok(applied == 1)
    }

    async fn stream_append(
        &self,
        key: &str,
        fields: &[(String, String)],
        max_len: u64,
    ) -> SchedulerResult<String> {
        let mut conn = self.connection.connection();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key).arg("MAXLEN").arg("~").arg(max_len).arg("*");
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| store_error("XADD", e))
    }

    async fn stream_len(&self, key: &str) -> SchedulerResult<u64> {
        let mut conn = self.connection.connection();
        redis::cmd("XLEN")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("XLEN", e))
    }

    async fn ping(&self) -> SchedulerResult<()> {
        self.connection.ping().await
    }
}
