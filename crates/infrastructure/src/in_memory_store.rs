use async_trait::async_trait;
use chaos_core::traits::{CoordinationStore, StoreOp, VersionedRecord};
use chaos_core::{SchedulerError, SchedulerResult};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    /// 按 (score, member) 升序保存, 与 Redis 的有序集合排序一致
    sorted_sets: HashMap<String, Vec<(String, f64)>>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
    records: HashMap<String, VersionedRecord>,
    streams: HashMap<String, VecDeque<(String, Vec<(String, String)>)>>,
    stream_seq: u64,
}

impl State {
    /// 返回与对应 Redis 命令一致的整数回复
    fn apply(&mut self, op: &StoreOp) -> i64 {
        match op {
            StoreOp::ListPush { key, value } => {
                let list = self.lists.entry(key.clone()).or_default();
                list.push_back(value.clone());
                list.len() as i64
            }
            StoreOp::ListRemove { key, value } => {
                let Some(list) = self.lists.get_mut(key) else {
                    return 0;
                };
                match list.iter().position(|v| v == value) {
                    Some(pos) => {
                        list.remove(pos);
                        1
                    }
                    None => 0,
                }
            }
            StoreOp::SortedSetAdd { key, member, score } => {
                let set = self.sorted_sets.entry(key.clone()).or_default();
                let existed = match set.iter().position(|(m, _)| m == member) {
                    Some(pos) => {
                        set.remove(pos);
                        true
                    }
                    None => false,
                };
                let pos = set
                    .iter()
                    .position(|(m, s)| (*s, m.as_str()) > (*score, member.as_str()))
                    .unwrap_or(set.len());
                set.insert(pos, (member.clone(), *score));
                if existed {
                    0
                } else {
                    1
                }
            }
            StoreOp::SortedSetRemove { key, member } => {
                let Some(set) = self.sorted_sets.get_mut(key) else {
                    return 0;
                };
                match set.iter().position(|(m, _)| m == member) {
                    Some(pos) => {
                        set.remove(pos);
                        1
                    }
                    None => 0,
                }
            }
            StoreOp::HashSet { key, field, value } => {
                let previous = self
                    .hashes
                    .entry(key.clone())
                    .or_default()
                    .insert(field.clone(), value.clone());
                if previous.is_some() {
                    0
                } else {
                    1
                }
            }
            StoreOp::HashDelete { key, field } => self
                .hashes
                .get_mut(key)
                .and_then(|hash| hash.remove(field))
                .map(|_| 1)
                .unwrap_or(0),
            StoreOp::HashCompareAndSwap {
                key,
                field,
                expected,
                value,
            } => {
                let hash = self.hashes.entry(key.clone()).or_default();
                if hash.get(field) != expected.as_ref() {
                    return 0;
                }
                match value {
                    Some(value) => hash.insert(field.clone(), value.clone()),
                    None => hash.remove(field),
                };
                1
            }
        }
    }
}

/// 单进程内存协调存储
///
/// 语义与 Redis 实现保持一致, 用于测试以及不需要跨进程协调的本地运行。
#[derive(Default)]
pub struct InMemoryCoordinationStore {
    state: Mutex<State>,
    pushed: Notify,
    unavailable: AtomicBool,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟存储不可用, 之后的每个操作都返回 `Store` 错误
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> SchedulerResult<MutexGuard<'_, State>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SchedulerError::store("in-memory store marked unavailable"));
        }
        self.state
            .lock()
            .map_err(|_| SchedulerError::Internal("in-memory store mutex poisoned".to_string()))
    }

    fn try_pop(&self, key: &str) -> SchedulerResult<Option<String>> {
        Ok(self
            .lock()?
            .lists
            .get_mut(key)
            .and_then(|list| list.pop_front()))
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn list_push(&self, key: &str, value: &str) -> SchedulerResult<u64> {
        let len = self.lock()?.apply(&StoreOp::list_push(key, value));
        self.pushed.notify_waiters();
        Ok(len as u64)
    }

    async fn list_pop_blocking(
        &self,
        key: &str,
        timeout: Duration,
    ) -> SchedulerResult<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            // 先注册再检查, 避免错过检查与等待之间的推送
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(key)? {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop(key);
            }
        }
    }

    async fn list_range(&self, key: &str) -> SchedulerResult<Vec<String>> {
        Ok(self
            .lock()?
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_len(&self, key: &str) -> SchedulerResult<u64> {
        Ok(self.lock()?.lists.get(key).map_or(0, |list| list.len() as u64))
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> SchedulerResult<()> {
        self.lock()?
            .apply(&StoreOp::sorted_set_add(key, member, score));
        Ok(())
    }

    async fn sorted_set_range_by_score(&self, key: &str, max: f64) -> SchedulerResult<Vec<String>> {
        Ok(self
            .lock()?
            .sorted_sets
            .get(key)
            .map(|set| {
                set.iter()
                    .take_while(|(_, score)| *score <= max)
                    .map(|(member, _)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn sorted_set_range_with_scores(&self, key: &str) -> SchedulerResult<Vec<(String, f64)>> {
        Ok(self
            .lock()?
            .sorted_sets
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn sorted_set_len(&self, key: &str) -> SchedulerResult<u64> {
        Ok(self
            .lock()?
            .sorted_sets
            .get(key)
            .map_or(0, |set| set.len() as u64))
    }

    async fn hash_get(&self, key: &str, field: &str) -> SchedulerResult<Option<String>> {
        Ok(self
            .lock()?
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> SchedulerResult<()> {
        self.lock()?.apply(&StoreOp::hash_set(key, field, value));
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> SchedulerResult<bool> {
        Ok(self.lock()?.apply(&StoreOp::hash_delete(key, field)) > 0)
    }

    async fn hash_get_all(&self, key: &str) -> SchedulerResult<HashMap<String, String>> {
        Ok(self.lock()?.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_len(&self, key: &str) -> SchedulerResult<u64> {
        Ok(self.lock()?.hashes.get(key).map_or(0, |hash| hash.len() as u64))
    }

    async fn set_add(&self, key: &str, member: &str) -> SchedulerResult<bool> {
        Ok(self
            .lock()?
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_members(&self, key: &str) -> SchedulerResult<Vec<String>> {
        Ok(self
            .lock()?
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn record_get(&self, key: &str) -> SchedulerResult<Option<VersionedRecord>> {
        Ok(self.lock()?.records.get(key).cloned())
    }

    async fn record_compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        fields: &HashMap<String, String>,
    ) -> SchedulerResult<bool> {
        let mut state = self.lock()?;
        let current = state.records.get(key).map(|record| record.version);
        if current != expected_version {
            debug!(key, ?current, ?expected_version, "compare-and-set lost");
            return Ok(false);
        }
        state.records.insert(
            key.to_string(),
            VersionedRecord {
                version: current.unwrap_or(0) + 1,
                fields: fields.clone(),
            },
        );
        Ok(true)
    }

    async fn execute_atomic(&self, ops: &[StoreOp]) -> SchedulerResult<()> {
        let pushed = {
            let mut state = self.lock()?;
            ops.iter().fold(false, |pushed, op| {
                state.apply(op);
                pushed || matches!(op, StoreOp::ListPush { .. })
            })
        };
        if pushed {
            self.pushed.notify_waiters();
        }
        Ok(())
    }

    async fn execute_if(&self, guard: &StoreOp, ops: &[StoreOp]) -> SchedulerResult<bool> {
        let pushed = {
            let mut state = self.lock()?;
            if state.apply(guard) <= 0 {
                return Ok(false);
            }
            ops.iter().fold(false, |pushed, op| {
                state.apply(op);
                pushed || matches!(op, StoreOp::ListPush { .. })
            })
        };
        if pushed {
            self.pushed.notify_waiters();
        }
        Ok(true)
    }

    async fn stream_append(
        &self,
        key: &str,
        fields: &[(String, String)],
        max_len: u64,
    ) -> SchedulerResult<String> {
        let mut state = self.lock()?;
        state.stream_seq += 1;
        let id = format!("{}-0", state.stream_seq);
        let stream = state.streams.entry(key.to_string()).or_default();
        stream.push_back((id.clone(), fields.to_vec()));
        while stream.len() as u64 > max_len.max(1) {
            stream.pop_front();
        }
        Ok(id)
    }

    async fn stream_len(&self, key: &str) -> SchedulerResult<u64> {
        Ok(self.lock()?.streams.get(key).map_or(0, |s| s.len() as u64))
    }

    async fn ping(&self) -> SchedulerResult<()> {
        self.lock().map(|_| ())
    }
}
