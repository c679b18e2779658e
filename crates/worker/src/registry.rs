use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use chaos_core::models::TaskType;
use chaos_core::traits::TaskHandler;

/// 按任务类型注册的处理器
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<TaskType, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器, 同一类型重复注册时替换旧的处理器
    pub async fn register(&self, handler: Arc<dyn TaskHandler>) {
        let task_type = handler.task_type();
        let mut handlers = self.handlers.write().await;
        if handlers.insert(task_type, handler).is_some() {
            warn!(task_type = %task_type, "处理器已被替换");
        } else {
            info!(task_type = %task_type, "处理器已注册");
        }
    }

    pub async fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(&task_type).cloned()
    }

    pub async fn contains(&self, task_type: TaskType) -> bool {
        self.handlers.read().await.contains_key(&task_type)
    }

    pub async fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.read().await.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chaos_core::traits::{HandlerOutcome, TaskContext};
    use chaos_core::SchedulerResult;

    struct Noop(TaskType);

    #[async_trait]
    impl TaskHandler for Noop {
        fn task_type(&self) -> TaskType {
            self.0
        }

        async fn handle(&self, _ctx: TaskContext) -> SchedulerResult<HandlerOutcome> {
            Ok(HandlerOutcome::Completed)
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(Noop(TaskType::RunAlgorithm))).await;
        registry.register(Arc::new(Noop(TaskType::BuildImage))).await;
        registry.register(Arc::new(Noop(TaskType::BuildImage))).await;

        assert!(registry.contains(TaskType::BuildImage).await);
        assert!(registry.get(TaskType::CollectResult).await.is_none());
        assert_eq!(
            registry.task_types().await,
            vec![TaskType::BuildImage, TaskType::RunAlgorithm]
        );
    }
}
