use serde::{Deserialize, Serialize};

/// 令牌桶限流配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_concurrent_restarts: u32,
    pub max_concurrent_builds: u32,
    pub max_concurrent_algo_executions: u32,
    pub token_wait_timeout_seconds: u64,
    /// 持有者未释放时令牌自动过期的时间
    pub token_ttl_seconds: u64,
    pub poll_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent_restarts: 2,
            max_concurrent_builds: 3,
            max_concurrent_algo_executions: 5,
            token_wait_timeout_seconds: 10,
            token_ttl_seconds: 600,
            poll_interval_ms: 500,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_restarts == 0 {
            return Err(anyhow::anyhow!("最大并发重启数必须大于0"));
        }

        if self.max_concurrent_builds == 0 {
            return Err(anyhow::anyhow!("最大并发构建数必须大于0"));
        }

        if self.max_concurrent_algo_executions == 0 {
            return Err(anyhow::anyhow!("最大并发算法执行数必须大于0"));
        }

        if self.token_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("令牌过期时间必须大于0"));
        }

        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("令牌轮询间隔必须大于0"));
        }

        Ok(())
    }
}

/// 命名空间池配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NamespaceConfig {
    pub prefix: String,
    pub count: usize,
    /// 任务占用命名空间的租约时长
    pub lease_seconds: u64,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            prefix: "ns".to_string(),
            count: 4,
            lease_seconds: 1800,
        }
    }
}

impl NamespaceConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.prefix.is_empty() {
            return Err(anyhow::anyhow!("命名空间前缀不能为空"));
        }

        if self.lease_seconds == 0 {
            return Err(anyhow::anyhow!("命名空间租约时长必须大于0"));
        }

        Ok(())
    }

    /// `<prefix>-0 .. <prefix>-(count-1)`
    pub fn names(&self) -> Vec<String> {
        (0..self.count)
            .map(|idx| format!("{}-{}", self.prefix, idx))
            .collect()
    }
}
