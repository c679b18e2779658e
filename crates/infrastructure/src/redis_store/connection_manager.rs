use chaos_core::{config::RedisConfig, SchedulerError, SchedulerResult};
use metrics::{counter, gauge};
use redis::aio::ConnectionManager;
use redis::{Client, Connection, RedisError};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

pub(crate) fn store_error(operation: &str, err: RedisError) -> SchedulerError {
    counter!("coordination_store_errors_total", "operation" => operation.to_string()).increment(1);
    SchedulerError::Store(format!("Redis {operation} failed: {err}"))
}

/// Redis 连接管理
///
/// 普通命令共享一个多路复用的 [`ConnectionManager`]; BLPOP 会长时间占用连接,
/// 因此使用单独的同步连接, 在阻塞线程池中执行, 用完后放回空闲池。
pub struct RedisConnectionManager {
    client: Client,
    config: RedisConfig,
    manager: ConnectionManager,
    blocking_pool: Mutex<Vec<Connection>>,
}

impl RedisConnectionManager {
    pub async fn connect(config: RedisConfig) -> SchedulerResult<Self> {
        let client = Client::open(config.build_url()).map_err(|e| {
            SchedulerError::Store(format!("Failed to create Redis client: {e}"))
        })?;

        let manager = Self::connect_with_retry(&client, &config).await?;
        let connection = Self {
            client,
            config,
            manager,
            blocking_pool: Mutex::new(Vec::new()),
        };
        connection.ping().await?;
        debug!(
            "Successfully connected to Redis at {}:{}",
            connection.config.host, connection.config.port
        );

        Ok(connection)
    }

    async fn connect_with_retry(
        client: &Client,
        config: &RedisConfig,
    ) -> SchedulerResult<ConnectionManager> {
        let timeout = Duration::from_secs(config.connection_timeout_seconds);
        let mut last_error = String::from("Unknown");

        for attempt in 0..config.max_retry_attempts {
            match tokio::time::timeout(timeout, client.get_connection_manager()).await {
                Ok(Ok(manager)) => {
                    if attempt > 0 {
                        debug!(
                            "Successfully reconnected to Redis after {} attempts",
                            attempt + 1
                        );
                    }
                    return Ok(manager);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!(
                        "connection timeout after {} seconds",
                        config.connection_timeout_seconds
                    )
                }
            }

            counter!("coordination_store_connection_errors_total").increment(1);
            if attempt + 1 < config.max_retry_attempts {
                warn!(
                    "Failed to connect to Redis (attempt {}/{}): {}. Retrying in {}s...",
                    attempt + 1,
                    config.max_retry_attempts,
                    last_error,
                    config.retry_delay_seconds
                );
                sleep(Duration::from_secs(config.retry_delay_seconds)).await;
            }
        }

        let error_msg = format!(
            "Failed to connect to Redis after {} attempts. Last error: {}",
            config.max_retry_attempts, last_error
        );
        error!("{}", error_msg);
        Err(SchedulerError::Store(error_msg))
    }

    /// 共享的多路复用连接, 克隆开销很小
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub async fn ping(&self) -> SchedulerResult<()> {
        let mut conn = self.connection();
        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("PING", e))?;
        if response == "PONG" {
            Ok(())
        } else {
            let error_msg = format!("Unexpected PING response: {response}");
            error!("{}", error_msg);
            Err(SchedulerError::Store(error_msg))
        }
    }

    /// 在阻塞线程池中执行 BLPOP
    pub async fn blocking_pop(&self, key: &str, timeout: Duration) -> SchedulerResult<Option<String>> {
        let conn = self.take_blocking_connection().await?;
        let key = key.to_string();
        // BLPOP 的 0 表示永久阻塞
        let wait = timeout.as_secs_f64().max(0.01);

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            if let Err(e) = conn.set_read_timeout(Some(timeout + Duration::from_secs(5))) {
                return (conn, Err(e));
            }
            let result: redis::RedisResult<Option<(String, String)>> =
                redis::cmd("BLPOP").arg(&key).arg(wait).query(&mut conn);
            (conn, result)
        })
        .await
        .map_err(|e| SchedulerError::Internal(format!("BLPOP task panicked: {e}")))?;

        match result {
            Ok(entry) => {
                self.return_blocking_connection(conn);
                Ok(entry.map(|(_, value)| value))
            }
            // 出错的连接直接丢弃
            Err(e) => Err(store_error("BLPOP", e)),
        }
    }

    async fn take_blocking_connection(&self) -> SchedulerResult<Connection> {
        if let Some(conn) = self.lock_pool().pop() {
            return Ok(conn);
        }

        let client = self.client.clone();
        let timeout = Duration::from_secs(self.config.connection_timeout_seconds);
        let conn = tokio::task::spawn_blocking(move || client.get_connection_with_timeout(timeout))
            .await
            .map_err(|e| SchedulerError::Internal(format!("Failed to spawn connection task: {e}")))?
            .map_err(|e| store_error("CONNECT", e))?;
        Ok(conn)
    }

    fn return_blocking_connection(&self, conn: Connection) {
        let mut pool = self.lock_pool();
        if pool.len() < self.config.blocking_pool_size {
            pool.push(conn);
        }
        gauge!("coordination_store_idle_blocking_connections").set(pool.len() as f64);
    }

    fn lock_pool(&self) -> std::sync::MutexGuard<'_, Vec<Connection>> {
        // 连接池中只有连接对象, 中毒后仍可安全使用
        self.blocking_pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
