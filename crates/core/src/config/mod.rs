//! 配置管理
//!
//! 配置加载顺序: 结构体默认值 → TOML 配置文件 → 环境变量 (前缀 `SCHEDULER`, 分隔符 `__`)。
//!
//! ```toml
//! [scheduler]
//! key_prefix = "chaos"
//! delay_retry_minutes = 5
//!
//! [rate_limit]
//! max_concurrent_builds = 3
//!
//! [namespace]
//! prefix = "ns"
//! count = 8
//! ```

pub mod models;

pub use models::*;
