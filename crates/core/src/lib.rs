//! 混沌实验调度器的核心类型: 错误分类、配置、数据模型以及各层之间的接口。

pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use errors::{SchedulerError, SchedulerResult};
