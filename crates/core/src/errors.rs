use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("未注册任务处理器: {name}")]
    HandlerNotFound { name: String },

    #[error("任务执行错误: {0}")]
    HandlerExecution(String),

    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    /// 执行失败是否应当按"处理器失败"折算进重试/重排逻辑。
    /// 未注册处理器与处理器自身失败走同一条收尾路径。
    pub fn is_handler_failure(&self) -> bool {
        matches!(
            self,
            SchedulerError::HandlerNotFound { .. }
                | SchedulerError::HandlerExecution(_)
                | SchedulerError::InvalidTaskParams(_)
        )
    }
}
