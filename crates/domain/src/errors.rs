use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("Invalid TaskId: {0}")]
    InvalidTaskId(String),

    #[error("Invalid UserId: {0}")]
    InvalidUserId(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid task status: {0}")]
    InvalidStatus(String),

    #[error("Invalid task priority: {0}")]
    InvalidPriority(String),

    // リアルタイム変更イベント関連のエラー
    #[error("Invalid change data: {0}")]
    InvalidChange(String),

    #[error("Change deserialization error: {0}")]
    ChangeDeserialization(String),

    #[error("Unknown change type: {0}")]
    UnknownChangeType(String),
}
