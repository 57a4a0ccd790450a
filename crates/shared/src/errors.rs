use thiserror::Error;

/// アプリケーション全体で使用される包括的なエラー型
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AppError {
    // ドメインエラー
    #[error("Domain error: {0}")]
    Domain(#[from] domain::DomainError),

    // 入力エラー（ネットワーク呼び出し前に検出）
    #[error("Validation failed: {0}")]
    Validation(String),

    // ゲートウェイ呼び出しの失敗（ネットワーク・認証・サーバー側の拒否・タイムアウト）
    #[error("Remote error: {0}")]
    Remote(String),

    // セッションが無い状態での操作
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// エラーの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 利用者の入力や状態に起因するエラー
    Client,
    /// 実装やデータ不整合に起因するエラー
    Server,
    /// 通信経路の一時的なエラー
    Transient,
}

/// エラーの重要度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// エラーメタデータ
#[derive(Debug, Clone)]
pub struct ErrorMetadata {
    pub code: &'static str,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
}

impl AppError {
    /// ドメインのバリデーションエラーは入力エラーとして扱う
    pub fn from_domain(error: domain::DomainError) -> Self {
        match error {
            domain::DomainError::Validation(msg) => AppError::Validation(msg),
            other => AppError::Domain(other),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        AppError::Remote(message.into())
    }

    /// エラーメタデータを取得
    pub fn metadata(&self) -> ErrorMetadata {
        let (code, category, severity) = match self {
            AppError::Domain(_) => ("DOMAIN_ERROR", ErrorCategory::Client, ErrorSeverity::Warning),
            AppError::Validation(_) => {
                ("VALIDATION_ERROR", ErrorCategory::Client, ErrorSeverity::Info)
            }
            AppError::Remote(_) => ("REMOTE_ERROR", ErrorCategory::Transient, ErrorSeverity::Error),
            AppError::NotAuthenticated => {
                ("NOT_AUTHENTICATED", ErrorCategory::Client, ErrorSeverity::Warning)
            }
            AppError::Serialization(_) => {
                ("SERIALIZATION_ERROR", ErrorCategory::Server, ErrorSeverity::Error)
            }
            AppError::Deserialization(_) => {
                ("DESERIALIZATION_ERROR", ErrorCategory::Server, ErrorSeverity::Error)
            }
            AppError::Configuration(_) => {
                ("CONFIGURATION_ERROR", ErrorCategory::Server, ErrorSeverity::Critical)
            }
            AppError::Internal(_) => ("INTERNAL_ERROR", ErrorCategory::Server, ErrorSeverity::Critical),
        };

        ErrorMetadata {
            code,
            category,
            severity,
        }
    }

    /// ユーザー向けメッセージを取得
    pub fn user_message(&self) -> String {
        match self {
            AppError::Validation(msg) => msg.clone(),
            AppError::Remote(msg) => format!("Something went wrong talking to the server: {msg}"),
            AppError::NotAuthenticated => "User not authenticated. Please log in.".to_string(),
            AppError::Domain(e) => e.to_string(),
            _ => "An unexpected error occurred. Please try again.".to_string(),
        }
    }
}
