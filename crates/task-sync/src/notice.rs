use serde::Serialize;
use shared::AppError;
use tokio::sync::broadcast;
use tracing::debug;

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Success,
    Error,
}

/// 利用者に表示する一時的な通知
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    /// エラー由来の場合のエラーコード
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl Notice {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            message: message.into(),
            code: None,
        }
    }

    pub fn from_error(error: &AppError) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: error.user_message(),
            code: Some(error.metadata().code),
        }
    }

    /// 操作名を前置したエラー通知
    pub fn failed(action: &str, error: &AppError) -> Self {
        Self {
            message: format!("Failed to {action}: {}", error.user_message()),
            ..Self::from_error(error)
        }
    }

    pub fn is_error(&self) -> bool {
        self.level == NoticeLevel::Error
    }
}

/// 通知の配信バス
///
/// 購読者がいない間の通知は破棄される。
#[derive(Debug, Clone)]
pub struct NoticeBus {
    tx: broadcast::Sender<Notice>,
}

impl NoticeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, notice: Notice) {
        debug!(level = ?notice.level, message = %notice.message, "Notice");
        let _ = self.tx.send(notice);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new()
    }
}
