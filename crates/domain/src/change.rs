use crate::errors::DomainError;
use crate::task::{Task, TaskId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// リアルタイムフィードの生ペイロード（デシリアライゼーション用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawChangePayload {
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

/// 変更イベントの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// 正規化済みの行レベル変更イベント
#[derive(Debug, Clone, PartialEq)]
pub enum TaskChange {
    Created(Task),
    Updated(Task),
    Deleted {
        id: TaskId,
        /// 削除前の所有者（ペイロードに含まれる場合のみ）
        owner: Option<UserId>,
    },
}

impl TaskChange {
    pub fn deleted(id: TaskId) -> Self {
        TaskChange::Deleted { id, owner: None }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            TaskChange::Created(_) => ChangeKind::Created,
            TaskChange::Updated(_) => ChangeKind::Updated,
            TaskChange::Deleted { .. } => ChangeKind::Deleted,
        }
    }

    /// 変更対象のタスクIDを取得
    pub fn task_id(&self) -> &TaskId {
        match self {
            TaskChange::Created(task) | TaskChange::Updated(task) => &task.id,
            TaskChange::Deleted { id, .. } => id,
        }
    }

    /// 変更対象の所有者を取得（不明な場合は None）
    pub fn owner(&self) -> Option<&UserId> {
        match self {
            TaskChange::Created(task) | TaskChange::Updated(task) => Some(&task.user_id),
            TaskChange::Deleted { owner, .. } => owner.as_ref(),
        }
    }

    /// 指定ユーザー宛ての変更かどうか
    /// 所有者不明の削除は通す（存在しないIDの削除は無害なため）
    pub fn concerns(&self, user: &UserId) -> bool {
        self.owner().map_or(true, |owner| owner == user)
    }

    /// 生ペイロードを正規化する
    pub fn from_payload(raw: RawChangePayload) -> Result<Self, DomainError> {
        match raw.event_type.to_uppercase().as_str() {
            "INSERT" => Ok(TaskChange::Created(record_from(raw.new, "INSERT")?)),
            "UPDATE" => Ok(TaskChange::Updated(record_from(raw.new, "UPDATE")?)),
            "DELETE" => {
                let old = raw.old.ok_or_else(|| {
                    DomainError::InvalidChange("DELETE payload has no old record".to_string())
                })?;
                let id = old
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        DomainError::InvalidChange("DELETE payload has no id".to_string())
                    })
                    .and_then(TaskId::from_string)?;
                let owner = old
                    .get("user_id")
                    .and_then(Value::as_str)
                    .and_then(|owner| UserId::from_string(owner).ok());

                Ok(TaskChange::Deleted { id, owner })
            }
            _ => Err(DomainError::UnknownChangeType(raw.event_type)),
        }
    }

    /// JSON 文字列から正規化する
    pub fn from_json(json: &str) -> Result<Self, DomainError> {
        let raw: RawChangePayload = serde_json::from_str(json)
            .map_err(|e| DomainError::ChangeDeserialization(e.to_string()))?;
        Self::from_payload(raw)
    }

    /// 生ペイロードへ戻す（ゲートウェイ実装が配信に使う）
    pub fn to_payload(&self) -> Result<RawChangePayload, DomainError> {
        let to_value = |task: &Task| {
            serde_json::to_value(task).map_err(|e| DomainError::InvalidChange(e.to_string()))
        };

        let payload = match self {
            TaskChange::Created(task) => RawChangePayload {
                event_type: "INSERT".to_string(),
                new: Some(to_value(task)?),
                old: None,
            },
            TaskChange::Updated(task) => RawChangePayload {
                event_type: "UPDATE".to_string(),
                new: Some(to_value(task)?),
                old: None,
            },
            TaskChange::Deleted { id, owner } => {
                let mut old = serde_json::Map::new();
                old.insert("id".to_string(), Value::String(id.as_str().to_string()));
                if let Some(owner) = owner {
                    old.insert(
                        "user_id".to_string(),
                        Value::String(owner.as_str().to_string()),
                    );
                }
                RawChangePayload {
                    event_type: "DELETE".to_string(),
                    new: None,
                    old: Some(Value::Object(old)),
                }
            }
        };

        Ok(payload)
    }
}

fn record_from(value: Option<Value>, event_type: &str) -> Result<Task, DomainError> {
    let value = value.ok_or_else(|| {
        DomainError::InvalidChange(format!("{event_type} payload has no new record"))
    })?;
    serde_json::from_value(value).map_err(|e| DomainError::ChangeDeserialization(e.to_string()))
}
