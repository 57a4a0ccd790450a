use crate::realtime::ChangeSubscription;
use async_trait::async_trait;
use domain::{AuthUser, NewTask, ProfileEdit, Task, TaskId, TaskPatch, UserId, UserProfile};
use serde::{Deserialize, Serialize};
use shared::AppError;
use tokio::sync::broadcast;

/// 認証セッション（永続的な資格情報）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub user: AuthUser,
}

impl Session {
    pub fn user_id(&self) -> Result<UserId, AppError> {
        UserId::from_string(self.user.id.clone()).map_err(AppError::from_domain)
    }
}

/// 認証状態の変化通知
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    SignedIn(Session),
    SignedOut,
}

/// `task` コレクションに対する行単位の CRUD
#[async_trait]
pub trait TaskGateway: Send + Sync {
    /// 所有者のタスクを作成日時の降順で取得
    async fn select_by_owner(&self, owner: &UserId) -> Result<Vec<Task>, AppError>;

    /// 挿入し、ゲートウェイが採番したレコードを返す
    async fn insert(&self, task: &NewTask) -> Result<Task, AppError>;

    async fn update(&self, id: &TaskId, patch: &TaskPatch) -> Result<(), AppError>;

    async fn delete(&self, id: &TaskId) -> Result<(), AppError>;
}

/// セッションベースの認証
#[async_trait]
pub trait AuthGateway: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AppError>;

    /// メール確認待ちの場合は `None`
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: Option<&str>,
    ) -> Result<Option<Session>, AppError>;

    async fn sign_out(&self) -> Result<(), AppError>;

    async fn current_session(&self) -> Option<Session>;

    /// プロフィール行を読み込み、無ければ作成して表示用プロフィールを返す
    async fn load_profile(&self, user: &AuthUser) -> Result<UserProfile, AppError>;

    /// `users` 行を更新し、連絡先などの `profile` 行を upsert する
    async fn update_profile(&self, user_id: &UserId, edit: &ProfileEdit) -> Result<(), AppError>;

    /// サインイン中のユーザーのパスワードを変更する
    async fn update_password(&self, new_password: &str) -> Result<(), AppError>;

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent>;
}

/// 所有者で絞り込まれた行レベル変更フィード
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, owner: &UserId) -> Result<ChangeSubscription, AppError>;
}
