use crate::gateway::{AuthEvent, AuthGateway, ChangeFeed, Session, TaskGateway};
use crate::realtime::{ChangeSubscription, CHANNEL_CAPACITY};
use async_trait::async_trait;
use chrono::Utc;
use domain::{
    AuthUser, NewTask, ProfileDetailsRow, ProfileEdit, ProfileRow, Task, TaskChange, TaskId,
    TaskPatch, UserId, UserProfile,
};
use shared::AppError;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

/// 障害注入の対象操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOperation {
    Select,
    Insert,
    Update,
    Delete,
    SignIn,
    SignOut,
    UpdateProfile,
    UpdatePassword,
}

impl fmt::Display for GatewayOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GatewayOperation::Select => "select",
            GatewayOperation::Insert => "insert",
            GatewayOperation::Update => "update",
            GatewayOperation::Delete => "delete",
            GatewayOperation::SignIn => "sign_in",
            GatewayOperation::SignOut => "sign_out",
            GatewayOperation::UpdateProfile => "update_profile",
            GatewayOperation::UpdatePassword => "update_password",
        };
        write!(f, "{name}")
    }
}

struct Account {
    password: String,
    user: AuthUser,
}

#[derive(Default)]
struct MemoryState {
    rows: Vec<Task>,
    accounts: HashMap<String, Account>,
    profiles: HashMap<String, ProfileRow>,
    details: HashMap<String, ProfileDetailsRow>,
    session: Option<Session>,
    failures: HashMap<GatewayOperation, usize>,
    latency: Option<Duration>,
    response_delays: HashMap<GatewayOperation, Duration>,
    echo_disabled: bool,
}

impl MemoryState {
    /// 予約済みの障害があれば1件消費してエラーを返す
    fn take_failure(&mut self, operation: GatewayOperation) -> Result<(), AppError> {
        match self.failures.get_mut(&operation) {
            Some(count) if *count > 0 => {
                *count -= 1;
                Err(AppError::remote(format!("injected {operation} failure")))
            }
            _ => Ok(()),
        }
    }
}

/// プロセス内で完結するゲートウェイ実装
///
/// 行の CRUD、認証、変更フィードを1つの状態で提供し、書き込みごとに
/// 変更イベントをエコーする。障害注入と遅延設定でテストから挙動を制御できる。
pub struct InMemoryGateway {
    state: Mutex<MemoryState>,
    changes: broadcast::Sender<TaskChange>,
    auth_tx: broadcast::Sender<AuthEvent>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (auth_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MemoryState::default()),
            changes,
            auth_tx,
        }
    }

    /// 次回の指定操作を `count` 回失敗させる
    pub async fn fail_next(&self, operation: GatewayOperation, count: usize) {
        let mut state = self.state.lock().await;
        *state.failures.entry(operation).or_insert(0) += count;
    }

    /// 各操作の前に待機する時間を設定
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.latency = latency;
    }

    /// 操作の反映後、応答を返すまでの待機時間を設定
    ///
    /// サーバーは処理済みだが応答が遅い状況を再現する。
    pub async fn delay_response(&self, operation: GatewayOperation, delay: Option<Duration>) {
        let mut state = self.state.lock().await;
        match delay {
            Some(delay) => {
                state.response_delays.insert(operation, delay);
            }
            None => {
                state.response_delays.remove(&operation);
            }
        }
    }

    /// 書き込みのエコー配信を止める
    pub async fn set_echo(&self, enabled: bool) {
        self.state.lock().await.echo_disabled = !enabled;
    }

    /// アカウントを登録（サインインはしない）
    pub async fn register_user(
        &self,
        email: &str,
        password: &str,
        full_name: Option<&str>,
    ) -> AuthUser {
        let user = AuthUser {
            id: uuid::Uuid::new_v4().to_string(),
            email: Some(email.to_string()),
            user_metadata: full_name.map(|name| serde_json::json!({ "full_name": name })),
        };

        self.state.lock().await.accounts.insert(
            email.to_lowercase(),
            Account {
                password: password.to_string(),
                user: user.clone(),
            },
        );
        user
    }

    /// 変更を配信せずに行を直接投入する
    pub async fn seed(&self, task: Task) {
        self.state.lock().await.rows.push(task);
    }

    pub async fn rows(&self) -> Vec<Task> {
        self.state.lock().await.rows.clone()
    }

    pub async fn profile_row(&self, user_id: &UserId) -> Option<ProfileRow> {
        self.state.lock().await.profiles.get(user_id.as_str()).cloned()
    }

    pub async fn profile_details(&self, user_id: &UserId) -> Option<ProfileDetailsRow> {
        self.state.lock().await.details.get(user_id.as_str()).cloned()
    }

    /// 他セッション由来の変更として配信する
    pub fn publish(&self, change: TaskChange) {
        let _ = self.changes.send(change);
    }

    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    async fn begin(&self, operation: GatewayOperation) -> Result<(), AppError> {
        let latency = self.state.lock().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.state.lock().await.take_failure(operation)
    }

    async fn respond(&self, operation: GatewayOperation) {
        let delay = self.state.lock().await.response_delays.get(&operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn echo(&self, echo_disabled: bool, change: TaskChange) {
        if !echo_disabled {
            let _ = self.changes.send(change);
        }
    }

    fn start_session(&self, state: &mut MemoryState, user: AuthUser) -> Session {
        let session = Session {
            access_token: format!("memory-token-{}", uuid::Uuid::new_v4()),
            refresh_token: None,
            user,
        };
        state.session = Some(session.clone());
        let _ = self.auth_tx.send(AuthEvent::SignedIn(session.clone()));
        session
    }
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskGateway for InMemoryGateway {
    async fn select_by_owner(&self, owner: &UserId) -> Result<Vec<Task>, AppError> {
        self.begin(GatewayOperation::Select).await?;

        // 作成日時の降順、同時刻は後から挿入したものを先に
        let mut tasks: Vec<Task> = self
            .state
            .lock()
            .await
            .rows
            .iter()
            .rev()
            .filter(|task| task.is_owned_by(owner))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        self.respond(GatewayOperation::Select).await;
        Ok(tasks)
    }

    async fn insert(&self, task: &NewTask) -> Result<Task, AppError> {
        self.begin(GatewayOperation::Insert).await?;
        let mut state = self.state.lock().await;

        let now = Utc::now();
        let id = TaskId::from_string(uuid::Uuid::new_v4().to_string())
            .map_err(AppError::from_domain)?;
        let created = Task {
            id,
            title: task.title.clone(),
            description: task.description.clone(),
            status: task.status,
            priority: task.priority,
            due_date: task.due_date,
            assignee: task.assignee.clone(),
            category: task.category.clone(),
            user_id: task.user_id.clone(),
            created_at: now,
            updated_at: now,
        };

        state.rows.push(created.clone());
        debug!(task_id = %created.id, "In-memory row inserted");
        self.echo(state.echo_disabled, TaskChange::Created(created.clone()));
        Ok(created)
    }

    async fn update(&self, id: &TaskId, patch: &TaskPatch) -> Result<(), AppError> {
        self.begin(GatewayOperation::Update).await?;
        {
            let mut state = self.state.lock().await;
            let echo_disabled = state.echo_disabled;

            // 該当行が無い場合は 0 行更新として成功扱い
            if let Some(row) = state.rows.iter_mut().find(|task| &task.id == id) {
                row.apply_patch(patch);
                if patch.updated_at.is_none() {
                    row.updated_at = Utc::now();
                }
                let updated = row.clone();
                self.echo(echo_disabled, TaskChange::Updated(updated));
            }
        }

        self.respond(GatewayOperation::Update).await;
        Ok(())
    }

    async fn delete(&self, id: &TaskId) -> Result<(), AppError> {
        self.begin(GatewayOperation::Delete).await?;
        let mut state = self.state.lock().await;

        if let Some(index) = state.rows.iter().position(|task| &task.id == id) {
            let removed = state.rows.remove(index);
            self.echo(
                state.echo_disabled,
                TaskChange::Deleted {
                    id: removed.id,
                    owner: Some(removed.user_id),
                },
            );
        }
        Ok(())
    }
}

#[async_trait]
impl AuthGateway for InMemoryGateway {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AppError> {
        self.begin(GatewayOperation::SignIn).await?;
        let mut state = self.state.lock().await;

        let user = match state.accounts.get(&email.to_lowercase()) {
            Some(account) if account.password == password => account.user.clone(),
            _ => return Err(AppError::remote("Invalid login credentials")),
        };

        info!(user_id = %user.id, "In-memory sign in");
        Ok(self.start_session(&mut state, user))
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: Option<&str>,
    ) -> Result<Option<Session>, AppError> {
        if self
            .state
            .lock()
            .await
            .accounts
            .contains_key(&email.to_lowercase())
        {
            return Err(AppError::remote("User already registered"));
        }

        let user = self.register_user(email, password, full_name).await;
        let mut state = self.state.lock().await;
        Ok(Some(self.start_session(&mut state, user)))
    }

    async fn sign_out(&self) -> Result<(), AppError> {
        self.begin(GatewayOperation::SignOut).await?;
        self.state.lock().await.session = None;
        let _ = self.auth_tx.send(AuthEvent::SignedOut);
        Ok(())
    }

    async fn current_session(&self) -> Option<Session> {
        self.state.lock().await.session.clone()
    }

    async fn load_profile(&self, user: &AuthUser) -> Result<UserProfile, AppError> {
        let mut state = self.state.lock().await;
        let row = state
            .profiles
            .entry(user.id.clone())
            .or_insert_with(|| ProfileRow::for_auth_user(user))
            .clone();
        UserProfile::from_auth_user(user, Some(&row)).map_err(AppError::from_domain)
    }

    async fn update_profile(&self, user_id: &UserId, edit: &ProfileEdit) -> Result<(), AppError> {
        self.begin(GatewayOperation::UpdateProfile).await?;
        let mut state = self.state.lock().await;
        let now = Utc::now();

        state.profiles.insert(
            user_id.to_string(),
            ProfileRow {
                id: user_id.to_string(),
                full_name: Some(edit.name.clone()),
                email: Some(edit.email.clone()),
            },
        );
        state
            .details
            .insert(user_id.to_string(), edit.details_row(user_id, now));
        debug!(user_id = %user_id, "In-memory profile updated");
        Ok(())
    }

    async fn update_password(&self, new_password: &str) -> Result<(), AppError> {
        self.begin(GatewayOperation::UpdatePassword).await?;
        let mut state = self.state.lock().await;

        let user_id = match &state.session {
            Some(session) => session.user.id.clone(),
            None => return Err(AppError::NotAuthenticated),
        };
        match state
            .accounts
            .values_mut()
            .find(|account| account.user.id == user_id)
        {
            Some(account) => {
                account.password = new_password.to_string();
                Ok(())
            }
            None => Err(AppError::remote("User not found")),
        }
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_tx.subscribe()
    }
}

#[async_trait]
impl ChangeFeed for InMemoryGateway {
    async fn subscribe(&self, owner: &UserId) -> Result<ChangeSubscription, AppError> {
        Ok(ChangeSubscription::from_changes(
            owner.clone(),
            self.changes.subscribe(),
        ))
    }
}
