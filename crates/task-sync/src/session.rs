use crate::controller::MutationController;
use crate::notice::{Notice, NoticeBus};
use crate::queue::{spawn_store, StoreHandle};
use crate::reconciler::{Reconciler, ReconcilerHandle};
use domain::{PasswordChange, ProfileEdit, UserProfile};
use infrastructure::{AuthEvent, AuthGateway, ChangeFeed, Session, TaskGateway};
use shared::{record_error, AppError, Config};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// セッションシェルが必要とするゲートウェイの機能一式
pub trait SyncGateway: TaskGateway + AuthGateway + ChangeFeed + 'static {}

impl<T> SyncGateway for T where T: TaskGateway + AuthGateway + ChangeFeed + 'static {}

/// 認証状態に合わせてストア・購読・リコンサイラーの寿命を管理する
///
/// サインインでストアを利用者に束縛して全件取得し、変更フィードを購読する。
/// サインアウトで購読を止め、ストアと利用者を空にする。
pub struct TaskSyncSession<G: SyncGateway> {
    gateway: Arc<G>,
    store: StoreHandle,
    controller: MutationController,
    notices: NoticeBus,
    profile: watch::Sender<Option<UserProfile>>,
    reconciler: Mutex<Option<ReconcilerHandle>>,
    store_task: JoinHandle<()>,
}

impl<G: SyncGateway> TaskSyncSession<G> {
    pub fn new(gateway: Arc<G>, request_timeout: Duration) -> Self {
        let (store, store_task) = spawn_store();
        let notices = NoticeBus::new();
        let controller = MutationController::new(
            gateway.clone(),
            store.clone(),
            notices.clone(),
            request_timeout,
        );
        let (profile, _) = watch::channel(None);

        Self {
            gateway,
            store,
            controller,
            notices,
            profile,
            reconciler: Mutex::new(None),
            store_task,
        }
    }

    pub fn from_config(gateway: Arc<G>, config: &Config) -> Self {
        Self::new(gateway, config.request_timeout)
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    pub fn controller(&self) -> &MutationController {
        &self.controller
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn notices(&self) -> &NoticeBus {
        &self.notices
    }

    /// 現在の利用者（サインアウト中は `None`）
    pub fn current_user(&self) -> Option<UserProfile> {
        self.profile.borrow().clone()
    }

    pub fn watch_user(&self) -> watch::Receiver<Option<UserProfile>> {
        self.profile.subscribe()
    }

    /// 認証イベントを1件処理する
    pub async fn handle_auth_event(&self, event: AuthEvent) -> Result<(), AppError> {
        match event {
            AuthEvent::SignedIn(session) => self.activate(session).await.map(|_| ()),
            AuthEvent::SignedOut => self.deactivate().await,
        }
    }

    /// 既存セッションがあれば復帰する
    pub async fn restore(&self) -> Result<Option<UserProfile>, AppError> {
        match self.gateway.current_session().await {
            Some(session) => self.activate(session).await.map(Some),
            None => {
                info!("既存セッションなし");
                Ok(None)
            }
        }
    }

    async fn activate(&self, session: Session) -> Result<UserProfile, AppError> {
        let profile = self.gateway.load_profile(&session.user).await?;
        let owner = profile.id.clone();
        info!("セッション開始: user_id={}", owner);

        // 前の利用者の購読を先に止める
        self.stop_reconciler().await;
        self.store.reset(Some(owner.clone())).await?;
        self.profile.send_replace(Some(profile.clone()));

        let subscription = self.gateway.subscribe(&owner).await?;
        let handle = Reconciler::new(self.store.clone())
            .with_resync(self.controller.clone())
            .spawn(subscription);
        *self.reconciler.lock().await = Some(handle);

        // 取得失敗は通知済み。購読は維持して次の変更を待つ
        if let Err(e) = self.controller.refresh().await {
            warn!("初回取得に失敗: user_id={}, error={}", owner, e);
        }
        Ok(profile)
    }

    async fn deactivate(&self) -> Result<(), AppError> {
        self.stop_reconciler().await;
        self.store.clear().await?;
        if let Some(previous) = self.profile.send_replace(None) {
            info!("セッション終了: user_id={}", previous.id);
        }
        Ok(())
    }

    async fn stop_reconciler(&self) {
        if let Some(handle) = self.reconciler.lock().await.take() {
            handle.stop();
        }
    }

    /// ゲートウェイでサインアウトし、ローカルの状態を破棄する
    pub async fn sign_out(&self) -> Result<(), AppError> {
        if let Err(e) = self.gateway.sign_out().await {
            record_error(&e, "sign out");
            self.notices.publish(Notice::failed("sign out", &e));
            return Err(e);
        }
        self.deactivate().await
    }

    /// プロフィール（氏名・メール・連絡先）を更新する
    ///
    /// 保存中に利用者が切り替わった場合は表示中のプロフィールを書き換えない。
    pub async fn update_profile(&self, edit: ProfileEdit) -> Result<UserProfile, AppError> {
        let mut profile = self.current_user().ok_or(AppError::NotAuthenticated)?;
        let result = match edit.normalized().map_err(AppError::from_domain) {
            Ok(edit) => self
                .controller
                .call(
                    "update profile",
                    self.gateway.update_profile(&profile.id, &edit),
                )
                .await
                .map(|_| edit),
            Err(e) => Err(e),
        };

        let edit = match result {
            Ok(edit) => edit,
            Err(e) => {
                record_error(&e, "update profile");
                self.notices.publish(Notice::failed("update profile", &e));
                return Err(e);
            }
        };

        profile.apply_edit(&edit);
        self.profile.send_if_modified(|current| match current {
            Some(active) if active.id == profile.id => {
                *active = profile.clone();
                true
            }
            _ => false,
        });
        info!("プロフィール更新完了: user_id={}", profile.id);
        self.notices
            .publish(Notice::success("Profile updated successfully!"));
        Ok(profile)
    }

    /// パスワードを変更する（確認入力との一致と最小文字数を検証）
    pub async fn change_password(&self, change: PasswordChange) -> Result<(), AppError> {
        let result = match change.validate().map_err(AppError::from_domain) {
            Ok(()) if self.current_user().is_none() => Err(AppError::NotAuthenticated),
            Ok(()) => {
                self.controller
                    .call(
                        "update password",
                        self.gateway.update_password(&change.new_password),
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            record_error(&e, "update password");
            self.notices.publish(Notice::failed("update password", &e));
            return Err(e);
        }
        info!("パスワード変更完了");
        self.notices
            .publish(Notice::success("Password updated successfully!"));
        Ok(())
    }

    /// 購読中のリコンサイラーがあるか
    pub async fn is_subscribed(&self) -> bool {
        self.reconciler
            .lock()
            .await
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }
}

impl<G: SyncGateway> Drop for TaskSyncSession<G> {
    fn drop(&mut self) {
        self.store_task.abort();
    }
}

/// 認証イベントストリームを購読してセッションシェルに流すタスクを起動する
pub fn spawn_auth_listener<G: SyncGateway>(session: Arc<TaskSyncSession<G>>) -> JoinHandle<()> {
    let mut events = session.gateway.auth_events();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = session.handle_auth_event(event).await {
                        record_error(&e, "handle auth event");
                        session.notices.publish(Notice::from_error(&e));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Auth event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("Auth event listener stopped");
    })
}
