use crate::notice::{Notice, NoticeBus};
use crate::queue::StoreHandle;
use crate::store::FetchOutcome;
use chrono::Utc;
use domain::{NewTask, Task, TaskDraft, TaskId, TaskPatch, TaskStatus, UserId};
use infrastructure::TaskGateway;
use shared::{record_error, AppError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// 利用者の操作をローカルストアへ即時反映し、ゲートウェイへ永続化する
///
/// 各操作はゲートウェイへ1回だけ書き込む（再試行なし）。失敗時は
/// 更新なら全件再取得、削除なら取り除いたレコードの復元で元に戻し、
/// エラー通知を発行する。
#[derive(Clone)]
pub struct MutationController {
    gateway: Arc<dyn TaskGateway>,
    store: StoreHandle,
    notices: NoticeBus,
    request_timeout: Duration,
}

impl MutationController {
    pub fn new(
        gateway: Arc<dyn TaskGateway>,
        store: StoreHandle,
        notices: NoticeBus,
        request_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            store,
            notices,
            request_timeout,
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// タスクを作成する
    ///
    /// ゲートウェイの採番済みレコードを受け取ってからストアへ挿入する。
    /// 自分の書き込みのエコーが先に届いていた場合は重複挿入しない。
    pub async fn create(&self, draft: TaskDraft) -> Result<Task, AppError> {
        let result = self.try_create(draft).await;
        match &result {
            Ok(task) => {
                info!("タスク作成完了: task_id={}", task.id);
                self.notices.publish(Notice::success("Task created"));
            }
            Err(e) => self.report("create task", e),
        }
        result
    }

    async fn try_create(&self, draft: TaskDraft) -> Result<Task, AppError> {
        let owner = self.current_owner()?;
        let new_task = NewTask::from_draft(draft, owner).map_err(AppError::from_domain)?;
        info!("タスク作成コマンド実行: title={}", new_task.title);

        let task = self
            .call("insert", self.gateway.insert(&new_task))
            .await?;
        self.store.insert(task.clone()).await?;
        Ok(task)
    }

    /// 部分更新を即時反映し、ゲートウェイへ送る
    ///
    /// 失敗時はサーバーの状態を全件再取得してストアを置き換える。
    pub async fn update(&self, id: &TaskId, patch: TaskPatch) -> Result<(), AppError> {
        if let Err(e) = self.current_owner() {
            self.report("update task", &e);
            return Err(e);
        }
        let patch = match patch.normalized() {
            Ok(patch) if patch.is_empty() => return Ok(()),
            Ok(patch) => patch.stamped(Utc::now()),
            Err(e) => {
                let e = AppError::from_domain(e);
                self.report("update task", &e);
                return Err(e);
            }
        };
        info!("タスク更新コマンド実行: task_id={}", id);

        self.store.apply_update(id.clone(), patch.clone()).await?;

        match self.call("update", self.gateway.update(id, &patch)).await {
            Ok(()) => {
                info!("タスク更新完了: task_id={}", id);
                Ok(())
            }
            Err(e) => {
                self.report("update task", &e);
                self.resync().await;
                Err(e)
            }
        }
    }

    /// 取り除いた直後にゲートウェイへ削除を送る
    ///
    /// 失敗時は取り除いたレコードをそのまま元の位置に戻す。
    pub async fn delete(&self, id: &TaskId) -> Result<(), AppError> {
        if let Err(e) = self.current_owner() {
            self.report("delete task", &e);
            return Err(e);
        }
        info!("タスク削除コマンド実行: task_id={}", id);

        let removed = self.store.remove(id.clone()).await?;

        match self.call("delete", self.gateway.delete(id)).await {
            Ok(()) => {
                info!("タスク削除完了: task_id={}", id);
                Ok(())
            }
            Err(e) => {
                self.report("delete task", &e);
                if let Some(removed) = removed {
                    match self.store.restore(removed).await {
                        Ok(true) => info!("削除したタスクを復元: task_id={}", id),
                        Ok(false) => warn!("タスクは既に存在するため復元しない: task_id={}", id),
                        Err(restore_error) => {
                            record_error(&restore_error, "restore after failed delete")
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// ステータスを todo → in-progress → completed → todo の順に進める
    pub async fn toggle_status(&self, id: &TaskId) -> Result<TaskStatus, AppError> {
        let current = match self.store.get(id) {
            Some(task) => task.status,
            None => {
                let e = AppError::Validation(format!("Task not found: {id}"));
                self.report("update task", &e);
                return Err(e);
            }
        };
        let next = current.next();
        self.update(id, TaskPatch::status(next)).await?;
        Ok(next)
    }

    /// カンバン列の移動などによるステータス変更
    pub async fn move_to(&self, id: &TaskId, status: TaskStatus) -> Result<(), AppError> {
        self.update(id, TaskPatch::status(status)).await
    }

    /// 現在のユーザーのタスクを全件取得してストアを置き換える
    pub async fn refresh(&self) -> Result<usize, AppError> {
        let result = self.try_refresh().await;
        if let Err(e) = &result {
            self.report("load tasks", e);
        }
        result
    }

    async fn try_refresh(&self) -> Result<usize, AppError> {
        let ticket = self
            .store
            .begin_fetch()
            .await?
            .ok_or(AppError::NotAuthenticated)?;
        let owner = ticket.owner().clone();

        let tasks = match self.call("select", self.gateway.select_by_owner(&owner)).await {
            Ok(tasks) => tasks,
            Err(e) => {
                self.store.abandon_fetch(ticket).await?;
                return Err(e);
            }
        };

        match self.store.replace_all(ticket, tasks).await? {
            FetchOutcome::Replaced(count) => {
                info!("タスク一覧取得完了: user_id={}, count={}", owner, count);
                Ok(count)
            }
            FetchOutcome::Stale => {
                info!("取得結果を破棄（所有者変更または新しい取得あり）: user_id={}", owner);
                Ok(self.store.tasks().len())
            }
        }
    }

    /// 更新失敗後の再取得（失敗しても現在の状態を維持する）
    async fn resync(&self) {
        if let Err(e) = self.try_refresh().await {
            error!("再取得に失敗: error={}", e);
            self.notices.publish(Notice::failed("reload tasks", &e));
        }
    }

    fn current_owner(&self) -> Result<UserId, AppError> {
        self.store.owner().ok_or(AppError::NotAuthenticated)
    }

    /// ゲートウェイ呼び出しにタイムアウトを掛ける
    pub(crate) async fn call<T>(
        &self,
        operation: &str,
        future: impl Future<Output = Result<T, AppError>>,
    ) -> Result<T, AppError> {
        match tokio::time::timeout(self.request_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Remote(format!(
                "{operation} timed out after {}ms",
                self.request_timeout.as_millis()
            ))),
        }
    }

    fn report(&self, action: &str, error: &AppError) {
        record_error(error, action);
        self.notices.publish(Notice::failed(action, error));
    }
}
