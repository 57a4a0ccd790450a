use crate::controller::MutationController;
use crate::queue::StoreHandle;
use crate::store::{InsertOutcome, UpsertOutcome};
use domain::TaskChange;
use infrastructure::{ChangeSubscription, FeedEvent};
use shared::{record_error, AppError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// ストアへの反映結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    /// 既に反映済みまたは対象が存在しない
    Ignored,
    /// 他ユーザーのレコードとして拒否
    Rejected,
}

/// 外部から届いた変更をストアへ畳み込む
///
/// - `Created`: 同一IDが無ければ挿入
/// - `Updated`: レコード全体で upsert（後勝ち、重複適用しても同じ結果）
/// - `Deleted`: 削除（存在しなければ何もしない）
///
/// フィードが取りこぼしを通知した場合は全件取得し直す。
#[derive(Clone)]
pub struct Reconciler {
    store: StoreHandle,
    resync: Option<MutationController>,
}

impl Reconciler {
    pub fn new(store: StoreHandle) -> Self {
        Self {
            store,
            resync: None,
        }
    }

    /// 取りこぼし時の全件取得に使うコントローラーを設定
    pub fn with_resync(mut self, controller: MutationController) -> Self {
        self.resync = Some(controller);
        self
    }

    /// 取りこぼした変更を全件取得で埋める（取得失敗はコントローラーが通知する）
    pub async fn resync(&self) {
        match &self.resync {
            Some(controller) => {
                info!("変更の取りこぼしを検知、全件再取得");
                let _ = controller.refresh().await;
            }
            None => warn!("Realtime feed reported a gap but no resync is configured"),
        }
    }

    pub async fn apply(&self, change: TaskChange) -> Result<ReconcileOutcome, AppError> {
        let kind = change.kind();
        let task_id = change.task_id().clone();

        let outcome = match change {
            TaskChange::Created(task) => match self.store.insert(task).await? {
                InsertOutcome::Inserted => ReconcileOutcome::Applied,
                InsertOutcome::Duplicate => ReconcileOutcome::Ignored,
                InsertOutcome::Rejected => ReconcileOutcome::Rejected,
            },
            TaskChange::Updated(task) => match self.store.upsert(task).await? {
                UpsertOutcome::Replaced | UpsertOutcome::Inserted => ReconcileOutcome::Applied,
                UpsertOutcome::Rejected => ReconcileOutcome::Rejected,
            },
            TaskChange::Deleted { id, .. } => match self.store.remove(id).await? {
                Some(_) => ReconcileOutcome::Applied,
                None => ReconcileOutcome::Ignored,
            },
        };

        debug!(kind = kind.as_str(), task_id = %task_id, outcome = ?outcome, "Change reconciled");
        Ok(outcome)
    }

    /// 購読から届く変更を順に適用するタスクを起動する
    pub fn spawn(self, mut subscription: ChangeSubscription) -> ReconcilerHandle {
        let owner = subscription.owner().clone();
        info!("リアルタイム購読開始: user_id={}", owner);

        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let result = match event {
                    FeedEvent::Change(change) => self.apply(change).await.map(|_| ()),
                    FeedEvent::Resync => {
                        self.resync().await;
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    // ストアが停止している場合は続行できない
                    record_error(&e, "apply realtime change");
                    break;
                }
            }
            info!("リアルタイム購読終了: user_id={}", owner);
        });

        ReconcilerHandle { task }
    }
}

/// 起動したリコンサイラーの停止ハンドル
///
/// 停止すると購読も破棄される。ドロップ時も停止する。
#[derive(Debug)]
pub struct ReconcilerHandle {
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub fn stop(self) {
        drop(self);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::spawn_store;
    use chrono::Utc;
    use domain::{Task, TaskId, TaskPriority, TaskStatus, UserId};

    fn task(id: &str, owner: &str, title: &str) -> Task {
        let now = Utc::now();
        Task {
            id: TaskId::from_string(id).unwrap(),
            title: title.to_string(),
            description: None,
            status: TaskStatus::Todo,
            priority: TaskPriority::High,
            due_date: None,
            assignee: None,
            category: None,
            user_id: UserId::from_string(owner).unwrap(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn reconciler() -> Reconciler {
        let (store, _task) = spawn_store();
        store
            .reset(Some(UserId::from_string("u1").unwrap()))
            .await
            .unwrap();
        Reconciler::new(store)
    }

    #[tokio::test]
    async fn test_duplicate_created_is_ignored() {
        let reconciler = reconciler().await;
        let created = TaskChange::Created(task("a", "u1", "Buy milk"));

        assert_eq!(reconciler.apply(created.clone()).await.unwrap(), ReconcileOutcome::Applied);
        assert_eq!(reconciler.apply(created).await.unwrap(), ReconcileOutcome::Ignored);
        assert_eq!(reconciler.store.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_updated_twice_is_idempotent() {
        let reconciler = reconciler().await;
        reconciler
            .apply(TaskChange::Created(task("a", "u1", "Buy milk")))
            .await
            .unwrap();

        let mut changed = task("a", "u1", "Buy oat milk");
        changed.status = TaskStatus::Completed;
        let updated = TaskChange::Updated(changed);

        reconciler.apply(updated.clone()).await.unwrap();
        let once = reconciler.store.tasks();
        reconciler.apply(updated).await.unwrap();
        assert_eq!(reconciler.store.tasks(), once);
        assert_eq!(once[0].title, "Buy oat milk");
    }

    #[tokio::test]
    async fn test_update_before_create_leaves_one_record() {
        let reconciler = reconciler().await;
        let original = task("a", "u1", "Buy milk");
        let mut changed = original.clone();
        changed.title = "Buy bread".to_string();

        reconciler
            .apply(TaskChange::Updated(changed.clone()))
            .await
            .unwrap();
        assert_eq!(
            reconciler.apply(TaskChange::Created(original)).await.unwrap(),
            ReconcileOutcome::Ignored
        );
        assert_eq!(reconciler.store.tasks(), vec![changed]);
    }

    #[tokio::test]
    async fn test_delete_absent_is_noop() {
        let reconciler = reconciler().await;
        let outcome = reconciler
            .apply(TaskChange::deleted(TaskId::from_string("zzz").unwrap()))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_foreign_owner_rejected() {
        let reconciler = reconciler().await;
        let outcome = reconciler
            .apply(TaskChange::Created(task("x", "u2", "Not mine")))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Rejected);
        assert!(reconciler.store.tasks().is_empty());
    }
}
