use crate::store::{FetchOutcome, FetchTicket, InsertOutcome, Removed, TaskStore, UpsertOutcome};
use domain::{Task, TaskId, TaskPatch, UserId};
use shared::AppError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// コマンドキューのバッファサイズ
const QUEUE_CAPACITY: usize = 128;

/// ストアの読み取り用スナップショット
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub owner: Option<UserId>,
    pub tasks: Vec<Task>,
}

/// ストアに対する変更要求
///
/// 全ての生産者（コントローラー、リコンサイラー、セッション）が同じキューに送り、
/// ストアタスクが到着順に1件ずつ適用する。
#[derive(Debug)]
pub enum StoreCommand {
    Reset {
        owner: Option<UserId>,
        reply: oneshot::Sender<()>,
    },
    BeginFetch {
        reply: oneshot::Sender<Option<FetchTicket>>,
    },
    ReplaceAll {
        ticket: FetchTicket,
        tasks: Vec<Task>,
        reply: oneshot::Sender<FetchOutcome>,
    },
    AbandonFetch {
        ticket: FetchTicket,
        reply: oneshot::Sender<()>,
    },
    Insert {
        task: Task,
        reply: oneshot::Sender<InsertOutcome>,
    },
    ApplyUpdate {
        id: TaskId,
        patch: TaskPatch,
        reply: oneshot::Sender<bool>,
    },
    Upsert {
        task: Task,
        reply: oneshot::Sender<UpsertOutcome>,
    },
    Remove {
        id: TaskId,
        reply: oneshot::Sender<Option<Removed>>,
    },
    Restore {
        removed: Removed,
        reply: oneshot::Sender<bool>,
    },
}

impl StoreCommand {
    fn name(&self) -> &'static str {
        match self {
            StoreCommand::Reset { .. } => "reset",
            StoreCommand::BeginFetch { .. } => "begin_fetch",
            StoreCommand::ReplaceAll { .. } => "replace_all",
            StoreCommand::AbandonFetch { .. } => "abandon_fetch",
            StoreCommand::Insert { .. } => "insert",
            StoreCommand::ApplyUpdate { .. } => "apply_update",
            StoreCommand::Upsert { .. } => "upsert",
            StoreCommand::Remove { .. } => "remove",
            StoreCommand::Restore { .. } => "restore",
        }
    }

    /// ストアに適用する
    ///
    /// 内容が変わった場合は返信より先に `publish` を呼ぶため、返信を受け取った
    /// 時点でスナップショットは適用後の状態になっている。
    fn apply(self, store: &mut TaskStore, publish: impl Fn(&TaskStore)) {
        // 返信側が既にドロップされていても適用は取り消さない
        match self {
            StoreCommand::Reset { owner, reply } => {
                store.reset(owner);
                publish(store);
                let _ = reply.send(());
            }
            StoreCommand::BeginFetch { reply } => {
                let _ = reply.send(store.begin_fetch());
            }
            StoreCommand::ReplaceAll {
                ticket,
                tasks,
                reply,
            } => {
                let outcome = store.finish_fetch(&ticket, tasks);
                if outcome != FetchOutcome::Stale {
                    publish(store);
                }
                let _ = reply.send(outcome);
            }
            StoreCommand::AbandonFetch { ticket, reply } => {
                store.abandon_fetch(&ticket);
                let _ = reply.send(());
            }
            StoreCommand::Insert { task, reply } => {
                let outcome = store.insert(task);
                if outcome == InsertOutcome::Inserted {
                    publish(store);
                }
                let _ = reply.send(outcome);
            }
            StoreCommand::ApplyUpdate { id, patch, reply } => {
                let applied = store.apply_update(&id, &patch);
                if applied {
                    publish(store);
                }
                let _ = reply.send(applied);
            }
            StoreCommand::Upsert { task, reply } => {
                let outcome = store.upsert(task);
                if outcome != UpsertOutcome::Rejected {
                    publish(store);
                }
                let _ = reply.send(outcome);
            }
            StoreCommand::Remove { id, reply } => {
                let removed = store.remove(&id);
                if removed.is_some() {
                    publish(store);
                }
                let _ = reply.send(removed);
            }
            StoreCommand::Restore { removed, reply } => {
                let restored = store.restore(removed);
                if restored {
                    publish(store);
                }
                let _ = reply.send(restored);
            }
        }
    }
}

/// ストアタスクへのハンドル
///
/// クローンして複数の生産者で共有できる。全てのハンドルがドロップされると
/// ストアタスクは終了する。
#[derive(Debug, Clone)]
pub struct StoreHandle {
    commands: mpsc::Sender<StoreCommand>,
    snapshot: watch::Receiver<StoreSnapshot>,
}

/// ストアタスクを起動する
pub fn spawn_store() -> (StoreHandle, JoinHandle<()>) {
    let (commands, mut receiver) = mpsc::channel::<StoreCommand>(QUEUE_CAPACITY);
    let (publisher, snapshot) = watch::channel(StoreSnapshot::default());

    let task = tokio::spawn(async move {
        let mut store = TaskStore::default();
        while let Some(command) = receiver.recv().await {
            let name = command.name();
            command.apply(&mut store, |store| {
                debug!(command = name, task_count = store.len(), "Store updated");
                publisher.send_replace(StoreSnapshot {
                    owner: store.owner().cloned(),
                    tasks: store.tasks().to_vec(),
                });
            });
        }
        info!("Store queue closed");
    });

    (StoreHandle { commands, snapshot }, task)
}

impl StoreHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> StoreCommand,
    ) -> Result<T, AppError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| AppError::Internal("Task store has stopped".to_string()))?;
        response
            .await
            .map_err(|_| AppError::Internal("Task store dropped the request".to_string()))
    }

    /// 所有者を切り替えて空にする（`None` はサインアウト）
    pub async fn reset(&self, owner: Option<UserId>) -> Result<(), AppError> {
        self.request(|reply| StoreCommand::Reset { owner, reply })
            .await
    }

    pub async fn clear(&self) -> Result<(), AppError> {
        self.reset(None).await
    }

    /// 全件取得の開始を登録する（サインアウト中は `None`）
    pub async fn begin_fetch(&self) -> Result<Option<FetchTicket>, AppError> {
        self.request(|reply| StoreCommand::BeginFetch { reply }).await
    }

    /// 取得結果で置き換える（開始後の変更は再適用される）
    pub async fn replace_all(
        &self,
        ticket: FetchTicket,
        tasks: Vec<Task>,
    ) -> Result<FetchOutcome, AppError> {
        self.request(|reply| StoreCommand::ReplaceAll {
            ticket,
            tasks,
            reply,
        })
        .await
    }

    pub async fn abandon_fetch(&self, ticket: FetchTicket) -> Result<(), AppError> {
        self.request(|reply| StoreCommand::AbandonFetch { ticket, reply })
            .await
    }

    pub async fn insert(&self, task: Task) -> Result<InsertOutcome, AppError> {
        self.request(|reply| StoreCommand::Insert { task, reply })
            .await
    }

    pub async fn apply_update(&self, id: TaskId, patch: TaskPatch) -> Result<bool, AppError> {
        self.request(|reply| StoreCommand::ApplyUpdate { id, patch, reply })
            .await
    }

    pub async fn upsert(&self, task: Task) -> Result<UpsertOutcome, AppError> {
        self.request(|reply| StoreCommand::Upsert { task, reply })
            .await
    }

    pub async fn remove(&self, id: TaskId) -> Result<Option<Removed>, AppError> {
        self.request(|reply| StoreCommand::Remove { id, reply })
            .await
    }

    pub async fn restore(&self, removed: Removed) -> Result<bool, AppError> {
        self.request(|reply| StoreCommand::Restore { removed, reply })
            .await
    }

    /// 最新のスナップショット
    pub fn snapshot(&self) -> StoreSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.snapshot.borrow().tasks.clone()
    }

    pub fn owner(&self) -> Option<UserId> {
        self.snapshot.borrow().owner.clone()
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.snapshot
            .borrow()
            .tasks
            .iter()
            .find(|task| &task.id == id)
            .cloned()
    }

    /// 変更通知を受け取るレシーバー
    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot> {
        self.snapshot.clone()
    }
}
