use crate::gateway::ChangeFeed;
use async_trait::async_trait;
use domain::{TaskChange, UserId};
use shared::AppError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// チャネルのバッファサイズ
pub const CHANNEL_CAPACITY: usize = 256;

/// 購読者に届くイベント
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Change(TaskChange),
    /// 取りこぼしが発生した（受信の遅れや再接続）ため全件取得し直す必要がある
    Resync,
}

/// トランスポートから届く生イベント
#[derive(Debug, Clone)]
enum RawEvent {
    Payload(String),
    Reconnected,
}

/// 購読中の変更フィード
///
/// ドロップまたは `unsubscribe` で転送タスクを停止する。
pub struct ChangeSubscription {
    owner: UserId,
    receiver: mpsc::Receiver<FeedEvent>,
    forwarder: JoinHandle<()>,
}

impl ChangeSubscription {
    /// 正規化済み変更のブロードキャストから所有者分だけを転送する
    pub fn from_changes(owner: UserId, mut source: broadcast::Receiver<TaskChange>) -> Self {
        let (tx, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let filter_owner = owner.clone();

        let forwarder = tokio::spawn(async move {
            loop {
                let event = match source.recv().await {
                    Ok(change) if change.concerns(&filter_owner) => FeedEvent::Change(change),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Realtime subscriber lagged, requesting resync");
                        FeedEvent::Resync
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            debug!(owner = %filter_owner, "Realtime forwarder stopped");
        });

        Self {
            owner,
            receiver,
            forwarder,
        }
    }

    /// 生ペイロード（JSON）のブロードキャストを正規化して転送する
    /// 解析できないペイロードはログに残して読み飛ばす
    fn from_raw(owner: UserId, mut source: broadcast::Receiver<RawEvent>) -> Self {
        let (tx, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let filter_owner = owner.clone();

        let forwarder = tokio::spawn(async move {
            loop {
                let raw = match source.recv().await {
                    Ok(RawEvent::Payload(raw)) => raw,
                    Ok(RawEvent::Reconnected) => {
                        if tx.send(FeedEvent::Resync).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Realtime subscriber lagged, requesting resync");
                        if tx.send(FeedEvent::Resync).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let change = match TaskChange::from_json(&raw) {
                    Ok(change) => change,
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed realtime payload");
                        continue;
                    }
                };

                if !change.concerns(&filter_owner) {
                    debug!(task_id = %change.task_id(), "Ignoring change for another owner");
                    continue;
                }

                if tx.send(FeedEvent::Change(change)).await.is_err() {
                    break;
                }
            }
            debug!(owner = %filter_owner, "Realtime forwarder stopped");
        });

        Self {
            owner,
            receiver,
            forwarder,
        }
    }

    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    /// 次のイベントを待つ（フィードが閉じられたら `None`）
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// 外部トランスポートから受け取った生ペイロードを配信するフィード
///
/// `RealtimeChannel` が接続ごとにここへ流し込む。
#[derive(Clone)]
pub struct RawChangeFeed {
    sender: broadcast::Sender<RawEvent>,
}

impl RawChangeFeed {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// トランスポートから届いたペイロードを流す（購読者がいなくても成功）
    pub fn publish_raw(&self, payload: impl Into<String>) {
        let _ = self.sender.send(RawEvent::Payload(payload.into()));
    }

    /// 再接続した（切断中の変更は届いていない）ことを購読者に伝える
    pub fn mark_reconnected(&self) {
        let _ = self.sender.send(RawEvent::Reconnected);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for RawChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeFeed for RawChangeFeed {
    async fn subscribe(&self, owner: &UserId) -> Result<ChangeSubscription, AppError> {
        Ok(ChangeSubscription::from_raw(
            owner.clone(),
            self.sender.subscribe(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn insert_payload(id: &str, owner: &str) -> String {
        serde_json::json!({
            "eventType": "INSERT",
            "new": {
                "id": id,
                "title": "Buy milk",
                "status": "todo",
                "priority": "medium",
                "user_id": owner,
                "created_at": "2024-05-01T10:00:00Z",
                "updated_at": "2024-05-01T10:00:00Z"
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_raw_feed_normalizes_and_filters() {
        let feed = RawChangeFeed::new();
        let owner = UserId::from_string("user-1").unwrap();
        let mut subscription = feed.subscribe(&owner).await.unwrap();

        feed.publish_raw("garbage");
        feed.publish_raw(insert_payload("other", "user-2"));
        feed.publish_raw(insert_payload("mine", "user-1"));

        match timeout(Duration::from_secs(1), subscription.recv()).await.unwrap() {
            Some(FeedEvent::Change(change)) => assert_eq!(change.task_id().as_str(), "mine"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_receiver() {
        let feed = RawChangeFeed::new();
        let owner = UserId::from_string("user-1").unwrap();
        let subscription = feed.subscribe(&owner).await.unwrap();
        assert_eq!(feed.subscriber_count(), 1);

        subscription.unsubscribe();
        // abort は非同期に反映される
        for _ in 0..50 {
            if feed.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_requests_resync() {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let owner = UserId::from_string("user-1").unwrap();
        let mut subscription = ChangeSubscription::from_changes(owner, sender.subscribe());

        // 転送タスクが動く前にバッファを溢れさせる
        for i in 0..CHANNEL_CAPACITY + 10 {
            let id = domain::TaskId::from_string(format!("t{i}")).unwrap();
            sender.send(TaskChange::deleted(id)).unwrap();
        }

        let first = timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap();
        assert_eq!(first, Some(FeedEvent::Resync));

        let mut changes = 0;
        while let Ok(Some(FeedEvent::Change(_))) =
            timeout(Duration::from_millis(100), subscription.recv()).await
        {
            changes += 1;
        }
        assert_eq!(changes, CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn test_reconnect_requests_resync() {
        let feed = RawChangeFeed::new();
        let owner = UserId::from_string("user-1").unwrap();
        let mut subscription = feed.subscribe(&owner).await.unwrap();

        feed.mark_reconnected();
        feed.publish_raw(insert_payload("after", "user-1"));

        let first = timeout(Duration::from_secs(1), subscription.recv()).await.unwrap();
        assert_eq!(first, Some(FeedEvent::Resync));
        let second = timeout(Duration::from_secs(1), subscription.recv()).await.unwrap();
        assert!(matches!(second, Some(FeedEvent::Change(change)) if change.task_id().as_str() == "after"));
    }
}
