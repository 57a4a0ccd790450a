use crate::realtime::RawChangeFeed;
use domain::UserId;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use shared::AppError;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const JOIN_REF: &str = "1";

/// リアルタイムチャネルの接続設定
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// `ws(s)://.../realtime/v1/websocket?apikey=...&vsn=1.0.0`
    pub url: String,
    pub access_token: String,
    pub table: String,
    pub owner: UserId,
}

impl ChannelConfig {
    pub fn new(
        base_url: &str,
        api_key: &str,
        access_token: impl Into<String>,
        table: impl Into<String>,
        owner: UserId,
    ) -> Result<Self, AppError> {
        Ok(Self {
            url: websocket_url(base_url, api_key)?,
            access_token: access_token.into(),
            table: table.into(),
            owner,
        })
    }

    pub fn topic(&self) -> String {
        format!("realtime:task_changes:{}", self.owner)
    }

    /// 所有者の行だけを対象にした `postgres_changes` への参加要求
    pub fn join_message(&self) -> Value {
        json!({
            "topic": self.topic(),
            "event": "phx_join",
            "payload": {
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [{
                        "event": "*",
                        "schema": "public",
                        "table": self.table,
                        "filter": format!("user_id=eq.{}", self.owner),
                    }],
                },
                "access_token": self.access_token,
            },
            "ref": JOIN_REF,
            "join_ref": JOIN_REF,
        })
    }
}

/// HTTP のベースURLからリアルタイムのエンドポイントを組み立てる
pub fn websocket_url(base_url: &str, api_key: &str) -> Result<String, AppError> {
    let mut url = Url::parse(&format!(
        "{}/realtime/v1/websocket",
        base_url.trim_end_matches('/')
    ))
    .map_err(|e| AppError::Configuration(format!("Invalid gateway URL: {e}")))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(AppError::Configuration(format!(
                "Unsupported gateway URL scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| AppError::Configuration(format!("Cannot use scheme {scheme}")))?;
    url.query_pairs_mut()
        .append_pair("apikey", api_key)
        .append_pair("vsn", "1.0.0");
    Ok(url.to_string())
}

fn heartbeat_message(reference: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": reference.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
}

/// 受信フレームの解釈結果
#[derive(Debug, Clone, PartialEq)]
pub enum FrameAction {
    /// `eventType` / `new` / `old` 形式に変換した変更ペイロード
    Change(String),
    Joined,
    Rejected(String),
    /// サーバー側でチャネルが閉じられた
    Closed,
    Ignore,
}

/// 受信フレームを解釈する（他トピックのフレームとハートビート応答は無視）
pub fn decode_frame(text: &str, topic: &str) -> Result<FrameAction, AppError> {
    let frame: Frame =
        serde_json::from_str(text).map_err(|e| AppError::Deserialization(e.to_string()))?;
    if frame.topic != topic {
        return Ok(FrameAction::Ignore);
    }

    let action = match frame.event.as_str() {
        "postgres_changes" => change_payload(frame.payload.get("data").unwrap_or(&Value::Null)),
        "INSERT" | "UPDATE" | "DELETE" => change_payload(&frame.payload),
        "phx_reply" => match frame.payload.get("status").and_then(Value::as_str) {
            Some("ok") => FrameAction::Joined,
            _ => FrameAction::Rejected(
                frame
                    .payload
                    .get("response")
                    .map(Value::to_string)
                    .unwrap_or_else(|| "unknown reason".to_string()),
            ),
        },
        "phx_error" | "phx_close" => FrameAction::Closed,
        _ => FrameAction::Ignore,
    };
    Ok(action)
}

fn change_payload(data: &Value) -> FrameAction {
    let Some(kind) = data.get("type").and_then(Value::as_str) else {
        return FrameAction::Ignore;
    };
    let payload = json!({
        "eventType": kind,
        "new": data.get("record").cloned().unwrap_or(Value::Null),
        "old": data.get("old_record").cloned().unwrap_or(Value::Null),
    });
    FrameAction::Change(payload.to_string())
}

/// ホスト型バックエンドのリアルタイムチャネル接続
///
/// 受信した変更を `RawChangeFeed` に流す。切断時は待機して再接続し、
/// 再参加できた時点で取りこぼしを購読者に通知する。ドロップで停止する。
pub struct RealtimeChannel {
    task: JoinHandle<()>,
}

impl RealtimeChannel {
    pub fn spawn(config: ChannelConfig, feed: RawChangeFeed) -> Self {
        let task = tokio::spawn(async move {
            let mut joined_before = false;
            let mut delay = RECONNECT_DELAY;
            loop {
                match run_connection(&config, &feed, &mut joined_before).await {
                    Ok(()) => {
                        info!(owner = %config.owner, "Realtime connection closed");
                        delay = RECONNECT_DELAY;
                    }
                    Err(e) => {
                        warn!(
                            owner = %config.owner,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Realtime connection failed"
                        );
                    }
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RECONNECT_DELAY);
            }
        });

        Self { task }
    }

    pub fn stop(self) {
        drop(self);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn transport_error(error: tokio_tungstenite::tungstenite::Error) -> AppError {
    AppError::Remote(format!("realtime transport error: {error}"))
}

async fn run_connection(
    config: &ChannelConfig,
    feed: &RawChangeFeed,
    joined_before: &mut bool,
) -> Result<(), AppError> {
    let (socket, _) = connect_async(config.url.as_str())
        .await
        .map_err(transport_error)?;
    let (mut sink, mut stream) = socket.split();
    let topic = config.topic();

    sink.send(Message::Text(config.join_message().to_string()))
        .await
        .map_err(transport_error)?;
    debug!(topic = %topic, "Realtime join sent");

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut next_ref: u64 = 2;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                sink.send(Message::Text(heartbeat_message(next_ref).to_string()))
                    .await
                    .map_err(transport_error)?;
                next_ref += 1;
            }
            message = stream.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(transport_error(e)),
                };

                match decode_frame(&text, &topic) {
                    Ok(FrameAction::Change(payload)) => feed.publish_raw(payload),
                    Ok(FrameAction::Joined) => {
                        info!("リアルタイム接続確立: user_id={}", config.owner);
                        if *joined_before {
                            feed.mark_reconnected();
                        }
                        *joined_before = true;
                    }
                    Ok(FrameAction::Rejected(reason)) => {
                        return Err(AppError::Remote(format!("realtime join rejected: {reason}")));
                    }
                    Ok(FrameAction::Closed) => return Ok(()),
                    Ok(FrameAction::Ignore) => {}
                    Err(e) => warn!(error = %e, "Skipping unreadable realtime frame"),
                }
            }
        }
    }
}
