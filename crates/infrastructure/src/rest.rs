use crate::channel::{ChannelConfig, RealtimeChannel};
use crate::gateway::{AuthEvent, AuthGateway, ChangeFeed, Session, TaskGateway};
use crate::realtime::{ChangeSubscription, RawChangeFeed, CHANNEL_CAPACITY};
use async_trait::async_trait;
use chrono::Utc;
use domain::{
    AuthUser, NewTask, ProfileEdit, ProfileRow, Task, TaskId, TaskPatch, UserId, UserProfile,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use shared::{trace_gateway_operation, AppError, Config};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};

/// PostgREST 形式のホスト型バックエンドに対するゲートウェイ
///
/// 行の CRUD は `/rest/v1/{table}`、認証は `/auth/v1/*`、変更フィードは
/// `/realtime/v1/websocket` のチャネルを使う。
pub struct RestGateway {
    client: Client,
    base_url: String,
    api_key: String,
    task_table: String,
    profile_table: String,
    details_table: String,
    session: RwLock<Option<Session>>,
    auth_tx: broadcast::Sender<AuthEvent>,
    realtime: RawChangeFeed,
    channel: Mutex<Option<RealtimeChannel>>,
}

/// 認証エンドポイントのレスポンス
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    user: Option<AuthUser>,
}

impl RestGateway {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AppError::Configuration(format!("HTTP client error: {e}")))?;
        let (auth_tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        Ok(Self {
            client,
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            task_table: config.task_table.clone(),
            profile_table: config.profile_table.clone(),
            details_table: config.details_table.clone(),
            session: RwLock::new(None),
            auth_tx,
            realtime: RawChangeFeed::new(),
            channel: Mutex::new(None),
        })
    }

    /// リアルタイムチャネルが流し込むフィード
    pub fn realtime(&self) -> &RawChangeFeed {
        &self.realtime
    }

    /// リアルタイムチャネルが動作中か
    pub async fn is_channel_open(&self) -> bool {
        self.channel
            .lock()
            .await
            .as_ref()
            .map_or(false, |channel| !channel.is_finished())
    }

    async fn bearer_token(&self) -> String {
        match self.session.read().await.as_ref() {
            Some(session) => session.access_token.clone(),
            None => self.api_key.clone(),
        }
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }

    /// 共通ヘッダーを付与（セッションがあればそのトークン、無ければ API キー）
    async fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self.bearer_token().await;
        request
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
    }

    async fn store_session(&self, session: Session) -> Session {
        *self.session.write().await = Some(session.clone());
        let _ = self.auth_tx.send(AuthEvent::SignedIn(session.clone()));
        info!(user_id = %session.user.id, "Signed in");
        session
    }

    async fn fetch_profile_row(&self, user_id: &str) -> Result<Option<ProfileRow>, AppError> {
        let request = self
            .client
            .get(self.rest_url(&self.profile_table))
            .query(&[
                ("select", "id,full_name,email".to_string()),
                ("id", format!("eq.{user_id}")),
            ]);
        let response = send(self.authorized(request).await).await?;
        let rows: Vec<ProfileRow> = read_json(response).await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_profile_row(&self, row: &ProfileRow) -> Result<(), AppError> {
        let request = self.client.post(self.rest_url(&self.profile_table)).json(row);
        send(self.authorized(request).await).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskGateway for RestGateway {
    async fn select_by_owner(&self, owner: &UserId) -> Result<Vec<Task>, AppError> {
        trace_gateway_operation(&self.task_table, "select", async {
            let request = self.client.get(self.rest_url(&self.task_table)).query(&[
                ("select", "*".to_string()),
                ("user_id", format!("eq.{owner}")),
                ("order", "created_at.desc".to_string()),
            ]);
            let response = send(self.authorized(request).await).await?;
            read_json(response).await
        })
        .await
    }

    async fn insert(&self, task: &NewTask) -> Result<Task, AppError> {
        trace_gateway_operation(&self.task_table, "insert", async {
            let request = self
                .client
                .post(self.rest_url(&self.task_table))
                .header("Prefer", "return=representation")
                .json(task);
            let response = send(self.authorized(request).await).await?;
            let rows: Vec<Task> = read_json(response).await?;
            rows.into_iter()
                .next()
                .ok_or_else(|| AppError::remote("Insert returned no row"))
        })
        .await
    }

    async fn update(&self, id: &TaskId, patch: &TaskPatch) -> Result<(), AppError> {
        trace_gateway_operation(&self.task_table, "update", async {
            let request = self
                .client
                .patch(self.rest_url(&self.task_table))
                .query(&[("id", format!("eq.{id}"))])
                .json(patch);
            send(self.authorized(request).await).await?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &TaskId) -> Result<(), AppError> {
        trace_gateway_operation(&self.task_table, "delete", async {
            let request = self
                .client
                .delete(self.rest_url(&self.task_table))
                .query(&[("id", format!("eq.{id}"))]);
            send(self.authorized(request).await).await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl AuthGateway for RestGateway {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AppError> {
        let request = self
            .client
            .post(self.auth_url("token"))
            .query(&[("grant_type", "password")])
            .header("apikey", &self.api_key)
            .json(&json!({ "email": email, "password": password }));
        let response = send(request).await?;
        let token: TokenResponse = read_json(response).await?;

        match session_from_token(token) {
            Some(session) => Ok(self.store_session(session).await),
            None => Err(AppError::remote("Sign in response carried no session")),
        }
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: Option<&str>,
    ) -> Result<Option<Session>, AppError> {
        let request = self
            .client
            .post(self.auth_url("signup"))
            .header("apikey", &self.api_key)
            .json(&json!({
                "email": email,
                "password": password,
                "data": { "full_name": full_name },
            }));
        let response = send(request).await?;
        let token: TokenResponse = read_json(response).await?;

        match session_from_token(token) {
            Some(session) => Ok(Some(self.store_session(session).await)),
            None => {
                info!(email, "Sign up pending email confirmation");
                Ok(None)
            }
        }
    }

    async fn sign_out(&self) -> Result<(), AppError> {
        let request = self.client.post(self.auth_url("logout"));
        send(self.authorized(request).await).await?;

        *self.session.write().await = None;
        if let Some(channel) = self.channel.lock().await.take() {
            channel.stop();
        }
        let _ = self.auth_tx.send(AuthEvent::SignedOut);
        info!("Signed out");
        Ok(())
    }

    async fn current_session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    async fn load_profile(&self, user: &AuthUser) -> Result<UserProfile, AppError> {
        let row = match self.fetch_profile_row(&user.id).await {
            Ok(Some(row)) => Some(row),
            Err(e) => {
                // 読めない場合は認証情報のメタデータで表示を続ける
                warn!(error = %e, user_id = %user.id, "Failed to read user record");
                None
            }
            Ok(None) => {
                // 初回サインイン時はプロフィール行を作成する（失敗しても表示は継続）
                let row = ProfileRow::for_auth_user(user);
                match self.insert_profile_row(&row).await {
                    Ok(()) => Some(row),
                    Err(e) => {
                        warn!(error = %e, user_id = %user.id, "Failed to create user record");
                        None
                    }
                }
            }
        };

        UserProfile::from_auth_user(user, row.as_ref()).map_err(AppError::from_domain)
    }

    async fn update_profile(&self, user_id: &UserId, edit: &ProfileEdit) -> Result<(), AppError> {
        let now = Utc::now();

        trace_gateway_operation(&self.profile_table, "update", async {
            let request = self
                .client
                .patch(self.rest_url(&self.profile_table))
                .query(&[("id", format!("eq.{user_id}"))])
                .json(&edit.user_row(now));
            send(self.authorized(request).await).await?;
            Ok(())
        })
        .await?;

        trace_gateway_operation(&self.details_table, "upsert", async {
            let request = self
                .client
                .post(self.rest_url(&self.details_table))
                .query(&[("on_conflict", "user_id")])
                .header("Prefer", "resolution=merge-duplicates")
                .json(&edit.details_row(user_id, now));
            send(self.authorized(request).await).await?;
            Ok(())
        })
        .await
    }

    async fn update_password(&self, new_password: &str) -> Result<(), AppError> {
        if self.session.read().await.is_none() {
            return Err(AppError::NotAuthenticated);
        }
        let request = self
            .client
            .put(self.auth_url("user"))
            .json(&json!({ "password": new_password }));
        send(self.authorized(request).await).await?;
        info!("Password updated");
        Ok(())
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_tx.subscribe()
    }
}

#[async_trait]
impl ChangeFeed for RestGateway {
    /// 購読を作成し、所有者で絞り込んだリアルタイムチャネルを開く
    async fn subscribe(&self, owner: &UserId) -> Result<ChangeSubscription, AppError> {
        let subscription = self.realtime.subscribe(owner).await?;
        let config = ChannelConfig::new(
            &self.base_url,
            &self.api_key,
            self.bearer_token().await,
            self.task_table.clone(),
            owner.clone(),
        )?;

        let channel = RealtimeChannel::spawn(config, self.realtime.clone());
        if let Some(previous) = self.channel.lock().await.replace(channel) {
            previous.stop();
        }
        info!(user_id = %owner, "Realtime channel opened");
        Ok(subscription)
    }
}

fn session_from_token(token: TokenResponse) -> Option<Session> {
    match (token.access_token, token.user) {
        (Some(access_token), Some(user)) => Some(Session {
            access_token,
            refresh_token: token.refresh_token,
            user,
        }),
        _ => None,
    }
}

/// リクエストを送信し、失敗ステータスは `AppError::Remote` に変換する
async fn send(request: RequestBuilder) -> Result<Response, AppError> {
    let response = request.send().await.map_err(map_transport_error)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(AppError::Remote(error_message(status, &body)))
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, AppError> {
    response
        .json::<T>()
        .await
        .map_err(|e| AppError::Deserialization(e.to_string()))
}

fn map_transport_error(error: reqwest::Error) -> AppError {
    if error.is_timeout() {
        AppError::remote("request timed out")
    } else {
        AppError::Remote(error.to_string())
    }
}

/// エラーレスポンス本文からメッセージを取り出す
fn error_message(status: StatusCode, body: &str) -> String {
    let message = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        ["message", "msg", "error_description", "error"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str).map(str::to_string))
    });

    match message {
        Some(message) => format!("{status}: {message}"),
        None if body.trim().is_empty() => status.to_string(),
        None => format!("{status}: {}", body.trim()),
    }
}
