use chrono::Utc;
use domain::DashboardStats;
use infrastructure::{AuthEvent, AuthGateway, RestGateway};
use shared::{init_tracing, AppError, Config};
use std::env;
use std::sync::Arc;
use task_sync::{spawn_auth_listener, NoticeLevel, TaskSyncSession};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 必須の環境変数を取得
fn required_env(key: &str) -> Result<String, AppError> {
    env::var(key).map_err(|_| AppError::Configuration(format!("{key} is required")))
}

fn log_dashboard(stats: &DashboardStats) {
    info!(
        total = stats.total,
        todo = stats.todo,
        in_progress = stats.in_progress,
        completed = stats.completed,
        completion_rate = stats.completion_rate,
        overdue = stats.overdue,
        upcoming = stats.upcoming.len(),
        "Dashboard updated"
    );
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = Config::from_env()?;
    init_tracing(config.log_format)?;
    info!(
        "TaskFlow同期開始: environment={}, gateway={}",
        config.environment, config.gateway_url
    );

    let email = required_env("TASKFLOW_EMAIL")?;
    let password = required_env("TASKFLOW_PASSWORD")?;

    let gateway = Arc::new(RestGateway::new(&config).map_err(|e| {
        error!("ゲートウェイ初期化エラー: {}", e);
        e
    })?);
    let session = Arc::new(TaskSyncSession::from_config(gateway.clone(), &config));

    let auth = gateway.sign_in(&email, &password).await?;
    session
        .handle_auth_event(AuthEvent::SignedIn(auth))
        .await?;
    // 以降のサインイン・サインアウトはリスナー経由で反映する
    let listener = spawn_auth_listener(session.clone());

    let mut snapshots = session.store().subscribe();
    let mut notices = session.notices().subscribe();
    log_dashboard(&DashboardStats::compute(&snapshots.borrow_and_update().tasks, Utc::now()));

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let tasks = snapshots.borrow_and_update().tasks.clone();
                log_dashboard(&DashboardStats::compute(&tasks, Utc::now()));
            }
            notice = notices.recv() => match notice {
                Ok(notice) if notice.level == NoticeLevel::Error => warn!("{}", notice.message),
                Ok(notice) => info!("{}", notice.message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => warn!(skipped, "Notice stream lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("終了シグナル受信");
                break;
            }
        }
    }

    if let Err(e) = session.sign_out().await {
        error!("サインアウトに失敗: {}", e);
    }
    listener.abort();
    info!("TaskFlow同期終了");
    Ok(())
}
