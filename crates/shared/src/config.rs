use crate::errors::AppError;
use std::env;
use std::time::Duration;

/// ログ出力形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn from_string(value: &str) -> Result<Self, AppError> {
        match value.trim().to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(AppError::Configuration(format!(
                "Unknown log format: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// ホスト型バックエンドのベースURL
    pub gateway_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
    pub task_table: String,
    pub profile_table: String,
    /// 連絡先・自己紹介を持つテーブル
    pub details_table: String,
    pub environment: String,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway_url: "http://localhost:54321".to_string(),
            api_key: String::new(),
            request_timeout: Duration::from_millis(10_000),
            task_table: "task".to_string(),
            profile_table: "users".to_string(),
            details_table: "profile".to_string(),
            environment: "dev".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// 任意の取得関数から設定を組み立てる（テスト用に環境変数を差し替え可能）
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let request_timeout = match lookup("TASKFLOW_REQUEST_TIMEOUT_MS") {
            Some(raw) => parse_timeout(&raw)?,
            None => defaults.request_timeout,
        };

        let log_format = match lookup("TASKFLOW_LOG_FORMAT") {
            Some(raw) => LogFormat::from_string(&raw)?,
            None => defaults.log_format,
        };

        Ok(Config {
            gateway_url: lookup("TASKFLOW_GATEWAY_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.gateway_url),
            api_key: lookup("TASKFLOW_API_KEY").unwrap_or(defaults.api_key),
            request_timeout,
            task_table: lookup("TASKFLOW_TASK_TABLE").unwrap_or(defaults.task_table),
            profile_table: lookup("TASKFLOW_PROFILE_TABLE").unwrap_or(defaults.profile_table),
            details_table: lookup("TASKFLOW_DETAILS_TABLE").unwrap_or(defaults.details_table),
            environment: lookup("ENVIRONMENT").unwrap_or(defaults.environment),
            log_format,
        })
    }
}

fn parse_timeout(raw: &str) -> Result<Duration, AppError> {
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
        _ => Err(AppError::Configuration(format!(
            "TASKFLOW_REQUEST_TIMEOUT_MS must be a positive integer: {raw}"
        ))),
    }
}
