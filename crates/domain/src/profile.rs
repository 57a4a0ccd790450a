use crate::errors::DomainError;
use crate::task::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::form_urlencoded::byte_serialize;

const AVATAR_BASE_URL: &str = "https://api.dicebear.com/7.x/avataaars/svg";
const FALLBACK_NAME: &str = "User";
const MIN_PASSWORD_LENGTH: usize = 6;

/// 認証サブシステムが返すユーザー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: Option<Value>,
}

impl AuthUser {
    fn metadata_full_name(&self) -> Option<String> {
        self.user_metadata
            .as_ref()?
            .get("full_name")?
            .as_str()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }

    fn email_local_part(&self) -> Option<String> {
        self.email
            .as_deref()?
            .split('@')
            .next()
            .filter(|local| !local.is_empty())
            .map(str::to_string)
    }

    /// プロフィール行が無い場合の表示名
    pub fn fallback_name(&self) -> String {
        self.metadata_full_name()
            .or_else(|| self.email_local_part())
            .unwrap_or_else(|| FALLBACK_NAME.to_string())
    }
}

/// `users` テーブルの非正規化プロフィール行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRow {
    pub id: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl ProfileRow {
    /// 初回サインイン時に作成するプロフィール行
    pub fn for_auth_user(user: &AuthUser) -> Self {
        Self {
            id: user.id.clone(),
            full_name: Some(user.fallback_name()),
            email: user.email.clone(),
        }
    }
}

/// 画面表示用のユーザープロフィール
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub avatar_url: String,
}

impl UserProfile {
    /// 認証ユーザーとプロフィール行から表示用プロフィールを組み立てる
    pub fn from_auth_user(user: &AuthUser, profile: Option<&ProfileRow>) -> Result<Self, DomainError> {
        let id = UserId::from_string(user.id.clone())?;

        let name = profile
            .and_then(|p| p.full_name.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| user.fallback_name());

        let email = profile
            .and_then(|p| p.email.clone())
            .or_else(|| user.email.clone())
            .unwrap_or_default();

        let seed: String = byte_serialize(user.email.as_deref().unwrap_or_default().as_bytes())
            .collect();

        Ok(Self {
            id,
            name,
            email,
            avatar_url: format!("{AVATAR_BASE_URL}?seed={seed}"),
        })
    }

    /// 保存済みの編集内容を反映する（アバターは変えない）
    pub fn apply_edit(&mut self, edit: &ProfileEdit) {
        self.name = edit.name.clone();
        self.email = edit.email.clone();
    }
}

/// プロフィール編集フォームの入力
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileEdit {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub bio: String,
    pub location: String,
    pub website: String,
}

impl ProfileEdit {
    /// 前後の空白を除去し、名前とメールアドレスを必須として検証する
    pub fn normalized(&self) -> Result<Self, DomainError> {
        let edit = Self {
            name: self.name.trim().to_string(),
            email: self.email.trim().to_string(),
            phone: self.phone.trim().to_string(),
            bio: self.bio.trim().to_string(),
            location: self.location.trim().to_string(),
            website: self.website.trim().to_string(),
        };

        if edit.name.is_empty() {
            return Err(DomainError::Validation("Name is required".to_string()));
        }
        if edit.email.is_empty() {
            return Err(DomainError::Validation("Email is required".to_string()));
        }
        Ok(edit)
    }

    /// `users` 行への更新内容
    pub fn user_row(&self, now: DateTime<Utc>) -> UserRowUpdate {
        UserRowUpdate {
            full_name: self.name.clone(),
            email: self.email.clone(),
            updated_at: now,
        }
    }

    /// `profile` 行（利用者ごとに1行、upsert する）
    pub fn details_row(&self, user_id: &UserId, now: DateTime<Utc>) -> ProfileDetailsRow {
        ProfileDetailsRow {
            user_id: user_id.to_string(),
            phone_number: self.phone.clone(),
            bio: self.bio.clone(),
            location: self.location.clone(),
            website: self.website.clone(),
            updated_at: now,
        }
    }
}

/// `users` 行の部分更新
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserRowUpdate {
    pub full_name: String,
    pub email: String,
    pub updated_at: DateTime<Utc>,
}

/// `profile` テーブルの連絡先・自己紹介
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileDetailsRow {
    pub user_id: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub website: String,
    pub updated_at: DateTime<Utc>,
}

/// パスワード変更フォームの入力
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordChange {
    pub new_password: String,
    pub confirm_password: String,
}

impl PasswordChange {
    pub fn new(new_password: impl Into<String>, confirm_password: impl Into<String>) -> Self {
        Self {
            new_password: new_password.into(),
            confirm_password: confirm_password.into(),
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.new_password != self.confirm_password {
            return Err(DomainError::Validation(
                "New passwords don't match".to_string(),
            ));
        }
        if self.new_password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(DomainError::Validation(format!(
                "Password must be at least {MIN_PASSWORD_LENGTH} characters"
            )));
        }
        Ok(())
    }
}
