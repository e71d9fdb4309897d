//! Registration, email verification, sessions and password management.
//!
//! Verification tokens are `{account_id}:{unix_ts}:{signature}` where the
//! signature is a hex HMAC-SHA256 of the first two parts under
//! `[auth].secret`. Reset tokens are random UUIDs paired with a one-time
//! code. Both kinds are consumed with a guarded
//! `UPDATE … WHERE is_used = 0`; the affected-row count decides which of two
//! concurrent requests wins.

use anyhow::{anyhow, Result};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use handout_desk_core::error::{not_found, validation, DeskError};
use handout_desk_core::models::{Account, Role};
use handout_desk_core::otp;
use handout_desk_core::quota::Tier;

use crate::config::{AuthConfig, MailConfig};
use crate::letters::Letters;
use crate::sqlite_store::{account_from_row, ACCOUNT_COLUMNS};

type HmacSha256 = Hmac<Sha256>;

pub const MIN_PASSWORD_LEN: usize = 8;
const LANGUAGES: [&str; 4] = ["en", "zh_TW", "zh_CN", "th"];

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    /// Username or email.
    #[serde(alias = "username", alias = "email")]
    pub login: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub token: String,
    pub expires_at: i64,
    pub account: Account,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfilePatch {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyOutcome {
    Verified,
    AlreadyVerified,
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("password hashing failed: {}", e))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    PasswordHash::new(stored)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

fn sign(secret: &str, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Build a signed verification token for `account_id` issued at `issued_at`.
pub fn verification_token(secret: &str, account_id: &str, issued_at: i64) -> String {
    let payload = format!("{}:{}", account_id, issued_at);
    let signature = sign(secret, &payload);
    format!("{}:{}", payload, signature)
}

/// Split and check a verification token. Returns the account id and issue
/// time when the signature is valid.
pub fn parse_verification_token(secret: &str, token: &str) -> Option<(String, i64)> {
    let mut parts = token.splitn(3, ':');
    let account_id = parts.next()?;
    let issued_at: i64 = parts.next()?.parse().ok()?;
    let signature = hex::decode(parts.next()?).ok()?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(format!("{}:{}", account_id, issued_at).as_bytes());
    mac.verify_slice(&signature).ok()?;
    Some((account_id.to_string(), issued_at))
}

fn new_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn check_password_strength(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(validation(format!(
            "Password must be at least {} characters long.",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn check_language(language: &str) -> Result<()> {
    if !LANGUAGES.contains(&language) {
        return Err(validation(format!(
            "Unsupported language '{}'. Must be one of {}.",
            language,
            LANGUAGES.join(", ")
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct AccountService {
    pool: SqlitePool,
    auth: AuthConfig,
    default_language: String,
    letters: Letters,
}

impl AccountService {
    pub fn new(pool: SqlitePool, auth: AuthConfig, mail: &MailConfig, letters: Letters) -> Self {
        Self {
            pool,
            auth,
            default_language: mail.default_language.clone(),
            letters,
        }
    }

    pub async fn get(&self, id: &str) -> Result<Account> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE id = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(account_from_row)
            .ok_or_else(|| not_found("Account", id))
    }

    /// Look up by username, or by email when `login` contains `@`.
    pub async fn find_by_login(&self, login: &str) -> Result<Option<Account>> {
        let login = login.trim();
        let (column, value) = if login.contains('@') {
            ("email", login.to_lowercase())
        } else {
            ("username", login.to_string())
        };
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE {} = ?",
            ACCOUNT_COLUMNS, column
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(account_from_row))
    }

    async fn password_hash(&self, account_id: &str) -> Result<String> {
        let hash: String = sqlx::query_scalar("SELECT password_hash FROM accounts WHERE id = ?")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(hash)
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_account(
        &self,
        username: &str,
        email: &str,
        password: &str,
        role: Role,
        tier: Tier,
        language: &str,
        active: bool,
    ) -> Result<Account> {
        let username = username.trim();
        let email = email.trim().to_lowercase();
        if username.is_empty() {
            return Err(validation("Username is required."));
        }
        if !email.contains('@') {
            return Err(validation("A valid email address is required."));
        }
        check_password_strength(password)?;
        check_language(language)?;

        let taken: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM accounts WHERE username = ? OR email = ?")
                .bind(username)
                .bind(&email)
                .fetch_one(&self.pool)
                .await?;
        if taken > 0 {
            return Err(validation("A user with that username or email already exists."));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO accounts (id, username, email, password_hash, role, tier, language,
                                  is_active, is_verified, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(username)
        .bind(&email)
        .bind(hash_password(password)?)
        .bind(role.as_str())
        .bind(tier.as_str())
        .bind(language)
        .bind(active)
        .bind(active)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(&id).await
    }

    /// Create an inactive account and send its verification email.
    pub async fn register(&self, req: RegisterRequest) -> Result<Account> {
        let language = req
            .language
            .clone()
            .unwrap_or_else(|| self.default_language.clone());
        let account = self
            .insert_account(
                &req.username,
                &req.email,
                &req.password,
                Role::Editor,
                Tier::Trial,
                &language,
                false,
            )
            .await?;

        let now = Utc::now().timestamp();
        let token = verification_token(&self.auth.secret, &account.id, now);
        sqlx::query(
            "INSERT INTO email_verification_tokens (token, account_id, created_at, is_used) VALUES (?, ?, ?, 0)",
        )
        .bind(&token)
        .bind(&account.id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let verification_url = format!(
            "{}/verify-email?token={}",
            self.letters.frontend_url(),
            token
        );
        let queued = self
            .letters
            .queue_templated(
                "email_verification",
                &self.letters.search_order(&account.language),
                &account.email,
                Some(&account.id),
                json!({ "username": account.username, "verification_url": verification_url }),
            )
            .await?;
        if !queued {
            debug!(account = %account.id, "no verification template, email skipped");
        }

        info!(account = %account.id, username = %account.username, "account registered");
        Ok(account)
    }

    /// Administrative creation: the account is active and verified at once.
    pub async fn create_account(
        &self,
        username: &str,
        email: &str,
        password: &str,
        role: Role,
        tier: Tier,
    ) -> Result<Account> {
        let language = self.default_language.clone();
        self.insert_account(username, email, password, role, tier, &language, true)
            .await
    }

    pub async fn set_tier(&self, username: &str, tier: Tier) -> Result<Account> {
        let account = self
            .find_by_login(username)
            .await?
            .ok_or_else(|| not_found("Account", username))?;
        sqlx::query("UPDATE accounts SET tier = ?, updated_at = ? WHERE id = ?")
            .bind(tier.as_str())
            .bind(Utc::now().timestamp())
            .bind(&account.id)
            .execute(&self.pool)
            .await?;
        self.get(&account.id).await
    }

    pub async fn verify_email(&self, token: &str) -> Result<VerifyOutcome> {
        let row = sqlx::query(
            "SELECT account_id, created_at, is_used FROM email_verification_tokens WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DeskError::TokenInvalid("Invalid verification token.".into()))?;

        let account_id: String = row.get("account_id");
        let created_at: i64 = row.get("created_at");
        let is_used: bool = row.get("is_used");

        let account = self.get(&account_id).await?;
        if is_used && account.is_verified {
            return Ok(VerifyOutcome::AlreadyVerified);
        }

        match parse_verification_token(&self.auth.secret, token) {
            Some((signed_id, _)) if signed_id == account_id => {}
            _ => return Err(DeskError::TokenInvalid("Invalid verification token.".into()).into()),
        }

        let now = Utc::now().timestamp();
        if now - created_at > self.auth.verification_ttl_hours * 3600 {
            return Err(DeskError::TokenExpired("Verification token has expired.".into()).into());
        }
        if is_used {
            return Err(DeskError::TokenUsed("Verification token has already been used.".into()).into());
        }

        let mut tx = self.pool.begin().await?;
        let consumed = sqlx::query(
            "UPDATE email_verification_tokens SET is_used = 1 WHERE token = ? AND is_used = 0",
        )
        .bind(token)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if consumed == 0 {
            return Err(DeskError::TokenUsed("Verification token has already been used.".into()).into());
        }
        sqlx::query(
            "UPDATE accounts SET is_active = 1, is_verified = 1, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(&account_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(account = %account_id, "email verified");
        Ok(VerifyOutcome::Verified)
    }

    pub async fn login(&self, req: LoginRequest) -> Result<Session> {
        let denied = || DeskError::PermissionDenied("Invalid credentials.".into());

        let account = self.find_by_login(&req.login).await?.ok_or_else(denied)?;
        let stored = self.password_hash(&account.id).await?;
        if !verify_password(&req.password, &stored) {
            return Err(denied().into());
        }
        if !account.is_active {
            return Err(DeskError::PermissionDenied("Account is not active.".into()).into());
        }

        let now = Utc::now().timestamp();
        let expires_at = now + self.auth.session_ttl_hours * 3600;
        let token = new_session_token();
        sqlx::query(
            "INSERT INTO sessions (token, account_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&token)
        .bind(&account.id)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        debug!(account = %account.id, "session created");
        Ok(Session {
            token,
            expires_at,
            account,
        })
    }

    /// Resolve a bearer session token to its active account.
    pub async fn authenticate(&self, token: &str) -> Result<Account> {
        let unauthenticated = || DeskError::Unauthenticated("Invalid or expired session.".into());

        let row = sqlx::query("SELECT account_id, expires_at FROM sessions WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(unauthenticated)?;
        let account_id: String = row.get("account_id");
        let expires_at: i64 = row.get("expires_at");

        if expires_at <= Utc::now().timestamp() {
            sqlx::query("DELETE FROM sessions WHERE token = ?")
                .bind(token)
                .execute(&self.pool)
                .await?;
            return Err(unauthenticated().into());
        }

        let account = self.get(&account_id).await?;
        if !account.is_active {
            return Err(unauthenticated().into());
        }
        Ok(account)
    }

    pub async fn change_password(
        &self,
        account_id: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        let stored = self.password_hash(account_id).await?;
        if !verify_password(old_password, &stored) {
            return Err(validation("Old password is incorrect."));
        }
        check_password_strength(new_password)?;

        sqlx::query("UPDATE accounts SET password_hash = ?, updated_at = ? WHERE id = ?")
            .bind(hash_password(new_password)?)
            .bind(Utc::now().timestamp())
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn request_password_reset(&self, email: &str) -> Result<()> {
        let email = email.trim().to_lowercase();
        let account = self
            .find_by_login(&email)
            .await?
            .filter(|_| email.contains('@'))
            .ok_or_else(|| validation("No user found with this email address."))?;

        let token = Uuid::new_v4().to_string();
        let code = otp::generate();
        sqlx::query(
            "INSERT INTO password_reset_tokens (token, account_id, otp, created_at, is_used) VALUES (?, ?, ?, ?, 0)",
        )
        .bind(&token)
        .bind(&account.id)
        .bind(&code)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        let context = json!({
            "username": account.username,
            "otp": code,
            "token": token,
            "reset_url": format!("{}/reset-password?token={}", self.letters.frontend_url(), token),
            "expiry_minutes": self.auth.reset_ttl_minutes,
        });
        self.letters
            .queue_templated(
                "password_reset",
                &self.letters.search_order(&account.language),
                &account.email,
                Some(&account.id),
                context,
            )
            .await?;
        Ok(())
    }

    pub async fn confirm_password_reset(
        &self,
        token: &str,
        code: &str,
        new_password: &str,
    ) -> Result<()> {
        let row = sqlx::query(
            "SELECT account_id, otp, created_at, is_used FROM password_reset_tokens WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DeskError::TokenInvalid("Invalid reset token.".into()))?;

        let account_id: String = row.get("account_id");
        let expected: String = row.get("otp");
        let created_at: i64 = row.get("created_at");
        let is_used: bool = row.get("is_used");

        if is_used {
            return Err(DeskError::TokenUsed("Reset token has already been used.".into()).into());
        }
        if Utc::now().timestamp() - created_at > self.auth.reset_ttl_minutes * 60 {
            return Err(DeskError::TokenExpired("Reset token has expired.".into()).into());
        }
        if !code.trim().eq_ignore_ascii_case(&expected) {
            return Err(validation("Invalid OTP."));
        }
        check_password_strength(new_password)?;

        let hash = hash_password(new_password)?;
        let mut tx = self.pool.begin().await?;
        let consumed = sqlx::query(
            "UPDATE password_reset_tokens SET is_used = 1 WHERE token = ? AND is_used = 0",
        )
        .bind(token)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if consumed == 0 {
            return Err(DeskError::TokenUsed("Reset token has already been used.".into()).into());
        }
        sqlx::query("UPDATE accounts SET password_hash = ?, updated_at = ? WHERE id = ?")
            .bind(&hash)
            .bind(Utc::now().timestamp())
            .bind(&account_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE account_id = ?")
            .bind(&account_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(account = %account_id, "password reset");
        Ok(())
    }

    pub async fn update_profile(&self, account_id: &str, patch: ProfilePatch) -> Result<Account> {
        let mut account = self.get(account_id).await?;
        if let Some(first_name) = patch.first_name {
            account.first_name = first_name.trim().to_string();
        }
        if let Some(last_name) = patch.last_name {
            account.last_name = last_name.trim().to_string();
        }
        if let Some(language) = patch.language {
            check_language(&language)?;
            account.language = language;
        }

        sqlx::query(
            "UPDATE accounts SET first_name = ?, last_name = ?, language = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&account.first_name)
        .bind(&account.last_name)
        .bind(&account.language)
        .bind(Utc::now().timestamp())
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        self.get(account_id).await
    }
}
