//! Localized email templates and letters.
//!
//! A letter is created from the first template found in a language search
//! order, then handed to the [`TaskQueue`]. The worker renders and delivers
//! it through a [`Transport`] and marks it sent. [`Letters`] also implements
//! the core [`Mailer`] trait, so storage warnings go through the same path.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, error, info};
use uuid::Uuid;

use handout_desk_core::error::{not_found, permission_denied, validation};
use handout_desk_core::models::Account;
use handout_desk_core::notify::{self, Mailer, WarningLevel};
use handout_desk_core::quota;
use handout_desk_core::template;

use crate::config::MailConfig;
use crate::queue::{OutgoingMessage, Task, TaskQueue, Transport};

#[derive(Debug, Clone, Serialize)]
pub struct EmailTemplate {
    pub id: String,
    pub name: String,
    pub language: String,
    pub subject: String,
    pub html_content: String,
    pub text_content: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateInput {
    pub name: String,
    pub language: String,
    pub subject: String,
    pub html_content: String,
    #[serde(default)]
    pub text_content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Letter {
    pub id: String,
    pub account_id: Option<String>,
    pub template_name: String,
    pub language: String,
    pub recipient: String,
    pub context: Value,
    pub subject: Option<String>,
    pub content: Option<String>,
    pub is_sent: bool,
    pub sent_at: Option<i64>,
    pub created_at: i64,
}

const LETTER_COLUMNS: &str = "id, account_id, template_name, language, recipient, context_json, \
     subject, content, is_sent, sent_at, created_at";

const TEMPLATE_COLUMNS: &str =
    "id, name, language, subject, html_content, text_content, updated_at";

fn letter_from_row(row: &SqliteRow) -> Letter {
    let context: String = row.get("context_json");
    Letter {
        id: row.get("id"),
        account_id: row.get("account_id"),
        template_name: row.get("template_name"),
        language: row.get("language"),
        recipient: row.get("recipient"),
        context: serde_json::from_str(&context).unwrap_or_else(|_| json!({})),
        subject: row.get("subject"),
        content: row.get("content"),
        is_sent: row.get("is_sent"),
        sent_at: row.get("sent_at"),
        created_at: row.get("created_at"),
    }
}

fn template_from_row(row: &SqliteRow) -> EmailTemplate {
    EmailTemplate {
        id: row.get("id"),
        name: row.get("name"),
        language: row.get("language"),
        subject: row.get("subject"),
        html_content: row.get("html_content"),
        text_content: row.get("text_content"),
        updated_at: row.get("updated_at"),
    }
}

pub async fn get_template(
    pool: &SqlitePool,
    name: &str,
    language: &str,
) -> Result<Option<EmailTemplate>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM email_templates WHERE name = ? AND language = ?",
        TEMPLATE_COLUMNS
    ))
    .bind(name)
    .bind(language)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(template_from_row))
}

pub async fn get_letter(pool: &SqlitePool, id: &str) -> Result<Option<Letter>> {
    let row = sqlx::query(&format!("SELECT {} FROM letters WHERE id = ?", LETTER_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(letter_from_row))
}

pub async fn unsent_ids(pool: &SqlitePool) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar("SELECT id FROM letters WHERE is_sent = 0 ORDER BY created_at")
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

/// Render and deliver one letter, then mark it sent.
///
/// A sent letter is skipped. A missing template or a transport failure is
/// returned as an error and leaves the letter unsent.
pub async fn deliver(
    pool: &SqlitePool,
    transport: &dyn Transport,
    from: &str,
    letter_id: &str,
) -> Result<()> {
    let letter = get_letter(pool, letter_id)
        .await?
        .ok_or_else(|| not_found("Letter", letter_id))?;
    if letter.is_sent {
        debug!(letter = %letter.id, "letter already sent");
        return Ok(());
    }

    let Some(tpl) = get_template(pool, &letter.template_name, &letter.language).await? else {
        error!(
            letter = %letter.id,
            template = %letter.template_name,
            language = %letter.language,
            "template missing for letter"
        );
        anyhow::bail!(
            "template {} ({}) not found",
            letter.template_name,
            letter.language
        );
    };

    let message = OutgoingMessage {
        id: letter.id.clone(),
        from: from.to_string(),
        to: letter.recipient.clone(),
        subject: template::render(&tpl.subject, &letter.context, false),
        html: template::render(&tpl.html_content, &letter.context, true),
        text: template::render(
            tpl.text_content.as_deref().unwrap_or_default(),
            &letter.context,
            false,
        ),
    };
    transport.deliver(&message).await?;

    sqlx::query(
        "UPDATE letters SET is_sent = 1, sent_at = ?, subject = ?, content = ? WHERE id = ?",
    )
    .bind(Utc::now().timestamp())
    .bind(&message.subject)
    .bind(&message.html)
    .bind(&letter.id)
    .execute(pool)
    .await?;

    info!(letter = %letter.id, to = %letter.recipient, template = %letter.template_name, "letter sent");
    Ok(())
}

/// Letter creation and template management over SQLite.
#[derive(Clone)]
pub struct Letters {
    pool: SqlitePool,
    queue: TaskQueue,
    default_language: String,
    frontend_url: String,
}

impl Letters {
    pub fn new(pool: SqlitePool, queue: TaskQueue, mail: &MailConfig) -> Self {
        Self {
            pool,
            queue,
            default_language: mail.default_language.clone(),
            frontend_url: mail.frontend_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn frontend_url(&self) -> &str {
        &self.frontend_url
    }

    /// Languages to try for a recipient who prefers `preference`.
    pub fn search_order(&self, preference: &str) -> Vec<String> {
        notify::template_search_order(preference, &self.default_language)
    }

    pub async fn find_template(
        &self,
        name: &str,
        languages: &[String],
    ) -> Result<Option<EmailTemplate>> {
        for language in languages {
            if let Some(tpl) = get_template(&self.pool, name, language).await? {
                return Ok(Some(tpl));
            }
        }
        Ok(None)
    }

    /// Create a letter from the first matching template and queue it.
    /// Returns `false` when no language has the template.
    pub async fn queue_templated(
        &self,
        name: &str,
        languages: &[String],
        recipient: &str,
        account_id: Option<&str>,
        context: Value,
    ) -> Result<bool> {
        let Some(tpl) = self.find_template(name, languages).await? else {
            debug!(template = name, ?languages, "no template for any language");
            return Ok(false);
        };

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO letters (id, account_id, template_name, language, recipient,
                                 context_json, is_sent, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&id)
        .bind(account_id)
        .bind(&tpl.name)
        .bind(&tpl.language)
        .bind(recipient)
        .bind(context.to_string())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        self.queue.enqueue(Task::SendLetter(id))?;
        Ok(true)
    }

    pub async fn upsert_template(&self, input: TemplateInput) -> Result<EmailTemplate> {
        let name = input.name.trim();
        let language = input.language.trim();
        if name.is_empty() || language.is_empty() {
            return Err(validation("Template name and language are required"));
        }
        if input.subject.trim().is_empty() {
            return Err(validation("Template subject is required"));
        }

        sqlx::query(
            r#"
            INSERT INTO email_templates (id, name, language, subject, html_content,
                                         text_content, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name, language) DO UPDATE SET
                subject = excluded.subject,
                html_content = excluded.html_content,
                text_content = excluded.text_content,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(name)
        .bind(language)
        .bind(&input.subject)
        .bind(&input.html_content)
        .bind(&input.text_content)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        get_template(&self.pool, name, language)
            .await?
            .ok_or_else(|| not_found("Template", name))
    }

    pub async fn list_for_account(&self, account_id: &str) -> Result<Vec<Letter>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM letters WHERE account_id = ? ORDER BY created_at DESC",
            LETTER_COLUMNS
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(letter_from_row).collect())
    }

    /// Queue an unsent letter owned by `account_id` again.
    pub async fn resend(&self, account_id: &str, letter_id: &str) -> Result<Letter> {
        let letter = get_letter(&self.pool, letter_id)
            .await?
            .ok_or_else(|| not_found("Letter", letter_id))?;
        if letter.account_id.as_deref() != Some(account_id) {
            return Err(permission_denied("You do not have access to this letter."));
        }
        if letter.is_sent {
            return Err(validation("Letter has already been sent."));
        }
        self.queue.enqueue(Task::SendLetter(letter.id.clone()))?;
        Ok(letter)
    }
}

#[async_trait]
impl Mailer for Letters {
    async fn storage_warning(
        &self,
        account: &Account,
        usage: u64,
        limit: u64,
        level: WarningLevel,
    ) -> Result<bool> {
        let context = json!({
            "username": account.username,
            "used_storage": quota::format_mb(usage),
            "storage_limit": quota::format_mb(limit),
            "percentage": format!("{}%", quota::whole_percent(usage, limit)),
            "dashboard_url": format!("{}/dashboard", self.frontend_url),
        });
        self.queue_templated(
            &level.template_name(),
            &self.search_order(&account.language),
            &account.email,
            Some(&account.id),
            context,
        )
        .await
    }
}
