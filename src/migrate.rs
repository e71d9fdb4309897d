use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index, then seed the built-in English templates.
/// Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            first_name TEXT NOT NULL DEFAULT '',
            last_name TEXT NOT NULL DEFAULT '',
            role TEXT NOT NULL DEFAULT 'editor',
            tier TEXT NOT NULL DEFAULT 'trial',
            language TEXT NOT NULL DEFAULT 'zh_TW',
            is_active INTEGER NOT NULL DEFAULT 0,
            is_verified INTEGER NOT NULL DEFAULT 0,
            current_storage_usage INTEGER NOT NULL DEFAULT 0,
            last_storage_warning_level INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            token TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            FOREIGN KEY (account_id) REFERENCES accounts(id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS email_verification_tokens (
            token TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            is_used INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (account_id) REFERENCES accounts(id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS password_reset_tokens (
            token TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            otp TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            is_used INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (account_id) REFERENCES accounts(id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (owner_id) REFERENCES accounts(id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS folders (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            parent_id TEXT,
            name TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (project_id) REFERENCES projects(id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS handouts (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            folder_id TEXT,
            title TEXT NOT NULL,
            subtitle TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            style_json TEXT NOT NULL DEFAULT '{}',
            is_published INTEGER NOT NULL DEFAULT 0,
            file_size INTEGER,
            last_exported_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (project_id) REFERENCES projects(id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS sections (
            id TEXT PRIMARY KEY,
            handout_id TEXT NOT NULL,
            parent_id TEXT,
            level TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            sort_order INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (handout_id) REFERENCES handouts(id) ON DELETE CASCADE,
            FOREIGN KEY (parent_id) REFERENCES sections(id) ON DELETE CASCADE
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS email_templates (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            language TEXT NOT NULL,
            subject TEXT NOT NULL,
            html_content TEXT NOT NULL,
            text_content TEXT,
            updated_at INTEGER NOT NULL,
            UNIQUE(name, language)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS letters (
            id TEXT PRIMARY KEY,
            account_id TEXT,
            template_name TEXT NOT NULL,
            language TEXT NOT NULL,
            recipient TEXT NOT NULL,
            context_json TEXT NOT NULL DEFAULT '{}',
            subject TEXT,
            content TEXT,
            is_sent INTEGER NOT NULL DEFAULT 0,
            sent_at INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS project_tags (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            name TEXT NOT NULL,
            color TEXT NOT NULL DEFAULT '#88C0D0',
            created_at INTEGER NOT NULL,
            UNIQUE (owner_id, name),
            FOREIGN KEY (owner_id) REFERENCES accounts(id) ON DELETE CASCADE
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS project_tag_links (
            project_id TEXT NOT NULL,
            tag_id TEXT NOT NULL,
            PRIMARY KEY (project_id, tag_id),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
            FOREIGN KEY (tag_id) REFERENCES project_tags(id) ON DELETE CASCADE
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS attachments (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            file_name TEXT NOT NULL,
            path TEXT NOT NULL,
            caption TEXT NOT NULL DEFAULT '',
            alt_text TEXT NOT NULL DEFAULT '',
            file_size INTEGER NOT NULL,
            mime_type TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (owner_id) REFERENCES accounts(id) ON DELETE CASCADE
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_attachments_owner ON attachments(owner_id, created_at)",
        // one sequence number per sibling group; root sections share the '' parent
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sections_sibling_order \
         ON sections(handout_id, COALESCE(parent_id, ''), sort_order)",
        "CREATE INDEX IF NOT EXISTS idx_handouts_project ON handouts(project_id)",
        "CREATE INDEX IF NOT EXISTS idx_folders_project ON folders(project_id)",
        "CREATE INDEX IF NOT EXISTS idx_projects_owner ON projects(owner_id)",
        "CREATE INDEX IF NOT EXISTS idx_sessions_account ON sessions(account_id)",
        "CREATE INDEX IF NOT EXISTS idx_letters_unsent ON letters(is_sent, created_at)",
    ];

    for sql in statements {
        sqlx::query(sql).execute(pool).await?;
    }

    seed_templates(pool).await?;
    Ok(())
}

const BUILTIN_TEMPLATES: [(&str, &str, &str, &str); 4] = [
    (
        "email_verification",
        "Verify your Handout Desk account",
        "<p>Hi {{ username }},</p><p>Confirm your email address by opening <a href=\"{{ verification_url }}\">this link</a>.</p>",
        "Hi {{ username }},\n\nConfirm your email address: {{ verification_url }}\n",
    ),
    (
        "password_reset",
        "Reset your Handout Desk password",
        "<p>Hi {{ username }},</p><p>Your one-time code is <strong>{{ otp }}</strong>.</p><p>Reset your password <a href=\"{{ reset_url }}\">here</a> within {{ expiry_minutes }} minutes.</p>",
        "Hi {{ username }},\n\nYour one-time code is {{ otp }}.\nReset your password within {{ expiry_minutes }} minutes: {{ reset_url }}\n",
    ),
    (
        "storage_warning_75",
        "You have used {{ percentage }} of your storage",
        "<p>Hi {{ username }},</p><p>You are using {{ used_storage }} of {{ storage_limit }} ({{ percentage }}).</p><p><a href=\"{{ dashboard_url }}\">Review your handouts</a></p>",
        "Hi {{ username }},\n\nYou are using {{ used_storage }} of {{ storage_limit }} ({{ percentage }}).\n{{ dashboard_url }}\n",
    ),
    (
        "storage_warning_90",
        "Your storage is almost full ({{ percentage }})",
        "<p>Hi {{ username }},</p><p>You are using {{ used_storage }} of {{ storage_limit }} ({{ percentage }}). New content will be blocked once the limit is reached.</p><p><a href=\"{{ dashboard_url }}\">Free up space</a></p>",
        "Hi {{ username }},\n\nYou are using {{ used_storage }} of {{ storage_limit }} ({{ percentage }}).\nNew content will be blocked once the limit is reached.\n{{ dashboard_url }}\n",
    ),
];

/// Insert the English templates unless an administrator already provided
/// them.
async fn seed_templates(pool: &SqlitePool) -> Result<()> {
    let now = Utc::now().timestamp();
    for (name, subject, html, text) in BUILTIN_TEMPLATES {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO email_templates
                (id, name, language, subject, html_content, text_content, updated_at)
            VALUES (?, ?, 'en', ?, ?, ?, ?)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(name)
        .bind(subject)
        .bind(html)
        .bind(text)
        .bind(now)
        .execute(pool)
        .await?;
    }
    Ok(())
}
