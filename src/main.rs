//! # Handout Desk CLI (`hdk`)
//!
//! ## Usage
//!
//! ```bash
//! hdk --config ./config/hdk.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `hdk init` | Create the SQLite database, tables and built-in templates |
//! | `hdk serve` | Start the HTTP API and the mail worker |
//! | `hdk account create` | Create an active, verified account |
//! | `hdk account set-tier <username> <tier>` | Change an account's plan |
//! | `hdk usage <username>` | Show stored and recomputed storage usage |
//! | `hdk template add` | Create or replace a localized email template |
//! | `hdk outline <handout-id>` | Print a handout's sections in reading order |
//! | `hdk export <handout-id> --output <file>` | Render a handout to PDF or HTML |
//! | `hdk completions <shell>` | Print shell completions |
//!
//! Letters queued by CLI commands are delivered the next time `hdk serve`
//! starts.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use tracing_subscriber::EnvFilter;

use handout_desk::config;
use handout_desk::db;
use handout_desk::export;
use handout_desk::letters::TemplateInput;
use handout_desk::migrate;
use handout_desk::queue::TaskQueue;
use handout_desk::render;
use handout_desk::server::{self, AppState};
use handout_desk_core::error::not_found;
use handout_desk_core::models::Role;
use handout_desk_core::quota::{self, Tier};
use handout_desk_core::store::Store;

/// Handout Desk: handouts with nested sections, storage quotas, localized
/// notifications and PDF export.
#[derive(Parser)]
#[command(name = "hdk", version, about = "Handout Desk, a handout CMS backend")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/hdk.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and seed the built-in templates.
    ///
    /// Idempotent: running it again changes nothing.
    Init,

    /// Start the HTTP API server.
    Serve,

    /// Manage accounts.
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },

    /// Show an account's storage usage against its limit.
    Usage { username: String },

    /// Manage email templates.
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },

    /// Print a handout's sections in reading order.
    Outline { handout_id: String },

    /// Render a handout to a file.
    ///
    /// PDF exports update the handout's recorded size and the owner's usage.
    Export {
        handout_id: String,
        #[arg(long, short)]
        output: PathBuf,
        #[arg(long, value_enum, default_value = "pdf")]
        format: ExportFormat,
    },

    /// Print shell completions to stdout.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum AccountAction {
    /// Create an active, verified account.
    Create {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long, value_parser = ["trial", "free", "pro", "enterprise"], default_value = "trial")]
        tier: String,
        /// Grant the admin role.
        #[arg(long)]
        admin: bool,
    },
    /// Change an account's tier.
    SetTier {
        username: String,
        #[arg(value_parser = ["trial", "free", "pro", "enterprise"])]
        tier: String,
    },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// Create or replace the template for (name, language).
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        language: String,
        #[arg(long)]
        subject: String,
        /// File holding the HTML body.
        #[arg(long)]
        html: PathBuf,
        /// File holding the plain-text body.
        #[arg(long)]
        text: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Pdf,
    Html,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        generate(shell, &mut command, name, &mut std::io::stdout());
        return Ok(());
    }

    init_tracing();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        command => {
            let pool = db::connect(&cfg).await?;
            // Keep the receiver so queued letters stay pending for the
            // server's worker instead of failing to enqueue.
            let (queue, _pending) = TaskQueue::channel();
            let state = AppState::build(&cfg, pool.clone(), queue);
            run_command(&state, command).await?;
            pool.close().await;
        }
    }

    Ok(())
}

async fn run_command(state: &AppState, command: Commands) -> Result<()> {
    match command {
        Commands::Account { action } => match action {
            AccountAction::Create {
                username,
                email,
                password,
                tier,
                admin,
            } => {
                let role = if admin { Role::Admin } else { Role::Editor };
                let account = state
                    .accounts
                    .create_account(&username, &email, &password, role, Tier::parse(&tier))
                    .await?;
                println!(
                    "Created account {} ({}, {}, {})",
                    account.username,
                    account.id,
                    account.role.as_str(),
                    account.tier.as_str()
                );
            }
            AccountAction::SetTier { username, tier } => {
                let account = state.accounts.set_tier(&username, Tier::parse(&tier)).await?;
                println!(
                    "{} is now on the {} tier (limit {})",
                    account.username,
                    account.tier.as_str(),
                    quota::format_mb(account.tier.storage_limit())
                );
            }
        },
        Commands::Usage { username } => {
            let account = state
                .accounts
                .find_by_login(&username)
                .await?
                .ok_or_else(|| not_found("Account", &username))?;
            let breakdown = state.content.store().usage_breakdown(&account.id).await?;
            let report = state.content.usage_report(&account.id).await?;
            println!("Account:    {} ({})", account.username, account.tier.as_str());
            println!("Stored:     {} bytes", report.usage);
            println!(
                "Computed:   {} bytes ({} document, {} section)",
                breakdown.total(),
                breakdown.document_bytes,
                breakdown.section_chars
            );
            println!("Limit:      {} bytes", report.limit);
            println!("Remaining:  {} bytes", report.remaining);
            println!("Used:       {:.1}%", report.percentage);
            println!(
                "Warning:    {}",
                account.last_storage_warning_level.percent()
            );
        }
        Commands::Template { action } => match action {
            TemplateAction::Add {
                name,
                language,
                subject,
                html,
                text,
            } => {
                let html_content = std::fs::read_to_string(&html)
                    .with_context(|| format!("Failed to read {}", html.display()))?;
                let text_content = match text {
                    Some(path) => Some(
                        std::fs::read_to_string(&path)
                            .with_context(|| format!("Failed to read {}", path.display()))?,
                    ),
                    None => None,
                };
                let tpl = state
                    .letters
                    .upsert_template(TemplateInput {
                        name,
                        language,
                        subject,
                        html_content,
                        text_content,
                    })
                    .await?;
                println!("Saved template {} ({})", tpl.name, tpl.language);
            }
        },
        Commands::Outline { handout_id } => {
            let handout = state
                .content
                .store()
                .get_handout(&handout_id)
                .await?
                .ok_or_else(|| not_found("Handout", &handout_id))?;
            let sections = state.content.outline(&handout.owner_id, &handout.id).await?;
            println!("{}", handout.title);
            if sections.is_empty() {
                println!("  (no sections)");
            }
            for s in sections {
                println!(
                    "{}{} [{}] {}",
                    "  ".repeat(s.level.depth() + 1),
                    s.order,
                    s.id,
                    s.title
                );
            }
        }
        Commands::Export {
            handout_id,
            output,
            format,
        } => {
            let handout = state
                .content
                .store()
                .get_handout(&handout_id)
                .await?
                .ok_or_else(|| not_found("Handout", &handout_id))?;
            let bytes = match format {
                ExportFormat::Pdf => state.exporter.pdf_for(&handout).await?.bytes,
                ExportFormat::Html => {
                    let sections = state.content.outline(&handout.owner_id, &handout.id).await?;
                    let stylesheet =
                        render::load_stylesheet(state.config.export.stylesheet.as_deref());
                    export::handout_html(&handout, &sections, &state.config.export, &stylesheet)
                        .into_bytes()
                }
            };
            std::fs::write(&output, &bytes)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Wrote {} ({} bytes)", output.display(), bytes.len());
        }
        Commands::Init | Commands::Serve | Commands::Completions { .. } => {}
    }
    Ok(())
}
