//! # Handout Desk
//!
//! A content-management backend for handouts: structured documents made of
//! nested sections, organized into projects and folders, with per-account
//! storage quotas, localized email notifications and PDF export.
//!
//! The storage-agnostic rules (quota, hierarchy, warning thresholds, render
//! styling, the content service) live in `handout-desk-core`. This crate
//! adds the SQLite store, accounts, the mail queue, rendering and the
//! HTTP/CLI surfaces.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────┐   ┌──────────┐
//! │ HTTP/CLI │──▶│ ContentService │──▶│  SQLite  │
//! └──────────┘   │  quota + tree  │   └──────────┘
//!                └───────┬────────┘
//!                        │ storage warnings
//!                        ▼
//!                ┌────────────────┐   ┌───────────┐
//!                │    Letters     │──▶│ TaskQueue │──▶ Transport
//!                └────────────────┘   └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations and built-in templates |
//! | [`sqlite_store`] | SQLite implementation of the core `Store` |
//! | [`accounts`] | Registration, verification, sessions, passwords |
//! | [`letters`] | Email templates and letters |
//! | [`queue`] | Background task queue and mail transports |
//! | [`projects`] | Projects, folders and tags |
//! | [`attachments`] | Uploaded files and the upload quota gate |
//! | [`render`] | HTML rendering |
//! | [`pdf`] | PDF layout |
//! | [`export`] | PDF, HTML and project ZIP exports |
//! | [`server`] | HTTP API |

pub mod accounts;
pub mod attachments;
pub mod config;
pub mod db;
pub mod export;
pub mod letters;
pub mod migrate;
pub mod pdf;
pub mod projects;
pub mod queue;
pub mod render;
pub mod server;
pub mod sqlite_store;
