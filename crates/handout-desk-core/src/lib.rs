//! # Handout Desk Core
//!
//! Storage-agnostic logic for Handout Desk: data models, quota accounting,
//! the section hierarchy, storage-warning rules, render styling, the store
//! abstraction and the content service that ties them together.
//!
//! This crate contains no sqlx, HTTP or filesystem I/O. The SQLite store,
//! the mail queue and the HTTP/CLI surfaces live in the `handout-desk` crate.

pub mod error;
pub mod hierarchy;
pub mod markup;
pub mod models;
pub mod notify;
pub mod otp;
pub mod quota;
pub mod service;
pub mod store;
pub mod style;
pub mod template;

pub use error::DeskError;
