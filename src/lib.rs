//! Client-side synchronization engine for a multi-tenant WhatsApp
//! customer-service console.
//!
//! The crate keeps a client's view of device connections, the chat roster
//! and per-chat message streams consistent with a server that emits both
//! push events and poll-able snapshots. Transport, persistence and UI are
//! external collaborators reached through the [`api::ConsoleApi`] trait.

pub mod api;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod reconcile;
pub mod resolver;
pub mod types;

pub mod test_utils;

pub use config::Config;
pub use engine::Engine;
pub use error::{ApiError, AuthWatch, RecoveryHint};
