//! HTTP route handlers.
//!
//! [`jobs`] is the internal API and sits behind
//! [`crate::auth::require_api_key`]. The browser-facing handlers in [`web`]
//! and [`vnc`] authenticate with session tokens resolved through the
//! session cache.

pub mod health;
pub mod jobs;
pub mod vnc;
pub mod web;
