//! Axum HTTP server and routing.
//!
//! # Responsibilities
//! - Define the Axum router with all routes and shared middleware.
//! - Map request headers onto execution contexts ([`contexts::ContextTable`]).
//! - Run facade calls on Tokio's blocking pool and render their errors.

pub mod contexts;
pub mod error;
pub mod handlers;
pub mod router;
pub mod state;
