//! HTTP surface of the token wallet

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod services;

pub use config::Config;
pub use errors::{ApiError, Result};
