//! Token wallet core
//!
//! Append-only token ledger with a materialized balance cache, two-phase
//! hold/capture/void authorizations, an idempotency guard for client retries
//! and a purchase pipeline that turns provider webhooks into ledger credits.
//!
//! # Architecture
//!
//! - **Ledger first**: balances are derived from immutable ledger rows; the
//!   cache is updated in the same transaction as every posting
//! - **Store trait**: Postgres in production, an in-memory store for tests
//! - **Exactly once**: idempotency keys for clients, event ids for providers,
//!   resource keys for units of work
//!
//! # Invariants
//!
//! - Cache balances equal the signed sum of ledger rows per token type
//! - No balance ever goes negative
//! - A hold is captured at most once; a purchase is credited at most once
//! - Receipt numbers are unique and increase within a year

#![warn(missing_docs, rust_2018_idioms)]

pub mod authorization;
pub mod config;
pub mod error;
pub mod gateway;
pub mod idempotency;
pub mod ledger;
pub mod metrics;
pub mod purchase;
pub mod receipt;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod wallet;
pub mod webhook;

// Re-exports
pub use config::WalletConfig;
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use store::{MemoryStore, PgStore, WalletStore};
pub use types::{
    Authorization, AuthorizationStatus, BalanceCache, EntryReason, Feature, LedgerEntry,
    Provider, Purchase, PurchaseStatus, Receipt, RequestContext, TokenType, UserId,
};
pub use wallet::Wallet;
