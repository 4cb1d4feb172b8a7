// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Integration tests for the billing crate
//!
//! ## Test Coverage
//! - Full reader lifecycle through the public API (renewal, upgrade, payment
//!   failure, cancellation) against the in-memory collaborators
//! - Concurrent reconciliation and bulk re-sync
//! - Postgres store and ledger semantics (ignored unless a database is available)
//!
//! ## Running Tests
//! ```bash
//! cargo test -p sefer-billing --test integration
//! # Postgres-backed tests
//! export DATABASE_URL="postgres://localhost/sefer_test"
//! cargo test -p sefer-billing --test integration -- --ignored --test-threads=1
//! ```

mod common;
mod lifecycle;
mod postgres;
