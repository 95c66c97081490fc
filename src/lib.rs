//! Core engine for a regional ZIS (zakat, infaq, sedekah) body: a reference
//! catalog, muzakki/mustahiq registries with derived aggregates, receipt and
//! disbursement ledgers with exact amil allocation, an audit trail and a
//! resumable bulk-import pipeline for legacy spreadsheets.
//!
//! Every public operation takes an explicit database path and opens its own
//! connection; state lives in SQLite, never in the process.

pub mod allocation;
pub mod audit_log;
pub mod bulk_import;
pub mod catalog;
pub mod error;
pub mod ledger_db;
pub mod ledger_mutations;
pub mod party_registry;
pub mod statistics;

pub use error::{CoreError, CoreResult};
