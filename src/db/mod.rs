//! Database module: row models and SQL repositories.
//!
//! - `model`: insert payloads and row views returned by repositories.
//! - `repo`: SQL-only functions that map rows into domain entities.
//!
//! External modules should import from `shopsched::db` — the repository API
//! and row models are re-exported here.

pub mod model;
pub mod repo;

pub use model::{CredentialRow, NewJob};
pub use repo::*;
