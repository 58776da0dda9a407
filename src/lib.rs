//! Credential lifecycle and scheduled-execution engine for a marketplace
//! seller dashboard: signs every partner API call, keeps per-shop OAuth
//! tokens fresh across long idle gaps, and executes time-triggered
//! flash-sale copy jobs from a durable queue with idempotent retries.

pub mod actions;
pub mod config;
pub mod credentials;
pub mod db;
pub mod executor;
pub mod marketplace;
pub mod model;
pub mod scheduler;
pub mod sign;
pub mod token;
