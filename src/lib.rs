pub mod analytics;
pub mod api;
pub mod classifier;
pub mod config;
pub mod csv_ingest;
pub mod database;
pub mod governor;
pub mod membership;
pub mod models;
pub mod server;
pub mod snowball;
pub mod worker;

pub use classifier::{normalize_email, EmailClassifier, EmailVerdict};
pub use config::{load_config, Config};
pub use csv_ingest::{CsvValidationResult, CsvValidator};
pub use database::{create_db_pool, DbPool};
pub use governor::GrowthGovernor;
pub use membership::MembershipStore;
pub use models::{ForwardEvent, MemberState, Result, Transition};
pub use snowball::SnowballEngine;
