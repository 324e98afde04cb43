pub mod campaign_repository;
pub mod config;
pub mod database;
pub mod record_repository;

pub use campaign_repository::{CampaignRepository, CampaignRow};
pub use config::DatabaseConfig;
pub use database::Database;
pub use record_repository::{RecordFilter, RecordRepository, StoredRecord};
