mod campaign_tests;
mod common;
mod record_tests;
