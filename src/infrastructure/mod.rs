pub mod change_feed;
pub mod config;
pub mod error;
pub mod memory_store;
pub mod postgrest_feed;
pub mod postgrest_store;
pub mod record_mapper;
pub mod sqlite_store;
pub mod storage;
pub mod trip_store;
