pub mod aggregator;
pub mod bootstrap;
pub mod commands;
pub mod destination;
pub mod echo;
pub mod engine;
pub mod error;
pub mod pending;
pub mod reconcile;
pub mod summary;
