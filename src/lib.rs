//! Shared availability voting for trips: calendar grids, pointer gestures,
//! vote aggregation and an optimistic synchronization engine against a
//! remote trip store.

pub mod application;
pub mod domain;
pub mod infrastructure;
