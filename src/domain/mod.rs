pub mod calendar;
pub mod gesture;
pub mod holidays;
pub mod models;
pub mod vote_set;
