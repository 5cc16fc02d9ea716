pub mod agents;
pub mod config;
pub mod execution;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod sqlite;
