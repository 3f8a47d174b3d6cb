pub mod app;
pub mod archive;
pub mod cell_types;
pub mod classify;
pub mod config;
pub mod detector;
pub mod domain;
pub mod error;
pub mod geo;
pub mod h5;
pub mod matcher;
pub mod orchestrator;
pub mod output;
pub mod pool;
pub mod retry;
pub mod store;
pub mod summary;
pub mod transfer;
