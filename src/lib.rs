pub mod app;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod import;
pub mod output;
pub mod reader;
pub mod store;
