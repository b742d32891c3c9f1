pub mod config;
pub mod downloader;
pub mod error;
pub mod metadata;
pub mod parser;
pub mod progress;
pub mod query;
pub mod registry;
pub mod types;
