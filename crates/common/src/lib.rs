//! Shared configuration, error and domain types for the Herald workspace.

pub mod config;
pub mod db;
pub mod error;
pub mod time;
pub mod types;
