pub mod error;
pub mod files;
pub mod models;
pub mod settings;
