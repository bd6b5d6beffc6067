pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod references;
pub mod rotation;
pub mod vocabulary;
