//! Harvests YouTube video, channel and comment metadata into SQLite.

pub mod config;
pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod pool;
pub mod shell;
pub mod validate;
pub mod youtube;

#[cfg(test)]
mod testing;
