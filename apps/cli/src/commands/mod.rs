//! Command implementations for tibok-ext.

pub mod catalog;
pub mod keys;
pub mod list;
pub mod manage;
pub mod prompt;
pub mod state;
pub mod system;
