//! API request handlers

pub mod execute;
pub mod health;
pub mod tasks;
pub mod terminal;
pub mod vm;
