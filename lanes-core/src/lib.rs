pub mod audit;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod order;
pub mod session;
pub mod storage;
pub mod types;

pub use engine::ReorderEngine;
