//! WhatsApp warmup orchestrator and health-scoring engine.

pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod plans;
pub mod sendapi;
pub mod store;
pub mod warmup;
