//! Orchestration engine for persona chat sessions: model resolution, prompt
//! composition, provider calls, per-call billing and rolling summaries.

pub mod billing;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod models;
pub mod persona;
pub mod prompt;
pub mod server;
pub mod session;
pub mod settings;
pub mod storage;
