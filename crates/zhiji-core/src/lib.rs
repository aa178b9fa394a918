pub mod chat_log;
pub mod config;
pub mod crisis;
pub mod embedding;
pub mod emotion;
pub mod error;
pub mod events;
pub mod graph;
pub mod inquiry;
pub mod intent;
pub mod json;
pub mod llm;
pub mod model;
pub mod mood;
pub mod pattern;
pub mod plan;
pub mod rag;
pub mod report;
pub mod retry;
pub mod search;
pub mod storage;
