pub mod config;
pub mod generator;
pub mod llm;
pub mod source;
