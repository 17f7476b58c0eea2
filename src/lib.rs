pub mod config;
pub mod engine;
pub mod llm_api;
pub mod logger;
pub mod tools;
pub mod web;
