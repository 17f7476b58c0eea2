//! # HTTP 接入层
//!
//! 把编排器暴露为 REST + SSE 接口

pub mod dto;
pub mod handlers;
pub mod middleware;
pub mod server;

pub use server::WebServer;
