pub mod chat_handler;
pub mod health_handler;
