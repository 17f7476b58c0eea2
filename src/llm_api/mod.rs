pub mod openai;
pub mod provider;
pub mod utils;
