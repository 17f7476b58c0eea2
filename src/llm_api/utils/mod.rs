pub mod msg_structure;
pub mod tool_structure;
pub mod client;
