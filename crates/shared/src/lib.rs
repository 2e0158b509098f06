pub mod chat_id;
pub mod domain;
pub mod error;
pub mod protocol;
