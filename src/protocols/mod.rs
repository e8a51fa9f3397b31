pub mod canonical;
pub mod chat;
pub mod responses;
