pub mod chat;
pub mod connection;
pub mod contact;
pub mod events;
pub mod message;
