pub mod auth;
pub mod client;
pub mod message;
pub mod parser;
pub mod remote;
pub mod stream;
