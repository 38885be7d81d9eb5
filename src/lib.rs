pub mod app;
pub mod config;
pub mod error;
pub mod handlers;
pub mod request;
pub mod structured;
pub mod upstream;
