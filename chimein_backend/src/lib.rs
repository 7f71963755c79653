pub mod config;
pub mod database;
pub mod discord;
pub mod engagement;
pub mod http_client;
pub mod llm_client;
pub mod retrieval;
pub mod runtime;
pub mod scheduler;
pub mod server;
