//! Chunked asset upload pipeline: client-side chunking with bounded retries,
//! server-side chunk storage, and reassembly into one durable object through
//! a multipart protocol.

pub mod client;
pub mod codec;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod retry;
pub mod routes;
pub mod services;
pub mod storage;
