//! Data models for the upload pipeline.
//!
//! `asset` and `chunk` are the JSON shapes exchanged with clients; `object`
//! and `multipart` map to the local backend's SQLite tables via
//! `sqlx::FromRow`.

pub mod asset;
pub mod chunk;
pub mod multipart;
pub mod object;
