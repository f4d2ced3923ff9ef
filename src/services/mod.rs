//! Upload pipeline services, leaves first: chunk store, cleanup, assembly,
//! URL signing, and the `UploadService` façade over all of them.

pub mod assembly;
pub mod chunk_store;
pub mod cleanup;
pub mod signing;
pub mod upload_service;
