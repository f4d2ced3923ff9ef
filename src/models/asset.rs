//! The asset descriptor returned by every upload strategy.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarse media category derived from a MIME type.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Image,
    Video,
    Audio,
    Pdf,
    Other,
}

impl AssetType {
    pub fn from_content_type(content_type: &str) -> Self {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.split_once('/') {
            Some(("image", _)) => Self::Image,
            Some(("video", _)) => Self::Video,
            Some(("audio", _)) => Self::Audio,
            Some(("application", "pdf")) => Self::Pdf,
            _ => Self::Other,
        }
    }
}

/// `{id, src, type, fileName}`: what feature code persists.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: Uuid,
    pub src: String,
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    pub file_name: String,
}

impl Asset {
    pub fn new(id: Uuid, base_url: &str, file_name: impl Into<String>, content_type: &str) -> Self {
        Self {
            id,
            src: asset_url(base_url, id),
            asset_type: AssetType::from_content_type(content_type),
            file_name: file_name.into(),
        }
    }
}

pub fn asset_key(id: Uuid) -> String {
    id.to_string()
}

/// Public URL an asset is served from.
pub fn asset_url(base_url: &str, id: Uuid) -> String {
    format!("{}/files/{}", base_url.trim_end_matches('/'), id)
}
