//! Turning a finished job into the JSON payload returned to the caller.

use avagen_core::convert::ConvertedImage;
use avagen_core::request::JobSettings;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;

use crate::orchestrator::JobResult;

/// Successful job output.
#[derive(Debug, Clone, Serialize)]
pub struct JobPayload {
    pub status: &'static str,
    pub prompt_id: String,
    pub images: Vec<ImagePayload>,
    pub settings: SettingsPayload,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub saved_paths: Vec<String>,
}

/// One delivered image.
#[derive(Debug, Clone, Serialize)]
pub struct ImagePayload {
    pub filename: String,
    /// Standard base64 of the encoded bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_data_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ImageMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    /// Upper-case format label, e.g. `"JPEG"`.
    pub format: &'static str,
    pub mime_type: &'static str,
    pub size_bytes: usize,
    pub size_mb: f64,
    pub quality: u8,
}

/// Applied settings plus the number of images delivered.
#[derive(Debug, Clone, Serialize)]
pub struct SettingsPayload {
    #[serde(flatten)]
    pub settings: JobSettings,
    pub total_images: usize,
}

impl ImageMetadata {
    pub fn of(image: &ConvertedImage) -> Self {
        Self {
            width: image.width,
            height: image.height,
            format: image.format.label(),
            mime_type: image.mime_type,
            size_bytes: image.size_bytes,
            size_mb: image.size_mb(),
            quality: image.quality,
        }
    }
}

/// Build the caller-facing payload for a successful job.
pub fn build_payload(result: &JobResult) -> JobPayload {
    let settings = &result.settings;
    let images: Vec<ImagePayload> = result
        .images
        .iter()
        .map(|delivered| {
            let image = &delivered.image;
            let encoded = settings.return_base64.then(|| STANDARD.encode(&image.bytes));
            let image_data_url = encoded
                .as_ref()
                .map(|b64| format!("data:{};base64,{b64}", image.mime_type));
            ImagePayload {
                filename: delivered.filename.clone(),
                image: encoded,
                image_data_url,
                saved_path: image.saved_path.as_ref().map(|p| p.display().to_string()),
                metadata: settings.return_metadata.then(|| ImageMetadata::of(image)),
            }
        })
        .collect();

    JobPayload {
        status: "success",
        prompt_id: result.submission.id.clone(),
        saved_paths: images.iter().filter_map(|i| i.saved_path.clone()).collect(),
        settings: SettingsPayload {
            settings: settings.clone(),
            total_images: images.len(),
        },
        images,
    }
}
