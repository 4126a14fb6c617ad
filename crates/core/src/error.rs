//! Error types for the pure job-preparation and conversion stages.

use crate::graph::NodeRole;

/// Invalid job parameters or a template the parameters cannot be applied to.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// A request field is outside what can be clamped into range.
    #[error("Invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    /// The template does not expose a node or input an override needs.
    #[error("Template mismatch for {role}: {detail}")]
    TemplateMismatch { role: NodeRole, detail: String },

    /// The template document itself could not be interpreted.
    #[error("Invalid template: {0}")]
    InvalidTemplate(String),
}

impl BuildError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn mismatch(role: NodeRole, detail: impl Into<String>) -> Self {
        Self::TemplateMismatch {
            role,
            detail: detail.into(),
        }
    }
}

/// Unsupported or corrupt image data, or an encoder failure.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// The raw artifact bytes were empty.
    #[error("Artifact is empty")]
    Empty,

    /// The raw bytes are not a decodable image.
    #[error("Failed to decode artifact: {0}")]
    Decode(#[source] image::ImageError),

    /// The target encoder rejected the pixel buffer.
    #[error("Failed to encode {format}: {source}")]
    Encode {
        format: &'static str,
        #[source]
        source: image::ImageError,
    },
}
