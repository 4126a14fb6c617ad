//! Caller-supplied job parameters and their validated, defaulted form.
//!
//! [`JobRequest`] mirrors the flat input object a caller sends: every field
//! is optional and unknown keys are ignored. [`JobRequest::resolve`] turns
//! it into [`JobSettings`], applying the documented defaults and clamping
//! numeric values into their safe ranges. Values that cannot be clamped
//! meaningfully (non-positive step counts, NaN guidance, unknown output
//! formats) are rejected with [`BuildError::InvalidField`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BuildError;

// ---------------------------------------------------------------------------
// Defaults and bounds
// ---------------------------------------------------------------------------

pub const DEFAULT_POSITIVE_PROMPT: &str =
    "avachar, professional photo, high quality, detailed face, 8k uhd";
pub const DEFAULT_NEGATIVE_PROMPT: &str =
    "ugly, deformed, blurry, low quality, noise, watermark, text";

pub const DEFAULT_STEPS: u32 = 25;
pub const MAX_STEPS: u32 = 150;

pub const DEFAULT_CFG_SCALE: f64 = 7.5;
pub const MIN_CFG_SCALE: f64 = 1.0;
pub const MAX_CFG_SCALE: f64 = 30.0;

pub const DEFAULT_SAMPLER: &str = "dpmpp_2m_sde";
pub const DEFAULT_SCHEDULER: &str = "karras";

pub const DEFAULT_DIMENSION: u32 = 1024;
pub const MIN_DIMENSION: u32 = 256;
pub const MAX_DIMENSION: u32 = 2048;
/// Latent space works in 8-pixel blocks; dimensions are snapped down to it.
pub const DIMENSION_STEP: u32 = 8;

pub const DEFAULT_LORA_STRENGTH: f64 = 0.85;
pub const MIN_LORA_STRENGTH: f64 = 0.0;
pub const MAX_LORA_STRENGTH: f64 = 2.0;

pub const DEFAULT_NUM_IMAGES: u32 = 1;
pub const MAX_NUM_IMAGES: u32 = 4;

pub const DEFAULT_QUALITY: u8 = 95;
pub const MIN_QUALITY: u8 = 1;
pub const MAX_QUALITY: u8 = 100;

pub const MAX_PROMPT_CHARS: usize = 10_000;
const MAX_IDENTIFIER_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Output format
// ---------------------------------------------------------------------------

/// Encoded format of a delivered image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    #[serde(rename = "jpg", alias = "jpeg")]
    Jpeg,
    #[serde(rename = "png")]
    Png,
    #[serde(rename = "webp")]
    Webp,
}

impl OutputFormat {
    /// Parse a caller-supplied format name (`jpg`, `jpeg`, `png`, `webp`).
    pub fn parse(value: &str) -> Result<Self, BuildError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::Webp),
            other => Err(BuildError::invalid(
                "output_format",
                format!("'{other}' is not supported; use 'jpg', 'png', or 'webp'"),
            )),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
        }
    }

    /// Upper-case label used in output metadata.
    pub fn label(self) -> &'static str {
        match self {
            Self::Jpeg => "JPEG",
            Self::Png => "PNG",
            Self::Webp => "WEBP",
        }
    }

    pub fn supports_alpha(self) -> bool {
        !matches!(self, Self::Jpeg)
    }

    /// Whether `quality` affects the encoded bytes. WebP is written lossless.
    pub fn is_lossy(self) -> bool {
        matches!(self, Self::Jpeg)
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

// ---------------------------------------------------------------------------
// Numeric input
// ---------------------------------------------------------------------------

/// A numeric field exactly as the caller sent it: any JSON number or a
/// numeric string. [`JobRequest::resolve`] interprets it, so a value of
/// the wrong shape fails that one field instead of the whole request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NumericInput(Value);

impl NumericInput {
    fn as_f64(&self) -> Option<f64> {
        match &self.0 {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Integer value; integral floats such as `10.0` are accepted.
    fn as_whole(&self) -> Option<i128> {
        match &self.0 {
            Value::Number(n) => n
                .as_i64()
                .map(i128::from)
                .or_else(|| n.as_u64().map(i128::from))
                .or_else(|| n.as_f64().and_then(integral)),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i128>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(integral))
            }
            _ => None,
        }
    }
}

fn integral(v: f64) -> Option<i128> {
    (v.is_finite() && v.fract() == 0.0).then_some(v as i128)
}

impl From<i64> for NumericInput {
    fn from(v: i64) -> Self {
        Self(Value::from(v))
    }
}

impl From<f64> for NumericInput {
    fn from(v: f64) -> Self {
        Self(Value::from(v))
    }
}

impl From<&str> for NumericInput {
    fn from(v: &str) -> Self {
        Self(Value::from(v))
    }
}

// ---------------------------------------------------------------------------
// Request and settings
// ---------------------------------------------------------------------------

/// Job parameters as supplied by the caller. All fields optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRequest {
    pub positive_prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub steps: Option<NumericInput>,
    #[serde(alias = "guidance")]
    pub cfg_scale: Option<NumericInput>,
    #[serde(alias = "sampler")]
    pub sampler_name: Option<String>,
    pub scheduler: Option<String>,
    pub width: Option<NumericInput>,
    pub height: Option<NumericInput>,
    /// `-1` (or any negative value) requests a random seed.
    pub seed: Option<NumericInput>,
    pub lora_strength: Option<NumericInput>,
    pub num_images: Option<NumericInput>,
    pub output_format: Option<String>,
    pub output_quality: Option<NumericInput>,
    #[serde(alias = "save_to_dsk")]
    pub save_to_disk: Option<bool>,
    pub return_base64: Option<bool>,
    pub return_metadata: Option<bool>,
}

/// Fully resolved job parameters: defaults applied, values in range.
///
/// Serializes with the key names reported back to callers, so the output
/// settings appear as `format` and `quality`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSettings {
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub cfg_scale: f64,
    pub sampler_name: String,
    pub scheduler: String,
    pub width: u32,
    pub height: u32,
    pub seed: u64,
    pub lora_strength: f64,
    pub num_images: u32,
    #[serde(rename = "format")]
    pub output_format: OutputFormat,
    #[serde(rename = "quality")]
    pub output_quality: u8,
    pub save_to_disk: bool,
    pub return_base64: bool,
    pub return_metadata: bool,
}

impl JobRequest {
    /// Validate every field and produce the settings a job runs with.
    ///
    /// An absent or negative seed is replaced by a random one, so two
    /// resolutions of the same seedless request differ only in `seed`.
    pub fn resolve(&self) -> Result<JobSettings, BuildError> {
        let positive_prompt = resolve_prompt(
            "positive_prompt",
            self.positive_prompt.as_deref(),
            DEFAULT_POSITIVE_PROMPT,
        )?;
        if positive_prompt.trim().is_empty() {
            return Err(BuildError::invalid("positive_prompt", "must not be empty"));
        }
        let negative_prompt = resolve_prompt(
            "negative_prompt",
            self.negative_prompt.as_deref(),
            DEFAULT_NEGATIVE_PROMPT,
        )?;

        let steps = match whole_field("steps", self.steps.as_ref())? {
            None => DEFAULT_STEPS,
            Some(s) if s <= 0 => {
                return Err(BuildError::invalid("steps", format!("must be positive, got {s}")))
            }
            Some(s) => s.min(i128::from(MAX_STEPS)) as u32,
        };

        let cfg_scale = resolve_float(
            "cfg_scale",
            self.cfg_scale.as_ref(),
            DEFAULT_CFG_SCALE,
            MIN_CFG_SCALE,
            MAX_CFG_SCALE,
        )?;
        let lora_strength = resolve_float(
            "lora_strength",
            self.lora_strength.as_ref(),
            DEFAULT_LORA_STRENGTH,
            MIN_LORA_STRENGTH,
            MAX_LORA_STRENGTH,
        )?;

        let width = resolve_dimension("width", self.width.as_ref())?;
        let height = resolve_dimension("height", self.height.as_ref())?;

        let num_images = match whole_field("num_images", self.num_images.as_ref())? {
            None => DEFAULT_NUM_IMAGES,
            Some(n) if n <= 0 => {
                return Err(BuildError::invalid(
                    "num_images",
                    format!("must be positive, got {n}"),
                ))
            }
            Some(n) => n.min(i128::from(MAX_NUM_IMAGES)) as u32,
        };

        let sampler_name =
            resolve_identifier("sampler_name", self.sampler_name.as_deref(), DEFAULT_SAMPLER)?;
        let scheduler =
            resolve_identifier("scheduler", self.scheduler.as_deref(), DEFAULT_SCHEDULER)?;

        let seed = match whole_field("seed", self.seed.as_ref())? {
            Some(s) if s >= 0 => u64::try_from(s).map_err(|_| {
                BuildError::invalid("seed", format!("must be at most {}, got {s}", u64::MAX))
            })?,
            _ => u64::from(rand::random::<u32>()),
        };

        let output_format = match self.output_format.as_deref() {
            None => OutputFormat::Jpeg,
            Some(f) => OutputFormat::parse(f)?,
        };

        let output_quality = whole_field("output_quality", self.output_quality.as_ref())?
            .map(|q| q.clamp(i128::from(MIN_QUALITY), i128::from(MAX_QUALITY)) as u8)
            .unwrap_or(DEFAULT_QUALITY);

        Ok(JobSettings {
            positive_prompt,
            negative_prompt,
            steps,
            cfg_scale,
            sampler_name,
            scheduler,
            width,
            height,
            seed,
            lora_strength,
            num_images,
            output_format,
            output_quality,
            save_to_disk: self.save_to_disk.unwrap_or(true),
            return_base64: self.return_base64.unwrap_or(true),
            return_metadata: self.return_metadata.unwrap_or(true),
        })
    }
}

// ---- private helpers ----

fn resolve_prompt(
    field: &'static str,
    value: Option<&str>,
    default: &str,
) -> Result<String, BuildError> {
    let text = value.unwrap_or(default);
    let chars = text.chars().count();
    if chars > MAX_PROMPT_CHARS {
        return Err(BuildError::invalid(
            field,
            format!("must be at most {MAX_PROMPT_CHARS} characters, got {chars}"),
        ));
    }
    Ok(text.to_string())
}

fn whole_field(
    field: &'static str,
    value: Option<&NumericInput>,
) -> Result<Option<i128>, BuildError> {
    value
        .map(|raw| {
            raw.as_whole().ok_or_else(|| {
                BuildError::invalid(field, format!("expected a whole number, got {}", raw.0))
            })
        })
        .transpose()
}

fn resolve_float(
    field: &'static str,
    value: Option<&NumericInput>,
    default: f64,
    min: f64,
    max: f64,
) -> Result<f64, BuildError> {
    let value = value
        .map(|raw| {
            raw.as_f64()
                .ok_or_else(|| BuildError::invalid(field, format!("expected a number, got {}", raw.0)))
        })
        .transpose()?;
    match value {
        None => Ok(default),
        Some(v) if !v.is_finite() => Err(BuildError::invalid(field, "must be a finite number")),
        Some(v) => Ok(v.clamp(min, max)),
    }
}

fn resolve_dimension(field: &'static str, value: Option<&NumericInput>) -> Result<u32, BuildError> {
    match whole_field(field, value)? {
        None => Ok(DEFAULT_DIMENSION),
        Some(v) if v <= 0 => Err(BuildError::invalid(field, format!("must be positive, got {v}"))),
        Some(v) => {
            let clamped = v.clamp(i128::from(MIN_DIMENSION), i128::from(MAX_DIMENSION)) as u32;
            Ok(clamped - clamped % DIMENSION_STEP)
        }
    }
}

/// Sampler and scheduler names: alphanumeric plus `_`, `-` and `.`.
fn resolve_identifier(
    field: &'static str,
    value: Option<&str>,
    default: &str,
) -> Result<String, BuildError> {
    let name = value.map(str::trim).unwrap_or(default);
    let valid = !name.is_empty()
        && name.len() <= MAX_IDENTIFIER_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(name.to_string())
    } else {
        Err(BuildError::invalid(
            field,
            format!("'{name}' is not a valid identifier"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn request(json: serde_json::Value) -> JobRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn empty_request_uses_documented_defaults() {
        let settings = JobRequest::default().resolve().unwrap();
        assert_eq!(settings.positive_prompt, DEFAULT_POSITIVE_PROMPT);
        assert_eq!(settings.negative_prompt, DEFAULT_NEGATIVE_PROMPT);
        assert_eq!(settings.steps, 25);
        assert_eq!(settings.cfg_scale, 7.5);
        assert_eq!(settings.sampler_name, "dpmpp_2m_sde");
        assert_eq!(settings.scheduler, "karras");
        assert_eq!((settings.width, settings.height), (1024, 1024));
        assert_eq!(settings.lora_strength, 0.85);
        assert_eq!(settings.num_images, 1);
        assert_eq!(settings.output_format, OutputFormat::Jpeg);
        assert_eq!(settings.output_quality, 95);
        assert!(settings.save_to_disk);
        assert!(settings.return_base64);
        assert!(settings.return_metadata);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let req = request(serde_json::json!({"steps": 10, "favourite_colour": "teal"}));
        assert_eq!(req.steps, Some(10_i64.into()));
    }

    #[test]
    fn legacy_save_key_is_accepted() {
        let req = request(serde_json::json!({"save_to_dsk": false}));
        assert!(!req.resolve().unwrap().save_to_disk);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let settings = request(serde_json::json!({
            "steps": 5000,
            "cfg_scale": 99.0,
            "width": 10,
            "height": 9999,
            "lora_strength": -3.0,
            "output_quality": 250,
            "num_images": 12,
        }))
        .resolve()
        .unwrap();

        assert_eq!(settings.steps, MAX_STEPS);
        assert_eq!(settings.cfg_scale, MAX_CFG_SCALE);
        assert_eq!(settings.width, MIN_DIMENSION);
        assert_eq!(settings.height, MAX_DIMENSION);
        assert_eq!(settings.lora_strength, MIN_LORA_STRENGTH);
        assert_eq!(settings.output_quality, MAX_QUALITY);
        assert_eq!(settings.num_images, MAX_NUM_IMAGES);
    }

    #[test]
    fn clamping_is_deterministic() {
        let req = request(serde_json::json!({"steps": 400, "width": 1001, "seed": 7}));
        assert_eq!(req.resolve().unwrap(), req.resolve().unwrap());
    }

    #[test]
    fn dimensions_snap_to_multiple_of_eight() {
        let settings = request(serde_json::json!({"width": 1001, "height": 767}))
            .resolve()
            .unwrap();
        assert_eq!(settings.width, 1000);
        assert_eq!(settings.height, 760);
    }

    #[test]
    fn quality_below_range_is_clamped_to_one() {
        let settings = request(serde_json::json!({"output_quality": 0}))
            .resolve()
            .unwrap();
        assert_eq!(settings.output_quality, 1);
    }

    #[test]
    fn non_positive_steps_are_rejected() {
        for steps in [0, -4] {
            let err = request(serde_json::json!({ "steps": steps })).resolve().unwrap_err();
            assert_matches!(err, BuildError::InvalidField { field: "steps", .. });
        }
    }

    #[test]
    fn non_positive_dimension_is_rejected() {
        let err = request(serde_json::json!({"height": 0})).resolve().unwrap_err();
        assert_matches!(err, BuildError::InvalidField { field: "height", .. });
    }

    #[test]
    fn nan_guidance_is_rejected() {
        let req = JobRequest {
            cfg_scale: Some("NaN".into()),
            ..Default::default()
        };
        assert_matches!(
            req.resolve(),
            Err(BuildError::InvalidField { field: "cfg_scale", .. })
        );
    }

    #[test]
    fn guidance_alias_is_accepted() {
        let settings = request(serde_json::json!({"guidance": 4.0})).resolve().unwrap();
        assert_eq!(settings.cfg_scale, 4.0);
    }

    #[test]
    fn unknown_output_format_is_rejected() {
        let err = request(serde_json::json!({"output_format": "gif"}))
            .resolve()
            .unwrap_err();
        assert_matches!(err, BuildError::InvalidField { field: "output_format", .. });
    }

    #[test]
    fn output_format_parsing_is_case_insensitive() {
        assert_eq!(OutputFormat::parse("JPEG").unwrap(), OutputFormat::Jpeg);
        assert_eq!(OutputFormat::parse(" Png ").unwrap(), OutputFormat::Png);
        assert_eq!(OutputFormat::parse("webp").unwrap(), OutputFormat::Webp);
    }

    #[test]
    fn explicit_seed_is_kept_and_negative_seed_is_randomized() {
        let fixed = request(serde_json::json!({"seed": 1234})).resolve().unwrap();
        assert_eq!(fixed.seed, 1234);

        let random = request(serde_json::json!({"seed": -1})).resolve().unwrap();
        assert!(random.seed <= u64::from(u32::MAX));
    }

    #[test]
    fn whole_floats_and_numeric_strings_are_accepted() {
        let settings = request(serde_json::json!({
            "steps": 10.0,
            "width": "1024",
            "height": " 768 ",
            "cfg_scale": "6.5",
            "num_images": 2.0,
        }))
        .resolve()
        .unwrap();
        assert_eq!(settings.steps, 10);
        assert_eq!((settings.width, settings.height), (1024, 768));
        assert_eq!(settings.cfg_scale, 6.5);
        assert_eq!(settings.num_images, 2);
    }

    #[test]
    fn full_range_seed_is_kept() {
        let settings = request(serde_json::json!({ "seed": u64::MAX }))
            .resolve()
            .unwrap();
        assert_eq!(settings.seed, u64::MAX);
    }

    #[test]
    fn seed_beyond_u64_is_rejected() {
        let err = request(serde_json::json!({ "seed": "18446744073709551616" }))
            .resolve()
            .unwrap_err();
        assert_matches!(err, BuildError::InvalidField { field: "seed", .. });
    }

    #[test]
    fn unconvertible_numbers_fail_their_field() {
        for (field, value) in [
            ("steps", serde_json::json!(10.5)),
            ("width", serde_json::json!("wide")),
            ("output_quality", serde_json::json!(true)),
            ("lora_strength", serde_json::json!([0.5])),
        ] {
            let req = request(serde_json::json!({ field: value }));
            let err = req.resolve().unwrap_err();
            assert_matches!(err, BuildError::InvalidField { field: f, .. } if f == field);
        }
    }

    #[test]
    fn oversized_prompt_is_rejected() {
        let req = JobRequest {
            positive_prompt: Some("a".repeat(MAX_PROMPT_CHARS + 1)),
            ..Default::default()
        };
        assert_matches!(
            req.resolve(),
            Err(BuildError::InvalidField { field: "positive_prompt", .. })
        );
    }

    #[test]
    fn blank_positive_prompt_is_rejected() {
        let req = request(serde_json::json!({"positive_prompt": "   "}));
        assert_matches!(
            req.resolve(),
            Err(BuildError::InvalidField { field: "positive_prompt", .. })
        );
    }

    #[test]
    fn unsafe_sampler_name_is_rejected() {
        let req = request(serde_json::json!({"sampler_name": "euler; rm -rf /"}));
        assert_matches!(
            req.resolve(),
            Err(BuildError::InvalidField { field: "sampler_name", .. })
        );
    }

    #[test]
    fn output_format_metadata() {
        assert_eq!(OutputFormat::Jpeg.mime_type(), "image/jpeg");
        assert_eq!(OutputFormat::Webp.extension(), "webp");
        assert!(!OutputFormat::Jpeg.supports_alpha());
        assert!(OutputFormat::Png.supports_alpha());
        assert!(!OutputFormat::Png.is_lossy());
    }
}
