//! Model provisioning: download required model files before the first job.
//!
//! Files already present and passing validation are left alone. Downloads
//! stream into `<path>.part`, are validated, then renamed into place, so an
//! interrupted download never leaves a truncated model under its real name.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use avagen_core::clock::Clock;
use avagen_core::hashing::{digest_matches, StreamingDigest};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// One required model file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub url: String,
    /// Destination relative to the ComfyUI directory.
    pub path: PathBuf,
    #[serde(default)]
    pub min_size_bytes: Option<u64>,
    /// Expected SHA-256 as hex.
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Google Drive file holding the avatar LoRA.
const AVATAR_LORA_DRIVE_ID: &str = "1rH5E5DxUx4AcSoL4sUC550oEsVG6xNDY";

/// SDXL base checkpoint, VAE and the avatar LoRA the built-in graph loads.
pub fn builtin_manifest() -> Vec<ModelSpec> {
    vec![
        ModelSpec {
            name: "SDXL Base 1.0".into(),
            url: "https://huggingface.co/stabilityai/stable-diffusion-xl-base-1.0/resolve/main/sd_xl_base_1.0.safetensors".into(),
            path: PathBuf::from("models/checkpoints/sd_xl_base_1.0.safetensors"),
            min_size_bytes: Some(1024 * 1024 * 1024),
            sha256: None,
        },
        ModelSpec {
            name: "SDXL VAE".into(),
            url: "https://huggingface.co/stabilityai/sdxl-vae/resolve/main/sdxl_vae.safetensors".into(),
            path: PathBuf::from("models/vae/sdxl_vae.safetensors"),
            min_size_bytes: Some(1024 * 1024),
            sha256: None,
        },
        ModelSpec {
            name: "Avatar LoRA".into(),
            url: format!("https://drive.google.com/uc?export=download&id={AVATAR_LORA_DRIVE_ID}"),
            path: PathBuf::from("models/loras/avatar_lora.safetensors"),
            // Rejects the HTML interstitial Drive serves instead of the file.
            min_size_bytes: Some(1024 * 1024),
            sha256: None,
        },
    ]
}

/// Read a JSON manifest (an array of [`ModelSpec`]).
pub async fn load_manifest(path: &Path) -> Result<Vec<ModelSpec>, ProvisionError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ProvisionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_str(&text)
        .map_err(|e| ProvisionError::Manifest(format!("{}: {e}", path.display())))
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Invalid model manifest: {0}")]
    Manifest(String),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Download of {url} returned {status}")]
    Status { url: String, status: u16 },

    #[error("Download stalled for {}s", .0.as_secs())]
    Stalled(Duration),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Downloaded file failed validation: {0}")]
    Validation(String),

    #[error(
        "Required model {name} is missing at {}: download failed after {attempts} attempts: {last}",
        .path.display()
    )]
    Exhausted {
        name: String,
        path: PathBuf,
        attempts: u32,
        last: String,
    },
}

/// Retry and timeout tuning for downloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionConfig {
    pub attempts: u32,
    pub retry_delay: Duration,
    /// Applied to connecting and to every body read.
    pub request_timeout: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// What a provisioning run did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    pub present: Vec<String>,
    pub downloaded: Vec<String>,
}

/// Downloads the model files a template needs.
pub struct ModelProvisioner {
    client: reqwest::Client,
    root: PathBuf,
    manifest: Vec<ModelSpec>,
    config: ProvisionConfig,
    clock: Arc<dyn Clock>,
}

impl ModelProvisioner {
    pub fn new(root: impl Into<PathBuf>, manifest: Vec<ModelSpec>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client: reqwest::Client::new(),
            root: root.into(),
            manifest,
            config: ProvisionConfig::default(),
            clock,
        }
    }

    pub fn with_config(mut self, config: ProvisionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn manifest(&self) -> &[ModelSpec] {
        &self.manifest
    }

    /// Make every manifest entry present, downloading what is missing.
    ///
    /// Stops at the first model that cannot be provisioned.
    pub async fn provision_all(&self) -> Result<ProvisionReport, ProvisionError> {
        let mut report = ProvisionReport::default();
        for spec in &self.manifest {
            let dest = self.root.join(&spec.path);
            if self.is_present(spec, &dest).await? {
                tracing::info!(model = %spec.name, path = %dest.display(), "Model already present");
                report.present.push(spec.name.clone());
                continue;
            }
            self.download_with_retry(spec, &dest).await?;
            report.downloaded.push(spec.name.clone());
        }
        Ok(report)
    }

    async fn is_present(&self, spec: &ModelSpec, dest: &Path) -> Result<bool, ProvisionError> {
        let size = match tokio::fs::metadata(dest).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(source) => {
                return Err(ProvisionError::Io {
                    path: dest.to_path_buf(),
                    source,
                })
            }
        };
        if size == 0 || spec.min_size_bytes.is_some_and(|min| size < min) {
            tracing::warn!(model = %spec.name, size, "Existing model file is too small, re-downloading");
            return Ok(false);
        }
        if let Some(expected) = &spec.sha256 {
            let actual = hash_file(dest).await?;
            if !digest_matches(&actual, expected) {
                tracing::warn!(model = %spec.name, "Existing model file has wrong checksum, re-downloading");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn download_with_retry(&self, spec: &ModelSpec, dest: &Path) -> Result<(), ProvisionError> {
        let attempts = self.config.attempts.max(1);
        let part = part_path(dest);
        let mut last = String::new();

        for attempt in 1..=attempts {
            tracing::info!(model = %spec.name, url = %spec.url, attempt, attempts, "Downloading model");
            match self.download_once(spec, &part).await {
                Ok(bytes) => {
                    tokio::fs::rename(&part, dest)
                        .await
                        .map_err(|source| ProvisionError::Io {
                            path: dest.to_path_buf(),
                            source,
                        })?;
                    tracing::info!(model = %spec.name, bytes, path = %dest.display(), "Model downloaded");
                    return Ok(());
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(&part).await;
                    tracing::warn!(model = %spec.name, attempt, error = %e, "Model download failed");
                    last = e.to_string();
                    if attempt < attempts {
                        self.clock.sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        Err(ProvisionError::Exhausted {
            name: spec.name.clone(),
            path: dest.to_path_buf(),
            attempts,
            last,
        })
    }

    /// Stream one download into `part` and validate it. Returns its size.
    async fn download_once(&self, spec: &ModelSpec, part: &Path) -> Result<u64, ProvisionError> {
        let timeout = self.config.request_timeout;
        let io_err = |source: std::io::Error| ProvisionError::Io {
            path: part.to_path_buf(),
            source,
        };

        let response = tokio::time::timeout(timeout, self.client.get(&spec.url).send())
            .await
            .map_err(|_| ProvisionError::Stalled(timeout))??;
        if !response.status().is_success() {
            return Err(ProvisionError::Status {
                url: spec.url.clone(),
                status: response.status().as_u16(),
            });
        }
        let expected_len = response.content_length();

        if let Some(parent) = part.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = tokio::fs::File::create(part).await.map_err(io_err)?;
        let mut digest = StreamingDigest::new();
        let mut response = response;

        loop {
            let chunk = tokio::time::timeout(timeout, response.chunk())
                .await
                .map_err(|_| ProvisionError::Stalled(timeout))??;
            let Some(chunk) = chunk else { break };
            file.write_all(&chunk).await.map_err(io_err)?;
            digest.update(&chunk);
        }
        file.flush().await.map_err(io_err)?;
        drop(file);

        let size = digest.len();
        if size == 0 {
            return Err(ProvisionError::Validation("empty download".into()));
        }
        if let Some(expected) = expected_len.filter(|len| *len != size) {
            return Err(ProvisionError::Validation(format!(
                "expected {expected} bytes, received {size}"
            )));
        }
        if let Some(min) = spec.min_size_bytes.filter(|min| size < *min) {
            return Err(ProvisionError::Validation(format!(
                "{size} bytes is below the minimum of {min}"
            )));
        }
        if let Some(expected) = &spec.sha256 {
            let actual = digest.finish_hex();
            if !digest_matches(&actual, expected) {
                return Err(ProvisionError::Validation(format!(
                    "sha256 mismatch: expected {expected}, got {actual}"
                )));
            }
        }
        Ok(size)
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

async fn hash_file(path: &Path) -> Result<String, ProvisionError> {
    let io_err = |source: std::io::Error| ProvisionError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::File::open(path).await.map_err(io_err)?;
    let mut digest = StreamingDigest::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(io_err)?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(digest.finish_hex())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use avagen_core::clock::ManualClock;
    use avagen_core::hashing::sha256_hex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn spec(server: &MockServer, name: &str) -> ModelSpec {
        ModelSpec {
            name: name.into(),
            url: format!("{}/models/{name}", server.uri()),
            path: PathBuf::from(format!("models/checkpoints/{name}")),
            min_size_bytes: None,
            sha256: None,
        }
    }

    #[tokio::test]
    async fn downloads_missing_model_and_skips_present_one() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models/base.safetensors"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
            .expect(1)
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let present = spec(&server, "vae.safetensors");
        let present_path = root.path().join(&present.path);
        tokio::fs::create_dir_all(present_path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&present_path, b"already here").await.unwrap();

        let mut wanted = spec(&server, "base.safetensors");
        wanted.sha256 = Some(sha256_hex(&[7u8; 4096]));
        let provisioner =
            ModelProvisioner::new(root.path(), vec![wanted.clone(), present], Arc::new(ManualClock::new()));

        let report = provisioner.provision_all().await.unwrap();

        assert_eq!(report.downloaded, ["base.safetensors"]);
        assert_eq!(report.present, ["vae.safetensors"]);
        let written = tokio::fs::read(root.path().join(&wanted.path)).await.unwrap();
        assert_eq!(written.len(), 4096);
        assert!(!part_path(&root.path().join(&wanted.path)).exists());
    }

    #[tokio::test]
    async fn failing_download_is_retried_then_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models/base.safetensors"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new());
        let provisioner =
            ModelProvisioner::new(root.path(), vec![spec(&server, "base.safetensors")], clock.clone());

        let err = provisioner.provision_all().await.unwrap_err();

        assert_matches!(err, ProvisionError::Exhausted { attempts: 3, .. });
        // Two pauses between three attempts.
        assert_eq!(clock.now(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn undersized_download_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models/base.safetensors"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 10]))
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let mut model = spec(&server, "base.safetensors");
        model.min_size_bytes = Some(1_000);
        let dest = root.path().join(&model.path);
        let provisioner = ModelProvisioner::new(root.path(), vec![model], Arc::new(ManualClock::new()))
            .with_config(ProvisionConfig {
                attempts: 1,
                ..Default::default()
            });

        let err = provisioner.provision_all().await.unwrap_err();

        assert_matches!(err, ProvisionError::Exhausted { ref last, .. } if last.contains("minimum"));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    /// A LoRA that cannot be fetched fails provisioning with an error naming
    /// the missing file.
    #[tokio::test]
    async fn unreachable_lora_reports_missing_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/uc"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let lora = builtin_manifest()
            .into_iter()
            .find(|m| m.path.ends_with("avatar_lora.safetensors"))
            .map(|m| ModelSpec {
                url: format!("{}/uc?id={AVATAR_LORA_DRIVE_ID}", server.uri()),
                ..m
            })
            .unwrap();
        let provisioner = ModelProvisioner::new(root.path(), vec![lora], Arc::new(ManualClock::new()))
            .with_config(ProvisionConfig {
                attempts: 1,
                ..Default::default()
            });

        let err = provisioner.provision_all().await.unwrap_err();

        assert_matches!(err, ProvisionError::Exhausted { ref name, .. } if name == "Avatar LoRA");
        let message = err.to_string();
        assert!(message.contains("missing"), "{message}");
        assert!(message.contains("avatar_lora.safetensors"), "{message}");
    }

    /// Every model file the built-in graph loads is in the built-in manifest.
    #[test]
    fn builtin_manifest_covers_builtin_graph() {
        let wire = avagen_core::graph::JobGraph::builtin().to_wire();
        let manifest_files: Vec<String> = builtin_manifest()
            .iter()
            .filter_map(|m| m.path.file_name().map(|f| f.to_string_lossy().into_owned()))
            .collect();

        let mut referenced = Vec::new();
        for node in wire.as_object().unwrap().values() {
            for key in ["ckpt_name", "vae_name", "lora_name"] {
                if let Some(file) = node["inputs"][key].as_str() {
                    referenced.push(file.to_string());
                }
            }
        }

        assert_eq!(referenced.len(), 3);
        for file in referenced {
            assert!(manifest_files.contains(&file), "{file} not provisioned");
        }
    }

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/m/vae.safetensors")),
            PathBuf::from("/m/vae.safetensors.part")
        );
    }

    #[test]
    fn manifest_parses_optional_fields() {
        let manifest: Vec<ModelSpec> = serde_json::from_str(
            r#"[{"name": "LoRA", "url": "https://example.com/l.safetensors", "path": "models/loras/avatar_lora.safetensors"}]"#,
        )
        .unwrap();
        assert_eq!(manifest[0].min_size_bytes, None);
        assert_eq!(manifest[0].path, PathBuf::from("models/loras/avatar_lora.safetensors"));
    }
}
