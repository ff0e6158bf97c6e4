//! Text-to-image visualization of a detected exoplanet.
//!
//! Images are cached on disk under a name derived from the request parameters;
//! an existing file is returned without contacting the image service.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::ImageConfig;
use crate::features::coerce_f64;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid image service URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to generate image: {0}")]
    Status(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialized into the `visualization` field of a prediction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Visualization {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn param(data: &Map<String, Value>, key: &str, default: f64) -> f64 {
    data.get(key).and_then(coerce_f64).unwrap_or(default)
}

/// Describe the planet for the image model from its radius, equilibrium
/// temperature and host-star temperature.
pub fn describe_planet(data: &Map<String, Value>) -> String {
    let radius = param(data, "pl_rade", 1.0);
    let temp = param(data, "pl_eqt", 255.0);
    let star_temp = param(data, "st_teff", 5772.0);

    let size = match radius {
        r if r < 0.5 => "small rocky",
        r if r < 2.0 => "Earth-like",
        r if r < 5.0 => "super-Earth",
        _ => "gas giant",
    };
    let climate = match temp {
        t if t < 200.0 => "frozen ice world",
        t if t < 300.0 => "temperate world with possible oceans",
        t if t < 500.0 => "hot rocky world",
        _ => "scorching hot world with molten surface",
    };
    let star = match star_temp {
        t if t < 3500.0 => "orbiting a red dwarf star",
        t if t < 5000.0 => "under an orange sun",
        t if t < 6000.0 => "under a yellow sun",
        _ => "under a bright blue star",
    };

    format!(
        "realistic space art of a {} {} {}, high detail, cosmic, beautiful lighting, trending on artstation",
        size, climate, star
    )
}

/// Stable file name for a parameter set, independent of key order.
pub fn image_file_name(data: &Map<String, Value>) -> String {
    let sorted: BTreeMap<&String, &Value> = data.iter().collect();
    let canonical = serde_json::to_string(&sorted).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("exoplanet_{}.jpg", &hex::encode(digest)[..16])
}

#[derive(Debug, Clone)]
pub struct ImageGenerator {
    client: Client,
    base_url: String,
    output_dir: PathBuf,
}

impl ImageGenerator {
    pub fn new(config: &ImageConfig) -> Result<Self, ImageError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            output_dir: config.output_dir.clone(),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn prompt_url(&self, prompt: &str) -> Result<Url, ImageError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| ImageError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ImageError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .push("p")
            .push(prompt);
        Ok(url)
    }

    /// Fetch (or reuse) an image for `data`. Returns the path of the file.
    pub async fn generate_image(&self, data: &Map<String, Value>) -> Result<(PathBuf, String), ImageError> {
        let prompt = describe_planet(data);
        let path = self.output_dir.join(image_file_name(data));

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!(path = %path.display(), "Reusing cached visualization");
            return Ok((path, prompt));
        }

        tokio::fs::create_dir_all(&self.output_dir).await?;

        let url = self.prompt_url(&prompt)?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "Image service returned an error");
            return Err(ImageError::Status(status.as_u16()));
        }

        let bytes = response.bytes().await?;
        tokio::fs::write(&path, &bytes).await?;
        tracing::info!(path = %path.display(), bytes = bytes.len(), "Saved visualization");
        Ok((path, prompt))
    }

    /// Like [`generate_image`](Self::generate_image) but folds errors into the record.
    pub async fn visualize(&self, data: &Map<String, Value>) -> Visualization {
        match self.generate_image(data).await {
            Ok((path, prompt)) => Visualization {
                success: true,
                image_path: Some(path.display().to_string()),
                prompt: Some(prompt),
                error: None,
            },
            Err(e) => Visualization {
                success: false,
                image_path: None,
                prompt: None,
                error: Some(e.to_string()),
            },
        }
    }
}
