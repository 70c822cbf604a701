use serde::Deserialize;
use std::path::PathBuf;

/// Settings of the outer fuzzing loop driving the core.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
    #[serde(default = "default_rng_seed")]
    pub rng_seed: u64,
}

pub fn default_max_iterations() -> u64 {
    1_000_000
}
pub fn default_rng_seed() -> u64 {
    0
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            rng_seed: default_rng_seed(),
        }
    }
}

/// Settings of the feature collection pipeline.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FeatureSettings {
    /// Bitmask selecting which user domains are live; bit `i` enables
    /// user slot `i`.
    #[serde(default = "default_user_domain_mask")]
    pub user_domain_mask: u64,
    /// Upper bound on features shipped to the engine per input.
    #[serde(default = "default_max_features_per_batch")]
    pub max_features_per_batch: usize,
}

pub fn default_user_domain_mask() -> u64 {
    u64::MAX
}
pub fn default_max_features_per_batch() -> usize {
    1024
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            user_domain_mask: default_user_domain_mask(),
            max_features_per_batch: default_max_features_per_batch(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SpoorConfig {
    pub engine: Option<EngineSettings>,
    pub features: Option<FeatureSettings>,
}

impl SpoorConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: SpoorConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}

impl Default for SpoorConfig {
    fn default() -> Self {
        Self {
            engine: Some(EngineSettings::default()),
            features: Some(FeatureSettings::default()),
        }
    }
}
