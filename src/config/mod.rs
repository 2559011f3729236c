use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize, Serializer};

use crate::core::{DEFAULT_OUTPUT_FORMAT, DEFAULT_PROJECT_NAME};
use crate::update::{DEFAULT_RELEASE_BASE_URL, DEFAULT_VERSION_URL};

#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub tool: ToolConfig,
    pub scan: ScanSettings,
    pub update: UpdateConfig,
    pub ui: UiConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSettings {
    pub project_name: String,
    pub output_format: String,
    pub skip_self_update: bool,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_masked"
    )]
    pub nvd_api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateConfig {
    pub version_url: String,
    pub release_base_url: String,
    pub http_timeout_secs: u64,
    pub download_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UiConfig {
    pub color: bool,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            tool: ToolConfig { install_dir: None },
            scan: ScanSettings {
                project_name: DEFAULT_PROJECT_NAME.to_string(),
                output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
                skip_self_update: true,
                nvd_api_key: None,
            },
            update: UpdateConfig {
                version_url: DEFAULT_VERSION_URL.to_string(),
                release_base_url: DEFAULT_RELEASE_BASE_URL.to_string(),
                http_timeout_secs: 30,
                download_timeout_secs: 3600,
            },
            ui: UiConfig { color: true },
            config_path: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    tool: Option<RawToolConfig>,
    scan: Option<RawScanSettings>,
    update: Option<RawUpdateConfig>,
    ui: Option<RawUiConfig>,
}

#[derive(Debug, Deserialize)]
struct RawToolConfig {
    install_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawScanSettings {
    project_name: Option<String>,
    output_format: Option<String>,
    skip_self_update: Option<bool>,
    nvd_api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUpdateConfig {
    version_url: Option<String>,
    release_base_url: Option<String>,
    http_timeout_secs: Option<u64>,
    download_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawUiConfig {
    color: Option<bool>,
}

fn serialize_masked<S: Serializer>(value: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(_) => s.serialize_str("***"),
        None => s.serialize_none(),
    }
}

pub fn config_dir(home_dir: &Path) -> PathBuf {
    home_dir.join(".config/depcheck-runner")
}

pub fn default_config_path(home_dir: &Path) -> PathBuf {
    config_dir(home_dir).join("config.toml")
}

pub fn load(config_path: Option<&Path>, home_dir: &Path) -> Result<EffectiveConfig> {
    let mut cfg = EffectiveConfig::default();

    let path = config_path
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| default_config_path(home_dir));

    if path.exists() {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let raw: RawConfig = toml::from_str(&s)
            .with_context(|| format!("failed to parse config file (TOML): {}", path.display()))?;
        apply_raw_config(&mut cfg, raw);
        cfg.config_path = Some(path.display().to_string());
    } else if config_path.is_some() {
        anyhow::bail!("config file not found: {}", path.display());
    }

    apply_env_overrides(&mut cfg)?;

    Ok(cfg)
}

fn apply_raw_config(cfg: &mut EffectiveConfig, raw: RawConfig) {
    if let Some(tool) = raw.tool {
        if let Some(install_dir) = tool.install_dir {
            cfg.tool.install_dir = Some(install_dir);
        }
    }

    if let Some(scan) = raw.scan {
        if let Some(project_name) = scan.project_name {
            cfg.scan.project_name = project_name;
        }
        if let Some(output_format) = scan.output_format {
            cfg.scan.output_format = output_format;
        }
        if let Some(skip_self_update) = scan.skip_self_update {
            cfg.scan.skip_self_update = skip_self_update;
        }
        if let Some(key) = scan.nvd_api_key {
            cfg.scan.nvd_api_key = non_empty(&key);
        }
    }

    if let Some(update) = raw.update {
        if let Some(version_url) = update.version_url {
            cfg.update.version_url = version_url;
        }
        if let Some(release_base_url) = update.release_base_url {
            cfg.update.release_base_url = release_base_url;
        }
        if let Some(secs) = update.http_timeout_secs {
            cfg.update.http_timeout_secs = secs;
        }
        if let Some(secs) = update.download_timeout_secs {
            cfg.update.download_timeout_secs = secs;
        }
    }

    if let Some(ui) = raw.ui {
        if let Some(color) = ui.color {
            cfg.ui.color = color;
        }
    }
}

fn apply_env_overrides(cfg: &mut EffectiveConfig) -> Result<()> {
    apply_overrides_from(cfg, |name| std::env::var(name).ok())
}

fn apply_overrides_from(
    cfg: &mut EffectiveConfig,
    var: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(v) = var("DEPCHECK_INSTALL_DIR") {
        if let Some(v) = non_empty(&v) {
            cfg.tool.install_dir = Some(PathBuf::from(v));
        }
    }
    if let Some(v) = var("DEPCHECK_PROJECT_NAME") {
        if let Some(v) = non_empty(&v) {
            cfg.scan.project_name = v;
        }
    }
    if let Some(v) = var("DEPCHECK_OUTPUT_FORMAT") {
        if let Some(v) = non_empty(&v) {
            cfg.scan.output_format = v;
        }
    }
    if let Some(v) = var("DEPCHECK_SKIP_SELF_UPDATE") {
        cfg.scan.skip_self_update = parse_bool(&v).context("DEPCHECK_SKIP_SELF_UPDATE")?;
    }
    if let Some(v) = var("DEPCHECK_NVD_API_KEY") {
        cfg.scan.nvd_api_key = non_empty(&v);
    }
    if let Some(v) = var("DEPCHECK_VERSION_URL") {
        if let Some(v) = non_empty(&v) {
            cfg.update.version_url = v;
        }
    }
    if let Some(v) = var("DEPCHECK_RELEASE_BASE_URL") {
        if let Some(v) = non_empty(&v) {
            cfg.update.release_base_url = v;
        }
    }
    if let Some(v) = var("DEPCHECK_HTTP_TIMEOUT_SECS") {
        cfg.update.http_timeout_secs = v
            .trim()
            .parse::<u64>()
            .context("DEPCHECK_HTTP_TIMEOUT_SECS")?;
    }
    if let Some(v) = var("DEPCHECK_DOWNLOAD_TIMEOUT_SECS") {
        cfg.update.download_timeout_secs = v
            .trim()
            .parse::<u64>()
            .context("DEPCHECK_DOWNLOAD_TIMEOUT_SECS")?;
    }
    if let Some(v) = var("DEPCHECK_UI_COLOR") {
        cfg.ui.color = parse_bool(&v).context("DEPCHECK_UI_COLOR")?;
    }

    Ok(())
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn parse_bool(s: &str) -> Result<bool> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow::anyhow!(
            "invalid boolean: {s} (expected true|false|1|0|yes|no|on|off)"
        )),
    }
}
