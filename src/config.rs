use crate::{
    errors::{LocalizeError, LocalizeResult},
    models::remote_ref::RemoteRef,
    services::accessor::StoreBackend,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// Options a host framework passes to the plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginOptions {
    /// `false`/absent/empty disables localization, `true` picks a directory
    /// under the system temp dir, anything else is the cache root.
    #[serde(default)]
    pub gcs_cache: Option<CacheSetting>,
    /// Service account or authorized-user credentials file; ambient
    /// credentials are used when unset.
    #[serde(default)]
    pub gcs_credentials: Option<PathBuf>,
    #[serde(default = "default_loglevel")]
    pub gcs_loglevel: String,
    #[serde(default)]
    pub gcs_mtime_tolerance_ms: u64,
    /// `gcs` (default), `memory` or `dir:<root>`.
    #[serde(default)]
    pub gcs_store: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheSetting {
    Toggle(bool),
    Path(PathBuf),
}

fn default_loglevel() -> String {
    "info".into()
}

impl Default for PluginOptions {
    fn default() -> Self {
        Self {
            gcs_cache: None,
            gcs_credentials: None,
            gcs_loglevel: default_loglevel(),
            gcs_mtime_tolerance_ms: 0,
            gcs_store: None,
        }
    }
}

impl PluginOptions {
    pub fn from_json(json: &str) -> LocalizeResult<Self> {
        serde_json::from_str(json)
            .map_err(|err| LocalizeError::Configuration(format!("invalid plugin options: {err}")))
    }

    /// Cache root for a pipeline whose working directory is `workdir`, or
    /// `None` when localization is disabled.
    pub fn resolve_cache_root(&self, workdir: &Path) -> LocalizeResult<Option<PathBuf>> {
        match &self.gcs_cache {
            None | Some(CacheSetting::Toggle(false)) => Ok(None),
            Some(CacheSetting::Toggle(true)) => Ok(Some(auto_cache_root(workdir))),
            Some(CacheSetting::Path(path)) if path.as_os_str().is_empty() => Ok(None),
            Some(CacheSetting::Path(path)) => {
                if RemoteRef::is_remote(&path.to_string_lossy()) {
                    return Err(LocalizeError::Configuration(format!(
                        "gcs_cache must be a local directory, got {}",
                        path.display()
                    )));
                }
                Ok(Some(path.clone()))
            }
        }
    }

    pub fn backend(&self) -> LocalizeResult<StoreBackend> {
        let backend: StoreBackend = self.gcs_store.as_deref().unwrap_or("gcs").parse()?;
        Ok(match backend {
            StoreBackend::Gcs { .. } => StoreBackend::Gcs {
                credentials: self.gcs_credentials.clone(),
            },
            other => other,
        })
    }

    pub fn mtime_tolerance(&self) -> Duration {
        Duration::from_millis(self.gcs_mtime_tolerance_ms)
    }
}

/// `<tmp>/gs-localize-<first 8 hex digits of md5(workdir)>`, stable per
/// working directory.
fn auto_cache_root(workdir: &Path) -> PathBuf {
    let digest = format!("{:x}", md5::compute(workdir.to_string_lossy().as_bytes()));
    env::temp_dir().join(format!("gs-localize-{}", &digest[..8]))
}

/// `true`/`false` toggles, empty disables, anything else is a path.
fn parse_cache_setting(value: &str) -> Option<CacheSetting> {
    match value.trim() {
        "" => None,
        "true" | "1" | "yes" => Some(CacheSetting::Toggle(true)),
        "false" | "0" | "no" => Some(CacheSetting::Toggle(false)),
        path => Some(CacheSetting::Path(PathBuf::from(path))),
    }
}

/// Centralized application configuration.
/// Combines an optional options file, environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub options: PluginOptions,
    pub workdir: PathBuf,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Transparent gs:// localization for pipeline units")]
pub struct Args {
    /// Cache root, `true` for an automatic one, `false` to disable (overrides GS_LOCALIZE_CACHE)
    #[arg(long, global = true)]
    pub cache: Option<String>,

    /// GCS credentials file, service account or authorized user (overrides GS_LOCALIZE_CREDENTIALS)
    #[arg(long, global = true)]
    pub credentials: Option<PathBuf>,

    /// Storage backend: gcs, memory or dir:<root> (overrides GS_LOCALIZE_STORE)
    #[arg(long, global = true)]
    pub store: Option<String>,

    /// Log level when RUST_LOG is unset (overrides GS_LOCALIZE_LOGLEVEL)
    #[arg(long, global = true)]
    pub loglevel: Option<String>,

    /// Remote mtime must exceed the cached one by more than this to count as newer
    #[arg(long, global = true)]
    pub mtime_tolerance_ms: Option<u64>,

    /// JSON file with plugin options; flags and env override its values
    #[arg(long, global = true)]
    pub options: Option<PathBuf>,

    /// Working directory the automatic cache root is derived from
    #[arg(long, global = true)]
    pub workdir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print size and mtime of an object or prefix
    Stat { uri: String },
    /// Localize an object (or a prefix ending with `/`) and print its local path
    Localize { uri: String },
    /// Upload a local file or directory
    Upload { local: PathBuf, uri: String },
    /// Run a command as one unit of work with localized inputs and outputs
    Run(RunArgs),
}

#[derive(clap::Args, Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    /// Unit name used in logs and errors
    #[arg(long, default_value = "unit")]
    pub name: String,

    /// Plain value passed through untouched
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_binding)]
    pub vars: Vec<(String, String)>,

    #[arg(long = "input", value_name = "NAME=PATH", value_parser = parse_binding)]
    pub inputs: Vec<(String, String)>,

    #[arg(long = "input-dir", value_name = "NAME=PATH", value_parser = parse_binding)]
    pub input_dirs: Vec<(String, String)>,

    #[arg(long = "output", value_name = "NAME=PATH", value_parser = parse_binding)]
    pub outputs: Vec<(String, String)>,

    #[arg(long = "output-dir", value_name = "NAME=PATH", value_parser = parse_binding)]
    pub output_dirs: Vec<(String, String)>,

    /// Program and its arguments
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

fn parse_binding(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, path)) if !name.is_empty() => Ok((name.to_string(), path.to_string())),
        _ => Err(format!("expected NAME=VALUE, got `{value}`")),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command to run.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        // Parse CLI once
        let args = Args::parse();
        let cfg = Self::merge(&args, |key| env::var(key).ok())?;
        Ok((cfg, args.command))
    }

    /// Flags win over env, env over the options file, the file over defaults.
    pub fn merge(args: &Args, env_var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // --- Options file ---
        let mut options = match &args.options {
            Some(path) => {
                let json = fs::read_to_string(path)
                    .with_context(|| format!("reading options file {}", path.display()))?;
                PluginOptions::from_json(&json)
                    .with_context(|| format!("parsing options file {}", path.display()))?
            }
            None => PluginOptions::default(),
        };

        // --- Environment fallback ---
        if let Some(value) = env_var("GS_LOCALIZE_CACHE") {
            options.gcs_cache = parse_cache_setting(&value);
        }
        // GOOGLE_APPLICATION_CREDENTIALS is left to the GCS client's own discovery
        if let Some(value) = env_var("GS_LOCALIZE_CREDENTIALS") {
            options.gcs_credentials = Some(PathBuf::from(value));
        }
        if let Some(value) = env_var("GS_LOCALIZE_STORE") {
            options.gcs_store = Some(value);
        }
        if let Some(value) = env_var("GS_LOCALIZE_LOGLEVEL") {
            options.gcs_loglevel = value;
        }
        if let Some(value) = env_var("GS_LOCALIZE_MTIME_TOLERANCE_MS") {
            options.gcs_mtime_tolerance_ms = value.parse().with_context(|| {
                format!("parsing GS_LOCALIZE_MTIME_TOLERANCE_MS value `{}`", value)
            })?;
        }

        // --- Merge ---
        if let Some(value) = &args.cache {
            options.gcs_cache = parse_cache_setting(value);
        }
        if let Some(path) = &args.credentials {
            options.gcs_credentials = Some(path.clone());
        }
        if let Some(store) = &args.store {
            options.gcs_store = Some(store.clone());
        }
        if let Some(level) = &args.loglevel {
            options.gcs_loglevel = level.clone();
        }
        if let Some(ms) = args.mtime_tolerance_ms {
            options.gcs_mtime_tolerance_ms = ms;
        }

        let workdir = match &args.workdir {
            Some(dir) => dir.clone(),
            None => env::current_dir().context("reading current directory")?,
        };

        Ok(Self { options, workdir })
    }
}
