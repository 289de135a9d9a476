//! Lifecycle hooks a pipeline framework calls around each unit of work.
//!
//! `before_unit` validates declared inputs and, with a cache root, swaps
//! remote references for fresh local copies. `prepare_outputs` maps remote
//! outputs to working paths under the cache root. `after_unit` pushes those
//! working paths back to their declared targets once the unit succeeded.
//! Without a cache root the hooks only validate: references stay remote and
//! `PathProxy` answers metadata queries against the store.

use crate::{
    config::PluginOptions,
    errors::{LocalizeError, LocalizeResult},
    models::binding::{InputBinding, InputValue, OutputBinding, OutputValue},
    services::{
        accessor::{ObjectAccessor, StoreAccessor},
        cache::LocalizationCache,
        proxy::PathProxy,
    },
};
use async_trait::async_trait;
use std::{fmt, path::Path, sync::Arc};
use tracing::{debug, info, warn};

/// Log lines emitted per input before the rest are summarized.
const MAX_LOGS_PER_INPUT: usize = 5;

#[async_trait]
pub trait UnitHooks: Send + Sync {
    /// Runs before the unit's command is materialized; returns the bindings
    /// the command should see.
    async fn before_unit(
        &self,
        unit: &str,
        inputs: Vec<InputBinding>,
    ) -> LocalizeResult<Vec<InputBinding>>;

    async fn prepare_outputs(
        &self,
        unit: &str,
        outputs: Vec<OutputBinding>,
    ) -> LocalizeResult<Vec<OutputBinding>>;

    /// Runs only after the unit finished successfully.
    async fn after_unit(&self, unit: &str, outputs: &[OutputBinding]) -> LocalizeResult<()>;
}

pub struct GsHooks {
    accessor: Arc<dyn ObjectAccessor>,
    cache: Option<Arc<LocalizationCache>>,
}

impl GsHooks {
    pub fn new(accessor: Arc<dyn ObjectAccessor>, cache: Option<Arc<LocalizationCache>>) -> Self {
        Self { accessor, cache }
    }

    /// Build the store client and, when enabled, the cache. Cache root
    /// problems surface here, before any unit runs.
    pub async fn from_options(options: &PluginOptions, workdir: &Path) -> LocalizeResult<Self> {
        let backend = options.backend()?;
        let accessor: Arc<dyn ObjectAccessor> = Arc::new(StoreAccessor::new(backend));
        let cache = match options.resolve_cache_root(workdir)? {
            Some(root) => Some(Arc::new(
                LocalizationCache::new(root, accessor.clone(), options.mtime_tolerance()).await?,
            )),
            None => {
                info!("gcs_cache disabled: gs:// paths are passed through unlocalized");
                None
            }
        };
        Ok(Self::new(accessor, cache))
    }

    pub fn accessor(&self) -> &Arc<dyn ObjectAccessor> {
        &self.accessor
    }

    pub fn cache(&self) -> Option<&Arc<LocalizationCache>> {
        self.cache.as_ref()
    }

    pub fn is_localizing(&self) -> bool {
        self.cache.is_some()
    }

    async fn resolve_input(
        &self,
        unit: &str,
        proxy: PathProxy,
        is_dir: bool,
        logs: &mut LogLimiter<'_>,
    ) -> LocalizeResult<PathProxy> {
        let remote = match proxy {
            PathProxy::Local(_) => return Ok(proxy),
            PathProxy::Localized { ref local, .. } => {
                logs.warn(format_args!(
                    "Input already localized at {}, skipping",
                    local.display()
                ));
                return Ok(proxy);
            }
            PathProxy::Remote(remote) => remote,
        };

        if remote.is_bucket() {
            return Err(LocalizeError::BareBucket {
                unit: unit.to_string(),
                role: "Input",
                uri: remote.to_string(),
            });
        }
        let missing = || LocalizeError::InputMissing {
            unit: unit.to_string(),
            uri: remote.to_string(),
        };

        let Some(cache) = &self.cache else {
            let proxy = PathProxy::Remote(remote.clone());
            if !proxy.exists(self.accessor.as_ref()).await? {
                return Err(missing());
            }
            return Ok(proxy);
        };

        logs.info(format_args!("Localizing {remote} ..."));
        let localized = if is_dir {
            cache.localize_dir(&remote).await
        } else {
            cache.localize(&remote).await
        };
        match localized {
            Ok(local) => Ok(PathProxy::Localized { local, remote }),
            Err(err) if err.is_not_found() => Err(missing()),
            Err(err) => Err(err),
        }
    }

    async fn resolve_output(
        &self,
        unit: &str,
        proxy: PathProxy,
        is_dir: bool,
    ) -> LocalizeResult<PathProxy> {
        let PathProxy::Remote(remote) = proxy else {
            return Ok(proxy);
        };
        if remote.is_bucket() {
            return Err(LocalizeError::BareBucket {
                unit: unit.to_string(),
                role: "Output",
                uri: remote.to_string(),
            });
        }
        match &self.cache {
            Some(cache) => {
                let local = cache.prepare_output(&remote, is_dir).await?;
                debug!("[{}] output {} works at {}", unit, remote, local.display());
                Ok(PathProxy::Localized { local, remote })
            }
            None => Ok(PathProxy::Remote(remote)),
        }
    }
}

#[async_trait]
impl UnitHooks for GsHooks {
    async fn before_unit(
        &self,
        unit: &str,
        inputs: Vec<InputBinding>,
    ) -> LocalizeResult<Vec<InputBinding>> {
        let mut resolved = Vec::with_capacity(inputs.len());
        for InputBinding { name, value } in inputs {
            let mut logs = LogLimiter::new(unit, &name);
            let value = match value {
                InputValue::Var(value) => InputValue::Var(value),
                InputValue::File(proxy) => {
                    InputValue::File(self.resolve_input(unit, proxy, false, &mut logs).await?)
                }
                InputValue::Dir(proxy) => {
                    InputValue::Dir(self.resolve_input(unit, proxy, true, &mut logs).await?)
                }
                InputValue::Files(proxies) => {
                    let mut out = Vec::with_capacity(proxies.len());
                    for proxy in proxies {
                        out.push(self.resolve_input(unit, proxy, false, &mut logs).await?);
                    }
                    InputValue::Files(out)
                }
                InputValue::Dirs(proxies) => {
                    let mut out = Vec::with_capacity(proxies.len());
                    for proxy in proxies {
                        out.push(self.resolve_input(unit, proxy, true, &mut logs).await?);
                    }
                    InputValue::Dirs(out)
                }
            };
            resolved.push(InputBinding { name, value });
        }
        Ok(resolved)
    }

    async fn prepare_outputs(
        &self,
        unit: &str,
        outputs: Vec<OutputBinding>,
    ) -> LocalizeResult<Vec<OutputBinding>> {
        let mut resolved = Vec::with_capacity(outputs.len());
        for OutputBinding { name, value } in outputs {
            let value = match value {
                OutputValue::Var(value) => OutputValue::Var(value),
                OutputValue::File(proxy) => {
                    OutputValue::File(self.resolve_output(unit, proxy, false).await?)
                }
                OutputValue::Dir(proxy) => {
                    OutputValue::Dir(self.resolve_output(unit, proxy, true).await?)
                }
            };
            resolved.push(OutputBinding { name, value });
        }
        Ok(resolved)
    }

    async fn after_unit(&self, unit: &str, outputs: &[OutputBinding]) -> LocalizeResult<()> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        for output in outputs {
            let Some(proxy) = output.path() else {
                continue;
            };
            let target = match proxy {
                PathProxy::Localized { remote, .. } => Some(remote.clone()),
                PathProxy::Local(path) => cache.remote_for(path),
                PathProxy::Remote(_) => None,
            };
            let Some(target) = target else {
                continue;
            };
            info!("[{}] Uploading output '{}' to {} ...", unit, output.name, target);
            cache.delocalize(proxy).await?;
        }
        Ok(())
    }
}

/// Caps per-input log lines so a long file list does not flood the log.
struct LogLimiter<'a> {
    unit: &'a str,
    input: &'a str,
    emitted: usize,
}

impl<'a> LogLimiter<'a> {
    fn new(unit: &'a str, input: &'a str) -> Self {
        Self {
            unit,
            input,
            emitted: 0,
        }
    }

    /// Whether the next line may be logged. The first refusal logs the
    /// summary line once.
    fn admit(&mut self) -> bool {
        self.emitted += 1;
        if self.emitted <= MAX_LOGS_PER_INPUT {
            return true;
        }
        if self.emitted == MAX_LOGS_PER_INPUT + 1 {
            info!(
                "[{}] {}: Not showing more similar messages ...",
                self.unit, self.input
            );
        }
        false
    }

    fn info(&mut self, message: fmt::Arguments<'_>) {
        if self.admit() {
            info!("[{}] {}: {}", self.unit, self.input, message);
        }
    }

    fn warn(&mut self, message: fmt::Arguments<'_>) {
        if self.admit() {
            warn!("[{}] {}: {}", self.unit, self.input, message);
        }
    }
}
