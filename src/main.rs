use anyhow::{Context, Result};
use gs_localize::{
    GsHooks, InputBinding, OutputBinding, PathProxy, RemoteRef, UnitSpec,
    config::{AppConfig, Command, RunArgs},
    run_unit,
    services::cache,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;

    // --- Logging setup ---
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.options.gcs_loglevel))
        .with_context(|| format!("invalid log level `{}`", cfg.options.gcs_loglevel))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Starting gs-localize with config: {:?}", cfg);

    // --- Initialize hooks (fails fast on an unusable cache root) ---
    let hooks = GsHooks::from_options(&cfg.options, &cfg.workdir)
        .await
        .context("initializing gs-localize")?;

    match command {
        Command::Stat { uri } => {
            let is_dir = uri.ends_with('/');
            let proxy = PathProxy::from_declared(&uri, is_dir)?;
            let stat = proxy.stat(hooks.accessor().as_ref()).await?;
            println!("{}\t{}\t{}", uri, stat.size, stat.mtime.to_rfc3339());
        }
        Command::Localize { uri } => {
            let cache = hooks
                .cache()
                .context("localize needs a cache root (--cache or GS_LOCALIZE_CACHE)")?;
            let reference = RemoteRef::parse(&uri)?;
            let local = if reference.is_prefix() {
                cache.localize_dir(&reference).await?
            } else {
                cache.localize(&reference).await?
            };
            println!("{}", local.display());
        }
        Command::Upload { local, uri } => {
            let target = RemoteRef::parse(&uri)?;
            cache::push(hooks.accessor().as_ref(), &local, &target)
                .await
                .with_context(|| format!("uploading {} to {}", local.display(), uri))?;
        }
        Command::Run(run) => {
            let spec = unit_spec(run)?;
            let unit = spec.name.clone();
            run_unit(&hooks, spec)
                .await
                .with_context(|| format!("running unit {unit}"))?;
        }
    }

    Ok(())
}

fn unit_spec(run: RunArgs) -> Result<UnitSpec> {
    let mut inputs = Vec::new();
    for (name, value) in run.vars {
        inputs.push(InputBinding::var(name, value));
    }
    for (name, path) in &run.inputs {
        inputs.push(InputBinding::file(name, path)?);
    }
    for (name, path) in &run.input_dirs {
        inputs.push(InputBinding::dir(name, path)?);
    }

    let mut outputs = Vec::new();
    for (name, path) in &run.outputs {
        outputs.push(OutputBinding::file(name, path)?);
    }
    for (name, path) in &run.output_dirs {
        outputs.push(OutputBinding::dir(name, path)?);
    }

    let mut command = run.command.into_iter();
    let program = command.next().context("no program given after `--`")?;

    Ok(UnitSpec {
        name: run.name,
        inputs,
        outputs,
        program,
        args: command.collect(),
    })
}
