//! Runs one command as a unit of work between the lifecycle hooks.
//!
//! Bindings reach the command as environment variables: `GS_IN_<NAME>` for
//! inputs and `GS_OUT_<NAME>` for outputs, holding local paths when
//! localized and the `gs://` URI otherwise. List inputs are newline-joined.

use crate::{
    errors::{LocalizeError, LocalizeResult},
    models::binding::{InputBinding, OutputBinding},
    services::hooks::UnitHooks,
};
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub name: String,
    pub inputs: Vec<InputBinding>,
    pub outputs: Vec<OutputBinding>,
    pub program: String,
    pub args: Vec<String>,
}

/// Bindings the command actually ran with.
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub inputs: Vec<InputBinding>,
    pub outputs: Vec<OutputBinding>,
}

/// Localize, run, and on success upload. A non-zero exit is `UnitFailed`
/// and skips the upload. Dropping the returned future kills the child.
pub async fn run_unit(hooks: &dyn UnitHooks, spec: UnitSpec) -> LocalizeResult<UnitOutcome> {
    let UnitSpec {
        name,
        inputs,
        outputs,
        program,
        args,
    } = spec;

    let inputs = hooks.before_unit(&name, inputs).await?;
    let outputs = hooks.prepare_outputs(&name, outputs).await?;

    let mut command = Command::new(&program);
    command.args(&args).kill_on_drop(true);
    for input in &inputs {
        command.env(env_key("GS_IN_", &input.name), input.rendered().join("\n"));
    }
    for output in &outputs {
        command.env(env_key("GS_OUT_", &output.name), output.rendered());
    }

    info!("[{}] running {} {}", name, program, args.join(" "));
    let status = command
        .status()
        .await
        .map_err(|err| LocalizeError::io(&program, err))?;
    if !status.success() {
        return Err(LocalizeError::UnitFailed {
            unit: name,
            status: status.to_string(),
        });
    }
    debug!("[{}] finished with {}", name, status);

    hooks.after_unit(&name, &outputs).await?;
    Ok(UnitOutcome { inputs, outputs })
}

/// `GS_IN_` + `reads-1` -> `GS_IN_READS_1`
pub fn env_key(prefix: &str, name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{prefix}{suffix}")
}
