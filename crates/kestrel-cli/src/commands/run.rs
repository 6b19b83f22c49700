//! Run command - compile a function and call it once.

use anyhow::{Result, anyhow, bail};
use clap::{Args, ValueEnum};
use kestrel_engine::{CallContext, Callable, Engine, EngineConfig, Tier, Value};
use kestrel_vm::VmError;
use tracing::debug;

use super::SourceArgs;

/// Tier selectable on the command line
#[derive(Clone, Copy, ValueEnum)]
pub enum TierArg {
    /// Start in optimized code
    Optimized,
    /// Interpreter only
    Baseline,
}

impl From<TierArg> for Tier {
    fn from(tier: TierArg) -> Self {
        match tier {
            TierArg::Optimized => Tier::Optimized,
            TierArg::Baseline => Tier::Baseline,
        }
    }
}

#[derive(Args)]
pub struct RunCommand {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Starting tier (defaults to optimized unless KESTREL_DISABLE_JIT is set)
    #[arg(long, value_enum)]
    pub tier: Option<TierArg>,

    /// Compile optimized code without type guards
    #[arg(long = "no-speculation")]
    pub no_speculation: bool,

    /// Bailouts before optimized code is dropped
    #[arg(long = "deopt-threshold", value_name = "N")]
    pub deopt_threshold: Option<u32>,

    /// Arguments passed to the function
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl RunCommand {
    pub fn run(&self) -> Result<()> {
        let (source, first_arg) = self.source.read()?;
        let args: Vec<Value> = first_arg
            .iter()
            .chain(&self.args)
            .map(String::as_str)
            .map(parse_arg)
            .collect();

        let engine = Engine::new(self.config());
        // Engine errors hold runtime values, which are not Send
        let function = engine
            .compile_function(&source)
            .map_err(|err| anyhow!("{err}"))?;
        let result = function.call(&args, CallContext::root());
        debug!(stats = ?engine.stats(), "run finished");

        match result {
            Ok(value) => {
                println!("{value}");
                Ok(())
            }
            Err(VmError::Exception(exception)) => bail!(
                "Uncaught {} (line {}, position {})",
                exception.value,
                exception.position.line,
                exception.position.offset
            ),
            Err(err) => bail!("{err}"),
        }
    }

    fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::from_env();
        if let Some(tier) = self.tier {
            config = config.with_tier(tier.into());
        }
        if self.no_speculation {
            config = config.with_speculation(false);
        }
        if let Some(threshold) = self.deopt_threshold {
            config = config.with_deopt_threshold(threshold);
        }
        config
    }
}

/// Literals become the matching primitive; anything else is a string
fn parse_arg(text: &str) -> Value {
    match text {
        "true" => Value::Boolean(true),
        "false" => Value::Boolean(false),
        "undefined" => Value::Undefined,
        "null" => Value::Null,
        _ => text
            .parse::<f64>()
            .map(Value::Number)
            .unwrap_or_else(|_| Value::string(text)),
    }
}
