//! CLI commands

pub mod graph;
pub mod run;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Args;

/// Where the function source comes from
#[derive(Args)]
pub struct SourceArgs {
    /// File holding one function expression
    pub file: Option<PathBuf>,

    /// Function expression given inline
    #[arg(short = 'e', long = "eval", value_name = "SOURCE")]
    pub eval: Option<String>,
}

impl SourceArgs {
    /// Source text, plus the positional that was really a call argument
    /// when `--eval` supplied the source
    pub fn read(&self) -> Result<(String, Option<String>)> {
        match (&self.eval, &self.file) {
            (Some(source), file) => Ok((
                source.clone(),
                file.as_ref().map(|path| path.to_string_lossy().into_owned()),
            )),
            (None, Some(path)) => {
                let source = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read {}", path.display()))?;
                Ok((source, None))
            }
            (None, None) => bail!("expected a source file or --eval"),
        }
    }
}
