//! Graph command - dump the optimized lowering of a function.

use anyhow::{Result, bail};
use clap::Args;
use kestrel_compiler::Compiler;
use kestrel_jit::{JitCompiler, JitOptions};

use super::SourceArgs;

#[derive(Args)]
pub struct GraphCommand {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,

    /// Lower without type guards
    #[arg(long = "no-speculation")]
    pub no_speculation: bool,
}

impl GraphCommand {
    pub fn run(&self) -> Result<()> {
        let (source, extra) = self.source.read()?;
        if let Some(extra) = extra {
            bail!("unexpected argument `{extra}`");
        }

        let structured = Compiler::new(&source).compile_function()?;
        let options = JitOptions {
            speculation: !self.no_speculation,
        };
        let optimized = JitCompiler::new(options).compile(&structured)?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&optimized)?);
            return Ok(());
        }

        println!(
            "function {} ({} params, {} slots, {} finally copies)",
            optimized.name, optimized.param_count, optimized.slot_count, optimized.finally_copies
        );
        println!("regions:");
        for region in optimized.regions.iter() {
            let parent = region
                .parent
                .map_or_else(|| "-".to_string(), |parent| parent.to_string());
            println!(
                "  {} {:?} [{}, {}) handler {} parent {} depth {} finally depth {}",
                region.id,
                region.kind,
                region.start,
                region.end,
                region.handler_entry,
                parent,
                region.handler_depth,
                region.finally_depth
            );
        }
        print!("{}", optimized.graph);
        Ok(())
    }
}
