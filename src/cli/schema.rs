use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use super::CliContext;
use labpanel::layout::document_schema;

pub const SCHEMA_FILE: &str = "app-document.schema.json";

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Output directory, `<root>/schemas` by default
    #[arg(long)]
    pub out: Option<PathBuf>,
}

pub fn execute(args: SchemaArgs, context: &CliContext) -> anyhow::Result<()> {
    let out_dir = match args.out {
        Some(dir) => context.resolve(&dir),
        None => context.root.join("schemas"),
    };
    fs::create_dir_all(&out_dir).with_context(|| format!("cannot create {}", out_dir.display()))?;
    let path = out_dir.join(SCHEMA_FILE);
    let json = serde_json::to_string_pretty(&document_schema())?;
    fs::write(&path, json).with_context(|| format!("cannot write {}", path.display()))?;
    println!("Schema written to {}", path.display());
    Ok(())
}
