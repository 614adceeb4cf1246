use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod params;
pub mod run;
pub mod schema;
pub mod worker;

use params::ParamsArgs;
use run::RunArgs;
use schema::SchemaArgs;

use labpanel::config::ConfigManager;

#[derive(Parser, Debug)]
#[command(
    name = "labpanel",
    about = "Widget panels for lab instruments",
    version = "0.2.0"
)]
pub struct Cli {
    /// Directory holding `.env`, `logs/` and `params/`
    #[arg(long, global = true, default_value = ".")]
    pub root: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Open apps and serve them until Ctrl-C
    Run(RunArgs),

    /// Save, load or inspect parameter files
    Params(ParamsArgs),

    /// Emit the JSON schema of the app document
    Schema(SchemaArgs),

    /// Serve one app over stdin/stdout (started by the supervisor)
    #[command(hide = true)]
    Worker,
}

#[derive(Clone, Debug)]
pub struct CliContext {
    pub root: PathBuf,
    pub config_manager: ConfigManager,
}

impl CliContext {
    pub fn new(root: PathBuf, config_manager: ConfigManager) -> Self {
        Self { root, config_manager }
    }

    /// `path` itself when absolute, otherwise relative to the root.
    pub fn resolve(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

pub fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context),
        Commands::Params(args) => params::execute(args, context),
        Commands::Schema(args) => schema::execute(args, context),
        Commands::Worker => worker::execute(),
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default())
}
