use clap::Parser;

mod cli;

use cli::{Cli, CliContext, Commands};
use labpanel::config::{ConfigManager, EnvConfigManager};

// Not a tokio main: a worker's main loop blocks on its dispatch queue, which
// must not happen inside a runtime. The supervisor enters the shared runtime
// only where it needs it.
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or_else(cli::default_command);
    if matches!(command, Commands::Worker) {
        return cli::worker::execute();
    }
    let config_manager = ConfigManager(EnvConfigManager::new(cli.root.join(".env")));
    let context = CliContext::new(cli.root, config_manager);
    cli::execute(&context, command)
}
