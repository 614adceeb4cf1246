use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Subcommand};

use super::CliContext;
use super::run::runtime_config;
use labpanel::config::WorkerMode;
use labpanel::logger::FileTelemetry;
use labpanel::supervisor::Supervisor;
use labpanel::supervisor::params::read_params_file;

#[derive(Args, Debug)]
pub struct ParamsArgs {
    #[command(subcommand)]
    pub command: ParamsCommands,
}

#[derive(Subcommand, Debug)]
pub enum ParamsCommands {
    /// Open the app, let its init callables run, and write its parameters
    Save {
        #[arg(long)]
        app: PathBuf,
        /// Defaults to `<params_dir>/<app>.params`
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Apply a parameter file to the app and store the result as the app's
    /// saved parameters
    Load {
        #[arg(long)]
        app: PathBuf,
        #[arg(long)]
        file: PathBuf,
    },
    /// Print a parameter file as JSON
    Show {
        #[arg(long)]
        file: PathBuf,
    },
}

pub fn execute(args: ParamsArgs, context: &CliContext) -> anyhow::Result<()> {
    match args.command {
        ParamsCommands::Save { app, file } => {
            let supervisor = open(context)?;
            let worker = supervisor.open_app(&context.resolve(&app))?;
            let file = file.map(|f| context.resolve(&f));
            let written = supervisor.ui().call(move |state| state.save_params(worker, file))??;
            supervisor.shutdown()?;
            println!("Parameters written to {}", written.display());
            Ok(())
        }
        ParamsCommands::Load { app, file } => {
            let supervisor = open(context)?;
            let worker = supervisor.open_app(&context.resolve(&app))?;
            let source = context.resolve(&file);
            let (unknown, saved) = supervisor.ui().call(move |state| {
                let unknown = state.load_params(worker, Some(source))?;
                let saved = state.save_params(worker, None)?;
                anyhow::Ok((unknown, saved))
            })??;
            supervisor.shutdown()?;
            for id in &unknown {
                eprintln!("skipped unknown widget id `{id}`");
            }
            println!("Parameters stored at {}", saved.display());
            Ok(())
        }
        ParamsCommands::Show { file } => {
            let params = read_params_file(&context.resolve(&file))?;
            let json = serde_json::to_string_pretty(&params).context("cannot render parameters")?;
            println!("{json}");
            Ok(())
        }
    }
}

/// A supervisor for one-shot commands: thread workers, logs to files.
fn open(context: &CliContext) -> anyhow::Result<Supervisor> {
    let config = runtime_config(context, None, Some(WorkerMode::Thread));
    if let Some(dir) = &config.log_dir {
        let _ = FileTelemetry::init_files(
            config.log_level.as_filter(),
            dir.join("labpanel-params.log"),
            dir.join("labpanel-params.json"),
        );
    }
    Supervisor::start(config)
}
