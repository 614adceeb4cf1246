use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, anyhow, bail};
use clap::Args;
use tokio::signal;
use tracing::{error, info, warn};

use super::CliContext;
use labpanel::config::{RuntimeConfig, WorkerMode};
use labpanel::layout::load_workspace;
use labpanel::logger::init_tracing;
use labpanel::runtime::run_blocking;
use labpanel::supervisor::Supervisor;
use labpanel::supervisor::params::params_path;
use panel_protocol::{LogLevel, WorkerId};

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// App document to open
    #[arg(long)]
    pub app: Option<PathBuf>,

    /// Workspace file listing app documents to open
    #[arg(long)]
    pub workspace: Option<PathBuf>,

    /// Reduced UI
    #[arg(long)]
    pub compact: bool,

    /// Power the host off after a normal exit
    #[arg(long)]
    pub poweroff: bool,

    /// Log level override (trace, debug, info, warn, error, critical)
    #[arg(long)]
    pub log_level: Option<LogLevel>,

    /// Where workers run: `process` or `thread`
    #[arg(long)]
    pub workers: Option<WorkerMode>,

    /// OpenTelemetry endpoint (e.g. http://localhost:4317)
    #[arg(long)]
    pub otel_endpoint: Option<String>,
}

/// Config from the environment, overridden by flags, with relative
/// directories anchored at the root.
pub fn runtime_config(
    context: &CliContext,
    log_level: Option<LogLevel>,
    workers: Option<WorkerMode>,
) -> RuntimeConfig {
    let mut config = run_blocking(RuntimeConfig::load(&context.config_manager));
    if let Some(level) = log_level {
        config.log_level = level;
    }
    if let Some(mode) = workers {
        config.worker_mode = mode;
    }
    config.params_dir = context.resolve(&config.params_dir);
    let log_dir = config.log_dir.take().unwrap_or_else(|| PathBuf::from("logs"));
    config.log_dir = Some(context.resolve(&log_dir));
    config
}

pub fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let mut config = runtime_config(context, args.log_level, args.workers);
    config.compact = args.compact;
    let log_dir = config.log_dir.clone().unwrap_or_else(|| context.root.join("logs"));
    init_tracing(&log_dir, config.log_level, args.otel_endpoint.as_deref())
        .context("could not create logger")?;

    let mut files = Vec::new();
    if let Some(app) = &args.app {
        files.push(context.resolve(app));
    }
    if let Some(workspace) = &args.workspace {
        files.extend(load_workspace(&context.resolve(workspace))?);
    }
    if files.is_empty() {
        bail!("nothing to run: pass --app or --workspace");
    }

    info!(mode = %config.worker_mode, compact = config.compact, "labpanel starting");
    let supervisor = Supervisor::start(config)?;
    let mut opened = 0;
    for file in &files {
        match supervisor.open_app(file) {
            Ok(worker) => {
                opened += 1;
                info!(%worker, app = %file.display(), "app opened");
                restore_params(&supervisor, worker);
            }
            Err(e) => error!(app = %file.display(), "cannot open app: {e:#}"),
        }
    }
    if opened == 0 {
        supervisor.shutdown()?;
        bail!("no app could be opened");
    }
    println!("labpanel running {opened} app(s); press Ctrl-C to exit");

    run_blocking(signal::ctrl_c()).context("cannot listen for Ctrl-C")?;
    info!("shutting down");
    supervisor.shutdown()?;

    if args.poweroff {
        poweroff()?;
    }
    Ok(())
}

/// Applies the app's saved parameter file when there is one.
fn restore_params(supervisor: &Supervisor, worker: WorkerId) {
    let restored = supervisor.ui().call(move |state| {
        let name = state.host(worker).map(|h| h.name().to_string())?;
        let path = params_path(&state.config().params_dir, &name);
        path.exists().then(|| state.load_params(worker, Some(path)))
    });
    match restored {
        Ok(Some(Ok(unknown))) if unknown.is_empty() => info!(%worker, "parameters restored"),
        Ok(Some(Ok(unknown))) => warn!(%worker, ?unknown, "parameters restored, some ids unknown"),
        Ok(Some(Err(e))) => error!(%worker, "cannot restore parameters: {e:#}"),
        Ok(None) => {}
        Err(e) => error!(%worker, "cannot restore parameters: {e:#}"),
    }
}

fn poweroff() -> anyhow::Result<()> {
    info!("powering off");
    let status = Command::new("systemctl")
        .arg("poweroff")
        .status()
        .context("cannot run systemctl")?;
    if !status.success() {
        return Err(anyhow!("poweroff failed: {status}"));
    }
    Ok(())
}
