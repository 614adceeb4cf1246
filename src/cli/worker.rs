use labpanel::worker::stdio::run_stdio;

/// Runs until the supervisor sends `stop` or closes stdin.
pub fn execute() -> anyhow::Result<()> {
    run_stdio()?;
    Ok(())
}
