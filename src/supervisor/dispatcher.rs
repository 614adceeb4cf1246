use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, trace};

use super::link::Inbound;
use super::ui::UiHandle;

/// Drains every worker's upward traffic in arrival order and hands each item
/// to the UI thread. Stops on [`Inbound::Shutdown`] or once the UI is gone.
pub fn spawn_dispatcher(mut rx: UnboundedReceiver<Inbound>, ui: UiHandle) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("labpanel-dispatch".into())
        .spawn(move || {
            while let Some(inbound) = rx.blocking_recv() {
                if matches!(inbound, Inbound::Shutdown) {
                    break;
                }
                trace!(?inbound, "inbound");
                if !ui.post(move |state| state.handle_inbound(inbound)) {
                    break;
                }
            }
            debug!("dispatcher stopped");
        })
        .context("cannot start dispatcher thread")
}
