use once_cell::sync::OnceCell;
use std::future::Future;
use tokio::runtime::{Handle, Runtime};

static TOKIO_RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Initializes the global multi-threaded Tokio runtime if not already initialized.
/// Child-process plumbing and shutdown reapers run here; the UI and dispatcher
/// threads never enter it.
pub fn init_tokio_runtime() -> &'static Runtime {
    TOKIO_RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("labpanel-io")
            .build()
            .expect("Failed to build Tokio runtime")
    })
}

/// Spawns an async task on the global runtime.
/// Useful for reaping a worker without blocking the UI thread.
pub fn spawn_async_task<F>(fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    init_tokio_runtime().spawn(fut);
}

/// Runs a future to completion using the global runtime.
/// Safe to use from sync contexts; must not be called from inside the runtime.
pub fn run_blocking<F, R>(fut: F) -> R
where
    F: Future<Output = R>,
{
    init_tokio_runtime().block_on(fut)
}

/// Gets a handle to the global runtime.
/// Can be used for spawning child processes or entering the runtime manually.
pub fn get_handle() -> Handle {
    init_tokio_runtime().handle().clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn spawned_tasks_run_on_the_shared_runtime() {
        let (tx, rx) = oneshot::channel();
        spawn_async_task(async move {
            let _ = tx.send(7);
        });
        assert_eq!(run_blocking(rx).unwrap(), 7);
        let joined = run_blocking(get_handle().spawn(async { 1 + 1 })).unwrap();
        assert_eq!(joined, 2);
    }
}
