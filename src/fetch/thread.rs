//! Background driver for the fetcher's coordination tick

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::core::error::Error;
use crate::core::Result;
use crate::fetch::dispatcher::TextureFetcher;

/// Default time between ticks
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Runs [`TextureFetcher::update`] on a fixed interval until shut down
pub struct FetchThread {
    fetcher: Arc<TextureFetcher>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    /// Tokio runtime (if None, the task runs on the caller's runtime)
    runtime: Option<Runtime>,
}

impl FetchThread {
    /// Start ticking `fetcher` on a dedicated runtime
    ///
    /// # Arguments
    /// * `fetcher` - The fetcher to drive
    /// * `interval` - Time between ticks
    pub fn new(fetcher: Arc<TextureFetcher>, interval: Duration) -> Result<Self> {
        if fetcher.is_quitting() {
            return Err(Error::Fetch("fetcher is already shut down".into()));
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("texfetch")
            .enable_time()
            .build()
            .map_err(Error::Io)?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = runtime.spawn(Self::run_loop(Arc::clone(&fetcher), interval, shutdown_rx));

        Ok(Self {
            fetcher,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
            runtime: Some(runtime),
        })
    }

    /// Start ticking `fetcher` on the current tokio runtime
    ///
    /// Panics if called outside a tokio runtime context.
    pub fn new_with_current_runtime(fetcher: Arc<TextureFetcher>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(Self::run_loop(Arc::clone(&fetcher), interval, shutdown_rx));

        Self {
            fetcher,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
            runtime: None,
        }
    }

    async fn run_loop(fetcher: Arc<TextureFetcher>, interval: Duration, mut shutdown_rx: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pending = fetcher.update();
                    ticks += 1;
                    if pending > 0 {
                        log::trace!("tick {}: {} workers still pending", ticks, pending);
                    }
                }
                _ = &mut shutdown_rx => break,
            }
        }
        log::info!("Texture fetch thread stopped after {} ticks", ticks);
    }

    pub fn fetcher(&self) -> &Arc<TextureFetcher> {
        &self.fetcher
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Signal the tick loop to stop without waiting for it
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Stop and wait for the loop to exit. The fetcher is told to abort
    /// outstanding requests first.
    ///
    /// Must not be called from inside a runtime when the thread owns its own
    /// runtime; use [`join`](Self::join) there.
    pub fn shutdown(mut self) {
        self.fetcher.shutdown();
        self.stop();
        if let (Some(runtime), Some(task)) = (self.runtime.take(), self.task.take()) {
            if let Err(e) = runtime.block_on(task) {
                log::error!("Texture fetch thread panicked: {}", e);
            }
        }
    }

    /// Async form of [`shutdown`](Self::shutdown)
    pub async fn join(mut self) {
        self.fetcher.shutdown();
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Texture fetch thread panicked: {}", e);
            }
        }
    }
}

impl Drop for FetchThread {
    fn drop(&mut self) {
        self.stop();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TextureId;
    use crate::fetch::dispatcher::FetchRequest;
    use crate::testing::{ok_response, TestEnv};

    #[tokio::test]
    async fn test_thread_drives_request_to_completion() {
        let env = TestEnv::new();
        let fetcher = Arc::new(env.fetcher());
        let thread = FetchThread::new_with_current_runtime(Arc::clone(&fetcher), Duration::from_millis(1));
        assert!(thread.is_running());

        let id = TextureId::from_u128(7);
        assert!(fetcher.create_request(&FetchRequest::new(id, 100.0, 0).with_url("http://cdn.example/a.j2c")));

        let mut finished = None;
        let mut answered = false;
        for _ in 0..500 {
            if let Some((handle, _)) = env.http.last_handle() {
                if !answered {
                    env.http.complete(ok_response(handle, &env.encoded(16, 16, 300)));
                    answered = true;
                }
            }
            let result = fetcher.get_request_finished(&id, -1);
            if result.finished {
                finished = Some(result);
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let result = finished.expect("request never finished");
        assert_eq!(result.discard_level, 0);
        thread.join().await;
        assert!(fetcher.is_quitting());
    }

    #[test]
    fn test_shut_down_fetcher_is_refused() {
        let env = TestEnv::new();
        let fetcher = Arc::new(env.fetcher());
        fetcher.shutdown();
        let result = FetchThread::new(fetcher, DEFAULT_TICK_INTERVAL);
        assert!(matches!(result, Err(Error::Fetch(_))));
    }

    #[test]
    fn test_own_runtime_shutdown() {
        let env = TestEnv::new();
        let fetcher = Arc::new(env.fetcher());
        let thread = FetchThread::new(Arc::clone(&fetcher), DEFAULT_TICK_INTERVAL).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        thread.shutdown();
        assert!(fetcher.is_quitting());
    }
}
