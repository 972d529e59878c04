//! Connection-health loop and watch lifecycle shared by every election component
//!
//! An [`ElectionSession`] owns one background worker. The worker consumes three
//! kinds of input: health-check ticks, watch events and the shutdown signal. A
//! failed probe (or a watch stream closed by the store) moves the worker into a
//! reconnect poll; once the store answers again the strategy is told to reset its
//! cached state and the watch is re-created.
//!
//! Whenever a watch is opened the strategy may synchronize with the store before
//! the first event is consumed. Events arriving meanwhile stay queued on the watch,
//! so the session remains the only writer of strategy state.
//!
//! What is watched, and what happens with each event, is supplied by a
//! [`WatchStrategy`].

use crate::config::SessionConfig;
use crate::error::Result;
use crate::store::{CoordinationClient, Watch, WatchEvent};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, trace, warn};

/// Watch creation and event handling plugged into an [`ElectionSession`]
#[async_trait]
pub trait WatchStrategy: Send + Sync {
    /// Open the subscription. `Ok(None)` means there is nothing to watch.
    async fn create_watch(&self, client: &dyn CoordinationClient) -> Result<Option<Watch>>;

    /// Called once the watch is open and before any of its events is handled.
    /// An error discards the watch.
    async fn on_watch_created(&self, _client: &dyn CoordinationClient) -> Result<()> {
        Ok(())
    }

    /// Handle one event, in the order the store delivered it
    async fn on_watch_event(&self, event: WatchEvent);

    /// The store stopped answering
    async fn on_cluster_down(&self) {}

    /// The store answers again; events may have been missed in between
    async fn on_cluster_recover(&self) {}
}

struct SessionWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Keeps a watch subscription alive against a possibly flaky coordination store
pub struct ElectionSession {
    name: String,
    client: Arc<dyn CoordinationClient>,
    strategy: Arc<dyn WatchStrategy>,
    config: SessionConfig,
    worker: Mutex<Option<SessionWorker>>,
}

impl ElectionSession {
    pub fn new<T: Into<String>>(
        name: T,
        client: Arc<dyn CoordinationClient>,
        strategy: Arc<dyn WatchStrategy>,
        config: SessionConfig,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            strategy,
            config,
            worker: Mutex::new(None),
        }
    }

    fn worker(&self) -> MutexGuard<'_, Option<SessionWorker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    pub fn is_running(&self) -> bool {
        self.worker()
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Create the watch and start the health loop.
    ///
    /// Returns `Ok(false)` when the strategy produced no watch; the health loop
    /// is not started in that case.
    pub async fn start(&self) -> Result<bool> {
        if self.is_running() {
            debug!("Session {} already running", self.name);
            return Ok(true);
        }

        let watch = match self.strategy.create_watch(self.client.as_ref()).await? {
            Some(watch) => watch,
            None => {
                info!("Session {} has nothing to watch, health loop not started", self.name);
                return Ok(false);
            }
        };
        self.strategy.on_watch_created(self.client.as_ref()).await?;

        let mut slot = self.worker();
        if slot.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            // Lost a concurrent start; the extra watch is dropped here.
            return Ok(true);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = SessionLoop {
            name: self.name.clone(),
            client: self.client.clone(),
            strategy: self.strategy.clone(),
            config: self.config,
            shutdown: shutdown_rx,
        };

        info!("Starting session {} on {}", self.name, watch.target());
        *slot = Some(SessionWorker {
            shutdown: shutdown_tx,
            handle: tokio::spawn(worker.run(watch)),
        });

        Ok(true)
    }

    /// Stop the health loop and cancel the watch. Safe to call repeatedly and
    /// from inside a strategy callback.
    pub fn stop(&self) {
        if let Some(worker) = self.worker().take() {
            let _ = worker.shutdown.send(true);
            worker.handle.abort();
            info!("Stopped session {}", self.name);
        }
    }
}

impl Drop for ElectionSession {
    fn drop(&mut self) {
        self.stop();
    }
}

enum SessionInput {
    HealthTick,
    Event(WatchEvent),
    WatchClosed,
    Stop,
}

struct SessionLoop {
    name: String,
    client: Arc<dyn CoordinationClient>,
    strategy: Arc<dyn WatchStrategy>,
    config: SessionConfig,
    shutdown: watch::Receiver<bool>,
}

impl SessionLoop {
    async fn run(mut self, mut watch: Watch) {
        let mut next_check = Instant::now() + self.config.health_check_interval;

        loop {
            let input = tokio::select! {
                biased;
                _ = self.shutdown.changed() => SessionInput::Stop,
                // Health ticks go first so a busy stream cannot starve them
                _ = sleep_until(next_check) => SessionInput::HealthTick,
                event = watch.next() => match event {
                    Some(event) => SessionInput::Event(event),
                    None => SessionInput::WatchClosed,
                },
            };

            match input {
                SessionInput::Stop => break,
                SessionInput::Event(event) => self.strategy.on_watch_event(event).await,
                SessionInput::HealthTick => {
                    if let Err(e) = self.client.ping().await {
                        warn!("Session {} health check failed: {}", self.name, e);
                        watch = match self.reconnect(watch).await {
                            Some(watch) => watch,
                            None => break,
                        };
                    } else {
                        trace!("Session {} health check passed", self.name);
                    }
                    next_check = Instant::now() + self.config.health_check_interval;
                }
                SessionInput::WatchClosed => {
                    warn!("Session {} watch stream closed by the store", self.name);
                    watch = match self.reconnect(watch).await {
                        Some(watch) => watch,
                        None => break,
                    };
                    next_check = Instant::now() + self.config.health_check_interval;
                }
            }
        }

        debug!("Session {} worker exited", self.name);
    }

    /// Poll the store until it answers, then reset strategy state and re-create
    /// the watch. `None` when the session is stopped meanwhile.
    async fn reconnect(&mut self, stale: Watch) -> Option<Watch> {
        drop(stale);
        self.strategy.on_cluster_down().await;

        loop {
            loop {
                tokio::select! {
                    biased;
                    _ = self.shutdown.changed() => return None,
                    _ = sleep(self.config.reconnect_interval) => {}
                }
                if self.client.ping().await.is_ok() {
                    break;
                }
            }

            info!("Session {} reconnected to the coordination store", self.name);
            self.strategy.on_cluster_recover().await;

            let watch = match self.strategy.create_watch(self.client.as_ref()).await {
                Ok(Some(watch)) => watch,
                Ok(None) => {
                    info!("Session {} has nothing to watch after recovery", self.name);
                    return None;
                }
                Err(e) => {
                    warn!("Session {} failed to re-create watch: {}", self.name, e);
                    continue;
                }
            };

            match self.strategy.on_watch_created(self.client.as_ref()).await {
                Ok(()) => return Some(watch),
                Err(e) => warn!("Session {} failed to resync after recovery: {}", self.name, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, WatchTarget};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingStrategy {
        skip_watch: bool,
        fail_sync: bool,
        event_delay: Option<Duration>,
        syncs: AtomicUsize,
        events: Mutex<Vec<WatchEvent>>,
        downs: AtomicUsize,
        recovers: AtomicUsize,
        watches: AtomicUsize,
    }

    #[async_trait]
    impl WatchStrategy for RecordingStrategy {
        async fn create_watch(&self, client: &dyn CoordinationClient) -> Result<Option<Watch>> {
            if self.skip_watch {
                return Ok(None);
            }
            self.watches.fetch_add(1, Ordering::SeqCst);
            let watch = client
                .watch(WatchTarget::Prefix("/group0/".to_string()))
                .await?;
            Ok(Some(watch))
        }

        async fn on_watch_created(&self, _client: &dyn CoordinationClient) -> Result<()> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            if self.fail_sync {
                return Err(crate::error::ElectionError::coordination("sync rejected"));
            }
            Ok(())
        }

        async fn on_watch_event(&self, event: WatchEvent) {
            if let Some(delay) = self.event_delay {
                sleep(delay).await;
            }
            self.events.lock().unwrap().push(event);
        }

        async fn on_cluster_down(&self) {
            self.downs.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_cluster_recover(&self) {
            self.recovers.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn session(store: &Arc<MemoryStore>, strategy: &Arc<RecordingStrategy>) -> ElectionSession {
        ElectionSession::new("test", store.clone(), strategy.clone(), SessionConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_watch_no_health_loop() {
        let store = Arc::new(MemoryStore::new());
        let strategy = Arc::new(RecordingStrategy {
            skip_watch: true,
            ..Default::default()
        });
        let session = session(&store, &strategy);

        assert!(!session.start().await.unwrap());
        assert!(!session.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_delivered_in_order() {
        let store = Arc::new(MemoryStore::new());
        let strategy = Arc::new(RecordingStrategy::default());
        let session = session(&store, &strategy);
        assert!(session.start().await.unwrap());

        store.put("/group0/consensus", b"a".to_vec(), 0).unwrap();
        store.put("/group0/consensus", b"b".to_vec(), 0).unwrap();
        store.delete("/group0/consensus");
        sleep(Duration::from_millis(10)).await;

        let events = strategy.events.lock().unwrap().clone();
        let versions: Vec<_> = events.iter().map(|e| e.kv.version).collect();
        assert_eq!(versions, vec![1, 2, 0]);
        session.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_recovers_once_and_rewatches() {
        let store = Arc::new(MemoryStore::new());
        let strategy = Arc::new(RecordingStrategy::default());
        let session = session(&store, &strategy);
        session.start().await.unwrap();

        store.set_available(false);
        // Long enough for several failed health ticks
        sleep(Duration::from_secs(12)).await;
        assert_eq!(strategy.downs.load(Ordering::SeqCst), 1);
        assert_eq!(strategy.recovers.load(Ordering::SeqCst), 0);

        store.set_available(true);
        sleep(Duration::from_millis(250)).await;
        assert_eq!(strategy.recovers.load(Ordering::SeqCst), 1);
        assert_eq!(strategy.watches.load(Ordering::SeqCst), 2);
        assert_eq!(strategy.syncs.load(Ordering::SeqCst), 2);
        assert_eq!(store.watcher_count(), 1);

        store.put("/group0/scheduler", b"a".to_vec(), 0).unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(strategy.events.lock().unwrap().len(), 1);
        session.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_cancels_watch() {
        let store = Arc::new(MemoryStore::new());
        let strategy = Arc::new(RecordingStrategy::default());
        let session = session(&store, &strategy);
        session.start().await.unwrap();
        assert!(session.is_running());

        session.stop();
        session.stop();
        sleep(Duration::from_millis(10)).await;

        assert!(!session.is_running());
        assert_eq!(store.watcher_count(), 0);

        // Restart after stop opens a fresh watch
        assert!(session.start().await.unwrap());
        assert_eq!(store.watcher_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fails_when_store_down() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let strategy = Arc::new(RecordingStrategy::default());
        let session = session(&store, &strategy);

        assert!(session.start().await.unwrap_err().is_transient());
        assert!(!session.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sync_discards_watch() {
        let store = Arc::new(MemoryStore::new());
        let strategy = Arc::new(RecordingStrategy {
            fail_sync: true,
            ..Default::default()
        });
        let session = session(&store, &strategy);

        assert!(session.start().await.unwrap_err().is_transient());
        assert!(!session.is_running());
        assert_eq!(strategy.syncs.load(Ordering::SeqCst), 1);
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_stream_does_not_delay_health_check() {
        let store = Arc::new(MemoryStore::new());
        let strategy = Arc::new(RecordingStrategy {
            event_delay: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        let session = session(&store, &strategy);
        session.start().await.unwrap();

        // Twenty seconds worth of queued events
        for i in 0..20 {
            store.put("/group0/consensus", vec![i], 0).unwrap();
        }
        store.set_available(false);

        sleep(Duration::from_secs(7)).await;
        assert_eq!(strategy.downs.load(Ordering::SeqCst), 1);
        assert!(strategy.events.lock().unwrap().len() < 20);
        session.stop();
    }
}
