//! Campaign-and-heartbeat protocol for acquiring and holding a leader key
//!
//! Every campaign attempt, retry-timer expiry and keepalive failure is a message
//! in one mailbox, consumed by a single actor task per elector. Attempts are
//! therefore never interleaved, whatever path requested them.

use crate::campaign::CampaignCoordinator;
use crate::config::{keep_alive_cadence, retry_interval};
use crate::error::{ElectionError, Result};
use crate::member::Member;
use crate::store::{CoordinationClient, LeaseId, TxnOutcome};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Receives `true` when this node won the key, `false` when it should act as backup
pub type CampaignResultHandler = Arc<dyn Fn(bool) + Send + Sync>;

/// Receives the renewal error when the leadership lease could not be kept alive
pub type KeepAliveFailureHandler = Arc<dyn Fn(&ElectionError) + Send + Sync>;

/// Campaign state of one elector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElectorState {
    /// Not started yet, or stopped
    #[default]
    Idle,
    /// Trying to acquire the key, or waiting as backup
    Campaigning,
    /// Holding the key under a live lease
    Leading,
}

impl fmt::Display for ElectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Campaigning => write!(f, "campaigning"),
            Self::Leading => write!(f, "leading"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ElectorStatus {
    state: ElectorState,
    retry_timer_active: bool,
    lease: Option<LeaseId>,
}

#[derive(Default)]
struct ElectorCallbacks {
    campaign_result: RwLock<Option<CampaignResultHandler>>,
    keep_alive_failure: RwLock<Option<KeepAliveFailureHandler>>,
}

impl ElectorCallbacks {
    fn campaign_result(&self) -> Option<CampaignResultHandler> {
        self.campaign_result
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn keep_alive_failure(&self) -> Option<KeepAliveFailureHandler> {
        self.keep_alive_failure
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

enum ElectorMessage {
    Campaign {
        reply: Option<oneshot::Sender<bool>>,
    },
    RetryTimerFired,
    KeepAliveFailed {
        lease: LeaseId,
        error: ElectionError,
    },
    Stop,
}

/// Drives the campaign for the leader key of a [`CampaignCoordinator`]
pub struct LeaderElector {
    coordinator: Arc<CampaignCoordinator>,
    callbacks: Arc<ElectorCallbacks>,
    status: Arc<RwLock<ElectorStatus>>,
    mailbox: mpsc::UnboundedSender<ElectorMessage>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<ElectorMessage>>>,
    stopped: AtomicBool,
}

impl LeaderElector {
    pub fn new(coordinator: Arc<CampaignCoordinator>) -> Self {
        let (mailbox, inbox) = mpsc::unbounded_channel();

        Self {
            coordinator,
            callbacks: Arc::new(ElectorCallbacks::default()),
            status: Arc::new(RwLock::new(ElectorStatus::default())),
            mailbox,
            inbox: Mutex::new(Some(inbox)),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn coordinator(&self) -> &Arc<CampaignCoordinator> {
        &self.coordinator
    }

    /// Register the campaign outcome notification
    pub fn on_campaign_result<F>(&self, handler: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        *self
            .callbacks
            .campaign_result
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Register the lease renewal failure notification
    pub fn on_keep_alive_failure<F>(&self, handler: F)
    where
        F: Fn(&ElectionError) + Send + Sync + 'static,
    {
        *self
            .callbacks
            .keep_alive_failure
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    fn status(&self) -> ElectorStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ElectorState {
        self.status().state
    }

    pub fn is_leader(&self) -> bool {
        self.state() == ElectorState::Leading
    }

    pub fn retry_timer_active(&self) -> bool {
        self.status().retry_timer_active
    }

    /// Lease currently backing our leadership
    pub fn lease(&self) -> Option<LeaseId> {
        self.status().lease
    }

    /// Start the coordinator, then campaign once unless a leader is already known.
    ///
    /// Calling `start` again after a successful start is a no-op. A stopped
    /// elector cannot be started again.
    pub async fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ElectionError::Stopped(
                self.coordinator.params().leader_key().to_string(),
            ));
        }

        let mailbox = self.mailbox.clone();
        self.coordinator.set_campaign_trigger(move || {
            let _ = mailbox.send(ElectorMessage::Campaign { reply: None });
        });

        self.coordinator.start().await?;

        let inbox = match self
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(inbox) => inbox,
            None => {
                debug!(
                    "Elector for {} already started",
                    self.coordinator.params().leader_key()
                );
                return Ok(());
            }
        };

        let actor = CampaignActor {
            client: self.coordinator.client().clone(),
            coordinator: self.coordinator.clone(),
            callbacks: self.callbacks.clone(),
            status: self.status.clone(),
            mailbox: self.mailbox.clone(),
            retry_deadline: None,
            keep_alive: None,
        };
        actor.set_state(ElectorState::Campaigning);
        tokio::spawn(actor.run(inbox));

        if self.coordinator.leader().is_none() {
            self.campaign_leader().await;
        }

        Ok(())
    }

    /// Attempt to acquire the leader key. Queued behind any attempt in flight;
    /// returns false before `start` and once the elector is stopped.
    pub async fn campaign_leader(&self) -> bool {
        let started = self
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none();
        if !started {
            debug!(
                "Elector for {} not started, campaign ignored",
                self.coordinator.params().leader_key()
            );
            return false;
        }

        let (reply, outcome) = oneshot::channel();
        if self
            .mailbox
            .send(ElectorMessage::Campaign { reply: Some(reply) })
            .is_err()
        {
            return false;
        }

        outcome.await.unwrap_or(false)
    }

    /// Request a campaign without waiting for its outcome
    pub fn trigger_campaign(&self) {
        let _ = self.mailbox.send(ElectorMessage::Campaign { reply: None });
    }

    /// Stop the retry timer, cancel the keepalive task and stop the coordinator
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.mailbox.send(ElectorMessage::Stop);
        self.coordinator.stop();
    }
}

impl Drop for LeaderElector {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CampaignActor {
    client: Arc<dyn CoordinationClient>,
    coordinator: Arc<CampaignCoordinator>,
    callbacks: Arc<ElectorCallbacks>,
    status: Arc<RwLock<ElectorStatus>>,
    mailbox: mpsc::UnboundedSender<ElectorMessage>,
    retry_deadline: Option<Instant>,
    keep_alive: Option<KeepAliveTask>,
}

struct KeepAliveTask {
    lease: LeaseId,
    handle: JoinHandle<()>,
}

async fn retry_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl CampaignActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<ElectorMessage>) {
        loop {
            let message = tokio::select! {
                biased;
                message = inbox.recv() => message.unwrap_or(ElectorMessage::Stop),
                _ = retry_timer(self.retry_deadline) => ElectorMessage::RetryTimerFired,
            };

            match message {
                ElectorMessage::Campaign { reply } => {
                    let won = self.campaign().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(won);
                    }
                }
                ElectorMessage::RetryTimerFired => {
                    self.stop_retry_timer();
                    debug!("[{}] retry timer fired", self.purpose());
                    self.campaign().await;
                }
                ElectorMessage::KeepAliveFailed { lease, error } => {
                    self.handle_keep_alive_failure(lease, error);
                }
                ElectorMessage::Stop => {
                    self.stop_retry_timer();
                    self.cancel_keep_alive().await;
                    self.set_state(ElectorState::Idle);
                    info!("[{}] elector stopped", self.purpose());
                    break;
                }
            }
        }
    }

    fn purpose(&self) -> &str {
        self.coordinator.params().purpose()
    }

    fn update_status(&self, update: impl FnOnce(&mut ElectorStatus)) {
        update(&mut self.status.write().unwrap_or_else(PoisonError::into_inner));
    }

    fn state(&self) -> ElectorState {
        self.status.read().unwrap_or_else(PoisonError::into_inner).state
    }

    fn set_state(&self, state: ElectorState) {
        self.update_status(|status| status.state = state);
    }

    fn restart_retry_timer(&mut self) {
        let interval = retry_interval(self.coordinator.params().lease_ttl());
        self.retry_deadline = Some(Instant::now() + interval);
        self.update_status(|status| status.retry_timer_active = true);
    }

    fn stop_retry_timer(&mut self) {
        self.retry_deadline = None;
        self.update_status(|status| status.retry_timer_active = false);
    }

    /// Abort the renewal task and wait until it is gone
    async fn cancel_keep_alive(&mut self) {
        if let Some(task) = self.keep_alive.take() {
            task.handle.abort();
            let _ = task.handle.await;
            debug!("[{}] keepalive for lease {} cancelled", self.purpose(), task.lease);
        }
        self.update_status(|status| status.lease = None);
    }

    fn start_keep_alive(&mut self, lease: LeaseId) {
        let cadence = keep_alive_cadence(self.coordinator.params().lease_ttl());
        let handle = tokio::spawn(keep_alive_loop(
            self.client.clone(),
            self.mailbox.clone(),
            lease,
            cadence,
        ));

        self.keep_alive = Some(KeepAliveTask { lease, handle });
        self.update_status(|status| status.lease = Some(lease));
        debug!(
            "[{}] keepalive for lease {} every {:?}",
            self.purpose(),
            lease,
            cadence
        );
    }

    fn notify_campaign_result(&self, is_leader: bool) {
        if let Some(handler) = self.callbacks.campaign_result() {
            handler(is_leader);
        }
    }

    /// Tell the application it is backup, unless the cached leader is this node
    fn try_switch_to_backup(&self) {
        if self.callbacks.campaign_result().is_none() {
            return;
        }
        if self.coordinator.is_self_leader() {
            debug!(
                "[{}] cached leader is self, no backup notification",
                self.purpose()
            );
            return;
        }
        self.notify_campaign_result(false);
    }

    async fn campaign(&mut self) -> bool {
        let coordinator = self.coordinator.clone();
        let params = coordinator.params();
        let key = params.leader_key();

        if self.state() == ElectorState::Leading && coordinator.is_self_leader() {
            debug!("[{}] already leading {}, skip campaign", params.purpose(), key);
            return true;
        }
        if self.state() != ElectorState::Leading {
            self.set_state(ElectorState::Campaigning);
        }

        info!(
            "[{}] campaign for {} as {}",
            params.purpose(),
            key,
            params.member().member_id()
        );

        let lease = match self.client.lease_grant(params.lease_ttl()).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("[{}] lease grant for {} failed: {}", params.purpose(), key, e);
                self.try_switch_to_backup();
                self.restart_retry_timer();
                return false;
            }
        };

        let outcome = self
            .client
            .create_if_absent(key, params.leader_value().to_vec(), lease)
            .await;

        match outcome {
            Ok(TxnOutcome::Succeeded) => {
                self.cancel_keep_alive().await;
                self.start_keep_alive(lease);
                self.stop_retry_timer();
                self.set_state(ElectorState::Leading);
                info!(
                    "[{}] {} became leader of {} with lease {}",
                    params.purpose(),
                    params.member().member_id(),
                    key,
                    lease
                );
                self.notify_campaign_result(true);
                true
            }
            Ok(TxnOutcome::CompareFailed) => {
                self.stop_retry_timer();

                if self.state() == ElectorState::Leading {
                    // The key exists: only step down once it is seen to belong to someone else
                    let response = self.client.get(key).await;
                    let held_by_self = match &response {
                        Ok(kv) if kv.is_deleted() => Some(false),
                        Ok(kv) => Member::from_key_value(kv)
                            .ok()
                            .map(|member| member.same_identity(params.member())),
                        Err(e) if e.is_key_not_found() => Some(false),
                        Err(_) => None,
                    };
                    coordinator.check_and_update_leader_key(response);

                    match held_by_self {
                        Some(true) => {
                            debug!("[{}] still leader of {}", params.purpose(), key);
                            return true;
                        }
                        None => {
                            warn!(
                                "[{}] holder of {} unknown, keep leading and retry",
                                params.purpose(),
                                key
                            );
                            self.restart_retry_timer();
                            return true;
                        }
                        Some(false) => {}
                    }

                    warn!("[{}] lost leadership of {}", params.purpose(), key);
                    self.cancel_keep_alive().await;
                    self.set_state(ElectorState::Campaigning);
                }

                info!(
                    "[{}] {} is held by another member, wait for vacancy",
                    params.purpose(),
                    key
                );
                self.try_switch_to_backup();
                false
            }
            Err(e) => {
                error!("[{}] campaign transaction on {} failed: {}", params.purpose(), key, e);
                self.restart_retry_timer();
                self.try_switch_to_backup();
                false
            }
        }
    }

    fn handle_keep_alive_failure(&mut self, lease: LeaseId, error: ElectionError) {
        let current = self.keep_alive.as_ref().map(|task| task.lease);
        if current != Some(lease) {
            debug!(
                "[{}] ignore keepalive failure of stale lease {}",
                self.purpose(),
                lease
            );
            return;
        }

        // The renewal task has already exited
        self.keep_alive = None;
        self.update_status(|status| status.lease = None);
        self.set_state(ElectorState::Campaigning);

        warn!(
            "[{}] keepalive of lease {} failed, leadership lost: {}",
            self.purpose(),
            lease,
            error
        );
        if let Some(handler) = self.callbacks.keep_alive_failure() {
            handler(&error);
        }

        self.restart_retry_timer();
    }
}

async fn keep_alive_loop(
    client: Arc<dyn CoordinationClient>,
    mailbox: mpsc::UnboundedSender<ElectorMessage>,
    lease: LeaseId,
    cadence: Duration,
) {
    loop {
        sleep(cadence).await;
        if let Err(error) = client.lease_keep_alive(lease).await {
            let _ = mailbox.send(ElectorMessage::KeepAliveFailed { lease, error });
            return;
        }
    }
}
