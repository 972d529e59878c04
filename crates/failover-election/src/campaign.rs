//! Local view of the current holder of one leader key

use crate::config::SessionConfig;
use crate::error::Result;
use crate::member::Member;
use crate::session::{ElectionSession, WatchStrategy};
use crate::store::{CoordinationClient, KeyValue, Watch, WatchEvent, WatchTarget};
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Invoked when the leader key is observed vacant
pub type CampaignTrigger = Arc<dyn Fn() + Send + Sync>;

/// Fixed inputs of a campaign for one leader key
#[derive(Debug, Clone)]
pub struct CampaignParameters {
    leader_key: String,
    leader_value: Vec<u8>,
    purpose: String,
    lease_ttl: u64,
    member: Member,
}

impl CampaignParameters {
    pub fn new<K: Into<String>, P: Into<String>>(
        leader_key: K,
        purpose: P,
        lease_ttl: u64,
        member: Member,
    ) -> Result<Self> {
        Ok(Self {
            leader_key: leader_key.into(),
            leader_value: member.encode()?,
            purpose: purpose.into(),
            lease_ttl,
            member,
        })
    }

    pub fn leader_key(&self) -> &str {
        &self.leader_key
    }

    /// Encoded form of [`Self::member`], written to the leader key on success
    pub fn leader_value(&self) -> &[u8] {
        &self.leader_value
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    /// Lease TTL in seconds
    pub fn lease_ttl(&self) -> u64 {
        self.lease_ttl
    }

    /// This node's candidacy
    pub fn member(&self) -> &Member {
        &self.member
    }
}

/// Cache and watch handling behind a [`CampaignCoordinator`]
struct LeaderWatch {
    params: Arc<CampaignParameters>,
    leader: RwLock<Option<Member>>,
    trigger: RwLock<Option<CampaignTrigger>>,
}

impl LeaderWatch {
    fn leader(&self) -> Option<Member> {
        self.leader
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_leader(&self, leader: Option<Member>) {
        *self.leader.write().unwrap_or_else(PoisonError::into_inner) = leader;
    }

    fn trigger_campaign(&self) {
        let trigger = self
            .trigger
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match trigger {
            Some(trigger) => trigger(),
            None => debug!(
                "No campaign trigger registered for {}",
                self.params.leader_key()
            ),
        }
    }

    fn vacate(&self) {
        self.set_leader(None);
        self.trigger_campaign();
    }

    fn check_and_update(&self, response: Result<KeyValue>) -> bool {
        let key = self.params.leader_key();
        let purpose = self.params.purpose();

        let kv = match response {
            Ok(kv) => kv,
            Err(e) if e.is_key_not_found() => {
                info!("[{}] leader key {} not found, trigger campaign", purpose, key);
                self.vacate();
                return false;
            }
            Err(e) => {
                // Ambiguous failure: keep whatever we knew
                warn!("[{}] failed to read leader key {}: {}", purpose, key, e);
                return false;
            }
        };

        if kv.is_deleted() {
            info!(
                "[{}] leader key {} vacated at revision {}, trigger campaign",
                purpose, key, kv.mod_revision
            );
            self.vacate();
            return false;
        }

        match Member::from_key_value(&kv) {
            Ok(member) => {
                info!(
                    "[{}] leader of {} is {} (revision {}, lease {})",
                    purpose,
                    key,
                    member.member_id(),
                    member.sequence(),
                    member.lease_id()
                );
                self.set_leader(Some(member));
                true
            }
            Err(e) => {
                warn!("[{}] malformed leader record at {}: {}", purpose, key, e);
                false
            }
        }
    }
}

#[async_trait]
impl WatchStrategy for LeaderWatch {
    async fn create_watch(&self, client: &dyn CoordinationClient) -> Result<Option<Watch>> {
        let target = WatchTarget::Key(self.params.leader_key().to_string());
        Ok(Some(client.watch(target).await?))
    }

    async fn on_watch_event(&self, event: WatchEvent) {
        self.check_and_update(Ok(event.kv));
    }

    async fn on_cluster_recover(&self) {
        info!(
            "[{}] cluster recovered, reset leader of {} and trigger campaign",
            self.params.purpose(),
            self.params.leader_key()
        );
        self.vacate();
    }
}

/// Tracks the single current leader for one leader key and signals when the
/// role becomes vacant.
pub struct CampaignCoordinator {
    params: Arc<CampaignParameters>,
    state: Arc<LeaderWatch>,
    session: ElectionSession,
}

impl CampaignCoordinator {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        params: CampaignParameters,
        config: SessionConfig,
    ) -> Self {
        let params = Arc::new(params);
        let state = Arc::new(LeaderWatch {
            params: params.clone(),
            leader: RwLock::new(None),
            trigger: RwLock::new(None),
        });
        let session = ElectionSession::new(
            format!("{}:{}", params.purpose(), params.leader_key()),
            client,
            state.clone(),
            config,
        );

        Self {
            params,
            state,
            session,
        }
    }

    pub fn params(&self) -> &CampaignParameters {
        &self.params
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        self.session.client()
    }

    /// Register the callback fired whenever the key is observed vacant.
    /// A later registration replaces the earlier one.
    pub fn set_campaign_trigger<F>(&self, trigger: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self
            .state
            .trigger
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(trigger));
    }

    /// Subscribe to the leader key and start the health loop
    pub async fn start(&self) -> Result<bool> {
        self.session.start().await
    }

    pub fn stop(&self) {
        self.session.stop();
    }

    pub fn is_running(&self) -> bool {
        self.session.is_running()
    }

    /// Cached leader, no I/O
    pub fn leader(&self) -> Option<Member> {
        self.state.leader()
    }

    /// Whether the cached leader is this node
    pub fn is_self_leader(&self) -> bool {
        self.leader()
            .is_some_and(|leader| leader.same_identity(self.params.member()))
    }

    /// Cached leader, or a synchronous read of the leader key when nothing is cached
    pub async fn fetch_leader(&self) -> Option<Member> {
        if let Some(leader) = self.leader() {
            return Some(leader);
        }

        let response = self.session.client().get(self.params.leader_key()).await;
        self.check_and_update_leader_key(response);
        self.leader()
    }

    /// Apply a read of the leader key to the cache.
    ///
    /// Returns true when a valid leader is cached afterwards. A missing or
    /// deleted record clears the cache and fires the campaign trigger; any other
    /// error leaves the cache untouched. Every valid observation overwrites the
    /// cache, even when identical to the previous one.
    pub fn check_and_update_leader_key(&self, response: Result<KeyValue>) -> bool {
        self.state.check_and_update(response)
    }
}
