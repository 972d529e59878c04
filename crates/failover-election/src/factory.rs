//! Builds electors and watchers that share one coordination client and config

use crate::campaign::{CampaignCoordinator, CampaignParameters};
use crate::config::{FailoverConfig, SessionConfig};
use crate::elector::LeaderElector;
use crate::error::{ElectionError, Result};
use crate::member::Member;
use crate::store::CoordinationClient;
use crate::watcher::GroupWatcher;
use std::sync::Arc;
use tracing::info;

pub struct ElectionFactory {
    client: Arc<dyn CoordinationClient>,
    config: FailoverConfig,
    session_config: SessionConfig,
}

impl ElectionFactory {
    /// Fails when failover is disabled, or when the config has no member id or
    /// a lease TTL below the minimum
    pub fn new(client: Arc<dyn CoordinationClient>, config: FailoverConfig) -> Result<Self> {
        if !config.enable {
            return Err(ElectionError::configuration(
                "failover is disabled, set failover.enable to build electors",
            ));
        }
        config.validate(true)?;
        info!(
            "Election factory for {} on {} (lease ttl {}s)",
            config.member_id, config.cluster_url, config.lease_ttl
        );

        Ok(Self {
            client,
            config,
            session_config: SessionConfig::default(),
        })
    }

    /// Override the health loop timing of every session built afterwards
    pub fn with_session_config(mut self, session_config: SessionConfig) -> Self {
        self.session_config = session_config;
        self
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    /// Join a watch directory and a role name into a leader key
    pub fn leader_key(watch_dir: &str, role: &str) -> String {
        format!(
            "{}/{}",
            watch_dir.trim_end_matches('/'),
            role.trim_start_matches('/')
        )
    }

    /// Elector campaigning for `leader_key` as the configured member
    pub fn create_leader_elector<K, P>(
        &self,
        leader_key: K,
        purpose: P,
        member_config: Vec<u8>,
    ) -> Result<LeaderElector>
    where
        K: Into<String>,
        P: Into<String>,
    {
        let member = Member::new(self.config.member_id.clone(), member_config);
        let params = CampaignParameters::new(leader_key, purpose, self.config.lease_ttl, member)?;
        info!(
            "Create leader elector for {} ({}) as {}",
            params.leader_key(),
            params.purpose(),
            self.config.member_id
        );

        let coordinator =
            CampaignCoordinator::new(self.client.clone(), params, self.session_config);
        Ok(LeaderElector::new(Arc::new(coordinator)))
    }

    pub fn create_group_watcher<T: Into<String>>(&self, watch_dir: T) -> GroupWatcher {
        GroupWatcher::new(self.client.clone(), watch_dir, self.session_config)
    }
}
