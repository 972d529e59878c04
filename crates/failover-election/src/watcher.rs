//! Live map of the leaders of every role under a key prefix

use crate::config::SessionConfig;
use crate::error::Result;
use crate::member::Member;
use crate::session::{ElectionSession, WatchStrategy};
use crate::store::{CoordinationClient, KeyValue, Watch, WatchEvent, WatchTarget};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Notified with the leader key and the member concerned
pub type MemberHandler = Arc<dyn Fn(&str, &Member) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone, Copy)]
enum Dispatch {
    Changed,
    Deleted,
}

impl Dispatch {
    fn label(self) -> &'static str {
        match self {
            Self::Changed => "change",
            Self::Deleted => "delete",
        }
    }
}

struct GroupState {
    watch_dir: String,
    leaders: RwLock<HashMap<String, Member>>,
    change_handlers: RwLock<Vec<MemberHandler>>,
    delete_handlers: RwLock<Vec<MemberHandler>>,
}

impl GroupState {
    fn handlers(&self, dispatch: Dispatch) -> Vec<MemberHandler> {
        let handlers = match dispatch {
            Dispatch::Changed => &self.change_handlers,
            Dispatch::Deleted => &self.delete_handlers,
        };
        handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run every handler in registration order. Handlers are invoked with no
    /// lock held, so they may read the map.
    fn dispatch(&self, dispatch: Dispatch, key: &str, member: &Member) {
        for (index, handler) in self.handlers(dispatch).iter().enumerate() {
            if let Err(e) = handler(key, member) {
                warn!(
                    "{} handler #{} failed for {} ({}): {}",
                    dispatch.label(),
                    index,
                    key,
                    member,
                    e
                );
            }
        }
    }

    fn upsert(&self, kv: &KeyValue) {
        let member = match Member::from_key_value(kv) {
            Ok(member) => member,
            Err(e) => {
                warn!("Skip malformed member record at {}: {}", kv.key, e);
                return;
            }
        };

        debug!("Member of {} changed to {}", kv.key, member);
        self.leaders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kv.key.clone(), member.clone());
        self.dispatch(Dispatch::Changed, &kv.key, &member);
    }

    fn remove(&self, key: &str) {
        let removed = self
            .leaders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);

        match removed {
            Some(member) => {
                debug!("Member {} of {} deleted", member, key);
                self.dispatch(Dispatch::Deleted, key, &member);
            }
            None => debug!("Delete of unknown key {}, nothing to dispatch", key),
        }
    }

    /// Reconcile the map with a full listing of the prefix
    async fn fetch_all(&self, client: &dyn CoordinationClient) -> Result<usize> {
        let records = client.list(&self.watch_dir).await?;

        let stale: Vec<String> = {
            let leaders = self.leaders.read().unwrap_or_else(PoisonError::into_inner);
            leaders
                .keys()
                .filter(|key| !records.iter().any(|kv| &kv.key == *key))
                .cloned()
                .collect()
        };
        for key in &stale {
            self.remove(key);
        }

        for kv in &records {
            self.upsert(kv);
        }

        info!(
            "Fetched {} member records under {} ({} stale removed)",
            records.len(),
            self.watch_dir,
            stale.len()
        );
        Ok(records.len())
    }
}

/// Watch strategy: forwards to [`GroupState`]
struct PrefixWatch {
    state: Arc<GroupState>,
}

#[async_trait]
impl WatchStrategy for PrefixWatch {
    async fn create_watch(&self, client: &dyn CoordinationClient) -> Result<Option<Watch>> {
        let target = WatchTarget::Prefix(self.state.watch_dir.clone());
        Ok(Some(client.watch(target).await?))
    }

    /// Full listing taken after the watch opened. Events queued meanwhile are
    /// applied afterwards, so a change racing with the listing is never lost.
    async fn on_watch_created(&self, client: &dyn CoordinationClient) -> Result<()> {
        self.state.fetch_all(client).await.map(|_| ())
    }

    async fn on_watch_event(&self, event: WatchEvent) {
        if event.kv.is_deleted() {
            self.state.remove(&event.kv.key);
        } else {
            self.state.upsert(&event.kv);
        }
    }

    async fn on_cluster_recover(&self) {
        info!(
            "Cluster recovered, members under {} are reconciled with the new watch",
            self.state.watch_dir
        );
    }
}

/// Observes every leader key under a prefix and notifies subscribers of changes
pub struct GroupWatcher {
    state: Arc<GroupState>,
    session: ElectionSession,
}

impl GroupWatcher {
    pub fn new<T: Into<String>>(
        client: Arc<dyn CoordinationClient>,
        watch_dir: T,
        config: SessionConfig,
    ) -> Self {
        let watch_dir = watch_dir.into();
        let state = Arc::new(GroupState {
            watch_dir: watch_dir.clone(),
            leaders: RwLock::new(HashMap::new()),
            change_handlers: RwLock::new(Vec::new()),
            delete_handlers: RwLock::new(Vec::new()),
        });
        let strategy = Arc::new(PrefixWatch {
            state: state.clone(),
        });

        Self {
            session: ElectionSession::new(format!("group:{}", watch_dir), client, strategy, config),
            state,
        }
    }

    pub fn watch_dir(&self) -> &str {
        &self.state.watch_dir
    }

    pub fn add_change_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &Member) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.state
            .change_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    pub fn add_delete_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &Member) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.state
            .delete_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Subscribe to the prefix and load the records that already exist.
    ///
    /// When the listing fails nothing keeps running and the error is returned.
    pub async fn start(&self) -> Result<bool> {
        self.session.start().await
    }

    pub fn stop(&self) {
        self.session.stop();
    }

    pub fn is_running(&self) -> bool {
        self.session.is_running()
    }

    pub fn leader(&self, key: &str) -> Option<Member> {
        self.state
            .leaders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn all_leaders(&self) -> HashMap<String, Member> {
        self.state
            .leaders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
