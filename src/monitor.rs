//! Group view monitor.
//!
//! Keeps one admin session per watched cluster, always to the current
//! primary, and turns the notifications it pushes into
//! [`ViewChangeHandler::on_group_view_change`] calls. Each session's
//! notification stream is forwarded by a small task into one shared channel,
//! so a single bounded wait covers every watched cluster and newly watched
//! clusters are picked up on the next cycle.
//!
//! Reconnection to a cluster is attempted at most once per
//! `min_reconnect_interval`. A fresh connection always triggers a refresh, so
//! changes that happened while disconnected are not missed. When the session
//! turns out not to be on the primary it is dropped and re-established on the
//! next cycle.

use crate::config::MonitorConfig;
use crate::db::{AdminConnector, AdminSession, GroupNotification, GroupStatus, NotificationKind};
use crate::error::Result;
use crate::probe::connect_to_primary;
use crate::types::{ClusterRef, MemberInstance, MemberRole, MemberState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Receives group view changes.
#[async_trait]
pub trait ViewChangeHandler: Send + Sync {
    /// `group` is the primary's current view; `view_changed` is set when the
    /// view epoch differs from the last one seen.
    async fn on_group_view_change(
        &self,
        cluster: &ClusterRef,
        group: &GroupStatus,
        view_changed: bool,
    ) -> Result<()>;
}

#[derive(Debug)]
enum SessionEvent {
    Notification(GroupNotification),
    Disconnected,
}

#[derive(Debug)]
struct Tagged {
    key: String,
    generation: u64,
    event: SessionEvent,
}

struct Watched {
    cluster: ClusterRef,
    members: Vec<MemberInstance>,
    session: Option<Arc<dyn AdminSession>>,
    forwarder: Option<JoinHandle<()>>,
    generation: u64,
    /// Address of the primary the session is connected to.
    primary: Option<String>,
    view_id: Option<String>,
    last_attempt: Option<Instant>,
    needs_refresh: bool,
}

impl Watched {
    fn close(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.session = None;
        self.primary = None;
    }
}

/// Tracks the primary of every watched cluster.
pub struct GroupMonitor {
    connector: Arc<dyn AdminConnector>,
    config: MonitorConfig,
    clusters: Mutex<HashMap<String, Watched>>,
    events_tx: mpsc::UnboundedSender<Tagged>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Tagged>>,
}

impl GroupMonitor {
    pub fn new(connector: Arc<dyn AdminConnector>, config: MonitorConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            config,
            clusters: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        }
    }

    /// Start watching `cluster`, or refresh its member list if already watched.
    pub fn watch(&self, cluster: &ClusterRef, members: Vec<MemberInstance>) {
        let mut clusters = self.clusters.lock();
        match clusters.get_mut(&cluster.key()) {
            Some(watched) => {
                watched.cluster = cluster.clone();
                watched.members = members;
            }
            None => {
                info!(cluster = %cluster, "Watching group view");
                clusters.insert(
                    cluster.key(),
                    Watched {
                        cluster: cluster.clone(),
                        members,
                        session: None,
                        forwarder: None,
                        generation: 0,
                        primary: None,
                        view_id: None,
                        last_attempt: None,
                        needs_refresh: false,
                    },
                );
            }
        }
    }

    /// Replace the member list of a watched cluster.
    pub fn update_members(&self, cluster: &ClusterRef, members: Vec<MemberInstance>) -> bool {
        match self.clusters.lock().get_mut(&cluster.key()) {
            Some(watched) => {
                watched.members = members;
                true
            }
            None => false,
        }
    }

    /// Stop watching `cluster` and close its session.
    pub fn unwatch(&self, cluster: &ClusterRef) {
        if let Some(mut watched) = self.clusters.lock().remove(&cluster.key()) {
            watched.close();
            info!(cluster = %cluster, "Stopped watching group view");
        }
    }

    pub fn is_watching(&self, cluster: &ClusterRef) -> bool {
        self.clusters.lock().contains_key(&cluster.key())
    }

    /// Address of the primary the monitor is connected to for `cluster`.
    pub fn connected_primary(&self, cluster: &ClusterRef) -> Option<String> {
        self.clusters
            .lock()
            .get(&cluster.key())
            .and_then(|w| w.session.as_ref().and(w.primary.clone()))
    }

    /// Run until `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        handler: Arc<dyn ViewChangeHandler>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Group view monitor started");
        loop {
            tokio::select! {
                _ = self.poll_once(handler.as_ref()) => {}
                _ = shutdown.recv() => {
                    info!("Group view monitor shutting down");
                    break;
                }
            }
        }

        for watched in self.clusters.lock().values_mut() {
            watched.close();
        }
    }

    /// One monitor cycle: connect, wait for notifications, dispatch.
    pub async fn poll_once(&self, handler: &dyn ViewChangeHandler) {
        self.connect_pending().await;

        // key -> view changed
        let mut refresh: BTreeMap<String, bool> = BTreeMap::new();
        {
            let mut clusters = self.clusters.lock();
            for (key, watched) in clusters.iter_mut() {
                if watched.needs_refresh {
                    watched.needs_refresh = false;
                    refresh.insert(key.clone(), false);
                }
            }
        }

        let mut received = Vec::new();
        {
            let mut rx = self.events_rx.lock().await;
            if refresh.is_empty() {
                if let Ok(Some(event)) = timeout(self.config.poll_interval, rx.recv()).await {
                    received.push(event);
                }
            }
            while let Ok(event) = rx.try_recv() {
                received.push(event);
            }
        }

        {
            let mut clusters = self.clusters.lock();
            for tagged in received {
                let Some(watched) = clusters.get_mut(&tagged.key) else {
                    continue;
                };
                if watched.generation != tagged.generation || watched.session.is_none() {
                    continue;
                }
                match tagged.event {
                    SessionEvent::Disconnected => {
                        debug!(cluster = %tagged.key, "Monitor session lost");
                        watched.close();
                    }
                    SessionEvent::Notification(n) => {
                        let changed = n.kind == NotificationKind::ViewChanged
                            && n.view_id.is_some()
                            && n.view_id != watched.view_id;
                        let entry = refresh.entry(tagged.key.clone()).or_insert(false);
                        *entry |= changed;
                    }
                }
            }
        }

        for (key, view_changed) in refresh {
            self.refresh(&key, view_changed, handler).await;
        }
    }

    async fn connect_pending(&self) {
        let now = Instant::now();
        let due: Vec<(String, Vec<MemberInstance>)> = {
            let mut clusters = self.clusters.lock();
            clusters
                .iter_mut()
                .filter(|(_, w)| w.session.is_none())
                .filter(|(_, w)| {
                    w.last_attempt
                        .map_or(true, |t| now.duration_since(t) >= self.config.min_reconnect_interval)
                })
                .map(|(key, w)| {
                    w.last_attempt = Some(now);
                    (key.clone(), w.members.clone())
                })
                .collect()
        };

        for (key, members) in due {
            let primary = match connect_to_primary(self.connector.as_ref(), &members).await {
                Ok(Some(primary)) => primary,
                Ok(None) => {
                    debug!(cluster = %key, "No primary reachable for monitoring");
                    continue;
                }
                Err(e) => {
                    warn!(cluster = %key, error = %e, "Monitor connection failed");
                    continue;
                }
            };

            let notifications = match primary.session.subscribe_notifications().await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(cluster = %key, error = %e, "Could not subscribe to group notifications");
                    continue;
                }
            };

            let mut clusters = self.clusters.lock();
            let Some(watched) = clusters.get_mut(&key) else {
                continue;
            };
            watched.close();
            watched.generation += 1;
            watched.forwarder = Some(spawn_forwarder(
                key.clone(),
                watched.generation,
                notifications,
                self.events_tx.clone(),
            ));
            watched.primary = Some(primary.member.address());
            watched.session = Some(Arc::from(primary.session));
            watched.needs_refresh = true;
            info!(cluster = %key, primary = %primary.member, "Monitoring primary");
        }
    }

    async fn refresh(&self, key: &str, view_changed: bool, handler: &dyn ViewChangeHandler) {
        let (cluster, session, generation) = {
            let clusters = self.clusters.lock();
            let Some(watched) = clusters.get(key) else {
                return;
            };
            let Some(session) = watched.session.clone() else {
                return;
            };
            (watched.cluster.clone(), session, watched.generation)
        };

        let group = session.describe_group().await;

        let view_changed = {
            let mut clusters = self.clusters.lock();
            let Some(watched) = clusters.get_mut(key) else {
                return;
            };
            if watched.generation != generation {
                return;
            }

            let group = match &group {
                Ok(group) => group,
                Err(e) => {
                    debug!(cluster = %key, error = %e, "Monitor refresh failed");
                    watched.close();
                    return;
                }
            };

            let still_primary = group
                .self_member()
                .map(|own| own.role == MemberRole::Primary && own.state == MemberState::Online)
                .unwrap_or(false);
            if !still_primary {
                info!(cluster = %key, "Monitored member is no longer primary, reconnecting");
                watched.close();
                return;
            }

            let changed = view_changed || group.view_id != watched.view_id;
            watched.view_id = group.view_id.clone();
            changed
        };

        // Lock released before the callback runs.
        if let Ok(group) = group {
            if let Err(e) = handler
                .on_group_view_change(&cluster, &group, view_changed)
                .await
            {
                warn!(cluster = %key, error = %e, "Group view change handler failed");
            }
        }
    }
}

fn spawn_forwarder(
    key: String,
    generation: u64,
    mut notifications: mpsc::UnboundedReceiver<GroupNotification>,
    events: mpsc::UnboundedSender<Tagged>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            let tagged = Tagged {
                key: key.clone(),
                generation,
                event: SessionEvent::Notification(notification),
            };
            if events.send(tagged).is_err() {
                return;
            }
        }
        let _ = events.send(Tagged {
            key,
            generation,
            event: SessionEvent::Disconnected,
        });
    })
}
