//! Routing actor
//!
//! The hub owns the registered session set and both name indices. Every
//! mutation happens on the hub task; other tasks talk to it through
//! [`HubHandle`], which turns calls into typed events on a bounded channel.
//! The presence list and the registered count are also published through
//! [`HubHandle`] so that admission control and snapshots never wait on the loop.

use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::ServerConfig;
use crate::constants::{HUB_EVENT_QUEUE_CAPACITY, STATS_IDLE_THRESHOLD_SECS};
use crate::core::message::Message;
use crate::core::session::{Session, SessionId};
use crate::error::{Result, RustyChatError};

/// Connection statistics for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub ceiling: usize,
    pub named_users: usize,
}

enum HubEvent {
    Register {
        session: Arc<Session>,
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Unregister {
        session: Arc<Session>,
    },
    Broadcast {
        message: Message,
    },
    SendDirected {
        from: Arc<Session>,
        to: String,
        message: Message,
    },
    Stats {
        reply: oneshot::Sender<ConnectionStats>,
    },
}

/// A frame queued for fan-out. Presence snapshots are built when they are
/// sent so that they reflect evictions made by earlier frames.
enum Outgoing {
    Message(Message),
    Presence,
}

/// State published by the hub for readers outside the loop
struct Published {
    users: RwLock<Vec<String>>,
    registered: AtomicUsize,
}

struct HubSettings {
    max_connections: usize,
    cleanup_interval: Duration,
    idle_timeout: Duration,
    restart_delay: Duration,
}

pub struct Hub {
    events: mpsc::Receiver<HubEvent>,
    shutdown: watch::Receiver<bool>,
    published: Arc<Published>,
    settings: HubSettings,
    sessions: HashMap<SessionId, Arc<Session>>,
    names: HashMap<SessionId, String>,
    by_name: HashMap<String, SessionId>,
}

impl Hub {
    pub fn new(config: &ServerConfig) -> (Self, HubHandle) {
        let (events_tx, events) = mpsc::channel(HUB_EVENT_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let published = Arc::new(Published {
            users: RwLock::new(Vec::new()),
            registered: AtomicUsize::new(0),
        });

        let hub = Self {
            events,
            shutdown,
            published: published.clone(),
            settings: HubSettings {
                max_connections: config.max_connections,
                cleanup_interval: config.cleanup_interval,
                idle_timeout: config.idle_timeout,
                restart_delay: config.hub_restart_delay,
            },
            sessions: HashMap::new(),
            names: HashMap::new(),
            by_name: HashMap::new(),
        };

        let handle = HubHandle {
            events: events_tx,
            published,
            shutdown: Arc::new(shutdown_tx),
            max_connections: config.max_connections,
        };

        (hub, handle)
    }

    /// Create a hub and run it on its own task
    pub fn spawn(config: &ServerConfig) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(config);
        let task = tokio::spawn(hub.run());
        (handle, task)
    }

    /// Run the event loop until shutdown, restarting it after outer failures
    pub async fn run(mut self) {
        info!("Hub started");
        loop {
            match self.event_loop().await {
                Ok(()) => break,
                Err(e) => {
                    error!(
                        "Hub event loop failed: {}; restarting in {:?}",
                        e, self.settings.restart_delay
                    );
                    tokio::time::sleep(self.settings.restart_delay).await;
                    self.rebuild_indices();
                }
            }
        }
        info!("Hub stopped");
    }

    async fn event_loop(&mut self) -> Result<()> {
        let period = self.settings.cleanup_interval;
        let mut cleanup = interval_at(Instant::now() + period, period);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *self.shutdown.borrow() {
                info!("Hub stopping...");
                return Ok(());
            }

            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                _ = cleanup.tick() => self.cleanup_idle_sessions(Instant::now()),
                event = self.events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => {
                        info!("All hub handles dropped");
                        return Ok(());
                    }
                },
            }

            self.verify_consistency()?;
        }
    }

    fn dispatch(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register {
                session,
                name,
                reply,
            } => {
                let result = self.register(&session, &name);
                if let Err(e) = &result {
                    debug!("Registration of session {} as {} refused: {}", session.id(), name, e);
                }
                // The joining pump may already be gone
                let _ = reply.send(result);
            }
            HubEvent::Unregister { session } => self.unregister(&session),
            HubEvent::Broadcast { message } => self.broadcast(message),
            HubEvent::SendDirected { from, to, message } => {
                if let Err(e) = self.send_directed(&from, &to, &message) {
                    warn!(
                        "[PRIVATE_MSG] Routing error: from={} to={} error={}",
                        from.display_name(),
                        to,
                        e
                    );
                    from.send_error(e.to_string());
                }
            }
            HubEvent::Stats { reply } => {
                let _ = reply.send(self.connection_stats(Instant::now()));
            }
        }
    }

    fn register(&mut self, session: &Arc<Session>, name: &str) -> Result<()> {
        let name = name.trim();
        let id = session.id();

        if session.is_closed() {
            return Err(RustyChatError::ConnectionClosed);
        }
        if let Some(holder) = self.by_name.get(name) {
            if *holder != id {
                return Err(RustyChatError::NameTaken(name.to_string()));
            }
        }

        match self.names.get(&id).cloned() {
            Some(previous) if previous == name => Ok(()),
            Some(previous) => {
                if self.by_name.get(&previous) == Some(&id) {
                    self.by_name.remove(&previous);
                }
                self.by_name.insert(name.to_string(), id);
                self.names.insert(id, name.to_string());
                session.set_display_name(name);
                self.publish_presence();

                info!("Client renamed: {} -> {}", previous, name);
                self.broadcast_all([
                    Outgoing::Message(Message::system(format!(
                        "{} is now known as {}",
                        previous, name
                    ))),
                    Outgoing::Presence,
                ]);
                Ok(())
            }
            None if self.sessions.len() >= self.settings.max_connections => {
                warn!(
                    "Registration of {} refused: server at capacity ({} clients)",
                    name,
                    self.sessions.len()
                );
                Err(RustyChatError::AtCapacity)
            }
            None => {
                self.sessions.insert(id, session.clone());
                self.names.insert(id, name.to_string());
                self.by_name.insert(name.to_string(), id);
                session.set_display_name(name);
                self.publish_presence();

                info!(
                    "Client registered: {} ({} connected)",
                    name,
                    self.sessions.len()
                );
                self.broadcast_all([
                    Outgoing::Message(Message::system(format!("{} has joined the chat", name))),
                    Outgoing::Presence,
                ]);
                Ok(())
            }
        }
    }

    fn unregister(&mut self, session: &Session) {
        match self.remove_session(session.id()) {
            Some(name) => {
                info!(
                    "Client unregistered: {} ({} connected)",
                    name,
                    self.sessions.len()
                );
                let departure = Self::departure(&name);
                self.broadcast_all(departure);
            }
            None => debug!("Session {} was not registered", session.id()),
        }
    }

    fn broadcast(&mut self, message: Message) {
        self.broadcast_all([Outgoing::Message(message)]);
    }

    /// Fan frames out to every registered session without waiting on any of them.
    ///
    /// A session whose queue is full or closed is unregistered on the spot; its
    /// leave notice joins the back of the pending list rather than recursing.
    fn broadcast_all(&mut self, outgoing: impl IntoIterator<Item = Outgoing>) {
        let mut pending: VecDeque<Outgoing> = outgoing.into_iter().collect();

        while let Some(next) = pending.pop_front() {
            let message = match next {
                Outgoing::Message(message) => message,
                Outgoing::Presence => self.presence_message(),
            };

            let frame = match message.to_json() {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Failed to serialize {} broadcast: {}", message.kind, e);
                    continue;
                }
            };

            let mut evicted = Vec::new();
            for (id, session) in &self.sessions {
                if let Err(e) = session.try_send(frame.clone()) {
                    warn!(
                        "Evicting session {} ({}) during broadcast: {}",
                        id,
                        self.names.get(id).map(String::as_str).unwrap_or_default(),
                        e
                    );
                    evicted.push(*id);
                }
            }

            for id in evicted {
                if let Some(name) = self.remove_session(id) {
                    pending.extend(Self::departure(&name));
                }
            }
        }
    }

    fn send_directed(&self, from: &Session, to: &str, message: &Message) -> Result<()> {
        let recipient = self
            .by_name
            .get(to)
            .and_then(|id| self.sessions.get(id))
            .ok_or_else(|| RustyChatError::RecipientNotFound(to.to_string()))?;

        let frame = message.to_json()?;

        if let Err(e) = recipient.try_send(frame.clone()) {
            warn!(
                "[PRIVATE_MSG] Delivery failed: from={} to={} error={}",
                from.display_name(),
                to,
                e
            );
            return Err(RustyChatError::RecipientUnreachable(to.to_string()));
        }
        info!(
            "[PRIVATE_MSG] Delivered: from={} to={}",
            from.display_name(),
            to
        );

        if let Err(e) = from.try_send(frame) {
            warn!(
                "[PRIVATE_MSG] Echo failed (non-critical): from={} to={} error={}",
                from.display_name(),
                to,
                e
            );
        }
        Ok(())
    }

    fn cleanup_idle_sessions(&mut self, now: Instant) {
        let idle_timeout = self.settings.idle_timeout;
        let idle: Vec<Arc<Session>> = self
            .sessions
            .values()
            .filter(|session| session.idle_for(now) > idle_timeout)
            .cloned()
            .collect();

        for session in &idle {
            info!(
                "Removing idle client: {} (idle for {:?})",
                session.display_name(),
                session.idle_for(now)
            );
            self.unregister(session);
            session.close_transport();
        }

        if !idle.is_empty() {
            info!("Cleaned up {} idle connections", idle.len());
        }
    }

    fn connection_stats(&self, now: Instant) -> ConnectionStats {
        let threshold = Duration::from_secs(STATS_IDLE_THRESHOLD_SECS);
        let total = self.sessions.len();
        let idle = self
            .sessions
            .values()
            .filter(|session| session.idle_for(now) > threshold)
            .count();

        ConnectionStats {
            total,
            active: total - idle,
            idle,
            ceiling: self.settings.max_connections,
            named_users: self.names.len(),
        }
    }

    /// Drop a session from all three indices and close its queue.
    /// Returns the name it was registered under, or `None` if it was not registered.
    fn remove_session(&mut self, id: SessionId) -> Option<String> {
        let session = self.sessions.remove(&id)?;
        if !session.close_outbound() {
            debug!("Outbound queue for session {} was already closed", id);
        }

        let name = self.names.remove(&id).unwrap_or_default();
        if self.by_name.get(&name) == Some(&id) {
            self.by_name.remove(&name);
        }
        self.publish_presence();
        Some(name)
    }

    fn departure(name: &str) -> Vec<Outgoing> {
        if name.is_empty() {
            return Vec::new();
        }
        vec![
            Outgoing::Message(Message::system(format!("{} has left the chat", name))),
            Outgoing::Presence,
        ]
    }

    fn publish_presence(&self) {
        let mut users: Vec<String> = self.names.values().cloned().collect();
        users.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b)));

        *self
            .published
            .users
            .write()
            .unwrap_or_else(PoisonError::into_inner) = users;
        self.published
            .registered
            .store(self.sessions.len(), Ordering::Release);
    }

    fn presence_message(&self) -> Message {
        let users = self
            .published
            .users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Message::user_list(users)
    }

    fn verify_consistency(&self) -> Result<()> {
        if self.names.len() != self.sessions.len() {
            return Err(RustyChatError::HubInconsistent(format!(
                "{} sessions but {} names",
                self.sessions.len(),
                self.names.len()
            )));
        }
        if let Some(id) = self.names.keys().find(|id| !self.sessions.contains_key(*id)) {
            return Err(RustyChatError::HubInconsistent(format!(
                "name held by unregistered session {}",
                id
            )));
        }
        if let Some((name, _)) = self
            .by_name
            .iter()
            .find(|(name, id)| self.names.get(*id) != Some(*name))
        {
            return Err(RustyChatError::HubInconsistent(format!(
                "lookup entry '{}' has no matching session",
                name
            )));
        }
        Ok(())
    }

    /// Rebuild both name indices from the registered session set
    fn rebuild_indices(&mut self) {
        let sessions = &self.sessions;
        self.names.retain(|id, _| sessions.contains_key(id));
        for (id, session) in sessions {
            self.names
                .entry(*id)
                .or_insert_with(|| session.display_name());
        }

        self.by_name = self
            .names
            .iter()
            .map(|(id, name)| (name.clone(), *id))
            .collect();
        self.publish_presence();

        warn!(
            "Hub routing indices rebuilt: {} sessions, {} names",
            self.sessions.len(),
            self.by_name.len()
        );
    }
}

/// Cloneable front door to a running [`Hub`]
#[derive(Clone)]
pub struct HubHandle {
    events: mpsc::Sender<HubEvent>,
    published: Arc<Published>,
    shutdown: Arc<watch::Sender<bool>>,
    max_connections: usize,
}

impl HubHandle {
    async fn send(&self, event: HubEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| RustyChatError::HubUnavailable)
    }

    /// Register a session under a display name and wait for the hub to accept it
    pub async fn register(&self, session: &Arc<Session>, name: &str) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(HubEvent::Register {
            session: session.clone(),
            name: name.to_string(),
            reply,
        })
        .await?;
        response.await.map_err(|_| RustyChatError::HubUnavailable)?
    }

    /// Remove a session; a no-op if it is not registered
    pub async fn unregister(&self, session: &Arc<Session>) -> Result<()> {
        self.send(HubEvent::Unregister {
            session: session.clone(),
        })
        .await
    }

    pub async fn broadcast(&self, message: Message) -> Result<()> {
        self.send(HubEvent::Broadcast { message }).await
    }

    /// Route a private message. Delivery failures come back to `from` as an error frame.
    pub async fn send_directed(&self, from: &Arc<Session>, to: &str, message: Message) -> Result<()> {
        self.send(HubEvent::SendDirected {
            from: from.clone(),
            to: to.to_string(),
            message,
        })
        .await
    }

    pub async fn connection_stats(&self) -> Result<ConnectionStats> {
        let (reply, response) = oneshot::channel();
        self.send(HubEvent::Stats { reply }).await?;
        response.await.map_err(|_| RustyChatError::HubUnavailable)
    }

    pub fn can_accept_new_connection(&self) -> bool {
        self.client_count() < self.max_connections
    }

    pub fn client_count(&self) -> usize {
        self.published.registered.load(Ordering::Acquire)
    }

    /// Snapshot of the presence list
    pub fn connected_users(&self) -> Vec<String> {
        self.published
            .users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop the event loop. Sessions are left for the server to close.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
