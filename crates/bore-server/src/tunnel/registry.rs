//! Process-wide tunnel registry: identifier to live session.
//!
//! This is the single source of truth for routing. Lock order is always the
//! registry first, then a session's own state; nothing here is held across
//! network I/O. Callers get copies ([`TunnelRoute`]), never a session
//! reference that could outlive its teardown.

use super::allocator::{generate_id, is_valid_id};
use super::session::TunnelSession;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// Routing data for one registered tunnel, copied out of the registry.
#[derive(Debug, Clone)]
pub struct TunnelRoute {
    pub id: String,
    /// Address the tunnel's public listener was bound to.
    pub addr: String,
    /// Port the tunnel's public listener was bound to.
    pub port: u16,
    status: mpsc::Sender<String>,
}

impl TunnelRoute {
    /// Host to dial to reach the tunnel's public listener from this process.
    /// Wildcard bind addresses are reached through loopback.
    pub fn upstream_host(&self) -> String {
        match self.addr.parse::<std::net::IpAddr>() {
            Ok(ip) if ip.is_unspecified() && ip.is_ipv6() => "::1".to_string(),
            Ok(ip) if ip.is_unspecified() => "127.0.0.1".to_string(),
            Ok(ip) => ip.to_string(),
            Err(_) if self.addr.is_empty() => "127.0.0.1".to_string(),
            Err(_) => self.addr.clone(),
        }
    }

    /// Best-effort line to the tunnel's status channel.
    pub fn notify(&self, line: String) {
        let _ = self.status.try_send(line);
    }
}

/// Result of a rename attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rename {
    Renamed,
    /// The session already had that identifier.
    Unchanged,
    /// Another live session holds the identifier; nothing changed.
    Taken,
    /// Not usable as a subdomain label.
    Invalid,
}

/// Registry of live tunnels.
#[derive(Default)]
pub struct Registry {
    tunnels: RwLock<HashMap<String, Arc<TunnelSession>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh identifier not currently registered.
    pub async fn unique_id(&self) -> String {
        let tunnels = self.tunnels.read().await;
        loop {
            let id = generate_id();
            if !tunnels.contains_key(&id) {
                return id;
            }
        }
    }

    /// Copy out the route for `id`.
    pub async fn lookup(&self, id: &str) -> Option<TunnelRoute> {
        let tunnels = self.tunnels.read().await;
        let session = tunnels.get(id)?;
        let state = session.state.lock().await;
        Some(TunnelRoute {
            id: state.id.clone(),
            addr: state.addr.clone(),
            port: state.port,
            status: session.status_sender(),
        })
    }

    /// Register `session` (if it is not yet) and record its public
    /// `addr:port`, all under one registry lock so routers never observe a
    /// half-initialized entry. Returns the identifier it is registered under.
    ///
    /// If another session took the session's identifier in the meantime a
    /// fresh one is rolled.
    pub async fn register(&self, session: &Arc<TunnelSession>, addr: &str, port: u16) -> String {
        let mut tunnels = self.tunnels.write().await;
        let mut state = session.state.lock().await;

        if !state.registered {
            while tunnels
                .get(&state.id)
                .is_some_and(|other| other.key() != session.key())
            {
                let rolled = generate_id();
                debug!(taken = %state.id, id = %rolled, "identifier taken, re-rolled");
                state.id = rolled;
            }
            tunnels.insert(state.id.clone(), Arc::clone(session));
            state.registered = true;
            info!(id = %state.id, peer = %session.remote(), "tunnel registered");
        }

        state.addr = addr.to_string();
        state.port = port;
        state.id.clone()
    }

    /// Move `session` to `new_id` if that identifier is free.
    pub async fn rename(&self, session: &Arc<TunnelSession>, new_id: &str) -> Rename {
        if !is_valid_id(new_id) {
            return Rename::Invalid;
        }

        let mut tunnels = self.tunnels.write().await;
        let mut state = session.state.lock().await;

        if state.id == new_id {
            return Rename::Unchanged;
        }
        if tunnels
            .get(new_id)
            .is_some_and(|other| other.key() != session.key())
        {
            return Rename::Taken;
        }

        if state.registered {
            tunnels.remove(&state.id);
            tunnels.insert(new_id.to_string(), Arc::clone(session));
        }
        debug!(from = %state.id, to = %new_id, "tunnel renamed");
        state.id = new_id.to_string();
        Rename::Renamed
    }

    /// Remove `session`'s entry, if the entry under its identifier is still
    /// this session.
    pub async fn deregister(&self, session: &TunnelSession) -> bool {
        let mut tunnels = self.tunnels.write().await;
        let mut state = session.state.lock().await;
        if !state.registered {
            return false;
        }
        state.registered = false;

        let owned = tunnels
            .get(&state.id)
            .is_some_and(|entry| entry.key() == session.key());
        if owned {
            tunnels.remove(&state.id);
            info!(id = %state.id, "tunnel deregistered");
        }
        owned
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.tunnels.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tunnels.read().await.is_empty()
    }

    /// Copies of every route, sorted by identifier.
    pub async fn routes(&self) -> Vec<TunnelRoute> {
        let tunnels = self.tunnels.read().await;
        let mut routes = Vec::with_capacity(tunnels.len());
        for session in tunnels.values() {
            let state = session.state.lock().await;
            routes.push(TunnelRoute {
                id: state.id.clone(),
                addr: state.addr.clone(),
                port: state.port,
                status: session.status_sender(),
            });
        }
        routes.sort_by(|a, b| a.id.cmp(&b.id));
        routes
    }
}
