//! Session records and the registry that owns them.

use crate::error::Rejection;
use crate::policy::BanList;
use crate::service::ExecutionService;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::info;

/// A client's execution context.
///
/// Values handed out by [`SessionRegistry`] are snapshots; mutating one does
/// not affect the registry.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub client_addr: String,
    pub env: HashMap<String, String>,
    pub work_dir: PathBuf,
    pub created_at: Instant,
    pub last_active: Instant,
    pub active: bool,
}

impl Session {
    fn new(id: &str, client_addr: &str, work_dir: &Path) -> Self {
        let now = Instant::now();
        Self {
            id: id.to_string(),
            client_addr: client_addr.to_string(),
            env: HashMap::new(),
            work_dir: work_dir.to_path_buf(),
            created_at: now,
            last_active: now,
            active: true,
        }
    }

    pub fn idle(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_active)
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.created_at)
    }

    fn touch(&mut self) {
        // never move backwards
        self.last_active = self.last_active.max(Instant::now());
    }

    /// Summary for listings. Wall-clock stamps are derived from the
    /// monotonic age/idle so they stay consistent with each other.
    pub fn summary(&self, session_timeout: Duration) -> SessionSummary {
        let age = self.age();
        let idle = self.idle();
        let now = unix_now();
        SessionSummary {
            id: self.id.clone(),
            client_addr: self.client_addr.clone(),
            work_dir: self.work_dir.display().to_string(),
            env_count: self.env.len(),
            created_at: now - age.as_secs() as i64,
            last_active: now - idle.as_secs() as i64,
            age_secs: age.as_secs(),
            idle_secs: idle.as_secs(),
            is_active: self.active && idle < session_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub client_addr: String,
    pub work_dir: String,
    pub env_count: usize,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds.
    pub last_active: i64,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub is_active: bool,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Result of [`SessionRegistry::get_or_create`].
#[derive(Debug, Clone)]
pub struct Resolved {
    pub session: Session,
    pub created: bool,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    banned: BanList,
}

/// Concurrent store of session id to session state.
///
/// The lock is only held for lookups and mutations, never across process
/// execution. The ban list lives under the same lock so a banned id cannot
/// slip back in through auto-registration.
#[derive(Debug)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
    default_work_dir: PathBuf,
}

impl SessionRegistry {
    pub fn new(default_work_dir: PathBuf) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            default_work_dir,
        }
    }

    /// Registry whose sessions start in the process's current directory.
    pub fn with_current_dir() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::new(cwd)
    }

    /// Returns the existing session or creates exactly one, even when many
    /// callers race on the same new id.
    pub async fn get_or_create(&self, id: &str, client_addr: &str) -> Result<Resolved, Rejection> {
        {
            let inner = self.inner.read().await;
            if inner.banned.is_banned(id) {
                return Err(Rejection::Banned);
            }
            if let Some(session) = inner.sessions.get(id) {
                return Ok(Resolved {
                    session: session.clone(),
                    created: false,
                });
            }
        }

        let mut inner = self.inner.write().await;
        if inner.banned.is_banned(id) {
            return Err(Rejection::Banned);
        }
        let mut created = false;
        let session = inner
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                created = true;
                Session::new(id, client_addr, &self.default_work_dir)
            })
            .clone();
        Ok(Resolved { session, created })
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.inner.read().await.sessions.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.sessions.contains_key(id)
    }

    /// Refreshes last-active. Returns false if the session no longer exists.
    pub async fn touch(&self, id: &str) -> bool {
        self.update(id, |s| s.touch()).await.is_some()
    }

    /// Applies `f` to the live record under the write lock and refreshes
    /// last-active. Returns `None` if the session does not exist.
    pub async fn update<F, T>(&self, id: &str, f: F) -> Option<T>
    where
        F: FnOnce(&mut Session) -> T,
    {
        let mut inner = self.inner.write().await;
        let session = inner.sessions.get_mut(id)?;
        let out = f(session);
        session.touch();
        Some(out)
    }

    /// Removes a session without banning it.
    pub async fn remove(&self, id: &str) -> Option<Session> {
        let mut inner = self.inner.write().await;
        inner.sessions.remove(id).map(|mut s| {
            s.active = false;
            s
        })
    }

    /// Removes the session and bans its id in one step. Returns false (and
    /// bans nothing) if the id is unknown.
    pub async fn kill(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.sessions.remove(id) {
            Some(_) => {
                inner.banned.ban(id);
                true
            }
            None => false,
        }
    }

    pub async fn is_banned(&self, id: &str) -> bool {
        self.inner.read().await.banned.is_banned(id)
    }

    /// Snapshot of every session, ordered by id.
    pub async fn list(&self) -> Vec<Session> {
        let inner = self.inner.read().await;
        let mut sessions: Vec<Session> = inner.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    pub async fn ids(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut ids: Vec<String> = inner.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Evicts every session idle for longer than `timeout`.
    pub async fn evict_idle(&self, timeout: Duration) -> Vec<(String, Duration)> {
        let mut inner = self.inner.write().await;
        let expired: Vec<(String, Duration)> = inner
            .sessions
            .iter()
            .map(|(id, s)| (id.clone(), s.idle()))
            .filter(|(_, idle)| *idle > timeout)
            .collect();

        for (id, idle) in &expired {
            if inner.sessions.remove(id).is_some() {
                info!(session = %id, idle_secs = idle.as_secs(), "Removing inactive session");
            }
        }
        expired
    }
}

/// Shared application state handed to the transport adapters.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ExecutionService>,
}

impl AppState {
    pub fn new(service: ExecutionService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}
