//! Abuse controls: token auth, verb whitelist, fixed-window rate limiting,
//! ban list and the chaining-block.
//!
//! These checks are deliberately coarse. The whitelist looks at the first
//! whitespace-delimited token and the chaining-block does substring matching,
//! while the command itself still runs through a full shell interpreter.
//! They raise the bar for casual misuse; they are not a sandbox.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

/// Shell sequencing and piping tokens rejected by the chaining-block.
const CHAINING_TOKENS: [&str; 4] = ["|", "&&", "||", ";"];

/// Returns true if `command_line` contains any shell chaining token.
pub fn contains_chaining(command_line: &str) -> bool {
    CHAINING_TOKENS.iter().any(|t| command_line.contains(t))
}

/// First whitespace-delimited token of a command line, if any.
pub fn first_token(command_line: &str) -> Option<&str> {
    command_line.split_whitespace().next()
}

/// Shared-secret check. No configured token means every caller is admitted.
#[derive(Debug, Clone, Default)]
pub struct TokenAuth {
    token: Option<String>,
}

impl TokenAuth {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
        }
    }

    pub fn validate(&self, presented: &str) -> bool {
        match &self.token {
            Some(expected) => expected == presented,
            None => true,
        }
    }
}

/// Allow-set of command verbs. Empty allows everything.
#[derive(Debug, Default)]
pub struct Whitelist {
    verbs: RwLock<HashSet<String>>,
}

impl Whitelist {
    pub fn new<I, S>(verbs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            verbs: RwLock::new(normalize(verbs).collect()),
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.verbs.read().await.is_empty()
    }

    /// Case-sensitive membership test on the first token. A blank command
    /// line is refused once the list is non-empty.
    pub async fn is_allowed(&self, command_line: &str) -> bool {
        let verbs = self.verbs.read().await;
        if verbs.is_empty() {
            return true;
        }
        first_token(command_line).is_some_and(|verb| verbs.contains(verb))
    }

    /// Inserts the first token of every non-blank entry and returns the
    /// resulting whitelist, sorted.
    pub async fn add_verbs<I, S>(&self, entries: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut verbs = self.verbs.write().await;
        for verb in normalize(entries) {
            if verbs.insert(verb.clone()) {
                tracing::info!(verb = %verb, "Added to whitelist");
            }
        }
        sorted(&verbs)
    }
}

fn normalize<I, S>(entries: I) -> impl Iterator<Item = String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .filter_map(|e| first_token(e.as_ref()).map(str::to_string))
}

fn sorted(verbs: &HashSet<String>) -> Vec<String> {
    let mut out: Vec<String> = verbs.iter().cloned().collect();
    out.sort();
    out
}

/// Permanently rejected session ids.
///
/// Not locked on its own: the registry keeps it under the same lock as the
/// session map so a kill+ban and an auto-registration can never interleave.
#[derive(Debug, Default)]
pub struct BanList {
    ids: HashSet<String>,
}

impl BanList {
    pub fn ban(&mut self, id: &str) -> bool {
        self.ids.insert(id.to_string())
    }

    pub fn is_banned(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: i64,
    started: Instant,
}

/// Fixed-window request counter keyed by session id.
#[derive(Debug)]
pub struct RateLimiter {
    limit: i64,
    window: Duration,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateLimiter {
    pub fn new(limit: i64, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limit > 0
    }

    /// Admits up to `limit` calls per window. A call arriving after the
    /// window has elapsed opens a fresh one and is always admitted.
    pub async fn allow(&self, id: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        match windows.get_mut(id) {
            Some(w) if now.duration_since(w.started) <= self.window => {
                if w.count >= self.limit {
                    return false;
                }
                w.count += 1;
                true
            }
            _ => {
                windows.insert(
                    id.to_string(),
                    RateWindow {
                        count: 1,
                        started: now,
                    },
                );
                true
            }
        }
    }

    /// Drops windows that have already elapsed; returns how many were removed.
    pub async fn prune(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, w| now.duration_since(w.started) <= self.window);
        before - windows.len()
    }

    pub async fn tracked(&self) -> usize {
        self.windows.lock().await.len()
    }
}
