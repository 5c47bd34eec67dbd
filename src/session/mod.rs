//! Bearer-token session registry with two independently revocable
//! capability tiers and sliding expiration.
//!
//! `validate` is the only path that extends a session's life; `peek`
//! exists so passive status polling cannot keep a session alive forever.

use crate::events::{EventBus, ServerEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Capability tier: A = relational query backend, B = record interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    A,
    B,
}

impl Tier {
    pub fn from_path(s: &str) -> Option<Self> {
        match s {
            "a" => Some(Tier::A),
            "b" => Some(Tier::B),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TierState {
    pub verified: bool,
    pub principal: Option<String>,
    pub verified_at: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub created_at: u64,
    pub last_activity: Instant,
    pub tier_a: TierState,
    pub tier_b: TierState,
}

impl Session {
    fn new(token: String) -> Self {
        Self {
            token,
            created_at: now_ms(),
            last_activity: Instant::now(),
            tier_a: TierState::default(),
            tier_b: TierState::default(),
        }
    }

    pub fn tier(&self, tier: Tier) -> &TierState {
        match tier {
            Tier::A => &self.tier_a,
            Tier::B => &self.tier_b,
        }
    }

    fn tier_mut(&mut self, tier: Tier) -> &mut TierState {
        match tier {
            Tier::A => &mut self.tier_a,
            Tier::B => &mut self.tier_b,
        }
    }
}

/// Result of a read-only status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peek {
    Unknown,
    Expired,
    Valid {
        ms_remaining: u64,
        tier_a_verified: bool,
        tier_b_verified: bool,
    },
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    timeout: Duration,
    bus: Arc<EventBus>,
}

impl SessionRegistry {
    pub fn new(timeout: Duration, bus: Arc<EventBus>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            timeout,
            bus,
        }
    }

    /// Mint an opaque fixed-length token: 64 lowercase hex chars.
    fn mint_token() -> String {
        format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
    }

    /// Return a still-valid existing token untouched (activity refreshed),
    /// else mint a new all-unverified session.
    pub fn create_or_reuse(&self, existing: Option<&str>) -> String {
        let mut sessions = self.sessions.lock();

        if let Some(token) = existing {
            if let Some(session) = sessions.get_mut(token) {
                if session.last_activity.elapsed() < self.timeout {
                    session.last_activity = Instant::now();
                    return token.to_string();
                }
            }
        }

        let token = Self::mint_token();
        sessions.insert(token.clone(), Session::new(token.clone()));
        tracing::debug!("Created session (total {})", sessions.len());
        token
    }

    /// Mark a tier verified for the given principal, creating a session if
    /// needed. Publishes a tier-changed event and returns the token.
    ///
    /// Events are published while the map lock is held so that no other
    /// operation can interleave between the mutation and its event.
    /// Bus handlers must not call back into the registry.
    pub fn upgrade(&self, tier: Tier, principal: &str, existing: Option<&str>) -> String {
        let mut sessions = self.sessions.lock();

        let token = match existing {
            Some(t) if sessions.contains_key(t) => t.to_string(),
            _ => {
                let token = Self::mint_token();
                sessions.insert(token.clone(), Session::new(token.clone()));
                token
            }
        };

        let session = sessions.get_mut(&token).expect("session just ensured");
        session.last_activity = Instant::now();
        let state = session.tier_mut(tier);
        state.verified = true;
        state.principal = Some(principal.to_string());
        state.verified_at = Some(now_ms());

        self.bus.publish(&ServerEvent::TierChanged {
            token: token.clone(),
            tier,
            verified: true,
            principal: Some(principal.to_string()),
        });

        token
    }

    /// Mark a tier unverified. Publishes a tier-changed event only if the
    /// tier actually changed.
    pub fn downgrade(&self, token: &str, tier: Tier) {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(token) else {
            return;
        };

        let state = session.tier_mut(tier);
        if !state.verified {
            return;
        }
        state.verified = false;
        state.principal = None;
        state.verified_at = None;

        self.bus.publish(&ServerEvent::TierChanged {
            token: token.to_string(),
            tier,
            verified: false,
            principal: None,
        });
    }

    /// Bulk-revoke a tier across every session, one event per affected
    /// session. Used when a shared backend disconnects.
    pub fn downgrade_all_by_tier(&self, tier: Tier) {
        let mut sessions = self.sessions.lock();
        for (token, session) in sessions.iter_mut() {
            let state = session.tier_mut(tier);
            if !state.verified {
                continue;
            }
            state.verified = false;
            state.principal = None;
            state.verified_at = None;

            self.bus.publish(&ServerEvent::TierChanged {
                token: token.clone(),
                tier,
                verified: false,
                principal: None,
            });
        }
    }

    /// Validate a token, refreshing its activity timestamp on success
    /// (sliding expiration). An expired token is removed here the same way
    /// the sweep would remove it.
    pub fn validate(&self, token: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock();

        let expired = match sessions.get(token) {
            None => return None,
            Some(s) => s.last_activity.elapsed() >= self.timeout,
        };

        if expired {
            sessions.remove(token);
            self.bus.publish(&ServerEvent::SessionExpired {
                token: token.to_string(),
            });
            return None;
        }

        let session = sessions.get_mut(token).expect("checked above");
        session.last_activity = Instant::now();
        Some(session.clone())
    }

    /// Read-only status check. Never refreshes the activity timestamp:
    /// a client asking "am I about to expire" must not prevent expiry.
    pub fn peek(&self, token: &str) -> Peek {
        let sessions = self.sessions.lock();
        match sessions.get(token) {
            None => Peek::Unknown,
            Some(s) => {
                let elapsed = s.last_activity.elapsed();
                if elapsed >= self.timeout {
                    Peek::Expired
                } else {
                    Peek::Valid {
                        ms_remaining: (self.timeout - elapsed).as_millis() as u64,
                        tier_a_verified: s.tier_a.verified,
                        tier_b_verified: s.tier_b.verified,
                    }
                }
            }
        }
    }

    /// Remove a session outright (explicit logout). No expiry event.
    pub fn remove(&self, token: &str) -> bool {
        self.sessions.lock().remove(token).is_some()
    }

    /// Remove every expired session, publishing a session-expired event for
    /// each so subscribers learn proactively. Returns the expired tokens.
    pub fn sweep(&self) -> Vec<String> {
        let mut sessions = self.sessions.lock();
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.last_activity.elapsed() >= self.timeout)
            .map(|(t, _)| t.clone())
            .collect();

        for token in &expired {
            sessions.remove(token);
            self.bus.publish(&ServerEvent::SessionExpired {
                token: token.clone(),
            });
        }

        if !expired.is_empty() {
            tracing::info!("Swept {} expired session(s)", expired.len());
        }
        expired
    }

    /// Spawn the background sweep loop.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) {
        let registry = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.sweep();
            }
        });
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn registry(timeout_ms: u64) -> (Arc<SessionRegistry>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let reg = Arc::new(SessionRegistry::new(
            Duration::from_millis(timeout_ms),
            Arc::clone(&bus),
        ));
        (reg, bus)
    }

    #[test]
    fn test_token_shape() {
        let (reg, _) = registry(1000);
        let token = reg.create_or_reuse(None);
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_create_or_reuse() {
        let (reg, _) = registry(1000);
        let token = reg.create_or_reuse(None);
        let again = reg.create_or_reuse(Some(&token));
        assert_eq!(token, again);
        assert_eq!(reg.session_count(), 1);

        let fresh = reg.create_or_reuse(Some("unknown-token"));
        assert_ne!(fresh, token);
        assert_eq!(reg.session_count(), 2);
    }

    #[test]
    fn test_sliding_expiration() {
        let (reg, _) = registry(80);
        let token = reg.create_or_reuse(None);

        sleep(Duration::from_millis(50));
        assert!(reg.validate(&token).is_some(), "refresh inside window");

        // Past the original boundary but inside the refreshed one.
        sleep(Duration::from_millis(50));
        assert!(reg.validate(&token).is_some());

        sleep(Duration::from_millis(100));
        assert!(reg.validate(&token).is_none(), "expired without refresh");
    }

    #[test]
    fn test_peek_never_extends() {
        let (reg, _) = registry(70);
        let token = reg.create_or_reuse(None);

        sleep(Duration::from_millis(40));
        assert!(matches!(reg.peek(&token), Peek::Valid { .. }));

        sleep(Duration::from_millis(40));
        assert_eq!(reg.peek(&token), Peek::Expired);
        assert_eq!(reg.peek("nope"), Peek::Unknown);
    }

    #[test]
    fn test_upgrade_and_downgrade_events() {
        let (reg, bus) = registry(1000);
        let events = Arc::new(Mutex::new(Vec::new()));
        let events2 = Arc::clone(&events);
        bus.subscribe_all(move |e| {
            if let ServerEvent::TierChanged { tier, verified, .. } = e {
                events2.lock().push((*tier, *verified));
            }
        });

        let token = reg.upgrade(Tier::A, "alice", None);
        let session = reg.validate(&token).unwrap();
        assert!(session.tier_a.verified);
        assert_eq!(session.tier_a.principal.as_deref(), Some("alice"));
        assert!(!session.tier_b.verified);

        reg.downgrade(&token, Tier::A);
        // Second downgrade is a no-op: no spurious event.
        reg.downgrade(&token, Tier::A);

        assert_eq!(&*events.lock(), &[(Tier::A, true), (Tier::A, false)]);
    }

    #[test]
    fn test_downgrade_all_by_tier() {
        let (reg, bus) = registry(1000);
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        bus.subscribe_all(move |e| {
            if matches!(e, ServerEvent::TierChanged { verified: false, .. }) {
                count2.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        });

        let t1 = reg.upgrade(Tier::B, "alice", None);
        let t2 = reg.upgrade(Tier::B, "bob", None);
        let t3 = reg.create_or_reuse(None); // tier B never verified

        reg.downgrade_all_by_tier(Tier::B);

        assert_eq!(count.load(std::sync::atomic::Ordering::Relaxed), 2);
        assert!(!reg.validate(&t1).unwrap().tier_b.verified);
        assert!(!reg.validate(&t2).unwrap().tier_b.verified);
        assert!(reg.validate(&t3).is_some());
    }

    #[test]
    fn test_sweep_publishes_expiry() {
        let (reg, bus) = registry(30);
        let expired = Arc::new(Mutex::new(Vec::new()));
        let expired2 = Arc::clone(&expired);
        bus.subscribe_all(move |e| {
            if let ServerEvent::SessionExpired { token } = e {
                expired2.lock().push(token.clone());
            }
        });

        let stale = reg.create_or_reuse(None);
        sleep(Duration::from_millis(50));
        let fresh = reg.create_or_reuse(None);

        let swept = reg.sweep();
        assert_eq!(swept, vec![stale.clone()]);
        assert_eq!(&*expired.lock(), &[stale]);
        assert_eq!(reg.session_count(), 1);
        assert!(matches!(reg.peek(&fresh), Peek::Valid { .. }));
    }

    #[test]
    fn test_logout_removes() {
        let (reg, _) = registry(1000);
        let token = reg.create_or_reuse(None);
        assert!(reg.remove(&token));
        assert!(!reg.remove(&token));
        assert!(reg.validate(&token).is_none());
    }
}
