//! Cookie-indexed registry of inhibitor and throttler leases.
//!
//! A lease is a client-held record that either suppresses automatic blanking
//! (`Inhibit`) or signals reduced blanking availability (`Throttle`). Leases
//! are addressed by a random u32 cookie unique within their kind's table.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use tracing::debug;

/// The two kinds of lease a client can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseKind {
    /// Blocks idle-triggered activation while held.
    Inhibit,
    /// Marks blanking availability as reduced while held.
    Throttle,
}

impl LeaseKind {
    /// Human-readable name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inhibit => "inhibit",
            Self::Throttle => "throttle",
        }
    }
}

/// One client-held lease.
#[derive(Debug, Clone)]
pub struct Lease {
    /// Cookie identifying this lease within its kind's table.
    pub cookie: u32,

    /// Unique bus name of the connection that created the lease.
    pub owner: String,

    /// Application name supplied by the client.
    pub application: String,

    /// Reason supplied by the client.
    pub reason: String,

    /// When the lease was created.
    pub created_at: DateTime<Utc>,

    /// Handle returned by the desktop session manager when the mirror call
    /// succeeded. Only ever set for inhibit leases.
    pub foreign_cookie: Option<u32>,
}

impl Lease {
    /// Format the human-readable descriptor served by `GetInhibitors`.
    pub fn descriptor(&self) -> String {
        format!(
            "Application=\"{}\"; Since=\"{}\"; Reason=\"{}\"",
            self.application,
            self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.reason
        )
    }
}

/// Storage for both lease tables, keyed by cookie.
#[derive(Debug, Default)]
pub struct LeaseRegistry {
    inhibitors: HashMap<u32, Lease>,
    throttlers: HashMap<u32, Lease>,
}

impl LeaseRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, kind: LeaseKind) -> &HashMap<u32, Lease> {
        match kind {
            LeaseKind::Inhibit => &self.inhibitors,
            LeaseKind::Throttle => &self.throttlers,
        }
    }

    fn table_mut(&mut self, kind: LeaseKind) -> &mut HashMap<u32, Lease> {
        match kind {
            LeaseKind::Inhibit => &mut self.inhibitors,
            LeaseKind::Throttle => &mut self.throttlers,
        }
    }

    /// Add a lease, generating a cookie not currently held by any lease of
    /// the same kind. Returns the new cookie.
    pub fn add(
        &mut self,
        kind: LeaseKind,
        owner: impl Into<String>,
        application: impl Into<String>,
        reason: impl Into<String>,
    ) -> u32 {
        let cookie = self.generate_cookie(kind);
        let lease = Lease {
            cookie,
            owner: owner.into(),
            application: application.into(),
            reason: reason.into(),
            created_at: Utc::now(),
            foreign_cookie: None,
        };
        debug!(
            "Adding {} lease {} for {} ({})",
            kind.as_str(),
            cookie,
            lease.application,
            lease.reason
        );
        self.table_mut(kind).insert(cookie, lease);
        cookie
    }

    /// Draw random cookies until one is free in the kind's table. Zero is
    /// never produced so clients can treat it as "no cookie".
    fn generate_cookie(&self, kind: LeaseKind) -> u32 {
        let table = self.table(kind);
        let mut rng = rand::rng();
        loop {
            let cookie = rng.random_range(1..u32::MAX);
            if !table.contains_key(&cookie) {
                return cookie;
            }
        }
    }

    /// Remove the lease with the given cookie, returning it. Removing an
    /// unknown cookie is a no-op (`None`), never an error.
    pub fn remove(&mut self, kind: LeaseKind, cookie: u32) -> Option<Lease> {
        let removed = self.table_mut(kind).remove(&cookie);
        match removed {
            Some(ref lease) => {
                debug!(
                    "Removed {} lease {} for {}",
                    kind.as_str(),
                    cookie,
                    lease.application
                );
            }
            None => {
                debug!("Ignoring removal of unknown {} cookie {}", kind.as_str(), cookie);
            }
        }
        removed
    }

    /// Remove every lease of a kind held by the given owner, returning the
    /// removed leases. Used for peer-disappearance cleanup.
    pub fn remove_all_for_owner(&mut self, kind: LeaseKind, owner: &str) -> Vec<Lease> {
        let table = self.table_mut(kind);
        let cookies: Vec<u32> = table
            .values()
            .filter(|lease| lease.owner == owner)
            .map(|lease| lease.cookie)
            .collect();

        let mut removed = Vec::with_capacity(cookies.len());
        for cookie in cookies {
            if let Some(lease) = table.remove(&cookie) {
                debug!(
                    "Reaping {} lease {} owned by vanished peer {}",
                    kind.as_str(),
                    cookie,
                    owner
                );
                removed.push(lease);
            }
        }
        removed
    }

    /// Store the session-manager handle on an inhibit lease after a
    /// successful mirror call.
    pub fn set_foreign_cookie(&mut self, cookie: u32, foreign: u32) {
        if let Some(lease) = self.inhibitors.get_mut(&cookie) {
            lease.foreign_cookie = Some(foreign);
        }
    }

    /// Number of live leases of a kind.
    pub fn count(&self, kind: LeaseKind) -> usize {
        self.table(kind).len()
    }

    /// All live leases of a kind, in no particular order.
    #[allow(dead_code)]
    pub fn list(&self, kind: LeaseKind) -> Vec<&Lease> {
        self.table(kind).values().collect()
    }

    /// Human-readable descriptors for all live leases of a kind.
    pub fn descriptors(&self, kind: LeaseKind) -> Vec<String> {
        self.table(kind).values().map(Lease::descriptor).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_count() {
        let mut registry = LeaseRegistry::new();
        assert_eq!(registry.count(LeaseKind::Inhibit), 0);

        let c1 = registry.add(LeaseKind::Inhibit, ":1.10", "Player", "playing");
        assert_eq!(registry.count(LeaseKind::Inhibit), 1);
        assert_eq!(registry.count(LeaseKind::Throttle), 0);

        let c2 = registry.add(LeaseKind::Throttle, ":1.10", "Player", "fullscreen");
        assert_ne!(c1, 0);
        assert_ne!(c2, 0);
        assert_eq!(registry.count(LeaseKind::Throttle), 1);
    }

    #[test]
    fn test_cookies_are_distinct() {
        let mut registry = LeaseRegistry::new();
        let mut cookies = std::collections::HashSet::new();
        for i in 0..100 {
            let cookie = registry.add(LeaseKind::Inhibit, ":1.1", format!("app{i}"), "busy");
            assert!(cookies.insert(cookie), "duplicate cookie {cookie}");
        }
        assert_eq!(registry.count(LeaseKind::Inhibit), 100);
    }

    #[test]
    fn test_remove_unknown_cookie_is_noop() {
        let mut registry = LeaseRegistry::new();
        let cookie = registry.add(LeaseKind::Inhibit, ":1.1", "Player", "playing");

        assert!(registry.remove(LeaseKind::Inhibit, cookie + 1).is_none());
        assert_eq!(registry.count(LeaseKind::Inhibit), 1);

        assert!(registry.remove(LeaseKind::Inhibit, cookie).is_some());
        // Second removal of the same cookie is also a no-op.
        assert!(registry.remove(LeaseKind::Inhibit, cookie).is_none());
        assert_eq!(registry.count(LeaseKind::Inhibit), 0);
    }

    #[test]
    fn test_kinds_are_independent() {
        let mut registry = LeaseRegistry::new();
        let cookie = registry.add(LeaseKind::Inhibit, ":1.1", "Player", "playing");

        // A throttle removal with an inhibit cookie never touches the
        // inhibit table.
        assert!(registry.remove(LeaseKind::Throttle, cookie).is_none());
        assert_eq!(registry.count(LeaseKind::Inhibit), 1);
    }

    #[test]
    fn test_remove_all_for_owner() {
        let mut registry = LeaseRegistry::new();
        registry.add(LeaseKind::Inhibit, ":1.1", "Player", "playing");
        registry.add(LeaseKind::Inhibit, ":1.1", "Burner", "burning");
        let kept = registry.add(LeaseKind::Inhibit, ":1.2", "Editor", "typing");

        let removed = registry.remove_all_for_owner(LeaseKind::Inhibit, ":1.1");
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.count(LeaseKind::Inhibit), 1);
        assert!(registry.list(LeaseKind::Inhibit)[0].cookie == kept);

        // Unknown owner removes nothing.
        let removed = registry.remove_all_for_owner(LeaseKind::Inhibit, ":1.99");
        assert!(removed.is_empty());
    }

    #[test]
    fn test_foreign_cookie() {
        let mut registry = LeaseRegistry::new();
        let cookie = registry.add(LeaseKind::Inhibit, ":1.1", "Player", "playing");
        registry.set_foreign_cookie(cookie, 42);

        let lease = registry.remove(LeaseKind::Inhibit, cookie).unwrap();
        assert_eq!(lease.foreign_cookie, Some(42));

        // Setting on an unknown cookie is ignored.
        registry.set_foreign_cookie(cookie, 43);
    }

    #[test]
    fn test_descriptor_format() {
        let mut registry = LeaseRegistry::new();
        registry.add(LeaseKind::Inhibit, ":1.1", "Player", "playing a movie");

        let descriptors = registry.descriptors(LeaseKind::Inhibit);
        assert_eq!(descriptors.len(), 1);
        assert!(descriptors[0].starts_with("Application=\"Player\"; Since=\""));
        assert!(descriptors[0].ends_with("; Reason=\"playing a movie\""));
    }
}
