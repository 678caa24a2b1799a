use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::command::Command;

/// Caches positive access-check results for a bounded time so transports do
/// not have to reload a command's ACL for every keystroke-sized request.
///
/// Owned and injected by the transport layer; the execution engine never
/// consults it. Denials are never cached, and a denial explicitly invalidates
/// any stale grant for the same subject.
pub struct AccessCache {
    ttl: Duration,
    grants: Mutex<HashMap<(String, String, String), Instant>>,
}

impl AccessCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            grants: Mutex::new(HashMap::new()),
        }
    }

    fn key(cmd: &Command, subject: &str) -> (String, String, String) {
        (cmd.owner.clone(), cmd.name.clone(), subject.to_string())
    }

    /// Check run access for `subject`, consulting the cache first.
    pub fn allowed(&self, cmd: &Command, subject: &str) -> bool {
        let key = Self::key(cmd, subject);
        {
            let mut grants = self.grants.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(granted_at) = grants.get(&key) {
                if granted_at.elapsed() < self.ttl {
                    return true;
                }
                grants.remove(&key);
            }
        }

        if cmd.has_access(subject) {
            let mut grants = self.grants.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            grants.insert(key, Instant::now());
            true
        } else {
            debug!(owner = %cmd.owner, name = %cmd.name, subject = %subject, "access denied");
            self.invalidate(cmd, subject);
            false
        }
    }

    /// Drop any cached grant for one subject on one command.
    pub fn invalidate(&self, cmd: &Command, subject: &str) {
        let mut grants = self.grants.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        grants.remove(&Self::key(cmd, subject));
    }

    /// Drop every expired entry. Callers may run this periodically.
    pub fn purge_expired(&self) {
        let mut grants = self.grants.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        grants.retain(|_, granted_at| granted_at.elapsed() < self.ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_with_acl(subject: &str) -> Command {
        let mut cmd = Command::new("alice", "hello", "alpine");
        cmd.acl.insert(subject.to_string());
        cmd
    }

    #[test]
    fn caches_grants_within_ttl() {
        let cache = AccessCache::new(Duration::from_secs(60));
        let mut cmd = command_with_acl("bob");
        assert!(cache.allowed(&cmd, "bob"));

        // A revoked ACL entry is still served from cache until the TTL lapses.
        cmd.acl.clear();
        assert!(cache.allowed(&cmd, "bob"));
    }

    #[test]
    fn expired_grants_are_rechecked() {
        let cache = AccessCache::new(Duration::ZERO);
        let mut cmd = command_with_acl("bob");
        assert!(cache.allowed(&cmd, "bob"));

        cmd.acl.clear();
        assert!(!cache.allowed(&cmd, "bob"));
    }

    #[test]
    fn denial_invalidates_stale_grant() {
        let cache = AccessCache::new(Duration::from_secs(60));
        let cmd = command_with_acl("bob");
        assert!(cache.allowed(&cmd, "bob"));

        cache.invalidate(&cmd, "bob");
        let mut revoked = cmd.clone();
        revoked.acl.clear();
        assert!(!cache.allowed(&revoked, "bob"));
    }

    #[test]
    fn denials_are_not_cached() {
        let cache = AccessCache::new(Duration::from_secs(60));
        let mut cmd = Command::new("alice", "hello", "alpine");
        assert!(!cache.allowed(&cmd, "bob"));

        cmd.acl.insert("bob".to_string());
        assert!(cache.allowed(&cmd, "bob"));
    }
}
