use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Environment keys under this dotted namespace carry internal routing
/// metadata and are never forwarded to the running process.
pub const RESERVED_ENV_PREFIX: &str = "cmdlet.";

/// A named, user-owned runnable definition: either a raw image reference or
/// a `#!cmd` script, plus its access-control metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Command {
    pub name: String,
    pub owner: String,
    /// Raw image reference, or a script whose first line is `#!cmd <image> [pkg ...]`.
    pub source: String,
    /// Values may be sealed at rest; they are opened through a [`SecretCipher`]
    /// only at run time.
    pub environment: HashMap<String, String>,
    /// Subjects with run access. The owner never needs to appear here.
    pub acl: HashSet<String>,
    /// Subjects with management access. The owner never needs to appear here.
    pub admins: HashSet<String>,
    pub description: String,
    /// Set when metadata changed during a run and should be persisted afterwards.
    #[serde(skip)]
    pub changed: bool,
}

impl Command {
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            source: source.into(),
            ..Self::default()
        }
    }

    /// Image tag this command builds or pulls to: `<owner>-<name>`.
    pub fn image_tag(&self) -> String {
        format!("{}-{}", self.owner, self.name)
    }

    /// Run access. The owner always has access; everyone else needs an ACL
    /// or admin entry.
    pub fn has_access(&self, subject: &str) -> bool {
        subject == self.owner || self.acl.contains(subject) || self.admins.contains(subject)
    }

    /// Management access. The owner is implicitly an admin.
    pub fn has_admin_access(&self, subject: &str) -> bool {
        subject == self.owner || self.admins.contains(subject)
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
        self.changed = true;
    }

    /// The environment forwarded to the running process: every value opened
    /// through `cipher`, keys under [`RESERVED_ENV_PREFIX`] dropped.
    pub async fn run_environ(&self, cipher: &dyn SecretCipher) -> Result<Vec<(String, String)>> {
        let mut environ = Vec::with_capacity(self.environment.len());
        for (key, value) in &self.environment {
            if key.starts_with(RESERVED_ENV_PREFIX) {
                continue;
            }
            environ.push((key.clone(), cipher.open(value).await?));
        }
        // Stable order keeps container configs reproducible across runs.
        environ.sort();
        Ok(environ)
    }
}

/// Opens sealed environment values at run time.
///
/// The sealing side lives with the management layer; the engine only ever
/// opens values.
#[async_trait]
pub trait SecretCipher: Send + Sync {
    async fn open(&self, value: &str) -> Result<String>;
}

/// Passthrough cipher for deployments that store environment values in the clear.
pub struct PlainCipher;

#[async_trait]
impl SecretCipher for PlainCipher {
    async fn open(&self, value: &str) -> Result<String> {
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Command {
        let mut cmd = Command::new("alice", "hello", "#!cmd alpine\n#!/bin/sh\n");
        cmd.acl.insert("bob".to_string());
        cmd.admins.insert("carol".to_string());
        cmd
    }

    #[test]
    fn owner_always_has_access() {
        let cmd = sample();
        assert!(cmd.has_access("alice"));
        assert!(cmd.has_admin_access("alice"));
    }

    #[test]
    fn acl_grants_run_access_only() {
        let cmd = sample();
        assert!(cmd.has_access("bob"));
        assert!(!cmd.has_admin_access("bob"));
    }

    #[test]
    fn admins_have_run_and_admin_access() {
        let cmd = sample();
        assert!(cmd.has_access("carol"));
        assert!(cmd.has_admin_access("carol"));
    }

    #[test]
    fn disjoint_acl_denies_unrelated_caller() {
        let cmd = sample();
        assert!(!cmd.has_access("mallory"));
        assert!(!cmd.has_admin_access("mallory"));
    }

    #[test]
    fn image_tag_is_owner_dash_name() {
        assert_eq!(sample().image_tag(), "alice-hello");
    }

    #[tokio::test]
    async fn run_environ_filters_reserved_namespace() {
        let mut cmd = sample();
        cmd.environment
            .insert("cmdlet.acl".to_string(), "internal".to_string());
        cmd.environment
            .insert("GREETING".to_string(), "hi".to_string());

        let environ = cmd.run_environ(&PlainCipher).await.unwrap();
        assert_eq!(environ, vec![("GREETING".to_string(), "hi".to_string())]);
    }

    #[test]
    fn set_description_marks_changed() {
        let mut cmd = sample();
        assert!(!cmd.changed);
        cmd.set_description("greets the caller");
        assert!(cmd.changed);
    }
}
