use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::command::Command;
use crate::error::{CmdletError, Result};

/// The persistence surface the engine's callers consume. Implementations live
/// with the deployment (key-value stores, SQL, ...); the engine itself only
/// ever reads a [`Command`] through this interface before an invocation and
/// optionally writes it back afterwards (e.g. a changed description).
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, owner: &str, name: &str) -> Result<Option<Command>>;
    async fn put(&self, owner: &str, name: &str, cmd: &Command) -> Result<()>;
    async fn delete(&self, owner: &str, name: &str) -> Result<()>;
    async fn list(&self, owner: &str) -> Result<Vec<Command>>;
}

/// Fetch a command or fail with a not-found error.
pub async fn must_get(backend: &dyn Backend, owner: &str, name: &str) -> Result<Command> {
    backend
        .get(owner, name)
        .await?
        .ok_or_else(|| CmdletError::CommandNotFound {
            owner: owner.to_string(),
            name: name.to_string(),
        })
}

/// In-memory backend used by tests and single-process embeddings.
#[derive(Default)]
pub struct MemoryBackend {
    commands: RwLock<HashMap<(String, String), Command>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, owner: &str, name: &str) -> Result<Option<Command>> {
        let commands = self.commands.read().await;
        Ok(commands
            .get(&(owner.to_string(), name.to_string()))
            .cloned())
    }

    async fn put(&self, owner: &str, name: &str, cmd: &Command) -> Result<()> {
        let mut commands = self.commands.write().await;
        commands.insert((owner.to_string(), name.to_string()), cmd.clone());
        Ok(())
    }

    async fn delete(&self, owner: &str, name: &str) -> Result<()> {
        let mut commands = self.commands.write().await;
        commands.remove(&(owner.to_string(), name.to_string()));
        Ok(())
    }

    async fn list(&self, owner: &str) -> Result<Vec<Command>> {
        let commands = self.commands.read().await;
        let mut owned: Vec<Command> = commands
            .iter()
            .filter(|((o, _), _)| o == owner)
            .map(|(_, cmd)| cmd.clone())
            .collect();
        owned.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let backend = MemoryBackend::new();
        let cmd = Command::new("alice", "hello", "alpine");
        backend.put("alice", "hello", &cmd).await.unwrap();

        let loaded = must_get(&backend, "alice", "hello").await.unwrap();
        assert_eq!(loaded.source, "alpine");
    }

    #[tokio::test]
    async fn must_get_reports_missing_command() {
        let backend = MemoryBackend::new();
        let err = must_get(&backend, "alice", "ghost").await.unwrap_err();
        assert!(matches!(err, CmdletError::CommandNotFound { .. }));
    }

    #[tokio::test]
    async fn list_is_scoped_to_owner() {
        let backend = MemoryBackend::new();
        backend
            .put("alice", "a", &Command::new("alice", "a", "alpine"))
            .await
            .unwrap();
        backend
            .put("bob", "b", &Command::new("bob", "b", "alpine"))
            .await
            .unwrap();

        let names: Vec<String> = backend
            .list("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["a"]);
    }
}
