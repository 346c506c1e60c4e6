//! Lifecycle controller (C9): garbage collection orchestration and
//! ghost-repository purge, both operating directly on the registry's
//! backing filesystem (§4.6).

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::Mutex;

use crate::command::{self, CommandSpec};
use crate::config::Config;
use crate::model::{GCState, GCStatus};
use crate::pathsafety;
use crate::registry_client::RegistryClient;
use crate::supervisor::SupervisorClient;
use crate::{Error, Result};

fn ghost_pattern() -> Regex {
    Regex::new(r"Path not found: /docker/registry/v2/repositories/(?P<path>[^\s]+)/_layers").expect("static pattern")
}

pub struct LifecycleController {
    config: Arc<Config>,
    supervisor: Arc<SupervisorClient>,
    registry_client: Arc<RegistryClient>,
    gc_state: Mutex<GCState>,
}

impl LifecycleController {
    pub fn new(config: Arc<Config>, supervisor: Arc<SupervisorClient>, registry_client: Arc<RegistryClient>) -> Self {
        Self {
            config,
            supervisor,
            registry_client,
            gc_state: Mutex::new(GCState::default()),
        }
    }

    pub async fn state(&self) -> GCState {
        self.gc_state.lock().await.clone()
    }

    /// Run garbage collection. Serialized by the exclusive `gc_state` lock;
    /// a concurrent request observes `status == running` and gets a
    /// conflict without disturbing the in-flight run. The lock is only held
    /// to claim/release the slot and to publish status updates — not across
    /// the run itself, which may legitimately take hours (§5 "Cancellation
    /// and timeouts") and must not block concurrent status reads.
    #[tracing::instrument(skip(self))]
    pub async fn run_gc(&self) -> Result<()> {
        {
            let mut state = self.gc_state.lock().await;
            if state.status == GCStatus::Running {
                return Err(Error::Conflict("garbage collection already running".to_string()));
            }
            state.status = GCStatus::Running;
            state.started_at = Some(chrono::Utc::now());
            state.finished_at = None;
            state.error = None;
            state.output.clear();
        }

        let size_before = directory_size(&self.config.registry_data_root).await.unwrap_or(0);

        let result = self.run_gc_inner().await;

        // Always restart the registry, success or failure (§4.6 step 5).
        if let Err(e) = self.supervisor.start_process(&self.config.registry_process_name).await {
            tracing::error!(error = %e, "failed to restart registry after GC");
        }

        let size_after = directory_size(&self.config.registry_data_root).await.unwrap_or(size_before);

        let mut state = self.gc_state.lock().await;
        state.freed_bytes = size_before.saturating_sub(size_after);
        state.finished_at = Some(chrono::Utc::now());

        match result {
            Ok(output) => {
                state.status = GCStatus::Done;
                state.output = output;
                Ok(())
            }
            Err(e) => {
                state.status = GCStatus::Failed;
                state.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn run_gc_inner(&self) -> Result<String> {
        self.supervisor.stop_process(&self.config.registry_process_name).await?;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let first = self.invoke_gc_binary().await?;
        if first.success() {
            return Ok(format!("{}{}", first.stdout, first.stderr));
        }

        let combined = format!("{}{}", first.stdout, first.stderr);
        let ghosts: Vec<String> = ghost_pattern()
            .captures_iter(&combined)
            .filter_map(|c| c.name("path").map(|m| m.as_str().to_string()))
            .collect();

        if ghosts.is_empty() {
            return Err(Error::ToolFailure(format!("garbage-collect failed: {combined}")));
        }

        for repo_path in &ghosts {
            let repositories_root = self.config.registry_data_root.join("docker/registry/v2/repositories");
            let resolved = pathsafety::contained_child(&repositories_root, repo_path).await?;
            tracing::warn!(path = %resolved.display(), "removing ghost repository ahead of GC retry");
            if resolved.exists() {
                tokio::fs::remove_dir_all(&resolved).await?;
            }
        }

        let retry = self.invoke_gc_binary().await?;
        if !retry.success() {
            return Err(Error::ToolFailure(format!(
                "garbage-collect failed after ghost cleanup retry: {}{}",
                retry.stdout, retry.stderr
            )));
        }
        Ok(format!("{}{}", retry.stdout, retry.stderr))
    }

    async fn invoke_gc_binary(&self) -> Result<command::CommandOutput> {
        command::run(CommandSpec::new(
            self.config.registry_binary.clone(),
            [
                "garbage-collect".to_string(),
                "--delete-untagged=true".to_string(),
                self.config.registry_config_path.display().to_string(),
            ],
        ))
        .await
    }

    /// Repositories present in the catalog with zero tags.
    pub async fn list_ghost_repositories(&self) -> Result<Vec<String>> {
        self.registry_client.list_ghost_repositories(self.config.catalog_fanout).await
    }

    /// Remove a ghost repository's directory directly, with a path
    /// containment check — anything outside the repositories root is a
    /// security violation and refused (§4.6, §8 "Path safety" invariant).
    pub async fn purge_ghost(&self, repo_name: &str) -> Result<()> {
        let repositories_root = self.config.registry_data_root.join("docker/registry/v2/repositories");
        let resolved = pathsafety::contained_child(&repositories_root, repo_name).await?;
        if resolved.exists() {
            tokio::fs::remove_dir_all(&resolved).await?;
        }
        Ok(())
    }
}

async fn directory_size(path: &std::path::Path) -> Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata().await?.len();
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ghost_pattern_extracts_the_repository_path() {
        let output = "time=\"...\" level=error msg=\"failed to mark\" Path not found: /docker/registry/v2/repositories/ghost/app/_layers";
        let captures = ghost_pattern().captures(output).unwrap();
        assert_eq!(&captures["path"], "ghost/app");
    }

    #[test]
    fn ghost_pattern_does_not_match_unrelated_errors() {
        assert!(ghost_pattern().captures("disk is full").is_none());
    }
}
