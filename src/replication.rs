//! Replication engine (C8).
//!
//! Builds a source/destination plan from the local catalog (or a single
//! pair) and copies each pair to a destination registry via `skopeo`.
//! At-least-once, idempotent-by-digest — re-running a sync job simply
//! re-copies unchanged content (§1 Non-goals).

use std::sync::Arc;

use uuid::Uuid;

use crate::command::{self, CommandSpec};
use crate::config::Config;
use crate::model::{ExternalRegistry, SyncJob, SyncSource, SyncStatus};
use crate::registry_client::{RegistryClient, RegistryCredentials};
use crate::{Error, Result};

const MAX_REPORTED_ERRORS: usize = 5;

struct Pair {
    src: String,
    dst: String,
}

pub struct ReplicationEngine {
    config: Arc<Config>,
    local_registry: Arc<RegistryClient>,
    jobs: tokio::sync::RwLock<std::collections::HashMap<Uuid, SyncJob>>,
}

impl ReplicationEngine {
    pub fn new(config: Arc<Config>, local_registry: Arc<RegistryClient>) -> Self {
        Self {
            config,
            local_registry,
            jobs: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<SyncJob> {
        self.jobs.read().await.get(&id).cloned().ok_or_else(|| Error::NotFound(format!("sync job {id}")))
    }

    pub async fn list(&self) -> Vec<SyncJob> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Cheap `GET /v2/` reachability+auth check, run before a registry is
    /// accepted as a sync destination.
    pub async fn test_destination(&self, registry: &ExternalRegistry) -> Result<bool> {
        let credentials = match (&registry.username, &registry.password) {
            (Some(u), Some(p)) => Some(RegistryCredentials {
                username: u.clone(),
                password: p.clone(),
            }),
            _ => None,
        };
        let client = RegistryClient::new(format!("https://{}", registry.host), std::time::Duration::from_secs(10))?
            .with_credentials(credentials);
        client.test_connection().await
    }

    pub async fn start(
        self: &Arc<Self>,
        source_spec: String,
        destination: ExternalRegistry,
        dest_folder: Option<String>,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let job = SyncJob {
            id,
            source_spec: source_spec.clone(),
            dest_registry_id: destination.id,
            dest_folder: dest_folder.clone(),
            status: SyncStatus::Running,
            started_at: chrono::Utc::now(),
            finished_at: None,
            images_total: 0,
            images_done: 0,
            progress: 0,
            error: None,
            message: "building plan".to_string(),
        };
        self.jobs.write().await.insert(id, job);

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run(id, source_spec, destination, dest_folder).await;
        });
        Ok(id)
    }

    async fn run(&self, id: Uuid, source_spec: String, destination: ExternalRegistry, dest_folder: Option<String>) {
        let source = SyncSource::parse(&source_spec);
        let plan = match self.build_plan(source).await {
            Ok(plan) => plan,
            Err(e) => {
                self.update(id, |job| {
                    job.status = SyncStatus::Error;
                    job.error = Some(vec![e.to_string()]);
                    job.finished_at = Some(chrono::Utc::now());
                })
                .await;
                return;
            }
        };

        let total = plan.len();
        self.update(id, |job| {
            job.images_total = total;
            job.message = "copying".to_string();
        })
        .await;

        let local_creds = self.config.dockerhub_creds();
        let dest_creds = match (&destination.username, &destination.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        };
        let folder_prefix = dest_folder.map(|f| format!("{f}/")).unwrap_or_default();

        let mut errors = Vec::new();
        for (index, pair) in plan.into_iter().enumerate() {
            let dst = format!("docker://{}/{folder_prefix}{}", destination.host, pair.dst);
            let result = self.copy_pair(&pair.src, &dst, &local_creds, &dest_creds).await;
            if let Err(e) = result {
                if errors.len() < MAX_REPORTED_ERRORS {
                    errors.push(e.to_string());
                }
            }
            let done = index + 1;
            self.update(id, move |job| {
                job.images_done = done;
                job.progress = ((done as f64 / total.max(1) as f64) * 100.0) as u8;
            })
            .await;
        }

        let status = if errors.is_empty() { SyncStatus::Done } else { SyncStatus::Partial };
        self.update(id, move |job| {
            job.status = status;
            job.finished_at = Some(chrono::Utc::now());
            job.progress = 100;
            job.error = if errors.is_empty() { None } else { Some(errors) };
            job.message = match status {
                SyncStatus::Done => "replication complete".to_string(),
                SyncStatus::Partial => "replication completed with errors".to_string(),
                _ => unreachable!(),
            };
        })
        .await;
    }

    async fn build_plan(&self, source: SyncSource) -> Result<Vec<Pair>> {
        match source {
            SyncSource::Single { repo, tag } => {
                let basename = repo.rsplit('/').next().unwrap_or(&repo);
                Ok(vec![Pair {
                    src: format!("docker://{}/{repo}:{tag}", self.config.registry_url_host()),
                    dst: format!("{basename}:{tag}"),
                }])
            }
            SyncSource::All => {
                let repos = self
                    .local_registry
                    .list_repositories(true, self.config.catalog_fanout)
                    .await?;
                let mut pairs = Vec::new();
                for repo in repos {
                    let tags = self.local_registry.list_tags(&repo).await?;
                    let basename = repo.rsplit('/').next().unwrap_or(&repo);
                    for tag in tags {
                        pairs.push(Pair {
                            src: format!("docker://{}/{repo}:{tag}", self.config.registry_url_host()),
                            dst: format!("{basename}:{tag}"),
                        });
                    }
                }
                Ok(pairs)
            }
        }
    }

    async fn copy_pair(
        &self,
        src: &str,
        dst: &str,
        src_creds: &Option<(String, String)>,
        dest_creds: &Option<(String, String)>,
    ) -> Result<()> {
        let mut args = vec![
            "copy".to_string(),
            "--src-tls-verify=false".to_string(),
            "--dest-tls-verify=false".to_string(),
        ];
        if let Some((user, pass)) = src_creds {
            args.push("--src-creds".to_string());
            args.push(format!("{user}:{pass}"));
        }
        if let Some((user, pass)) = dest_creds {
            args.push("--dest-creds".to_string());
            args.push(format!("{user}:{pass}"));
        }
        args.push(src.to_string());
        args.push(dst.to_string());

        let output = command::run(CommandSpec::new("skopeo", args).with_env(self.config.proxy_env())).await?;
        if !output.success() {
            return Err(Error::ToolFailure(format!("skopeo copy {src} -> {dst} failed: {}", output.stderr)));
        }
        Ok(())
    }

    async fn update<F>(&self, id: Uuid, f: F)
    where
        F: FnOnce(&mut SyncJob),
    {
        if let Some(job) = self.jobs.write().await.get_mut(&id) {
            f(job);
        }
    }
}

impl Config {
    fn registry_url_host(&self) -> &str {
        self.registry_url
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_source_parses_the_all_sentinel() {
        assert!(matches!(SyncSource::parse("all"), SyncSource::All));
    }

    #[test]
    fn sync_source_parses_a_single_repo_tag_pair() {
        match SyncSource::parse("library/alpine:3.19") {
            SyncSource::Single { repo, tag } => {
                assert_eq!(repo, "library/alpine");
                assert_eq!(tag, "3.19");
            }
            SyncSource::All => panic!("expected Single"),
        }
    }

    #[test]
    fn basename_strips_any_in_registry_prefix() {
        let repo = "library/alpine";
        let basename = repo.rsplit('/').next().unwrap_or(repo);
        assert_eq!(basename, "alpine");
    }
}
