//! Staging job engine (C7).
//!
//! A stateful pipeline (PULL → SCAN → PUSH) operating on local OCI layouts.
//! Owns the in-memory job table and the per-job staging directories; each
//! job's pipeline steps run strictly sequentially on the task that owns it
//! (§5 "Ordering guarantees").

pub mod vuln;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::command::{self, CommandSpec};
use crate::config::Config;
use crate::model::{JobOverrides, JobStatus, StagingJob};
use crate::pathsafety::{self, validate_folder_path};
use crate::{Error, Result};

pub struct PushTarget {
    pub target_image: Option<String>,
    pub target_tag: Option<String>,
    pub folder: Option<String>,
    pub external_host: Option<String>,
    pub external_creds: Option<(String, String)>,
}

pub struct StagingEngine {
    config: Arc<Config>,
    jobs: RwLock<HashMap<Uuid, StagingJob>>,
}

/// A string accepted as a `job_id` at an API boundary must parse as UUIDv4;
/// anything else is a 400 (§4.4 "Tie-breaks & edge cases").
pub fn parse_job_id(raw: &str) -> Result<Uuid> {
    let id = Uuid::parse_str(raw).map_err(|_| Error::Validation(format!("invalid job id: {raw:?}")))?;
    if id.get_version_num() != 4 {
        return Err(Error::Validation(format!("job id is not a UUIDv4: {raw:?}")));
    }
    Ok(id)
}

impl StagingEngine {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    fn staging_dir(&self, job_id: Uuid) -> PathBuf {
        self.config.staging_root.join(job_id.to_string())
    }

    pub async fn get(&self, job_id: Uuid) -> Result<StagingJob> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("staging job {job_id}")))
    }

    pub async fn list(&self) -> Vec<StagingJob> {
        self.jobs.read().await.values().cloned().collect()
    }

    pub async fn delete(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.remove(&job_id).is_none() {
            return Err(Error::NotFound(format!("staging job {job_id}")));
        }
        drop(jobs);
        let dir = self.staging_dir(job_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Mark every non-terminal job as failed. Called on clean shutdown (§9
    /// "Module-level mutable state").
    pub async fn fail_all_pending(&self) {
        let mut jobs = self.jobs.write().await;
        for job in jobs.values_mut() {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.message = "cancelled: server shutting down".to_string();
                job.error = Some("shutdown".to_string());
            }
        }
    }

    async fn set<F>(&self, job_id: Uuid, f: F)
    where
        F: FnOnce(&mut StagingJob),
    {
        if let Some(job) = self.jobs.write().await.get_mut(&job_id) {
            f(job);
        }
    }

    /// Start a pull pipeline and return immediately with the new job's id;
    /// the pipeline itself runs on its own task.
    pub async fn pull(self: &Arc<Self>, image: String, tag: String, overrides: JobOverrides) -> Uuid {
        let job_id = Uuid::new_v4();
        let job = StagingJob::new(job_id, image, tag, overrides);
        self.jobs.write().await.insert(job_id, job);

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_pull_pipeline(job_id).await;
        });
        job_id
    }

    #[tracing::instrument(skip(self), fields(job_id = %job_id))]
    async fn run_pull_pipeline(self: Arc<Self>, job_id: Uuid) {
        if let Err(e) = self.run_pull_pipeline_fallible(job_id).await {
            tracing::error!(error = %e, "staging pull pipeline failed");
            self.set(job_id, |job| {
                job.status = JobStatus::Failed;
                job.error = Some(e.to_string());
                job.message = "pull failed".to_string();
            })
            .await;
            let dir = self.staging_dir(job_id);
            let _ = tokio::fs::remove_dir_all(&dir).await;
        }
    }

    async fn run_pull_pipeline_fallible(&self, job_id: Uuid) -> Result<()> {
        let job = self.get(job_id).await?;
        let dir = self.staging_dir(job_id);
        tokio::fs::create_dir_all(&dir).await?;

        self.set(job_id, |job| {
            job.status = JobStatus::Pulling;
            job.progress = 10;
            job.message = "pulling".to_string();
        })
        .await;

        let mut args = vec!["copy".to_string(), "--override-os".to_string(), "linux".to_string()];
        if let Some((user, pass)) = self.config.dockerhub_creds() {
            args.push("--src-creds".to_string());
            args.push(format!("{user}:{pass}"));
        }
        args.push(format!("docker://{}:{}", job.image, job.tag));
        args.push(format!("oci:{}:latest", dir.display()));

        let output = command::run(
            CommandSpec::new("skopeo", args).with_env(self.config.proxy_env()),
        )
        .await?;
        if !output.success() {
            return Err(Error::ToolFailure(format!("skopeo copy (pull) failed: {}", output.stderr)));
        }

        self.set(job_id, |job| {
            job.progress = 50;
            job.message = "pulled".to_string();
        })
        .await;

        let vuln_enabled = job.overrides.vuln_scan_enabled.unwrap_or(self.config.vuln_scan_enabled);
        if !vuln_enabled {
            self.set(job_id, |job| {
                job.status = JobStatus::ScanSkipped;
                job.progress = 100;
                job.message = "scan skipped".to_string();
            })
            .await;
            return Ok(());
        }

        self.set(job_id, |job| {
            job.status = JobStatus::VulnScanning;
            job.progress = 85;
            job.message = "scanning".to_string();
        })
        .await;

        let severities = job.overrides.vuln_severities.clone().unwrap_or_else(|| self.config.vuln_scan_severities.clone());
        let mut trivy_args = vec![
            "image".to_string(),
            "--format".to_string(),
            "json".to_string(),
            "--server".to_string(),
            self.config.trivy_server_url.clone(),
            "--severity".to_string(),
            severities.join(","),
        ];
        if self.config.vuln_ignore_unfixed {
            trivy_args.push("--ignore-unfixed".to_string());
        }
        trivy_args.push("--timeout".to_string());
        trivy_args.push(format!("{}s", self.config.vuln_scan_timeout_secs));
        trivy_args.push("--input".to_string());
        trivy_args.push(dir.display().to_string());

        let scan_output = command::run(
            CommandSpec::new("trivy", trivy_args)
                .with_deadline(std::time::Duration::from_secs(self.config.vuln_scan_timeout_secs)),
        )
        .await?;

        // trivy exits 0 (clean) or 1 (findings present); anything else is an error.
        if scan_output.timed_out || !matches!(scan_output.exit_code, 0 | 1) {
            return Err(Error::ToolFailure(format!("trivy scan failed: {}", scan_output.stderr)));
        }

        let result = vuln::parse_trivy_output(&scan_output.stdout, &severities)?;
        let blocked = result.blocked;
        self.set(job_id, move |job| {
            job.vuln_result = Some(result);
            job.status = if blocked { JobStatus::ScanVulnerable } else { JobStatus::ScanClean };
            job.progress = 100;
            job.message = if blocked { "blocked by vulnerability scan".to_string() } else { "scan clean".to_string() };
        })
        .await;

        Ok(())
    }

    /// Start a push and return immediately; the push itself runs on its own
    /// task, same as pull.
    pub async fn push(self: &Arc<Self>, job_id: Uuid, target: PushTarget) -> Result<()> {
        let job = self.get(job_id).await?;

        if matches!(job.status, JobStatus::ScanVulnerable) {
            return Err(Error::Validation("Image must pass scanning".to_string()));
        }
        if !job.status.is_pushable() {
            return Err(Error::Conflict(format!(
                "job {job_id} is in state {:?}, not ready to push",
                job.status
            )));
        }
        if let Some(folder) = &target.folder {
            validate_folder_path(folder)?;
        }

        let dir = self.staging_dir(job_id);
        if !dir.exists() {
            return Err(Error::NotFound("OCI directory not found".to_string()));
        }

        self.set(job_id, |job| {
            job.status = JobStatus::Pushing;
            job.message = "pushing".to_string();
        })
        .await;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.run_push(job_id, target).await {
                tracing::error!(error = %e, "staging push failed");
                engine
                    .set(job_id, |job| {
                        job.status = JobStatus::Failed;
                        job.error = Some(e.to_string());
                        job.message = "push failed".to_string();
                    })
                    .await;
            }
        });
        Ok(())
    }

    async fn run_push(&self, job_id: Uuid, target: PushTarget) -> Result<()> {
        let job = self.get(job_id).await?;
        let dir = self.staging_dir(job_id);

        let image = target.target_image.clone().unwrap_or_else(|| job.image.clone());
        let tag = target.target_tag.clone().unwrap_or_else(|| job.tag.clone());
        let folder_prefix = target.folder.as_ref().map(|f| format!("{f}/")).unwrap_or_default();

        let mut args = vec!["copy".to_string()];
        let dest = if let Some(host) = &target.external_host {
            if let Some((user, pass)) = &target.external_creds {
                args.push("--dest-creds".to_string());
                args.push(format!("{user}:{pass}"));
            }
            format!("docker://{host}/{folder_prefix}{image}:{tag}")
        } else {
            if self.config.push_is_plain_http() {
                args.push("--dest-tls-verify=false".to_string());
            }
            format!("docker://{}/{folder_prefix}{image}:{tag}", self.config.push_host())
        };
        args.push(format!("oci:{}:latest", dir.display()));
        args.push(dest);

        let output = command::run(CommandSpec::new("skopeo", args).with_env(self.config.proxy_env())).await?;
        if !output.success() {
            return Err(Error::ToolFailure(format!("skopeo copy (push) failed: {}", output.stderr)));
        }

        self.set(job_id, move |job| {
            job.status = JobStatus::Done;
            job.progress = 100;
            job.message = "done".to_string();
            job.target_image = Some(image);
            job.target_tag = Some(tag);
        })
        .await;
        Ok(())
    }

    /// Directories under `staging_root` that have no corresponding live job.
    pub async fn list_orphans(&self) -> Result<Vec<(String, u64)>> {
        let live: std::collections::HashSet<Uuid> = self.jobs.read().await.keys().copied().collect();
        let mut orphans = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.config.staging_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_live = Uuid::parse_str(&name).map(|id| live.contains(&id)).unwrap_or(false);
            if is_live {
                continue;
            }
            let size = directory_size(&entry.path()).await?;
            orphans.push((name, size));
        }
        Ok(orphans)
    }

    pub async fn purge_orphans(&self) -> Result<u64> {
        let orphans = self.list_orphans().await?;
        let mut freed = 0u64;
        for (name, size) in orphans {
            let path = pathsafety::contained_child(&self.config.staging_root, &name).await?;
            tokio::fs::remove_dir_all(&path).await?;
            freed += size;
        }
        Ok(freed)
    }
}

async fn directory_size(path: &std::path::Path) -> Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
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
    fn job_id_must_be_a_uuidv4() {
        assert!(parse_job_id(&Uuid::new_v4().to_string()).is_ok());
        assert!(parse_job_id("not-a-uuid").is_err());
        // a nil UUID is a valid UUID but not version 4.
        assert!(parse_job_id(&Uuid::nil().to_string()).is_err());
    }

    #[tokio::test]
    async fn orphan_purge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.staging_root = dir.path().to_path_buf();
        let engine = StagingEngine::new(Arc::new(config));

        let orphan_dir = dir.path().join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&orphan_dir).await.unwrap();
        tokio::fs::write(orphan_dir.join("blob"), b"hello").await.unwrap();

        let freed_first = engine.purge_orphans().await.unwrap();
        assert_eq!(freed_first, 5);
        let freed_second = engine.purge_orphans().await.unwrap();
        assert_eq!(freed_second, 0);
    }

    fn test_config() -> Config {
        use clap::Parser;
        Config::parse_from([
            "portalcrane",
            "--registry-url", "http://127.0.0.1:5000",
            "--secret-key", "test-secret",
            "--admin-password", "test-admin-pw",
            "--trivy-server-url", "http://127.0.0.1:4954",
            "--staging-root", "/tmp/staging",
            "--registry-data-root", "/tmp/registry-data",
            "--data-dir", "/tmp/data",
            "--public-base-url", "http://127.0.0.1:8080",
            "--supervisor-rpc-url", "http://127.0.0.1:9001/RPC2",
            "--registry-config-path", "/tmp/registry-config.yml",
        ])
    }
}
