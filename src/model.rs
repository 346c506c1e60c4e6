//! Shared data types (§3 of the design).
//!
//! Dynamic dispatch / stringly-typed state is replaced throughout with
//! closed tagged variants: [`JobStatus`], [`Principal`], [`SyncSource`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An authenticated caller, resolved fresh per request. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Principal {
    Admin { username: String },
    User {
        username: String,
        can_pull_global: bool,
        can_push_global: bool,
    },
}

impl Principal {
    pub fn username(&self) -> &str {
        match self {
            Principal::Admin { username } => username,
            Principal::User { username, .. } => username,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Principal::Admin { .. })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FolderPermission {
    pub username: String,
    pub can_pull: bool,
    pub can_push: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Folder {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub permissions: Vec<FolderPermission>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub is_admin: bool,
    pub can_pull_images: bool,
    pub can_push_images: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Pulling,
    VulnScanning,
    ScanSkipped,
    ScanClean,
    ScanVulnerable,
    Pushing,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::ScanVulnerable)
    }

    /// States from which a push request is accepted (§9 open question:
    /// `done` included alongside `scan_clean`/`scan_skipped` to allow re-push).
    pub fn is_pushable(self) -> bool {
        matches!(self, JobStatus::ScanClean | JobStatus::ScanSkipped | JobStatus::Done)
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SeverityCounts {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub unknown: u32,
}

impl SeverityCounts {
    pub fn get(&self, severity: &str) -> u32 {
        match severity.to_ascii_uppercase().as_str() {
            "CRITICAL" => self.critical,
            "HIGH" => self.high,
            "MEDIUM" => self.medium,
            "LOW" => self.low,
            _ => self.unknown,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: String,
    pub severity: String,
    pub package: String,
    pub installed_version: String,
    pub fixed_version: Option<String>,
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VulnResult {
    pub counts: SeverityCounts,
    pub vulnerabilities: Vec<Vulnerability>,
    pub blocked: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobOverrides {
    pub vuln_scan_enabled: Option<bool>,
    pub vuln_severities: Option<Vec<String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StagingJob {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub image: String,
    pub tag: String,
    pub progress: u8,
    pub message: String,
    pub vuln_result: Option<VulnResult>,
    pub target_image: Option<String>,
    pub target_tag: Option<String>,
    pub error: Option<String>,
    pub overrides: JobOverrides,
    pub created_at: DateTime<Utc>,
}

impl StagingJob {
    pub fn new(job_id: Uuid, image: String, tag: String, overrides: JobOverrides) -> Self {
        Self {
            job_id,
            status: JobStatus::Pending,
            image,
            tag,
            progress: 0,
            message: "queued".to_string(),
            vuln_result: None,
            target_image: None,
            target_tag: None,
            error: None,
            overrides,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Done,
    Partial,
    Error,
}

/// What a replication job copies: a single repo:tag pair, or the whole
/// catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncSource {
    All,
    Single { repo: String, tag: String },
}

impl SyncSource {
    pub const ALL_SENTINEL: &'static str = "all";

    pub fn parse(spec: &str) -> Self {
        if spec == Self::ALL_SENTINEL {
            return SyncSource::All;
        }
        match spec.split_once(':') {
            Some((repo, tag)) => SyncSource::Single {
                repo: repo.to_string(),
                tag: tag.to_string(),
            },
            None => SyncSource::Single {
                repo: spec.to_string(),
                tag: "latest".to_string(),
            },
        }
    }

    pub fn as_spec(&self) -> String {
        match self {
            SyncSource::All => Self::ALL_SENTINEL.to_string(),
            SyncSource::Single { repo, tag } => format!("{repo}:{tag}"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub source_spec: String,
    pub dest_registry_id: Uuid,
    pub dest_folder: Option<String>,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub images_total: usize,
    pub images_done: usize,
    pub progress: u8,
    pub error: Option<Vec<String>>,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExternalRegistry {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExternalRegistry {
    /// Redacted copy safe to hand back to any caller leaving the process.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.password.is_some() {
            copy.password = Some("••••••••".to_string());
        }
        copy
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub path: Option<String>,
    pub method: Option<String>,
    pub http_status: u16,
    pub bytes: u64,
    pub elapsed_s: f64,
    pub client_ip: Option<String>,
    pub username: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GCStatus {
    #[default]
    Idle,
    Running,
    Done,
    Failed,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GCState {
    pub status: GCStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: String,
    pub freed_bytes: u64,
    pub error: Option<String>,
}
