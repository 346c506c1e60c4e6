//! Audit sink (C2).
//!
//! Append-only JSONL file plus a bounded in-memory ring for live inspection.
//! Both are guarded by one lock so emission order always matches file order
//! within a process (§4.2, §8 "Audit order" invariant).

use std::collections::VecDeque;
use std::path::PathBuf;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::model::AuditEvent;
use crate::Result;

struct Inner {
    file: File,
    ring: VecDeque<AuditEvent>,
    capacity: usize,
}

pub struct AuditSink {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl AuditSink {
    pub async fn open(path: PathBuf, capacity: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let ring = Self::load_tail(&path, capacity).await?;
        Ok(Self {
            path,
            inner: Mutex::new(Inner { file, ring, capacity }),
        })
    }

    async fn load_tail(path: &PathBuf, capacity: usize) -> Result<VecDeque<AuditEvent>> {
        if !path.exists() {
            return Ok(VecDeque::new());
        }
        let file = File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut ring: VecDeque<AuditEvent> = VecDeque::with_capacity(capacity);
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(event) = serde_json::from_str::<AuditEvent>(&line) {
                if ring.len() == capacity {
                    ring.pop_front();
                }
                ring.push_back(event);
            }
        }
        Ok(ring)
    }

    /// Append `event` to disk and to the in-memory ring.
    pub async fn emit(&self, event: AuditEvent) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let line = serde_json::to_string(&event)?;
        inner.file.write_all(line.as_bytes()).await?;
        inner.file.write_all(b"\n").await?;
        inner.file.flush().await?;
        if inner.ring.len() == inner.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(event);
        Ok(())
    }

    /// Newest-first events, up to `limit`. Backfills from disk when the
    /// in-memory ring is shorter than requested.
    pub async fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let inner = self.inner.lock().await;
        if inner.ring.len() >= limit {
            return Ok(inner.ring.iter().rev().take(limit).cloned().collect());
        }
        drop(inner);
        let backfilled = Self::load_tail(&self.path, limit).await?;
        Ok(backfilled.into_iter().rev().take(limit).collect())
    }

    /// Resize the ring capacity and rewrite the JSONL file to keep only the
    /// last `max` events.
    pub async fn trim(&self, max: usize) -> Result<()> {
        let mut inner = self.inner.lock().await;
        while inner.ring.len() > max {
            inner.ring.pop_front();
        }
        inner.capacity = max;

        let tmp_path = self.path.with_extension("jsonl.tmp");
        let mut tmp = File::create(&tmp_path).await?;
        for event in inner.ring.iter() {
            let line = serde_json::to_string(event)?;
            tmp.write_all(line.as_bytes()).await?;
            tmp.write_all(b"\n").await?;
        }
        tmp.flush().await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        inner.file = OpenOptions::new().append(true).open(&self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(n: u16) -> AuditEvent {
        AuditEvent {
            event: "registry_pull".to_string(),
            timestamp: Utc::now(),
            path: Some(format!("/v2/repo/manifests/{n}")),
            method: Some("GET".to_string()),
            http_status: 200,
            bytes: 10,
            elapsed_s: 0.01,
            client_ip: None,
            username: Some("alice".to_string()),
        }
    }

    #[tokio::test]
    async fn emit_then_recent_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::open(dir.path().join("audit.jsonl"), 10).await.unwrap();
        for n in 0..3 {
            sink.emit(event(n)).await.unwrap();
        }
        let recent = sink.recent(10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].path.as_deref(), Some("/v2/repo/manifests/2"));
        assert_eq!(recent[2].path.as_deref(), Some("/v2/repo/manifests/0"));
    }

    #[tokio::test]
    async fn ring_never_exceeds_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::open(dir.path().join("audit.jsonl"), 2).await.unwrap();
        for n in 0..5 {
            sink.emit(event(n)).await.unwrap();
        }
        let recent = sink.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].path.as_deref(), Some("/v2/repo/manifests/4"));
    }

    #[tokio::test]
    async fn trim_rewrites_file_to_new_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::open(dir.path().join("audit.jsonl"), 10).await.unwrap();
        for n in 0..5 {
            sink.emit(event(n)).await.unwrap();
        }
        sink.trim(2).await.unwrap();
        let recent = sink.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
    }
}
