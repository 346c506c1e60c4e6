//! Registry HTTP client (C5).
//!
//! A typed client for the subset of the OCI Distribution v2 API the core
//! consumes: ping, catalog, tags, manifests, blobs, delete (§6 "Upstream
//! registry"). Used by the proxy (as the forwarding target), the staging
//! engine (ghost detection ahead of orphan handling), and the replication
//! engine (catalog enumeration).

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::Semaphore;

use crate::{Error, Result};

const MANIFEST_ACCEPT: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.oci.image.index.v1+json"
);

#[derive(Debug, Clone)]
pub struct ManifestResponse {
    pub digest: Option<String>,
    pub content_type: String,
    pub content_length: Option<u64>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

pub struct RegistryClient {
    base_url: String,
    client: reqwest::Client,
    credentials: Option<RegistryCredentials>,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            credentials: None,
        })
    }

    pub fn with_credentials(mut self, credentials: Option<RegistryCredentials>) -> Self {
        self.credentials = credentials;
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.client.request(method, url);
        if let Some(creds) = &self.credentials {
            builder = builder.basic_auth(&creds.username, Some(&creds.password));
        }
        builder
    }

    fn map_connect_err(e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::UpstreamTimeout
        } else if e.is_connect() {
            Error::UpstreamUnreachable(e.to_string())
        } else {
            Error::Http(e)
        }
    }

    pub async fn ping(&self) -> Result<bool> {
        let response = self
            .request(reqwest::Method::GET, "/v2/")
            .send()
            .await
            .map_err(Self::map_connect_err)?;
        Ok(response.status().is_success() || response.status() == StatusCode::UNAUTHORIZED)
    }

    /// Reachability + auth check used before a destination is accepted for
    /// replication.
    pub async fn test_connection(&self) -> Result<bool> {
        let response = self
            .request(reqwest::Method::GET, "/v2/")
            .send()
            .await
            .map_err(Self::map_connect_err)?;
        Ok(response.status().is_success())
    }

    async fn catalog_page(&self, last: Option<&str>, n: u32) -> Result<(Vec<String>, bool)> {
        let mut path = format!("/v2/_catalog?n={n}");
        if let Some(last) = last {
            path.push_str(&format!("&last={last}"));
        }
        let response = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(Self::map_connect_err)?;
        if !response.status().is_success() {
            return Err(Error::ToolFailure(format!(
                "catalog request failed: {}",
                response.status()
            )));
        }
        #[derive(serde::Deserialize)]
        struct Catalog {
            repositories: Vec<String>,
        }
        let has_next = response.headers().contains_key(reqwest::header::LINK);
        let catalog: Catalog = response.json().await?;
        Ok((catalog.repositories, has_next))
    }

    async fn full_catalog(&self) -> Result<Vec<String>> {
        let mut all = Vec::new();
        let mut last: Option<String> = None;
        loop {
            let (page, has_next) = self.catalog_page(last.as_deref(), 100).await?;
            if page.is_empty() {
                break;
            }
            last = page.last().cloned();
            all.extend(page);
            if !has_next {
                break;
            }
        }
        Ok(all)
    }

    /// Repositories in the catalog. When `exclude_ghosts` is set, repositories
    /// with an empty tag list are filtered out, using a bounded-concurrency
    /// fan-out over `list_tags` (§4.6, §5 "Suspension points").
    pub async fn list_repositories(self: &Arc<Self>, exclude_ghosts: bool, fanout: usize) -> Result<Vec<String>> {
        let repos = self.full_catalog().await?;
        if !exclude_ghosts {
            return Ok(repos);
        }
        let semaphore = Arc::new(Semaphore::new(fanout.max(1)));
        let mut tasks = Vec::with_capacity(repos.len());
        for repo in repos {
            let client = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let tags = client.list_tags(&repo).await.unwrap_or_default();
                (repo, tags)
            }));
        }
        let mut kept = Vec::new();
        for task in tasks {
            let (repo, tags) = task.await?;
            if !tags.is_empty() {
                kept.push(repo);
            }
        }
        Ok(kept)
    }

    /// Repositories present in the catalog with zero tags.
    pub async fn list_ghost_repositories(self: &Arc<Self>, fanout: usize) -> Result<Vec<String>> {
        let repos = self.full_catalog().await?;
        let semaphore = Arc::new(Semaphore::new(fanout.max(1)));
        let mut tasks = Vec::with_capacity(repos.len());
        for repo in repos {
            let client = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let tags = client.list_tags(&repo).await.unwrap_or_default();
                (repo, tags)
            }));
        }
        let mut ghosts = Vec::new();
        for task in tasks {
            let (repo, tags) = task.await?;
            if tags.is_empty() {
                ghosts.push(repo);
            }
        }
        Ok(ghosts)
    }

    pub async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v2/{repo}/tags/list"))
            .send()
            .await
            .map_err(Self::map_connect_err)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Error::ToolFailure(format!(
                "tags list for {repo} failed: {}",
                response.status()
            )));
        }
        #[derive(serde::Deserialize)]
        struct Tags {
            tags: Option<Vec<String>>,
        }
        let tags: Tags = response.json().await?;
        Ok(tags.tags.unwrap_or_default())
    }

    pub async fn get_manifest(&self, repo: &str, reference: &str) -> Result<ManifestResponse> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v2/{repo}/manifests/{reference}"))
            .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(Self::map_connect_err)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("manifest {repo}:{reference}")));
        }
        if !response.status().is_success() {
            return Err(Error::ToolFailure(format!(
                "get manifest {repo}:{reference} failed: {}",
                response.status()
            )));
        }
        let digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let content_length = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response.bytes().await?.to_vec();
        Ok(ManifestResponse {
            digest,
            content_type,
            content_length,
            body,
        })
    }

    pub async fn get_image_config(&self, repo: &str, digest: &str) -> Result<Vec<u8>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v2/{repo}/blobs/{digest}"))
            .send()
            .await
            .map_err(Self::map_connect_err)?;
        if !response.status().is_success() {
            return Err(Error::NotFound(format!("blob {repo}@{digest}")));
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Total on-disk size of an image, summing layer sizes across every
    /// platform manifest when `reference` resolves to a manifest list/index.
    pub async fn get_image_size(&self, repo: &str, reference: &str) -> Result<u64> {
        let manifest = self.get_manifest(repo, reference).await?;
        let parsed: serde_json::Value = serde_json::from_slice(&manifest.body)?;

        if let Some(manifests) = parsed.get("manifests").and_then(|m| m.as_array()) {
            let mut total = 0u64;
            for entry in manifests {
                if let Some(digest) = entry.get("digest").and_then(|d| d.as_str()) {
                    total += self.get_image_size(repo, digest).await?;
                }
            }
            return Ok(total);
        }

        let mut total = parsed
            .get("config")
            .and_then(|c| c.get("size"))
            .and_then(|s| s.as_u64())
            .unwrap_or(0);
        if let Some(layers) = parsed.get("layers").and_then(|l| l.as_array()) {
            for layer in layers {
                total += layer.get("size").and_then(|s| s.as_u64()).unwrap_or(0);
            }
        }
        Ok(total)
    }

    pub async fn put_manifest(
        &self,
        repo: &str,
        reference: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/v2/{repo}/manifests/{reference}"))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(Self::map_connect_err)?;
        if !response.status().is_success() {
            return Err(Error::ToolFailure(format!(
                "put manifest {repo}:{reference} failed: {}",
                response.status()
            )));
        }
        Ok(())
    }

    pub async fn delete_manifest(&self, repo: &str, digest: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/v2/{repo}/manifests/{digest}"))
            .send()
            .await
            .map_err(Self::map_connect_err)?;
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(Error::ToolFailure(format!(
                "delete manifest {repo}@{digest} failed: {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Resolve `tag` to its digest, then delete by digest — the Distribution
    /// API has no delete-by-tag endpoint.
    pub async fn delete_tag(&self, repo: &str, tag: &str) -> Result<()> {
        let manifest = self.get_manifest(repo, tag).await?;
        let digest = manifest
            .digest
            .ok_or_else(|| Error::FatalInternal(format!("registry returned no digest for {repo}:{tag}")))?;
        self.delete_manifest(repo, &digest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn list_tags_on_missing_repo_returns_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/ghost/app/tags/list"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let client = RegistryClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let tags = client.list_tags("ghost/app").await.unwrap();
        assert!(tags.is_empty());
    }

    #[tokio::test]
    async fn get_manifest_extracts_digest_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/library/alpine/manifests/3.19"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("docker-content-digest", "sha256:deadbeef")
                    .set_body_raw(r#"{"schemaVersion":2}"#, "application/vnd.docker.distribution.manifest.v2+json"),
            )
            .mount(&server)
            .await;
        let client = RegistryClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let manifest = client.get_manifest("library/alpine", "3.19").await.unwrap();
        assert_eq!(manifest.digest.as_deref(), Some("sha256:deadbeef"));
    }

    #[tokio::test]
    async fn ghost_repositories_are_those_with_empty_tag_lists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/_catalog"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "repositories": ["active/app", "ghost/app"]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/active/app/tags/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"tags": ["v1"]})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/ghost/app/tags/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"tags": []})))
            .mount(&server)
            .await;

        let client = Arc::new(RegistryClient::new(server.uri(), Duration::from_secs(5)).unwrap());
        let ghosts = client.list_ghost_repositories(4).await.unwrap();
        assert_eq!(ghosts, vec!["ghost/app".to_string()]);

        let non_ghosts = client.list_repositories(true, 4).await.unwrap();
        assert_eq!(non_ghosts, vec!["active/app".to_string()]);
    }
}
