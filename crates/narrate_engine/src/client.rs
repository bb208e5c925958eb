use std::time::Duration;

use narrate_core::{Job, JobFilter, ParentEntity, QueryData, QueryKey};
use narrate_logging::narrate_debug;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::{RequestError, RequestFailure};

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Page size for job-list queries; the server caps it at 100.
    pub list_limit: u32,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8765".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            list_limit: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    /// `cancelled`, `cancelling`, the terminal status the job already had,
    /// or `error`.
    pub status: String,
    pub job_id: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Deserialize)]
struct JobList {
    #[serde(default)]
    jobs: Vec<Job>,
}

#[derive(Deserialize)]
struct Cleanup {
    #[serde(default)]
    deleted: u32,
}

/// The REST side of the backend: refetches and user mutations.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn fetch(&self, key: &QueryKey) -> Result<QueryData, RequestError>;

    async fn cancel_job(&self, job_id: &str) -> Result<CancelOutcome, RequestError>;

    async fn delete_job(&self, job_id: &str) -> Result<(), RequestError>;

    /// Returns the new job created for the remaining segments.
    async fn resume_job(&self, job_id: &str) -> Result<Job, RequestError>;

    /// Deletes every completed and failed job; returns how many went.
    async fn clear_history(&self) -> Result<u32, RequestError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestBackend {
    client: reqwest::Client,
    settings: BackendSettings,
}

impl ReqwestBackend {
    pub fn new(settings: BackendSettings) -> Result<Self, RequestError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| RequestError::new(RequestFailure::Network, err.to_string()))?;
        Ok(Self { client, settings })
    }

    fn url(&self, path: &str) -> Result<Url, RequestError> {
        Url::parse(&format!(
            "{}{}",
            self.settings.base_url.trim_end_matches('/'),
            path
        ))
        .map_err(|err| RequestError::new(RequestFailure::InvalidUrl, err.to_string()))
    }

    fn list_url(&self, filter: &JobFilter) -> Result<Url, RequestError> {
        if filter.active_only {
            return self.url("/api/jobs/tts/active");
        }
        let mut url = self.url("/api/jobs/tts/")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(parent_id) = &filter.parent_id {
                query.append_pair("chapter_id", parent_id);
            }
            if let Some(status) = filter.status {
                query.append_pair("status", &status.to_string());
            }
            query.append_pair("limit", &self.settings.list_limit.to_string());
        }
        Ok(url)
    }

    async fn send(&self, method: Method, url: Url) -> Result<bytes::Bytes, RequestError> {
        narrate_debug!("{} {}", method, url);
        let response = self
            .client
            .request(method, url)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RequestError::new(
                RequestFailure::HttpStatus(status.as_u16()),
                if body.is_empty() { status.to_string() } else { body },
            ));
        }
        response.bytes().await.map_err(map_reqwest_error)
    }

    async fn send_json<T: DeserializeOwned>(&self, method: Method, url: Url) -> Result<T, RequestError> {
        let body = self.send(method, url).await?;
        serde_json::from_slice(&body)
            .map_err(|err| RequestError::new(RequestFailure::Decode, err.to_string()))
    }
}

#[async_trait::async_trait]
impl Backend for ReqwestBackend {
    async fn fetch(&self, key: &QueryKey) -> Result<QueryData, RequestError> {
        match key {
            QueryKey::Job(job_id) => {
                let url = self.url(&format!("/api/jobs/tts/{job_id}"))?;
                self.send_json(Method::GET, url).await.map(QueryData::Job)
            }
            QueryKey::Jobs(filter) => {
                let url = self.list_url(filter)?;
                let list: JobList = self.send_json(Method::GET, url).await?;
                Ok(QueryData::Jobs(list.jobs))
            }
            QueryKey::Parent(parent_id) => {
                let url = self.url(&format!("/api/chapters/{parent_id}"))?;
                let parent: ParentEntity = self.send_json(Method::GET, url).await?;
                Ok(QueryData::Parent(parent))
            }
        }
    }

    async fn cancel_job(&self, job_id: &str) -> Result<CancelOutcome, RequestError> {
        let url = self.url(&format!("/api/jobs/tts/{job_id}/cancel"))?;
        self.send_json(Method::POST, url).await
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), RequestError> {
        let url = self.url(&format!("/api/jobs/tts/{job_id}"))?;
        self.send(Method::DELETE, url).await.map(|_| ())
    }

    async fn resume_job(&self, job_id: &str) -> Result<Job, RequestError> {
        let url = self.url(&format!("/api/jobs/tts/{job_id}/resume"))?;
        self.send_json(Method::POST, url).await
    }

    async fn clear_history(&self) -> Result<u32, RequestError> {
        let url = self.url("/api/jobs/tts/cleanup")?;
        let cleanup: Cleanup = self.send_json(Method::DELETE, url).await?;
        Ok(cleanup.deleted)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> RequestError {
    if err.is_timeout() {
        return RequestError::new(RequestFailure::Timeout, err.to_string());
    }
    RequestError::new(RequestFailure::Network, err.to_string())
}
