//! Client side of the frontend's backend API.
//!
//! The frontend owns build records; the backend pulls pending tasks from it
//! and reports state changes back. Every failure here is transient from the
//! daemon's point of view: callers log it and try again on the next cycle.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::FrontendConfig;
use crate::scheduler::job::{BuildTask, TaskUpdate};

const AUTH_USER: &str = "user";

#[derive(Error, Debug)]
pub enum FrontendError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("frontend returned {status} for {path}")]
    Status { status: StatusCode, path: String },

    #[error("frontend rejected the backend password")]
    Unauthorized,
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    builds: &'a [TaskUpdate],
}

#[derive(Serialize)]
struct StartingBuildRequest<'a> {
    task_id: &'a str,
    build_id: u64,
    chroot: Option<&'a str>,
}

#[derive(Deserialize)]
struct StartingBuildResponse {
    can_start: bool,
}

#[async_trait]
pub trait FrontendClient: Send + Sync {
    async fn pending_jobs(&self) -> Result<Vec<BuildTask>, FrontendError>;

    /// Ask whether the task may start; false if it was cancelled meanwhile.
    async fn starting_build(&self, task: &BuildTask) -> Result<bool, FrontendError>;

    async fn update(&self, updates: &[TaskUpdate]) -> Result<(), FrontendError>;

    /// Put every build the frontend believes is running back to pending.
    async fn reschedule_all_running(&self) -> Result<(), FrontendError>;
}

#[derive(Debug, Clone)]
pub struct HttpFrontendClient {
    client: Client,
    base_url: String,
    auth: String,
}

impl HttpFrontendClient {
    pub fn new(config: &FrontendConfig) -> Result<Self, FrontendError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth: config.auth.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/backend/{}/", self.base_url, path)
    }

    async fn send(&self, path: &str, req: RequestBuilder) -> Result<reqwest::Response, FrontendError> {
        let resp = req.basic_auth(AUTH_USER, Some(&self.auth)).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(FrontendError::Unauthorized),
            status => Err(FrontendError::Status {
                status,
                path: path.to_string(),
            }),
        }
    }
}

#[async_trait]
impl FrontendClient for HttpFrontendClient {
    async fn pending_jobs(&self) -> Result<Vec<BuildTask>, FrontendError> {
        let path = "pending-jobs";
        let resp = self.send(path, self.client.get(self.url(path))).await?;
        Ok(resp.json().await?)
    }

    async fn starting_build(&self, task: &BuildTask) -> Result<bool, FrontendError> {
        let path = "starting_build";
        let body = StartingBuildRequest {
            task_id: &task.task_id,
            build_id: task.build_id,
            chroot: task.chroot.as_deref(),
        };
        let resp = self
            .send(path, self.client.post(self.url(path)).json(&body))
            .await?;
        let parsed: StartingBuildResponse = resp.json().await?;
        Ok(parsed.can_start)
    }

    async fn update(&self, updates: &[TaskUpdate]) -> Result<(), FrontendError> {
        let path = "update";
        self.send(
            path,
            self.client
                .post(self.url(path))
                .json(&UpdateRequest { builds: updates }),
        )
        .await?;
        Ok(())
    }

    async fn reschedule_all_running(&self) -> Result<(), FrontendError> {
        let path = "reschedule_all_running";
        self.send(path, self.client.post(self.url(path))).await?;
        Ok(())
    }
}
