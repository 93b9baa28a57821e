use crate::config::CliConfig;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Server rejected the request: {0}")]
    Rejected(String),
    #[error("Server error: {0}")]
    Server(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSummary {
    pub id: String,
    pub hostname: Option<String>,
    pub connected_date: String,
    pub busy: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildSummary {
    pub id: String,
    pub submission_date: String,
    pub build_url: String,
}

#[derive(Serialize)]
struct SubmitBuild<'a> {
    #[serde(rename = "Url")]
    url: &'a str,
    #[serde(rename = "Commit")]
    commit: &'a str,
}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(config: &CliConfig) -> Self {
        Self::with_base_url(config.api_url())
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client.request(method, format!("{}{}", self.base_url, path))
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentSummary>, ApiError> {
        let res = self.request(reqwest::Method::GET, "/agents").send().await?;

        match res.status() {
            StatusCode::OK => Ok(res.json().await?),
            status => Err(ApiError::Server(status.to_string())),
        }
    }

    pub async fn list_builds(&self) -> Result<Vec<BuildSummary>, ApiError> {
        let res = self.request(reqwest::Method::GET, "/builds").send().await?;

        match res.status() {
            StatusCode::OK => Ok(res.json().await?),
            status => Err(ApiError::Server(status.to_string())),
        }
    }

    pub async fn submit_build(&self, url: &str, commit: &str) -> Result<(), ApiError> {
        let res = self
            .request(reqwest::Method::POST, "/builds")
            .json(&SubmitBuild { url, commit })
            .send()
            .await?;

        match res.status() {
            StatusCode::ACCEPTED => Ok(()),
            StatusCode::UNPROCESSABLE_ENTITY => Err(ApiError::Rejected(res.text().await?)),
            status => Err(ApiError::Server(status.to_string())),
        }
    }
}
