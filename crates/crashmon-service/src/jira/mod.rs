//! A minimal client of the Jira REST API.

use std::io;
use std::path::Path;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde_json::{Value, json};
use thiserror::Error;

use crate::utils::http::create_client;

mod types;

pub use types::{Attachment, Issue, IssueFields, Named, SearchPage, TIME_FORMAT, Transition};
use types::{CreatedIssue, Transitions};

/// Issue fields requested when reading an issue.
const ISSUE_FIELDS: &str = "status,fixVersions,versions,attachment,summary,description,components";

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("issue {0} does not exist")]
    NotFound(String),
    #[error("{method} {url} failed with {status}")]
    Status {
        method: Method,
        url: Url,
        status: StatusCode,
    },
    #[error("issue tracker request failed")]
    Transport(#[from] reqwest::Error),
    #[error("invalid issue tracker url")]
    Url(#[from] url::ParseError),
    #[error("unable to read attachment")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Clone, Debug)]
pub struct JiraClient {
    client: reqwest::Client,
    api: Url,
    login: String,
    password: String,
}

impl JiraClient {
    pub fn new(
        url: &Url,
        login: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, TrackerError> {
        let mut base = url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            client: create_client(timeout)?,
            api: base.join("rest/api/2/")?,
            login: login.to_owned(),
            password: password.to_owned(),
        })
    }

    /// Creates an issue with the given `fields` and returns its key.
    pub async fn create_issue(&self, fields: Value) -> Result<String, TrackerError> {
        let request = self.request(Method::POST, "issue")?;
        let response = self.send(request.json(&json!({ "fields": fields }))).await?;
        let created: CreatedIssue = response.json().await?;
        Ok(created.key)
    }

    pub async fn issue(&self, key: &str) -> Result<Issue, TrackerError> {
        let request = self
            .request(Method::GET, &format!("issue/{key}"))?
            .query(&[("fields", ISSUE_FIELDS)]);
        match self.send(request).await {
            Err(TrackerError::Status {
                status: StatusCode::NOT_FOUND,
                ..
            }) => Err(TrackerError::NotFound(key.to_owned())),
            result => Ok(result?.json().await?),
        }
    }

    pub async fn update_fields(&self, key: &str, fields: Value) -> Result<(), TrackerError> {
        let request = self.request(Method::PUT, &format!("issue/{key}"))?;
        self.send(request.json(&json!({ "fields": fields }))).await?;
        Ok(())
    }

    /// Uploads the file at `path` as an attachment named after the file.
    pub async fn add_attachment(&self, key: &str, path: &Path) -> Result<(), TrackerError> {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content = tokio::fs::read(path).await?;
        let form = Form::new().part("file", Part::bytes(content).file_name(filename));

        let request = self
            .request(Method::POST, &format!("issue/{key}/attachments"))?
            .header("X-Atlassian-Token", "no-check")
            .multipart(form);
        self.send(request).await?;
        Ok(())
    }

    pub async fn delete_attachment(&self, id: &str) -> Result<(), TrackerError> {
        let request = self.request(Method::DELETE, &format!("attachment/{id}"))?;
        self.send(request).await?;
        Ok(())
    }

    pub async fn transitions(&self, key: &str) -> Result<Vec<Transition>, TrackerError> {
        let request = self.request(Method::GET, &format!("issue/{key}/transitions"))?;
        let transitions: Transitions = self.send(request).await?.json().await?;
        Ok(transitions.transitions)
    }

    pub async fn transition_issue(&self, key: &str, id: &str) -> Result<(), TrackerError> {
        let request = self.request(Method::POST, &format!("issue/{key}/transitions"))?;
        self.send(request.json(&json!({ "transition": { "id": id } })))
            .await?;
        Ok(())
    }

    /// Returns one page of issues matching `jql`.
    pub async fn search(
        &self,
        jql: &str,
        start_at: usize,
        max_results: usize,
    ) -> Result<SearchPage, TrackerError> {
        let start_at = start_at.to_string();
        let max_results = max_results.to_string();
        let request = self.request(Method::GET, "search")?.query(&[
            ("jql", jql),
            ("startAt", start_at.as_str()),
            ("maxResults", max_results.as_str()),
            ("fields", ISSUE_FIELDS),
        ]);
        Ok(self.send(request).await?.json().await?)
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, TrackerError> {
        let url = self.api.join(path)?;
        Ok(self
            .client
            .request(method, url)
            .basic_auth(&self.login, Some(&self.password)))
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, TrackerError> {
        let request = request.build()?;
        let method = request.method().clone();
        let url = request.url().clone();

        let response = self.client.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!("{} {} failed: {}", method, url, body);
            return Err(TrackerError::Status {
                method,
                url,
                status,
            });
        }
        Ok(response)
    }
}
