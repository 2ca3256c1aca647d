//! Client of the crash server collecting reports from the field.

use bytes::Bytes;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;

use crate::config::FetchConfig;
use crate::utils::http::create_client;

#[derive(Debug, Error)]
pub enum CrashServerError {
    #[error("crash server request failed")]
    Transport(#[from] reqwest::Error),
    #[error("unable to get {url}: {status}")]
    Status { url: Url, status: StatusCode },
    #[error("invalid crash server url")]
    Url(#[from] url::ParseError),
}

/// An entry of the report listing.
#[derive(Debug, Deserialize)]
struct Dump {
    path: String,
}

/// Whether all characters of `s` are printable ASCII or ASCII whitespace.
fn is_ascii_printable(s: &str) -> bool {
    s.chars().all(|c| {
        c.is_ascii_graphic() || matches!(c, ' ' | '\t' | '\n' | '\r' | '\x0b' | '\x0c')
    })
}

#[derive(Clone, Debug)]
pub struct CrashServer {
    client: reqwest::Client,
    base: Url,
    login: String,
    password: String,
}

impl CrashServer {
    pub fn new(config: &FetchConfig) -> Result<Self, CrashServerError> {
        let mut base = config.url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            client: create_client(config.timeout)?,
            base,
            login: config.login.clone(),
            password: config.password.clone(),
        })
    }

    /// Lists the names of all reports with a matching `extension` glob.
    ///
    /// Server paths are turned into report names by replacing `/` with `--`. Paths with
    /// unprintable characters are dropped.
    pub async fn list_all(&self, extension: &str) -> Result<Vec<String>, CrashServerError> {
        let response = self.request("list", &[("extension", extension)]).await?;
        let url = response.url().clone();
        let dumps: Vec<Dump> = response.json().await?;

        let mut names = Vec::with_capacity(dumps.len());
        for dump in dumps {
            let path = dump.path.strip_prefix('/').unwrap_or(&dump.path);
            if is_ascii_printable(path) {
                names.push(path.replace('/', "--"));
            } else {
                tracing::debug!("Dropping unprintable report path {:?}", path);
            }
        }

        tracing::info!("Found {} reports by {}", names.len(), url);
        Ok(names)
    }

    /// Downloads the content of the report `name`.
    pub async fn get(&self, name: &str) -> Result<Bytes, CrashServerError> {
        let path = format!("/{}", name.replace("--", "/"));
        let response = self.request("get", &[("path", path.as_str())]).await?;
        Ok(response.bytes().await?)
    }

    async fn request(
        &self,
        api: &str,
        params: &[(&str, &str)],
    ) -> Result<reqwest::Response, CrashServerError> {
        let mut url = self.base.join(api)?;
        url.query_pairs_mut().extend_pairs(params);

        let response = self
            .client
            .get(url)
            .basic_auth(&self.login, Some(&self.password))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(CrashServerError::Status {
                url: response.url().clone(),
                status,
            });
        }
        Ok(response)
    }
}
