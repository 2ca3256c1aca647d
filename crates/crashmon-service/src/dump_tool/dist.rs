//! Build distributions published on web directory indexes.
//!
//! An index lists one directory per build (`<build>-<branch>/`), each containing
//! `<customization>/windows/` with the installers and debug information archives.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use bytes::Bytes;
use regex::Regex;
use reqwest::Url;
use zip::ZipArchive;

use crate::report::Report;
use crate::utils::Directory;
use crate::utils::http::create_client;

use super::DumpToolError;

static ARCHIVE_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r">([A-Za-z0-9_.\-]+\.(?:zip|msi|exe))<").unwrap());

/// Archive name fragments of shared libraries and debug information.
const SHARED_ARCHIVES: &[&str] = &["libs", "pdb-all", "pdb-apps"];

/// Web indexes of build distributions.
#[derive(Debug)]
pub struct Distributions {
    client: reqwest::Client,
    urls: Vec<Url>,
}

impl Distributions {
    pub fn new(urls: Vec<Url>, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: create_client(timeout)?,
            urls,
        })
    }

    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    /// Downloads the Windows archives of the build of `report` and extracts them into `target`.
    ///
    /// Returns the number of extracted files.
    pub async fn download(
        &self,
        report: &Report,
        customization: &str,
        target: &Directory,
    ) -> Result<usize, DumpToolError> {
        let windows = self.find_build(report.build()).await?;
        let windows = windows.join(&format!("{customization}/windows/"))?;
        let page = self.page(&windows).await?;

        let archives = find_archives(&page, report.component().distribution());
        if archives.is_empty() {
            return Err(DumpToolError::NoArchives(windows.to_string()));
        }

        let mut extracted = 0;
        for name in archives {
            let url = windows.join(&name)?;
            tracing::info!("Downloading {}", url);
            let content = self.get(&url).await?.bytes().await.map_err(|source| {
                DumpToolError::Download {
                    url: url.to_string(),
                    source,
                }
            })?;

            let path = target.path().to_owned();
            extracted += tokio::task::spawn_blocking(move || extract_zip(&name, content, &path))
                .await??;
        }

        Ok(extracted)
    }

    /// Searches all indexes for the directory of `build`.
    async fn find_build(&self, build: &str) -> Result<Url, DumpToolError> {
        for url in &self.urls {
            let page = match self.page(url).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::debug!("Skipping distribution index {}: {}", url, e);
                    continue;
                }
            };
            if let Some(directory) = find_build_directory(&page, build) {
                tracing::debug!("Found build {} in {}", directory, url);
                return Ok(url.join(&format!("{directory}/"))?);
            }
        }

        Err(DumpToolError::BuildNotFound(build.to_owned()))
    }

    async fn get(&self, url: &Url) -> Result<reqwest::Response, DumpToolError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| DumpToolError::Download {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DumpToolError::Status {
                url: url.to_string(),
                status,
            });
        }
        Ok(response)
    }

    async fn page(&self, url: &Url) -> Result<String, DumpToolError> {
        self.get(url)
            .await?
            .text()
            .await
            .map_err(|source| DumpToolError::Download {
                url: url.to_string(),
                source,
            })
    }
}

/// Finds the link text of the `build` directory on an index page.
fn find_build_directory(page: &str, build: &str) -> Option<String> {
    let pattern = format!(r">({}(?:-[^</]*)?)/?<", regex::escape(build));
    let regex = Regex::new(&pattern).ok()?;
    regex
        .captures(page)
        .and_then(|captures| captures.get(1))
        .map(|directory| directory.as_str().to_owned())
}

/// Lists the zip archives on an index page relevant for the `distribution` package.
fn find_archives(page: &str, distribution: &str) -> Vec<String> {
    let mut archives = Vec::new();
    for captures in ARCHIVE_LINK.captures_iter(page) {
        let name = &captures[1];
        if !name.ends_with(".zip") {
            tracing::debug!("Skipping unsupported installer {}", name);
            continue;
        }
        let relevant = name.contains(distribution)
            || SHARED_ARCHIVES.iter().any(|shared| name.contains(shared));
        if relevant && !archives.iter().any(|known| known == name) {
            archives.push(name.to_owned());
        }
    }
    archives
}

/// Extracts all files of a zip archive flat into `target`, keeping existing files.
fn extract_zip(name: &str, content: Bytes, target: &Path) -> Result<usize, DumpToolError> {
    let archive_error = |source| DumpToolError::Archive {
        name: name.to_owned(),
        source,
    };

    let mut archive = ZipArchive::new(io::Cursor::new(content)).map_err(archive_error)?;
    let mut extracted = 0;
    for index in 0..archive.len() {
        let mut file = archive.by_index(index).map_err(archive_error)?;
        if file.is_dir() {
            continue;
        }
        let Some(file_name) = file
            .enclosed_name()
            .and_then(|path| path.file_name().map(ToOwned::to_owned))
        else {
            tracing::debug!("Skipping unsafe path {} in {}", file.name(), name);
            continue;
        };

        let path = target.join(file_name);
        if path.exists() {
            continue;
        }
        io::copy(&mut file, &mut fs::File::create(&path)?)?;
        extracted += 1;
    }

    tracing::debug!("Extracted {} files from {}", extracted, name);
    Ok(extracted)
}
