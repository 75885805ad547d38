//! GitHub contents API client
//!
//! Folders are fetched one after another with no retries: the first failed
//! request or write aborts the whole fetch. Only files directly inside each
//! folder are downloaded.

use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::FetchSettings;

const GITHUB_PREFIX: &str = "https://github.com/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while fetching a repository
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid repo URL: {0}")]
    InvalidRepoUrl(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GitHub API error: {status} for {url}")]
    Status { url: String, status: String },

    #[error("Refusing to write outside the destination: {0}")]
    UnsafePath(String),

    #[error("Failed to write file: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for fetch operations
pub type FetchResult<T> = Result<T, FetchError>;

/// Progress callback: percentage (1..=100) and a message
pub type ProgressHandler = Box<dyn Fn(u8, &str) + Send + Sync>;

/// Options for a single fetch
pub struct FetchOptions {
    /// `https://github.com/<user>/<repo>`
    pub repo_url: String,
    /// Branch or ref; the configured default branch when `None`
    pub branch: Option<String>,
    /// Directory the repository paths are written under
    pub destination: PathBuf,
    /// Folders to download; every top-level entry when empty
    pub folders: Vec<String>,
    /// When listing top-level entries, keep directories only
    pub only_dirs: bool,
    /// Replace files that already exist
    pub overwrite: bool,
    on_progress: Option<ProgressHandler>,
}

impl FetchOptions {
    pub fn new(repo_url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            repo_url: repo_url.into(),
            branch: None,
            destination: destination.into(),
            folders: Vec::new(),
            only_dirs: false,
            overwrite: false,
            on_progress: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_folders<I, S>(mut self, folders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.folders = folders.into_iter().map(Into::into).collect();
        self
    }

    pub fn only_dirs(mut self, only_dirs: bool) -> Self {
        self.only_dirs = only_dirs;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Replace the default progress reporter, which logs at info level
    pub fn on_progress<F>(mut self, handler: F) -> Self
    where
        F: Fn(u8, &str) + Send + Sync + 'static,
    {
        self.on_progress = Some(Box::new(handler));
        self
    }

    fn report(&self, percent: u8, message: &str) {
        match &self.on_progress {
            Some(handler) => handler(percent, message),
            None => info!("[{}%] {}", percent, message),
        }
    }
}

/// Owner and name of a GitHub repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    /// Parse `https://github.com/<owner>/<repo>[/...]`
    pub fn parse(repo_url: &str) -> FetchResult<Self> {
        let trimmed = repo_url.strip_prefix(GITHUB_PREFIX).unwrap_or(repo_url);
        let mut parts = trimmed.split('/');

        match (parts.next(), parts.next()) {
            (Some(owner), Some(name)) if !owner.is_empty() && !name.is_empty() => Ok(Self {
                owner: owner.to_string(),
                name: name.trim_end_matches(".git").to_string(),
            }),
            _ => Err(FetchError::InvalidRepoUrl(repo_url.to_string())),
        }
    }
}

/// One entry of a contents API directory listing
#[derive(Debug, Deserialize)]
struct ContentEntry {
    name: String,
    #[serde(default)]
    path: String,
    #[serde(rename = "type")]
    kind: String,
    download_url: Option<String>,
}

/// Progress percentage after finishing item `index` of `total`
///
/// An empty batch counts as complete.
pub fn calc_percent(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let percent = (index + 1) as f64 / total as f64 * 100.0;
    percent.min(100.0) as u8
}

/// Client for the GitHub contents API
pub struct RepoFetcher {
    client: reqwest::Client,
    api_base: String,
    default_branch: String,
}

impl RepoFetcher {
    pub fn new(settings: &FetchSettings) -> FetchResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            default_branch: settings.default_branch.clone(),
        })
    }

    /// Download the requested folders of a repository
    pub async fn fetch_repo_folders(&self, options: FetchOptions) -> FetchResult<()> {
        options.report(1, "Starting fetch...");

        let branch = options
            .branch
            .clone()
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| self.default_branch.clone());
        let repo = RepoRef::parse(&options.repo_url)?;

        options.report(5, "Fetching folder list...");

        let folders = if options.folders.is_empty() {
            self.top_level_folders(&repo, &branch, options.only_dirs).await?
        } else {
            options.folders.clone()
        };

        let total = folders.len();
        for (index, folder) in folders.iter().enumerate() {
            options.report(
                calc_percent(index, total),
                &format!("Downloading folder: {}", folder),
            );
            let written = self
                .download_folder(&repo, &branch, folder, &options.destination, options.overwrite)
                .await?;
            debug!("Folder {}: {} files written", folder, written);
        }

        options.report(100, "Download complete");
        Ok(())
    }

    /// List the names of the repository's top-level entries
    async fn top_level_folders(
        &self,
        repo: &RepoRef,
        branch: &str,
        only_dirs: bool,
    ) -> FetchResult<Vec<String>> {
        let entries = self.list_contents(repo, "", branch).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| !only_dirs || entry.kind == "dir")
            .map(|entry| entry.name)
            .collect())
    }

    /// Download every file directly inside `folder`. Returns the number written.
    async fn download_folder(
        &self,
        repo: &RepoRef,
        branch: &str,
        folder: &str,
        destination: &Path,
        overwrite: bool,
    ) -> FetchResult<usize> {
        let entries = self.list_contents(repo, folder, branch).await?;
        let mut written = 0;

        for entry in entries.into_iter().filter(|entry| entry.kind == "file") {
            let target = safe_join(destination, &entry.path)?;

            if !overwrite && tokio::fs::try_exists(&target).await.unwrap_or(false) {
                debug!("Skipping existing file {}", target.display());
                continue;
            }

            let Some(url) = entry.download_url.as_deref() else {
                warn!("No download URL for {}, skipping", entry.path);
                continue;
            };

            let body = self.get(url).await?.bytes().await?;

            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &body).await?;
            debug!("Wrote {} ({} bytes)", target.display(), body.len());
            written += 1;
        }

        Ok(written)
    }

    async fn list_contents(
        &self,
        repo: &RepoRef,
        folder: &str,
        branch: &str,
    ) -> FetchResult<Vec<ContentEntry>> {
        let url = format!(
            "{}/repos/{}/{}/contents/{}?ref={}",
            self.api_base, repo.owner, repo.name, folder, branch
        );
        Ok(self.get(&url).await?.json().await?)
    }

    async fn get(&self, url: &str) -> FetchResult<reqwest::Response> {
        debug!("GET {}", url);
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().to_string(),
            });
        }
        Ok(response)
    }
}

/// Join a repository path onto `base`, rejecting anything that escapes it
fn safe_join(base: &Path, repo_path: &str) -> FetchResult<PathBuf> {
    let relative = Path::new(repo_path);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));

    if repo_path.is_empty() || escapes {
        return Err(FetchError::UnsafePath(repo_path.to_string()));
    }
    Ok(base.join(relative))
}
