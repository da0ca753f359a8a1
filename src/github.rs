//! Release feed: the latest GitHub release of the managed application.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::download::USER_AGENT;
use crate::error::{AppError, Result};

pub const REPO_OWNER: &str = "omandotkom";
pub const REPO_NAME: &str = "OmanSwissArmy";

const FEED_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitHubRelease {
    #[serde(default)]
    pub tag_name: Option<String>,
    #[serde(default)]
    pub assets: Vec<GitHubAsset>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitHubAsset {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

/// What the launcher needs to know about a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseInfo {
    /// Opaque version tag, compared by string equality only.
    pub tag: String,
    /// Download URL of the package archive; `None` if the release has none.
    pub asset_url: Option<String>,
    pub asset_name: Option<String>,
    pub asset_size: Option<u64>,
}

impl ReleaseInfo {
    pub fn from_release(release: &GitHubRelease, proxy: &str) -> Self {
        let tag = release
            .tag_name
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("unknown")
            .to_string();

        match select_archive_asset(&release.assets) {
            Some(asset) => Self {
                tag,
                asset_url: Some(wrap_with_proxy(proxy, &asset.browser_download_url)),
                asset_name: Some(asset.name.clone()),
                asset_size: Some(asset.size).filter(|&s| s > 0),
            },
            None => Self {
                tag,
                asset_url: None,
                asset_name: None,
                asset_size: None,
            },
        }
    }
}

/// First `.zip` asset in feed order. Extra archives are reported, not chosen.
pub fn select_archive_asset(assets: &[GitHubAsset]) -> Option<&GitHubAsset> {
    let mut archives = assets.iter().filter(|a| {
        a.name.to_ascii_lowercase().ends_with(".zip") && !a.browser_download_url.is_empty()
    });
    let first = archives.next()?;
    let others: Vec<&str> = archives.map(|a| a.name.as_str()).collect();
    if !others.is_empty() {
        log::warn!(
            "Release has {} archive assets; using {} and ignoring {:?}",
            others.len() + 1,
            first.name,
            others
        );
    }
    Some(first)
}

/// Prefix a GitHub URL with the configured proxy.
/// An empty proxy leaves the URL unchanged.
/// Proxies wrap the full URL, e.g. `https://gh-proxy.example/https://github.com/...`.
pub fn wrap_with_proxy(proxy: &str, url: &str) -> String {
    let proxy = proxy.trim();
    if proxy.is_empty() {
        url.to_string()
    } else {
        format!("{}/{}", proxy.trim_end_matches('/'), url)
    }
}

pub fn latest_release_url(proxy: &str) -> String {
    wrap_with_proxy(
        proxy,
        &format!(
            "https://api.github.com/repos/{}/{}/releases/latest",
            REPO_OWNER, REPO_NAME
        ),
    )
}

#[async_trait]
pub trait ReleaseFeed: Send + Sync {
    async fn fetch_latest(&self) -> Result<ReleaseInfo>;
}

/// The "latest release" endpoint of the fixed repository.
pub struct GitHubReleaseFeed {
    client: Client,
    proxy: String,
}

impl GitHubReleaseFeed {
    pub fn new(client: Client, proxy: impl Into<String>) -> Self {
        Self {
            client,
            proxy: proxy.into(),
        }
    }
}

#[async_trait]
impl ReleaseFeed for GitHubReleaseFeed {
    async fn fetch_latest(&self) -> Result<ReleaseInfo> {
        let url = latest_release_url(&self.proxy);
        let resp = self
            .client
            .get(&url)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
            .timeout(FEED_TIMEOUT)
            .send()
            .await
            .map_err(|e| AppError::network_with_url(&url, format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(AppError::network_with_url(
                &url,
                format!("GitHub API returned status: {}", resp.status()),
            ));
        }

        let release = resp
            .json::<GitHubRelease>()
            .await
            .map_err(|e| AppError::network_with_url(&url, format!("malformed release: {e}")))?;

        let info = ReleaseInfo::from_release(&release, &self.proxy);
        log::info!(
            "Latest release: {} ({})",
            info.tag,
            info.asset_name.as_deref().unwrap_or("no archive asset")
        );
        Ok(info)
    }
}
