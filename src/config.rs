// Copyright 2023 Helsing GmbH
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    errors::{Error, Result},
    layout::RepoLayout,
    policy::{ChecksumPolicy, RepoPolicy},
    remote::RemoteSettings,
    repo::LocalCacheRepo,
    retrieval_cache::RetrievalCacheConfig,
};

/// Representation of the `depot.toml` configuration file
///
/// # Example
///
/// ```toml
/// [storage]
/// root = "/var/lib/depot"
///
/// [[local]]
/// key = "libs-release-local"
///
/// [[remote]]
/// key = "central"
/// url = "https://repo.maven.apache.org/maven2/"
///
/// [[virtual]]
/// key = "libs-release"
/// repositories = ["libs-release-local", "central"]
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Path of the file this configuration was read from
    #[serde(skip)]
    path: Option<PathBuf>,

    /// Where content and metadata live
    #[serde(default)]
    pub storage: StorageConfig,

    /// Bounded waits of the storage layer
    #[serde(default)]
    pub gc: GcConfig,

    /// Local repositories
    #[serde(default)]
    pub local: Vec<LocalConfig>,

    /// Remote repositories
    #[serde(default)]
    pub remote: Vec<RemoteConfig>,

    /// Virtual repositories
    #[serde(default, rename = "virtual")]
    pub virtuals: Vec<VirtualConfig>,
}

/// Backing store of repository metadata nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataBackend {
    /// JSON files below the storage root
    #[default]
    Filesystem,
    /// Process memory, lost on exit
    Memory,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Base directory, relative paths are resolved against the configuration file
    #[serde(default = "defaults::root")]
    pub root: PathBuf,
    #[serde(default)]
    pub metadata: MetadataBackend,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: defaults::root(),
            metadata: MetadataBackend::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GcConfig {
    /// Upper bound for waiting on a download lock or on content to settle
    #[serde(default = "defaults::lock_timeout")]
    pub lock_timeout_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: defaults::lock_timeout(),
        }
    }
}

impl GcConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

/// Path rules shared by local and remote repositories.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "defaults::enabled")]
    pub handles_releases: bool,
    #[serde(default = "defaults::enabled")]
    pub handles_snapshots: bool,
    #[serde(default)]
    pub blackout: bool,
    /// Glob patterns of served paths, empty means everything
    #[serde(default)]
    pub includes: Vec<String>,
    /// Glob patterns of paths never served
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            handles_releases: true,
            handles_snapshots: true,
            blackout: false,
            includes: Vec::new(),
            excludes: Vec::new(),
        }
    }
}

impl PolicyConfig {
    /// Compile the glob patterns into a policy.
    pub fn to_policy(&self) -> Result<RepoPolicy> {
        let mut policy = RepoPolicy::with_patterns(&self.includes, &self.excludes)?;
        policy.blackout = self.blackout;
        policy.handles_releases = self.handles_releases;
        policy.handles_snapshots = self.handles_snapshots;

        Ok(policy)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    pub key: String,
    #[serde(default)]
    pub layout: RepoLayout,
    #[serde(flatten)]
    pub policy: PolicyConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub key: String,
    pub url: Url,
    #[serde(default)]
    pub layout: RepoLayout,
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub hard_fail: bool,
    /// Keep fetched content in a `<key>-cache` repository
    #[serde(default = "defaults::enabled")]
    pub store_artifacts_locally: bool,
    #[serde(default = "defaults::retrieval_cache_period")]
    pub retrieval_cache_period_secs: u64,
    #[serde(default = "defaults::failed_retrieval_cache_period")]
    pub failed_retrieval_cache_period_secs: u64,
    #[serde(default = "defaults::missed_retrieval_cache_period")]
    pub missed_retrieval_cache_period_secs: u64,
    #[serde(default = "defaults::timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "defaults::timeout")]
    pub socket_timeout_secs: u64,
    #[serde(default)]
    pub checksum_policy: ChecksumPolicy,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub proxy: Option<Url>,
    #[serde(default = "defaults::enabled")]
    pub keep_alive: bool,
    #[serde(flatten)]
    pub policy: PolicyConfig,
}

impl RemoteConfig {
    /// Key of the repository holding fetched content.
    pub fn cache_key(&self) -> String {
        format!("{}{}", self.key, LocalCacheRepo::SUFFIX)
    }

    /// How long cached content is served without asking the origin.
    pub fn retrieval_cache_period(&self) -> Duration {
        Duration::from_secs(self.retrieval_cache_period_secs)
    }

    pub fn failed_retrieval(&self) -> RetrievalCacheConfig {
        RetrievalCacheConfig::with_ttl(Duration::from_secs(
            self.failed_retrieval_cache_period_secs,
        ))
    }

    pub fn missed_retrieval(&self) -> RetrievalCacheConfig {
        RetrievalCacheConfig::with_ttl(Duration::from_secs(
            self.missed_retrieval_cache_period_secs,
        ))
    }

    /// Connection settings of the HTTP client.
    pub fn connection(&self) -> RemoteSettings {
        RemoteSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            socket_timeout: Duration::from_secs(self.socket_timeout_secs),
            username: self.username.clone(),
            password: self.password.clone(),
            proxy: self.proxy.clone(),
            keep_alive: self.keep_alive,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualConfig {
    pub key: String,
    #[serde(default)]
    pub layout: RepoLayout,
    /// Member keys in search order, real and virtual alike
    #[serde(default)]
    pub repositories: Vec<String>,
    #[serde(default)]
    pub peer_requests_fetch_remote: bool,
    #[serde(default)]
    pub hide_unauthorized_resources: bool,
}

mod defaults {
    use std::path::PathBuf;

    pub(super) fn root() -> PathBuf {
        PathBuf::from(".depot")
    }

    pub(super) fn enabled() -> bool {
        true
    }

    pub(super) fn lock_timeout() -> u64 {
        60
    }

    pub(super) fn retrieval_cache_period() -> u64 {
        7200
    }

    pub(super) fn failed_retrieval_cache_period() -> u64 {
        30
    }

    pub(super) fn missed_retrieval_cache_period() -> u64 {
        7200
    }

    pub(super) fn timeout() -> u64 {
        15
    }
}

impl Config {
    /// Name of the configuration file
    pub const FILE_NAME: &str = "depot.toml";

    /// Locate the configuration file in the given directory or any of its parents
    pub fn locate(cwd: &Path) -> Option<PathBuf> {
        let mut current_dir = cwd.to_owned();

        loop {
            let config_path = current_dir.join(Self::FILE_NAME);
            if config_path.is_file() {
                return Some(config_path);
            }

            if !current_dir.pop() {
                return None;
            }
        }
    }

    /// Read and validate a configuration file
    pub async fn load(config_path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(config_path)
            .await
            .map_err(Error::io("failed to read config file", config_path))?;

        let mut config = Self::parse(&contents)
            .map_err(|error| Error::Config(format!("{}: {error}", config_path.display())))?;

        if config.storage.root.is_relative()
            && let Some(base) = config_path.parent()
        {
            config.storage.root = base.join(&config.storage.root);
        }
        config.path = Some(config_path.to_owned());

        tracing::debug!(path = %config_path.display(), "loaded configuration");
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|error| Error::Config(format!("failed to parse configuration: {error}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Path of the file this configuration was read from
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether `key` names a virtual repository
    pub fn is_virtual(&self, key: &str) -> bool {
        self.virtuals.iter().any(|repo| repo.key == key)
    }

    /// Split the members of a virtual repository into real and nested virtual keys
    pub fn members(&self, repo: &VirtualConfig) -> (Vec<String>, Vec<String>) {
        repo.repositories
            .iter()
            .cloned()
            .partition(|member| !self.is_virtual(member))
    }

    fn validate(&self) -> Result<()> {
        let mut keys = HashSet::new();

        for local in &self.local {
            claim(&mut keys, &local.key)?;
        }

        for remote in &self.remote {
            claim(&mut keys, &remote.key)?;

            if remote.store_artifacts_locally {
                claim(&mut keys, &remote.cache_key())?;
            }

            if !matches!(remote.url.scheme(), "http" | "https") {
                return Err(Error::Config(format!(
                    "remote repository `{}` must use http or https, got `{}`",
                    remote.key, remote.url
                )));
            }
        }

        for repo in &self.virtuals {
            claim(&mut keys, &repo.key)?;
        }

        for repo in &self.virtuals {
            if let Some(unknown) = repo
                .repositories
                .iter()
                .find(|member| !keys.contains(member.as_str()))
            {
                return Err(Error::Config(format!(
                    "virtual repository `{}` references unknown repository `{unknown}`",
                    repo.key
                )));
            }
        }

        Ok(())
    }
}

fn claim(keys: &mut HashSet<String>, key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(Error::Config("repository keys must not be empty".into()));
    }

    if !keys.insert(key.to_owned()) {
        return Err(Error::Config(format!("duplicate repository key `{key}`")));
    }

    Ok(())
}
