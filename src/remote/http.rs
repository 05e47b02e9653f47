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

use std::time::Duration;

use bytes::Bytes;
use reqwest::{Method, Response, StatusCode};
use url::Url;

use super::{RemoteClient, RemoteDownload, RemoteError, RemoteResponse, url_for};
use crate::{
    errors::{Error, Result},
    store::ChunkSource,
};

/// Connection settings of a remote repository.
#[derive(Clone, Debug)]
pub struct RemoteSettings {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Maximum idle time between two reads
    pub socket_timeout: Duration,
    /// Basic auth user
    pub username: Option<String>,
    /// Basic auth password
    pub password: Option<String>,
    /// Proxy used for every request
    pub proxy: Option<Url>,
    /// Reuse connections between requests
    pub keep_alive: bool,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            socket_timeout: Duration::from_secs(15),
            username: None,
            password: None,
            proxy: None,
            keep_alive: true,
        }
    }
}

/// A builder for HTTP requests with authentication support
struct RequestBuilder(reqwest::RequestBuilder, Url);

impl RequestBuilder {
    fn new(client: &reqwest::Client, method: Method, url: Url) -> Self {
        Self(client.request(method, url.clone()), url)
    }

    fn auth(mut self, username: &str, password: Option<&str>) -> Self {
        self.0 = self.0.basic_auth(username, password);
        self
    }

    async fn send(self) -> Result<ValidatedResponse, RemoteError> {
        let Self(request, url) = self;

        let response = request
            .send()
            .await
            .map_err(|error| transport_error(&url, &error))?;

        ValidatedResponse::validate(url, response)
    }
}

/// A response whose status is either success or an authoritative absence
#[derive(Debug)]
struct ValidatedResponse(Url, Response);

impl ValidatedResponse {
    fn validate(url: Url, response: Response) -> Result<Self, RemoteError> {
        let status = response.status();

        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(Self(url, response));
        }

        Err(RemoteError::Status { url, status })
    }

    fn summary(&self) -> RemoteResponse {
        RemoteResponse::from_headers(self.1.status(), self.1.headers())
    }
}

fn transport_error(url: &Url, error: &reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        return RemoteError::Timeout { url: url.clone() };
    }

    RemoteError::Transport {
        url: url.clone(),
        reason: error.to_string(),
    }
}

/// [`RemoteClient`] speaking HTTP(S) through `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpRemote {
    repo: String,
    base: Url,
    settings: RemoteSettings,
    client: reqwest::Client,
}

impl HttpRemote {
    /// Create a client for the origin of repository `repo`.
    pub fn new(repo: impl Into<String>, base: Url, settings: RemoteSettings) -> Result<Self> {
        let repo = repo.into();

        let mut builder = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(5))
            .connect_timeout(settings.connect_timeout)
            .read_timeout(settings.socket_timeout);

        builder = if settings.keep_alive {
            builder.tcp_keepalive(Duration::from_secs(60))
        } else {
            builder.pool_max_idle_per_host(0)
        };

        if let Some(proxy) = &settings.proxy {
            let proxy = reqwest::Proxy::all(proxy.clone())
                .map_err(|error| Error::Config(format!("invalid proxy for `{repo}`: {error}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|error| Error::Config(format!("cannot build client for `{repo}`: {error}")))?;

        Ok(Self {
            repo,
            base,
            settings,
            client,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = RequestBuilder::new(&self.client, method, url_for(&self.base, path));

        match &self.settings.username {
            Some(username) => request.auth(username, self.settings.password.as_deref()),
            None => request,
        }
    }
}

#[async_trait::async_trait]
impl RemoteClient for HttpRemote {
    fn base_url(&self) -> &Url {
        &self.base
    }

    async fn head(&self, path: &str) -> Result<RemoteResponse, RemoteError> {
        let response = self.request(Method::HEAD, path).send().await?;

        tracing::debug!(repo = %self.repo, url = %response.0, status = %response.1.status(), "probed remote");

        Ok(response.summary())
    }

    async fn get(&self, path: &str) -> Result<RemoteDownload, RemoteError> {
        let response = self.request(Method::GET, path).send().await?;
        let summary = response.summary();

        if summary.status == StatusCode::NOT_FOUND {
            return Err(RemoteError::Status {
                url: response.0,
                status: summary.status,
            });
        }

        tracing::debug!(repo = %self.repo, url = %response.0, "streaming remote content");

        let ValidatedResponse(url, response) = response;
        Ok(RemoteDownload {
            response: summary,
            body: Box::new(HttpBody {
                repo: self.repo.clone(),
                url,
                response,
            }),
        })
    }
}

struct HttpBody {
    repo: String,
    url: Url,
    response: Response,
}

#[async_trait::async_trait]
impl ChunkSource for HttpBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.response
            .chunk()
            .await
            .map_err(|error| Error::RemoteUnavailable {
                repo: self.repo.clone(),
                source: transport_error(&self.url, &error),
            })
    }
}
