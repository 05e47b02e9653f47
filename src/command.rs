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

use std::path::{Path, PathBuf};

use miette::{Context as _, IntoDiagnostic, bail, miette};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    checksum::{ChecksumType, Checksums},
    context::Context,
    path::RepoPath,
    repo::{Repository, Request},
    resource::RepoResource,
    store::{ChunkSource, ReaderSource},
};

fn report_findings(request: &Request) {
    for finding in request.diagnostics.findings() {
        tracing::warn!(kind = %finding.kind, "{}", finding.message);
    }
}

/// Resolves a path and prints where it would be served from
pub async fn info(context: &Context, repo: &str, path: &str) -> miette::Result<()> {
    let request = Request::new(RepoPath::new(repo, path));
    let resource = context.repositories().get_info(&request).await;
    report_findings(&request);

    match resource? {
        RepoResource::Found(found) => {
            println!("path:          {}", found.path);
            println!("served from:   {}", found.response_path);
            println!("exact match:   {}", found.exact_match);
            println!("size:          {}", found.size);
            println!("last modified: {}", found.last_modified.to_rfc3339());
            for (checksum, value) in found.checksums.iter() {
                println!("{:<15}{value}", format!("{checksum}:"));
            }
            Ok(())
        }
        RepoResource::Unfound(unfound) => {
            bail!(
                "{} not found ({}): {}",
                unfound.path,
                unfound.status.as_u16(),
                unfound.reason
            )
        }
    }
}

/// Downloads a path to a file or stdout
pub async fn fetch(
    context: &Context,
    repo: &str,
    path: &str,
    output: Option<PathBuf>,
) -> miette::Result<()> {
    let request = Request::new(RepoPath::new(repo, path));
    let download = context.repositories().fetch(&request).await;
    report_findings(&request);

    let download = download?;
    tracing::info!(path = %download.resource.response_path, "fetching");

    let mut chunks = download.into_chunks();
    let written = match &output {
        Some(output) => {
            let mut file = tokio::fs::File::create(output)
                .await
                .into_diagnostic()
                .wrap_err(miette!("failed to create {}", output.display()))?;
            copy(chunks.as_mut(), &mut file).await?
        }
        None => copy(chunks.as_mut(), &mut tokio::io::stdout()).await?,
    };

    tracing::debug!(bytes = written, "fetched");
    Ok(())
}

async fn copy(
    chunks: &mut dyn ChunkSource,
    sink: &mut (impl AsyncWrite + Unpin),
) -> miette::Result<u64> {
    let mut written = 0;

    while let Some(chunk) = chunks.next_chunk().await? {
        sink.write_all(&chunk)
            .await
            .into_diagnostic()
            .wrap_err("failed to write content")?;
        written += chunk.len() as u64;
    }

    sink.flush()
        .await
        .into_diagnostic()
        .wrap_err("failed to write content")?;

    Ok(written)
}

/// Deploys a file into a local repository
pub async fn deploy(
    context: &Context,
    repo: &str,
    path: &str,
    file: &Path,
    md5: Option<String>,
    sha1: Option<String>,
) -> miette::Result<()> {
    let local = context.repositories().deploy_target(repo)?;

    let mut declared = Checksums::default();
    if let Some(md5) = md5 {
        declared.insert(ChecksumType::Md5, md5);
    }
    if let Some(sha1) = sha1 {
        declared.insert(ChecksumType::Sha1, sha1);
    }

    let content = tokio::fs::File::open(file)
        .await
        .into_diagnostic()
        .wrap_err(miette!("failed to open {}", file.display()))?;

    let request = Request::new(RepoPath::new(local.key(), path));
    let report = local
        .deploy(&request, &mut ReaderSource::new(content), declared)
        .await;
    report_findings(&request);

    let report = report?;
    tracing::info!(
        path = %report.resource.path,
        size = report.resource.size,
        reused = report.reused,
        replaced = report.replaced,
        "deployed"
    );

    Ok(())
}

/// Runs garbage collection passes over the content store
pub async fn gc(context: &Context, passes: usize) -> miette::Result<()> {
    let reports = context.collect_garbage(passes).await?;

    let deleted: usize = reports.iter().map(|report| report.deleted).sum();
    let reclaimed: u64 = reports.iter().map(|report| report.reclaimed_bytes).sum();
    println!("deleted {deleted} blobs, reclaimed {reclaimed} bytes");

    Ok(())
}

/// Lists the configured repositories
pub async fn check(context: &Context) -> miette::Result<()> {
    let repositories = context.repositories();

    for key in repositories.keys() {
        let kind = match repositories.get(key) {
            None => "virtual",
            Some(repo) if repo.is_cache() => "cache",
            Some(repo) if repo.is_local() => "local",
            Some(_) => "remote",
        };
        println!("{key} ({kind})");
    }

    if let Some(path) = context.config().path() {
        tracing::info!(path = %path.display(), "configuration is valid");
    }

    Ok(())
}
