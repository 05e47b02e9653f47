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

use std::{path::Path, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use axum::http::StatusCode;
use depot::{
    Error,
    config::Config,
    context::Context,
    maven_metadata::MavenMetadata,
    path::RepoPath,
    repo::{FindingKind, Request},
    resource::RepoResource,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::origin;

const JAR: &str = "com/acme/foo/1.0/foo-1.0.jar";
const SNAPSHOT: &str = "com/acme/foo/1.0-SNAPSHOT/foo-1.0-SNAPSHOT.jar";
const METADATA: &str = "com/acme/foo/maven-metadata.xml";

fn context(root: &Path, toml: &str) -> Arc<Context> {
    let mut config = Config::parse(toml).unwrap();
    config.storage.root = root.to_path_buf();
    Context::open(config).unwrap()
}

fn remote(url: &str, period: u64) -> String {
    format!(
        r#"
        [storage]
        metadata = "memory"

        [[local]]
        key = "libs-local"

        [[local]]
        key = "snapshots-local"

        [[remote]]
        key = "central"
        url = "{url}"
        retrieval_cache_period_secs = {period}

        [[virtual]]
        key = "libs"
        repositories = ["central", "snapshots-local", "libs-local"]
        "#
    )
}

fn request(repo: &str, path: &str) -> Request {
    Request::new(RepoPath::new(repo, path))
}

async fn fetch(context: &Context, repo: &str, path: &str) -> depot::Result<Bytes> {
    context
        .repositories()
        .fetch(&request(repo, path))
        .await?
        .read_to_bytes()
        .await
}

async fn deploy(context: &Context, repo: &str, path: &str, content: &'static [u8]) {
    context
        .repositories()
        .local(repo)
        .unwrap()
        .deploy(
            &request(repo, path),
            &mut Bytes::from_static(content),
            Default::default(),
        )
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn refetches_expired_content_only_when_the_origin_changed() {
    let (origin, url) = origin::spawn().await;
    let root = TempDir::new().unwrap();
    let context = context(root.path(), &remote(&url, 0));

    origin.serve(JAR, b"old", Utc::now() - TimeDelta::days(2));
    assert_eq!(
        fetch(&context, "central", JAR).await.unwrap(),
        Bytes::from_static(b"old")
    );

    origin.serve(JAR, b"new", Utc::now() - TimeDelta::hours(1));
    assert_eq!(
        fetch(&context, "central", JAR).await.unwrap(),
        Bytes::from_static(b"new")
    );
    assert_eq!(origin.gets(), 2);

    // revalidated against the origin, not downloaded again
    assert_eq!(
        fetch(&context, "central", JAR).await.unwrap(),
        Bytes::from_static(b"new")
    );
    assert_eq!(origin.gets(), 2);
    assert_eq!(origin.heads(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn virtual_repositories_refresh_expired_cache_entries_once() {
    let (origin, url) = origin::spawn().await;
    let root = TempDir::new().unwrap();
    let context = context(
        root.path(),
        &format!(
            r#"
            [storage]
            metadata = "memory"

            [[local]]
            key = "libs-release-local"

            [[remote]]
            key = "libs-release-remote"
            url = "{url}"
            retrieval_cache_period_secs = 1

            [[virtual]]
            key = "libs-release"
            repositories = ["libs-release-local", "libs-release-remote-cache", "libs-release-remote"]
            "#
        ),
    );

    origin.serve(JAR, b"old", Utc::now() - TimeDelta::days(2));
    assert_eq!(
        fetch(&context, "libs-release", JAR).await.unwrap(),
        Bytes::from_static(b"old")
    );
    assert_eq!(origin.gets(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let newer = Utc::now() - TimeDelta::minutes(1);
    origin.serve(JAR, b"new", newer);

    assert_eq!(
        fetch(&context, "libs-release", JAR).await.unwrap(),
        Bytes::from_static(b"new")
    );
    assert_eq!(origin.gets(), 2);

    let cached = context
        .repositories()
        .get_info(&request("libs-release-remote-cache", JAR))
        .await
        .unwrap();
    assert_eq!(cached.found().unwrap().last_modified.timestamp(), newer.timestamp());
}

#[tokio::test(flavor = "multi_thread")]
async fn memoizes_origin_failures() {
    let (origin, url) = origin::spawn().await;
    let root = TempDir::new().unwrap();
    let context = context(root.path(), &remote(&url, 3600));

    origin.serve(JAR, b"foo", Utc::now());
    origin.fail_with(StatusCode::SERVICE_UNAVAILABLE);

    let first = request("central", JAR);
    assert!(!context.repositories().get_info(&first).await.unwrap().is_found());
    assert!(first.diagnostics.contains(FindingKind::RemoteFailure));
    assert_eq!(origin.heads(), 1);

    let second = request("central", JAR);
    assert!(!context.repositories().get_info(&second).await.unwrap().is_found());
    assert_eq!((origin.heads(), origin.gets()), (1, 0));
}

#[tokio::test(flavor = "multi_thread")]
async fn records_checksums_the_origin_got_wrong() {
    let (origin, url) = origin::spawn().await;
    let root = TempDir::new().unwrap();
    let context = context(root.path(), &remote(&url, 3600));

    origin.serve(JAR, b"foo", Utc::now() - TimeDelta::days(1));
    origin.announce_sha1(JAR, &"0".repeat(40));

    let request = request("central", JAR);
    let content = context
        .repositories()
        .fetch(&request)
        .await
        .unwrap()
        .read_to_bytes()
        .await
        .unwrap();

    assert_eq!(content, Bytes::from_static(b"foo"));
    assert!(request.diagnostics.contains(FindingKind::ChecksumMismatch));
}

#[tokio::test(flavor = "multi_thread")]
async fn downloads_once_for_concurrent_requests() {
    let (origin, url) = origin::spawn().await;
    let root = TempDir::new().unwrap();
    let context = context(root.path(), &remote(&url, 3600));

    origin.serve(JAR, b"foo", Utc::now() - TimeDelta::days(1));
    origin.slow_down(Duration::from_millis(100));

    let requests = (0..8).map(|_| fetch(&context, "central", JAR));
    let results = futures::future::join_all(requests).await;

    for result in results {
        assert_eq!(result.unwrap(), Bytes::from_static(b"foo"));
    }
    assert_eq!(origin.gets(), 1);
    assert_eq!(context.coordinator().in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn serves_fresh_cache_entries_without_the_origin() {
    let (origin, url) = origin::spawn().await;
    let root = TempDir::new().unwrap();
    let context = context(root.path(), &remote(&url, 3600));

    origin.serve(JAR, b"foo", Utc::now() - TimeDelta::days(1));
    fetch(&context, "central", JAR).await.unwrap();
    assert_eq!((origin.heads(), origin.gets()), (1, 1));

    let resource = context
        .repositories()
        .get_info(&request("central", JAR))
        .await
        .unwrap();
    let found = resource.found().unwrap();
    assert_eq!(found.path, RepoPath::new("central", JAR));
    assert_eq!(found.response_path, RepoPath::new("central-cache", JAR));

    fetch(&context, "central", JAR).await.unwrap();
    assert_eq!((origin.heads(), origin.gets()), (1, 1));
}

#[tokio::test(flavor = "multi_thread")]
async fn memoizes_misses() {
    let (origin, url) = origin::spawn().await;
    let root = TempDir::new().unwrap();
    let context = context(root.path(), &remote(&url, 3600));

    for _ in 0..3 {
        let resource = context
            .repositories()
            .get_info(&request("central", JAR))
            .await
            .unwrap();
        assert!(!resource.is_found());
    }

    assert_eq!(origin.heads(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejects_content_with_wrong_announced_checksums() {
    let (origin, url) = origin::spawn().await;
    let root = TempDir::new().unwrap();
    let toml = remote(&url, 3600).replace(
        "retrieval_cache_period_secs = 3600",
        "retrieval_cache_period_secs = 3600\n        checksum_policy = \"fail\"",
    );
    let context = context(root.path(), &toml);

    origin.serve(JAR, b"foo", Utc::now() - TimeDelta::days(1));
    origin.announce_sha1(JAR, &"0".repeat(40));

    let result = fetch(&context, "central", JAR).await;
    assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));

    let cached = context
        .repositories()
        .get_info(&request("central-cache", JAR))
        .await
        .unwrap();
    assert!(!cached.is_found());
}

#[tokio::test(flavor = "multi_thread")]
async fn virtual_repositories_prefer_local_content() {
    let (origin, url) = origin::spawn().await;
    let root = TempDir::new().unwrap();
    let context = context(root.path(), &remote(&url, 3600));

    deploy(&context, "libs-local", JAR, b"local").await;
    origin.serve(JAR, b"remote", Utc::now());
    origin.serve("com/acme/bar/1.0/bar-1.0.jar", b"bar", Utc::now());

    assert_eq!(
        fetch(&context, "libs", JAR).await.unwrap(),
        Bytes::from_static(b"local")
    );
    assert_eq!(origin.heads(), 0);

    assert_eq!(
        fetch(&context, "libs", "com/acme/bar/1.0/bar-1.0.jar")
            .await
            .unwrap(),
        Bytes::from_static(b"bar")
    );

    // the cache is searched before the remote
    let resource = context
        .repositories()
        .get_info(&request("libs", "com/acme/bar/1.0/bar-1.0.jar"))
        .await
        .unwrap();
    assert_eq!(resource.found().unwrap().response_path.repo(), "central-cache");
    assert_eq!(origin.heads(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn reports_snapshots_deployed_twice() {
    let (origin, url) = origin::spawn().await;
    let root = TempDir::new().unwrap();
    let context = context(root.path(), &remote(&url, 3600));

    deploy(&context, "libs-local", SNAPSHOT, b"one").await;
    deploy(&context, "snapshots-local", SNAPSHOT, b"two").await;

    let request = request("libs", SNAPSHOT);
    let resource = context.repositories().get_info(&request).await.unwrap();

    assert!(resource.is_found());
    assert!(request.diagnostics.contains(FindingKind::DuplicateSnapshot));
    assert_eq!(origin.heads(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn merges_metadata_of_local_and_remote_members() {
    let (origin, url) = origin::spawn().await;
    let root = TempDir::new().unwrap();
    let context = context(root.path(), &remote(&url, 3600));

    deploy(
        &context,
        "libs-local",
        METADATA,
        br#"<metadata>
          <groupId>com.acme</groupId>
          <artifactId>foo</artifactId>
          <versioning><versions><version>1.0</version></versions></versioning>
        </metadata>"#,
    )
    .await;
    origin.serve(
        METADATA,
        br#"<metadata>
          <groupId>com.acme</groupId>
          <artifactId>foo</artifactId>
          <versioning><versions><version>1.1</version></versions></versioning>
        </metadata>"#,
        Utc::now(),
    );

    let merged = fetch(&context, "libs", METADATA).await.unwrap();
    let merged = MavenMetadata::parse(&RepoPath::new("libs", METADATA), &merged).unwrap();

    let versions = merged.versioning.and_then(|versioning| versioning.versions);
    assert_eq!(versions.unwrap().version, vec!["1.0", "1.1"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn reports_configuration_cycles() {
    let root = TempDir::new().unwrap();
    let context = context(
        root.path(),
        r#"
        [storage]
        metadata = "memory"

        [[local]]
        key = "libs-local"

        [[virtual]]
        key = "outer"
        repositories = ["inner"]

        [[virtual]]
        key = "inner"
        repositories = ["outer", "libs-local"]
        "#,
    );

    deploy(&context, "libs-local", JAR, b"foo").await;

    let request = request("outer", JAR);
    let resource = context.repositories().get_info(&request).await.unwrap();

    assert!(matches!(resource, RepoResource::Found(_)));
    assert!(request.diagnostics.contains(FindingKind::ConfigurationCycle));
}
