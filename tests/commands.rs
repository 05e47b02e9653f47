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

use assert_fs::{TempDir, prelude::*};
use chrono::{TimeDelta, Utc};
use predicates::prelude::*;
use pretty_assertions::assert_eq;

use crate::{cli, origin};

const JAR: &str = "com/acme/foo/1.0/foo-1.0.jar";

fn workspace(config: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    dir.child("depot.toml").write_str(config).unwrap();
    dir
}

const LOCAL: &str = r#"
[storage]
root = "data"

[[local]]
key = "libs-local"

[[virtual]]
key = "libs"
repositories = ["libs-local"]
"#;

#[test]
fn check_lists_repositories() {
    let dir = workspace(LOCAL);

    cli!()
        .arg("check")
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("libs-local (local)"))
        .stdout(predicate::str::contains("libs (virtual)"));
}

#[test]
fn finds_the_config_in_parent_directories() {
    let dir = workspace(LOCAL);
    let nested = dir.child("a/b");
    nested.create_dir_all().unwrap();

    cli!()
        .arg("check")
        .current_dir(nested.path())
        .assert()
        .success();

    dir.child("data/filestore").assert(predicate::path::is_dir());
}

#[test]
fn fails_without_configuration() {
    let dir = TempDir::new().unwrap();

    cli!()
        .arg("check")
        .arg("--config")
        .arg(dir.child("missing.toml").path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing.toml"));
}

#[test]
fn refuses_to_deploy_into_a_virtual_repository() {
    let dir = workspace(LOCAL);
    dir.child("foo.jar").write_binary(b"foo").unwrap();

    cli!()
        .args(["deploy", "libs", JAR, "foo.jar"])
        .current_dir(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("depot::unsupported"));
}

#[test]
fn deploys_and_fetches_through_a_virtual_repository() {
    let dir = workspace(LOCAL);
    dir.child("foo.jar").write_binary(b"foo").unwrap();

    cli!()
        .args(["deploy", "libs-local", JAR, "foo.jar"])
        .current_dir(dir.path())
        .assert()
        .success();

    cli!()
        .args(["fetch", "libs", JAR, "-o", "out.jar"])
        .current_dir(dir.path())
        .assert()
        .success();
    assert_eq!(std::fs::read(dir.child("out.jar").path()).unwrap(), b"foo");

    // sha1 of "foo"
    cli!()
        .args(["info", "libs", JAR])
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "0beec7b5ea3f0fdbc95d0dd47f3c5bc275da8a33",
        ))
        .stdout(predicate::str::contains("libs-local"));

    cli!()
        .args(["fetch", "libs"])
        .arg(format!("{JAR}.sha1"))
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "0beec7b5ea3f0fdbc95d0dd47f3c5bc275da8a33",
        ));
}

#[test]
fn warns_about_mismatching_declared_checksums() {
    let dir = workspace(LOCAL);
    dir.child("foo.jar").write_binary(b"foo").unwrap();

    cli!()
        .args(["deploy", "libs-local", JAR, "foo.jar", "--sha1"])
        .arg("0".repeat(40))
        .current_dir(dir.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("checksum-mismatch"));
}

#[test]
fn reports_missing_artifacts() {
    let dir = workspace(LOCAL);

    cli!()
        .args(["info", "libs", JAR])
        .current_dir(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("(404)"));
}

#[test]
fn collects_garbage() {
    let dir = workspace(LOCAL);

    cli!()
        .arg("gc")
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout("deleted 0 blobs, reclaimed 0 bytes\n");
}

#[test]
fn mirrors_a_remote_origin() {
    origin::with_origin(|origin, url| {
        let dir = workspace(&format!(
            r#"
            [storage]
            root = "data"

            [[remote]]
            key = "central"
            url = "{url}"
            "#
        ));
        origin.serve(JAR, b"remote", Utc::now() - TimeDelta::days(1));

        for _ in 0..2 {
            cli!()
                .args(["fetch", "central", JAR])
                .current_dir(dir.path())
                .assert()
                .success()
                .stdout("remote");
        }

        // the second invocation is served from the persisted cache
        assert_eq!(origin.gets(), 1);
        assert_eq!(origin.heads(), 1);
    });
}
