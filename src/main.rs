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

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use depot::{command, config::Config, context::Context};
use miette::{Context as _, IntoDiagnostic, miette};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file, defaults to the nearest depot.toml
    #[clap(long, global = true, env = "DEPOT_CONFIG")]
    config: Option<PathBuf>,

    /// Log resolution steps
    #[clap(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolves a path and shows where it is served from
    Info {
        /// Repository key
        repo: String,
        /// Path inside the repository
        path: String,
    },

    /// Downloads an artifact
    #[clap(alias = "get")]
    Fetch {
        /// Repository key
        repo: String,
        /// Path inside the repository
        path: String,
        /// Write the content to this file instead of stdout
        #[clap(long, short)]
        output: Option<PathBuf>,
    },

    /// Deploys a file into a local repository
    #[clap(alias = "put")]
    Deploy {
        /// Key of a local repository
        repo: String,
        /// Destination path inside the repository
        path: String,
        /// File to deploy
        file: PathBuf,
        /// Expected md5 checksum
        #[clap(long)]
        md5: Option<String>,
        /// Expected sha1 checksum
        #[clap(long)]
        sha1: Option<String>,
    },

    /// Reclaims content no longer referenced by any repository
    Gc {
        /// Number of collection passes
        #[clap(long)]
        #[arg(default_value_t = 2)]
        passes: usize,
    },

    /// Validates the configuration and lists all repositories
    Check,
}

fn locate_config(explicit: Option<PathBuf>) -> miette::Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let cwd = std::env::current_dir()
        .into_diagnostic()
        .wrap_err("failed to access current directory")?;

    Config::locate(&cwd).ok_or_else(|| {
        miette!(
            "no {} found in {} or any parent directory",
            Config::FILE_NAME,
            cwd.display()
        )
    })
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    human_panic::setup_panic!();

    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));

    tracing_subscriber::fmt()
        .compact()
        .without_time()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_file(false)
        .with_target(false)
        .with_line_number(false)
        .try_init()
        .map_err(|error| miette!("failed to initialize logging: {error}"))?;

    let config_path = locate_config(cli.config)?;
    let config = Config::load(&config_path)
        .await
        .wrap_err(miette!("failed to load {}", config_path.display()))?;
    let context = Context::open(config).wrap_err("failed to open storage")?;

    match cli.command {
        Command::Info { repo, path } => command::info(&context, &repo, &path)
            .await
            .wrap_err(miette!("info command failed")),
        Command::Fetch { repo, path, output } => command::fetch(&context, &repo, &path, output)
            .await
            .wrap_err(miette!("fetch command failed")),
        Command::Deploy {
            repo,
            path,
            file,
            md5,
            sha1,
        } => command::deploy(&context, &repo, &path, &file, md5, sha1)
            .await
            .wrap_err(miette!("deploy command failed")),
        Command::Gc { passes } => command::gc(&context, passes)
            .await
            .wrap_err(miette!("gc command failed")),
        Command::Check => command::check(&context)
            .await
            .wrap_err(miette!("check command failed")),
    }
}
