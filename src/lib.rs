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

#![doc = include_str!("../README.md")]

/// Checksums and content digests
pub mod checksum;
/// CLI command implementations
pub mod command;
/// Configuration file format and discovery
pub mod config;
/// Shared instance state
pub mod context;
/// Single-flight downloads into local caches
pub mod coordinator;
/// Error types
pub mod errors;
/// Artifact path layouts
pub mod layout;
/// Maven repository metadata
pub mod maven_metadata;
/// Repository metadata nodes
pub mod metadata;
/// Request paths
pub mod path;
/// Path rules and authorization
pub mod policy;
/// Remote origins
pub mod remote;
/// Repository kinds and resolution
pub mod repo;
/// Resolution results
pub mod resource;
/// Memo of negative remote lookups
pub mod retrieval_cache;
/// Deduplicating content store
pub mod store;

pub use context::Context;
pub use errors::{Error, Result};
