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

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize, de::Visitor};
use sha2::Digest as _;
use strum::{Display, EnumString};
use thiserror::Error;

/// Checksum algorithms exposed for every stored file.
// Do not reorder variants; `Checksums` iterates and serializes in this order.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
)]
pub enum ChecksumType {
    /// MD5, 128 bits
    #[serde(rename = "md5")]
    #[strum(serialize = "md5")]
    Md5,
    /// SHA-1, 160 bits
    #[serde(rename = "sha1")]
    #[strum(serialize = "sha1")]
    Sha1,
    /// SHA-2 with 256 bits
    #[serde(rename = "sha256")]
    #[strum(serialize = "sha256")]
    Sha256,
}

impl ChecksumType {
    /// All supported algorithms.
    pub const ALL: [ChecksumType; 3] = [Self::Md5, Self::Sha1, Self::Sha256];

    /// File extension of checksum files using this algorithm (`foo.jar.sha1`).
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    /// Algorithm for a checksum file extension.
    pub fn from_extension(extension: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|checksum| checksum.extension() == extension)
    }

    /// Length of the hex encoded digest.
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha1 => 40,
            Self::Sha256 => 64,
        }
    }

    /// Name of the response header origins use to advertise this checksum.
    pub fn header(&self) -> &'static str {
        match self {
            Self::Md5 => "x-checksum-md5",
            Self::Sha1 => "x-checksum-sha1",
            Self::Sha256 => "x-checksum-sha256",
        }
    }

    /// Create a digest of some data using this algorithm.
    pub fn digest(&self, data: &[u8]) -> Digest {
        let digest = match self {
            Self::Md5 => md5::Md5::new().chain_update(data).finalize().to_vec(),
            Self::Sha1 => sha1::Sha1::new().chain_update(data).finalize().to_vec(),
            Self::Sha256 => sha2::Sha256::new().chain_update(data).finalize().to_vec(),
        };

        Digest {
            algorithm: *self,
            digest,
        }
    }
}

/// Error parsing a [`ChecksumType`].
#[derive(Error, Debug)]
pub enum ChecksumTypeError {
    /// The algorithm is not one of md5, sha1 or sha256
    #[error("unsupported checksum algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// A cryptographic digest identifying a piece of content.
///
/// ```rust
/// use depot::checksum::{ChecksumType, Digest};
///
/// let algorithm = ChecksumType::Sha256;
/// let hello = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
///
/// let digest = Digest::from_parts(algorithm, hello).unwrap();
/// assert_eq!(digest, format!("{algorithm}:{hello}").parse().unwrap());
/// assert_eq!(digest, format!("{digest}").parse().unwrap());
/// ```
// Do not reorder fields: the derived ordering is used to sort store listings.
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Hash, Debug)]
pub struct Digest {
    /// Algorithm used to create digest.
    algorithm: ChecksumType,
    /// Digest value.
    digest: Vec<u8>,
}

impl Digest {
    /// Digest are displayed as `algorithm:digest`, this takes the two in separate variables.
    pub fn from_parts(algorithm: ChecksumType, digest: &str) -> Result<Self, DigestError> {
        let digest = hex::decode(digest)?;
        Ok(Self { algorithm, digest })
    }

    /// Algorithm used to create this digest.
    pub fn algorithm(&self) -> ChecksumType {
        self.algorithm
    }

    /// Digest as raw byte data.
    pub fn as_bytes(&self) -> &[u8] {
        &self.digest
    }

    /// Lowercase hex encoding of the digest value, without the algorithm prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }
}

/// Error parsing a [`Digest`].
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum DigestError {
    #[error("missing delimiter")]
    MissingDelimiter,
    #[error(transparent)]
    Algorithm(#[from] ChecksumTypeError),
    #[error(transparent)]
    Digest(#[from] hex::FromHexError),
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let Some((algorithm_str, digest_str)) = input.split_once(':') else {
            return Err(DigestError::MissingDelimiter);
        };
        let algorithm: ChecksumType = algorithm_str
            .parse()
            .map_err(|_| ChecksumTypeError::UnsupportedAlgorithm(algorithm_str.into()))?;
        Self::from_parts(algorithm, digest_str)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, hex::encode(&self.digest))
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

struct DigestVisitor;

impl Visitor<'_> for DigestVisitor {
    type Value = Digest;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a hexadecimal encoded cryptographic digest")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        value.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(DigestVisitor)
    }
}

/// Hex encoded checksums of one file, keyed by algorithm.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksums(BTreeMap<ChecksumType, String>);

impl Checksums {
    /// Checksum for one algorithm, if known.
    pub fn get(&self, checksum: ChecksumType) -> Option<&str> {
        self.0.get(&checksum).map(String::as_str)
    }

    /// Record a checksum. Values are normalized to lowercase hex.
    pub fn insert(&mut self, checksum: ChecksumType, value: impl AsRef<str>) {
        self.0
            .insert(checksum, value.as_ref().trim().to_ascii_lowercase());
    }

    /// Builder-style [`Checksums::insert`].
    pub fn with(mut self, checksum: ChecksumType, value: impl AsRef<str>) -> Self {
        self.insert(checksum, value);
        self
    }

    /// Iterate over all known checksums.
    pub fn iter(&self) -> impl Iterator<Item = (ChecksumType, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// Whether no checksum is known.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compare declared checksums against these (computed) ones.
    ///
    /// Only algorithms present on both sides are compared.
    pub fn mismatches(&self, declared: &Checksums) -> Vec<ChecksumMismatch> {
        declared
            .iter()
            .filter_map(|(checksum, expected)| {
                let actual = self.get(checksum)?;
                (actual != expected).then(|| ChecksumMismatch {
                    checksum,
                    expected: expected.to_owned(),
                    actual: actual.to_owned(),
                })
            })
            .collect()
    }
}

/// A declared checksum that differs from the computed one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChecksumMismatch {
    /// Algorithm of the checksum
    pub checksum: ChecksumType,
    /// Declared value
    pub expected: String,
    /// Computed value
    pub actual: String,
}

/// Incrementally computes every supported checksum of a byte stream.
#[derive(Clone, Default)]
pub struct ChecksumHasher {
    md5: md5::Md5,
    sha1: sha1::Sha1,
    sha256: sha2::Sha256,
    length: u64,
}

/// Outcome of hashing a complete stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hashed {
    /// Content identity used by the content store.
    pub digest: Digest,
    /// All checksums of the content.
    pub checksums: Checksums,
    /// Number of bytes hashed.
    pub length: u64,
}

impl ChecksumHasher {
    /// Start hashing an empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of the stream.
    pub fn update(&mut self, chunk: &[u8]) {
        self.md5.update(chunk);
        self.sha1.update(chunk);
        self.sha256.update(chunk);
        self.length += chunk.len() as u64;
    }

    /// Finish the stream.
    pub fn finalize(self) -> Hashed {
        let sha256 = self.sha256.finalize().to_vec();
        let checksums = Checksums::default()
            .with(ChecksumType::Md5, hex::encode(self.md5.finalize()))
            .with(ChecksumType::Sha1, hex::encode(self.sha1.finalize()))
            .with(ChecksumType::Sha256, hex::encode(&sha256));

        Hashed {
            digest: Digest {
                algorithm: ChecksumType::Sha256,
                digest: sha256,
            },
            checksums,
            length: self.length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_test::{Token, assert_tokens};

    const HELLO_DIGEST: &str =
        "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    const HELLO_SHA1: &str = "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d";
    const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";

    #[test]
    fn can_parse_checksum_type() {
        assert!(matches!("sha256".parse(), Ok(ChecksumType::Sha256)));
        assert!(matches!("md5".parse(), Ok(ChecksumType::Md5)));
        assert!("crc32".parse::<ChecksumType>().is_err());
        assert_eq!(ChecksumType::from_extension("sha1"), Some(ChecksumType::Sha1));
        assert_eq!(ChecksumType::from_extension("jar"), None);
    }

    #[test]
    fn can_parse_digest() {
        let digest: Digest = HELLO_DIGEST.parse().unwrap();
        assert_eq!(digest.algorithm(), ChecksumType::Sha256);
        assert_eq!(
            digest.as_bytes(),
            &hex::decode(&HELLO_DIGEST[7..]).unwrap()[..]
        );
    }

    #[test]
    fn can_convert_digest() {
        let digest = ChecksumType::Sha256.digest("hello".as_bytes());
        assert_eq!(digest.to_string(), HELLO_DIGEST);
        assert_eq!(ChecksumType::Sha1.digest(b"hello").to_hex(), HELLO_SHA1);
        assert_eq!(ChecksumType::Md5.digest(b"hello").to_hex(), HELLO_MD5);
    }

    #[test]
    fn cannot_parse_invalid_digest() {
        assert!(matches!(
            "crc32:abc".parse::<Digest>(),
            Err(DigestError::Algorithm(_))
        ));
        assert!(matches!(
            "".parse::<Digest>(),
            Err(DigestError::MissingDelimiter)
        ));
        assert!(matches!(
            "sha256:xxx".parse::<Digest>(),
            Err(DigestError::Digest(_))
        ));
    }

    #[test]
    fn can_serialize() {
        let digest: Digest = HELLO_DIGEST.parse().unwrap();
        assert_tokens(&digest, &[Token::Str(HELLO_DIGEST)]);
    }

    #[test]
    fn hasher_matches_one_shot_digests() {
        let mut hasher = ChecksumHasher::new();
        hasher.update(b"he");
        hasher.update(b"llo");
        let hashed = hasher.finalize();

        assert_eq!(hashed.digest.to_string(), HELLO_DIGEST);
        assert_eq!(hashed.length, 5);
        assert_eq!(hashed.checksums.get(ChecksumType::Md5), Some(HELLO_MD5));
        assert_eq!(hashed.checksums.get(ChecksumType::Sha1), Some(HELLO_SHA1));
    }

    #[test]
    fn mismatches_only_compare_declared_algorithms() {
        let computed = ChecksumHasher::new().finalize().checksums;
        let declared = Checksums::default().with(ChecksumType::Sha1, "deadbeef");

        let mismatches = computed.mismatches(&declared);
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].checksum, ChecksumType::Sha1);
        assert_eq!(mismatches[0].expected, "deadbeef");

        let declared = Checksums::default().with(
            ChecksumType::Md5,
            computed.get(ChecksumType::Md5).unwrap().to_uppercase(),
        );
        assert!(computed.mismatches(&declared).is_empty());
    }
}
