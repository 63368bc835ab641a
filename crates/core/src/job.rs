//! Versioned job payload sent to executors.
//!
//! A [`Job`] is a sum type over the wire shapes this server can produce.
//! Every encoded payload carries an explicit `version` tag; decoding reads
//! that tag first and only then picks a shape. Payloads without a tag come
//! from the first protocol generation and decode as V1.
//!
//! The shapes share [`JobSpec`] and only differ in how virtual files are
//! carried:
//!
//! | Version | File shape |
//! |---------|------------|
//! | 1 | [`TextFile`]: inline text only |
//! | 2 | [`VirtualFile`]: inline text, inline binary (base64), or a bucket/key reference |

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, ProtocolResult};
use crate::id::RecordId;
use crate::redaction::RedactionMap;

/// Wire-shape version of a job payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobVersion {
    V1,
    V2,
}

impl JobVersion {
    pub const LATEST: JobVersion = JobVersion::V2;

    pub const fn as_u8(self) -> u8 {
        match self {
            JobVersion::V1 => 1,
            JobVersion::V2 => 2,
        }
    }

    pub fn from_tag(tag: u64) -> ProtocolResult<Self> {
        match tag {
            1 => Ok(JobVersion::V1),
            2 => Ok(JobVersion::V2),
            other => Err(ProtocolError::UnknownJobVersion(other)),
        }
    }
}

impl fmt::Display for JobVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// A step run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerStep {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    pub image: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub dir: String,
    /// `KEY=VALUE` pairs.
    #[serde(default)]
    pub env: Vec<String>,
}

/// A step run through the executor's bundled command-line tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliStep {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub dir: String,
    /// `KEY=VALUE` pairs.
    #[serde(default)]
    pub env: Vec<String>,
}

/// V1 virtual file: inline text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextFile {
    pub content: String,
}

/// V2 virtual file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum VirtualFile {
    Text {
        content: String,
    },
    /// Content stored externally, fetched by the executor.
    #[serde(rename_all = "camelCase")]
    Blob {
        bucket: String,
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        modified_at: Option<DateTime<Utc>>,
    },
    Binary {
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },
}

impl VirtualFile {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn blob(bucket: impl Into<String>, key: impl Into<String>, modified_at: Option<DateTime<Utc>>) -> Self {
        Self::Blob {
            bucket: bucket.into(),
            key: key.into(),
            modified_at,
        }
    }

    pub fn binary(content: impl Into<Vec<u8>>) -> Self {
        Self::Binary {
            content: content.into(),
        }
    }
}

/// Fields shared by every job shape; `F` is the version's file representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "F: Deserialize<'de>"))]
pub struct JobSpec<F> {
    pub id: RecordId,
    #[serde(default)]
    pub repository_name: String,
    #[serde(default)]
    pub repository_directory: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub fetch_tags: bool,
    #[serde(default)]
    pub shallow_clone: bool,
    #[serde(default)]
    pub sparse_checkout: Vec<String>,
    #[serde(default)]
    pub files: BTreeMap<String, F>,
    #[serde(default)]
    pub docker_steps: Vec<DockerStep>,
    #[serde(default)]
    pub cli_steps: Vec<CliStep>,
    #[serde(default)]
    pub redacted_values: RedactionMap,
}

pub type JobV1 = JobSpec<TextFile>;
pub type JobV2 = JobSpec<VirtualFile>;

impl<F> JobSpec<F> {
    pub fn new(id: RecordId) -> Self {
        Self {
            id,
            repository_name: String::new(),
            repository_directory: String::new(),
            commit: String::new(),
            fetch_tags: false,
            shallow_clone: false,
            sparse_checkout: Vec::new(),
            files: BTreeMap::new(),
            docker_steps: Vec::new(),
            cli_steps: Vec::new(),
            redacted_values: RedactionMap::new(),
        }
    }

    fn try_map_files<G, E>(
        self,
        mut f: impl FnMut(&str, F) -> Result<G, E>,
    ) -> Result<JobSpec<G>, E> {
        let mut files = BTreeMap::new();
        for (path, file) in self.files {
            let mapped = f(&path, file)?;
            files.insert(path, mapped);
        }
        Ok(JobSpec {
            id: self.id,
            repository_name: self.repository_name,
            repository_directory: self.repository_directory,
            commit: self.commit,
            fetch_tags: self.fetch_tags,
            shallow_clone: self.shallow_clone,
            sparse_checkout: self.sparse_checkout,
            files,
            docker_steps: self.docker_steps,
            cli_steps: self.cli_steps,
            redacted_values: self.redacted_values,
        })
    }
}

impl JobV2 {
    /// Express this job in the V1 shape, if every file is plain text.
    pub fn into_v1(self) -> ProtocolResult<JobV1> {
        let id = self.id;
        self.try_map_files(|path, file| match file {
            VirtualFile::Text { content } => Ok(TextFile { content }),
            VirtualFile::Blob { .. } | VirtualFile::Binary { .. } => Err(ProtocolError::NotRepresentable {
                id,
                version: JobVersion::V1.as_u8(),
                path: path.to_string(),
            }),
        })
    }
}

impl JobV1 {
    pub fn into_v2(self) -> JobV2 {
        match self.try_map_files(|_, file| Ok::<_, std::convert::Infallible>(VirtualFile::Text { content: file.content })) {
            Ok(job) => job,
            Err(never) => match never {},
        }
    }
}

/// A job payload in one of the supported wire shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    V1(JobV1),
    V2(JobV2),
}

impl Job {
    /// Pick the richest shape the executor can parse.
    ///
    /// Fails when the job needs files that older shapes cannot carry.
    pub fn negotiate(spec: JobV2, max_version: JobVersion) -> ProtocolResult<Job> {
        match max_version {
            JobVersion::V2 => Ok(Job::V2(spec)),
            JobVersion::V1 => spec.into_v1().map(Job::V1),
        }
    }

    pub fn version(&self) -> JobVersion {
        match self {
            Job::V1(_) => JobVersion::V1,
            Job::V2(_) => JobVersion::V2,
        }
    }

    pub fn id(&self) -> RecordId {
        match self {
            Job::V1(job) => job.id,
            Job::V2(job) => job.id,
        }
    }

    pub fn redacted_values(&self) -> &RedactionMap {
        match self {
            Job::V1(job) => &job.redacted_values,
            Job::V2(job) => &job.redacted_values,
        }
    }

    pub fn from_value(value: Value) -> ProtocolResult<Job> {
        let tag = match value.get("version") {
            None | Some(Value::Null) => 1,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| ProtocolError::malformed(format!("version must be a non-negative integer, got {v}")))?,
        };

        match JobVersion::from_tag(tag)? {
            JobVersion::V1 => serde_json::from_value::<JobV1>(value).map(Job::V1),
            JobVersion::V2 => serde_json::from_value::<JobV2>(value).map(Job::V2),
        }
        .map_err(|e| ProtocolError::malformed(e.to_string()))
    }

    pub fn from_slice(bytes: &[u8]) -> ProtocolResult<Job> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| ProtocolError::malformed(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn to_vec(&self) -> ProtocolResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::malformed(e.to_string()))
    }
}

#[derive(Serialize)]
struct Tagged<'a, T> {
    version: u8,
    #[serde(flatten)]
    job: &'a T,
}

impl Serialize for Job {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Job::V1(job) => Tagged {
                version: JobVersion::V1.as_u8(),
                job,
            }
            .serialize(serializer),
            Job::V2(job) => Tagged {
                version: JobVersion::V2.as_u8(),
                job,
            }
            .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Job {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Job::from_value(value).map_err(de::Error::custom)
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample_v2() -> JobV2 {
        let mut job = JobV2::new(RecordId::new(42));
        job.repository_name = "github.com/acme/widgets".into();
        job.commit = "deadbeef".into();
        job.docker_steps.push(DockerStep {
            key: "indexer".into(),
            image: "acme/indexer:latest".into(),
            commands: vec!["index".into(), "--all".into()],
            dir: "src".into(),
            env: vec!["FOO=bar".into()],
        });
        job
    }

    #[test]
    fn v2_binary_content_survives_encoding() {
        let bytes: Vec<u8> = vec![0, 159, 146, 150, 255, b'\n'];
        let mut spec = sample_v2();
        spec.files.insert("bin/tool".into(), VirtualFile::binary(bytes.clone()));

        let encoded = Job::V2(spec).to_vec().unwrap();
        let decoded = Job::from_slice(&encoded).unwrap();

        assert_eq!(decoded.version(), JobVersion::V2);
        match decoded {
            Job::V2(job) => assert_eq!(job.files["bin/tool"], VirtualFile::Binary { content: bytes }),
            other => panic!("expected v2, got {other:?}"),
        }
    }

    #[test]
    fn missing_version_decodes_as_v1() {
        let payload = json!({
            "id": 7,
            "repositoryName": "r",
            "commit": "c",
            "files": { "script.sh": { "content": "echo hi" } },
        });

        let job = Job::from_value(payload).unwrap();

        assert_eq!(job.version(), JobVersion::V1);
        assert_eq!(job.id(), RecordId::new(7));
        match job {
            Job::V1(job) => assert_eq!(job.files["script.sh"].content, "echo hi"),
            other => panic!("expected v1, got {other:?}"),
        }
    }

    #[test]
    fn v2_files_default_to_empty() {
        let job = Job::from_value(json!({ "version": 2, "id": 5, "commit": "c" })).unwrap();

        match job {
            Job::V2(job) => assert!(job.files.is_empty()),
            other => panic!("expected v2, got {other:?}"),
        }
    }

    #[test]
    fn unknown_version_is_rejected() {
        let err = Job::from_value(json!({ "version": 3, "id": 1 })).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownJobVersion(3));

        let err = Job::from_value(json!({ "version": 0, "id": 1 })).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownJobVersion(0));
    }

    #[test]
    fn version_tag_is_always_emitted() {
        let v1 = serde_json::to_value(Job::V1(JobV1::new(RecordId::new(1)))).unwrap();
        let v2 = serde_json::to_value(Job::V2(JobV2::new(RecordId::new(1)))).unwrap();

        assert_eq!(v1["version"], 1);
        assert_eq!(v2["version"], 2);
    }

    #[test]
    fn v1_files_do_not_carry_v2_fields() {
        let mut spec = sample_v2();
        spec.files.insert("a.txt".into(), VirtualFile::text("hello"));

        let value = serde_json::to_value(Job::negotiate(spec, JobVersion::V1).unwrap()).unwrap();

        assert_eq!(value["files"]["a.txt"], json!({ "content": "hello" }));
    }

    #[test]
    fn v1_shape_rejects_tagged_files() {
        let payload = json!({
            "version": 1,
            "id": 1,
            "files": { "a": { "kind": "binary", "content": "AAE=" } },
        });

        assert!(matches!(Job::from_value(payload), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn negotiation_refuses_to_downgrade_blobs() {
        let mut spec = sample_v2();
        let modified = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        spec.files
            .insert("input.tar".into(), VirtualFile::blob("uploads", "abc/input.tar", Some(modified)));

        let err = Job::negotiate(spec.clone(), JobVersion::V1).unwrap_err();
        assert!(matches!(err, ProtocolError::NotRepresentable { version: 1, ref path, .. } if path == "input.tar"));

        let job = Job::negotiate(spec, JobVersion::V2).unwrap();
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(
            value["files"]["input.tar"],
            json!({ "kind": "blob", "bucket": "uploads", "key": "abc/input.tar", "modifiedAt": "2024-05-01T00:00:00Z" })
        );
    }

    #[test]
    fn v1_upgrades_to_text_files() {
        let mut v1 = JobV1::new(RecordId::new(3));
        v1.files.insert("x".into(), TextFile { content: "y".into() });

        let v2 = v1.into_v2();
        assert_eq!(v2.files["x"], VirtualFile::text("y"));
    }
}
