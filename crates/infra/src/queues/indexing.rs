//! Code-intelligence indexing queue.
//!
//! Each record describes one repository/commit to index. The executor runs the
//! pre-index steps and the indexer in containers, then uploads the resulting
//! dump back to the frontend with credentials embedded in the endpoint URL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use execq_core::{
    CliStep, DockerStep, JobV2, PASSWORD_PLACEHOLDER, RedactionMap, USERNAME_PLACEHOLDER,
    VirtualFile,
};

use crate::jobs::JobRecord;
use crate::queue::{QueueAdapter, RecordTransformer, TransformContext, TransformError};

pub const QUEUE_NAME: &str = "codeintel";

const UPLOAD_ROUTE: &str = "/.executors/lsif/upload";
const DEFAULT_OUTFILE: &str = "dump.lsif";
const INPUT_ARCHIVE_PATH: &str = "input.tar";

/// A docker step to run before the indexer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreIndexStep {
    pub image: String,
    pub root: String,
    pub commands: Vec<String>,
}

/// Reference to an externally stored archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobRef {
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

/// An indexing request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexingRecord {
    pub repository_name: String,
    pub commit: String,
    pub root: String,
    /// Indexer image; no indexer step is emitted when empty.
    pub indexer: String,
    pub indexer_args: Vec<String>,
    pub local_steps: Vec<String>,
    pub outfile: String,
    pub pre_index_steps: Vec<PreIndexStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_archive: Option<BlobRef>,
}

/// Where (and as whom) executors upload results.
#[derive(Clone, PartialEq, Eq)]
pub struct FrontendCredentials {
    pub url: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for FrontendCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrontendCredentials")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl FrontendCredentials {
    pub fn new(url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// `url` with percent-encoded userinfo inserted after the scheme.
    pub fn authenticated_url(&self) -> Result<String, TransformError> {
        let encoded_username = urlencoding::encode(&self.username);
        let encoded_password = urlencoding::encode(&self.password);
        self.with_userinfo(&encoded_username, &encoded_password)
    }

    /// The authenticated URL as it should appear in logs.
    pub fn redacted_url(&self) -> Result<String, TransformError> {
        self.with_userinfo(USERNAME_PLACEHOLDER, PASSWORD_PLACEHOLDER)
    }

    fn with_userinfo(&self, username: &str, password: &str) -> Result<String, TransformError> {
        let (scheme, rest) = self
            .url
            .split_once("://")
            .filter(|(scheme, rest)| !scheme.is_empty() && !rest.is_empty())
            .ok_or_else(|| TransformError::new(format!("frontend url {:?} has no scheme or host", self.url)))?;

        // Replace any userinfo the configured URL already carries.
        let host_and_path = match rest.split_once('/') {
            Some((authority, path)) => {
                let host = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
                format!("{host}/{path}")
            }
            None => rest.rsplit_once('@').map_or(rest, |(_, host)| host).to_string(),
        };
        let host_and_path = host_and_path.trim_end_matches('/');

        Ok(format!("{scheme}://{username}:{password}@{host_and_path}"))
    }

    /// Every form of the credentials that may show up in executor output.
    pub fn redactions(&self) -> Result<RedactionMap, TransformError> {
        let mut redactions = RedactionMap::new();
        redactions.insert(self.authenticated_url()?, self.redacted_url()?);
        redactions.insert(self.username.clone(), USERNAME_PLACEHOLDER);
        redactions.insert(self.password.clone(), PASSWORD_PLACEHOLDER);

        let encoded_username = urlencoding::encode(&self.username);
        if encoded_username != self.username {
            redactions.insert(encoded_username.into_owned(), USERNAME_PLACEHOLDER);
        }
        let encoded_password = urlencoding::encode(&self.password);
        if encoded_password != self.password {
            redactions.insert(encoded_password.into_owned(), PASSWORD_PLACEHOLDER);
        }
        Ok(redactions)
    }
}

/// Turns [`IndexingRecord`]s into executor jobs.
#[derive(Debug, Clone)]
pub struct IndexingTransformer {
    frontend: FrontendCredentials,
}

impl IndexingTransformer {
    pub fn new(frontend: FrontendCredentials) -> Self {
        Self { frontend }
    }
}

impl RecordTransformer for IndexingTransformer {
    type Record = IndexingRecord;

    fn transform(
        &self,
        record: &JobRecord<IndexingRecord>,
        _ctx: &TransformContext,
    ) -> Result<JobV2, TransformError> {
        let index = &record.payload;
        if index.repository_name.trim().is_empty() {
            return Err(TransformError::new("record has no repository name"));
        }
        if index.commit.trim().is_empty() {
            return Err(TransformError::new("record has no commit"));
        }

        let mut docker_steps: Vec<DockerStep> = index
            .pre_index_steps
            .iter()
            .enumerate()
            .map(|(i, step)| DockerStep {
                key: format!("pre-index.{i}"),
                image: step.image.clone(),
                commands: step.commands.clone(),
                dir: step.root.clone(),
                env: Vec::new(),
            })
            .collect();

        if !index.indexer.is_empty() {
            let mut commands = index.local_steps.clone();
            if !index.indexer_args.is_empty() {
                commands.push(shell_join(&index.indexer_args));
            }
            docker_steps.push(DockerStep {
                key: "indexer".to_string(),
                image: index.indexer.clone(),
                commands,
                dir: index.root.clone(),
                env: Vec::new(),
            });
        }

        let root = if index.root.is_empty() { "." } else { index.root.as_str() };
        let outfile = if index.outfile.is_empty() {
            DEFAULT_OUTFILE
        } else {
            index.outfile.as_str()
        };
        let index_id = record.id.to_string();
        let upload = [
            "lsif",
            "upload",
            "-no-progress",
            "-repo",
            index.repository_name.as_str(),
            "-commit",
            index.commit.as_str(),
            "-root",
            root,
            "-upload-route",
            UPLOAD_ROUTE,
            "-file",
            outfile,
            "-associated-index-id",
            index_id.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let mut job = JobV2::new(record.id);
        job.repository_name = index.repository_name.clone();
        job.commit = index.commit.clone();
        job.docker_steps = docker_steps;
        job.cli_steps = vec![CliStep {
            key: "upload".to_string(),
            commands: upload,
            dir: index.root.clone(),
            env: vec![format!("SRC_ENDPOINT={}", self.frontend.authenticated_url()?)],
        }];
        job.redacted_values = self.frontend.redactions()?;

        if let Some(archive) = &index.input_archive {
            job.files.insert(
                INPUT_ARCHIVE_PATH.to_string(),
                VirtualFile::blob(archive.bucket.clone(), archive.key.clone(), archive.modified_at),
            );
        }

        Ok(job)
    }
}

/// The indexing queue with the given upload endpoint.
pub fn indexing_queue(frontend: FrontendCredentials) -> QueueAdapter<IndexingTransformer> {
    QueueAdapter::new(QUEUE_NAME, IndexingTransformer::new(frontend))
}

/// Quote `args` for a POSIX shell.
fn shell_join(args: &[String]) -> String {
    args.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c);
    if !arg.is_empty() && arg.chars().all(safe) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r#"'"'"'"#))
}
