//! Executor version negotiation.
//!
//! Executors advertise a `version` on dequeue and heartbeat. It is either an
//! explicit protocol tag (`"1"`, `"V2"`), the literal `"dev"`, or the
//! executor's release version. The result is the newest job shape the
//! executor can parse.

use semver::Version;

use crate::error::{ProtocolError, ProtocolResult};
use crate::job::JobVersion;

/// First executor release that understands V2 payloads.
pub const V2_MIN_EXECUTOR_VERSION: Version = Version::new(5, 2, 0);

/// Resolve the newest job shape the calling executor supports.
pub fn max_supported_version(raw: Option<&str>) -> ProtocolResult<JobVersion> {
    let raw = match raw.map(str::trim) {
        None | Some("") => return Ok(JobVersion::V1),
        Some(raw) => raw,
    };

    match raw {
        "1" | "V1" | "v1" => return Ok(JobVersion::V1),
        "2" | "V2" | "v2" | "dev" => return Ok(JobVersion::V2),
        _ => {}
    }

    let release = raw.strip_prefix('v').unwrap_or(raw);
    let version = Version::parse(release)
        .map_err(|e| ProtocolError::invalid_executor_version(raw, e.to_string()))?;

    // Release candidates of a supporting release count as supporting.
    let core = Version::new(version.major, version.minor, version.patch);
    if core >= V2_MIN_EXECUTOR_VERSION {
        Ok(JobVersion::V2)
    } else {
        Ok(JobVersion::V1)
    }
}
