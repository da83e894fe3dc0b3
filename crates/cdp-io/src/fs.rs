//! Filesystem scheme dispatch: local paths and S3-compatible object storage.
//!
//! URIs are `file:///abs/path`, bare local paths (absolute or relative), or
//! `s3://bucket/key`. S3 credentials come from the environment:
//! `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_ENDPOINT_URL` and
//! `AWS_SECURE_SCHEME` (`http`/`https`). Wildcard globs are expanded for
//! local paths only and rejected for object-store schemes.

use std::path::PathBuf;

use bytes::Bytes;
use cdp_core::config::PathArg;
use cdp_core::error::{backoff_delay, MAX_RETRIES};
use cdp_core::CdpError;
use futures::TryStreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde_json::Value;
use tracing::warn;

/// A resolved storage location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    S3 { bucket: String, key: String },
}

impl Location {
    pub fn display(&self) -> String {
        match self {
            Self::Local(p) => p.display().to_string(),
            Self::S3 { bucket, key } => format!("s3://{bucket}/{key}"),
        }
    }
}

/// An input file with its size when cheaply known (used for the
/// partition-count override).
#[derive(Debug, Clone)]
pub struct InputFile {
    pub location: Location,
    pub size: u64,
}

/// Parse a URI into a location. Unknown schemes are configuration errors.
pub fn parse_location(uri: &str) -> Result<Location, CdpError> {
    if let Some(rest) = uri.strip_prefix("s3://") {
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(CdpError::config("path", format!("missing bucket in '{uri}'")));
        }
        Ok(Location::S3 { bucket: bucket.to_owned(), key: key.to_owned() })
    } else if let Some(rest) = uri.strip_prefix("file://") {
        Ok(Location::Local(PathBuf::from(rest)))
    } else if let Some((scheme, _)) = uri.split_once("://") {
        Err(CdpError::config("path", format!("unsupported scheme '{scheme}' in '{uri}'")))
    } else {
        Ok(Location::Local(PathBuf::from(uri)))
    }
}

fn env_var(name: &str) -> Result<String, CdpError> {
    std::env::var(name)
        .map_err(|_| CdpError::config("s3", format!("environment variable {name} is not set")))
}

/// Build an S3 client for `bucket` from environment credentials.
pub fn s3_store(bucket: &str) -> Result<AmazonS3, CdpError> {
    let scheme = std::env::var("AWS_SECURE_SCHEME").unwrap_or_else(|_| "https".to_owned());
    AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_access_key_id(env_var("AWS_ACCESS_KEY_ID")?)
        .with_secret_access_key(env_var("AWS_SECRET_ACCESS_KEY")?)
        .with_endpoint(env_var("AWS_ENDPOINT_URL")?)
        .with_region(std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_owned()))
        .with_allow_http(scheme == "http")
        .build()
        .map_err(|e| CdpError::config("s3", e.to_string()))
}

/// Resolve configured input path(s) to a list of concrete files.
///
/// Local wildcards are expanded; an `s3://.../` prefix is listed; a bare
/// `s3://bucket/key` is taken as a single object.
pub async fn resolve_inputs(path: &PathArg) -> Result<Vec<InputFile>, CdpError> {
    let mut files = Vec::new();
    for uri in path.iter() {
        let location = parse_location(uri)?;
        match location {
            Location::Local(local) => {
                let pattern = local.to_string_lossy();
                if pattern.contains('*') {
                    let entries = glob::glob(&pattern)
                        .map_err(|e| CdpError::config("path", e.to_string()))?;
                    for entry in entries {
                        let p = entry.map_err(|e| CdpError::permanent("glob", e.to_string()))?;
                        if p.is_file() {
                            let size = std::fs::metadata(&p).map(|m| m.len()).unwrap_or(0);
                            files.push(InputFile { location: Location::Local(p), size });
                        }
                    }
                } else {
                    let size = std::fs::metadata(&local)
                        .map_err(|e| CdpError::permanent("read", format!("{}: {e}", local.display())))?
                        .len();
                    files.push(InputFile { location: Location::Local(local), size });
                }
            }
            Location::S3 { bucket, key } => {
                if uri.contains('*') {
                    return Err(CdpError::config(
                        "path",
                        "wildcard paths are only supported for local filesystems",
                    ));
                }
                if key.ends_with('/') || key.is_empty() {
                    let store = s3_store(&bucket)?;
                    let prefix = ObjectPath::from(key.trim_end_matches('/'));
                    let objects: Vec<_> = store
                        .list(Some(&prefix))
                        .try_collect()
                        .await
                        .map_err(|e| CdpError::transient("s3 list", e.to_string()))?;
                    for meta in objects {
                        files.push(InputFile {
                            location: Location::S3 {
                                bucket: bucket.clone(),
                                key: meta.location.to_string(),
                            },
                            size: meta.size as u64,
                        });
                    }
                } else {
                    files.push(InputFile { location: Location::S3 { bucket, key }, size: 0 });
                }
            }
        }
    }
    if files.is_empty() {
        return Err(CdpError::permanent(
            "read",
            format!("no files matched: {}", path.first()),
        ));
    }
    Ok(files)
}

/// Read the full contents of a location, retrying transient object-store
/// failures with bounded backoff.
pub async fn read_bytes(location: &Location) -> Result<Vec<u8>, CdpError> {
    match location {
        Location::Local(p) => std::fs::read(p)
            .map_err(|e| CdpError::permanent("read", format!("{}: {e}", p.display()))),
        Location::S3 { bucket, key } => {
            let store = s3_store(bucket)?;
            let object = ObjectPath::from(key.as_str());
            let mut attempt = 0u32;
            loop {
                let result = async {
                    let get = store
                        .get(&object)
                        .await
                        .map_err(|e| CdpError::transient("s3 get", e.to_string()))?;
                    get.bytes()
                        .await
                        .map_err(|e| CdpError::transient("s3 get", e.to_string()))
                }
                .await;
                match result {
                    Ok(bytes) => return Ok(bytes.to_vec()),
                    Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                        attempt += 1;
                        warn!(location = %location.display(), error = %e, attempt, "retrying read");
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

/// Write `data` to a destination URI. Flush failures are permanent.
pub async fn write_bytes(uri: &str, data: Vec<u8>) -> Result<(), CdpError> {
    match parse_location(uri)? {
        Location::Local(p) => {
            if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CdpError::permanent("write", format!("{}: {e}", parent.display())))?;
            }
            std::fs::write(&p, data)
                .map_err(|e| CdpError::permanent("write", format!("{}: {e}", p.display())))
        }
        Location::S3 { bucket, key } => {
            let store = s3_store(&bucket)?;
            store
                .put(&ObjectPath::from(key.as_str()), Bytes::from(data))
                .await
                .map_err(|e| CdpError::permanent("s3 put", e.to_string()))?;
            Ok(())
        }
    }
}

/// Join an output directory URI with a file name.
pub fn join_output(dir: &str, file_name: &str) -> String {
    if let Some(stripped) = dir.strip_suffix('/') {
        format!("{stripped}/{file_name}")
    } else if dir.is_empty() {
        file_name.to_owned()
    } else {
        format!("{dir}/{file_name}")
    }
}

/// Serialize a JSON value with sorted keys and four-space indentation and
/// write it to the destination URI.
pub async fn write_json_pretty(uri: &str, value: &Value) -> Result<(), CdpError> {
    let mut data = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut data, formatter);
    serde::Serialize::serialize(value, &mut serializer)
        .map_err(|e| CdpError::permanent("write", e.to_string()))?;
    data.push(b'\n');
    write_bytes(uri, data).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_local_and_s3_locations() {
        assert_eq!(parse_location("/data/in.jsonl").unwrap(), Location::Local("/data/in.jsonl".into()));
        assert_eq!(parse_location("file:///data/in.jsonl").unwrap(), Location::Local("/data/in.jsonl".into()));
        assert_eq!(
            parse_location("s3://corpus/raw/web.parquet").unwrap(),
            Location::S3 { bucket: "corpus".into(), key: "raw/web.parquet".into() }
        );
        assert!(matches!(parse_location("gs://bucket/x"), Err(CdpError::Config { .. })));
    }

    #[tokio::test]
    async fn s3_wildcards_rejected() {
        let err = resolve_inputs(&PathArg::from("s3://bucket/raw/*.parquet"))
            .await
            .unwrap_err();
        assert!(matches!(err, CdpError::Config { .. }));
    }

    #[tokio::test]
    async fn local_glob_resolves_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.jsonl", "b.jsonl"] {
            std::fs::write(dir.path().join(name), "{}\n").unwrap();
        }
        let pattern = dir.path().join("*.jsonl").to_string_lossy().into_owned();
        let files = resolve_inputs(&PathArg::from(pattern.as_str())).await.unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.size > 0));
    }

    #[tokio::test]
    async fn missing_input_is_an_error() {
        let err = resolve_inputs(&PathArg::from("/definitely/not/here.jsonl"))
            .await
            .unwrap_err();
        assert!(matches!(err, CdpError::Permanent { .. }));
    }

    #[tokio::test]
    async fn pretty_json_is_sorted_and_indented() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("stats.json").to_string_lossy().into_owned();
        // serde_json maps are sorted by key already; check the indentation
        let value = json!({"b": 1, "a": {"nested": true}});
        write_json_pretty(&out, &value).await.unwrap();
        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.starts_with("{\n    \"a\""));
        assert!(text.contains("\n        \"nested\": true"));
    }

    #[test]
    fn join_output_handles_trailing_slash() {
        assert_eq!(join_output("out", "part-00000.jsonl"), "out/part-00000.jsonl");
        assert_eq!(join_output("out/", "part-00000.jsonl"), "out/part-00000.jsonl");
        assert_eq!(join_output("s3://b/k", "f"), "s3://b/k/f");
    }
}
