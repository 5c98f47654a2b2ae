use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use cadence_core::envelope::HandoffEnvelope;
use cadence_core::error::{CadenceError, Result};
use cadence_core::types::{CampaignContext, CampaignId};

use crate::io::bounded;

/// Sub-directories every campaign root must contain.
pub const LAYOUT_DIRS: [&str; 8] = [
    "data",
    "content",
    "assets",
    "templates",
    "docs",
    "handoffs",
    "exports",
    "logs",
];

/// Directory under a campaign root holding envelope files.
pub const HANDOFFS_DIR: &str = "handoffs";
/// Directory under a campaign root holding logs.
pub const LOGS_DIR: &str = "logs";

/// Which input shape produced a resolved path. Shapes are tried in the
/// order listed here and the first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathShape {
    /// The input itself is a path string.
    Direct,
    /// A top-level `campaignPath` field.
    ContextField,
    /// A top-level `campaign_path`, `storagePath` or `storage_path` field.
    AlternateField,
    /// A path embedded in a nested handoff or context structure.
    NestedHandoff,
    /// Constructed from a bare campaign id as `campaigns/<id>/`.
    CampaignId,
}

const ALTERNATE_FIELDS: [&str; 3] = ["campaign_path", "storagePath", "storage_path"];
const CAMPAIGN_PATH_FIELDS: [&str; 4] =
    ["campaignPath", "campaign_path", "storagePath", "storage_path"];
const ID_FIELDS: [&str; 3] = ["campaignId", "campaign_id", "id"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Canonical relative form, always ending in `/`.
    pub path: String,
    pub shape: PathShape,
}

/// Normalizes the ways callers reference a campaign's storage into one
/// canonical path, and maps canonical paths onto the filesystem.
#[derive(Debug, Clone)]
pub struct CampaignPathResolver {
    root: PathBuf,
}

impl CampaignPathResolver {
    /// `root` is the directory relative canonical paths are joined onto.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve any supported input shape to its canonical path.
    pub fn resolve(&self, input: &Value) -> Result<String> {
        resolve_with_shape(input).map(|r| r.path)
    }

    pub fn resolve_context(&self, context: &CampaignContext) -> Result<String> {
        normalize(&context.campaign.storage_path).ok_or_else(|| {
            CadenceError::PathResolution(format!(
                "campaign '{}' has an unusable storagePath '{}'",
                context.campaign.id, context.campaign.storage_path
            ))
        })
    }

    pub fn resolve_envelope(&self, envelope: &HandoffEnvelope) -> Result<String> {
        normalize(&envelope.handoff_info.campaign_path).ok_or_else(|| {
            CadenceError::PathResolution(format!(
                "envelope {} has an unusable campaign path '{}'",
                envelope.handoff_info.handoff_id, envelope.handoff_info.campaign_path
            ))
        })
    }

    /// Filesystem location of a canonical path.
    pub fn absolute(&self, canonical: &str) -> PathBuf {
        let path = Path::new(canonical.trim_end_matches('/'));
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn handoffs_dir(&self, canonical: &str) -> PathBuf {
        self.absolute(canonical).join(HANDOFFS_DIR)
    }
}

/// Resolve `input`, reporting which shape matched.
///
/// A recognised field that is present but holds no usable path is an
/// error; resolution never moves on to the next shape past it.
pub fn resolve_with_shape(input: &Value) -> Result<ResolvedPath> {
    let found = match input {
        Value::String(s) => Some((
            normalize(s).ok_or_else(|| unusable("path", input))?,
            PathShape::Direct,
        )),
        Value::Object(map) => {
            if let Some(p) = string_field(map, &["campaignPath"])? {
                Some((p, PathShape::ContextField))
            } else if let Some(p) = string_field(map, &ALTERNATE_FIELDS)? {
                Some((p, PathShape::AlternateField))
            } else if let Some(p) = nested_path(map)? {
                Some((p, PathShape::NestedHandoff))
            } else {
                map_id(map)?.map(|id| (format!("campaigns/{}/", id), PathShape::CampaignId))
            }
        }
        _ => None,
    };

    match found {
        Some((path, shape)) => {
            debug!(path = %path, shape = ?shape, "Resolved campaign path");
            Ok(ResolvedPath { path, shape })
        }
        None => Err(CadenceError::PathResolution(format!(
            "no campaign path shape matched input: {}",
            summarize_input(input)
        ))),
    }
}

fn unusable(field: &str, value: &Value) -> CadenceError {
    CadenceError::PathResolution(format!(
        "'{}' does not hold a usable campaign path: {}",
        field, value
    ))
}

/// First of `keys` present in `map`, normalized. Null counts as absent.
fn string_field(map: &serde_json::Map<String, Value>, keys: &[&str]) -> Result<Option<String>> {
    for key in keys {
        match map.get(*key) {
            None | Some(Value::Null) => continue,
            Some(value) => {
                return value
                    .as_str()
                    .and_then(normalize)
                    .map(Some)
                    .ok_or_else(|| unusable(key, value));
            }
        }
    }
    Ok(None)
}

/// Paths embedded one or two levels down: `handoff_info.campaign_path`,
/// `campaign.storagePath`, or `<anything>_context.campaign.campaignPath`.
fn nested_path(map: &serde_json::Map<String, Value>) -> Result<Option<String>> {
    if let Some(info) = map.get("handoff_info").and_then(Value::as_object) {
        if let Some(p) = string_field(info, &CAMPAIGN_PATH_FIELDS)? {
            return Ok(Some(p));
        }
    }
    if let Some(campaign) = map.get("campaign").and_then(Value::as_object) {
        if let Some(p) = string_field(campaign, &CAMPAIGN_PATH_FIELDS)? {
            return Ok(Some(p));
        }
    }
    for (key, value) in map {
        if !(key.ends_with("_context") || key.ends_with("Context")) {
            continue;
        }
        let Some(ctx) = value.as_object() else {
            continue;
        };
        if let Some(p) = string_field(ctx, &CAMPAIGN_PATH_FIELDS)? {
            return Ok(Some(p));
        }
        if let Some(campaign) = ctx.get("campaign").and_then(Value::as_object) {
            if let Some(p) = string_field(campaign, &CAMPAIGN_PATH_FIELDS)? {
                return Ok(Some(p));
            }
        }
    }
    Ok(None)
}

fn map_id(map: &serde_json::Map<String, Value>) -> Result<Option<CampaignId>> {
    for key in ID_FIELDS {
        match map.get(key) {
            None | Some(Value::Null) => continue,
            Some(value) => {
                return value
                    .as_str()
                    .and_then(|s| CampaignId::parse(s).ok())
                    .map(Some)
                    .ok_or_else(|| unusable(key, value));
            }
        }
    }
    Ok(None)
}

/// Canonical form: forward slashes, no empty or `.` segments, trailing
/// slash. Parent-directory segments are refused.
pub fn normalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim().replace('\\', "/");
    if trimmed.is_empty() {
        return None;
    }

    let absolute = trimmed.starts_with('/');
    let mut parts = Vec::new();
    for component in Path::new(&trimmed).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }

    let joined = parts.join("/");
    Some(if absolute {
        format!("/{}/", joined)
    } else {
        format!("{}/", joined)
    })
}

fn summarize_input(input: &Value) -> String {
    match input {
        Value::Object(map) => format!(
            "object with keys [{}]",
            map.keys().cloned().collect::<Vec<_>>().join(", ")
        ),
        Value::String(s) if s.trim().is_empty() => "empty string".to_string(),
        other => other.to_string(),
    }
}

/// Create every layout directory under `dir`.
pub async fn prepare_layout(dir: &Path, limit: Duration) -> Result<()> {
    for sub in LAYOUT_DIRS {
        let target = dir.join(sub);
        bounded(
            &format!("create {}", target.display()),
            limit,
            tokio::fs::create_dir_all(&target),
        )
        .await?;
    }
    debug!(dir = %dir.display(), "Prepared campaign layout");
    Ok(())
}

/// Layout directories missing under `dir`.
pub async fn missing_layout(dir: &Path) -> Vec<&'static str> {
    let mut missing = Vec::new();
    for sub in LAYOUT_DIRS {
        let is_dir = tokio::fs::metadata(dir.join(sub))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            missing.push(sub);
        }
    }
    missing
}

/// Fail with `PathResolution` if `dir` does not carry the full layout.
pub async fn verify_layout(dir: &Path) -> Result<()> {
    let missing = missing_layout(dir).await;
    if missing.is_empty() {
        Ok(())
    } else {
        Err(CadenceError::PathResolution(format!(
            "{} is missing layout directories: {}",
            dir.display(),
            missing.join(", ")
        )))
    }
}
