//! Per-mount archive filter specs.

use std::collections::BTreeSet;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use skiff_error::{EngineError, Result};

/// Which way the archive stream flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    CopyTo,
    CopyFrom,
}

/// Rebase/strip/inclusion policy localizing an archive stream to one mount.
///
/// Serialized as base64 JSON and carried on every archive RPC; the device
/// side applies it, the personality only computes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FilterSpec {
    /// Prefix added to entry names.
    pub rebase_path: String,
    /// Prefix removed from entry names.
    pub strip_path: String,
    pub exclusions: BTreeSet<String>,
    pub inclusions: BTreeSet<String>,
    pub direction: Direction,
    /// True for the mount whose root coincides with or contains the
    /// requested path; primary entries are emitted without prefix strip.
    pub primary: bool,
}

/// Normalizes a container path: leading slash, no trailing slash, no
/// repeated separators. `""` and `"/"` both normalize to `"/"`.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let joined: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if joined.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", joined.join("/"))
    }
}

/// Joins a container path with a tar asset name.
#[must_use]
pub fn join_path(base: &str, asset: &str) -> String {
    let base = normalize_path(base);
    let asset = asset.trim_start_matches("./").trim_start_matches('/');
    if asset.is_empty() {
        base
    } else if base == "/" {
        format!("/{asset}")
    } else {
        format!("{base}/{asset}")
    }
}

/// Path of `path` relative to its ancestor `ancestor`, without a leading
/// slash. Equal paths yield `""`.
#[must_use]
pub fn relative_path(ancestor: &str, path: &str) -> String {
    let ancestor = normalize_path(ancestor);
    let path = normalize_path(path);
    if ancestor == "/" {
        return path.trim_start_matches('/').to_string();
    }
    path.strip_prefix(&ancestor)
        .map(|rest| rest.trim_start_matches('/').to_string())
        .unwrap_or(path)
}

/// True when `child` is strictly below `parent`.
#[must_use]
pub fn is_strict_child(child: &str, parent: &str) -> bool {
    let child = normalize_path(child);
    let parent = normalize_path(parent);
    if child == parent {
        return false;
    }
    if parent == "/" {
        return true;
    }
    child.starts_with(&format!("{parent}/"))
}

impl FilterSpec {
    /// Derives the spec for one mount relative to the requested container
    /// path.
    ///
    /// For the primary mount (an ancestor of, or equal to, the path) the
    /// path's location inside the mount is stripped on export and rebased
    /// on import. For a mount nested under the path it is the other way
    /// around: the mount's location inside the path is rebased on export
    /// and stripped on import.
    #[must_use]
    pub fn for_mount(container_path: &str, mount_destination: &str, direction: Direction) -> Self {
        let container_path = normalize_path(container_path);
        let mount_destination = normalize_path(mount_destination);
        let primary = !is_strict_child(&mount_destination, &container_path);

        let (inside_mount, inside_path) = if primary {
            (relative_path(&mount_destination, &container_path), String::new())
        } else {
            (String::new(), relative_path(&container_path, &mount_destination))
        };

        let (rebase_path, strip_path) = match direction {
            Direction::CopyTo => (inside_mount, inside_path),
            Direction::CopyFrom => (inside_path, inside_mount),
        };

        Self {
            rebase_path,
            strip_path,
            exclusions: BTreeSet::new(),
            inclusions: BTreeSet::new(),
            direction,
            primary,
        }
    }

    /// Excludes a region of this mount, given as a path relative to the
    /// mount root. Used so nested mounts appear exactly once in a fan-out.
    pub fn exclude(&mut self, relative: impl Into<String>) {
        self.exclusions.insert(relative.into());
    }

    /// Encodes as base64 JSON for transport.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| EngineError::internal(format!("encoding filter spec: {e}")))?;
        Ok(BASE64.encode(json))
    }

    /// Decodes a transported spec.
    pub fn decode(encoded: &str) -> Result<Self> {
        let json = BASE64
            .decode(encoded)
            .map_err(|e| EngineError::internal(format!("decoding filter spec: {e}")))?;
        serde_json::from_slice(&json)
            .map_err(|e| EngineError::internal(format!("decoding filter spec: {e}")))
    }
}
