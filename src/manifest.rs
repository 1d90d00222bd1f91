//! Extension manifests and discovery.

use crate::error::{Error, Result};
use crate::loader::is_within;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "package.json";
pub const DEFAULT_ENTRY: &str = "extension.js";
/// Activation trigger matching every event.
pub const ACTIVATE_ALWAYS: &str = "*";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    main: Option<String>,
    #[serde(default)]
    activation_events: Option<Vec<String>>,
    #[serde(default)]
    contributes: Option<Value>,
}

/// Immutable description of one discovered extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionDescriptor {
    pub id: String,
    /// Canonical absolute root directory.
    pub root: PathBuf,
    /// Canonical absolute entry module, always inside `root`.
    pub entry: PathBuf,
    /// Ordered, de-duplicated activation triggers.
    pub triggers: Vec<String>,
    pub contributes: Value,
}

impl ExtensionDescriptor {
    pub fn activates_on(&self, event: &str) -> bool {
        self.triggers
            .iter()
            .any(|t| t == ACTIVATE_ALWAYS || t == event)
    }

    pub fn activates_eagerly(&self) -> bool {
        self.triggers.iter().any(|t| t == ACTIVATE_ALWAYS)
    }
}

/// Load the manifest inside `dir`.
///
/// `Ok(None)` means the directory has no manifest and is not an extension.
pub fn load_descriptor(dir: &Path) -> Result<Option<ExtensionDescriptor>> {
    let manifest_path = dir.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Ok(None);
    }

    let content = fs::read_to_string(&manifest_path)?;
    let raw: RawManifest = serde_json::from_str(&content).map_err(|err| {
        Error::manifest(format!("Failed to parse {}: {err}", manifest_path.display()))
    })?;

    let root = dir.canonicalize()?;
    let id = raw
        .name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .or_else(|| {
            root.file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .ok_or_else(|| Error::manifest(format!("No id for {}", root.display())))?;

    let main = raw
        .main
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ENTRY.to_string());
    let entry = resolve_entry(&root, &main)
        .ok_or_else(|| Error::manifest(format!("{id}: entry module '{main}' not found")))?;
    if !is_within(&root, &entry) {
        return Err(Error::manifest(format!(
            "{id}: entry module '{main}' escapes the extension root"
        )));
    }

    let mut seen = BTreeSet::new();
    let triggers = raw
        .activation_events
        .unwrap_or_else(|| vec![ACTIVATE_ALWAYS.to_string()])
        .into_iter()
        .filter(|t| !t.trim().is_empty() && seen.insert(t.clone()))
        .collect();

    Ok(Some(ExtensionDescriptor {
        id,
        root,
        entry,
        triggers,
        contributes: raw
            .contributes
            .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
    }))
}

fn resolve_entry(root: &Path, main: &str) -> Option<PathBuf> {
    let base = root.join(main);
    [base.clone(), base.with_extension("js"), base.join("index.js")]
        .into_iter()
        .find(|candidate| candidate.is_file())
        .and_then(|candidate| candidate.canonicalize().ok())
}

/// Scan `extensions_dir` for extension directories, sorted by directory name.
///
/// Directories without a manifest are silently ignored. Broken manifests and
/// duplicate ids are logged and skipped.
pub fn discover(extensions_dir: &Path) -> Result<Vec<ExtensionDescriptor>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(extensions_dir)
        .map_err(|err| {
            Error::config(format!(
                "Cannot read extensions directory {}: {err}",
                extensions_dir.display()
            ))
        })?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    let mut ids = BTreeSet::new();
    let mut descriptors = Vec::new();
    for dir in dirs {
        match load_descriptor(&dir) {
            Ok(Some(descriptor)) => {
                if ids.insert(descriptor.id.clone()) {
                    tracing::debug!(extension_id = %descriptor.id, root = %descriptor.root.display(), "Discovered extension");
                    descriptors.push(descriptor);
                } else {
                    tracing::warn!(extension_id = %descriptor.id, dir = %dir.display(), "Duplicate extension id, skipping");
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(dir = %dir.display(), error = %err, "Skipping extension");
            }
        }
    }
    Ok(descriptors)
}
