//! Minimal persistent key-value store backing extension state.

use crate::error::Result;
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateScope {
    Global,
    Workspace,
}

impl StateScope {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "global" => Some(Self::Global),
            "workspace" => Some(Self::Workspace),
            _ => None,
        }
    }

    const fn file_stem(self) -> &'static str {
        match self {
            Self::Global => "globalState",
            Self::Workspace => "workspaceState",
        }
    }
}

/// File name for an extension's state in `scope`.
pub fn state_file_name(extension_id: &str, scope: StateScope) -> String {
    let safe: String = extension_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(".exthost-{safe}-{}.json", scope.file_stem())
}

/// JSON object persisted to one file. Every update rewrites the file atomically.
#[derive(Debug, Clone)]
pub struct Memento {
    path: PathBuf,
    data: Map<String, Value>,
}

impl Memento {
    /// Open the store at `path`. A missing or corrupt file yields an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = fs::read_to_string(&path)
            .ok()
            .and_then(|content| match serde_json::from_str::<Value>(&content) {
                Ok(Value::Object(map)) => Some(map),
                Ok(_) | Err(_) => {
                    tracing::warn!(path = %path.display(), "Ignoring unreadable state file");
                    None
                }
            })
            .unwrap_or_default();
        Self { path, data }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Store `value` under `key`; `null` removes the key.
    pub fn update(&mut self, key: &str, value: Value) -> Result<()> {
        if value.is_null() {
            self.data.remove(key);
        } else {
            self.data.insert(key.to_string(), value);
        }
        self.persist()
    }

    pub fn keys(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let content = serde_json::to_string_pretty(&Value::Object(self.data.clone()))?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}
