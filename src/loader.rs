//! Module resolution for extension code.
//!
//! The worker's CommonJS `require` goes through a [`LoaderStrategy`] instead
//! of a shared global loader. [`SandboxedLoader`] pins resolution requested by
//! extension-owned files to the extension root and substitutes the API facade
//! for the reserved import name at any depth.

use std::collections::BTreeSet;
use std::path::{Component, MAIN_SEPARATOR, Path, PathBuf};
use thiserror::Error;

/// Import name that always resolves to the host API facade.
pub const FACADE_MODULE: &str = "vscode";

const CANDIDATE_SUFFIXES: [&str; 2] = ["js", "json"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The fixed API facade object.
    Facade,
    /// A source file inside the extension root.
    File(PathBuf),
    /// A host-provided builtin module.
    Builtin(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// Resolution left the extension root. Fatal for the worker.
    #[error("Require path escapes extension dir: {specifier} -> {}", resolved.display())]
    Escape {
        specifier: String,
        resolved: PathBuf,
    },
    #[error("Module not allowed: {0}")]
    NotAllowed(String),
    #[error("Cannot find module '{0}'")]
    NotFound(String),
}

impl LoadError {
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Escape { .. })
    }
}

pub trait LoaderStrategy {
    /// Resolve `specifier` as requested by `requesting_file`.
    ///
    /// `None` means the request comes from host infrastructure rather than
    /// from an extension-owned file.
    fn resolve(
        &self,
        specifier: &str,
        requesting_file: Option<&Path>,
    ) -> Result<Resolution, LoadError>;
}

#[derive(Debug, Clone)]
pub struct SandboxedLoader {
    root: PathBuf,
    facade: String,
    builtins: BTreeSet<String>,
}

impl SandboxedLoader {
    /// `root` should already be canonical; it is canonicalized again when possible.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self {
            root,
            facade: FACADE_MODULE.to_string(),
            builtins: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_builtins<I, S>(mut self, builtins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.builtins.extend(builtins.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_facade(mut self, name: impl Into<String>) -> Self {
        self.facade = name.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn owns(&self, file: &Path) -> bool {
        is_within(&self.root, file)
    }

    fn resolve_path(&self, specifier: &str, requesting_file: &Path) -> Result<PathBuf, LoadError> {
        let joined = if Path::new(specifier).is_absolute() {
            // Absolute specifiers are rooted at the extension directory.
            self.root.join(specifier.trim_start_matches(['/', '\\']))
        } else {
            requesting_file
                .parent()
                .unwrap_or(&self.root)
                .join(specifier)
        };
        let target = normalize(&joined);
        if !is_within(&self.root, &target) {
            return Err(LoadError::Escape {
                specifier: specifier.to_string(),
                resolved: target,
            });
        }

        let found = candidates(&target)
            .into_iter()
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| LoadError::NotFound(specifier.to_string()))?;

        // Symlinks may point outside even when the lexical path does not.
        let real = found
            .canonicalize()
            .map_err(|_| LoadError::NotFound(specifier.to_string()))?;
        if !is_within(&self.root, &real) {
            return Err(LoadError::Escape {
                specifier: specifier.to_string(),
                resolved: real,
            });
        }
        Ok(real)
    }
}

impl LoaderStrategy for SandboxedLoader {
    fn resolve(
        &self,
        specifier: &str,
        requesting_file: Option<&Path>,
    ) -> Result<Resolution, LoadError> {
        if specifier == self.facade {
            return Ok(Resolution::Facade);
        }

        let Some(requesting_file) = requesting_file.filter(|file| self.owns(file)) else {
            return resolve_unrestricted(specifier, &self.builtins);
        };

        if is_path_specifier(specifier) {
            return self.resolve_path(specifier, requesting_file).map(Resolution::File);
        }
        if self.builtins.contains(specifier) {
            return Ok(Resolution::Builtin(specifier.to_string()));
        }
        Err(LoadError::NotAllowed(specifier.to_string()))
    }
}

fn resolve_unrestricted(
    specifier: &str,
    builtins: &BTreeSet<String>,
) -> Result<Resolution, LoadError> {
    if builtins.contains(specifier) {
        return Ok(Resolution::Builtin(specifier.to_string()));
    }
    let path = Path::new(specifier);
    if path.is_absolute() {
        return candidates(&normalize(path))
            .into_iter()
            .find(|candidate| candidate.is_file())
            .map(Resolution::File)
            .ok_or_else(|| LoadError::NotFound(specifier.to_string()));
    }
    Err(LoadError::NotFound(specifier.to_string()))
}

fn is_path_specifier(specifier: &str) -> bool {
    specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier == "."
        || specifier == ".."
        || Path::new(specifier).is_absolute()
}

fn candidates(target: &Path) -> Vec<PathBuf> {
    let mut out = vec![target.to_path_buf()];
    for suffix in CANDIDATE_SUFFIXES {
        let mut name = target.as_os_str().to_owned();
        name.push(".");
        name.push(suffix);
        out.push(PathBuf::from(name));
    }
    out.push(target.join("index.js"));
    out
}

/// Lexically resolve `.` and `..` without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// True if `path` is `root` itself or lies below it.
///
/// Compares strings with a trailing separator so that `/ext/foo-evil` is not
/// accepted as inside `/ext/foo`.
pub fn is_within(root: &Path, path: &Path) -> bool {
    let root = root.to_string_lossy();
    let path = path.to_string_lossy();
    if path == root {
        return true;
    }
    let mut prefix = root.into_owned();
    if !prefix.ends_with(MAIN_SEPARATOR) {
        prefix.push(MAIN_SEPARATOR);
    }
    path.starts_with(&prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, SandboxedLoader) {
        let temp = TempDir::new().expect("tempdir");
        let root = temp.path().join("ext");
        fs::create_dir_all(root.join("lib/deep")).expect("mkdir");
        fs::write(root.join("extension.js"), "").expect("write");
        fs::write(root.join("lib/util.js"), "").expect("write");
        fs::write(root.join("lib/deep/index.js"), "").expect("write");
        fs::write(root.join("data.json"), "{}").expect("write");
        let loader = SandboxedLoader::new(&root).with_builtins(["path"]);
        (temp, loader)
    }

    #[test]
    fn facade_is_substituted_at_any_depth() {
        let (_temp, loader) = fixture();
        let deep = loader.root().join("lib/deep/index.js");
        assert_eq!(loader.resolve("vscode", Some(&deep)), Ok(Resolution::Facade));
        assert_eq!(loader.resolve("vscode", None), Ok(Resolution::Facade));
    }

    #[test]
    fn relative_specifiers_resolve_from_requesting_file() {
        let (_temp, loader) = fixture();
        let entry = loader.root().join("extension.js");
        let util = loader.root().join("lib/util.js");
        assert_eq!(
            loader.resolve("./lib/util", Some(&entry)),
            Ok(Resolution::File(util.clone()))
        );
        assert_eq!(
            loader.resolve("./deep", Some(&util)),
            Ok(Resolution::File(loader.root().join("lib/deep/index.js")))
        );
        assert_eq!(
            loader.resolve("../data", Some(&util)),
            Ok(Resolution::File(loader.root().join("data.json")))
        );
    }

    #[test]
    fn absolute_specifiers_are_rooted_at_extension() {
        let (_temp, loader) = fixture();
        let entry = loader.root().join("extension.js");
        assert_eq!(
            loader.resolve("/lib/util.js", Some(&entry)),
            Ok(Resolution::File(loader.root().join("lib/util.js")))
        );
    }

    #[test]
    fn escaping_the_root_is_fatal() {
        let (_temp, loader) = fixture();
        let entry = loader.root().join("extension.js");
        let err = loader
            .resolve("../../etc/passwd", Some(&entry))
            .expect_err("escape");
        assert!(err.is_fatal());
    }

    #[test]
    fn sibling_with_shared_prefix_is_rejected() {
        let temp = TempDir::new().expect("tempdir");
        let root = temp.path().join("foo");
        let evil = temp.path().join("foo-evil");
        fs::create_dir_all(&root).expect("mkdir");
        fs::create_dir_all(&evil).expect("mkdir");
        fs::write(root.join("extension.js"), "").expect("write");
        fs::write(evil.join("x.js"), "").expect("write");
        let loader = SandboxedLoader::new(&root);
        let entry = loader.root().join("extension.js");
        let err = loader
            .resolve("../foo-evil/x.js", Some(&entry))
            .expect_err("sibling");
        assert!(matches!(err, LoadError::Escape { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_detected() {
        let (temp, loader) = fixture();
        let outside = temp.path().join("secret.js");
        fs::write(&outside, "").expect("write");
        std::os::unix::fs::symlink(&outside, loader.root().join("link.js")).expect("symlink");
        let entry = loader.root().join("extension.js");
        let err = loader.resolve("./link.js", Some(&entry)).expect_err("symlink");
        assert!(err.is_fatal());
    }

    #[test]
    fn bare_names_need_the_allow_list() {
        let (_temp, loader) = fixture();
        let entry = loader.root().join("extension.js");
        assert_eq!(
            loader.resolve("path", Some(&entry)),
            Ok(Resolution::Builtin("path".to_string()))
        );
        assert_eq!(
            loader.resolve("child_process", Some(&entry)),
            Err(LoadError::NotAllowed("child_process".to_string()))
        );
    }

    #[test]
    fn host_requests_bypass_the_restriction() {
        let (temp, loader) = fixture();
        let outside = temp.path().join("host-helper.js");
        fs::write(&outside, "").expect("write");
        let host_file = temp.path().join("bootstrap.js");
        assert_eq!(
            loader.resolve(&outside.to_string_lossy(), Some(&host_file)),
            Ok(Resolution::File(outside))
        );
    }

    #[test]
    fn missing_module_is_not_found() {
        let (_temp, loader) = fixture();
        let entry = loader.root().join("extension.js");
        assert_eq!(
            loader.resolve("./missing", Some(&entry)),
            Err(LoadError::NotFound("./missing".to_string()))
        );
    }

    #[test]
    fn is_within_uses_separator_boundary() {
        assert!(is_within(Path::new("/ext/foo"), Path::new("/ext/foo/a.js")));
        assert!(is_within(Path::new("/ext/foo"), Path::new("/ext/foo")));
        assert!(!is_within(Path::new("/ext/foo"), Path::new("/ext/foo-evil/a.js")));
        assert!(!is_within(Path::new("/ext/foo"), Path::new("/ext")));
    }

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(
            normalize(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }
}
