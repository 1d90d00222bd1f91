//! Sandboxed module resolution against real directory trees.

use exthost::loader::{FACADE_MODULE, LoadError, LoaderStrategy, Resolution, SandboxedLoader};
use pretty_assertions::assert_eq;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Tree {
    _temp: TempDir,
    root: PathBuf,
    outside: PathBuf,
}

fn tree() -> Tree {
    let temp = TempDir::new().expect("tempdir");
    let base = temp.path().canonicalize().expect("canonical tempdir");
    let root = base.join("ext");
    let outside = base.join("secret");
    fs::create_dir_all(root.join("lib/deep")).expect("mkdir");
    fs::create_dir_all(root.join("pkg")).expect("mkdir");
    fs::create_dir_all(&outside).expect("mkdir");
    fs::write(root.join("extension.js"), "").expect("write");
    fs::write(root.join("lib/util.js"), "").expect("write");
    fs::write(root.join("lib/deep/inner.js"), "").expect("write");
    fs::write(root.join("pkg/index.js"), "").expect("write");
    fs::write(root.join("data.json"), "{}").expect("write");
    fs::write(outside.join("leak.js"), "").expect("write");
    Tree {
        _temp: temp,
        root,
        outside,
    }
}

fn loader(root: &Path) -> SandboxedLoader {
    SandboxedLoader::new(root).with_builtins(["path"])
}

#[test]
fn relative_requires_resolve_with_extension_candidates() {
    let t = tree();
    let loader = loader(&t.root);
    let main = t.root.join("extension.js");
    assert_eq!(
        loader.resolve("./lib/util", Some(&main)),
        Ok(Resolution::File(t.root.join("lib/util.js")))
    );
    assert_eq!(
        loader.resolve("./data", Some(&main)),
        Ok(Resolution::File(t.root.join("data.json")))
    );
    assert_eq!(
        loader.resolve("./pkg", Some(&main)),
        Ok(Resolution::File(t.root.join("pkg/index.js")))
    );
}

#[test]
fn nested_files_resolve_relative_to_themselves() {
    let t = tree();
    let loader = loader(&t.root);
    let inner = t.root.join("lib/deep/inner.js");
    assert_eq!(
        loader.resolve("../util", Some(&inner)),
        Ok(Resolution::File(t.root.join("lib/util.js")))
    );
    assert_eq!(
        loader.resolve("/lib/util.js", Some(&inner)),
        Ok(Resolution::File(t.root.join("lib/util.js")))
    );
}

#[test]
fn parent_traversal_out_of_root_is_fatal() {
    let t = tree();
    let loader = loader(&t.root);
    let err = loader
        .resolve("../secret/leak", Some(&t.root.join("extension.js")))
        .expect_err("escape");
    assert!(matches!(err, LoadError::Escape { .. }));
    assert!(err.is_fatal());
}

#[cfg(unix)]
#[test]
fn symlink_pointing_outside_is_an_escape() {
    let t = tree();
    std::os::unix::fs::symlink(t.outside.join("leak.js"), t.root.join("link.js")).expect("symlink");
    let err = loader(&t.root)
        .resolve("./link", Some(&t.root.join("extension.js")))
        .expect_err("escape");
    assert!(matches!(err, LoadError::Escape { .. }));
}

#[test]
fn facade_resolves_at_any_depth() {
    let t = tree();
    let loader = loader(&t.root);
    for file in ["extension.js", "lib/util.js", "lib/deep/inner.js"] {
        assert_eq!(
            loader.resolve(FACADE_MODULE, Some(&t.root.join(file))),
            Ok(Resolution::Facade)
        );
    }
}

#[test]
fn bare_specifiers_are_builtins_or_refused() {
    let t = tree();
    let loader = loader(&t.root);
    let main = t.root.join("extension.js");
    assert_eq!(
        loader.resolve("path", Some(&main)),
        Ok(Resolution::Builtin("path".to_string()))
    );
    assert_eq!(
        loader.resolve("fs", Some(&main)),
        Err(LoadError::NotAllowed("fs".to_string()))
    );
    assert_eq!(
        loader.resolve("./missing", Some(&main)),
        Err(LoadError::NotFound("./missing".to_string()))
    );
}

#[test]
fn host_requests_are_not_sandboxed() {
    let t = tree();
    let loader = loader(&t.root);
    let leak = t.outside.join("leak.js");
    let specifier = leak.to_string_lossy().into_owned();
    assert_eq!(loader.resolve(&specifier, None), Ok(Resolution::File(leak)));
}
