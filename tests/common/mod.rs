//! Common test infrastructure for `exthost`.
//!
//! - A shared asupersync runtime for async tests
//! - Extension fixtures written into temp directories
//! - Host construction that runs this crate's binary as the worker

use exthost::host::{Host, HostOptions};
use exthost::permissions::PermissionPolicy;
use serde_json::{Value, json};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tempfile::TempDir;

/// Runs an async future to completion on an asupersync runtime.
#[allow(dead_code)]
pub fn run_async<T, Fut>(future: Fut) -> T
where
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    // Reuse a single runtime across tests.
    static RT: OnceLock<asupersync::runtime::Runtime> = OnceLock::new();
    let runtime = RT.get_or_init(|| {
        asupersync::runtime::RuntimeBuilder::new()
            .enable_parking(false)
            .worker_threads(1)
            .blocking_threads(1, 8)
            .build()
            .expect("build asupersync runtime")
    });

    let join = runtime.handle().spawn(future);
    futures::executor::block_on(join)
}

/// A temp directory holding one subdirectory per extension.
#[allow(dead_code)]
pub struct ExtensionFixtures {
    pub temp: TempDir,
}

#[allow(dead_code)]
impl ExtensionFixtures {
    pub fn new() -> Self {
        Self {
            temp: TempDir::new().expect("tempdir"),
        }
    }

    pub fn dir(&self) -> &Path {
        self.temp.path()
    }

    /// Write `package.json` plus `extension.js` for `id`.
    pub fn add(&self, id: &str, activation_events: &[&str], source: &str) -> PathBuf {
        self.add_with_manifest(
            id,
            &json!({
                "name": id,
                "main": "extension.js",
                "activationEvents": activation_events,
            }),
            source,
        )
    }

    pub fn add_with_manifest(&self, dir_name: &str, manifest: &Value, source: &str) -> PathBuf {
        let root = self.temp.path().join(dir_name);
        fs::create_dir_all(&root).expect("create extension dir");
        fs::write(
            root.join("package.json"),
            serde_json::to_string_pretty(manifest).expect("manifest json"),
        )
        .expect("write package.json");
        fs::write(root.join("extension.js"), source).expect("write extension.js");
        root
    }

    pub fn write_file(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.temp.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, content).expect("write file");
        path
    }
}

/// Host options that spawn the `exthost` binary under test as the worker,
/// with short timeouts.
#[allow(dead_code)]
pub fn host_options(extensions_dir: &Path) -> HostOptions {
    let mut options = HostOptions::new(extensions_dir);
    options.worker_program = PathBuf::from(env!("CARGO_BIN_EXE_exthost"));
    options.worker_args = vec!["worker".to_string()];
    options.command_timeout = Duration::from_secs(10);
    options.activation_timeout = Duration::from_secs(10);
    options.deactivate_grace = Duration::from_secs(3);
    options
}

#[allow(dead_code)]
pub fn started_host(fixtures: &ExtensionFixtures, policy: Option<PermissionPolicy>) -> Host {
    let host = Host::new(host_options(fixtures.dir()), policy);
    host.start().expect("start host");
    host
}
