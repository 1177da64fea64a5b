//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use plugdom::HostCallback;
use plugdom::LeaseConfig;
use plugdom::Runtime;
use plugdom::RuntimeConfig;

/// Reads a fixture as text.
pub fn fixture(name: &str) -> String {
    let path = format!("tests/fixtures/{}", name);
    std::fs::read_to_string(&path).unwrap_or_else(|_| panic!("Could not read fixture: {}", path))
}

/// A scratch plugin directory holding a copy of every fixture.
pub fn plugin_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("Failed to create plugin dir");
    for entry in std::fs::read_dir("tests/fixtures").expect("Failed to list fixtures") {
        let entry = entry.expect("Failed to read fixture entry");
        std::fs::copy(entry.path(), dir.path().join(entry.file_name())).expect("Failed to copy fixture");
    }
    dir
}

pub fn runtime(dir: &tempfile::TempDir) -> Runtime {
    runtime_with_lease(dir, LeaseConfig::default())
}

pub fn runtime_with_lease(dir: &tempfile::TempDir, lease: LeaseConfig) -> Runtime {
    let config = RuntimeConfig::default()
        .with_plugin_dir(dir.path())
        .with_lease(lease);
    Runtime::new(config).expect("Failed to create runtime")
}

/// Lease short enough to watch it lapse in a test.
pub fn short_lease() -> LeaseConfig {
    LeaseConfig {
        initial: Duration::from_millis(300),
        sponsorship_timeout: Duration::from_millis(100),
        renew_on_call: Duration::from_millis(300),
    }
}

/// `DoSomethingNifty(arg) = arg + 100`.
pub struct AddHundred;

impl HostCallback for AddHundred {
    fn do_something_nifty(&self, arg: i32) -> i32 {
        arg + 100
    }
}

pub fn add_hundred() -> Arc<dyn HostCallback> {
    Arc::new(AddHundred)
}
