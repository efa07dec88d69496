//! Exercises the process-wide singleton path. Kept in its own file and
//! `#[serial]` because `Runtime::init`'s `OnceLock` can only be won once per
//! process — every other integration test uses `Runtime::new` instead so it
//! gets an isolated instance, but this one has to be the sole caller of
//! `init` in this binary.

use std::sync::Arc;

use serial_test::serial;

use stw_core::config::RuntimeConfig;
use stw_core::platform::fake::FakePlatform;
use stw_core::runtime::{current, Runtime};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
#[serial]
fn init_installs_the_process_wide_singleton() {
    init_tracing();

    let platform = FakePlatform::new();
    let installed = Runtime::init(platform, RuntimeConfig::default());

    assert!(Arc::ptr_eq(&installed, &current()));
}
