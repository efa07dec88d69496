//! Thread coordination and stop-the-world core for a moving-GC managed
//! runtime.
//!
//! A single process-wide [`runtime::Runtime`] owns a [`registry::Registry`]
//! of live thread records, a [`safepoint::SafepointPageManager`], a
//! [`coordinator::StwDispatcher`], and the post-mortem/resurrection queues.
//! Everything platform-specific (threads, signals, mapped pages, mutexes)
//! goes through [`platform::PlatformAdapter`], so the protocol itself is
//! exercised in tests against [`platform::fake::FakePlatform`] without a
//! real signal handler.

pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod error;
pub mod foreign_call;
pub mod interrupt;
pub mod platform;
pub mod postmortem;
pub mod registry;
pub mod runtime;
pub mod safepoint;
pub mod thread_record;

pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use runtime::Runtime;
pub use thread_record::ThreadHandle;
