//! Browser engines and pooled concurrency backends.
//!
//! An [`Engine`] launches browsers; a [`ConcurrencyBackend`] decides how the
//! launched browsers are shared between workers and jobs. The real CDP engine
//! requires the `browser` feature flag and Chrome/Chromium installed; the
//! [`MemoryEngine`] is always available.

pub mod concurrency;
pub mod engine;
pub mod memory;

#[cfg(feature = "browser")]
pub mod chromium;

pub use concurrency::{
    BrowserBackend, ConcurrencyBackend, ContextBackend, JobInstance, PageBackend,
    WorkerResource, backend_for,
};
pub use engine::{Browser, BrowserContext, Engine, Page};
pub use memory::MemoryEngine;

#[cfg(feature = "browser")]
pub use chromium::ChromiumEngine;
