#[cfg(loom)]
pub use loom::sync::atomic::{AtomicPtr, AtomicUsize};
#[cfg(not(loom))]
pub use std::sync::atomic::{AtomicPtr, AtomicUsize};
