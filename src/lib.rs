//! Message-passing slab memory allocator with per-thread shards.
//!
//! Each thread owns one [Allocator]. Small objects live in size-class
//! segregated slabs inside 16 MiB superslabs, medium objects in page-celled
//! mediumslabs, and large objects are power-of-two blocks; a process-global
//! pagemap classifies every superslab-aligned region so any pointer can be
//! routed. Freeing memory owned by another thread never takes a lock:
//! the dead object itself is stamped with a routing header and posted to
//! the owner's mailbox, a single-consumer multi-producer intrusive queue in
//! the family of the [snmalloc](https://github.com/microsoft/snmalloc) and
//! [Mimalloc](https://www.microsoft.com/en-us/research/uploads/prod/2019/06/mimalloc-tr-v1.pdf)
//! designs.
//!
//! The crate is the allocator core: the `malloc`/`free` shim and the pool
//! that hands one allocator to each thread sit above it.

pub mod allocator;
pub mod config;
pub mod largealloc;
pub mod list;
pub mod loom_testing;
pub mod mediumslab;
pub mod pagemap;
pub mod provider;
pub mod remote;
pub mod sizeclass;
pub mod superslab;
pub mod util;

pub use allocator::{alloc_size, external_pointer, Allocator, Boundary};
pub use config::{AllowReserve, DecommitStrategy, ZeroMem};
pub use provider::{MemoryProvider, VirtualProvider};
pub use remote::{AllocId, RemoteAllocator};
