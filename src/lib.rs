//! vmcow - Copy-on-write virtual memory page core
//!
//! This crate provides the page-management core of a virtual memory
//! system: memory objects that can be snapshot-cloned, sliced and backed
//! by an external pager, with copy-on-write resolved lazily on fault.
//! Cloning builds a tree of objects; pages shared by both sides of a clone
//! live in hidden interior nodes and are copied, or simply moved, when one
//! side writes. When a side goes away its hidden parent is merged into the
//! survivor so trees do not grow without bound.
//!
//! Physical memory, page queues and time are collaborators supplied through
//! a [`mach_vm::VmContext`]; [`mach_vm::PageManager`] is a complete
//! in-memory implementation of the first two.

#![no_std]
// Kernel-appropriate clippy configuration
#![allow(clippy::new_without_default)]
// Large error payloads (pager requests) are intentional
#![allow(clippy::result_large_err)]

// Standard library replacement for no_std
extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod config;
pub mod console;
pub mod error;
pub mod kern;

// Mach VM subsystem
pub mod mach_vm;

pub use config::VmConfig;
pub use error::{ErrorKind, VmError, VmResult};
pub use mach_vm::{
    CloneMode, FaultFlags, PageContent, PageProvider, PageRequest, PageSpliceList, SplicedPage,
    VmContext, VmObject, VmObjectId,
};
