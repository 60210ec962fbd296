//! Client-side caches over the service directory
//!
//! Dependents of remote components do not query the directory on every
//! call. They hold one of two cache shapes: [`RemoteComponentManager`] for
//! a single instance with replace-on-failure semantics, or
//! [`RemoteMultiComponentManager`] for round-robin vending over every
//! matching provider. Both subscribe to directory watches and keep their
//! caches consistent from the callback, so a vanished provider is dropped
//! before the next call rather than after it fails.

pub mod component_manager;
pub mod multi_manager;

pub use component_manager::RemoteComponentManager;
pub use multi_manager::RemoteMultiComponentManager;
