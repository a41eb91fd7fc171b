//! voldrv Backend - object store abstraction
//!
//! The snapshot chain, TLogs and volume configuration are stored as named
//! objects inside a backend namespace. This crate defines the interface the
//! metadata core consumes and a directory-backed implementation used by the
//! tools and tests.

pub mod local;

pub use local::LocalBackend;

use std::path::Path;
use std::sync::Arc;
use voldrv_common::{Namespace, Result};

/// Shared handle to a backend namespace
pub type BackendInterfacePtr = Arc<dyn BackendInterface>;

/// Whether an existing object may be replaced by a write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverwriteObject {
    Yes,
    No,
}

/// Access to the objects of one backend namespace.
///
/// Retries and backoff for transient failures are the implementation's
/// responsibility; callers treat every error as final.
pub trait BackendInterface: Send + Sync {
    /// Namespace this handle operates on
    fn namespace(&self) -> &Namespace;

    /// Download `name` into the local file `dst`
    ///
    /// `insist_latest` asks eventually consistent stores to bypass caches.
    fn read(&self, dst: &Path, name: &str, insist_latest: bool) -> Result<()>;

    /// Upload the local file `src` as `name`
    fn write(&self, src: &Path, name: &str, overwrite: OverwriteObject) -> Result<()>;

    /// Fetch an object's contents into memory
    fn get_object(&self, name: &str, insist_latest: bool) -> Result<Vec<u8>>;

    /// Store an in-memory buffer as `name`
    fn put_object(&self, name: &str, data: &[u8], overwrite: OverwriteObject) -> Result<()>;

    /// Check whether `name` exists
    fn object_exists(&self, name: &str) -> Result<bool>;

    /// Size of `name` in bytes
    fn object_size(&self, name: &str) -> Result<u64>;

    /// Names of all objects in the namespace, sorted
    fn list_objects(&self) -> Result<Vec<String>>;

    /// Remove `name`; removing a missing object is not an error
    fn remove(&self, name: &str) -> Result<()>;

    /// Handle to another namespace on the same store
    fn clone_with_new_namespace(&self, namespace: &Namespace) -> BackendInterfacePtr;
}
