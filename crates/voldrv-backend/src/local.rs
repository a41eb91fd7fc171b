//! Directory-backed backend
//!
//! Layout: `<root>/<namespace>/<object>`. Writes go through a temporary
//! file in the namespace directory that is synced and renamed into place, so
//! readers never see partial objects.

use crate::{BackendInterface, BackendInterfacePtr, OverwriteObject};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use voldrv_common::{Error, Namespace, Result};

/// Backend namespace stored as a local directory
#[derive(Clone, Debug)]
pub struct LocalBackend {
    root: PathBuf,
    namespace: Namespace,
}

impl LocalBackend {
    /// Handle for `namespace` below `root`; the namespace need not exist yet
    pub fn new(root: impl Into<PathBuf>, namespace: Namespace) -> Self {
        Self {
            root: root.into(),
            namespace,
        }
    }

    /// Create the namespace directory
    pub fn create_namespace(&self) -> Result<()> {
        fs::create_dir_all(self.namespace_dir())?;
        info!("Created namespace {} under {:?}", self.namespace, self.root);
        Ok(())
    }

    /// Check whether the namespace directory exists
    #[must_use]
    pub fn namespace_exists(&self) -> bool {
        self.namespace_dir().is_dir()
    }

    /// Remove the namespace and everything in it
    pub fn delete_namespace(&self) -> Result<()> {
        fs::remove_dir_all(self.namespace_dir())?;
        info!("Deleted namespace {}", self.namespace);
        Ok(())
    }

    /// Shared handle for use where a `BackendInterfacePtr` is expected
    #[must_use]
    pub fn into_ptr(self) -> BackendInterfacePtr {
        Arc::new(self)
    }

    fn namespace_dir(&self) -> PathBuf {
        self.root.join(self.namespace.as_str())
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(Error::invalid_argument(format!("invalid object name: {name:?}")));
        }
        Ok(self.namespace_dir().join(name))
    }

    fn not_found(&self, name: &str) -> Error {
        Error::ObjectNotFound {
            namespace: self.namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn map_read_err(&self, name: &str, e: io::Error) -> Error {
        if e.kind() == io::ErrorKind::NotFound {
            self.not_found(name)
        } else {
            Error::Io(e)
        }
    }

    fn store(
        &self,
        name: &str,
        overwrite: OverwriteObject,
        fill: impl FnOnce(&mut fs::File) -> io::Result<()>,
    ) -> Result<()> {
        let path = self.object_path(name)?;
        if !self.namespace_exists() {
            return Err(Error::backend(format!(
                "namespace {} does not exist",
                self.namespace
            )));
        }
        if overwrite == OverwriteObject::No && path.exists() {
            return Err(Error::backend(format!(
                "object {}/{} already exists",
                self.namespace, name
            )));
        }

        let mut temp = NamedTempFile::new_in(self.namespace_dir())?;
        fill(temp.as_file_mut())?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| Error::Io(e.error))?;
        debug!("Stored object {}/{}", self.namespace, name);
        Ok(())
    }
}

impl BackendInterface for LocalBackend {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn read(&self, dst: &Path, name: &str, _insist_latest: bool) -> Result<()> {
        let src = self.object_path(name)?;
        fs::copy(&src, dst).map_err(|e| self.map_read_err(name, e))?;
        debug!("Read object {}/{} to {:?}", self.namespace, name, dst);
        Ok(())
    }

    fn write(&self, src: &Path, name: &str, overwrite: OverwriteObject) -> Result<()> {
        let mut input = fs::File::open(src)?;
        self.store(name, overwrite, |out| io::copy(&mut input, out).map(|_| ()))
    }

    fn get_object(&self, name: &str, _insist_latest: bool) -> Result<Vec<u8>> {
        let path = self.object_path(name)?;
        fs::read(&path).map_err(|e| self.map_read_err(name, e))
    }

    fn put_object(&self, name: &str, data: &[u8], overwrite: OverwriteObject) -> Result<()> {
        self.store(name, overwrite, |out| out.write_all(data))
    }

    fn object_exists(&self, name: &str) -> Result<bool> {
        Ok(self.object_path(name)?.is_file())
    }

    fn object_size(&self, name: &str) -> Result<u64> {
        let path = self.object_path(name)?;
        let meta = fs::metadata(&path).map_err(|e| self.map_read_err(name, e))?;
        Ok(meta.len())
    }

    fn list_objects(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.namespace_dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                // in-flight temporaries from `store`
                if !name.starts_with(".tmp") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.object_path(name)?) {
            Ok(()) => {
                debug!("Removed object {}/{}", self.namespace, name);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn clone_with_new_namespace(&self, namespace: &Namespace) -> BackendInterfacePtr {
        Arc::new(Self::new(self.root.clone(), namespace.clone()))
    }
}
