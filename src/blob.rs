//! Where sealed blobs and unsealed payloads come from and go to.

use crate::error::{Error, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Destination of a blob.
pub trait BlobSink {
    /// Human readable location, used in error messages.
    fn location(&self) -> String;

    /// Replaces whatever the sink held with `bytes`.
    fn store(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Origin of a blob.
pub trait BlobSource {
    fn location(&self) -> String;

    fn fetch(&self) -> Result<Vec<u8>>;
}

/// A blob kept in a file readable and writable by the owner only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlob {
    path: PathBuf,
}

impl FileBlob {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_owner_only(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        // `mode` only applies to newly created files.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(bytes)?;
        file.flush()
    }
}

impl BlobSink for FileBlob {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn store(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_owner_only(bytes).map_err(|e| Error::Storage {
            context: "couldn't write to file".into(),
            path: BlobSink::location(self),
            reason: e.to_string(),
        })?;
        log::debug!("wrote {} bytes to {}", bytes.len(), self.path.display());
        Ok(())
    }
}

impl BlobSource for FileBlob {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn fetch(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).map_err(|e| Error::Storage {
            context: "couldn't read from file".into(),
            path: BlobSource::location(self),
            reason: e.to_string(),
        })
    }
}

/// In-memory blob, handy for chaining seal into load without touching disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryBlob {
    name: String,
    bytes: Option<Vec<u8>>,
}

impl MemoryBlob {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bytes: None,
        }
    }

    pub fn with_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes: Some(bytes),
        }
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }
}

impl BlobSink for MemoryBlob {
    fn location(&self) -> String {
        self.name.clone()
    }

    fn store(&mut self, bytes: &[u8]) -> Result<()> {
        self.bytes = Some(bytes.to_vec());
        Ok(())
    }
}

impl BlobSource for MemoryBlob {
    fn location(&self) -> String {
        self.name.clone()
    }

    fn fetch(&self) -> Result<Vec<u8>> {
        self.bytes.clone().ok_or_else(|| Error::Storage {
            context: "couldn't read from".into(),
            path: self.name.clone(),
            reason: "nothing stored".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn file_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut blob = FileBlob::new(dir.path().join("sealed.pub"));
        blob.store(b"public bytes")?;
        assert_eq!(blob.fetch()?, b"public bytes");
        blob.store(b"short")?;
        assert_eq!(blob.fetch()?, b"short");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn file_is_owner_only() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sealed.priv");
        fs::write(&path, b"old")?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;

        FileBlob::new(&path).store(b"new")?;
        let mode = fs::metadata(&path)?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        Ok(())
    }

    #[test]
    fn missing_file_is_storage_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("absent");
        let err = FileBlob::new(&path).fetch().unwrap_err();
        assert!(err.is_storage());
        assert!(err.to_string().starts_with("couldn't read from file"));
        Ok(())
    }

    #[test]
    fn unwritable_location_is_storage_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut blob = FileBlob::new(dir.path().join("no").join("such").join("dir"));
        let err = blob.store(b"x").unwrap_err();
        assert!(err.is_storage());
        assert!(err.to_string().starts_with("couldn't write to file"));
        Ok(())
    }

    #[test]
    fn empty_memory_blob() {
        assert!(MemoryBlob::new("mem").fetch().unwrap_err().is_storage());
    }
}
