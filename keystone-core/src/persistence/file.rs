//! File-backed key.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Codec, PersistenceId, PersistenceKey, PersistenceReaderKey};
use crate::error::StorageError;

/// A value stored in its own file.
///
/// The file is read once when a reference is created and rewritten on every
/// save. Changes made to the file by other processes are not watched.
pub struct FileStorageKey<V> {
    path: PathBuf,
    codec: Codec,
    _value: PhantomData<fn() -> V>,
}

impl<V> FileStorageKey<V> {
    /// Store the value at `path` as JSON.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            codec: Codec::default(),
            _value: PhantomData,
        }
    }

    /// Use a different codec.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<V: DeserializeOwned> FileStorageKey<V> {
    fn read(&self) -> Result<Option<V>, StorageError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        Ok(Some(self.codec.decode(&bytes)?))
    }
}

impl<V: Serialize> FileStorageKey<V> {
    fn write(&self, value: &V) -> Result<(), StorageError> {
        let bytes = self.codec.encode(value)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, bytes)?;
        Ok(())
    }
}

impl<V> Clone for FileStorageKey<V> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            codec: self.codec,
            _value: PhantomData,
        }
    }
}

impl<V> fmt::Debug for FileStorageKey<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStorageKey")
            .field("path", &self.path)
            .field("codec", &self.codec)
            .finish()
    }
}

impl<V> PersistenceReaderKey<V> for FileStorageKey<V>
where
    V: Serialize + DeserializeOwned + 'static,
{
    fn id(&self) -> PersistenceId {
        PersistenceId::new("file", self.path.to_string_lossy().into_owned())
    }

    fn load(&self, _initial: Option<&V>) -> Option<V> {
        match self.read() {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(path = %self.path.display(), %error, "failed to load file storage");
                None
            }
        }
    }
}

impl<V> PersistenceKey<V> for FileStorageKey<V>
where
    V: Serialize + DeserializeOwned + 'static,
{
    fn save(&self, value: &V) {
        if let Err(error) = self.write(value) {
            tracing::warn!(path = %self.path.display(), %error, "failed to save file storage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let key = FileStorageKey::<u32>::new(dir.path().join("absent.json"));
        assert_eq!(key.load(Some(&5)), None);
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let key = FileStorageKey::<Vec<String>>::new(dir.path().join("nested/deeper/list.json"));

        key.save(&vec!["a".to_owned(), "b".to_owned()]);

        assert!(key.path().exists());
        assert_eq!(key.load(None), Some(vec!["a".to_owned(), "b".to_owned()]));
    }

    #[test]
    fn corrupt_file_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.msgpack");
        fs::write(&path, [0xc1]).unwrap();

        let key = FileStorageKey::<u32>::new(&path).with_codec(Codec::MessagePack);
        assert_eq!(key.load(None), None);
    }
}
