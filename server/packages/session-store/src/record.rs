use std::fs;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::StoreError;

/// Directory of JSON records, one `<key>.json` file per key.
///
/// Writes replace the whole record through a temporary sibling that is
/// renamed into place, so readers never observe a partial file. Concurrent
/// `update` calls on the same store are serialized by an in-process lock.
pub struct JsonRecordStore<T> {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for JsonRecordStore<T> {
    fn clone(&self) -> Self {
        Self {
            dir: self.dir.clone(),
            write_lock: self.write_lock.clone(),
            _record: PhantomData,
        }
    }
}

impl<T> JsonRecordStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Arc::new(Mutex::new(())),
            _record: PhantomData,
        }
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{key}.json")))
    }

    pub fn load(&self, key: &str) -> Result<Option<T>, StoreError> {
        let path = self.path_for(key)?;
        read_json(&path)
    }

    pub fn save(&self, key: &str, record: &T) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let _guard = self.lock();
        write_json_atomic(&path, record)
    }

    /// Read-modify-write of one record under the store lock.
    pub fn update<F>(&self, key: &str, apply: F) -> Result<T, StoreError>
    where
        F: FnOnce(Option<T>) -> T,
    {
        let path = self.path_for(key)?;
        let _guard = self.lock();
        let next = apply(read_json(&path)?);
        write_json_atomic(&path, &next)?;
        Ok(next)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Keys become file names, so only a conservative character set is allowed.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key != "."
        && key != ".."
        && key
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey {
            key: key.to_string(),
        })
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if content.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, record: &T) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_err)?;

    let bytes = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
    temp.write_all(&bytes).map_err(io_err)?;
    temp.as_file().sync_all().map_err(io_err)?;
    temp.persist(path).map_err(|err| io_err(err.error))?;
    tracing::trace!(path = %path.display(), bytes = bytes.len(), "record written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u32,
    }

    #[test]
    fn missing_record_loads_as_none() {
        let temp_dir = tempfile::tempdir().expect("create tempdir");
        let store: JsonRecordStore<Counter> = JsonRecordStore::new(temp_dir.path().join("c"));
        assert_eq!(store.load("absent").expect("load"), None);
    }

    #[test]
    fn update_rewrites_whole_record() {
        let temp_dir = tempfile::tempdir().expect("create tempdir");
        let store: JsonRecordStore<Counter> = JsonRecordStore::new(temp_dir.path());
        store.save("a", &Counter { value: 1 }).expect("save");
        let next = store
            .update("a", |current| Counter {
                value: current.map(|c| c.value).unwrap_or_default() + 1,
            })
            .expect("update");
        assert_eq!(next, Counter { value: 2 });
        assert_eq!(store.load("a").expect("load"), Some(Counter { value: 2 }));

        let leftovers: Vec<_> = fs::read_dir(temp_dir.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .map(|entry| entry.file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("a.json")]);
    }

    #[test]
    fn unsafe_keys_are_rejected() {
        let temp_dir = tempfile::tempdir().expect("create tempdir");
        let store: JsonRecordStore<Counter> = JsonRecordStore::new(temp_dir.path());
        for key in ["", ".", "..", "../escape", "a/b", "sp ace"] {
            assert!(
                matches!(store.load(key), Err(StoreError::InvalidKey { .. })),
                "{key:?}"
            );
        }
        assert!(validate_key("ses_01.chat-ID").is_ok());
    }

    #[test]
    fn unknown_fields_are_ignored_on_read() {
        let temp_dir = tempfile::tempdir().expect("create tempdir");
        fs::write(
            temp_dir.path().join("a.json"),
            r#"{"value": 5, "futureField": [1, 2]}"#,
        )
        .expect("write record");
        let store: JsonRecordStore<Counter> = JsonRecordStore::new(temp_dir.path());
        assert_eq!(store.load("a").expect("load"), Some(Counter { value: 5 }));
    }
}
