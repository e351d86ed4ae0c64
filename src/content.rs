//! Local copy of the synced content files.
//!
//! Files live directly in the content directory. `manifest.json` next to them records the version
//! of every file, so that only files whose version changed are downloaded again.
use std::{
    collections::BTreeMap,
    fs,
    path::{Component, Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::remote_client::{ChangeDescriptor, RemoteClient};
use crate::{Error, Result};

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    files: BTreeMap<String, String>,
}

/// Directory of downloaded content files.
pub struct ContentCache {
    dir: PathBuf,
    /// `None` until the manifest is first read from disk.
    manifest: Mutex<Option<Manifest>>,
}

impl ContentCache {
    /// Create a cache rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> ContentCache {
        ContentCache {
            dir: dir.into(),
            manifest: Mutex::new(None),
        }
    }

    /// Root directory of the cache.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path where `file_name` is stored.
    pub fn path(&self, file_name: &str) -> Result<PathBuf> {
        validate_file_name(file_name)?;
        Ok(self.dir.join(file_name))
    }

    /// Contents of `file_name`, if it has been downloaded.
    pub fn read(&self, file_name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(file_name)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Version of `file_name` currently stored, if any.
    pub fn version(&self, file_name: &str) -> Option<String> {
        let mut manifest = self.manifest.lock().unwrap_or_else(PoisonError::into_inner);
        self.loaded(&mut manifest).files.get(file_name).cloned()
    }

    /// Download every file in `change` whose version differs from the stored one. Returns the
    /// names of updated files.
    ///
    /// Files are written before the manifest, so an interrupted update is retried on the next
    /// change notification.
    pub fn apply(
        &self,
        change: &ChangeDescriptor,
        remote: &dyn RemoteClient,
    ) -> Result<Vec<String>> {
        let mut manifest = self.manifest.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = self.loaded(&mut manifest).clone();

        let mut updated = Vec::new();
        for (file_name, version) in &change.files {
            if next.files.get(file_name) == Some(version) {
                continue;
            }
            let path = self.path(file_name)?;
            let bytes = remote.download_file(file_name, version)?;
            write_atomically(&path, &bytes)?;
            log::debug!(target: "clutch", file_name, version; "updated content file");

            next.files.insert(file_name.clone(), version.clone());
            updated.push(file_name.clone());
        }

        if !updated.is_empty() {
            write_atomically(&self.dir.join(MANIFEST_FILE), &serde_json::to_vec(&next)?)?;
            *manifest = Some(next);
        }
        Ok(updated)
    }

    fn loaded<'a>(&self, manifest: &'a mut Option<Manifest>) -> &'a Manifest {
        manifest.get_or_insert_with(|| {
            let path = self.dir.join(MANIFEST_FILE);
            match fs::read(&path) {
                Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                    log::warn!(target: "clutch", "ignoring corrupt content manifest: {:?}", err);
                    Manifest::default()
                }),
                Err(_) => Manifest::default(),
            }
        })
    }
}

/// File names must stay inside the content directory.
fn validate_file_name(file_name: &str) -> Result<()> {
    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(Error::InvalidFileName(file_name.to_owned())),
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
