use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::debug;

use super::{SpecDocument, SpecStore};
use crate::core::Result;
use crate::methods::spec::MethodSpec;
use crate::registry::spec::ModelSpec;

/// Store backed by one JSON document on disk.
///
/// Every write rewrites the whole document into a temporary file in the same
/// directory and renames it over the original, so readers never observe a
/// partial file.
#[derive(Debug)]
pub struct JsonFileSpecStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileSpecStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the document; a missing file is an empty store.
    pub fn read_document(&self) -> Result<SpecDocument> {
        if !self.path.exists() {
            return Ok(SpecDocument::default());
        }
        let bytes = fs::read(&self.path)?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(SpecDocument::default());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_document(&self, document: &SpecDocument) -> Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let mut temp = NamedTempFile::new_in(&parent)?;
        serde_json::to_writer_pretty(temp.as_file_mut(), document)?;
        temp.as_file_mut().write_all(b"\n")?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|err| err.error)?;

        debug!(path = %self.path.display(), models = document.models.len(), methods = document.methods.len(), "spec store written");
        Ok(())
    }

    fn update<T>(&self, change: impl FnOnce(&mut SpecDocument) -> T) -> Result<T> {
        let _guard = self.write_lock.lock();
        let mut document = self.read_document()?;
        let outcome = change(&mut document);
        self.write_document(&document)?;
        Ok(outcome)
    }
}

impl SpecStore for JsonFileSpecStore {
    fn load_models(&self) -> Result<Vec<ModelSpec>> {
        Ok(self.read_document()?.models)
    }

    fn load_methods(&self) -> Result<Vec<MethodSpec>> {
        Ok(self.read_document()?.methods)
    }

    fn save_model(&self, spec: &ModelSpec) -> Result<()> {
        self.update(|doc| doc.upsert_model(spec))
    }

    fn remove_model(&self, name: &str) -> Result<bool> {
        self.update(|doc| doc.remove_model(name))
    }

    fn save_method(&self, spec: &MethodSpec) -> Result<()> {
        self.update(|doc| doc.upsert_method(spec))
    }

    fn remove_method(&self, model: &str, method: &str) -> Result<bool> {
        self.update(|doc| doc.remove_method(model, method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::field::{FieldKind, FieldSpec};
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileSpecStore::new(dir.path().join("specs.json"));
        assert!(store.load_models().unwrap().is_empty());
        assert!(store.load_methods().unwrap().is_empty());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("specs.json");
        {
            let store = JsonFileSpecStore::new(&path);
            store
                .save_model(
                    &ModelSpec::new("Invoice")
                        .field(FieldSpec::new("total", FieldKind::decimal(10, 2)).required()),
                )
                .unwrap();
        }

        let reopened = JsonFileSpecStore::new(&path);
        let model = reopened.model("Invoice").unwrap().unwrap();
        assert_eq!(model.fields[0].kind, FieldKind::decimal(10, 2));
        assert!(!model.fields[0].nullable);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("specs.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(JsonFileSpecStore::new(&path).load_models().is_err());
    }
}
