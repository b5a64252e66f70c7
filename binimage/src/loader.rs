// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::path::FilePath;
use crate::LoadError;

/// Caching reader of module and debug info files.
///
/// File data is interior-mutably owned so that parsed images can borrow it
/// for the lifetime of the loader.
#[derive(Default)]
pub struct Loader {
    loaded: elsa::sync::FrozenMap<FilePath, Box<[u8]>>,
}

impl Loader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, path: &FilePath) -> Result<&[u8], LoadError> {
        // Note: if we ever have this callable in parallel from
        //       multiple threads, we should use some kind of
        //       lock to prevent loading the same file multiple times.

        if let Some(data) = self.loaded.get(path) {
            return Ok(data);
        }

        let data: Box<[u8]> = std::fs::read(path)
            .map_err(|source| LoadError::Io {
                path: path.clone(),
                source,
            })?
            .into();

        Ok(self.loaded.insert(path.clone(), data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use anyhow::Result;

    #[test]
    fn test_load_is_cached() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("module.bin");
        std::fs::write(&file, b"data")?;

        let path = FilePath::new(file.to_string_lossy())?;

        let loader = Loader::new();
        let first = loader.load(&path)?;
        let second = loader.load(&path)?;

        assert_eq!(first, b"data");
        assert!(std::ptr::eq(first, second));

        Ok(())
    }

    #[test]
    fn test_load_missing_file() -> Result<()> {
        let loader = Loader::new();
        let path = FilePath::new("/nonexistent/module.bin")?;

        let err = loader.load(&path).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));

        Ok(())
    }
}
