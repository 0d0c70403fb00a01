//! A thin wrapper over `std::fs` operations used by the isolator and log persister, so that
//! higher layers call through one seam instead of reaching for `std::fs` directly.

use anyhow::{Context, Result};
use camino::Utf8Path;
use std::fs::File;

#[derive(Clone, Copy, Default)]
pub struct Fs;

impl Fs {
    pub fn new() -> Self {
        Fs
    }

    pub fn create_dir_all(&self, path: impl AsRef<Utf8Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).with_context(|| format!("creating directory {path}"))
    }

    pub fn remove_dir_all(&self, path: impl AsRef<Utf8Path>) -> Result<()> {
        let path = path.as_ref();
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing directory {path}")),
        }
    }

    pub fn open_file(&self, path: impl AsRef<Utf8Path>) -> Result<File> {
        let path = path.as_ref();
        File::open(path).with_context(|| format!("opening file {path}"))
    }

    pub fn create_file(&self, path: impl AsRef<Utf8Path>) -> Result<File> {
        let path = path.as_ref();
        File::create(path).with_context(|| format!("creating file {path}"))
    }

    pub fn write(&self, path: impl AsRef<Utf8Path>, contents: impl AsRef<[u8]>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, contents).with_context(|| format!("writing file {path}"))
    }

    pub fn read_to_string(&self, path: impl AsRef<Utf8Path>) -> Result<String> {
        let path = path.as_ref();
        std::fs::read_to_string(path).with_context(|| format!("reading file {path}"))
    }

    pub fn exists(&self, path: impl AsRef<Utf8Path>) -> bool {
        path.as_ref().exists()
    }

    pub fn remove_file(&self, path: impl AsRef<Utf8Path>) -> Result<()> {
        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing file {path}")),
        }
    }
}
