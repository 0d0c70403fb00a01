//! Typed path wrappers, so a function that wants "the state root" can't accidentally be handed
//! "the cgroup root" even though both are just `Utf8PathBuf`s underneath.

use camino::{Utf8Path, Utf8PathBuf};
use std::marker::PhantomData;

pub struct Root<T> {
    path: Utf8PathBuf,
    _marker: PhantomData<T>,
}

impl<T> Root<T> {
    pub fn new(path: &Utf8Path) -> Self {
        Root {
            path: path.to_owned(),
            _marker: PhantomData,
        }
    }

    pub fn as_path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn join(&self, rest: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        self.path.join(rest)
    }

    pub fn to_owned_buf(&self) -> RootBuf<T> {
        RootBuf {
            path: self.path.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Root<T> {
    fn clone(&self) -> Self {
        Root::new(&self.path)
    }
}

#[derive(Clone)]
pub struct RootBuf<T> {
    path: Utf8PathBuf,
    _marker: PhantomData<T>,
}

impl<T> RootBuf<T> {
    pub fn new(path: Utf8PathBuf) -> Self {
        RootBuf {
            path,
            _marker: PhantomData,
        }
    }

    pub fn as_root(&self) -> Root<T> {
        Root::new(&self.path)
    }
}

impl<T> AsRef<Utf8Path> for RootBuf<T> {
    fn as_ref(&self) -> &Utf8Path {
        &self.path
    }
}

/// Marker type for `/opt/joblet`.
pub struct StateDir;
/// Marker type for `/sys/fs/cgroup/joblet.slice/joblet.service`.
pub struct CgroupRootDir;
