//! Finding the local file behind an image descriptor.

use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::model::Image;

/// Identity of a binary independent of where it was loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BinaryDescriptor {
    pub image_name: String,
    pub file_path: String,
    pub timestamp: u32,
    pub checksum: u32,
    pub size: u64,
}

impl BinaryDescriptor {
    #[must_use]
    pub fn from_image(image: &Image) -> Self {
        Self {
            image_name: image.module_name().to_string(),
            file_path: image.file_path.clone(),
            timestamp: image.timestamp,
            checksum: image.checksum,
            size: image.size,
        }
    }
}

impl fmt::Display for BinaryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.image_name, self.file_path)
    }
}

/// Resolves a binary descriptor to a readable local file.
pub trait BinaryLocator {
    /// `None` when no local copy exists. Not finding a binary only affects
    /// that one module.
    fn locate(&self, descriptor: &BinaryDescriptor) -> Option<PathBuf>;
}

/// Looks for the recorded path first, then for the module file name in each
/// search directory, in order.
#[derive(Debug, Clone, Default)]
pub struct FileSystemLocator {
    search_paths: Vec<PathBuf>,
}

impl FileSystemLocator {
    #[must_use]
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }
}

impl BinaryLocator for FileSystemLocator {
    fn locate(&self, descriptor: &BinaryDescriptor) -> Option<PathBuf> {
        let recorded = Path::new(&descriptor.file_path);
        if recorded.is_file() {
            return Some(recorded.to_path_buf());
        }

        let found = self
            .search_paths
            .iter()
            .map(|dir| dir.join(&descriptor.image_name))
            .find(|candidate| candidate.is_file());

        if found.is_none() {
            debug!("{descriptor}: not found in {} search paths", self.search_paths.len());
        }
        found
    }
}
