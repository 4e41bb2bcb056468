//! Process, thread, image and context records.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::path::Path;

use crate::domain::{CpuId, ImageHandle, Pid, ThreadHandle, Tid};

/// The unit samples and stacks are scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Context {
    pub pid: Pid,
    pub tid: Tid,
    pub cpu: CpuId,
}

impl Context {
    #[must_use]
    pub fn new(pid: Pid, tid: Tid, cpu: CpuId) -> Self {
        Self { pid, tid, cpu }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Thread {
    pub pid: Pid,
    pub tid: Tid,
    pub name: String,
}

/// A process seen in the trace, with the images and threads attributed to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub pid: Pid,
    pub parent_pid: Pid,
    pub name: String,
    pub image_file_name: String,
    pub command_line: String,
    images: Vec<ImageHandle>,
    threads: Vec<ThreadHandle>,
}

impl Process {
    #[must_use]
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            parent_pid: Pid(0),
            name: String::new(),
            image_file_name: String::new(),
            command_line: String::new(),
            images: Vec::new(),
            threads: Vec::new(),
        }
    }

    /// Record `image` as loaded in this process (once).
    pub fn add_image(&mut self, image: ImageHandle) {
        if !self.images.contains(&image) {
            self.images.push(image);
        }
    }

    /// Record `thread` as belonging to this process (once).
    pub fn add_thread(&mut self, thread: ThreadHandle) {
        if !self.threads.contains(&thread) {
            self.threads.push(thread);
        }
    }

    #[must_use]
    pub fn images(&self) -> &[ImageHandle] {
        &self.images
    }

    #[must_use]
    pub fn threads(&self) -> &[ThreadHandle] {
        &self.threads
    }
}

/// A binary mapped into a process at `[base_address, base_address + size)`.
///
/// Two images are the same entity when they describe the same binary
/// (path, size, checksum) at the same load address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub base_address: u64,
    pub size: u64,
    pub default_base_address: u64,
    pub file_path: String,
    pub original_file_name: Option<String>,
    pub timestamp: u32,
    pub checksum: u32,
}

impl Image {
    /// First address past the end of the image.
    #[must_use]
    pub fn end_address(&self) -> u64 {
        self.base_address.saturating_add(self.size)
    }

    #[must_use]
    pub fn has_address(&self, ip: u64) -> bool {
        ip >= self.base_address && ip < self.end_address()
    }

    /// File name of the binary, preferring the name recorded in its
    /// version resource over the on-disk path.
    #[must_use]
    pub fn module_name(&self) -> &str {
        let path = self.original_file_name.as_deref().unwrap_or(&self.file_path);
        Path::new(path).file_name().and_then(|name| name.to_str()).unwrap_or(path)
    }
}

impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        self.base_address == other.base_address
            && self.size == other.size
            && self.checksum == other.checksum
            && self.file_path == other.file_path
    }
}

impl Eq for Image {}

impl Hash for Image {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.base_address.hash(state);
        self.size.hash(state);
        self.checksum.hash(state);
        self.file_path.hash(state);
    }
}
