//! Instruction pointer → image resolution.
//!
//! Consecutive samples usually land in the same function, so the resolver
//! first checks the image it returned last. On a miss it binary-searches the
//! process's images sorted by base address. The sorted index of a process is
//! built the first time that process is queried and kept for the resolver's
//! lifetime.
//!
//! A resolver is meant to be owned by one thread. Threads that resolve in
//! parallel each create their own, so neither cache needs locking.

use log::debug;

use crate::domain::{ContextHandle, ImageHandle, Pid};
use crate::model::RawProfileData;

#[derive(Debug, Clone, Copy)]
struct ImageRange {
    handle: ImageHandle,
    base: u64,
    end: u64,
}

impl ImageRange {
    fn contains(&self, ip: u64) -> bool {
        ip >= self.base && ip < self.end
    }
}

/// Images of one process sorted by base address.
#[derive(Debug, Clone)]
pub struct ImageIndex {
    ranges: Vec<ImageRange>,
    lowest_base_address: u64,
}

impl ImageIndex {
    #[must_use]
    pub fn build(profile: &RawProfileData, pid: Pid) -> Self {
        let mut ranges: Vec<ImageRange> = profile
            .process_images(pid)
            .map(|(handle, image)| ImageRange {
                handle,
                base: image.base_address,
                end: image.end_address(),
            })
            .collect();
        ranges.sort_unstable_by_key(|range| range.base);

        let lowest_base_address = ranges.first().map_or(u64::MAX, |range| range.base);
        debug!("{pid}: indexed {} images", ranges.len());
        Self { ranges, lowest_base_address }
    }

    /// Cheap pre-check: false for addresses below every image.
    #[must_use]
    pub fn is_valid_address(&self, ip: u64) -> bool {
        ip >= self.lowest_base_address
    }

    #[must_use]
    pub fn find(&self, ip: u64) -> Option<ImageHandle> {
        if !self.is_valid_address(ip) {
            return None;
        }

        let after = self.ranges.partition_point(|range| range.base <= ip);
        let candidate = self.ranges[..after].last()?;
        candidate.contains(ip).then_some(candidate.handle)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Per-thread IP → image resolver over a finished [`RawProfileData`].
pub struct ImageResolver<'a> {
    profile: &'a RawProfileData,
    indexes: Vec<(Pid, ImageIndex)>,
    last_hit: Option<(Pid, ImageRange)>,
}

impl<'a> ImageResolver<'a> {
    #[must_use]
    pub fn new(profile: &'a RawProfileData) -> Self {
        Self { profile, indexes: Vec::new(), last_hit: None }
    }

    /// Image containing `ip` in the process of `context`.
    pub fn find_image_for_ip(&mut self, ip: u64, context: ContextHandle) -> Option<ImageHandle> {
        let pid = self.profile.find_context(context).pid;
        self.find_image_in_process(ip, pid)
    }

    pub fn find_image_in_process(&mut self, ip: u64, pid: Pid) -> Option<ImageHandle> {
        // === LAST HIT ===
        if let Some((last_pid, range)) = self.last_hit {
            if last_pid == pid && range.contains(ip) {
                return Some(range.handle);
            }
        }

        // === PROCESS INDEX ===
        let index = self.index_for(pid);
        let handle = index.find(ip)?;

        let image = self.profile.find_image(handle);
        self.last_hit = Some((
            pid,
            ImageRange { handle, base: image.base_address, end: image.end_address() },
        ));
        Some(handle)
    }

    fn index_for(&mut self, pid: Pid) -> &ImageIndex {
        // Few processes per trace, a linear scan beats hashing here.
        let position = match self.indexes.iter().position(|(indexed, _)| *indexed == pid) {
            Some(position) => position,
            None => {
                self.indexes.push((pid, ImageIndex::build(self.profile, pid)));
                self.indexes.len() - 1
            }
        };
        &self.indexes[position].1
    }
}
