//! Bounded ancestor walk
//!
//! Rebuilds a file's path from its dentry by following parent links, one
//! segment per step, consulting the filter rules after each segment. The
//! walk runs at most `depth` steps. Chains deeper than that lose their
//! root-most segments; the leaf end is always kept.

use kernscope_common::{PathSegment, MAX_PATH_DEPTH, PATH_SEGMENT_LEN};

use crate::error::ReadError;
use crate::filter::{FilterRules, FilterVerdict};
use crate::layout::{DentryLayout, InodeLayout, KernelLayout};
use crate::memory::{Handle, MemoryReader, ReadExt};

/// Segments collected by a walk, leaf first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPath {
    segments: [PathSegment; MAX_PATH_DEPTH],
    depth: usize,
    truncated: bool,
    rule_matched: bool,
}

impl ResolvedPath {
    fn empty() -> Self {
        Self {
            segments: [PathSegment::zeroed(); MAX_PATH_DEPTH],
            depth: 0,
            truncated: false,
            rule_matched: false,
        }
    }

    fn push(&mut self, segment: PathSegment) {
        if self.depth < MAX_PATH_DEPTH {
            self.segments[self.depth] = segment;
            self.depth += 1;
        }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments[..self.depth]
    }

    /// The fixed-size segment array as carried in a file record
    pub fn raw_segments(&self) -> &[PathSegment; MAX_PATH_DEPTH] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The walk stopped at the depth ceiling before reaching the root
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// A RECORD rule matched and ended the walk
    pub fn rule_matched(&self) -> bool {
        self.rule_matched
    }
}

/// Outcome of a walk that did not hit a read fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolved(ResolvedPath),
    /// An IGNORE rule matched the segment at this position
    Ignored { position: usize },
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    dentry: DentryLayout,
    inode: InodeLayout,
    depth: usize,
}

impl PathResolver {
    /// `depth` is clamped to `1..=MAX_PATH_DEPTH`
    pub fn new(layout: &KernelLayout, depth: usize) -> Self {
        Self {
            dentry: layout.dentry.clone(),
            inode: layout.inode.clone(),
            depth: depth.clamp(1, MAX_PATH_DEPTH),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Walk from `leaf` toward the root.
    ///
    /// Each step reads the segment's name, inode number and parent before
    /// consulting `filters` on the inode number. A self-parented dentry is
    /// the root and ends the walk. Any read failure aborts the whole walk.
    pub fn resolve<R>(&self, reader: &R, filters: &FilterRules, leaf: Handle) -> Result<Resolution, ReadError>
    where
        R: MemoryReader + ?Sized,
    {
        let mut path = ResolvedPath::empty();
        let mut current = leaf;

        for position in 0..self.depth {
            let name: [u8; PATH_SEGMENT_LEN] = reader.read_array(current.field(self.dentry.iname))?;
            let inode = reader.read_handle(current.field(self.dentry.inode))?;
            if inode.is_null() {
                return Err(ReadError::new(current.field(self.dentry.inode), 8));
            }
            let ino = reader.read_u64(inode.field(self.inode.ino))?;
            let parent = reader.read_handle(current.field(self.dentry.parent))?;

            path.push(PathSegment { ino, name });

            match filters.check(ino) {
                FilterVerdict::Keep => {}
                FilterVerdict::Ignore => return Ok(Resolution::Ignored { position }),
                FilterVerdict::RecordAndStop => {
                    path.rule_matched = true;
                    return Ok(Resolution::Resolved(path));
                }
            }

            if parent == current {
                return Ok(Resolution::Resolved(path));
            }
            current = parent;
        }

        path.truncated = true;
        Ok(Resolution::Resolved(path))
    }
}
