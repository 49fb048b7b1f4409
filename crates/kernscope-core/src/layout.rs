//! Kernel structure layout
//!
//! Handlers locate fields as `handle + offset`. Offsets vary between kernel
//! builds, so they are configuration rather than constants. The defaults
//! match a common x86_64 build and are meant to be replaced with values
//! taken from the target kernel's type information.

use serde::{Deserialize, Serialize};

/// File type mask of `i_mode`
pub const S_IFMT: u16 = 0o170000;
/// Regular file type of `i_mode`
pub const S_IFREG: u16 = 0o100000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelLayout {
    pub sock: SockLayout,
    pub file: FileLayout,
    pub inode: InodeLayout,
    pub dentry: DentryLayout,
    pub skb: SkbLayout,
}

/// `struct sock` (through its embedded `sock_common`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SockLayout {
    /// `skc_daddr`, 4 bytes network order
    pub daddr: u64,
    /// `skc_rcv_saddr`, 4 bytes network order
    pub saddr: u64,
    /// `skc_dport`, network order
    pub dport: u64,
    /// `skc_num`, host order
    pub sport: u64,
    /// `skc_family`
    pub family: u64,
    /// `skc_v6_daddr`, 16 bytes
    pub v6_daddr: u64,
    /// `skc_v6_rcv_saddr`, 16 bytes
    pub v6_saddr: u64,
}

impl Default for SockLayout {
    fn default() -> Self {
        Self {
            daddr: 0,
            saddr: 4,
            dport: 12,
            sport: 14,
            family: 16,
            v6_daddr: 56,
            v6_saddr: 72,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLayout {
    /// `f_path.dentry`
    pub dentry: u64,
    /// `f_inode`
    pub inode: u64,
}

impl Default for FileLayout {
    fn default() -> Self {
        Self {
            dentry: 24,
            inode: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InodeLayout {
    /// `i_mode`, 2 bytes
    pub mode: u64,
    /// `i_ino`, 8 bytes
    pub ino: u64,
}

impl Default for InodeLayout {
    fn default() -> Self {
        Self { mode: 0, ino: 64 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DentryLayout {
    /// `d_parent`
    pub parent: u64,
    /// `d_inode`
    pub inode: u64,
    /// `d_iname`, the inline short name
    pub iname: u64,
}

impl Default for DentryLayout {
    fn default() -> Self {
        Self {
            parent: 24,
            inode: 48,
            iname: 56,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkbLayout {
    /// `sk`
    pub sk: u64,
    /// `len`, 4 bytes
    pub len: u64,
}

impl Default for SkbLayout {
    fn default() -> Self {
        Self { sk: 24, len: 112 }
    }
}

/// True if `mode` describes a regular file
pub fn is_regular(mode: u16) -> bool {
    mode & S_IFMT == S_IFREG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_regular() {
        assert!(is_regular(0o100644));
        assert!(!is_regular(0o040755));
        assert!(!is_regular(0o020666));
    }

    #[test]
    fn test_partial_layout_override() {
        let layout: KernelLayout = toml::from_str(
            r#"
            [dentry]
            iname = 64
            "#,
        )
        .unwrap();
        assert_eq!(layout.dentry.iname, 64);
        assert_eq!(layout.dentry.parent, 24);
        assert_eq!(layout.sock, SockLayout::default());
    }
}
