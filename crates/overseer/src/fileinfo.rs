use std::{
    fs::Metadata,
    io,
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFIFO: u32 = 0o010000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFSOCK: u32 = 0o140000;

/// Directory-entry type, mirroring the kernel's d_type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Unknown,
    Fifo,
    Char,
    Dir,
    Block,
    Regular,
    Symlink,
    Socket,
}

impl DType {
    /// Single-letter code used by the `type` field renderer.
    pub fn code(self) -> char {
        match self {
            DType::Regular => 'f',
            DType::Dir => 'd',
            DType::Symlink => 'l',
            DType::Block => 'b',
            DType::Char => 'c',
            DType::Fifo => 'p',
            DType::Socket => 's',
            DType::Unknown => '?',
        }
    }

    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFREG => DType::Regular,
            S_IFDIR => DType::Dir,
            S_IFLNK => DType::Symlink,
            S_IFBLK => DType::Block,
            S_IFCHR => DType::Char,
            S_IFIFO => DType::Fifo,
            S_IFSOCK => DType::Socket,
            _ => DType::Unknown,
        }
    }
}

/// Cached lstat results for a file node, used to decide whether an observed
/// entry actually changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInformation {
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub ino: u64,
    pub dev: u64,
    pub nlink: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl FileInformation {
    /// The stat carried by nodes that were deleted before they could ever
    /// be observed on disk.
    pub fn zeroed() -> Self {
        Self {
            mode: 0,
            size: 0,
            uid: 0,
            gid: 0,
            ino: 0,
            dev: 0,
            nlink: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
        }
    }

    /// lstat: symlinks themselves are observed, not their targets.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let meta = std::fs::symlink_metadata(path)?;
        Ok(Self::from_metadata(&meta))
    }

    #[cfg(unix)]
    pub fn from_metadata(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            mode: meta.mode(),
            size: meta.size(),
            uid: meta.uid(),
            gid: meta.gid(),
            ino: meta.ino(),
            dev: meta.dev(),
            nlink: meta.nlink(),
            atime: systime_from(meta.atime(), meta.atime_nsec()),
            mtime: systime_from(meta.mtime(), meta.mtime_nsec()),
            ctime: systime_from(meta.ctime(), meta.ctime_nsec()),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(meta: &Metadata) -> Self {
        let file_type = meta.file_type();
        let mode = if file_type.is_dir() {
            S_IFDIR | 0o755
        } else if file_type.is_symlink() {
            S_IFLNK | 0o644
        } else {
            S_IFREG | 0o644
        };
        let mtime = meta.modified().unwrap_or(UNIX_EPOCH);
        Self {
            mode,
            size: meta.len(),
            uid: 0,
            gid: 0,
            ino: 0,
            dev: 0,
            nlink: 1,
            atime: meta.accessed().unwrap_or(mtime),
            mtime,
            ctime: meta.created().unwrap_or(mtime),
        }
    }

    pub fn dtype(&self) -> DType {
        DType::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

/// Compares everything except atime, which changes on mere reads and must
/// not be reported as a change.
pub fn did_file_change(saved: &FileInformation, fresh: &FileInformation) -> bool {
    saved.size != fresh.size
        || saved.mode != fresh.mode
        || saved.uid != fresh.uid
        || saved.gid != fresh.gid
        || saved.ino != fresh.ino
        || saved.dev != fresh.dev
        || saved.nlink != fresh.nlink
        || saved.mtime != fresh.mtime
        || saved.ctime != fresh.ctime
}

#[cfg(unix)]
fn systime_from(secs: i64, nsec: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsec as u32)
    } else {
        UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0) + Duration::new(0, nsec as u32)
    }
}

/// Splits a SystemTime into (seconds, nanoseconds) since the epoch, for
/// hashing and rendering.
pub fn systime_parts(t: SystemTime) -> (i64, u32) {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(err) => {
            let d = err.duration();
            (-(d.as_secs() as i64), d.subsec_nanos())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_from_mode() {
        assert_eq!(DType::from_mode(S_IFREG | 0o644), DType::Regular);
        assert_eq!(DType::from_mode(S_IFDIR | 0o755), DType::Dir);
        assert_eq!(DType::from_mode(S_IFLNK | 0o777), DType::Symlink);
        assert_eq!(DType::Regular.code(), 'f');
        assert_eq!(DType::Dir.code(), 'd');
    }

    #[test]
    fn atime_does_not_count_as_a_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();
        let a = FileInformation::from_path(&path).unwrap();
        let mut b = a;
        b.atime = b.atime + Duration::from_secs(5);
        assert!(!did_file_change(&a, &b));

        b.size = 6;
        assert!(did_file_change(&a, &b));
    }

    #[test]
    fn stat_reads_symlink_itself() {
        #[cfg(unix)]
        {
            let dir = tempfile::tempdir().unwrap();
            let target = dir.path().join("target");
            std::fs::write(&target, b"x").unwrap();
            let link = dir.path().join("link");
            std::os::unix::fs::symlink(&target, &link).unwrap();
            let info = FileInformation::from_path(&link).unwrap();
            assert!(info.is_symlink());
        }
    }
}
