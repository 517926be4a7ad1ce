#![cfg_attr(fuzzing, allow(dead_code, unused_imports, unused_mut))]

mod blockreader;
mod data;
mod decoder;
mod xfs;

/// Errno used for on-disk structure corruption.
#[cfg(target_os = "linux")]
pub const EFSCORRUPTED: i32 = libc::EUCLEAN;
#[cfg(target_os = "freebsd")]
pub const EFSCORRUPTED: i32 = libc::EINTEGRITY;
#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
pub const EFSCORRUPTED: i32 = libc::EIO;

#[cfg(feature = "icache")]
pub(crate) const ICACHE_SIZE: usize = 256;
#[cfg(feature = "bcache")]
pub(crate) const BCACHE_SIZE: usize = 64;

#[cfg(feature = "lru")]
pub(crate) fn new_lru<K: std::hash::Hash + Eq, V>(size: usize) -> lru::LruCache<K, V> {
	lru::LruCache::new(std::num::NonZeroUsize::new(size).unwrap())
}

pub use crate::{
	blockreader::{Backend, BlockReader},
	data::{
		isnullstartblock, AgBlock, AgIno, AgNumber, AllocRec, BmbtIrec, DiFormat,
		DiskInodeCore, ExtLen, ExtState, FileOff, FsBlock, InobtRec, Ino, Superblock,
		DELAYSTARTBLOCK, DIFLAG_REALTIME, HOLESTARTBLOCK, INODES_PER_CHUNK, NULLAGBLOCK,
		NULLAGINO, NULLFILEOFF, NULLFSBLOCK, NULLINO, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG,
	},
	xfs::{
		mkfs, AllocArg, AllocType, Fork, Info, Inode, Journal, LogRec, LogTarget, MemJournal,
		MkfsParams, QuotaLimits, QuotaType, RtAllocType, StatsSnapshot, Trans, Xfs,
		MOUNT_FS_SHUTDOWN, MOUNT_PDQ_ACCT, MOUNT_PDQ_ACTIVE, MOUNT_PDQ_CHKD, MOUNT_PDQ_ENFD,
		MOUNT_UDQ_ACCT, MOUNT_UDQ_ACTIVE, MOUNT_UDQ_CHKD, MOUNT_UDQ_ENFD,
	},
};
