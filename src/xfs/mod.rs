use std::{
	fs::File,
	io::{Error as IoError, ErrorKind, Result as IoResult},
	path::Path,
	sync::atomic::{AtomicU64, Ordering},
};

mod alloc;
mod alloc_btree;
mod bmap;
mod bmap_btree;
mod btree;
mod ialloc;
mod ialloc_btree;
mod inode;
mod mkfs;
mod quota;
mod rtalloc;
mod trans;

use crate::{
	blockreader::{Backend, BlockReader},
	data::*,
	decoder::{Config, Decoder},
};

pub use alloc::{AllocArg, AllocType};
pub use inode::{Fork, Inode};
pub use mkfs::{mkfs, MkfsParams};
pub use quota::{QuotaLimits, QuotaType};
pub use rtalloc::RtAllocType;
pub use trans::{Journal, LogRec, LogTarget, MemJournal, Trans};

pub(crate) use trans::{Buf, BufId};

/// (INTERNAL) Constructs an [`std::io::Error`] from an `errno`.
#[macro_export]
macro_rules! err {
	($name:ident) => {
		IoError::from_raw_os_error(libc::$name)
	};
}

/// (INTERNAL) Logs a corruption report and yields the matching error value.
#[macro_export]
macro_rules! corrupt {
	($($tk:tt)+) => {{
		log::error!($($tk)+);
		std::io::Error::from_raw_os_error($crate::EFSCORRUPTED)
	}};
}

macro_rules! iobail {
	($kind:expr, $($tk:tt)+) => {
		return Err(IoError::new($kind, format!($($tk)+)))
	};
}

/// Runtime mount flags.
pub const MOUNT_UDQ_ACCT: u32 = 0x0001;
pub const MOUNT_UDQ_ENFD: u32 = 0x0002;
pub const MOUNT_UDQ_CHKD: u32 = 0x0004;
pub const MOUNT_UDQ_ACTIVE: u32 = 0x0008;
pub const MOUNT_PDQ_ACCT: u32 = 0x0010;
pub const MOUNT_PDQ_ENFD: u32 = 0x0020;
pub const MOUNT_PDQ_CHKD: u32 = 0x0040;
pub const MOUNT_PDQ_ACTIVE: u32 = 0x0080;
pub const MOUNT_FS_SHUTDOWN: u32 = 0x0100;

/// Summary of filesystem statistics.
#[derive(Debug, Clone)]
#[doc(alias = "Statfs")]
pub struct Info {
	/// Number of data blocks.
	pub blocks: u64,

	/// Number of free data blocks.
	pub bfree: u64,

	/// Number of allocated inodes.
	pub files: u64,

	/// Number of free inodes.
	pub ffree: u64,

	/// Number of free realtime extents.
	pub rfree: u64,

	/// Block size.
	pub bsize: u32,
}

/// In-core cache of one AG's header fields.
#[derive(Debug, Clone, Default)]
pub(crate) struct PerAg {
	pub pagf_init: bool,
	pub freeblks:  ExtLen,
	pub longest:   ExtLen,
	pub flcount:   u32,
	pub levels:    [u32; 2],
	pub pagi_init: bool,
	pub icount:    u32,
	pub ifreecount: u32,
}

/// Monotonic engine counters; snapshot with [`Xfs::stats`].
#[derive(Debug, Default)]
pub(crate) struct Stats {
	pub allocs:     AtomicU64,
	pub frees:      AtomicU64,
	pub lookups:    AtomicU64,
	pub splits:     AtomicU64,
	pub joins:      AtomicU64,
	pub newroots:   AtomicU64,
	pub ialloc:     AtomicU64,
	pub ifree:      AtomicU64,
	pub bmaps:      AtomicU64,
	pub rtallocs:   AtomicU64,
	pub rtfrees:    AtomicU64,
	pub dqreserves: AtomicU64,
	pub commits:    AtomicU64,
	pub cancels:    AtomicU64,
}

impl Stats {
	pub fn bump(counter: &AtomicU64) {
		counter.fetch_add(1, Ordering::Relaxed);
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
	pub allocs:     u64,
	pub frees:      u64,
	pub lookups:    u64,
	pub splits:     u64,
	pub joins:      u64,
	pub newroots:   u64,
	pub ialloc:     u64,
	pub ifree:      u64,
	pub bmaps:      u64,
	pub rtallocs:   u64,
	pub rtfrees:    u64,
	pub dqreserves: u64,
	pub commits:    u64,
	pub cancels:    u64,
}

/// The mounted space-management engine.
pub struct Xfs<R: Backend> {
	pub(crate) file: Decoder<BlockReader<R>>,
	pub(crate) sb:   Superblock,

	pub(crate) perag:        Vec<PerAg>,
	pub(crate) agfrotor:     AgNumber,
	pub(crate) agirotor:     AgNumber,
	pub(crate) ag_maxlevels: usize,

	pub(crate) journal:  Box<dyn Journal>,
	pub(crate) next_tid: u64,
	pub(crate) flags:    u32,

	pub(crate) qm:    quota::QuotaMgr,
	pub(crate) stats: Stats,

	// inode cache
	#[cfg(feature = "icache")]
	pub(crate) icache: lru::LruCache<Ino, Inode>,
}

impl Xfs<File> {
	pub fn open(path: &Path, rw: bool) -> IoResult<Self> {
		let mut probe = BlockReader::open(path, 512, rw)?;
		let sb: Superblock = Decoder::new(&mut probe, Config::big()).decode_at(0)?;
		drop(probe);
		if sb.magicnum != SB_MAGIC {
			iobail!(
				ErrorKind::InvalidInput,
				"invalid superblock magic number: {:#x}",
				sb.magicnum
			);
		}
		let file = BlockReader::open(path, sb.blocksize as usize, rw)?;
		Self::new(file)
	}
}

impl<R: Backend> Xfs<R> {
	pub fn new(mut file: BlockReader<R>) -> IoResult<Self> {
		let mut magic = [0u8; 4];
		let mut d = Decoder::new(&mut file, Config::big());
		d.read_at(0, &mut magic)?;

		// magic: "XFSB", always big-endian
		if u32::from_be_bytes(magic) != SB_MAGIC {
			iobail!(
				ErrorKind::InvalidInput,
				"invalid superblock magic number: {magic:?}"
			)
		}
		drop(d);

		let mut file = Decoder::new(file, Config::big());
		let superblock: Superblock = file.decode_at(0)?;

		let agcount = superblock.agcount as usize;
		let ag_maxlevels = compute_ag_maxlevels(&superblock);
		let qm = quota::QuotaMgr::new(&superblock);
		let mut s = Self {
			file,
			sb: superblock,
			perag: vec![PerAg::default(); agcount],
			agfrotor: 0,
			agirotor: 0,
			ag_maxlevels,
			journal: Box::<MemJournal>::default(),
			next_tid: 1,
			flags: 0,
			qm,
			stats: Stats::default(),
			#[cfg(feature = "icache")]
			icache: crate::new_lru(crate::ICACHE_SIZE),
		};
		s.flags |= s.qm.mount_flags();
		s.check()?;
		Ok(s)
	}

	/// Replace the journal the engine commits through.
	pub fn set_journal(&mut self, journal: Box<dyn Journal>) {
		self.journal = journal;
	}

	pub fn write_enabled(&self) -> bool {
		self.file.inner().write_enabled()
	}

	pub(crate) fn assert_rw(&self) -> IoResult<()> {
		if self.write_enabled() {
			Ok(())
		} else {
			Err(err!(EROFS))
		}
	}

	/// Get filesystem metadata.
	#[doc(alias("statfs", "statvfs"))]
	pub fn info(&self) -> Info {
		let sb = &self.sb;
		Info {
			blocks: sb.dblocks,
			bfree:  sb.fdblocks,
			files:  sb.icount,
			ffree:  sb.ifree,
			rfree:  sb.frextents,
			bsize:  sb.blocksize,
		}
	}

	pub fn superblock(&self) -> &Superblock {
		&self.sb
	}

	pub fn stats(&self) -> StatsSnapshot {
		let ld = |c: &AtomicU64| c.load(Ordering::Relaxed);
		let s = &self.stats;
		StatsSnapshot {
			allocs:     ld(&s.allocs),
			frees:      ld(&s.frees),
			lookups:    ld(&s.lookups),
			splits:     ld(&s.splits),
			joins:      ld(&s.joins),
			newroots:   ld(&s.newroots),
			ialloc:     ld(&s.ialloc),
			ifree:      ld(&s.ifree),
			bmaps:      ld(&s.bmaps),
			rtallocs:   ld(&s.rtallocs),
			rtfrees:    ld(&s.rtfrees),
			dqreserves: ld(&s.dqreserves),
			commits:    ld(&s.commits),
			cancels:    ld(&s.cancels),
		}
	}

	fn check(&mut self) -> IoResult<()> {
		let sb = self.sb.clone();
		log::debug!("Superblock: {sb:#?}");

		log::info!("Summary:");
		log::info!("Block Size: {}", sb.blocksize);
		log::info!("# Data Blocks: {}", sb.dblocks);
		log::info!("# AGs: {}", sb.agcount);
		log::info!("AG Size: {} blocks", sb.agblocks);
		log::info!("Inode Size: {}", sb.inodesize);
		log::info!("# RT Extents: {}", sb.rextents);

		macro_rules! sbassert {
			($e:expr) => {
				if !($e) {
					return Err(corrupt!("superblock corrupted: {}", stringify!($e)));
				}
			};
		}

		sbassert!(sb.magicnum == SB_MAGIC);
		sbassert!(sb.versionnum == SB_VERSION);
		sbassert!((9..=16).contains(&sb.blocklog));
		sbassert!(sb.blocksize == 1 << sb.blocklog);
		sbassert!(sb.inodesize as u32 == 1 << sb.inodelog);
		sbassert!(sb.inopblock as u32 == 1 << sb.inopblog);
		sbassert!(sb.inodelog as u32 + sb.inopblog as u32 == sb.blocklog as u32);
		sbassert!(sb.inopblock as u32 <= INODES_PER_CHUNK);
		sbassert!(sb.agcount > 0);
		sbassert!(sb.agblocks > AG_RESERVED_BLOCKS);
		sbassert!(sb.agblocks as u64 <= 1 << sb.agblklog);
		sbassert!((sb.agblocks as u64) > (1 << sb.agblklog) / 2 || sb.agblklog == 3);
		sbassert!(sb.dblocks == sb.agcount as u64 * sb.agblocks as u64);
		sbassert!(sb.fdblocks <= sb.dblocks);
		sbassert!(sb.rblocks == sb.rextents * sb.rextsize as u64);

		// the device must actually hold what the superblock claims
		let need = sb.dblocks << sb.blocklog;
		let have = self.file.inner_mut().device_size()?;
		if have < need {
			log::error!("device too small: {have} < {need} bytes");
			return Err(err!(E2BIG));
		}

		// check that all AG headers are ok.
		for agno in 0..sb.agcount {
			let agf: Agf = self
				.file
				.decode_at(sb.ag_daddr(agno) + ((AGF_BLOCK as u64) << sb.blocklog))?;
			if agf.magicnum != AGF_MAGIC || agf.versionnum != AGF_VERSION || agf.seqno != agno {
				return Err(corrupt!("AG{agno} has an invalid AGF header"));
			}
			let agi: Agi = self
				.file
				.decode_at(sb.ag_daddr(agno) + ((AGI_BLOCK as u64) << sb.blocklog))?;
			if agi.magicnum != AGI_MAGIC || agi.versionnum != AGI_VERSION || agi.seqno != agno {
				return Err(corrupt!("AG{agno} has an invalid AGI header"));
			}
		}
		log::info!("OK");
		Ok(())
	}

	/// Force the filesystem into the shutdown state.  Every later
	/// transaction allocation or commit fails with `EIO`.
	pub fn force_shutdown(&mut self, why: &str) {
		if self.flags & MOUNT_FS_SHUTDOWN == 0 {
			log::error!("filesystem shutdown: {why}");
			self.flags |= MOUNT_FS_SHUTDOWN;
		}
	}

	pub fn is_shutdown(&self) -> bool {
		self.flags & MOUNT_FS_SHUTDOWN != 0
	}

	/// Observable runtime flags, `MOUNT_*`.
	pub fn mount_flags(&self) -> u32 {
		self.flags
	}

	/// Write the primary superblock back to the device.  The copies in
	/// the other AGs are only refreshed by repair tools.
	pub(crate) fn write_sb(&mut self) -> IoResult<()> {
		let sb = self.sb.clone();
		self.file.encode_at(0, &sb)?;
		Ok(())
	}

	pub(crate) fn perag(&self, agno: AgNumber) -> &PerAg {
		&self.perag[agno as usize]
	}
}

#[cfg(test)]
pub(crate) mod testutil {
	use super::*;

	/// Format a fresh image in memory and mount it.
	pub(crate) fn mkimg(p: &mkfs::MkfsParams) -> Xfs<std::io::Cursor<Vec<u8>>> {
		let size = (p.agcount as u64 * p.agblocks as u64 + p.rtblocks()) << p.blocklog;
		let mut img = std::io::Cursor::new(vec![0u8; size as usize]);
		mkfs::mkfs(&mut img, p).unwrap();
		Xfs::new(BlockReader::new(img, 1usize << p.blocklog, true)).unwrap()
	}
}

fn compute_ag_maxlevels(sb: &Superblock) -> usize {
	let mnr_leaf = (alloc_btree::alloc_maxrecs(sb.blocksize, true) / 2).max(1);
	let mnr_node = (alloc_btree::alloc_maxrecs(sb.blocksize, false) / 2).max(2);
	let mut maxlevels = 1;
	let mut capacity = mnr_leaf as u64;
	while capacity < sb.agblocks as u64 && maxlevels < BTREE_MAXLEVELS {
		capacity *= mnr_node as u64;
		maxlevels += 1;
	}
	maxlevels
}
