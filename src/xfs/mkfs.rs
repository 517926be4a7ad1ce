use std::io::{Error as IoError, Result as IoResult};

use super::*;
use crate::err;

/// Geometry of a filesystem about to be created.
#[derive(Debug, Clone)]
pub struct MkfsParams {
	pub blocklog: u8,
	pub agblocks: AgBlock,
	pub agcount:  AgNumber,
	pub inodelog: u8,
	pub rextents: u64,
	pub rextsize: ExtLen,
	pub qflags:   u16,
	pub label:    [u8; 12],
	pub uuid:     [u8; 16],
}

impl Default for MkfsParams {
	fn default() -> Self {
		Self {
			blocklog: 12,
			agblocks: 1000,
			agcount:  1,
			inodelog: 8,
			rextents: 0,
			rextsize: 1,
			qflags:   0,
			label:    *b"rxfs\0\0\0\0\0\0\0\0",
			uuid:     *uuid::Uuid::new_v4().as_bytes(),
		}
	}
}

fn log2_ceil(v: u64) -> u8 {
	debug_assert!(v >= 1);
	(64 - (v - 1).leading_zeros()) as u8
}

impl MkfsParams {
	/// Size of the realtime section in blocks.
	pub fn rtblocks(&self) -> u64 {
		self.rextents * self.rextsize as u64
	}

	fn superblock(&self) -> Superblock {
		let blocksize = 1u32 << self.blocklog;
		let inopblog = self.blocklog - self.inodelog;
		let bits_per_block = blocksize as u64 * 8;
		Superblock {
			magicnum:   SB_MAGIC,
			blocksize,
			dblocks:    self.agcount as u64 * self.agblocks as u64,
			rblocks:    self.rtblocks(),
			rextents:   self.rextents,
			uuid:       self.uuid,
			rootino:    NULLINO,
			rbmino:     NULLINO,
			rsumino:    NULLINO,
			rextsize:   self.rextsize,
			agblocks:   self.agblocks,
			agcount:    self.agcount,
			rbmblocks:  self.rextents.div_ceil(bits_per_block) as ExtLen,
			versionnum: SB_VERSION,
			sectsize:   512,
			inodesize:  1u16 << self.inodelog,
			inopblock:  1u16 << inopblog,
			fname:      self.label,
			blocklog:   self.blocklog,
			sectlog:    9,
			inodelog:   self.inodelog,
			inopblog,
			agblklog:   log2_ceil(self.agblocks as u64),
			rextslog:   if self.rextents > 0 {
				(63 - self.rextents.leading_zeros()) as u8
			} else {
				0
			},
			inprogress: 0,
			imax_pct:   25,
			icount:     0,
			ifree:      0,
			fdblocks:   self.agcount as u64 * (self.agblocks - AG_RESERVED_BLOCKS) as u64,
			frextents:  0,
			uquotino:   NULLINO,
			pquotino:   NULLINO,
			qflags:     self.qflags,
			flags:      0,
			shared_vn:  0,
		}
	}
}

/// Format a fresh filesystem onto `dev`: the superblock and AG headers,
/// one free-space record per AG, empty inode trees, then the root
/// inode and (when asked for) the realtime metadata, built through the
/// engine itself.
pub fn mkfs<R: Backend>(dev: &mut R, p: &MkfsParams) -> IoResult<()> {
	if !(9..=16).contains(&p.blocklog)
		|| p.inodelog < 8
		|| p.inodelog >= p.blocklog
		|| p.blocklog - p.inodelog > 6
		|| p.agblocks <= 2 * AG_RESERVED_BLOCKS
		|| p.agcount == 0
		|| p.rextsize == 0
	{
		return Err(err!(EINVAL));
	}
	let sb = p.superblock();
	let bs = sb.blocksize as usize;
	log::info!(
		"mkfs: {} AGs x {} blocks, block size {}, {} rt extents",
		sb.agcount,
		sb.agblocks,
		sb.blocksize,
		sb.rextents
	);

	{
		let mut file = Decoder::new(BlockReader::new(&mut *dev, bs, true), Config::big());
		let free = AllocRec {
			startblock: AG_RESERVED_BLOCKS,
			blockcount: sb.agblocks - AG_RESERVED_BLOCKS,
		};
		for agno in 0..sb.agcount {
			let base = sb.ag_daddr(agno);
			let blk = |b: AgBlock| base + ((b as u64) << sb.blocklog);

			file.encode_at(blk(SB_BLOCK), &sb)?;
			file.encode_at(
				blk(AGF_BLOCK),
				&Agf {
					magicnum:   AGF_MAGIC,
					versionnum: AGF_VERSION,
					seqno:      agno,
					length:     sb.agblocks,
					roots:      [BNO_ROOT_BLOCK, CNT_ROOT_BLOCK],
					levels:     [1, 1],
					flfirst:    0,
					fllast:     sb.agfl_size() - 1,
					flcount:    0,
					freeblks:   free.blockcount,
					longest:    free.blockcount,
				},
			)?;
			file.encode_at(
				blk(AGI_BLOCK),
				&Agi {
					magicnum:   AGI_MAGIC,
					versionnum: AGI_VERSION,
					seqno:      agno,
					length:     sb.agblocks,
					count:      0,
					root:       INO_ROOT_BLOCK,
					level:      1,
					freecount:  0,
					newino:     NULLAGINO,
					dirino:     NULLAGINO,
					unlinked:   [NULLAGINO; 64],
				},
			)?;
			file.fill_at(blk(AGFL_BLOCK), 0, bs)?;

			for (b, magic) in [(BNO_ROOT_BLOCK, ABTB_MAGIC), (CNT_ROOT_BLOCK, ABTC_MAGIC)] {
				file.fill_at(blk(b), 0, bs)?;
				file.encode_at(
					blk(b),
					&SBtreeHdr {
						magic,
						level: 0,
						numrecs: 1,
						leftsib: NULLAGBLOCK,
						rightsib: NULLAGBLOCK,
					},
				)?;
				file.encode(&free)?;
			}
			file.fill_at(blk(INO_ROOT_BLOCK), 0, bs)?;
			file.encode_at(
				blk(INO_ROOT_BLOCK),
				&SBtreeHdr {
					magic:    IBT_MAGIC,
					level:    0,
					numrecs:  0,
					leftsib:  NULLAGBLOCK,
					rightsib: NULLAGBLOCK,
				},
			)?;
		}
	}

	// the engine finishes its own setup
	let mut fs = Xfs::new(BlockReader::new(&mut *dev, bs, true))?;
	let mut tp = fs.trans_alloc(sb.chunk_blocks() + 16)?;
	let root = tp.create_inode(0, S_IFDIR | 0o755, true)?;
	tp.fs.sb.rootino = root.ino;
	tp.log_sb();
	tp.commit()?;
	if sb.rextents > 0 {
		super::rtalloc::rt_init(&mut fs)?;
	}
	log::info!("mkfs: root inode {:#x}", fs.sb.rootino);
	Ok(())
}

#[cfg(test)]
mod t {
	use super::*;
	use crate::xfs::testutil::mkimg;

	#[test]
	fn fresh_image_mounts_clean() {
		let p = MkfsParams {
			agcount: 2,
			..MkfsParams::default()
		};
		let mut fs = mkimg(&p);
		let info = fs.info();
		assert_eq!(info.blocks, 2000);
		assert_eq!(info.files, 64);
		assert_eq!(info.ffree, 63);
		assert_eq!(fs.sb.ino_to_agno(fs.sb.rootino), 0);
		for agno in 0..2 {
			fs.check_ag(agno).unwrap();
			fs.check_ino_chunks(agno).unwrap();
		}
		let root = fs.iget(fs.sb.rootino).unwrap();
		assert!(root.core.is_dir());
		assert_eq!(root.core.nlink, 1);
	}

	#[test]
	fn bogus_geometry_is_refused() {
		let mut img = std::io::Cursor::new(vec![0u8; 1 << 20]);
		let p = MkfsParams {
			blocklog: 8,
			..MkfsParams::default()
		};
		let e = mkfs(&mut img, &p).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::EINVAL));
	}

	#[test]
	fn secondary_superblocks_written() {
		let p = MkfsParams {
			agcount: 3,
			..MkfsParams::default()
		};
		let mut fs = mkimg(&p);
		for agno in 1..3 {
			let sb: Superblock = fs.file.decode_at(fs.sb.ag_daddr(agno)).unwrap();
			assert_eq!(sb.magicnum, SB_MAGIC);
			assert_eq!(sb.uuid, fs.sb.uuid);
		}
	}
}
