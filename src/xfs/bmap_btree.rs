use std::{cmp::Ordering, io::Result as IoResult};

use super::{btree::Tree, *};

/// Record capacity of an on-disk block-map tree block.  A record and a
/// key/pointer pair are the same size, so leaves and nodes hold the
/// same count.
pub(crate) fn bmbt_maxrecs(blocksize: u32) -> usize {
	(blocksize as usize - LBT_HDR_LEN) / BMBT_REC_LEN
}

/// Capacity of the root packed into the inode literal area.
pub(crate) fn bmbt_inline_maxrecs(fork_size: usize) -> usize {
	(fork_size - LBT_HDR_LEN) / BMBT_REC_LEN
}

/// Build the bytes of a fresh inline root with one child.
pub(crate) fn broot_new(
	cfg: Config,
	fork_size: usize,
	level: u16,
	key: FileOff,
	ptr: FsBlock,
) -> IoResult<Vec<u8>> {
	let mut b = vec![0u8; fork_size];
	let maxr = bmbt_inline_maxrecs(fork_size);
	cfg.encode_slice(
		&mut b,
		&LBtreeHdr {
			magic:    BMAP_MAGIC,
			level,
			numrecs:  1,
			leftsib:  NULLFSBLOCK,
			rightsib: NULLFSBLOCK,
		},
	)?;
	cfg.encode_slice(&mut b[LBT_HDR_LEN..], &key)?;
	cfg.encode_slice(&mut b[LBT_HDR_LEN + maxr * 8..], &ptr)?;
	Ok(b)
}

/// The block-map tree of one inode fork.
///
/// The root block is the synthetic `IRoot` buffer; block allocation
/// goes through the filesystem-wide selector with the fork's own
/// locality hint, and frees are parked on a deferred list so one
/// commit covers every tree mutation of the operation.
pub(crate) struct BmbtBt {
	pub ino:        Ino,
	pub iroot:      BufId,
	pub fork_size:  usize,
	pub firstblock: FsBlock,
	pub flist:      Vec<(FsBlock, ExtLen)>,
	pub nblocks:    i64,
}

impl<R: Backend> Tree<R> for BmbtBt {
	type Rec = BmbtRec;
	type Key = FileOff;

	const LONG: bool = true;
	const ROOT_IN_INODE: bool = true;
	const NAME: &'static str = "bmbt";

	fn magic(&self) -> u32 {
		BMAP_MAGIC
	}

	fn key_of(&self, rec: &BmbtRec) -> FileOff {
		rec.startoff()
	}

	fn cmp_keys(&self, a: &FileOff, b: &FileOff) -> Ordering {
		a.cmp(b)
	}

	fn rec_len(&self) -> usize {
		BMBT_REC_LEN
	}

	fn key_len(&self) -> usize {
		8
	}

	fn maxrecs(&self, tp: &Trans<'_, R>, _leaf: bool, root: bool) -> usize {
		if root {
			bmbt_inline_maxrecs(self.fork_size)
		} else {
			bmbt_maxrecs(tp.fs.sb.blocksize)
		}
	}

	fn root(&self, tp: &mut Trans<'_, R>) -> IoResult<(u64, usize)> {
		let h: LBtreeHdr = tp.bread(self.iroot, 0)?;
		Ok((NULLFSBLOCK, h.level as usize + 1))
	}

	fn set_root(&mut self, _tp: &mut Trans<'_, R>, _ptr: u64, _nlevels: usize) -> IoResult<()> {
		// the height lives in the inline root's own header
		Ok(())
	}

	fn buf_of(&self, tp: &mut Trans<'_, R>, ptr: u64) -> IoResult<BufId> {
		tp.read_buf(ptr, 1)
	}

	fn new_buf(&self, tp: &mut Trans<'_, R>, ptr: u64) -> IoResult<BufId> {
		tp.get_buf(ptr, 1)
	}

	fn root_buf(&self, _tp: &mut Trans<'_, R>) -> IoResult<BufId> {
		Ok(self.iroot)
	}

	fn alloc_block(&mut self, tp: &mut Trans<'_, R>, hint: u64) -> IoResult<Option<u64>> {
		let h = if hint != 0 && hint != NULLFSBLOCK {
			hint
		} else {
			self.firstblock
		};
		let mut args = AllocArg::new(AllocType::StartBno, h, 1, 1);
		tp.alloc_vextent(&mut args)?;
		if !args.ok() {
			return Ok(None);
		}
		self.firstblock = args.fsbno;
		self.nblocks += 1;
		Ok(Some(args.fsbno))
	}

	fn free_block(&mut self, _tp: &mut Trans<'_, R>, ptr: u64) -> IoResult<()> {
		self.flist.push((ptr, 1));
		self.nblocks -= 1;
		Ok(())
	}
}
