use std::{cmp::Ordering, io::Result as IoResult};

use super::{btree::Tree, *};

/// Record capacity of a free-space tree block.
pub(crate) fn alloc_maxrecs(blocksize: u32, leaf: bool) -> usize {
	let space = blocksize as usize - SBT_HDR_LEN;
	if leaf {
		space / ALLOC_REC_LEN
	} else {
		space / (ALLOC_REC_LEN + 4)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BtNum {
	Bno,
	Cnt,
}

impl BtNum {
	pub fn idx(self) -> usize {
		match self {
			Self::Bno => BTNUM_BNO,
			Self::Cnt => BTNUM_CNT,
		}
	}
}

/// One of the two free-space trees of an AG.  Both hold the same
/// records; they differ in ordering and in the AGF slots their roots
/// live in.
pub(crate) struct AllocBt {
	pub agno:  AgNumber,
	pub agf:   BufId,
	pub which: BtNum,
}

impl<R: Backend> Tree<R> for AllocBt {
	type Rec = AllocRec;
	type Key = AllocRec;

	const LONG: bool = false;
	const NAME: &'static str = "allocbt";

	fn magic(&self) -> u32 {
		match self.which {
			BtNum::Bno => ABTB_MAGIC,
			BtNum::Cnt => ABTC_MAGIC,
		}
	}

	fn key_of(&self, rec: &AllocRec) -> AllocRec {
		*rec
	}

	fn cmp_keys(&self, a: &AllocRec, b: &AllocRec) -> Ordering {
		match self.which {
			BtNum::Bno => a.startblock.cmp(&b.startblock),
			BtNum::Cnt => (a.blockcount, a.startblock).cmp(&(b.blockcount, b.startblock)),
		}
	}

	fn rec_len(&self) -> usize {
		ALLOC_REC_LEN
	}

	fn key_len(&self) -> usize {
		ALLOC_REC_LEN
	}

	fn maxrecs(&self, tp: &Trans<'_, R>, leaf: bool, _root: bool) -> usize {
		alloc_maxrecs(tp.fs.sb.blocksize, leaf)
	}

	fn root(&self, tp: &mut Trans<'_, R>) -> IoResult<(u64, usize)> {
		let agf = tp.agf(self.agf)?;
		let i = self.which.idx();
		Ok((agf.roots[i] as u64, agf.levels[i] as usize))
	}

	fn set_root(&mut self, tp: &mut Trans<'_, R>, ptr: u64, nlevels: usize) -> IoResult<()> {
		let mut agf = tp.agf(self.agf)?;
		let i = self.which.idx();
		agf.roots[i] = ptr as AgBlock;
		agf.levels[i] = nlevels as u32;
		tp.log_agf(self.agf, &agf)
	}

	fn buf_of(&self, tp: &mut Trans<'_, R>, ptr: u64) -> IoResult<BufId> {
		let fsb = tp.fs.sb.agb_to_fsb(self.agno, ptr as AgBlock);
		tp.read_buf(fsb, 1)
	}

	fn new_buf(&self, tp: &mut Trans<'_, R>, ptr: u64) -> IoResult<BufId> {
		let fsb = tp.fs.sb.agb_to_fsb(self.agno, ptr as AgBlock);
		tp.get_buf(fsb, 1)
	}

	/// Tree growth is paid for by the AGFL; that is the freelist's whole
	/// reason to exist.
	fn alloc_block(&mut self, tp: &mut Trans<'_, R>, _hint: u64) -> IoResult<Option<u64>> {
		Ok(tp.alloc_get_freelist(self.agno, self.agf)?.map(u64::from))
	}

	fn free_block(&mut self, tp: &mut Trans<'_, R>, ptr: u64) -> IoResult<()> {
		tp.alloc_put_freelist(self.agno, self.agf, ptr as AgBlock)
	}
}
