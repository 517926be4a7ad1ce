use std::{cmp::Ordering, io::Result as IoResult};

use super::{btree::Tree, *};

/// Record capacity of an inode-chunk tree block.
pub(crate) fn inobt_maxrecs(blocksize: u32, leaf: bool) -> usize {
	let space = blocksize as usize - SBT_HDR_LEN;
	if leaf {
		space / INOBT_REC_LEN
	} else {
		space / 8
	}
}

/// The inode-chunk tree of an AG, rooted in the AGI.
pub(crate) struct InoBt {
	pub agno: AgNumber,
	pub agi:  BufId,
}

impl<R: Backend> Tree<R> for InoBt {
	type Rec = InobtRec;
	type Key = AgIno;

	const LONG: bool = false;
	const NAME: &'static str = "inobt";

	fn magic(&self) -> u32 {
		IBT_MAGIC
	}

	fn key_of(&self, rec: &InobtRec) -> AgIno {
		rec.startino
	}

	fn cmp_keys(&self, a: &AgIno, b: &AgIno) -> Ordering {
		a.cmp(b)
	}

	fn rec_len(&self) -> usize {
		INOBT_REC_LEN
	}

	fn key_len(&self) -> usize {
		4
	}

	fn maxrecs(&self, tp: &Trans<'_, R>, leaf: bool, _root: bool) -> usize {
		inobt_maxrecs(tp.fs.sb.blocksize, leaf)
	}

	fn root(&self, tp: &mut Trans<'_, R>) -> IoResult<(u64, usize)> {
		let agi = tp.agi(self.agi)?;
		Ok((agi.root as u64, agi.level as usize))
	}

	fn set_root(&mut self, tp: &mut Trans<'_, R>, ptr: u64, nlevels: usize) -> IoResult<()> {
		let mut agi = tp.agi(self.agi)?;
		agi.root = ptr as AgBlock;
		agi.level = nlevels as u32;
		tp.log_agi(self.agi, &agi)
	}

	fn buf_of(&self, tp: &mut Trans<'_, R>, ptr: u64) -> IoResult<BufId> {
		let fsb = tp.fs.sb.agb_to_fsb(self.agno, ptr as AgBlock);
		tp.read_buf(fsb, 1)
	}

	fn new_buf(&self, tp: &mut Trans<'_, R>, ptr: u64) -> IoResult<BufId> {
		let fsb = tp.fs.sb.agb_to_fsb(self.agno, ptr as AgBlock);
		tp.get_buf(fsb, 1)
	}

	/// Chunk-tree growth draws on the AG's ordinary free space.
	fn alloc_block(&mut self, tp: &mut Trans<'_, R>, _hint: u64) -> IoResult<Option<u64>> {
		Ok(tp.ag_alloc_block(self.agno)?.map(u64::from))
	}

	fn free_block(&mut self, tp: &mut Trans<'_, R>, ptr: u64) -> IoResult<()> {
		let agf = tp.read_agf(self.agno)?;
		tp.free_ag_extent(self.agno, agf, ptr as AgBlock, 1, false)
	}
}
