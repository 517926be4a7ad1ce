use std::io::{Error as IoError, Result as IoResult};

use super::{trans::SbField, *};
use crate::{corrupt, err};

/// Realtime allocation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtAllocType {
	/// The requested run or nothing.
	Exact,
	/// Outward bitmap-block walk around the hint.
	Near,
	/// Summary-directed search by run size.
	Size,
}

fn rtmask(n: u64) -> u32 {
	if n >= 32 {
		!0
	} else {
		(1u32 << n) - 1
	}
}

fn rtlog2(len: u64) -> u32 {
	debug_assert!(len > 0);
	63 - len.leading_zeros()
}

impl<'a, R: Backend> Trans<'a, R> {
	fn rt_bits_per_block(&self) -> u64 {
		self.fs.sb.blocksize as u64 * 8
	}

	fn rtfile_buf(&mut self, ino: Ino, block: u64) -> IoResult<BufId> {
		let mut ip = self.fs.iget(ino)?;
		let maps = self.bmapi(&mut ip, block, 1, false, 1)?;
		match maps.first() {
			Some(m) if !isnullstartblock(m.startblock) => self.read_buf(m.startblock, 1),
			_ => Err(corrupt!("realtime file {ino:#x}: block {block} unmapped")),
		}
	}

	fn rtbm_buf(&mut self, block: u64) -> IoResult<BufId> {
		let ino = self.fs.sb.rbmino;
		if ino == NULLINO {
			return Err(corrupt!("no realtime bitmap inode"));
		}
		self.rtfile_buf(ino, block)
	}

	fn rtsum_buf(&mut self, block: u64) -> IoResult<BufId> {
		let ino = self.fs.sb.rsumino;
		if ino == NULLINO {
			return Err(corrupt!("no realtime summary inode"));
		}
		self.rtfile_buf(ino, block)
	}

	fn rtbit(&mut self, rtx: u64) -> IoResult<bool> {
		let bpb = self.rt_bits_per_block();
		let id = self.rtbm_buf(rtx / bpb)?;
		let bit = rtx % bpb;
		let w: u32 = self.bread(id, (bit / 32) as usize * 4)?;
		Ok(w >> (bit % 32) & 1 == 1)
	}

	/// Set or clear `[start, start+len)` in the bitmap, word at a time
	/// with masks for the partial words at either end.  One means free.
	fn rtmodify_range(&mut self, start: u64, len: u64, free: bool) -> IoResult<()> {
		let bpb = self.rt_bits_per_block();
		let end = start + len;
		let mut rtx = start;
		while rtx < end {
			let id = self.rtbm_buf(rtx / bpb)?;
			let bit = rtx % bpb;
			let wi = (bit / 32) as usize;
			let bo = (bit % 32) as u32;
			let n = (32 - bo as u64).min(end - rtx);
			let mask = rtmask(n) << bo;
			let w: u32 = self.bread(id, wi * 4)?;
			if free && w & mask != 0 {
				return Err(corrupt!("freeing free realtime extents near {rtx}"));
			}
			if !free && w & mask != mask {
				return Err(corrupt!("allocating busy realtime extents near {rtx}"));
			}
			let nw = if free { w | mask } else { w & !mask };
			self.bwrite(id, wi * 4, &nw)?;
			rtx += n;
		}
		Ok(())
	}

	/// First extent of the run of same-valued bits containing `start`.
	fn rtfind_back(&mut self, start: u64) -> IoResult<u64> {
		let bpb = self.rt_bits_per_block();
		let val = self.rtbit(start)?;
		let mut rtx = start; // examine rtx-1 downward
		while rtx > 0 {
			let pos = rtx - 1;
			let id = self.rtbm_buf(pos / bpb)?;
			let bit = pos % bpb;
			let bo = (bit % 32) as u32;
			let n = (bo as u64 + 1).min(rtx);
			let shift = bo + 1 - n as u32;
			let w: u32 = self.bread(id, (bit / 32) as usize * 4)?;
			let bits = (w >> shift) & rtmask(n);
			let want = if val { rtmask(n) } else { 0 };
			if bits != want {
				let x = bits ^ want;
				let h = (31 - x.leading_zeros()) as u64;
				return Ok(pos - n + h + 2);
			}
			rtx -= n;
		}
		Ok(0)
	}

	/// Last extent (capped at `limit`) of the run containing `start`.
	fn rtfind_forw(&mut self, start: u64, limit: u64) -> IoResult<u64> {
		let bpb = self.rt_bits_per_block();
		let val = self.rtbit(start)?;
		let mut rtx = start + 1;
		while rtx <= limit {
			let id = self.rtbm_buf(rtx / bpb)?;
			let bit = rtx % bpb;
			let wi = (bit / 32) as usize;
			let bo = (bit % 32) as u32;
			let n = (32 - bo as u64).min(limit + 1 - rtx);
			let w: u32 = self.bread(id, wi * 4)?;
			let bits = (w >> bo) & rtmask(n);
			let want = if val { rtmask(n) } else { 0 };
			if bits != want {
				let diff = (bits ^ want).trailing_zeros() as u64;
				return Ok(rtx + diff - 1);
			}
			rtx += n;
		}
		Ok(limit)
	}

	fn rtmodify_summary(&mut self, log: u32, bbno: u64, delta: i32) -> IoResult<()> {
		let spb = self.fs.sb.blocksize as u64 / 4;
		let so = log as u64 * self.fs.sb.rbmblocks as u64 + bbno;
		let id = self.rtsum_buf(so / spb)?;
		let off = (so % spb) as usize * 4;
		let v: u32 = self.bread(id, off)?;
		let nv = v as i64 + delta as i64;
		if nv < 0 {
			return Err(corrupt!("realtime summary underflow at ({log}, {bbno})"));
		}
		self.bwrite(id, off, &(nv as u32))
	}

	fn rtget_summary(&mut self, log: u32, bbno: u64) -> IoResult<u32> {
		let spb = self.fs.sb.blocksize as u64 / 4;
		let so = log as u64 * self.fs.sb.rbmblocks as u64 + bbno;
		let id = self.rtsum_buf(so / spb)?;
		self.bread(id, (so % spb) as usize * 4)
	}

	/// Free a run: merge with the neighboring free runs in the summary,
	/// then set the bits.
	fn rtfree_range(&mut self, start: u64, len: u64) -> IoResult<()> {
		let bpb = self.rt_bits_per_block();
		let rext = self.fs.sb.rextents;
		let end = start + len - 1;

		let preblock = if start > 0 && self.rtbit(start - 1)? {
			self.rtfind_back(start - 1)?
		} else {
			start
		};
		let postblock = if end + 1 < rext && self.rtbit(end + 1)? {
			self.rtfind_forw(end + 1, rext - 1)?
		} else {
			end
		};
		if preblock < start {
			self.rtmodify_summary(rtlog2(start - preblock), preblock / bpb, -1)?;
		}
		if postblock > end {
			self.rtmodify_summary(rtlog2(postblock - end), (end + 1) / bpb, -1)?;
		}
		self.rtmodify_range(start, len, true)?;
		self.rtmodify_summary(rtlog2(postblock - preblock + 1), preblock / bpb, 1)
	}

	/// Take a run out of the middle of its free run, splitting the
	/// summary accounting accordingly.
	fn rtallocate_range(&mut self, start: u64, len: u64) -> IoResult<()> {
		let bpb = self.rt_bits_per_block();
		let rext = self.fs.sb.rextents;
		let end = start + len - 1;

		let preblock = self.rtfind_back(start)?;
		let postblock = self.rtfind_forw(end, rext - 1)?;
		self.rtmodify_summary(rtlog2(postblock - preblock + 1), preblock / bpb, -1)?;
		if preblock < start {
			self.rtmodify_summary(rtlog2(start - preblock), preblock / bpb, 1)?;
		}
		if postblock > end {
			self.rtmodify_summary(rtlog2(postblock - end), (end + 1) / bpb, 1)?;
		}
		self.rtmodify_range(start, len, false)
	}

	fn rttrim(len: u64, minlen: u64, maxlen: u64, prod: u32) -> Option<u32> {
		let mut len = len.min(maxlen);
		if prod > 1 {
			let k = len % prod as u64;
			if k != 0 && len - k >= minlen {
				len -= k;
			}
		}
		if len < minlen {
			None
		} else {
			Some(len as u32)
		}
	}

	/// Largest free run (at least `minlen`) starting inside bitmap
	/// block `bbno`.
	fn rtscan_block(
		&mut self,
		bbno: u64,
		minlen: u64,
		maxlen: u64,
		prod: u32,
	) -> IoResult<Option<(u64, u32)>> {
		let bpb = self.rt_bits_per_block();
		let rext = self.fs.sb.rextents;
		let lo = bbno * bpb;
		let hi = ((bbno + 1) * bpb).min(rext);
		let mut best: Option<(u64, u64)> = None;
		let mut rtx = lo;
		while rtx < hi {
			if self.rtbit(rtx)? {
				let rend = self.rtfind_forw(rtx, rext - 1)?;
				let rlen = rend - rtx + 1;
				if rlen >= minlen && best.map_or(true, |(_, bl)| rlen > bl) {
					best = Some((rtx, rlen));
				}
				rtx = rend + 1;
			} else {
				let fend = self.rtfind_forw(rtx, hi - 1)?;
				rtx = fend + 1;
			}
		}
		Ok(best.and_then(|(s, l)| Self::rttrim(l, minlen, maxlen, prod).map(|l| (s, l))))
	}

	fn rtalloc_exact(
		&mut self,
		bno: u64,
		minlen: u64,
		maxlen: u64,
		prod: u32,
	) -> IoResult<Option<(u64, u32)>> {
		if !self.rtbit(bno)? {
			return Ok(None);
		}
		let rext = self.fs.sb.rextents;
		let limit = (bno + maxlen - 1).min(rext - 1);
		let rend = self.rtfind_forw(bno, limit)?;
		let avail = rend - bno + 1;
		if avail < minlen {
			return Ok(None);
		}
		Ok(Self::rttrim(avail, minlen, maxlen, prod).map(|l| (bno, l)))
	}

	fn rtalloc_near(
		&mut self,
		bno: u64,
		minlen: u64,
		maxlen: u64,
		prod: u32,
	) -> IoResult<Option<(u64, u32)>> {
		let bpb = self.rt_bits_per_block();
		let nbb = self.fs.sb.rbmblocks as u64;
		let bbno = (bno / bpb).min(nbb - 1);
		for dist in 0..nbb {
			if bbno + dist < nbb {
				if let Some(r) = self.rtscan_block(bbno + dist, minlen, maxlen, prod)? {
					return Ok(Some(r));
				}
			}
			if dist > 0 && bbno >= dist {
				if let Some(r) = self.rtscan_block(bbno - dist, minlen, maxlen, prod)? {
					return Ok(Some(r));
				}
			}
		}
		Ok(None)
	}

	fn rtalloc_size(
		&mut self,
		minlen: u64,
		maxlen: u64,
		prod: u32,
	) -> IoResult<Option<(u64, u32)>> {
		let sumlevels = self.fs.sb.rextslog as u32 + 1;
		let nbb = self.fs.sb.rbmblocks as u64;
		// a level that guarantees a big-enough run
		for log in rtlog2(maxlen)..sumlevels {
			for bb in 0..nbb {
				if self.rtget_summary(log, bb)? == 0 {
					continue;
				}
				if let Some(r) = self.rtscan_block(bb, maxlen, maxlen, prod)? {
					return Ok(Some(r));
				}
			}
		}
		// nothing covers maxlen: work down toward minlen
		let lo = if minlen > 0 { rtlog2(minlen) } else { 0 };
		for log in (lo..rtlog2(maxlen).min(sumlevels)).rev() {
			for bb in 0..nbb {
				if self.rtget_summary(log, bb)? == 0 {
					continue;
				}
				let floor = (1u64 << log).max(minlen);
				if let Some(r) = self.rtscan_block(bb, floor, maxlen, prod)? {
					return Ok(Some(r));
				}
			}
		}
		Ok(None)
	}

	/// Allocate up to `maxlen` realtime extents.  `None` means no run
	/// of at least `minlen` exists.
	pub fn rtallocate_extent(
		&mut self,
		bno: u64,
		minlen: u64,
		maxlen: u64,
		atype: RtAllocType,
		prod: u32,
	) -> IoResult<Option<(u64, u32)>> {
		log::trace!("rtallocate_extent({bno}, {minlen}..{maxlen}, {atype:?})");
		let rext = self.fs.sb.rextents;
		if rext == 0 || minlen == 0 || minlen > maxlen || bno >= rext {
			return Err(err!(EINVAL));
		}
		let got = match atype {
			RtAllocType::Exact => self.rtalloc_exact(bno, minlen, maxlen, prod)?,
			RtAllocType::Near => self.rtalloc_near(bno, minlen, maxlen, prod)?,
			RtAllocType::Size => self.rtalloc_size(minlen, maxlen, prod)?,
		};
		if let Some((start, len)) = got {
			self.rtallocate_range(start, len as u64)?;
			self.mod_sb(SbField::Frextents, -(len as i64));
			Stats::bump(&self.fs.stats.rtallocs);
			log::debug!("rtallocate_extent: got ({start}, {len})");
		}
		Ok(got)
	}

	/// Free `len` realtime extents starting at `start`.
	pub fn rtfree_extent(&mut self, start: u64, len: u64) -> IoResult<()> {
		log::trace!("rtfree_extent({start}, {len})");
		let rext = self.fs.sb.rextents;
		if len == 0 || start + len > rext {
			return Err(err!(EINVAL));
		}
		self.rtfree_range(start, len)?;
		self.mod_sb(SbField::Frextents, len as i64);
		Stats::bump(&self.fs.stats.rtfrees);
		Ok(())
	}

	/// Free a block run of a realtime file, converting to extent units.
	pub(crate) fn rtfree_blocks(&mut self, fblk: FsBlock, flen: ExtLen) -> IoResult<()> {
		let rextsize = self.fs.sb.rextsize as u64;
		if fblk % rextsize != 0 || flen as u64 % rextsize != 0 {
			return Err(corrupt!("realtime free ({fblk}, {flen}) not extent-aligned"));
		}
		self.rtfree_extent(fblk / rextsize, flen as u64 / rextsize)
	}
}

/// After the static format: carve out the bitmap and summary inodes and
/// hand the whole realtime space to the allocator, which builds a
/// consistent bitmap and summary in the process.
pub(crate) fn rt_init<R: Backend>(fs: &mut Xfs<R>) -> IoResult<()> {
	let sb = fs.sb.clone();
	let bs = sb.blocksize as u64;
	let sumlevels = sb.rextslog as u64 + 1;
	let rsumblocks = (sumlevels * sb.rbmblocks as u64 * 4).div_ceil(bs);
	let res = (sb.rbmblocks as u64 + rsumblocks + 64) as u32;

	let mut tp = fs.trans_alloc(res)?;
	let mut rbm = tp.create_inode(sb.rootino, S_IFREG, true)?;
	let mut rsum = tp.create_inode(sb.rootino, S_IFREG, true)?;
	tp.fs.sb.rbmino = rbm.ino;
	tp.fs.sb.rsumino = rsum.ino;
	tp.log_sb();

	for b in 0..sb.rbmblocks as u64 {
		let maps = tp.bmapi(&mut rbm, b, 1, true, 1)?;
		let id = tp.get_buf(maps[0].startblock, 1)?;
		let l = tp.buf(id).data.len();
		tp.bfill(id, 0, l, 0);
	}
	rbm.core.size = sb.rbmblocks as u64 * bs;
	tp.log_inode(&rbm)?;

	for b in 0..rsumblocks {
		let maps = tp.bmapi(&mut rsum, b, 1, true, 1)?;
		let id = tp.get_buf(maps[0].startblock, 1)?;
		let l = tp.buf(id).data.len();
		tp.bfill(id, 0, l, 0);
	}
	rsum.core.size = rsumblocks * bs;
	tp.log_inode(&rsum)?;
	tp.commit()?;

	let mut tp = fs.trans_alloc(0)?;
	tp.rtfree_extent(0, sb.rextents)?;
	tp.commit()?;
	Ok(())
}

#[cfg(test)]
mod t {
	use super::*;
	use crate::xfs::{mkfs::MkfsParams, testutil::mkimg};

	fn rtimg() -> Xfs<std::io::Cursor<Vec<u8>>> {
		let p = MkfsParams {
			rextents: 64,
			rextsize: 1,
			..MkfsParams::default()
		};
		mkimg(&p)
	}

	#[test]
	fn mkfs_frees_the_whole_space() {
		let mut fs = rtimg();
		assert_eq!(fs.sb.frextents, 64);
		assert_eq!(fs.sb.rextslog, 6);
		let mut tp = fs.trans_alloc(0).unwrap();
		// one run of 64 extents, counted at its log2 bucket
		assert_eq!(tp.rtget_summary(6, 0).unwrap(), 1);
		assert!(tp.rtbit(0).unwrap());
		assert!(tp.rtbit(63).unwrap());
		tp.cancel();
	}

	#[test]
	fn size_allocate_and_free_cycle() {
		let mut fs = rtimg();
		let mut tp = fs.trans_alloc(0).unwrap();
		let got = tp
			.rtallocate_extent(0, 4, 4, RtAllocType::Size, 1)
			.unwrap();
		assert_eq!(got, Some((0, 4)));
		// the remaining run is 60 extents: bucket log2(60) = 5
		assert_eq!(tp.rtget_summary(6, 0).unwrap(), 0);
		assert_eq!(tp.rtget_summary(5, 0).unwrap(), 1);
		tp.commit().unwrap();
		assert_eq!(fs.sb.frextents, 60);

		let mut tp = fs.trans_alloc(0).unwrap();
		tp.rtfree_extent(0, 4).unwrap();
		assert_eq!(tp.rtget_summary(6, 0).unwrap(), 1);
		assert_eq!(tp.rtget_summary(5, 0).unwrap(), 0);
		tp.commit().unwrap();
		assert_eq!(fs.sb.frextents, 64);
	}

	#[test]
	fn exact_allocation() {
		let mut fs = rtimg();
		let mut tp = fs.trans_alloc(0).unwrap();
		let got = tp
			.rtallocate_extent(10, 4, 4, RtAllocType::Exact, 1)
			.unwrap();
		assert_eq!(got, Some((10, 4)));
		// busy now
		let got = tp
			.rtallocate_extent(12, 1, 1, RtAllocType::Exact, 1)
			.unwrap();
		assert_eq!(got, None);
		// freeing the middle of it back merges with nothing
		tp.rtfree_extent(11, 2).unwrap();
		let e = tp.rtfree_extent(11, 1).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(crate::EFSCORRUPTED));
		tp.cancel();
	}

	#[test]
	fn near_allocation_walks_outward() {
		let mut fs = rtimg();
		let mut tp = fs.trans_alloc(0).unwrap();
		// pin down everything but [20, 28)
		assert!(tp
			.rtallocate_extent(0, 20, 20, RtAllocType::Exact, 1)
			.unwrap()
			.is_some());
		assert!(tp
			.rtallocate_extent(28, 36, 36, RtAllocType::Exact, 1)
			.unwrap()
			.is_some());
		let got = tp
			.rtallocate_extent(5, 2, 2, RtAllocType::Near, 1)
			.unwrap();
		assert_eq!(got, Some((20, 2)));
		tp.commit().unwrap();
		assert_eq!(fs.sb.frextents, 64 - 20 - 36 - 2);
	}

	#[test]
	fn realtime_file_mapping() {
		let mut fs = rtimg();
		let root = fs.sb.rootino;
		let frext0 = fs.sb.frextents;
		let fdblocks0 = fs.sb.fdblocks;

		let mut tp = fs.trans_alloc(64).unwrap();
		let mut ip = tp.create_inode(root, S_IFREG | 0o644, false).unwrap();
		ip.core.flags |= DIFLAG_REALTIME;
		tp.log_inode(&ip).unwrap();
		let maps = tp.bmapi(&mut ip, 0, 4, true, 4).unwrap();
		tp.commit().unwrap();

		assert_eq!(maps.iter().map(|m| m.blockcount as u64).sum::<u64>(), 4);
		assert_eq!(fs.sb.frextents, frext0 - 4);
		// realtime data does not come out of the data section
		assert_eq!(fs.sb.fdblocks, fdblocks0);

		let mut tp = fs.trans_alloc(0).unwrap();
		tp.bunmapi(&mut ip, 0, 4).unwrap();
		tp.commit().unwrap();
		assert_eq!(fs.sb.frextents, frext0);
		assert_eq!(ip.core.nblocks, 0);
	}
}
