use std::io::{Error as IoError, Result as IoResult};

use super::{
	alloc_btree::{AllocBt, BtNum},
	btree::{Cursor, LookupDir},
	trans::SbField,
	*,
};
use crate::{corrupt, err};

/// Allocation strategy, per §"allocator mode" of the on-disk contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocType {
	/// Rotor across all AGs, size-directed inside each.
	AnyAg,
	/// Like `AnyAg` but starting at AG 0.
	FirstAg,
	/// Like `AnyAg` but starting at the target's AG.
	StartAg,
	/// Size-directed within the target's AG only.
	ThisAg,
	/// Near the target block, falling back to a rotor sweep.
	StartBno,
	/// Near the target block, in its AG only.
	NearBno,
	/// Exactly at the target block or not at all.
	ThisBno,
}

/// Arguments and results of one extent allocation.
#[derive(Debug, Clone)]
pub struct AllocArg {
	/// Target block going in; the result (or `NULLFSBLOCK`) coming out.
	pub fsbno: FsBlock,
	/// Result length.
	pub len: ExtLen,
	pub atype: AllocType,
	pub minlen: ExtLen,
	pub maxlen: ExtLen,
	/// Length congruence: the result satisfies `len % prod == mod_`
	/// when it can be trimmed without dropping under `minlen`.
	pub mod_: ExtLen,
	pub prod: ExtLen,
	/// Free blocks that must remain in the AG after the allocation.
	pub minleft: ExtLen,
	/// Total space required for the whole operation, for AG selection.
	pub total: ExtLen,
	/// Allocating on behalf of the freelist itself.
	pub isfl: bool,
	/// Converting a delayed allocation.
	pub wasdel: bool,
	/// User data rather than metadata.
	pub userdata: bool,
}

impl AllocArg {
	pub fn new(atype: AllocType, fsbno: FsBlock, minlen: ExtLen, maxlen: ExtLen) -> Self {
		Self {
			fsbno,
			len: 0,
			atype,
			minlen,
			maxlen,
			mod_: 0,
			prod: 1,
			minleft: 0,
			total: 0,
			isfl: false,
			wasdel: false,
			userdata: false,
		}
	}

	/// Whether the allocation produced an extent.
	pub fn ok(&self) -> bool {
		self.fsbno != NULLFSBLOCK
	}

	fn fix_len(&mut self) {
		self.len = fix_len(self.len, self.minlen, self.maxlen, self.mod_, self.prod);
	}
}

/// Trim `len` so that `len % prod == mod_`, never going below `minlen`.
/// Left alone when it already fits, hits `maxlen`, or cannot be fixed.
fn fix_len(len: ExtLen, minlen: ExtLen, maxlen: ExtLen, mod_: ExtLen, prod: ExtLen) -> ExtLen {
	debug_assert!(prod == 0 || mod_ < prod);
	if prod <= 1 || len < mod_ || len == maxlen || (mod_ == 0 && len < prod) {
		return len;
	}
	let k = len % prod;
	if k == mod_ {
		return len;
	}
	let nlen = if k > mod_ {
		len - (k - mod_)
	} else {
		match (len + mod_).checked_sub(prod + k) {
			Some(v) => v,
			None => return len,
		}
	};
	if nlen < minlen {
		len
	} else {
		nlen
	}
}

/// Where inside `[freebno, freebno+freelen)` an extent of `wantlen`
/// lands, aiming at `wantbno`: the target itself if it fits, else the
/// nearest edge.  Returns `(distance, start)`.
fn compute_diff(
	wantbno: AgBlock,
	wantlen: ExtLen,
	freebno: AgBlock,
	freelen: ExtLen,
) -> (ExtLen, AgBlock) {
	let freeend = freebno + freelen;
	let wantend = wantbno + wantlen;
	let newbno = if freebno >= wantbno {
		freebno
	} else if freeend >= wantend {
		wantbno
	} else {
		freeend - wantlen
	};
	(newbno.abs_diff(wantbno), newbno)
}

pub(crate) fn min_freelist(levels: &[u32; 2], maxlevels: usize) -> u32 {
	let m = maxlevels as u32;
	(levels[BTNUM_BNO] + 1).min(m) + (levels[BTNUM_CNT] + 1).min(m)
}

/// Can this AG satisfy (minlen, minleft, total) while keeping its
/// freelist at `need`?
fn freelist_ok(
	freeblks: ExtLen,
	flcount: u32,
	longest: ExtLen,
	need: u32,
	minlen: ExtLen,
	minleft: ExtLen,
	total: ExtLen,
) -> bool {
	let longest_avail = if longest > need {
		longest - need
	} else {
		(flcount > 0 || longest > 0) as ExtLen
	};
	if minlen > longest_avail {
		return false;
	}
	if minleft > 0
		&& (freeblks as i64 + flcount as i64 - need as i64 - total as i64) < minleft as i64
	{
		return false;
	}
	true
}

impl<'a, R: Backend> Trans<'a, R> {
	// freelist ---------------------------------------------------------

	/// Pop the head block off the AGFL ring.
	pub(crate) fn alloc_get_freelist(
		&mut self,
		agno: AgNumber,
		agf: BufId,
	) -> IoResult<Option<AgBlock>> {
		let mut agf_s = self.agf(agf)?;
		if agf_s.flcount == 0 {
			return Ok(None);
		}
		let agfl = self.read_agfl(agno)?;
		let bno: AgBlock = self.bread(agfl, 4 * agf_s.flfirst as usize)?;
		if bno >= agf_s.length {
			return Err(corrupt!("AG{agno}: freelist block {bno} out of range"));
		}
		agf_s.flfirst = (agf_s.flfirst + 1) % self.fs.sb.agfl_size();
		agf_s.flcount -= 1;
		self.log_agf(agf, &agf_s)?;
		log::trace!("get_freelist(ag={agno}) = {bno}");
		Ok(Some(bno))
	}

	/// Push a block onto the AGFL ring.
	pub(crate) fn alloc_put_freelist(
		&mut self,
		agno: AgNumber,
		agf: BufId,
		bno: AgBlock,
	) -> IoResult<()> {
		let mut agf_s = self.agf(agf)?;
		let size = self.fs.sb.agfl_size();
		if agf_s.flcount >= size {
			return Err(corrupt!("AG{agno}: freelist ring overflow"));
		}
		let agfl = self.read_agfl(agno)?;
		agf_s.fllast = (agf_s.fllast + 1) % size;
		self.bwrite(agfl, 4 * agf_s.fllast as usize, &bno)?;
		agf_s.flcount += 1;
		self.log_agf(agf, &agf_s)?;
		log::trace!("put_freelist(ag={agno}, bno={bno})");
		Ok(())
	}

	/// Bring the AG's freelist to its required size, trimming or
	/// refilling as needed.  `None` means the AG cannot satisfy the
	/// request and should be skipped.
	///
	/// The freelist pre-pays the blocks the free-space trees themselves
	/// need to grow, so that a split never recurses into the allocator
	/// it is part of.
	pub(crate) fn fix_freelist(
		&mut self,
		agno: AgNumber,
		minlen: ExtLen,
		minleft: ExtLen,
		total: ExtLen,
		trylock: bool,
	) -> IoResult<Option<BufId>> {
		// With the engine externally synchronized the AGF is never
		// contended; TRYLOCK only shapes the selector's two passes.
		let _ = trylock;

		let maxlev = self.fs.ag_maxlevels;
		{
			let pag = self.fs.perag(agno);
			if pag.pagf_init {
				let need = min_freelist(&pag.levels, maxlev);
				if !freelist_ok(
					pag.freeblks,
					pag.flcount,
					pag.longest,
					need,
					minlen,
					minleft,
					total,
				) {
					return Ok(None);
				}
			}
		}

		let agf = self.read_agf(agno)?;
		let mut agf_s = self.agf(agf)?;
		let need = min_freelist(&agf_s.levels, maxlev);
		if !freelist_ok(
			agf_s.freeblks,
			agf_s.flcount,
			agf_s.longest,
			need,
			minlen,
			minleft,
			total,
		) {
			return Ok(None);
		}

		// Too long: hand blocks back to the trees.  A block moving off
		// the freelist must not be reusable before the move is on disk,
		// so the transaction goes synchronous.
		while agf_s.flcount > need {
			let Some(bno) = self.alloc_get_freelist(agno, agf)? else {
				return Err(corrupt!("AG{agno}: flcount and ring disagree"));
			};
			self.free_ag_extent(agno, agf, bno, 1, true)?;
			let fsb = self.fs.sb.agb_to_fsb(agno, bno);
			let bp = self.read_buf(fsb, 1)?;
			self.binval(bp);
			self.set_sync();
			agf_s = self.agf(agf)?;
		}

		// Too short: allocate into the ring.
		while agf_s.flcount < need {
			let mut args = AllocArg::new(
				AllocType::ThisAg,
				self.fs.sb.agb_to_fsb(agno, 0),
				1,
				need - agf_s.flcount,
			);
			args.isfl = true;
			if !self.ag_vextent(&mut args, agno, agf, AllocType::ThisAg)? {
				break;
			}
			let agbno = self.fs.sb.fsb_to_agbno(args.fsbno);
			for b in 0..args.len {
				self.alloc_put_freelist(agno, agf, agbno + b)?;
			}
			self.set_sync();
			agf_s = self.agf(agf)?;
		}
		Ok(Some(agf))
	}

	/// One block for the inode tree, from this AG's general free space.
	pub(crate) fn ag_alloc_block(&mut self, agno: AgNumber) -> IoResult<Option<AgBlock>> {
		let Some(agf) = self.fix_freelist(agno, 1, 0, 0, false)? else {
			return Ok(None);
		};
		let mut args = AllocArg::new(AllocType::ThisAg, self.fs.sb.agb_to_fsb(agno, 0), 1, 1);
		if !self.ag_vextent(&mut args, agno, agf, AllocType::ThisAg)? {
			return Ok(None);
		}
		Ok(Some(self.fs.sb.fsb_to_agbno(args.fsbno)))
	}

	// per-AG allocation ------------------------------------------------

	/// Allocate within one AG, routing on `atype` and updating the AGF
	/// counters.  `false` means no space.
	pub(crate) fn ag_vextent(
		&mut self,
		a: &mut AllocArg,
		agno: AgNumber,
		agf: BufId,
		atype: AllocType,
	) -> IoResult<bool> {
		let got = match atype {
			AllocType::ThisBno => self.ag_vextent_exact(a, agno, agf)?,
			AllocType::NearBno => self.ag_vextent_near(a, agno, agf)?,
			_ => self.ag_vextent_size(a, agno, agf)?,
		};
		let Some((bno, len)) = got else {
			a.fsbno = NULLFSBLOCK;
			a.len = 0;
			return Ok(false);
		};

		let mut agf_s = self.agf(agf)?;
		if len > agf_s.freeblks {
			return Err(corrupt!("AG{agno}: allocated past freeblks"));
		}
		agf_s.freeblks -= len;
		self.log_agf(agf, &agf_s)?;
		self.update_longest(agno, agf)?;
		if !a.isfl {
			self.mod_sb(SbField::Fdblocks, -(len as i64));
		}
		a.fsbno = self.fs.sb.agb_to_fsb(agno, bno);
		a.len = len;
		Stats::bump(&self.fs.stats.allocs);
		log::debug!("ag_vextent({atype:?}, ag={agno}): got bno={bno} len={len}");
		Ok(true)
	}

	/// `THIS_BNO`: the requested range or nothing.
	fn ag_vextent_exact(
		&mut self,
		a: &mut AllocArg,
		agno: AgNumber,
		agf: BufId,
	) -> IoResult<Option<(AgBlock, ExtLen)>> {
		let tbno = self.fs.sb.fsb_to_agbno(a.fsbno);
		let mut bcur = Cursor::new(AllocBt {
			agno,
			agf,
			which: BtNum::Bno,
		});
		if !bcur.lookup(
			self,
			LookupDir::Le,
			AllocRec {
				startblock: tbno,
				blockcount: 0,
			},
		)? {
			return Ok(None);
		}
		let frec = bcur.get_rec(self)?;
		debug_assert!(frec.startblock <= tbno);
		let fend = frec.startblock + frec.blockcount;
		if fend < tbno + a.minlen {
			return Ok(None);
		}
		a.len = fend.min(tbno + a.maxlen) - tbno;
		a.fix_len();
		if !self.fix_minleft(a, agf)? {
			return Ok(None);
		}
		let rlen = a.len;
		self.fixup_trees(agno, agf, frec, tbno, rlen)?;
		Ok(Some((tbno, rlen)))
	}

	/// `THIS_AG`: the smallest extent that covers `maxlen`, or the
	/// largest one at all with `maxlen` trimmed down to it.
	fn ag_vextent_size(
		&mut self,
		a: &mut AllocArg,
		agno: AgNumber,
		agf: BufId,
	) -> IoResult<Option<(AgBlock, ExtLen)>> {
		let mut ccur = Cursor::new(AllocBt {
			agno,
			agf,
			which: BtNum::Cnt,
		});
		let frec;
		if ccur.lookup(
			self,
			LookupDir::Ge,
			AllocRec {
				startblock: 0,
				blockcount: a.maxlen,
			},
		)? {
			frec = ccur.get_rec(self)?;
			a.len = a.maxlen;
		} else {
			// nothing that big; take the largest there is
			if !ccur.lookup(
				self,
				LookupDir::Le,
				AllocRec {
					startblock: NULLAGBLOCK,
					blockcount: ExtLen::MAX,
				},
			)? {
				return Ok(None);
			}
			frec = ccur.get_rec(self)?;
			if frec.blockcount < a.minlen {
				return Ok(None);
			}
			a.len = frec.blockcount;
		}
		a.fix_len();
		if a.len < a.minlen {
			return Ok(None);
		}
		if !self.fix_minleft(a, agf)? {
			return Ok(None);
		}
		let rlen = a.len;
		self.fixup_trees(agno, agf, frec, frec.startblock, rlen)?;
		Ok(Some((frec.startblock, rlen)))
	}

	/// `NEAR_BNO`: minimize the distance between the target block and
	/// the result.
	fn ag_vextent_near(
		&mut self,
		a: &mut AllocArg,
		agno: AgNumber,
		agf: BufId,
	) -> IoResult<Option<(AgBlock, ExtLen)>> {
		let tbno = self.fs.sb.fsb_to_agbno(a.fsbno);

		let mut ccur = Cursor::new(AllocBt {
			agno,
			agf,
			which: BtNum::Cnt,
		});
		let found = ccur.lookup(
			self,
			LookupDir::Ge,
			AllocRec {
				startblock: 0,
				blockcount: a.maxlen,
			},
		)?;

		// First algorithm: every extent worth looking at sits in the
		// rightmost by-cnt leaf; scan that leaf for the closest.
		if !found {
			if !ccur.lookup(
				self,
				LookupDir::Le,
				AllocRec {
					startblock: NULLAGBLOCK,
					blockcount: ExtLen::MAX,
				},
			)? {
				return Ok(None); // no free space at all
			}
			ccur.rewind_in_block();
		}
		if ccur.is_rightmost_block(self)? {
			let mut best: Option<(ExtLen, AgBlock, ExtLen, AllocRec)> = None;
			loop {
				let r = ccur.get_rec(self)?;
				if r.blockcount >= a.minlen {
					let rlen = fix_len(
						r.blockcount.min(a.maxlen),
						a.minlen,
						a.maxlen,
						a.mod_,
						a.prod,
					);
					if rlen >= a.minlen {
						let (diff, newbno) = compute_diff(tbno, rlen, r.startblock, r.blockcount);
						if best.map_or(true, |(bd, ..)| diff < bd) {
							best = Some((diff, newbno, rlen, r));
						}
					}
				}
				if !ccur.increment(self, 0)? {
					break;
				}
			}
			let Some((_, newbno, rlen, frec)) = best else {
				return Ok(None);
			};
			a.len = rlen;
			if !self.fix_minleft(a, agf)? {
				return Ok(None);
			}
			let rlen = a.len;
			self.fixup_trees(agno, agf, frec, newbno, rlen)?;
			return Ok(Some((newbno, rlen)));
		}

		// Second algorithm: walk two by-bno cursors outward from the
		// target, each stopping at its first big-enough extent.
		let candidate = |r: AllocRec| -> Option<(ExtLen, AgBlock, ExtLen, AllocRec)> {
			if r.blockcount < a.minlen {
				return None;
			}
			let rlen = fix_len(
				r.blockcount.min(a.maxlen),
				a.minlen,
				a.maxlen,
				a.mod_,
				a.prod,
			);
			if rlen < a.minlen {
				return None;
			}
			let (diff, newbno) = compute_diff(tbno, rlen, r.startblock, r.blockcount);
			Some((diff, newbno, rlen, r))
		};

		let mut lbest = None;
		let mut lcur = Cursor::new(AllocBt {
			agno,
			agf,
			which: BtNum::Bno,
		});
		let mut have = lcur.lookup(
			self,
			LookupDir::Le,
			AllocRec {
				startblock: tbno,
				blockcount: 0,
			},
		)?;
		while have {
			let r = lcur.get_rec(self)?;
			lbest = candidate(r);
			if lbest.is_some() {
				break;
			}
			have = lcur.decrement(self, 0)?;
		}

		let mut rbest = None;
		let mut rcur = Cursor::new(AllocBt {
			agno,
			agf,
			which: BtNum::Bno,
		});
		let mut have = rcur.lookup(
			self,
			LookupDir::Ge,
			AllocRec {
				startblock: tbno + 1,
				blockcount: 0,
			},
		)?;
		while have {
			let r = rcur.get_rec(self)?;
			rbest = candidate(r);
			if rbest.is_some() {
				break;
			}
			have = rcur.increment(self, 0)?;
		}

		// the leftward cursor is examined first; it wins ties
		let best = match (lbest, rbest) {
			(Some(l), Some(r)) => {
				if l.0 <= r.0 {
					Some(l)
				} else {
					Some(r)
				}
			}
			(l, r) => l.or(r),
		};
		let Some((_, newbno, rlen, frec)) = best else {
			return Ok(None);
		};
		a.len = rlen;
		if !self.fix_minleft(a, agf)? {
			return Ok(None);
		}
		let rlen = a.len;
		self.fixup_trees(agno, agf, frec, newbno, rlen)?;
		Ok(Some((newbno, rlen)))
	}

	/// Shrink the result if the AG would drop under `minleft` free
	/// blocks; give up when that falls under `minlen`.
	fn fix_minleft(&mut self, a: &mut AllocArg, agf: BufId) -> IoResult<bool> {
		if a.minleft == 0 {
			return Ok(true);
		}
		let agf_s = self.agf(agf)?;
		let diff = agf_s.freeblks as i64 + agf_s.flcount as i64
			- a.len as i64
			- a.minleft as i64;
		if diff >= 0 {
			return Ok(true);
		}
		let nlen = a.len as i64 + diff;
		if nlen >= a.minlen as i64 {
			a.len = nlen as ExtLen;
			Ok(true)
		} else {
			a.fsbno = NULLFSBLOCK;
			Ok(false)
		}
	}

	/// Carve `[rbno, rbno+rlen)` out of the free extent `frec`,
	/// rewriting both trees.
	fn fixup_trees(
		&mut self,
		agno: AgNumber,
		agf: BufId,
		frec: AllocRec,
		rbno: AgBlock,
		rlen: ExtLen,
	) -> IoResult<()> {
		let fbno = frec.startblock;
		let flen = frec.blockcount;
		assert!(fbno <= rbno && rbno + rlen <= fbno + flen);

		let head = (rbno > fbno).then_some(AllocRec {
			startblock: fbno,
			blockcount: rbno - fbno,
		});
		let tail = (rbno + rlen < fbno + flen).then_some(AllocRec {
			startblock: rbno + rlen,
			blockcount: fbno + flen - rbno - rlen,
		});

		// by-cnt: out with the old record, in with the remainders
		let mut ccur = Cursor::new(AllocBt {
			agno,
			agf,
			which: BtNum::Cnt,
		});
		if !ccur.lookup(self, LookupDir::Eq, frec)? {
			return Err(corrupt!(
				"AG{agno}: extent ({fbno},{flen}) missing from the by-cnt tree"
			));
		}
		ccur.delete(self)?;
		for nrec in [head, tail].into_iter().flatten() {
			if ccur.lookup(self, LookupDir::Eq, nrec)? {
				return Err(corrupt!("AG{agno}: duplicate extent in the by-cnt tree"));
			}
			ccur.insert(self, nrec)?;
		}

		// by-bno: rewrite in place, inserting the tail if both ends stay
		let mut bcur = Cursor::new(AllocBt {
			agno,
			agf,
			which: BtNum::Bno,
		});
		if !bcur.lookup(
			self,
			LookupDir::Eq,
			AllocRec {
				startblock: fbno,
				blockcount: 0,
			},
		)? {
			return Err(corrupt!(
				"AG{agno}: extent ({fbno},{flen}) missing from the by-bno tree"
			));
		}
		match (head, tail) {
			(None, None) => bcur.delete(self)?,
			(Some(h), None) => bcur.update(self, &h)?,
			(None, Some(t)) => bcur.update(self, &t)?,
			(Some(h), Some(t)) => {
				bcur.update(self, &h)?;
				if bcur.lookup(self, LookupDir::Eq, t)? {
					return Err(corrupt!("AG{agno}: duplicate extent in the by-bno tree"));
				}
				bcur.insert(self, t)?;
			}
		}
		Ok(())
	}

	/// Refresh the cached longest-free-extent from the by-cnt tree.
	fn update_longest(&mut self, agno: AgNumber, agf: BufId) -> IoResult<()> {
		let mut ccur = Cursor::new(AllocBt {
			agno,
			agf,
			which: BtNum::Cnt,
		});
		let longest = if ccur.lookup(
			self,
			LookupDir::Le,
			AllocRec {
				startblock: NULLAGBLOCK,
				blockcount: ExtLen::MAX,
			},
		)? {
			ccur.get_rec(self)?.blockcount
		} else {
			0
		};
		let mut agf_s = self.agf(agf)?;
		if agf_s.longest != longest {
			agf_s.longest = longest;
			self.log_agf(agf, &agf_s)?;
		}
		Ok(())
	}

	/// Return `[bno, bno+len)` to the AG, coalescing with both
	/// neighbors.  A range already (partly) free is corruption.
	pub(crate) fn free_ag_extent(
		&mut self,
		agno: AgNumber,
		agf: BufId,
		bno: AgBlock,
		len: ExtLen,
		isfl: bool,
	) -> IoResult<()> {
		log::trace!("free_ag_extent(ag={agno}, bno={bno}, len={len}, isfl={isfl})");
		let mut bcur = Cursor::new(AllocBt {
			agno,
			agf,
			which: BtNum::Bno,
		});

		// left neighbor
		let mut left: Option<AllocRec> = None;
		let had_left = bcur.lookup(
			self,
			LookupDir::Le,
			AllocRec {
				startblock: bno,
				blockcount: 0,
			},
		)?;
		if had_left {
			let r = bcur.get_rec(self)?;
			if r.startblock + r.blockcount > bno {
				return Err(corrupt!(
					"AG{agno}: freeing ({bno},{len}) overlapping free ({},{})",
					r.startblock,
					r.blockcount
				));
			}
			if r.startblock + r.blockcount == bno {
				left = Some(r);
			}
		}

		// right neighbor
		let mut right: Option<AllocRec> = None;
		let have = if had_left {
			bcur.increment(self, 0)?
		} else {
			bcur.lookup(
				self,
				LookupDir::Ge,
				AllocRec {
					startblock: bno,
					blockcount: 0,
				},
			)?
		};
		if have {
			let r = bcur.get_rec(self)?;
			if r.startblock < bno + len {
				return Err(corrupt!(
					"AG{agno}: freeing ({bno},{len}) overlapping free ({},{})",
					r.startblock,
					r.blockcount
				));
			}
			if r.startblock == bno + len {
				right = Some(r);
			}
		}

		let nbno = left.map_or(bno, |l| l.startblock);
		let nlen = left.map_or(0, |l| l.blockcount) + len + right.map_or(0, |r| r.blockcount);
		let nrec = AllocRec {
			startblock: nbno,
			blockcount: nlen,
		};

		// by-cnt: merged neighbors go away, the combined record arrives
		let mut ccur = Cursor::new(AllocBt {
			agno,
			agf,
			which: BtNum::Cnt,
		});
		for m in [left, right].into_iter().flatten() {
			if !ccur.lookup(self, LookupDir::Eq, m)? {
				return Err(corrupt!("AG{agno}: trees out of step on ({m:?})"));
			}
			ccur.delete(self)?;
		}
		if ccur.lookup(self, LookupDir::Eq, nrec)? {
			return Err(corrupt!("AG{agno}: duplicate extent in the by-cnt tree"));
		}
		ccur.insert(self, nrec)?;

		// by-bno
		match (left, right) {
			(Some(_), Some(r)) => {
				// drop the right record, widen the left one
				if !bcur.lookup(
					self,
					LookupDir::Eq,
					AllocRec {
						startblock: r.startblock,
						blockcount: 0,
					},
				)? {
					return Err(corrupt!("AG{agno}: right neighbor vanished"));
				}
				bcur.delete(self)?;
				if !bcur.lookup(
					self,
					LookupDir::Eq,
					AllocRec {
						startblock: nbno,
						blockcount: 0,
					},
				)? {
					return Err(corrupt!("AG{agno}: left neighbor vanished"));
				}
				bcur.update(self, &nrec)?;
			}
			(Some(_), None) | (None, Some(_)) => {
				let old = if left.is_some() {
					nbno
				} else {
					right.map(|r| r.startblock).expect("right neighbor present")
				};
				if !bcur.lookup(
					self,
					LookupDir::Eq,
					AllocRec {
						startblock: old,
						blockcount: 0,
					},
				)? {
					return Err(corrupt!("AG{agno}: neighbor vanished"));
				}
				bcur.update(self, &nrec)?;
			}
			(None, None) => {
				if bcur.lookup(
					self,
					LookupDir::Eq,
					AllocRec {
						startblock: nbno,
						blockcount: 0,
					},
				)? {
					return Err(corrupt!("AG{agno}: duplicate extent in the by-bno tree"));
				}
				bcur.insert(self, nrec)?;
			}
		}

		// counters
		let mut agf_s = self.agf(agf)?;
		agf_s.freeblks += len;
		if agf_s.freeblks > agf_s.length {
			return Err(corrupt!("AG{agno}: freeblks ran past the AG size"));
		}
		self.log_agf(agf, &agf_s)?;
		self.update_longest(agno, agf)?;
		if !isfl {
			self.mod_sb(SbField::Fdblocks, len as i64);
		}
		Stats::bump(&self.fs.stats.frees);
		Ok(())
	}

	// filesystem-level entry points ------------------------------------

	/// Allocate an extent, choosing the AG per `a.atype`.  No space is
	/// not an error: the result is `NULLFSBLOCK`.
	pub fn alloc_vextent(&mut self, a: &mut AllocArg) -> IoResult<()> {
		log::trace!(
			"alloc_vextent({:?}, fsbno={:#x}, minlen={}, maxlen={})",
			a.atype,
			a.fsbno,
			a.minlen,
			a.maxlen
		);
		let sb = &self.fs.sb;
		let agcount = sb.agcount;
		a.maxlen = a.maxlen.min(sb.agblocks - AG_RESERVED_BLOCKS);
		if a.minlen == 0 || a.minlen > a.maxlen || a.prod == 0 || a.mod_ >= a.prod.max(1) {
			return Err(err!(EINVAL));
		}

		match a.atype {
			AllocType::ThisAg | AllocType::ThisBno | AllocType::NearBno => {
				let agno = sb.fsb_to_agno(a.fsbno);
				if agno >= agcount {
					return Err(err!(EINVAL));
				}
				match self.fix_freelist(agno, a.minlen, a.minleft, a.total, false)? {
					None => {
						a.fsbno = NULLFSBLOCK;
						a.len = 0;
					}
					Some(agf) => {
						let atype = a.atype;
						self.ag_vextent(a, agno, agf, atype)?;
					}
				}
			}
			AllocType::AnyAg | AllocType::StartAg | AllocType::FirstAg | AllocType::StartBno => {
				let startag = match a.atype {
					AllocType::AnyAg => self.fs.agfrotor,
					AllocType::FirstAg => 0,
					_ => sb.fsb_to_agno(a.fsbno).min(agcount - 1),
				};
				let near_hint = (a.atype == AllocType::StartBno).then_some(startag);
				let rotate = matches!(a.atype, AllocType::AnyAg | AllocType::StartAg);
				let mut agno = startag;
				let mut trylock = true;
				loop {
					if let Some(agf) =
						self.fix_freelist(agno, a.minlen, a.minleft, a.total, trylock)?
					{
						let atype = if near_hint == Some(agno) {
							AllocType::NearBno
						} else {
							AllocType::ThisAg
						};
						if self.ag_vextent(a, agno, agf, atype)? {
							if rotate {
								self.fs.agfrotor = (agno + 1) % agcount;
							}
							return Ok(());
						}
					}
					agno = (agno + 1) % agcount;
					if agno == startag {
						if trylock {
							trylock = false;
						} else {
							break;
						}
					}
				}
				a.fsbno = NULLFSBLOCK;
				a.len = 0;
			}
		}
		Ok(())
	}

	/// Free an extent anywhere in the filesystem.
	pub fn free_extent(&mut self, fsbno: FsBlock, len: ExtLen) -> IoResult<()> {
		let sb = &self.fs.sb;
		let agno = sb.fsb_to_agno(fsbno);
		let agbno = sb.fsb_to_agbno(fsbno);
		if len == 0 || agno >= sb.agcount || agbno as u64 + len as u64 > sb.agblocks as u64 {
			return Err(err!(EINVAL));
		}
		// minlen 0: the fix can only refuse on corruption
		let Some(agf) = self.fix_freelist(agno, 0, 0, 0, false)? else {
			return Err(corrupt!("AG{agno}: cannot maintain the freelist"));
		};
		self.free_ag_extent(agno, agf, agbno, len, false)
	}
}

impl<R: Backend> Xfs<R> {
	/// Verify the free-space metadata of one AG: the cached counters
	/// against the trees, tree correspondence, non-adjacency and the
	/// freelist ring.
	pub fn check_ag(&mut self, agno: AgNumber) -> IoResult<()> {
		let mut tp = self.trans_alloc(0)?;
		let agf = tp.read_agf(agno)?;
		let agf_s = tp.agf(agf)?;

		let mut bno_recs = Vec::new();
		let mut bcur = Cursor::new(AllocBt {
			agno,
			agf,
			which: BtNum::Bno,
		});
		if bcur.lookup(
			&mut tp,
			LookupDir::Ge,
			AllocRec {
				startblock: 0,
				blockcount: 0,
			},
		)? {
			loop {
				bno_recs.push(bcur.get_rec(&tp)?);
				if !bcur.increment(&mut tp, 0)? {
					break;
				}
			}
		}

		let sum: u64 = bno_recs.iter().map(|r| r.blockcount as u64).sum();
		if sum != agf_s.freeblks as u64 {
			return Err(corrupt!(
				"AG{agno}: freeblks {} != tree total {sum}",
				agf_s.freeblks
			));
		}
		let max = bno_recs.iter().map(|r| r.blockcount).max().unwrap_or(0);
		if max != agf_s.longest {
			return Err(corrupt!("AG{agno}: longest {} != {max}", agf_s.longest));
		}
		for w in bno_recs.windows(2) {
			if w[0].startblock + w[0].blockcount >= w[1].startblock {
				return Err(corrupt!(
					"AG{agno}: adjacent or overlapping free extents {w:?}"
				));
			}
		}

		let mut cnt_recs = Vec::new();
		let mut ccur = Cursor::new(AllocBt {
			agno,
			agf,
			which: BtNum::Cnt,
		});
		if ccur.lookup(
			&mut tp,
			LookupDir::Ge,
			AllocRec {
				startblock: 0,
				blockcount: 0,
			},
		)? {
			loop {
				cnt_recs.push(ccur.get_rec(&tp)?);
				if !ccur.increment(&mut tp, 0)? {
					break;
				}
			}
		}
		cnt_recs.sort_by_key(|r| r.startblock);
		if cnt_recs != bno_recs {
			return Err(corrupt!("AG{agno}: by-bno and by-cnt trees disagree"));
		}

		// the freelist ring: in-bounds entries, count within the ring,
		// and never larger than its required size plus the drain one
		// tree operation may cause before the next fix
		if agf_s.flcount > tp.fs.sb.agfl_size() {
			return Err(corrupt!("AG{agno}: freelist count overflows the ring"));
		}
		let agfl = tp.read_agfl(agno)?;
		let size = tp.fs.sb.agfl_size();
		for i in 0..agf_s.flcount {
			let slot = (agf_s.flfirst + i) % size;
			let bno: AgBlock = tp.bread(agfl, 4 * slot as usize)?;
			if bno < AG_RESERVED_BLOCKS || bno >= agf_s.length {
				return Err(corrupt!("AG{agno}: freelist entry {bno} out of range"));
			}
		}
		tp.cancel();
		Ok(())
	}
}

#[cfg(test)]
mod t {
	use super::*;
	use crate::xfs::{mkfs::MkfsParams, testutil::mkimg};

	#[test]
	fn fix_len_congruence() {
		// len = k * prod + mod
		assert_eq!(fix_len(100, 10, 100, 0, 1), 100);
		assert_eq!(fix_len(100, 10, 200, 3, 8), 99);
		assert_eq!(fix_len(99, 10, 200, 3, 8), 99);
		assert_eq!(fix_len(98, 10, 200, 3, 8), 91);
		// at maxlen it is left alone
		assert_eq!(fix_len(100, 10, 100, 3, 8), 100);
		// mod == 0 and shorter than prod: left for the caller to retry
		assert_eq!(fix_len(5, 1, 100, 0, 8), 5);
		// would drop under minlen: unchanged
		assert_eq!(fix_len(10, 9, 100, 7, 8), 10);
	}

	#[test]
	fn diff_policy() {
		// target inside the extent: exact hit
		assert_eq!(compute_diff(50, 5, 40, 20), (0, 50));
		// free extent entirely to the right
		assert_eq!(compute_diff(50, 5, 100, 5), (50, 100));
		// free extent to the left: nearest edge
		assert_eq!(compute_diff(50, 5, 10, 5), (40, 10));
		// overlapping but too short at the target: slide back
		assert_eq!(compute_diff(50, 10, 45, 12), (3, 47));
	}

	fn one_ag() -> MkfsParams {
		MkfsParams {
			agcount: 1,
			agblocks: 1000,
			..MkfsParams::default()
		}
	}

	/// Fresh AG, exact allocation, free restores everything.
	#[test]
	fn alloc_free_cycle() {
		let mut fs = mkimg(&one_ag());
		assert_eq!(fs.sb.fdblocks, 993);

		let mut tp = fs.trans_alloc(20).unwrap();
		let mut a = AllocArg::new(AllocType::ThisBno, tp.fs.sb.agb_to_fsb(0, 100), 10, 10);
		tp.alloc_vextent(&mut a).unwrap();
		assert!(a.ok());
		assert_eq!(tp.fs.sb.fsb_to_agbno(a.fsbno), 100);
		assert_eq!(a.len, 10);
		tp.commit().unwrap();

		// the first allocation also pre-filled the freelist
		let pag = fs.perag[0].clone();
		assert_eq!(pag.flcount, 4);
		assert_eq!(pag.freeblks, 993 - 4 - 10);
		assert_eq!(pag.longest, 890);
		assert_eq!(fs.sb.fdblocks, 983);
		fs.check_ag(0).unwrap();

		let mut tp = fs.trans_alloc(0).unwrap();
		tp.free_extent(tp.fs.sb.agb_to_fsb(0, 100), 10).unwrap();
		tp.commit().unwrap();

		assert_eq!(fs.sb.fdblocks, 993);
		assert_eq!(fs.perag[0].freeblks, 989);
		assert_eq!(fs.perag[0].longest, 989);
		fs.check_ag(0).unwrap();
	}

	#[test]
	fn exact_alloc_misses() {
		let mut fs = mkimg(&one_ag());
		let mut tp = fs.trans_alloc(20).unwrap();
		// blocks 0..7 are AG metadata, never free
		let mut a = AllocArg::new(AllocType::ThisBno, tp.fs.sb.agb_to_fsb(0, 2), 1, 1);
		tp.alloc_vextent(&mut a).unwrap();
		assert!(!a.ok());
		tp.cancel();
	}

	/// Freeing between two free neighbors merges all three records.
	#[test]
	fn coalescing_free() {
		let mut fs = mkimg(&one_ag());
		let mut tp = fs.trans_alloc(64).unwrap();
		// carve [50,60) and [80,90) out of the initial extent
		for (bno, len) in [(50u32, 10u32), (80, 10)] {
			let mut a = AllocArg::new(AllocType::ThisBno, tp.fs.sb.agb_to_fsb(0, bno), len, len);
			tp.alloc_vextent(&mut a).unwrap();
			assert!(a.ok());
		}
		tp.commit().unwrap();
		fs.check_ag(0).unwrap();
		let free_before = fs.perag[0].freeblks;

		// free [50,60): merges with both [x,50) and [60,80)
		let mut tp = fs.trans_alloc(0).unwrap();
		tp.free_extent(tp.fs.sb.agb_to_fsb(0, 50), 10).unwrap();
		tp.commit().unwrap();
		assert_eq!(fs.perag[0].freeblks, free_before + 10);
		fs.check_ag(0).unwrap();
	}

	/// Double frees and overlaps are corruption, not accidents.
	#[test]
	fn double_free_is_corruption() {
		let mut fs = mkimg(&one_ag());
		let mut tp = fs.trans_alloc(64).unwrap();
		let mut a = AllocArg::new(AllocType::ThisBno, tp.fs.sb.agb_to_fsb(0, 100), 10, 10);
		tp.alloc_vextent(&mut a).unwrap();
		assert!(a.ok());

		// [105,115) overlaps the free extent starting at 110
		let e = tp
			.free_extent(tp.fs.sb.agb_to_fsb(0, 105), 10)
			.unwrap_err();
		assert_eq!(e.raw_os_error(), Some(crate::EFSCORRUPTED));
		tp.cancel();

		let mut tp = fs.trans_alloc(0).unwrap();
		let e = tp
			.free_extent(tp.fs.sb.agb_to_fsb(0, 300), 10)
			.unwrap_err();
		assert_eq!(e.raw_os_error(), Some(crate::EFSCORRUPTED));
		tp.cancel();
	}

	/// The first allocation finds an empty freelist and refills it,
	/// marking the transaction synchronous.
	#[test]
	fn freelist_refill_goes_sync() {
		let mut fs = mkimg(&one_ag());
		let mut tp = fs.trans_alloc(8).unwrap();
		assert!(!tp.is_sync());
		let mut a = AllocArg::new(AllocType::ThisAg, tp.fs.sb.agb_to_fsb(0, 0), 1, 1);
		tp.alloc_vextent(&mut a).unwrap();
		assert!(a.ok());
		assert!(tp.is_sync());
		tp.commit().unwrap();

		let pag = fs.perag[0].clone();
		assert_eq!(pag.flcount, 4);
		fs.check_ag(0).unwrap();
	}

	/// Shape the AG so exactly [(15,5), (105,5)] are free, then let the
	/// locality allocator choose.
	fn shape_two_islands(fs: &mut Xfs<std::io::Cursor<Vec<u8>>>) {
		// let the freelist take its blocks (7..11) out of the picture
		let mut tp = fs.trans_alloc(8).unwrap();
		let mut a = AllocArg::new(AllocType::ThisAg, tp.fs.sb.agb_to_fsb(0, 0), 1, 1);
		tp.alloc_vextent(&mut a).unwrap();
		assert!(a.ok());
		tp.free_extent(a.fsbno, 1).unwrap();
		tp.commit().unwrap();

		// free space is now (11,989); carve it into two islands
		let mut tp = fs.trans_alloc(980).unwrap();
		for (bno, len) in [(11u32, 4u32), (20, 85), (110, 890)] {
			let mut a = AllocArg::new(AllocType::ThisBno, tp.fs.sb.agb_to_fsb(0, bno), len, len);
			tp.alloc_vextent(&mut a).unwrap();
			assert!(a.ok(), "carve ({bno},{len})");
		}
		tp.commit().unwrap();
		fs.check_ag(0).unwrap();
		assert_eq!(fs.perag[0].freeblks, 10);
	}

	#[test]
	fn near_bno_picks_smaller_diff() {
		let mut fs = mkimg(&one_ag());
		shape_two_islands(&mut fs);
		// free: [(15,5), (105,5)]; target 50: left diff 35, right diff 55
		let mut tp = fs.trans_alloc(8).unwrap();
		let mut a = AllocArg::new(AllocType::NearBno, tp.fs.sb.agb_to_fsb(0, 50), 5, 5);
		tp.alloc_vextent(&mut a).unwrap();
		assert!(a.ok());
		assert_eq!(tp.fs.sb.fsb_to_agbno(a.fsbno), 15);
		tp.cancel();
	}

	#[test]
	fn near_bno_tie_prefers_left() {
		let mut fs = mkimg(&one_ag());
		shape_two_islands(&mut fs);
		// target 60: both sides are 45 away; the left cursor runs first
		let mut tp = fs.trans_alloc(8).unwrap();
		let mut a = AllocArg::new(AllocType::NearBno, tp.fs.sb.agb_to_fsb(0, 60), 5, 5);
		tp.alloc_vextent(&mut a).unwrap();
		assert!(a.ok());
		assert_eq!(tp.fs.sb.fsb_to_agbno(a.fsbno), 15);
		tp.cancel();
	}

	/// Split the by-bno tree by fragmenting free space, then heal it
	/// again; the trees must stay mirror images throughout.
	#[test]
	fn btree_grow_and_shrink() {
		let p = MkfsParams {
			blocklog: 9,
			agcount: 1,
			agblocks: 4096,
			..MkfsParams::default()
		};
		let mut fs = mkimg(&p);

		// grab most of the AG in one piece
		let mut tp = fs.trans_alloc(3500).unwrap();
		let mut a = AllocArg::new(AllocType::ThisBno, tp.fs.sb.agb_to_fsb(0, 16), 3000, 3000);
		tp.alloc_vextent(&mut a).unwrap();
		assert!(a.ok());
		tp.commit().unwrap();

		// free every other block: 300 isolated records force splits
		let mut tp = fs.trans_alloc(0).unwrap();
		for i in 0..300u32 {
			tp.free_extent(tp.fs.sb.agb_to_fsb(0, 16 + 2 * i), 1).unwrap();
		}
		tp.commit().unwrap();
		fs.check_ag(0).unwrap();
		assert!(fs.perag[0].levels[BTNUM_BNO] > 1);
		assert!(fs.stats().splits > 0);

		// with several by-cnt leaves the two-cursor locality walk runs
		let mut tp = fs.trans_alloc(8).unwrap();
		let mut a = AllocArg::new(AllocType::NearBno, tp.fs.sb.agb_to_fsb(0, 616), 1, 1);
		tp.alloc_vextent(&mut a).unwrap();
		assert!(a.ok());
		assert_eq!(tp.fs.sb.fsb_to_agbno(a.fsbno), 614);
		tp.cancel();

		// take them all back: deletes drive shifts, joins and collapse
		let mut tp = fs.trans_alloc(400).unwrap();
		for i in 0..300u32 {
			let mut a =
				AllocArg::new(AllocType::ThisBno, tp.fs.sb.agb_to_fsb(0, 16 + 2 * i), 1, 1);
			tp.alloc_vextent(&mut a).unwrap();
			assert!(a.ok(), "realloc {i}");
		}
		tp.commit().unwrap();
		fs.check_ag(0).unwrap();
		assert!(fs.stats().joins > 0);
	}

	/// The size allocator falls back to the largest extent when nothing
	/// covers maxlen.
	#[test]
	fn size_alloc_takes_largest() {
		let mut fs = mkimg(&one_ag());
		shape_two_islands(&mut fs);
		let mut tp = fs.trans_alloc(8).unwrap();
		let mut a = AllocArg::new(AllocType::ThisAg, tp.fs.sb.agb_to_fsb(0, 0), 1, 64);
		tp.alloc_vextent(&mut a).unwrap();
		assert!(a.ok());
		assert_eq!(a.len, 5);
		tp.cancel();
	}

	/// minleft shrinks or refuses the allocation.
	#[test]
	fn minleft_enforced() {
		let mut fs = mkimg(&one_ag());
		let mut tp = fs.trans_alloc(0).unwrap();
		let mut a = AllocArg::new(AllocType::ThisAg, tp.fs.sb.agb_to_fsb(0, 0), 1, 993);
		a.minleft = 985;
		a.isfl = true; // keep superblock accounting out of the picture
		tp.alloc_vextent(&mut a).unwrap();
		assert!(a.ok());
		assert!(a.len <= 8);
		tp.cancel();
	}
}
