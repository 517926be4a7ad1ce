use std::io::{Error as IoError, Result as IoResult};

use super::{
	bmap_btree::{bmbt_inline_maxrecs, bmbt_maxrecs, broot_new, BmbtBt},
	btree::{Cursor, LookupDir},
	*,
};
use crate::{corrupt, err};

impl<'a, R: Backend> Trans<'a, R> {
	/// Run a closure against the fork's block-map tree, with the inline
	/// root joined to the transaction for the duration.  `writeback`
	/// folds the (possibly rewritten) root and the block-count delta
	/// back into the inode; deferred frees run either way.
	fn with_bmbt<T>(
		&mut self,
		ip: &mut Inode,
		writeback: bool,
		f: impl FnOnce(&mut Self, &mut Cursor<R, BmbtBt>) -> IoResult<T>,
	) -> IoResult<T> {
		let Fork::Btree(bytes) = &ip.dfork else {
			panic!("with_bmbt on a non-tree fork");
		};
		let sb = self.fs.sb.clone();
		let iroot = self.join_iroot(ip.ino, bytes.clone());
		let mut cur = Cursor::new(BmbtBt {
			ino: ip.ino,
			iroot,
			fork_size: ip.dfork_size(&sb),
			firstblock: sb.ino_to_fsb(ip.ino),
			flist: Vec::new(),
			nblocks: 0,
		});
		let res = f(self, &mut cur);
		let bytes = self.take_iroot(ip.ino);
		let v = res?;
		if writeback {
			ip.dfork = Fork::Btree(bytes);
			ip.core.nblocks = (ip.core.nblocks as i64 + cur.tree.nblocks) as u64;
		}
		for (b, l) in std::mem::take(&mut cur.tree.flist) {
			self.free_extent(b, l)?;
		}
		Ok(v)
	}

	/// The extent containing `off`, or the nearest one after it.
	fn fork_ext_at_or_after(&mut self, ip: &mut Inode, off: FileOff) -> IoResult<Option<BmbtIrec>> {
		match &ip.dfork {
			Fork::Local(_) => Err(err!(EINVAL)),
			Fork::Extents(list) => {
				let i = list.partition_point(|x| x.startoff + x.blockcount as u64 <= off);
				Ok(list.get(i).copied())
			}
			Fork::Btree(_) => self.with_bmbt(ip, false, |tp, cur| {
				if cur.lookup(tp, LookupDir::Le, off)? {
					let x = cur.get_rec(tp)?.unpack();
					if x.startoff + x.blockcount as u64 > off {
						return Ok(Some(x));
					}
					if cur.increment(tp, 0)? {
						return Ok(Some(cur.get_rec(tp)?.unpack()));
					}
					return Ok(None);
				}
				if cur.lookup(tp, LookupDir::Ge, 0)? {
					Ok(Some(cur.get_rec(tp)?.unpack()))
				} else {
					Ok(None)
				}
			}),
		}
	}

	/// Allocation hint: right behind the nearest mapped block before
	/// `off`, or the inode's own neighborhood.
	fn fork_prev_hint(&self, ip: &Inode, off: FileOff) -> FsBlock {
		let home = self.fs.sb.ino_to_fsb(ip.ino);
		match &ip.dfork {
			Fork::Extents(list) => {
				let i = list.partition_point(|x| x.startoff < off);
				match i.checked_sub(1).and_then(|i| list.get(i)) {
					Some(x) if !isnullstartblock(x.startblock) => {
						x.startblock + x.blockcount as u64
					}
					_ => home,
				}
			}
			_ => home,
		}
	}

	fn fork_insert(&mut self, ip: &mut Inode, nrec: &BmbtIrec) -> IoResult<()> {
		let cap = ip.extents_capacity(&self.fs.sb);
		if let Fork::Extents(list) = &mut ip.dfork {
			if list.len() < cap {
				let pos = list.partition_point(|x| x.startoff < nrec.startoff);
				list.insert(pos, *nrec);
				return Ok(());
			}
			// the array is full; move it under a tree root
			self.bmap_extents_to_btree(ip)?;
		}
		self.with_bmbt(ip, true, |tp, cur| {
			if cur.lookup(tp, LookupDir::Eq, nrec.startoff)? {
				return Err(corrupt!(
					"inode {:#x}: mapping at {} already exists",
					cur.tree.ino,
					nrec.startoff
				));
			}
			cur.insert(tp, BmbtRec::pack(nrec))
		})
	}

	fn fork_update(&mut self, ip: &mut Inode, oldkey: FileOff, nrec: &BmbtIrec) -> IoResult<()> {
		match &mut ip.dfork {
			Fork::Extents(list) => {
				let Some(i) = list.iter().position(|x| x.startoff == oldkey) else {
					return Err(corrupt!("inode {:#x}: mapping at {oldkey} vanished", ip.ino));
				};
				list[i] = *nrec;
				Ok(())
			}
			Fork::Btree(_) => self.with_bmbt(ip, true, |tp, cur| {
				if !cur.lookup(tp, LookupDir::Eq, oldkey)? {
					return Err(corrupt!(
						"inode {:#x}: mapping at {oldkey} vanished",
						cur.tree.ino
					));
				}
				cur.update(tp, &BmbtRec::pack(nrec))
			}),
			Fork::Local(_) => Err(err!(EINVAL)),
		}
	}

	fn fork_delete(&mut self, ip: &mut Inode, key: FileOff) -> IoResult<()> {
		match &mut ip.dfork {
			Fork::Extents(list) => {
				let Some(i) = list.iter().position(|x| x.startoff == key) else {
					return Err(corrupt!("inode {:#x}: mapping at {key} vanished", ip.ino));
				};
				list.remove(i);
				Ok(())
			}
			Fork::Btree(_) => self.with_bmbt(ip, true, |tp, cur| {
				if !cur.lookup(tp, LookupDir::Eq, key)? {
					return Err(corrupt!(
						"inode {:#x}: mapping at {key} vanished",
						cur.tree.ino
					));
				}
				cur.delete(tp)
			}),
			Fork::Local(_) => Err(err!(EINVAL)),
		}
	}

	/// Inline payload moves out into a single allocated block.
	fn bmap_local_to_extents(&mut self, ip: &mut Inode) -> IoResult<()> {
		let Fork::Local(data) = &ip.dfork else {
			return Ok(());
		};
		if data.is_empty() {
			ip.dfork = Fork::Extents(Vec::new());
			ip.core.format = DiFormat::Extents.raw();
			return Ok(());
		}
		let data = data.clone();
		let mut a = AllocArg::new(AllocType::StartBno, self.fs.sb.ino_to_fsb(ip.ino), 1, 1);
		self.alloc_vextent(&mut a)?;
		if !a.ok() {
			return Err(err!(ENOSPC));
		}
		let id = self.get_buf(a.fsbno, 1)?;
		self.bput(id, 0, &data);
		let len = self.buf(id).data.len();
		self.bfill(id, data.len(), len - data.len(), 0);
		ip.dfork = Fork::Extents(vec![BmbtIrec {
			startoff:   0,
			startblock: a.fsbno,
			blockcount: 1,
			state:      ExtState::Norm,
		}]);
		ip.core.format = DiFormat::Extents.raw();
		ip.core.nextents = 1;
		ip.core.nblocks += 1;
		Ok(())
	}

	/// The flat array has outgrown the literal area: allocate a leaf,
	/// move the records there and leave a one-entry root behind.
	fn bmap_extents_to_btree(&mut self, ip: &mut Inode) -> IoResult<()> {
		let Fork::Extents(list) = &ip.dfork else {
			return Ok(());
		};
		let list = list.clone();
		let sb = self.fs.sb.clone();
		let cfg = self.cfg();

		let mut a = AllocArg::new(AllocType::StartBno, sb.ino_to_fsb(ip.ino), 1, 1);
		self.alloc_vextent(&mut a)?;
		if !a.ok() {
			return Err(err!(ENOSPC));
		}
		let cid = self.get_buf(a.fsbno, 1)?;
		self.bwrite(
			cid,
			0,
			&LBtreeHdr {
				magic:    BMAP_MAGIC,
				level:    0,
				numrecs:  list.len() as u16,
				leftsib:  NULLFSBLOCK,
				rightsib: NULLFSBLOCK,
			},
		)?;
		for (i, ir) in list.iter().enumerate() {
			self.bwrite(cid, LBT_HDR_LEN + i * BMBT_REC_LEN, &BmbtRec::pack(ir))?;
		}
		let key = list.first().map(|x| x.startoff).unwrap_or(0);
		ip.dfork = Fork::Btree(broot_new(cfg, ip.dfork_size(&sb), 1, key, a.fsbno)?);
		ip.core.format = DiFormat::Btree.raw();
		ip.core.nblocks += 1;
		log::debug!(
			"inode {:#x}: extent list ({}) moved under a tree at {:#x}",
			ip.ino,
			list.len(),
			a.fsbno
		);
		Ok(())
	}

	/// Shrink the tree from the top: absorb a lone node child into the
	/// root, and turn a lone leaf child back into the flat array once
	/// it fits the literal area.
	fn bmap_collapse(&mut self, ip: &mut Inode) -> IoResult<()> {
		loop {
			let Fork::Btree(bytes) = &ip.dfork else {
				return Ok(());
			};
			let cfg = self.cfg();
			let hdr: LBtreeHdr = cfg.decode_slice(bytes)?;
			if hdr.numrecs != 1 {
				return Ok(());
			}
			let maxr_inline = bmbt_inline_maxrecs(bytes.len());
			let fork_size = bytes.len();
			let cptr: FsBlock =
				cfg.decode_slice(&bytes[LBT_HDR_LEN + maxr_inline * 8..])?;
			let cid = self.read_buf(cptr, 1)?;
			let chdr: LBtreeHdr = self.bread(cid, 0)?;
			let n = chdr.numrecs as usize;

			if hdr.level == 1 {
				// leaf child: back below the inline threshold?
				let cap = ip.extents_capacity(&self.fs.sb);
				if n > cap {
					return Ok(());
				}
				let mut list = Vec::with_capacity(n);
				for i in 0..n {
					let rec: BmbtRec = self.bread(cid, LBT_HDR_LEN + i * BMBT_REC_LEN)?;
					list.push(rec.unpack());
				}
				ip.dfork = Fork::Extents(list);
				ip.core.format = DiFormat::Extents.raw();
				self.binval(cid);
				self.free_extent(cptr, 1)?;
				ip.core.nblocks -= 1;
				log::debug!("inode {:#x}: tree collapsed into the extent list", ip.ino);
				return Ok(());
			}

			// node child small enough to live inline: absorb it
			if n > maxr_inline {
				return Ok(());
			}
			let mut nb = vec![0u8; fork_size];
			cfg.encode_slice(
				&mut nb,
				&LBtreeHdr {
					magic:    BMAP_MAGIC,
					level:    chdr.level,
					numrecs:  chdr.numrecs,
					leftsib:  NULLFSBLOCK,
					rightsib: NULLFSBLOCK,
				},
			)?;
			let keys = self.bbytes(cid, LBT_HDR_LEN, n * 8);
			nb[LBT_HDR_LEN..LBT_HDR_LEN + n * 8].copy_from_slice(&keys);
			let cmax = bmbt_maxrecs(self.fs.sb.blocksize);
			let ptrs = self.bbytes(cid, LBT_HDR_LEN + cmax * 8, n * 8);
			let pbase = LBT_HDR_LEN + maxr_inline * 8;
			nb[pbase..pbase + n * 8].copy_from_slice(&ptrs);
			ip.dfork = Fork::Btree(nb);
			self.binval(cid);
			self.free_extent(cptr, 1)?;
			ip.core.nblocks -= 1;
			log::debug!("inode {:#x}: tree root pulled up from {cptr:#x}", ip.ino);
		}
	}

	/// Allocate blocks to back a hole, preferring the neighborhood of
	/// the previous mapping, then any AG from the target's onward.
	fn bmap_alloc(
		&mut self,
		ip: &Inode,
		off: FileOff,
		want: ExtLen,
		rt: bool,
	) -> IoResult<(FsBlock, ExtLen)> {
		if rt {
			let rextsize = self.fs.sb.rextsize;
			let wantx = (want + rextsize - 1) / rextsize;
			let Some((rtx, lenx)) =
				self.rtallocate_extent(0, 1, wantx as u64, rtalloc::RtAllocType::Size, 1)?
			else {
				return Err(err!(ENOSPC));
			};
			return Ok((rtx * rextsize as u64, lenx * rextsize));
		}
		let hint = self.fork_prev_hint(ip, off);
		let mut a = AllocArg::new(AllocType::StartBno, hint, 1, want);
		self.alloc_vextent(&mut a)?;
		if !a.ok() {
			a = AllocArg::new(AllocType::StartAg, hint, 1, want);
			self.alloc_vextent(&mut a)?;
		}
		if !a.ok() {
			return Err(err!(ENOSPC));
		}
		Ok((a.fsbno, a.len))
	}

	fn bmapi_read(
		&mut self,
		ip: &mut Inode,
		bno: FileOff,
		len: u64,
		nmaps: usize,
	) -> IoResult<Vec<BmbtIrec>> {
		let end = bno.saturating_add(len);
		let mut maps = Vec::new();
		let mut cur = bno;
		while cur < end && maps.len() < nmaps {
			let next = self.fork_ext_at_or_after(ip, cur)?;
			match next {
				Some(x) if x.startoff <= cur => {
					let xend = x.startoff + x.blockcount as u64;
					let hi = xend.min(end);
					maps.push(BmbtIrec {
						startoff:   cur,
						startblock: x.startblock + (cur - x.startoff),
						blockcount: (hi - cur) as ExtLen,
						state:      x.state,
					});
					cur = hi;
				}
				other => {
					// a hole out to the next mapping (or the end)
					let hi = other
						.map(|x| x.startoff)
						.unwrap_or(end)
						.min(end)
						.min(cur + MAX_BMBT_EXTLEN as u64);
					maps.push(BmbtIrec {
						startoff:   cur,
						startblock: HOLESTARTBLOCK,
						blockcount: (hi - cur) as ExtLen,
						state:      ExtState::Norm,
					});
					cur = hi;
				}
			}
		}
		Ok(maps)
	}

	/// Map a file range, allocating over holes when `write` is set.
	/// Holes come back with a null startblock on the read path.
	pub fn bmapi(
		&mut self,
		ip: &mut Inode,
		bno: FileOff,
		len: u64,
		write: bool,
		nmaps: usize,
	) -> IoResult<Vec<BmbtIrec>> {
		log::trace!(
			"bmapi({:#x}, bno={bno}, len={len}, write={write}, nmaps={nmaps})",
			ip.ino
		);
		Stats::bump(&self.fs.stats.bmaps);
		if len == 0 || nmaps == 0 {
			return Err(err!(EINVAL));
		}
		if !write {
			return self.bmapi_read(ip, bno, len, nmaps);
		}
		self.fs.assert_rw()?;
		if matches!(ip.dfork, Fork::Local(_)) {
			self.bmap_local_to_extents(ip)?;
		}
		let rt = ip.core.is_realtime();
		let end = bno.saturating_add(len);
		let mut maps = Vec::new();
		let mut cur = bno;
		while cur < end && maps.len() < nmaps {
			let next = self.fork_ext_at_or_after(ip, cur)?;
			if let Some(x) = next {
				if x.startoff <= cur {
					let xend = x.startoff + x.blockcount as u64;
					let hi = xend.min(end);
					maps.push(BmbtIrec {
						startoff:   cur,
						startblock: x.startblock + (cur - x.startoff),
						blockcount: (hi - cur) as ExtLen,
						state:      x.state,
					});
					cur = hi;
					continue;
				}
			}
			let hole_end = next.map(|x| x.startoff).unwrap_or(end).min(end);
			let want = (hole_end - cur).min(MAX_BMBT_EXTLEN as u64) as ExtLen;
			self.reserve_quota_ip(ip, want as u64, 0, rt)?;
			let (blk, alen) = self.bmap_alloc(ip, cur, want, rt)?;

			// adjacent to the following mapping: widen it in place
			let follows = next.filter(|x| {
				x.startoff == cur + alen as u64
					&& x.startblock == blk + alen as u64
					&& x.state == ExtState::Norm
			});
			if let Some(x) = follows {
				let merged = BmbtIrec {
					startoff:   cur,
					startblock: blk,
					blockcount: alen + x.blockcount,
					state:      ExtState::Norm,
				};
				self.fork_update(ip, x.startoff, &merged)?;
			} else {
				let nrec = BmbtIrec {
					startoff:   cur,
					startblock: blk,
					blockcount: alen,
					state:      ExtState::Norm,
				};
				self.fork_insert(ip, &nrec)?;
				ip.core.nextents += 1;
			}
			self.quota_mod_ip(ip, alen as i64, 0, rt);
			ip.core.nblocks += alen as u64;
			maps.push(BmbtIrec {
				startoff:   cur,
				startblock: blk,
				blockcount: alen,
				state:      ExtState::Norm,
			});
			cur += alen as u64;
		}
		self.log_inode(ip)?;
		Ok(maps)
	}

	/// Unmap a file range: records are trimmed, split or deleted, and
	/// the blocks go back to their allocator.
	pub fn bunmapi(&mut self, ip: &mut Inode, bno: FileOff, len: u64) -> IoResult<()> {
		log::trace!("bunmapi({:#x}, bno={bno}, len={len})", ip.ino);
		if matches!(ip.dfork, Fork::Local(_)) {
			return Ok(());
		}
		self.fs.assert_rw()?;
		let rt = ip.core.is_realtime();
		let end = bno.saturating_add(len);
		let mut cur = bno;
		loop {
			let Some(x) = self.fork_ext_at_or_after(ip, cur)? else {
				break;
			};
			if x.startoff >= end {
				break;
			}
			let xend = x.startoff + x.blockcount as u64;
			let lo = cur.max(x.startoff);
			let hi = end.min(xend);
			if hi <= lo {
				cur = xend;
				continue;
			}
			let flen = (hi - lo) as ExtLen;
			let fblk = x.startblock + (lo - x.startoff);

			if lo == x.startoff && hi == xend {
				self.fork_delete(ip, x.startoff)?;
				ip.core.nextents -= 1;
			} else if lo == x.startoff {
				let nr = BmbtIrec {
					startoff:   hi,
					startblock: x.startblock + (hi - x.startoff),
					blockcount: (xend - hi) as ExtLen,
					state:      x.state,
				};
				self.fork_update(ip, x.startoff, &nr)?;
			} else if hi == xend {
				let nr = BmbtIrec {
					startoff:   x.startoff,
					startblock: x.startblock,
					blockcount: (lo - x.startoff) as ExtLen,
					state:      x.state,
				};
				self.fork_update(ip, x.startoff, &nr)?;
			} else {
				// hole punched in the middle: the record splits
				let left = BmbtIrec {
					startoff:   x.startoff,
					startblock: x.startblock,
					blockcount: (lo - x.startoff) as ExtLen,
					state:      x.state,
				};
				let right = BmbtIrec {
					startoff:   hi,
					startblock: x.startblock + (hi - x.startoff),
					blockcount: (xend - hi) as ExtLen,
					state:      x.state,
				};
				self.fork_update(ip, x.startoff, &left)?;
				self.fork_insert(ip, &right)?;
				ip.core.nextents += 1;
			}

			if rt {
				self.rtfree_blocks(fblk, flen)?;
			} else {
				self.free_extent(fblk, flen)?;
			}
			self.quota_mod_ip(ip, -(flen as i64), 0, rt);
			ip.core.nblocks -= flen as u64;
			cur = hi;
			if cur >= end {
				break;
			}
		}
		self.bmap_collapse(ip)?;
		self.log_inode(ip)?;
		Ok(())
	}

	/// Shrink a file to `newsize` bytes, unmapping everything past it.
	pub fn itruncate(&mut self, ip: &mut Inode, newsize: u64) -> IoResult<()> {
		log::trace!("itruncate({:#x}, {newsize})", ip.ino);
		self.fs.assert_rw()?;
		if let Fork::Local(data) = &mut ip.dfork {
			data.truncate(newsize as usize);
		} else {
			let bs = self.fs.sb.blocksize as u64;
			let first = newsize.div_ceil(bs);
			self.bunmapi(ip, first, NULLFILEOFF)?;
		}
		ip.core.size = newsize;
		self.log_inode(ip)?;
		Ok(())
	}
}

#[cfg(test)]
mod t {
	use super::*;
	use crate::xfs::{mkfs::MkfsParams, testutil::mkimg};

	fn mkfile(fs: &mut Xfs<std::io::Cursor<Vec<u8>>>) -> Inode {
		let root = fs.sb.rootino;
		let mut tp = fs.trans_alloc(64).unwrap();
		let ip = tp.create_inode(root, S_IFREG | 0o644, false).unwrap();
		tp.commit().unwrap();
		ip
	}

	/// Write mappings, read them back, compare (the round-trip law).
	#[test]
	fn write_then_read_roundtrip() {
		let mut fs = mkimg(&MkfsParams::default());
		let mut ip = mkfile(&mut fs);

		let mut tp = fs.trans_alloc(64).unwrap();
		let w = tp.bmapi(&mut ip, 0, 8, true, 16).unwrap();
		tp.commit().unwrap();
		assert!(!w.is_empty());
		assert_eq!(w.iter().map(|m| m.blockcount as u64).sum::<u64>(), 8);

		let mut ip = fs.iget(ip.ino).unwrap();
		assert_eq!(ip.core.nblocks, 8);
		let mut tp = fs.trans_alloc(0).unwrap();
		let r = tp.bmapi(&mut ip, 0, 8, false, 16).unwrap();
		tp.cancel();
		assert_eq!(w, r);
		fs.check_ag(0).unwrap();
	}

	#[test]
	fn holes_read_as_null_mappings() {
		let mut fs = mkimg(&MkfsParams::default());
		let mut ip = mkfile(&mut fs);

		let mut tp = fs.trans_alloc(64).unwrap();
		tp.bmapi(&mut ip, 4, 2, true, 4).unwrap();
		tp.commit().unwrap();

		let mut ip = fs.iget(ip.ino).unwrap();
		let mut tp = fs.trans_alloc(0).unwrap();
		let maps = tp.bmapi(&mut ip, 0, 8, false, 8).unwrap();
		tp.cancel();

		assert_eq!(maps.len(), 3);
		assert_eq!(maps[0].startblock, HOLESTARTBLOCK);
		assert_eq!(maps[0].blockcount, 4);
		assert!(!isnullstartblock(maps[1].startblock));
		assert_eq!(maps[1].blockcount, 2);
		assert_eq!(maps[2].startblock, HOLESTARTBLOCK);
		assert_eq!(maps[2].blockcount, 2);
	}

	/// Filling a hole right before a mapping widens that mapping rather
	/// than inserting a new record.
	#[test]
	fn fill_merges_with_following() {
		let mut fs = mkimg(&MkfsParams::default());
		let mut ip = mkfile(&mut fs);

		let mut tp = fs.trans_alloc(64).unwrap();
		let w = tp.bmapi(&mut ip, 0, 4, true, 4).unwrap();
		assert_eq!(w.len(), 1, "fresh AG should map contiguously");
		tp.bunmapi(&mut ip, 2, 1).unwrap();
		tp.commit().unwrap();
		let mut ip = fs.iget(ip.ino).unwrap();
		assert_eq!(ip.core.nextents, 2);

		// refill the hole: the allocator lands on the freed block and
		// the record after it grows leftward
		let mut tp = fs.trans_alloc(16).unwrap();
		let m = tp.bmapi(&mut ip, 2, 1, true, 2).unwrap();
		tp.commit().unwrap();
		assert_eq!(m[0].startblock, w[0].startblock + 2);
		assert_eq!(ip.core.nextents, 2);
		assert_eq!(ip.core.nblocks, 4);

		let mut tp = fs.trans_alloc(0).unwrap();
		let maps = tp.bmapi(&mut ip, 0, 4, false, 8).unwrap();
		tp.cancel();
		assert_eq!(maps.len(), 2);
		assert_eq!(maps[1].startoff, 2);
		assert_eq!(maps[1].blockcount, 2);
	}

	/// Scattered single-block mappings push the fork from the inline
	/// array into a tree whose root eventually splits; unmapping
	/// everything folds it all back and frees every block.
	#[test]
	fn bmbt_grows_splits_and_collapses() {
		let p = MkfsParams {
			blocklog: 9,
			agcount: 1,
			agblocks: 4096,
			..MkfsParams::default()
		};
		let mut fs = mkimg(&p);
		let mut ip = mkfile(&mut fs);
		let free0 = fs.sb.fdblocks;
		let newroots0 = fs.stats().newroots;

		let mut tp = fs.trans_alloc(600).unwrap();
		for i in 0..150u64 {
			tp.bmapi(&mut ip, 2 * i, 1, true, 2).unwrap();
		}
		tp.commit().unwrap();

		assert_eq!(ip.core.fmt(), Some(DiFormat::Btree));
		assert_eq!(ip.core.nextents, 150);
		let Fork::Btree(broot) = &ip.dfork else {
			panic!("fork did not convert");
		};
		let hdr: crate::data::LBtreeHdr =
			crate::decoder::Config::big().decode_slice(broot).unwrap();
		assert!(hdr.level >= 2, "root did not split (level {})", hdr.level);
		assert!(fs.stats().newroots > newroots0);
		// data blocks plus the tree blocks
		assert!(ip.core.nblocks > 150);
		assert_eq!(fs.sb.fdblocks, free0 - ip.core.nblocks);
		fs.check_ag(0).unwrap();

		// now take it all away again
		let mut tp = fs.trans_alloc(0).unwrap();
		tp.bunmapi(&mut ip, 0, NULLFILEOFF).unwrap();
		tp.commit().unwrap();

		assert_eq!(ip.core.fmt(), Some(DiFormat::Extents));
		assert_eq!(ip.core.nextents, 0);
		assert_eq!(ip.core.nblocks, 0);
		assert_eq!(fs.sb.fdblocks, free0);
		assert_eq!(ip.dfork, Fork::Extents(vec![]));
		fs.check_ag(0).unwrap();
	}

	#[test]
	fn truncate_trims_the_tail() {
		let mut fs = mkimg(&MkfsParams::default());
		let mut ip = mkfile(&mut fs);
		let bs = fs.sb.blocksize as u64;

		let mut tp = fs.trans_alloc(64).unwrap();
		tp.bmapi(&mut ip, 0, 10, true, 16).unwrap();
		ip.core.size = 10 * bs;
		tp.log_inode(&ip).unwrap();
		tp.commit().unwrap();

		let mut tp = fs.trans_alloc(0).unwrap();
		tp.itruncate(&mut ip, 3 * bs + 17).unwrap();
		tp.commit().unwrap();

		assert_eq!(ip.core.size, 3 * bs + 17);
		assert_eq!(ip.core.nblocks, 4);
		let mut tp = fs.trans_alloc(0).unwrap();
		let maps = tp.bmapi(&mut ip, 0, 10, false, 16).unwrap();
		tp.cancel();
		assert_eq!(maps.last().unwrap().startblock, HOLESTARTBLOCK);
		fs.check_ag(0).unwrap();
	}

	/// Punching a hole in the middle splits one record into two.
	#[test]
	fn hole_punch_splits_record() {
		let mut fs = mkimg(&MkfsParams::default());
		let mut ip = mkfile(&mut fs);

		let mut tp = fs.trans_alloc(64).unwrap();
		tp.bmapi(&mut ip, 0, 6, true, 4).unwrap();
		tp.commit().unwrap();
		assert_eq!(ip.core.nextents, 1);

		let mut tp = fs.trans_alloc(0).unwrap();
		tp.bunmapi(&mut ip, 2, 2).unwrap();
		tp.commit().unwrap();

		assert_eq!(ip.core.nextents, 2);
		assert_eq!(ip.core.nblocks, 4);
		fs.check_ag(0).unwrap();
	}
}
