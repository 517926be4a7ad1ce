use std::{cmp::Ordering, fmt::Debug, io::Error as IoError, io::Result as IoResult};

use bincode::{Decode, Encode};

use super::*;
use crate::{corrupt, err};

/// Search direction for [`Cursor::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LookupDir {
	/// Greatest record with key <= target.
	Le,
	/// Record with key == target; on a miss the cursor rests at the
	/// insertion point.
	Eq,
	/// Smallest record with key >= target.
	Ge,
}

/// One kind of B+tree: the record/key shapes, the block geometry and
/// where the tree gets its root and its blocks from.
pub(crate) trait Tree<R: Backend> {
	type Rec: Copy + Debug + Decode + Encode;
	type Key: Copy + Debug + Decode + Encode;

	/// Long-form pointers (filesystem-wide) instead of AG-relative.
	const LONG: bool;
	/// The root block lives in an inode literal area, not on disk.
	const ROOT_IN_INODE: bool = false;
	const NAME: &'static str;

	fn magic(&self) -> u32;
	fn key_of(&self, rec: &Self::Rec) -> Self::Key;
	fn cmp_keys(&self, a: &Self::Key, b: &Self::Key) -> Ordering;
	fn rec_len(&self) -> usize;
	fn key_len(&self) -> usize;

	/// Record capacity of a block.  `root` is only meaningful for trees
	/// whose root has its own geometry.
	fn maxrecs(&self, tp: &Trans<'_, R>, leaf: bool, root: bool) -> usize;

	/// Current root pointer and height.
	fn root(&self, tp: &mut Trans<'_, R>) -> IoResult<(u64, usize)>;
	fn set_root(&mut self, tp: &mut Trans<'_, R>, ptr: u64, nlevels: usize) -> IoResult<()>;

	/// Read the block a tree pointer refers to.
	fn buf_of(&self, tp: &mut Trans<'_, R>, ptr: u64) -> IoResult<BufId>;

	/// Get a fresh, unread buffer for a newly allocated tree block.
	fn new_buf(&self, tp: &mut Trans<'_, R>, ptr: u64) -> IoResult<BufId>;

	/// The in-inode root block, for `ROOT_IN_INODE` trees.
	fn root_buf(&self, _tp: &mut Trans<'_, R>) -> IoResult<BufId> {
		unreachable!("{}: tree has no inode root", Self::NAME)
	}

	/// Allocate a block for tree growth; `None` means out of space.
	fn alloc_block(&mut self, tp: &mut Trans<'_, R>, hint: u64) -> IoResult<Option<u64>>;

	/// Give back a block freed by a join or root collapse.
	fn free_block(&mut self, tp: &mut Trans<'_, R>, ptr: u64) -> IoResult<()>;

	fn ptr_len(&self) -> usize {
		if Self::LONG {
			8
		} else {
			4
		}
	}

	fn null_ptr(&self) -> u64 {
		if Self::LONG {
			NULLFSBLOCK
		} else {
			NULLAGBLOCK as u64
		}
	}

	fn hdr_len(&self) -> usize {
		if Self::LONG {
			LBT_HDR_LEN
		} else {
			SBT_HDR_LEN
		}
	}
}

/// Width-independent view of a block header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BtHdr {
	pub magic:    u32,
	pub level:    u16,
	pub numrecs:  u16,
	pub leftsib:  u64,
	pub rightsib: u64,
}

/// One level of the cursor's root-to-leaf path.
#[derive(Debug, Clone, Copy)]
struct Lev {
	buf: Option<BufId>,
	ptr: u64,
	idx: usize,
	ra:  u8,
}

const LEV_INIT: Lev = Lev {
	buf: None,
	ptr: 0,
	idx: 0,
	ra:  0,
};

const RA_RIGHT: u8 = 0x1;

/// Single-path B+tree cursor.
///
/// Every operation consumes and repositions the cursor; after a
/// structural `delete` the path is only good for another `lookup`.
/// Buffers live in the transaction's pinned table, the cursor merely
/// holds their handles, so dropping a cursor releases nothing.
pub(crate) struct Cursor<R: Backend, T: Tree<R>> {
	pub tree: T,
	nlevels:  usize,
	path:     Vec<Lev>,
	_backend: std::marker::PhantomData<fn() -> R>,
}

impl<R: Backend, T: Tree<R>> Cursor<R, T> {
	pub fn new(tree: T) -> Self {
		Self {
			tree,
			nlevels: 0,
			path: Vec::new(),
			_backend: std::marker::PhantomData,
		}
	}

	pub fn nlevels(&self) -> usize {
		self.nlevels
	}

	fn pathbuf(&self, level: usize) -> BufId {
		self.path[level].buf.expect("cursor level not positioned")
	}

	// geometry ---------------------------------------------------------

	fn rec_off(&self, i: usize) -> usize {
		self.tree.hdr_len() + i * self.tree.rec_len()
	}

	fn key_off(&self, i: usize) -> usize {
		self.tree.hdr_len() + i * self.tree.key_len()
	}

	fn ptr_off(&self, i: usize, maxr: usize) -> usize {
		self.tree.hdr_len() + maxr * self.tree.key_len() + i * self.tree.ptr_len()
	}

	fn block_maxrecs(&self, tp: &Trans<'_, R>, level: usize) -> usize {
		let root = T::ROOT_IN_INODE && level + 1 == self.nlevels;
		self.tree.maxrecs(tp, level == 0, root)
	}

	// low-level block access -------------------------------------------

	fn read_hdr(&self, tp: &Trans<'_, R>, id: BufId) -> IoResult<BtHdr> {
		if T::LONG {
			let h: LBtreeHdr = tp.bread(id, 0)?;
			Ok(BtHdr {
				magic:    h.magic,
				level:    h.level,
				numrecs:  h.numrecs,
				leftsib:  h.leftsib,
				rightsib: h.rightsib,
			})
		} else {
			let h: SBtreeHdr = tp.bread(id, 0)?;
			Ok(BtHdr {
				magic:    h.magic,
				level:    h.level,
				numrecs:  h.numrecs,
				leftsib:  h.leftsib as u64,
				rightsib: h.rightsib as u64,
			})
		}
	}

	fn write_hdr(&self, tp: &mut Trans<'_, R>, id: BufId, h: &BtHdr) -> IoResult<()> {
		if T::LONG {
			tp.bwrite(
				id,
				0,
				&LBtreeHdr {
					magic:    h.magic,
					level:    h.level,
					numrecs:  h.numrecs,
					leftsib:  h.leftsib,
					rightsib: h.rightsib,
				},
			)
		} else {
			tp.bwrite(
				id,
				0,
				&SBtreeHdr {
					magic:    h.magic,
					level:    h.level,
					numrecs:  h.numrecs,
					leftsib:  h.leftsib as AgBlock,
					rightsib: h.rightsib as AgBlock,
				},
			)
		}
	}

	/// Structural checks on a block just read.
	fn check_hdr(&self, tp: &Trans<'_, R>, h: &BtHdr, level: usize) -> IoResult<()> {
		let root = level + 1 == self.nlevels;
		let maxr = self.tree.maxrecs(tp, level == 0, T::ROOT_IN_INODE && root);
		if h.magic != self.tree.magic()
			|| h.level as usize != level
			|| h.numrecs as usize > maxr
			|| (root && (h.leftsib != self.tree.null_ptr() || h.rightsib != self.tree.null_ptr()))
		{
			return Err(corrupt!(
				"{}: bad block header at level {level}: {h:?}",
				T::NAME
			));
		}
		Ok(())
	}

	fn rec_at(&self, tp: &Trans<'_, R>, id: BufId, i: usize) -> IoResult<T::Rec> {
		tp.bread(id, self.rec_off(i))
	}

	fn put_rec(&self, tp: &mut Trans<'_, R>, id: BufId, i: usize, r: &T::Rec) -> IoResult<()> {
		tp.bwrite(id, self.rec_off(i), r)
	}

	fn key_at(&self, tp: &Trans<'_, R>, id: BufId, i: usize) -> IoResult<T::Key> {
		tp.bread(id, self.key_off(i))
	}

	fn put_key(&self, tp: &mut Trans<'_, R>, id: BufId, i: usize, k: &T::Key) -> IoResult<()> {
		tp.bwrite(id, self.key_off(i), k)
	}

	fn ptr_at(&self, tp: &Trans<'_, R>, id: BufId, maxr: usize, i: usize) -> IoResult<u64> {
		if T::LONG {
			tp.bread::<u64>(id, self.ptr_off(i, maxr))
		} else {
			tp.bread::<u32>(id, self.ptr_off(i, maxr)).map(u64::from)
		}
	}

	fn put_ptr(
		&self,
		tp: &mut Trans<'_, R>,
		id: BufId,
		maxr: usize,
		i: usize,
		v: u64,
	) -> IoResult<()> {
		if T::LONG {
			tp.bwrite(id, self.ptr_off(i, maxr), &v)
		} else {
			tp.bwrite(id, self.ptr_off(i, maxr), &(v as u32))
		}
	}

	/// Key of the first entry of a non-empty block.
	fn first_key_of(&self, tp: &Trans<'_, R>, id: BufId, level: usize) -> IoResult<T::Key> {
		if level == 0 {
			Ok(self.tree.key_of(&self.rec_at(tp, id, 0)?))
		} else {
			self.key_at(tp, id, 0)
		}
	}

	// positioning ------------------------------------------------------

	/// Position the cursor at the record selected by `dir` relative to
	/// `key`.  Returns whether a matching record exists; on an `Eq` miss
	/// the cursor rests at the insertion point.
	pub fn lookup(&mut self, tp: &mut Trans<'_, R>, dir: LookupDir, key: T::Key) -> IoResult<bool> {
		Stats::bump(&tp.fs.stats.lookups);
		let (rootptr, nlevels) = self.tree.root(tp)?;
		if nlevels == 0 || nlevels > BTREE_MAXLEVELS {
			return Err(corrupt!("{}: bad tree height {nlevels}", T::NAME));
		}
		self.nlevels = nlevels;
		self.path = vec![LEV_INIT; nlevels];

		let mut ptr = rootptr;
		for level in (0..nlevels).rev() {
			let id = if T::ROOT_IN_INODE && level + 1 == nlevels {
				self.tree.root_buf(tp)?
			} else {
				self.tree.buf_of(tp, ptr)?
			};
			let hdr = self.read_hdr(tp, id)?;
			self.check_hdr(tp, &hdr, level)?;
			self.path[level] = Lev {
				buf: Some(id),
				ptr,
				idx: 0,
				ra: 0,
			};
			let n = hdr.numrecs as usize;

			if level > 0 {
				// pick the last separator key <= target
				let mut lo = 0usize;
				let mut hi = n;
				while lo < hi {
					let mid = (lo + hi) / 2;
					let k = self.key_at(tp, id, mid)?;
					if self.tree.cmp_keys(&k, &key) == Ordering::Greater {
						hi = mid;
					} else {
						lo = mid + 1;
					}
				}
				let child = lo.saturating_sub(1);
				self.path[level].idx = child;
				let maxr = self.block_maxrecs(tp, level);
				ptr = self.ptr_at(tp, id, maxr, child)?;
				if ptr == self.tree.null_ptr() {
					return Err(corrupt!("{}: null child pointer", T::NAME));
				}
			} else {
				// first record with key >= target
				let mut lo = 0usize;
				let mut hi = n;
				while lo < hi {
					let mid = (lo + hi) / 2;
					let k = self.tree.key_of(&self.rec_at(tp, id, mid)?);
					if self.tree.cmp_keys(&k, &key) == Ordering::Less {
						lo = mid + 1;
					} else {
						hi = mid;
					}
				}
				return match dir {
					LookupDir::Ge => {
						if lo < n {
							self.path[0].idx = lo;
							Ok(true)
						} else if hdr.rightsib != self.tree.null_ptr() {
							// the target falls between this block and the
							// next; step into the right sibling
							self.path[0].idx = lo;
							self.increment(tp, 0)
						} else {
							self.path[0].idx = lo;
							Ok(false)
						}
					}
					LookupDir::Eq => {
						self.path[0].idx = lo;
						if lo < n {
							let k = self.tree.key_of(&self.rec_at(tp, id, lo)?);
							Ok(self.tree.cmp_keys(&k, &key) == Ordering::Equal)
						} else {
							Ok(false)
						}
					}
					LookupDir::Le => {
						if lo == 0 {
							self.path[0].idx = 0;
							Ok(false)
						} else {
							self.path[0].idx = lo - 1;
							Ok(true)
						}
					}
				};
			}
		}
		unreachable!()
	}

	/// Compute the path of the sibling block at `level`, walking the
	/// spine up and back down along the near edge.  `None` at the tree's
	/// edge.  Levels above the branch point are shared with `self`.
	fn sib_path(
		&self,
		tp: &mut Trans<'_, R>,
		level: usize,
		right: bool,
	) -> IoResult<Option<Vec<Lev>>> {
		let mut path = self.path.clone();
		let mut l = level + 1;
		loop {
			if l >= self.nlevels {
				return Ok(None);
			}
			let lev = path[l];
			let hdr = self.read_hdr(tp, self.pathbuf(l))?;
			if right {
				if lev.idx + 1 < hdr.numrecs as usize {
					break;
				}
			} else if lev.idx > 0 {
				break;
			}
			l += 1;
		}
		if right {
			path[l].idx += 1;
		} else {
			path[l].idx -= 1;
		}
		while l > level {
			let maxr = self.block_maxrecs(tp, l);
			let lev = path[l];
			let ptr = self.ptr_at(tp, lev.buf.expect("cursor level not positioned"), maxr, lev.idx)?;
			let id = self.tree.buf_of(tp, ptr)?;
			let hdr = self.read_hdr(tp, id)?;
			self.check_hdr(tp, &hdr, l - 1)?;
			l -= 1;
			path[l] = Lev {
				buf: Some(id),
				ptr,
				idx: if right { 0 } else { hdr.numrecs as usize - 1 },
				ra: 0,
			};
		}
		Ok(Some(path))
	}

	/// Advance to the next entry at `level`; levels below are untouched.
	pub fn increment(&mut self, tp: &mut Trans<'_, R>, level: usize) -> IoResult<bool> {
		let lev = self.path[level];
		let hdr = self.read_hdr(tp, self.pathbuf(level))?;
		if lev.idx + 1 < hdr.numrecs as usize {
			self.path[level].idx += 1;
			if self.path[level].idx + 1 == hdr.numrecs as usize
				&& hdr.rightsib != self.tree.null_ptr()
				&& self.path[level].ra & RA_RIGHT == 0
			{
				self.path[level].ra |= RA_RIGHT;
				tp.readahead(hdr.rightsib);
			}
			return Ok(true);
		}
		if hdr.rightsib == self.tree.null_ptr() {
			return Ok(false);
		}
		match self.sib_path(tp, level, true)? {
			Some(p) => {
				self.path = p;
				Ok(true)
			}
			None => Ok(false),
		}
	}

	/// Step back to the previous entry at `level`.
	pub fn decrement(&mut self, tp: &mut Trans<'_, R>, level: usize) -> IoResult<bool> {
		if self.path[level].idx > 0 {
			self.path[level].idx -= 1;
			return Ok(true);
		}
		let hdr = self.read_hdr(tp, self.pathbuf(level))?;
		if hdr.leftsib == self.tree.null_ptr() {
			return Ok(false);
		}
		match self.sib_path(tp, level, false)? {
			Some(p) => {
				self.path = p;
				Ok(true)
			}
			None => Ok(false),
		}
	}

	/// True when the cursor's leaf has no right sibling.
	pub fn is_rightmost_block(&self, tp: &Trans<'_, R>) -> IoResult<bool> {
		let hdr = self.read_hdr(tp, self.pathbuf(0))?;
		Ok(hdr.rightsib == self.tree.null_ptr())
	}

	/// Reposition at the first record of the current leaf.
	pub fn rewind_in_block(&mut self) {
		self.path[0].idx = 0;
	}

	/// The record under the cursor.
	pub fn get_rec(&self, tp: &Trans<'_, R>) -> IoResult<T::Rec> {
		let hdr = self.read_hdr(tp, self.pathbuf(0))?;
		let idx = self.path[0].idx;
		if idx >= hdr.numrecs as usize {
			return Err(corrupt!("{}: cursor past the last record", T::NAME));
		}
		self.rec_at(tp, self.pathbuf(0), idx)
	}

	/// Propagate a changed first key through the ancestors along `path`.
	fn updkey_on(
		&self,
		tp: &mut Trans<'_, R>,
		path: &[Lev],
		key: T::Key,
		start: usize,
	) -> IoResult<()> {
		let mut level = start;
		while level < self.nlevels {
			let lev = path[level];
			self.put_key(tp, lev.buf.expect("cursor level not positioned"), lev.idx, &key)?;
			if lev.idx != 0 {
				break;
			}
			level += 1;
		}
		Ok(())
	}

	fn updkey(&self, tp: &mut Trans<'_, R>, key: T::Key, start: usize) -> IoResult<()> {
		let path = self.path.clone();
		self.updkey_on(tp, &path, key, start)
	}

	/// Overwrite the record under the cursor, fixing parent keys if it
	/// is the first in its block.
	pub fn update(&mut self, tp: &mut Trans<'_, R>, rec: &T::Rec) -> IoResult<()> {
		let id = self.pathbuf(0);
		let idx = self.path[0].idx;
		self.put_rec(tp, id, idx, rec)?;
		if idx == 0 && self.nlevels > 1 {
			self.updkey(tp, self.tree.key_of(rec), 1)?;
		}
		Ok(())
	}

	// insertion --------------------------------------------------------

	/// Insert `rec` at the insertion point established by a preceding
	/// `lookup`.
	pub fn insert(&mut self, tp: &mut Trans<'_, R>, rec: T::Rec) -> IoResult<()> {
		let mut level = 0usize;
		let mut key = self.tree.key_of(&rec);
		let mut nrec = Some(rec);
		let mut nptr = 0u64;
		loop {
			if level == self.nlevels {
				self.newroot(tp)?;
				break;
			}
			match self.insrec(tp, level, key, nrec.take(), nptr)? {
				None => break,
				Some((k, p)) => {
					key = k;
					nptr = p;
					level += 1;
					if level < self.nlevels {
						// the right half's entry goes just after ours
						self.path[level].idx += 1;
					}
				}
			}
		}
		// leave a pristine path at the inserted record
		let key = self.tree.key_of(&rec);
		if !self.lookup(tp, LookupDir::Eq, key)? {
			return Err(corrupt!("{}: inserted record went missing", T::NAME));
		}
		Ok(())
	}

	fn insrec(
		&mut self,
		tp: &mut Trans<'_, R>,
		level: usize,
		key: T::Key,
		nrec: Option<T::Rec>,
		nptr: u64,
	) -> IoResult<Option<(T::Key, u64)>> {
		let mut prop = None;
		loop {
			let id = self.pathbuf(level);
			let hdr = self.read_hdr(tp, id)?;
			let maxr = self.block_maxrecs(tp, level);
			if (hdr.numrecs as usize) < maxr {
				break;
			}
			if T::ROOT_IN_INODE && level + 1 == self.nlevels {
				self.root_split(tp, level)?;
				continue;
			}
			let idx = self.path[level].idx;
			if idx < maxr && self.rshift(tp, level)? {
				continue;
			}
			if idx > 0 && self.lshift(tp, level)? {
				self.path[level].idx -= 1;
				continue;
			}
			prop = Some(self.split(tp, level)?);
			break;
		}

		let id = self.pathbuf(level);
		let hdr = self.read_hdr(tp, id)?;
		let n = hdr.numrecs as usize;
		let idx = self.path[level].idx;
		assert!(idx <= n, "insertion point out of range");

		if level == 0 {
			let rec = nrec.expect("leaf insert without a record");
			tp.bcopy_within(id, self.rec_off(idx)..self.rec_off(n), self.rec_off(idx + 1));
			self.put_rec(tp, id, idx, &rec)?;
		} else {
			let maxr = self.block_maxrecs(tp, level);
			tp.bcopy_within(id, self.key_off(idx)..self.key_off(n), self.key_off(idx + 1));
			tp.bcopy_within(
				id,
				self.ptr_off(idx, maxr)..self.ptr_off(n, maxr),
				self.ptr_off(idx + 1, maxr),
			);
			self.put_key(tp, id, idx, &key)?;
			self.put_ptr(tp, id, maxr, idx, nptr)?;
		}
		let mut h = hdr;
		h.numrecs += 1;
		self.write_hdr(tp, id, &h)?;
		if idx == 0 && level + 1 < self.nlevels {
			self.updkey(tp, key, level + 1)?;
		}
		Ok(prop)
	}

	/// Move this block's last entry into the right sibling.
	fn rshift(&mut self, tp: &mut Trans<'_, R>, level: usize) -> IoResult<bool> {
		let id = self.pathbuf(level);
		let hdr = self.read_hdr(tp, id)?;
		if hdr.rightsib == self.tree.null_ptr() {
			return Ok(false);
		}
		let rid = self.tree.buf_of(tp, hdr.rightsib)?;
		let mut rhdr = self.read_hdr(tp, rid)?;
		self.check_hdr(tp, &rhdr, level)?;
		let maxr = self.tree.maxrecs(tp, level == 0, false);
		let rn = rhdr.numrecs as usize;
		if rn >= maxr {
			return Ok(false);
		}
		let n = hdr.numrecs as usize;

		if level == 0 {
			tp.bcopy_within(rid, self.rec_off(0)..self.rec_off(rn), self.rec_off(1));
			let b = tp.bbytes(id, self.rec_off(n - 1), self.tree.rec_len());
			tp.bput(rid, self.rec_off(0), &b);
		} else {
			tp.bcopy_within(rid, self.key_off(0)..self.key_off(rn), self.key_off(1));
			tp.bcopy_within(
				rid,
				self.ptr_off(0, maxr)..self.ptr_off(rn, maxr),
				self.ptr_off(1, maxr),
			);
			let kb = tp.bbytes(id, self.key_off(n - 1), self.tree.key_len());
			tp.bput(rid, self.key_off(0), &kb);
			let pb = tp.bbytes(id, self.ptr_off(n - 1, maxr), self.tree.ptr_len());
			tp.bput(rid, self.ptr_off(0, maxr), &pb);
		}
		let mut h = hdr;
		h.numrecs -= 1;
		self.write_hdr(tp, id, &h)?;
		rhdr.numrecs += 1;
		self.write_hdr(tp, rid, &rhdr)?;

		// the right block's first key changed
		let rkey = self.first_key_of(tp, rid, level)?;
		match self.sib_path(tp, level, true)? {
			Some(p) => self.updkey_on(tp, &p, rkey, level + 1)?,
			None => return Err(corrupt!("{}: sibling without a spine", T::NAME)),
		}
		Ok(true)
	}

	/// Move this block's first entry into the left sibling.
	fn lshift(&mut self, tp: &mut Trans<'_, R>, level: usize) -> IoResult<bool> {
		let id = self.pathbuf(level);
		let hdr = self.read_hdr(tp, id)?;
		if hdr.leftsib == self.tree.null_ptr() {
			return Ok(false);
		}
		let lid = self.tree.buf_of(tp, hdr.leftsib)?;
		let mut lhdr = self.read_hdr(tp, lid)?;
		self.check_hdr(tp, &lhdr, level)?;
		let maxr = self.tree.maxrecs(tp, level == 0, false);
		let ln = lhdr.numrecs as usize;
		if ln >= maxr {
			return Ok(false);
		}
		let n = hdr.numrecs as usize;

		if level == 0 {
			let b = tp.bbytes(id, self.rec_off(0), self.tree.rec_len());
			tp.bput(lid, self.rec_off(ln), &b);
			tp.bcopy_within(id, self.rec_off(1)..self.rec_off(n), self.rec_off(0));
		} else {
			let kb = tp.bbytes(id, self.key_off(0), self.tree.key_len());
			tp.bput(lid, self.key_off(ln), &kb);
			let pb = tp.bbytes(id, self.ptr_off(0, maxr), self.tree.ptr_len());
			tp.bput(lid, self.ptr_off(ln, maxr), &pb);
			tp.bcopy_within(id, self.key_off(1)..self.key_off(n), self.key_off(0));
			tp.bcopy_within(
				id,
				self.ptr_off(1, maxr)..self.ptr_off(n, maxr),
				self.ptr_off(0, maxr),
			);
		}
		lhdr.numrecs += 1;
		self.write_hdr(tp, lid, &lhdr)?;
		let mut h = hdr;
		h.numrecs -= 1;
		self.write_hdr(tp, id, &h)?;

		// our first key changed
		let k = self.first_key_of(tp, id, level)?;
		self.updkey(tp, k, level + 1)?;
		Ok(true)
	}

	/// Split the block at `level`, allocating a right sibling and moving
	/// the upper half of the entries there.  Returns the new block's
	/// separator key and pointer for the parent; the cursor follows its
	/// entry into whichever half it lands in.
	fn split(&mut self, tp: &mut Trans<'_, R>, level: usize) -> IoResult<(T::Key, u64)> {
		let id = self.pathbuf(level);
		let hdr = self.read_hdr(tp, id)?;
		let n = hdr.numrecs as usize;
		let lptr = self.path[level].ptr;

		let Some(rptr) = self.tree.alloc_block(tp, lptr)? else {
			return Err(err!(ENOSPC));
		};
		let rid = self.tree.new_buf(tp, rptr)?;

		let rn = n / 2;
		let ln = n - rn;
		let maxr = self.tree.maxrecs(tp, level == 0, false);

		if level == 0 {
			let b = tp.bbytes(id, self.rec_off(ln), rn * self.tree.rec_len());
			tp.bput(rid, self.rec_off(0), &b);
		} else {
			let kb = tp.bbytes(id, self.key_off(ln), rn * self.tree.key_len());
			tp.bput(rid, self.key_off(0), &kb);
			let src = self.block_maxrecs(tp, level);
			let pb = tp.bbytes(id, self.ptr_off(ln, src), rn * self.tree.ptr_len());
			tp.bput(rid, self.ptr_off(0, maxr), &pb);
		}
		self.write_hdr(
			tp,
			rid,
			&BtHdr {
				magic:    self.tree.magic(),
				level:    level as u16,
				numrecs:  rn as u16,
				leftsib:  lptr,
				rightsib: hdr.rightsib,
			},
		)?;
		let mut h = hdr;
		h.numrecs = ln as u16;
		h.rightsib = rptr;
		self.write_hdr(tp, id, &h)?;

		// rebind the old right neighbor's back link
		let orptr = hdr.rightsib;
		if orptr != self.tree.null_ptr() {
			let oid = self.tree.buf_of(tp, orptr)?;
			let mut ohdr = self.read_hdr(tp, oid)?;
			ohdr.leftsib = rptr;
			self.write_hdr(tp, oid, &ohdr)?;
		}

		let rkey = self.first_key_of(tp, rid, level)?;
		if self.path[level].idx >= ln {
			self.path[level] = Lev {
				buf: Some(rid),
				ptr: rptr,
				idx: self.path[level].idx - ln,
				ra:  0,
			};
		}
		Stats::bump(&tp.fs.stats.splits);
		log::trace!(
			"{}: split level {level}: {lptr:#x} -> {lptr:#x}/{rptr:#x}",
			T::NAME
		);
		Ok((rkey, rptr))
	}

	/// Grow the tree: the old root has split, put a new root block above
	/// the two halves.
	fn newroot(&mut self, tp: &mut Trans<'_, R>) -> IoResult<()> {
		assert!(!T::ROOT_IN_INODE);
		let (lptr, _) = self.tree.root(tp)?;
		let lid = self.tree.buf_of(tp, lptr)?;
		let lhdr = self.read_hdr(tp, lid)?;
		if lhdr.rightsib == self.tree.null_ptr() {
			return Err(corrupt!("{}: root split left no sibling", T::NAME));
		}
		let rptr = lhdr.rightsib;
		let rid = self.tree.buf_of(tp, rptr)?;

		let Some(nptr) = self.tree.alloc_block(tp, lptr)? else {
			return Err(err!(ENOSPC));
		};
		let nid = self.tree.new_buf(tp, nptr)?;

		let level = lhdr.level as usize + 1;
		self.write_hdr(
			tp,
			nid,
			&BtHdr {
				magic:    self.tree.magic(),
				level:    level as u16,
				numrecs:  2,
				leftsib:  self.tree.null_ptr(),
				rightsib: self.tree.null_ptr(),
			},
		)?;
		let maxr = self.tree.maxrecs(tp, false, false);
		let lkey = self.first_key_of(tp, lid, level - 1)?;
		let rkey = self.first_key_of(tp, rid, level - 1)?;
		self.put_key(tp, nid, 0, &lkey)?;
		self.put_key(tp, nid, 1, &rkey)?;
		self.put_ptr(tp, nid, maxr, 0, lptr)?;
		self.put_ptr(tp, nid, maxr, 1, rptr)?;

		self.tree.set_root(tp, nptr, self.nlevels + 1)?;
		let idx = usize::from(self.path[self.nlevels - 1].ptr == rptr);
		self.nlevels += 1;
		self.path.push(Lev {
			buf: Some(nid),
			ptr: nptr,
			idx,
			ra: 0,
		});
		Stats::bump(&tp.fs.stats.newroots);
		log::trace!("{}: new root {nptr:#x} at height {}", T::NAME, self.nlevels);
		Ok(())
	}

	/// Grow an inode-rooted tree: push the packed root's entries down
	/// into a fresh block and leave the root with a single pointer.
	fn root_split(&mut self, tp: &mut Trans<'_, R>, level: usize) -> IoResult<()> {
		let rid = self.pathbuf(level);
		let hdr = self.read_hdr(tp, rid)?;
		assert!(hdr.level >= 1, "inline root must be above the leaves");
		let n = hdr.numrecs as usize;

		let Some(cptr) = self.tree.alloc_block(tp, 0)? else {
			return Err(err!(ENOSPC));
		};
		let cid = self.tree.new_buf(tp, cptr)?;

		let rmax = self.block_maxrecs(tp, level);
		let cmax = self.tree.maxrecs(tp, false, false);
		let kb = tp.bbytes(rid, self.key_off(0), n * self.tree.key_len());
		tp.bput(cid, self.key_off(0), &kb);
		let pb = tp.bbytes(rid, self.ptr_off(0, rmax), n * self.tree.ptr_len());
		tp.bput(cid, self.ptr_off(0, cmax), &pb);
		self.write_hdr(
			tp,
			cid,
			&BtHdr {
				magic:    self.tree.magic(),
				level:    hdr.level,
				numrecs:  n as u16,
				leftsib:  self.tree.null_ptr(),
				rightsib: self.tree.null_ptr(),
			},
		)?;

		let rootkey = self.key_at(tp, rid, 0)?;
		self.write_hdr(
			tp,
			rid,
			&BtHdr {
				magic:    self.tree.magic(),
				level:    hdr.level + 1,
				numrecs:  1,
				leftsib:  self.tree.null_ptr(),
				rightsib: self.tree.null_ptr(),
			},
		)?;
		self.put_key(tp, rid, 0, &rootkey)?;
		self.put_ptr(tp, rid, rmax, 0, cptr)?;

		let old = self.path[level];
		self.path[level] = Lev {
			buf: Some(cid),
			ptr: cptr,
			idx: old.idx,
			ra:  0,
		};
		self.path.push(Lev {
			buf: Some(rid),
			ptr: NULLFSBLOCK,
			idx: 0,
			ra:  0,
		});
		self.nlevels += 1;
		Stats::bump(&tp.fs.stats.newroots);
		log::trace!("{}: root pushed down into {cptr:#x}", T::NAME);
		Ok(())
	}

	// deletion ---------------------------------------------------------

	/// Delete the record under the cursor, rebalancing as needed.  The
	/// path is stale afterwards; reposition with `lookup` before using
	/// the cursor again.
	pub fn delete(&mut self, tp: &mut Trans<'_, R>) -> IoResult<()> {
		let mut level = 0;
		while self.delrec(tp, level)? {
			level += 1;
		}
		Ok(())
	}

	fn delrec(&mut self, tp: &mut Trans<'_, R>, level: usize) -> IoResult<bool> {
		let id = self.pathbuf(level);
		let mut hdr = self.read_hdr(tp, id)?;
		let n = hdr.numrecs as usize;
		let idx = self.path[level].idx;
		assert!(idx < n, "cursor is not at a record");
		let maxr = self.block_maxrecs(tp, level);

		if level == 0 {
			tp.bcopy_within(id, self.rec_off(idx + 1)..self.rec_off(n), self.rec_off(idx));
		} else {
			tp.bcopy_within(id, self.key_off(idx + 1)..self.key_off(n), self.key_off(idx));
			tp.bcopy_within(
				id,
				self.ptr_off(idx + 1, maxr)..self.ptr_off(n, maxr),
				self.ptr_off(idx, maxr),
			);
		}
		hdr.numrecs -= 1;
		self.write_hdr(tp, id, &hdr)?;
		let n = n - 1;

		if idx == 0 && n > 0 && level + 1 < self.nlevels {
			let k = self.first_key_of(tp, id, level)?;
			self.updkey(tp, k, level + 1)?;
		}

		if level + 1 == self.nlevels {
			// at the root: collapse once a lone child remains
			if !T::ROOT_IN_INODE && level > 0 && n == 1 {
				let cptr = self.ptr_at(tp, id, maxr, 0)?;
				let rootptr = self.path[level].ptr;
				self.tree.set_root(tp, cptr, self.nlevels - 1)?;
				self.tree.free_block(tp, rootptr)?;
				tp.binval(id);
				self.nlevels -= 1;
				self.path.pop();
				Stats::bump(&tp.fs.stats.joins);
				log::trace!("{}: root collapsed into {cptr:#x}", T::NAME);
			}
			return Ok(false);
		}

		let minr = maxr / 2;
		if n >= minr {
			return Ok(false);
		}

		// First choice: pull a record over from the right sibling.
		if hdr.rightsib != self.tree.null_ptr() {
			if let Some(rpath) = self.sib_path(tp, level, true)? {
				let rid = rpath[level].buf.expect("cursor level not positioned");
				let mut rhdr = self.read_hdr(tp, rid)?;
				let rn = rhdr.numrecs as usize;
				if rn > minr {
					if level == 0 {
						let b = tp.bbytes(rid, self.rec_off(0), self.tree.rec_len());
						tp.bput(id, self.rec_off(n), &b);
						tp.bcopy_within(rid, self.rec_off(1)..self.rec_off(rn), self.rec_off(0));
					} else {
						let kb = tp.bbytes(rid, self.key_off(0), self.tree.key_len());
						tp.bput(id, self.key_off(n), &kb);
						let pb = tp.bbytes(rid, self.ptr_off(0, maxr), self.tree.ptr_len());
						tp.bput(id, self.ptr_off(n, maxr), &pb);
						tp.bcopy_within(rid, self.key_off(1)..self.key_off(rn), self.key_off(0));
						tp.bcopy_within(
							rid,
							self.ptr_off(1, maxr)..self.ptr_off(rn, maxr),
							self.ptr_off(0, maxr),
						);
					}
					hdr.numrecs += 1;
					self.write_hdr(tp, id, &hdr)?;
					rhdr.numrecs -= 1;
					self.write_hdr(tp, rid, &rhdr)?;
					let rk = self.first_key_of(tp, rid, level)?;
					self.updkey_on(tp, &rpath, rk, level + 1)?;
					return Ok(false);
				}
			}
		}

		// Second: pull one over from the left sibling.
		if hdr.leftsib != self.tree.null_ptr() {
			if let Some(lpath) = self.sib_path(tp, level, false)? {
				let lid = lpath[level].buf.expect("cursor level not positioned");
				let mut lhdr = self.read_hdr(tp, lid)?;
				let ln = lhdr.numrecs as usize;
				if ln > minr {
					if level == 0 {
						tp.bcopy_within(id, self.rec_off(0)..self.rec_off(n), self.rec_off(1));
						let b = tp.bbytes(lid, self.rec_off(ln - 1), self.tree.rec_len());
						tp.bput(id, self.rec_off(0), &b);
					} else {
						tp.bcopy_within(id, self.key_off(0)..self.key_off(n), self.key_off(1));
						tp.bcopy_within(
							id,
							self.ptr_off(0, maxr)..self.ptr_off(n, maxr),
							self.ptr_off(1, maxr),
						);
						let kb = tp.bbytes(lid, self.key_off(ln - 1), self.tree.key_len());
						tp.bput(id, self.key_off(0), &kb);
						let pb = tp.bbytes(lid, self.ptr_off(ln - 1, maxr), self.tree.ptr_len());
						tp.bput(id, self.ptr_off(0, maxr), &pb);
					}
					hdr.numrecs += 1;
					self.write_hdr(tp, id, &hdr)?;
					lhdr.numrecs -= 1;
					self.write_hdr(tp, lid, &lhdr)?;
					self.path[level].idx += 1;
					let k = self.first_key_of(tp, id, level)?;
					self.updkey(tp, k, level + 1)?;
					return Ok(false);
				}
			}
		}

		// Last: join with a sibling and drop its entry from the parent.
		if hdr.rightsib != self.tree.null_ptr() {
			let Some(rpath) = self.sib_path(tp, level, true)? else {
				return Err(corrupt!("{}: sibling without a spine", T::NAME));
			};
			let rid = rpath[level].buf.expect("cursor level not positioned");
			let rhdr = self.read_hdr(tp, rid)?;
			let rn = rhdr.numrecs as usize;
			assert!(n + rn <= maxr);
			if level == 0 {
				let b = tp.bbytes(rid, self.rec_off(0), rn * self.tree.rec_len());
				tp.bput(id, self.rec_off(n), &b);
			} else {
				let kb = tp.bbytes(rid, self.key_off(0), rn * self.tree.key_len());
				tp.bput(id, self.key_off(n), &kb);
				let pb = tp.bbytes(rid, self.ptr_off(0, maxr), rn * self.tree.ptr_len());
				tp.bput(id, self.ptr_off(n, maxr), &pb);
			}
			hdr.numrecs = (n + rn) as u16;
			hdr.rightsib = rhdr.rightsib;
			self.write_hdr(tp, id, &hdr)?;
			if rhdr.rightsib != self.tree.null_ptr() {
				let rrid = self.tree.buf_of(tp, rhdr.rightsib)?;
				let mut rrhdr = self.read_hdr(tp, rrid)?;
				rrhdr.leftsib = self.path[level].ptr;
				self.write_hdr(tp, rrid, &rrhdr)?;
			}
			let rptr = rpath[level].ptr;
			self.tree.free_block(tp, rptr)?;
			tp.binval(rid);
			for l in level + 1..self.nlevels {
				self.path[l] = rpath[l];
			}
			Stats::bump(&tp.fs.stats.joins);
			return Ok(true);
		}
		if hdr.leftsib != self.tree.null_ptr() {
			let Some(lpath) = self.sib_path(tp, level, false)? else {
				return Err(corrupt!("{}: sibling without a spine", T::NAME));
			};
			let lid = lpath[level].buf.expect("cursor level not positioned");
			let mut lhdr = self.read_hdr(tp, lid)?;
			let ln = lhdr.numrecs as usize;
			assert!(ln + n <= maxr);
			if level == 0 {
				let b = tp.bbytes(id, self.rec_off(0), n * self.tree.rec_len());
				tp.bput(lid, self.rec_off(ln), &b);
			} else {
				let kb = tp.bbytes(id, self.key_off(0), n * self.tree.key_len());
				tp.bput(lid, self.key_off(ln), &kb);
				let pb = tp.bbytes(id, self.ptr_off(0, maxr), n * self.tree.ptr_len());
				tp.bput(lid, self.ptr_off(ln, maxr), &pb);
			}
			lhdr.numrecs = (ln + n) as u16;
			lhdr.rightsib = hdr.rightsib;
			self.write_hdr(tp, lid, &lhdr)?;
			if hdr.rightsib != self.tree.null_ptr() {
				let rrid = self.tree.buf_of(tp, hdr.rightsib)?;
				let mut rrhdr = self.read_hdr(tp, rrid)?;
				rrhdr.leftsib = lpath[level].ptr;
				self.write_hdr(tp, rrid, &rrhdr)?;
			}
			let myptr = self.path[level].ptr;
			self.tree.free_block(tp, myptr)?;
			tp.binval(id);
			self.path[level] = Lev {
				buf: lpath[level].buf,
				ptr: lpath[level].ptr,
				idx: ln + idx,
				ra:  0,
			};
			Stats::bump(&tp.fs.stats.joins);
			return Ok(true);
		}
		// the only block of its level: underfull is legal until the
		// owner collapses the tree
		Ok(false)
	}
}
