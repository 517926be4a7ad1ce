use std::{
	collections::HashMap,
	io::{Error as IoError, Result as IoResult},
};

use bincode::{Decode, Encode};

use super::*;
use crate::{corrupt, err};

/// Identity of a buffer pinned to a transaction.
///
/// Almost all buffers are device blocks.  The block-map tree root of an
/// inode lives in the inode literal area rather than in its own block;
/// it joins the pinned-buffer table under a synthetic key so that the
/// cursor reads every tree level through the same accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum BufId {
	Block(FsBlock),
	IRoot(Ino),
}

/// A pinned buffer.
pub(crate) struct Buf {
	pub id:    BufId,
	pub data:  Vec<u8>,
	prior:     Vec<u8>,
	pub dirty: Option<(usize, usize)>,
	pub stale: bool,
}

impl Buf {
	pub fn decode_at<T: Decode>(&self, cfg: Config, off: usize) -> IoResult<T> {
		cfg.decode_slice(&self.data[off..])
	}

	pub fn encode_at<T: Encode>(&mut self, cfg: Config, off: usize, v: &T) -> IoResult<usize> {
		cfg.encode_slice(&mut self.data[off..], v)
	}

	fn mark_dirty(&mut self, first: usize, last: usize) {
		assert!(first <= last && last < self.data.len());
		self.dirty = match self.dirty {
			None => Some((first, last)),
			Some((f, l)) => Some((f.min(first), l.max(last))),
		};
	}
}

/// What a journal record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
	Block(FsBlock),
	InodeRoot(Ino),
	Super,
}

/// A before-image of a byte range, as handed to the journal.
#[derive(Debug, Clone)]
pub struct LogRec {
	pub tid:    u64,
	pub target: LogTarget,
	pub off:    u64,
	pub before: Vec<u8>,
}

/// Write-ahead log contract.
///
/// The engine writes before-images of every region it is about to dirty
/// and then a commit record; the journal promises that a committed
/// transaction is atomic with respect to crash recovery, and that commit
/// order equals the order of `commit` calls.  Recovery itself is an
/// external collaborator.
pub trait Journal {
	fn write(&mut self, rec: LogRec) -> IoResult<Lsn>;
	fn commit(&mut self, tid: u64, sync: bool) -> IoResult<Lsn>;
	fn force(&mut self) -> IoResult<Lsn>;
}

/// In-memory reference journal.
#[derive(Debug, Default)]
pub struct MemJournal {
	lsn:     Lsn,
	forced:  Lsn,
	records: Vec<LogRec>,
	commits: Vec<(u64, Lsn)>,
}

impl MemJournal {
	pub fn records(&self) -> &[LogRec] {
		&self.records
	}

	pub fn commits(&self) -> &[(u64, Lsn)] {
		&self.commits
	}

	pub fn forced_lsn(&self) -> Lsn {
		self.forced
	}
}

impl Journal for MemJournal {
	fn write(&mut self, rec: LogRec) -> IoResult<Lsn> {
		self.lsn += 1;
		self.records.push(rec);
		Ok(self.lsn)
	}

	fn commit(&mut self, tid: u64, sync: bool) -> IoResult<Lsn> {
		self.lsn += 1;
		self.commits.push((tid, self.lsn));
		if sync {
			self.forced = self.lsn;
		}
		Ok(self.lsn)
	}

	fn force(&mut self) -> IoResult<Lsn> {
		self.forced = self.lsn;
		Ok(self.lsn)
	}
}

/// Superblock counters a transaction may modify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SbField {
	Icount,
	Ifree,
	Fdblocks,
	Frextents,
}

/// A transaction: the unit of atomic metadata change.
///
/// A transaction owns its pinned buffers and its block reservation until
/// `commit` or `cancel`; dropping an uncommitted transaction cancels it.
pub struct Trans<'a, R: Backend> {
	pub(crate) fs: &'a mut Xfs<R>,

	tid:   u64,
	bufs:  HashMap<BufId, Buf>,
	order: Vec<BufId>,

	blk_res:   ExtLen,
	sb_delta:  [i64; 4],
	sb_logged: bool,

	pub(crate) dq: Vec<quota::DqDelta>,

	sync: bool,
	done: bool,
}

impl<'a, R: Backend> std::fmt::Debug for Trans<'a, R> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Trans")
			.field("tid", &self.tid)
			.field("blk_res", &self.blk_res)
			.field("sync", &self.sync)
			.field("done", &self.done)
			.finish_non_exhaustive()
	}
}

impl<R: Backend> Xfs<R> {
	/// Start a transaction, reserving `blocks` free blocks for it.
	pub fn trans_alloc(&mut self, blocks: ExtLen) -> IoResult<Trans<'_, R>> {
		if self.is_shutdown() {
			return Err(err!(EIO));
		}
		if blocks > 0 {
			self.assert_rw()?;
			if (self.sb.fdblocks as i64) < blocks as i64 {
				return Err(err!(ENOSPC));
			}
			self.sb.fdblocks -= blocks as u64;
		}
		let tid = self.next_tid;
		self.next_tid += 1;
		log::trace!("trans_alloc(tid={tid}, blocks={blocks})");
		Ok(Trans {
			fs: self,
			tid,
			bufs: HashMap::new(),
			order: Vec::new(),
			blk_res: blocks,
			sb_delta: [0; 4],
			sb_logged: false,
			dq: Vec::new(),
			sync: false,
			done: false,
		})
	}
}

impl<'a, R: Backend> Trans<'a, R> {
	pub(crate) fn cfg(&self) -> Config {
		self.fs.file.config()
	}

	pub fn tid(&self) -> u64 {
		self.tid
	}

	pub fn is_sync(&self) -> bool {
		self.sync
	}

	/// Make the commit force the journal before returning.
	pub fn set_sync(&mut self) {
		self.sync = true;
	}

	fn check_fsb(&self, fsb: FsBlock, nblocks: usize) -> IoResult<()> {
		let sb = &self.fs.sb;
		let agno = sb.fsb_to_agno(fsb);
		let agbno = sb.fsb_to_agbno(fsb);
		if agno >= sb.agcount || agbno as u64 + nblocks as u64 > sb.agblocks as u64 {
			return Err(corrupt!("block pointer {fsb:#x} out of range"));
		}
		Ok(())
	}

	/// Read a buffer and join it to the transaction.
	pub(crate) fn read_buf(&mut self, fsb: FsBlock, nblocks: usize) -> IoResult<BufId> {
		if self.fs.is_shutdown() {
			return Err(err!(EIO));
		}
		self.check_fsb(fsb, nblocks)?;
		let id = BufId::Block(fsb);
		if self.bufs.contains_key(&id) {
			return Ok(id);
		}
		let len = nblocks << self.fs.sb.blocklog;
		let mut data = vec![0u8; len];
		self.fs.file.read_at(self.fs.sb.fsb_to_daddr(fsb), &mut data)?;
		self.bufs.insert(
			id,
			Buf {
				id,
				prior: data.clone(),
				data,
				dirty: None,
				stale: false,
			},
		);
		Ok(id)
	}

	/// Get a zero-filled buffer for a newly allocated block, without
	/// reading the medium.
	pub(crate) fn get_buf(&mut self, fsb: FsBlock, nblocks: usize) -> IoResult<BufId> {
		if self.fs.is_shutdown() {
			return Err(err!(EIO));
		}
		self.check_fsb(fsb, nblocks)?;
		let id = BufId::Block(fsb);
		let len = nblocks << self.fs.sb.blocklog;
		let data = vec![0u8; len];
		self.bufs.insert(
			id,
			Buf {
				id,
				prior: data.clone(),
				data,
				dirty: None,
				stale: false,
			},
		);
		Ok(id)
	}

	/// Join an inode's in-literal-area tree root as a synthetic buffer.
	pub(crate) fn join_iroot(&mut self, ino: Ino, bytes: Vec<u8>) -> BufId {
		let id = BufId::IRoot(ino);
		self.bufs.insert(
			id,
			Buf {
				id,
				prior: bytes.clone(),
				data: bytes,
				dirty: None,
				stale: false,
			},
		);
		id
	}

	/// Detach the synthetic root buffer, returning its bytes.
	pub(crate) fn take_iroot(&mut self, ino: Ino) -> Vec<u8> {
		let id = BufId::IRoot(ino);
		self.order.retain(|o| *o != id);
		match self.bufs.remove(&id) {
			Some(b) => b.data,
			None => panic!("inode root {ino} is not joined to the transaction"),
		}
	}

	pub(crate) fn buf(&self, id: BufId) -> &Buf {
		match self.bufs.get(&id) {
			Some(b) => b,
			None => panic!("buffer {id:?} is not joined to the transaction"),
		}
	}

	pub(crate) fn buf_mut(&mut self, id: BufId) -> &mut Buf {
		match self.bufs.get_mut(&id) {
			Some(b) => b,
			None => panic!("buffer {id:?} is not joined to the transaction"),
		}
	}

	/// Record a dirty byte range on a buffer.  Calls are cumulative.
	pub(crate) fn log_buf(&mut self, id: BufId, first: usize, last: usize) {
		let buf = match self.bufs.get_mut(&id) {
			Some(b) => b,
			None => panic!("buffer {id:?} is not joined to the transaction"),
		};
		let fresh = buf.dirty.is_none();
		buf.mark_dirty(first, last);
		if fresh {
			self.order.push(id);
		}
	}

	/// Mark a buffer stale: its block was freed, nothing gets written back.
	pub(crate) fn binval(&mut self, id: BufId) {
		let buf = self.buf_mut(id);
		buf.stale = true;
		buf.dirty = None;
	}

	/// Drop a clean buffer from the transaction.
	pub(crate) fn brelse(&mut self, id: BufId) {
		if let Some(b) = self.bufs.get(&id) {
			if b.dirty.is_none() && !b.stale {
				self.bufs.remove(&id);
			}
		}
	}

	/// Decode a value out of a pinned buffer.
	pub(crate) fn bread<T: Decode>(&self, id: BufId, off: usize) -> IoResult<T> {
		self.buf(id).decode_at(self.cfg(), off)
	}

	/// Encode a value into a pinned buffer and log the range.
	pub(crate) fn bwrite<T: Encode>(&mut self, id: BufId, off: usize, v: &T) -> IoResult<()> {
		let cfg = self.cfg();
		let n = self.buf_mut(id).encode_at(cfg, off, v)?;
		self.log_buf(id, off, off + n - 1);
		Ok(())
	}

	/// Copy bytes out of a pinned buffer.
	pub(crate) fn bbytes(&self, id: BufId, off: usize, len: usize) -> Vec<u8> {
		self.buf(id).data[off..off + len].to_vec()
	}

	/// Store bytes into a pinned buffer and log the range.
	pub(crate) fn bput(&mut self, id: BufId, off: usize, bytes: &[u8]) {
		if bytes.is_empty() {
			return;
		}
		self.buf_mut(id).data[off..off + bytes.len()].copy_from_slice(bytes);
		self.log_buf(id, off, off + bytes.len() - 1);
	}

	/// Move a byte range within a pinned buffer and log the union.
	pub(crate) fn bcopy_within(&mut self, id: BufId, src: std::ops::Range<usize>, dst: usize) {
		if src.is_empty() {
			return;
		}
		let len = src.len();
		let (first, last) = (src.start.min(dst), (src.end - 1).max(dst + len - 1));
		self.buf_mut(id).data.copy_within(src, dst);
		self.log_buf(id, first, last);
	}

	/// Zero-fill a byte range and log it.
	pub(crate) fn bfill(&mut self, id: BufId, off: usize, len: usize, byte: u8) {
		if len == 0 {
			return;
		}
		self.buf_mut(id).data[off..off + len].fill(byte);
		self.log_buf(id, off, off + len - 1);
	}

	/// Prefetch hint for a sibling block the cursor expects to visit next.
	pub(crate) fn readahead(&mut self, fsb: FsBlock) {
		log::trace!("readahead({fsb:#x})");
	}

	/// Accumulate a superblock counter delta, applied at commit.
	pub(crate) fn mod_sb(&mut self, field: SbField, delta: i64) {
		self.sb_delta[field as usize] += delta;
	}

	/// Force the superblock to be rewritten at commit even if no counter
	/// changed (inode pointers, quota flags).
	pub fn log_sb(&mut self) {
		self.sb_logged = true;
	}

	// AG header plumbing ----------------------------------------------

	pub(crate) fn read_agf(&mut self, agno: AgNumber) -> IoResult<BufId> {
		let fsb = self.fs.sb.agb_to_fsb(agno, AGF_BLOCK);
		let id = self.read_buf(fsb, 1)?;
		let agf: Agf = self.bread(id, 0)?;
		if agf.magicnum != AGF_MAGIC || agf.versionnum != AGF_VERSION || agf.seqno != agno {
			return Err(corrupt!("AG{agno}: bad AGF header"));
		}
		if !self.fs.perag[agno as usize].pagf_init {
			let pag = &mut self.fs.perag[agno as usize];
			pag.pagf_init = true;
			pag.freeblks = agf.freeblks;
			pag.longest = agf.longest;
			pag.flcount = agf.flcount;
			pag.levels = agf.levels;
		}
		Ok(id)
	}

	pub(crate) fn agf(&self, id: BufId) -> IoResult<Agf> {
		self.bread(id, 0)
	}

	pub(crate) fn log_agf(&mut self, id: BufId, agf: &Agf) -> IoResult<()> {
		self.bwrite(id, 0, agf)
	}

	pub(crate) fn read_agi(&mut self, agno: AgNumber) -> IoResult<BufId> {
		let fsb = self.fs.sb.agb_to_fsb(agno, AGI_BLOCK);
		let id = self.read_buf(fsb, 1)?;
		let agi: Agi = self.bread(id, 0)?;
		if agi.magicnum != AGI_MAGIC || agi.versionnum != AGI_VERSION || agi.seqno != agno {
			return Err(corrupt!("AG{agno}: bad AGI header"));
		}
		if !self.fs.perag[agno as usize].pagi_init {
			let pag = &mut self.fs.perag[agno as usize];
			pag.pagi_init = true;
			pag.icount = agi.count;
			pag.ifreecount = agi.freecount;
		}
		Ok(id)
	}

	pub(crate) fn agi(&self, id: BufId) -> IoResult<Agi> {
		self.bread(id, 0)
	}

	pub(crate) fn log_agi(&mut self, id: BufId, agi: &Agi) -> IoResult<()> {
		self.bwrite(id, 0, agi)
	}

	pub(crate) fn read_agfl(&mut self, agno: AgNumber) -> IoResult<BufId> {
		let fsb = self.fs.sb.agb_to_fsb(agno, AGFL_BLOCK);
		self.read_buf(fsb, 1)
	}

	// commit / cancel -------------------------------------------------

	fn rollback(&mut self) {
		if self.blk_res > 0 {
			self.fs.sb.fdblocks += self.blk_res as u64;
		}
		quota::unreserve_and_mod_dquots(self.fs, &self.dq);
		self.bufs.clear();
		self.order.clear();
	}

	/// Cancel the transaction: nothing reaches the medium, reservations
	/// are returned.
	pub fn cancel(mut self) {
		log::trace!("trans_cancel(tid={})", self.tid);
		self.rollback();
		Stats::bump(&self.fs.stats.cancels);
		self.done = true;
	}

	/// Commit the transaction.
	///
	/// Order: before-images to the journal, the commit record, then the
	/// dirty buffers to the medium, then the in-core counters.
	pub fn commit(mut self) -> IoResult<()> {
		self.commit_inner()?;
		self.done = true;
		Ok(())
	}

	/// Commit the work so far and keep going under the remaining block
	/// reservation: the rolling pattern for long operation chains, where
	/// every step must be separately durable.
	pub fn renew(&mut self) -> IoResult<()> {
		let used = self.sb_delta[SbField::Fdblocks as usize].min(0);
		let res_left = (self.blk_res as i64 + used).max(0) as u64;
		self.commit_inner()?;
		let carry = res_left.min(self.fs.sb.fdblocks);
		self.fs.sb.fdblocks -= carry;
		self.blk_res = carry as ExtLen;
		self.tid = self.fs.next_tid;
		self.fs.next_tid += 1;
		self.bufs.clear();
		self.order.clear();
		self.sb_delta = [0; 4];
		self.sb_logged = false;
		self.dq.clear();
		self.sync = false;
		log::trace!("trans_renew(tid={}, carried={})", self.tid, self.blk_res);
		Ok(())
	}

	fn commit_inner(&mut self) -> IoResult<()> {
		log::trace!("trans_commit(tid={}, sync={})", self.tid, self.sync);
		if self.fs.is_shutdown() {
			self.rollback();
			self.done = true;
			return Err(err!(EIO));
		}

		let sb_dirty =
			self.sb_logged || self.blk_res > 0 || self.sb_delta.iter().any(|d| *d != 0);

		// journal the before-images in first-modification order
		for id in &self.order {
			let buf = &self.bufs[id];
			if buf.stale {
				continue;
			}
			let Some((first, last)) = buf.dirty else {
				continue;
			};
			let target = match buf.id {
				BufId::Block(fsb) => LogTarget::Block(fsb),
				BufId::IRoot(ino) => LogTarget::InodeRoot(ino),
			};
			self.fs.journal.write(LogRec {
				tid: self.tid,
				target,
				off: first as u64,
				before: buf.prior[first..=last].to_vec(),
			})?;
		}
		if sb_dirty {
			let mut before = vec![0u8; 512];
			let n = self.cfg().encode_slice(&mut before, &self.fs.sb)?;
			before.truncate(n);
			self.fs.journal.write(LogRec {
				tid: self.tid,
				target: LogTarget::Super,
				off: 0,
				before,
			})?;
		}
		if let Err(e) = self.fs.journal.commit(self.tid, self.sync) {
			self.fs.force_shutdown("journal commit failed");
			self.rollback();
			self.done = true;
			return Err(e);
		}

		// write the dirty buffers through
		for id in &self.order {
			let buf = &self.bufs[id];
			if buf.stale {
				continue;
			}
			let Some((first, last)) = buf.dirty else {
				continue;
			};
			match buf.id {
				BufId::Block(fsb) => {
					let daddr = self.fs.sb.fsb_to_daddr(fsb) + first as u64;
					if let Err(e) = self.fs.file.write_at(daddr, &buf.data[first..=last]) {
						// a committed transaction that cannot reach the
						// medium leaves recovery as the only way out
						self.fs.force_shutdown("metadata write-back failed");
						self.done = true;
						return Err(e);
					}
				}
				// the inode root is written back through the inode block
				BufId::IRoot(_) => (),
			}
		}

		// refresh the per-AG cache from the headers this transaction wrote
		for buf in self.bufs.values() {
			let BufId::Block(fsb) = buf.id else { continue };
			if buf.dirty.is_none() || buf.stale {
				continue;
			}
			let agno = self.fs.sb.fsb_to_agno(fsb) as usize;
			match self.fs.sb.fsb_to_agbno(fsb) {
				AGF_BLOCK => {
					let agf: Agf = buf.decode_at(self.fs.file.config(), 0)?;
					let pag = &mut self.fs.perag[agno];
					pag.pagf_init = true;
					pag.freeblks = agf.freeblks;
					pag.longest = agf.longest;
					pag.flcount = agf.flcount;
					pag.levels = agf.levels;
				}
				AGI_BLOCK => {
					let agi: Agi = buf.decode_at(self.fs.file.config(), 0)?;
					let pag = &mut self.fs.perag[agno];
					pag.pagi_init = true;
					pag.icount = agi.count;
					pag.ifreecount = agi.freecount;
				}
				_ => (),
			}
		}

		// counters: apply the deltas, return the unused reservation
		let sb = &mut self.fs.sb;
		sb.icount = (sb.icount as i64 + self.sb_delta[SbField::Icount as usize]) as u64;
		sb.ifree = (sb.ifree as i64 + self.sb_delta[SbField::Ifree as usize]) as u64;
		sb.frextents =
			(sb.frextents as i64 + self.sb_delta[SbField::Frextents as usize]) as u64;
		let fd = sb.fdblocks as i64
			+ self.blk_res as i64
			+ self.sb_delta[SbField::Fdblocks as usize];
		assert!(fd >= 0, "free-block accounting went negative");
		sb.fdblocks = fd as u64;
		if sb_dirty {
			self.fs.write_sb()?;
		}

		quota::apply_dquot_deltas(self.fs, &self.dq);

		Stats::bump(&self.fs.stats.commits);
		Ok(())
	}
}

impl<R: Backend> Drop for Trans<'_, R> {
	fn drop(&mut self) {
		if !self.done {
			log::trace!("trans drop without commit (tid={}), cancelling", self.tid);
			self.rollback();
			Stats::bump(&self.fs.stats.cancels);
		}
	}
}

#[cfg(test)]
mod t {
	use std::{cell::RefCell, rc::Rc};

	use super::*;
	use crate::xfs::{mkfs::MkfsParams, testutil::mkimg};

	#[derive(Clone, Default)]
	struct SharedJournal(Rc<RefCell<MemJournal>>);

	impl Journal for SharedJournal {
		fn write(&mut self, rec: LogRec) -> IoResult<Lsn> {
			self.0.borrow_mut().write(rec)
		}

		fn commit(&mut self, tid: u64, sync: bool) -> IoResult<Lsn> {
			self.0.borrow_mut().commit(tid, sync)
		}

		fn force(&mut self) -> IoResult<Lsn> {
			self.0.borrow_mut().force()
		}
	}

	#[test]
	fn commit_writes_back() {
		let mut fs = mkimg(&MkfsParams::default());
		let fsb = fs.sb.agb_to_fsb(0, AG_RESERVED_BLOCKS);
		let mut tp = fs.trans_alloc(0).unwrap();
		let id = tp.get_buf(fsb, 1).unwrap();
		tp.bwrite(id, 10, &0xaabbccddu32).unwrap();
		tp.commit().unwrap();

		let v: u32 = fs.file.decode_at(fs.sb.fsb_to_daddr(fsb) + 10).unwrap();
		assert_eq!(v, 0xaabbccdd);
	}

	#[test]
	fn cancel_rolls_back() {
		let mut fs = mkimg(&MkfsParams::default());
		let free0 = fs.sb.fdblocks;
		let fsb = fs.sb.agb_to_fsb(0, AG_RESERVED_BLOCKS);
		let mut tp = fs.trans_alloc(8).unwrap();
		assert_eq!(tp.fs.sb.fdblocks, free0 - 8);
		let id = tp.get_buf(fsb, 1).unwrap();
		tp.bwrite(id, 0, &0x11223344u32).unwrap();
		tp.cancel();

		assert_eq!(fs.sb.fdblocks, free0);
		let v: u32 = fs.file.decode_at(fs.sb.fsb_to_daddr(fsb)).unwrap();
		assert_eq!(v, 0);
	}

	#[test]
	fn drop_acts_as_cancel() {
		let mut fs = mkimg(&MkfsParams::default());
		let free0 = fs.sb.fdblocks;
		{
			let _tp = fs.trans_alloc(16).unwrap();
		}
		assert_eq!(fs.sb.fdblocks, free0);
		assert_eq!(fs.stats().cancels, 1);
	}

	#[test]
	fn journal_sees_before_images() {
		let mut fs = mkimg(&MkfsParams::default());
		let jrn = SharedJournal::default();
		fs.set_journal(Box::new(jrn.clone()));

		let fsb = fs.sb.agb_to_fsb(0, AG_RESERVED_BLOCKS);
		let mut tp = fs.trans_alloc(0).unwrap();
		let id = tp.get_buf(fsb, 1).unwrap();
		tp.bwrite(id, 4, &0xffeeddccu32).unwrap();
		tp.commit().unwrap();

		let j = jrn.0.borrow();
		assert_eq!(j.commits().len(), 1);
		let rec = &j.records()[0];
		assert_eq!(rec.target, LogTarget::Block(fsb));
		assert_eq!(rec.off, 4);
		assert_eq!(rec.before, vec![0u8; 4]);
	}

	#[test]
	fn renew_rolls_the_reservation() {
		let mut fs = mkimg(&MkfsParams::default());
		let free0 = fs.sb.fdblocks;

		let mut tp = fs.trans_alloc(20).unwrap();
		let mut a = AllocArg::new(AllocType::ThisAg, 0, 4, 4);
		tp.alloc_vextent(&mut a).unwrap();
		assert!(a.ok());
		tp.renew().unwrap();

		// the first leg is durable, the rest of the reservation rolled
		assert_eq!(tp.fs.sb.fdblocks, free0 - 20);
		let mut b = AllocArg::new(AllocType::ThisAg, 0, 4, 4);
		tp.alloc_vextent(&mut b).unwrap();
		assert!(b.ok());
		tp.commit().unwrap();

		assert_eq!(fs.sb.fdblocks, free0 - 8);
		fs.check_ag(0).unwrap();
	}

	#[test]
	fn shutdown_blocks_transactions() {
		let mut fs = mkimg(&MkfsParams::default());
		fs.force_shutdown("test");
		let e = fs.trans_alloc(0).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::EIO));
	}

	#[test]
	fn reservation_enforced() {
		let mut fs = mkimg(&MkfsParams::default());
		let e = fs.trans_alloc(u32::MAX).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::ENOSPC));
	}
}
