use std::io::{Error as IoError, Result as IoResult};

use super::{
	btree::{Cursor, LookupDir},
	ialloc_btree::InoBt,
	trans::SbField,
	*,
};
use crate::{corrupt, err};

impl<'a, R: Backend> Trans<'a, R> {
	/// Pick an AG for a new inode.
	///
	/// Directories spread out (anywhere but the parent's AG, if
	/// possible); files cluster near their parent.  `sameag` pins the
	/// choice to the parent's AG outright.
	fn ialloc_ag_select(
		&mut self,
		parent: Ino,
		is_dir: bool,
		sameag: bool,
	) -> IoResult<Option<AgNumber>> {
		let sb = self.fs.sb.clone();
		let agcount = sb.agcount;
		let pagno = sb.ino_to_agno(parent).min(agcount - 1);
		if sameag {
			return Ok(Some(pagno));
		}
		let start = if is_dir { (pagno + 1) % agcount } else { pagno };
		for i in 0..agcount {
			let agno = (start + i) % agcount;
			let agi = self.read_agi(agno)?;
			let agi_s = self.agi(agi)?;
			if agi_s.freecount > 0 {
				return Ok(Some(agno));
			}
			// must have room to grow a chunk, keep the freelist fed, and
			// (for anything that stores data) place one extent
			let agf = self.read_agf(agno)?;
			let agf_s = self.agf(agf)?;
			let mut need =
				sb.chunk_blocks() + super::alloc::min_freelist(&agf_s.levels, self.fs.ag_maxlevels);
			if !is_dir {
				need += 1;
			}
			if agf_s.freeblks >= need {
				return Ok(Some(agno));
			}
		}
		Ok(None)
	}

	/// Allocate a fresh chunk of inodes in this AG and enter it into the
	/// chunk tree.
	fn ialloc_ag_grow(&mut self, agno: AgNumber, agi: BufId) -> IoResult<bool> {
		let sb = self.fs.sb.clone();
		let chunk = sb.chunk_blocks();
		let Some(agf) = self.fix_freelist(agno, chunk, 0, 0, false)? else {
			return Ok(false);
		};
		let mut args = AllocArg::new(AllocType::ThisAg, sb.agb_to_fsb(agno, 0), chunk, chunk);
		if !self.ag_vextent(&mut args, agno, agf, AllocType::ThisAg)? {
			return Ok(false);
		}
		let agbno = sb.fsb_to_agbno(args.fsbno);

		// stamp every inode in the run with a valid, inactive core
		let core = DiskInodeCore::default();
		let cfg = self.cfg();
		for b in 0..chunk {
			let id = self.get_buf(sb.agb_to_fsb(agno, agbno + b), 1)?;
			for i in 0..sb.inopblock as usize {
				let off = i * sb.inodesize as usize;
				self.buf_mut(id).encode_at(cfg, off, &core)?;
				self.buf_mut(id)
					.encode_at(cfg, off + DINODE_CORE_LEN, &NULLAGINO)?;
			}
			let len = self.buf(id).data.len();
			self.log_buf(id, 0, len - 1);
		}

		let newino = sb.agbno_to_agino(agbno, 0);
		let mut cur = Cursor::new(InoBt { agno, agi });
		if cur.lookup(self, LookupDir::Eq, newino)? {
			return Err(corrupt!("AG{agno}: inode chunk {newino} already exists"));
		}
		cur.insert(
			self,
			InobtRec {
				startino:  newino,
				freecount: INODES_PER_CHUNK as i32,
				free:      !0,
			},
		)?;

		let mut agi_s = self.agi(agi)?;
		agi_s.count += INODES_PER_CHUNK;
		agi_s.freecount += INODES_PER_CHUNK;
		agi_s.newino = newino;
		self.log_agi(agi, &agi_s)?;
		self.mod_sb(SbField::Icount, INODES_PER_CHUNK as i64);
		self.mod_sb(SbField::Ifree, INODES_PER_CHUNK as i64);
		log::debug!("ialloc_ag_grow(ag={agno}): chunk at agino {newino}");
		Ok(true)
	}

	/// Allocate one inode number.  `None` means no space anywhere.
	pub fn dialloc(&mut self, parent: Ino, is_dir: bool, sameag: bool) -> IoResult<Option<Ino>> {
		log::trace!("dialloc(parent={parent:#x}, is_dir={is_dir}, sameag={sameag})");
		let Some(agno) = self.ialloc_ag_select(parent, is_dir, sameag)? else {
			return Ok(None);
		};
		let agi = self.read_agi(agno)?;
		let mut agi_s = self.agi(agi)?;
		if agi_s.freecount == 0 {
			if !self.ialloc_ag_grow(agno, agi)? {
				return Ok(None);
			}
			agi_s = self.agi(agi)?;
		}

		let sb = self.fs.sb.clone();
		let hint = if sb.ino_to_agno(parent) == agno {
			sb.ino_to_agino(parent)
		} else if agi_s.newino != NULLAGINO {
			agi_s.newino
		} else {
			0
		};

		// walk right from the hint's chunk, wrapping once to the start
		let mut cur = Cursor::new(InoBt { agno, agi });
		let mut rec = None;
		let mut found = cur.lookup(self, LookupDir::Le, hint)?;
		if !found {
			found = cur.lookup(self, LookupDir::Ge, 0)?;
		}
		while found {
			let r = cur.get_rec(self)?;
			if r.freecount > 0 {
				rec = Some(r);
				break;
			}
			found = cur.increment(self, 0)?;
		}
		if rec.is_none() {
			let mut found = cur.lookup(self, LookupDir::Ge, 0)?;
			while found {
				let r = cur.get_rec(self)?;
				if r.freecount > 0 {
					rec = Some(r);
					break;
				}
				if r.startino >= hint {
					break;
				}
				found = cur.increment(self, 0)?;
			}
		}
		let Some(r) = rec else {
			return Err(corrupt!("AG{agno}: freecount says free inodes, trees say none"));
		};
		if r.free == 0 || r.freecount as u32 != r.free.count_ones() {
			return Err(corrupt!("AG{agno}: chunk {} mask out of step", r.startino));
		}

		let bit = r.free.trailing_zeros();
		let nr = InobtRec {
			startino:  r.startino,
			freecount: r.freecount - 1,
			free:      r.free & !(1u64 << bit),
		};
		cur.update(self, &nr)?;
		agi_s.freecount -= 1;
		self.log_agi(agi, &agi_s)?;
		self.mod_sb(SbField::Ifree, -1);

		let ino = sb.agino_to_ino(agno, r.startino + bit);
		self.fs.icache_drop(ino);
		Stats::bump(&self.fs.stats.ialloc);
		log::trace!("dialloc() = {ino:#x}");
		Ok(Some(ino))
	}

	/// Return an inode number to its chunk.  The chunk itself stays
	/// allocated even when it goes entirely free.
	pub fn difree(&mut self, ino: Ino) -> IoResult<()> {
		log::trace!("difree({ino:#x})");
		self.fs.validate_ino(ino)?;
		let sb = self.fs.sb.clone();
		let agno = sb.ino_to_agno(ino);
		let agino = sb.ino_to_agino(ino);

		let agi = self.read_agi(agno)?;
		let mut cur = Cursor::new(InoBt { agno, agi });
		if !cur.lookup(self, LookupDir::Le, agino)? {
			return Err(corrupt!("AG{agno}: no chunk for inode {agino}"));
		}
		let r = cur.get_rec(self)?;
		if agino < r.startino || agino >= r.startino + INODES_PER_CHUNK {
			return Err(corrupt!("AG{agno}: no chunk covers inode {agino}"));
		}
		let bit = agino - r.startino;
		if r.free & (1u64 << bit) != 0 {
			return Err(corrupt!("AG{agno}: double free of inode {agino}"));
		}
		if r.freecount as u32 != r.free.count_ones() {
			return Err(corrupt!("AG{agno}: chunk {} mask out of step", r.startino));
		}
		let nr = InobtRec {
			startino:  r.startino,
			freecount: r.freecount + 1,
			free:      r.free | (1u64 << bit),
		};
		cur.update(self, &nr)?;

		let mut agi_s = self.agi(agi)?;
		agi_s.freecount += 1;
		self.log_agi(agi, &agi_s)?;
		self.mod_sb(SbField::Ifree, 1);
		self.fs.icache_drop(ino);
		Stats::bump(&self.fs.stats.ifree);
		Ok(())
	}

	/// Allocate and initialize a new inode: the number, a valid core,
	/// and an empty fork matching the file type.
	pub fn create_inode(&mut self, parent: Ino, mode: u16, sameag: bool) -> IoResult<Inode> {
		let is_dir = mode & S_IFMT == S_IFDIR;
		let Some(ino) = self.dialloc(parent, is_dir, sameag)? else {
			return Err(err!(ENOSPC));
		};
		// the previous occupant's core comes through the pinned buffer;
		// a chunk grown in this very transaction is not on disk yet
		let sb = self.fs.sb.clone();
		let id = self.read_buf(sb.ino_to_fsb(ino), 1)?;
		let ioff = sb.agino_to_offset(sb.ino_to_agino(ino)) as usize * sb.inodesize as usize;
		let old: DiskInodeCore = self.bread(id, ioff)?;
		if old.magic != DINODE_MAGIC {
			return Err(corrupt!("inode {ino:#x}: bad magic on allocation"));
		}
		if old.nlink != 0 {
			return Err(corrupt!("inode {ino:#x}: allocated while still linked"));
		}

		let mut core = DiskInodeCore {
			mode,
			nlink: 1,
			gen: old.gen.wrapping_add(1),
			..DiskInodeCore::default()
		};
		let dfork = if is_dir || mode & S_IFMT == S_IFLNK {
			core.format = DiFormat::Local.raw();
			Fork::Local(Vec::new())
		} else {
			core.format = DiFormat::Extents.raw();
			Fork::Extents(Vec::new())
		};
		let ip = Inode {
			ino,
			core,
			dfork,
			afork: None,
		};
		self.reserve_quota(QuotaType::User, ip.core.uid, 0, 1, false)?;
		self.reserve_quota(QuotaType::Proj, ip.core.projid as u32, 0, 1, false)?;
		self.quota_mod(QuotaType::User, ip.core.uid, 0, 1, 0);
		self.quota_mod(QuotaType::Proj, ip.core.projid as u32, 0, 1, 0);
		self.log_inode(&ip)?;
		Ok(ip)
	}

	/// Drop a link; at zero links the inode's blocks and number go back
	/// to their allocators.
	pub fn unlink_inode(&mut self, ip: &mut Inode) -> IoResult<()> {
		if ip.core.nlink == 0 {
			return Err(err!(EINVAL));
		}
		ip.core.nlink -= 1;
		if ip.core.nlink > 0 {
			self.log_inode(ip)?;
			return Ok(());
		}
		self.bunmapi(ip, 0, NULLFILEOFF)?;
		ip.core.mode = 0;
		ip.core.size = 0;
		self.log_inode(ip)?;
		self.quota_mod(QuotaType::User, ip.core.uid, 0, -1, 0);
		self.quota_mod(QuotaType::Proj, ip.core.projid as u32, 0, -1, 0);
		self.difree(ip.ino)
	}

	/// Walk the chunk records of an AG in order; the callback returns
	/// whether to continue.
	pub fn inobt_walk(
		&mut self,
		agno: AgNumber,
		mut f: impl FnMut(&InobtRec) -> bool,
	) -> IoResult<()> {
		let agi = self.read_agi(agno)?;
		let mut cur = Cursor::new(InoBt { agno, agi });
		let mut found = cur.lookup(self, LookupDir::Ge, 0)?;
		while found {
			let r = cur.get_rec(self)?;
			if !f(&r) {
				break;
			}
			found = cur.increment(self, 0)?;
		}
		Ok(())
	}
}

impl<R: Backend> Xfs<R> {
	/// Verify the inode metadata of one AG: every chunk's free count
	/// matches its mask, and the AGI totals match the tree.
	pub fn check_ino_chunks(&mut self, agno: AgNumber) -> IoResult<()> {
		let mut tp = self.trans_alloc(0)?;
		let agi = tp.read_agi(agno)?;
		let agi_s = tp.agi(agi)?;
		let mut count = 0u32;
		let mut freecount = 0u32;
		let mut bad = None;
		tp.inobt_walk(agno, |r| {
			if r.freecount as u32 != r.free.count_ones() {
				bad = Some(r.startino);
				return false;
			}
			count += INODES_PER_CHUNK;
			freecount += r.freecount as u32;
			true
		})?;
		tp.cancel();
		if let Some(startino) = bad {
			return Err(corrupt!("AG{agno}: chunk {startino} mask out of step"));
		}
		if count != agi_s.count || freecount != agi_s.freecount {
			return Err(corrupt!(
				"AG{agno}: AGI counts ({}, {}) != tree ({count}, {freecount})",
				agi_s.count,
				agi_s.freecount
			));
		}
		Ok(())
	}
}

#[cfg(test)]
mod t {
	use super::*;
	use crate::xfs::{mkfs::MkfsParams, testutil::mkimg};

	#[test]
	fn first_chunk_and_lowest_bit() {
		let mut fs = mkimg(&MkfsParams::default());
		let root = fs.sb.rootino;

		let mut tp = fs.trans_alloc(64).unwrap();
		let ip = tp.create_inode(root, S_IFREG | 0o644, false).unwrap();
		tp.commit().unwrap();
		fs.check_ino_chunks(0).unwrap();

		// mkfs made the root inode; ours is the next free bit of the
		// same chunk
		assert_eq!(ip.ino, root + 1);
		assert_eq!(fs.sb.icount, 64);
		assert_eq!(fs.sb.ifree, 62);

		let got = fs.iget(ip.ino).unwrap();
		assert_eq!(got.core.mode, S_IFREG | 0o644);
		assert_eq!(got.core.nlink, 1);
	}

	#[test]
	fn free_restores_the_mask() {
		let mut fs = mkimg(&MkfsParams::default());
		let root = fs.sb.rootino;

		let mut tp = fs.trans_alloc(64).unwrap();
		let a = tp.create_inode(root, S_IFREG | 0o644, false).unwrap();
		let b = tp.create_inode(root, S_IFREG | 0o644, false).unwrap();
		tp.commit().unwrap();
		let ifree = fs.sb.ifree;

		let mut tp = fs.trans_alloc(0).unwrap();
		tp.difree(a.ino).unwrap();
		tp.commit().unwrap();
		assert_eq!(fs.sb.ifree, ifree + 1);
		fs.check_ino_chunks(0).unwrap();

		// double free must not pass
		let mut tp = fs.trans_alloc(0).unwrap();
		let e = tp.difree(a.ino).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(crate::EFSCORRUPTED));
		tp.cancel();

		// the freed number is the lowest free bit again
		let mut tp = fs.trans_alloc(64).unwrap();
		let c = tp.create_inode(root, S_IFREG | 0o644, false).unwrap();
		tp.commit().unwrap();
		assert_eq!(c.ino, a.ino);
		assert_ne!(c.ino, b.ino);
	}

	#[test]
	fn grows_a_second_chunk() {
		let mut fs = mkimg(&MkfsParams::default());
		let root = fs.sb.rootino;

		// drain the first chunk (the root inode took one slot)
		let mut tp = fs.trans_alloc(128).unwrap();
		for _ in 0..INODES_PER_CHUNK - 1 {
			tp.create_inode(root, S_IFREG | 0o644, false).unwrap();
		}
		let agi = tp.read_agi(0).unwrap();
		assert_eq!(tp.agi(agi).unwrap().freecount, 0);
		// one more forces a second chunk
		tp.create_inode(root, S_IFREG | 0o644, false).unwrap();
		tp.commit().unwrap();

		assert_eq!(fs.sb.icount, 2 * INODES_PER_CHUNK as u64);
		fs.check_ino_chunks(0).unwrap();
		fs.check_ag(0).unwrap();
	}

	#[test]
	fn directories_spread_files_cluster() {
		let p = MkfsParams {
			agcount: 2,
			..MkfsParams::default()
		};
		let mut fs = mkimg(&p);
		let root = fs.sb.rootino;
		assert_eq!(fs.sb.ino_to_agno(root), 0);

		let mut tp = fs.trans_alloc(128).unwrap();
		let d = tp.create_inode(root, S_IFDIR | 0o755, false).unwrap();
		let f = tp.create_inode(root, S_IFREG | 0o644, false).unwrap();
		tp.commit().unwrap();

		assert_eq!(fs.sb.ino_to_agno(d.ino), 1);
		assert_eq!(fs.sb.ino_to_agno(f.ino), 0);
	}

	#[test]
	fn unlink_returns_everything() {
		let mut fs = mkimg(&MkfsParams::default());
		let root = fs.sb.rootino;
		let icount = fs.sb.icount;
		let ifree_before;

		let mut tp = fs.trans_alloc(64).unwrap();
		let mut ip = tp.create_inode(root, S_IFREG | 0o644, false).unwrap();
		tp.commit().unwrap();
		ifree_before = fs.sb.ifree;

		let mut tp = fs.trans_alloc(0).unwrap();
		tp.unlink_inode(&mut ip).unwrap();
		tp.commit().unwrap();

		assert_eq!(fs.sb.icount, icount);
		assert_eq!(fs.sb.ifree, ifree_before + 1);
		fs.check_ino_chunks(0).unwrap();
	}
}
