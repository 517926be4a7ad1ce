use std::{
	collections::HashMap,
	io::{Error as IoError, Result as IoResult},
	time::{SystemTime, UNIX_EPOCH},
};

use super::*;
use crate::err;

/// Default soft-limit grace periods, in seconds.
const DQ_BTIMELIMIT: u32 = 7 * 24 * 60 * 60;
const DQ_ITIMELIMIT: u32 = 7 * 24 * 60 * 60;
const DQ_RTBTIMELIMIT: u32 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaType {
	User,
	Proj,
}

/// Limits handed to [`Xfs::set_quota_limits`]; zero means unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaLimits {
	pub blk_hard: u64,
	pub blk_soft: u64,
	pub ino_hard: u64,
	pub ino_soft: u64,
	pub rtb_hard: u64,
	pub rtb_soft: u64,
}

/// In-core quota record: the on-disk shape plus outstanding
/// reservations.  The reservation counters always cover the committed
/// usage, so `res_bcount >= bcount` at any quiescent point.
#[derive(Debug, Clone)]
pub(crate) struct Dquot {
	pub d:            DiskDquot,
	pub res_bcount:   u64,
	pub res_icount:   u64,
	pub res_rtbcount: u64,
}

impl Dquot {
	fn new(id: u32, qtype: QuotaType) -> Self {
		let mut d = DiskDquot {
			id,
			..DiskDquot::default()
		};
		d.flags = match qtype {
			QuotaType::User => 0x01,
			QuotaType::Proj => 0x02,
		};
		Self {
			d,
			res_bcount: 0,
			res_icount: 0,
			res_rtbcount: 0,
		}
	}
}

/// Per-transaction delta against one dquot.
#[derive(Debug, Clone)]
pub(crate) struct DqDelta {
	pub qtype:    QuotaType,
	pub id:       u32,
	pub bcount:   i64,
	pub icount:   i64,
	pub rtbcount: i64,
	pub blk_res:  u64,
	pub ino_res:  u64,
	pub rtb_res:  u64,
}

/// The per-mount quota state: activity flags and the dquot table,
/// hashed by id and type.
pub(crate) struct QuotaMgr {
	flags:           u32,
	dquots:          HashMap<(QuotaType, u32), Dquot>,
	pub btimelimit:  u32,
	pub itimelimit:  u32,
	pub rtbtimelimit: u32,
}

impl QuotaMgr {
	pub fn new(sb: &Superblock) -> Self {
		let mut flags = 0;
		if sb.qflags & QF_UQUOTA_ACCT != 0 {
			flags |= MOUNT_UDQ_ACCT | MOUNT_UDQ_ACTIVE;
		}
		if sb.qflags & QF_UQUOTA_ENFD != 0 {
			flags |= MOUNT_UDQ_ENFD;
		}
		if sb.qflags & QF_UQUOTA_CHKD != 0 {
			flags |= MOUNT_UDQ_CHKD;
		}
		if sb.qflags & QF_PQUOTA_ACCT != 0 {
			flags |= MOUNT_PDQ_ACCT | MOUNT_PDQ_ACTIVE;
		}
		if sb.qflags & QF_PQUOTA_ENFD != 0 {
			flags |= MOUNT_PDQ_ENFD;
		}
		if sb.qflags & QF_PQUOTA_CHKD != 0 {
			flags |= MOUNT_PDQ_CHKD;
		}
		Self {
			flags,
			dquots: HashMap::new(),
			btimelimit: DQ_BTIMELIMIT,
			itimelimit: DQ_ITIMELIMIT,
			rtbtimelimit: DQ_RTBTIMELIMIT,
		}
	}

	pub fn mount_flags(&self) -> u32 {
		self.flags
	}

	pub fn active(&self, qtype: QuotaType) -> bool {
		match qtype {
			QuotaType::User => self.flags & MOUNT_UDQ_ACTIVE != 0,
			QuotaType::Proj => self.flags & MOUNT_PDQ_ACTIVE != 0,
		}
	}

	pub fn enforcing(&self, qtype: QuotaType) -> bool {
		match qtype {
			QuotaType::User => self.flags & MOUNT_UDQ_ENFD != 0,
			QuotaType::Proj => self.flags & MOUNT_PDQ_ENFD != 0,
		}
	}

	fn dq(&mut self, qtype: QuotaType, id: u32) -> &mut Dquot {
		self.dquots
			.entry((qtype, id))
			.or_insert_with(|| Dquot::new(id, qtype))
	}
}

fn now_secs() -> i32 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as i32)
		.unwrap_or(0)
}

/// Start, restart or clear the soft-limit timers after a usage change.
fn adjust_dqtimers(dq: &mut Dquot, now: i32, blimit: u32, ilimit: u32, rtblimit: u32) {
	let d = &mut dq.d;
	if d.blk_softlimit > 0 {
		if d.bcount > d.blk_softlimit && d.btimer == 0 {
			d.btimer = now + blimit as i32;
		} else if d.bcount <= d.blk_softlimit {
			d.btimer = 0;
		}
	}
	if d.ino_softlimit > 0 {
		if d.icount > d.ino_softlimit && d.itimer == 0 {
			d.itimer = now + ilimit as i32;
		} else if d.icount <= d.ino_softlimit {
			d.itimer = 0;
		}
	}
	if d.rtb_softlimit > 0 {
		if d.rtbcount > d.rtb_softlimit && d.rtbtimer == 0 {
			d.rtbtimer = now + rtblimit as i32;
		} else if d.rtbcount <= d.rtb_softlimit {
			d.rtbtimer = 0;
		}
	}
}

/// Would adding `more` to (`total` reserved) break the limits?
fn limit_exceeded(total: u64, more: u64, hard: u64, soft: u64, timer: i32, now: i32) -> bool {
	let n = total + more;
	if hard > 0 && n > hard {
		return true;
	}
	if soft > 0 && n > soft && timer != 0 && now > timer {
		return true;
	}
	false
}

impl<'a, R: Backend> Trans<'a, R> {
	fn dq_entry(&mut self, qtype: QuotaType, id: u32) -> &mut DqDelta {
		if let Some(i) = self.dq.iter().position(|d| d.qtype == qtype && d.id == id) {
			return &mut self.dq[i];
		}
		// two ids of each type at most ride along with a transaction
		debug_assert!(self.dq.iter().filter(|d| d.qtype == qtype).count() < 2);
		self.dq.push(DqDelta {
			qtype,
			id,
			bcount: 0,
			icount: 0,
			rtbcount: 0,
			blk_res: 0,
			ino_res: 0,
			rtb_res: 0,
		});
		self.dq.last_mut().expect("just pushed")
	}

	/// Reserve quota room for `nblks` blocks and `ninos` inodes.
	/// Refused with `EDQUOT` once a hard limit would be crossed or an
	/// expired soft limit stands in the way.
	pub fn reserve_quota(
		&mut self,
		qtype: QuotaType,
		id: u32,
		nblks: u64,
		ninos: u64,
		rt: bool,
	) -> IoResult<()> {
		if !self.fs.qm.active(qtype) || (nblks == 0 && ninos == 0) {
			return Ok(());
		}
		let enforcing = self.fs.qm.enforcing(qtype);
		let now = now_secs();
		let dq = self.fs.qm.dq(qtype, id);
		if enforcing {
			let d = &dq.d;
			let (bres, hard, soft, timer) = if rt {
				(dq.res_rtbcount, d.rtb_hardlimit, d.rtb_softlimit, d.rtbtimer)
			} else {
				(dq.res_bcount, d.blk_hardlimit, d.blk_softlimit, d.btimer)
			};
			if limit_exceeded(bres, nblks, hard, soft, timer, now) {
				log::debug!("quota: {qtype:?} id {id} over block limit");
				return Err(err!(EDQUOT));
			}
			if limit_exceeded(
				dq.res_icount,
				ninos,
				d.ino_hardlimit,
				d.ino_softlimit,
				d.itimer,
				now,
			) {
				log::debug!("quota: {qtype:?} id {id} over inode limit");
				return Err(err!(EDQUOT));
			}
		}
		if rt {
			dq.res_rtbcount += nblks;
		} else {
			dq.res_bcount += nblks;
		}
		dq.res_icount += ninos;

		let e = self.dq_entry(qtype, id);
		if rt {
			e.rtb_res += nblks;
		} else {
			e.blk_res += nblks;
		}
		e.ino_res += ninos;
		Stats::bump(&self.fs.stats.dqreserves);
		Ok(())
	}

	/// Both-id convenience for an inode's owners.
	pub(crate) fn reserve_quota_ip(
		&mut self,
		ip: &Inode,
		nblks: u64,
		ninos: u64,
		rt: bool,
	) -> IoResult<()> {
		self.reserve_quota(QuotaType::User, ip.core.uid, nblks, ninos, rt)?;
		self.reserve_quota(QuotaType::Proj, ip.core.projid as u32, nblks, ninos, rt)
	}

	/// Record actual usage against the transaction; applied at commit,
	/// discarded on cancel.
	pub(crate) fn quota_mod(
		&mut self,
		qtype: QuotaType,
		id: u32,
		dblocks: i64,
		dinodes: i64,
		drtblocks: i64,
	) {
		if !self.fs.qm.active(qtype) {
			return;
		}
		let e = self.dq_entry(qtype, id);
		e.bcount += dblocks;
		e.icount += dinodes;
		e.rtbcount += drtblocks;
	}

	pub(crate) fn quota_mod_ip(&mut self, ip: &Inode, dblocks: i64, dinodes: i64, rt: bool) {
		let (db, drt) = if rt { (0, dblocks) } else { (dblocks, 0) };
		self.quota_mod(QuotaType::User, ip.core.uid, db, dinodes, drt);
		self.quota_mod(QuotaType::Proj, ip.core.projid as u32, db, dinodes, drt);
	}
}

/// Commit: fold the usage deltas into the dquots, return the unused
/// reservations, and restart or clear the timers.
pub(crate) fn apply_dquot_deltas<R: Backend>(fs: &mut Xfs<R>, deltas: &[DqDelta]) {
	let now = now_secs();
	let (blim, ilim, rtblim) = (
		fs.qm.btimelimit,
		fs.qm.itimelimit,
		fs.qm.rtbtimelimit,
	);
	for e in deltas {
		if !fs.qm.active(e.qtype) {
			continue;
		}
		let dq = fs.qm.dq(e.qtype, e.id);
		dq.d.bcount = (dq.d.bcount as i64 + e.bcount).max(0) as u64;
		dq.d.icount = (dq.d.icount as i64 + e.icount).max(0) as u64;
		dq.d.rtbcount = (dq.d.rtbcount as i64 + e.rtbcount).max(0) as u64;
		dq.res_bcount = (dq.res_bcount as i64 - e.blk_res as i64 + e.bcount).max(0) as u64;
		dq.res_icount = (dq.res_icount as i64 - e.ino_res as i64 + e.icount).max(0) as u64;
		dq.res_rtbcount =
			(dq.res_rtbcount as i64 - e.rtb_res as i64 + e.rtbcount).max(0) as u64;
		adjust_dqtimers(dq, now, blim, ilim, rtblim);
	}
}

/// Cancel: reservations come back, usage never happened.
pub(crate) fn unreserve_and_mod_dquots<R: Backend>(fs: &mut Xfs<R>, deltas: &[DqDelta]) {
	for e in deltas {
		if !fs.qm.active(e.qtype) {
			continue;
		}
		let dq = fs.qm.dq(e.qtype, e.id);
		dq.res_bcount = dq.res_bcount.saturating_sub(e.blk_res);
		dq.res_icount = dq.res_icount.saturating_sub(e.ino_res);
		dq.res_rtbcount = dq.res_rtbcount.saturating_sub(e.rtb_res);
	}
}

impl<R: Backend> Xfs<R> {
	/// Install limits for one id.
	pub fn set_quota_limits(
		&mut self,
		qtype: QuotaType,
		id: u32,
		lim: QuotaLimits,
	) -> IoResult<()> {
		if !self.qm.active(qtype) {
			return Err(err!(ESRCH));
		}
		let dq = self.qm.dq(qtype, id);
		dq.d.blk_hardlimit = lim.blk_hard;
		dq.d.blk_softlimit = lim.blk_soft;
		dq.d.ino_hardlimit = lim.ino_hard;
		dq.d.ino_softlimit = lim.ino_soft;
		dq.d.rtb_hardlimit = lim.rtb_hard;
		dq.d.rtb_softlimit = lim.rtb_soft;
		Ok(())
	}

	/// Snapshot one dquot.  `ESRCH` when that quota type is not active.
	pub fn quota_get(&mut self, qtype: QuotaType, id: u32) -> IoResult<DiskDquot> {
		if !self.qm.active(qtype) {
			return Err(err!(ESRCH));
		}
		Ok(self.qm.dq(qtype, id).d.clone())
	}

	#[cfg(test)]
	pub(crate) fn dquot_res(&mut self, qtype: QuotaType, id: u32) -> (u64, u64, u64) {
		let dq = self.qm.dq(qtype, id);
		(dq.res_bcount, dq.res_icount, dq.res_rtbcount)
	}
}

#[cfg(test)]
mod t {
	use super::*;
	use crate::xfs::{mkfs::MkfsParams, testutil::mkimg};

	fn quota_img() -> Xfs<std::io::Cursor<Vec<u8>>> {
		let p = MkfsParams {
			qflags: QF_UQUOTA_ACCT | QF_UQUOTA_ENFD,
			..MkfsParams::default()
		};
		mkimg(&p)
	}

	#[test]
	fn inactive_type_is_esrch() {
		let mut fs = quota_img();
		assert!(fs.quota_get(QuotaType::User, 0).is_ok());
		let e = fs.quota_get(QuotaType::Proj, 0).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::ESRCH));
	}

	#[test]
	fn hard_limit_refuses() {
		let mut fs = quota_img();
		fs.set_quota_limits(
			QuotaType::User,
			7,
			QuotaLimits {
				blk_hard: 10,
				..QuotaLimits::default()
			},
		)
		.unwrap();

		let mut tp = fs.trans_alloc(0).unwrap();
		tp.reserve_quota(QuotaType::User, 7, 8, 0, false).unwrap();
		let e = tp.reserve_quota(QuotaType::User, 7, 3, 0, false).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::EDQUOT));
		// up to the limit is fine
		tp.reserve_quota(QuotaType::User, 7, 2, 0, false).unwrap();
		tp.cancel();

		// cancel returned every reservation
		assert_eq!(fs.dquot_res(QuotaType::User, 7).0, 0);
	}

	#[test]
	fn commit_applies_and_returns_unused() {
		let mut fs = quota_img();
		let mut tp = fs.trans_alloc(0).unwrap();
		tp.reserve_quota(QuotaType::User, 3, 16, 1, false).unwrap();
		// only 10 blocks actually materialized
		tp.quota_mod(QuotaType::User, 3, 10, 1, 0);
		tp.commit().unwrap();

		let d = fs.quota_get(QuotaType::User, 3).unwrap();
		assert_eq!(d.bcount, 10);
		assert_eq!(d.icount, 1);
		let (rb, ri, _) = fs.dquot_res(QuotaType::User, 3);
		assert_eq!(rb, 10);
		assert_eq!(ri, 1);
	}

	#[test]
	fn soft_limit_starts_the_timer() {
		let mut fs = quota_img();
		fs.set_quota_limits(
			QuotaType::User,
			5,
			QuotaLimits {
				blk_soft: 4,
				..QuotaLimits::default()
			},
		)
		.unwrap();

		let mut tp = fs.trans_alloc(0).unwrap();
		tp.reserve_quota(QuotaType::User, 5, 6, 0, false).unwrap();
		tp.quota_mod(QuotaType::User, 5, 6, 0, 0);
		tp.commit().unwrap();
		let d = fs.quota_get(QuotaType::User, 5).unwrap();
		assert!(d.btimer > 0);

		// dropping back under the soft limit clears it
		let mut tp = fs.trans_alloc(0).unwrap();
		tp.quota_mod(QuotaType::User, 5, -4, 0, 0);
		tp.commit().unwrap();
		let d = fs.quota_get(QuotaType::User, 5).unwrap();
		assert_eq!(d.btimer, 0);
	}

	/// Data allocation charges the owner and frees refund it.
	#[test]
	fn file_blocks_are_charged() {
		let mut fs = quota_img();
		let root = fs.sb.rootino;
		let mut tp = fs.trans_alloc(64).unwrap();
		let mut ip = tp.create_inode(root, S_IFREG | 0o644, false).unwrap();
		tp.bmapi(&mut ip, 0, 6, true, 8).unwrap();
		tp.commit().unwrap();

		let d = fs.quota_get(QuotaType::User, 0).unwrap();
		assert_eq!(d.bcount, 6);
		assert!(d.icount >= 1);

		let mut tp = fs.trans_alloc(0).unwrap();
		tp.bunmapi(&mut ip, 0, 6).unwrap();
		tp.commit().unwrap();
		let d = fs.quota_get(QuotaType::User, 0).unwrap();
		assert_eq!(d.bcount, 0);
	}
}
