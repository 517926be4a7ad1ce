use std::fs::File;

use rstest::rstest;
use rxfs::*;
use tempfile::NamedTempFile;

fn init_logging() {
	let _ = env_logger::builder().is_test(true).try_init();
}

/// Format a fresh image in a temp file and mount it read-write.
fn mkimg(p: &MkfsParams) -> (NamedTempFile, Xfs<File>) {
	init_logging();
	let f = NamedTempFile::new().unwrap();
	let size = (p.agcount as u64 * p.agblocks as u64 + p.rtblocks()) << p.blocklog;
	f.as_file().set_len(size).unwrap();
	let mut file = f.reopen().unwrap();
	mkfs(&mut file, p).unwrap();
	drop(file);
	let fs = Xfs::open(f.path(), true).unwrap();
	(f, fs)
}

fn check_all(fs: &mut Xfs<File>) {
	for agno in 0..fs.superblock().agcount {
		fs.check_ag(agno).unwrap();
		fs.check_ino_chunks(agno).unwrap();
	}
}

/// Allocate an exact extent, verify the counters, free it, verify the
/// trees heal.
#[rstest]
#[case::block_4k(12, 1000)]
#[case::block_512(9, 4000)]
fn alloc_free_cycle(#[case] blocklog: u8, #[case] agblocks: u32) {
	let p = MkfsParams {
		blocklog,
		agblocks,
		agcount: 1,
		..MkfsParams::default()
	};
	let (_img, mut fs) = mkimg(&p);
	let free0 = fs.info().bfree;
	let target = fs.superblock().agb_to_fsb(0, 100);

	let mut tp = fs.trans_alloc(32).unwrap();
	let mut a = AllocArg::new(AllocType::ThisBno, target, 10, 10);
	tp.alloc_vextent(&mut a).unwrap();
	assert!(a.ok());
	assert_eq!(a.fsbno, target);
	assert_eq!(a.len, 10);
	tp.commit().unwrap();

	assert_eq!(fs.info().bfree, free0 - 10);
	check_all(&mut fs);

	let mut tp = fs.trans_alloc(0).unwrap();
	tp.free_extent(target, 10).unwrap();
	tp.commit().unwrap();
	assert_eq!(fs.info().bfree, free0);
	check_all(&mut fs);
}

/// Everything a file does in its life, across separate transactions and
/// a remount: created, mapped, punched, truncated, unlinked.
#[test]
fn file_lifecycle_survives_remount() {
	let p = MkfsParams {
		agcount: 2,
		..MkfsParams::default()
	};
	let (img, mut fs) = mkimg(&p);
	let root = fs.superblock().rootino;
	let free0 = fs.info().bfree;
	let files0 = fs.info().files;

	let mut tp = fs.trans_alloc(64).unwrap();
	let mut ip = tp.create_inode(root, S_IFREG | 0o644, false).unwrap();
	let w = tp.bmapi(&mut ip, 0, 12, true, 16).unwrap();
	ip.core.size = 12u64 << p.blocklog;
	tp.log_inode(&ip).unwrap();
	tp.commit().unwrap();
	assert_eq!(w.iter().map(|m| m.blockcount as u64).sum::<u64>(), 12);
	check_all(&mut fs);

	// remount and find it all again
	drop(fs);
	let mut fs = Xfs::open(img.path(), true).unwrap();
	let mut ip = fs.iget(ip.ino).unwrap();
	assert_eq!(ip.core.nblocks, 12);
	let mut tp = fs.trans_alloc(0).unwrap();
	let r = tp.bmapi(&mut ip, 0, 12, false, 16).unwrap();
	tp.cancel();
	assert_eq!(w, r);

	// punch a hole, then cut the tail off
	let mut tp = fs.trans_alloc(0).unwrap();
	tp.bunmapi(&mut ip, 4, 2).unwrap();
	tp.commit().unwrap();
	assert_eq!(ip.core.nblocks, 10);

	let mut tp = fs.trans_alloc(0).unwrap();
	tp.itruncate(&mut ip, 6u64 << p.blocklog).unwrap();
	tp.commit().unwrap();
	assert_eq!(ip.core.nblocks, 4);
	check_all(&mut fs);

	// unlink returns every block and the inode number
	let mut tp = fs.trans_alloc(0).unwrap();
	tp.unlink_inode(&mut ip).unwrap();
	tp.commit().unwrap();
	assert_eq!(fs.info().bfree, free0);
	assert_eq!(fs.info().files, files0);
	check_all(&mut fs);
}

/// The round-robin selector spreads size-directed allocations over the
/// AGs and advances its rotor past each winner.
#[test]
fn rotor_spreads_over_ags() {
	let p = MkfsParams {
		agcount: 4,
		agblocks: 256,
		..MkfsParams::default()
	};
	let (_img, mut fs) = mkimg(&p);

	let mut agnos = Vec::new();
	for _ in 0..3 {
		let mut tp = fs.trans_alloc(220).unwrap();
		let mut a = AllocArg::new(AllocType::AnyAg, 0, 200, 200);
		tp.alloc_vextent(&mut a).unwrap();
		assert!(a.ok());
		tp.commit().unwrap();
		agnos.push(fs.superblock().fsb_to_agno(a.fsbno));
	}
	agnos.sort();
	agnos.dedup();
	assert_eq!(agnos.len(), 3, "each large extent landed in its own AG");
	check_all(&mut fs);
}

/// Running the data section dry is a clean `ENOSPC`, and the metadata
/// stays coherent afterwards.
#[test]
fn enospc_is_not_corruption() {
	let p = MkfsParams {
		blocklog: 9,
		agcount: 1,
		agblocks: 128,
		..MkfsParams::default()
	};
	let (_img, mut fs) = mkimg(&p);
	let root = fs.superblock().rootino;

	let mut tp = fs.trans_alloc(8).unwrap();
	let mut ip = tp.create_inode(root, S_IFREG | 0o644, false).unwrap();
	tp.commit().unwrap();

	let mut off = 0u64;
	let err = loop {
		let mut tp = match fs.trans_alloc(4) {
			Ok(tp) => tp,
			Err(e) => break e,
		};
		match tp.bmapi(&mut ip, off, 1, true, 1) {
			Ok(_) => {
				tp.commit().unwrap();
				off += 1;
			}
			Err(e) => {
				tp.cancel();
				break e;
			}
		}
	};
	assert_eq!(err.raw_os_error(), Some(libc::ENOSPC));
	assert!(off > 0, "some blocks were mapped before the well ran dry");
	check_all(&mut fs);

	// the in-core inode may carry the cancelled attempt; reload it
	let mut ip = fs.iget(ip.ino).unwrap();

	// freeing makes room again
	let mut tp = fs.trans_alloc(0).unwrap();
	tp.bunmapi(&mut ip, 0, off).unwrap();
	tp.commit().unwrap();
	let mut tp = fs.trans_alloc(4).unwrap();
	tp.bmapi(&mut ip, 0, 1, true, 1).unwrap();
	tp.commit().unwrap();
	check_all(&mut fs);
}

/// Once shut down, everything is EIO; the image is untouched afterwards.
#[test]
fn shutdown_short_circuits() {
	let (_img, mut fs) = mkimg(&MkfsParams::default());
	let bfree = fs.info().bfree;
	fs.force_shutdown("integration test");
	let e = fs.trans_alloc(1).unwrap_err();
	assert_eq!(e.raw_os_error(), Some(libc::EIO));
	assert!(fs.is_shutdown());
	assert_eq!(fs.info().bfree, bfree);
}

/// Inode numbers decode back to where the allocator put them, chunk
/// masks stay in step, and a walk sees every chunk.
#[test]
fn inode_chunks_inventory() {
	let p = MkfsParams {
		agcount: 2,
		..MkfsParams::default()
	};
	let (_img, mut fs) = mkimg(&p);
	let root = fs.superblock().rootino;

	let mut tp = fs.trans_alloc(256).unwrap();
	let mut inos = Vec::new();
	for i in 0..80 {
		let mode = if i % 10 == 0 { S_IFDIR | 0o755 } else { S_IFREG | 0o644 };
		inos.push(tp.create_inode(root, mode, false).unwrap().ino);
	}
	tp.commit().unwrap();
	check_all(&mut fs);

	inos.sort_unstable();
	inos.dedup();
	assert_eq!(inos.len(), 80);

	let agcount = fs.superblock().agcount;
	let mut tp = fs.trans_alloc(0).unwrap();
	let mut chunks = 0;
	for agno in 0..agcount {
		tp.inobt_walk(agno, |rec| {
			assert_eq!(rec.freecount as u32, rec.free.count_ones());
			chunks += 1;
			true
		})
		.unwrap();
	}
	tp.cancel();
	assert!(chunks >= 2, "80 inodes cannot fit one chunk");
}

/// Realtime and data allocations live in different spaces with
/// independent counters.
#[test]
fn realtime_and_data_coexist() {
	let p = MkfsParams {
		rextents: 128,
		rextsize: 1,
		..MkfsParams::default()
	};
	let (_img, mut fs) = mkimg(&p);
	let root = fs.superblock().rootino;
	assert_eq!(fs.info().rfree, 128);

	let mut tp = fs.trans_alloc(64).unwrap();
	let mut rtf = tp.create_inode(root, S_IFREG | 0o644, false).unwrap();
	rtf.core.flags |= DIFLAG_REALTIME;
	tp.log_inode(&rtf).unwrap();
	let mut datf = tp.create_inode(root, S_IFREG | 0o644, false).unwrap();
	tp.bmapi(&mut rtf, 0, 16, true, 4).unwrap();
	tp.bmapi(&mut datf, 0, 16, true, 4).unwrap();
	tp.commit().unwrap();

	assert_eq!(fs.info().rfree, 128 - 16);
	check_all(&mut fs);

	let mut tp = fs.trans_alloc(0).unwrap();
	tp.bunmapi(&mut rtf, 0, 16).unwrap();
	tp.commit().unwrap();
	assert_eq!(fs.info().rfree, 128);
}

/// Quota enforcement refuses work mid-transaction; the cancel path
/// returns every reservation.
#[test]
fn quota_enforcement_end_to_end() {
	let p = MkfsParams {
		qflags: 0x0001 | 0x0002, // user accounting + enforcement
		..MkfsParams::default()
	};
	let (_img, mut fs) = mkimg(&p);
	assert!(fs.mount_flags() & MOUNT_UDQ_ACCT != 0);
	assert!(fs.mount_flags() & MOUNT_UDQ_ENFD != 0);
	let root = fs.superblock().rootino;
	fs.set_quota_limits(
		QuotaType::User,
		0,
		QuotaLimits {
			blk_hard: 8,
			..QuotaLimits::default()
		},
	)
	.unwrap();

	let mut tp = fs.trans_alloc(64).unwrap();
	let mut ip = tp.create_inode(root, S_IFREG | 0o644, false).unwrap();
	tp.bmapi(&mut ip, 0, 6, true, 8).unwrap();
	let e = tp.bmapi(&mut ip, 100, 6, true, 8).unwrap_err();
	assert_eq!(e.raw_os_error(), Some(libc::EDQUOT));
	tp.cancel();

	// nothing stuck: the whole 8 can be taken now
	let mut tp = fs.trans_alloc(64).unwrap();
	let mut ip = tp.create_inode(root, S_IFREG | 0o644, false).unwrap();
	tp.bmapi(&mut ip, 0, 8, true, 8).unwrap();
	tp.commit().unwrap();
	let d = fs.quota_get(QuotaType::User, 0).unwrap();
	assert_eq!(d.bcount, 8);
}

/// The journal sees before-images and one commit record per
/// transaction, in commit order.
#[test]
fn journal_contract() {
	use std::{cell::RefCell, rc::Rc};

	#[derive(Clone, Default)]
	struct Shared(Rc<RefCell<MemJournal>>);
	impl Journal for Shared {
		fn write(&mut self, rec: LogRec) -> std::io::Result<u64> {
			self.0.borrow_mut().write(rec)
		}
		fn commit(&mut self, tid: u64, sync: bool) -> std::io::Result<u64> {
			self.0.borrow_mut().commit(tid, sync)
		}
		fn force(&mut self) -> std::io::Result<u64> {
			self.0.borrow_mut().force()
		}
	}

	let (_img, mut fs) = mkimg(&MkfsParams::default());
	let jrn = Shared::default();
	fs.set_journal(Box::new(jrn.clone()));

	let mut tp = fs.trans_alloc(16).unwrap();
	let mut a = AllocArg::new(AllocType::ThisAg, 0, 4, 4);
	tp.alloc_vextent(&mut a).unwrap();
	assert!(a.ok());
	let tid = tp.tid();
	// the freelist refill made this transaction synchronous
	assert!(tp.is_sync());
	tp.commit().unwrap();

	let j = jrn.0.borrow();
	assert_eq!(j.commits().len(), 1);
	assert_eq!(j.commits()[0].0, tid);
	assert!(!j.records().is_empty());
	assert!(j.records().iter().all(|r| r.tid == tid));
	// sync commit forced the log
	assert_eq!(j.forced_lsn(), j.commits()[0].1);
}
