use std::io::{Error as IoError, Result as IoResult};

use super::*;
use crate::{corrupt, err};

/// In-core form of one inode fork.
///
/// `Local` carries inline payload (small directories, symlink targets),
/// `Extents` an unpacked extent array, `Btree` the raw bytes of a
/// block-map tree root sized to the fork's share of the literal area.
#[derive(Debug, Clone, PartialEq)]
pub enum Fork {
	Local(Vec<u8>),
	Extents(Vec<BmbtIrec>),
	Btree(Vec<u8>),
}

/// In-core inode.
#[derive(Debug, Clone)]
pub struct Inode {
	pub ino:   Ino,
	pub core:  DiskInodeCore,
	pub dfork: Fork,
	pub afork: Option<Fork>,
}

impl Inode {
	/// Bytes of the literal area belonging to the data fork.
	pub(crate) fn dfork_size(&self, sb: &Superblock) -> usize {
		let lit = sb.inodesize as usize - DINODE_LITERAL_OFFSET;
		match self.core.forkoff {
			0 => lit,
			off => (off as usize) * 8,
		}
	}

	/// How many extent records fit inline before the fork must convert
	/// to a tree.
	pub(crate) fn extents_capacity(&self, sb: &Superblock) -> usize {
		self.dfork_size(sb) / BMBT_REC_LEN
	}
}

fn decode_fork(
	cfg: Config,
	b: &[u8],
	format: u8,
	nextents: u32,
	local_len: usize,
) -> IoResult<Fork> {
	match DiFormat::from_raw(format) {
		Some(DiFormat::Local) => {
			if local_len > b.len() {
				return Err(corrupt!("local fork payload overruns the literal area"));
			}
			Ok(Fork::Local(b[..local_len].to_vec()))
		}
		Some(DiFormat::Extents) => {
			if nextents as usize * BMBT_REC_LEN > b.len() {
				return Err(corrupt!("extent list overruns the literal area"));
			}
			let mut list = Vec::with_capacity(nextents as usize);
			for i in 0..nextents as usize {
				let rec: BmbtRec = cfg.decode_slice(&b[i * BMBT_REC_LEN..])?;
				list.push(rec.unpack());
			}
			Ok(Fork::Extents(list))
		}
		Some(DiFormat::Btree) => Ok(Fork::Btree(b.to_vec())),
		Some(DiFormat::Dev) | Some(DiFormat::Uuid) | Some(DiFormat::AgIno) => {
			Ok(Fork::Local(b.to_vec()))
		}
		None => Err(corrupt!("unknown fork format {format}")),
	}
}

fn encode_fork(cfg: Config, b: &mut [u8], fork: &Fork) -> IoResult<()> {
	match fork {
		Fork::Local(bytes) => {
			if bytes.len() > b.len() {
				return Err(corrupt!("local fork payload overruns the literal area"));
			}
			b[..bytes.len()].copy_from_slice(bytes);
		}
		Fork::Extents(list) => {
			if list.len() * BMBT_REC_LEN > b.len() {
				return Err(corrupt!("extent list overruns the literal area"));
			}
			for (i, ir) in list.iter().enumerate() {
				cfg.encode_slice(&mut b[i * BMBT_REC_LEN..], &BmbtRec::pack(ir))?;
			}
		}
		Fork::Btree(bytes) => {
			if bytes.len() != b.len() {
				return Err(corrupt!("tree root does not fill its fork area"));
			}
			b.copy_from_slice(bytes);
		}
	}
	Ok(())
}

impl<R: Backend> Xfs<R> {
	pub(crate) fn validate_ino(&self, ino: Ino) -> IoResult<()> {
		let sb = &self.sb;
		let agno = sb.ino_to_agno(ino);
		let agino = sb.ino_to_agino(ino);
		if ino == NULLINO
			|| agno >= sb.agcount
			|| sb.agino_to_agbno(agino) >= sb.agblocks
			|| sb.agino_to_offset(agino) >= sb.inopblock as u32
		{
			return Err(err!(EINVAL));
		}
		Ok(())
	}

	/// Fetch an inode, through the cache when it is enabled.
	pub fn iget(&mut self, ino: Ino) -> IoResult<Inode> {
		#[cfg(feature = "icache")]
		if let Some(ip) = self.icache.get(&ino) {
			return Ok(ip.clone());
		}
		let ip = self.iread(ino)?;
		#[cfg(feature = "icache")]
		self.icache.put(ino, ip.clone());
		Ok(ip)
	}

	pub(crate) fn iread(&mut self, ino: Ino) -> IoResult<Inode> {
		log::trace!("iread({ino:#x})");
		self.validate_ino(ino)?;
		let daddr = self.sb.ino_to_daddr(ino);
		let core: DiskInodeCore = self.file.decode_at(daddr)?;
		if core.magic != DINODE_MAGIC {
			return Err(corrupt!("inode {ino:#x}: bad magic {:#x}", core.magic));
		}
		if core.version != DINODE_VERSION {
			return Err(corrupt!("inode {ino:#x}: bad version {}", core.version));
		}
		let litlen = self.sb.inodesize as usize - DINODE_LITERAL_OFFSET;
		let mut lit = vec![0u8; litlen];
		self.file
			.read_at(daddr + DINODE_LITERAL_OFFSET as u64, &mut lit)?;

		let dsize = match core.forkoff {
			0 => litlen,
			off => (off as usize) * 8,
		};
		if dsize > litlen {
			return Err(corrupt!("inode {ino:#x}: fork offset past the literal area"));
		}
		let cfg = self.file.config();
		let local_len = (core.size as usize).min(dsize);
		let dfork = decode_fork(cfg, &lit[..dsize], core.format, core.nextents, local_len)?;
		let afork = if core.forkoff > 0 {
			Some(decode_fork(
				cfg,
				&lit[dsize..],
				core.aformat,
				core.anextents as u32,
				litlen - dsize,
			)?)
		} else {
			None
		};
		Ok(Inode {
			ino,
			core,
			dfork,
			afork,
		})
	}

	pub(crate) fn icache_drop(&mut self, ino: Ino) {
		let _ = ino;
		#[cfg(feature = "icache")]
		self.icache.pop(&ino);
	}
}

impl<'a, R: Backend> Trans<'a, R> {
	pub fn iget(&mut self, ino: Ino) -> IoResult<Inode> {
		self.fs.iget(ino)
	}

	/// Write the whole inode (core and forks) into its block buffer and
	/// log it.
	pub fn log_inode(&mut self, ip: &Inode) -> IoResult<()> {
		log::trace!("log_inode({:#x})", ip.ino);
		self.fs.validate_ino(ip.ino)?;
		let sb = self.fs.sb.clone();
		let agno = sb.ino_to_agno(ip.ino);
		let agino = sb.ino_to_agino(ip.ino);
		let fsb = sb.agb_to_fsb(agno, sb.agino_to_agbno(agino));
		let off = sb.agino_to_offset(agino) as usize * sb.inodesize as usize;

		let cfg = self.cfg();
		let mut bytes = vec![0u8; sb.inodesize as usize];
		cfg.encode_slice(&mut bytes, &ip.core)?;
		cfg.encode_slice(&mut bytes[DINODE_CORE_LEN..], &NULLAGINO)?;
		let dsize = ip.dfork_size(&sb);
		let lit = &mut bytes[DINODE_LITERAL_OFFSET..];
		encode_fork(cfg, &mut lit[..dsize], &ip.dfork)?;
		if let Some(af) = &ip.afork {
			let len = lit.len();
			encode_fork(cfg, &mut lit[dsize..len], af)?;
		}

		let id = self.read_buf(fsb, 1)?;
		self.bput(id, off, &bytes);
		// the cached copy is stale until the buffers land
		self.fs.icache_drop(ip.ino);
		Ok(())
	}
}
