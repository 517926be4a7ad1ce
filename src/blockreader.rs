use std::{
	fs::File, io::{self, BufRead, Read, Result as IoResult, Seek, SeekFrom, Write}, path::Path,
};

pub trait Backend: Read + Write + Seek {}

impl<T: Read + Write + Seek> Backend for T {}

/// Block-level abstraction layer.
///
/// `BlockReader` maps random access reads and writes onto whole-block
/// operations against the underlying device.
pub struct BlockReader<T: Backend> {
	inner: T,
	block: Vec<u8>,
	idx:   usize,
	dirty: bool,
	rw:    bool,
	#[cfg(feature = "bcache")]
	cache: lru::LruCache<u64, Vec<u8>>,
}

impl BlockReader<File> {
	pub fn open(path: &Path, bs: usize, rw: bool) -> IoResult<Self> {
		let file = File::options().read(true).write(rw).open(path)?;
		Ok(BlockReader::new(file, bs, rw))
	}
}

impl<T: Backend> BlockReader<T> {
	pub fn new(inner: T, bs: usize, rw: bool) -> Self {
		let block = vec![0u8; bs];
		Self {
			inner,
			block,
			idx: bs,
			dirty: false,
			rw,
			#[cfg(feature = "bcache")]
			cache: crate::new_lru(crate::BCACHE_SIZE),
		}
	}

	pub fn write_enabled(&self) -> bool {
		self.rw
	}

	/// Size of the underlying device in bytes.
	pub fn device_size(&mut self) -> IoResult<u64> {
		self.flush()?;
		let pos = self.inner.stream_position()?;
		let end = self.inner.seek(SeekFrom::End(0))?;
		self.inner.seek(SeekFrom::Start(pos))?;
		Ok(end)
	}

	fn refill(&mut self) -> IoResult<()> {
		if self.dirty {
			panic!("cannot refill a dirty BlockReader");
		}

		#[cfg(feature = "bcache")]
		let pos = self.inner.stream_position()?;
		#[cfg(feature = "bcache")]
		if let Some(cached) = self.cache.get(&pos) {
			self.block.copy_from_slice(cached);
			self.inner.seek(SeekFrom::Current(self.block.len() as i64))?;
			self.idx = 0;
			return Ok(());
		}

		self.block.fill(0u8);
		let mut num = 0;
		while num < self.block.len() {
			match self.inner.read(&mut self.block[num..])? {
				0 => break,
				n => num += n,
			}
		}
		if num < self.block.len() {
			// Reading past EOF yields zeroes; seek the stream to where a
			// full read would have left it.
			self.inner
				.seek(SeekFrom::Current((self.block.len() - num) as i64))?;
		}
		#[cfg(feature = "bcache")]
		self.cache.push(pos, self.block.clone());
		self.idx = 0;
		Ok(())
	}

	fn buffered(&self) -> usize {
		self.block.len() - self.idx
	}

	fn refill_if_empty(&mut self) -> IoResult<()> {
		if self.buffered() == 0 {
			self.refill()?;
		}
		Ok(())
	}

	/// Get the underlying block size.
	pub fn blksize(&self) -> usize {
		self.block.len()
	}
}

impl<T: Backend> Read for BlockReader<T> {
	fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
		self.refill_if_empty()?;
		let num = buf.len().min(self.buffered());
		let buf = &mut buf[0..num];
		buf.copy_from_slice(&self.block[self.idx..(self.idx + num)]);
		self.idx += num;
		Ok(num)
	}
}

impl<T: Backend> Write for BlockReader<T> {
	fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
		if !self.rw {
			panic!("BUG: BlockReader::write() called on a read-only medium");
		}
		self.refill_if_empty()?;
		let num = buf.len().min(self.buffered());
		self.block[self.idx..(self.idx + num)].copy_from_slice(&buf[0..num]);
		self.idx += num;
		self.dirty = true;
		self.flush()?;
		Ok(num)
	}

	fn flush(&mut self) -> IoResult<()> {
		if !self.dirty {
			return Ok(());
		}

		#[allow(unused_variables)]
		let pos = self
			.inner
			.seek(SeekFrom::Current(-(self.block.len() as i64)))?;

		#[cfg(feature = "bcache")]
		self.cache.push(pos, self.block.clone());

		let mut num = 0;
		while num < self.block.len() {
			match self.inner.write(&self.block[num..])? {
				0 => break,
				n => num += n,
			}
		}
		if num < self.block.len() {
			let pos = self.inner.stream_position()?;
			log::error!("short write: pos={pos}, num={num}, len={}", self.block.len());
		}
		self.dirty = false;
		Ok(())
	}
}

impl<T: Backend> BufRead for BlockReader<T> {
	fn fill_buf(&mut self) -> IoResult<&[u8]> {
		self.refill_if_empty()?;
		Ok(&self.block[self.idx..])
	}

	fn consume(&mut self, amt: usize) {
		assert!(amt <= self.buffered());
		self.idx += amt;
	}
}

impl<T: Backend> Seek for BlockReader<T> {
	fn seek(&mut self, pos: SeekFrom) -> IoResult<u64> {
		let bs = self.blksize() as u64;
		match pos {
			SeekFrom::Start(pos) => {
				self.flush()?;
				let real = self.inner.seek(SeekFrom::Start(pos / bs * bs))?;
				let rem = pos - real;
				assert!(rem < bs);

				self.refill()?;
				self.idx = rem as usize;

				Ok(real + rem)
			}
			SeekFrom::Current(offset) => {
				let real = self.inner.stream_position()?;
				let cur = real - self.block.len() as u64 + self.idx as u64;
				let newidx = offset + self.idx as i64;
				if newidx >= 0 && newidx < self.blksize() as i64 {
					// The data is already buffered; just adjust the pointer
					self.idx = newidx as usize;
					Ok(real - self.block.len() as u64 + newidx as u64)
				} else if cur as i64 + offset < 0 {
					Err(io::Error::from_raw_os_error(libc::EINVAL))
				} else {
					self.seek(SeekFrom::Start((cur as i64 + offset) as u64))
				}
			}
			SeekFrom::End(offset) => {
				self.flush()?;
				let end = self.inner.seek(SeekFrom::End(0))?;
				let target = end as i64 + offset;
				if target < 0 {
					return Err(io::Error::from_raw_os_error(libc::EINVAL));
				}
				self.seek(SeekFrom::Start(target as u64))
			}
		}
	}
}

#[cfg(test)]
mod t {
	use super::*;

	const FSIZE: u64 = 1 << 20;
	const BS: usize = 4096;

	fn harness(rw: bool) -> BlockReader<std::io::Cursor<Vec<u8>>> {
		let img = std::io::Cursor::new(vec![0u8; FSIZE as usize]);
		BlockReader::new(img, BS, rw)
	}

	#[test]
	fn simple_write() {
		let mut br = harness(true);
		let pos = BS + (BS >> 2);
		let mut buf = vec![0x55u8; BS];
		br.seek(SeekFrom::Start(pos as u64)).unwrap();
		br.write_all(&buf).unwrap();
		buf.fill(0);
		br.seek(SeekFrom::Start(pos as u64)).unwrap();
		br.read_exact(&mut buf).unwrap();
		assert_eq!(buf, vec![0x55u8; BS]);
	}

	#[test]
	fn seek_current() {
		let mut br = harness(false);
		let initial = BS + (BS >> 2);
		br.seek(SeekFrom::Start(initial as u64)).unwrap();
		let p = br.seek(SeekFrom::Current(-1)).unwrap();
		assert_eq!(p, initial as u64 - 1);
		let p = br.seek(SeekFrom::Current(BS as i64)).unwrap();
		assert_eq!(p, initial as u64 - 1 + BS as u64);
	}

	#[test]
	fn seek_end_and_size() {
		let mut br = harness(false);
		assert_eq!(br.device_size().unwrap(), FSIZE);
		let p = br.seek(SeekFrom::End(-(BS as i64))).unwrap();
		assert_eq!(p, FSIZE - BS as u64);
	}
}
