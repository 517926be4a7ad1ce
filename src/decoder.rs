use std::io::{BufRead, Error, ErrorKind, Result, Seek, SeekFrom, Write};

use bincode::{
	config::{BigEndian, Configuration, Fixint, LittleEndian, NoLimit},
	de::read::Reader,
	error::DecodeError,
	Decode, Encode,
};

/// Adapts a `&mut dyn BufRead` to bincode's `Reader` trait, which has no
/// blanket impl for trait objects.
struct DynReader<'a>(&'a mut dyn BufRead);

impl<'a> Reader for DynReader<'a> {
	fn read(&mut self, bytes: &mut [u8]) -> std::result::Result<(), DecodeError> {
		self.0.read_exact(bytes).map_err(|inner| DecodeError::Io {
			inner,
			additional: bytes.len(),
		})
	}
}

/// Endianness of every multi-byte integer on the medium.
///
/// The configuration is fixed-int: structures map to the disk byte for
/// byte, field order is layout order.
#[derive(Clone, Copy)]
pub enum Config {
	Little(Configuration<LittleEndian, Fixint, NoLimit>),
	Big(Configuration<BigEndian, Fixint, NoLimit>),
}

impl Config {
	pub const fn little() -> Self {
		let cfg = bincode::config::standard()
			.with_fixed_int_encoding()
			.with_little_endian();
		Self::Little(cfg)
	}

	pub const fn big() -> Self {
		let cfg = bincode::config::standard()
			.with_fixed_int_encoding()
			.with_big_endian();
		Self::Big(cfg)
	}

	fn decode<T: Decode>(&self, rdr: &mut dyn BufRead) -> Result<T> {
		let rdr = DynReader(rdr);
		match self {
			Self::Little(cfg) => bincode::decode_from_reader(rdr, *cfg),
			Self::Big(cfg) => bincode::decode_from_reader(rdr, *cfg),
		}
		.map_err(|_| Error::new(ErrorKind::InvalidInput, "failed to decode"))
	}

	fn encode<T: Encode, W: Write>(&self, wtr: &mut W, v: &T) -> Result<usize> {
		match self {
			Self::Little(cfg) => bincode::encode_into_std_write(v, wtr, *cfg),
			Self::Big(cfg) => bincode::encode_into_std_write(v, wtr, *cfg),
		}
		.map_err(|_| Error::new(ErrorKind::InvalidInput, "failed to encode"))
	}

	/// Decode a value from the front of `b`.
	pub fn decode_slice<T: Decode>(&self, b: &[u8]) -> Result<T> {
		match self {
			Self::Little(cfg) => bincode::decode_from_slice(b, *cfg),
			Self::Big(cfg) => bincode::decode_from_slice(b, *cfg),
		}
		.map(|(v, _)| v)
		.map_err(|_| Error::new(ErrorKind::InvalidInput, "failed to decode"))
	}

	/// Encode a value into the front of `b`, returning the encoded length.
	pub fn encode_slice<T: Encode>(&self, b: &mut [u8], v: &T) -> Result<usize> {
		match self {
			Self::Little(cfg) => bincode::encode_into_slice(v, b, *cfg),
			Self::Big(cfg) => bincode::encode_into_slice(v, b, *cfg),
		}
		.map_err(|_| Error::new(ErrorKind::InvalidInput, "failed to encode"))
	}

	pub fn encoded_len<T: Encode>(&self, v: &T) -> Result<usize> {
		let mut buf = [0u8; 512];
		self.encode_slice(&mut buf, v)
	}
}

/// Typed access to the medium.
pub struct Decoder<T: BufRead> {
	inner:  T,
	config: Config,
}

impl<T: BufRead> Decoder<T> {
	pub fn new(inner: T, config: Config) -> Self {
		Self {
			inner,
			config,
		}
	}

	pub fn inner(&self) -> &T {
		&self.inner
	}

	pub fn inner_mut(&mut self) -> &mut T {
		&mut self.inner
	}

	pub fn decode<X: Decode>(&mut self) -> Result<X> {
		self.config.decode(&mut self.inner)
	}

	pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
		self.inner.read_exact(buf)
	}

	pub fn config(&self) -> Config {
		self.config
	}
}

impl<T: BufRead + Write> Decoder<T> {
	pub fn encode<X: Encode>(&mut self, v: &X) -> Result<usize> {
		self.config.encode(&mut self.inner, v)
	}

	pub fn write(&mut self, buf: &[u8]) -> Result<()> {
		self.inner.write_all(buf)
	}
}

impl<T: BufRead + Seek> Decoder<T> {
	pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
		self.seek(pos)?;
		self.read(buf)
	}

	pub fn decode_at<X: Decode>(&mut self, pos: u64) -> Result<X> {
		self.seek(pos)?;
		self.decode()
	}

	pub fn seek(&mut self, pos: u64) -> Result<()> {
		self.inner.seek(SeekFrom::Start(pos))?;
		Ok(())
	}

	pub fn pos(&mut self) -> Result<u64> {
		self.inner.stream_position()
	}
}

impl<T: BufRead + Write + Seek> Decoder<T> {
	pub fn encode_at<X: Encode>(&mut self, pos: u64, v: &X) -> Result<usize> {
		self.seek(pos)?;
		self.encode(v)
	}

	pub fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
		self.seek(pos)?;
		self.write(buf)
	}

	pub fn fill_at(&mut self, pos: u64, byte: u8, len: usize) -> Result<()> {
		let chunk = [byte; 64];
		self.seek(pos)?;
		let mut left = len;
		while left > 0 {
			let n = left.min(chunk.len());
			self.write(&chunk[0..n])?;
			left -= n;
		}
		Ok(())
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn slice_roundtrip_big() {
		let cfg = Config::big();
		let mut b = [0u8; 8];
		cfg.encode_slice(&mut b, &0x11223344u32).unwrap();
		assert_eq!(&b[0..4], &[0x11, 0x22, 0x33, 0x44]);
		let v: u32 = cfg.decode_slice(&b).unwrap();
		assert_eq!(v, 0x11223344);
	}

	#[test]
	fn slice_roundtrip_little() {
		let cfg = Config::little();
		let mut b = [0u8; 8];
		cfg.encode_slice(&mut b, &0x11223344u32).unwrap();
		assert_eq!(&b[0..4], &[0x44, 0x33, 0x22, 0x11]);
	}

	#[test]
	fn stream_encode_decode() {
		let cfg = Config::big();
		let buf = std::io::Cursor::new(vec![0u8; 64]);
		let mut d = Decoder::new(buf, cfg);
		d.encode_at(8, &0xdeadbeefu32).unwrap();
		let v: u32 = d.decode_at(8).unwrap();
		assert_eq!(v, 0xdeadbeef);
	}
}
