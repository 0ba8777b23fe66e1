//! Field-level encoding primitives shared by all message bodies.
//!
//! Scalars are big endian. Strings are a u16 length followed by that many
//! bytes of UTF-8. Booleans are a single byte, zero or one.
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use std::io::{Error, ErrorKind, Result};

pub(crate) struct Enc<'a>(pub &'a mut BytesMut);

impl<'a> Enc<'a> {
    pub fn u8(&mut self, v: u8) {
        self.0.put_u8(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.0.put_u16(v);
    }

    pub fn u32(&mut self, v: u32) {
        self.0.put_u32(v);
    }

    pub fn u64(&mut self, v: u64) {
        self.0.put_u64(v);
    }

    pub fn flag(&mut self, v: bool) {
        self.0.put_u8(v as u8);
    }

    pub fn string(&mut self, s: &str) {
        debug_assert!(s.len() <= u16::MAX as usize);
        self.0.put_u16(s.len() as u16);
        self.0.put_slice(s.as_bytes());
    }
}

pub(crate) struct Dec<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Dec<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::new(ErrorKind::UnexpectedEof, "truncated message"));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    pub fn flag(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    pub fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::new(ErrorKind::InvalidData, "string is not utf-8"))
    }

    /// Fails unless the whole buffer was consumed.
    pub fn finish(self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(Error::new(ErrorKind::InvalidData, "trailing bytes"));
        }
        Ok(())
    }
}
