//! SFTP packet framing.
//!
//! Format: 4-byte big-endian length (bytes that follow) + 1-byte type +
//! type-specific body. All multi-byte integers are big-endian. A string is
//! a 32-bit length followed by that many raw bytes; no terminator, not
//! necessarily UTF-8.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Length of the frame header (32-bit length plus packet type).
pub const FRAME_HEADER_LEN: usize = 5;

/// Builder for one outbound packet.
///
/// `new` stores a placeholder for the length and the packet type; append
/// fields with `put_u32`/`put_u64`/`put_str`, then `finish` patches the
/// length and yields the complete wire bytes.
pub struct PacketBuilder {
    buf: BytesMut,
}

impl PacketBuilder {
    /// Start a new packet of the given type.
    pub fn new(packet_type: u8) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(0); // length placeholder, patched by finish()
        buf.put_u8(packet_type);
        Self { buf }
    }

    /// Append a 32-bit integer.
    pub fn put_u32(&mut self, n: u32) {
        self.buf.put_u32(n);
    }

    /// Append a 64-bit integer.
    pub fn put_u64(&mut self, n: u64) {
        self.buf.put_u64(n);
    }

    /// Append a length-prefixed string.
    pub fn put_str(&mut self, s: &[u8]) {
        self.buf.put_u32(s.len() as u32);
        self.buf.put_slice(s);
    }

    /// Patch the length field and return the finished packet.
    pub fn finish(mut self) -> Bytes {
        let len = (self.buf.len() - 4) as u32;
        self.buf[..4].copy_from_slice(&len.to_be_bytes());
        self.buf.freeze()
    }
}

/// Parse cursor over an inbound packet body.
///
/// Every accessor fails with a protocol error if the body is too short.
pub struct PacketReader<'a> {
    body: &'a [u8],
}

impl<'a> PacketReader<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self { body }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.body.len()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.body.remaining() < n {
            return Err(Error::protocol("truncated packet"));
        }
        Ok(())
    }

    /// Unpack a 32-bit integer and advance.
    pub fn get_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.body.get_u32())
    }

    /// Unpack a 64-bit integer and advance.
    pub fn get_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.body.get_u64())
    }

    /// Unpack a length-prefixed string and advance.
    pub fn get_str(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        self.need(len)?;
        let s = self.body[..len].to_vec();
        self.body.advance(len);
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_fields() {
        let mut p = PacketBuilder::new(5);
        p.put_u32(7);
        p.put_u64(0x0102_0304_0506_0708);
        p.put_str(b"handle-bytes");
        let packet = p.finish();

        // Length prefix covers everything after itself.
        let len = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]) as usize;
        assert_eq!(len, packet.len() - 4);
        assert_eq!(packet[4], 5);

        let mut r = PacketReader::new(&packet[FRAME_HEADER_LEN..]);
        assert_eq!(r.get_u32().unwrap(), 7);
        assert_eq!(r.get_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(r.get_str().unwrap(), b"handle-bytes");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn empty_string_roundtrips() {
        let mut p = PacketBuilder::new(1);
        p.put_str(b"");
        let packet = p.finish();
        let mut r = PacketReader::new(&packet[FRAME_HEADER_LEN..]);
        assert_eq!(r.get_str().unwrap(), b"");
    }

    #[test]
    fn strings_are_binary_safe() {
        let data = [0u8, 255, 10, 0, 13];
        let mut p = PacketBuilder::new(103);
        p.put_str(&data);
        let packet = p.finish();
        let mut r = PacketReader::new(&packet[FRAME_HEADER_LEN..]);
        assert_eq!(r.get_str().unwrap(), data);
    }

    #[test]
    fn short_body_is_truncated() {
        let mut r = PacketReader::new(&[0, 0, 1]);
        assert!(matches!(r.get_u32(), Err(Error::Protocol { .. })));

        let mut r = PacketReader::new(&[0; 7]);
        assert!(matches!(r.get_u64(), Err(Error::Protocol { .. })));
    }

    #[test]
    fn string_longer_than_body_is_truncated() {
        // Length claims 100 bytes, only 2 follow.
        let mut r = PacketReader::new(&[0, 0, 0, 100, b'a', b'b']);
        assert!(matches!(r.get_str(), Err(Error::Protocol { .. })));
    }

    #[test]
    fn reader_does_not_read_past_consumed_string() {
        let mut p = PacketBuilder::new(1);
        p.put_str(b"ab");
        p.put_u32(9);
        let packet = p.finish();
        let mut r = PacketReader::new(&packet[FRAME_HEADER_LEN..]);
        assert_eq!(r.get_str().unwrap(), b"ab");
        assert_eq!(r.get_u32().unwrap(), 9);
        assert!(r.get_u32().is_err());
    }
}
