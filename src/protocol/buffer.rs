//! Payload cursors for binary protocol messages
//!
//! [`BufferReader`] walks a received payload with big-endian primitive reads;
//! every underflow is reported as a truncated [`DecodeError`] carrying the
//! offset where the read started. [`BufferWriter`] fills fixed-size outgoing
//! frames such as the standby status update.

use crate::core::errors::DecodeError;

/// A cursor over a message payload with position tracking
#[derive(Debug)]
pub struct BufferReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Current position in the buffer
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// True if at least `count` bytes are left
    pub fn has_bytes(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    fn take(&mut self, count: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
        if !self.has_bytes(count) {
            return Err(DecodeError::truncated(
                self.position,
                format!("not enough bytes for {what}"),
            ));
        }
        let slice = &self.buffer[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1, "u8")?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.take(1, "i8")?[0] as i8)
    }

    pub fn read_i16(&mut self) -> Result<i16, DecodeError> {
        let bytes = self.take(2, "i16")?;
        Ok(i16::from_be_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        let bytes = self.take(4, "i32")?;
        Ok(i32::from_be_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4, "u32")?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        let bytes = self.take(8, "i64")?;
        Ok(i64::from_be_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.take(8, "u64")?;
        Ok(u64::from_be_bytes(bytes.try_into().expect("length checked")))
    }

    /// Read a NUL-terminated UTF-8 string and advance past the terminator
    pub fn read_cstr(&mut self) -> Result<String, DecodeError> {
        let start = self.position;
        let nul = self.buffer[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| DecodeError::truncated(start, "string not NUL-terminated"))?;
        let bytes = &self.buffer[start..start + nul];
        let value = std::str::from_utf8(bytes)
            .map_err(|_| DecodeError::malformed(start, "string is not valid UTF-8"))?
            .to_owned();
        self.position = start + nul + 1;
        Ok(value)
    }

    /// Read exactly `count` raw bytes
    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        self.take(count, "byte slice")
    }

    /// Look at the next byte without advancing
    pub fn peek_u8(&self) -> Result<u8, DecodeError> {
        if !self.has_bytes(1) {
            return Err(DecodeError::truncated(self.position, "no bytes to peek"));
        }
        Ok(self.buffer[self.position])
    }
}

/// A position-tracking writer over a fixed-size outgoing frame
#[derive(Debug)]
pub struct BufferWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> BufferWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn bytes_written(&self) -> usize {
        self.position
    }

    fn put(&mut self, bytes: &[u8], what: &'static str) -> Result<(), DecodeError> {
        if self.buffer.len() - self.position < bytes.len() {
            return Err(DecodeError::truncated(
                self.position,
                format!("not enough space for {what}"),
            ));
        }
        self.buffer[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), DecodeError> {
        self.put(&[value], "u8")
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), DecodeError> {
        self.put(&value.to_be_bytes(), "u64")
    }

    pub fn write_i64(&mut self, value: i64) -> Result<(), DecodeError> {
        self.put(&value.to_be_bytes(), "i64")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::DecodeKind;

    #[test]
    fn reads_primitives_in_network_order() {
        let data = [0x01, 0x02, 0x00, 0x03, 0xFF, 0xFF, 0xFF, 0xFF];
        let mut reader = BufferReader::new(&data);
        assert_eq!(reader.read_u8().unwrap(), 1);
        assert_eq!(reader.read_u8().unwrap(), 2);
        assert_eq!(reader.read_i16().unwrap(), 3);
        assert_eq!(reader.read_i32().unwrap(), -1);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn reads_nul_terminated_strings() {
        let data = b"public\0integration\0";
        let mut reader = BufferReader::new(data);
        assert_eq!(reader.read_cstr().unwrap(), "public");
        assert_eq!(reader.read_cstr().unwrap(), "integration");
        assert_eq!(reader.position(), data.len());
    }

    #[test]
    fn missing_terminator_is_truncated() {
        let mut reader = BufferReader::new(b"public");
        let err = reader.read_cstr().unwrap_err();
        assert_eq!(err.kind, DecodeKind::Truncated);
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let mut reader = BufferReader::new(&[0xFF, 0xFE, 0x00]);
        let err = reader.read_cstr().unwrap_err();
        assert_eq!(err.kind, DecodeKind::Malformed);
    }

    #[test]
    fn underflow_reports_offset() {
        let mut reader = BufferReader::new(&[0x00, 0x01]);
        reader.read_u8().unwrap();
        let err = reader.read_i64().unwrap_err();
        assert_eq!(err.kind, DecodeKind::Truncated);
        assert_eq!(err.offset, 1);
    }

    #[test]
    fn writer_fills_fixed_frame() {
        let mut buf = [0u8; 9];
        let mut writer = BufferWriter::new(&mut buf);
        writer.write_u8(b'r').unwrap();
        writer.write_u64(0x0102030405060708).unwrap();
        assert_eq!(writer.bytes_written(), 9);
        assert_eq!(buf[0], b'r');
        assert_eq!(buf[8], 0x08);
    }

    #[test]
    fn writer_overflow_errors() {
        let mut buf = [0u8; 4];
        let mut writer = BufferWriter::new(&mut buf);
        assert!(writer.write_u64(1).is_err());
    }
}
