//! Little-endian binary I/O primitives for the persistent network image
//! (§6.1). The on-disk layout is externally fixed field-by-field, so
//! this is hand-rolled rather than routed through `serde`.

use std::io::{self, Read, Write};

pub trait BinaryReader: Read {
  fn read_u8(&mut self) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    self.read_exact(&mut buf)?;
    Ok(buf[0])
  }

  fn read_u32_le(&mut self) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    self.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
  }

  fn read_u64_le(&mut self) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    self.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
  }

  fn read_f32_le(&mut self) -> io::Result<f32> {
    Ok(f32::from_bits(self.read_u32_le()?))
  }

  fn read_bytes(&mut self, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    self.read_exact(&mut buf)?;
    Ok(buf)
  }

  /// Reads a `u32` length prefix followed by that many raw bytes, and
  /// interprets them as UTF-8.
  fn read_string(&mut self) -> io::Result<String> {
    let len = self.read_u32_le()? as usize;
    let bytes = self.read_bytes(len)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
  }
}

impl<R: Read + ?Sized> BinaryReader for R {}

pub trait BinaryWriter: Write {
  fn write_u8(&mut self, value: u8) -> io::Result<()> {
    self.write_all(&[value])
  }

  fn write_u32_le(&mut self, value: u32) -> io::Result<()> {
    self.write_all(&value.to_le_bytes())
  }

  fn write_u64_le(&mut self, value: u64) -> io::Result<()> {
    self.write_all(&value.to_le_bytes())
  }

  fn write_f32_le(&mut self, value: f32) -> io::Result<()> {
    self.write_u32_le(value.to_bits())
  }

  fn write_string(&mut self, value: &str) -> io::Result<()> {
    self.write_u32_le(value.len() as u32)?;
    self.write_all(value.as_bytes())
  }
}

impl<W: Write + ?Sized> BinaryWriter for W {}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  #[test]
  fn round_trips_primitives() {
    let mut buf = Vec::new();
    buf.write_u32_le(0xdead_beef).unwrap();
    buf.write_u64_le(0x1122_3344_5566_7788).unwrap();
    buf.write_f32_le(3.5).unwrap();
    buf.write_string("allophone").unwrap();

    let mut cursor = Cursor::new(buf);
    assert_eq!(cursor.read_u32_le().unwrap(), 0xdead_beef);
    assert_eq!(cursor.read_u64_le().unwrap(), 0x1122_3344_5566_7788);
    assert_eq!(cursor.read_f32_le().unwrap(), 3.5);
    assert_eq!(cursor.read_string().unwrap(), "allophone");
  }
}
