use anyhow::{Context, Result};

/// Big-endian cursor over class file bytes.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.offset
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.offset)
            .context("class file out of bounds")?;
        self.offset += 1;
        Ok(byte)
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let bytes = self.bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        let bytes = self.bytes(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let start = self.offset;
        let end = start.checked_add(len).context("class file out of bounds")?;
        let slice = self
            .data
            .get(start..end)
            .context("class file out of bounds")?;
        self.offset = end;
        Ok(slice)
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<()> {
        self.bytes(len)?;
        Ok(())
    }

    /// Fails when unread bytes remain.
    pub(crate) fn expect_end(&self, what: &str) -> Result<()> {
        if !self.is_empty() {
            anyhow::bail!(
                "{} trailing bytes after {what}",
                self.data.len() - self.offset
            );
        }
        Ok(())
    }
}

/// Big-endian append helpers for class file output.
pub(crate) trait ByteSink {
    fn put_u8(&mut self, value: u8);
    fn put_u16(&mut self, value: u16);
    fn put_u32(&mut self, value: u32);
    fn put_i32(&mut self, value: i32);
}

impl ByteSink for Vec<u8> {
    fn put_u8(&mut self, value: u8) {
        self.push(value);
    }

    fn put_u16(&mut self, value: u16) {
        self.extend_from_slice(&value.to_be_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.extend_from_slice(&value.to_be_bytes());
    }

    fn put_i32(&mut self, value: i32) {
        self.extend_from_slice(&value.to_be_bytes());
    }
}

/// Convert a length to the u16 used by class file tables.
pub(crate) fn table_len(len: usize, what: &str) -> Result<u16> {
    u16::try_from(len).with_context(|| format!("too many {what}: {len}"))
}
