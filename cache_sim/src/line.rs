use std::fmt;

use thiserror::Error;

/// Byte index outside of a line. Only a broken address decomposition produces this.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("max number of bytes per line is {line_size}, but byte {byte_id} was asked")]
pub struct LineByteIndexError {
    pub byte_id: usize,
    pub line_size: usize,
}

pub type Result<T> = std::result::Result<T, LineByteIndexError>;

/// One block of the cache. `tag` is meaningful only while `valid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLine {
    valid: bool,
    tag: Option<usize>,
    bytes: Box<[u8]>,
}

impl CacheLine {
    pub fn new(block_size: usize) -> Self {
        Self {
            valid: false,
            tag: None,
            bytes: vec![0; block_size].into_boxed_slice(),
        }
    }
    pub fn is_valid(&self) -> bool {
        self.valid
    }
    /// resident tag, `None` while the line is invalid.
    pub fn tag(&self) -> Option<usize> {
        self.tag.filter(|_| self.valid)
    }
    pub fn holds(&self, tag: usize) -> bool {
        self.valid && self.tag == Some(tag)
    }
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
    pub fn read(&self, byte_id: usize) -> Result<u8> {
        self.bytes
            .get(byte_id)
            .copied()
            .ok_or(LineByteIndexError {
                byte_id,
                line_size: self.bytes.len(),
            })
    }
    /// overwrites one byte; validity and tag stay as they are.
    pub fn write(&mut self, byte_id: usize, byte: u8) -> Result<()> {
        let line_size = self.bytes.len();
        match self.bytes.get_mut(byte_id) {
            Some(b) => {
                *b = byte;
                Ok(())
            }
            None => Err(LineByteIndexError { byte_id, line_size }),
        }
    }
    /// replaces the whole block and makes the line resident for `tag`.
    pub fn fill(&mut self, tag: usize, block: &[u8]) -> Result<()> {
        if block.len() != self.bytes.len() {
            return Err(LineByteIndexError {
                byte_id: block.len(),
                line_size: self.bytes.len(),
            });
        }
        self.bytes.copy_from_slice(block);
        self.valid = true;
        self.tag = Some(tag);
        Ok(())
    }
}

impl fmt::Display for CacheLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            Some(tag) => write!(f, "  ({tag:05x})")?,
            None => write!(f, "! (-----)")?,
        }
        for b in self.bytes.iter() {
            write!(f, " {b:02x}")?;
        }
        Ok(())
    }
}
