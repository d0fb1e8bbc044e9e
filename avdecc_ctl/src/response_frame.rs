//! Staging area for the payloads of the last replies received from one end station.
//!
//! Command and counter replies go to the command buffer, READ_DESCRIPTOR replies to the
//! descriptor buffer. The two are independent and can be replaced in any order.

use thiserror::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameKind {
  Command,
  Descriptor,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
  #[error("unable to allocate {size} bytes for response frame")]
  Allocation { size: usize },
  #[error("requested {size} bytes at {pos}, frame has only {len}")]
  OutOfBounds { pos: usize, size: usize, len: usize },
}

#[derive(Debug, Default)]
struct FrameBuffer {
  data: Vec<u8>,
  position: usize,
}

#[derive(Debug, Default)]
pub struct ResponseFrame {
  command: FrameBuffer,
  descriptor: FrameBuffer,
}

impl ResponseFrame {
  pub fn new() -> Self {
    Self::default()
  }

  fn buffer(&self, kind: FrameKind) -> &FrameBuffer {
    match kind {
      FrameKind::Command => &self.command,
      FrameKind::Descriptor => &self.descriptor,
    }
  }

  fn buffer_mut(&mut self, kind: FrameKind) -> &mut FrameBuffer {
    match kind {
      FrameKind::Command => &mut self.command,
      FrameKind::Descriptor => &mut self.descriptor,
    }
  }

  /// Drops the previous contents of `kind`, then copies `size` bytes of `frame` starting at `pos`.
  /// The read offset goes back to 0. On error the buffer is left empty.
  pub fn replace(&mut self, kind: FrameKind, frame: &[u8], pos: usize, size: usize) -> Result<(), FrameError> {
    let buffer = self.buffer_mut(kind);
    buffer.data = Vec::new();
    buffer.position = 0;

    let mut data = Vec::new();
    data.try_reserve_exact(size).map_err(|_| FrameError::Allocation { size })?;
    let source = pos
      .checked_add(size)
      .and_then(|end| frame.get(pos..end))
      .ok_or(FrameError::OutOfBounds { pos, size, len: frame.len() })?;
    data.extend_from_slice(source);
    buffer.data = data;
    return Ok(());
  }

  pub fn read_offset(&self, kind: FrameKind) -> usize {
    self.buffer(kind).position
  }

  pub fn size(&self, kind: FrameKind) -> usize {
    self.buffer(kind).data.len()
  }

  /// Whole buffer. Valid until the next `replace` of the same kind.
  pub fn data(&self, kind: FrameKind) -> &[u8] {
    &self.buffer(kind).data
  }

  /// Unread part of the buffer.
  pub fn remaining(&self, kind: FrameKind) -> &[u8] {
    let buffer = self.buffer(kind);
    &buffer.data[buffer.position..]
  }

  /// Moves the read offset forward, clamped to the buffer size.
  pub fn advance(&mut self, kind: FrameKind, count: usize) {
    let buffer = self.buffer_mut(kind);
    buffer.position = buffer.position.saturating_add(count).min(buffer.data.len());
  }
}
