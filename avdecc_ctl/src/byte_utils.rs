use std::cmp::min;
use std::str;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StringFieldError {
  #[error("string field at {offset} is past the end of a {len} byte buffer")]
  OutOfBounds { offset: usize, len: usize },
  #[error("string field is not valid UTF-8")]
  InvalidUtf8(#[from] str::Utf8Error),
}

/// Writes `s` into a fixed-width field, truncated to `max_len` bytes without splitting a character.
/// The rest of the field is left as is (callers hand in zeroed buffers).
pub fn write_str_to_buffer(buffer: &mut [u8], offset: usize, max_len: usize, s: &str) {
  if offset >= buffer.len() {
    return;
  }
  let mut len = min(min(max_len, s.len()), buffer.len() - offset);
  while !s.is_char_boundary(len) {
    len -= 1;
  }
  buffer[offset..offset + len].clone_from_slice(&s.as_bytes()[0..len]);
}

/// AEM names are 64 byte fields, NUL-terminated unless they use all 64 bytes.
pub fn read_0term_str_from_buffer(buffer: &[u8], offset: usize) -> Result<&str, StringFieldError> {
  if offset >= buffer.len() {
    return Err(StringFieldError::OutOfBounds { offset, len: buffer.len() });
  }
  let field = &buffer[offset..];
  let ntpos = field.iter().position(|c| *c == 0).unwrap_or(field.len());
  return Ok(str::from_utf8(&field[..ntpos])?);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_name_field_roundtrip_and_truncation() {
    let mut field = [0u8; 8];
    write_str_to_buffer(&mut field, 0, 8, "Analog In 1");
    assert_eq!(read_0term_str_from_buffer(&field, 0).unwrap(), "Analog I");

    let mut field = [0u8; 8];
    write_str_to_buffer(&mut field, 2, 4, "ab");
    assert_eq!(read_0term_str_from_buffer(&field, 2).unwrap(), "ab");
    assert_eq!(read_0term_str_from_buffer(&field, 0).unwrap(), "");
  }

  #[test]
  fn test_truncation_keeps_whole_characters() {
    // G r ö(2) ß(2) e: a 5 byte limit falls inside ß, a 3 byte limit inside ö
    let mut field = [0u8; 8];
    write_str_to_buffer(&mut field, 0, 5, "Größe");
    assert_eq!(read_0term_str_from_buffer(&field, 0).unwrap(), "Grö");

    let mut field = [0u8; 4];
    write_str_to_buffer(&mut field, 0, 3, "Größe");
    assert_eq!(read_0term_str_from_buffer(&field, 0).unwrap(), "Gr");
    assert_eq!(field, [b'G', b'r', 0, 0]);
  }

  #[test]
  fn test_read_past_end() {
    assert_eq!(
      read_0term_str_from_buffer(&[0u8; 4], 4),
      Err(StringFieldError::OutOfBounds { offset: 4, len: 4 })
    );
  }
}
