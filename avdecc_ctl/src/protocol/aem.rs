//! The parts of the AVDECC Entity Model vocabulary this controller reads and writes.
//!
//! Only command-specific payloads are described here. The AVTPDU/AECP framing around them
//! belongs to the protocol layer below.

use std::fmt;

use binary_layout::prelude::*;
use bytebuffer::{ByteBuffer, Endian};

use crate::byte_utils::{read_0term_str_from_buffer, write_str_to_buffer};

pub const DESC_ENTITY: u16 = 0x0000;
pub const DESC_CONFIGURATION: u16 = 0x0001;
pub const DESC_AUDIO_UNIT: u16 = 0x0002;
pub const DESC_STREAM_INPUT: u16 = 0x0005;
pub const DESC_STREAM_OUTPUT: u16 = 0x0006;
pub const DESC_STRINGS: u16 = 0x0007;

pub const CMD_ENTITY_AVAILABLE: u16 = 0x0002;
pub const CMD_READ_DESCRIPTOR: u16 = 0x0004;
pub const CMD_SET_STREAM_FORMAT: u16 = 0x0008;
pub const CMD_SET_SAMPLING_RATE: u16 = 0x0028;

pub const NAME_LENGTH: usize = 64;
/// Localized description value meaning "no string".
pub const NO_STRING: u16 = 0xffff;
/// Each STRINGS descriptor holds this many strings.
pub const STRINGS_PER_DESCRIPTOR: usize = 7;

/// Sampling rates carry a pull multiplier in the top 3 bits.
const SAMPLING_RATE_BASE_MASK: u32 = 0x1fff_ffff;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
  Success,
  NotImplemented,
  NoSuchDescriptor,
  EntityLocked,
  EntityAcquired,
  NotAuthenticated,
  AuthenticationDisabled,
  BadArguments,
  NoResources,
  InProgress,
  EntityMisbehaving,
  NotSupported,
  StreamIsRunning,
  Unknown(u8),
  /// No reply within the dispatcher's timeout.
  Timeout,
  /// The wait was abandoned locally.
  Aborted,
}

impl Status {
  pub fn from_aem(code: u8) -> Self {
    match code {
      0 => Self::Success,
      1 => Self::NotImplemented,
      2 => Self::NoSuchDescriptor,
      3 => Self::EntityLocked,
      4 => Self::EntityAcquired,
      5 => Self::NotAuthenticated,
      6 => Self::AuthenticationDisabled,
      7 => Self::BadArguments,
      8 => Self::NoResources,
      9 => Self::InProgress,
      10 => Self::EntityMisbehaving,
      11 => Self::NotSupported,
      12 => Self::StreamIsRunning,
      other => Self::Unknown(other),
    }
  }

  /// Code as carried on the wire, `None` for statuses that only exist on the controller side.
  pub fn aem_code(&self) -> Option<u8> {
    Some(match self {
      Self::Success => 0,
      Self::NotImplemented => 1,
      Self::NoSuchDescriptor => 2,
      Self::EntityLocked => 3,
      Self::EntityAcquired => 4,
      Self::NotAuthenticated => 5,
      Self::AuthenticationDisabled => 6,
      Self::BadArguments => 7,
      Self::NoResources => 8,
      Self::InProgress => 9,
      Self::EntityMisbehaving => 10,
      Self::NotSupported => 11,
      Self::StreamIsRunning => 12,
      Self::Unknown(code) => *code,
      Self::Timeout | Self::Aborted => return None,
    })
  }

  pub fn is_success(&self) -> bool {
    *self == Self::Success
  }
}

impl fmt::Display for Status {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Success => "SUCCESS",
      Self::NotImplemented => "NOT_IMPLEMENTED",
      Self::NoSuchDescriptor => "NO_SUCH_DESCRIPTOR",
      Self::EntityLocked => "ENTITY_LOCKED",
      Self::EntityAcquired => "ENTITY_ACQUIRED",
      Self::NotAuthenticated => "NOT_AUTHENTICATED",
      Self::AuthenticationDisabled => "AUTHENTICATION_DISABLED",
      Self::BadArguments => "BAD_ARGUMENTS",
      Self::NoResources => "NO_RESOURCES",
      Self::InProgress => "IN_PROGRESS",
      Self::EntityMisbehaving => "ENTITY_MISBEHAVING",
      Self::NotSupported => "NOT_SUPPORTED",
      Self::StreamIsRunning => "STREAM_IS_RUNNING",
      Self::Unknown(code) => return write!(f, "UNKNOWN ({code:#04x})"),
      Self::Timeout => "TIMEOUT",
      Self::Aborted => "ABORTED",
    };
    f.write_str(name)
  }
}

pub fn descriptor_name(descriptor_type: u16) -> Option<&'static str> {
  Some(match descriptor_type {
    DESC_ENTITY => "ENTITY",
    DESC_CONFIGURATION => "CONFIGURATION",
    DESC_AUDIO_UNIT => "AUDIO_UNIT",
    DESC_STREAM_INPUT => "STREAM_INPUT",
    DESC_STREAM_OUTPUT => "STREAM_OUTPUT",
    DESC_STRINGS => "STRINGS",
    _ => return None,
  })
}

pub fn string_reference(strings_descriptor_index: u16, string_index: u8) -> u16 {
  (strings_descriptor_index << 3) | (string_index as u16 & 0x7)
}

/// Splits a localized string reference into (STRINGS descriptor index, string index).
pub fn split_string_reference(reference: u16) -> Option<(u16, u8)> {
  if reference == NO_STRING {
    return None;
  }
  let string_index = (reference & 0x7) as u8;
  if string_index as usize >= STRINGS_PER_DESCRIPTOR {
    return None;
  }
  Some((reference >> 3, string_index))
}

pub const AEM_RESPONSE_HEADER_LENGTH: usize = 20;

define_layout!(aem_response, BigEndian, {
  target_entity_id: u64,
  controller_entity_id: u64,
  sequence_id: u16,
  command_type: u16,
  payload: [u8]
});

pub fn make_response(
  target_entity_id: u64,
  controller_entity_id: u64,
  sequence_id: u16,
  command_type: u16,
  payload: &[u8],
) -> Vec<u8> {
  let mut buffer = vec![0u8; AEM_RESPONSE_HEADER_LENGTH + payload.len()];
  let mut view = aem_response::View::new(&mut buffer[..]);
  view.target_entity_id_mut().write(target_entity_id);
  view.controller_entity_id_mut().write(controller_entity_id);
  view.sequence_id_mut().write(sequence_id);
  view.command_type_mut().write(command_type);
  view.payload_mut().copy_from_slice(payload);
  buffer
}

pub const SET_SAMPLING_RATE_PAYLOAD_LENGTH: usize = 8;

define_layout!(set_sampling_rate_payload, BigEndian, {
  descriptor_type: u16,
  descriptor_index: u16,
  sampling_rate: u32
});

pub const SET_STREAM_FORMAT_PAYLOAD_LENGTH: usize = 12;

define_layout!(set_stream_format_payload, BigEndian, {
  descriptor_type: u16,
  descriptor_index: u16,
  stream_format: u64
});

pub const READ_DESCRIPTOR_HEADER_LENGTH: usize = 4;

define_layout!(read_descriptor_payload, BigEndian, {
  configuration_index: u16,
  reserved: u16,
  descriptor: [u8]
});

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SamplingRatePayload {
  pub descriptor_type: u16,
  pub descriptor_index: u16,
  pub sampling_rate: u32,
}

impl SamplingRatePayload {
  pub fn parse(bytes: &[u8]) -> Option<Self> {
    if bytes.len() < SET_SAMPLING_RATE_PAYLOAD_LENGTH {
      return None;
    }
    let view = set_sampling_rate_payload::View::new(&bytes[..SET_SAMPLING_RATE_PAYLOAD_LENGTH]);
    Some(Self {
      descriptor_type: view.descriptor_type().read(),
      descriptor_index: view.descriptor_index().read(),
      sampling_rate: view.sampling_rate().read() & SAMPLING_RATE_BASE_MASK,
    })
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut buffer = vec![0u8; SET_SAMPLING_RATE_PAYLOAD_LENGTH];
    let mut view = set_sampling_rate_payload::View::new(&mut buffer[..]);
    view.descriptor_type_mut().write(self.descriptor_type);
    view.descriptor_index_mut().write(self.descriptor_index);
    view.sampling_rate_mut().write(self.sampling_rate);
    buffer
  }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StreamFormatPayload {
  pub descriptor_type: u16,
  pub descriptor_index: u16,
  pub stream_format: u64,
}

impl StreamFormatPayload {
  pub fn parse(bytes: &[u8]) -> Option<Self> {
    if bytes.len() < SET_STREAM_FORMAT_PAYLOAD_LENGTH {
      return None;
    }
    let view = set_stream_format_payload::View::new(&bytes[..SET_STREAM_FORMAT_PAYLOAD_LENGTH]);
    Some(Self {
      descriptor_type: view.descriptor_type().read(),
      descriptor_index: view.descriptor_index().read(),
      stream_format: view.stream_format().read(),
    })
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut buffer = vec![0u8; SET_STREAM_FORMAT_PAYLOAD_LENGTH];
    let mut view = set_stream_format_payload::View::new(&mut buffer[..]);
    view.descriptor_type_mut().write(self.descriptor_type);
    view.descriptor_index_mut().write(self.descriptor_index);
    view.stream_format_mut().write(self.stream_format);
    buffer
  }
}

pub fn encode_read_descriptor_payload(configuration_index: u16, descriptor: &[u8]) -> Vec<u8> {
  let mut buff = ByteBuffer::new();
  buff.set_endian(Endian::BigEndian);
  buff.write_u16(configuration_index);
  buff.write_u16(0);
  buff.write_bytes(descriptor);
  buff.into_vec()
}

/// Returns (configuration index, descriptor bytes).
pub fn split_read_descriptor_payload(bytes: &[u8]) -> Option<(u16, &[u8])> {
  if bytes.len() < READ_DESCRIPTOR_HEADER_LENGTH + 4 {
    return None;
  }
  let view = read_descriptor_payload::View::new(bytes);
  let configuration_index = view.configuration_index().read();
  Some((configuration_index, &bytes[READ_DESCRIPTOR_HEADER_LENGTH..]))
}

/// Type and index heading every descriptor.
pub fn descriptor_address(descriptor: &[u8]) -> Option<(u16, u16)> {
  if descriptor.len() < 4 {
    return None;
  }
  Some((
    u16::from_be_bytes([descriptor[0], descriptor[1]]),
    u16::from_be_bytes([descriptor[2], descriptor[3]]),
  ))
}

pub const STREAM_DESCRIPTOR_PREFIX_LENGTH: usize = 4 + NAME_LENGTH + 14;

define_layout!(stream_descriptor, BigEndian, {
  descriptor_type: u16,
  descriptor_index: u16,
  object_name: [u8; 64],
  localized_description: u16,
  clock_domain_index: u16,
  stream_flags: u16,
  current_format: u64,
  tail: [u8]
});

/// STREAM_INPUT / STREAM_OUTPUT fields up to the current format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamDescriptor {
  pub descriptor_type: u16,
  pub descriptor_index: u16,
  pub object_name: String,
  pub localized_description: u16,
  pub clock_domain_index: u16,
  pub stream_flags: u16,
  pub current_format: u64,
}

impl StreamDescriptor {
  pub fn parse(bytes: &[u8]) -> Option<Self> {
    if bytes.len() < STREAM_DESCRIPTOR_PREFIX_LENGTH {
      return None;
    }
    let view = stream_descriptor::View::new(bytes);
    let descriptor_type = view.descriptor_type().read();
    if descriptor_type != DESC_STREAM_INPUT && descriptor_type != DESC_STREAM_OUTPUT {
      return None;
    }
    Some(Self {
      descriptor_type,
      descriptor_index: view.descriptor_index().read(),
      object_name: read_0term_str_from_buffer(&view.object_name()[..], 0).unwrap_or("").to_owned(),
      localized_description: view.localized_description().read(),
      clock_domain_index: view.clock_domain_index().read(),
      stream_flags: view.stream_flags().read(),
      current_format: view.current_format().read(),
    })
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut buffer = vec![0u8; STREAM_DESCRIPTOR_PREFIX_LENGTH];
    let mut view = stream_descriptor::View::new(&mut buffer[..]);
    view.descriptor_type_mut().write(self.descriptor_type);
    view.descriptor_index_mut().write(self.descriptor_index);
    write_str_to_buffer(&mut view.object_name_mut()[..], 0, NAME_LENGTH, &self.object_name);
    view.localized_description_mut().write(self.localized_description);
    view.clock_domain_index_mut().write(self.clock_domain_index);
    view.stream_flags_mut().write(self.stream_flags);
    view.current_format_mut().write(self.current_format);
    buffer
  }
}

pub const AUDIO_UNIT_DESCRIPTOR_PREFIX_LENGTH: usize = 4 + NAME_LENGTH + 4 + 64 + 8;

define_layout!(audio_unit_descriptor, BigEndian, {
  descriptor_type: u16,
  descriptor_index: u16,
  object_name: [u8; 64],
  localized_description: u16,
  clock_domain_index: u16,
  // number_of_* / base_* pairs for the 16 port and block kinds
  port_ranges: [u8; 64],
  current_sampling_rate: u32,
  sampling_rates_offset: u16,
  sampling_rates_count: u16,
  tail: [u8]
});

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioUnitDescriptor {
  pub descriptor_index: u16,
  pub object_name: String,
  pub localized_description: u16,
  pub clock_domain_index: u16,
  pub current_sampling_rate: u32,
  pub sampling_rates: Vec<u32>,
}

impl AudioUnitDescriptor {
  pub fn parse(bytes: &[u8]) -> Option<Self> {
    if bytes.len() < AUDIO_UNIT_DESCRIPTOR_PREFIX_LENGTH {
      return None;
    }
    let view = audio_unit_descriptor::View::new(bytes);
    if view.descriptor_type().read() != DESC_AUDIO_UNIT {
      return None;
    }
    let offset = view.sampling_rates_offset().read() as usize;
    let count = view.sampling_rates_count().read() as usize;
    let rates = bytes.get(offset..offset.checked_add(count.checked_mul(4)?)?)?;
    Some(Self {
      descriptor_index: view.descriptor_index().read(),
      object_name: read_0term_str_from_buffer(&view.object_name()[..], 0).unwrap_or("").to_owned(),
      localized_description: view.localized_description().read(),
      clock_domain_index: view.clock_domain_index().read(),
      current_sampling_rate: view.current_sampling_rate().read() & SAMPLING_RATE_BASE_MASK,
      sampling_rates: rates
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]) & SAMPLING_RATE_BASE_MASK)
        .collect(),
    })
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut fixed = vec![0u8; AUDIO_UNIT_DESCRIPTOR_PREFIX_LENGTH];
    let mut view = audio_unit_descriptor::View::new(&mut fixed[..]);
    view.descriptor_type_mut().write(DESC_AUDIO_UNIT);
    view.descriptor_index_mut().write(self.descriptor_index);
    write_str_to_buffer(&mut view.object_name_mut()[..], 0, NAME_LENGTH, &self.object_name);
    view.localized_description_mut().write(self.localized_description);
    view.clock_domain_index_mut().write(self.clock_domain_index);
    view.current_sampling_rate_mut().write(self.current_sampling_rate);
    view.sampling_rates_offset_mut().write(AUDIO_UNIT_DESCRIPTOR_PREFIX_LENGTH as u16);
    view.sampling_rates_count_mut().write(self.sampling_rates.len() as u16);

    let mut buff = ByteBuffer::from_vec(fixed);
    buff.set_endian(Endian::BigEndian);
    buff.set_wpos(AUDIO_UNIT_DESCRIPTOR_PREFIX_LENGTH);
    for rate in &self.sampling_rates {
      buff.write_u32(*rate);
    }
    buff.into_vec()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_codes() {
    for code in 0..=12u8 {
      assert_eq!(Status::from_aem(code).aem_code(), Some(code));
    }
    assert_eq!(Status::from_aem(0), Status::Success);
    assert_eq!(Status::from_aem(7), Status::BadArguments);
    assert_eq!(Status::from_aem(30), Status::Unknown(30));
    assert_eq!(Status::Timeout.aem_code(), None);
    assert_eq!(Status::Unknown(30).to_string(), "UNKNOWN (0x1e)");
    assert_eq!(Status::StreamIsRunning.to_string(), "STREAM_IS_RUNNING");
  }

  #[test]
  fn test_descriptor_names() {
    assert_eq!(descriptor_name(DESC_ENTITY), Some("ENTITY"));
    assert_eq!(descriptor_name(DESC_CONFIGURATION), Some("CONFIGURATION"));
    assert_eq!(descriptor_name(DESC_STRINGS), Some("STRINGS"));
    assert_eq!(descriptor_name(0x0003), None);
  }

  #[test]
  fn test_string_references() {
    assert_eq!(split_string_reference(string_reference(2, 5)), Some((2, 5)));
    assert_eq!(split_string_reference(NO_STRING), None);
    // index 7 does not exist in a STRINGS descriptor
    assert_eq!(split_string_reference(0x0007), None);
  }

  #[test]
  fn test_response_envelope_layout() {
    let payload = SamplingRatePayload { descriptor_type: DESC_AUDIO_UNIT, descriptor_index: 0, sampling_rate: 48000 }.encode();
    let frame = make_response(0x1122, 0x3344, 7, CMD_SET_SAMPLING_RATE, &payload);
    assert_eq!(frame.len(), AEM_RESPONSE_HEADER_LENGTH + SET_SAMPLING_RATE_PAYLOAD_LENGTH);
    assert_eq!(&frame[16..20], &[0x00, 0x07, 0x00, 0x28]);
    assert_eq!(&frame[AEM_RESPONSE_HEADER_LENGTH..], &[0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0xbb, 0x80]);
  }

  #[test]
  fn test_pull_bits_are_masked() {
    let bytes = [0x00, 0x02, 0x00, 0x00, 0x20, 0x00, 0xbb, 0x80];
    assert_eq!(SamplingRatePayload::parse(&bytes).unwrap().sampling_rate, 48000);
    assert_eq!(SamplingRatePayload::parse(&bytes[..7]), None);
  }

  #[test]
  fn test_stream_descriptor_fields() {
    let descriptor = StreamDescriptor {
      descriptor_type: DESC_STREAM_OUTPUT,
      descriptor_index: 3,
      object_name: "Main out".to_owned(),
      localized_description: NO_STRING,
      clock_domain_index: 0,
      stream_flags: 0x0002,
      current_format: 0x00a0_0202_4000_0200,
    };
    let bytes = descriptor.encode();
    assert_eq!(bytes.len(), STREAM_DESCRIPTOR_PREFIX_LENGTH);
    assert_eq!(&bytes[4..12], b"Main out");
    assert_eq!(StreamDescriptor::parse(&bytes), Some(descriptor));
    assert_eq!(StreamDescriptor::parse(&bytes[..STREAM_DESCRIPTOR_PREFIX_LENGTH - 1]), None);
  }

  #[test]
  fn test_long_stream_name_is_cut_between_characters() {
    let name = format!("{}ö", "x".repeat(NAME_LENGTH - 1));
    let descriptor = StreamDescriptor {
      descriptor_type: DESC_STREAM_INPUT,
      descriptor_index: 0,
      object_name: name,
      localized_description: NO_STRING,
      clock_domain_index: 0,
      stream_flags: 0,
      current_format: 0,
    };
    let parsed = StreamDescriptor::parse(&descriptor.encode()).unwrap();
    assert_eq!(parsed.object_name, "x".repeat(NAME_LENGTH - 1));
  }

  #[test]
  fn test_audio_unit_sampling_rate_list() {
    let descriptor = AudioUnitDescriptor {
      descriptor_index: 0,
      object_name: String::new(),
      localized_description: string_reference(0, 2),
      clock_domain_index: 0,
      current_sampling_rate: 44100,
      sampling_rates: vec![44100, 48000, 96000],
    };
    let bytes = descriptor.encode();
    assert_eq!(bytes.len(), AUDIO_UNIT_DESCRIPTOR_PREFIX_LENGTH + 12);
    assert_eq!(AudioUnitDescriptor::parse(&bytes), Some(descriptor));
    // a list that runs past the end is rejected
    assert_eq!(AudioUnitDescriptor::parse(&bytes[..bytes.len() - 2]), None);
  }

  #[test]
  fn test_read_descriptor_payload_split() {
    let payload = encode_read_descriptor_payload(1, &[0x00, 0x05, 0x00, 0x02, 0xaa]);
    let (config, descriptor) = split_read_descriptor_payload(&payload).unwrap();
    assert_eq!(config, 1);
    assert_eq!(descriptor_address(descriptor), Some((DESC_STREAM_INPUT, 2)));
    assert_eq!(split_read_descriptor_payload(&payload[..6]), None);
  }
}
