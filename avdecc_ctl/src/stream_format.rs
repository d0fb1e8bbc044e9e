//! Mapping between channel counts, sampling rates and the stream formats this controller offers.

/// The only rate with its own row of formats, every other rate uses the second row.
pub const BASE_SAMPLING_RATE: u32 = 48000;

const CHANNEL_COUNT_SHIFT: u32 = 44;
const CHANNEL_COUNT_MASK: u64 = 0xff;
/// Any channel field other than 1 or 2 is reported as this.
pub const DEFAULT_CHANNEL_COUNT: u32 = 8;

struct Ieee1722Format {
  value: u64,
  name: &'static str,
}

/// Indexed by stream format index.
const FORMATS: [Ieee1722Format; 8] = [
  Ieee1722Format { value: 0x00a0_0201_4000_0100, name: "IEC61883_AM824_MBLA_48KHZ_1CH" },
  Ieee1722Format { value: 0x00a0_0202_4000_0200, name: "IEC61883_AM824_MBLA_48KHZ_2CH" },
  Ieee1722Format { value: 0x00a0_0204_4000_0400, name: "IEC61883_AM824_MBLA_48KHZ_4CH" },
  Ieee1722Format { value: 0x00a0_0208_4000_0800, name: "IEC61883_AM824_MBLA_48KHZ_8CH" },
  Ieee1722Format { value: 0x00a0_0401_4000_0100, name: "IEC61883_AM824_MBLA_96KHZ_1CH" },
  Ieee1722Format { value: 0x00a0_0402_4000_0200, name: "IEC61883_AM824_MBLA_96KHZ_2CH" },
  Ieee1722Format { value: 0x00a0_0404_4000_0400, name: "IEC61883_AM824_MBLA_96KHZ_4CH" },
  Ieee1722Format { value: 0x00a0_0408_4000_0800, name: "IEC61883_AM824_MBLA_96KHZ_8CH" },
];

/// Stream format index for `channel_count` channels at `sampling_rate`, if there is one.
pub fn resolve(channel_count: u32, sampling_rate: u32) -> Option<u8> {
  let base = match channel_count {
    1 => 0,
    2 => 1,
    4 => 2,
    8 => 3,
    _ => return None,
  };
  if sampling_rate == BASE_SAMPLING_RATE {
    Some(base)
  } else {
    Some(base + 4)
  }
}

/// Channel count of a stream from its raw format value.
///
/// Looks only at bits 44..=51. 1 and 2 are taken as is, every other value
/// (including 4 and 6) is reported as 8 channels.
pub fn decode_channel_count(raw_format: u64) -> u32 {
  match (raw_format >> CHANNEL_COUNT_SHIFT) & CHANNEL_COUNT_MASK {
    1 => 1,
    2 => 2,
    _ => DEFAULT_CHANNEL_COUNT,
  }
}

/// Places `channel_count` in the field read by [`decode_channel_count`].
pub fn encode_channel_count(channel_count: u8) -> u64 {
  (channel_count as u64) << CHANNEL_COUNT_SHIFT
}

pub fn format_value(format_index: u8) -> Option<u64> {
  FORMATS.get(format_index as usize).map(|f| f.value)
}

pub fn format_name(value: u64) -> &'static str {
  FORMATS.iter().find(|f| f.value == value).map(|f| f.name).unwrap_or("UNKNOWN")
}
