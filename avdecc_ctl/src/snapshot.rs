use itertools::Itertools;
use serde::Serialize;

use crate::descriptors::{current_configuration, Configuration, ConnectionStatus, Direction, DiscoveryError, EndStation};
use crate::protocol::aem::string_reference;
use crate::stream_format::decode_channel_count;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
  pub name: String,
  pub channel_count: u32,
  pub format: u64,
}

impl StreamInfo {
  fn capture(configuration: &dyn Configuration, direction: Direction, index: usize) -> Option<Self> {
    let port = configuration.stream(direction, index)?;
    let object_name = port.object_name();
    let name = if object_name.is_empty() {
      configuration.localized_string(port.localized_description()).unwrap_or_default()
    } else {
      object_name
    };
    let format = port.current_format();
    Some(Self { name, channel_count: decode_channel_count(format), format })
  }
}

/// Live state of one end station, valid for a single reconciliation pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EndStationSnapshot {
  pub connection_status: ConnectionStatus,
  pub entity_id: u64,
  pub mac: u64,
  pub entity_index: u16,
  pub config_index: u16,
  pub entity_name: String,
  pub default_name: String,
  pub firmware_version: String,
  pub sampling_rate: u32,
  pub sampling_rates: Vec<u32>,
  pub input_streams: Vec<StreamInfo>,
  pub output_streams: Vec<StreamInfo>,
}

impl EndStationSnapshot {
  pub fn capture(station: &dyn EndStation) -> Result<Self, DiscoveryError> {
    let (entity, configuration) = current_configuration(station)?;
    let unit = configuration.audio_unit(0).ok_or(DiscoveryError::NoAudioUnit { config_index: station.current_config_index() })?;
    let (sampling_rate, sampling_rates) = (unit.current_sampling_rate(), unit.sampling_rates());
    let streams = |direction| {
      (0..configuration.stream_count(direction))
        .filter_map(|i| StreamInfo::capture(configuration, direction, i))
        .collect_vec()
    };
    Ok(Self {
      connection_status: station.connection_status(),
      entity_id: station.entity_id(),
      mac: station.mac(),
      entity_index: station.current_entity_index(),
      config_index: station.current_config_index(),
      entity_name: entity.entity_name,
      default_name: configuration.localized_string(string_reference(0, 1)).unwrap_or_default(),
      firmware_version: entity.firmware_version,
      sampling_rate,
      sampling_rates,
      input_streams: streams(Direction::Input),
      output_streams: streams(Direction::Output),
    })
  }

  pub fn streams(&self, direction: Direction) -> &[StreamInfo] {
    direction.select(&self.input_streams, &self.output_streams)
  }
}

/// One row of the end station list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EndStationSummary {
  pub connection_status: ConnectionStatus,
  pub entity_name: String,
  pub entity_id: u64,
  pub firmware_version: String,
  pub mac: u64,
}

impl EndStationSummary {
  pub fn capture(station: &dyn EndStation) -> Self {
    let entity = if station.entity_count() > 0 {
      station.entity(station.current_entity_index())
    } else {
      None
    };
    let (entity_name, firmware_version) = match entity {
      Some(e) => (e.entity_name, e.firmware_version),
      None => (String::new(), String::new()),
    };
    Self {
      connection_status: station.connection_status(),
      entity_name,
      entity_id: station.entity_id(),
      firmware_version,
      mac: station.mac(),
    }
  }
}
