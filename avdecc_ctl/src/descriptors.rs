//! What this crate needs from the discovery/enumeration layer.
//!
//! Send primitives return immediately. Their outcome arrives later as a
//! [`Reply`](crate::notification::Reply) routed to the dispatcher that armed the token.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::notification::NotificationId;
use crate::protocol::aem::{DESC_STREAM_INPUT, DESC_STREAM_OUTPUT};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
  Connected,
  Disconnected,
}

impl ConnectionStatus {
  pub fn as_char(&self) -> char {
    match self {
      Self::Connected => 'C',
      Self::Disconnected => 'D',
    }
  }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
  Input,
  Output,
}

impl Direction {
  pub fn select<T>(&self, input: T, output: T) -> T {
    match self {
      Self::Input => input,
      Self::Output => output,
    }
  }

  pub fn descriptor_type(&self) -> u16 {
    self.select(DESC_STREAM_INPUT, DESC_STREAM_OUTPUT)
  }

  pub fn name(&self) -> &'static str {
    self.select("STREAM_INPUT", "STREAM_OUTPUT")
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
  #[error("no end station at index {index}, {count} known")]
  NoSuchEndStation { index: usize, count: usize },
  #[error("current entity {index} not available, end station has {count}")]
  EntityUnavailable { index: u16, count: usize },
  #[error("current configuration {index} not available, entity has {count}")]
  ConfigurationUnavailable { index: u16, count: usize },
  #[error("configuration {config_index} has no audio unit")]
  NoAudioUnit { config_index: u16 },
}

/// Entity descriptor fields the controller shows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityInfo {
  pub entity_name: String,
  pub firmware_version: String,
  pub configuration_count: usize,
}

/// Stream input or output descriptor, addressed the same way for both directions.
pub trait StreamPort {
  fn object_name(&self) -> String;
  fn localized_description(&self) -> u16;
  fn current_format(&self) -> u64;
  fn send_set_stream_format(&self, id: NotificationId, format_value: u64);
}

pub trait AudioUnit {
  fn current_sampling_rate(&self) -> u32;
  /// Rates the unit advertises. Empty when unknown.
  fn sampling_rates(&self) -> Vec<u32>;
  fn send_set_sampling_rate(&self, id: NotificationId, sampling_rate: u32);
}

pub trait Configuration {
  fn audio_unit(&self, index: u16) -> Option<&dyn AudioUnit>;
  fn stream_count(&self, direction: Direction) -> usize;
  fn stream(&self, direction: Direction, index: usize) -> Option<&dyn StreamPort>;
  /// Looks up a localized string reference in the configuration's STRINGS descriptors.
  fn localized_string(&self, reference: u16) -> Option<String>;
}

pub trait EndStation: Send + Sync {
  fn connection_status(&self) -> ConnectionStatus;
  fn entity_id(&self) -> u64;
  fn mac(&self) -> u64;
  fn current_entity_index(&self) -> u16;
  fn current_config_index(&self) -> u16;
  fn entity_count(&self) -> usize;
  fn entity(&self, index: u16) -> Option<EntityInfo>;
  fn configuration(&self, entity_index: u16, config_index: u16) -> Option<&dyn Configuration>;
  fn send_read_descriptor(&self, id: NotificationId, descriptor_type: u16, descriptor_index: u16);
  fn send_entity_available(&self, id: NotificationId);
}

pub trait Discovery {
  fn end_station_count(&self) -> usize;
  fn end_station(&self, index: usize) -> Option<Arc<dyn EndStation>>;
}

/// Entity and configuration the end station currently has selected.
pub fn current_configuration(station: &dyn EndStation) -> Result<(EntityInfo, &dyn Configuration), DiscoveryError> {
  let entity_index = station.current_entity_index();
  let entity_count = station.entity_count();
  let entity = match station.entity(entity_index) {
    Some(entity) if (entity_index as usize) < entity_count => entity,
    _ => return Err(DiscoveryError::EntityUnavailable { index: entity_index, count: entity_count }),
  };
  let config_index = station.current_config_index();
  if config_index as usize >= entity.configuration_count {
    return Err(DiscoveryError::ConfigurationUnavailable { index: config_index, count: entity.configuration_count });
  }
  match station.configuration(entity_index, config_index) {
    Some(configuration) => Ok((entity, configuration)),
    None => Err(DiscoveryError::ConfigurationUnavailable { index: config_index, count: entity.configuration_count }),
  }
}
