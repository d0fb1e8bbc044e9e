//! In-process protocol layer: end stations that live in memory and answer commands
//! from a responder thread, the way a real AVDECC stack answers from its network thread.

use std::{
  collections::VecDeque,
  io,
  path::Path,
  sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
  thread::JoinHandle,
  time::Duration,
};

use futures::FutureExt;
use serde::Deserialize;
use thiserror::Error;
use tokio::{sync::mpsc, time::sleep};

use crate::common::*;
use crate::descriptors::{
  AudioUnit, Configuration, ConnectionStatus, Direction, Discovery, EndStation, EntityInfo, StreamPort,
};
use crate::notification::{NotificationId, NotificationRouter, Reply};
use crate::protocol::aem::{
  encode_read_descriptor_payload, make_response, split_string_reference, AudioUnitDescriptor, SamplingRatePayload,
  Status, StreamDescriptor, StreamFormatPayload, AEM_RESPONSE_HEADER_LENGTH, CMD_ENTITY_AVAILABLE,
  CMD_READ_DESCRIPTOR, CMD_SET_SAMPLING_RATE, CMD_SET_STREAM_FORMAT, DESC_AUDIO_UNIT, NO_STRING,
  STRINGS_PER_DESCRIPTOR,
};
use crate::stream_format::{encode_channel_count, DEFAULT_CHANNEL_COUNT};
use crate::thread_utils::run_future_in_new_thread;

/// Entity id the simulated entities put in the controller field of their responses.
pub const CONTROLLER_ENTITY_ID: u64 = 0x0000_0000_ffff_0001;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StreamModel {
  pub name: String,
  pub localized_description: u16,
  /// Used to build the initial format when `format` is not given.
  pub channels: Option<u8>,
  pub format: Option<u64>,
}

impl Default for StreamModel {
  fn default() -> Self {
    Self { name: String::new(), localized_description: NO_STRING, channels: None, format: None }
  }
}

impl StreamModel {
  pub fn with_channels(name: &str, channels: u8) -> Self {
    Self { name: name.to_owned(), channels: Some(channels), ..Default::default() }
  }

  pub fn initial_format(&self) -> u64 {
    self.format.unwrap_or_else(|| encode_channel_count(self.channels.unwrap_or(DEFAULT_CHANNEL_COUNT as u8)))
  }
}

/// Initial state of a simulated end station, as read from a device inventory.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StationModel {
  pub entity_id: u64,
  pub mac: u64,
  pub entity_name: String,
  pub firmware_version: String,
  pub connected: bool,
  pub entity_count: usize,
  pub configuration_count: usize,
  pub current_entity_index: u16,
  pub current_config_index: u16,
  /// Without one the station has no AUDIO_UNIT descriptor.
  pub has_audio_unit: bool,
  pub sampling_rate: u32,
  /// Advertised rates. When not empty, other rates are refused.
  pub sampling_rates: Vec<u32>,
  /// Contents of the STRINGS descriptors, seven per descriptor.
  pub strings: Vec<String>,
  pub inputs: Vec<StreamModel>,
  pub outputs: Vec<StreamModel>,
}

impl Default for StationModel {
  fn default() -> Self {
    Self {
      entity_id: 0,
      mac: 0,
      entity_name: String::new(),
      firmware_version: String::new(),
      connected: true,
      entity_count: 1,
      configuration_count: 1,
      current_entity_index: 0,
      current_config_index: 0,
      has_audio_unit: true,
      sampling_rate: 48000,
      sampling_rates: vec![],
      strings: vec![],
      inputs: vec![],
      outputs: vec![],
    }
  }
}

/// Misbehaviour applied to the next command the station processes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fault {
  Reject(Status),
  /// Never reply, the controller side times out.
  Drop,
  /// Commit this rate instead of the requested one. Other commands consume the fault unchanged.
  CoerceSamplingRate(u32),
  /// Reply with success, changing nothing, but address the response to this descriptor index.
  EchoIndex(u16),
}

/// A command as the station received it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SentCommand {
  SetSamplingRate { sampling_rate: u32 },
  SetStreamFormat { direction: Direction, stream_index: usize, format_value: u64 },
  ReadDescriptor { descriptor_type: u16, descriptor_index: u16 },
  EntityAvailable,
}

impl SentCommand {
  fn command_type(&self) -> u16 {
    match self {
      Self::SetSamplingRate { .. } => CMD_SET_SAMPLING_RATE,
      Self::SetStreamFormat { .. } => CMD_SET_STREAM_FORMAT,
      Self::ReadDescriptor { .. } => CMD_READ_DESCRIPTOR,
      Self::EntityAvailable => CMD_ENTITY_AVAILABLE,
    }
  }

  /// Payload of a response that changes nothing.
  fn echo(&self, config_index: u16) -> Vec<u8> {
    let descriptor_index = match *self {
      Self::SetStreamFormat { stream_index, .. } => stream_index as u16,
      Self::ReadDescriptor { descriptor_index, .. } => descriptor_index,
      _ => 0,
    };
    self.echo_to(config_index, descriptor_index)
  }

  fn echo_to(&self, config_index: u16, descriptor_index: u16) -> Vec<u8> {
    match *self {
      Self::SetSamplingRate { sampling_rate } => {
        SamplingRatePayload { descriptor_type: DESC_AUDIO_UNIT, descriptor_index, sampling_rate }.encode()
      }
      Self::SetStreamFormat { direction, format_value, .. } => StreamFormatPayload {
        descriptor_type: direction.descriptor_type(),
        descriptor_index,
        stream_format: format_value,
      }
      .encode(),
      Self::ReadDescriptor { descriptor_type, .. } => {
        let mut address = descriptor_type.to_be_bytes().to_vec();
        address.extend_from_slice(&descriptor_index.to_be_bytes());
        encode_read_descriptor_payload(config_index, &address)
      }
      Self::EntityAvailable => vec![],
    }
  }
}

#[derive(Debug)]
enum SimCommand {
  /// Carries the transport form of the notification id, like a real stack's correlation data.
  Execute(usize, SentCommand),
  Shutdown,
}

struct SimState {
  sampling_rate: u32,
  input_formats: Vec<u64>,
  output_formats: Vec<u64>,
  faults: VecDeque<Fault>,
  sent: Vec<SentCommand>,
}

impl SimState {
  fn new(model: &StationModel) -> Self {
    Self {
      sampling_rate: model.sampling_rate,
      input_formats: model.inputs.iter().map(StreamModel::initial_format).collect(),
      output_formats: model.outputs.iter().map(StreamModel::initial_format).collect(),
      faults: VecDeque::new(),
      sent: vec![],
    }
  }

  fn formats(&self, direction: Direction) -> &Vec<u64> {
    direction.select(&self.input_formats, &self.output_formats)
  }

  fn formats_mut(&mut self, direction: Direction) -> &mut Vec<u64> {
    match direction {
      Direction::Input => &mut self.input_formats,
      Direction::Output => &mut self.output_formats,
    }
  }

  fn describe(&self, model: &StationModel, descriptor_type: u16, descriptor_index: u16) -> Option<Vec<u8>> {
    if descriptor_type == DESC_AUDIO_UNIT {
      if !model.has_audio_unit || descriptor_index != 0 {
        return None;
      }
      return Some(
        AudioUnitDescriptor {
          descriptor_index,
          object_name: String::new(),
          localized_description: NO_STRING,
          clock_domain_index: 0,
          current_sampling_rate: self.sampling_rate,
          sampling_rates: model.sampling_rates.clone(),
        }
        .encode(),
      );
    }
    let direction = [Direction::Input, Direction::Output].into_iter().find(|d| d.descriptor_type() == descriptor_type)?;
    let stream = direction.select(&model.inputs, &model.outputs).get(descriptor_index as usize)?;
    let current_format = *self.formats(direction).get(descriptor_index as usize)?;
    Some(
      StreamDescriptor {
        descriptor_type,
        descriptor_index,
        object_name: stream.name.clone(),
        localized_description: stream.localized_description,
        clock_domain_index: 0,
        stream_flags: 0,
        current_format,
      }
      .encode(),
    )
  }

  fn apply(&mut self, model: &StationModel, command: SentCommand) -> (Status, Vec<u8>) {
    let config_index = model.current_config_index;
    match command {
      SentCommand::SetSamplingRate { sampling_rate } => {
        if !model.sampling_rates.is_empty() && !model.sampling_rates.contains(&sampling_rate) {
          return (Status::BadArguments, SentCommand::SetSamplingRate { sampling_rate: self.sampling_rate }.echo(config_index));
        }
        self.sampling_rate = sampling_rate;
        (Status::Success, command.echo(config_index))
      }
      SentCommand::SetStreamFormat { direction, stream_index, format_value } => {
        match self.formats_mut(direction).get_mut(stream_index) {
          Some(format) => {
            *format = format_value;
            (Status::Success, command.echo(config_index))
          }
          None => (Status::NoSuchDescriptor, command.echo(config_index)),
        }
      }
      SentCommand::ReadDescriptor { descriptor_type, descriptor_index } => {
        match self.describe(model, descriptor_type, descriptor_index) {
          Some(descriptor) => (Status::Success, encode_read_descriptor_payload(config_index, &descriptor)),
          None => (Status::NoSuchDescriptor, command.echo(config_index)),
        }
      }
      SentCommand::EntityAvailable => (Status::Success, vec![]),
    }
  }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared by every handle of one station: queues commands for the responder.
#[derive(Clone)]
struct Link {
  state: Arc<Mutex<SimState>>,
  commands: mpsc::UnboundedSender<SimCommand>,
}

impl Link {
  fn submit(&self, id: NotificationId, command: SentCommand) {
    lock(&self.state).sent.push(command);
    self.commands.send(SimCommand::Execute(id.to_transport(), command)).log_and_forget();
  }
}

struct Responder {
  commands_receiver: mpsc::UnboundedReceiver<SimCommand>,
  model: Arc<StationModel>,
  state: Arc<Mutex<SimState>>,
  router: NotificationRouter,
  latency: Duration,
}

impl Responder {
  async fn run(&mut self) {
    while let Some(command) = self.commands_receiver.recv().await {
      match command {
        SimCommand::Shutdown => break,
        SimCommand::Execute(token, command) => {
          if !self.latency.is_zero() {
            sleep(self.latency).await;
          }
          self.execute(NotificationId::from_transport(token), command);
        }
      }
    }
    debug!("simulated entity {:#018x} stopped", self.model.entity_id);
  }

  fn execute(&self, id: NotificationId, command: SentCommand) {
    let mut state = lock(&self.state);
    let (status, payload) = match state.faults.pop_front() {
      None => state.apply(&self.model, command),
      Some(Fault::Drop) => {
        debug!("{id}: dropping reply to {command:?}");
        return;
      }
      Some(Fault::Reject(status)) => (status, command.echo(self.model.current_config_index)),
      Some(Fault::CoerceSamplingRate(sampling_rate)) => match command {
        SentCommand::SetSamplingRate { .. } => state.apply(&self.model, SentCommand::SetSamplingRate { sampling_rate }),
        other => state.apply(&self.model, other),
      },
      Some(Fault::EchoIndex(descriptor_index)) => {
        (Status::Success, command.echo_to(self.model.current_config_index, descriptor_index))
      }
    };
    drop(state);

    let frame = make_response(self.model.entity_id, CONTROLLER_ENTITY_ID, id.0 as u16, command.command_type(), &payload);
    self.router.route(self.model.entity_id, id, Reply::new(status, frame, AEM_RESPONSE_HEADER_LENGTH));
  }
}

pub struct SimStreamPort {
  direction: Direction,
  index: usize,
  name: String,
  localized_description: u16,
  link: Link,
}

impl StreamPort for SimStreamPort {
  fn object_name(&self) -> String {
    self.name.clone()
  }
  fn localized_description(&self) -> u16 {
    self.localized_description
  }
  fn current_format(&self) -> u64 {
    lock(&self.link.state).formats(self.direction).get(self.index).copied().unwrap_or(0)
  }
  fn send_set_stream_format(&self, id: NotificationId, format_value: u64) {
    self.link.submit(id, SentCommand::SetStreamFormat { direction: self.direction, stream_index: self.index, format_value });
  }
}

pub struct SimAudioUnit {
  sampling_rates: Vec<u32>,
  link: Link,
}

impl AudioUnit for SimAudioUnit {
  fn current_sampling_rate(&self) -> u32 {
    lock(&self.link.state).sampling_rate
  }
  fn sampling_rates(&self) -> Vec<u32> {
    self.sampling_rates.clone()
  }
  fn send_set_sampling_rate(&self, id: NotificationId, sampling_rate: u32) {
    self.link.submit(id, SentCommand::SetSamplingRate { sampling_rate });
  }
}

pub struct SimConfiguration {
  audio_unit: Option<SimAudioUnit>,
  inputs: Vec<SimStreamPort>,
  outputs: Vec<SimStreamPort>,
  strings: Vec<String>,
}

impl Configuration for SimConfiguration {
  fn audio_unit(&self, index: u16) -> Option<&dyn AudioUnit> {
    match index {
      0 => self.audio_unit.as_ref().map(|u| u as &dyn AudioUnit),
      _ => None,
    }
  }
  fn stream_count(&self, direction: Direction) -> usize {
    direction.select(&self.inputs, &self.outputs).len()
  }
  fn stream(&self, direction: Direction, index: usize) -> Option<&dyn StreamPort> {
    direction.select(&self.inputs, &self.outputs).get(index).map(|p| p as &dyn StreamPort)
  }
  fn localized_string(&self, reference: u16) -> Option<String> {
    let (descriptor, index) = split_string_reference(reference)?;
    self.strings.get(descriptor as usize * STRINGS_PER_DESCRIPTOR + index as usize).cloned()
  }
}

pub struct SimulatedEndStation {
  model: Arc<StationModel>,
  configuration: SimConfiguration,
  link: Link,
  responder: Option<JoinHandle<()>>,
}

impl SimulatedEndStation {
  /// Spawns the responder thread. Replies go through `router`, a dispatcher must be
  /// registered there under the model's entity id to receive them.
  pub fn start(model: StationModel, router: NotificationRouter, latency: Duration) -> io::Result<Self> {
    let model = Arc::new(model);
    let state = Arc::new(Mutex::new(SimState::new(&model)));
    let (tx, rx) = mpsc::unbounded_channel();
    let link = Link { state: state.clone(), commands: tx };

    let ports = |direction: Direction| {
      direction
        .select(&model.inputs, &model.outputs)
        .iter()
        .enumerate()
        .map(|(index, stream)| SimStreamPort {
          direction,
          index,
          name: stream.name.clone(),
          localized_description: stream.localized_description,
          link: link.clone(),
        })
        .collect()
    };
    let configuration = SimConfiguration {
      audio_unit: model
        .has_audio_unit
        .then(|| SimAudioUnit { sampling_rates: model.sampling_rates.clone(), link: link.clone() }),
      inputs: ports(Direction::Input),
      outputs: ports(Direction::Output),
      strings: model.strings.clone(),
    };

    let mut responder = Responder { commands_receiver: rx, model: model.clone(), state, router, latency };
    let handle = run_future_in_new_thread(format!("sim {:x}", model.entity_id), move || {
      async move { responder.run().await }.boxed_local()
    })?;
    info!("simulated entity {:#018x} ({}) started", model.entity_id, model.entity_name);
    Ok(Self { model, configuration, link, responder: Some(handle) })
  }

  pub fn model(&self) -> &StationModel {
    &self.model
  }

  pub fn inject(&self, fault: Fault) {
    lock(&self.link.state).faults.push_back(fault);
  }

  /// Every command received so far, oldest first.
  pub fn sent_commands(&self) -> Vec<SentCommand> {
    lock(&self.link.state).sent.clone()
  }
}

impl Drop for SimulatedEndStation {
  fn drop(&mut self) {
    self.link.commands.send(SimCommand::Shutdown).log_and_forget();
    if let Some(handle) = self.responder.take() {
      if handle.join().is_err() {
        error!("responder of simulated entity {:#018x} panicked", self.model.entity_id);
      }
    }
  }
}

impl EndStation for SimulatedEndStation {
  fn connection_status(&self) -> ConnectionStatus {
    if self.model.connected {
      ConnectionStatus::Connected
    } else {
      ConnectionStatus::Disconnected
    }
  }
  fn entity_id(&self) -> u64 {
    self.model.entity_id
  }
  fn mac(&self) -> u64 {
    self.model.mac
  }
  fn current_entity_index(&self) -> u16 {
    self.model.current_entity_index
  }
  fn current_config_index(&self) -> u16 {
    self.model.current_config_index
  }
  fn entity_count(&self) -> usize {
    self.model.entity_count
  }
  fn entity(&self, index: u16) -> Option<EntityInfo> {
    if index as usize >= self.model.entity_count {
      return None;
    }
    Some(EntityInfo {
      entity_name: self.model.entity_name.clone(),
      firmware_version: self.model.firmware_version.clone(),
      configuration_count: self.model.configuration_count,
    })
  }
  fn configuration(&self, entity_index: u16, config_index: u16) -> Option<&dyn Configuration> {
    if entity_index as usize >= self.model.entity_count || config_index as usize >= self.model.configuration_count {
      return None;
    }
    Some(&self.configuration)
  }
  fn send_read_descriptor(&self, id: NotificationId, descriptor_type: u16, descriptor_index: u16) {
    self.link.submit(id, SentCommand::ReadDescriptor { descriptor_type, descriptor_index });
  }
  fn send_entity_available(&self, id: NotificationId) {
    self.link.submit(id, SentCommand::EntityAvailable);
  }
}

#[derive(Error, Debug)]
pub enum SimulationError {
  #[error("unable to read device inventory: {0}")]
  Io(#[from] io::Error),
  #[error("invalid device inventory: {0}")]
  Inventory(#[from] toml::de::Error),
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Inventory {
  station: Vec<StationModel>,
}

/// Discovery over simulated end stations. Stations can be added while a controller watches.
pub struct SimulatedNetwork {
  router: NotificationRouter,
  latency: Duration,
  stations: RwLock<Vec<Arc<SimulatedEndStation>>>,
}

impl SimulatedNetwork {
  pub fn new(router: NotificationRouter, latency: Duration) -> Self {
    Self { router, latency, stations: RwLock::new(vec![]) }
  }

  /// Builds a network from `[[station]]` tables.
  pub fn from_toml_str(inventory: &str, router: NotificationRouter, latency: Duration) -> Result<Self, SimulationError> {
    let inventory: Inventory = toml::from_str(inventory)?;
    let network = Self::new(router, latency);
    for model in inventory.station {
      network.add_station(model)?;
    }
    Ok(network)
  }

  pub fn load(path: impl AsRef<Path>, router: NotificationRouter, latency: Duration) -> Result<Self, SimulationError> {
    let inventory = std::fs::read_to_string(path)?;
    Self::from_toml_str(&inventory, router, latency)
  }

  pub fn add_station(&self, model: StationModel) -> io::Result<Arc<SimulatedEndStation>> {
    let station = Arc::new(SimulatedEndStation::start(model, self.router.clone(), self.latency)?);
    self.stations.write().unwrap_or_else(PoisonError::into_inner).push(station.clone());
    Ok(station)
  }

  pub fn station(&self, index: usize) -> Option<Arc<SimulatedEndStation>> {
    self.stations.read().unwrap_or_else(PoisonError::into_inner).get(index).cloned()
  }
}

impl Discovery for SimulatedNetwork {
  fn end_station_count(&self) -> usize {
    self.stations.read().unwrap_or_else(PoisonError::into_inner).len()
  }
  fn end_station(&self, index: usize) -> Option<Arc<dyn EndStation>> {
    self.station(index).map(|s| s as Arc<dyn EndStation>)
  }
}
