//! Issues one command at a time against an end station and waits for its outcome.

use std::{fmt, time::Duration};

use thiserror::Error;

use crate::common::*;
use crate::descriptors::{current_configuration, Direction, DiscoveryError, EndStation};
use crate::notification::{NotificationId, NotificationTracker, Notifier, SequenceError};
use crate::protocol::aem::{
  descriptor_address, descriptor_name, split_read_descriptor_payload, SamplingRatePayload, Status, StreamFormatPayload, DESC_AUDIO_UNIT,
  READ_DESCRIPTOR_HEADER_LENGTH,
};
use crate::response_frame::{FrameError, FrameKind, ResponseFrame};
use crate::stream_format::{format_name, format_value};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandKind {
  SetSamplingRate { sampling_rate: u32 },
  SetStreamFormat { direction: Direction, stream_index: usize, format_index: u8 },
  ReadDescriptor { descriptor_type: u16, descriptor_index: u16 },
  EntityAvailable,
}

impl CommandKind {
  fn frame_kind(&self) -> FrameKind {
    match self {
      Self::ReadDescriptor { .. } => FrameKind::Descriptor,
      _ => FrameKind::Command,
    }
  }
}

impl fmt::Display for CommandKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::SetSamplingRate { sampling_rate } => write!(f, "SET_SAMPLING_RATE {sampling_rate}"),
      Self::SetStreamFormat { direction, stream_index, format_index } => {
        write!(f, "SET_STREAM_FORMAT {} {stream_index} format {format_index}", direction.name())
      }
      Self::ReadDescriptor { descriptor_type, descriptor_index } => match descriptor_name(*descriptor_type) {
        Some(name) => write!(f, "READ_DESCRIPTOR {name} {descriptor_index}"),
        None => write!(f, "READ_DESCRIPTOR {descriptor_type:#06x} {descriptor_index}"),
      },
      Self::EntityAvailable => write!(f, "ENTITY_AVAILABLE"),
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
  #[error("{command}: {status}")]
  Status { command: CommandKind, status: Status },
  #[error("{command}: {source}")]
  Frame { command: CommandKind, #[source] source: FrameError },
  #[error("{command}: malformed response {}", hex::encode(.payload))]
  MalformedResponse { command: CommandKind, payload: Vec<u8> },
  #[error("{command}: no such descriptor in the current configuration")]
  NoSuchDescriptor { command: CommandKind },
  #[error("{command}: no stream format with this index")]
  NoSuchFormat { command: CommandKind },
  #[error("{command}: {source}")]
  Discovery { command: CommandKind, #[source] source: DiscoveryError },
  #[error("{command}: {source}")]
  Sequence { command: CommandKind, #[source] source: SequenceError },
}

impl CommandError {
  pub fn command(&self) -> CommandKind {
    match self {
      Self::Status { command, .. }
      | Self::Frame { command, .. }
      | Self::MalformedResponse { command, .. }
      | Self::NoSuchDescriptor { command }
      | Self::NoSuchFormat { command }
      | Self::Discovery { command, .. }
      | Self::Sequence { command, .. } => *command,
    }
  }

  /// Status reported by the entity or by the wait, if the command got that far.
  pub fn status(&self) -> Option<Status> {
    match self {
      Self::Status { status, .. } => Some(*status),
      _ => None,
    }
  }

  /// Sequence errors mean the single-flight discipline was broken.
  pub fn is_fatal(&self) -> bool {
    matches!(self, Self::Sequence { .. })
  }
}

/// One per end station. Owns the station's tracker and response frame.
pub struct CommandDispatcher {
  tracker: NotificationTracker,
  frame: ResponseFrame,
}

impl CommandDispatcher {
  pub fn new(timeout: Duration) -> Self {
    Self { tracker: NotificationTracker::new(timeout), frame: ResponseFrame::new() }
  }

  /// Handle to register with the protocol layer for this station's replies.
  pub fn notifier(&self) -> Notifier {
    self.tracker.notifier()
  }

  pub fn tracker(&self) -> &NotificationTracker {
    &self.tracker
  }

  pub fn response_frame(&self) -> &ResponseFrame {
    &self.frame
  }

  /// Arm, send, wait. On success the reply payload is staged in the response frame and its
  /// unread part returned. A reply with a failed status leaves the frame as it was.
  fn execute(&mut self, command: CommandKind, send: impl FnOnce(NotificationId)) -> Result<&[u8], CommandError> {
    let id = self.tracker.next_id();
    self.tracker.arm(id).map_err(|source| CommandError::Sequence { command, source })?;
    debug!("{id}: sending {command}");
    send(id);
    let reply = self.tracker.await_result().map_err(|source| CommandError::Sequence { command, source })?;
    if !reply.status.is_success() {
      return Err(CommandError::Status { command, status: reply.status });
    }
    let kind = command.frame_kind();
    let size = reply.frame.len().saturating_sub(reply.payload_pos);
    self
      .frame
      .replace(kind, &reply.frame, reply.payload_pos, size)
      .map_err(|source| CommandError::Frame { command, source })?;
    Ok(self.frame.remaining(kind))
  }

  pub fn set_sampling_rate(&mut self, station: &dyn EndStation, sampling_rate: u32) -> Result<u32, CommandError> {
    let command = CommandKind::SetSamplingRate { sampling_rate };
    let (_, configuration) = current_configuration(station).map_err(|source| CommandError::Discovery { command, source })?;
    let audio_unit = configuration.audio_unit(0).ok_or(CommandError::NoSuchDescriptor { command })?;
    let advertised = audio_unit.sampling_rates();
    if !advertised.is_empty() && !advertised.contains(&sampling_rate) {
      warn!("{sampling_rate} Hz is not among the rates advertised by entity {:#018x}", station.entity_id());
    }

    let payload = self.execute(command, |id| audio_unit.send_set_sampling_rate(id, sampling_rate))?;
    let committed = match SamplingRatePayload::parse(payload) {
      Some(p) if p.descriptor_type == DESC_AUDIO_UNIT && p.descriptor_index == 0 => p.sampling_rate,
      _ => return Err(CommandError::MalformedResponse { command, payload: payload.to_vec() }),
    };
    info!("sampling rate: {committed}");
    Ok(committed)
  }

  pub fn set_stream_format(
    &mut self,
    station: &dyn EndStation,
    direction: Direction,
    stream_index: usize,
    format_index: u8,
  ) -> Result<u64, CommandError> {
    let command = CommandKind::SetStreamFormat { direction, stream_index, format_index };
    let value = format_value(format_index).ok_or(CommandError::NoSuchFormat { command })?;
    let (_, configuration) = current_configuration(station).map_err(|source| CommandError::Discovery { command, source })?;
    let port = configuration.stream(direction, stream_index).ok_or(CommandError::NoSuchDescriptor { command })?;

    let payload = self.execute(command, |id| port.send_set_stream_format(id, value))?;
    let committed = match StreamFormatPayload::parse(payload) {
      Some(p) if p.descriptor_type == direction.descriptor_type() && p.descriptor_index as usize == stream_index => p.stream_format,
      _ => return Err(CommandError::MalformedResponse { command, payload: payload.to_vec() }),
    };
    if format_name(committed) == "UNKNOWN" {
      info!("stream format: {committed:#018x}");
    } else {
      info!("stream format: {}", format_name(committed));
    }
    Ok(committed)
  }

  /// Reads a descriptor of the current configuration. The bytes stay in the
  /// descriptor buffer of the response frame until the next read.
  pub fn read_descriptor(
    &mut self,
    station: &dyn EndStation,
    descriptor_type: u16,
    descriptor_index: u16,
  ) -> Result<&[u8], CommandError> {
    let command = CommandKind::ReadDescriptor { descriptor_type, descriptor_index };
    let payload = self.execute(command, |id| station.send_read_descriptor(id, descriptor_type, descriptor_index))?;
    match split_read_descriptor_payload(payload) {
      Some((_, descriptor)) if descriptor_address(descriptor) == Some((descriptor_type, descriptor_index)) => {}
      _ => return Err(CommandError::MalformedResponse { command, payload: payload.to_vec() }),
    }
    self.frame.advance(FrameKind::Descriptor, READ_DESCRIPTOR_HEADER_LENGTH);
    Ok(self.frame.remaining(FrameKind::Descriptor))
  }

  pub fn entity_available(&mut self, station: &dyn EndStation) -> Result<(), CommandError> {
    self.execute(CommandKind::EntityAvailable, |id| station.send_entity_available(id)).map(|_| ())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::notification::NotificationRouter;
  use crate::protocol::aem::{AudioUnitDescriptor, DESC_STREAM_INPUT};
  use crate::simulated::{Fault, SentCommand, SimulatedEndStation, StationModel, StreamModel};

  fn setup(model: StationModel, timeout: Duration) -> (SimulatedEndStation, CommandDispatcher) {
    let router = NotificationRouter::new();
    let dispatcher = CommandDispatcher::new(timeout);
    router.register(model.entity_id, dispatcher.notifier());
    (SimulatedEndStation::start(model, router, Duration::from_millis(1)).unwrap(), dispatcher)
  }

  fn model() -> StationModel {
    StationModel {
      entity_id: 0x0011_22ff_fe33_4455,
      sampling_rate: 44100,
      sampling_rates: vec![44100, 48000, 96000],
      inputs: vec![StreamModel::with_channels("in", 2)],
      outputs: vec![StreamModel::with_channels("out", 8)],
      ..Default::default()
    }
  }

  #[test]
  fn test_sampling_rate_committed_from_reply() {
    let (sim, mut dispatcher) = setup(model(), Duration::from_secs(2));
    assert_eq!(dispatcher.set_sampling_rate(&sim, 48000), Ok(48000));
    assert_eq!(sim.sent_commands(), vec![SentCommand::SetSamplingRate { sampling_rate: 48000 }]);
    let staged = dispatcher.response_frame().data(FrameKind::Command);
    assert_eq!(SamplingRatePayload::parse(staged).unwrap().sampling_rate, 48000);

    sim.inject(Fault::CoerceSamplingRate(96000));
    assert_eq!(dispatcher.set_sampling_rate(&sim, 44100), Ok(96000));
  }

  #[test]
  fn test_rejected_command_keeps_frame() {
    let (sim, mut dispatcher) = setup(model(), Duration::from_secs(2));
    dispatcher.set_sampling_rate(&sim, 48000).unwrap();
    let before = dispatcher.response_frame().data(FrameKind::Command).to_vec();

    sim.inject(Fault::Reject(Status::EntityLocked));
    let err = dispatcher.set_sampling_rate(&sim, 96000).unwrap_err();
    assert_eq!(err.status(), Some(Status::EntityLocked));
    assert_eq!(err.command(), CommandKind::SetSamplingRate { sampling_rate: 96000 });
    assert!(!err.is_fatal());
    assert_eq!(dispatcher.response_frame().data(FrameKind::Command), &before[..]);

    // not advertised: still sent, refused by the entity
    let err = dispatcher.set_sampling_rate(&sim, 32000).unwrap_err();
    assert_eq!(err.status(), Some(Status::BadArguments));
    assert_eq!(sim.sent_commands().len(), 3);
  }

  #[test]
  fn test_timeout_then_next_command() {
    let (sim, mut dispatcher) = setup(model(), Duration::from_millis(100));
    sim.inject(Fault::Drop);
    let err = dispatcher.set_sampling_rate(&sim, 48000).unwrap_err();
    assert_eq!(err.status(), Some(Status::Timeout));
    assert_eq!(dispatcher.set_sampling_rate(&sim, 96000), Ok(96000));
  }

  #[test]
  fn test_stream_format() {
    let (sim, mut dispatcher) = setup(model(), Duration::from_secs(2));
    let value = format_value(1).unwrap();
    assert_eq!(dispatcher.set_stream_format(&sim, Direction::Input, 0, 1), Ok(value));
    assert_eq!(
      sim.sent_commands(),
      vec![SentCommand::SetStreamFormat { direction: Direction::Input, stream_index: 0, format_value: value }]
    );

    let err = dispatcher.set_stream_format(&sim, Direction::Output, 0, 8).unwrap_err();
    assert!(matches!(err, CommandError::NoSuchFormat { .. }));
    let err = dispatcher.set_stream_format(&sim, Direction::Output, 1, 3).unwrap_err();
    assert!(matches!(err, CommandError::NoSuchDescriptor { .. }));
    assert_eq!(sim.sent_commands().len(), 1);
  }

  #[test]
  fn test_read_descriptor_and_availability() {
    let (sim, mut dispatcher) = setup(model(), Duration::from_secs(2));
    dispatcher.entity_available(&sim).unwrap();
    let bytes = dispatcher.read_descriptor(&sim, DESC_AUDIO_UNIT, 0).unwrap();
    let unit = AudioUnitDescriptor::parse(bytes).unwrap();
    assert_eq!(unit.current_sampling_rate, 44100);
    assert_eq!(unit.sampling_rates, vec![44100, 48000, 96000]);
    assert_eq!(dispatcher.response_frame().read_offset(FrameKind::Descriptor), READ_DESCRIPTOR_HEADER_LENGTH);

    let err = dispatcher.read_descriptor(&sim, DESC_STREAM_INPUT, 4).unwrap_err();
    assert_eq!(err.status(), Some(Status::NoSuchDescriptor));
  }

  #[test]
  fn test_reply_for_another_descriptor_is_malformed() {
    let (sim, mut dispatcher) = setup(model(), Duration::from_secs(2));

    sim.inject(Fault::EchoIndex(1));
    let err = dispatcher.set_sampling_rate(&sim, 48000).unwrap_err();
    assert_eq!(
      err,
      CommandError::MalformedResponse {
        command: CommandKind::SetSamplingRate { sampling_rate: 48000 },
        payload: vec![0, 2, 0, 1, 0, 0, 0xbb, 0x80],
      }
    );
    assert!(!err.is_fatal());

    sim.inject(Fault::EchoIndex(9));
    let err = dispatcher.set_stream_format(&sim, Direction::Input, 0, 1).unwrap_err();
    assert!(matches!(err, CommandError::MalformedResponse { command: CommandKind::SetStreamFormat { stream_index: 0, .. }, .. }));

    sim.inject(Fault::EchoIndex(9));
    let err = dispatcher.read_descriptor(&sim, DESC_STREAM_INPUT, 0).unwrap_err();
    assert_eq!(
      err,
      CommandError::MalformedResponse {
        command: CommandKind::ReadDescriptor { descriptor_type: DESC_STREAM_INPUT, descriptor_index: 0 },
        payload: vec![0, 0, 0, 0, 0, 5, 0, 9],
      }
    );

    // nothing was committed, the next well-addressed reply goes through
    assert_eq!(sim.configuration(0, 0).unwrap().audio_unit(0).unwrap().current_sampling_rate(), 44100);
    assert_eq!(dispatcher.set_sampling_rate(&sim, 48000), Ok(48000));
    assert_eq!(sim.sent_commands().len(), 4);
  }

  #[test]
  fn test_command_names() {
    let command = CommandKind::ReadDescriptor { descriptor_type: DESC_STREAM_INPUT, descriptor_index: 3 };
    assert_eq!(command.to_string(), "READ_DESCRIPTOR STREAM_INPUT 3");
    let command = CommandKind::ReadDescriptor { descriptor_type: 0x0042, descriptor_index: 0 };
    assert_eq!(command.to_string(), "READ_DESCRIPTOR 0x0042 0");
  }

  #[test]
  fn test_unavailable_configuration() {
    let (sim, mut dispatcher) = setup(StationModel { current_config_index: 2, ..model() }, Duration::from_secs(2));
    let err = dispatcher.set_sampling_rate(&sim, 48000).unwrap_err();
    assert!(matches!(err, CommandError::Discovery { source: DiscoveryError::ConfigurationUnavailable { index: 2, count: 1 }, .. }));
    assert!(sim.sent_commands().is_empty());
  }

  #[test]
  fn test_sequence_error_is_fatal() {
    let (sim, mut dispatcher) = setup(model(), Duration::from_secs(2));
    let stray = dispatcher.tracker().next_id();
    dispatcher.tracker().arm(stray).unwrap();
    let err = dispatcher.entity_available(&sim).unwrap_err();
    assert!(err.is_fatal());
    assert!(sim.sent_commands().is_empty());
  }
}
