//! Brings an end station's live configuration in line with a desired one, sending
//! only the commands needed for the fields that differ.

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use thiserror::Error;

use crate::common::*;
use crate::descriptors::{Direction, DiscoveryError, EndStation};
use crate::dispatcher::{CommandDispatcher, CommandError};
use crate::notification::SequenceError;
use crate::snapshot::EndStationSnapshot;
use crate::stream_format;

/// Target values of one edit session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredConfig {
  pub sampling_rate: u32,
  pub input_channels: Vec<u32>,
  pub output_channels: Vec<u32>,
}

impl DesiredConfig {
  /// Starts an edit session from the live values.
  ///
  /// Channel counts are what the live format decodes to, which is 8 for every value of the
  /// stream format table. A stream just set to 1 or 2 channels therefore reads back as 8,
  /// and asking for 1 or 2 again sends the command again.
  pub fn from_snapshot(snapshot: &EndStationSnapshot) -> Self {
    let channels = |direction| snapshot.streams(direction).iter().map(|s| s.channel_count).collect();
    Self {
      sampling_rate: snapshot.sampling_rate,
      input_channels: channels(Direction::Input),
      output_channels: channels(Direction::Output),
    }
  }

  pub fn set_sampling_rate(&mut self, sampling_rate: u32) -> &mut Self {
    self.sampling_rate = sampling_rate;
    self
  }

  /// Grows the per-stream list if needed; entries in between keep channel count 0,
  /// which never matches a live stream and has no format.
  pub fn set_channel_count(&mut self, direction: Direction, stream_index: usize, channel_count: u32) -> &mut Self {
    let channels = self.channels_mut(direction);
    if channels.len() <= stream_index {
      channels.resize(stream_index + 1, 0);
    }
    channels[stream_index] = channel_count;
    self
  }

  pub fn channels(&self, direction: Direction) -> &[u32] {
    direction.select(&self.input_channels, &self.output_channels)
  }

  fn channels_mut(&mut self, direction: Direction) -> &mut Vec<u32> {
    match direction {
      Direction::Input => &mut self.input_channels,
      Direction::Output => &mut self.output_channels,
    }
  }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Discrepancy {
  SamplingRate { live: u32, desired: u32 },
  StreamChannels { direction: Direction, stream_index: usize, live: u32, desired: u32 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Committed {
  SamplingRate(u32),
  StreamFormat(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
  Applied { discrepancy: Discrepancy, committed: Committed },
  /// No stream format for the desired channel count, nothing was sent.
  NoMatchingFormat { discrepancy: Discrepancy },
  Failed { discrepancy: Discrepancy, error: CommandError },
  /// The pass was cancelled before this discrepancy was attempted.
  Abandoned { discrepancy: Discrepancy },
}

impl Outcome {
  pub fn discrepancy(&self) -> &Discrepancy {
    match self {
      Self::Applied { discrepancy, .. }
      | Self::NoMatchingFormat { discrepancy }
      | Self::Failed { discrepancy, .. }
      | Self::Abandoned { discrepancy } => discrepancy,
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
  #[error(transparent)]
  Discovery(#[from] DiscoveryError),
  #[error("command sequencing broken: {0}")]
  Sequence(#[from] SequenceError),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
  Idle,
  Snapshotting,
  Diffing,
  Applying,
  Done,
}

/// Stops a running pass between two commands. A cancel covers the pass that is running,
/// or the next one if none is; the reconciler clears it when that pass ends.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
  pub fn cancel(&self) {
    self.0.store(true, Ordering::Release);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::Acquire)
  }

  fn clear(&self) {
    self.0.store(false, Ordering::Release);
  }
}

pub struct ConfigReconciler {
  phase: Phase,
  cancel: CancelHandle,
}

impl Default for ConfigReconciler {
  fn default() -> Self {
    Self::new()
  }
}

impl ConfigReconciler {
  pub fn new() -> Self {
    Self { phase: Phase::Idle, cancel: CancelHandle::default() }
  }

  pub fn phase(&self) -> Phase {
    self.phase
  }

  pub fn cancel_handle(&self) -> CancelHandle {
    self.cancel.clone()
  }

  fn enter(&mut self, phase: Phase) {
    trace!("reconciler: {:?} -> {phase:?}", self.phase);
    if matches!(phase, Phase::Idle | Phase::Done) {
      self.cancel.clear();
    }
    self.phase = phase;
  }

  /// Rate first, then inputs, then outputs, streams in index order. Strict equality.
  pub fn diff(snapshot: &EndStationSnapshot, desired: &DesiredConfig) -> Vec<Discrepancy> {
    let mut discrepancies = vec![];
    if snapshot.sampling_rate != desired.sampling_rate {
      discrepancies.push(Discrepancy::SamplingRate { live: snapshot.sampling_rate, desired: desired.sampling_rate });
    }
    for direction in [Direction::Input, Direction::Output] {
      let live = snapshot.streams(direction);
      let wanted = desired.channels(direction);
      if wanted.len() > live.len() {
        warn!("ignoring desired channel counts for {} {}.., end station has only {}", direction.name(), live.len(), live.len());
      }
      for (stream_index, (stream, &channels)) in live.iter().zip(wanted).enumerate() {
        if stream.channel_count != channels {
          discrepancies.push(Discrepancy::StreamChannels {
            direction,
            stream_index,
            live: stream.channel_count,
            desired: channels,
          });
        }
      }
    }
    discrepancies
  }

  /// One full pass. Command failures are recorded and the pass goes on; only discovery
  /// and sequencing problems end it early.
  pub fn reconcile(
    &mut self,
    dispatcher: &mut CommandDispatcher,
    station: &dyn EndStation,
    desired: &DesiredConfig,
  ) -> Result<Vec<Outcome>, ReconcileError> {
    self.enter(Phase::Snapshotting);
    let snapshot = match EndStationSnapshot::capture(station) {
      Ok(s) => s,
      Err(e) => {
        self.enter(Phase::Idle);
        return Err(e.into());
      }
    };

    self.enter(Phase::Diffing);
    let discrepancies = Self::diff(&snapshot, desired);
    debug!("entity {:#018x}: {} discrepancies", snapshot.entity_id, discrepancies.len());

    self.enter(Phase::Applying);
    let mut outcomes = Vec::with_capacity(discrepancies.len());
    for discrepancy in discrepancies {
      if self.cancel.is_cancelled() {
        outcomes.push(Outcome::Abandoned { discrepancy });
        continue;
      }
      let outcome = match self.apply(dispatcher, station, desired, discrepancy) {
        Ok(outcome) => outcome,
        Err(e) => {
          self.enter(Phase::Idle);
          return Err(e);
        }
      };
      if let Outcome::Failed { error, .. } = &outcome {
        warn!("{discrepancy:?} not applied: {error}");
      }
      outcomes.push(outcome);
    }

    self.enter(Phase::Done);
    Ok(outcomes)
  }

  fn apply(
    &self,
    dispatcher: &mut CommandDispatcher,
    station: &dyn EndStation,
    desired: &DesiredConfig,
    discrepancy: Discrepancy,
  ) -> Result<Outcome, ReconcileError> {
    let result = match discrepancy {
      Discrepancy::SamplingRate { desired: rate, .. } => {
        dispatcher.set_sampling_rate(station, rate).map(Committed::SamplingRate)
      }
      Discrepancy::StreamChannels { direction, stream_index, desired: channels, .. } => {
        let format_index = match stream_format::resolve(channels, desired.sampling_rate) {
          Some(index) => index,
          None => {
            info!("no stream format for {channels} channels at {} Hz, skipping {} {stream_index}", desired.sampling_rate, direction.name());
            return Ok(Outcome::NoMatchingFormat { discrepancy });
          }
        };
        dispatcher.set_stream_format(station, direction, stream_index, format_index).map(Committed::StreamFormat)
      }
    };
    match result {
      Ok(committed) => Ok(Outcome::Applied { discrepancy, committed }),
      Err(CommandError::Sequence { source, .. }) => Err(ReconcileError::Sequence(source)),
      Err(error) => Ok(Outcome::Failed { discrepancy, error }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  use crate::notification::NotificationRouter;
  use crate::protocol::aem::Status;
  use crate::simulated::{Fault, SentCommand, SimulatedEndStation, StationModel, StreamModel};

  fn setup(model: StationModel) -> (SimulatedEndStation, CommandDispatcher) {
    setup_with_latency(model, Duration::ZERO)
  }

  fn setup_with_latency(model: StationModel, latency: Duration) -> (SimulatedEndStation, CommandDispatcher) {
    let router = NotificationRouter::new();
    let dispatcher = CommandDispatcher::new(Duration::from_secs(2));
    router.register(model.entity_id, dispatcher.notifier());
    (SimulatedEndStation::start(model, router, latency).unwrap(), dispatcher)
  }

  fn model(sampling_rate: u32, inputs: &[u8], outputs: &[u8]) -> StationModel {
    let streams = |channels: &[u8]| channels.iter().map(|&c| StreamModel::with_channels("", c)).collect();
    StationModel {
      entity_id: 0x0001_f2ff_fe00_0042,
      sampling_rate,
      inputs: streams(inputs),
      outputs: streams(outputs),
      ..Default::default()
    }
  }

  fn desired(sampling_rate: u32, inputs: &[u32], outputs: &[u32]) -> DesiredConfig {
    DesiredConfig { sampling_rate, input_channels: inputs.to_vec(), output_channels: outputs.to_vec() }
  }

  #[test]
  fn test_identical_config_sends_nothing() {
    let (sim, mut dispatcher) = setup(model(48000, &[2, 8], &[1]));
    let snapshot = EndStationSnapshot::capture(&sim).unwrap();
    let mut reconciler = ConfigReconciler::new();
    let outcomes = reconciler.reconcile(&mut dispatcher, &sim, &DesiredConfig::from_snapshot(&snapshot)).unwrap();
    assert!(outcomes.is_empty());
    assert!(sim.sent_commands().is_empty());
    assert_eq!(reconciler.phase(), Phase::Done);
  }

  #[test]
  fn test_rate_only() {
    let (sim, mut dispatcher) = setup(model(44100, &[2], &[]));
    let outcomes = ConfigReconciler::new().reconcile(&mut dispatcher, &sim, &desired(48000, &[2], &[])).unwrap();
    assert_eq!(
      outcomes,
      vec![Outcome::Applied {
        discrepancy: Discrepancy::SamplingRate { live: 44100, desired: 48000 },
        committed: Committed::SamplingRate(48000),
      }]
    );
    assert_eq!(sim.sent_commands(), vec![SentCommand::SetSamplingRate { sampling_rate: 48000 }]);
  }

  #[test]
  fn test_channel_count_without_format() {
    let (sim, mut dispatcher) = setup(model(48000, &[2], &[]));
    let outcomes = ConfigReconciler::new().reconcile(&mut dispatcher, &sim, &desired(48000, &[3], &[])).unwrap();
    assert_eq!(
      outcomes,
      vec![Outcome::NoMatchingFormat {
        discrepancy: Discrepancy::StreamChannels { direction: Direction::Input, stream_index: 0, live: 2, desired: 3 },
      }]
    );
    assert!(sim.sent_commands().is_empty());
  }

  #[test]
  fn test_single_stream_change() {
    let (sim, mut dispatcher) = setup(model(48000, &[2, 8], &[]));
    let outcomes = ConfigReconciler::new().reconcile(&mut dispatcher, &sim, &desired(48000, &[1, 8], &[])).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(
      outcomes[0],
      Outcome::Applied {
        discrepancy: Discrepancy::StreamChannels { direction: Direction::Input, stream_index: 0, live: 2, desired: 1 },
        committed: Committed::StreamFormat(0x00a0_0201_4000_0100),
      }
    );
    assert_eq!(
      sim.sent_commands(),
      vec![SentCommand::SetStreamFormat { direction: Direction::Input, stream_index: 0, format_value: 0x00a0_0201_4000_0100 }]
    );
  }

  #[test]
  fn test_order_and_rate_row() {
    let (sim, mut dispatcher) = setup(model(48000, &[2], &[2, 2]));
    let outcomes = ConfigReconciler::new().reconcile(&mut dispatcher, &sim, &desired(96000, &[1], &[2, 8])).unwrap();
    let discrepancies = outcomes.iter().map(|o| *o.discrepancy()).collect::<Vec<_>>();
    assert_eq!(
      discrepancies,
      vec![
        Discrepancy::SamplingRate { live: 48000, desired: 96000 },
        Discrepancy::StreamChannels { direction: Direction::Input, stream_index: 0, live: 2, desired: 1 },
        Discrepancy::StreamChannels { direction: Direction::Output, stream_index: 1, live: 2, desired: 8 },
      ]
    );
    // formats are picked for the desired rate
    assert_eq!(
      sim.sent_commands()[1..],
      [
        SentCommand::SetStreamFormat { direction: Direction::Input, stream_index: 0, format_value: 0x00a0_0401_4000_0100 },
        SentCommand::SetStreamFormat { direction: Direction::Output, stream_index: 1, format_value: 0x00a0_0408_4000_0800 },
      ]
    );
  }

  #[test]
  fn test_failure_does_not_stop_pass() {
    let (sim, mut dispatcher) = setup(model(44100, &[2], &[]));
    sim.inject(Fault::Reject(Status::EntityLocked));
    let outcomes = ConfigReconciler::new().reconcile(&mut dispatcher, &sim, &desired(48000, &[1], &[])).unwrap();
    assert_eq!(outcomes.len(), 2);
    match &outcomes[0] {
      Outcome::Failed { error, .. } => assert_eq!(error.status(), Some(Status::EntityLocked)),
      other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(outcomes[1], Outcome::Applied { committed: Committed::StreamFormat(_), .. }));
    assert_eq!(sim.sent_commands().len(), 2);
  }

  #[test]
  fn test_cancelled_pass_abandons_everything() {
    let (sim, mut dispatcher) = setup(model(44100, &[2], &[2]));
    let mut reconciler = ConfigReconciler::new();
    reconciler.cancel_handle().cancel();
    let outcomes = reconciler.reconcile(&mut dispatcher, &sim, &desired(48000, &[1], &[1])).unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| matches!(o, Outcome::Abandoned { .. })));
    assert!(sim.sent_commands().is_empty());

    // the cancel ended with that pass
    assert!(!reconciler.cancel_handle().is_cancelled());
    let outcomes = reconciler.reconcile(&mut dispatcher, &sim, &desired(48000, &[1], &[1])).unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| matches!(o, Outcome::Applied { .. })));
    assert_eq!(sim.sent_commands().len(), 3);
  }

  #[test]
  fn test_cancel_during_pass() {
    let (sim, mut dispatcher) = setup_with_latency(model(44100, &[2], &[2]), Duration::from_millis(300));
    let mut reconciler = ConfigReconciler::new();
    let cancel = reconciler.cancel_handle();
    let canceller = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(100));
      cancel.cancel();
    });
    let outcomes = reconciler.reconcile(&mut dispatcher, &sim, &desired(48000, &[1], &[1])).unwrap();
    canceller.join().unwrap();

    // the command in flight completes, the rest is not attempted
    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[0], Outcome::Applied { committed: Committed::SamplingRate(48000), .. }));
    assert!(matches!(outcomes[1], Outcome::Abandoned { .. }));
    assert!(matches!(outcomes[2], Outcome::Abandoned { .. }));
    assert_eq!(sim.sent_commands(), vec![SentCommand::SetSamplingRate { sampling_rate: 48000 }]);
    assert_eq!(reconciler.phase(), Phase::Done);

    let outcomes = reconciler.reconcile(&mut dispatcher, &sim, &desired(48000, &[1], &[1])).unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| matches!(o, Outcome::Applied { committed: Committed::StreamFormat(_), .. })));
    assert_eq!(sim.sent_commands().len(), 3);
  }

  #[test]
  fn test_small_channel_counts_read_back_as_eight() {
    let (sim, mut dispatcher) = setup(model(48000, &[2], &[]));
    let mut reconciler = ConfigReconciler::new();
    let outcomes = reconciler.reconcile(&mut dispatcher, &sim, &desired(48000, &[1], &[])).unwrap();
    assert!(matches!(outcomes[0], Outcome::Applied { .. }));

    let snapshot = EndStationSnapshot::capture(&sim).unwrap();
    assert_eq!(snapshot.streams(Direction::Input)[0].channel_count, 8);
    assert_eq!(DesiredConfig::from_snapshot(&snapshot).channels(Direction::Input), &[8]);
    // asking for 1 channel again is not a no-op
    let outcomes = reconciler.reconcile(&mut dispatcher, &sim, &desired(48000, &[1], &[])).unwrap();
    assert_eq!(
      *outcomes[0].discrepancy(),
      Discrepancy::StreamChannels { direction: Direction::Input, stream_index: 0, live: 8, desired: 1 }
    );
    assert_eq!(sim.sent_commands().len(), 2);
  }

  #[test]
  fn test_invalid_configuration_index() {
    let (sim, mut dispatcher) = setup(StationModel { current_config_index: 5, ..model(48000, &[2], &[]) });
    let mut reconciler = ConfigReconciler::new();
    let result = reconciler.reconcile(&mut dispatcher, &sim, &desired(96000, &[1], &[]));
    assert!(matches!(result, Err(ReconcileError::Discovery(DiscoveryError::ConfigurationUnavailable { index: 5, .. }))));
    assert_eq!(reconciler.phase(), Phase::Idle);
    assert!(sim.sent_commands().is_empty());
  }

  #[test]
  fn test_sequence_error_aborts() {
    let (sim, mut dispatcher) = setup(model(44100, &[2], &[]));
    dispatcher.tracker().arm(dispatcher.tracker().next_id()).unwrap();
    let result = ConfigReconciler::new().reconcile(&mut dispatcher, &sim, &desired(48000, &[1], &[]));
    assert!(matches!(result, Err(ReconcileError::Sequence(_))));
  }

  #[test]
  fn test_desired_edits() {
    let snapshot_desired = desired(48000, &[2], &[8]);
    let mut edited = snapshot_desired.clone();
    edited.set_sampling_rate(96000).set_channel_count(Direction::Output, 2, 1);
    assert_eq!(edited.channels(Direction::Output), &[8, 0, 1]);
    assert_eq!(edited.channels(Direction::Input), &[2]);

    let (sim, _dispatcher) = setup(model(48000, &[2], &[8]));
    let snapshot = EndStationSnapshot::capture(&sim).unwrap();
    assert_eq!(DesiredConfig::from_snapshot(&snapshot), snapshot_desired);
    // entries past the live stream count are ignored
    assert_eq!(ConfigReconciler::diff(&snapshot, &edited), vec![Discrepancy::SamplingRate { live: 48000, desired: 96000 }]);
    // missing entries mean unchanged
    assert!(ConfigReconciler::diff(&snapshot, &desired(48000, &[], &[])).is_empty());
  }
}
