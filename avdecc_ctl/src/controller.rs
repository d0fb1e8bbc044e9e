//! What a user interface talks to: the end station list, snapshots and reconciliation,
//! each end station with a dispatcher of its own.

use std::{collections::HashMap, sync::Arc};

use itertools::Itertools;

use crate::common::*;
use crate::config::ControllerConfig;
use crate::descriptors::{Discovery, DiscoveryError, EndStation};
use crate::dispatcher::CommandDispatcher;
use crate::notification::NotificationRouter;
use crate::reconciler::{ConfigReconciler, DesiredConfig, Outcome, ReconcileError};
use crate::snapshot::{EndStationSnapshot, EndStationSummary};

pub struct Controller<D: Discovery> {
  discovery: D,
  router: NotificationRouter,
  config: ControllerConfig,
  listed_count: usize,
  dispatchers: HashMap<u64, CommandDispatcher>,
}

impl<D: Discovery> Controller<D> {
  /// `router` must be the one the protocol layer delivers replies through.
  pub fn new(discovery: D, router: NotificationRouter, config: ControllerConfig) -> Self {
    Self { discovery, router, config, listed_count: 0, dispatchers: HashMap::new() }
  }

  pub fn config(&self) -> &ControllerConfig {
    &self.config
  }

  pub fn discovery(&self) -> &D {
    &self.discovery
  }

  pub fn end_stations(&mut self) -> Vec<EndStationSummary> {
    let count = self.discovery.end_station_count();
    self.listed_count = count;
    (0..count)
      .filter_map(|i| self.discovery.end_station(i))
      .map(|station| EndStationSummary::capture(station.as_ref()))
      .collect_vec()
  }

  /// Periodic hook. Gives a new listing only when end stations were added since the last one.
  pub fn refresh(&mut self) -> Option<Vec<EndStationSummary>> {
    let count = self.discovery.end_station_count();
    if count <= self.listed_count {
      return None;
    }
    debug!("{} new end station(s)", count - self.listed_count);
    Some(self.end_stations())
  }

  pub fn end_station(&self, index: usize) -> Result<Arc<dyn EndStation>, DiscoveryError> {
    self.discovery.end_station(index).ok_or(DiscoveryError::NoSuchEndStation {
      index,
      count: self.discovery.end_station_count(),
    })
  }

  pub fn snapshot(&self, index: usize) -> Result<EndStationSnapshot, DiscoveryError> {
    EndStationSnapshot::capture(self.end_station(index)?.as_ref())
  }

  pub fn dispatcher(&mut self, index: usize) -> Result<(Arc<dyn EndStation>, &mut CommandDispatcher), DiscoveryError> {
    let station = self.end_station(index)?;
    let entity_id = station.entity_id();
    let (router, timeout) = (&self.router, self.config.command_timeout);
    let dispatcher = self.dispatchers.entry(entity_id).or_insert_with(|| {
      debug!("new dispatcher for entity {entity_id:#018x}");
      let dispatcher = CommandDispatcher::new(timeout);
      router.register(entity_id, dispatcher.notifier());
      dispatcher
    });
    Ok((station, dispatcher))
  }

  pub fn reconcile(&mut self, index: usize, desired: &DesiredConfig) -> Result<Vec<Outcome>, ReconcileError> {
    self.reconcile_with(&mut ConfigReconciler::new(), index, desired)
  }

  /// Runs the pass with a caller-owned reconciler, so it can be cancelled from elsewhere.
  pub fn reconcile_with(
    &mut self,
    reconciler: &mut ConfigReconciler,
    index: usize,
    desired: &DesiredConfig,
  ) -> Result<Vec<Outcome>, ReconcileError> {
    let (station, dispatcher) = self.dispatcher(index)?;
    reconciler.reconcile(dispatcher, station.as_ref(), desired)
  }
}

impl<D: Discovery> Drop for Controller<D> {
  fn drop(&mut self) {
    for entity_id in self.dispatchers.keys() {
      self.router.unregister(*entity_id);
    }
  }
}
