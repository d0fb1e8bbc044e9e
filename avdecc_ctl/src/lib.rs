// avdecc_ctl
// Copyright (C) 2026 avdecc_ctl contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.


//! avdecc_ctl - core of an IEEE 1722.1 (AVDECC) controller
//!
//! Reads the configuration of discovered end stations and brings them to a desired
//! sampling rate and per-stream channel counts, one command at a time. Every command
//! gets exactly one outcome, and a pass keeps going when a single command fails.
//!
//! The protocol layer (discovery, enumeration, the wire) is reached through the traits
//! in [`descriptors`]. Its replies come back through a [`NotificationRouter`].
//! [`simulated`] provides an in-memory one.
//!
//! ```no_run
//! use std::time::Duration;
//! use avdecc_ctl::{Controller, ControllerConfig, NotificationRouter};
//! use avdecc_ctl::simulated::SimulatedNetwork;
//!
//! let router = NotificationRouter::new();
//! let network = SimulatedNetwork::load("devices.toml", router.clone(), Duration::ZERO).unwrap();
//! let mut controller = Controller::new(network, router, ControllerConfig::from_env().unwrap());
//! let mut desired = avdecc_ctl::DesiredConfig::from_snapshot(&controller.snapshot(0).unwrap());
//! desired.set_sampling_rate(96000);
//! for outcome in controller.reconcile(0, &desired).unwrap() {
//!   println!("{outcome:?}");
//! }
//! ```
//!


mod byte_utils;
mod common;
mod config;
mod controller;
mod dispatcher;
mod notification;
mod reconciler;
mod response_frame;
mod snapshot;
mod thread_utils;

pub mod descriptors;
pub mod protocol;
pub mod simulated;
pub mod stream_format;

pub use config::{ConfigError, ControllerConfig};
pub use controller::Controller;
pub use dispatcher::{CommandDispatcher, CommandError, CommandKind};
pub use notification::{NotificationId, NotificationRouter, NotificationTracker, Notifier, Reply, SequenceError};
pub use reconciler::{CancelHandle, Committed, ConfigReconciler, DesiredConfig, Discrepancy, Outcome, Phase, ReconcileError};
pub use response_frame::{FrameError, FrameKind, ResponseFrame};
pub use snapshot::{EndStationSnapshot, EndStationSummary, StreamInfo};

pub mod utils {
  pub use crate::thread_utils::run_future_in_new_thread;
  pub use crate::common::LogAndForget;
}
