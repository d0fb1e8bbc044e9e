//! Correlation of outgoing commands with their asynchronous replies.
//!
//! One [`NotificationTracker`] belongs to one dispatcher and has at most one command in
//! flight. The protocol layer resolves it from its own threads through a [`Notifier`],
//! usually looked up by entity id in a [`NotificationRouter`].

use std::{
  collections::HashMap,
  fmt,
  sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock,
  },
  time::Duration,
};

use thiserror::Error;

use crate::common::*;
use crate::protocol::aem::Status;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotificationId(pub u32);

impl NotificationId {
  /// Pointer-sized form handed to the protocol layer as opaque correlation data.
  pub fn to_transport(self) -> usize {
    self.0 as usize
  }

  pub fn from_transport(token: usize) -> Self {
    Self(token as u32)
  }
}

impl fmt::Display for NotificationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// What the protocol layer hands back for a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
  pub status: Status,
  /// Whole response frame as received.
  pub frame: Vec<u8>,
  /// Where the command-specific payload starts within `frame`.
  pub payload_pos: usize,
}

impl Reply {
  pub fn new(status: Status, frame: Vec<u8>, payload_pos: usize) -> Self {
    Self { status, frame, payload_pos }
  }

  pub fn status_only(status: Status) -> Self {
    Self { status, frame: vec![], payload_pos: 0 }
  }

  pub fn payload(&self) -> &[u8] {
    self.frame.get(self.payload_pos..).unwrap_or(&[])
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
  #[error("cannot arm {requested} while {armed} is still waiting for its reply")]
  AlreadyArmed { armed: NotificationId, requested: NotificationId },
  #[error("no command armed, nothing to wait for")]
  NothingArmed,
}

enum Slot {
  Idle,
  Armed(NotificationId),
  Resolved(NotificationId, Reply),
}

struct Shared {
  slot: Mutex<Slot>,
  resolved: Condvar,
}

impl Shared {
  fn lock(&self) -> MutexGuard<'_, Slot> {
    self.slot.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Hands the reply back when `id` is not the armed command.
  fn resolve(&self, id: NotificationId, reply: Reply) -> Result<(), Reply> {
    let mut slot = self.lock();
    match &*slot {
      Slot::Armed(armed) if *armed == id => {
        *slot = Slot::Resolved(id, reply);
        self.resolved.notify_all();
        Ok(())
      }
      _ => Err(reply),
    }
  }
}

pub struct NotificationTracker {
  next: AtomicU32,
  timeout: Duration,
  shared: Arc<Shared>,
}

impl NotificationTracker {
  pub fn new(timeout: Duration) -> Self {
    Self {
      next: AtomicU32::new(1),
      timeout,
      shared: Arc::new(Shared { slot: Mutex::new(Slot::Idle), resolved: Condvar::new() }),
    }
  }

  pub fn notifier(&self) -> Notifier {
    Notifier { shared: self.shared.clone() }
  }

  /// Token for the next command: one more than the previous one, starting at 1.
  /// Wraps around after 2^32 commands.
  pub fn next_id(&self) -> NotificationId {
    NotificationId(self.next.fetch_add(1, Ordering::AcqRel))
  }

  /// Must happen before the command goes out, so that a fast reply finds the slot armed.
  pub fn arm(&self, id: NotificationId) -> Result<(), SequenceError> {
    let mut slot = self.shared.lock();
    match &*slot {
      Slot::Armed(armed) | Slot::Resolved(armed, _) => {
        Err(SequenceError::AlreadyArmed { armed: *armed, requested: id })
      }
      Slot::Idle => {
        *slot = Slot::Armed(id);
        Ok(())
      }
    }
  }

  /// Blocks until the armed command is resolved or the timeout elapses.
  /// Either way the tracker is idle again afterwards.
  pub fn await_result(&self) -> Result<Reply, SequenceError> {
    let slot = self.shared.lock();
    if let Slot::Idle = &*slot {
      return Err(SequenceError::NothingArmed);
    }
    let (mut slot, _) = self
      .shared
      .resolved
      .wait_timeout_while(slot, self.timeout, |slot| matches!(slot, Slot::Armed(_)))
      .unwrap_or_else(PoisonError::into_inner);
    match std::mem::replace(&mut *slot, Slot::Idle) {
      Slot::Resolved(_, reply) => Ok(reply),
      Slot::Armed(id) => {
        debug!("{id}: no reply within {:?}", self.timeout);
        Ok(Reply::status_only(Status::Timeout))
      }
      Slot::Idle => Err(SequenceError::NothingArmed),
    }
  }

  /// Resolves the armed command, if any, with [`Status::Aborted`].
  pub fn abort(&self) -> bool {
    let armed = match &*self.shared.lock() {
      Slot::Armed(id) => *id,
      _ => return false,
    };
    self.shared.resolve(armed, Reply::status_only(Status::Aborted)).is_ok()
  }
}

/// Handle through which the protocol layer delivers replies.
#[derive(Clone)]
pub struct Notifier {
  shared: Arc<Shared>,
}

impl Notifier {
  /// Returns false when nobody waits for `id` (late reply after a timeout, or a stray token).
  pub fn notify(&self, id: NotificationId, reply: Reply) -> bool {
    let status = reply.status;
    match self.shared.resolve(id, reply) {
      Ok(()) => {
        trace!("{id} resolved with {status}");
        true
      }
      Err(reply) => {
        warn!("dropping reply to {id} nobody waits for: {status} {}", hex::encode(&reply.frame));
        false
      }
    }
  }
}

/// Delivers replies to the notifier registered for the end station they came from.
#[derive(Clone, Default)]
pub struct NotificationRouter {
  notifiers: Arc<RwLock<HashMap<u64, Notifier>>>,
}

impl NotificationRouter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, entity_id: u64, notifier: Notifier) {
    self.notifiers.write().unwrap_or_else(PoisonError::into_inner).insert(entity_id, notifier);
  }

  pub fn unregister(&self, entity_id: u64) {
    self.notifiers.write().unwrap_or_else(PoisonError::into_inner).remove(&entity_id);
  }

  pub fn route(&self, entity_id: u64, id: NotificationId, reply: Reply) -> bool {
    let notifier = self.notifiers.read().unwrap_or_else(PoisonError::into_inner).get(&entity_id).cloned();
    match notifier {
      Some(notifier) => notifier.notify(id, reply),
      None => {
        warn!("reply {id} from entity {entity_id:#018x} which has no dispatcher");
        false
      }
    }
  }
}
