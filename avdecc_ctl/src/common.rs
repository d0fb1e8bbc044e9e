pub use log::{debug, error, info, trace, warn};

/// For fire-and-forget sends whose failure only matters in the log.
pub trait LogAndForget {
  fn log_and_forget(&self);
}

impl<T, E: std::fmt::Debug> LogAndForget for Result<T, E> {
  #[track_caller]
  fn log_and_forget(&self) {
    if let Err(e) = self {
      warn!("{}: discarding error {e:?}", std::panic::Location::caller());
    }
  }
}
