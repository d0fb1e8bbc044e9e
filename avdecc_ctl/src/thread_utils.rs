use std::{io, pin::Pin, thread::JoinHandle};

use futures::Future;

use crate::common::*;

pub fn run_future_in_new_thread(name: impl ToString, future_cb: impl FnOnce() -> Pin<Box<dyn Future<Output=()> + 'static>> + Send + 'static) -> io::Result<JoinHandle<()>> {
  let name = name.to_string();
  std::thread::Builder::new().name(name.clone()).spawn(move || {
    let runtime = match tokio::runtime::Builder::new_current_thread()
      .thread_name(name.clone())
      .enable_all()
      .build() {
      Ok(rt) => rt,
      Err(e) => {
        error!("{name}: unable to build runtime: {e:?}");
        return;
      }
    };
    runtime.block_on(future_cb());
  })
}
