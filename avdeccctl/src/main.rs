use std::{error::Error, path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use itertools::Itertools;
use log::{error, info, warn};

use avdecc_ctl::descriptors::Direction;
use avdecc_ctl::protocol::aem::{AudioUnitDescriptor, DESC_AUDIO_UNIT};
use avdecc_ctl::simulated::SimulatedNetwork;
use avdecc_ctl::stream_format::{decode_channel_count, format_name};
use avdecc_ctl::{
  Committed, Controller, ControllerConfig, DesiredConfig, Discrepancy, EndStationSummary, NotificationRouter, Outcome,
};

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// Inventory of simulated end stations
  #[arg(long, short, default_value = "devices.toml")]
  devices: PathBuf,
  /// Overrides AVDECC_COMMAND_TIMEOUT_MS
  #[arg(long)]
  timeout_ms: Option<u64>,
  /// Reply latency of the simulated end stations
  #[arg(long, default_value_t = 0)]
  latency_ms: u64,
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List end stations
  List,
  /// Show the current configuration of an end station
  Show { index: usize },
  /// Check an end station answers and read its sampling rate from the device
  Probe { index: usize },
  /// Reconfigure an end station, sending only what differs
  Apply {
    index: usize,
    #[arg(long)]
    rate: Option<u32>,
    /// Channel counts of the input streams, in stream order
    #[arg(long, value_delimiter = ',')]
    input: Vec<u32>,
    /// Channel counts of the output streams, in stream order
    #[arg(long, value_delimiter = ',')]
    output: Vec<u32>,
  },
  /// Print the list again whenever end stations appear, until Ctrl-C
  Watch,
}

fn print_listing(stations: &[EndStationSummary]) {
  for (index, s) in stations.iter().enumerate() {
    println!(
      "{index:>3} {} {:<32} 0x{:016x} {:<12} {:012x}",
      s.connection_status.as_char(),
      s.entity_name,
      s.entity_id,
      s.firmware_version,
      s.mac
    );
  }
}

fn show(controller: &Controller<SimulatedNetwork>, index: usize) -> CliResult {
  let snapshot = controller.snapshot(index)?;
  println!("entity id:     0x{:016x}", snapshot.entity_id);
  println!("mac:           {:012x}", snapshot.mac);
  println!("status:        {:?}", snapshot.connection_status);
  println!("entity name:   {}", snapshot.entity_name);
  println!("default name:  {}", snapshot.default_name);
  println!("firmware:      {}", snapshot.firmware_version);
  println!("entity/config: {}/{}", snapshot.entity_index, snapshot.config_index);
  println!("sampling rate: {} (supported: {})", snapshot.sampling_rate, snapshot.sampling_rates.iter().join(", "));
  for direction in [Direction::Input, Direction::Output] {
    for (i, stream) in snapshot.streams(direction).iter().enumerate() {
      println!(
        "{} {i}: {:<24} {} ch  {}",
        direction.name(),
        stream.name,
        stream.channel_count,
        format_name(stream.format)
      );
    }
  }
  Ok(())
}

fn probe(controller: &mut Controller<SimulatedNetwork>, index: usize) -> CliResult {
  let (station, dispatcher) = controller.dispatcher(index)?;
  dispatcher.entity_available(station.as_ref())?;
  let descriptor = dispatcher.read_descriptor(station.as_ref(), DESC_AUDIO_UNIT, 0)?;
  match AudioUnitDescriptor::parse(descriptor) {
    Some(unit) => println!("entity 0x{:016x} is available, running at {} Hz", station.entity_id(), unit.current_sampling_rate),
    None => warn!("unable to parse AUDIO_UNIT descriptor: {}", hex::encode(descriptor)),
  }
  Ok(())
}

fn apply(
  controller: &mut Controller<SimulatedNetwork>,
  index: usize,
  rate: Option<u32>,
  input: &[u32],
  output: &[u32],
) -> CliResult {
  let mut desired = DesiredConfig::from_snapshot(&controller.snapshot(index)?);
  if let Some(rate) = rate {
    desired.set_sampling_rate(rate);
  }
  for (direction, channels) in [(Direction::Input, input), (Direction::Output, output)] {
    for (stream_index, &count) in channels.iter().enumerate() {
      desired.set_channel_count(direction, stream_index, count);
    }
  }
  let outcomes = controller.reconcile(index, &desired)?;
  if outcomes.is_empty() {
    println!("nothing to change");
  }
  for outcome in outcomes {
    match outcome {
      Outcome::Applied { discrepancy, committed } => {
        println!("applied   {discrepancy:?} -> {committed:?}");
        if let (Discrepancy::StreamChannels { desired, .. }, Committed::StreamFormat(format)) = (discrepancy, committed) {
          let read_back = decode_channel_count(format);
          if read_back != desired {
            println!("          note: this format reads back as {read_back} channels, `show` and the next apply will see {read_back}");
          }
        }
      }
      Outcome::NoMatchingFormat { discrepancy } => println!("no format {discrepancy:?}"),
      Outcome::Failed { discrepancy, error } => println!("failed    {discrepancy:?}: {error}"),
      Outcome::Abandoned { discrepancy } => println!("abandoned {discrepancy:?}"),
    }
  }
  Ok(())
}

async fn watch(controller: &mut Controller<SimulatedNetwork>) -> CliResult {
  print_listing(&controller.end_stations());
  let mut interval = tokio::time::interval(controller.config().refresh_interval);
  loop {
    tokio::select! {
      _ = interval.tick() => {
        if let Some(listing) = controller.refresh() {
          println!();
          print_listing(&listing);
        }
      }
      _ = tokio::signal::ctrl_c() => {
        info!("interrupted");
        return Ok(());
      }
    }
  }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
  let logenv = env_logger::Env::default().default_filter_or("info");
  env_logger::init_from_env(logenv);

  let args = Args::parse();

  let mut config = match ControllerConfig::from_env() {
    Ok(config) => config,
    Err(e) => {
      error!("{e}");
      std::process::exit(2);
    }
  };
  if let Some(ms) = args.timeout_ms {
    config = config.with_command_timeout(Duration::from_millis(ms));
  }

  let router = NotificationRouter::new();
  let network = match SimulatedNetwork::load(&args.devices, router.clone(), Duration::from_millis(args.latency_ms)) {
    Ok(network) => network,
    Err(e) => {
      error!("{}: {e}", args.devices.display());
      std::process::exit(2);
    }
  };
  let mut controller = Controller::new(network, router, config);

  let result = match args.command {
    Command::List => {
      print_listing(&controller.end_stations());
      Ok(())
    }
    Command::Show { index } => show(&controller, index),
    Command::Probe { index } => probe(&mut controller, index),
    Command::Apply { index, rate, input, output } => apply(&mut controller, index, rate, &input, &output),
    Command::Watch => watch(&mut controller).await,
  };
  if let Err(e) = result {
    error!("{e}");
    std::process::exit(1);
  }
}
