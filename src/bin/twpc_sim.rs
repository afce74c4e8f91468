//! Desktop simulator for a TWPC layout.
//!
//! Runs a master station on its tick thread against a simulated layout of
//! trains, then reads host commands from stdin and prints the replies on
//! stdout, one per line. Station events are printed as JSON.
//!
//! # Usage
//!
//! ```sh
//! # Two trains, default configuration
//! cargo run --bin twpc-sim --features cli
//!
//! # Four trains from a TOML file, debug logging
//! cargo run --bin twpc-sim --features cli -- --config layout.toml --trains 4 -v
//! ```
//!
//! Besides the host protocol (`1`, `0`, `m012`, `g`, ...) the simulator
//! understands a few layout commands:
//!
//! | Input | Effect |
//! |-------|--------|
//! | `status` | print a JSON snapshot |
//! | `place <train> <line>` | put a train on a contact line |
//! | `lift <train>` | take a train off its contact line |
//! | `unplug <train>` | pull a train off the bus |
//! | `quit` | stop |

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use twpc_rail::hal::SimBus;
use twpc_rail::services::{self, StationHandle};
use twpc_rail::{
    Config, DeviceConfig, HostCommand, HostParser, MasterEvent, RunnerError, Station,
    StationEvent,
};

/// TWPC layout simulator
#[derive(Parser, Debug)]
#[command(name = "twpc-sim")]
#[command(version)]
#[command(about = "Simulated TWPC master station with trains on the bus")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of trains to bring up
    #[arg(short, long, default_value_t = 2)]
    trains: u8,

    /// Tick period in microseconds (overrides the configuration)
    #[arg(long, value_name = "US")]
    tick_us: Option<u32>,

    /// Disable the receive fault threshold
    #[arg(long)]
    no_fault_threshold: bool,

    /// Cycles to wait for each train to finish its handshake
    #[arg(long, default_value_t = 5000)]
    join_cycles: u32,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

type Handle = StationHandle<SimBus>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_tracing(&args);

    let config = load_config(&args)?;
    info!("twpc-sim v{} starting", env!("CARGO_PKG_VERSION"));

    let bus = SimBus::new(&config.bus);
    let station = Station::new(&config, bus);
    let period = Duration::from_micros(config.bus.tick_period_us.into());
    let handle = services::spawn(station, period).context("failed to start tick thread")?;
    let mut events = handle.subscribe();

    let join_timeout = period.max(Duration::from_micros(1)) * 2 * args.join_cycles;
    for n in 0..args.trains {
        let device = config
            .device
            .clone()
            .with_identity([b'T', b'0' + n / 10, b'0' + n % 10]);
        bring_up(&handle, &mut events, device, join_timeout).await?;
    }

    let stdin = BufReader::new(tokio::io::stdin());
    let mut input = stdin.lines();
    loop {
        tokio::select! {
            line = input.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&handle, line.trim()).await? {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(missed = n, "event stream lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let station = handle.stop()?;
    info!(ticks = station.ticks(), "stopped");
    Ok(())
}

fn setup_tracing(args: &Args) {
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Config::from_toml_str(&source).with_context(|| format!("parsing {}", path.display()))?
        }
        None => Config::default(),
    };
    if let Some(us) = args.tick_us {
        config.bus = config.bus.with_tick_period_us(us);
    }
    if args.no_fault_threshold {
        config.bus = config.bus.with_fault_threshold(None);
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Plug in one train and wait until the master has identified it.
///
/// Trains join one at a time: two unassigned devices would answer the same
/// invitation together.
async fn bring_up(
    handle: &Handle,
    events: &mut broadcast::Receiver<StationEvent>,
    device: DeviceConfig,
    timeout: Duration,
) -> anyhow::Result<()> {
    let index = handle
        .with(move |s| {
            let index = s.lines_mut().attach(&device);
            let _ = s.execute(HostCommand::EnableEnumeration);
            index
        })
        .await?;

    let identified = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(StationEvent::Bus(MasterEvent::Identified { id, .. })) => return Ok(id),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(RunnerError::Stopped),
            }
        }
    })
    .await;

    match identified {
        Ok(Ok(id)) => {
            info!(train = index, id, "train joined");
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => bail!("train {index} did not join within {timeout:?}"),
    }
}

/// Handle one input line. Returns `false` to quit.
async fn handle_line(handle: &Handle, line: &str) -> anyhow::Result<bool> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let train = |i: usize| -> anyhow::Result<usize> {
        let word = words.get(i).context("missing train index")?;
        word.parse().with_context(|| format!("bad train index {word}"))
    };

    match words.first().copied() {
        None => {}
        Some("quit") => return Ok(false),
        Some("status") => {
            let snapshot = handle.snapshot().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Some("place") => {
            let index = train(1)?;
            let contact: u8 = words
                .get(2)
                .context("missing contact line")?
                .parse()
                .context("bad contact line")?;
            handle
                .with(move |s| s.lines_mut().place(index, Some(contact)))
                .await?;
        }
        Some("lift") => {
            let index = train(1)?;
            handle.with(move |s| s.lines_mut().place(index, None)).await?;
        }
        Some("unplug") => {
            let index = train(1)?;
            handle.with(move |s| s.lines_mut().unplug(index)).await?;
        }
        Some(_) => host_commands(handle, line).await?,
    }
    Ok(true)
}

/// Run every host command on the line and print the replies.
async fn host_commands(handle: &Handle, line: &str) -> anyhow::Result<()> {
    let mut parser = HostParser::new();
    for byte in line.bytes() {
        let Some(result) = parser.feed(byte) else {
            continue;
        };
        let reply = match result {
            Ok(command) => handle.execute(command).await,
            Err(e) => Err(e.into()),
        };
        match reply {
            Ok(reply) => println!("{reply}"),
            Err(RunnerError::Host(e)) => println!("{}", e.reply()),
            Err(e) => return Err(e.into()),
        }
    }
    if parser.in_progress() {
        println!("err");
    }
    Ok(())
}
