#![deny(unsafe_op_in_unsafe_fn)]

use anyhow::{bail, Context};
use cache_side_channel::{
    parse_bits, pin_to_core, restore_affinity, to_bit_string, Bits, CancellationToken,
    MessageFramer, SystemClock,
};
use cache_utils::cache_info::host_llc_geometry;
use cache_utils::CacheGeometry;
use clap::{Args, Parser, Subcommand};
use covert_channel::identifier::IDENTIFIER_BITS;
use covert_channel::{
    ChannelConfig, Event, EventSink, Identifier, LogSink, Receiver, Role, Sender,
};
use log::{info, warn};
use prime_probe::{PrimeProbeEngine, SweepSampler};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// # LLC Prime+Probe covert channel.
///
/// Start `receive` and `send` as two independent processes with identical
/// geometry and channel settings.
///
/// ## Example
/// `llc_covert --preset i7-7600u send --passes 4`
#[derive(Parser)]
struct Options {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    geometry: GeometryArgs,

    #[command(flatten)]
    channel: ChannelArgs,

    /// Seed for the eviction set page order. Random by default.
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Back the eviction buffer with huge pages.
    #[arg(long = "huge-pages", global = true, default_value = "false")]
    huge_pages: bool,

    /// Pin the channel thread to this core.
    #[arg(long, global = true)]
    core: Option<usize>,

    /// Stop after this many seconds.
    #[arg(long, global = true)]
    timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Repeat `prefix || payload` over the channel.
    Send {
        #[arg(long, default_value = "11001010")]
        prefix: String,
        /// Payload bits. A random identifier is sent when omitted.
        #[arg(long)]
        payload: Option<String>,
        /// Stop after this many repetitions of the message.
        #[arg(long)]
        passes: Option<usize>,
    },
    /// Listen until a framed payload is read.
    Receive {
        #[arg(long, default_value = "11001010")]
        prefix: String,
    },
    /// Print the detected cache levels and the resolved settings.
    Info,
}

#[derive(Args)]
struct GeometryArgs {
    /// Named geometry: default, i5-3470 or i7-7600u.
    #[arg(long, global = true, conflicts_with_all = ["detect", "sets", "ways"])]
    preset: Option<String>,
    /// Use the last level cache reported by CPUID.
    #[arg(long, global = true, default_value = "false", conflicts_with_all = ["sets", "ways"])]
    detect: bool,
    /// Total number of LLC sets.
    #[arg(long, global = true)]
    sets: Option<usize>,
    /// LLC associativity.
    #[arg(long, global = true)]
    ways: Option<usize>,
    #[arg(long = "line-bytes", global = true, default_value_t = 64)]
    line_bytes: usize,
    #[arg(long = "page-bytes", global = true, default_value_t = 4096)]
    page_bytes: usize,
    /// Probe every n-th set of a page.
    #[arg(long = "set-skipping-step", global = true, default_value_t = 2)]
    set_skipping_step: usize,
}

impl GeometryArgs {
    fn resolve(&self) -> anyhow::Result<CacheGeometry> {
        let (sets, ways) = if let Some(name) = &self.preset {
            let preset = CacheGeometry::preset(name)?;
            (preset.total_sets(), preset.ways())
        } else if self.detect {
            let host = host_llc_geometry().context("the host LLC could not be detected")?;
            (host.total_sets(), host.ways())
        } else {
            let default = CacheGeometry::default();
            (
                self.sets.unwrap_or_else(|| default.total_sets()),
                self.ways.unwrap_or_else(|| default.ways()),
            )
        };
        CacheGeometry::new(
            sets,
            ways,
            self.line_bytes,
            self.page_bytes,
            self.set_skipping_step,
        )
        .context("invalid cache geometry")
    }
}

#[derive(Args)]
struct ChannelArgs {
    /// Sampling windows per bit.
    #[arg(long = "measurement-count", global = true, default_value_t = 10)]
    measurement_count: usize,
    #[arg(long = "sampling-period-ms", global = true, default_value_t = 100)]
    sampling_period_ms: u64,
    #[arg(long = "bit-period-ms", global = true, default_value_t = 1000)]
    bit_period_ms: u64,
    /// Bits per receiver chunk.
    #[arg(long = "chunk-length", global = true, default_value_t = 300)]
    chunk_length: usize,
    #[arg(long = "payload-length", global = true, default_value_t = 128)]
    payload_length: usize,
    /// Sweep counts below this read as 1.
    #[arg(long, global = true, default_value_t = 121)]
    threshold: u64,
    #[arg(long = "backoff-ms", global = true, default_value_t = 5000)]
    backoff_ms: u64,
}

impl ChannelArgs {
    fn config(&self) -> ChannelConfig {
        ChannelConfig {
            measurement_count: self.measurement_count,
            sampling_period_ms: self.sampling_period_ms,
            bit_period_ms: self.bit_period_ms,
            chunk_length: self.chunk_length,
            payload_length: self.payload_length,
            threshold: self.threshold,
            backoff_ms: self.backoff_ms,
        }
    }
}

/// What the channel thread needs, all of it `Send`.
struct Setup {
    geometry: CacheGeometry,
    config: ChannelConfig,
    seed: Option<u64>,
    huge_pages: bool,
    core: Option<usize>,
    cancel: CancellationToken,
}

impl Setup {
    fn engine(&self, role: Role, sink: &mut impl EventSink) -> anyhow::Result<PrimeProbeEngine> {
        let engine = PrimeProbeEngine::new(self.geometry, self.seed, self.huge_pages)
            .context("failed to build the eviction sets")?;
        sink.report(Event::EngineReady(role));
        Ok(engine)
    }

    /// Run `role` on its own thread, forwarding its events to `on_event` here.
    fn spawn<T, F>(self, role: F, mut on_event: impl FnMut(Event)) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Setup, &mut mpsc::Sender<Event>) -> anyhow::Result<T> + Send + 'static,
    {
        let (mut tx, rx) = mpsc::channel();
        let worker = thread::spawn(move || -> anyhow::Result<T> {
            let old = match self.core {
                Some(core) => Some(pin_to_core(core).context("failed to pin the channel thread")?),
                None => None,
            };
            let result = role(&self, &mut tx);
            if let Some(old) = old {
                if let Err(e) = restore_affinity(&old) {
                    warn!("failed to restore the CPU affinity: {}", e);
                }
            }
            result
        });
        for event in rx {
            on_event(event);
        }
        match worker.join() {
            Ok(result) => result,
            Err(_) => bail!("the channel thread panicked"),
        }
    }
}

fn send(setup: Setup, prefix: Bits, payload: Option<String>, passes: Option<usize>) -> anyhow::Result<()> {
    let payload = match payload {
        Some(bits) => parse_bits(&bits).context("invalid payload")?,
        None => {
            if setup.config.payload_length != IDENTIFIER_BITS {
                bail!(
                    "a generated identifier is {} bits, pass --payload for a {} bit payload",
                    IDENTIFIER_BITS,
                    setup.config.payload_length
                );
            }
            let id = Identifier::generate(&mut SmallRng::from_entropy(), &prefix)?;
            info!("sending identifier {}", id);
            id.to_bits()
        }
    };
    if payload.len() != setup.config.payload_length {
        bail!(
            "payload is {} bits, the channel is set up for {}",
            payload.len(),
            setup.config.payload_length
        );
    }

    let framer = MessageFramer::new(prefix, setup.config.payload_length);
    let mut log = LogSink;
    let completed = setup.spawn(
        move |setup, sink| {
            let engine = setup.engine(Role::Sender, sink)?;
            let mut sender = Sender::new(engine, SystemClock, setup.config)?;
            Ok(sender.run(&framer, &payload, &setup.cancel, sink, passes))
        },
        |event| log.report(event),
    )?;
    info!("sent {} complete repetition(s)", completed);
    Ok(())
}

fn receive(setup: Setup, prefix: Bits) -> anyhow::Result<()> {
    let mut log = LogSink;
    let payload = setup.spawn(
        move |setup, sink| {
            let engine = setup.engine(Role::Receiver, sink)?;
            let sampler = SweepSampler::new(
                engine,
                SystemClock,
                setup.config.measurement_count,
                setup.config.sampling_period_ms,
            );
            let mut receiver = Receiver::new(sampler, SystemClock, setup.config, prefix)?;
            Ok(receiver.run(&setup.cancel, sink))
        },
        |event| match event {
            Event::PayloadFound(_) => println!("{}", event),
            _ => log.report(event),
        },
    )?;

    match payload {
        Some(payload) => {
            if let Ok(id) = Identifier::from_bits(&payload) {
                println!("identifier: {}", id);
            }
        }
        None => info!("stopped before a payload was read"),
    }
    Ok(())
}

fn print_info(geometry: &CacheGeometry, config: &ChannelConfig) {
    use cache_utils::cache_info::{get_cache_info, last_level};

    let levels = get_cache_info();
    for level in &levels {
        println!(
            "L{} {:?}: {} KiB, {} ways, {} sets, {} B lines",
            level.level,
            level.cache_type,
            level.size_bytes() / 1024,
            level.associativity,
            level.sets,
            level.line_size
        );
    }
    if last_level(&levels).is_none() {
        println!("LLC not detected");
    }
    println!(
        "channel geometry: {} sets, {} ways, {} sets per page, {} pages, {} MiB",
        geometry.total_sets(),
        geometry.ways(),
        geometry.sets_per_page(),
        geometry.pages_needed(),
        geometry.capacity_bytes() / cache_utils::BYTES_PER_MB
    );
    println!("{:#?}", config);
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let options = Options::parse();

    let geometry = options.geometry.resolve()?;
    let config = options.channel.config();
    let cancel = CancellationToken::new();
    if let Some(secs) = options.timeout {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(secs));
            info!("timeout reached, stopping");
            cancel.cancel();
        });
    }
    let setup = Setup {
        geometry,
        config,
        seed: options.seed,
        huge_pages: options.huge_pages,
        core: options.core,
        cancel,
    };

    match options.command {
        Command::Send {
            prefix,
            payload,
            passes,
        } => {
            let prefix = parse_bits(&prefix).context("invalid prefix")?;
            config.validate(prefix.len())?;
            send(setup, prefix, payload, passes)
        }
        Command::Receive { prefix } => {
            let prefix = parse_bits(&prefix).context("invalid prefix")?;
            config.validate(prefix.len())?;
            info!(
                "listening for {} bit payloads, frame prefix {}",
                config.payload_length,
                to_bit_string(&prefix)
            );
            receive(setup, prefix)
        }
        Command::Info => {
            print_info(&geometry, &config);
            Ok(())
        }
    }
}
