//! siggen: command-line control of a SCPI signal generator.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use scpi_siggen::driver::{Connector, DeviceDescriptor, NoElevation};
use scpi_siggen::transport::{MockBackend, SimulatedInstrument};
use scpi_siggen::{
    logging, ArbitraryWaveform, CancellationToken, FadeRequest, Parameter, SigGenConfig,
    SigGenError, SignalGenerator, Stimulation, WaveformMode, WaveformSetting,
};

/// Protocol name selecting the built-in simulated instrument.
const MOCK_PROTOCOL: &str = "mock";

#[derive(Parser)]
#[command(name = "siggen")]
#[command(author, version, about = "Control a SCPI signal generator", long_about = None)]
struct Cli {
    /// Configuration file (default: ./siggen.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Transport: usbtmc, visa or mock (default: from config, then host OS)
    #[arg(long, global = true)]
    protocol: Option<String>,

    /// Device path or VISA resource; discovered and prompted for when absent
    #[arg(short, long, global = true)]
    device: Option<String>,

    /// Output channel (1 or 2)
    #[arg(short, long, global = true, default_value_t = 1)]
    channel: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every endpoint of the selected transport
    List,
    /// Print the instrument identity
    Idn,
    /// Reset the instrument
    Reset,
    /// Show the applied waveform of both channels
    Status,
    /// Print the effective configuration
    Config,
    /// Apply a sine wave
    Sine {
        /// Frequency in Hz
        #[arg(long)]
        freq: f64,
        /// Amplitude in V
        #[arg(long)]
        amp: f64,
        /// Offset in V
        #[arg(long, default_value_t = 0.0)]
        offset: f64,
        /// Phase in degrees
        #[arg(long, default_value_t = 0.0)]
        phase: f64,
    },
    /// Apply a DC level
    Dc {
        /// Level in V
        #[arg(long)]
        amp: f64,
    },
    /// Apply noise
    Noise {
        /// Amplitude in V
        #[arg(long)]
        amp: f64,
        /// Offset in V
        #[arg(long, default_value_t = 0.0)]
        offset: f64,
    },
    /// Set amplitude, offset, frequency or phase, or send a generic setting
    Set { key: String, value: String },
    /// Query amplitude, offset, frequency or phase
    Get { parameter: Parameter },
    /// Enable the output
    On,
    /// Disable the output
    Off,
    /// Upload an arbitrary waveform file ({"sps": .., "data": [..]})
    Arb { file: PathBuf },
    /// Ramp the amplitude from the floor to AMP, or back down with --out
    Fade {
        #[arg(long)]
        amp: f64,
        /// Ramp length in seconds
        #[arg(long, default_value_t = 2.0)]
        duration: f64,
        #[arg(long, default_value_t = 10.0)]
        steps_per_sec: f64,
        #[arg(long)]
        out: bool,
        #[command(flatten)]
        running: RunningMode,
    },
    /// Output on, optional fade-in, hold, optional fade-out, output off
    Stimulate {
        #[arg(long)]
        amp: f64,
        /// Hold time in seconds
        #[arg(long)]
        hold: f64,
        /// Fade length in seconds
        #[arg(long)]
        fade: Option<f64>,
        #[arg(long, default_value_t = 10.0)]
        steps_per_sec: f64,
        #[command(flatten)]
        running: RunningMode,
    },
}

/// Waveform already running on the instrument, set by an earlier invocation.
#[derive(clap::Args)]
struct RunningMode {
    /// Waveform the channel is running: sine, dc or noise (default: sine)
    #[arg(long)]
    mode: Option<WaveformMode>,
    /// Noise offset in V kept while the amplitude changes
    #[arg(long, requires = "mode")]
    offset: Option<f64>,
}

impl RunningMode {
    async fn seed(&self, generator: &SignalGenerator) {
        if let Some(mode) = self.mode {
            generator.assume_mode(None, mode, self.offset).await;
        }
    }
}

fn seconds(value: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("Invalid {what}: {value}"))
}

fn connector(cli: &Cli, config: &mut SigGenConfig) -> Result<Connector> {
    match cli.protocol.as_deref() {
        Some(MOCK_PROTOCOL) => {
            let backend = MockBackend::new()
                .with_endpoint("sim0", SimulatedInstrument::default())
                .with_endpoint("sim1", SimulatedInstrument::unresponsive());
            return Ok(Connector::new(Arc::new(backend)).with_elevator(Arc::new(NoElevation)));
        }
        Some(protocol) => config.connection.protocol = Some(protocol.parse()?),
        None => {}
    }
    Ok(Connector::from_config(config)?)
}

fn prompt(devices: &[DeviceDescriptor]) -> Option<usize> {
    if devices.is_empty() {
        eprintln!("No devices found");
        return None;
    }
    for device in devices {
        println!("{device}");
    }
    print!("Select device index: ");
    std::io::stdout().flush().ok()?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line).ok()?;
    line.trim().parse().ok()
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => SigGenConfig::load_from(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => SigGenConfig::load().context("Failed to load configuration")?,
    };
    logging::init(&config.application)?;

    if let Commands::Config = cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let connector = connector(&cli, &mut config)?;
    if let Commands::List = cli.command {
        for device in connector.discover().await? {
            println!("{device}");
        }
        return Ok(());
    }

    let driver = match &cli.device {
        Some(location) => connector.connect_location(location).await,
        None => connector.connect_with(prompt).await,
    }
    .context("Failed to connect")?;

    let generator = SignalGenerator::with_pacing(driver, config.pacing.clone());
    let channel = generator.select_channel(cli.channel).await?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current step");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::List | Commands::Config => {}
        Commands::Idn => println!("{}", generator.identity().await?),
        Commands::Reset => println!("{}", generator.reset().await?),
        Commands::Status => {
            for (channel, reply) in generator.status().await? {
                println!("CH{channel}: {reply}");
            }
        }
        Commands::Sine {
            freq,
            amp,
            offset,
            phase,
        } => {
            let setting = WaveformSetting::Sine {
                frequency: freq,
                amplitude: amp,
                offset,
                phase,
            };
            generator.set_parameters(&[setting], None).await?;
        }
        Commands::Dc { amp } => {
            generator
                .set_parameters(&[WaveformSetting::Dc { amplitude: amp }], None)
                .await?;
        }
        Commands::Noise { amp, offset } => {
            let setting = WaveformSetting::Noise {
                amplitude: amp,
                offset,
            };
            generator.set_parameters(&[setting], None).await?;
        }
        Commands::Set { key, value } => match (key.parse::<Parameter>(), value.parse::<f64>()) {
            (Ok(parameter), Ok(number)) => {
                generator
                    .set_single(parameter, Some(number), false, None)
                    .await?;
            }
            _ => {
                generator
                    .set_parameters(&[WaveformSetting::generic(key, value)], None)
                    .await?;
            }
        },
        Commands::Get { parameter } => {
            if let Some(value) = generator.set_single(parameter, None, true, None).await? {
                println!("{value}");
            }
        }
        Commands::On => generator.enable(None).await?,
        Commands::Off => generator.disable(None).await?,
        Commands::Arb { file } => {
            let waveform = ArbitraryWaveform::from_json_file(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            info!(
                points = waveform.samples.len(),
                period_secs = waveform.preview_duration().as_secs_f64(),
                "Loaded arbitrary waveform"
            );
            generator.upload_arbitrary(&waveform, None, &cancel).await?;
        }
        Commands::Fade {
            amp,
            duration,
            steps_per_sec,
            out,
            running,
        } => {
            running.seed(&generator).await;
            let duration = seconds(duration, "duration")?;
            let request = if out {
                FadeRequest::fade_out(amp, duration, steps_per_sec)
            } else {
                FadeRequest::fade_in(amp, duration, steps_per_sec)
            };
            generator.fade(&request, &cancel).await?;
        }
        Commands::Stimulate {
            amp,
            hold,
            fade,
            steps_per_sec,
            running,
        } => {
            running.seed(&generator).await;
            let mut session = Stimulation::new(amp, seconds(hold, "hold")?);
            if let Some(fade) = fade {
                session = session.with_fade(seconds(fade, "fade")?, steps_per_sec);
            }
            if let Err(err) = generator.stimulate(&session, &cancel).await {
                if matches!(err, SigGenError::Cancelled { .. }) {
                    generator
                        .disable(Some(channel))
                        .await
                        .context("Failed to switch output off after interruption")?;
                }
                return Err(err.into());
            }
        }
    }

    if cancel.is_cancelled() {
        bail!("Interrupted");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    run(Cli::parse()).await
}
