use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use _core::logging::init_rust_logging;
use _core::sample::CHANNEL_LABELS;
use _core::{
    decode_settings, encode_settings, frame_payload, BluetoothConnector, ConfigurationProfile,
    CycleEnd, CycleMode, Leg, LegChannels, LogConsole, MenuCommand, SampleVector, SensorCheck,
    Session, SessionConfig, TelemetrySink, TrialPhase,
};

#[derive(Parser, Debug)]
#[command(name = "prex-link", about = "Talk to both legs of the knee brace")]
struct Args {
    /// Serial ports for the left and right legs (e.g. /dev/ttyACM0 /dev/ttyACM1)
    #[arg(long, num_args = 2, value_names = ["LEFT", "RIGHT"], conflicts_with = "bluetooth")]
    serial: Option<Vec<String>>,
    /// Bluetooth MAC addresses for the left and right legs
    #[arg(long, num_args = 2, value_names = ["LEFT_MAC", "RIGHT_MAC"])]
    bluetooth: Option<Vec<String>>,
    /// Pairing PIN code
    #[arg(long, default_value = "1234")]
    pin: String,
    /// Give up on a receive cycle after this many seconds
    #[arg(long)]
    cycle_timeout: Option<u64>,
    /// Sleep between idle polls, in milliseconds
    #[arg(long, default_value_t = 1)]
    idle_backoff_ms: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the settings strings for a profile without connecting
    Encode { profile: PathBuf },
    /// Upload a profile and echo what the legs reply
    Upload { profile: PathBuf },
    /// Upload a profile, run one trial and print samples to stdout
    Trial {
        profile: PathBuf,
        /// Trial number sent to the controllers
        #[arg(long, default_value_t = 1)]
        number: u32,
    },
    /// Run a sensor check (pot, fsr, torque, encoder, stim)
    Check { sensor: String },
    /// Echo menu output until both legs reach a prompt
    Listen,
    /// Tell both legs to stop
    Stop,
}

/// Prints samples as tab-separated lines, prefixed with the leg.
struct StdoutTelemetry;

impl TelemetrySink for StdoutTelemetry {
    fn sample(&mut self, leg: Leg, sample: &SampleVector) {
        let values: Vec<String> = sample.values().iter().map(f64::to_string).collect();
        println!("{}\t{}", leg, values.join("\t"));
    }
}

fn main() {
    init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    if let Command::Encode { profile } = &args.command {
        return encode(profile);
    }

    let mut session = connect(&args)?;
    let mut samples: Vec<(Leg, SampleVector)> = Vec::new();

    match args.command {
        Command::Encode { profile } => encode(&profile)?,
        Command::Upload { profile } => {
            let profile = load_profile(&profile)?;
            session.upload_settings(&profile)?;
            let report = session.run_cycle(CycleMode::Echo, &mut LogConsole, &mut samples);
            info!("upload finished: end={:?}, phase={:?}", report.end, session.phase());
        }
        Command::Trial { profile, number } => {
            let profile = load_profile(&profile)?;
            session.upload_settings(&profile)?;
            wait_for_start(&mut session)?;

            session.start_trial(number)?;
            println!("leg\t{}", CHANNEL_LABELS.join("\t"));
            let report = session.run_cycle(CycleMode::Telemetry, &mut LogConsole, &mut StdoutTelemetry);
            info!(
                "trial {} ended: end={:?}, samples left={} right={}",
                number,
                report.end,
                report.legs[Leg::Left].samples,
                report.legs[Leg::Right].samples
            );
            session.finish_trial()?;
        }
        Command::Check { sensor } => {
            let check: SensorCheck = sensor.parse()?;
            session.send_menu(MenuCommand::SensorCheck(check))?;
            session.run_cycle(CycleMode::Echo, &mut LogConsole, &mut samples);
        }
        Command::Listen => {
            session.run_cycle(CycleMode::Echo, &mut LogConsole, &mut samples);
        }
        Command::Stop => session.stop()?,
    }
    Ok(())
}

fn connect(args: &Args) -> Result<Session> {
    let channels = match (&args.serial, &args.bluetooth) {
        (Some(ports), _) => LegChannels::open_wired(&ports[0], &ports[1])
            .with_context(|| format!("Failed to open serial ports {} and {}", ports[0], ports[1]))?,
        (None, Some(macs)) => {
            let connector = BluetoothConnector {
                pin: args.pin.clone(),
                ..Default::default()
            };
            LegChannels::connect_wireless(&connector, &macs[0], &macs[1])
                .with_context(|| format!("Failed to connect to {} and {}", macs[0], macs[1]))?
        }
        (None, None) => bail!("pass --serial LEFT RIGHT or --bluetooth LEFT_MAC RIGHT_MAC"),
    };

    let config = SessionConfig {
        idle_backoff: Duration::from_millis(args.idle_backoff_ms),
        cycle_timeout: args.cycle_timeout.map(Duration::from_secs),
    };
    Ok(Session::new(channels, config))
}

fn load_profile(path: &Path) -> Result<ConfigurationProfile> {
    let profile = ConfigurationProfile::load(path)?;
    info!(
        "profile loaded: path={}, fsm={:?}, controller={:?}",
        path.display(),
        profile.fsm,
        profile.controller
    );
    Ok(profile)
}

fn encode(path: &Path) -> Result<()> {
    let profile = load_profile(path)?;
    for leg in Leg::BOTH {
        let command = encode_settings(&profile, leg)?;
        let decoded = decode_settings(command.as_str())?;
        println!("{}: {}", leg, frame_payload(command.as_str()));
        for (field, value) in &decoded.fields {
            println!("  {:<40} {}", field, value);
        }
    }
    Ok(())
}

/// Echo menu cycles until both legs report ready to start.
fn wait_for_start(session: &mut Session) -> Result<()> {
    let mut samples: Vec<(Leg, SampleVector)> = Vec::new();
    while session.phase() != TrialPhase::Running {
        let report = session.run_cycle(CycleMode::Echo, &mut LogConsole, &mut samples);
        match report.end {
            CycleEnd::Cancelled | CycleEnd::TimedOut => {
                bail!("legs did not become ready: {:?}", report.end)
            }
            _ if session.phase() == TrialPhase::Idle => {
                bail!("legs ended the menu without accepting the settings")
            }
            _ => {}
        }
    }
    Ok(())
}
