use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{
    apdu::{ApduCommand, ApduResponse},
    backend::{PcscBackend, ReaderBackend},
    config::{AppConfig, ContextScope},
    sequencer::CommandSequencer,
    session::CardSession,
    transmitter::{ApduTransmitter, ExchangeRecord},
    utils::{describe_status_word, format_ascii, format_hex, format_hex_dump, format_hex_spaced},
};

#[derive(Parser)]
#[command(name = "sim-sms-reader")]
#[command(about = "Read the SMS file of a SIM card through a PCSC reader")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Reader name or index (defaults to the first reader)
    #[arg(short, long, global = true)]
    pub reader: Option<String>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Give up on a transmit after this many milliseconds (0 waits forever)
    #[arg(short, long, global = true)]
    pub timeout_ms: Option<u64>,

    /// PCSC context scope: user or system
    #[arg(short, long, global = true)]
    pub scope: Option<ContextScope>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List available PCSC readers
    List {
        /// Show the ATR of inserted cards
        #[arg(short = 'l', long)]
        detailed: bool,
    },

    /// Send a single APDU
    Transmit {
        /// APDU command in hex format (e.g., "A0 A4 00 00 02 7F 10")
        apdu: String,

        /// Response rendering
        #[arg(short, long)]
        format: Option<ResponseFormat>,
    },

    /// Select DF telecom / EF SMS and read the first SMS record
    ReadSms {
        /// Rendering of the SMS record
        #[arg(short, long)]
        format: Option<ResponseFormat>,

        /// Write the exchange history as JSON to this file
        #[arg(short, long)]
        export: Option<PathBuf>,
    },

    /// Run the APDUs of a script file in order
    Script {
        /// Script file, one "[name:] <hex apdu>" per line
        file: PathBuf,

        /// Write the exchange history as JSON to this file
        #[arg(short, long)]
        export: Option<PathBuf>,
    },
}

#[derive(Clone, Debug)]
pub enum ResponseFormat {
    Hex,
    HexSpaced,
    HexDump,
    Ascii,
    All,
}

impl std::str::FromStr for ResponseFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hex" => Ok(ResponseFormat::Hex),
            "spaced" => Ok(ResponseFormat::HexSpaced),
            "dump" => Ok(ResponseFormat::HexDump),
            "ascii" => Ok(ResponseFormat::Ascii),
            "all" => Ok(ResponseFormat::All),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

/// Command line values layered over the config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub scope: ContextScope,
    pub reader: Option<String>,
    pub timeout: Option<Duration>,
}

impl Settings {
    pub fn resolve(cli: &Cli, config: AppConfig) -> Self {
        let merged = AppConfig {
            scope: cli.scope.unwrap_or(config.scope),
            reader: cli.reader.clone().or(config.reader),
            transmit_timeout_ms: cli.timeout_ms.or(config.transmit_timeout_ms),
        };

        Self {
            scope: merged.scope,
            timeout: merged.transmit_timeout(),
            reader: merged.reader,
        }
    }
}

pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug {
        log::LevelFilter::Debug
    } else if cli.verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .init();

    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    let settings = Settings::resolve(&cli, config);

    match &cli.command {
        Commands::List { detailed } => cmd_list(&settings, *detailed),
        Commands::Transmit { apdu, format } => cmd_transmit(&settings, apdu, format.clone()),
        Commands::ReadSms { format, export } => {
            cmd_read_sms(&settings, format.clone(), export.as_deref())
        }
        Commands::Script { file, export } => cmd_script(&settings, file, export.as_deref()),
    }
}

fn cmd_list(settings: &Settings, detailed: bool) -> Result<()> {
    let mut session = new_session(settings)?;
    let readers = session.list_readers().context("Failed to list readers")?;

    if readers.is_empty() {
        println!("No PCSC readers found.");
        return Ok(());
    }

    println!("Available PCSC readers:");
    for (i, name) in readers.iter().enumerate() {
        println!("  [{i}] {name}");
        if !detailed {
            continue;
        }

        match session.connect(name) {
            Ok(protocol) => {
                println!("      Protocol: {protocol}");
                if let Some(atr) = session.atr() {
                    println!("      ATR: {}", format_hex_spaced(&atr));
                }
                session.disconnect();
            }
            Err(e) => println!("      Status: {e}"),
        }
    }

    Ok(())
}

fn cmd_transmit(settings: &Settings, apdu_hex: &str, format: Option<ResponseFormat>) -> Result<()> {
    let command = ApduCommand::from_hex(apdu_hex)?;
    let session = open_session(settings)?;

    let mut transmitter = ApduTransmitter::new();
    let response = transmitter
        .transmit(&session, &command, settings.timeout)
        .context("Failed to execute transmit command")?;

    println!("APDU: {command}");
    print_response(response.as_bytes(), &format.unwrap_or(ResponseFormat::HexSpaced));
    print_status(&response);
    if let Some(record) = transmitter.history().last() {
        println!("Duration: {}ms", record.duration_ms);
    }

    Ok(())
}

fn cmd_read_sms(
    settings: &Settings,
    format: Option<ResponseFormat>,
    export: Option<&Path>,
) -> Result<()> {
    let session = open_session(settings)?;
    let mut sequencer = CommandSequencer::sim_sms().with_timeout(settings.timeout);

    let outcome = sequencer.run_sequence(&session);
    print_exchanges(sequencer.transmitter().history());
    if let Some(path) = export {
        export_history(sequencer.transmitter(), path)?;
    }

    let responses = outcome.context("SMS read sequence aborted")?;
    if let Some(sms) = CommandSequencer::payload(&responses) {
        println!();
        println!("SMS:");
        print_response(sms.as_bytes(), &format.unwrap_or(ResponseFormat::HexSpaced));
        print_status(sms);
    }

    Ok(())
}

fn cmd_script(settings: &Settings, file: &Path, export: Option<&Path>) -> Result<()> {
    let script = fs::read_to_string(file)
        .with_context(|| format!("Failed to open script file: {}", file.display()))?;
    let mut sequencer = CommandSequencer::from_script(&script)
        .with_context(|| format!("Failed to parse script file: {}", file.display()))?
        .with_timeout(settings.timeout);

    let session = open_session(settings)?;

    println!("Executing script: {}", file.display());
    let outcome = sequencer.run_sequence(&session);

    for (step, record) in sequencer.steps().iter().zip(sequencer.transmitter().history()) {
        println!("{}", step.name);
        let (sent, received) = record.log_lines();
        println!("  {sent}");
        println!("  {received}");
    }
    if let Some(path) = export {
        export_history(sequencer.transmitter(), path)?;
    }

    let responses = outcome.context("Script execution stopped")?;
    let stats = sequencer.transmitter().statistics();
    println!(
        "Script execution completed: {} commands, average {}ms",
        responses.len(),
        stats.average_duration_ms
    );

    Ok(())
}

fn new_session(settings: &Settings) -> Result<CardSession> {
    let backend = PcscBackend::establish(settings.scope.into())
        .context("Failed to establish PCSC context")?;
    Ok(CardSession::new(backend))
}

fn open_session(settings: &Settings) -> Result<CardSession> {
    let mut session = new_session(settings)?;
    let reader_name = resolve_reader_name(&session, settings.reader.as_deref())?;

    let protocol = session
        .connect(&reader_name)
        .with_context(|| format!("Failed to connect to reader: {reader_name}"))?;
    println!("Connected to {reader_name} ({protocol})");

    Ok(session)
}

/// Pick a reader by index, by name, or the first one when none is given
pub fn resolve_reader_name<B: ReaderBackend>(
    session: &CardSession<B>,
    name_or_index: Option<&str>,
) -> Result<String> {
    if let Some(name) = name_or_index {
        if name.parse::<usize>().is_err() {
            return Ok(name.to_string());
        }
    }

    let readers = session.list_readers().context("Failed to list readers")?;
    if readers.is_empty() {
        bail!("No PCSC readers found");
    }

    let index = match name_or_index {
        Some(index) => index.parse::<usize>().context("Invalid reader index")?,
        None => 0,
    };

    readers.get(index).cloned().with_context(|| {
        format!(
            "Reader index {} out of range (0-{})",
            index,
            readers.len() - 1
        )
    })
}

fn export_history(transmitter: &ApduTransmitter, path: &Path) -> Result<()> {
    let json = transmitter.export_history()?;
    fs::write(path, json)
        .with_context(|| format!("Failed to write history to {}", path.display()))?;
    println!("History written to {}", path.display());
    Ok(())
}

fn print_exchanges(history: &[ExchangeRecord]) {
    for record in history {
        let (sent, received) = record.log_lines();
        println!("{sent}");
        println!("{received}");
    }
}

fn print_status(response: &ApduResponse) {
    match response.status_word() {
        Some((sw1, sw2)) => println!(
            "Status: {:02X} {:02X} ({})",
            sw1,
            sw2,
            describe_status_word(sw1, sw2)
        ),
        None => println!("Status: (missing)"),
    }
}

fn print_response(data: &[u8], format: &ResponseFormat) {
    if data.is_empty() {
        println!("Response: (empty)");
        return;
    }

    match format {
        ResponseFormat::Hex => {
            println!("Response: {}", format_hex(data));
        }
        ResponseFormat::HexSpaced => {
            println!("Response: {}", format_hex_spaced(data));
        }
        ResponseFormat::HexDump => {
            println!("Response:");
            println!("{}", format_hex_dump(data));
        }
        ResponseFormat::Ascii => {
            println!("Response (ASCII): {}", format_ascii(data));
        }
        ResponseFormat::All => {
            println!("Response (Hex): {}", format_hex_spaced(data));
            println!("Response (ASCII): {}", format_ascii(data));
            if data.len() > 16 {
                println!("Response (Dump):");
                println!("{}", format_hex_dump(data));
            }
        }
    }
}
