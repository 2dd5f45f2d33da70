// beacons: command-line host for the beacon registry
//
// Each invocation plays one host session: initialize the registry (restoring
// whatever was active last time), run the command, print the events it caused.

mod config;

use anyhow::{Context, Result};
use beacons_core::{
    ActiveState, AdvertiseMode, AdvertiseSettings, Advertiser, AppContext, Beacon, BeaconEvent,
    BeaconKind, BeaconRegistry, BleService, EventKind, LocalBroadcaster, SledOpener,
    TxPowerLevel,
};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::Receiver;

#[derive(Parser)]
#[command(name = "beacons")]
#[command(about = "Manage persisted BLE beacon definitions", long_about = None)]
#[command(version)]
struct Cli {
    /// Override the configured storage directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore active beacons and report what came back
    Restore,
    /// List active beacons, or stopped ones with --stopped
    List {
        #[arg(long)]
        stopped: bool,
    },
    /// Create a beacon and start advertising it
    Add {
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long, value_enum, default_value = "ibeacon")]
        kind: KindArg,
        /// Advertisement payload as hex
        #[arg(short, long, default_value = "")]
        payload: String,
        #[arg(long, value_enum, default_value = "balanced")]
        mode: ModeArg,
        #[arg(long, value_enum, default_value = "medium")]
        tx_power: PowerArg,
        #[arg(long)]
        connectable: bool,
        /// Save it paused instead of advertising
        #[arg(long)]
        paused: bool,
    },
    /// Show one beacon by storage id
    Show { id: i64 },
    /// Stop an active beacon
    Stop { id: i64 },
    /// Pause an active beacon
    Pause { id: i64 },
    /// Resume a paused beacon
    Resume { id: i64 },
    /// Delete a stopped beacon
    Delete { id: i64 },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Ibeacon,
    EddystoneUid,
    EddystoneUrl,
    Altbeacon,
    Raw,
}

impl From<KindArg> for BeaconKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Ibeacon => BeaconKind::IBeacon,
            KindArg::EddystoneUid => BeaconKind::EddystoneUid,
            KindArg::EddystoneUrl => BeaconKind::EddystoneUrl,
            KindArg::Altbeacon => BeaconKind::AltBeacon,
            KindArg::Raw => BeaconKind::Raw,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    LowPower,
    Balanced,
    LowLatency,
}

impl From<ModeArg> for AdvertiseMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::LowPower => AdvertiseMode::LowPower,
            ModeArg::Balanced => AdvertiseMode::Balanced,
            ModeArg::LowLatency => AdvertiseMode::LowLatency,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PowerArg {
    UltraLow,
    Low,
    Medium,
    High,
}

impl From<PowerArg> for TxPowerLevel {
    fn from(arg: PowerArg) -> Self {
        match arg {
            PowerArg::UltraLow => TxPowerLevel::UltraLow,
            PowerArg::Low => TxPowerLevel::Low,
            PowerArg::Medium => TxPowerLevel::Medium,
            PowerArg::High => TxPowerLevel::High,
        }
    }
}

/// Stands in for the radio: logs what would go on air
struct ConsoleAdvertiser;

impl Advertiser for ConsoleAdvertiser {
    fn start_advertising(&self, beacon: &Beacon) -> Result<(), String> {
        tracing::info!(
            "Advertising {} ({}, {} bytes)",
            beacon.display_name(),
            beacon.kind(),
            beacon.payload().len()
        );
        Ok(())
    }

    fn stop_advertising(&self, beacon: &Beacon) -> Result<(), String> {
        tracing::info!("Stopped advertising {}", beacon.display_name());
        Ok(())
    }
}

/// One host session wired up the way a platform host would
struct Session {
    registry: Arc<BeaconRegistry>,
    service: Arc<BleService>,
    events: Receiver<BeaconEvent>,
}

impl Session {
    fn open(config: &config::Config, data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => config.data_dir()?,
        };
        let context = Arc::new(AppContext::new(
            config.package.clone(),
            data_dir,
            config.api_level,
        ));

        let bus = Arc::new(LocalBroadcaster::default());
        let events = bus.subscribe();
        let service = Arc::new(BleService::new(Arc::new(ConsoleAdvertiser), bus.clone()));
        let registry = Arc::new(BeaconRegistry::new(
            config.registry.clone(),
            Arc::new(SledOpener),
            service.clone(),
            bus,
        )?);
        service.attach(&registry);

        registry
            .initialize(&context)
            .context("Failed to initialize beacon registry")?;

        Ok(Self {
            registry,
            service,
            events,
        })
    }

    fn active(&self, id: i64) -> Result<Arc<Beacon>> {
        self.registry
            .find_active_by_storage_id(id)?
            .with_context(|| format!("No active beacon with id {}", id))
    }

    fn print_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            let label = match event.kind {
                EventKind::Added => "added".bright_green(),
                EventKind::Started => "on air".bright_green(),
                EventKind::Paused => "paused".yellow(),
                EventKind::Stopped => "stopped".bright_red(),
                EventKind::Failed => "failed".red().bold(),
            };
            println!(
                "  {} {} {}",
                "•".dimmed(),
                event.beacon.display_name().bright_cyan(),
                label
            );
        }
    }

    /// Release the context; the active set stays persisted for the next run
    fn close(mut self) {
        self.print_events();
        self.registry.shutdown();
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { action } => cmd_config(action),
        command => {
            let config = config::Config::load()?;
            let mut session = Session::open(&config, cli.data_dir)?;
            let result = run(&mut session, command);
            session.close();
            result
        }
    }
}

fn run(session: &mut Session, command: Commands) -> Result<()> {
    match command {
        Commands::Restore => cmd_restore(session),
        Commands::List { stopped } => cmd_list(session, stopped),
        Commands::Add {
            name,
            kind,
            payload,
            mode,
            tx_power,
            connectable,
            paused,
        } => {
            let payload = hex::decode(payload.trim()).context("Payload must be hex")?;
            let settings = AdvertiseSettings {
                mode: mode.into(),
                tx_power: tx_power.into(),
                connectable,
            };
            let mut beacon = Beacon::new(kind.into(), payload).with_settings(settings);
            if let Some(name) = name {
                beacon = beacon.with_name(name);
            }
            if paused {
                beacon = beacon.with_active_state(ActiveState::Paused);
            }
            cmd_add(session, beacon)
        }
        Commands::Show { id } => cmd_show(session, id),
        Commands::Stop { id } => cmd_stop(session, id),
        Commands::Pause { id } => cmd_pause(session, id, true),
        Commands::Resume { id } => cmd_pause(session, id, false),
        Commands::Delete { id } => cmd_delete(session, id),
        Commands::Config { action } => cmd_config(action),
    }
}

fn cmd_restore(session: &mut Session) -> Result<()> {
    let active = session.registry.get_active()?;

    println!("{}", "Beacon registry".bold());
    println!("  Restored: {}", active.len());
    println!("  Service:  {}", session.service.get_state());
    println!("  On air:   {}", session.service.advertising().len());
    println!();
    session.print_events();

    Ok(())
}

fn cmd_list(session: &mut Session, stopped: bool) -> Result<()> {
    let beacons: Vec<Arc<Beacon>> = if stopped {
        session
            .registry
            .stopped_beacons()?
            .into_iter()
            .map(Arc::new)
            .collect()
    } else {
        session.registry.get_active()?.snapshot()
    };

    let title = if stopped { "Stopped beacons" } else { "Active beacons" };
    if beacons.is_empty() {
        println!("{}", format!("No {}.", title.to_lowercase()).dimmed());
        return Ok(());
    }

    println!("{} ({} total)", title.bold(), beacons.len());
    println!();
    for beacon in beacons {
        println!(
            "  {} {:>4}  {}",
            "•".bright_green(),
            beacon.saved_id(),
            beacon.display_name().bright_cyan()
        );
        println!(
            "          {} · {} · {}",
            beacon.kind(),
            beacon.active_state(),
            beacon.advertise_state().to_string().dimmed()
        );
    }

    Ok(())
}

fn cmd_add(session: &mut Session, beacon: Beacon) -> Result<()> {
    let beacon = session.registry.add(beacon)?;

    println!("{} Beacon saved:", "✓".green());
    println!("  ID:    {}", beacon.saved_id().to_string().bright_cyan());
    println!("  Kind:  {}", beacon.kind());
    println!("  State: {}", beacon.active_state());
    session.print_events();

    Ok(())
}

fn cmd_show(session: &mut Session, id: i64) -> Result<()> {
    let beacon = session
        .registry
        .get_saved(id)?
        .with_context(|| format!("No beacon with id {}", id))?;
    let settings = beacon.settings();

    println!("{}", "Beacon Details".bold());
    println!("  Name:        {}", beacon.display_name().bright_cyan());
    println!("  ID:          {}", beacon.saved_id());
    println!("  Kind:        {}", beacon.kind());
    println!("  State:       {}", beacon.active_state());
    println!("  Radio:       {}", beacon.advertise_state());
    println!("  Mode:        {:?}", settings.mode);
    println!("  Tx power:    {:?}", settings.tx_power);
    println!("  Connectable: {}", settings.connectable);
    println!(
        "  Payload:     {}",
        hex::encode(beacon.payload()).bright_yellow()
    );
    println!("  Created:     {}", format_timestamp(beacon.created_at()));

    Ok(())
}

fn cmd_stop(session: &mut Session, id: i64) -> Result<()> {
    let beacon = session.active(id)?;
    session.registry.stop(beacon.uuid())?;

    println!(
        "{} Stopped beacon: {}",
        "✓".green(),
        beacon.display_name().bright_cyan()
    );
    session.print_events();
    Ok(())
}

fn cmd_pause(session: &mut Session, id: i64, paused: bool) -> Result<()> {
    let beacon = session.active(id)?;
    session.registry.set_paused(beacon.uuid(), paused)?;

    let verb = if paused { "Paused" } else { "Resumed" };
    println!(
        "{} {} beacon: {}",
        "✓".green(),
        verb,
        beacon.display_name().bright_cyan()
    );
    session.print_events();
    Ok(())
}

fn cmd_delete(session: &mut Session, id: i64) -> Result<()> {
    if session.registry.delete(id)? {
        println!("{} Deleted beacon {}", "✓".green(), id);
    } else {
        anyhow::bail!("No beacon with id {}", id);
    }
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

fn format_timestamp(timestamp: u64) -> String {
    use chrono::{DateTime, Local, Utc};

    let dt = DateTime::from_timestamp(timestamp as i64, 0).unwrap_or_else(Utc::now);
    let local: DateTime<Local> = dt.into();

    local.format("%Y-%m-%d %H:%M:%S").to_string()
}
