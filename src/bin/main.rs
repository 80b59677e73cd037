use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;
use playout_conductor::{
    BasicResolver, ConductorEvent, ConductorOptions, DeviceRegistry, ShowConfig, Time,
    TimelineResolver, conductor_from_show, load_show, load_show_from,
};

#[derive(Parser)]
#[command(name = "playout-conductor")]
#[command(about = "Timeline-driven playout conductor")]
struct Cli {
    /// Show file (defaults to $CONDUCTOR_SHOW, then ./show.json)
    #[arg(long, global = true, env = "CONDUCTOR_SHOW")]
    show: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play the show until interrupted
    Run {
        /// Forward device debug output
        #[arg(long, default_value_t = false)]
        debug: bool,
        /// Start every device from its blank state
        #[arg(long, default_value_t = false)]
        initialize_as_clear: bool,
    },
    /// Print the resolved state at a point in time
    State {
        #[arg(long)]
        at: Time,
    },
    /// Print upcoming timeline events
    Events {
        #[arg(long, default_value_t = 0)]
        from: Time,
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
    /// List the device types this build can drive
    DeviceTypes,
}

fn show_from(path: Option<PathBuf>) -> Result<ShowConfig> {
    Ok(match path {
        Some(path) => load_show_from(&path)?,
        None => load_show()?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("playout_conductor=info".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            debug,
            initialize_as_clear,
        } => {
            let show = show_from(cli.show)?;
            info!(
                "Loaded show with {} device(s) and {} timeline object(s)",
                show.devices.len(),
                show.timeline.len()
            );

            let options = ConductorOptions {
                log_debug: debug,
                ..ConductorOptions::default()
            }
            .initialize_as_clear(initialize_as_clear);

            let conductor = conductor_from_show(show, options).await?;
            let mut events = conductor.subscribe();
            conductor.init();
            info!("Conductor running, press Ctrl-C to stop");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event @ ConductorEvent::TimelineCallback { .. })
                        | Ok(event @ ConductorEvent::SetTimelineTriggerTime { .. }) => {
                            println!("{}", serde_json::to_string(&event)?);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Event listener lagged, {} event(s) skipped", skipped)
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            info!("Shutting down");
            conductor.destroy().await?;
        }
        Commands::State { at } => {
            let show = show_from(cli.show)?;
            let state = BasicResolver::new().get_state(&show.timeline, at)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Events { from, count } => {
            let show = show_from(cli.show)?;
            let events = BasicResolver::new().get_next_events(&show.timeline, from, count)?;
            for event in events {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Commands::DeviceTypes => {
            for device_type in DeviceRegistry::with_defaults().list_types() {
                println!("{}", device_type);
            }
        }
    }

    Ok(())
}
