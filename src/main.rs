use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

use idasen_control::config::{Config, PresetSlot};
use idasen_control::desk::{ConnectionState, DeskController, DeskEvent, Intent};

fn print_help() {
    println!("Commands:");
    println!("  discover          scan for a desk and remember its address");
    println!("  connect           connect to the remembered desk");
    println!("  up / down         start moving (keeps moving until 'stop')");
    println!("  stop              release the movement buttons");
    println!("  sit / stand       move to a remembered position");
    println!("  goto <meters>     move to a height, e.g. 'goto 1.10'");
    println!("  save sit|stand    remember the current height");
    println!("  height            show the latest known height");
    println!("  quit              stop the desk and exit");
}

async fn connect_interactive(controller: &DeskController) {
    let Some(identity) = controller.saved_identity() else {
        println!("No desk configured yet, run 'discover' first.");
        return;
    };
    // interactive connects fail fast instead of retrying
    match controller.connect(identity.clone(), 0).await {
        Ok(()) => println!("Connected to desk {}", identity),
        Err(e) => println!("Could not connect to desk {}: {}", identity, e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("Starting idasen-control");

    let config = Config::load()?;
    let controller = DeskController::new(config);

    // Print desk events as they arrive
    if let Some(mut events) = controller.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    DeskEvent::HeightChanged(height) => println!("height: {}", height),
                    DeskEvent::ReachedTarget(target) => println!("reached target {:.2}m", target),
                    DeskEvent::TargetRejected(target) => {
                        println!("target {:.2}m is outside the desk's range", target)
                    }
                    DeskEvent::Stalled => println!("desk stopped responding, move cancelled"),
                    DeskEvent::Fault(reason) => println!("desk disabled: {}", reason),
                }
            }
        });
    }

    // Best-effort connect to the remembered desk at startup
    if let Some(identity) = controller.saved_identity() {
        log::info!("Trying remembered desk {}...", identity);
        if let Err(e) = controller.connect(identity, controller.connect_retries()).await {
            log::warn!("Could not connect to remembered desk: {}", e);
        }
    }

    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("discover") => match controller.discover_desk().await {
                Some(identity) => {
                    println!("Found desk {}", identity);
                    connect_interactive(&controller).await;
                }
                None => println!(
                    "Unable to discover a desk. Make sure it is paired to this computer."
                ),
            },
            Some("connect") => connect_interactive(&controller).await,
            Some("up") => controller.set_intent(Intent::ManualUp),
            Some("down") => controller.set_intent(Intent::ManualDown),
            Some("stop") => controller.set_intent(Intent::None),
            Some("sit") => {
                controller.set_intent(Intent::MoveTo(controller.position(PresetSlot::Sit)))
            }
            Some("stand") => {
                controller.set_intent(Intent::MoveTo(controller.position(PresetSlot::Stand)))
            }
            Some("goto") => match words.next().and_then(|w| w.parse::<f64>().ok()) {
                Some(meters) => controller.set_intent(Intent::MoveTo(meters)),
                None => println!("Usage: goto <meters>"),
            },
            Some("save") => {
                let slot = match words.next() {
                    Some("sit") => Some(PresetSlot::Sit),
                    Some("stand") => Some(PresetSlot::Stand),
                    _ => None,
                };
                match slot {
                    Some(slot) => match controller.save_position(slot) {
                        Ok(meters) => println!("Saved {} position: {:.2}m", slot.name(), meters),
                        Err(e) => println!("Could not save position: {}", e),
                    },
                    None => println!("Usage: save sit|stand"),
                }
            }
            Some("height") => match controller.snapshot() {
                Some(state) => println!("height: {} ({:?})", state.height, state.mode),
                None => match controller.connection_state() {
                    ConnectionState::Faulted { reason } => println!("desk faulted: {}", reason),
                    _ => println!("not connected"),
                },
            },
            Some("quit") | Some("q") => break,
            Some(_) => print_help(),
            None => {}
        }
    }

    controller.shutdown().await;
    log::info!("Goodbye");
    Ok(())
}
