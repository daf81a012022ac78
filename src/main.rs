use anyhow::Result;
use lsled_controller::domain::connection::ConnectionCore;
use lsled_controller::domain::observer::{ChannelObserver, ListChange, PeripheralList};
use lsled_controller::domain::radio::{RadioAdapter, RadioEvent};
use lsled_controller::domain::settings::{Settings, SettingsService};
use lsled_controller::infrastructure::bluetooth::{ControllerHandle, ControllerService};
use lsled_controller::infrastructure::identity_store::JsonIdentityStore;
use lsled_controller::infrastructure::logging::init_logger;
use lsled_controller::presentation::console::{self, Command};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();
    let config_dir = SettingsService::config_dir()?;
    let log_guard = init_logger(&settings.log_settings, &config_dir)?;
    info!("Starting LS LED controller");
    if let Some(dir) = log_guard.log_dir() {
        eprintln!("Logs: {}", dir.display());
    }

    #[cfg(windows)]
    {
        let (radio_tx, radio_rx) = mpsc::unbounded_channel();
        let radio = lsled_controller::infrastructure::bluetooth::WinRtRadio::open(radio_tx).await?;
        run(radio, radio_rx, &settings, &config_dir).await
    }

    #[cfg(not(windows))]
    {
        drop((settings, config_dir));
        anyhow::bail!("No Bluetooth backend is available on this platform")
    }
}

#[cfg_attr(not(windows), allow(dead_code))]
async fn run<R: RadioAdapter + 'static>(
    radio: R,
    radio_events: mpsc::UnboundedReceiver<RadioEvent>,
    settings: &Settings,
    config_dir: &Path,
) -> Result<()> {
    let identity_path = config_dir.join("identity.json");
    let identity = JsonIdentityStore::open(identity_path);
    info!("Identity store at {}", identity.path().display());
    let core = ConnectionCore::new(radio, identity, settings.core_config());
    let (handle, task) = ControllerService::spawn(core, radio_events);

    let (observer, mut events) = ChannelObserver::channel();
    handle.subscribe(Box::new(observer)).await?;

    match settings.target() {
        Ok(fallback) => match handle.configure_default_target(fallback).await? {
            Some(target) => info!("Target selector {:?}", target),
            None => warn!("Target selector rejected"),
        },
        Err(e) => warn!("Invalid BLE target in settings: {}", e),
    }
    if settings.auto_scan_on_start {
        handle.start_scan()?;
    }

    println!("{}", console::HELP);
    let mut peripherals = PeripheralList::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match console::parse(&line, settings.default_brightness) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(e) = execute(&handle, &mut peripherals, command).await {
                            println!("error: {}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{}", e),
                }
            }
            Some(event) = events.recv() => {
                if let Some(ListChange::Added(index)) = peripherals.apply(&event) {
                    if let Some(p) = peripherals.get(index) {
                        println!("[{}] {} rssi {:?}", index, p.id, p.rssi);
                    }
                }
                if let Some(line) = console::describe(&event) {
                    println!("{}", line);
                }
            }
        }
    }

    info!("Shutting down");
    handle.shutdown()?;
    task.await?;
    Ok(())
}

#[cfg_attr(not(windows), allow(dead_code))]
async fn execute(
    handle: &ControllerHandle,
    peripherals: &mut PeripheralList,
    command: Command,
) -> Result<()> {
    match command {
        Command::Scan => handle.start_scan()?,
        Command::Stop => handle.stop_scan()?,
        Command::Rescan => {
            peripherals.clear();
            handle.rescan()?;
        }
        Command::List => {
            for (index, p) in peripherals.entries().iter().enumerate() {
                println!("[{}] {} rssi {:?}", index, p.id, p.rssi);
            }
        }
        Command::Connect(reference) => match reference.resolve(peripherals) {
            Some(id) => handle.connect(id)?,
            None => println!("no such peripheral, try `list`"),
        },
        Command::Forget => handle.forget_last_device()?,
        Command::Color(color) => {
            let outcome = handle.send(color.as_payload().to_vec()).await?;
            println!("{:?}", outcome);
        }
        Command::Send(bytes) => {
            let outcome = handle.send(bytes).await?;
            println!("{:?}", outcome);
        }
        Command::Status => {
            let state = handle.state().await?;
            let ready = handle.is_ready().await?;
            println!("state: {} (ready: {})", state, ready);
        }
        Command::Help => println!("{}", console::HELP),
        Command::Quit => {}
    }
    Ok(())
}
