//! `gkcard`: interactive console for exercising a GateKeeper Card.

use anyhow::Context;
use gatekeeper_card::domain::models::{CardEvent, MessageSeverity};
use gatekeeper_card::domain::settings::Settings;
use gatekeeper_card::infrastructure::bluetooth::platform_backend;
use gatekeeper_card::infrastructure::card::{CardClient, CardResponse};
use gatekeeper_card::infrastructure::logging::init_logger;
use gatekeeper_card::infrastructure::serial::{BluetoothConnector, Connector, DirectSerialConnector};
use gatekeeper_card::integration::{StatusReporter, SyncBridge};
use gatekeeper_card::{CardError, SettingsService};
use std::io::{self, BufRead, Write};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info};

const HELP: &str = "\
Commands:
  connect                 open the link to the card
  disconnect              close the link
  list <path>             list a directory under the base path
  mlst <path>             raw MLST of a card path
  get <path> [local]      download a file, optionally saving it locally
  put <path> <local>      upload a local file
  rename <from> <to>      rename a card path
  delete <path>           delete a file
  createpath <path>       create a directory under the base path
  deletepath <path>       remove a directory
  cwd <path>              change the working directory
  pwd                     print the working directory
  freememory              report free memory
  firmware [image]        show the firmware version, or upload an image
  help                    show this text
  exit                    quit";

fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new().context("loading settings")?;
    let settings = settings_service.get().clone();
    let _log_guard = init_logger(&settings.log_settings)?;
    info!("Settings loaded from {}", settings_service.path().display());

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    spawn_event_printer(event_rx)?;
    let reporter = StatusReporter::new(event_tx.clone());

    match settings.serial_port.clone() {
        Some(port) => {
            let connector =
                DirectSerialConnector::new(port, settings.baud_rate, settings.read_timeout());
            run_console(connector, &settings, event_tx, reporter)
        }
        None => {
            let backend = platform_backend().context("Bluetooth is not available")?;
            let connector = BluetoothConnector::from_settings(backend, &settings);
            run_console(connector, &settings, event_tx, reporter)
        }
    }
}

/// Print status events from a worker thread running its own runtime.
fn spawn_event_printer(mut event_rx: mpsc::UnboundedReceiver<CardEvent>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building event runtime")?;
    std::thread::Builder::new()
        .name("card-events".into())
        .spawn(move || {
            runtime.block_on(async move {
                while let Some(event) = event_rx.recv().await {
                    match event {
                        CardEvent::OperationStarted(label) => eprintln!("[..] {}", label),
                        CardEvent::OperationEnded(label) => eprintln!("[ok] {}", label),
                        CardEvent::ConnectionStatus(status) => eprintln!("[link] {:?}", status),
                        CardEvent::TransferProgress { bytes } => eprintln!("[xfer] {} bytes", bytes),
                        CardEvent::LogMessage(msg) => eprintln!("[{:?}] {}", msg.severity, msg.message),
                    }
                }
            })
        })
        .context("spawning event thread")?;
    Ok(())
}

fn run_console<C: Connector>(
    connector: C,
    settings: &Settings,
    event_tx: mpsc::UnboundedSender<CardEvent>,
    reporter: StatusReporter,
) -> anyhow::Result<()> {
    let mut client = CardClient::from_settings(connector, settings).with_events(event_tx);
    let mut bridge = SyncBridge::new().with_poll_interval(settings.poll_interval());

    println!("GateKeeper Card console. Type 'help' for commands.");
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = words.split_first() else {
            continue;
        };
        if command == "exit" {
            break;
        }

        let started = Instant::now();
        match execute(command, args, &mut client, &mut bridge, settings, &reporter) {
            Ok(()) => println!("({:.2}s)", started.elapsed().as_secs_f64()),
            Err(e) => {
                error!("{} failed: {:#}", command, e);
                reporter.message(format!("{}: {:#}", command, e), MessageSeverity::Error);
            }
        }
    }

    client.disconnect();
    info!("Console closed");
    Ok(())
}

fn execute<C: Connector>(
    command: &str,
    args: &[&str],
    client: &mut CardClient<C>,
    bridge: &mut SyncBridge,
    settings: &Settings,
    reporter: &StatusReporter,
) -> anyhow::Result<()> {
    let arg = |i: usize| required_arg(command, args, i);
    let path = args.first().copied().unwrap_or("");

    match command {
        "help" => println!("{}", HELP),
        "connect" => {
            let _status = reporter.begin("Connecting to the card...");
            bridge.run(|| client.connect())?;
        }
        "disconnect" => client.disconnect(),
        "list" => print_response(bridge.run(|| client.list(path))?)?,
        "mlst" => print_response(bridge.run(|| client.mlst(path))?)?,
        "freememory" => print_response(bridge.run(|| client.free_memory())?)?,
        "get" => {
            let card_path = arg(0)?;
            let response = {
                let _status = reporter.begin("Downloading file...");
                bridge.run(|| client.get_file(card_path))?
            };
            match args.get(1) {
                Some(local) => save_response(response, local)?,
                None => print_response(response)?,
            }
        }
        "put" => {
            let (card_path, local) = (arg(0)?, arg(1)?);
            let data = std::fs::read(local).with_context(|| format!("reading {}", local))?;
            let _status = reporter.begin("Uploading file...");
            print_response(bridge.run(|| client.put(card_path, &data))?)?;
        }
        "rename" => {
            let (from, to) = (arg(0)?, arg(1)?);
            println!("{}", bridge.run(|| client.rename(from, to))?);
        }
        "delete" => {
            let target = arg(0)?;
            println!("{}", bridge.run(|| client.delete(target))?);
        }
        "createpath" => {
            let target = arg(0)?;
            println!("{}", bridge.run(|| client.create_path(target))?);
        }
        "deletepath" => {
            let target = arg(0)?;
            println!("{}", bridge.run(|| client.delete_path(target))?);
        }
        "cwd" => {
            let target = arg(0)?;
            println!("{}", bridge.run(|| client.change_working_directory(target))?);
        }
        "pwd" => println!("{}", bridge.run(|| client.current_working_directory())?),
        "firmware" => firmware(args.first().copied(), client, bridge, settings, reporter)?,
        other => println!("Unknown command '{}'. Type 'help' for commands.", other),
    }
    Ok(())
}

fn required_arg<'a>(command: &str, args: &[&'a str], index: usize) -> anyhow::Result<&'a str> {
    args.get(index)
        .copied()
        .ok_or_else(|| anyhow::anyhow!("'{}' needs more arguments, see 'help'", command))
}

fn firmware<C: Connector>(
    image: Option<&str>,
    client: &mut CardClient<C>,
    bridge: &mut SyncBridge,
    settings: &Settings,
    reporter: &StatusReporter,
) -> anyhow::Result<()> {
    let path = settings.firmware_path.as_str();
    let Some(image) = image else {
        let _status = reporter.begin("Getting firmware version...");
        let version = bridge.run(|| client.firmware_version(path))?;
        println!("Current firmware version: {}", version);
        return Ok(());
    };

    let bytes = std::fs::read(image).with_context(|| format!("reading {}", image))?;
    {
        let _status = reporter.begin("Uploading firmware...");
        bridge.run(|| client.upload_firmware(path, &bytes))?;
    }
    let _status = reporter.begin("Updating firmware...");
    bridge.wait(Duration::from_secs(settings.firmware_settle_secs));
    reporter.message("Firmware uploaded", MessageSeverity::Success);
    Ok(())
}

fn print_response(mut response: CardResponse) -> anyhow::Result<()> {
    println!("{}", response);
    let data = response.read_data_to_string()?;
    if !data.is_empty() {
        println!("{}", data.trim_end());
    }
    Ok(())
}

fn save_response(response: CardResponse, local: &str) -> anyhow::Result<()> {
    println!("{}", response);
    let Some(mut data) = response.into_data()? else {
        return Err(CardError::TransferFailed("card sent no data".into()).into());
    };
    let mut file = std::fs::File::create(local).with_context(|| format!("creating {}", local))?;
    let written = io::copy(&mut data, &mut file)?;
    println!("Saved {} bytes to {}", written, local);
    Ok(())
}
