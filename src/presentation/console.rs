//! Console front-end commands.

use crate::domain::models::PeripheralId;
use crate::domain::observer::{CoreEvent, PeripheralList};
use crate::domain::protocol::LedColor;
use anyhow::{Context, Result};

pub const HELP: &str = "\
Commands:
  scan                       start scanning for the configured service
  stop                       stop scanning
  rescan                     restart the scan and clear the list
  list                       show discovered peripherals
  connect <index|id>         connect to a listed peripheral
  forget                     forget the last connected accessory
  color <r> <g> <b> [bright] send a colour (brightness 0-31)
  send <hex bytes>           send a raw payload, e.g. `send 0a 14 1e`
  status                     show connection state
  quit                       disconnect and exit";

/// Peripheral reference typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralRef {
    Index(usize),
    Id(PeripheralId),
}

impl PeripheralRef {
    pub fn resolve(&self, list: &PeripheralList) -> Option<PeripheralId> {
        match self {
            Self::Index(index) => list.get(*index).map(|p| p.id.clone()),
            Self::Id(id) => Some(id.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Scan,
    Stop,
    Rescan,
    List,
    Connect(PeripheralRef),
    Forget,
    Color(LedColor),
    Send(Vec<u8>),
    Status,
    Help,
    Quit,
}

/// Parse one input line. Empty lines yield `None`.
pub fn parse(line: &str, default_brightness: u8) -> Result<Option<Command>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match verb.to_lowercase().as_str() {
        "scan" => Command::Scan,
        "stop" => Command::Stop,
        "rescan" => Command::Rescan,
        "list" | "ls" => Command::List,
        "forget" => Command::Forget,
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        "connect" => {
            let target = args.first().context("usage: connect <index|id>")?;
            match target.parse::<usize>() {
                Ok(index) => Command::Connect(PeripheralRef::Index(index)),
                Err(_) => Command::Connect(PeripheralRef::Id(PeripheralId::new(*target))),
            }
        }
        "color" | "colour" => {
            if args.len() < 3 {
                anyhow::bail!("usage: color <r> <g> <b> [brightness]");
            }
            let channel = |s: &str| s.parse::<u8>().with_context(|| format!("bad channel `{}`", s));
            let brightness = match args.get(3) {
                Some(b) => channel(*b)?,
                None => default_brightness,
            };
            Command::Color(LedColor::new(
                channel(args[0])?,
                channel(args[1])?,
                channel(args[2])?,
                brightness,
            ))
        }
        "send" => {
            let bytes = args
                .iter()
                .map(|s| {
                    u8::from_str_radix(s.trim_start_matches("0x"), 16)
                        .with_context(|| format!("bad byte `{}`", s))
                })
                .collect::<Result<Vec<u8>>>()?;
            Command::Send(bytes)
        }
        other => anyhow::bail!("unknown command `{}` (try `help`)", other),
    };
    Ok(Some(command))
}

/// One-line rendering of a notification, or `None` for ones not worth printing.
pub fn describe(event: &CoreEvent) -> Option<String> {
    let line = match event {
        CoreEvent::PowerStateChanged(power) => format!("radio: {:?}", power),
        CoreEvent::StateChanged(state) => format!("state: {}", state),
        CoreEvent::PeripheralDiscovered { .. } | CoreEvent::RssiUpdated { .. } => return None,
        CoreEvent::Connected { id } => format!("connected to {}", id),
        CoreEvent::Disconnected { id, error } => match error {
            Some(e) => format!("disconnected from {}: {}", id, e),
            None => format!("disconnected from {}", id),
        },
        CoreEvent::ConnectFailed { id, error } => match error {
            Some(e) => format!("connection to {} failed: {}", id, e),
            None => format!("connection to {} failed", id),
        },
    };
    Some(line)
}
