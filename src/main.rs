//! mcpd Implementierung
//! Lizenz: GPL V3
//! Daniel Sigg
//!
//! Daemon für das Märklin CAN Protokoll (MCP) über UDP, TCP, Seriell und CAN

use configparser::ini::Ini;
use log::{debug, error, info, warn};
use nix::{
  libc::{SIGHUP, SIGINT, SIGQUIT, SIGTERM},
  unistd::{fork, ForkResult::Parent},
};
use signal_hook::iterator::Signals;
use std::{
  collections::HashMap,
  env, fs,
  path::Path,
  sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{self, Receiver, RecvTimeoutError},
    Arc,
  },
  thread,
  time::Duration,
};

use mcpd::{
  layout_storage::{FileStorage, LayoutStorage, MemoryStorage},
  layout_world::{BoosterState, Layout, LayoutEvent},
  mcp_commands::booster,
  mcp_dispatcher::NodeIdentity,
  mcp_server_tcp::Cs2Server,
  mcp_server_types::{
    ClientInterface, FrameBroadcast, InterfaceContext, InterfaceHandle, McpInterface,
  },
};

/// PID Filename
const PID_FILE: &str = "/var/run/mcpd.pid";
/// Wartezeit Beobachter bis das Run Flag wieder geprüft wird
const OBSERVER_TIMEOUT: Duration = Duration::from_millis(200);

/// Liefert alle vorhandenen Interfaces zurück
fn get_alle_interfaces() -> Vec<Box<dyn McpInterface>> {
  #[allow(unused_mut)]
  let mut interfaces: Vec<Box<dyn McpInterface>> = vec![
    Box::new(ClientInterface::udp()),
    Box::new(ClientInterface::tcp()),
    Box::new(ClientInterface::serial()),
    Box::new(Cs2Server::new()),
  ];
  #[cfg(feature = "socketcan")]
  interfaces.push(Box::new(ClientInterface::can()));
  interfaces
}

///Kommandozeilenparameter
#[derive(Debug)]
struct CmdLineConfig {
  //Zu verwendendes Configfile, Default ist /etc/mcpd.conf
  config_file: String,
  //fork() ja/nein. Default: ja
  fork: bool,
}

impl CmdLineConfig {
  /// Liefert die aus den Kommandozeilen Argumenten gelesen Konfiguration zurück.
  /// Err mit Fehlertext -> Hilfetextausgabe, Programmabruch
  /// -? -> Hilfetext, Programmabruch
  /// -n -> No fork()
  /// -f configfile -> zu verwendendes Configfile
  /// # Arguments
  /// * args - Kommandozeilenargumente
  fn parse_cmd_line(mut args: impl Iterator<Item = String>) -> Result<CmdLineConfig, String> {
    //Ignoriere arg[0], eigener Pfad
    args.next();
    //Defaults
    let mut cmd_line_config = CmdLineConfig {
      config_file: format!("/etc/{}.conf", env!("CARGO_PKG_NAME")),
      fork: true,
    };
    while let Some(val) = args.next() {
      match val.as_str() {
        "-?" => {
          return Err("".to_string());
        }
        "-n" => {
          cmd_line_config.fork = false;
        }
        "-f" => {
          cmd_line_config.config_file = match args.next() {
            Some(val) => val,
            _ => return Err("-f ohne Configfile".to_string()),
          }
        }
        _ => {
          return Err(format!("Unbekannter Parameter {val}"));
        }
      }
    }
    Ok(cmd_line_config)
  }
}

/// UID aus dem Konfigfile, hex mit oder ohne 0x
fn parse_uid(value: &str) -> Result<u32, String> {
  let value = value.trim();
  let hex = value
    .strip_prefix("0x")
    .or_else(|| value.strip_prefix("0X"))
    .unwrap_or(value);
  u32::from_str_radix(hex, 16)
    .ok()
    .ok_or(format!("[mcp] uid muss eine Hex Zahl sein: {}", value))
}

/// Wert aus einem Abschnitt des Konfigfiles, None wenn Abschnitt oder Wert fehlt
fn get_config_string(
  config_file_values: &HashMap<String, HashMap<String, Option<String>>>, section: &str, key: &str,
) -> Option<String> {
  config_file_values.get(section)?.get(key)?.clone()
}

///Main
fn main() {
  env::set_var("RUST_BACKTRACE", "1");
  if env::var("RUST_LOG").is_err() {
    env::set_var("RUST_LOG", "INFO");
  }
  env_logger::builder().format_timestamp_millis().init();
  if let Err(msg) = start(env::args()) {
    error!("Start Error: {}", msg);
  }
}

/// Booster aus auf allen Interfaces wenn Programm terminiert wird, danach Ende aller Threads
/// # Arguments
/// * signals - Zu überwachende Signale
/// * interfaces - alle Verbindungen aller gestarteten Interfaces
/// * identity - Eigene UID / Hash
/// * run - wird gelöscht
fn terminate_poweroff(
  mut signals: Signals, interfaces: Vec<(String, FrameBroadcast)>,
  identity: Arc<NodeIdentity>, run: Arc<AtomicBool>,
) {
  if let Some(signal) = signals.forever().next() {
    info!("Signal {} empfangen, Booster aus", signal);
    let frame = booster(identity.hash(), BoosterState::Stop);
    for (name, broadcast) in &interfaces {
      debug!("Booster aus auf {}", name);
      broadcast.send(&frame, None);
    }
    //Kurze Pause damit alles ausgeschaltet werden kann
    thread::sleep(Duration::from_millis(200));
    run.store(false, Ordering::SeqCst);
  }
}

/// Beobachter aller Änderungen der Anlage: Log und Speicherung der geänderten Objekte
/// # Arguments
/// * rx - Alle Events der Anlage
/// * layout - Zustand der Anlage
/// * storage - Speicherung
/// * run - false -> Ende
fn observe_layout(
  rx: Receiver<LayoutEvent>, layout: Arc<Layout>, storage: Arc<dyn LayoutStorage>,
  run: Arc<AtomicBool>,
) {
  while run.load(Ordering::SeqCst) {
    let event = match rx.recv_timeout(OBSERVER_TIMEOUT) {
      Ok(event) => event,
      Err(RecvTimeoutError::Timeout) => continue,
      Err(RecvTimeoutError::Disconnected) => break,
    };
    info!("Event {:?}", event);
    let Some(id) = event.changed_object() else {
      continue;
    };
    match layout.serialize(&id) {
      Some(record) => {
        if let Err(err) = storage.save(&id, record) {
          warn!("{} konnte nicht gespeichert werden: {}", id, err);
        }
      }
      None => debug!("{} nicht vorhanden, keine Speicherung", id),
    }
  }
}

///PID File schreiben
/// # Arguments
/// * pid - Aktuelle, zu schreibende PID
fn write_pidfile(pid: i32) {
  if fs::write(PID_FILE, pid.to_string()).is_err() {
    warn!("PID konnte nicht gespeichert werden.");
  }
}

///PID File löschen
fn del_pidfile() {
  fs::remove_file(PID_FILE).unwrap_or(());
}

///Start mcpd
/// # Arguments
/// * args - Kommandozeilenargumente
fn start(args: impl Iterator<Item = String>) -> Result<(), String> {
  println!(
    "{} V{} {}",
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_VERSION"),
    env!("CARGO_PKG_HOMEPAGE")
  );
  let cmd_line_config = match CmdLineConfig::parse_cmd_line(args) {
    Ok(v) => v,
    Err(message) => {
      println!("Aufruf: {} [-n] [-f configfile]", env!("CARGO_PKG_NAME"));
      println!("-n No fork()");
      println!("-f configfile Verwende configfile");
      println!("{message}");
      return Ok(());
    }
  };
  //fork() wenn notwendig
  if cmd_line_config.fork {
    info!("fork()");
    let pid = unsafe { fork() };
    if let Parent { child: child_pid } =
      pid.map_err(|err| format!("Fork Failed: Unable to create child process! {}", err))?
    {
      //PID File schreiben
      write_pidfile(child_pid.into());
      return Ok(());
    }
  }
  //Configfile lesen
  let mut config = Ini::new();
  let config_file_values = config.load(&cmd_line_config.config_file).map_err(|err| {
    format!(
      "Configfile {} kann nicht gelesen werden: {}",
      cmd_line_config.config_file, err
    )
  })?;
  //Eigene UID, ohne Angabe zufällig
  let identity = Arc::new(match get_config_string(&config_file_values, "mcp", "uid") {
    Some(uid) => NodeIdentity::new(parse_uid(&uid)?),
    None => NodeIdentity::random(),
  });
  info!(
    "UID 0x{:08X} Hash 0x{:04X}",
    identity.uid(),
    identity.hash()
  );
  //Anlage laden
  let storage: Arc<dyn LayoutStorage> =
    match get_config_string(&config_file_values, "layout", "storage") {
      Some(path) => Arc::new(
        FileStorage::open(Path::new(&path))
          .map_err(|err| format!("[layout] storage {}: {}", path, err))?,
      ),
      None => {
        warn!("Keine [layout] storage-Angabe, Anlage wird nicht gespeichert");
        Arc::new(MemoryStorage::new())
      }
    };
  let layout = Arc::new(Layout::new());
  layout
    .load(storage.as_ref())
    .map_err(|err| format!("Anlage konnte nicht geladen werden: {}", err))?;
  let (event_tx, event_rx) = mpsc::channel();
  layout.set_event_sender(event_tx);
  let run = Arc::new(AtomicBool::new(true));
  let context = InterfaceContext {
    identity: identity.clone(),
    layout: layout.clone(),
    run: run.clone(),
  };
  //Start aller über Konfiguration verlangter Interfaces
  let mut handles: Vec<InterfaceHandle> = Vec::new();
  for mut interface in get_alle_interfaces() {
    let Some(config_section) = config_file_values.get(interface.get_name()) else {
      continue;
    };
    if let Err(msg) = interface.init(config_section) {
      error!("Error Interface {} init: {}", interface.get_name(), msg);
      continue;
    }
    match interface.start(context.clone()) {
      Ok(handle) => {
        info!("Interface {} gestartet", handle.name);
        handles.push(handle);
      }
      Err(msg) => error!("Error Interface {} start: {}", interface.get_name(), msg),
    }
  }
  if handles.is_empty() {
    return Err("Kein Interface konfiguriert oder gestartet".to_string());
  }
  //Sicherstellung Booster aus und PID File gelöscht wird wenn Programm terminiert wird
  let signals = Signals::new([SIGTERM, SIGINT, SIGHUP, SIGQUIT])
    .map_err(|err| format!("Signal Handler: {}", err))?;
  let all_broadcasts = handles
    .iter()
    .map(|handle| (handle.name.clone(), handle.broadcast.clone()))
    .collect();
  let cleanup_run = run.clone();
  thread::Builder::new()
    .name("Cleanup".to_string())
    .spawn(move || terminate_poweroff(signals, all_broadcasts, identity, cleanup_run))
    .map_err(|err| format!("Cleanup Thread: {}", err))?;
  //Beobachter Anlage
  let observer_run = run.clone();
  let observer = thread::Builder::new()
    .name("Observer".to_string())
    .spawn(move || observe_layout(event_rx, layout, storage, observer_run))
    .map_err(|err| format!("Observer Thread: {}", err))?;

  //Warten bis alle Threads beendet sind
  for handle in handles {
    for thread in handle.threads {
      if thread.join().is_err() {
        error!("Thread von Interface {} abgebrochen", handle.name);
      }
    }
  }
  run.store(false, Ordering::SeqCst);
  if observer.join().is_err() {
    error!("Observer abgebrochen");
  }
  del_pidfile();
  info!("mcpd beendet");
  Ok(())
}
