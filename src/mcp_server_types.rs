//! globale Definitionen für alle MCP Interfaces
//!
//! Ein Interface ist ein Abschnitt im Konfigfile ([udp], [tcp], [serial], [can], [server]).
//! Ist der Abschnitt vorhanden, wird das Interface gestartet.

use std::{
  collections::HashMap,
  str::FromStr,
  sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{self, Receiver, Sender},
    Arc, Mutex, PoisonError,
  },
  thread::{self, JoinHandle},
  time::Duration,
};

use log::{error, info, warn};

use crate::{
  layout_world::Layout,
  mcp_commands::{ping, request_config_data},
  mcp_dispatcher::{Dispatcher, NodeIdentity},
  mcp_frame::Frame,
  mcp_transport::{run_receiver, FrameTransport, TransportError},
  mcp_transport_serial::SerialTransport,
  mcp_transport_tcp::{self, TcpTransport},
  mcp_transport_udp::{self, UdpTransport},
};

/// Intervall der Pings bis eine CS2 Master gefunden wurde
const PING_INTERVAL: Duration = Duration::from_secs(10);
/// Wartezeit zwischen zwei Prüfungen des Run Flags
const RUN_CHECK: Duration = Duration::from_millis(100);

/// Was alle Interfaces gemeinsam verwenden
#[derive(Clone)]
pub struct InterfaceContext {
  pub identity: Arc<NodeIdentity>,
  pub layout: Arc<Layout>,
  /// false -> alle Threads beenden sich
  pub run: Arc<AtomicBool>,
}

/// Sender zu einer Verbindung mit ID
struct ConnectionSender {
  id: u32,
  tx: Sender<Frame>,
}

/// Alle Verbindungen eines Interfaces, Frames können an alle oder alle ausser einer gesendet werden
#[derive(Clone, Default)]
pub struct FrameBroadcast {
  connections: Arc<Mutex<Vec<ConnectionSender>>>,
}

impl FrameBroadcast {
  pub fn new() -> FrameBroadcast {
    FrameBroadcast::default()
  }

  /// Neue Verbindung, liefert den Receiver für die Empfangsschleife
  pub fn add(&self, id: u32) -> Receiver<Frame> {
    let (tx, rx) = mpsc::channel();
    self
      .connections
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(ConnectionSender { id, tx });
    rx
  }

  pub fn remove(&self, id: u32) {
    self
      .connections
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .retain(|connection| connection.id != id);
  }

  /// Anzahl aktuell vorhandene Verbindungen
  pub fn len(&self) -> usize {
    self
      .connections
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Frame an alle Verbindungen senden.
  /// Verbindungen, deren Receiver nicht mehr vorhanden ist, werden gelöscht.
  /// # Arguments
  /// * frame - Der zu sendende Frame
  /// * except - An diese Verbindung nicht senden (Absender)
  pub fn send(&self, frame: &Frame, except: Option<u32>) {
    let mut connections = self
      .connections
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    connections.retain(|connection| {
      if Some(connection.id) == except {
        return true;
      }
      if connection.tx.send(*frame).is_err() {
        info!("Verbindung {} nicht mehr vorhanden", connection.id);
        return false;
      }
      true
    });
  }
}

/// Laufendes Interface
pub struct InterfaceHandle {
  pub name: String,
  /// Senden an alle Verbindungen dieses Interfaces
  pub broadcast: FrameBroadcast,
  pub threads: Vec<JoinHandle<()>>,
}

/// Schnittstelle, die alle MCP Interfaces implementieren müssen
pub trait McpInterface {
  /// Liefert den Name des Interfaces zurück, gleichzeitig Name des Abschnittes im Konfigfile
  fn get_name(&self) -> &'static str;
  /// Init dieses Interfaces
  /// Liefert Err zurück wenn ein Fehler aufgetreten ist (z.B. fehlender Konfig Parameter)
  /// # Arguments
  /// * config_file_section - Der dieses Interface betreffende Teil des Konfigfiles
  fn init(&mut self, config_file_section: &HashMap<String, Option<String>>) -> Result<(), String>;
  /// Start dieses Interfaces
  fn start(&self, context: InterfaceContext) -> Result<InterfaceHandle, String>;
}

/// Wert aus einem Abschnitt des Konfigfiles
/// # Arguments
/// * config - Abschnitt
/// * section - Name des Abschnittes für Fehlermeldungen
/// * key - Gesuchter Wert
/// * default - None -> Wert muss vorhanden sein
pub fn config_value<T: FromStr>(
  config: &HashMap<String, Option<String>>, section: &str, key: &str, default: Option<T>,
) -> Result<T, String> {
  let value = match config.get(key) {
    Some(value) => value
      .as_ref()
      .ok_or(format!("[{}] {}-Angabe ohne Wert", section, key))?,
    None => {
      return default.ok_or(format!("Keine [{}] {}-Angabe in Konfigfile", section, key));
    }
  };
  value
    .trim()
    .parse::<T>()
    .ok()
    .ok_or(format!("[{}] {} ungültig: {}", section, key, value))
}

/// Verbindung eines Client Interfaces
#[derive(Debug, Clone, PartialEq)]
enum ClientKind {
  Udp {
    host: String,
    send_port: u16,
    receive_port: u16,
  },
  Tcp {
    host: String,
    port: u16,
  },
  Serial {
    device: String,
  },
  #[cfg(feature = "socketcan")]
  Can {
    interface: String,
  },
}

/// Interface mit genau einer Verbindung zu einer CS2, Gleisbox oder einem Gateway
pub struct ClientInterface {
  name: &'static str,
  kind: Option<ClientKind>,
}

impl ClientInterface {
  pub fn udp() -> ClientInterface {
    ClientInterface {
      name: "udp",
      kind: None,
    }
  }
  pub fn tcp() -> ClientInterface {
    ClientInterface {
      name: "tcp",
      kind: None,
    }
  }
  pub fn serial() -> ClientInterface {
    ClientInterface {
      name: "serial",
      kind: None,
    }
  }
  #[cfg(feature = "socketcan")]
  pub fn can() -> ClientInterface {
    ClientInterface {
      name: "can",
      kind: None,
    }
  }

  fn open(kind: &ClientKind) -> Result<Box<dyn FrameTransport>, TransportError> {
    let transport: Box<dyn FrameTransport> = match kind {
      ClientKind::Udp {
        host,
        send_port,
        receive_port,
      } => Box::new(UdpTransport::open(host, *send_port, *receive_port)?),
      ClientKind::Tcp { host, port } => Box::new(TcpTransport::connect(host, *port)?),
      ClientKind::Serial { device } => Box::new(SerialTransport::open(device)?),
      #[cfg(feature = "socketcan")]
      ClientKind::Can { interface } => {
        Box::new(crate::mcp_transport_can::CanTransport::open(interface)?)
      }
    };
    Ok(transport)
  }
}

impl McpInterface for ClientInterface {
  fn get_name(&self) -> &'static str {
    self.name
  }

  fn init(&mut self, config: &HashMap<String, Option<String>>) -> Result<(), String> {
    let section = self.name;
    self.kind = Some(match section {
      "udp" => ClientKind::Udp {
        host: config_value(config, section, "host", None)?,
        send_port: config_value(
          config,
          section,
          "send_port",
          Some(mcp_transport_udp::DEFAULT_SEND_PORT),
        )?,
        receive_port: config_value(
          config,
          section,
          "receive_port",
          Some(mcp_transport_udp::DEFAULT_RECEIVE_PORT),
        )?,
      },
      "tcp" => ClientKind::Tcp {
        host: config_value(config, section, "host", None)?,
        port: config_value(config, section, "port", Some(mcp_transport_tcp::DEFAULT_PORT))?,
      },
      "serial" => ClientKind::Serial {
        device: config_value(config, section, "device", None)?,
      },
      #[cfg(feature = "socketcan")]
      "can" => ClientKind::Can {
        interface: config_value(config, section, "interface", Some("can0".to_string()))?,
      },
      other => return Err(format!("Unbekanntes Interface {}", other)),
    });
    Ok(())
  }

  fn start(&self, context: InterfaceContext) -> Result<InterfaceHandle, String> {
    let kind = self
      .kind
      .as_ref()
      .ok_or(format!("Interface {} ohne init", self.name))?;
    let mut transport =
      ClientInterface::open(kind).map_err(|err| format!("{}: {}", self.name, err))?;
    info!("Interface {} gestartet: {}", self.name, transport.name());
    let broadcast = FrameBroadcast::new();
    let outgoing = broadcast.add(0);
    let mut dispatcher = Dispatcher::new(
      &transport.name(),
      context.identity.clone(),
      context.layout.clone(),
    );
    let cs2_master = dispatcher.cs2_master_flag();
    let run = context.run.clone();
    let receiver_broadcast = broadcast.clone();
    let receiver = thread::Builder::new()
      .name(format!("MCP_{}_Rx", self.name))
      .spawn(move || {
        if let Err(err) = run_receiver(
          transport.as_mut(),
          &mut dispatcher,
          &outgoing,
          &run,
          |_| {},
        ) {
          error!("{}: {}", transport.name(), err);
        }
        receiver_broadcast.remove(0);
      })
      .map_err(|err| format!("Thread für {} nicht gestartet: {}", self.name, err))?;
    let ping_broadcast = broadcast.clone();
    let pinger = thread::Builder::new()
      .name(format!("MCP_{}_Ping", self.name))
      .spawn(move || run_ping_sender(&ping_broadcast, &context.identity, &cs2_master, &context.run))
      .map_err(|err| format!("Thread für {} nicht gestartet: {}", self.name, err))?;
    Ok(InterfaceHandle {
      name: self.name.to_string(),
      broadcast,
      threads: vec![receiver, pinger],
    })
  }
}

/// Ping an alle Teilnehmer bis eine CS2 Master geantwortet hat, danach einmalig die Lokliste anfordern
/// # Arguments
/// * broadcast - Verbindungen des Interfaces
/// * identity - Eigene UID / Hash
/// * cs2_master - Wird vom Dispatcher gesetzt sobald eine CS2 Master geantwortet hat
/// * run - false -> Ende
pub fn run_ping_sender(
  broadcast: &FrameBroadcast, identity: &NodeIdentity, cs2_master: &AtomicBool, run: &AtomicBool,
) {
  let mut next_ping = Duration::ZERO;
  while run.load(Ordering::SeqCst) {
    if broadcast.is_empty() {
      warn!("Ping: keine Verbindung mehr vorhanden");
      return;
    }
    if cs2_master.load(Ordering::SeqCst) {
      info!("CS2 Master vorhanden, Lokliste wird angefordert");
      broadcast.send(&request_config_data(identity.hash(), "loks"), None);
      return;
    }
    if next_ping.is_zero() {
      broadcast.send(&ping(identity.hash()), None);
      next_ping = PING_INTERVAL;
    }
    thread::sleep(RUN_CHECK);
    next_ping = next_ping.saturating_sub(RUN_CHECK);
  }
}
