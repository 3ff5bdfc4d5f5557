//! CS2 Server Mode: TCP Server auf Port 15731 für CS2 kompatible Clients (z.B. Apps, Gleisbildstellpult).
//!
//! Jeder Client erhält einen eigenen Thread und einen eigenen Dispatcher.
//! Alle gültigen Frames eines Clients werden an alle anderen Clients weitergeleitet.

use std::{
  collections::HashMap,
  io,
  net::{TcpListener, TcpStream},
  sync::atomic::Ordering,
  thread::{self, JoinHandle},
  time::Duration,
};

use log::{error, info, warn};

use crate::{
  mcp_dispatcher::Dispatcher,
  mcp_server_types::{config_value, FrameBroadcast, InterfaceContext, InterfaceHandle, McpInterface},
  mcp_transport::{run_receiver, FrameTransport, TransportError},
  mcp_transport_tcp::{self, TcpTransport},
};

/// Wartezeit wenn kein neuer Client vorhanden ist
const ACCEPT_POLL: Duration = Duration::from_millis(100);

pub struct Cs2Server {
  port: u16,
}

impl Cs2Server {
  pub fn new() -> Cs2Server {
    Cs2Server {
      port: mcp_transport_tcp::DEFAULT_PORT,
    }
  }
}

impl Default for Cs2Server {
  fn default() -> Self {
    Cs2Server::new()
  }
}

/// Server Thread für einen Client
/// # Arguments
/// * client_stream - TCP Stream von/zu diesem Client
/// * client_id - ID der Verbindung
/// * broadcast - Alle Clients
/// * context - Gemeinsamer Zustand
fn handle_client(
  client_stream: TcpStream, client_id: u32, broadcast: FrameBroadcast, context: InterfaceContext,
) {
  let mut transport = match client_stream
    .set_nonblocking(false)
    .map_err(TransportError::from)
    .and_then(|_| TcpTransport::from_stream(client_stream))
  {
    Ok(transport) => transport,
    Err(err) => {
      error!("Client {}: {}", client_id, err);
      return;
    }
  };
  let outgoing = broadcast.add(client_id);
  let mut dispatcher = Dispatcher::new(&transport.name(), context.identity, context.layout);
  let result = run_receiver(
    &mut transport,
    &mut dispatcher,
    &outgoing,
    &context.run,
    |frame| broadcast.send(frame, Some(client_id)),
  );
  if let Err(err) = result {
    info!("Client {} beendet: {}", client_id, err);
  }
  broadcast.remove(client_id);
}

/// Wartet auf eingehende Verbindungen bis das Run Flag gelöscht wird.
/// Kehrt erst zurück wenn alle Client Threads beendet sind.
fn cs2_server(listener: TcpListener, broadcast: FrameBroadcast, context: InterfaceContext) {
  let mut client_id: u32 = 0;
  let mut clients: Vec<JoinHandle<()>> = Vec::new();
  while context.run.load(Ordering::SeqCst) {
    //Beendete Clients entfernen
    clients.retain(|client| !client.is_finished());
    let (client_stream, addr) = match listener.accept() {
      Ok(client) => client,
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
        thread::sleep(ACCEPT_POLL);
        continue;
      }
      Err(err) => {
        warn!("CS2 Server Accept fail: {}", err);
        thread::sleep(ACCEPT_POLL);
        continue;
      }
    };
    client_id += 1;
    info!("CS2 Server neuer Client {}: {}", client_id, addr);
    let client_broadcast = broadcast.clone();
    let client_context = context.clone();
    let id = client_id;
    //Neuer Thread für diesen Client starten
    match thread::Builder::new()
      .name(format!("CS2_Client_Thread Client={}", addr))
      .spawn(move || handle_client(client_stream, id, client_broadcast, client_context))
    {
      Ok(client) => clients.push(client),
      Err(err) => error!("Thread für Client {} nicht gestartet: {}", addr, err),
    }
  }
  for client in clients {
    if client.join().is_err() {
      error!("CS2 Client Thread abgebrochen");
    }
  }
  info!("CS2 Server beendet");
}

impl McpInterface for Cs2Server {
  fn get_name(&self) -> &'static str {
    "server"
  }

  fn init(&mut self, config_file_section: &HashMap<String, Option<String>>) -> Result<(), String> {
    self.port = config_value(
      config_file_section,
      self.get_name(),
      "port",
      Some(mcp_transport_tcp::DEFAULT_PORT),
    )?;
    Ok(())
  }

  fn start(&self, context: InterfaceContext) -> Result<InterfaceHandle, String> {
    let server_adr = format!("0.0.0.0:{}", self.port);
    info!("Start CS2 Server: {}", server_adr);
    let listener = TcpListener::bind(&server_adr)
      .and_then(|listener| listener.set_nonblocking(true).map(|_| listener))
      .map_err(|err| {
        format!(
          "CS2 Server konnte nicht auf Port {} gestartet werden: {}",
          self.port, err
        )
      })?;
    let broadcast = FrameBroadcast::new();
    let server_broadcast = broadcast.clone();
    let server = thread::Builder::new()
      .name("CS2_Server".to_string())
      .spawn(move || cs2_server(listener, server_broadcast, context))
      .map_err(|err| format!("CS2 Server Thread nicht gestartet: {}", err))?;
    Ok(InterfaceHandle {
      name: self.get_name().to_string(),
      broadcast,
      threads: vec![server],
    })
  }
}
