//! Auswertung empfangener MCP Frames
//!
//! Verteilung über das 8 Bit Kommando, das Response Bit entscheidet ob Kommando oder Antwort.
//! Ein Dispatcher pro Verbindung, alle Dispatcher teilen den Zustand der Anlage (Layout).

use std::sync::{
  atomic::{AtomicBool, AtomicU32, Ordering},
  Arc,
};

use log::{debug, info, trace, warn};

use crate::{
  layout_objects::Orientation,
  layout_world::{BoosterState, Layout, LayoutEvent},
  mcp_address::parse_address_protocol,
  mcp_commands::{
    ping_response, DEVICE_CONNECT6021, DEVICE_CS2_MASTER, DEVICE_CS2_SLAVE, DEVICE_CS2_SLAVE_2,
    DEVICE_GFP, DEVICE_GLEISBOX, DEVICE_GLEISBOX_2, DEVICE_LINK_S88, DEVICE_MS2, DEVICE_MS2_2,
    DEVICE_MS2_3, DEVICE_MS2_4, DEVICE_WIRELESS, SYSTEM_GO, SYSTEM_HALT,
    SYSTEM_LOCO_EMERGENCY_STOP, SYSTEM_STOP,
  },
  mcp_config_stream::{
    name_from_payload, ConfigData, ConfigStreamReassembler, StreamProgress, StreamState,
  },
  mcp_cs2_file::parse_loks,
  mcp_frame::{calc_hash, is_cs1_frame, Frame, McpCommand},
};

/// Eigene UID und daraus berechneter Hash, gemeinsam für alle Verbindungen
#[derive(Debug)]
pub struct NodeIdentity {
  uid: AtomicU32,
}

impl NodeIdentity {
  pub fn new(uid: u32) -> NodeIdentity {
    NodeIdentity {
      uid: AtomicU32::new(uid),
    }
  }

  /// Mit zufälliger UID
  pub fn random() -> NodeIdentity {
    NodeIdentity::new(rand::random())
  }

  pub fn uid(&self) -> u32 {
    self.uid.load(Ordering::SeqCst)
  }

  pub fn hash(&self) -> u16 {
    calc_hash(self.uid())
  }

  /// Neue zufällige UID, z.B. wenn ein anderer Teilnehmer den gleichen Hash verwendet
  pub fn regenerate(&self) {
    let uid: u32 = rand::random();
    self.uid.store(uid, Ordering::SeqCst);
    info!("Neue UID 0x{:08X} Hash 0x{:04X}", uid, calc_hash(uid));
  }
}

/// Bezeichnung eines Gerätes aus der Ping Antwort
pub fn device_name(device_type: u16) -> &'static str {
  match device_type {
    DEVICE_GFP => "Gleisformat Prozessor",
    DEVICE_GLEISBOX | DEVICE_GLEISBOX_2 => "Gleisbox",
    DEVICE_CONNECT6021 => "Connect 6021",
    DEVICE_MS2 | DEVICE_MS2_2 | DEVICE_MS2_3 | DEVICE_MS2_4 => "MS2",
    DEVICE_WIRELESS => "Wireless",
    DEVICE_CS2_MASTER => "CS2 Master",
    DEVICE_CS2_SLAVE | DEVICE_CS2_SLAVE_2 => "CS2 Slave",
    DEVICE_LINK_S88 => "Link S88",
    _ => "unbekannt",
  }
}

/// Dispatcher einer Verbindung
pub struct Dispatcher {
  name: String,
  identity: Arc<NodeIdentity>,
  layout: Arc<Layout>,
  reassembler: ConfigStreamReassembler,
  //Wird gesetzt sobald eine CS2 Master (oder Link S88) geantwortet hat
  cs2_master: Arc<AtomicBool>,
}

impl Dispatcher {
  /// # Arguments
  /// * name - Name der Verbindung für Logausgaben
  /// * identity - Eigene UID
  /// * layout - Zustand der Anlage
  pub fn new(name: &str, identity: Arc<NodeIdentity>, layout: Arc<Layout>) -> Dispatcher {
    Dispatcher {
      name: name.to_string(),
      identity,
      layout,
      reassembler: ConfigStreamReassembler::new(),
      cs2_master: Arc::new(AtomicBool::new(false)),
    }
  }

  /// Flag "CS2 Master gefunden", wird mit dem Ping Thread geteilt
  pub fn cs2_master_flag(&self) -> Arc<AtomicBool> {
    self.cs2_master.clone()
  }

  /// Verarbeitet einen empfangenen Frame.
  /// Liefert die Frames die als Antwort auf der gleichen Verbindung gesendet werden müssen.
  pub fn dispatch(&mut self, frame: &Frame) -> Vec<Frame> {
    trace!("{} <- {}", self.name, frame.to_hex());
    if is_cs1_frame(frame.id()) {
      debug!("{}: CS1 Frame ignoriert {}", self.name, frame.to_hex());
      return Vec::new();
    }
    self.check_hash_collision(frame);
    let response = frame.is_response();
    let Some(command) = McpCommand::from_u8(frame.command()) else {
      debug!(
        "{}: Unbekanntes Kommando 0x{:02X} ignoriert",
        self.name,
        frame.command()
      );
      return Vec::new();
    };
    match command {
      McpCommand::System => self.system(frame),
      McpCommand::Bind if response => self.bind(frame),
      McpCommand::LocoSpeed if response => self.loco_speed(frame),
      McpCommand::LocoDirection if response => self.loco_direction(frame),
      McpCommand::LocoFunction if response => self.loco_function(frame),
      McpCommand::ReadConfig if response => self.read_config(frame),
      McpCommand::Accessory if response => self.accessory(frame),
      McpCommand::S88Event if response => self.s88_event(frame),
      McpCommand::Ping => return self.ping(frame),
      McpCommand::RequestConfigData if !response => {
        let name = name_from_payload(frame.payload());
        debug!("{}: Anforderung Config Data {}", self.name, name);
        if self.reassembler.state() != StreamState::Idle {
          debug!("{}: Config Data Stream läuft noch", self.name);
        }
        self.reassembler.set_requested_name(&name);
      }
      McpCommand::ConfigDataStream => self.config_data(frame),
      _ => debug!(
        "{}: {:?} response={} len={} ignoriert",
        self.name,
        command,
        response,
        frame.len()
      ),
    }
    Vec::new()
  }

  /// Ein anderer Teilnehmer verwendet unseren Hash -> neue UID
  fn check_hash_collision(&self, frame: &Frame) {
    if frame.hash() != self.identity.hash() {
      return;
    }
    let command = frame.command();
    if (command == McpCommand::Ping as u8 && frame.is_response())
      || command == McpCommand::ConfigDataStream as u8
    {
      return;
    }
    warn!(
      "{}: Eigener Hash 0x{:04X} durch anderen Teilnehmer verwendet",
      self.name,
      frame.hash()
    );
    self.identity.regenerate();
  }

  fn system(&self, frame: &Frame) {
    match frame.len() {
      5 => {
        let uid = frame.payload_u32(0);
        match frame.byte(4) {
          SYSTEM_STOP => self.layout.set_booster(BoosterState::Stop),
          SYSTEM_GO => self.layout.set_booster(BoosterState::Go),
          SYSTEM_HALT => self.layout.set_booster(BoosterState::Halt),
          SYSTEM_LOCO_EMERGENCY_STOP => {
            if uid == 0 {
              self.layout.stop_all_locos();
            } else {
              self
                .layout
                .set_loco_speed(&parse_address_protocol(uid), 0);
            }
          }
          sub => debug!(
            "{}: System Subkommando 0x{:02X} UID 0x{:08X}",
            self.name, sub, uid
          ),
        }
      }
      4 => debug!(
        "{}: System Status UID 0x{:08X}",
        self.name,
        frame.payload_u32(0)
      ),
      len => debug!("{}: System mit Länge {} ignoriert", self.name, len),
    }
  }

  fn bind(&self, frame: &Frame) {
    if frame.len() != 6 {
      return;
    }
    let uid = frame.payload_u32(0);
    let sid = frame.payload_u16(4);
    info!("{}: MFX Bind UID 0x{:08X} SID {}", self.name, uid, sid);
    self.layout.notify(LayoutEvent::MfxBound { uid, sid });
  }

  fn loco_speed(&self, frame: &Frame) {
    if frame.len() != 6 {
      return;
    }
    let address = parse_address_protocol(frame.payload_u32(0));
    let speed = frame.payload_u16(4);
    debug!("{}: Speed {:?} {}", self.name, address, speed);
    self.layout.set_loco_speed(&address, speed);
  }

  fn loco_direction(&self, frame: &Frame) {
    if frame.len() != 5 {
      return;
    }
    let address = parse_address_protocol(frame.payload_u32(0));
    let orientation = match frame.byte(4) {
      1 => Orientation::Right,
      2 => Orientation::Left,
      other => {
        debug!("{}: Richtung {} für {:?} ignoriert", self.name, other, address);
        return;
      }
    };
    debug!("{}: Richtung {:?} {:?}", self.name, address, orientation);
    //Richtungswechsel bedeutet immer Geschwindigkeit 0
    self.layout.set_loco_speed(&address, 0);
    self.layout.set_loco_orientation(&address, orientation);
  }

  fn loco_function(&self, frame: &Frame) {
    if frame.len() != 6 {
      return;
    }
    let address = parse_address_protocol(frame.payload_u32(0));
    let nr = frame.byte(4);
    let on = frame.byte(5) != 0;
    debug!("{}: Funktion {:?} F{}={}", self.name, address, nr, on);
    self.layout.set_loco_function(&address, nr, on);
  }

  fn read_config(&self, frame: &Frame) {
    if frame.len() != 7 {
      return;
    }
    let cv = frame.payload_u16(4);
    let value = frame.byte(6);
    info!("{}: CV {} = {}", self.name, cv, value);
    self.layout.notify(LayoutEvent::ProgramValue { cv, value });
  }

  fn accessory(&self, frame: &Frame) {
    if frame.len() != 6 || frame.byte(5) != 1 {
      return;
    }
    let mut address = parse_address_protocol(frame.payload_u32(0));
    //Protokoll 0 basiert, Anlage 1 basiert
    address.address += 1;
    let state = frame.byte(4);
    debug!("{}: Zubehör {:?} Zustand {}", self.name, address, state);
    self.layout.set_accessory_state(&address, state);
  }

  fn s88_event(&self, frame: &Frame) {
    if frame.len() != 8 {
      return;
    }
    let raw = frame.payload_u32(0);
    let pin = (raw & 0x0000_0FFF) | ((raw & 0x00FF_0000) >> 4);
    let occupied = frame.byte(5) != 0;
    debug!(
      "{}: Rückmelder Modul {} Kontakt {} {}",
      self.name,
      pin >> 4,
      pin & 0x0F,
      occupied
    );
    self.layout.set_feedback_state(pin, occupied);
  }

  fn ping(&self, frame: &Frame) -> Vec<Frame> {
    if !frame.is_response() {
      //Ping an eine bestimmte UID die nicht wir sind
      if frame.len() == 8 && frame.payload_u32(0) != self.identity.uid() {
        return Vec::new();
      }
      return vec![ping_response(self.identity.uid(), self.identity.hash())];
    }
    if frame.len() != 8 {
      return Vec::new();
    }
    let device_type = frame.payload_u16(6);
    debug!(
      "{}: Gerät {} Hash 0x{:04X} UID 0x{:08X} Version {}.{}",
      self.name,
      device_name(device_type),
      frame.hash(),
      frame.payload_u32(0),
      frame.byte(4),
      frame.byte(5)
    );
    if (device_type == DEVICE_CS2_MASTER || device_type == DEVICE_LINK_S88)
      && !self.cs2_master.swap(true, Ordering::SeqCst)
    {
      info!("{}: {} gefunden", self.name, device_name(device_type));
      self.layout.notify(LayoutEvent::Cs2MasterFound);
    }
    Vec::new()
  }

  fn config_data(&mut self, frame: &Frame) {
    match self.reassembler.push(frame) {
      StreamProgress::Complete(config_data) => self.config_data_complete(config_data),
      StreamProgress::Trigger { name } => debug!("{}: Broadcast Trigger {}", self.name, name),
      StreamProgress::CrcError { expected, actual } => warn!(
        "{}: Config Data verworfen, CRC 0x{:04X} statt 0x{:04X}",
        self.name, actual, expected
      ),
      StreamProgress::InflateError { error, raw } => {
        warn!(
          "{}: Config Data verworfen: {}, {} Bytes",
          self.name,
          error,
          raw.len()
        );
        trace!("{}: Config Data {:02X?}", self.name, raw);
      }
      StreamProgress::Rejected(error) => warn!("{}: Config Data verworfen: {}", self.name, error),
      progress => trace!("{}: Config Data {:?}", self.name, progress),
    }
  }

  fn config_data_complete(&self, config_data: ConfigData) {
    info!(
      "{}: Config Data {} empfangen {}",
      self.name,
      config_data.name,
      config_data.received_at.format("%H:%M:%S")
    );
    self.layout.notify(LayoutEvent::ConfigStreamComplete {
      name: config_data.name.clone(),
      size: config_data.data.len(),
    });
    let text = String::from_utf8_lossy(&config_data.data);
    if config_data.name != "loks" && !text.starts_with("[lokomotive]") {
      return;
    }
    for loco in parse_loks(&text) {
      if loco.remove {
        debug!("{}: Lok {} auf CS2 gelöscht", self.name, loco.name);
        continue;
      }
      match loco.address {
        Some(address) => {
          if let Err(msg) = self.layout.add_discovered_loco(&loco.name, address) {
            warn!("{}: {}", self.name, msg);
          }
        }
        None => debug!("{}: Lok {} ohne Adresse", self.name, loco.name),
      }
    }
  }
}
