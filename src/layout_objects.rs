//! Anlageobjekte: Lok, Gleis, Weiche/Signal/Zubehör, Rückmelder
//!
//! Die Objekte sind aus Komponenten zusammengesetzt (LockableItem, AccessoryComponent).
//! Fähigkeiten werden über die Traits Lockable und AccessoryControllable angeboten.

use std::{
  collections::HashMap,
  ops::BitXor,
  sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Mutex, MutexGuard, PoisonError,
  },
};

use crate::{
  layout_lockable::{LockState, LockableItem},
  layout_object_identifier::{ObjectId, ObjectIdentifier, ObjectType},
  layout_storage::{
    parse_record, record_bool, record_escape, record_identifier, record_str, record_u32,
  },
  mcp_address::{Protocol, ProtocolAddress},
};

/// Fahrtrichtung / Ausrichtung
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Orientation {
  Left = 0,
  #[default]
  Right = 1,
}

impl Orientation {
  pub fn from_bool(right: bool) -> Orientation {
    if right {
      Orientation::Right
    } else {
      Orientation::Left
    }
  }

  pub fn is_right(&self) -> bool {
    *self == Orientation::Right
  }
}

/// Ausrichtung XOR Invertierung
impl BitXor<bool> for Orientation {
  type Output = Orientation;
  fn bitxor(self, invert: bool) -> Orientation {
    Orientation::from_bool(self.is_right() ^ invert)
  }
}

/// Ausrichtung die ohne Mutex gelesen und gesetzt werden kann
#[derive(Debug)]
pub struct OrientationCell {
  right: AtomicBool,
}

impl OrientationCell {
  pub fn new(orientation: Orientation) -> OrientationCell {
    OrientationCell {
      right: AtomicBool::new(orientation.is_right()),
    }
  }
  pub fn get(&self) -> Orientation {
    Orientation::from_bool(self.right.load(Ordering::SeqCst))
  }
  pub fn set(&self, orientation: Orientation) {
    self.right.store(orientation.is_right(), Ordering::SeqCst);
  }
}

/// Objekte die durch eine Lok reserviert und gesperrt werden können
pub trait Lockable {
  fn identifier(&self) -> ObjectIdentifier;
  fn name(&self) -> &str;
  fn lockable(&self) -> &LockableItem;

  fn reserve(&self, owner: &ObjectIdentifier) -> bool {
    self.lockable().reserve(self.name(), owner)
  }
  fn lock(&self, owner: &ObjectIdentifier) -> bool {
    self.lockable().lock(self.name(), owner)
  }
  fn release(&self, owner: &ObjectIdentifier) -> bool {
    self.lockable().release(self.name(), owner)
  }
  fn is_in_use(&self) -> bool {
    self.lockable().is_in_use()
  }
  fn lock_state(&self) -> LockState {
    self.lockable().lock_state()
  }
  fn owner(&self) -> ObjectIdentifier {
    self.lockable().owner()
  }
}

/// Schaltzustand Zubehör: Off = rot / abzweigend, On = grün / gerade
pub const ACCESSORY_STATE_OFF: u8 = 0;
pub const ACCESSORY_STATE_ON: u8 = 1;

/// Zubehör Komponente: Dekoderadresse und aktueller Schaltzustand
#[derive(Debug)]
pub struct AccessoryComponent {
  address: ProtocolAddress,
  state: AtomicU8,
}

impl AccessoryComponent {
  pub fn new(address: ProtocolAddress, state: u8) -> AccessoryComponent {
    AccessoryComponent {
      address,
      state: AtomicU8::new(state),
    }
  }
  pub fn address(&self) -> ProtocolAddress {
    self.address
  }
  pub fn state(&self) -> u8 {
    self.state.load(Ordering::SeqCst)
  }
  /// Neuer Zustand, liefert true wenn geändert
  pub fn set_state(&self, state: u8) -> bool {
    self.state.swap(state, Ordering::SeqCst) != state
  }
}

/// Objekte mit Zubehördekoder
pub trait AccessoryControllable {
  fn accessory(&self) -> &AccessoryComponent;
}

/// Gleis
#[derive(Debug)]
pub struct Track {
  id: ObjectId,
  name: String,
  lock: LockableItem,
  orientation: OrientationCell,
}

impl Track {
  pub fn new(id: ObjectId, name: &str, orientation: Orientation) -> Track {
    Track {
      id,
      name: name.to_string(),
      lock: LockableItem::new(),
      orientation: OrientationCell::new(orientation),
    }
  }

  pub fn id(&self) -> ObjectId {
    self.id
  }

  pub fn orientation(&self) -> Orientation {
    self.orientation.get()
  }

  /// Setzt die Ausrichtung ohne Prüfung der Sperre.
  /// Wird vom Cluster verwendet, der die Konsistenz aller Gleise sicherstellt.
  pub(crate) fn force_orientation(&self, orientation: Orientation) {
    self.orientation.set(orientation);
  }

  pub fn serialize(&self) -> String {
    format!(
      "objectType=Track;objectid={};name={};orientation={};{}",
      self.id,
      record_escape(&self.name),
      self.orientation() as u8,
      self.lock.serialize()
    )
  }

  /// Aus gespeichertem Datensatz, None wenn kein Gleis
  pub fn deserialize(record: &str) -> Option<Track> {
    let arguments = parse_record(record);
    let id = record_identifier(&arguments);
    if id.object_type() != ObjectType::Track {
      return None;
    }
    Some(Track {
      id: id.object_id(),
      name: record_str(&arguments, "name"),
      lock: LockableItem::deserialize(&arguments),
      orientation: OrientationCell::new(Orientation::from_bool(record_bool(
        &arguments,
        "orientation",
        true,
      ))),
    })
  }
}

impl Lockable for Track {
  fn identifier(&self) -> ObjectIdentifier {
    ObjectIdentifier::track(self.id)
  }
  fn name(&self) -> &str {
    &self.name
  }
  fn lockable(&self) -> &LockableItem {
    &self.lock
  }
}

/// Weiche, Signal oder allgemeines Zubehör
#[derive(Debug)]
pub struct AccessoryObject {
  id: ObjectIdentifier,
  name: String,
  lock: LockableItem,
  accessory: AccessoryComponent,
}

impl AccessoryObject {
  /// # Arguments
  /// * id - Identifier, Typ muss Switch, Signal oder Accessory sein
  /// * name - Name
  /// * address - Dekoderadresse, 1 basiert
  pub fn new(id: ObjectIdentifier, name: &str, address: ProtocolAddress) -> AccessoryObject {
    AccessoryObject {
      id,
      name: name.to_string(),
      lock: LockableItem::new(),
      accessory: AccessoryComponent::new(address, ACCESSORY_STATE_OFF),
    }
  }

  pub fn serialize(&self) -> String {
    let address = self.accessory.address();
    format!(
      "objectType={};objectid={};name={};protocol={};address={};state={};{}",
      self.id.object_type().record_name(),
      self.id.object_id(),
      record_escape(&self.name),
      address.protocol,
      address.address,
      self.accessory.state(),
      self.lock.serialize()
    )
  }

  /// Aus gespeichertem Datensatz, None wenn keine Weiche, kein Signal, kein Zubehör
  pub fn deserialize(record: &str) -> Option<AccessoryObject> {
    let arguments = parse_record(record);
    let id = record_identifier(&arguments);
    if !matches!(
      id.object_type(),
      ObjectType::Switch | ObjectType::Signal | ObjectType::Accessory
    ) {
      return None;
    }
    let protocol = Protocol::from_str(&record_str(&arguments, "protocol")).unwrap_or(Protocol::MM);
    let address = record_u32(&arguments, "address", 0) as u16;
    Some(AccessoryObject {
      id,
      name: record_str(&arguments, "name"),
      lock: LockableItem::deserialize(&arguments),
      accessory: AccessoryComponent::new(
        ProtocolAddress::new(protocol, address),
        record_u32(&arguments, "state", ACCESSORY_STATE_OFF as u32) as u8,
      ),
    })
  }
}

impl Lockable for AccessoryObject {
  fn identifier(&self) -> ObjectIdentifier {
    self.id
  }
  fn name(&self) -> &str {
    &self.name
  }
  fn lockable(&self) -> &LockableItem {
    &self.lock
  }
}

impl AccessoryControllable for AccessoryObject {
  fn accessory(&self) -> &AccessoryComponent {
    &self.accessory
  }
}

/// Rückmelder
#[derive(Debug)]
pub struct Feedback {
  id: ObjectId,
  name: String,
  pin: u32,
  occupied: AtomicBool,
}

impl Feedback {
  /// # Arguments
  /// * id - ID
  /// * name - Name
  /// * pin - Rückmeldernummer (Modul * 16 + Kontakt)
  pub fn new(id: ObjectId, name: &str, pin: u32) -> Feedback {
    Feedback {
      id,
      name: name.to_string(),
      pin,
      occupied: AtomicBool::new(false),
    }
  }
  pub fn id(&self) -> ObjectId {
    self.id
  }
  pub fn name(&self) -> &str {
    &self.name
  }
  pub fn pin(&self) -> u32 {
    self.pin
  }
  pub fn is_occupied(&self) -> bool {
    self.occupied.load(Ordering::SeqCst)
  }
  /// Neuer Zustand, liefert true wenn geändert
  pub fn set_occupied(&self, occupied: bool) -> bool {
    self.occupied.swap(occupied, Ordering::SeqCst) != occupied
  }

  pub fn serialize(&self) -> String {
    format!(
      "objectType=Feedback;objectid={};name={};pin={};state={}",
      self.id,
      record_escape(&self.name),
      self.pin,
      self.is_occupied() as u8
    )
  }

  pub fn deserialize(record: &str) -> Option<Feedback> {
    let arguments = parse_record(record);
    let id = record_identifier(&arguments);
    if id.object_type() != ObjectType::Feedback {
      return None;
    }
    let feedback = Feedback::new(
      id.object_id(),
      &record_str(&arguments, "name"),
      record_u32(&arguments, "pin", 0),
    );
    feedback.set_occupied(record_bool(&arguments, "state", false));
    Some(feedback)
  }
}

/// Fahrzustand einer Lok
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct LocoDrive {
  pub speed: u16,
  pub orientation: Orientation,
  //Bit n = Funktion n
  pub functions: u64,
}

impl LocoDrive {
  pub fn function(&self, nr: u8) -> bool {
    nr < 64 && (self.functions & (1 << nr)) != 0
  }
  pub fn set_function(&mut self, nr: u8, on: bool) {
    if nr >= 64 {
      return;
    }
    if on {
      self.functions |= 1 << nr;
    } else {
      self.functions &= !(1 << nr);
    }
  }
}

/// Lok
#[derive(Debug)]
pub struct Loco {
  id: ObjectId,
  name: String,
  address: ProtocolAddress,
  drive: Mutex<LocoDrive>,
}

impl Loco {
  pub fn new(id: ObjectId, name: &str, address: ProtocolAddress) -> Loco {
    Loco {
      id,
      name: name.to_string(),
      address,
      drive: Mutex::new(LocoDrive::default()),
    }
  }
  pub fn identifier(&self) -> ObjectIdentifier {
    ObjectIdentifier::loco(self.id)
  }
  pub fn name(&self) -> &str {
    &self.name
  }
  pub fn address(&self) -> ProtocolAddress {
    self.address
  }

  /// Fahrzustand zum Ändern
  pub fn drive(&self) -> MutexGuard<'_, LocoDrive> {
    self.drive.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn serialize(&self) -> String {
    let drive = *self.drive();
    format!(
      "objectType=Loco;objectid={};name={};protocol={};address={};speed={};orientation={};functions={}",
      self.id,
      record_escape(&self.name),
      self.address.protocol,
      self.address.address,
      drive.speed,
      drive.orientation as u8,
      drive.functions
    )
  }

  pub fn deserialize(record: &str) -> Option<Loco> {
    let arguments = parse_record(record);
    let id = record_identifier(&arguments);
    if id.object_type() != ObjectType::Loco {
      return None;
    }
    let protocol = Protocol::from_str(&record_str(&arguments, "protocol")).unwrap_or(Protocol::MM);
    let loco = Loco::new(
      id.object_id(),
      &record_str(&arguments, "name"),
      ProtocolAddress::new(protocol, record_u32(&arguments, "address", 0) as u16),
    );
    {
      let mut drive = loco.drive();
      drive.speed = record_u32(&arguments, "speed", 0) as u16;
      drive.orientation = Orientation::from_bool(record_bool(&arguments, "orientation", true));
      drive.functions = arguments
        .get("functions")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    }
    Some(loco)
  }
}

/// Suchschlüssel Protokoll/Adresse -> ID für alle Objekte mit Dekoder
pub type AddressIndex = HashMap<ProtocolAddress, ObjectId>;
