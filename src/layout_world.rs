//! Gemeinsamer Zustand der Anlage für alle Verbindungen
//!
//! Alle Objekte werden als Arc in Maps gehalten. Die RwLocks der Maps werden nur zum
//! Kopieren eines Arc gehalten, nie während einer Operation auf einem Objekt.
//! Jede Änderung erzeugt ein LayoutEvent, das an einen Beobachter (Logging, Speicherung) gesendet wird.

use std::{
  collections::HashMap,
  sync::{mpsc::Sender, Arc, Mutex, PoisonError, RwLock},
};

use log::{debug, info, warn};

use crate::{
  layout_cluster::Cluster,
  layout_lockable::LockState,
  layout_object_identifier::{ObjectId, ObjectIdentifier, ObjectType},
  layout_objects::{
    AccessoryControllable, AccessoryObject, AddressIndex, Feedback, Lockable, Loco, Orientation,
    Track,
  },
  layout_storage::{LayoutStorage, StorageError},
  mcp_address::ProtocolAddress,
};

/// Zustand Booster (Gleisspannung)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoosterState {
  Stop,
  Go,
  Halt,
}

/// Änderungen am Zustand der Anlage
#[derive(Clone, Debug, PartialEq)]
pub enum LayoutEvent {
  Booster(BoosterState),
  LocoSpeed {
    loco: ObjectIdentifier,
    speed: u16,
  },
  LocoOrientation {
    loco: ObjectIdentifier,
    orientation: Orientation,
  },
  LocoFunction {
    loco: ObjectIdentifier,
    nr: u8,
    on: bool,
  },
  AccessoryState {
    id: ObjectIdentifier,
    state: u8,
  },
  FeedbackState {
    feedback: ObjectIdentifier,
    pin: u32,
    occupied: bool,
  },
  LockChanged {
    id: ObjectIdentifier,
    state: LockState,
    owner: ObjectIdentifier,
  },
  TrackOrientation {
    track: ObjectIdentifier,
    orientation: Orientation,
  },
  ClusterOrientation {
    cluster: ObjectIdentifier,
    orientation: Orientation,
  },
  /// Gelesener CV Wert
  ProgramValue {
    cv: u16,
    value: u8,
  },
  /// MFX Dekoder hat eine Schienenadresse (SID) erhalten
  MfxBound {
    uid: u32,
    sid: u16,
  },
  /// Lok aus der Lokliste einer CS2 Master
  LocoDiscovered {
    loco: ObjectIdentifier,
    name: String,
    address: ProtocolAddress,
  },
  Cs2MasterFound,
  ConfigStreamComplete {
    name: String,
    size: usize,
  },
}

impl LayoutEvent {
  /// Objekt das durch den Event verändert wurde und gespeichert werden muss
  pub fn changed_object(&self) -> Option<ObjectIdentifier> {
    match self {
      LayoutEvent::LocoSpeed { loco, .. }
      | LayoutEvent::LocoOrientation { loco, .. }
      | LayoutEvent::LocoFunction { loco, .. }
      | LayoutEvent::LocoDiscovered { loco, .. } => Some(*loco),
      LayoutEvent::AccessoryState { id, .. } | LayoutEvent::LockChanged { id, .. } => Some(*id),
      LayoutEvent::FeedbackState { feedback, .. } => Some(*feedback),
      LayoutEvent::TrackOrientation { track, .. } => Some(*track),
      LayoutEvent::ClusterOrientation { cluster, .. } => Some(*cluster),
      _ => None,
    }
  }
}

type Map<K, V> = RwLock<HashMap<K, Arc<V>>>;

fn get<K: std::hash::Hash + Eq, V>(map: &Map<K, V>, key: &K) -> Option<Arc<V>> {
  map
    .read()
    .unwrap_or_else(PoisonError::into_inner)
    .get(key)
    .cloned()
}

fn insert<K: std::hash::Hash + Eq, V>(map: &Map<K, V>, key: K, value: V) -> Arc<V> {
  let value = Arc::new(value);
  map
    .write()
    .unwrap_or_else(PoisonError::into_inner)
    .insert(key, value.clone());
  value
}

/// Zustand der Anlage
#[derive(Default)]
pub struct Layout {
  locos: Map<ObjectId, Loco>,
  loco_addresses: RwLock<AddressIndex>,
  tracks: Map<ObjectId, Track>,
  accessories: Map<ObjectIdentifier, AccessoryObject>,
  feedbacks: Map<ObjectId, Feedback>,
  clusters: Map<ObjectId, Cluster>,
  //Gleis ID -> Cluster ID
  track_cluster: RwLock<HashMap<ObjectId, ObjectId>>,
  booster: Mutex<Option<BoosterState>>,
  events: Mutex<Option<Sender<LayoutEvent>>>,
}

impl Layout {
  pub fn new() -> Layout {
    Layout::default()
  }

  /// Empfänger aller Events setzen
  pub fn set_event_sender(&self, tx: Sender<LayoutEvent>) {
    *self.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
  }

  /// Event an den Beobachter senden
  pub fn notify(&self, event: LayoutEvent) {
    let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(tx) = events.as_ref() {
      if tx.send(event).is_err() {
        warn!("Layout Beobachter nicht mehr vorhanden");
        *events = None;
      }
    }
  }

  pub fn add_loco(&self, loco: Loco) -> Arc<Loco> {
    let id = loco.identifier().object_id();
    self
      .loco_addresses
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(loco.address(), id);
    insert(&self.locos, id, loco)
  }

  /// Lok aus der Lokliste einer CS2 Master übernehmen, falls die Adresse noch unbekannt ist.
  /// Die neue Lok erhält die nächste freie ID.
  /// Prüfung der Adresse, Vergabe der ID und Einfügen erfolgen unter den gleichen Locks.
  /// Ok(None) wenn die Adresse bereits bekannt ist, Err wenn keine ID mehr frei ist.
  pub fn add_discovered_loco(
    &self, name: &str, address: ProtocolAddress,
  ) -> Result<Option<Arc<Loco>>, String> {
    let loco = {
      //Lock Reihenfolge wie add_loco: zuerst Adressen, danach Loks
      let mut addresses = self
        .loco_addresses
        .write()
        .unwrap_or_else(PoisonError::into_inner);
      if addresses.contains_key(&address) {
        debug!("Lok {} {:?} bereits bekannt", name, address);
        return Ok(None);
      }
      let mut locos = self.locos.write().unwrap_or_else(PoisonError::into_inner);
      let id = match locos.keys().max() {
        None => 1,
        Some(max) => max
          .checked_add(1)
          .ok_or(format!("Keine freie Lok ID für {} {:?}", name, address))?,
      };
      let loco = Arc::new(Loco::new(id, name, address));
      addresses.insert(address, id);
      locos.insert(id, loco.clone());
      loco
    };
    info!(
      "Neue Lok {} {:?} mit ID {}",
      name,
      address,
      loco.identifier().object_id()
    );
    self.notify(LayoutEvent::LocoDiscovered {
      loco: loco.identifier(),
      name: name.to_string(),
      address,
    });
    Ok(Some(loco))
  }

  pub fn add_track(&self, track: Track) -> Arc<Track> {
    insert(&self.tracks, track.id(), track)
  }

  pub fn add_accessory(&self, accessory: AccessoryObject) -> Arc<AccessoryObject> {
    insert(&self.accessories, accessory.identifier(), accessory)
  }

  pub fn add_feedback(&self, feedback: Feedback) -> Arc<Feedback> {
    insert(&self.feedbacks, feedback.id(), feedback)
  }

  /// Cluster hinzufügen, ein Gleis kann nur zu einem Cluster gehören
  pub fn add_cluster(&self, cluster: Cluster) -> Arc<Cluster> {
    {
      let mut track_cluster = self
        .track_cluster
        .write()
        .unwrap_or_else(PoisonError::into_inner);
      for member in cluster.tracks() {
        if let Some(old) = track_cluster.insert(member.track.id(), cluster.id()) {
          if old != cluster.id() {
            warn!(
              "{} war in Cluster {}, neu in {}",
              member.track.name(),
              old,
              cluster.id()
            );
          }
        }
      }
    }
    insert(&self.clusters, cluster.id(), cluster)
  }

  pub fn loco(&self, id: ObjectId) -> Option<Arc<Loco>> {
    get(&self.locos, &id)
  }

  pub fn track(&self, id: ObjectId) -> Option<Arc<Track>> {
    get(&self.tracks, &id)
  }

  pub fn accessory(&self, id: &ObjectIdentifier) -> Option<Arc<AccessoryObject>> {
    get(&self.accessories, id)
  }

  pub fn feedback(&self, id: ObjectId) -> Option<Arc<Feedback>> {
    get(&self.feedbacks, &id)
  }

  pub fn cluster(&self, id: ObjectId) -> Option<Arc<Cluster>> {
    get(&self.clusters, &id)
  }

  /// Cluster zu dem ein Gleis gehört
  pub fn cluster_of_track(&self, track_id: ObjectId) -> Option<Arc<Cluster>> {
    let cluster_id = *self
      .track_cluster
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(&track_id)?;
    self.cluster(cluster_id)
  }

  pub fn loco_by_address(&self, address: &ProtocolAddress) -> Option<Arc<Loco>> {
    let id = *self
      .loco_addresses
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(address)?;
    self.loco(id)
  }

  /// Weiche, Signal oder Zubehör mit dieser Dekoderadresse
  pub fn accessory_by_address(&self, address: &ProtocolAddress) -> Option<Arc<AccessoryObject>> {
    self
      .accessories
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .find(|accessory| accessory.accessory().address() == *address)
      .cloned()
  }

  pub fn feedback_by_pin(&self, pin: u32) -> Option<Arc<Feedback>> {
    self
      .feedbacks
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .find(|feedback| feedback.pin() == pin)
      .cloned()
  }

  /// Sperrbares Objekt über den Objekttyp, None wenn der Typ nicht sperrbar ist oder nicht existiert
  pub fn lockable(&self, id: &ObjectIdentifier) -> Option<Arc<dyn Lockable + Send + Sync>> {
    match id.object_type() {
      ObjectType::Track => self
        .track(id.object_id())
        .map(|track| track as Arc<dyn Lockable + Send + Sync>),
      ObjectType::Switch | ObjectType::Signal | ObjectType::Accessory => self
        .accessory(id)
        .map(|accessory| accessory as Arc<dyn Lockable + Send + Sync>),
      _ => None,
    }
  }

  fn notify_lock(&self, item: &(dyn Lockable + Send + Sync)) {
    let (state, owner) = item.lockable().snapshot();
    self.notify(LayoutEvent::LockChanged {
      id: item.identifier(),
      state,
      owner,
    });
  }

  /// Reservation eines Objektes durch eine Lok
  pub fn reserve(&self, id: &ObjectIdentifier, loco: &ObjectIdentifier) -> bool {
    let Some(item) = self.lockable(id) else {
      debug!("reserve: {} nicht sperrbar", id);
      return false;
    };
    let ok = item.reserve(loco);
    if ok {
      self.notify_lock(item.as_ref());
    }
    ok
  }

  /// Sperre eines Objektes durch eine Lok
  pub fn lock(&self, id: &ObjectIdentifier, loco: &ObjectIdentifier) -> bool {
    let Some(item) = self.lockable(id) else {
      debug!("lock: {} nicht sperrbar", id);
      return false;
    };
    let ok = item.lock(loco);
    if ok {
      self.notify_lock(item.as_ref());
    }
    ok
  }

  /// Freigabe eines Objektes, loco = ObjectIdentifier::NONE erzwingt die Freigabe
  pub fn release(&self, id: &ObjectIdentifier, loco: &ObjectIdentifier) -> bool {
    let Some(item) = self.lockable(id) else {
      debug!("release: {} nicht sperrbar", id);
      return false;
    };
    let ok = item.release(loco);
    if ok {
      self.notify_lock(item.as_ref());
    }
    ok
  }

  /// Ausrichtung eines Clusters setzen
  pub fn set_cluster_orientation(
    &self, cluster_id: ObjectId, orientation: Orientation, loco: &ObjectIdentifier,
  ) -> bool {
    let Some(cluster) = self.cluster(cluster_id) else {
      return false;
    };
    let Some(before) = cluster.change_orientation(orientation, loco) else {
      return false;
    };
    if before != orientation {
      self.notify(LayoutEvent::ClusterOrientation {
        cluster: cluster.identifier(),
        orientation,
      });
      for member in cluster.tracks() {
        self.notify(LayoutEvent::TrackOrientation {
          track: member.track.identifier(),
          orientation: orientation ^ member.invert,
        });
      }
    }
    true
  }

  /// Ausrichtung eines Gleises setzen.
  /// Gehört das Gleis zu einem Cluster, wird der ganze Cluster ausgerichtet.
  /// Sonst muss das Gleis frei oder durch die Lok belegt sein.
  pub fn set_track_orientation(
    &self, track_id: ObjectId, orientation: Orientation, loco: &ObjectIdentifier,
  ) -> bool {
    if let Some(cluster) = self.cluster_of_track(track_id) {
      let invert = cluster.track_invert(track_id).unwrap_or(false);
      return self.set_cluster_orientation(cluster.id(), orientation ^ invert, loco);
    }
    let Some(track) = self.track(track_id) else {
      return false;
    };
    let (state, owner) = track.lockable().snapshot();
    if state != LockState::Free && owner != *loco {
      debug!("{} ist nicht frei", track.name());
      return false;
    }
    if track.orientation() != orientation {
      track.force_orientation(orientation);
      self.notify(LayoutEvent::TrackOrientation {
        track: track.identifier(),
        orientation,
      });
    }
    true
  }

  pub fn booster(&self) -> Option<BoosterState> {
    *self.booster.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn set_booster(&self, state: BoosterState) {
    let changed = self
      .booster
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .replace(state)
      != Some(state);
    if changed {
      info!("Booster {:?}", state);
      self.notify(LayoutEvent::Booster(state));
    }
  }

  /// Geschwindigkeit einer Lok, unbekannte Loks werden ignoriert
  pub fn set_loco_speed(&self, address: &ProtocolAddress, speed: u16) {
    let Some(loco) = self.loco_by_address(address) else {
      debug!("Speed für unbekannte Lok {:?}", address);
      return;
    };
    let changed = {
      let mut drive = loco.drive();
      let changed = drive.speed != speed;
      drive.speed = speed;
      changed
    };
    if changed {
      self.notify(LayoutEvent::LocoSpeed {
        loco: loco.identifier(),
        speed,
      });
    }
  }

  /// Fahrtrichtung einer Lok
  pub fn set_loco_orientation(&self, address: &ProtocolAddress, orientation: Orientation) {
    let Some(loco) = self.loco_by_address(address) else {
      debug!("Richtung für unbekannte Lok {:?}", address);
      return;
    };
    let changed = {
      let mut drive = loco.drive();
      let changed = drive.orientation != orientation;
      drive.orientation = orientation;
      changed
    };
    if changed {
      self.notify(LayoutEvent::LocoOrientation {
        loco: loco.identifier(),
        orientation,
      });
    }
  }

  /// Funktion einer Lok
  pub fn set_loco_function(&self, address: &ProtocolAddress, nr: u8, on: bool) {
    let Some(loco) = self.loco_by_address(address) else {
      debug!("Funktion für unbekannte Lok {:?}", address);
      return;
    };
    let changed = {
      let mut drive = loco.drive();
      let changed = drive.function(nr) != on;
      drive.set_function(nr, on);
      changed
    };
    if changed {
      self.notify(LayoutEvent::LocoFunction {
        loco: loco.identifier(),
        nr,
        on,
      });
    }
  }

  /// Nothalt aller Loks
  pub fn stop_all_locos(&self) {
    let addresses: Vec<ProtocolAddress> = self
      .locos
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .map(|loco| loco.address())
      .collect();
    for address in addresses {
      self.set_loco_speed(&address, 0);
    }
  }

  /// Schaltzustand Zubehör
  pub fn set_accessory_state(&self, address: &ProtocolAddress, state: u8) {
    let Some(accessory) = self.accessory_by_address(address) else {
      debug!("Zubehör {:?} unbekannt", address);
      return;
    };
    if accessory.accessory().set_state(state) {
      self.notify(LayoutEvent::AccessoryState {
        id: accessory.identifier(),
        state,
      });
    }
  }

  /// Zustand Rückmelder
  pub fn set_feedback_state(&self, pin: u32, occupied: bool) {
    let Some(feedback) = self.feedback_by_pin(pin) else {
      debug!("Rückmelder {} unbekannt", pin);
      return;
    };
    if feedback.set_occupied(occupied) {
      self.notify(LayoutEvent::FeedbackState {
        feedback: ObjectIdentifier::new(ObjectType::Feedback, feedback.id()),
        pin,
        occupied,
      });
    }
  }

  /// Datensatz eines Objektes zum Speichern
  pub fn serialize(&self, id: &ObjectIdentifier) -> Option<String> {
    match id.object_type() {
      ObjectType::Loco => self.loco(id.object_id()).map(|loco| loco.serialize()),
      ObjectType::Track => self.track(id.object_id()).map(|track| track.serialize()),
      ObjectType::Switch | ObjectType::Signal | ObjectType::Accessory => {
        self.accessory(id).map(|accessory| accessory.serialize())
      }
      ObjectType::Feedback => self
        .feedback(id.object_id())
        .map(|feedback| feedback.serialize()),
      ObjectType::Cluster => self
        .cluster(id.object_id())
        .map(|cluster| cluster.serialize()),
      _ => None,
    }
  }

  /// Alle Objekte aus der Speicherung laden. Cluster zuletzt, da sie Gleise referenzieren.
  pub fn load(&self, storage: &dyn LayoutStorage) -> Result<(), StorageError> {
    for record in storage.load_all(ObjectType::Loco)? {
      if let Some(loco) = Loco::deserialize(&record) {
        self.add_loco(loco);
      }
    }
    for record in storage.load_all(ObjectType::Track)? {
      if let Some(track) = Track::deserialize(&record) {
        self.add_track(track);
      }
    }
    for object_type in [ObjectType::Switch, ObjectType::Signal, ObjectType::Accessory] {
      for record in storage.load_all(object_type)? {
        if let Some(accessory) = AccessoryObject::deserialize(&record) {
          self.add_accessory(accessory);
        }
      }
    }
    for record in storage.load_all(ObjectType::Feedback)? {
      if let Some(feedback) = Feedback::deserialize(&record) {
        self.add_feedback(feedback);
      }
    }
    for record in storage.load_all(ObjectType::Cluster)? {
      if let Some(cluster) = Cluster::deserialize(&record, |id| self.track(id)) {
        self.add_cluster(cluster);
      }
    }
    info!(
      "Layout aus {} geladen: {} Loks, {} Gleise, {} Zubehör, {} Rückmelder, {} Cluster",
      storage.name(),
      self.locos.read().unwrap_or_else(PoisonError::into_inner).len(),
      self.tracks.read().unwrap_or_else(PoisonError::into_inner).len(),
      self
        .accessories
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .len(),
      self.feedbacks.read().unwrap_or_else(PoisonError::into_inner).len(),
      self.clusters.read().unwrap_or_else(PoisonError::into_inner).len()
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    layout_cluster::ClusterTrack,
    layout_storage::{FileStorage, MemoryStorage},
    mcp_address::Protocol,
  };
  use std::{env, fs, process, sync::mpsc, thread};

  fn layout_with_cluster() -> Layout {
    let layout = Layout::new();
    let t1 = layout.add_track(Track::new(1, "Gleis 1", Orientation::Right));
    let t2 = layout.add_track(Track::new(2, "Gleis 2", Orientation::Left));
    layout.add_track(Track::new(3, "Gleis 3", Orientation::Right));
    layout.add_cluster(Cluster::new(
      1,
      "Pendel",
      Orientation::Right,
      vec![
        ClusterTrack {
          track: t1,
          invert: false,
        },
        ClusterTrack {
          track: t2,
          invert: true,
        },
      ],
    ));
    layout
  }

  #[test]
  fn lockable_dispatch_test() {
    let layout = layout_with_cluster();
    layout.add_accessory(AccessoryObject::new(
      ObjectIdentifier::new(ObjectType::Signal, 4),
      "Signal 4",
      ProtocolAddress::new(Protocol::MM, 4),
    ));
    let loco = ObjectIdentifier::loco(1);
    assert!(layout.reserve(&ObjectIdentifier::track(3), &loco));
    assert!(layout.reserve(&ObjectIdentifier::new(ObjectType::Signal, 4), &loco));
    assert!(layout.lock(&ObjectIdentifier::new(ObjectType::Signal, 4), &loco));
    //Nicht sperrbar oder nicht vorhanden
    assert!(!layout.reserve(&ObjectIdentifier::new(ObjectType::Route, 1), &loco));
    assert!(!layout.reserve(&ObjectIdentifier::track(99), &loco));
    assert!(layout.lockable(&ObjectIdentifier::new(ObjectType::Feedback, 1)).is_none());
    assert!(!layout.release(&ObjectIdentifier::track(3), &ObjectIdentifier::loco(2)));
    assert!(layout.release(&ObjectIdentifier::track(3), &loco));
  }

  #[test]
  fn track_orientation_via_cluster_test() {
    let layout = layout_with_cluster();
    let loco = ObjectIdentifier::loco(1);
    //Gleis 2 ist invertiert: Links für Gleis 2 -> Cluster Rechts, unverändert
    assert!(layout.set_track_orientation(2, Orientation::Left, &loco));
    assert_eq!(layout.cluster(1).unwrap().orientation(), Orientation::Right);
    assert!(layout.set_track_orientation(2, Orientation::Right, &loco));
    assert_eq!(layout.cluster(1).unwrap().orientation(), Orientation::Left);
    assert_eq!(layout.track(1).unwrap().orientation(), Orientation::Left);
    assert_eq!(layout.track(2).unwrap().orientation(), Orientation::Right);
    //Gleis ohne Cluster, belegt durch andere Lok
    assert!(layout.reserve(&ObjectIdentifier::track(3), &ObjectIdentifier::loco(2)));
    assert!(!layout.set_track_orientation(3, Orientation::Left, &loco));
    assert!(layout.set_track_orientation(3, Orientation::Left, &ObjectIdentifier::loco(2)));
  }

  #[test]
  fn events_test() {
    let layout = Layout::new();
    let (tx, rx) = mpsc::channel();
    layout.set_event_sender(tx);
    let address = ProtocolAddress::new(Protocol::MFX, 5);
    layout.add_loco(Loco::new(3, "Lok", address));
    layout.set_loco_speed(&address, 100);
    layout.set_loco_speed(&address, 100);
    layout.set_loco_speed(&ProtocolAddress::new(Protocol::DCC, 5), 100);
    layout.set_booster(BoosterState::Go);
    layout.set_booster(BoosterState::Go);
    let events: Vec<LayoutEvent> = rx.try_iter().collect();
    assert_eq!(
      events,
      vec![
        LayoutEvent::LocoSpeed {
          loco: ObjectIdentifier::loco(3),
          speed: 100
        },
        LayoutEvent::Booster(BoosterState::Go)
      ]
    );
    assert_eq!(events[0].changed_object(), Some(ObjectIdentifier::loco(3)));
    assert_eq!(events[1].changed_object(), None);
  }

  #[test]
  fn load_test() {
    let layout = layout_with_cluster();
    layout.add_loco(Loco::new(3, "Lok", ProtocolAddress::new(Protocol::DCC, 3)));
    layout.add_feedback(Feedback::new(1, "Melder", 17));
    let storage = MemoryStorage::new();
    for id in [
      ObjectIdentifier::track(1),
      ObjectIdentifier::track(2),
      ObjectIdentifier::track(3),
      ObjectIdentifier::new(ObjectType::Cluster, 1),
      ObjectIdentifier::loco(3),
      ObjectIdentifier::new(ObjectType::Feedback, 1),
    ] {
      storage.save(&id, layout.serialize(&id).unwrap()).unwrap();
    }
    let copy = Layout::new();
    copy.load(&storage).unwrap();
    assert_eq!(copy.cluster_of_track(2).unwrap().id(), 1);
    assert!(copy.cluster_of_track(3).is_none());
    assert!(copy
      .loco_by_address(&ProtocolAddress::new(Protocol::DCC, 3))
      .is_some());
    assert!(copy.feedback_by_pin(17).is_some());
  }

  #[test]
  fn discovered_loco_test() {
    let layout = Layout::new();
    let (tx, rx) = mpsc::channel();
    layout.set_event_sender(tx);
    layout.add_loco(Loco::new(4, "Lok 4", ProtocolAddress::new(Protocol::MM, 4)));
    let address = ProtocolAddress::new(Protocol::MFX, 6);
    let loco = layout
      .add_discovered_loco("BR 89", address)
      .unwrap()
      .expect("Neue Lok erwartet");
    assert_eq!(loco.identifier(), ObjectIdentifier::loco(5));
    assert!(layout.add_discovered_loco("BR 89", address).unwrap().is_none());
    let events: Vec<LayoutEvent> = rx.try_iter().collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].changed_object(), Some(ObjectIdentifier::loco(5)));
  }

  #[test]
  fn discovered_loco_no_free_id_test() {
    let layout = Layout::new();
    let last = ProtocolAddress::new(Protocol::MM, 80);
    layout.add_loco(Loco::new(u16::MAX, "Lok 80", last));
    let result = layout.add_discovered_loco("BR 89", ProtocolAddress::new(Protocol::MFX, 6));
    assert!(result.is_err());
    //Bestehende Lok nicht überschrieben
    assert_eq!(layout.loco(u16::MAX).unwrap().address(), last);
    assert!(layout
      .loco_by_address(&ProtocolAddress::new(Protocol::MFX, 6))
      .is_none());
  }

  #[test]
  fn concurrent_discovered_loco_test() {
    let layout = Arc::new(Layout::new());
    //Zwei Verbindungen melden die gleiche Lokliste gleichzeitig
    let threads: Vec<_> = (0..8)
      .map(|_| {
        let layout = layout.clone();
        thread::spawn(move || {
          (1..=20u16)
            .filter_map(|address| {
              layout
                .add_discovered_loco("Lok", ProtocolAddress::new(Protocol::DCC, address))
                .unwrap()
            })
            .count()
        })
      })
      .collect();
    let added: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
    assert_eq!(added, 20);
    for id in 1..=20 {
      assert!(layout.loco(id).is_some());
    }
    assert!(layout.loco(21).is_none());
  }

  #[test]
  fn discovered_loco_persisted_test() {
    //Name aus der Lokliste mit Trennzeichen, Speicherung und erneutes Laden
    let layout = Layout::new();
    let name = "BR 89;objectid=1\n\"Glaskasten\"";
    let address = ProtocolAddress::new(Protocol::MFX, 6);
    layout.add_loco(Loco::new(1, "Lok 1", ProtocolAddress::new(Protocol::MM, 1)));
    let loco = layout.add_discovered_loco(name, address).unwrap().unwrap();
    let path = env::temp_dir().join(format!("mcpd_layout_test_{}.txt", process::id()));
    let _ = fs::remove_file(&path);
    {
      let storage = FileStorage::open(&path).unwrap();
      for id in [ObjectIdentifier::loco(1), loco.identifier()] {
        storage.save(&id, layout.serialize(&id).unwrap()).unwrap();
      }
    }
    let copy = Layout::new();
    copy.load(&FileStorage::open(&path).unwrap()).unwrap();
    let _ = fs::remove_file(&path);
    let reloaded = copy.loco_by_address(&address).expect("Lok erwartet");
    assert_eq!(reloaded.identifier(), ObjectIdentifier::loco(2));
    assert_eq!(reloaded.name(), name);
    assert_eq!(copy.loco(1).unwrap().name(), "Lok 1");
  }

  #[test]
  fn cluster_orientation_events_test() {
    let layout = Arc::new(layout_with_cluster());
    let (tx, rx) = mpsc::channel();
    layout.set_event_sender(tx);
    let threads: Vec<_> = (0..16u16)
      .map(|n| {
        let layout = layout.clone();
        thread::spawn(move || {
          let orientation = Orientation::from_bool(n % 2 == 1);
          layout.set_cluster_orientation(1, orientation, &ObjectIdentifier::loco(n + 1))
        })
      })
      .collect();
    for t in threads {
      assert!(t.join().unwrap());
    }
    //Jeder Event entspricht einem Wechsel, ausgehend von Rechts
    let cluster_events: Vec<Orientation> = rx
      .try_iter()
      .filter_map(|event| match event {
        LayoutEvent::ClusterOrientation { orientation, .. } => Some(orientation),
        _ => None,
      })
      .collect();
    let left = cluster_events
      .iter()
      .filter(|o| **o == Orientation::Left)
      .count();
    let right = cluster_events.len() - left;
    let final_left = layout.cluster(1).unwrap().orientation() == Orientation::Left;
    assert_eq!(left, right + final_left as usize);
  }
}
