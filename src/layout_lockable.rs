//! Reservation / Sperre von Anlageobjekten (Gleise, Weichen, Signale, Zubehör) durch eine Lok
//!
//! Zustände: Free -> Reserved -> HardLocked -> Free
//! Zustand und Besitzer werden immer gemeinsam unter dem Mutex des Objektes geprüft und verändert.

use std::{
  collections::HashMap,
  sync::{Mutex, MutexGuard, PoisonError},
};

use log::debug;

use crate::{
  layout_object_identifier::{ObjectIdentifier, ObjectType},
  layout_storage::record_u32,
};

/// Zustand eines sperrbaren Objektes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
  Free = 0,
  Reserved = 1,
  SoftLocked = 2,
  HardLocked = 3,
}

impl LockState {
  /// Zustand aus gespeichertem Zahlenwert, unbekannte Werte -> Free
  pub fn from_u32(value: u32) -> LockState {
    match value {
      1 => LockState::Reserved,
      2 => LockState::SoftLocked,
      3 => LockState::HardLocked,
      _ => LockState::Free,
    }
  }
}

#[derive(Debug)]
struct LockInner {
  state: LockState,
  owner: ObjectIdentifier,
}

/// Sperrbare Komponente eines Objektes
#[derive(Debug)]
pub struct LockableItem {
  inner: Mutex<LockInner>,
}

impl Default for LockableItem {
  fn default() -> Self {
    LockableItem::new()
  }
}

impl LockableItem {
  /// Neu, frei
  pub fn new() -> LockableItem {
    LockableItem::with_state(LockState::Free, ObjectIdentifier::NONE)
  }

  /// Mit vorgegebenem Zustand, z.B. aus gespeicherten Daten
  pub fn with_state(state: LockState, owner: ObjectIdentifier) -> LockableItem {
    LockableItem {
      inner: Mutex::new(LockInner { state, owner }),
    }
  }

  fn guard(&self) -> MutexGuard<'_, LockInner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Reservation durch eine Lok.
  /// Wiederholte Reservation durch die gleiche Lok ist erfolgreich.
  /// Liefert false wenn das Objekt durch jemand anderen belegt ist.
  /// # Arguments
  /// * name - Name des Objektes für Logausgaben
  /// * owner - Reservierende Lok
  pub fn reserve(&self, name: &str, owner: &ObjectIdentifier) -> bool {
    if !owner.is_set() {
      debug!("{} kann nicht ohne Lok reserviert werden", name);
      return false;
    }
    let mut inner = self.guard();
    if inner.owner == *owner {
      if inner.state == LockState::Free {
        inner.state = LockState::Reserved;
      }
      return true;
    }
    if inner.owner.is_set() || inner.state != LockState::Free {
      debug!("{} ist nicht frei", name);
      return false;
    }
    inner.state = LockState::Reserved;
    inner.owner = *owner;
    true
  }

  /// Sperre durch eine Lok, das Objekt muss vorher durch diese Lok reserviert worden sein.
  /// # Arguments
  /// * name - Name des Objektes für Logausgaben
  /// * owner - Sperrende Lok
  pub fn lock(&self, name: &str, owner: &ObjectIdentifier) -> bool {
    let mut inner = self.guard();
    if !owner.is_set()
      || inner.owner != *owner
      || (inner.state != LockState::Reserved && inner.state != LockState::HardLocked)
    {
      debug!("{} ist nicht frei", name);
      return false;
    }
    inner.state = LockState::HardLocked;
    true
  }

  /// Freigabe durch den Besitzer. Ohne Lok (ObjectIdentifier::NONE) erfolgt die Freigabe immer.
  /// # Arguments
  /// * name - Name des Objektes für Logausgaben
  /// * owner - Freigebende Lok
  pub fn release(&self, name: &str, owner: &ObjectIdentifier) -> bool {
    let mut inner = self.guard();
    if owner.is_set() && inner.owner != *owner {
      debug!("{} ist nicht durch {} belegt", name, owner);
      return false;
    }
    inner.owner = ObjectIdentifier::NONE;
    inner.state = LockState::Free;
    true
  }

  /// Belegt wenn nicht frei oder ein Besitzer eingetragen ist
  pub fn is_in_use(&self) -> bool {
    let inner = self.guard();
    inner.state != LockState::Free || inner.owner.is_set()
  }

  pub fn lock_state(&self) -> LockState {
    self.guard().state
  }

  pub fn owner(&self) -> ObjectIdentifier {
    self.guard().owner
  }

  /// Zustand und Besitzer als konsistente Momentaufnahme
  pub fn snapshot(&self) -> (LockState, ObjectIdentifier) {
    let inner = self.guard();
    (inner.state, inner.owner)
  }

  /// Teil des gespeicherten Datensatzes
  pub fn serialize(&self) -> String {
    let (state, owner) = self.snapshot();
    format!(
      "lockstate={};locobaseid={};locobasetype={}",
      state as u32,
      owner.object_id(),
      owner.object_type() as u32
    )
  }

  /// Aus einem geparsten Datensatz. Die alten Schlüssel "lockState" und "locoID" werden noch gelesen.
  /// # Arguments
  /// * arguments - Alle Schlüssel/Werte eines Datensatzes
  pub fn deserialize(arguments: &HashMap<String, String>) -> LockableItem {
    let loco_id = record_u32(arguments, "locoID", 0);
    let owner_id = record_u32(arguments, "locobaseid", loco_id);
    let owner_type = record_u32(arguments, "locobasetype", ObjectType::Loco as u32);
    let state = record_u32(arguments, "lockState", LockState::Free as u32);
    let state = record_u32(arguments, "lockstate", state);
    LockableItem::with_state(
      LockState::from_u32(state),
      ObjectIdentifier::new(ObjectType::from_u32(owner_type), owner_id as u16),
    )
  }
}
