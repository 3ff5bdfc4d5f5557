//! Identifikation aller Anlageobjekte über Typ und ID

use std::{collections::HashMap, fmt};

/// ID eines Objektes innerhalb seines Typs, 0 = kein Objekt
pub type ObjectId = u16;
/// Kein Objekt
pub const OBJECT_NONE: ObjectId = 0;

/// Alle Objekttypen
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ObjectType {
  #[default]
  None = 0,
  Loco = 1,
  Track = 2,
  Feedback = 3,
  Accessory = 4,
  Switch = 5,
  Route = 6,
  Layer = 7,
  Signal = 8,
  Cluster = 9,
  TimeTable = 10,
  Text = 11,
  Pause = 12,
  MultipleUnit = 13,
  Booster = 14,
  Counter = 15,
}

/// Alle gültigen Typen ausser None
const ALL_TYPES: [ObjectType; 15] = [
  ObjectType::Loco,
  ObjectType::Track,
  ObjectType::Feedback,
  ObjectType::Accessory,
  ObjectType::Switch,
  ObjectType::Route,
  ObjectType::Layer,
  ObjectType::Signal,
  ObjectType::Cluster,
  ObjectType::TimeTable,
  ObjectType::Text,
  ObjectType::Pause,
  ObjectType::MultipleUnit,
  ObjectType::Booster,
  ObjectType::Counter,
];

impl ObjectType {
  /// Objekttyp aus dem gespeicherten Zahlenwert, unbekannte Werte liefern None
  pub fn from_u32(value: u32) -> ObjectType {
    ALL_TYPES
      .iter()
      .copied()
      .find(|object_type| *object_type as u32 == value)
      .unwrap_or(ObjectType::None)
  }

  /// Name für Texte und Schlüssel, immer Kleinbuchstaben
  pub fn name(&self) -> &'static str {
    match self {
      ObjectType::None => "none",
      ObjectType::Loco => "loco",
      ObjectType::Track => "track",
      ObjectType::Feedback => "feedback",
      ObjectType::Accessory => "accessory",
      ObjectType::Switch => "switch",
      ObjectType::Route => "route",
      ObjectType::Layer => "layer",
      ObjectType::Signal => "signal",
      ObjectType::Cluster => "cluster",
      ObjectType::TimeTable => "timetable",
      ObjectType::Text => "text",
      ObjectType::Pause => "pause",
      ObjectType::MultipleUnit => "multipleunit",
      ObjectType::Booster => "booster",
      ObjectType::Counter => "counter",
    }
  }

  /// Name wie er als objectType in gespeicherten Datensätzen steht
  pub fn record_name(&self) -> &'static str {
    match self {
      ObjectType::None => "None",
      ObjectType::Loco => "Loco",
      ObjectType::Track => "Track",
      ObjectType::Feedback => "Feedback",
      ObjectType::Accessory => "Accessory",
      ObjectType::Switch => "Switch",
      ObjectType::Route => "Route",
      ObjectType::Layer => "Layer",
      ObjectType::Signal => "Signal",
      ObjectType::Cluster => "Cluster",
      ObjectType::TimeTable => "TimeTable",
      ObjectType::Text => "Text",
      ObjectType::Pause => "Pause",
      ObjectType::MultipleUnit => "MultipleUnit",
      ObjectType::Booster => "Booster",
      ObjectType::Counter => "Counter",
    }
  }
}

/// Typ und ID eines Objektes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct ObjectIdentifier {
  object_type: ObjectType,
  object_id: ObjectId,
}

impl ObjectIdentifier {
  /// Nicht gesetzter Identifier
  pub const NONE: ObjectIdentifier = ObjectIdentifier {
    object_type: ObjectType::None,
    object_id: OBJECT_NONE,
  };

  /// Neuer Identifier. Typ None oder ID 0 ergeben immer einen nicht gesetzten Identifier.
  /// # Arguments
  /// * object_type - Typ
  /// * object_id - ID
  pub fn new(object_type: ObjectType, object_id: ObjectId) -> ObjectIdentifier {
    if object_type == ObjectType::None || object_id == OBJECT_NONE {
      ObjectIdentifier::NONE
    } else {
      ObjectIdentifier {
        object_type,
        object_id,
      }
    }
  }

  pub fn loco(object_id: ObjectId) -> ObjectIdentifier {
    ObjectIdentifier::new(ObjectType::Loco, object_id)
  }

  pub fn track(object_id: ObjectId) -> ObjectIdentifier {
    ObjectIdentifier::new(ObjectType::Track, object_id)
  }

  pub fn object_type(&self) -> ObjectType {
    self.object_type
  }

  pub fn object_id(&self) -> ObjectId {
    self.object_id
  }

  pub fn is_set(&self) -> bool {
    self.object_type != ObjectType::None && self.object_id != OBJECT_NONE
  }

  /// Identifier aus Textform wie "track12".
  /// Text ohne bekannten Präfix wird als Track ID interpretiert.
  /// # Arguments
  /// * text - Zu parsender Text
  pub fn from_text(text: &str) -> ObjectIdentifier {
    for object_type in ALL_TYPES {
      if let Some(id) = text.strip_prefix(object_type.name()) {
        return ObjectIdentifier::new(object_type, id.parse().unwrap_or(OBJECT_NONE));
      }
    }
    ObjectIdentifier::new(ObjectType::Track, text.parse().unwrap_or(OBJECT_NONE))
  }

  /// Identifier aus Schlüsselform wie "track=12" in einem geparsten Datensatz.
  /// Der erste Typ mit einer ID != 0 gewinnt.
  /// # Arguments
  /// * arguments - Alle Schlüssel/Werte eines Datensatzes
  pub fn from_arguments(arguments: &HashMap<String, String>) -> ObjectIdentifier {
    for object_type in ALL_TYPES {
      let id = arguments
        .get(object_type.name())
        .and_then(|value| value.parse::<ObjectId>().ok())
        .unwrap_or(OBJECT_NONE);
      if id != OBJECT_NONE {
        return ObjectIdentifier::new(object_type, id);
      }
    }
    ObjectIdentifier::NONE
  }

  /// Schlüsselform "track=12"
  pub fn to_key_value(&self) -> String {
    format!("{}={}", self.object_type.name(), self.object_id)
  }
}

impl fmt::Display for ObjectIdentifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}{}", self.object_type.name(), self.object_id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn normalise_test() {
    assert!(!ObjectIdentifier::new(ObjectType::Track, 0).is_set());
    assert_eq!(
      ObjectIdentifier::new(ObjectType::None, 5),
      ObjectIdentifier::NONE
    );
    let track = ObjectIdentifier::track(5);
    assert!(track.is_set());
    assert_eq!(track.object_type(), ObjectType::Track);
    assert_eq!(track.object_id(), 5);
    assert_ne!(track, ObjectIdentifier::new(ObjectType::Signal, 5));
  }

  #[test]
  fn text_test() {
    let track = ObjectIdentifier::track(12);
    assert_eq!(track.to_string(), "track12");
    assert_eq!(ObjectIdentifier::from_text("track12"), track);
    assert_eq!(
      ObjectIdentifier::from_text("multipleunit3"),
      ObjectIdentifier::new(ObjectType::MultipleUnit, 3)
    );
    assert_eq!(
      ObjectIdentifier::from_text("timetable2"),
      ObjectIdentifier::new(ObjectType::TimeTable, 2)
    );
    //Ohne Präfix -> Track
    assert_eq!(ObjectIdentifier::from_text("7"), ObjectIdentifier::track(7));
    assert!(!ObjectIdentifier::from_text("signalx").is_set());
  }

  #[test]
  fn key_value_test() {
    let signal = ObjectIdentifier::new(ObjectType::Signal, 4);
    assert_eq!(signal.to_key_value(), "signal=4");
    let mut arguments = HashMap::new();
    arguments.insert("track".to_string(), "0".to_string());
    arguments.insert("signal".to_string(), "4".to_string());
    assert_eq!(ObjectIdentifier::from_arguments(&arguments), signal);
    assert_eq!(
      ObjectIdentifier::from_arguments(&HashMap::new()),
      ObjectIdentifier::NONE
    );
  }

  #[test]
  fn object_type_test() {
    for value in 0..=15 {
      assert_eq!(ObjectType::from_u32(value) as u32, value);
    }
    assert_eq!(ObjectType::from_u32(16), ObjectType::None);
  }
}
