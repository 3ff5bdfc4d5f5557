//! Speicherung der Anlageobjekte
//!
//! Jedes Objekt wird als ein Datensatz "key=value;key=value;..." gespeichert, beginnend mit
//! "objectType=<Typ>". Die eigentliche Ablage erfolgt über das LayoutStorage Trait.
//!
//! INI File:
//! [layout]
//! storage = /var/lib/mcpd/layout.txt

use std::{
  collections::{BTreeMap, HashMap},
  fs, io,
  path::{Path, PathBuf},
  sync::{Mutex, MutexGuard, PoisonError},
};

use log::{debug, info, warn};
use splitty::split_unquoted_char;
use thiserror::Error;

use crate::layout_object_identifier::{ObjectIdentifier, ObjectType};

/// Fehler beim Speichern / Laden
#[derive(Error, Debug)]
pub enum StorageError {
  #[error("IO Fehler: {0}")]
  Io(#[from] io::Error),
  #[error("ungültiger Datensatz: {0}")]
  InvalidRecord(String),
}

/// Zeichen die in Textwerten eines Datensatzes als %XX geschrieben werden
const ESCAPED_CHARS: [char; 5] = ['%', ';', '"', '\n', '\r'];

/// Freitext (z.B. Namen) für einen Datensatz, Trennzeichen werden als %XX geschrieben
pub fn record_escape(value: &str) -> String {
  let mut escaped = String::with_capacity(value.len());
  for c in value.chars() {
    if ESCAPED_CHARS.contains(&c) {
      escaped.push_str(&format!("%{:02X}", c as u8));
    } else {
      escaped.push(c);
    }
  }
  escaped
}

/// Umkehrung von record_escape. Ungültige Sequenzen bleiben unverändert.
pub fn record_unescape(value: &str) -> String {
  let mut text = String::with_capacity(value.len());
  let mut rest = value;
  while let Some(pos) = rest.find('%') {
    text.push_str(&rest[..pos]);
    rest = &rest[pos..];
    match rest
      .get(1..3)
      .and_then(|hex| u8::from_str_radix(hex, 16).ok())
      .filter(|b| b.is_ascii())
    {
      Some(b) => {
        text.push(b as char);
        rest = &rest[3..];
      }
      None => {
        text.push('%');
        rest = &rest[1..];
      }
    }
  }
  text.push_str(rest);
  text
}

/// Datensatz in Schlüssel/Werte zerlegen
/// # Arguments
/// * record - Datensatz "key=value;key=value"
pub fn parse_record(record: &str) -> HashMap<String, String> {
  let mut arguments = HashMap::new();
  for part in split_unquoted_char(record, ';').unwrap_quotes(true) {
    if let Some((key, value)) = part.split_once('=') {
      arguments.insert(key.trim().to_string(), value.to_string());
    }
  }
  arguments
}

/// Zahlenwert aus Datensatz, default wenn nicht vorhanden oder ungültig
pub fn record_u32(arguments: &HashMap<String, String>, key: &str, default: u32) -> u32 {
  arguments
    .get(key)
    .and_then(|value| value.trim().parse().ok())
    .unwrap_or(default)
}

/// Boolscher Wert aus Datensatz ("1"/"true" oder "0"/"false")
pub fn record_bool(arguments: &HashMap<String, String>, key: &str, default: bool) -> bool {
  match arguments.get(key).map(|value| value.trim()) {
    Some("1") | Some("true") => true,
    Some("0") | Some("false") => false,
    _ => default,
  }
}

/// Text aus Datensatz, leer wenn nicht vorhanden
pub fn record_str(arguments: &HashMap<String, String>, key: &str) -> String {
  arguments
    .get(key)
    .map(|value| record_unescape(value))
    .unwrap_or_default()
}

/// Identifier eines gespeicherten Objektes über "objectType" und "objectid"
pub fn record_identifier(arguments: &HashMap<String, String>) -> ObjectIdentifier {
  let object_type = arguments
    .get("objectType")
    .map(|name| {
      (1..=15)
        .map(ObjectType::from_u32)
        .find(|object_type| object_type.record_name() == name)
        .unwrap_or(ObjectType::None)
    })
    .unwrap_or(ObjectType::None);
  ObjectIdentifier::new(object_type, record_u32(arguments, "objectid", 0) as u16)
}

/// Schnittstelle zur Speicherung
pub trait LayoutStorage: Send + Sync {
  /// Name für Logausgaben
  fn name(&self) -> &'static str;
  /// Speichert oder ersetzt den Datensatz eines Objektes
  /// # Arguments
  /// * id - Objekt
  /// * record - Vollständiger Datensatz
  fn save(&self, id: &ObjectIdentifier, record: String) -> Result<(), StorageError>;
  /// Löscht den Datensatz eines Objektes
  fn delete(&self, id: &ObjectIdentifier) -> Result<(), StorageError>;
  /// Alle Datensätze eines Typs
  fn load_all(&self, object_type: ObjectType) -> Result<Vec<String>, StorageError>;
}

type Records = BTreeMap<(ObjectType, u16), String>;

fn lock_records(records: &Mutex<Records>) -> MutexGuard<'_, Records> {
  records.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key(id: &ObjectIdentifier) -> (ObjectType, u16) {
  (id.object_type(), id.object_id())
}

fn records_of_type(records: &Records, object_type: ObjectType) -> Vec<String> {
  records
    .iter()
    .filter(|((t, _), _)| *t == object_type)
    .map(|(_, record)| record.clone())
    .collect()
}

/// Speicherung nur im Speicher, z.B. ohne [layout] Konfiguration und für Tests
#[derive(Debug, Default)]
pub struct MemoryStorage {
  records: Mutex<Records>,
}

impl MemoryStorage {
  pub fn new() -> MemoryStorage {
    MemoryStorage::default()
  }
}

impl LayoutStorage for MemoryStorage {
  fn name(&self) -> &'static str {
    "memory"
  }

  fn save(&self, id: &ObjectIdentifier, record: String) -> Result<(), StorageError> {
    lock_records(&self.records).insert(key(id), record);
    Ok(())
  }

  fn delete(&self, id: &ObjectIdentifier) -> Result<(), StorageError> {
    lock_records(&self.records).remove(&key(id));
    Ok(())
  }

  fn load_all(&self, object_type: ObjectType) -> Result<Vec<String>, StorageError> {
    Ok(records_of_type(&lock_records(&self.records), object_type))
  }
}

/// Speicherung in einem Textfile, ein Datensatz pro Zeile.
/// Das File wird bei jeder Änderung vollständig über ein temporäres File ersetzt.
#[derive(Debug)]
pub struct FileStorage {
  path: PathBuf,
  records: Mutex<Records>,
}

impl FileStorage {
  /// Öffnet das File und liest alle vorhandenen Datensätze.
  /// Ein nicht vorhandenes File ergibt eine leere Speicherung.
  /// # Arguments
  /// * path - Pfad des Files
  pub fn open(path: &Path) -> Result<FileStorage, StorageError> {
    let mut records = Records::new();
    match fs::read_to_string(path) {
      Ok(content) => {
        for line in content.lines().filter(|line| !line.trim().is_empty()) {
          let id = record_identifier(&parse_record(line));
          if id.is_set() {
            records.insert(key(&id), line.to_string());
          } else {
            warn!("Ungültiger Datensatz ignoriert: {}", line);
          }
        }
      }
      Err(err) if err.kind() == io::ErrorKind::NotFound => {
        info!("{} nicht vorhanden, neue Speicherung", path.display());
      }
      Err(err) => return Err(StorageError::Io(err)),
    }
    debug!("{} Datensätze aus {} gelesen", records.len(), path.display());
    Ok(FileStorage {
      path: path.to_path_buf(),
      records: Mutex::new(records),
    })
  }

  /// Alle Datensätze schreiben
  fn write(&self, records: &Records) -> Result<(), StorageError> {
    let mut tmp = self.path.clone().into_os_string();
    tmp.push(".tmp");
    let mut content = String::new();
    for record in records.values() {
      content.push_str(record);
      content.push('\n');
    }
    fs::write(&tmp, content)?;
    fs::rename(&tmp, &self.path)?;
    Ok(())
  }
}

impl LayoutStorage for FileStorage {
  fn name(&self) -> &'static str {
    "file"
  }

  fn save(&self, id: &ObjectIdentifier, record: String) -> Result<(), StorageError> {
    if record.contains('\n') {
      return Err(StorageError::InvalidRecord(record));
    }
    let mut records = lock_records(&self.records);
    records.insert(key(id), record);
    self.write(&records)
  }

  fn delete(&self, id: &ObjectIdentifier) -> Result<(), StorageError> {
    let mut records = lock_records(&self.records);
    if records.remove(&key(id)).is_some() {
      self.write(&records)?;
    }
    Ok(())
  }

  fn load_all(&self, object_type: ObjectType) -> Result<Vec<String>, StorageError> {
    Ok(records_of_type(&lock_records(&self.records), object_type))
  }
}
