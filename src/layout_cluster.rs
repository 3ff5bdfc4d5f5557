//! Cluster: Gruppe von Gleisen deren Ausrichtung immer zueinander passen muss
//!
//! Jedes Gleis hat ein Invertierungsflag. Die Ausrichtung eines Gleises ist immer
//! Ausrichtung Cluster XOR Invertierung.
//! Lock Reihenfolge: zuerst Mutex des Clusters, danach nur lesend der Zustand der Gleise.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};

use crate::{
  layout_lockable::LockState,
  layout_object_identifier::{ObjectId, ObjectIdentifier, ObjectType},
  layout_objects::{Lockable, Orientation, Track},
  layout_storage::{parse_record, record_bool, record_escape, record_identifier, record_str},
};

/// Gleis in einem Cluster
#[derive(Debug, Clone)]
pub struct ClusterTrack {
  pub track: Arc<Track>,
  pub invert: bool,
}

/// Cluster
#[derive(Debug)]
pub struct Cluster {
  id: ObjectId,
  name: String,
  tracks: Vec<ClusterTrack>,
  orientation: Mutex<Orientation>,
}

impl Cluster {
  /// # Arguments
  /// * id - ID
  /// * name - Name
  /// * orientation - Aktuelle Ausrichtung
  /// * tracks - Alle Gleise mit Invertierungsflag
  pub fn new(
    id: ObjectId, name: &str, orientation: Orientation, tracks: Vec<ClusterTrack>,
  ) -> Cluster {
    Cluster {
      id,
      name: name.to_string(),
      tracks,
      orientation: Mutex::new(orientation),
    }
  }

  pub fn id(&self) -> ObjectId {
    self.id
  }

  pub fn identifier(&self) -> ObjectIdentifier {
    ObjectIdentifier::new(ObjectType::Cluster, self.id)
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn tracks(&self) -> &[ClusterTrack] {
    &self.tracks
  }

  /// Invertierungsflag eines Gleises, None wenn das Gleis nicht zum Cluster gehört
  pub fn track_invert(&self, track_id: ObjectId) -> Option<bool> {
    self
      .tracks
      .iter()
      .find(|member| member.track.id() == track_id)
      .map(|member| member.invert)
  }

  fn guard(&self) -> MutexGuard<'_, Orientation> {
    self.orientation.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn orientation(&self) -> Orientation {
    *self.guard()
  }

  /// Prüfung, muss unter dem Cluster Mutex aufgerufen werden.
  /// Ein Gleis blockiert nur, wenn es belegt ist, nicht durch die anfragende Lok, und
  /// nicht bereits die verlangte Ausrichtung hat.
  fn check(
    &self, current: Orientation, orientation: Orientation, loco: &ObjectIdentifier,
  ) -> bool {
    if current == orientation {
      return true;
    }
    for member in &self.tracks {
      let required = orientation ^ member.invert;
      let (state, owner) = member.track.lockable().snapshot();
      if state == LockState::Free || owner == *loco || member.track.orientation() == required {
        continue;
      }
      debug!(
        "Cluster {}: {} blockiert Ausrichtung {:?}",
        self.name,
        member.track.name(),
        orientation
      );
      return false;
    }
    true
  }

  /// Prüft ob die Ausrichtung durch die Lok geändert werden kann
  /// # Arguments
  /// * orientation - Neue Ausrichtung
  /// * loco - Anfragende Lok
  pub fn can_set_orientation(&self, orientation: Orientation, loco: &ObjectIdentifier) -> bool {
    let current = self.guard();
    self.check(*current, orientation, loco)
  }

  /// Setzt die Ausrichtung des Clusters und aller Gleise.
  /// Prüfung und Änderung erfolgen unter dem gleichen Mutex.
  /// Liefert true wenn die Ausrichtung gesetzt ist (auch wenn unverändert).
  /// # Arguments
  /// * orientation - Neue Ausrichtung
  /// * loco - Anfragende Lok
  pub fn set_orientation(&self, orientation: Orientation, loco: &ObjectIdentifier) -> bool {
    self.change_orientation(orientation, loco).is_some()
  }

  /// Wie set_orientation, liefert aber die Ausrichtung vor der Änderung.
  /// Diese wird unter dem gleichen Mutex gelesen wie die Änderung erfolgt.
  /// None wenn die Ausrichtung blockiert ist.
  pub fn change_orientation(
    &self, orientation: Orientation, loco: &ObjectIdentifier,
  ) -> Option<Orientation> {
    let mut current = self.guard();
    let before = *current;
    if before == orientation {
      return Some(before);
    }
    if !self.check(before, orientation, loco) {
      return None;
    }
    *current = orientation;
    for member in &self.tracks {
      member.track.force_orientation(orientation ^ member.invert);
    }
    info!(
      "Cluster {} Ausrichtung {:?} durch {}",
      self.name, orientation, loco
    );
    Some(before)
  }

  /// Datensatz, Gleise als "id:invert" durch Komma getrennt
  pub fn serialize(&self) -> String {
    let tracks: Vec<String> = self
      .tracks
      .iter()
      .map(|member| format!("{}:{}", member.track.id(), member.invert as u8))
      .collect();
    format!(
      "objectType=Cluster;objectid={};name={};orientation={};tracks={}",
      self.id,
      record_escape(&self.name),
      self.orientation() as u8,
      tracks.join(",")
    )
  }

  /// Aus gespeichertem Datensatz. Nicht vorhandene Gleise werden ignoriert.
  /// # Arguments
  /// * record - Datensatz
  /// * find_track - Liefert das Gleis zu einer ID
  pub fn deserialize(
    record: &str, find_track: impl Fn(ObjectId) -> Option<Arc<Track>>,
  ) -> Option<Cluster> {
    let arguments = parse_record(record);
    let id = record_identifier(&arguments);
    if id.object_type() != ObjectType::Cluster {
      return None;
    }
    let mut tracks = Vec::new();
    for part in record_str(&arguments, "tracks")
      .split(',')
      .filter(|part| !part.is_empty())
    {
      let (track_id, invert) = part.split_once(':').unwrap_or((part, "0"));
      match track_id.parse::<ObjectId>().ok().and_then(|id| find_track(id)) {
        Some(track) => tracks.push(ClusterTrack {
          track,
          invert: invert == "1",
        }),
        None => debug!("Cluster {}: Gleis {} nicht vorhanden", id, track_id),
      }
    }
    Some(Cluster::new(
      id.object_id(),
      &record_str(&arguments, "name"),
      Orientation::from_bool(record_bool(&arguments, "orientation", true)),
      tracks,
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  fn cluster_with_tracks() -> (Cluster, Vec<Arc<Track>>) {
    let tracks: Vec<Arc<Track>> = vec![
      Arc::new(Track::new(1, "Gleis 1", Orientation::Right)),
      Arc::new(Track::new(2, "Gleis 2", Orientation::Left)),
      Arc::new(Track::new(3, "Gleis 3", Orientation::Right)),
    ];
    let cluster = Cluster::new(
      1,
      "Pendel",
      Orientation::Right,
      vec![
        ClusterTrack {
          track: tracks[0].clone(),
          invert: false,
        },
        ClusterTrack {
          track: tracks[1].clone(),
          invert: true,
        },
        ClusterTrack {
          track: tracks[2].clone(),
          invert: false,
        },
      ],
    );
    (cluster, tracks)
  }

  #[test]
  fn set_orientation_free_test() {
    let (cluster, tracks) = cluster_with_tracks();
    let loco = ObjectIdentifier::loco(1);
    assert!(cluster.can_set_orientation(Orientation::Left, &loco));
    assert!(cluster.set_orientation(Orientation::Left, &loco));
    assert_eq!(cluster.orientation(), Orientation::Left);
    for member in cluster.tracks() {
      assert_eq!(member.track.orientation(), Orientation::Left ^ member.invert);
    }
    assert_eq!(tracks[1].orientation(), Orientation::Right);
    //Unverändert ist immer möglich
    assert!(cluster.set_orientation(Orientation::Left, &ObjectIdentifier::loco(2)));
  }

  #[test]
  fn blocked_by_other_loco_test() {
    let (cluster, tracks) = cluster_with_tracks();
    let a = ObjectIdentifier::loco(1);
    let b = ObjectIdentifier::loco(2);
    assert!(tracks[2].reserve(&b));
    assert!(!cluster.can_set_orientation(Orientation::Left, &a));
    assert!(!cluster.set_orientation(Orientation::Left, &a));
    //Keine Änderung
    assert_eq!(cluster.orientation(), Orientation::Right);
    assert_eq!(tracks[0].orientation(), Orientation::Right);
    assert_eq!(tracks[2].orientation(), Orientation::Right);
    //Eigene Reservation blockiert nicht
    assert!(cluster.set_orientation(Orientation::Left, &b));
    assert_eq!(tracks[2].orientation(), Orientation::Left);
  }

  #[test]
  fn matching_orientation_does_not_block_test() {
    let (cluster, tracks) = cluster_with_tracks();
    let a = ObjectIdentifier::loco(1);
    let b = ObjectIdentifier::loco(2);
    //Gleis 3 belegt durch b, hat aber schon die verlangte Ausrichtung
    tracks[2].force_orientation(Orientation::Left);
    assert!(tracks[2].reserve(&b));
    assert!(cluster.set_orientation(Orientation::Left, &a));
    assert_eq!(tracks[2].orientation(), Orientation::Left);
    assert_eq!(tracks[2].owner(), b);
  }

  #[test]
  fn change_orientation_test() {
    let (cluster, tracks) = cluster_with_tracks();
    let a = ObjectIdentifier::loco(1);
    assert_eq!(cluster.change_orientation(Orientation::Left, &a), Some(Orientation::Right));
    assert_eq!(cluster.change_orientation(Orientation::Left, &a), Some(Orientation::Left));
    assert!(tracks[0].reserve(&ObjectIdentifier::loco(2)));
    assert_eq!(cluster.change_orientation(Orientation::Right, &a), None);
    assert_eq!(cluster.orientation(), Orientation::Left);
  }

  #[test]
  fn concurrent_set_orientation_test() {
    let (cluster, _tracks) = cluster_with_tracks();
    let cluster = Arc::new(cluster);
    let threads: Vec<_> = (0..16u16)
      .map(|n| {
        let cluster = cluster.clone();
        thread::spawn(move || {
          let orientation = Orientation::from_bool(n % 2 == 0);
          cluster.set_orientation(orientation, &ObjectIdentifier::loco(n + 1))
        })
      })
      .collect();
    for t in threads {
      assert!(t.join().unwrap());
    }
    let orientation = cluster.orientation();
    for member in cluster.tracks() {
      assert_eq!(member.track.orientation(), orientation ^ member.invert);
    }
  }

  #[test]
  fn serialize_test() {
    let (cluster, tracks) = cluster_with_tracks();
    let record = cluster.serialize();
    assert_eq!(
      record,
      "objectType=Cluster;objectid=1;name=Pendel;orientation=1;tracks=1:0,2:1,3:0"
    );
    //Gleis 3 nicht mehr vorhanden
    let copy = Cluster::deserialize(&record, |id| {
      tracks.iter().find(|t| t.id() == id && id != 3).cloned()
    })
    .expect("Cluster erwartet");
    assert_eq!(copy.tracks().len(), 2);
    assert_eq!(copy.track_invert(2), Some(true));
    assert_eq!(copy.track_invert(3), None);
  }
}
