//! Entity and marker caches (§4.2).
//!
//! Reads dominate writes roughly 100:1 for both caches, so both are
//! `tokio::sync::RwLock`-guarded maps — the same pattern the rest of this
//! codebase uses for any process-wide shared state touched from async
//! handlers.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::domain::{ObjectId, Soldier, Vehicle};

/// Resolver for soldiers and vehicles referenced mid-stream by objectID.
///
/// The cache is the authoritative source during parsing; backends may read
/// it but must never mutate it except to populate IDs the host itself just
/// announced.
#[derive(Debug, Default)]
pub struct EntityCache {
    soldiers: RwLock<HashMap<ObjectId, Soldier>>,
    vehicles: RwLock<HashMap<ObjectId, Vehicle>>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_soldier(&self, soldier: Soldier) {
        self.soldiers.write().await.insert(soldier.object_id, soldier);
    }

    pub async fn update_soldier(&self, soldier: Soldier) {
        self.soldiers.write().await.insert(soldier.object_id, soldier);
    }

    pub async fn get_soldier(&self, object_id: ObjectId) -> Option<Soldier> {
        self.soldiers.read().await.get(&object_id).cloned()
    }

    pub async fn has_soldier(&self, object_id: ObjectId) -> bool {
        self.soldiers.read().await.contains_key(&object_id)
    }

    pub async fn add_vehicle(&self, vehicle: Vehicle) {
        self.vehicles.write().await.insert(vehicle.object_id, vehicle);
    }

    pub async fn update_vehicle(&self, vehicle: Vehicle) {
        self.vehicles.write().await.insert(vehicle.object_id, vehicle);
    }

    pub async fn get_vehicle(&self, object_id: ObjectId) -> Option<Vehicle> {
        self.vehicles.read().await.get(&object_id).cloned()
    }

    pub async fn has_vehicle(&self, object_id: ObjectId) -> bool {
        self.vehicles.read().await.contains_key(&object_id)
    }

    /// Clears both maps — called at mission end, never at mission start
    /// (the host is expected to re-announce entities for the new mission).
    pub async fn reset(&self) {
        self.soldiers.write().await.clear();
        self.vehicles.write().await.clear();
    }
}

/// Maps a marker's name (the key every subsequent move/delete command uses)
/// to the ID assigned by the storage layer at insert time.
#[derive(Debug, Default)]
pub struct MarkerCache {
    ids: RwLock<HashMap<String, i64>>,
}

impl MarkerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, name: impl Into<String>, id: i64) {
        self.ids.write().await.insert(name.into(), id);
    }

    pub async fn get(&self, name: &str) -> Option<i64> {
        self.ids.read().await.get(name).copied()
    }

    pub async fn delete(&self, name: &str) -> Option<i64> {
        self.ids.write().await.remove(name)
    }

    pub async fn reset(&self) {
        self.ids.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;

    fn soldier(object_id: ObjectId, is_player: bool) -> Soldier {
        Soldier {
            mission_id: 1,
            object_id,
            join_time: chrono::Utc::now(),
            join_frame: 0,
            unit_name: "Alpha 1-1".into(),
            group_id: "A".into(),
            side: Side::West,
            is_player,
            role_description: String::new(),
            class_name: "B_Soldier_F".into(),
            display_name: "Rifleman".into(),
            player_uid: "76561198000000000".into(),
            squad_params: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn add_then_update_replaces_whole_record() {
        let cache = EntityCache::new();
        cache.add_soldier(soldier(42, false)).await;
        let mut updated = soldier(42, true);
        updated.unit_name = "Bravo 2-1".into();
        cache.update_soldier(updated.clone()).await;

        let got = cache.get_soldier(42).await.unwrap();
        assert_eq!(got, updated);
        assert!(got.is_player);
    }

    #[tokio::test]
    async fn reset_clears_soldiers_and_vehicles() {
        let cache = EntityCache::new();
        cache.add_soldier(soldier(1, false)).await;
        cache.reset().await;
        assert!(!cache.has_soldier(1).await);
    }

    #[tokio::test]
    async fn marker_cache_roundtrip_and_delete() {
        let cache = MarkerCache::new();
        cache.set("obj_alpha", 1).await;
        assert_eq!(cache.get("obj_alpha").await, Some(1));
        assert_eq!(cache.delete("obj_alpha").await, Some(1));
        assert_eq!(cache.get("obj_alpha").await, None);
    }
}
