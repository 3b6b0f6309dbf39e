//! In-memory accumulator backend (§4.9).
//!
//! Buffers an entire mission in RAM, keyed by entity objectID, and at
//! `endMission` composes a single compact v1 replay document: a gzip-
//! compressed JSON file. Optionally hands the finished file to an
//! [`Uploadable`] collaborator. Non-relational, non-streaming — this is the
//! "just write me a file" backend.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::backend::{StorageBackend, UploadMetadata, Uploadable};
use crate::domain::*;
use crate::error::RecorderError;

struct SoldierAccum {
    soldier: Soldier,
    states: Vec<SoldierState>,
    fired: Vec<FiredEvent>,
}

struct VehicleAccum {
    vehicle: Vehicle,
    states: Vec<VehicleState>,
}

struct MarkerAccum {
    marker: Marker,
    states: Vec<MarkerState>,
    deleted_at_frame: Option<i64>,
}

struct Accumulator {
    mission: Mission,
    world: World,
    soldiers: HashMap<ObjectId, SoldierAccum>,
    vehicles: HashMap<ObjectId, VehicleAccum>,
    markers: HashMap<String, MarkerAccum>,
    general_events: Vec<GeneralEvent>,
    hit_events: Vec<HitEvent>,
    kill_events: Vec<HitEvent>,
    time_states: Vec<TimeState>,
    projectile_events: Vec<ProjectileEvent>,
    next_marker_id: i64,
    max_frame: i64,
}

impl Accumulator {
    fn new(mission: Mission, world: World) -> Self {
        Self {
            mission,
            world,
            soldiers: HashMap::new(),
            vehicles: HashMap::new(),
            markers: HashMap::new(),
            general_events: Vec::new(),
            hit_events: Vec::new(),
            kill_events: Vec::new(),
            time_states: Vec::new(),
            projectile_events: Vec::new(),
            next_marker_id: 1,
            max_frame: 0,
        }
    }

    fn note_frame(&mut self, frame: i64) {
        if frame > self.max_frame {
            self.max_frame = frame;
        }
    }
}

pub struct MemoryBackend {
    output_dir: PathBuf,
    uploader: Option<Arc<dyn Uploadable>>,
    extension_version: String,
    extension_build: String,
    tag: String,
    current: Mutex<Option<Accumulator>>,
}

impl MemoryBackend {
    pub fn new(
        output_dir: PathBuf,
        uploader: Option<Arc<dyn Uploadable>>,
        extension_version: String,
        extension_build: String,
        tag: String,
    ) -> Self {
        Self {
            output_dir,
            uploader,
            extension_version,
            extension_build,
            tag,
            current: Mutex::new(None),
        }
    }
}

/// `"[w,h]"` -> `(w, h)`, falling back to `(1.0, 1.0)` on any parse failure.
fn parse_size_pair(raw: &str) -> (f64, f64) {
    let trimmed = raw.trim().trim_start_matches('[').trim_end_matches(']');
    let parts: Vec<&str> = trimmed.split(',').collect();
    if parts.len() != 2 {
        return (1.0, 1.0);
    }
    match (parts[0].trim().parse::<f64>(), parts[1].trim().parse::<f64>()) {
        (Ok(w), Ok(h)) => (w, h),
        _ => (1.0, 1.0),
    }
}

/// Strips a leading `#` from a hex colour; the web viewer would otherwise
/// misparse it as a URL fragment.
fn strip_hash(colour: &str) -> String {
    colour.strip_prefix('#').unwrap_or(colour).to_string()
}

/// Parses a bracketed crew string (`"[[1,\"rifleman\"],[2,\"driver\"]]"`-ish
/// textual form) into a JSON array, falling back to an empty array.
fn parse_crew(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!([]);
    }
    serde_json::from_str(raw).unwrap_or_else(|_| json!([]))
}

fn soldier_state_row(state: &SoldierState) -> Value {
    json!([
        [state.position.x, state.position.y, state.position.z],
        state.bearing,
        state.lifestate,
        state.in_vehicle_object_id.unwrap_or(0),
        state.unit_name,
        state.is_player,
        state.current_role,
        state.group_id,
        state.side,
    ])
}

fn vehicle_state_row(state: &VehicleState) -> Value {
    json!([
        [state.position.x, state.position.y, state.position.z],
        state.bearing,
        state.is_alive as u8,
        parse_crew(&state.crew_raw),
        [state.capture_frame, state.capture_frame],
    ])
}

fn soldier_entity_row(accum: &SoldierAccum) -> Value {
    json!([
        "unit",
        accum.soldier.side,
        accum.soldier.is_player,
        accum.soldier.join_frame,
        accum.soldier.unit_name,
        accum.soldier.group_id,
        accum.soldier.class_name,
        accum.soldier.display_name,
        accum.states.iter().map(soldier_state_row).collect::<Vec<_>>(),
        accum
            .fired
            .iter()
            .map(|f| json!([f.capture_frame, [f.end_position.x, f.end_position.y, f.end_position.z]]))
            .collect::<Vec<_>>(),
    ])
}

fn vehicle_entity_row(accum: &VehicleAccum) -> Value {
    json!([
        "vehicle",
        accum.vehicle.class_name,
        accum.vehicle.display_name,
        accum.vehicle.join_frame,
        accum.states.iter().map(vehicle_state_row).collect::<Vec<_>>(),
    ])
}

fn hit_or_kill_row(event: &HitEvent, label: &str) -> Value {
    let victim_id = event.victim.map(|v| v.object_id).unwrap_or(0);
    let shooter_id = event.shooter.map(|s| s.object_id).unwrap_or(0);
    json!([
        event.capture_frame,
        label,
        victim_id,
        [shooter_id, event.event_text],
        event.distance,
    ])
}

fn magazine_icon_basename(icon: &str) -> String {
    icon.rsplit('/').next().unwrap_or(icon).to_string()
}

/// Classifies a projectile event into either a fired-line append onto the
/// firer's soldier entity, or a standalone marker row.
enum ProjectileClassification {
    FiredLine { firer_object_id: ObjectId, frame: i64, end_position: Position3D },
    Marker(Value),
}

fn classify_projectile(event: &ProjectileEvent) -> ProjectileClassification {
    let is_thrown = event.simulation_type.is_empty() && event.weapon == "throw";
    if event.simulation_type == "shotBullet" || is_thrown {
        let end_position = event
            .trajectory
            .last()
            .map(|p| p.position)
            .unwrap_or_default();
        return ProjectileClassification::FiredLine {
            firer_object_id: event.firer_object_id,
            frame: event.fired_frame,
            end_position,
        };
    }

    let positions: Vec<[f64; 3]> = event
        .trajectory
        .iter()
        .map(|p| [p.position.x, p.position.y, p.position.z])
        .collect();
    let end_frame = event.fired_frame + (event.trajectory.len() as i64).saturating_sub(1).max(0);

    let (colour, marker_type) = if !event.magazine_icon.is_empty() {
        ("ColorWhite".to_string(), format!("magIcons/{}", magazine_icon_basename(&event.magazine_icon)))
    } else {
        ("ColorRed".to_string(), "mil_triangle".to_string())
    };

    let text = if event.simulation_type == "Grenade" {
        event.magazine_display.clone()
    } else if let Some(vehicle_id) = event.vehicle_object_id {
        format!("{vehicle_id} - {} - {}", event.muzzle_display, event.magazine_display)
    } else {
        format!("{} - {}", event.muzzle_display, event.magazine_display)
    };

    ProjectileClassification::Marker(json!([
        marker_type,
        text,
        event.fired_frame,
        end_frame,
        event.firer_object_id,
        colour,
        positions,
    ]))
}

fn marker_row(accum: &MarkerAccum) -> Value {
    let (w, h) = accum.marker.size;
    let end_frame = accum.deleted_at_frame.unwrap_or(-1);
    let positions = match &accum.marker.geometry {
        MarkerGeometry::Point(p) => json!([[p.x, p.y, p.z]]),
        MarkerGeometry::Polyline(points) => {
            json!(points.iter().map(|p| [p.x, p.y]).collect::<Vec<_>>())
        }
    };
    json!([
        accum.marker.marker_type,
        accum.marker.text,
        0,
        end_frame,
        accum.marker.owner_id,
        strip_hash(&accum.marker.color),
        accum.marker.side.index(),
        positions,
        [w, h],
        accum.marker.shape,
        accum.marker.brush,
    ])
}

fn general_event_row(event: &GeneralEvent) -> Value {
    let message = match &event.extra_data {
        Some(v) => v.clone(),
        None => {
            let trimmed = event.message.trim_start();
            if trimmed.starts_with('[') || trimmed.starts_with('{') {
                serde_json::from_str(&event.message).unwrap_or_else(|_| Value::String(event.message.clone()))
            } else {
                Value::String(event.message.clone())
            }
        }
    };
    json!([event.capture_frame, event.name, message])
}

impl Accumulator {
    fn build_document(&self, extension_version: &str, extension_build: &str, tag: &str) -> Value {
        let max_soldier_id = self.soldiers.keys().copied().max().unwrap_or(0);
        let max_vehicle_id = self.vehicles.keys().copied().max().unwrap_or(0);
        let max_id = max_soldier_id.max(max_vehicle_id);

        let mut entities: Vec<Value> = vec![Value::Null; (max_id + 1).max(0) as usize];
        for (id, accum) in &self.soldiers {
            if *id >= 0 {
                entities[*id as usize] = soldier_entity_row(accum);
            }
        }
        for (id, accum) in &self.vehicles {
            if *id >= 0 {
                entities[*id as usize] = vehicle_entity_row(accum);
            }
        }
        // Append synthesised fired-line/marker rows from projectile events
        // onto the relevant firer before building the final entity array.
        for event in &self.projectile_events {
            if let ProjectileClassification::FiredLine { firer_object_id, frame, end_position } =
                classify_projectile(event)
            {
                if let Some(slot) = entities.get_mut(firer_object_id.max(0) as usize) {
                    if let Value::Array(fields) = slot {
                        if let Some(Value::Array(fired)) = fields.get_mut(9) {
                            fired.push(json!([frame, [end_position.x, end_position.y, end_position.z]]));
                        }
                    }
                }
            }
        }

        let mut events: Vec<Value> = Vec::new();
        for event in &self.hit_events {
            events.push(hit_or_kill_row(event, "hit"));
        }
        for event in &self.kill_events {
            events.push(hit_or_kill_row(event, "killed"));
        }
        for event in &self.general_events {
            events.push(general_event_row(event));
        }
        for event in &self.projectile_events {
            if let ProjectileClassification::Marker(hit) = classify_projectile(event) {
                events.push(hit);
            }
            for hit in &event.hits {
                let first = event.trajectory.first().map(|p| p.position);
                let distance = match first {
                    Some(start) => {
                        let dx = start.x - hit.impact_position.x;
                        let dy = start.y - hit.impact_position.y;
                        (dx * dx + dy * dy).sqrt()
                    }
                    None => 0.0,
                };
                events.push(json!([
                    hit.capture_frame,
                    "hit",
                    hit.victim_object_id,
                    [event.firer_object_id, format!("{} [{}]", event.muzzle_display, event.magazine_display)],
                    distance,
                ]));
            }
        }

        let markers: Vec<Value> = self.markers.values().map(marker_row).collect();

        json!({
            "addonVersion": self.mission.addon_version,
            "extensionVersion": extension_version,
            "extensionBuild": extension_build,
            "missionName": self.mission.mission_name,
            "missionAuthor": self.mission.author,
            "worldName": self.world.world_name,
            "endFrame": self.max_frame,
            "captureDelay": self.mission.capture_delay,
            "tags": [tag],
            "times": self.time_states.iter().map(|t| json!([t.capture_frame, t.mission_time])).collect::<Vec<_>>(),
            "entities": entities,
            "events": events,
            "Markers": markers,
        })
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn init(&self) -> Result<(), RecorderError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| RecorderError::Configuration(format!("cannot create output dir: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), RecorderError> {
        Ok(())
    }

    async fn start_mission(&self, mission: Mission, world: World) -> Result<Mission, RecorderError> {
        let mut guard = self.current.lock().await;
        *guard = Some(Accumulator::new(mission.clone(), world));
        Ok(mission)
    }

    async fn end_mission(&self) -> Result<(), RecorderError> {
        let accumulator = self
            .current
            .lock()
            .await
            .take()
            .ok_or_else(|| RecorderError::Configuration("end_mission called with no active mission".into()))?;

        let document = accumulator.build_document(&self.extension_version, &self.extension_build, &self.tag);
        let json_bytes = serde_json::to_vec(&document)
            .map_err(|e| RecorderError::TransientBackend { backend: "memory", source: e.into() })?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json_bytes)
            .map_err(|e| RecorderError::TransientBackend { backend: "memory", source: e.into() })?;
        let gzipped = encoder
            .finish()
            .map_err(|e| RecorderError::TransientBackend { backend: "memory", source: e.into() })?;

        let file_name = format!("{}-{}.json.gz", accumulator.mission.mission_name, accumulator.mission.mission_id);
        let path = self.output_dir.join(&file_name);
        tokio::fs::write(&path, &gzipped)
            .await
            .map_err(|e| RecorderError::TransientBackend { backend: "memory", source: e.into() })?;
        info!(path = %path.display(), bytes = gzipped.len(), "memory backend: wrote replay file");

        if let Some(uploader) = &self.uploader {
            let metadata = UploadMetadata {
                world_name: accumulator.world.world_name.clone(),
                mission_name: accumulator.mission.mission_name.clone(),
                mission_duration_secs: accumulator.max_frame as f64,
                tag: self.tag.clone(),
            };
            if let Err(e) = uploader.upload(&path, metadata).await {
                warn!(error = %e, "memory backend: upload failed");
            }
        }
        Ok(())
    }

    async fn add_soldier(&self, soldier: Soldier) -> Result<(), RecorderError> {
        let mut guard = self.current.lock().await;
        if let Some(accumulator) = guard.as_mut() {
            accumulator.soldiers.insert(
                soldier.object_id,
                SoldierAccum { soldier, states: Vec::new(), fired: Vec::new() },
            );
        }
        Ok(())
    }

    async fn add_vehicle(&self, vehicle: Vehicle) -> Result<(), RecorderError> {
        let mut guard = self.current.lock().await;
        if let Some(accumulator) = guard.as_mut() {
            accumulator
                .vehicles
                .insert(vehicle.object_id, VehicleAccum { vehicle, states: Vec::new() });
        }
        Ok(())
    }

    async fn add_marker(&self, mut marker: Marker) -> Result<i64, RecorderError> {
        let mut guard = self.current.lock().await;
        let accumulator = guard
            .as_mut()
            .ok_or_else(|| RecorderError::Configuration("add_marker called with no active mission".into()))?;
        let id = accumulator.next_marker_id;
        accumulator.next_marker_id += 1;
        marker.marker_id = id;
        accumulator.markers.insert(
            marker.marker_name.clone(),
            MarkerAccum { marker, states: Vec::new(), deleted_at_frame: None },
        );
        Ok(id)
    }

    async fn record_soldier_state(&self, state: SoldierState) -> Result<(), RecorderError> {
        let mut guard = self.current.lock().await;
        if let Some(accumulator) = guard.as_mut() {
            accumulator.note_frame(state.capture_frame);
            if let Some(soldier) = accumulator.soldiers.get_mut(&state.soldier_object_id) {
                soldier.states.push(state);
            }
        }
        Ok(())
    }

    async fn record_vehicle_state(&self, state: VehicleState) -> Result<(), RecorderError> {
        let mut guard = self.current.lock().await;
        if let Some(accumulator) = guard.as_mut() {
            accumulator.note_frame(state.capture_frame);
            if let Some(vehicle) = accumulator.vehicles.get_mut(&state.vehicle_object_id) {
                vehicle.states.push(state);
            }
        }
        Ok(())
    }

    async fn record_marker_state(&self, state: MarkerState) -> Result<(), RecorderError> {
        let mut guard = self.current.lock().await;
        if let Some(accumulator) = guard.as_mut() {
            accumulator.note_frame(state.capture_frame);
            if let Some(marker) = accumulator.markers.values_mut().find(|m| m.marker.marker_id == state.marker_id) {
                marker.states.push(state);
            }
        }
        Ok(())
    }

    async fn delete_marker(&self, marker_id: i64, end_frame: i64) -> Result<(), RecorderError> {
        let mut guard = self.current.lock().await;
        if let Some(accumulator) = guard.as_mut() {
            if let Some(marker) = accumulator.markers.values_mut().find(|m| m.marker.marker_id == marker_id) {
                marker.deleted_at_frame = Some(end_frame);
            }
        }
        Ok(())
    }

    async fn record_fired_event(&self, event: FiredEvent) -> Result<(), RecorderError> {
        let mut guard = self.current.lock().await;
        if let Some(accumulator) = guard.as_mut() {
            accumulator.note_frame(event.capture_frame);
            if let Some(soldier) = accumulator.soldiers.get_mut(&event.firer_object_id) {
                soldier.fired.push(event);
            }
        }
        Ok(())
    }

    async fn record_projectile_event(&self, event: ProjectileEvent) -> Result<(), RecorderError> {
        let mut guard = self.current.lock().await;
        if let Some(accumulator) = guard.as_mut() {
            accumulator.note_frame(event.fired_frame);
            accumulator.projectile_events.push(event);
        }
        Ok(())
    }

    async fn record_general_event(&self, event: GeneralEvent) -> Result<(), RecorderError> {
        let mut guard = self.current.lock().await;
        if let Some(accumulator) = guard.as_mut() {
            accumulator.note_frame(event.capture_frame);
            accumulator.general_events.push(event);
        }
        Ok(())
    }

    async fn record_hit_event(&self, event: HitEvent) -> Result<(), RecorderError> {
        let mut guard = self.current.lock().await;
        if let Some(accumulator) = guard.as_mut() {
            accumulator.note_frame(event.capture_frame);
            accumulator.hit_events.push(event);
        }
        Ok(())
    }

    async fn record_kill_event(&self, event: HitEvent) -> Result<(), RecorderError> {
        let mut guard = self.current.lock().await;
        if let Some(accumulator) = guard.as_mut() {
            accumulator.note_frame(event.capture_frame);
            accumulator.kill_events.push(event);
        }
        Ok(())
    }

    async fn record_chat_event(&self, _event: ChatEvent) -> Result<(), RecorderError> {
        // Not part of the v1 replay document; chat is relational/streaming only.
        Ok(())
    }

    async fn record_radio_event(&self, _event: RadioEvent) -> Result<(), RecorderError> {
        Ok(())
    }

    async fn record_telemetry_event(&self, _event: TelemetryEvent) -> Result<(), RecorderError> {
        Ok(())
    }

    async fn record_time_state(&self, state: TimeState) -> Result<(), RecorderError> {
        let mut guard = self.current.lock().await;
        if let Some(accumulator) = guard.as_mut() {
            accumulator.note_frame(state.capture_frame);
            accumulator.time_states.push(state);
        }
        Ok(())
    }

    async fn record_ace3_death_event(&self, _event: Ace3DeathEvent) -> Result<(), RecorderError> {
        Ok(())
    }

    async fn record_ace3_unconscious_event(&self, _event: Ace3UnconsciousEvent) -> Result<(), RecorderError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_pair_parses_and_falls_back() {
        assert_eq!(parse_size_pair("[2.5,1.0]"), (2.5, 1.0));
        assert_eq!(parse_size_pair("garbage"), (1.0, 1.0));
        assert_eq!(parse_size_pair(""), (1.0, 1.0));
    }

    #[test]
    fn strip_hash_removes_leading_pound() {
        assert_eq!(strip_hash("#ff0000"), "ff0000");
        assert_eq!(strip_hash("ff0000"), "ff0000");
    }

    #[test]
    fn crew_parses_or_falls_back_to_empty_array() {
        assert_eq!(parse_crew(""), json!([]));
        assert_eq!(parse_crew("not json"), json!([]));
        assert_eq!(parse_crew("[[1,\"driver\"]]"), json!([[1, "driver"]]));
    }

    #[test]
    fn thrown_grenade_with_empty_sim_is_a_fired_line() {
        let event = ProjectileEvent {
            mission_id: 1,
            fired_time_nanos: 0,
            fired_frame: 10,
            firer_object_id: 5,
            remote_controller_object_id: None,
            vehicle_object_id: None,
            vehicle_role: String::new(),
            weapon: "throw".to_string(),
            weapon_display: String::new(),
            muzzle: String::new(),
            muzzle_display: String::new(),
            magazine: String::new(),
            magazine_display: String::new(),
            ammo: String::new(),
            fire_mode: String::new(),
            trajectory: vec![ProjectileTrajectoryPoint { fired_time_nanos: 0, position: Position3D { x: 1.0, y: 2.0, z: 3.0 } }],
            initial_velocity: Position3D::default(),
            simulation_type: String::new(),
            is_submunition: false,
            magazine_icon: String::new(),
            hits: vec![],
        };
        match classify_projectile(&event) {
            ProjectileClassification::FiredLine { firer_object_id, .. } => assert_eq!(firer_object_id, 5),
            ProjectileClassification::Marker(_) => panic!("expected fired-line classification"),
        }
    }

    #[test]
    fn bullet_with_magazine_icon_is_white_marker() {
        let event = ProjectileEvent {
            mission_id: 1,
            fired_time_nanos: 0,
            fired_frame: 10,
            firer_object_id: 5,
            remote_controller_object_id: None,
            vehicle_object_id: None,
            vehicle_role: String::new(),
            weapon: "arifle_MX_F".to_string(),
            weapon_display: String::new(),
            muzzle: String::new(),
            muzzle_display: "MX 6.5mm".to_string(),
            magazine: String::new(),
            magazine_display: "30Rnd 6.5mm".to_string(),
            ammo: String::new(),
            fire_mode: String::new(),
            trajectory: vec![
                ProjectileTrajectoryPoint { fired_time_nanos: 0, position: Position3D { x: 0.0, y: 0.0, z: 0.0 } },
                ProjectileTrajectoryPoint { fired_time_nanos: 1, position: Position3D { x: 10.0, y: 0.0, z: 0.0 } },
            ],
            initial_velocity: Position3D::default(),
            simulation_type: "shotRocket".to_string(),
            is_submunition: false,
            magazine_icon: "iconMissile".to_string(),
            hits: vec![],
        };
        match classify_projectile(&event) {
            ProjectileClassification::Marker(v) => {
                assert_eq!(v[0], "magIcons/iconMissile");
                assert_eq!(v[5], "ColorWhite");
            }
            _ => panic!("expected marker classification"),
        }
    }
}
