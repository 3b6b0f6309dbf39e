//! Domain model.
//!
//! Plain value types and entity records normalised from host command text.
//! Nothing here talks to a backend or a cache; these are the shapes the
//! parser produces and the backends consume.

use serde::{Deserialize, Serialize};

// ─── Value Types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Position2D {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Position3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position3D {
    pub fn xy(&self) -> Position2D {
        Position2D { x: self.x, y: self.y }
    }
}

pub type Polyline = Vec<Position2D>;

// ─── World / Mission / Addon ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct World {
    pub world_name: String,
    pub display_name: String,
    pub world_size: f64,
    /// Centroid projected into the storage CRS (web mercator), not raw lat/long.
    pub centroid: Position2D,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct PlayableSlots {
    pub east: u32,
    pub west: u32,
    pub indep: u32,
    pub civ: u32,
    pub logic: u32,
}

impl PlayableSlots {
    pub fn from_array(v: [u32; 5]) -> Self {
        PlayableSlots {
            east: v[0],
            west: v[1],
            indep: v[2],
            civ: v[3],
            logic: v[4],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct SideFriendly {
    pub east_west: bool,
    pub east_indep: bool,
    pub west_indep: bool,
}

impl SideFriendly {
    pub fn from_array(v: [bool; 3]) -> Self {
        SideFriendly {
            east_west: v[0],
            east_indep: v[1],
            west_indep: v[2],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Addon {
    pub name: String,
    pub workshop_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mission {
    /// DB/streaming-assigned identifier. 0 means "not yet assigned".
    pub mission_id: i64,
    pub mission_name: String,
    pub briefing_name: String,
    pub on_load_name: String,
    pub author: String,
    pub server_name: String,
    pub server_profile: String,
    pub tag: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub capture_delay: f64,
    pub addon_version: String,
    pub extension_version: String,
    pub playable_slots: PlayableSlots,
    pub side_friendly: SideFriendly,
    pub addons: Vec<Addon>,
    pub world: World,
}

// ─── Sides ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    East,
    West,
    Indep,
    Civ,
    Logic,
    #[default]
    Unknown,
}

impl Side {
    pub fn parse(s: &str) -> Side {
        match s.trim().to_ascii_uppercase().as_str() {
            "EAST" | "OPFOR" => Side::East,
            "WEST" | "BLUFOR" => Side::West,
            "GUER" | "INDEPENDENT" | "INDEP" => Side::Indep,
            "CIV" | "CIVILIAN" => Side::Civ,
            "LOGIC" => Side::Logic,
            _ => Side::Unknown,
        }
    }

    /// Sidebar index used by the v1 replay document (§4.9).
    pub fn index(&self) -> i32 {
        match self {
            Side::East => 0,
            Side::West => 1,
            Side::Indep => 2,
            Side::Civ => 3,
            Side::Logic | Side::Unknown => -1,
        }
    }
}

// ─── Soldier ──────────────────────────────────────────────────────────────

pub type ObjectId = i64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Soldier {
    pub mission_id: i64,
    pub object_id: ObjectId,
    pub join_time: chrono::DateTime<chrono::Utc>,
    pub join_frame: i64,
    pub unit_name: String,
    pub group_id: String,
    pub side: Side,
    pub is_player: bool,
    pub role_description: String,
    pub class_name: String,
    pub display_name: String,
    pub player_uid: String,
    pub squad_params: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct SoldierScores {
    pub infantry_kills: u8,
    pub vehicle_kills: u8,
    pub armor_kills: u8,
    pub air_kills: u8,
    pub deaths: u8,
    pub team_kills: u8,
}

impl SoldierScores {
    pub fn all_zero() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SoldierState {
    pub mission_id: i64,
    pub soldier_object_id: ObjectId,
    pub capture_frame: i64,
    pub position: Position3D,
    pub bearing: f64,
    pub lifestate: u8,
    pub in_vehicle: bool,
    pub in_vehicle_object_id: Option<ObjectId>,
    pub vehicle_role: String,
    pub unit_name: String,
    pub is_player: bool,
    pub current_role: String,
    pub has_stable_vitals: bool,
    pub is_dragged_carried: bool,
    pub stance: String,
    pub group_id: String,
    pub side: Side,
    pub scores: Option<SoldierScores>,
}

// ─── Vehicle ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vehicle {
    pub mission_id: i64,
    pub object_id: ObjectId,
    pub ocap_type: String,
    pub class_name: String,
    pub display_name: String,
    pub customization: String,
    pub join_time: chrono::DateTime<chrono::Utc>,
    pub join_frame: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VehicleState {
    pub mission_id: i64,
    pub vehicle_object_id: ObjectId,
    pub capture_frame: i64,
    pub position: Position3D,
    pub bearing: f64,
    pub is_alive: bool,
    /// Preserved verbatim, including the brackets, per the round-trip invariant.
    pub crew_raw: String,
    pub fuel: f64,
    pub damage: f64,
    pub locked: bool,
    pub engine_on: bool,
    pub side: Side,
    pub vector_dir: Position3D,
    pub vector_up: Position3D,
    pub turret_azimuth: f64,
    pub turret_elevation: f64,
}

// ─── Fired / Projectile ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FiredEvent {
    pub mission_id: i64,
    pub firer_object_id: ObjectId,
    pub capture_frame: i64,
    pub end_position: Position3D,
    pub start_position: Position3D,
    pub weapon: String,
    pub magazine: String,
    pub firing_mode: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VictimKind {
    Soldier,
    Vehicle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectileHit {
    pub victim_object_id: ObjectId,
    pub victim_kind: VictimKind,
    pub impact_position: Position3D,
    pub capture_frame: i64,
    pub components_hit: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectileTrajectoryPoint {
    pub fired_time_nanos: i64,
    pub position: Position3D,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectileEvent {
    pub mission_id: i64,
    pub fired_time_nanos: i64,
    pub fired_frame: i64,
    pub firer_object_id: ObjectId,
    pub remote_controller_object_id: Option<ObjectId>,
    pub vehicle_object_id: Option<ObjectId>,
    pub vehicle_role: String,
    pub weapon: String,
    pub weapon_display: String,
    pub muzzle: String,
    pub muzzle_display: String,
    pub magazine: String,
    pub magazine_display: String,
    pub ammo: String,
    pub fire_mode: String,
    pub trajectory: Vec<ProjectileTrajectoryPoint>,
    pub initial_velocity: Position3D,
    pub simulation_type: String,
    pub is_submunition: bool,
    pub magazine_icon: String,
    pub hits: Vec<ProjectileHit>,
}

// ─── Hit / Kill ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TaggedActor {
    pub object_id: ObjectId,
    pub kind: VictimKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HitEvent {
    pub mission_id: i64,
    pub capture_frame: i64,
    pub victim: Option<TaggedActor>,
    pub shooter: Option<TaggedActor>,
    pub event_text: String,
    pub distance: f64,
}

pub type KillEvent = HitEvent;

// ─── Chat / Radio ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatEvent {
    pub mission_id: i64,
    pub capture_frame: i64,
    pub sender_object_id: Option<ObjectId>,
    pub channel: String,
    pub from_name: String,
    pub sender_name: String,
    pub message: String,
    pub player_uid: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RadioType {
    Sw,
    Lr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RadioEvent {
    pub mission_id: i64,
    pub capture_frame: i64,
    pub sender_object_id: Option<ObjectId>,
    pub radio: String,
    pub radio_type: RadioType,
    pub start_end: String,
    pub channel: i32,
    pub is_additional: bool,
    pub frequency: String,
    pub code: String,
}

// ─── Telemetry / Time ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TelemetryEvent {
    pub mission_id: i64,
    pub capture_frame: i64,
    pub avg_fps: f64,
    pub min_fps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeState {
    pub mission_id: i64,
    pub capture_frame: i64,
    pub system_time_utc: chrono::DateTime<chrono::Utc>,
    pub mission_date: String,
    pub time_multiplier: f64,
    pub mission_time: f64,
}

// ─── Markers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MarkerShape {
    Icon,
    Rectangle,
    Ellipse,
    Polyline,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MarkerGeometry {
    Point(Position3D),
    Polyline(Polyline),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Marker {
    pub mission_id: i64,
    /// Assigned by the storage layer at insert time, not at parse time.
    pub marker_id: i64,
    pub marker_name: String,
    pub direction: f64,
    pub marker_type: String,
    pub text: String,
    pub owner_id: ObjectId,
    pub color: String,
    pub size: (f64, f64),
    pub side: Side,
    pub shape: MarkerShape,
    pub geometry: MarkerGeometry,
    pub alpha: f64,
    pub brush: String,
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarkerState {
    pub mission_id: i64,
    pub marker_id: i64,
    pub capture_frame: i64,
    pub position: Position3D,
    pub direction: f64,
    /// 0 denotes a tombstone (the marker was deleted).
    pub alpha: f64,
}

// ─── Ace3 ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ace3DeathEvent {
    pub mission_id: i64,
    pub capture_frame: i64,
    pub victim_object_id: ObjectId,
    pub reason: String,
    pub last_damage_source_object_id: Option<ObjectId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Ace3UnconsciousEvent {
    pub mission_id: i64,
    pub capture_frame: i64,
    pub subject_object_id: ObjectId,
    pub is_unconscious: bool,
}

// ─── General event ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralEvent {
    pub mission_id: i64,
    pub capture_frame: i64,
    pub name: String,
    pub message: String,
    pub extra_data: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_parse_maps_aliases() {
        assert_eq!(Side::parse("OPFOR"), Side::East);
        assert_eq!(Side::parse("blufor"), Side::West);
        assert_eq!(Side::parse("GUER"), Side::Indep);
        assert_eq!(Side::parse("civilian"), Side::Civ);
        assert_eq!(Side::parse("nonsense"), Side::Unknown);
    }

    #[test]
    fn side_index_matches_replay_contract() {
        assert_eq!(Side::East.index(), 0);
        assert_eq!(Side::West.index(), 1);
        assert_eq!(Side::Indep.index(), 2);
        assert_eq!(Side::Civ.index(), 3);
        assert_eq!(Side::Unknown.index(), -1);
    }

    #[test]
    fn scores_all_zero_default() {
        assert_eq!(SoldierScores::all_zero(), SoldierScores::default());
    }
}
