//! Parser / handler service (§4.4).
//!
//! Converts each command's positional string fields into a typed domain
//! record. A single malformed field fails the whole record; every index
//! into a positional array is a bounds-checked `get` (never a panicking
//! index — the legacy panic-on-short-array behaviour is the one thing this
//! module is explicitly forbidden from reproducing).

use serde::Deserialize;

use crate::cache::EntityCache;
use crate::domain::*;
use crate::error::RecorderError;
use crate::geo::WebMercator;

type ParseResult<T> = Result<T, RecorderError>;

fn parse_err(command: &'static str, field: &'static str, reason: impl Into<String>) -> RecorderError {
    RecorderError::Parse {
        command,
        field,
        reason: reason.into(),
    }
}

fn field<'a>(
    args: &'a [String],
    idx: usize,
    command: &'static str,
    name: &'static str,
) -> ParseResult<&'a str> {
    args.get(idx)
        .map(|s| s.as_str())
        .ok_or_else(|| parse_err(command, name, format!("missing positional field {idx}")))
}

/// Strips one layer of surrounding quotes and unescapes `\"` to `"`.
/// Applied uniformly before any field-specific parsing.
pub fn clean_field(raw: &str) -> String {
    let trimmed = raw.trim();
    let unquoted = if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };
    unquoted.replace("\\\"", "\"")
}

fn strip_brackets(raw: &str) -> &str {
    let s = raw.trim();
    s.strip_prefix('[').unwrap_or(s).strip_suffix(']').unwrap_or(s)
}

pub fn parse_position3(
    raw: &str,
    command: &'static str,
    name: &'static str,
) -> ParseResult<Position3D> {
    let inner = strip_brackets(&clean_field(raw));
    let parts: Vec<&str> = inner.split(',').map(|p| p.trim()).collect();
    if parts.len() < 3 {
        return Err(parse_err(command, name, format!("expected x,y,z, got `{raw}`")));
    }
    let parse_one = |s: &str| {
        s.parse::<f64>()
            .map_err(|e| parse_err(command, name, format!("bad number `{s}`: {e}")))
    };
    Ok(Position3D {
        x: parse_one(parts[0])?,
        y: parse_one(parts[1])?,
        z: parse_one(parts[2])?,
    })
}

pub fn parse_polyline(raw: &str, command: &'static str, name: &'static str) -> ParseResult<Polyline> {
    let cleaned = clean_field(raw);
    let points: Vec<Vec<f64>> = serde_json::from_str(&cleaned)
        .map_err(|e| parse_err(command, name, format!("not a nested array: {e}")))?;
    if points.len() < 2 {
        return Err(parse_err(command, name, "polyline needs at least two points"));
    }
    points
        .into_iter()
        .map(|p| {
            if p.len() < 2 {
                Err(parse_err(command, name, "polyline point needs x,y"))
            } else {
                Ok(Position2D { x: p[0], y: p[1] })
            }
        })
        .collect()
}

/// Comma-separated sextuple of 8-bit counters. A length other than six is
/// *not* a parse failure — it falls back to all-zero.
pub fn parse_scores(raw: &str) -> SoldierScores {
    let cleaned = clean_field(raw);
    let parts: Vec<&str> = cleaned.split(',').map(|p| p.trim()).collect();
    if parts.len() != 6 {
        return SoldierScores::all_zero();
    }
    let nums: Option<Vec<u8>> = parts.iter().map(|p| p.parse::<u8>().ok()).collect();
    match nums {
        Some(n) if n.len() == 6 => SoldierScores {
            infantry_kills: n[0],
            vehicle_kills: n[1],
            armor_kills: n[2],
            air_kills: n[3],
            deaths: n[4],
            team_kills: n[5],
        },
        _ => SoldierScores::all_zero(),
    }
}

/// Parses a `"[w,h]"` marker size. Any failure yields `(1.0, 1.0)`.
pub fn parse_size(raw: &str) -> (f64, f64) {
    let inner = strip_brackets(&clean_field(raw));
    let parts: Vec<&str> = inner.split(',').map(|p| p.trim()).collect();
    if parts.len() != 2 {
        return (1.0, 1.0);
    }
    match (parts[0].parse::<f64>(), parts[1].parse::<f64>()) {
        (Ok(w), Ok(h)) => (w, h),
        _ => (1.0, 1.0),
    }
}

/// Parses a bracketed integer list such as `"[20,21]"` into IDs, used by
/// both the vehicle-state crew field (at replay-build time, not parse time)
/// and general list-shaped fields. Falls back to an empty vec on any
/// failure, including an empty string.
pub fn parse_int_list(raw: &str) -> Vec<i64> {
    let cleaned = clean_field(raw);
    let inner = strip_brackets(&cleaned);
    if inner.trim().is_empty() {
        return Vec::new();
    }
    inner
        .split(',')
        .map(|p| p.trim().parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .unwrap_or_default()
}

fn classify(
    object_id: ObjectId,
    soldier_found: bool,
    vehicle_found: bool,
) -> Option<TaggedActor> {
    if vehicle_found {
        Some(TaggedActor {
            object_id,
            kind: VictimKind::Vehicle,
        })
    } else if soldier_found {
        Some(TaggedActor {
            object_id,
            kind: VictimKind::Soldier,
        })
    } else {
        None
    }
}

// ─── :NEW:MISSION: ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorldJson {
    world_name: String,
    display_name: String,
    world_size: f64,
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MissionJson {
    mission_name: String,
    #[serde(default)]
    briefing_name: String,
    #[serde(default)]
    on_load_name: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    server_name: String,
    #[serde(default)]
    server_profile: String,
    #[serde(default)]
    tag: String,
    capture_delay: f64,
    #[serde(default)]
    addon_version: String,
    #[serde(default)]
    extension_version: String,
    playable_slots: [u32; 5],
    side_friendly: [bool; 3],
}

fn workshop_id_to_string(v: &serde_json::Value) -> ParseResult<String> {
    match v {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(parse_err(
            ":NEW:MISSION:",
            "addons[].workshopID",
            format!("expected number or string, got {other}"),
        )),
    }
}

fn parse_addons(mission_json_raw: &str) -> ParseResult<Vec<Addon>> {
    let raw: serde_json::Value = serde_json::from_str(mission_json_raw)
        .map_err(|e| parse_err(":NEW:MISSION:", "missionJSON", e.to_string()))?;
    let Some(addons) = raw.get("addons").and_then(|v| v.as_array()) else {
        return Ok(Vec::new());
    };
    addons
        .iter()
        .map(|entry| {
            let pair = entry
                .as_array()
                .ok_or_else(|| parse_err(":NEW:MISSION:", "addons[]", "expected [name, workshopID]"))?;
            let name = pair
                .first()
                .and_then(|v| v.as_str())
                .ok_or_else(|| parse_err(":NEW:MISSION:", "addons[].name", "missing name"))?
                .to_string();
            let workshop_id = pair
                .get(1)
                .ok_or_else(|| parse_err(":NEW:MISSION:", "addons[].workshopID", "missing workshopID"))
                .and_then(workshop_id_to_string)?;
            Ok(Addon { name, workshop_id })
        })
        .collect()
}

pub fn parse_new_mission(args: &[String]) -> ParseResult<(World, Mission)> {
    let world_raw = field(args, 0, ":NEW:MISSION:", "worldJSON")?;
    let mission_raw = field(args, 1, ":NEW:MISSION:", "missionJSON")?;

    let world_json: WorldJson = serde_json::from_str(world_raw)
        .map_err(|e| parse_err(":NEW:MISSION:", "worldJSON", e.to_string()))?;
    let mission_json: MissionJson = serde_json::from_str(mission_raw)
        .map_err(|e| parse_err(":NEW:MISSION:", "missionJSON", e.to_string()))?;
    let addons = parse_addons(mission_raw)?;

    let centroid = WebMercator::project(world_json.latitude, world_json.longitude);
    let world = World {
        world_name: world_json.world_name,
        display_name: world_json.display_name,
        world_size: world_json.world_size,
        centroid,
    };

    let mission = Mission {
        mission_id: 0,
        mission_name: mission_json.mission_name,
        briefing_name: mission_json.briefing_name,
        on_load_name: mission_json.on_load_name,
        author: mission_json.author,
        server_name: mission_json.server_name,
        server_profile: mission_json.server_profile,
        tag: mission_json.tag,
        start_time: chrono::Utc::now(),
        capture_delay: mission_json.capture_delay,
        addon_version: mission_json.addon_version,
        extension_version: mission_json.extension_version,
        playable_slots: PlayableSlots::from_array(mission_json.playable_slots),
        side_friendly: SideFriendly::from_array(mission_json.side_friendly),
        addons,
        world: world.clone(),
    };

    Ok((world, mission))
}

// ─── :NEW:SOLDIER: ────────────────────────────────────────────────────────

pub fn parse_new_soldier(mission_id: i64, args: &[String]) -> ParseResult<Soldier> {
    const CMD: &str = ":NEW:SOLDIER:";
    let join_frame = field(args, 0, CMD, "frame")?
        .parse::<i64>()
        .map_err(|e| parse_err(CMD, "frame", e.to_string()))?;
    let object_id = field(args, 1, CMD, "ocapId")?
        .parse::<ObjectId>()
        .map_err(|e| parse_err(CMD, "ocapId", e.to_string()))?;
    let unit_name = clean_field(field(args, 2, CMD, "name")?);
    let group_id = clean_field(field(args, 3, CMD, "groupId")?);
    let side = Side::parse(field(args, 4, CMD, "side")?);
    let is_player = clean_field(field(args, 5, CMD, "isPlayer")?) == "true";
    let role_description = clean_field(field(args, 6, CMD, "roleDescription")?);
    let class_name = clean_field(field(args, 7, CMD, "className")?);
    let display_name = clean_field(field(args, 8, CMD, "displayName")?);
    let player_uid = clean_field(field(args, 9, CMD, "playerUID")?);
    let squad_params_raw = field(args, 10, CMD, "squadParamsJSON")?;
    let squad_params: serde_json::Value =
        serde_json::from_str(squad_params_raw).unwrap_or(serde_json::Value::Null);

    Ok(Soldier {
        mission_id,
        object_id,
        join_time: chrono::Utc::now(),
        join_frame,
        unit_name,
        group_id,
        side,
        is_player,
        role_description,
        class_name,
        display_name,
        player_uid,
        squad_params,
    })
}

// ─── :NEW:SOLDIER:STATE: ──────────────────────────────────────────────────

pub async fn parse_new_soldier_state(
    mission_id: i64,
    args: &[String],
    cache: &EntityCache,
) -> ParseResult<SoldierState> {
    const CMD: &str = ":NEW:SOLDIER:STATE:";
    let object_id = field(args, 0, CMD, "ocapId")?
        .parse::<ObjectId>()
        .map_err(|e| parse_err(CMD, "ocapId", e.to_string()))?;
    let position = parse_position3(field(args, 1, CMD, "pos")?, CMD, "pos")?;
    let bearing = field(args, 2, CMD, "bearing")?
        .parse::<f64>()
        .map_err(|e| parse_err(CMD, "bearing", e.to_string()))?;
    let lifestate = field(args, 3, CMD, "lifestate")?
        .parse::<u8>()
        .map_err(|e| parse_err(CMD, "lifestate", e.to_string()))?;
    let in_vehicle = clean_field(field(args, 4, CMD, "inVehicle")?) == "true";
    let unit_name = clean_field(field(args, 5, CMD, "name")?);
    let is_player = clean_field(field(args, 6, CMD, "isPlayer")?) == "true";
    let current_role = clean_field(field(args, 7, CMD, "role")?);
    // field(args, 8, ..) is frame — carried by the dispatcher envelope, not the row itself.
    let has_stable_vitals = clean_field(field(args, 9, CMD, "hasStableVitals")?) == "true";
    let is_dragged_carried = clean_field(field(args, 10, CMD, "isDraggedCarried")?) == "true";
    let scores_raw = field(args, 11, CMD, "scores")?;
    let vehicle_role = clean_field(field(args, 12, CMD, "vehicleRole")?);
    let in_vehicle_ocap_id = field(args, 13, CMD, "inVehicleOcapId")?
        .parse::<i64>()
        .map_err(|e| parse_err(CMD, "inVehicleOcapId", e.to_string()))?;
    let stance = clean_field(field(args, 14, CMD, "stance")?);

    let scores = if is_player { Some(parse_scores(scores_raw)) } else { None };
    let in_vehicle_object_id = if in_vehicle_ocap_id == -1 {
        None
    } else {
        Some(in_vehicle_ocap_id)
    };

    // 17-field variant overrides the cached group/side; 15-field inherits them.
    let (group_id, side) = if args.len() >= 17 {
        (
            clean_field(field(args, 15, CMD, "groupID")?),
            Side::parse(field(args, 16, CMD, "side")?),
        )
    } else {
        match cache.get_soldier(object_id).await {
            Some(s) => (s.group_id, s.side),
            None => {
                return Err(RecorderError::CacheMiss {
                    command: CMD,
                    cache: "entity",
                    id: object_id,
                })
            }
        }
    };

    Ok(SoldierState {
        mission_id,
        soldier_object_id: object_id,
        capture_frame: field(args, 8, CMD, "frame")?
            .parse::<i64>()
            .map_err(|e| parse_err(CMD, "frame", e.to_string()))?,
        position,
        bearing,
        lifestate,
        in_vehicle,
        in_vehicle_object_id,
        vehicle_role,
        unit_name,
        is_player,
        current_role,
        has_stable_vitals,
        is_dragged_carried,
        stance,
        group_id,
        side,
        scores,
    })
}

// ─── :NEW:VEHICLE: / :NEW:VEHICLE:STATE: ──────────────────────────────────

pub fn parse_new_vehicle(mission_id: i64, args: &[String]) -> ParseResult<Vehicle> {
    const CMD: &str = ":NEW:VEHICLE:";
    let join_frame = field(args, 0, CMD, "frame")?
        .parse::<i64>()
        .map_err(|e| parse_err(CMD, "frame", e.to_string()))?;
    let object_id = field(args, 1, CMD, "ocapId")?
        .parse::<ObjectId>()
        .map_err(|e| parse_err(CMD, "ocapId", e.to_string()))?;
    Ok(Vehicle {
        mission_id,
        object_id,
        ocap_type: clean_field(field(args, 2, CMD, "ocapType")?),
        display_name: clean_field(field(args, 3, CMD, "displayName")?),
        class_name: clean_field(field(args, 4, CMD, "className")?),
        customization: clean_field(field(args, 5, CMD, "customization")?),
        join_time: chrono::Utc::now(),
        join_frame,
    })
}

pub fn parse_new_vehicle_state(mission_id: i64, args: &[String]) -> ParseResult<VehicleState> {
    const CMD: &str = ":NEW:VEHICLE:STATE:";
    let object_id = field(args, 0, CMD, "ocapId")?
        .parse::<ObjectId>()
        .map_err(|e| parse_err(CMD, "ocapId", e.to_string()))?;
    let position = parse_position3(field(args, 1, CMD, "pos")?, CMD, "pos")?;
    let bearing = field(args, 2, CMD, "bearing")?
        .parse::<f64>()
        .map_err(|e| parse_err(CMD, "bearing", e.to_string()))?;
    let is_alive = clean_field(field(args, 3, CMD, "alive")?) == "true";
    // Preserved verbatim, including empty "[]" — not re-serialised.
    let crew_raw = clean_field(field(args, 4, CMD, "crew")?);
    let capture_frame = field(args, 5, CMD, "frame")?
        .parse::<i64>()
        .map_err(|e| parse_err(CMD, "frame", e.to_string()))?;
    let fuel = field(args, 6, CMD, "fuel")?
        .parse::<f64>()
        .map_err(|e| parse_err(CMD, "fuel", e.to_string()))?;
    let damage = field(args, 7, CMD, "damage")?
        .parse::<f64>()
        .map_err(|e| parse_err(CMD, "damage", e.to_string()))?;
    let engine_on = clean_field(field(args, 8, CMD, "engineOn")?) == "true";
    let locked = clean_field(field(args, 9, CMD, "locked")?) == "true";
    let side = Side::parse(field(args, 10, CMD, "side")?);
    let vector_dir = parse_position3(field(args, 11, CMD, "vectorDir")?, CMD, "vectorDir")?;
    let vector_up = parse_position3(field(args, 12, CMD, "vectorUp")?, CMD, "vectorUp")?;
    let turret_azimuth = field(args, 13, CMD, "turretAz")?
        .parse::<f64>()
        .map_err(|e| parse_err(CMD, "turretAz", e.to_string()))?;
    let turret_elevation = field(args, 14, CMD, "turretEl")?
        .parse::<f64>()
        .map_err(|e| parse_err(CMD, "turretEl", e.to_string()))?;

    Ok(VehicleState {
        mission_id,
        vehicle_object_id: object_id,
        capture_frame,
        position,
        bearing,
        is_alive,
        crew_raw,
        fuel,
        damage,
        locked,
        engine_on,
        side,
        vector_dir,
        vector_up,
        turret_azimuth,
        turret_elevation,
    })
}

// ─── :FIRED: ──────────────────────────────────────────────────────────────

pub fn parse_fired(mission_id: i64, args: &[String]) -> ParseResult<FiredEvent> {
    const CMD: &str = ":FIRED:";
    let firer_object_id = field(args, 0, CMD, "ocapId")?
        .parse::<ObjectId>()
        .map_err(|e| parse_err(CMD, "ocapId", e.to_string()))?;
    let capture_frame = field(args, 1, CMD, "frame")?
        .parse::<i64>()
        .map_err(|e| parse_err(CMD, "frame", e.to_string()))?;
    let end_position = parse_position3(field(args, 2, CMD, "endPos")?, CMD, "endPos")?;
    let start_position = parse_position3(field(args, 3, CMD, "startPos")?, CMD, "startPos")?;
    Ok(FiredEvent {
        mission_id,
        firer_object_id,
        capture_frame,
        end_position,
        start_position,
        weapon: clean_field(field(args, 4, CMD, "weapon")?),
        magazine: clean_field(field(args, 5, CMD, "magazine")?),
        firing_mode: clean_field(field(args, 6, CMD, "firingMode")?),
    })
}

// ─── :PROJECTILE: ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ProjectileJson {
    #[serde(rename = "firedTime")]
    fired_time: String,
    #[serde(rename = "firedFrame")]
    fired_frame: i64,
    #[serde(rename = "firerID")]
    firer_id: ObjectId,
    #[serde(rename = "remoteControllerID", default)]
    remote_controller_id: Option<ObjectId>,
    #[serde(rename = "vehicleID", default)]
    vehicle_id: Option<ObjectId>,
    #[serde(rename = "vehicleRole", default)]
    vehicle_role: String,
    #[serde(default)]
    weapon: String,
    #[serde(rename = "weaponDisplay", default)]
    weapon_display: String,
    #[serde(default)]
    muzzle: String,
    #[serde(rename = "muzzleDisplay", default)]
    muzzle_display: String,
    #[serde(default)]
    magazine: String,
    #[serde(rename = "magazineDisplay", default)]
    magazine_display: String,
    #[serde(default)]
    ammo: String,
    #[serde(rename = "fireMode", default)]
    fire_mode: String,
    positions: Vec<(String, serde_json::Value, String)>,
    #[serde(rename = "initialVelocity")]
    initial_velocity: [f64; 3],
    #[serde(rename = "hitParts", default)]
    hit_parts: Vec<(ObjectId, Vec<String>, String, i64)>,
    #[serde(rename = "simulationType", default)]
    simulation_type: String,
    #[serde(rename = "isSubmunition", default)]
    is_submunition: bool,
    #[serde(rename = "magazineIcon", default)]
    magazine_icon: String,
}

pub async fn parse_projectile(
    mission_id: i64,
    raw: &str,
    cache: &EntityCache,
) -> ParseResult<ProjectileEvent> {
    const CMD: &str = ":PROJECTILE:";
    let json: ProjectileJson =
        serde_json::from_str(&clean_field(raw)).map_err(|e| parse_err(CMD, "payload", e.to_string()))?;

    let fired_time_nanos = json
        .fired_time
        .parse::<i64>()
        .map_err(|e| parse_err(CMD, "firedTime", e.to_string()))?;

    let mut trajectory = Vec::with_capacity(json.positions.len());
    for (time_str, _, pos_str) in &json.positions {
        let nanos = time_str
            .parse::<i64>()
            .map_err(|e| parse_err(CMD, "positions[].time", e.to_string()))?;
        let position = parse_position3(pos_str, CMD, "positions[].pos")?;
        trajectory.push(ProjectileTrajectoryPoint {
            fired_time_nanos: nanos,
            position,
        });
    }

    let mut hits = Vec::with_capacity(json.hit_parts.len());
    for (hit_id, components, pos_str, frame) in &json.hit_parts {
        let impact_position = parse_position3(pos_str, CMD, "hitParts[].pos")?;
        let kind = if cache.has_vehicle(*hit_id).await {
            Some(VictimKind::Vehicle)
        } else if cache.has_soldier(*hit_id).await {
            Some(VictimKind::Soldier)
        } else {
            None
        };
        let Some(kind) = kind else {
            tracing::warn!(hit_id, "projectile hit target not found in either cache");
            continue;
        };
        hits.push(ProjectileHit {
            victim_object_id: *hit_id,
            victim_kind: kind,
            impact_position,
            capture_frame: *frame,
            components_hit: components.clone(),
        });
    }

    Ok(ProjectileEvent {
        mission_id,
        fired_time_nanos,
        fired_frame: json.fired_frame,
        firer_object_id: json.firer_id,
        remote_controller_object_id: json.remote_controller_id,
        vehicle_object_id: json.vehicle_id,
        vehicle_role: json.vehicle_role,
        weapon: json.weapon,
        weapon_display: json.weapon_display,
        muzzle: json.muzzle,
        muzzle_display: json.muzzle_display,
        magazine: json.magazine,
        magazine_display: json.magazine_display,
        ammo: json.ammo,
        fire_mode: json.fire_mode,
        trajectory,
        initial_velocity: Position3D {
            x: json.initial_velocity[0],
            y: json.initial_velocity[1],
            z: json.initial_velocity[2],
        },
        simulation_type: json.simulation_type,
        is_submunition: json.is_submunition,
        magazine_icon: json.magazine_icon,
        hits,
    })
}

// ─── :EVENT: ──────────────────────────────────────────────────────────────

pub fn parse_general_event(mission_id: i64, args: &[String]) -> ParseResult<GeneralEvent> {
    const CMD: &str = ":EVENT:";
    let capture_frame = field(args, 0, CMD, "frame")?
        .parse::<i64>()
        .map_err(|e| parse_err(CMD, "frame", e.to_string()))?;
    let name = clean_field(field(args, 1, CMD, "name")?);
    let message = clean_field(field(args, 2, CMD, "message")?);
    let extra_data = args
        .get(3)
        .map(|raw| clean_field(raw))
        .filter(|s| !s.is_empty())
        .and_then(|s| serde_json::from_str(&s).ok());

    Ok(GeneralEvent {
        mission_id,
        capture_frame,
        name,
        message,
        extra_data,
    })
}

// ─── :HIT: / :KILL: ───────────────────────────────────────────────────────

pub async fn parse_hit_or_kill(
    mission_id: i64,
    command: &'static str,
    args: &[String],
    cache: &EntityCache,
) -> ParseResult<HitEvent> {
    let capture_frame = field(args, 0, command, "frame")?
        .parse::<i64>()
        .map_err(|e| parse_err(command, "frame", e.to_string()))?;
    let victim_id = field(args, 1, command, "victimOcapId")?
        .parse::<ObjectId>()
        .map_err(|e| parse_err(command, "victimOcapId", e.to_string()))?;
    let shooter_id = field(args, 2, command, "shooterOcapId")?
        .parse::<ObjectId>()
        .map_err(|e| parse_err(command, "shooterOcapId", e.to_string()))?;
    let event_text = clean_field(field(args, 3, command, "eventText")?);
    let distance = field(args, 4, command, "distance")?
        .parse::<f64>()
        .map_err(|e| parse_err(command, "distance", e.to_string()))?;

    let victim = classify(
        victim_id,
        cache.has_soldier(victim_id).await,
        cache.has_vehicle(victim_id).await,
    );
    let shooter = classify(
        shooter_id,
        cache.has_soldier(shooter_id).await,
        cache.has_vehicle(shooter_id).await,
    );
    if victim.is_none() {
        return Err(RecorderError::CacheMiss {
            command,
            cache: "entity",
            id: victim_id,
        });
    }

    Ok(HitEvent {
        mission_id,
        capture_frame,
        victim,
        shooter,
        event_text,
        distance,
    })
}

// ─── :CHAT: ───────────────────────────────────────────────────────────────

fn chat_channel_name(channel_int: i64) -> &'static str {
    match channel_int {
        0 => "Global",
        1 => "Side",
        2 => "Command",
        3 => "Group",
        4 => "Vehicle",
        5 => "Direct",
        16 => "System",
        6..=15 => "Custom",
        _ => "System",
    }
}

pub fn parse_chat(mission_id: i64, args: &[String]) -> ParseResult<ChatEvent> {
    const CMD: &str = ":CHAT:";
    let capture_frame = field(args, 0, CMD, "frame")?
        .parse::<i64>()
        .map_err(|e| parse_err(CMD, "frame", e.to_string()))?;
    let sender_raw = field(args, 1, CMD, "senderOcapId")?
        .parse::<i64>()
        .map_err(|e| parse_err(CMD, "senderOcapId", e.to_string()))?;
    let channel_int = field(args, 2, CMD, "channelInt")?
        .parse::<i64>()
        .map_err(|e| parse_err(CMD, "channelInt", e.to_string()))?;

    Ok(ChatEvent {
        mission_id,
        capture_frame,
        sender_object_id: if sender_raw == -1 { None } else { Some(sender_raw) },
        channel: chat_channel_name(channel_int).to_string(),
        from_name: clean_field(field(args, 3, CMD, "fromName")?),
        sender_name: clean_field(field(args, 4, CMD, "senderName")?),
        message: clean_field(field(args, 5, CMD, "text")?),
        player_uid: clean_field(field(args, 6, CMD, "playerUID")?),
    })
}

// ─── :RADIO: ──────────────────────────────────────────────────────────────

pub fn parse_radio(mission_id: i64, args: &[String]) -> ParseResult<RadioEvent> {
    const CMD: &str = ":RADIO:";
    let capture_frame = field(args, 0, CMD, "frame")?
        .parse::<i64>()
        .map_err(|e| parse_err(CMD, "frame", e.to_string()))?;
    let sender_raw = field(args, 1, CMD, "senderOcapId")?
        .parse::<i64>()
        .map_err(|e| parse_err(CMD, "senderOcapId", e.to_string()))?;
    let radio_type_raw = clean_field(field(args, 3, CMD, "radioType")?);
    let radio_type = match radio_type_raw.to_ascii_uppercase().as_str() {
        "SW" => RadioType::Sw,
        "LR" => RadioType::Lr,
        other => return Err(parse_err(CMD, "radioType", format!("unknown radio type `{other}`"))),
    };
    let channel = field(args, 5, CMD, "channel")?
        .parse::<i32>()
        .map_err(|e| parse_err(CMD, "channel", e.to_string()))?;

    Ok(RadioEvent {
        mission_id,
        capture_frame,
        sender_object_id: if sender_raw == -1 { None } else { Some(sender_raw) },
        radio: clean_field(field(args, 2, CMD, "radio")?),
        radio_type,
        start_end: clean_field(field(args, 4, CMD, "startEnd")?),
        channel,
        is_additional: clean_field(field(args, 6, CMD, "isAdditional")?) == "true",
        frequency: clean_field(field(args, 7, CMD, "frequency")?),
        code: clean_field(field(args, 8, CMD, "code")?),
    })
}

// ─── :FPS: ────────────────────────────────────────────────────────────────

pub fn parse_fps(mission_id: i64, args: &[String]) -> ParseResult<TelemetryEvent> {
    const CMD: &str = ":FPS:";
    let capture_frame = field(args, 0, CMD, "frame")?
        .parse::<i64>()
        .map_err(|e| parse_err(CMD, "frame", e.to_string()))?;
    let avg_fps = field(args, 1, CMD, "avgFps")?
        .parse::<f64>()
        .map_err(|e| parse_err(CMD, "avgFps", e.to_string()))?;
    let min_fps = field(args, 2, CMD, "minFps")?
        .parse::<f64>()
        .map_err(|e| parse_err(CMD, "minFps", e.to_string()))?;
    Ok(TelemetryEvent {
        mission_id,
        capture_frame,
        avg_fps,
        min_fps,
    })
}

// ─── :NEW:TIME:STATE: ─────────────────────────────────────────────────────

pub fn parse_time_state(mission_id: i64, args: &[String]) -> ParseResult<TimeState> {
    const CMD: &str = ":NEW:TIME:STATE:";
    let capture_frame = field(args, 0, CMD, "frame")?
        .parse::<i64>()
        .map_err(|e| parse_err(CMD, "frame", e.to_string()))?;
    let system_time_raw = clean_field(field(args, 1, CMD, "systemTimeUTC")?);
    let system_time_utc = chrono::DateTime::parse_from_rfc3339(&system_time_raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| parse_err(CMD, "systemTimeUTC", e.to_string()))?;
    let mission_date = clean_field(field(args, 2, CMD, "missionDateTime")?);
    let time_multiplier = field(args, 3, CMD, "timeMultiplier")?
        .parse::<f64>()
        .map_err(|e| parse_err(CMD, "timeMultiplier", e.to_string()))?;
    let mission_time = field(args, 4, CMD, "missionTime")?
        .parse::<f64>()
        .map_err(|e| parse_err(CMD, "missionTime", e.to_string()))?;

    Ok(TimeState {
        mission_id,
        capture_frame,
        system_time_utc,
        mission_date,
        time_multiplier,
        mission_time,
    })
}

// ─── :ACE3:DEATH: / :ACE3:UNCONSCIOUS: ────────────────────────────────────

pub fn parse_ace3_death(mission_id: i64, args: &[String]) -> ParseResult<Ace3DeathEvent> {
    const CMD: &str = ":ACE3:DEATH:";
    let capture_frame = field(args, 0, CMD, "frame")?
        .parse::<i64>()
        .map_err(|e| parse_err(CMD, "frame", e.to_string()))?;
    let victim_object_id = field(args, 1, CMD, "victimOcapId")?
        .parse::<ObjectId>()
        .map_err(|e| parse_err(CMD, "victimOcapId", e.to_string()))?;
    let reason = clean_field(field(args, 2, CMD, "reason")?);
    let last_damage_source_raw = field(args, 3, CMD, "lastDamageSourceOcapId")?
        .parse::<i64>()
        .map_err(|e| parse_err(CMD, "lastDamageSourceOcapId", e.to_string()))?;

    Ok(Ace3DeathEvent {
        mission_id,
        capture_frame,
        victim_object_id,
        reason,
        last_damage_source_object_id: if last_damage_source_raw == -1 {
            None
        } else {
            Some(last_damage_source_raw)
        },
    })
}

pub fn parse_ace3_unconscious(mission_id: i64, args: &[String]) -> ParseResult<Ace3UnconsciousEvent> {
    const CMD: &str = ":ACE3:UNCONSCIOUS:";
    let capture_frame = field(args, 0, CMD, "frame")?
        .parse::<i64>()
        .map_err(|e| parse_err(CMD, "frame", e.to_string()))?;
    let subject_object_id = field(args, 1, CMD, "soldierOcapId")?
        .parse::<ObjectId>()
        .map_err(|e| parse_err(CMD, "soldierOcapId", e.to_string()))?;
    let is_unconscious = clean_field(field(args, 2, CMD, "isUnconscious")?) == "true";

    Ok(Ace3UnconsciousEvent {
        mission_id,
        capture_frame,
        subject_object_id,
        is_unconscious,
    })
}

// ─── :NEW:MARKER: / :NEW:MARKER:STATE: / :DELETE:MARKER: ─────────────────

pub fn parse_new_marker(mission_id: i64, args: &[String]) -> ParseResult<Marker> {
    const CMD: &str = ":NEW:MARKER:";
    let marker_name = clean_field(field(args, 0, CMD, "name")?);
    let direction = field(args, 1, CMD, "direction")?
        .parse::<f64>()
        .map_err(|e| parse_err(CMD, "direction", e.to_string()))?;
    let marker_type = clean_field(field(args, 2, CMD, "type")?);
    let text = clean_field(field(args, 3, CMD, "text")?);
    // field(args, 4) is frame, field(args, 5) is a reserved -1 placeholder; neither is stored on Marker itself.
    let owner_id = field(args, 6, CMD, "ownerId")?
        .parse::<ObjectId>()
        .map_err(|e| parse_err(CMD, "ownerId", e.to_string()))?;
    let color = clean_field(field(args, 7, CMD, "color")?);
    let size = parse_size(field(args, 8, CMD, "size")?);
    let side = Side::parse(field(args, 9, CMD, "side")?);

    let shape_raw = clean_field(field(args, 11, CMD, "shape")?).to_ascii_uppercase();
    let shape = match shape_raw.as_str() {
        "ICON" => MarkerShape::Icon,
        "RECTANGLE" => MarkerShape::Rectangle,
        "ELLIPSE" => MarkerShape::Ellipse,
        "POLYLINE" => MarkerShape::Polyline,
        other => return Err(parse_err(CMD, "shape", format!("unknown shape `{other}`"))),
    };

    let position_raw = field(args, 10, CMD, "position")?;
    let geometry = if shape == MarkerShape::Polyline {
        MarkerGeometry::Polyline(parse_polyline(position_raw, CMD, "position")?)
    } else {
        MarkerGeometry::Point(parse_position3(position_raw, CMD, "position")?)
    };

    let alpha = field(args, 12, CMD, "alpha")?
        .parse::<f64>()
        .map_err(|e| parse_err(CMD, "alpha", e.to_string()))?;
    let brush = clean_field(field(args, 13, CMD, "brush")?);

    Ok(Marker {
        mission_id,
        marker_id: 0,
        marker_name,
        direction,
        marker_type,
        text,
        owner_id,
        color,
        size,
        side,
        shape,
        geometry,
        alpha,
        brush,
        is_deleted: false,
    })
}

pub fn parse_new_marker_state(
    mission_id: i64,
    marker_id: i64,
    args: &[String],
) -> ParseResult<MarkerState> {
    const CMD: &str = ":NEW:MARKER:STATE:";
    let capture_frame = field(args, 1, CMD, "frame")?
        .parse::<i64>()
        .map_err(|e| parse_err(CMD, "frame", e.to_string()))?;
    let position = parse_position3(field(args, 2, CMD, "position")?, CMD, "position")?;
    let direction = field(args, 3, CMD, "direction")?
        .parse::<f64>()
        .map_err(|e| parse_err(CMD, "direction", e.to_string()))?;
    let alpha = field(args, 4, CMD, "alpha")?
        .parse::<f64>()
        .map_err(|e| parse_err(CMD, "alpha", e.to_string()))?;

    Ok(MarkerState {
        mission_id,
        marker_id,
        capture_frame,
        position,
        direction,
        alpha,
    })
}

/// Synthesises an alpha=0 tombstone state. The caller resolves `name` via
/// the marker cache first; a miss is logged and dropped, never fatal.
pub fn synthesize_marker_deletion(mission_id: i64, marker_id: i64, frame: i64) -> MarkerState {
    MarkerState {
        mission_id,
        marker_id,
        capture_frame: frame,
        position: Position3D::default(),
        direction: 0.0,
        alpha: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn clean_field_strips_quotes_and_unescapes() {
        assert_eq!(clean_field("\"hello\""), "hello");
        assert_eq!(clean_field("\"say \\\"hi\\\"\""), "say \"hi\"");
        assert_eq!(clean_field("bare"), "bare");
    }

    #[test]
    fn vehicle_state_crew_roundtrips_verbatim() {
        for crew in ["[]", "[20]", "[20,21]", "[1,2,3,4,5]"] {
            let a = args(&[
                "5", "[1,2,3]", "90", "true", crew, "12", "1.0", "0.0", "true", "false", "WEST",
                "[0,1,0]", "[0,0,1]", "0", "0",
            ]);
            let state = parse_new_vehicle_state(1, &a).unwrap();
            assert_eq!(state.crew_raw, crew);
        }
    }

    #[test]
    fn scores_all_zero_when_not_player() {
        // parse_scores itself always parses; the is_player gate lives in
        // parse_new_soldier_state, exercised below.
        let zero = parse_scores("garbage");
        assert_eq!(zero, SoldierScores::all_zero());
    }

    #[tokio::test]
    async fn soldier_state_ignores_scores_when_not_player() {
        let cache = EntityCache::new();
        let a = args(&[
            "5", "[100,200,50]", "90", "1", "false", "Alpha 1-1", "false", "rifleman", "10",
            "true", "false", "1,2,3,4,5,100", "", "-1", "STAND",
        ]);
        let state = parse_new_soldier_state(1, &a, &cache).await.unwrap();
        assert_eq!(state.scores, None);
    }

    #[tokio::test]
    async fn soldier_state_17_field_overrides_cache_15_field_inherits() {
        let cache = EntityCache::new();
        cache
            .add_soldier(Soldier {
                mission_id: 1,
                object_id: 42,
                join_time: chrono::Utc::now(),
                join_frame: 0,
                unit_name: "Alpha 1-1".into(),
                group_id: "cached_group".into(),
                side: Side::East,
                is_player: true,
                role_description: String::new(),
                class_name: String::new(),
                display_name: String::new(),
                player_uid: String::new(),
                squad_params: serde_json::Value::Null,
            })
            .await;

        let base: Vec<&str> = vec![
            "42", "[100,200,50]", "90", "1", "false", "Alpha 1-1", "true", "rifleman", "10",
            "true", "false", "1,2,3,4,5,100", "", "-1", "STAND",
        ];

        let fifteen = args(&base);
        let state15 = parse_new_soldier_state(1, &fifteen, &cache).await.unwrap();
        assert_eq!(state15.group_id, "cached_group");
        assert_eq!(state15.side, Side::East);

        let mut seventeen = base.clone();
        seventeen.push("override_group");
        seventeen.push("WEST");
        let seventeen = args(&seventeen);
        let state17 = parse_new_soldier_state(1, &seventeen, &cache).await.unwrap();
        assert_eq!(state17.group_id, "override_group");
        assert_eq!(state17.side, Side::West);
    }

    #[test]
    fn polyline_requires_two_points() {
        assert!(parse_polyline("[[1,2]]", "test", "poly").is_err());
        assert!(parse_polyline("[[1,2],[3,4]]", "test", "poly").is_ok());
    }

    #[test]
    fn addon_workshop_id_coerces_number_to_string() {
        let mission_json = r#"{"addons":[["CBA_A3","450814997"],["ACE3",463939057]]}"#;
        let addons = parse_addons(mission_json).unwrap();
        assert_eq!(addons[0].workshop_id, "450814997");
        assert_eq!(addons[1].workshop_id, "463939057");
    }

    #[test]
    fn chat_channel_mapping() {
        assert_eq!(chat_channel_name(0), "Global");
        assert_eq!(chat_channel_name(5), "Direct");
        assert_eq!(chat_channel_name(10), "Custom");
        assert_eq!(chat_channel_name(16), "System");
        assert_eq!(chat_channel_name(99), "System");
    }

    #[test]
    fn marker_size_falls_back_on_bad_input() {
        assert_eq!(parse_size("[2.0,3.0]"), (2.0, 3.0));
        assert_eq!(parse_size("garbage"), (1.0, 1.0));
    }

    #[test]
    fn int_list_empty_on_blank_or_malformed() {
        assert_eq!(parse_int_list("[]"), Vec::<i64>::new());
        assert_eq!(parse_int_list(""), Vec::<i64>::new());
        assert_eq!(parse_int_list("[20,21]"), vec![20, 21]);
        assert_eq!(parse_int_list("[20,oops]"), Vec::<i64>::new());
    }
}
