//! Text records written to clients: participant snapshots and event pushes.
//!
//! Absent references never fail a record. A missing participant renders as
//! id `0` and a missing weapon as `Unknown`.

use demorelay_core::{Equipment, GameEvent, Participant, PlayerRef};

pub const UNKNOWN_WEAPON: &str = "Unknown";

fn user_id(player: Option<&PlayerRef>) -> i32 {
    player.map_or(0, |p| p.user_id)
}

fn weapon_name(weapon: Option<&Equipment>) -> &str {
    weapon.map_or(UNKNOWN_WEAPON, |w| w.name.as_str())
}

/// One participant as a comma-separated record.
pub fn participant_record(p: &Participant) -> String {
    let pos = &p.last_alive_position;
    let vel = &p.velocity;
    format!(
        "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
        p.user_id,
        p.flash_duration,
        p.steam_id64,
        p.name,
        pos.x,
        pos.y,
        pos.z,
        vel.x,
        vel.y,
        vel.z,
        weapon_name(p.active_weapon.as_ref()),
        p.view_direction.x,
        p.view_direction.y,
        p.is_ducking,
        p.health,
    )
}

/// All participants, one per line, no trailing newline.
pub fn snapshot(players: &[Participant]) -> String {
    players
        .iter()
        .map(participant_record)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Snapshot emitted for a marked position, prefixed by the position.
pub fn marked_frame(frame: i64, players: &[Participant]) -> String {
    format!("{frame},{}", snapshot(players))
}

/// Push record for an in-stream event observed at `frame`.
pub fn event_record(event: &GameEvent, frame: i64) -> String {
    match event {
        GameEvent::PlayerHurt {
            attacker,
            player,
            weapon,
        } => format!(
            "event:PlayerHurt, attacker_id:{}, player_id:{}, weapon:{}, frame:{frame}",
            user_id(attacker.as_ref()),
            user_id(player.as_ref()),
            weapon_name(weapon.as_ref()),
        ),
        GameEvent::WeaponFire { shooter, weapon } => format!(
            "event:WeaponFire, player_id:{}, weapon:{}, frame:{frame}",
            user_id(shooter.as_ref()),
            weapon_name(weapon.as_ref()),
        ),
    }
}
