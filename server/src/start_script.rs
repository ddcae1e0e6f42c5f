//! Start-script and settings-file rendering for one battle.
//!
//! The engine reads a hierarchical-key `script.txt` at startup describing
//! players, teams, map and the controller endpoints. Player numbers are
//! assigned here, densely from zero, in the exact order participants appear
//! in the request: teams in ally-team order, then spectators. The adapter
//! derives its identity index from [`player_order`], so the script and the
//! index can never disagree.

use std::collections::BTreeMap;
use std::fmt::Write;

use shared::lobby::{BattlePlayer, StartRequest};

/// Settings forced into every battle regardless of caller configuration:
/// anonymous spectators may not join, and the controller may add players
/// after start.
const MANDATORY_SETTINGS: [(&str, &str); 2] =
    [("AllowSpectatorJoin", "0"), ("AllowAdditionalPlayers", "1")];

/// Participants in player-number order: teams in ally-team order, then
/// spectators appended.
pub fn player_order(request: &StartRequest) -> Vec<&BattlePlayer> {
    let mut players: Vec<&BattlePlayer> = request
        .ally_teams
        .iter()
        .flat_map(|ally| ally.teams.iter())
        .flat_map(|team| team.players.iter())
        .collect();
    players.extend(request.spectators.iter());
    players
}

/// Renders the `script.txt` for one battle.
pub fn render_start_script(
    request: &StartRequest,
    bind_ip: &str,
    battle_port: u16,
    autohost_port: u16,
) -> String {
    let players = player_order(request);
    let team_count: usize = request
        .ally_teams
        .iter()
        .map(|ally| ally.teams.len())
        .sum();

    let mut script = String::new();
    let _ = writeln!(script, "[GAME]");
    let _ = writeln!(script, "{{");
    let _ = writeln!(script, "\tGameType={};", request.game_name);
    let _ = writeln!(script, "\tMapName={};", request.map_name);
    let _ = writeln!(script, "\tIsHost=1;");
    let _ = writeln!(script, "\tHostIP={bind_ip};");
    let _ = writeln!(script, "\tHostPort={battle_port};");
    let _ = writeln!(script, "\tAutohostIP=127.0.0.1;");
    let _ = writeln!(script, "\tAutohostPort={autohost_port};");
    let _ = writeln!(script, "\tNumPlayers={};", players.len());
    let _ = writeln!(script, "\tNumUsers={};", players.len());
    let _ = writeln!(script, "\tNumTeams={team_count};");
    let _ = writeln!(script, "\tNumAllyTeams={};", request.ally_teams.len());

    // Player sections, one per participant, numbered in order.
    let mut number = 0usize;
    let mut team_index = 0usize;
    let mut team_leaders: Vec<(usize, usize)> = Vec::new();
    for ally in &request.ally_teams {
        for team in &ally.teams {
            for (nth, player) in team.players.iter().enumerate() {
                if nth == 0 {
                    team_leaders.push((team_index, number));
                }
                write_player(&mut script, number, player, Some(team_index));
                number += 1;
            }
            team_index += 1;
        }
    }
    for spectator in &request.spectators {
        write_player(&mut script, number, spectator, None);
        number += 1;
    }

    let mut team_index = 0usize;
    for (ally_index, ally) in request.ally_teams.iter().enumerate() {
        for _ in &ally.teams {
            let leader = team_leaders
                .iter()
                .find(|(team, _)| *team == team_index)
                .map(|(_, leader)| *leader)
                .unwrap_or(0);
            let _ = writeln!(script, "\t[TEAM{team_index}]");
            let _ = writeln!(script, "\t{{");
            let _ = writeln!(script, "\t\tTeamLeader={leader};");
            let _ = writeln!(script, "\t\tAllyTeam={ally_index};");
            let _ = writeln!(script, "\t}}");
            team_index += 1;
        }
    }
    for ally_index in 0..request.ally_teams.len() {
        let _ = writeln!(script, "\t[ALLYTEAM{ally_index}]");
        let _ = writeln!(script, "\t{{");
        let _ = writeln!(script, "\t\tNumAllies=0;");
        let _ = writeln!(script, "\t}}");
    }
    let _ = writeln!(script, "}}");
    script
}

fn write_player(script: &mut String, number: usize, player: &BattlePlayer, team: Option<usize>) {
    let _ = writeln!(script, "\t[PLAYER{number}]");
    let _ = writeln!(script, "\t{{");
    let _ = writeln!(script, "\t\tName={};", player.name);
    if let Some(password) = &player.password {
        let _ = writeln!(script, "\t\tPassword={password};");
    }
    match team {
        Some(team) => {
            let _ = writeln!(script, "\t\tSpectator=0;");
            let _ = writeln!(script, "\t\tTeam={team};");
        }
        None => {
            let _ = writeln!(script, "\t\tSpectator=1;");
        }
    }
    let _ = writeln!(script, "\t}}");
}

/// Caller-supplied settings merged with the mandatory overrides.
pub fn merged_settings(base: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut settings = base.clone();
    for (key, value) in MANDATORY_SETTINGS {
        settings.insert(key.to_string(), value.to_string());
    }
    settings
}

/// Renders the per-battle settings file: sorted `key=value` lines.
pub fn settings_file_contents(settings: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in settings {
        let _ = writeln!(out, "{key}={value}");
    }
    out
}
