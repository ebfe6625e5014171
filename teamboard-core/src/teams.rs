/// Team and project directory.
///
/// Layout below `teams/{team}`:
///   users/{uid}                    {username, role, work}
///   projects/{project}/users/{uid} {userName}
///
/// `work` marks the team a user is currently working in; at most one team
/// per user carries `work = true`.
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::paths::{self, ProjectRef};
use crate::store::{PathUpdates, TreeStore};
use crate::sync::SyncError;
use crate::types::Principal;
use crate::validate;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Edit,
    #[default]
    View,
}

impl Role {
    /// Missing or unknown roles read as `View`.
    pub fn parse(raw: Option<&str>) -> Role {
        match raw {
            Some("admin") => Role::Admin,
            Some("edit") => Role::Edit,
            _ => Role::View,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub uid: String,
    pub username: String,
    pub role: Role,
    pub active: bool,
}

impl Member {
    fn from_value(uid: &str, value: &Value) -> Self {
        Self {
            uid: uid.to_string(),
            username: value
                .get("username")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            role: Role::parse(value.get("role").and_then(Value::as_str)),
            active: value.get("work").and_then(Value::as_bool).unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub team: String,
    /// The user's current working team
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeamStatus {
    pub exists: bool,
    pub member: bool,
    /// Set for members only
    pub role: Option<Role>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left,
    /// The leaving user was the last member; the team is gone
    TeamDeleted,
}

/// Create a team with `creator` as its admin. Returns the validated name.
pub async fn create_team<S: TreeStore>(
    store: &S,
    name: &str,
    creator: &Principal,
) -> Result<String, SyncError> {
    let name = validate::validate_name(name)?;
    let team_path = paths::team(&name);
    if !store.get(&team_path).await?.is_null() {
        return Err(SyncError::AlreadyExists(team_path));
    }
    store
        .set(
            &paths::team_user(&name, &creator.uid),
            json!({"username": creator.attribution(), "role": Role::Admin}),
        )
        .await?;
    log::info!("[teamboard.teams.create] Team {} by {}", name, creator.uid);
    Ok(name)
}

/// Create a project inside `team`, registering `creator` on it.
pub async fn create_project<S: TreeStore>(
    store: &S,
    team: &str,
    name: &str,
    creator: &Principal,
) -> Result<ProjectRef, SyncError> {
    let name = validate::validate_name(name)?;
    let project = ProjectRef::new(team, name);
    let project_path = project.path();
    if !store.get(&project_path).await?.is_null() {
        return Err(SyncError::AlreadyExists(project_path));
    }
    store
        .set(
            &project.user(&creator.uid),
            json!({"userName": creator.attribution()}),
        )
        .await?;
    log::info!(
        "[teamboard.teams.project] {} in {} by {}",
        project.project,
        team,
        creator.uid
    );
    Ok(project)
}

/// Teams `uid` belongs to, in key order.
pub async fn teams_for_user<S: TreeStore>(
    store: &S,
    uid: &str,
) -> Result<Vec<Membership>, SyncError> {
    let teams = store.get(paths::TEAMS_ROOT).await?;
    let Some(teams) = teams.as_object() else {
        return Ok(Vec::new());
    };
    Ok(teams
        .iter()
        .filter_map(|(team, data)| {
            let user = data.get("users")?.get(uid)?;
            Some(Membership {
                team: team.clone(),
                active: user.get("work").and_then(Value::as_bool).unwrap_or(false),
            })
        })
        .collect())
}

/// The first team flagged as `uid`'s working team.
pub async fn active_team<S: TreeStore>(store: &S, uid: &str) -> Result<Option<String>, SyncError> {
    Ok(teams_for_user(store, uid)
        .await?
        .into_iter()
        .find(|m| m.active)
        .map(|m| m.team))
}

/// Make `team` the working team of `uid` and clear the flag everywhere
/// else, in one write.
pub async fn set_active_team<S: TreeStore>(
    store: &S,
    team: &str,
    uid: &str,
) -> Result<(), SyncError> {
    let memberships = teams_for_user(store, uid).await?;
    if !memberships.iter().any(|m| m.team == team) {
        return Err(SyncError::ItemVanished(paths::team_user(team, uid)));
    }
    let updates: PathUpdates = memberships
        .iter()
        .map(|m| (work_flag(&m.team, uid), Value::Bool(m.team == team)))
        .collect();
    store.update(updates).await?;
    log::debug!("[teamboard.teams.work] {} now works in {}", uid, team);
    Ok(())
}

/// Clear the working-team flag of `uid` in every team.
pub async fn clear_active_team<S: TreeStore>(store: &S, uid: &str) -> Result<(), SyncError> {
    let updates: PathUpdates = teams_for_user(store, uid)
        .await?
        .iter()
        .map(|m| (work_flag(&m.team, uid), Value::Bool(false)))
        .collect();
    store.update(updates).await?;
    Ok(())
}

fn work_flag(team: &str, uid: &str) -> String {
    paths::join(&paths::team_user(team, uid), "work")
}

pub async fn team_status<S: TreeStore>(
    store: &S,
    team: &str,
    uid: &str,
) -> Result<TeamStatus, SyncError> {
    if team.is_empty() {
        return Ok(TeamStatus {
            exists: false,
            member: false,
            role: None,
        });
    }
    let data = store.get(&paths::team(team)).await?;
    if data.is_null() {
        return Ok(TeamStatus {
            exists: false,
            member: false,
            role: None,
        });
    }
    let user = data.get("users").and_then(|users| users.get(uid));
    Ok(TeamStatus {
        exists: true,
        member: user.is_some(),
        role: user.map(|u| Role::parse(u.get("role").and_then(Value::as_str))),
    })
}

pub async fn team_members<S: TreeStore>(store: &S, team: &str) -> Result<Vec<Member>, SyncError> {
    let users = store.get(&paths::team_users(team)).await?;
    Ok(users
        .as_object()
        .map(|users| {
            users
                .iter()
                .map(|(uid, data)| Member::from_value(uid, data))
                .collect()
        })
        .unwrap_or_default())
}

pub async fn list_projects<S: TreeStore>(store: &S, team: &str) -> Result<Vec<String>, SyncError> {
    let projects = store.get(&paths::projects(team)).await?;
    Ok(projects
        .as_object()
        .map(|projects| projects.keys().cloned().collect())
        .unwrap_or_default())
}

/// Remove `uid` from `team`. The last member leaving deletes the team with
/// all its projects.
pub async fn leave_team<S: TreeStore>(
    store: &S,
    team: &str,
    uid: &str,
) -> Result<LeaveOutcome, SyncError> {
    let users = store.get(&paths::team_users(team)).await?;
    let Some(users) = users.as_object() else {
        return Err(SyncError::ItemVanished(paths::team(team)));
    };
    if !users.contains_key(uid) {
        return Err(SyncError::ItemVanished(paths::team_user(team, uid)));
    }

    if users.keys().all(|member| member == uid) {
        store.remove(&paths::team(team)).await?;
        log::info!("[teamboard.teams.leave] {} left {}; team deleted", uid, team);
        Ok(LeaveOutcome::TeamDeleted)
    } else {
        store.remove(&paths::team_user(team, uid)).await?;
        log::info!("[teamboard.teams.leave] {} left {}", uid, team);
        Ok(LeaveOutcome::Left)
    }
}
