/// Slash-delimited paths into the tree store.
///
/// Layout:
///   teams/{team}/users/{uid}
///   teams/{team}/projects/{project}/users/{uid}
///   teams/{team}/projects/{project}/tasks/{bucket}/{task}/sections/{section}/todos/{todo}
use crate::store::StoreError;
use crate::types::Bucket;

pub const TEAMS_ROOT: &str = "teams";

/// Characters the tree store refuses inside a single key.
const FORBIDDEN_KEY_CHARS: &[char] = &['.', '$', '#', '[', ']', '/'];

/// Check a single path segment.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && !key.contains(FORBIDDEN_KEY_CHARS) && !key.chars().any(char::is_control)
}

/// Trim surrounding slashes and check every segment.
/// The empty string is the root.
pub fn normalize(path: &str) -> Result<String, StoreError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    for segment in trimmed.split('/') {
        if !is_valid_key(segment) {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
    }
    Ok(trimmed.to_string())
}

pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

pub fn join(base: &str, child: &str) -> String {
    let base = base.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    if base.is_empty() {
        child.to_string()
    } else if child.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, child)
    }
}

/// True when `path` equals `other` or lies below it.
pub fn is_at_or_below(path: &str, other: &str) -> bool {
    let mut own = segments(path);
    for segment in segments(other) {
        if own.next() != Some(segment) {
            return false;
        }
    }
    true
}

/// A change at `changed` is visible to a listener on `watched` when one
/// contains the other.
pub fn is_related(changed: &str, watched: &str) -> bool {
    is_at_or_below(changed, watched) || is_at_or_below(watched, changed)
}

pub fn team(team: &str) -> String {
    join(TEAMS_ROOT, team)
}

pub fn team_users(team_name: &str) -> String {
    join(&team(team_name), "users")
}

pub fn team_user(team_name: &str, uid: &str) -> String {
    join(&team_users(team_name), uid)
}

pub fn projects(team_name: &str) -> String {
    join(&team(team_name), "projects")
}

/// Addresses one project's task tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectRef {
    pub team: String,
    pub project: String,
}

impl ProjectRef {
    pub fn new(team: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            team: team.into(),
            project: project.into(),
        }
    }

    pub fn path(&self) -> String {
        join(&projects(&self.team), &self.project)
    }

    pub fn user(&self, uid: &str) -> String {
        join(&join(&self.path(), "users"), uid)
    }

    pub fn tasks(&self) -> String {
        join(&self.path(), "tasks")
    }

    pub fn bucket(&self, bucket: Bucket) -> String {
        join(&self.tasks(), bucket.label())
    }

    pub fn task(&self, bucket: Bucket, task: &str) -> String {
        join(&self.bucket(bucket), task)
    }

    pub fn sections(&self, bucket: Bucket, task: &str) -> String {
        join(&self.task(bucket, task), "sections")
    }

    pub fn todos(&self, bucket: Bucket, task: &str, section: &str) -> String {
        join(&join(&self.sections(bucket, task), section), "todos")
    }
}
