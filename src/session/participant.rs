//! Participant roster, roles, and permission derivation.
//!
//! Permissions are derived deterministically from the role; there is no
//! per-participant grant list. The roster is the session's membership
//! authority: the gateway, sequencer, and comment store all authorize
//! through it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{ParticipantId, SessionId, SessionSettings, UserId};
use crate::error::{EngineError, EngineResult};

/// Role of a participant within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
    Guest,
}

impl Default for Role {
    fn default() -> Self {
        Self::Editor
    }
}

/// Actions a role may perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Permission {
    Edit,
    Comment,
    Invite,
    ManageSettings,
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Permission::Edit => "edit",
            Permission::Comment => "comment",
            Permission::Invite => "invite",
            Permission::ManageSettings => "manageSettings",
        };
        write!(f, "{}", name)
    }
}

impl Role {
    /// Permission set derived from this role
    pub fn permissions(self) -> &'static [Permission] {
        match self {
            Role::Owner => &[
                Permission::Edit,
                Permission::Comment,
                Permission::Invite,
                Permission::ManageSettings,
            ],
            Role::Editor => &[Permission::Edit, Permission::Comment],
            Role::Viewer => &[Permission::Comment],
            Role::Guest => &[Permission::Comment],
        }
    }

    pub fn grants(self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

/// Connection-level status of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Online,
    Away,
    Offline,
}

/// A session member. Created on join, marked offline on leave; never silently
/// deleted while the session is active so history stays attributed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
    pub status: ParticipantStatus,
    pub color: String,
    pub joined_at: i64,
}

impl Participant {
    fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            display_name: display_name.into(),
            role,
            status: ParticipantStatus::Online,
            color: participant_color(),
            joined_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Session membership, ordered by join time.
///
/// A single mutex keeps the capacity check and the insert atomic, so
/// `members.len() <= max_participants` holds under concurrent joins.
pub struct ParticipantRoster {
    session_id: SessionId,
    members: Mutex<Vec<Participant>>,
}

impl ParticipantRoster {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            members: Mutex::new(Vec::new()),
        }
    }

    /// Add a user to the session, or refresh their record if already present.
    ///
    /// Re-joining by the same userId updates displayName/status rather than
    /// duplicating the record, and never counts against capacity.
    pub fn join(
        &self,
        user_id: &str,
        display_name: &str,
        role: Role,
        settings: &SessionSettings,
    ) -> EngineResult<Participant> {
        if role == Role::Guest && !settings.allow_guests {
            return Err(EngineError::GuestsNotAllowed);
        }

        let mut members = self.members.lock();

        if let Some(existing) = members.iter_mut().find(|p| p.user_id == user_id) {
            existing.display_name = display_name.to_string();
            existing.status = ParticipantStatus::Online;
            return Ok(existing.clone());
        }

        if members.len() >= settings.max_participants {
            return Err(EngineError::CapacityExceeded(settings.max_participants));
        }

        let participant = Participant::new(&self.session_id, user_id, display_name, role);
        members.push(participant.clone());
        Ok(participant)
    }

    /// Mark a participant offline. History (comments, operations) stays
    /// attributed to their participant record.
    pub fn leave(&self, user_id: &str) -> Option<Participant> {
        let mut members = self.members.lock();
        let member = members.iter_mut().find(|p| p.user_id == user_id)?;
        member.status = ParticipantStatus::Offline;
        Some(member.clone())
    }

    /// Change a participant's role. The acting user must hold `manageSettings`.
    pub fn set_role(&self, acting_user: &str, target_user: &str, role: Role) -> EngineResult<Participant> {
        let mut members = self.members.lock();

        let actor = members
            .iter()
            .find(|p| p.user_id == acting_user)
            .ok_or_else(|| EngineError::ParticipantNotFound(acting_user.to_string()))?;
        if !actor.role.grants(Permission::ManageSettings) {
            return Err(EngineError::Forbidden(Permission::ManageSettings.to_string()));
        }

        let target = members
            .iter_mut()
            .find(|p| p.user_id == target_user)
            .ok_or_else(|| EngineError::ParticipantNotFound(target_user.to_string()))?;
        target.role = role;
        Ok(target.clone())
    }

    pub fn get_by_user(&self, user_id: &str) -> Option<Participant> {
        self.members.lock().iter().find(|p| p.user_id == user_id).cloned()
    }

    pub fn get(&self, participant_id: &str) -> Option<Participant> {
        self.members.lock().iter().find(|p| p.id == participant_id).cloned()
    }

    pub fn contains_user(&self, user_id: &str) -> bool {
        self.members.lock().iter().any(|p| p.user_id == user_id)
    }

    /// Look up a participant and verify they hold `permission`.
    pub fn require(&self, participant_id: &str, permission: Permission) -> EngineResult<Participant> {
        let participant = self
            .get(participant_id)
            .ok_or_else(|| EngineError::ParticipantNotFound(participant_id.to_string()))?;
        if !participant.role.grants(permission) {
            return Err(EngineError::Forbidden(permission.to_string()));
        }
        Ok(participant)
    }

    /// Members in join order
    pub fn members(&self) -> Vec<Participant> {
        self.members.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }
}

/// Pick a display color for a new participant
pub fn participant_color() -> String {
    use rand::Rng;
    let colors = [
        "#3b82f6", // blue
        "#ef4444", // red
        "#22c55e", // green
        "#f59e0b", // amber
        "#8b5cf6", // violet
        "#ec4899", // pink
        "#06b6d4", // cyan
        "#f97316", // orange
        "#14b8a6", // teal
        "#a855f7", // purple
    ];
    let idx = rand::thread_rng().gen_range(0..colors.len());
    colors[idx].to_string()
}
