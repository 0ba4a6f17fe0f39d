use super::models::{Actor, ActorRole};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobPermission {
    ViewJobs,
    SubmitJobs,
    RetryJobs,
    CancelJobs,
    ManageSchedules,
}

impl JobPermission {
    /// Verb used in permission-denied messages.
    pub fn action(self) -> &'static str {
        match self {
            JobPermission::ViewJobs => "view jobs",
            JobPermission::SubmitJobs => "submit jobs",
            JobPermission::RetryJobs => "retry jobs",
            JobPermission::CancelJobs => "cancel jobs",
            JobPermission::ManageSchedules => "manage schedules",
        }
    }
}

const ALL_PERMISSIONS: &[JobPermission] = &[
    JobPermission::ViewJobs,
    JobPermission::SubmitJobs,
    JobPermission::RetryJobs,
    JobPermission::CancelJobs,
    JobPermission::ManageSchedules,
];
const OPERATOR_PERMISSIONS: &[JobPermission] = &[
    JobPermission::ViewJobs,
    JobPermission::SubmitJobs,
    JobPermission::RetryJobs,
    JobPermission::CancelJobs,
];
const VIEWER_PERMISSIONS: &[JobPermission] = &[JobPermission::ViewJobs];

impl ActorRole {
    pub fn permissions(&self) -> &'static [JobPermission] {
        match self {
            ActorRole::System | ActorRole::Admin => ALL_PERMISSIONS,
            ActorRole::Operator => OPERATOR_PERMISSIONS,
            ActorRole::Viewer => VIEWER_PERMISSIONS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActorRole::System => "System",
            ActorRole::Admin => "Admin",
            ActorRole::Operator => "Operator",
            ActorRole::Viewer => "Viewer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Some(ActorRole::System),
            "admin" => Some(ActorRole::Admin),
            "operator" => Some(ActorRole::Operator),
            "viewer" => Some(ActorRole::Viewer),
            _ => None,
        }
    }
}

/// Access-control collaborator consulted before every admin operation.
pub trait AccessControl: Send + Sync {
    fn is_allowed(&self, actor: &Actor, permission: JobPermission) -> bool;
}

/// Grants permissions from the actor's role.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoleAccessControl;

impl AccessControl for RoleAccessControl {
    fn is_allowed(&self, actor: &Actor, permission: JobPermission) -> bool {
        actor.role.permissions().contains(&permission)
    }
}
