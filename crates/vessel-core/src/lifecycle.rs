use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Absent,
    Created,
    Running,
    Stopped,
}

impl ContainerState {
    /// Map an OCI runtime `status` string.
    pub fn from_runtime_status(status: &str) -> Option<Self> {
        match status {
            "creating" | "created" => Some(Self::Created),
            "running" | "paused" | "pausing" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Absent => write!(f, "absent"),
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Stopped => write!(f, "stopped"),
        }
    }
}

pub fn validate_transition(
    id: &str,
    from: ContainerState,
    to: ContainerState,
) -> Result<(), crate::CoreError> {
    let valid = matches!(
        (from, to),
        (ContainerState::Absent, ContainerState::Created)
            | (ContainerState::Created, ContainerState::Running)
            | (
                ContainerState::Created | ContainerState::Running,
                ContainerState::Stopped
            )
            | (
                ContainerState::Created | ContainerState::Stopped,
                ContainerState::Absent
            )
    );

    if valid {
        Ok(())
    } else {
        Err(crate::CoreError::InvalidTransition {
            id: id.to_owned(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
