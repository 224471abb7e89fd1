//! Role hierarchy for authorization checks.

use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// Roles ordered by privilege. A role satisfies a requirement when its rank
/// is greater than or equal to the required rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    User,
    Moderator,
    Admin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::User => "user",
            Self::Moderator => "moderator",
            Self::Admin => "admin",
        }
    }

    /// Parse a role name. Unknown names yield `None` and callers must deny.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "viewer" => Some(Self::Viewer),
            "user" => Some(Self::User),
            "moderator" => Some(Self::Moderator),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Viewer => 1,
            Self::User => 2,
            Self::Moderator => 3,
            Self::Admin => 4,
        }
    }

    #[must_use]
    pub fn allows(self, required: Self) -> bool {
        self.rank() >= required.rank()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check a role name from an untrusted source against a requirement.
/// Unknown role names never pass.
#[must_use]
pub fn role_allows(role_name: &str, required: Role) -> bool {
    Role::parse(role_name).is_some_and(|role| role.allows(required))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_allows_everything() {
        for required in [Role::Viewer, Role::User, Role::Moderator, Role::Admin] {
            assert!(Role::Admin.allows(required));
        }
    }

    #[test]
    fn viewer_allows_only_viewer() {
        assert!(Role::Viewer.allows(Role::Viewer));
        assert!(!Role::Viewer.allows(Role::User));
        assert!(!Role::Viewer.allows(Role::Moderator));
        assert!(!Role::Viewer.allows(Role::Admin));
    }

    #[test]
    fn allows_is_monotonic() {
        let roles = [Role::Viewer, Role::User, Role::Moderator, Role::Admin];
        for (i, role) in roles.iter().enumerate() {
            for (j, required) in roles.iter().enumerate() {
                assert_eq!(role.allows(*required), i >= j);
            }
        }
    }

    #[test]
    fn unknown_role_is_denied() {
        assert!(!role_allows("superuser", Role::Viewer));
        assert!(!role_allows("", Role::Viewer));
        assert!(role_allows("moderator", Role::User));
    }

    #[test]
    fn parse_round_trips_known_names() {
        for role in [Role::Viewer, Role::User, Role::Moderator, Role::Admin] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("root"), None);
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&Role::Admin).unwrap();
        assert_eq!(json, "\"admin\"");
        let role: Role = serde_json::from_str("\"viewer\"").unwrap();
        assert_eq!(role, Role::Viewer);
    }
}
