//! Role, User and Invite kinds: the RBAC model.
//!
//! Roles carry rules (resources x actions), the namespaces they apply in and
//! the users bound to them. Users hold credentials; role bindings live on
//! the Role side. Invites record issued registration tokens so they can be
//! revoked before redemption.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{metadata::ObjectMeta, Kind, Object};

/// Wildcard accepted in role rule resources and namespace lists.
pub const ALL: &str = "*";

/// Name of the bootstrap role that may do everything everywhere.
pub const ADMIN_ROLE: &str = "admin-role";

/// The closed set of verbs a role can grant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Action {
    Get,
    List,
    Watch,
    Create,
    Update,
    Delete,
    Exec,
    Restart,
}

impl Action {
    pub const ALL_ACTIONS: [Action; 8] = [
        Action::Get,
        Action::List,
        Action::Watch,
        Action::Create,
        Action::Update,
        Action::Delete,
        Action::Exec,
        Action::Restart,
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    /// Kind names this rule covers, or `"*"`.
    #[serde(default)]
    pub resources: Vec<String>,

    #[serde(default)]
    pub actions: Vec<Action>,
}

impl Rule {
    pub fn covers(&self, action: Action, kind: Kind) -> bool {
        let kind_name = kind.to_string();
        self.resources.iter().any(|r| r == ALL || *r == kind_name)
            && self.actions.contains(&action)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleSpec {
    #[serde(default)]
    pub rules: Vec<Rule>,

    /// Namespaces the rules apply in, or `"*"`. Global kinds ignore this.
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Users bound to this role.
    #[serde(default)]
    pub users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Role {
    #[serde(default = "role_kind")]
    pub kind: Kind,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: RoleSpec,
}

fn role_kind() -> Kind {
    Kind::Role
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Role {
            kind: Kind::Role,
            metadata: ObjectMeta::named(name),
            spec: RoleSpec::default(),
        }
    }

    /// The admin role: every action on every resource in every namespace.
    pub fn admin(users: Vec<String>) -> Self {
        let mut role = Role::new(ADMIN_ROLE);
        role.spec = RoleSpec {
            rules: vec![Rule {
                resources: vec![ALL.to_string()],
                actions: Action::ALL_ACTIONS.to_vec(),
            }],
            namespaces: vec![ALL.to_string()],
            users,
        };
        role
    }

    pub fn binds_user(&self, user: &str) -> bool {
        self.spec.users.iter().any(|u| u == user)
    }

    pub fn covers_namespace(&self, namespace: Option<&str>) -> bool {
        match namespace {
            // Global resources are gated by rules only.
            None => true,
            Some(namespace) => self
                .spec
                .namespaces
                .iter()
                .any(|n| n == ALL || n == namespace),
        }
    }
}

impl Object for Role {
    const KIND: Kind = Kind::Role;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserSpec {
    /// Argon2 password hash in PHC string format.
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct User {
    #[serde(default = "user_kind")]
    pub kind: Kind,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: UserSpec,
}

fn user_kind() -> Kind {
    Kind::User
}

impl User {
    pub fn new(username: impl Into<String>, password_hash: impl Into<String>) -> Self {
        User {
            kind: Kind::User,
            metadata: ObjectMeta::named(username),
            spec: UserSpec {
                password_hash: password_hash.into(),
            },
        }
    }
}

impl Object for User {
    const KIND: Kind = Kind::User;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum InvitePhase {
    #[default]
    Pending,
    Accepted,
    Revoked,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InviteSpec {
    /// Username of the inviting identity.
    pub issuer: String,

    /// Roles granted on redemption.
    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InviteStatus {
    #[serde(default)]
    pub phase: InvitePhase,
}

/// An issued invite, keyed by the token's id so it can be revoked before it
/// is redeemed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Invite {
    #[serde(default = "invite_kind")]
    pub kind: Kind,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: InviteSpec,
    #[serde(default)]
    pub status: InviteStatus,
}

fn invite_kind() -> Kind {
    Kind::Invite
}

impl Invite {
    pub fn new(token_id: impl Into<String>, issuer: impl Into<String>, roles: Vec<String>) -> Self {
        Invite {
            kind: Kind::Invite,
            metadata: ObjectMeta::named(token_id),
            spec: InviteSpec {
                issuer: issuer.into(),
                roles,
                expires_at: None,
            },
            status: InviteStatus::default(),
        }
    }
}

impl Object for Invite {
    const KIND: Kind = Kind::Invite;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_wildcard_covers_every_kind() {
        let rule = Rule {
            resources: vec![ALL.to_string()],
            actions: vec![Action::Get, Action::Create],
        };
        assert!(rule.covers(Action::Get, Kind::Job));
        assert!(rule.covers(Action::Create, Kind::Cluster));
        assert!(!rule.covers(Action::Delete, Kind::Job));
    }

    #[test]
    fn rule_matches_named_resources_only() {
        let rule = Rule {
            resources: vec!["Job".to_string()],
            actions: vec![Action::Get],
        };
        assert!(rule.covers(Action::Get, Kind::Job));
        assert!(!rule.covers(Action::Get, Kind::Service));
    }

    #[test]
    fn admin_role_covers_everything() {
        let role = Role::admin(vec!["admin".to_string()]);
        assert!(role.binds_user("admin"));
        assert!(role.covers_namespace(Some("anything")));
        assert!(role.covers_namespace(None));
        assert!(role.spec.rules[0].covers(Action::Exec, Kind::Job));
    }

    #[test]
    fn namespace_scoping() {
        let mut role = Role::new("dev-role");
        role.spec.namespaces = vec!["dev".to_string()];
        assert!(role.covers_namespace(Some("dev")));
        assert!(!role.covers_namespace(Some("prod")));
    }
}
