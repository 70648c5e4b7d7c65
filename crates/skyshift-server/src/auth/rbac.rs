//! The access decision function.

use skyshift_store::{ObjectStore, StoreError};
use skyshift_types::{
    kinds::{Action, Role},
    Kind,
};

/// Evaluates the union of roles bound to a subject.
#[derive(Clone)]
pub struct Authorizer {
    store: ObjectStore,
}

impl Authorizer {
    pub fn new(store: ObjectStore) -> Self {
        Authorizer { store }
    }

    /// Whether `subject` may perform `action` on `kind` in `namespace`.
    ///
    /// A subject with no role binding is denied everything; the union of
    /// its roles must contain a rule covering the action and kind in a
    /// namespace the role spans.
    pub async fn allowed(
        &self,
        subject: &str,
        action: Action,
        kind: Kind,
        namespace: Option<&str>,
    ) -> Result<bool, StoreError> {
        let roles = self.store.list::<Role>(None).await?;
        Ok(roles
            .items
            .iter()
            .filter(|role| role.binds_user(subject))
            .any(|role| {
                role.covers_namespace(namespace)
                    && role.spec.rules.iter().any(|rule| rule.covers(action, kind))
            }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use skyshift_store::SledDriver;
    use skyshift_types::kinds::{Rule, ALL};

    use super::*;

    fn store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = SledDriver::open(dir.path()).expect("driver opens");
        (dir, ObjectStore::new(Arc::new(driver)))
    }

    #[tokio::test]
    async fn unbound_subjects_are_denied_everything() {
        let (_dir, store) = store();
        let authorizer = Authorizer::new(store);

        for action in Action::ALL_ACTIONS {
            assert!(!authorizer
                .allowed("nobody", action, Kind::Job, Some("default"))
                .await
                .expect("decision"));
        }
    }

    #[tokio::test]
    async fn admin_role_grants_everything() {
        let (_dir, store) = store();
        store
            .create(Role::admin(vec!["root".to_string()]))
            .await
            .expect("role create");
        let authorizer = Authorizer::new(store);

        assert!(authorizer
            .allowed("root", Action::Delete, Kind::Cluster, None)
            .await
            .expect("decision"));
        assert!(authorizer
            .allowed("root", Action::Exec, Kind::Job, Some("anywhere"))
            .await
            .expect("decision"));
    }

    #[tokio::test]
    async fn scoped_roles_limit_namespace_and_verbs() {
        let (_dir, store) = store();

        let mut role = Role::new("dev-reader");
        role.spec.users = vec!["dev".to_string()];
        role.spec.namespaces = vec!["dev-ns".to_string()];
        role.spec.rules = vec![Rule {
            resources: vec![Kind::Job.to_string()],
            actions: vec![Action::Get, Action::List],
        }];
        store.create(role).await.expect("role create");
        let authorizer = Authorizer::new(store);

        assert!(authorizer
            .allowed("dev", Action::Get, Kind::Job, Some("dev-ns"))
            .await
            .expect("decision"));
        assert!(!authorizer
            .allowed("dev", Action::Get, Kind::Job, Some("prod-ns"))
            .await
            .expect("decision"));
        assert!(!authorizer
            .allowed("dev", Action::Delete, Kind::Job, Some("dev-ns"))
            .await
            .expect("decision"));
        assert!(!authorizer
            .allowed("dev", Action::Get, Kind::Service, Some("dev-ns"))
            .await
            .expect("decision"));
    }

    #[tokio::test]
    async fn wildcard_namespace_spans_all() {
        let (_dir, store) = store();

        let mut role = Role::new("watcher");
        role.spec.users = vec!["watcher".to_string()];
        role.spec.namespaces = vec![ALL.to_string()];
        role.spec.rules = vec![Rule {
            resources: vec![ALL.to_string()],
            actions: vec![Action::Watch],
        }];
        store.create(role).await.expect("role create");
        let authorizer = Authorizer::new(store);

        assert!(authorizer
            .allowed("watcher", Action::Watch, Kind::Job, Some("any-ns"))
            .await
            .expect("decision"));
    }
}
