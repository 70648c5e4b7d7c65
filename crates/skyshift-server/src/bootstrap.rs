//! First-boot seeding: the bootstrap admin identity, its role and the
//! default namespace.

use skyshift_store::{ObjectStore, StoreError};
use skyshift_types::kinds::{Namespace, Role, User};
use tracing::info;

use crate::auth::{password::PasswordError, hash_password};

/// Username of the bootstrap identity.
pub const ADMIN_USER: &str = "admin";

/// Default namespace created at first boot.
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, snafu::Snafu)]
pub enum BootstrapError {
    #[snafu(context(false))]
    Store { source: StoreError },

    #[snafu(context(false))]
    Password { source: PasswordError },
}

async fn create_if_missing<T: skyshift_types::Object>(
    store: &ObjectStore,
    object: T,
) -> Result<bool, StoreError> {
    match store.create(object).await {
        Ok(_) => Ok(true),
        Err(StoreError::AlreadyExists { .. }) => Ok(false),
        Err(error) => Err(error),
    }
}

/// Seeds the store. Idempotent: existing objects are left untouched, so a
/// changed bootstrap secret does not rewrite an established admin account.
pub async fn bootstrap(store: &ObjectStore, bootstrap_secret: &str) -> Result<(), BootstrapError> {
    if create_if_missing(store, User::new(ADMIN_USER, hash_password(bootstrap_secret)?)).await? {
        info!(user = ADMIN_USER, "bootstrap admin created");
    }

    // The admin role is the only seed able to issue the first invite.
    create_if_missing(store, Role::admin(vec![ADMIN_USER.to_string()])).await?;
    create_if_missing(store, Namespace::new(DEFAULT_NAMESPACE)).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use skyshift_store::SledDriver;
    use skyshift_types::kinds::ADMIN_ROLE;

    use super::*;

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = SledDriver::open(dir.path()).expect("driver opens");
        let store = ObjectStore::new(Arc::new(driver));

        bootstrap(&store, "secret-1").await.expect("first boot");
        let admin_before: User = store.get(None, ADMIN_USER).await.expect("admin exists");

        // A rerun (even with a different secret) changes nothing.
        bootstrap(&store, "secret-2").await.expect("second boot");
        let admin_after: User = store.get(None, ADMIN_USER).await.expect("admin exists");
        assert_eq!(admin_before, admin_after);

        let role: Role = store.get(None, ADMIN_ROLE).await.expect("role exists");
        assert!(role.binds_user(ADMIN_USER));
        store
            .get::<Namespace>(None, DEFAULT_NAMESPACE)
            .await
            .expect("default namespace exists");
    }
}
