//! Authentication and authorization: passwords, tokens, RBAC decisions.

pub mod password;
pub mod rbac;
pub mod token;

pub use password::{hash_password, verify_password};
pub use rbac::Authorizer;
pub use token::{InviteClaims, SessionClaims, TokenSigner};
