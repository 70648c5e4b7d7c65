//! The uniform error surface of the API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use snafu::Snafu;
use skyshift_compat::ManagerError;
use skyshift_store::StoreError;
use skyshift_types::codec::CodecError;

use crate::auth::{password::PasswordError, token::TokenError};

pub type Result<T, E = ApiError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum ApiError {
    #[snafu(context(false))]
    Store { source: StoreError },

    #[snafu(context(false))]
    Codec { source: CodecError },

    #[snafu(context(false))]
    Manager { source: ManagerError },

    #[snafu(context(false))]
    Token { source: TokenError },

    #[snafu(context(false))]
    Password { source: PasswordError },

    #[snafu(display("missing bearer token"))]
    MissingToken,

    #[snafu(display("invalid username or password"))]
    InvalidCredentials,

    #[snafu(display("{subject:?} may not {action} {kind}"))]
    Forbidden {
        subject: String,
        action: String,
        kind: String,
    },

    #[snafu(display("invite has been revoked or already redeemed"))]
    InviteNotRedeemable,

    #[snafu(display("{message}"))]
    BadRequest { message: String },
}

impl ApiError {
    /// The wire-level error kind, one word per taxonomy entry.
    fn kind(&self) -> &'static str {
        match self {
            ApiError::Store { source } => match source {
                StoreError::InvalidObject { .. } => "InvalidObject",
                StoreError::AlreadyExists { .. } => "AlreadyExists",
                StoreError::NotFound { .. } => "NotFound",
                StoreError::Conflict { .. } => "Conflict",
                StoreError::WatchGap { .. } | StoreError::Lagged { .. } => "Expired",
                StoreError::Corrupt { .. } => "Fatal",
                StoreError::Storage { .. } => "Transient",
            },
            ApiError::Codec { .. } => "InvalidObject",
            ApiError::Manager { source } => match source {
                ManagerError::Unsupported { .. } => "Unsupported",
                source if source.is_transient() => "Transient",
                _ => "Internal",
            },
            ApiError::Token { .. } | ApiError::MissingToken | ApiError::InvalidCredentials => {
                "Unauthorized"
            }
            ApiError::Forbidden { .. } => "Unauthorized",
            ApiError::InviteNotRedeemable => "Unauthorized",
            ApiError::Password { .. } => "Internal",
            ApiError::BadRequest { .. } => "InvalidObject",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Store { source } => match source {
                StoreError::InvalidObject { .. } => StatusCode::BAD_REQUEST,
                StoreError::AlreadyExists { .. } | StoreError::Conflict { .. } => {
                    StatusCode::CONFLICT
                }
                StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                StoreError::WatchGap { .. } | StoreError::Lagged { .. } => StatusCode::GONE,
                StoreError::Corrupt { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                StoreError::Storage { .. } => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::Codec { .. } | ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Manager { source } => match source {
                ManagerError::Unsupported { .. } => StatusCode::NOT_IMPLEMENTED,
                source if source.is_transient() => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Token { .. } | ApiError::MissingToken | ApiError::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::Forbidden { .. } | ApiError::InviteNotRedeemable => StatusCode::FORBIDDEN,
            ApiError::Password { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}
