//! Request extractors for device and browser credentials

use axum::body::Bytes;
use axum::extract::FromRequestParts;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::request::Parts;
use serde::de::DeserializeOwned;

use brunnen_core::auth::{self, Permission};
use brunnen_core::Group;

use crate::error::ApiError;
use crate::state::SharedState;

/// Name of the browser session cookie
pub const SESSION_COOKIE: &str = "brunnen_session";

/// A device that passed HTTP Basic authentication
#[derive(Debug, Clone)]
pub struct DeviceAuth {
    pub device_id: String,
}

impl FromRequestParts<SharedState> for DeviceAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::WrongCredentials)?;
        let (device_id, token) =
            auth::parse_basic(header).map_err(|_| ApiError::WrongCredentials)?;

        // Unknown ids and wrong tokens take the same path and the same time.
        let stored = state.store.get_device(&device_id).await?.map(|d| d.token);
        let valid = auth::check_secret(token, stored).await?;
        if !valid {
            tracing::warn!("Rejected device credentials for '{}'", device_id);
            return Err(ApiError::WrongCredentials);
        }

        Ok(DeviceAuth { device_id })
    }
}

/// A logged-in operator
#[derive(Debug, Clone)]
pub struct Session {
    pub username: String,
    pub group: Group,
}

impl Session {
    pub fn require(&self, permission: Permission) -> Result<(), ApiError> {
        if self.group.allows(permission) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!(
                "User '{}' is not allowed to do this.",
                self.username
            )))
        }
    }
}

impl FromRequestParts<SharedState> for Session {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let token = session_token(parts)
            .ok_or_else(|| ApiError::Unauthorized("Login required".to_string()))?;
        let claims = state.sessions.verify(&token)?;

        // Deleted accounts lose access at once; group changes apply immediately.
        let user = state
            .store
            .get_user(&claims.sub)
            .await?
            .ok_or_else(|| ApiError::Unauthorized("Login required".to_string()))?;

        Ok(Session {
            username: user.username,
            group: user.group,
        })
    }
}

/// Token from `Authorization: Bearer` or the session cookie
fn session_token(parts: &Parts) -> Option<String> {
    let bearer = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if let Some(token) = bearer {
        return Some(token.trim().to_string());
    }

    parts
        .headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

/// Parse an optional JSON body; an empty body yields the default value
pub fn json_or_default<T>(body: &Bytes) -> Result<T, ApiError>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(body)?)
}

/// Parse a required JSON body
pub fn json_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use brunnen_core::protocol::DeleteRequest;

    fn parts(header: (&str, &str)) -> Parts {
        let (parts, _) = Request::builder()
            .header(header.0, header.1)
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    #[test]
    fn test_session_token_sources() {
        let p = parts(("authorization", "Bearer abc.def"));
        assert_eq!(session_token(&p).as_deref(), Some("abc.def"));

        let p = parts(("cookie", "theme=dark; brunnen_session=xyz; other=1"));
        assert_eq!(session_token(&p).as_deref(), Some("xyz"));

        let p = parts(("cookie", "theme=dark"));
        assert_eq!(session_token(&p), None);
    }

    #[test]
    fn test_require_permission() {
        let user = Session {
            username: "anna".to_string(),
            group: Group::User,
        };
        assert!(user.require(Permission::ViewData).is_ok());
        assert!(matches!(
            user.require(Permission::ManageUsers),
            Err(ApiError::Forbidden(_))
        ));
    }

    #[test]
    fn test_json_or_default() {
        let req: DeleteRequest = json_or_default(&Bytes::from_static(b"  ")).unwrap();
        assert!(req.select.is_none());

        let err = json_or_default::<DeleteRequest>(&Bytes::from_static(b"{")).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }
}
