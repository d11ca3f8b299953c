use axum::{
    extract::{ConnectInfo, FromRequestParts, Query, Request, State, WebSocketUpgrade},
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::debug;

use crate::AppState;
use crate::error::HandshakeError;
use crate::hub::handler::handle_hub_socket;
use crate::hub::protocol::PortalType;
use crate::hub::registry::{DeviceInfo, Session};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const PORTAL_TYPE_HEADER: &str = "x-portal-type";

/// Identity as query parameters, for browser clients that cannot set headers.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeQuery {
    user_id: Option<String>,
    portal_type: Option<String>,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Build the session for an upgrade request. Headers win over query params.
pub fn session_from_request(
    headers: &HeaderMap,
    query: &HandshakeQuery,
    ip: Option<String>,
) -> Result<Session, HandshakeError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let user_id = non_blank(header(USER_ID_HEADER))
        .or_else(|| non_blank(query.user_id.as_deref()))
        .ok_or(HandshakeError::MissingUserId)?;
    let portal = non_blank(header(PORTAL_TYPE_HEADER))
        .or_else(|| non_blank(query.portal_type.as_deref()))
        .ok_or(HandshakeError::MissingPortalType)?;
    let portal_type: PortalType = portal
        .parse()
        .map_err(|_| HandshakeError::UnknownPortalType(portal.to_string()))?;

    let device_info = DeviceInfo {
        user_agent: header(header::USER_AGENT.as_str()).map(str::to_string),
        ip,
    };

    Ok(Session::new(user_id, portal_type, device_info))
}

/// `GET /ws`: authenticate the handshake, then hand the socket to the hub.
pub async fn hub_websocket_handler(State(state): State<AppState>, request: Request) -> Response {
    let (mut parts, _body) = request.into_parts();

    let query = Query::<HandshakeQuery>::try_from_uri(&parts.uri)
        .map(|Query(q)| q)
        .unwrap_or_default();
    let ip = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    let session = match session_from_request(&parts.headers, &query, ip) {
        Ok(session) => session,
        Err(e) => {
            debug!("Rejected hub handshake: {}", e);
            return e.into_response();
        }
    };

    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let deps = state.connection_deps();
    ws.on_upgrade(move |socket| handle_hub_socket(socket, deps, session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::StatusCode, routing::get};
    use tower::ServiceExt;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn test_session_from_headers() {
        let h = headers(&[
            ("x-user-id", "u1"),
            ("x-portal-type", "Investor"),
            ("user-agent", "test-agent/1.0"),
        ]);
        let session =
            session_from_request(&h, &HandshakeQuery::default(), Some("10.0.0.1".into())).unwrap();
        assert_eq!(session.user_id, "u1");
        assert_eq!(session.portal_type, PortalType::Investor);
        assert_eq!(session.device_info.user_agent.as_deref(), Some("test-agent/1.0"));
        assert_eq!(session.device_info.ip.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_session_from_query() {
        let query = HandshakeQuery {
            user_id: Some("u2".into()),
            portal_type: Some("production".into()),
        };
        let session = session_from_request(&HeaderMap::new(), &query, None).unwrap();
        assert_eq!(session.user_id, "u2");
        assert_eq!(session.portal_type, PortalType::Production);
    }

    #[test]
    fn test_headers_take_precedence() {
        let h = headers(&[("x-user-id", "from-header"), ("x-portal-type", "creator")]);
        let query = HandshakeQuery {
            user_id: Some("from-query".into()),
            portal_type: Some("investor".into()),
        };
        let session = session_from_request(&h, &query, None).unwrap();
        assert_eq!(session.user_id, "from-header");
        assert_eq!(session.portal_type, PortalType::Creator);
    }

    #[test]
    fn test_missing_identity() {
        let q = HandshakeQuery::default();
        assert_eq!(
            session_from_request(&headers(&[("x-portal-type", "creator")]), &q, None),
            Err(HandshakeError::MissingUserId)
        );
        assert_eq!(
            session_from_request(&headers(&[("x-user-id", " ")]), &q, None),
            Err(HandshakeError::MissingUserId)
        );
        assert_eq!(
            session_from_request(&headers(&[("x-user-id", "u1")]), &q, None),
            Err(HandshakeError::MissingPortalType)
        );
        assert_eq!(
            session_from_request(
                &headers(&[("x-user-id", "u1"), ("x-portal-type", "admin")]),
                &q,
                None
            ),
            Err(HandshakeError::UnknownPortalType("admin".into()))
        );
    }

    #[tokio::test]
    async fn test_upgrade_without_identity_is_unauthorized() {
        let state = crate::test_helpers::test_app_state().await;
        let app = Router::new()
            .route("/ws", get(hub_websocket_handler))
            .with_state(state);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/ws")
                    .header("x-portal-type", "creator")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "missing user id");
    }

    #[tokio::test]
    async fn test_identified_plain_get_is_not_an_upgrade() {
        let state = crate::test_helpers::test_app_state().await;
        let app = Router::new()
            .route("/ws", get(hub_websocket_handler))
            .with_state(state);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/ws?userId=u1&portalType=creator")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
        assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
