use std::net::SocketAddr;

use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::AppConfig;
use crate::state::AppState;
use crate::{auth, users};

fn cors(config: &AppConfig) -> anyhow::Result<CorsLayer> {
    let Some(origin) = config.cors_origin.as_deref() else {
        return Ok(CorsLayer::permissive());
    };
    // Cookies require an explicit origin.
    Ok(CorsLayer::new()
        .allow_origin(origin.parse::<HeaderValue>()?)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]))
}

pub fn build_app(state: AppState) -> anyhow::Result<Router> {
    let cors = cors(&state.config)?;
    Ok(Router::new()
        .nest(
            "/api/v1",
            Router::new()
                .nest(
                    "/users",
                    Router::new().merge(auth::router()).merge(users::router()),
                )
                .route("/health", get(|| async { "ok" })),
        )
        .with_state(state)
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let method = req.method().clone();
                    let uri = req.uri().clone();
                    tracing::info_span!("http_request", %method, uri = %uri, status = tracing::field::Empty)
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     _latency: std::time::Duration,
                     span: &tracing::Span| {
                        let status = res.status();
                        span.record("status", tracing::field::display(status));
                        if status.is_server_error() {
                            tracing::error!(%status, "response");
                        } else {
                            tracing::info!(%status, "response");
                        }
                    },
                ),
        ))
}

pub async fn serve(app: Router, config: &AppConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{HeaderMap, Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::state::fakes::TestState;

    const BOUNDARY: &str = "userhub-test-boundary";

    fn multipart_body(fields: &[(&str, &str)], files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        for (name, bytes) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{name}.png\"\r\nContent-Type: image/png\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn multipart_request(method: &str, uri: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn json_request(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn register_alice() -> Request<Body> {
        let body = multipart_body(
            &[
                ("username", "Alice"),
                ("email", "a@x.com"),
                ("fullName", "Alice A"),
                ("password", "pw123"),
            ],
            &[("avatar", &b"\x89PNG-file1"[..])],
        );
        multipart_request("POST", "/api/v1/users/register", body)
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let headers = res.headers().clone();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, json)
    }

    fn set_cookies(headers: &HeaderMap) -> Vec<String> {
        headers
            .get_all("set-cookie")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
        set_cookies(headers).into_iter().find_map(|c| {
            c.strip_prefix(&format!("{name}="))
                .map(|rest| rest.split(';').next().unwrap_or_default().to_string())
        })
    }

    fn app() -> (TestState, Router) {
        let t = TestState::new();
        let app = build_app(t.state.clone()).unwrap();
        (t, app)
    }

    async fn login_alice(app: &Router) -> (HeaderMap, Value) {
        let (status, headers, body) = send(
            app,
            json_request(
                "/api/v1/users/login",
                json!({"username": "alice", "password": "pw123"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        (headers, body)
    }

    #[tokio::test]
    async fn health() {
        let (_, app) = app();
        let req = Request::get("/api/v1/health").body(Body::empty()).unwrap();
        let (status, _, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn register_returns_sanitized_user() {
        let (_, app) = app();
        let (status, _, body) = send(&app, register_alice()).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["statusCode"], 201);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["username"], "alice");
        assert_eq!(body["data"]["fullName"], "Alice A");
        assert!(body["data"].get("password").is_none());
        assert!(body["data"].get("passwordHash").is_none());
        assert!(body["data"].get("refreshToken").is_none());

        let (status, _, body) = send(&app, register_alice()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
        assert_eq!(body["errors"], json!([]));
    }

    #[tokio::test]
    async fn register_without_avatar_is_rejected() {
        let (t, app) = app();
        let body = multipart_body(
            &[
                ("username", "bob"),
                ("email", "b@x.com"),
                ("fullName", "Bob"),
                ("password", "pw"),
            ],
            &[],
        );
        let (status, _, body) =
            send(&app, multipart_request("POST", "/api/v1/users/register", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["statusCode"], 400);
        assert_eq!(t.users.len().await, 0);
    }

    #[tokio::test]
    async fn login_sets_cookies_and_rejects_bad_password() {
        let (_, app) = app();
        send(&app, register_alice()).await;

        let (status, _, body) = send(
            &app,
            json_request(
                "/api/v1/users/login",
                json!({"username": "alice", "password": "wrongpw"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);

        let (headers, body) = login_alice(&app).await;
        let access = body["data"]["accessToken"].as_str().unwrap();
        let refresh = body["data"]["refreshToken"].as_str().unwrap();
        assert_eq!(cookie_value(&headers, "accessToken").as_deref(), Some(access));
        assert_eq!(cookie_value(&headers, "refreshToken").as_deref(), Some(refresh));
        assert!(set_cookies(&headers).iter().all(|c| c.contains("HttpOnly")));
        assert!(body["data"]["user"].get("refreshToken").is_none());
    }

    #[tokio::test]
    async fn refresh_rotates_tokens_once() {
        let (_, app) = app();
        send(&app, register_alice()).await;
        let (_, body) = login_alice(&app).await;
        let original = body["data"]["refreshToken"].as_str().unwrap().to_string();

        let req = Request::post("/api/v1/users/refresh-token")
            .header("cookie", format!("refreshToken={original}"))
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        let rotated = body["data"]["refreshToken"].as_str().unwrap();
        assert_ne!(rotated, original);
        assert_eq!(cookie_value(&headers, "refreshToken").as_deref(), Some(rotated));

        let (status, _, _) = send(
            &app,
            json_request(
                "/api/v1/users/refresh-token",
                json!({"refreshToken": original}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_kills_refresh_but_not_access_token() {
        let (_, app) = app();
        send(&app, register_alice()).await;
        let (_, body) = login_alice(&app).await;
        let access = body["data"]["accessToken"].as_str().unwrap().to_string();
        let refresh = body["data"]["refreshToken"].as_str().unwrap().to_string();

        let req = Request::post("/api/v1/users/logout")
            .header("authorization", format!("Bearer {access}"))
            .body(Body::empty())
            .unwrap();
        let (status, headers, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        let cleared = set_cookies(&headers);
        assert_eq!(cleared.len(), 2);
        assert!(cleared.iter().all(|c| c.contains("Max-Age=0")));

        let (status, _, _) = send(
            &app,
            json_request("/api/v1/users/refresh-token", json!({"refreshToken": refresh})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // Access tokens are stateless and live until they expire.
        let req = Request::get("/api/v1/users/current-user")
            .header("authorization", format!("Bearer {access}"))
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["username"], "alice");
    }

    #[tokio::test]
    async fn protected_routes_require_access_token() {
        let (_, app) = app();
        let req = Request::get("/api/v1/users/current-user")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["statusCode"], 401);

        let req = Request::post("/api/v1/users/logout")
            .header("authorization", "Bearer not-a-token")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn change_password_and_update_profile() {
        let (_, app) = app();
        send(&app, register_alice()).await;
        let (headers, _) = login_alice(&app).await;
        let cookie = format!(
            "accessToken={}",
            cookie_value(&headers, "accessToken").unwrap()
        );

        let req = Request::post("/api/v1/users/change-password")
            .header("cookie", &cookie)
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"oldPassword": "pw123", "newPassword": "a", "confirmPassword": "b"})
                    .to_string(),
            ))
            .unwrap();
        let (status, _, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let req = Request::patch("/api/v1/users/update-account-details")
            .header("cookie", &cookie)
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"fullName": "Alice Liddell", "email": "alice@x.com"}).to_string(),
            ))
            .unwrap();
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["fullName"], "Alice Liddell");
        assert_eq!(body["data"]["email"], "alice@x.com");

        let mut req = multipart_request(
            "PATCH",
            "/api/v1/users/update-user-cover-image",
            multipart_body(&[], &[("coverImage", &b"\x89PNG-cover"[..])]),
        );
        req.headers_mut()
            .insert("cookie", cookie.parse().unwrap());
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["coverImage"]
            .as_str()
            .unwrap()
            .starts_with("https://fake.local/cover-images/"));
    }
}
