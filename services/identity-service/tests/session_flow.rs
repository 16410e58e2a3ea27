use axum::{
    body::Body,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, SET_COOKIE},
        Request, Response, StatusCode,
    },
};
use common_auth::Role;
use http_body_util::BodyExt;
use identity_service::Account;
use serde_json::{json, Value};
use tower::util::ServiceExt;
use uuid::Uuid;

mod support;
use support::TestApp;

const EMAIL: &str = "teacher@greenwood.edu";
const PASSWORD: &str = "CorrectHorseBatteryStaple!";

async fn json_body(response: Response<Body>) -> anyhow::Result<Value> {
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

fn refresh_cookie_pair(response: &Response<Body>) -> anyhow::Result<String> {
    let set_cookie = response
        .headers()
        .get(SET_COOKIE)
        .ok_or_else(|| anyhow::anyhow!("missing refresh cookie"))?
        .to_str()?;
    Ok(set_cookie
        .split(';')
        .next()
        .unwrap_or_default()
        .to_string())
}

fn login_request(identifier: &str, secret: &str) -> anyhow::Result<Request<Body>> {
    Ok(Request::builder()
        .method("POST")
        .uri("/login")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "identifier": identifier, "secret": secret }).to_string(),
        ))?)
}

fn seeded_app(tenant: Uuid) -> anyhow::Result<(TestApp, Account)> {
    let app = TestApp::new()?;
    let account = Account::new(Uuid::new_v4(), Some(Role::Teacher))
        .with_membership(tenant, Some(Role::Teacher));
    app.seed(EMAIL, PASSWORD, account.clone())?;
    Ok((app, account))
}

#[tokio::test]
async fn login_refresh_logout_round_trip() -> anyhow::Result<()> {
    let tenant = Uuid::new_v4();
    let (test_app, account) = seeded_app(tenant)?;
    let app = test_app.router();

    // 1. Login
    let login_resp = app.clone().oneshot(login_request(EMAIL, PASSWORD)?).await?;
    assert_eq!(login_resp.status(), StatusCode::OK);
    let cookie_pair = refresh_cookie_pair(&login_resp)?;
    assert!(cookie_pair.starts_with("school_refresh="));
    let login_body = json_body(login_resp).await?;
    let access_token = login_body["access_token"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing access token"))?
        .to_string();
    assert_eq!(login_body["user_id"], json!(account.user_id));
    assert_eq!(login_body["token_type"], json!("Bearer"));

    // 2. Session context resolves the tenant from the teacher claim
    let session_req = Request::builder()
        .method("GET")
        .uri("/session")
        .header(AUTHORIZATION, format!("Bearer {access_token}"))
        .body(Body::empty())?;
    let session_resp = app.clone().oneshot(session_req).await?;
    assert_eq!(session_resp.status(), StatusCode::OK);
    let session = json_body(session_resp).await?;
    assert_eq!(session["tenant_id"], json!(tenant));
    assert_eq!(session["tenant_source"], json!("claims"));
    assert_eq!(session["role"], json!("teacher"));
    assert_eq!(session["is_teacher"], json!(true));
    assert_eq!(session["is_admin"], json!(false));

    // 3. Refresh via cookie rotates the pair
    let refresh_req = Request::builder()
        .method("POST")
        .uri("/session/refresh")
        .header(COOKIE, &cookie_pair)
        .body(Body::empty())?;
    let refresh_resp = app.clone().oneshot(refresh_req).await?;
    assert_eq!(refresh_resp.status(), StatusCode::OK);
    let rotated_cookie = refresh_cookie_pair(&refresh_resp)?;
    assert_ne!(rotated_cookie, cookie_pair);

    // 4. The consumed refresh token cannot be replayed
    let replay_req = Request::builder()
        .method("POST")
        .uri("/session/refresh")
        .header(COOKIE, &cookie_pair)
        .body(Body::empty())?;
    let replay_resp = app.clone().oneshot(replay_req).await?;
    assert_eq!(replay_resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(replay_resp).await?["code"], json!("AUTH_TOKEN_REVOKED"));

    Ok(())
}

#[tokio::test]
async fn logout_blacklists_access_and_revokes_refresh() -> anyhow::Result<()> {
    let (test_app, _) = seeded_app(Uuid::new_v4())?;
    let app = test_app.router();

    let login_resp = app.clone().oneshot(login_request(EMAIL, PASSWORD)?).await?;
    assert_eq!(login_resp.status(), StatusCode::OK);
    let cookie_pair = refresh_cookie_pair(&login_resp)?;
    let access_token = json_body(login_resp).await?["access_token"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    let logout_req = Request::builder()
        .method("POST")
        .uri("/logout")
        .header(AUTHORIZATION, format!("Bearer {access_token}"))
        .header(COOKIE, &cookie_pair)
        .body(Body::empty())?;
    let logout_resp = app.clone().oneshot(logout_req).await?;
    assert_eq!(logout_resp.status(), StatusCode::NO_CONTENT);
    let cleared = logout_resp
        .headers()
        .get(SET_COOKIE)
        .ok_or_else(|| anyhow::anyhow!("missing cleared cookie"))?
        .to_str()?;
    assert!(cleared.starts_with("school_refresh=;"));
    assert!(cleared.contains("Max-Age=0"));
    assert!(cleared.contains("Expires=Thu, 01 Jan 1970"));
    assert_eq!(test_app.store.blacklist_len(), 1);

    // Access token is rejected even though it is still signed and unexpired
    let session_req = Request::builder()
        .method("GET")
        .uri("/session")
        .header(AUTHORIZATION, format!("Bearer {access_token}"))
        .body(Body::empty())?;
    let session_resp = app.clone().oneshot(session_req).await?;
    assert_eq!(session_resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(session_resp).await?["code"], json!("AUTH_TOKEN_REVOKED"));

    // Refresh token is dead as well
    let refresh_req = Request::builder()
        .method("POST")
        .uri("/session/refresh")
        .header(COOKIE, &cookie_pair)
        .body(Body::empty())?;
    let refresh_resp = app.clone().oneshot(refresh_req).await?;
    assert_eq!(refresh_resp.status(), StatusCode::UNAUTHORIZED);

    // Logging out twice is harmless
    let again_req = Request::builder()
        .method("POST")
        .uri("/logout")
        .header(COOKIE, &cookie_pair)
        .body(Body::empty())?;
    assert_eq!(app.oneshot(again_req).await?.status(), StatusCode::NO_CONTENT);

    Ok(())
}

#[tokio::test]
async fn login_failures_are_indistinguishable() -> anyhow::Result<()> {
    let (test_app, _) = seeded_app(Uuid::new_v4())?;
    let app = test_app.router();

    let wrong_secret = app.clone().oneshot(login_request(EMAIL, "nope")?).await?;
    let unknown_user = app
        .clone()
        .oneshot(login_request("ghost@greenwood.edu", PASSWORD)?)
        .await?;

    assert_eq!(wrong_secret.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(unknown_user.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(wrong_secret).await?, json_body(unknown_user).await?);
    assert_eq!(test_app.store.refresh_token_count(), 0);
    Ok(())
}

#[tokio::test]
async fn refresh_accepts_token_in_body() -> anyhow::Result<()> {
    let (test_app, _) = seeded_app(Uuid::new_v4())?;
    let app = test_app.router();

    let login_resp = app.clone().oneshot(login_request(EMAIL, PASSWORD)?).await?;
    let refresh_token = json_body(login_resp).await?["refresh_token"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    let refresh_req = Request::builder()
        .method("POST")
        .uri("/session/refresh")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "refresh_token": refresh_token }).to_string()))?;
    let refresh_resp = app.clone().oneshot(refresh_req).await?;
    assert_eq!(refresh_resp.status(), StatusCode::OK);

    let missing_req = Request::builder()
        .method("POST")
        .uri("/session/refresh")
        .body(Body::empty())?;
    let missing_resp = app.oneshot(missing_req).await?;
    assert_eq!(missing_resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(missing_resp).await?["code"], json!("AUTH_TOKEN"));
    Ok(())
}

#[tokio::test]
async fn path_tenant_wins_and_membership_is_enforced() -> anyhow::Result<()> {
    let home = Uuid::new_v4();
    let (test_app, _) = seeded_app(home)?;
    let app = test_app.router();

    let login_resp = app.clone().oneshot(login_request(EMAIL, PASSWORD)?).await?;
    let access_token = json_body(login_resp).await?["access_token"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    let foreign = Uuid::new_v4();
    let own_req = Request::builder()
        .method("GET")
        .uri(format!("/tenants/{home}/session"))
        .header(AUTHORIZATION, format!("Bearer {access_token}"))
        .header("X-Tenant-ID", foreign.to_string())
        .body(Body::empty())?;
    let own_resp = app.clone().oneshot(own_req).await?;
    assert_eq!(own_resp.status(), StatusCode::OK);
    let body = json_body(own_resp).await?;
    assert_eq!(body["tenant_id"], json!(home));
    assert_eq!(body["tenant_source"], json!("path"));

    let foreign_req = Request::builder()
        .method("GET")
        .uri(format!("/tenants/{foreign}/session"))
        .header(AUTHORIZATION, format!("Bearer {access_token}"))
        .body(Body::empty())?;
    let foreign_resp = app.oneshot(foreign_req).await?;
    assert_eq!(foreign_resp.status(), StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn missing_bearer_is_rejected() -> anyhow::Result<()> {
    let test_app = TestApp::new()?;
    let response = test_app
        .router()
        .oneshot(Request::builder().uri("/session").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn metrics_and_health_are_served() -> anyhow::Result<()> {
    let test_app = TestApp::new()?;
    let app = test_app.router();

    let health = app
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty())?)
        .await?;
    assert_eq!(health.status(), StatusCode::OK);

    let _ = app.clone().oneshot(login_request("ghost@example.edu", "x")?).await?;
    let metrics = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty())?)
        .await?;
    assert_eq!(metrics.status(), StatusCode::OK);
    let bytes = metrics.into_body().collect().await?.to_bytes();
    let text = String::from_utf8(bytes.to_vec())?;
    assert!(text.contains("auth_login_attempts_total"));
    Ok(())
}
