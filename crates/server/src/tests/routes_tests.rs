use super::*;
use axum::{body, body::Body, http::Request};
use kanban_api::ApiContext;
use serde_json::{json, Value};
use storage::Storage;
use tower::ServiceExt;

async fn test_app() -> Router {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    build_router(Arc::new(AppState {
        api: ApiContext::new(storage),
    }))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    if bytes.is_empty() {
        return (status, Value::Null);
    }
    (status, serde_json::from_slice(&bytes).expect("json"))
}

fn json_request(method: Method, uri: &str, payload: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .expect("request")
}

fn empty_request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

struct Seeded {
    customer: i64,
    statuses: Vec<i64>,
    status_chain: i64,
}

async fn seed(app: &Router) -> Seeded {
    let mut accounts = Vec::new();
    for name in ["customer", "supplier"] {
        let (status, account) = send(
            app,
            json_request(Method::POST, "/api/accounts", json!({ "name": name })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        accounts.push(account["id"].as_i64().expect("account id"));
    }

    let (status, _) = send(
        app,
        json_request(
            Method::POST,
            "/api/products",
            json!({ "product_code": "ART-1", "name": "Bolt" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let mut statuses = Vec::new();
    for name in ["S1", "S2", "S3"] {
        let (_, created) = send(
            app,
            json_request(
                Method::POST,
                "/api/statuses",
                json!({ "name": name, "color": "white" }),
            ),
        )
        .await;
        statuses.push(created["id"].as_i64().expect("status id"));
    }

    let (status, chain) = send(
        app,
        json_request(
            Method::POST,
            "/api/status-chains",
            json!({
                "name": "C",
                "entries": [
                    { "status_id": statuses[0], "order": 1, "actor_role": "customer" },
                    { "status_id": statuses[1], "order": 2, "actor_role": "supplier" },
                    { "status_id": statuses[2], "order": 3, "actor_role": "supplier" }
                ]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, created) = send(
        app,
        json_request(
            Method::POST,
            "/api/kanban-chains",
            json!({
                "kanban_chain": {
                    "customer_account_id": accounts[0],
                    "product_code": "ART-1",
                    "supplier_account_id": accounts[1],
                    "leadtime_days": 3,
                    "quantity": 12.0,
                    "container_type": "bin",
                    "status_chain_id": chain["status_chain"]["id"],
                    "target_active_kanban_count": 2
                }
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["kanbans"].as_array().expect("kanbans").len(), 2);

    Seeded {
        customer: accounts[0],
        statuses,
        status_chain: chain["status_chain"]["id"].as_i64().expect("chain id"),
    }
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let app = test_app().await;
    let response = app
        .oneshot(empty_request(Method::GET, "/healthz"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn advance_route_walks_the_chain_and_records_history() {
    let app = test_app().await;
    let seeded = seed(&app).await;

    let (status, advanced) = send(&app, empty_request(Method::POST, "/api/kanbans/1/advance")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(advanced["status_current"], json!(seeded.statuses[1]));

    let (status, history) = send(&app, empty_request(Method::GET, "/api/kanbans/1/history")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history[0]["previous_status"], json!(seeded.statuses[0]));
    assert_eq!(history[0]["next_status"], json!(seeded.statuses[1]));
}

#[tokio::test]
async fn missing_kanban_maps_to_not_found() {
    let app = test_app().await;
    let (status, body) = send(&app, empty_request(Method::POST, "/api/kanbans/99/advance")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], json!("not_found"));
}

#[tokio::test]
async fn field_mask_rejects_status_current() {
    let app = test_app().await;
    seed(&app).await;

    let (status, body) = send(
        &app,
        json_request(
            Method::PATCH,
            "/api/kanbans/1",
            json!({ "status_current": 3 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("validation"));

    let (status, edited) = send(
        &app,
        json_request(Method::PATCH, "/api/kanbans/1", json!({ "quantity": 30.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(edited["quantity"], json!(30.0));
}

#[tokio::test]
async fn duplicate_orders_are_bad_requests() {
    let app = test_app().await;
    let seeded = seed(&app).await;
    let (_, extra) = send(
        &app,
        json_request(
            Method::POST,
            "/api/statuses",
            json!({ "name": "S4", "color": "blue" }),
        ),
    )
    .await;

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            &format!("/api/status-chains/{}/statuses", seeded.status_chain),
            json!([{ "status_id": extra["id"], "order": 2, "actor_role": "supplier" }]),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("validation"));
}

#[tokio::test]
async fn referenced_status_chain_delete_is_invalid_state() {
    let app = test_app().await;
    let seeded = seed(&app).await;

    let (status, body) = send(
        &app,
        empty_request(
            Method::DELETE,
            &format!("/api/status-chains/{}", seeded.status_chain),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], json!("invalid_state"));
}

#[tokio::test]
async fn deactivated_kanban_leaves_customer_dashboard() {
    let app = test_app().await;
    let seeded = seed(&app).await;

    let (status, deactivated) = send(&app, empty_request(Method::DELETE, "/api/kanbans/1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deactivated["is_active"], json!(false));

    let (status, dashboard) = send(
        &app,
        empty_request(
            Method::GET,
            &format!("/api/dashboards/customer/{}", seeded.customer),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let products = dashboard["products"].as_array().expect("products");
    assert_eq!(products.len(), 1);
    assert_eq!(products[0]["product_key"], json!("ART-1"));
    assert_eq!(products[0]["kanbans"].as_array().expect("kanbans").len(), 1);

    let (_, listed) = send(&app, empty_request(Method::GET, "/api/kanbans")).await;
    assert_eq!(listed.as_array().expect("kanbans").len(), 1);
    let (_, all) = send(
        &app,
        empty_request(Method::GET, "/api/kanbans?include_inactive=true"),
    )
    .await;
    assert_eq!(all.as_array().expect("kanbans").len(), 2);
}

#[tokio::test]
async fn top_up_adds_kanbans_to_chain() {
    let app = test_app().await;
    seed(&app).await;

    let (status, added) = send(
        &app,
        json_request(
            Method::POST,
            "/api/kanban-chains/1/kanbans",
            json!({ "count": 3 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(added.as_array().expect("kanbans").len(), 3);

    let (_, chains) = send(&app, empty_request(Method::GET, "/api/kanban-chains")).await;
    assert_eq!(chains[0]["active_kanbans"], json!(5));
}

#[tokio::test]
async fn non_numeric_ids_are_json_validation_errors() {
    let app = test_app().await;
    seed(&app).await;

    let (status, body) = send(&app, empty_request(Method::GET, "/api/kanbans/abc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("validation"));

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/api/kanban-chains/first/kanbans",
            json!({ "count": 1 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("validation"));
}

#[tokio::test]
async fn oversized_top_up_is_a_bad_request() {
    let app = test_app().await;
    seed(&app).await;

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/api/kanban-chains/1/kanbans",
            json!({ "count": u32::MAX }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("validation"));

    let (_, chains) = send(&app, empty_request(Method::GET, "/api/kanban-chains")).await;
    assert_eq!(chains[0]["active_kanbans"], json!(2));
}

#[tokio::test]
async fn cors_layer_allows_configured_origin() {
    let app = test_app()
        .await
        .layer(cors_layer("http://localhost:3000").expect("cors"));
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/accounts")
        .header("origin", "http://localhost:3000")
        .header("access-control-request-method", "POST")
        .body(Body::empty())
        .expect("request");

    let response = app.oneshot(request).await.expect("response");
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("http://localhost:3000")
    );
}

#[test]
fn cors_layer_rejects_unparseable_origin() {
    assert!(cors_layer("bad\norigin").is_err());
}
