use super::*;
use axum::{
    extract::{
        ws::{Message as SocketMessage, WebSocket, WebSocketUpgrade},
        Path, Query as UrlQuery, State,
    },
    http::{HeaderMap, StatusCode as HttpStatus},
    response::{IntoResponse, Response as HttpResponse},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use shared::error::ErrorCode;
use tokio::{
    net::TcpListener,
    sync::{watch, Mutex},
};

use crate::backend::{
    AuthService, ChangeFeed, ChangeKind, Credentials, FeedStatus, Filter, Order, Query,
    RelationalStore, Row,
};

#[derive(Debug, Clone)]
struct Captured {
    method: &'static str,
    table: String,
    query: Vec<(String, String)>,
    apikey: Option<String>,
    authorization: Option<String>,
    prefer: Option<String>,
    body: Option<Value>,
}

#[derive(Clone, Default)]
struct ServerState {
    captured: Arc<Mutex<Vec<Captured>>>,
    frames: Arc<Mutex<Vec<Value>>>,
    reject_join: bool,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn capture(
    method: &'static str,
    table: String,
    query: Vec<(String, String)>,
    headers: &HeaderMap,
    body: Option<Value>,
) -> Captured {
    Captured {
        method,
        table,
        query,
        apikey: header(headers, "apikey"),
        authorization: header(headers, "authorization"),
        prefer: header(headers, "prefer"),
        body,
    }
}

async fn select_rows(
    State(state): State<ServerState>,
    Path(table): Path<String>,
    UrlQuery(query): UrlQuery<Vec<(String, String)>>,
    headers: HeaderMap,
) -> HttpResponse {
    state
        .captured
        .lock()
        .await
        .push(capture("GET", table.clone(), query, &headers, None));
    match table.as_str() {
        "messages" => Json(json!([{ "id": "m-1", "content": "hello" }])).into_response(),
        "missing" => (HttpStatus::NOT_FOUND, "relation does not exist").into_response(),
        "private" => HttpStatus::UNAUTHORIZED.into_response(),
        _ => (HttpStatus::SERVICE_UNAVAILABLE, "maintenance").into_response(),
    }
}

async fn insert_row(
    State(state): State<ServerState>,
    Path(table): Path<String>,
    UrlQuery(query): UrlQuery<Vec<(String, String)>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> HttpResponse {
    state
        .captured
        .lock()
        .await
        .push(capture("POST", table, query, &headers, Some(body.clone())));
    let mut stored = body;
    stored["id"] = json!("generated-id");
    stored["created_at"] = json!("2024-05-01T10:00:00Z");
    (HttpStatus::CREATED, Json(json!([stored]))).into_response()
}

async fn update_rows(
    State(state): State<ServerState>,
    Path(table): Path<String>,
    UrlQuery(query): UrlQuery<Vec<(String, String)>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> HttpStatus {
    state
        .captured
        .lock()
        .await
        .push(capture("PATCH", table, query, &headers, Some(body)));
    HttpStatus::NO_CONTENT
}

async fn token(Json(body): Json<Value>) -> HttpResponse {
    if body["email"] == json!("ana@example.com") && body["password"] == json!("s3cret") {
        Json(json!({
            "access_token": "user-token",
            "token_type": "bearer",
            "user": {
                "id": "00000000-0000-0000-0000-000000000005",
                "email": "ana@example.com",
                "user_metadata": { "username": "ana" },
            },
        }))
        .into_response()
    } else {
        (
            HttpStatus::BAD_REQUEST,
            Json(json!({ "error": "invalid_grant" })),
        )
            .into_response()
    }
}

async fn logout(State(state): State<ServerState>, headers: HeaderMap) -> HttpStatus {
    state.captured.lock().await.push(capture(
        "POST",
        "logout".to_string(),
        Vec::new(),
        &headers,
        None,
    ));
    HttpStatus::NO_CONTENT
}

async fn realtime_socket(
    State(state): State<ServerState>,
    upgrade: WebSocketUpgrade,
) -> HttpResponse {
    upgrade.on_upgrade(move |socket| serve_channel(socket, state))
}

async fn serve_channel(mut socket: WebSocket, state: ServerState) {
    while let Some(Ok(message)) = socket.recv().await {
        let SocketMessage::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        state.frames.lock().await.push(frame.clone());
        let topic = frame["topic"].clone();
        match frame["event"].as_str() {
            Some("phx_join") => {
                let status = if state.reject_join { "error" } else { "ok" };
                let reply = json!({
                    "topic": topic,
                    "event": "phx_reply",
                    "payload": { "status": status, "response": {} },
                    "ref": "1",
                });
                if socket.send(SocketMessage::Text(reply.to_string())).await.is_err() {
                    return;
                }
                if state.reject_join {
                    continue;
                }
                let change = json!({
                    "topic": topic,
                    "event": "postgres_changes",
                    "payload": {
                        "data": {
                            "type": "INSERT",
                            "table": "messages",
                            "schema": "public",
                            "record": { "id": "m-9", "chat_id": "c1", "content": "pushed" },
                        },
                    },
                    "ref": null,
                });
                if socket.send(SocketMessage::Text(change.to_string())).await.is_err() {
                    return;
                }
            }
            Some("phx_leave") => return,
            _ => {}
        }
    }
}

async fn spawn_backend_server(state: ServerState) -> anyhow::Result<String> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new()
        .route(
            "/rest/v1/:table",
            get(select_rows).post(insert_row).patch(update_rows),
        )
        .route("/auth/v1/token", post(token))
        .route("/auth/v1/logout", post(logout))
        .route("/realtime/v1/websocket", get(realtime_socket))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

async fn remote_backend(state: ServerState) -> Backend {
    let url = spawn_backend_server(state).await.expect("spawn server");
    let config = RemoteConfig::new(&url, "anon-key")
        .expect("config")
        .with_heartbeat_interval(Duration::from_millis(20));
    connect(config)
}

async fn wait_for_status(status: &mut watch::Receiver<FeedStatus>, expected: FeedStatus) {
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if *status.borrow_and_update() == expected {
                return true;
            }
            if status.changed().await.is_err() {
                return *status.borrow() == expected;
            }
        }
    })
    .await;
    assert_eq!(reached, Ok(true), "feed never reached {expected:?}");
}

async fn wait_for_frame(frames: &Mutex<Vec<Value>>, event: &str) {
    let seen = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if frames
                .lock()
                .await
                .iter()
                .any(|frame| frame["event"] == json!(event))
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(seen.is_ok(), "server never received {event}");
}

fn pair(name: &str, value: &str) -> (String, String) {
    (name.to_string(), value.to_string())
}

#[test]
fn base_url_gains_a_trailing_slash_so_endpoints_nest_under_it() {
    let config = RemoteConfig::new("https://demo.example.co/project", "anon").expect("config");
    assert_eq!(config.base_url.as_str(), "https://demo.example.co/project/");
    assert_eq!(
        config.endpoint("rest/v1/messages").expect("endpoint").as_str(),
        "https://demo.example.co/project/rest/v1/messages"
    );
    assert!(RemoteConfig::new("not a url", "anon").is_err());
}

#[test]
fn query_pairs_encode_projection_filters_order_and_limit() {
    let query = Query::table("messages")
        .select("*, users(username, avatar_url)")
        .filter(Filter::eq("chat_id", "c1"))
        .filter(Filter::one_of("sender_id", ["u1", "u2"]))
        .order(Order::asc("created_at"))
        .order(Order::desc("id"))
        .limit(50);

    assert_eq!(
        super::rest::query_pairs(&query),
        vec![
            pair("select", "*, users(username, avatar_url)"),
            pair("chat_id", "eq.c1"),
            pair("sender_id", "in.(u1,u2)"),
            pair("order", "created_at.asc,id.desc"),
            pair("limit", "50"),
        ]
    );
    assert_eq!(
        super::rest::query_pairs(&Query::table("chats")),
        vec![pair("select", "*")]
    );
}

#[test]
fn status_codes_map_onto_error_codes() {
    assert_eq!(
        status_error(StatusCode::NOT_FOUND, "").code(),
        ErrorCode::NotFound
    );
    assert_eq!(
        status_error(StatusCode::UNAUTHORIZED, "").code(),
        ErrorCode::Unauthorized
    );
    assert_eq!(
        status_error(StatusCode::FORBIDDEN, "rls").code(),
        ErrorCode::Unauthorized
    );
    assert_eq!(
        status_error(StatusCode::BAD_GATEWAY, "").code(),
        ErrorCode::Unavailable
    );
}

#[test]
fn realtime_topics_and_join_frames_carry_the_row_filter() {
    let filter = Filter::eq("chat_id", "c1");
    let topic = super::realtime::topic_for("messages", Some(&filter));
    assert_eq!(topic, "realtime:public:messages:chat_id=eq.c1");
    assert_eq!(
        super::realtime::topic_for("messages", None),
        "realtime:public:messages"
    );

    let join = super::realtime::join_frame(&topic, "messages", Some(&filter), "token");
    assert_eq!(join["event"], json!("phx_join"));
    assert_eq!(join["ref"], json!("1"));
    assert_eq!(join["payload"]["access_token"], json!("token"));
    assert_eq!(
        join["payload"]["config"]["postgres_changes"],
        json!([{ "event": "*", "schema": "public", "table": "messages", "filter": "chat_id=eq.c1" }])
    );
}

#[test]
fn change_payloads_decode_into_row_events() {
    let insert = json!({
        "data": {
            "type": "INSERT",
            "table": "messages",
            "record": { "id": "m-1", "content": "hi" },
        }
    });
    let event = super::realtime::decode_change(&insert).expect("insert decodes");
    assert_eq!(event.kind, ChangeKind::Insert);
    assert_eq!(event.table, "messages");
    assert_eq!(event.row.get("content"), Some(&json!("hi")));

    let delete = json!({
        "data": {
            "type": "DELETE",
            "table": "messages",
            "old_record": { "id": "m-1" },
        }
    });
    let event = super::realtime::decode_change(&delete).expect("delete decodes");
    assert_eq!(event.kind, ChangeKind::Delete);
    assert_eq!(event.row.get("id"), Some(&json!("m-1")));

    assert!(super::realtime::decode_change(&json!({ "data": { "type": "TRUNCATE" } })).is_none());
    assert!(super::realtime::decode_change(&json!({})).is_none());
}

#[test]
fn socket_url_switches_to_websocket_scheme_and_carries_the_key() {
    let secure = RemoteConfig::new("https://demo.example.co", "anon").expect("config");
    let url = super::realtime::socket_url(&secure).expect("socket url");
    assert_eq!(url.scheme(), "wss");
    assert_eq!(url.path(), "/realtime/v1/websocket");
    assert_eq!(url.query(), Some("apikey=anon&vsn=1.0.0"));

    let local = RemoteConfig::new("http://127.0.0.1:54321", "anon").expect("config");
    let url = super::realtime::socket_url(&local).expect("socket url");
    assert_eq!(url.scheme(), "ws");
}

#[tokio::test]
async fn select_sends_filters_and_the_anonymous_key() {
    let state = ServerState::default();
    let backend = remote_backend(state.clone()).await;

    let rows = backend
        .store
        .query(
            &Query::table("messages")
                .filter(Filter::eq("chat_id", "c1"))
                .order(Order::asc("created_at")),
        )
        .await
        .expect("select");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("content"), Some(&json!("hello")));

    let captured = state.captured.lock().await;
    let request = &captured[0];
    assert_eq!(request.method, "GET");
    assert_eq!(request.table, "messages");
    assert!(request.query.contains(&pair("chat_id", "eq.c1")));
    assert!(request.query.contains(&pair("order", "created_at.asc")));
    assert_eq!(request.apikey.as_deref(), Some("anon-key"));
    assert_eq!(request.authorization.as_deref(), Some("Bearer anon-key"));
}

#[tokio::test]
async fn insert_and_upsert_ask_for_the_stored_representation() {
    let state = ServerState::default();
    let backend = remote_backend(state.clone()).await;

    let mut row = Row::new();
    row.insert("content".into(), json!("hi"));
    let stored = backend
        .store
        .insert("messages", row.clone())
        .await
        .expect("insert");
    assert_eq!(stored.get("id"), Some(&json!("generated-id")));
    assert_eq!(stored.get("content"), Some(&json!("hi")));

    backend
        .store
        .upsert("users", row.clone(), "id")
        .await
        .expect("upsert");
    backend
        .store
        .update("chats", &[Filter::eq("id", "c1")], row)
        .await
        .expect("update");

    let captured = state.captured.lock().await;
    assert_eq!(captured[0].prefer.as_deref(), Some("return=representation"));
    assert_eq!(captured[0].body, Some(json!({ "content": "hi" })));
    assert_eq!(
        captured[1].prefer.as_deref(),
        Some("resolution=merge-duplicates,return=representation")
    );
    assert!(captured[1].query.contains(&pair("on_conflict", "id")));
    assert_eq!(captured[2].method, "PATCH");
    assert!(captured[2].query.contains(&pair("id", "eq.c1")));
}

#[tokio::test]
async fn http_failures_surface_as_structured_errors() {
    let backend = remote_backend(ServerState::default()).await;

    let missing = backend
        .store
        .query(&Query::table("missing"))
        .await
        .expect_err("404");
    assert_eq!(missing.code(), ErrorCode::NotFound);

    let private = backend
        .store
        .query(&Query::table("private"))
        .await
        .expect_err("401");
    assert_eq!(private.code(), ErrorCode::Unauthorized);

    let down = backend
        .store
        .query(&Query::table("anything"))
        .await
        .expect_err("503");
    assert_eq!(down.code(), ErrorCode::Unavailable);
}

#[tokio::test]
async fn sign_in_installs_the_session_token_for_later_requests() {
    let state = ServerState::default();
    let backend = remote_backend(state.clone()).await;

    let rejected = backend
        .auth
        .sign_in(&Credentials {
            email: "ana@example.com".into(),
            password: "wrong".into(),
            username: None,
        })
        .await
        .expect_err("bad password");
    assert_eq!(rejected.code(), ErrorCode::Unauthorized);
    assert!(backend.auth.current_session().await.is_none());

    let session = backend
        .auth
        .sign_in(&Credentials {
            email: "ana@example.com".into(),
            password: "s3cret".into(),
            username: None,
        })
        .await
        .expect("sign in");
    assert_eq!(session.access_token, "user-token");
    assert_eq!(session.username.as_deref(), Some("ana"));
    assert_eq!(backend.auth.current_session().await, Some(session));

    backend
        .store
        .query(&Query::table("messages"))
        .await
        .expect("select");
    backend.auth.sign_out().await.expect("sign out");
    assert!(backend.auth.current_session().await.is_none());

    let captured = state.captured.lock().await;
    assert_eq!(captured[0].authorization.as_deref(), Some("Bearer user-token"));
    assert_eq!(captured[1].table, "logout");
    assert_eq!(captured[1].authorization.as_deref(), Some("Bearer user-token"));
}

#[tokio::test]
async fn realtime_channel_joins_forwards_changes_and_leaves() {
    let state = ServerState::default();
    let backend = remote_backend(state.clone()).await;

    let mut subscription = backend
        .feed
        .subscribe("messages", Some(Filter::eq("chat_id", "c1")))
        .await
        .expect("subscribe");
    wait_for_status(&mut subscription.status, FeedStatus::Attached).await;

    let event = tokio::time::timeout(Duration::from_secs(2), subscription.events.recv())
        .await
        .expect("change delivered")
        .expect("event stream open");
    assert_eq!(event.kind, ChangeKind::Insert);
    assert_eq!(event.row.get("content"), Some(&json!("pushed")));

    wait_for_frame(&state.frames, "heartbeat").await;
    backend.feed.unsubscribe(subscription.handle).await;
    wait_for_status(&mut subscription.status, FeedStatus::Closed).await;
    wait_for_frame(&state.frames, "phx_leave").await;

    let frames = state.frames.lock().await;
    let join = frames
        .iter()
        .find(|frame| frame["event"] == json!("phx_join"))
        .expect("join frame");
    assert_eq!(join["topic"], json!("realtime:public:messages:chat_id=eq.c1"));
    assert_eq!(join["payload"]["access_token"], json!("anon-key"));
}

#[tokio::test]
async fn rejected_join_marks_the_subscription_failed() {
    let state = ServerState {
        reject_join: true,
        ..ServerState::default()
    };
    let backend = remote_backend(state).await;

    let mut subscription = backend
        .feed
        .subscribe("messages", None)
        .await
        .expect("subscribe");
    let failed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if matches!(*subscription.status.borrow_and_update(), FeedStatus::Failed(_)) {
                return true;
            }
            if subscription.status.changed().await.is_err() {
                return matches!(*subscription.status.borrow(), FeedStatus::Failed(_));
            }
        }
    })
    .await;
    assert_eq!(failed, Ok(true));
}
