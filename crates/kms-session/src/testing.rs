//! In-process mock of the credential authority and a couple of protected
//! endpoints, for tests.
//!
//! Token generations: login issues A1/R1; each accepted refresh issues the
//! next generation (A2/R2, A3/R3, ...). Only the latest access token is
//! accepted, and only until `expire_access_tokens` is called.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::net::TcpListener;

type Reply = (StatusCode, Json<Value>);

struct Tokens {
    generation: u32,
    access: Option<String>,
    refresh: Option<String>,
}

struct MockState {
    tokens: Mutex<Tokens>,
    password: Mutex<String>,
    refresh_delay: Mutex<Duration>,
    refresh_calls: AtomicUsize,
    protected_calls: AtomicUsize,
    reject_all: AtomicBool,
    seen_tokens: Mutex<Vec<Option<String>>>,
}

pub struct MockAuthority {
    url: String,
    state: Arc<MockState>,
}

impl MockAuthority {
    /// Start the mock on an ephemeral port. A1/R1 are valid initially.
    pub async fn start() -> Self {
        let state = Arc::new(MockState {
            tokens: Mutex::new(Tokens {
                generation: 1,
                access: Some("A1".into()),
                refresh: Some("R1".into()),
            }),
            password: Mutex::new("correct-pw".into()),
            refresh_delay: Mutex::new(Duration::ZERO),
            refresh_calls: AtomicUsize::new(0),
            protected_calls: AtomicUsize::new(0),
            reject_all: AtomicBool::new(false),
            seen_tokens: Mutex::new(Vec::new()),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/v1", listener.local_addr().unwrap());

        let app = axum::Router::new()
            .route("/api/v1/auth/login", post(login))
            .route("/api/v1/auth/register", post(register))
            .route("/api/v1/auth/refresh", post(refresh))
            .route("/api/v1/auth/change-password", post(change_password))
            .route("/api/v1/users/me", get(me))
            .route("/api/v1/trainings", get(list_trainings).post(create_training))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { url, state }
    }

    pub fn url(&self) -> String {
        self.url.clone()
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn protected_calls(&self) -> usize {
        self.state.protected_calls.load(Ordering::SeqCst)
    }

    /// Authorization tokens presented to protected endpoints, in arrival order.
    pub fn seen_tokens(&self) -> Vec<Option<String>> {
        self.state.seen_tokens.lock().unwrap().clone()
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.state.refresh_delay.lock().unwrap() = delay;
    }

    /// The current access token stops being accepted.
    pub fn expire_access_tokens(&self) {
        self.state.tokens.lock().unwrap().access = None;
    }

    /// Every refresh token is rejected from now on.
    pub fn invalidate_refresh_tokens(&self) {
        self.state.tokens.lock().unwrap().refresh = None;
    }

    /// Protected endpoints answer 401 to every token, fresh or not.
    pub fn reject_all_access(&self) {
        self.state.reject_all.store(true, Ordering::SeqCst);
    }

    pub fn password(&self) -> String {
        self.state.password.lock().unwrap().clone()
    }
}

fn detail(status: StatusCode, message: &str) -> Reply {
    (status, Json(json!({ "detail": message })))
}

fn envelope(generation: u32) -> Value {
    json!({
        "access_token": format!("A{generation}"),
        "refresh_token": format!("R{generation}"),
        "token_type": "bearer",
    })
}

fn issue_first_generation(state: &MockState) -> Value {
    let mut tokens = state.tokens.lock().unwrap();
    tokens.generation = 1;
    tokens.access = Some("A1".into());
    tokens.refresh = Some("R1".into());
    envelope(1)
}

/// Check the bearer token; records what was presented.
fn authorize(state: &MockState, headers: &HeaderMap) -> Result<(), Reply> {
    state.protected_calls.fetch_add(1, Ordering::SeqCst);
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    state.seen_tokens.lock().unwrap().push(presented.clone());

    if state.reject_all.load(Ordering::SeqCst) {
        return Err(detail(StatusCode::UNAUTHORIZED, "Could not validate credentials"));
    }
    let tokens = state.tokens.lock().unwrap();
    match (presented, tokens.access.as_ref()) {
        (Some(p), Some(valid)) if &p == valid => Ok(()),
        _ => Err(detail(StatusCode::UNAUTHORIZED, "Could not validate credentials")),
    }
}

async fn login(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Reply {
    let (Some(username), Some(password)) = (
        body.get("username").and_then(Value::as_str),
        body.get("password").and_then(Value::as_str),
    ) else {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"detail": [{"msg": "field required"}]})),
        );
    };
    let expected = state.password.lock().unwrap().clone();
    if username != "alice" || password != expected {
        return detail(StatusCode::UNAUTHORIZED, "Invalid credentials");
    }
    (StatusCode::OK, Json(issue_first_generation(&state)))
}

async fn register(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Reply {
    if body["username"] == "alice" || body["username"] == "taken" {
        return detail(StatusCode::BAD_REQUEST, "Username already registered");
    }
    let mut reply = issue_first_generation(&state);
    reply["message"] = json!("User registered successfully");
    (StatusCode::CREATED, Json(reply))
}

async fn refresh(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Reply {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let delay = *state.refresh_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let mut tokens = state.tokens.lock().unwrap();
    let presented = body.get("refresh_token").and_then(Value::as_str);
    match (presented, tokens.refresh.as_deref()) {
        (Some(p), Some(valid)) if p == valid => {
            tokens.generation += 1;
            let generation = tokens.generation;
            tokens.access = Some(format!("A{generation}"));
            tokens.refresh = Some(format!("R{generation}"));
            (StatusCode::OK, Json(envelope(generation)))
        }
        _ => detail(StatusCode::UNAUTHORIZED, "Invalid refresh token"),
    }
}

async fn change_password(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Reply {
    if let Err(reply) = authorize(&state, &headers) {
        return reply;
    }
    let mut password = state.password.lock().unwrap();
    if body["current_password"].as_str() != Some(password.as_str()) {
        return detail(StatusCode::BAD_REQUEST, "Current password is incorrect");
    }
    match body["new_password"].as_str() {
        Some(new) => {
            *password = new.to_string();
            (
                StatusCode::OK,
                Json(json!({"message": "Password changed successfully"})),
            )
        }
        None => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"detail": [{"msg": "field required"}]})),
        ),
    }
}

async fn me(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Reply {
    if let Err(reply) = authorize(&state, &headers) {
        return reply;
    }
    (
        StatusCode::OK,
        Json(json!({
            "id": 1,
            "username": "alice",
            "email": "alice@example.com",
            "full_name": "Alice Example",
            "office_location": "Berlin",
            "department": null,
            "role": "admin",
            "is_active": true
        })),
    )
}

async fn list_trainings(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Reply {
    if let Err(reply) = authorize(&state, &headers) {
        return reply;
    }
    (
        StatusCode::OK,
        Json(json!([{"id": 7, "title": "Fire safety"}])),
    )
}

/// Echoes the body and the custom header so replay fidelity can be checked.
async fn create_training(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Reply {
    if let Err(reply) = authorize(&state, &headers) {
        return reply;
    }
    let trace = headers
        .get("x-trace")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    (
        StatusCode::CREATED,
        Json(json!({"created": body, "x_trace": trace})),
    )
}
