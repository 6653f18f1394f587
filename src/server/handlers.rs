// Feature handlers.
//
// `dispatch_request` is the single entry point: the dispatch table picks the
// feature, the handler executes against the injected collaborators, and the
// audit sink records the action. Errors are converted to structured JSON at
// this boundary; nothing here can crash the process.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequestParts, State, WebSocketUpgrade};
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};

use super::EngineServer;
use crate::dispatch::{Dispatch, Feature};
use crate::errors::{EngineError, EngineResult};
use crate::mail::{welcome_body, WELCOME_SUBJECT};
use crate::providers::GenerationRequest;
use crate::store::{
    next_goal_id, DeviceRegistration, DevicesDomain, Goal, GoalsDomain, ProfileDomain,
};
use crate::stream;

const GUEST_ACTOR: &str = "guest";

pub(super) async fn dispatch_request(
    State(server): State<Arc<EngineServer>>,
    request: Request<Body>,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    let (feature, rate_limit_exempt) = match server.dispatch.dispatch(&path, &parts.method) {
        Dispatch::Matched {
            feature,
            rate_limit_exempt,
        } => (feature, rate_limit_exempt),
        Dispatch::MethodNotAllowed { token } => {
            return EngineError::MethodNotAllowed {
                method: parts.method.to_string(),
                route: token,
            }
            .into_response()
        }
        Dispatch::Unhandled => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "not found" })),
            )
                .into_response()
        }
    };

    // The streaming channel upgrades before any body handling.
    if feature == Feature::Stream {
        return upgrade_stream(&server, &mut parts).await;
    }

    let bytes = match axum::body::to_bytes(body, super::MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return EngineError::ClientInput("unreadable request body".into()).into_response(),
    };
    let body_json: Option<Value> = if bytes.is_empty() {
        None
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                return EngineError::ClientInput(format!("invalid JSON body: {e}")).into_response()
            }
        }
    };

    let actor = actor_identity(&parts.headers, body_json.as_ref());

    if !rate_limit_exempt && !server.limiter.check(&actor) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "rate limit exceeded" })),
        )
            .into_response();
    }

    let result = match feature {
        Feature::Status => handle_status(&server, &path),
        Feature::Gemini => handle_generate(&server, "gemini", &actor, body_json).await,
        Feature::OpenAi => handle_generate(&server, "openai", &actor, body_json).await,
        Feature::Tts => handle_tts(&server, &actor, body_json).await,
        Feature::Goals => handle_goals(&server, &parts.method, &path, &actor, body_json).await,
        Feature::Profile => handle_profile(&server, &parts.method, &actor, body_json).await,
        Feature::Devices => handle_devices(&server, &actor, body_json).await,
        Feature::WelcomeEmail => handle_welcome_email(&server, &actor, body_json).await,
        Feature::Analytics => handle_passthrough(&server, &server.analytics, &actor, body_json).await,
        Feature::Revenue => handle_passthrough(&server, &server.payments, &actor, body_json).await,
        Feature::Callback => handle_callback(&server, &actor, body_json),
        Feature::Stream => unreachable!("stream handled before body read"),
    };

    result.unwrap_or_else(IntoResponse::into_response)
}

/// Actor identity: header first, then a body field, then the shared guest
/// identity. Callers relying on per-user isolation must supply one.
fn actor_identity(headers: &HeaderMap, body: Option<&Value>) -> String {
    if let Some(actor) = headers.get("x-actor-id").and_then(|v| v.to_str().ok()) {
        if !actor.is_empty() {
            return actor.to_string();
        }
    }
    if let Some(body) = body {
        for key in ["user_id", "userId"] {
            if let Some(actor) = body.get(key).and_then(Value::as_str) {
                if !actor.is_empty() {
                    return actor.to_string();
                }
            }
        }
    }
    GUEST_ACTOR.to_string()
}

async fn upgrade_stream(server: &Arc<EngineServer>, parts: &mut Parts) -> Response {
    if !server.features.streaming_enabled {
        return EngineError::NotFound("streaming channel".into()).into_response();
    }
    match WebSocketUpgrade::from_request_parts(parts, &()).await {
        Ok(upgrade) => {
            let coordinator = server.coordinator.clone();
            upgrade
                .on_upgrade(move |socket| stream::ws::handle_socket(socket, coordinator))
                .into_response()
        }
        Err(rejection) => rejection.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

fn handle_status(server: &EngineServer, path: &str) -> EngineResult<Response> {
    // Bare `/` keeps the original human-facing landing page.
    if path == "/" {
        return Ok(Html(
            "<div style=\"font-family: sans-serif; padding: 40px; text-align: center;\">\
                <h1 style=\"color: #293D9B;\">Noble Clarity Engine API is Running</h1>\
                <p>Status: <span style=\"color: #10B981; font-weight: bold;\">Active</span></p>\
             </div>",
        )
        .into_response());
    }

    Ok(Json(json!({
        "status": "active",
        "message": "Noble Clarity Engine API is Running",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "features": server.features,
        "active_sessions": server.coordinator.active_sessions(),
    }))
    .into_response())
}

// ---------------------------------------------------------------------------
// AI proxies
// ---------------------------------------------------------------------------

fn required_str(body: Option<&Value>, field: &str) -> EngineResult<String> {
    body.and_then(|b| b.get(field))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| EngineError::ClientInput(format!("{field} is required")))
}

fn optional_str(body: Option<&Value>, field: &str) -> Option<String> {
    body.and_then(|b| b.get(field))
        .and_then(Value::as_str)
        .map(str::to_string)
}

async fn handle_generate(
    server: &EngineServer,
    provider_name: &str,
    actor: &str,
    body: Option<Value>,
) -> EngineResult<Response> {
    let prompt = required_str(body.as_ref(), "prompt")?;
    let system = optional_str(body.as_ref(), "systemInstruction")
        .or_else(|| optional_str(body.as_ref(), "system_instruction"));
    let api_key = optional_str(body.as_ref(), "apiKey");

    let provider = server
        .provider_for_name(provider_name)
        .ok_or_else(|| EngineError::Configuration(format!("unknown provider {provider_name}")))?;

    let mut request = GenerationRequest::new(prompt).with_api_key(api_key);
    if let Some(system) = system {
        request = request.with_system(system);
    }

    let content = provider.generate(&request).await?;

    server.audit.record(
        "ai.generate",
        actor,
        json!({ "provider": provider_name, "model": provider.default_model() }),
    );

    Ok(Json(json!({ "content": content })).into_response())
}

async fn handle_tts(
    server: &EngineServer,
    actor: &str,
    body: Option<Value>,
) -> EngineResult<Response> {
    if !server.features.tts_enabled {
        return Err(EngineError::NotFound("tts".into()));
    }

    let text = required_str(body.as_ref(), "text")?;
    let api_key = optional_str(body.as_ref(), "apiKey");

    let audio = server.speech.synthesize(&text, api_key.as_deref()).await?;

    server
        .audit
        .record("tts.generate", actor, json!({ "chars": text.len() }));

    Ok(Json(json!({ "audio": audio })).into_response())
}

// ---------------------------------------------------------------------------
// Goals
// ---------------------------------------------------------------------------

/// Mutate/delete target: the last path segment when it isn't the route token
/// itself (`/api/goals/1724` → `1724`).
fn trailing_id(path: &str, token: &str) -> Option<String> {
    let last = path.split('/').filter(|s| !s.is_empty()).next_back()?;
    if last == token || last == "api" {
        None
    } else {
        Some(last.to_string())
    }
}

fn body_object(body: Option<Value>) -> EngineResult<Map<String, Value>> {
    match body {
        Some(Value::Object(map)) if !map.is_empty() => Ok(map),
        _ => Err(EngineError::ClientInput("a JSON object body is required".into())),
    }
}

async fn handle_goals(
    server: &EngineServer,
    method: &Method,
    path: &str,
    actor: &str,
    body: Option<Value>,
) -> EngineResult<Response> {
    match *method {
        Method::GET => {
            let goals = server.store.get::<GoalsDomain>(actor).await?;
            Ok(Json(goals).into_response())
        }
        Method::POST => {
            let mut fields = body_object(body)?;
            fields.remove("id"); // ids are store-assigned
            fields.remove("user_id");
            fields.remove("userId");

            let mut created_id = String::new();
            let goals = server
                .store
                .upsert::<GoalsDomain, _>(actor, |goals| {
                    created_id = next_goal_id(goals);
                    goals.push(Goal::new(created_id.clone(), fields));
                    Ok(())
                })
                .await?;

            server
                .audit
                .record("goals.create", actor, json!({ "id": created_id }));

            let created = goals
                .into_iter()
                .find(|g| g.id == created_id)
                .ok_or_else(|| EngineError::NotFound("goal".into()))?;
            Ok((StatusCode::CREATED, Json(created)).into_response())
        }
        Method::PATCH | Method::PUT => {
            let id = trailing_id(path, "goals")
                .ok_or_else(|| EngineError::ClientInput("goal id is required".into()))?;
            let patch = body_object(body)?;

            let goals = server
                .store
                .upsert::<GoalsDomain, _>(actor, |goals| {
                    // A user with no records and a missing id are the same
                    // not-found condition.
                    let goal = goals
                        .iter_mut()
                        .find(|g| g.id == id)
                        .ok_or_else(|| EngineError::NotFound("goal".into()))?;
                    goal.apply_patch(&patch);
                    Ok(())
                })
                .await?;

            server.audit.record("goals.update", actor, json!({ "id": id }));

            let updated = goals
                .into_iter()
                .find(|g| g.id == id)
                .ok_or_else(|| EngineError::NotFound("goal".into()))?;
            Ok(Json(updated).into_response())
        }
        Method::DELETE => {
            let id = trailing_id(path, "goals")
                .ok_or_else(|| EngineError::ClientInput("goal id is required".into()))?;

            server
                .store
                .upsert::<GoalsDomain, _>(actor, |goals| {
                    let before = goals.len();
                    goals.retain(|g| g.id != id);
                    if goals.len() == before {
                        return Err(EngineError::NotFound("goal".into()));
                    }
                    Ok(())
                })
                .await?;

            server.audit.record("goals.delete", actor, json!({ "id": id }));
            Ok(Json(json!({ "deleted": id })).into_response())
        }
        _ => Err(EngineError::MethodNotAllowed {
            method: method.to_string(),
            route: "goals".into(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

async fn handle_profile(
    server: &EngineServer,
    method: &Method,
    actor: &str,
    body: Option<Value>,
) -> EngineResult<Response> {
    match *method {
        Method::GET => {
            // First read creates the record with defaults.
            let profile = server
                .store
                .upsert::<ProfileDomain, _>(actor, |_| Ok(()))
                .await?;
            Ok(Json(profile).into_response())
        }
        Method::POST | Method::PATCH | Method::PUT => {
            let mut patch = body_object(body)?;
            patch.remove("user_id");
            patch.remove("userId");

            let profile = server
                .store
                .upsert::<ProfileDomain, _>(actor, |profile| {
                    profile.merge(&patch);
                    Ok(())
                })
                .await?;

            server.audit.record(
                "profile.merge",
                actor,
                json!({ "keys": patch.keys().cloned().collect::<Vec<_>>() }),
            );
            Ok(Json(profile).into_response())
        }
        _ => Err(EngineError::MethodNotAllowed {
            method: method.to_string(),
            route: "profile".into(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

async fn handle_devices(
    server: &EngineServer,
    actor: &str,
    body: Option<Value>,
) -> EngineResult<Response> {
    let token = required_str(body.as_ref(), "token")?;
    let platform =
        optional_str(body.as_ref(), "platform").unwrap_or_else(|| "unknown".to_string());

    let mut already_registered = false;
    let devices = server
        .store
        .upsert::<DevicesDomain, _>(actor, |devices| {
            if devices.iter().any(|d| d.token == token) {
                already_registered = true;
            } else {
                devices.push(DeviceRegistration::new(token.clone(), platform));
            }
            Ok(())
        })
        .await?;

    if !already_registered {
        server
            .audit
            .record("devices.register", actor, json!({ "token": token }));
    }

    let registration = devices
        .into_iter()
        .find(|d| d.token == token)
        .ok_or_else(|| EngineError::NotFound("device".into()))?;
    Ok(Json(registration).into_response())
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

async fn handle_welcome_email(
    server: &EngineServer,
    actor: &str,
    body: Option<Value>,
) -> EngineResult<Response> {
    // Single `email` or a `recipients` list; the blast fans out one send per
    // address.
    let mut recipients: Vec<String> = Vec::new();
    if let Some(email) = optional_str(body.as_ref(), "email") {
        recipients.push(email);
    }
    if let Some(list) = body.as_ref().and_then(|b| b.get("recipients")).and_then(Value::as_array) {
        recipients.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
    }
    if recipients.is_empty() {
        return Err(EngineError::ClientInput("email is required".into()));
    }

    for recipient in &recipients {
        server
            .mailer
            .send(recipient, WELCOME_SUBJECT, &welcome_body())
            .await?;
    }

    server.audit.record(
        "email.welcome",
        actor,
        json!({ "recipients": recipients.len() }),
    );

    Ok(Json(json!({
        "message": "Welcome email sent successfully",
        "sent": recipients.len(),
    }))
    .into_response())
}

async fn handle_passthrough(
    server: &EngineServer,
    client: &super::PassThroughClient,
    actor: &str,
    body: Option<Value>,
) -> EngineResult<Response> {
    let payload = body.unwrap_or_else(|| json!({}));
    let response = client.forward(&payload).await?;
    server.audit.record("passthrough.forward", actor, json!({}));
    Ok(Json(response).into_response())
}

fn handle_callback(
    server: &EngineServer,
    actor: &str,
    body: Option<Value>,
) -> EngineResult<Response> {
    // OAuth/integration callbacks are external collaborators; the engine
    // acknowledges receipt and records the event.
    server.audit.record(
        "callback.received",
        actor,
        body.unwrap_or_else(|| json!({})),
    );
    Ok(Json(json!({ "status": "received" })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_identity_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-actor-id", "u-header".parse().unwrap());
        let body = json!({ "user_id": "u-body" });
        assert_eq!(actor_identity(&headers, Some(&body)), "u-header");
    }

    #[test]
    fn test_actor_identity_body_fallback() {
        let headers = HeaderMap::new();
        let snake = json!({ "user_id": "u1" });
        let camel = json!({ "userId": "u2" });
        assert_eq!(actor_identity(&headers, Some(&snake)), "u1");
        assert_eq!(actor_identity(&headers, Some(&camel)), "u2");
    }

    #[test]
    fn test_actor_identity_defaults_to_guest() {
        assert_eq!(actor_identity(&HeaderMap::new(), None), GUEST_ACTOR);
        let empty = json!({});
        assert_eq!(actor_identity(&HeaderMap::new(), Some(&empty)), GUEST_ACTOR);
    }

    #[test]
    fn test_trailing_id() {
        assert_eq!(trailing_id("/api/goals/1724", "goals").as_deref(), Some("1724"));
        assert_eq!(trailing_id("/goals/1724", "goals").as_deref(), Some("1724"));
        assert_eq!(trailing_id("/goals", "goals"), None);
        assert_eq!(trailing_id("/api/goals", "goals"), None);
    }

    #[test]
    fn test_required_str() {
        let body = json!({ "prompt": "hello", "empty": "" });
        assert_eq!(required_str(Some(&body), "prompt").unwrap(), "hello");
        assert!(required_str(Some(&body), "empty").is_err());
        assert!(required_str(Some(&body), "missing").is_err());
        assert!(required_str(None, "prompt").is_err());
    }
}
