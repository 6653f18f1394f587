// Route dispatch.
//
// Every inbound request is matched against an ordered table of route tokens.
// A route matches when its token appears as a path segment, so `/goals`,
// `/api/goals` and `/api/goals/123` all hit the goals route. The first
// matching route wins; declaration order is the tiebreak, with diagnostic
// routes declared before any feature token.
//
// The table is validated at construction: a token that equals or contains
// another registered token would make the winner depend on declaration order
// alone, so it is rejected as a configuration error instead.

use axum::http::Method;

use crate::errors::{EngineError, EngineResult};

/// Feature handler a route resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Status,
    Gemini,
    OpenAi,
    Tts,
    Goals,
    Profile,
    Devices,
    WelcomeEmail,
    Analytics,
    Revenue,
    Callback,
    Stream,
}

/// One entry in the dispatch table.
#[derive(Debug, Clone)]
pub struct Route {
    pub token: &'static str,
    pub methods: &'static [Method],
    pub feature: Feature,
    /// Diagnostic routes bypass rate limiting.
    pub rate_limit_exempt: bool,
}

impl Route {
    const fn new(token: &'static str, methods: &'static [Method], feature: Feature) -> Self {
        Self {
            token,
            methods,
            feature,
            rate_limit_exempt: false,
        }
    }

    const fn exempt(token: &'static str, methods: &'static [Method], feature: Feature) -> Self {
        Self {
            token,
            methods,
            feature,
            rate_limit_exempt: true,
        }
    }
}

/// Outcome of matching one request against the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Matched {
        feature: Feature,
        rate_limit_exempt: bool,
    },
    MethodNotAllowed {
        token: String,
    },
    /// No route claims the path; falls through to the default 404 response.
    Unhandled,
}

pub struct DispatchTable {
    routes: Vec<Route>,
}

impl DispatchTable {
    /// Build a table, rejecting ambiguous token pairs.
    pub fn new(routes: Vec<Route>) -> EngineResult<Self> {
        for (i, a) in routes.iter().enumerate() {
            for b in routes.iter().skip(i + 1) {
                if a.token.contains(b.token) || b.token.contains(a.token) {
                    return Err(EngineError::Configuration(format!(
                        "route tokens '{}' and '{}' overlap; dispatch would depend on declaration order",
                        a.token, b.token
                    )));
                }
            }
        }
        Ok(Self { routes })
    }

    /// The table served by the engine. Diagnostics come first so that a
    /// feature token can never swallow a status path.
    pub fn standard() -> EngineResult<Self> {
        use Feature::*;
        const GET: &[Method] = &[Method::GET];
        const POST: &[Method] = &[Method::POST];
        const GET_POST: &[Method] = &[Method::GET, Method::POST];
        const GOAL_METHODS: &[Method] = &[
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::PUT,
            Method::DELETE,
        ];
        const PROFILE_METHODS: &[Method] =
            &[Method::GET, Method::POST, Method::PATCH, Method::PUT];

        Self::new(vec![
            Route::exempt("status", GET, Status),
            Route::exempt("health", GET, Status),
            Route::new("gemini", POST, Gemini),
            Route::new("openai", POST, OpenAi),
            Route::new("tts", POST, Tts),
            Route::new("goals", GOAL_METHODS, Goals),
            Route::new("profile", PROFILE_METHODS, Profile),
            Route::new("devices", POST, Devices),
            Route::new("welcome-email", POST, WelcomeEmail),
            Route::new("seo", POST, Analytics),
            Route::new("revenue", POST, Revenue),
            Route::new("callback", GET_POST, Callback),
            Route::new("stream", GET, Stream),
        ])
    }

    /// Select the handler for a path and method. Performs no I/O.
    pub fn dispatch(&self, path: &str, method: &Method) -> Dispatch {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        // Bare `/` and the `/api` prefix probe are liveness checks.
        if segments.is_empty() || segments == ["api"] {
            if method == Method::GET {
                return Dispatch::Matched {
                    feature: Feature::Status,
                    rate_limit_exempt: true,
                };
            }
            return Dispatch::MethodNotAllowed {
                token: "status".to_string(),
            };
        }

        for route in &self.routes {
            if segments.iter().any(|s| *s == route.token) {
                if route.methods.contains(method) {
                    tracing::debug!(token = route.token, %method, "dispatch matched");
                    return Dispatch::Matched {
                        feature: route.feature,
                        rate_limit_exempt: route.rate_limit_exempt,
                    };
                }
                return Dispatch::MethodNotAllowed {
                    token: route.token.to_string(),
                };
            }
        }

        Dispatch::Unhandled
    }
}
