//! Axum JSON API over one in-memory analysis run, for the dashboard collaborator.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;
use ymw_core::{Granularity, PeriodScope};
use ymw_sync::{AnalysisSnapshot, AuditReport, DiscrepancyRow, PipelineFunnel, DEFAULT_TOP_N};

pub const CRATE_NAME: &str = "ymw-web";

/// Upper bound on `limit` for list endpoints.
pub const MAX_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub snapshot: Arc<AnalysisSnapshot>,
}

impl AppState {
    pub fn new(snapshot: AnalysisSnapshot) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ScopeQuery {
    scope: Option<String>,
    limit: Option<usize>,
}

impl ScopeQuery {
    fn scope(&self) -> Result<PeriodScope, Response> {
        match self.scope.as_deref() {
            None | Some("") => Ok(PeriodScope::Overall),
            Some(text) => text.parse().map_err(|err| bad_request(&err)),
        }
    }

    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_TOP_N).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Deserialize, Default)]
struct DiagnosticsQuery {
    granularity: Option<String>,
}

#[derive(Debug, Serialize)]
struct ScopesResponse {
    overall: PeriodScope,
    months: Vec<PeriodScope>,
    weeks: Vec<PeriodScope>,
}

#[derive(Debug, Serialize)]
struct DiagnosticsResponse<'a> {
    #[serde(flatten)]
    audit: &'a AuditReport,
    discrepancies: Vec<DiscrepancyRow>,
    funnel: PipelineFunnel,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/run", get(run_handler))
        .route("/api/scopes", get(scopes_handler))
        .route("/api/rankings", get(rankings_handler))
        .route("/api/summary", get(summary_handler))
        .route("/api/diagnostics", get(diagnostics_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(snapshot: AnalysisSnapshot, port: u16) -> anyhow::Result<()> {
    let run_id = snapshot.run_id;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(%run_id, port, "serving analysis API");
    axum::serve(listener, app(AppState::new(snapshot))).await?;
    Ok(())
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "run_id": state.snapshot.run_id,
    }))
    .into_response()
}

async fn run_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.snapshot.as_ref()).into_response()
}

async fn scopes_handler(State(state): State<Arc<AppState>>) -> Response {
    let scopes = state.snapshot.available_scopes();
    Json(ScopesResponse {
        overall: PeriodScope::Overall,
        months: scopes.months.into_iter().map(PeriodScope::Period).collect(),
        weeks: scopes.weeks.into_iter().map(PeriodScope::Period).collect(),
    })
    .into_response()
}

async fn rankings_handler(State(state): State<Arc<AppState>>, Query(query): Query<ScopeQuery>) -> Response {
    match query.scope() {
        Ok(scope) => Json(state.snapshot.rankings(scope).truncated(query.limit())).into_response(),
        Err(resp) => resp,
    }
}

async fn summary_handler(State(state): State<Arc<AppState>>, Query(query): Query<ScopeQuery>) -> Response {
    let scope = match query.scope() {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };
    match state.snapshot.summary(scope, query.limit()) {
        Some(summary) => Json(summary).into_response(),
        None => error_response(StatusCode::NOT_FOUND, &format!("no qualified listens in {scope}")),
    }
}

async fn diagnostics_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DiagnosticsQuery>,
) -> Response {
    let granularity = match query.granularity.as_deref() {
        None | Some("") => Granularity::Month,
        Some(text) => match text.parse::<Granularity>() {
            Ok(g) => g,
            Err(err) => return bad_request(&err),
        },
    };
    let snapshot = state.snapshot.as_ref();
    Json(DiagnosticsResponse {
        audit: snapshot.audit(granularity),
        discrepancies: snapshot.discrepancies(granularity),
        funnel: snapshot.funnel,
    })
    .into_response()
}

fn bad_request(err: &dyn std::fmt::Display) -> Response {
    error_response(StatusCode::BAD_REQUEST, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use std::path::Path;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;
    use uuid::Uuid;
    use ymw_catalog::InMemoryCatalog;
    use ymw_core::CatalogMetadata;
    use ymw_sync::{WrapConfig, WrapPipeline};

    async fn fixture_app() -> Router {
        let markup = std::fs::read_to_string(
            Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/watch-history-sample.html"),
        )
        .unwrap();
        let catalog = Arc::new(InMemoryCatalog::new([
            CatalogMetadata {
                item_id: "aaaaaaaaaa1".into(),
                title: "Midnight City".into(),
                artist_channel: "M83 - Topic".into(),
                raw_duration_seconds: 243,
            },
            CatalogMetadata {
                item_id: "ccccccccc3".into(),
                title: "Dreams".into(),
                artist_channel: "Fleetwood Mac".into(),
                raw_duration_seconds: 257,
            },
        ]));
        let pipeline = WrapPipeline::new(WrapConfig::default(), catalog, Uuid::new_v4()).unwrap();
        let snapshot = pipeline
            .analyze_markup(&markup, &CancellationToken::new())
            .await
            .unwrap();
        app(AppState::new(snapshot))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn handler_smoke_healthz() {
        let (status, body) = get_json(fixture_app().await, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn scopes_list_months_and_weeks_newest_first() {
        let (status, body) = get_json(fixture_app().await, "/api/scopes").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["overall"], "overall");
        assert_eq!(body["months"], serde_json::json!(["month:2023-10", "month:2023-09"]));
        assert_eq!(body["weeks"][0], "week:2023-W41");
    }

    #[tokio::test]
    async fn rankings_respect_scope_and_limit() {
        let app = fixture_app().await;
        let (status, body) = get_json(app.clone(), "/api/rankings?scope=overall&limit=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["songs"].as_array().unwrap().len(), 1);
        assert_eq!(body["songs"][0]["entity_key"], "aaaaaaaaaa1");
        assert_eq!(body["songs"][0]["play_count"], 3);

        let (_, september) = get_json(app.clone(), "/api/rankings?scope=month:2023-09").await;
        assert_eq!(september["scope"], "month:2023-09");
        assert_eq!(september["songs"][0]["play_count"], 2);

        let (status, body) = get_json(app, "/api/rankings?scope=year:2023").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("year:2023"));
    }

    #[tokio::test]
    async fn summary_reports_growth_or_not_found() {
        let app = fixture_app().await;
        let (status, body) = get_json(app.clone(), "/api/summary?scope=month:2023-10").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["listen_count"], 1);
        assert!(body["growth_text"].as_str().unwrap().ends_with("vs September"));

        let (status, _) = get_json(app, "/api/summary?scope=month:2022-01").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn diagnostics_expose_raw_counts_and_discrepancies() {
        let app = fixture_app().await;
        let (status, body) = get_json(app.clone(), "/api/diagnostics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["granularity"], "month");
        assert_eq!(body["unparsed_timestamps"], 1);
        assert_eq!(body["rows"][0], serde_json::json!({"period": "2023-09", "raw_entry_count": 3}));
        assert_eq!(body["discrepancies"][2]["aggregated_listens"], 0);
        assert_eq!(body["funnel"]["qualified_listens"], 4);

        let (status, weekly) = get_json(app.clone(), "/api/diagnostics?granularity=week").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(weekly["granularity"], "week");

        let (status, _) = get_json(app, "/api/diagnostics?granularity=daily").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
