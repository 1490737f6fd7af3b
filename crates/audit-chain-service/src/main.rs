use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use audit_chain_domain::{
    verify_chain, AuditChain, ChainError, ChainLink, ChainOutcome, Handshake, RunId,
    VerificationReport,
};
use audit_chain_ledger::{AuditLedger, RecordReceipt, RecordRequest};
use audit_chain_store::{ChainStore, RunSummary};
use audit_chain_store_sqlite::{SqliteChainStore, CHAIN_SCHEMA_VERSION};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_CONTRACT_VERSION: &str = "audit-chain.v1";

type SqliteLedger = AuditLedger<SqliteChainStore>;

#[derive(Debug, Clone)]
struct ServiceState {
    db_path: PathBuf,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    current_schema_version: Option<i64>,
    target_schema_version: i64,
}

/// Full view of one run as returned by `GET /v1/chain/:run_id`.
#[derive(Debug, Clone, Serialize)]
struct ChainView {
    run_id: RunId,
    handshakes: Vec<Handshake>,
    links: Vec<ChainLink>,
    outcome: ChainOutcome,
    total_cost_usd: f64,
    total_duration_ms: u64,
    verification: VerificationReport,
}

impl ChainView {
    fn from_chain(chain: &AuditChain) -> Self {
        let verification = verify_chain(chain);
        Self {
            run_id: chain.run_id().clone(),
            handshakes: chain.ordered_handshakes().into_iter().cloned().collect(),
            outcome: chain.outcome(),
            total_cost_usd: chain.total_cost_usd(),
            total_duration_ms: chain.total_duration_ms(),
            links: chain.links().to_vec(),
            verification,
        }
    }
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    append_rejected_total: AtomicU64,
    not_found_total: AtomicU64,
    store_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    append_rejected_total: u64,
    not_found_total: u64,
    store_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "audit-chain-service")]
#[command(about = "HTTP service for recording and verifying decision audit chains")]
struct Args {
    #[arg(long, env = "ACHAIN_DB", default_value = "./audit_chain.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "ACHAIN_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "ACHAIN_OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    operation_timeout_ms: u64,
    /// Used when `RUST_LOG` is not set.
    #[arg(long, env = "ACHAIN_LOG_LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long, env = "ACHAIN_LOG_JSON")]
    log_json: bool,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message.clone(),
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json(rejection: &JsonRejection) -> ServiceFailure {
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::invalid_json(rejection)
    }

    /// Chain errors keep their taxonomy code; anything else came from storage.
    fn classify_ledger_error(err: &anyhow::Error) -> ServiceFailure {
        let Some(chain_err) = err.downcast_ref::<ChainError>() else {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                format!("{err:#}"),
                None,
            );
        };

        let status = match chain_err {
            ChainError::NotFound(_) => StatusCode::NOT_FOUND,
            ChainError::ChainIntegrity { .. } => StatusCode::CONFLICT,
            _ => StatusCode::BAD_REQUEST,
        };
        let details = match chain_err {
            ChainError::OutOfOrderAppend {
                expected_parent,
                actual_parent,
                ..
            } => Some(json!({
                "expected_parent": expected_parent,
                "actual_parent": actual_parent,
            })),
            ChainError::RunTerminated { sequence_index, .. } => {
                Some(json!({ "terminal_sequence_index": sequence_index }))
            }
            ChainError::OrphanHandshake {
                parent_decision_hash,
                ..
            } => Some(json!({ "parent_decision_hash": parent_decision_hash })),
            ChainError::ChainIntegrity {
                first_break_index,
                reasons,
                ..
            } => Some(json!({
                "first_break_index": first_break_index,
                "reasons": reasons,
            })),
            _ => None,
        };
        Self::failure(status, chain_err.code(), chain_err.to_string(), details)
    }

    /// Run `op` against a freshly opened ledger on the blocking pool, bounded
    /// by the operation timeout. Timeouts map to `default_status`/`default_code`.
    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteLedger) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let db_path = self.db_path.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let ledger = open_ledger(&db_path)?;
            op(&ledger)
        });
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure(default_code, true);
                warn!(operation = operation_label, "operation timed out");
                Self::failure(
                    default_status,
                    default_code,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_ledger_error(&err);
                warn!(
                    operation = operation_label,
                    code = failure.code,
                    error = %failure.message,
                    "operation failed"
                );
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "invalid_json" => &self.invalid_json_total,
            "validation_error" | "encoding_error" => &self.validation_error_total,
            "orphan_handshake" | "run_mismatch" | "out_of_order_append" | "run_terminated" => {
                &self.append_rejected_total
            }
            "not_found" => &self.not_found_total,
            "store_unavailable" => &self.store_unavailable_total,
            "internal_error" => &self.internal_error_total,
            _ => &self.other_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            append_rejected_total: self.append_rejected_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            store_unavailable_total: self.store_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn open_ledger(db_path: &std::path::Path) -> Result<SqliteLedger> {
    let store = SqliteChainStore::open(db_path)?;
    Ok(AuditLedger::new(store))
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route("/v1/handshake", post(handshake_record))
        .route("/v1/chain/:run_id", get(chain_show))
        .route("/v1/chain/:run_id/verify", get(chain_verify))
        .route("/v1/decisions/:decision_hash", get(decision_show))
        .route("/v1/runs", get(runs_list))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn init_tracing(log_level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| log_level.into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_json);

    let store = SqliteChainStore::open(&args.db)?;
    store
        .migrate()
        .with_context(|| format!("failed to migrate {}", args.db.display()))?;
    drop(store);

    let state = ServiceState {
        db_path: args.db.clone(),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, db = %args.db.display(), "audit chain service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ReadinessResponse>>, ServiceFailure> {
    let current = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "store_unavailable",
            "schema_version",
            |ledger| ledger.store().schema_version(),
        )
        .await?;

    if current == Some(CHAIN_SCHEMA_VERSION) {
        return Ok(Json(envelope(ReadinessResponse {
            status: "ready",
            current_schema_version: current,
            target_schema_version: CHAIN_SCHEMA_VERSION,
        })));
    }

    state.telemetry.record_failure("store_unavailable", false);
    Err(ServiceState::failure(
        StatusCode::SERVICE_UNAVAILABLE,
        "store_unavailable",
        "chain schema is not migrated",
        Some(json!({
            "current_schema_version": current,
            "target_schema_version": CHAIN_SCHEMA_VERSION,
        })),
    ))
}

async fn handshake_record(
    State(state): State<ServiceState>,
    payload: Result<Json<RecordRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<RecordReceipt>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let receipt = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "store_unavailable",
            "record_handshake",
            move |ledger| ledger.record(request),
        )
        .await?;
    Ok(Json(envelope(receipt)))
}

async fn chain_show(
    State(state): State<ServiceState>,
    Path(run_id): Path<String>,
) -> Result<Json<ServiceEnvelope<ChainView>>, ServiceFailure> {
    let view = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "store_unavailable",
            "chain_show",
            move |ledger| {
                let run_id = RunId::parse(run_id)?;
                Ok(ChainView::from_chain(&ledger.chain(&run_id)?))
            },
        )
        .await?;
    Ok(Json(envelope(view)))
}

async fn chain_verify(
    State(state): State<ServiceState>,
    Path(run_id): Path<String>,
) -> Result<Json<ServiceEnvelope<VerificationReport>>, ServiceFailure> {
    let report = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "store_unavailable",
            "chain_verify",
            move |ledger| ledger.verify(&RunId::parse(run_id)?),
        )
        .await?;
    Ok(Json(envelope(report)))
}

async fn decision_show(
    State(state): State<ServiceState>,
    Path(decision_hash): Path<String>,
) -> Result<Json<ServiceEnvelope<ChainLink>>, ServiceFailure> {
    let link = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "store_unavailable",
            "decision_show",
            move |ledger| ledger.find_decision(&decision_hash),
        )
        .await?;
    Ok(Json(envelope(link)))
}

async fn runs_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<RunSummary>>>, ServiceFailure> {
    let runs = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "store_unavailable",
            "runs_list",
            |ledger| ledger.runs(),
        )
        .await?;
    Ok(Json(envelope(runs)))
}
