// 🌐 HTTP API - axum router, handlers and shared state
//
// Handlers lock a connection, run a query module function and wrap the
// result in JSON. Errors become {"error": "..."} with 400 or 500.

use crate::cards::{
    filter_holders, installments_about_to_expire, load_statements, month_line_items,
    summarize_by_keyword, CardNetwork, KeywordMap, LogoMap,
};
use crate::config::{AppConfig, KeywordSettings, SheetRanges, SheetsConfig};
use crate::db::{lock, ApplyPolicy, Database};
use crate::error::{StoreError, SyncError};
use crate::normalize::{AmountFormatter, LocaleFormatter};
use crate::reconciliation::{MonthWindow, SyncMode, MAX_MONTHS_BACK};
use crate::records::RecordKind;
use crate::reports::{balance, expense_summary, list_expenses, list_incomes, parse_exclude};
use crate::sources::{CsvSheetSource, GoogleSheetsClient, PdfExtractionClient, SheetSource, StatementExtractor};
use crate::sync::{ingest_statements, sync_records, StatementSyncReport, SyncReport};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

pub const NO_HOLDERS_MESSAGE: &str = "No holders found for the specified filter";

// ============================================================================
// STATE
// ============================================================================

/// Non-secret settings the handlers need
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub ranges: SheetRanges,
    pub statement_dirs: Vec<(CardNetwork, PathBuf)>,
    pub keywords: KeywordSettings,
    pub apply_policy: ApplyPolicy,
}

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub sheets: Option<Arc<dyn SheetSource>>,
    pub extractor: Option<Arc<dyn StatementExtractor>>,
    pub formatter: Arc<dyn AmountFormatter>,
    pub settings: Arc<Settings>,
}

impl AppState {
    /// No external sources; amounts formatted as "$1.234,56"
    pub fn new(db: Database, settings: Settings) -> Self {
        Self {
            db,
            sheets: None,
            extractor: None,
            formatter: Arc::new(LocaleFormatter::spanish()),
            settings: Arc::new(settings),
        }
    }

    pub fn with_sheet_source(mut self, source: Arc<dyn SheetSource>) -> Self {
        self.sheets = Some(source);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn StatementExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn AmountFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    /// Wire the configured sources around an opened database
    pub fn from_config(config: &AppConfig, db: Database) -> Self {
        let mut state = Self::new(
            db,
            Settings {
                ranges: config.ranges.clone(),
                statement_dirs: config.statement_dirs.clone(),
                keywords: config.keywords.clone(),
                apply_policy: config.apply_policy,
            },
        );

        match &config.sheets {
            Some(SheetsConfig::Google {
                spreadsheet_id,
                account,
            }) => {
                state = state.with_sheet_source(Arc::new(GoogleSheetsClient::new(
                    spreadsheet_id.clone(),
                    account.clone(),
                )));
            }
            Some(SheetsConfig::Csv { dir }) => {
                state = state.with_sheet_source(Arc::new(CsvSheetSource::new(dir.clone())));
            }
            None => warn!("no spreadsheet source configured, record sync disabled"),
        }

        match &config.pdf_extraction_url {
            Some(url) => {
                state = state.with_extractor(Arc::new(PdfExtractionClient::new(url.clone())));
            }
            None => warn!("no PDF extraction service configured, statement sync disabled"),
        }

        state
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    /// Body text; storage and upstream details only go to the log
    fn public_message(&self) -> String {
        match self {
            ApiError::BadRequest(message) => message.clone(),
            ApiError::Store(_) | ApiError::Sync(SyncError::Store(_)) => "database error".to_string(),
            ApiError::Sync(SyncError::Source(_)) => "external source request failed".to_string(),
            ApiError::Sync(other) => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Sync(_) | ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            warn!(error = %self, "rejected request");
        }

        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// QUERY PARAMETERS
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct MonthQuery {
    pub year: Option<String>,
    pub month: Option<String>,
    pub exclude: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CardExpensesQuery {
    pub year: Option<String>,
    pub month: Option<String>,
    pub card_type: Option<String>,
    pub holder: Option<String>,
    pub months_back: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InstallmentsQuery {
    pub year: Option<String>,
    pub month: Option<String>,
    pub remaining: Option<String>,
}

/// Validate `year` and `month` into a window
pub fn month_window(year: Option<&str>, month: Option<&str>) -> ApiResult<MonthWindow> {
    let year: i32 = year
        .and_then(|y| y.trim().parse().ok())
        .ok_or_else(|| ApiError::BadRequest("Invalid year".to_string()))?;
    let month: u32 = month
        .and_then(|m| m.trim().parse().ok())
        .ok_or_else(|| ApiError::BadRequest("Invalid month".to_string()))?;

    MonthWindow::new(year, month).ok_or_else(|| ApiError::BadRequest("Invalid month".to_string()))
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /health
async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /expenses?year=&month=&exclude=[...]
async fn get_expenses(
    State(state): State<AppState>,
    Query(query): Query<MonthQuery>,
) -> ApiResult<impl IntoResponse> {
    let month = month_window(query.year.as_deref(), query.month.as_deref())?;
    let exclude = parse_exclude(query.exclude.as_deref());

    let conn = lock(state.db.transactions())?;
    let expenses = list_expenses(&conn, month, &exclude, state.formatter.as_ref())?;

    Ok(Json(json!({ "expenses": expenses })))
}

/// GET /expenses/summary?year=&month=&exclude=[...]
async fn get_expenses_summary(
    State(state): State<AppState>,
    Query(query): Query<MonthQuery>,
) -> ApiResult<impl IntoResponse> {
    let month = month_window(query.year.as_deref(), query.month.as_deref())?;
    let exclude = parse_exclude(query.exclude.as_deref());

    let conn = lock(state.db.transactions())?;
    let summary = expense_summary(&conn, month, &exclude, state.formatter.as_ref())?;

    Ok(Json(json!({ "summary": summary })))
}

/// GET /incomes?year=&month=
async fn get_incomes(
    State(state): State<AppState>,
    Query(query): Query<MonthQuery>,
) -> ApiResult<impl IntoResponse> {
    let month = month_window(query.year.as_deref(), query.month.as_deref())?;

    let conn = lock(state.db.transactions())?;
    Ok(Json(list_incomes(&conn, month, state.formatter.as_ref())?))
}

/// GET /balance
async fn get_balance(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let transactions = lock(state.db.transactions())?;
    let cards = lock(state.db.cards())?;

    Ok(Json(balance(
        &transactions,
        &cards,
        MonthWindow::current(),
        state.formatter.as_ref(),
    )?))
}

async fn run_sync(state: &AppState, kind: RecordKind, mode: SyncMode) -> ApiResult<Json<SyncReport>> {
    let source = state
        .sheets
        .as_deref()
        .ok_or(SyncError::NotConfigured("spreadsheet source"))?;
    let store = state.db.record_store(kind, state.settings.apply_policy);
    let range = state.settings.ranges.range_for(kind, &mode);

    Ok(Json(sync_records(source, &store, mode, range).await?))
}

/// GET /expenses/sync/month
async fn sync_expenses_month(State(state): State<AppState>) -> ApiResult<Json<SyncReport>> {
    run_sync(&state, RecordKind::Expense, SyncMode::Incremental(MonthWindow::current())).await
}

/// GET /expenses/sync/historical
async fn sync_expenses_historical(State(state): State<AppState>) -> ApiResult<Json<SyncReport>> {
    run_sync(&state, RecordKind::Expense, SyncMode::Historical).await
}

/// GET /incomes/sync/month
async fn sync_incomes_month(State(state): State<AppState>) -> ApiResult<Json<SyncReport>> {
    run_sync(&state, RecordKind::Income, SyncMode::Incremental(MonthWindow::current())).await
}

/// GET /incomes/sync/historical
async fn sync_incomes_historical(State(state): State<AppState>) -> ApiResult<Json<SyncReport>> {
    run_sync(&state, RecordKind::Income, SyncMode::Historical).await
}

/// GET /cards/expenses?year=&month=&card_type=&holder=&months_back=
async fn get_card_expenses(
    State(state): State<AppState>,
    Query(query): Query<CardExpensesQuery>,
) -> ApiResult<Response> {
    let month = month_window(query.year.as_deref(), query.month.as_deref())?;
    let months_back: u32 = query
        .months_back
        .as_deref()
        .and_then(|m| m.trim().parse().ok())
        .unwrap_or(0);
    if months_back > MAX_MONTHS_BACK {
        return Err(ApiError::BadRequest(format!(
            "months_back must be at most {}",
            MAX_MONTHS_BACK
        )));
    }
    let months = month.with_previous(months_back);

    let network = match query.card_type.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(t) if t.eq_ignore_ascii_case("all") => None,
        Some(t) => match t.parse::<CardNetwork>() {
            Ok(network) => Some(network),
            // Nothing is stored under an unknown network
            Err(_) => return Ok(Json(json!([])).into_response()),
        },
    };

    let mut statements = {
        let conn = lock(state.db.cards())?;
        load_statements(&conn, &months, network)?
    };

    if let Some(holder) = query.holder.as_deref().map(str::trim) {
        if !holder.is_empty()
            && !holder.eq_ignore_ascii_case("all")
            && !filter_holders(&mut statements, holder)
        {
            return Ok(Json(json!({ "result": NO_HOLDERS_MESSAGE })).into_response());
        }
    }

    Ok(Json(statements).into_response())
}

/// GET /cards/sync/resumes
async fn sync_statements(State(state): State<AppState>) -> ApiResult<Json<StatementSyncReport>> {
    let extractor = state
        .extractor
        .as_deref()
        .ok_or(SyncError::NotConfigured("pdf extraction service"))?;

    Ok(Json(
        ingest_statements(extractor, state.db.cards(), &state.settings.statement_dirs).await?,
    ))
}

fn keyword_summary(
    state: &AppState,
    query: &MonthQuery,
    keywords: &KeywordMap,
    logos: &LogoMap,
    empty_message: &str,
) -> ApiResult<Response> {
    let month = month_window(query.year.as_deref(), query.month.as_deref())?;
    if keywords.is_empty() {
        return Err(ApiError::BadRequest(empty_message.to_string()));
    }

    let conn = lock(state.db.cards())?;
    let items = month_line_items(&conn, month)?;

    Ok(Json(summarize_by_keyword(&items, keywords, logos, state.formatter.as_ref())).into_response())
}

/// GET /cards/subscriptions?year=&month=
async fn get_subscriptions(
    State(state): State<AppState>,
    Query(query): Query<MonthQuery>,
) -> ApiResult<Response> {
    let keywords = &state.settings.keywords;
    keyword_summary(
        &state,
        &query,
        &keywords.subscriptions,
        &keywords.subscription_logos,
        "subscription map is empty",
    )
}

/// GET /cards/specific-expenses?year=&month=
async fn get_specific_expenses(
    State(state): State<AppState>,
    Query(query): Query<MonthQuery>,
) -> ApiResult<Response> {
    let keywords = &state.settings.keywords;
    keyword_summary(
        &state,
        &query,
        &keywords.specific_expenses,
        &keywords.specific_logos,
        "specific expenses map is empty",
    )
}

/// GET /cards/installments?year=&month=&remaining=
async fn get_installments(
    State(state): State<AppState>,
    Query(query): Query<InstallmentsQuery>,
) -> ApiResult<impl IntoResponse> {
    let month = month_window(query.year.as_deref(), query.month.as_deref())?;
    let remaining: u32 = match query.remaining.as_deref().map(str::trim) {
        None | Some("") => 1,
        Some(raw) => raw
            .parse()
            .map_err(|_| ApiError::BadRequest("Invalid remaining".to_string()))?,
    };

    let conn = lock(state.db.cards())?;
    let items = month_line_items(&conn, month)?;

    Ok(Json(installments_about_to_expire(
        &items,
        remaining,
        state.formatter.as_ref(),
    )))
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/expenses", get(get_expenses))
        .route("/expenses/summary", get(get_expenses_summary))
        .route("/expenses/sync/month", get(sync_expenses_month))
        .route("/expenses/sync/historical", get(sync_expenses_historical))
        .route("/incomes", get(get_incomes))
        .route("/incomes/sync/month", get(sync_incomes_month))
        .route("/incomes/sync/historical", get(sync_incomes_historical))
        .route("/balance", get(get_balance))
        .route("/cards/expenses", get(get_card_expenses))
        .route("/cards/sync/resumes", get(sync_statements))
        .route("/cards/subscriptions", get(get_subscriptions))
        .route("/cards/specific-expenses", get(get_specific_expenses))
        .route("/cards/installments", get(get_installments))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
