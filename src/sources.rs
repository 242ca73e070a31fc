// External sources: spreadsheet rows and PDF extraction
//
// Both sit behind async traits so sync code and tests never talk to the
// network directly.

use crate::error::SourceError;
use crate::records::SheetRow;
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{multipart, Client, Response, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_SHEETS_API: &str = "https://sheets.googleapis.com";
const SHEETS_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets.readonly";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

// ============================================================================
// TRAITS
// ============================================================================

/// Row-oriented spreadsheet access
#[async_trait]
pub trait SheetSource: Send + Sync {
    /// All rows of an A1 range such as `Gastos!A:Z`, header included
    async fn read_range(&self, range: &str) -> Result<Vec<SheetRow>, SourceError>;
}

/// PDF statement → extraction service JSON
#[async_trait]
pub trait StatementExtractor: Send + Sync {
    /// Raw response bytes; they are hashed as-is
    async fn extract(&self, path: &Path) -> Result<Vec<u8>, SourceError>;
}

async fn ensure_success(service: &'static str, response: Response) -> Result<Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(SourceError::Status {
        service,
        status: status.as_u16(),
        body,
    })
}

// ============================================================================
// GOOGLE SHEETS
// ============================================================================

/// Service-account credentials
#[derive(Debug, Clone)]
pub struct ServiceAccount {
    pub client_email: String,
    /// PEM; literal `\n` sequences (as found in env files) are accepted
    pub private_key: String,
    pub private_key_id: Option<String>,
    pub token_uri: String,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

pub struct GoogleSheetsClient {
    client: Client,
    spreadsheet_id: String,
    account: ServiceAccount,
    api_base: String,
}

impl GoogleSheetsClient {
    pub fn new(spreadsheet_id: String, account: ServiceAccount) -> Self {
        Self {
            client: Client::new(),
            spreadsheet_id,
            account,
            api_base: GOOGLE_SHEETS_API.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn signed_assertion(&self) -> Result<String, SourceError> {
        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.account.client_email,
            scope: SHEETS_READONLY_SCOPE,
            aud: &self.account.token_uri,
            iat: now,
            exp: now + 3600,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.account.private_key_id.clone();

        let pem = self.account.private_key.replace("\\n", "\n");
        let key = EncodingKey::from_rsa_pem(pem.as_bytes())?;
        Ok(encode(&header, &claims, &key)?)
    }

    async fn access_token(&self) -> Result<String, SourceError> {
        let assertion = self.signed_assertion()?;

        let response = self
            .client
            .post(&self.account.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;
        let token: TokenResponse = ensure_success("token endpoint", response).await?.json().await?;

        Ok(token.access_token)
    }

    /// `{base}/v4/spreadsheets/{id}/values/{range}`, segments percent-encoded
    pub fn values_url(&self, range: &str) -> Result<Url, SourceError> {
        let mut url = Url::parse(&self.api_base).map_err(|e| SourceError::Url(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| SourceError::Url(self.api_base.clone()))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", self.spreadsheet_id.as_str(), "values", range]);
        Ok(url)
    }
}

#[async_trait]
impl SheetSource for GoogleSheetsClient {
    async fn read_range(&self, range: &str) -> Result<Vec<SheetRow>, SourceError> {
        let token = self.access_token().await?;
        let url = self.values_url(range)?;
        debug!(%url, "reading spreadsheet range");

        let response = self.client.get(url).bearer_auth(token).send().await?;
        let body: ValueRange = ensure_success("sheets api", response).await?.json().await?;

        info!(range, rows = body.values.len(), "spreadsheet range read");
        Ok(body.values.into_iter().map(cells_to_row).collect())
    }
}

fn cells_to_row(cells: Vec<Value>) -> SheetRow {
    cells
        .into_iter()
        .map(|cell| match cell {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect()
}

// ============================================================================
// CSV EXPORTS
// ============================================================================

/// Reads `<dir>/<tab>.csv` for a range `<tab>!A:Z`; used offline and in tests
pub struct CsvSheetSource {
    dir: PathBuf,
}

impl CsvSheetSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, range: &str) -> PathBuf {
        let tab = range.split('!').next().unwrap_or(range);
        self.dir.join(format!("{}.csv", tab))
    }
}

#[async_trait]
impl SheetSource for CsvSheetSource {
    async fn read_range(&self, range: &str) -> Result<Vec<SheetRow>, SourceError> {
        let path = self.path_for(range);
        let bytes = tokio::fs::read(&path).await.map_err(|source| SourceError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes.as_slice());

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(String::from).collect());
        }

        debug!(path = %path.display(), rows = rows.len(), "csv sheet read");
        Ok(rows)
    }
}

// ============================================================================
// PDF EXTRACTION SERVICE
// ============================================================================

pub struct PdfExtractionClient {
    client: Client,
    endpoint: String,
}

impl PdfExtractionClient {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl StatementExtractor for PdfExtractionClient {
    async fn extract(&self, path: &Path) -> Result<Vec<u8>, SourceError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| SourceError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "statement.pdf".to_string());

        let part = multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/pdf")?;
        let form = multipart::Form::new().part("file", part);

        let response = self.client.post(&self.endpoint).multipart(form).send().await?;
        let body = ensure_success("pdf extraction", response).await?.bytes().await?;

        debug!(path = %path.display(), bytes = body.len(), "statement extracted");
        Ok(body.to_vec())
    }
}
