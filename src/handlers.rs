use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse, Result};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Offset, Utc};
use futures::TryStreamExt;
use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::attachments::{prepare_attachments, MAX_IMAGES_PER_NOTE};
use crate::calendar::{month_grid, MonthCursor};
use crate::compression::{ImageBytes, ImageCompressor};
use crate::config::Config;
use crate::contract::{ContractClient, SimulatedClient};
use crate::errors::{EveryFirstError, StoreError, WalletError};
use crate::eth::{self, HttpTransport};
use crate::notes::{FileStore, KeyValueStore, NewNote, NoteStore};
use crate::pin::{PinRegistry, PinRequest};
use crate::wallet::WalletConnector;

/// Shared state behind every route.
pub struct AppState {
    pub config: Config,
    pub compressor: Arc<ImageCompressor>,
    pub notes: Mutex<NoteStore>,
    pub pins: PinRegistry,
    /// Present only when an RPC endpoint is configured.
    pub wallet: Option<WalletConnector>,
    simulated: Arc<SimulatedClient>,
    tz: FixedOffset,
}

impl AppState {
    pub fn new(config: Config, store: Box<dyn KeyValueStore>) -> Self {
        let compressor = Arc::new(ImageCompressor::new(config.compression_options()));
        let tz = config.chain.utc_offset().unwrap_or(Utc.fix());

        Self {
            compressor,
            notes: Mutex::new(NoteStore::open(store)),
            pins: PinRegistry::new(),
            wallet: None,
            simulated: Arc::new(SimulatedClient::new()),
            tz,
            config,
        }
    }

    /// File-backed notes plus, when `chain.rpc_url` is set, a wallet on that endpoint.
    pub fn from_config(config: Config) -> Result<Self, EveryFirstError> {
        let store = FileStore::new(&config.storage.data_dir)?;
        let wallet = config.chain.rpc_url.as_deref().map(|url| {
            info!("Using JSON-RPC endpoint {}", url);
            WalletConnector::new(
                Arc::new(HttpTransport::new(url)),
                config.chain.contract_address.clone(),
                config.chain.receipt_polling(),
            )
        });

        Ok(Self::new(config, Box::new(store)).with_wallet(wallet))
    }

    pub fn with_wallet(mut self, wallet: Option<WalletConnector>) -> Self {
        self.wallet = wallet;
        self
    }

    fn notes(&self) -> Result<MutexGuard<'_, NoteStore>, EveryFirstError> {
        self.notes
            .lock()
            .map_err(|_| EveryFirstError::IoError(std::io::Error::other("note store lock poisoned")))
    }

    fn wallet(&self) -> Result<&WalletConnector, EveryFirstError> {
        self.wallet.as_ref().ok_or(EveryFirstError::Wallet(WalletError::NoProvider))
    }

    /// Client used for minting: the wallet session's, or the simulated one without a wallet.
    async fn contract_client(&self) -> Result<Arc<dyn ContractClient>, EveryFirstError> {
        match &self.wallet {
            Some(wallet) => Ok(wallet.client_or_connect().await?),
            None => {
                let client: Arc<dyn ContractClient> = self.simulated.clone();
                Ok(client)
            }
        }
    }
}

/// Registers every API route; shared by the binary and the integration tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/info", web::get().to(info_endpoint))
        .service(
            web::scope("/api")
                .route("/notes", web::get().to(list_notes))
                .route("/notes", web::post().to(create_note))
                .route("/notes/{id}/pin", web::post().to(pin_note))
                .route("/notes/{id}/mint", web::post().to(mint_note))
                .route("/calendar", web::get().to(calendar))
                .route("/images/compress", web::post().to(compress_images))
                .route("/wallet", web::get().to(wallet_state))
                .route("/wallet/connect", web::post().to(wallet_connect))
                .route("/wallet/switch", web::post().to(wallet_switch))
                .route("/wallet/disconnect", web::post().to(wallet_disconnect)),
        );
}

pub struct FileUpload {
    pub data: Vec<u8>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

impl FileUpload {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            filename: None,
            content_type: None,
        }
    }
}

impl Default for FileUpload {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressQuery {
    pub max_bytes: Option<usize>,
}

/// Compresses up to three `file` fields. Files that fail to compress come
/// back as data URLs of their original bytes.
pub async fn compress_images(
    mut payload: Multipart,
    query: web::Query<CompressQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let max_upload = state.config.max_upload_bytes();
    let mut uploads: Vec<FileUpload> = Vec::new();
    let mut max_bytes = query.max_bytes;

    while let Some(field) = payload.try_next().await? {
        let field_name = field.name().to_string();

        match field_name.as_str() {
            "file" => {
                let upload = process_file_field(field, max_upload).await?;
                if uploads.len() < MAX_IMAGES_PER_NOTE {
                    uploads.push(upload);
                } else {
                    debug!("Ignoring extra upload {:?}", upload.filename);
                }
            }
            "maxBytes" => {
                let value = process_text_field(field).await?;
                let parsed = value.trim().parse::<usize>().map_err(|_| {
                    EveryFirstError::InvalidParameters(format!("maxBytes must be a byte count, got '{}'", value))
                })?;
                max_bytes = max_bytes.or(Some(parsed));
            }
            _ => {
                process_text_field(field).await?;
            }
        }
    }

    if uploads.is_empty() {
        return Err(EveryFirstError::InvalidParameters("No file provided in 'file' field".to_string()).into());
    }

    let max_bytes = max_bytes
        .filter(|b| *b > 0)
        .unwrap_or(state.config.compression.max_image_bytes);

    info!(
        "Compressing {} upload(s) to at most {} bytes each",
        uploads.len(),
        max_bytes
    );

    let files = uploads
        .into_iter()
        .map(|u| ImageBytes::with_content_type(u.data, u.content_type.as_deref()))
        .collect();
    let prepared = prepare_attachments(Arc::clone(&state.compressor), files, max_bytes).await;

    if state.config.logging.log_compression_stats {
        for (i, image) in prepared.iter().enumerate() {
            info!(
                "Upload {}: {} char data URL (compressed: {})",
                i,
                image.data_url.len(),
                image.compressed
            );
        }
    }

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "images": prepared.iter().map(|p| p.data_url.as_str()).collect::<Vec<_>>(),
        "compressed": prepared.iter().map(|p| p.compressed).collect::<Vec<_>>(),
        "maxBytes": max_bytes,
    })))
}

async fn process_file_field(mut field: Field, max_size_bytes: usize) -> Result<FileUpload> {
    let mut upload = FileUpload::new();

    upload.filename = field
        .content_disposition()
        .get_filename()
        .map(|s| s.to_string());

    upload.content_type = field.content_type().map(|ct| ct.to_string());

    let mut data = Vec::new();
    let mut total_size = 0;

    while let Some(chunk) = field.try_next().await? {
        total_size += chunk.len();

        if total_size > max_size_bytes {
            return Err(EveryFirstError::FileTooLarge { max_size: max_size_bytes }.into());
        }

        data.extend_from_slice(&chunk);
    }

    upload.data = data;
    Ok(upload)
}

async fn process_text_field(mut field: Field) -> Result<String> {
    let mut data = Vec::new();

    while let Some(chunk) = field.try_next().await? {
        data.extend_from_slice(&chunk);

        if data.len() > 1024 {
            return Err(EveryFirstError::InvalidParameters("Text field too long".to_string()).into());
        }
    }

    String::from_utf8(data)
        .map_err(|_| EveryFirstError::InvalidParameters("Invalid UTF-8 in text field".to_string()).into())
}

#[derive(Debug, Deserialize)]
pub struct NotesQuery {
    pub date: Option<NaiveDate>,
}

pub async fn list_notes(
    query: web::Query<NotesQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let store = state.notes()?;
    let body = match query.date {
        Some(date) => serde_json::to_value(store.on_date(date, &state.tz)),
        None => serde_json::to_value(store.list()),
    }
    .map_err(StoreError::from)
    .map_err(EveryFirstError::from)?;

    Ok(HttpResponse::Ok().json(body))
}

pub async fn create_note(
    note: web::Json<NewNote>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let id = state
        .notes()?
        .add_note(note.into_inner())
        .map_err(EveryFirstError::from)?;

    Ok(HttpResponse::Created().json(serde_json::json!({ "id": id })))
}

/// Pins the posted note body. Stored notes also remember the result.
pub async fn pin_note(
    path: web::Path<String>,
    note: web::Json<PinRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let id = path.into_inner();
    let receipt = state.pins.pin(&id, note.into_inner())?;

    let mut store = state.notes()?;
    if store.get(&id).is_some() {
        store
            .record_pin(&id, &receipt.token_uri, &receipt.digest)
            .map_err(EveryFirstError::from)?;
    }

    Ok(HttpResponse::Ok().json(receipt))
}

#[derive(Debug, Deserialize)]
pub struct CalendarQuery {
    pub year: Option<i32>,
    pub month: Option<u32>,
}

pub async fn calendar(
    query: web::Query<CalendarQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let today = Utc::now().with_timezone(&state.tz).date_naive();
    let cursor = match (query.year, query.month) {
        (None, None) => MonthCursor::containing(today),
        (year, month) => MonthCursor::new(year.unwrap_or(today.year()), month.unwrap_or(today.month()))
            .ok_or_else(|| EveryFirstError::InvalidParameters("month must be between 1 and 12 in a supported year".to_string()))?,
    };

    let store = state.notes()?;
    let days = month_grid(cursor, store.list(), &state.tz).ok_or_else(|| {
        EveryFirstError::InvalidParameters(format!("{}-{:02} is out of range", cursor.year, cursor.month))
    })?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "year": cursor.year,
        "month": cursor.month,
        "days": days,
    })))
}

#[derive(Debug, Deserialize)]
pub struct MintRequest {
    pub to: String,
}

/// Milliseconds since the Unix epoch, the `date` argument of the mint call.
/// Dates before 1970 are sent as 0.
fn mint_timestamp(date: DateTime<Utc>) -> u64 {
    u64::try_from(date.timestamp_millis()).unwrap_or(0)
}

/// Pins a stored note and mints it to `to`, waiting for the receipt.
pub async fn mint_note(
    path: web::Path<String>,
    body: web::Json<MintRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let id = path.into_inner();
    eth::parse_address(&body.to).map_err(EveryFirstError::InvalidParameters)?;

    let note = state
        .notes()?
        .get(&id)
        .cloned()
        .ok_or_else(|| EveryFirstError::from(StoreError::NotFound(id.clone())))?;

    let receipt = state.pins.pin(&id, PinRequest::from(&note))?;
    state
        .notes()?
        .record_pin(&id, &receipt.token_uri, &receipt.digest)
        .map_err(EveryFirstError::from)?;

    let client = state.contract_client().await?;
    let date = mint_timestamp(note.date);

    let gas_estimate = match client
        .estimate_gas_mint(&body.to, &receipt.token_uri, &receipt.digest, date)
        .await
    {
        Ok(gas) => Some(gas),
        Err(e) => {
            debug!("Skipping gas estimate: {}", e);
            None
        }
    };

    let pending = client
        .mint_with_uri(&body.to, &receipt.token_uri, &receipt.digest, date)
        .await
        .map_err(EveryFirstError::from)?;
    info!("Mint of note {} submitted as {}", id, pending.hash);

    let mined = pending.wait().await.map_err(EveryFirstError::from)?;
    if mined.token_id.is_none() {
        warn!("Receipt {} carried no NoteMinted event", mined.transaction_hash);
    }

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "txHash": mined.transaction_hash,
        "status": mined.status,
        "tokenId": mined.token_id,
        "gasEstimate": gas_estimate,
        "tokenURI": receipt.token_uri,
        "digest": receipt.digest,
        "simulated": client.is_simulated(),
    })))
}

pub async fn wallet_state(state: web::Data<AppState>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.wallet()?.state()))
}

pub async fn wallet_connect(state: web::Data<AppState>) -> Result<HttpResponse> {
    let wallet = state.wallet()?;
    let address = wallet.connect().await.map_err(EveryFirstError::from)?;
    debug!("Connected wallet {}", address);
    Ok(HttpResponse::Ok().json(wallet.state()))
}

pub async fn wallet_switch(state: web::Data<AppState>) -> Result<HttpResponse> {
    let wallet = state.wallet()?;
    let address = wallet.switch_account().await.map_err(EveryFirstError::from)?;
    debug!("Wallet now on {}", address);
    Ok(HttpResponse::Ok().json(wallet.state()))
}

pub async fn wallet_disconnect(state: web::Data<AppState>) -> Result<HttpResponse> {
    let wallet = state.wallet()?;
    wallet.disconnect();
    Ok(HttpResponse::Ok().json(wallet.state()))
}

pub async fn health_check() -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": "everyfirst",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

pub async fn info_endpoint(state: web::Data<AppState>) -> Result<HttpResponse> {
    let config = &state.config;
    let options = state.compressor.options();

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "service": "EveryFirst",
        "version": env!("CARGO_PKG_VERSION"),
        "config": {
            "max_upload_mb": config.server.max_upload_mb,
            "max_image_bytes": config.compression.max_image_bytes,
            "max_dimension": options.max_dimension,
            "encoder": options.encoder,
            "max_attempts": options.max_attempts,
        },
        "minting": {
            "simulated": state.wallet.is_none() || config.chain.contract_address.is_none(),
            "contract_address": config.chain.contract_address,
        },
        "usage": {
            "compress": {
                "endpoint": "/api/images/compress",
                "method": "POST",
                "content_type": "multipart/form-data",
                "parameters": {
                    "file": format!("Image to compress, up to {} fields", MAX_IMAGES_PER_NOTE),
                    "maxBytes": format!("Byte budget per image (optional, default: {})", config.compression.max_image_bytes)
                }
            },
            "notes": "/api/notes",
            "calendar": "/api/calendar?year=&month=",
            "pin": "/api/notes/{id}/pin",
            "mint": "/api/notes/{id}/mint"
        }
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    #[test]
    fn test_mint_timestamp_is_epoch_millis() {
        let date = Utc.with_ymd_and_hms(2025, 3, 9, 0, 0, 0).unwrap();
        assert_eq!(mint_timestamp(date), 1_741_478_400_000);

        let with_time = Utc.with_ymd_and_hms(2025, 1, 1, 12, 30, 15).unwrap();
        assert_eq!(mint_timestamp(with_time), 1_735_734_615_000);

        let before_epoch = Utc.with_ymd_and_hms(1969, 12, 31, 0, 0, 0).unwrap();
        assert_eq!(mint_timestamp(before_epoch), 0);
    }
}
