use thiserror::Error;

/// Failures of a single compression call. Both are terminal for the call;
/// callers fall back to the original bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompressError {
    #[error("Image decoding error: {0}")]
    Decode(String),

    #[error("Compression failed: {0}")]
    CompressionFailure(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid note: {0}")]
    InvalidNote(String),

    #[error("Note not found: {0}")]
    NotFound(String),
}

/// JSON-RPC level failures shared by the wallet and contract clients.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("RPC error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("Malformed RPC response: {0}")]
    Malformed(String),
}

impl RpcError {
    /// EIP-1193 code for a request the user declined in the wallet.
    pub const USER_REJECTED: i64 = 4001;

    pub fn is_user_rejection(&self) -> bool {
        match self {
            RpcError::Remote { code, message } => {
                *code == Self::USER_REJECTED || message.to_lowercase().contains("user rejected")
            }
            _ => false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("No Ethereum provider configured")]
    NoProvider,

    #[error("Wallet returned no accounts")]
    NoAccounts,

    #[error("Connection request was rejected by the user")]
    Rejected,

    #[error("Wallet is not connected")]
    NotConnected,

    #[error("Unusable wallet account: {0}")]
    InvalidAccount(String),

    #[error(transparent)]
    Rpc(RpcError),
}

impl From<RpcError> for WalletError {
    fn from(err: RpcError) -> Self {
        if err.is_user_rejection() {
            WalletError::Rejected
        } else {
            WalletError::Rpc(err)
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("Address {0} does not hold MINTER_ROLE")]
    MissingMinterRole(String),

    #[error("Transaction was rejected by the user")]
    UserRejected,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Gas estimation is not available for simulated mints")]
    GasEstimateUnavailable,

    #[error("Transaction {0} reverted")]
    Reverted(String),

    #[error("Timed out waiting for receipt of {0}")]
    ReceiptTimeout(String),

    #[error("Mint failed: {0}")]
    Rpc(RpcError),
}

impl From<RpcError> for ContractError {
    fn from(err: RpcError) -> Self {
        if err.is_user_rejection() {
            ContractError::UserRejected
        } else {
            ContractError::Rpc(err)
        }
    }
}

#[derive(Error, Debug)]
pub enum EveryFirstError {
    #[error(transparent)]
    Compress(#[from] CompressError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error("invalid note")]
    InvalidNote,

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("File too large: maximum size is {max_size} bytes")]
    FileTooLarge { max_size: usize },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl EveryFirstError {
    fn kind(&self) -> &'static str {
        match self {
            EveryFirstError::InvalidNote | EveryFirstError::Store(StoreError::InvalidNote(_)) => {
                "invalid_note"
            }
            EveryFirstError::Store(StoreError::NotFound(_)) => "not_found",
            EveryFirstError::Compress(CompressError::Decode(_)) => "unsupported_format",
            EveryFirstError::InvalidParameters(_)
            | EveryFirstError::Contract(ContractError::InvalidArgument(_)) => "invalid_parameters",
            EveryFirstError::FileTooLarge { .. } => "file_too_large",
            EveryFirstError::Contract(ContractError::MissingMinterRole(_))
            | EveryFirstError::Contract(ContractError::UserRejected)
            | EveryFirstError::Wallet(WalletError::Rejected) => "mint_rejected",
            EveryFirstError::Wallet(_) | EveryFirstError::Contract(_) => "chain_error",
            _ => "internal_error",
        }
    }
}

impl actix_web::ResponseError for EveryFirstError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;

        match self.kind() {
            "invalid_note" | "invalid_parameters" => StatusCode::BAD_REQUEST,
            "not_found" => StatusCode::NOT_FOUND,
            "unsupported_format" => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "file_too_large" => StatusCode::PAYLOAD_TOO_LARGE,
            "mint_rejected" => StatusCode::FORBIDDEN,
            "chain_error" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> actix_web::HttpResponse {
        let mut builder = actix_web::HttpResponse::build(self.status_code());

        match self {
            // the pin endpoint has a fixed error body
            EveryFirstError::InvalidNote => builder.json(serde_json::json!({
                "error": "invalid note"
            })),
            EveryFirstError::FileTooLarge { max_size } => builder.json(serde_json::json!({
                "error": self.kind(),
                "message": self.to_string(),
                "max_size_bytes": max_size
            })),
            EveryFirstError::Store(StoreError::Io(_))
            | EveryFirstError::Store(StoreError::Serialize(_))
            | EveryFirstError::IoError(_) => builder.json(serde_json::json!({
                "error": self.kind(),
                "message": "An internal error occurred"
            })),
            _ => builder.json(serde_json::json!({
                "error": self.kind(),
                "message": self.to_string()
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::ResponseError;

    #[test]
    fn test_user_rejection_maps_to_dedicated_variants() {
        let rejected = RpcError::Remote {
            code: 4001,
            message: "User denied".to_string(),
        };
        assert_eq!(ContractError::from(rejected.clone()), ContractError::UserRejected);
        assert_eq!(WalletError::from(rejected), WalletError::Rejected);

        let other = RpcError::Remote {
            code: -32000,
            message: "execution reverted".to_string(),
        };
        assert!(matches!(ContractError::from(other), ContractError::Rpc(_)));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(EveryFirstError::InvalidNote.status_code(), 400);
        assert_eq!(
            EveryFirstError::Store(StoreError::NotFound("x".into())).status_code(),
            404
        );
        assert_eq!(
            EveryFirstError::FileTooLarge { max_size: 10 }.status_code(),
            413
        );
        assert_eq!(
            EveryFirstError::Contract(ContractError::UserRejected).status_code(),
            403
        );
    }
}
