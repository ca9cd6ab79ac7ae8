//! Client error taxonomy and the mapping from failures to user-facing notices.

use crate::{
    TARGET_CHAIN_ID,
    chain::TransportError,
    contract::ContractRevert,
    units::AmountError,
    wallet::WalletError,
};
use ethers::abi::{
    ParamType,
    Token,
    decode,
};
use thiserror::Error;

/// `Error(string)` selector used by `require`/`revert` with a message.
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

const EXECUTION_REVERTED_PREFIX: &str = "execution reverted: ";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("no wallet provider available: {detail}")]
    ProviderUnavailable { detail: String },
    #[error("Please switch your wallet to Ethereum mainnet (chain {TARGET_CHAIN_ID}); it is on chain {current}")]
    WrongNetwork { current: u64 },
    #[error("Request rejected in wallet")]
    UserRejected,
    #[error("Wallet returned no accounts")]
    NoAccounts,
    #[error("Contract not found at the configured address")]
    ContractNotDeployed,
    #[error("unexpected contract response: {0}")]
    Decode(String),
    #[error(transparent)]
    Transport(TransportError),
    #[error("Transaction reverted: {reason}")]
    ActionReverted { reason: String },
    #[error("Timed out waiting for transaction confirmation")]
    ActionTimeout,
    #[error("{detail}")]
    ContractInit { detail: String },
    #[error(transparent)]
    Preflight(#[from] PreflightFailure),
    #[error("Insufficient funds for transaction")]
    InsufficientFunds,
    #[error("Transaction nonce error, please try again")]
    NonceConflict,
    #[error("Another action is still in progress")]
    ActionInFlight,
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Decode(detail) => ClientError::Decode(detail),
            TransportError::Rejected(_) => ClientError::UserRejected,
            other => ClientError::Transport(other),
        }
    }
}

impl From<WalletError> for ClientError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::Rejected => ClientError::UserRejected,
            WalletError::UnknownAccount(_) => ClientError::NoAccounts,
            WalletError::Transport(inner) => inner.into(),
        }
    }
}

/// Checks that fail before anything is submitted.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PreflightFailure {
    #[error("Contract not found")]
    ContractMissing,
    #[error("Please connect your wallet first")]
    NotConnected,
    #[error("Insufficient ETH balance for the 0.001 ETH entry fee")]
    InsufficientEthBalance,
    #[error(transparent)]
    InvalidAmount(#[from] AmountError),
    #[error("Amount must be greater than zero")]
    ZeroAmount,
    #[error("Insufficient token balance")]
    InsufficientTokenBalance,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NoticeKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

/// Operation a notice offers to re-run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryAction {
    InitializeConnection,
    InitialLoad,
    Connect,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub message: String,
    pub kind: NoticeKind,
    pub retry: Option<RetryAction>,
}

impl Notice {
    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            kind: NoticeKind::Error,
            retry: None,
        }
    }

    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            kind: NoticeKind::Success,
            retry: None,
        }
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            kind: NoticeKind::Warning,
            retry: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryAction) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Turns a failed action into the message shown to the user.
///
/// Sources are tried in order: an explicit revert reason, a known custom error
/// selector, well-known wallet phrasings, then the raw error text.
pub fn describe_action_error(err: &ClientError) -> String {
    if let Some(reason) = revert_reason(err) {
        return reason;
    }
    if let Some(revert) = custom_revert(err) {
        return revert.message().to_owned();
    }
    if let Some(message) = wallet_phrasing(err) {
        return message.to_owned();
    }
    let raw = err.to_string();
    if raw.trim().is_empty() {
        "Unknown error occurred".to_owned()
    } else {
        raw
    }
}

fn revert_reason(err: &ClientError) -> Option<String> {
    match err {
        ClientError::Preflight(failure) => Some(failure.to_string()),
        ClientError::ActionReverted { reason } => Some(reason.clone()),
        ClientError::Transport(TransportError::Rpc { message, data, .. }) => data
            .as_ref()
            .and_then(|bytes| decode_error_string(bytes))
            .or_else(|| {
                message
                    .strip_prefix(EXECUTION_REVERTED_PREFIX)
                    .map(str::to_owned)
                    .filter(|reason| !reason.is_empty())
            }),
        _ => None,
    }
}

fn decode_error_string(data: &[u8]) -> Option<String> {
    let payload = data.strip_prefix(&ERROR_STRING_SELECTOR)?;
    match decode(&[ParamType::String], payload).ok()?.pop()? {
        Token::String(reason) if !reason.is_empty() => Some(reason),
        _ => None,
    }
}

fn custom_revert(err: &ClientError) -> Option<ContractRevert> {
    match err {
        ClientError::Transport(inner) => inner
            .revert_data()
            .and_then(|data| ContractRevert::from_revert_data(data)),
        _ => None,
    }
}

fn wallet_phrasing(err: &ClientError) -> Option<&'static str> {
    match err {
        ClientError::UserRejected => return Some("Transaction rejected by user"),
        ClientError::InsufficientFunds => return Some("Insufficient funds for transaction"),
        ClientError::NonceConflict => return Some("Transaction nonce error, please try again"),
        _ => {}
    }
    let text = err.to_string().to_lowercase();
    if text.contains("user rejected") || text.contains("user denied") {
        Some("Transaction rejected by user")
    } else if text.contains("insufficient funds") {
        Some("Insufficient funds for transaction")
    } else if text.contains("nonce") {
        Some("Transaction nonce error, please try again")
    } else {
        None
    }
}
