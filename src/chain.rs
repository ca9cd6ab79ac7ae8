//! Seams between the client and an Ethereum node.
//!
//! Everything above this module talks to a node through [`Transport`] (reads),
//! [`TxSigner`] (writes) and [`Connector`] (opening a transport for a URL). The
//! live implementations wrap `ethers` providers.

use async_trait::async_trait;
use ethers::{
    providers::{
        Http,
        JsonRpcError,
        Middleware,
        MiddlewareError,
        Provider,
    },
    signers::{
        LocalWallet,
        Signer,
    },
    types::{
        Address,
        Bytes,
        H256,
        TransactionRequest,
        U256,
        transaction::eip2718::TypedTransaction,
    },
    middleware::SignerMiddleware,
};
use std::{
    fmt::Debug,
    sync::Arc,
};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Bytes>,
    },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Revert payload attached to an RPC error, if any.
    pub fn revert_data(&self) -> Option<&Bytes> {
        match self {
            TransportError::Rpc { data, .. } => data.as_ref(),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Human-readable label for status lines and logs.
    fn describe(&self) -> String;

    async fn chain_id(&self) -> Result<u64, TransportError>;

    async fn code_at(&self, address: Address) -> Result<Bytes, TransportError>;

    async fn eth_balance(&self, address: Address) -> Result<U256, TransportError>;

    /// `eth_call` against the latest block.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, TransportError>;

    /// `None` while the transaction is not yet included, otherwise whether it
    /// succeeded.
    async fn receipt_status(&self, tx: H256) -> Result<Option<bool>, TransportError>;
}

#[async_trait]
pub trait TxSigner: Send + Sync + Debug {
    fn address(&self) -> Address;

    async fn send_transaction(
        &self,
        to: Address,
        data: Bytes,
        value: U256,
    ) -> Result<H256, TransportError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Arc<dyn Transport>, TransportError>;
}

#[derive(Clone, Debug)]
pub struct EthersTransport {
    url: String,
    provider: Provider<Http>,
}

impl EthersTransport {
    pub fn new(url: &str) -> Result<Self, TransportError> {
        let provider = Provider::<Http>::try_from(url).map_err(|err| {
            TransportError::Transport(format!("invalid rpc url {url}: {err}"))
        })?;
        Ok(Self {
            url: url.to_owned(),
            provider,
        })
    }

    pub fn provider(&self) -> &Provider<Http> {
        &self.provider
    }
}

#[async_trait]
impl Transport for EthersTransport {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn chain_id(&self) -> Result<u64, TransportError> {
        let id = self.provider.get_chainid().await.map_err(from_middleware)?;
        if id > U256::from(u64::MAX) {
            return Err(TransportError::Decode(format!("chain id {id} out of range")));
        }
        Ok(id.as_u64())
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, TransportError> {
        self.provider
            .get_code(address, None)
            .await
            .map_err(from_middleware)
    }

    async fn eth_balance(&self, address: Address) -> Result<U256, TransportError> {
        self.provider
            .get_balance(address, None)
            .await
            .map_err(from_middleware)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, TransportError> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.provider.call(&tx, None).await.map_err(from_middleware)
    }

    async fn receipt_status(&self, tx: H256) -> Result<Option<bool>, TransportError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx)
            .await
            .map_err(from_middleware)?;
        Ok(receipt.map(|r| r.status.is_some_and(|s| s.as_u64() == 1)))
    }
}

/// Opens plain HTTP JSON-RPC transports.
#[derive(Clone, Debug, Default)]
pub struct HttpConnector;

#[async_trait]
impl Connector for HttpConnector {
    async fn open(&self, url: &str) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(EthersTransport::new(url)?))
    }
}

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

#[derive(Clone, Debug)]
pub struct EthersSigner {
    client: Arc<SignerClient>,
}

impl EthersSigner {
    pub fn new(provider: Provider<Http>, wallet: LocalWallet) -> Self {
        Self {
            client: Arc::new(SignerMiddleware::new(provider, wallet)),
        }
    }
}

#[async_trait]
impl TxSigner for EthersSigner {
    fn address(&self) -> Address {
        self.client.signer().address()
    }

    async fn send_transaction(
        &self,
        to: Address,
        data: Bytes,
        value: U256,
    ) -> Result<H256, TransportError> {
        let tx = TransactionRequest::new()
            .from(self.address())
            .to(to)
            .data(data)
            .value(value);
        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(from_middleware)?;
        Ok(pending.tx_hash())
    }
}

fn from_middleware<E: MiddlewareError>(err: E) -> TransportError {
    if let Some(response) = err.as_error_response() {
        return from_json_rpc(response);
    }
    if err.is_serde_error() {
        return TransportError::Decode(err.to_string());
    }
    TransportError::Transport(err.to_string())
}

fn from_json_rpc(response: &JsonRpcError) -> TransportError {
    TransportError::Rpc {
        code: response.code,
        message: response.message.clone(),
        data: response.data.as_ref().and_then(revert_bytes),
    }
}

/// Nodes report revert data either as a bare hex string or nested under `data`.
fn revert_bytes(value: &serde_json::Value) -> Option<Bytes> {
    match value {
        serde_json::Value::String(raw) => {
            let digits = raw.strip_prefix("0x").unwrap_or(raw);
            hex::decode(digits).ok().map(Bytes::from)
        }
        serde_json::Value::Object(map) => map.get("data").and_then(revert_bytes),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use serde_json::json;

    #[test]
    fn revert_bytes__decodes_plain_hex_string() {
        // given
        let value = json!("0x08c379a0");

        // when
        let bytes = revert_bytes(&value);

        // then
        assert_eq!(bytes, Some(Bytes::from(vec![0x08, 0xc3, 0x79, 0xa0])));
    }

    #[test]
    fn revert_bytes__follows_nested_data_field() {
        // given
        let value = json!({ "message": "reverted", "data": "0xdeadbeef" });

        // when
        let bytes = revert_bytes(&value);

        // then
        assert_eq!(bytes, Some(Bytes::from(vec![0xde, 0xad, 0xbe, 0xef])));
    }

    #[test]
    fn revert_bytes__ignores_non_hex_payloads() {
        assert_eq!(revert_bytes(&json!("not hex")), None);
        assert_eq!(revert_bytes(&json!(42)), None);
    }

    #[test]
    fn from_json_rpc__keeps_code_message_and_data() {
        // given
        let response = JsonRpcError {
            code: 3,
            message: "execution reverted".to_owned(),
            data: Some(json!("0x01")),
        };

        // when
        let err = from_json_rpc(&response);

        // then
        assert_eq!(
            err,
            TransportError::Rpc {
                code: 3,
                message: "execution reverted".to_owned(),
                data: Some(Bytes::from(vec![0x01])),
            }
        );
    }
}
