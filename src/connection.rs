//! Ownership of the single active connection handle.

use crate::{
    TARGET_CHAIN_ID,
    chain::{
        Transport,
        TxSigner,
    },
    error::ClientError,
    resolver::EndpointResolver,
    wallet::{
        Subscription,
        WalletEvent,
        WalletProvider,
    },
};
use ethers::types::Address;
use std::{
    fmt,
    sync::Arc,
};
use tokio::sync::mpsc;
use tracing::{
    debug,
    info,
    warn,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointSource {
    Injected,
    Public(String),
}

impl fmt::Display for EndpointSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointSource::Injected => write!(f, "wallet"),
            EndpointSource::Public(url) => write!(f, "{url}"),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ConnectionHandle {
    Unconnected,
    ReadOnly {
        endpoint: Arc<dyn Transport>,
        source: EndpointSource,
    },
    Signing {
        endpoint: Arc<dyn Transport>,
        signer: Arc<dyn TxSigner>,
        account: Address,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
    Unconnected,
    ReadOnlyInjected,
    ReadOnlyPublic,
    Signing,
}

impl ConnectionHandle {
    pub fn kind(&self) -> HandleKind {
        match self {
            ConnectionHandle::Unconnected => HandleKind::Unconnected,
            ConnectionHandle::ReadOnly {
                source: EndpointSource::Injected,
                ..
            } => HandleKind::ReadOnlyInjected,
            ConnectionHandle::ReadOnly { .. } => HandleKind::ReadOnlyPublic,
            ConnectionHandle::Signing { .. } => HandleKind::Signing,
        }
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        match self {
            ConnectionHandle::Unconnected => None,
            ConnectionHandle::ReadOnly { endpoint, .. }
            | ConnectionHandle::Signing { endpoint, .. } => Some(endpoint.clone()),
        }
    }

    pub fn signer(&self) -> Option<Arc<dyn TxSigner>> {
        match self {
            ConnectionHandle::Signing { signer, .. } => Some(signer.clone()),
            _ => None,
        }
    }

    pub fn account(&self) -> Option<Address> {
        match self {
            ConnectionHandle::Signing { account, .. } => Some(*account),
            _ => None,
        }
    }

    pub fn is_signing(&self) -> bool {
        matches!(self, ConnectionHandle::Signing { .. })
    }

    fn describe(&self) -> String {
        match self {
            ConnectionHandle::Unconnected => "not connected".to_owned(),
            ConnectionHandle::ReadOnly { source, .. } => format!("read-only via {source}"),
            ConnectionHandle::Signing { endpoint, .. } => {
                format!("signing via {}", endpoint.describe())
            }
        }
    }
}

/// What the presentation layer needs to know about the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandleSummary {
    pub kind: HandleKind,
    pub account: Option<Address>,
    pub endpoint: String,
    pub generation: u64,
    pub init_error: Option<String>,
    pub wallet_available: bool,
}

pub struct ConnectionManager {
    handle: ConnectionHandle,
    generation: u64,
    wallet: Option<Arc<dyn WalletProvider>>,
    resolver: EndpointResolver,
    init_error: Option<String>,
    subscription: Option<Subscription>,
}

impl ConnectionManager {
    pub fn new(resolver: EndpointResolver, wallet: Option<Arc<dyn WalletProvider>>) -> Self {
        Self {
            handle: ConnectionHandle::Unconnected,
            generation: 0,
            wallet,
            resolver,
            init_error: None,
            subscription: None,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Bumped on every handle replacement.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn init_error(&self) -> Option<&str> {
        self.init_error.as_deref()
    }

    pub fn summary(&self) -> HandleSummary {
        HandleSummary {
            kind: self.handle.kind(),
            account: self.handle.account(),
            endpoint: self.handle.describe(),
            generation: self.generation,
            init_error: self.init_error.clone(),
            wallet_available: self.wallet.is_some(),
        }
    }

    /// Registers for wallet events. Only one registration is kept.
    pub fn subscribe(&mut self) -> Option<mpsc::UnboundedReceiver<WalletEvent>> {
        let wallet = self.wallet.as_ref()?;
        let (events, subscription) = wallet.subscribe();
        if let Some(previous) = self.subscription.replace(subscription) {
            previous.dispose();
        }
        Some(events)
    }

    pub fn teardown(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.dispose();
        }
    }

    /// Establishes a read-only handle. An existing signing handle is kept.
    pub async fn initialize(&mut self) -> Result<(), ClientError> {
        if self.handle.is_signing() {
            debug!("initialize skipped; signing handle already active");
            return Ok(());
        }
        self.establish_read_only().await
    }

    /// Requests account authorization and upgrades to a signing handle.
    pub async fn connect(&mut self) -> Result<Address, ClientError> {
        let wallet = self.wallet_or_unavailable()?;
        let accounts = wallet.request_accounts().await?;
        let account = *accounts.first().ok_or(ClientError::NoAccounts)?;
        let endpoint = Self::ensure_target_network(&wallet).await?;
        let signer = wallet.signer_for(account)?;
        self.replace(ConnectionHandle::Signing {
            endpoint,
            signer,
            account,
        });
        self.init_error = None;
        info!(?account, generation = self.generation, "wallet connected");
        Ok(account)
    }

    /// Falls back to a read-only handle, then revokes the wallet grant. A
    /// failed revocation is only logged.
    pub async fn disconnect(&mut self) {
        self.downgrade().await;
        if let Some(wallet) = self.wallet.clone()
            && let Err(err) = wallet.revoke_permissions().await
        {
            warn!(%err, "revoking wallet permissions failed");
        }
    }

    pub async fn handle_event(&mut self, event: WalletEvent) -> Result<(), ClientError> {
        match event {
            WalletEvent::AccountsChanged(accounts) => self.on_accounts_changed(accounts).await,
            WalletEvent::ChainChanged(chain_id) => {
                info!(chain_id, "wallet network changed; rebuilding connection");
                self.replace(ConnectionHandle::Unconnected);
                self.establish_read_only().await
            }
        }
    }

    async fn on_accounts_changed(&mut self, accounts: Vec<Address>) -> Result<(), ClientError> {
        let Some(current) = self.handle.account() else {
            debug!("accounts changed while not signing; ignored");
            return Ok(());
        };
        let Some(next) = accounts.first().copied() else {
            info!("wallet access withdrawn");
            self.downgrade().await;
            return Ok(());
        };
        if next == current {
            return Ok(());
        }
        let wallet = self.wallet_or_unavailable()?;
        let endpoint = match Self::ensure_target_network(&wallet).await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(%err, "account switched on an unsupported network");
                self.replace(ConnectionHandle::Unconnected);
                return Err(err);
            }
        };
        match wallet.signer_for(next) {
            Ok(signer) => {
                self.replace(ConnectionHandle::Signing {
                    endpoint,
                    signer,
                    account: next,
                });
                info!(account = ?next, "switched signing account");
                Ok(())
            }
            Err(err) => {
                self.downgrade().await;
                Err(err.into())
            }
        }
    }

    async fn downgrade(&mut self) {
        if let Err(err) = self.establish_read_only().await {
            warn!(%err, "no read-only connection after downgrade");
            self.replace(ConnectionHandle::Unconnected);
        }
    }

    /// Prefers the injected provider when it is on the target network, then
    /// the public endpoints.
    async fn establish_read_only(&mut self) -> Result<(), ClientError> {
        if let Some(wallet) = self.wallet.clone() {
            let transport = wallet.transport();
            match transport.chain_id().await {
                Ok(TARGET_CHAIN_ID) => {
                    self.replace(ConnectionHandle::ReadOnly {
                        endpoint: transport,
                        source: EndpointSource::Injected,
                    });
                    self.init_error = None;
                    return Ok(());
                }
                Ok(chain_id) => {
                    info!(chain_id, "wallet on another network; using public endpoints")
                }
                Err(err) => warn!(%err, "wallet provider probe failed"),
            }
        }
        match self.resolver.resolve().await {
            Ok(resolved) => {
                self.replace(ConnectionHandle::ReadOnly {
                    endpoint: resolved.transport,
                    source: EndpointSource::Public(resolved.url),
                });
                self.init_error = None;
                Ok(())
            }
            Err(err) => {
                let detail = err.to_string();
                self.init_error = Some(detail.clone());
                Err(ClientError::ContractInit { detail })
            }
        }
    }

    async fn ensure_target_network(
        wallet: &Arc<dyn WalletProvider>,
    ) -> Result<Arc<dyn Transport>, ClientError> {
        let transport = wallet.transport();
        let current = transport.chain_id().await?;
        if current != TARGET_CHAIN_ID {
            return Err(ClientError::WrongNetwork { current });
        }
        Ok(transport)
    }

    fn wallet_or_unavailable(&self) -> Result<Arc<dyn WalletProvider>, ClientError> {
        self.wallet
            .clone()
            .ok_or_else(|| ClientError::ProviderUnavailable {
                detail: "no wallet configured".to_owned(),
            })
    }

    fn replace(&mut self, handle: ConnectionHandle) {
        self.generation += 1;
        self.handle = handle;
        info!(
            generation = self.generation,
            handle = %self.handle.describe(),
            "connection handle replaced"
        );
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.teardown();
    }
}
