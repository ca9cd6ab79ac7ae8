//! The injected wallet provider seam.

use crate::chain::{
    Transport,
    TransportError,
    TxSigner,
};
use async_trait::async_trait;
use ethers::types::Address;
use std::sync::{
    Arc,
    Mutex,
    PoisonError,
    Weak,
    atomic::{
        AtomicU64,
        Ordering,
    },
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletEvent {
    /// Authorized accounts, active one first. Empty when access was withdrawn.
    AccountsChanged(Vec<Address>),
    ChainChanged(u64),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WalletError {
    #[error("request rejected by the user")]
    Rejected,
    #[error("no signer available for account {0:?}")]
    UnknownAccount(Address),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Read transport of the network the wallet is currently on.
    fn transport(&self) -> Arc<dyn Transport>;

    /// Prompts for account authorization. Returns the authorized accounts,
    /// active one first.
    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError>;

    fn signer_for(&self, account: Address) -> Result<Arc<dyn TxSigner>, WalletError>;

    /// Withdraws the standing authorization so the next connect prompts again.
    async fn revoke_permissions(&self) -> Result<(), WalletError>;

    fn subscribe(&self) -> (mpsc::UnboundedReceiver<WalletEvent>, Subscription);
}

type ListenerList = Mutex<Vec<(u64, mpsc::UnboundedSender<WalletEvent>)>>;

/// Fan-out of wallet events to subscribers.
#[derive(Debug, Default)]
pub struct WalletListeners {
    listeners: Arc<ListenerList>,
    next_id: AtomicU64,
}

impl WalletListeners {
    pub fn subscribe(&self) -> (mpsc::UnboundedReceiver<WalletEvent>, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, tx));
        let subscription = Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        };
        (rx, subscription)
    }

    pub fn emit(&self, event: WalletEvent) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration handle returned by [`WalletProvider::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerList>,
}

impl Subscription {
    pub fn dispose(self) {}

    fn remove(&self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
            debug!(subscription = self.id, "wallet listener removed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn emit__reaches_every_subscriber() {
        // given
        let listeners = WalletListeners::default();
        let (mut first, _a) = listeners.subscribe();
        let (mut second, _b) = listeners.subscribe();

        // when
        listeners.emit(WalletEvent::ChainChanged(5));

        // then
        assert_eq!(first.try_recv().unwrap(), WalletEvent::ChainChanged(5));
        assert_eq!(second.try_recv().unwrap(), WalletEvent::ChainChanged(5));
    }

    #[test]
    fn dispose__unregisters_listener() {
        // given
        let listeners = WalletListeners::default();
        let (mut rx, subscription) = listeners.subscribe();

        // when
        subscription.dispose();
        listeners.emit(WalletEvent::AccountsChanged(vec![]));

        // then
        assert!(listeners.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dispose__leaves_other_subscribers_registered() {
        // given
        let listeners = WalletListeners::default();
        let (_first, first_sub) = listeners.subscribe();
        let (mut second, _second_sub) = listeners.subscribe();

        // when
        first_sub.dispose();
        listeners.emit(WalletEvent::ChainChanged(1));

        // then
        assert_eq!(listeners.len(), 1);
        assert_eq!(second.try_recv().unwrap(), WalletEvent::ChainChanged(1));
    }
}
