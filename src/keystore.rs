//! Local keystore wallet acting as the injected provider.
//!
//! Keystores are unlocked before the UI starts. Authorization is a flag that
//! `request_accounts` sets and `revoke_permissions` clears, mirroring how a
//! browser wallet grants and withdraws site access.

use crate::{
    TARGET_CHAIN_ID,
    chain::{
        EthersSigner,
        EthersTransport,
        Transport,
        TxSigner,
    },
    wallet::{
        Subscription,
        WalletError,
        WalletEvent,
        WalletListeners,
        WalletProvider,
    },
};
use async_trait::async_trait;
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use eth_keystore::{
    KeystoreError,
    decrypt_key,
};
use ethers::{
    signers::{
        LocalWallet,
        Signer,
    },
    types::Address,
};
use rpassword::prompt_password;
use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
    sync::{
        Arc,
        Mutex,
        PoisonError,
        Weak,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time,
};
use tracing::{
    info,
    warn,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeystoreDescriptor {
    pub name: String,
    pub path: PathBuf,
}

impl KeystoreDescriptor {
    pub fn new(name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            name: name.into(),
            path,
        }
    }
}

pub fn default_keystore_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").wrap_err("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".btcr").join("keystore"))
}

pub fn resolve_keystore_dir(dir: Option<&Path>) -> Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir.to_path_buf()),
        None => default_keystore_dir(),
    }
}

/// Keystore files are `<name>.json`; the list is sorted by name.
pub fn list_keystores(dir: &Path) -> Result<Vec<KeystoreDescriptor>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut keystores = Vec::new();
    for entry in fs::read_dir(dir).wrap_err("Failed to read keystore directory")? {
        let entry = entry.wrap_err("Failed to read keystore entry")?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| eyre!("Invalid keystore filename {:?}", path))?
            .to_owned();
        keystores.push(KeystoreDescriptor::new(name, path));
    }
    keystores.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(keystores)
}

/// Picks the named keystores in the given order, or all of them when `names`
/// is empty.
pub fn select_keystores(dir: &Path, names: &[String]) -> Result<Vec<KeystoreDescriptor>> {
    let available = list_keystores(dir)?;
    if names.is_empty() {
        return Ok(available);
    }
    names
        .iter()
        .map(|name| {
            available
                .iter()
                .find(|k| &k.name == name)
                .cloned()
                .ok_or_else(|| eyre!("Keystore '{name}' not found in {}", dir.display()))
        })
        .collect()
}

pub fn unlock_keystore(descriptor: &KeystoreDescriptor, password: &str) -> Result<LocalWallet> {
    let secret = decrypt_key(&descriptor.path, password.as_bytes()).map_err(|err| match err {
        KeystoreError::MacMismatch => {
            eyre!("Invalid password for keystore '{}'", descriptor.name)
        }
        other => eyre!("Failed to read keystore '{}': {other}", descriptor.name),
    })?;
    let wallet = LocalWallet::from_bytes(&secret)
        .map_err(|err| eyre!("Keystore '{}' holds an invalid key: {err}", descriptor.name))?;
    Ok(wallet.with_chain_id(TARGET_CHAIN_ID))
}

pub fn prompt_and_unlock(descriptor: &KeystoreDescriptor) -> Result<LocalWallet> {
    let prompt = format!("Enter password for keystore '{}': ", descriptor.name);
    let password = prompt_password(prompt).wrap_err("Failed to read keystore password")?;
    unlock_keystore(descriptor, &password)
}

#[derive(Debug)]
struct UnlockedKey {
    name: String,
    wallet: LocalWallet,
}

#[derive(Debug, Default)]
struct Grant {
    authorized: bool,
    active: usize,
}

pub struct KeystoreWallet {
    transport: Arc<EthersTransport>,
    keys: Vec<UnlockedKey>,
    grant: Mutex<Grant>,
    listeners: WalletListeners,
}

impl KeystoreWallet {
    pub fn new(rpc_url: &str, wallets: Vec<(String, LocalWallet)>) -> Result<Self> {
        let transport = EthersTransport::new(rpc_url).map_err(|err| eyre!(err))?;
        let keys = wallets
            .into_iter()
            .map(|(name, wallet)| UnlockedKey { name, wallet })
            .collect();
        Ok(Self {
            transport: Arc::new(transport),
            keys,
            grant: Mutex::new(Grant::default()),
            listeners: WalletListeners::default(),
        })
    }

    /// Prompts for each keystore password on the terminal.
    pub fn unlock(rpc_url: &str, descriptors: &[KeystoreDescriptor]) -> Result<Self> {
        let mut wallets = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let wallet = prompt_and_unlock(descriptor)?;
            info!(keystore = %descriptor.name, address = ?wallet.address(), "keystore unlocked");
            wallets.push((descriptor.name.clone(), wallet));
        }
        Self::new(rpc_url, wallets)
    }

    pub fn key_names(&self) -> Vec<String> {
        self.keys.iter().map(|k| k.name.clone()).collect()
    }

    fn ordered_accounts(&self, active: usize) -> Vec<Address> {
        let len = self.keys.len();
        (0..len)
            .map(|offset| self.keys[(active + offset) % len].wallet.address())
            .collect()
    }

    /// Makes the next key active and announces it, like switching accounts in a
    /// browser wallet. No-op while unauthorized.
    pub fn select_next_account(&self) {
        let accounts = {
            let mut grant = self.grant.lock().unwrap_or_else(PoisonError::into_inner);
            if !grant.authorized || self.keys.len() < 2 {
                return;
            }
            grant.active = (grant.active + 1) % self.keys.len();
            self.ordered_accounts(grant.active)
        };
        self.listeners.emit(WalletEvent::AccountsChanged(accounts));
    }

    /// Withdraws access from the wallet side.
    pub fn lock(&self) {
        self.grant
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .authorized = false;
        self.listeners.emit(WalletEvent::AccountsChanged(Vec::new()));
    }

    /// Polls the node's chain id and emits `ChainChanged` when it moves. Stops
    /// once the wallet is dropped.
    pub fn spawn_chain_watcher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            let mut last_seen: Option<u64> = None;
            loop {
                ticker.tick().await;
                let Some(wallet) = weak.upgrade() else {
                    break;
                };
                match wallet.transport.chain_id().await {
                    Ok(chain_id) => {
                        if last_seen.is_some_and(|previous| previous != chain_id) {
                            info!(chain_id, "wallet node reports a new chain");
                            wallet.listeners.emit(WalletEvent::ChainChanged(chain_id));
                        }
                        last_seen = Some(chain_id);
                    }
                    Err(err) => warn!(%err, "wallet chain poll failed"),
                }
            }
        })
    }
}

#[async_trait]
impl WalletProvider for KeystoreWallet {
    fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError> {
        if self.keys.is_empty() {
            return Err(WalletError::Rejected);
        }
        let mut grant = self.grant.lock().unwrap_or_else(PoisonError::into_inner);
        grant.authorized = true;
        Ok(self.ordered_accounts(grant.active))
    }

    fn signer_for(&self, account: Address) -> Result<Arc<dyn TxSigner>, WalletError> {
        let authorized = self
            .grant
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .authorized;
        if !authorized {
            return Err(WalletError::Rejected);
        }
        let key = self
            .keys
            .iter()
            .find(|k| k.wallet.address() == account)
            .ok_or(WalletError::UnknownAccount(account))?;
        Ok(Arc::new(EthersSigner::new(
            self.transport.provider().clone(),
            key.wallet.clone(),
        )))
    }

    async fn revoke_permissions(&self) -> Result<(), WalletError> {
        self.grant
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .authorized = false;
        Ok(())
    }

    fn subscribe(&self) -> (mpsc::UnboundedReceiver<WalletEvent>, Subscription) {
        self.listeners.subscribe()
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use std::fs::File;

    const KEY_A: [u8; 32] = [0x11; 32];
    const KEY_B: [u8; 32] = [0x22; 32];

    fn wallet_with(keys: &[[u8; 32]]) -> KeystoreWallet {
        let wallets = keys
            .iter()
            .enumerate()
            .map(|(i, key)| (format!("key{i}"), LocalWallet::from_bytes(key).unwrap()))
            .collect();
        KeystoreWallet::new("http://localhost:8545", wallets).unwrap()
    }

    #[test]
    fn list_keystores__returns_sorted_json_files_only() {
        // given
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("zeta.json")).unwrap();
        File::create(dir.path().join("alpha.json")).unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();

        // when
        let keystores = list_keystores(dir.path()).unwrap();

        // then
        let names: Vec<_> = keystores.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn select_keystores__errors_on_unknown_name() {
        // given
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("main.json")).unwrap();

        // when
        let picked = select_keystores(dir.path(), &["main".to_owned()]).unwrap();
        let missing = select_keystores(dir.path(), &["other".to_owned()]);

        // then
        assert_eq!(picked.len(), 1);
        assert!(missing.is_err());
    }

    #[test]
    fn unlock_keystore__round_trips_encrypted_key() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let mut rng = ethers::core::rand::thread_rng();
        eth_keystore::encrypt_key(dir.path(), &mut rng, KEY_A, "pw", Some("main.json")).unwrap();
        let descriptor = KeystoreDescriptor::new("main", dir.path().join("main.json"));

        // when
        let unlocked = unlock_keystore(&descriptor, "pw").unwrap();
        let wrong = unlock_keystore(&descriptor, "nope").unwrap_err();

        // then
        assert_eq!(
            unlocked.address(),
            LocalWallet::from_bytes(&KEY_A).unwrap().address()
        );
        assert_eq!(unlocked.chain_id(), TARGET_CHAIN_ID);
        assert!(wrong.to_string().starts_with("Invalid password"));
    }

    #[test]
    fn unlock_keystore__unreadable_file_reports_real_cause() {
        // given
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.json"), "not a keystore").unwrap();
        let broken = KeystoreDescriptor::new("broken", dir.path().join("broken.json"));
        let missing = KeystoreDescriptor::new("gone", dir.path().join("gone.json"));

        // when
        let broken = unlock_keystore(&broken, "pw").unwrap_err();
        let missing = unlock_keystore(&missing, "pw").unwrap_err();

        // then
        assert!(broken.to_string().starts_with("Failed to read keystore 'broken'"));
        assert!(missing.to_string().starts_with("Failed to read keystore 'gone'"));
    }

    #[tokio::test]
    async fn request_accounts__authorizes_and_orders_active_first() {
        // given
        let wallet = wallet_with(&[KEY_A, KEY_B]);
        let (mut events, _sub) = wallet.subscribe();
        let a = LocalWallet::from_bytes(&KEY_A).unwrap().address();
        let b = LocalWallet::from_bytes(&KEY_B).unwrap().address();

        // when
        let accounts = wallet.request_accounts().await.unwrap();
        wallet.select_next_account();

        // then
        assert_eq!(accounts, vec![a, b]);
        assert_eq!(
            events.try_recv().unwrap(),
            WalletEvent::AccountsChanged(vec![b, a])
        );
        assert!(wallet.signer_for(b).is_ok());
    }

    #[tokio::test]
    async fn signer_for__requires_authorization() {
        // given
        let wallet = wallet_with(&[KEY_A]);
        let a = LocalWallet::from_bytes(&KEY_A).unwrap().address();

        // when
        let before = wallet.signer_for(a);
        wallet.request_accounts().await.unwrap();
        let during = wallet.signer_for(a);
        wallet.revoke_permissions().await.unwrap();
        let after = wallet.signer_for(a);

        // then
        assert_eq!(before.err(), Some(WalletError::Rejected));
        assert!(during.is_ok());
        assert_eq!(after.err(), Some(WalletError::Rejected));
    }

    #[tokio::test]
    async fn request_accounts__rejects_without_keys_and_lock_emits_empty() {
        // given
        let empty = wallet_with(&[]);
        let wallet = wallet_with(&[KEY_A]);
        let (mut events, _sub) = wallet.subscribe();

        // when
        let rejected = empty.request_accounts().await;
        wallet.lock();

        // then
        assert_eq!(rejected, Err(WalletError::Rejected));
        assert_eq!(
            events.try_recv().unwrap(),
            WalletEvent::AccountsChanged(vec![])
        );
    }
}
