//! In-memory chain, connector and wallet used by unit and integration tests.

use crate::{
    TARGET_CHAIN_ID,
    chain::{
        Connector,
        Transport,
        TransportError,
        TxSigner,
    },
    contract::{
        MINER_ABI,
        MinerContract,
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
use ethers::{
    abi::{
        Abi,
        Function,
        Token,
        encode,
        parse_abi,
    },
    types::{
        Address,
        Bytes,
        H256,
        U256,
    },
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
    },
};
use tokio::sync::mpsc;

pub const FAKE_CONTRACT_ADDRESS: Address = Address::repeat_byte(0xc0);

pub fn ether(whole: u64) -> U256 {
    U256::from(whole) * U256::exp10(18)
}

pub fn milli_ether(milli: u64) -> U256 {
    U256::from(milli) * U256::exp10(15)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentTx {
    pub from: Address,
    pub to: Address,
    pub function: String,
    pub value: U256,
}

#[derive(Debug)]
struct ChainState {
    chain_id: u64,
    offline: bool,
    code: Bytes,
    uints: HashMap<String, U256>,
    bools: HashMap<String, bool>,
    raw: HashMap<String, Bytes>,
    failing: HashMap<String, TransportError>,
    eth_balances: HashMap<Address, U256>,
    token_balances: HashMap<Address, U256>,
    user_infos: HashMap<Address, (U256, U256, bool)>,
    pending_rewards: HashMap<Address, (U256, U256)>,
    calls: Vec<String>,
    sent: Vec<SentTx>,
    send_error: Option<TransportError>,
    receipt_polls_remaining: u32,
    receipt_success: bool,
}

impl ChainState {
    fn new(chain_id: u64) -> Self {
        let uints = [
            ("round", U256::from(1)),
            ("currentEpochId", U256::from(3)),
            ("blockNum", ether(12)),
            ("blockProfit", ether(50)),
            ("entryCount", U256::from(5)),
            ("shareSum", U256::from(40)),
            ("price", milli_ether(2)),
            ("burnFee", ether(1)),
            ("poolFee", milli_ether(500)),
            ("totalSupply", ether(1000)),
            ("totalBurned", ether(10)),
            ("lastBlockTimestamp", U256::from(1_700_000_000u64)),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_owned(), value))
        .collect();
        Self {
            chain_id,
            offline: false,
            code: Bytes::from(vec![0x60, 0x80, 0x60, 0x40]),
            uints,
            bools: HashMap::from([("isNewbeeTime".to_owned(), false)]),
            raw: HashMap::new(),
            failing: HashMap::new(),
            eth_balances: HashMap::new(),
            token_balances: HashMap::new(),
            user_infos: HashMap::new(),
            pending_rewards: HashMap::new(),
            calls: Vec::new(),
            sent: Vec::new(),
            send_error: None,
            receipt_polls_remaining: 0,
            receipt_success: true,
        }
    }
}

/// A node serving one deployed mining contract at [`FAKE_CONTRACT_ADDRESS`].
#[derive(Clone, Debug)]
pub struct FakeChain {
    state: Arc<Mutex<ChainState>>,
    abi: Arc<Abi>,
}

impl FakeChain {
    pub fn mainnet() -> Self {
        Self::with_chain_id(TARGET_CHAIN_ID)
    }

    pub fn with_chain_id(chain_id: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChainState::new(chain_id))),
            abi: Arc::new(parse_abi(MINER_ABI).unwrap()),
        }
    }

    pub fn contract(&self) -> MinerContract {
        MinerContract::new(FAKE_CONTRACT_ADDRESS).unwrap()
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.state.lock().unwrap().chain_id = chain_id;
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn remove_code(&self) {
        self.state.lock().unwrap().code = Bytes::new();
    }

    pub fn set_uint(&self, name: &str, value: U256) {
        self.state
            .lock()
            .unwrap()
            .uints
            .insert(name.to_owned(), value);
    }

    pub fn set_bool(&self, name: &str, value: bool) {
        self.state
            .lock()
            .unwrap()
            .bools
            .insert(name.to_owned(), value);
    }

    pub fn set_raw_response(&self, name: &str, data: Bytes) {
        self.state.lock().unwrap().raw.insert(name.to_owned(), data);
    }

    pub fn fail_read(&self, name: &str, err: TransportError) {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(name.to_owned(), err);
    }

    pub fn set_eth_balance(&self, account: Address, value: U256) {
        self.state.lock().unwrap().eth_balances.insert(account, value);
    }

    pub fn set_token_balance(&self, account: Address, value: U256) {
        self.state
            .lock()
            .unwrap()
            .token_balances
            .insert(account, value);
    }

    pub fn set_user_info(&self, account: Address, epoch_id: u64, share: u64, claimed: bool) {
        self.state.lock().unwrap().user_infos.insert(
            account,
            (U256::from(epoch_id), U256::from(share), claimed),
        );
    }

    pub fn set_pending_reward(&self, account: Address, token: U256, eth: U256) {
        self.state
            .lock()
            .unwrap()
            .pending_rewards
            .insert(account, (token, eth));
    }

    pub fn set_send_error(&self, err: TransportError) {
        self.state.lock().unwrap().send_error = Some(err);
    }

    /// Receipts stay pending for `polls` lookups, then report `success`.
    pub fn set_receipt(&self, polls: u32, success: bool) {
        let mut state = self.state.lock().unwrap();
        state.receipt_polls_remaining = polls;
        state.receipt_success = success;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn sent(&self) -> Vec<SentTx> {
        self.state.lock().unwrap().sent.clone()
    }

    fn function_for(&self, data: &[u8]) -> Result<&Function, TransportError> {
        let selector = data
            .get(..4)
            .ok_or_else(|| TransportError::Decode("short calldata".to_owned()))?;
        self.abi
            .functions()
            .find(|function| function.short_signature() == selector)
            .ok_or_else(|| TransportError::Decode("unknown selector".to_owned()))
    }

    fn address_arg(function: &Function, data: &[u8]) -> Result<Address, TransportError> {
        match function
            .decode_input(&data[4..])
            .map_err(|err| TransportError::Decode(err.to_string()))?
            .first()
        {
            Some(Token::Address(address)) => Ok(*address),
            _ => Err(TransportError::Decode("expected address argument".to_owned())),
        }
    }

    fn apply_transaction(state: &mut ChainState, tx: &SentTx, data: &[u8], function: &Function) {
        match tx.function.as_str() {
            "play" => {
                let epoch = state
                    .uints
                    .get("currentEpochId")
                    .copied()
                    .unwrap_or_default();
                state
                    .user_infos
                    .insert(tx.from, (epoch, U256::one(), false));
                let count = state.uints.entry("entryCount".to_owned()).or_default();
                *count += U256::one();
                let balance = state.eth_balances.entry(tx.from).or_default();
                *balance = balance.saturating_sub(tx.value);
            }
            "claim" => {
                state.pending_rewards.remove(&tx.from);
            }
            "burn" => {
                let amount = match function.decode_input(&data[4..]).ok().and_then(|mut t| t.pop()) {
                    Some(Token::Uint(amount)) => amount,
                    _ => U256::zero(),
                };
                let balance = state.token_balances.entry(tx.from).or_default();
                *balance = balance.saturating_sub(amount);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Transport for FakeChain {
    fn describe(&self) -> String {
        format!("fake chain {}", self.state.lock().unwrap().chain_id)
    }

    async fn chain_id(&self) -> Result<u64, TransportError> {
        let state = self.state.lock().unwrap();
        if state.offline {
            return Err(TransportError::Transport("node offline".to_owned()));
        }
        Ok(state.chain_id)
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, TransportError> {
        let state = self.state.lock().unwrap();
        if state.offline {
            return Err(TransportError::Transport("node offline".to_owned()));
        }
        if address == FAKE_CONTRACT_ADDRESS {
            Ok(state.code.clone())
        } else {
            Ok(Bytes::new())
        }
    }

    async fn eth_balance(&self, address: Address) -> Result<U256, TransportError> {
        let state = self.state.lock().unwrap();
        if state.offline {
            return Err(TransportError::Transport("node offline".to_owned()));
        }
        Ok(state.eth_balances.get(&address).copied().unwrap_or_default())
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, TransportError> {
        let function = self.function_for(&data)?;
        let name = function.name.clone();
        let mut state = self.state.lock().unwrap();
        if state.offline {
            return Err(TransportError::Transport("node offline".to_owned()));
        }
        state.calls.push(name.clone());
        if to != FAKE_CONTRACT_ADDRESS || state.code.is_empty() {
            return Ok(Bytes::new());
        }
        if let Some(err) = state.failing.get(&name) {
            return Err(err.clone());
        }
        if let Some(raw) = state.raw.get(&name) {
            return Ok(raw.clone());
        }
        let tokens = match name.as_str() {
            "isNewbeeTime" => vec![Token::Bool(
                state.bools.get(&name).copied().unwrap_or_default(),
            )],
            "decimals" => vec![Token::Uint(U256::from(18))],
            "balanceOf" => {
                let account = Self::address_arg(function, &data)?;
                vec![Token::Uint(
                    state.token_balances.get(&account).copied().unwrap_or_default(),
                )]
            }
            "userInfo" => {
                let account = Self::address_arg(function, &data)?;
                let (epoch, share, claimed) =
                    state.user_infos.get(&account).copied().unwrap_or_default();
                vec![Token::Uint(epoch), Token::Uint(share), Token::Bool(claimed)]
            }
            "getPendingReward" => {
                let account = Self::address_arg(function, &data)?;
                let (token, eth) = state
                    .pending_rewards
                    .get(&account)
                    .copied()
                    .unwrap_or_default();
                vec![Token::Uint(token), Token::Uint(eth)]
            }
            _ => vec![Token::Uint(
                state.uints.get(&name).copied().unwrap_or_default(),
            )],
        };
        Ok(Bytes::from(encode(&tokens)))
    }

    async fn receipt_status(&self, _tx: H256) -> Result<Option<bool>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.offline {
            return Err(TransportError::Transport("node offline".to_owned()));
        }
        if state.receipt_polls_remaining > 0 {
            state.receipt_polls_remaining -= 1;
            return Ok(None);
        }
        Ok(Some(state.receipt_success))
    }
}

#[derive(Clone, Debug)]
pub struct FakeSigner {
    chain: FakeChain,
    address: Address,
}

impl FakeSigner {
    pub fn new(chain: FakeChain, address: Address) -> Self {
        Self { chain, address }
    }
}

#[async_trait]
impl TxSigner for FakeSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn send_transaction(
        &self,
        to: Address,
        data: Bytes,
        value: U256,
    ) -> Result<H256, TransportError> {
        let function = self.chain.function_for(&data)?.clone();
        let mut state = self.chain.state.lock().unwrap();
        if let Some(err) = state.send_error.clone() {
            return Err(err);
        }
        let tx = SentTx {
            from: self.address,
            to,
            function: function.name.clone(),
            value,
        };
        FakeChain::apply_transaction(&mut state, &tx, &data, &function);
        state.sent.push(tx);
        Ok(H256::from_low_u64_be(state.sent.len() as u64))
    }
}

#[derive(Default)]
struct ConnectorState {
    routes: HashMap<String, Result<FakeChain, TransportError>>,
    opened: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    pub fn serve(&self, url: &str, chain: FakeChain) {
        self.state
            .lock()
            .unwrap()
            .routes
            .insert(url.to_owned(), Ok(chain));
    }

    pub fn fail(&self, url: &str, err: TransportError) {
        self.state
            .lock()
            .unwrap()
            .routes
            .insert(url.to_owned(), Err(err));
    }

    pub fn opened(&self) -> Vec<String> {
        self.state.lock().unwrap().opened.clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, url: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.opened.push(url.to_owned());
        match state.routes.get(url) {
            Some(Ok(chain)) => Ok(Arc::new(chain.clone())),
            Some(Err(err)) => Err(err.clone()),
            None => Err(TransportError::Transport(format!("unknown endpoint {url}"))),
        }
    }
}

struct WalletState {
    chain: FakeChain,
    accounts: Vec<Address>,
    rejecting: bool,
    revoke_fails: bool,
    revoke_calls: u32,
}

/// Injected wallet double. Event emission is driven by the test.
#[derive(Clone)]
pub struct FakeWallet {
    state: Arc<Mutex<WalletState>>,
    listeners: Arc<WalletListeners>,
}

impl FakeWallet {
    pub fn new(chain: FakeChain, accounts: Vec<Address>) -> Self {
        Self {
            state: Arc::new(Mutex::new(WalletState {
                chain,
                accounts,
                rejecting: false,
                revoke_fails: false,
                revoke_calls: 0,
            })),
            listeners: Arc::new(WalletListeners::default()),
        }
    }

    pub fn chain(&self) -> FakeChain {
        self.state.lock().unwrap().chain.clone()
    }

    /// Moves the wallet to another network without emitting an event.
    pub fn switch_chain(&self, chain: FakeChain) {
        self.state.lock().unwrap().chain = chain;
    }

    pub fn set_accounts(&self, accounts: Vec<Address>) {
        self.state.lock().unwrap().accounts = accounts;
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.state.lock().unwrap().rejecting = rejecting;
    }

    pub fn set_revoke_fails(&self, fails: bool) {
        self.state.lock().unwrap().revoke_fails = fails;
    }

    pub fn revoke_calls(&self) -> u32 {
        self.state.lock().unwrap().revoke_calls
    }

    pub fn emit(&self, event: WalletEvent) {
        self.listeners.emit(event);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[async_trait]
impl WalletProvider for FakeWallet {
    fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.chain())
    }

    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError> {
        let state = self.state.lock().unwrap();
        if state.rejecting {
            return Err(WalletError::Rejected);
        }
        Ok(state.accounts.clone())
    }

    fn signer_for(&self, account: Address) -> Result<Arc<dyn TxSigner>, WalletError> {
        let state = self.state.lock().unwrap();
        if !state.accounts.contains(&account) {
            return Err(WalletError::UnknownAccount(account));
        }
        Ok(Arc::new(FakeSigner::new(state.chain.clone(), account)))
    }

    async fn revoke_permissions(&self) -> Result<(), WalletError> {
        let mut state = self.state.lock().unwrap();
        state.revoke_calls += 1;
        if state.revoke_fails {
            return Err(WalletError::Transport(TransportError::Rpc {
                code: -32601,
                message: "method not supported".to_owned(),
                data: None,
            }));
        }
        Ok(())
    }

    fn subscribe(&self) -> (mpsc::UnboundedReceiver<WalletEvent>, Subscription) {
        self.listeners.subscribe()
    }
}
