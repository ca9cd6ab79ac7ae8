//! Polled read model of the mining contract.

use crate::{
    BLOCK_TIME_SECS,
    NEWBEE_THRESHOLD,
    chain::{
        Transport,
        TransportError,
    },
    contract::MinerContract,
    units::{
        format_amount,
        parse_amount,
    },
};
use ethers::types::{
    Address,
    U256,
};
use thiserror::Error;
use tracing::{
    debug,
    warn,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserSnapshot {
    pub eth_balance: String,
    pub token_balance: String,
    pub pending_token_reward: String,
    pub pending_eth_reward: String,
    pub share: String,
    pub epoch_id: u64,
    pub claimed: bool,
}

impl UserSnapshot {
    pub fn zeroed() -> Self {
        Self {
            eth_balance: "0".to_owned(),
            token_balance: "0".to_owned(),
            pending_token_reward: "0".to_owned(),
            pending_eth_reward: "0".to_owned(),
            share: "0".to_owned(),
            epoch_id: 0,
            claimed: false,
        }
    }
}

/// Last successfully fetched contract state. Amounts are decimal strings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractSnapshot {
    pub round: u64,
    pub current_epoch_id: u64,
    pub blocks_mined: String,
    pub block_reward: String,
    pub entry_count: u64,
    pub share_sum: String,
    pub price: String,
    pub burn_fee: String,
    pub pool_fee: String,
    pub total_supply: String,
    pub total_burned: String,
    pub is_newbee_only: bool,
    pub last_block_timestamp: u64,
    pub user: Option<UserSnapshot>,
}

impl Default for ContractSnapshot {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl ContractSnapshot {
    pub fn zeroed() -> Self {
        Self {
            round: 0,
            current_epoch_id: 0,
            blocks_mined: "0".to_owned(),
            block_reward: "0".to_owned(),
            entry_count: 0,
            share_sum: "0".to_owned(),
            price: "0".to_owned(),
            burn_fee: "0".to_owned(),
            pool_fee: "0".to_owned(),
            total_supply: "0".to_owned(),
            total_burned: "0".to_owned(),
            is_newbee_only: false,
            last_block_timestamp: 0,
            user: None,
        }
    }

    /// Share the user holds in the current epoch. Membership of an older
    /// epoch counts as zero.
    pub fn current_epoch_share(&self) -> &str {
        match &self.user {
            Some(user) if user.epoch_id > 0 && user.epoch_id == self.current_epoch_id => {
                &user.share
            }
            _ => "0",
        }
    }

    pub fn has_joined_current_epoch(&self) -> bool {
        self.current_epoch_share() != "0"
    }

    /// Tokens the redemption fee pool can currently pay out at the token price.
    pub fn max_redeemable_tokens(&self) -> String {
        let (Ok(burn_fee), Ok(price)) = (parse_amount(&self.burn_fee), parse_amount(&self.price))
        else {
            return "0".to_owned();
        };
        if price.is_zero() {
            return "0".to_owned();
        }
        match burn_fee.checked_mul(U256::exp10(18)) {
            Some(scaled) => format_amount(scaled / price),
            None => "0".to_owned(),
        }
    }

    /// Seconds until the next block is expected, floored at zero.
    pub fn seconds_until_next_block(&self, now: i64) -> u64 {
        if self.last_block_timestamp == 0 {
            return 0;
        }
        let next = self.last_block_timestamp.saturating_add(BLOCK_TIME_SECS);
        let now = u64::try_from(now).unwrap_or(0);
        next.saturating_sub(now)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("contract not found at the configured address")]
    NotDeployed { user_eth_balance: Option<String> },
    #[error("unexpected contract response: {0}")]
    Decode(String),
    #[error("network error: {0}")]
    Network(TransportError),
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Decode(detail) => SyncError::Decode(detail),
            other => SyncError::Network(other),
        }
    }
}

const GLOBAL_UINT_READS: [&str; 10] = [
    "currentEpochId",
    "blockNum",
    "blockProfit",
    "entryCount",
    "shareSum",
    "price",
    "burnFee",
    "poolFee",
    "totalSupply",
    "totalBurned",
];

/// Reads a complete snapshot. Either every field is read or the call fails.
pub async fn fetch_snapshot(
    transport: &dyn Transport,
    contract: &MinerContract,
    account: Option<Address>,
) -> Result<ContractSnapshot, SyncError> {
    let code = transport.code_at(contract.address()).await?;
    if code.is_empty() {
        return Err(not_deployed(transport, account).await);
    }

    let round = match contract.read_uint(transport, "round").await {
        Ok(round) => round,
        Err(TransportError::Decode(detail)) => {
            debug!(%detail, "first contract read did not decode");
            return Err(not_deployed(transport, account).await);
        }
        Err(err) => return Err(err.into()),
    };
    let mut values = Vec::with_capacity(GLOBAL_UINT_READS.len());
    for name in GLOBAL_UINT_READS {
        values.push(contract.read_uint(transport, name).await?);
    }
    let newbee_window = contract.read_bool(transport, "isNewbeeTime").await?;
    let last_block_timestamp = contract.read_uint(transport, "lastBlockTimestamp").await?;

    let [
        current_epoch_id,
        block_num,
        block_profit,
        entry_count,
        share_sum,
        price,
        burn_fee,
        pool_fee,
        total_supply,
        total_burned,
    ] = values.as_slice()
    else {
        return Err(SyncError::Decode("incomplete global batch".to_owned()));
    };
    let entry_count = to_count("entryCount", *entry_count)?;

    let user = match account {
        Some(account) => Some(fetch_user(transport, contract, account).await?),
        None => None,
    };

    Ok(ContractSnapshot {
        round: to_count("round", round)?,
        current_epoch_id: to_count("currentEpochId", *current_epoch_id)?,
        blocks_mined: format_amount(*block_num),
        block_reward: format_amount(*block_profit),
        entry_count,
        share_sum: share_sum.to_string(),
        price: format_amount(*price),
        burn_fee: format_amount(*burn_fee),
        pool_fee: format_amount(*pool_fee),
        total_supply: format_amount(*total_supply),
        total_burned: format_amount(*total_burned),
        is_newbee_only: newbee_window && entry_count < NEWBEE_THRESHOLD,
        last_block_timestamp: to_count("lastBlockTimestamp", last_block_timestamp)?,
        user,
    })
}

async fn fetch_user(
    transport: &dyn Transport,
    contract: &MinerContract,
    account: Address,
) -> Result<UserSnapshot, SyncError> {
    let eth_balance = transport.eth_balance(account).await?;
    let token_balance = contract.balance_of(transport, account).await?;
    let info = contract.user_info(transport, account).await?;
    let pending = contract.pending_reward(transport, account).await?;
    Ok(UserSnapshot {
        eth_balance: format_amount(eth_balance),
        token_balance: format_amount(token_balance),
        pending_token_reward: format_amount(pending.token),
        pending_eth_reward: format_amount(pending.eth),
        share: info.share.to_string(),
        epoch_id: to_count("userInfo.epochId", info.epoch_id)?,
        claimed: info.claimed,
    })
}

async fn not_deployed(transport: &dyn Transport, account: Option<Address>) -> SyncError {
    let user_eth_balance = match account {
        Some(account) => match transport.eth_balance(account).await {
            Ok(balance) => Some(format_amount(balance)),
            Err(err) => {
                warn!(%err, "eth balance unavailable");
                None
            }
        },
        None => None,
    };
    SyncError::NotDeployed { user_eth_balance }
}

fn to_count(name: &str, value: U256) -> Result<u64, SyncError> {
    if value > U256::from(u64::MAX) {
        return Err(SyncError::Decode(format!("{name} out of range: {value}")));
    }
    Ok(value.as_u64())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadPhase {
    InitialLoading,
    Ready,
    InitialError { message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchTrigger {
    /// Eager fetch after a handle or account change.
    Initial,
    /// User retry of a failed initial load.
    Retry,
    /// Interval poll.
    Background,
    /// Refresh key.
    Manual,
    /// Forced fetch after a completed action.
    Resync,
}

impl FetchTrigger {
    fn is_background(self) -> bool {
        matches!(self, FetchTrigger::Background)
    }
}

/// Identifies the handle generation and account a fetch was started for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchTicket {
    pub generation: u64,
    pub account: Option<Address>,
    pub trigger: FetchTrigger,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The ticket belongs to a replaced handle or account.
    Stale,
    NotDeployed,
    Failed(SyncError),
}

#[derive(Debug)]
pub struct StateSynchronizer {
    snapshot: ContractSnapshot,
    phase: LoadPhase,
    refreshing: bool,
    manual_refresh: bool,
    generation: u64,
    account: Option<Address>,
    eager_pending: bool,
}

impl Default for StateSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSynchronizer {
    pub fn new() -> Self {
        Self {
            snapshot: ContractSnapshot::zeroed(),
            phase: LoadPhase::InitialLoading,
            refreshing: false,
            manual_refresh: false,
            generation: 0,
            account: None,
            eager_pending: true,
        }
    }

    pub fn snapshot(&self) -> &ContractSnapshot {
        &self.snapshot
    }

    pub fn phase(&self) -> &LoadPhase {
        &self.phase
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing
    }

    pub fn is_manual_refresh(&self) -> bool {
        self.manual_refresh
    }

    /// True until a non-background fetch succeeds for the current handle.
    pub fn needs_eager_fetch(&self) -> bool {
        self.eager_pending
    }

    /// Points the synchronizer at a new handle. Returns whether anything changed.
    pub fn on_connection_changed(&mut self, generation: u64, account: Option<Address>) -> bool {
        if self.generation == generation && self.account == account {
            return false;
        }
        if self.account != account {
            self.snapshot.user = account.map(|_| UserSnapshot::zeroed());
        }
        self.generation = generation;
        self.account = account;
        self.phase = LoadPhase::InitialLoading;
        self.refreshing = false;
        self.manual_refresh = false;
        self.eager_pending = true;
        true
    }

    pub fn ticket(&self, trigger: FetchTrigger) -> FetchTicket {
        FetchTicket {
            generation: self.generation,
            account: self.account,
            trigger,
        }
    }

    /// Marks the matching progress flag for a fetch about to start.
    pub fn begin(&mut self, ticket: &FetchTicket) {
        if !self.is_current(ticket) {
            return;
        }
        match ticket.trigger {
            FetchTrigger::Background => self.refreshing = true,
            FetchTrigger::Manual => self.manual_refresh = true,
            FetchTrigger::Retry => self.phase = LoadPhase::InitialLoading,
            FetchTrigger::Initial | FetchTrigger::Resync => {}
        }
    }

    pub fn apply(
        &mut self,
        ticket: &FetchTicket,
        result: Result<ContractSnapshot, SyncError>,
    ) -> ApplyOutcome {
        if !self.is_current(ticket) {
            debug!(
                ticket_generation = ticket.generation,
                generation = self.generation,
                "dropping stale fetch result"
            );
            return ApplyOutcome::Stale;
        }
        match ticket.trigger {
            FetchTrigger::Background => self.refreshing = false,
            FetchTrigger::Manual => self.manual_refresh = false,
            _ => {}
        }
        match result {
            Ok(snapshot) => {
                self.snapshot = snapshot;
                self.mark_loaded(ticket.trigger);
                ApplyOutcome::Applied
            }
            Err(SyncError::NotDeployed { user_eth_balance }) => {
                let mut snapshot = ContractSnapshot::zeroed();
                if self.account.is_some() {
                    let mut user = UserSnapshot::zeroed();
                    if let Some(balance) = user_eth_balance {
                        user.eth_balance = balance;
                    }
                    snapshot.user = Some(user);
                }
                self.snapshot = snapshot;
                self.mark_loaded(ticket.trigger);
                ApplyOutcome::NotDeployed
            }
            Err(err) => {
                match ticket.trigger {
                    FetchTrigger::Background => warn!(%err, "background refresh failed"),
                    FetchTrigger::Initial | FetchTrigger::Retry => {
                        self.phase = LoadPhase::InitialError {
                            message: err.to_string(),
                        };
                    }
                    _ => {}
                }
                ApplyOutcome::Failed(err)
            }
        }
    }

    fn mark_loaded(&mut self, trigger: FetchTrigger) {
        if !trigger.is_background() {
            self.phase = LoadPhase::Ready;
            self.eager_pending = false;
        }
    }

    fn is_current(&self, ticket: &FetchTicket) -> bool {
        ticket.generation == self.generation && ticket.account == self.account
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::test_helpers::{
        FakeChain,
        ether,
        milli_ether,
    };

    const ALICE: Address = Address::repeat_byte(0xa1);

    #[tokio::test]
    async fn fetch_snapshot__reads_globals_in_fixed_order() {
        // given
        let chain = FakeChain::mainnet();
        let contract = chain.contract();

        // when
        let snapshot = fetch_snapshot(&chain, &contract, None).await.unwrap();

        // then
        assert_eq!(
            chain.calls(),
            vec![
                "round",
                "currentEpochId",
                "blockNum",
                "blockProfit",
                "entryCount",
                "shareSum",
                "price",
                "burnFee",
                "poolFee",
                "totalSupply",
                "totalBurned",
                "isNewbeeTime",
                "lastBlockTimestamp",
            ]
        );
        assert_eq!(snapshot.round, 1);
        assert_eq!(snapshot.current_epoch_id, 3);
        assert_eq!(snapshot.blocks_mined, "12");
        assert_eq!(snapshot.price, "0.002");
        assert_eq!(snapshot.pool_fee, "0.5");
        assert_eq!(snapshot.user, None);
    }

    #[tokio::test]
    async fn fetch_snapshot__includes_user_fields_for_known_account() {
        // given
        let chain = FakeChain::mainnet();
        chain.set_eth_balance(ALICE, milli_ether(1500));
        chain.set_token_balance(ALICE, ether(7));
        chain.set_user_info(ALICE, 3, 2, false);
        chain.set_pending_reward(ALICE, ether(1), milli_ether(1));
        let contract = chain.contract();

        // when
        let snapshot = fetch_snapshot(&chain, &contract, Some(ALICE)).await.unwrap();

        // then
        assert_eq!(
            snapshot.user,
            Some(UserSnapshot {
                eth_balance: "1.5".to_owned(),
                token_balance: "7".to_owned(),
                pending_token_reward: "1".to_owned(),
                pending_eth_reward: "0.001".to_owned(),
                share: "2".to_owned(),
                epoch_id: 3,
                claimed: false,
            })
        );
        assert!(snapshot.has_joined_current_epoch());
    }

    #[tokio::test]
    async fn fetch_snapshot__newbee_flag_turns_off_at_threshold() {
        // given
        let chain = FakeChain::mainnet();
        chain.set_bool("isNewbeeTime", true);
        let contract = chain.contract();

        // when
        chain.set_uint("entryCount", U256::from(NEWBEE_THRESHOLD - 1));
        let below = fetch_snapshot(&chain, &contract, None).await.unwrap();
        chain.set_uint("entryCount", U256::from(NEWBEE_THRESHOLD));
        let at = fetch_snapshot(&chain, &contract, None).await.unwrap();

        // then
        assert!(below.is_newbee_only);
        assert!(!at.is_newbee_only);
    }

    #[tokio::test]
    async fn fetch_snapshot__missing_code_is_not_deployed_with_user_balance() {
        // given
        let chain = FakeChain::mainnet();
        chain.remove_code();
        chain.set_eth_balance(ALICE, ether(2));
        let contract = chain.contract();

        // when
        let result = fetch_snapshot(&chain, &contract, Some(ALICE)).await;

        // then
        assert_eq!(
            result,
            Err(SyncError::NotDeployed {
                user_eth_balance: Some("2".to_owned()),
            })
        );
        assert!(chain.calls().is_empty());
    }

    #[tokio::test]
    async fn fetch_snapshot__undecodable_first_read_is_not_deployed() {
        // given
        let chain = FakeChain::mainnet();
        chain.set_raw_response("round", ethers::types::Bytes::new());
        let contract = chain.contract();

        // when
        let result = fetch_snapshot(&chain, &contract, None).await;

        // then
        assert_eq!(
            result,
            Err(SyncError::NotDeployed {
                user_eth_balance: None,
            })
        );
    }

    #[tokio::test]
    async fn fetch_snapshot__later_decode_failure_is_reported() {
        // given
        let chain = FakeChain::mainnet();
        chain.set_raw_response("price", ethers::types::Bytes::from(vec![0x01]));
        let contract = chain.contract();

        // when
        let result = fetch_snapshot(&chain, &contract, None).await;

        // then
        assert!(matches!(result, Err(SyncError::Decode(_))));
    }

    #[tokio::test]
    async fn fetch_snapshot__rejects_counts_beyond_u64() {
        // given
        let chain = FakeChain::mainnet();
        chain.set_uint("entryCount", U256::from(u64::MAX) + 1);
        let contract = chain.contract();

        // when
        let result = fetch_snapshot(&chain, &contract, None).await;

        // then
        assert!(matches!(result, Err(SyncError::Decode(_))));
    }

    #[tokio::test]
    async fn fetch_snapshot__twice_without_changes_is_identical() {
        // given
        let chain = FakeChain::mainnet();
        chain.set_token_balance(ALICE, ether(3));
        let contract = chain.contract();

        // when
        let first = fetch_snapshot(&chain, &contract, Some(ALICE)).await.unwrap();
        let second = fetch_snapshot(&chain, &contract, Some(ALICE)).await.unwrap();

        // then
        assert_eq!(first, second);
    }

    #[test]
    fn apply__drops_result_from_previous_generation() {
        // given
        let mut sync = StateSynchronizer::new();
        sync.on_connection_changed(1, None);
        let old_ticket = sync.ticket(FetchTrigger::Initial);
        sync.on_connection_changed(2, None);
        let mut fetched = ContractSnapshot::zeroed();
        fetched.round = 9;

        // when
        let outcome = sync.apply(&old_ticket, Ok(fetched));

        // then
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(sync.snapshot(), &ContractSnapshot::zeroed());
        assert_eq!(sync.phase(), &LoadPhase::InitialLoading);
    }

    #[test]
    fn apply__background_failure_keeps_ready_phase() {
        // given
        let mut sync = StateSynchronizer::new();
        sync.on_connection_changed(1, None);
        let initial = sync.ticket(FetchTrigger::Initial);
        sync.apply(&initial, Ok(ContractSnapshot::zeroed()));
        let background = sync.ticket(FetchTrigger::Background);
        sync.begin(&background);

        // when
        let outcome = sync.apply(
            &background,
            Err(SyncError::Network(TransportError::Transport("timeout".into()))),
        );

        // then
        assert!(matches!(outcome, ApplyOutcome::Failed(_)));
        assert_eq!(sync.phase(), &LoadPhase::Ready);
        assert!(!sync.is_refreshing());
    }

    #[test]
    fn apply__initial_failure_sets_error_and_retry_recovers() {
        // given
        let mut sync = StateSynchronizer::new();
        sync.on_connection_changed(1, None);
        let initial = sync.ticket(FetchTrigger::Initial);
        sync.apply(
            &initial,
            Err(SyncError::Network(TransportError::Transport("down".into()))),
        );
        assert!(matches!(sync.phase(), LoadPhase::InitialError { .. }));

        // when
        let retry = sync.ticket(FetchTrigger::Retry);
        sync.begin(&retry);
        let during = sync.phase().clone();
        sync.apply(&retry, Ok(ContractSnapshot::zeroed()));

        // then
        assert_eq!(during, LoadPhase::InitialLoading);
        assert_eq!(sync.phase(), &LoadPhase::Ready);
        assert!(!sync.needs_eager_fetch());
    }

    #[test]
    fn on_connection_changed__failed_initial_fetch_on_new_handle_sets_error() {
        // given
        let mut sync = StateSynchronizer::new();
        sync.on_connection_changed(1, None);
        let mut loaded = ContractSnapshot::zeroed();
        loaded.round = 7;
        let first = sync.ticket(FetchTrigger::Initial);
        sync.apply(&first, Ok(loaded));
        assert_eq!(sync.phase(), &LoadPhase::Ready);

        // when
        let changed = sync.on_connection_changed(2, None);
        let during = sync.phase().clone();
        let initial = sync.ticket(FetchTrigger::Initial);
        sync.apply(
            &initial,
            Err(SyncError::Network(TransportError::Transport("down".into()))),
        );

        // then
        assert!(changed);
        assert_eq!(during, LoadPhase::InitialLoading);
        assert!(matches!(sync.phase(), LoadPhase::InitialError { .. }));
        assert!(sync.needs_eager_fetch());
    }

    #[test]
    fn apply__background_success_does_not_finish_initial_load() {
        // given
        let mut sync = StateSynchronizer::new();
        sync.on_connection_changed(1, None);
        let background = sync.ticket(FetchTrigger::Background);

        // when
        sync.apply(&background, Ok(ContractSnapshot::zeroed()));

        // then
        assert_eq!(sync.phase(), &LoadPhase::InitialLoading);
        assert!(sync.needs_eager_fetch());
    }

    #[test]
    fn apply__not_deployed_resets_snapshot_and_keeps_eth_balance() {
        // given
        let mut sync = StateSynchronizer::new();
        sync.on_connection_changed(1, Some(ALICE));
        let mut loaded = ContractSnapshot::zeroed();
        loaded.round = 4;
        let first = sync.ticket(FetchTrigger::Initial);
        sync.apply(&first, Ok(loaded));
        let manual = sync.ticket(FetchTrigger::Manual);
        sync.begin(&manual);

        // when
        let outcome = sync.apply(
            &manual,
            Err(SyncError::NotDeployed {
                user_eth_balance: Some("0.3".to_owned()),
            }),
        );

        // then
        assert_eq!(outcome, ApplyOutcome::NotDeployed);
        assert_eq!(sync.snapshot().round, 0);
        assert_eq!(
            sync.snapshot().user.as_ref().map(|u| u.eth_balance.as_str()),
            Some("0.3")
        );
        assert!(!sync.is_manual_refresh());
    }

    #[test]
    fn max_redeemable_tokens__divides_fee_pool_by_price() {
        // given
        let mut snapshot = ContractSnapshot::zeroed();
        snapshot.burn_fee = "1".to_owned();
        snapshot.price = "0.002".to_owned();

        // when
        let max = snapshot.max_redeemable_tokens();

        // then
        assert_eq!(max, "500");
        snapshot.price = "0".to_owned();
        assert_eq!(snapshot.max_redeemable_tokens(), "0");
    }

    #[test]
    fn max_redeemable_tokens__overflowing_fee_pool_reports_zero() {
        // given
        let mut snapshot = ContractSnapshot::zeroed();
        snapshot.burn_fee = format_amount(U256::exp10(60));
        snapshot.price = "1".to_owned();

        // when
        let max = snapshot.max_redeemable_tokens();

        // then
        assert_eq!(max, "0");
    }

    #[test]
    fn has_joined_current_epoch__ignores_older_epoch_membership() {
        // given
        let mut snapshot = ContractSnapshot::zeroed();
        snapshot.current_epoch_id = 5;
        let mut user = UserSnapshot::zeroed();
        user.epoch_id = 4;
        user.share = "3".to_owned();
        snapshot.user = Some(user);

        // then
        assert!(!snapshot.has_joined_current_epoch());
        assert_eq!(snapshot.current_epoch_share(), "0");
    }

    #[test]
    fn seconds_until_next_block__counts_down_and_floors_at_zero() {
        // given
        let mut snapshot = ContractSnapshot::zeroed();
        snapshot.last_block_timestamp = 1_000;

        // then
        assert_eq!(snapshot.seconds_until_next_block(1_100), 500);
        assert_eq!(snapshot.seconds_until_next_block(5_000), 0);
        snapshot.last_block_timestamp = 0;
        assert_eq!(snapshot.seconds_until_next_block(5_000), 0);
    }
}
