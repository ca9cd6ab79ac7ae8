//! Sequencing of user-initiated contract writes.

use crate::{
    CONFIRMATION_POLL_INTERVAL,
    CONFIRMATION_POLL_LIMIT,
    DEFAULT_SETTLE_DELAY,
    ENTRY_FEE_WEI,
    chain::{
        Transport,
        TxSigner,
    },
    contract::MinerContract,
    error::{
        ClientError,
        PreflightFailure,
    },
    sync::{
        ContractSnapshot,
        SyncError,
        fetch_snapshot,
    },
    units::parse_amount,
};
use ethers::types::{
    Address,
    Bytes,
    H256,
    U256,
};
use std::{
    fmt,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time,
};
use tracing::{
    error,
    info,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    Join,
    Claim,
    Redeem,
}

impl ActionKind {
    pub fn loading_message(self) -> &'static str {
        match self {
            ActionKind::Join => "Joining game...",
            ActionKind::Claim => "Claiming rewards...",
            ActionKind::Redeem => "Redeeming tokens...",
        }
    }

    pub fn success_message(self) -> &'static str {
        match self {
            ActionKind::Join => "Successfully joined the game!",
            ActionKind::Claim => "Rewards claimed successfully!",
            ActionKind::Redeem => "Tokens redeemed successfully!",
        }
    }

    pub fn failure_prefix(self) -> &'static str {
        match self {
            ActionKind::Join => "Failed to join",
            ActionKind::Claim => "Failed to claim",
            ActionKind::Redeem => "Redemption failed",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Join => write!(f, "join"),
            ActionKind::Claim => write!(f, "claim"),
            ActionKind::Redeem => write!(f, "redeem"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionPhase {
    PreflightCheck,
    Submitted,
    Confirming,
    Settling,
    Resyncing,
}

impl ActionPhase {
    pub fn status(self, kind: ActionKind) -> &'static str {
        match self {
            ActionPhase::PreflightCheck | ActionPhase::Submitted => kind.loading_message(),
            ActionPhase::Confirming => "Waiting for transaction confirmation...",
            ActionPhase::Settling | ActionPhase::Resyncing => "Refreshing data...",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingAction {
    pub kind: ActionKind,
    /// Decimal token amount, redeem only.
    pub amount: Option<String>,
    pub phase: ActionPhase,
}

/// Holds the process-wide in-flight flag.
#[derive(Debug, Default)]
pub struct ActionSequencer {
    in_flight: Option<PendingAction>,
}

impl ActionSequencer {
    pub fn try_begin(
        &mut self,
        kind: ActionKind,
        amount: Option<String>,
    ) -> Result<PendingAction, ClientError> {
        if self.in_flight.is_some() {
            return Err(ClientError::ActionInFlight);
        }
        let pending = PendingAction {
            kind,
            amount,
            phase: ActionPhase::PreflightCheck,
        };
        self.in_flight = Some(pending.clone());
        Ok(pending)
    }

    pub fn set_phase(&mut self, phase: ActionPhase) {
        if let Some(pending) = self.in_flight.as_mut() {
            pending.phase = phase;
        }
    }

    pub fn finish(&mut self) -> Option<PendingAction> {
        self.in_flight.take()
    }

    pub fn in_flight(&self) -> Option<&PendingAction> {
        self.in_flight.as_ref()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ConfirmationPolicy {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            poll_interval: CONFIRMATION_POLL_INTERVAL,
            max_polls: CONFIRMATION_POLL_LIMIT,
        }
    }
}

/// Everything an action needs, captured when it starts.
#[derive(Clone, Debug)]
pub struct ActionContext {
    pub transport: Arc<dyn Transport>,
    pub signer: Option<Arc<dyn TxSigner>>,
    pub contract: MinerContract,
    /// Last snapshot known when the action was triggered.
    pub snapshot: ContractSnapshot,
    pub settle_delay: Duration,
    pub confirmation: ConfirmationPolicy,
}

impl ActionContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        signer: Option<Arc<dyn TxSigner>>,
        contract: MinerContract,
        snapshot: ContractSnapshot,
    ) -> Self {
        Self {
            transport,
            signer,
            contract,
            snapshot,
            settle_delay: DEFAULT_SETTLE_DELAY,
            confirmation: ConfirmationPolicy::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ActionReport {
    pub tx_hash: H256,
    pub account: Address,
    /// Forced fetch after settling.
    pub resync: Result<ContractSnapshot, SyncError>,
}

/// Runs preflight, submission, confirmation, settle delay and resync in order.
/// The first failing step aborts the rest.
pub async fn run_action(
    ctx: &ActionContext,
    action: &PendingAction,
    progress: Option<&mpsc::UnboundedSender<ActionPhase>>,
) -> Result<ActionReport, ClientError> {
    let report = |phase: ActionPhase| {
        if let Some(tx) = progress {
            let _ = tx.send(phase);
        }
    };

    report(ActionPhase::PreflightCheck);
    let (signer, data, value) = preflight(ctx, action).await?;
    let account = signer.address();

    let tx_hash = signer
        .send_transaction(ctx.contract.address(), data, value)
        .await
        .inspect_err(|err| error!(kind = %action.kind, %err, "transaction submission failed"))?;
    info!(kind = %action.kind, ?tx_hash, "transaction submitted");
    report(ActionPhase::Submitted);

    report(ActionPhase::Confirming);
    wait_for_confirmation(ctx, tx_hash).await?;

    report(ActionPhase::Settling);
    time::sleep(ctx.settle_delay).await;

    report(ActionPhase::Resyncing);
    let resync = fetch_snapshot(ctx.transport.as_ref(), &ctx.contract, Some(account)).await;
    Ok(ActionReport {
        tx_hash,
        account,
        resync,
    })
}

async fn preflight(
    ctx: &ActionContext,
    action: &PendingAction,
) -> Result<(Arc<dyn TxSigner>, Bytes, U256), ClientError> {
    let code = ctx.transport.code_at(ctx.contract.address()).await?;
    if code.is_empty() {
        return Err(PreflightFailure::ContractMissing.into());
    }
    let signer = ctx
        .signer
        .clone()
        .ok_or(PreflightFailure::NotConnected)?;

    match action.kind {
        ActionKind::Join => {
            let fee = U256::from(ENTRY_FEE_WEI);
            let balance = ctx.transport.eth_balance(signer.address()).await?;
            if balance < fee {
                return Err(PreflightFailure::InsufficientEthBalance.into());
            }
            Ok((signer, ctx.contract.play_call()?, fee))
        }
        ActionKind::Claim => Ok((signer, ctx.contract.claim_call()?, U256::zero())),
        ActionKind::Redeem => {
            let amount = parse_amount(action.amount.as_deref().unwrap_or_default())
                .map_err(PreflightFailure::InvalidAmount)?;
            if amount.is_zero() {
                return Err(PreflightFailure::ZeroAmount.into());
            }
            let balance = ctx
                .snapshot
                .user
                .as_ref()
                .and_then(|user| parse_amount(&user.token_balance).ok())
                .unwrap_or_default();
            if amount > balance {
                return Err(PreflightFailure::InsufficientTokenBalance.into());
            }
            Ok((signer, ctx.contract.burn_call(amount)?, U256::zero()))
        }
    }
}

async fn wait_for_confirmation(ctx: &ActionContext, tx_hash: H256) -> Result<(), ClientError> {
    for _ in 0..ctx.confirmation.max_polls {
        match ctx.transport.receipt_status(tx_hash).await? {
            Some(true) => return Ok(()),
            Some(false) => {
                return Err(ClientError::ActionReverted {
                    reason: "Transaction reverted".to_owned(),
                });
            }
            None => time::sleep(ctx.confirmation.poll_interval).await,
        }
    }
    Err(ClientError::ActionTimeout)
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        chain::TransportError,
        error::describe_action_error,
        sync::UserSnapshot,
        test_helpers::{
            FakeChain,
            FakeSigner,
            ether,
        },
    };

    const ALICE: Address = Address::repeat_byte(0xa1);

    fn context(chain: &FakeChain, snapshot: ContractSnapshot) -> ActionContext {
        let mut ctx = ActionContext::new(
            Arc::new(chain.clone()),
            Some(Arc::new(FakeSigner::new(chain.clone(), ALICE))),
            chain.contract(),
            snapshot,
        );
        ctx.settle_delay = Duration::ZERO;
        ctx.confirmation = ConfirmationPolicy {
            poll_interval: Duration::ZERO,
            max_polls: 5,
        };
        ctx
    }

    fn pending(kind: ActionKind, amount: Option<&str>) -> PendingAction {
        PendingAction {
            kind,
            amount: amount.map(str::to_owned),
            phase: ActionPhase::PreflightCheck,
        }
    }

    fn with_tokens(balance: &str) -> ContractSnapshot {
        let mut snapshot = ContractSnapshot::zeroed();
        let mut user = UserSnapshot::zeroed();
        user.token_balance = balance.to_owned();
        snapshot.user = Some(user);
        snapshot
    }

    #[tokio::test]
    async fn run_action__join_with_exact_fee_submits_play() {
        // given
        let chain = FakeChain::mainnet();
        chain.set_eth_balance(ALICE, U256::from(ENTRY_FEE_WEI));
        let ctx = context(&chain, ContractSnapshot::zeroed());

        // when
        let report = run_action(&ctx, &pending(ActionKind::Join, None), None)
            .await
            .unwrap();

        // then
        let sent = chain.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].function, "play");
        assert_eq!(sent[0].value, U256::from(ENTRY_FEE_WEI));
        let resynced = report.resync.unwrap();
        assert!(resynced.has_joined_current_epoch());
    }

    #[tokio::test]
    async fn run_action__join_one_wei_short_fails_preflight() {
        // given
        let chain = FakeChain::mainnet();
        chain.set_eth_balance(ALICE, U256::from(ENTRY_FEE_WEI - 1));
        let ctx = context(&chain, ContractSnapshot::zeroed());

        // when
        let result = run_action(&ctx, &pending(ActionKind::Join, None), None).await;

        // then
        assert_eq!(
            result.unwrap_err(),
            ClientError::Preflight(PreflightFailure::InsufficientEthBalance)
        );
        assert!(chain.sent().is_empty());
    }

    #[tokio::test]
    async fn run_action__redeem_over_balance_submits_nothing() {
        // given
        let chain = FakeChain::mainnet();
        let ctx = context(&chain, with_tokens("5"));
        let action = pending(ActionKind::Redeem, Some("5.000000000000000001"));

        // when
        let result = run_action(&ctx, &action, None).await;

        // then
        assert_eq!(
            result.unwrap_err(),
            ClientError::Preflight(PreflightFailure::InsufficientTokenBalance)
        );
        assert!(chain.sent().is_empty());
    }

    #[tokio::test]
    async fn run_action__redeem_scales_decimal_amount() {
        // given
        let chain = FakeChain::mainnet();
        chain.set_token_balance(ALICE, ether(5));
        let ctx = context(&chain, with_tokens("5"));

        // when
        run_action(&ctx, &pending(ActionKind::Redeem, Some(".5")), None)
            .await
            .unwrap();

        // then
        assert_eq!(chain.sent()[0].function, "burn");
        let tokens = chain.contract();
        let after = tokens.balance_of(&chain, ALICE).await.unwrap();
        assert_eq!(after, ether(5) - ether(1) / 2);
    }

    #[tokio::test]
    async fn run_action__redeem_rejects_zero_and_malformed_amounts() {
        // given
        let chain = FakeChain::mainnet();
        let ctx = context(&chain, with_tokens("5"));

        // when
        let zero = run_action(&ctx, &pending(ActionKind::Redeem, Some("0.0")), None).await;
        let malformed = run_action(&ctx, &pending(ActionKind::Redeem, Some("1..2")), None).await;

        // then
        assert_eq!(
            zero.unwrap_err(),
            ClientError::Preflight(PreflightFailure::ZeroAmount)
        );
        assert!(matches!(
            malformed.unwrap_err(),
            ClientError::Preflight(PreflightFailure::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn run_action__requires_signer_and_deployed_contract() {
        // given
        let chain = FakeChain::mainnet();
        let mut unsigned = context(&chain, ContractSnapshot::zeroed());
        unsigned.signer = None;
        let missing = FakeChain::mainnet();
        missing.remove_code();
        let undeployed = context(&missing, ContractSnapshot::zeroed());

        // when
        let no_signer = run_action(&unsigned, &pending(ActionKind::Claim, None), None).await;
        let no_code = run_action(&undeployed, &pending(ActionKind::Claim, None), None).await;

        // then
        assert_eq!(
            no_signer.unwrap_err(),
            ClientError::Preflight(PreflightFailure::NotConnected)
        );
        assert_eq!(
            no_code.unwrap_err(),
            ClientError::Preflight(PreflightFailure::ContractMissing)
        );
    }

    #[tokio::test]
    async fn run_action__reports_phases_in_order() {
        // given
        let chain = FakeChain::mainnet();
        chain.set_receipt(2, true);
        let ctx = context(&chain, ContractSnapshot::zeroed());
        let (tx, mut rx) = mpsc::unbounded_channel();

        // when
        run_action(&ctx, &pending(ActionKind::Claim, None), Some(&tx))
            .await
            .unwrap();

        // then
        let mut phases = Vec::new();
        while let Ok(phase) = rx.try_recv() {
            phases.push(phase);
        }
        assert_eq!(
            phases,
            vec![
                ActionPhase::PreflightCheck,
                ActionPhase::Submitted,
                ActionPhase::Confirming,
                ActionPhase::Settling,
                ActionPhase::Resyncing,
            ]
        );
    }

    #[tokio::test]
    async fn run_action__reverted_receipt_and_timeout_are_distinct() {
        // given
        let reverted_chain = FakeChain::mainnet();
        reverted_chain.set_receipt(0, false);
        let slow_chain = FakeChain::mainnet();
        slow_chain.set_receipt(u32::MAX, true);

        // when
        let reverted = run_action(
            &context(&reverted_chain, ContractSnapshot::zeroed()),
            &pending(ActionKind::Claim, None),
            None,
        )
        .await;
        let timed_out = run_action(
            &context(&slow_chain, ContractSnapshot::zeroed()),
            &pending(ActionKind::Claim, None),
            None,
        )
        .await;

        // then
        assert!(matches!(
            reverted.unwrap_err(),
            ClientError::ActionReverted { .. }
        ));
        assert_eq!(timed_out.unwrap_err(), ClientError::ActionTimeout);
    }

    #[tokio::test]
    async fn run_action__submission_revert_is_classified() {
        // given
        let chain = FakeChain::mainnet();
        chain.set_send_error(TransportError::Rpc {
            code: 3,
            message: "execution reverted".to_owned(),
            data: Some(crate::contract::ContractRevert::EpochNotFinalized.encode()),
        });
        let ctx = context(&chain, ContractSnapshot::zeroed());

        // when
        let err = run_action(&ctx, &pending(ActionKind::Claim, None), None)
            .await
            .unwrap_err();

        // then
        assert_eq!(describe_action_error(&err), "Epoch not finalized yet");
    }

    #[test]
    fn try_begin__rejects_second_action_until_finished() {
        // given
        let mut sequencer = ActionSequencer::default();
        sequencer.try_begin(ActionKind::Join, None).unwrap();

        // when
        let second = sequencer.try_begin(ActionKind::Claim, None);
        sequencer.finish();
        let third = sequencer.try_begin(ActionKind::Claim, None);

        // then
        assert_eq!(second.unwrap_err(), ClientError::ActionInFlight);
        assert!(third.is_ok());
    }
}
