//! ABI surface of the mining contract.

use crate::chain::{
    Transport,
    TransportError,
};
use ethers::{
    abi::{
        Abi,
        Function,
        Token,
        parse_abi,
    },
    types::{
        Address,
        Bytes,
        U256,
    },
    utils::id,
};
use thiserror::Error;

/// Human-readable ABI of every function the client touches.
pub const MINER_ABI: &[&str] = &[
    "function round() view returns (uint256)",
    "function currentEpochId() view returns (uint256)",
    "function blockNum() view returns (uint256)",
    "function blockProfit() view returns (uint256)",
    "function entryCount() view returns (uint256)",
    "function shareSum() view returns (uint256)",
    "function price() view returns (uint256)",
    "function burnFee() view returns (uint256)",
    "function poolFee() view returns (uint256)",
    "function totalSupply() view returns (uint256)",
    "function totalBurned() view returns (uint256)",
    "function lastBlockTimestamp() view returns (uint256)",
    "function isNewbeeTime() view returns (bool)",
    "function userInfo(address) view returns (uint256 epochId, uint256 share, bool claimed)",
    "function getPendingReward(address player) view returns (uint256 tokenReward, uint256 ethReward)",
    "function balanceOf(address account) view returns (uint256)",
    "function decimals() view returns (uint8)",
    "function play() payable",
    "function claim()",
    "function burn(uint256 amount)",
];

#[derive(Debug, Error)]
#[error("invalid contract abi: {0}")]
pub struct AbiError(String);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub epoch_id: U256,
    pub share: U256,
    pub claimed: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingReward {
    pub token: U256,
    pub eth: U256,
}

#[derive(Clone, Debug)]
pub struct MinerContract {
    address: Address,
    abi: Abi,
}

impl MinerContract {
    pub fn new(address: Address) -> Result<Self, AbiError> {
        let abi = parse_abi(MINER_ABI).map_err(|err| AbiError(err.to_string()))?;
        Ok(Self { address, abi })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn function(&self, name: &str) -> Result<&Function, TransportError> {
        self.abi
            .function(name)
            .map_err(|err| TransportError::Decode(format!("{name}: {err}")))
    }

    pub fn encode_call(&self, name: &str, args: &[Token]) -> Result<Bytes, TransportError> {
        let data = self
            .function(name)?
            .encode_input(args)
            .map_err(|err| TransportError::Decode(format!("{name}: {err}")))?;
        Ok(Bytes::from(data))
    }

    /// Calls a view function and decodes its outputs against the declared types.
    pub async fn read(
        &self,
        transport: &dyn Transport,
        name: &str,
        args: &[Token],
    ) -> Result<Vec<Token>, TransportError> {
        let data = self.encode_call(name, args)?;
        let raw = transport.call(self.address, data).await?;
        let function = self.function(name)?;
        let tokens = function
            .decode_output(&raw)
            .map_err(|err| TransportError::Decode(format!("{name}: {err}")))?;
        if tokens.len() != function.outputs.len() {
            return Err(TransportError::Decode(format!(
                "{name}: expected {} outputs, got {}",
                function.outputs.len(),
                tokens.len()
            )));
        }
        Ok(tokens)
    }

    pub async fn read_uint(
        &self,
        transport: &dyn Transport,
        name: &str,
    ) -> Result<U256, TransportError> {
        let tokens = self.read(transport, name, &[]).await?;
        uint_at(name, &tokens, 0)
    }

    pub async fn read_bool(
        &self,
        transport: &dyn Transport,
        name: &str,
    ) -> Result<bool, TransportError> {
        let tokens = self.read(transport, name, &[]).await?;
        bool_at(name, &tokens, 0)
    }

    pub async fn balance_of(
        &self,
        transport: &dyn Transport,
        account: Address,
    ) -> Result<U256, TransportError> {
        let tokens = self
            .read(transport, "balanceOf", &[Token::Address(account)])
            .await?;
        uint_at("balanceOf", &tokens, 0)
    }

    pub async fn user_info(
        &self,
        transport: &dyn Transport,
        account: Address,
    ) -> Result<UserInfo, TransportError> {
        let tokens = self
            .read(transport, "userInfo", &[Token::Address(account)])
            .await?;
        Ok(UserInfo {
            epoch_id: uint_at("userInfo", &tokens, 0)?,
            share: uint_at("userInfo", &tokens, 1)?,
            claimed: bool_at("userInfo", &tokens, 2)?,
        })
    }

    pub async fn pending_reward(
        &self,
        transport: &dyn Transport,
        account: Address,
    ) -> Result<PendingReward, TransportError> {
        let tokens = self
            .read(transport, "getPendingReward", &[Token::Address(account)])
            .await?;
        Ok(PendingReward {
            token: uint_at("getPendingReward", &tokens, 0)?,
            eth: uint_at("getPendingReward", &tokens, 1)?,
        })
    }

    pub fn play_call(&self) -> Result<Bytes, TransportError> {
        self.encode_call("play", &[])
    }

    pub fn claim_call(&self) -> Result<Bytes, TransportError> {
        self.encode_call("claim", &[])
    }

    pub fn burn_call(&self, amount: U256) -> Result<Bytes, TransportError> {
        self.encode_call("burn", &[Token::Uint(amount)])
    }
}

fn uint_at(name: &str, tokens: &[Token], idx: usize) -> Result<U256, TransportError> {
    match tokens.get(idx) {
        Some(Token::Uint(value)) => Ok(*value),
        other => Err(TransportError::Decode(format!(
            "{name}: expected uint at output {idx}, got {other:?}"
        ))),
    }
}

fn bool_at(name: &str, tokens: &[Token], idx: usize) -> Result<bool, TransportError> {
    match tokens.get(idx) {
        Some(Token::Bool(value)) => Ok(*value),
        other => Err(TransportError::Decode(format!(
            "{name}: expected bool at output {idx}, got {other:?}"
        ))),
    }
}

/// Custom errors the contract reverts with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContractRevert {
    InvalidEntryFee,
    AlreadyJoined,
    OnlyNewbiesAllowed,
    AmountMustBeGreaterThanZero,
    InsufficientBalance,
    PriceNotSet,
    InsufficientBurnFee,
    EthTransferFailed,
    NoPlayersInBlock,
    EpochNotFinalized,
    DevFeeTransferFailed,
}

impl ContractRevert {
    pub const ALL: [ContractRevert; 11] = [
        ContractRevert::InvalidEntryFee,
        ContractRevert::AlreadyJoined,
        ContractRevert::OnlyNewbiesAllowed,
        ContractRevert::AmountMustBeGreaterThanZero,
        ContractRevert::InsufficientBalance,
        ContractRevert::PriceNotSet,
        ContractRevert::InsufficientBurnFee,
        ContractRevert::EthTransferFailed,
        ContractRevert::NoPlayersInBlock,
        ContractRevert::EpochNotFinalized,
        ContractRevert::DevFeeTransferFailed,
    ];

    pub fn signature(self) -> &'static str {
        match self {
            ContractRevert::InvalidEntryFee => "InvalidEntryFee()",
            ContractRevert::AlreadyJoined => "AlreadyJoined()",
            ContractRevert::OnlyNewbiesAllowed => "OnlyNewbiesAllowed()",
            ContractRevert::AmountMustBeGreaterThanZero => "AmountMustBeGreaterThanZero()",
            ContractRevert::InsufficientBalance => "InsufficientBalance()",
            ContractRevert::PriceNotSet => "PriceNotSet()",
            ContractRevert::InsufficientBurnFee => "InsufficientBurnFee()",
            ContractRevert::EthTransferFailed => "ETHTransferFailed()",
            ContractRevert::NoPlayersInBlock => "NoPlayersInBlock()",
            ContractRevert::EpochNotFinalized => "EpochNotFinalized()",
            ContractRevert::DevFeeTransferFailed => "DevFeeTransferFailed()",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ContractRevert::InvalidEntryFee => "Entry fee must be exactly 0.001 ETH",
            ContractRevert::AlreadyJoined => "You have already joined this epoch",
            ContractRevert::OnlyNewbiesAllowed => {
                "Only newbies allowed during protection period"
            }
            ContractRevert::AmountMustBeGreaterThanZero => "Amount must be greater than zero",
            ContractRevert::InsufficientBalance => "Insufficient balance",
            ContractRevert::PriceNotSet => "Price not set yet",
            ContractRevert::InsufficientBurnFee => "Insufficient burn fee in contract",
            ContractRevert::EthTransferFailed => "ETH transfer failed",
            ContractRevert::NoPlayersInBlock => "No players in block",
            ContractRevert::EpochNotFinalized => "Epoch not finalized yet",
            ContractRevert::DevFeeTransferFailed => "Dev fee transfer failed",
        }
    }

    pub fn selector(self) -> [u8; 4] {
        id(self.signature())
    }

    pub fn from_revert_data(data: &[u8]) -> Option<Self> {
        let selector = data.get(..4)?;
        Self::ALL
            .into_iter()
            .find(|revert| revert.selector() == selector)
    }

    /// Revert data for this error, as a node would return it.
    pub fn encode(self) -> Bytes {
        Bytes::from(self.selector().to_vec())
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::test_helpers::FakeChain;
    use ethers::abi::encode;

    fn contract() -> MinerContract {
        MinerContract::new(Address::repeat_byte(0x11)).expect("abi parses")
    }

    #[test]
    fn new__parses_every_declared_function() {
        // when
        let contract = contract();

        // then
        for name in ["round", "userInfo", "getPendingReward", "play", "claim", "burn"] {
            assert!(contract.function(name).is_ok(), "missing {name}");
        }
    }

    #[test]
    fn burn_call__encodes_selector_and_amount() {
        // given
        let contract = contract();
        let amount = U256::from(1_500_000_000_000_000_000u128);

        // when
        let data = contract.burn_call(amount).unwrap();

        // then
        assert_eq!(&data[..4], &id("burn(uint256)"));
        assert_eq!(&data[4..], encode(&[Token::Uint(amount)]).as_slice());
    }

    #[test]
    fn from_revert_data__maps_known_selectors_to_messages() {
        // given
        let data = ContractRevert::AlreadyJoined.encode();

        // when
        let revert = ContractRevert::from_revert_data(&data);

        // then
        assert_eq!(revert, Some(ContractRevert::AlreadyJoined));
        assert_eq!(
            revert.map(ContractRevert::message),
            Some("You have already joined this epoch")
        );
    }

    #[test]
    fn from_revert_data__rejects_unknown_or_short_payloads() {
        assert_eq!(ContractRevert::from_revert_data(&[0xde, 0xad, 0xbe, 0xef]), None);
        assert_eq!(ContractRevert::from_revert_data(&[0x01]), None);
    }

    #[tokio::test]
    async fn user_info__decodes_tuple_outputs() {
        // given
        let account = Address::repeat_byte(0xaa);
        let chain = FakeChain::mainnet();
        chain.set_user_info(account, 4, 7, true);
        let contract = chain.contract();

        // when
        let info = contract.user_info(&chain, account).await.unwrap();

        // then
        assert_eq!(
            info,
            UserInfo {
                epoch_id: U256::from(4),
                share: U256::from(7),
                claimed: true,
            }
        );
    }

    #[tokio::test]
    async fn read_uint__reports_decode_error_for_empty_response() {
        // given
        let chain = FakeChain::mainnet();
        chain.set_raw_response("round", Bytes::new());
        let contract = chain.contract();

        // when
        let result = contract.read_uint(&chain, "round").await;

        // then
        assert!(matches!(result, Err(TransportError::Decode(_))));
    }
}
