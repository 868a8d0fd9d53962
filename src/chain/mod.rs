//! The simulated ledger the settlement engine executes against.
//!
//! [`ChainState`] is a deterministic, single-threaded world model: native
//! balances, deployed token contracts, the wrapped-native token, the
//! signature-transfer engine's nonce state, the swap router's pool book, and
//! an append-only event log. It is `Clone`, which is what gives the
//! settlement engine transaction semantics — snapshot on entry, restore
//! wholesale on failure.

use alloy_primitives::{Address, U256, address};
use std::collections::HashMap;

use crate::events::Event;
use crate::timestamp::UnixTimestamp;

pub mod erc20;
pub mod permit2;
pub mod uniswap;

pub use erc20::{
    Erc20, FalseReturningToken, FeeOnTransferToken, RebasingToken, StandardErc20,
    StuckPermitToken, sign_permit,
};
pub use permit2::{
    PERMIT2_ADDRESS, Permit2, Permit2Error, SignedTransferAuthorization,
    sign_transfer_authorization,
};
pub use uniswap::{Pool, ROUTER_ADDRESS, RouterCommand, RouterRevert, RouterState};

use uniswap::{InsufficientETH, InsufficientToken, V3InvalidSwap, V3TooLittleReceived,
    V3TooMuchRequested};

/// The wrapped-native token deployment on the simulated ledger.
pub const WETH_ADDRESS: Address = address!("0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2");

/// Per-call execution context: who submitted the call and how much native
/// currency was attached.
#[derive(Debug, Clone, Copy)]
pub struct CallContext {
    pub sender: Address,
    pub value: U256,
}

impl CallContext {
    pub fn new(sender: Address) -> Self {
        Self {
            sender,
            value: U256::ZERO,
        }
    }

    pub fn with_value(sender: Address, value: U256) -> Self {
        Self { sender, value }
    }
}

/// The complete mutable world state of the simulated ledger.
#[derive(Clone)]
pub struct ChainState {
    pub chain_id: u64,
    /// The block clock. All expiry checks compare against this, never the
    /// host's wall clock.
    pub timestamp: UnixTimestamp,
    native: HashMap<Address, U256>,
    tokens: HashMap<Address, Box<dyn Erc20>>,
    /// Address of the wrapped-native token, deployed at construction.
    pub weth: Address,
    pub permit2: Permit2,
    pub router: RouterState,
    pub events: Vec<Event>,
}

impl ChainState {
    /// Creates a fresh ledger with the wrapped-native token deployed.
    pub fn new(chain_id: u64, timestamp: UnixTimestamp) -> Self {
        let mut chain = Self {
            chain_id,
            timestamp,
            native: HashMap::new(),
            tokens: HashMap::new(),
            weth: WETH_ADDRESS,
            permit2: Permit2::default(),
            router: RouterState::default(),
            events: Vec::new(),
        };
        chain.deploy_token(Box::new(StandardErc20::new(WETH_ADDRESS, "Wrapped Ether")));
        chain
    }

    pub fn advance_time(&mut self, secs: u64) {
        self.timestamp = self.timestamp + secs;
    }

    /// Deploys a token contract at its self-reported address.
    pub fn deploy_token(&mut self, token: Box<dyn Erc20>) -> Address {
        let address = token.address();
        self.tokens.insert(address, token);
        address
    }

    pub fn token(&self, address: Address) -> Option<&dyn Erc20> {
        self.tokens.get(&address).map(|token| token.as_ref())
    }

    pub fn token_mut(&mut self, address: Address) -> Option<&mut dyn Erc20> {
        self.tokens.get_mut(&address).map(|token| &mut **token as &mut dyn Erc20)
    }

    /// Token balance, or zero for an unknown token.
    pub fn balance_of(&self, token: Address, owner: Address) -> U256 {
        self.token(token)
            .map(|token| token.balance_of(owner))
            .unwrap_or_default()
    }

    pub fn native_balance(&self, owner: Address) -> U256 {
        self.native.get(&owner).copied().unwrap_or_default()
    }

    /// Credits native currency out of thin air. Fixture setup only.
    pub fn mint_native(&mut self, owner: Address, amount: U256) {
        *self.native.entry(owner).or_default() += amount;
    }

    /// Moves native currency; `false` models a failed low-level call.
    #[must_use]
    pub fn transfer_native(&mut self, from: Address, to: Address, amount: U256) -> bool {
        let balance = self.native_balance(from);
        if balance < amount {
            return false;
        }
        self.native.insert(from, balance - amount);
        *self.native.entry(to).or_default() += amount;
        true
    }

    /// Wraps `amount` of `owner`'s native balance into the wrapped token.
    #[must_use]
    pub fn wrap_native(&mut self, owner: Address, amount: U256) -> bool {
        let balance = self.native_balance(owner);
        if balance < amount {
            return false;
        }
        self.native.insert(owner, balance - amount);
        let weth = self.weth;
        if let Some(token) = self.token_mut(weth) {
            token.mint(owner, amount);
            true
        } else {
            false
        }
    }

    /// Burns `amount` of `owner`'s wrapped balance and credits native to `to`.
    #[must_use]
    pub fn unwrap_native(&mut self, owner: Address, amount: U256, to: Address) -> bool {
        let weth = self.weth;
        let burned = self
            .token_mut(weth)
            .map(|token| token.burn(owner, amount))
            .unwrap_or(false);
        if !burned {
            return false;
        }
        *self.native.entry(to).or_default() += amount;
        true
    }

    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Executes a signed delegated transfer through the signature-transfer
    /// engine, consuming the nonce on success.
    pub fn permit2_transfer(
        &mut self,
        auth: &SignedTransferAuthorization,
        spender: Address,
    ) -> Result<(), Permit2Error> {
        self.permit2
            .validate(auth, spender, self.chain_id, self.timestamp)?;
        self.permit2.consume(auth.owner, auth.nonce);
        let moved = self
            .token_mut(auth.token)
            .ok_or(Permit2Error::UnknownToken(auth.token))?
            .transfer_from(PERMIT2_ADDRESS, auth.owner, auth.to, auth.requested_amount);
        if moved {
            Ok(())
        } else {
            Err(Permit2Error::TransferFailed)
        }
    }

    /// Runs a router command sequence atomically from the caller's
    /// perspective: the first failing command aborts with a raw revert.
    ///
    /// `value` native currency is forwarded from `caller` to the router
    /// before the first command runs.
    pub fn execute_router(
        &mut self,
        caller: Address,
        value: U256,
        deadline: UnixTimestamp,
        commands: &[RouterCommand],
    ) -> Result<(), RouterRevert> {
        if let Some(data) = self.router.revert_with.clone() {
            return Err(RouterRevert::Data(data));
        }
        if deadline < self.timestamp {
            return Err(RouterRevert::Reason("Transaction too old".to_string()));
        }
        if value > U256::ZERO && !self.transfer_native(caller, ROUTER_ADDRESS, value) {
            return Err(RouterRevert::error(InsufficientETH {}));
        }
        for command in commands {
            self.execute_router_command(command)?;
        }
        Ok(())
    }

    fn execute_router_command(&mut self, command: &RouterCommand) -> Result<(), RouterRevert> {
        match command {
            RouterCommand::WrapNative { amount } => {
                if self.wrap_native(ROUTER_ADDRESS, *amount) {
                    Ok(())
                } else {
                    Err(RouterRevert::error(InsufficientETH {}))
                }
            }
            RouterCommand::V3SwapExactOut {
                recipient,
                amount_out,
                amount_in_max,
                token_in,
                token_out,
                fee,
            } => {
                let pool = self
                    .router
                    .pool(*token_in, *token_out, *fee)
                    .cloned()
                    .ok_or_else(|| RouterRevert::error(V3InvalidSwap {}))?;
                if *amount_out > pool.max_out {
                    return Err(RouterRevert::error(V3TooLittleReceived {}));
                }
                let amount_in = pool.quote_exact_out(*amount_out);
                if amount_in > *amount_in_max {
                    return Err(RouterRevert::error(V3TooMuchRequested {}));
                }
                let paid = self
                    .token_mut(*token_in)
                    .map(|token| token.burn(ROUTER_ADDRESS, amount_in))
                    .unwrap_or(false);
                if !paid {
                    return Err(RouterRevert::error(InsufficientToken {}));
                }
                self.token_mut(*token_out)
                    .ok_or_else(|| RouterRevert::error(V3InvalidSwap {}))?
                    .mint(*recipient, *amount_out);
                Ok(())
            }
            RouterCommand::TransferToken {
                token,
                recipient,
                amount,
            } => {
                let moved = self
                    .token_mut(*token)
                    .map(|t| t.transfer(ROUTER_ADDRESS, *recipient, *amount))
                    .unwrap_or(false);
                if moved {
                    Ok(())
                } else {
                    Err(RouterRevert::error(InsufficientToken {}))
                }
            }
            RouterCommand::TransferNative { recipient, amount } => {
                if self.transfer_native(ROUTER_ADDRESS, *recipient, *amount) {
                    Ok(())
                } else {
                    Err(RouterRevert::error(InsufficientETH {}))
                }
            }
            RouterCommand::UnwrapNative {
                recipient,
                amount_min,
            } => {
                let balance = self.balance_of(self.weth, ROUTER_ADDRESS);
                if balance < *amount_min {
                    return Err(RouterRevert::error(InsufficientETH {}));
                }
                if balance > U256::ZERO && !self.unwrap_native(ROUTER_ADDRESS, balance, *recipient)
                {
                    return Err(RouterRevert::error(InsufficientETH {}));
                }
                Ok(())
            }
            RouterCommand::Sweep { token, recipient } => {
                let balance = self.balance_of(*token, ROUTER_ADDRESS);
                if balance > U256::ZERO {
                    let moved = self
                        .token_mut(*token)
                        .map(|t| t.transfer(ROUTER_ADDRESS, *recipient, balance))
                        .unwrap_or(false);
                    if !moved {
                        return Err(RouterRevert::error(InsufficientToken {}));
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_signer_local::PrivateKeySigner;

    fn chain() -> ChainState {
        ChainState::new(8453, UnixTimestamp::from_secs(1_000_000))
    }

    #[test]
    fn test_wrap_then_unwrap_roundtrip() {
        let mut chain = chain();
        let owner = Address::repeat_byte(1);
        chain.mint_native(owner, U256::from(100));
        assert!(chain.wrap_native(owner, U256::from(60)));
        assert_eq!(chain.native_balance(owner), U256::from(40));
        assert_eq!(chain.balance_of(chain.weth, owner), U256::from(60));
        assert!(chain.unwrap_native(owner, U256::from(60), owner));
        assert_eq!(chain.native_balance(owner), U256::from(100));
    }

    #[test]
    fn test_permit2_transfer_end_to_end() {
        let mut chain = chain();
        let payer = PrivateKeySigner::random();
        let spender = Address::repeat_byte(0x77);
        let token = chain.deploy_token(Box::new(StandardErc20::new(
            Address::repeat_byte(0xaa),
            "Test Coin",
        )));
        chain.token_mut(token).unwrap().mint(payer.address(), U256::from(500));
        chain
            .token_mut(token)
            .unwrap()
            .approve(payer.address(), PERMIT2_ADDRESS, U256::MAX);

        let auth = sign_transfer_authorization(
            &payer,
            token,
            U256::from(200),
            U256::from(1),
            chain.timestamp + 600,
            spender,
            U256::from(200),
            spender,
            chain.chain_id,
        )
        .unwrap();
        chain.permit2_transfer(&auth, spender).unwrap();
        assert_eq!(chain.balance_of(token, spender), U256::from(200));
        // Nonce is now consumed.
        assert_eq!(
            chain.permit2_transfer(&auth, spender),
            Err(Permit2Error::InvalidNonce(U256::from(1)))
        );
    }

    #[test]
    fn test_router_exact_out_swap() {
        let mut chain = chain();
        let token_out = chain.deploy_token(Box::new(StandardErc20::new(
            Address::repeat_byte(0xbb),
            "Out Coin",
        )));
        chain.router.add_pool(
            chain.weth,
            token_out,
            500,
            Pool {
                price_num: U256::from(2),
                price_den: U256::from(1),
                max_out: U256::from(1_000_000),
            },
        );
        let caller = Address::repeat_byte(1);
        chain.mint_native(caller, U256::from(1000));
        let recipient = Address::repeat_byte(2);
        let weth = chain.weth;
        chain
            .execute_router(
                caller,
                U256::from(1000),
                chain.timestamp + 60,
                &[
                    RouterCommand::WrapNative {
                        amount: U256::from(1000),
                    },
                    RouterCommand::V3SwapExactOut {
                        recipient,
                        amount_out: U256::from(400),
                        amount_in_max: U256::from(1000),
                        token_in: weth,
                        token_out,
                        fee: 500,
                    },
                ],
            )
            .unwrap();
        assert_eq!(chain.balance_of(token_out, recipient), U256::from(400));
        // 400 out at 2 in/out consumed 800 in; 200 wrapped residual remains.
        assert_eq!(chain.balance_of(weth, ROUTER_ADDRESS), U256::from(200));
    }

    #[test]
    fn test_router_rejects_stale_deadline() {
        let mut chain = chain();
        let result = chain.execute_router(
            Address::repeat_byte(1),
            U256::ZERO,
            chain.timestamp - 1,
            &[],
        );
        assert_eq!(
            result,
            Err(RouterRevert::Reason("Transaction too old".to_string()))
        );
    }
}
