//! Exact-output swap router: command set, pool book, and revert payloads.
//!
//! The settlement engine converts currencies by handing the router an ordered
//! command sequence, mirroring how a universal-router style contract is
//! driven on-chain. Pools are constant-price with a liquidity cap — enough to
//! exercise exact-output accounting, input-ceiling enforcement, and every
//! failure shape the orchestrator must remap.
//!
//! Router failures are raw revert payloads ([`RouterRevert`]): either a
//! human-readable reason string or ABI-encoded custom error data whose
//! 4-byte selector the orchestrator may recognize.

use alloy_primitives::{Address, Bytes, U256, address};
use alloy_sol_types::{SolError, sol};
use std::collections::HashMap;

/// Deployed address of the swap router on the simulated ledger.
pub const ROUTER_ADDRESS: Address = address!("0x3fC91A3afd70395Cd496C647d5a6CC9D4B2b7FAD");

sol! {
    /// No pool exists for the requested pair and fee tier.
    error V3InvalidSwap();
    /// Pool liquidity cannot produce the requested output.
    error V3TooLittleReceived();
    /// The required input exceeds the caller's stated maximum.
    error V3TooMuchRequested();
    /// The router does not hold enough of the input token.
    error InsufficientToken();
    /// The router does not hold enough native currency.
    error InsufficientETH();
}

/// One step of a router execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterCommand {
    /// Wrap `amount` of the router's native balance into the wrapped token.
    WrapNative { amount: U256 },
    /// Swap at most `amount_in_max` of `token_in` for exactly `amount_out`
    /// of `token_out`, credited to `recipient`.
    V3SwapExactOut {
        recipient: Address,
        amount_out: U256,
        amount_in_max: U256,
        token_in: Address,
        token_out: Address,
        fee: u32,
    },
    /// Send `amount` of `token` from the router to `recipient`.
    TransferToken {
        token: Address,
        recipient: Address,
        amount: U256,
    },
    /// Send `amount` native from the router to `recipient`.
    TransferNative { recipient: Address, amount: U256 },
    /// Unwrap the router's entire wrapped balance to `recipient`, requiring
    /// at least `amount_min`.
    UnwrapNative {
        recipient: Address,
        amount_min: U256,
    },
    /// Send the router's entire remaining balance of `token` to `recipient`.
    /// A zero balance is not an error.
    Sweep { token: Address, recipient: Address },
}

/// A raw router revert, exactly as an on-chain caller would observe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterRevert {
    /// `Error(string)`-style revert reason.
    Reason(String),
    /// ABI-encoded custom error or arbitrary opaque data.
    Data(Bytes),
}

impl RouterRevert {
    pub(crate) fn error<E: SolError>(error: E) -> Self {
        RouterRevert::Data(Bytes::from(error.abi_encode()))
    }
}

/// A constant-price pool quoting exact-output swaps.
#[derive(Debug, Clone)]
pub struct Pool {
    /// Input units per `price_den` output units.
    pub price_num: U256,
    pub price_den: U256,
    /// Liquidity cap: the most output the pool can produce.
    pub max_out: U256,
}

impl Pool {
    /// Input required to obtain exactly `amount_out`, rounded up.
    pub fn quote_exact_out(&self, amount_out: U256) -> U256 {
        (amount_out * self.price_num).div_ceil(self.price_den)
    }
}

/// The router's configuration on the simulated ledger: its pool book plus a
/// failure-injection hook for tests.
#[derive(Debug, Clone, Default)]
pub struct RouterState {
    pools: HashMap<(Address, Address, u32), Pool>,
    /// When set, every execution reverts with exactly these bytes.
    pub revert_with: Option<Bytes>,
}

impl RouterState {
    /// Registers a directed pool from `token_in` to `token_out` at `fee`.
    pub fn add_pool(&mut self, token_in: Address, token_out: Address, fee: u32, pool: Pool) {
        self.pools.insert((token_in, token_out, fee), pool);
    }

    pub fn pool(&self, token_in: Address, token_out: Address, fee: u32) -> Option<&Pool> {
        self.pools.get(&(token_in, token_out, fee))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_rounds_up() {
        let pool = Pool {
            price_num: U256::from(3),
            price_den: U256::from(2),
            max_out: U256::from(1_000_000),
        };
        // 100 out at 1.5 in/out = 150 in
        assert_eq!(pool.quote_exact_out(U256::from(100)), U256::from(150));
        // 101 out = 151.5, rounded up to 152
        assert_eq!(pool.quote_exact_out(U256::from(101)), U256::from(152));
    }

    #[test]
    fn test_selector_encoding_is_four_byte_prefixed() {
        let revert = RouterRevert::error(V3TooMuchRequested {});
        match revert {
            RouterRevert::Data(data) => {
                assert_eq!(data.len(), 4);
                assert_eq!(&data[..4], V3TooMuchRequested::SELECTOR);
            }
            RouterRevert::Reason(_) => panic!("expected data revert"),
        }
    }
}
