//! Ledger event log entries.
//!
//! Every successful state transition of the settlement engine appends one
//! entry to [`ChainState::events`](crate::chain::ChainState). The entries
//! mirror the on-chain event surface: one [`Event::Transferred`] per settled
//! intent, registration lifecycle events, and sweep receipts.

use alloy_primitives::{Address, FixedBytes, U256};
use serde::{Deserialize, Serialize};

/// Sixteen opaque bytes identifying an intent, unique per operator.
pub type IntentId = FixedBytes<16>;

/// An event appended to the simulated ledger's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Event {
    /// Emitted exactly once per successful settlement.
    #[serde(rename_all = "camelCase")]
    Transferred {
        /// Operator that authored and signed the intent.
        operator: Address,
        /// Intent identifier, unique per operator.
        id: IntentId,
        /// Destination that received `recipient_amount`.
        recipient: Address,
        /// The paying sender that submitted the settlement call.
        sender: Address,
        /// Total amount the payer actually spent, in `spent_currency`.
        spent_amount: U256,
        /// Currency the payer spent. [`Address::ZERO`] denotes the native currency.
        spent_currency: Address,
        /// Amount delivered to the recipient.
        recipient_amount: U256,
        /// Currency delivered to the recipient. [`Address::ZERO`] denotes native.
        recipient_currency: Address,
    },
    /// Emitted when an operator registers a fee destination.
    #[serde(rename_all = "camelCase")]
    OperatorRegistered {
        operator: Address,
        fee_destination: Address,
    },
    /// Emitted when an operator clears its registration.
    #[serde(rename_all = "camelCase")]
    OperatorUnregistered { operator: Address },
    /// Emitted on every successful recovery-sweep operation.
    #[serde(rename_all = "camelCase")]
    Swept {
        /// Currency swept. [`Address::ZERO`] denotes the native currency.
        currency: Address,
        /// Destination the stray balance was sent to.
        destination: Address,
        amount: U256,
    },
}
