//! Deterministic settlement engine for operator-signed payment intents.
//!
//! This crate implements merchant payment settlement against a simulated
//! EVM-style ledger: an operator signs a payment intent off-chain over an
//! EIP-712 message, any payer submits it, and the engine delivers exactly
//! the signed amounts to the merchant and the operator's fee destination —
//! converting currencies on the way when the payer holds something other
//! than what the merchant wants.
//!
//! # Overview
//!
//! A [`TransferIntent`](intent::TransferIntent) fixes the recipient, the
//! currency and amount it must receive, the operator fee, a deadline, and a
//! single-use id. The [`Transfers`](settlement::Transfers) engine exposes
//! ten entry points covering every combination of input currency, approval
//! mechanism, and conversion:
//!
//! - direct settlement in native currency or tokens, funded by attached
//!   value, a signed delegated transfer, or a pre-existing allowance;
//! - wrap and unwrap paths between native currency and its wrapped token;
//! - exact-output swap paths that convert the payer's currency into the
//!   intent's, refunding unconsumed input in the same call;
//! - a subsidized path where a relayer carries gas for a permit-signing
//!   token owner.
//!
//! Every settlement is atomic: a single reentrancy guard covers all entry
//! points, the ledger is snapshotted on entry and restored wholesale on any
//! failure, and a delivered amount that differs from the signed amount by
//! even one unit aborts the call.
//!
//! # Modules
//!
//! - [`chain`] — The simulated ledger: token contracts, the wrapped-native
//!   token, the signature-transfer engine, and the exact-output swap router.
//! - [`events`] — Observable settlement events and the intent id type.
//! - [`intent`] — Intent wire format, EIP-712 signing, and recovery.
//! - [`settlement`] — The settlement engine, its error taxonomy, and the
//!   swap orchestrator.
//! - [`timestamp`] — Unix timestamp type for deadlines and the block clock.

pub mod chain;
pub mod events;
pub mod intent;
pub mod settlement;
pub mod timestamp;

pub use chain::{CallContext, ChainState};
pub use events::{Event, IntentId};
pub use intent::{TransferIntent, UnsignedTransferIntent};
pub use settlement::{
    NATIVE_CURRENCY, PermitPayload, TransferError, Transfers, TransfersConfig,
};
pub use timestamp::UnixTimestamp;
