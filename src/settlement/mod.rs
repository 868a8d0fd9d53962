//! The settlement engine: intent validation, fund routing, and recovery.
//!
//! [`Transfers`] exposes ten entry points covering every (input currency,
//! approval mechanism, conversion need) combination; all of them funnel into
//! one internal pipeline parameterized by a funding source and a conversion
//! step, so the authenticate, acquire, convert, distribute, record sequence
//! exists exactly once.
//!
//! Guard order on every entry point: reentrancy exclusion → pause gate →
//! intent authentication → operator registration. Every call is atomic: the
//! ledger is snapshotted on entry and restored wholesale on any failure, so
//! no partial distribution or partial custody ever persists.

use alloy_primitives::{Address, Bytes, I256, U256};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::chain::{CallContext, ChainState, Permit2Error, SignedTransferAuthorization};
use crate::events::{Event, IntentId};
use crate::intent::TransferIntent;
use crate::timestamp::UnixTimestamp;

mod swap;

/// Sentinel currency address denoting the chain's native currency.
pub const NATIVE_CURRENCY: Address = Address::ZERO;

/// Terminal failure reasons. Every variant aborts the whole call with full
/// state rollback; nothing is retried internally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// Recovered signer does not match the intent's operator.
    #[error("invalid signature: recovered signer does not match the operator")]
    InvalidSignature,
    /// The chain clock has passed the intent's deadline. A call landing
    /// exactly at the deadline is still valid.
    #[error("intent expired at {deadline}, chain time is {now}")]
    ExpiredIntent {
        deadline: UnixTimestamp,
        now: UnixTimestamp,
    },
    #[error("intent recipient is the null address")]
    NullRecipient,
    /// The `(operator, id)` pair has already settled.
    #[error("intent {id} already processed for operator {operator}")]
    AlreadyProcessed { operator: Address, id: IntentId },
    #[error("operator {0} has no registered fee destination")]
    OperatorNotRegistered(Address),
    /// The entry point does not handle the intent's currency.
    #[error("entry point cannot settle currency {0}")]
    IncorrectCurrency(Address),
    /// Attached native value differs from the required exact amount.
    /// Positive means overpayment, negative underpayment.
    #[error("attached native value off by {0}")]
    InvalidNativeAmount(I256),
    /// The delegated-transfer payload disagrees with the intent
    /// (destination, token, or amount).
    #[error("transfer authorization does not match the intent")]
    InvalidTransferDetails,
    #[error("payer balance short by {shortfall}")]
    InsufficientBalance { shortfall: U256 },
    #[error("allowance short by {shortfall}")]
    InsufficientAllowance { shortfall: U256 },
    /// The signature-transfer engine rejected the authorization.
    #[error("signature transfer failed: {0}")]
    SignatureTransferFailed(Permit2Error),
    /// A token delivered a different amount than requested
    /// (fee-on-transfer, rebasing, or transfer-tax behavior).
    #[error("inexact transfer of {currency} to {target}: expected {expected}, actual {actual}")]
    InexactTransfer {
        currency: Address,
        target: Address,
        expected: U256,
        actual: U256,
    },
    /// A token transfer returned `false`; treated identically to a revert.
    #[error("token {currency} refused transfer of {amount} to {to}")]
    TokenTransferFailed {
        currency: Address,
        to: Address,
        amount: U256,
    },
    /// The swap engine reverted with a recognized or string reason.
    #[error("swap failed: {0}")]
    SwapFailedString(String),
    /// The swap engine reverted with opaque data, preserved for diagnosis.
    #[error("swap failed with opaque revert data")]
    SwapFailedBytes(Bytes),
    /// The permit call reverted, returned `false`, or did not advance the
    /// owner's nonce by exactly one. All three are treated identically.
    #[error("permit call failed")]
    PermitCallFailed,
    #[error("failed to send {amount} native to {destination}")]
    NativeTransferFailed {
        destination: Address,
        amount: U256,
    },
    #[error("settlement is paused")]
    Paused,
    #[error("reentrant call")]
    ReentrantCall,
    #[error("caller is not the owner")]
    NotOwner,
    #[error("caller is not the sweeper")]
    NotSweeper,
    #[error("destination is the null address")]
    NullDestination,
    #[error("nothing to sweep")]
    NothingToSweep,
}

/// An EIP-2612 permit funding payload for the subsidized path: the token
/// owner signed a permit for the settlement contract; a relayer submits the
/// call and carries the gas.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermitPayload {
    /// The token owner whose funds settle the intent.
    pub owner: Address,
    /// Permit deadline, as signed.
    pub deadline: UnixTimestamp,
    /// 65-byte recoverable signature over the token's permit message.
    pub signature: Bytes,
}

/// Deployment parameters for the settlement engine.
#[derive(Debug, Clone)]
pub struct TransfersConfig {
    /// The contract identity intents are signed against.
    pub address: Address,
    /// Role allowed to pause/unpause and to rotate the sweeper.
    pub owner: Address,
    /// Role allowed to run recovery sweeps.
    pub sweeper: Address,
    /// Optional seeded operator registration: (operator, fee destination).
    pub initial_operator: Option<(Address, Address)>,
}

/// How the settlement acquires the payer's funds.
enum Funding<'a> {
    /// Implicit: the native value attached to the call.
    Native,
    /// A single-use signed delegated transfer.
    SignedTransfer(&'a SignedTransferAuthorization),
    /// A pre-existing direct allowance from the caller.
    PreApproved,
    /// Permit-then-transfer, funds owned by a third party.
    Permit(&'a PermitPayload),
}

/// What happens between acquiring funds and distributing them.
enum Conversion {
    None,
    Wrap,
    Unwrap,
    Swap {
        /// Input token; `None` means native currency.
        token_in: Option<Address>,
        max_willing_to_pay: U256,
        pool_fee: u32,
    },
}

/// The settlement engine.
pub struct Transfers {
    address: Address,
    owner: Address,
    sweeper: Address,
    paused: bool,
    entered: bool,
    fee_destinations: HashMap<Address, Address>,
    processed: HashMap<Address, HashSet<IntentId>>,
}

impl Transfers {
    pub fn new(config: TransfersConfig) -> Self {
        let mut fee_destinations = HashMap::new();
        if let Some((operator, fee_destination)) = config.initial_operator {
            fee_destinations.insert(operator, fee_destination);
        }
        Self {
            address: config.address,
            owner: config.owner,
            sweeper: config.sweeper,
            paused: false,
            entered: false,
            fee_destinations,
            processed: HashMap::new(),
        }
    }

    /// The contract identity intents must be signed against.
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn fee_destination(&self, operator: Address) -> Option<Address> {
        self.fee_destinations.get(&operator).copied()
    }

    pub fn is_processed(&self, operator: Address, id: IntentId) -> bool {
        self.processed
            .get(&operator)
            .is_some_and(|ids| ids.contains(&id))
    }

    // ---- owner role -------------------------------------------------------

    pub fn pause(&mut self, ctx: CallContext) -> Result<(), TransferError> {
        if ctx.sender != self.owner {
            return Err(TransferError::NotOwner);
        }
        self.paused = true;
        Ok(())
    }

    pub fn unpause(&mut self, ctx: CallContext) -> Result<(), TransferError> {
        if ctx.sender != self.owner {
            return Err(TransferError::NotOwner);
        }
        self.paused = false;
        Ok(())
    }

    pub fn set_sweeper(&mut self, ctx: CallContext, sweeper: Address) -> Result<(), TransferError> {
        if ctx.sender != self.owner {
            return Err(TransferError::NotOwner);
        }
        self.sweeper = sweeper;
        Ok(())
    }

    // ---- registrar --------------------------------------------------------

    /// Registers the caller with itself as fee destination.
    pub fn register(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
    ) -> Result<(), TransferError> {
        self.register_with_fee_destination(chain, ctx, ctx.sender)
    }

    /// Registers the caller as an operator with an explicit fee destination.
    /// Fully permissionless: anyone may register themselves.
    pub fn register_with_fee_destination(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
        fee_destination: Address,
    ) -> Result<(), TransferError> {
        if fee_destination == Address::ZERO {
            return Err(TransferError::NullDestination);
        }
        self.fee_destinations.insert(ctx.sender, fee_destination);
        chain.emit(Event::OperatorRegistered {
            operator: ctx.sender,
            fee_destination,
        });
        tracing::debug!(operator = %ctx.sender, fee_destination = %fee_destination, "operator registered");
        Ok(())
    }

    /// Clears the caller's registration. Future intents signed by this
    /// operator fail until it re-registers; already-processed ids stay
    /// processed.
    pub fn unregister(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
    ) -> Result<(), TransferError> {
        self.fee_destinations.remove(&ctx.sender);
        chain.emit(Event::OperatorUnregistered {
            operator: ctx.sender,
        });
        tracing::debug!(operator = %ctx.sender, "operator unregistered");
        Ok(())
    }

    // ---- settlement entry points -----------------------------------------

    /// Settles a native-currency intent with the attached value.
    pub fn transfer_native(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
        intent: &TransferIntent,
    ) -> Result<(), TransferError> {
        self.settle(chain, ctx, intent, Funding::Native, Conversion::None)
    }

    /// Settles a token intent funded by a signed delegated transfer.
    pub fn transfer_token(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
        intent: &TransferIntent,
        auth: &SignedTransferAuthorization,
    ) -> Result<(), TransferError> {
        self.settle(
            chain,
            ctx,
            intent,
            Funding::SignedTransfer(auth),
            Conversion::None,
        )
    }

    /// Settles a token intent out of the caller's pre-existing allowance.
    pub fn transfer_token_pre_approved(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
        intent: &TransferIntent,
    ) -> Result<(), TransferError> {
        self.settle(chain, ctx, intent, Funding::PreApproved, Conversion::None)
    }

    /// Wraps attached native value and settles a wrapped-currency intent.
    pub fn wrap_and_transfer(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
        intent: &TransferIntent,
    ) -> Result<(), TransferError> {
        self.settle(chain, ctx, intent, Funding::Native, Conversion::Wrap)
    }

    /// Pulls wrapped currency by signed delegated transfer, unwraps, and
    /// settles a native-currency intent.
    pub fn unwrap_and_transfer(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
        intent: &TransferIntent,
        auth: &SignedTransferAuthorization,
    ) -> Result<(), TransferError> {
        self.settle(
            chain,
            ctx,
            intent,
            Funding::SignedTransfer(auth),
            Conversion::Unwrap,
        )
    }

    /// Pulls wrapped currency from the caller's allowance, unwraps, and
    /// settles a native-currency intent.
    pub fn unwrap_and_transfer_pre_approved(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
        intent: &TransferIntent,
    ) -> Result<(), TransferError> {
        self.settle(chain, ctx, intent, Funding::PreApproved, Conversion::Unwrap)
    }

    /// Swaps attached native value for exactly the intent's token amounts.
    /// The attached value is the payer's maximum willingness to pay.
    pub fn swap_and_transfer_uniswap_v3_native(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
        intent: &TransferIntent,
        pool_fee: u32,
    ) -> Result<(), TransferError> {
        self.settle(
            chain,
            ctx,
            intent,
            Funding::Native,
            Conversion::Swap {
                token_in: None,
                max_willing_to_pay: ctx.value,
                pool_fee,
            },
        )
    }

    /// Swaps tokens pulled by signed delegated transfer for exactly the
    /// intent's amounts. The authorization's requested amount is the payer's
    /// maximum willingness to pay.
    pub fn swap_and_transfer_uniswap_v3_token(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
        intent: &TransferIntent,
        auth: &SignedTransferAuthorization,
        pool_fee: u32,
    ) -> Result<(), TransferError> {
        self.settle(
            chain,
            ctx,
            intent,
            Funding::SignedTransfer(auth),
            Conversion::Swap {
                token_in: Some(auth.token),
                max_willing_to_pay: auth.requested_amount,
                pool_fee,
            },
        )
    }

    /// Swaps tokens pulled from the caller's allowance for exactly the
    /// intent's amounts.
    pub fn swap_and_transfer_uniswap_v3_token_pre_approved(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
        intent: &TransferIntent,
        token_in: Address,
        max_willing_to_pay: U256,
        pool_fee: u32,
    ) -> Result<(), TransferError> {
        self.settle(
            chain,
            ctx,
            intent,
            Funding::PreApproved,
            Conversion::Swap {
                token_in: Some(token_in),
                max_willing_to_pay,
                pool_fee,
            },
        )
    }

    /// Settles a token intent with a third party's funds via
    /// permit-then-transfer; the calling relayer carries the gas.
    pub fn subsidized_transfer_token(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
        intent: &TransferIntent,
        permit: &PermitPayload,
    ) -> Result<(), TransferError> {
        self.settle(chain, ctx, intent, Funding::Permit(permit), Conversion::None)
    }

    // ---- recovery sweeps --------------------------------------------------

    /// Sweeps the contract's entire native balance to `destination`.
    pub fn sweep_native(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
        destination: Address,
    ) -> Result<(), TransferError> {
        self.guarded(chain, |this, chain| {
            let amount = chain.native_balance(this.address);
            if amount == U256::ZERO {
                return Err(TransferError::NothingToSweep);
            }
            this.sweep_native_inner(chain, ctx, destination, amount)
        })
    }

    /// Sweeps `amount` of the contract's native balance to `destination`.
    pub fn sweep_native_amount(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
        destination: Address,
        amount: U256,
    ) -> Result<(), TransferError> {
        self.guarded(chain, |this, chain| {
            let balance = chain.native_balance(this.address);
            if balance < amount {
                return Err(TransferError::InsufficientBalance {
                    shortfall: amount - balance,
                });
            }
            this.sweep_native_inner(chain, ctx, destination, amount)
        })
    }

    /// Sweeps the contract's entire balance of `token` to `destination`.
    pub fn sweep_token(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
        token: Address,
        destination: Address,
    ) -> Result<(), TransferError> {
        self.guarded(chain, |this, chain| {
            let amount = chain.balance_of(token, this.address);
            if amount == U256::ZERO {
                return Err(TransferError::NothingToSweep);
            }
            this.sweep_token_inner(chain, ctx, token, destination, amount)
        })
    }

    /// Sweeps `amount` of the contract's `token` balance to `destination`.
    pub fn sweep_token_amount(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
        token: Address,
        destination: Address,
        amount: U256,
    ) -> Result<(), TransferError> {
        self.guarded(chain, |this, chain| {
            let balance = chain.balance_of(token, this.address);
            if balance < amount {
                return Err(TransferError::InsufficientBalance {
                    shortfall: amount - balance,
                });
            }
            this.sweep_token_inner(chain, ctx, token, destination, amount)
        })
    }

    fn sweep_native_inner(
        &self,
        chain: &mut ChainState,
        ctx: CallContext,
        destination: Address,
        amount: U256,
    ) -> Result<(), TransferError> {
        self.check_sweep(ctx, destination)?;
        send_native(chain, self.address, destination, amount)?;
        chain.emit(Event::Swept {
            currency: NATIVE_CURRENCY,
            destination,
            amount,
        });
        Ok(())
    }

    fn sweep_token_inner(
        &self,
        chain: &mut ChainState,
        ctx: CallContext,
        token: Address,
        destination: Address,
        amount: U256,
    ) -> Result<(), TransferError> {
        self.check_sweep(ctx, destination)?;
        let moved = chain
            .token_mut(token)
            .map(|t| t.transfer(self.address, destination, amount))
            .unwrap_or(false);
        if !moved {
            return Err(TransferError::TokenTransferFailed {
                currency: token,
                to: destination,
                amount,
            });
        }
        chain.emit(Event::Swept {
            currency: token,
            destination,
            amount,
        });
        Ok(())
    }

    fn check_sweep(&self, ctx: CallContext, destination: Address) -> Result<(), TransferError> {
        if ctx.sender != self.sweeper {
            return Err(TransferError::NotSweeper);
        }
        if destination == Address::ZERO {
            return Err(TransferError::NullDestination);
        }
        Ok(())
    }

    // ---- internal pipeline ------------------------------------------------

    /// Reentrancy exclusion plus transaction semantics: the ledger is
    /// snapshotted before the body runs and restored on any failure.
    fn guarded<F>(&mut self, chain: &mut ChainState, f: F) -> Result<(), TransferError>
    where
        F: FnOnce(&mut Self, &mut ChainState) -> Result<(), TransferError>,
    {
        if self.entered {
            return Err(TransferError::ReentrantCall);
        }
        self.entered = true;
        let snapshot = chain.clone();
        let result = f(self, chain);
        if result.is_err() {
            *chain = snapshot;
        }
        self.entered = false;
        result
    }

    fn settle(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
        intent: &TransferIntent,
        funding: Funding<'_>,
        conversion: Conversion,
    ) -> Result<(), TransferError> {
        self.guarded(chain, |this, chain| {
            if this.paused {
                return Err(TransferError::Paused);
            }
            this.settle_inner(chain, ctx, intent, funding, conversion)
        })
    }

    fn settle_inner(
        &mut self,
        chain: &mut ChainState,
        ctx: CallContext,
        intent: &TransferIntent,
        funding: Funding<'_>,
        conversion: Conversion,
    ) -> Result<(), TransferError> {
        let fee_destination = self.validate_intent(chain, ctx, intent)?;
        let total = intent
            .recipient_amount
            .checked_add(intent.fee_amount)
            .ok_or(TransferError::InvalidTransferDetails)?;
        tracing::debug!(
            operator = %intent.operator,
            id = %intent.id,
            total = %total,
            "intent validated"
        );

        let (spent_amount, spent_currency) = match conversion {
            Conversion::None => {
                self.settle_direct(chain, ctx, intent, &funding, fee_destination, total)?
            }
            Conversion::Wrap => {
                self.settle_wrap(chain, ctx, intent, &funding, fee_destination, total)?
            }
            Conversion::Unwrap => {
                self.settle_unwrap(chain, ctx, intent, &funding, fee_destination, total)?
            }
            Conversion::Swap {
                token_in,
                max_willing_to_pay,
                pool_fee,
            } => swap::swap_and_distribute(
                chain,
                ctx,
                intent,
                &funding,
                swap::SwapPlan {
                    settlement: self.address,
                    fee_destination,
                    token_in,
                    max_willing_to_pay,
                    pool_fee,
                    total,
                },
            )?,
        };

        self.processed
            .entry(intent.operator)
            .or_default()
            .insert(intent.id);
        chain.emit(Event::Transferred {
            operator: intent.operator,
            id: intent.id,
            recipient: intent.recipient,
            sender: ctx.sender,
            spent_amount,
            spent_currency,
            recipient_amount: intent.recipient_amount,
            recipient_currency: intent.recipient_currency,
        });
        tracing::info!(
            operator = %intent.operator,
            id = %intent.id,
            spent_amount = %spent_amount,
            spent_currency = %spent_currency,
            "intent settled"
        );
        Ok(())
    }

    /// The intent authenticator. Pure validation, no side effects; runs
    /// before any fund movement in every entry point. Returns the operator's
    /// registered fee destination.
    fn validate_intent(
        &self,
        chain: &ChainState,
        ctx: CallContext,
        intent: &TransferIntent,
    ) -> Result<Address, TransferError> {
        let recovered = intent.recover_signer(ctx.sender, self.address, chain.chain_id);
        if recovered != Some(intent.operator) {
            return Err(TransferError::InvalidSignature);
        }
        // An intent landing exactly at its deadline is still valid.
        if intent.deadline < chain.timestamp {
            return Err(TransferError::ExpiredIntent {
                deadline: intent.deadline,
                now: chain.timestamp,
            });
        }
        if intent.recipient == Address::ZERO {
            return Err(TransferError::NullRecipient);
        }
        if self.is_processed(intent.operator, intent.id) {
            return Err(TransferError::AlreadyProcessed {
                operator: intent.operator,
                id: intent.id,
            });
        }
        self.fee_destinations
            .get(&intent.operator)
            .copied()
            .ok_or(TransferError::OperatorNotRegistered(intent.operator))
    }

    /// No-conversion paths: native value, delegated transfer, direct
    /// allowance, or permit-then-transfer, all delivering the intent's
    /// currency as-is.
    fn settle_direct(
        &self,
        chain: &mut ChainState,
        ctx: CallContext,
        intent: &TransferIntent,
        funding: &Funding<'_>,
        fee_destination: Address,
        total: U256,
    ) -> Result<(U256, Address), TransferError> {
        match funding {
            Funding::Native => {
                if intent.recipient_currency != NATIVE_CURRENCY {
                    return Err(TransferError::IncorrectCurrency(intent.recipient_currency));
                }
                require_exact_value(ctx.value, total)?;
                if !chain.transfer_native(ctx.sender, self.address, ctx.value) {
                    return Err(TransferError::NativeTransferFailed {
                        destination: self.address,
                        amount: ctx.value,
                    });
                }
                distribute_native(chain, self.address, intent, fee_destination)?;
                Ok((ctx.value, NATIVE_CURRENCY))
            }
            Funding::SignedTransfer(auth) => {
                let token = require_token_currency(intent)?;
                if auth.token != token || auth.to != self.address || auth.requested_amount != total
                {
                    return Err(TransferError::InvalidTransferDetails);
                }
                let settlement = self.address;
                with_exact_receipt(chain, token, settlement, total, |chain| {
                    chain
                        .permit2_transfer(auth, settlement)
                        .map_err(TransferError::SignatureTransferFailed)
                })?;
                distribute_token(chain, token, settlement, intent, fee_destination)?;
                Ok((total, token))
            }
            Funding::PreApproved => {
                let token = require_token_currency(intent)?;
                acquire_pre_approved(chain, self.address, ctx.sender, token, total)?;
                distribute_token(chain, token, self.address, intent, fee_destination)?;
                Ok((total, token))
            }
            Funding::Permit(permit) => {
                let token = require_token_currency(intent)?;
                self.acquire_by_permit(chain, permit, token, total)?;
                distribute_token(chain, token, self.address, intent, fee_destination)?;
                Ok((total, token))
            }
        }
    }

    /// Native in, wrapped currency out.
    fn settle_wrap(
        &self,
        chain: &mut ChainState,
        ctx: CallContext,
        intent: &TransferIntent,
        funding: &Funding<'_>,
        fee_destination: Address,
        total: U256,
    ) -> Result<(U256, Address), TransferError> {
        if !matches!(funding, Funding::Native) {
            return Err(TransferError::InvalidTransferDetails);
        }
        if intent.recipient_currency != chain.weth {
            return Err(TransferError::IncorrectCurrency(intent.recipient_currency));
        }
        require_exact_value(ctx.value, total)?;
        if !chain.transfer_native(ctx.sender, self.address, ctx.value) {
            return Err(TransferError::NativeTransferFailed {
                destination: self.address,
                amount: ctx.value,
            });
        }
        if !chain.wrap_native(self.address, total) {
            return Err(TransferError::NativeTransferFailed {
                destination: chain.weth,
                amount: total,
            });
        }
        let weth = chain.weth;
        distribute_token(chain, weth, self.address, intent, fee_destination)?;
        Ok((ctx.value, NATIVE_CURRENCY))
    }

    /// Wrapped currency in, native out.
    fn settle_unwrap(
        &self,
        chain: &mut ChainState,
        ctx: CallContext,
        intent: &TransferIntent,
        funding: &Funding<'_>,
        fee_destination: Address,
        total: U256,
    ) -> Result<(U256, Address), TransferError> {
        if intent.recipient_currency != NATIVE_CURRENCY {
            return Err(TransferError::IncorrectCurrency(intent.recipient_currency));
        }
        let weth = chain.weth;
        let settlement = self.address;
        match funding {
            Funding::SignedTransfer(auth) => {
                if auth.token != weth || auth.to != settlement || auth.requested_amount != total {
                    return Err(TransferError::InvalidTransferDetails);
                }
                with_exact_receipt(chain, weth, settlement, total, |chain| {
                    chain
                        .permit2_transfer(auth, settlement)
                        .map_err(TransferError::SignatureTransferFailed)
                })?;
            }
            Funding::PreApproved => {
                acquire_pre_approved(chain, settlement, ctx.sender, weth, total)?;
            }
            _ => return Err(TransferError::InvalidTransferDetails),
        }
        if !chain.unwrap_native(settlement, total, settlement) {
            return Err(TransferError::NativeTransferFailed {
                destination: settlement,
                amount: total,
            });
        }
        distribute_native(chain, settlement, intent, fee_destination)?;
        Ok((total, weth))
    }

    /// Invokes the token's permit and requires the owner's nonce to advance
    /// by exactly one, then pulls the funds. A reverting, false-returning,
    /// or no-op permit is one and the same failure.
    fn acquire_by_permit(
        &self,
        chain: &mut ChainState,
        permit: &PermitPayload,
        token: Address,
        amount: U256,
    ) -> Result<(), TransferError> {
        let settlement = self.address;
        let chain_id = chain.chain_id;
        let now = chain.timestamp;
        let nonce_before = chain
            .token(token)
            .map(|t| t.nonce_of(permit.owner))
            .unwrap_or_default();
        let accepted = chain
            .token_mut(token)
            .map(|t| {
                t.permit(
                    permit.owner,
                    settlement,
                    amount,
                    permit.deadline,
                    &permit.signature,
                    chain_id,
                    now,
                )
            })
            .unwrap_or(false);
        let nonce_after = chain
            .token(token)
            .map(|t| t.nonce_of(permit.owner))
            .unwrap_or_default();
        if !accepted || nonce_after != nonce_before + U256::from(1) {
            return Err(TransferError::PermitCallFailed);
        }
        with_exact_receipt(chain, token, settlement, amount, |chain| {
            let moved = chain
                .token_mut(token)
                .map(|t| t.transfer_from(settlement, permit.owner, settlement, amount))
                .unwrap_or(false);
            if moved {
                Ok(())
            } else {
                Err(TransferError::TokenTransferFailed {
                    currency: token,
                    to: settlement,
                    amount,
                })
            }
        })
    }
}

/// Fail-fast balance and allowance prechecks, then an exact-receipt
/// `transferFrom` into custody.
pub(crate) fn acquire_pre_approved(
    chain: &mut ChainState,
    settlement: Address,
    payer: Address,
    token: Address,
    amount: U256,
) -> Result<(), TransferError> {
    let balance = chain.balance_of(token, payer);
    if balance < amount {
        return Err(TransferError::InsufficientBalance {
            shortfall: amount - balance,
        });
    }
    let allowance = chain
        .token(token)
        .map(|t| t.allowance(payer, settlement))
        .unwrap_or_default();
    if allowance < amount {
        return Err(TransferError::InsufficientAllowance {
            shortfall: amount - allowance,
        });
    }
    with_exact_receipt(chain, token, settlement, amount, |chain| {
        let moved = chain
            .token_mut(token)
            .map(|t| t.transfer_from(settlement, payer, settlement, amount))
            .unwrap_or(false);
        if moved {
            Ok(())
        } else {
            Err(TransferError::TokenTransferFailed {
                currency: token,
                to: settlement,
                amount,
            })
        }
    })
}

/// Requires the attached native value to equal the needed amount exactly.
fn require_exact_value(value: U256, needed: U256) -> Result<(), TransferError> {
    if value != needed {
        return Err(TransferError::InvalidNativeAmount(signed_delta(
            value, needed,
        )));
    }
    Ok(())
}

/// Signed difference `value - needed`, saturating at the I256 bounds.
pub(crate) fn signed_delta(value: U256, needed: U256) -> I256 {
    if value >= needed {
        I256::try_from(value - needed).unwrap_or(I256::MAX)
    } else {
        I256::try_from(needed - value)
            .map(|d| -d)
            .unwrap_or(I256::MIN)
    }
}

fn require_token_currency(intent: &TransferIntent) -> Result<Address, TransferError> {
    if intent.recipient_currency == NATIVE_CURRENCY {
        return Err(TransferError::IncorrectCurrency(NATIVE_CURRENCY));
    }
    Ok(intent.recipient_currency)
}

/// The exact-transfer verifier: snapshots the target's balance, runs the
/// movement, and requires the delta to equal `expected` to the unit. Any
/// shortfall or excess is fatal.
pub(crate) fn with_exact_receipt<F>(
    chain: &mut ChainState,
    token: Address,
    target: Address,
    expected: U256,
    movement: F,
) -> Result<(), TransferError>
where
    F: FnOnce(&mut ChainState) -> Result<(), TransferError>,
{
    let before = chain.balance_of(token, target);
    movement(chain)?;
    let after = chain.balance_of(token, target);
    if after < before || after - before != expected {
        return Err(TransferError::InexactTransfer {
            currency: token,
            target,
            expected,
            actual: after.saturating_sub(before),
        });
    }
    Ok(())
}

/// Sends native currency, reporting a structured failure on a failed call.
pub(crate) fn send_native(
    chain: &mut ChainState,
    from: Address,
    to: Address,
    amount: U256,
) -> Result<(), TransferError> {
    if !chain.transfer_native(from, to, amount) {
        return Err(TransferError::NativeTransferFailed {
            destination: to,
            amount,
        });
    }
    Ok(())
}

/// Distributes custodied native currency to recipient and fee destination,
/// skipping zero-amount legs.
fn distribute_native(
    chain: &mut ChainState,
    settlement: Address,
    intent: &TransferIntent,
    fee_destination: Address,
) -> Result<(), TransferError> {
    if intent.recipient_amount > U256::ZERO {
        send_native(chain, settlement, intent.recipient, intent.recipient_amount)?;
    }
    if intent.fee_amount > U256::ZERO {
        send_native(chain, settlement, fee_destination, intent.fee_amount)?;
    }
    Ok(())
}

/// Distributes custodied tokens to recipient and fee destination, each leg
/// wrapped by the exact-transfer verifier, skipping zero-amount legs.
fn distribute_token(
    chain: &mut ChainState,
    token: Address,
    settlement: Address,
    intent: &TransferIntent,
    fee_destination: Address,
) -> Result<(), TransferError> {
    for (to, amount) in [
        (intent.recipient, intent.recipient_amount),
        (fee_destination, intent.fee_amount),
    ] {
        if amount == U256::ZERO {
            continue;
        }
        with_exact_receipt(chain, token, to, amount, |chain| {
            let moved = chain
                .token_mut(token)
                .map(|t| t.transfer(settlement, to, amount))
                .unwrap_or(false);
            if moved {
                Ok(())
            } else {
                Err(TransferError::TokenTransferFailed {
                    currency: token,
                    to,
                    amount,
                })
            }
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::I256;

    #[test]
    fn test_signed_delta() {
        assert_eq!(
            signed_delta(U256::from(11), U256::from(10)),
            I256::try_from(1).unwrap()
        );
        assert_eq!(
            signed_delta(U256::from(9), U256::from(10)),
            I256::try_from(-1).unwrap()
        );
        assert_eq!(signed_delta(U256::from(10), U256::from(10)), I256::ZERO);
    }

    #[test]
    fn test_pause_requires_owner() {
        let mut transfers = Transfers::new(TransfersConfig {
            address: Address::repeat_byte(0x01),
            owner: Address::repeat_byte(0x02),
            sweeper: Address::repeat_byte(0x03),
            initial_operator: None,
        });
        let stranger = CallContext::new(Address::repeat_byte(0x09));
        assert_eq!(transfers.pause(stranger), Err(TransferError::NotOwner));
        let owner = CallContext::new(Address::repeat_byte(0x02));
        transfers.pause(owner).unwrap();
        assert!(transfers.is_paused());
        transfers.unpause(owner).unwrap();
        assert!(!transfers.is_paused());
    }

    #[test]
    fn test_registrar_lifecycle() {
        let mut chain = ChainState::new(1, UnixTimestamp::from_secs(0));
        let mut transfers = Transfers::new(TransfersConfig {
            address: Address::repeat_byte(0x01),
            owner: Address::repeat_byte(0x02),
            sweeper: Address::repeat_byte(0x03),
            initial_operator: None,
        });
        let operator = Address::repeat_byte(0x0a);
        let ctx = CallContext::new(operator);
        assert_eq!(transfers.fee_destination(operator), None);
        transfers
            .register_with_fee_destination(&mut chain, ctx, Address::repeat_byte(0x0b))
            .unwrap();
        assert_eq!(
            transfers.fee_destination(operator),
            Some(Address::repeat_byte(0x0b))
        );
        transfers.unregister(&mut chain, ctx).unwrap();
        assert_eq!(transfers.fee_destination(operator), None);
        // register() defaults the fee destination to the caller.
        transfers.register(&mut chain, ctx).unwrap();
        assert_eq!(transfers.fee_destination(operator), Some(operator));
    }

    #[test]
    fn test_register_rejects_null_destination() {
        let mut chain = ChainState::new(1, UnixTimestamp::from_secs(0));
        let mut transfers = Transfers::new(TransfersConfig {
            address: Address::repeat_byte(0x01),
            owner: Address::repeat_byte(0x02),
            sweeper: Address::repeat_byte(0x03),
            initial_operator: None,
        });
        let ctx = CallContext::new(Address::repeat_byte(0x0a));
        assert_eq!(
            transfers.register_with_fee_destination(&mut chain, ctx, Address::ZERO),
            Err(TransferError::NullDestination)
        );
    }

    #[test]
    fn test_seeded_operator_is_registered() {
        let transfers = Transfers::new(TransfersConfig {
            address: Address::repeat_byte(0x01),
            owner: Address::repeat_byte(0x02),
            sweeper: Address::repeat_byte(0x03),
            initial_operator: Some((Address::repeat_byte(0x0a), Address::repeat_byte(0x0b))),
        });
        assert_eq!(
            transfers.fee_destination(Address::repeat_byte(0x0a)),
            Some(Address::repeat_byte(0x0b))
        );
    }

    #[test]
    fn test_sweep_requires_sweeper_role() {
        let mut chain = ChainState::new(1, UnixTimestamp::from_secs(0));
        let mut transfers = Transfers::new(TransfersConfig {
            address: Address::repeat_byte(0x01),
            owner: Address::repeat_byte(0x02),
            sweeper: Address::repeat_byte(0x03),
            initial_operator: None,
        });
        chain.mint_native(transfers.address(), U256::from(100));
        let stranger = CallContext::new(Address::repeat_byte(0x09));
        assert_eq!(
            transfers.sweep_native(&mut chain, stranger, Address::repeat_byte(0x0c)),
            Err(TransferError::NotSweeper)
        );
        let sweeper = CallContext::new(Address::repeat_byte(0x03));
        transfers
            .sweep_native(&mut chain, sweeper, Address::repeat_byte(0x0c))
            .unwrap();
        assert_eq!(
            chain.native_balance(Address::repeat_byte(0x0c)),
            U256::from(100)
        );
        // The balance is gone now.
        assert_eq!(
            transfers.sweep_native(&mut chain, sweeper, Address::repeat_byte(0x0c)),
            Err(TransferError::NothingToSweep)
        );
    }

    #[test]
    fn test_partial_sweep_reports_shortfall() {
        let mut chain = ChainState::new(1, UnixTimestamp::from_secs(0));
        let mut transfers = Transfers::new(TransfersConfig {
            address: Address::repeat_byte(0x01),
            owner: Address::repeat_byte(0x02),
            sweeper: Address::repeat_byte(0x03),
            initial_operator: None,
        });
        chain.mint_native(transfers.address(), U256::from(40));
        let sweeper = CallContext::new(Address::repeat_byte(0x03));
        assert_eq!(
            transfers.sweep_native_amount(
                &mut chain,
                sweeper,
                Address::repeat_byte(0x0c),
                U256::from(100)
            ),
            Err(TransferError::InsufficientBalance {
                shortfall: U256::from(60)
            })
        );
    }
}
