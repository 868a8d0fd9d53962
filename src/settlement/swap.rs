//! Exact-output swap orchestration for the conversion settlement paths.
//!
//! The orchestrator acquires up to the payer's maximum input, hands the
//! router a command sequence that swaps for exactly the intent's amounts,
//! distributes, and returns any residual input to the payer within the same
//! call. The amount actually consumed is computed by delta accounting over
//! the payer's and router's combined holdings in the input currency, so the
//! settled event reports the true cost, not the maximum.

use alloy_primitives::{Address, U256};
use alloy_sol_types::{Revert, SolError};
use std::collections::HashMap;

use crate::chain::uniswap::{
    InsufficientETH, InsufficientToken, V3InvalidSwap, V3TooLittleReceived, V3TooMuchRequested,
};
use crate::chain::{CallContext, ChainState, ROUTER_ADDRESS, RouterCommand, RouterRevert};
use crate::intent::TransferIntent;

use super::{
    Funding, NATIVE_CURRENCY, TransferError, acquire_pre_approved, send_native, signed_delta,
    with_exact_receipt,
};

/// Everything the orchestrator needs beyond the intent itself.
pub(super) struct SwapPlan {
    pub settlement: Address,
    pub fee_destination: Address,
    /// Input token; `None` means native currency.
    pub token_in: Option<Address>,
    pub max_willing_to_pay: U256,
    pub pool_fee: u32,
    /// `recipient_amount + fee_amount`, precomputed overflow-checked.
    pub total: U256,
}

/// Runs the whole conversion path: acquire, swap exact-out, distribute,
/// refund residual. Returns `(amount consumed, input currency)`.
pub(super) fn swap_and_distribute(
    chain: &mut ChainState,
    ctx: CallContext,
    intent: &TransferIntent,
    funding: &Funding<'_>,
    plan: SwapPlan,
) -> Result<(U256, Address), TransferError> {
    let native_out = intent.recipient_currency == NATIVE_CURRENCY;

    // Currency-shape checks. Converting a currency into itself is the job of
    // the direct, wrap, and unwrap paths.
    match plan.token_in {
        None => {
            if native_out {
                return Err(TransferError::IncorrectCurrency(NATIVE_CURRENCY));
            }
            if ctx.value.is_zero() {
                return Err(TransferError::InvalidNativeAmount(signed_delta(
                    ctx.value, plan.total,
                )));
            }
        }
        Some(token_in) => {
            if token_in == intent.recipient_currency {
                return Err(TransferError::IncorrectCurrency(token_in));
            }
        }
    }

    let payer = match funding {
        Funding::SignedTransfer(auth) => {
            if auth.to != plan.settlement {
                return Err(TransferError::InvalidTransferDetails);
            }
            auth.owner
        }
        Funding::Native | Funding::PreApproved => ctx.sender,
        // Subsidized settlement never converts.
        Funding::Permit(_) => return Err(TransferError::InvalidTransferDetails),
    };

    let input_before = holdings(chain, plan.token_in, payer)
        .checked_add(holdings(chain, plan.token_in, ROUTER_ADDRESS))
        .ok_or(TransferError::InvalidTransferDetails)?;
    let output_expectations = expected_output_deltas(chain, intent, &plan, native_out);

    // Acquire the input into custody.
    match funding {
        Funding::Native => {
            send_native(chain, ctx.sender, plan.settlement, ctx.value)?;
        }
        Funding::SignedTransfer(auth) => {
            let token = auth.token;
            let settlement = plan.settlement;
            with_exact_receipt(chain, token, settlement, plan.max_willing_to_pay, |chain| {
                chain
                    .permit2_transfer(auth, settlement)
                    .map_err(TransferError::SignatureTransferFailed)
            })?;
        }
        Funding::PreApproved => {
            let token_in = plan
                .token_in
                .ok_or(TransferError::InvalidTransferDetails)?;
            acquire_pre_approved(
                chain,
                plan.settlement,
                ctx.sender,
                token_in,
                plan.max_willing_to_pay,
            )?;
        }
        Funding::Permit(_) => return Err(TransferError::InvalidTransferDetails),
    }

    // Stage token input at the router; native input rides along as call value.
    let mut call_value = U256::ZERO;
    match plan.token_in {
        None => call_value = plan.max_willing_to_pay,
        Some(token_in) => {
            let moved = chain
                .token_mut(token_in)
                .map(|t| t.transfer(plan.settlement, ROUTER_ADDRESS, plan.max_willing_to_pay))
                .unwrap_or(false);
            if !moved {
                return Err(TransferError::TokenTransferFailed {
                    currency: token_in,
                    to: ROUTER_ADDRESS,
                    amount: plan.max_willing_to_pay,
                });
            }
        }
    }

    let commands = build_commands(chain, intent, &plan, payer, native_out);
    chain
        .execute_router(plan.settlement, call_value, intent.deadline, &commands)
        .map_err(remap_revert)?;

    // The router delivered; re-verify every token leg landed to the unit.
    for ((token, target), expected) in output_expectations {
        let actual = chain
            .balance_of(token, target)
            .saturating_sub(expected.before);
        if actual != expected.delta {
            return Err(TransferError::InexactTransfer {
                currency: token,
                target,
                expected: expected.delta,
                actual,
            });
        }
    }

    let input_after = holdings(chain, plan.token_in, payer)
        .saturating_add(holdings(chain, plan.token_in, ROUTER_ADDRESS));
    let consumed = input_before.saturating_sub(input_after);
    let input_currency = plan.token_in.unwrap_or(NATIVE_CURRENCY);
    tracing::debug!(
        consumed = %consumed,
        input_currency = %input_currency,
        max = %plan.max_willing_to_pay,
        "swap settled"
    );
    Ok((consumed, input_currency))
}

/// Combined holdings of `who` in the input currency. Native input counts
/// native and wrapped together, because inputs pass through wrapped form
/// inside the router.
fn holdings(chain: &ChainState, token_in: Option<Address>, who: Address) -> U256 {
    match token_in {
        None => chain
            .native_balance(who)
            .saturating_add(chain.balance_of(chain.weth, who)),
        Some(token) => chain.balance_of(token, who),
    }
}

struct ExpectedDelta {
    before: U256,
    delta: U256,
}

/// Pre-swap snapshot of each token-output leg. Legs to the same address are
/// merged so an operator paying fees to the recipient still verifies.
/// Native-currency output is delivered by exact-amount sends and needs no
/// balance audit.
fn expected_output_deltas(
    chain: &ChainState,
    intent: &TransferIntent,
    plan: &SwapPlan,
    native_out: bool,
) -> HashMap<(Address, Address), ExpectedDelta> {
    let mut expectations: HashMap<(Address, Address), ExpectedDelta> = HashMap::new();
    if native_out {
        return expectations;
    }
    let token = intent.recipient_currency;
    for (target, amount) in [
        (intent.recipient, intent.recipient_amount),
        (plan.fee_destination, intent.fee_amount),
    ] {
        if amount.is_zero() {
            continue;
        }
        expectations
            .entry((token, target))
            .and_modify(|e| e.delta = e.delta.saturating_add(amount))
            .or_insert_with(|| ExpectedDelta {
                before: chain.balance_of(token, target),
                delta: amount,
            });
    }
    expectations
}

/// The router program for one settlement: optional wrap, one exact-output
/// swap, distribution legs, and a residual-input refund to the payer.
fn build_commands(
    chain: &ChainState,
    intent: &TransferIntent,
    plan: &SwapPlan,
    payer: Address,
    native_out: bool,
) -> Vec<RouterCommand> {
    let token_in_wrapped = plan.token_in.unwrap_or(chain.weth);
    let token_out_wrapped = if native_out {
        chain.weth
    } else {
        intent.recipient_currency
    };

    let mut commands = Vec::new();
    if plan.token_in.is_none() {
        commands.push(RouterCommand::WrapNative {
            amount: plan.max_willing_to_pay,
        });
    }
    commands.push(RouterCommand::V3SwapExactOut {
        recipient: ROUTER_ADDRESS,
        amount_out: plan.total,
        amount_in_max: plan.max_willing_to_pay,
        token_in: token_in_wrapped,
        token_out: token_out_wrapped,
        fee: plan.pool_fee,
    });
    if native_out {
        commands.push(RouterCommand::UnwrapNative {
            recipient: ROUTER_ADDRESS,
            amount_min: plan.total,
        });
        for (recipient, amount) in [
            (intent.recipient, intent.recipient_amount),
            (plan.fee_destination, intent.fee_amount),
        ] {
            if !amount.is_zero() {
                commands.push(RouterCommand::TransferNative { recipient, amount });
            }
        }
    } else {
        for (recipient, amount) in [
            (intent.recipient, intent.recipient_amount),
            (plan.fee_destination, intent.fee_amount),
        ] {
            if !amount.is_zero() {
                commands.push(RouterCommand::TransferToken {
                    token: token_out_wrapped,
                    recipient,
                    amount,
                });
            }
        }
    }
    // Whatever input the swap did not consume goes straight back to the
    // payer, not to the calling relayer.
    match plan.token_in {
        None => commands.push(RouterCommand::UnwrapNative {
            recipient: payer,
            amount_min: U256::ZERO,
        }),
        Some(token_in) => commands.push(RouterCommand::Sweep {
            token: token_in,
            recipient: payer,
        }),
    }
    commands
}

/// Translates a raw router revert into the settlement error taxonomy.
/// Recognized 4-byte selectors and `Error(string)` payloads become readable
/// reasons; anything else is preserved verbatim for diagnosis.
fn remap_revert(revert: RouterRevert) -> TransferError {
    match revert {
        RouterRevert::Reason(reason) => TransferError::SwapFailedString(reason),
        RouterRevert::Data(data) => {
            if data.len() >= 4 {
                let selector = [data[0], data[1], data[2], data[3]];
                for (known, name) in [
                    (V3InvalidSwap::SELECTOR, "V3InvalidSwap"),
                    (V3TooLittleReceived::SELECTOR, "V3TooLittleReceived"),
                    (V3TooMuchRequested::SELECTOR, "V3TooMuchRequested"),
                    (InsufficientToken::SELECTOR, "Insufficient token"),
                    (InsufficientETH::SELECTOR, "Insufficient ETH"),
                ] {
                    if selector == known {
                        return TransferError::SwapFailedString(name.to_string());
                    }
                }
                if selector == Revert::SELECTOR
                    && let Ok(reason) = Revert::abi_decode(&data)
                {
                    return TransferError::SwapFailedString(reason.reason);
                }
            }
            TransferError::SwapFailedBytes(data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Bytes;

    #[test]
    fn test_remap_reason_string() {
        assert_eq!(
            remap_revert(RouterRevert::Reason("Transaction too old".to_string())),
            TransferError::SwapFailedString("Transaction too old".to_string())
        );
    }

    #[test]
    fn test_remap_known_selectors() {
        let cases = [
            (
                RouterRevert::error(V3TooMuchRequested {}),
                "V3TooMuchRequested",
            ),
            (
                RouterRevert::error(V3TooLittleReceived {}),
                "V3TooLittleReceived",
            ),
            (RouterRevert::error(V3InvalidSwap {}), "V3InvalidSwap"),
            (
                RouterRevert::error(InsufficientToken {}),
                "Insufficient token",
            ),
            (RouterRevert::error(InsufficientETH {}), "Insufficient ETH"),
        ];
        for (revert, expected) in cases {
            assert_eq!(
                remap_revert(revert),
                TransferError::SwapFailedString(expected.to_string())
            );
        }
    }

    #[test]
    fn test_remap_error_string_payload() {
        let data = Bytes::from(
            Revert {
                reason: "STF".to_string(),
            }
            .abi_encode(),
        );
        assert_eq!(
            remap_revert(RouterRevert::Data(data)),
            TransferError::SwapFailedString("STF".to_string())
        );
    }

    #[test]
    fn test_remap_opaque_data_preserved() {
        let data = Bytes::from(vec![0xde, 0xad, 0xbe, 0xef, 0x01]);
        assert_eq!(
            remap_revert(RouterRevert::Data(data.clone())),
            TransferError::SwapFailedBytes(data)
        );
    }

    #[test]
    fn test_remap_short_data_preserved() {
        let data = Bytes::from(vec![0x01]);
        assert_eq!(
            remap_revert(RouterRevert::Data(data.clone())),
            TransferError::SwapFailedBytes(data)
        );
    }
}
