//! Signature-transfer engine: single-use, owner-signed delegated transfers.
//!
//! Payers sign a [`PermitTransferFrom`] message over the engine's own EIP-712
//! domain instead of submitting a standalone approval transaction. The
//! settlement engine presents the signed authorization, and the engine moves
//! the tokens (out of the allowance the owner granted to the engine's
//! canonical address) in the same call. Each `(owner, nonce)` pair is
//! consumed at most once.

use alloy_primitives::{Address, Bytes, Signature, U256, address};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{SolStruct, eip712_domain, sol};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::timestamp::UnixTimestamp;

/// The canonical signature-transfer engine address, shared across chains.
pub const PERMIT2_ADDRESS: Address = address!("0x000000000022D473030F116dDEE9F6B43aC78BA3");

sol! {
    /// Token and maximum amount the owner permits to be moved.
    struct TokenPermissions {
        address token;
        uint256 amount;
    }

    /// The signed authorization: which token, how much at most, which
    /// spender may execute it, under which single-use nonce, and until when.
    struct PermitTransferFrom {
        TokenPermissions permitted;
        address spender;
        uint256 nonce;
        uint256 deadline;
    }
}

/// A fully specified delegated-transfer funding payload.
///
/// `amount` is the permitted maximum; `requested_amount` is what the spender
/// actually asks to move to `to`. Direct settlement paths require the two to
/// be equal; swap paths treat `amount` as the payer's maximum willingness to
/// pay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransferAuthorization {
    /// Token contract the authorization covers.
    pub token: Address,
    /// Maximum amount the owner permitted.
    pub amount: U256,
    /// Single-use nonce, scoped per owner.
    pub nonce: U256,
    /// Authorization expires once the chain clock passes this timestamp.
    pub deadline: UnixTimestamp,
    /// Destination of the transfer.
    pub to: Address,
    /// Amount the spender requests to move.
    pub requested_amount: U256,
    /// The token owner that signed the authorization.
    pub owner: Address,
    /// 65-byte recoverable signature over the engine's EIP-712 message.
    pub signature: Bytes,
}

/// Failures surfaced by the signature-transfer engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Permit2Error {
    #[error("signature expired at {deadline}, now {now}")]
    SignatureExpired {
        deadline: UnixTimestamp,
        now: UnixTimestamp,
    },
    #[error("nonce {0} already used for this owner")]
    InvalidNonce(U256),
    #[error("requested amount {requested} exceeds permitted {permitted}")]
    InvalidAmount { requested: U256, permitted: U256 },
    #[error("recovered signer does not match the stated owner")]
    InvalidSigner,
    #[error("token transfer returned false")]
    TransferFailed,
    #[error("unknown token {0}")]
    UnknownToken(Address),
}

/// Nonce bookkeeping for the engine. Lives inside the simulated ledger.
#[derive(Debug, Clone, Default)]
pub struct Permit2 {
    used: HashMap<Address, HashSet<U256>>,
}

impl Permit2 {
    /// Validates an authorization for `spender` without consuming the nonce.
    pub fn validate(
        &self,
        auth: &SignedTransferAuthorization,
        spender: Address,
        chain_id: u64,
        now: UnixTimestamp,
    ) -> Result<(), Permit2Error> {
        if auth.deadline < now {
            return Err(Permit2Error::SignatureExpired {
                deadline: auth.deadline,
                now,
            });
        }
        if self
            .used
            .get(&auth.owner)
            .is_some_and(|nonces| nonces.contains(&auth.nonce))
        {
            return Err(Permit2Error::InvalidNonce(auth.nonce));
        }
        if auth.requested_amount > auth.amount {
            return Err(Permit2Error::InvalidAmount {
                requested: auth.requested_amount,
                permitted: auth.amount,
            });
        }
        let digest = signing_hash(
            auth.token,
            auth.amount,
            auth.nonce,
            auth.deadline,
            spender,
            chain_id,
        );
        let recovered = Signature::from_raw(&auth.signature)
            .ok()
            .and_then(|signature| signature.recover_address_from_prehash(&digest).ok());
        if recovered != Some(auth.owner) {
            return Err(Permit2Error::InvalidSigner);
        }
        Ok(())
    }

    /// Marks `(owner, nonce)` as consumed.
    pub fn consume(&mut self, owner: Address, nonce: U256) {
        self.used.entry(owner).or_default().insert(nonce);
    }

    /// Whether `(owner, nonce)` has been consumed.
    pub fn is_used(&self, owner: Address, nonce: U256) -> bool {
        self.used
            .get(&owner)
            .is_some_and(|nonces| nonces.contains(&nonce))
    }
}

fn signing_hash(
    token: Address,
    amount: U256,
    nonce: U256,
    deadline: UnixTimestamp,
    spender: Address,
    chain_id: u64,
) -> alloy_primitives::B256 {
    let message = PermitTransferFrom {
        permitted: TokenPermissions { token, amount },
        spender,
        nonce,
        deadline: U256::from(deadline.as_secs()),
    };
    let domain = eip712_domain! {
        name: "Permit2",
        chain_id: chain_id,
        verifying_contract: PERMIT2_ADDRESS,
    };
    message.eip712_signing_hash(&domain)
}

/// Signs a delegated-transfer authorization as the token owner.
#[allow(clippy::too_many_arguments)]
pub fn sign_transfer_authorization(
    signer: &PrivateKeySigner,
    token: Address,
    amount: U256,
    nonce: U256,
    deadline: UnixTimestamp,
    to: Address,
    requested_amount: U256,
    spender: Address,
    chain_id: u64,
) -> Result<SignedTransferAuthorization, alloy_signer::Error> {
    let digest = signing_hash(token, amount, nonce, deadline, spender, chain_id);
    let signature = signer.sign_hash_sync(&digest)?;
    Ok(SignedTransferAuthorization {
        token,
        amount,
        nonce,
        deadline,
        to,
        requested_amount,
        owner: signer.address(),
        signature: Bytes::from(signature.as_bytes().to_vec()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(signer: &PrivateKeySigner, spender: Address) -> SignedTransferAuthorization {
        sign_transfer_authorization(
            signer,
            Address::repeat_byte(0xaa),
            U256::from(100),
            U256::from(7),
            UnixTimestamp::from_secs(2_000_000_000),
            spender,
            U256::from(100),
            spender,
            8453,
        )
        .unwrap()
    }

    #[test]
    fn test_validate_accepts_fresh_authorization() {
        let signer = PrivateKeySigner::random();
        let spender = Address::repeat_byte(0x55);
        let permit2 = Permit2::default();
        let auth = auth(&signer, spender);
        let now = UnixTimestamp::from_secs(1_000_000_000);
        assert!(permit2.validate(&auth, spender, 8453, now).is_ok());
    }

    #[test]
    fn test_consumed_nonce_rejected() {
        let signer = PrivateKeySigner::random();
        let spender = Address::repeat_byte(0x55);
        let mut permit2 = Permit2::default();
        let auth = auth(&signer, spender);
        permit2.consume(auth.owner, auth.nonce);
        let now = UnixTimestamp::from_secs(1_000_000_000);
        assert_eq!(
            permit2.validate(&auth, spender, 8453, now),
            Err(Permit2Error::InvalidNonce(U256::from(7)))
        );
    }

    #[test]
    fn test_spender_is_bound_by_signature() {
        let signer = PrivateKeySigner::random();
        let spender = Address::repeat_byte(0x55);
        let permit2 = Permit2::default();
        let auth = auth(&signer, spender);
        let now = UnixTimestamp::from_secs(1_000_000_000);
        assert_eq!(
            permit2.validate(&auth, Address::repeat_byte(0x56), 8453, now),
            Err(Permit2Error::InvalidSigner)
        );
    }

    #[test]
    fn test_expired_authorization_rejected() {
        let signer = PrivateKeySigner::random();
        let spender = Address::repeat_byte(0x55);
        let permit2 = Permit2::default();
        let auth = auth(&signer, spender);
        let now = UnixTimestamp::from_secs(2_000_000_001);
        assert!(matches!(
            permit2.validate(&auth, spender, 8453, now),
            Err(Permit2Error::SignatureExpired { .. })
        ));
    }

    #[test]
    fn test_requested_over_permitted_rejected() {
        let signer = PrivateKeySigner::random();
        let spender = Address::repeat_byte(0x55);
        let permit2 = Permit2::default();
        let mut auth = auth(&signer, spender);
        auth.requested_amount = U256::from(101);
        let now = UnixTimestamp::from_secs(1_000_000_000);
        assert!(matches!(
            permit2.validate(&auth, spender, 8453, now),
            Err(Permit2Error::InvalidAmount { .. })
        ));
    }
}
