//! Transfer intents: the off-chain-signed payment authorization object.
//!
//! A [`TransferIntent`] is authored and signed by an operator, consumed
//! exactly once by the settlement engine, and binds every economically
//! relevant parameter of a payment: the exact amount owed to the recipient,
//! the operator fee, the currency, the deadline, and — through the EIP-712
//! signing payload — the paying sender, the settlement contract identity, and
//! the chain id. Flipping any single field after signing changes the digest
//! and makes recovery yield a different address.
//!
//! # Digest construction
//!
//! ```text
//! digest    = keccak256("\x19\x01" ‖ domainSeparator ‖ structHash)
//! message   = digest                           if prefix is empty
//!           = keccak256(prefix ‖ digest)       otherwise
//! ```
//!
//! where the domain is `(name="Transfers", version="1", chainId,
//! verifyingContract)` and the struct hash covers all intent fields plus
//! `sender`, `contractAddress`, and `keccak256(prefix)`. The `prefix` slot
//! exists so wallets that can only produce `personal_sign`-style signatures
//! (a fixed prefix prepended to the digest) remain compatible.

use alloy_primitives::{Address, B256, Bytes, Signature, U256, keccak256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{Eip712Domain, SolStruct, eip712_domain};
use serde::{Deserialize, Serialize};

use crate::events::IntentId;
use crate::timestamp::UnixTimestamp;

/// EIP-712 domain name of the settlement contract.
pub const PROTOCOL_NAME: &str = "Transfers";
/// EIP-712 domain version of the settlement contract.
pub const PROTOCOL_VERSION: &str = "1";

mod typed {
    use alloy_sol_types::sol;

    sol! {
        /// EIP-712 struct signed by the operator.
        ///
        /// `prefix` is a `bytes` field, so its EIP-712 encoding is
        /// `keccak256(prefix)`; the raw prefix additionally wraps the final
        /// digest when non-empty.
        struct TransferIntent {
            uint256 recipientAmount;
            uint256 deadline;
            address recipient;
            address recipientCurrency;
            address refundDestination;
            uint256 feeAmount;
            bytes16 id;
            address operator;
            address sender;
            address contractAddress;
            bytes prefix;
        }
    }
}

/// Returns the EIP-712 domain for a settlement contract deployment.
pub fn settlement_domain(chain_id: u64, settlement: Address) -> Eip712Domain {
    eip712_domain! {
        name: PROTOCOL_NAME,
        version: PROTOCOL_VERSION,
        chain_id: chain_id,
        verifying_contract: settlement,
    }
}

/// A signed payment authorization, immutable once signed.
///
/// The `(operator, id)` pair is the replay-protection key: it maps to at most
/// one successful settlement, ever. `recipient_currency` of [`Address::ZERO`]
/// denotes the chain's native currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferIntent {
    /// Exact amount owed to `recipient`, in `recipient_currency` units.
    pub recipient_amount: U256,
    /// The intent is invalid once the chain clock passes this timestamp.
    /// A settlement landing exactly at the deadline is still valid.
    pub deadline: UnixTimestamp,
    /// Destination of `recipient_amount`. Must be non-zero.
    pub recipient: Address,
    /// Currency owed to the recipient. [`Address::ZERO`] denotes native.
    pub recipient_currency: Address,
    /// Destination for refunds of unused swap input. Informational at this
    /// layer; the swap router performs actual refund routing.
    pub refund_destination: Address,
    /// Amount owed to the operator's registered fee destination.
    pub fee_amount: U256,
    /// Opaque identifier, unique per operator. Not globally unique.
    pub id: IntentId,
    /// The identity that must be registered and must be the signer.
    pub operator: Address,
    /// 65-byte recoverable signature over the signing message.
    pub signature: Bytes,
    /// Optional bytes prepended to the digest before the final hash.
    /// Empty means the digest is signed directly.
    pub prefix: Bytes,
}

impl TransferIntent {
    /// Computes the message the operator must have signed for this intent to
    /// settle for `sender` against the settlement contract at `settlement`.
    pub fn signing_hash(&self, sender: Address, settlement: Address, chain_id: u64) -> B256 {
        let typed = typed::TransferIntent {
            recipientAmount: self.recipient_amount,
            deadline: U256::from(self.deadline.as_secs()),
            recipient: self.recipient,
            recipientCurrency: self.recipient_currency,
            refundDestination: self.refund_destination,
            feeAmount: self.fee_amount,
            id: self.id,
            operator: self.operator,
            sender,
            contractAddress: settlement,
            prefix: self.prefix.clone(),
        };
        let domain = settlement_domain(chain_id, settlement);
        let digest = typed.eip712_signing_hash(&domain);
        if self.prefix.is_empty() {
            digest
        } else {
            let mut message = Vec::with_capacity(self.prefix.len() + 32);
            message.extend_from_slice(&self.prefix);
            message.extend_from_slice(digest.as_slice());
            keccak256(&message)
        }
    }

    /// Recovers the signing address from the attached signature.
    ///
    /// Returns `None` for malformed signature bytes or failed recovery; the
    /// settlement engine treats both identically to a wrong signer.
    pub fn recover_signer(
        &self,
        sender: Address,
        settlement: Address,
        chain_id: u64,
    ) -> Option<Address> {
        let message = self.signing_hash(sender, settlement, chain_id);
        let signature = Signature::from_raw(&self.signature).ok()?;
        signature.recover_address_from_prehash(&message).ok()
    }
}

/// Intent fields before the operator's signature is attached.
///
/// Operators build one of these off-chain, sign it for a specific paying
/// sender and settlement deployment, and hand the resulting
/// [`TransferIntent`] to that sender.
#[derive(Debug, Clone)]
pub struct UnsignedTransferIntent {
    pub recipient_amount: U256,
    pub deadline: UnixTimestamp,
    pub recipient: Address,
    pub recipient_currency: Address,
    pub refund_destination: Address,
    pub fee_amount: U256,
    pub id: IntentId,
    pub operator: Address,
    pub prefix: Bytes,
}

impl UnsignedTransferIntent {
    /// Signs the intent for `sender` against the settlement contract at
    /// `settlement` on `chain_id`.
    pub fn sign(
        self,
        signer: &PrivateKeySigner,
        sender: Address,
        settlement: Address,
        chain_id: u64,
    ) -> Result<TransferIntent, alloy_signer::Error> {
        let mut intent = TransferIntent {
            recipient_amount: self.recipient_amount,
            deadline: self.deadline,
            recipient: self.recipient,
            recipient_currency: self.recipient_currency,
            refund_destination: self.refund_destination,
            fee_amount: self.fee_amount,
            id: self.id,
            operator: self.operator,
            signature: Bytes::new(),
            prefix: self.prefix,
        };
        let message = intent.signing_hash(sender, settlement, chain_id);
        let signature = signer.sign_hash_sync(&message)?;
        intent.signature = Bytes::from(signature.as_bytes().to_vec());
        Ok(intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::FixedBytes;

    fn unsigned(operator: Address) -> UnsignedTransferIntent {
        UnsignedTransferIntent {
            recipient_amount: U256::from(500_000u64),
            deadline: UnixTimestamp::from_secs(1_700_000_000),
            recipient: Address::repeat_byte(0x11),
            recipient_currency: Address::ZERO,
            refund_destination: Address::repeat_byte(0x22),
            fee_amount: U256::from(10_000u64),
            id: FixedBytes::repeat_byte(0xab),
            operator,
            prefix: Bytes::new(),
        }
    }

    #[test]
    fn test_sign_then_recover_yields_operator() {
        let signer = PrivateKeySigner::random();
        let sender = Address::repeat_byte(0x33);
        let settlement = Address::repeat_byte(0x44);
        let intent = unsigned(signer.address())
            .sign(&signer, sender, settlement, 8453)
            .unwrap();
        let recovered = intent.recover_signer(sender, settlement, 8453).unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn test_digest_binds_every_field() {
        let signer = PrivateKeySigner::random();
        let sender = Address::repeat_byte(0x33);
        let settlement = Address::repeat_byte(0x44);
        let intent = unsigned(signer.address())
            .sign(&signer, sender, settlement, 8453)
            .unwrap();
        let baseline = intent.signing_hash(sender, settlement, 8453);

        let mut tampered = intent.clone();
        tampered.recipient_amount += U256::from(1);
        assert_ne!(tampered.signing_hash(sender, settlement, 8453), baseline);

        let mut tampered = intent.clone();
        tampered.recipient = Address::repeat_byte(0x55);
        assert_ne!(tampered.signing_hash(sender, settlement, 8453), baseline);

        // Sender, contract, and chain id are bound even though they are not
        // fields of the wire struct.
        assert_ne!(
            intent.signing_hash(Address::repeat_byte(0x34), settlement, 8453),
            baseline
        );
        assert_ne!(
            intent.signing_hash(sender, Address::repeat_byte(0x45), 8453),
            baseline
        );
        assert_ne!(intent.signing_hash(sender, settlement, 1), baseline);
    }

    #[test]
    fn test_tampered_amount_recovers_different_signer() {
        let signer = PrivateKeySigner::random();
        let sender = Address::repeat_byte(0x33);
        let settlement = Address::repeat_byte(0x44);
        let mut intent = unsigned(signer.address())
            .sign(&signer, sender, settlement, 8453)
            .unwrap();
        intent.recipient_amount += U256::from(1);
        let recovered = intent.recover_signer(sender, settlement, 8453);
        assert_ne!(recovered, Some(signer.address()));
    }

    #[test]
    fn test_prefix_changes_message_and_still_recovers() {
        let signer = PrivateKeySigner::random();
        let sender = Address::repeat_byte(0x33);
        let settlement = Address::repeat_byte(0x44);
        let mut params = unsigned(signer.address());
        params.prefix = Bytes::from_static(b"\x19Ethereum Signed Message:\n32");
        let intent = params.sign(&signer, sender, settlement, 8453).unwrap();

        let mut without_prefix = intent.clone();
        without_prefix.prefix = Bytes::new();
        assert_ne!(
            intent.signing_hash(sender, settlement, 8453),
            without_prefix.signing_hash(sender, settlement, 8453)
        );
        assert_eq!(
            intent.recover_signer(sender, settlement, 8453),
            Some(signer.address())
        );
    }

    #[test]
    fn test_garbage_signature_recovers_none() {
        let signer = PrivateKeySigner::random();
        let sender = Address::repeat_byte(0x33);
        let settlement = Address::repeat_byte(0x44);
        let mut intent = unsigned(signer.address())
            .sign(&signer, sender, settlement, 8453)
            .unwrap();
        intent.signature = Bytes::from_static(&[0u8; 10]);
        assert_eq!(intent.recover_signer(sender, settlement, 8453), None);
    }

    #[test]
    fn test_wire_roundtrip() {
        let signer = PrivateKeySigner::random();
        let intent = unsigned(signer.address())
            .sign(
                &signer,
                Address::repeat_byte(0x33),
                Address::repeat_byte(0x44),
                8453,
            )
            .unwrap();
        let json = serde_json::to_string(&intent).unwrap();
        assert!(json.contains("recipientAmount"));
        let back: TransferIntent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, intent.id);
        assert_eq!(back.signature, intent.signature);
    }
}
