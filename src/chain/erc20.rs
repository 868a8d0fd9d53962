//! Fungible token contracts for the simulated ledger.
//!
//! The settlement engine only ever talks to tokens through the [`Erc20`]
//! trait. Transfer methods return `bool` rather than `Result` on purpose:
//! real-world tokens include non-reverting implementations that signal
//! failure with a `false` return, and the engine must treat that identically
//! to a revert.
//!
//! Besides the well-behaved [`StandardErc20`] (with real EIP-2612 `permit`
//! verification), this module ships the non-standard specimens the engine is
//! required to detect and reject: fee-on-transfer, rebasing, false-returning,
//! and a permit implementation that reports success without advancing its
//! nonce.

use alloy_primitives::{Address, Bytes, Signature, U256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{SolStruct, eip712_domain, sol};
use std::collections::HashMap;

use crate::timestamp::UnixTimestamp;

sol! {
    /// EIP-2612 permit message, hashed under the token's own EIP-712 domain.
    struct Permit {
        address owner;
        address spender;
        uint256 value;
        uint256 nonce;
        uint256 deadline;
    }
}

/// The fungible-token interface the settlement engine consumes.
///
/// `transfer`/`transfer_from`/`permit` return `false` on failure instead of
/// an error; callers must not assume a `true` return moved the exact amount
/// either — that is what the exact-transfer verifier is for.
pub trait Erc20 {
    /// Deployed address of this token contract.
    fn address(&self) -> Address;
    /// EIP-712 domain name, also used for diagnostics.
    fn name(&self) -> &str;
    fn balance_of(&self, owner: Address) -> U256;
    fn allowance(&self, owner: Address, spender: Address) -> U256;
    fn approve(&mut self, owner: Address, spender: Address, amount: U256);
    fn transfer(&mut self, from: Address, to: Address, amount: U256) -> bool;
    fn transfer_from(&mut self, spender: Address, from: Address, to: Address, amount: U256)
    -> bool;
    /// Credits `amount` to `to` out of thin air. Fixture setup only.
    fn mint(&mut self, to: Address, amount: U256);
    /// Destroys `amount` held by `from`.
    fn burn(&mut self, from: Address, amount: U256) -> bool;
    /// EIP-2612 permit-by-signature. Implementations verify the signature
    /// against their own domain and advance the owner's nonce on success.
    fn permit(
        &mut self,
        owner: Address,
        spender: Address,
        value: U256,
        deadline: UnixTimestamp,
        signature: &Bytes,
        chain_id: u64,
        now: UnixTimestamp,
    ) -> bool;
    /// Current EIP-2612 nonce for `owner`.
    fn nonce_of(&self, owner: Address) -> U256;
    fn box_clone(&self) -> Box<dyn Erc20>;
}

impl Clone for Box<dyn Erc20> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Shared balance/allowance/nonce bookkeeping for the token implementations.
#[derive(Debug, Clone, Default)]
pub(crate) struct TokenLedger {
    balances: HashMap<Address, U256>,
    allowances: HashMap<(Address, Address), U256>,
    nonces: HashMap<Address, U256>,
}

impl TokenLedger {
    fn balance_of(&self, owner: Address) -> U256 {
        self.balances.get(&owner).copied().unwrap_or_default()
    }

    fn allowance(&self, owner: Address, spender: Address) -> U256 {
        self.allowances
            .get(&(owner, spender))
            .copied()
            .unwrap_or_default()
    }

    fn credit(&mut self, to: Address, amount: U256) {
        *self.balances.entry(to).or_default() += amount;
    }

    fn debit(&mut self, from: Address, amount: U256) -> bool {
        let balance = self.balance_of(from);
        if balance < amount {
            return false;
        }
        self.balances.insert(from, balance - amount);
        true
    }

    fn spend_allowance(&mut self, owner: Address, spender: Address, amount: U256) -> bool {
        let allowance = self.allowance(owner, spender);
        if allowance < amount {
            return false;
        }
        // U256::MAX is the conventional "infinite" allowance and is not decremented.
        if allowance != U256::MAX {
            self.allowances.insert((owner, spender), allowance - amount);
        }
        true
    }

    fn nonce_of(&self, owner: Address) -> U256 {
        self.nonces.get(&owner).copied().unwrap_or_default()
    }

    fn bump_nonce(&mut self, owner: Address) {
        let next = self.nonce_of(owner) + U256::from(1);
        self.nonces.insert(owner, next);
    }
}

/// Verifies an EIP-2612 permit signature against the token's domain.
///
/// Returns `true` when the recovered signer is `owner` and the deadline has
/// not passed. Pure check; nonce advancement is the caller's business.
fn permit_signature_valid(
    token: Address,
    token_name: &str,
    ledger: &TokenLedger,
    owner: Address,
    spender: Address,
    value: U256,
    deadline: UnixTimestamp,
    signature: &Bytes,
    chain_id: u64,
    now: UnixTimestamp,
) -> bool {
    if deadline < now {
        return false;
    }
    let message = Permit {
        owner,
        spender,
        value,
        nonce: ledger.nonce_of(owner),
        deadline: U256::from(deadline.as_secs()),
    };
    let domain = eip712_domain! {
        name: token_name.to_string(),
        version: "1",
        chain_id: chain_id,
        verifying_contract: token,
    };
    let digest = message.eip712_signing_hash(&domain);
    let Ok(signature) = Signature::from_raw(signature) else {
        return false;
    };
    signature
        .recover_address_from_prehash(&digest)
        .map(|recovered| recovered == owner)
        .unwrap_or(false)
}

/// Signs an EIP-2612 permit for `spender` over `value` tokens.
///
/// Counterpart of [`StandardErc20`]'s `permit` verification; used by payers
/// (and tests) to produce the subsidized-transfer funding payload.
#[allow(clippy::too_many_arguments)]
pub fn sign_permit(
    signer: &PrivateKeySigner,
    token: Address,
    token_name: &str,
    spender: Address,
    value: U256,
    nonce: U256,
    deadline: UnixTimestamp,
    chain_id: u64,
) -> Result<Bytes, alloy_signer::Error> {
    let message = Permit {
        owner: signer.address(),
        spender,
        value,
        nonce,
        deadline: U256::from(deadline.as_secs()),
    };
    let domain = eip712_domain! {
        name: token_name.to_string(),
        version: "1",
        chain_id: chain_id,
        verifying_contract: token,
    };
    let digest = message.eip712_signing_hash(&domain);
    let signature = signer.sign_hash_sync(&digest)?;
    Ok(Bytes::from(signature.as_bytes().to_vec()))
}

/// A well-behaved ERC-20 with working EIP-2612 permit.
#[derive(Debug, Clone)]
pub struct StandardErc20 {
    address: Address,
    name: String,
    ledger: TokenLedger,
}

impl StandardErc20 {
    pub fn new(address: Address, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            ledger: TokenLedger::default(),
        }
    }
}

impl Erc20 for StandardErc20 {
    fn address(&self) -> Address {
        self.address
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn balance_of(&self, owner: Address) -> U256 {
        self.ledger.balance_of(owner)
    }

    fn allowance(&self, owner: Address, spender: Address) -> U256 {
        self.ledger.allowance(owner, spender)
    }

    fn approve(&mut self, owner: Address, spender: Address, amount: U256) {
        self.ledger.allowances.insert((owner, spender), amount);
    }

    fn transfer(&mut self, from: Address, to: Address, amount: U256) -> bool {
        if !self.ledger.debit(from, amount) {
            return false;
        }
        self.ledger.credit(to, amount);
        true
    }

    fn transfer_from(
        &mut self,
        spender: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> bool {
        if !self.ledger.spend_allowance(from, spender, amount) {
            return false;
        }
        self.transfer(from, to, amount)
    }

    fn mint(&mut self, to: Address, amount: U256) {
        self.ledger.credit(to, amount);
    }

    fn burn(&mut self, from: Address, amount: U256) -> bool {
        self.ledger.debit(from, amount)
    }

    fn permit(
        &mut self,
        owner: Address,
        spender: Address,
        value: U256,
        deadline: UnixTimestamp,
        signature: &Bytes,
        chain_id: u64,
        now: UnixTimestamp,
    ) -> bool {
        if !permit_signature_valid(
            self.address,
            &self.name,
            &self.ledger,
            owner,
            spender,
            value,
            deadline,
            signature,
            chain_id,
            now,
        ) {
            return false;
        }
        self.ledger.allowances.insert((owner, spender), value);
        self.ledger.bump_nonce(owner);
        true
    }

    fn nonce_of(&self, owner: Address) -> U256 {
        self.ledger.nonce_of(owner)
    }

    fn box_clone(&self) -> Box<dyn Erc20> {
        Box::new(self.clone())
    }
}

/// A token that skims a basis-point fee from every transfer.
///
/// The recipient receives less than the sent amount; the exact-transfer
/// verifier must catch this as an inexact delivery.
#[derive(Debug, Clone)]
pub struct FeeOnTransferToken {
    address: Address,
    name: String,
    fee_bps: u64,
    ledger: TokenLedger,
}

impl FeeOnTransferToken {
    pub fn new(address: Address, name: impl Into<String>, fee_bps: u64) -> Self {
        Self {
            address,
            name: name.into(),
            fee_bps,
            ledger: TokenLedger::default(),
        }
    }

    fn taxed(&self, amount: U256) -> U256 {
        amount - amount * U256::from(self.fee_bps) / U256::from(10_000u64)
    }
}

impl Erc20 for FeeOnTransferToken {
    fn address(&self) -> Address {
        self.address
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn balance_of(&self, owner: Address) -> U256 {
        self.ledger.balance_of(owner)
    }

    fn allowance(&self, owner: Address, spender: Address) -> U256 {
        self.ledger.allowance(owner, spender)
    }

    fn approve(&mut self, owner: Address, spender: Address, amount: U256) {
        self.ledger.allowances.insert((owner, spender), amount);
    }

    fn transfer(&mut self, from: Address, to: Address, amount: U256) -> bool {
        if !self.ledger.debit(from, amount) {
            return false;
        }
        self.ledger.credit(to, self.taxed(amount));
        true
    }

    fn transfer_from(
        &mut self,
        spender: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> bool {
        if !self.ledger.spend_allowance(from, spender, amount) {
            return false;
        }
        self.transfer(from, to, amount)
    }

    fn mint(&mut self, to: Address, amount: U256) {
        self.ledger.credit(to, amount);
    }

    fn burn(&mut self, from: Address, amount: U256) -> bool {
        self.ledger.debit(from, amount)
    }

    fn permit(
        &mut self,
        _owner: Address,
        _spender: Address,
        _value: U256,
        _deadline: UnixTimestamp,
        _signature: &Bytes,
        _chain_id: u64,
        _now: UnixTimestamp,
    ) -> bool {
        false
    }

    fn nonce_of(&self, owner: Address) -> U256 {
        self.ledger.nonce_of(owner)
    }

    fn box_clone(&self) -> Box<dyn Erc20> {
        Box::new(self.clone())
    }
}

/// A token that mints a basis-point bonus to the recipient on every transfer.
///
/// Models positively rebasing behavior: the destination receives more than
/// the sent amount.
#[derive(Debug, Clone)]
pub struct RebasingToken {
    address: Address,
    name: String,
    bonus_bps: u64,
    ledger: TokenLedger,
}

impl RebasingToken {
    pub fn new(address: Address, name: impl Into<String>, bonus_bps: u64) -> Self {
        Self {
            address,
            name: name.into(),
            bonus_bps,
            ledger: TokenLedger::default(),
        }
    }

    fn rebased(&self, amount: U256) -> U256 {
        amount + amount * U256::from(self.bonus_bps) / U256::from(10_000u64)
    }
}

impl Erc20 for RebasingToken {
    fn address(&self) -> Address {
        self.address
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn balance_of(&self, owner: Address) -> U256 {
        self.ledger.balance_of(owner)
    }

    fn allowance(&self, owner: Address, spender: Address) -> U256 {
        self.ledger.allowance(owner, spender)
    }

    fn approve(&mut self, owner: Address, spender: Address, amount: U256) {
        self.ledger.allowances.insert((owner, spender), amount);
    }

    fn transfer(&mut self, from: Address, to: Address, amount: U256) -> bool {
        if !self.ledger.debit(from, amount) {
            return false;
        }
        self.ledger.credit(to, self.rebased(amount));
        true
    }

    fn transfer_from(
        &mut self,
        spender: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> bool {
        if !self.ledger.spend_allowance(from, spender, amount) {
            return false;
        }
        self.transfer(from, to, amount)
    }

    fn mint(&mut self, to: Address, amount: U256) {
        self.ledger.credit(to, amount);
    }

    fn burn(&mut self, from: Address, amount: U256) -> bool {
        self.ledger.debit(from, amount)
    }

    fn permit(
        &mut self,
        _owner: Address,
        _spender: Address,
        _value: U256,
        _deadline: UnixTimestamp,
        _signature: &Bytes,
        _chain_id: u64,
        _now: UnixTimestamp,
    ) -> bool {
        false
    }

    fn nonce_of(&self, owner: Address) -> U256 {
        self.ledger.nonce_of(owner)
    }

    fn box_clone(&self) -> Box<dyn Erc20> {
        Box::new(self.clone())
    }
}

/// A token whose transfers always return `false` without moving funds.
///
/// The engine must treat the `false` return exactly like a revert.
#[derive(Debug, Clone)]
pub struct FalseReturningToken {
    address: Address,
    name: String,
    ledger: TokenLedger,
}

impl FalseReturningToken {
    pub fn new(address: Address, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            ledger: TokenLedger::default(),
        }
    }
}

impl Erc20 for FalseReturningToken {
    fn address(&self) -> Address {
        self.address
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn balance_of(&self, owner: Address) -> U256 {
        self.ledger.balance_of(owner)
    }

    fn allowance(&self, owner: Address, spender: Address) -> U256 {
        self.ledger.allowance(owner, spender)
    }

    fn approve(&mut self, owner: Address, spender: Address, amount: U256) {
        self.ledger.allowances.insert((owner, spender), amount);
    }

    fn transfer(&mut self, _from: Address, _to: Address, _amount: U256) -> bool {
        false
    }

    fn transfer_from(
        &mut self,
        _spender: Address,
        _from: Address,
        _to: Address,
        _amount: U256,
    ) -> bool {
        false
    }

    fn mint(&mut self, to: Address, amount: U256) {
        self.ledger.credit(to, amount);
    }

    fn burn(&mut self, from: Address, amount: U256) -> bool {
        self.ledger.debit(from, amount)
    }

    fn permit(
        &mut self,
        _owner: Address,
        _spender: Address,
        _value: U256,
        _deadline: UnixTimestamp,
        _signature: &Bytes,
        _chain_id: u64,
        _now: UnixTimestamp,
    ) -> bool {
        false
    }

    fn nonce_of(&self, owner: Address) -> U256 {
        self.ledger.nonce_of(owner)
    }

    fn box_clone(&self) -> Box<dyn Erc20> {
        Box::new(self.clone())
    }
}

/// A token whose `permit` verifies the signature and sets the allowance but
/// never advances the owner's nonce.
///
/// The subsidized settlement path must detect the stuck nonce and fail with
/// a permit-call failure rather than proceeding.
#[derive(Debug, Clone)]
pub struct StuckPermitToken {
    inner: StandardErc20,
}

impl StuckPermitToken {
    pub fn new(address: Address, name: impl Into<String>) -> Self {
        Self {
            inner: StandardErc20::new(address, name),
        }
    }
}

impl Erc20 for StuckPermitToken {
    fn address(&self) -> Address {
        self.inner.address
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn balance_of(&self, owner: Address) -> U256 {
        self.inner.balance_of(owner)
    }

    fn allowance(&self, owner: Address, spender: Address) -> U256 {
        self.inner.allowance(owner, spender)
    }

    fn approve(&mut self, owner: Address, spender: Address, amount: U256) {
        self.inner.approve(owner, spender, amount);
    }

    fn transfer(&mut self, from: Address, to: Address, amount: U256) -> bool {
        self.inner.transfer(from, to, amount)
    }

    fn transfer_from(
        &mut self,
        spender: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> bool {
        self.inner.transfer_from(spender, from, to, amount)
    }

    fn mint(&mut self, to: Address, amount: U256) {
        self.inner.mint(to, amount);
    }

    fn burn(&mut self, from: Address, amount: U256) -> bool {
        self.inner.burn(from, amount)
    }

    fn permit(
        &mut self,
        owner: Address,
        spender: Address,
        value: U256,
        deadline: UnixTimestamp,
        signature: &Bytes,
        chain_id: u64,
        now: UnixTimestamp,
    ) -> bool {
        if !permit_signature_valid(
            self.inner.address,
            &self.inner.name,
            &self.inner.ledger,
            owner,
            spender,
            value,
            deadline,
            signature,
            chain_id,
            now,
        ) {
            return false;
        }
        self.inner.ledger.allowances.insert((owner, spender), value);
        // Nonce deliberately left alone.
        true
    }

    fn nonce_of(&self, owner: Address) -> U256 {
        self.inner.nonce_of(owner)
    }

    fn box_clone(&self) -> Box<dyn Erc20> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> StandardErc20 {
        StandardErc20::new(Address::repeat_byte(0xaa), "Test Coin")
    }

    #[test]
    fn test_transfer_moves_exact_amount() {
        let mut token = token();
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        token.mint(a, U256::from(100));
        assert!(token.transfer(a, b, U256::from(40)));
        assert_eq!(token.balance_of(a), U256::from(60));
        assert_eq!(token.balance_of(b), U256::from(40));
    }

    #[test]
    fn test_transfer_fails_on_insufficient_balance() {
        let mut token = token();
        let a = Address::repeat_byte(1);
        token.mint(a, U256::from(10));
        assert!(!token.transfer(a, Address::repeat_byte(2), U256::from(11)));
        assert_eq!(token.balance_of(a), U256::from(10));
    }

    #[test]
    fn test_transfer_from_spends_allowance() {
        let mut token = token();
        let owner = Address::repeat_byte(1);
        let spender = Address::repeat_byte(2);
        let dest = Address::repeat_byte(3);
        token.mint(owner, U256::from(100));
        token.approve(owner, spender, U256::from(50));
        assert!(token.transfer_from(spender, owner, dest, U256::from(30)));
        assert_eq!(token.allowance(owner, spender), U256::from(20));
        assert!(!token.transfer_from(spender, owner, dest, U256::from(30)));
    }

    #[test]
    fn test_infinite_allowance_not_decremented() {
        let mut token = token();
        let owner = Address::repeat_byte(1);
        let spender = Address::repeat_byte(2);
        token.mint(owner, U256::from(100));
        token.approve(owner, spender, U256::MAX);
        assert!(token.transfer_from(spender, owner, spender, U256::from(30)));
        assert_eq!(token.allowance(owner, spender), U256::MAX);
    }

    #[test]
    fn test_fee_on_transfer_skims() {
        let mut token = FeeOnTransferToken::new(Address::repeat_byte(0xbb), "Tax Coin", 500);
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        token.mint(a, U256::from(1000));
        assert!(token.transfer(a, b, U256::from(1000)));
        assert_eq!(token.balance_of(b), U256::from(950));
    }

    #[test]
    fn test_rebasing_overdelivers() {
        let mut token = RebasingToken::new(Address::repeat_byte(0xcc), "Bonus Coin", 100);
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        token.mint(a, U256::from(1000));
        assert!(token.transfer(a, b, U256::from(1000)));
        assert_eq!(token.balance_of(b), U256::from(1010));
    }

    #[test]
    fn test_permit_sets_allowance_and_bumps_nonce() {
        let mut token = token();
        let signer = PrivateKeySigner::random();
        let owner = signer.address();
        let spender = Address::repeat_byte(9);
        let deadline = UnixTimestamp::from_secs(2_000_000_000);
        let signature = sign_permit(
            &signer,
            token.address(),
            "Test Coin",
            spender,
            U256::from(77),
            token.nonce_of(owner),
            deadline,
            8453,
        )
        .unwrap();
        let now = UnixTimestamp::from_secs(1_000_000_000);
        assert!(token.permit(owner, spender, U256::from(77), deadline, &signature, 8453, now));
        assert_eq!(token.allowance(owner, spender), U256::from(77));
        assert_eq!(token.nonce_of(owner), U256::from(1));
        // Replay with the consumed nonce fails.
        assert!(!token.permit(owner, spender, U256::from(77), deadline, &signature, 8453, now));
    }

    #[test]
    fn test_permit_rejects_wrong_signer() {
        let mut token = token();
        let signer = PrivateKeySigner::random();
        let other = PrivateKeySigner::random();
        let spender = Address::repeat_byte(9);
        let deadline = UnixTimestamp::from_secs(2_000_000_000);
        let signature = sign_permit(
            &signer,
            token.address(),
            "Test Coin",
            spender,
            U256::from(77),
            U256::ZERO,
            deadline,
            8453,
        )
        .unwrap();
        let now = UnixTimestamp::from_secs(1_000_000_000);
        assert!(!token.permit(
            other.address(),
            spender,
            U256::from(77),
            deadline,
            &signature,
            8453,
            now
        ));
    }

    #[test]
    fn test_stuck_permit_token_keeps_nonce() {
        let mut token = StuckPermitToken::new(Address::repeat_byte(0xdd), "Stuck Coin");
        let signer = PrivateKeySigner::random();
        let spender = Address::repeat_byte(9);
        let deadline = UnixTimestamp::from_secs(2_000_000_000);
        let signature = sign_permit(
            &signer,
            token.address(),
            "Stuck Coin",
            spender,
            U256::from(5),
            U256::ZERO,
            deadline,
            8453,
        )
        .unwrap();
        let now = UnixTimestamp::from_secs(1_000_000_000);
        assert!(token.permit(
            signer.address(),
            spender,
            U256::from(5),
            deadline,
            &signature,
            8453,
            now
        ));
        assert_eq!(token.nonce_of(signer.address()), U256::ZERO);
    }
}
