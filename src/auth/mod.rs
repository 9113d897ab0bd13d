use std::collections::BTreeSet;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::calls::LedgerCall;
use crate::ledger::Principal;

/// A ledger call authenticated by an ed25519 signature. The caller's
/// principal is the hex encoding of the public key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedCall {
    pub public_key: String,
    pub nonce: u64,
    pub call: LedgerCall,
    /// Hex-encoded; decoded only when the call is verified.
    pub signature: String,
}

impl SignedCall {
    pub fn sign(signing_key: &SigningKey, nonce: u64, call: LedgerCall) -> Self {
        let message = signing_message(nonce, &call);
        let signature = signing_key.sign(&message);
        Self {
            public_key: principal_of(&signing_key.verifying_key()),
            nonce,
            call,
            signature: hex::encode(signature.to_bytes()),
        }
    }

    /// Checks the signature and returns the authenticated principal.
    pub fn verify(&self) -> Result<Principal, AuthError> {
        let key_bytes: [u8; 32] = hex::decode(&self.public_key)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| AuthError::MalformedPublicKey(self.public_key.clone()))?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| AuthError::MalformedPublicKey(self.public_key.clone()))?;
        let signature = hex::decode(&self.signature)
            .ok()
            .and_then(|bytes| Signature::from_slice(&bytes).ok())
            .ok_or_else(|| AuthError::MalformedSignature(self.public_key.clone()))?;
        key.verify_strict(&signing_message(self.nonce, &self.call), &signature)
            .map_err(|_| AuthError::InvalidSignature(self.public_key.clone()))?;
        Ok(principal_of(&key))
    }
}

pub fn principal_of(key: &VerifyingKey) -> Principal {
    hex::encode(key.as_bytes())
}

fn signing_message(nonce: u64, call: &LedgerCall) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"grid-ledger-signed-call");
    hasher.update(nonce.to_le_bytes());
    hasher.update(call.digest());
    hasher.finalize().into()
}

/// Remembers which (principal, nonce) pairs have already been accepted.
#[derive(Debug, Default)]
pub struct ReplayGuard {
    seen: BTreeSet<(Principal, u64)>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifies the call and rejects a nonce the same principal already used.
    pub fn admit(&mut self, signed: &SignedCall) -> Result<Principal, AuthError> {
        let principal = signed.verify()?;
        if !self.seen.insert((principal.clone(), signed.nonce)) {
            return Err(AuthError::Replayed {
                principal,
                nonce: signed.nonce,
            });
        }
        Ok(principal)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed public key {0}")]
    MalformedPublicKey(String),
    #[error("malformed signature from {0}")]
    MalformedSignature(String),
    #[error("invalid signature from {0}")]
    InvalidSignature(String),
    #[error("nonce {nonce} already used by {principal}")]
    Replayed { principal: Principal, nonce: u64 },
}
