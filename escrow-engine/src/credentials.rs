//! Signing credentials
//!
//! A credential is an (address, private key) pair, validated once when it is
//! built. Everything downstream can rely on the address being the one the key
//! actually controls.

use std::fmt;

use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use tracing::debug;

use crate::{
    crypto::keys::secret_key_from_hex,
    error::EscrowError,
    ledger::{keccak256, Address, SignedTransaction, UnsignedTransaction},
    EscrowResult,
};

/// A validated signing identity
#[derive(Clone)]
pub struct Credential {
    address: Address,
    secret: SecretKey,
}

impl Credential {
    /// Pair an address with its private key
    ///
    /// Fails with `CredentialMismatch` when the key does not derive the
    /// address. Letter case of the address is ignored.
    pub fn new(address: &str, private_key: &str) -> EscrowResult<Self> {
        let claimed: Address = address.parse()?;
        let credential = Self::from_secret(secret_key_from_hex(private_key)?);
        if credential.address != claimed {
            return Err(EscrowError::credential_mismatch(address));
        }
        Ok(credential)
    }

    /// Build the credential owning `secret`
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = PublicKey::from_secret_key(&Secp256k1::signing_only(), &secret);
        Self {
            address: Address::from_public_key(&public),
            secret,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::signing_only(), &self.secret)
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// Sign a transaction with a recoverable signature
    pub fn sign(&self, transaction: UnsignedTransaction) -> EscrowResult<SignedTransaction> {
        if transaction.from != self.address {
            return Err(EscrowError::invalid_credential(format!(
                "transaction from {} cannot be signed by {}",
                transaction.from, self.address
            )));
        }

        let digest = transaction.signing_hash()?;
        let message = Message::from_digest_slice(&digest)
            .map_err(|e| EscrowError::internal(format!("signing digest: {}", e)))?;
        let signature = Secp256k1::signing_only().sign_ecdsa_recoverable(&message, &self.secret);
        let (recovery_id, compact) = signature.serialize_compact();

        let mut preimage = Vec::with_capacity(96);
        preimage.extend_from_slice(&digest);
        preimage.extend_from_slice(&compact);
        let hash = format!("0x{}", hex::encode(keccak256(&preimage)));

        debug!(
            "Signed {} nonce {} as {}",
            transaction.call.name(),
            transaction.nonce,
            hash
        );

        Ok(SignedTransaction {
            transaction,
            signature: compact,
            recovery_id: recovery_id.to_i32(),
            hash,
        })
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Whether `private_key` controls `address`
pub fn validate_credentials(address: &str, private_key: &str) -> bool {
    Credential::new(address, private_key).is_ok()
}
