//! Public key registry
//!
//! Parties publish the key payloads should be encrypted to under
//! [`PUBLIC_KEY_ENTRY`] in their own namespace of a key-value store contract.
//! The value is the 128-hex encoding of the uncompressed point.

use secp256k1::PublicKey;

use crate::{
    crypto::{public_key_from_hex, public_key_to_bytes},
    ledger::{Address, ContractCall, Ledger, LedgerQuery},
    EscrowResult,
};

/// Key-value entry holding a party's encryption key
pub const PUBLIC_KEY_ENTRY: &str = "hmt_pub_key";

/// Call publishing `public` for whoever signs it
pub fn publish_call(public: &PublicKey) -> ContractCall {
    ContractCall::SetKv {
        key: PUBLIC_KEY_ENTRY.to_string(),
        value: hex::encode(public_key_to_bytes(public)),
    }
}

/// Key published by `owner`, `None` when nothing is registered
pub async fn lookup_public_key(
    ledger: &dyn Ledger,
    kvstore: &Address,
    owner: &Address,
) -> EscrowResult<Option<PublicKey>> {
    let query = LedgerQuery::KvGet {
        owner: *owner,
        key: PUBLIC_KEY_ENTRY.to_string(),
    };
    let value = ledger.read_state(kvstore, query).await?.into_text()?;
    if value.is_empty() {
        return Ok(None);
    }
    public_key_from_hex(&value).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        credentials::Credential,
        crypto::KeyPair,
        error::EscrowError,
        ledger::{MemoryLedger, UnsignedTransaction},
    };

    const OWNER: &str = "0x1413862C2B7054CDbfdc181B83962CB0FC11fD92";
    const OWNER_PRIV: &str = "28e516f1e2f99e96a48a23cea1f94ee5f073403a1c68e818263f0eb898f1c8e5";
    const OWNER_PUB: &str = "2dbc2c2c86052702e7c219339514b2e8bd4687ba1236c478ad41b43330b08488c12c8c1797aa181f3a4596a1bd8a0c18344ea44d6655f61fa73e56e743f79e0d";

    fn kvstore() -> Address {
        "0xbcF8274FAb0cbeD0099B2cAFe862035a6217Bf44".parse().unwrap()
    }

    async fn set(ledger: &MemoryLedger, signer: &Credential, call: ContractCall) {
        let nonce = ledger.get_nonce(&signer.address()).await.unwrap();
        let tx = UnsignedTransaction {
            from: signer.address(),
            to: kvstore(),
            call,
            nonce,
            gas: 4_712_388,
        };
        let receipt = ledger.submit_transaction(signer.sign(tx).unwrap()).await.unwrap();
        assert!(receipt.success);
    }

    #[test]
    fn test_publish_call_encodes_point() {
        let public = public_key_from_hex(OWNER_PUB).unwrap();
        match publish_call(&public) {
            ContractCall::SetKv { key, value } => {
                assert_eq!(key, "hmt_pub_key");
                assert_eq!(value, OWNER_PUB);
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_then_lookup() {
        let ledger = MemoryLedger::new(Address::ZERO);
        let owner = Credential::new(OWNER, OWNER_PRIV).unwrap();
        assert_eq!(
            lookup_public_key(&ledger, &kvstore(), &owner.address()).await.unwrap(),
            None
        );

        set(&ledger, &owner, publish_call(&owner.public_key())).await;
        let found = lookup_public_key(&ledger, &kvstore(), &owner.address())
            .await
            .unwrap();
        assert_eq!(found, Some(public_key_from_hex(OWNER_PUB).unwrap()));
    }

    #[tokio::test]
    async fn test_garbage_entry_is_rejected() {
        let ledger = MemoryLedger::new(Address::ZERO);
        let owner = Credential::from_secret(*KeyPair::generate().secret());
        let garbage = ContractCall::SetKv {
            key: PUBLIC_KEY_ENTRY.to_string(),
            value: "not a key".to_string(),
        };
        set(&ledger, &owner, garbage).await;

        assert!(matches!(
            lookup_public_key(&ledger, &kvstore(), &owner.address()).await,
            Err(EscrowError::InvalidPublicKey(_))
        ));
    }
}
