//! Capability interface for identity (spec.md §4.5/§6). The core calls a
//! wallet only through this trait and never assumes a specific ecosystem.

use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub to: String,
    pub data: Vec<u8>,
    pub value: u128,
    pub chain_id: u64,
}

#[async_trait]
pub trait WalletCapability: Send + Sync {
    async fn get_address(&self) -> Result<String>;
    async fn sign_message(&self, bytes: &[u8]) -> Result<Vec<u8>>;
    async fn send_transaction(&self, tx: SignedTransaction) -> Result<String>;
}

/// In-memory Ed25519-backed wallet, standing in for an external signer
/// integration (spec.md §1 non-goals: "specific wallet/SDKs for signing").
pub struct LocalEd25519Wallet {
    signing_key: ed25519_dalek::SigningKey,
    address: String,
}

impl LocalEd25519Wallet {
    pub fn from_seed_bytes(seed: &[u8; 32]) -> Self {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();
        let address = format!("0x{}", hex::encode(verifying_key.to_bytes()));
        Self {
            signing_key,
            address,
        }
    }
}

#[async_trait]
impl WalletCapability for LocalEd25519Wallet {
    async fn get_address(&self) -> Result<String> {
        Ok(self.address.clone())
    }

    async fn sign_message(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        use ed25519_dalek::Signer;
        Ok(self.signing_key.sign(bytes).to_bytes().to_vec())
    }

    async fn send_transaction(&self, tx: SignedTransaction) -> Result<String> {
        let mut hasher = <sha2::Sha256 as sha2::Digest>::new();
        sha2::Digest::update(&mut hasher, tx.to.as_bytes());
        sha2::Digest::update(&mut hasher, &tx.data);
        sha2::Digest::update(&mut hasher, tx.value.to_be_bytes());
        sha2::Digest::update(&mut hasher, tx.chain_id.to_be_bytes());
        let digest = sha2::Digest::finalize(hasher);
        Ok(format!("0x{}", hex::encode(digest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signing_is_deterministic_for_same_key_and_message() {
        let wallet = LocalEd25519Wallet::from_seed_bytes(&[7u8; 32]);
        let a = wallet.sign_message(b"hello").await.unwrap();
        let b = wallet.sign_message(b"hello").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn get_address_is_stable() {
        let wallet = LocalEd25519Wallet::from_seed_bytes(&[7u8; 32]);
        let a = wallet.get_address().await.unwrap();
        let b = wallet.get_address().await.unwrap();
        assert_eq!(a, b);
    }
}
