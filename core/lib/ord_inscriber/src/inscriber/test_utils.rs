use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::{
    consensus::encode::deserialize_hex, key::CompressedPublicKey, Address, Network, Transaction,
    Txid,
};

use crate::{
    inscriber::{
        script_builder::{build_envelope, build_leaf_script},
        taproot::derive_address,
        types::P2TRDetails,
    },
    signer::{KeyManager, KeyPair, SECP},
    traits::{HealthCheck, TransactionBroadcaster, UtxoSource},
    types::{ChainStatus, InscriberError, Result, TxConfirmation, Utxo},
};

/// Fresh P2WPKH address for `network`.
pub fn test_p2wpkh_address(network: Network) -> Address {
    let key = KeyManager::generate_key_pair();
    let secret_key = key.secret_key().expect("Generated key must be valid");
    let public_key = CompressedPublicKey(secret_key.public_key(&*SECP));
    Address::p2wpkh(&public_key, network)
}

/// A "Hello, Ordinals!" text commitment with its reveal key.
pub fn test_commitment(network: Network) -> (KeyPair, P2TRDetails) {
    let key = KeyManager::generate_key_pair();
    let envelope = build_envelope(
        "Hello, Ordinals!",
        "text/plain",
        Vec::<(Vec<u8>, Vec<u8>)>::new(),
    )
    .expect("Failed to build test envelope");
    let script =
        build_leaf_script(&envelope, &key.public_key()).expect("Failed to build leaf script");
    let details = derive_address(key.public_key(), Some(&script), network)
        .expect("Failed to derive commit address");

    (key, details)
}

#[derive(Debug, Clone)]
pub struct MockChainConfig {
    pub utxos: Vec<Utxo>,
    pub fetch_error: Option<String>,
    pub broadcast_error: Option<String>,
    pub confirmation: TxConfirmation,
}

impl Default for MockChainConfig {
    fn default() -> Self {
        Self {
            utxos: Vec::new(),
            fetch_error: None,
            broadcast_error: None,
            confirmation: TxConfirmation {
                status: ChainStatus::Mempool,
                confirmations: 0,
            },
        }
    }
}

impl MockChainConfig {
    pub fn set_confirmation(&mut self, status: ChainStatus, confirmations: u32) {
        self.confirmation = TxConfirmation {
            status,
            confirmations,
        };
    }
}

/// In-memory chain serving UTXOs and accepting broadcasts.
#[derive(Debug, Default)]
pub struct MockChain {
    config: Mutex<MockChainConfig>,
    broadcasts: Mutex<Vec<Transaction>>,
}

impl MockChain {
    pub fn new(config: MockChainConfig) -> Self {
        Self {
            config: Mutex::new(config),
            broadcasts: Mutex::new(Vec::new()),
        }
    }

    pub fn set_confirmation(&self, status: ChainStatus, confirmations: u32) {
        if let Ok(mut config) = self.config.lock() {
            config.set_confirmation(status, confirmations);
        }
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.broadcasts
            .lock()
            .map(|txs| txs.clone())
            .unwrap_or_default()
    }

    fn config(&self) -> Result<MockChainConfig> {
        self.config
            .lock()
            .map(|config| config.clone())
            .map_err(|e| InscriberError::InitializationFailed(e.to_string()))
    }
}

#[async_trait]
impl UtxoSource for MockChain {
    async fn fetch_utxos(&self, _address: &Address) -> Result<Vec<Utxo>> {
        let config = self.config()?;
        match config.fetch_error {
            Some(message) => Err(InscriberError::UtxoSourceFailure(message)),
            None => Ok(config.utxos),
        }
    }
}

#[async_trait]
impl TransactionBroadcaster for MockChain {
    async fn broadcast(&self, _network: Network, raw_tx_hex: &str) -> Result<Txid> {
        if let Some(message) = self.config()?.broadcast_error {
            return Err(InscriberError::BroadcastFailure(message));
        }

        let transaction: Transaction = deserialize_hex(raw_tx_hex)
            .map_err(|e| InscriberError::BroadcastFailure(format!("TX decode failed: {e}")))?;
        let txid = transaction.compute_txid();
        if let Ok(mut broadcasts) = self.broadcasts.lock() {
            broadcasts.push(transaction);
        }
        Ok(txid)
    }

    async fn get_status(&self, _network: Network, _txid: &Txid) -> Result<TxConfirmation> {
        Ok(self.config()?.confirmation)
    }
}

/// Health check with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticHealthCheck {
    healthy: bool,
}

impl StaticHealthCheck {
    pub fn new(healthy: bool) -> Self {
        Self { healthy }
    }
}

#[async_trait]
impl HealthCheck for StaticHealthCheck {
    async fn is_healthy(&self) -> bool {
        self.healthy
    }
}
