use async_trait::async_trait;
use bitcoin::{Address, Network, Txid};

use crate::types::{Result, TxConfirmation, Utxo};

/// Source of spendable outputs for a funding address.
#[async_trait]
pub trait UtxoSource: Send + Sync {
    async fn fetch_utxos(&self, address: &Address) -> Result<Vec<Utxo>>;
}

#[async_trait]
pub trait TransactionBroadcaster: Send + Sync {
    async fn broadcast(&self, network: Network, raw_tx_hex: &str) -> Result<Txid>;
    async fn get_status(&self, network: Network, txid: &Txid) -> Result<TxConfirmation>;
}

/// Readiness of the environment the inscriber depends on.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn is_healthy(&self) -> bool;
}
