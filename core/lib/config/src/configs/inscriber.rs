use std::{str::FromStr, time::Duration};

use bitcoin::{Amount, Network};
use serde::{Deserialize, Serialize};

const DEFAULT_POSTAGE_SATS: u64 = 551;
const DEFAULT_DUST_LIMIT_SATS: u64 = 546;
const DEFAULT_REQUIRED_CONFIRMATIONS: u32 = 1;
const DEFAULT_MAX_RETRIES: u8 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct InscriberConfig {
    /// Name of the used Bitcoin network
    pub network: String,
    /// Value of the inscription output, in satoshis
    pub postage_sats: Option<u64>,
    /// Outputs below this value are never created
    pub dust_limit_sats: Option<u64>,
    /// Confirmations before a broadcast transaction counts as confirmed
    pub required_confirmations: Option<u32>,
    /// Retries of the reveal and broadcast steps
    pub max_retries: Option<u8>,
    /// Base delay between retries, doubled on every attempt unless fixed
    pub retry_delay_ms: Option<u64>,
    /// Use the same delay for every retry
    pub fixed_retry_delay: Option<bool>,
    /// Fee rate used when the caller does not pass one, in sat/vB
    pub default_fee_rate: Option<f64>,
}

impl InscriberConfig {
    /// Returns the Bitcoin network
    pub fn network(&self) -> Network {
        Network::from_str(&self.network).unwrap_or(Network::Regtest)
    }

    /// Strict variant of [`Self::network`].
    pub fn try_network(&self) -> anyhow::Result<Network> {
        Network::from_str(&self.network)
            .map_err(|e| anyhow::anyhow!("Unknown network {}: {e}", self.network))
    }

    pub fn postage(&self) -> Amount {
        Amount::from_sat(self.postage_sats.unwrap_or(DEFAULT_POSTAGE_SATS))
    }

    pub fn dust_limit(&self) -> Amount {
        Amount::from_sat(self.dust_limit_sats.unwrap_or(DEFAULT_DUST_LIMIT_SATS))
    }

    pub fn required_confirmations(&self) -> u32 {
        self.required_confirmations
            .unwrap_or(DEFAULT_REQUIRED_CONFIRMATIONS)
    }

    pub fn max_retries(&self) -> u8 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS))
    }

    pub fn fixed_retry_delay(&self) -> bool {
        self.fixed_retry_delay.unwrap_or(false)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.try_network()?;
        if self.postage() < self.dust_limit() {
            anyhow::bail!(
                "Postage {} is below the dust limit {}",
                self.postage(),
                self.dust_limit()
            );
        }
        if let Some(fee_rate) = self.default_fee_rate {
            if !fee_rate.is_finite() || fee_rate <= 0.0 {
                anyhow::bail!("Default fee rate must be positive, got {fee_rate}");
            }
        }
        Ok(())
    }
}

impl InscriberConfig {
    // Creates a config object suitable for use in unit tests.
    pub fn for_tests() -> Self {
        Self {
            network: Network::Regtest.to_string(),
            postage_sats: None,
            dust_limit_sats: None,
            required_confirmations: Some(1),
            max_retries: Some(2),
            retry_delay_ms: Some(1),
            fixed_retry_delay: Some(true),
            default_fee_rate: Some(10.0),
        }
    }
}
