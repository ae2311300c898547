use std::fmt;

use bitcoin::{
    base58,
    key::UntweakedPublicKey,
    secp256k1::{All, Keypair, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey},
    Network, PrivateKey,
};
use lazy_static::lazy_static;
use tracing::{debug, instrument};
use zeroize::Zeroize;

use crate::types::{InscriberError, Result};

lazy_static! {
    pub(crate) static ref SECP: Secp256k1<All> = Secp256k1::new();
}

const WIF_MAINNET_PREFIX: u8 = 0x80;
const WIF_TESTNET_PREFIX: u8 = 0xef;
const WIF_COMPRESSED_FLAG: u8 = 0x01;

/// Taproot key pair. The private key is wiped from memory on drop.
#[derive(Clone)]
pub struct KeyPair {
    private_key: [u8; 32],
    public_key: XOnlyPublicKey,
}

impl KeyPair {
    fn from_secret_key(secret_key: &SecretKey) -> Self {
        let keypair = Keypair::from_secret_key(&*SECP, secret_key);
        let (public_key, _parity) = keypair.x_only_public_key();

        Self {
            private_key: secret_key.secret_bytes(),
            public_key,
        }
    }

    pub fn private_key(&self) -> &[u8; 32] {
        &self.private_key
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.private_key)
    }

    pub fn public_key(&self) -> UntweakedPublicKey {
        self.public_key
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    pub fn to_wif(&self, network: Network) -> Result<String> {
        Ok(PrivateKey::new(self.secret_key()?, network).to_wif())
    }

    pub(crate) fn secret_key(&self) -> Result<SecretKey> {
        SecretKey::from_slice(&self.private_key)
            .map_err(|e| InscriberError::SigningError(e.to_string()))
    }

    pub(crate) fn keypair(&self) -> Result<Keypair> {
        Ok(Keypair::from_secret_key(&*SECP, &self.secret_key()?))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// A public key without its private half.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKeyOnly {
    pub public_key: UntweakedPublicKey,
}

pub struct KeyManager;

impl KeyManager {
    #[instrument(target = "ord_inscriber::signer")]
    pub fn generate_key_pair() -> KeyPair {
        let secret_key = SecretKey::new(&mut rand::thread_rng());
        let key_pair = KeyPair::from_secret_key(&secret_key);
        debug!(public_key = %key_pair.public_key, "Generated ephemeral key pair");
        key_pair
    }

    pub fn from_private_key(private_key: &[u8]) -> Result<KeyPair> {
        if private_key.len() != 32 {
            return Err(InscriberError::InvalidKey(format!(
                "private key must be exactly 32 bytes, got {}",
                private_key.len()
            )));
        }

        let secret_key = SecretKey::from_slice(private_key)
            .map_err(|e| InscriberError::InvalidKey(e.to_string()))?;
        Ok(KeyPair::from_secret_key(&secret_key))
    }

    pub fn from_private_key_hex(private_key: &str) -> Result<KeyPair> {
        let mut bytes = hex::decode(private_key.trim())?;
        let key_pair = Self::from_private_key(&bytes);
        bytes.zeroize();
        key_pair
    }

    /// Accepts x-only (32 bytes) or compressed (33 bytes) keys.
    pub fn from_public_key(public_key: &[u8]) -> Result<PublicKeyOnly> {
        let public_key = match public_key.len() {
            32 => XOnlyPublicKey::from_slice(public_key)
                .map_err(|e| InscriberError::InvalidKey(e.to_string()))?,
            33 => {
                PublicKey::from_slice(public_key)
                    .map_err(|e| InscriberError::InvalidKey(e.to_string()))?
                    .x_only_public_key()
                    .0
            }
            len => {
                return Err(InscriberError::InvalidKey(format!(
                    "public key must be 32 or 33 bytes, got {len}"
                )))
            }
        };

        Ok(PublicKeyOnly { public_key })
    }

    pub fn from_public_key_hex(public_key: &str) -> Result<PublicKeyOnly> {
        Self::from_public_key(&hex::decode(public_key.trim())?)
    }

    /// Decodes a WIF private key, trying the mainnet prefix before the test network one.
    pub fn decode_wif(wif: &str) -> Result<[u8; 32]> {
        let mut data = base58::decode_check(wif.trim())
            .map_err(|e| InscriberError::InvalidKey(format!("invalid WIF encoding: {e}")))?;

        let decoded = [WIF_MAINNET_PREFIX, WIF_TESTNET_PREFIX]
            .into_iter()
            .find_map(|prefix| Self::strip_wif_prefix(&data, prefix));
        data.zeroize();

        decoded.ok_or_else(|| {
            InscriberError::InvalidKey(
                "WIF could not be decoded with either the mainnet or the test network prefix"
                    .to_string(),
            )
        })
    }

    fn strip_wif_prefix(data: &[u8], prefix: u8) -> Option<[u8; 32]> {
        let payload = match data {
            [first, payload @ ..] if *first == prefix => payload,
            _ => return None,
        };

        let key = match payload.len() {
            32 => payload,
            33 if payload[32] == WIF_COMPRESSED_FLAG => &payload[..32],
            _ => return None,
        };

        SecretKey::from_slice(key).ok()?;

        let mut out = [0u8; 32];
        out.copy_from_slice(key);
        Some(out)
    }
}
