use bitcoin::{
    key::UntweakedPublicKey,
    taproot::{LeafVersion, TaprootBuilder},
    Address, Network, ScriptBuf,
};
use tracing::{debug, instrument};

use crate::{
    inscriber::types::{LeafScriptInfo, P2TRDetails},
    signer::SECP,
    types::{InscriberError, Result},
};

/// Derives the taproot output committing to `leaf_script`.
///
/// The tree holds the leaf alone at depth 0, so its control block carries no
/// merkle path. Without a leaf the output is a plain key path output.
#[instrument(skip(internal_key, leaf_script), target = "ord_inscriber::taproot")]
pub fn derive_address(
    internal_key: UntweakedPublicKey,
    leaf_script: Option<&ScriptBuf>,
    network: Network,
) -> Result<P2TRDetails> {
    let Some(leaf_script) = leaf_script else {
        let address = Address::p2tr(&*SECP, internal_key, None, network);
        return Ok(P2TRDetails {
            script: address.script_pubkey(),
            address,
            internal_key,
            merkle_root: None,
            leaf: None,
        });
    };

    let spend_info = TaprootBuilder::new()
        .add_leaf(0, leaf_script.clone())
        .map_err(|e| InscriberError::InvalidInput(format!("failed to add tapscript leaf: {e}")))?
        .finalize(&*SECP, internal_key)
        .map_err(|_| InscriberError::InvalidInput("failed to finalize taproot tree".to_string()))?;

    let leaf_version = LeafVersion::TapScript;
    let control_block = spend_info
        .control_block(&(leaf_script.clone(), leaf_version))
        .ok_or_else(|| {
            InscriberError::InvalidInput("no control block for the envelope leaf".to_string())
        })?;

    let address = Address::p2tr_tweaked(spend_info.output_key(), network);
    debug!(%address, "Derived commit address");

    Ok(P2TRDetails {
        script: address.script_pubkey(),
        address,
        internal_key,
        merkle_root: spend_info.merkle_root(),
        leaf: Some(LeafScriptInfo {
            script: leaf_script.clone(),
            control_block,
            leaf_version,
        }),
    })
}
