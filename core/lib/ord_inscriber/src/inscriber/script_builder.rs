use bitcoin::{
    constants::MAX_SCRIPT_ELEMENT_SIZE,
    key::UntweakedPublicKey,
    opcodes::{all, OP_0, OP_FALSE},
    script::{Builder as ScriptBuilder, Instruction, PushBytesBuf},
    Script, ScriptBuf, Witness,
};
use tracing::{debug, instrument, warn};

use crate::types::{InscriberError, InscriptionId, Result};

pub(crate) const ORD_PROTOCOL_ID: &[u8; 3] = b"ord";
pub(crate) const CONTENT_TYPE_TAG: &[u8; 1] = &[1];
pub(crate) const PARENT_TAG: &[u8; 1] = &[3];

const PUBKEY_SIZE: usize = 32;
const MIN_REVEAL_WITNESS_LENGTH: usize = 3;

/// Inscription content before it is turned into a script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InscriptionContent {
    Text(String),
    Bytes(Vec<u8>),
}

impl From<&str> for InscriptionContent {
    fn from(text: &str) -> Self {
        InscriptionContent::Text(text.to_string())
    }
}

impl From<String> for InscriptionContent {
    fn from(text: String) -> Self {
        InscriptionContent::Text(text)
    }
}

impl From<Vec<u8>> for InscriptionContent {
    fn from(bytes: Vec<u8>) -> Self {
        InscriptionContent::Bytes(bytes)
    }
}

impl InscriptionContent {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            InscriptionContent::Text(text) => text.into_bytes(),
            InscriptionContent::Bytes(bytes) => bytes,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InscriptionEnvelope {
    pub content_type: String,
    pub body: Vec<u8>,
    /// Additional tags in push order.
    pub metadata_tags: Vec<(Vec<u8>, Vec<u8>)>,
    pub parent_inscription_id: Option<InscriptionId>,
}

impl InscriptionEnvelope {
    pub fn with_parent(mut self, parent: InscriptionId) -> Self {
        self.parent_inscription_id = Some(parent);
        self
    }
}

#[instrument(skip(content, metadata), target = "ord_inscriber::script_builder")]
pub fn build_envelope<K, V>(
    content: impl Into<InscriptionContent>,
    content_type: &str,
    metadata: impl IntoIterator<Item = (K, V)>,
) -> Result<InscriptionEnvelope>
where
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    if content_type.is_empty() {
        warn!("Building an envelope with an empty content type");
    }
    if content_type.len() > MAX_SCRIPT_ELEMENT_SIZE {
        return Err(InscriberError::InvalidInput(format!(
            "content type is {} bytes, the limit is {MAX_SCRIPT_ELEMENT_SIZE}",
            content_type.len()
        )));
    }

    let mut metadata_tags = Vec::new();
    for (key, value) in metadata {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(InscriberError::InvalidInput(
                "metadata tag keys must not be empty".to_string(),
            ));
        }
        if key.len() > MAX_SCRIPT_ELEMENT_SIZE {
            return Err(InscriberError::InvalidInput(format!(
                "metadata tag key is {} bytes, the limit is {MAX_SCRIPT_ELEMENT_SIZE}",
                key.len()
            )));
        }
        if key == CONTENT_TYPE_TAG || key == PARENT_TAG {
            return Err(InscriberError::InvalidInput(format!(
                "metadata tag key {} is reserved",
                hex::encode(key)
            )));
        }
        metadata_tags.push((key.to_vec(), value.as_ref().to_vec()));
    }

    let envelope = InscriptionEnvelope {
        content_type: content_type.to_string(),
        body: content.into().into_bytes(),
        metadata_tags,
        parent_inscription_id: None,
    };

    debug!(
        body_len = envelope.body.len(),
        tags = envelope.metadata_tags.len(),
        "Envelope built"
    );
    Ok(envelope)
}

/// `<pubkey> OP_CHECKSIG OP_FALSE OP_IF "ord" <fields> OP_0 <body> OP_ENDIF`
#[instrument(skip(envelope, reveal_public_key), target = "ord_inscriber::script_builder")]
pub fn build_leaf_script(
    envelope: &InscriptionEnvelope,
    reveal_public_key: &UntweakedPublicKey,
) -> Result<ScriptBuf> {
    debug!("Building envelope leaf script");
    let mut script = ScriptBuilder::new()
        .push_slice(encode_push_bytes(&reveal_public_key.serialize())?)
        .push_opcode(all::OP_CHECKSIG)
        .push_opcode(OP_FALSE)
        .push_opcode(all::OP_IF)
        .push_slice(encode_push_bytes(ORD_PROTOCOL_ID)?)
        .push_slice(encode_push_bytes(CONTENT_TYPE_TAG)?)
        .push_slice(encode_push_bytes(envelope.content_type.as_bytes())?);

    for (key, value) in &envelope.metadata_tags {
        script = push_tag(script, key, value)?;
    }

    if let Some(parent) = &envelope.parent_inscription_id {
        script = push_tag(script, PARENT_TAG, &parent.to_tag_value())?;
    }

    script = script.push_opcode(OP_0);

    if envelope.body.is_empty() {
        script = script.push_slice(PushBytesBuf::new());
    }
    for chunk in envelope.body.chunks(MAX_SCRIPT_ELEMENT_SIZE) {
        script = script.push_slice(encode_push_bytes(chunk)?);
    }

    let script = script.push_opcode(all::OP_ENDIF).into_script();
    debug!("Leaf script built, script size: {}", script.len());
    Ok(script)
}

/// Reads an envelope back from a leaf script produced by [`build_leaf_script`].
#[instrument(skip(script), target = "ord_inscriber::script_builder")]
pub fn parse_leaf_script(script: &Script) -> Result<(UntweakedPublicKey, InscriptionEnvelope)> {
    let instructions = script
        .instructions()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| invalid_script(&e.to_string()))?;
    let mut instructions = instructions.into_iter();

    let public_key = match instructions.next() {
        Some(Instruction::PushBytes(bytes)) if bytes.len() == PUBKEY_SIZE => {
            UntweakedPublicKey::from_slice(bytes.as_bytes())
                .map_err(|e| invalid_script(&e.to_string()))?
        }
        _ => return Err(invalid_script("missing reveal public key")),
    };
    expect_op(instructions.next(), all::OP_CHECKSIG)?;
    match instructions.next() {
        Some(Instruction::PushBytes(bytes)) if bytes.is_empty() => {}
        _ => return Err(invalid_script("missing OP_FALSE")),
    }
    expect_op(instructions.next(), all::OP_IF)?;
    match instructions.next() {
        Some(Instruction::PushBytes(bytes)) if bytes.as_bytes() == ORD_PROTOCOL_ID => {}
        _ => return Err(invalid_script("missing protocol id")),
    }

    let mut envelope = InscriptionEnvelope::default();
    let mut content_type = None;

    loop {
        let tag = match instructions.next() {
            Some(Instruction::PushBytes(tag)) => tag.as_bytes().to_vec(),
            Some(Instruction::Op(op)) if op == all::OP_ENDIF => {
                return Err(invalid_script("envelope has no body separator"))
            }
            _ => return Err(invalid_script("unexpected opcode in envelope fields")),
        };

        if tag.is_empty() {
            break;
        }

        let value = match instructions.next() {
            Some(Instruction::PushBytes(value)) => value.as_bytes().to_vec(),
            _ => return Err(invalid_script("tag without value")),
        };

        if tag.as_slice() == CONTENT_TYPE_TAG {
            let value = String::from_utf8(value).map_err(|e| invalid_script(&e.to_string()))?;
            content_type = Some(value);
        } else if tag.as_slice() == PARENT_TAG {
            envelope.parent_inscription_id = Some(InscriptionId::from_tag_value(&value)?);
        } else {
            match envelope.metadata_tags.last_mut() {
                // values longer than one push are split over consecutive pushes under the same key
                Some((last_key, last_value))
                    if *last_key == tag
                        && !last_value.is_empty()
                        && last_value.len() % MAX_SCRIPT_ELEMENT_SIZE == 0 =>
                {
                    last_value.extend_from_slice(&value);
                }
                _ => envelope.metadata_tags.push((tag, value)),
            }
        }
    }

    loop {
        match instructions.next() {
            Some(Instruction::PushBytes(chunk)) => envelope.body.extend_from_slice(chunk.as_bytes()),
            Some(Instruction::Op(op)) if op == all::OP_ENDIF => break,
            _ => return Err(invalid_script("unterminated envelope body")),
        }
    }

    if instructions.next().is_some() {
        return Err(invalid_script("trailing data after OP_ENDIF"));
    }

    envelope.content_type =
        content_type.ok_or_else(|| invalid_script("envelope has no content type"))?;
    Ok((public_key, envelope))
}

/// Reads the envelope out of a finalized reveal input witness
/// (`[signature, leaf script, control block]`).
pub fn parse_reveal_witness(witness: &Witness) -> Result<InscriptionEnvelope> {
    if witness.len() < MIN_REVEAL_WITNESS_LENGTH {
        return Err(InscriberError::InvalidInput(format!(
            "reveal witness has {} items, expected {MIN_REVEAL_WITNESS_LENGTH}",
            witness.len()
        )));
    }

    let script = ScriptBuf::from_bytes(witness[1].to_vec());
    let (_, envelope) = parse_leaf_script(&script)?;
    Ok(envelope)
}

fn push_tag(mut script: ScriptBuilder, key: &[u8], value: &[u8]) -> Result<ScriptBuilder> {
    if value.is_empty() {
        return Ok(script
            .push_slice(encode_push_bytes(key)?)
            .push_slice(PushBytesBuf::new()));
    }

    for chunk in value.chunks(MAX_SCRIPT_ELEMENT_SIZE) {
        script = script
            .push_slice(encode_push_bytes(key)?)
            .push_slice(encode_push_bytes(chunk)?);
    }
    Ok(script)
}

fn encode_push_bytes(data: &[u8]) -> Result<PushBytesBuf> {
    PushBytesBuf::try_from(data.to_vec()).map_err(|_| {
        InscriberError::InvalidInput(format!("{} bytes do not fit in a script push", data.len()))
    })
}

fn expect_op(instruction: Option<Instruction<'_>>, expected: bitcoin::opcodes::Opcode) -> Result<()> {
    match instruction {
        Some(Instruction::Op(op)) if op == expected => Ok(()),
        _ => Err(invalid_script(&format!("expected {expected}"))),
    }
}

fn invalid_script(reason: &str) -> InscriberError {
    InscriberError::InvalidInput(format!("malformed envelope script: {reason}"))
}
