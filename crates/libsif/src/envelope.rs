//! DSSE envelopes carrying a digest manifest signed with a raw Ed25519 key.
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::SifError;

pub const DSSE_PAYLOAD_TYPE: &str = "application/vnd.sifbox.digest-manifest+json";

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    /// The digest manifest as it was signed.
    pub message: Vec<u8>,
    /// The exact bytes the signature was computed over.
    pub signed_bytes: Vec<u8>,
    pub signature: Vec<u8>,
    pub fingerprint: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    payload_type: String,
    payload: String,
    signatures: Vec<EnvelopeSignature>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EnvelopeSignature {
    keyid: String,
    sig: String,
}

/// DSSE pre-authentication encoding.
pub fn pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "DSSEv1 {} {} {} ",
        payload_type.len(),
        payload_type,
        payload.len()
    )
    .into_bytes();
    out.extend_from_slice(payload);
    out
}

pub fn dsse_envelope(message: &[u8], signature: &[u8], fingerprint: &str) -> Result<Vec<u8>, SifError> {
    let envelope = Envelope {
        payload_type: DSSE_PAYLOAD_TYPE.to_owned(),
        payload: STANDARD.encode(message),
        signatures: vec![EnvelopeSignature {
            keyid: fingerprint.to_owned(),
            sig: STANDARD.encode(signature),
        }],
    };
    Ok(serde_json::to_vec(&envelope)?)
}

pub fn open_dsse(data: &[u8]) -> Result<SignedMessage, SifError> {
    let envelope: Envelope = serde_json::from_slice(data)?;
    if envelope.payload_type != DSSE_PAYLOAD_TYPE {
        return Err(SifError::MalformedSignature(format!(
            "unexpected payload type {}",
            envelope.payload_type
        )));
    }
    let signature = envelope
        .signatures
        .first()
        .ok_or_else(|| SifError::MalformedSignature("envelope carries no signature".into()))?;
    let message = STANDARD.decode(&envelope.payload)?;

    Ok(SignedMessage {
        signed_bytes: pae(&envelope.payload_type, &message),
        signature: STANDARD.decode(&signature.sig)?,
        fingerprint: signature.keyid.clone(),
        message,
    })
}
