//! Jupyter wire format
//!
//! A message on the wire is a list of frames:
//!
//! ```text
//! [identity...] <IDS|MSG> <signature> <header> <parent_header> <metadata> <content> [buffer...]
//! ```
//!
//! The signature is the lowercase hex HMAC-SHA256 of the four JSON segments
//! followed by every buffer. Identities and the delimiter are not signed.
//!
//! Segments are kept as the raw bytes they arrived as until someone decodes
//! them, so a relayed message is re-signed over exactly the bytes that are
//! forwarded.

use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::fmt;
use uuid::Uuid;

use crate::error::{ProxyError, Result};

/// Version of the Jupyter messaging protocol stamped on generated headers
pub const PROTOCOL_VERSION: &str = "5.0";

/// Delimiter in wire protocol messages
pub const MSG_DELIMITER: &[u8] = b"<IDS|MSG>";

/// Raw multipart frames as sent and received on a socket
pub type Frames = Vec<Bytes>;

type HmacSha256 = Hmac<Sha256>;

/// Shared secret used to sign messages on one side of the proxy.
///
/// An empty key disables signing, as in Jupyter.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self(key.as_ref().to_vec())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.0).map_err(|e| ProxyError::Hmac(e.to_string()))
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("SigningKey(<none>)")
        } else {
            f.write_str("SigningKey(<redacted>)")
        }
    }
}

/// Jupyter message header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub date: String,
    pub msg_type: String,
    #[serde(default)]
    pub version: String,
}

impl Header {
    pub fn new(msg_type: &str, session: &str) -> Self {
        Self::with_id(&Uuid::new_v4().to_string(), msg_type, session)
    }

    pub fn with_id(msg_id: &str, msg_type: &str, session: &str) -> Self {
        Self {
            msg_id: msg_id.to_string(),
            session: session.to_string(),
            username: "beaker".to_string(),
            date: Utc::now().to_rfc3339(),
            msg_type: msg_type.to_string(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// One of the four JSON segments, either as received or as a decoded value
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Raw(Bytes),
    Json(Value),
}

impl Segment {
    pub fn empty() -> Self {
        Segment::Json(Value::Object(Default::default()))
    }

    /// Serialized bytes; raw segments are returned untouched
    pub fn to_bytes(&self) -> Result<Bytes> {
        match self {
            Segment::Raw(bytes) => Ok(bytes.clone()),
            Segment::Json(value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        match self {
            Segment::Raw(bytes) if bytes.is_empty() => Ok(Value::Object(Default::default())),
            Segment::Raw(bytes) => Ok(serde_json::from_slice(bytes)?),
            Segment::Json(value) => Ok(value.clone()),
        }
    }

    fn into_raw(self) -> Result<Self> {
        Ok(Segment::Raw(self.to_bytes()?))
    }
}

impl From<Value> for Segment {
    fn from(value: Value) -> Self {
        Segment::Json(value)
    }
}

/// Complete Jupyter message
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub identities: Vec<Bytes>,
    pub signature: Bytes,
    pub header: Segment,
    pub parent_header: Segment,
    pub metadata: Segment,
    pub content: Segment,
    pub buffers: Vec<Bytes>,
}

impl WireMessage {
    /// Build a new, unsigned message
    pub fn new(header: Header, parent_header: Value, content: Value) -> Result<Self> {
        Ok(Self {
            identities: Vec::new(),
            signature: Bytes::new(),
            header: Segment::Json(serde_json::to_value(header)?),
            parent_header: Segment::Json(parent_header),
            metadata: Segment::empty(),
            content: Segment::Json(content),
            buffers: Vec::new(),
        })
    }

    /// Build a message answering `self`, routed back to the same identities
    pub fn reply(&self, msg_type: &str, content: Value) -> Result<Self> {
        let parent = self.header()?;
        let mut msg = Self::new(
            Header::new(msg_type, &parent.session),
            serde_json::to_value(&parent)?,
            content,
        )?;
        msg.identities = self.identities.clone();
        Ok(msg)
    }

    /// Parse message from received frames, verifying the signature when a key
    /// is given
    pub fn parse(frames: Frames, verify_key: Option<&SigningKey>) -> Result<Self> {
        let delim_pos = frames
            .iter()
            .position(|f| f.as_ref() == MSG_DELIMITER)
            .ok_or_else(|| ProxyError::Framing("missing <IDS|MSG> delimiter".to_string()))?;

        if frames.len() < delim_pos + 6 {
            return Err(ProxyError::Framing(format!(
                "expected signature and 4 segments after delimiter, got {} frames",
                frames.len() - delim_pos - 1
            )));
        }

        let mut frames = frames.into_iter();
        let identities: Vec<Bytes> = frames.by_ref().take(delim_pos).collect();
        let mut next = || frames.next().unwrap_or_default();
        let _delimiter = next();
        let signature = next();
        let header = Segment::Raw(next());
        let parent_header = Segment::Raw(next());
        let metadata = Segment::Raw(next());
        let content = Segment::Raw(next());
        let buffers: Vec<Bytes> = frames.collect();

        let msg = Self {
            identities,
            signature,
            header,
            parent_header,
            metadata,
            content,
            buffers,
        };

        if let Some(key) = verify_key {
            msg.verify(key)?;
        }

        Ok(msg)
    }

    /// Reassemble the frame list
    pub fn serialize(&self) -> Result<Frames> {
        let mut frames = Vec::with_capacity(self.identities.len() + 6 + self.buffers.len());
        frames.extend(self.identities.iter().cloned());
        frames.push(Bytes::from_static(MSG_DELIMITER));
        frames.push(self.signature.clone());
        frames.push(self.header.to_bytes()?);
        frames.push(self.parent_header.to_bytes()?);
        frames.push(self.metadata.to_bytes()?);
        frames.push(self.content.to_bytes()?);
        frames.extend(self.buffers.iter().cloned());
        Ok(frames)
    }

    /// Hex HMAC over the segments and buffers; empty when the key is empty
    pub fn compute_signature(&self, key: &SigningKey) -> Result<Bytes> {
        if key.is_empty() {
            return Ok(Bytes::new());
        }
        let mac = self.digest(key)?;
        Ok(Bytes::from(hex::encode(mac.finalize().into_bytes())))
    }

    /// Signed copy of this message
    pub fn sign(&self, key: &SigningKey) -> Result<Self> {
        let mut signed = Self {
            identities: self.identities.clone(),
            signature: Bytes::new(),
            header: self.header.clone().into_raw()?,
            parent_header: self.parent_header.clone().into_raw()?,
            metadata: self.metadata.clone().into_raw()?,
            content: self.content.clone().into_raw()?,
            buffers: self.buffers.clone(),
        };
        signed.signature = signed.compute_signature(key)?;
        Ok(signed)
    }

    /// Check the carried signature against `key`
    pub fn verify(&self, key: &SigningKey) -> Result<()> {
        if key.is_empty() {
            return Ok(());
        }
        let expected = hex::decode(&self.signature)
            .map_err(|_| ProxyError::Signature("signature is not hex".to_string()))?;
        self.digest(key)?
            .verify_slice(&expected)
            .map_err(|_| ProxyError::Signature("HMAC mismatch".to_string()))
    }

    fn digest(&self, key: &SigningKey) -> Result<HmacSha256> {
        let mut mac = key.mac()?;
        for segment in [&self.header, &self.parent_header, &self.metadata, &self.content] {
            mac.update(&segment.to_bytes()?);
        }
        for buffer in &self.buffers {
            mac.update(buffer);
        }
        Ok(mac)
    }

    pub fn header(&self) -> Result<Header> {
        match &self.header {
            Segment::Raw(bytes) => Ok(serde_json::from_slice(bytes)?),
            Segment::Json(value) => Ok(Header::deserialize(value)?),
        }
    }

    pub fn msg_type(&self) -> Result<String> {
        Ok(self.header()?.msg_type)
    }

    pub fn parent_header_value(&self) -> Result<Value> {
        self.parent_header.to_value()
    }

    /// `parent_header.msg_id`, if the parent header carries one
    pub fn parent_msg_id(&self) -> Result<Option<String>> {
        Ok(self
            .parent_header_value()?
            .get("msg_id")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    pub fn content_value(&self) -> Result<Value> {
        self.content.to_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frames(parts: &[&[u8]]) -> Frames {
        parts.iter().map(|p| Bytes::copy_from_slice(p)).collect()
    }

    fn sample() -> WireMessage {
        let mut msg = WireMessage::new(
            Header::new("execute_request", "session-1"),
            json!({}),
            json!({"code": "2+2", "silent": false}),
        )
        .unwrap();
        msg.identities = vec![Bytes::from_static(b"client-a")];
        msg.buffers = vec![Bytes::from_static(&[0, 1, 2, 255])];
        msg
    }

    #[test]
    fn test_sign_and_verify() {
        let key = SigningKey::new("secret");
        let signed = sample().sign(&key).unwrap();
        assert_eq!(signed.signature.len(), 64);
        assert!(signed
            .signature
            .iter()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b)));
        assert!(signed.verify(&key).is_ok());

        let other = SigningKey::new("secreT");
        assert!(matches!(
            signed.verify(&other),
            Err(ProxyError::Signature(_))
        ));
    }

    #[test]
    fn test_signature_excludes_identities() {
        let key = SigningKey::new("secret");
        let mut msg = sample().sign(&key).unwrap();
        msg.identities.push(Bytes::from_static(b"extra-route"));
        assert!(msg.verify(&key).is_ok());
    }

    #[test]
    fn test_signature_covers_buffers() {
        let key = SigningKey::new("secret");
        let mut msg = sample().sign(&key).unwrap();
        msg.buffers[0] = Bytes::from_static(b"tampered");
        assert!(msg.verify(&key).is_err());
    }

    #[test]
    fn test_known_digest() {
        // Signature computed over the exact segment bytes
        let key = SigningKey::new("key");
        let msg = WireMessage::parse(
            frames(&[b"<IDS|MSG>", b"", b"{}", b"{}", b"{}", b"{}"]),
            None,
        )
        .unwrap();
        let mut mac = HmacSha256::new_from_slice(b"key").unwrap();
        mac.update(b"{}{}{}{}");
        let expected = hex::encode(mac.finalize().into_bytes());
        assert_eq!(msg.compute_signature(&key).unwrap(), expected.as_bytes());
    }

    #[test]
    fn test_empty_key_is_unsigned() {
        let key = SigningKey::default();
        let signed = sample().sign(&key).unwrap();
        assert!(signed.signature.is_empty());
        assert!(signed.verify(&key).is_ok());
    }

    #[test]
    fn test_parse_serialize_roundtrip() {
        let raw = frames(&[
            b"id-1",
            b"id-2",
            b"<IDS|MSG>",
            b"abc",
            br#"{"msg_id":"m","msg_type":"status"}"#,
            b"{}",
            b"{}",
            br#"{"execution_state":"idle"}"#,
            b"buf",
        ]);
        let msg = WireMessage::parse(raw.clone(), None).unwrap();
        assert_eq!(msg.identities.len(), 2);
        assert_eq!(msg.buffers, vec![Bytes::from_static(b"buf")]);
        assert_eq!(msg.serialize().unwrap(), raw);
        assert_eq!(WireMessage::parse(msg.serialize().unwrap(), None).unwrap(), msg);
    }

    #[test]
    fn test_roundtrip_without_identities_or_buffers() {
        let msg = sample();
        let mut bare = msg.sign(&SigningKey::new("k")).unwrap();
        bare.identities.clear();
        bare.buffers.clear();
        let parsed = WireMessage::parse(bare.serialize().unwrap(), None).unwrap();
        assert_eq!(parsed, bare);
    }

    #[test]
    fn test_missing_delimiter() {
        let err = WireMessage::parse(frames(&[b"id", b"sig", b"{}", b"{}", b"{}", b"{}"]), None)
            .unwrap_err();
        assert!(matches!(err, ProxyError::Framing(_)));
    }

    #[test]
    fn test_too_few_segments() {
        let err = WireMessage::parse(frames(&[b"<IDS|MSG>", b"sig", b"{}", b"{}"]), None)
            .unwrap_err();
        assert!(matches!(err, ProxyError::Framing(_)));
    }

    #[test]
    fn test_tampered_content_rejected() {
        let key = SigningKey::new("secret");
        let mut wire = sample().sign(&key).unwrap().serialize().unwrap();
        let content_idx = wire.len() - 2;
        wire[content_idx] = Bytes::from_static(br#"{"code":"rm -rf /"}"#);
        assert!(matches!(
            WireMessage::parse(wire, Some(&key)),
            Err(ProxyError::Signature(_))
        ));
    }

    #[test]
    fn test_reply_links_parent() {
        let request = sample();
        let reply = request
            .reply("execute_reply", json!({"status": "ok"}))
            .unwrap();
        let parent = request.header().unwrap();
        assert_eq!(reply.identities, request.identities);
        assert_eq!(reply.parent_msg_id().unwrap(), Some(parent.msg_id));
        assert_eq!(reply.header().unwrap().session, "session-1");
        assert_eq!(reply.msg_type().unwrap(), "execute_reply");
    }
}
