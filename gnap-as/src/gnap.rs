//! GNAP wire model, per draft-ietf-gnap-core-protocol-09.
//!
//! The polymorphic spots of the protocol (access descriptors that are either
//! a string reference or a typed object, clients that are either a reference
//! or a key, `access_token` that is a single request or a list) get
//! hand-written serde impls; everything else derives.

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// GNAP authorization request (section 2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthRequest {
    /// A single token request is treated as a list of one element.
    #[serde(
        default,
        deserialize_with = "de_one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub access_token: Vec<TokenRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<RequestClient>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interact: Option<RequestInteract>,
}

/// Requesting client: an instance reference, or an object carrying its key
/// (section 2.3).
#[derive(Debug, Clone, PartialEq)]
pub enum RequestClient {
    Reference(String),
    Key(ClientKey),
}

impl RequestClient {
    pub fn key(&self) -> Option<&ClientKey> {
        match self {
            RequestClient::Reference(_) => None,
            RequestClient::Key(key) => Some(key),
        }
    }
}

impl Serialize for RequestClient {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            RequestClient::Reference(r) => serializer.serialize_str(r),
            RequestClient::Key(key) => {
                let mut obj = serde_json::Map::new();
                obj.insert(
                    "key".to_string(),
                    serde_json::to_value(key).map_err(serde::ser::Error::custom)?,
                );
                obj.serialize(serializer)
            }
        }
    }
}

impl<'de> Deserialize<'de> for RequestClient {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(r) => Ok(RequestClient::Reference(r)),
            Value::Object(mut obj) => {
                let key = obj
                    .remove("key")
                    .ok_or_else(|| D::Error::custom("client object missing key"))?;
                Ok(RequestClient::Key(
                    serde_json::from_value(key).map_err(D::Error::custom)?,
                ))
            }
            _ => Err(D::Error::custom("client must be a string or an object")),
        }
    }
}

/// Client key: a proof method tag plus the public key as a JWK
/// (section 7.1.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientKey {
    pub proof: String,
    pub jwk: Jwk,
}

/// The subset of JWK fields the server binds against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

impl Jwk {
    /// RFC 7638 thumbprint: SHA-256 over the canonical JSON of the required
    /// members, base64url without padding. Key identity everywhere in this
    /// crate is this fingerprint.
    pub fn fingerprint(&self) -> Result<String> {
        let canonical = match self.kty.as_str() {
            "EC" => {
                // EC key: crv, kty, x, y in lexicographic order
                let crv = self.require("crv", &self.crv)?;
                let x = self.require("x", &self.x)?;
                let y = self.require("y", &self.y)?;

                serde_json::json!({
                    "crv": crv,
                    "kty": self.kty,
                    "x": x,
                    "y": y,
                })
            }
            "RSA" => {
                // RSA key: e, kty, n in lexicographic order
                let e = self.require("e", &self.e)?;
                let n = self.require("n", &self.n)?;

                serde_json::json!({
                    "e": e,
                    "kty": self.kty,
                    "n": n,
                })
            }
            "OKP" => {
                // OKP key: crv, kty, x in lexicographic order
                let crv = self.require("crv", &self.crv)?;
                let x = self.require("x", &self.x)?;

                serde_json::json!({
                    "crv": crv,
                    "kty": self.kty,
                    "x": x,
                })
            }
            other => {
                return Err(Error::InvalidRequest(format!(
                    "unsupported JWK key type: {}",
                    other
                )));
            }
        };

        let canonical_json = serde_json::to_string(&canonical)
            .map_err(|e| Error::Internal(format!("failed to serialize JWK: {}", e)))?;

        let mut hasher = Sha256::new();
        hasher.update(canonical_json.as_bytes());

        Ok(URL_SAFE_NO_PAD.encode(hasher.finalize()))
    }

    fn require<'a>(&self, name: &str, field: &'a Option<String>) -> Result<&'a str> {
        field
            .as_deref()
            .ok_or_else(|| Error::InvalidRequest(format!("{} JWK missing {}", self.kty, name)))
    }
}

/// One requested token (section 2.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub access: Vec<TokenAccess>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<AccessFlag>,
}

/// GNAP access descriptor, either a string reference to a pre-registered
/// right or an object with a `type` tag and opaque type-specific fields,
/// preserved verbatim (section 8).
#[derive(Debug, Clone, PartialEq)]
pub enum TokenAccess {
    Reference(String),
    Object {
        descriptor_type: String,
        fields: serde_json::Map<String, Value>,
    },
}

impl TokenAccess {
    pub fn reference(r: impl Into<String>) -> Self {
        TokenAccess::Reference(r.into())
    }

    /// The rule key this descriptor is matched under: the reference string
    /// itself, or the object's `type` tag.
    pub fn rule_key(&self) -> &str {
        match self {
            TokenAccess::Reference(r) => r,
            TokenAccess::Object {
                descriptor_type, ..
            } => descriptor_type,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, TokenAccess::Reference(_))
    }
}

impl Serialize for TokenAccess {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            TokenAccess::Reference(r) => serializer.serialize_str(r),
            TokenAccess::Object { fields, .. } => fields.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for TokenAccess {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(r) => Ok(TokenAccess::Reference(r)),
            Value::Object(fields) => {
                let descriptor_type = fields
                    .get("type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| D::Error::custom("access descriptor object missing type"))?
                    .to_string();

                Ok(TokenAccess::Object {
                    descriptor_type,
                    fields,
                })
            }
            _ => Err(D::Error::custom(
                "access descriptor must be a string or an object",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessFlag {
    Bearer,
    Durable,
    Split,
}

/// Requested interaction capabilities (section 2.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestInteract {
    #[serde(default)]
    pub start: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish: Option<RequestFinish>,
}

/// How the client wants to learn that interaction finished (section 2.5.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFinish {
    pub method: String,
    pub uri: String,
    pub nonce: String,
}

/// GNAP authorization response (section 3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(rename = "continue", skip_serializing_if = "Option::is_none")]
    pub continue_: Option<ResponseContinue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_token: Vec<AccessToken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interact: Option<ResponseInteract>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
}

/// Continuation block of a response (section 3.1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseContinue {
    pub uri: String,
    pub access_token: AccessToken,
    pub wait: u32,
}

/// Interaction block of a response (section 3.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseInteract {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub redirect: String,
    /// The AS finish nonce the client folds into the response hash.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub finish: String,
}

/// Subject information disclosed to the client (section 3.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subject {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_ids: Vec<SubjectId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<SubjectAssertion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectId {
    pub id: String,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectAssertion {
    pub value: String,
    pub format: String,
}

/// Issued access token (section 3.2.1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessToken {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manage: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access: Vec<TokenAccess>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<AccessFlag>,
}

/// Continuation request body (section 5.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinueRequest {
    pub interact_ref: String,
}

/// GNAP error response (section 3.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

/// Token introspection request (gnap-resource-servers section 3.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntrospectRequest {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access: Vec<TokenAccess>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_server: Option<RequestClient>,
}

/// Token introspection response (gnap-resource-servers section 3.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntrospectResponse {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access: Vec<TokenAccess>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<ClientKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<AccessFlag>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub subject_data: HashMap<String, String>,
}

impl IntrospectResponse {
    pub fn inactive() -> Self {
        IntrospectResponse::default()
    }
}

fn de_one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<TokenRequest>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(vec![]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(D::Error::custom))
            .collect(),
        single => Ok(vec![
            serde_json::from_value(single).map_err(D::Error::custom)?,
        ]),
    }
}
