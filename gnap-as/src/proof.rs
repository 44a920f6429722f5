//! Request proof verification.
//!
//! Binds an HTTP request to the client key it declares, using HTTP Message
//! Signatures (RFC 9421) restricted to `ecdsa-p256-sha256`. The signature
//! must cover `@method`, `@target-uri` and `content-digest`, plus
//! `authorization` whenever that header is present, and the content digest
//! must match the body.

use crate::error::{Error, Result};
use crate::gnap::{ClientKey, Jwk};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use http::{HeaderMap, Method};
use sha2::{Digest, Sha256};

/// Proof method tag for HTTP message signatures.
pub const PROOF_HTTPSIG: &str = "httpsig";

const SIGNATURE_ALG: &str = "ecdsa-p256-sha256";

/// The pieces of an inbound HTTP request that participate in proof
/// verification. Assembled by the HTTP adapter, or directly by tests.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub target_uri: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Verifies that a request is bound to a declared client key.
pub trait RequestVerifier: Send + Sync {
    /// Verify the request against `key`. `None` means the caller did not
    /// declare a key, which network verifiers reject.
    fn verify(&self, key: Option<&ClientKey>) -> Result<()>;
}

/// HTTP message signature verifier over one captured request.
pub struct HttpSigVerifier {
    ctx: RequestContext,
}

impl HttpSigVerifier {
    pub fn new(ctx: RequestContext) -> Self {
        Self { ctx }
    }

    fn verify_content_digest(&self) -> Result<()> {
        let header = self
            .ctx
            .headers
            .get("content-digest")
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::BodyDigestMismatch)?;

        let digest = Sha256::digest(&self.ctx.body);
        let expected = format!("sha-256=:{}:", STANDARD.encode(digest));

        if header.trim() != expected {
            return Err(Error::BodyDigestMismatch);
        }

        Ok(())
    }

    fn component_value(&self, name: &str) -> Result<String> {
        match name {
            "@method" => Ok(self.ctx.method.as_str().to_string()),
            "@target-uri" => Ok(self.ctx.target_uri.clone()),
            header => self
                .ctx
                .headers
                .get(header)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .ok_or_else(|| {
                    Error::BadSignature(format!("covered header not present: {}", header))
                }),
        }
    }

    fn signature_base(&self, input: &SignatureInput) -> Result<String> {
        let mut base = String::new();
        for component in &input.components {
            base.push_str(&format!(
                "\"{}\": {}\n",
                component,
                self.component_value(component)?
            ));
        }
        base.push_str(&format!("\"@signature-params\": {}", input.params));
        Ok(base)
    }
}

impl RequestVerifier for HttpSigVerifier {
    fn verify(&self, key: Option<&ClientKey>) -> Result<()> {
        let key = key.ok_or_else(|| Error::RequestDenied("request missing client key".into()))?;

        if key.proof != PROOF_HTTPSIG {
            return Err(Error::UnsupportedProof(key.proof.clone()));
        }

        let input = SignatureInput::from_headers(&self.ctx.headers)?;

        for required in ["@method", "@target-uri", "content-digest"] {
            if !input.covers(required) {
                return Err(Error::BadSignature(format!(
                    "signature must cover {}",
                    required
                )));
            }
        }

        if self.ctx.headers.contains_key(http::header::AUTHORIZATION)
            && !input.covers("authorization")
        {
            return Err(Error::BadSignature(
                "signature must cover authorization".to_string(),
            ));
        }

        if let Some(alg) = &input.alg {
            if alg != SIGNATURE_ALG {
                return Err(Error::BadSignature(format!(
                    "unsupported signature algorithm: {}",
                    alg
                )));
            }
        }

        if let Some(keyid) = &input.keyid {
            if *keyid != key.jwk.fingerprint()? {
                return Err(Error::KeyMismatch);
            }
        }

        self.verify_content_digest()?;

        let base = self.signature_base(&input)?;
        let verifying_key = verifying_key(&key.jwk)?;

        let signature_bytes: [u8; 64] = input
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| Error::BadSignature("invalid signature length".to_string()))?;
        let signature = p256::ecdsa::Signature::from_bytes(&signature_bytes.into())
            .map_err(|e| Error::BadSignature(format!("invalid signature encoding: {}", e)))?;

        use p256::ecdsa::signature::Verifier;
        verifying_key
            .verify(base.as_bytes(), &signature)
            .map_err(|_| Error::BadSignature("signature verification failed".to_string()))
    }
}

/// Verifier for server-internal introspection. Only constructible inside
/// the crate, so no network-facing path can reach it.
pub(crate) struct InternalVerifier;

impl RequestVerifier for InternalVerifier {
    fn verify(&self, _key: Option<&ClientKey>) -> Result<()> {
        Ok(())
    }
}

struct SignatureInput {
    /// Covered component names, unquoted, in order
    components: Vec<String>,
    /// The serialized inner value, reused verbatim as `@signature-params`
    params: String,
    keyid: Option<String>,
    alg: Option<String>,
    signature: Vec<u8>,
}

impl SignatureInput {
    fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let input_header = headers
            .get("signature-input")
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::MissingSignature)?;
        let signature_header = headers
            .get("signature")
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::MissingSignature)?;

        let (input_label, params) = input_header
            .trim()
            .split_once('=')
            .ok_or_else(|| Error::BadSignature("malformed signature-input".to_string()))?;

        let (sig_label, sig_value) = signature_header
            .trim()
            .split_once('=')
            .ok_or_else(|| Error::BadSignature("malformed signature".to_string()))?;

        if input_label != sig_label {
            return Err(Error::BadSignature(
                "signature label does not match signature-input".to_string(),
            ));
        }

        let inner = params
            .strip_prefix('(')
            .and_then(|rest| rest.split_once(')'))
            .ok_or_else(|| Error::BadSignature("malformed component list".to_string()))?;
        let (component_list, param_list) = inner;

        let components = component_list
            .split_whitespace()
            .map(|c| c.trim_matches('"').to_string())
            .collect();

        let signature = sig_value
            .trim()
            .strip_prefix(':')
            .and_then(|rest| rest.strip_suffix(':'))
            .ok_or_else(|| Error::BadSignature("malformed signature value".to_string()))?;
        let signature = STANDARD
            .decode(signature)
            .map_err(|e| Error::BadSignature(format!("invalid signature encoding: {}", e)))?;

        Ok(Self {
            components,
            params: params.to_string(),
            keyid: param_value(param_list, "keyid"),
            alg: param_value(param_list, "alg"),
            signature,
        })
    }

    fn covers(&self, component: &str) -> bool {
        self.components.iter().any(|c| c == component)
    }
}

fn param_value(params: &str, name: &str) -> Option<String> {
    params.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        (key == name).then(|| value.trim_matches('"').to_string())
    })
}

/// Convert an EC P-256 JWK into a verifying key.
pub fn verifying_key(jwk: &Jwk) -> Result<p256::ecdsa::VerifyingKey> {
    if jwk.kty != "EC" || jwk.crv.as_deref() != Some("P-256") {
        return Err(Error::UnsupportedProof(format!(
            "only EC P-256 keys are supported, got {} {}",
            jwk.kty,
            jwk.crv.as_deref().unwrap_or("")
        )));
    }

    let x = decode_coordinate(jwk, &jwk.x, "x")?;
    let y = decode_coordinate(jwk, &jwk.y, "y")?;

    let point = p256::EncodedPoint::from_affine_coordinates(
        p256::FieldBytes::from_slice(&x),
        p256::FieldBytes::from_slice(&y),
        false,
    );

    p256::ecdsa::VerifyingKey::from_encoded_point(&point)
        .map_err(|e| Error::BadSignature(format!("invalid public key: {}", e)))
}

fn decode_coordinate(jwk: &Jwk, field: &Option<String>, name: &str) -> Result<Vec<u8>> {
    let encoded = field
        .as_deref()
        .ok_or_else(|| Error::InvalidRequest(format!("{} JWK missing {}", jwk.kty, name)))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| Error::InvalidRequest(format!("invalid JWK coordinate {}: {}", name, e)))?;

    if bytes.len() != 32 {
        return Err(Error::InvalidRequest(format!(
            "JWK coordinate {} must be 32 bytes",
            name
        )));
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use http::HeaderValue;
    use p256::ecdsa::SigningKey;
    use p256::ecdsa::signature::Signer;
    use rand::rngs::OsRng;

    fn client_key(signing_key: &SigningKey) -> ClientKey {
        let point = signing_key.verifying_key().to_encoded_point(false);
        ClientKey {
            proof: PROOF_HTTPSIG.to_string(),
            jwk: Jwk {
                kty: "EC".to_string(),
                crv: Some("P-256".to_string()),
                x: Some(URL_SAFE_NO_PAD.encode(point.x().unwrap())),
                y: Some(URL_SAFE_NO_PAD.encode(point.y().unwrap())),
                n: None,
                e: None,
                alg: None,
                kid: None,
            },
        }
    }

    fn signed_context(
        signing_key: &SigningKey,
        key: &ClientKey,
        target_uri: &str,
        body: &[u8],
        authorization: Option<&str>,
    ) -> RequestContext {
        let mut headers = HeaderMap::new();

        let digest = format!("sha-256=:{}:", STANDARD.encode(Sha256::digest(body)));
        headers.insert("content-digest", HeaderValue::from_str(&digest).unwrap());

        let mut components = vec!["@method", "@target-uri", "content-digest"];
        if let Some(authz) = authorization {
            headers.insert(
                http::header::AUTHORIZATION,
                HeaderValue::from_str(authz).unwrap(),
            );
            components.push("authorization");
        }

        let quoted: Vec<String> = components.iter().map(|c| format!("\"{}\"", c)).collect();
        let params = format!(
            "({});created={};keyid=\"{}\";alg=\"{}\"",
            quoted.join(" "),
            Utc::now().timestamp(),
            key.jwk.fingerprint().unwrap(),
            SIGNATURE_ALG,
        );

        let mut base = String::new();
        for component in &components {
            let value = match *component {
                "@method" => "POST".to_string(),
                "@target-uri" => target_uri.to_string(),
                name => headers.get(name).unwrap().to_str().unwrap().to_string(),
            };
            base.push_str(&format!("\"{}\": {}\n", component, value));
        }
        base.push_str(&format!("\"@signature-params\": {}", params));

        let signature: p256::ecdsa::Signature = signing_key.sign(base.as_bytes());

        headers.insert(
            "signature-input",
            HeaderValue::from_str(&format!("sig1={}", params)).unwrap(),
        );
        headers.insert(
            "signature",
            HeaderValue::from_str(&format!("sig1=:{}:", STANDARD.encode(signature.to_bytes())))
                .unwrap(),
        );

        RequestContext {
            method: Method::POST,
            target_uri: target_uri.to_string(),
            headers,
            body: body.to_vec(),
        }
    }

    #[test]
    fn valid_signature_verifies() {
        let signing_key = SigningKey::random(&mut OsRng);
        let key = client_key(&signing_key);
        let ctx = signed_context(
            &signing_key,
            &key,
            "https://as.example.com/gnap/auth",
            br#"{"access_token":{"access":["a"]}}"#,
            None,
        );

        assert!(HttpSigVerifier::new(ctx).verify(Some(&key)).is_ok());
    }

    #[test]
    fn covered_authorization_header_verifies() {
        let signing_key = SigningKey::random(&mut OsRng);
        let key = client_key(&signing_key);
        let ctx = signed_context(
            &signing_key,
            &key,
            "https://as.example.com/gnap/continue",
            br#"{"interact_ref":"abc"}"#,
            Some("GNAP token-value"),
        );

        assert!(HttpSigVerifier::new(ctx).verify(Some(&key)).is_ok());
    }

    #[test]
    fn uncovered_authorization_header_is_rejected() {
        let signing_key = SigningKey::random(&mut OsRng);
        let key = client_key(&signing_key);
        let mut ctx = signed_context(
            &signing_key,
            &key,
            "https://as.example.com/gnap/continue",
            b"{}",
            None,
        );
        ctx.headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("GNAP sneaky"),
        );

        assert!(matches!(
            HttpSigVerifier::new(ctx).verify(Some(&key)),
            Err(Error::BadSignature(_))
        ));
    }

    #[test]
    fn tampered_body_fails_digest_check() {
        let signing_key = SigningKey::random(&mut OsRng);
        let key = client_key(&signing_key);
        let mut ctx = signed_context(
            &signing_key,
            &key,
            "https://as.example.com/gnap/auth",
            b"original",
            None,
        );
        ctx.body = b"tampered".to_vec();

        assert!(matches!(
            HttpSigVerifier::new(ctx).verify(Some(&key)),
            Err(Error::BodyDigestMismatch)
        ));
    }

    #[test]
    fn tampered_signature_fails() {
        let signing_key = SigningKey::random(&mut OsRng);
        let key = client_key(&signing_key);
        let mut ctx = signed_context(
            &signing_key,
            &key,
            "https://as.example.com/gnap/auth",
            b"body",
            None,
        );
        let forged = format!("sig1=:{}:", STANDARD.encode([7u8; 64]));
        ctx.headers
            .insert("signature", HeaderValue::from_str(&forged).unwrap());

        assert!(matches!(
            HttpSigVerifier::new(ctx).verify(Some(&key)),
            Err(Error::BadSignature(_))
        ));
    }

    #[test]
    fn missing_signature_headers_are_detected() {
        let ctx = RequestContext {
            method: Method::POST,
            target_uri: "https://as.example.com/gnap/auth".to_string(),
            headers: HeaderMap::new(),
            body: b"{}".to_vec(),
        };

        let signing_key = SigningKey::random(&mut OsRng);
        let key = client_key(&signing_key);

        assert!(matches!(
            HttpSigVerifier::new(ctx).verify(Some(&key)),
            Err(Error::MissingSignature)
        ));
    }

    #[test]
    fn wrong_key_is_a_mismatch() {
        let signing_key = SigningKey::random(&mut OsRng);
        let key = client_key(&signing_key);
        let ctx = signed_context(
            &signing_key,
            &key,
            "https://as.example.com/gnap/auth",
            b"body",
            None,
        );

        // Same signature, different declared key: keyid no longer matches.
        let other = client_key(&SigningKey::random(&mut OsRng));

        assert!(matches!(
            HttpSigVerifier::new(ctx).verify(Some(&other)),
            Err(Error::KeyMismatch)
        ));
    }

    #[test]
    fn unsupported_proof_method_is_rejected() {
        let signing_key = SigningKey::random(&mut OsRng);
        let mut key = client_key(&signing_key);
        let ctx = signed_context(
            &signing_key,
            &key,
            "https://as.example.com/gnap/auth",
            b"body",
            None,
        );
        key.proof = "mtls".to_string();

        assert!(matches!(
            HttpSigVerifier::new(ctx).verify(Some(&key)),
            Err(Error::UnsupportedProof(_))
        ));
    }
}
