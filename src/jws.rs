//! ACME 請求所需的 JWS（RFC 7515）組裝：nonce 取得、保護標頭、JWK 與簽章。

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use openssl::{ecdsa::EcdsaSig, error::ErrorStack, hash::MessageDigest, sign::Signer};
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::key_pair::{KeyAlgorithm, KeyError, KeyPair};

/// JWS 組裝過程中可能發生的錯誤。
#[derive(Debug, Error)]
pub enum JwsError {
    #[error("Failed to request nonce: {0}")]
    NonceRequest(#[from] reqwest::Error),
    #[error("No Replay-Nonce header found in response")]
    NoNonceHeader,
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::ToStrError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Signing error: {0}")]
    Signing(#[from] ErrorStack),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

type Result<T> = std::result::Result<T, JwsError>;

/// 定義取得 nonce 的行為。
pub trait NonceT {
    /// 取得一個尚未使用過的 nonce。
    fn get(&self) -> Result<String>;
}

/// 透過 HTTP HEAD 請求 `newNonce` 端點取得 `Replay-Nonce`。
#[derive(Debug, Clone)]
pub struct Nonce {
    client: Client,
    url: String,
}

impl Nonce {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Nonce {
            client,
            url: url.into(),
        }
    }
}

impl NonceT for Nonce {
    fn get(&self) -> Result<String> {
        let response = self.client.head(&self.url).send()?;
        match response.headers().get("Replay-Nonce") {
            Some(nonce) => Ok(nonce.to_str()?.to_string()),
            None => Err(JwsError::NoNonceHeader),
        }
    }
}

/// 回傳固定值的 nonce。
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct MockNonce {
    value: String,
}

#[cfg(test)]
impl MockNonce {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

#[cfg(test)]
impl NonceT for MockNonce {
    fn get(&self) -> Result<String> {
        Ok(self.value.clone())
    }
}

/// JSON Web Key 的公開部分。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    #[serde(rename = "RSA")]
    Rsa { e: String, n: String },
    #[serde(rename = "EC")]
    Ec { crv: String, x: String, y: String },
}

impl Jwk {
    /// RFC 7638 規定的縮影輸入：只含必要欄位，依字典序排列且無空白。
    pub fn thumbprint_input(&self) -> String {
        match self {
            Jwk::Rsa { e, n } => format!(r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#, e, n),
            Jwk::Ec { crv, x, y } => format!(
                r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
                crv, x, y
            ),
        }
    }
}

/// 簽署者的身分表示方式：新帳戶請求使用 JWK，其餘使用帳戶 URL（kid）。
#[derive(Debug, Clone, Copy)]
pub enum KeyId<'a> {
    Jwk,
    Kid(&'a str),
}

/// JWS 保護標頭。
#[derive(Debug, Serialize)]
pub struct ProtectedHeader {
    alg: &'static str,
    nonce: String,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl ProtectedHeader {
    pub fn new(key_pair: &KeyPair, key_id: KeyId<'_>, nonce: String, url: &str) -> Result<Self> {
        let (jwk, kid) = match key_id {
            KeyId::Jwk => (Some(key_pair.jwk()?), None),
            KeyId::Kid(kid) => (None, Some(kid.to_string())),
        };
        Ok(Self {
            alg: key_pair.alg.jws_alg(),
            nonce,
            url: url.to_string(),
            jwk,
            kid,
        })
    }
}

/// 以 flattened JSON 序列化的 JWS。
#[derive(Debug, Serialize)]
pub struct Jws {
    protected: String,
    payload: String,
    signature: String,
}

impl Jws {
    /// 簽署一個 ACME 請求。
    ///
    /// `payload` 為 `None` 時產生 POST-as-GET 請求（空字串 payload）。
    pub fn sign(
        key_pair: &KeyPair,
        key_id: KeyId<'_>,
        nonce: &dyn NonceT,
        url: &str,
        payload: Option<&Value>,
    ) -> Result<Self> {
        let header = ProtectedHeader::new(key_pair, key_id, nonce.get()?, url)?;
        let protected = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let payload = match payload {
            Some(value) => URL_SAFE_NO_PAD.encode(serde_json::to_vec(value)?),
            None => String::new(),
        };
        let signing_input = format!("{}.{}", protected, payload);
        let signature = URL_SAFE_NO_PAD.encode(sign_bytes(key_pair, signing_input.as_bytes())?);

        Ok(Jws {
            protected,
            payload,
            signature,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// 依金鑰演算法簽署資料；ES256 需將 DER 簽章轉為固定長度的 `r || s`。
fn sign_bytes(key_pair: &KeyPair, data: &[u8]) -> Result<Vec<u8>> {
    let mut signer = Signer::new(MessageDigest::sha256(), &key_pair.pri_key)?;
    signer.update(data)?;
    let signature = signer.sign_to_vec()?;
    match key_pair.alg {
        KeyAlgorithm::Rsa(_) => Ok(signature),
        KeyAlgorithm::EcP256 => {
            let sig = EcdsaSig::from_der(&signature)?;
            let mut raw = sig.r().to_vec_padded(32)?;
            raw.extend(sig.s().to_vec_padded(32)?);
            Ok(raw)
        }
    }
}
