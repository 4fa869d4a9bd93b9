use std::{fmt, str::FromStr};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use openssl::{
    bn::{BigNum, BigNumContext},
    ec::{EcGroup, EcKey},
    error::ErrorStack,
    nid::Nid,
    pkey::{Id, PKey, Private},
    rsa::Rsa,
    sha::sha256,
};
use thiserror::Error;

use crate::{
    jws::Jwk,
    storage::{Storage, StorageError},
};

/// 鍵相關操作的錯誤列舉。
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] ErrorStack),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Unsupported RSA key size: {0}")]
    UnsupportedKeySize(u32),
}

type Result<T> = std::result::Result<T, KeyError>;

/// 帳戶金鑰與憑證金鑰所使用的演算法。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// RSA，附帶位元長度。
    Rsa(u32),
    /// NIST P-256 橢圓曲線。
    EcP256,
}

impl KeyAlgorithm {
    /// 預設的 RSA 位元長度。
    pub const DEFAULT_RSA_BITS: u32 = 2048;

    /// 以指定的 RSA 位元長度取代預設值；對 EC 演算法無影響。
    pub fn with_bits(self, bits: u32) -> Result<Self> {
        match self {
            Self::Rsa(_) if !(2048..=8192).contains(&bits) || bits % 1024 != 0 => {
                Err(KeyError::UnsupportedKeySize(bits))
            }
            Self::Rsa(_) => Ok(Self::Rsa(bits)),
            Self::EcP256 => Ok(self),
        }
    }

    /// JWS 標頭所使用的 `alg` 名稱。
    pub fn jws_alg(&self) -> &'static str {
        match self {
            Self::Rsa(_) => "RS256",
            Self::EcP256 => "ES256",
        }
    }
}

impl Default for KeyAlgorithm {
    fn default() -> Self {
        Self::Rsa(Self::DEFAULT_RSA_BITS)
    }
}

impl FromStr for KeyAlgorithm {
    type Err = KeyError;

    /// 解析演算法名稱，大小寫不敏感。
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "rsa" | "rs256" => Ok(Self::default()),
            "ec" | "ecdsa" | "es256" | "p256" | "p-256" => Ok(Self::EcP256),
            other => Err(KeyError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rsa(bits) => write!(f, "rsa-{}", bits),
            Self::EcP256 => write!(f, "ec-p256"),
        }
    }
}

/// 表示一組非對稱金鑰對。
///
/// 公鑰可隨時從私鑰推得，因此只保存私鑰。
pub struct KeyPair {
    /// 金鑰演算法。
    pub alg: KeyAlgorithm,
    /// 私鑰，使用 OpenSSL 的 `PKey` 封裝。
    pub pri_key: PKey<Private>,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("alg", &self.alg).finish_non_exhaustive()
    }
}

impl KeyPair {
    /// 依指定演算法產生新的私鑰。
    pub fn generate(alg: KeyAlgorithm) -> Result<Self> {
        let pri_key = match alg {
            KeyAlgorithm::Rsa(bits) => PKey::from_rsa(Rsa::generate(bits)?)?,
            KeyAlgorithm::EcP256 => {
                let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
                PKey::from_ec_key(EcKey::generate(&group)?)?
            }
        };
        Ok(Self { alg, pri_key })
    }

    /// 從存儲讀取私鑰；若不存在則產生新金鑰並寫回存儲。
    ///
    /// # 參數
    ///
    /// - `storage`: 金鑰所在的存儲。
    /// - `key`: 私鑰 PEM 的存儲路徑。
    /// - `alg`: 需要產生新金鑰時使用的演算法。
    pub fn load_or_generate(storage: &dyn Storage, key: &str, alg: KeyAlgorithm) -> Result<Self> {
        match storage.read_file(key) {
            Ok(pem) => return Self::from_pem(&pem),
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(KeyError::Storage(e)),
        }

        let key_pair = Self::generate(alg)?;
        storage.write_file(key, &key_pair.to_pem()?)?;
        Ok(key_pair)
    }

    /// 根據 PEM 格式的私鑰資料建立金鑰對，演算法由金鑰本身判斷。
    pub fn from_pem(pri_key_pem: &[u8]) -> Result<Self> {
        let pri_key = PKey::private_key_from_pem(pri_key_pem)?;
        let alg = match pri_key.id() {
            Id::RSA => KeyAlgorithm::Rsa(pri_key.bits()),
            Id::EC => {
                let curve = pri_key.ec_key()?.group().curve_name();
                if curve != Some(Nid::X9_62_PRIME256V1) {
                    return Err(KeyError::UnsupportedAlgorithm(format!("{:?}", curve)));
                }
                KeyAlgorithm::EcP256
            }
            other => return Err(KeyError::UnsupportedAlgorithm(format!("{:?}", other))),
        };
        Ok(Self { alg, pri_key })
    }

    /// 以 PKCS#8 PEM 格式輸出私鑰。
    pub fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.pri_key.private_key_to_pem_pkcs8()?)
    }

    /// 產生此金鑰的 JWK 公開表示。
    pub fn jwk(&self) -> Result<Jwk> {
        match self.alg {
            KeyAlgorithm::Rsa(_) => {
                let rsa = self.pri_key.rsa()?;
                Ok(Jwk::Rsa {
                    e: URL_SAFE_NO_PAD.encode(rsa.e().to_vec()),
                    n: URL_SAFE_NO_PAD.encode(rsa.n().to_vec()),
                })
            }
            KeyAlgorithm::EcP256 => {
                let ec = self.pri_key.ec_key()?;
                let mut ctx = BigNumContext::new()?;
                let mut x = BigNum::new()?;
                let mut y = BigNum::new()?;
                ec.public_key()
                    .affine_coordinates_gfp(ec.group(), &mut x, &mut y, &mut ctx)?;
                Ok(Jwk::Ec {
                    crv: "P-256".to_string(),
                    x: URL_SAFE_NO_PAD.encode(x.to_vec_padded(32)?),
                    y: URL_SAFE_NO_PAD.encode(y.to_vec_padded(32)?),
                })
            }
        }
    }

    /// 計算 RFC 7638 金鑰縮影（thumbprint），以 URL-safe Base64 回傳。
    pub fn thumbprint(&self) -> Result<String> {
        let digest = sha256(self.jwk()?.thumbprint_input().as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(digest))
    }
}
