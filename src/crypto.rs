//! ECDSA P-256 signing, verification and the canonical public-key hash.
//!
//! Public keys travel as DER-SPKI, private keys as SEC1 DER, signatures as
//! DER-encoded (R,S) pairs. The canonical hash of a public key is
//! `"1:" + hex(SHA-256(DER-SPKI))`; the `1:` prefix tags the hash algorithm
//! so it can be rotated later.

use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use p256::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};

use crate::chain::keyring;
use crate::db::DbPool;

/// Prefix of every canonical public-key hash.
pub const KEY_HASH_PREFIX: &str = "1:";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Malformed DER, bad hex, or a key hash without the "1:" prefix.
    #[error("bad format: {0}")]
    BadFormat(String),

    /// The signature is well-formed but does not verify.
    #[error("signature verification failed")]
    BadSignature,

    #[error("store error: {0}")]
    Store(#[from] crate::db::StoreError),

    #[error("no private keys available")]
    NoPrivateKey,

    /// A loaded keypair whose recomputed public hash doesn't match its record.
    #[error("keypair {0} is inconsistent with its stored hash")]
    KeyMismatch(String),
}

/// A usable keypair: the signing key plus its canonical public hash.
pub struct Keypair {
    signing: SigningKey,
    verifying: VerifyingKey,
    pub public_key_hash: String,
}

impl Keypair {
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying
    }

    /// DER-SPKI encoding of the public key.
    pub fn public_key_der(&self) -> Result<Vec<u8>, CryptoError> {
        let pk = PublicKey::from(&self.verifying);
        Ok(pk
            .to_public_key_der()
            .map_err(|e| CryptoError::BadFormat(e.to_string()))?
            .as_bytes()
            .to_vec())
    }

    /// Sign a raw digest. The bytes are signed as given, not re-hashed.
    pub fn sign_bytes(&self, digest: &[u8]) -> Result<Vec<u8>, CryptoError> {
        sign_bytes(&self.signing, digest)
    }

    /// Sign a hex-encoded digest, returning a hex-encoded DER signature.
    pub fn sign_hex(&self, digest_hex: &str) -> Result<String, CryptoError> {
        let digest = decode_hex(digest_hex)?;
        Ok(hex::encode(self.sign_bytes(&digest)?))
    }

    /// Sign the digest carried inside a canonical `"1:<hex>"` key hash.
    pub fn sign_key_hash(&self, key_hash: &str) -> Result<Vec<u8>, CryptoError> {
        self.sign_bytes(&key_hash_digest(key_hash)?)
    }
}

/// Canonical hash of a DER-SPKI public key: `"1:" + hex(SHA-256(der))`.
pub fn public_key_hash(der: &[u8]) -> String {
    format!("{}{}", KEY_HASH_PREFIX, hex::encode(Sha256::digest(der)))
}

/// Decode DER-SPKI bytes into a verifying key.
pub fn decode_public_key(der: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let pk = PublicKey::from_public_key_der(der)
        .map_err(|e| CryptoError::BadFormat(format!("public key DER: {}", e)))?;
    Ok(VerifyingKey::from(&pk))
}

/// Sign a raw digest with the given key; DER-encoded signature out.
/// The RustCrypto signer never emits zero R or S components.
pub fn sign_bytes(key: &SigningKey, digest: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let sig: Signature = key
        .sign_prehash(digest)
        .map_err(|_| CryptoError::BadSignature)?;
    Ok(sig.to_der().to_bytes().to_vec())
}

/// Verify a DER signature over a raw digest. Ok(()) means it verifies.
pub fn verify_bytes(key: &VerifyingKey, digest: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let sig = Signature::from_der(signature)
        .map_err(|e| CryptoError::BadFormat(format!("signature DER: {}", e)))?;
    key.verify_prehash(digest, &sig)
        .map_err(|_| CryptoError::BadSignature)
}

/// Verify a signature over a hex-encoded digest.
pub fn verify_hex_bytes(
    key: &VerifyingKey,
    digest_hex: &str,
    signature: &[u8],
) -> Result<(), CryptoError> {
    verify_bytes(key, &decode_hex(digest_hex)?, signature)
}

/// Verify a hex-encoded signature over a hex-encoded digest.
pub fn verify_hex(key: &VerifyingKey, digest_hex: &str, signature_hex: &str) -> Result<(), CryptoError> {
    verify_bytes(key, &decode_hex(digest_hex)?, &decode_hex(signature_hex)?)
}

/// Verify a signature over the digest inside a canonical `"1:<hex>"` hash.
pub fn verify_key_hash_signature(
    key: &VerifyingKey,
    key_hash: &str,
    signature: &[u8],
) -> Result<(), CryptoError> {
    verify_bytes(key, &key_hash_digest(key_hash)?, signature)
}

/// Extract the digest bytes from a canonical `"1:<hex>"` key hash.
fn key_hash_digest(key_hash: &str) -> Result<Vec<u8>, CryptoError> {
    let hex_part = key_hash.strip_prefix(KEY_HASH_PREFIX).ok_or_else(|| {
        CryptoError::BadFormat(format!(
            "expected a \"type:hex\" public key hash, got {:?}",
            key_hash
        ))
    })?;
    decode_hex(hex_part)
}

fn decode_hex(s: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(s).map_err(|e| CryptoError::BadFormat(format!("hex: {}", e)))
}

/// Generate a fresh keypair and record it in both stores, tagging the
/// public record with the chain height it belongs to (-1 for keys that
/// exist only locally and are not part of the accepted set yet).
pub fn generate_keypair(
    main_db: &DbPool,
    private_db: &DbPool,
    height: i64,
) -> Result<Keypair, CryptoError> {
    let secret = SecretKey::random(&mut rand::thread_rng());
    let public = secret.public_key();

    let public_der = public
        .to_public_key_der()
        .map_err(|e| CryptoError::BadFormat(e.to_string()))?
        .as_bytes()
        .to_vec();
    let private_der = secret
        .to_sec1_der()
        .map_err(|e| CryptoError::BadFormat(e.to_string()))?
        .to_vec();
    let hash = public_key_hash(&public_der);

    {
        let conn = crate::db::lock(main_db)?;
        keyring::write_public_key(&conn, &public_der, &hash, height, None)?;
    }
    {
        let conn = crate::db::lock(private_db)?;
        keyring::write_private_key(&conn, &private_der, &hash)?;
    }

    Ok(Keypair {
        signing: SigningKey::from(&secret),
        verifying: VerifyingKey::from(&public),
        public_key_hash: hash,
    })
}

/// Load a keypair from the stores (the first private key on record),
/// cross-checking that the stored public key still hashes to its key.
pub fn load_keypair(main_db: &DbPool, private_db: &DbPool) -> Result<Keypair, CryptoError> {
    let (private_der, hash) = {
        let conn = crate::db::lock(private_db)?;
        keyring::get_a_private_key(&conn)?
    }
    .ok_or(CryptoError::NoPrivateKey)?;
    let record = {
        let conn = crate::db::lock(main_db)?;
        keyring::get_public_key(&conn, &hash)?
    }
    .ok_or_else(|| CryptoError::KeyMismatch(hash.clone()))?;

    let secret = SecretKey::from_sec1_der(&private_der)
        .map_err(|e| CryptoError::BadFormat(format!("private key DER: {}", e)))?;
    let verifying = decode_public_key(&record.public_key)?;

    if public_key_hash(&record.public_key) != hash {
        return Err(CryptoError::KeyMismatch(hash));
    }

    Ok(Keypair {
        signing: SigningKey::from(&secret),
        verifying,
        public_key_hash: hash,
    })
}

/// Make sure at least one private key exists; generates the default keypair
/// on a fresh node.
pub fn ensure_default_keypair(main_db: &DbPool, private_db: &DbPool) -> Result<(), CryptoError> {
    let count = {
        let conn = crate::db::lock(private_db)?;
        keyring::num_private_keys(&conn)?
    };
    if count == 0 {
        tracing::info!("Generating the default private key");
        let keypair = generate_keypair(main_db, private_db, -1)?;
        tracing::info!(hash = %keypair.public_key_hash, "Generated default key");
    }
    Ok(())
}
