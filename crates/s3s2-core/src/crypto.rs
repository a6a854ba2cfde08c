use std::fs;
use std::io::Cursor;
use std::path::Path;

use pgp::composed::{Deserializable, Message};
pub use pgp::composed::{SignedPublicKey, SignedSecretKey};
use pgp::crypto::sym::SymmetricKeyAlgorithm;
use tracing::debug;

use crate::options::Options;
use crate::store::{self, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key parse error: {0}")]
    KeyParse(String),
    #[error("no {0} key source configured")]
    MissingKey(&'static str),
    #[error("encrypt error: {0}")]
    Encrypt(String),
    #[error("decrypt error: {0}")]
    Decrypt(String),
    #[error("secret store error: {0}")]
    SecretStore(#[from] StoreError),
}

/// Resolves the recipient public key from a local file or a secret-store
/// entry. Called once per run; the parsed key is cached by the pipeline.
pub async fn load_public_key(opts: &Options) -> Result<SignedPublicKey, CryptoError> {
    let raw = match (&opts.pub_key, &opts.ssm_pub_key) {
        (Some(path), _) => {
            debug!(path = %path.display(), "reading public key from file");
            fs::read(path)?
        }
        (None, Some(name)) => {
            debug!(name = %name, "fetching public key from secret store");
            store::get_ssm_parameter(opts, name).await?.into_bytes()
        }
        (None, None) => return Err(CryptoError::MissingKey("public")),
    };
    parse_public_key(&raw)
}

/// Symmetric counterpart of [`load_public_key`] for the receive side.
pub async fn load_secret_key(opts: &Options) -> Result<SignedSecretKey, CryptoError> {
    let raw = match (&opts.priv_key, &opts.ssm_priv_key) {
        (Some(path), _) => {
            debug!(path = %path.display(), "reading private key from file");
            fs::read(path)?
        }
        (None, Some(name)) => {
            debug!(name = %name, "fetching private key from secret store");
            store::get_ssm_parameter(opts, name).await?.into_bytes()
        }
        (None, None) => return Err(CryptoError::MissingKey("private")),
    };
    parse_secret_key(&raw)
}

/// Parses armored key material, falling back to binary packets.
pub fn parse_public_key(raw: &[u8]) -> Result<SignedPublicKey, CryptoError> {
    match SignedPublicKey::from_armor_single(Cursor::new(raw)) {
        Ok((key, _)) => Ok(key),
        Err(armor_err) => SignedPublicKey::from_bytes(Cursor::new(raw))
            .map_err(|e| CryptoError::KeyParse(format!("{} / {}", armor_err, e))),
    }
}

pub fn parse_secret_key(raw: &[u8]) -> Result<SignedSecretKey, CryptoError> {
    match SignedSecretKey::from_armor_single(Cursor::new(raw)) {
        Ok((key, _)) => Ok(key),
        Err(armor_err) => SignedSecretKey::from_bytes(Cursor::new(raw))
            .map_err(|e| CryptoError::KeyParse(format!("{} / {}", armor_err, e))),
    }
}

/// Encrypts a byte buffer to the recipient key. The literal packet carries
/// `name`; no compression layer is added since every payload is already a
/// Deflate zip. The output is an integrity-protected binary packet.
pub fn encrypt_bytes(
    public_key: &SignedPublicKey,
    name: &str,
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let message = Message::new_literal_bytes(name, data);
    let mut rng = rand::thread_rng();
    let encrypted = message
        .encrypt_to_keys(&mut rng, SymmetricKeyAlgorithm::AES256, &[public_key])
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
    use pgp::ser::Serialize;
    encrypted
        .to_bytes()
        .map_err(|e| CryptoError::Encrypt(e.to_string()))
}

/// Encrypts the file at `src` to `dst`.
pub fn encrypt_file(
    public_key: &SignedPublicKey,
    src: &Path,
    dst: &Path,
) -> Result<(), CryptoError> {
    debug!(src = %src.display(), dst = %dst.display(), "encrypting file");
    let data = fs::read(src)?;
    let name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let encrypted = encrypt_bytes(public_key, &name, &data)?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(dst, encrypted)?;
    Ok(())
}

/// Decrypts the packet at `src` with the held private key and writes the
/// literal content to `dst`. A packet addressed to a different key fails
/// with a decrypt error.
pub fn decrypt_file(
    secret_key: &SignedSecretKey,
    src: &Path,
    dst: &Path,
) -> Result<(), CryptoError> {
    debug!(src = %src.display(), dst = %dst.display(), "decrypting file");
    let raw = fs::read(src)?;
    let message =
        Message::from_bytes(Cursor::new(raw)).map_err(|e| CryptoError::Decrypt(e.to_string()))?;
    let (decrypted, _key_ids) = message
        .decrypt(String::new, &[secret_key])
        .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
    let content = decrypted
        .get_content()
        .map_err(|e| CryptoError::Decrypt(e.to_string()))?
        .ok_or_else(|| CryptoError::Decrypt("empty literal packet".to_string()))?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(dst, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgp::composed::{KeyType, SecretKeyParamsBuilder};
    use pgp::types::SecretKeyTrait;

    fn generate_keypair() -> (SignedPublicKey, SignedSecretKey) {
        let params = SecretKeyParamsBuilder::default()
            .key_type(KeyType::Rsa(2048))
            .can_certify(true)
            .can_sign(true)
            .can_encrypt(true)
            .primary_user_id("s3s2 test <test@example.com>".to_string())
            .build()
            .unwrap();
        let secret_key = params.generate().unwrap();
        let signed_secret = secret_key.sign(String::new).unwrap();
        let signed_public = signed_secret
            .public_key()
            .sign(&signed_secret, String::new)
            .unwrap();
        (signed_public, signed_secret)
    }

    #[test]
    fn encrypt_decrypt_round_trips() {
        let (public_key, secret_key) = generate_keypair();
        let dir = tempfile::tempdir().unwrap();

        let plain: Vec<u8> = (0..2048u32).map(|i| (i % 253) as u8).collect();
        let src = dir.path().join("payload.zip");
        fs::write(&src, &plain).unwrap();

        let encrypted = dir.path().join("payload.zip.gpg");
        encrypt_file(&public_key, &src, &encrypted).unwrap();
        assert_ne!(fs::read(&encrypted).unwrap(), plain);

        let restored = dir.path().join("restored.zip");
        decrypt_file(&secret_key, &encrypted, &restored).unwrap();
        assert_eq!(fs::read(&restored).unwrap(), plain);
    }

    #[test]
    fn buffer_round_trip() {
        let (public_key, secret_key) = generate_keypair();
        let dir = tempfile::tempdir().unwrap();

        let encrypted = encrypt_bytes(&public_key, "buf.zip", b"in-memory payload").unwrap();
        let enc_path = dir.path().join("buf.zip.gpg");
        fs::write(&enc_path, &encrypted).unwrap();

        let out = dir.path().join("buf.zip");
        decrypt_file(&secret_key, &enc_path, &out).unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"in-memory payload");
    }

    #[test]
    fn decrypt_rejects_foreign_key() {
        let (public_key, _) = generate_keypair();
        let (_, other_secret) = generate_keypair();
        let dir = tempfile::tempdir().unwrap();

        let encrypted = encrypt_bytes(&public_key, "x", b"secret").unwrap();
        let enc_path = dir.path().join("x.gpg");
        fs::write(&enc_path, &encrypted).unwrap();

        let out = dir.path().join("x.out");
        assert!(decrypt_file(&other_secret, &enc_path, &out).is_err());
    }

    #[test]
    fn parses_armored_and_binary_keys() {
        let (public_key, _) = generate_keypair();

        let armored = public_key.to_armored_string(None.into()).unwrap();
        let from_armor = parse_public_key(armored.as_bytes()).unwrap();
        assert_eq!(from_armor, public_key);

        use pgp::ser::Serialize;
        let binary = public_key.to_bytes().unwrap();
        let from_binary = parse_public_key(&binary).unwrap();
        assert_eq!(from_binary, public_key);
    }
}
