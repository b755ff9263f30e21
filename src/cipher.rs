//! Symmetric encryption of session payloads.
//!
//! WalletConnect v1 payloads are AES-256-CBC with PKCS7 padding,
//! authenticated by an HMAC-SHA256 over ciphertext and IV. All three parts
//! travel as lowercase hex in a JSON object. Every envelope the protocol
//! layer sends or receives passes through this module.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use alloy::hex;
use hmac::{Hmac, Mac};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const IV_LENGTH: usize = 16;
pub const KEY_LENGTH: usize = 32;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub data: String,
    pub hmac: String,
    pub iv: String,
}

pub fn encrypt(plaintext: &[u8], key: &[u8; KEY_LENGTH]) -> Result<EncryptedPayload> {
    let mut iv = [0u8; IV_LENGTH];
    OsRng.fill_bytes(&mut iv);

    let cipher_bytes =
        Aes256CbcEnc::new(key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(&cipher_bytes);
    mac.update(&iv);

    Ok(EncryptedPayload {
        data: hex::encode(&cipher_bytes),
        hmac: hex::encode(mac.finalize().into_bytes()),
        iv: hex::encode(iv),
    })
}

pub fn decrypt(payload: &EncryptedPayload, key: &[u8; KEY_LENGTH]) -> Result<Vec<u8>> {
    let data =
        hex::decode(&payload.data).map_err(|_| Error::Format("payload data is not valid hex"))?;
    let iv = hex::decode(&payload.iv).map_err(|_| Error::Format("payload iv is not valid hex"))?;
    let tag =
        hex::decode(&payload.hmac).map_err(|_| Error::Format("payload hmac is not valid hex"))?;

    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(&data);
    mac.update(&iv);
    mac.verify_slice(&tag).map_err(|_| Error::Integrity)?;

    let iv: [u8; IV_LENGTH] = iv
        .try_into()
        .map_err(|_| Error::Format("payload iv must be 16 bytes"))?;

    Aes256CbcDec::new(key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&data)
        .map_err(|_| Error::Format("payload has invalid padding"))
}
