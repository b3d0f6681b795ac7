//! Password-based file encryption

mod cipher;

pub use self::cipher::{
    CipherBox, CipherEnvelope, CipherParams, BLOCK_LEN, DEFAULT_KDF_ITERATIONS, IV_LEN, TAG_LEN,
};
