use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use aes::Aes256;
use cipher::block_padding::Pkcs7;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::CipherError;
use crate::task::{ProgressEvent, TaskContext};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 32;
pub const BLOCK_LEN: usize = 16;
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// Streaming chunk; a multiple of the block size
const CHUNK_SIZE: usize = 64 * 1024;

/// Smallest well-formed envelope: IV, one padded block, tag
const MIN_ENVELOPE_LEN: usize = IV_LEN + BLOCK_LEN + TAG_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherParams {
    pub kdf_iterations: u32,
}

impl Default for CipherParams {
    fn default() -> Self {
        Self { kdf_iterations: DEFAULT_KDF_ITERATIONS }
    }
}

/// `[IV 16][ciphertext][tag 32]`, no header or magic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherEnvelope {
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl CipherEnvelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IV_LEN + self.ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    /// Shape check only; authenticity is checked by `CipherBox::decrypt`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        if !is_valid_envelope_len(bytes.len() as u64) {
            return Err(CipherError::WrongPasswordOrCorrupt);
        }
        let (iv, rest) = bytes.split_at(IV_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);

        let mut envelope = CipherEnvelope {
            iv: [0u8; IV_LEN],
            ciphertext: ciphertext.to_vec(),
            tag: [0u8; TAG_LEN],
        };
        envelope.iv.copy_from_slice(iv);
        envelope.tag.copy_from_slice(tag);
        Ok(envelope)
    }
}

fn is_valid_envelope_len(len: u64) -> bool {
    len >= MIN_ENVELOPE_LEN as u64 && (len - (IV_LEN + TAG_LEN) as u64) % BLOCK_LEN as u64 == 0
}

struct DerivedKeys {
    enc: [u8; 32],
    mac: [u8; 32],
}

/// PBKDF2-HMAC-SHA256 salted with the IV; first half encrypts, second half authenticates
fn derive_keys(password: &str, iv: &[u8; IV_LEN], iterations: u32) -> DerivedKeys {
    let mut okm = [0u8; 64];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), iv, iterations.max(1), &mut okm);
    let mut keys = DerivedKeys { enc: [0u8; 32], mac: [0u8; 32] };
    keys.enc.copy_from_slice(&okm[..32]);
    keys.mac.copy_from_slice(&okm[32..]);
    okm.fill(0);
    keys
}

impl Drop for DerivedKeys {
    fn drop(&mut self) {
        self.enc.fill(0);
        self.mac.fill(0);
    }
}

fn new_mac(keys: &DerivedKeys) -> Result<HmacSha256, CipherError> {
    <HmacSha256 as Mac>::new_from_slice(&keys.mac)
        .map_err(|_| CipherError::Io(io::Error::new(io::ErrorKind::InvalidInput, "invalid hmac key length")))
}

fn fresh_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Password-based symmetric encryption of byte buffers and files
#[derive(Debug, Clone, Default)]
pub struct CipherBox {
    params: CipherParams,
}

impl CipherBox {
    pub fn new(params: CipherParams) -> Self {
        Self { params }
    }

    pub fn with_iterations(kdf_iterations: u32) -> Self {
        Self::new(CipherParams { kdf_iterations })
    }

    pub fn params(&self) -> CipherParams {
        self.params
    }

    /// Fresh random IV per call
    pub fn encrypt(&self, plaintext: &[u8], password: &str) -> Result<Vec<u8>, CipherError> {
        let iv = fresh_iv();
        let keys = derive_keys(password, &iv, self.params.kdf_iterations);

        let ciphertext = Aes256CbcEnc::new(GenericArray::from_slice(&keys.enc), GenericArray::from_slice(&iv))
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut mac = new_mac(&keys)?;
        mac.update(&iv);
        mac.update(&ciphertext);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&mac.finalize().into_bytes());

        Ok(CipherEnvelope { iv, ciphertext, tag }.to_bytes())
    }

    /// Any authentication or padding failure is `WrongPasswordOrCorrupt`
    pub fn decrypt(&self, envelope: &[u8], password: &str) -> Result<Vec<u8>, CipherError> {
        let envelope = CipherEnvelope::from_bytes(envelope)?;
        let keys = derive_keys(password, &envelope.iv, self.params.kdf_iterations);

        let mut mac = new_mac(&keys)?;
        mac.update(&envelope.iv);
        mac.update(&envelope.ciphertext);
        mac.verify_slice(&envelope.tag)
            .map_err(|_| CipherError::WrongPasswordOrCorrupt)?;

        Aes256CbcDec::new(GenericArray::from_slice(&keys.enc), GenericArray::from_slice(&envelope.iv))
            .decrypt_padded_vec_mut::<Pkcs7>(&envelope.ciphertext)
            .map_err(|_| CipherError::WrongPasswordOrCorrupt)
    }

    /// Stream `source` into an envelope at `dest`; returns plaintext bytes read.
    ///
    /// Output is staged in a temp file next to `dest` and only persisted once
    /// complete, so a cancelled or failed run leaves `dest` untouched.
    pub fn encrypt_file(&self, source: &Path, dest: &Path, password: &str, ctx: &TaskContext) -> Result<u64, CipherError> {
        let src = File::open(source)?;
        let total = src.metadata()?.len();
        let mut reader = BufReader::with_capacity(CHUNK_SIZE, src);
        ctx.send(ProgressEvent::Preparing(format!("encrypting {}", source.display())));

        let tmp = staging_file(dest)?;
        let mut writer = BufWriter::new(tmp.as_file());

        let iv = fresh_iv();
        let keys = derive_keys(password, &iv, self.params.kdf_iterations);
        let mut encryptor = Aes256CbcEnc::new(GenericArray::from_slice(&keys.enc), GenericArray::from_slice(&iv));
        let mut mac = new_mac(&keys)?;

        writer.write_all(&iv)?;
        mac.update(&iv);

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut filled = 0usize;
        let mut done = 0u64;
        loop {
            ctx.checkpoint()?;
            let n = reader.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
            done += n as u64;

            // Encrypt every whole block; a partial tail waits for more input
            let whole = filled - filled % BLOCK_LEN;
            for block in buf[..whole].chunks_exact_mut(BLOCK_LEN) {
                encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            writer.write_all(&buf[..whole])?;
            mac.update(&buf[..whole]);
            buf.copy_within(whole..filled, 0);
            filled -= whole;
            ctx.report_bytes(done, total);
        }

        // PKCS#7 over the remainder (a full padding block when it is empty)
        let mut last = [0u8; BLOCK_LEN];
        last[..filled].copy_from_slice(&buf[..filled]);
        let padded = encryptor
            .encrypt_padded_mut::<Pkcs7>(&mut last, filled)
            .map_err(|_| CipherError::Io(io::Error::new(io::ErrorKind::InvalidData, "padding failed")))?;
        writer.write_all(padded)?;
        mac.update(padded);

        writer.write_all(&mac.finalize().into_bytes())?;
        writer.flush()?;
        drop(writer);
        tmp.as_file().sync_all()?;
        tmp.persist(dest).map_err(|e| CipherError::Io(e.error))?;

        debug!(source = %source.display(), dest = %dest.display(), bytes = done, "encrypted file");
        Ok(done)
    }

    /// Inverse of `encrypt_file`; `dest` only appears once the tag verifies
    pub fn decrypt_file(&self, source: &Path, dest: &Path, password: &str, ctx: &TaskContext) -> Result<u64, CipherError> {
        let src = File::open(source)?;
        let total = src.metadata()?.len();
        if !is_valid_envelope_len(total) {
            return Err(CipherError::WrongPasswordOrCorrupt);
        }
        let mut reader = BufReader::with_capacity(CHUNK_SIZE, src);
        ctx.send(ProgressEvent::Preparing(format!("decrypting {}", source.display())));

        let mut iv = [0u8; IV_LEN];
        reader.read_exact(&mut iv)?;
        let keys = derive_keys(password, &iv, self.params.kdf_iterations);
        let mut decryptor = Aes256CbcDec::new(GenericArray::from_slice(&keys.enc), GenericArray::from_slice(&iv));
        let mut mac = new_mac(&keys)?;
        mac.update(&iv);

        let tmp = staging_file(dest)?;
        let mut writer = BufWriter::new(tmp.as_file());

        let ciphertext_len = total - (IV_LEN + TAG_LEN) as u64;
        let mut remaining = ciphertext_len;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut last = [0u8; BLOCK_LEN];
        let mut written = 0u64;

        while remaining > 0 {
            ctx.checkpoint()?;
            let n = remaining.min(CHUNK_SIZE as u64) as usize;
            reader.read_exact(&mut buf[..n])?;
            mac.update(&buf[..n]);
            remaining -= n as u64;

            // The final block carries the padding; hold it back until the tag checks out
            let body = if remaining == 0 { n - BLOCK_LEN } else { n };
            if remaining == 0 {
                last.copy_from_slice(&buf[body..n]);
            }
            for block in buf[..body].chunks_exact_mut(BLOCK_LEN) {
                decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            writer.write_all(&buf[..body])?;
            written += body as u64;
            ctx.report_bytes(ciphertext_len - remaining, ciphertext_len);
        }

        let mut tag = [0u8; TAG_LEN];
        reader.read_exact(&mut tag)?;
        if mac.verify_slice(&tag).is_err() {
            warn!(source = %source.display(), "envelope failed authentication");
            return Err(CipherError::WrongPasswordOrCorrupt);
        }

        let plain_tail = decryptor
            .decrypt_padded_mut::<Pkcs7>(&mut last)
            .map_err(|_| CipherError::WrongPasswordOrCorrupt)?;
        writer.write_all(plain_tail)?;
        written += plain_tail.len() as u64;

        writer.flush()?;
        drop(writer);
        tmp.as_file().sync_all()?;
        tmp.persist(dest).map_err(|e| CipherError::Io(e.error))?;

        debug!(source = %source.display(), dest = %dest.display(), bytes = written, "decrypted file");
        Ok(written)
    }
}

fn staging_file(dest: &Path) -> Result<tempfile::NamedTempFile, CipherError> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok(tempfile::Builder::new()
        .prefix(".filevault.")
        .suffix(".tmp")
        .tempfile_in(parent)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fast_box() -> CipherBox {
        CipherBox::with_iterations(1_000)
    }

    #[test]
    fn test_round_trip() {
        let cb = fast_box();
        for plaintext in [&b""[..], b"x", b"exactly16bytes!!", b"a somewhat longer message that spans blocks"] {
            let envelope = cb.encrypt(plaintext, "hunter2").unwrap();
            assert_eq!((envelope.len() - IV_LEN - TAG_LEN) % BLOCK_LEN, 0);
            assert_eq!(cb.decrypt(&envelope, "hunter2").unwrap(), plaintext);
        }
    }

    #[test]
    fn test_iv_is_fresh_per_call() {
        let cb = fast_box();
        let a = cb.encrypt(b"same", "pw").unwrap();
        let b = cb.encrypt(b"same", "pw").unwrap();
        assert_ne!(a[..IV_LEN], b[..IV_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_password() {
        let cb = fast_box();
        let envelope = cb.encrypt(b"secret", "right").unwrap();
        assert!(matches!(cb.decrypt(&envelope, "wrong"), Err(CipherError::WrongPasswordOrCorrupt)));
    }

    #[test]
    fn test_tampered_and_truncated_envelopes() {
        let cb = fast_box();
        let mut envelope = cb.encrypt(b"secret payload", "pw").unwrap();
        envelope[IV_LEN + 2] ^= 0x01;
        assert!(matches!(cb.decrypt(&envelope, "pw"), Err(CipherError::WrongPasswordOrCorrupt)));

        assert!(matches!(cb.decrypt(&[0u8; 10], "pw"), Err(CipherError::WrongPasswordOrCorrupt)));
        assert!(matches!(cb.decrypt(&[0u8; MIN_ENVELOPE_LEN + 3], "pw"), Err(CipherError::WrongPasswordOrCorrupt)));
    }

    #[test]
    fn test_envelope_layout() {
        let cb = fast_box();
        let bytes = cb.encrypt(b"abc", "pw").unwrap();
        let envelope = CipherEnvelope::from_bytes(&bytes).unwrap();
        assert_eq!(envelope.ciphertext.len(), BLOCK_LEN);
        assert_eq!(envelope.to_bytes(), bytes);
    }

    #[test]
    fn test_file_round_trip_across_chunks() {
        let temp = TempDir::new().unwrap();
        let plain = temp.path().join("plain.bin");
        let sealed = temp.path().join("plain.bin.enc");
        let opened = temp.path().join("opened.bin");
        let data: Vec<u8> = (0..CHUNK_SIZE * 2 + 37).map(|i| (i % 251) as u8).collect();
        fs::write(&plain, &data).unwrap();

        let cb = fast_box();
        let ctx = TaskContext::detached();
        assert_eq!(cb.encrypt_file(&plain, &sealed, "pw", &ctx).unwrap(), data.len() as u64);
        assert_eq!(cb.decrypt_file(&sealed, &opened, "pw", &ctx).unwrap(), data.len() as u64);
        assert_eq!(fs::read(&opened).unwrap(), data);

        // File and buffer variants produce the same envelope format
        let sealed_bytes = fs::read(&sealed).unwrap();
        assert_eq!(cb.decrypt(&sealed_bytes, "pw").unwrap(), data);
    }

    #[test]
    fn test_file_decrypt_wrong_password_leaves_no_output() {
        let temp = TempDir::new().unwrap();
        let plain = temp.path().join("a.txt");
        let sealed = temp.path().join("a.enc");
        let opened = temp.path().join("a.out");
        fs::write(&plain, b"top secret").unwrap();

        let cb = fast_box();
        let ctx = TaskContext::detached();
        cb.encrypt_file(&plain, &sealed, "pw", &ctx).unwrap();
        let err = cb.decrypt_file(&sealed, &opened, "nope", &ctx).unwrap_err();
        assert!(matches!(err, CipherError::WrongPasswordOrCorrupt));
        assert!(!opened.exists());
        // Plaintext and envelope only; the staging file is gone
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_file_encrypt_empty_and_block_aligned() {
        let temp = TempDir::new().unwrap();
        let cb = fast_box();
        let ctx = TaskContext::detached();
        for (name, data) in [("empty", Vec::new()), ("aligned", vec![7u8; 32])] {
            let plain = temp.path().join(name);
            let sealed = temp.path().join(format!("{name}.enc"));
            fs::write(&plain, &data).unwrap();
            cb.encrypt_file(&plain, &sealed, "pw", &ctx).unwrap();
            let sealed_len = fs::metadata(&sealed).unwrap().len() as usize;
            assert_eq!(sealed_len, IV_LEN + data.len() + BLOCK_LEN + TAG_LEN);
            assert_eq!(cb.decrypt(&fs::read(&sealed).unwrap(), "pw").unwrap(), data);
        }
    }

    #[test]
    fn test_cancelled_encrypt_leaves_dest_absent() {
        let temp = TempDir::new().unwrap();
        let plain = temp.path().join("big.bin");
        let sealed = temp.path().join("big.enc");
        fs::write(&plain, vec![1u8; 1024]).unwrap();

        let ctx = TaskContext::detached();
        ctx.cancel_flag().store(true, std::sync::atomic::Ordering::Relaxed);
        let err = fast_box().encrypt_file(&plain, &sealed, "pw", &ctx).unwrap_err();
        assert!(matches!(err, CipherError::Cancelled));
        assert!(!sealed.exists());
    }
}
