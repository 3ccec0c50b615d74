use crate::error::{Error, Result};
use crate::md5;
use bytes::{Bytes, BytesMut};
use rand::RngCore;
use std::fmt;
use std::sync::Arc;

pub use context::{CryptoContext, SharedCryptoContext};

pub mod context;
pub mod stream;
pub mod table;

use stream::{DecryptCipher, EncryptCipher};
use table::SubstitutionTable;

/// Supported stream-cipher methods with their exact key/iv byte lengths.
/// The legacy substitution cipher is not listed here; it is selected by a
/// method of `"table"` (or no method at all) and carries no key/iv.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CipherKind {
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    BfCfb,
    Camellia128Cfb,
    Camellia192Cfb,
    Camellia256Cfb,
    Cast5Cfb,
    DesCfb,
    IdeaCfb,
    Rc2Cfb,
    Rc4,
    Rc4Md5,
}

impl CipherKind {
    pub const ALL: &'static [CipherKind] = &[
        CipherKind::Aes128Cfb,
        CipherKind::Aes192Cfb,
        CipherKind::Aes256Cfb,
        CipherKind::BfCfb,
        CipherKind::Camellia128Cfb,
        CipherKind::Camellia192Cfb,
        CipherKind::Camellia256Cfb,
        CipherKind::Cast5Cfb,
        CipherKind::DesCfb,
        CipherKind::IdeaCfb,
        CipherKind::Rc2Cfb,
        CipherKind::Rc4,
        CipherKind::Rc4Md5,
    ];

    pub fn from_name(name: &str) -> Result<CipherKind> {
        match name.to_ascii_lowercase().as_str() {
            "aes-128-cfb" => Ok(CipherKind::Aes128Cfb),
            "aes-192-cfb" => Ok(CipherKind::Aes192Cfb),
            "aes-256-cfb" => Ok(CipherKind::Aes256Cfb),
            "bf-cfb" => Ok(CipherKind::BfCfb),
            "camellia-128-cfb" => Ok(CipherKind::Camellia128Cfb),
            "camellia-192-cfb" => Ok(CipherKind::Camellia192Cfb),
            "camellia-256-cfb" => Ok(CipherKind::Camellia256Cfb),
            "cast5-cfb" => Ok(CipherKind::Cast5Cfb),
            "des-cfb" => Ok(CipherKind::DesCfb),
            "idea-cfb" => Ok(CipherKind::IdeaCfb),
            "rc2-cfb" => Ok(CipherKind::Rc2Cfb),
            "rc4" => Ok(CipherKind::Rc4),
            "rc4-md5" => Ok(CipherKind::Rc4Md5),
            other => Err(Error::UnsupportedCipherMethod(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::Aes128Cfb => "aes-128-cfb",
            CipherKind::Aes192Cfb => "aes-192-cfb",
            CipherKind::Aes256Cfb => "aes-256-cfb",
            CipherKind::BfCfb => "bf-cfb",
            CipherKind::Camellia128Cfb => "camellia-128-cfb",
            CipherKind::Camellia192Cfb => "camellia-192-cfb",
            CipherKind::Camellia256Cfb => "camellia-256-cfb",
            CipherKind::Cast5Cfb => "cast5-cfb",
            CipherKind::DesCfb => "des-cfb",
            CipherKind::IdeaCfb => "idea-cfb",
            CipherKind::Rc2Cfb => "rc2-cfb",
            CipherKind::Rc4 => "rc4",
            CipherKind::Rc4Md5 => "rc4-md5",
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Cfb => 16,
            CipherKind::Aes192Cfb => 24,
            CipherKind::Aes256Cfb => 32,
            CipherKind::BfCfb => 16,
            CipherKind::Camellia128Cfb => 16,
            CipherKind::Camellia192Cfb => 24,
            CipherKind::Camellia256Cfb => 32,
            CipherKind::Cast5Cfb => 16,
            CipherKind::DesCfb => 8,
            CipherKind::IdeaCfb => 16,
            CipherKind::Rc2Cfb => 16,
            CipherKind::Rc4 => 16,
            CipherKind::Rc4Md5 => 16,
        }
    }

    pub fn iv_len(&self) -> usize {
        match self {
            CipherKind::Aes128Cfb => 16,
            CipherKind::Aes192Cfb => 16,
            CipherKind::Aes256Cfb => 16,
            CipherKind::BfCfb => 8,
            CipherKind::Camellia128Cfb => 16,
            CipherKind::Camellia192Cfb => 16,
            CipherKind::Camellia256Cfb => 16,
            CipherKind::Cast5Cfb => 8,
            CipherKind::DesCfb => 8,
            CipherKind::IdeaCfb => 8,
            CipherKind::Rc2Cfb => 8,
            CipherKind::Rc4 => 0,
            CipherKind::Rc4Md5 => 16,
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolves a configured method name. `None` and `"table"` select the
/// legacy substitution cipher.
pub fn resolve_method(method: Option<&str>) -> Result<Option<CipherKind>> {
    match method {
        None => Ok(None),
        Some(m) if m.eq_ignore_ascii_case("table") => Ok(None),
        Some(m) => CipherKind::from_name(m).map(Some),
    }
}

struct StreamState {
    kind: CipherKind,
    key: Bytes,
    enc_iv: Bytes,
    enc: EncryptCipher,
    dec: Option<DecryptCipher>,
    iv_sent: bool,
}

enum Inner {
    Table(Arc<SubstitutionTable>),
    Stream(StreamState),
}

/// Per-connection cipher state.
///
/// The encrypt direction owns a freshly generated random IV which is
/// prefixed to the first output chunk and never repeated; the decrypt
/// direction initializes itself from the IV carried by the first inbound
/// chunk. Both directions then continue one cipher stream, so calls must
/// stay in arrival order.
pub struct Encryptor {
    inner: Inner,
}

impl Encryptor {
    pub fn new(
        ctx: &CryptoContext,
        password: &str,
        method: Option<CipherKind>,
    ) -> Result<Encryptor> {
        let inner = match method {
            None => Inner::Table(ctx.substitution_table(password)),
            Some(kind) => {
                let (key, _) = ctx.derive_key(password, kind.key_len(), kind.iv_len());
                let mut iv = vec![0u8; kind.iv_len()];
                rand::thread_rng().fill_bytes(&mut iv);
                let enc_iv = Bytes::from(iv);
                let enc = new_encrypt_cipher(kind, &key, &enc_iv)?;
                Inner::Stream(StreamState {
                    kind,
                    key,
                    enc_iv,
                    enc,
                    dec: None,
                    iv_sent: false,
                })
            }
        };
        Ok(Encryptor { inner })
    }

    /// How many IV bytes the decrypt direction still needs before it can
    /// process payload. Zero once initialized (and always for tables).
    pub fn decrypt_iv_needed(&self) -> usize {
        match &self.inner {
            Inner::Table(_) => 0,
            Inner::Stream(s) => {
                if s.dec.is_some() {
                    0
                } else {
                    s.kind.iv_len()
                }
            }
        }
    }

    pub fn encrypt(&mut self, data: &[u8]) -> Bytes {
        match &mut self.inner {
            Inner::Table(t) => t.encrypt(data),
            Inner::Stream(s) => {
                if s.iv_sent {
                    let mut out = BytesMut::with_capacity(data.len());
                    out.extend_from_slice(data);
                    s.enc.process(&mut out);
                    out.freeze()
                } else {
                    s.iv_sent = true;
                    let iv_len = s.enc_iv.len();
                    let mut out = BytesMut::with_capacity(iv_len + data.len());
                    out.extend_from_slice(&s.enc_iv);
                    out.extend_from_slice(data);
                    s.enc.process(&mut out[iv_len..]);
                    out.freeze()
                }
            }
        }
    }

    pub fn decrypt(&mut self, data: &[u8]) -> Result<Bytes> {
        match &mut self.inner {
            Inner::Table(t) => Ok(t.decrypt(data)),
            Inner::Stream(s) => {
                let body = if s.dec.is_none() {
                    let iv_len = s.kind.iv_len();
                    if data.len() < iv_len {
                        return Err(Error::Protocol("first chunk shorter than cipher iv".into()));
                    }
                    s.dec = Some(new_decrypt_cipher(s.kind, &s.key, &data[..iv_len])?);
                    &data[iv_len..]
                } else {
                    data
                };
                let mut out = BytesMut::with_capacity(body.len());
                out.extend_from_slice(body);
                s.dec
                    .as_mut()
                    .expect("decrypt cipher just initialized")
                    .process(&mut out);
                Ok(out.freeze())
            }
        }
    }

    /// Initializes the decrypt direction from an IV collected by the
    /// caller. No-op for the table cipher.
    pub fn begin_decrypt(&mut self, iv: &[u8]) -> Result<()> {
        match &mut self.inner {
            Inner::Table(_) => Ok(()),
            Inner::Stream(s) => {
                if s.dec.is_some() {
                    return Err(Error::Cipher("decrypt direction already initialized".into()));
                }
                s.dec = Some(new_decrypt_cipher(s.kind, &s.key, iv)?);
                Ok(())
            }
        }
    }

    /// Decrypts a buffer in place. The decrypt direction must already be
    /// initialized for stream methods.
    pub fn decrypt_in_place(&mut self, data: &mut [u8]) -> Result<()> {
        match &mut self.inner {
            Inner::Table(t) => {
                t.decrypt_in_place(data);
                Ok(())
            }
            Inner::Stream(s) => match s.dec.as_mut() {
                Some(dec) => {
                    dec.process(data);
                    Ok(())
                }
                None => Err(Error::Cipher("decrypt direction not initialized".into())),
            },
        }
    }
}

/// One-shot encryption for datagrams: a fresh random IV per call, the
/// whole buffer in one cipher pass, output `iv ++ ciphertext`. No state
/// survives the call.
pub fn encrypt_all(
    ctx: &CryptoContext,
    password: &str,
    method: Option<CipherKind>,
    data: &[u8],
) -> Result<Bytes> {
    match method {
        None => Ok(ctx.substitution_table(password).encrypt(data)),
        Some(kind) => {
            let (key, _) = ctx.derive_key(password, kind.key_len(), kind.iv_len());
            let mut iv = vec![0u8; kind.iv_len()];
            rand::thread_rng().fill_bytes(&mut iv);
            let mut cipher = new_encrypt_cipher(kind, &key, &iv)?;
            let mut out = BytesMut::with_capacity(iv.len() + data.len());
            out.extend_from_slice(&iv);
            out.extend_from_slice(data);
            cipher.process(&mut out[kind.iv_len()..]);
            Ok(out.freeze())
        }
    }
}

/// One-shot decryption for datagrams: strips the leading IV and decrypts
/// the remainder in one pass.
pub fn decrypt_all(
    ctx: &CryptoContext,
    password: &str,
    method: Option<CipherKind>,
    data: &[u8],
) -> Result<Bytes> {
    match method {
        None => Ok(ctx.substitution_table(password).decrypt(data)),
        Some(kind) => {
            let iv_len = kind.iv_len();
            if data.len() < iv_len {
                return Err(Error::Protocol("datagram shorter than cipher iv".into()));
            }
            let (key, _) = ctx.derive_key(password, kind.key_len(), kind.iv_len());
            let mut cipher = new_decrypt_cipher(kind, &key, &data[..iv_len])?;
            let mut out = BytesMut::with_capacity(data.len() - iv_len);
            out.extend_from_slice(&data[iv_len..]);
            cipher.process(&mut out);
            Ok(out.freeze())
        }
    }
}

// rc4-md5 runs plain rc4 keyed by md5(key ++ iv); everything else feeds
// key and iv to the cipher directly.
fn new_encrypt_cipher(kind: CipherKind, key: &[u8], iv: &[u8]) -> Result<EncryptCipher> {
    let res = match kind {
        CipherKind::Rc4Md5 => EncryptCipher::new(kind, &md5!(key, iv), b""),
        _ => EncryptCipher::new(kind, key, iv),
    };
    res.map_err(|_| Error::Cipher(format!("bad key/iv length for {}", kind)))
}

fn new_decrypt_cipher(kind: CipherKind, key: &[u8], iv: &[u8]) -> Result<DecryptCipher> {
    let res = match kind {
        CipherKind::Rc4Md5 => DecryptCipher::new(kind, &md5!(key, iv), b""),
        _ => DecryptCipher::new(kind, key, iv),
    };
    res.map_err(|_| Error::Cipher(format!("bad key/iv length for {}", kind)))
}

#[cfg(test)]
mod tests {
    use super::*;

    // derive_key caches by password alone, so every method gets its own
    // password here, exactly as one process only ever uses one method.
    fn password_for(kind: CipherKind) -> String {
        format!("pw/{}", kind)
    }

    #[test]
    fn test_streaming_round_trip_every_method() {
        let ctx = CryptoContext::default();
        for &kind in CipherKind::ALL {
            let password = password_for(kind);
            let mut enc = Encryptor::new(&ctx, &password, Some(kind)).unwrap();
            let mut dec = Encryptor::new(&ctx, &password, Some(kind)).unwrap();

            let c1 = enc.encrypt(b"hello ");
            let c2 = enc.encrypt(b"across two chunks");
            assert_eq!(c1.len(), kind.iv_len() + 6, "{}", kind);
            assert_eq!(c2.len(), 17, "iv must appear only once for {}", kind);

            let p1 = dec.decrypt(&c1).unwrap();
            let p2 = dec.decrypt(&c2).unwrap();
            assert_eq!(&p1[..], b"hello ", "{}", kind);
            assert_eq!(&p2[..], b"across two chunks", "{}", kind);
        }
    }

    #[test]
    fn test_one_shot_round_trip_every_method() {
        let ctx = CryptoContext::default();
        for &kind in CipherKind::ALL {
            let password = password_for(kind);
            let data = b"one datagram worth of payload";
            let wire = encrypt_all(&ctx, &password, Some(kind), data).unwrap();
            assert_eq!(wire.len(), kind.iv_len() + data.len());
            let plain = decrypt_all(&ctx, &password, Some(kind), &wire).unwrap();
            assert_eq!(&plain[..], &data[..], "{}", kind);
        }
    }

    #[test]
    fn test_streaming_output_decrypts_as_one_shot() {
        // TCP framing of the first chunk and UDP framing agree: iv then
        // ciphertext from the same starting state.
        let ctx = CryptoContext::default();
        let kind = CipherKind::Aes256Cfb;
        let mut enc = Encryptor::new(&ctx, "compat", Some(kind)).unwrap();
        let wire = enc.encrypt(b"single chunk");
        let plain = decrypt_all(&ctx, "compat", Some(kind), &wire).unwrap();
        assert_eq!(&plain[..], b"single chunk");
    }

    #[test]
    fn test_zero_length_plaintext() {
        let ctx = CryptoContext::default();
        let kind = CipherKind::Aes128Cfb;
        let mut enc = Encryptor::new(&ctx, "empty", Some(kind)).unwrap();
        let mut dec = Encryptor::new(&ctx, "empty", Some(kind)).unwrap();
        let c = enc.encrypt(b"");
        assert_eq!(c.len(), kind.iv_len());
        let p = dec.decrypt(&c).unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn test_rc4_has_no_iv_prefix() {
        let ctx = CryptoContext::default();
        let mut enc = Encryptor::new(&ctx, "rc4pw", Some(CipherKind::Rc4)).unwrap();
        let c = enc.encrypt(b"abcdef");
        assert_eq!(c.len(), 6);
        let mut dec = Encryptor::new(&ctx, "rc4pw", Some(CipherKind::Rc4)).unwrap();
        assert_eq!(&dec.decrypt(&c).unwrap()[..], b"abcdef");
    }

    #[test]
    fn test_table_mode_round_trip() {
        let ctx = CryptoContext::default();
        let mut enc = Encryptor::new(&ctx, "tablepw", None).unwrap();
        let mut dec = Encryptor::new(&ctx, "tablepw", None).unwrap();
        let c = enc.encrypt(b"legacy bytes");
        assert_eq!(c.len(), 12);
        assert_eq!(&dec.decrypt(&c).unwrap()[..], b"legacy bytes");
    }

    #[test]
    fn test_short_first_chunk_is_a_protocol_error() {
        let ctx = CryptoContext::default();
        let mut dec = Encryptor::new(&ctx, "shorty", Some(CipherKind::Aes128Cfb)).unwrap();
        match dec.decrypt(&[0u8; 7]) {
            Err(Error::Protocol(_)) => {}
            other => panic!("expected protocol error, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn test_unknown_method_name() {
        match CipherKind::from_name("rot13-ultra") {
            Err(Error::UnsupportedCipherMethod(name)) => assert_eq!(name, "rot13-ultra"),
            other => panic!("expected unsupported method, got {:?}", other),
        }
        assert!(resolve_method(Some("TABLE")).unwrap().is_none());
        assert!(resolve_method(None).unwrap().is_none());
        assert_eq!(
            resolve_method(Some("AES-128-CFB")).unwrap(),
            Some(CipherKind::Aes128Cfb)
        );
    }
}
