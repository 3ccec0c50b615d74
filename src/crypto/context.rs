use crate::crypto::table::SubstitutionTable;
use crate::md5;
use bytes::{Bytes, BytesMut};
use log::info;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Process-wide memoization for the expensive password-derived material.
///
/// This is deliberately an injected service rather than a global: every
/// component that needs a table or key receives a `SharedCryptoContext`,
/// and the internal mutexes make it safe to share across threads. The
/// caches never expire; the set of passwords in one process is small and
/// fixed.
#[derive(Default)]
pub struct CryptoContext {
    tables: Mutex<HashMap<Vec<u8>, Arc<SubstitutionTable>>>,
    keys: Mutex<HashMap<Vec<u8>, (Bytes, Bytes)>>,
}

pub type SharedCryptoContext = Arc<CryptoContext>;

impl CryptoContext {
    pub fn new_shared() -> SharedCryptoContext {
        Arc::new(CryptoContext::default())
    }

    pub fn substitution_table(&self, password: &str) -> Arc<SubstitutionTable> {
        let mut tables = self.tables.lock().unwrap();
        tables
            .entry(password.as_bytes().to_vec())
            .or_insert_with(|| {
                info!("calculating ciphers");
                Arc::new(SubstitutionTable::derive(password.as_bytes()))
            })
            .clone()
    }

    /// openssl-style EVP_BytesToKey over md5: chain 16-byte digests
    /// `d_0 = md5(password)`, `d_i = md5(d_{i-1} ++ password)` until
    /// `key_len + iv_len` bytes are available, then split.
    ///
    /// The cache is keyed by password alone, so every caller must request
    /// the same lengths for a given password; mixing methods with
    /// different key sizes under one password would return wrong-sized
    /// material.
    pub fn derive_key(&self, password: &str, key_len: usize, iv_len: usize) -> (Bytes, Bytes) {
        let mut keys = self.keys.lock().unwrap();
        if let Some((key, iv)) = keys.get(password.as_bytes()) {
            return (key.clone(), iv.clone());
        }
        let material = bytes_to_key(password.as_bytes(), key_len + iv_len);
        let key = material.slice(0..key_len);
        let iv = material.slice(key_len..key_len + iv_len);
        keys.insert(password.as_bytes().to_vec(), (key.clone(), iv.clone()));
        (key, iv)
    }
}

fn bytes_to_key(password: &[u8], total: usize) -> Bytes {
    let mut material = BytesMut::with_capacity(total + 16);
    let mut last: Option<[u8; 16]> = None;
    while material.len() < total {
        let digest = match last {
            None => md5!(password),
            Some(prev) => md5!(&prev[..], password),
        };
        material.extend_from_slice(&digest);
        last = Some(digest);
    }
    material.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_lengths_and_determinism() {
        let ctx = CryptoContext::default();
        let (key, iv) = ctx.derive_key("secret", 32, 16);
        assert_eq!(key.len(), 32);
        assert_eq!(iv.len(), 16);
        let (key2, iv2) = ctx.derive_key("secret", 32, 16);
        assert_eq!(key, key2);
        assert_eq!(iv, iv2);
    }

    #[test]
    fn test_derive_key_first_block_is_password_digest() {
        let ctx = CryptoContext::default();
        let (key, _) = ctx.derive_key("abc", 16, 16);
        assert_eq!(&key[..], &md5!(b"abc".as_ref())[..]);
    }

    #[test]
    fn test_table_cache_returns_same_instance() {
        let ctx = CryptoContext::default();
        let a = ctx.substitution_table("pw");
        let b = ctx.substitution_table("pw");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
