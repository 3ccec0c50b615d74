use crate::md5;
use bytes::{Bytes, BytesMut};

/// Password-derived byte-substitution permutation and its inverse.
///
/// Derivation: take the md5 digest of the password, read the low eight
/// bytes as two little-endian u32 halves `al`/`ah`, then stably resort
/// the identity table 1023 times with the keying function
/// `((ah % (x + round)) << 32 | al) % (x + round)`. The sort must be
/// stable so the result is reproducible against other implementations
/// of the same derivation.
pub struct SubstitutionTable {
    encrypt: [u8; 256],
    decrypt: [u8; 256],
}

impl SubstitutionTable {
    pub fn derive(password: &[u8]) -> SubstitutionTable {
        let digest = md5!(password);
        let al = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as u64;
        let ah = u32::from_le_bytes([digest[4], digest[5], digest[6], digest[7]]) as u64;

        let mut table: Vec<u64> = (0..256).collect();
        for round in 1..1024u64 {
            // (ah % m) * 2^32 + al stays well below 2^63, no overflow.
            table.sort_by_key(|&x| {
                let m = x + round;
                ((ah % m) * 0x1_0000_0000 + al) % m
            });
        }

        let mut encrypt = [0u8; 256];
        for (i, &v) in table.iter().enumerate() {
            encrypt[i] = v as u8;
        }
        let mut decrypt = [0u8; 256];
        for (i, &v) in encrypt.iter().enumerate() {
            decrypt[v as usize] = i as u8;
        }
        SubstitutionTable { encrypt, decrypt }
    }

    pub fn encrypt(&self, data: &[u8]) -> Bytes {
        substitute(&self.encrypt, data)
    }

    pub fn decrypt(&self, data: &[u8]) -> Bytes {
        substitute(&self.decrypt, data)
    }

    pub fn decrypt_in_place(&self, data: &mut [u8]) {
        for b in data.iter_mut() {
            *b = self.decrypt[*b as usize];
        }
    }
}

fn substitute(table: &[u8; 256], data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len());
    out.extend(data.iter().map(|&b| table[b as usize]));
    out.freeze()
}
