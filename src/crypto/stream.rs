//! Stream-cipher construction and dispatch.
//!
//! CFB methods keep independent encrypt/decrypt halves because the CFB
//! feedback register differs by direction; rc4 variants are a plain
//! keystream applied the same way both ways.

use aes::{Aes128, Aes192, Aes256};
use blowfish::Blowfish;
use camellia::{Camellia128, Camellia192, Camellia256};
use cast5::Cast5;
use cfb_mode::{BufDecryptor, BufEncryptor};
use cipher::{InvalidLength, KeyInit, KeyIvInit, StreamCipher};
use des::Des;
use idea::Idea;
use rc2::Rc2;
use rc4::{consts::U16, Rc4};

use crate::crypto::CipherKind;

macro_rules! define_stream_ciphers {
    ($(($kind:ident, $cipher:ty)),+ $(,)?) => {
        pub enum EncryptCipher {
            $($kind(Box<BufEncryptor<$cipher>>),)+
            Rc4(Box<Rc4<U16>>),
        }

        pub enum DecryptCipher {
            $($kind(Box<BufDecryptor<$cipher>>),)+
            Rc4(Box<Rc4<U16>>),
        }

        impl EncryptCipher {
            pub fn new(kind: CipherKind, key: &[u8], iv: &[u8]) -> Result<EncryptCipher, InvalidLength> {
                Ok(match kind {
                    $(CipherKind::$kind => EncryptCipher::$kind(Box::new(
                        BufEncryptor::<$cipher>::new_from_slices(key, iv)?,
                    )),)+
                    CipherKind::Rc4 | CipherKind::Rc4Md5 => {
                        EncryptCipher::Rc4(Box::new(Rc4::new_from_slice(key)?))
                    }
                })
            }

            pub fn process(&mut self, data: &mut [u8]) {
                match self {
                    $(EncryptCipher::$kind(c) => c.encrypt(data),)+
                    EncryptCipher::Rc4(c) => c.apply_keystream(data),
                }
            }
        }

        impl DecryptCipher {
            pub fn new(kind: CipherKind, key: &[u8], iv: &[u8]) -> Result<DecryptCipher, InvalidLength> {
                Ok(match kind {
                    $(CipherKind::$kind => DecryptCipher::$kind(Box::new(
                        BufDecryptor::<$cipher>::new_from_slices(key, iv)?,
                    )),)+
                    CipherKind::Rc4 | CipherKind::Rc4Md5 => {
                        DecryptCipher::Rc4(Box::new(Rc4::new_from_slice(key)?))
                    }
                })
            }

            pub fn process(&mut self, data: &mut [u8]) {
                match self {
                    $(DecryptCipher::$kind(c) => c.decrypt(data),)+
                    DecryptCipher::Rc4(c) => c.apply_keystream(data),
                }
            }
        }
    };
}

define_stream_ciphers!(
    (Aes128Cfb, Aes128),
    (Aes192Cfb, Aes192),
    (Aes256Cfb, Aes256),
    (BfCfb, Blowfish),
    (Camellia128Cfb, Camellia128),
    (Camellia192Cfb, Camellia192),
    (Camellia256Cfb, Camellia256),
    (Cast5Cfb, Cast5),
    (DesCfb, Des),
    (IdeaCfb, Idea),
    (Rc2Cfb, Rc2),
);
