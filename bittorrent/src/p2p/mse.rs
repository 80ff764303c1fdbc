use std::{io, pin::Pin, task::{Context, Poll}};
use num_bigint::BigUint;
use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
};

/// RFC 2409 Oakley Group 1, the 768-bit safe prime MSE's Diffie-Hellman key
/// exchange is defined over, generator 2.
const PRIME_HEX: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF";
const GENERATOR: u64 = 2;
const PRIVATE_KEY_BYTES: usize = 20;
pub(crate) const KEY_LEN: usize = 96;

fn prime() -> BigUint {
    BigUint::parse_bytes(PRIME_HEX.as_bytes(), 16).expect("hardcoded prime is valid hex")
}

/// One side of an MSE Diffie-Hellman exchange: a random private exponent
/// and the public key it produces.
pub struct DhKeyPair {
    private: BigUint,
    pub public: [u8; KEY_LEN],
}

impl DhKeyPair {
    pub fn generate() -> Self {
        let mut priv_bytes = [0u8; PRIVATE_KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut priv_bytes);
        let private = BigUint::from_bytes_be(&priv_bytes);
        let public_num = BigUint::from(GENERATOR).modpow(&private, &prime());

        let mut public = [0u8; KEY_LEN];
        let bytes = public_num.to_bytes_be();
        public[KEY_LEN - bytes.len()..].copy_from_slice(&bytes);

        Self { private, public }
    }

    /// Combines our private exponent with the peer's public key to produce
    /// the shared secret `S`, left-padded to `KEY_LEN` bytes.
    pub fn shared_secret(&self, peer_public: &[u8]) -> [u8; KEY_LEN] {
        let peer_pub = BigUint::from_bytes_be(peer_public);
        let secret = peer_pub.modpow(&self.private, &prime());

        let mut out = [0u8; KEY_LEN];
        let bytes = secret.to_bytes_be();
        out[KEY_LEN - bytes.len()..].copy_from_slice(&bytes);
        out
    }
}

/// RC4 keystream cipher. MSE derives keyA/keyB by hashing the shared secret
/// with a direction label and the torrent's info-hash, then discards the
/// first 1024 bytes of keystream before using it to (de/en)crypt traffic.
#[derive(Clone)]
pub struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Self {
        debug_assert!(!key.is_empty());
        let mut s = [0u8; 256];
        for (idx, slot) in s.iter_mut().enumerate() {
            *slot = idx as u8;
        }
        let mut j = 0u8;
        for i in 0..256 {
            j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }

        let mut rc4 = Self { s, i: 0, j: 0 };
        let mut discard = [0u8; 1024];
        rc4.apply(&mut discard);
        rc4
    }

    /// XORs `data` in place with the next `data.len()` keystream bytes.
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s[(self.s[self.i as usize].wrapping_add(self.s[self.j as usize])) as usize];
            *byte ^= k;
        }
    }
}

/// Derives the RC4 key for one direction of an MSE stream:
/// `SHA1(label || S || SKEY)`, where `label` is `b"keyA"` or `b"keyB"`.
pub fn derive_rc4_key(label: &[u8], shared_secret: &[u8], info_hash: &[u8; 20]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(label);
    hasher.update(shared_secret);
    hasher.update(info_hash);
    hasher.finalize().into()
}

#[derive(thiserror::Error, Debug)]
pub enum MseError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("peer sent a public key of the wrong length")]
    InvalidPublicKey,
}

/// Either side of a peer connection: plaintext, or MSE RC4 obfuscation with
/// independent read/write keystreams. Read and write each advance their own
/// cipher's keystream position, so the two directions never interfere.
pub enum Transport {
    Plaintext(TcpStream),
    Encrypted {
        stream: TcpStream,
        read_cipher: Rc4,
        write_cipher: Rc4,
    },
}

impl Transport {
    fn stream_mut(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plaintext(stream) => stream,
            Transport::Encrypted { stream, .. } => stream,
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = Pin::get_mut(self);
        match this {
            Transport::Plaintext(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Encrypted { stream, read_cipher, .. } => {
                let filled_before = buf.filled().len();
                match Pin::new(stream).poll_read(cx, buf) {
                    Poll::Ready(Ok(())) => {
                        read_cipher.apply(&mut buf.filled_mut()[filled_before..]);
                        Poll::Ready(Ok(()))
                    }
                    other => other,
                }
            }
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = Pin::get_mut(self);
        match this {
            Transport::Plaintext(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Encrypted { stream, write_cipher, .. } => {
                // RC4 keystream position can't be rewound cheaply, so
                // checkpoint it before encrypting the whole buffer: if the
                // underlying write is short (or pending/erroring), restore
                // the checkpoint and re-encrypt only the prefix that was
                // actually written, keeping the keystream aligned with the
                // bytes that really went over the wire.
                let checkpoint = write_cipher.clone();
                let mut encrypted = buf.to_vec();
                write_cipher.apply(&mut encrypted);
                match Pin::new(stream).poll_write(cx, &encrypted) {
                    Poll::Ready(Ok(n)) if n == buf.len() => Poll::Ready(Ok(n)),
                    Poll::Ready(Ok(n)) => {
                        *write_cipher = checkpoint;
                        write_cipher.apply(&mut encrypted[..n]);
                        Poll::Ready(Ok(n))
                    }
                    Poll::Ready(Err(e)) => {
                        *write_cipher = checkpoint;
                        Poll::Ready(Err(e))
                    }
                    Poll::Pending => {
                        *write_cipher = checkpoint;
                        Poll::Pending
                    }
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(Pin::get_mut(self).stream_mut()).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(Pin::get_mut(self).stream_mut()).poll_shutdown(cx)
    }
}

/// Performs the DH exchange as the connecting side and returns the
/// resulting transport. Our `keyA` becomes the write keystream, the peer's
/// `keyB` becomes the read keystream.
pub async fn negotiate_outbound(mut stream: TcpStream, info_hash: &[u8; 20]) -> Result<Transport, MseError> {
    let keypair = DhKeyPair::generate();
    stream.write_all(&keypair.public).await?;
    let mut peer_public = [0u8; KEY_LEN];
    stream.read_exact(&mut peer_public).await?;

    let secret = keypair.shared_secret(&peer_public);
    let write_cipher = Rc4::new(&derive_rc4_key(b"keyA", &secret, info_hash));
    let read_cipher = Rc4::new(&derive_rc4_key(b"keyB", &secret, info_hash));

    Ok(Transport::Encrypted { stream, read_cipher, write_cipher })
}

/// Performs the DH exchange as the accepting side. Our `keyB` becomes the
/// write keystream, the peer's `keyA` becomes the read keystream.
pub async fn negotiate_inbound(mut stream: TcpStream, info_hash: &[u8; 20]) -> Result<Transport, MseError> {
    let mut peer_public = [0u8; KEY_LEN];
    stream.read_exact(&mut peer_public).await?;
    let keypair = DhKeyPair::generate();
    stream.write_all(&keypair.public).await?;

    let secret = keypair.shared_secret(&peer_public);
    let write_cipher = Rc4::new(&derive_rc4_key(b"keyB", &secret, info_hash));
    let read_cipher = Rc4::new(&derive_rc4_key(b"keyA", &secret, info_hash));

    Ok(Transport::Encrypted { stream, read_cipher, write_cipher })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_exchange_produces_matching_shared_secret() {
        let a = DhKeyPair::generate();
        let b = DhKeyPair::generate();
        let secret_a = a.shared_secret(&b.public);
        let secret_b = b.shared_secret(&a.public);
        assert_eq!(secret_a, secret_b);
    }

    #[test]
    fn rc4_round_trips() {
        let key = [0x1, 0x2, 0x3, 0x4, 0x5];
        let mut enc = Rc4::new(&key);
        let mut dec = Rc4::new(&key);
        let mut data = b"hello bittorrent".to_vec();
        let original = data.clone();
        enc.apply(&mut data);
        assert_ne!(data, original);
        dec.apply(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn derived_keys_differ_by_label() {
        let secret = [0u8; KEY_LEN];
        let info_hash = [0u8; 20];
        let key_a = derive_rc4_key(b"keyA", &secret, &info_hash);
        let key_b = derive_rc4_key(b"keyB", &secret, &info_hash);
        assert_ne!(key_a, key_b);
    }

    #[tokio::test]
    async fn negotiated_transports_exchange_plaintext() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [7u8; 20];

        let accept_info_hash = info_hash;
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            negotiate_inbound(stream, &accept_info_hash).await.unwrap()
        });
        let connect = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            negotiate_outbound(stream, &info_hash).await.unwrap()
        });

        let mut initiator = connect.await.unwrap();
        let mut responder = accept.await.unwrap();

        initiator.write_all(b"hello responder").await.unwrap();
        initiator.flush().await.unwrap();
        let mut buf = [0u8; 15];
        responder.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello responder");

        responder.write_all(b"hello initiator").await.unwrap();
        responder.flush().await.unwrap();
        let mut buf = [0u8; 15];
        initiator.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello initiator");
    }
}
