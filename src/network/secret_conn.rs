//! Authenticated encrypted connections
//!
//! Upgrades any duplex byte stream into a stream of sealed frames. Both ends
//! exchange ephemeral X25519 keys, derive a shared secret and a pair of
//! direction-specific nonces, then prove ownership of their long-term node
//! keys by signing a challenge bound to both ephemeral keys.
//!
//! Every frame carries 1026 plaintext bytes (a big-endian u16 length followed
//! by up to 1024 payload bytes) sealed with XSalsa20-Poly1305.

use crate::crypto::{ripemd160, sha256_concat, NodeKey, PubKey, SIGNATURE_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use futures::{SinkExt, StreamExt};
use rand::rngs::OsRng;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tokio_util::io::{CopyToBytes, SinkWriter, StreamReader};
use x25519_dalek::{EphemeralSecret, PublicKey as EphemeralPublic};

/// Length prefix inside each frame
pub const DATA_LEN_SIZE: usize = 2;

/// Maximum payload bytes carried by one frame
pub const DATA_MAX_SIZE: usize = 1024;

/// Plaintext size of every frame
pub const TOTAL_FRAME_SIZE: usize = DATA_MAX_SIZE + DATA_LEN_SIZE;

/// Poly1305 tag added by sealing
pub const SEAL_OVERHEAD: usize = 16;

/// Size of a sealed frame on the wire
pub const SEALED_FRAME_SIZE: usize = TOTAL_FRAME_SIZE + SEAL_OVERHEAD;

const NONCE_SIZE: usize = 24;
const EPH_KEY_SIZE: usize = 32;

/// Auth message body: long-term public key and challenge signature
const AUTH_SIG_BODY_SIZE: usize = 32 + SIGNATURE_LEN;

/// Auth message on the wire: u32 body length followed by the body
const AUTH_SIG_MSG_SIZE: usize = 4 + AUTH_SIG_BODY_SIZE;

/// Secret connection errors
#[derive(Error, Debug)]
pub enum SecretConnError {
    #[error("challenge verification failed")]
    HandshakeVerification,
    #[error("failed to decrypt frame")]
    FrameDecrypt,
    #[error("frame length {0} exceeds maximum")]
    FrameTooLarge(usize),
    #[error("unexpected EOF")]
    UnexpectedEof,
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl From<SecretConnError> for io::Error {
    fn from(err: SecretConnError) -> Self {
        match err {
            SecretConnError::IoError(e) => e,
            SecretConnError::UnexpectedEof => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Boxed read half of an upgraded (or plain) peer stream
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of an upgraded (or plain) peer stream
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// =============================================================================
// Nonces
// =============================================================================

/// Increment a 24-byte big-endian nonce by one, wrapping around
fn incr_nonce(nonce: &mut [u8; NONCE_SIZE]) {
    for byte in nonce.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            return;
        }
    }
}

/// Increment by two so the two directions never share a nonce
fn incr2_nonce(nonce: &mut [u8; NONCE_SIZE]) {
    incr_nonce(nonce);
    incr_nonce(nonce);
}

/// Order the ephemeral keys and derive the (recv, send) nonces
fn derive_nonces(
    loc_eph_pub: &[u8; EPH_KEY_SIZE],
    rem_eph_pub: &[u8; EPH_KEY_SIZE],
) -> ([u8; NONCE_SIZE], [u8; NONCE_SIZE], [u8; 32]) {
    let loc_is_least = loc_eph_pub < rem_eph_pub;
    let (lo, hi) = if loc_is_least {
        (loc_eph_pub, rem_eph_pub)
    } else {
        (rem_eph_pub, loc_eph_pub)
    };

    let mut lo_hi = [0u8; EPH_KEY_SIZE * 2];
    lo_hi[..EPH_KEY_SIZE].copy_from_slice(lo);
    lo_hi[EPH_KEY_SIZE..].copy_from_slice(hi);

    let mut nonce1 = [0u8; NONCE_SIZE];
    nonce1[..20].copy_from_slice(&ripemd160(&lo_hi));
    let mut nonce2 = nonce1;
    nonce2[NONCE_SIZE - 1] ^= 0x01;

    let challenge = sha256_concat(&[lo, hi]);
    if loc_is_least {
        (nonce1, nonce2, challenge)
    } else {
        (nonce2, nonce1, challenge)
    }
}

// =============================================================================
// Frame codec
// =============================================================================

/// Seals outgoing or opens incoming frames for one direction
pub struct FrameCodec {
    cipher: XSalsa20Poly1305,
    nonce: [u8; NONCE_SIZE],
}

impl FrameCodec {
    fn new(shared_secret: &[u8; 32], nonce: [u8; NONCE_SIZE]) -> Self {
        Self {
            cipher: XSalsa20Poly1305::new(Key::from_slice(shared_secret)),
            nonce,
        }
    }

    fn seal_frame(&mut self, chunk: &[u8], dst: &mut BytesMut) -> Result<(), SecretConnError> {
        let mut frame = [0u8; TOTAL_FRAME_SIZE];
        frame[..DATA_LEN_SIZE].copy_from_slice(&(chunk.len() as u16).to_be_bytes());
        frame[DATA_LEN_SIZE..DATA_LEN_SIZE + chunk.len()].copy_from_slice(chunk);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&self.nonce), frame.as_ref())
            .map_err(|_| SecretConnError::FrameDecrypt)?;
        incr2_nonce(&mut self.nonce);
        dst.put_slice(&sealed);
        Ok(())
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = SecretConnError;

    /// Split `item` into as many frames as needed
    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len().div_ceil(DATA_MAX_SIZE) * SEALED_FRAME_SIZE);
        for chunk in item.chunks(DATA_MAX_SIZE) {
            self.seal_frame(chunk, dst)?;
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = SecretConnError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < SEALED_FRAME_SIZE {
            src.reserve(SEALED_FRAME_SIZE - src.len());
            return Ok(None);
        }

        let sealed = src.split_to(SEALED_FRAME_SIZE);
        let frame = self
            .cipher
            .decrypt(Nonce::from_slice(&self.nonce), sealed.as_ref())
            .map_err(|_| SecretConnError::FrameDecrypt)?;
        incr2_nonce(&mut self.nonce);

        let len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        if len > DATA_MAX_SIZE {
            return Err(SecretConnError::FrameTooLarge(len));
        }
        Ok(Some(Bytes::copy_from_slice(&frame[DATA_LEN_SIZE..DATA_LEN_SIZE + len])))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(SecretConnError::UnexpectedEof),
        }
    }
}

// =============================================================================
// Secret connection
// =============================================================================

/// An authenticated, encrypted connection over `S`
pub struct SecretConnection<S> {
    reader: FramedRead<ReadHalf<S>, FrameCodec>,
    writer: FramedWrite<WriteHalf<S>, FrameCodec>,
    remote_pub_key: PubKey,
}

impl<S> SecretConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Run the handshake over `stream` and return the upgraded connection
    pub async fn make(stream: S, local_key: &NodeKey) -> Result<Self, SecretConnError> {
        let (mut rd, mut wr) = tokio::io::split(stream);

        let loc_eph_priv = EphemeralSecret::random_from_rng(OsRng);
        let loc_eph_pub = EphemeralPublic::from(&loc_eph_priv).to_bytes();
        let rem_eph_pub = share_eph_pub_key(&mut rd, &mut wr, &loc_eph_pub).await?;

        let shared = loc_eph_priv.diffie_hellman(&EphemeralPublic::from(rem_eph_pub));
        if !shared.was_contributory() {
            return Err(SecretConnError::HandshakeVerification);
        }

        let (recv_nonce, send_nonce, challenge) = derive_nonces(&loc_eph_pub, &rem_eph_pub);
        let mut reader = FramedRead::new(rd, FrameCodec::new(shared.as_bytes(), recv_nonce));
        let mut writer = FramedWrite::new(wr, FrameCodec::new(shared.as_bytes(), send_nonce));

        let loc_sig = local_key.sign(&challenge);
        let (remote_pub_key, remote_sig) =
            share_auth_signature(&mut reader, &mut writer, &local_key.pub_key(), &loc_sig).await?;
        if !remote_pub_key.verify(&challenge, &remote_sig) {
            return Err(SecretConnError::HandshakeVerification);
        }

        log::trace!("Secret connection established with {}", remote_pub_key);
        Ok(Self {
            reader,
            writer,
            remote_pub_key,
        })
    }

    /// The long-term public key the remote end proved ownership of
    pub fn remote_pub_key(&self) -> PubKey {
        self.remote_pub_key
    }

    /// Send `data`, split over as many frames as needed
    pub async fn write(&mut self, data: &[u8]) -> Result<(), SecretConnError> {
        self.writer.send(Bytes::copy_from_slice(data)).await
    }

    /// Receive the payload of the next frame, `None` on clean EOF
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>, SecretConnError> {
        self.reader.next().await.transpose()
    }

    /// Split into plain byte-stream halves for the multiplexer
    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        let reader = StreamReader::new(self.reader);
        let writer = SinkWriter::new(CopyToBytes::new(self.writer));
        (Box::new(reader), Box::new(writer))
    }
}

/// Exchange ephemeral public keys; both directions must succeed
async fn share_eph_pub_key<S: AsyncRead + AsyncWrite>(
    rd: &mut ReadHalf<S>,
    wr: &mut WriteHalf<S>,
    loc_eph_pub: &[u8; EPH_KEY_SIZE],
) -> Result<[u8; EPH_KEY_SIZE], SecretConnError> {
    let mut rem_eph_pub = [0u8; EPH_KEY_SIZE];
    let write = async {
        wr.write_all(loc_eph_pub).await?;
        wr.flush().await
    };
    let read = rd.read_exact(&mut rem_eph_pub);
    let (write_res, read_res) = tokio::join!(write, read);
    write_res?;
    read_res.map_err(map_eof)?;
    Ok(rem_eph_pub)
}

/// Exchange long-term keys and challenge signatures over the sealed frames
async fn share_auth_signature<S: AsyncRead + AsyncWrite>(
    reader: &mut FramedRead<ReadHalf<S>, FrameCodec>,
    writer: &mut FramedWrite<WriteHalf<S>, FrameCodec>,
    pub_key: &PubKey,
    sig: &[u8; SIGNATURE_LEN],
) -> Result<(PubKey, [u8; SIGNATURE_LEN]), SecretConnError> {
    let mut msg = BytesMut::with_capacity(AUTH_SIG_MSG_SIZE);
    msg.put_u32(AUTH_SIG_BODY_SIZE as u32);
    msg.put_slice(pub_key.as_bytes());
    msg.put_slice(sig);

    let read = async {
        let mut buf = BytesMut::with_capacity(AUTH_SIG_MSG_SIZE);
        while buf.len() < AUTH_SIG_MSG_SIZE {
            match reader.next().await {
                Some(frame) => buf.extend_from_slice(&frame?),
                None => return Err(SecretConnError::UnexpectedEof),
            }
        }
        Ok(buf)
    };
    let (write_res, read_res) = tokio::join!(writer.send(msg.freeze()), read);
    write_res?;
    let mut buf = read_res?;

    if buf.len() != AUTH_SIG_MSG_SIZE || buf.get_u32() as usize != AUTH_SIG_BODY_SIZE {
        return Err(SecretConnError::HandshakeVerification);
    }
    let remote_pub = PubKey::from_slice(&buf[..32]).map_err(|_| SecretConnError::HandshakeVerification)?;
    let mut remote_sig = [0u8; SIGNATURE_LEN];
    remote_sig.copy_from_slice(&buf[32..]);
    Ok((remote_pub, remote_sig))
}

fn map_eof(err: io::Error) -> SecretConnError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        SecretConnError::UnexpectedEof
    } else {
        SecretConnError::IoError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    async fn make_pair() -> (SecretConnection<DuplexStream>, SecretConnection<DuplexStream>, NodeKey, NodeKey) {
        let (a, b) = duplex(64 * 1024);
        let key_a = NodeKey::generate();
        let key_b = NodeKey::generate();
        let (conn_a, conn_b) = tokio::join!(
            SecretConnection::make(a, &key_a),
            SecretConnection::make(b, &key_b)
        );
        (conn_a.unwrap(), conn_b.unwrap(), key_a, key_b)
    }

    #[test]
    fn test_nonce_increment_wraps() {
        let mut nonce = [0xffu8; NONCE_SIZE];
        nonce[0] = 0;
        incr_nonce(&mut nonce);
        assert_eq!(nonce[0], 1);
        assert!(nonce[1..].iter().all(|&b| b == 0));

        let mut all = [0xffu8; NONCE_SIZE];
        incr2_nonce(&mut all);
        assert_eq!(all[NONCE_SIZE - 1], 1);
        assert!(all[..NONCE_SIZE - 1].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_derived_nonces_mirror() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let (recv_a, send_a, challenge_a) = derive_nonces(&a, &b);
        let (recv_b, send_b, challenge_b) = derive_nonces(&b, &a);
        assert_eq!(recv_a, send_b);
        assert_eq!(send_a, recv_b);
        assert_ne!(recv_a, send_a);
        assert_eq!(challenge_a, challenge_b);
        assert_eq!(recv_a[NONCE_SIZE - 1] ^ send_a[NONCE_SIZE - 1], 0x01);
    }

    #[tokio::test]
    async fn test_handshake_binds_remote_key() {
        let (conn_a, conn_b, key_a, key_b) = make_pair().await;
        assert_eq!(conn_a.remote_pub_key(), key_b.pub_key());
        assert_eq!(conn_b.remote_pub_key(), key_a.pub_key());
    }

    #[tokio::test]
    async fn test_frame_boundaries() {
        let (mut conn_a, mut conn_b, _, _) = make_pair().await;

        conn_a.write(&[7u8; DATA_MAX_SIZE]).await.unwrap();
        let frame = conn_b.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.len(), DATA_MAX_SIZE);

        conn_a.write(&[9u8; DATA_MAX_SIZE + 1]).await.unwrap();
        let first = conn_b.read_frame().await.unwrap().unwrap();
        let second = conn_b.read_frame().await.unwrap().unwrap();
        assert_eq!(first.len(), DATA_MAX_SIZE);
        assert_eq!(second.as_ref(), &[9u8]);
    }

    #[tokio::test]
    async fn test_split_streams_roundtrip() {
        let (conn_a, conn_b, _, _) = make_pair().await;
        let (_, mut writer) = conn_a.into_split();
        let (mut reader, _) = conn_b.into_split();

        let payload: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        writer.write_all(&payload).await.unwrap();
        writer.flush().await.unwrap();

        let mut received = vec![0u8; payload.len()];
        reader.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_tampered_frame_is_rejected() {
        let (a, b) = duplex(64 * 1024);
        let key_a = NodeKey::generate();
        let key_b = NodeKey::generate();
        let (conn_a, conn_b) = tokio::join!(
            SecretConnection::make(a, &key_a),
            SecretConnection::make(b, &key_b)
        );
        let mut conn_a = conn_a.unwrap();
        let mut conn_b = conn_b.unwrap();

        // Desynchronise the receive nonce so the next frame cannot be opened
        incr2_nonce(&mut conn_b.reader.decoder_mut().nonce);
        conn_a.write(b"hello").await.unwrap();
        assert!(matches!(conn_b.read_frame().await, Err(SecretConnError::FrameDecrypt)));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_eof_error() {
        let (mut a, b) = duplex(64 * 1024);
        let key_b = NodeKey::generate();
        let handshake = tokio::spawn(async move { SecretConnection::make(b, &key_b).await });
        a.write_all(&[1u8; 10]).await.unwrap();
        drop(a);
        assert!(matches!(handshake.await.unwrap(), Err(SecretConnError::UnexpectedEof) | Err(SecretConnError::IoError(_))));
    }
}
