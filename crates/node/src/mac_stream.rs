//! Keyed-hash framing for block payloads.
//!
//! The framed stream is the plaintext followed by a 64 byte HMAC-SHA-512 trailer. The MAC
//! is keyed per stream by a context, the block id, absorbed ahead of the body, so a valid
//! frame only opens under the id it was sealed for. The writer hashes bytes as they pass through and appends the trailer on [`MacWriter::finish`].
//! The reader holds back the last 64 bytes it has seen, so everything it hands out is body,
//! and checks the trailer once the inner reader is exhausted. Behaviour does not depend on
//! how callers size their reads or writes.

use crate::error::{BackupError, Result};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha512};
use std::fmt;
use std::io::{self, Read, Write};

type HmacSha512 = Hmac<Sha512>;

pub const TAG_LEN: usize = 64;
const READ_CHUNK: usize = 8 * 1024;
const KEY_DOMAIN: &[u8] = b"peerbackup/block-mac/v1";

#[derive(Clone)]
pub struct MacKey {
    proto: HmacSha512,
}

impl MacKey {
    pub fn from_bytes(key: &[u8]) -> Result<Self> {
        let proto = <HmacSha512 as Mac>::new_from_slice(key)
            .map_err(|e| BackupError::Crypto(e.to_string()))?;
        Ok(Self { proto })
    }

    /// Derives the block MAC key from long-lived secret material, typically the encoded
    /// node identity keypair.
    pub fn derive(secret: &[u8]) -> Result<Self> {
        let mut hasher = Sha512::new();
        hasher.update(KEY_DOMAIN);
        hasher.update(secret);
        Self::from_bytes(&hasher.finalize())
    }

    fn mac(&self, context: &[u8]) -> HmacSha512 {
        let mut mac = self.proto.clone();
        mac.update(&(context.len() as u64).to_be_bytes());
        mac.update(context);
        mac
    }
}

impl fmt::Debug for MacKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MacKey(..)")
    }
}

pub struct MacWriter<W: Write> {
    inner: W,
    mac: HmacSha512,
}

impl<W: Write> MacWriter<W> {
    pub fn new(inner: W, key: &MacKey, context: &[u8]) -> Self {
        Self {
            inner,
            mac: key.mac(context),
        }
    }

    /// Appends the trailer and hands back the inner writer.
    pub fn finish(self) -> io::Result<W> {
        let Self { mut inner, mac } = self;
        inner.write_all(&mac.finalize().into_bytes())?;
        inner.flush()?;
        Ok(inner)
    }
}

impl<W: Write> Write for MacWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.mac.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub struct MacReader<R: Read> {
    inner: R,
    mac: HmacSha512,
    held: Vec<u8>,
    pos: usize,
    eof: bool,
    verified: bool,
}

impl<R: Read> MacReader<R> {
    pub fn new(inner: R, key: &MacKey, context: &[u8]) -> Self {
        Self {
            inner,
            mac: key.mac(context),
            held: Vec::with_capacity(READ_CHUNK + TAG_LEN),
            pos: 0,
            eof: false,
            verified: false,
        }
    }

    /// True once the whole body has been read and the trailer matched.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    fn live(&self) -> usize {
        self.held.len() - self.pos
    }

    fn verify_trailer(&mut self) -> io::Result<()> {
        if self.verified {
            return Ok(());
        }
        if self.live() != TAG_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "stream shorter than MAC trailer",
            ));
        }
        self.mac
            .clone()
            .verify_slice(&self.held[self.pos..])
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "MAC mismatch"))?;
        self.verified = true;
        Ok(())
    }

    fn fill(&mut self) -> io::Result<()> {
        if self.pos > 0 {
            self.held.drain(..self.pos);
            self.pos = 0;
        }
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.held.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<R: Read> Read for MacReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.live() > TAG_LEN {
                let n = buf.len().min(self.live() - TAG_LEN);
                let body = &self.held[self.pos..self.pos + n];
                buf[..n].copy_from_slice(body);
                self.mac.update(body);
                self.pos += n;
                return Ok(n);
            }
            if self.eof {
                self.verify_trailer()?;
                return Ok(0);
            }
            self.fill()?;
        }
    }
}

/// Frames `body` with a trailer bound to `block_id`.
pub fn seal(key: &MacKey, block_id: &str, body: &[u8]) -> Result<Vec<u8>> {
    let mut writer = MacWriter::new(
        Vec::with_capacity(body.len() + TAG_LEN),
        key,
        block_id.as_bytes(),
    );
    writer.write_all(body)?;
    Ok(writer.finish()?)
}

/// Checks the trailer of `framed` against `block_id` and returns the body.
pub fn open(key: &MacKey, block_id: &str, framed: &[u8]) -> Result<Vec<u8>> {
    let mut reader = MacReader::new(framed, key, block_id.as_bytes());
    let mut body = Vec::with_capacity(framed.len().saturating_sub(TAG_LEN));
    match reader.read_to_end(&mut body) {
        Ok(_) => Ok(body),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => Err(BackupError::MacMismatch),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "C1";

    fn key() -> MacKey {
        MacKey::derive(b"test identity").unwrap()
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn bulk_write_then_bulk_read() {
        let body = sample(100_000);
        let framed = seal(&key(), ID, &body).unwrap();
        assert_eq!(framed.len(), body.len() + TAG_LEN);
        assert_eq!(open(&key(), ID, &framed).unwrap(), body);
    }

    #[test]
    fn empty_body_still_carries_trailer() {
        let framed = seal(&key(), ID, &[]).unwrap();
        assert_eq!(framed.len(), TAG_LEN);
        assert!(open(&key(), ID, &framed).unwrap().is_empty());
    }

    #[test]
    fn single_byte_writes_match_bulk_write() {
        let body = sample(777);
        let mut writer = MacWriter::new(Vec::new(), &key(), ID.as_bytes());
        for b in &body {
            writer.write_all(&[*b]).unwrap();
        }
        let framed = writer.finish().unwrap();
        assert_eq!(framed, seal(&key(), ID, &body).unwrap());
    }

    #[test]
    fn single_byte_reads_verify() {
        let body = sample(20_000);
        let framed = seal(&key(), ID, &body).unwrap();
        let mut reader = MacReader::new(framed.as_slice(), &key(), ID.as_bytes());
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = reader.read(&mut byte).unwrap();
            if n == 0 {
                break;
            }
            assert!(!reader.is_verified());
            out.push(byte[0]);
        }
        assert!(reader.is_verified());
        assert_eq!(out, body);
    }

    #[test]
    fn any_bit_flip_in_body_fails() {
        let body = sample(96);
        let framed = seal(&key(), ID, &body).unwrap();
        for pos in 0..body.len() {
            for bit in [0u8, 3, 7] {
                let mut tampered = framed.clone();
                tampered[pos] ^= 1 << bit;
                assert!(
                    matches!(open(&key(), ID, &tampered), Err(BackupError::MacMismatch)),
                    "flip at {pos}/{bit} went unnoticed"
                );
            }
        }
    }

    #[test]
    fn truncated_stream_fails() {
        let framed = seal(&key(), ID, b"abc").unwrap();
        assert!(open(&key(), ID, &framed[..framed.len() - 1]).is_err());
        assert!(open(&key(), ID, &framed[..10]).is_err());
    }

    #[test]
    fn other_key_fails() {
        let framed = seal(&key(), ID, b"payload").unwrap();
        let other = MacKey::derive(b"someone else").unwrap();
        assert!(matches!(open(&other, ID, &framed), Err(BackupError::MacMismatch)));
    }

    #[test]
    fn frame_only_opens_under_its_block_id() {
        let framed = seal(&key(), "C1", b"first half").unwrap();
        assert!(matches!(open(&key(), "C2", &framed), Err(BackupError::MacMismatch)));
        assert_eq!(open(&key(), "C1", &framed).unwrap(), b"first half");
    }

    #[test]
    fn context_length_is_part_of_the_mac() {
        let framed = seal(&key(), "ab", b"cdef").unwrap();
        assert!(open(&key(), "abc", &framed).is_err());
    }
}
