//! Block-cipher encryption filter.
//!
//! Wraps a stream and turns plaintext transport frames into ciphertext
//! blocks. The chaining scheme combines each plaintext block with the
//! PREVIOUS PLAINTEXT block before the cipher call:
//!
//! ```text
//! send:    X = P xor prev_sent;  C = E(X);  prev_sent = P
//! receive: X = D(C);  P = X xor prev_recv;  prev_recv = P
//! ```
//!
//! This differs from standard CBC, which chains off the previous
//! CIPHERTEXT block. The divergence is part of the wire format and must
//! not be "corrected"; independently written peers rely on it, and the
//! round-trip tests pin it down.
//!
//! Because the plaintext of the encrypted stream is itself a whole
//! transport frame (length header included), the receive side parses that
//! header out of the decrypted bytes to learn the true frame length, so
//! the zero padding added to fill the final cipher block can be dropped
//! before forwarding.

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::core::frame;
use crate::core::stream::{Stream, WriteMode};
use crate::error::{ProtocolError, Result};

/// Call contract for a block cipher.
///
/// The concrete algorithm and its key management live outside this crate;
/// anything operating on fixed-size blocks fits. Calls fail when the
/// cipher is unkeyed or the block length is wrong, and any failure is
/// connection-fatal for the channel above.
pub trait BlockCipher {
    /// Cipher block size in bytes. Must be stable for the connection's
    /// lifetime.
    fn block_size(&self) -> usize;

    /// Encrypts exactly one block from `input` into `output`.
    fn encrypt_block(&self, input: &[u8], output: &mut [u8]) -> Result<()>;

    /// Decrypts exactly one block from `input` into `output`.
    fn decrypt_block(&self, input: &[u8], output: &mut [u8]) -> Result<()>;
}

/// AES-128 implementation of the block-cipher contract, used as the
/// default cipher and by the tests.
pub struct Aes128BlockCipher {
    inner: aes::Aes128,
}

impl Aes128BlockCipher {
    pub fn new(key: &[u8; 16]) -> Self {
        use cipher::KeyInit;
        Self {
            inner: aes::Aes128::new(key.into()),
        }
    }
}

impl BlockCipher for Aes128BlockCipher {
    fn block_size(&self) -> usize {
        16
    }

    fn encrypt_block(&self, input: &[u8], output: &mut [u8]) -> Result<()> {
        use cipher::BlockEncrypt;
        if input.len() != 16 || output.len() != 16 {
            return Err(ProtocolError::CipherError(
                crate::error::constants::ERR_BAD_BLOCK_SIZE.into(),
            ));
        }
        let mut block = cipher::generic_array::GenericArray::clone_from_slice(input);
        self.inner.encrypt_block(&mut block);
        output.copy_from_slice(&block);
        Ok(())
    }

    fn decrypt_block(&self, input: &[u8], output: &mut [u8]) -> Result<()> {
        use cipher::BlockDecrypt;
        if input.len() != 16 || output.len() != 16 {
            return Err(ProtocolError::CipherError(
                crate::error::constants::ERR_BAD_BLOCK_SIZE.into(),
            ));
        }
        let mut block = cipher::generic_array::GenericArray::clone_from_slice(input);
        self.inner.decrypt_block(&mut block);
        output.copy_from_slice(&block);
        Ok(())
    }
}

/// Stream filter applying a block cipher with plaintext chaining.
pub struct EncryptionFilter {
    stream: Box<dyn Stream>,
    cipher: Box<dyn BlockCipher>,
    prev_plaintext_sent: Vec<u8>,
    prev_plaintext_received: Vec<u8>,
    /// Ciphertext read from below, awaiting a full block.
    cipher_buf: BytesMut,
    /// Decrypted bytes not yet forwarded.
    plain_buf: BytesMut,
    /// Bytes of the current plaintext frame still to forward.
    frame_remaining: usize,
    /// Final-block zero padding still to discard after the frame.
    padding_remaining: usize,
}

impl EncryptionFilter {
    /// Creates the filter over `stream`. Chaining registers start zeroed;
    /// they are never shared across connections.
    pub fn new(stream: Box<dyn Stream>, cipher: Box<dyn BlockCipher>) -> Self {
        let block_size = cipher.block_size();
        Self {
            stream,
            cipher,
            prev_plaintext_sent: vec![0; block_size],
            prev_plaintext_received: vec![0; block_size],
            cipher_buf: BytesMut::new(),
            plain_buf: BytesMut::new(),
            frame_remaining: 0,
            padding_remaining: 0,
        }
    }

    /// Decrypts every complete block sitting in the ciphertext buffer.
    fn decrypt_available(&mut self) -> Result<()> {
        let block_size = self.cipher.block_size();
        let mut plain = vec![0u8; block_size];
        while self.cipher_buf.len() >= block_size {
            self.cipher
                .decrypt_block(&self.cipher_buf[..block_size], &mut plain)?;
            for (p, prev) in plain.iter_mut().zip(self.prev_plaintext_received.iter()) {
                *p ^= prev;
            }
            self.prev_plaintext_received.copy_from_slice(&plain);
            self.plain_buf.extend_from_slice(&plain);
            self.cipher_buf.advance(block_size);
        }
        Ok(())
    }

    /// Forwards complete-frame plaintext to `output`, dropping padding.
    fn deliver_frames(&mut self, output: &mut BytesMut) -> usize {
        let block_size = self.cipher.block_size();
        let mut delivered = 0;

        loop {
            if self.frame_remaining == 0 && self.padding_remaining == 0 {
                // At a frame boundary: the next decrypted bytes start with
                // a transport length header.
                match frame::peek_length(&self.plain_buf) {
                    Some((header_len, payload_len)) => {
                        let total = header_len + payload_len;
                        self.frame_remaining = total;
                        self.padding_remaining = total.next_multiple_of(block_size) - total;
                        trace!(
                            frame_len = total,
                            padding = self.padding_remaining,
                            "Decrypted frame header"
                        );
                    }
                    None => break,
                }
            }

            if self.frame_remaining > 0 {
                let take = self.frame_remaining.min(self.plain_buf.len());
                if take == 0 {
                    break;
                }
                output.extend_from_slice(&self.plain_buf.split_to(take));
                self.frame_remaining -= take;
                delivered += take;
                if self.frame_remaining > 0 {
                    break;
                }
            }

            if self.padding_remaining > 0 {
                let drop = self.padding_remaining.min(self.plain_buf.len());
                self.plain_buf.advance(drop);
                self.padding_remaining -= drop;
                if self.padding_remaining > 0 {
                    break;
                }
            }
        }

        delivered
    }
}

impl Stream for EncryptionFilter {
    fn write_from(&mut self, input: &mut BytesMut, mode: WriteMode) -> Result<()> {
        let block_size = self.cipher.block_size();
        let padded_len = input.len().next_multiple_of(block_size);
        let mut out = BytesMut::with_capacity(padded_len);

        let mut block = vec![0u8; block_size];
        let mut combined = vec![0u8; block_size];
        let mut encrypted = vec![0u8; block_size];

        while !input.is_empty() {
            let take = block_size.min(input.len());
            block[..take].copy_from_slice(&input[..take]);
            block[take..].fill(0); // zero-pad the final partial block
            input.advance(take);

            for i in 0..block_size {
                combined[i] = block[i] ^ self.prev_plaintext_sent[i];
            }
            self.cipher.encrypt_block(&combined, &mut encrypted)?;
            out.extend_from_slice(&encrypted);
            self.prev_plaintext_sent.copy_from_slice(&block);
        }

        self.stream.write_from(&mut out, mode)
    }

    fn read_into(&mut self, output: &mut BytesMut) -> Result<usize> {
        self.stream.read_into(&mut self.cipher_buf)?;
        self.decrypt_available()?;
        Ok(self.deliver_frames(output))
    }

    fn shut_down(&mut self) {
        self.stream.shut_down();
    }

    fn did_finish_shutting_down(&mut self) -> bool {
        self.stream.did_finish_shutting_down()
    }

    fn has_unsent_data(&self) -> bool {
        self.stream.has_unsent_data()
    }

    fn is_connected(&self) -> bool {
        self.stream.is_connected()
    }

    fn did_handle_inactivity_timeout(&mut self) -> bool {
        self.stream.did_handle_inactivity_timeout()
    }

    fn descriptor(&self) -> String {
        format!("encrypted+{}", self.stream.descriptor())
    }
}
