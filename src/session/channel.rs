//! Keyed packet channel shared by both endpoints
//!
//! Owns the AEAD state of one key epoch: outgoing sequence counter and the
//! replay window for incoming packets. A rekey replaces the whole channel.

use super::SessionError;
use crate::crypto::{SessionCipher, MIN_CIPHERTEXT_LEN};
use crate::protocol::{encode_header, Packet, PacketType};
use crate::replay::ReplayWindow;

#[derive(Debug)]
pub struct SecureChannel {
    session_id: u32,
    cipher: SessionCipher,
    send_seq: u32,
    replay: ReplayWindow,
}

impl SecureChannel {
    pub fn new(session_id: u32, cipher: SessionCipher) -> Self {
        Self {
            session_id,
            cipher,
            send_seq: 0,
            replay: ReplayWindow::new(),
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn cipher(&self) -> &SessionCipher {
        &self.cipher
    }

    /// Sequence numbers start at 1
    fn next_seq(&mut self) -> Result<u32, SessionError> {
        self.send_seq = self
            .send_seq
            .checked_add(1)
            .ok_or(SessionError::SequenceExhausted)?;
        Ok(self.send_seq)
    }

    /// Encrypt `plaintext` into a packet of the given type. The packet header
    /// is the associated data of the AEAD.
    pub fn seal(&mut self, packet_type: PacketType, plaintext: &[u8]) -> Result<Packet, SessionError> {
        let seq = self.next_seq()?;
        let header = encode_header(
            packet_type,
            self.session_id,
            seq,
            plaintext.len() + MIN_CIPHERTEXT_LEN,
        )?;
        let sealed = self.cipher.encrypt_with_aad(plaintext, &header)?;
        Ok(Packet::new(packet_type, self.session_id, seq, sealed)?)
    }

    /// Authenticate header and payload, then decrypt. The replay window is
    /// only advanced once the tag verifies.
    pub fn open(&mut self, packet: &Packet) -> Result<Vec<u8>, SessionError> {
        let seq = u64::from(packet.sequence);
        if !self.replay.check(seq) {
            return Err(SessionError::Replay(packet.sequence));
        }
        let plaintext = self.cipher.decrypt_with_aad(&packet.payload, &packet.header()?)?;
        self.replay.check_and_update(seq);
        Ok(plaintext)
    }

    pub fn sent(&self) -> u32 {
        self.send_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherSuite, CryptoError};

    fn pair() -> (SecureChannel, SecureChannel) {
        let key = [0x11u8; 32];
        (
            SecureChannel::new(7, SessionCipher::new(CipherSuite::default(), &key).unwrap()),
            SecureChannel::new(7, SessionCipher::new(CipherSuite::default(), &key).unwrap()),
        )
    }

    #[test]
    fn test_seal_open() {
        let (mut a, mut b) = pair();
        let first = a.seal(PacketType::Data, b"one").unwrap();
        let second = a.seal(PacketType::Data, b"two").unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(first.session_id, 7);

        assert_eq!(b.open(&second).unwrap(), b"two");
        assert_eq!(b.open(&first).unwrap(), b"one");
    }

    #[test]
    fn test_replay_rejected() {
        let (mut a, mut b) = pair();
        let packet = a.seal(PacketType::Data, b"once").unwrap();
        b.open(&packet).unwrap();
        assert_eq!(b.open(&packet).unwrap_err(), SessionError::Replay(1));
    }

    #[test]
    fn test_rewritten_sequence_rejected() {
        let (mut a, mut b) = pair();
        let genuine = a.seal(PacketType::Data, b"transfer").unwrap();
        assert_eq!(b.open(&genuine).unwrap(), b"transfer");

        let mut shifted = genuine.clone();
        shifted.sequence += 1000;
        assert_eq!(
            b.open(&shifted).unwrap_err(),
            SessionError::Crypto(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_rewritten_type_rejected() {
        let (mut a, mut b) = pair();
        let mut relabelled = a.seal(PacketType::Data, b"").unwrap();
        relabelled.packet_type = PacketType::Disconnect;
        assert!(b.open(&relabelled).is_err());

        let mut moved = a.seal(PacketType::Keepalive, b"").unwrap();
        moved.session_id = 8;
        assert!(b.open(&moved).is_err());
    }

    #[test]
    fn test_forgery_does_not_burn_sequence() {
        let (mut a, mut b) = pair();
        let genuine = a.seal(PacketType::Data, b"real").unwrap();
        let mut forged = genuine.clone();
        forged.payload = vec![0u8; 40].into();

        assert_eq!(
            b.open(&forged).unwrap_err(),
            SessionError::Crypto(CryptoError::DecryptionFailed)
        );
        assert_eq!(b.open(&genuine).unwrap(), b"real");
    }
}
