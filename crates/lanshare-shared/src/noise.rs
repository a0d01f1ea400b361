use snow::{Builder, HandshakeState, TransportState};

use crate::error::NoiseError;

// XX with the network secret mixed in after the last handshake message:
// both sides must hold the PSK and both present static keys.
const NOISE_PATTERN: &str = "Noise_XXpsk3_25519_ChaChaPoly_BLAKE2s";

fn builder<'a>(
    local_private_key: &'a [u8; 32],
    psk: &'a [u8; 32],
) -> Result<Builder<'a>, NoiseError> {
    let params = NOISE_PATTERN
        .parse()
        .map_err(|e| NoiseError::Handshake(format!("{e}")))?;
    Ok(Builder::new(params)
        .local_private_key(local_private_key)
        .psk(3, psk))
}

pub fn build_initiator(
    local_private_key: &[u8; 32],
    psk: &[u8; 32],
) -> Result<HandshakeState, NoiseError> {
    builder(local_private_key, psk)?
        .build_initiator()
        .map_err(|e| NoiseError::Handshake(format!("{e}")))
}

pub fn build_responder(
    local_private_key: &[u8; 32],
    psk: &[u8; 32],
) -> Result<HandshakeState, NoiseError> {
    builder(local_private_key, psk)?
        .build_responder()
        .map_err(|e| NoiseError::Handshake(format!("{e}")))
}

/// Finalize the handshake, returning the transport and the remote static key.
pub fn into_transport(state: HandshakeState) -> Result<(TransportState, Vec<u8>), NoiseError> {
    let remote_static = state
        .get_remote_static()
        .map(|k| k.to_vec())
        .ok_or_else(|| NoiseError::Handshake("peer presented no static key".into()))?;
    let transport = state
        .into_transport_mode()
        .map_err(|e| NoiseError::Transport(format!("{e}")))?;
    Ok((transport, remote_static))
}

pub fn transport_encrypt(
    transport: &mut TransportState,
    plaintext: &[u8],
) -> Result<Vec<u8>, NoiseError> {
    let mut buf = vec![0u8; plaintext.len() + 64]; // extra space for auth tag
    let len = transport
        .write_message(plaintext, &mut buf)
        .map_err(|e| NoiseError::Transport(format!("{e}")))?;
    buf.truncate(len);
    Ok(buf)
}

pub fn transport_decrypt(
    transport: &mut TransportState,
    ciphertext: &[u8],
) -> Result<Vec<u8>, NoiseError> {
    let mut buf = vec![0u8; ciphertext.len()];
    let len = transport
        .read_message(ciphertext, &mut buf)
        .map_err(|e| NoiseError::Transport(format!("{e}")))?;
    buf.truncate(len);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keystore;

    fn run_handshake(
        initiator: &mut HandshakeState,
        responder: &mut HandshakeState,
    ) -> Result<(), snow::Error> {
        let mut buf = vec![0u8; 512];
        let mut scratch = vec![0u8; 512];

        // -> e
        let len = initiator.write_message(&[], &mut buf)?;
        responder.read_message(&buf[..len], &mut scratch)?;
        // <- e, ee, s, es
        let len = responder.write_message(&[], &mut buf)?;
        initiator.read_message(&buf[..len], &mut scratch)?;
        // -> s, se, psk
        let len = initiator.write_message(&[], &mut buf)?;
        responder.read_message(&buf[..len], &mut scratch)?;
        Ok(())
    }

    #[test]
    fn test_noise_handshake() {
        let a = Keystore::generate();
        let b = a.join();

        let mut initiator = build_initiator(&a.static_secret, &a.network_psk).unwrap();
        let mut responder = build_responder(&b.static_secret, &b.network_psk).unwrap();
        run_handshake(&mut initiator, &mut responder).unwrap();

        let (mut i_transport, i_remote) = into_transport(initiator).unwrap();
        let (mut r_transport, r_remote) = into_transport(responder).unwrap();

        assert_eq!(i_remote, b.static_public().to_vec());
        assert_eq!(r_remote, a.static_public().to_vec());

        let message = b"STATUS";
        let encrypted = transport_encrypt(&mut i_transport, message).unwrap();
        let decrypted = transport_decrypt(&mut r_transport, &encrypted).unwrap();
        assert_eq!(decrypted, message);
    }

    #[test]
    fn test_psk_mismatch_fails() {
        let a = Keystore::generate();
        let stranger = Keystore::generate();

        let mut initiator = build_initiator(&a.static_secret, &a.network_psk).unwrap();
        let mut responder =
            build_responder(&stranger.static_secret, &stranger.network_psk).unwrap();

        assert!(run_handshake(&mut initiator, &mut responder).is_err());
    }
}
