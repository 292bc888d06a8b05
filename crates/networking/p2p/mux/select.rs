use super::{MuxError, MuxStream};
use tracing::debug;

pub const MULTISTREAM_PROTOCOL: &str = "/multistream-select/1.0.0";
const NOT_AVAILABLE: &str = "na";

/// Dialer side of the interactive selection protocol. Offers candidates in
/// order until one is echoed back; `na` moves on to the next. With a single
/// candidate the header and the offer ride one message (optimistic select).
pub async fn select(stream: &mut MuxStream, protocols: &[&str]) -> Result<String, MuxError> {
    if protocols.is_empty() {
        return Err(MuxError::NegotiationFailed("no protocols to offer".into()));
    }

    let mut offered = 0;
    if protocols.len() == 1 {
        let mut combined = String::with_capacity(MULTISTREAM_PROTOCOL.len() + protocols[0].len() + 2);
        combined.push_str(MULTISTREAM_PROTOCOL);
        combined.push('\n');
        combined.push_str(protocols[0]);
        stream.write_line(&combined).await?;
        offered = 1;
    } else {
        stream.write_line(MULTISTREAM_PROTOCOL).await?;
    }

    let header = stream.read_line().await?;
    if header != MULTISTREAM_PROTOCOL {
        return Err(MuxError::NegotiationFailed(format!(
            "unexpected header {header:?}"
        )));
    }

    loop {
        if offered == 0 {
            stream.write_line(protocols[0]).await?;
            offered = 1;
        }
        let answer = stream.read_line().await?;
        if answer == protocols[offered - 1] {
            return Ok(answer);
        }
        if answer != NOT_AVAILABLE {
            return Err(MuxError::NegotiationFailed(format!(
                "unexpected answer {answer:?}"
            )));
        }
        if offered == protocols.len() {
            return Err(MuxError::NegotiationFailed(
                "no protocol accepted".to_string(),
            ));
        }
        stream.write_line(protocols[offered]).await?;
        offered += 1;
    }
}

/// Listener side: echoes the header, accepts the first supported candidate,
/// answers `na` to the rest.
pub async fn handle(stream: &mut MuxStream, supported: &[&str]) -> Result<String, MuxError> {
    let header = stream.read_line().await?;
    if header != MULTISTREAM_PROTOCOL {
        return Err(MuxError::NegotiationFailed(format!(
            "unexpected header {header:?}"
        )));
    }
    stream.write_line(MULTISTREAM_PROTOCOL).await?;

    loop {
        let candidate = stream.read_line().await?;
        if supported.contains(&candidate.as_str()) {
            stream.write_line(&candidate).await?;
            return Ok(candidate);
        }
        debug!("Rejecting protocol candidate {candidate}");
        stream.write_line(NOT_AVAILABLE).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mux::Multiplexer,
        rlpx::{frame::FrameCodec, handshake::Handshake},
    };
    use ethrune_crypto::secp::{pk2id, public_key};
    use rand::rngs::OsRng;
    use secp256k1::SecretKey;
    use tokio_util::codec::Framed;

    async fn negotiation_fixture() -> (MuxStream, MuxStream) {
        let (a_side, b_side) = tokio::io::duplex(64 * 1024);
        let initiator_key = SecretKey::new(&mut OsRng);
        let responder_key = SecretKey::new(&mut OsRng);
        let responder_id = pk2id(&public_key(&responder_key));
        let mut initiator = Handshake::new(initiator_key, true);
        let mut responder = Handshake::new(responder_key, true);
        let auth = initiator.encode_auth(responder_id).unwrap();
        responder.decode_auth(&auth).unwrap();
        let ack = responder.encode_ack().unwrap();
        initiator.decode_ack(&ack).unwrap();

        let a_codec = FrameCodec::new(initiator.derive_secrets(true).unwrap()).unwrap();
        let b_codec = FrameCodec::new(responder.derive_secrets(false).unwrap()).unwrap();
        let (a_mux, a_handle, _a_inbound) = Multiplexer::new(Framed::new(a_side, a_codec));
        let (b_mux, _b_handle, mut b_inbound) = Multiplexer::new(Framed::new(b_side, b_codec));
        tokio::spawn(a_mux.run());
        tokio::spawn(b_mux.run());

        let dialer = a_handle.open_stream(None).await.unwrap();
        let listener = b_inbound.recv().await.unwrap();
        (dialer, listener)
    }

    #[tokio::test]
    async fn optimistic_select_with_single_protocol() {
        let (mut dialer, mut listener) = negotiation_fixture().await;
        let listener_task =
            tokio::spawn(async move { handle(&mut listener, &["/eth/68/1.0.0"]).await });

        let chosen = select(&mut dialer, &["/eth/68/1.0.0"]).await.unwrap();
        assert_eq!(chosen, "/eth/68/1.0.0");
        assert_eq!(listener_task.await.unwrap().unwrap(), "/eth/68/1.0.0");
    }

    #[tokio::test]
    async fn falls_back_to_next_candidate_on_na() {
        let (mut dialer, mut listener) = negotiation_fixture().await;
        let listener_task =
            tokio::spawn(async move { handle(&mut listener, &["/eth/66/1.0.0"]).await });

        let chosen = select(
            &mut dialer,
            &["/eth/68/1.0.0", "/eth/67/1.0.0", "/eth/66/1.0.0"],
        )
        .await
        .unwrap();
        assert_eq!(chosen, "/eth/66/1.0.0");
        assert_eq!(listener_task.await.unwrap().unwrap(), "/eth/66/1.0.0");
    }

    #[tokio::test]
    async fn no_common_protocol_fails() {
        let (mut dialer, mut listener) = negotiation_fixture().await;
        tokio::spawn(async move {
            // Listener supports nothing the dialer offers; it keeps answering
            // na until the dialer gives up and the stream drops.
            let _ = handle(&mut listener, &["/snap/1/1.0.0"]).await;
        });

        let result = select(&mut dialer, &["/eth/68/1.0.0"]).await;
        assert!(matches!(result, Err(MuxError::NegotiationFailed(_))));
    }
}
