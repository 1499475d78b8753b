//! Length-prefixed framed packet protocol.
//!
//! Frame layout: 4-byte big-endian payload length, 1-byte packet type,
//! 16-byte packet id, 1-byte request-id presence flag, optional 16-byte
//! request id, serde-encoded body. Frames that exceed the size cap or fail
//! to decode terminate the connection with `MalformedPacket`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use uuid::Uuid;

use crate::constants::MAX_FRAME_LEN;
use crate::market::PairId;
use crate::swap::SwapFailureReason;

/// Frame header bytes following the length prefix: type + packet id + flag.
const MIN_PAYLOAD_LEN: usize = 1 + 16 + 1;

#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the frame cap")]
    FrameTooLarge(usize),
    #[error("frame of {0} bytes is too short")]
    FrameTooShort(usize),
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    #[error("malformed packet body: {0}")]
    Body(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Shutdown,
    NotAcceptingConnections,
    IncompatibleProtocolVersion,
    UnexpectedIdentity,
    AlreadyConnected,
    Banned,
    ConnectionTimeout,
    ResponseStalling,
    MalformedPacket,
    UnknownError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub pub_key: String,
    pub version: String,
    pub network: String,
    pub addresses: Vec<String>,
    pub pairs: Vec<PairId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disconnecting {
    pub reason: DisconnectReason,
    pub payload: Option<String>,
}

/// An order as gossiped between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOrder {
    pub id: Uuid,
    pub pair_id: PairId,
    pub price: Decimal,
    /// Signed: positive buys, negative sells.
    pub quantity: i64,
    pub destination: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Orders {
    pub orders: Vec<WireOrder>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderInvalidation {
    pub order_id: Uuid,
    pub pair_id: PairId,
    /// Decrement by this many units; `None` removes the order entirely.
    pub quantity: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub r_hash: String,
    pub order_id: Uuid,
    pub pair_id: PairId,
    pub proposed_quantity: u64,
    pub taker_cltv_delta: u32,
    pub taker_destination: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapAccepted {
    pub r_hash: String,
    pub quantity: u64,
    pub maker_cltv_delta: u32,
    pub maker_destination: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapFailed {
    pub r_hash: String,
    pub reason: SwapFailureReason,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapComplete {
    pub r_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub addresses: Vec<String>,
    pub pairs: Vec<PairId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Hello(Hello),
    Disconnecting(Disconnecting),
    Ping,
    Pong,
    GetOrders,
    Orders(Orders),
    Order(WireOrder),
    OrderInvalidation(OrderInvalidation),
    SwapRequest(SwapRequest),
    SwapAccepted(SwapAccepted),
    SwapFailed(SwapFailed),
    SwapComplete(SwapComplete),
    NodeStateUpdate(NodeState),
}

impl Packet {
    pub fn type_byte(&self) -> u8 {
        match self {
            Packet::Hello(_) => 0,
            Packet::Disconnecting(_) => 1,
            Packet::Ping => 2,
            Packet::Pong => 3,
            Packet::GetOrders => 4,
            Packet::Orders(_) => 5,
            Packet::Order(_) => 6,
            Packet::OrderInvalidation(_) => 7,
            Packet::SwapRequest(_) => 8,
            Packet::SwapAccepted(_) => 9,
            Packet::SwapFailed(_) => 10,
            Packet::SwapComplete(_) => 11,
            Packet::NodeStateUpdate(_) => 12,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Packet::Hello(_) => "hello",
            Packet::Disconnecting(_) => "disconnecting",
            Packet::Ping => "ping",
            Packet::Pong => "pong",
            Packet::GetOrders => "get_orders",
            Packet::Orders(_) => "orders",
            Packet::Order(_) => "order",
            Packet::OrderInvalidation(_) => "order_invalidation",
            Packet::SwapRequest(_) => "swap_request",
            Packet::SwapAccepted(_) => "swap_accepted",
            Packet::SwapFailed(_) => "swap_failed",
            Packet::SwapComplete(_) => "swap_complete",
            Packet::NodeStateUpdate(_) => "node_state_update",
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>, WireError> {
        let body = match self {
            Packet::Hello(b) => serde_json::to_vec(b)?,
            Packet::Disconnecting(b) => serde_json::to_vec(b)?,
            Packet::Ping | Packet::Pong | Packet::GetOrders => Vec::new(),
            Packet::Orders(b) => serde_json::to_vec(b)?,
            Packet::Order(b) => serde_json::to_vec(b)?,
            Packet::OrderInvalidation(b) => serde_json::to_vec(b)?,
            Packet::SwapRequest(b) => serde_json::to_vec(b)?,
            Packet::SwapAccepted(b) => serde_json::to_vec(b)?,
            Packet::SwapFailed(b) => serde_json::to_vec(b)?,
            Packet::SwapComplete(b) => serde_json::to_vec(b)?,
            Packet::NodeStateUpdate(b) => serde_json::to_vec(b)?,
        };
        Ok(body)
    }

    fn decode_body(type_byte: u8, body: &[u8]) -> Result<Packet, WireError> {
        let packet = match type_byte {
            0 => Packet::Hello(serde_json::from_slice(body)?),
            1 => Packet::Disconnecting(serde_json::from_slice(body)?),
            2 => Packet::Ping,
            3 => Packet::Pong,
            4 => Packet::GetOrders,
            5 => Packet::Orders(serde_json::from_slice(body)?),
            6 => Packet::Order(serde_json::from_slice(body)?),
            7 => Packet::OrderInvalidation(serde_json::from_slice(body)?),
            8 => Packet::SwapRequest(serde_json::from_slice(body)?),
            9 => Packet::SwapAccepted(serde_json::from_slice(body)?),
            10 => Packet::SwapFailed(serde_json::from_slice(body)?),
            11 => Packet::SwapComplete(serde_json::from_slice(body)?),
            12 => Packet::NodeStateUpdate(serde_json::from_slice(body)?),
            other => return Err(WireError::UnknownPacketType(other)),
        };
        Ok(packet)
    }
}

/// A packet with its wire identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: Uuid,
    /// Id of the request this packet responds to, if any.
    pub req_id: Option<Uuid>,
    pub packet: Packet,
}

impl Envelope {
    pub fn new(packet: Packet) -> Self {
        Self {
            id: Uuid::new_v4(),
            req_id: None,
            packet,
        }
    }

    pub fn response_to(packet: Packet, req_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            req_id: Some(req_id),
            packet,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let body = self.packet.encode_body()?;
        let payload_len = MIN_PAYLOAD_LEN + self.req_id.map(|_| 16).unwrap_or(0) + body.len();
        if payload_len > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(payload_len));
        }

        let mut frame = Vec::with_capacity(4 + payload_len);
        frame.extend_from_slice(&(payload_len as u32).to_be_bytes());
        frame.push(self.packet.type_byte());
        frame.extend_from_slice(self.id.as_bytes());
        match self.req_id {
            Some(req_id) => {
                frame.push(1);
                frame.extend_from_slice(req_id.as_bytes());
            }
            None => frame.push(0),
        }
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < MIN_PAYLOAD_LEN {
            return Err(WireError::FrameTooShort(payload.len()));
        }
        let type_byte = payload[0];
        let id = Uuid::from_slice(&payload[1..17]).expect("16-byte uuid slice");
        let (req_id, body_start) = match payload[17] {
            0 => (None, MIN_PAYLOAD_LEN),
            _ => {
                if payload.len() < MIN_PAYLOAD_LEN + 16 {
                    return Err(WireError::FrameTooShort(payload.len()));
                }
                let req_id = Uuid::from_slice(&payload[18..34]).expect("16-byte uuid slice");
                (Some(req_id), MIN_PAYLOAD_LEN + 16)
            }
        };
        let packet = Packet::decode_body(type_byte, &payload[body_start..])?;
        Ok(Self { id, req_id, packet })
    }
}

/// Read one frame. Errors other than clean EOF are fatal for the connection.
pub async fn read_frame<R>(reader: &mut R) -> Result<Envelope, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    if len < MIN_PAYLOAD_LEN {
        return Err(WireError::FrameTooShort(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Envelope::decode(&payload)
}

pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = envelope.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: Packet) {
        let envelope = Envelope::new(packet);
        let frame = envelope.encode().unwrap();
        let decoded = Envelope::decode(&frame[4..]).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn all_packet_types_round_trip() {
        round_trip(Packet::Hello(Hello {
            pub_key: "02".repeat(33),
            version: "0.1.0".into(),
            network: "simnet".into(),
            addresses: vec!["127.0.0.1:18885".into()],
            pairs: vec!["BTC/USDT".into()],
        }));
        round_trip(Packet::Disconnecting(Disconnecting {
            reason: DisconnectReason::Shutdown,
            payload: Some("bye".into()),
        }));
        round_trip(Packet::Ping);
        round_trip(Packet::Pong);
        round_trip(Packet::GetOrders);
        round_trip(Packet::Orders(Orders {
            orders: vec![WireOrder {
                id: Uuid::new_v4(),
                pair_id: "BTC/USDT".into(),
                price: Decimal::new(425, 1),
                quantity: -250,
                destination: None,
            }],
        }));
        round_trip(Packet::Order(WireOrder {
            id: Uuid::new_v4(),
            pair_id: "LTC/BTC".into(),
            price: Decimal::from(77),
            quantity: 42,
            destination: Some("invoice".into()),
        }));
        round_trip(Packet::OrderInvalidation(OrderInvalidation {
            order_id: Uuid::new_v4(),
            pair_id: "BTC/USDT".into(),
            quantity: Some(5),
        }));
        round_trip(Packet::SwapRequest(SwapRequest {
            r_hash: "ab".repeat(32),
            order_id: Uuid::new_v4(),
            pair_id: "BTC/USDT".into(),
            proposed_quantity: 1000,
            taker_cltv_delta: 144,
            taker_destination: "destination".into(),
        }));
        round_trip(Packet::SwapAccepted(SwapAccepted {
            r_hash: "ab".repeat(32),
            quantity: 1000,
            maker_cltv_delta: 40,
            maker_destination: "destination".into(),
        }));
        round_trip(Packet::SwapFailed(SwapFailed {
            r_hash: "ab".repeat(32),
            reason: SwapFailureReason::PaymentRejected,
            message: Some("no capacity".into()),
        }));
        round_trip(Packet::SwapComplete(SwapComplete {
            r_hash: "ab".repeat(32),
        }));
        round_trip(Packet::NodeStateUpdate(NodeState {
            addresses: vec!["example.com:18885".into()],
            pairs: vec!["BTC/USDT".into(), "LTC/BTC".into()],
        }));
    }

    #[test]
    fn request_id_is_preserved() {
        let req_id = Uuid::new_v4();
        let envelope = Envelope::response_to(Packet::Pong, req_id);
        let frame = envelope.encode().unwrap();
        let decoded = Envelope::decode(&frame[4..]).unwrap();
        assert_eq!(decoded.req_id, Some(req_id));
        assert_eq!(decoded.id, envelope.id);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let envelope = Envelope::new(Packet::Ping);
        let mut frame = envelope.encode().unwrap();
        frame[4] = 0xff;
        let err = Envelope::decode(&frame[4..]).unwrap_err();
        assert!(matches!(err, WireError::UnknownPacketType(0xff)));
    }

    #[test]
    fn garbage_body_is_rejected() {
        let envelope = Envelope::new(Packet::Ping);
        let mut frame = envelope.encode().unwrap();
        frame[4] = 0; // claims Hello, carries no body
        let err = Envelope::decode(&frame[4..]).unwrap_err();
        assert!(matches!(err, WireError::Body(_)));
    }

    #[test]
    fn short_payload_is_rejected() {
        let err = Envelope::decode(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, WireError::FrameTooShort(4)));
    }

    #[tokio::test]
    async fn frames_cross_a_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let envelope = Envelope::new(Packet::SwapComplete(SwapComplete {
            r_hash: "cd".repeat(32),
        }));
        write_frame(&mut a, &envelope).await.unwrap();
        let decoded = read_frame(&mut b).await.unwrap();
        assert_eq!(decoded, envelope);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_reading_body() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &len).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge(_)));
    }
}
