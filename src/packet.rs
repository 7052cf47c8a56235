use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::errors::Error;
use crate::transport::Frame;

/// A protocol packet.
///
/// Each packet carries a type (encoded in [`PacketData`]) and the namespace it
/// is addressed to.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub inner: PacketData,
    pub ns: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PacketData {
    /// Namespace connection request (inbound, with an optional auth payload)
    /// or acknowledgement (outbound, always payload-free).
    Connect(Option<Value>),
    /// Namespace disconnection, without closing the underlying transport.
    Disconnect,
    /// An application event, with an optional ack id when the sender expects
    /// a response.
    Event(String, Value, Option<i64>),
    /// Response to an [`PacketData::Event`] packet carrying the same id.
    EventAck(Value, i64),
    /// Namespace-level error: connection refusals and event-middleware
    /// failures.
    Error(Value),
    /// An event with trailing binary attachments.
    BinaryEvent(String, BinaryPacket, Option<i64>),
    /// An ack with trailing binary attachments.
    BinaryAck(BinaryPacket, i64),
}

/// Binary payloads ride as separate frames after the textual head; this holds
/// the JSON part together with the attachments collected so far.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryPacket {
    pub data: Value,
    pub bin: Vec<Vec<u8>>,
    payload_count: usize,
}

impl BinaryPacket {
    /// Packet being received; attachments arrive later.
    pub(crate) fn incoming(data: Value, payload_count: usize) -> Self {
        Self {
            data,
            bin: Vec::with_capacity(payload_count),
            payload_count,
        }
    }

    /// Packet being sent, attachments already in hand.
    pub(crate) fn outgoing(data: Value, bin: Vec<Vec<u8>>) -> Self {
        let payload_count = bin.len();
        Self {
            data,
            bin,
            payload_count,
        }
    }

    pub(crate) fn add_payload(&mut self, payload: Vec<u8>) {
        self.bin.push(payload);
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.bin.len() >= self.payload_count
    }
}

impl Packet {
    pub fn connect(ns: String) -> Self {
        Self {
            inner: PacketData::Connect(None),
            ns,
        }
    }

    pub fn disconnect(ns: String) -> Self {
        Self {
            inner: PacketData::Disconnect,
            ns,
        }
    }

    pub fn event(ns: String, e: String, data: Value) -> Self {
        Self {
            inner: PacketData::Event(e, data, None),
            ns,
        }
    }

    pub fn bin_event(ns: String, e: String, data: Value, bin: Vec<Vec<u8>>) -> Self {
        Self {
            inner: PacketData::BinaryEvent(e, BinaryPacket::outgoing(data, bin), None),
            ns,
        }
    }

    pub fn ack(ns: String, data: Value, id: i64) -> Self {
        Self {
            inner: PacketData::EventAck(data, id),
            ns,
        }
    }

    pub fn bin_ack(ns: String, data: Value, bin: Vec<Vec<u8>>, id: i64) -> Self {
        Self {
            inner: PacketData::BinaryAck(BinaryPacket::outgoing(data, bin), id),
            ns,
        }
    }

    pub fn error(ns: String, msg: impl Into<String>) -> Self {
        Self {
            inner: PacketData::Error(Value::String(msg.into())),
            ns,
        }
    }

    pub fn invalid_namespace(ns: String) -> Self {
        Self::error(ns, "Invalid namespace")
    }

    /// Encode into the ordered frame list written to the transport: the
    /// textual head first, then one binary frame per attachment.
    pub fn into_frames(mut self) -> Result<Vec<Frame>, serde_json::Error> {
        let bin = match self.inner {
            PacketData::BinaryEvent(_, ref mut p, _) | PacketData::BinaryAck(ref mut p, _) => {
                std::mem::take(&mut p.bin)
            }
            _ => Vec::new(),
        };
        let head = String::try_from(self)?;
        let mut frames = Vec::with_capacity(1 + bin.len());
        frames.push(Frame::Text(head));
        frames.extend(bin.into_iter().map(Frame::Binary));
        Ok(frames)
    }
}

impl PacketData {
    fn index(&self) -> u8 {
        match self {
            PacketData::Connect(_) => 0,
            PacketData::Disconnect => 1,
            PacketData::Event(_, _, _) => 2,
            PacketData::EventAck(_, _) => 3,
            PacketData::Error(_) => 4,
            PacketData::BinaryEvent(_, _, _) => 5,
            PacketData::BinaryAck(_, _) => 6,
        }
    }

    pub(crate) fn set_ack_id(&mut self, id: i64) {
        match self {
            PacketData::Event(_, _, ack) | PacketData::BinaryEvent(_, _, ack) => {
                *ack = Some(id);
            }
            _ => (),
        }
    }
}

/// Event payloads are arrays of the form `["<event>", <data>]`; a null datum
/// (e.g. a `()` payload) is omitted entirely.
fn event_payload(e: &str, data: &Value) -> Value {
    let mut arr = vec![Value::String(e.to_string())];
    if !data.is_null() {
        arr.push(data.clone());
    }
    Value::Array(arr)
}

/// Ack payloads are always arrays, mirroring the argument list of the
/// acknowledgement call.
fn ack_payload(data: &Value) -> Value {
    match data {
        Value::Array(_) => data.clone(),
        Value::Null => Value::Array(vec![]),
        v => Value::Array(vec![v.clone()]),
    }
}

/// Serialize a packet head to the wire text:
/// ```text
/// <type>[<# of binary attachments>-][<namespace>,][<ack id>][json payload]
/// ```
impl TryFrom<Packet> for String {
    type Error = serde_json::Error;

    fn try_from(packet: Packet) -> Result<Self, Self::Error> {
        let mut res = packet.inner.index().to_string();

        if let PacketData::BinaryEvent(_, p, _) | PacketData::BinaryAck(p, _) = &packet.inner {
            res.push_str(&p.payload_count.to_string());
            res.push('-');
        }
        if !packet.ns.is_empty() && packet.ns != "/" {
            res.push_str(&packet.ns);
            res.push(',');
        }

        match packet.inner {
            PacketData::Connect(None) | PacketData::Disconnect => (),
            PacketData::Connect(Some(data)) => res.push_str(&serde_json::to_string(&data)?),
            PacketData::Event(e, data, ack) | PacketData::BinaryEvent(e, BinaryPacket { data, .. }, ack) => {
                if let Some(ack) = ack {
                    res.push_str(&ack.to_string());
                }
                res.push_str(&serde_json::to_string(&event_payload(&e, &data))?);
            }
            PacketData::EventAck(data, ack) | PacketData::BinaryAck(BinaryPacket { data, .. }, ack) => {
                res.push_str(&ack.to_string());
                res.push_str(&serde_json::to_string(&ack_payload(&data))?);
            }
            PacketData::Error(data) => res.push_str(&serde_json::to_string(&data)?),
        };
        Ok(res)
    }
}

/// Deserialize an event payload, formatted as:
/// ```text
/// ["<event name>", ...<JSON-stringified arguments without binary>]
/// ```
fn deserialize_event_packet(data: &str) -> Result<(String, Value), Error> {
    debug!("deserializing event packet: {:?}", data);
    let packet = match serde_json::from_str::<Value>(data)? {
        Value::Array(packet) => packet,
        _ => return Err(Error::InvalidEventName),
    };

    let event = packet
        .first()
        .ok_or(Error::InvalidEventName)?
        .as_str()
        .ok_or(Error::InvalidEventName)?
        .to_string();
    let payload = Value::from_iter(packet.into_iter().skip(1));
    Ok((event, payload))
}

fn deserialize_packet<T: DeserializeOwned>(data: &str) -> Result<Option<T>, Error> {
    let packet = if data.is_empty() {
        None
    } else {
        Some(serde_json::from_str(data)?)
    };
    Ok(packet)
}

/// Deserialize a packet head from the wire text. Binary attachments arrive as
/// separate frames and are applied by the receiving client until the packet
/// is complete.
impl TryFrom<String> for Packet {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let mut chars = value.chars();
        let index = chars.next().ok_or(Error::InvalidPacketType)?;

        let attachments: usize = if index == '5' || index == '6' {
            let count: String = chars.take_while_ref(|c| c.is_ascii_digit()).collect();
            // skip the `-` separator
            chars.next();
            count.parse().unwrap_or(0)
        } else {
            0
        };

        let ns = if chars.clone().next() == Some('/') {
            let ns: String = chars.take_while_ref(|c| *c != ',').collect();
            // skip the `,` separator
            chars.next();
            ns
        } else {
            "/".to_string()
        };

        let ack: Option<i64> = chars
            .take_while_ref(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .ok();

        let data = chars.as_str();
        let inner = match index {
            '0' => PacketData::Connect(deserialize_packet(data)?),
            '1' => PacketData::Disconnect,
            '2' => {
                let (event, payload) = deserialize_event_packet(data)?;
                PacketData::Event(event, payload, ack)
            }
            '3' => PacketData::EventAck(
                deserialize_packet(data)?.ok_or(Error::InvalidAckId)?,
                ack.ok_or(Error::InvalidAckId)?,
            ),
            '4' => PacketData::Error(deserialize_packet(data)?.ok_or(Error::InvalidPacketType)?),
            '5' => {
                let (event, payload) = deserialize_event_packet(data)?;
                PacketData::BinaryEvent(event, BinaryPacket::incoming(payload, attachments), ack)
            }
            '6' => PacketData::BinaryAck(
                BinaryPacket::incoming(
                    deserialize_packet(data)?.ok_or(Error::InvalidAckId)?,
                    attachments,
                ),
                ack.ok_or(Error::InvalidAckId)?,
            ),
            _ => return Err(Error::InvalidPacketType),
        };

        Ok(Self { inner, ns })
    }
}
