//! Messages of the relay's `ProxyService.Proxy` bidirectional stream.
//!
//! A session opens with a `DIAL_REQ`/`DIAL_RSP` exchange which assigns a
//! connection id, continues with `DATA` packets in both directions and ends
//! with `CLOSE_REQ`/`CLOSE_RSP`.

/// Full path of the streaming method.
pub const PROXY_METHOD_PATH: &str = "/ProxyService/Proxy";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PacketType {
    DialReq = 0,
    DialRsp = 1,
    CloseReq = 2,
    CloseRsp = 3,
    Data = 4,
    DialCls = 5,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Packet {
    #[prost(enumeration = "PacketType", tag = "1")]
    pub r#type: i32,

    #[prost(oneof = "packet::Payload", tags = "2, 3, 4, 5, 6, 7")]
    pub payload: Option<packet::Payload>,
}

pub mod packet {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "2")]
        DialRequest(super::DialRequest),
        #[prost(message, tag = "3")]
        DialResponse(super::DialResponse),
        #[prost(message, tag = "4")]
        Data(super::Data),
        #[prost(message, tag = "5")]
        CloseRequest(super::CloseRequest),
        #[prost(message, tag = "6")]
        CloseResponse(super::CloseResponse),
        #[prost(message, tag = "7")]
        CloseDial(super::CloseDial),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DialRequest {
    /// Always `tcp`.
    #[prost(string, tag = "1")]
    pub protocol: String,
    #[prost(string, tag = "2")]
    pub address: String,
    /// Correlates the request with its response.
    #[prost(int64, tag = "3")]
    pub random: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DialResponse {
    #[prost(string, tag = "1")]
    pub error: String,
    #[prost(int64, tag = "2")]
    pub random: i64,
    #[prost(int64, tag = "3")]
    pub connect_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloseRequest {
    #[prost(int64, tag = "1")]
    pub connect_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloseResponse {
    #[prost(string, tag = "1")]
    pub error: String,
    #[prost(int64, tag = "2")]
    pub connect_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloseDial {
    #[prost(int64, tag = "1")]
    pub random: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Data {
    #[prost(int64, tag = "1")]
    pub connect_id: i64,
    #[prost(string, tag = "2")]
    pub error: String,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

impl Packet {
    pub fn dial_request(address: impl Into<String>, random: i64) -> Self {
        Self {
            r#type: PacketType::DialReq.into(),
            payload: Some(packet::Payload::DialRequest(DialRequest {
                protocol: "tcp".to_owned(),
                address: address.into(),
                random,
            })),
        }
    }

    pub fn data(connect_id: i64, data: Vec<u8>) -> Self {
        Self {
            r#type: PacketType::Data.into(),
            payload: Some(packet::Payload::Data(Data {
                connect_id,
                error: String::new(),
                data,
            })),
        }
    }

    pub fn close_request(connect_id: i64) -> Self {
        Self {
            r#type: PacketType::CloseReq.into(),
            payload: Some(packet::Payload::CloseRequest(CloseRequest { connect_id })),
        }
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn dial_request_wire_format() {
        let encoded = Packet::dial_request("c1:443", 7).encode_to_vec();

        // Field 1 (type) is zero and therefore omitted, field 2 carries the
        // dial request.
        assert_eq!(encoded[0], 0x12);

        let decoded = Packet::decode(encoded.as_slice()).unwrap();
        assert_eq!(decoded.r#type(), PacketType::DialReq);
        let Some(packet::Payload::DialRequest(request)) = decoded.payload else {
            panic!("expected a dial request");
        };
        assert_eq!(request.protocol, "tcp");
        assert_eq!(request.address, "c1:443");
        assert_eq!(request.random, 7);
    }
}
