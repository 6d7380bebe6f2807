//! Parsed packet records consumed from the capture/parsing stage
//!
//! The engine never touches wire formats. The parser hands over these
//! already-decoded records: signaling (SIP, Skinny converted to the same
//! shape), media (RTP/RTCP headers), and ISUP (see [`crate::ss7`]).

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::time::PacketTime;

/// Session kind, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    /// INVITE dialog
    Invite,
    /// REGISTER transaction chain
    Register,
    /// SIP MESSAGE
    Message,
    /// Proprietary signaling (Skinny)
    Skinny,
}

impl CallKind {
    pub fn is_registration(&self) -> bool {
        matches!(self, CallKind::Register)
    }
}

/// Side of the call a packet or endpoint belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Caller,
    Callee,
}

impl Role {
    pub fn index(&self) -> usize {
        match self {
            Role::Caller => 0,
            Role::Callee => 1,
        }
    }

    pub fn opposite(&self) -> Role {
        match self {
            Role::Caller => Role::Callee,
            Role::Callee => Role::Caller,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Caller => write!(f, "caller"),
            Role::Callee => write!(f, "callee"),
        }
    }
}

/// Station / call-manager address pair of a Skinny call, stored in
/// ascending order so both directions map to the same key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SkinnyIpTuple {
    pub low: IpAddr,
    pub high: IpAddr,
}

impl SkinnyIpTuple {
    pub fn new(a: IpAddr, b: IpAddr) -> Self {
        Self {
            low: a.min(b),
            high: a.max(b),
        }
    }
}

/// Session-description flags captured when an endpoint is bound
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SdpFlags {
    pub is_fax: bool,
    pub rtcp_mux: bool,
}

/// SIP request methods the engine distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Message,
    Info,
    Subscribe,
    Options,
    Notify,
    Prack,
    Publish,
    Refer,
    Update,
}

impl SipMethod {
    /// Kind of session a request with no existing session would create
    pub fn creates(&self) -> Option<CallKind> {
        match self {
            SipMethod::Invite => Some(CallKind::Invite),
            SipMethod::Register => Some(CallKind::Register),
            SipMethod::Message => Some(CallKind::Message),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Register => "REGISTER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Info => "INFO",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Prack => "PRACK",
            SipMethod::Publish => "PUBLISH",
            SipMethod::Refer => "REFER",
            SipMethod::Update => "UPDATE",
        }
    }
}

/// Request or response line of a signaling message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SipMessage {
    Request(SipMethod),
    Response {
        code: u16,
        /// Method from the CSeq header, i.e. the request being answered
        cseq_method: SipMethod,
    },
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn response_code(&self) -> Option<u16> {
        match self {
            SipMessage::Response { code, .. } => Some(*code),
            SipMessage::Request(_) => None,
        }
    }
}

/// Protocol of a Reason header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonProtocol {
    Sip,
    Q850,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonHeader {
    pub protocol: ReasonProtocol,
    pub cause: u16,
    pub text: String,
}

/// One negotiated media line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpMedia {
    pub addr: IpAddr,
    pub port: u16,
    /// Payload types offered on this line (rtpmap)
    pub codecs: Vec<u8>,
    pub flags: SdpFlags,
}

impl SdpMedia {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self {
            addr,
            port,
            codecs: Vec::new(),
            flags: SdpFlags::default(),
        }
    }

    pub fn with_codecs(mut self, codecs: Vec<u8>) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_flags(mut self, flags: SdpFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Session description carried in a signaling message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpInfo {
    /// `o=` session id; identical ids with different endpoints mean renegotiation
    pub session_id: String,
    /// To-tag/leg discriminator paired with the session id (forked legs differ)
    pub leg: String,
    pub media: Vec<SdpMedia>,
}

/// Parsed signaling packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingPacket {
    pub time: PacketTime,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub message: SipMessage,
    pub call_id: Bytes,
    /// Call-ids of the primary session this leg folds into, from the
    /// external correlation header
    pub merge_ids: Vec<Bytes>,
    pub caller: Option<String>,
    pub called: Option<String>,
    pub user_agent: Option<String>,
    pub response_text: Option<String>,
    pub reason: Option<ReasonHeader>,
    pub sdp: Option<SdpInfo>,
}

impl SignalingPacket {
    fn new(message: SipMessage, call_id: impl Into<Bytes>, src: SocketAddr, dst: SocketAddr, time: PacketTime) -> Self {
        Self {
            time,
            src,
            dst,
            message,
            call_id: call_id.into(),
            merge_ids: Vec::new(),
            caller: None,
            called: None,
            user_agent: None,
            response_text: None,
            reason: None,
            sdp: None,
        }
    }

    pub fn request(
        method: SipMethod,
        call_id: impl Into<Bytes>,
        src: SocketAddr,
        dst: SocketAddr,
        time: PacketTime,
    ) -> Self {
        Self::new(SipMessage::Request(method), call_id, src, dst, time)
    }

    pub fn response(
        code: u16,
        cseq_method: SipMethod,
        call_id: impl Into<Bytes>,
        src: SocketAddr,
        dst: SocketAddr,
        time: PacketTime,
    ) -> Self {
        Self::new(SipMessage::Response { code, cseq_method }, call_id, src, dst, time)
    }

    pub fn with_sdp(mut self, sdp: SdpInfo) -> Self {
        self.sdp = Some(sdp);
        self
    }

    pub fn with_merge_ids(mut self, ids: Vec<Bytes>) -> Self {
        self.merge_ids = ids;
        self
    }

    pub fn with_parties(mut self, caller: impl Into<String>, called: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self.called = Some(called.into());
        self
    }

    pub fn with_response_text(mut self, text: impl Into<String>) -> Self {
        self.response_text = Some(text.into());
        self
    }

    pub fn with_reason(mut self, reason: ReasonHeader) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }
}

/// Parsed RTP or RTCP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaPacket {
    pub time: PacketTime,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub ssrc: u32,
    pub seq: u16,
    pub payload_type: u8,
    pub is_rtcp: bool,
    pub payload_len: u32,
}

impl MediaPacket {
    pub fn rtp(src: SocketAddr, dst: SocketAddr, ssrc: u32, seq: u16, payload_type: u8, time: PacketTime) -> Self {
        Self {
            time,
            src,
            dst,
            ssrc,
            seq,
            payload_type,
            is_rtcp: false,
            payload_len: 160,
        }
    }

    pub fn rtcp(src: SocketAddr, dst: SocketAddr, ssrc: u32, time: PacketTime) -> Self {
        Self {
            time,
            src,
            dst,
            ssrc,
            seq: 0,
            payload_type: 0,
            is_rtcp: true,
            payload_len: 0,
        }
    }
}
