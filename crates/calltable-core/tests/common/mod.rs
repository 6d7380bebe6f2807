// Shared packet builders for the integration tests

#![allow(dead_code)]

use std::net::{IpAddr, SocketAddr};

use voipcorr_calltable_core::packet::{SdpInfo, SdpMedia, SignalingPacket, SipMethod};
use voipcorr_calltable_core::{MediaPacket, PacketTime};

pub const CALLER_SIP: &str = "10.0.0.1:5060";
pub const CALLEE_SIP: &str = "10.0.0.2:5060";

pub fn sock(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn at(secs: u64) -> PacketTime {
    PacketTime::from_secs(secs)
}

pub fn request(method: SipMethod, call_id: &str, secs: u64) -> SignalingPacket {
    SignalingPacket::request(method, call_id.to_string(), sock(CALLER_SIP), sock(CALLEE_SIP), at(secs))
}

pub fn response(code: u16, method: SipMethod, call_id: &str, secs: u64) -> SignalingPacket {
    SignalingPacket::response(code, method, call_id.to_string(), sock(CALLEE_SIP), sock(CALLER_SIP), at(secs))
}

pub fn sdp(addr: &str, port: u16) -> SdpInfo {
    SdpInfo {
        session_id: "4711".into(),
        leg: String::new(),
        media: vec![SdpMedia::new(ip(addr), port)],
    }
}

pub fn invite_with_sdp(call_id: &str, secs: u64, media: &str, port: u16) -> SignalingPacket {
    request(SipMethod::Invite, call_id, secs).with_sdp(sdp(media, port))
}

pub fn rtp(src: &str, dst: &str, ssrc: u32, seq: u16, secs: u64) -> MediaPacket {
    MediaPacket::rtp(sock(src), sock(dst), ssrc, seq, 0, at(secs))
}
