//! ISUP circuit sessions
//!
//! Circuit-switched calls have no call identifier. They are keyed by the
//! circuit identification code plus the two signaling point codes, ordered
//! so both directions of the circuit map to the same key. The status is not
//! stored: it is derived from which milestone timestamps are set, which keeps
//! it correct under out-of-order or partial message capture.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::time::PacketTime;

/// Q.850 cause "normal call clearing"
pub const CAUSE_NORMAL_CLEARING: u16 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsupMessageType {
    /// Initial address
    Iam,
    /// Address complete
    Acm,
    /// Call progress
    Cpg,
    /// Answer
    Anm,
    /// Release
    Rel,
    /// Release complete
    Rlc,
}

impl IsupMessageType {
    /// Message type from the ISUP message type code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Iam),
            6 => Some(Self::Acm),
            44 => Some(Self::Cpg),
            9 => Some(Self::Anm),
            12 => Some(Self::Rel),
            16 => Some(Self::Rlc),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Iam => 1,
            Self::Acm => 6,
            Self::Cpg => 44,
            Self::Anm => 9,
            Self::Rel => 12,
            Self::Rlc => 16,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Iam => "iam",
            Self::Acm => "acm",
            Self::Cpg => "cpg",
            Self::Anm => "anm",
            Self::Rel => "rel",
            Self::Rlc => "rlc",
        }
    }
}

/// Parsed ISUP message. Point codes from the M3UA protocol data take
/// precedence over the MTP3 routing label when both are present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsupMessage {
    pub time: PacketTime,
    pub message_type: IsupMessageType,
    pub cic: u32,
    pub m3ua_opc: Option<u32>,
    pub m3ua_dpc: Option<u32>,
    pub mtp3_opc: Option<u32>,
    pub mtp3_dpc: Option<u32>,
    pub calling: Option<String>,
    pub called: Option<String>,
    pub cause: Option<u16>,
    pub src: Option<IpAddr>,
    pub dst: Option<IpAddr>,
}

impl IsupMessage {
    pub fn new(message_type: IsupMessageType, cic: u32, opc: u32, dpc: u32, time: PacketTime) -> Self {
        Self {
            time,
            message_type,
            cic,
            m3ua_opc: None,
            m3ua_dpc: None,
            mtp3_opc: Some(opc),
            mtp3_dpc: Some(dpc),
            calling: None,
            called: None,
            cause: None,
            src: None,
            dst: None,
        }
    }

    pub fn with_m3ua(mut self, opc: u32, dpc: u32) -> Self {
        self.m3ua_opc = Some(opc);
        self.m3ua_dpc = Some(dpc);
        self
    }

    pub fn with_numbers(mut self, calling: impl Into<String>, called: impl Into<String>) -> Self {
        self.calling = Some(calling.into());
        self.called = Some(called.into());
        self
    }

    pub fn with_cause(mut self, cause: u16) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_addresses(mut self, src: IpAddr, dst: IpAddr) -> Self {
        self.src = Some(src);
        self.dst = Some(dst);
        self
    }

    pub fn opc(&self) -> Option<u32> {
        self.m3ua_opc.or(self.mtp3_opc)
    }

    pub fn dpc(&self) -> Option<u32> {
        self.m3ua_dpc.or(self.mtp3_dpc)
    }

    /// Circuit key, `None` when a point code is missing
    pub fn circuit_id(&self) -> Option<Ss7Id> {
        Some(Ss7Id::new(self.cic, self.opc()?, self.dpc()?))
    }
}

/// Direction-independent circuit key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ss7Id {
    pub cic: u32,
    pub low_point: u32,
    pub high_point: u32,
}

impl Ss7Id {
    pub fn new(cic: u32, opc: u32, dpc: u32) -> Self {
        Self {
            cic,
            low_point: opc.min(dpc),
            high_point: opc.max(dpc),
        }
    }
}

impl fmt::Display for Ss7Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.cic, self.low_point, self.high_point)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ss7Status {
    CallSetup,
    InCall,
    Completed,
    Rejected,
    Canceled,
}

impl Ss7Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CallSetup => "call_setup",
            Self::InCall => "in_call",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Canceled => "canceled",
        }
    }
}

/// First-occurrence time of each milestone message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Ss7Timestamps {
    pub iam: Option<PacketTime>,
    pub acm: Option<PacketTime>,
    pub cpg: Option<PacketTime>,
    pub anm: Option<PacketTime>,
    pub rel: Option<PacketTime>,
    pub rlc: Option<PacketTime>,
}

impl Ss7Timestamps {
    fn slot(&mut self, message_type: IsupMessageType) -> &mut Option<PacketTime> {
        match message_type {
            IsupMessageType::Iam => &mut self.iam,
            IsupMessageType::Acm => &mut self.acm,
            IsupMessageType::Cpg => &mut self.cpg,
            IsupMessageType::Anm => &mut self.anm,
            IsupMessageType::Rel => &mut self.rel,
            IsupMessageType::Rlc => &mut self.rlc,
        }
    }

    /// Status as a function of which milestones are set
    pub fn status(&self, release_cause: Option<u16>) -> Ss7Status {
        match (self.rel.is_some(), self.anm.is_some()) {
            (true, true) => Ss7Status::Completed,
            (true, false) if release_cause == Some(CAUSE_NORMAL_CLEARING) => Ss7Status::Canceled,
            (true, false) => Ss7Status::Rejected,
            (false, true) => Ss7Status::InCall,
            (false, false) => Ss7Status::CallSetup,
        }
    }
}

/// Circuit session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ss7 {
    pub id: Ss7Id,
    pub serial: u64,
    pub timestamps: Ss7Timestamps,
    pub release_cause: Option<u16>,
    pub last_message: Option<IsupMessageType>,
    pub last_time: PacketTime,
    pub first_time: PacketTime,
    pub messages: u32,
    /// Point codes in the direction of the IAM
    pub opc: Option<u32>,
    pub dpc: Option<u32>,
    pub calling: Option<String>,
    pub called: Option<String>,
    pub iam_src: Option<IpAddr>,
    pub iam_dst: Option<IpAddr>,
}

impl Ss7 {
    pub fn new(id: Ss7Id, serial: u64, time: PacketTime) -> Self {
        Self {
            id,
            serial,
            timestamps: Ss7Timestamps::default(),
            release_cause: None,
            last_message: None,
            last_time: time,
            first_time: time,
            messages: 0,
            opc: None,
            dpc: None,
            calling: None,
            called: None,
            iam_src: None,
            iam_dst: None,
        }
    }

    /// Apply one message and return the resulting status. Repeated messages
    /// keep the first timestamp.
    pub fn process_message(&mut self, message: &IsupMessage) -> Ss7Status {
        self.timestamps.slot(message.message_type).get_or_insert(message.time);
        match message.message_type {
            IsupMessageType::Iam if self.opc.is_none() => {
                self.opc = message.opc();
                self.dpc = message.dpc();
                self.calling = message.calling.clone();
                self.called = message.called.clone();
                self.iam_src = message.src;
                self.iam_dst = message.dst;
            }
            IsupMessageType::Rel if self.release_cause.is_none() => {
                self.release_cause = message.cause;
            }
            _ => {}
        }
        if message.time < self.first_time {
            self.first_time = message.time;
        }
        if message.time > self.last_time {
            self.last_time = message.time;
        }
        self.last_message = Some(message.message_type);
        self.messages += 1;
        self.status()
    }

    pub fn status(&self) -> Ss7Status {
        self.timestamps.status(self.release_cause)
    }

    /// Release or release-complete seen
    pub fn is_finished(&self) -> bool {
        self.timestamps.rel.is_some() || self.timestamps.rlc.is_some()
    }

    pub fn is_idle(&self, now: u64, timeout: u64) -> bool {
        self.last_time.secs.saturating_add(timeout) <= now
    }

    /// Spool file base name: IAM time, circuit, point codes and numbers
    pub fn filename(&self) -> String {
        let started = self.timestamps.iam.unwrap_or(self.first_time);
        format!(
            "{}-{}-{}-{}-{}-{}",
            started.as_micros(),
            self.id.cic,
            self.opc.unwrap_or(self.id.low_point),
            self.dpc.unwrap_or(self.id.high_point),
            self.calling.as_deref().unwrap_or_default(),
            self.called.as_deref().unwrap_or_default(),
        )
    }
}
