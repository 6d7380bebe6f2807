//! # voipcorr-calltable-core
//!
//! Session correlation for passive VoIP capture.
//!
//! Every signaling message, media packet and ISUP message seen on the wire is
//! routed to the session it belongs to. The [`Calltable`] keeps the indexes
//! that make that possible:
//!
//! - SIP calls, registrations and merge-leg aliases by Call-ID
//! - Skinny calls by party id and station/manager address pair
//! - announced media endpoints by IP:port, so RTP and RTCP can be matched to
//!   the session whose SDP announced them
//! - SS7 circuits by CIC and point codes
//!
//! Sessions age out on capture time, not wall time. The sweep retires
//! anything whose deadline or inactivity timeout elapsed and hands it to the
//! persistence and audio queues; a session is destroyed only once no
//! in-flight work references it.
//!
//! ## Quick Start
//!
//! ```rust
//! use voipcorr_calltable_core::prelude::*;
//!
//! let table = Calltable::new(CalltableConfig::default());
//! let invite = SignalingPacket::request(
//!     SipMethod::Invite,
//!     "a84b4c76e66710",
//!     "10.0.0.1:5060".parse().unwrap(),
//!     "10.0.0.2:5060".parse().unwrap(),
//!     PacketTime::from_secs(1_700_000_000),
//! );
//! let call = table.process_signaling(&invite).unwrap();
//! assert_eq!(call.kind(), CallKind::Invite);
//! ```
//!
//! Background sweeping, persistence and destruction run in
//! [`CalltableWorkers`].

pub mod call;
pub mod calltable;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod index;
pub mod lock;
pub mod logging;
pub mod packet;
pub mod persist;
pub mod queue;
pub mod ss7;
pub mod stats;
pub mod time;
pub mod workers;

pub use call::{Call, CallHandle, RetireReason, SinkKind};
pub use calltable::Calltable;
pub use config::CalltableConfig;
pub use error::{CalltableError, Result};
pub use packet::{CallKind, MediaPacket, Role, SignalingPacket};
pub use ss7::{IsupMessage, Ss7Id, Ss7Status};
pub use stats::CalltableStats;
pub use time::PacketTime;
pub use workers::{CalltableSinks, CalltableWorkers};

pub mod prelude {
    //! Common imports for capture pipelines

    pub use crate::call::{
        BindOutcome, BindingRequest, Call, CallHandle, FlowDirection, RetireReason, SinkKind, StreamOutcome,
        StreamSelection,
    };
    pub use crate::calltable::Calltable;
    pub use crate::config::CalltableConfig;
    pub use crate::error::{CalltableError, Result};
    pub use crate::logging::{LoggingConfig, session_span, setup_logging};
    pub use crate::packet::{
        CallKind, MediaPacket, Role, SdpInfo, SdpMedia, SignalingPacket, SipMessage, SipMethod, SkinnyIpTuple,
    };
    pub use crate::persist::{AudioSink, FileSink, JsonLinesSink, MemorySink, PersistRecord, PersistSink};
    pub use crate::ss7::{IsupMessage, IsupMessageType, Ss7Id, Ss7Status};
    pub use crate::time::PacketTime;
    pub use crate::workers::{CalltableSinks, CalltableWorkers};
}

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
