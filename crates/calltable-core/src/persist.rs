//! Finalized session records and the sinks that consume them
//!
//! The registry never talks to a database, an audio converter or the spool
//! directly. Retired sessions are queued, and the workers hand them to the
//! sinks below. Records are built from a session that no longer receives
//! packets, so building one twice yields the same rows.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::call::selection::select_streams;
use crate::call::{Call, CallHandle, RetireReason, SetupPhase, SpoolPositions, StreamSelection, TeardownPhase};
use crate::config::SelectionConfig;
use crate::error::{CalltableError, Result};
use crate::packet::{CallKind, Role};
use crate::ss7::{Ss7, Ss7Status};
use crate::time::PacketTime;

/// One call, registration or message record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CdrRow {
    pub serial: u64,
    pub call_id: String,
    pub kind: CallKind,
    pub caller: Option<String>,
    pub called: Option<String>,
    pub sip_caller_addr: Option<IpAddr>,
    pub sip_called_addr: Option<IpAddr>,
    pub caller_ua: Option<String>,
    pub callee_ua: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub connect_at: Option<DateTime<Utc>>,
    pub teardown_at: Option<DateTime<Utc>>,
    pub last_packet_at: Option<DateTime<Utc>>,
    pub duration: u64,
    pub connect_duration: u64,
    pub last_response_code: u16,
    pub last_response_text: Option<String>,
    pub who_hung_up: Option<Role>,
    pub reason_sip_cause: Option<u16>,
    pub reason_sip_text: Option<String>,
    pub reason_q850_cause: Option<u16>,
    pub reason_q850_text: Option<String>,
    pub setup_phase: SetupPhase,
    pub teardown_phase: TeardownPhase,
    pub unconfirmed_teardown: bool,
    pub retire_reason: Option<RetireReason>,
    pub degraded: bool,
    pub dropped_bindings: u32,
    pub dropped_streams: u32,
    pub concurrent_streams: bool,
    pub merge_legs: Vec<String>,
    pub skinny_party_id: Option<u32>,
    pub proxies: Vec<IpAddr>,
    pub spool: SpoolPositions,
}

/// One media stream of a call record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RtpStreamRow {
    pub index: usize,
    pub ssrc: u32,
    pub role: Role,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload_type: u8,
    pub first_at: Option<DateTime<Utc>>,
    pub last_at: Option<DateTime<Utc>>,
    pub packets: u64,
    pub bytes: u64,
    pub seq_gaps: u64,
    pub rtcp_packets: u64,
    pub selected: bool,
    pub concurrent: bool,
}

/// One circuit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ss7Row {
    pub serial: u64,
    pub id: String,
    pub status: Ss7Status,
    pub last_message: Option<String>,
    pub iam_at: Option<DateTime<Utc>>,
    pub acm_at: Option<DateTime<Utc>>,
    pub cpg_at: Option<DateTime<Utc>>,
    pub anm_at: Option<DateTime<Utc>>,
    pub rel_at: Option<DateTime<Utc>>,
    pub rlc_at: Option<DateTime<Utc>>,
    pub release_cause: Option<u16>,
    pub opc: Option<u32>,
    pub dpc: Option<u32>,
    pub calling: Option<String>,
    pub called: Option<String>,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum PersistRecord {
    Call { cdr: CdrRow, streams: Vec<RtpStreamRow> },
    Circuit(Ss7Row),
}

impl PersistRecord {
    pub fn serial(&self) -> u64 {
        match self {
            PersistRecord::Call { cdr, .. } => cdr.serial,
            PersistRecord::Circuit(row) => row.serial,
        }
    }
}

fn wall(time: Option<PacketTime>) -> Option<DateTime<Utc>> {
    time.and_then(|t| t.to_datetime())
}

/// Streams the audio pipeline and the persisted record treat as the call's
/// audio
pub fn stream_selection(call: &Call, config: &SelectionConfig) -> StreamSelection {
    let data = call.lock();
    select_streams(
        &data.streams,
        &data.bindings,
        [data.sip_addrs[0].as_slice(), data.sip_addrs[1].as_slice()],
        config,
    )
}

/// Build the persisted rows of a retired session
pub fn serialize_for_persist(call: &Call, selection_config: &SelectionConfig) -> PersistRecord {
    let selection = stream_selection(call, selection_config);
    let proxies = call.proxies();
    let teardown_at = call.teardown_complete_at();
    let duration = call.duration();
    let connect_duration = call.connect_duration();

    let data = call.lock();
    let last_response = data.last_response();
    let cdr = CdrRow {
        serial: call.serial(),
        call_id: String::from_utf8_lossy(call.call_id()).into_owned(),
        kind: call.kind(),
        caller: data.caller.clone(),
        called: data.called.clone(),
        sip_caller_addr: data.sip_addrs[Role::Caller.index()].first().copied(),
        sip_called_addr: data.sip_addrs[Role::Callee.index()].last().copied(),
        caller_ua: data.user_agents[Role::Caller.index()].clone(),
        callee_ua: data.user_agents[Role::Callee.index()].clone(),
        created_at: call.created_at().to_datetime(),
        connect_at: wall(data.protocol.final_success_at),
        teardown_at: wall(teardown_at),
        last_packet_at: data.last_packet.to_datetime(),
        duration,
        connect_duration,
        last_response_code: data.protocol.last_response_code,
        last_response_text: last_response.and_then(|r| r.text.clone()),
        who_hung_up: data.who_hung_up,
        reason_sip_cause: data.reason_sip.as_ref().map(|r| r.cause),
        reason_sip_text: data.reason_sip.as_ref().map(|r| r.text.clone()),
        reason_q850_cause: data.reason_q850.as_ref().map(|r| r.cause),
        reason_q850_text: data.reason_q850.as_ref().map(|r| r.text.clone()),
        setup_phase: data.protocol.setup_phase(),
        teardown_phase: data.protocol.teardown_phase(),
        unconfirmed_teardown: data.protocol.unconfirmed_teardown,
        retire_reason: data.retired,
        degraded: data.degraded,
        dropped_bindings: data.bindings.dropped(),
        dropped_streams: data.dropped_streams,
        concurrent_streams: selection.has_concurrent(),
        merge_legs: data
            .merge
            .leg_ids()
            .map(|id| String::from_utf8_lossy(id).into_owned())
            .collect(),
        skinny_party_id: data.skinny_party_id,
        proxies,
        spool: data.spool.clone(),
    };
    let streams = data
        .streams
        .iter()
        .enumerate()
        .map(|(index, s)| RtpStreamRow {
            index,
            ssrc: s.ssrc,
            role: s.role,
            src: s.src,
            dst: s.dst,
            payload_type: s.payload_type,
            first_at: s.first_seen.to_datetime(),
            last_at: s.last_seen.to_datetime(),
            packets: s.packets,
            bytes: s.bytes,
            seq_gaps: s.seq_gaps,
            rtcp_packets: s.rtcp_packets,
            selected: selection.is_selected(index),
            concurrent: selection.concurrent.contains(&index),
        })
        .collect();
    PersistRecord::Call { cdr, streams }
}

/// Build the persisted row of a finished circuit
pub fn serialize_circuit(circuit: &Ss7) -> PersistRecord {
    let ts = &circuit.timestamps;
    PersistRecord::Circuit(Ss7Row {
        serial: circuit.serial,
        id: circuit.id.to_string(),
        status: circuit.status(),
        last_message: circuit.last_message.map(|m| m.as_str().to_string()),
        iam_at: wall(ts.iam),
        acm_at: wall(ts.acm),
        cpg_at: wall(ts.cpg),
        anm_at: wall(ts.anm),
        rel_at: wall(ts.rel),
        rlc_at: wall(ts.rlc),
        release_cause: circuit.release_cause,
        opc: circuit.opc,
        dpc: circuit.dpc,
        calling: circuit.calling.clone(),
        called: circuit.called.clone(),
        filename: circuit.filename(),
    })
}

/// Media of a retired call handed to the audio pipeline. Holds the session
/// (and one unit of outstanding work) until the job is dropped.
#[derive(Debug)]
pub struct AudioJob {
    pub call: CallHandle,
    pub selection: StreamSelection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpoolFileKind {
    Pcap,
    SipPcap,
    RtpPcap,
    Graph,
    Audio,
}

/// A spool file closed by a writer, for size and retention bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileJob {
    pub kind: SpoolFileKind,
    pub path: PathBuf,
    pub bytes: u64,
    pub serial: Option<u64>,
}

#[async_trait]
pub trait PersistSink: Send + Sync {
    async fn save(&self, record: PersistRecord) -> Result<()>;
}

#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn convert(&self, job: AudioJob) -> Result<()>;
}

#[async_trait]
pub trait FileSink: Send + Sync {
    async fn record(&self, job: FileJob) -> Result<()>;
}

/// Sink that keeps everything in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<PersistRecord>>,
    audio: Mutex<Vec<(u64, StreamSelection)>>,
    files: Mutex<Vec<FileJob>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PersistRecord> {
        self.records.lock().clone()
    }

    /// Serial and selection of every converted call
    pub fn audio_jobs(&self) -> Vec<(u64, StreamSelection)> {
        self.audio.lock().clone()
    }

    pub fn files(&self) -> Vec<FileJob> {
        self.files.lock().clone()
    }
}

#[async_trait]
impl PersistSink for MemorySink {
    async fn save(&self, record: PersistRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

#[async_trait]
impl AudioSink for MemorySink {
    async fn convert(&self, job: AudioJob) -> Result<()> {
        self.audio.lock().push((job.call.serial(), job.selection));
        Ok(())
    }
}

#[async_trait]
impl FileSink for MemorySink {
    async fn record(&self, job: FileJob) -> Result<()> {
        self.files.lock().push(job);
        Ok(())
    }
}

/// Persist sink appending one JSON document per record
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonLinesSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PersistSink for JsonLinesSink {
    async fn save(&self, record: PersistRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .map_err(|e| CalltableError::sink("json-lines", e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| CalltableError::sink("json-lines", e.to_string()))
    }
}
