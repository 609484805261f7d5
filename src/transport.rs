pub mod loopback;
pub mod peer_addr;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::broadcaster::buffer_pool::TxBuffer;
use crate::broadcaster::credit_pool::CreditToken;
use crate::stream_channel::StreamIndex;
use crate::transport::peer_addr::PeerAddr;


/// Disconnect reason codes this crate acts on
pub mod reason {
    pub const REMOTE_USER_TERMINATED: u8 = 0x13;
    pub const LOCAL_HOST_TERMINATED: u8 = 0x16;
    /// the local host tore down the group sync itself - not a loss signal
    pub const OP_CANCELLED_BY_HOST: u8 = 0x44;
}

/// Advertising property bits of an [AdvertisementReport]
pub mod adv_props {
    pub const CONNECTABLE: u16 = 1 << 0;
    pub const SCANNABLE: u16 = 1 << 1;
    pub const DIRECTED: u16 = 1 << 2;
    pub const SCAN_RESPONSE: u16 = 1 << 3;
    pub const EXT_ADV: u16 = 1 << 4;
}

/// Advertising intervals are reported in units of 1.25 ms
pub fn interval_to_us(interval: u16) -> u32 {
    interval as u32 * 1250
}


#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Phy {
    Le1M = 1,
    Le2M = 2,
    LeCoded = 4,
}

impl Phy {
    pub fn describe(raw: u8) -> &'static str {
        if raw == 0 {
            return "No packets";
        }
        match Phy::try_from(raw) {
            Ok(Phy::Le1M) => "LE 1M",
            Ok(Phy::Le2M) => "LE 2M",
            Ok(Phy::LeCoded) => "LE Coded",
            Err(_) => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Packing {
    Sequential,
    Interleaved,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Framing {
    Unframed,
    Framed,
}


#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AdvertisingParams {
    /// carried as 'complete local name' in the extended advertising data
    pub device_name: String,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StreamTxQos {
    pub max_sdu: u16,
    pub retransmissions: u8,
    pub phy: Phy,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GroupCreateParams {
    pub num_streams: u8,
    pub sdu_interval: Duration,
    pub max_latency: Duration,
    pub packing: Packing,
    pub framing: Framing,
    pub tx_qos: StreamTxQos,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PeriodicSyncParams {
    pub addr: PeerAddr,
    pub sid: u8,
    pub skip: u16,
    /// in units of 10 ms
    pub timeout_10ms: u16,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GroupSyncParams {
    pub num_streams: u8,
    /// bit `n` selects the stream with over-the-air index `n` (which starts at 1)
    pub stream_bitfield: u32,
    /// `None` lets the controller choose
    pub max_subevents: Option<u8>,
    /// in units of 10 ms
    pub sync_timeout_10ms: u16,
    pub group_info: GroupInfo,
}


#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AdvertisementReport {
    pub addr: PeerAddr,
    pub sid: u8,
    pub rssi: i8,
    pub tx_power: i8,
    pub adv_type: u8,
    pub adv_props: u16,
    pub primary_phy: u8,
    pub secondary_phy: u8,
    /// periodic advertising interval in units of 1.25 ms, 0 if there is no periodic advertising
    pub interval: u16,
    /// raw advertising data, a sequence of `len | type | data` structures
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PeriodicSyncInfo {
    pub addr: PeerAddr,
    pub sid: u8,
    /// in units of 1.25 ms
    pub interval: u16,
    pub phy: u8,
}

/// Transport parameters of a broadcast group as announced in the periodic advertising train
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct GroupInfo {
    pub addr: PeerAddr,
    pub sid: u8,
    pub num_streams: u8,
    pub sub_event_count: u8,
    /// in units of 1.25 ms
    pub iso_interval: u16,
    pub burst_number: u8,
    pub offset: u8,
    pub repetition_count: u8,
    pub max_pdu: u16,
    pub sdu_interval_us: u32,
    pub max_sdu: u16,
    pub phy: u8,
    pub framing: Framing,
    pub encryption: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StreamRecvInfo {
    pub flags: u8,
    pub seq_num: u16,
    pub timestamp: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ReceiverEvent {
    AdvertisementReport(AdvertisementReport),
    PeriodicSynced(PeriodicSyncInfo),
    PeriodicSyncTerminated { addr: PeerAddr },
    PeriodicData { addr: PeerAddr, rssi: i8, tx_power: i8, data: Bytes },
    GroupInfo(GroupInfo),
    StreamConnected { stream: StreamIndex },
    StreamDisconnected { stream: StreamIndex, reason: u8 },
    StreamData { stream: StreamIndex, info: StreamRecvInfo, payload: Bytes },
}


/// Callbacks a broadcasting transport raises from its own context
pub trait BroadcastEventHandler: Send + Sync {
    fn on_connected(&self, stream: StreamIndex);
    fn on_disconnected(&self, stream: StreamIndex, reason: u8);
    /// a previously submitted SDU left the transport, `credit` is the token it was sent with
    fn on_sent(&self, stream: StreamIndex, credit: CreditToken);
}

/// Callbacks a receiving transport raises from its own context
pub trait ReceiverEventHandler: Send + Sync {
    fn on_event(&self, event: ReceiverEvent);
}


/// The radio stack as seen by the broadcaster role
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BroadcastTransport: Send + Sync + 'static {
    async fn enable(&self, handler: Arc<dyn BroadcastEventHandler>) -> anyhow::Result<()>;

    /// sets up the extended and the periodic advertising the broadcast group is anchored to
    async fn start_advertising(&self, params: &AdvertisingParams) -> anyhow::Result<()>;

    async fn create_group(&self, params: &GroupCreateParams) -> anyhow::Result<()>;
    async fn terminate_group(&self) -> anyhow::Result<()>;

    /// Takes ownership of the buffer - the transport drops it (returning it to its pool) once
    ///  it is done with it. The credit token is handed back exactly once through
    ///  [BroadcastEventHandler::on_sent].
    async fn send(&self, stream: StreamIndex, buffer: TxBuffer, seq_num: u16, credit: CreditToken) -> anyhow::Result<()>;
}

/// The radio stack as seen by the receiver role
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReceiverTransport: Send + Sync + 'static {
    async fn enable(&self, handler: Arc<dyn ReceiverEventHandler>) -> anyhow::Result<()>;

    async fn start_scan(&self) -> anyhow::Result<()>;
    async fn stop_scan(&self) -> anyhow::Result<()>;

    async fn create_periodic_sync(&self, params: &PeriodicSyncParams) -> anyhow::Result<()>;
    async fn delete_periodic_sync(&self) -> anyhow::Result<()>;

    async fn join_group(&self, params: &GroupSyncParams) -> anyhow::Result<()>;
    async fn terminate_group_sync(&self) -> anyhow::Result<()>;
}
