//! An in-process radio connecting one broadcaster and one receiver, for tests and the demo.
//!
//! It simulates what the receiver would see on air: advertisement reports while scanning,
//!  periodic sync with group info once per periodic advertising interval, stream connects and
//!  disconnects following the broadcaster's group, and SDUs delivered at the group's pace.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use crate::broadcaster::buffer_pool::TxBuffer;
use crate::broadcaster::credit_pool::CreditToken;
use crate::stream_channel::StreamIndex;
use crate::transport::peer_addr::PeerAddr;
use crate::transport::{adv_props, interval_to_us, reason, AdvertisementReport, AdvertisingParams, BroadcastEventHandler, BroadcastTransport, GroupCreateParams, GroupInfo, GroupSyncParams, PeriodicSyncInfo, PeriodicSyncParams, Phy, ReceiverEvent, ReceiverEventHandler, ReceiverTransport, StreamRecvInfo};

/// AD type 'complete local name'
const AD_TYPE_NAME_COMPLETE: u8 = 0x09;
/// extended advertising, non-connectable and non-scannable
const ADV_TYPE_EXT: u8 = 5;

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// periodic advertising interval in units of 1.25 ms
    pub pa_interval: u16,
    pub scan_report_interval: Duration,
}

impl LoopbackConfig {
    pub fn new() -> LoopbackConfig {
        LoopbackConfig {
            pa_interval: 80,
            scan_report_interval: Duration::from_millis(50),
        }
    }

    fn pa_interval_duration(&self) -> Duration {
        Duration::from_micros(interval_to_us(self.pa_interval) as u64)
    }
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        LoopbackConfig::new()
    }
}


struct Advertising {
    addr: PeerAddr,
    sid: u8,
    data: Bytes,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum JoinState {
    Pending(u8),
    Synced(u8),
}

struct PeriodicSync {
    generation: u64,
    synced: bool,
}

struct Air {
    epoch: Instant,
    broadcaster: Option<Arc<dyn BroadcastEventHandler>>,
    receiver: Option<Arc<dyn ReceiverEventHandler>>,
    advertising: Option<Advertising>,
    announcement_dropped: bool,
    group: Option<GroupCreateParams>,
    scan_generation: u64,
    scanning: bool,
    pa_sync: Option<PeriodicSync>,
    pa_generation: u64,
    join: Option<JoinState>,
}

impl Air {
    fn group_info(&self) -> Option<GroupInfo> {
        let adv = self.advertising.as_ref()?;
        let group = self.group.as_ref()?;
        let sdu_interval_us = group.sdu_interval.as_micros() as u32;
        Some(GroupInfo {
            addr: adv.addr,
            sid: adv.sid,
            num_streams: group.num_streams,
            sub_event_count: group.num_streams,
            iso_interval: (sdu_interval_us / 1250) as u16,
            burst_number: 1,
            offset: 0,
            repetition_count: group.tx_qos.retransmissions + 1,
            max_pdu: group.tx_qos.max_sdu,
            sdu_interval_us,
            max_sdu: group.tx_qos.max_sdu,
            phy: group.tx_qos.phy.into(),
            framing: group.framing,
            encryption: false,
        })
    }

    fn timestamp(&self) -> u32 {
        self.epoch.elapsed().as_micros() as u32
    }
}


/// The shared air between a [LoopbackBroadcaster] and a [LoopbackReceiver]
#[derive(Clone)]
pub struct LoopbackRadio {
    config: Arc<LoopbackConfig>,
    air: Arc<Mutex<Air>>,
}

impl LoopbackRadio {
    pub fn new(config: LoopbackConfig) -> LoopbackRadio {
        LoopbackRadio {
            config: Arc::new(config),
            air: Arc::new(Mutex::new(Air {
                epoch: Instant::now(),
                broadcaster: None,
                receiver: None,
                advertising: None,
                announcement_dropped: false,
                group: None,
                scan_generation: 0,
                scanning: false,
                pa_sync: None,
                pa_generation: 0,
                join: None,
            })),
        }
    }

    pub fn broadcaster(&self) -> LoopbackBroadcaster {
        LoopbackBroadcaster { radio: self.clone() }
    }

    pub fn receiver(&self) -> LoopbackReceiver {
        LoopbackReceiver { radio: self.clone() }
    }

    /// Takes the periodic announcement off the air (or puts it back): scans stop seeing it, and
    ///  an established periodic sync is lost at its next interval. The broadcast group itself is
    ///  not affected.
    pub fn set_announcement_dropped(&self, dropped: bool) {
        debug!("announcement {}", if dropped { "dropped" } else { "restored" });
        self.air().announcement_dropped = dropped;
    }

    fn air(&self) -> MutexGuard<'_, Air> {
        self.air.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_scan(&self, generation: u64) {
        let radio = self.clone();
        tokio::spawn(async move {
            loop {
                sleep(radio.config.scan_report_interval).await;

                let (handler, report) = {
                    let air = radio.air();
                    if !air.scanning || air.scan_generation != generation {
                        return;
                    }
                    let report = match &air.advertising {
                        Some(adv) if !air.announcement_dropped => Some(AdvertisementReport {
                            addr: adv.addr,
                            sid: adv.sid,
                            rssi: -40,
                            tx_power: 127,
                            adv_type: ADV_TYPE_EXT,
                            adv_props: adv_props::EXT_ADV,
                            primary_phy: Phy::Le1M.into(),
                            secondary_phy: Phy::Le2M.into(),
                            interval: radio.config.pa_interval,
                            data: adv.data.clone(),
                        }),
                        _ => None,
                    };
                    (air.receiver.clone(), report)
                };

                if let (Some(handler), Some(report)) = (handler, report) {
                    handler.on_event(ReceiverEvent::AdvertisementReport(report));
                }
            }
        });
    }

    fn spawn_periodic_sync(&self, generation: u64, target: PeerAddr) {
        let radio = self.clone();
        tokio::spawn(async move {
            loop {
                sleep(radio.config.pa_interval_duration()).await;

                let mut events = Vec::new();
                let handler = {
                    let mut air = radio.air();
                    let on_air = !air.announcement_dropped && air.advertising.as_ref().map(|a| a.addr) == Some(target);
                    let group_info = air.group_info();
                    let Some(pa_sync) = air.pa_sync.as_mut().filter(|s| s.generation == generation) else {
                        return;
                    };

                    if !on_air {
                        if pa_sync.synced {
                            air.pa_sync = None;
                            events.push(ReceiverEvent::PeriodicSyncTerminated { addr: target });
                        }
                    }
                    else {
                        if !pa_sync.synced {
                            pa_sync.synced = true;
                            events.push(ReceiverEvent::PeriodicSynced(PeriodicSyncInfo {
                                addr: target,
                                sid: 0,
                                interval: radio.config.pa_interval,
                                phy: Phy::Le2M.into(),
                            }));
                        }
                        if let Some(group_info) = group_info {
                            events.push(ReceiverEvent::GroupInfo(group_info));
                        }
                    }
                    air.receiver.clone()
                };

                let terminated = events.iter().any(|e| matches!(e, ReceiverEvent::PeriodicSyncTerminated { .. }));
                if let Some(handler) = handler {
                    for event in events {
                        handler.on_event(event);
                    }
                }
                if terminated {
                    return;
                }
            }
        });
    }
}


pub struct LoopbackBroadcaster {
    radio: LoopbackRadio,
}

#[async_trait]
impl BroadcastTransport for LoopbackBroadcaster {
    async fn enable(&self, handler: Arc<dyn BroadcastEventHandler>) -> anyhow::Result<()> {
        self.radio.air().broadcaster = Some(handler);
        Ok(())
    }

    async fn start_advertising(&self, params: &AdvertisingParams) -> anyhow::Result<()> {
        let mut air = self.radio.air();
        if air.advertising.is_some() {
            bail!("already advertising");
        }

        let name = params.device_name.as_bytes();
        let Ok(len) = u8::try_from(name.len() + 1) else {
            bail!("device name too long");
        };
        let mut data = vec![len, AD_TYPE_NAME_COMPLETE];
        data.extend_from_slice(name);

        air.advertising = Some(Advertising {
            addr: PeerAddr::random_static(),
            sid: 0,
            data: data.into(),
        });
        Ok(())
    }

    async fn create_group(&self, params: &GroupCreateParams) -> anyhow::Result<()> {
        let (broadcaster, receiver, receiver_streams) = {
            let mut air = self.radio.air();
            if air.advertising.is_none() {
                bail!("no periodic advertising to anchor the group to");
            }
            if air.group.is_some() {
                bail!("broadcast group exists");
            }
            air.group = Some(params.clone());

            let receiver_streams = match air.join {
                Some(JoinState::Pending(n)) => {
                    let n = n.min(params.num_streams);
                    air.join = Some(JoinState::Synced(n));
                    n
                }
                _ => 0,
            };
            (air.broadcaster.clone(), air.receiver.clone(), receiver_streams)
        };

        if let Some(broadcaster) = broadcaster {
            for stream in StreamIndex::all(params.num_streams) {
                broadcaster.on_connected(stream);
            }
        }
        if let Some(receiver) = receiver {
            for stream in StreamIndex::all(receiver_streams) {
                receiver.on_event(ReceiverEvent::StreamConnected { stream });
            }
        }
        Ok(())
    }

    async fn terminate_group(&self) -> anyhow::Result<()> {
        let (num_streams, broadcaster, receiver, receiver_streams) = {
            let mut air = self.radio.air();
            let Some(group) = air.group.take() else {
                bail!("no broadcast group");
            };
            let receiver_streams = match air.join {
                Some(JoinState::Synced(n)) => {
                    air.join = None;
                    n
                }
                _ => 0,
            };
            (group.num_streams, air.broadcaster.clone(), air.receiver.clone(), receiver_streams)
        };

        if let Some(receiver) = receiver {
            for stream in StreamIndex::all(receiver_streams) {
                receiver.on_event(ReceiverEvent::StreamDisconnected { stream, reason: reason::REMOTE_USER_TERMINATED });
            }
        }
        if let Some(broadcaster) = broadcaster {
            for stream in StreamIndex::all(num_streams) {
                broadcaster.on_disconnected(stream, reason::LOCAL_HOST_TERMINATED);
            }
        }
        Ok(())
    }

    async fn send(&self, stream: StreamIndex, buffer: TxBuffer, seq_num: u16, credit: CreditToken) -> anyhow::Result<()> {
        let slot_duration = {
            let air = self.radio.air();
            let Some(group) = air.group.as_ref() else {
                bail!("no broadcast group");
            };
            if stream.0 >= group.num_streams {
                bail!("stream {} is not part of the group", stream);
            }
            group.sdu_interval / group.num_streams as u32
        };

        let radio = self.radio.clone();
        tokio::spawn(async move {
            sleep(slot_duration).await;

            let (broadcaster, receiver, info) = {
                let air = radio.air();
                let receiver = match air.join {
                    Some(JoinState::Synced(n)) if stream.0 < n => air.receiver.clone(),
                    _ => None,
                };
                let info = StreamRecvInfo { flags: 0, seq_num, timestamp: air.timestamp() };
                (air.broadcaster.clone(), receiver, info)
            };

            if let Some(receiver) = receiver {
                receiver.on_event(ReceiverEvent::StreamData {
                    stream,
                    info,
                    payload: Bytes::copy_from_slice(&buffer),
                });
            }
            trace!("sent SDU #{} on stream {}", seq_num, stream);
            drop(buffer);
            if let Some(broadcaster) = broadcaster {
                broadcaster.on_sent(stream, credit);
            }
        });
        Ok(())
    }
}


pub struct LoopbackReceiver {
    radio: LoopbackRadio,
}

#[async_trait]
impl ReceiverTransport for LoopbackReceiver {
    async fn enable(&self, handler: Arc<dyn ReceiverEventHandler>) -> anyhow::Result<()> {
        self.radio.air().receiver = Some(handler);
        Ok(())
    }

    async fn start_scan(&self) -> anyhow::Result<()> {
        let generation = {
            let mut air = self.radio.air();
            if air.scanning {
                bail!("already scanning");
            }
            air.scanning = true;
            air.scan_generation += 1;
            air.scan_generation
        };
        self.radio.spawn_scan(generation);
        Ok(())
    }

    async fn stop_scan(&self) -> anyhow::Result<()> {
        let mut air = self.radio.air();
        if !air.scanning {
            bail!("not scanning");
        }
        air.scanning = false;
        Ok(())
    }

    async fn create_periodic_sync(&self, params: &PeriodicSyncParams) -> anyhow::Result<()> {
        let generation = {
            let mut air = self.radio.air();
            if air.pa_sync.is_some() {
                bail!("periodic sync exists");
            }
            air.pa_generation += 1;
            let generation = air.pa_generation;
            air.pa_sync = Some(PeriodicSync { generation, synced: false });
            generation
        };
        self.radio.spawn_periodic_sync(generation, params.addr);
        Ok(())
    }

    async fn delete_periodic_sync(&self) -> anyhow::Result<()> {
        self.radio.air().pa_sync = None;
        Ok(())
    }

    async fn join_group(&self, params: &GroupSyncParams) -> anyhow::Result<()> {
        if params.num_streams > params.group_info.num_streams {
            bail!("joining {} streams of a group with {} streams", params.num_streams, params.group_info.num_streams);
        }

        let (receiver, num_connected) = {
            let mut air = self.radio.air();
            if air.join.is_some() {
                bail!("group sync exists");
            }
            let num_connected = match air.group.as_ref() {
                Some(group) => {
                    let n = params.num_streams.min(group.num_streams);
                    air.join = Some(JoinState::Synced(n));
                    n
                }
                None => {
                    air.join = Some(JoinState::Pending(params.num_streams));
                    0
                }
            };
            (air.receiver.clone(), num_connected)
        };

        if let Some(receiver) = receiver {
            for stream in StreamIndex::all(num_connected) {
                receiver.on_event(ReceiverEvent::StreamConnected { stream });
            }
        }
        Ok(())
    }

    async fn terminate_group_sync(&self) -> anyhow::Result<()> {
        let (receiver, num_synced) = {
            let mut air = self.radio.air();
            let num_synced = match air.join.take() {
                Some(JoinState::Synced(n)) => n,
                Some(JoinState::Pending(_)) => 0,
                None => {
                    debug!("group sync was already lost");
                    0
                }
            };
            (air.receiver.clone(), num_synced)
        };

        if let Some(receiver) = receiver {
            for stream in StreamIndex::all(num_synced) {
                receiver.on_event(ReceiverEvent::StreamDisconnected { stream, reason: reason::OP_CANCELLED_BY_HOST });
            }
        }
        Ok(())
    }
}
