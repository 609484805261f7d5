use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::receiver::discovery::{Discovery, SyncTarget};
use crate::receiver::receiver_config::ReceiverConfig;
use crate::stream_channel::{all_connected, all_disconnected, StreamChannel, StreamIndex};
use crate::transport::{interval_to_us, reason, GroupInfo, GroupSyncParams, PeriodicSyncParams, Phy, ReceiverEvent};

/// The receiver's synchronization phases, in the order a successful run passes through them.
///
/// `CreatePeriodicSync`, `GroupSync` and `SyncLossCheck` are transient: the state machine passes
///  through them while handling a single input, so they are never observed from outside.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SyncPhase {
    Scan,
    CreatePeriodicSync,
    WaitSynced,
    WaitGroupInfo,
    GroupSync,
    WaitAllStreamsSynced,
    Streaming,
    SyncLossCheck,
}

/// Transport requests the state machine issues. They are executed in order by the dispatch
///  loop; any of them failing is fatal.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SyncAction {
    StartScan,
    StopScan,
    CreatePeriodicSync(PeriodicSyncParams),
    DeletePeriodicSync,
    JoinGroup(GroupSyncParams),
    TerminateGroupSync,
}

/// Per-announcement state, from discovery until the state machine restarts with a new scan
#[derive(Debug)]
struct PeriodicSyncSession {
    target: SyncTarget,
    synced: bool,
    /// the transport may report this before the state machine waits for it
    group_info: Option<GroupInfo>,
    sync_lost: bool,
}

impl PeriodicSyncSession {
    fn new(target: SyncTarget) -> PeriodicSyncSession {
        PeriodicSyncSession {
            target,
            synced: false,
            group_info: None,
            sync_lost: false,
        }
    }
}

/// The receiver's layered synchronization protocol as an explicit state machine.
///
/// The machine does no I/O and never reads the clock: every input carries the current time, and
///  the output is the list of transport requests to issue. [SyncStateMachine::deadline] tells the
///  dispatch loop when to call [SyncStateMachine::on_timeout].
pub struct SyncStateMachine {
    config: Arc<ReceiverConfig>,
    phase: SyncPhase,
    deadline: Option<Instant>,
    discovery: Discovery,
    session: Option<PeriodicSyncSession>,
    channels: Vec<StreamChannel>,
    num_scans: u64,
    num_group_joins: u64,
}

impl SyncStateMachine {
    pub fn new(config: Arc<ReceiverConfig>) -> SyncStateMachine {
        let channels = StreamChannel::allocate(config.num_streams);
        SyncStateMachine {
            config,
            phase: SyncPhase::Scan,
            deadline: None,
            discovery: Discovery::new(),
            session: None,
            channels,
            num_scans: 0,
            num_group_joins: 0,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn channels(&self) -> &[StreamChannel] {
        &self.channels
    }

    /// the announcement the current session is bound to
    pub fn sync_target(&self) -> Option<SyncTarget> {
        self.session.as_ref().map(|s| s.target)
    }

    pub fn is_periodic_sync_lost(&self) -> bool {
        self.session.as_ref().map(|s| s.sync_lost).unwrap_or(false)
    }

    /// number of times scanning was started, i.e. one plus the number of full restarts
    pub fn num_scans(&self) -> u64 {
        self.num_scans
    }

    pub fn num_group_joins(&self) -> u64 {
        self.num_group_joins
    }

    /// The initial transition into `Scan`
    pub fn start(&mut self, now: Instant) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        self.enter(SyncPhase::Scan, now, &mut actions);
        actions
    }

    /// Handles a deadline expiry. Calls before the deadline are ignored.
    pub fn on_timeout(&mut self, now: Instant) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        match self.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return actions,
        }
        self.deadline = None;

        match self.phase {
            SyncPhase::WaitSynced => {
                warn!("timeout waiting for periodic sync - restarting");
                actions.push(SyncAction::DeletePeriodicSync);
                self.enter(SyncPhase::Scan, now, &mut actions);
            }
            SyncPhase::WaitGroupInfo => {
                warn!("timeout waiting for group info - restarting");
                if !self.is_periodic_sync_lost() {
                    actions.push(SyncAction::DeletePeriodicSync);
                }
                self.enter(SyncPhase::Scan, now, &mut actions);
            }
            SyncPhase::WaitAllStreamsSynced => {
                let num_connected = self.channels.iter().filter(|c| c.is_connected()).count();
                warn!("timeout joining the group, {} of {} streams synced - terminating group sync", num_connected, self.channels.len());
                actions.push(SyncAction::TerminateGroupSync);
                self.enter(SyncPhase::SyncLossCheck, now, &mut actions);
            }
            phase => {
                warn!("deadline expired in phase {:?} which has no timeout", phase);
            }
        }
        actions
    }

    /// Handles a transport event. Stream data and periodic data are not synchronization events
    ///  and are ignored here.
    pub fn on_event(&mut self, event: &ReceiverEvent, now: Instant) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        match event {
            ReceiverEvent::AdvertisementReport(report) => {
                if self.phase != SyncPhase::Scan {
                    return actions;
                }
                if let Some(target) = self.discovery.on_report(report) {
                    self.session = Some(PeriodicSyncSession::new(target));
                    actions.push(SyncAction::StopScan);
                    self.enter(SyncPhase::CreatePeriodicSync, now, &mut actions);
                }
            }
            ReceiverEvent::PeriodicSynced(info) => {
                let phase = self.phase;
                let Some(session) = self.session.as_mut() else {
                    debug!("periodic sync with {} without a session - ignoring", info.addr);
                    return actions;
                };
                if phase != SyncPhase::WaitSynced || session.synced {
                    debug!("periodic sync with {} reported in phase {:?} - ignoring", info.addr, phase);
                    return actions;
                }
                info!("periodic sync established with {} (interval {} us, PHY {})",
                    info.addr, interval_to_us(info.interval), Phy::describe(info.phy));
                session.synced = true;
                self.enter(SyncPhase::WaitGroupInfo, now, &mut actions);
            }
            ReceiverEvent::PeriodicSyncTerminated { addr } => {
                if let Some(session) = self.session.as_mut() {
                    info!("periodic sync with {} terminated", addr);
                    session.sync_lost = true;
                }
            }
            ReceiverEvent::GroupInfo(group_info) => {
                let Some(session) = self.session.as_mut() else {
                    return actions;
                };
                if session.group_info.is_none() {
                    info!("group info: {} streams, ISO interval {}, SDU interval {} us, max SDU {}, PHY {}, {:?}, encrypted {}",
                        group_info.num_streams, group_info.iso_interval, group_info.sdu_interval_us, group_info.max_sdu,
                        Phy::describe(group_info.phy), group_info.framing, group_info.encryption);
                }
                session.group_info = Some(*group_info);
                if self.phase == SyncPhase::WaitGroupInfo {
                    self.enter(SyncPhase::GroupSync, now, &mut actions);
                }
            }
            ReceiverEvent::StreamConnected { stream } => self.on_stream_connected(*stream, now, &mut actions),
            ReceiverEvent::StreamDisconnected { stream, reason } => self.on_stream_disconnected(*stream, *reason, now, &mut actions),
            ReceiverEvent::PeriodicData { .. } | ReceiverEvent::StreamData { .. } => {}
        }
        actions
    }

    fn on_stream_connected(&mut self, stream: StreamIndex, now: Instant, actions: &mut Vec<SyncAction>) {
        if self.phase != SyncPhase::WaitAllStreamsSynced {
            debug!("stream {} connected in phase {:?} - ignoring", stream, self.phase);
            return;
        }
        let Some(channel) = self.channels.get_mut(stream.as_usize()) else {
            warn!("connect event for unknown stream {}", stream);
            return;
        };
        if !channel.on_connected() {
            return;
        }
        info!("stream {} synced", stream);

        if all_connected(&self.channels) {
            info!("all {} streams synced", self.channels.len());
            self.enter(SyncPhase::Streaming, now, actions);
        }
        else {
            // every stream gets its own bounded wait
            self.deadline = Some(now + self.config.stream_sync_timeout);
        }
    }

    fn on_stream_disconnected(&mut self, stream: StreamIndex, reason: u8, now: Instant, actions: &mut Vec<SyncAction>) {
        if reason == reason::OP_CANCELLED_BY_HOST {
            debug!("stream {} released by the local host", stream);
            return;
        }
        let Some(channel) = self.channels.get_mut(stream.as_usize()) else {
            warn!("disconnect event for unknown stream {}", stream);
            return;
        };
        if !channel.on_disconnected(reason) {
            return;
        }
        info!("stream {} lost sync with reason 0x{:02x}", stream, reason);

        if self.phase == SyncPhase::Streaming && all_disconnected(&self.channels) {
            info!("group sync lost");
            self.enter(SyncPhase::SyncLossCheck, now, actions);
        }
    }

    fn enter(&mut self, phase: SyncPhase, now: Instant, actions: &mut Vec<SyncAction>) {
        debug!("{:?} -> {:?}", self.phase, phase);
        self.phase = phase;
        self.deadline = None;

        match phase {
            SyncPhase::Scan => {
                self.session = None;
                self.discovery.reset();
                for channel in &mut self.channels {
                    channel.reset();
                }
                self.num_scans += 1;
                info!("scanning for periodic advertising");
                actions.push(SyncAction::StartScan);
            }
            SyncPhase::CreatePeriodicSync => {
                let Some(target) = self.sync_target() else {
                    warn!("no sync target - restarting");
                    return self.enter(SyncPhase::Scan, now, actions);
                };
                info!("creating periodic sync with {}", target.addr);
                actions.push(SyncAction::CreatePeriodicSync(
                    self.config.periodic_sync_params(target.addr, target.sid, target.interval_us)));
                self.enter(SyncPhase::WaitSynced, now, actions);
            }
            SyncPhase::WaitSynced | SyncPhase::WaitGroupInfo => {
                let Some(session) = self.session.as_ref() else {
                    return self.enter(SyncPhase::Scan, now, actions);
                };
                self.deadline = Some(now + self.config.pa_sync_timeout(session.target.interval_us));
                if phase == SyncPhase::WaitGroupInfo && session.group_info.is_some() {
                    self.enter(SyncPhase::GroupSync, now, actions);
                }
            }
            SyncPhase::GroupSync => {
                let Some(group_info) = self.session.as_ref().and_then(|s| s.group_info) else {
                    warn!("no group info for joining the group - waiting for it");
                    return self.enter(SyncPhase::WaitGroupInfo, now, actions);
                };
                self.num_group_joins += 1;
                info!("joining broadcast group (attempt #{})", self.num_group_joins);
                for channel in &mut self.channels {
                    channel.on_connect_requested();
                }
                actions.push(SyncAction::JoinGroup(self.config.group_sync_params(&group_info)));
                self.enter(SyncPhase::WaitAllStreamsSynced, now, actions);
            }
            SyncPhase::WaitAllStreamsSynced => {
                self.deadline = Some(now + self.config.stream_sync_timeout);
            }
            SyncPhase::Streaming => {}
            SyncPhase::SyncLossCheck => {
                if self.is_periodic_sync_lost() {
                    info!("periodic sync lost as well - restarting");
                    self.enter(SyncPhase::Scan, now, actions);
                }
                else {
                    self.enter(SyncPhase::GroupSync, now, actions);
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use rstest::rstest;

    use crate::stream_channel::ChannelState;
    use crate::transport::peer_addr::{PeerAddr, PeerAddrType};
    use crate::transport::{adv_props, AdvertisementReport, Framing, PeriodicSyncInfo};

    use super::*;

    /// 100 ms periodic advertising interval, i.e. a 600 ms wait for sync and for group info
    const PA_INTERVAL: u16 = 80;
    const PA_WAIT: Duration = Duration::from_millis(600);
    const STREAM_WAIT: Duration = Duration::from_secs(10);

    fn addr() -> PeerAddr {
        PeerAddr::new(PeerAddrType::Random, [1, 2, 3, 4, 5, 0xc6])
    }

    fn report(interval: u16) -> ReceiverEvent {
        ReceiverEvent::AdvertisementReport(AdvertisementReport {
            addr: addr(),
            sid: 0,
            rssi: -50,
            tx_power: 127,
            adv_type: 5,
            adv_props: adv_props::EXT_ADV,
            primary_phy: 1,
            secondary_phy: 2,
            interval,
            data: Bytes::new(),
        })
    }

    fn synced() -> ReceiverEvent {
        ReceiverEvent::PeriodicSynced(PeriodicSyncInfo { addr: addr(), sid: 0, interval: PA_INTERVAL, phy: 2 })
    }

    fn sync_terminated() -> ReceiverEvent {
        ReceiverEvent::PeriodicSyncTerminated { addr: addr() }
    }

    fn group_info() -> GroupInfo {
        GroupInfo {
            addr: addr(),
            sid: 0,
            num_streams: 2,
            sub_event_count: 2,
            iso_interval: 8,
            burst_number: 1,
            offset: 0,
            repetition_count: 2,
            max_pdu: 4,
            sdu_interval_us: 10_000,
            max_sdu: 4,
            phy: 2,
            framing: Framing::Unframed,
            encryption: false,
        }
    }

    fn connected(stream: u8) -> ReceiverEvent {
        ReceiverEvent::StreamConnected { stream: StreamIndex(stream) }
    }

    fn disconnected(stream: u8, reason: u8) -> ReceiverEvent {
        ReceiverEvent::StreamDisconnected { stream: StreamIndex(stream), reason }
    }

    fn join_action() -> SyncAction {
        SyncAction::JoinGroup(ReceiverConfig::new().group_sync_params(&group_info()))
    }

    fn machine() -> SyncStateMachine {
        SyncStateMachine::new(Arc::new(ReceiverConfig::new()))
    }

    /// drives a fresh state machine to the given phase, returning it and the current time
    fn machine_in(phase: SyncPhase) -> (SyncStateMachine, Instant) {
        let now = Instant::now();
        let mut m = machine();
        m.start(now);
        if phase == SyncPhase::Scan {
            return (m, now);
        }
        m.on_event(&report(PA_INTERVAL), now);
        if phase == SyncPhase::WaitSynced {
            return (m, now);
        }
        m.on_event(&synced(), now);
        if phase == SyncPhase::WaitGroupInfo {
            return (m, now);
        }
        m.on_event(&ReceiverEvent::GroupInfo(group_info()), now);
        if phase == SyncPhase::WaitAllStreamsSynced {
            return (m, now);
        }
        m.on_event(&connected(0), now);
        m.on_event(&connected(1), now);
        assert_eq!(m.phase(), SyncPhase::Streaming);
        (m, now)
    }

    #[test]
    fn test_happy_path() {
        let now = Instant::now();
        let mut m = machine();

        assert_eq!(m.start(now), vec![SyncAction::StartScan]);
        assert_eq!(m.phase(), SyncPhase::Scan);
        assert_eq!(m.deadline(), None);

        assert!(m.on_event(&report(0), now).is_empty());
        assert_eq!(m.phase(), SyncPhase::Scan);

        let actions = m.on_event(&report(PA_INTERVAL), now);
        assert_eq!(actions, vec![
            SyncAction::StopScan,
            SyncAction::CreatePeriodicSync(PeriodicSyncParams { addr: addr(), sid: 0, skip: 0, timeout_10ms: 60 }),
        ]);
        assert_eq!(m.phase(), SyncPhase::WaitSynced);
        assert_eq!(m.deadline(), Some(now + PA_WAIT));

        assert!(m.on_event(&synced(), now).is_empty());
        assert_eq!(m.phase(), SyncPhase::WaitGroupInfo);

        assert_eq!(m.on_event(&ReceiverEvent::GroupInfo(group_info()), now), vec![join_action()]);
        assert_eq!(m.phase(), SyncPhase::WaitAllStreamsSynced);
        assert_eq!(m.deadline(), Some(now + STREAM_WAIT));

        assert!(m.on_event(&connected(1), now).is_empty());
        assert_eq!(m.phase(), SyncPhase::WaitAllStreamsSynced);
        assert!(m.on_event(&connected(0), now).is_empty());
        assert_eq!(m.phase(), SyncPhase::Streaming);
        assert_eq!(m.deadline(), None);
    }

    #[test]
    fn test_group_info_before_synced_is_latched() {
        let (mut m, now) = machine_in(SyncPhase::WaitSynced);

        assert!(m.on_event(&ReceiverEvent::GroupInfo(group_info()), now).is_empty());
        assert_eq!(m.phase(), SyncPhase::WaitSynced);

        assert_eq!(m.on_event(&synced(), now), vec![join_action()]);
        assert_eq!(m.phase(), SyncPhase::WaitAllStreamsSynced);
    }

    #[test]
    fn test_never_joins_without_group_info() {
        let (mut m, now) = machine_in(SyncPhase::WaitGroupInfo);

        for event in [connected(0), connected(1), disconnected(0, 0x13), synced()] {
            let actions = m.on_event(&event, now);
            assert!(!actions.iter().any(|a| matches!(a, SyncAction::JoinGroup(_))));
        }
        assert_eq!(m.phase(), SyncPhase::WaitGroupInfo);
    }

    #[test]
    fn test_sync_timeout_deletes_sync_and_rescans() {
        let (mut m, now) = machine_in(SyncPhase::WaitSynced);

        assert!(m.on_timeout(now + PA_WAIT - Duration::from_millis(1)).is_empty());
        assert_eq!(m.phase(), SyncPhase::WaitSynced);

        assert_eq!(m.on_timeout(now + PA_WAIT), vec![SyncAction::DeletePeriodicSync, SyncAction::StartScan]);
        assert_eq!(m.phase(), SyncPhase::Scan);
        assert_eq!(m.sync_target(), None);
        assert_eq!(m.num_scans(), 2);
    }

    #[rstest]
    #[case::sync_alive(false, vec![SyncAction::DeletePeriodicSync, SyncAction::StartScan])]
    #[case::sync_lost(true, vec![SyncAction::StartScan])]
    fn test_group_info_timeout(#[case] sync_lost: bool, #[case] expected: Vec<SyncAction>) {
        let (mut m, now) = machine_in(SyncPhase::WaitGroupInfo);
        if sync_lost {
            assert!(m.on_event(&sync_terminated(), now).is_empty());
        }
        assert_eq!(m.phase(), SyncPhase::WaitGroupInfo);

        assert_eq!(m.on_timeout(now + PA_WAIT), expected);
        assert_eq!(m.phase(), SyncPhase::Scan);
    }

    #[test]
    fn test_stream_timeout_retries_join_while_periodic_sync_alive() {
        let (mut m, now) = machine_in(SyncPhase::WaitAllStreamsSynced);
        let later = now + Duration::from_secs(1);
        m.on_event(&connected(0), later);

        // the connect rearmed the wait for the remaining stream
        assert!(m.on_timeout(now + STREAM_WAIT).is_empty());

        assert_eq!(m.on_timeout(later + STREAM_WAIT), vec![SyncAction::TerminateGroupSync, join_action()]);
        assert_eq!(m.phase(), SyncPhase::WaitAllStreamsSynced);
        assert_eq!(m.num_group_joins(), 2);
        assert_eq!(m.num_scans(), 1);
        assert!(m.channels().iter().all(|c| !c.is_connected()));
    }

    #[test]
    fn test_stream_timeout_rescans_when_periodic_sync_lost() {
        let (mut m, now) = machine_in(SyncPhase::WaitAllStreamsSynced);
        m.on_event(&sync_terminated(), now);

        assert_eq!(m.on_timeout(now + STREAM_WAIT), vec![SyncAction::TerminateGroupSync, SyncAction::StartScan]);
        assert_eq!(m.phase(), SyncPhase::Scan);
    }

    #[test]
    fn test_group_loss_with_periodic_sync_alive_rejoins() {
        let (mut m, now) = machine_in(SyncPhase::Streaming);

        assert!(m.on_event(&disconnected(0, 0x08), now).is_empty());
        assert_eq!(m.phase(), SyncPhase::Streaming);

        assert_eq!(m.on_event(&disconnected(1, 0x08), now), vec![join_action()]);
        assert_eq!(m.phase(), SyncPhase::WaitAllStreamsSynced);
        assert_eq!(m.num_scans(), 1);
    }

    #[test]
    fn test_group_loss_with_periodic_sync_lost_rescans() {
        let (mut m, now) = machine_in(SyncPhase::Streaming);
        m.on_event(&sync_terminated(), now);
        assert_eq!(m.phase(), SyncPhase::Streaming, "periodic sync loss alone does not stop streaming");

        m.on_event(&disconnected(0, reason::REMOTE_USER_TERMINATED), now);
        assert_eq!(m.on_event(&disconnected(1, reason::REMOTE_USER_TERMINATED), now), vec![SyncAction::StartScan]);
        assert_eq!(m.phase(), SyncPhase::Scan);
        assert!(!m.is_periodic_sync_lost(), "the flag belongs to the discarded session");
    }

    #[test]
    fn test_full_restart_reuses_channels() {
        let (mut m, now) = machine_in(SyncPhase::Streaming);
        let channels_before = m.channels().as_ptr();

        m.on_event(&sync_terminated(), now);
        m.on_event(&disconnected(0, reason::REMOTE_USER_TERMINATED), now);
        m.on_event(&disconnected(1, reason::REMOTE_USER_TERMINATED), now);
        assert_eq!(m.phase(), SyncPhase::Scan);

        assert_eq!(m.channels().as_ptr(), channels_before);
        assert_eq!(m.channels().len(), 2);
        assert!(m.channels().iter().all(|c| c.state() == ChannelState::Idle && c.last_disconnect_reason().is_none()));
    }

    #[test]
    fn test_locally_cancelled_streams_are_no_loss_signal() {
        let (mut m, now) = machine_in(SyncPhase::Streaming);

        assert!(m.on_event(&disconnected(0, reason::OP_CANCELLED_BY_HOST), now).is_empty());
        assert!(m.on_event(&disconnected(1, reason::OP_CANCELLED_BY_HOST), now).is_empty());
        assert_eq!(m.phase(), SyncPhase::Streaming);
        assert!(m.channels().iter().all(|c| c.is_connected()));
    }

    #[test]
    fn test_duplicate_connect_does_not_complete_barrier() {
        let (mut m, now) = machine_in(SyncPhase::WaitAllStreamsSynced);
        m.on_event(&connected(0), now);
        m.on_event(&connected(0), now);
        assert_eq!(m.phase(), SyncPhase::WaitAllStreamsSynced);
    }

    #[test]
    fn test_reports_ignored_outside_scan() {
        let (mut m, now) = machine_in(SyncPhase::WaitSynced);
        assert!(m.on_event(&report(PA_INTERVAL), now).is_empty());
        assert_eq!(m.phase(), SyncPhase::WaitSynced);
    }

    #[test]
    fn test_no_deadline_while_streaming() {
        let (mut m, now) = machine_in(SyncPhase::Streaming);
        assert_eq!(m.deadline(), None);
        assert!(m.on_timeout(now + Duration::from_secs(3600)).is_empty());
        assert_eq!(m.phase(), SyncPhase::Streaming);
    }
}
