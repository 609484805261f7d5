use tracing::{debug, info, warn};

use crate::stream_channel::{all_connected, all_disconnected, StreamChannel, StreamIndex};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GroupState {
    /// group creation was requested, waiting for every stream to connect
    CreatePending,
    Active,
    /// group termination was requested, waiting for every stream to disconnect
    TerminatePending,
    Terminated,
}

/// Stream-level events that drive a group's lifecycle
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GroupEvent {
    Connected(StreamIndex),
    Disconnected(StreamIndex, u8),
}

/// The broadcaster's broadcast group. It is created, kept active for a fixed number of send
///  rounds, terminated and then recreated, over and over, reusing the same stream channels.
pub struct BroadcastGroup {
    state: GroupState,
    channels: Vec<StreamChannel>,
    seq_nums: Vec<u16>,
    interval_budget: u32,
    rounds_remaining: u32,
    generation: u64,
}

impl BroadcastGroup {
    /// The new group starts out in `CreatePending`
    pub fn new(num_streams: u8, interval_budget: u32) -> BroadcastGroup {
        let mut group = BroadcastGroup {
            state: GroupState::Terminated,
            channels: StreamChannel::allocate(num_streams),
            seq_nums: vec![0; num_streams as usize],
            interval_budget,
            rounds_remaining: interval_budget,
            generation: 0,
        };
        group.begin_create();
        group
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn streams(&self) -> impl Iterator<Item = StreamIndex> + '_ {
        self.channels.iter().map(StreamChannel::index)
    }

    pub fn num_streams(&self) -> usize {
        self.channels.len()
    }

    /// number of times the group was (re)created
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn rounds_remaining(&self) -> u32 {
        self.rounds_remaining
    }

    /// Enters `CreatePending` for a new incarnation of the group: sequence numbers and the
    ///  iteration budget start over.
    pub fn begin_create(&mut self) {
        if self.state != GroupState::Terminated {
            warn!("creating broadcast group in state {:?}", self.state);
        }

        self.generation += 1;
        self.state = GroupState::CreatePending;
        self.seq_nums.iter_mut().for_each(|s| *s = 0);
        self.rounds_remaining = self.interval_budget;
        for channel in &mut self.channels {
            channel.on_connect_requested();
        }
        debug!("broadcast group #{} create pending", self.generation);
    }

    pub fn begin_terminate(&mut self) {
        if self.state != GroupState::Active {
            warn!("terminating broadcast group in state {:?}", self.state);
        }
        self.state = GroupState::TerminatePending;
    }

    /// Applies a stream event, returning `true` if it completed a barrier, i.e. moved the group
    ///  to `Active` or to `Terminated`.
    pub fn on_event(&mut self, event: GroupEvent) -> bool {
        match event {
            GroupEvent::Connected(stream) => self.on_connected(stream),
            GroupEvent::Disconnected(stream, reason) => self.on_disconnected(stream, reason),
        }
    }

    fn channel_mut(&mut self, stream: StreamIndex) -> Option<&mut StreamChannel> {
        let channel = self.channels.get_mut(stream.as_usize());
        if channel.is_none() {
            warn!("event for stream {} which is not part of the group", stream);
        }
        channel
    }

    fn on_connected(&mut self, stream: StreamIndex) -> bool {
        let state = self.state;
        let Some(channel) = self.channel_mut(stream) else {
            return false;
        };
        if !channel.on_connected() {
            return false;
        }
        info!("stream {} connected", stream);

        if state != GroupState::CreatePending {
            warn!("stream {} connected while the group is {:?}", stream, state);
            return false;
        }

        if all_connected(&self.channels) {
            info!("broadcast group #{} active", self.generation);
            self.state = GroupState::Active;
            return true;
        }
        false
    }

    fn on_disconnected(&mut self, stream: StreamIndex, reason: u8) -> bool {
        let state = self.state;
        let Some(channel) = self.channel_mut(stream) else {
            return false;
        };
        if !channel.on_disconnected(reason) {
            return false;
        }
        info!("stream {} disconnected with reason 0x{:02x}", stream, reason);

        if state != GroupState::TerminatePending {
            warn!("stream {} disconnected while the group is {:?}", stream, state);
            return false;
        }

        if all_disconnected(&self.channels) {
            info!("broadcast group #{} terminated", self.generation);
            self.state = GroupState::Terminated;
            return true;
        }
        false
    }

    pub fn seq_num(&self, stream: StreamIndex) -> u16 {
        self.seq_nums[stream.as_usize()]
    }

    pub fn advance_seq_num(&mut self, stream: StreamIndex) {
        let seq_num = &mut self.seq_nums[stream.as_usize()];
        *seq_num = seq_num.wrapping_add(1);
    }

    /// Accounts for one completed send round, returning `true` once the group has used up its
    ///  iteration budget and is due for termination.
    pub fn on_round_sent(&mut self) -> bool {
        self.rounds_remaining = self.rounds_remaining.saturating_sub(1);
        self.rounds_remaining == 0
    }
}
