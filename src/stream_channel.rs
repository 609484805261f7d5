use std::fmt::{Display, Formatter};

use tracing::{debug, warn};

/// Position of a stream inside its broadcast group, `0..N`
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamIndex(pub u8);

impl StreamIndex {
    pub fn all(num_streams: u8) -> impl Iterator<Item = StreamIndex> {
        (0..num_streams).map(StreamIndex)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for StreamIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

/// Connection state of one isochronous stream. Channels are allocated once per role and reused
///  for every group they become part of.
#[derive(Debug, Clone)]
pub struct StreamChannel {
    index: StreamIndex,
    state: ChannelState,
    last_disconnect_reason: Option<u8>,
}

impl StreamChannel {
    pub fn new(index: StreamIndex) -> StreamChannel {
        StreamChannel {
            index,
            state: ChannelState::Idle,
            last_disconnect_reason: None,
        }
    }

    /// Allocates the fixed channel set for a group of `num_streams` streams
    pub fn allocate(num_streams: u8) -> Vec<StreamChannel> {
        StreamIndex::all(num_streams)
            .map(StreamChannel::new)
            .collect()
    }

    pub fn index(&self) -> StreamIndex {
        self.index
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn last_disconnect_reason(&self) -> Option<u8> {
        self.last_disconnect_reason
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == ChannelState::Disconnected
    }

    /// back to `Idle` for a fresh start of the owning role, keeping the channel itself
    pub fn reset(&mut self) {
        self.state = ChannelState::Idle;
        self.last_disconnect_reason = None;
    }

    /// The owning group asked the transport to establish this stream
    pub fn on_connect_requested(&mut self) {
        self.state = ChannelState::Connecting;
    }

    /// Returns `true` if this was a state change
    pub fn on_connected(&mut self) -> bool {
        match self.state {
            ChannelState::Connected => {
                warn!("stream {} reported connected twice", self.index);
                false
            }
            ChannelState::Idle | ChannelState::Disconnected => {
                debug!("stream {} connected without a pending connect request", self.index);
                self.state = ChannelState::Connected;
                true
            }
            ChannelState::Connecting => {
                self.state = ChannelState::Connected;
                true
            }
        }
    }

    /// Returns `true` if this was a state change
    pub fn on_disconnected(&mut self, reason: u8) -> bool {
        self.last_disconnect_reason = Some(reason);
        if self.state == ChannelState::Disconnected {
            warn!("stream {} reported disconnected twice (reason 0x{:02x})", self.index, reason);
            return false;
        }
        self.state = ChannelState::Disconnected;
        true
    }
}

pub fn all_connected(channels: &[StreamChannel]) -> bool {
    channels.iter().all(StreamChannel::is_connected)
}

pub fn all_disconnected(channels: &[StreamChannel]) -> bool {
    channels.iter().all(StreamChannel::is_disconnected)
}
