use tokio::sync::broadcast;
use tracing::trace;

use crate::receiver::sync_state_machine::SyncPhase;
use crate::stream_channel::StreamIndex;

/// Progress of a running receiver, for observers outside the control loop
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReceiverNotification {
    PhaseChanged(PhaseChangedData),
    CounterReceived(CounterReceivedData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PhaseChangedData {
    pub old_phase: SyncPhase,
    pub new_phase: SyncPhase,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CounterReceivedData {
    pub stream: StreamIndex,
    pub counter: u32,
}


pub struct ReceiverNotifier {
    sender: broadcast::Sender<ReceiverNotification>,
}
impl ReceiverNotifier {
    pub fn new() -> ReceiverNotifier {
        let (sender, _) = broadcast::channel(128);

        ReceiverNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReceiverNotification> {
        self.sender.subscribe()
    }

    pub fn send(&self, notification: ReceiverNotification) {
        trace!("notification: {:?}", notification);
        let _ = self.sender.send(notification);
    }
}

impl Default for ReceiverNotifier {
    fn default() -> Self {
        ReceiverNotifier::new()
    }
}
