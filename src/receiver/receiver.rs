use std::convert::Infallible;
use std::sync::Arc;

use tokio::select;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::FatalError;
use crate::receiver::receiver_config::ReceiverConfig;
use crate::receiver::receiver_events::{CounterReceivedData, PhaseChangedData, ReceiverNotification, ReceiverNotifier};
use crate::receiver::stream_consumer::{to_hex, StreamConsumer};
use crate::receiver::sync_state_machine::{SyncAction, SyncStateMachine};
use crate::stream_channel::StreamIndex;
use crate::transport::{ReceiverEvent, ReceiverEventHandler, ReceiverTransport};


/// Queues every transport event for the control loop
struct ReceiverEventForwarder {
    events: mpsc::UnboundedSender<ReceiverEvent>,
}

impl ReceiverEventHandler for ReceiverEventForwarder {
    fn on_event(&self, event: ReceiverEvent) {
        let _ = self.events.send(event);
    }
}


/// The receiver role: finds the broadcaster's announcement, synchronizes to it and to its
///  broadcast group, and consumes the group's streams, recovering from loss of either sync.
pub struct Receiver {
    config: Arc<ReceiverConfig>,
    transport: Arc<dyn ReceiverTransport>,
    notifier: Arc<ReceiverNotifier>,
}

impl Receiver {
    pub fn new(config: Arc<ReceiverConfig>, transport: Arc<dyn ReceiverTransport>) -> anyhow::Result<Receiver> {
        config.validate()?;
        Ok(Receiver {
            config,
            transport,
            notifier: Arc::new(ReceiverNotifier::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReceiverNotification> {
        self.notifier.subscribe()
    }

    /// Runs until a fatal condition occurs, which is returned
    pub async fn run(&self) -> Result<Infallible, FatalError> {
        info!("starting receiver");

        let (event_sender, mut events) = mpsc::unbounded_channel();
        self.transport.enable(Arc::new(ReceiverEventForwarder { events: event_sender })).await
            .map_err(FatalError::transport("enable transport"))?;

        let mut machine = SyncStateMachine::new(self.config.clone());
        let mut consumers = StreamIndex::all(self.config.num_streams)
            .map(|stream| StreamConsumer::new(stream, &self.config))
            .collect::<Vec<_>>();

        let actions = machine.start(Instant::now());
        self.execute(actions).await?;

        loop {
            let next = match machine.deadline() {
                Some(deadline) => select! {
                    event = events.recv() => Some(event),
                    _ = sleep_until(deadline) => None,
                },
                None => Some(events.recv().await),
            };

            let old_phase = machine.phase();
            let actions = match next {
                None => machine.on_timeout(Instant::now()),
                Some(None) => return Err(FatalError::EventChannelClosed),
                Some(Some(ReceiverEvent::StreamData { stream, info, payload })) => {
                    let Some(consumer) = consumers.get_mut(stream.as_usize()) else {
                        warn!("data for unknown stream {}", stream);
                        continue;
                    };
                    if let Some(counter) = consumer.on_payload(&info, &payload) {
                        self.notifier.send(ReceiverNotification::CounterReceived(CounterReceivedData { stream, counter }));
                    }
                    continue;
                }
                Some(Some(ReceiverEvent::PeriodicData { addr, rssi, tx_power, data })) => {
                    trace!("periodic data from {}: tx_power {}, rssi {}, len {}, data {}", addr, tx_power, rssi, data.len(), to_hex(&data));
                    continue;
                }
                Some(Some(event)) => machine.on_event(&event, Instant::now()),
            };
            self.execute(actions).await?;

            if machine.phase() != old_phase {
                self.notifier.send(ReceiverNotification::PhaseChanged(PhaseChangedData {
                    old_phase,
                    new_phase: machine.phase(),
                }));
            }
        }
    }

    async fn execute(&self, actions: Vec<SyncAction>) -> Result<(), FatalError> {
        for action in actions {
            debug!("executing {:?}", action);
            match action {
                SyncAction::StartScan => self.transport.start_scan().await
                    .map_err(FatalError::transport("start scan"))?,
                SyncAction::StopScan => self.transport.stop_scan().await
                    .map_err(FatalError::transport("stop scan"))?,
                SyncAction::CreatePeriodicSync(params) => self.transport.create_periodic_sync(&params).await
                    .map_err(FatalError::transport("create periodic sync"))?,
                SyncAction::DeletePeriodicSync => self.transport.delete_periodic_sync().await
                    .map_err(FatalError::transport("delete periodic sync"))?,
                SyncAction::JoinGroup(params) => self.transport.join_group(&params).await
                    .map_err(FatalError::transport("join group"))?,
                SyncAction::TerminateGroupSync => self.transport.terminate_group_sync().await
                    .map_err(FatalError::transport("terminate group sync"))?,
            }
        }
        Ok(())
    }
}
