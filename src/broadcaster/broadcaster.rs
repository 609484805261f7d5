use std::convert::Infallible;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::broadcaster::broadcaster_config::{BroadcasterConfig, COUNTER_PAYLOAD_LEN};
use crate::broadcaster::buffer_pool::TxBufferPool;
use crate::broadcaster::credit_pool::{BufferCreditPool, CreditToken};
use crate::broadcaster::flow_controller::BroadcastFlowController;
use crate::broadcaster::group_lifecycle::{BroadcastGroup, GroupEvent};
use crate::error::FatalError;
use crate::stream_channel::StreamIndex;
use crate::transport::{BroadcastEventHandler, BroadcastTransport};


/// Runs in the transport's context: send completions go straight back to the credit pool,
///  connection events are queued for the control loop.
struct BroadcastEventForwarder {
    credits: Arc<BufferCreditPool>,
    events: mpsc::UnboundedSender<GroupEvent>,
}

impl BroadcastEventHandler for BroadcastEventForwarder {
    fn on_connected(&self, stream: StreamIndex) {
        let _ = self.events.send(GroupEvent::Connected(stream));
    }

    fn on_disconnected(&self, stream: StreamIndex, reason: u8) {
        let _ = self.events.send(GroupEvent::Disconnected(stream, reason));
    }

    fn on_sent(&self, _stream: StreamIndex, credit: CreditToken) {
        self.credits.release(credit);
    }
}


/// The broadcaster role: advertises, creates the broadcast group and keeps sending the counter
///  on all of its streams, recreating the group every `sustain_duration`.
pub struct Broadcaster {
    config: Arc<BroadcasterConfig>,
    transport: Arc<dyn BroadcastTransport>,
}

impl Broadcaster {
    pub fn new(config: Arc<BroadcasterConfig>, transport: Arc<dyn BroadcastTransport>) -> anyhow::Result<Broadcaster> {
        config.validate()?;
        Ok(Broadcaster { config, transport })
    }

    /// Runs until a fatal condition occurs, which is returned
    pub async fn run(&self) -> Result<Infallible, FatalError> {
        info!("starting broadcaster");

        let credits = Arc::new(BufferCreditPool::new(self.config.max_outstanding_sends));
        let buffers = TxBufferPool::new(COUNTER_PAYLOAD_LEN, self.config.tx_buffer_count);
        let (event_sender, mut events) = mpsc::unbounded_channel();

        self.transport.enable(Arc::new(BroadcastEventForwarder {
            credits: credits.clone(),
            events: event_sender,
        })).await
            .map_err(FatalError::transport("enable transport"))?;

        self.transport.start_advertising(&self.config.advertising_params()).await
            .map_err(FatalError::transport("start advertising"))?;
        info!("advertising as {:?}", self.config.device_name);

        let group_params = self.config.group_create_params();
        let mut group = BroadcastGroup::new(self.config.num_streams, self.config.interval_budget());
        let mut flow_controller = BroadcastFlowController::new(self.transport.clone(), buffers, credits, &self.config);

        loop {
            info!("creating broadcast group #{}", group.generation());
            self.transport.create_group(&group_params).await
                .map_err(FatalError::transport("create broadcast group"))?;
            await_barrier(&mut group, &mut events).await?;

            loop {
                drain_pending_events(&mut group, &mut events);
                flow_controller.send_round(&mut group).await?;
                if group.on_round_sent() {
                    break;
                }
            }

            info!("terminating broadcast group #{}", group.generation());
            group.begin_terminate();
            self.transport.terminate_group().await
                .map_err(FatalError::transport("terminate broadcast group"))?;
            await_barrier(&mut group, &mut events).await?;

            group.begin_create();
        }
    }
}

/// waits, without a time limit, until every stream of the group reported the signal the group's
///  current state is waiting for
async fn await_barrier(group: &mut BroadcastGroup, events: &mut mpsc::UnboundedReceiver<GroupEvent>) -> Result<(), FatalError> {
    debug!("waiting for all {} streams, group is {:?}", group.num_streams(), group.state());
    loop {
        let event = events.recv().await
            .ok_or(FatalError::EventChannelClosed)?;
        if group.on_event(event) {
            return Ok(());
        }
    }
}

fn drain_pending_events(group: &mut BroadcastGroup, events: &mut mpsc::UnboundedReceiver<GroupEvent>) {
    while let Ok(event) = events.try_recv() {
        group.on_event(event);
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::anyhow;
    use tokio::runtime::Builder;

    use crate::transport::{reason, MockBroadcastTransport};

    use super::*;

    type HandlerSlot = Arc<Mutex<Option<Arc<dyn BroadcastEventHandler>>>>;

    fn handler(slot: &HandlerSlot) -> Arc<dyn BroadcastEventHandler> {
        slot.lock().unwrap().clone().expect("transport was not enabled")
    }

    fn test_config(sustain_rounds: u64) -> Arc<BroadcasterConfig> {
        Arc::new(BroadcasterConfig {
            sustain_duration: Duration::from_millis(10 * sustain_rounds),
            sdu_interval: Duration::from_millis(10),
            ..BroadcasterConfig::new()
        })
    }

    /// A transport that connects and disconnects all streams right away and completes every
    ///  send. Group creation fails once it was attempted `max_groups + 1` times, which ends the
    ///  run.
    fn scripted_transport(max_groups: usize, sends: Arc<Mutex<Vec<(StreamIndex, Vec<u8>, u16)>>>) -> MockBroadcastTransport {
        let slot = HandlerSlot::default();
        let mut transport = MockBroadcastTransport::new();

        let s = slot.clone();
        transport.expect_enable()
            .once()
            .returning(move |h| {
                *s.lock().unwrap() = Some(h);
                Ok(())
            });
        transport.expect_start_advertising()
            .once()
            .returning(|_| Ok(()));

        let s = slot.clone();
        let mut num_created = 0;
        transport.expect_create_group()
            .returning(move |params| {
                num_created += 1;
                if num_created > max_groups {
                    return Err(anyhow!("err -12"));
                }
                let h = handler(&s);
                for stream in StreamIndex::all(params.num_streams) {
                    h.on_connected(stream);
                }
                Ok(())
            });

        let s = slot.clone();
        transport.expect_terminate_group()
            .returning(move || {
                let h = handler(&s);
                h.on_disconnected(StreamIndex(1), reason::LOCAL_HOST_TERMINATED);
                h.on_disconnected(StreamIndex(0), reason::LOCAL_HOST_TERMINATED);
                Ok(())
            });

        let s = slot.clone();
        transport.expect_send()
            .returning(move |stream, buffer, seq_num, credit| {
                sends.lock().unwrap().push((stream, buffer.to_vec(), seq_num));
                handler(&s).on_sent(stream, credit);
                Ok(())
            });

        transport
    }

    #[test]
    fn test_group_is_recreated_after_budget() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let sends = Arc::new(Mutex::new(Vec::new()));
            let transport = scripted_transport(2, sends.clone());
            let broadcaster = Broadcaster::new(test_config(3), Arc::new(transport)).unwrap();

            match broadcaster.run().await {
                Err(FatalError::Transport { operation, .. }) => assert_eq!(operation, "create broadcast group"),
                Err(e) => panic!("unexpected error {}", e),
                Ok(never) => match never {},
            }

            let sends = sends.lock().unwrap();
            assert_eq!(sends.len(), 2 * 3 * 2);

            for (i, (stream, payload, seq_num)) in sends.iter().enumerate() {
                let round = (i / 2) as u32;
                assert_eq!(*stream, StreamIndex((i % 2) as u8));
                assert_eq!(payload, &round.to_le_bytes().to_vec(), "counter continues across groups");
                assert_eq!(*seq_num, (round % 3) as u16, "sequence numbers restart with every group");
            }
        });
    }

    #[test]
    fn test_no_sends_before_all_streams_connected() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let slot = HandlerSlot::default();
            let mut transport = MockBroadcastTransport::new();
            let s = slot.clone();
            transport.expect_enable()
                .returning(move |h| {
                    *s.lock().unwrap() = Some(h);
                    Ok(())
                });
            transport.expect_start_advertising()
                .returning(|_| Ok(()));
            let s = slot.clone();
            transport.expect_create_group()
                .once()
                .returning(move |_| {
                    handler(&s).on_connected(StreamIndex(0));
                    Ok(())
                });
            transport.expect_send()
                .never();

            let broadcaster = Broadcaster::new(test_config(3), Arc::new(transport)).unwrap();

            tokio::select! {
                _ = broadcaster.run() => panic!("broadcaster is expected to wait for the second stream"),
                _ = tokio::time::sleep(Duration::from_secs(10)) => {}
            }
        });
    }

    #[test]
    fn test_advertising_failure_is_fatal() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut transport = MockBroadcastTransport::new();
            transport.expect_enable()
                .returning(|_| Ok(()));
            transport.expect_start_advertising()
                .returning(|_| Err(anyhow!("err -5")));
            transport.expect_create_group()
                .never();

            let broadcaster = Broadcaster::new(test_config(3), Arc::new(transport)).unwrap();
            match broadcaster.run().await {
                Err(FatalError::Transport { operation, .. }) => assert_eq!(operation, "start advertising"),
                Err(e) => panic!("unexpected error {}", e),
                Ok(never) => match never {},
            }
        });
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = Arc::new(BroadcasterConfig {
            num_streams: 0,
            ..BroadcasterConfig::new()
        });
        assert!(Broadcaster::new(config, Arc::new(MockBroadcastTransport::new())).is_err());
    }
}
