use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, trace};

use crate::broadcaster::broadcaster_config::BroadcasterConfig;
use crate::broadcaster::buffer_pool::TxBufferPool;
use crate::broadcaster::credit_pool::BufferCreditPool;
use crate::broadcaster::group_lifecycle::BroadcastGroup;
use crate::error::FatalError;
use crate::stream_channel::StreamIndex;
use crate::transport::BroadcastTransport;

/// Pushes the counter payload onto every stream of the active group, one round at a time.
///
/// Each send needs a transmit buffer and a send credit. Credits only come back through the
///  transport's send completion callback, so a transport that stops completing sends makes the
///  controller run into the credit timeout after `max_outstanding_sends` sends - which is fatal,
///  as is running out of buffers.
pub struct BroadcastFlowController {
    transport: Arc<dyn BroadcastTransport>,
    buffers: Arc<TxBufferPool>,
    credits: Arc<BufferCreditPool>,
    alloc_timeout: Duration,
    report_interval: u32,
    counter: u32,
}

impl BroadcastFlowController {
    pub fn new(
        transport: Arc<dyn BroadcastTransport>,
        buffers: Arc<TxBufferPool>,
        credits: Arc<BufferCreditPool>,
        config: &BroadcasterConfig,
    ) -> BroadcastFlowController {
        BroadcastFlowController {
            transport,
            buffers,
            credits,
            alloc_timeout: config.buffer_alloc_timeout,
            report_interval: config.report_interval,
            counter: 0,
        }
    }

    /// the value the next round will send
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Sends the current counter value on every stream of the group with that stream's sequence
    ///  number, then advances the counter.
    pub async fn send_round(&mut self, group: &mut BroadcastGroup) -> Result<(), FatalError> {
        let payload = self.counter.to_le_bytes();
        let mut first_seq_num = None;

        for stream in StreamIndex::all(group.num_streams() as u8) {
            let Some(mut buffer) = self.buffers.acquire(self.alloc_timeout).await else {
                error!("data buffer allocate timeout on stream {}", stream);
                return Err(FatalError::BufferTimeout { stream });
            };

            let Some(credit) = self.credits.acquire(self.alloc_timeout).await else {
                error!("timeout waiting for a send credit on stream {}", stream);
                // dropping the buffer puts it back into the pool
                return Err(FatalError::CreditTimeout { stream });
            };

            buffer.put_slice(&payload);
            let seq_num = group.seq_num(stream);
            first_seq_num.get_or_insert(seq_num);

            // committed before the send call so a completion that races the return of send
            //  finds its credit in flight
            let token = self.credits.commit(credit);
            if let Err(e) = self.transport.send(stream, buffer, seq_num, token).await {
                self.credits.release(token);
                error!("unable to broadcast data on stream {}: {:#}", stream, e);
                return Err(FatalError::Transport { operation: "send", source: e });
            }
            trace!("sent value {} on stream {} with sequence number {}", self.counter, stream, seq_num);

            group.advance_seq_num(stream);
        }

        if self.counter % self.report_interval == 0 {
            info!("sending value {} with sequence number {}", self.counter, first_seq_num.unwrap_or_default());
        }

        self.counter = self.counter.wrapping_add(1);
        Ok(())
    }
}
