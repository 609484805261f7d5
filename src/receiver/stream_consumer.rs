use std::fmt::Write;

use tracing::{debug, info, trace};

use crate::receiver::receiver_config::ReceiverConfig;
use crate::stream_channel::StreamIndex;
use crate::transport::StreamRecvInfo;

pub(crate) fn to_hex(data: &[u8]) -> String {
    let mut result = String::with_capacity(2 * data.len());
    for b in data {
        let _ = write!(result, "{:02x}", b);
    }
    result
}

/// Accounts for the payloads received on one stream.
///
/// A payload of exactly four bytes is the broadcaster's little-endian counter and becomes the
///  stream's receive count. Payloads of any other length are not counter data: they are logged
///  and leave the receive count as it was.
pub struct StreamConsumer {
    stream: StreamIndex,
    report_interval: u32,
    align_report_intervals: bool,
    count: u32,
    delivered: u64,
}

impl StreamConsumer {
    pub fn new(stream: StreamIndex, config: &ReceiverConfig) -> StreamConsumer {
        StreamConsumer {
            stream,
            report_interval: config.report_interval,
            align_report_intervals: config.align_report_intervals,
            count: 0,
            delivered: 0,
        }
    }

    pub fn stream(&self) -> StreamIndex {
        self.stream
    }

    /// the running receive count, i.e. the most recently received counter value
    pub fn count(&self) -> u32 {
        self.count
    }

    /// number of payloads delivered to this consumer regardless of their content
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Returns the decoded counter if the payload was counter data
    pub fn on_payload(&mut self, info: &StreamRecvInfo, payload: &[u8]) -> Option<u32> {
        self.delivered += 1;

        let decoded = <[u8; 4]>::try_from(payload)
            .ok()
            .map(u32::from_le_bytes);
        match decoded {
            Some(counter) => self.count = counter,
            None => debug!("stream {}: ignoring {} byte payload for the receive count", self.stream, payload.len()),
        }

        let due = if self.align_report_intervals {
            decoded.is_some() && self.count % self.report_interval == 0
        }
        else {
            self.delivered % self.report_interval as u64 == 0
        };

        if due {
            info!("incoming data on stream {}: flags 0x{:02x}, seq_num {}, ts {}, len {}, data {}, count {}",
                self.stream, info.flags, info.seq_num, info.timestamp, payload.len(), to_hex(payload), self.count);
        }
        else {
            trace!("stream {}: seq_num {}, len {}, count {}", self.stream, info.seq_num, payload.len(), self.count);
        }

        decoded
    }
}
