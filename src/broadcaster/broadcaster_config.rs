use std::time::Duration;

use anyhow::bail;

use crate::transport::{AdvertisingParams, Framing, GroupCreateParams, Packing, Phy, StreamTxQos};

/// Size of the payload every stream carries: a little-endian `u32` counter
pub const COUNTER_PAYLOAD_LEN: usize = std::mem::size_of::<u32>();

#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    pub device_name: String,

    pub num_streams: u8,
    /// number of retransmissions per SDU
    pub retransmissions: u8,
    pub phy: Phy,
    pub sdu_interval: Duration,
    pub max_latency: Duration,

    /// The group is torn down and recreated after it was active for this long (measured in send
    ///  rounds, see [BroadcasterConfig::interval_budget]).
    pub sustain_duration: Duration,

    /// Upper bound for transmit units submitted to the transport but not yet reported as sent
    pub max_outstanding_sends: usize,
    /// number of pre-allocated transmit buffers
    pub tx_buffer_count: usize,
    /// bounded wait for a transmit buffer and for a send credit, each
    pub buffer_alloc_timeout: Duration,

    /// log the transmitted value every n rounds
    pub report_interval: u32,
}

impl BroadcasterConfig {
    pub fn new() -> BroadcasterConfig {
        BroadcasterConfig {
            device_name: "Test ISO broadcaster".to_string(),
            num_streams: 2,
            retransmissions: 1,
            phy: Phy::Le2M,
            sdu_interval: Duration::from_millis(10),
            max_latency: Duration::from_millis(10),
            sustain_duration: Duration::from_secs(60),
            max_outstanding_sends: 1,
            tx_buffer_count: 2,
            buffer_alloc_timeout: Duration::from_millis(50),
            report_interval: 1000,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_streams == 0 || self.num_streams > 31 {
            bail!("number of streams must be between 1 and 31, was {}", self.num_streams);
        }
        if self.sdu_interval.is_zero() {
            bail!("SDU interval must not be zero");
        }
        if self.sustain_duration < self.sdu_interval {
            bail!("sustain duration {:?} is shorter than a single SDU interval {:?}", self.sustain_duration, self.sdu_interval);
        }
        if self.max_outstanding_sends == 0 {
            bail!("at least one outstanding send must be allowed");
        }
        if self.tx_buffer_count == 0 {
            bail!("at least one transmit buffer is required");
        }
        if self.report_interval == 0 {
            bail!("report interval must not be zero");
        }
        Ok(())
    }

    /// number of send rounds a group stays active before it is recreated
    pub fn interval_budget(&self) -> u32 {
        let budget = self.sustain_duration.as_micros() / self.sdu_interval.as_micros();
        budget.try_into().unwrap_or(u32::MAX)
    }

    pub fn advertising_params(&self) -> AdvertisingParams {
        AdvertisingParams {
            device_name: self.device_name.clone(),
        }
    }

    pub fn group_create_params(&self) -> GroupCreateParams {
        GroupCreateParams {
            num_streams: self.num_streams,
            sdu_interval: self.sdu_interval,
            max_latency: self.max_latency,
            packing: Packing::Sequential,
            framing: Framing::Unframed,
            tx_qos: StreamTxQos {
                max_sdu: COUNTER_PAYLOAD_LEN as u16,
                retransmissions: self.retransmissions,
                phy: self.phy,
            },
        }
    }
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        BroadcasterConfig::new()
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::default(60_000, 10, 6000)]
    #[case::exact(100, 10, 10)]
    #[case::truncating(105, 10, 10)]
    #[case::single(10, 10, 1)]
    fn test_interval_budget(#[case] sustain_millis: u64, #[case] interval_millis: u64, #[case] expected: u32) {
        let config = BroadcasterConfig {
            sustain_duration: Duration::from_millis(sustain_millis),
            sdu_interval: Duration::from_millis(interval_millis),
            ..BroadcasterConfig::new()
        };
        assert_eq!(config.interval_budget(), expected);
    }

    #[test]
    fn test_default_is_valid() {
        assert!(BroadcasterConfig::new().validate().is_ok());
    }

    #[rstest]
    #[case::no_streams(|c: &mut BroadcasterConfig| c.num_streams = 0)]
    #[case::too_many_streams(|c: &mut BroadcasterConfig| c.num_streams = 32)]
    #[case::zero_interval(|c: &mut BroadcasterConfig| c.sdu_interval = Duration::ZERO)]
    #[case::short_sustain(|c: &mut BroadcasterConfig| c.sustain_duration = Duration::from_millis(5))]
    #[case::no_credits(|c: &mut BroadcasterConfig| c.max_outstanding_sends = 0)]
    #[case::no_buffers(|c: &mut BroadcasterConfig| c.tx_buffer_count = 0)]
    #[case::no_report_interval(|c: &mut BroadcasterConfig| c.report_interval = 0)]
    fn test_validate_rejects(#[case] patch: fn(&mut BroadcasterConfig)) {
        let mut config = BroadcasterConfig::new();
        patch(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_group_create_params() {
        let params = BroadcasterConfig::new().group_create_params();
        assert_eq!(params.num_streams, 2);
        assert_eq!(params.tx_qos.max_sdu, 4);
        assert_eq!(params.tx_qos.retransmissions, 1);
        assert_eq!(params.tx_qos.phy, Phy::Le2M);
        assert_eq!(params.packing, Packing::Sequential);
        assert_eq!(params.framing, Framing::Unframed);
    }
}
