use std::time::Duration;

use anyhow::bail;

use crate::transport::{GroupInfo, GroupSyncParams, PeriodicSyncParams};
use crate::transport::peer_addr::PeerAddr;

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub num_streams: u8,

    /// The waits for periodic sync and for group info are bounded by this many periodic
    ///  advertising intervals of the discovered announcement.
    pub pa_retry_count: u32,

    /// bound for each stream's wait while joining the group
    pub stream_sync_timeout: Duration,
    /// supervision timeout the transport applies to an established group sync
    pub group_sync_timeout: Duration,

    /// log a received payload every n payloads
    pub report_interval: u32,
    /// if set, reports are keyed on the received counter value rather than on the number of
    ///  received payloads, so they line up with the broadcaster's reports
    pub align_report_intervals: bool,
}

impl ReceiverConfig {
    pub fn new() -> ReceiverConfig {
        ReceiverConfig {
            num_streams: 2,
            pa_retry_count: 6,
            stream_sync_timeout: Duration::from_secs(10),
            group_sync_timeout: Duration::from_millis(1000),
            report_interval: 1000,
            align_report_intervals: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_streams == 0 || self.num_streams > 31 {
            bail!("number of streams must be between 1 and 31, was {}", self.num_streams);
        }
        if self.pa_retry_count == 0 {
            bail!("periodic sync retry count must not be zero");
        }
        if self.stream_sync_timeout.is_zero() {
            bail!("stream sync timeout must not be zero");
        }
        if self.report_interval == 0 {
            bail!("report interval must not be zero");
        }
        Ok(())
    }

    /// control-loop wait for periodic sync and for group info, each
    pub fn pa_sync_timeout(&self, pa_interval_us: u32) -> Duration {
        Duration::from_micros(pa_interval_us as u64 * self.pa_retry_count as u64)
    }

    pub fn periodic_sync_params(&self, addr: PeerAddr, sid: u8, pa_interval_us: u32) -> PeriodicSyncParams {
        let timeout_10ms = pa_interval_us as u64 * self.pa_retry_count as u64 / 10_000;
        PeriodicSyncParams {
            addr,
            sid,
            skip: 0,
            timeout_10ms: timeout_10ms.try_into().unwrap_or(u16::MAX),
        }
    }

    /// selects over-the-air stream indices `1..=num_streams`
    pub fn stream_bitfield(&self) -> u32 {
        ((1u32 << self.num_streams) - 1) << 1
    }

    pub fn group_sync_params(&self, group_info: &GroupInfo) -> GroupSyncParams {
        let sync_timeout_10ms = self.group_sync_timeout.as_millis() / 10;
        GroupSyncParams {
            num_streams: self.num_streams,
            stream_bitfield: self.stream_bitfield(),
            max_subevents: None,
            sync_timeout_10ms: sync_timeout_10ms.try_into().unwrap_or(u16::MAX),
            group_info: *group_info,
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig::new()
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::transport::peer_addr::PeerAddrType;

    use super::*;

    #[rstest]
    #[case(1, 0b10)]
    #[case(2, 0b110)]
    #[case(31, 0xffff_fffe)]
    fn test_stream_bitfield(#[case] num_streams: u8, #[case] expected: u32) {
        let config = ReceiverConfig {
            num_streams,
            ..ReceiverConfig::new()
        };
        assert_eq!(config.stream_bitfield(), expected);
    }

    #[rstest]
    #[case::hundred_millis(100_000, Duration::from_millis(600), 60)]
    #[case::seven_and_a_half_millis(7_500, Duration::from_micros(45_000), 4)]
    #[case::huge(1_000_000_000, Duration::from_secs(6000), u16::MAX)]
    fn test_pa_sync_timeouts(#[case] interval_us: u32, #[case] expected_wait: Duration, #[case] expected_10ms: u16) {
        let config = ReceiverConfig::new();
        assert_eq!(config.pa_sync_timeout(interval_us), expected_wait);

        let addr = PeerAddr::new(PeerAddrType::Random, [1, 2, 3, 4, 5, 0xc6]);
        let params = config.periodic_sync_params(addr, 3, interval_us);
        assert_eq!(params.timeout_10ms, expected_10ms);
        assert_eq!(params.sid, 3);
        assert_eq!(params.skip, 0);
        assert_eq!(params.addr, addr);
    }

    #[test]
    fn test_validate() {
        assert!(ReceiverConfig::new().validate().is_ok());
        assert!(ReceiverConfig { num_streams: 0, ..ReceiverConfig::new() }.validate().is_err());
        assert!(ReceiverConfig { pa_retry_count: 0, ..ReceiverConfig::new() }.validate().is_err());
        assert!(ReceiverConfig { report_interval: 0, ..ReceiverConfig::new() }.validate().is_err());
    }
}
