use tracing::{debug, info};

use crate::transport::peer_addr::PeerAddr;
use crate::transport::{adv_props, interval_to_us, AdvertisementReport, Phy};

/// AD type 'shortened local name'
const AD_TYPE_NAME_SHORTENED: u8 = 0x08;
/// AD type 'complete local name'
const AD_TYPE_NAME_COMPLETE: u8 = 0x09;

/// Longest device name that is extracted from an advertisement
pub const MAX_NAME_LEN: usize = 29;

/// Extracts the advertised device name from raw advertising data, truncated to
///  [MAX_NAME_LEN] bytes. Malformed AD structures end the search.
pub fn parse_device_name(data: &[u8]) -> Option<String> {
    let mut remaining = data;
    while let Some((&len, rest)) = remaining.split_first() {
        let len = len as usize;
        if len == 0 || len > rest.len() {
            return None;
        }
        let (structure, rest) = rest.split_at(len);
        let (ad_type, value) = (structure[0], &structure[1..]);

        if ad_type == AD_TYPE_NAME_SHORTENED || ad_type == AD_TYPE_NAME_COMPLETE {
            let value = &value[..value.len().min(MAX_NAME_LEN)];
            return Some(String::from_utf8_lossy(value).into_owned());
        }
        remaining = rest;
    }
    None
}

/// The periodic announcement a receiver synchronizes to
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SyncTarget {
    pub addr: PeerAddr,
    pub sid: u8,
    pub interval_us: u32,
}

/// Inspects advertisement reports while scanning, latching the first one that announces
///  periodic advertising. There is no ranking between candidates.
#[derive(Debug, Default)]
pub struct Discovery {
    target: Option<SyncTarget>,
}

impl Discovery {
    pub fn new() -> Discovery {
        Discovery::default()
    }

    pub fn target(&self) -> Option<SyncTarget> {
        self.target
    }

    /// forget the latched target for a new scan
    pub fn reset(&mut self) {
        self.target = None;
    }

    /// Returns the sync target if this report is the one that got latched. Reports arriving
    ///  after a target was latched are logged but otherwise ignored.
    pub fn on_report(&mut self, report: &AdvertisementReport) -> Option<SyncTarget> {
        log_report(report);

        if self.target.is_some() || report.interval == 0 {
            return None;
        }

        let target = SyncTarget {
            addr: report.addr,
            sid: report.sid,
            interval_us: interval_to_us(report.interval),
        };
        info!("found periodic advertising from {} (SID {}, interval {} us)", target.addr, target.sid, target.interval_us);
        self.target = Some(target);
        Some(target)
    }
}

fn flag(props: u16, mask: u16) -> char {
    if props & mask != 0 { '*' } else { '-' }
}

fn log_report(report: &AdvertisementReport) {
    let name = parse_device_name(&report.data);
    let props = report.adv_props;
    debug!(
        "[DEVICE]: {}, AD evt type {}, Tx Pwr: {}, RSSI {} {:?} C:{} S:{} D:{} SR:{} E:{} Prim: {}, Secn: {}, Interval: 0x{:04x} ({} us), SID: {}",
        report.addr,
        report.adv_type,
        report.tx_power,
        report.rssi,
        name.as_deref().unwrap_or(""),
        flag(props, adv_props::CONNECTABLE),
        flag(props, adv_props::SCANNABLE),
        flag(props, adv_props::DIRECTED),
        flag(props, adv_props::SCAN_RESPONSE),
        flag(props, adv_props::EXT_ADV),
        Phy::describe(report.primary_phy),
        Phy::describe(report.secondary_phy),
        report.interval,
        interval_to_us(report.interval),
        report.sid,
    );
}
