//! Environment inputs the engine consumes from its collaborators.
//!
//! The engine never talks to a radio, an RTC, or the OS clock directly;
//! everything arrives through this trait so tests can script it.

/// Host environment: clock, memory, radio and RTC hooks.
///
/// `now_millis` must be monotonic. The radio hooks default to "no radio";
/// a node without them can never win a bridge election.
pub trait Platform {
    /// Monotonic milliseconds since an arbitrary epoch.
    fn now_millis(&self) -> u64;

    /// Free heap in bytes, used as an election tie-breaker.
    fn free_memory(&self) -> u32 {
        0
    }

    /// Scan for the router SSID; returns RSSI in dBm, or 0 when not visible.
    fn router_scan(&mut self, _ssid: &str) -> i8 {
        0
    }

    /// Associate the station interface with the given AP.
    fn station_connect(&mut self, _ssid: &str, _password: &str) -> bool {
        false
    }

    /// Drop the station association.
    fn station_disconnect(&mut self) {}

    /// Battery-backed RTC reading, when the node has one.
    fn rtc_unix_time(&self) -> Option<u64> {
        None
    }

    /// Push a synchronized time down to the RTC.
    fn set_rtc_unix_time(&mut self, _secs: u64) {}
}

/// [`Platform`] backed by the process clock. Radio hooks stay at their
/// defaults.
pub struct SystemPlatform {
    started: std::time::Instant,
}

impl SystemPlatform {
    pub fn new() -> Self {
        Self { started: std::time::Instant::now() }
    }
}

impl Default for SystemPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SystemPlatform {
    fn now_millis(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_platform_is_monotonic() {
        let platform = SystemPlatform::new();
        let a = platform.now_millis();
        let b = platform.now_millis();
        assert!(b >= a);
    }

    #[test]
    fn default_radio_is_absent() {
        let mut platform = SystemPlatform::new();
        assert_eq!(platform.router_scan("any"), 0);
        assert!(!platform.station_connect("any", "pw"));
        assert_eq!(platform.rtc_unix_time(), None);
    }
}
