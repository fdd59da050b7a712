//! Floor arbitration
//!
//! A single global mutex over "who is transmitting". All mutation goes
//! through [`FloorArbiter`]; callers funnel side effects (relay, recorder,
//! broadcasts) off the returned outcomes.

use log::{debug, info};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Reserved holder id for the server's own microphone.
pub const SERVER_CLIENT_ID: &str = "server";

/// Reserved holder id for the external VOX gateway.
pub const EXTERNAL_CLIENT_ID: &str = "external";

/// Display name reported for the external VOX holder.
pub const EXTERNAL_DISPLAY_NAME: &str = "外部デバイス";

/// True when the id names a connected web client rather than a reserved
/// holder. Real client ids are minted as 8 hex chars, so a plain comparison
/// against the reserved ids is sufficient.
pub fn is_web_client(holder: &str) -> bool {
    holder != SERVER_CLIENT_ID && holder != EXTERNAL_CLIENT_ID
}

/// Outcome of a floor request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FloorRequest {
    Granted,
    /// Denied; carries the current holder.
    Busy(String),
}

/// Outcome of a floor release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloorRelease {
    Released,
    /// The caller was not the holder; nothing changed.
    Ignored,
}

#[derive(Debug, Default)]
struct FloorState {
    holder: Option<String>,
    granted_at: Option<Instant>,
}

/// Single-holder floor mutex with an optional transmit timeout.
pub struct FloorArbiter {
    state: Mutex<FloorState>,
    max_duration: Duration,
}

impl FloorArbiter {
    /// `max_duration` of zero disables the timeout sweep.
    pub fn new(max_duration: Duration) -> Self {
        Self {
            state: Mutex::new(FloorState::default()),
            max_duration,
        }
    }

    /// Atomically claim the floor. Fails with the current holder when taken.
    pub fn request(&self, holder: &str) -> FloorRequest {
        let mut state = self.state.lock();
        match state.holder {
            Some(ref current) => {
                debug!("Floor busy: {} requested while {} holds", holder, current);
                FloorRequest::Busy(current.clone())
            }
            None => {
                info!("Floor granted to {}", holder);
                state.holder = Some(holder.to_string());
                state.granted_at = Some(Instant::now());
                FloorRequest::Granted
            }
        }
    }

    /// Release the floor if `holder` owns it. Mismatches are ignored so a
    /// stale client cannot eject the real speaker.
    pub fn release(&self, holder: &str) -> FloorRelease {
        let mut state = self.state.lock();
        if state.holder.as_deref() == Some(holder) {
            info!("Floor released by {}", holder);
            state.holder = None;
            state.granted_at = None;
            FloorRelease::Released
        } else {
            debug!("Ignoring floor release from non-holder {}", holder);
            FloorRelease::Ignored
        }
    }

    /// Unconditionally clear the floor (dashboard override). Returns the
    /// evicted holder, if any.
    pub fn force_release(&self) -> Option<String> {
        let mut state = self.state.lock();
        let evicted = state.holder.take();
        state.granted_at = None;
        if let Some(ref holder) = evicted {
            info!("Floor force-released (was held by {})", holder);
        }
        evicted
    }

    /// Evict the holder once it has exceeded the maximum transmit duration.
    /// Returns the evicted id, or `None` when nothing expired.
    pub fn sweep_timeout(&self) -> Option<String> {
        if self.max_duration.is_zero() {
            return None;
        }
        let mut state = self.state.lock();
        let granted_at = state.granted_at?;
        if granted_at.elapsed() > self.max_duration {
            let evicted = state.holder.take();
            state.granted_at = None;
            if let Some(ref holder) = evicted {
                info!("Floor timeout: evicting {}", holder);
            }
            evicted
        } else {
            None
        }
    }

    /// Snapshot of the current holder.
    pub fn holder(&self) -> Option<String> {
        self.state.lock().holder.clone()
    }

    /// True when `id` currently holds the floor.
    pub fn is_holder(&self, id: &str) -> bool {
        self.state.lock().holder.as_deref() == Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusivity_under_contention() {
        let arbiter = FloorArbiter::new(Duration::ZERO);
        assert_eq!(arbiter.request("aaaaaaaa"), FloorRequest::Granted);
        assert_eq!(
            arbiter.request("bbbbbbbb"),
            FloorRequest::Busy("aaaaaaaa".to_string())
        );
        assert_eq!(
            arbiter.request(EXTERNAL_CLIENT_ID),
            FloorRequest::Busy("aaaaaaaa".to_string())
        );
        assert!(arbiter.is_holder("aaaaaaaa"));
    }

    #[test]
    fn release_requires_matching_holder() {
        let arbiter = FloorArbiter::new(Duration::ZERO);
        assert_eq!(arbiter.request("aaaaaaaa"), FloorRequest::Granted);
        assert_eq!(arbiter.release("bbbbbbbb"), FloorRelease::Ignored);
        assert!(arbiter.is_holder("aaaaaaaa"));
        assert_eq!(arbiter.release("aaaaaaaa"), FloorRelease::Released);
        assert_eq!(arbiter.holder(), None);
        assert_eq!(arbiter.request("bbbbbbbb"), FloorRequest::Granted);
    }

    #[test]
    fn release_on_idle_floor_is_ignored() {
        let arbiter = FloorArbiter::new(Duration::ZERO);
        assert_eq!(arbiter.release("aaaaaaaa"), FloorRelease::Ignored);
    }

    #[test]
    fn sweep_disabled_when_duration_zero() {
        let arbiter = FloorArbiter::new(Duration::ZERO);
        arbiter.request("aaaaaaaa");
        assert_eq!(arbiter.sweep_timeout(), None);
        assert!(arbiter.is_holder("aaaaaaaa"));
    }

    #[test]
    fn sweep_evicts_expired_holder() {
        let arbiter = FloorArbiter::new(Duration::from_millis(1));
        arbiter.request("aaaaaaaa");
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(arbiter.sweep_timeout(), Some("aaaaaaaa".to_string()));
        assert_eq!(arbiter.holder(), None);
        // A second sweep finds nothing
        assert_eq!(arbiter.sweep_timeout(), None);
    }

    #[test]
    fn force_release_clears_any_holder() {
        let arbiter = FloorArbiter::new(Duration::ZERO);
        assert_eq!(arbiter.force_release(), None);
        arbiter.request(EXTERNAL_CLIENT_ID);
        assert_eq!(arbiter.force_release(), Some(EXTERNAL_CLIENT_ID.to_string()));
        assert_eq!(arbiter.holder(), None);
    }

    #[test]
    fn exclusivity_across_threads() {
        use std::sync::Arc;

        let arbiter = Arc::new(FloorArbiter::new(Duration::ZERO));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let arbiter = arbiter.clone();
                std::thread::spawn(move || {
                    arbiter.request(&format!("{:08x}", i)) == FloorRequest::Granted
                })
            })
            .collect();

        let granted = handles
            .into_iter()
            .filter_map(|h| h.join().ok())
            .filter(|&granted| granted)
            .count();
        assert_eq!(granted, 1);
        assert!(arbiter.holder().is_some());
    }

    #[test]
    fn reserved_ids_are_not_web_clients() {
        assert!(!is_web_client(SERVER_CLIENT_ID));
        assert!(!is_web_client(EXTERNAL_CLIENT_ID));
        assert!(is_web_client("aaaaaaaa"));
    }
}
