//! Rate-limited framed writes.

use crate::domain::models::{SendOutcome, SendRejection, WriteTarget};
use crate::domain::protocol;
use crate::domain::radio::RadioAdapter;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Fixed inter-frame delay.
///
/// Armed when a frame goes out; it only ever ends by its deadline passing.
/// There is no early cancel.
#[derive(Debug, Clone)]
pub struct Cooldown {
    period: Duration,
    deadline: Option<Instant>,
}

impl Cooldown {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            deadline: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_active(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now < deadline => true,
            Some(_) => {
                self.deadline = None;
                false
            }
            None => false,
        }
    }

    fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.period);
    }
}

/// Frames payloads and pushes at most one write per cooldown window.
#[derive(Debug, Clone)]
pub struct FrameTransmitter {
    cooldown: Cooldown,
}

impl FrameTransmitter {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown: Cooldown::new(cooldown),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown.period()
    }

    /// Frame `payload` and write it if the window is open.
    ///
    /// `target` is `None` when no characteristic has been resolved yet.
    pub fn transmit<R: RadioAdapter>(
        &mut self,
        radio: &R,
        target: Option<&WriteTarget>,
        payload: &[u8],
    ) -> SendOutcome {
        let Some(target) = target else {
            return SendOutcome::Rejected(SendRejection::NoSession);
        };

        let now = Instant::now();
        if self.cooldown.is_active(now) {
            debug!("Dropping {} byte payload, cooldown active", payload.len());
            return SendOutcome::Rejected(SendRejection::CoolingDown);
        }

        if protocol::payload_contains_marker(payload) {
            warn!("Payload {:02X?} contains a frame marker byte", payload);
        }

        let frame = protocol::encode_frame(payload);
        radio.write_value(target, &frame, target.mode);
        self.cooldown.arm(now);

        debug!(
            "Frame {:02X?} written to {} ({:?})",
            frame, target.peripheral, target.mode
        );
        SendOutcome::Accepted
    }
}
