//! Matchmaking: searching, auto-rematch and the negotiation timeout
//!
//! The controller turns the auto-search flag and user intent into
//! `FindPartner` emissions and owns the two timers of the call lifecycle:
//!
//! - the **rematch** timer, a fixed pause before an automatic `FindPartner`
//!   so an empty pairing server is not hammered
//! - the **negotiation** timer, after which a pairing that never connected is
//!   abandoned
//!
//! At most one timer of each kind exists. Timers do not act on their own;
//! they post a [`TimerFired`] back to the state machine, which checks it with
//! [`MatchmakingController::accept_timer`] so a fire that raced a
//! cancellation is ignored.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::CallConfig;
use crate::error::CallResult;
use crate::signaling::{SignalingMessage, SignalingPort};
use crate::types::SessionEpoch;

/// Which timer fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Time to search again
    Rematch,
    /// Negotiation took too long
    NegotiationTimeout,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rematch => f.write_str("rematch"),
            Self::NegotiationTimeout => f.write_str("negotiation timeout"),
        }
    }
}

/// Notification that a timer elapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    /// Which timer
    pub kind: TimerKind,
    /// Identity of the arming that fired
    pub timer_id: u64,
    /// Session the negotiation timer was armed for
    pub epoch: Option<SessionEpoch>,
}

struct ArmedTimer {
    id: u64,
    epoch: Option<SessionEpoch>,
    handle: JoinHandle<()>,
}

impl ArmedTimer {
    fn cancel(self) {
        self.handle.abort();
    }
}

/// Search and timer bookkeeping for one session controller
pub struct MatchmakingController {
    signaling: Arc<dyn SignalingPort>,
    auto_search: bool,
    rematch_delay: Duration,
    negotiation_timeout: Duration,
    next_timer_id: u64,
    rematch: Option<ArmedTimer>,
    negotiation: Option<ArmedTimer>,
    timers_tx: mpsc::UnboundedSender<TimerFired>,
}

impl MatchmakingController {
    /// Create a controller; timer fires are posted to `timers_tx`
    pub fn new(
        config: &CallConfig,
        signaling: Arc<dyn SignalingPort>,
        timers_tx: mpsc::UnboundedSender<TimerFired>,
    ) -> Self {
        Self {
            signaling,
            auto_search: config.auto_search,
            rematch_delay: config.rematch_delay(),
            negotiation_timeout: config.negotiation_timeout(),
            next_timer_id: 0,
            rematch: None,
            negotiation: None,
            timers_tx,
        }
    }

    /// Auto-search flag
    pub fn auto_search(&self) -> bool {
        self.auto_search
    }

    /// Set the auto-search flag; returns the previous value.
    ///
    /// Turning it off cancels a pending rematch.
    pub fn set_auto_search(&mut self, enabled: bool) -> bool {
        let previous = self.auto_search;
        self.auto_search = enabled;
        if !enabled {
            self.cancel_rematch();
        }
        previous
    }

    /// Pause applied before an automatic search
    pub fn rematch_delay(&self) -> Duration {
        self.rematch_delay
    }

    /// Ask the pairing server for a partner.
    ///
    /// A pending rematch is superseded by the explicit search.
    pub async fn find_partner(&mut self) -> CallResult<()> {
        self.cancel_rematch();
        self.signaling.publish(SignalingMessage::FindPartner).await?;
        info!("FindPartner sent");
        Ok(())
    }

    /// Arm the rematch timer.
    ///
    /// Returns `false` without doing anything when one is already pending, so
    /// near-simultaneous teardowns schedule a single search.
    pub fn schedule_rematch(&mut self) -> bool {
        if self.rematch.is_some() {
            debug!("rematch already pending");
            return false;
        }
        let timer = self.arm(TimerKind::Rematch, self.rematch_delay, None);
        debug!(timer_id = timer.id, delay_ms = self.rematch_delay.as_millis() as u64, "rematch scheduled");
        self.rematch = Some(timer);
        true
    }

    /// Drop a pending rematch; returns whether one was pending
    pub fn cancel_rematch(&mut self) -> bool {
        match self.rematch.take() {
            Some(timer) => {
                debug!(timer_id = timer.id, "rematch cancelled");
                timer.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a rematch timer is armed
    pub fn rematch_pending(&self) -> bool {
        self.rematch.is_some()
    }

    /// Start the negotiation clock for `epoch`, replacing any previous one
    pub fn arm_negotiation_timeout(&mut self, epoch: SessionEpoch) {
        self.disarm_negotiation_timeout();
        let timer = self.arm(TimerKind::NegotiationTimeout, self.negotiation_timeout, Some(epoch));
        self.negotiation = Some(timer);
    }

    /// Stop the negotiation clock
    pub fn disarm_negotiation_timeout(&mut self) {
        if let Some(timer) = self.negotiation.take() {
            timer.cancel();
        }
    }

    /// Whether the negotiation clock is running
    pub fn negotiation_timeout_armed(&self) -> bool {
        self.negotiation.is_some()
    }

    /// Check a fire against the armed timer of its kind.
    ///
    /// Returns `true` and forgets the timer if the fire belongs to the current
    /// arming; anything else is a leftover from a cancelled timer.
    pub fn accept_timer(&mut self, fired: &TimerFired) -> bool {
        let slot = match fired.kind {
            TimerKind::Rematch => &mut self.rematch,
            TimerKind::NegotiationTimeout => &mut self.negotiation,
        };
        let armed = slot.as_ref().map(|timer| (timer.id, timer.epoch));
        if armed == Some((fired.timer_id, fired.epoch)) {
            *slot = None;
            true
        } else {
            debug!(kind = %fired.kind, timer_id = fired.timer_id, "ignoring stale timer");
            false
        }
    }

    /// Cancel both timers
    pub fn cancel_all(&mut self) {
        self.cancel_rematch();
        self.disarm_negotiation_timeout();
    }

    fn arm(&mut self, kind: TimerKind, delay: Duration, epoch: Option<SessionEpoch>) -> ArmedTimer {
        self.next_timer_id += 1;
        let id = self.next_timer_id;
        let tx = self.timers_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerFired {
                kind,
                timer_id: id,
                epoch,
            });
        });
        ArmedTimer { id, epoch, handle }
    }
}

impl Drop for MatchmakingController {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::memory::{MemorySignalingPort, MemorySignalingRemote};

    fn controller(
        auto_search: bool,
    ) -> (MatchmakingController, mpsc::UnboundedReceiver<TimerFired>, MemorySignalingRemote) {
        let (port, remote) = MemorySignalingPort::pair(8);
        let (tx, rx) = mpsc::unbounded_channel();
        let config = CallConfig::new().with_auto_search(auto_search);
        (MatchmakingController::new(&config, Arc::new(port), tx), rx, remote)
    }

    #[tokio::test(start_paused = true)]
    async fn rematch_fires_after_the_delay() {
        let (mut mm, mut fired, _remote) = controller(true);
        assert!(mm.schedule_rematch());
        assert!(mm.rematch_pending());

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(fired.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        let fire = fired.recv().await.unwrap();
        assert_eq!(fire.kind, TimerKind::Rematch);
        assert!(mm.accept_timer(&fire));
        assert!(!mm.rematch_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn second_schedule_is_a_no_op() {
        let (mut mm, mut fired, _remote) = controller(true);
        assert!(mm.schedule_rematch());
        assert!(!mm.schedule_rematch());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.recv().await.is_some());
        assert!(fired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_fire_is_rejected() {
        let (mut mm, _fired, _remote) = controller(true);
        mm.schedule_rematch();
        let stale = TimerFired {
            kind: TimerKind::Rematch,
            timer_id: 1,
            epoch: None,
        };
        assert!(mm.cancel_rematch());
        assert!(!mm.accept_timer(&stale));
    }

    #[tokio::test(start_paused = true)]
    async fn negotiation_timer_is_bound_to_its_epoch() {
        let (mut mm, mut fired, _remote) = controller(false);
        mm.arm_negotiation_timeout(SessionEpoch(4));
        tokio::time::sleep(Duration::from_secs(11)).await;

        let fire = fired.recv().await.unwrap();
        assert_eq!(fire.kind, TimerKind::NegotiationTimeout);
        assert_eq!(fire.epoch, Some(SessionEpoch(4)));

        let mut forged = fire;
        forged.epoch = Some(SessionEpoch(5));
        assert!(!mm.accept_timer(&forged));
        assert!(mm.accept_timer(&fire));
        assert!(!mm.negotiation_timeout_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_previous_timer() {
        let (mut mm, mut fired, _remote) = controller(false);
        mm.arm_negotiation_timeout(SessionEpoch(1));
        mm.arm_negotiation_timeout(SessionEpoch(2));
        tokio::time::sleep(Duration::from_secs(11)).await;

        let fire = fired.recv().await.unwrap();
        assert_eq!(fire.epoch, Some(SessionEpoch(2)));
        assert!(fired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_auto_search_cancels_rematch() {
        let (mut mm, _fired, _remote) = controller(true);
        mm.schedule_rematch();
        assert!(mm.set_auto_search(false));
        assert!(!mm.rematch_pending());
        assert!(!mm.auto_search());
    }

    #[tokio::test]
    async fn find_partner_publishes_and_supersedes_rematch() {
        let (mut mm, _fired, remote) = controller(true);
        mm.schedule_rematch();
        mm.find_partner().await.unwrap();
        assert!(!mm.rematch_pending());
        assert_eq!(remote.next_published().await, Some(SignalingMessage::FindPartner));
    }

    #[tokio::test]
    async fn find_partner_fails_when_transport_is_down() {
        let (mut mm, _fired, remote) = controller(false);
        remote.disconnect().await.unwrap();
        assert!(mm.find_partner().await.is_err());
    }
}
