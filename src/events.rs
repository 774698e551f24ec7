//! Upward event surface toward out-of-process collaborators.
//!
//! The dispatcher and policy publish these on an unbounded channel; the bus
//! loop turns `ActiveChanged` into the D-Bus broadcast signal and republishes
//! everything for collaborator tasks (renderer, auth dialog, DPMS sync).

/// Event emitted by the arbitration core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// A client or the session layer requested the screen be locked.
    Lock,

    /// A client requested the visual cycle to the next screensaver theme.
    Cycle,

    /// A client requested daemon shutdown.
    Quit,

    /// User activity should be simulated (resets external idle watchers).
    SimulateUserActivity,

    /// The activation (locked/blanked) state flipped.
    ActiveChanged(bool),

    /// The throttled predicate crossed an edge. Never repeated for lease
    /// adds/removes that leave the predicate unchanged.
    ThrottleChanged(bool),

    /// Message to overlay on the locked screen.
    ShowMessage {
        summary: String,
        body: String,
        icon: String,
    },
}

/// Sender half used by the policy and dispatcher.
pub type EventSender = tokio::sync::mpsc::UnboundedSender<ServiceEvent>;

/// Receiver half drained by the bus loop.
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<ServiceEvent>;

/// Create the event channel pair.
pub fn channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}
