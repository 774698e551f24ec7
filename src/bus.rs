//! Bus connection management and the main dispatch loop.
//!
//! Owns the session and system connections, installs their message filters
//! and signal subscriptions, reconnects on a fixed period after a
//! disconnect, and garbage-collects leases when an owning peer vanishes.
//! The two connections are independent: losing one never stalls the other.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use zbus::fdo::{DBusProxy, RequestNameFlags, RequestNameReply};
use zbus::message::Type as MessageType;
use zbus::{Connection, MatchRule, MessageStream};

use crate::config::Config;
use crate::dispatcher::{Dispatcher, INTERFACE, OBJECT_PATH, SERVICE_NAME};
use crate::events::{self, EventReceiver, ServiceEvent};
use crate::policy::ActivationPolicy;
use crate::session_bridge::{self, SessionBridge};
use crate::session_manager::SessionManagerProxy;

const DBUS_SERVICE: &str = "org.freedesktop.DBus";
const DBUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Capacity of the collaborator broadcast channel.
const BROADCAST_CAPACITY: usize = 64;

/// Inbound seam for the idle-watcher collaborator: true when the session
/// goes idle, false on activity.
pub type IdleReportSender = mpsc::UnboundedSender<bool>;

/// Owns both bus connections and runs the dispatch loop.
pub struct BusConnectionManager {
    dispatcher: Dispatcher,
    events: EventReceiver,
    broadcast: broadcast::Sender<ServiceEvent>,
    reconnect_interval: Duration,

    /// Idle reports from the watcher collaborator; None once it hangs up.
    idle_reports: Option<mpsc::UnboundedReceiver<bool>>,

    session: Option<Connection>,
    session_stream: Option<MessageStream>,
    system: Option<Connection>,
    system_stream: Option<MessageStream>,

    /// Session identity is resolved once, on the first system connection.
    identity_resolved: bool,
}

impl BusConnectionManager {
    /// Build the manager and the arbitration components from config.
    /// Returns a broadcast receiver for the upward event surface and the
    /// sender the idle watcher reports through.
    pub fn new(
        config: &Config,
    ) -> (Self, broadcast::Receiver<ServiceEvent>, IdleReportSender) {
        let (tx, rx) = events::channel();
        let policy = ActivationPolicy::new(config.activation_enabled, tx.clone());
        let bridge = SessionBridge::new(config.lock_keyname.clone());
        let mirror =
            SessionManagerProxy::new(Duration::from_secs(config.mirror_timeout_seconds));
        let dispatcher = Dispatcher::new(policy, bridge, mirror, tx);

        let (broadcast_tx, broadcast_rx) = broadcast::channel(BROADCAST_CAPACITY);
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let manager = Self {
            dispatcher,
            events: rx,
            broadcast: broadcast_tx,
            reconnect_interval: Duration::from_secs(config.reconnect_interval_seconds),
            idle_reports: Some(idle_rx),
            session: None,
            session_stream: None,
            system: None,
            system_stream: None,
            identity_resolved: false,
        };
        (manager, broadcast_rx, idle_tx)
    }

    /// Run until Quit or Ctrl-C. Failing to acquire the well-known service
    /// name at startup is the one fatal error; everything later is retried.
    pub async fn run(mut self) -> Result<()> {
        self.connect_session(true).await?;
        if let Err(e) = self.connect_system().await {
            warn!("System bus unavailable, will retry: {:#}", e);
        }

        let mut reconnect = tokio::time::interval(self.reconnect_interval);
        reconnect.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Listening on {} at {}", SERVICE_NAME, OBJECT_PATH);

        loop {
            tokio::select! {
                msg = next_message(&mut self.session_stream) => {
                    match msg {
                        Some(Ok(msg)) => self.handle_session_message(&msg).await,
                        Some(Err(e)) => warn!("Bad message on session bus: {}", e),
                        None => {
                            warn!("Session bus disconnected, dropping connection");
                            self.drop_session();
                        }
                    }
                }

                msg = next_message(&mut self.system_stream) => {
                    match msg {
                        Some(Ok(msg)) => {
                            if msg.message_type() == MessageType::Signal {
                                self.dispatcher.handle_system_signal(&msg);
                            }
                        }
                        Some(Err(e)) => warn!("Bad message on system bus: {}", e),
                        None => {
                            warn!("System bus disconnected, dropping connection");
                            self.system = None;
                            self.system_stream = None;
                        }
                    }
                }

                report = next_idle_report(&mut self.idle_reports) => {
                    match report {
                        Some(idle) => self.dispatcher.handle_idle_report(idle),
                        None => {
                            debug!("Idle watcher hung up, parking its channel");
                            self.idle_reports = None;
                        }
                    }
                }

                _ = reconnect.tick() => {
                    self.retry_connections().await;
                }

                event = self.events.recv() => {
                    let Some(event) = event else { continue };
                    if self.forward_event(event).await {
                        info!("Quit requested, shutting down");
                        return Ok(());
                    }
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Connect to the session bus, acquire the service name and subscribe
    /// to peer-ownership changes. Only the initial acquisition is fatal.
    async fn connect_session(&mut self, initial: bool) -> Result<()> {
        let conn = Connection::session()
            .await
            .context("Failed to connect to session bus")?;

        let reply = conn
            .request_name_with_flags(SERVICE_NAME, RequestNameFlags::DoNotQueue.into())
            .await
            .context("Failed to request service name")?;
        if reply != RequestNameReply::PrimaryOwner {
            anyhow::bail!("{} is already owned by another instance", SERVICE_NAME);
        }

        let rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .sender(DBUS_SERVICE)?
            .interface(DBUS_INTERFACE)?
            .member("NameOwnerChanged")?
            .build();
        add_match(&conn, rule).await?;

        self.session_stream = Some(MessageStream::from(&conn));
        self.dispatcher.mirror.set_connection(Some(conn.clone()));
        self.session = Some(conn);
        if !initial {
            info!("Session bus reconnected");
        }
        Ok(())
    }

    /// Connect to the system bus and subscribe to the session-management
    /// and hardware-condition signals. Re-subscription is idempotent.
    async fn connect_system(&mut self) -> Result<()> {
        let conn = Connection::system()
            .await
            .context("Failed to connect to system bus")?;

        let session_rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .interface(session_bridge::CK_SESSION_INTERFACE)?
            .build();
        add_match(&conn, session_rule).await?;

        let condition_rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .interface(session_bridge::HAL_DEVICE_INTERFACE)?
            .member("Condition")?
            .build();
        add_match(&conn, condition_rule).await?;

        if !self.identity_resolved {
            self.dispatcher.bridge.resolve(&conn).await;
            self.identity_resolved = true;
        }

        self.system_stream = Some(MessageStream::from(&conn));
        self.system = Some(conn);
        Ok(())
    }

    fn drop_session(&mut self) {
        self.session = None;
        self.session_stream = None;
        // Mirror calls fail fast while disconnected; nothing is queued.
        self.dispatcher.mirror.set_connection(None);
    }

    async fn retry_connections(&mut self) {
        if self.session.is_none() {
            if let Err(e) = self.connect_session(false).await {
                warn!("Session bus reconnect failed, retrying: {:#}", e);
                self.drop_session();
            }
        }
        if self.system.is_none() {
            if let Err(e) = self.connect_system().await {
                debug!("System bus reconnect failed, retrying: {:#}", e);
            } else {
                info!("System bus reconnected");
            }
        }
    }

    /// Handle one message from the session connection.
    async fn handle_session_message(&mut self, msg: &zbus::Message) {
        match msg.message_type() {
            MessageType::MethodCall => {
                let Some(conn) = self.session.clone() else {
                    return;
                };
                if let Err(e) = self.dispatcher.handle_method_call(&conn, msg).await {
                    warn!("Failed to handle method call: {:#}", e);
                }
            }
            MessageType::Signal => {
                let header = msg.header();
                let is_owner_change = header.interface().is_some_and(|i| i.as_str() == DBUS_INTERFACE)
                    && header.member().is_some_and(|m| m.as_str() == "NameOwnerChanged");
                if !is_owner_change {
                    return;
                }
                match msg.body().deserialize::<(String, String, String)>() {
                    Ok((name, old, new)) => {
                        if let Some(owner) = vanished_peer(&name, &old, &new) {
                            debug!("Peer {} vanished, reaping its leases", owner);
                            self.dispatcher.handle_peer_vanished(owner).await;
                        }
                    }
                    Err(e) => warn!("Malformed NameOwnerChanged signal: {}", e),
                }
            }
            _ => {}
        }
    }

    /// Republish an event for collaborators and emit the bus-visible
    /// signal where one exists. Returns true when the daemon should quit.
    async fn forward_event(&mut self, event: ServiceEvent) -> bool {
        if let ServiceEvent::ActiveChanged(value) = event {
            self.emit_active_changed(value).await;
        }
        let quit = event == ServiceEvent::Quit;
        // No subscribers is fine; collaborators are optional.
        let _ = self.broadcast.send(event);
        quit
    }

    /// Broadcast the ActiveChanged signal to all bus clients. Fails fast
    /// while the session connection is down.
    async fn emit_active_changed(&self, value: bool) {
        let Some(ref conn) = self.session else {
            debug!("Session bus down, dropping ActiveChanged({})", value);
            return;
        };
        let signal = zbus::Message::signal(OBJECT_PATH, INTERFACE, "ActiveChanged")
            .and_then(|builder| builder.build(&value));
        match signal {
            Ok(msg) => {
                if let Err(e) = conn.send(&msg).await {
                    warn!("Failed to emit ActiveChanged: {}", e);
                }
            }
            Err(e) => warn!("Failed to build ActiveChanged: {}", e),
        }
    }
}

/// Yield the next idle report, or park forever once the watcher is gone.
async fn next_idle_report(rx: &mut Option<mpsc::UnboundedReceiver<bool>>) -> Option<bool> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Yield the next message, or park forever while disconnected.
async fn next_message(
    stream: &mut Option<MessageStream>,
) -> Option<zbus::Result<zbus::Message>> {
    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn add_match(conn: &Connection, rule: MatchRule<'_>) -> Result<()> {
    DBusProxy::new(conn)
        .await
        .context("Failed to create bus proxy")?
        .add_match_rule(rule)
        .await
        .context("Failed to add match rule")?;
    Ok(())
}

/// A peer vanished when a unique name lost its owner. Well-known-name
/// handovers (non-empty new owner) are not a disappearance.
fn vanished_peer<'a>(name: &'a str, old: &str, new: &str) -> Option<&'a str> {
    if name.starts_with(':') && !old.is_empty() && new.is_empty() {
        Some(name)
    } else {
        None
    }
}
