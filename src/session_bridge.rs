//! Bridge to the session-management layer on the system bus.
//!
//! Resolves this process's session identity once at startup, then translates
//! session-scoped Lock/Unlock/ActiveChanged signals and the hardware lock-key
//! condition into local policy actions. If identity resolution fails the
//! bridge stays permanently inert rather than blocking startup.

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use zbus::Connection;

use crate::events::{EventSender, ServiceEvent};
use crate::lease::{LeaseKind, LeaseRegistry};
use crate::policy::ActivationPolicy;

const CK_SERVICE: &str = "org.freedesktop.ConsoleKit";
const CK_MANAGER_PATH: &str = "/org/freedesktop/ConsoleKit/Manager";
const CK_MANAGER_INTERFACE: &str = "org.freedesktop.ConsoleKit.Manager";
pub(crate) const CK_SESSION_INTERFACE: &str = "org.freedesktop.ConsoleKit.Session";
pub(crate) const HAL_DEVICE_INTERFACE: &str = "org.freedesktop.Hal.Device";

/// Owner recorded on the implicit foreground-throttle lease. Unique bus
/// names start with ':' so this can never collide with a real peer.
const BRIDGE_OWNER: &str = "screenlockd.session-bridge";

/// Session-signal bridge state.
pub struct SessionBridge {
    /// Object path of this login session, or None when resolution failed.
    session_path: Option<String>,

    /// Cookie of the single throttle lease held while the session is not
    /// foreground. Created and destroyed only in matched pairs.
    foreground_slot: Option<u32>,

    /// Hardware button name that triggers a lock request.
    lock_keyname: String,
}

impl SessionBridge {
    /// Create an unresolved bridge.
    pub fn new(lock_keyname: impl Into<String>) -> Self {
        Self {
            session_path: None,
            foreground_slot: None,
            lock_keyname: lock_keyname.into(),
        }
    }

    /// Resolve the session identity once. On failure the bridge degrades to
    /// matching nothing.
    pub async fn resolve(&mut self, conn: &Connection) {
        match get_current_session(conn).await {
            Ok(path) => {
                info!("Resolved session path: {}", path);
                self.session_path = Some(path);
            }
            Err(e) => {
                warn!(
                    "Could not resolve session identity, session signals will be ignored: {:#}",
                    e
                );
                self.session_path = None;
            }
        }
    }

    /// Whether a signal path belongs to this session.
    fn matches_session(&self, path: Option<&str>) -> bool {
        match (&self.session_path, path) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => false,
        }
    }

    /// Route one signal received on the system connection.
    pub fn handle_system_signal(
        &mut self,
        msg: &zbus::Message,
        registry: &mut LeaseRegistry,
        policy: &mut ActivationPolicy,
        events: &EventSender,
    ) {
        let header = msg.header();
        let Some(interface) = header.interface() else {
            return;
        };
        let Some(member) = header.member() else {
            return;
        };

        if interface.as_str() == CK_SESSION_INTERFACE {
            let path = header.path().map(zbus::zvariant::ObjectPath::as_str);
            if !self.matches_session(path) {
                return;
            }
            match member.as_str() {
                "Lock" => self.on_session_lock(events),
                "Unlock" => Self::on_session_unlock(policy),
                "ActiveChanged" => match msg.body().deserialize::<bool>() {
                    Ok(foreground) => {
                        self.on_foreground_changed(foreground, registry, policy, events);
                    }
                    Err(e) => warn!("Malformed session ActiveChanged signal: {}", e),
                },
                _ => {}
            }
        } else if interface.as_str() == HAL_DEVICE_INTERFACE && member.as_str() == "Condition" {
            match msg.body().deserialize::<(String, String)>() {
                Ok((event, keyname)) => self.on_hardware_condition(&event, &keyname, events),
                Err(e) => warn!("Malformed hardware condition signal: {}", e),
            }
        }
    }

    /// Session layer asked for the screen to be locked.
    fn on_session_lock(&self, events: &EventSender) {
        debug!("Session lock signal received");
        let _ = events.send(ServiceEvent::Lock);
    }

    /// Session-layer unlock is authoritative and bypasses the veto.
    fn on_session_unlock(policy: &mut ActivationPolicy) {
        debug!("Session unlock signal received");
        policy.force_active_off();
    }

    /// Foreground transitions map to the single implicit throttle lease.
    pub fn on_foreground_changed(
        &mut self,
        foreground: bool,
        registry: &mut LeaseRegistry,
        policy: &mut ActivationPolicy,
        events: &EventSender,
    ) {
        if foreground {
            match self.foreground_slot.take() {
                Some(cookie) => {
                    registry.remove(LeaseKind::Throttle, cookie);
                }
                None => {
                    warn!("Session regained foreground but no throttle lease was held");
                }
            }
            policy.check_throttle(registry.count(LeaseKind::Throttle));
            let _ = events.send(ServiceEvent::SimulateUserActivity);
        } else {
            if let Some(stale) = self.foreground_slot {
                // Last writer wins; the stale lease's release is leaked.
                warn!(
                    "Foreground throttle lease {} already held, overwriting",
                    stale
                );
            }
            let cookie = registry.add(
                LeaseKind::Throttle,
                BRIDGE_OWNER,
                "screenlockd",
                "session not foreground",
            );
            self.foreground_slot = Some(cookie);
            policy.check_throttle(registry.count(LeaseKind::Throttle));
        }
    }

    /// Relay the hardware lock key, independent of session scoping.
    fn on_hardware_condition(&self, event: &str, keyname: &str, events: &EventSender) {
        if event == "ButtonPressed" && keyname == self.lock_keyname {
            debug!("Hardware lock key pressed");
            let _ = events.send(ServiceEvent::Lock);
        }
    }
}

/// Ask the session-management layer which session this process belongs to.
async fn get_current_session(conn: &Connection) -> Result<String> {
    let proxy = zbus::Proxy::new(conn, CK_SERVICE, CK_MANAGER_PATH, CK_MANAGER_INTERFACE)
        .await
        .context("Failed to create session manager proxy")?;

    let path: zbus::zvariant::OwnedObjectPath = proxy
        .call("GetCurrentSession", &())
        .await
        .context("GetCurrentSession call failed")?;

    Ok(path.to_string())
}
