//! Inbound method routing for the exposed screensaver interface.
//!
//! Owns the lease registry, the activation policy, the session bridge and
//! the session-manager mirror, and translates bus method calls into
//! operations on them. Malformed argument lists get a SyntaxError reply
//! naming the method; they never leave a half-applied state change.

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, warn};
use zbus::Connection;

use crate::events::{EventSender, ServiceEvent};
use crate::lease::{LeaseKind, LeaseRegistry};
use crate::policy::ActivationPolicy;
use crate::session_bridge::SessionBridge;
use crate::session_manager::SessionManagerProxy;

/// Well-known name, object path and interface of the exposed service.
pub const SERVICE_NAME: &str = "org.gnome.ScreenSaver";
pub const OBJECT_PATH: &str = "/org/gnome/ScreenSaver";
pub const INTERFACE: &str = "org.gnome.ScreenSaver";

const SYNTAX_ERROR_NAME: &str = "org.gnome.ScreenSaver.SyntaxError";
const UNKNOWN_METHOD_ERROR: &str = "org.freedesktop.DBus.Error.UnknownMethod";
const UNKNOWN_INTERFACE_ERROR: &str = "org.freedesktop.DBus.Error.UnknownInterface";
const UNKNOWN_OBJECT_ERROR: &str = "org.freedesktop.DBus.Error.UnknownObject";
const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

/// Introspection document served for the exposed object.
const INTROSPECTION_XML: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg name="data" direction="out" type="s"/>
    </method>
  </interface>
  <interface name="org.gnome.ScreenSaver">
    <method name="Lock"/>
    <method name="Cycle"/>
    <method name="Quit"/>
    <method name="SimulateUserActivity"/>
    <method name="Inhibit">
      <arg name="application_name" direction="in" type="s"/>
      <arg name="reason" direction="in" type="s"/>
      <arg name="cookie" direction="out" type="u"/>
    </method>
    <method name="UnInhibit">
      <arg name="cookie" direction="in" type="u"/>
    </method>
    <method name="GetInhibitors">
      <arg name="list" direction="out" type="as"/>
    </method>
    <method name="Throttle">
      <arg name="application_name" direction="in" type="s"/>
      <arg name="reason" direction="in" type="s"/>
      <arg name="cookie" direction="out" type="u"/>
    </method>
    <method name="UnThrottle">
      <arg name="cookie" direction="in" type="u"/>
    </method>
    <method name="SetActive">
      <arg name="value" direction="in" type="b"/>
      <arg name="accepted" direction="out" type="b"/>
    </method>
    <method name="GetActive">
      <arg name="value" direction="out" type="b"/>
    </method>
    <method name="GetActiveTime">
      <arg name="seconds" direction="out" type="u"/>
    </method>
    <method name="GetSessionIdle">
      <arg name="value" direction="out" type="b"/>
    </method>
    <method name="GetSessionIdleTime">
      <arg name="seconds" direction="out" type="u"/>
    </method>
    <method name="ShowMessage">
      <arg name="summary" direction="in" type="s"/>
      <arg name="body" direction="in" type="s"/>
      <arg name="icon_name" direction="in" type="s"/>
    </method>
    <signal name="ActiveChanged">
      <arg name="new_value" type="b"/>
    </signal>
  </interface>
</node>
"#;

/// Failures routing one inbound method call.
#[derive(Debug, Error)]
enum DispatchError {
    /// Malformed argument list for a known method.
    #[error("There is a syntax error in the invocation of the method {method}")]
    Syntax { method: &'static str },

    /// Member not part of the interface.
    #[error("Unknown method: {member}")]
    UnknownMethod { member: String },

    /// Reply construction failed at the bus layer.
    #[error(transparent)]
    Bus(#[from] zbus::Error),
}

/// Routes method calls and system signals to the arbitration components.
pub struct Dispatcher {
    pub registry: LeaseRegistry,
    pub policy: ActivationPolicy,
    pub bridge: SessionBridge,
    pub mirror: SessionManagerProxy,
    events: EventSender,
}

impl Dispatcher {
    pub fn new(
        policy: ActivationPolicy,
        bridge: SessionBridge,
        mirror: SessionManagerProxy,
        events: EventSender,
    ) -> Self {
        Self {
            registry: LeaseRegistry::new(),
            policy,
            bridge,
            mirror,
            events,
        }
    }

    /// Handle one inbound method call: build the reply (success or error)
    /// and send it back on the connection.
    pub async fn handle_method_call(
        &mut self,
        conn: &Connection,
        msg: &zbus::Message,
    ) -> Result<()> {
        let reply = self.reply_for(msg).await?;
        conn.send(&reply)
            .await
            .context("Failed to send method reply")?;
        Ok(())
    }

    /// Route one signal received on the system connection.
    pub fn handle_system_signal(&mut self, msg: &zbus::Message) {
        self.bridge
            .handle_system_signal(msg, &mut self.registry, &mut self.policy, &self.events);
    }

    /// Apply an idle report from the watcher collaborator, arbitrated
    /// against the live inhibitor set.
    pub fn handle_idle_report(&mut self, idle: bool) {
        self.policy
            .set_session_idle(idle, self.registry.count(LeaseKind::Inhibit));
    }

    /// Garbage-collect every lease held by a vanished peer, releasing any
    /// session-manager mirrors and re-running the activation and throttle
    /// checks when something was removed.
    pub async fn handle_peer_vanished(&mut self, owner: &str) {
        let removed_inhibit = self.registry.remove_all_for_owner(LeaseKind::Inhibit, owner);
        for lease in &removed_inhibit {
            self.mirror.mirror_uninhibit(lease.foreign_cookie).await;
        }
        let removed_throttle = self.registry.remove_all_for_owner(LeaseKind::Throttle, owner);

        if !removed_inhibit.is_empty() {
            self.policy
                .check_activation(self.registry.count(LeaseKind::Inhibit));
        }
        if !removed_throttle.is_empty() {
            self.policy
                .check_throttle(self.registry.count(LeaseKind::Throttle));
        }
    }

    /// Build the reply message for one method call without sending it.
    async fn reply_for(&mut self, msg: &zbus::Message) -> Result<zbus::Message> {
        let header = msg.header();
        let member = header
            .member()
            .map(|m| m.as_str().to_owned())
            .unwrap_or_default();
        let interface = header.interface().map(|i| i.as_str().to_owned());
        let sender = header
            .sender()
            .map(|s| s.as_str().to_owned())
            .unwrap_or_default();

        if let Some(path) = header.path()
            && path.as_str() != OBJECT_PATH
        {
            let text = format!("Unknown object: {path}");
            return build_error(msg, UNKNOWN_OBJECT_ERROR, &text);
        }

        match interface.as_deref() {
            Some(INTROSPECTABLE_INTERFACE) if member == "Introspect" => {
                build_return(msg, &INTROSPECTION_XML.to_string())
            }
            Some(INTERFACE) | None => match self.dispatch(msg, &member, &sender).await {
                Ok(reply) => Ok(reply),
                Err(e @ DispatchError::Syntax { .. }) => {
                    warn!("{}", e);
                    build_error(msg, SYNTAX_ERROR_NAME, &e.to_string())
                }
                Err(e @ DispatchError::UnknownMethod { .. }) => {
                    debug!("{}", e);
                    build_error(msg, UNKNOWN_METHOD_ERROR, &e.to_string())
                }
                Err(DispatchError::Bus(e)) => Err(e).context("Failed to build reply"),
            },
            Some(other) => build_error(
                msg,
                UNKNOWN_INTERFACE_ERROR,
                &format!("Unknown interface: {other}"),
            ),
        }
    }

    async fn dispatch(
        &mut self,
        msg: &zbus::Message,
        member: &str,
        sender: &str,
    ) -> Result<zbus::Message, DispatchError> {
        match member {
            "Lock" => {
                self.lock();
                empty_return(msg)
            }
            "Cycle" => {
                self.cycle();
                empty_return(msg)
            }
            "Quit" => {
                self.quit();
                empty_return(msg)
            }
            "SimulateUserActivity" => {
                self.simulate_user_activity();
                empty_return(msg)
            }
            "Inhibit" => {
                let (application, reason): (String, String) = parse_args(msg, "Inhibit")?;
                let cookie = self.inhibit(sender, application, reason).await;
                value_return(msg, &cookie)
            }
            "UnInhibit" => {
                let cookie: u32 = parse_args(msg, "UnInhibit")?;
                self.uninhibit(cookie).await;
                empty_return(msg)
            }
            "GetInhibitors" => value_return(msg, &self.get_inhibitors()),
            "Throttle" => {
                let (application, reason): (String, String) = parse_args(msg, "Throttle")?;
                let cookie = self.throttle(sender, application, reason);
                value_return(msg, &cookie)
            }
            "UnThrottle" => {
                let cookie: u32 = parse_args(msg, "UnThrottle")?;
                self.unthrottle(cookie);
                empty_return(msg)
            }
            "SetActive" => {
                let value: bool = parse_args(msg, "SetActive")?;
                let accepted = self.set_active(value);
                value_return(msg, &accepted)
            }
            "GetActive" => value_return(msg, &self.policy.is_active()),
            "GetActiveTime" => value_return(msg, &self.policy.get_active_time()),
            "GetSessionIdle" => value_return(msg, &self.policy.is_session_idle()),
            "GetSessionIdleTime" => value_return(msg, &self.policy.get_session_idle_time()),
            "ShowMessage" => {
                let (summary, body, icon): (String, String, String) =
                    parse_args(msg, "ShowMessage")?;
                self.show_message(summary, body, icon);
                empty_return(msg)
            }
            other => Err(DispatchError::UnknownMethod {
                member: other.to_owned(),
            }),
        }
    }

    fn lock(&self) {
        debug!("Lock requested");
        let _ = self.events.send(ServiceEvent::Lock);
    }

    fn cycle(&self) {
        debug!("Cycle requested");
        let _ = self.events.send(ServiceEvent::Cycle);
    }

    fn quit(&self) {
        debug!("Quit requested");
        let _ = self.events.send(ServiceEvent::Quit);
    }

    fn simulate_user_activity(&self) {
        let _ = self.events.send(ServiceEvent::SimulateUserActivity);
    }

    /// Create an inhibit lease, mirror it best-effort to the session
    /// manager, and re-run the activation check.
    pub async fn inhibit(&mut self, owner: &str, application: String, reason: String) -> u32 {
        let cookie = self
            .registry
            .add(LeaseKind::Inhibit, owner, application.clone(), reason.clone());

        if let Some(foreign) = self.mirror.mirror_inhibit(&application, &reason).await {
            self.registry.set_foreign_cookie(cookie, foreign);
        }

        self.policy
            .check_activation(self.registry.count(LeaseKind::Inhibit));
        cookie
    }

    /// Remove an inhibit lease. Unknown cookies are a no-op returning false.
    pub async fn uninhibit(&mut self, cookie: u32) -> bool {
        match self.registry.remove(LeaseKind::Inhibit, cookie) {
            Some(lease) => {
                self.mirror.mirror_uninhibit(lease.foreign_cookie).await;
                self.policy
                    .check_activation(self.registry.count(LeaseKind::Inhibit));
                true
            }
            None => false,
        }
    }

    /// Create a throttle lease and recompute the throttled predicate.
    pub fn throttle(&mut self, owner: &str, application: String, reason: String) -> u32 {
        let cookie = self
            .registry
            .add(LeaseKind::Throttle, owner, application, reason);
        self.policy
            .check_throttle(self.registry.count(LeaseKind::Throttle));
        cookie
    }

    /// Remove a throttle lease. Unknown cookies are a no-op returning false.
    pub fn unthrottle(&mut self, cookie: u32) -> bool {
        if self.registry.remove(LeaseKind::Throttle, cookie).is_some() {
            self.policy
                .check_throttle(self.registry.count(LeaseKind::Throttle));
            true
        } else {
            false
        }
    }

    /// Human-readable descriptors for the live inhibitor leases.
    pub fn get_inhibitors(&self) -> Vec<String> {
        self.registry.descriptors(LeaseKind::Inhibit)
    }

    /// Direct activation request. Deliberately does not consult the
    /// inhibitor set: only the idle-triggered path checks it.
    pub fn set_active(&mut self, value: bool) -> bool {
        self.policy.request_active(value)
    }

    /// Forward a message to the display collaborator, but only while the
    /// screen is active; while inactive it is accepted and dropped.
    pub fn show_message(&mut self, summary: String, body: String, icon: String) {
        if self.policy.is_active() {
            let _ = self.events.send(ServiceEvent::ShowMessage {
                summary,
                body,
                icon,
            });
        } else {
            debug!("Not active, dropping message: {}", summary);
        }
    }
}

/// Deserialize the argument list, mapping failure to a syntax error naming
/// the method.
fn parse_args<T>(msg: &zbus::Message, method: &'static str) -> Result<T, DispatchError>
where
    T: for<'de> serde::Deserialize<'de> + zbus::zvariant::Type,
{
    msg.body()
        .deserialize()
        .map_err(|_| DispatchError::Syntax { method })
}

fn empty_return(msg: &zbus::Message) -> Result<zbus::Message, DispatchError> {
    value_return(msg, &())
}

fn value_return<T>(msg: &zbus::Message, value: &T) -> Result<zbus::Message, DispatchError>
where
    T: serde::Serialize + zbus::zvariant::DynamicType,
{
    let reply = zbus::Message::method_return(&msg.header())?.build(value)?;
    Ok(reply)
}

fn build_return<T>(msg: &zbus::Message, body: &T) -> Result<zbus::Message>
where
    T: serde::Serialize + zbus::zvariant::DynamicType,
{
    let reply = zbus::Message::method_return(&msg.header())
        .context("Failed to create reply builder")?
        .build(body)
        .context("Failed to build reply")?;
    Ok(reply)
}

fn build_error(msg: &zbus::Message, name: &str, text: &str) -> Result<zbus::Message> {
    let reply = zbus::Message::error(&msg.header(), name)
        .context("Failed to create error builder")?
        .build(&text.to_string())
        .context("Failed to build error reply")?;
    Ok(reply)
}
