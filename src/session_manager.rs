//! Best-effort mirroring of inhibit leases to the desktop session manager.
//!
//! The local lease is authoritative; the mirror is advisory. Every round
//! trip is bounded by an explicit timeout, and a timeout is treated the same
//! as any other failure: log, proceed, no local rollback.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use zbus::Connection;

const SESSION_MANAGER_SERVICE: &str = "org.gnome.SessionManager";
const SESSION_MANAGER_PATH: &str = "/org/gnome/SessionManager";
const SESSION_MANAGER_INTERFACE: &str = "org.gnome.SessionManager";

/// Session-manager inhibit flag for "the session is idle".
const INHIBIT_IDLE_FLAG: u32 = 8;

/// Toplevel window id forwarded with the mirror; this service has none.
const NO_TOPLEVEL_XID: u32 = 0;

/// Proxy issuing mirrored Inhibit/Uninhibit calls on the session bus.
pub struct SessionManagerProxy {
    connection: Option<Connection>,
    timeout: Duration,
}

impl SessionManagerProxy {
    /// Create a proxy with no connection; mirror calls are skipped until one
    /// is installed.
    pub fn new(timeout: Duration) -> Self {
        Self {
            connection: None,
            timeout,
        }
    }

    /// Install or drop the session-bus connection.
    pub fn set_connection(&mut self, connection: Option<Connection>) {
        self.connection = connection;
    }

    /// Mirror a new inhibit lease. Returns the session manager's cookie on
    /// success; on any failure the mirror is abandoned and the local lease
    /// stands alone.
    pub async fn mirror_inhibit(&self, application: &str, reason: &str) -> Option<u32> {
        let Some(ref conn) = self.connection else {
            debug!("No session bus connection, skipping inhibit mirror");
            return None;
        };

        match tokio::time::timeout(self.timeout, call_inhibit(conn, application, reason)).await {
            Ok(Ok(foreign)) => {
                debug!(
                    "Mirrored inhibit for {} to session manager as cookie {}",
                    application, foreign
                );
                Some(foreign)
            }
            Ok(Err(e)) => {
                warn!("Session manager inhibit mirror failed: {:#}", e);
                None
            }
            Err(_) => {
                warn!(
                    "Session manager inhibit mirror timed out after {:?}",
                    self.timeout
                );
                None
            }
        }
    }

    /// Release a mirrored inhibit. Skipped silently when the original mirror
    /// never succeeded; never retried or queued.
    pub async fn mirror_uninhibit(&self, foreign_cookie: Option<u32>) {
        let Some(foreign) = foreign_cookie else {
            debug!("Lease was never mirrored, skipping uninhibit");
            return;
        };
        let Some(ref conn) = self.connection else {
            debug!("No session bus connection, skipping uninhibit mirror");
            return;
        };

        match tokio::time::timeout(self.timeout, call_uninhibit(conn, foreign)).await {
            Ok(Ok(())) => debug!("Released session manager inhibit {}", foreign),
            Ok(Err(e)) => warn!("Session manager uninhibit failed: {:#}", e),
            Err(_) => warn!(
                "Session manager uninhibit timed out after {:?}",
                self.timeout
            ),
        }
    }
}

async fn call_inhibit(conn: &Connection, application: &str, reason: &str) -> Result<u32> {
    let proxy = zbus::Proxy::new(
        conn,
        SESSION_MANAGER_SERVICE,
        SESSION_MANAGER_PATH,
        SESSION_MANAGER_INTERFACE,
    )
    .await
    .context("Failed to create session manager proxy")?;

    let cookie: u32 = proxy
        .call(
            "Inhibit",
            &(application, NO_TOPLEVEL_XID, reason, INHIBIT_IDLE_FLAG),
        )
        .await
        .context("Inhibit call failed")?;

    Ok(cookie)
}

async fn call_uninhibit(conn: &Connection, foreign: u32) -> Result<()> {
    let proxy = zbus::Proxy::new(
        conn,
        SESSION_MANAGER_SERVICE,
        SESSION_MANAGER_PATH,
        SESSION_MANAGER_INTERFACE,
    )
    .await
    .context("Failed to create session manager proxy")?;

    proxy
        .call::<_, _, ()>("Uninhibit", &(foreign,))
        .await
        .context("Uninhibit call failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mirror_skipped_without_connection() {
        let proxy = SessionManagerProxy::new(Duration::from_secs(1));
        assert_eq!(proxy.mirror_inhibit("Player", "playing").await, None);
    }

    #[tokio::test]
    async fn test_uninhibit_skipped_without_foreign_cookie() {
        let proxy = SessionManagerProxy::new(Duration::from_secs(1));
        // Never mirrored: returns immediately without a connection attempt.
        proxy.mirror_uninhibit(None).await;
    }
}
