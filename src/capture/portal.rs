//! ScreenCast desktop-portal client.
//!
//! Drives the `CreateSession -> SelectSources -> Start -> OpenPipeWireRemote`
//! handshake on the session bus. Every portal method produces a Request
//! object whose terminal `Response` signal carries the result; each call
//! here subscribes to that signal before dispatching the method, waits for
//! the one-shot response and then closes the request path. Dropping the
//! signal stream removes the bus match rule, so no subscription outlives
//! its request.

use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use zbus::zvariant::{self, DynamicType, OwnedObjectPath, Type, Value};
use zbus::{Connection, Proxy};

use crate::types::config::CaptureOptions;
use crate::types::error::{CaptureError, CaptureResult};

const PORTAL_DEST: &str = "org.freedesktop.portal.Desktop";
const PORTAL_PATH: &str = "/org/freedesktop/portal/desktop";
const SCREENCAST_IFACE: &str = "org.freedesktop.portal.ScreenCast";
const REQUEST_IFACE: &str = "org.freedesktop.portal.Request";
const SESSION_IFACE: &str = "org.freedesktop.portal.Session";

const RESPONSE_OK: u32 = 0;
const RESPONSE_CANCELLED_BY_USER: u32 = 1;

/// Process-wide source of portal handle tokens (`uv1`, `uv2`, ...).
struct TokenCounter(AtomicU32);

impl TokenCounter {
    fn next(&self) -> String {
        format!("uv{}", self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

static TOKEN_COUNTER: TokenCounter = TokenCounter(AtomicU32::new(0));

/// What the handshake produced: the media-server connection and the node to
/// attach to.
#[derive(Debug)]
pub struct StreamDescriptor {
    pub fd: OwnedFd,
    pub node_id: u32,
}

/// Why the session watch returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    CompositorClosed,
    Shutdown,
}

#[derive(zvariant::DeserializeDict, Type, Debug)]
#[zvariant(signature = "dict")]
struct CreateSessionResults {
    session_handle: String,
}

#[derive(zvariant::DeserializeDict, Type, Debug)]
#[zvariant(signature = "dict")]
struct SelectSourcesResults {}

#[derive(serde::Deserialize, Type, Debug)]
struct Stream(u32, StreamProperties);

#[derive(zvariant::DeserializeDict, Type, Debug)]
#[zvariant(signature = "dict")]
struct StreamProperties {
    source_type: Option<u32>,
}

#[derive(zvariant::DeserializeDict, Type, Debug)]
#[zvariant(signature = "dict")]
struct StartResults {
    streams: Option<Vec<Stream>>,
    restore_token: Option<String>,
}

/// An open portal session; dropping the facade closes it on the bus via
/// [`PortalSession::close`].
pub struct PortalSession {
    conn: Connection,
    screencast: Proxy<'static>,
    sender_name: String,
    session_path: OwnedObjectPath,
}

impl PortalSession {
    /// Run the whole handshake. On success the crop option may have been
    /// cleared (full-screen streams have nothing to crop) and the restore
    /// token, if any, has been written back.
    pub async fn open(
        options: &mut CaptureOptions,
    ) -> CaptureResult<(PortalSession, StreamDescriptor)> {
        let conn = Connection::session().await?;
        let sender_name = conn
            .unique_name()
            .ok_or_else(|| CaptureError::Bus("connection has no unique name".to_string()))?
            .as_str()
            .trim_start_matches(':')
            .replace('.', "_");

        let session_token = TOKEN_COUNTER.next();
        let session_path = format!(
            "/org/freedesktop/portal/desktop/session/{}/{}",
            sender_name, session_token
        );
        log::debug!("portal session path: '{}'", session_path);

        let screencast = Proxy::new(
            &conn,
            PORTAL_DEST.to_string(),
            PORTAL_PATH.to_string(),
            SCREENCAST_IFACE.to_string(),
        )
        .await?;

        let session = PortalSession {
            conn,
            screencast,
            sender_name,
            session_path: OwnedObjectPath::try_from(session_path)?,
        };

        let descriptor = session.handshake(options, &session_token).await?;
        Ok((session, descriptor))
    }

    async fn handshake(
        &self,
        options: &mut CaptureOptions,
        session_token: &str,
    ) -> CaptureResult<StreamDescriptor> {
        // CreateSession
        let mut opts: HashMap<&str, Value> = HashMap::new();
        opts.insert("session_handle_token", Value::from(session_token));
        let created: CreateSessionResults = self
            .call_with_request("CreateSession", opts, |o| (o,))
            .await?;
        assert_eq!(
            created.session_handle,
            self.session_path.as_str(),
            "portal session handle does not match the constructed path"
        );
        log::debug!("session created with handle: {}", created.session_handle);

        // SelectSources
        let mut opts: HashMap<&str, Value> = HashMap::new();
        opts.insert("types", Value::from(3u32)); // 1 monitor, 2 window, 3 both
        opts.insert("multiple", Value::from(false));
        if options.show_cursor {
            opts.insert("cursor_mode", Value::from(2u32)); // embedded
        }
        if let Some(restore_file) = &options.restore_file {
            // 0 none, 1 transient, 2 persistent
            opts.insert("persist_mode", Value::from(2u32));
            if let Some(token) = read_restore_token(restore_file) {
                opts.insert("restore_token", Value::from(token));
            }
        }
        let _: SelectSourcesResults = self
            .call_with_request("SelectSources", opts, |o| (&*self.session_path, o))
            .await?;

        // Start
        let opts: HashMap<&str, Value> = HashMap::new();
        let started: StartResults = self
            .call_with_request("Start", opts, |o| (&*self.session_path, "", o))
            .await?;

        if let Some(token) = &started.restore_token {
            match &options.restore_file {
                Some(path) => write_restore_token(path, token),
                None => {
                    log::warn!("got unexpected restore_token from the ScreenCast portal, ignoring")
                }
            }
        }

        let streams = started.streams.unwrap_or_default();
        let stream = streams.first().ok_or_else(|| {
            CaptureError::PortalFailed("portal returned no streams".to_string())
        })?;
        if streams.len() != 1 {
            log::warn!("portal returned {} streams, using the first", streams.len());
        }
        let node_id = stream.0;
        if stream.1.source_type == Some(1) {
            // a whole screen was picked, there is no window background to crop
            options.crop = false;
        }

        // OpenPipeWireRemote is a plain method, not a request
        let opts: HashMap<&str, Value> = HashMap::new();
        let reply = self
            .screencast
            .call_method("OpenPipeWireRemote", &(&*self.session_path, opts))
            .await?;
        let fd: zvariant::OwnedFd = reply.body().deserialize()?;
        let fd = fd.as_fd().try_clone_to_owned()?;

        log::debug!("portal handshake complete, node id {}", node_id);
        Ok(StreamDescriptor { fd, node_id })
    }

    /// One portal request round-trip: subscribe to the `Response` signal of
    /// the request path, dispatch the method, await the response, close the
    /// request.
    async fn call_with_request<'o, B, R>(
        &self,
        method: &str,
        mut options: HashMap<&'o str, Value<'o>>,
        body: impl FnOnce(HashMap<&'o str, Value<'o>>) -> B,
    ) -> CaptureResult<R>
    where
        B: serde::Serialize + DynamicType,
        R: DeserializeOwned + Type,
    {
        let token = TOKEN_COUNTER.next();
        let request_path = format!(
            "/org/freedesktop/portal/desktop/request/{}/{}",
            self.sender_name, token
        );
        log::debug!("call_with_request: '{}' request: '{}'", method, request_path);

        let request_proxy = Proxy::new(
            &self.conn,
            PORTAL_DEST,
            request_path.as_str(),
            REQUEST_IFACE,
        )
        .await?;
        let mut responses = request_proxy.receive_signal("Response").await?;

        options.insert("handle_token", Value::from(token.clone()));
        let reply = self.screencast.call_method(method, &body(options)).await?;
        let handle: OwnedObjectPath = reply.body().deserialize()?;
        if handle.as_str() != request_path {
            log::debug!(
                "portal handed back request '{}' instead of '{}'",
                handle.as_str(),
                request_path
            );
        }

        let msg = responses
            .next()
            .await
            .ok_or_else(|| CaptureError::Bus("response signal stream closed".to_string()))?;
        let (status, results): (u32, R) = msg.body().deserialize()?;

        if let Err(err) = request_proxy.call_method("Close", &()).await {
            log::debug!("closing request '{}' failed: {}", request_path, err);
        }

        match status {
            RESPONSE_OK => Ok(results),
            RESPONSE_CANCELLED_BY_USER => Err(CaptureError::PortalDenied),
            other => Err(CaptureError::PortalFailed(format!(
                "{} failed with portal status {}",
                method, other
            ))),
        }
    }

    /// Block until the compositor closes the session or the facade asks for
    /// shutdown.
    pub async fn wait_closed(
        &self,
        mut shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> SessionEnd {
        let session_proxy = match Proxy::new(
            &self.conn,
            PORTAL_DEST,
            self.session_path.as_str(),
            SESSION_IFACE,
        )
        .await
        {
            Ok(proxy) => proxy,
            Err(err) => {
                log::warn!("cannot watch portal session: {}", err);
                let _ = (&mut shutdown).await;
                return SessionEnd::Shutdown;
            }
        };
        let mut closed = match session_proxy.receive_signal("Closed").await {
            Ok(stream) => stream,
            Err(err) => {
                log::warn!("cannot subscribe to session Closed: {}", err);
                let _ = (&mut shutdown).await;
                return SessionEnd::Shutdown;
            }
        };

        tokio::select! {
            _ = closed.next() => {
                log::info!("screen-cast session closed by compositor");
                SessionEnd::CompositorClosed
            }
            _ = &mut shutdown => SessionEnd::Shutdown,
        }
    }

    /// Close the session on the bus.
    pub async fn close(&self) {
        match Proxy::new(
            &self.conn,
            PORTAL_DEST,
            self.session_path.as_str(),
            SESSION_IFACE,
        )
        .await
        {
            Ok(proxy) => {
                if let Err(err) = proxy.call_method("Close", &()).await {
                    log::debug!("closing portal session failed: {}", err);
                }
            }
            Err(err) => log::debug!("portal session proxy failed: {}", err),
        }
    }
}

/// Read a previously persisted restore token. Missing or empty files yield
/// `None` and the portal shows the picker dialog instead.
pub fn read_restore_token(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(token) if !token.is_empty() => Some(token),
        Ok(_) => None,
        Err(err) => {
            log::debug!("no restore token at {}: {}", path.display(), err);
            None
        }
    }
}

/// Persist the restore token exactly as handed out by the portal.
pub fn write_restore_token(path: &Path, token: &str) {
    if let Err(err) = std::fs::write(path, token) {
        log::error!(
            "unable to write restore token to {}: {}",
            path.display(),
            err
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_token_round_trips() {
        let path = std::env::temp_dir().join(format!("uv-restore-{}", std::process::id()));
        write_restore_token(&path, "restore:token/opaque-123");
        assert_eq!(
            read_restore_token(&path).as_deref(),
            Some("restore:token/opaque-123")
        );
        std::fs::remove_file(&path).unwrap();
        assert_eq!(read_restore_token(&path), None);
    }

    #[test]
    fn tokens_are_monotonic_and_prefixed() {
        let a = TOKEN_COUNTER.next();
        let b = TOKEN_COUNTER.next();
        assert!(a.starts_with("uv") && b.starts_with("uv"));
        let a: u32 = a[2..].parse().unwrap();
        let b: u32 = b[2..].parse().unwrap();
        assert!(b > a);
    }
}
