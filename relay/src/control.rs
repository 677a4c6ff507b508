//! UNIX datagram control socket: one UTF-8 command per datagram, one JSON
//! reply per command.

use crate::context::RelayContext;
use crate::snapshot;
use log::{info, warn};
use serde_json::{json, Value};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UnixDatagram;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("cannot find specified input")]
    UnknownInput,
    #[error("delay value out of bounds +/- 100s")]
    DelayOutOfBounds,
    #[error("backoff value out of bounds 0 to 100s")]
    BackoffOutOfBounds,
    #[error("live_stats_port value out of bounds")]
    PortOutOfBounds,
    #[error("verbosity value out of bounds 0 to 3")]
    VerbosityOutOfBounds,
    #[error("malformed value: {0}")]
    Malformed(String),
    #[error("unknown command")]
    UnknownCommand,
}

pub struct ControlServer {
    context: Arc<RelayContext>,
    socket: UnixDatagram,
    path: PathBuf,
}

impl ControlServer {
    pub fn bind(context: Arc<RelayContext>, path: PathBuf) -> std::io::Result<Self> {
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let socket = UnixDatagram::bind(&path)?;
        // user and group write, world read
        fs::set_permissions(&path, fs::Permissions::from_mode(0o664))?;
        info!("control socket listening on {}", path.display());
        Ok(Self { context, socket, path })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; 1024];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(ok) => ok,
                        Err(err) => {
                            warn!("control socket receive failed: {err}");
                            continue;
                        }
                    };
                    let command = String::from_utf8_lossy(&buf[..len]).trim().to_string();
                    let reply = dispatch(&self.context, &command);
                    if let Some(peer_path) = peer.as_pathname() {
                        if let Err(err) = self.socket.send_to(reply.to_string().as_bytes(), peer_path).await {
                            warn!("could not send control reply: {err}");
                        }
                    }
                }
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Runs one command and wraps its outcome in the reply envelope.
pub fn dispatch(context: &RelayContext, command: &str) -> Value {
    match handle(context, command) {
        Ok(Some(response)) => json!({ "status": "ok", "cmd": command, "response": response }),
        Ok(None) => json!({ "status": "ok", "cmd": command }),
        Err(err) => json!({ "status": "error", "cmd": command, "message": err.to_string() }),
    }
}

fn handle(context: &RelayContext, command: &str) -> Result<Option<Value>, ControlError> {
    if command == "get settings" {
        return Ok(Some(snapshot::settings_json(context)));
    }
    if command == "stats" {
        return Ok(Some(snapshot::stats_json(context)));
    }
    if let Some(input) = command.strip_prefix("set input enable ") {
        return set_input_enabled(context, input, true).map(|_| None);
    }
    if let Some(input) = command.strip_prefix("set input disable ") {
        return set_input_enabled(context, input, false).map(|_| None);
    }
    if let Some(value) = command.strip_prefix("set delay ") {
        if value == "null" {
            context.settings.set_delay_ms(None);
            info!("control: disabling delay");
        } else {
            let delay: i64 = parse(value)?;
            if !(-100_000..=100_000).contains(&delay) {
                return Err(ControlError::DelayOutOfBounds);
            }
            context.settings.set_delay_ms(Some(delay));
            info!("control: setting delay to {delay}");
        }
        return Ok(None);
    }
    if let Some(value) = command.strip_prefix("set backoff ") {
        let backoff: i64 = parse(value)?;
        if !(0..=100_000).contains(&backoff) {
            return Err(ControlError::BackoffOutOfBounds);
        }
        context.settings.set_backoff_ms(backoff as u32);
        info!("control: setting backoff to {backoff}");
        return Ok(None);
    }
    if let Some(value) = command.strip_prefix("set live_stats_port ") {
        let port: i64 = parse(value)?;
        if !(0..=65_535).contains(&port) {
            return Err(ControlError::PortOutOfBounds);
        }
        context.settings.set_live_stats_port(port as u16);
        info!("control: setting live_stats_port to {port}");
        return Ok(None);
    }
    if let Some(value) = command.strip_prefix("set verbose ") {
        let verbosity: i64 = parse(value)?;
        if !(0..=3).contains(&verbosity) {
            return Err(ControlError::VerbosityOutOfBounds);
        }
        context.settings.set_verbosity(verbosity as u8);
        info!("control: setting verbosity to {verbosity}");
        return Ok(None);
    }
    if command == "reset counters" {
        context.counters.reset();
        for source in &context.sources {
            source.reset_counters();
        }
        info!("control: resetting all counters");
        return Ok(None);
    }
    Err(ControlError::UnknownCommand)
}

fn set_input_enabled(context: &RelayContext, input: &str, enabled: bool) -> Result<(), ControlError> {
    match context.find_source(input) {
        Some(source) => {
            source.enabled.store(enabled, std::sync::atomic::Ordering::Relaxed);
            info!("control: {} input {input}", if enabled { "enabling" } else { "disabling" });
            Ok(())
        }
        None => {
            info!("control: input {input} not found");
            Err(ControlError::UnknownInput)
        }
    }
}

fn parse<T: std::str::FromStr>(value: &str) -> Result<T, ControlError> {
    value.trim().parse().map_err(|_| ControlError::Malformed(value.to_string()))
}
