//! Request/response layer over a [`Link`].
//!
//! Every wait here wakes on exactly four conditions: the awaited link event,
//! a disconnect, a pause being lifted, or an abort. Notifications that arrive
//! while a write completion is pending are queued and handed out later.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use super::control::{ControlState, DfuController};
use super::error::{DfuError, DfuResult};
use crate::traits::{BondState, Link, LinkError, LinkEvent, SubscribeMode};

/// A link plus the session's control channel.
pub struct GattClient<L: Link> {
    link: L,
    control: watch::Receiver<ControlState>,
    controller: DfuController,
    pending: VecDeque<LinkEvent>,
    connected: bool,
}

impl<L: Link> GattClient<L> {
    pub fn new(link: L, controller: DfuController) -> Self {
        Self {
            link,
            control: controller.subscribe(),
            controller,
            pending: VecDeque::new(),
            connected: true,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn controller(&self) -> &DfuController {
        &self.controller
    }

    fn check_aborted(&self) -> DfuResult<()> {
        if self.control.borrow().aborted {
            return Err(DfuError::Aborted);
        }
        Ok(())
    }

    /// Next event from the link, failing fast on abort.
    async fn next_event(&mut self) -> DfuResult<LinkEvent> {
        loop {
            self.check_aborted()?;
            let events = self.link.events();
            tokio::select! {
                event = events.recv() => {
                    return match event {
                        Some(LinkEvent::Disconnected) => {
                            self.connected = false;
                            Ok(LinkEvent::Disconnected)
                        }
                        Some(event) => Ok(event),
                        None => {
                            self.connected = false;
                            Ok(LinkEvent::Disconnected)
                        }
                    };
                }
                changed = self.control.changed() => {
                    if changed.is_err() {
                        return Err(DfuError::Aborted);
                    }
                }
            }
        }
    }

    /// Block at a chunk boundary while paused. Returns true if a pause happened.
    pub async fn pause_point(&mut self) -> DfuResult<bool> {
        let mut paused = false;
        loop {
            let state = *self.control.borrow_and_update();
            if state.aborted {
                return Err(DfuError::Aborted);
            }
            if !state.paused {
                if paused {
                    debug!("Transfer resumed");
                }
                return Ok(paused);
            }
            if !paused {
                debug!("Transfer paused");
                paused = true;
            }
            if self.control.changed().await.is_err() {
                return Err(DfuError::Aborted);
            }
        }
    }

    async fn wait_write_complete(&mut self, characteristic: Uuid, operation: &str) -> DfuResult<()> {
        loop {
            match self.next_event().await? {
                LinkEvent::WriteComplete {
                    characteristic: c,
                    status,
                } if c == characteristic => {
                    if status != 0 {
                        return Err(LinkError::Gatt {
                            operation: operation.to_string(),
                            status,
                        }
                        .into());
                    }
                    return Ok(());
                }
                LinkEvent::Disconnected => {
                    return Err(DfuError::Disconnected {
                        operation: operation.to_string(),
                    })
                }
                event @ LinkEvent::ValueChanged { .. } => self.pending.push_back(event),
                other => debug!(?other, "Ignoring link event while writing"),
            }
        }
    }

    /// Write and wait for the write to complete.
    pub async fn write(&mut self, characteristic: Uuid, value: &[u8]) -> DfuResult<()> {
        if !self.connected {
            return Err(DfuError::Disconnected {
                operation: "write".into(),
            });
        }
        self.check_aborted()?;
        self.link.write(characteristic, value, false).await?;
        self.wait_write_complete(characteristic, "write").await
    }

    /// Write a control-point command.
    pub async fn write_command(&mut self, characteristic: Uuid, command: &[u8]) -> DfuResult<()> {
        debug!(command = %hex::encode(command), "Writing control point command");
        self.write(characteristic, command).await
    }

    /// Write a command after which the peripheral resets.
    ///
    /// A disconnect instead of the write completion is success.
    pub async fn write_expecting_disconnect(
        &mut self,
        characteristic: Uuid,
        command: &[u8],
    ) -> DfuResult<()> {
        debug!(command = %hex::encode(command), "Writing command, disconnect expected");
        self.check_aborted()?;
        match self.link.write(characteristic, command, true).await {
            Ok(()) => {}
            Err(LinkError::NotConnected) => {
                self.connected = false;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        match self.wait_write_complete(characteristic, "write").await {
            Ok(()) | Err(DfuError::Disconnected { .. }) => Ok(()),
            Err(DfuError::Link(LinkError::Gatt { status, .. })) if !self.connected => {
                debug!(status, "Write failed after disconnect, ignoring");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort write used when tearing down: ignores abort and does not
    /// wait for completion.
    pub async fn write_final(&mut self, characteristic: Uuid, command: &[u8]) {
        if !self.connected {
            return;
        }
        debug!(command = %hex::encode(command), "Writing final command");
        if let Err(e) = self.link.write(characteristic, command, true).await {
            warn!(error = %e, "Final command failed");
        }
    }

    /// Next notification on `characteristic`, queued ones first.
    pub async fn next_notification(&mut self, characteristic: Uuid) -> DfuResult<Vec<u8>> {
        if let Some(value) = self.take_pending_notification(characteristic) {
            return Ok(value);
        }
        self.check_aborted()?;
        if !self.connected {
            return Err(DfuError::Disconnected {
                operation: "notification".into(),
            });
        }

        loop {
            match self.next_event().await? {
                LinkEvent::ValueChanged {
                    characteristic: c,
                    value,
                } if c == characteristic => return Ok(value),
                LinkEvent::Disconnected => {
                    return Err(DfuError::Disconnected {
                        operation: "notification".into(),
                    })
                }
                other => debug!(?other, "Ignoring link event while waiting for notification"),
            }
        }
    }

    /// Pop a queued notification without waiting.
    pub fn take_pending_notification(&mut self, characteristic: Uuid) -> Option<Vec<u8>> {
        let index = self.pending.iter().position(|e| {
            matches!(e, LinkEvent::ValueChanged { characteristic: c, .. } if *c == characteristic)
        })?;
        match self.pending.remove(index) {
            Some(LinkEvent::ValueChanged { value, .. }) => Some(value),
            _ => None,
        }
    }

    pub async fn subscribe(&mut self, characteristic: Uuid, mode: SubscribeMode) -> DfuResult<()> {
        self.check_aborted()?;
        debug!(%characteristic, ?mode, "Enabling notifications");
        self.link.subscribe(characteristic, mode).await?;
        Ok(())
    }

    pub async fn read(&mut self, characteristic: Uuid) -> DfuResult<Vec<u8>> {
        self.check_aborted()?;
        Ok(self.link.read(characteristic).await?)
    }

    /// Request an MTU and return the negotiated value.
    pub async fn request_mtu(&mut self, mtu: u16, timeout: Duration) -> DfuResult<u16> {
        self.check_aborted()?;
        self.link.request_mtu(mtu).await?;

        let wait = async {
            loop {
                match self.next_event().await? {
                    LinkEvent::MtuChanged { mtu, status } => {
                        if status != 0 {
                            return Err(DfuError::from(LinkError::Gatt {
                                operation: "MTU request".into(),
                                status,
                            }));
                        }
                        return Ok::<u16, DfuError>(mtu);
                    }
                    LinkEvent::Disconnected => {
                        return Err(DfuError::Disconnected {
                            operation: "MTU request".into(),
                        })
                    }
                    event @ LinkEvent::ValueChanged { .. } => self.pending.push_back(event),
                    other => debug!(?other, "Ignoring link event while waiting for MTU"),
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(DfuError::Timeout {
                operation: "MTU request".into(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Wait until the link drops, optionally bounded.
    pub async fn wait_for_disconnect(&mut self, timeout: Option<Duration>) -> DfuResult<()> {
        if !self.connected {
            return Ok(());
        }
        let wait = async {
            loop {
                if let LinkEvent::Disconnected = self.next_event().await? {
                    return Ok::<(), DfuError>(());
                }
            }
        };
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => Err(DfuError::Timeout {
                    operation: "disconnect".into(),
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
            None => wait.await,
        }
    }

    pub fn bond_state(&self) -> BondState {
        self.link.bond_state()
    }

    /// Drop the connection, ignoring a link that is already gone.
    pub async fn disconnect(&mut self) -> DfuResult<()> {
        if !self.connected {
            return Ok(());
        }
        match self.link.disconnect().await {
            Ok(()) | Err(LinkError::NotConnected) => {}
            Err(e) => warn!(error = %e, "Disconnect failed"),
        }
        self.connected = false;
        Ok(())
    }
}
