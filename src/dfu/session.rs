//! Session orchestration: connections, jumps, restarts and multi-part updates.
//!
//! One [`DfuSession::run`] call drives a package to completion across as
//! many connections as the device needs:
//! 1. Select the engine from the services of the connected peripheral
//! 2. Run it on the connection
//! 3. Act on the outcome: reconnect after a buttonless jump (scanning for
//!    the bootloader when its address may change), after a Legacy reset,
//!    or for the second part of a split update

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::config::{DfuConfig, DEFAULT_MTU_PAYLOAD, RECONNECT_DELAY};
use super::control::DfuController;
use super::engine::{DfuEngine, EngineOutcome, TransferContext, TransferEngine};
use super::error::{DfuError, DfuFailure, DfuResult};
use super::events::{DfuObserver, DfuStage, TracingObserver};
use super::gatt::GattClient;
use super::package::FirmwarePackage;
use super::rediscovery::{default_matcher, rediscover, AddressMatcher};
use super::state::{ContentType, Dialect, TransferSession, TransferState};
use crate::traits::{BondState, Connector, DeviceAddress, Link, Scanner};

/// Summary of a successful update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DfuReport {
    /// Address of the bootloader that received the last part.
    pub address: DeviceAddress,
    pub dialect: Option<Dialect>,
    pub parts: u8,
    pub bytes_transferred: u64,
    /// RFC 3339 timestamps.
    pub started_at: String,
    pub finished_at: String,
}

pub struct DfuSession<C: Connector, S: Scanner> {
    config: DfuConfig,
    observer: Arc<dyn DfuObserver>,
    controller: DfuController,
    connector: C,
    scanner: S,
    matcher: AddressMatcher,
}

impl<C: Connector, S: Scanner> DfuSession<C, S> {
    pub fn new(config: DfuConfig, connector: C, scanner: S) -> Self {
        Self {
            config,
            observer: Arc::new(TracingObserver),
            controller: DfuController::new(),
            connector,
            scanner,
            matcher: default_matcher(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn DfuObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replace the advertisement matcher used after a jump.
    pub fn with_address_matcher(mut self, matcher: AddressMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_controller(mut self, controller: DfuController) -> Self {
        self.controller = controller;
        self
    }

    /// Handle for pausing or aborting from another task.
    pub fn controller(&self) -> DfuController {
        self.controller.clone()
    }

    pub fn config(&self) -> &DfuConfig {
        &self.config
    }

    /// Update the device behind `link` with `package`.
    ///
    /// The link is consumed; later connections are opened through the
    /// connector. Every error is returned with the stage it happened in.
    pub async fn run(
        &mut self,
        link: C::Link,
        mut package: FirmwarePackage,
    ) -> Result<DfuReport, DfuFailure> {
        let started_at = chrono::Utc::now().to_rfc3339();
        let mut address = link.address();
        let mut session = TransferSession::new(
            package.content_type(),
            self.config.prn_interval,
            DEFAULT_MTU_PAYLOAD,
        );
        let mut bytes_transferred = 0u64;

        info!(%address, content = %self.config.content_type, "DFU session started");
        let result = self
            .drive(link, &mut package, &mut session, &mut address, &mut bytes_transferred)
            .await;

        match result {
            Ok(()) => {
                let report = DfuReport {
                    address,
                    dialect: session.dialect,
                    parts: session.total_parts,
                    bytes_transferred,
                    started_at,
                    finished_at: chrono::Utc::now().to_rfc3339(),
                };
                info!(
                    address = %report.address,
                    parts = report.parts,
                    bytes = report.bytes_transferred,
                    "DFU session completed"
                );
                Ok(report)
            }
            Err(error) => {
                let stage = session.state();
                let terminal = if matches!(error, DfuError::Aborted) {
                    self.observer.on_stage(&DfuStage::Aborted);
                    TransferState::Aborted
                } else {
                    TransferState::Failed
                };
                if let Err(e) = session.goto(terminal) {
                    debug!(error = %e, "Terminal state not reachable");
                }
                let failure = DfuFailure {
                    error,
                    stage,
                    image: session.current_image,
                    bytes_transferred: bytes_transferred as u32 + session.bytes_sent,
                    part: session.part_index,
                    total_parts: session.total_parts,
                };
                warn!(
                    error = %failure.error,
                    code = failure.error.error_code(),
                    stage = %failure.stage,
                    "DFU session failed"
                );
                Err(failure)
            }
        }
    }

    async fn drive(
        &mut self,
        link: C::Link,
        package: &mut FirmwarePackage,
        session: &mut TransferSession,
        address: &mut DeviceAddress,
        bytes_transferred: &mut u64,
    ) -> DfuResult<()> {
        self.observer.on_stage(&DfuStage::ReadingPackage);
        let mask = package.set_content_type(self.config.content_type)?;
        session.narrow_mask(mask)?;

        let mut next_link = Some(link);
        let mut restart_allowed = true;
        let mut jumped = false;

        loop {
            session.goto(TransferState::Connecting)?;
            self.observer.on_stage(&DfuStage::Connecting {
                address: address.to_string(),
            });
            let link = match next_link.take() {
                Some(link) => link,
                None => self.connect(*address).await?,
            };

            session.goto(TransferState::CapabilityCheck)?;
            let mut engine = DfuEngine::select(&link, &self.config, package)?;
            if !restart_allowed {
                engine.disallow_restart();
            }

            let mut client = GattClient::new(link, self.controller.clone());
            let result = {
                let mut ctx = TransferContext {
                    client: &mut client,
                    package: &mut *package,
                    session: &mut *session,
                    config: &self.config,
                    observer: self.observer.as_ref(),
                };
                engine.run(&mut ctx).await
            };
            if result.is_err() {
                client.disconnect().await?;
            }

            match result? {
                EngineOutcome::Completed => {
                    *bytes_transferred += session.bytes_sent as u64;
                    let bonded = client.bond_state() == BondState::Bonded;
                    drop(client);
                    if bonded {
                        self.update_bond(*address, session.mask()).await;
                    }
                    session.goto(TransferState::Completed)?;
                    self.observer.on_stage(&DfuStage::Complete);
                    return Ok(());
                }
                EngineOutcome::PartCompleted { remaining } => {
                    *bytes_transferred += session.bytes_sent as u64;
                    *package = package.reopen();
                    let remaining = package.set_content_type(remaining)?;
                    session.next_part(remaining);
                    info!(
                        part = session.part_index,
                        total_parts = session.total_parts,
                        content = %remaining,
                        "Reconnecting for the next part"
                    );
                    if self.config.force_scanning_for_new_address {
                        self.find_bootloader(address).await?;
                    }
                }
                EngineOutcome::JumpedToBootloader { rediscover } => {
                    if jumped {
                        // Still in application mode after a jump
                        warn!(%address, "Device jumped to the bootloader twice");
                        return Err(DfuError::DeviceNotSupported);
                    }
                    jumped = true;
                    if rediscover {
                        self.find_bootloader(address).await?;
                    }
                }
                EngineOutcome::Restart => {
                    info!("Restarting the transfer after a bootloader reset");
                    restart_allowed = false;
                    package.full_reset();
                }
            }
        }
    }

    /// The bootloader may have dropped the bond; forget it unless told to
    /// keep it, and bond again when a new application was sent.
    async fn update_bond(&self, address: DeviceAddress, sent: ContentType) {
        if self.config.restore_bond || !self.config.keep_bond {
            match self.connector.remove_bond(address).await {
                Ok(()) => debug!(%address, "Bond removed"),
                Err(e) => warn!(%address, error = %e, "Bond could not be removed"),
            }
        }
        if self.config.restore_bond && sent.intersects(ContentType::APPLICATION) {
            match self.connector.create_bond(address).await {
                Ok(()) => debug!(%address, "Bonding started"),
                Err(e) => warn!(%address, error = %e, "Bond could not be restored"),
            }
        }
    }

    /// Scan for the bootloader, keeping `address` when nothing matches.
    async fn find_bootloader(&mut self, address: &mut DeviceAddress) -> DfuResult<()> {
        self.observer.on_stage(&DfuStage::Rediscovering {
            address: address.to_string(),
        });
        let found = rediscover(
            &mut self.scanner,
            *address,
            &self.matcher,
            self.config.rediscovery_timeout,
            &self.controller,
        )
        .await;
        if self.controller.is_aborted() {
            return Err(DfuError::Aborted);
        }
        match found {
            Some(found) => *address = found,
            None => info!(%address, "Bootloader not found, reconnecting at the original address"),
        }
        Ok(())
    }

    async fn connect(&self, address: DeviceAddress) -> DfuResult<C::Link> {
        let attempts = 1 + self.config.reconnect_attempts as u32;
        for attempt in 1..=attempts {
            if self.controller.is_aborted() {
                return Err(DfuError::Aborted);
            }
            match self.connector.connect(address).await {
                Ok(link) => {
                    info!(%address, attempt, "Connected");
                    return Ok(link);
                }
                Err(e) => warn!(%address, attempt, error = %e, "Connection failed"),
            }
            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    _ = self.controller.aborted() => return Err(DfuError::Aborted),
                }
            }
        }
        Err(DfuError::MaxRetriesExceeded {
            operation: format!("connect to {}", address),
        })
    }
}
