//! Engine selection and the capability shared by every engine variant.

use async_trait::async_trait;
use tracing::info;

use super::buttonless::ButtonlessJump;
use super::config::DfuConfig;
use super::error::{DfuError, DfuResult};
use super::events::DfuObserver;
use super::gatt::GattClient;
use super::legacy::LegacyEngine;
use super::package::FirmwarePackage;
use super::secure::SecureEngine;
use super::state::{ContentType, Dialect, TransferSession};
use crate::traits::Link;

/// Everything an engine works on during one connection.
pub struct TransferContext<'a, L: Link> {
    pub client: &'a mut GattClient<L>,
    pub package: &'a mut FirmwarePackage,
    pub session: &'a mut TransferSession,
    pub config: &'a DfuConfig,
    pub observer: &'a dyn DfuObserver,
}

/// How a connection ended when nothing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOutcome {
    /// All selected images were activated.
    Completed,
    /// The current part was activated; `remaining` goes in a new connection.
    PartCompleted { remaining: ContentType },
    /// The application rebooted into the bootloader.
    JumpedToBootloader {
        /// The bootloader may advertise under a different address.
        rediscover: bool,
    },
    /// The bootloader was reset and the transfer must start over.
    Restart,
}

/// One protocol variant driving a connected peripheral.
#[async_trait]
pub trait TransferEngine: Send {
    /// Dialect of the transfer, `None` for a jump-only engine.
    fn dialect(&self) -> Option<Dialect>;

    async fn run<L: Link>(&mut self, ctx: &mut TransferContext<'_, L>)
        -> DfuResult<EngineOutcome>;
}

/// Closed set of engines, chosen from the services a peripheral exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuEngine {
    Buttonless(ButtonlessJump),
    Secure(SecureEngine),
    Legacy(LegacyEngine),
}

impl DfuEngine {
    /// Pick the engine for a freshly connected peripheral.
    ///
    /// Probed in order: bond-sharing buttonless, buttonless without bonds,
    /// Secure DFU, Legacy DFU.
    pub fn select<L: Link>(
        link: &L,
        config: &DfuConfig,
        package: &FirmwarePackage,
    ) -> DfuResult<Self> {
        let uuids = &config.uuids;

        let engine = if link.has_characteristic(uuids.secure_service, uuids.buttonless_with_bonds) {
            DfuEngine::Buttonless(ButtonlessJump::BondSharing)
        } else if link.has_characteristic(uuids.secure_service, uuids.buttonless_without_bonds) {
            DfuEngine::Buttonless(ButtonlessJump::WithoutBonds)
        } else if link.has_characteristic(uuids.secure_service, uuids.secure_control_point)
            && link.has_characteristic(uuids.secure_service, uuids.secure_packet)
        {
            DfuEngine::Secure(SecureEngine::new())
        } else if link.has_characteristic(uuids.legacy_service, uuids.legacy_control_point)
            && link.has_characteristic(uuids.legacy_service, uuids.legacy_packet)
        {
            if package.is_secure_dfu_required() {
                return Err(DfuError::SecureDfuRequired);
            }
            DfuEngine::Legacy(LegacyEngine::new())
        } else {
            return Err(DfuError::DeviceNotSupported);
        };

        info!(address = %link.address(), engine = ?engine, "DFU engine selected");
        Ok(engine)
    }

    /// Forbid another restart on this engine (Legacy only).
    pub fn disallow_restart(&mut self) {
        if let DfuEngine::Legacy(engine) = self {
            engine.disallow_restart();
        }
    }
}

#[async_trait]
impl TransferEngine for DfuEngine {
    fn dialect(&self) -> Option<Dialect> {
        match self {
            DfuEngine::Buttonless(jump) => jump.dialect(),
            DfuEngine::Secure(engine) => engine.dialect(),
            DfuEngine::Legacy(engine) => engine.dialect(),
        }
    }

    async fn run<L: Link>(
        &mut self,
        ctx: &mut TransferContext<'_, L>,
    ) -> DfuResult<EngineOutcome> {
        match self {
            DfuEngine::Buttonless(jump) => jump.run(ctx).await,
            DfuEngine::Secure(engine) => engine.run(ctx).await,
            DfuEngine::Legacy(engine) => engine.run(ctx).await,
        }
    }
}
