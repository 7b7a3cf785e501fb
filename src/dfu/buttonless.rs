//! Buttonless jump: ask a running application to reboot into its bootloader.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::engine::{EngineOutcome, TransferContext, TransferEngine};
use super::error::{DfuError, DfuResult};
use super::events::DfuStage;
use super::opcodes::{
    ButtonlessStatus, LegacyOpcode, BUTTONLESS_ENTER_BOOTLOADER, BUTTONLESS_RESPONSE,
    LEGACY_START_DFU_APPLICATION_JUMP,
};
use super::state::{Dialect, TransferState};
use crate::traits::{BondState, Link, SubscribeMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonlessJump {
    /// Secure buttonless service sharing the bond with the bootloader.
    /// The bootloader keeps the application's address.
    BondSharing,
    /// Secure buttonless service without bond sharing. The bootloader
    /// advertises under the incremented address.
    WithoutBonds,
    /// Legacy application exposing the Legacy DFU control point.
    Legacy { version: u16 },
}

impl ButtonlessJump {
    /// Does the bootloader come back under a different address?
    fn changes_address(&self) -> bool {
        match self {
            ButtonlessJump::BondSharing => false,
            ButtonlessJump::WithoutBonds => true,
            ButtonlessJump::Legacy { version } => *version == 0,
        }
    }

    async fn jump_secure<L: Link>(&self, ctx: &mut TransferContext<'_, L>) -> DfuResult<()> {
        let uuids = &ctx.config.uuids;
        let characteristic = match self {
            ButtonlessJump::BondSharing => uuids.buttonless_with_bonds,
            _ => uuids.buttonless_without_bonds,
        };

        match (self, ctx.client.bond_state()) {
            (ButtonlessJump::BondSharing, BondState::Bonded) => {}
            (ButtonlessJump::BondSharing, _) => return Err(DfuError::NotBonded),
            (_, BondState::Bonded) => warn!(
                "Device is bonded but the buttonless service does not share bonds; \
                 the bootloader will not be able to use the bond"
            ),
            _ => {}
        }

        // Step 1: Enable indications
        ctx.client.subscribe(characteristic, SubscribeMode::Indicate).await?;

        // Step 2: Enter bootloader
        ctx.client
            .write_expecting_disconnect(characteristic, &[BUTTONLESS_ENTER_BOOTLOADER])
            .await?;
        if !ctx.client.is_connected() {
            debug!("Disconnected before the buttonless response, assuming success");
            return Ok(());
        }

        // Step 3: Await the response, a disconnect counts as success
        let timeout = ctx.config.buttonless_timeout;
        let response =
            match tokio::time::timeout(timeout, ctx.client.next_notification(characteristic)).await
            {
                Err(_) => {
                    return Err(DfuError::Timeout {
                        operation: "buttonless response".into(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
                Ok(Err(DfuError::Disconnected { .. })) => {
                    debug!("Disconnected before the buttonless response, assuming success");
                    return Ok(());
                }
                Ok(result) => result?,
            };

        parse_response(&response)
    }
}

/// `[0x20, 0x01, status]`
fn parse_response(response: &[u8]) -> DfuResult<()> {
    let invalid = || DfuError::InvalidResponse {
        request: BUTTONLESS_ENTER_BOOTLOADER,
        response: response.to_vec(),
    };
    if response.len() != 3
        || response[0] != BUTTONLESS_RESPONSE
        || response[1] != BUTTONLESS_ENTER_BOOTLOADER
    {
        return Err(invalid());
    }
    match ButtonlessStatus::from_byte(response[2]) {
        Some(ButtonlessStatus::Success) => Ok(()),
        Some(_) => Err(DfuError::remote_buttonless(response[2])),
        None => Err(invalid()),
    }
}

#[async_trait]
impl TransferEngine for ButtonlessJump {
    fn dialect(&self) -> Option<Dialect> {
        None
    }

    async fn run<L: Link>(
        &mut self,
        ctx: &mut TransferContext<'_, L>,
    ) -> DfuResult<EngineOutcome> {
        info!(variant = ?self, "Switching device to bootloader mode");
        ctx.observer.on_stage(&DfuStage::EnablingBootloader);

        match self {
            ButtonlessJump::Legacy { .. } => {
                let control_point = ctx.config.uuids.legacy_control_point;
                ctx.client
                    .write_expecting_disconnect(
                        control_point,
                        &[
                            LegacyOpcode::StartDfu as u8,
                            LEGACY_START_DFU_APPLICATION_JUMP,
                        ],
                    )
                    .await?;
                ctx.session.goto(TransferState::Disconnecting)?;
                ctx.client.wait_for_disconnect(None).await?;
            }
            ButtonlessJump::BondSharing => {
                self.jump_secure(ctx).await?;
                ctx.session.goto(TransferState::Disconnecting)?;
                // Reconnecting before the old connection is released fails
                ctx.client.wait_for_disconnect(None).await?;
            }
            ButtonlessJump::WithoutBonds => {
                self.jump_secure(ctx).await?;
                ctx.session.goto(TransferState::Disconnecting)?;
                ctx.client.disconnect().await?;
            }
        }

        let rediscover = self.changes_address() || ctx.config.force_scanning_for_new_address;
        info!(rediscover, "Device switched to bootloader mode");
        Ok(EngineOutcome::JumpedToBootloader { rediscover })
    }
}
