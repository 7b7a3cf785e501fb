//! Legacy DFU (nRF5 SDK 11 and older bootloaders).
//!
//! Control point commands are answered with `[0x10, request, status]`.
//! Flow per part:
//! 1. Capability check (version characteristic / service count)
//! 2. Start DFU with the image type, then the three image sizes
//! 3. Init packet, mandatory from version 5 on
//! 4. Receive firmware image, chunked with optional receipt notifications
//! 5. Validate, then Activate and Reset

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::buttonless::ButtonlessJump;
use super::config::{
    legacy_jump_required, LEGACY_VERSION_INIT_PACKET_REQUIRED, MAX_CHECKPOINT_ATTEMPTS,
};
use super::engine::{EngineOutcome, TransferContext, TransferEngine};
use super::error::{DfuError, DfuResult};
use super::events::DfuStage;
use super::opcodes::{
    LegacyOpcode, LegacyStatus, LEGACY_INIT_PACKET_COMPLETE, LEGACY_INIT_PACKET_RECEIVE,
};
use super::state::{ContentType, Dialect, TransferState};
use super::transfer::ChunkWriter;
use crate::traits::{Link, SubscribeMode};

/// Init packet bytes per write. Legacy bootloaders do not negotiate MTU.
const INIT_PACKET_CHUNK: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyEngine {
    restart_allowed: bool,
}

/// How the Start DFU exchange ended.
enum StartOutcome {
    Started,
    /// Device was busy with another transfer and has been reset.
    Reset,
}

impl LegacyEngine {
    pub fn new() -> Self {
        Self {
            restart_allowed: true,
        }
    }

    /// A second INVALID_STATE after a restart is fatal.
    pub fn disallow_restart(&mut self) {
        self.restart_allowed = false;
    }

    async fn read_version<L: Link>(ctx: &mut TransferContext<'_, L>) -> DfuResult<u16> {
        let uuids = &ctx.config.uuids;
        if !ctx
            .client
            .link()
            .has_characteristic(uuids.legacy_service, uuids.legacy_version)
        {
            debug!("No DFU version characteristic, assuming version 0");
            return Ok(0);
        }
        let value = ctx.client.read(uuids.legacy_version).await?;
        let version = match value.as_slice() {
            [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
            _ => 0,
        };
        info!(version, "Legacy DFU version read");
        Ok(version)
    }

    async fn start<L: Link>(&self, ctx: &mut TransferContext<'_, L>) -> DfuResult<StartOutcome> {
        let control_point = ctx.config.uuids.legacy_control_point;
        let packet = ctx.config.uuids.legacy_packet;

        loop {
            let mask = ctx.package.content_type();
            let sizes = image_sizes(ctx);
            info!(content = %mask, "Starting Legacy DFU");
            ctx.client
                .write_command(
                    control_point,
                    &[LegacyOpcode::StartDfu as u8, mask.legacy_image_type()],
                )
                .await?;
            ctx.client.write(packet, &sizes).await?;

            let status = read_status(ctx, LegacyOpcode::StartDfu).await?;
            match status {
                LegacyStatus::Success => return Ok(StartOutcome::Started),
                LegacyStatus::InvalidState if self.restart_allowed => {
                    warn!("Bootloader is in an invalid state, resetting");
                    ctx.client
                        .write_expecting_disconnect(control_point, &[LegacyOpcode::Reset as u8])
                        .await?;
                    return Ok(StartOutcome::Reset);
                }
                LegacyStatus::NotSupported
                    if mask.intersects(ContentType::APPLICATION)
                        && mask.intersects(ContentType::SYSTEM) =>
                {
                    // The bootloader takes SoftDevice/Bootloader and Application in separate connections
                    info!("Combined update not supported, sending system part first");
                    let system = ctx.package.set_content_type(mask.intersection(ContentType::SYSTEM))?;
                    ctx.session.narrow_mask(system)?;
                    ctx.session.set_parts(1, 2);
                }
                LegacyStatus::NotSupported if mask == ContentType::APPLICATION => {
                    info!("Falling back to Start DFU without image type");
                    return start_without_type(ctx).await.map(|_| StartOutcome::Started);
                }
                _ => {
                    return Err(DfuError::remote_legacy(
                        LegacyOpcode::StartDfu as u8,
                        status as u8,
                    ))
                }
            }
        }
    }

    async fn send_init_packet<L: Link>(
        ctx: &mut TransferContext<'_, L>,
        init: &[u8],
    ) -> DfuResult<()> {
        let control_point = ctx.config.uuids.legacy_control_point;
        let packet = ctx.config.uuids.legacy_packet;

        ctx.session.goto(TransferState::InitExchange)?;
        ctx.observer.on_stage(&DfuStage::SendingInit);
        ctx.client
            .write_command(
                control_point,
                &[LegacyOpcode::InitDfuParams as u8, LEGACY_INIT_PACKET_RECEIVE],
            )
            .await?;
        for chunk in init.chunks(INIT_PACKET_CHUNK) {
            ctx.client.write(packet, chunk).await?;
        }
        ctx.client
            .write_command(
                control_point,
                &[LegacyOpcode::InitDfuParams as u8, LEGACY_INIT_PACKET_COMPLETE],
            )
            .await?;
        expect_success(ctx, LegacyOpcode::InitDfuParams).await
    }

    /// Stream the selected images, rewinding to the last verified receipt on
    /// an offset mismatch. Returns the bytes sent.
    async fn send_firmware<L: Link>(ctx: &mut TransferContext<'_, L>) -> DfuResult<Vec<u8>> {
        let control_point = ctx.config.uuids.legacy_control_point;
        let packet = ctx.config.uuids.legacy_packet;
        let prn = ctx.session.prn_interval;
        let total = ctx.package.total_size();

        if prn > 0 {
            let [lo, hi] = prn.to_le_bytes();
            ctx.client
                .write_command(
                    control_point,
                    &[LegacyOpcode::PacketReceiptNotificationRequest as u8, lo, hi],
                )
                .await?;
        }

        ctx.client
            .write_command(control_point, &[LegacyOpcode::ReceiveFirmwareImage as u8])
            .await?;
        ctx.session.goto(TransferState::Transferring)?;
        ctx.session.begin_part(ctx.package.part_kind(), total as u32);

        let mut writer = ChunkWriter::new(packet, control_point, ctx.session.mtu_payload, prn);
        let mut transferred = Vec::with_capacity(total);
        let mut checkpoint = 0usize;
        let mut attempts = 0u8;
        ctx.package.mark();

        while transferred.len() < total {
            let segment = writer
                .send(
                    ctx.client,
                    ctx.package,
                    ctx.session,
                    ctx.observer,
                    total - transferred.len(),
                )
                .await?;
            transferred.extend_from_slice(&segment.bytes);

            let Some(receipt) = segment.receipt else {
                continue;
            };
            let expected = transferred.len() as u32;
            // A garbled receipt is treated like a wrong offset
            let mismatch = match parse_receipt(&receipt) {
                Ok(reported) if reported == expected => {
                    ctx.package.mark();
                    ctx.session.record_acked(reported);
                    checkpoint = transferred.len();
                    attempts = 0;
                    continue;
                }
                Ok(reported) => DfuError::PrnOffsetMismatch {
                    expected,
                    actual: reported,
                },
                Err(e) => e,
            };
            attempts += 1;
            if attempts >= MAX_CHECKPOINT_ATTEMPTS {
                warn!(error = %mismatch, "Checkpoint failed again, giving up");
                return Err(DfuError::CheckpointFailed {
                    offset: checkpoint as u32,
                    attempts,
                });
            }
            warn!(
                error = %mismatch,
                checkpoint,
                "Resending from the last checkpoint"
            );
            ctx.package.reset();
            transferred.truncate(checkpoint);
            ctx.session.rewind_to(checkpoint as u32);
            writer.reset_receipt_counter();
        }

        // The bootloader answers once it holds the whole image
        expect_success(ctx, LegacyOpcode::ReceiveFirmwareImage).await?;
        ctx.session.record_acked(total as u32);
        Ok(transferred)
    }

    async fn transfer<L: Link>(
        &mut self,
        ctx: &mut TransferContext<'_, L>,
    ) -> DfuResult<EngineOutcome> {
        let control_point = ctx.config.uuids.legacy_control_point;
        ctx.session.dialect = Some(Dialect::Legacy);

        // Step 1: Capability check
        ctx.client
            .subscribe(control_point, SubscribeMode::Notify)
            .await?;
        let version = Self::read_version(ctx).await?;
        let service_count = ctx.client.link().services().len();
        if legacy_jump_required(version, service_count, ctx.config.assume_dfu_mode) {
            info!(version, service_count, "Application mode detected");
            return ButtonlessJump::Legacy { version }.run(ctx).await;
        }

        let init = ctx.package.init_packet().cloned();
        if init.is_none() && version >= LEGACY_VERSION_INIT_PACKET_REQUIRED {
            return Err(DfuError::InitPacketRequired);
        }

        // Step 2: Start DFU
        if let StartOutcome::Reset = self.start(ctx).await? {
            ctx.session.goto(TransferState::Disconnecting)?;
            ctx.client.wait_for_disconnect(None).await?;
            return Ok(EngineOutcome::Restart);
        }
        ctx.observer.on_stage(&DfuStage::Starting {
            dialect: Dialect::Legacy,
            part: ctx.session.part_index,
            total_parts: ctx.session.total_parts,
        });

        // Step 3: Init packet
        if let Some(init) = &init {
            Self::send_init_packet(ctx, &init.bytes).await?;
        }

        // Step 4: Firmware
        let transferred = Self::send_firmware(ctx).await?;

        // Step 5: Local digest check, then Validate
        ctx.session.goto(TransferState::Validating)?;
        ctx.observer.on_stage(&DfuStage::Validating);
        if let Some(digest) = init.as_ref().and_then(|i| i.digest.as_ref()) {
            digest.verify(&transferred)?;
            debug!(algorithm = digest.algorithm(), "Local digest verified");
        }
        ctx.client
            .write_command(control_point, &[LegacyOpcode::Validate as u8])
            .await?;
        expect_success(ctx, LegacyOpcode::Validate).await?;

        // Step 6: Activate and reset
        ctx.session.goto(TransferState::Activating)?;
        ctx.observer.on_stage(&DfuStage::Activating);
        ctx.client
            .write_expecting_disconnect(control_point, &[LegacyOpcode::ActivateAndReset as u8])
            .await?;
        ctx.session.goto(TransferState::Disconnecting)?;
        ctx.observer.on_stage(&DfuStage::Disconnecting);
        ctx.client.wait_for_disconnect(None).await?;

        if ctx.session.part_index < ctx.session.total_parts {
            let remaining = ContentType::APPLICATION;
            info!(remaining = %remaining, "Part completed, remaining content needs a new connection");
            Ok(EngineOutcome::PartCompleted { remaining })
        } else {
            Ok(EngineOutcome::Completed)
        }
    }
}

impl Default for LegacyEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferEngine for LegacyEngine {
    fn dialect(&self) -> Option<Dialect> {
        Some(Dialect::Legacy)
    }

    async fn run<L: Link>(
        &mut self,
        ctx: &mut TransferContext<'_, L>,
    ) -> DfuResult<EngineOutcome> {
        let result = self.transfer(ctx).await;
        if let Err(e) = &result {
            if ctx.client.is_connected() && !matches!(e, DfuError::Disconnected { .. }) {
                // Leave the bootloader ready for the next attempt
                ctx.client
                    .write_final(ctx.config.uuids.legacy_control_point, &[LegacyOpcode::Reset as u8])
                    .await;
            }
        }
        result
    }
}

/// `[sd u32, bl u32, app u32]`, little endian.
fn image_sizes<L: Link>(ctx: &TransferContext<'_, L>) -> [u8; 12] {
    let mut sizes = [0u8; 12];
    sizes[0..4].copy_from_slice(&(ctx.package.softdevice_image_size() as u32).to_le_bytes());
    sizes[4..8].copy_from_slice(&(ctx.package.bootloader_image_size() as u32).to_le_bytes());
    sizes[8..12].copy_from_slice(&(ctx.package.application_image_size() as u32).to_le_bytes());
    sizes
}

/// SDK 6 bootloaders: `[0x01]` followed by the application size only.
async fn start_without_type<L: Link>(ctx: &mut TransferContext<'_, L>) -> DfuResult<()> {
    let size = ctx.package.application_image_size() as u32;
    ctx.client
        .write_command(ctx.config.uuids.legacy_control_point, &[LegacyOpcode::StartDfu as u8])
        .await?;
    ctx.client
        .write(ctx.config.uuids.legacy_packet, &size.to_le_bytes())
        .await?;
    expect_success(ctx, LegacyOpcode::StartDfu).await
}

/// Wait for the response to `request`, skipping stale receipt notifications.
async fn read_status<L: Link>(
    ctx: &mut TransferContext<'_, L>,
    request: LegacyOpcode,
) -> DfuResult<LegacyStatus> {
    let control_point = ctx.config.uuids.legacy_control_point;
    loop {
        let response = ctx.client.next_notification(control_point).await?;
        debug!(response = %hex::encode(&response), "Legacy response");
        if response.first() == Some(&(LegacyOpcode::PacketReceiptNotification as u8)) {
            continue;
        }
        return parse_status(request, response);
    }
}

/// `[0x10, request, status]` with a status the bootloader is known to send.
fn parse_status(request: LegacyOpcode, response: Vec<u8>) -> DfuResult<LegacyStatus> {
    let status = match response.as_slice() {
        [op, req, status] if *op == LegacyOpcode::Response as u8 && *req == request as u8 => {
            LegacyStatus::from_byte(*status)
        }
        _ => None,
    };
    status.ok_or(DfuError::InvalidResponse {
        request: request as u8,
        response,
    })
}

async fn expect_success<L: Link>(
    ctx: &mut TransferContext<'_, L>,
    request: LegacyOpcode,
) -> DfuResult<()> {
    match read_status(ctx, request).await? {
        LegacyStatus::Success => Ok(()),
        status => Err(DfuError::remote_legacy(request as u8, status as u8)),
    }
}

/// `[0x11, bytes received u32]`
fn parse_receipt(value: &[u8]) -> DfuResult<u32> {
    match value {
        [op, a, b, c, d] if *op == LegacyOpcode::PacketReceiptNotification as u8 => {
            Ok(u32::from_le_bytes([*a, *b, *c, *d]))
        }
        _ => Err(DfuError::InvalidResponse {
            request: LegacyOpcode::ReceiveFirmwareImage as u8,
            response: value.to_vec(),
        }),
    }
}
