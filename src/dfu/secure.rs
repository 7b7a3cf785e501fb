//! Secure DFU (nRF5 SDK 12 and newer bootloaders).
//!
//! The image travels as a chain of objects. Each object is created,
//! streamed over the packet characteristic, checked with CALCULATE CHECKSUM
//! and committed with EXECUTE. The init packet is a single Command object;
//! firmware is split into Data objects of the size reported by SELECT.
//!
//! Interrupted transfers resume from whatever the bootloader already holds,
//! as long as its CRC matches the local image.

use std::io::Read;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::config::{DfuConfig, MAX_CHECKPOINT_ATTEMPTS};
use super::digest::crc32;
use super::engine::{EngineOutcome, TransferContext, TransferEngine};
use super::error::{DfuError, DfuResult};
use super::events::DfuStage;
use super::opcodes::{ObjectType, SecureOpcode, SecureStatus};
use super::state::{ContentType, Dialect, TransferState};
use super::transfer::ChunkWriter;
use crate::traits::{Link, SubscribeMode};

/// Response to SELECT OBJECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ObjectInfo {
    max_size: u32,
    offset: u32,
    crc: u32,
}

/// Response to CALCULATE CHECKSUM, also the shape of a receipt notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Checksum {
    offset: u32,
    crc: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecureEngine;

impl SecureEngine {
    pub fn new() -> Self {
        Self
    }

    async fn negotiate_mtu<L: Link>(ctx: &mut TransferContext<'_, L>) -> DfuResult<()> {
        if ctx.config.mtu == 0 {
            debug!("MTU request disabled");
            return Ok(());
        }
        match ctx
            .client
            .request_mtu(ctx.config.mtu, ctx.config.mtu_timeout)
            .await
        {
            Ok(mtu) => {
                ctx.session.mtu_payload = DfuConfig::payload_for_mtu(mtu);
                info!(mtu, payload = ctx.session.mtu_payload, "MTU negotiated");
                Ok(())
            }
            Err(e @ DfuError::Link(_)) => {
                warn!(error = %e, payload = ctx.session.mtu_payload, "MTU request rejected, using default payload");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn send_init_packet<L: Link>(
        ctx: &mut TransferContext<'_, L>,
        init: &[u8],
    ) -> DfuResult<()> {
        let packet = ctx.config.uuids.secure_packet;
        let len = init.len() as u32;
        let expected_crc = crc32(init);

        ctx.session.goto(TransferState::InitExchange)?;
        ctx.observer.on_stage(&DfuStage::SendingInit);

        let info = select_object(ctx, ObjectType::Command).await?;
        debug!(?info, "Command object selected");

        let mut offset = 0u32;
        if !ctx.config.disable_resume
            && info.offset > 0
            && info.offset <= len
            && info.crc == crc32(&init[..info.offset as usize])
        {
            info!(offset = info.offset, "Resuming init packet");
            offset = info.offset;
        }

        if offset < len {
            set_prn(ctx, 0).await?;

            let mut attempt = 1u8;
            loop {
                if offset == 0 {
                    create_object(ctx, ObjectType::Command, len).await?;
                }
                let payload = ctx.session.mtu_payload;
                for chunk in init[offset as usize..].chunks(payload) {
                    ctx.client.write(packet, chunk).await?;
                }

                let failure = match checkpoint(calculate_checksum(ctx).await)? {
                    Ok(checksum) if checksum.offset == len && checksum.crc == expected_crc => break,
                    Ok(checksum) => DfuError::CrcMismatch {
                        expected: expected_crc,
                        actual: checksum.crc,
                    },
                    Err(malformed) => malformed,
                };
                if attempt >= MAX_CHECKPOINT_ATTEMPTS {
                    return Err(failure);
                }
                warn!(error = %failure, "Init packet not confirmed, sending again");
                attempt += 1;
                offset = 0;
            }
        } else {
            info!("Init packet already received, executing");
        }

        execute(ctx).await
    }

    /// Skip what the bootloader already holds. Returns the offset of the
    /// object to continue, if its bytes can be reused.
    async fn resume_data<L: Link>(
        ctx: &mut TransferContext<'_, L>,
        info: ObjectInfo,
        total: u32,
    ) -> DfuResult<Resume> {
        let max = info.max_size;
        let offset = info.offset;
        let mut executed = (offset / max) * max;
        let mut not_executed = offset - executed;
        // The last object may have been received but not executed
        if not_executed == 0 {
            executed -= max;
            not_executed = max;
        }

        skip(ctx, executed as usize)?;
        ctx.package.mark();
        skip(ctx, not_executed as usize)?;

        if ctx.package.crc32() != info.crc {
            info!(offset, executed, "Resume CRC mismatch, resending the current object");
            ctx.package.reset();
            ctx.session.record_sent(executed as usize);
            ctx.session.record_acked(executed);
            return Ok(Resume::FromObjectStart);
        }

        ctx.session.record_sent(offset as usize);
        ctx.session.record_acked(offset);

        if offset == total {
            info!("Firmware already received, executing the last object");
            return Ok(Resume::Complete);
        }
        if not_executed == max {
            info!(offset, "Resuming after the last received object");
            execute(ctx).await?;
            ctx.package.mark();
            return Ok(Resume::FromObjectStart);
        }
        info!(offset, "Resuming in the middle of an object");
        Ok(Resume::InObject {
            start: executed,
            end: (executed + max).min(total),
        })
    }

    async fn send_firmware<L: Link>(ctx: &mut TransferContext<'_, L>) -> DfuResult<()> {
        let control_point = ctx.config.uuids.secure_control_point;
        let packet = ctx.config.uuids.secure_packet;
        let prn = ctx.session.prn_interval;
        let total = ctx.package.total_size() as u32;

        if prn > 0 {
            set_prn(ctx, prn).await?;
        }
        let info = select_object(ctx, ObjectType::Data).await?;
        debug!(?info, "Data object selected");
        if info.max_size == 0 {
            return Err(DfuError::InvalidResponse {
                request: SecureOpcode::SelectObject as u8,
                response: info.max_size.to_le_bytes().to_vec(),
            });
        }

        ctx.session.goto(TransferState::Transferring)?;
        ctx.session.begin_part(ctx.package.part_kind(), total);

        let mut resume = Resume::FromObjectStart;
        if !ctx.config.disable_resume && info.offset > 0 && info.offset <= total {
            resume = Self::resume_data(ctx, info, total).await?;
        }
        if resume == Resume::Complete {
            ctx.session.goto(TransferState::Validating)?;
            ctx.session.goto(TransferState::Activating)?;
            ctx.observer.on_stage(&DfuStage::Activating);
            return execute_final(ctx).await;
        }

        let mut writer = ChunkWriter::new(packet, control_point, ctx.session.mtu_payload, prn);
        let mut attempt = 1u8;

        loop {
            let (object_start, object_end) = match resume {
                Resume::InObject { start, end } => {
                    resume = Resume::FromObjectStart;
                    (start, end)
                }
                _ => {
                    let start = ctx.package.bytes_read() as u32;
                    let size = (total - start).min(info.max_size);
                    create_object(ctx, ObjectType::Data, size).await?;
                    writer.reset_receipt_counter();
                    (start, start + size)
                }
            };

            // Stream the object, stopping early on a bad receipt
            loop {
                let position = ctx.package.bytes_read() as u32;
                if position >= object_end {
                    break;
                }
                let segment = writer
                    .send(
                        ctx.client,
                        ctx.package,
                        ctx.session,
                        ctx.observer,
                        (object_end - position) as usize,
                    )
                    .await?;
                let Some(receipt) = segment.receipt else {
                    continue;
                };
                let sent = ctx.package.bytes_read() as u32;
                let checksum = match checkpoint(parse_receipt(&receipt))? {
                    Ok(checksum) => checksum,
                    Err(malformed) => {
                        warn!(error = %malformed, "Unreadable receipt, validating the object early");
                        break;
                    }
                };
                if checksum.offset != sent || checksum.crc != ctx.package.crc32() {
                    warn!(
                        error = %DfuError::PrnOffsetMismatch { expected: sent, actual: checksum.offset },
                        "Receipt does not match, validating the object early"
                    );
                    break;
                }
                ctx.session.record_acked(checksum.offset);
            }

            ctx.session.goto(TransferState::Validating)?;
            ctx.observer.on_stage(&DfuStage::Validating);
            let local_crc = ctx.package.crc32();
            let failure = match checkpoint(calculate_checksum(ctx).await)? {
                Ok(checksum) if checksum.offset == object_end && checksum.crc == local_crc => {
                    ctx.session.record_acked(object_end);
                    attempt = 1;
                    if object_end == total {
                        ctx.session.goto(TransferState::Activating)?;
                        ctx.observer.on_stage(&DfuStage::Activating);
                        return execute_final(ctx).await;
                    }
                    execute(ctx).await?;
                    ctx.package.mark();
                    ctx.session.goto(TransferState::Transferring)?;
                    continue;
                }
                Ok(checksum) => {
                    debug!(device_offset = checksum.offset, object_end, "Object not confirmed");
                    DfuError::CrcMismatch {
                        expected: local_crc,
                        actual: checksum.crc,
                    }
                }
                Err(malformed) => malformed,
            };

            if attempt >= MAX_CHECKPOINT_ATTEMPTS {
                return Err(failure);
            }
            warn!(
                object_start,
                error = %failure,
                "Object not confirmed, sending the object again"
            );
            attempt += 1;
            ctx.package.reset();
            ctx.session.rewind_to(object_start);
            writer.reset_receipt_counter();
            ctx.session.goto(TransferState::Transferring)?;
        }
    }

    async fn transfer<L: Link>(ctx: &mut TransferContext<'_, L>) -> DfuResult<EngineOutcome> {
        ctx.session.dialect = Some(Dialect::Secure);
        ctx.client
            .subscribe(ctx.config.uuids.secure_control_point, SubscribeMode::Notify)
            .await?;
        Self::negotiate_mtu(ctx).await?;

        // SoftDevice/Bootloader and Application go in separate connections
        let mask = ctx.package.content_type();
        if ctx.session.total_parts == 1
            && mask.intersects(ContentType::SYSTEM)
            && mask.intersects(ContentType::APPLICATION)
        {
            let system = ctx
                .package
                .set_content_type(mask.intersection(ContentType::SYSTEM))?;
            ctx.session.narrow_mask(system)?;
            ctx.session.set_parts(1, 2);
            info!(content = %system, "Sending system images first");
        }

        let Some(init) = ctx.package.init_packet().map(|i| i.bytes.clone()) else {
            return Err(DfuError::InitPacketRequired);
        };

        ctx.observer.on_stage(&DfuStage::Starting {
            dialect: Dialect::Secure,
            part: ctx.session.part_index,
            total_parts: ctx.session.total_parts,
        });
        info!(
            content = %ctx.package.content_type(),
            size = ctx.package.total_size(),
            "Starting Secure DFU"
        );

        Self::send_init_packet(ctx, &init).await?;
        Self::send_firmware(ctx).await?;

        ctx.session.goto(TransferState::Disconnecting)?;
        ctx.observer.on_stage(&DfuStage::Disconnecting);
        ctx.client.wait_for_disconnect(None).await?;

        if ctx.session.part_index < ctx.session.total_parts {
            Ok(EngineOutcome::PartCompleted {
                remaining: ContentType::APPLICATION,
            })
        } else {
            Ok(EngineOutcome::Completed)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    /// Create the next object at the package position.
    FromObjectStart,
    /// Keep filling the object the bootloader holds.
    InObject { start: u32, end: u32 },
    /// Every byte was received; only the last EXECUTE is missing.
    Complete,
}

#[async_trait]
impl TransferEngine for SecureEngine {
    fn dialect(&self) -> Option<Dialect> {
        Some(Dialect::Secure)
    }

    async fn run<L: Link>(
        &mut self,
        ctx: &mut TransferContext<'_, L>,
    ) -> DfuResult<EngineOutcome> {
        Self::transfer(ctx).await
    }
}

fn skip<L: Link>(ctx: &mut TransferContext<'_, L>, len: usize) -> DfuResult<()> {
    let mut discard = vec![0u8; len];
    ctx.package.read_exact(&mut discard)?;
    Ok(())
}

// ============================================================================
// Control point requests
// ============================================================================

async fn request<L: Link>(
    ctx: &mut TransferContext<'_, L>,
    command: &[u8],
    opcode: SecureOpcode,
) -> DfuResult<Vec<u8>> {
    ctx.client
        .write_command(ctx.config.uuids.secure_control_point, command)
        .await?;
    read_response(ctx, opcode).await
}

/// Payload of the response to `request`, after the status byte.
async fn read_response<L: Link>(
    ctx: &mut TransferContext<'_, L>,
    request: SecureOpcode,
) -> DfuResult<Vec<u8>> {
    let control_point = ctx.config.uuids.secure_control_point;
    loop {
        let response = ctx.client.next_notification(control_point).await?;
        debug!(response = %hex::encode(&response), "Secure response");
        if request != SecureOpcode::CalculateChecksum
            && response.first() == Some(&(SecureOpcode::Response as u8))
            && response.get(1) == Some(&(SecureOpcode::CalculateChecksum as u8))
        {
            debug!("Skipping stale receipt notification");
            continue;
        }
        return parse_response(request, response);
    }
}

fn parse_response(request: SecureOpcode, response: Vec<u8>) -> DfuResult<Vec<u8>> {
    let request = request as u8;
    let (status, payload) = match response.as_slice() {
        [op, req, status, payload @ ..] if *op == SecureOpcode::Response as u8 && *req == request => {
            (*status, payload)
        }
        _ => return Err(DfuError::InvalidResponse { request, response }),
    };
    match SecureStatus::from_byte(status) {
        Some(SecureStatus::Success) => Ok(payload.to_vec()),
        Some(SecureStatus::ExtendedError) => match payload.first() {
            Some(code) => Err(DfuError::remote_secure_extended(request, *code)),
            None => Err(DfuError::InvalidResponse { request, response }),
        },
        Some(_) => Err(DfuError::remote_secure(request, status)),
        None => Err(DfuError::InvalidResponse { request, response }),
    }
}

fn read_u32(payload: &[u8], index: usize, request: SecureOpcode) -> DfuResult<u32> {
    payload
        .get(index..index + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| DfuError::InvalidResponse {
            request: request as u8,
            response: payload.to_vec(),
        })
}

async fn select_object<L: Link>(
    ctx: &mut TransferContext<'_, L>,
    object: ObjectType,
) -> DfuResult<ObjectInfo> {
    let opcode = SecureOpcode::SelectObject;
    let payload = request(ctx, &[opcode as u8, object as u8], opcode).await?;
    Ok(ObjectInfo {
        max_size: read_u32(&payload, 0, opcode)?,
        offset: read_u32(&payload, 4, opcode)?,
        crc: read_u32(&payload, 8, opcode)?,
    })
}

async fn create_object<L: Link>(
    ctx: &mut TransferContext<'_, L>,
    object: ObjectType,
    size: u32,
) -> DfuResult<()> {
    let opcode = SecureOpcode::CreateObject;
    let mut command = vec![opcode as u8, object as u8];
    command.extend_from_slice(&size.to_le_bytes());
    debug!(?object, size, "Creating object");
    request(ctx, &command, opcode).await.map(|_| ())
}

async fn set_prn<L: Link>(ctx: &mut TransferContext<'_, L>, interval: u16) -> DfuResult<()> {
    let opcode = SecureOpcode::SetPrn;
    let [lo, hi] = interval.to_le_bytes();
    request(ctx, &[opcode as u8, lo, hi], opcode).await.map(|_| ())
}

async fn calculate_checksum<L: Link>(ctx: &mut TransferContext<'_, L>) -> DfuResult<Checksum> {
    let opcode = SecureOpcode::CalculateChecksum;
    let payload = request(ctx, &[opcode as u8], opcode).await?;
    let checksum = Checksum {
        offset: read_u32(&payload, 0, opcode)?,
        crc: read_u32(&payload, 4, opcode)?,
    };
    debug!(
        offset = checksum.offset,
        crc = format_args!("0x{:08X}", checksum.crc),
        "Checksum received"
    );
    Ok(checksum)
}

async fn execute<L: Link>(ctx: &mut TransferContext<'_, L>) -> DfuResult<()> {
    let opcode = SecureOpcode::Execute;
    request(ctx, &[opcode as u8], opcode).await.map(|_| ())
}

/// Execute the last object; the bootloader may reset before answering.
async fn execute_final<L: Link>(ctx: &mut TransferContext<'_, L>) -> DfuResult<()> {
    let opcode = SecureOpcode::Execute;
    ctx.client
        .write_expecting_disconnect(ctx.config.uuids.secure_control_point, &[opcode as u8])
        .await?;
    if !ctx.client.is_connected() {
        return Ok(());
    }
    match read_response(ctx, opcode).await {
        Ok(_) | Err(DfuError::Disconnected { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Split checksum results at a checkpoint: a garbled answer is returned as
/// the inner error so the caller can retry, anything else stays fatal.
fn checkpoint(result: DfuResult<Checksum>) -> DfuResult<Result<Checksum, DfuError>> {
    match result {
        Ok(checksum) => Ok(Ok(checksum)),
        Err(e @ DfuError::InvalidResponse { .. }) => Ok(Err(e)),
        Err(e) => Err(e),
    }
}

/// `[0x60, 0x03, 0x01, offset u32, crc u32]`
fn parse_receipt(value: &[u8]) -> DfuResult<Checksum> {
    let opcode = SecureOpcode::CalculateChecksum;
    let payload = parse_response(opcode, value.to_vec())?;
    Ok(Checksum {
        offset: read_u32(&payload, 0, opcode)?,
        crc: read_u32(&payload, 4, opcode)?,
    })
}
