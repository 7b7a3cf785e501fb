//! Chunked image writes with packet receipt notification flow control.
//!
//! Shared by both dialects. Bytes are pulled from the package, split into
//! packets of the negotiated payload and written to the packet
//! characteristic. With a PRN interval `n > 0` the writer stops after every
//! `n` packets and hands the receipt notification back to the dialect, which
//! decides whether the checkpoint holds.

use std::io::Read;

use tracing::debug;
use uuid::Uuid;

use super::error::{DfuError, DfuResult};
use super::events::{DfuObserver, DfuStage};
use super::gatt::GattClient;
use super::package::FirmwarePackage;
use super::state::TransferSession;
use crate::traits::Link;

/// Data sent by one [`ChunkWriter::send`] call.
#[derive(Debug, Default)]
pub struct Segment {
    /// Bytes written during this call.
    pub bytes: Vec<u8>,
    /// Receipt notification that ended the segment, if any.
    pub receipt: Option<Vec<u8>>,
}

/// Packet writer bound to one packet/control-point pair.
#[derive(Debug, Clone)]
pub struct ChunkWriter {
    packet: Uuid,
    control_point: Uuid,
    payload: usize,
    prn_interval: u16,
    packets_since_receipt: u16,
    last_percent: Option<usize>,
}

impl ChunkWriter {
    pub fn new(packet: Uuid, control_point: Uuid, payload: usize, prn_interval: u16) -> Self {
        Self {
            packet,
            control_point,
            payload: payload.max(1),
            prn_interval,
            packets_since_receipt: 0,
            last_percent: None,
        }
    }

    pub fn payload(&self) -> usize {
        self.payload
    }

    /// Forget packets counted toward the next receipt, after a rewind or a
    /// new object.
    pub fn reset_receipt_counter(&mut self) {
        self.packets_since_receipt = 0;
    }

    /// Send up to `len` bytes, returning early when a receipt is due.
    ///
    /// A receipt is only awaited while bytes of `len` remain; the dialect
    /// confirms the end of a segment with its own command.
    pub async fn send<L: Link>(
        &mut self,
        client: &mut GattClient<L>,
        package: &mut FirmwarePackage,
        session: &mut TransferSession,
        observer: &dyn DfuObserver,
        len: usize,
    ) -> DfuResult<Segment> {
        let remaining_in_image = session.image_size.saturating_sub(session.bytes_sent) as usize;
        if len > remaining_in_image {
            return Err(DfuError::InvalidState {
                reason: format!(
                    "{} bytes requested but only {} left in the image",
                    len, remaining_in_image
                ),
            });
        }

        let mut segment = Segment {
            bytes: Vec::with_capacity(len),
            receipt: None,
        };
        let mut buffer = vec![0u8; self.payload];

        while segment.bytes.len() < len {
            if client.pause_point().await? {
                observer.on_stage(&DfuStage::Paused);
            }

            let size = (len - segment.bytes.len()).min(self.payload);
            let read = package.read(&mut buffer[..size])?;
            if read == 0 {
                return Err(DfuError::InvalidState {
                    reason: "firmware package ended before the declared image size".into(),
                });
            }
            client.write(self.packet, &buffer[..read]).await?;
            segment.bytes.extend_from_slice(&buffer[..read]);
            session.record_sent(read);
            self.report(session, observer);

            if self.prn_interval > 0 {
                self.packets_since_receipt += 1;
                if self.packets_since_receipt >= self.prn_interval && segment.bytes.len() < len {
                    self.packets_since_receipt = 0;
                    let receipt = client.next_notification(self.control_point).await?;
                    debug!(
                        sent = session.bytes_sent,
                        receipt = %hex::encode(&receipt),
                        "Packet receipt notification"
                    );
                    segment.receipt = Some(receipt);
                    return Ok(segment);
                }
            }
        }

        Ok(segment)
    }

    fn report(&mut self, session: &TransferSession, observer: &dyn DfuObserver) {
        let total = session.image_size as usize;
        let sent = session.bytes_sent as usize;
        let percent = if total == 0 { 100 } else { sent * 100 / total };
        if self.last_percent == Some(percent) {
            return;
        }
        self.last_percent = Some(percent);
        observer.on_stage(&DfuStage::Uploading {
            sent,
            total,
            part: session.part_index,
            total_parts: session.total_parts,
        });
    }
}
