//! Scripted DFU peripheral for engine and session tests.
//!
//! Each write is answered synchronously: the write completion is queued
//! first, then whatever the emulated bootloader would notify.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::dfu::config::{
    BUTTONLESS_WITHOUT_BONDS_UUID, BUTTONLESS_WITH_BONDS_UUID, LEGACY_DFU_CONTROL_POINT_UUID,
    LEGACY_DFU_PACKET_UUID, LEGACY_DFU_SERVICE_UUID, LEGACY_DFU_VERSION_UUID,
    SECURE_DFU_CONTROL_POINT_UUID, SECURE_DFU_PACKET_UUID, SECURE_DFU_SERVICE_UUID,
};
use crate::dfu::crc32;
use crate::traits::{
    BondState, Connector, DeviceAddress, GattService, Link, LinkError, LinkEvent, LinkEvents,
    LinkResult, SubscribeMode,
};

const GENERIC_ACCESS: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805F9B34FB);
const GENERIC_ATTRIBUTE: Uuid = Uuid::from_u128(0x00001801_0000_1000_8000_00805F9B34FB);
const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180F_0000_1000_8000_00805F9B34FB);

const DEFAULT_MAX_OBJECT_SIZE: u32 = 4096;
const MAX_COMMAND_SIZE: u32 = 256;

/// Everything the peripheral saw.
#[derive(Debug, Default)]
pub struct SimJournal {
    pub writes: Vec<(Uuid, Vec<u8>)>,
    /// Firmware offset of every firmware packet.
    pub packet_offsets: Vec<usize>,
    pub firmware: Vec<u8>,
    pub init: Vec<u8>,
    pub disconnect_requested: bool,
    pub receipts_sent: usize,
}

impl SimJournal {
    pub fn writes_to(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        self.writes
            .iter()
            .filter(|(c, _)| *c == characteristic)
            .map(|(_, value)| value.clone())
            .collect()
    }
}

/// What the buttonless service does after ENTER BOOTLOADER.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonlessReply {
    /// Respond with the status; success is followed by a disconnect.
    Status(u8),
    /// Drop the link without responding.
    DisconnectOnly,
    /// Never respond.
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyFault {
    /// First receipt at `at` reports `keep` and drops the bytes after it.
    NakReceiptOnce { at: usize, keep: usize },
    /// Every receipt at `at` does.
    NakReceiptAlways { at: usize, keep: usize },
    /// Start DFU answers INVALID STATE.
    InvalidStateOnStart,
    /// Start DFU with application and system images answers NOT SUPPORTED.
    RejectCombined,
    /// SDK 6 bootloader: only `[0x01]` plus the application size works.
    TypelessStartOnly,
    /// First receipt at `at` is cut short and the bytes after `keep` are lost.
    MalformedReceiptOnce { at: usize, keep: usize },
    /// Start DFU answers with a status byte no bootloader defines.
    UnknownStartStatus(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureFault {
    CorruptInitChecksum { times: u8 },
    CorruptDataChecksum { times: u8 },
    /// CALCULATE CHECKSUM of a data object answers without the CRC.
    TruncatedDataChecksum { times: u8 },
    /// EXECUTE of the init packet fails with this extended error.
    ExecuteInitExtendedError(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Personality {
    Raw,
    LegacyApplication,
    LegacyBootloader,
    SecureBootloader,
    Buttonless { bond_sharing: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegacyMode {
    Idle,
    AwaitingSizes { typed: bool, image_type: u8 },
    ReceivingInit,
    ReceivingFirmware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SecureObject {
    None,
    Command,
    Data { end: usize },
}

/// Bootloader memory, shared by both dialects.
#[derive(Debug)]
struct Bootloader {
    legacy_fault: Option<LegacyFault>,
    secure_fault: Option<SecureFault>,
    legacy_mode: LegacyMode,
    expected_size: usize,
    prn: u16,
    packets_since_receipt: u16,
    max_object_size: u32,
    object: SecureObject,
    executed_len: usize,
    /// A Command object was created and not yet executed.
    command_pending: bool,
}

impl Default for Bootloader {
    fn default() -> Self {
        Self {
            legacy_fault: None,
            secure_fault: None,
            legacy_mode: LegacyMode::Idle,
            expected_size: 0,
            prn: 0,
            packets_since_receipt: 0,
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
            object: SecureObject::None,
            executed_len: 0,
            command_pending: false,
        }
    }
}

pub struct SimulatedPeripheral {
    address: DeviceAddress,
    personality: Personality,
    services: Vec<GattService>,
    bond_state: BondState,
    version: Option<u16>,
    mtu_response: Option<u16>,
    buttonless_reply: ButtonlessReply,
    connected: bool,
    sender: mpsc::UnboundedSender<LinkEvent>,
    events: LinkEvents,
    bootloader: Bootloader,
    journal: Arc<Mutex<SimJournal>>,
}

impl SimulatedPeripheral {
    fn new(personality: Personality, services: Vec<GattService>) -> Self {
        let (sender, events) = mpsc::unbounded_channel();
        Self {
            address: DeviceAddress::new([0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x01]),
            personality,
            services,
            bond_state: BondState::None,
            version: None,
            mtu_response: Some(23),
            buttonless_reply: ButtonlessReply::Status(0x01),
            connected: true,
            sender,
            events,
            bootloader: Bootloader::default(),
            journal: Arc::new(Mutex::new(SimJournal::default())),
        }
    }

    /// No services; writes only complete.
    pub fn raw() -> Self {
        Self::new(Personality::Raw, Vec::new())
    }

    /// Legacy bootloader: GAP, GATT and the DFU service, with the version
    /// characteristic when `version` is given.
    pub fn legacy_bootloader(version: Option<u16>) -> Self {
        let mut sim = Self::new(
            Personality::LegacyBootloader,
            base_services(legacy_service(version.is_some())),
        );
        sim.version = version;
        sim
    }

    /// Application exposing the Legacy DFU service next to its own services.
    /// Version 0 means no version characteristic.
    pub fn legacy_application(version: u16) -> Self {
        let mut services = base_services(legacy_service(version > 0));
        services.push(GattService {
            uuid: BATTERY_SERVICE,
            characteristics: Vec::new(),
        });
        let mut sim = Self::new(Personality::LegacyApplication, services);
        sim.version = (version > 0).then_some(version);
        sim
    }

    pub fn secure_bootloader() -> Self {
        let mut sim = Self::new(
            Personality::SecureBootloader,
            base_services(GattService {
                uuid: SECURE_DFU_SERVICE_UUID,
                characteristics: vec![SECURE_DFU_CONTROL_POINT_UUID, SECURE_DFU_PACKET_UUID],
            }),
        );
        sim.mtu_response = Some(247);
        sim
    }

    /// Application with a Secure buttonless service; bonded when sharing bonds.
    pub fn buttonless(bond_sharing: bool) -> Self {
        let characteristic = if bond_sharing {
            BUTTONLESS_WITH_BONDS_UUID
        } else {
            BUTTONLESS_WITHOUT_BONDS_UUID
        };
        let mut sim = Self::new(
            Personality::Buttonless { bond_sharing },
            base_services(GattService {
                uuid: SECURE_DFU_SERVICE_UUID,
                characteristics: vec![characteristic],
            }),
        );
        if bond_sharing {
            sim.bond_state = BondState::Bonded;
        }
        sim
    }

    pub fn with_address(mut self, address: DeviceAddress) -> Self {
        self.address = address;
        self
    }

    pub fn with_bond_state(mut self, bond_state: BondState) -> Self {
        self.bond_state = bond_state;
        self
    }

    pub fn with_buttonless_reply(mut self, reply: ButtonlessReply) -> Self {
        self.buttonless_reply = reply;
        self
    }

    pub fn with_legacy_fault(mut self, fault: LegacyFault) -> Self {
        self.bootloader.legacy_fault = Some(fault);
        self
    }

    pub fn with_secure_fault(mut self, fault: SecureFault) -> Self {
        self.bootloader.secure_fault = Some(fault);
        self
    }

    pub fn with_max_object_size(mut self, size: u32) -> Self {
        self.bootloader.max_object_size = size;
        self
    }

    /// State left by an interrupted Secure transfer: the executed init
    /// packet and `firmware` received, of which `executed_len` bytes executed.
    pub fn with_received(mut self, init: &[u8], firmware: &[u8], executed_len: usize) -> Self {
        {
            let mut journal = self.journal.lock().expect("journal poisoned");
            journal.init = init.to_vec();
            journal.firmware = firmware.to_vec();
        }
        self.bootloader.executed_len = executed_len;
        self
    }

    /// Deliver `event` before anything else the peripheral sends.
    pub fn queue_event(&mut self, event: LinkEvent) {
        let _ = self.sender.send(event);
    }

    /// MTU reported after a request; `None` never answers.
    pub fn set_mtu_response(&mut self, mtu: Option<u16>) {
        self.mtu_response = mtu;
    }

    pub fn journal(&self) -> Arc<Mutex<SimJournal>> {
        self.journal.clone()
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.sender.send(event);
    }

    fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        self.emit(LinkEvent::ValueChanged {
            characteristic,
            value,
        });
    }

    fn drop_link(&mut self) {
        self.connected = false;
        self.emit(LinkEvent::Disconnected);
    }

    // ------------------------------------------------------------------
    // Legacy bootloader
    // ------------------------------------------------------------------

    fn legacy_response(&self, request: u8, status: u8) {
        self.notify(LEGACY_DFU_CONTROL_POINT_UUID, vec![0x10, request, status]);
    }

    fn legacy_control_point(&mut self, value: &[u8]) {
        let bl = &mut self.bootloader;
        match value {
            [0x01, image_type] => {
                bl.legacy_mode = LegacyMode::AwaitingSizes {
                    typed: true,
                    image_type: *image_type,
                }
            }
            [0x01] => {
                bl.legacy_mode = LegacyMode::AwaitingSizes {
                    typed: false,
                    image_type: 0x04,
                }
            }
            [0x02, 0x00] => {
                bl.legacy_mode = LegacyMode::ReceivingInit;
                self.journal.lock().expect("journal poisoned").init.clear();
            }
            [0x02, 0x01] => {
                bl.legacy_mode = LegacyMode::Idle;
                self.legacy_response(0x02, 0x01);
            }
            [0x03] => {
                bl.legacy_mode = LegacyMode::ReceivingFirmware;
                bl.packets_since_receipt = 0;
            }
            [0x04] => self.legacy_response(0x04, 0x01),
            [0x05] | [0x06] => self.drop_link(),
            [0x08, lo, hi] => bl.prn = u16::from_le_bytes([*lo, *hi]),
            _ => {}
        }
    }

    fn legacy_packet(&mut self, value: &[u8]) {
        match self.bootloader.legacy_mode {
            LegacyMode::AwaitingSizes { typed, image_type } => {
                self.bootloader.legacy_mode = LegacyMode::Idle;
                let status = self.legacy_start_status(typed, image_type, value);
                self.legacy_response(0x01, status);
            }
            LegacyMode::ReceivingInit => {
                self.journal
                    .lock()
                    .expect("journal poisoned")
                    .init
                    .extend_from_slice(value);
            }
            LegacyMode::ReceivingFirmware => self.legacy_firmware_packet(value),
            LegacyMode::Idle => {}
        }
    }

    fn legacy_start_status(&mut self, typed: bool, image_type: u8, sizes: &[u8]) -> u8 {
        let words: Vec<usize> = sizes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]) as usize)
            .collect();
        self.bootloader.expected_size = words.iter().sum();

        match self.bootloader.legacy_fault {
            Some(LegacyFault::InvalidStateOnStart) => 0x02,
            Some(LegacyFault::RejectCombined) if image_type & 0x04 != 0 && image_type & 0x03 != 0 => {
                0x03
            }
            Some(LegacyFault::TypelessStartOnly) if typed => 0x03,
            Some(LegacyFault::UnknownStartStatus(status)) => status,
            _ => {
                self.journal.lock().expect("journal poisoned").firmware.clear();
                0x01
            }
        }
    }

    fn legacy_firmware_packet(&mut self, value: &[u8]) {
        let mut journal = self.journal.lock().expect("journal poisoned");
        let offset = journal.firmware.len();
        journal.packet_offsets.push(offset);
        journal.firmware.extend_from_slice(value);
        let received = journal.firmware.len();

        if received >= self.bootloader.expected_size {
            drop(journal);
            self.legacy_response(0x03, 0x01);
            return;
        }

        let bl = &mut self.bootloader;
        if bl.prn == 0 {
            return;
        }
        bl.packets_since_receipt += 1;
        if bl.packets_since_receipt < bl.prn {
            return;
        }
        bl.packets_since_receipt = 0;

        let mut reported = received;
        match bl.legacy_fault {
            Some(LegacyFault::MalformedReceiptOnce { at, keep }) if received == at => {
                bl.legacy_fault = None;
                journal.firmware.truncate(keep);
                journal.receipts_sent += 1;
                drop(journal);
                self.notify(LEGACY_DFU_CONTROL_POINT_UUID, vec![0x11, 0x00]);
                return;
            }
            Some(LegacyFault::NakReceiptOnce { at, keep }) if received == at => {
                bl.legacy_fault = None;
                journal.firmware.truncate(keep);
                reported = keep;
            }
            Some(LegacyFault::NakReceiptAlways { at, keep }) if received == at => {
                journal.firmware.truncate(keep);
                reported = keep;
            }
            _ => {}
        }
        journal.receipts_sent += 1;
        drop(journal);

        let mut receipt = vec![0x11];
        receipt.extend_from_slice(&(reported as u32).to_le_bytes());
        self.notify(LEGACY_DFU_CONTROL_POINT_UUID, receipt);
    }

    // ------------------------------------------------------------------
    // Secure bootloader
    // ------------------------------------------------------------------

    fn secure_response(&self, request: u8, status: u8, payload: &[u8]) {
        let mut value = vec![0x60, request, status];
        value.extend_from_slice(payload);
        self.notify(SECURE_DFU_CONTROL_POINT_UUID, value);
    }

    fn take_fault(&mut self, init: bool) -> bool {
        match &mut self.bootloader.secure_fault {
            Some(SecureFault::CorruptInitChecksum { times }) if init && *times > 0 => {
                *times -= 1;
                true
            }
            Some(SecureFault::CorruptDataChecksum { times }) if !init && *times > 0 => {
                *times -= 1;
                true
            }
            _ => false,
        }
    }

    fn take_truncated_checksum(&mut self) -> bool {
        match &mut self.bootloader.secure_fault {
            Some(SecureFault::TruncatedDataChecksum { times }) if *times > 0 => {
                *times -= 1;
                true
            }
            _ => false,
        }
    }

    fn secure_control_point(&mut self, value: &[u8], expect_disconnect: bool) {
        match value {
            [0x06, object] => {
                let journal = self.journal.lock().expect("journal poisoned");
                let (max, received) = if *object == 0x01 {
                    (MAX_COMMAND_SIZE, journal.init.clone())
                } else {
                    (self.bootloader.max_object_size, journal.firmware.clone())
                };
                drop(journal);

                self.bootloader.packets_since_receipt = 0;
                self.bootloader.object = if *object == 0x01 {
                    SecureObject::Command
                } else {
                    SecureObject::Data {
                        end: self.bootloader.executed_len + max as usize,
                    }
                };
                let mut payload = max.to_le_bytes().to_vec();
                payload.extend_from_slice(&(received.len() as u32).to_le_bytes());
                payload.extend_from_slice(&crc32(&received).to_le_bytes());
                self.secure_response(0x06, 0x01, &payload);
            }
            [0x01, object, a, b, c, d] => {
                let size = u32::from_le_bytes([*a, *b, *c, *d]) as usize;
                let mut journal = self.journal.lock().expect("journal poisoned");
                if *object == 0x01 {
                    journal.init.clear();
                    self.bootloader.object = SecureObject::Command;
                    self.bootloader.command_pending = true;
                } else {
                    journal.firmware.truncate(self.bootloader.executed_len);
                    self.bootloader.object = SecureObject::Data {
                        end: self.bootloader.executed_len + size,
                    };
                }
                drop(journal);
                self.bootloader.packets_since_receipt = 0;
                self.secure_response(0x01, 0x01, &[]);
            }
            [0x02, lo, hi] => {
                self.bootloader.prn = u16::from_le_bytes([*lo, *hi]);
                self.secure_response(0x02, 0x01, &[]);
            }
            [0x03] => {
                let init = self.bootloader.object == SecureObject::Command;
                let received = {
                    let journal = self.journal.lock().expect("journal poisoned");
                    if init {
                        journal.init.clone()
                    } else {
                        journal.firmware.clone()
                    }
                };
                if !init && self.take_truncated_checksum() {
                    self.secure_response(0x03, 0x01, &(received.len() as u32).to_le_bytes());
                    return;
                }
                let mut crc = crc32(&received);
                if self.take_fault(init) {
                    crc ^= 0xFFFF_FFFF;
                }
                let mut payload = (received.len() as u32).to_le_bytes().to_vec();
                payload.extend_from_slice(&crc.to_le_bytes());
                self.secure_response(0x03, 0x01, &payload);
            }
            [0x04] => match self.bootloader.object {
                SecureObject::Command => {
                    if let Some(SecureFault::ExecuteInitExtendedError(code)) =
                        self.bootloader.secure_fault
                    {
                        self.secure_response(0x04, 0x0B, &[code]);
                        return;
                    }
                    if self.bootloader.command_pending {
                        // A new init packet starts a new update
                        self.bootloader.command_pending = false;
                        self.bootloader.executed_len = 0;
                        self.journal.lock().expect("journal poisoned").firmware.clear();
                    }
                    self.secure_response(0x04, 0x01, &[]);
                }
                SecureObject::Data { .. } => {
                    self.bootloader.executed_len =
                        self.journal.lock().expect("journal poisoned").firmware.len();
                    self.secure_response(0x04, 0x01, &[]);
                    if expect_disconnect {
                        self.drop_link();
                    }
                }
                SecureObject::None => self.secure_response(0x04, 0x05, &[]),
            },
            [opcode, ..] => self.secure_response(*opcode, 0x02, &[]),
            [] => {}
        }
    }

    fn secure_packet(&mut self, value: &[u8]) {
        let mut journal = self.journal.lock().expect("journal poisoned");
        let end = match self.bootloader.object {
            SecureObject::Command => {
                journal.init.extend_from_slice(value);
                return;
            }
            SecureObject::Data { end } => end,
            SecureObject::None => return,
        };
        let offset = journal.firmware.len();
        journal.packet_offsets.push(offset);
        journal.firmware.extend_from_slice(value);
        let received = journal.firmware.clone();

        let bl = &mut self.bootloader;
        if bl.prn == 0 || received.len() >= end {
            return;
        }
        bl.packets_since_receipt += 1;
        if bl.packets_since_receipt < bl.prn {
            return;
        }
        bl.packets_since_receipt = 0;
        journal.receipts_sent += 1;
        drop(journal);

        let mut payload = (received.len() as u32).to_le_bytes().to_vec();
        payload.extend_from_slice(&crc32(&received).to_le_bytes());
        self.secure_response(0x03, 0x01, &payload);
    }

    // ------------------------------------------------------------------
    // Applications
    // ------------------------------------------------------------------

    fn buttonless_write(&mut self, characteristic: Uuid, value: &[u8]) {
        if value != [0x01] {
            self.notify(characteristic, vec![0x20, value.first().copied().unwrap_or(0), 0x02]);
            return;
        }
        match self.buttonless_reply {
            ButtonlessReply::Status(status) => {
                self.notify(characteristic, vec![0x20, 0x01, status]);
                if status == 0x01 {
                    self.drop_link();
                }
            }
            ButtonlessReply::DisconnectOnly => self.drop_link(),
            ButtonlessReply::Silent => {}
        }
    }

    fn respond(&mut self, characteristic: Uuid, value: &[u8], expect_disconnect: bool) {
        match (self.personality, characteristic) {
            (Personality::LegacyBootloader, c) if c == LEGACY_DFU_CONTROL_POINT_UUID => {
                self.legacy_control_point(value)
            }
            (Personality::LegacyBootloader, c) if c == LEGACY_DFU_PACKET_UUID => {
                self.legacy_packet(value)
            }
            (Personality::LegacyApplication, c) if c == LEGACY_DFU_CONTROL_POINT_UUID => {
                if value == [0x01, 0x04] {
                    self.drop_link();
                }
            }
            (Personality::SecureBootloader, c) if c == SECURE_DFU_CONTROL_POINT_UUID => {
                self.secure_control_point(value, expect_disconnect)
            }
            (Personality::SecureBootloader, c) if c == SECURE_DFU_PACKET_UUID => {
                self.secure_packet(value)
            }
            (Personality::Buttonless { bond_sharing }, c)
                if c == BUTTONLESS_WITH_BONDS_UUID && bond_sharing
                    || c == BUTTONLESS_WITHOUT_BONDS_UUID && !bond_sharing =>
            {
                self.buttonless_write(c, value)
            }
            _ => {}
        }
    }
}

fn base_services(dfu: GattService) -> Vec<GattService> {
    vec![
        GattService {
            uuid: GENERIC_ACCESS,
            characteristics: Vec::new(),
        },
        GattService {
            uuid: GENERIC_ATTRIBUTE,
            characteristics: Vec::new(),
        },
        dfu,
    ]
}

fn legacy_service(with_version: bool) -> GattService {
    let mut characteristics = vec![LEGACY_DFU_CONTROL_POINT_UUID, LEGACY_DFU_PACKET_UUID];
    if with_version {
        characteristics.push(LEGACY_DFU_VERSION_UUID);
    }
    GattService {
        uuid: LEGACY_DFU_SERVICE_UUID,
        characteristics,
    }
}

#[async_trait]
impl Link for SimulatedPeripheral {
    fn address(&self) -> DeviceAddress {
        self.address
    }

    fn services(&self) -> Vec<GattService> {
        self.services.clone()
    }

    fn bond_state(&self) -> BondState {
        self.bond_state
    }

    fn events(&mut self) -> &mut LinkEvents {
        &mut self.events
    }

    async fn write(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
        expect_disconnect: bool,
    ) -> LinkResult<()> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        self.journal
            .lock()
            .expect("journal poisoned")
            .writes
            .push((characteristic, value.to_vec()));
        self.emit(LinkEvent::WriteComplete {
            characteristic,
            status: 0,
        });
        self.respond(characteristic, value, expect_disconnect);
        Ok(())
    }

    async fn subscribe(&mut self, _characteristic: Uuid, _mode: SubscribeMode) -> LinkResult<()> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        Ok(())
    }

    async fn read(&mut self, characteristic: Uuid) -> LinkResult<Vec<u8>> {
        match self.version {
            Some(version) if characteristic == LEGACY_DFU_VERSION_UUID => {
                Ok(version.to_le_bytes().to_vec())
            }
            _ => Err(LinkError::CharacteristicNotFound(characteristic)),
        }
    }

    async fn request_mtu(&mut self, mtu: u16) -> LinkResult<()> {
        if let Some(supported) = self.mtu_response {
            self.emit(LinkEvent::MtuChanged {
                mtu: mtu.min(supported),
                status: 0,
            });
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> LinkResult<()> {
        self.journal.lock().expect("journal poisoned").disconnect_requested = true;
        if self.connected {
            self.drop_link();
        }
        Ok(())
    }
}

/// Bond operations requested through [`SimulatedConnector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondOp {
    Removed(DeviceAddress),
    Created(DeviceAddress),
}

/// Hands out queued peripherals by address.
pub struct SimulatedConnector {
    devices: Mutex<HashMap<DeviceAddress, VecDeque<SimulatedPeripheral>>>,
    attempts: Arc<Mutex<Vec<DeviceAddress>>>,
    bonds: Arc<Mutex<Vec<BondOp>>>,
}

impl SimulatedConnector {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            attempts: Arc::new(Mutex::new(Vec::new())),
            bonds: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue `peripheral` for the next connection to `address`.
    pub fn with_device(self, address: DeviceAddress, peripheral: SimulatedPeripheral) -> Self {
        self.devices
            .lock()
            .expect("devices poisoned")
            .entry(address)
            .or_default()
            .push_back(peripheral);
        self
    }

    /// Every address a connection was attempted to, in order.
    pub fn attempts(&self) -> Arc<Mutex<Vec<DeviceAddress>>> {
        self.attempts.clone()
    }

    pub fn bond_ops(&self) -> Arc<Mutex<Vec<BondOp>>> {
        self.bonds.clone()
    }
}

impl Default for SimulatedConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    type Link = SimulatedPeripheral;

    async fn connect(&self, address: DeviceAddress) -> LinkResult<SimulatedPeripheral> {
        self.attempts.lock().expect("attempts poisoned").push(address);
        self.devices
            .lock()
            .expect("devices poisoned")
            .get_mut(&address)
            .and_then(|queue| queue.pop_front())
            .ok_or_else(|| LinkError::ConnectionFailed(format!("no device at {}", address)))
    }

    async fn remove_bond(&self, address: DeviceAddress) -> LinkResult<()> {
        self.bonds.lock().expect("bonds poisoned").push(BondOp::Removed(address));
        Ok(())
    }

    async fn create_bond(&self, address: DeviceAddress) -> LinkResult<()> {
        self.bonds.lock().expect("bonds poisoned").push(BondOp::Created(address));
        Ok(())
    }
}
