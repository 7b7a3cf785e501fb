//! Firmware package reader for Nordic DFU.
//!
//! Reads a distribution ZIP containing either:
//! - `manifest.json` naming the `.bin`/`.hex` images and their `.dat` init packets, or
//! - fixed names (`softdevice.*`, `bootloader.*` + `system.dat`, `application.*` + `application.dat`).
//!
//! The parsed package is also the byte source for a transfer: images are read
//! in the order SoftDevice, Bootloader, Application with a running CRC32, and
//! the read position can be marked and restored when a checkpoint fails.

use std::collections::HashMap;
use std::fmt;
use std::io::{Cursor, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::{DEFAULT_MBR_SIZE, MAX_ARCHIVE_SIZE};
use super::digest::ImageDigest;
use super::error::{DfuError, DfuResult};
use super::hex::hex_to_bin;
use super::state::ContentType;

const MANIFEST: &str = "manifest.json";

// Backwards compatibility names
const SOFTDEVICE_HEX: &str = "softdevice.hex";
const SOFTDEVICE_BIN: &str = "softdevice.bin";
const BOOTLOADER_HEX: &str = "bootloader.hex";
const BOOTLOADER_BIN: &str = "bootloader.bin";
const APPLICATION_HEX: &str = "application.hex";
const APPLICATION_BIN: &str = "application.bin";
const SYSTEM_INIT: &str = "system.dat";
const APPLICATION_INIT: &str = "application.dat";

/// What a firmware image contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageKind {
    SoftDevice,
    Bootloader,
    Application,
    /// SoftDevice and Bootloader in one binary.
    SoftDeviceAndBootloader,
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageKind::SoftDevice => "softdevice",
            ImageKind::Bootloader => "bootloader",
            ImageKind::Application => "application",
            ImageKind::SoftDeviceAndBootloader => "softdevice_bootloader",
        };
        write!(f, "{}", name)
    }
}

/// A binary image ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub kind: ImageKind,
    bytes: Vec<u8>,
}

impl FirmwareImage {
    pub fn new(kind: ImageKind, bytes: Vec<u8>) -> Self {
        Self { kind, bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Init packet bytes plus the digest they declare, if known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitMetadata {
    pub bytes: Vec<u8>,
    pub digest: Option<ImageDigest>,
}

impl InitMetadata {
    fn new(bytes: Vec<u8>, declared: Option<ImageDigest>) -> Self {
        let digest = declared.or_else(|| ImageDigest::from_legacy_init_packet(&bytes));
        Self { bytes, digest }
    }
}

// ============================================================================
// manifest.json
// ============================================================================

#[derive(Debug, Deserialize)]
struct ManifestFile {
    manifest: Option<Manifest>,
}

/// Parsed `manifest.json` content.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub application: Option<FileInfo>,
    #[serde(default)]
    pub bootloader: Option<FileInfo>,
    #[serde(default)]
    pub softdevice: Option<FileInfo>,
    #[serde(default)]
    pub softdevice_bootloader: Option<SystemFileInfo>,
    // Secure DFU only: sent as one application image in a single connection
    #[serde(default)]
    pub bootloader_application: Option<SystemFileInfo>,
    #[serde(default)]
    pub softdevice_application: Option<SystemFileInfo>,
    #[serde(default)]
    pub softdevice_bootloader_application: Option<SystemFileInfo>,
    #[serde(default)]
    pub dfu_version: Option<f32>,
}

impl Manifest {
    /// The image sent as "application", including Secure-only combined roles.
    pub fn application_info(&self) -> Option<&FileInfo> {
        self.application
            .as_ref()
            .or(self.softdevice_application.as_ref().map(|s| &s.file))
            .or(self.bootloader_application.as_ref().map(|s| &s.file))
            .or(self
                .softdevice_bootloader_application
                .as_ref()
                .map(|s| &s.file))
    }

    /// Combined `*_application` roles can only be sent with Secure DFU.
    pub fn is_secure_dfu_required(&self) -> bool {
        self.bootloader_application.is_some()
            || self.softdevice_application.is_some()
            || self.softdevice_bootloader_application.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FileInfo {
    pub bin_file: String,
    #[serde(default)]
    pub dat_file: Option<String>,
    #[serde(default)]
    pub init_packet_data: Option<InitPacketData>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SystemFileInfo {
    #[serde(flatten)]
    pub file: FileInfo,
    #[serde(default)]
    pub info_read_only_metadata: Option<SystemSizes>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct SystemSizes {
    #[serde(default)]
    pub sd_size: u32,
    #[serde(default)]
    pub bl_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InitPacketData {
    pub packet_version: Option<u32>,
    pub compression_type: Option<u32>,
    pub application_version: Option<u32>,
    pub device_revision: Option<u32>,
    pub device_type: Option<u32>,
    pub firmware_crc16: Option<u16>,
    pub firmware_hash: Option<String>,
    pub softdevice_req: Vec<u32>,
}

// ============================================================================
// Package
// ============================================================================

/// Byte sources in transfer order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    SoftDevice,
    Bootloader,
    System,
    Application,
}

/// Parsed firmware package and sequential reader over the selected images.
#[derive(Debug, Clone)]
pub struct FirmwarePackage {
    manifest: Option<Manifest>,
    softdevice: Option<FirmwareImage>,
    bootloader: Option<FirmwareImage>,
    system: Option<FirmwareImage>,
    application: Option<FirmwareImage>,
    system_init: Option<InitMetadata>,
    application_init: Option<InitMetadata>,
    softdevice_size: usize,
    bootloader_size: usize,
    application_size: usize,
    content_type: ContentType,
    current: Option<Source>,
    bytes_read_from_current: usize,
    bytes_read: usize,
    crc32: crc32fast::Hasher,
    marked: Option<Source>,
    bytes_read_from_marked: usize,
    started: bool,
}

/// Read and parse a firmware package from disk.
///
/// # Arguments
/// * `path` - Path to the firmware ZIP
/// * `mbr_size` - HEX data below this address is dropped
/// * `types` - Requested content; `ContentType::AUTO` selects everything
pub fn read_firmware_zip<P: AsRef<Path>>(
    path: P,
    mbr_size: u32,
    types: ContentType,
) -> DfuResult<FirmwarePackage> {
    let path = path.as_ref();
    let size = std::fs::metadata(path)?.len();
    if size > MAX_ARCHIVE_SIZE {
        return Err(DfuError::ArchiveTooLarge {
            size,
            max: MAX_ARCHIVE_SIZE,
        });
    }
    let data = std::fs::read(path)?;
    FirmwarePackage::from_bytes(&data, mbr_size, types)
}

impl FirmwarePackage {
    /// Parse a package held in memory.
    pub fn from_bytes(data: &[u8], mbr_size: u32, types: ContentType) -> DfuResult<Self> {
        if data.len() as u64 > MAX_ARCHIVE_SIZE {
            return Err(DfuError::ArchiveTooLarge {
                size: data.len() as u64,
                max: MAX_ARCHIVE_SIZE,
            });
        }

        let (entries, manifest) = read_entries(data, mbr_size)?;
        let mut package = Self::empty(manifest);

        match package.manifest.clone() {
            Some(manifest) => package.select_from_manifest(&manifest, entries, types)?,
            None => package.select_compat(entries, types)?,
        }

        package.check_alignment()?;
        package.content_type = package.present_content();
        package.current = package.first_source(package.content_type);
        package.mark();
        debug!(
            content = %package.content_type,
            secure_only = package.is_secure_dfu_required(),
            "Firmware package parsed"
        );
        Ok(package)
    }

    /// Parse with the default MBR size and every image selected.
    pub fn from_bytes_auto(data: &[u8]) -> DfuResult<Self> {
        Self::from_bytes(data, DEFAULT_MBR_SIZE, ContentType::AUTO)
    }

    fn empty(manifest: Option<Manifest>) -> Self {
        Self {
            manifest,
            softdevice: None,
            bootloader: None,
            system: None,
            application: None,
            system_init: None,
            application_init: None,
            softdevice_size: 0,
            bootloader_size: 0,
            application_size: 0,
            content_type: ContentType::AUTO,
            current: None,
            bytes_read_from_current: 0,
            bytes_read: 0,
            crc32: crc32fast::Hasher::new(),
            marked: None,
            bytes_read_from_marked: 0,
            started: false,
        }
    }

    fn select_from_manifest(
        &mut self,
        manifest: &Manifest,
        mut entries: HashMap<String, Vec<u8>>,
        types: ContentType,
    ) -> DfuResult<()> {
        let wants = |bits: ContentType| types.is_auto() || types.intersects(bits);
        let mut valid = false;

        if let Some(info) = manifest.application_info() {
            if wants(ContentType::APPLICATION) {
                let bytes = take_file(&mut entries, &info.bin_file)?;
                self.application_size = bytes.len();
                self.application = Some(FirmwareImage::new(ImageKind::Application, bytes));
                self.application_init = take_init(&mut entries, info)?;
                valid = true;
            }
        }

        if let Some(info) = &manifest.bootloader {
            if wants(ContentType::BOOTLOADER) {
                let bytes = take_file(&mut entries, &info.bin_file)?;
                self.bootloader_size = bytes.len();
                self.bootloader = Some(FirmwareImage::new(ImageKind::Bootloader, bytes));
                self.system_init = take_init(&mut entries, info)?;
                valid = true;
            }
        }

        if let Some(info) = &manifest.softdevice {
            if wants(ContentType::SOFT_DEVICE) {
                let bytes = take_file(&mut entries, &info.bin_file)?;
                self.softdevice_size = bytes.len();
                self.softdevice = Some(FirmwareImage::new(ImageKind::SoftDevice, bytes));
                if let Some(init) = take_init(&mut entries, info)? {
                    self.system_init = Some(init);
                }
                valid = true;
            }
        }

        if let Some(system) = &manifest.softdevice_bootloader {
            if types.is_auto() || types.contains(ContentType::SYSTEM) {
                if self.softdevice.is_some() || self.bootloader.is_some() {
                    return Err(DfuError::InvalidManifest {
                        reason: "softdevice_bootloader may not be used together with softdevice or bootloader"
                            .into(),
                    });
                }
                let bytes = take_file(&mut entries, &system.file.bin_file)?;
                let sizes = system.info_read_only_metadata.unwrap_or_default();
                self.softdevice_size = sizes.sd_size as usize;
                self.bootloader_size = sizes.bl_size as usize;
                self.system = Some(FirmwareImage::new(ImageKind::SoftDeviceAndBootloader, bytes));
                self.system_init = take_init(&mut entries, &system.file)?;
                valid = true;
            }
        }

        if !valid {
            return Err(DfuError::InvalidManifest {
                reason: "manifest must specify at least one file".into(),
            });
        }
        Ok(())
    }

    fn select_compat(
        &mut self,
        mut entries: HashMap<String, Vec<u8>>,
        types: ContentType,
    ) -> DfuResult<()> {
        let wants = |bits: ContentType| types.is_auto() || types.intersects(bits);

        if wants(ContentType::APPLICATION) {
            if let Some(bytes) = take_either(&mut entries, APPLICATION_HEX, APPLICATION_BIN) {
                self.application_size = bytes.len();
                self.application = Some(FirmwareImage::new(ImageKind::Application, bytes));
                self.application_init = entries
                    .remove(APPLICATION_INIT)
                    .map(|init| InitMetadata::new(init, None));
            }
        }

        let system_init = entries.remove(SYSTEM_INIT);

        if wants(ContentType::BOOTLOADER) {
            if let Some(bytes) = take_either(&mut entries, BOOTLOADER_HEX, BOOTLOADER_BIN) {
                self.bootloader_size = bytes.len();
                self.bootloader = Some(FirmwareImage::new(ImageKind::Bootloader, bytes));
            }
        }

        if wants(ContentType::SOFT_DEVICE) {
            if let Some(bytes) = take_either(&mut entries, SOFTDEVICE_HEX, SOFTDEVICE_BIN) {
                self.softdevice_size = bytes.len();
                self.softdevice = Some(FirmwareImage::new(ImageKind::SoftDevice, bytes));
            }
        }

        if self.softdevice.is_some() || self.bootloader.is_some() {
            self.system_init = system_init.map(|init| InitMetadata::new(init, None));
        }

        if self.application.is_none() && self.softdevice.is_none() && self.bootloader.is_none()
        {
            return Err(DfuError::NoFirmware);
        }
        Ok(())
    }

    fn check_alignment(&self) -> DfuResult<()> {
        let images = [
            &self.softdevice,
            &self.bootloader,
            &self.system,
            &self.application,
        ];
        for image in images.into_iter().flatten() {
            if image.size() % 4 != 0 {
                return Err(DfuError::InvalidImageSize {
                    image: image.kind,
                    size: image.size(),
                });
            }
        }
        Ok(())
    }

    /// Content available in the package.
    fn present_content(&self) -> ContentType {
        let mut content = ContentType::AUTO;
        if self.system.is_some() {
            content = content | ContentType::SYSTEM;
        }
        if self.softdevice_size > 0 {
            content = content | ContentType::SOFT_DEVICE;
        }
        if self.bootloader_size > 0 {
            content = content | ContentType::BOOTLOADER;
        }
        if self.application_size > 0 {
            content = content | ContentType::APPLICATION;
        }
        content
    }

    fn source_bytes(&self, source: Source) -> &[u8] {
        let image = match source {
            Source::SoftDevice => &self.softdevice,
            Source::Bootloader => &self.bootloader,
            Source::System => &self.system,
            Source::Application => &self.application,
        };
        image.as_ref().map(|i| i.bytes()).unwrap_or(&[])
    }

    /// Sources included by `mask`, in transfer order.
    fn active_sources(&self, mask: ContentType) -> Vec<Source> {
        let mut sources = Vec::with_capacity(3);
        if self.system.is_some() && mask.intersects(ContentType::SYSTEM) {
            sources.push(Source::System);
        } else {
            if self.softdevice.is_some() && mask.intersects(ContentType::SOFT_DEVICE) {
                sources.push(Source::SoftDevice);
            }
            if self.bootloader.is_some() && mask.intersects(ContentType::BOOTLOADER) {
                sources.push(Source::Bootloader);
            }
        }
        if self.application.is_some() && mask.intersects(ContentType::APPLICATION) {
            sources.push(Source::Application);
        }
        sources
    }

    fn first_source(&self, mask: ContentType) -> Option<Source> {
        self.active_sources(mask).first().copied()
    }

    // ------------------------------------------------------------------------
    // Public accessors
    // ------------------------------------------------------------------------

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// True when the manifest uses a combined `*_application` role.
    pub fn is_secure_dfu_required(&self) -> bool {
        self.manifest
            .as_ref()
            .map(|m| m.is_secure_dfu_required())
            .unwrap_or(false)
    }

    /// Content selected for transfer.
    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    /// Images selected for transfer, in transfer order.
    pub fn images(&self) -> Vec<&FirmwareImage> {
        self.active_sources(self.content_type)
            .into_iter()
            .filter_map(|source| match source {
                Source::SoftDevice => self.softdevice.as_ref(),
                Source::Bootloader => self.bootloader.as_ref(),
                Source::System => self.system.as_ref(),
                Source::Application => self.application.as_ref(),
            })
            .collect()
    }

    pub fn softdevice_image_size(&self) -> usize {
        if self.content_type.intersects(ContentType::SOFT_DEVICE) {
            self.softdevice_size
        } else {
            0
        }
    }

    pub fn bootloader_image_size(&self) -> usize {
        if self.content_type.intersects(ContentType::BOOTLOADER) {
            self.bootloader_size
        } else {
            0
        }
    }

    pub fn application_image_size(&self) -> usize {
        if self.content_type.intersects(ContentType::APPLICATION) {
            self.application_size
        } else {
            0
        }
    }

    /// Total bytes of the selected images.
    ///
    /// A combined SoftDevice+Bootloader image without size metadata (Secure
    /// DFU packages) counts with its binary length.
    pub fn total_size(&self) -> usize {
        self.active_sources(self.content_type)
            .into_iter()
            .map(|source| self.source_bytes(source).len())
            .sum()
    }

    /// Bytes left to read.
    pub fn available(&self) -> usize {
        self.total_size().saturating_sub(self.bytes_read)
    }

    pub fn system_init(&self) -> Option<&InitMetadata> {
        self.system_init.as_ref()
    }

    pub fn application_init(&self) -> Option<&InitMetadata> {
        self.application_init.as_ref()
    }

    /// Init packet matching the selected content.
    pub fn init_packet(&self) -> Option<&InitMetadata> {
        if self.content_type.intersects(ContentType::SYSTEM) {
            self.system_init.as_ref()
        } else {
            self.application_init.as_ref()
        }
    }

    /// Kind reported for the current part.
    pub fn part_kind(&self) -> ImageKind {
        let content = self.content_type;
        if self.system.is_some() && content.intersects(ContentType::SYSTEM) {
            ImageKind::SoftDeviceAndBootloader
        } else if content.contains(ContentType::SOFT_DEVICE) {
            ImageKind::SoftDevice
        } else if content.contains(ContentType::BOOTLOADER) {
            ImageKind::Bootloader
        } else {
            ImageKind::Application
        }
    }

    // ------------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------------

    /// Narrow the selection to `types` ∩ present content.
    ///
    /// Only allowed before the first byte is read. Returns the effective type.
    pub fn set_content_type(&mut self, types: ContentType) -> DfuResult<ContentType> {
        if self.started {
            return Err(DfuError::InvalidState {
                reason: "content type cannot change after reading has started".into(),
            });
        }

        let present = self.present_content();
        let mut content = if types.is_auto() {
            present
        } else {
            types.intersection(present)
        };

        // A combined SD+BL image cannot be split
        if self.system.is_some() && !content.contains(ContentType::SYSTEM) {
            content = content.without(ContentType::SYSTEM);
        }

        if content.is_empty() {
            return Err(DfuError::NoFirmware);
        }

        self.content_type = content;
        self.current = self.first_source(content);
        self.bytes_read_from_current = 0;
        self.mark();
        self.reset();
        Ok(content)
    }

    /// Copy with the read position cleared and the full selection restored.
    pub fn reopen(&self) -> Self {
        let mut copy = self.clone();
        copy.started = false;
        copy.content_type = copy.present_content();
        copy.current = copy.first_source(copy.content_type);
        copy.bytes_read_from_current = 0;
        copy.mark();
        copy.reset();
        copy
    }

    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    /// CRC32 over every byte read so far.
    pub fn crc32(&self) -> u32 {
        self.crc32.clone().finalize()
    }

    /// Remember the current position.
    pub fn mark(&mut self) {
        self.marked = self.current;
        self.bytes_read_from_marked = self.bytes_read_from_current;
    }

    /// Return to the last mark, restoring the byte count and CRC32.
    pub fn reset(&mut self) {
        self.current = self.marked;
        self.bytes_read_from_current = self.bytes_read_from_marked;

        let mut crc = crc32fast::Hasher::new();
        let mut read = 0usize;
        if let Some(current) = self.current {
            for source in self.active_sources(self.content_type) {
                if source == current {
                    break;
                }
                let bytes = self.source_bytes(source);
                crc.update(bytes);
                read += bytes.len();
            }
            let offset = self.bytes_read_from_current;
            crc.update(&self.source_bytes(current)[..offset]);
            read += offset;
        }
        self.crc32 = crc;
        self.bytes_read = read;
    }

    /// Go back to the first byte of the first selected image.
    pub fn full_reset(&mut self) {
        self.current = self.first_source(self.content_type);
        self.bytes_read_from_current = 0;
        self.mark();
        self.reset();
    }

    fn start_next_source(&mut self) -> Option<Source> {
        let sources = self.active_sources(self.content_type);
        let next = self
            .current
            .and_then(|current| sources.iter().position(|s| *s == current))
            .and_then(|index| sources.get(index + 1).copied());
        self.current = next;
        self.bytes_read_from_current = 0;
        next
    }

    fn raw_read(&mut self, buf: &mut [u8]) -> usize {
        let Some(current) = self.current else {
            return 0;
        };
        let offset = self.bytes_read_from_current;
        let source = self.source_bytes(current);
        let size = buf.len().min(source.len() - offset);
        buf[..size].copy_from_slice(&source[offset..offset + size]);
        self.crc32.update(&buf[..size]);
        self.bytes_read_from_current += size;
        self.bytes_read += size;
        size
    }
}

impl Read for FirmwarePackage {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let size = self.raw_read(&mut buf[total..]);
            total += size;
            if total < buf.len() && self.start_next_source().is_none() {
                break;
            }
        }
        if total > 0 {
            self.started = true;
        }
        Ok(total)
    }
}

/// Read every entry, converting HEX files and extracting the manifest.
fn read_entries(
    data: &[u8],
    mbr_size: u32,
) -> DfuResult<(HashMap<String, Vec<u8>>, Option<Manifest>)> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))?;
    let mut entries = HashMap::new();
    let mut manifest_data = None;

    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        let name = file.name().to_string();

        if file.enclosed_name().is_none() {
            return Err(DfuError::PathTraversal { path: name });
        }
        if file.is_dir() {
            warn!(entry = %name, "Directory found in the firmware package, skipping");
            continue;
        }

        let mut source = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut source)?;

        if name.to_lowercase().ends_with("hex") {
            source = hex_to_bin(&source, mbr_size)?;
        }

        if name == MANIFEST {
            manifest_data = Some(source);
        } else {
            entries.insert(name, source);
        }
    }

    if entries.is_empty() {
        return Err(DfuError::NoFirmware);
    }

    let manifest = match manifest_data {
        Some(bytes) => {
            let file: ManifestFile = serde_json::from_slice(&bytes)?;
            if file.manifest.is_none() {
                warn!("manifest.json has no 'manifest' object, using file name conventions");
            }
            file.manifest
        }
        None => {
            debug!("Manifest not found in the package, using file name conventions");
            None
        }
    };

    Ok((entries, manifest))
}

fn take_file(entries: &mut HashMap<String, Vec<u8>>, name: &str) -> DfuResult<Vec<u8>> {
    entries.remove(name).ok_or_else(|| DfuError::MissingFile {
        filename: name.to_string(),
    })
}

fn take_either(entries: &mut HashMap<String, Vec<u8>>, first: &str, second: &str) -> Option<Vec<u8>> {
    entries.remove(first).or_else(|| entries.remove(second))
}

fn take_init(
    entries: &mut HashMap<String, Vec<u8>>,
    info: &FileInfo,
) -> DfuResult<Option<InitMetadata>> {
    let declared = match &info.init_packet_data {
        Some(data) => ImageDigest::from_init_packet_data(data)?,
        None => None,
    };
    match &info.dat_file {
        Some(name) => Ok(Some(InitMetadata::new(take_file(entries, name)?, declared))),
        None => Ok(None),
    }
}
