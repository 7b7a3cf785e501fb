use std::io::{Cursor, Write};

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::dfu::FirmwarePackage;

/// Builder for Intel HEX text.
pub struct HexBuilder {
    lines: Vec<String>,
}

impl HexBuilder {
    pub fn new() -> Self {
        Self { lines: Vec::new() }
    }

    /// Data record at a 16-bit offset.
    pub fn data(mut self, address: u16, bytes: &[u8]) -> Self {
        self.lines.push(Self::record(address, 0x00, bytes));
        self
    }

    /// Extended linear address record (upper 16 bits).
    pub fn extended_linear(mut self, upper: u16) -> Self {
        self.lines
            .push(Self::record(0x0000, 0x04, &upper.to_be_bytes()));
        self
    }

    /// Extended segment address record (segment << 4).
    pub fn extended_segment(mut self, segment: u16) -> Self {
        self.lines
            .push(Self::record(0x0000, 0x02, &segment.to_be_bytes()));
        self
    }

    pub fn eof(mut self) -> Self {
        self.lines.push(Self::record(0x0000, 0x01, &[]));
        self
    }

    pub fn build(self) -> String {
        let mut text = self.lines.join("\n");
        text.push('\n');
        text
    }

    /// One `:LLAAAATT<data>CC` line with a valid checksum.
    pub fn record(address: u16, record_type: u8, data: &[u8]) -> String {
        let [hi, lo] = address.to_be_bytes();
        let mut sum = (data.len() as u8)
            .wrapping_add(hi)
            .wrapping_add(lo)
            .wrapping_add(record_type);
        for byte in data {
            sum = sum.wrapping_add(*byte);
        }
        let checksum = sum.wrapping_neg();
        format!(
            ":{:02X}{:04X}{:02X}{}{:02X}",
            data.len(),
            address,
            record_type,
            hex::encode_upper(data),
            checksum
        )
    }
}

impl Default for HexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

enum Entry {
    File(String, Vec<u8>),
    Directory(String),
}

/// Builder for firmware distribution ZIPs.
pub struct PackageBuilder {
    entries: Vec<Entry>,
}

impl PackageBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Manifest-described application with an optional init packet.
    pub fn application(self, bin_file: &str, bytes: &[u8], dat: Option<(&str, &[u8])>) -> Self {
        let mut info = serde_json::json!({ "bin_file": bin_file });
        if let Some((dat_file, _)) = dat {
            info["dat_file"] = serde_json::Value::from(dat_file);
        }
        let manifest = serde_json::json!({ "manifest": { "application": info } });

        let mut builder = self
            .manifest(&manifest.to_string())
            .file(bin_file, bytes);
        if let Some((dat_file, init)) = dat {
            builder = builder.file(dat_file, init);
        }
        builder
    }

    /// File found by its fixed name, without a manifest.
    pub fn compat_file(self, name: &str, bytes: &[u8]) -> Self {
        self.file(name, bytes)
    }

    pub fn manifest(self, json: &str) -> Self {
        self.file("manifest.json", json.as_bytes())
    }

    pub fn file(mut self, name: &str, bytes: &[u8]) -> Self {
        self.entries.push(Entry::File(name.to_string(), bytes.to_vec()));
        self
    }

    pub fn directory(mut self, name: &str) -> Self {
        self.entries.push(Entry::Directory(name.to_string()));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);
        for entry in self.entries {
            match entry {
                Entry::File(name, bytes) => {
                    zip.start_file(name, options).expect("Failed to start zip entry");
                    zip.write_all(&bytes).expect("Failed to write zip entry");
                }
                Entry::Directory(name) => {
                    zip.add_directory(name, options)
                        .expect("Failed to add zip directory");
                }
            }
        }
        zip.finish().expect("Failed to finish zip").into_inner()
    }
}

impl Default for PackageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Package holding `application.bin` and, if given, `application.dat`.
pub fn application_package(image: &[u8], init: Option<&[u8]>) -> FirmwarePackage {
    let mut builder = PackageBuilder::new().compat_file("application.bin", image);
    if let Some(init) = init {
        builder = builder.compat_file("application.dat", init);
    }
    FirmwarePackage::from_bytes_auto(&builder.build()).expect("Failed to parse test package")
}

/// Deterministic image bytes without a short period.
pub fn firmware_bytes(len: usize) -> Vec<u8> {
    assert_eq!(len % 4, 0, "firmware images are word aligned");
    (0..len)
        .map(|i| ((i * 31) ^ (i >> 8) ^ 0x5A) as u8)
        .collect()
}

/// Basic Legacy init packet for one SoftDevice ending with `crc16`.
pub fn legacy_init_packet(crc16: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(14);
    packet.extend_from_slice(&0xFFFFu16.to_le_bytes()); // device type
    packet.extend_from_slice(&0xFFFFu16.to_le_bytes()); // device revision
    packet.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // application version
    packet.extend_from_slice(&1u16.to_le_bytes());
    packet.extend_from_slice(&0xFFFEu16.to_le_bytes());
    packet.extend_from_slice(&crc16.to_le_bytes());
    packet
}
