//! Synthetic resource archives wrapped in real executables.
#![allow(dead_code)]

use flate2::write::ZlibEncoder;
use fwextract_core::payload::ihex::{self, FlatImage};
use fwextract_core::tree::{encode_name, FLAG_COMPRESSED, FLAG_DIRECTORY};
use object::write::{Object, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope};
use std::collections::{HashMap, VecDeque};
use std::io::Write;

/// Fat header `cputype` values
pub const CPU_TYPE_X86_64: u32 = object::macho::CPU_TYPE_X86_64;
pub const CPU_TYPE_ARM64: u32 = object::macho::CPU_TYPE_ARM64;

enum Node {
    Dir(String, Vec<Node>),
    File(String, Vec<u8>, u16),
}

impl Node {
    fn name(&self) -> &str {
        match self {
            Node::Dir(name, _) | Node::File(name, _, _) => name,
        }
    }
}

/// Encoded tree, name and data tables
#[derive(Debug, Clone)]
pub struct Tables {
    pub tree: Vec<u8>,
    pub names: Vec<u8>,
    pub data: Vec<u8>,
}

/// Relative placement of the tables inside a constant-data blob
#[derive(Debug, Clone, Copy)]
pub enum Placement {
    /// names | tree | data
    DataLast,
    /// data | names | tree, the resource compiler's emission order
    DataFirst,
}

impl Tables {
    /// The three tables surrounded by unrelated constant data
    pub fn blob(&self, placement: Placement) -> Vec<u8> {
        let mut blob = b"\x00\x00\x00\x00unrelated constant data\x00".to_vec();
        let parts: [&[u8]; 3] = match placement {
            Placement::DataLast => [&self.names, &self.tree, &self.data],
            Placement::DataFirst => [&self.data, &self.names, &self.tree],
        };
        for part in parts {
            blob.extend_from_slice(part);
        }
        blob.extend_from_slice(&[0xEE; 32]);
        blob
    }
}

/// Builds a resource archive from `path -> payload` entries
pub struct ResourceBuilder {
    root: Vec<Node>,
    timestamps: bool,
}

impl Default for ResourceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceBuilder {
    pub fn new() -> Self {
        Self {
            root: Vec::new(),
            timestamps: false,
        }
    }

    /// Use the 22-byte record layout with modification times
    pub fn with_timestamps(mut self) -> Self {
        self.timestamps = true;
        self
    }

    /// Adds an uncompressed file
    pub fn file(self, path: &str, payload: &[u8]) -> Self {
        self.raw_file(path, payload.to_vec(), 0)
    }

    /// Adds a file stored with the size-prefixed zlib framing
    pub fn compressed_file(self, path: &str, payload: &[u8]) -> Self {
        self.raw_file(path, qcompress(payload), FLAG_COMPRESSED)
    }

    /// Adds a file with explicit stored bytes and flags
    pub fn raw_file(mut self, path: &str, stored: Vec<u8>, flags: u16) -> Self {
        let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let file_name = parts.pop().expect("path has a file name");

        let mut level = &mut self.root;
        for part in parts {
            let position = match level.iter().position(|n| matches!(n, Node::Dir(name, _) if name == part)) {
                Some(position) => position,
                None => {
                    level.push(Node::Dir(part.to_string(), Vec::new()));
                    level.len() - 1
                }
            };
            level = match &mut level[position] {
                Node::Dir(_, children) => children,
                Node::File(..) => panic!("{part} is a file"),
            };
        }
        level.push(Node::File(file_name.to_string(), stored, flags));
        self
    }

    pub fn build(&self) -> Tables {
        let mut names = Vec::new();
        let mut name_offsets: HashMap<String, u32> = HashMap::new();
        let mut name_offset = |name: &str, names: &mut Vec<u8>| -> u32 {
            *name_offsets.entry(name.to_string()).or_insert_with(|| {
                let offset = names.len() as u32;
                names.extend(encode_name(name));
                offset
            })
        };

        let mut data = Vec::new();
        let mut records: Vec<Vec<u8>> = vec![Vec::new()];
        records[0] = self.dir_record(0, self.root.len() as u32, 1);

        let mut queue: VecDeque<(usize, &Node)> = VecDeque::new();
        for (i, child) in self.root.iter().enumerate() {
            records.push(Vec::new());
            queue.push_back((1 + i, child));
        }

        while let Some((index, node)) = queue.pop_front() {
            let name = name_offset(node.name(), &mut names);
            records[index] = match node {
                Node::Dir(_, children) => {
                    let first = records.len();
                    for (i, child) in children.iter().enumerate() {
                        records.push(Vec::new());
                        queue.push_back((first + i, child));
                    }
                    self.dir_record(name, children.len() as u32, first as u32)
                }
                Node::File(_, stored, flags) => {
                    let offset = data.len() as u32;
                    data.extend_from_slice(&(stored.len() as u32).to_be_bytes());
                    data.extend_from_slice(stored);
                    self.file_record(name, *flags, offset)
                }
            };
        }

        Tables {
            tree: records.concat(),
            names,
            data,
        }
    }

    fn dir_record(&self, name_offset: u32, count: u32, first: u32) -> Vec<u8> {
        let mut rec = name_offset.to_be_bytes().to_vec();
        rec.extend_from_slice(&FLAG_DIRECTORY.to_be_bytes());
        rec.extend_from_slice(&count.to_be_bytes());
        rec.extend_from_slice(&first.to_be_bytes());
        if self.timestamps {
            rec.extend_from_slice(&0u64.to_be_bytes());
        }
        rec
    }

    fn file_record(&self, name_offset: u32, flags: u16, data_offset: u32) -> Vec<u8> {
        let mut rec = name_offset.to_be_bytes().to_vec();
        rec.extend_from_slice(&flags.to_be_bytes());
        rec.extend_from_slice(&0u16.to_be_bytes());
        rec.extend_from_slice(&1u16.to_be_bytes());
        rec.extend_from_slice(&data_offset.to_be_bytes());
        if self.timestamps {
            rec.extend_from_slice(&1_700_000_000_000u64.to_be_bytes());
        }
        rec
    }
}

/// Size-prefixed zlib stream
pub fn qcompress(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::best());
    encoder.write_all(bytes).unwrap();
    let mut out = (bytes.len() as u32).to_be_bytes().to_vec();
    out.extend(encoder.finish().unwrap());
    out
}

/// Hex text for `bytes` loaded at address 0
pub fn hex(bytes: &[u8]) -> Vec<u8> {
    ihex::encode(&FlatImage {
        base_address: 0,
        data: bytes.to_vec(),
    })
    .into_bytes()
}

/// Deterministic pseudo-firmware
pub fn firmware(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// A firmware-like archive: four MCU images and two FPGA bitstreams.
///
/// The first five data entries exceed the scanner's default blob minimum.
pub fn kingst_archive() -> ResourceBuilder {
    ResourceBuilder::new()
        .file("fwusb/fw01A1.hex", &hex(&firmware(1, 96)))
        .file("fwusb/fw01A2.hex", &hex(&firmware(2, 96)))
        .file("fwusb/fw01A3.hex", &hex(&firmware(3, 96)))
        .file("fwusb/fw01A4.hex", &hex(&firmware(4, 96)))
        .file("fwfpga/LA2016A", &bitstream(0xA1, 256))
        .compressed_file("fwfpga/LA1016A", &bitstream(0xB1, 256))
        .file("translations/en.qm", &[0x3C; 120])
}

/// Opaque FPGA-like bytes that never start with ':'
pub fn bitstream(seed: u8, len: usize) -> Vec<u8> {
    let mut out = vec![0xFF, 0xFF, 0xFF, 0xFF, 0xAA, 0x99, 0x55, 0x66];
    out.extend(firmware(seed, len - out.len()));
    out
}

fn data_symbol(obj: &mut Object<'_>, name: &str, section: object::write::SectionId, bytes: &[u8]) -> object::write::SymbolId {
    aligned_data_symbol(obj, name, section, bytes, 1)
}

fn aligned_data_symbol(
    obj: &mut Object<'_>,
    name: &str,
    section: object::write::SectionId,
    bytes: &[u8],
    align: u64,
) -> object::write::SymbolId {
    let symbol = obj.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value: 0,
        size: 0,
        kind: SymbolKind::Data,
        scope: SymbolScope::Compilation,
        weak: false,
        section: SymbolSection::Undefined,
        flags: SymbolFlags::None,
    });
    obj.add_symbol_data(symbol, section, bytes, align);
    symbol
}

/// ELF object whose `.rodata` holds the tables behind mangled resource symbols
pub fn elf_with_symbols(tables: &Tables, sized: bool) -> Vec<u8> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let rodata = obj.add_section(Vec::new(), b".rodata".to_vec(), SectionKind::ReadOnlyData);
    obj.append_section_data(rodata, b"unrelated constant data\0", 1);

    let symbols = [
        data_symbol(&mut obj, "_ZL16qt_resource_data", rodata, &tables.data),
        data_symbol(&mut obj, "_ZL16qt_resource_name", rodata, &tables.names),
        data_symbol(&mut obj, "_ZL18qt_resource_struct", rodata, &tables.tree),
    ];
    if !sized {
        for symbol in symbols {
            obj.symbol_mut(symbol).size = 0;
        }
    }
    obj.write().unwrap()
}

/// ELF object whose unsized resource symbols each start on an `align`
/// boundary, followed by an unrelated constant. Every table's inferred size
/// then includes the padding before the next symbol.
pub fn elf_with_padded_symbols(tables: &Tables, align: u64) -> Vec<u8> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let rodata = obj.add_section(Vec::new(), b".rodata".to_vec(), SectionKind::ReadOnlyData);
    obj.append_section_data(rodata, b"unrelated constant data\0", 1);

    let symbols = [
        aligned_data_symbol(&mut obj, "_ZL16qt_resource_data", rodata, &tables.data, align),
        aligned_data_symbol(&mut obj, "_ZL16qt_resource_name", rodata, &tables.names, align),
        aligned_data_symbol(&mut obj, "_ZL18qt_resource_struct", rodata, &tables.tree, align),
    ];
    for symbol in symbols {
        obj.symbol_mut(symbol).size = 0;
    }
    aligned_data_symbol(&mut obj, "_ZL12version_info", rodata, b"1.0.0\0", align);
    obj.write().unwrap()
}

/// ELF object without symbols; the tables sit anonymously in `.rodata`
pub fn stripped_elf(tables: &Tables, placement: Placement) -> Vec<u8> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let rodata = obj.add_section(Vec::new(), b".rodata".to_vec(), SectionKind::ReadOnlyData);
    obj.append_section_data(rodata, &tables.blob(placement), 16);
    obj.write().unwrap()
}

/// Thin Mach-O object with the tables in `__TEXT,__const`
pub fn macho(architecture: Architecture, tables: &Tables, placement: Placement) -> Vec<u8> {
    let mut obj = Object::new(BinaryFormat::MachO, architecture, Endianness::Little);
    let text = obj.add_section(b"__TEXT".to_vec(), b"__text".to_vec(), SectionKind::Text);
    obj.append_section_data(text, &[0xC3], 1);
    let konst = obj.add_section(b"__TEXT".to_vec(), b"__const".to_vec(), SectionKind::ReadOnlyData);
    obj.append_section_data(konst, &tables.blob(placement), 16);
    obj.write().unwrap()
}

/// Fat Mach-O wrapping `slices`, each aligned to 4 KiB
pub fn fat(slices: &[(u32, Vec<u8>)]) -> Vec<u8> {
    const ALIGN: usize = 0x1000;
    let mut out = Vec::new();
    out.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
    out.extend_from_slice(&(slices.len() as u32).to_be_bytes());

    let mut offset = ALIGN;
    let mut placed = Vec::new();
    for (cputype, bytes) in slices {
        out.extend_from_slice(&cputype.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&(offset as u32).to_be_bytes());
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&12u32.to_be_bytes());
        placed.push((offset, bytes));
        offset = (offset + bytes.len()).next_multiple_of(ALIGN);
    }

    for (at, bytes) in placed {
        out.resize(at, 0);
        out.extend_from_slice(bytes);
    }
    out
}
