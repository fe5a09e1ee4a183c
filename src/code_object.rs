// This module turns the native object file produced by the code emitter into a heap
// code object: a single contiguous, position-independent byte blob that the runtime
// can place directly in its garbage-collected heap and execute, bypassing the system
// object loader. Construction parses the object file, selects the sections to retain
// (all text sections, plus data sections a target-specific predicate accepts, such as
// the constant pools that position-independent code addresses relative to the code),
// lays the survivors out at monotonically increasing aligned offsets, and normalizes
// every relocation into a format-agnostic (type, address, value) triple where the
// address is relative to the start of the final blob. For ELF the value follows the
// S + A - P rule against the assigned section offsets; for Mach-O it is the symbol
// value minus the patch address (minus 4 on x86-64, where the displacement is
// relative to the end of the instruction). Relocations that reference excluded
// sections or undefined symbols are hard errors at construction, so a successfully
// built code object is guaranteed self-contained. getCode copies the section bytes
// into caller-supplied memory and applies the patches; patching is deterministic and
// idempotent. Patch widths and encodings are the only architecture-specific part and
// live in the per-(format x architecture) patcher.

//! Construction of heap-loadable code objects from native object files.

use std::cell::Cell;

use hashbrown::HashMap;
use log::debug;
use object::{
    Architecture, BinaryFormat, Object, ObjectSection, ObjectSymbol, RelocationFlags,
    RelocationTarget, SectionIndex, SectionKind, SymbolSection,
};

use crate::error::CodeObjectError;
use crate::target::TargetInfo;

/// A relocation record normalized away from the source object-file format.
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    /// Format- and architecture-specific relocation type code.
    pub ty: u32,
    /// Patch address relative to the start of the code object.
    pub addr: u64,
    /// The computed value of the relocation.
    pub value: i64,
}

/// One section retained in the code object.
#[derive(Debug)]
pub struct Section {
    name: String,
    /// Assigned offset within the code object.
    offset: u64,
    data: Vec<u8>,
    relocs: Vec<Relocation>,
}

impl Section {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocs
    }
}

/// An in-memory heap code object: a size plus a procedure that copies the
/// patched bytes into caller-supplied memory.
pub struct CodeObject {
    patcher: Patcher,
    szb: usize,
    sects: Vec<Section>,
    /// Cache of the last `find_section` hit.
    last: Cell<Option<usize>>,
}

impl CodeObject {
    /// Build a code object from the bytes of a compiled native object file.
    pub fn new(target: &'static TargetInfo, bytes: &[u8]) -> Result<Self, CodeObjectError> {
        let obj = object::File::parse(bytes)?;
        let patcher = Patcher::select(obj.architecture(), obj.format())?;

        // first pass: pick the sections to keep and assign offsets
        let mut szb: u64 = 0;
        let mut offsets: HashMap<usize, u64> = HashMap::new();
        let mut kept: Vec<(SectionIndex, String, u64)> = Vec::new();
        for sect in obj.sections() {
            if !patcher.include_section(&sect) {
                continue;
            }
            let align = sect.align().max(1);
            debug_assert!(align.is_power_of_two());
            let offset = match obj.format() {
                // ELF section addresses are always zero; pack at alignment
                BinaryFormat::Elf => (szb + align - 1) & !(align - 1),
                // Mach-O assigns in-file addresses; reuse them as offsets
                _ => {
                    let addr = (sect.address() + align - 1) & !(align - 1);
                    assert!(szb <= addr, "overlapping sections");
                    addr
                }
            };
            let name = sect.name().unwrap_or("<unknown section>").to_string();
            offsets.insert(sect.index().0, offset);
            kept.push((sect.index(), name, offset));
            szb = offset + sect.size();
        }
        if szb == 0 {
            return Err(CodeObjectError::NoSections);
        }

        // second pass: copy section contents and normalize relocations, now
        // that every kept section has a final offset
        let mut sects = Vec::with_capacity(kept.len());
        for (index, name, offset) in kept {
            let sect = obj.section_by_index(index)?;
            let data = sect.data()?.to_vec();
            let mut relocs = Vec::new();
            for (reloc_off, reloc) in sect.relocations() {
                let addr = offset + reloc_off;
                let ty = match reloc.flags() {
                    RelocationFlags::Elf { r_type } => r_type,
                    RelocationFlags::MachO { r_type, .. } => u32::from(r_type),
                    other => {
                        return Err(CodeObjectError::UnsupportedRelocation {
                            name: format!("{other:?}"),
                            ty: 0,
                            addr,
                        })
                    }
                };
                if !patcher.supports(ty) {
                    return Err(CodeObjectError::UnsupportedRelocation {
                        name: patcher.reloc_type_name(ty).to_string(),
                        ty: u64::from(ty),
                        addr,
                    });
                }
                let value = normalize_value(&obj, &patcher, &offsets, &reloc, addr)?;
                relocs.push(Relocation { ty, addr, value });
            }
            sects.push(Section {
                name,
                offset,
                data,
                relocs,
            });
        }

        let code_obj = CodeObject {
            patcher,
            szb: szb as usize,
            sects,
            last: Cell::new(None),
        };
        debug!(
            "code object: {} sections, {} bytes (target {})",
            code_obj.sects.len(),
            code_obj.szb,
            target.name
        );
        Ok(code_obj)
    }

    /// The size of the code object in bytes.
    pub fn size(&self) -> usize {
        self.szb
    }

    /// Copy the code into the given memory while applying the relocation
    /// patches. The buffer must be at least `size()` bytes.
    pub fn get_code(&self, code: &mut [u8]) -> Result<(), CodeObjectError> {
        if code.len() < self.szb {
            return Err(CodeObjectError::BufferTooSmall {
                got: code.len(),
                need: self.szb,
            });
        }
        for sect in &self.sects {
            let base = sect.offset as usize;
            code[base..base + sect.data.len()].copy_from_slice(&sect.data);
        }
        // patch after all sections are in place; a patch may straddle into
        // bytes owned by a later section only if the object file is malformed
        for sect in &self.sects {
            for r in &sect.relocs {
                self.patcher.apply(r, code);
            }
        }
        Ok(())
    }

    /// Find a kept section by name.
    pub fn find_section(&self, name: &str) -> Option<&Section> {
        if let Some(i) = self.last.get() {
            if self.sects[i].name == name {
                return Some(&self.sects[i]);
            }
        }
        for (i, s) in self.sects.iter().enumerate() {
            if s.name == name {
                self.last.set(Some(i));
                return Some(s);
            }
        }
        None
    }

    /// Log a description of the code object; with `bits` set, also the
    /// patched code bytes.
    pub fn dump(&self, bits: bool) {
        debug!("=== Sections ===");
        for s in &self.sects {
            debug!(
                "  <{}> @ {:#x}..{:#x}",
                s.name,
                s.offset,
                s.offset + s.data.len() as u64
            );
            for r in &s.relocs {
                debug!(
                    "    {}: addr = {:#x}; value = {:#x}",
                    self.patcher.reloc_type_name(r.ty),
                    r.addr,
                    r.value
                );
            }
        }
        if bits {
            let mut code = vec![0u8; self.szb];
            if self.get_code(&mut code).is_ok() {
                debug!("RELOCATED CODE");
                for (i, chunk) in code.chunks(16).enumerate() {
                    let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
                    debug!("  {:04x}: {}", i * 16, hex.join(" "));
                }
            }
        }
    }
}

/// Compute the normalized relocation value.
fn normalize_value(
    obj: &object::File<'_>,
    patcher: &Patcher,
    offsets: &HashMap<usize, u64>,
    reloc: &object::Relocation,
    addr: u64,
) -> Result<i64, CodeObjectError> {
    // resolve the target to an offset within the code object
    let sym_value = match reloc.target() {
        RelocationTarget::Symbol(sym_idx) => {
            let sym = obj.symbol_by_index(sym_idx)?;
            let sect_idx = match sym.section() {
                SymbolSection::Section(idx) => idx,
                _ => {
                    return Err(CodeObjectError::UndefinedSymbol {
                        addr,
                        symbol: sym.name().unwrap_or("<unknown symbol>").to_string(),
                    })
                }
            };
            let sect_off = offsets.get(&sect_idx.0).copied().ok_or_else(|| {
                let name = obj
                    .section_by_index(sect_idx)
                    .ok()
                    .and_then(|s| s.name().ok().map(str::to_string))
                    .unwrap_or_else(|| "<unknown section>".to_string());
                CodeObjectError::ExcludedSection {
                    addr,
                    section: name,
                }
            })?;
            match obj.format() {
                // ELF symbol values are section-relative in relocatable files
                BinaryFormat::Elf => sect_off + sym.address(),
                // Mach-O symbol values are in-file addresses, which coincide
                // with the code-object layout
                _ => sym.address(),
            }
        }
        RelocationTarget::Section(sect_idx) => {
            offsets.get(&sect_idx.0).copied().ok_or_else(|| {
                let name = obj
                    .section_by_index(sect_idx)
                    .ok()
                    .and_then(|s| s.name().ok().map(str::to_string))
                    .unwrap_or_else(|| "<unknown section>".to_string());
                CodeObjectError::ExcludedSection {
                    addr,
                    section: name,
                }
            })?
        }
        other => {
            return Err(CodeObjectError::UnsupportedRelocation {
                name: format!("{other:?}"),
                ty: 0,
                addr,
            })
        }
    };

    let value = match obj.format() {
        // S + A - P
        BinaryFormat::Elf => sym_value as i64 + reloc.addend() - addr as i64,
        _ => {
            let mut v = sym_value as i64 - addr as i64;
            if patcher.pc_rel_from_next_insn() {
                v -= 4;
            }
            v
        }
    };
    Ok(value)
}

/* ===== per-(format x architecture) patching ===== */

/// The format- and architecture-specific policy: which data sections to keep
/// and how to encode each relocation patch. Selected once at construction.
#[derive(Debug, Clone, Copy)]
enum Patcher {
    Amd64Elf,
    Amd64MachO,
    Arm64Elf,
    Arm64MachO,
}

impl Patcher {
    fn select(arch: Architecture, format: BinaryFormat) -> Result<Self, CodeObjectError> {
        match (arch, format) {
            (Architecture::X86_64, BinaryFormat::Elf) => Ok(Patcher::Amd64Elf),
            (Architecture::X86_64, BinaryFormat::MachO) => Ok(Patcher::Amd64MachO),
            (Architecture::Aarch64, BinaryFormat::Elf) => Ok(Patcher::Arm64Elf),
            (Architecture::Aarch64, BinaryFormat::MachO) => Ok(Patcher::Arm64MachO),
            _ => Err(CodeObjectError::UnsupportedTarget {
                arch: format!("{arch:?}"),
                format: format!("{format:?}"),
            }),
        }
    }

    /// Mach-O on x86-64 expresses PC-relative values against the end of the
    /// 4-byte displacement rather than the patch address.
    fn pc_rel_from_next_insn(self) -> bool {
        matches!(self, Patcher::Amd64MachO)
    }

    /// Keep every text section, plus the read-only data that generated code
    /// addresses relative to itself. Writable data must never land in the
    /// heap object; mutable state goes through the managed heap. Unwind and
    /// exception metadata is consumed by the system unwinder, not the
    /// runtime, and carries relocation types the patchers do not handle.
    fn include_section(self, sect: &object::Section<'_, '_>) -> bool {
        match sect.kind() {
            SectionKind::Text => true,
            SectionKind::ReadOnlyData | SectionKind::ReadOnlyString => {
                sect.size() > 0 && !is_unwind_section(sect.name().unwrap_or(""))
            }
            _ => false,
        }
    }

    fn supports(self, ty: u32) -> bool {
        use object::{elf, macho};
        match self {
            Patcher::Amd64Elf => matches!(
                ty,
                elf::R_X86_64_64 | elf::R_X86_64_PC32 | elf::R_X86_64_PLT32 | elf::R_X86_64_32
            ),
            Patcher::Arm64Elf => matches!(
                ty,
                elf::R_AARCH64_ABS64
                    | elf::R_AARCH64_ADR_PREL_LO21
                    | elf::R_AARCH64_CALL26
                    | elf::R_AARCH64_JUMP26
            ),
            Patcher::Amd64MachO => {
                ty == u32::from(macho::X86_64_RELOC_SIGNED)
                    || ty == u32::from(macho::X86_64_RELOC_BRANCH)
            }
            Patcher::Arm64MachO => {
                ty == u32::from(macho::ARM64_RELOC_BRANCH26)
                    || ty == u32::from(macho::ARM64_RELOC_UNSIGNED)
            }
        }
    }

    fn reloc_type_name(self, ty: u32) -> &'static str {
        use object::{elf, macho};
        match self {
            Patcher::Amd64Elf => match ty {
                elf::R_X86_64_64 => "R_X86_64_64",
                elf::R_X86_64_32 => "R_X86_64_32",
                elf::R_X86_64_PC32 => "R_X86_64_PC32",
                elf::R_X86_64_PLT32 => "R_X86_64_PLT32",
                _ => "<unknown reloc>",
            },
            Patcher::Arm64Elf => match ty {
                elf::R_AARCH64_ABS64 => "R_AARCH64_ABS64",
                elf::R_AARCH64_ADR_PREL_LO21 => "R_AARCH64_ADR_PREL_LO21",
                elf::R_AARCH64_CALL26 => "R_AARCH64_CALL26",
                elf::R_AARCH64_JUMP26 => "R_AARCH64_JUMP26",
                _ => "<unknown reloc>",
            },
            Patcher::Amd64MachO => match ty {
                t if t == u32::from(macho::X86_64_RELOC_SIGNED) => "X86_64_RELOC_SIGNED",
                t if t == u32::from(macho::X86_64_RELOC_BRANCH) => "X86_64_RELOC_BRANCH",
                _ => "<unknown reloc>",
            },
            Patcher::Arm64MachO => match ty {
                t if t == u32::from(macho::ARM64_RELOC_BRANCH26) => "ARM64_RELOC_BRANCH26",
                t if t == u32::from(macho::ARM64_RELOC_UNSIGNED) => "ARM64_RELOC_UNSIGNED",
                _ => "<unknown reloc>",
            },
        }
    }

    /// Apply one normalized relocation to the code buffer. Only types that
    /// passed `supports` during construction reach this point.
    fn apply(self, r: &Relocation, code: &mut [u8]) {
        use object::{elf, macho};
        let at = r.addr as usize;
        match self {
            Patcher::Amd64Elf => match r.ty {
                elf::R_X86_64_PC32 | elf::R_X86_64_PLT32 => {
                    patch_u32(code, at, r.value as u32);
                }
                elf::R_X86_64_32 => {
                    // absolute: recover S + A from the pc-relative value
                    patch_u32(code, at, (r.value + r.addr as i64) as u32);
                }
                elf::R_X86_64_64 => {
                    patch_u64(code, at, (r.value + r.addr as i64) as u64);
                }
                _ => unreachable!("unsupported relocation"),
            },
            Patcher::Arm64Elf => match r.ty {
                elf::R_AARCH64_ABS64 => {
                    patch_u64(code, at, (r.value + r.addr as i64) as u64);
                }
                elf::R_AARCH64_ADR_PREL_LO21 => {
                    patch_adr(code, at, r.value);
                }
                elf::R_AARCH64_CALL26 | elf::R_AARCH64_JUMP26 => {
                    patch_branch26(code, at, r.value);
                }
                _ => unreachable!("unsupported relocation"),
            },
            Patcher::Amd64MachO => match r.ty {
                t if t == u32::from(macho::X86_64_RELOC_SIGNED)
                    || t == u32::from(macho::X86_64_RELOC_BRANCH) =>
                {
                    patch_u32(code, at, r.value as u32);
                }
                _ => unreachable!("unsupported relocation"),
            },
            Patcher::Arm64MachO => match r.ty {
                t if t == u32::from(macho::ARM64_RELOC_BRANCH26) => {
                    patch_branch26(code, at, r.value);
                }
                t if t == u32::from(macho::ARM64_RELOC_UNSIGNED) => {
                    patch_u64(code, at, (r.value + r.addr as i64) as u64);
                }
                _ => unreachable!("unsupported relocation"),
            },
        }
    }
}

fn is_unwind_section(name: &str) -> bool {
    matches!(
        name,
        ".eh_frame"
            | ".eh_frame_hdr"
            | ".gcc_except_table"
            | "__eh_frame"
            | "__compact_unwind"
            | "__unwind_info"
            | "__gcc_except_tab"
    )
}

fn patch_u32(code: &mut [u8], at: usize, v: u32) {
    code[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn patch_u64(code: &mut [u8], at: usize, v: u64) {
    code[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

/// Patch the 21-bit immediate of an ADR instruction: the low two bits go in
/// bits 29..30 and the high 19 bits in bits 5..23.
fn patch_adr(code: &mut [u8], at: usize, value: i64) {
    let mut insn = u32::from_le_bytes(code[at..at + 4].try_into().unwrap());
    insn &= !0x60ff_ffe0;
    let imm = value as u32;
    insn |= (imm & 0x3) << 29;
    insn |= ((imm >> 2) & 0x7_ffff) << 5;
    code[at..at + 4].copy_from_slice(&insn.to_le_bytes());
}

/// Patch the 26-bit word displacement of a B or BL instruction.
fn patch_branch26(code: &mut [u8], at: usize, value: i64) {
    let mut insn = u32::from_le_bytes(code[at..at + 4].try_into().unwrap());
    insn &= !0x03ff_ffff;
    insn |= ((value >> 2) as u32) & 0x03ff_ffff;
    code[at..at + 4].copy_from_slice(&insn.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::write::{
        Object as WObject, Relocation as WRelocation, Symbol as WSymbol, SymbolSection as WSymbolSection,
    };
    use object::{elf, Endianness, SymbolFlags, SymbolKind, SymbolScope};

    fn target() -> &'static TargetInfo {
        TargetInfo::for_name("x86_64").unwrap()
    }

    /// A relocatable ELF with a 32-byte text section (align 16) and a
    /// 12-byte rodata section (align 8), plus a PC32 relocation from text
    /// offset 4 to the rodata section.
    fn sample_object(undefined_sym: bool) -> Vec<u8> {
        let mut obj = WObject::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let text = obj.add_section(vec![], b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &[0x90u8; 32], 16);
        let rodata = obj.add_section(vec![], b".rodata".to_vec(), SectionKind::ReadOnlyData);
        obj.append_section_data(rodata, &[0xabu8; 12], 8);

        let section = if undefined_sym {
            WSymbolSection::Undefined
        } else {
            WSymbolSection::Section(rodata)
        };
        let sym = obj.add_symbol(WSymbol {
            name: b"pool".to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Data,
            scope: SymbolScope::Linkage,
            weak: false,
            section,
            flags: SymbolFlags::None,
        });
        obj.add_relocation(
            text,
            WRelocation {
                offset: 4,
                symbol: sym,
                addend: -4,
                flags: RelocationFlags::Elf {
                    r_type: elf::R_X86_64_PC32,
                },
            },
        )
        .unwrap();
        obj.write().unwrap()
    }

    #[test]
    fn layout_is_aligned_and_disjoint() {
        let bytes = sample_object(false);
        let co = CodeObject::new(target(), &bytes).unwrap();

        let text = co.find_section(".text").unwrap();
        let rodata = co.find_section(".rodata").unwrap();
        assert_eq!(text.offset(), 0);
        assert_eq!(text.size(), 32);
        assert_eq!(rodata.offset() % 8, 0);
        assert!(rodata.offset() >= text.offset() + text.size() as u64);
        assert_eq!(co.size() as u64, rodata.offset() + rodata.size() as u64);
    }

    #[test]
    fn pc32_patch_points_at_pool() {
        let bytes = sample_object(false);
        let co = CodeObject::new(target(), &bytes).unwrap();
        let rodata_off = co.find_section(".rodata").unwrap().offset();

        let mut code = vec![0u8; co.size()];
        co.get_code(&mut code).unwrap();
        let disp = i32::from_le_bytes(code[4..8].try_into().unwrap());
        // S + A - P with S = rodata offset, A = -4, P = 4
        assert_eq!(i64::from(disp), rodata_off as i64 - 4 - 4);
    }

    #[test]
    fn patching_is_deterministic() {
        let bytes = sample_object(false);
        let co = CodeObject::new(target(), &bytes).unwrap();
        let mut a = vec![0u8; co.size()];
        let mut b = vec![0u8; co.size()];
        co.get_code(&mut a).unwrap();
        co.get_code(&mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unwind_sections_are_excluded() {
        // .eh_frame is read-only data but belongs to the system unwinder; it
        // must not land in the code object, and its relocation types (which
        // no patcher supports) must not fail construction
        let mut obj = WObject::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let text = obj.add_section(vec![], b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &[0x90u8; 16], 16);
        let eh = obj.add_section(vec![], b".eh_frame".to_vec(), SectionKind::ReadOnlyData);
        obj.append_section_data(eh, &[0u8; 24], 8);
        let fde = obj.add_symbol(WSymbol {
            name: b"fde".to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Data,
            scope: SymbolScope::Compilation,
            weak: false,
            section: WSymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        obj.add_relocation(
            eh,
            WRelocation {
                offset: 8,
                symbol: fde,
                addend: 0,
                flags: RelocationFlags::Elf {
                    r_type: elf::R_X86_64_PC64,
                },
            },
        )
        .unwrap();
        let bytes = obj.write().unwrap();

        let co = CodeObject::new(target(), &bytes).unwrap();
        assert!(co.find_section(".eh_frame").is_none());
        assert_eq!(co.size(), 16);
    }

    #[test]
    fn undefined_symbol_is_an_error() {
        let bytes = sample_object(true);
        let err = CodeObject::new(target(), &bytes)
            .err()
            .expect("construction must fail");
        match err {
            CodeObjectError::UndefinedSymbol { symbol, .. } => {
                assert_eq!(symbol, "pool");
            }
            other => panic!("expected undefined-symbol error, got {other:?}"),
        }
    }

    #[test]
    fn short_buffer_is_an_error() {
        let bytes = sample_object(false);
        let co = CodeObject::new(target(), &bytes).unwrap();
        let mut buf = vec![0u8; co.size() - 1];
        match co.get_code(&mut buf) {
            Err(CodeObjectError::BufferTooSmall { got, need }) => {
                assert_eq!(got, co.size() - 1);
                assert_eq!(need, co.size());
            }
            other => panic!("expected buffer-too-small error, got {other:?}"),
        }
    }
}
