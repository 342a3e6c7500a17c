//! ELF symbol tables and DWARF type extraction.
//!
//! `object` parses the binary and supplies the symbol table; `gimli` decodes
//! the DWARF type DIEs. A requested type is converted together with every
//! type it reaches (members, pointees, array elements) into one fresh
//! [`TypeTable`], which is then memoised by name.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use gimli::{
    constants, AttributeValue, DebugTypeSignature, DebuggingInformationEntry, Dwarf, EndianArcSlice, Reader, RunTimeEndian,
    SectionId, Unit, UnitOffset, UnitSectionOffset, UnitType,
};
use object::{Object, ObjectSection, ObjectSymbol};
use once_cell::unsync::OnceCell;
use tracing::{debug, trace};

use super::{DebugInfo, SymbolInfo};
use crate::context::ArchitectureContext;
use crate::error::{KscopeError, KscopeResult};
use crate::layout::{BitRange, Field, ScalarKind, Type, TypeDescriptor, TypeId, TypeKind, TypeRef, TypeTableBuilder};
use crate::types::{Address, ArchSpec, ByteOrder, TargetArch};

type OwnedReader = EndianArcSlice<RunTimeEndian>;
type OwnedDwarf = Dwarf<OwnedReader>;

const MAX_TYPE_REF_DEPTH: usize = 32;

const DWARF_SECTIONS: &[(SectionId, &str)] = &[
    (SectionId::DebugAbbrev, ".debug_abbrev"),
    (SectionId::DebugAddr, ".debug_addr"),
    (SectionId::DebugInfo, ".debug_info"),
    (SectionId::DebugLine, ".debug_line"),
    (SectionId::DebugLineStr, ".debug_line_str"),
    (SectionId::DebugRanges, ".debug_ranges"),
    (SectionId::DebugRngLists, ".debug_rnglists"),
    (SectionId::DebugStr, ".debug_str"),
    (SectionId::DebugStrOffsets, ".debug_str_offsets"),
    (SectionId::DebugTypes, ".debug_types"),
    (SectionId::DebugLoc, ".debug_loc"),
    (SectionId::DebugLocLists, ".debug_loclists"),
];

fn dwarf_error(what: &str, err: gimli::Error) -> KscopeError
{
    KscopeError::DebugInfo(format!("{what}: {err}"))
}

fn load_section_bytes(file: &object::File<'_>, name: &str) -> KscopeResult<Arc<[u8]>>
{
    let Some(section) = file.section_by_name(name) else {
        return Ok(Arc::<[u8]>::from(Vec::new()));
    };
    let data = section
        .uncompressed_data()
        .map_err(|err| KscopeError::DebugInfo(format!("failed to read {name}: {err}")))?;
    Ok(match data {
        Cow::Borrowed(bytes) => Arc::<[u8]>::from(bytes.to_vec()),
        Cow::Owned(vec) => vec.into(),
    })
}

/// Debug information read from an ELF file (vmlinux or a `.ko`)
///
/// DWARF is only decoded on the first type lookup.
pub struct DwarfDebugInfo
{
    module: String,
    spec: ArchSpec,
    endian: RunTimeEndian,
    symbols: HashMap<String, SymbolInfo>,
    debug_sections: HashMap<SectionId, Arc<[u8]>>,
    dwarf_cache: OnceCell<OwnedDwarf>,
    units_cache: OnceCell<Vec<Unit<OwnedReader>>>,
    type_cache: RefCell<HashMap<String, Type>>,
    variable_cache: RefCell<HashMap<String, Option<Type>>>,
}

impl std::fmt::Debug for DwarfDebugInfo
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("DwarfDebugInfo")
            .field("module", &self.module)
            .field("spec", &self.spec)
            .field("symbols", &self.symbols.len())
            .finish_non_exhaustive()
    }
}

impl DwarfDebugInfo
{
    /// Read and parse an ELF file; the module is named after the file stem.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::Io`] when the file cannot be read, otherwise as
    /// [`DwarfDebugInfo::from_bytes`].
    pub fn load(path: &Path) -> KscopeResult<Self>
    {
        let bytes = fs::read(path)?;
        let module = path
            .file_stem()
            .map_or_else(|| path.display().to_string(), |stem| stem.to_string_lossy().into_owned());
        Self::from_bytes(&module, &bytes)
    }

    /// Parse an in-memory ELF image.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::DebugInfo`] when the bytes are not an object file, the
    /// architecture has no layout rules, or a debug section is malformed.
    pub fn from_bytes(module: &str, bytes: &[u8]) -> KscopeResult<Self>
    {
        let file = object::File::parse(bytes)
            .map_err(|err| KscopeError::DebugInfo(format!("failed to parse {module}: {err}")))?;

        let little_endian = file.is_little_endian();
        let arch = TargetArch::from_object(file.architecture(), little_endian).ok_or_else(|| {
            KscopeError::DebugInfo(format!("{module}: unsupported architecture {:?}", file.architecture()))
        })?;
        let spec = ArchSpec {
            arch,
            pointer_size: if file.is_64() { 8 } else { 4 },
            byte_order: if little_endian { ByteOrder::Little } else { ByteOrder::Big },
        };

        let mut symbols = HashMap::new();
        for symbol in file.symbols() {
            let Ok(name) = symbol.name() else {
                continue;
            };
            if name.is_empty() || symbol.is_undefined() {
                continue;
            }
            symbols.entry(name.to_string()).or_insert_with(|| SymbolInfo {
                name: name.to_string(),
                address: Address::new(symbol.address()),
                type_name: None,
                ty: None,
                size: symbol.size(),
            });
        }

        let mut debug_sections = HashMap::new();
        for (id, name) in DWARF_SECTIONS {
            debug_sections.insert(*id, load_section_bytes(&file, name)?);
        }

        debug!(module, arch = %spec, symbols = symbols.len(), "parsed debug information");

        Ok(Self {
            module: module.to_string(),
            spec,
            endian: spec.byte_order.into(),
            symbols,
            debug_sections,
            dwarf_cache: OnceCell::new(),
            units_cache: OnceCell::new(),
            type_cache: RefCell::new(HashMap::new()),
            variable_cache: RefCell::new(HashMap::new()),
        })
    }

    fn section_reader(&self, id: SectionId) -> OwnedReader
    {
        let data = self
            .debug_sections
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Arc::<[u8]>::from(Vec::new()));
        EndianArcSlice::new(data, self.endian)
    }

    fn dwarf(&self) -> KscopeResult<&OwnedDwarf>
    {
        self.dwarf_cache.get_or_try_init(|| {
            Dwarf::load(|section| Ok::<_, gimli::Error>(self.section_reader(section)))
                .map_err(|err| dwarf_error("failed to load DWARF", err))
        })
    }

    fn units(&self) -> KscopeResult<&[Unit<OwnedReader>]>
    {
        let units = self.units_cache.get_or_try_init(|| {
            let dwarf = self.dwarf()?;
            let mut units = Vec::new();
            let mut headers = dwarf.units();
            while let Some(header) = headers
                .next()
                .map_err(|err| dwarf_error("reading .debug_info unit header", err))?
            {
                units.push(dwarf.unit(header).map_err(|err| dwarf_error("parsing compilation unit", err))?);
            }
            let mut type_headers = dwarf.type_units();
            while let Some(header) = type_headers
                .next()
                .map_err(|err| dwarf_error("reading .debug_types unit header", err))?
            {
                units.push(dwarf.unit(header).map_err(|err| dwarf_error("parsing type unit", err))?);
            }
            Ok::<_, KscopeError>(units)
        })?;
        Ok(units)
    }

    fn reader(&self) -> KscopeResult<DieReader<'_>>
    {
        Ok(DieReader {
            dwarf: self.dwarf()?,
            units: self.units()?,
            endian: self.endian,
        })
    }

    fn variable_type(&self, name: &str) -> KscopeResult<Option<Type>>
    {
        if let Some(cached) = self.variable_cache.borrow().get(name) {
            return Ok(cached.clone());
        }
        let reader = self.reader()?;
        let ty = match reader.find_variable(name)? {
            Some(variable) => match reader.type_of(variable)? {
                Some(target) => Some(TypeConverter::new(&reader, self.spec.pointer_size).convert(target)?),
                None => None,
            },
            None => None,
        };
        self.variable_cache.borrow_mut().insert(name.to_string(), ty.clone());
        Ok(ty)
    }
}

impl DebugInfo for DwarfDebugInfo
{
    fn module_name(&self) -> &str
    {
        &self.module
    }

    fn architecture(&self) -> ArchSpec
    {
        self.spec
    }

    fn resolve_symbol(&self, name: &str) -> Option<SymbolInfo>
    {
        let mut info = self.symbols.get(name)?.clone();
        match self.variable_type(name) {
            Ok(Some(ty)) => {
                info.type_name = Some(ty.name());
                info.ty = Some(ty);
            }
            Ok(None) => {}
            Err(err) => debug!(module = %self.module, symbol = name, error = %err, "no usable DWARF type for symbol"),
        }
        Some(info)
    }

    fn resolve_type(&self, name: &str, context: &ArchitectureContext) -> KscopeResult<Option<Type>>
    {
        if let Some(existing) = self.type_cache.borrow().get(name) {
            return Ok(Some(existing.clone()));
        }

        let reader = self.reader()?;
        let Some(die) = reader.find_type(name)? else {
            return Ok(None);
        };
        let ty = TypeConverter::new(&reader, context.pointer_size()).convert(die)?;
        trace!(module = %self.module, name, size = ty.size(), "converted DWARF type");
        self.type_cache.borrow_mut().insert(name.to_string(), ty.clone());
        Ok(Some(ty))
    }
}

/// Location of a DIE: unit index plus offset within that unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DieKey
{
    unit: usize,
    offset: UnitOffset<usize>,
}

/// Read-only navigation over the loaded units
struct DieReader<'a>
{
    dwarf: &'a OwnedDwarf,
    units: &'a [Unit<OwnedReader>],
    endian: RunTimeEndian,
}

impl<'a> DieReader<'a>
{
    fn unit(&self, key: DieKey) -> &'a Unit<OwnedReader>
    {
        &self.units[key.unit]
    }

    fn entry(&self, key: DieKey) -> KscopeResult<DebuggingInformationEntry<'a, 'a, OwnedReader>>
    {
        self.unit(key)
            .entry(key.offset)
            .map_err(|err| dwarf_error("resolving type reference", err))
    }

    fn attr(
        entry: &DebuggingInformationEntry<'_, '_, OwnedReader>,
        name: constants::DwAt,
    ) -> KscopeResult<Option<AttributeValue<OwnedReader>>>
    {
        entry
            .attr(name)
            .map(|attr| attr.map(|attr| attr.value()))
            .map_err(|err| dwarf_error("reading DIE attribute", err))
    }

    fn udata(entry: &DebuggingInformationEntry<'_, '_, OwnedReader>, name: constants::DwAt) -> KscopeResult<Option<u64>>
    {
        Ok(entry
            .attr(name)
            .map_err(|err| dwarf_error("reading DIE attribute", err))?
            .and_then(|attr| attr.udata_value()))
    }

    fn sdata(entry: &DebuggingInformationEntry<'_, '_, OwnedReader>, name: constants::DwAt) -> KscopeResult<Option<i64>>
    {
        Ok(entry
            .attr(name)
            .map_err(|err| dwarf_error("reading DIE attribute", err))?
            .and_then(|attr| {
                #[allow(clippy::cast_possible_wrap)]
                attr.sdata_value().or_else(|| attr.udata_value().map(|value| value as i64))
            }))
    }

    fn is_declaration(entry: &DebuggingInformationEntry<'_, '_, OwnedReader>) -> KscopeResult<bool>
    {
        Ok(matches!(
            Self::attr(entry, constants::DW_AT_declaration)?,
            Some(AttributeValue::Flag(true))
        ))
    }

    fn name(&self, key: DieKey, entry: &DebuggingInformationEntry<'_, '_, OwnedReader>) -> KscopeResult<Option<String>>
    {
        let Some(value) = Self::attr(entry, constants::DW_AT_name)? else {
            return Ok(None);
        };
        let reader = self
            .dwarf
            .attr_string(self.unit(key), value)
            .map_err(|err| dwarf_error("resolving DWARF string", err))?;
        let owned = match reader.to_string() {
            Ok(cow) => cow.into_owned(),
            Err(_) => reader
                .to_string_lossy()
                .map_err(|err| dwarf_error("decoding DWARF string", err))?
                .into_owned(),
        };
        Ok(Some(owned))
    }

    /// Full C spelling for a named type DIE.
    fn spelling(&self, key: DieKey, entry: &DebuggingInformationEntry<'_, '_, OwnedReader>) -> KscopeResult<Option<String>>
    {
        let Some(name) = self.name(key, entry)? else {
            return Ok(None);
        };
        Ok(Some(match entry.tag() {
            constants::DW_TAG_structure_type | constants::DW_TAG_class_type => format!("struct {name}"),
            constants::DW_TAG_union_type => format!("union {name}"),
            constants::DW_TAG_enumeration_type => format!("enum {name}"),
            _ => name,
        }))
    }

    /// The DIE a `DW_AT_type` attribute refers to.
    fn type_of(&self, key: DieKey) -> KscopeResult<Option<DieKey>>
    {
        let entry = self.entry(key)?;
        match Self::attr(&entry, constants::DW_AT_type)? {
            Some(AttributeValue::UnitRef(offset)) => Ok(Some(DieKey { unit: key.unit, offset })),
            Some(AttributeValue::DebugInfoRef(offset)) => Ok(self.find_unit_for_offset(UnitSectionOffset::from(offset))),
            Some(AttributeValue::DebugTypesRef(signature)) => Ok(self.find_signature(signature)),
            _ => Ok(None),
        }
    }

    fn find_unit_for_offset(&self, target: UnitSectionOffset<usize>) -> Option<DieKey>
    {
        self.units.iter().enumerate().find_map(|(index, unit)| {
            target.to_unit_offset(unit).map(|offset| DieKey { unit: index, offset })
        })
    }

    fn find_signature(&self, signature: DebugTypeSignature) -> Option<DieKey>
    {
        self.units.iter().enumerate().find_map(|(index, unit)| match unit.header.type_() {
            UnitType::Type {
                type_signature,
                type_offset,
            }
            | UnitType::SplitType {
                type_signature,
                type_offset,
            } if type_signature == signature => Some(DieKey {
                unit: index,
                offset: type_offset,
            }),
            _ => None,
        })
    }

    /// Skip typedefs and qualifiers; `None` means `void`.
    fn canonical(&self, key: DieKey) -> KscopeResult<Option<DieKey>>
    {
        let mut current = key;
        for _ in 0..MAX_TYPE_REF_DEPTH {
            let entry = self.entry(current)?;
            match entry.tag() {
                constants::DW_TAG_typedef
                | constants::DW_TAG_const_type
                | constants::DW_TAG_volatile_type
                | constants::DW_TAG_restrict_type
                | constants::DW_TAG_atomic_type => match self.type_of(current)? {
                    Some(next) => current = next,
                    None => return Ok(None),
                },
                _ => return Ok(Some(current)),
            }
        }
        Err(KscopeError::DebugInfo(format!(
            "type reference chain deeper than {MAX_TYPE_REF_DEPTH} at {:?}",
            key.offset
        )))
    }

    /// Element counts of an array DIE, outermost dimension first.
    fn dimensions(&self, key: DieKey) -> KscopeResult<Vec<Option<u64>>>
    {
        let mut dims = Vec::new();
        let mut tree = self
            .unit(key)
            .entries_tree(Some(key.offset))
            .map_err(|err| dwarf_error("building array tree", err))?;
        let root = tree.root().map_err(|err| dwarf_error("navigating array root", err))?;
        let mut children = root.children();
        while let Some(child) = children.next().map_err(|err| dwarf_error("iterating subranges", err))? {
            let entry = child.entry();
            if entry.tag() != constants::DW_TAG_subrange_type {
                continue;
            }
            let count = match Self::udata(entry, constants::DW_AT_count)? {
                Some(count) => Some(count),
                None => match Self::sdata(entry, constants::DW_AT_upper_bound)? {
                    #[allow(clippy::cast_sign_loss)]
                    Some(upper) if upper >= 0 => Some(upper as u64 + 1),
                    _ => None,
                },
            };
            dims.push(count);
        }
        if dims.is_empty() {
            dims.push(None);
        }
        Ok(dims)
    }

    /// Size and alignment of a type DIE without converting it.
    fn layout(&self, key: Option<DieKey>, pointer_size: u8, depth: usize) -> KscopeResult<(u64, u64)>
    {
        if depth >= MAX_TYPE_REF_DEPTH {
            return Err(KscopeError::DebugInfo("type nesting too deep to lay out".to_string()));
        }
        let Some(key) = key.map(|key| self.canonical(key)).transpose()?.flatten() else {
            return Ok((0, 1));
        };
        let entry = self.entry(key)?;
        let explicit_align = Self::udata(&entry, constants::DW_AT_alignment)?;
        let (size, natural) = match entry.tag() {
            constants::DW_TAG_pointer_type | constants::DW_TAG_reference_type | constants::DW_TAG_rvalue_reference_type => {
                let size = Self::udata(&entry, constants::DW_AT_byte_size)?.unwrap_or(u64::from(pointer_size));
                (size, size)
            }
            constants::DW_TAG_array_type => {
                let (elem_size, elem_align) = self.layout(self.type_of(key)?, pointer_size, depth + 1)?;
                let total = self
                    .dimensions(key)?
                    .into_iter()
                    .fold(elem_size, |acc, count| acc.saturating_mul(count.unwrap_or(0)));
                (Self::udata(&entry, constants::DW_AT_byte_size)?.unwrap_or(total), elem_align)
            }
            constants::DW_TAG_structure_type | constants::DW_TAG_class_type | constants::DW_TAG_union_type => {
                let size = Self::udata(&entry, constants::DW_AT_byte_size)?.unwrap_or(0);
                let mut align = 1;
                for member in self.members(key)? {
                    let (_, member_align) = self.layout(self.type_of(member)?, pointer_size, depth + 1)?;
                    align = align.max(member_align);
                }
                (size, align)
            }
            constants::DW_TAG_enumeration_type => {
                let size = Self::udata(&entry, constants::DW_AT_byte_size)?.unwrap_or(4);
                (size, size)
            }
            _ => {
                let size = Self::udata(&entry, constants::DW_AT_byte_size)?.unwrap_or(0);
                (size, size)
            }
        };
        Ok((size, explicit_align.unwrap_or(natural).max(1)))
    }

    /// `DW_TAG_member` children of an aggregate.
    fn members(&self, key: DieKey) -> KscopeResult<Vec<DieKey>>
    {
        let mut members = Vec::new();
        let mut tree = self
            .unit(key)
            .entries_tree(Some(key.offset))
            .map_err(|err| dwarf_error("building struct tree", err))?;
        let root = tree.root().map_err(|err| dwarf_error("navigating struct root", err))?;
        let mut children = root.children();
        while let Some(child) = children
            .next()
            .map_err(|err| dwarf_error("iterating struct children", err))?
        {
            let entry = child.entry();
            if entry.tag() == constants::DW_TAG_member {
                members.push(DieKey {
                    unit: key.unit,
                    offset: entry.offset(),
                });
            }
        }
        Ok(members)
    }

    /// Find the defining DIE for a C type spelling.
    fn find_type(&self, name: &str) -> KscopeResult<Option<DieKey>>
    {
        let (tags, bare): (&[constants::DwTag], &str) = if let Some(rest) = name.strip_prefix("struct ") {
            (&[constants::DW_TAG_structure_type, constants::DW_TAG_class_type], rest)
        } else if let Some(rest) = name.strip_prefix("union ") {
            (&[constants::DW_TAG_union_type], rest)
        } else if let Some(rest) = name.strip_prefix("enum ") {
            (&[constants::DW_TAG_enumeration_type], rest)
        } else {
            (
                &[
                    constants::DW_TAG_base_type,
                    constants::DW_TAG_typedef,
                    constants::DW_TAG_unspecified_type,
                ],
                name,
            )
        };
        let bare = bare.trim();

        for (index, unit) in self.units.iter().enumerate() {
            let mut cursor = unit.entries();
            while let Some((_delta, entry)) = cursor.next_dfs().map_err(|err| dwarf_error("traversing DIE tree", err))? {
                if !tags.contains(&entry.tag()) || Self::is_declaration(entry)? {
                    continue;
                }
                let key = DieKey {
                    unit: index,
                    offset: entry.offset(),
                };
                if self.name(key, entry)?.as_deref() == Some(bare) {
                    return Ok(Some(key));
                }
            }
        }
        Ok(None)
    }

    /// Find a global variable's DIE by name.
    fn find_variable(&self, name: &str) -> KscopeResult<Option<DieKey>>
    {
        for (index, unit) in self.units.iter().enumerate() {
            let mut cursor = unit.entries();
            while let Some((_delta, entry)) = cursor.next_dfs().map_err(|err| dwarf_error("traversing DIE tree", err))? {
                if entry.tag() != constants::DW_TAG_variable {
                    continue;
                }
                let key = DieKey {
                    unit: index,
                    offset: entry.offset(),
                };
                if self.name(key, entry)?.as_deref() == Some(name) {
                    return Ok(Some(key));
                }
            }
        }
        Ok(None)
    }
}

/// Converts a DIE and everything it reaches into one type table
///
/// Works from a queue rather than by recursion, so long chains of
/// structures pointing at other structures do not grow the stack.
struct TypeConverter<'r, 'a>
{
    reader: &'r DieReader<'a>,
    builder: TypeTableBuilder,
    ids: HashMap<DieKey, TypeId>,
    queue: VecDeque<(DieKey, TypeId)>,
}

impl<'r, 'a> TypeConverter<'r, 'a>
{
    fn new(reader: &'r DieReader<'a>, pointer_size: u8) -> Self
    {
        Self {
            reader,
            builder: TypeTableBuilder::new(pointer_size),
            ids: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    fn convert(mut self, root: DieKey) -> KscopeResult<Type>
    {
        let root_id = match self.type_id(root)? {
            Some(id) => id,
            None => self.builder.add(TypeDescriptor {
                name: Some("void".to_string()),
                size: 0,
                align: 1,
                kind: TypeKind::Scalar(ScalarKind::Unsigned),
            }),
        };
        while let Some((key, id)) = self.queue.pop_front() {
            let descriptor = self.describe(key)?;
            self.builder.define(id, descriptor)?;
        }
        self.builder.build_type(root_id)
    }

    /// Reserve (or reuse) the table slot for a DIE; `None` for `void`.
    fn type_id(&mut self, key: DieKey) -> KscopeResult<Option<TypeId>>
    {
        let Some(key) = self.reader.canonical(key)? else {
            return Ok(None);
        };
        if let Some(id) = self.ids.get(&key) {
            return Ok(Some(*id));
        }
        let entry = self.reader.entry(key)?;
        let id = match self.reader.spelling(key, &entry)? {
            Some(name) => self.builder.reserve(name),
            None => self.builder.reserve_anonymous(),
        };
        self.ids.insert(key, id);
        self.queue.push_back((key, id));
        Ok(Some(id))
    }

    fn target_ref(&mut self, key: DieKey) -> KscopeResult<Option<TypeRef>>
    {
        match self.reader.type_of(key)? {
            Some(target) => Ok(self.type_id(target)?.map(TypeRef::Local)),
            None => Ok(None),
        }
    }

    fn describe(&mut self, key: DieKey) -> KscopeResult<TypeDescriptor>
    {
        let reader = self.reader;
        let pointer_size = self.builder.pointer_size();
        let entry = reader.entry(key)?;
        let name = reader.spelling(key, &entry)?;
        let (size, align) = reader.layout(Some(key), pointer_size, 0)?;

        let kind = match entry.tag() {
            constants::DW_TAG_base_type => TypeKind::Scalar(match DieReader::attr(&entry, constants::DW_AT_encoding)? {
                Some(AttributeValue::Encoding(constants::DW_ATE_signed | constants::DW_ATE_signed_char)) => ScalarKind::Signed,
                Some(AttributeValue::Encoding(constants::DW_ATE_boolean)) => ScalarKind::Bool,
                Some(AttributeValue::Encoding(constants::DW_ATE_float)) => ScalarKind::Float,
                _ => ScalarKind::Unsigned,
            }),
            constants::DW_TAG_pointer_type | constants::DW_TAG_reference_type | constants::DW_TAG_rvalue_reference_type => {
                let pointee = reader.type_of(key)?.map(|target| reader.canonical(target)).transpose()?.flatten();
                let is_code = match pointee {
                    Some(target) => reader.entry(target)?.tag() == constants::DW_TAG_subroutine_type,
                    None => false,
                };
                if is_code {
                    TypeKind::FunctionPointer
                } else {
                    TypeKind::Pointer {
                        target: self.target_ref(key)?,
                    }
                }
            }
            constants::DW_TAG_subroutine_type => TypeKind::FunctionPointer,
            constants::DW_TAG_structure_type | constants::DW_TAG_class_type | constants::DW_TAG_union_type => {
                let mut fields = Vec::new();
                for member in reader.members(key)? {
                    if let Some(field) = self.field(member)? {
                        fields.push(field);
                    }
                }
                if entry.tag() == constants::DW_TAG_union_type {
                    TypeKind::Union { fields }
                } else {
                    TypeKind::Struct { fields }
                }
            }
            constants::DW_TAG_enumeration_type => self.enumeration(key)?,
            constants::DW_TAG_array_type => {
                let element = self.target_ref(key)?.ok_or_else(|| {
                    KscopeError::DebugInfo(format!("array {:?} has no element type", key.offset))
                })?;
                return self.array(key, name, element, size, align);
            }
            constants::DW_TAG_unspecified_type => TypeKind::Scalar(ScalarKind::Unsigned),
            other => {
                return Err(KscopeError::DebugInfo(format!(
                    "unsupported DWARF tag {other} at {:?}",
                    key.offset
                )));
            }
        };

        Ok(TypeDescriptor { name, size, align, kind })
    }

    fn field(&mut self, member: DieKey) -> KscopeResult<Option<Field>>
    {
        let reader = self.reader;
        let entry = reader.entry(member)?;
        let Some(ty) = self.target_ref(member)? else {
            return Ok(None);
        };
        let name = reader.name(member, &entry)?;
        let byte_offset = DieReader::udata(&entry, constants::DW_AT_data_member_location)?;
        let bit_size = DieReader::udata(&entry, constants::DW_AT_bit_size)?;

        #[allow(clippy::cast_possible_truncation)]
        let (offset, bits) = match (bit_size, DieReader::udata(&entry, constants::DW_AT_data_bit_offset)?) {
            (Some(width), Some(bit_offset)) => (
                bit_offset / 8,
                Some(BitRange {
                    offset: (bit_offset % 8) as u8,
                    width: width as u8,
                }),
            ),
            (Some(width), None) => {
                // DWARF 2/3: DW_AT_bit_offset counts from the MSB of the storage unit.
                let storage = match DieReader::udata(&entry, constants::DW_AT_byte_size)? {
                    Some(bytes) => bytes,
                    None => reader.layout(reader.type_of(member)?, self.builder.pointer_size(), 0)?.0,
                };
                let msb_offset = DieReader::udata(&entry, constants::DW_AT_bit_offset)?.unwrap_or(0);
                let start = byte_offset.unwrap_or(0) * 8;
                let data_bit_offset = match reader.endian {
                    RunTimeEndian::Little => (start + storage * 8).saturating_sub(msb_offset + width),
                    RunTimeEndian::Big => start + msb_offset,
                };
                (
                    data_bit_offset / 8,
                    Some(BitRange {
                        offset: (data_bit_offset % 8) as u8,
                        width: width as u8,
                    }),
                )
            }
            _ => (byte_offset.unwrap_or(0), None),
        };

        Ok(Some(Field { name, offset, ty, bits }))
    }

    fn enumeration(&mut self, key: DieKey) -> KscopeResult<TypeKind>
    {
        let reader = self.reader;
        let mut enumerators = Vec::new();
        let mut tree = reader
            .unit(key)
            .entries_tree(Some(key.offset))
            .map_err(|err| dwarf_error("building enumeration tree", err))?;
        let root = tree.root().map_err(|err| dwarf_error("navigating enumeration root", err))?;
        let mut children = root.children();
        while let Some(child) = children.next().map_err(|err| dwarf_error("iterating enumerators", err))? {
            let entry = child.entry();
            if entry.tag() != constants::DW_TAG_enumerator {
                continue;
            }
            let child_key = DieKey {
                unit: key.unit,
                offset: entry.offset(),
            };
            let name = reader.name(child_key, entry)?.unwrap_or_default();
            let value = DieReader::sdata(entry, constants::DW_AT_const_value)?.unwrap_or(0);
            enumerators.push((name, value));
        }

        let signed = match reader.type_of(key)? {
            Some(underlying) => match reader.canonical(underlying)? {
                Some(base) => matches!(
                    DieReader::attr(&reader.entry(base)?, constants::DW_AT_encoding)?,
                    Some(AttributeValue::Encoding(constants::DW_ATE_signed | constants::DW_ATE_signed_char))
                ),
                None => false,
            },
            None => enumerators.iter().any(|(_, value)| *value < 0),
        };
        Ok(TypeKind::Enum { signed, enumerators })
    }

    /// Build nested arrays for multi-dimensional DIEs; `int a[2][3]` is an
    /// array of 2 arrays of 3 ints.
    fn array(
        &mut self,
        key: DieKey,
        name: Option<String>,
        element: TypeRef,
        size: u64,
        align: u64,
    ) -> KscopeResult<TypeDescriptor>
    {
        let dims = self.reader.dimensions(key)?;
        let mut inner_size = self.reader.layout(self.reader.type_of(key)?, self.builder.pointer_size(), 0)?.0;

        let mut inner = element;
        for count in dims.iter().skip(1).rev() {
            inner_size = inner_size.saturating_mul(count.unwrap_or(0));
            let id = self.builder.add(TypeDescriptor {
                name: None,
                size: inner_size,
                align,
                kind: TypeKind::Array {
                    element: inner,
                    count: *count,
                },
            });
            inner = TypeRef::Local(id);
        }

        Ok(TypeDescriptor {
            name,
            size,
            align,
            kind: TypeKind::Array {
                element: inner,
                count: dims[0],
            },
        })
    }
}
