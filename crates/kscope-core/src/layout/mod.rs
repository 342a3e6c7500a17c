//! # Type Layouts
//!
//! Structural descriptions of kernel types: sizes, alignments, member
//! offsets, array extents, pointee types.
//!
//! Descriptors live in an immutable [`TypeTable`]. A [`Type`] is a cheap
//! handle (`Arc<TypeTable>` plus an index), so values can keep the exact
//! descriptor they were created with even after the catalog replaces the
//! entry under the same name.
//!
//! Descriptors refer to each other through [`TypeRef`]: either an index into
//! the same table (which is how `struct list_head` points at itself) or a
//! handle to a type in another, already frozen table.

mod builder;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub use builder::{StructBuilder, TypeTableBuilder};

use crate::error::{KscopeError, KscopeResult};

/// Index of a descriptor inside its [`TypeTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub(crate) usize);

/// Reference from one descriptor to another
#[derive(Debug, Clone)]
pub enum TypeRef
{
    /// A descriptor in the same table
    Local(TypeId),
    /// A descriptor in another (frozen) table
    Shared(Type),
}

impl From<TypeId> for TypeRef
{
    fn from(id: TypeId) -> Self
    {
        TypeRef::Local(id)
    }
}

impl From<Type> for TypeRef
{
    fn from(ty: Type) -> Self
    {
        TypeRef::Shared(ty)
    }
}

impl From<&Type> for TypeRef
{
    fn from(ty: &Type) -> Self
    {
        TypeRef::Shared(ty.clone())
    }
}

/// Interpretation of a scalar's bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind
{
    Unsigned,
    Signed,
    Bool,
    /// Floating point; decoded as raw bytes
    Float,
}

/// A bit-field member's position inside its storage
///
/// `offset` counts from the start of the member's byte offset the way
/// `DW_AT_data_bit_offset` does: from the least significant bit on
/// little-endian targets, from the most significant on big-endian ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BitRange
{
    pub offset: u8,
    pub width: u8,
}

/// A struct or union member
#[derive(Debug, Clone)]
pub struct Field
{
    /// `None` for anonymous structs/unions, whose members are reachable by
    /// name through the parent
    pub name: Option<String>,
    /// Byte offset from the start of the enclosing object
    pub offset: u64,
    pub ty: TypeRef,
    /// Bit-field placement, if this is a bit-field
    pub bits: Option<BitRange>,
}

/// Type kinds the object model distinguishes
#[derive(Debug, Clone)]
pub enum TypeKind
{
    Scalar(ScalarKind),
    /// Pointer; `None` is `void *`
    Pointer
    {
        target: Option<TypeRef>,
    },
    /// Fixed-size array; `count` is `None` for flexible array members
    Array
    {
        element: TypeRef,
        count: Option<u64>,
    },
    Struct
    {
        fields: Vec<Field>,
    },
    Union
    {
        fields: Vec<Field>,
    },
    Enum
    {
        signed: bool,
        enumerators: Vec<(String, i64)>,
    },
    /// Pointer to code; opaque to the object model
    FunctionPointer,
}

/// Structural description of one type
#[derive(Debug, Clone)]
pub struct TypeDescriptor
{
    /// Full C spelling (`struct list_head`, `unsigned long`); `None` for
    /// anonymous and derived types
    pub name: Option<String>,
    pub size: u64,
    pub align: u64,
    pub kind: TypeKind,
}

/// Immutable arena of type descriptors
///
/// Built once by [`TypeTableBuilder`], then shared behind an `Arc`.
#[derive(Debug, Default)]
pub struct TypeTable
{
    types: Vec<TypeDescriptor>,
    names: HashMap<String, TypeId>,
}

impl TypeTable
{
    /// Handle to the named descriptor, if the table defines it.
    #[must_use]
    pub fn lookup(self: &Arc<Self>, name: &str) -> Option<Type>
    {
        self.names.get(name).map(|id| Type {
            table: Arc::clone(self),
            id: *id,
        })
    }

    /// Names the table defines.
    pub fn names(&self) -> impl Iterator<Item = &str>
    {
        self.names.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize
    {
        self.types.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.types.is_empty()
    }
}

/// Handle to a descriptor in a frozen [`TypeTable`]
#[derive(Clone)]
pub struct Type
{
    table: Arc<TypeTable>,
    id: TypeId,
}

/// A member located inside an aggregate, anonymous nesting flattened
#[derive(Debug, Clone)]
pub struct FieldRef
{
    /// Offset from the start of the outermost aggregate
    pub offset: u64,
    pub ty: Type,
    pub bits: Option<BitRange>,
}

impl Type
{
    /// Handle to `id` in `table`.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidArgument`] when `id` is not in the table.
    pub fn new(table: Arc<TypeTable>, id: TypeId) -> KscopeResult<Self>
    {
        if id.0 >= table.types.len() {
            return Err(KscopeError::InvalidArgument(format!("type id {} not in table", id.0)));
        }
        Ok(Self { table, id })
    }

    #[must_use]
    pub fn descriptor(&self) -> &TypeDescriptor
    {
        &self.table.types[self.id.0]
    }

    #[must_use]
    pub fn kind(&self) -> &TypeKind
    {
        &self.descriptor().kind
    }

    #[must_use]
    pub fn size(&self) -> u64
    {
        self.descriptor().size
    }

    #[must_use]
    pub fn align(&self) -> u64
    {
        self.descriptor().align
    }

    /// Follow a reference made from inside this type's table.
    #[must_use]
    pub fn resolve(&self, reference: &TypeRef) -> Type
    {
        match reference {
            TypeRef::Local(id) => Type {
                table: Arc::clone(&self.table),
                id: *id,
            },
            TypeRef::Shared(ty) => ty.clone(),
        }
    }

    /// Whether both handles name the very same descriptor.
    #[must_use]
    pub fn same_as(&self, other: &Type) -> bool
    {
        Arc::ptr_eq(&self.table, &other.table) && self.id == other.id
    }

    #[must_use]
    pub fn is_pointer(&self) -> bool
    {
        matches!(self.kind(), TypeKind::Pointer { .. } | TypeKind::FunctionPointer)
    }

    #[must_use]
    pub fn is_array(&self) -> bool
    {
        matches!(self.kind(), TypeKind::Array { .. })
    }

    /// Struct or union.
    #[must_use]
    pub fn is_aggregate(&self) -> bool
    {
        matches!(self.kind(), TypeKind::Struct { .. } | TypeKind::Union { .. })
    }

    /// Pointee of a data pointer; `None` for `void *` and non-pointers.
    #[must_use]
    pub fn pointee(&self) -> Option<Type>
    {
        match self.kind() {
            TypeKind::Pointer { target: Some(target) } => Some(self.resolve(target)),
            _ => None,
        }
    }

    /// Element type and count of an array.
    #[must_use]
    pub fn element(&self) -> Option<(Type, Option<u64>)>
    {
        match self.kind() {
            TypeKind::Array { element, count } => Some((self.resolve(element), *count)),
            _ => None,
        }
    }

    /// Direct members of a struct or union; empty for anything else.
    #[must_use]
    pub fn fields(&self) -> &[Field]
    {
        match self.kind() {
            TypeKind::Struct { fields } | TypeKind::Union { fields } => fields,
            _ => &[],
        }
    }

    /// Locate a member by name, descending into anonymous members.
    #[must_use]
    pub fn find_field(&self, name: &str) -> Option<FieldRef>
    {
        for field in self.fields() {
            match &field.name {
                Some(field_name) if field_name == name => {
                    return Some(FieldRef {
                        offset: field.offset,
                        ty: self.resolve(&field.ty),
                        bits: field.bits,
                    });
                }
                None => {
                    let inner = self.resolve(&field.ty);
                    if let Some(mut found) = inner.find_field(name) {
                        found.offset += field.offset;
                        return Some(found);
                    }
                }
                Some(_) => {}
            }
        }
        None
    }

    /// Locate a nested member by dotted path (`"tasks.next"`), like `offsetof`.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidKind`] when a step is not an aggregate,
    /// [`KscopeError::NoSuchField`] when a step has no such member, and
    /// [`KscopeError::InvalidArgument`] for an empty path.
    pub fn field_path(&self, path: &str) -> KscopeResult<FieldRef>
    {
        if path.is_empty() {
            return Err(KscopeError::InvalidArgument("empty member path".to_string()));
        }

        let mut current = FieldRef {
            offset: 0,
            ty: self.clone(),
            bits: None,
        };
        for step in path.split('.') {
            if !current.ty.is_aggregate() {
                return Err(KscopeError::InvalidKind {
                    operation: "take a member of",
                    found: current.ty.name(),
                });
            }
            let found = current.ty.find_field(step).ok_or_else(|| KscopeError::NoSuchField {
                type_name: current.ty.name(),
                field: step.to_string(),
            })?;
            current = FieldRef {
                offset: current.offset + found.offset,
                ty: found.ty,
                bits: found.bits,
            };
        }
        Ok(current)
    }

    /// A pointer to this type, in a fresh single-entry table.
    #[must_use]
    pub fn pointer_to(&self, pointer_size: u8) -> Type
    {
        Self::standalone_pointer(Some(TypeRef::Shared(self.clone())), pointer_size)
    }

    /// `void *`, in a fresh single-entry table.
    #[must_use]
    pub fn void_pointer(pointer_size: u8) -> Type
    {
        Self::standalone_pointer(None, pointer_size)
    }

    fn standalone_pointer(target: Option<TypeRef>, pointer_size: u8) -> Type
    {
        let size = u64::from(pointer_size);
        let table = Arc::new(TypeTable {
            types: vec![TypeDescriptor {
                name: None,
                size,
                align: size,
                kind: TypeKind::Pointer { target },
            }],
            names: HashMap::new(),
        });
        Type { table, id: TypeId(0) }
    }

    /// C spelling of the type.
    #[must_use]
    pub fn name(&self) -> String
    {
        let descriptor = self.descriptor();
        if let Some(name) = &descriptor.name {
            return name.clone();
        }
        match &descriptor.kind {
            TypeKind::Pointer { target: None } => "void *".to_string(),
            TypeKind::Pointer { target: Some(target) } => {
                let inner = self.resolve(target).name();
                if inner.ends_with('*') {
                    format!("{inner}*")
                } else {
                    format!("{inner} *")
                }
            }
            TypeKind::Array { element, count } => {
                let inner = self.resolve(element).name();
                match count {
                    Some(count) => format!("{inner} [{count}]"),
                    None => format!("{inner} []"),
                }
            }
            TypeKind::Struct { .. } => "struct <anonymous>".to_string(),
            TypeKind::Union { .. } => "union <anonymous>".to_string(),
            TypeKind::Enum { .. } => "enum <anonymous>".to_string(),
            TypeKind::FunctionPointer => "void (*)(void)".to_string(),
            TypeKind::Scalar(_) => format!("<{}-byte scalar>", descriptor.size),
        }
    }
}

impl fmt::Debug for Type
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Type")
            .field("name", &self.name())
            .field("size", &self.size())
            .finish()
    }
}

impl fmt::Display for Type
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.name())
    }
}

/// Split a C spelling into its base name and pointer depth.
///
/// `"struct task_struct **"` becomes `("struct task_struct", 2)`.
#[must_use]
pub fn split_pointer_suffix(name: &str) -> (&str, usize)
{
    let mut base = name.trim();
    let mut depth = 0;
    while let Some(stripped) = base.strip_suffix('*') {
        base = stripped.trim_end();
        depth += 1;
    }
    (base, depth)
}
