//! Construction of [`TypeTable`]s.
//!
//! Descriptors that refer to themselves (or to each other) are declared first
//! with [`TypeTableBuilder::reserve`] and filled in with
//! [`TypeTableBuilder::define`] once their members are known.

use std::collections::HashMap;
use std::sync::Arc;

use super::{BitRange, Field, ScalarKind, Type, TypeDescriptor, TypeId, TypeKind, TypeRef, TypeTable};
use crate::error::{KscopeError, KscopeResult};
use crate::types::AlignmentRule;

/// Mutable staging area for a [`TypeTable`]
#[derive(Debug)]
pub struct TypeTableBuilder
{
    pointer_size: u8,
    types: Vec<Option<TypeDescriptor>>,
    names: HashMap<String, TypeId>,
}

impl TypeTableBuilder
{
    /// Start an empty table for a target with the given pointer width.
    #[must_use]
    pub fn new(pointer_size: u8) -> Self
    {
        Self {
            pointer_size,
            types: Vec::new(),
            names: HashMap::new(),
        }
    }

    #[must_use]
    pub fn pointer_size(&self) -> u8
    {
        self.pointer_size
    }

    /// Declare a named descriptor whose layout is supplied later.
    pub fn reserve(&mut self, name: impl Into<String>) -> TypeId
    {
        let id = TypeId(self.types.len());
        self.types.push(None);
        self.names.insert(name.into(), id);
        id
    }

    /// Declare an anonymous descriptor whose layout is supplied later.
    pub fn reserve_anonymous(&mut self) -> TypeId
    {
        let id = TypeId(self.types.len());
        self.types.push(None);
        id
    }

    /// Supply the layout of a reserved descriptor.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidArgument`] when `id` was never reserved or is
    /// already defined.
    pub fn define(&mut self, id: TypeId, descriptor: TypeDescriptor) -> KscopeResult<()>
    {
        match self.types.get_mut(id.0) {
            Some(slot @ None) => {
                *slot = Some(descriptor);
                Ok(())
            }
            Some(Some(existing)) => Err(KscopeError::InvalidArgument(format!(
                "type {} defined twice",
                existing.name.as_deref().unwrap_or("<anonymous>")
            ))),
            None => Err(KscopeError::InvalidArgument(format!("type id {} was never reserved", id.0))),
        }
    }

    /// Add a complete descriptor, registering its name if it has one.
    pub fn add(&mut self, descriptor: TypeDescriptor) -> TypeId
    {
        let id = TypeId(self.types.len());
        if let Some(name) = &descriptor.name {
            self.names.insert(name.clone(), id);
        }
        self.types.push(Some(descriptor));
        id
    }

    /// Register another spelling for an existing descriptor (typedefs).
    pub fn alias(&mut self, name: impl Into<String>, id: TypeId)
    {
        self.names.insert(name.into(), id);
    }

    /// Add a named scalar whose alignment equals its size.
    pub fn scalar(&mut self, name: &str, size: u64, kind: ScalarKind) -> TypeId
    {
        self.add(TypeDescriptor {
            name: Some(name.to_string()),
            size,
            align: size.max(1),
            kind: TypeKind::Scalar(kind),
        })
    }

    /// Add a pointer to `target`, or `void *` when `target` is `None`.
    pub fn pointer(&mut self, target: Option<TypeRef>) -> TypeId
    {
        let size = u64::from(self.pointer_size);
        self.add(TypeDescriptor {
            name: None,
            size,
            align: size,
            kind: TypeKind::Pointer { target },
        })
    }

    /// Add a pointer to `target`.
    pub fn pointer_to(&mut self, target: impl Into<TypeRef>) -> TypeId
    {
        self.pointer(Some(target.into()))
    }

    /// Add an array of `count` elements.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidArgument`] when the element's layout is not
    /// defined yet.
    pub fn array_of(&mut self, element: impl Into<TypeRef>, count: Option<u64>) -> KscopeResult<TypeId>
    {
        let element = element.into();
        let (size, align) = self.layout_of(&element)?;
        Ok(self.add(TypeDescriptor {
            name: None,
            size: size.saturating_mul(count.unwrap_or(0)),
            align,
            kind: TypeKind::Array { element, count },
        }))
    }

    /// Size and alignment of a referenced type.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidArgument`] for reserved-but-undefined or unknown
    /// local references.
    pub fn layout_of(&self, reference: &TypeRef) -> KscopeResult<(u64, u64)>
    {
        match reference {
            TypeRef::Shared(ty) => Ok((ty.size(), ty.align())),
            TypeRef::Local(id) => match self.types.get(id.0) {
                Some(Some(descriptor)) => Ok((descriptor.size, descriptor.align)),
                Some(None) => Err(KscopeError::InvalidArgument(format!(
                    "type id {} is used by value before it is defined",
                    id.0
                ))),
                None => Err(KscopeError::InvalidArgument(format!("unknown type id {}", id.0))),
            },
        }
    }

    /// Freeze the table.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidArgument`] when a reserved descriptor was never
    /// defined.
    pub fn build(self) -> KscopeResult<Arc<TypeTable>>
    {
        let mut types = Vec::with_capacity(self.types.len());
        for (index, slot) in self.types.into_iter().enumerate() {
            let Some(descriptor) = slot else {
                let name = self
                    .names
                    .iter()
                    .find(|(_, id)| id.0 == index)
                    .map_or_else(|| format!("#{index}"), |(name, _)| name.clone());
                return Err(KscopeError::InvalidArgument(format!("type {name} reserved but never defined")));
            };
            types.push(descriptor);
        }
        Ok(Arc::new(TypeTable {
            types,
            names: self.names,
        }))
    }

    /// Freeze the table and return a handle to one of its descriptors.
    ///
    /// ## Errors
    ///
    /// As [`TypeTableBuilder::build`].
    pub fn build_type(self, id: TypeId) -> KscopeResult<Type>
    {
        Type::new(self.build()?, id)
    }
}

/// Computes member offsets for a struct or union under an [`AlignmentRule`]
///
/// ```rust
/// use kscope_core::layout::{ScalarKind, StructBuilder, TypeTableBuilder};
/// use kscope_core::types::AlignmentRule;
///
/// let mut types = TypeTableBuilder::new(8);
/// let int = types.scalar("int", 4, ScalarKind::Signed);
/// let long = types.scalar("long", 8, ScalarKind::Signed);
/// let desc = StructBuilder::new("struct pair", AlignmentRule::Natural { max_align: 8 })
///     .field(&types, "a", int)
///     .unwrap()
///     .field(&types, "b", long)
///     .unwrap()
///     .finish();
/// assert_eq!(desc.size, 16);
/// ```
#[derive(Debug)]
pub struct StructBuilder
{
    name: Option<String>,
    rule: AlignmentRule,
    union: bool,
    fields: Vec<Field>,
    end: u64,
    align: u64,
}

impl StructBuilder
{
    /// Start a struct named with its full C spelling (`"struct foo"`).
    #[must_use]
    pub fn new(name: &str, rule: AlignmentRule) -> Self
    {
        Self::start(Some(name.to_string()), rule, false)
    }

    /// Start a union; every member sits at offset zero.
    #[must_use]
    pub fn union(name: &str, rule: AlignmentRule) -> Self
    {
        Self::start(Some(name.to_string()), rule, true)
    }

    /// Start an anonymous struct (or union, with `union` set).
    #[must_use]
    pub fn anonymous(rule: AlignmentRule, union: bool) -> Self
    {
        Self::start(None, rule, union)
    }

    fn start(name: Option<String>, rule: AlignmentRule, union: bool) -> Self
    {
        Self {
            name,
            rule,
            union,
            fields: Vec::new(),
            end: 0,
            align: 1,
        }
    }

    /// Append a named member at the next suitably aligned offset.
    ///
    /// ## Errors
    ///
    /// When the member's type is not laid out yet.
    pub fn field(self, types: &TypeTableBuilder, name: &str, ty: impl Into<TypeRef>) -> KscopeResult<Self>
    {
        self.push(types, Some(name.to_string()), ty.into())
    }

    /// Append an anonymous struct/union member.
    ///
    /// ## Errors
    ///
    /// When the member's type is not laid out yet.
    pub fn embed(self, types: &TypeTableBuilder, ty: impl Into<TypeRef>) -> KscopeResult<Self>
    {
        self.push(types, None, ty.into())
    }

    /// Place a member at an explicit offset, as recorded by a compiler.
    ///
    /// ## Errors
    ///
    /// When the member's type is not laid out yet.
    pub fn field_at(
        mut self,
        types: &TypeTableBuilder,
        name: Option<&str>,
        offset: u64,
        ty: impl Into<TypeRef>,
        bits: Option<BitRange>,
    ) -> KscopeResult<Self>
    {
        let ty = ty.into();
        let (size, align) = types.layout_of(&ty)?;
        self.align = self.align.max(self.rule.align_for(align));
        self.end = self.end.max(offset + size);
        self.fields.push(Field {
            name: name.map(str::to_string),
            offset,
            ty,
            bits,
        });
        Ok(self)
    }

    fn push(mut self, types: &TypeTableBuilder, name: Option<String>, ty: TypeRef) -> KscopeResult<Self>
    {
        let (size, natural) = types.layout_of(&ty)?;
        let align = self.rule.align_for(natural);
        let offset = if self.union { 0 } else { round_up(self.end, align) };
        self.align = self.align.max(align);
        self.end = self.end.max(offset + size);
        self.fields.push(Field {
            name,
            offset,
            ty,
            bits: None,
        });
        Ok(self)
    }

    /// Pad the size out to the alignment and produce the descriptor.
    #[must_use]
    pub fn finish(self) -> TypeDescriptor
    {
        let kind = if self.union {
            TypeKind::Union { fields: self.fields }
        } else {
            TypeKind::Struct { fields: self.fields }
        };
        TypeDescriptor {
            name: self.name,
            size: round_up(self.end, self.align),
            align: self.align,
            kind,
        }
    }
}

fn round_up(value: u64, align: u64) -> u64
{
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    const NATURAL: AlignmentRule = AlignmentRule::Natural { max_align: 8 };

    #[test]
    fn test_padding_and_tail()
    {
        let mut types = TypeTableBuilder::new(8);
        let ch = types.scalar("char", 1, ScalarKind::Signed);
        let long = types.scalar("long", 8, ScalarKind::Signed);
        let desc = StructBuilder::new("struct s", NATURAL)
            .field(&types, "c", ch)
            .unwrap()
            .field(&types, "l", long)
            .unwrap()
            .field(&types, "d", ch)
            .unwrap()
            .finish();
        let offsets: Vec<u64> = match &desc.kind {
            TypeKind::Struct { fields } => fields.iter().map(|f| f.offset).collect(),
            _ => unreachable!(),
        };
        assert_eq!(offsets, vec![0, 8, 16]);
        assert_eq!(desc.size, 24);
    }

    #[test]
    fn test_packed_has_no_padding()
    {
        let mut types = TypeTableBuilder::new(8);
        let ch = types.scalar("char", 1, ScalarKind::Signed);
        let long = types.scalar("long", 8, ScalarKind::Signed);
        let desc = StructBuilder::new("struct p", AlignmentRule::Packed)
            .field(&types, "c", ch)
            .unwrap()
            .field(&types, "l", long)
            .unwrap()
            .finish();
        assert_eq!(desc.size, 9);
    }

    #[test]
    fn test_union_members_share_offset()
    {
        let mut types = TypeTableBuilder::new(8);
        let int = types.scalar("int", 4, ScalarKind::Signed);
        let long = types.scalar("long", 8, ScalarKind::Signed);
        let desc = StructBuilder::union("union u", NATURAL)
            .field(&types, "i", int)
            .unwrap()
            .field(&types, "l", long)
            .unwrap()
            .finish();
        assert_eq!(desc.size, 8);
    }

    #[test]
    fn test_undefined_reservation_fails_build()
    {
        let mut types = TypeTableBuilder::new(8);
        types.reserve("struct never");
        assert!(types.build().is_err());
    }

    #[test]
    fn test_by_value_use_before_define_fails()
    {
        let mut types = TypeTableBuilder::new(8);
        let node = types.reserve("struct node");
        assert!(StructBuilder::new("struct outer", NATURAL).field(&types, "n", node).is_err());
    }
}
