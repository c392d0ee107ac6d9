//! The SafeC type taxonomy.
//!
//! Types are a closed sum behind a shared reference-counted handle
//! (`TypeRef`). Values are immutable after construction and built through
//! the factory helpers on [`Type`]. Equality is structural for every
//! variant except structs and enums, which compare nominally by name;
//! recursive struct types reference themselves through the analyzer's
//! type registry, not through pointer identity.

use crate::ast::Expr;
use std::fmt;
use std::rc::Rc;

pub type TypeRef = Rc<Type>;

/// Lifetime class attached to a reference type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Region {
    Stack,
    Static,
    Heap,
    Arena(String),
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Stack => write!(f, "stack"),
            Region::Static => write!(f, "static"),
            Region::Heap => write!(f, "heap"),
            Region::Arena(name) => write!(f, "arena<{}>", name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StructField {
    pub name: String,
    pub ty: TypeRef,
}

#[derive(Debug, Clone)]
pub enum Type {
    Void,
    Bool,
    Char,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    /// Sentinel produced after a reported error. It satisfies every
    /// conversion check so one mistake does not cascade.
    Error,
    Pointer {
        base: TypeRef,
        is_const: bool,
    },
    Reference {
        base: TypeRef,
        region: Region,
        nullable: bool,
        mutable: bool,
    },
    Array {
        element: TypeRef,
        size: Option<u64>,
    },
    Struct {
        name: String,
        fields: Vec<StructField>,
        is_union: bool,
        packed: bool,
        /// False for a by-name mention whose definition lives in the
        /// registry (or nowhere yet).
        defined: bool,
    },
    Enum {
        name: String,
        variants: Vec<(String, i64)>,
        /// Underlying width in bits.
        width: u8,
    },
    Function {
        ret: TypeRef,
        params: Vec<TypeRef>,
        variadic: bool,
    },
    Tuple {
        elements: Vec<TypeRef>,
    },
    Optional {
        inner: TypeRef,
    },
    Slice {
        element: TypeRef,
    },
    /// A generic parameter awaiting substitution.
    Generic {
        name: String,
        constraint: Option<String>,
    },
    Newtype {
        name: String,
        base: TypeRef,
    },
    /// `typeof(expr)`, opaque until the analyzer folds it to a concrete
    /// type. Must not survive to the backend handoff.
    Typeof {
        expr: Box<Expr>,
    },
}

impl Type {
    pub fn void() -> TypeRef {
        Rc::new(Type::Void)
    }
    pub fn bool_() -> TypeRef {
        Rc::new(Type::Bool)
    }
    pub fn char_() -> TypeRef {
        Rc::new(Type::Char)
    }
    pub fn int8() -> TypeRef {
        Rc::new(Type::Int8)
    }
    pub fn int16() -> TypeRef {
        Rc::new(Type::Int16)
    }
    pub fn int32() -> TypeRef {
        Rc::new(Type::Int32)
    }
    pub fn int64() -> TypeRef {
        Rc::new(Type::Int64)
    }
    pub fn uint8() -> TypeRef {
        Rc::new(Type::UInt8)
    }
    pub fn uint16() -> TypeRef {
        Rc::new(Type::UInt16)
    }
    pub fn uint32() -> TypeRef {
        Rc::new(Type::UInt32)
    }
    pub fn uint64() -> TypeRef {
        Rc::new(Type::UInt64)
    }
    pub fn float32() -> TypeRef {
        Rc::new(Type::Float32)
    }
    pub fn float64() -> TypeRef {
        Rc::new(Type::Float64)
    }
    pub fn error() -> TypeRef {
        Rc::new(Type::Error)
    }

    pub fn pointer(base: TypeRef, is_const: bool) -> TypeRef {
        Rc::new(Type::Pointer { base, is_const })
    }

    pub fn reference(base: TypeRef, region: Region, nullable: bool, mutable: bool) -> TypeRef {
        Rc::new(Type::Reference {
            base,
            region,
            nullable,
            mutable,
        })
    }

    pub fn array(element: TypeRef, size: Option<u64>) -> TypeRef {
        Rc::new(Type::Array { element, size })
    }

    /// A by-name struct mention; the definition lives in the registry.
    pub fn named_struct(name: impl Into<String>) -> TypeRef {
        Rc::new(Type::Struct {
            name: name.into(),
            fields: Vec::new(),
            is_union: false,
            packed: false,
            defined: false,
        })
    }

    pub fn function(ret: TypeRef, params: Vec<TypeRef>, variadic: bool) -> TypeRef {
        Rc::new(Type::Function {
            ret,
            params,
            variadic,
        })
    }

    pub fn tuple(elements: Vec<TypeRef>) -> TypeRef {
        Rc::new(Type::Tuple { elements })
    }

    pub fn optional(inner: TypeRef) -> TypeRef {
        Rc::new(Type::Optional { inner })
    }

    pub fn slice(element: TypeRef) -> TypeRef {
        Rc::new(Type::Slice { element })
    }

    pub fn generic(name: impl Into<String>, constraint: Option<String>) -> TypeRef {
        Rc::new(Type::Generic {
            name: name.into(),
            constraint,
        })
    }

    pub fn newtype(name: impl Into<String>, base: TypeRef) -> TypeRef {
        Rc::new(Type::Newtype {
            name: name.into(),
            base,
        })
    }

    pub fn typeof_expr(expr: Expr) -> TypeRef {
        Rc::new(Type::Typeof {
            expr: Box::new(expr),
        })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Type::Error)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Type::Bool
                | Type::Char
                | Type::Int8
                | Type::Int16
                | Type::Int32
                | Type::Int64
                | Type::UInt8
                | Type::UInt16
                | Type::UInt32
                | Type::UInt64
                | Type::Enum { .. }
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float32 | Type::Float64)
    }

    pub fn is_arithmetic(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(
            self,
            Type::Bool | Type::UInt8 | Type::UInt16 | Type::UInt32 | Type::UInt64
        )
    }

    /// Bit width of an integer or float type; `None` for everything else.
    pub fn bit_width(&self) -> Option<u32> {
        let bits = match self {
            Type::Bool | Type::Char | Type::Int8 | Type::UInt8 => 8,
            Type::Int16 | Type::UInt16 => 16,
            Type::Int32 | Type::UInt32 | Type::Float32 => 32,
            Type::Int64 | Type::UInt64 | Type::Float64 => 64,
            Type::Enum { width, .. } => u32::from(*width),
            _ => return None,
        };
        Some(bits)
    }

    /// The `Bool`/`Char`/`Int8`/`UInt8` interop class.
    pub fn is_eight_bit(&self) -> bool {
        matches!(self, Type::Bool | Type::Char | Type::Int8 | Type::UInt8)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Pointer { .. })
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Type::Reference { .. })
    }

    /// True for types a condition may have (`if`, `while`, ternary).
    pub fn is_condition(&self) -> bool {
        self.is_integer() || self.is_pointer() || self.is_reference() || self.is_error()
    }

    /// Structural equality, nominal for structs and enums. Reflexive for
    /// every constructible type except `Typeof`, which never compares
    /// equal; it must be folded before any equality question is asked.
    pub fn equals(&self, other: &Type) -> bool {
        use Type::*;
        match (self, other) {
            (Void, Void)
            | (Bool, Bool)
            | (Char, Char)
            | (Int8, Int8)
            | (Int16, Int16)
            | (Int32, Int32)
            | (Int64, Int64)
            | (UInt8, UInt8)
            | (UInt16, UInt16)
            | (UInt32, UInt32)
            | (UInt64, UInt64)
            | (Float32, Float32)
            | (Float64, Float64)
            | (Error, Error) => true,
            (
                Pointer {
                    base: a,
                    is_const: ca,
                },
                Pointer {
                    base: b,
                    is_const: cb,
                },
            ) => ca == cb && a.equals(b),
            (
                Reference {
                    base: a,
                    region: ra,
                    nullable: na,
                    mutable: ma,
                },
                Reference {
                    base: b,
                    region: rb,
                    nullable: nb,
                    mutable: mb,
                },
            ) => ra == rb && na == nb && ma == mb && a.equals(b),
            (
                Array {
                    element: a,
                    size: sa,
                },
                Array {
                    element: b,
                    size: sb,
                },
            ) => sa == sb && a.equals(b),
            (Struct { name: a, .. }, Struct { name: b, .. }) => a == b,
            (Enum { name: a, .. }, Enum { name: b, .. }) => a == b,
            (
                Function {
                    ret: ra,
                    params: pa,
                    variadic: va,
                },
                Function {
                    ret: rb,
                    params: pb,
                    variadic: vb,
                },
            ) => {
                va == vb
                    && ra.equals(rb)
                    && pa.len() == pb.len()
                    && pa.iter().zip(pb).all(|(x, y)| x.equals(y))
            }
            (Tuple { elements: a }, Tuple { elements: b }) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
            }
            (Optional { inner: a }, Optional { inner: b }) => a.equals(b),
            (Slice { element: a }, Slice { element: b }) => a.equals(b),
            (Generic { name: a, .. }, Generic { name: b, .. }) => a == b,
            (Newtype { name: a, .. }, Newtype { name: b, .. }) => a == b,
            _ => false,
        }
    }

    /// Identifier-safe rendering used in monomorphization mangles
    /// (`id` over `int` becomes `__safec_id_int`).
    pub fn mangle(&self) -> String {
        match self {
            Type::Pointer { base, .. } => format!("{}_ptr", base.mangle()),
            Type::Reference {
                base,
                region,
                nullable,
                ..
            } => {
                let region = match region {
                    Region::Stack => "stack".to_string(),
                    Region::Static => "static".to_string(),
                    Region::Heap => "heap".to_string(),
                    Region::Arena(name) => format!("arena_{}", name),
                };
                if *nullable {
                    format!("{}_{}_nref", base.mangle(), region)
                } else {
                    format!("{}_{}_ref", base.mangle(), region)
                }
            }
            Type::Array { element, size } => match size {
                Some(n) => format!("{}_arr{}", element.mangle(), n),
                None => format!("{}_arr", element.mangle()),
            },
            Type::Struct { name, .. } => name.clone(),
            Type::Enum { name, .. } => name.clone(),
            Type::Function { .. } => "fnptr".to_string(),
            Type::Tuple { elements } => {
                let parts: Vec<_> = elements.iter().map(|t| t.mangle()).collect();
                format!("tuple_{}", parts.join("_"))
            }
            Type::Optional { inner } => format!("{}_opt", inner.mangle()),
            Type::Slice { element } => format!("{}_slice", element.mangle()),
            Type::Generic { name, .. } => name.clone(),
            Type::Newtype { name, .. } => name.clone(),
            Type::Typeof { .. } => "typeof".to_string(),
            other => format!("{}", other),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Bool => write!(f, "bool"),
            Type::Char => write!(f, "char"),
            Type::Int8 => write!(f, "i8"),
            Type::Int16 => write!(f, "i16"),
            Type::Int32 => write!(f, "int"),
            Type::Int64 => write!(f, "i64"),
            Type::UInt8 => write!(f, "u8"),
            Type::UInt16 => write!(f, "u16"),
            Type::UInt32 => write!(f, "uint"),
            Type::UInt64 => write!(f, "u64"),
            Type::Float32 => write!(f, "float"),
            Type::Float64 => write!(f, "double"),
            Type::Error => write!(f, "<error>"),
            Type::Pointer { base, is_const } => {
                if *is_const {
                    write!(f, "{}* const", base)
                } else {
                    write!(f, "{}*", base)
                }
            }
            Type::Reference {
                base,
                region,
                nullable,
                mutable,
            } => {
                if *nullable {
                    write!(f, "?")?;
                }
                write!(f, "&{} ", region)?;
                if !*mutable {
                    write!(f, "const ")?;
                }
                write!(f, "{}", base)
            }
            Type::Array { element, size } => match size {
                Some(n) => write!(f, "{}[{}]", element, n),
                None => write!(f, "{}[]", element),
            },
            Type::Struct { name, is_union, .. } => {
                if *is_union {
                    write!(f, "union {}", name)
                } else {
                    write!(f, "struct {}", name)
                }
            }
            Type::Enum { name, .. } => write!(f, "enum {}", name),
            Type::Function {
                ret,
                params,
                variadic,
            } => {
                let mut parts: Vec<String> = params.iter().map(|p| format!("{}", p)).collect();
                if *variadic {
                    parts.push("...".to_string());
                }
                write!(f, "fn {}({})", ret, parts.join(", "))
            }
            Type::Tuple { elements } => {
                let parts: Vec<_> = elements.iter().map(|t| format!("{}", t)).collect();
                write!(f, "({})", parts.join(", "))
            }
            Type::Optional { inner } => write!(f, "?{}", inner),
            Type::Slice { element } => write!(f, "[]{}", element),
            Type::Generic { name, .. } => write!(f, "{}", name),
            Type::Newtype { name, .. } => write!(f, "{}", name),
            Type::Typeof { .. } => write!(f, "typeof(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_reflexive() {
        let samples: Vec<TypeRef> = vec![
            Type::void(),
            Type::bool_(),
            Type::int32(),
            Type::uint64(),
            Type::float64(),
            Type::error(),
            Type::pointer(Type::int32(), false),
            Type::reference(Type::int32(), Region::Stack, false, true),
            Type::reference(Type::char_(), Region::Arena("scratch".into()), true, false),
            Type::array(Type::int8(), Some(16)),
            Type::named_struct("Point"),
            Type::function(Type::void(), vec![Type::int32()], false),
            Type::tuple(vec![Type::int32(), Type::bool_()]),
            Type::optional(Type::int32()),
            Type::slice(Type::uint8()),
            Type::generic("T", None),
            Type::newtype("Handle", Type::int64()),
        ];
        for ty in &samples {
            assert!(ty.equals(ty), "{} must equal itself", ty);
        }
    }

    #[test]
    fn test_structural_equality() {
        let a = Type::pointer(Type::int32(), false);
        let b = Type::pointer(Type::int32(), false);
        let c = Type::pointer(Type::int32(), true);
        assert!(a.equals(&b));
        assert!(!a.equals(&c));

        let r1 = Type::reference(Type::int32(), Region::Stack, false, true);
        let r2 = Type::reference(Type::int32(), Region::Heap, false, true);
        assert!(!r1.equals(&r2));

        let n1 = Type::reference(Type::int32(), Region::Stack, true, true);
        assert!(!r1.equals(&n1));
    }

    #[test]
    fn test_nominal_struct_equality() {
        // Two mentions of the same name are equal regardless of field
        // detail; different names never are.
        let a = Type::named_struct("Point");
        let b = Rc::new(Type::Struct {
            name: "Point".to_string(),
            fields: vec![StructField {
                name: "x".to_string(),
                ty: Type::int32(),
            }],
            is_union: false,
            packed: false,
            defined: true,
        });
        let c = Type::named_struct("Rect");
        assert!(a.equals(&b));
        assert!(!a.equals(&c));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Type::int32()), "int");
        assert_eq!(
            format!(
                "{}",
                Type::reference(Type::int32(), Region::Stack, false, true)
            ),
            "&stack int"
        );
        assert_eq!(
            format!(
                "{}",
                Type::reference(Type::int32(), Region::Stack, true, true)
            ),
            "?&stack int"
        );
        assert_eq!(format!("{}", Type::pointer(Type::char_(), false)), "char*");
        assert_eq!(
            format!("{}", Type::tuple(vec![Type::int32(), Type::bool_()])),
            "(int, bool)"
        );
        assert_eq!(format!("{}", Type::optional(Type::int32())), "?int");
        assert_eq!(format!("{}", Type::slice(Type::int64())), "[]i64");
    }

    #[test]
    fn test_mangle() {
        assert_eq!(Type::int32().mangle(), "int");
        assert_eq!(Type::pointer(Type::int32(), false).mangle(), "int_ptr");
        assert_eq!(
            Type::reference(Type::int32(), Region::Stack, false, true).mangle(),
            "int_stack_ref"
        );
        assert_eq!(Type::named_struct("Point").mangle(), "Point");
    }

    #[test]
    fn test_integer_classification() {
        assert!(Type::Bool.is_eight_bit());
        assert!(Type::Char.is_eight_bit());
        assert!(!Type::Int16.is_eight_bit());
        assert!(Type::UInt32.is_unsigned());
        assert!(!Type::Int32.is_unsigned());
        assert_eq!(Type::Int16.bit_width(), Some(16));
        assert_eq!(Type::Void.bit_width(), None);
    }
}
