//! Type lattice for Konpeito
//!
//! Types flow from three sources: RBS signature files (declared), literal
//! self-types (propagated), and Hindley-Milner inference (solved). The
//! lattice is deliberately small: a handful of unboxable primitives, a
//! handful of host-managed reference types, nominal class instances, unions,
//! function types, and native-class references.
//!
//! `Int`, `Float` and `Bool` are the unboxed scalars: values of these types
//! can live in machine registers (`i64` / `double`) between host-API
//! boundaries. Everything else is a `VALUE` at the emitter level.

use std::fmt;

/// A type in the Konpeito lattice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// 64-bit signed integer (unboxed as LLVM i64)
    Int,
    /// IEEE 754 double (unboxed as LLVM double)
    Float,
    /// Boolean (unboxed as i64 0/1 between host boundaries)
    Bool,
    /// Interned symbol
    Symbol,
    /// The nil singleton
    Nil,
    /// No value (void methods, statements)
    Unit,
    /// Host-managed string
    Str,
    /// Host-managed array
    Array,
    /// Host-managed hash
    Hash,
    /// Host-managed range
    Range,
    /// Host-managed regexp
    Regexp,
    /// Any boxed host value; the top of the lattice for dispatch purposes
    Value,
    /// Nominal class instance, possibly parameterized: `Box[Integer]`
    Class { name: String, args: Vec<Type> },
    /// Unordered union of at least two members; `T?` is `Union[T, Nil]`
    Union(Vec<Type>),
    /// Callable: parameter types, return type, may-raise flag
    Function {
        params: Vec<Type>,
        ret: Box<Type>,
        may_raise: bool,
    },
    /// Instance of a native class (C struct layout known at compile time).
    /// Distinct from `Class` because it designates struct layout, not just
    /// a nominal tag.
    Native(String),
    /// Inference-only type variable
    Var(String),
}

impl Type {
    /// Build a union, flattening nested unions, deduplicating, and
    /// collapsing singletons. Member order is normalized so that
    /// structurally equal unions compare equal.
    pub fn union(members: Vec<Type>) -> Type {
        let mut flat: Vec<Type> = Vec::new();
        for m in members {
            match m {
                Type::Union(inner) => {
                    for t in inner {
                        if !flat.contains(&t) {
                            flat.push(t);
                        }
                    }
                }
                other => {
                    if !flat.contains(&other) {
                        flat.push(other);
                    }
                }
            }
        }
        flat.sort_by_key(|t| t.sort_key());
        match flat.len() {
            0 => Type::Unit,
            1 => flat.pop().unwrap(),
            _ => Type::Union(flat),
        }
    }

    /// `T?` in signature syntax.
    pub fn optional(t: Type) -> Type {
        Type::union(vec![t, Type::Nil])
    }

    /// Stable ordering key for union normalization.
    fn sort_key(&self) -> String {
        format!("{}", self)
    }

    /// True for types represented as machine scalars between host-API
    /// boundaries.
    pub fn is_unboxed_scalar(&self) -> bool {
        matches!(self, Type::Int | Type::Float | Type::Bool)
    }

    /// True when a value of `self` is acceptable where `expected` is
    /// declared, under the lattice's admission rules: exact match, integer
    /// widening to float, union membership, and `Value` as top.
    pub fn admits(expected: &Type, actual: &Type) -> bool {
        if expected == actual {
            return true;
        }
        match (expected, actual) {
            (Type::Value, _) => true,
            (_, Type::Var(_)) | (Type::Var(_), _) => true,
            (Type::Float, Type::Int) => true,
            (Type::Union(members), actual) => {
                members.iter().any(|m| Type::admits(m, actual))
            }
            (expected, Type::Union(members)) => {
                members.iter().all(|m| Type::admits(expected, m))
            }
            (Type::Class { name, args }, Type::Class { name: n2, args: a2 }) => {
                name == n2
                    && args.len() == a2.len()
                    && args.iter().zip(a2).all(|(e, a)| Type::admits(e, a))
            }
            _ => false,
        }
    }

    /// The least upper bound of two types at a merge point. Identical types
    /// join to themselves, Int joins with Float to Float, and anything else
    /// joins to a union.
    pub fn join(a: Type, b: Type) -> Type {
        if a == b {
            return a;
        }
        match (&a, &b) {
            (Type::Int, Type::Float) | (Type::Float, Type::Int) => Type::Float,
            (Type::Unit, _) => b,
            (_, Type::Unit) => a,
            _ => Type::union(vec![a, b]),
        }
    }

    /// Map well-known constant names to lattice types; used when resolving
    /// `in Integer` type patterns and rescue class lists.
    pub fn from_constant_name(name: &str) -> Option<Type> {
        match name {
            "Integer" => Some(Type::Int),
            "Float" => Some(Type::Float),
            "String" => Some(Type::Str),
            "Symbol" => Some(Type::Symbol),
            "Array" => Some(Type::Array),
            "Hash" => Some(Type::Hash),
            "Range" => Some(Type::Range),
            "Regexp" => Some(Type::Regexp),
            "NilClass" => Some(Type::Nil),
            "TrueClass" | "FalseClass" => Some(Type::Bool),
            "Object" | "BasicObject" => Some(Type::Value),
            _ => None,
        }
    }

    /// The host constant a lattice type is tested against in `kind_of?`
    /// dispatch. Unboxed scalars map to their boxed class names.
    pub fn dispatch_class_name(&self) -> Option<&str> {
        match self {
            Type::Int => Some("Integer"),
            Type::Float => Some("Float"),
            Type::Bool => None,
            Type::Symbol => Some("Symbol"),
            Type::Nil => Some("NilClass"),
            Type::Str => Some("String"),
            Type::Array => Some("Array"),
            Type::Hash => Some("Hash"),
            Type::Range => Some("Range"),
            Type::Regexp => Some("Regexp"),
            Type::Class { name, .. } => Some(name),
            Type::Native(name) => Some(name),
            _ => None,
        }
    }

    /// True if the type contains a type variable anywhere.
    pub fn has_var(&self) -> bool {
        match self {
            Type::Var(_) => true,
            Type::Class { args, .. } => args.iter().any(Type::has_var),
            Type::Union(members) => members.iter().any(Type::has_var),
            Type::Function { params, ret, .. } => {
                params.iter().any(Type::has_var) || ret.has_var()
            }
            _ => false,
        }
    }

    /// Mangled suffix component for monomorphized specializations.
    pub fn mangle(&self) -> String {
        match self {
            Type::Int => "i64".to_string(),
            Type::Float => "f64".to_string(),
            Type::Bool => "b".to_string(),
            Type::Symbol => "sym".to_string(),
            Type::Nil => "nil".to_string(),
            Type::Unit => "unit".to_string(),
            Type::Str => "str".to_string(),
            Type::Array => "ary".to_string(),
            Type::Hash => "hash".to_string(),
            Type::Range => "rng".to_string(),
            Type::Regexp => "re".to_string(),
            Type::Value => "val".to_string(),
            Type::Class { name, args } => {
                let mut s = name.replace("::", "_");
                for a in args {
                    s.push('_');
                    s.push_str(&a.mangle());
                }
                s
            }
            Type::Union(members) => {
                let parts: Vec<String> = members.iter().map(Type::mangle).collect();
                format!("u_{}", parts.join("_"))
            }
            Type::Function { .. } => "fn".to_string(),
            Type::Native(name) => format!("n_{}", name.replace("::", "_")),
            Type::Var(name) => format!("v_{}", name),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int => write!(f, "Integer"),
            Type::Float => write!(f, "Float"),
            Type::Bool => write!(f, "bool"),
            Type::Symbol => write!(f, "Symbol"),
            Type::Nil => write!(f, "nil"),
            Type::Unit => write!(f, "void"),
            Type::Str => write!(f, "String"),
            Type::Array => write!(f, "Array"),
            Type::Hash => write!(f, "Hash"),
            Type::Range => write!(f, "Range"),
            Type::Regexp => write!(f, "Regexp"),
            Type::Value => write!(f, "untyped"),
            Type::Class { name, args } => {
                if args.is_empty() {
                    write!(f, "{}", name)
                } else {
                    let parts: Vec<String> = args.iter().map(|a| format!("{}", a)).collect();
                    write!(f, "{}[{}]", name, parts.join(", "))
                }
            }
            Type::Union(members) => {
                let parts: Vec<String> = members.iter().map(|m| format!("{}", m)).collect();
                write!(f, "({})", parts.join(" | "))
            }
            Type::Function { params, ret, may_raise } => {
                let parts: Vec<String> = params.iter().map(|p| format!("{}", p)).collect();
                write!(f, "({}) -> {}", parts.join(", "), ret)?;
                if *may_raise {
                    write!(f, " !")?;
                }
                Ok(())
            }
            Type::Native(name) => write!(f, "{}", name),
            Type::Var(name) => write!(f, "{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_flattens_and_dedups() {
        let u = Type::union(vec![
            Type::Int,
            Type::Union(vec![Type::Str, Type::Int]),
            Type::Str,
        ]);
        match u {
            Type::Union(members) => {
                assert_eq!(members.len(), 2);
                assert!(members.contains(&Type::Int));
                assert!(members.contains(&Type::Str));
            }
            other => panic!("expected union, got {:?}", other),
        }
    }

    #[test]
    fn test_union_of_one_collapses() {
        assert_eq!(Type::union(vec![Type::Int, Type::Int]), Type::Int);
    }

    #[test]
    fn test_optional_is_union_with_nil() {
        let opt = Type::optional(Type::Str);
        assert_eq!(opt, Type::union(vec![Type::Str, Type::Nil]));
    }

    #[test]
    fn test_union_order_normalized() {
        let a = Type::union(vec![Type::Int, Type::Str]);
        let b = Type::union(vec![Type::Str, Type::Int]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_admits_integer_widening() {
        assert!(Type::admits(&Type::Float, &Type::Int));
        assert!(!Type::admits(&Type::Int, &Type::Float));
    }

    #[test]
    fn test_admits_union_member() {
        let u = Type::union(vec![Type::Int, Type::Str]);
        assert!(Type::admits(&u, &Type::Int));
        assert!(Type::admits(&u, &Type::Str));
        assert!(!Type::admits(&u, &Type::Array));
    }

    #[test]
    fn test_admits_union_argument_requires_all_members() {
        let u = Type::union(vec![Type::Int, Type::Str]);
        // (Int | Str) is not acceptable where Int is declared
        assert!(!Type::admits(&Type::Int, &u));
        // but it is acceptable where (Int | Str | Nil) is declared
        let wider = Type::union(vec![Type::Int, Type::Str, Type::Nil]);
        assert!(Type::admits(&wider, &u));
    }

    #[test]
    fn test_admits_value_is_top() {
        assert!(Type::admits(&Type::Value, &Type::Int));
        assert!(Type::admits(&Type::Value, &Type::Native("Vector2".into())));
    }

    #[test]
    fn test_join_numeric() {
        assert_eq!(Type::join(Type::Int, Type::Float), Type::Float);
        assert_eq!(Type::join(Type::Int, Type::Int), Type::Int);
    }

    #[test]
    fn test_join_mixed_becomes_union() {
        let j = Type::join(Type::Int, Type::Str);
        assert!(matches!(j, Type::Union(_)));
    }

    #[test]
    fn test_unboxed_scalars() {
        assert!(Type::Int.is_unboxed_scalar());
        assert!(Type::Float.is_unboxed_scalar());
        assert!(Type::Bool.is_unboxed_scalar());
        assert!(!Type::Str.is_unboxed_scalar());
        assert!(!Type::Value.is_unboxed_scalar());
    }

    #[test]
    fn test_mangle_union() {
        let u = Type::union(vec![Type::Int, Type::Float]);
        assert_eq!(u.mangle(), "u_f64_i64");
    }

    #[test]
    fn test_has_var() {
        assert!(Type::Var("t0".into()).has_var());
        let c = Type::Class {
            name: "Box".into(),
            args: vec![Type::Var("t1".into())],
        };
        assert!(c.has_var());
        assert!(!Type::Int.has_var());
    }
}
