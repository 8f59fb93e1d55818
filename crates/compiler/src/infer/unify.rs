//! Type unification
//!
//! Hindley-Milner style unification over the Konpeito lattice: type
//! variables bind to anything (with an occurs check), identical concrete
//! types unify trivially, and a few lattice-aware accommodations keep
//! dynamic code checkable — `untyped` and `nil` unify with everything, and
//! integers unify with floats (widening). Everything else is a provable
//! conflict and fails.

use crate::types::Type;
use std::collections::HashMap;

/// Substitution from variable names to types.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subst {
    pub types: HashMap<String, Type>,
}

impl Subst {
    pub fn empty() -> Self {
        Subst::default()
    }

    /// Apply the substitution, recursively, to a type.
    pub fn apply(&self, ty: &Type) -> Type {
        match ty {
            Type::Var(name) => match self.types.get(name) {
                // chase chains: a var may be bound to another var
                Some(t) if t != ty => self.apply(t),
                Some(t) => t.clone(),
                None => ty.clone(),
            },
            Type::Class { name, args } => Type::Class {
                name: name.clone(),
                args: args.iter().map(|a| self.apply(a)).collect(),
            },
            Type::Union(members) => {
                Type::union(members.iter().map(|m| self.apply(m)).collect())
            }
            Type::Function { params, ret, may_raise } => Type::Function {
                params: params.iter().map(|p| self.apply(p)).collect(),
                ret: Box::new(self.apply(ret)),
                may_raise: *may_raise,
            },
            _ => ty.clone(),
        }
    }

    /// Compose: apply `other` after `self`.
    pub fn compose(&self, other: &Subst) -> Subst {
        let mut types = HashMap::new();
        for (k, v) in &self.types {
            types.insert(k.clone(), other.apply(v));
        }
        for (k, v) in &other.types {
            types.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Subst { types }
    }

    pub fn bind(&mut self, name: &str, ty: Type) {
        self.types.insert(name.to_string(), ty);
    }
}

/// Occurs check: would binding `var := ty` create an infinite type?
fn occurs(var: &str, ty: &Type) -> bool {
    match ty {
        Type::Var(name) => name == var,
        Type::Class { args, .. } => args.iter().any(|a| occurs(var, a)),
        Type::Union(members) => members.iter().any(|m| occurs(var, m)),
        Type::Function { params, ret, .. } => {
            params.iter().any(|p| occurs(var, p)) || occurs(var, ret)
        }
        _ => false,
    }
}

/// Unify two types, returning the substitution that makes them equal.
pub fn unify(t1: &Type, t2: &Type) -> Result<Subst, String> {
    match (t1, t2) {
        _ if t1 == t2 => Ok(Subst::empty()),

        (Type::Var(name), ty) | (ty, Type::Var(name)) => {
            if occurs(name, ty) {
                return Err(format!(
                    "Occurs check failed: cannot unify {} with {} (would create an infinite type)",
                    Type::Var(name.clone()),
                    ty
                ));
            }
            let mut s = Subst::empty();
            s.bind(name, ty.clone());
            Ok(s)
        }

        // untyped is compatible with everything
        (Type::Value, _) | (_, Type::Value) => Ok(Subst::empty()),
        // nil flows into any reference position
        (Type::Nil, _) | (_, Type::Nil) => Ok(Subst::empty()),
        // integer widening
        (Type::Int, Type::Float) | (Type::Float, Type::Int) => Ok(Subst::empty()),
        // statement results may be discarded
        (Type::Unit, _) | (_, Type::Unit) => Ok(Subst::empty()),

        (Type::Class { name: n1, args: a1 }, Type::Class { name: n2, args: a2 }) => {
            if n1 != n2 || a1.len() != a2.len() {
                return Err(format!("Type conflict: cannot unify {} with {}", t1, t2));
            }
            let mut subst = Subst::empty();
            for (x, y) in a1.iter().zip(a2) {
                let s = unify(&subst.apply(x), &subst.apply(y))?;
                subst = subst.compose(&s);
            }
            Ok(subst)
        }

        (
            Type::Function { params: p1, ret: r1, .. },
            Type::Function { params: p2, ret: r2, .. },
        ) => {
            if p1.len() != p2.len() {
                return Err(format!(
                    "Type conflict: callable arity mismatch between {} and {}",
                    t1, t2
                ));
            }
            let mut subst = Subst::empty();
            for (x, y) in p1.iter().zip(p2) {
                let s = unify(&subst.apply(x), &subst.apply(y))?;
                subst = subst.compose(&s);
            }
            let s = unify(&subst.apply(r1), &subst.apply(r2))?;
            Ok(subst.compose(&s))
        }

        (Type::Union(_), other) | (other, Type::Union(_)) => {
            let (u, t) = if matches!(t1, Type::Union(_)) { (t1, t2) } else { (t2, t1) };
            if Type::admits(u, t) || Type::admits(t, u) {
                Ok(Subst::empty())
            } else {
                Err(format!("Type conflict: cannot unify {} with {}", u, other))
            }
        }

        _ => Err(format!("Type conflict: cannot unify {} with {}", t1, t2)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unify_identical() {
        assert!(unify(&Type::Int, &Type::Int).is_ok());
        assert!(unify(&Type::Str, &Type::Str).is_ok());
    }

    #[test]
    fn test_unify_variable_binds() {
        let s = unify(&Type::Var("t0".into()), &Type::Int).unwrap();
        assert_eq!(s.apply(&Type::Var("t0".into())), Type::Int);
    }

    #[test]
    fn test_unify_conflict() {
        let err = unify(&Type::Int, &Type::Str).unwrap_err();
        assert!(err.contains("Type conflict"));
    }

    #[test]
    fn test_unify_widening_and_untyped() {
        assert!(unify(&Type::Int, &Type::Float).is_ok());
        assert!(unify(&Type::Value, &Type::Str).is_ok());
        assert!(unify(&Type::Nil, &Type::Array).is_ok());
    }

    #[test]
    fn test_unify_class_args() {
        let a = Type::Class { name: "Box".into(), args: vec![Type::Var("t0".into())] };
        let b = Type::Class { name: "Box".into(), args: vec![Type::Int] };
        let s = unify(&a, &b).unwrap();
        assert_eq!(s.apply(&Type::Var("t0".into())), Type::Int);
    }

    #[test]
    fn test_unify_class_name_conflict() {
        let a = Type::Class { name: "Box".into(), args: vec![] };
        let b = Type::Class { name: "Crate".into(), args: vec![] };
        assert!(unify(&a, &b).is_err());
    }

    #[test]
    fn test_occurs_check() {
        let v = Type::Var("t0".into());
        let inf = Type::Class { name: "List".into(), args: vec![Type::Var("t0".into())] };
        let err = unify(&v, &inf).unwrap_err();
        assert!(err.contains("Occurs check"));
    }

    #[test]
    fn test_apply_chases_chains() {
        let mut s = Subst::empty();
        s.bind("t0", Type::Var("t1".into()));
        s.bind("t1", Type::Int);
        assert_eq!(s.apply(&Type::Var("t0".into())), Type::Int);
    }

    #[test]
    fn test_compose() {
        let mut s1 = Subst::empty();
        s1.bind("t0", Type::Var("t1".into()));
        let mut s2 = Subst::empty();
        s2.bind("t1", Type::Int);
        let c = s1.compose(&s2);
        assert_eq!(c.apply(&Type::Var("t0".into())), Type::Int);
        assert_eq!(c.apply(&Type::Var("t1".into())), Type::Int);
    }

    #[test]
    fn test_union_unifies_with_member() {
        let u = Type::union(vec![Type::Int, Type::Str]);
        assert!(unify(&u, &Type::Int).is_ok());
        assert!(unify(&u, &Type::Array).is_err());
    }
}
