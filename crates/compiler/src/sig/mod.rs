//! Signature registry
//!
//! Loads RBS-style signature documents (see [`parser`]) and merges them into
//! a single registry that the typed-AST builder and the C shim generator
//! query: class and module types, method signatures with overloads, native
//! class descriptors (fields, annotations, vtables), and the set of FFI
//! libraries that the linker must pull in.
//!
//! Loader failures are fatal to the compilation: an unknown class referenced
//! by a superclass or field, a malformed signature document, or a
//! conflicting redeclaration all abort with a diagnostic.

pub mod parser;

use crate::types::Type;
use std::collections::{BTreeSet, HashMap};

/// A single method signature as declared in a signature file.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSig {
    pub params: Vec<Type>,
    pub param_names: Vec<String>,
    pub ret: Type,
    /// `-> self` in the declaration; `ret` is then the owning class type
    pub returns_self: bool,
}

/// All declared overloads of one method, plus method-level annotations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodEntry {
    pub overloads: Vec<MethodSig>,
    /// `%a{cfunc: name=...}`: direct C-level call, no wrapper generated
    pub cfunc: Option<String>,
}

/// Class-level annotations carried from `%a{...}` markers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Annotations {
    /// `%a{native}` or any of the refinements below
    pub native: bool,
    /// `%a{native: vtable}`: dispatch through a function-pointer table
    pub vtable: bool,
    /// `%a{struct}`: value semantics, passed by value and copied
    pub struct_semantics: bool,
    /// `%a{ffi: lib=...}` accumulated library names
    pub ffi_libs: Vec<String>,
}

/// How one field of a native class is laid out in its C struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// `long` slot
    Int64,
    /// `double` slot
    Float64,
    /// `bool` slot
    Bool,
    /// Host-interpreter-managed VALUE (string/array/hash/opaque); GC-marked
    Value,
    /// Another native class embedded by value (struct-in-struct)
    Embedded(String),
    /// VALUE holding a wrapped pointer to another native class; never
    /// embedded, always GC-marked
    Ref(String),
}

/// Layout and method table of one native class.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeClassDef {
    pub name: String,
    pub superclass: Option<String>,
    /// Declared order is layout order
    pub fields: Vec<(String, FieldKind)>,
    /// Instance methods in declaration order (vtable slot order)
    pub methods: Vec<(String, MethodSig)>,
    pub annotations: Annotations,
}

/// Signature record for one class (native or not).
#[derive(Debug, Clone, Default)]
pub struct ClassSig {
    pub name: String,
    pub type_params: Vec<String>,
    pub superclass: Option<String>,
    pub ivars: Vec<(String, Type)>,
    pub methods: HashMap<String, MethodEntry>,
    pub singleton_methods: HashMap<String, MethodEntry>,
    /// Declaration order of instance methods, for stable vtable slots
    pub method_order: Vec<String>,
    pub constants: HashMap<String, Type>,
    pub annotations: Annotations,
}

/// Signature record for one module.
#[derive(Debug, Clone, Default)]
pub struct ModuleSig {
    pub name: String,
    pub methods: HashMap<String, MethodEntry>,
    pub singleton_methods: HashMap<String, MethodEntry>,
    pub constants: HashMap<String, Type>,
}

/// The merged view over every loaded signature document.
#[derive(Debug, Default)]
pub struct SignatureRegistry {
    pub classes: HashMap<String, ClassSig>,
    pub modules: HashMap<String, ModuleSig>,
}

impl SignatureRegistry {
    pub fn new() -> Self {
        SignatureRegistry::default()
    }

    /// Parse one signature document and merge it in. Conflicting
    /// redeclarations are fatal.
    pub fn load_document(&mut self, source: &str, origin: &str) -> Result<(), String> {
        let doc = parser::parse_document(source)
            .map_err(|e| format!("{}: {}", origin, e))?;
        for class in doc.classes {
            self.merge_class(class, origin)?;
        }
        for module in doc.modules {
            self.merge_module(module, origin)?;
        }
        Ok(())
    }

    /// Validate cross-references after all documents are loaded. Unknown
    /// class references are fatal; a `struct` class with a reference field
    /// degrades that field to `Value` with a warning (validation policy).
    pub fn finalize(&mut self) -> Result<(), String> {
        let known: BTreeSet<String> = self.classes.keys().cloned().collect();
        for class in self.classes.values() {
            if let Some(sup) = &class.superclass {
                if !known.contains(sup) && Type::from_constant_name(sup).is_none() {
                    return Err(format!(
                        "Class '{}' references unknown superclass '{}'",
                        class.name, sup
                    ));
                }
            }
        }
        // struct-class invariant: no reference fields
        let natives: Vec<String> = self
            .classes
            .values()
            .filter(|c| c.annotations.native && c.annotations.struct_semantics)
            .map(|c| c.name.clone())
            .collect();
        for name in natives {
            let def = self.native_class_type(&name).ok_or_else(|| {
                format!("Internal: '{}' vanished during finalize", name)
            })?;
            for (field, kind) in &def.fields {
                if let FieldKind::Ref(target) = kind {
                    tracing::warn!(
                        class = %name,
                        field = %field,
                        target = %target,
                        "struct class may not contain reference fields; \
                         degrading field to a plain VALUE"
                    );
                    let class = self.classes.get_mut(&name).unwrap();
                    for iv in class.ivars.iter_mut() {
                        if iv.0 == *field {
                            iv.1 = Type::Value;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn merge_class(&mut self, incoming: ClassSig, origin: &str) -> Result<(), String> {
        match self.classes.get_mut(&incoming.name) {
            None => {
                self.classes.insert(incoming.name.clone(), incoming);
                Ok(())
            }
            Some(existing) => {
                if existing.superclass != incoming.superclass
                    && incoming.superclass.is_some()
                    && existing.superclass.is_some()
                {
                    return Err(format!(
                        "{}: conflicting redeclaration of class '{}': \
                         superclass '{}' vs '{}'",
                        origin,
                        incoming.name,
                        existing.superclass.as_deref().unwrap_or("-"),
                        incoming.superclass.as_deref().unwrap_or("-"),
                    ));
                }
                if existing.superclass.is_none() {
                    existing.superclass = incoming.superclass;
                }
                for (name, entry) in incoming.methods {
                    if let Some(prev) = existing.methods.get(&name) {
                        if *prev != entry {
                            return Err(format!(
                                "{}: conflicting redeclaration of method '{}#{}'",
                                origin, incoming.name, name
                            ));
                        }
                    } else {
                        existing.method_order.push(name.clone());
                        existing.methods.insert(name, entry);
                    }
                }
                for (name, entry) in incoming.singleton_methods {
                    if let Some(prev) = existing.singleton_methods.get(&name) {
                        if *prev != entry {
                            return Err(format!(
                                "{}: conflicting redeclaration of method '{}.{}'",
                                origin, incoming.name, name
                            ));
                        }
                    } else {
                        existing.singleton_methods.insert(name, entry);
                    }
                }
                for iv in incoming.ivars {
                    if !existing.ivars.iter().any(|(n, _)| *n == iv.0) {
                        existing.ivars.push(iv);
                    }
                }
                existing.constants.extend(incoming.constants);
                let ann = &mut existing.annotations;
                ann.native |= incoming.annotations.native;
                ann.vtable |= incoming.annotations.vtable;
                ann.struct_semantics |= incoming.annotations.struct_semantics;
                for lib in incoming.annotations.ffi_libs {
                    if !ann.ffi_libs.contains(&lib) {
                        ann.ffi_libs.push(lib);
                    }
                }
                Ok(())
            }
        }
    }

    fn merge_module(&mut self, incoming: ModuleSig, origin: &str) -> Result<(), String> {
        match self.modules.get_mut(&incoming.name) {
            None => {
                self.modules.insert(incoming.name.clone(), incoming);
                Ok(())
            }
            Some(existing) => {
                for (name, entry) in incoming.methods {
                    if existing.methods.insert(name.clone(), entry).is_some() {
                        return Err(format!(
                            "{}: conflicting redeclaration of module method '{}#{}'",
                            origin, incoming.name, name
                        ));
                    }
                }
                for (name, entry) in incoming.singleton_methods {
                    existing.singleton_methods.insert(name, entry);
                }
                existing.constants.extend(incoming.constants);
                Ok(())
            }
        }
    }

    /// Is `name` declared as a native class?
    pub fn is_native_class(&self, name: &str) -> bool {
        self.classes
            .get(name)
            .map(|c| c.annotations.native)
            .unwrap_or(false)
    }

    /// Build the layout descriptor for a native class. Field kinds are
    /// derived from ivar types: primitives map to scalar slots, native
    /// `struct` classes embed by value, other native classes become
    /// GC-marked references, and everything else is a plain VALUE slot.
    pub fn native_class_type(&self, name: &str) -> Option<NativeClassDef> {
        let class = self.classes.get(name)?;
        if !class.annotations.native {
            return None;
        }
        let fields = class
            .ivars
            .iter()
            .map(|(field, ty)| {
                let kind = match ty {
                    Type::Int => FieldKind::Int64,
                    Type::Float => FieldKind::Float64,
                    Type::Bool => FieldKind::Bool,
                    Type::Class { name: cn, .. } | Type::Native(cn) => {
                        match self.classes.get(cn) {
                            Some(target) if target.annotations.native => {
                                if target.annotations.struct_semantics {
                                    FieldKind::Embedded(cn.clone())
                                } else {
                                    FieldKind::Ref(cn.clone())
                                }
                            }
                            _ => FieldKind::Value,
                        }
                    }
                    _ => FieldKind::Value,
                };
                (field.trim_start_matches('@').to_string(), kind)
            })
            .collect();
        let methods = class
            .method_order
            .iter()
            .filter_map(|m| {
                class
                    .methods
                    .get(m)
                    .and_then(|e| e.overloads.first())
                    .map(|sig| (m.clone(), sig.clone()))
            })
            .collect();
        Some(NativeClassDef {
            name: class.name.clone(),
            superclass: class.superclass.clone(),
            fields,
            methods,
            annotations: class.annotations.clone(),
        })
    }

    /// Is this method a direct C call (`%a{cfunc}`)?
    pub fn cfunc_method(&self, class: &str, method: &str, singleton: bool) -> Option<&str> {
        let class = self.classes.get(class)?;
        let table = if singleton {
            &class.singleton_methods
        } else {
            &class.methods
        };
        table.get(method)?.cfunc.as_deref()
    }

    /// Resolve a method call against declared overloads: the first overload
    /// whose parameter types admit the argument types wins (integer widening
    /// to float allowed). Generic class parameters are substituted from
    /// `type_args` before admission.
    pub fn resolve_overload(
        &self,
        class: &str,
        method: &str,
        singleton: bool,
        type_args: &[Type],
        arg_types: &[Type],
    ) -> Option<MethodSig> {
        let class_sig = self.classes.get(class)?;
        let table = if singleton {
            &class_sig.singleton_methods
        } else {
            &class_sig.methods
        };
        let entry = table.get(method)?;
        let subst: HashMap<&str, &Type> = class_sig
            .type_params
            .iter()
            .map(String::as_str)
            .zip(type_args.iter())
            .collect();
        for overload in &entry.overloads {
            let params: Vec<Type> = overload
                .params
                .iter()
                .map(|p| substitute(p, &subst))
                .collect();
            if params.len() == arg_types.len()
                && params.iter().zip(arg_types).all(|(p, a)| Type::admits(p, a))
            {
                let mut sig = overload.clone();
                sig.params = params;
                sig.ret = if sig.returns_self {
                    Type::Class {
                        name: class.to_string(),
                        args: type_args.to_vec(),
                    }
                } else {
                    substitute(&sig.ret, &subst)
                };
                return Some(sig);
            }
        }
        None
    }

    /// Look up a module-level function signature (module singleton method or
    /// a top-level function declared under `class Object`).
    pub fn resolve_function(&self, name: &str, arg_types: &[Type]) -> Option<MethodSig> {
        self.resolve_overload("Object", name, false, &[], arg_types)
    }

    /// Vtable slot order for a vtable class: the superclass's layout comes
    /// first so an override keeps its parent's index; new methods append.
    pub fn vtable_layout(&self, name: &str) -> Vec<String> {
        let Some(class) = self.classes.get(name) else {
            return Vec::new();
        };
        let mut slots = match &class.superclass {
            Some(sup) if self.is_native_class(sup) => self.vtable_layout(sup),
            _ => Vec::new(),
        };
        for m in &class.method_order {
            if !slots.contains(m) {
                slots.push(m.clone());
            }
        }
        slots
    }

    /// Every library named by an `ffi` annotation, for the linker.
    pub fn ffi_libraries(&self) -> BTreeSet<String> {
        self.classes
            .values()
            .flat_map(|c| c.annotations.ffi_libs.iter().cloned())
            .collect()
    }
}

/// Substitute class-scoped generic parameters into a declared type.
fn substitute(ty: &Type, subst: &HashMap<&str, &Type>) -> Type {
    match ty {
        Type::Var(name) => subst.get(name.as_str()).cloned().cloned().unwrap_or_else(|| ty.clone()),
        Type::Class { name, args } => {
            // A bare reference to a type parameter parses as a class name
            if args.is_empty() {
                if let Some(t) = subst.get(name.as_str()) {
                    return (*t).clone();
                }
            }
            Type::Class {
                name: name.clone(),
                args: args.iter().map(|a| substitute(a, subst)).collect(),
            }
        }
        Type::Union(members) => {
            Type::union(members.iter().map(|m| substitute(m, subst)).collect())
        }
        Type::Function { params, ret, may_raise } => Type::Function {
            params: params.iter().map(|p| substitute(p, subst)).collect(),
            ret: Box::new(substitute(ret, subst)),
            may_raise: *may_raise,
        },
        _ => ty.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_from(doc: &str) -> SignatureRegistry {
        let mut reg = SignatureRegistry::new();
        reg.load_document(doc, "test.rbs").expect("document should load");
        reg.finalize().expect("finalize should pass");
        reg
    }

    #[test]
    fn test_native_class_layout() {
        let reg = registry_from(
            "%a{native}\n\
             class Vector2\n\
             \x20 @x: Float\n\
             \x20 @y: Float\n\
             \x20 def length_squared: () -> Float\n\
             end\n",
        );
        assert!(reg.is_native_class("Vector2"));
        let def = reg.native_class_type("Vector2").unwrap();
        assert_eq!(
            def.fields,
            vec![
                ("x".to_string(), FieldKind::Float64),
                ("y".to_string(), FieldKind::Float64),
            ]
        );
        assert_eq!(def.methods.len(), 1);
        assert_eq!(def.methods[0].0, "length_squared");
    }

    #[test]
    fn test_embedded_vs_reference_fields() {
        let reg = registry_from(
            "%a{native}\n%a{struct}\nclass Point\n  @x: Float\n  @y: Float\nend\n\
             %a{native}\nclass Node\n  @pos: Point\n  @next: Node\nend\n",
        );
        let def = reg.native_class_type("Node").unwrap();
        assert_eq!(def.fields[0], ("pos".into(), FieldKind::Embedded("Point".into())));
        assert_eq!(def.fields[1], ("next".into(), FieldKind::Ref("Node".into())));
    }

    #[test]
    fn test_struct_with_reference_field_degrades() {
        let mut reg = SignatureRegistry::new();
        reg.load_document(
            "%a{native}\nclass Heavy\n  @n: Integer\nend\n\
             %a{native}\n%a{struct}\nclass Holder\n  @h: Heavy\nend\n",
            "test.rbs",
        )
        .unwrap();
        reg.finalize().unwrap();
        let def = reg.native_class_type("Holder").unwrap();
        // degraded from Ref(Heavy) to plain Value
        assert_eq!(def.fields[0], ("h".into(), FieldKind::Value));
    }

    #[test]
    fn test_overload_resolution_picks_first_admitting() {
        let reg = registry_from(
            "class Calc\n\
             \x20 def add: (Integer a, Integer b) -> Integer\n\
             \x20       | (Float a, Float b) -> Float\n\
             end\n",
        );
        let sig = reg
            .resolve_overload("Calc", "add", false, &[], &[Type::Int, Type::Int])
            .unwrap();
        assert_eq!(sig.ret, Type::Int);
        // integer widening admits the float overload
        let sig = reg
            .resolve_overload("Calc", "add", false, &[], &[Type::Float, Type::Int])
            .unwrap();
        assert_eq!(sig.ret, Type::Float);
        assert!(reg
            .resolve_overload("Calc", "add", false, &[], &[Type::Str, Type::Int])
            .is_none());
    }

    #[test]
    fn test_generic_substitution() {
        let reg = registry_from(
            "class Box[T]\n\
             \x20 def get: () -> T\n\
             \x20 def put: (T v) -> self\n\
             end\n",
        );
        let sig = reg
            .resolve_overload("Box", "get", false, &[Type::Int], &[])
            .unwrap();
        assert_eq!(sig.ret, Type::Int);
        let sig = reg
            .resolve_overload("Box", "put", false, &[Type::Str], &[Type::Str])
            .unwrap();
        assert_eq!(
            sig.ret,
            Type::Class { name: "Box".into(), args: vec![Type::Str] }
        );
    }

    #[test]
    fn test_unknown_superclass_is_fatal() {
        let mut reg = SignatureRegistry::new();
        reg.load_document("class Dog < Animal\nend\n", "test.rbs").unwrap();
        let err = reg.finalize().unwrap_err();
        assert!(err.contains("unknown superclass 'Animal'"));
    }

    #[test]
    fn test_conflicting_redeclaration_is_fatal() {
        let mut reg = SignatureRegistry::new();
        reg.load_document("class A < Q\nend\nclass Q\nend\n", "a.rbs").unwrap();
        let err = reg
            .load_document("class A < R\nend\nclass R\nend\n", "b.rbs")
            .unwrap_err();
        assert!(err.contains("conflicting redeclaration"));
    }

    #[test]
    fn test_cfunc_and_ffi_annotations() {
        let reg = registry_from(
            "%a{native}\n%a{ffi: lib=m}\n\
             class Trig\n\
             \x20 %a{cfunc: name=kp_trig_sin}\n\
             \x20 def sin: (Float x) -> Float\n\
             end\n",
        );
        assert_eq!(reg.cfunc_method("Trig", "sin", false), Some("kp_trig_sin"));
        assert_eq!(reg.cfunc_method("Trig", "cos", false), None);
        assert!(reg.ffi_libraries().contains("m"));
    }

    #[test]
    fn test_vtable_layout_preserves_parent_slots() {
        let reg = registry_from(
            "%a{native: vtable}\nclass Animal\n  def speak: () -> String\n  def age: () -> Integer\nend\n\
             %a{native: vtable}\nclass Dog < Animal\n  def speak: () -> String\n  def fetch: () -> void\nend\n",
        );
        let parent = reg.vtable_layout("Animal");
        let child = reg.vtable_layout("Dog");
        assert_eq!(parent, vec!["speak", "age"]);
        assert_eq!(child, vec!["speak", "age", "fetch"]);
        // the override keeps the parent's index
        assert_eq!(
            parent.iter().position(|m| m == "speak"),
            child.iter().position(|m| m == "speak")
        );
    }

    #[test]
    fn test_toplevel_functions_under_object() {
        let reg = registry_from(
            "class Object\n\
             \x20 def choose_int: (bool c) -> Integer\n\
             end\n",
        );
        let sig = reg.resolve_function("choose_int", &[Type::Bool]).unwrap();
        assert_eq!(sig.ret, Type::Int);
    }
}
