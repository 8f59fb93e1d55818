//! C shim generation
//!
//! The companion C translation unit that makes compiled code loadable: for
//! each native class a struct layout, GC mark callback, TypedData
//! descriptor, allocator, and accessor functions; argument-marshalling
//! wrappers for variadic functions; vtables in inheritance-preserving slot
//! order; and the `Init_<module>` entry point that registers modules,
//! classes (superclass first), methods, aliases, constants, and
//! class-variable initial values with the host interpreter.

use crate::hir::{mangle, symbol_for, ClassRecord, ConstValue, Function, ParamKind, Program};
use crate::sig::{FieldKind, SignatureRegistry};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

/// Classes the host interpreter already defines; reopening or subclassing
/// one resolves the existing handle instead of redefining it.
const KNOWN_HOST_CLASSES: &[&str] = &[
    "Object", "BasicObject", "String", "Integer", "Float", "Array", "Hash", "Range",
    "Symbol", "Regexp", "Exception", "StandardError", "RuntimeError", "ArgumentError",
    "TypeError", "NameError", "NoMethodError", "IndexError", "KeyError", "RangeError",
    "IOError", "ZeroDivisionError", "StopIteration", "NotImplementedError", "Comparable",
    "Enumerable", "Kernel", "Struct", "Thread", "Fiber", "Mutex", "Queue",
];

/// Generate the shim for one compiled program.
pub fn generate(
    program: &Program,
    registry: &SignatureRegistry,
    module_name: &str,
    profile: bool,
) -> Result<String, String> {
    let mut g = ShimGen {
        program,
        registry,
        out: String::new(),
        fn_by_key: program
            .functions
            .iter()
            .map(|f| (f.key.clone(), f))
            .collect(),
    };
    g.header(module_name, profile);
    g.extern_section();
    g.struct_section()?;
    g.wrapper_section();
    g.init_section(module_name, profile)?;
    Ok(g.out)
}

struct ShimGen<'a> {
    program: &'a Program,
    registry: &'a SignatureRegistry,
    out: String,
    fn_by_key: HashMap<String, &'a Function>,
}

fn c_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

fn const_expr(v: &ConstValue) -> String {
    match v {
        ConstValue::Int(i) => format!("LL2NUM({}LL)", i),
        ConstValue::Float(f) => format!("DBL2NUM({})", f),
        ConstValue::Str(s) => format!("rb_str_new_cstr(\"{}\")", c_escape(s)),
        ConstValue::Sym(s) => format!("ID2SYM(rb_intern(\"{}\"))", c_escape(s)),
        ConstValue::Bool(true) => "Qtrue".to_string(),
        ConstValue::Bool(false) => "Qfalse".to_string(),
        ConstValue::Nil => "Qnil".to_string(),
    }
}

impl<'a> ShimGen<'a> {
    fn header(&mut self, module_name: &str, profile: bool) {
        let _ = writeln!(self.out, "/* generated by konpeito for '{}' */", module_name);
        let _ = writeln!(self.out, "#include <ruby.h>");
        let _ = writeln!(self.out, "#include <string.h>");
        self.out.push('\n');
        if profile {
            let _ = writeln!(self.out, "extern void kp_prof_init(const char *path);");
            self.out.push('\n');
        }
    }

    /// Native classes in embedded-layout order: an embedded class's struct
    /// definition precedes the struct that embeds it. Reference fields do
    /// not create such a dependency.
    fn natives_in_layout_order(&self) -> Result<Vec<String>, String> {
        let mut names: Vec<String> = self
            .registry
            .classes
            .values()
            .filter(|c| c.annotations.native)
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        let mut ordered = Vec::with_capacity(names.len());
        let mut remaining: HashSet<String> = names.iter().cloned().collect();
        while !remaining.is_empty() {
            let mut progressed = false;
            for name in &names {
                if !remaining.contains(name) {
                    continue;
                }
                let def = self
                    .registry
                    .native_class_type(name)
                    .ok_or_else(|| format!("native class '{}' has no descriptor", name))?;
                let ready = def.fields.iter().all(|(_, k)| match k {
                    FieldKind::Embedded(dep) => !remaining.contains(dep),
                    _ => true,
                });
                if ready {
                    ordered.push(name.clone());
                    remaining.remove(name);
                    progressed = true;
                }
            }
            if !progressed {
                return Err(format!(
                    "native classes embed each other cyclically: {:?}",
                    remaining
                ));
            }
        }
        Ok(ordered)
    }

    fn struct_section(&mut self) -> Result<(), String> {
        let ordered = self.natives_in_layout_order()?;
        if ordered.is_empty() {
            return Ok(());
        }

        // forward declarations
        for name in &ordered {
            let _ = writeln!(self.out, "struct kp_{};", mangle(name));
        }
        self.out.push('\n');

        for name in &ordered {
            let def = self.registry.native_class_type(name).unwrap();
            let m = mangle(name);

            // struct definition: optional vptr first, fields in declared
            // order, embedded classes by value, references as VALUEs
            let _ = writeln!(self.out, "struct kp_{} {{", m);
            if def.annotations.vtable {
                let _ = writeln!(self.out, "    void **vptr;");
            }
            for (field, kind) in &def.fields {
                let decl = match kind {
                    FieldKind::Int64 => format!("long {};", field),
                    FieldKind::Float64 => format!("double {};", field),
                    FieldKind::Bool => format!("char {};", field),
                    FieldKind::Value | FieldKind::Ref(_) => format!("VALUE {};", field),
                    FieldKind::Embedded(c) => format!("struct kp_{} {};", mangle(c), field),
                };
                let _ = writeln!(self.out, "    {}", decl);
            }
            let _ = writeln!(self.out, "}};");
            self.out.push('\n');

            // GC mark: VALUE and reference fields, recursing into embedded
            // layouts
            let _ = writeln!(
                self.out,
                "static void kp_{}_mark_fields(struct kp_{} *p) {{",
                m, m
            );
            for (field, kind) in &def.fields {
                match kind {
                    FieldKind::Value | FieldKind::Ref(_) => {
                        let _ = writeln!(self.out, "    rb_gc_mark(p->{});", field);
                    }
                    FieldKind::Embedded(c) => {
                        let _ = writeln!(
                            self.out,
                            "    kp_{}_mark_fields(&p->{});",
                            mangle(c),
                            field
                        );
                    }
                    _ => {}
                }
            }
            let _ = writeln!(self.out, "}}");
            let _ = writeln!(
                self.out,
                "static void kp_{}_mark(void *ptr) {{ kp_{}_mark_fields(ptr); }}",
                m, m
            );
            self.out.push('\n');

            // TypedData descriptor; non-static so the compiled module can
            // unwrap instances
            let _ = writeln!(
                self.out,
                "const rb_data_type_t kp_{}_data_type = {{\n    \"{}\",\n    {{ kp_{}_mark, RUBY_TYPED_DEFAULT_FREE, NULL }},\n    NULL, NULL,\n    RUBY_TYPED_FREE_IMMEDIATELY,\n}};",
                m, name, m
            );
            self.out.push('\n');
        }

        // class handles for allocators and embedded-copy accessors
        for name in &ordered {
            let _ = writeln!(self.out, "static VALUE kp_c{};", mangle(name));
        }
        self.out.push('\n');

        // vtables: a subclass's table extends its parent's in place
        for name in &ordered {
            let def = self.registry.native_class_type(name).unwrap();
            if !def.annotations.vtable {
                continue;
            }
            let m = mangle(name);
            let layout = self.registry.vtable_layout(name);
            // resolve each slot to the most-derived implementation visible
            // from this class
            let mut entries = Vec::with_capacity(layout.len());
            for method in &layout {
                let owner = self.vtable_method_owner(name, method);
                let key = format!("{}#{}", owner, method);
                if !self.fn_by_key.contains_key(&key) {
                    // declared in signatures but compiled elsewhere
                    let argc = self
                        .registry
                        .resolve_overload(&owner, method, false, &[], &[])
                        .map(|s| s.params.len())
                        .unwrap_or(0);
                    let abi: Vec<&str> =
                        std::iter::once("VALUE").chain((0..argc).map(|_| "VALUE")).collect();
                    let _ = writeln!(
                        self.out,
                        "extern VALUE {}({});",
                        symbol_for(&key),
                        abi.join(", ")
                    );
                }
                entries.push(format!("(void *){}", symbol_for(&key)));
            }
            let _ = writeln!(
                self.out,
                "static void *const kp_{}_vtable[] = {{ {} }};",
                m,
                entries.join(", ")
            );
            self.out.push('\n');
        }

        // allocators and accessors
        for name in &ordered {
            let def = self.registry.native_class_type(name).unwrap();
            let m = mangle(name);

            let _ = writeln!(
                self.out,
                "static VALUE kp_{}_alloc(VALUE klass) {{",
                m
            );
            let _ = writeln!(
                self.out,
                "    struct kp_{} *p;\n    VALUE obj = TypedData_Make_Struct(klass, struct kp_{}, &kp_{}_data_type, p);",
                m, m, m
            );
            self.init_fields(&m, &def.fields, def.annotations.vtable);
            let _ = writeln!(self.out, "    return obj;");
            let _ = writeln!(self.out, "}}");
            self.out.push('\n');

            for (field, kind) in &def.fields {
                self.accessor_pair(name, &m, field, kind);
            }
        }
        Ok(())
    }

    /// Zero primitives, nil references, and point the vptr at the class's
    /// vtable. Embedded structs initialize recursively.
    fn init_fields(&mut self, m: &str, fields: &[(String, FieldKind)], vtable: bool) {
        if vtable {
            let _ = writeln!(self.out, "    p->vptr = (void **)kp_{}_vtable;", m);
        }
        for (field, kind) in fields {
            match kind {
                FieldKind::Int64 => {
                    let _ = writeln!(self.out, "    p->{} = 0;", field);
                }
                FieldKind::Float64 => {
                    let _ = writeln!(self.out, "    p->{} = 0.0;", field);
                }
                FieldKind::Bool => {
                    let _ = writeln!(self.out, "    p->{} = 0;", field);
                }
                FieldKind::Value | FieldKind::Ref(_) => {
                    let _ = writeln!(self.out, "    p->{} = Qnil;", field);
                }
                FieldKind::Embedded(_) => {
                    let _ = writeln!(
                        self.out,
                        "    memset(&p->{}, 0, sizeof(p->{}));",
                        field, field
                    );
                }
            }
        }
    }

    /// Getter/setter pair converting between host values and native
    /// fields, with full copy semantics for embedded structs. Non-static:
    /// the compiled module calls these for embedded and reference fields.
    fn accessor_pair(&mut self, class: &str, m: &str, field: &str, kind: &FieldKind) {
        let getter = format!("kp_{}_attr_get_{}", m, field);
        let setter = format!("kp_{}_attr_set_{}", m, field);
        let _ = writeln!(self.out, "VALUE {}(VALUE self) {{", getter);
        let _ = writeln!(
            self.out,
            "    struct kp_{} *p;\n    TypedData_Get_Struct(self, struct kp_{}, &kp_{}_data_type, p);",
            m, m, m
        );
        match kind {
            FieldKind::Int64 => {
                let _ = writeln!(self.out, "    return LL2NUM(p->{});", field);
            }
            FieldKind::Float64 => {
                let _ = writeln!(self.out, "    return DBL2NUM(p->{});", field);
            }
            FieldKind::Bool => {
                let _ = writeln!(self.out, "    return p->{} ? Qtrue : Qfalse;", field);
            }
            FieldKind::Value | FieldKind::Ref(_) => {
                let _ = writeln!(self.out, "    return p->{};", field);
            }
            FieldKind::Embedded(c) => {
                let cm = mangle(c);
                let _ = writeln!(
                    self.out,
                    "    VALUE out = kp_{}_alloc(kp_c{});\n    struct kp_{} *q;\n    TypedData_Get_Struct(out, struct kp_{}, &kp_{}_data_type, q);\n    *q = p->{};\n    return out;",
                    cm, cm, cm, cm, cm, field
                );
            }
        }
        let _ = writeln!(self.out, "}}");

        let _ = writeln!(self.out, "void {}(VALUE self, VALUE v) {{", setter);
        let _ = writeln!(
            self.out,
            "    struct kp_{} *p;\n    TypedData_Get_Struct(self, struct kp_{}, &kp_{}_data_type, p);",
            m, m, m
        );
        match kind {
            FieldKind::Int64 => {
                let _ = writeln!(self.out, "    p->{} = NUM2LL(v);", field);
            }
            FieldKind::Float64 => {
                let _ = writeln!(self.out, "    p->{} = NUM2DBL(v);", field);
            }
            FieldKind::Bool => {
                let _ = writeln!(self.out, "    p->{} = RTEST(v) ? 1 : 0;", field);
            }
            FieldKind::Value | FieldKind::Ref(_) => {
                let _ = writeln!(self.out, "    p->{} = v;", field);
            }
            FieldKind::Embedded(c) => {
                let cm = mangle(c);
                let _ = writeln!(
                    self.out,
                    "    struct kp_{} *q;\n    TypedData_Get_Struct(v, struct kp_{}, &kp_{}_data_type, q);\n    p->{} = *q;",
                    cm, cm, cm, field
                );
            }
        }
        let _ = writeln!(self.out, "}}");
        // ruby-callable setter wrapper (methods return their argument)
        let _ = writeln!(
            self.out,
            "static VALUE kp_{}_set_{}_m(VALUE self, VALUE v) {{ {}(self, v); return v; }}",
            m, field, setter
        );
        self.out.push('\n');
    }

    /// The most-derived class at or above `class` that defines `method`.
    fn vtable_method_owner(&self, class: &str, method: &str) -> String {
        let mut cur = Some(class.to_string());
        while let Some(name) = cur {
            if let Some(sig) = self.registry.classes.get(&name) {
                if sig.methods.contains_key(method) {
                    return name;
                }
                cur = sig.superclass.clone();
            } else {
                break;
            }
        }
        class.to_string()
    }

    /// Extern declarations for every compiled function the shim registers.
    fn extern_section(&mut self) {
        for f in &self.program.functions {
            if !matches!(f.kind, crate::hir::FnKind::Plain) {
                continue;
            }
            let abi: Vec<&str> = std::iter::once("VALUE")
                .chain(
                    f.params
                        .iter()
                        .filter(|p| {
                            !matches!(
                                p.kind,
                                ParamKind::Keyword | ParamKind::KeywordOptional
                            )
                        })
                        .map(|_| "VALUE"),
                )
                .collect();
            let _ = writeln!(
                self.out,
                "extern VALUE {}({});",
                symbol_for(&f.key),
                abi.join(", ")
            );
        }
        self.out.push('\n');
    }

    fn needs_wrapper(f: &Function) -> bool {
        f.variadic
            || f.params.iter().any(|p| {
                !matches!(p.kind, ParamKind::Required)
            })
    }

    /// Ruby→native argument-marshalling wrappers for functions whose
    /// parameter lists go beyond plain required positionals. Registered
    /// with arity -1 (the variadic convention).
    fn wrapper_section(&mut self) {
        for f in &self.program.functions {
            if !matches!(f.kind, crate::hir::FnKind::Plain) || !Self::needs_wrapper(f) {
                continue;
            }
            let sym = symbol_for(&f.key);
            let _ = writeln!(
                self.out,
                "static VALUE kpw_{}(int argc, VALUE *argv, VALUE self) {{",
                mangle(&f.key)
            );

            let has_kw = f.params.iter().any(|p| {
                matches!(
                    p.kind,
                    ParamKind::Keyword | ParamKind::KeywordOptional | ParamKind::KeywordRest
                )
            });
            if has_kw {
                let _ = writeln!(
                    self.out,
                    "    VALUE kw = Qnil;\n    if (argc > 0 && RB_TYPE_P(argv[argc - 1], T_HASH)) {{ kw = argv[--argc]; }}\n    if (NIL_P(kw)) kw = rb_hash_new();"
                );
            }

            let required: Vec<&crate::hir::FnParam> = f
                .params
                .iter()
                .filter(|p| p.kind == ParamKind::Required)
                .collect();
            let optional: Vec<&crate::hir::FnParam> = f
                .params
                .iter()
                .filter(|p| p.kind == ParamKind::Optional)
                .collect();
            let has_rest = f.params.iter().any(|p| p.kind == ParamKind::Rest);

            let _ = writeln!(
                self.out,
                "    if (argc < {}) rb_raise(rb_eArgError, \"wrong number of arguments (given %d, expected {}{})\", argc);",
                required.len(),
                required.len(),
                if has_rest || !optional.is_empty() { "+" } else { "" },
            );

            let mut call_args: Vec<String> = vec!["self".to_string()];
            for (i, p) in required.iter().enumerate() {
                let _ = writeln!(self.out, "    VALUE a_{} = argv[{}];", p.name, i);
                call_args.push(format!("a_{}", p.name));
            }
            for (j, p) in optional.iter().enumerate() {
                let idx = required.len() + j;
                let _ = writeln!(
                    self.out,
                    "    VALUE a_{} = (argc > {}) ? argv[{}] : Qundef;",
                    p.name, idx, idx
                );
                call_args.push(format!("a_{}", p.name));
            }
            if has_rest {
                let fixed = required.len() + optional.len();
                let _ = writeln!(
                    self.out,
                    "    VALUE rest = (argc > {fixed}) ? rb_ary_new_from_values(argc - {fixed}, argv + {fixed}) : rb_ary_new();",
                    fixed = fixed
                );
                call_args.push("rest".to_string());
            }
            if has_kw {
                call_args.push("kw".to_string());
            }
            if f.params.iter().any(|p| p.kind == ParamKind::Block) {
                let _ = writeln!(
                    self.out,
                    "    VALUE blk = rb_block_given_p() ? rb_block_proc() : Qnil;"
                );
                call_args.push("blk".to_string());
            }
            let _ = writeln!(self.out, "    return {}({});", sym, call_args.join(", "));
            let _ = writeln!(self.out, "}}");
            self.out.push('\n');
        }
    }

    /// Register a method under the right visibility with either the direct
    /// compiled symbol or the variadic wrapper.
    fn define_method_line(
        &self,
        target: &str,
        class: Option<&ClassRecord>,
        key: &str,
        singleton: bool,
    ) -> Option<String> {
        let f = self.fn_by_key.get(key)?;
        let (sym, arity) = if Self::needs_wrapper(f) {
            (format!("kpw_{}", mangle(key)), -1)
        } else {
            (
                symbol_for(key),
                f.params
                    .iter()
                    .filter(|p| p.kind == ParamKind::Required)
                    .count() as i32,
            )
        };
        let definer = if singleton {
            "rb_define_singleton_method"
        } else if class
            .map(|c| c.private_methods.contains(&f.name))
            .unwrap_or(false)
        {
            "rb_define_private_method"
        } else if class
            .map(|c| c.protected_methods.contains(&f.name))
            .unwrap_or(false)
        {
            "rb_define_protected_method"
        } else {
            "rb_define_method"
        };
        Some(format!(
            "    {}({}, \"{}\", {}, {});",
            definer,
            target,
            c_escape(&f.name),
            sym,
            arity
        ))
    }

    /// Classes in topological order: a user-defined superclass in the same
    /// unit comes strictly before its subclasses.
    fn classes_in_topo_order(&self) -> Vec<&'a ClassRecord> {
        let by_name: HashMap<&str, &ClassRecord> = self
            .program
            .classes
            .iter()
            .map(|c| (c.name.as_str(), c))
            .collect();
        let mut ordered: Vec<&ClassRecord> = Vec::new();
        let mut placed: HashSet<&str> = HashSet::new();
        fn place<'c>(
            c: &'c ClassRecord,
            by_name: &HashMap<&str, &'c ClassRecord>,
            placed: &mut HashSet<&'c str>,
            ordered: &mut Vec<&'c ClassRecord>,
        ) {
            if placed.contains(c.name.as_str()) {
                return;
            }
            if let Some(sup) = &c.superclass {
                if let Some(parent) = by_name.get(sup.as_str()) {
                    place(parent, by_name, placed, ordered);
                }
            }
            placed.insert(c.name.as_str());
            ordered.push(c);
        }
        for c in &self.program.classes {
            place(c, &by_name, &mut placed, &mut ordered);
        }
        ordered
    }

    fn init_section(&mut self, module_name: &str, profile: bool) -> Result<(), String> {
        let _ = writeln!(self.out, "void Init_{}(void) {{", module_name);
        if profile {
            let _ = writeln!(
                self.out,
                "    kp_prof_init(\"{}_profile.json\");",
                module_name
            );
        }

        // modules, with their methods, singletons, and constants
        let modules: Vec<_> = self.program.modules.iter().cloned().collect();
        for m in &modules {
            let var = format!("m_{}", mangle(&m.name));
            let _ = writeln!(
                self.out,
                "    VALUE {} = rb_define_module(\"{}\");",
                var, m.name
            );
            for key in &m.instance_methods {
                if let Some(line) = self.define_method_line(&var, None, key, false) {
                    let _ = writeln!(self.out, "{}", line);
                }
            }
            for key in &m.singleton_methods {
                if let Some(line) = self.define_method_line(&var, None, key, true) {
                    let _ = writeln!(self.out, "{}", line);
                }
            }
            for (name, value) in &m.constants {
                let _ = writeln!(
                    self.out,
                    "    rb_define_const({}, \"{}\", {});",
                    var,
                    name,
                    const_expr(value)
                );
            }
        }

        // native classes: allocator, accessors, methods
        let natives = self.natives_in_layout_order()?;
        let native_set: HashSet<&str> = natives.iter().map(String::as_str).collect();
        for name in &natives {
            let def = self.registry.native_class_type(name).unwrap();
            let m = mangle(name);
            let superclass = match &def.superclass {
                Some(s) if native_set.contains(s.as_str()) => format!("kp_c{}", mangle(s)),
                Some(s) => format!(
                    "rb_const_get(rb_cObject, rb_intern(\"{}\"))",
                    c_escape(s)
                ),
                None => "rb_cObject".to_string(),
            };
            let _ = writeln!(
                self.out,
                "    kp_c{} = rb_define_class(\"{}\", {});",
                m, name, superclass
            );
            let _ = writeln!(
                self.out,
                "    rb_define_alloc_func(kp_c{}, kp_{}_alloc);",
                m, m
            );
            for (field, _) in &def.fields {
                let _ = writeln!(
                    self.out,
                    "    rb_define_method(kp_c{}, \"{}\", kp_{}_attr_get_{}, 0);",
                    m, field, m, field
                );
                let _ = writeln!(
                    self.out,
                    "    rb_define_method(kp_c{}, \"{}=\", kp_{}_set_{}_m, 1);",
                    m, field, m, field
                );
            }
            // methods compiled from source bodies
            if let Some(record) = self.program.classes.iter().find(|c| c.name == *name) {
                for key in &record.instance_methods {
                    if let Some(line) =
                        self.define_method_line(&format!("kp_c{}", m), Some(record), key, false)
                    {
                        let _ = writeln!(self.out, "{}", line);
                    }
                }
                for key in &record.singleton_methods {
                    if let Some(line) =
                        self.define_method_line(&format!("kp_c{}", m), Some(record), key, true)
                    {
                        let _ = writeln!(self.out, "{}", line);
                    }
                }
            }
        }

        // non-native classes, superclass strictly first
        for c in self.classes_in_topo_order() {
            if native_set.contains(c.name.as_str()) {
                continue;
            }
            let var = format!("c_{}", mangle(&c.name));
            let known = KNOWN_HOST_CLASSES.contains(&c.name.as_str());
            if known {
                // a host core class is never redefined
                let _ = writeln!(
                    self.out,
                    "    VALUE {} = rb_const_get(rb_cObject, rb_intern(\"{}\"));",
                    var,
                    c_escape(&c.name)
                );
            } else if c.reopened {
                // re-opened: retrieve the existing class when the host
                // already has one, define it otherwise
                let _ = writeln!(
                    self.out,
                    "    VALUE {} = rb_const_defined(rb_cObject, rb_intern(\"{}\"))\n        ? rb_const_get(rb_cObject, rb_intern(\"{}\"))\n        : rb_define_class(\"{}\", rb_cObject);",
                    var,
                    c_escape(&c.name),
                    c_escape(&c.name),
                    c_escape(&c.name)
                );
            } else {
                let superclass = match &c.superclass {
                    Some(s)
                        if self.program.classes.iter().any(|x| x.name == *s)
                            && !KNOWN_HOST_CLASSES.contains(&s.as_str()) =>
                    {
                        format!("c_{}", mangle(s))
                    }
                    Some(s) => format!(
                        "rb_const_get(rb_cObject, rb_intern(\"{}\"))",
                        c_escape(s)
                    ),
                    None => "rb_cObject".to_string(),
                };
                let _ = writeln!(
                    self.out,
                    "    VALUE {} = rb_define_class(\"{}\", {});",
                    var, c.name, superclass
                );
            }

            // prepend, include, extend — in that order
            for module in &c.prepends {
                let _ = writeln!(
                    self.out,
                    "    rb_prepend_module({}, rb_const_get(rb_cObject, rb_intern(\"{}\")));",
                    var,
                    c_escape(module)
                );
            }
            for module in &c.includes {
                let _ = writeln!(
                    self.out,
                    "    rb_include_module({}, rb_const_get(rb_cObject, rb_intern(\"{}\")));",
                    var,
                    c_escape(module)
                );
            }
            for module in &c.extends {
                let _ = writeln!(
                    self.out,
                    "    rb_extend_object({}, rb_const_get(rb_cObject, rb_intern(\"{}\")));",
                    var,
                    c_escape(module)
                );
            }

            for key in &c.instance_methods {
                if let Some(line) = self.define_method_line(&var, Some(c), key, false) {
                    let _ = writeln!(self.out, "{}", line);
                }
            }
            for key in &c.singleton_methods {
                if let Some(line) = self.define_method_line(&var, Some(c), key, true) {
                    let _ = writeln!(self.out, "{}", line);
                }
            }
            for (new_name, old_name) in &c.aliases {
                let _ = writeln!(
                    self.out,
                    "    rb_define_alias({}, \"{}\", \"{}\");",
                    var,
                    c_escape(new_name),
                    c_escape(old_name)
                );
            }
            for (name, value) in &c.constants {
                let _ = writeln!(
                    self.out,
                    "    rb_define_const({}, \"{}\", {});",
                    var,
                    name,
                    const_expr(value)
                );
            }
            for (name, value) in &c.cvar_inits {
                let _ = writeln!(
                    self.out,
                    "    rb_cv_set({}, \"{}\", {});",
                    var,
                    c_escape(name),
                    const_expr(value)
                );
            }
        }

        // top-level functions become private methods on Object
        for f in &self.program.functions {
            if f.owner.is_some()
                || f.key == "__main__"
                || !matches!(f.kind, crate::hir::FnKind::Plain)
            {
                continue;
            }
            // monomorphized specializations are internal call targets,
            // not user-visible methods
            if f.key != f.name {
                continue;
            }
            let (sym, arity) = if Self::needs_wrapper(f) {
                (format!("kpw_{}", mangle(&f.key)), -1)
            } else {
                (
                    symbol_for(&f.key),
                    f.params
                        .iter()
                        .filter(|p| p.kind == ParamKind::Required)
                        .count() as i32,
                )
            };
            let _ = writeln!(
                self.out,
                "    rb_define_global_function(\"{}\", {}, {});",
                c_escape(&f.name),
                sym,
                arity
            );
        }

        // top-level statements run at load time
        if self.program.function("__main__").is_some() {
            let _ = writeln!(self.out, "    {}(rb_cObject);", symbol_for("__main__"));
        }
        let _ = writeln!(self.out, "}}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cst::Root;
    use crate::hir::lower;
    use crate::tast;

    fn compile_shim(json: &str, rbs: &str) -> String {
        let root = Root::from_json(json).unwrap();
        let mut registry = SignatureRegistry::new();
        if !rbs.is_empty() {
            registry.load_document(rbs, "test.rbs").unwrap();
            registry.finalize().unwrap();
        }
        let mut tp = tast::build::build(&root, &registry).unwrap();
        crate::infer::run(&mut tp).unwrap();
        let p = lower::lower(&tp).unwrap();
        generate(&p, &registry, "demo", false).unwrap()
    }

    #[test]
    fn test_native_struct_layout_and_registration() {
        let c = compile_shim(
            r#"{"body": [{"kind": "class_def", "name": "Vector2", "superclass": null,
                 "body": [{"kind": "def", "name": "length_squared", "params": {"list": []},
                           "body": [{"kind": "float", "value": 0.0}]}]}]}"#,
            "%a{native}\nclass Vector2\n  @x: Float\n  @y: Float\n  def length_squared: () -> Float\nend\n",
        );
        assert!(c.contains("struct kp_Vector2 {"), "{}", c);
        assert!(c.contains("double x;"), "{}", c);
        assert!(c.contains("double y;"), "{}", c);
        assert!(c.contains("const rb_data_type_t kp_Vector2_data_type"), "{}", c);
        assert!(c.contains("TypedData_Make_Struct"), "{}", c);
        assert!(c.contains("rb_define_alloc_func(kp_cVector2, kp_Vector2_alloc);"), "{}", c);
        // accessors registered for both fields, method for the body
        assert!(c.contains("rb_define_method(kp_cVector2, \"x\", kp_Vector2_attr_get_x, 0);"), "{}", c);
        assert!(c.contains("rb_define_method(kp_cVector2, \"x=\", kp_Vector2_set_x_m, 1);"), "{}", c);
        assert!(c.contains("\"length_squared\", kp_Vector2_i_length_squared, 0"), "{}", c);
    }

    #[test]
    fn test_embedded_struct_precedes_embedder() {
        let c = compile_shim(
            r#"{"body": []}"#,
            "%a{native}\n%a{struct}\nclass Point\n  @x: Float\nend\n\
             %a{native}\nclass Node\n  @pos: Point\nend\n",
        );
        let point_at = c.find("struct kp_Point {").expect("Point struct");
        let node_at = c.find("struct kp_Node {").expect("Node struct");
        assert!(point_at < node_at, "embedded layout must precede embedder");
        assert!(c.contains("struct kp_Point pos;"), "{}", c);
        // embedded copy semantics in the accessor
        assert!(c.contains("*q = p->pos;"), "{}", c);
    }

    #[test]
    fn test_vtable_extends_parent_in_place() {
        let c = compile_shim(
            r#"{"body": []}"#,
            "%a{native: vtable}\nclass Animal\n  def speak: () -> String\nend\n\
             %a{native: vtable}\nclass Dog < Animal\n  def speak: () -> String\n  def fetch: () -> void\nend\n",
        );
        assert!(c.contains("void **vptr;"), "{}", c);
        assert!(c.contains("kp_Animal_vtable[] = { (void *)kp_Animal_i_speak }"), "{}", c);
        assert!(
            c.contains("kp_Dog_vtable[] = { (void *)kp_Dog_i_speak, (void *)kp_Dog_i_fetch }"),
            "{}",
            c
        );
        assert!(c.contains("p->vptr = (void **)kp_Dog_vtable;"), "{}", c);
    }

    #[test]
    fn test_superclass_defined_before_subclass() {
        let c = compile_shim(
            r#"{"body": [
                 {"kind": "class_def", "name": "Dog", "superclass": "Animal",
                  "body": [{"kind": "def", "name": "speak", "params": {"list": []},
                            "body": [{"kind": "str", "value": "woof"}]}]},
                 {"kind": "class_def", "name": "Animal", "superclass": null,
                  "body": [{"kind": "def", "name": "age", "params": {"list": []},
                            "body": [{"kind": "int", "value": 0}]}]}]}"#,
            "",
        );
        let animal_at = c.find("rb_define_class(\"Animal\"").expect("Animal defined");
        let dog_at = c.find("rb_define_class(\"Dog\"").expect("Dog defined");
        assert!(animal_at < dog_at, "superclass must be defined first:\n{}", c);
        assert!(c.contains("rb_define_class(\"Dog\", c_Animal)"), "{}", c);
    }

    #[test]
    fn test_reopened_class_resolves_existing_handle() {
        let c = compile_shim(
            r#"{"body": [
                 {"kind": "class_def", "name": "Widget", "superclass": null,
                  "body": [{"kind": "def", "name": "a", "params": {"list": []},
                            "body": [{"kind": "nil"}]}]},
                 {"kind": "class_def", "name": "Widget", "superclass": null,
                  "body": [{"kind": "def", "name": "b", "params": {"list": []},
                            "body": [{"kind": "nil"}]}]}]}"#,
            "",
        );
        // merged into one record; the initializer retrieves an existing
        // class and only defines on first load
        assert!(c.contains("rb_const_defined(rb_cObject, rb_intern(\"Widget\"))"), "{}", c);
        assert!(c.contains("rb_const_get(rb_cObject, rb_intern(\"Widget\"))"), "{}", c);
    }

    #[test]
    fn test_visibility_and_aliases_and_mixins() {
        let c = compile_shim(
            r#"{"body": [{"kind": "class_def", "name": "Svc", "superclass": null,
                 "body": [
                   {"kind": "call", "receiver": null, "name": "prepend",
                    "args": [{"kind": "const", "name": "Logged"}]},
                   {"kind": "call", "receiver": null, "name": "include",
                    "args": [{"kind": "const", "name": "Mixin"}]},
                   {"kind": "call", "receiver": null, "name": "extend",
                    "args": [{"kind": "const", "name": "Helpers"}]},
                   {"kind": "def", "name": "run", "params": {"list": []},
                    "body": [{"kind": "nil"}]},
                   {"kind": "call", "receiver": null, "name": "private", "args": []},
                   {"kind": "def", "name": "hidden", "params": {"list": []},
                    "body": [{"kind": "nil"}]},
                   {"kind": "alias_decl", "new_name": "go", "old_name": "run"}]}]}"#,
            "",
        );
        let prepend_at = c.find("rb_prepend_module").unwrap();
        let include_at = c.find("rb_include_module").unwrap();
        let extend_at = c.find("rb_extend_object").unwrap();
        assert!(prepend_at < include_at && include_at < extend_at);
        assert!(c.contains("rb_define_private_method(c_Svc, \"hidden\""), "{}", c);
        assert!(c.contains("rb_define_method(c_Svc, \"run\""), "{}", c);
        assert!(c.contains("rb_define_alias(c_Svc, \"go\", \"run\");"), "{}", c);
    }

    #[test]
    fn test_variadic_function_registers_with_minus_one() {
        let c = compile_shim(
            r#"{"body": [{"kind": "def", "name": "greet",
                 "params": {"list": [{"name": "name", "label": "keyword"}]},
                 "body": [{"kind": "lvar", "name": "name"}]}]}"#,
            "",
        );
        assert!(c.contains("static VALUE kpw_greet(int argc, VALUE *argv, VALUE self)"), "{}", c);
        assert!(c.contains("rb_define_global_function(\"greet\", kpw_greet, -1);"), "{}", c);
        assert!(c.contains("RB_TYPE_P(argv[argc - 1], T_HASH)"), "{}", c);
    }

    #[test]
    fn test_main_runs_at_load_and_constants_registered() {
        let c = compile_shim(
            r#"{"body": [
                 {"kind": "class_def", "name": "Cfg", "superclass": null,
                  "body": [
                    {"kind": "const_assign", "name": "MAX",
                     "value": {"kind": "int", "value": 100}},
                    {"kind": "assign", "target": {"kind": "cvar", "name": "@@count"},
                     "value": {"kind": "int", "value": 0}}]},
                 {"kind": "call", "receiver": null, "name": "puts",
                  "args": [{"kind": "str", "value": "loaded"}]}]}"#,
            "",
        );
        assert!(c.contains("rb_define_const(c_Cfg, \"MAX\", LL2NUM(100LL));"), "{}", c);
        assert!(c.contains("rb_cv_set(c_Cfg, \"@@count\", LL2NUM(0LL));"), "{}", c);
        assert!(c.contains("kp___main__(rb_cObject);"), "{}", c);
        assert!(c.contains("void Init_demo(void)"), "{}", c);
    }
}
