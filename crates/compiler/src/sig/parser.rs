//! RBS-subset signature parser
//!
//! Parses the declarative signature documents consumed by the signature
//! loader. The supported subset covers what compiled extensions need:
//!
//! ```text
//! %a{native: vtable}
//! class Body < Entity
//!   @x: Float
//!   %a{cfunc: name=kp_body_speed}
//!   def speed: (Float dt) -> Float
//!   def self.make: () -> Body
//!   def find: (Integer id) -> (Body | nil)
//!   MAX: Integer
//! end
//!
//! module Geometry
//!   def self.area: (Float w, Float h) -> Float
//! end
//! ```
//!
//! Overloads continue on lines starting with `|`. Annotations (`%a{...}`)
//! attach to the next class, module, or method line. Malformed input is
//! fatal with a line-numbered diagnostic.

use super::{Annotations, ClassSig, MethodEntry, MethodSig, ModuleSig};
use crate::types::Type;

/// Everything declared by one signature document.
#[derive(Debug, Default)]
pub struct Document {
    pub classes: Vec<ClassSig>,
    pub modules: Vec<ModuleSig>,
}

enum Scope {
    Class(ClassSig),
    Module(ModuleSig),
}

/// Parse a whole signature document.
pub fn parse_document(source: &str) -> Result<Document, String> {
    let mut doc = Document::default();
    let mut stack: Vec<Scope> = Vec::new();
    let mut pending_ann = Annotations::default();
    let mut pending_method_ann: Option<String> = None;
    // (scope depth, method name, singleton) of the last def, for `|` lines
    let mut last_def: Option<(String, bool)> = None;

    for (idx, raw) in source.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(body) = line.strip_prefix("%a{").and_then(|r| r.strip_suffix('}')) {
            apply_annotation(body, &mut pending_ann, &mut pending_method_ann)
                .map_err(|e| format!("line {}: {}", lineno, e))?;
            continue;
        }

        if line == "end" {
            match stack.pop() {
                Some(Scope::Class(c)) => {
                    if let Some(Scope::Module(m)) = stack.last() {
                        let mut c = c;
                        c.name = format!("{}::{}", m.name, c.name);
                        doc.classes.push(c);
                    } else {
                        doc.classes.push(c);
                    }
                }
                Some(Scope::Module(m)) => doc.modules.push(m),
                None => return Err(format!("line {}: unmatched 'end'", lineno)),
            }
            last_def = None;
            continue;
        }

        if let Some(rest) = line.strip_prefix("class ") {
            let mut class = parse_class_header(rest)
                .map_err(|e| format!("line {}: {}", lineno, e))?;
            class.annotations = std::mem::take(&mut pending_ann);
            stack.push(Scope::Class(class));
            last_def = None;
            continue;
        }

        if let Some(rest) = line.strip_prefix("module ") {
            let name = rest.trim();
            if name.is_empty() || !name.chars().next().unwrap().is_uppercase() {
                return Err(format!("line {}: malformed module name '{}'", lineno, name));
            }
            pending_ann = Annotations::default();
            stack.push(Scope::Module(ModuleSig {
                name: name.to_string(),
                ..ModuleSig::default()
            }));
            last_def = None;
            continue;
        }

        let scope = stack
            .last_mut()
            .ok_or_else(|| format!("line {}: declaration outside class/module", lineno))?;

        if let Some(rest) = line.strip_prefix("def ") {
            let (name, singleton, sig) = parse_def_line(rest)
                .map_err(|e| format!("line {}: {}", lineno, e))?;
            let entry_cfunc = pending_method_ann.take();
            add_method(scope, &name, singleton, sig, entry_cfunc);
            last_def = Some((name, singleton));
            continue;
        }

        if let Some(rest) = line.strip_prefix('|') {
            let (name, singleton) = last_def.clone().ok_or_else(|| {
                format!("line {}: overload continuation without a preceding def", lineno)
            })?;
            let sig = parse_method_sig(rest.trim())
                .map_err(|e| format!("line {}: {}", lineno, e))?;
            add_method(scope, &name, singleton, sig, None);
            continue;
        }

        if line.starts_with('@') {
            let (name, ty) = split_typed_decl(line)
                .map_err(|e| format!("line {}: {}", lineno, e))?;
            match scope {
                Scope::Class(c) => c.ivars.push((name, ty)),
                Scope::Module(_) => {
                    return Err(format!(
                        "line {}: instance variable declared in module",
                        lineno
                    ))
                }
            }
            continue;
        }

        if line.chars().next().unwrap().is_uppercase() && line.contains(':') {
            let (name, ty) = split_typed_decl(line)
                .map_err(|e| format!("line {}: {}", lineno, e))?;
            match scope {
                Scope::Class(c) => {
                    c.constants.insert(name, ty);
                }
                Scope::Module(m) => {
                    m.constants.insert(name, ty);
                }
            }
            continue;
        }

        return Err(format!("line {}: malformed signature line '{}'", lineno, line));
    }

    if !stack.is_empty() {
        return Err("unexpected end of document: unclosed class or module".to_string());
    }
    Ok(doc)
}

fn apply_annotation(
    body: &str,
    pending: &mut Annotations,
    pending_method: &mut Option<String>,
) -> Result<(), String> {
    let body = body.trim();
    if body == "native" {
        pending.native = true;
    } else if body == "native: vtable" {
        pending.native = true;
        pending.vtable = true;
    } else if body == "struct" {
        pending.struct_semantics = true;
        pending.native = true;
    } else if let Some(name) = body.strip_prefix("cfunc: name=") {
        *pending_method = Some(name.trim().to_string());
    } else if let Some(lib) = body.strip_prefix("ffi: lib=") {
        pending.ffi_libs.push(lib.trim().to_string());
    } else {
        return Err(format!("unknown annotation '%a{{{}}}'", body));
    }
    Ok(())
}

fn add_method(
    scope: &mut Scope,
    name: &str,
    singleton: bool,
    sig: MethodSig,
    cfunc: Option<String>,
) {
    let (table, order) = match scope {
        Scope::Class(c) => {
            if singleton {
                (&mut c.singleton_methods, None)
            } else {
                (&mut c.methods, Some(&mut c.method_order))
            }
        }
        Scope::Module(m) => {
            if singleton {
                (&mut m.singleton_methods, None)
            } else {
                (&mut m.methods, None)
            }
        }
    };
    let entry = table.entry(name.to_string()).or_insert_with(|| {
        if let Some(order) = order {
            order.push(name.to_string());
        }
        MethodEntry::default()
    });
    if cfunc.is_some() {
        entry.cfunc = cfunc;
    }
    entry.overloads.push(sig);
}

/// `Name`, `Name < Super`, `Name[T, U]`, `Name[T] < Super`
fn parse_class_header(rest: &str) -> Result<ClassSig, String> {
    let (head, superclass) = match rest.split_once('<') {
        Some((h, s)) => (h.trim(), Some(s.trim().to_string())),
        None => (rest.trim(), None),
    };
    let (name, type_params) = match head.split_once('[') {
        Some((n, params)) => {
            let params = params
                .strip_suffix(']')
                .ok_or_else(|| format!("malformed type parameter list in '{}'", head))?;
            let list: Vec<String> = params
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            (n.trim().to_string(), list)
        }
        None => (head.to_string(), Vec::new()),
    };
    if name.is_empty() || !name.chars().next().unwrap().is_uppercase() {
        return Err(format!("malformed class name '{}'", name));
    }
    Ok(ClassSig {
        name,
        type_params,
        superclass,
        ..ClassSig::default()
    })
}

/// `name: (params) -> Ret` with optional `self.` prefix.
fn parse_def_line(rest: &str) -> Result<(String, bool, MethodSig), String> {
    let rest = rest.trim();
    let (rest, singleton) = match rest.strip_prefix("self.") {
        Some(r) => (r, true),
        None => (rest, false),
    };
    let colon = rest
        .find(':')
        .ok_or_else(|| format!("missing ':' after method name in 'def {}'", rest))?;
    let name = rest[..colon].trim().to_string();
    if name.is_empty() {
        return Err("empty method name".to_string());
    }
    let sig = parse_method_sig(rest[colon + 1..].trim())?;
    Ok((name, singleton, sig))
}

/// `(Type name, ?Type name, *Type name, key: Type) -> Ret`
fn parse_method_sig(text: &str) -> Result<MethodSig, String> {
    let text = text.trim();
    if !text.starts_with('(') {
        return Err(format!("method signature must start with '(': '{}'", text));
    }
    let close = matching_paren(text)
        .ok_or_else(|| format!("unbalanced parentheses in '{}'", text))?;
    let params_text = &text[1..close];
    let after = text[close + 1..].trim();
    let ret_text = after
        .strip_prefix("->")
        .ok_or_else(|| format!("missing '->' in method signature '{}'", text))?
        .trim();

    let mut params = Vec::new();
    let mut param_names = Vec::new();
    for piece in split_top_level(params_text) {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let (ty, name) = parse_param(piece)?;
        params.push(ty);
        param_names.push(name);
    }

    let (ret, returns_self) = if ret_text == "self" {
        (Type::Unit, true)
    } else {
        (parse_type(ret_text)?, false)
    };
    Ok(MethodSig { params, param_names, ret, returns_self })
}

/// One comma-separated parameter.
fn parse_param(piece: &str) -> Result<(Type, String), String> {
    // strip markers that do not affect the declared type
    let piece = piece
        .strip_prefix("**")
        .or_else(|| piece.strip_prefix('*'))
        .or_else(|| piece.strip_prefix('?'))
        .unwrap_or(piece)
        .trim();

    // keyword form: `name: Type`
    if let Some((head, tail)) = piece.split_once(':') {
        let head = head.trim();
        if !head.is_empty()
            && head.chars().next().unwrap().is_lowercase()
            && head.chars().all(|c| c.is_alphanumeric() || c == '_')
        {
            let ty = parse_type(tail.trim())?;
            return Ok((ty, head.to_string()));
        }
    }

    // positional form: `Type` or `Type name`
    match piece.rsplit_once(' ') {
        Some((ty_text, name))
            if name.chars().next().map(char::is_lowercase).unwrap_or(false) =>
        {
            Ok((parse_type(ty_text.trim())?, name.trim().to_string()))
        }
        _ => Ok((parse_type(piece)?, String::new())),
    }
}

/// `@x: Float` or `MAX: Integer`.
fn split_typed_decl(line: &str) -> Result<(String, Type), String> {
    let (name, ty_text) = line
        .split_once(':')
        .ok_or_else(|| format!("missing ':' in declaration '{}'", line))?;
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(format!("missing name in declaration '{}'", line));
    }
    Ok((name, parse_type(ty_text.trim())?))
}

fn matching_paren(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in text.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&text[start..]);
    out
}

/// Parse one type expression: unions (`A | B`), optionals (`T?`),
/// parenthesized groups, and generic applications (`Box[Integer]`).
pub fn parse_type(text: &str) -> Result<Type, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty type expression".to_string());
    }
    let mut members = Vec::new();
    for piece in split_union(text) {
        members.push(parse_postfix(piece.trim())?);
    }
    Ok(Type::union(members))
}

fn split_union(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in text.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            '|' if depth == 0 => {
                out.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&text[start..]);
    out
}

fn parse_postfix(text: &str) -> Result<Type, String> {
    let text = text.trim();
    if let Some(inner) = text.strip_suffix('?') {
        return Ok(Type::optional(parse_postfix(inner)?));
    }
    if text.starts_with('(') {
        let close = matching_paren(text)
            .ok_or_else(|| format!("unbalanced parentheses in type '{}'", text))?;
        if close != text.len() - 1 {
            return Err(format!("trailing characters after ')' in type '{}'", text));
        }
        return parse_type(&text[1..close]);
    }
    parse_named(text)
}

fn parse_named(text: &str) -> Result<Type, String> {
    let (name, args) = match text.split_once('[') {
        Some((n, rest)) => {
            let rest = rest
                .strip_suffix(']')
                .ok_or_else(|| format!("unbalanced '[' in type '{}'", text))?;
            let args = split_top_level(rest)
                .into_iter()
                .map(|a| parse_type(a.trim()))
                .collect::<Result<Vec<_>, _>>()?;
            (n.trim(), args)
        }
        None => (text, Vec::new()),
    };

    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == ':')
    {
        return Err(format!("malformed type name '{}'", name));
    }

    Ok(match name {
        "Integer" => Type::Int,
        "Float" => Type::Float,
        "bool" => Type::Bool,
        "Symbol" => Type::Symbol,
        "nil" => Type::Nil,
        "void" => Type::Unit,
        "untyped" | "top" => Type::Value,
        "String" => Type::Str,
        "Array" => Type::Array,
        "Hash" => Type::Hash,
        "Range" => Type::Range,
        "Regexp" => Type::Regexp,
        other => {
            if other.chars().next().map(char::is_uppercase).unwrap_or(false) {
                Type::Class { name: other.to_string(), args }
            } else {
                return Err(format!("malformed type name '{}'", other));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_types() {
        assert_eq!(parse_type("Integer").unwrap(), Type::Int);
        assert_eq!(parse_type("Float").unwrap(), Type::Float);
        assert_eq!(parse_type("bool").unwrap(), Type::Bool);
        assert_eq!(parse_type("void").unwrap(), Type::Unit);
        assert_eq!(parse_type("untyped").unwrap(), Type::Value);
        assert_eq!(parse_type("String").unwrap(), Type::Str);
    }

    #[test]
    fn test_parse_optional() {
        assert_eq!(parse_type("Integer?").unwrap(), Type::optional(Type::Int));
    }

    #[test]
    fn test_parse_union() {
        assert_eq!(
            parse_type("Integer | String").unwrap(),
            Type::union(vec![Type::Int, Type::Str])
        );
        assert_eq!(
            parse_type("(Integer | String)?").unwrap(),
            Type::union(vec![Type::Int, Type::Str, Type::Nil])
        );
    }

    #[test]
    fn test_parse_generic_application() {
        assert_eq!(
            parse_type("Box[Integer]").unwrap(),
            Type::Class { name: "Box".into(), args: vec![Type::Int] }
        );
    }

    #[test]
    fn test_parse_def_with_named_params() {
        let (name, singleton, sig) =
            parse_def_line("speed: (Float dt, Integer steps) -> Float").unwrap();
        assert_eq!(name, "speed");
        assert!(!singleton);
        assert_eq!(sig.params, vec![Type::Float, Type::Int]);
        assert_eq!(sig.param_names, vec!["dt", "steps"]);
        assert_eq!(sig.ret, Type::Float);
    }

    #[test]
    fn test_parse_singleton_def() {
        let (name, singleton, _) = parse_def_line("self.make: () -> Body").unwrap();
        assert_eq!(name, "make");
        assert!(singleton);
    }

    #[test]
    fn test_parse_setter_name() {
        let (name, _, sig) = parse_def_line("x=: (Float v) -> void").unwrap();
        assert_eq!(name, "x=");
        assert_eq!(sig.params, vec![Type::Float]);
    }

    #[test]
    fn test_parse_keyword_and_rest_params() {
        let (_, _, sig) =
            parse_def_line("mix: (Integer a, ?Integer b, *String rest, mode: Symbol) -> void")
                .unwrap();
        assert_eq!(
            sig.params,
            vec![Type::Int, Type::Int, Type::Str, Type::Symbol]
        );
        assert_eq!(sig.param_names, vec!["a", "b", "rest", "mode"]);
    }

    #[test]
    fn test_parse_self_return() {
        let (_, _, sig) = parse_def_line("push: (untyped v) -> self").unwrap();
        assert!(sig.returns_self);
    }

    #[test]
    fn test_nested_class_gets_qualified_name() {
        let doc = parse_document(
            "module Geo\n  class Point\n    @x: Float\n  end\nend\n",
        )
        .unwrap();
        assert_eq!(doc.classes[0].name, "Geo::Point");
        assert_eq!(doc.modules[0].name, "Geo");
    }

    #[test]
    fn test_malformed_line_is_fatal() {
        let err = parse_document("class A\n  wat\nend\n").unwrap_err();
        assert!(err.contains("line 2"));
        assert!(err.contains("malformed"));
    }

    #[test]
    fn test_unclosed_class_is_fatal() {
        let err = parse_document("class A\n  @x: Float\n").unwrap_err();
        assert!(err.contains("unclosed"));
    }

    #[test]
    fn test_unknown_annotation_is_fatal() {
        let err = parse_document("%a{wibble}\nclass A\nend\n").unwrap_err();
        assert!(err.contains("unknown annotation"));
    }

    #[test]
    fn test_overload_continuation() {
        let doc = parse_document(
            "class Calc\n  def add: (Integer a, Integer b) -> Integer\n\
             \x20      | (Float a, Float b) -> Float\nend\n",
        )
        .unwrap();
        let entry = &doc.classes[0].methods["add"];
        assert_eq!(entry.overloads.len(), 2);
        assert_eq!(entry.overloads[0].ret, Type::Int);
        assert_eq!(entry.overloads[1].ret, Type::Float);
    }
}
