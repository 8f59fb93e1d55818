//! Concrete syntax tree — the contract with the external parser front end.
//!
//! Konpeito does not parse Ruby itself. The driver runs the configured
//! parser command (see [`crate::config::CompilerConfig::parser_cmd`]), which
//! prints this tree as JSON on stdout; library embedders can also construct
//! the tree directly. The shapes here mirror what the front end produces,
//! already normalized: `unless` arrives as an inverted `if`, `elsif` chains
//! as nested `if`, string interpolation as `concat` calls.
//!
//! All node kinds are externally tagged on `"kind"` in snake_case, so a
//! serialized node looks like `{"kind": "int", "value": 42}`.

use serde::Deserialize;

/// A parsed compilation unit: the statements of one source file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Root {
    pub body: Vec<Node>,
}

/// One CST node.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    // ---- literals ----
    Int { value: i64 },
    Float { value: f64 },
    Str { value: String },
    Sym { name: String },
    True,
    False,
    Nil,
    SelfRef,
    Array { elements: Vec<Node> },
    HashLit { pairs: Vec<HashPair> },
    RangeLit {
        low: Option<Box<Node>>,
        high: Option<Box<Node>>,
        exclusive: bool,
    },
    RegexpLit { source: String },

    // ---- names ----
    Lvar { name: String },
    Ivar { name: String },
    Gvar { name: String },
    Cvar { name: String },
    Const { name: String },

    // ---- assignment ----
    Assign { target: Box<Node>, value: Box<Node> },
    /// `x op= e`; `op` is the bare operator name (`+`, `<<`, ...)
    OpAssign {
        target: Box<Node>,
        op: String,
        value: Box<Node>,
    },
    OrAssign { target: Box<Node>, value: Box<Node> },
    AndAssign { target: Box<Node>, value: Box<Node> },
    MultiAssign {
        targets: Vec<MlhsTarget>,
        value: Box<Node>,
    },
    ConstAssign { name: String, value: Box<Node> },

    // ---- calls ----
    Call {
        receiver: Option<Box<Node>>,
        #[serde(default)]
        safe: bool,
        name: String,
        #[serde(default)]
        args: Vec<Node>,
        #[serde(default)]
        kwargs: Vec<KwArg>,
        #[serde(default)]
        block: Option<Box<BlockLiteral>>,
    },
    SuperCall {
        #[serde(default)]
        args: Vec<Node>,
        /// `super` without parens forwards the enclosing arguments
        #[serde(default)]
        implicit: bool,
    },
    YieldExpr {
        #[serde(default)]
        args: Vec<Node>,
    },
    Lambda {
        params: Params,
        body: Vec<Node>,
        /// true for `->(){}` / `lambda`, false for `proc` / `Proc.new`
        lambda: bool,
    },

    /// `a && b` — control flow, not a method call
    And { lhs: Box<Node>, rhs: Box<Node> },
    /// `a || b`
    Or { lhs: Box<Node>, rhs: Box<Node> },
    /// `!a` / `not a`
    NotExpr { value: Box<Node> },

    // ---- control flow ----
    If {
        cond: Box<Node>,
        then_body: Vec<Node>,
        #[serde(default)]
        else_body: Vec<Node>,
    },
    While { cond: Box<Node>, body: Vec<Node> },
    Until { cond: Box<Node>, body: Vec<Node> },
    CaseWhen {
        subject: Option<Box<Node>>,
        clauses: Vec<WhenClause>,
        #[serde(default)]
        else_body: Vec<Node>,
    },
    CaseIn {
        subject: Box<Node>,
        clauses: Vec<InClause>,
        /// `None` means no `else` arm: a fallthrough raises at runtime
        else_body: Option<Vec<Node>>,
    },
    Begin {
        body: Vec<Node>,
        #[serde(default)]
        rescues: Vec<RescueClause>,
        #[serde(default)]
        else_body: Vec<Node>,
        #[serde(default)]
        ensure_body: Vec<Node>,
    },
    Return { value: Option<Box<Node>> },
    Break { value: Option<Box<Node>> },
    Next { value: Option<Box<Node>> },
    Raise {
        /// empty: re-raise; one: exception value; two: class + message
        #[serde(default)]
        args: Vec<Node>,
    },

    // ---- definitions ----
    Def {
        name: String,
        params: Params,
        body: Vec<Node>,
        /// true for `def self.name`
        #[serde(default)]
        singleton: bool,
    },
    ClassDef {
        name: String,
        superclass: Option<String>,
        body: Vec<Node>,
    },
    ModuleDef { name: String, body: Vec<Node> },
    /// `class << self ... end`
    SingletonClass { body: Vec<Node> },
    AliasDecl { new_name: String, old_name: String },
}

/// A `key => value` or `key:` shorthand entry in a hash literal.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HashPair {
    pub key: Node,
    pub value: Node,
}

/// A keyword argument at a call site.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct KwArg {
    pub name: String,
    pub value: Node,
}

/// A target on the left-hand side of a multiple assignment.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MlhsTarget {
    Target { node: Node },
    /// `*rest`; `name: None` is a bare discard splat
    Splat { name: Option<String> },
}

/// A block literal attached to a call: `xs.each { |x| ... }`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BlockLiteral {
    pub params: Params,
    pub body: Vec<Node>,
}

/// One `when` clause of a `case/when`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WhenClause {
    pub tests: Vec<Node>,
    pub body: Vec<Node>,
}

/// One `in` clause of a `case/in`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InClause {
    pub pattern: Pattern,
    #[serde(default)]
    pub guard: Option<Node>,
    pub body: Vec<Node>,
}

/// A deconstruction pattern inside `case/in`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pattern {
    /// Literal equality: `in 42`, `in "s"`, `in :sym`
    Lit { node: Node },
    /// Type test against a constant: `in Integer`
    TypeTest { constant: String },
    /// `in [a, *rest, b]`; `rest` present iff a splat appears
    ArrayPat {
        #[serde(default)]
        pre: Vec<Pattern>,
        #[serde(default)]
        rest: Option<SplatBinding>,
        #[serde(default)]
        post: Vec<Pattern>,
    },
    /// `in {name:, age: Integer}`; `value: None` is shorthand binding
    HashPat { entries: Vec<HashPatEntry> },
    /// `in ^expr`
    Pin { expr: Box<Node> },
    /// `in pat => name` and bare `in name`
    Capture {
        #[serde(default)]
        pattern: Option<Box<Pattern>>,
        name: String,
    },
    /// `in a | b | c`
    Alt { alternatives: Vec<Pattern> },
}

/// The binding introduced by a splat inside an array pattern.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SplatBinding {
    pub name: Option<String>,
}

/// One `key: pattern` entry of a hash pattern.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HashPatEntry {
    pub key: String,
    #[serde(default)]
    pub value: Option<Pattern>,
}

/// One `rescue SomeError => e` clause.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RescueClause {
    /// Exception class names; empty means `StandardError`
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub binder: Option<String>,
    pub body: Vec<Node>,
}

/// A method/block/lambda parameter list.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Params {
    #[serde(default)]
    pub list: Vec<Param>,
}

/// One parameter with its labeling.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Param {
    pub name: String,
    #[serde(default)]
    pub label: ParamLabel,
    /// Default expression for optional positionals and optional keywords
    #[serde(default)]
    pub default: Option<Node>,
}

/// How a parameter binds at the call site.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParamLabel {
    #[default]
    Required,
    Optional,
    Rest,
    Keyword,
    KeywordOptional,
    KeywordRest,
    Block,
}

impl Params {
    /// True when calling this function requires the variadic C convention.
    pub fn is_variadic(&self) -> bool {
        self.list.iter().any(|p| {
            matches!(p.label, ParamLabel::Rest | ParamLabel::KeywordRest)
        }) || self.has_keywords()
    }

    /// True when any keyword parameter is present.
    pub fn has_keywords(&self) -> bool {
        self.list.iter().any(|p| {
            matches!(
                p.label,
                ParamLabel::Keyword | ParamLabel::KeywordOptional | ParamLabel::KeywordRest
            )
        })
    }

    pub fn required_positional_count(&self) -> usize {
        self.list
            .iter()
            .filter(|p| p.label == ParamLabel::Required)
            .count()
    }
}

impl Root {
    /// Deserialize a CST from the parser front end's JSON output.
    pub fn from_json(json: &str) -> Result<Root, String> {
        serde_json::from_str(json).map_err(|e| format!("Malformed CST from parser: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_int_literal() {
        let root = Root::from_json(r#"{"body": [{"kind": "int", "value": 42}]}"#).unwrap();
        assert_eq!(root.body, vec![Node::Int { value: 42 }]);
    }

    #[test]
    fn test_parse_call_defaults() {
        let root = Root::from_json(
            r#"{"body": [{"kind": "call", "receiver": null, "name": "puts",
                          "args": [{"kind": "str", "value": "hi"}]}]}"#,
        )
        .unwrap();
        match &root.body[0] {
            Node::Call { receiver, safe, name, args, kwargs, block } => {
                assert!(receiver.is_none());
                assert!(!safe);
                assert_eq!(name, "puts");
                assert_eq!(args.len(), 1);
                assert!(kwargs.is_empty());
                assert!(block.is_none());
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_def_with_keyword_param() {
        let root = Root::from_json(
            r#"{"body": [{"kind": "def", "name": "greet",
                          "params": {"list": [{"name": "name", "label": "keyword"}]},
                          "body": [{"kind": "lvar", "name": "name"}]}]}"#,
        )
        .unwrap();
        match &root.body[0] {
            Node::Def { name, params, singleton, .. } => {
                assert_eq!(name, "greet");
                assert!(!singleton);
                assert!(params.has_keywords());
                assert!(params.is_variadic());
            }
            other => panic!("expected def, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_array_pattern() {
        let root = Root::from_json(
            r#"{"body": [{"kind": "case_in",
                          "subject": {"kind": "lvar", "name": "x"},
                          "clauses": [{"pattern": {"kind": "array_pat",
                                                    "pre": [{"kind": "capture", "name": "a"}],
                                                    "rest": {"name": "rest"},
                                                    "post": [{"kind": "capture", "name": "b"}]},
                                       "body": [{"kind": "nil"}]}],
                          "else_body": null}]}"#,
        )
        .unwrap();
        match &root.body[0] {
            Node::CaseIn { clauses, else_body, .. } => {
                assert!(else_body.is_none());
                match &clauses[0].pattern {
                    Pattern::ArrayPat { pre, rest, post } => {
                        assert_eq!(pre.len(), 1);
                        assert_eq!(post.len(), 1);
                        assert_eq!(rest.as_ref().unwrap().name.as_deref(), Some("rest"));
                    }
                    other => panic!("expected array pattern, got {:?}", other),
                }
            }
            other => panic!("expected case_in, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_cst_is_reported() {
        let err = Root::from_json(r#"{"body": [{"kind": "no_such_kind"}]}"#).unwrap_err();
        assert!(err.contains("Malformed CST"));
    }

    #[test]
    fn test_variadic_conventions() {
        let plain = Params {
            list: vec![Param {
                name: "a".into(),
                label: ParamLabel::Required,
                default: None,
            }],
        };
        assert!(!plain.is_variadic());

        let rest = Params {
            list: vec![Param {
                name: "args".into(),
                label: ParamLabel::Rest,
                default: None,
            }],
        };
        assert!(rest.is_variadic());
    }
}
