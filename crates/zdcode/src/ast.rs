//! The abstract syntax tree consumed by the lowering engine.
//!
//! The parser and preprocessor live outside this crate; they hand over a
//! `Vec<TopLevel>`. Identifier-valued fields keep the casing the user wrote;
//! every lookup table in the compiler folds case at the lookup site, and the
//! written casing is what emission preserves.
//!
//! The whole surface derives serde so programs can be shipped as data (test
//! fixtures do exactly this). Two statement variants are internal only,
//! produced by control-flow rewrite passes during lowering, and are excluded
//! from serialization.

use crate::{context::CtxId, state::StateNode};

/// A top-level declaration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum TopLevel {
    Class(ClassDef),
    Template(TemplateDef),
    StaticDerivation(StaticDerivationDef),
    Group(GroupDef),
    MacroDef(MacroDef),
    /// Compile-time `for` over declarations, unpacked by the driver.
    For(Box<ForLoop<TopLevel>>),
}

/// A `class` declaration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClassDef {
    pub name: FormattableString,
    pub inherit: Option<InheritSpec>,
    pub replace: Option<String>,
    pub editor_num: Option<i32>,
    pub group: Option<String>,
    pub body: Vec<ClassBodyItem>,
}

/// A `class<…>` template declaration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TemplateDef {
    pub name: FormattableString,
    pub parameters: Vec<String>,
    pub inherit: Option<InheritSpec>,
    pub replace: Option<String>,
    pub editor_num: Option<i32>,
    pub group: Option<String>,
    pub body: Vec<TemplateBodyItem>,
}

/// One entry of a template body: an abstract member or a regular item.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum TemplateBodyItem {
    AbstractLabel(String),
    AbstractMacro { name: String, args: Vec<String> },
    AbstractArray(AbstractArrayDecl),
    Item(ClassBodyItem),
}

/// An abstract array declaration inside a template.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AbstractArrayDecl {
    pub name: String,
    pub size: AbstractArraySize,
    pub var_type: UserVarType,
}

/// Size constraint on an abstract array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AbstractArraySize {
    Any,
    Fixed(usize),
}

/// A top-level `derive NAME as Template::(…)` declaration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StaticDerivationDef {
    pub name: FormattableString,
    pub group: Option<String>,
    pub source: TemplateDerivation,
}

/// A named group of class names, iterable at compile time.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GroupDef {
    pub name: String,
    pub items: Vec<String>,
}

/// A named macro: parameters plus a statement body, inlined on injection.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MacroDef {
    pub name: String,
    pub args: Vec<String>,
    pub body: Vec<Statement>,
}

/// A compile-time `for` loop, generic over what it iterates into:
/// declarations, class-body items, or statements.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ForLoop<T> {
    pub var_name: String,
    pub index_name: Option<String>,
    pub iterator: ForIterator,
    pub body: Vec<T>,
    pub else_body: Option<Vec<T>>,
}

/// The iteration domain of a compile-time `for`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ForIterator {
    /// Iterates the members of a group; the name may be `@`-parametrized.
    Group(String),
    /// Iterates an integer range.
    Range {
        from: ReplaceableNumber,
        to: ReplaceableNumber,
        inclusive: bool,
    },
}

/// An integer that may be written as a replacement reference.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ReplaceableNumber {
    Literal(i64),
    Name(String),
}

/// One item of a class (or template, or derivation) body.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ClassBodyItem {
    Property {
        name: String,
        values: Vec<Parameter>,
    },
    Flag(String),
    Unflag(String),
    /// A raw flag-combo line, emitted verbatim in the class top.
    Combo(String),
    UserVar(UserVarDecl),
    Label(LabelDef),
    Mod(ModDef),
    Macro(MacroDef),
    Apply(ApplySpec),
    For(Box<ForLoop<ClassBodyItem>>),
    /// An array definition; only meaningful inside a template derivation,
    /// where it fills an abstractly declared array.
    Array {
        name: String,
        values: Vec<Expression>,
    },
    /// Functions were removed in 2.11.0; this always raises a compile error.
    Function {
        name: String,
    },
}

/// A labeled state sequence.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LabelDef {
    pub name: String,
    pub body: Vec<Statement>,
}

/// A named state modifier: ordered clauses of selector plus effects.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ModDef {
    pub name: String,
    pub clauses: Vec<ModClauseDef>,
}

/// One modifier clause.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ModClauseDef {
    pub selector: SelectorAst,
    pub effects: Vec<EffectAst>,
}

/// A selector predicate over states.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SelectorAst {
    Flag(ModifierText),
    Sprite(SpriteRef),
    Duration(i64),
    Any,
    Not(Box<SelectorAst>),
    And(Box<SelectorAst>, Box<SelectorAst>),
    Or(Box<SelectorAst>, Box<SelectorAst>),
    Xor(Box<SelectorAst>, Box<SelectorAst>),
}

/// An effect transforming one state into zero or more states.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum EffectAst {
    AddFlag(ModifierText),
    RemoveFlag(ModifierText),
    Prefix(Vec<Statement>),
    Suffix(Vec<Statement>),
    /// Binds the matched state as a zero-argument macro named `macro_name`
    /// and lowers `body` in that scope.
    Manipulate {
        macro_name: String,
        body: Vec<Statement>,
    },
}

/// State modifier text, possibly containing replacement references.
pub type ModifierText = Vec<ModifierPart>;

/// One piece of state modifier text.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ModifierPart {
    Text(String),
    Replace(String),
    Group(Vec<ModifierPart>),
}

/// Whether an `apply` names a registered mod or carries inline clauses.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ApplySpec {
    Named(String),
    Inline(Vec<ModClauseDef>),
}

/// A user variable declaration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UserVarDecl {
    pub name: String,
    pub var_type: UserVarType,
    /// Zero means a scalar variable.
    pub size: usize,
    pub init: Option<UserVarInit>,
}

/// Initial value of a user variable.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum UserVarInit {
    Value(Expression),
    Array(Vec<Expression>),
}

/// The element type of a user variable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, serde::Serialize, serde::Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum UserVarType {
    Int,
    Float,
}

/// A statement inside a label, macro, or modifier effect body.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Statement {
    Frames(FramesDef),
    Return,
    Continue,
    Break,
    /// Function calls were removed in 2.11.0; always a compile error.
    Call(String),
    /// `stop`, `wait`, `fail`, `loop`, `goto …`.
    Flow(String),
    Repeat {
        count: ReplaceableNumber,
        index_name: Option<String>,
        body: Vec<Statement>,
    },
    Sometimes {
        chance: Expression,
        body: Vec<Statement>,
    },
    Apply {
        name: String,
        body: Vec<Statement>,
    },
    If {
        condition: Expression,
        body: Vec<Statement>,
        else_body: Option<Vec<Statement>>,
    },
    IfJump {
        jump: ActionCall,
        body: Vec<Statement>,
        else_body: Option<Vec<Statement>>,
    },
    While {
        condition: Expression,
        body: Vec<Statement>,
        else_body: Option<Vec<Statement>>,
    },
    WhileJump {
        jump: ActionCall,
        body: Vec<Statement>,
        else_body: Option<Vec<Statement>>,
    },
    For(Box<ForLoop<Statement>>),
    Inject {
        from_class: Option<String>,
        name: String,
        args: Vec<Parameter>,
    },
    /// Internal: a jump to the end of a parse context, produced when
    /// rewriting `return`/`break`/`continue`. `None` targets the context the
    /// statement is lowered in.
    #[serde(skip)]
    SkipTo(Option<CtxId>),
    /// Internal: an already-lowered state spliced into a statement stream by
    /// the `manipulate` modifier effect.
    #[serde(skip)]
    Prebuilt(StateNode),
}

/// A `SPRITE FRAMES DURATION [keywords] [action]` statement.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FramesDef {
    pub sprite: SpriteRef,
    /// One character per frame; `#` (alone) means "keep the current frame".
    pub frames: String,
    pub duration: i64,
    pub modifiers: Vec<ModifierText>,
    pub action: Option<StateAction>,
}

/// A sprite name, written directly or through a parameter.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SpriteRef {
    Normal(String),
    /// Resolved through the replacement map; must resolve to a quoted string.
    Parametrized(String),
}

/// The action part of a frames statement.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum StateAction {
    Single(ActionCall),
    /// An inline body: all calls but the last run on zero-duration copies.
    Body(Vec<StateAction>),
    Repeated {
        count: ReplaceableNumber,
        index_name: Option<String>,
        body: Box<StateAction>,
    },
}

/// A call to a (state or expression) action function.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ActionCall {
    pub name: String,
    pub args: Vec<Parameter>,
}

/// A parameter: the argument of an action call, property, template
/// derivation or macro injection.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Parameter {
    Expression(Expression),
    Derivation(TemplateDerivation),
    AnonymousClass(AnonymousClassDef),
    AnonymousMacro { args: Vec<String>, body: Vec<Statement> },
}

/// A use of a template, producing (or reusing) a concrete class.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TemplateDerivation {
    pub template_name: String,
    pub params: Vec<Parameter>,
    pub inherit: Option<InheritSpec>,
    /// Extra group to add the derived class to; may be `@`-parametrized.
    pub group: Option<String>,
    pub body: Vec<DerivationBodyItem>,
}

/// One entry of a derivation body.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum DerivationBodyItem {
    Label(LabelDef),
    Macro(MacroDef),
    Array { name: String, values: Vec<Expression> },
    Item(ClassBodyItem),
}

/// A class defined inline as an expression.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AnonymousClassDef {
    pub inherit: Option<InheritSpec>,
    pub group: Option<String>,
    pub body: Vec<ClassBodyItem>,
}

/// How an inheritance target is written.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum InheritSpec {
    /// A plain class name, looked up through replacements.
    ClassName(String),
    Format(Vec<FormatPart>),
    Derivation(Box<TemplateDerivation>),
}

/// A class name that may be a compile-time format string.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum FormattableString {
    Literal(String),
    Format(Vec<FormatPart>),
}

/// One piece of a compile-time format string.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum FormatPart {
    Text(String),
    Eval(EvalNode),
    /// A replacement reference; unknown names are a compile error here.
    Replace(String),
}

/// A textual expression, re-serialized into DECORATE after identifier
/// substitution.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Expression {
    /// Space-joined sequence of sub-expressions.
    Seq(Vec<Expression>),
    Literal(Literal),
    Operator(String),
    Paren(Box<Expression>),
    ArrayIndex(Box<Expression>),
}

/// A literal inside an expression.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Literal {
    /// A number, kept in its written form.
    Number(String),
    Str(String),
    Eval(EvalNode),
    FormatString(Vec<FormatPart>),
    /// An identifier substituted from replacements when bound, kept verbatim
    /// otherwise.
    ActorVariable(String),
    Call(ActionCall),
    AnonymousClass(Box<AnonymousClassDef>),
    Derivation(Box<TemplateDerivation>),
}

/// A compile-time numeric expression.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum EvalNode {
    Int(i64),
    Float(f64),
    /// A replacement reference, coerced to a number.
    Var(String),
    Op(Box<EvalOp>),
}

/// An operator application inside an eval expression.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EvalOp {
    pub op: EvalOperator,
    pub operands: Vec<EvalNode>,
}

/// The compile-time operator set. Unary operators take one operand, the
/// ternary takes three, everything else two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum EvalOperator {
    Pos,
    Neg,
    /// Truncation toward zero.
    Round,
    Floor,
    Ceil,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    /// Multiplication by π.
    Pi,
    Mod,
    Mul,
    Div,
    FloorDiv,
    Add,
    Sub,
    Shr,
    Shl,
    BitAnd,
    BitXor,
    BitOr,
    And,
    Or,
    Xor,
    /// `cond ? yes : no`, evaluated eagerly.
    Ternary,
    /// Evaluates both operands, yields the right one.
    Comma,
}
