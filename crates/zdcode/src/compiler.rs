//! The compiler driver and statement lowering.
//!
//! Compilation runs as a sequence of passes over the declaration list:
//! groups and compile-time `for` loops are unpacked to a fixed point, macros
//! and templates are hoisted, classes and static derivations are registered
//! eagerly (so later declarations can refer to them) while their bodies are
//! queued as deferred tasks, and the task queue is drained in priority order
//! (template bodies first, derivation group registrations next, class bodies
//! last). Spawn-label preparation, inheritance reordering, and serialization
//! close the pipeline.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet, BinaryHeap},
};

use ahash::{AHashMap, AHashSet};
use indexmap::IndexMap;

use crate::{
    actor::{Actor, ActorId, Inventory, Label, Property, UserVar, UserVarSize, UserVarValue},
    ast::{
        ActionCall, AnonymousClassDef, ApplySpec, ClassBodyItem, ClassDef, DerivationBodyItem,
        Expression, ForIterator, ForLoop, FormattableString, InheritSpec, Literal, ModDef,
        ModifierPart, ModifierText, Parameter, ReplaceableNumber, SpriteRef, StateAction,
        Statement, StaticDerivationDef, TemplateBodyItem, TemplateDef, TemplateDerivation,
        TopLevel, UserVarInit,
    },
    context::{ContextTree, CtxId, Macro},
    error::{CompileError, CompileResult},
    eval,
    idgen::{ACTOR_ID_LEN, IdSource, PROGRAM_ID_LEN},
    modifier::{self, ModClause},
    state::{Frame, IfJumpNode, IfNode, JumpCall, SkipNode, SometimesNode, StateNode, Verbatim,
        WhileJumpNode, WhileNode},
    template::{AbstractArray, ClassTemplate, TemplateId},
    text::{TextNode, stringify, unstringify},
};

/// The language version stamped into the output header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// An array provided by a template derivation, with its values already
/// lowered at the derivation site.
#[derive(Debug)]
struct LoweredArray {
    name: String,
    values: Vec<String>,
}

#[derive(Debug)]
enum TaskKind {
    /// Parse a fresh template instantiation's body. Priority 0.
    TemplateBody {
        actor: ActorId,
        ctx: CtxId,
        template: TemplateId,
        arrays: Vec<LoweredArray>,
        body: Vec<ClassBodyItem>,
    },
    /// Add a static derivation to a group. Priority 1.
    GroupAppend { group: String, entry: String },
    /// Parse a regular class body. Priority 2.
    ClassBody {
        actor: ActorId,
        ctx: CtxId,
        body: Vec<ClassBodyItem>,
    },
}

#[derive(Debug)]
struct PendingTask {
    priority: u8,
    seq: u64,
    kind: TaskKind,
}

impl PartialEq for PendingTask {
    fn eq(&self, other: &Self) -> bool {
        (self.priority, self.seq) == (other.priority, other.seq)
    }
}

impl Eq for PendingTask {}

impl PartialOrd for PendingTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

/// The ZDCode program being compiled: the actor arena, name tables, groups,
/// deferred-task queue and id generator, plus every lowering routine.
#[derive(Debug)]
pub struct Compiler {
    pub(crate) ctxs: ContextTree,
    pub(crate) actors: Vec<Actor>,
    /// Actors in program order; sorted and inheritance-reordered at the end.
    actor_order: Vec<ActorId>,
    actor_names: AHashMap<String, ActorId>,
    anonymous_classes: Vec<ActorId>,
    templates: Vec<ClassTemplate>,
    /// Uppercased group name mapped to quoted class-name literals.
    groups: IndexMap<String, Vec<String>>,
    inventories: Vec<Inventory>,
    ids: IdSource,
    id: String,
    num_anonym_macros: u32,
    num_whiles: u32,
    pending: BinaryHeap<Reverse<PendingTask>>,
    task_seq: u64,
}

impl Compiler {
    /// Creates a compiler with entropy-seeded generated ids.
    pub fn new() -> Self {
        Self::with_ids(IdSource::from_entropy())
    }

    /// Creates a compiler whose generated ids are deterministic for `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_ids(IdSource::from_seed(seed))
    }

    fn with_ids(mut ids: IdSource) -> Self {
        let id = ids.make_id(PROGRAM_ID_LEN);
        Self {
            ctxs: ContextTree::new("global"),
            actors: Vec::new(),
            actor_order: Vec::new(),
            actor_names: AHashMap::new(),
            anonymous_classes: Vec::new(),
            templates: Vec::new(),
            groups: IndexMap::new(),
            inventories: Vec::new(),
            ids,
            id,
            num_anonym_macros: 0,
            num_whiles: 0,
            pending: BinaryHeap::new(),
            task_seq: 0,
        }
    }

    /// The program id embedded in generated class and macro names.
    pub fn program_id(&self) -> &str {
        &self.id
    }

    /// Registers a helper inventory actor, emitted ahead of regular classes.
    pub fn add_inventory(&mut self, name: &str) {
        self.inventories.push(Inventory {
            name: name.trim().to_string(),
        });
    }

    fn err(&self, ctx: CtxId, message: impl Into<String>) -> CompileError {
        CompileError::at(self.ctxs.describe(ctx), message)
    }

    // ------------------------------------------------------------------
    // Driver passes
    // ------------------------------------------------------------------

    /// Compiles a program, adding its classes to this compiler.
    pub fn compile(&mut self, declarations: Vec<TopLevel>) -> CompileResult<()> {
        let root = self.ctxs.root();
        let first_new_actor = self.actors.len();
        let mut items: Vec<(CtxId, TopLevel)> =
            declarations.into_iter().map(|d| (root, d)).collect();

        // Groups are registered before compile-time for loops are unpacked,
        // so the loops can iterate them; unpacking runs to a fixed point
        // because unpacked bodies may contain further loops and groups.
        loop {
            for (_, item) in &items {
                if let TopLevel::Group(group) = item {
                    let entry = self.groups.entry(group.name.to_uppercase()).or_default();
                    entry.extend(group.items.iter().map(|i| stringify(i)));
                }
            }

            let mut had_for = false;
            let mut next = Vec::with_capacity(items.len());
            for (ctx, item) in items {
                match item {
                    TopLevel::For(for_loop) => {
                        had_for = true;
                        next.extend(self.unpack_static_for(ctx, *for_loop)?);
                    }
                    TopLevel::Group(_) => {}
                    other => next.push((ctx, other)),
                }
            }
            items = next;
            if !had_for {
                break;
            }
        }

        for (_, item) in &items {
            if let TopLevel::MacroDef(mac) = item {
                self.ctxs.insert_macro(
                    root,
                    &mac.name,
                    Macro {
                        args: mac.args.clone(),
                        body: mac.body.clone(),
                    },
                );
            }
        }

        for (ctx, item) in &items {
            if let TopLevel::Template(template) = item {
                self.register_template(*ctx, template)?;
            }
        }

        for (ctx, item) in items {
            match item {
                TopLevel::Class(class) => self.register_class(ctx, class)?,
                TopLevel::StaticDerivation(derivation) => {
                    self.register_static_derivation(ctx, &derivation)?;
                }
                _ => {}
            }
        }

        self.drain_pending()?;

        // Only actors created by this call: repeated compilation must not
        // re-prepend spawn preludes onto already-prepared classes.
        for index in first_new_actor..self.actors.len() {
            self.actors[index].prepare_spawn_label();
        }

        let actors = &self.actors;
        self.actor_order
            .sort_by(|a, b| actors[a.index()].name.cmp(&actors[b.index()].name));
        let reorders = self.reorder_inherits();
        log::debug!("compiled {} actors ({reorders} reordered)", self.actor_order.len());

        Ok(())
    }

    /// Like [`Compiler::compile`], reporting the first error to `handler`
    /// and returning whether compilation succeeded.
    pub fn compile_with_handler<F>(&mut self, declarations: Vec<TopLevel>, handler: F) -> bool
    where
        F: FnOnce(&CompileError),
    {
        match self.compile(declarations) {
            Ok(()) => true,
            Err(error) => {
                handler(&error);
                false
            }
        }
    }

    fn enqueue(&mut self, priority: u8, kind: TaskKind) {
        self.task_seq += 1;
        self.pending.push(Reverse(PendingTask {
            priority,
            seq: self.task_seq,
            kind,
        }));
    }

    fn drain_pending(&mut self) -> CompileResult<()> {
        let mut drained = 0usize;
        while let Some(Reverse(task)) = self.pending.pop() {
            self.run_task(task.kind)?;
            drained += 1;
        }
        log::debug!("drained {drained} deferred body tasks");
        Ok(())
    }

    fn run_task(&mut self, kind: TaskKind) -> CompileResult<()> {
        match kind {
            TaskKind::ClassBody { actor, ctx, body } => self.lower_class_body(actor, ctx, &body),
            TaskKind::GroupAppend { group, entry } => {
                if let Some(items) = self.groups.get_mut(&group) {
                    items.push(entry);
                }
                Ok(())
            }
            TaskKind::TemplateBody {
                actor,
                ctx,
                template,
                arrays,
                body,
            } => {
                for array in arrays {
                    let decl = self.templates[template.index()]
                        .abstract_arrays
                        .get(&array.name.to_uppercase())
                        .ok_or_else(|| {
                            self.err(
                                ctx,
                                format!(
                                    "tried to define an array '{}' that is not abstractly \
                                     declared in the template '{}'",
                                    array.name,
                                    self.templates[template.index()].name
                                ),
                            )
                        })?;
                    let var_type = decl.var_type;
                    self.actors[actor.index()].uservars.push(UserVar {
                        name: array.name,
                        var_type,
                        size: UserVarSize::Fixed(array.values.len()),
                        init: Some(UserVarValue::Array(array.values)),
                    });
                }
                self.lower_class_body(actor, ctx, &body)
            }
        }
    }

    fn unpack_static_for<T: Clone>(
        &mut self,
        ctx: CtxId,
        for_loop: ForLoop<T>,
    ) -> CompileResult<Vec<(CtxId, T)>> {
        let (mode, values) = match &for_loop.iterator {
            ForIterator::Group(group) => {
                let name = self.ctxs.resolve(ctx, group, "a parametrized group name")?;
                let items = self.groups.get(&name.to_uppercase()).ok_or_else(|| {
                    self.err(ctx, format!("no such group '{name}' to iterate in a for loop"))
                })?;
                ("group", items.clone())
            }
            ForIterator::Range { from, to, inclusive } => {
                let from = self.parse_replaceable_number(ctx, from)?;
                let to = self.parse_replaceable_number(ctx, to)? + i64::from(*inclusive);
                ("range", (from..to.max(from)).map(|i| i.to_string()).collect())
            }
        };

        let mut out = Vec::new();
        if values.is_empty() {
            let Some(else_body) = &for_loop.else_body else {
                return Err(self.err(
                    ctx,
                    "nothing to iterate in compile-time for loop, and no else clause",
                ));
            };
            let else_ctx = self
                .ctxs
                .remote_derive(ctx, Some("static for-else"), 0, false, false);
            out.extend(else_body.iter().map(|item| (else_ctx, item.clone())));
        } else {
            let outer = self.ctxs.remote_derive(ctx, Some("static for"), 0, false, false);
            for (i, value) in values.iter().enumerate() {
                let iter_ctx = self.ctxs.remote_derive(
                    outer,
                    Some(&format!("for-{mode} loop body")),
                    0,
                    false,
                    true,
                );
                self.ctxs
                    .insert_replacement(iter_ctx, &for_loop.var_name, value.clone());
                if let Some(index_name) = &for_loop.index_name {
                    self.ctxs
                        .insert_replacement(iter_ctx, index_name, i.to_string());
                }
                out.extend(for_loop.body.iter().map(|item| (iter_ctx, item.clone())));
            }
        }
        Ok(out)
    }

    fn register_template(&mut self, ctx: CtxId, template: &TemplateDef) -> CompileResult<()> {
        let classname = self.format_formattable(ctx, &template.name)?;

        let group = match &template.group {
            Some(group) => {
                let key = unstringify(group).to_uppercase();
                if !self.groups.contains_key(&key) {
                    return Err(self.err(
                        ctx,
                        format!(
                            "group '{group}' not found while compiling template class \
                             '{classname}'"
                        ),
                    ));
                }
                Some(key)
            }
            None => None,
        };

        let mut abstract_labels = AHashSet::new();
        let mut abstract_macros = AHashMap::new();
        let mut abstract_arrays = AHashMap::new();
        let mut parse_data = Vec::new();
        for item in &template.body {
            match item {
                TemplateBodyItem::AbstractLabel(name) => {
                    abstract_labels.insert(name.to_uppercase());
                }
                TemplateBodyItem::AbstractMacro { name, args } => {
                    abstract_macros.insert(name.to_uppercase(), args.clone());
                }
                TemplateBodyItem::AbstractArray(decl) => {
                    abstract_arrays.insert(
                        decl.name.to_uppercase(),
                        AbstractArray {
                            size: decl.size,
                            var_type: decl.var_type,
                        },
                    );
                }
                TemplateBodyItem::Item(item) => parse_data.push(item.clone()),
            }
        }

        let inherit = self.lower_inherit_opt(ctx, template.inherit.as_ref())?;
        let id = self.ids.make_id(ACTOR_ID_LEN);
        let template_id = TemplateId::new(self.templates.len());
        self.templates.push(ClassTemplate {
            name: classname.clone(),
            id,
            inherit,
            replace: template.replace.clone(),
            editor_num: template.editor_num,
            group,
            parameters: template.parameters.clone(),
            parse_data,
            abstract_labels,
            abstract_macros,
            abstract_arrays,
            instances: AHashMap::new(),
        });
        self.ctxs.insert_template(ctx, &classname, template_id);
        Ok(())
    }

    fn register_class(&mut self, ctx: CtxId, class: ClassDef) -> CompileResult<()> {
        let classname = self.format_formattable(ctx, &class.name)?;
        self.ctxs
            .push_description(ctx, format!("class '{classname}'"));

        let inherit = self.lower_inherit_opt(ctx, class.inherit.as_ref())?;
        let actor = self.create_actor(
            classname.clone(),
            inherit,
            class.replace.clone(),
            class.editor_num,
            ctx,
        );

        if let Some(group) = &class.group {
            let entry = stringify(&classname);
            match self.groups.get_mut(&group.to_uppercase()) {
                Some(items) => items.push(entry),
                None => {
                    return Err(self.err(
                        ctx,
                        format!(
                            "group '{group}' not found while compiling class '{classname}'"
                        ),
                    ));
                }
            }
        }

        let actor_ctx = self.actors[actor.index()].ctx;
        self.enqueue(
            2,
            TaskKind::ClassBody {
                actor,
                ctx: actor_ctx,
                body: class.body,
            },
        );
        self.actor_names.insert(classname.to_uppercase(), actor);
        self.actor_order.push(actor);
        self.ctxs.pop_description(ctx);
        Ok(())
    }

    fn register_static_derivation(
        &mut self,
        ctx: CtxId,
        derivation: &StaticDerivationDef,
    ) -> CompileResult<()> {
        let new_name = self.format_formattable(ctx, &derivation.name)?;
        self.ctxs
            .push_description(ctx, format!("static template derivation '{new_name}'"));
        self.lower_template_derivation(ctx, &derivation.source, true, Some(new_name.clone()))?;

        if let Some(group) = &derivation.group {
            let key = unstringify(group).to_uppercase();
            if !self.groups.contains_key(&key) {
                return Err(self.err(
                    ctx,
                    format!("no such group '{group}' to add the derivation '{new_name}' to"),
                ));
            }
            self.enqueue(
                1,
                TaskKind::GroupAppend {
                    group: key,
                    entry: stringify(&new_name),
                },
            );
        }
        self.ctxs.pop_description(ctx);
        Ok(())
    }

    /// Creates an actor with a derived context; if its inheritance target is
    /// already registered, the parent's scope maps become visible to it.
    fn create_actor(
        &mut self,
        name: String,
        inherit: Option<String>,
        replace: Option<String>,
        editor_num: Option<i32>,
        parent_ctx: CtxId,
    ) -> ActorId {
        let actor_ctx = self.ctxs.derive(parent_ctx, None, false, false);
        let id = self.ids.make_id(ACTOR_ID_LEN);
        let mut actor = Actor::new(name, id, inherit, replace, editor_num, actor_ctx);

        if let Some(parent) = actor
            .inherit
            .as_ref()
            .and_then(|i| self.actor_names.get(&i.to_uppercase()))
            .copied()
        {
            actor.all_funcs = self.actors[parent.index()].all_funcs.clone();
            self.ctxs.update(actor_ctx, self.actors[parent.index()].ctx);
        }

        let actor_id = ActorId::new(self.actors.len());
        self.actors.push(actor);
        actor_id
    }

    /// Moves inheritance targets ahead of their inheritors: a stable
    /// single-pass compaction that only moves an actor when some earlier
    /// actor named it as a parent. Returns the number of moved actors.
    fn reorder_inherits(&mut self) -> usize {
        let mut new_order: Vec<ActorId> = Vec::with_capacity(self.actor_order.len());
        let mut positions: AHashMap<String, usize> = AHashMap::new();
        let mut reorders = 0;

        for &actor_id in &self.actor_order {
            let actor = &self.actors[actor_id.index()];
            let mut new_pos = new_order.len();

            if let Some(&position) = positions.get(&actor.name.to_uppercase()) {
                new_pos = position;
                reorders += 1;
            }
            if let Some(inherit) = &actor.inherit {
                let key = inherit.to_uppercase();
                if positions.get(&key).is_none_or(|&p| p > new_pos) {
                    positions.insert(key, new_pos);
                }
            }
            new_order.insert(new_pos, actor_id);
        }

        self.actor_order = new_order;
        reorders
    }

    // ------------------------------------------------------------------
    // Class bodies
    // ------------------------------------------------------------------

    fn lower_class_body(
        &mut self,
        actor: ActorId,
        ctx: CtxId,
        body: &[ClassBodyItem],
    ) -> CompileResult<()> {
        for item in body {
            if let ClassBodyItem::For(for_loop) = item {
                let unpacked = self.unpack_static_for(ctx, (**for_loop).clone())?;
                for (iter_ctx, item) in unpacked {
                    self.lower_class_body(actor, iter_ctx, std::slice::from_ref(&item))?;
                }
            }
        }

        for item in body {
            if let ClassBodyItem::Mod(mod_def) = item {
                self.register_mod(ctx, mod_def);
            }
        }

        for item in body {
            if let ClassBodyItem::Macro(mac) = item {
                self.ctxs.insert_macro(
                    ctx,
                    &mac.name,
                    Macro {
                        args: mac.args.clone(),
                        body: mac.body.clone(),
                    },
                );
            }
        }

        for item in body {
            match item {
                ClassBodyItem::Property { name, values } => {
                    let mut parts = Vec::with_capacity(values.len());
                    for value in values {
                        parts.push(self.lower_parameter(ctx, value, None)?);
                    }
                    self.actors[actor.index()].properties.push(Property {
                        name: name.trim().to_string(),
                        value: parts.join(", "),
                    });
                }
                ClassBodyItem::Flag(flag) => {
                    self.actors[actor.index()].flags.insert(flag.clone());
                }
                ClassBodyItem::Unflag(flag) => {
                    self.actors[actor.index()].antiflags.insert(flag.clone());
                }
                ClassBodyItem::Combo(line) => {
                    self.actors[actor.index()].raw.push(line.clone());
                }
                ClassBodyItem::UserVar(decl) => {
                    let init = match &decl.init {
                        None => None,
                        Some(UserVarInit::Value(expr)) => {
                            Some(UserVarValue::Value(self.lower_expression(ctx, expr)?))
                        }
                        Some(UserVarInit::Array(exprs)) => {
                            let mut values = Vec::with_capacity(exprs.len());
                            for expr in exprs {
                                values.push(self.lower_expression(ctx, expr)?);
                            }
                            Some(UserVarValue::Array(values))
                        }
                    };
                    let size = if decl.size == 0 {
                        UserVarSize::Scalar
                    } else {
                        UserVarSize::Fixed(decl.size)
                    };
                    self.actors[actor.index()].uservars.push(UserVar {
                        name: decl.name.clone(),
                        var_type: decl.var_type,
                        size,
                        init,
                    });
                }
                ClassBodyItem::Label(label) => {
                    self.ctxs
                        .push_description(ctx, format!("label '{}'", label.name));
                    let mut states = Vec::new();
                    self.lower_states(ctx, Some(&label.name), &mut states, &label.body)?;
                    self.actors[actor.index()].labels.push(Label {
                        name: label.name.trim().to_string(),
                        states,
                    });
                    self.ctxs.pop_description(ctx);
                }
                ClassBodyItem::Apply(spec) => {
                    let clauses = match spec {
                        ApplySpec::Named(name) => self
                            .ctxs
                            .lookup_mod(ctx, name.trim())
                            .map(<[ModClause]>::to_vec)
                            .ok_or_else(|| {
                                self.err(
                                    ctx,
                                    format!(
                                        "tried to apply unknown state mod '{}' in global \
                                         apply statement",
                                        name.trim()
                                    ),
                                )
                            })?,
                        ApplySpec::Inline(defs) => defs
                            .iter()
                            .map(|clause| ModClause {
                                ctx,
                                selector: clause.selector.clone(),
                                effects: clause.effects.clone(),
                            })
                            .collect(),
                    };
                    self.ctxs.extend_applied_mods(ctx, clauses);
                }
                ClassBodyItem::Function { name } => {
                    return Err(self.err(
                        ctx,
                        format!("functions have been removed since ZDCode 2.11.0 ('{name}')"),
                    ));
                }
                // Arrays are consumed by the derivation task that owns them;
                // mods, macros and compile-time fors were handled above.
                ClassBodyItem::Array { .. }
                | ClassBodyItem::Mod(_)
                | ClassBodyItem::Macro(_)
                | ClassBodyItem::For(_) => {}
            }
        }
        Ok(())
    }

    fn register_mod(&mut self, ctx: CtxId, mod_def: &ModDef) {
        let clauses: Vec<ModClause> = mod_def
            .clauses
            .iter()
            .map(|clause| ModClause {
                ctx,
                selector: clause.selector.clone(),
                effects: clause.effects.clone(),
            })
            .collect();
        self.ctxs.insert_mod(ctx, &mod_def.name, clauses);
    }

    // ------------------------------------------------------------------
    // Statement lowering
    // ------------------------------------------------------------------

    fn lower_states(
        &mut self,
        ctx: CtxId,
        label_name: Option<&str>,
        dest: &mut Vec<StateNode>,
        statements: &[Statement],
    ) -> CompileResult<()> {
        for statement in statements {
            self.lower_statement(ctx, label_name, dest, statement)?;
        }
        Ok(())
    }

    /// Lowers statements with no label attached, returning the produced
    /// states. Modifier effect bodies go through this.
    pub(crate) fn lower_state_expr(
        &mut self,
        ctx: CtxId,
        statements: &[Statement],
    ) -> CompileResult<Vec<StateNode>> {
        let mut out = Vec::new();
        self.lower_states(ctx, None, &mut out, statements)?;
        Ok(out)
    }

    /// Appends a freshly-built node to `dest`, filtering it through every
    /// modifier applied in the enclosing scopes and recording its state
    /// count on `ctx`.
    fn add_state(
        &mut self,
        ctx: CtxId,
        dest: &mut Vec<StateNode>,
        state: StateNode,
    ) -> CompileResult<()> {
        let clauses = self.ctxs.applied_mods(ctx);
        let mut added = vec![state];
        for clause in &clauses {
            modifier::apply_clause(self, clause, ctx, &mut added)?;
        }
        let count: u32 = added.iter().map(StateNode::num_states).sum();
        self.ctxs.add_states(ctx, count);
        dest.extend(added);
        Ok(())
    }

    fn next_loop_id(&mut self) -> String {
        let id = format!("_loop_while_{}", self.num_whiles);
        self.num_whiles += 1;
        id
    }

    fn lower_statement(
        &mut self,
        ctx: CtxId,
        label_name: Option<&str>,
        dest: &mut Vec<StateNode>,
        statement: &Statement,
    ) -> CompileResult<()> {
        match statement {
            Statement::Frames(frames) => {
                let mut keywords = Vec::with_capacity(frames.modifiers.len());
                for modifier in &frames.modifiers {
                    keywords.push(self.lower_state_modifier(ctx, modifier)?);
                }
                let sprite = self.lower_state_sprite(ctx, &frames.sprite)?;
                let frame_letters: Vec<String> =
                    if frames.frames == "#" || frames.frames == "\"#\"" {
                        vec!["#".to_string()]
                    } else {
                        frames.frames.chars().map(|c| c.to_string()).collect()
                    };

                for letter in &frame_letters {
                    match &frames.action {
                        None => self.add_state(
                            ctx,
                            dest,
                            StateNode::Frame(Frame::new(
                                &sprite,
                                letter,
                                frames.duration,
                                keywords.clone(),
                                None,
                            )),
                        )?,
                        Some(action) => {
                            let calls = self.lower_action_or_body(ctx, action)?;
                            let count = calls.len();
                            for (i, call) in calls.into_iter().enumerate() {
                                let duration =
                                    if i + 1 < count { 0 } else { frames.duration };
                                self.add_state(
                                    ctx,
                                    dest,
                                    StateNode::Frame(Frame::new(
                                        &sprite,
                                        letter,
                                        duration,
                                        keywords.clone(),
                                        Some(call),
                                    )),
                                )?;
                            }
                        }
                    }
                }
            }

            Statement::Return => {
                return Err(self.err(ctx, "return statements are only valid in macros"));
            }
            Statement::Continue => {
                return Err(self.err(ctx, "continue statements are only valid in loops"));
            }
            Statement::Break => {
                return Err(self.err(ctx, "break statements are only valid in loops"));
            }
            Statement::Call(name) => {
                return Err(self.err(
                    ctx,
                    format!("functions and calls have been removed since ZDCode 2.11.0 ('{name}')"),
                ));
            }

            Statement::SkipTo(target) => {
                let target = target.unwrap_or(ctx);
                let index = self.ctxs.remote_num_states(target);
                self.add_state(ctx, dest, StateNode::Skip(SkipNode { ctx: target, index }))?;
            }

            Statement::Prebuilt(state) => {
                self.add_state(ctx, dest, state.clone())?;
            }

            Statement::Flow(flow) => {
                let trimmed = flow.trim_end_matches(';');
                if trimmed.eq_ignore_ascii_case("loop") {
                    let Some(label) = label_name else {
                        return Err(self.err(ctx, "cannot use 'loop' outside of a label"));
                    };
                    self.add_state(
                        ctx,
                        dest,
                        StateNode::Verbatim(Verbatim::new(format!("goto {label}"))),
                    )?;
                } else {
                    let mut words: Vec<String> =
                        trimmed.split(' ').map(str::to_string).collect();
                    if let Some(first) = words.first_mut() {
                        *first = first.to_lowercase();
                    }
                    self.add_state(
                        ctx,
                        dest,
                        StateNode::Verbatim(Verbatim::new(words.join(" "))),
                    )?;
                }
            }

            Statement::Repeat {
                count,
                index_name,
                body,
            } => {
                let break_ctx = self.ctxs.derive(ctx, Some("repeat"), true, false);
                let count = self.parse_replaceable_number(ctx, count)?;
                for index in 0..count {
                    let loop_ctx = self.ctxs.derive(
                        break_ctx,
                        Some(&format!("body #{}", index + 1)),
                        false,
                        true,
                    );
                    if let Some(index_name) = index_name {
                        self.ctxs
                            .insert_replacement(loop_ctx, index_name, index.to_string());
                    }
                    for statement in body {
                        let rewritten = self.rewrite_loop_statement(statement, break_ctx, loop_ctx);
                        self.lower_statement(loop_ctx, label_name, dest, &rewritten)?;
                    }
                }
            }

            Statement::Sometimes { chance, body } => {
                let chance = self.lower_expression(ctx, chance)?;
                let body_ctx = self
                    .ctxs
                    .remote_derive(ctx, Some("sometimes body"), 2, false, false);
                let mut body_states = Vec::new();
                self.lower_states(body_ctx, label_name, &mut body_states, body)?;
                self.add_state(
                    ctx,
                    dest,
                    StateNode::Sometimes(SometimesNode {
                        chance,
                        body: body_states,
                    }),
                )?;
                self.ctxs.pop_remote(ctx);
            }

            Statement::Apply { name, body } => {
                let clauses = self
                    .ctxs
                    .lookup_mod(ctx, name.trim())
                    .map(<[ModClause]>::to_vec)
                    .ok_or_else(|| {
                        self.err(
                            ctx,
                            format!(
                                "tried to apply unknown state mod '{}' in apply statement",
                                name.trim()
                            ),
                        )
                    })?;
                let apply_ctx = self
                    .ctxs
                    .remote_derive(ctx, Some("apply block"), 0, false, false);
                self.ctxs.extend_applied_mods(apply_ctx, clauses);
                let mut block = Vec::new();
                self.lower_states(apply_ctx, label_name, &mut block, body)?;
                self.add_state(ctx, dest, StateNode::Block(block))?;
                self.ctxs.pop_remote(ctx);
            }

            Statement::If {
                condition,
                body,
                else_body,
            } => {
                let condition = self.lower_expression(ctx, condition)?;
                let offset = if else_body.is_some() { 3 } else { 2 };
                let if_ctx = self
                    .ctxs
                    .remote_derive(ctx, Some("if body"), offset, false, false);
                let mut body_states = Vec::new();
                self.lower_states(if_ctx, label_name, &mut body_states, body)?;
                let else_states = match else_body {
                    Some(else_body) => {
                        let mut states = Vec::new();
                        self.lower_states(if_ctx, label_name, &mut states, else_body)?;
                        Some(states)
                    }
                    None => None,
                };
                self.add_state(
                    ctx,
                    dest,
                    StateNode::If(IfNode {
                        condition,
                        body: body_states,
                        else_body: else_states,
                    }),
                )?;
                self.ctxs.pop_remote(ctx);
            }

            Statement::IfJump {
                jump,
                body,
                else_body,
            } => {
                let jump = self.lower_jump_call(ctx, jump, "ifjump check")?;
                let if_ctx = self
                    .ctxs
                    .remote_derive(ctx, Some("ifjump body"), 3, false, false);
                let mut body_states = Vec::new();
                self.lower_states(if_ctx, label_name, &mut body_states, body)?;
                let else_states = match else_body {
                    Some(else_body) => {
                        let mut states = Vec::new();
                        self.lower_states(if_ctx, label_name, &mut states, else_body)?;
                        Some(states)
                    }
                    None => None,
                };
                self.add_state(
                    ctx,
                    dest,
                    StateNode::IfJump(IfJumpNode {
                        jump,
                        body: body_states,
                        else_body: else_states,
                    }),
                )?;
                self.ctxs.pop_remote(ctx);
            }

            Statement::While {
                condition,
                body,
                else_body,
            } => {
                let offset = if else_body.is_some() { 4 } else { 3 };
                let break_ctx = self
                    .ctxs
                    .remote_derive(ctx, Some("while"), offset, true, false);
                let condition = self.lower_expression(break_ctx, condition)?;
                let loop_id = self.next_loop_id();

                let else_states = match else_body {
                    Some(else_body) => {
                        let else_ctx =
                            self.ctxs.derive(break_ctx, Some("else of while"), false, false);
                        let mut states = Vec::new();
                        for statement in else_body {
                            let rewritten =
                                self.rewrite_loop_statement(statement, else_ctx, else_ctx);
                            self.lower_statement(else_ctx, label_name, &mut states, &rewritten)?;
                        }
                        Some(states)
                    }
                    None => None,
                };

                let body_ctx = self
                    .ctxs
                    .derive(break_ctx, Some("body of while"), false, true);
                let mut body_states = Vec::new();
                for statement in body {
                    let rewritten = self.rewrite_loop_statement(statement, break_ctx, body_ctx);
                    self.lower_statement(body_ctx, label_name, &mut body_states, &rewritten)?;
                }

                self.add_state(
                    ctx,
                    dest,
                    StateNode::While(WhileNode {
                        condition,
                        loop_id,
                        body: body_states,
                        else_body: else_states,
                    }),
                )?;
                self.ctxs.pop_remote(ctx);
            }

            Statement::WhileJump {
                jump,
                body,
                else_body,
            } => {
                let break_ctx = self
                    .ctxs
                    .remote_derive(ctx, Some("whilejump"), 4, true, false);
                let jump = self.lower_jump_call(break_ctx, jump, "whilejump check")?;
                let loop_id = self.next_loop_id();

                let else_states = match else_body {
                    Some(else_body) => {
                        let else_ctx = self.ctxs.derive(
                            break_ctx,
                            Some("else of whilejump"),
                            false,
                            false,
                        );
                        let mut states = Vec::new();
                        self.lower_states(else_ctx, label_name, &mut states, else_body)?;
                        Some(states)
                    }
                    None => None,
                };

                let body_ctx = self
                    .ctxs
                    .derive(break_ctx, Some("body of whilejump"), false, true);
                let mut body_states = Vec::new();
                for statement in body {
                    let rewritten = self.rewrite_loop_statement(statement, break_ctx, body_ctx);
                    self.lower_statement(body_ctx, label_name, &mut body_states, &rewritten)?;
                }

                self.add_state(
                    ctx,
                    dest,
                    StateNode::WhileJump(WhileJumpNode {
                        jump,
                        loop_id,
                        body: body_states,
                        else_body: else_states,
                    }),
                )?;
                self.ctxs.pop_remote(ctx);
            }

            Statement::For(for_loop) => self.lower_for(ctx, label_name, dest, for_loop)?,

            Statement::Inject {
                from_class,
                name,
                args,
            } => self.lower_inject(ctx, label_name, dest, from_class.as_deref(), name, args)?,
        }
        Ok(())
    }

    fn lower_for(
        &mut self,
        ctx: CtxId,
        label_name: Option<&str>,
        dest: &mut Vec<StateNode>,
        for_loop: &ForLoop<Statement>,
    ) -> CompileResult<()> {
        let (mode, values) = match &for_loop.iterator {
            ForIterator::Group(group) => {
                let name = self.ctxs.resolve(ctx, group, "a parametrized group name")?;
                let items = self.groups.get(&name.to_uppercase()).ok_or_else(|| {
                    self.err(ctx, format!("no such group '{name}' to iterate in a for loop"))
                })?;
                // Snapshot: appends from inside the loop body do not affect
                // the current iteration.
                ("group", items.clone())
            }
            ForIterator::Range { from, to, inclusive } => {
                let from = self.parse_replaceable_number(ctx, from)?;
                let to = self.parse_replaceable_number(ctx, to)? + i64::from(*inclusive);
                ("range", (from..to.max(from)).map(|i| i.to_string()).collect())
            }
        };

        if values.is_empty() {
            let Some(else_body) = &for_loop.else_body else {
                return Err(self.err(
                    ctx,
                    "nothing to iterate in for loop, and no else clause",
                ));
            };
            let else_ctx = self.ctxs.derive(ctx, Some("for-else"), false, false);
            for statement in else_body {
                self.lower_statement(else_ctx, label_name, dest, statement)?;
            }
            return Ok(());
        }

        let break_ctx = self
            .ctxs
            .derive(ctx, Some(&format!("for {mode}")), true, false);
        for (i, value) in values.iter().enumerate() {
            let iter_ctx = self.ctxs.derive(
                break_ctx,
                Some(&format!("{mode} loop body #{}", i + 1)),
                false,
                true,
            );
            self.ctxs
                .insert_replacement(iter_ctx, &for_loop.var_name, value.clone());
            if let Some(index_name) = &for_loop.index_name {
                self.ctxs
                    .insert_replacement(iter_ctx, index_name, i.to_string());
            }
            for statement in &for_loop.body {
                let rewritten = self.rewrite_loop_statement(statement, break_ctx, iter_ctx);
                self.lower_statement(iter_ctx, label_name, dest, &rewritten)?;
            }
        }
        Ok(())
    }

    fn lower_inject(
        &mut self,
        ctx: CtxId,
        label_name: Option<&str>,
        dest: &mut Vec<StateNode>,
        from_class: Option<&str>,
        name: &str,
        args: &[Parameter],
    ) -> CompileResult<()> {
        let name = self
            .ctxs
            .resolve(ctx, name, "a parametrized macro injection")?;

        let (mac, inject_ctx, qualified) = match from_class {
            Some(from_class) => {
                let from_class = unstringify(&self.ctxs.resolve(
                    ctx,
                    from_class,
                    "a parametrized extern macro classname",
                )?)
                .to_string();
                let Some(&actor) = self.actor_names.get(&from_class.to_uppercase()) else {
                    return Err(self.err(
                        ctx,
                        format!("unknown extern macro classname '{from_class}'"),
                    ));
                };
                let actor_ctx = self.actors[actor.index()].ctx;
                let Some(mac) = self.ctxs.lookup_macro(actor_ctx, &name).cloned() else {
                    return Err(
                        self.err(ctx, format!("unknown macro '{from_class}.{name}'"))
                    );
                };
                let actor_name = self.actors[actor.index()].name.clone();
                let inject_ctx = self.ctxs.derive(
                    ctx,
                    Some(&format!("macro '{name}' from {actor_name}")),
                    false,
                    false,
                );
                self.ctxs.update(inject_ctx, actor_ctx);
                (mac, inject_ctx, format!("{from_class}.{name}"))
            }
            None => {
                let Some(mac) = self.ctxs.lookup_macro(ctx, &name).cloned() else {
                    return Err(self.err(ctx, format!("unknown macro '{name}'")));
                };
                let inject_ctx =
                    self.ctxs
                        .derive(ctx, Some(&format!("macro '{name}'")), false, false);
                (mac, inject_ctx, name.clone())
            }
        };

        if mac.args.len() != args.len() {
            return Err(self.err(
                ctx,
                format!(
                    "bad number of arguments while trying to inject macro {}; \
                     expected {}, got {}",
                    qualified,
                    mac.args.len(),
                    args.len()
                ),
            ));
        }

        for (arg_name, arg) in mac.args.iter().zip(args) {
            let value = self.lower_parameter(ctx, arg, Some(arg_name))?;
            self.ctxs.insert_replacement(inject_ctx, arg_name, value);
        }

        for statement in &mac.body {
            let rewritten = self.rewrite_macro_statement(statement, inject_ctx);
            self.lower_statement(inject_ctx, label_name, dest, &rewritten)?;
        }
        Ok(())
    }

    fn lower_jump_call(
        &mut self,
        ctx: CtxId,
        call: &ActionCall,
        description: &str,
    ) -> CompileResult<JumpCall> {
        let jump_ctx = self.ctxs.derive(ctx, Some(description), false, false);
        self.ctxs
            .insert_replacement(jump_ctx, "$OFFSET", "$OFFSET".to_string());
        let template = self.lower_state_action(jump_ctx, call)?;
        Ok(JumpCall { template })
    }

    // ------------------------------------------------------------------
    // Control-flow rewriting
    // ------------------------------------------------------------------

    /// Rewrites `break`/`continue` into skips targeting the loop's anchors.
    ///
    /// Descends into conditional and repeat bodies but not into nested
    /// `while`/`whilejump`/`for` loops, whose own lowering rebinds them.
    fn rewrite_loop_statement(
        &self,
        statement: &Statement,
        break_ctx: CtxId,
        loop_ctx: CtxId,
    ) -> Statement {
        let recurse =
            |body: &[Statement]| -> Vec<Statement> {
                body.iter()
                    .map(|s| self.rewrite_loop_statement(s, break_ctx, loop_ctx))
                    .collect()
            };

        match statement {
            Statement::Continue => Statement::SkipTo(Some(self.ctxs.loop_anchor(loop_ctx))),
            Statement::Break => Statement::SkipTo(Some(self.ctxs.break_anchor(break_ctx))),
            Statement::If {
                condition,
                body,
                else_body,
            } => Statement::If {
                condition: condition.clone(),
                body: recurse(body),
                else_body: else_body.as_deref().map(recurse),
            },
            Statement::IfJump {
                jump,
                body,
                else_body,
            } => Statement::IfJump {
                jump: jump.clone(),
                body: recurse(body),
                else_body: else_body.as_deref().map(recurse),
            },
            Statement::Sometimes { chance, body } => Statement::Sometimes {
                chance: chance.clone(),
                body: recurse(body),
            },
            Statement::Repeat {
                count,
                index_name,
                body,
            } => Statement::Repeat {
                count: count.clone(),
                index_name: index_name.clone(),
                body: recurse(body),
            },
            other => other.clone(),
        }
    }

    /// Rewrites `return` into a skip targeting the injection context, making
    /// macro-scope returns possible. Descends into every nested body.
    fn rewrite_macro_statement(&self, statement: &Statement, inject_ctx: CtxId) -> Statement {
        let recurse = |body: &[Statement]| -> Vec<Statement> {
            body.iter()
                .map(|s| self.rewrite_macro_statement(s, inject_ctx))
                .collect()
        };

        match statement {
            Statement::Return => Statement::SkipTo(Some(inject_ctx)),
            Statement::Prebuilt(state) => Statement::Prebuilt(state.clone()),
            Statement::If {
                condition,
                body,
                else_body,
            } => Statement::If {
                condition: condition.clone(),
                body: recurse(body),
                else_body: else_body.as_deref().map(recurse),
            },
            Statement::IfJump {
                jump,
                body,
                else_body,
            } => Statement::IfJump {
                jump: jump.clone(),
                body: recurse(body),
                else_body: else_body.as_deref().map(recurse),
            },
            Statement::While {
                condition,
                body,
                else_body,
            } => Statement::While {
                condition: condition.clone(),
                body: recurse(body),
                else_body: else_body.as_deref().map(recurse),
            },
            Statement::WhileJump {
                jump,
                body,
                else_body,
            } => Statement::WhileJump {
                jump: jump.clone(),
                body: recurse(body),
                else_body: else_body.as_deref().map(recurse),
            },
            Statement::Sometimes { chance, body } => Statement::Sometimes {
                chance: chance.clone(),
                body: recurse(body),
            },
            Statement::Repeat {
                count,
                index_name,
                body,
            } => Statement::Repeat {
                count: count.clone(),
                index_name: index_name.clone(),
                body: recurse(body),
            },
            Statement::For(for_loop) => Statement::For(Box::new(ForLoop {
                var_name: for_loop.var_name.clone(),
                index_name: for_loop.index_name.clone(),
                iterator: for_loop.iterator.clone(),
                body: recurse(&for_loop.body),
                else_body: for_loop.else_body.as_deref().map(recurse),
            })),
            other => other.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Expression and parameter lowering
    // ------------------------------------------------------------------

    fn lower_expression(&mut self, ctx: CtxId, expression: &Expression) -> CompileResult<String> {
        match expression {
            Expression::Seq(items) => {
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    parts.push(self.lower_expression(ctx, item)?);
                }
                Ok(parts.join(" "))
            }
            Expression::Literal(literal) => self.lower_literal(ctx, literal),
            Expression::Operator(op) => Ok(op.clone()),
            Expression::Paren(inner) => Ok(format!("({})", self.lower_expression(ctx, inner)?)),
            Expression::ArrayIndex(inner) => {
                Ok(format!("[{}]", self.lower_expression(ctx, inner)?))
            }
        }
    }

    fn lower_literal(&mut self, ctx: CtxId, literal: &Literal) -> CompileResult<String> {
        match literal {
            Literal::Number(text) => Ok(text.clone()),
            Literal::Str(text) => Ok(stringify(text)),
            Literal::Eval(node) => Ok(eval::evaluate(&self.ctxs, ctx, node)?.to_string()),
            Literal::FormatString(parts) => {
                Ok(stringify(&eval::eval_format_string(&self.ctxs, ctx, parts)?))
            }
            Literal::ActorVariable(name) => Ok(self
                .ctxs
                .lookup_replacement(ctx, name)
                .unwrap_or_else(|| name.clone())),
            Literal::Call(call) => self.lower_action(ctx, call),
            Literal::AnonymousClass(def) => self.lower_anonymous_class(ctx, def),
            Literal::Derivation(derivation) => {
                let actor = self.lower_template_derivation(ctx, derivation, false, None)?;
                Ok(stringify(&self.actors[actor.index()].name))
            }
        }
    }

    fn lower_parameter(
        &mut self,
        ctx: CtxId,
        parameter: &Parameter,
        name: Option<&str>,
    ) -> CompileResult<String> {
        match parameter {
            Parameter::Expression(expression) => self.lower_expression(ctx, expression),
            Parameter::Derivation(derivation) => {
                let actor = self.lower_template_derivation(ctx, derivation, false, None)?;
                Ok(stringify(&self.actors[actor.index()].name))
            }
            Parameter::AnonymousClass(def) => self.lower_anonymous_class(ctx, def),
            Parameter::AnonymousMacro { args, body } => {
                Ok(self.register_anonymous_macro(ctx, args.clone(), body.clone(), name))
            }
        }
    }

    /// Registers an anonymous macro and returns its quoted name. A provided
    /// `name` (the template parameter the macro is passed as) takes the place
    /// of a generated one.
    fn register_anonymous_macro(
        &mut self,
        ctx: CtxId,
        args: Vec<String>,
        body: Vec<Statement>,
        name: Option<&str>,
    ) -> String {
        let name = match name {
            Some(name) => name.to_string(),
            None => format!(
                "ANONYMMACRO_{}_{}",
                self.id.to_uppercase(),
                self.num_anonym_macros
            ),
        };
        self.num_anonym_macros += 1;
        self.ctxs.insert_macro(ctx, &name, Macro { args, body });
        stringify(&name)
    }

    /// Lowers a call-expression literal; the call name itself resolves
    /// through replacements.
    fn lower_action(&mut self, ctx: CtxId, call: &ActionCall) -> CompileResult<String> {
        let name = self
            .ctxs
            .lookup_replacement(ctx, &call.name)
            .unwrap_or_else(|| call.name.clone());
        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            let text = self.lower_parameter(ctx, arg, None)?;
            if !text.is_empty() {
                args.push(text);
            }
        }
        Ok(format!("{}({})", name, args.join(", ")))
    }

    /// Lowers a state action call; emitted bare when it has no arguments.
    /// Lowered argument text gets one more replacement round, so a macro
    /// parameter can stand for a whole argument.
    fn lower_state_action(&mut self, ctx: CtxId, call: &ActionCall) -> CompileResult<String> {
        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            let text = self.lower_parameter(ctx, arg, None)?;
            let text = self.ctxs.lookup_replacement(ctx, &text).unwrap_or(text);
            if !text.is_empty() {
                args.push(text);
            }
        }
        if args.is_empty() {
            Ok(call.name.clone())
        } else {
            Ok(format!("{}({})", call.name, args.join(", ")))
        }
    }

    fn lower_action_or_body(
        &mut self,
        ctx: CtxId,
        action: &StateAction,
    ) -> CompileResult<Vec<String>> {
        match action {
            StateAction::Single(call) => Ok(vec![self.lower_state_action(ctx, call)?]),
            StateAction::Body(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.extend(self.lower_action_or_body(ctx, item)?);
                }
                Ok(out)
            }
            StateAction::Repeated {
                count,
                index_name,
                body,
            } => {
                let count = self.parse_replaceable_number(ctx, count)?;
                let mut out = Vec::new();
                for index in 0..count {
                    let iter_ctx = self.ctxs.derive(ctx, None, false, false);
                    if let Some(index_name) = index_name {
                        self.ctxs
                            .insert_replacement(iter_ctx, index_name, index.to_string());
                    }
                    out.extend(self.lower_action_or_body(iter_ctx, body)?);
                }
                Ok(out)
            }
        }
    }

    /// Resolves state modifier text, substituting replacement references.
    pub(crate) fn lower_state_modifier(
        &self,
        ctx: CtxId,
        text: &ModifierText,
    ) -> CompileResult<String> {
        fn walk(
            comp: &Compiler,
            ctx: CtxId,
            parts: &[ModifierPart],
            out: &mut String,
        ) -> CompileResult<()> {
            for part in parts {
                match part {
                    ModifierPart::Text(text) => out.push_str(text),
                    ModifierPart::Replace(name) => {
                        match comp.ctxs.lookup_replacement(ctx, name) {
                            Some(value) => out.push_str(&value),
                            None => {
                                return Err(comp.err(
                                    ctx,
                                    format!(
                                        "no parameter '{name}' for replacement within modifier"
                                    ),
                                ));
                            }
                        }
                    }
                    ModifierPart::Group(inner) => walk(comp, ctx, inner, out)?,
                }
            }
            Ok(())
        }

        let mut out = String::new();
        walk(self, ctx, text, &mut out)?;
        Ok(out)
    }

    /// Resolves a sprite reference; a parametrized sprite must resolve to a
    /// quoted string.
    pub(crate) fn lower_state_sprite(
        &self,
        ctx: CtxId,
        sprite: &SpriteRef,
    ) -> CompileResult<String> {
        match sprite {
            SpriteRef::Normal(name) => Ok(name.clone()),
            SpriteRef::Parametrized(name) => {
                let Some(value) = self.ctxs.lookup_replacement(ctx, name) else {
                    return Err(self.err(
                        ctx,
                        format!("no parameter '{name}' for parametrized sprite name"),
                    ));
                };
                let bytes = value.as_bytes();
                let quoted = value.len() > 1
                    && (bytes[0] == b'"' || bytes[0] == b'\'')
                    && bytes[bytes.len() - 1] == bytes[0];
                if quoted {
                    Ok(value[1..value.len() - 1].to_string())
                } else {
                    Err(self.err(
                        ctx,
                        format!(
                            "parametrized sprite '{name}' needs to be passed a string; \
                             got {value}"
                        ),
                    ))
                }
            }
        }
    }

    fn format_formattable(&self, ctx: CtxId, name: &FormattableString) -> CompileResult<String> {
        match name {
            FormattableString::Literal(text) => Ok(text.clone()),
            FormattableString::Format(parts) => eval::eval_format_string(&self.ctxs, ctx, parts),
        }
    }

    fn parse_replaceable_number(
        &self,
        ctx: CtxId,
        number: &ReplaceableNumber,
    ) -> CompileResult<i64> {
        match number {
            ReplaceableNumber::Literal(value) => Ok(*value),
            ReplaceableNumber::Name(name) => {
                let text = self
                    .ctxs
                    .lookup_replacement(ctx, name)
                    .unwrap_or_else(|| name.clone());
                text.trim().parse().map_err(|_| {
                    self.err(
                        ctx,
                        format!("invalid repeat count: expected valid integer, got '{text}'"),
                    )
                })
            }
        }
    }

    fn lower_inherit_opt(
        &mut self,
        ctx: CtxId,
        spec: Option<&InheritSpec>,
    ) -> CompileResult<Option<String>> {
        spec.map(|s| self.lower_inherit(ctx, s)).transpose()
    }

    fn lower_inherit(&mut self, ctx: CtxId, spec: &InheritSpec) -> CompileResult<String> {
        match spec {
            InheritSpec::ClassName(name) => Ok(self
                .ctxs
                .lookup_replacement(ctx, name)
                .unwrap_or_else(|| name.clone())),
            InheritSpec::Format(parts) => eval::eval_format_string(&self.ctxs, ctx, parts),
            InheritSpec::Derivation(derivation) => {
                self.ctxs
                    .push_description(ctx, "template derivation inheritance");
                let actor = self.lower_template_derivation(ctx, derivation, false, None)?;
                self.ctxs.pop_description(ctx);
                Ok(self.actors[actor.index()].name.clone())
            }
        }
    }

    // ------------------------------------------------------------------
    // Anonymous classes and template derivations
    // ------------------------------------------------------------------

    /// Creates and fully lowers an anonymous class, returning its quoted
    /// generated name.
    fn lower_anonymous_class(
        &mut self,
        ctx: CtxId,
        def: &AnonymousClassDef,
    ) -> CompileResult<String> {
        let anonym_ctx = self.ctxs.derive(ctx, Some("anonymous class"), false, false);
        let classname = format!("_AnonymClass_{}_{}", self.id, self.anonymous_classes.len());

        if let Some(group) = &def.group {
            let key = unstringify(group).to_uppercase();
            let entry = stringify(&classname);
            match self.groups.get_mut(&key) {
                Some(items) => items.push(entry),
                None => {
                    return Err(self.err(
                        ctx,
                        format!("group '{group}' not found while compiling anonymous class"),
                    ));
                }
            }
        }

        let inherit = self.lower_inherit_opt(ctx, def.inherit.as_ref())?;
        let actor = self.create_actor(classname, inherit, None, None, anonym_ctx);
        let actor_ctx = self.actors[actor.index()].ctx;
        self.lower_class_body(actor, actor_ctx, &def.body)?;

        self.actor_order.push(actor);
        self.anonymous_classes.push(actor);
        Ok(stringify(&self.actors[actor.index()].name))
    }

    /// Lowers a template derivation. `enqueue` defers the body parse to the
    /// pending queue (static derivations); otherwise a fresh instantiation's
    /// body is parsed immediately.
    fn lower_template_derivation(
        &mut self,
        ctx: CtxId,
        derivation: &TemplateDerivation,
        enqueue: bool,
        name: Option<String>,
    ) -> CompileResult<ActorId> {
        let inherit = match &derivation.inherit {
            Some(spec) => Some(self.lower_inherit(ctx, spec)?),
            None => None,
        };
        let group = match &derivation.group {
            Some(group) => Some(self.ctxs.resolve(
                ctx,
                group,
                "a parametrized group name in a template derivation",
            )?),
            None => None,
        };

        let Some(template_id) = self.ctxs.lookup_template(ctx, &derivation.template_name) else {
            return Err(self.err(
                ctx,
                format!("unknown template '{}' to derive", derivation.template_name),
            ));
        };

        let parameters = self.templates[template_id.index()].parameters.clone();
        if parameters.len() != derivation.params.len() {
            return Err(self.err(
                ctx,
                format!(
                    "bad number of template parameters for '{}': expected {}, got {}",
                    derivation.template_name,
                    parameters.len(),
                    derivation.params.len()
                ),
            ));
        }

        let mut parameter_values = Vec::with_capacity(derivation.params.len());
        for (i, parameter) in derivation.params.iter().enumerate() {
            parameter_values.push(self.lower_parameter(ctx, parameter, Some(&parameters[i]))?);
        }

        let mut provided_labels = BTreeSet::new();
        let mut provided_macros = BTreeMap::new();
        let mut provided_arrays = BTreeMap::new();
        let mut lowered_arrays = Vec::new();
        let mut body_items: Vec<ClassBodyItem> = Vec::new();
        for item in &derivation.body {
            match item {
                DerivationBodyItem::Label(label) => {
                    provided_labels.insert(label.name.to_uppercase());
                    body_items.push(ClassBodyItem::Label(label.clone()));
                }
                DerivationBodyItem::Macro(mac) => {
                    provided_macros.insert(mac.name.to_uppercase(), mac.args.len());
                    body_items.push(ClassBodyItem::Macro(mac.clone()));
                }
                DerivationBodyItem::Array { name, values } => {
                    let mut lowered = Vec::with_capacity(values.len());
                    for value in values {
                        lowered.push(self.lower_expression(ctx, value)?);
                    }
                    provided_arrays.insert(name.to_uppercase(), lowered.len());
                    lowered_arrays.push(LoweredArray {
                        name: name.clone(),
                        values: lowered,
                    });
                }
                DerivationBodyItem::Item(item) => body_items.push(item.clone()),
            }
        }

        let (fresh, actor) = self.instantiate_template(
            template_id,
            ctx,
            &parameter_values,
            &provided_labels,
            &provided_macros,
            &provided_arrays,
            name,
            inherit,
            group,
        )?;

        if fresh {
            let mut body = self.templates[template_id.index()].parse_data.clone();
            body.extend(body_items);
            let task = TaskKind::TemplateBody {
                actor,
                ctx: self.actors[actor.index()].ctx,
                template: template_id,
                arrays: lowered_arrays,
                body,
            };
            if enqueue {
                self.enqueue(0, task);
            } else {
                self.run_task(task)?;
            }
        }
        Ok(actor)
    }

    /// Memoized template instantiation: returns `(false, actor)` for a
    /// repeated derivation with identical inputs and no abstract members,
    /// or `(true, actor)` when a fresh actor was created and registered.
    #[expect(clippy::too_many_arguments, reason = "derivation inputs are one bundle")]
    fn instantiate_template(
        &mut self,
        template_id: TemplateId,
        caller_ctx: CtxId,
        parameter_values: &[String],
        provided_labels: &BTreeSet<String>,
        provided_macros: &BTreeMap<String, usize>,
        provided_arrays: &BTreeMap<String, usize>,
        name: Option<String>,
        inherit_override: Option<String>,
        group_override: Option<String>,
    ) -> CompileResult<(bool, ActorId)> {
        let hash = {
            let Self { templates, ids, .. } = self;
            templates[template_id.index()].parameter_hash(
                ids,
                parameter_values,
                provided_labels,
                provided_macros,
                provided_arrays,
            )
        };

        let template = &self.templates[template_id.index()];
        if !template.has_abstract_members()
            && let Some(&existing) = template.instances.get(&hash)
        {
            return Ok((false, existing));
        }

        template.validate_derivation(
            &self.ctxs.describe(caller_ctx),
            provided_labels,
            provided_macros,
            provided_arrays,
        )?;

        let template_name = template.name.clone();
        let template_inherit = template.inherit.clone();
        let template_replace = template.replace.clone();
        let template_num = template.editor_num;
        let template_group = template.group.clone();
        let template_parameters = template.parameters.clone();

        let new_name = match name {
            Some(name) => name,
            None => self.templates[template_id.index()].derived_name(&hash),
        };

        if let Some(group) = &template_group {
            self.require_group(caller_ctx, group, &template_name)?
                .push(stringify(&new_name));
        }
        if let Some(group) = &group_override {
            let key = group.to_uppercase();
            if Some(&key) != template_group.as_ref() {
                self.require_group(caller_ctx, &key, &template_name)?
                    .push(stringify(&new_name));
            }
        }

        let derive_ctx = self.ctxs.derive(
            caller_ctx,
            Some(&format!("derivation of template {template_name}")),
            false,
            false,
        );
        for (parameter, value) in template_parameters.iter().zip(parameter_values) {
            self.ctxs
                .insert_replacement(derive_ctx, parameter, value.clone());
        }

        let inherit = match inherit_override {
            Some(inherit) => Some(inherit),
            None => template_inherit
                .map(|i| self.ctxs.lookup_replacement(derive_ctx, &i).unwrap_or(i)),
        };
        let replace = template_replace
            .map(|r| self.ctxs.lookup_replacement(derive_ctx, &r).unwrap_or(r));
        self.ctxs
            .insert_replacement(derive_ctx, "SELF", stringify(&new_name));

        let actor = self.create_actor(new_name.clone(), inherit, replace, template_num, derive_ctx);
        self.templates[template_id.index()]
            .instances
            .insert(hash, actor);
        self.actor_names.insert(new_name.to_uppercase(), actor);
        self.actor_order.push(actor);
        Ok((true, actor))
    }

    fn require_group(
        &mut self,
        ctx: CtxId,
        group_key: &str,
        derived_from: &str,
    ) -> CompileResult<&mut Vec<String>> {
        if !self.groups.contains_key(group_key) {
            return Err(self.err(
                ctx,
                format!("no such group '{group_key}' in derivation of {derived_from}"),
            ));
        }
        Ok(self
            .groups
            .get_mut(group_key)
            .expect("group presence was just checked"))
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    fn to_decorate(&self) -> TextNode {
        let mut node = TextNode::with_indent(0);
        node.add_line(format!("// :ZDCODE version='{VERSION}' id='{}' ", self.id));
        for inventory in &self.inventories {
            node.add_node(inventory.to_decorate());
        }
        for &actor in &self.actor_order {
            node.add_node(self.actors[actor.index()].to_decorate(&self.ctxs));
        }
        node
    }

    /// Serializes the compiled program with the default tab width of 4.
    pub fn decorate(&self) -> String {
        self.decorate_with_tab(4)
    }

    /// Serializes the compiled program with a caller-chosen tab width.
    pub fn decorate_with_tab(&self, tab_size: usize) -> String {
        self.to_decorate().to_string_with_tab(tab_size)
    }

    /// Renders the context state tree, for debugging offset arithmetic.
    pub fn state_tree(&self) -> String {
        self.ctxs.state_tree_string(self.ctxs.root())
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}
