//! The parse-context tree.
//!
//! Contexts serve three orthogonal purposes: lexical scoping of names
//! (replacements, macros, templates, modifiers), description paths for
//! diagnostics, and state-count bookkeeping for jump-offset arithmetic.
//!
//! All contexts live in one arena owned by the [`ContextTree`] and are
//! addressed by [`CtxId`] handles; skip states store a handle instead of a
//! reference, which resolves the context/skip ownership cycle. Scope maps are
//! layered: a derived context owns a fresh top layer and shares every parent
//! layer below it, so writes never leak outward while lookups see the whole
//! chain.

use ahash::AHashMap;

use crate::{
    ast::Statement,
    error::{CompileError, CompileResult},
    modifier::ModClause,
    template::TemplateId,
};

/// Handle of a context inside the [`ContextTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CtxId(u32);

impl CtxId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// A macro registered in a scope: parameter names and an uncloned body.
///
/// The body is only cloned out of the scope map at injection time.
#[derive(Debug, Clone)]
pub(crate) struct Macro {
    pub args: Vec<String>,
    pub body: Vec<Statement>,
}

/// Handle of one scope layer inside a [`ScopeStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LayerId(u32);

/// Arena of scope layers for one kind of name.
#[derive(Debug)]
struct ScopeStore<V> {
    layers: Vec<AHashMap<String, V>>,
}

impl<V> ScopeStore<V> {
    fn new() -> Self {
        Self { layers: Vec::new() }
    }

    fn alloc(&mut self) -> LayerId {
        let id = LayerId(u32::try_from(self.layers.len()).expect("scope layer arena overflow"));
        self.layers.push(AHashMap::new());
        id
    }

    fn insert(&mut self, layer: LayerId, key: String, value: V) {
        self.layers[layer.0 as usize].insert(key, value);
    }

    /// Walks the layer chain front to back, innermost scope first.
    fn lookup(&self, chain: &[LayerId], key: &str) -> Option<&V> {
        chain
            .iter()
            .find_map(|layer| self.layers[layer.0 as usize].get(key))
    }
}

#[derive(Debug)]
struct Context {
    parent: Option<CtxId>,
    repl_chain: Vec<LayerId>,
    macro_chain: Vec<LayerId>,
    template_chain: Vec<LayerId>,
    mod_chain: Vec<LayerId>,
    /// Modifier clauses applied by `apply` statements in this exact scope.
    applied_mods: Vec<ModClause>,
    desc_stack: Vec<String>,
    /// States added directly to this context (post-modifier counts).
    own_states: u32,
    children: Vec<CtxId>,
    /// Children whose states do not contribute to the local count, only the
    /// remote one. Constructs that wrap their body in pad states lower the
    /// body under one of these.
    remote_children: Vec<CtxId>,
    remote_offset: u32,
    break_ctx: CtxId,
    loop_ctx: CtxId,
}

/// Arena of parse contexts plus the scope-layer stores they share.
#[derive(Debug)]
pub(crate) struct ContextTree {
    nodes: Vec<Context>,
    replacements: ScopeStore<String>,
    macros: ScopeStore<Macro>,
    templates: ScopeStore<TemplateId>,
    mods: ScopeStore<Vec<ModClause>>,
}

impl ContextTree {
    /// Creates the tree with a root context carrying `description`.
    pub fn new(description: &str) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            replacements: ScopeStore::new(),
            macros: ScopeStore::new(),
            templates: ScopeStore::new(),
            mods: ScopeStore::new(),
        };
        let root = CtxId(0);
        let node = Context {
            parent: None,
            repl_chain: vec![tree.replacements.alloc()],
            macro_chain: vec![tree.macros.alloc()],
            template_chain: vec![tree.templates.alloc()],
            mod_chain: vec![tree.mods.alloc()],
            applied_mods: Vec::new(),
            desc_stack: vec![description.to_string()],
            own_states: 0,
            children: Vec::new(),
            remote_children: Vec::new(),
            remote_offset: 0,
            break_ctx: root,
            loop_ctx: root,
        };
        tree.nodes.push(node);
        tree
    }

    pub fn root(&self) -> CtxId {
        CtxId(0)
    }

    fn node(&self, id: CtxId) -> &Context {
        &self.nodes[id.index()]
    }

    fn node_mut(&mut self, id: CtxId) -> &mut Context {
        &mut self.nodes[id.index()]
    }

    fn new_child(
        &mut self,
        parent: CtxId,
        description: Option<&str>,
        remote_offset: u32,
        own_break: bool,
        own_loop: bool,
    ) -> CtxId {
        let id = CtxId(u32::try_from(self.nodes.len()).expect("context arena overflow"));

        let repl_top = self.replacements.alloc();
        let macro_top = self.macros.alloc();
        let template_top = self.templates.alloc();
        let mod_top = self.mods.alloc();

        let parent_node = self.node(parent);
        let mut repl_chain = Vec::with_capacity(parent_node.repl_chain.len() + 1);
        repl_chain.push(repl_top);
        repl_chain.extend_from_slice(&parent_node.repl_chain);
        let mut macro_chain = Vec::with_capacity(parent_node.macro_chain.len() + 1);
        macro_chain.push(macro_top);
        macro_chain.extend_from_slice(&parent_node.macro_chain);
        let mut template_chain = Vec::with_capacity(parent_node.template_chain.len() + 1);
        template_chain.push(template_top);
        template_chain.extend_from_slice(&parent_node.template_chain);
        let mut mod_chain = Vec::with_capacity(parent_node.mod_chain.len() + 1);
        mod_chain.push(mod_top);
        mod_chain.extend_from_slice(&parent_node.mod_chain);

        let mut desc_stack = parent_node.desc_stack.clone();
        if let Some(desc) = description {
            desc_stack.push(desc.to_string());
        }

        let node = Context {
            parent: Some(parent),
            repl_chain,
            macro_chain,
            template_chain,
            mod_chain,
            applied_mods: Vec::new(),
            desc_stack,
            own_states: 0,
            children: Vec::new(),
            remote_children: Vec::new(),
            remote_offset,
            break_ctx: if own_break { id } else { parent_node.break_ctx },
            loop_ctx: if own_loop { id } else { parent_node.loop_ctx },
        };
        self.nodes.push(node);
        id
    }

    /// Derives a child context that contributes to both the local and the
    /// remote state count of `parent`.
    pub fn derive(
        &mut self,
        parent: CtxId,
        description: Option<&str>,
        own_break: bool,
        own_loop: bool,
    ) -> CtxId {
        let id = self.new_child(parent, description, 0, own_break, own_loop);
        self.node_mut(parent).children.push(id);
        id
    }

    /// Derives a child that contributes only to the remote count, with an
    /// extra `remote_offset` standing in for the pad states of the construct
    /// being lowered.
    pub fn remote_derive(
        &mut self,
        parent: CtxId,
        description: Option<&str>,
        remote_offset: u32,
        own_break: bool,
        own_loop: bool,
    ) -> CtxId {
        let id = self.new_child(parent, description, remote_offset, own_break, own_loop);
        self.node_mut(parent).remote_children.push(id);
        id
    }

    /// Detaches the most recent remote child, once the finished construct
    /// node has been counted in its place.
    pub fn pop_remote(&mut self, ctx: CtxId) {
        let popped = self.node_mut(ctx).remote_children.pop();
        debug_assert!(popped.is_some(), "pop_remote on a context without remote children");
    }

    /// Records `count` emitted states added directly to `ctx`.
    pub fn add_states(&mut self, ctx: CtxId, count: u32) {
        self.node_mut(ctx).own_states += count;
    }

    /// Number of states contributing to the enclosing label locally.
    pub fn num_states(&self, ctx: CtxId) -> u32 {
        let node = self.node(ctx);
        node.own_states
            + node
                .children
                .iter()
                .map(|&c| self.num_states(c))
                .sum::<u32>()
    }

    /// Local count plus the remote offset and every remote child's total.
    /// Skip states index into this sum.
    pub fn remote_num_states(&self, ctx: CtxId) -> u32 {
        let node = self.node(ctx);
        node.remote_offset
            + node.own_states
            + node
                .children
                .iter()
                .chain(&node.remote_children)
                .map(|&c| self.remote_num_states(c))
                .sum::<u32>()
    }

    pub fn break_anchor(&self, ctx: CtxId) -> CtxId {
        self.node(ctx).break_ctx
    }

    pub fn loop_anchor(&self, ctx: CtxId) -> CtxId {
        self.node(ctx).loop_ctx
    }

    /// The ` at `-joined description path, innermost first.
    pub fn describe(&self, ctx: CtxId) -> String {
        let mut parts: Vec<&str> = self.node(ctx).desc_stack.iter().map(String::as_str).collect();
        parts.reverse();
        parts.join(" at ")
    }

    pub fn push_description(&mut self, ctx: CtxId, description: impl Into<String>) {
        self.node_mut(ctx).desc_stack.push(description.into());
    }

    pub fn pop_description(&mut self, ctx: CtxId) {
        self.node_mut(ctx).desc_stack.pop();
    }

    /// Inserts the scope chains of `other` just above the root layers of
    /// `ctx`, giving `ctx` visibility into another class's names without
    /// shadowing its own.
    ///
    /// Contexts derived from `ctx` afterwards inherit the imported layers;
    /// previously derived children do not.
    pub fn update(&mut self, ctx: CtxId, other: CtxId) {
        let other_repl = self.node(other).repl_chain.clone();
        let other_macro = self.node(other).macro_chain.clone();
        let other_template = self.node(other).template_chain.clone();
        let other_mod = self.node(other).mod_chain.clone();

        let node = self.node_mut(ctx);
        let at = node.repl_chain.len() - 1;
        node.repl_chain.splice(at..at, other_repl);
        let at = node.macro_chain.len() - 1;
        node.macro_chain.splice(at..at, other_macro);
        let at = node.template_chain.len() - 1;
        node.template_chain.splice(at..at, other_template);
        let at = node.mod_chain.len() - 1;
        node.mod_chain.splice(at..at, other_mod);
    }

    pub fn insert_replacement(&mut self, ctx: CtxId, name: &str, value: String) {
        let layer = self.node(ctx).repl_chain[0];
        self.replacements.insert(layer, name.to_uppercase(), value);
    }

    pub fn lookup_replacement(&self, ctx: CtxId, name: &str) -> Option<String> {
        self.replacements
            .lookup(&self.node(ctx).repl_chain, &name.to_uppercase())
            .cloned()
    }

    pub fn insert_macro(&mut self, ctx: CtxId, name: &str, mac: Macro) {
        let layer = self.node(ctx).macro_chain[0];
        self.macros.insert(layer, name.to_uppercase(), mac);
    }

    pub fn lookup_macro(&self, ctx: CtxId, name: &str) -> Option<&Macro> {
        self.macros
            .lookup(&self.node(ctx).macro_chain, &name.to_uppercase())
    }

    pub fn insert_template(&mut self, ctx: CtxId, name: &str, template: TemplateId) {
        let layer = self.node(ctx).template_chain[0];
        self.templates.insert(layer, name.to_uppercase(), template);
    }

    pub fn lookup_template(&self, ctx: CtxId, name: &str) -> Option<TemplateId> {
        self.templates
            .lookup(&self.node(ctx).template_chain, &name.to_uppercase())
            .copied()
    }

    pub fn insert_mod(&mut self, ctx: CtxId, name: &str, clauses: Vec<ModClause>) {
        let layer = self.node(ctx).mod_chain[0];
        self.mods.insert(layer, name.to_uppercase(), clauses);
    }

    pub fn lookup_mod(&self, ctx: CtxId, name: &str) -> Option<&[ModClause]> {
        self.mods
            .lookup(&self.node(ctx).mod_chain, &name.to_uppercase())
            .map(Vec::as_slice)
    }

    pub fn extend_applied_mods(&mut self, ctx: CtxId, clauses: impl IntoIterator<Item = ModClause>) {
        self.node_mut(ctx).applied_mods.extend(clauses);
    }

    /// Collects every modifier clause applied at `ctx` or any enclosing
    /// scope, outermost first.
    pub fn applied_mods(&self, ctx: CtxId) -> Vec<ModClause> {
        let mut chain = Vec::new();
        let mut cursor = Some(ctx);
        while let Some(id) = cursor {
            chain.push(id);
            cursor = self.node(id).parent;
        }
        let mut out = Vec::new();
        for id in chain.into_iter().rev() {
            out.extend(self.node(id).applied_mods.iter().cloned());
        }
        out
    }

    /// Peels `@` sigils off `name`, substituting through the replacement map.
    ///
    /// Each peel strips the sigils, looks the remaining name up, and glues
    /// one fewer sigil onto the replacement. A failed lookup on the original
    /// name is an error; once a substitution has happened, a failed lookup
    /// stops peeling and the partially-resolved name is returned as written.
    pub fn resolve(&self, ctx: CtxId, name: &str, role: &str) -> CompileResult<String> {
        let mut current = name.to_string();
        let mut substituted = false;
        while current.starts_with('@') {
            let stripped = current.trim_start_matches('@');
            let sigils = current.len() - stripped.len();
            match self.lookup_replacement(ctx, stripped) {
                Some(value) => {
                    current = format!("{}{}", "@".repeat(sigils - 1), value);
                    substituted = true;
                }
                None if substituted => break,
                None => {
                    return Err(CompileError::at(
                        self.describe(ctx),
                        format!(
                            "no such replacement '{}' while trying to resolve '{}' as {}",
                            stripped.to_uppercase(),
                            name,
                            role
                        ),
                    ));
                }
            }
        }
        Ok(current)
    }

    /// Renders the state tree under `ctx` for debugging: description, local
    /// and remote counts, recursing through local and remote children.
    pub fn state_tree_string(&self, ctx: CtxId) -> String {
        fn walk(tree: &ContextTree, ctx: CtxId, depth: usize, out: &mut String) {
            let node = tree.node(ctx);
            let name = node.desc_stack.last().map_or("?", String::as_str);
            out.push_str(&format!(
                "{}+ {} ({}/{})\n",
                "  ".repeat(depth),
                name,
                tree.num_states(ctx),
                tree.remote_num_states(ctx),
            ));
            for &child in &node.children {
                walk(tree, child, depth + 1, out);
            }
            for &child in &node.remote_children {
                out.push_str(&format!("{}* remote:\n", "  ".repeat(depth + 1)));
                walk(tree, child, depth + 2, out);
            }
        }
        let mut out = String::new();
        walk(self, ctx, 0, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn resolve_follows_replacement_chains() {
        let mut tree = ContextTree::new("global");
        let root = tree.root();
        tree.insert_replacement(root, "X", "Y".to_string());
        tree.insert_replacement(root, "Y", "Z".to_string());
        assert_eq!(tree.resolve(root, "@@X", "a test name").unwrap(), "Z");
    }

    #[test]
    fn resolve_keeps_leftover_sigils_after_first_substitution() {
        let mut tree = ContextTree::new("global");
        let root = tree.root();
        tree.insert_replacement(root, "X", "Y".to_string());
        assert_eq!(tree.resolve(root, "@@X", "a test name").unwrap(), "@Y");
    }

    #[test]
    fn resolve_errors_on_unknown_first_lookup() {
        let tree = ContextTree::new("global");
        assert!(tree.resolve(tree.root(), "@MISSING", "a test name").is_err());
    }

    #[test]
    fn resolve_passes_plain_names_through() {
        let tree = ContextTree::new("global");
        assert_eq!(
            tree.resolve(tree.root(), "Zombie", "a test name").unwrap(),
            "Zombie"
        );
    }

    #[test]
    fn derived_scopes_shadow_without_leaking() {
        let mut tree = ContextTree::new("global");
        let root = tree.root();
        tree.insert_replacement(root, "NAME", "outer".to_string());
        let child = tree.derive(root, Some("child"), false, false);
        tree.insert_replacement(child, "NAME", "inner".to_string());

        assert_eq!(tree.lookup_replacement(child, "name").unwrap(), "inner");
        assert_eq!(tree.lookup_replacement(root, "name").unwrap(), "outer");
    }

    #[test]
    fn update_imports_names_without_shadowing_locals() {
        let mut tree = ContextTree::new("global");
        let root = tree.root();
        tree.insert_replacement(root, "A", "root".to_string());

        let other = tree.derive(root, Some("other class"), false, false);
        tree.insert_replacement(other, "A", "other".to_string());
        tree.insert_replacement(other, "B", "other-only".to_string());

        let target = tree.derive(root, Some("target"), false, false);
        tree.insert_replacement(target, "A", "local".to_string());
        tree.update(target, other);

        assert_eq!(tree.lookup_replacement(target, "A").unwrap(), "local");
        assert_eq!(tree.lookup_replacement(target, "B").unwrap(), "other-only");
    }

    #[test]
    fn local_and_remote_counts_differ_by_offset_and_remote_children() {
        let mut tree = ContextTree::new("global");
        let root = tree.root();
        tree.add_states(root, 2);

        let local = tree.derive(root, Some("local"), false, false);
        tree.add_states(local, 3);

        let remote = tree.remote_derive(root, Some("remote"), 2, false, false);
        tree.add_states(remote, 4);

        assert_eq!(tree.num_states(root), 5);
        assert_eq!(tree.remote_num_states(root), 5 + 2 + 4);

        tree.pop_remote(root);
        assert_eq!(tree.remote_num_states(root), 5);
    }

    #[test]
    fn describe_reads_innermost_first() {
        let mut tree = ContextTree::new("global");
        let root = tree.root();
        let class_ctx = tree.derive(root, Some("class 'Imp'"), false, false);
        tree.push_description(class_ctx, "label 'Spawn'");
        assert_eq!(tree.describe(class_ctx), "label 'Spawn' at class 'Imp' at global");
    }

    #[test]
    fn anchors_inherit_unless_owned() {
        let mut tree = ContextTree::new("global");
        let root = tree.root();
        let looped = tree.derive(root, Some("loop"), true, true);
        let inner = tree.derive(looped, Some("body"), false, false);
        assert_eq!(tree.break_anchor(inner), looped);
        assert_eq!(tree.loop_anchor(inner), looped);
        assert_eq!(tree.break_anchor(root), root);
    }
}
