//! Dependency graph: the global exporter map, per-module dependency edges,
//! cycle detection, and the dependency-list ordering depmod must emit.
//!
//! Modules are stored in a flat arena (`ModuleSet`) and referenced by
//! `ModuleId`, rather than the pointer-linked "deleted module" parking list
//! the original tool used — deletions just leave a tombstone slot behind.

use std::collections::HashMap;

use crate::elf::SymKind;

/// Index into a [`ModuleSet`]. Stable for the lifetime of the set; never
/// reused, even after [`ModuleSet::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(usize);

/// One module known to the resolver: its canonical name, on-disk path, and
/// the symbols it exports/imports.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub path: String,
    pub exports: Vec<String>,
    pub imports: Vec<(String, SymKind)>,
    /// Dependencies discovered by symbol resolution, in discovery order,
    /// deduplicated.
    pub deps: Vec<ModuleId>,
    tombstoned: bool,
}

/// Arena of [`Module`]s, indexed by [`ModuleId`].
#[derive(Debug, Default)]
pub struct ModuleSet {
    modules: Vec<Module>,
    by_name: HashMap<String, ModuleId>,
}

impl ModuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new module, returning its id. Panics if `name` is already
    /// present; callers resolve duplicate-basename priority before
    /// insertion (see the directory-walk module).
    pub fn insert(&mut self, name: String, path: String) -> ModuleId {
        assert!(
            !self.by_name.contains_key(&name),
            "duplicate module name inserted into ModuleSet: {name}"
        );
        let id = ModuleId(self.modules.len());
        self.modules.push(Module {
            name: name.clone(),
            path,
            exports: Vec::new(),
            imports: Vec::new(),
            deps: Vec::new(),
            tombstoned: false,
        });
        self.by_name.insert(name, id);
        id
    }

    pub fn get(&self, id: ModuleId) -> &Module {
        &self.modules[id.0]
    }

    pub fn get_mut(&mut self, id: ModuleId) -> &mut Module {
        &mut self.modules[id.0]
    }

    pub fn find(&self, name: &str) -> Option<ModuleId> {
        self.by_name.get(name).copied()
    }

    /// Tombstone a module. Its id remains valid for lookups already holding
    /// it but is dropped from `find`/`iter`.
    pub fn remove(&mut self, id: ModuleId) {
        self.by_name.remove(&self.modules[id.0].name);
        self.modules[id.0].tombstoned = true;
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModuleId, &Module)> {
        self.modules
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.tombstoned)
            .map(|(i, m)| (ModuleId(i), m))
    }

    /// Like [`Self::iter`], but mutable. Used to strip edges pointing at a
    /// module that [`prune_cycles`] just tombstoned.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ModuleId, &mut Module)> {
        self.modules
            .iter_mut()
            .enumerate()
            .filter(|(_, m)| !m.tombstoned)
            .map(|(i, m)| (ModuleId(i), m))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Maps an exported symbol name to the module that owns it, or `None` for
/// symbols the running/target kernel itself exports.
///
/// Built once per depmod run from every module's export list plus an
/// optional `System.map`; consulted while resolving every module's
/// undefined-symbol list.
#[derive(Debug, Default)]
pub struct ExporterMap {
    owner: HashMap<String, Option<ModuleId>>,
}

/// Symbols the kernel defines itself; never attributed to a module even if
/// a module's symbol table happens to reference them by name.
const KERNEL_MAGIC_SYMBOLS: &[&str] = &["__this_module", "_GLOBAL_OFFSET_TABLE_"];

impl ExporterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `module` exports `symbol`.
    ///
    /// Last writer wins, matching the directory walk's basename-priority
    /// order: modules are registered in priority order, so a higher
    /// priority module's export shadows an earlier, lower priority one.
    pub fn add_export(&mut self, symbol: &str, module: ModuleId) {
        self.owner.insert(symbol.to_owned(), Some(module));
    }

    /// Load `System.map`-style `addr T symbol` lines, stripping the
    /// `__ksymtab_` prefix `nm` emits for kernel-exported symbols. These
    /// are always kernel-owned (`None`).
    pub fn load_system_map(&mut self, text: &str) {
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let (Some(_addr), Some(_kind), Some(name)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let name = name.strip_prefix("__ksymtab_").unwrap_or(name);
            self.owner.entry(name.to_owned()).or_insert(None);
        }
        for sym in KERNEL_MAGIC_SYMBOLS {
            self.owner.insert((*sym).to_owned(), None);
        }
    }

    /// Resolve a symbol. `None` outer means unknown entirely; `Some(None)`
    /// means it's kernel-owned; `Some(Some(id))` names the exporting
    /// module.
    pub fn resolve(&self, symbol: &str) -> Option<Option<ModuleId>> {
        self.owner.get(symbol).copied()
    }
}

/// Resolve every module's imports against `exporters`, recording edges in
/// `deps`. Unresolved symbols (no known exporter) are silently dropped, as
/// is a module importing its own export (self-dependency).
pub fn resolve_deps(set: &mut ModuleSet, exporters: &ExporterMap) {
    let ids: Vec<ModuleId> = set.iter().map(|(id, _)| id).collect();
    for id in ids {
        let mut deps = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (sym, _kind) in set.get(id).imports.clone() {
            if let Some(Some(owner)) = exporters.resolve(&sym) {
                if owner != id && seen.insert(owner) {
                    deps.push(owner);
                }
            }
        }
        set.get_mut(id).deps = deps;
    }
}

/// Depth-first search for a cycle reachable from `start`, iterative to
/// avoid unbounded stack growth on deep dependency chains.
///
/// On finding a cycle, reports it starting from the lexicographically
/// smallest module name on the cycle, so the same cycle always prints
/// identically regardless of which module the walk started from.
pub fn find_cycle(set: &ModuleSet, start: ModuleId) -> Option<Vec<ModuleId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Active,
        Done,
    }

    let mut mark: HashMap<ModuleId, Mark> = HashMap::new();
    let mut path: Vec<ModuleId> = Vec::new();
    // Stack entries are (node, next child index to visit).
    let mut stack: Vec<(ModuleId, usize)> = vec![(start, 0)];
    mark.insert(start, Mark::Active);
    path.push(start);

    while let Some(&mut (node, ref mut idx)) = stack.last_mut() {
        let deps = &set.get(node).deps;
        if *idx < deps.len() {
            let child = deps[*idx];
            *idx += 1;
            match mark.get(&child) {
                Some(Mark::Active) => {
                    let start_pos = path.iter().position(|&m| m == child).unwrap();
                    let mut cycle = path[start_pos..].to_vec();
                    rotate_to_min(set, &mut cycle);
                    return Some(cycle);
                }
                Some(Mark::Done) => continue,
                None => {
                    mark.insert(child, Mark::Active);
                    path.push(child);
                    stack.push((child, 0));
                }
            }
        } else {
            stack.pop();
            path.pop();
            mark.insert(node, Mark::Done);
        }
    }
    None
}

/// Rotate `cycle` so it begins at its lexicographically smallest module
/// name, giving a canonical starting point for the same cycle found from
/// different entry modules.
fn rotate_to_min(set: &ModuleSet, cycle: &mut Vec<ModuleId>) {
    if cycle.is_empty() {
        return;
    }
    let min_pos = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, &id)| &set.get(id).name)
        .map(|(i, _)| i)
        .unwrap();
    cycle.rotate_left(min_pos);
}

/// Render a cycle as `a -> b -> c -> a` for error messages.
pub fn format_cycle(set: &ModuleSet, cycle: &[ModuleId]) -> String {
    let mut names: Vec<&str> = cycle.iter().map(|&id| set.get(id).name.as_str()).collect();
    if let Some(&first) = names.first() {
        names.push(first);
    }
    names.join(" -> ")
}

/// Find and break every dependency cycle in `set`, one loop at a time.
///
/// Each loop found is reported with a single `tracing::warn!` (canonical
/// root per [`find_cycle`]/[`rotate_to_min`]), then that root module is
/// tombstoned via [`ModuleSet::remove`] and stripped from every remaining
/// module's `deps`, so the graph it participated in becomes acyclic.
/// Restarts from the beginning after each removal until no loop remains.
/// Returns the names of every module dropped this way, in removal order.
pub fn prune_cycles(set: &mut ModuleSet) -> Vec<String> {
    let mut removed = Vec::new();
    loop {
        let ids: Vec<ModuleId> = set.iter().map(|(id, _)| id).collect();
        let cycle = ids.into_iter().find_map(|id| find_cycle(set, id));
        let Some(cycle) = cycle else { break };

        let root = cycle[0];
        let name = set.get(root).name.clone();
        tracing::warn!(
            module = %name,
            loop_ = %format_cycle(set, &cycle),
            "dependency cycle detected, dropping module"
        );

        set.remove(root);
        for (_, module) in set.iter_mut() {
            module.deps.retain(|&dep| dep != root);
        }
        removed.push(name);
    }
    removed
}

/// Full transitive dependency list for `root`, in the order `modprobe`
/// must load them: dependencies before dependents, each module listed
/// exactly once, via iterative reverse post-order DFS.
pub fn order_dep_list(set: &ModuleSet, root: ModuleId) -> Vec<ModuleId> {
    let mut visited = std::collections::HashSet::new();
    let mut order = Vec::new();
    // (node, next child index)
    let mut stack: Vec<(ModuleId, usize)> = vec![(root, 0)];
    visited.insert(root);

    while let Some(&mut (node, ref mut idx)) = stack.last_mut() {
        let deps = &set.get(node).deps;
        if *idx < deps.len() {
            let child = deps[*idx];
            *idx += 1;
            if visited.insert(child) {
                stack.push((child, 0));
            }
        } else {
            order.push(node);
            stack.pop();
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(names: &[&str]) -> (ModuleSet, HashMap<&'static str, ModuleId>) {
        let mut set = ModuleSet::new();
        let mut ids = HashMap::new();
        for &n in names {
            let path = format!("/lib/modules/x/{n}.ko");
            let id = set.insert(n.to_owned(), path);
            ids.insert(n, id);
        }
        (set, ids)
    }

    #[test]
    fn resolves_simple_chain() {
        let (mut set, ids) = make(&["a", "b", "c"]);
        set.get_mut(ids["a"]).imports = vec![("sym_b".into(), SymKind::Strong)];
        set.get_mut(ids["b"]).imports = vec![("sym_c".into(), SymKind::Strong)];

        let mut exporters = ExporterMap::new();
        exporters.add_export("sym_b", ids["b"]);
        exporters.add_export("sym_c", ids["c"]);

        resolve_deps(&mut set, &exporters);
        assert_eq!(set.get(ids["a"]).deps, vec![ids["b"]]);
        assert_eq!(set.get(ids["b"]).deps, vec![ids["c"]]);
        assert!(set.get(ids["c"]).deps.is_empty());
    }

    #[test]
    fn unresolved_symbol_is_dropped() {
        let (mut set, ids) = make(&["a"]);
        set.get_mut(ids["a"]).imports = vec![("missing".into(), SymKind::Strong)];
        let exporters = ExporterMap::new();
        resolve_deps(&mut set, &exporters);
        assert!(set.get(ids["a"]).deps.is_empty());
    }

    #[test]
    fn prune_cycles_drops_lexicographically_smallest_member() {
        let (mut set, ids) = make(&["a", "b"]);
        set.get_mut(ids["a"]).deps = vec![ids["b"]];
        set.get_mut(ids["b"]).deps = vec![ids["a"]];

        let removed = prune_cycles(&mut set);
        assert_eq!(removed, vec!["a".to_string()]);
        assert!(set.find("a").is_none());
        assert!(set.find("b").is_some());
        assert!(set.get(ids["b"]).deps.is_empty());
    }

    #[test]
    fn cycle_report_is_canonical_regardless_of_start() {
        let (mut set, ids) = make(&["b", "c", "a"]);
        set.get_mut(ids["a"]).deps = vec![ids["b"]];
        set.get_mut(ids["b"]).deps = vec![ids["c"]];
        set.get_mut(ids["c"]).deps = vec![ids["a"]];

        let from_a = find_cycle(&set, ids["a"]).unwrap();
        let from_b = find_cycle(&set, ids["b"]).unwrap();
        assert_eq!(format_cycle(&set, &from_a), format_cycle(&set, &from_b));
        assert!(format_cycle(&set, &from_a).starts_with('a'));
    }

    #[test]
    fn no_cycle_in_dag() {
        let (mut set, ids) = make(&["a", "b", "c"]);
        set.get_mut(ids["a"]).deps = vec![ids["b"], ids["c"]];
        set.get_mut(ids["b"]).deps = vec![ids["c"]];
        assert!(prune_cycles(&mut set).is_empty());
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn prune_cycles_keeps_the_rest_of_the_tree() {
        // A needs B, B needs A: A is dropped, B survives with an empty dep
        // list, and an unrelated C is untouched.
        let (mut set, ids) = make(&["a", "b", "c"]);
        set.get_mut(ids["a"]).deps = vec![ids["b"]];
        set.get_mut(ids["b"]).deps = vec![ids["a"]];

        let removed = prune_cycles(&mut set);
        assert_eq!(removed, vec!["a".to_string()]);
        assert!(set.find("a").is_none());
        assert!(set.get(ids["b"]).deps.is_empty());
        assert!(set.find("c").is_some());
    }

    #[test]
    fn order_dep_list_puts_dependencies_first() {
        let (mut set, ids) = make(&["a", "b", "c"]);
        set.get_mut(ids["a"]).deps = vec![ids["b"]];
        set.get_mut(ids["b"]).deps = vec![ids["c"]];
        let order = order_dep_list(&set, ids["a"]);
        assert_eq!(order, vec![ids["c"], ids["b"], ids["a"]]);
    }

    #[test]
    fn order_dep_list_dedups_diamond() {
        let (mut set, ids) = make(&["a", "b", "c", "d"]);
        set.get_mut(ids["a"]).deps = vec![ids["b"], ids["c"]];
        set.get_mut(ids["b"]).deps = vec![ids["d"]];
        set.get_mut(ids["c"]).deps = vec![ids["d"]];
        let order = order_dep_list(&set, ids["a"]);
        assert_eq!(order.iter().filter(|&&id| id == ids["d"]).count(), 1);
        assert_eq!(order.last(), Some(&ids["a"]));
    }
}
