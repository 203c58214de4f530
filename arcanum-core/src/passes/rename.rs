//! Identifier renaming and stack shuffling
//!
//! Renaming works on resolved bindings, never on spellings: every occurrence
//! of one binding receives the same fresh identifier, and globals keep their
//! names. Stack shuffling reorders declarations whose initializers are pure,
//! which changes slot assignment without changing any value.

use std::collections::BTreeMap;

use crate::lua::ast::*;
use crate::resolve::resolve;

use super::PassContext;

/// Chance, in percent, that an eligible declaration is reordered
const SHUFFLE_PERCENT: u32 = 50;

pub fn apply(chunk: &mut Chunk, ctx: &mut PassContext) -> String {
    let mut shuffled = 0;
    if ctx.settings.stack_shuffling {
        resolve(chunk);
        let mut shuffler = Shuffler { ctx, shuffled: 0 };
        shuffler.visit_block(&mut chunk.block);
        shuffled = shuffler.shuffled;
    }

    let mut renamed = 0;
    if ctx.settings.optimize_globals {
        let tree = resolve(chunk);
        let mut renames = BTreeMap::new();
        for (id, info) in tree.bindings.iter().enumerate() {
            if ctx.source_idents.contains(&info.ident) {
                renames.insert(id as BindingId, ctx.fresh());
            }
        }
        renamed = renames.len();
        Renamer(&renames).visit_block(&mut chunk.block);
    }

    format!("renamed {} bindings, shuffled {} declarations", renamed, shuffled)
}

struct Renamer<'a>(&'a BTreeMap<BindingId, String>);

impl VisitMut for Renamer<'_> {
    fn visit_name(&mut self, name: &mut Name) {
        if let Some(fresh) = name.binding.and_then(|b| self.0.get(&b)) {
            name.ident = fresh.clone();
        }
    }
}

struct Shuffler<'a> {
    ctx: &'a mut PassContext,
    shuffled: usize,
}

fn mentions(expr: &Expr, ident: &str) -> bool {
    struct Finder<'s>(&'s str, bool);
    impl Visit for Finder<'_> {
        fn visit_name(&mut self, name: &Name) {
            self.1 |= name.ident == self.0;
        }
    }
    let mut finder = Finder(ident, false);
    finder.visit_expr(expr);
    finder.1
}

/// `local a = <pure>` with a single name
fn single_pure_local(stmt: &Stmt) -> Option<(&str, &Expr)> {
    match stmt {
        Stmt::Local { names, exprs } if names.len() == 1 && exprs.len() == 1 && exprs[0].is_pure() => {
            Some((names[0].ident.as_str(), &exprs[0]))
        }
        _ => None,
    }
}

fn swappable(first: &Stmt, second: &Stmt) -> bool {
    let (Some((a, ea)), Some((b, eb))) = (single_pure_local(first), single_pure_local(second)) else {
        return false;
    };
    a != b && !mentions(ea, b) && !mentions(eb, a)
}

impl VisitMut for Shuffler<'_> {
    fn visit_block(&mut self, block: &mut Block) {
        walk_block_mut(self, block);

        for stmt in &mut block.stmts {
            let Stmt::Local { names, exprs } = stmt else {
                continue;
            };
            let distinct = names
                .iter()
                .enumerate()
                .all(|(i, n)| names[..i].iter().all(|m| m.ident != n.ident));
            if names.len() < 2
                || names.len() != exprs.len()
                || !distinct
                || !exprs.iter().all(Expr::is_pure)
                || !self.ctx.rng.chance(SHUFFLE_PERCENT)
            {
                continue;
            }
            let mut pairs: Vec<(Name, Expr)> = names.drain(..).zip(exprs.drain(..)).collect();
            self.ctx.rng.shuffle(&mut pairs);
            for (name, expr) in pairs {
                names.push(name);
                exprs.push(expr);
            }
            self.shuffled += 1;
        }

        let mut i = 0;
        while i + 1 < block.stmts.len() {
            if swappable(&block.stmts[i], &block.stmts[i + 1]) && self.ctx.rng.chance(SHUFFLE_PERCENT) {
                block.stmts.swap(i, i + 1);
                self.shuffled += 1;
                i += 2;
            } else {
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::lua::printer::print_chunk;
    use crate::passes::test_support::context_for;

    #[test]
    fn test_renaming_follows_bindings() {
        let settings = Settings {
            optimize_globals: true,
            ..Settings::all_disabled()
        };
        let source = "local x = 1 do local x = 2 print(x) end print(x) y = x";
        let (mut chunk, mut ctx) = context_for(source, settings);
        let summary = apply(&mut chunk, &mut ctx);
        assert_eq!(summary, "renamed 2 bindings, shuffled 0 declarations");
        let text = print_chunk(&chunk);
        assert!(!text.contains("local x"));
        // globals keep their names
        assert!(text.contains("print("));
        assert!(text.contains("\ny="));
        let tree = resolve(&mut chunk);
        assert_eq!(tree.bindings.len(), 2);
        assert_ne!(tree.bindings[0].ident, tree.bindings[1].ident);
    }

    #[test]
    fn test_dependent_declarations_keep_their_order() {
        let settings = Settings {
            stack_shuffling: true,
            ..Settings::all_disabled()
        };
        let source = "local a = 1 local b = a local c = b print(a, b, c)";
        let (mut chunk, mut ctx) = context_for(source, settings);
        let summary = apply(&mut chunk, &mut ctx);
        assert!(summary.ends_with("shuffled 0 declarations"));
        assert!(print_chunk(&chunk).starts_with("local a=1\nlocal b=a\nlocal c=b\n"));
    }

    #[test]
    fn test_swappable_requires_independence() {
        let chunk = crate::lua::parse("local a = 1 local b = 2 local c = b").unwrap();
        let s = &chunk.block.stmts;
        assert!(swappable(&s[0], &s[1]));
        assert!(!swappable(&s[1], &s[2]));
    }
}
