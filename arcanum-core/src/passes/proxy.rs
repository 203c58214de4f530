//! Native-call proxying
//!
//! Calls to well-known built-ins are routed through a slot table built at the
//! top of the script, so the call sites no longer name the function they
//! invoke. A built-in is only proxied when the program provably never rebinds
//! it: the global is never assigned, its library table is never written
//! through, and the program does not reach for its environment directly.

use crate::lua::ast::*;
use crate::resolve::{resolve, ScopeTree};

use super::PassContext;

const GLOBAL_BUILTINS: &[&str] = &[
    "print",
    "type",
    "tostring",
    "tonumber",
    "pairs",
    "ipairs",
    "select",
    "error",
    "assert",
    "pcall",
    "xpcall",
    "unpack",
    "next",
    "rawget",
    "rawset",
    "rawequal",
    "rawlen",
    "setmetatable",
    "getmetatable",
    "require",
    "warn",
    "tick",
    "wait",
    "spawn",
    "delay",
];

const LIBRARIES: &[&str] = &["string", "table", "math", "os", "coroutine"];

/// Globals whose presence means the program manipulates its own environment
const ENVIRONMENT_GLOBALS: &[&str] = &["_G", "_ENV", "getfenv", "setfenv"];

pub fn apply(chunk: &mut Chunk, ctx: &mut PassContext) -> String {
    let tree = resolve(chunk);
    if let Some(global) = ENVIRONMENT_GLOBALS
        .iter()
        .find(|g| tree.mentions_global(g))
    {
        return format!("skipped: program references {}", global);
    }

    let written_libraries = written_library_fields(chunk);
    let mut rewriter = Rewriter {
        ctx,
        tree: &tree,
        written_libraries,
        sites: 0,
    };
    rewriter.visit_block(&mut chunk.block);
    let sites = rewriter.sites;
    format!(
        "routed {} call sites through {} native slots",
        sites,
        ctx.runtime.proxy_count()
    )
}

/// Libraries the program writes into (`string.custom = ...`)
fn written_library_fields(chunk: &Chunk) -> Vec<String> {
    struct Finder(Vec<String>);
    impl Visit for Finder {
        fn visit_stmt(&mut self, stmt: &Stmt) {
            let targets: Vec<&Expr> = match stmt {
                Stmt::Assign { targets, .. } => targets.iter().collect(),
                Stmt::CompoundAssign { target, .. } => vec![target],
                _ => Vec::new(),
            };
            for target in targets {
                if let Expr::Index { obj, .. } = target {
                    if let Expr::Name(name) = &**obj {
                        if name.binding.is_none() && LIBRARIES.contains(&name.ident.as_str()) {
                            self.0.push(name.ident.clone());
                        }
                    }
                }
            }
            walk_stmt(self, stmt);
        }
    }
    let mut finder = Finder(Vec::new());
    finder.visit_block(&chunk.block);
    finder.0
}

struct Rewriter<'a> {
    ctx: &'a mut PassContext,
    tree: &'a ScopeTree,
    written_libraries: Vec<String>,
    sites: usize,
}

impl Rewriter<'_> {
    /// The built-in path a callee refers to, if it may be proxied
    fn builtin_path(&self, func: &Expr) -> Option<Vec<String>> {
        match func {
            Expr::Name(name) if name.binding.is_none() => {
                let ident = name.ident.as_str();
                (GLOBAL_BUILTINS.contains(&ident) && !self.tree.globals_written.contains(ident))
                    .then(|| vec![ident.to_string()])
            }
            Expr::Index { obj, key } => {
                let (Expr::Name(lib), Expr::Str(field)) = (&**obj, &**key) else {
                    return None;
                };
                let library = lib.ident.as_str();
                let field = std::str::from_utf8(field).ok()?;
                let proxied = lib.binding.is_none()
                    && LIBRARIES.contains(&library)
                    && !self.tree.globals_written.contains(library)
                    && !self.written_libraries.iter().any(|w| w == library);
                proxied.then(|| vec![library.to_string(), field.to_string()])
            }
            _ => None,
        }
    }
}

impl VisitMut for Rewriter<'_> {
    fn visit_expr(&mut self, expr: &mut Expr) {
        walk_expr_mut(self, expr);
        if let Expr::Call { func, .. } = expr {
            if let Some(path) = self.builtin_path(func) {
                let parts: Vec<&str> = path.iter().map(String::as_str).collect();
                let slot = self.ctx.runtime.proxy_slot(&parts, &mut self.ctx.rng);
                **func = self.ctx.runtime.proxy_lookup(slot);
                self.sites += 1;
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

    fn settings() -> Settings {
        Settings {
            proxy_native: true,
            ..Settings::all_disabled()
        }
    }

    #[test]
    fn test_builtins_are_routed() {
        let (mut chunk, mut ctx) =
            context_for("print(string.format('%d', 1)) local s = tostring(2)", settings());
        let summary = apply(&mut chunk, &mut ctx);
        assert_eq!(summary, "routed 3 call sites through 3 native slots");
        let text = print_chunk(&chunk);
        assert!(!text.contains("print("));
        assert!(!text.contains("string.format"));
        assert_eq!(ctx.runtime.prelude().len(), 3);
    }

    #[test]
    fn test_rebound_builtins_are_left_alone() {
        let source = "print = function() end print(1) local type = 1 string.x = 1 string.rep('a', 2)";
        let (mut chunk, mut ctx) = context_for(source, settings());
        let summary = apply(&mut chunk, &mut ctx);
        assert_eq!(summary, "routed 0 call sites through 0 native slots");
    }

    #[test]
    fn test_environment_access_disables_pass() {
        let (mut chunk, mut ctx) = context_for("setfenv(1, {}) print(1)", settings());
        let summary = apply(&mut chunk, &mut ctx);
        assert_eq!(summary, "skipped: program references setfenv");
        assert!(print_chunk(&chunk).contains("print(1)"));
    }
}
