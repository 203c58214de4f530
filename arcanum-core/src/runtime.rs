//! Shared runtime prelude of the emitted script
//!
//! Passes ask for the pieces they need (the captured environment, the
//! control cell, proxy slots) while they run; the prelude is assembled from
//! those requests once every pass, the virtualizer and the guards are done,
//! so unused pieces are never emitted.
//!
//! The control cell `R[1]` holds 0 on a healthy run. Guards write a nonzero
//! value into it when they detect tampering, which skews every consumer:
//! proxy slot lookups, flattened dispatch states and bytecode decoding.

use std::collections::BTreeSet;

use crate::lua::ast::*;
use crate::rng::{Entropy, NameGen};

pub struct Runtime {
    env: String,
    control: String,
    proxy: String,
    env_used: bool,
    control_used: bool,
    /// Slot number and dotted path of each proxied built-in
    proxies: Vec<(i64, Vec<String>)>,
    escaped: BTreeSet<Vec<u8>>,
}

impl Runtime {
    pub fn new(names: &mut NameGen) -> Self {
        Self {
            env: names.fresh(),
            control: names.fresh(),
            proxy: names.fresh(),
            env_used: false,
            control_used: false,
            proxies: Vec::new(),
            escaped: BTreeSet::new(),
        }
    }

    /// Expression for the chunk environment table
    pub fn env(&mut self) -> Expr {
        self.env_used = true;
        Expr::name(self.env.clone())
    }

    /// The control cell table itself
    pub fn control_cell(&mut self) -> Expr {
        self.control_used = true;
        Expr::name(self.control.clone())
    }

    /// `R[1]`, zero unless a guard fired
    pub fn control_read(&mut self) -> Expr {
        let cell = self.control_cell();
        Expr::index(cell, Expr::Number(1.0))
    }

    /// Slot of a proxied built-in, allocating one on first use
    pub fn proxy_slot(&mut self, path: &[&str], rng: &mut Entropy) -> i64 {
        if let Some((slot, _)) = self
            .proxies
            .iter()
            .find(|(_, p)| p.iter().map(String::as_str).eq(path.iter().copied()))
        {
            return *slot;
        }
        let slot = loop {
            let candidate = rng.range(16, 65_535);
            if self.proxies.iter().all(|(s, _)| *s != candidate) {
                break candidate;
            }
        };
        for part in path {
            self.escape(part.as_bytes());
        }
        self.proxies
            .push((slot, path.iter().map(|p| p.to_string()).collect()));
        slot
    }

    /// `P[slot + R[1]]`
    pub fn proxy_lookup(&mut self, slot: i64) -> Expr {
        let key = Expr::binary(BinOp::Add, Expr::Number(slot as f64), self.control_read());
        Expr::index(Expr::name(self.proxy.clone()), key)
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    /// Emit this string literal with every byte escaped
    pub fn escape(&mut self, bytes: &[u8]) {
        self.escaped.insert(bytes.to_vec());
    }

    pub fn escaped(&self) -> &BTreeSet<Vec<u8>> {
        &self.escaped
    }

    /// Identifiers the prelude may declare
    pub fn idents(&self) -> [&str; 3] {
        [self.env.as_str(), self.control.as_str(), self.proxy.as_str()]
    }

    /// Statements to place at the very top of the chunk
    pub fn prelude(&self) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        if self.env_used || !self.proxies.is_empty() {
            // getfenv and getfenv(1) or _ENV or _G
            let getfenv = Expr::name("getfenv");
            let lookup = Expr::binary(
                BinOp::And,
                getfenv.clone(),
                Expr::call(getfenv, vec![Expr::Number(1.0)]),
            );
            let fallback = Expr::binary(BinOp::Or, Expr::name("_ENV"), Expr::name("_G"));
            stmts.push(Stmt::Local {
                names: vec![Name::new(self.env.clone())],
                exprs: vec![Expr::binary(BinOp::Or, lookup, fallback)],
            });
        }
        if self.control_used {
            stmts.push(Stmt::Local {
                names: vec![Name::new(self.control.clone())],
                exprs: vec![Expr::Table(vec![TableField::Positional(Expr::Number(0.0))])],
            });
        }
        if !self.proxies.is_empty() {
            let fields = self
                .proxies
                .iter()
                .map(|(slot, path)| {
                    TableField::Keyed(Expr::Number(*slot as f64), self.resolve_path(path))
                })
                .collect();
            stmts.push(Stmt::Local {
                names: vec![Name::new(self.proxy.clone())],
                exprs: vec![Expr::Table(fields)],
            });
        }
        stmts
    }

    /// `E["string"]["format"]`, tolerating a missing library table
    fn resolve_path(&self, path: &[String]) -> Expr {
        let mut expr = Expr::name(self.env.clone());
        for (i, part) in path.iter().enumerate() {
            let step = Expr::index(expr, Expr::Str(part.as_bytes().to_vec()));
            expr = if i + 1 < path.len() {
                Expr::paren(Expr::binary(BinOp::Or, step, Expr::Table(Vec::new())))
            } else {
                step
            };
        }
        expr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua::printer::{print_chunk_with, PrintOptions};

    fn runtime() -> Runtime {
        Runtime::new(&mut NameGen::new("T", Vec::new()))
    }

    #[test]
    fn test_unused_runtime_emits_nothing() {
        assert!(runtime().prelude().is_empty());
    }

    #[test]
    fn test_proxy_slots_are_shared_per_path() {
        let mut rt = runtime();
        let mut rng = Entropy::new("T", "proxy");
        let a = rt.proxy_slot(&["print"], &mut rng);
        let b = rt.proxy_slot(&["string", "format"], &mut rng);
        assert_eq!(rt.proxy_slot(&["print"], &mut rng), a);
        assert_ne!(a, b);
        assert_eq!(rt.proxy_count(), 2);
        assert!(rt.escaped().contains(&b"format".to_vec()));
    }

    #[test]
    fn test_prelude_escapes_builtin_names() {
        let mut rt = runtime();
        let mut rng = Entropy::new("T", "proxy");
        rt.proxy_slot(&["print"], &mut rng);
        rt.control_read();
        let chunk = Chunk {
            block: Block::new(rt.prelude()),
        };
        let options = PrintOptions {
            escaped: rt.escaped().clone(),
        };
        let text = print_chunk_with(&chunk, &options);
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("\\112\\114\\105\\110\\116"));
        assert!(!text.contains("\"print\""));
        assert!(!text.contains(".print"));
    }
}
