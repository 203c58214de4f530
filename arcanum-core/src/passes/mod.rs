//! AST-to-AST transform passes
//!
//! Passes are listed in [`PIPELINE`] in the order they run. Each entry pairs
//! a predicate over [`Settings`] with an apply function, so enabling or
//! removing a pass never touches the runner. Every pass that runs appends
//! exactly one summary line to the report, plus one line per unsafe site it
//! declined to rewrite.

use std::collections::BTreeSet;

use tracing::debug;

use crate::config::Settings;
use crate::error::Diagnostic;
use crate::lua::ast::Chunk;
use crate::report::Report;
use crate::rng::{Entropy, NameGen};
use crate::runtime::Runtime;

pub mod anchors;
pub mod arithmetic;
pub mod control_flow;
pub mod dead_code;
pub mod decoys;
pub mod junk;
pub mod proxy;
pub mod rename;

/// Unsafe sites logged individually before the rest are summarized
const MAX_UNSAFE_LINES: usize = 8;

/// Mutable state threaded through every pass of one run
pub struct PassContext {
    pub settings: Settings,
    /// Stream for the pass currently running; reset by [`PassContext::begin`]
    pub rng: Entropy,
    pub names: NameGen,
    pub report: Report,
    pub runtime: Runtime,
    /// Identifiers spelled in the input, as opposed to ones the engine made up
    pub source_idents: BTreeSet<String>,
    unsafe_logged: usize,
    unsafe_elided: usize,
}

impl PassContext {
    pub fn new(
        settings: Settings,
        mut names: NameGen,
        report: Report,
        source_idents: BTreeSet<String>,
    ) -> Self {
        let runtime = Runtime::new(&mut names);
        let rng = Entropy::new(&settings.seed, "engine");
        Self {
            settings,
            rng,
            names,
            report,
            runtime,
            source_idents,
            unsafe_logged: 0,
            unsafe_elided: 0,
        }
    }

    /// Switch to the random stream of a named stage
    pub fn begin(&mut self, stage: &str) {
        self.rng = Entropy::new(&self.settings.seed, stage);
        self.unsafe_logged = 0;
        self.unsafe_elided = 0;
    }

    pub fn fresh(&mut self) -> String {
        self.names.fresh()
    }

    /// Record a site the pass left alone because it could not prove the
    /// rewrite safe
    pub fn skip_unsafe(&mut self, pass: &'static str, node: usize) {
        if self.unsafe_logged < MAX_UNSAFE_LINES {
            self.unsafe_logged += 1;
            self.report
                .diagnostic(&Diagnostic::UnsafeTransformSkipped { pass, node });
        } else {
            self.unsafe_elided += 1;
        }
    }

    /// Total unsafe sites seen since [`PassContext::begin`]
    pub fn unsafe_count(&self) -> usize {
        self.unsafe_logged + self.unsafe_elided
    }

    fn finish_unsafe(&mut self, pass: &'static str) {
        if self.unsafe_elided > 0 {
            self.report.diagnostic(&Diagnostic::UnsafeSitesElided {
                pass,
                count: self.unsafe_elided,
            });
        }
    }
}

/// One entry of the pipeline table
pub struct PassDescriptor {
    /// Random stream name; also used in diagnostics
    pub name: &'static str,
    /// Log tag of the summary line
    pub tag: &'static str,
    pub enabled: fn(&Settings) -> bool,
    /// Rewrites the chunk and returns the summary line
    pub apply: fn(&mut Chunk, &mut PassContext) -> String,
}

/// The passes in priority order
pub static PIPELINE: &[PassDescriptor] = &[
    PassDescriptor {
        name: "proxy",
        tag: "proxy",
        enabled: |s| s.proxy_native,
        apply: proxy::apply,
    },
    PassDescriptor {
        name: "decoys",
        tag: "decoys",
        enabled: |s| s.decoy_traps || s.honey_pots || s.decoy_constants,
        apply: decoys::apply,
    },
    PassDescriptor {
        name: "dead-code",
        tag: "dead-code",
        enabled: Settings::dead_code_enabled,
        apply: dead_code::apply,
    },
    PassDescriptor {
        name: "anchors",
        tag: "anchors",
        enabled: |s| s.state_anchors || s.ghost_cycles,
        apply: anchors::apply,
    },
    PassDescriptor {
        name: "arithmetic",
        tag: "arithmetic",
        enabled: |s| s.arithmetic_obf || s.heavy_math,
        apply: arithmetic::apply,
    },
    PassDescriptor {
        name: "control-flow",
        tag: "control-flow",
        enabled: |s| s.control_flow_chaos,
        apply: control_flow::apply,
    },
    PassDescriptor {
        name: "rename",
        tag: "rename",
        enabled: |s| s.optimize_globals || s.stack_shuffling,
        apply: rename::apply,
    },
];

/// Run every enabled pass in order
pub fn run_pipeline(chunk: &mut Chunk, ctx: &mut PassContext) {
    for pass in PIPELINE {
        if !(pass.enabled)(&ctx.settings) {
            debug!(pass = pass.name, "pass disabled");
            continue;
        }
        ctx.begin(pass.name);
        let summary = (pass.apply)(chunk, ctx);
        ctx.report.log(pass.tag, summary);
        ctx.finish_unsafe(pass.name);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::lua::ast::collect_identifiers;
    use crate::lua::parse;

    /// A context over `source` with the given settings
    pub fn context_for(source: &str, settings: Settings) -> (Chunk, PassContext) {
        let chunk = parse(source).unwrap();
        let idents = collect_identifiers(&chunk.block);
        let names = NameGen::new(&settings.seed, idents.iter().cloned());
        let ctx = PassContext::new(settings, names, Report::new(), idents);
        (chunk, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::context_for;
    use super::*;

    #[test]
    fn test_pipeline_order_is_fixed() {
        let names: Vec<_> = PIPELINE.iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec![
                "proxy",
                "decoys",
                "dead-code",
                "anchors",
                "arithmetic",
                "control-flow",
                "rename"
            ]
        );
    }

    #[test]
    fn test_disabled_passes_log_nothing() {
        let (mut chunk, mut ctx) = context_for("print(1)", Settings::all_disabled());
        run_pipeline(&mut chunk, &mut ctx);
        assert!(ctx.report.lines().is_empty());
    }

    #[test]
    fn test_unsafe_lines_are_capped() {
        let (_, mut ctx) = context_for("", Settings::all_disabled());
        ctx.begin("arithmetic");
        for node in 0..20 {
            ctx.skip_unsafe("arithmetic", node);
        }
        ctx.finish_unsafe("arithmetic");
        let lines = ctx.report.lines();
        assert_eq!(lines.len(), MAX_UNSAFE_LINES + 1);
        assert_eq!(lines[0], "[arithmetic] pass skipped at node 0: unsafe");
        assert_eq!(lines[MAX_UNSAFE_LINES], "[arithmetic] 12 further unsafe sites skipped");
        assert_eq!(ctx.unsafe_count(), 20);
    }
}
