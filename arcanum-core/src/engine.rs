//! The obfuscation pipeline
//!
//! parse → passes → virtualization → guards → emission. The run is a pure
//! function of the source text and the settings: no I/O, no shared state,
//! and every random choice comes from the configured seed.

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::{ObfuscateError, ObfuscationFailure};
use crate::guards;
use crate::lua::ast::{collect_identifiers, Block, Chunk};
use crate::lua::parse;
use crate::lua::printer::{print_chunk_with, PrintOptions};
use crate::passes::{run_pipeline, PassContext};
use crate::report::{Report, Stats};
use crate::resolve::resolve;
use crate::rng::NameGen;
use crate::vm::{self, Lowered};

/// Output of a successful run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObfuscationResult {
    pub code: String,
    pub logs: Vec<String>,
    pub stats: Stats,
}

/// Obfuscation engine bound to one configuration
#[derive(Debug, Clone)]
pub struct Engine {
    settings: Settings,
}

impl Engine {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: settings.normalized(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn obfuscate(&self, source: &str) -> Result<ObfuscationResult, ObfuscationFailure> {
        self.run(source, source, Report::new())
    }

    /// Obfuscate `input`, reporting sizes against `original` and continuing `report`
    pub(crate) fn run(
        &self,
        input: &str,
        original: &str,
        mut report: Report,
    ) -> Result<ObfuscationResult, ObfuscationFailure> {
        tracing::info!("obfuscating {} bytes with seed {}", input.len(), self.settings.seed);
        report.log("engine", format!("seed {}", self.settings.seed));

        let mut chunk = match parse(input) {
            Ok(chunk) => chunk,
            Err(e) => {
                report.log("parse", e.to_string());
                return Err(ObfuscationFailure {
                    error: e.into(),
                    logs: report.into_lines(),
                });
            }
        };

        let idents = collect_identifiers(&chunk.block);
        let names = NameGen::new(&self.settings.seed, idents.iter().cloned());
        let mut ctx = PassContext::new(self.settings.clone(), names, report, idents);

        match transform(&mut chunk, &mut ctx) {
            Ok(code) => {
                let stats = Stats::measure(original, &code);
                tracing::debug!("emitted {} bytes", stats.new_size);
                Ok(ObfuscationResult {
                    code,
                    logs: ctx.report.into_lines(),
                    stats,
                })
            }
            Err(error) => {
                ctx.report.log("engine", error.to_string());
                Err(ObfuscationFailure {
                    error,
                    logs: ctx.report.into_lines(),
                })
            }
        }
    }
}

/// Everything after parsing; returns the emitted source
fn transform(chunk: &mut Chunk, ctx: &mut PassContext) -> Result<String, ObfuscateError> {
    run_pipeline(chunk, ctx);

    let mut lowered = Lowered::default();
    if ctx.settings.virtualization_enabled() {
        resolve(chunk);
        let reserved = ctx
            .runtime
            .idents()
            .iter()
            .map(|ident| ident.to_string())
            .collect();
        lowered = vm::virtualize(chunk, ctx, &reserved)?;
    }

    let guard_head = guards::install(&mut chunk.block, lowered.sealed.as_ref(), ctx);

    // the prelude goes last: only now is every runtime request known
    let mut stmts = ctx.runtime.prelude();
    stmts.extend(guard_head);
    stmts.extend(lowered.defs);
    stmts.append(&mut chunk.block.stmts);
    let output = Chunk {
        block: Block::new(stmts),
    };

    let options = PrintOptions {
        escaped: ctx.runtime.escaped().clone(),
    };
    let code = print_chunk_with(&output, &options);
    parse(&code).map_err(|e| {
        ObfuscateError::Internal(format!("emitted code does not parse: {}", e))
    })?;
    ctx.report.log(
        "emit",
        format!("{} bytes, {} lines", code.len(), code.lines().count()),
    );
    Ok(code)
}

/// Obfuscate `source` with `settings`
pub fn local_obfuscate(
    source: &str,
    settings: &Settings,
) -> Result<ObfuscationResult, ObfuscationFailure> {
    Engine::new(settings.clone()).obfuscate(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_run_logs_seed_and_emission() {
        let settings = Settings::all_disabled().with_seed("S1").with_watermark("");
        let result = local_obfuscate("local x = 1 print(x)", &settings).unwrap();
        assert_eq!(result.code, "local x=1\nprint(x)\n");
        assert_eq!(result.logs[0], "[engine] seed S1");
        assert_eq!(result.logs[1], "[emit] 19 bytes, 2 lines");
        assert_eq!(result.stats.new_size, result.code.len());
    }

    #[test]
    fn test_syntax_error_aborts_with_location() {
        let failure = local_obfuscate("local x = ", &Settings::default()).unwrap_err();
        assert!(matches!(failure.error, ObfuscateError::Syntax(_)));
        let last = failure.logs.last().unwrap();
        assert!(last.starts_with("[parse] syntax error at line 1, column 11"));
    }

    #[test]
    fn test_default_settings_are_deterministic() {
        let source = "local t = {} for i = 1, 5 do t[#t + 1] = i * 2 end print(table.concat(t, ','))";
        let a = local_obfuscate(source, &Settings::default()).unwrap();
        let b = local_obfuscate(source, &Settings::default()).unwrap();
        assert_eq!(a.code, b.code);
        assert_eq!(a.logs, b.logs);
        let c = local_obfuscate(source, &Settings::default().with_seed("other")).unwrap();
        assert_ne!(a.code, c.code);
    }
}
