//! Guards stay silent on unmodified runs and react to their triggers

mod common;

use arcanum_core::{local_obfuscate, Settings};
use common::{run_lua, run_lua_between, run_lua_then, run_lua_with, PROGRAMS};
use regex::Regex;

fn guarded(virtualized: bool) -> Settings {
    Settings {
        anti_tracing: true,
        anti_tamper: true,
        env_lock: true,
        stack_machine: virtualized,
        virtualization_intensity: if virtualized { 100 } else { 0 },
        ..Settings::all_disabled().with_seed("GUARD")
    }
}

#[test]
fn test_no_false_positives() {
    for virtualized in [false, true] {
        let settings = guarded(virtualized);
        for (name, source) in PROGRAMS {
            let result = local_obfuscate(source, &settings).unwrap();
            assert!(result.logs.iter().any(|l| l.starts_with("[guards] installed anti-tracing")));
            assert_eq!(
                run_lua(&result.code).unwrap(),
                run_lua(source).unwrap(),
                "guard fired on an unmodified run of {}",
                name
            );
        }
    }
}

#[test]
fn test_active_hook_makes_chunk_inert() {
    let result = local_obfuscate("print('visible')", &guarded(false)).unwrap();
    let hooked = "debug = { gethook = function() return function() end end }";
    assert_eq!(run_lua_with(&result.code, hooked).unwrap(), Vec::<String>::new());
    assert_eq!(run_lua(&result.code).unwrap(), vec!["visible".to_string()]);
}

#[test]
fn test_watermark_is_embedded_verbatim() {
    let settings = Settings::all_disabled().with_watermark("Studio-42");
    let result = local_obfuscate("print(1)", &settings).unwrap();
    assert!(result.code.contains("\"Studio-42\""));
    assert!(result
        .logs
        .contains(&"[watermark] embedded 9 bytes under a computed key".to_string()));
    assert_eq!(run_lua(&result.code).unwrap(), vec!["1".to_string()]);
}

#[test]
fn test_sealed_program_runs_clean() {
    let settings = Settings {
        anti_tamper: true,
        stack_machine: true,
        virtualization_intensity: 100,
        ..Settings::all_disabled().with_seed("TAMPER").with_watermark("")
    };
    let source = "local total = 0 for i = 1, 4 do total = total + i end print(total)";
    let result = local_obfuscate(source, &settings).unwrap();
    assert!(result.logs.iter().any(|l| l.contains("anti-tamper over")));
    assert_eq!(run_lua(&result.code).unwrap(), vec!["10".to_string()]);
}

/// Defines a flattened global; the dispatcher entry of `report` reads the
/// control cell on every call, so a fired guard shows up there
const TRIPWIRE: &str = r#"
function report(n)
    local doubled = n * 2
    return doubled + 1
end
print("loaded")
"#;

const CALL_REPORT: &str = "print(report(3))";

fn flattened(tamper: bool, lock: bool) -> Settings {
    Settings {
        anti_tamper: tamper,
        env_lock: lock,
        control_flow_chaos: true,
        ..Settings::all_disabled().with_seed("TRIP").with_watermark("")
    }
}

#[test]
fn test_edited_seal_skews_control_flow() {
    let code = local_obfuscate(TRIPWIRE, &flattened(true, false)).unwrap().code;
    let clean = run_lua_then(&code, CALL_REPORT);
    assert_eq!(clean, Ok(vec!["loaded".to_string(), "7".to_string()]));

    let seal = Regex::new(r"\{(\d+)((?:,\d+){23})\}").unwrap();
    assert_eq!(seal.find_iter(&code).count(), 1);
    let edited = seal.replace(&code, |caps: &regex::Captures| {
        let first: i64 = caps[1].parse().unwrap();
        format!("{{{}{}}}", first + 1, &caps[2])
    });
    assert_ne!(edited, code);
    assert_ne!(run_lua_then(&edited, CALL_REPORT), clean);
}

#[test]
fn test_swapped_string_metatable_skews_control_flow() {
    let code = local_obfuscate(TRIPWIRE, &flattened(false, true)).unwrap().code;
    let clean = run_lua_then(&code, CALL_REPORT);
    assert_eq!(clean, Ok(vec!["loaded".to_string(), "7".to_string()]));

    // every lookup of the string metatable yields a different table
    let unstable = r#"
        local original = getmetatable
        getmetatable = function(value)
            if type(value) == "string" then
                return {}
            end
            return original(value)
        end
    "#;
    assert_ne!(run_lua_between(unstable, &code, CALL_REPORT), clean);
}
