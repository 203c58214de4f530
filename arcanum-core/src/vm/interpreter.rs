//! Generated interpreter source
//!
//! The interpreters are written as Lua templates. `$name` placeholders are
//! replaced with fresh identifiers, opcode numbers and keys are spliced in
//! per instruction set, and the result is handed to the parser like any
//! other source text.

use std::collections::BTreeMap;

use regex::{Captures, Regex};

use crate::error::{ObfuscateError, ObfuscateResult};
use crate::rng::{Entropy, NameGen};

use super::isa::{Isa, Op, WordKey, WORD_MODULUS};

const PLACEHOLDER: &str = r"\$([A-Za-z_][A-Za-z0-9_]*)";

/// String literals of the support code, emitted escaped
pub const SUPPORT_STRINGS: &[&str] = &[
    "type", "select", "table", "unpack", "string", "char", "concat", "tonumber", "error",
];

pub fn placeholder_pattern() -> ObfuscateResult<Regex> {
    Regex::new(PLACEHOLDER).map_err(|e| ObfuscateError::Internal(e.to_string()))
}

/// Placeholder to identifier bindings
#[derive(Debug, Clone, Default)]
pub struct Symbols {
    map: BTreeMap<String, String>,
}

impl Symbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, key: &str, ident: impl Into<String>) {
        self.map.insert(key.to_string(), ident.into());
    }

    /// Substitute every placeholder, inventing names for unbound ones
    pub fn expand(&mut self, template: &str, names: &mut NameGen, pattern: &Regex) -> String {
        pattern
            .replace_all(template, |caps: &Captures| {
                self.map
                    .entry(caps[1].to_string())
                    .or_insert_with(|| names.fresh())
                    .clone()
            })
            .into_owned()
    }
}

const SUPPORT: &str = r##"
local $type = $E["type"]
local $select = $E["select"]
local $unpack = ($E["table"] or {})["unpack"] or $E["unpack"]
local $char = ($E["string"] or {})["char"]
local $concat = ($E["table"] or {})["concat"]
local $tonumber = $E["tonumber"]
local $error = $E["error"]
local function $pack(...)
    return { n = $select("#", ...), ... }
end
local function $K($kt, $ki)
    local $kv = $kt[$ki]
    if $type($kv) == "table" then
        local $kb = {}
        for $kj = 3, #$kv do
            $kb[$kj - 2] = $char(($kv[$kj] - $kv[1] - $kj * $kv[2]) % 256)
        end
        $kv = $concat($kb)
        $kt[$ki] = $kv
    end
    return $kv
end
"##;

/// Library aliases, the result packer and the constant decoder
pub fn support(shared: &mut Symbols, names: &mut NameGen, pattern: &Regex) -> String {
    shared.expand(SUPPORT, names, pattern)
}

fn binary(symbol: &str) -> String {
    format!(
        "local $y = $stack[$top] $stack[$top] = nil $top = $top - 1 $stack[$top] = $stack[$top] {} $y",
        symbol
    )
}

fn handler(op: Op) -> String {
    let body = match op {
        Op::PushK => "$top = $top + 1 $stack[$top] = $K($consts, $a)",
        Op::LoadV => {
            "$top = $top + 1 if $a == 1 then $stack[$top] = true elseif $a == 2 then $stack[$top] = false else $stack[$top] = nil end"
        }
        Op::GetU => "$top = $top + 1 $stack[$top] = $acc[$a]()",
        Op::SetU => "$acc[$a]($stack[$top]) $stack[$top] = nil $top = $top - 1",
        Op::GetG => "$top = $top + 1 $stack[$top] = $E[$K($consts, $a)]",
        Op::SetG => "$E[$K($consts, $a)] = $stack[$top] $stack[$top] = nil $top = $top - 1",
        Op::GetR => "$top = $top + 1 $stack[$top] = $regs[$a]",
        Op::SetR => "$regs[$a] = $stack[$top] $stack[$top] = nil $top = $top - 1",
        Op::GetT => {
            "local $x = $stack[$top] $stack[$top] = nil $top = $top - 1 $stack[$top] = $stack[$top][$x]"
        }
        Op::SetT => {
            "$stack[$top - 2][$stack[$top - 1]] = $stack[$top] $stack[$top] = nil $stack[$top - 1] = nil $stack[$top - 2] = nil $top = $top - 3"
        }
        Op::SelfK => {
            "local $x = $stack[$top] $stack[$top] = $x[$K($consts, $a)] $top = $top + 1 $stack[$top] = $x"
        }
        Op::Mark => "$mtop = $mtop + 1 $marks[$mtop] = $top",
        Op::Call => {
            "local $m = $marks[$mtop] $marks[$mtop] = nil $mtop = $mtop - 1 \
             local $r = $pack($stack[$m + 1]($unpack($stack, $m + 2, $top))) \
             for $j = $m + 1, $top do $stack[$j] = nil end $top = $m \
             local $n = $a - 1 if $a == 0 then $n = $r.n end \
             for $j = 1, $n do $top = $top + 1 $stack[$top] = $r[$j] end"
        }
        Op::Adj => {
            "local $m = $marks[$mtop] $marks[$mtop] = nil $mtop = $mtop - 1 \
             for $j = $m + $a + 1, $top do $stack[$j] = nil end $top = $m + $a"
        }
        Op::Pop => "$stack[$top] = nil $top = $top - 1",
        Op::Add => return binary("+"),
        Op::Sub => return binary("-"),
        Op::Mul => return binary("*"),
        Op::Div => return binary("/"),
        Op::Mod => return binary("%"),
        Op::Pow => return binary("^"),
        Op::Concat => return binary(".."),
        Op::Eq => return binary("=="),
        Op::Ne => return binary("~="),
        Op::Lt => return binary("<"),
        Op::Le => return binary("<="),
        Op::Gt => return binary(">"),
        Op::Ge => return binary(">="),
        Op::Unm => "$stack[$top] = -$stack[$top]",
        Op::Not => "$stack[$top] = not $stack[$top]",
        Op::Len => "$stack[$top] = #$stack[$top]",
        Op::Jmp => "$nx = $a",
        Op::JmpF => {
            "local $x = $stack[$top] $stack[$top] = nil $top = $top - 1 if not $x then $nx = $a end"
        }
        Op::TestF => "if not $stack[$top] then $nx = $a end",
        Op::TestT => "if $stack[$top] then $nx = $a end",
        Op::NewT => "$top = $top + 1 $stack[$top] = {}",
        Op::TAppend => "$stack[$top - 1][$a] = $stack[$top] $stack[$top] = nil $top = $top - 1",
        Op::TAppendM => {
            "local $m = $marks[$mtop] $marks[$mtop] = nil $mtop = $mtop - 1 local $x = $stack[$m] \
             for $j = $m + 1, $top do $x[$a + $j - $m - 1] = $stack[$j] $stack[$j] = nil end $top = $m"
        }
        Op::TSetK => {
            "$stack[$top - 2][$stack[$top - 1]] = $stack[$top] $stack[$top] = nil $stack[$top - 1] = nil $top = $top - 2"
        }
        Op::ForPrep => {
            "local $i, $l, $s = $tonumber($regs[$a]), $tonumber($regs[$a + 1]), $tonumber($regs[$a + 2]) \
             if not ($i and $l and $s) then $error(\"'for' initial value must be a number\") end \
             $regs[$a] = $i $regs[$a + 1] = $l $regs[$a + 2] = $s \
             if ($s > 0 and $i <= $l) or ($s <= 0 and $i >= $l) then $regs[$a + 3] = $i else $nx = $b end"
        }
        Op::ForLoop => {
            "local $s = $regs[$a + 2] local $i = $regs[$a] + $s $regs[$a] = $i \
             if ($s > 0 and $i <= $regs[$a + 1]) or ($s <= 0 and $i >= $regs[$a + 1]) then $regs[$a + 3] = $i $nx = $b end"
        }
        Op::TForPrep => {
            "$regs[$a + 2] = $stack[$top] $regs[$a + 1] = $stack[$top - 1] $regs[$a] = $stack[$top - 2] \
             $stack[$top] = nil $stack[$top - 1] = nil $stack[$top - 2] = nil $top = $top - 3"
        }
        Op::TForCall => {
            "local $r = $pack($regs[$a]($regs[$a + 1], $regs[$a + 2])) \
             if $r[1] == nil then $nx = $c else \
             $regs[$a + 2] = $r[1] for $j = 1, $b do $regs[$a + 2 + $j] = $r[$j] end end"
        }
    };
    body.to_string()
}

/// Plausible handlers for codes no instruction uses
const DECOY_HANDLERS: &[&str] = &[
    "$top = $top + 1 $stack[$top] = $regs[$a] ~= $regs[$b]",
    "$regs[$c] = $stack[$top] $stack[$top] = nil $top = $top - 1",
    "$nx = ($b * $c + $a) % 16777216",
    "local $x = $stack[$top] $stack[$top] = $K($consts, $a) .. $type($x)",
    "$mtop = $mtop + 1 $marks[$mtop] = $top - $a",
    "$regs[$a] = $acc[$b] $nx = $c",
];

/// Expression decoding word `offset` of the current instruction
fn decode(key: WordKey, offset: i64) -> String {
    let word = if offset == 0 {
        "$code[$w]".to_string()
    } else {
        format!("$code[$w + {}]", offset)
    };
    match key {
        WordKey::Plain => format!("{} - $z", word),
        WordKey::Fixed(k) => format!("({} - {} - $z) % {}", word, k, WORD_MODULUS),
        WordKey::Rolling { k0, k1, k2 } => format!(
            "({} - {} * $pc - {} - $z) % {}",
            word,
            k0,
            k1 * offset + k2,
            WORD_MODULUS
        ),
    }
}

fn chain(handlers: &[(i64, String)]) -> String {
    let mut out = String::new();
    for (i, (code, body)) in handlers.iter().enumerate() {
        let keyword = if i == 0 { "if" } else { "elseif" };
        out.push_str(&format!("{} $op == {} then\n{}\n", keyword, code, body));
    }
    out.push_str("else\n$nx = 0\nend\n");
    out
}

/// Binary search over handlers sorted by code
fn search_tree(handlers: &[(i64, String)]) -> String {
    match handlers {
        [] => "$nx = 0\n".to_string(),
        [(code, body)] => format!("if $op == {} then\n{}\nelse\n$nx = 0\nend\n", code, body),
        _ => {
            let (low, high) = handlers.split_at(handlers.len() / 2);
            format!(
                "if $op < {} then\n{}else\n{}end\n",
                high[0].0,
                search_tree(low),
                search_tree(high)
            )
        }
    }
}

/// Source of one interpreter function named `name` for `isa`
pub fn interpreter(
    isa: &Isa,
    name: &str,
    shared: &Symbols,
    names: &mut NameGen,
    rng: &mut Entropy,
    pattern: &Regex,
) -> String {
    let mut symbols = shared.clone();
    symbols.bind("vm", name);

    let mut handlers: Vec<(i64, String)> = Op::ALL
        .iter()
        .map(|op| (isa.code(*op), handler(*op)))
        .collect();
    if isa.mutate_handlers {
        let mut spare = isa.unused_codes();
        rng.shuffle(&mut spare);
        let count = rng.range(2, 5) as usize;
        for code in spare.into_iter().take(count) {
            let body = rng.pick(DECOY_HANDLERS).copied().unwrap_or(DECOY_HANDLERS[0]);
            handlers.push((code, body.to_string()));
        }
        rng.shuffle(&mut handlers);
    }
    let dispatch = if isa.tree_dispatch {
        handlers.sort_by_key(|(code, _)| *code);
        search_tree(&handlers)
    } else {
        chain(&handlers)
    };

    let mut source = String::from(
        "local function $vm($prog, $acc)\n\
         local $code, $consts, $exports = $prog[1], $prog[2], $prog[3]\n\
         local $pc = $prog[4]\n\
         local $stack, $top, $regs, $marks, $mtop = {}, 0, {}, {}, 0\n\
         while $pc ~= 0 do\n\
         local $z = $R[1]\n\
         local $w = $pc * 5 - 4\n",
    );
    for (offset, field) in ["op", "a", "b", "c", "nx"].iter().enumerate() {
        source.push_str(&format!(
            "local ${} = {}\n",
            field,
            decode(isa.word_key, offset as i64)
        ));
    }
    source.push_str(&dispatch);
    source.push_str(
        "$pc = $nx\n\
         end\n\
         local $out = {}\n\
         for $j = 1, #$exports do $out[$j] = $regs[$exports[$j]] end\n\
         return $unpack($out, 1, #$exports)\n\
         end\n",
    );
    symbols.expand(&source, names, pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::lua::parse;

    fn shared(names: &mut NameGen, pattern: &Regex) -> (Symbols, String) {
        let mut symbols = Symbols::new();
        symbols.bind("E", "ENV");
        symbols.bind("R", "CELL");
        let text = support(&mut symbols, names, pattern);
        (symbols, text)
    }

    #[test]
    fn test_support_keeps_pack_and_decoder() {
        assert!(SUPPORT.contains(r##"$select("#", ...)"##));
        assert!(SUPPORT.trim_end().ends_with("return $kv\nend"));
        let pattern = placeholder_pattern().unwrap();
        let mut names = NameGen::new("support", Vec::new());
        let (symbols, text) = shared(&mut names, &pattern);
        parse(&text).unwrap();
        let select = symbols.map["select"].clone();
        assert!(text.contains(&format!(r##"{}("#", ...)"##, select)));
    }

    #[test]
    fn test_expand_reuses_bindings() {
        let pattern = placeholder_pattern().unwrap();
        let mut names = NameGen::new("t", Vec::new());
        let mut symbols = Symbols::new();
        symbols.bind("E", "ENV");
        let text = symbols.expand("$x = $E[$x]", &mut names, &pattern);
        let ident = text.split(' ').next().unwrap().to_string();
        assert!(ident.starts_with('_'));
        assert_eq!(text, format!("{} = ENV[{}]", ident, ident));
    }

    #[test]
    fn test_every_variant_parses() {
        let pattern = placeholder_pattern().unwrap();
        for (i, settings) in [Settings::default(), Settings::all_disabled()]
            .into_iter()
            .enumerate()
        {
            let mut names = NameGen::new("t", Vec::new());
            let mut rng = Entropy::new("t", &i.to_string());
            let (symbols, mut text) = shared(&mut names, &pattern);
            let isa = Isa::new(&settings, &mut rng);
            text.push_str(&interpreter(&isa, "VM", &symbols, &mut names, &mut rng, &pattern));
            assert!(!text.contains('$'));
            let chunk = parse(&text).unwrap();
            assert!(chunk.block.stmts.len() > 8);
        }
    }

    #[test]
    fn test_search_tree_reaches_every_code() {
        let handlers: Vec<(i64, String)> = (1..=7).map(|c| (c * 3, format!("H{}", c))).collect();
        let tree = search_tree(&handlers);
        for c in 1..=7 {
            assert!(tree.contains(&format!("$op == {} then\nH{}\n", c * 3, c)));
        }
    }
}
