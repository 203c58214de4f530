//! Instruction set of the embedded stack machine
//!
//! An instruction is five words `(op, a, b, c, next)`. Instructions live in
//! numbered slots; slot `s` occupies words `5s-4 ..= 5s` of the code table
//! and execution continues at slot `next`, with `next = 0` halting. Every
//! word is a non-negative integer below 2^24.

use std::collections::BTreeMap;

use crate::config::Settings;
use crate::rng::Entropy;

/// Words are reduced modulo this value when encrypted
pub const WORD_MODULUS: i64 = 1 << 24;
pub const WORDS_PER_SLOT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    /// push constant `a`
    PushK,
    /// push nil (`a = 0`), true (1) or false (2)
    LoadV,
    /// push the value of outer variable accessor `a`
    GetU,
    /// pop into outer variable setter `a`
    SetU,
    /// push global named by constant `a`
    GetG,
    SetG,
    /// push register `a`
    GetR,
    SetR,
    /// `obj key -> obj[key]`
    GetT,
    /// `obj key value ->` with `obj[key] = value`
    SetT,
    /// `obj -> obj[K[a]] obj`
    SelfK,
    /// remember the stack height for a following CALL, ADJ or TAPPENDM
    Mark,
    /// call with arguments above the mark; `a - 1` results, all when `a = 0`
    Call,
    /// pad or truncate the values above the mark to exactly `a`
    Adj,
    Pop,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Unm,
    Not,
    Len,
    /// continue at slot `a`
    Jmp,
    /// pop; continue at `a` when falsy
    JmpF,
    /// continue at `a` keeping the top when falsy, otherwise fall through
    TestF,
    TestT,
    NewT,
    /// `t v -> t` with `t[a] = v`
    TAppend,
    /// store every value above the mark at `t[a], t[a+1], ...`
    TAppendM,
    /// `t k v -> t` with `t[k] = v`
    TSetK,
    /// numeric for setup over registers `a..a+3`; exit to `b`
    ForPrep,
    /// numeric for step; loop back to `b`
    ForLoop,
    /// generic for setup: pop iterator, state and control into `a..a+2`
    TForPrep,
    /// generic for step: call the iterator, fill `b` variables, exit to `c`
    TForCall,
}

impl Op {
    pub const ALL: [Op; 43] = [
        Op::PushK,
        Op::LoadV,
        Op::GetU,
        Op::SetU,
        Op::GetG,
        Op::SetG,
        Op::GetR,
        Op::SetR,
        Op::GetT,
        Op::SetT,
        Op::SelfK,
        Op::Mark,
        Op::Call,
        Op::Adj,
        Op::Pop,
        Op::Add,
        Op::Sub,
        Op::Mul,
        Op::Div,
        Op::Mod,
        Op::Pow,
        Op::Concat,
        Op::Eq,
        Op::Ne,
        Op::Lt,
        Op::Le,
        Op::Gt,
        Op::Ge,
        Op::Unm,
        Op::Not,
        Op::Len,
        Op::Jmp,
        Op::JmpF,
        Op::TestF,
        Op::TestT,
        Op::NewT,
        Op::TAppend,
        Op::TAppendM,
        Op::TSetK,
        Op::ForPrep,
        Op::ForLoop,
        Op::TForPrep,
        Op::TForCall,
    ];

    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::PushK => "PUSHK",
            Op::LoadV => "LOADV",
            Op::GetU => "GETU",
            Op::SetU => "SETU",
            Op::GetG => "GETG",
            Op::SetG => "SETG",
            Op::GetR => "GETR",
            Op::SetR => "SETR",
            Op::GetT => "GETT",
            Op::SetT => "SETT",
            Op::SelfK => "SELF",
            Op::Mark => "MARK",
            Op::Call => "CALL",
            Op::Adj => "ADJ",
            Op::Pop => "POP",
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Mul => "MUL",
            Op::Div => "DIV",
            Op::Mod => "MOD",
            Op::Pow => "POW",
            Op::Concat => "CONCAT",
            Op::Eq => "EQ",
            Op::Ne => "NE",
            Op::Lt => "LT",
            Op::Le => "LE",
            Op::Gt => "GT",
            Op::Ge => "GE",
            Op::Unm => "UNM",
            Op::Not => "NOT",
            Op::Len => "LEN",
            Op::Jmp => "JMP",
            Op::JmpF => "JMPF",
            Op::TestF => "TESTF",
            Op::TestT => "TESTT",
            Op::NewT => "NEWT",
            Op::TAppend => "TAPPEND",
            Op::TAppendM => "TAPPENDM",
            Op::TSetK => "TSETK",
            Op::ForPrep => "FORPREP",
            Op::ForLoop => "FORLOOP",
            Op::TForPrep => "TFORPREP",
            Op::TForCall => "TFORCALL",
        }
    }
}

/// Key stream applied to instruction words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordKey {
    Plain,
    /// the same key for every word
    Fixed(i64),
    /// `(k0 * slot + k1 * offset + k2) mod 2^24`, offset in `0..5`
    Rolling { k0: i64, k1: i64, k2: i64 },
}

impl WordKey {
    pub fn key(self, slot: i64, offset: i64) -> i64 {
        match self {
            WordKey::Plain => 0,
            WordKey::Fixed(k) => k,
            WordKey::Rolling { k0, k1, k2 } => (k0 * slot + k1 * offset + k2) % WORD_MODULUS,
        }
    }

    pub fn encode(self, word: i64, slot: i64, offset: i64) -> i64 {
        match self {
            WordKey::Plain => word,
            _ => (word + self.key(slot, offset)) % WORD_MODULUS,
        }
    }
}

/// One randomized instruction set; each nesting level gets its own
#[derive(Debug, Clone)]
pub struct Isa {
    codes: BTreeMap<Op, i64>,
    pub word_key: WordKey,
    /// Additive byte cipher for string constants
    pub encrypt_strings: bool,
    /// Execution order differs from slot order
    pub permute_slots: bool,
    /// Binary-search opcode dispatch
    pub tree_dispatch: bool,
    /// Shuffled handler order plus decoy handlers
    pub mutate_handlers: bool,
}

impl Isa {
    pub fn new(settings: &Settings, rng: &mut Entropy) -> Self {
        let mut values: Vec<i64> = if settings.opcode_shuffle {
            let mut pool: Vec<i64> = (1..=255).collect();
            rng.shuffle(&mut pool);
            pool.truncate(Op::ALL.len());
            pool
        } else {
            (1..=Op::ALL.len() as i64).collect()
        };
        values.reverse();
        let codes = Op::ALL
            .iter()
            .map(|op| (*op, values.pop().unwrap_or_default()))
            .collect();

        let word_key = match (settings.instruction_encryption, settings.dynamic_keys) {
            (false, _) => WordKey::Plain,
            (true, false) => WordKey::Fixed(rng.range(1, WORD_MODULUS - 1)),
            (true, true) => WordKey::Rolling {
                k0: rng.range(1, WORD_MODULUS - 1),
                k1: rng.range(1, WORD_MODULUS - 1),
                k2: rng.range(0, WORD_MODULUS - 1),
            },
        };

        Self {
            codes,
            word_key,
            encrypt_strings: settings.instruction_encryption,
            permute_slots: settings.non_linear_pc,
            tree_dispatch: settings.jump_logic,
            mutate_handlers: settings.vm_mutation,
        }
    }

    pub fn code(&self, op: Op) -> i64 {
        self.codes.get(&op).copied().unwrap_or_default()
    }

    /// Codes in `1..=255` that no opcode uses
    pub fn unused_codes(&self) -> Vec<i64> {
        (1..=255)
            .filter(|c| !self.codes.values().any(|v| v == c))
            .collect()
    }
}

/// One instruction before encoding; jump operands are instruction indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub op: Op,
    pub a: i64,
    pub b: i64,
    pub c: i64,
}

impl Instr {
    pub fn new(op: Op, a: i64) -> Self {
        Self { op, a, b: 0, c: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shuffled_codes_are_distinct() {
        let mut rng = Entropy::new("isa", "codes");
        let isa = Isa::new(&Settings::default(), &mut rng);
        let mut codes: Vec<i64> = Op::ALL.iter().map(|op| isa.code(*op)).collect();
        assert!(codes.iter().all(|c| (1..=255).contains(c)));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), Op::ALL.len());
        assert_eq!(isa.unused_codes().len(), 255 - Op::ALL.len());
    }

    #[test]
    fn test_plain_codes_are_sequential() {
        let mut rng = Entropy::new("isa", "plain");
        let isa = Isa::new(&Settings::all_disabled(), &mut rng);
        assert_eq!(isa.code(Op::PushK), 1);
        assert_eq!(isa.code(Op::TForCall), 43);
        assert_eq!(isa.word_key, WordKey::Plain);
    }

    #[test]
    fn test_word_keys_invert() {
        let key = WordKey::Rolling {
            k0: 16_777_000,
            k1: 12_345,
            k2: 99,
        };
        for slot in [1, 7, 4_000] {
            for offset in 0..5 {
                let word = (slot * 31 + offset) % WORD_MODULUS;
                let stored = key.encode(word, slot, offset);
                assert!((0..WORD_MODULUS).contains(&stored));
                let decoded = (stored - key.key(slot, offset)).rem_euclid(WORD_MODULUS);
                assert_eq!(decoded, word);
            }
        }
    }
}
