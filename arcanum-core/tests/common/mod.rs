//! Shared helpers: a Luau harness capturing `print` and a suite of programs

#![allow(dead_code)]

use mlua::Lua;

/// Replaces `print` with a collector writing into `__out`
const HARNESS: &str = r##"
__out = {}
print = function(...)
    local parts = {}
    for i = 1, select("#", ...) do
        parts[i] = tostring((select(i, ...)))
    end
    __out[#__out + 1] = table.concat(parts, "\t")
end
"##;

/// Run `code` in a fresh Luau state; returns every printed line
pub fn run_lua(code: &str) -> Result<Vec<String>, String> {
    run_lua_with(code, "")
}

/// Like [`run_lua`], with `setup` executed after the harness and before `code`
pub fn run_lua_with(code: &str, setup: &str) -> Result<Vec<String>, String> {
    run_lua_between(setup, code, "")
}

/// Like [`run_lua`], with `after` executed in the same state once `code` returns
pub fn run_lua_then(code: &str, after: &str) -> Result<Vec<String>, String> {
    run_lua_between("", code, after)
}

/// `setup`, then `code`, then `after`, all in one state
pub fn run_lua_between(setup: &str, code: &str, after: &str) -> Result<Vec<String>, String> {
    let lua = Lua::new();
    lua.load(HARNESS)
        .set_name("harness")
        .exec()
        .map_err(|e| e.to_string())?;
    if !setup.is_empty() {
        lua.load(setup)
            .set_name("setup")
            .exec()
            .map_err(|e| e.to_string())?;
    }
    lua.load(code)
        .set_name("program")
        .exec()
        .map_err(|e| format!("{}\n--- code ---\n{}", e, code))?;
    if !after.is_empty() {
        lua.load(after)
            .set_name("after")
            .exec()
            .map_err(|e| e.to_string())?;
    }
    lua.globals()
        .get::<Vec<String>>("__out")
        .map_err(|e| e.to_string())
}

/// Programs whose printed output must survive every transformation
pub const PROGRAMS: &[(&str, &str)] = &[
    (
        "arithmetic",
        r##"
local a, b = 17, 5
print(a + b, a - b, a * b, a / b, a % b, a ^ 2, -a)
print(a > b, a <= b, a == 17, a ~= b)
local c = (a + b) * (a - b) / 4
print(c, 7 % -3, -7 % 3, 2 ^ 0.5 > 1.41)
print(0.25 + 0.5, 1e3, 3 * 0.1)
"##,
    ),
    (
        "strings",
        r##"
local s = "Hello, World"
print(#s, s:upper(), s:lower(), s:sub(1, 5), s:sub(-5))
print(string.rep("ab", 3), s:byte(1), string.char(72, 105))
print(string.format("%d items at %.2f each: %s", 3, 1.5, "ok"))
local words = {}
for w in s:gmatch("%a+") do
    words[#words + 1] = w
end
print(table.concat(words, "|"), s:find("World"), (s:gsub("o", "0")))
print("tab\tquote\"", 'single\'', "\65\066\x43")
"##,
    ),
    (
        "closures",
        r##"
local function counter(start)
    local n = start
    return function(step)
        n = n + (step or 1)
        return n
    end
end
local c1, c2 = counter(0), counter(100)
print(c1(), c1(5), c2(), c1())
local fns = {}
for i = 1, 3 do
    fns[i] = function() return i * 10 end
end
print(fns[1](), fns[2](), fns[3]())
local shared = 0
local function bump() shared = shared + 1 end
bump() bump()
print(shared)
"##,
    ),
    (
        "tables",
        r##"
local t = {10, 20, 30, x = "a", ["y z"] = "b"}
t[#t + 1] = 40
table.insert(t, 1, 5)
print(#t, t[1], t[5], t.x, t["y z"])
print(table.concat(t, ","), table.remove(t), #t)
local nested = {inner = {list = {1, 2, 3}}}
nested.inner.list[2] = nested.inner.list[2] * 7
print(nested.inner.list[2], #nested.inner.list)
local keys = {}
for k in pairs({b = 1, a = 2, c = 3}) do
    keys[#keys + 1] = k
end
table.sort(keys)
print(table.concat(keys, " "))
local sorted = {5, 3, 9, 1}
table.sort(sorted, function(p, q) return p > q end)
print(table.concat(sorted, " "))
"##,
    ),
    (
        "loops",
        r##"
local total = 0
for i = 1, 10 do total = total + i end
for i = 10, 1, -3 do total = total - i end
print(total)
local n, steps = 27, 0
while n ~= 1 do
    if n % 2 == 0 then n = n / 2 else n = 3 * n + 1 end
    steps = steps + 1
end
print(steps)
local k = 0
repeat
    k = k + 1
    local done = k * k > 50
until done
print(k)
for i = 1, 5 do
    for j = 1, 5 do
        if i * j == 12 then
            print("found", i, j)
            break
        end
    end
end
for _, v in ipairs({"a", "b", "c"}) do
    print(v)
end
"##,
    ),
    (
        "recursion",
        r##"
local function fib(n)
    if n < 2 then return n end
    return fib(n - 1) + fib(n - 2)
end
local function fact(n)
    if n <= 1 then return 1 end
    return n * fact(n - 1)
end
print(fib(15), fact(10))
local isEven, isOdd
function isEven(n) if n == 0 then return true end return isOdd(n - 1) end
function isOdd(n) if n == 0 then return false end return isEven(n - 1) end
print(isEven(10), isOdd(7))
"##,
    ),
    (
        "varargs",
        r##"
local function sum(...)
    local s = 0
    for _, v in ipairs({...}) do s = s + v end
    return s, select("#", ...)
end
print(sum(1, 2, 3, 4))
local function pass(...) return ... end
print(pass(1, nil, 3))
local function pair() return "x", "y" end
local a, b, c = pair()
print(a, b, c, (pair()))
local packed = {pair(), pair()}
print(#packed)
"##,
    ),
    (
        "metatables",
        r##"
local Vec = {}
Vec.__index = Vec
function Vec.new(x, y) return setmetatable({x = x, y = y}, Vec) end
function Vec.__add(p, q) return Vec.new(p.x + q.x, p.y + q.y) end
function Vec:len2() return self.x * self.x + self.y * self.y end
Vec.__tostring = function(v) return "(" .. v.x .. "," .. v.y .. ")" end
local v = Vec.new(1, 2) + Vec.new(3, 4)
print(tostring(v), v:len2())
local defaults = setmetatable({}, {__index = function(_, key) return key .. "!" end})
print(defaults.hello, rawget(defaults, "hello"))
"##,
    ),
    (
        "logic",
        r##"
local none = nil
print(none or "default", false and 1, 1 and 2, nil and nil)
print(not nil, not 0, #"abc" == 3 and "three" or "other")
local x, y = 1, 2
x, y = y, x
print(x, y)
local grade = 73
if grade >= 90 then print("A") elseif grade >= 70 then print("C") else print("F") end
"##,
    ),
    (
        "globals",
        r##"
counter = 5
function double(n) return n * 2 end
local function useGlobal() counter = double(counter) return counter end
print(useGlobal(), useGlobal(), counter)
config = {name = "demo", level = 3}
config.level = config.level + 1
print(config.name, config.level, type(config), type(print), math.max(3, 9, 4), math.floor(7.8))
"##,
    ),
    (
        "luau",
        r##"
local total: number = 0
local function add(a: number, b: number): number
    return a + b
end
for i = 1, 6 do
    if i % 2 == 0 then continue end
    total += add(i, 1)
end
local label = if total > 10 then "big" else "small"
local name = "arcanum"
print(total, label, `{name} has {#name} letters`)
total *= 2
total -= 1
print(total, 7 // 2)
"##,
    ),
];
