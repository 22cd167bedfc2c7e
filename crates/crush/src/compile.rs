//! Text map compiler.
//!
//! Parses the authoring format (`device` / `type` / bucket / `rule`
//! declarations), resolves names, builds a [`CrushMap`] and finalizes it.
//! All naming state lives in a [`CompilerContext`] threaded through the
//! parse; nothing is process-wide. Every failure is qualified with the
//! input line it was detected on.
//!
//! ```text
//! device 0 osd0 offload 0.500
//! type 1 host
//! host h1 {
//!     id -1
//!     alg straw
//!     item osd0 weight 1.000
//! }
//! rule data {
//!     pool 0
//!     type replicated
//!     min_size 1
//!     max_size 10
//!     step take h1
//!     step choose firstn 0 type device
//!     step emit
//! }
//! ```
//!
//! `#` starts a comment anywhere on a line.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::bucket::{AlgKind, WEIGHT_ONE};
use crate::error::{Error, Result};
use crate::map::{CrushMap, OFFLOAD_DOWN};
use crate::rule::{ChooseMode, Rule, RuleType, Step};

/// One token plus the line it came from.
#[derive(Debug, Clone)]
struct Token {
    text: String,
    line: usize,
}

/// Naming state for a single compilation.
///
/// The map itself also holds name registries; the context additionally
/// remembers declaration order, default weights, and ids reserved by
/// not-yet-parsed `id` lines.
#[derive(Debug, Default)]
struct CompilerContext {
    item_id: HashMap<String, i32>,
    id_item: BTreeMap<i32, String>,
    /// Default weight an item contributes when a bucket lists it without
    /// an explicit `weight`: a bucket's total for buckets, 1.0 otherwise.
    item_weight: HashMap<i32, u32>,
    type_id: HashMap<String, i32>,
    rule_names: HashSet<String>,
    /// Explicit bucket ids seen anywhere in the input; auto-assignment
    /// must not collide with a bucket declared further down.
    reserved_ids: HashSet<i32>,
}

/// Compile a text map.
///
/// # Errors
///
/// Any [`Error`] of the authoring family, qualified with the input line.
pub fn compile(source: &str) -> Result<CrushMap> {
    let tokens = tokenize(source);
    let mut ctx = CompilerContext::default();
    let mut map = CrushMap::new();

    // The device level always exists as type 0, whether or not the input
    // declares it.
    ctx.type_id.insert("device".to_string(), 0);
    map.set_type_name(0, "device")?;

    reserve_explicit_ids(&tokens, &mut ctx);

    let mut p = Parser { tokens: &tokens, pos: 0 };
    while let Some(tok) = p.peek() {
        let line = tok.line;
        match tok.text.as_str() {
            "device" => parse_device(&mut p, &mut ctx, &mut map)?,
            "type" => parse_type(&mut p, &mut ctx, &mut map)?,
            "rule" => parse_rule(&mut p, &mut ctx, &mut map)?,
            name if ctx.type_id.contains_key(name) => parse_bucket(&mut p, &mut ctx, &mut map)?,
            other => {
                return Err(Error::Parse { msg: format!("parse error at '{other}'") }.at(line));
            }
        }
    }

    map.finalize()?;
    Ok(map)
}

/// Split into whitespace-separated tokens; braces always stand alone and
/// `#` comments run to end of line.
fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for (idx, raw) in source.lines().enumerate() {
        let line = idx + 1;
        let code = raw.find('#').map_or(raw, |at| &raw[..at]);
        let mut current = String::new();
        for ch in code.chars() {
            if ch.is_whitespace() || ch == '{' || ch == '}' {
                if !current.is_empty() {
                    tokens.push(Token { text: std::mem::take(&mut current), line });
                }
                if ch == '{' || ch == '}' {
                    tokens.push(Token { text: ch.to_string(), line });
                }
            } else {
                current.push(ch);
            }
        }
        if !current.is_empty() {
            tokens.push(Token { text: current, line });
        }
    }
    tokens
}

/// Pre-scan for explicit `id` declarations so auto-assigned bucket ids
/// never collide with a bucket declared further down the file.
fn reserve_explicit_ids(tokens: &[Token], ctx: &mut CompilerContext) {
    let mut it = tokens.iter().peekable();
    while let Some(tok) = it.next() {
        if tok.text == "id" {
            if let Some(next) = it.peek() {
                if let Ok(id) = next.text.parse::<i32>() {
                    ctx.reserved_ids.insert(id);
                }
            }
        }
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    /// Line to pin an error on: the next token's, or the last one's at
    /// end of input.
    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn next(&mut self) -> Result<&'a Token> {
        let line = self.line();
        let tok = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| Error::Parse { msg: "unexpected end of input".into() }.at(line))?;
        self.pos += 1;
        Ok(tok)
    }

    fn expect(&mut self, want: &str) -> Result<()> {
        let tok = self.next()?;
        if tok.text == want {
            Ok(())
        } else {
            Err(Error::Parse { msg: format!("expected '{want}', found '{}'", tok.text) }
                .at(tok.line))
        }
    }

    fn int(&mut self) -> Result<i32> {
        let tok = self.next()?;
        tok.text
            .parse()
            .map_err(|_| Error::Parse { msg: format!("expected integer, found '{}'", tok.text) }
                .at(tok.line))
    }

    fn float(&mut self) -> Result<f64> {
        let tok = self.next()?;
        tok.text
            .parse()
            .map_err(|_| Error::Parse { msg: format!("expected number, found '{}'", tok.text) }
                .at(tok.line))
    }
}

/// Convert a decimal weight to 16.16 fixed point.
fn to_fixed(value: f64) -> u32 {
    (value * f64::from(WEIGHT_ONE)).round() as u32
}

/// `device <id> <name> [offload <f> | load <f> | down]`
fn parse_device(p: &mut Parser<'_>, ctx: &mut CompilerContext, map: &mut CrushMap) -> Result<()> {
    p.expect("device")?;
    let line = p.line();
    let id = p.int()?;
    let name = p.next()?.text.clone();
    if ctx.item_id.contains_key(&name) {
        return Err(Error::Duplicate { name }.at(line));
    }

    let offload = match p.peek().map(|t| t.text.as_str()) {
        Some("offload") => {
            p.next()?;
            Some(p.float()?)
        }
        Some("load") => {
            p.next()?;
            Some(1.0 - p.float()?)
        }
        Some("down") => {
            p.next()?;
            Some(1.0)
        }
        _ => None,
    };
    let offload = match offload {
        Some(value) => {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidOffload { value }.at(line));
            }
            Some(to_fixed(value).min(OFFLOAD_DOWN))
        }
        None => None,
    };

    debug!(id, %name, ?offload, "device");
    map.add_device(id, Some(&name), offload).map_err(|e| e.at(line))?;
    ctx.item_id.insert(name.clone(), id);
    ctx.id_item.insert(id, name);
    Ok(())
}

/// `type <id> <name>`
fn parse_type(p: &mut Parser<'_>, ctx: &mut CompilerContext, map: &mut CrushMap) -> Result<()> {
    p.expect("type")?;
    let line = p.line();
    let id = p.int()?;
    let name = p.next()?.text.clone();
    match ctx.type_id.get(&name) {
        Some(&existing) if existing != id => {
            return Err(Error::Duplicate { name }.at(line));
        }
        _ => {}
    }
    debug!(id, %name, "type");
    map.set_type_name(id, &name).map_err(|e| e.at(line))?;
    ctx.type_id.insert(name, id);
    Ok(())
}

/// One `item` line inside a bucket block, before placement.
struct ItemDecl {
    line: usize,
    name: String,
    id: i32,
    weight: Option<u32>,
    pos: Option<i32>,
}

/// `<typename> <name> { id …  alg …  item … }`
fn parse_bucket(p: &mut Parser<'_>, ctx: &mut CompilerContext, map: &mut CrushMap) -> Result<()> {
    let type_tok = p.next()?;
    let start_line = type_tok.line;
    let type_id = *ctx
        .type_id
        .get(&type_tok.text)
        .ok_or_else(|| Error::Undefined { name: type_tok.text.clone() }.at(start_line))?;

    let name = p.next()?.text.clone();
    if ctx.item_id.contains_key(&name) {
        return Err(Error::Duplicate { name }.at(start_line));
    }
    p.expect("{")?;

    let mut explicit_id: Option<i32> = None;
    let mut alg: Option<AlgKind> = None;
    let mut decls: Vec<ItemDecl> = Vec::new();
    let mut used_pos: HashSet<i32> = HashSet::new();

    loop {
        let tok = p.next()?;
        match tok.text.as_str() {
            "}" => break,
            "id" => {
                let line = tok.line;
                let id = p.int()?;
                if id >= 0 {
                    return Err(Error::Parse {
                        msg: format!("bucket id {id} must be negative"),
                    }
                    .at(line));
                }
                explicit_id = Some(id);
            }
            "alg" => {
                let tok = p.next()?;
                alg = Some(AlgKind::from_name(&tok.text).ok_or_else(|| {
                    Error::Parse { msg: format!("unknown bucket alg '{}'", tok.text) }
                        .at(tok.line)
                })?);
            }
            "item" => {
                let line = tok.line;
                let item_tok = p.next()?;
                let item_name = item_tok.text.clone();
                let id = *ctx
                    .item_id
                    .get(&item_name)
                    .ok_or_else(|| Error::Undefined { name: item_name.clone() }.at(line))?;
                let mut weight = None;
                let mut pos = None;
                while let Some(tag) = p.peek() {
                    match tag.text.as_str() {
                        "weight" => {
                            p.next()?;
                            let w = p.float()?;
                            if !(0.0..=65_535.0).contains(&w) {
                                return Err(Error::Parse {
                                    msg: format!("illegal weight {w} on item '{item_name}'"),
                                }
                                .at(line));
                            }
                            weight = Some(to_fixed(w));
                        }
                        "pos" => {
                            p.next()?;
                            let at = p.int()?;
                            if !used_pos.insert(at) {
                                return Err(Error::Parse {
                                    msg: format!(
                                        "item '{item_name}' in bucket '{name}' has explicit \
                                         pos {at}, which is occupied"
                                    ),
                                }
                                .at(line));
                            }
                            pos = Some(at);
                        }
                        _ => break,
                    }
                }
                decls.push(ItemDecl { line, name: item_name, id, weight, pos });
            }
            other => {
                return Err(Error::Parse { msg: format!("parse error at '{other}'") }
                    .at(tok.line));
            }
        }
    }

    let alg = alg.ok_or_else(|| {
        Error::Parse { msg: format!("bucket '{name}' has no alg") }.at(start_line)
    })?;

    // Place items: explicit positions first, the rest fill the gaps in
    // declaration order.
    let size = decls.len();
    let mut items = vec![0i32; size];
    let mut weights = vec![0u32; size];
    let mut filled: HashSet<i32> = HashSet::new();
    for decl in &decls {
        if let Some(pos) = decl.pos {
            if pos < 0 || pos as usize >= size {
                return Err(Error::Parse {
                    msg: format!(
                        "item '{}' in bucket '{name}' has pos {pos} >= size {size}",
                        decl.name
                    ),
                }
                .at(decl.line));
            }
            filled.insert(pos);
        }
    }
    let mut cursor = 0i32;
    for decl in &decls {
        let pos = match decl.pos {
            Some(pos) => pos,
            None => {
                while filled.contains(&cursor) {
                    cursor += 1;
                }
                let pos = cursor;
                filled.insert(pos);
                pos
            }
        };
        items[pos as usize] = decl.id;
        weights[pos as usize] = decl
            .weight
            .or_else(|| ctx.item_weight.get(&decl.id).copied())
            .unwrap_or(WEIGHT_ONE);
    }

    let id = match explicit_id {
        Some(id) => id,
        None => {
            let mut candidate = -1;
            while ctx.id_item.contains_key(&candidate) || ctx.reserved_ids.contains(&candidate) {
                candidate -= 1;
            }
            candidate
        }
    };

    let total: u64 = weights.iter().map(|&w| u64::from(w)).sum();
    debug!(%name, id, size, total, "bucket");

    map.add_bucket(id, alg, type_id, items, weights).map_err(|e| e.at(start_line))?;
    map.set_item_name(id, &name).map_err(|e| e.at(start_line))?;
    ctx.id_item.insert(id, name.clone());
    ctx.item_id.insert(name, id);
    ctx.item_weight.insert(id, u32::try_from(total).unwrap_or(u32::MAX));
    Ok(())
}

/// `rule [name] { pool … type … min_size … max_size … step … }`
fn parse_rule(p: &mut Parser<'_>, ctx: &mut CompilerContext, map: &mut CrushMap) -> Result<()> {
    p.expect("rule")?;
    let start_line = p.line();

    let name = match p.peek() {
        Some(tok) if tok.text != "{" => {
            let name = tok.text.clone();
            p.next()?;
            if !ctx.rule_names.insert(name.clone()) {
                return Err(Error::Duplicate { name }.at(start_line));
            }
            Some(name)
        }
        _ => None,
    };
    p.expect("{")?;

    p.expect("pool")?;
    let pool = p.int()?;
    if pool < 0 {
        return Err(Error::Parse { msg: format!("negative pool {pool}") }.at(p.line()));
    }
    p.expect("type")?;
    let type_tok = p.next()?;
    let rule_type = RuleType::from_name(&type_tok.text).ok_or_else(|| {
        Error::Parse { msg: format!("unknown rule type '{}'", type_tok.text) }.at(type_tok.line)
    })?;
    p.expect("min_size")?;
    let min_size = p.int()?;
    p.expect("max_size")?;
    let max_size = p.int()?;
    if min_size < 0 || max_size < min_size {
        return Err(Error::Parse {
            msg: format!("bad size range [{min_size}, {max_size}]"),
        }
        .at(p.line()));
    }

    let mut rule = Rule::new(pool as u32, rule_type, min_size as u32, max_size as u32);
    loop {
        let tok = p.next()?;
        match tok.text.as_str() {
            "}" => break,
            "step" => {
                let step = parse_step(p, ctx)?;
                rule = rule.with_step(step);
            }
            other => {
                return Err(Error::Parse { msg: format!("parse error at '{other}'") }
                    .at(tok.line));
            }
        }
    }

    let id = map.add_rule(rule);
    if let Some(name) = &name {
        map.set_rule_name(id, name).map_err(|e| e.at(start_line))?;
    }
    debug!(id, ?name, "rule");
    Ok(())
}

fn parse_step(p: &mut Parser<'_>, ctx: &CompilerContext) -> Result<Step> {
    let tok = p.next()?;
    let line = tok.line;
    match tok.text.as_str() {
        "noop" => Ok(Step::Noop),
        "emit" => Ok(Step::Emit),
        "take" => {
            let item_tok = p.next()?;
            let item = *ctx
                .item_id
                .get(&item_tok.text)
                .ok_or_else(|| Error::Undefined { name: item_tok.text.clone() }.at(line))?;
            Ok(Step::Take { item })
        }
        choose @ ("choose" | "chooseleaf") => {
            let mode_tok = p.next()?;
            let mode = ChooseMode::from_name(&mode_tok.text).ok_or_else(|| {
                Error::Parse { msg: format!("unknown choose mode '{}'", mode_tok.text) }
                    .at(mode_tok.line)
            })?;
            let n = p.int()?;
            p.expect("type")?;
            let type_tok = p.next()?;
            let type_id = *ctx
                .type_id
                .get(&type_tok.text)
                .ok_or_else(|| Error::Undefined { name: type_tok.text.clone() }.at(line))?;
            if choose == "choose" {
                Ok(Step::Choose { mode, n, type_id })
            } else {
                Ok(Step::ChooseLeaf { mode, n, type_id })
            }
        }
        other => {
            Err(Error::Parse { msg: format!("unknown step '{other}'") }.at(line))
        }
    }
}
