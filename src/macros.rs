//! The macro table and the expansion engine (spec §3 "Macro", §4.2).
//!
//! A macro name may carry several entries distinguished by shape (object,
//! function, array) and, for function-like entries, by fixed-argument
//! count. Expansion is a classic rescan-with-hide-sets algorithm: each
//! token carries the set of macro names that produced it, and a macro
//! cannot re-expand itself while that name is in its own hide set. Hide
//! sets are attached only during expansion (via [`Expander`]) and dropped
//! from the final token stream.

use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::diagnostics::{CompileError, ExpansionChain, ExpansionLink, Span, Warning};
use crate::token::{Token, TokenKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroParam {
    Normal(String),
    /// Name without the trailing `...`.
    Variadic(String),
}

impl MacroParam {
    fn name(&self) -> &str {
        match self {
            MacroParam::Normal(n) | MacroParam::Variadic(n) => n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroKind {
    Object,
    Function { params: Vec<MacroParam> },
    Array { param: String },
}

impl MacroKind {
    /// Number of fixed (non-variadic) parameters, for function-like macros.
    fn fixed_count(&self) -> usize {
        match self {
            MacroKind::Function { params } => {
                params.iter().filter(|p| matches!(p, MacroParam::Normal(_))).count()
            }
            _ => 0,
        }
    }

    fn is_variadic(&self) -> bool {
        matches!(self, MacroKind::Function { params } if params.iter().any(|p| matches!(p, MacroParam::Variadic(_))))
    }
}

#[derive(Debug, Clone)]
pub struct Macro {
    pub name: String,
    pub kind: MacroKind,
    pub replacement: Vec<Token>,
    pub defined_at: Span,
}

#[derive(Default)]
pub struct MacroTable {
    entries: HashMap<String, Vec<Macro>>,
}

impl MacroTable {
    pub fn new() -> Self {
        MacroTable::default()
    }

    pub fn define(&mut self, m: Macro) {
        let list = self.entries.entry(m.name.clone()).or_default();
        // Redefining the exact same shape replaces the previous entry
        // (matches `#define` semantics of "last one wins" for a shape);
        // distinct shapes accumulate as overloads.
        if let Some(existing) = list.iter_mut().find(|e| shape_eq(&e.kind, &m.kind)) {
            *existing = m;
        } else {
            list.push(m);
        }
    }

    pub fn undef(&mut self, name: &str) {
        self.entries.remove(name);
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn candidates(&self, name: &str) -> &[Macro] {
        self.entries.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    fn lookup_object<'a>(&'a self, name: &str) -> Option<&'a Macro> {
        self.candidates(name).iter().find(|m| m.kind == MacroKind::Object)
    }

    fn lookup_array<'a>(&'a self, name: &str) -> Option<&'a Macro> {
        self.candidates(name)
            .iter()
            .find(|m| matches!(m.kind, MacroKind::Array { .. }))
    }

    /// Picks the function-like entry matching `argc`, preferring an exact
    /// non-variadic match over a variadic one (spec §4.2 overload rule).
    fn lookup_function<'a>(&'a self, name: &str, argc: usize) -> Option<&'a Macro> {
        let fns: Vec<&Macro> = self
            .candidates(name)
            .iter()
            .filter(|m| matches!(m.kind, MacroKind::Function { .. }))
            .collect();

        if let Some(exact) = fns
            .iter()
            .find(|m| !m.kind.is_variadic() && m.kind.fixed_count() == argc)
        {
            return Some(exact);
        }
        fns.into_iter()
            .filter(|m| m.kind.is_variadic() && argc >= m.kind.fixed_count())
            .max_by_key(|m| m.kind.fixed_count())
    }

    pub fn has_any(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

fn shape_eq(a: &MacroKind, b: &MacroKind) -> bool {
    match (a, b) {
        (MacroKind::Object, MacroKind::Object) => true,
        (MacroKind::Array { .. }, MacroKind::Array { .. }) => true,
        (MacroKind::Function { params: pa }, MacroKind::Function { params: pb }) => {
            pa.len() == pb.len() && pa.iter().zip(pb).all(|(x, y)| std::mem::discriminant(x) == std::mem::discriminant(y))
        }
        _ => false,
    }
}

/// Split tokens at top-level commas, respecting `()[]{}` nesting. Used both
/// for macro call arguments and macro parameter lists.
pub fn split_top_level_commas(tokens: &[Token]) -> Vec<Vec<Token>> {
    if tokens.is_empty() {
        return Vec::new();
    }
    let mut groups = Vec::new();
    let mut current = Vec::new();
    let mut depth = 0i32;
    for tok in tokens {
        match &*tok.text {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => depth -= 1,
            "," if depth == 0 => {
                groups.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(tok.clone());
    }
    groups.push(current);
    groups
}

/// A token still tagged with the set of macro names whose expansion
/// produced it, so later rescanning can refuse to re-enter the same macro.
#[derive(Clone)]
struct Hidden {
    tok: Token,
    hide: Rc<HashSet<String>>,
}

fn extend_hide(hide: &Rc<HashSet<String>>, name: &str) -> Rc<HashSet<String>> {
    let mut set = (**hide).clone();
    set.insert(name.to_string());
    Rc::new(set)
}

pub struct Expander<'a> {
    table: &'a MacroTable,
    pub warnings: Vec<Warning>,
}

impl<'a> Expander<'a> {
    pub fn new(table: &'a MacroTable) -> Self {
        Expander {
            table,
            warnings: Vec::new(),
        }
    }

    /// Fully expands `input`, re-scanning until no further macro use sites
    /// remain (or are blocked by the self-reference hide-set rule).
    pub fn expand(&mut self, input: Vec<Token>) -> Result<Vec<Token>, CompileError> {
        let empty_hide: Rc<HashSet<String>> = Rc::new(HashSet::new());
        let mut queue: VecDeque<Hidden> = input
            .into_iter()
            .map(|tok| Hidden {
                tok,
                hide: empty_hide.clone(),
            })
            .collect();
        let mut output = Vec::new();

        while let Some(item) = queue.pop_front() {
            let name = item.tok.text.to_string();
            if item.tok.kind == TokenKind::Ident
                && self.table.has_any(&name)
                && !item.hide.contains(&name)
            {
                if let Some(expanded) = self.try_invoke(&item, &mut queue)? {
                    for rt in expanded.into_iter().rev() {
                        queue.push_front(rt);
                    }
                    continue;
                }
                // No signature matched this use site's syntactic shape.
                self.warnings.push(Warning {
                    span: item.tok.span,
                    message: format!("no definition of macro `{}` matches this use; left unexpanded", name),
                });
            }
            output.push(item.tok);
        }
        Ok(output)
    }

    /// Attempts to recognize and expand a macro invocation starting at
    /// `head` (already popped from `queue`). On success, consumes whatever
    /// additional tokens the invocation needed (args / index) from the
    /// front of `queue` and returns the substituted-and-hidden replacement.
    fn try_invoke(&mut self, head: &Hidden, queue: &mut VecDeque<Hidden>) -> Result<Option<Vec<Hidden>>, CompileError> {
        let name = head.tok.text.to_string();

        // Array-like: NAME[...]
        if queue.front().map(|h| &*h.tok.text) == Some("[") {
            if let Some(m) = self.table.lookup_array(&name) {
                let (index_tokens, _) = Self::consume_bracketed(queue, "[", "]")?;
                let param = if let MacroKind::Array { param } = &m.kind {
                    param.clone()
                } else {
                    unreachable!()
                };
                let mut bindings: HashMap<String, Vec<Hidden>> = HashMap::new();
                bindings.insert(param, index_tokens);
                let new_hide = extend_hide(&head.hide, &name);
                return Ok(Some(self.substitute(m, &bindings, &new_hide, &head.tok, &name)));
            }
        }

        // Function-like: NAME(args...)
        if queue.front().map(|h| &*h.tok.text) == Some("(") {
            let (raw, _) = Self::consume_bracketed(queue, "(", ")")?;
            let arg_groups = split_hidden_top_level_commas(&raw);
            let argc = if raw.is_empty() { 0 } else { arg_groups.len() };
            if let Some(m) = self.table.lookup_function(&name, argc) {
                let bindings = self.bind_function_params(m, arg_groups, &head.tok)?;
                let new_hide = extend_hide(&head.hide, &name);
                return Ok(Some(self.substitute(m, &bindings, &new_hide, &head.tok, &name)));
            }
            // Put the consumed tokens back; nothing matched this call shape.
            let mut restore = vec![Hidden {
                tok: mk_punct("(", head.tok.span),
                hide: head.hide.clone(),
            }];
            restore.extend(raw);
            restore.push(Hidden {
                tok: mk_punct(")", head.tok.span),
                hide: head.hide.clone(),
            });
            for h in restore.into_iter().rev() {
                queue.push_front(h);
            }
            return Ok(None);
        }

        // Bare NAME: object-like.
        if let Some(m) = self.table.lookup_object(&name) {
            let new_hide = extend_hide(&head.hide, &name);
            return Ok(Some(self.substitute(m, &HashMap::new(), &new_hide, &head.tok, &name)));
        }

        Ok(None)
    }

    fn bind_function_params(
        &self,
        m: &Macro,
        mut args: Vec<Vec<Hidden>>,
        use_site: &Token,
    ) -> Result<HashMap<String, Vec<Hidden>>, CompileError> {
        let params = match &m.kind {
            MacroKind::Function { params } => params.clone(),
            _ => unreachable!(),
        };
        let var_pos = params.iter().position(|p| matches!(p, MacroParam::Variadic(_)));
        let mut bindings = HashMap::new();

        match var_pos {
            None => {
                if args.len() != params.len() {
                    return Err(CompileError::Macro {
                        span: use_site.span,
                        message: format!(
                            "macro `{}` expects {} argument(s), got {}",
                            m.name,
                            params.len(),
                            args.len()
                        ),
                        chain: ExpansionChain::empty(),
                    });
                }
                for (p, a) in params.iter().zip(args.into_iter()) {
                    bindings.insert(p.name().to_string(), a);
                }
            }
            Some(pos) => {
                let prefix = pos;
                let suffix = params.len() - pos - 1;
                if args.len() < prefix + suffix {
                    return Err(CompileError::Macro {
                        span: use_site.span,
                        message: format!(
                            "macro `{}` expects at least {} argument(s), got {}",
                            m.name,
                            prefix + suffix,
                            args.len()
                        ),
                        chain: ExpansionChain::empty(),
                    });
                }
                let var_count = args.len() - prefix - suffix;
                let tail = args.split_off(prefix + var_count);
                let pack = args.split_off(prefix);
                let head_args = args;

                for (p, a) in params[..prefix].iter().zip(head_args.into_iter()) {
                    bindings.insert(p.name().to_string(), a);
                }
                for (p, a) in params[pos + 1..].iter().zip(tail.into_iter()) {
                    bindings.insert(p.name().to_string(), a);
                }
                let joined = join_with_commas(pack, use_site.span);
                bindings.insert(params[pos].name().to_string(), joined);
            }
        }
        Ok(bindings)
    }

    /// Walks the macro's replacement-list template, substituting parameter
    /// placeholders and applying the `##` empty-variadic comma elision rule
    /// (spec §3/§4.2), tagging every emitted token with `new_hide`.
    fn substitute(
        &self,
        m: &Macro,
        bindings: &HashMap<String, Vec<Hidden>>,
        new_hide: &Rc<HashSet<String>>,
        use_site: &Token,
        macro_name: &str,
    ) -> Vec<Hidden> {
        let tpl = &m.replacement;
        let mut out: Vec<Hidden> = Vec::new();
        let mut i = 0;
        while i < tpl.len() {
            let tok = &tpl[i];

            // `, ## varparam` elision pattern.
            if &*tok.text == ","
                && i + 2 < tpl.len()
                && tpl.get(i + 1).map(|t| &*t.text) == Some("##")
                && tpl.get(i + 2).map(|t| t.kind) == Some(TokenKind::Ident)
            {
                let param_name = tpl[i + 2].text.to_string();
                if let Some(bound) = bindings.get(&param_name) {
                    if bound.is_empty() {
                        // Drop the comma entirely; param contributes nothing.
                        i += 3;
                        continue;
                    } else {
                        // Keep the comma, drop only the `##` marker.
                        out.push(tag(tok, new_hide, macro_name, use_site.span));
                        out.extend(bound.iter().map(|h| retag(h, macro_name, use_site.span)));
                        i += 3;
                        continue;
                    }
                }
            }

            if tok.kind == TokenKind::Ident {
                if let Some(bound) = bindings.get(&*tok.text) {
                    out.extend(bound.iter().map(|h| retag(h, macro_name, use_site.span)));
                    i += 1;
                    continue;
                }
            }

            if &*tok.text == "##" {
                // No token-pasting role outside the comma-elision pattern.
                i += 1;
                continue;
            }

            out.push(tag(tok, new_hide, macro_name, use_site.span));
            i += 1;
        }
        out
    }

    fn consume_bracketed(
        queue: &mut VecDeque<Hidden>,
        open: &str,
        close: &str,
    ) -> Result<(Vec<Hidden>, Span), CompileError> {
        let open_tok = queue.pop_front().expect("caller checked front is the opener");
        let open_span = open_tok.tok.span;
        let mut depth = 1i32;
        let mut inner = Vec::new();
        loop {
            let next = queue.pop_front().ok_or_else(|| CompileError::Macro {
                span: open_span,
                message: format!("unterminated `{}`", open),
                chain: ExpansionChain::empty(),
            })?;
            match &*next.tok.text {
                t if t == open => {
                    depth += 1;
                    inner.push(next);
                }
                t if t == close => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok((inner, open_span));
                    }
                    inner.push(next);
                }
                _ => inner.push(next),
            }
        }
    }
}

/// Clones `tok`, tags it with `hide`, and records that it passed through
/// expanding `macro_name` at `site` (innermost link first).
/// Like [`tag`], but keeps the argument token's own hide set rather than
/// the replacement body's — substituted-in arguments may legally re-invoke
/// the enclosing macro (e.g. recursive calls passed as arguments).
fn retag(h: &Hidden, macro_name: &str, site: Span) -> Hidden {
    let mut t = h.tok.clone();
    let mut chain = vec![ExpansionLink {
        macro_name: macro_name.to_string(),
        site,
    }];
    chain.extend(t.expansion.0.clone());
    t.expansion = ExpansionChain(chain);
    Hidden {
        tok: t,
        hide: h.hide.clone(),
    }
}

fn tag(tok: &Token, hide: &Rc<HashSet<String>>, macro_name: &str, site: Span) -> Hidden {
    let mut t = tok.clone();
    let mut chain = vec![ExpansionLink {
        macro_name: macro_name.to_string(),
        site,
    }];
    chain.extend(t.expansion.0.clone());
    t.expansion = ExpansionChain(chain);
    Hidden { tok: t, hide: hide.clone() }
}

fn mk_punct(text: &str, span: Span) -> Token {
    Token {
        kind: TokenKind::Punct,
        text: text.into(),
        span,
        int_value: None,
        expansion: ExpansionChain::empty(),
    }
}

fn split_hidden_top_level_commas(tokens: &[Hidden]) -> Vec<Vec<Hidden>> {
    if tokens.is_empty() {
        return Vec::new();
    }
    let mut groups = Vec::new();
    let mut current = Vec::new();
    let mut depth = 0i32;
    for h in tokens {
        match &*h.tok.text {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => depth -= 1,
            "," if depth == 0 => {
                groups.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(h.clone());
    }
    groups.push(current);
    groups
}

fn join_with_commas(groups: Vec<Vec<Hidden>>, span: Span) -> Vec<Hidden> {
    let mut out = Vec::new();
    for (i, g) in groups.into_iter().enumerate() {
        if i > 0 {
            out.push(Hidden {
                tok: mk_punct(",", span),
                hide: Rc::new(HashSet::new()),
            });
        }
        out.extend(g);
    }
    out
}

/// Parses a `#define` directive's parameter list (already split on
/// top-level commas) into [`MacroParam`]s, recognizing a trailing `...`
/// token on a parameter as marking it variadic.
pub fn parse_params(groups: Vec<Vec<Token>>) -> Vec<MacroParam> {
    groups
        .into_iter()
        .filter(|g| !g.is_empty())
        .map(|g| {
            if g.len() >= 2 && &*g[g.len() - 1].text == "..." {
                MacroParam::Variadic(g[0].text.to_string())
            } else {
                MacroParam::Normal(g[0].text.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Tokenizer;

    fn toks(src: &str) -> Vec<Token> {
        let mut v = Tokenizer::new(0, src).tokenize().unwrap();
        v.pop(); // drop Eof for these body-only fixtures
        v
    }

    fn define_object(table: &mut MacroTable, name: &str, repl: &str) {
        table.define(Macro {
            name: name.to_string(),
            kind: MacroKind::Object,
            replacement: toks(repl),
            defined_at: Span::dummy(),
        });
    }

    fn render(tokens: &[Token]) -> String {
        tokens
            .iter()
            .map(|t| t.text.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn object_like_expansion() {
        let mut table = MacroTable::new();
        define_object(&mut table, "ON", "1");
        let mut exp = Expander::new(&table);
        let out = exp.expand(toks("ON")).unwrap();
        assert_eq!(render(&out), "1");
    }

    #[test]
    fn array_like_expansion_s2() {
        let mut table = MacroTable::new();
        table.define(Macro {
            name: "SQ".into(),
            kind: MacroKind::Array { param: "i".into() },
            replacement: toks("((i)*(i))"),
            defined_at: Span::dummy(),
        });
        let mut exp = Expander::new(&table);
        let out = exp.expand(toks("SQ[4]")).unwrap();
        assert_eq!(render(&out), "( ( 4 ) * ( 4 ) )");
    }

    #[test]
    fn variadic_trailing_empty_pack_elides_comma_s1() {
        let mut table = MacroTable::new();
        table.define(Macro {
            name: "P".into(),
            kind: MacroKind::Function {
                params: vec![MacroParam::Normal("a".into()), MacroParam::Variadic("b".into())],
            },
            replacement: toks(r#"echo(a, ## b)"#),
            defined_at: Span::dummy(),
        });
        let mut exp = Expander::new(&table);
        let out = exp.expand(toks(r#"P("hi")"#)).unwrap();
        assert_eq!(render(&out), r#"echo ( "hi" )"#);

        let out2 = exp.expand(toks(r#"P("hi", "x", "y")"#)).unwrap();
        assert_eq!(render(&out2), r#"echo ( "hi" , "x" , "y" )"#);
    }

    #[test]
    fn variadic_prefix_position() {
        let mut table = MacroTable::new();
        table.define(Macro {
            name: "first_va".into(),
            kind: MacroKind::Function {
                params: vec![MacroParam::Variadic("a".into()), MacroParam::Normal("b".into())],
            },
            replacement: toks(r#"echo(a, "|", b)"#),
            defined_at: Span::dummy(),
        });
        let mut exp = Expander::new(&table);
        let out = exp
            .expand(toks(r#"first_va("a", "b", "c", "d", "e")"#))
            .unwrap();
        assert_eq!(render(&out), r#"echo ( "a" , "b" , "c" , "d" , "|" , "e" )"#);
    }

    #[test]
    fn no_self_reference_during_own_expansion() {
        let mut table = MacroTable::new();
        define_object(&mut table, "LOOP", "LOOP + 1");
        let mut exp = Expander::new(&table);
        let out = exp.expand(toks("LOOP")).unwrap();
        // Second `LOOP` is hidden (self-reference), stays literal.
        assert_eq!(render(&out), "LOOP + 1");
    }

    #[test]
    fn overload_selection_by_arity_s3_style() {
        let mut table = MacroTable::new();
        define_object(&mut table, "FOO", "15");
        table.define(Macro {
            name: "FOO".into(),
            kind: MacroKind::Array { param: "i".into() },
            replacement: toks("(FOO * (i))"),
            defined_at: Span::dummy(),
        });
        table.define(Macro {
            name: "FOO".into(),
            kind: MacroKind::Function { params: vec![] },
            replacement: toks(r#"echo("Hello Foo!")"#),
            defined_at: Span::dummy(),
        });
        table.define(Macro {
            name: "FOO".into(),
            kind: MacroKind::Function {
                params: vec![MacroParam::Normal("a".into()), MacroParam::Normal("b".into())],
            },
            replacement: toks(r#"echo("Look at my args: ", a, b)"#),
            defined_at: Span::dummy(),
        });

        let mut exp = Expander::new(&table);
        assert_eq!(render(&exp.expand(toks("FOO")).unwrap()), "15");
        assert_eq!(render(&exp.expand(toks("FOO[5]")).unwrap()), "( 15 * ( 5 ) )");
        assert_eq!(render(&exp.expand(toks("FOO()")).unwrap()), r#"echo ( "Hello Foo!" )"#);
        assert_eq!(
            render(&exp.expand(toks(r#"FOO(55, 66)"#)).unwrap()),
            r#"echo ( "Look at my args: " , 55 , 66 )"#
        );
    }

    #[test]
    fn unmatched_call_shape_warns_and_stays_literal() {
        let mut table = MacroTable::new();
        table.define(Macro {
            name: "FOO".into(),
            kind: MacroKind::Function {
                params: vec![MacroParam::Normal("a".into()), MacroParam::Normal("b".into())],
            },
            replacement: toks("a"),
            defined_at: Span::dummy(),
        });
        let mut exp = Expander::new(&table);
        let out = exp
            .expand(toks(r#"FOO("no", "variant", "takes", "five", "args")"#))
            .unwrap();
        assert_eq!(!exp.warnings.is_empty(), true);
        assert_eq!(render(&out).starts_with("FOO ("), true);
    }
}
