//! Restricted compiler pass.
//!
//! [`compile_restricted`] parses cleaned source, rejects constructs the sandbox
//! does not support, and returns rewritten source in which every guarded
//! operation goes through a hook installed by the sandbox policy:
//!
//! | source                    | rewritten                                  |
//! |---------------------------|--------------------------------------------|
//! | `obj.name`                | `_getattr_(obj, 'name')`                   |
//! | `obj[key]`                | `_getitem_(obj, key)`                      |
//! | `obj[a:b]`                | `_getitem_(obj, slice(a, b, None))`        |
//! | `for x in it`             | `for x in _getiter_(it)`                   |
//! | `for a, b in it`          | `for a, b in _iter_unpack_sequence_(it, (0, 0,))` |
//! | `a, *b = value`           | `a, *b = _unpack_sequence_(value, (0, 1,))` |
//! | `obj.name = v`            | `_write_(obj).name = v`                    |
//! | `obj[key] = v`, `del ...` | `_write_(obj)[key] = v`                    |
//!
//! The rewrite splices text at node boundaries instead of regenerating
//! source, so line numbers are unchanged and error lines still point at what
//! the caller wrote.
//!
//! ## Rejected at compile time
//!
//! - names starting with `_` (other than `_` itself), loaded or bound
//! - stores and deletes of attributes starting with `_`
//! - `import` / `from ... import`
//! - `async` constructs, `await`, `nonlocal`, `match`
//! - augmented assignment to attributes or items
//! - chained assignment with unpacking targets, unpacking `with` targets
//!
//! Reading an attribute that starts with `_` is left to the runtime guard.

use rustpython_parser::{
    ast::{self, Ranged},
    Parse,
};

use crate::fault::SandboxFault;
use crate::translate::{line_of_offset, parse_fault};

/// Parses `source` and returns the rewritten, guard-calling source.
pub fn compile_restricted(source: &str) -> Result<String, SandboxFault> {
    let suite = parse(source)?;
    let mut rewriter = Rewriter::new(source);
    rewriter.visit_body(&suite)?;
    Ok(rewriter.finish())
}

/// Parses `source` only. Used for unrestricted mode so that both modes
/// report syntax errors the same way.
pub fn check_syntax(source: &str) -> Result<(), SandboxFault> {
    parse(source).map(|_| ())
}

fn parse(source: &str) -> Result<ast::Suite, SandboxFault> {
    ast::Suite::parse(source, "<inline>").map_err(|err| parse_fault(source, &err))
}

// ── Edits ─────────────────────────────────────────────────────────────────────

/// Edits at the same offset apply in this order: closes, then opens, then
/// replacements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EditKind {
    Close,
    Open,
    Replace,
}

#[derive(Debug)]
struct Edit {
    at: usize,
    kind: EditKind,
    /// Opens sort outermost first, closes innermost first.
    rank: i64,
    /// Exclusive end of the replaced span (equal to `at` for insertions).
    end: usize,
    text: String,
}

struct Rewriter<'src> {
    source: &'src str,
    edits: Vec<Edit>,
    depth: i64,
    /// Quote character to use for attribute names inside f-string expressions.
    quote: char,
}

type Visit = Result<(), SandboxFault>;

impl<'src> Rewriter<'src> {
    fn new(source: &'src str) -> Self {
        Self {
            source,
            edits: Vec::new(),
            depth: 0,
            quote: '\'',
        }
    }

    fn finish(mut self) -> String {
        self.edits.sort_by_key(|edit| (edit.at, edit.kind, edit.rank));

        let mut out = String::with_capacity(self.source.len() + self.edits.len() * 16);
        let mut cursor = 0;
        for edit in &self.edits {
            if edit.at > cursor {
                out.push_str(&self.source[cursor..edit.at]);
                cursor = edit.at;
            }
            out.push_str(&edit.text);
            if edit.kind == EditKind::Replace {
                cursor = cursor.max(edit.end);
            }
        }
        out.push_str(&self.source[cursor..]);
        out
    }

    fn open(&mut self, at: usize, text: impl Into<String>) {
        self.edits.push(Edit {
            at,
            kind: EditKind::Open,
            rank: self.depth,
            end: at,
            text: text.into(),
        });
    }

    fn close(&mut self, at: usize, text: impl Into<String>) {
        self.edits.push(Edit {
            at,
            kind: EditKind::Close,
            rank: -self.depth,
            end: at,
            text: text.into(),
        });
    }

    fn replace(&mut self, start: usize, end: usize, text: impl Into<String>) {
        self.edits.push(Edit {
            at: start,
            kind: EditKind::Replace,
            rank: 0,
            end,
            text: text.into(),
        });
    }

    fn reject(&self, at: usize, detail: impl Into<String>) -> SandboxFault {
        SandboxFault::syntax(detail, Some(line_of_offset(self.source, at)))
    }

    // ── Statements ────────────────────────────────────────────────────────────

    fn visit_body(&mut self, body: &[ast::Stmt]) -> Visit {
        body.iter().try_for_each(|stmt| self.visit_stmt(stmt))
    }

    fn visit_stmt(&mut self, stmt: &ast::Stmt) -> Visit {
        let at = span(stmt).0;
        match stmt {
            ast::Stmt::FunctionDef(def) => {
                self.check_name(&def.name, at)?;
                self.visit_exprs(&def.decorator_list)?;
                self.visit_arguments(&def.args, at)?;
                if let Some(returns) = &def.returns {
                    self.visit_expr(returns)?;
                }
                self.visit_body(&def.body)
            }
            ast::Stmt::ClassDef(class) => {
                self.check_name(&class.name, at)?;
                self.visit_exprs(&class.decorator_list)?;
                self.visit_exprs(&class.bases)?;
                self.visit_keywords(&class.keywords)?;
                self.visit_body(&class.body)
            }
            ast::Stmt::Return(ret) => self.visit_opt(ret.value.as_deref()),
            ast::Stmt::Delete(delete) => self.visit_exprs(&delete.targets),
            ast::Stmt::Assign(assign) => {
                let unpacking = assign.targets.iter().any(is_sequence_target);
                if unpacking && assign.targets.len() > 1 {
                    return Err(self.reject(at, "chained assignment with unpacking is not allowed"));
                }
                if unpacking {
                    let spec = unpack_spec(&assign.targets[0]);
                    self.wrap(&assign.value, "_unpack_sequence_(", &format!(", {spec})"));
                }
                self.visit_exprs(&assign.targets)?;
                self.visit_expr(&assign.value)
            }
            ast::Stmt::AugAssign(aug) => {
                if matches!(*aug.target, ast::Expr::Attribute(_) | ast::Expr::Subscript(_)) {
                    return Err(self.reject(
                        at,
                        "augmented assignment to attributes or items is not allowed",
                    ));
                }
                self.visit_expr(&aug.target)?;
                self.visit_expr(&aug.value)
            }
            ast::Stmt::AnnAssign(ann) => {
                self.visit_expr(&ann.target)?;
                self.visit_expr(&ann.annotation)?;
                self.visit_opt(ann.value.as_deref())
            }
            ast::Stmt::For(for_) => {
                self.guard_iteration(&for_.target, &for_.iter);
                self.visit_expr(&for_.target)?;
                self.visit_expr(&for_.iter)?;
                self.visit_body(&for_.body)?;
                self.visit_body(&for_.orelse)
            }
            ast::Stmt::While(while_) => {
                self.visit_expr(&while_.test)?;
                self.visit_body(&while_.body)?;
                self.visit_body(&while_.orelse)
            }
            ast::Stmt::If(if_) => {
                self.visit_expr(&if_.test)?;
                self.visit_body(&if_.body)?;
                self.visit_body(&if_.orelse)
            }
            ast::Stmt::With(with) => {
                for item in &with.items {
                    self.visit_expr(&item.context_expr)?;
                    if let Some(vars) = &item.optional_vars {
                        if is_sequence_target(vars) {
                            return Err(self.reject(
                                span(&**vars).0,
                                "unpacking in a with-statement target is not allowed",
                            ));
                        }
                        self.visit_expr(vars)?;
                    }
                }
                self.visit_body(&with.body)
            }
            ast::Stmt::Raise(raise) => {
                self.visit_opt(raise.exc.as_deref())?;
                self.visit_opt(raise.cause.as_deref())
            }
            ast::Stmt::Try(try_) => {
                self.visit_body(&try_.body)?;
                for handler in &try_.handlers {
                    let ast::ExceptHandler::ExceptHandler(handler) = handler;
                    let handler_at = span(handler).0;
                    if let Some(name) = &handler.name {
                        self.check_name(name, handler_at)?;
                    }
                    self.visit_opt(handler.type_.as_deref())?;
                    self.visit_body(&handler.body)?;
                }
                self.visit_body(&try_.orelse)?;
                self.visit_body(&try_.finalbody)
            }
            ast::Stmt::Assert(assert) => {
                self.visit_expr(&assert.test)?;
                self.visit_opt(assert.msg.as_deref())
            }
            ast::Stmt::Import(_) | ast::Stmt::ImportFrom(_) => Err(self.reject(
                at,
                "import statements are not allowed; use the configured modules",
            )),
            ast::Stmt::Global(global) => global
                .names
                .iter()
                .try_for_each(|name| self.check_name(name, at)),
            ast::Stmt::Expr(expr) => self.visit_expr(&expr.value),
            ast::Stmt::Pass(_) | ast::Stmt::Break(_) | ast::Stmt::Continue(_) => Ok(()),
            ast::Stmt::AsyncFunctionDef(_) | ast::Stmt::AsyncFor(_) | ast::Stmt::AsyncWith(_) => {
                Err(self.reject(at, "async constructs are not allowed"))
            }
            ast::Stmt::Nonlocal(_) => Err(self.reject(at, "nonlocal statements are not allowed")),
            ast::Stmt::Match(_) => Err(self.reject(at, "match statements are not allowed")),
            #[allow(unreachable_patterns)]
            _ => Err(self.reject(at, "unsupported statement")),
        }
    }

    fn visit_arguments(&mut self, args: &ast::Arguments, at: usize) -> Visit {
        let with_defaults = args
            .posonlyargs
            .iter()
            .chain(&args.args)
            .chain(&args.kwonlyargs);
        for arg in with_defaults {
            self.visit_arg(&arg.def, at)?;
            self.visit_opt(arg.default.as_deref())?;
        }
        for arg in args.vararg.iter().chain(&args.kwarg) {
            self.visit_arg(arg, at)?;
        }
        Ok(())
    }

    fn visit_arg(&mut self, arg: &ast::Arg, at: usize) -> Visit {
        self.check_name(&arg.arg, at)?;
        self.visit_opt(arg.annotation.as_deref())
    }

    fn visit_keywords(&mut self, keywords: &[ast::Keyword]) -> Visit {
        for keyword in keywords {
            if let Some(name) = &keyword.arg {
                self.check_name(name, span(keyword).0)?;
            }
            self.visit_expr(&keyword.value)?;
        }
        Ok(())
    }

    // ── Expressions ───────────────────────────────────────────────────────────

    fn visit_exprs(&mut self, exprs: &[ast::Expr]) -> Visit {
        exprs.iter().try_for_each(|expr| self.visit_expr(expr))
    }

    fn visit_opt(&mut self, expr: Option<&ast::Expr>) -> Visit {
        expr.map_or(Ok(()), |expr| self.visit_expr(expr))
    }

    fn visit_expr(&mut self, expr: &ast::Expr) -> Visit {
        self.depth += 1;
        let result = self.visit_expr_inner(expr);
        self.depth -= 1;
        result
    }

    fn visit_expr_inner(&mut self, expr: &ast::Expr) -> Visit {
        let (start, end) = span(expr);
        match expr {
            ast::Expr::Name(name) => self.check_name(&name.id, start),
            ast::Expr::Attribute(attribute) => self.visit_attribute(attribute, start, end),
            ast::Expr::Subscript(subscript) => self.visit_subscript(subscript, start, end),
            ast::Expr::Slice(slice) => self.visit_slice(slice, start, end),
            ast::Expr::Starred(starred) => self.visit_expr(&starred.value),
            ast::Expr::List(list) => self.visit_exprs(&list.elts),
            ast::Expr::Tuple(tuple) => self.visit_exprs(&tuple.elts),
            ast::Expr::Set(set) => self.visit_exprs(&set.elts),
            ast::Expr::Dict(dict) => {
                for key in dict.keys.iter().flatten() {
                    self.visit_expr(key)?;
                }
                self.visit_exprs(&dict.values)
            }
            ast::Expr::BoolOp(op) => self.visit_exprs(&op.values),
            ast::Expr::NamedExpr(named) => {
                self.visit_expr(&named.target)?;
                self.visit_expr(&named.value)
            }
            ast::Expr::BinOp(op) => {
                self.visit_expr(&op.left)?;
                self.visit_expr(&op.right)
            }
            ast::Expr::UnaryOp(op) => self.visit_expr(&op.operand),
            ast::Expr::Lambda(lambda) => {
                self.visit_arguments(&lambda.args, start)?;
                self.visit_expr(&lambda.body)
            }
            ast::Expr::IfExp(if_exp) => {
                self.visit_expr(&if_exp.test)?;
                self.visit_expr(&if_exp.body)?;
                self.visit_expr(&if_exp.orelse)
            }
            ast::Expr::ListComp(comp) => {
                self.visit_generators(&comp.generators)?;
                self.visit_expr(&comp.elt)
            }
            ast::Expr::SetComp(comp) => {
                self.visit_generators(&comp.generators)?;
                self.visit_expr(&comp.elt)
            }
            ast::Expr::GeneratorExp(comp) => {
                self.visit_generators(&comp.generators)?;
                self.visit_expr(&comp.elt)
            }
            ast::Expr::DictComp(comp) => {
                self.visit_generators(&comp.generators)?;
                self.visit_expr(&comp.key)?;
                self.visit_expr(&comp.value)
            }
            ast::Expr::Yield(yield_) => self.visit_opt(yield_.value.as_deref()),
            ast::Expr::YieldFrom(yield_from) => self.visit_expr(&yield_from.value),
            ast::Expr::Compare(compare) => {
                self.visit_expr(&compare.left)?;
                self.visit_exprs(&compare.comparators)
            }
            ast::Expr::Call(call) => {
                self.visit_expr(&call.func)?;
                self.visit_exprs(&call.args)?;
                self.visit_keywords(&call.keywords)
            }
            ast::Expr::JoinedStr(joined) => {
                let saved = self.quote;
                self.quote = self.fstring_quote(start);
                let result = self.visit_exprs(&joined.values);
                self.quote = saved;
                result
            }
            ast::Expr::FormattedValue(formatted) => {
                self.visit_expr(&formatted.value)?;
                self.visit_opt(formatted.format_spec.as_deref())
            }
            ast::Expr::Constant(_) => Ok(()),
            ast::Expr::Await(_) => Err(self.reject(start, "await is not allowed")),
            #[allow(unreachable_patterns)]
            _ => Err(self.reject(start, "unsupported expression")),
        }
    }

    fn visit_attribute(&mut self, attribute: &ast::ExprAttribute, start: usize, end: usize) -> Visit {
        let attr = attribute.attr.as_str();
        if !self.source[start..end].trim_end().ends_with(attr) {
            return Err(self.reject(start, "unsupported attribute expression"));
        }

        match attribute.ctx {
            ast::ExprContext::Load => {
                let value_end = span(&*attribute.value).1;
                let dot = self
                    .find_delimiter(value_end, end, '.', true)
                    .ok_or_else(|| self.reject(start, "unsupported attribute expression"))?;
                let newlines = "\n".repeat(self.source[dot..end].matches('\n').count());
                let quote = self.quote;
                self.open(start, "_getattr_(");
                self.replace(dot, end, format!(", {quote}{attr}{quote}{newlines})"));
            }
            ast::ExprContext::Store | ast::ExprContext::Del => {
                if attr.starts_with('_') {
                    return Err(self.reject(
                        start,
                        format!("\"{attr}\" is an invalid attribute name because it starts with \"_\""),
                    ));
                }
                self.wrap_write(&attribute.value, start);
            }
        }
        self.visit_expr(&attribute.value)
    }

    fn visit_subscript(&mut self, subscript: &ast::ExprSubscript, start: usize, end: usize) -> Visit {
        match subscript.ctx {
            ast::ExprContext::Load => {
                let value_end = span(&*subscript.value).1;
                let (slice_start, slice_end) = span(&*subscript.slice);
                let open_bracket = self.find_delimiter(value_end, slice_start, '[', false);
                let close_bracket = self.find_delimiter(slice_end, end, ']', true);
                let (Some(open_bracket), Some(close_bracket)) = (open_bracket, close_bracket) else {
                    return Err(self.reject(start, "unsupported subscript expression"));
                };
                self.open(start, "_getitem_(");
                self.replace(open_bracket, open_bracket + 1, ", ");
                self.replace(close_bracket, close_bracket + 1, ")");
                if matches!(*subscript.slice, ast::Expr::Tuple(_)) {
                    self.open(slice_start, "(");
                    self.close(slice_end, ")");
                }
            }
            ast::ExprContext::Store | ast::ExprContext::Del => {
                self.wrap_write(&subscript.value, start);
            }
        }
        self.visit_expr(&subscript.value)?;
        self.visit_expr(&subscript.slice)
    }

    /// `lower:upper:step` becomes `slice(lower, upper, step)` with `None`
    /// standing in for missing parts.
    fn visit_slice(&mut self, slice: &ast::ExprSlice, start: usize, end: usize) -> Visit {
        let lower = slice.lower.as_deref().map(span);
        let upper = slice.upper.as_deref().map(span);
        let step = slice.step.as_deref().map(span);

        let first_gap_end = upper.or(step).map_or(end, |(s, _)| s);
        let first_colon = self
            .find_delimiter(lower.map_or(start, |(_, e)| e), first_gap_end, ':', false)
            .ok_or_else(|| self.reject(start, "unsupported slice expression"))?;
        let second_colon = self.find_delimiter(
            upper.map_or(first_colon + 1, |(_, e)| e),
            step.map_or(end, |(s, _)| s),
            ':',
            false,
        );

        let none_if = |missing: bool| if missing { "None" } else { "" };
        self.open(start, format!("slice({}", none_if(lower.is_none())));
        self.replace(first_colon, first_colon + 1, format!(", {}", none_if(upper.is_none())));
        match second_colon {
            Some(colon) => {
                self.replace(colon, colon + 1, format!(", {}", none_if(step.is_none())));
                self.close(end, ")");
            }
            None => self.close(end, ", None)"),
        }

        self.visit_opt(slice.lower.as_deref())?;
        self.visit_opt(slice.upper.as_deref())?;
        self.visit_opt(slice.step.as_deref())
    }

    fn visit_generators(&mut self, generators: &[ast::Comprehension]) -> Visit {
        for generator in generators {
            if generator.is_async {
                return Err(self.reject(span(&generator.iter).0, "async comprehensions are not allowed"));
            }
            self.guard_iteration(&generator.target, &generator.iter);
            self.visit_expr(&generator.target)?;
            self.visit_expr(&generator.iter)?;
            self.visit_exprs(&generator.ifs)?;
        }
        Ok(())
    }

    // ── Rewrite helpers ───────────────────────────────────────────────────────

    /// Routes the iterable of a `for` loop or comprehension through a guard.
    fn guard_iteration(&mut self, target: &ast::Expr, iter: &ast::Expr) {
        if is_sequence_target(target) {
            let spec = unpack_spec(target);
            self.wrap(iter, "_iter_unpack_sequence_(", &format!(", {spec})"));
        } else {
            self.wrap(iter, "_getiter_(", ")");
        }
    }

    /// Wraps `expr` as a call argument: `prefix expr suffix`. Expressions that
    /// are not valid as a bare argument get their own parentheses.
    fn wrap(&mut self, expr: &ast::Expr, prefix: &str, suffix: &str) {
        let (start, end) = span(expr);
        let bare = matches!(
            expr,
            ast::Expr::Tuple(_) | ast::Expr::Yield(_) | ast::Expr::YieldFrom(_) | ast::Expr::NamedExpr(_)
        );
        if bare {
            self.open(start, format!("{prefix}("));
            self.close(end, format!("){suffix}"));
        } else {
            self.open(start, prefix);
            self.close(end, suffix);
        }
    }

    /// `obj.attr = v` / `obj[key] = v` become `_write_(obj).attr = v` / `_write_(obj)[key] = v`.
    fn wrap_write(&mut self, value: &ast::Expr, start: usize) {
        let value_end = span(value).1;
        self.open(start, "_write_(");
        // One level deeper than the target so it closes before anything the
        // target itself closes at the same offset.
        self.depth += 1;
        self.close(value_end, ")");
        self.depth -= 1;
    }

    fn check_name(&self, name: &ast::Identifier, at: usize) -> Visit {
        let name = name.as_str();
        if name.starts_with('_') && name != "_" {
            return Err(self.reject(
                at,
                format!("\"{name}\" is an invalid variable name because it starts with \"_\""),
            ));
        }
        Ok(())
    }

    /// Position of `delimiter` between `from` and `to`, skipping comments.
    /// `last` picks the final occurrence instead of the first.
    fn find_delimiter(&self, from: usize, to: usize, delimiter: char, last: bool) -> Option<usize> {
        let gap = self.source.get(from..to)?;
        let mut found = None;
        let mut in_comment = false;
        for (offset, ch) in gap.char_indices() {
            match ch {
                '#' => in_comment = true,
                '\n' => in_comment = false,
                c if c == delimiter && !in_comment => {
                    found = Some(from + offset);
                    if !last {
                        break;
                    }
                }
                _ => {}
            }
        }
        found
    }

    /// Quote usable inside the replacement fields of the f-string at `start`:
    /// the opposite of the one delimiting it.
    fn fstring_quote(&self, start: usize) -> char {
        let delimiter = self.source[start..]
            .chars()
            .find(|c| *c == '"' || *c == '\'');
        match delimiter {
            Some('\'') => '"',
            _ => '\'',
        }
    }
}

/// Byte span of a node.
fn span<T: Ranged + ?Sized>(node: &T) -> (usize, usize) {
    (usize::from(node.start()), usize::from(node.end()))
}

fn is_sequence_target(expr: &ast::Expr) -> bool {
    matches!(expr, ast::Expr::Tuple(_) | ast::Expr::List(_))
}

/// Shape of an unpacking target as a tuple literal: `0` for a plain target,
/// `1` for a starred one, a nested tuple for a nested target.
fn unpack_spec(target: &ast::Expr) -> String {
    let elts = match target {
        ast::Expr::Tuple(tuple) => &tuple.elts,
        ast::Expr::List(list) => &list.elts,
        _ => return "0".to_string(),
    };
    if elts.is_empty() {
        return "()".to_string();
    }
    let parts: Vec<String> = elts
        .iter()
        .map(|elt| match elt {
            ast::Expr::Starred(_) => "1".to_string(),
            other if is_sequence_target(other) => unpack_spec(other),
            _ => "0".to_string(),
        })
        .collect();
    format!("({},)", parts.join(", "))
}
