//! IR builder (spec.md §4.3): walks a parser-emitted event/token stream and
//! produces an `ExecutionGraph`. The lexer/parser that produces this stream
//! is an external collaborator (spec.md §1) — this module only restructures
//! already-disambiguated events, the way the donor's bytecode compiler
//! lowers an already-parsed AST rather than re-parsing text.
//!
//! The IR builder never evaluates conditions and never resolves decorators
//! (spec.md §4.3).

use ahash::AHashMap;
use smallvec::{SmallVec, smallvec};

use crate::error::ResolveError;
use crate::expr::{BinOp, CommandExpr, DecoratorRef, Expr, ExprKind};
use crate::scope::{PLACEHOLDER_PREFIX, ScopeStack};
use crate::span::{CodeLoc, Span};
use crate::stmt::{Blocker, CommandArg, CommandOperator, ExecutionGraph, Function, Param, RedirectMode, Stmt, WhenArm, WHEN_ELSE_SENTINEL};
use crate::value::Value;
use crate::vault::ExprId;

/// Node kinds bracketed by `Event::Open`/`Event::Close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Function,
    ParamList,
    Param,
    Block,
    VarDecl,
    ShellCommand,
    Decorator,
    ArgList,
    Arg,
    InterpolatedString,
    If,
    Then,
    Else,
    For,
    When,
    Arm,
    PatternLiteral,
    PatternElse,
    PatternRegex,
    PatternRange,
    Try,
    Catch,
    Finally,
    Binary,
    FunctionCall,
}

/// Leaf token kinds. Escaping, number parsing of digit grouping, etc. are
/// the lexer's responsibility — by the time a token reaches the IR builder
/// its `text` is already the literal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    StringLiteral,
    Number,
    Operator,
    Keyword,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: Vec<u8>,
    /// Whitespace marker used by `NodeShellCommand` to decide whether to
    /// materialize a literal `" "` part (spec.md §4.3).
    pub has_space_before: bool,
}

impl Token {
    #[must_use]
    pub fn new(kind: TokenKind, text: impl Into<Vec<u8>>, has_space_before: bool) -> Self {
        Self {
            kind,
            text: text.into(),
            has_space_before,
        }
    }

    fn text_str(&self) -> String {
        String::from_utf8_lossy(&self.text).into_owned()
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Open(NodeKind),
    Close(NodeKind),
    Token(Token),
    /// A planning "step" boundary (e.g. a REPL line). Transparent to the IR
    /// builder; carried through so higher layers can correlate statements
    /// with the step that produced them.
    StepEnter,
    StepExit,
}

/// Entry point: builds a complete `ExecutionGraph` from an event stream.
pub fn build(events: &[Event]) -> Result<ExecutionGraph, ResolveError> {
    let mut builder = Builder {
        events,
        pos: 0,
        scope: ScopeStack::new(),
        functions: AHashMap::new(),
    };
    let mut top_level = Vec::new();
    builder.skip_step_markers();
    while !builder.at_end() {
        if builder.at_open(NodeKind::Function) {
            // There is no real lexer here (spec.md §1 names it an external
            // collaborator this crate doesn't implement), so `Function.span`
            // can't carry a textual position. Instead its `start.line`
            // encodes how many top-level statements had already been
            // collected when the definition was encountered — an ordinal
            // the resolver's prelude pass (spec.md §4.5) uses directly as a
            // slice boundary into `top_level_statements`.
            let function = builder.parse_function(top_level.len())?;
            // Last-definition-wins (spec.md §9).
            builder.functions.insert(function.name.clone(), function);
        } else {
            top_level.push(builder.parse_stmt()?);
        }
        builder.skip_step_markers();
    }

    expand_calls_in_place(&mut top_level, &builder.functions);

    Ok(ExecutionGraph {
        top_level_statements: top_level,
        functions: builder.functions,
        scopes: builder.scope,
    })
}

/// Replaces top-level `Stmt::FunctionCall` nodes with `Stmt::CallTrace`
/// wrapping a clone of the callee's body (spec.md §3: "expanded into a
/// `CallTrace` during IR building").
///
/// Expansion is one level deep only: a call found inside an already-inlined
/// body is left as `FunctionCall` rather than expanded, which sidesteps
/// infinite recursion for self- or mutually-recursive functions. Spec.md
/// does not specify recursive-call semantics for this expansion, so this is
/// a deliberate scope limit, not an oversight.
fn expand_calls_in_place(stmts: &mut Vec<Stmt>, functions: &AHashMap<String, Function>) {
    for stmt in stmts.iter_mut() {
        if let Stmt::FunctionCall { name, .. } = stmt {
            let label = name.clone();
            let block = functions.get(name).map(|f| f.body.clone()).unwrap_or_default();
            *stmt = Stmt::CallTrace { label, block };
        }
    }
}

struct Builder<'a> {
    events: &'a [Event],
    pos: usize,
    scope: ScopeStack,
    functions: AHashMap<String, Function>,
}

impl<'a> Builder<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.events.len()
    }

    fn peek(&self) -> Option<&Event> {
        self.events.get(self.pos)
    }

    fn skip_step_markers(&mut self) {
        while matches!(self.peek(), Some(Event::StepEnter) | Some(Event::StepExit)) {
            self.pos += 1;
        }
    }

    fn at_open(&self, kind: NodeKind) -> bool {
        matches!(self.peek(), Some(Event::Open(k)) if *k == kind)
    }

    fn expect_open(&mut self, kind: NodeKind) -> Result<(), ResolveError> {
        self.skip_step_markers();
        match self.peek() {
            Some(Event::Open(k)) if *k == kind => {
                self.pos += 1;
                Ok(())
            }
            other => Err(ResolveError::ParseIncomplete {
                context: format!("expected Open({kind:?}), found {other:?}"),
            }),
        }
    }

    fn expect_close(&mut self, kind: NodeKind) -> Result<(), ResolveError> {
        self.skip_step_markers();
        match self.peek() {
            Some(Event::Close(k)) if *k == kind => {
                self.pos += 1;
                Ok(())
            }
            other => Err(ResolveError::ParseIncomplete {
                context: format!("expected Close({kind:?}), found {other:?}"),
            }),
        }
    }

    fn expect_token(&mut self) -> Result<Token, ResolveError> {
        self.skip_step_markers();
        match self.events.get(self.pos) {
            Some(Event::Token(token)) => {
                let token = token.clone();
                self.pos += 1;
                Ok(token)
            }
            other => Err(ResolveError::ParseIncomplete {
                context: format!("expected a token, found {other:?}"),
            }),
        }
    }

    fn placeholder_id(&self, name: &str) -> ExprId {
        ExprId::from_raw(&format!("{PLACEHOLDER_PREFIX}{name}"))
    }

    // -- statements ---------------------------------------------------

    fn parse_stmt(&mut self) -> Result<Stmt, ResolveError> {
        self.skip_step_markers();
        if self.at_open(NodeKind::VarDecl) {
            self.parse_var_decl()
        } else if self.at_open(NodeKind::ShellCommand) {
            self.parse_shell_command()
        } else if self.at_open(NodeKind::Decorator) {
            self.parse_decorator_stmt()
        } else if self.at_open(NodeKind::If) {
            Ok(Stmt::Blocker(self.parse_if()?))
        } else if self.at_open(NodeKind::For) {
            Ok(Stmt::Blocker(self.parse_for()?))
        } else if self.at_open(NodeKind::When) {
            Ok(Stmt::Blocker(self.parse_when()?))
        } else if self.at_open(NodeKind::Try) {
            self.parse_try()
        } else if self.at_open(NodeKind::FunctionCall) {
            self.parse_function_call()
        } else {
            Err(ResolveError::ParseIncomplete {
                context: format!("unexpected event at statement position: {:?}", self.peek()),
            })
        }
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, ResolveError> {
        self.expect_open(NodeKind::Block)?;
        let mut stmts = Vec::new();
        self.skip_step_markers();
        while !self.at_end() && !matches!(self.peek(), Some(Event::Close(NodeKind::Block))) {
            stmts.push(self.parse_stmt()?);
            self.skip_step_markers();
        }
        self.expect_close(NodeKind::Block)?;
        Ok(stmts)
    }

    fn parse_var_decl(&mut self) -> Result<Stmt, ResolveError> {
        self.expect_open(NodeKind::VarDecl)?;
        let name = self.expect_token()?.text_str();
        let value = self.parse_expr()?;
        self.expect_close(NodeKind::VarDecl)?;
        let expr_id = self.placeholder_id(&name);
        self.scope.define(name.clone(), expr_id.clone());
        Ok(Stmt::VarDecl { name, value, expr_id })
    }

    fn parse_shell_command(&mut self) -> Result<Stmt, ResolveError> {
        self.expect_open(NodeKind::ShellCommand)?;
        let mut parts: SmallVec<[Expr; 4]> = smallvec![];
        while !matches!(self.peek(), Some(Event::Close(NodeKind::ShellCommand))) {
            if self.at_open(NodeKind::InterpolatedString) {
                if !parts.is_empty() {
                    parts.push(space_literal());
                }
                parts.extend(self.parse_interpolated_string_parts()?);
            } else if self.at_open(NodeKind::Decorator) {
                // The lexer vocabulary only carries a has-space-before flag
                // on leaf tokens (spec.md §4.3); a decorator used as a shell
                // word is always preceded by whitespace in practice (bare
                // concatenation like `@env.HOME@env.USER` isn't a shape the
                // grammar produces), so it always gets a separating space.
                if !parts.is_empty() {
                    parts.push(space_literal());
                }
                parts.push(self.parse_decorator_expr()?);
            } else {
                let token = self.expect_token()?;
                if token.has_space_before && !parts.is_empty() {
                    parts.push(space_literal());
                }
                parts.push(Expr {
                    span: Span::synthetic(),
                    kind: ExprKind::Literal(Value::Str(token.text_str())),
                });
            }
        }
        self.expect_close(NodeKind::ShellCommand)?;
        Ok(Stmt::Command {
            decorator: "@shell".to_owned(),
            command: Some(CommandExpr { parts }),
            args: Vec::new(),
            block: Vec::new(),
            operator: CommandOperator::None,
            redirect_mode: RedirectMode::None,
            redirect_target: None,
        })
    }

    fn parse_interpolated_string_parts(&mut self) -> Result<SmallVec<[Expr; 4]>, ResolveError> {
        self.expect_open(NodeKind::InterpolatedString)?;
        let mut parts: SmallVec<[Expr; 4]> = smallvec![];
        // Opening quote.
        let quote = self.expect_token()?;
        parts.push(lit_str_expr(&quote.text_str()));
        while !matches!(self.peek(), Some(Event::Close(NodeKind::InterpolatedString))) {
            if self.at_open(NodeKind::Decorator) {
                parts.push(self.parse_decorator_expr()?);
            } else {
                let token = self.expect_token()?;
                parts.push(lit_str_expr(&token.text_str()));
            }
        }
        self.expect_close(NodeKind::InterpolatedString)?;
        Ok(parts)
    }

    fn parse_decorator_stmt(&mut self) -> Result<Stmt, ResolveError> {
        let (name, selector, args, arg_names, block) = self.parse_decorator_inner()?;
        let decorator = render_decorator_name(&name, &selector);
        let args = args
            .into_iter()
            .zip(arg_names)
            .map(|(value, name)| CommandArg { name, value })
            .collect();
        Ok(Stmt::Command {
            decorator,
            command: None,
            args,
            block: block.unwrap_or_default(),
            operator: CommandOperator::None,
            redirect_mode: RedirectMode::None,
            redirect_target: None,
        })
    }

    fn parse_decorator_expr(&mut self) -> Result<Expr, ResolveError> {
        let (name, selector, args, arg_names, _block) = self.parse_decorator_inner()?;
        // `@var.X` collapses to `VarRef(X)` (spec.md §4.3).
        if name == "var" && selector.len() == 1 && args.is_empty() {
            return Ok(Expr {
                span: Span::synthetic(),
                kind: ExprKind::VarRef(selector[0].clone()),
            });
        }
        Ok(Expr {
            span: Span::synthetic(),
            kind: ExprKind::DecoratorRef(DecoratorRef {
                name,
                selector: selector.into_iter().collect(),
                args,
                arg_names: arg_names.into_iter().collect(),
            }),
        })
    }

    #[allow(clippy::type_complexity)]
    fn parse_decorator_inner(&mut self) -> Result<(String, Vec<String>, Vec<Expr>, Vec<String>, Option<Vec<Stmt>>), ResolveError> {
        self.expect_open(NodeKind::Decorator)?;
        let name = self.expect_token()?.text_str();
        let mut selector = Vec::new();
        while matches!(self.peek(), Some(Event::Token(t)) if t.kind == TokenKind::Ident) {
            selector.push(self.expect_token()?.text_str());
        }
        let mut args = Vec::new();
        let mut arg_names = Vec::new();
        if self.at_open(NodeKind::ArgList) {
            (args, arg_names) = self.parse_arg_list()?;
        }
        let block = if self.at_open(NodeKind::Block) {
            Some(self.parse_block()?)
        } else {
            None
        };
        self.expect_close(NodeKind::Decorator)?;
        Ok((name, selector, args, arg_names, block))
    }

    fn parse_arg_list(&mut self) -> Result<(Vec<Expr>, Vec<String>), ResolveError> {
        self.expect_open(NodeKind::ArgList)?;
        let mut args = Vec::new();
        let mut names = Vec::new();
        while self.at_open(NodeKind::Arg) {
            self.expect_open(NodeKind::Arg)?;
            let name = if matches!(self.peek(), Some(Event::Token(t)) if t.kind == TokenKind::Ident) {
                self.expect_token()?.text_str()
            } else {
                String::new()
            };
            let value = self.parse_expr()?;
            self.expect_close(NodeKind::Arg)?;
            names.push(name);
            args.push(value);
        }
        self.expect_close(NodeKind::ArgList)?;
        Ok((args, names))
    }

    fn parse_if(&mut self) -> Result<Blocker, ResolveError> {
        self.expect_open(NodeKind::If)?;
        let condition = self.parse_expr()?;
        self.expect_open(NodeKind::Then)?;
        let then_branch = self.parse_block()?;
        self.expect_close(NodeKind::Then)?;
        let else_branch = if self.at_open(NodeKind::Else) {
            self.expect_open(NodeKind::Else)?;
            let body = if self.at_open(NodeKind::If) {
                vec![Stmt::Blocker(self.parse_if()?)]
            } else {
                self.parse_block()?
            };
            self.expect_close(NodeKind::Else)?;
            Some(body)
        } else {
            None
        };
        self.expect_close(NodeKind::If)?;
        Ok(Blocker::If {
            condition,
            then_branch,
            else_branch,
            taken: None,
        })
    }

    fn parse_for(&mut self) -> Result<Blocker, ResolveError> {
        self.expect_open(NodeKind::For)?;
        let loop_var = self.expect_token()?.text_str();
        let collection = self.parse_expr()?;
        let then_branch = self.parse_block()?;
        self.expect_close(NodeKind::For)?;
        Ok(Blocker::For {
            loop_var,
            collection,
            then_branch,
            iterations: Vec::new(),
        })
    }

    fn parse_when(&mut self) -> Result<Blocker, ResolveError> {
        self.expect_open(NodeKind::When)?;
        let condition = self.parse_expr()?;
        let mut arms = Vec::new();
        while self.at_open(NodeKind::Arm) {
            self.expect_open(NodeKind::Arm)?;
            let pattern = self.parse_when_pattern()?;
            let body = self.parse_block()?;
            self.expect_close(NodeKind::Arm)?;
            arms.push(WhenArm { pattern, body });
        }
        self.expect_close(NodeKind::When)?;
        Ok(Blocker::When {
            condition,
            arms,
            matched_arm: None,
        })
    }

    fn parse_when_pattern(&mut self) -> Result<Expr, ResolveError> {
        if self.at_open(NodeKind::PatternLiteral) {
            self.expect_open(NodeKind::PatternLiteral)?;
            let expr = self.parse_expr()?;
            self.expect_close(NodeKind::PatternLiteral)?;
            Ok(expr)
        } else if self.at_open(NodeKind::PatternElse) {
            self.expect_open(NodeKind::PatternElse)?;
            self.expect_close(NodeKind::PatternElse)?;
            Ok(lit_str_expr(WHEN_ELSE_SENTINEL))
        } else if self.at_open(NodeKind::PatternRegex) {
            self.expect_open(NodeKind::PatternRegex)?;
            let token = self.expect_token()?;
            self.expect_close(NodeKind::PatternRegex)?;
            // Regex patterns are parsed but (per a known limitation of the
            // system this was distilled from) only ever compared by
            // equality against the rendered pattern text, never compiled.
            Ok(lit_str_expr(&token.text_str()))
        } else if self.at_open(NodeKind::PatternRange) {
            self.expect_open(NodeKind::PatternRange)?;
            let lo = self.parse_expr()?;
            let hi = self.parse_expr()?;
            self.expect_close(NodeKind::PatternRange)?;
            Ok(Expr {
                span: Span::synthetic(),
                kind: ExprKind::BinaryOp {
                    op: BinOp::Range,
                    left: Box::new(lo),
                    right: Box::new(hi),
                },
            })
        } else {
            Err(ResolveError::ParseIncomplete {
                context: format!("expected a When pattern, found {:?}", self.peek()),
            })
        }
    }

    fn parse_try(&mut self) -> Result<Stmt, ResolveError> {
        self.expect_open(NodeKind::Try)?;
        let try_block = self.parse_block()?;
        let (catch_block, error_var) = if self.at_open(NodeKind::Catch) {
            self.expect_open(NodeKind::Catch)?;
            let error_var = if matches!(self.peek(), Some(Event::Token(t)) if t.kind == TokenKind::Ident) {
                Some(self.expect_token()?.text_str())
            } else {
                None
            };
            let block = self.parse_block()?;
            self.expect_close(NodeKind::Catch)?;
            (block, error_var)
        } else {
            (Vec::new(), None)
        };
        let finally_block = if self.at_open(NodeKind::Finally) {
            self.expect_open(NodeKind::Finally)?;
            let block = self.parse_block()?;
            self.expect_close(NodeKind::Finally)?;
            block
        } else {
            Vec::new()
        };
        self.expect_close(NodeKind::Try)?;
        Ok(Stmt::Try {
            try_block,
            catch_block,
            finally_block,
            error_var,
        })
    }

    fn parse_function_call(&mut self) -> Result<Stmt, ResolveError> {
        self.expect_open(NodeKind::FunctionCall)?;
        let name = self.expect_token()?.text_str();
        let args = if self.at_open(NodeKind::ArgList) {
            self.parse_arg_list()?.0
        } else {
            Vec::new()
        };
        self.expect_close(NodeKind::FunctionCall)?;
        Ok(Stmt::FunctionCall { name, args })
    }

    fn parse_function(&mut self, ordinal: usize) -> Result<Function, ResolveError> {
        self.expect_open(NodeKind::Function)?;
        let name = self.expect_token()?.text_str();
        let params = self.parse_param_list()?;
        // Snapshot captures the scope visible at the definition site, before
        // anything from the function's own body is bound into it.
        let scopes = self.scope.snapshot();
        self.scope.push();
        let body = self.parse_block()?;
        self.scope.pop();
        self.expect_close(NodeKind::Function)?;
        let loc = CodeLoc::new(ordinal as u32, 0);
        Ok(Function {
            name,
            params,
            body,
            span: Span::new(loc, loc),
            scopes,
        })
    }

    fn parse_param_list(&mut self) -> Result<Vec<Param>, ResolveError> {
        self.expect_open(NodeKind::ParamList)?;
        let mut params = Vec::new();
        while self.at_open(NodeKind::Param) {
            self.expect_open(NodeKind::Param)?;
            let name = self.expect_token()?.text_str();
            let type_hint = if matches!(self.peek(), Some(Event::Token(t)) if t.kind == TokenKind::Ident) {
                Some(self.expect_token()?.text_str())
            } else {
                None
            };
            let default = if !matches!(self.peek(), Some(Event::Close(NodeKind::Param))) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.expect_close(NodeKind::Param)?;
            params.push(Param { name, type_hint, default });
        }
        self.expect_close(NodeKind::ParamList)?;
        Ok(params)
    }

    // -- expressions ----------------------------------------------------

    fn parse_expr(&mut self) -> Result<Expr, ResolveError> {
        self.skip_step_markers();
        if self.at_open(NodeKind::Decorator) {
            return self.parse_decorator_expr();
        }
        if self.at_open(NodeKind::Binary) {
            self.expect_open(NodeKind::Binary)?;
            let op_token = self.expect_token()?;
            let op = parse_binop(&op_token.text_str())?;
            let left = Box::new(self.parse_expr()?);
            let right = Box::new(self.parse_expr()?);
            self.expect_close(NodeKind::Binary)?;
            return Ok(Expr {
                span: Span::synthetic(),
                kind: ExprKind::BinaryOp { op, left, right },
            });
        }
        let token = self.expect_token()?;
        let kind = match token.kind {
            TokenKind::Number => {
                let text = token.text_str();
                if text.contains('.') {
                    ExprKind::Literal(Value::Float(text.parse().map_err(|_| ResolveError::ParseIncomplete {
                        context: format!("invalid float literal '{text}'"),
                    })?))
                } else {
                    ExprKind::Literal(Value::Int(text.parse().map_err(|_| ResolveError::ParseIncomplete {
                        context: format!("invalid int literal '{text}'"),
                    })?))
                }
            }
            TokenKind::StringLiteral => ExprKind::Literal(Value::Str(token.text_str())),
            TokenKind::Keyword => match token.text_str().as_str() {
                "true" => ExprKind::Literal(Value::Bool(true)),
                "false" => ExprKind::Literal(Value::Bool(false)),
                "nil" => ExprKind::Literal(Value::Nil),
                other => {
                    return Err(ResolveError::UnknownExpressionKind { kind: other.to_owned() });
                }
            },
            TokenKind::Ident => ExprKind::VarRef(token.text_str()),
            TokenKind::Operator => {
                return Err(ResolveError::UnknownExpressionKind {
                    kind: token.text_str(),
                });
            }
        };
        Ok(Expr {
            span: Span::synthetic(),
            kind,
        })
    }
}

fn parse_binop(token: &str) -> Result<BinOp, ResolveError> {
    match token {
        "==" => Ok(BinOp::Eq),
        "!=" => Ok(BinOp::Ne),
        "<" => Ok(BinOp::Lt),
        "<=" => Ok(BinOp::Le),
        ">" => Ok(BinOp::Gt),
        ">=" => Ok(BinOp::Ge),
        "&&" => Ok(BinOp::And),
        "||" => Ok(BinOp::Or),
        "…" | ".." => Ok(BinOp::Range),
        other => Err(ResolveError::UnknownOperator {
            op: other.to_owned(),
            span: Span::synthetic(),
        }),
    }
}

fn space_literal() -> Expr {
    lit_str_expr(" ")
}

fn lit_str_expr(text: &str) -> Expr {
    Expr {
        span: Span::synthetic(),
        kind: ExprKind::Literal(Value::Str(text.to_owned())),
    }
}

fn render_decorator_name(name: &str, selector: &[String]) -> String {
    let mut rendered = format!("@{name}");
    for segment in selector {
        rendered.push('.');
        rendered.push_str(segment);
    }
    rendered
}
