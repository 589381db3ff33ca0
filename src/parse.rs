//! Recursive descent parser, producing type-elaborated ASTs.
//!
//! The parser walks the token pool with an index cursor and builds the
//! program list of top-level objects (functions and globals). Type
//! elaboration is not a separate pass: `compound_stmt` runs
//! [`add_type`] over every statement as it is parsed, and the `+`/`-`
//! productions consult operand types to normalize pointer arithmetic,
//! so code generation only ever sees fully typed expressions.

use arrayvec::ArrayString;
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::idx::mk_id;
use crate::tokenize::{TokenId, TokenKind};
use crate::types::{TY_CHAR, TY_INT, TypeId, TypeKind, add_type, expr_ty};
use crate::{CompileError, Compiler, ErrorKind, Result};

mk_id! {
  /// Handle of an AST node in [`Compiler::nodes`].
  NodeId,
  /// Handle of a symbol in [`Compiler::objs`].
  ObjId,
}

/// Binary operators that share the push/pop emission discipline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
  Add,
  Sub,
  Mul,
  Div,
  Eq,
  Ne,
  Lt,
  Le,
}

/// AST node shape. Each variant carries only its meaningful payload;
/// the representative token and the elaborated type live on [`Node`].
#[derive(Clone, Debug)]
pub enum NodeKind<'a> {
  /// Integer literal.
  Num(i64),
  /// Variable reference.
  Var(ObjId),
  /// Binary operation.
  Binop(BinOp, NodeId, NodeId),
  /// Unary minus.
  Neg(NodeId),
  /// Address-of.
  Addr(NodeId),
  /// Pointer dereference.
  Deref(NodeId),
  /// Assignment; the left side must be an lvalue.
  Assign(NodeId, NodeId),
  /// Function call.
  Funcall { name: &'a str, args: SmallVec<[NodeId; 6]> },
  /// Expression evaluated for effect, value discarded.
  ExprStmt(NodeId),
  /// `return expr;`
  Return(NodeId),
  /// `if` with optional `else`.
  If { cond: NodeId, then: NodeId, els: Option<NodeId> },
  /// `for` and `while` loops share this shape; `while` leaves `init`
  /// and `inc` empty.
  For { init: Option<NodeId>, cond: Option<NodeId>, inc: Option<NodeId>, body: NodeId },
  /// `{ ... }`
  Block(Vec<NodeId>),
}

/// One AST node.
#[derive(Clone, Debug)]
pub struct Node<'a> {
  pub kind: NodeKind<'a>,
  /// Representative token, for diagnostics.
  pub tok: TokenId,
  /// Elaborated type; always `Some` for expression nodes by the time
  /// code generation runs.
  pub ty: Option<TypeId>,
}

/// A symbol: local variable, global variable, or function.
#[derive(Clone, Debug)]
pub struct Obj<'a> {
  /// Interned name. Anonymous string-literal globals get `.L..N` names.
  pub name: &'a str,
  pub ty: TypeId,
  pub is_local: bool,
  pub is_function: bool,
  /// Stack slot relative to `%rbp`; assigned once by codegen's
  /// pre-pass, always negative for locals.
  pub offset: i64,
  /// Byte initializer for globals backing string literals.
  pub init_data: Option<&'a [u8]>,
  /// Parameter objects, in declaration order.
  pub params: SmallVec<[ObjId; 6]>,
  /// Function body.
  pub body: Option<NodeId>,
  /// Every local of the function, in declaration order.
  pub locals: Vec<ObjId>,
  /// Frame size, rounded up to a multiple of 16.
  pub stack_size: i64,
}

impl<'a> Obj<'a> {
  fn new(name: &'a str, ty: TypeId, is_local: bool) -> Self {
    Obj {
      name,
      ty,
      is_local,
      is_function: false,
      offset: 0,
      init_data: None,
      params: SmallVec::new(),
      body: None,
      locals: Vec::new(),
      stack_size: 0,
    }
  }
}

/// Parse the whole token pool into the program list of top-level
/// objects, in declaration order.
pub fn parse<'a>(cc: &mut Compiler<'a>) -> Result<Vec<ObjId>> {
  let mut p = Parser {
    cc,
    pos: TokenId(0),
    globals: Vec::new(),
    locals: Vec::new(),
    global_scope: HashMap::new(),
    local_scope: HashMap::new(),
    anon_id: 0,
  };
  while p.peek_kind() != TokenKind::Eof {
    let basety = p.declspec()?;
    if p.is_function_ahead()? {
      p.function(basety)?;
    } else {
      p.global_variable(basety)?;
    }
  }
  Ok(p.globals)
}

struct Parser<'a, 'b> {
  cc: &'b mut Compiler<'a>,
  pos: TokenId,
  globals: Vec<ObjId>,
  locals: Vec<ObjId>,
  global_scope: HashMap<&'a str, ObjId>,
  local_scope: HashMap<&'a str, ObjId>,
  anon_id: u32,
}

impl<'a> Parser<'a, '_> {
  fn peek_kind(&self) -> TokenKind { self.cc.tokens[self.pos].kind }

  fn at(&self, text: &str) -> bool { self.cc.tok_equal(self.pos, text) }

  /// Return the current token and advance, except at EOF.
  fn bump(&mut self) -> TokenId {
    let tok = self.pos;
    if self.cc.tokens[tok].kind != TokenKind::Eof {
      self.pos = TokenId(tok.0 + 1);
    }
    tok
  }

  fn consume(&mut self, text: &str) -> bool {
    if self.at(text) {
      self.bump();
      true
    } else {
      false
    }
  }

  fn skip(&mut self, text: &str) -> Result<()> {
    if self.consume(text) {
      Ok(())
    } else {
      Err(self.error(self.pos, format!("expected '{text}'")))
    }
  }

  fn error(&self, tok: TokenId, msg: impl Into<std::borrow::Cow<'static, str>>) -> CompileError {
    self.cc.err_tok(ErrorKind::Parse, tok, msg)
  }

  fn new_node(&mut self, kind: NodeKind<'a>, tok: TokenId) -> Result<NodeId> {
    self.cc.push_node(Node { kind, tok, ty: None })
  }

  /// Intern the text of an identifier token.
  fn get_ident(&mut self, tok: TokenId) -> Result<&'a str> {
    if self.cc.tokens[tok].kind != TokenKind::Ident {
      return Err(self.error(tok, "expected an identifier"))
    }
    let text = std::str::from_utf8(self.cc.tok_text(tok)).expect("identifier is ASCII");
    let arena = self.cc.arena;
    arena.alloc_str(text)
  }

  /// The next `.L..N` name for an anonymous global.
  fn unique_name(&mut self) -> Result<&'a str> {
    use std::fmt::Write;
    let mut buf = ArrayString::<16>::new();
    write!(buf, ".L..{}", self.anon_id).expect("label name fits");
    self.anon_id += 1;
    let arena = self.cc.arena;
    arena.alloc_str(&buf)
  }

  fn new_lvar(&mut self, name: &'a str, ty: TypeId) -> Result<ObjId> {
    let obj = self.cc.push_obj(Obj::new(name, ty, true))?;
    self.locals.push(obj);
    self.local_scope.insert(name, obj);
    Ok(obj)
  }

  fn new_gvar(&mut self, name: &'a str, ty: TypeId) -> Result<ObjId> {
    let obj = self.cc.push_obj(Obj::new(name, ty, false))?;
    self.globals.push(obj);
    self.global_scope.insert(name, obj);
    Ok(obj)
  }

  fn new_string_literal(&mut self, data: &'a [u8], ty: TypeId) -> Result<ObjId> {
    let name = self.unique_name()?;
    let var = self.new_gvar(name, ty)?;
    self.cc.objs[var].init_data = Some(data);
    Ok(var)
  }

  // typespec = "int" | "char"
  fn declspec(&mut self) -> Result<TypeId> {
    if self.consume("char") {
      return Ok(TY_CHAR)
    }
    self.skip("int")?;
    Ok(TY_INT)
  }

  // declarator = "*"* ("(" declarator ")" | ident) type-suffix
  fn declarator(&mut self, mut ty: TypeId) -> Result<TypeId> {
    while self.consume("*") {
      ty = self.cc.pointer_to(ty)?;
    }

    if self.at("(") {
      // Nested declarator: skim the inner declarator to find its
      // extent, parse the suffix that follows ")", then re-parse the
      // inner declarator against the suffixed type.
      let start = self.pos;
      self.bump();
      self.declarator(TY_INT)?;
      self.skip(")")?;
      let ty = self.type_suffix(ty)?;
      let end = self.pos;
      self.pos = TokenId(start.0 + 1);
      let ty = self.declarator(ty)?;
      self.pos = end;
      return Ok(ty)
    }

    if self.peek_kind() != TokenKind::Ident {
      return Err(self.error(self.pos, "expected a variable name"))
    }
    let name = self.bump();
    let ty = self.type_suffix(ty)?;
    // Attach the declared name to a fresh descriptor; the char/int
    // singletons must never be written.
    let ty = self.cc.copy_type(ty)?;
    self.cc.types[ty].name = Some(name);
    Ok(ty)
  }

  // type-suffix = "(" func-params | "[" num "]" type-suffix | ε
  fn type_suffix(&mut self, ty: TypeId) -> Result<TypeId> {
    if self.consume("(") {
      return self.func_params(ty)
    }
    if self.consume("[") {
      let len = self.get_number()?;
      self.skip("]")?;
      let ty = self.type_suffix(ty)?;
      return self.cc.array_of(ty, len)
    }
    Ok(ty)
  }

  // func-params = (param ("," param)*)? ")"
  fn func_params(&mut self, return_ty: TypeId) -> Result<TypeId> {
    let mut params: SmallVec<[TypeId; 4]> = SmallVec::new();
    while !self.at(")") {
      if !params.is_empty() {
        self.skip(",")?;
      }
      let basety = self.declspec()?;
      let ty = self.declarator(basety)?;
      params.push(self.cc.copy_type(ty)?);
    }
    self.bump();
    let func = self.cc.func_type(return_ty)?;
    self.cc.types[func].params = params;
    Ok(func)
  }

  fn get_number(&mut self) -> Result<i64> {
    if self.peek_kind() != TokenKind::Num {
      return Err(self.error(self.pos, "expected a number"))
    }
    let val = self.cc.tokens[self.pos].val;
    self.bump();
    Ok(val)
  }

  /// Decide between a function definition and a global declaration by
  /// trial-parsing the declarator after the typespec.
  fn is_function_ahead(&mut self) -> Result<bool> {
    if self.at(";") {
      return Ok(false)
    }
    let save = self.pos;
    let ty = self.declarator(TY_INT)?;
    self.pos = save;
    Ok(self.cc.types[ty].kind == TypeKind::Func)
  }

  // function-def = typespec declarator "{" compound-stmt
  fn function(&mut self, basety: TypeId) -> Result<()> {
    let ty = self.declarator(basety)?;
    let name_tok = self.cc.types[ty].name.expect("declarator without name");
    let name = self.get_ident(name_tok)?;
    let func = self.new_gvar(name, ty)?;
    self.cc.objs[func].is_function = true;

    self.locals.clear();
    self.local_scope.clear();
    let params = self.cc.types[ty].params.clone();
    for &param in &params {
      let param_tok = self.cc.types[param].name.expect("parameter without name");
      let pname = self.get_ident(param_tok)?;
      self.new_lvar(pname, param)?;
    }
    self.cc.objs[func].params = self.locals.iter().copied().collect();

    self.skip("{")?;
    let body = self.compound_stmt()?;
    self.cc.objs[func].body = Some(body);
    self.cc.objs[func].locals = std::mem::take(&mut self.locals);
    Ok(())
  }

  // global-var = typespec declarator ("," declarator)* ";"
  fn global_variable(&mut self, basety: TypeId) -> Result<()> {
    let mut first = true;
    while !self.consume(";") {
      if !first {
        self.skip(",")?;
      }
      first = false;
      let ty = self.declarator(basety)?;
      let name_tok = self.cc.types[ty].name.expect("declarator without name");
      let name = self.get_ident(name_tok)?;
      self.new_gvar(name, ty)?;
    }
    Ok(())
  }

  // compound-stmt = (declaration | stmt)* "}"
  //
  // Every statement is type-elaborated as soon as it is parsed.
  fn compound_stmt(&mut self) -> Result<NodeId> {
    let start = self.pos;
    let mut body = Vec::new();
    while !self.at("}") {
      let stmt = if self.at("int") || self.at("char") {
        self.declaration()?
      } else {
        self.stmt()?
      };
      add_type(self.cc, stmt)?;
      body.push(stmt);
    }
    self.bump();
    self.new_node(NodeKind::Block(body), start)
  }

  // declaration = typespec (declarator ("=" expr)?)_list ";"
  fn declaration(&mut self) -> Result<NodeId> {
    let start = self.pos;
    let basety = self.declspec()?;
    let mut body = Vec::new();
    let mut first = true;
    while !self.at(";") {
      if !first {
        self.skip(",")?;
      }
      first = false;
      let ty = self.declarator(basety)?;
      let name_tok = self.cc.types[ty].name.expect("declarator without name");
      let name = self.get_ident(name_tok)?;
      let var = self.new_lvar(name, ty)?;

      let eq = self.pos;
      if !self.consume("=") {
        continue
      }
      let lhs = self.new_node(NodeKind::Var(var), name_tok)?;
      let rhs = self.assign()?;
      let assign = self.new_node(NodeKind::Assign(lhs, rhs), eq)?;
      body.push(self.new_node(NodeKind::ExprStmt(assign), eq)?);
    }
    self.bump();
    self.new_node(NodeKind::Block(body), start)
  }

  // stmt = "return" expr ";"
  //      | "if" "(" expr ")" stmt ("else" stmt)?
  //      | "for" "(" expr-stmt expr? ";" expr? ")" stmt
  //      | "while" "(" expr ")" stmt
  //      | "{" compound-stmt
  //      | expr-stmt
  fn stmt(&mut self) -> Result<NodeId> {
    if self.at("return") {
      let tok = self.bump();
      let expr = self.expr()?;
      self.skip(";")?;
      return self.new_node(NodeKind::Return(expr), tok)
    }

    if self.at("if") {
      let tok = self.bump();
      self.skip("(")?;
      let cond = self.expr()?;
      self.skip(")")?;
      let then = self.stmt()?;
      let els = if self.consume("else") { Some(self.stmt()?) } else { None };
      return self.new_node(NodeKind::If { cond, then, els }, tok)
    }

    if self.at("for") {
      let tok = self.bump();
      self.skip("(")?;
      let init = self.expr_stmt()?;
      let cond = if self.at(";") { None } else { Some(self.expr()?) };
      self.skip(";")?;
      let inc = if self.at(")") { None } else { Some(self.expr()?) };
      self.skip(")")?;
      let body = self.stmt()?;
      return self.new_node(NodeKind::For { init: Some(init), cond, inc, body }, tok)
    }

    if self.at("while") {
      let tok = self.bump();
      self.skip("(")?;
      let cond = self.expr()?;
      self.skip(")")?;
      let body = self.stmt()?;
      return self.new_node(NodeKind::For { init: None, cond: Some(cond), inc: None, body }, tok)
    }

    if self.at("{") {
      self.bump();
      return self.compound_stmt()
    }

    self.expr_stmt()
  }

  // expr-stmt = expr? ";"
  fn expr_stmt(&mut self) -> Result<NodeId> {
    let tok = self.pos;
    if self.consume(";") {
      return self.new_node(NodeKind::Block(Vec::new()), tok)
    }
    let expr = self.expr()?;
    let node = self.new_node(NodeKind::ExprStmt(expr), tok)?;
    self.skip(";")?;
    Ok(node)
  }

  // expr = assign
  fn expr(&mut self) -> Result<NodeId> { self.assign() }

  // assign = equality ("=" assign)?
  fn assign(&mut self) -> Result<NodeId> {
    let node = self.equality()?;
    if self.at("=") {
      let tok = self.bump();
      let rhs = self.assign()?;
      return self.new_node(NodeKind::Assign(node, rhs), tok)
    }
    Ok(node)
  }

  // equality = relational (("==" | "!=") relational)*
  fn equality(&mut self) -> Result<NodeId> {
    let mut node = self.relational()?;
    loop {
      let start = self.pos;
      let op = if self.consume("==") {
        BinOp::Eq
      } else if self.consume("!=") {
        BinOp::Ne
      } else {
        return Ok(node)
      };
      let rhs = self.relational()?;
      node = self.new_node(NodeKind::Binop(op, node, rhs), start)?;
    }
  }

  // relational = add (("<" | "<=" | ">" | ">=") add)*
  //
  // `>` and `>=` swap their operands and reuse `<` and `<=`.
  fn relational(&mut self) -> Result<NodeId> {
    let mut node = self.add()?;
    loop {
      let start = self.pos;
      let (op, swap) = if self.consume("<") {
        (BinOp::Lt, false)
      } else if self.consume("<=") {
        (BinOp::Le, false)
      } else if self.consume(">") {
        (BinOp::Lt, true)
      } else if self.consume(">=") {
        (BinOp::Le, true)
      } else {
        return Ok(node)
      };
      let rhs = self.add()?;
      node = if swap {
        self.new_node(NodeKind::Binop(op, rhs, node), start)?
      } else {
        self.new_node(NodeKind::Binop(op, node, rhs), start)?
      };
    }
  }

  // add = mul (("+" | "-") mul)*
  fn add(&mut self) -> Result<NodeId> {
    let mut node = self.mul()?;
    loop {
      let start = self.pos;
      if self.consume("+") {
        let rhs = self.mul()?;
        node = self.new_add(node, rhs, start)?;
      } else if self.consume("-") {
        let rhs = self.mul()?;
        node = self.new_sub(node, rhs, start)?;
      } else {
        return Ok(node)
      }
    }
  }

  /// Build `lhs + rhs`, normalizing pointer arithmetic: the integer
  /// side of a pointer/integer sum is scaled by the element size, and
  /// the pointer is kept on the left.
  fn new_add(&mut self, mut lhs: NodeId, mut rhs: NodeId, tok: TokenId) -> Result<NodeId> {
    add_type(self.cc, lhs)?;
    add_type(self.cc, rhs)?;
    let lty = expr_ty(self.cc, lhs);
    let rty = expr_ty(self.cc, rhs);

    if self.cc.is_integer(lty) && self.cc.is_integer(rty) {
      return self.new_node(NodeKind::Binop(BinOp::Add, lhs, rhs), tok)
    }
    if self.cc.has_base(lty) && self.cc.has_base(rty) {
      return Err(self.cc.err_tok(ErrorKind::Type, tok, "invalid operands"))
    }
    if !self.cc.has_base(lty) {
      std::mem::swap(&mut lhs, &mut rhs);
    }

    let base = self.cc.types[expr_ty(self.cc, lhs)].base.expect("pointer without base");
    let size = self.cc.types[base].size;
    let num = self.new_node(NodeKind::Num(size), tok)?;
    let scaled = self.new_node(NodeKind::Binop(BinOp::Mul, rhs, num), tok)?;
    self.new_node(NodeKind::Binop(BinOp::Add, lhs, scaled), tok)
  }

  /// Build `lhs - rhs`. `ptr - int` scales like addition; `ptr - ptr`
  /// yields the element count between the two, which requires both
  /// sides to agree on the element size.
  fn new_sub(&mut self, lhs: NodeId, rhs: NodeId, tok: TokenId) -> Result<NodeId> {
    add_type(self.cc, lhs)?;
    add_type(self.cc, rhs)?;
    let lty = expr_ty(self.cc, lhs);
    let rty = expr_ty(self.cc, rhs);

    if self.cc.is_integer(lty) && self.cc.is_integer(rty) {
      return self.new_node(NodeKind::Binop(BinOp::Sub, lhs, rhs), tok)
    }

    if self.cc.has_base(lty) && self.cc.is_integer(rty) {
      let base = self.cc.types[lty].base.expect("pointer without base");
      let size = self.cc.types[base].size;
      let num = self.new_node(NodeKind::Num(size), tok)?;
      let scaled = self.new_node(NodeKind::Binop(BinOp::Mul, rhs, num), tok)?;
      add_type(self.cc, scaled)?;
      let node = self.new_node(NodeKind::Binop(BinOp::Sub, lhs, scaled), tok)?;
      self.cc.nodes[node].ty = Some(lty);
      return Ok(node)
    }

    if self.cc.has_base(lty) && self.cc.has_base(rty) {
      let lbase = self.cc.types[lty].base.expect("pointer without base");
      let rbase = self.cc.types[rty].base.expect("pointer without base");
      let size = self.cc.types[lbase].size;
      if size != self.cc.types[rbase].size {
        return Err(self.cc.err_tok(ErrorKind::Type, tok, "invalid operands"))
      }
      let node = self.new_node(NodeKind::Binop(BinOp::Sub, lhs, rhs), tok)?;
      self.cc.nodes[node].ty = Some(TY_INT);
      let num = self.new_node(NodeKind::Num(size), tok)?;
      return self.new_node(NodeKind::Binop(BinOp::Div, node, num), tok)
    }

    Err(self.cc.err_tok(ErrorKind::Type, tok, "invalid operands"))
  }

  // mul = unary (("*" | "/") unary)*
  fn mul(&mut self) -> Result<NodeId> {
    let mut node = self.unary()?;
    loop {
      let start = self.pos;
      let op = if self.consume("*") {
        BinOp::Mul
      } else if self.consume("/") {
        BinOp::Div
      } else {
        return Ok(node)
      };
      let rhs = self.unary()?;
      node = self.new_node(NodeKind::Binop(op, node, rhs), start)?;
    }
  }

  // unary = ("+" | "-" | "*" | "&") unary | postfix
  fn unary(&mut self) -> Result<NodeId> {
    let tok = self.pos;
    if self.consume("+") {
      return self.unary()
    }
    if self.consume("-") {
      let operand = self.unary()?;
      return self.new_node(NodeKind::Neg(operand), tok)
    }
    if self.consume("&") {
      let operand = self.unary()?;
      return self.new_node(NodeKind::Addr(operand), tok)
    }
    if self.consume("*") {
      let operand = self.unary()?;
      return self.new_node(NodeKind::Deref(operand), tok)
    }
    self.postfix()
  }

  // postfix = primary ("[" expr "]")*
  fn postfix(&mut self) -> Result<NodeId> {
    let mut node = self.primary()?;
    while self.at("[") {
      // a[b] is *(a+b)
      let start = self.bump();
      let idx = self.expr()?;
      self.skip("]")?;
      let sum = self.new_add(node, idx, start)?;
      node = self.new_node(NodeKind::Deref(sum), start)?;
    }
    Ok(node)
  }

  // primary = "(" expr ")" | "sizeof" unary | ident args? | str | num
  fn primary(&mut self) -> Result<NodeId> {
    let tok = self.pos;

    if self.at("(") {
      self.bump();
      let node = self.expr()?;
      self.skip(")")?;
      return Ok(node)
    }

    if self.at("sizeof") {
      self.bump();
      // Elaborate the operand to learn its size; it is never emitted.
      let operand = self.unary()?;
      add_type(self.cc, operand)?;
      let size = self.cc.types[expr_ty(self.cc, operand)].size;
      return self.new_node(NodeKind::Num(size), tok)
    }

    match self.peek_kind() {
      TokenKind::Ident => {
        if self.cc.tok_equal(TokenId(tok.0 + 1), "(") {
          return self.funcall()
        }
        self.bump();
        let name = std::str::from_utf8(self.cc.tok_text(tok)).expect("identifier is ASCII");
        match self.local_scope.get(name).or_else(|| self.global_scope.get(name)) {
          Some(&var) => self.new_node(NodeKind::Var(var), tok),
          None => Err(self.error(tok, "undefined variable")),
        }
      }
      TokenKind::Str => {
        self.bump();
        let t = self.cc.tokens[tok];
        let data = t.str_data.expect("string token without payload");
        let ty = t.ty.expect("string token without type");
        let var = self.new_string_literal(data, ty)?;
        self.new_node(NodeKind::Var(var), tok)
      }
      TokenKind::Num => {
        self.bump();
        let val = self.cc.tokens[tok].val;
        self.new_node(NodeKind::Num(val), tok)
      }
      _ => Err(self.error(tok, "expected an expression")),
    }
  }

  // args = "(" (assign ("," assign)*)? ")"
  fn funcall(&mut self) -> Result<NodeId> {
    let start = self.bump();
    self.bump();
    let mut args: SmallVec<[NodeId; 6]> = SmallVec::new();
    while !self.at(")") {
      if !args.is_empty() {
        self.skip(",")?;
      }
      args.push(self.assign()?);
    }
    self.skip(")")?;
    let name = self.get_ident(start)?;
    self.new_node(NodeKind::Funcall { name, args }, start)
  }
}
